//! Reduction algorithms over a sample window
//!
//! All functions are pure; the engine runs them against a buffer window and
//! ships the result to a sink.

use crate::error::{MonError, Result};
use crate::metrics::{MetricType, ReductionOp, Sample};
use serde::{Deserialize, Serialize};

/// Samples further than this many standard deviations from the mean of
/// the rest of the window are anomalies
pub const ANOMALY_SIGMAS: f64 = 3.0;

/// What gets stored under a reduction key
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ReducedValue {
    Scalar(f64),
    Samples(Vec<Sample>),
    Outliers(Vec<f64>),
}

impl ReducedValue {
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|e| MonError::Other(format!("encode reduced value: {}", e)))
    }

    pub fn decode(bytes: &[u8]) -> Result<ReducedValue> {
        bincode::deserialize(bytes)
            .map_err(|e| MonError::Other(format!("decode reduced value: {}", e)))
    }

    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            ReducedValue::Scalar(v) => Some(*v),
            _ => None,
        }
    }
}

pub fn sum(window: &[Sample]) -> f64 {
    window.iter().map(|s| s.value).sum()
}

pub fn avg(window: &[Sample]) -> Option<f64> {
    if window.is_empty() {
        None
    } else {
        Some(sum(window) / window.len() as f64)
    }
}

/// Counters and timers take the first sample; gauges scan
pub fn min(window: &[Sample], metric_type: MetricType) -> Option<f64> {
    if metric_type.is_monotonic() {
        return window.first().map(|s| s.value);
    }
    window.iter().map(|s| s.value).reduce(f64::min)
}

/// Counters and timers take the last sample; gauges scan
pub fn max(window: &[Sample], metric_type: MetricType) -> Option<f64> {
    if metric_type.is_monotonic() {
        return window.last().map(|s| s.value);
    }
    window.iter().map(|s| s.value).reduce(f64::max)
}

/// Values lying more than `ANOMALY_SIGMAS` standard deviations from the
/// mean of the other samples in the window, in window order.
///
/// Pass one computes the mean, pass two the sum of squared deviations.
/// Pass three judges each sample against those statistics with the sample
/// itself downdated out, so a lone spike cannot mask itself by inflating σ.
/// Windows of fewer than three samples have no anomalies.
pub fn anomalies(window: &[Sample]) -> Vec<f64> {
    let n = window.len();
    if n < 3 {
        return Vec::new();
    }
    let nf = n as f64;
    let rest = nf - 1.0;

    let mean = sum(window) / nf;
    let m2: f64 = window.iter().map(|s| (s.value - mean).powi(2)).sum();

    window
        .iter()
        .map(|s| s.value)
        .filter(|&v| {
            let dev = v - mean;
            let mean_rest = (nf * mean - v) / rest;
            let m2_rest = (m2 - dev * dev * nf / rest).max(0.0);
            let sigma_rest = (m2_rest / rest).sqrt();
            (v - mean_rest).abs() > ANOMALY_SIGMAS * sigma_rest
        })
        .collect()
}

/// Apply `op` to a window. `None` when there is nothing to store: the
/// operator is `Null` or the window is empty.
pub fn reduce_window(op: ReductionOp, metric_type: MetricType, window: &[Sample]) -> Option<ReducedValue> {
    if window.is_empty() {
        return None;
    }
    match op {
        ReductionOp::Null => None,
        ReductionOp::Sum => Some(ReducedValue::Scalar(sum(window))),
        ReductionOp::Avg => avg(window).map(ReducedValue::Scalar),
        ReductionOp::Min => min(window, metric_type).map(ReducedValue::Scalar),
        ReductionOp::Max => max(window, metric_type).map(ReducedValue::Scalar),
        ReductionOp::Store => Some(ReducedValue::Samples(window.to_vec())),
        ReductionOp::Anomaly => Some(ReducedValue::Outliers(anomalies(window))),
    }
}
