//! Core metric types for the provider

use crate::error::{MonError, Result};
use serde::{Deserialize, Serialize};

/// Longest namespace accepted, in bytes
pub const MAX_NAMESPACE_LEN: usize = 128;
/// Longest metric name accepted, in bytes
pub const MAX_NAME_LEN: usize = 128;
/// Longest description accepted, in bytes
pub const MAX_DESCRIPTION_LEN: usize = 200;
/// Longest single tag accepted, in bytes
pub const MAX_TAG_LEN: usize = 36;
/// Samples per metric unless the provider configures otherwise
pub const DEFAULT_BUFFER_CAPACITY: usize = 160_000;

/// Type of metric being tracked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetricType {
    /// Monotonically non-decreasing value
    /// Use for: request counts, bytes sent
    Counter,

    /// Non-negative durations
    /// Use for: latencies, phase times
    Timer,

    /// Unconstrained point-in-time value
    /// Use for: queue depth, memory usage
    Gauge,
}

impl MetricType {
    /// Get the single-character type code
    pub fn type_code(&self) -> char {
        match self {
            MetricType::Counter => 'c',
            MetricType::Timer => 't',
            MetricType::Gauge => 'g',
        }
    }

    /// Parse type code back to MetricType
    pub fn from_type_code(code: char) -> Option<MetricType> {
        match code {
            'c' => Some(MetricType::Counter),
            't' => Some(MetricType::Timer),
            'g' => Some(MetricType::Gauge),
            _ => None,
        }
    }

    /// Counters and timers only ever grow in practice, so their extrema
    /// sit at the ends of the window.
    pub fn is_monotonic(&self) -> bool {
        matches!(self, MetricType::Counter | MetricType::Timer)
    }
}

/// Per-metric aggregation applied before pushing to a sink
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ReductionOp {
    #[default]
    Null,
    Sum,
    Avg,
    Min,
    Max,
    Store,
    Anomaly,
}

impl ReductionOp {
    pub const ALL: [ReductionOp; 7] = [
        ReductionOp::Null,
        ReductionOp::Sum,
        ReductionOp::Avg,
        ReductionOp::Min,
        ReductionOp::Max,
        ReductionOp::Store,
        ReductionOp::Anomaly,
    ];

    /// Suffix used in aggregation keys and on the reducer wire
    pub fn op_name(&self) -> &'static str {
        match self {
            ReductionOp::Null => "NULL",
            ReductionOp::Sum => "SUM",
            ReductionOp::Avg => "AVG",
            ReductionOp::Min => "MIN",
            ReductionOp::Max => "MAX",
            ReductionOp::Store => "STORE",
            ReductionOp::Anomaly => "ANOMALY",
        }
    }

    pub fn from_name(name: &str) -> Option<ReductionOp> {
        Self::ALL
            .iter()
            .copied()
            .find(|op| op.op_name().eq_ignore_ascii_case(name))
    }
}

/// Ordered, fixed set of tags attached to a metric
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TagList {
    tags: Vec<String>,
}

impl TagList {
    /// Build a tag list, rejecting empty or oversized tags
    pub fn new<I, S>(tags: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let tags: Vec<String> = tags.into_iter().map(Into::into).collect();
        for tag in &tags {
            if tag.is_empty() {
                return Err(MonError::InvalidArgs("empty tag".to_string()));
            }
            if tag.len() > MAX_TAG_LEN {
                return Err(MonError::InvalidArgs(format!(
                    "tag '{}' exceeds {} bytes",
                    tag, MAX_TAG_LEN
                )));
            }
        }
        Ok(TagList { tags })
    }

    pub fn empty() -> Self {
        TagList { tags: Vec::new() }
    }

    pub fn from_slice(tags: &[&str]) -> Result<Self> {
        Self::new(tags.iter().copied())
    }

    pub fn as_slice(&self) -> &[String] {
        &self.tags
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.tags.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.tags.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tags.is_empty()
    }
}

/// A single recorded observation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    /// Wall-clock seconds since the Unix epoch
    pub time: f64,
    pub value: f64,
    /// Identifies the thread that recorded the sample
    pub writer: u64,
}

impl Sample {
    /// Bytes per sample on the bulk wire
    pub const WIRE_SIZE: usize = 24;

    pub fn new(time: f64, value: f64, writer: u64) -> Self {
        Sample { time, value, writer }
    }
}

pub(crate) fn validate_names(namespace: &str, name: &str, description: &str) -> Result<()> {
    if namespace.is_empty() || name.is_empty() {
        return Err(MonError::InvalidName(
            "namespace and name must be non-empty".to_string(),
        ));
    }
    if namespace.len() > MAX_NAMESPACE_LEN {
        return Err(MonError::InvalidName(format!(
            "namespace exceeds {} bytes",
            MAX_NAMESPACE_LEN
        )));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(MonError::InvalidName(format!(
            "name exceeds {} bytes",
            MAX_NAME_LEN
        )));
    }
    if description.len() > MAX_DESCRIPTION_LEN {
        return Err(MonError::InvalidArgs(format!(
            "description exceeds {} bytes",
            MAX_DESCRIPTION_LEN
        )));
    }
    Ok(())
}
