//! Per-metric sample buffer
//!
//! Fixed capacity, append-only, guarded by one mutex per metric. The lock is
//! held only for validate + write + cursor bump; no I/O happens under it.
//! Once the buffer is full further appends fail with `BufferFull` and leave
//! the buffer untouched.
//!
//! Readers (fetch handlers, reductions) copy out of the buffer under the same
//! lock and then release it. A reduction therefore sees the window as of the
//! moment it took the lock; samples appended afterwards are picked up by the
//! next cycle.

use super::types::{MetricType, Sample};
use crate::error::{MonError, Result};
use bytes::{BufMut, BytesMut};
use parking_lot::Mutex;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static NEXT_WRITER_TAG: AtomicU64 = AtomicU64::new(1);

/// Set on tags derived from a tokio task id, never on thread tags
const TASK_TAG_BIT: u64 = 1 << 63;

thread_local! {
    static WRITER_TAG: u64 = NEXT_WRITER_TAG.fetch_add(1, Ordering::Relaxed);
}

/// Tag of the calling writer.
///
/// Inside a tokio task this is derived from the task id, so tasks sharing a
/// worker thread are told apart. Elsewhere it is a per-thread tag, stable for
/// the thread's lifetime.
pub fn current_writer_tag() -> u64 {
    match tokio::task::try_id() {
        Some(id) => {
            let hasher = ahash::RandomState::with_seeds(0x7461, 0x676d, 0x6f6e, 0x7772);
            hasher.hash_one(id) | TASK_TAG_BIT
        }
        None => WRITER_TAG.with(|tag| *tag),
    }
}

/// Wall-clock seconds since the Unix epoch
pub fn wall_clock_secs() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Bucketed distribution of a window
#[derive(Debug, Clone, PartialEq)]
pub struct Histogram {
    pub min: f64,
    pub max: f64,
    pub counts: Vec<u64>,
}

impl Histogram {
    /// Two passes: min/max, then bucket assignment. A flat window
    /// (`max == min`) lands entirely in bucket 0.
    pub fn from_samples(samples: &[Sample], bucket_count: usize) -> Result<Histogram> {
        if bucket_count == 0 {
            return Err(MonError::InvalidArgs("bucket_count must be > 0".to_string()));
        }
        let mut counts = vec![0u64; bucket_count];
        if samples.is_empty() {
            return Ok(Histogram { min: 0.0, max: 0.0, counts });
        }

        let (min, max) = samples.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), s| {
            (lo.min(s.value), hi.max(s.value))
        });
        let span = max - min;

        for s in samples {
            let idx = if span == 0.0 {
                0
            } else {
                let raw = ((s.value - min) / span * bucket_count as f64).floor() as usize;
                raw.min(bucket_count - 1)
            };
            counts[idx] += 1;
        }

        Ok(Histogram { min, max, counts })
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().sum()
    }
}

/// Fixed-capacity sample storage for one metric
#[derive(Debug)]
pub struct SampleBuffer {
    metric_type: MetricType,
    capacity: usize,
    samples: Mutex<Vec<Sample>>,
}

impl SampleBuffer {
    /// Allocate the full window up front so appends never reallocate
    pub fn with_capacity(metric_type: MetricType, capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(MonError::InvalidArgs("buffer capacity must be > 0".to_string()));
        }
        let mut samples = Vec::new();
        samples.try_reserve_exact(capacity).map_err(|e| {
            MonError::Allocation(format!("{} samples: {}", capacity, e))
        })?;
        Ok(SampleBuffer {
            metric_type,
            capacity,
            samples: Mutex::new(samples),
        })
    }

    /// Verify all invariants hold for this buffer
    #[cfg(debug_assertions)]
    pub fn verify_invariants(&self) {
        let samples = self.samples.lock();
        debug_assert!(
            samples.len() <= self.capacity,
            "Invariant violated: {} samples in a buffer of capacity {}",
            samples.len(),
            self.capacity
        );
        if self.metric_type == MetricType::Counter {
            debug_assert!(
                samples.windows(2).all(|w| w[0].value <= w[1].value),
                "Invariant violated: counter window is not non-decreasing"
            );
        }
    }

    #[cfg(not(debug_assertions))]
    #[inline(always)]
    pub fn verify_invariants(&self) {}

    pub fn metric_type(&self) -> MetricType {
        self.metric_type
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Write cursor: number of recorded samples
    pub fn len(&self) -> usize {
        self.samples.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn last_value(&self) -> Option<f64> {
        self.samples.lock().last().map(|s| s.value)
    }

    /// Record `value` now, enforcing the type's monotonicity rule
    pub fn append(&self, value: f64) -> Result<()> {
        self.append_with(value, wall_clock_secs(), current_writer_tag())
    }

    /// Record a sample with an explicit timestamp and writer tag
    pub fn append_with(&self, value: f64, time: f64, writer: u64) -> Result<()> {
        if value.is_nan() {
            return Err(MonError::invalid_value("NaN is not a sample value"));
        }

        let mut samples = self.samples.lock();
        match self.metric_type {
            MetricType::Counter => {
                if let Some(last) = samples.last() {
                    if value < last.value {
                        return Err(MonError::invalid_value(format!(
                            "counter decreased from {} to {}",
                            last.value, value
                        )));
                    }
                }
            }
            MetricType::Timer => {
                if value < 0.0 {
                    return Err(MonError::invalid_value(format!(
                        "timer value {} is negative",
                        value
                    )));
                }
            }
            MetricType::Gauge => {}
        }
        if samples.len() >= self.capacity {
            return Err(MonError::BufferFull { capacity: self.capacity });
        }
        samples.push(Sample::new(time, value, writer));
        Ok(())
    }

    /// Add `delta` to the latest gauge value. An empty gauge starts from 0.
    pub fn append_gauge_delta(&self, delta: f64) -> Result<()> {
        if self.metric_type != MetricType::Gauge {
            return Err(MonError::invalid_value(format!(
                "delta updates need a gauge, metric is {:?}",
                self.metric_type
            )));
        }
        if delta.is_nan() {
            return Err(MonError::invalid_value("NaN is not a sample value"));
        }

        let mut samples = self.samples.lock();
        if samples.len() >= self.capacity {
            return Err(MonError::BufferFull { capacity: self.capacity });
        }
        let base = samples.last().map(|s| s.value).unwrap_or(0.0);
        samples.push(Sample::new(wall_clock_secs(), base + delta, current_writer_tag()));
        Ok(())
    }

    /// Copy of the newest `min(count, len)` samples, oldest first
    pub fn tail(&self, count: usize) -> Vec<Sample> {
        let samples = self.samples.lock();
        let start = samples.len().saturating_sub(count);
        samples[start..].to_vec()
    }

    /// Pack the newest `min(count, len)` samples into `out` in bulk wire
    /// format. Returns how many samples were written.
    pub fn write_tail_into(&self, count: usize, out: &mut BytesMut) -> usize {
        let samples = self.samples.lock();
        let start = samples.len().saturating_sub(count);
        let window = &samples[start..];
        out.reserve(window.len() * Sample::WIRE_SIZE);
        for s in window {
            out.put_f64_le(s.time);
            out.put_f64_le(s.value);
            out.put_u64_le(s.writer);
        }
        window.len()
    }

    /// Run `f` over the current window while holding the lock.
    /// `f` must not block or perform I/O.
    pub fn with_window<R>(&self, f: impl FnOnce(&[Sample]) -> R) -> R {
        let samples = self.samples.lock();
        f(&samples)
    }

    /// Copy of the whole window
    pub fn snapshot(&self) -> Vec<Sample> {
        self.with_window(|w| w.to_vec())
    }

    /// Write a `bucket_count`-bucket histogram of the window to `path`.
    ///
    /// Format: a `bucket_count, min, max` header line, then one count per line.
    pub fn dump_histogram(&self, bucket_count: usize, path: &Path) -> Result<Histogram> {
        let histogram = self.with_window(|w| Histogram::from_samples(w, bucket_count))?;

        let mut out = BufWriter::new(File::create(path)?);
        writeln!(out, "{}, {}, {}", bucket_count, histogram.min, histogram.max)?;
        for count in &histogram.counts {
            writeln!(out, "{}", count)?;
        }
        out.flush()?;
        Ok(histogram)
    }

    /// Write every sample as a `value, time, writer` line to `path`.
    /// Returns the number of samples written.
    pub fn dump_raw(&self, path: &Path) -> Result<usize> {
        let window = self.snapshot();

        let mut out = BufWriter::new(File::create(path)?);
        for s in &window {
            writeln!(out, "{}, {}, {}", s.value, s.time, s.writer)?;
        }
        out.flush()?;
        Ok(window.len())
    }
}
