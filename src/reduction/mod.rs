//! Two-tier reduction
//!
//! Local tier: each metric's window is reduced with its configured operator
//! and written to one of the configured aggregators (`id % aggregators`)
//! under `<stringified>_<OP>`. Writes are erase-then-put so a repeated
//! reduction overwrites rather than accumulates.
//!
//! Global tier: the reducer service is told which aggregator holds the
//! local result and how many providers to expect, and combines the cohort.
//!
//! Windows are read under the metric's buffer lock, but the sink I/O
//! happens after the lock is released. A sample appended while a cycle is
//! in flight may or may not be part of that cycle's result.

pub mod ops;
pub mod sink;

use crate::error::{MonError, Result};
use crate::metrics::{Metric, MetricId, MetricRegistry, ReductionOp};
use futures::future::join_all;
use std::sync::Arc;
use tracing::{debug, warn};

pub use ops::{reduce_window, ReducedValue};
pub use sink::{
    InMemoryKvSink, InMemoryReducer, KvSink, ReduceRequest, Reducer, RespKvSink, RespReducer,
    SharedReducer, SharedSink,
};

/// Outcome of a whole-registry pass
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReductionReport {
    /// Metrics whose result reached a sink
    pub reduced: usize,
    /// Metrics with nothing to write (empty window or `Null` operator)
    pub skipped: usize,
    /// Metrics whose sink write failed
    pub failed: usize,
}

enum Outcome {
    Reduced,
    Skipped,
}

/// Local and global reduction against injected collaborators
#[derive(Clone, Default)]
pub struct ReductionEngine {
    sinks: Vec<SharedSink>,
    reducer: Option<SharedReducer>,
}

impl ReductionEngine {
    pub fn new(sinks: Vec<SharedSink>, reducer: Option<SharedReducer>) -> Self {
        ReductionEngine { sinks, reducer }
    }

    /// Engine with no collaborators; every call is a no-op
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn has_sinks(&self) -> bool {
        !self.sinks.is_empty()
    }

    pub fn has_reducer(&self) -> bool {
        self.reducer.is_some()
    }

    pub fn sink_count(&self) -> usize {
        self.sinks.len()
    }

    /// Aggregator index responsible for `id`
    pub fn shard_for(&self, id: MetricId) -> Option<usize> {
        if self.sinks.is_empty() {
            None
        } else {
            Some(id.as_u32() as usize % self.sinks.len())
        }
    }

    fn reduce_local(metric: &Metric) -> Option<ReducedValue> {
        let op = metric.reduction_op();
        if op == ReductionOp::Null {
            return None;
        }
        let metric_type = metric.metric_type();
        metric
            .buffer()
            .with_window(|window| reduce_window(op, metric_type, window))
    }

    async fn reduce_inner(&self, metric: &Metric) -> Result<Outcome> {
        let Some(shard) = self.shard_for(metric.id()) else {
            return Ok(Outcome::Skipped);
        };
        let Some(value) = Self::reduce_local(metric) else {
            return Ok(Outcome::Skipped);
        };

        let key = metric.reduction_key();
        let bytes = value.encode()?;
        let sink = &self.sinks[shard];
        sink.erase(&key).await?;
        sink.put(&key, &bytes).await?;
        debug!(metric_id = %metric.id(), key = %key, shard, "reduced");
        Ok(Outcome::Reduced)
    }

    /// Reduce one metric into its aggregator. No-op without aggregators,
    /// for `Null` metrics and for empty windows.
    pub async fn reduce(&self, metric: &Metric) -> Result<()> {
        self.reduce_inner(metric).await.map(|_| ())
    }

    /// Reduce every registered metric. A failing metric is logged and
    /// counted; the others still run.
    pub async fn reduce_all(&self, registry: &MetricRegistry) -> ReductionReport {
        let mut report = ReductionReport::default();
        if !self.has_sinks() {
            return report;
        }

        let metrics = registry.metrics();
        let results = join_all(metrics.iter().map(|m| self.reduce_inner(m))).await;
        for (metric, result) in metrics.iter().zip(results) {
            match result {
                Ok(Outcome::Reduced) => report.reduced += 1,
                Ok(Outcome::Skipped) => report.skipped += 1,
                Err(e) => {
                    warn!(metric_id = %metric.id(), key = %metric.reduction_key(), error = %e, "reduction failed");
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Like `reduce_all`, but one `multi_erase` and one `multi_put` per
    /// aggregator. A failed batch fails every metric in it.
    pub async fn reduce_all_batched(&self, registry: &MetricRegistry) -> ReductionReport {
        let mut report = ReductionReport::default();
        if !self.has_sinks() {
            return report;
        }

        let mut batches: Vec<Vec<(String, Vec<u8>)>> = vec![Vec::new(); self.sinks.len()];
        for metric in registry.metrics() {
            let Some(value) = Self::reduce_local(&metric) else {
                report.skipped += 1;
                continue;
            };
            match value.encode() {
                Ok(bytes) => {
                    let shard = metric.id().as_u32() as usize % self.sinks.len();
                    batches[shard].push((metric.reduction_key(), bytes));
                }
                Err(e) => {
                    warn!(metric_id = %metric.id(), error = %e, "reduction failed");
                    report.failed += 1;
                }
            }
        }

        let writes = self
            .sinks
            .iter()
            .zip(batches.iter())
            .filter(|(_, entries)| !entries.is_empty())
            .map(|(sink, entries)| async move {
                let keys: Vec<String> = entries.iter().map(|(k, _)| k.clone()).collect();
                sink.multi_erase(&keys).await?;
                sink.multi_put(entries).await?;
                Ok::<usize, MonError>(entries.len())
            });
        let sizes: Vec<usize> = batches.iter().filter(|b| !b.is_empty()).map(Vec::len).collect();

        for (result, size) in join_all(writes).await.into_iter().zip(sizes) {
            match result {
                Ok(n) => report.reduced += n,
                Err(e) => {
                    warn!(metrics = size, error = %e, "batched reduction failed");
                    report.failed += size;
                }
            }
        }
        report
    }

    /// Ask the reducer to combine this metric across `cohort_size`
    /// providers. No-op without a reducer or for `Null` metrics.
    pub async fn global_reduce(&self, metric: &Metric, cohort_size: u32) -> Result<()> {
        let Some(reducer) = &self.reducer else {
            return Ok(());
        };
        if metric.reduction_op() == ReductionOp::Null {
            return Ok(());
        }
        let request = ReduceRequest {
            namespace: metric.namespace().to_string(),
            name: metric.name().to_string(),
            key: metric.stringified().to_string(),
            shard_id: self.shard_for(metric.id()).unwrap_or(0),
            op: metric.reduction_op(),
            cohort_size,
        };
        reducer.reduce(&request).await
    }

    /// `global_reduce` for every registered metric, failures logged
    pub async fn global_reduce_all(&self, registry: &MetricRegistry, cohort_size: u32) -> ReductionReport {
        let mut report = ReductionReport::default();
        if !self.has_reducer() {
            return report;
        }
        let metrics: Vec<Arc<Metric>> = registry.metrics();
        for metric in metrics {
            if metric.reduction_op() == ReductionOp::Null {
                report.skipped += 1;
                continue;
            }
            match self.global_reduce(&metric, cohort_size).await {
                Ok(()) => report.reduced += 1,
                Err(e) => {
                    warn!(metric_id = %metric.id(), error = %e, "global reduction failed");
                    report.failed += 1;
                }
            }
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{MetricOptions, MetricType, TagList};

    fn registry_with(values: &[f64], op: ReductionOp) -> (MetricRegistry, Arc<Metric>) {
        let reg = MetricRegistry::with_buffer_capacity(64);
        let m = reg
            .create(
                "ns",
                "m",
                MetricType::Gauge,
                TagList::empty(),
                &MetricOptions::default().with_reduction(op),
            )
            .unwrap();
        for v in values {
            m.update(*v).unwrap();
        }
        (reg, m)
    }

    fn stored(sink: &InMemoryKvSink, key: &str) -> ReducedValue {
        ReducedValue::decode(&sink.get(key).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_reduce_writes_erase_then_put() {
        let (_reg, m) = registry_with(&[1.0, 2.0, 3.0, 4.0], ReductionOp::Avg);
        let sink = Arc::new(InMemoryKvSink::new());
        let engine = ReductionEngine::new(vec![sink.clone()], None);

        engine.reduce(&m).await.unwrap();
        engine.reduce(&m).await.unwrap();

        assert_eq!(stored(&sink, "ns_m_AVG"), ReducedValue::Scalar(2.5));
        assert_eq!(sink.len(), 1);
        assert_eq!(sink.erase_count(), 2);
        assert_eq!(sink.put_count(), 2);
    }

    #[tokio::test]
    async fn test_reduce_without_sinks_is_noop() {
        let (reg, m) = registry_with(&[1.0], ReductionOp::Sum);
        let engine = ReductionEngine::disabled();
        engine.reduce(&m).await.unwrap();
        assert_eq!(engine.reduce_all(&reg).await, ReductionReport::default());
    }

    #[tokio::test]
    async fn test_null_and_empty_are_skipped() {
        let sink = Arc::new(InMemoryKvSink::new());
        let engine = ReductionEngine::new(vec![sink.clone()], None);

        let (reg, _) = registry_with(&[1.0], ReductionOp::Null);
        reg.create(
            "ns",
            "empty",
            MetricType::Gauge,
            TagList::empty(),
            &MetricOptions::default().with_reduction(ReductionOp::Sum),
        )
        .unwrap();

        let report = engine.reduce_all(&reg).await;
        assert_eq!(report, ReductionReport { reduced: 0, skipped: 2, failed: 0 });
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_shard_selection() {
        let sinks: Vec<SharedSink> = (0..3).map(|_| Arc::new(InMemoryKvSink::new()) as SharedSink).collect();
        let engine = ReductionEngine::new(sinks, None);
        assert_eq!(engine.shard_for(MetricId(7)), Some(1));
        assert_eq!(ReductionEngine::disabled().shard_for(MetricId(7)), None);
    }

    #[tokio::test]
    async fn test_global_reduce_request() {
        let (_reg, m) = registry_with(&[1.0], ReductionOp::Max);
        let reducer = Arc::new(InMemoryReducer::new());
        let sink = Arc::new(InMemoryKvSink::new());
        let engine = ReductionEngine::new(vec![sink], Some(reducer.clone()));

        engine.global_reduce(&m, 8).await.unwrap();
        let requests = reducer.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].key, "ns_m");
        assert_eq!(requests[0].op, ReductionOp::Max);
        assert_eq!(requests[0].cohort_size, 8);
        assert_eq!(requests[0].shard_id, 0);
    }
}
