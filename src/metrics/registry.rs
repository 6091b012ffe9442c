//! Provider-owned metric registry
//!
//! A fixed array of shards, each a `parking_lot::RwLock` over an `AHashMap`.
//! A metric lives in shard `id % NUM_SHARDS`, so registry mutations on one
//! shard never block lookups on another, and no registry lock is held while
//! a metric's own buffer lock is taken.

use super::identity::{compute_identity, MetricId};
use super::metric::{Metric, MetricOptions};
use super::types::{MetricType, TagList, DEFAULT_BUFFER_CAPACITY};
use crate::error::{MonError, Result};
use ahash::AHashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const NUM_SHARDS: usize = 16;

#[inline]
fn shard_index(id: MetricId) -> usize {
    let idx = (id.as_u32() as usize) % NUM_SHARDS;
    debug_assert!(idx < NUM_SHARDS, "Hash produced invalid shard index");
    idx
}

pub struct MetricRegistry {
    shards: [RwLock<AHashMap<MetricId, Arc<Metric>>>; NUM_SHARDS],
    num_metrics: AtomicUsize,
    buffer_capacity: usize,
}

impl MetricRegistry {
    pub fn new() -> Self {
        Self::with_buffer_capacity(DEFAULT_BUFFER_CAPACITY)
    }

    pub fn with_buffer_capacity(buffer_capacity: usize) -> Self {
        MetricRegistry {
            shards: std::array::from_fn(|_| RwLock::new(AHashMap::new())),
            num_metrics: AtomicUsize::new(0),
            buffer_capacity,
        }
    }

    /// Verify all invariants hold for this registry.
    ///
    /// Only meaningful while no other thread is mutating the registry.
    #[cfg(debug_assertions)]
    pub fn verify_invariants(&self) {
        let mut live = 0;
        for (idx, shard) in self.shards.iter().enumerate() {
            let shard = shard.read();
            for (id, metric) in shard.iter() {
                debug_assert_eq!(
                    *id,
                    metric.id(),
                    "Invariant violated: metric {} stored under key {}",
                    metric.id(),
                    id
                );
                debug_assert_eq!(
                    shard_index(*id),
                    idx,
                    "Invariant violated: metric {} stored in shard {}",
                    id,
                    idx
                );
            }
            live += shard.len();
        }
        debug_assert_eq!(
            live,
            self.len(),
            "Invariant violated: {} live entries but num_metrics is {}",
            live,
            self.len()
        );
    }

    #[cfg(not(debug_assertions))]
    #[inline(always)]
    pub fn verify_invariants(&self) {}

    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }

    /// Number of live metrics
    pub fn len(&self) -> usize {
        self.num_metrics.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: MetricId) -> bool {
        self.shards[shard_index(id)].read().contains_key(&id)
    }

    /// Create and register a metric.
    ///
    /// Fails with `MetricExists` if the identity is already registered; the
    /// existing metric is left untouched and can be looked up with `find`.
    pub fn create(
        &self,
        namespace: &str,
        name: &str,
        metric_type: MetricType,
        tags: TagList,
        options: &MetricOptions,
    ) -> Result<Arc<Metric>> {
        let metric = Arc::new(Metric::new(
            namespace,
            name,
            metric_type,
            tags,
            options,
            self.buffer_capacity,
        )?);
        self.insert(metric.clone())?;
        Ok(metric)
    }

    /// Register an already-built metric
    pub fn insert(&self, metric: Arc<Metric>) -> Result<()> {
        let id = metric.id();
        let mut shard = self.shards[shard_index(id)].write();
        if shard.contains_key(&id) {
            return Err(MonError::MetricExists(format!(
                "{} ({})",
                metric.stringified(),
                id
            )));
        }
        shard.insert(id, metric);
        self.num_metrics.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub fn find(&self, id: MetricId) -> Option<Arc<Metric>> {
        self.shards[shard_index(id)].read().get(&id).cloned()
    }

    /// Look up by string identifiers; tag order does not matter
    pub fn find_by_name<'a, I>(&self, namespace: &str, name: &str, tags: I) -> Option<Arc<Metric>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        self.find(compute_identity(namespace, name, tags))
    }

    /// Unregister a metric. The caller receives the last registry reference.
    pub fn remove(&self, id: MetricId) -> Result<Arc<Metric>> {
        let removed = self.shards[shard_index(id)].write().remove(&id);
        match removed {
            Some(metric) => {
                self.num_metrics.fetch_sub(1, Ordering::AcqRel);
                Ok(metric)
            }
            None => Err(MonError::invalid_metric(id)),
        }
    }

    /// Unregister every metric, shard by shard
    pub fn remove_all(&self) -> Vec<Arc<Metric>> {
        let mut drained = Vec::with_capacity(self.len());
        for shard in &self.shards {
            let mut shard = shard.write();
            let n = shard.len();
            drained.extend(shard.drain().map(|(_, m)| m));
            self.num_metrics.fetch_sub(n, Ordering::AcqRel);
        }
        drained
    }

    /// Up to `max_count` identities. Order follows shard then map iteration
    /// and must not be relied on.
    pub fn list(&self, max_count: usize) -> Vec<MetricId> {
        let mut ids = Vec::with_capacity(max_count.min(self.len()));
        for shard in &self.shards {
            if ids.len() >= max_count {
                break;
            }
            let shard = shard.read();
            let room = max_count - ids.len();
            ids.extend(shard.keys().take(room).copied());
        }
        ids
    }

    /// Snapshot of every registered metric
    pub fn metrics(&self) -> Vec<Arc<Metric>> {
        let mut all = Vec::with_capacity(self.len());
        for shard in &self.shards {
            all.extend(shard.read().values().cloned());
        }
        all
    }
}

impl Default for MetricRegistry {
    fn default() -> Self {
        Self::new()
    }
}
