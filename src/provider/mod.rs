//! Metric provider
//!
//! A `Provider` owns a metric registry, its storage backends and its
//! aggregation collaborators. Local producers create and update metrics
//! directly; remote monitors reach the provider through an `RpcServer`.

pub mod backend;
pub mod handlers;
pub mod reduction_task;
pub mod server;

use crate::config::ProviderSettings;
use crate::error::{MonError, Result};
use crate::metrics::{AttachedBackend, Metric, MetricId, MetricOptions, MetricRegistry, MetricType, TagList};
use crate::protocol::{ProviderId, ScratchPool};
use crate::reduction::{ReductionEngine, ReductionReport};
use backend::{Backend, BackendRegistry, DummyBackend};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use server::RpcServer;

/// Startup arguments for a provider
#[derive(Clone, Default)]
pub struct ProviderArgs {
    /// Finalize the provider when its server shuts down
    pub push_finalize_callback: bool,
    /// Shared secret every request must carry; `None` or empty disables the check
    pub token: Option<String>,
    /// Provider settings JSON
    pub config: Option<String>,
    /// Runtime for background work; defaults to the current runtime
    pub pool: Option<tokio::runtime::Handle>,
    /// Aggregators and reducer; disabled when empty
    pub aggregation: ReductionEngine,
}

pub struct Provider {
    id: ProviderId,
    token: Option<String>,
    push_finalize_callback: bool,
    settings: ProviderSettings,
    registry: MetricRegistry,
    backends: BackendRegistry,
    engine: ReductionEngine,
    scratch: ScratchPool,
    reduction_task: Mutex<Option<JoinHandle<()>>>,
    finalized: AtomicBool,
}

impl Provider {
    /// Build a provider. Starts the periodic reduction task when the
    /// settings ask for one.
    pub fn new(id: ProviderId, args: ProviderArgs) -> Result<Arc<Provider>> {
        let settings = ProviderSettings::from_json(args.config.as_deref())?;
        let token = args.token.filter(|t| !t.is_empty());

        let backends = BackendRegistry::new();
        backends.register(Arc::new(DummyBackend::new()))?;

        let provider = Arc::new(Provider {
            id,
            token,
            push_finalize_callback: args.push_finalize_callback,
            registry: MetricRegistry::with_buffer_capacity(settings.buffer_capacity),
            backends,
            engine: args.aggregation,
            scratch: ScratchPool::default(),
            reduction_task: Mutex::new(None),
            finalized: AtomicBool::new(false),
            settings,
        });

        if let Some(interval) = provider.settings.reduction_interval() {
            let handle = match args.pool {
                Some(handle) => handle,
                None => tokio::runtime::Handle::try_current().map_err(|_| {
                    MonError::config("periodic reduction needs a tokio runtime")
                })?,
            };
            let task = reduction_task::ReductionTask::new(Arc::downgrade(&provider), interval);
            *provider.reduction_task.lock() = Some(handle.spawn(task.run()));
        }

        info!(provider_id = id, sinks = provider.engine.sink_count(), "provider started");
        Ok(provider)
    }

    pub fn id(&self) -> ProviderId {
        self.id
    }

    pub fn settings(&self) -> &ProviderSettings {
        &self.settings
    }

    pub fn registry(&self) -> &MetricRegistry {
        &self.registry
    }

    pub fn engine(&self) -> &ReductionEngine {
        &self.engine
    }

    pub(crate) fn scratch(&self) -> &ScratchPool {
        &self.scratch
    }

    pub fn push_finalize_callback(&self) -> bool {
        self.push_finalize_callback
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire)
    }

    /// Check a request's token against the provider's
    pub fn authorize(&self, token: Option<&str>) -> Result<()> {
        match &self.token {
            None => Ok(()),
            Some(expected) if token == Some(expected.as_str()) => Ok(()),
            Some(_) => Err(MonError::InvalidToken),
        }
    }

    pub fn register_backend(&self, backend: Arc<dyn Backend>) -> Result<()> {
        self.backends.register(backend)
    }

    /// Create a metric. Duplicate identities fail with `MetricExists`.
    pub fn create_metric(
        &self,
        namespace: &str,
        name: &str,
        metric_type: MetricType,
        tags: TagList,
        options: MetricOptions,
    ) -> Result<Arc<Metric>> {
        let metric = Arc::new(Metric::new(
            namespace,
            name,
            metric_type,
            tags,
            &options,
            self.settings.buffer_capacity,
        )?);
        if self.registry.contains(metric.id()) {
            return Err(MonError::MetricExists(metric.stringified().to_string()));
        }

        if let Some(spec) = &options.backend {
            let backend = self.backends.get(&spec.name)?;
            let context = if spec.open_existing {
                backend.open(self.id, &spec.config)?
            } else {
                backend.create(self.id, &spec.config)?
            };
            metric.attach_backend(AttachedBackend {
                backend: spec.name.clone(),
                context,
            });
        }

        if let Err(e) = self.registry.insert(metric.clone()) {
            // Lost a creation race; hand back the context we just made
            let created = options.backend.as_ref().is_some_and(|b| !b.open_existing);
            self.release_backend(&metric, created);
            return Err(e);
        }
        debug!(provider_id = self.id, metric_id = %metric.id(), key = metric.stringified(), "metric created");
        Ok(metric)
    }

    pub fn find(&self, id: MetricId) -> Option<Arc<Metric>> {
        self.registry.find(id)
    }

    /// Look up by identifiers; tag order does not matter
    pub fn find_metric<'a, I>(&self, namespace: &str, name: &str, tags: I) -> Option<Arc<Metric>>
    where
        I: IntoIterator<Item = &'a str>,
    {
        self.registry.find_by_name(namespace, name, tags)
    }

    pub fn list_metrics(&self, max_count: usize) -> Vec<MetricId> {
        self.registry.list(max_count)
    }

    pub fn num_metrics(&self) -> usize {
        self.registry.len()
    }

    fn release_backend(&self, metric: &Metric, destroy: bool) {
        let Some(attached) = metric.take_backend() else {
            return;
        };
        let result = self.backends.get(&attached.backend).and_then(|backend| {
            if destroy {
                backend.destroy(attached.context)
            } else {
                backend.close(attached.context)
            }
        });
        if let Err(e) = result {
            warn!(provider_id = self.id, metric_id = %metric.id(), backend = %attached.backend, error = %e, "backend release failed");
        }
    }

    /// Unregister a metric, closing its backend context
    pub fn remove_metric(&self, id: MetricId) -> Result<()> {
        let metric = self.registry.remove(id)?;
        self.release_backend(&metric, false);
        Ok(())
    }

    /// Unregister a metric and destroy its backend context
    pub fn destroy_metric(&self, id: MetricId) -> Result<()> {
        let metric = self.registry.remove(id)?;
        self.release_backend(&metric, true);
        Ok(())
    }

    /// Unregister every metric. Backend failures are logged and the rest
    /// of the registry is still released. Returns how many were removed.
    pub fn remove_all_metrics(&self) -> usize {
        let drained = self.registry.remove_all();
        for metric in &drained {
            self.release_backend(metric, false);
        }
        drained.len()
    }

    pub async fn reduce_metric(&self, id: MetricId) -> Result<()> {
        let metric = self.find(id).ok_or_else(|| MonError::invalid_metric(id))?;
        self.engine.reduce(&metric).await
    }

    pub async fn reduce_all(&self) -> ReductionReport {
        self.engine.reduce_all(&self.registry).await
    }

    pub async fn reduce_all_batched(&self) -> ReductionReport {
        self.engine.reduce_all_batched(&self.registry).await
    }

    pub async fn global_reduce_metric(&self, id: MetricId) -> Result<()> {
        let metric = self.find(id).ok_or_else(|| MonError::invalid_metric(id))?;
        self.engine.global_reduce(&metric, self.settings.cohort_size).await
    }

    /// One periodic cycle: local reduction, then global if a reducer is set
    pub async fn run_reduction_cycle(&self) -> ReductionReport {
        let local = if self.settings.batched_reduction {
            self.reduce_all_batched().await
        } else {
            self.reduce_all().await
        };
        let global = self
            .engine
            .global_reduce_all(&self.registry, self.settings.cohort_size)
            .await;
        debug!(
            provider_id = self.id,
            reduced = local.reduced,
            failed = local.failed,
            global_failed = global.failed,
            "reduction cycle"
        );
        local
    }

    /// Stop background work and release every metric. Idempotent.
    pub fn finalize(&self) {
        if self.finalized.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = self.reduction_task.lock().take() {
            task.abort();
        }
        let removed = self.remove_all_metrics();
        info!(provider_id = self.id, removed, "provider finalized");
    }

    /// Explicit teardown
    pub fn destroy(self: Arc<Self>) {
        self.finalize();
    }
}

impl Drop for Provider {
    fn drop(&mut self) {
        if let Some(task) = self.reduction_task.get_mut().take() {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::backend::BackendContext;
    use crate::reduction::InMemoryKvSink;
    use serde_json::json;

    /// Backend whose contexts labelled `bad*` fail to close or destroy
    #[derive(Default)]
    struct FlakyBackend {
        released: Mutex<Vec<String>>,
        failures: Mutex<Vec<String>>,
    }

    impl FlakyBackend {
        fn release(&self, context: BackendContext) -> Result<()> {
            let label = context
                .downcast::<String>()
                .map_err(|_| MonError::InvalidArgs("foreign context".to_string()))?;
            if label.starts_with("bad") {
                self.failures.lock().push(*label.clone());
                return Err(MonError::InvalidBackend(format!("cannot release {}", label)));
            }
            self.released.lock().push(*label);
            Ok(())
        }
    }

    impl Backend for FlakyBackend {
        fn name(&self) -> &str {
            "flaky"
        }

        fn create(&self, _provider_id: ProviderId, config: &serde_json::Value) -> Result<BackendContext> {
            let label = config["label"].as_str().unwrap_or_default().to_string();
            Ok(BackendContext::new(label))
        }

        fn open(&self, provider_id: ProviderId, config: &serde_json::Value) -> Result<BackendContext> {
            self.create(provider_id, config)
        }

        fn close(&self, context: BackendContext) -> Result<()> {
            self.release(context)
        }

        fn destroy(&self, context: BackendContext) -> Result<()> {
            self.release(context)
        }
    }

    fn provider() -> Arc<Provider> {
        Provider::new(
            1,
            ProviderArgs {
                config: Some(r#"{"buffer_capacity": 128}"#.to_string()),
                ..Default::default()
            },
        )
        .unwrap()
    }

    #[test]
    fn test_create_uses_configured_capacity() {
        let p = provider();
        let m = p
            .create_metric("ns", "m", MetricType::Gauge, TagList::empty(), MetricOptions::default())
            .unwrap();
        assert_eq!(m.buffer().capacity(), 128);
        assert_eq!(p.num_metrics(), 1);
    }

    #[test]
    fn test_duplicate_create_is_metric_exists() {
        let p = provider();
        let tags = TagList::from_slice(&["a", "b"]).unwrap();
        p.create_metric("ns", "m", MetricType::Gauge, tags.clone(), MetricOptions::default())
            .unwrap();
        let err = p
            .create_metric("ns", "m", MetricType::Gauge, tags, MetricOptions::default())
            .unwrap_err();
        assert!(matches!(err, MonError::MetricExists(_)));
        assert!(p.find_metric("ns", "m", ["b", "a"]).is_some());
    }

    #[test]
    fn test_token_check() {
        let p = Provider::new(
            1,
            ProviderArgs {
                token: Some("s3cret".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
        assert!(p.authorize(Some("s3cret")).is_ok());
        assert!(matches!(p.authorize(Some("nope")), Err(MonError::InvalidToken)));
        assert!(matches!(p.authorize(None), Err(MonError::InvalidToken)));

        let open = provider();
        assert!(open.authorize(None).is_ok());
        assert!(open.authorize(Some("anything")).is_ok());
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let p = provider();
        let err = p
            .create_metric(
                "ns",
                "m",
                MetricType::Gauge,
                TagList::empty(),
                MetricOptions::default().with_backend("rocksdb", json!({})),
            )
            .unwrap_err();
        assert!(matches!(err, MonError::InvalidBackend(_)));
        assert_eq!(p.num_metrics(), 0);
    }

    #[test]
    fn test_backend_closed_on_remove_and_destroyed_on_destroy() {
        let p = provider();
        let m1 = p
            .create_metric(
                "ns",
                "a",
                MetricType::Gauge,
                TagList::empty(),
                MetricOptions::default().with_backend("dummy", json!({"x": 1})),
            )
            .unwrap();
        let m2 = p
            .create_metric(
                "ns",
                "b",
                MetricType::Gauge,
                TagList::empty(),
                MetricOptions::default().with_existing_backend("dummy", json!(null)),
            )
            .unwrap();
        assert_eq!(m1.backend_name().as_deref(), Some("dummy"));

        p.remove_metric(m1.id()).unwrap();
        assert!(m1.backend_name().is_none());
        p.destroy_metric(m2.id()).unwrap();
        assert!(m2.backend_name().is_none());
        assert!(matches!(p.remove_metric(m1.id()), Err(MonError::InvalidMetric(_))));
    }

    #[test]
    fn test_bad_config_rejected() {
        let result = Provider::new(
            1,
            ProviderArgs {
                config: Some("{".to_string()),
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(MonError::InvalidConfig(_))));
    }

    #[test]
    fn test_periodic_reduction_needs_runtime() {
        let result = Provider::new(
            1,
            ProviderArgs {
                config: Some(r#"{"reduction_interval_ms": 10}"#.to_string()),
                ..Default::default()
            },
        );
        assert!(matches!(result, Err(MonError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn test_finalize_is_idempotent() {
        let sink = Arc::new(InMemoryKvSink::new());
        let p = Provider::new(
            1,
            ProviderArgs {
                config: Some(r#"{"buffer_capacity": 16, "reduction_interval_ms": 5}"#.to_string()),
                aggregation: ReductionEngine::new(vec![sink], None),
                ..Default::default()
            },
        )
        .unwrap();
        for i in 0..3 {
            p.create_metric("ns", &format!("m{}", i), MetricType::Gauge, TagList::empty(), MetricOptions::default())
                .unwrap();
        }
        p.finalize();
        p.finalize();
        assert!(p.is_finalized());
        assert_eq!(p.num_metrics(), 0);
    }

    #[tokio::test]
    async fn test_reduce_metric_unknown_id() {
        let p = provider();
        assert!(matches!(
            p.reduce_metric(MetricId(12345)).await,
            Err(MonError::InvalidMetric(_))
        ));
    }

    #[test]
    fn test_finalize_completes_when_a_backend_release_fails() {
        let p = provider();
        let flaky = Arc::new(FlakyBackend::default());
        p.register_backend(flaky.clone()).unwrap();

        let labels = ["good_a", "bad_b", "good_c", "bad_d", "good_e"];
        let metrics: Vec<Arc<Metric>> = labels
            .iter()
            .map(|label| {
                p.create_metric(
                    "ns",
                    label,
                    MetricType::Gauge,
                    TagList::empty(),
                    MetricOptions::default().with_backend("flaky", json!({ "label": label })),
                )
                .unwrap()
            })
            .collect();

        p.finalize();
        assert!(p.is_finalized());
        assert_eq!(p.num_metrics(), 0);

        let mut released = flaky.released.lock().clone();
        released.sort();
        assert_eq!(released, vec!["good_a", "good_c", "good_e"]);
        let mut failures = flaky.failures.lock().clone();
        failures.sort();
        assert_eq!(failures, vec!["bad_b", "bad_d"]);
        // Every context was handed back, failed or not
        assert!(metrics.iter().all(|m| m.backend_name().is_none()));
    }

    #[test]
    fn test_remove_all_then_destroy() {
        let p = provider();
        for name in ["a", "b"] {
            p.create_metric(
                "ns",
                name,
                MetricType::Gauge,
                TagList::empty(),
                MetricOptions::default().with_backend("dummy", json!({})),
            )
            .unwrap();
        }
        assert_eq!(p.remove_all_metrics(), 2);
        assert_eq!(p.num_metrics(), 0);
        p.clone().destroy();
        assert!(p.is_finalized());
    }
}
