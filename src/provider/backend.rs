//! Pluggable storage backends
//!
//! A backend hands out an opaque context when a metric is created (or
//! opened), and is given the context back when the metric is removed
//! (`close`) or destroyed (`destroy`). Backends are looked up by name in the
//! provider's `BackendRegistry`; `DummyBackend` is always registered.

use crate::error::{MonError, Result};
use crate::protocol::ProviderId;
use ahash::AHashMap;
use parking_lot::RwLock;
use std::any::Any;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Type-erased per-metric backend state
pub struct BackendContext(Box<dyn Any + Send + Sync>);

impl BackendContext {
    pub fn new<T: Any + Send + Sync>(state: T) -> Self {
        BackendContext(Box::new(state))
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.downcast_ref::<T>()
    }

    pub fn downcast<T: Any>(self) -> std::result::Result<Box<T>, Self> {
        match self.0.downcast::<T>() {
            Ok(state) => Ok(state),
            Err(other) => Err(BackendContext(other)),
        }
    }
}

/// Storage strategy capability
pub trait Backend: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn create(&self, provider_id: ProviderId, config: &serde_json::Value) -> Result<BackendContext>;

    fn open(&self, provider_id: ProviderId, config: &serde_json::Value) -> Result<BackendContext>;

    fn close(&self, context: BackendContext) -> Result<()>;

    fn destroy(&self, context: BackendContext) -> Result<()>;
}

/// State the dummy backend keeps per metric
#[derive(Debug, Clone, PartialEq)]
pub struct DummyContext {
    pub provider_id: ProviderId,
    pub config: serde_json::Value,
}

/// Backend that stores nothing and only tracks how many contexts are live
#[derive(Debug, Default)]
pub struct DummyBackend {
    live: AtomicUsize,
}

impl DummyBackend {
    pub const NAME: &'static str = "dummy";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn live_contexts(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    fn release(&self, context: BackendContext, action: &str) -> Result<()> {
        let ctx = context
            .downcast::<DummyContext>()
            .map_err(|_| MonError::InvalidArgs(format!("{}: context not owned by dummy backend", action)))?;
        self.live.fetch_sub(1, Ordering::AcqRel);
        debug!(provider_id = ctx.provider_id, "dummy backend {}", action);
        Ok(())
    }
}

impl Backend for DummyBackend {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn create(&self, provider_id: ProviderId, config: &serde_json::Value) -> Result<BackendContext> {
        self.live.fetch_add(1, Ordering::AcqRel);
        debug!(provider_id, "dummy backend create");
        Ok(BackendContext::new(DummyContext {
            provider_id,
            config: config.clone(),
        }))
    }

    fn open(&self, provider_id: ProviderId, config: &serde_json::Value) -> Result<BackendContext> {
        self.live.fetch_add(1, Ordering::AcqRel);
        debug!(provider_id, "dummy backend open");
        Ok(BackendContext::new(DummyContext {
            provider_id,
            config: config.clone(),
        }))
    }

    fn close(&self, context: BackendContext) -> Result<()> {
        self.release(context, "close")
    }

    fn destroy(&self, context: BackendContext) -> Result<()> {
        self.release(context, "destroy")
    }
}

/// Backends known to one provider, keyed by name
#[derive(Default)]
pub struct BackendRegistry {
    backends: RwLock<AHashMap<String, Arc<dyn Backend>>>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend; a second backend with the same name is rejected
    pub fn register(&self, backend: Arc<dyn Backend>) -> Result<()> {
        let mut backends = self.backends.write();
        let name = backend.name().to_string();
        if backends.contains_key(&name) {
            return Err(MonError::InvalidBackend(format!("'{}' already registered", name)));
        }
        backends.insert(name, backend);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Backend>> {
        self.backends
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| MonError::InvalidBackend(name.to_string()))
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.backends.read().keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_dummy_context_lifecycle() {
        let backend = DummyBackend::new();
        let ctx = backend.create(3, &json!({"path": "/tmp/x"})).unwrap();
        assert_eq!(backend.live_contexts(), 1);
        assert_eq!(
            ctx.downcast_ref::<DummyContext>().map(|c| c.provider_id),
            Some(3)
        );
        backend.close(ctx).unwrap();
        assert_eq!(backend.live_contexts(), 0);

        let ctx = backend.open(3, &json!(null)).unwrap();
        backend.destroy(ctx).unwrap();
        assert_eq!(backend.live_contexts(), 0);
    }

    #[test]
    fn test_foreign_context_rejected() {
        let backend = DummyBackend::new();
        let foreign = BackendContext::new(42u32);
        assert!(matches!(backend.close(foreign), Err(MonError::InvalidArgs(_))));
    }

    #[test]
    fn test_registry_lookup() {
        let registry = BackendRegistry::new();
        registry.register(Arc::new(DummyBackend::new())).unwrap();
        assert!(registry.get("dummy").is_ok());
        assert!(matches!(registry.get("rocksdb"), Err(MonError::InvalidBackend(_))));
        assert!(matches!(
            registry.register(Arc::new(DummyBackend::new())),
            Err(MonError::InvalidBackend(_))
        ));
        assert_eq!(registry.names(), vec!["dummy".to_string()]);
    }
}
