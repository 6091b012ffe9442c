//! A registered metric: immutable descriptor plus its sample buffer

use super::buffer::SampleBuffer;
use super::identity::{compute_identity, MetricId};
use super::key_encoder::MetricKeyEncoder;
use super::types::{validate_names, MetricType, ReductionOp, TagList};
use crate::error::Result;
use crate::provider::backend::BackendContext;
use parking_lot::Mutex;
use std::fmt;

/// Storage backend to attach when the metric is created
#[derive(Debug, Clone, PartialEq)]
pub struct BackendSpec {
    pub name: String,
    pub config: serde_json::Value,
    /// Open an existing backend context instead of creating one
    pub open_existing: bool,
}

/// Optional creation parameters
#[derive(Debug, Clone, Default)]
pub struct MetricOptions {
    pub description: String,
    pub reduction_op: ReductionOp,
    pub backend: Option<BackendSpec>,
}

impl MetricOptions {
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_reduction(mut self, op: ReductionOp) -> Self {
        self.reduction_op = op;
        self
    }

    pub fn with_backend(mut self, name: impl Into<String>, config: serde_json::Value) -> Self {
        self.backend = Some(BackendSpec {
            name: name.into(),
            config,
            open_existing: false,
        });
        self
    }

    pub fn with_existing_backend(mut self, name: impl Into<String>, config: serde_json::Value) -> Self {
        self.backend = Some(BackendSpec {
            name: name.into(),
            config,
            open_existing: true,
        });
        self
    }
}

/// Backend context attached to a metric at creation
pub struct AttachedBackend {
    pub backend: String,
    pub context: BackendContext,
}

impl fmt::Debug for AttachedBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachedBackend")
            .field("backend", &self.backend)
            .finish_non_exhaustive()
    }
}

#[derive(Debug)]
pub struct Metric {
    id: MetricId,
    namespace: String,
    name: String,
    description: String,
    metric_type: MetricType,
    tags: TagList,
    reduction_op: ReductionOp,
    stringified: String,
    buffer: SampleBuffer,
    backend: Mutex<Option<AttachedBackend>>,
}

impl Metric {
    /// Validate identifiers, derive the identity and allocate the buffer
    pub fn new(
        namespace: &str,
        name: &str,
        metric_type: MetricType,
        tags: TagList,
        options: &MetricOptions,
        buffer_capacity: usize,
    ) -> Result<Self> {
        validate_names(namespace, name, &options.description)?;
        let id = compute_identity(namespace, name, tags.iter());
        let stringified = MetricKeyEncoder::stringify(namespace, name, &tags);
        let buffer = SampleBuffer::with_capacity(metric_type, buffer_capacity)?;

        Ok(Metric {
            id,
            namespace: namespace.to_string(),
            name: name.to_string(),
            description: options.description.clone(),
            metric_type,
            tags,
            reduction_op: options.reduction_op,
            stringified,
            buffer,
            backend: Mutex::new(None),
        })
    }

    pub fn id(&self) -> MetricId {
        self.id
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    pub fn metric_type(&self) -> MetricType {
        self.metric_type
    }

    pub fn tags(&self) -> &TagList {
        &self.tags
    }

    pub fn reduction_op(&self) -> ReductionOp {
        self.reduction_op
    }

    /// `ns_name_tag1_tag2...`, the prefix of every sink key for this metric
    pub fn stringified(&self) -> &str {
        &self.stringified
    }

    /// Sink key for the configured reduction
    pub fn reduction_key(&self) -> String {
        MetricKeyEncoder::encode(&self.stringified, self.reduction_op)
    }

    pub fn buffer(&self) -> &SampleBuffer {
        &self.buffer
    }

    /// Record a new value
    pub fn update(&self, value: f64) -> Result<()> {
        self.buffer.append(value)
    }

    /// Record `previous + delta` (gauges only)
    pub fn update_gauge_delta(&self, delta: f64) -> Result<()> {
        self.buffer.append_gauge_delta(delta)
    }

    pub(crate) fn attach_backend(&self, attached: AttachedBackend) {
        *self.backend.lock() = Some(attached);
    }

    pub(crate) fn take_backend(&self) -> Option<AttachedBackend> {
        self.backend.lock().take()
    }

    pub fn backend_name(&self) -> Option<String> {
        self.backend.lock().as_ref().map(|b| b.backend.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MonError;

    fn tags() -> TagList {
        TagList::from_slice(&["tag1", "tag2", "tag3"]).unwrap()
    }

    #[test]
    fn test_new_derives_identity_and_key() {
        let opts = MetricOptions::default()
            .with_description("test metric")
            .with_reduction(ReductionOp::Max);
        let m = Metric::new("srini", "testmetric", MetricType::Gauge, tags(), &opts, 16).unwrap();

        assert_eq!(
            m.id(),
            compute_identity("srini", "testmetric", ["tag3", "tag2", "tag1"])
        );
        assert_eq!(m.stringified(), "srini_testmetric_tag1_tag2_tag3");
        assert_eq!(m.reduction_key(), "srini_testmetric_tag1_tag2_tag3_MAX");
        assert_eq!(m.description(), "test metric");
        assert_eq!(m.buffer().capacity(), 16);
    }

    #[test]
    fn test_new_rejects_empty_names() {
        let opts = MetricOptions::default();
        assert!(matches!(
            Metric::new("", "x", MetricType::Counter, TagList::empty(), &opts, 4),
            Err(MonError::InvalidName(_))
        ));
        assert!(matches!(
            Metric::new("ns", "", MetricType::Counter, TagList::empty(), &opts, 4),
            Err(MonError::InvalidName(_))
        ));
    }

    #[test]
    fn test_update_follows_type_rules() {
        let opts = MetricOptions::default();
        let m = Metric::new("ns", "c", MetricType::Counter, TagList::empty(), &opts, 8).unwrap();
        m.update(1.0).unwrap();
        m.update(2.0).unwrap();
        assert!(matches!(m.update(1.5), Err(MonError::InvalidValue(_))));
        assert_eq!(m.buffer().len(), 2);
        assert!(m.update_gauge_delta(1.0).is_err());
    }
}
