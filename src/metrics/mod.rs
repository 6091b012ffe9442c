//! Metric model and storage
//!
//! - **Identity**: order-independent djb2/XOR key of `(ns, name, tags)`
//! - **Sample buffer**: fixed-capacity, per-metric locked append log
//! - **Registry**: sharded concurrent map owned by a provider

mod buffer;
mod identity;
mod key_encoder;
mod metric;
mod registry;
mod types;

pub use buffer::{current_writer_tag, wall_clock_secs, Histogram, SampleBuffer};
pub use identity::{compute_identity, djb2, MetricId};
pub use key_encoder::MetricKeyEncoder;
pub use metric::{AttachedBackend, BackendSpec, Metric, MetricOptions};
pub use registry::MetricRegistry;
pub use types::{
    MetricType, ReductionOp, Sample, TagList, DEFAULT_BUFFER_CAPACITY, MAX_DESCRIPTION_LEN,
    MAX_NAMESPACE_LEN, MAX_NAME_LEN, MAX_TAG_LEN,
};
