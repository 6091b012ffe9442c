//! Tagged metric providers with RPC fetch and two-tier reduction

pub mod client;
pub mod config;
pub mod error;
pub mod metrics;
pub mod protocol;
pub mod provider;
pub mod reduction;

pub use client::{Client, FetchResult, RemoteMetricHandle};
pub use config::{ProviderSettings, ServiceConfig};
pub use error::{ErrorCode, MonError, Result};
pub use metrics::{
    compute_identity, Metric, MetricId, MetricOptions, MetricRegistry, MetricType, ReductionOp,
    Sample, TagList,
};
pub use provider::{Provider, ProviderArgs, RpcServer};
pub use reduction::{ReducedValue, ReductionEngine, ReductionReport};
