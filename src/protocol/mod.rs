//! Wire protocol between remote monitors and providers

pub mod bulk;
pub mod connection;
pub mod messages;
pub mod resp;

pub use bulk::{decode_samples, encode_samples, BulkDescriptor, BulkPush, BulkRegion, ScratchPool};
pub use connection::RespConnection;
pub use messages::{
    ListMetricsResponse, MetricFetchResponse, ProviderId, Request, ServerFrame,
};
pub use resp::{ParseError, RespCodec, RespLimits, RespParser, RespValue};
