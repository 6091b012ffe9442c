//! Request handlers
//!
//! Each request runs Deserialize -> Authorize -> Execute -> Respond. Every
//! path produces a reply frame; a request that cannot be decoded is answered
//! with a rejection carrying the error code.

use super::Provider;
use crate::error::{ErrorCode, MonError};
use crate::metrics::MetricId;
use crate::protocol::{
    BulkDescriptor, BulkPush, ListMetricsResponse, MetricFetchResponse, ProviderId, Request,
    RespValue, ServerFrame,
};
use std::sync::Arc;
use tracing::{debug, warn};

/// ListMetrics: up to `max_ids` identities
pub fn list_metrics(provider: &Provider, max_ids: u64, token: Option<&str>) -> ListMetricsResponse {
    if let Err(e) = provider.authorize(token) {
        warn!(provider_id = provider.id(), "list rejected: {}", e);
        return ListMetricsResponse { ret: e.code(), ids: Vec::new() };
    }
    let max = usize::try_from(max_ids).unwrap_or(usize::MAX);
    let ids = provider.list_metrics(max);
    debug!(provider_id = provider.id(), max_ids, count = ids.len(), "list");
    ListMetricsResponse { ret: ErrorCode::Success, ids }
}

/// MetricFetch: the newest `count` samples of `metric_id`, clamped to the
/// provider's fetch limit and to the caller's region.
///
/// The window is packed into a pooled scratch buffer while the metric lock
/// is held; the returned push is written to the socket after it is released.
pub fn metric_fetch(
    provider: &Provider,
    metric_id: MetricId,
    count: i64,
    bulk: BulkDescriptor,
    token: Option<&str>,
) -> (Option<BulkPush>, MetricFetchResponse) {
    if let Err(e) = provider.authorize(token) {
        warn!(provider_id = provider.id(), metric_id = %metric_id, "fetch rejected: {}", e);
        return (None, MetricFetchResponse::failed(e.code()));
    }
    if count < 0 {
        let e = MonError::InvalidArgs(format!("negative fetch count {}", count));
        warn!(provider_id = provider.id(), metric_id = %metric_id, "fetch rejected: {}", e);
        return (None, MetricFetchResponse::failed(e.code()));
    }
    let Some(metric) = provider.find(metric_id) else {
        warn!(provider_id = provider.id(), metric_id = %metric_id, "fetch of unknown metric");
        return (None, MetricFetchResponse::failed(ErrorCode::InvalidMetric));
    };

    let wanted = (count as u64).min(provider.settings().max_fetch_count as u64) as usize;
    let wanted = wanted.min(bulk.sample_capacity());

    let pool = provider.scratch();
    let mut scratch = pool.acquire();
    let actual = metric.buffer().write_tail_into(wanted, &mut scratch);
    let payload = scratch.split().freeze();
    pool.release(scratch);

    debug!(provider_id = provider.id(), metric_id = %metric_id, requested = count, actual, "fetch");
    let push = (actual > 0).then(|| BulkPush {
        region_id: bulk.region_id,
        payload,
    });
    let response = MetricFetchResponse {
        ret: ErrorCode::Success,
        actual_count: actual as i64,
        name: metric.name().to_string(),
        ns: metric.namespace().to_string(),
    };
    (push, response)
}

fn unknown_provider(request: &Request) -> ServerFrame {
    match request {
        Request::ListMetrics { .. } => ServerFrame::List(ListMetricsResponse {
            ret: ErrorCode::InvalidProvider,
            ids: Vec::new(),
        }),
        Request::MetricFetch { .. } => {
            ServerFrame::Fetch(MetricFetchResponse::failed(ErrorCode::InvalidProvider))
        }
    }
}

/// Decode one inbound value and produce every frame to write back, in order
pub fn handle_request<F>(value: &RespValue, lookup: F) -> Vec<ServerFrame>
where
    F: FnOnce(ProviderId) -> Option<Arc<Provider>>,
{
    let request = match Request::from_resp(value) {
        Ok(request) => request,
        Err(e) => {
            warn!("undecodable request: {}", e);
            return vec![ServerFrame::Rejected {
                ret: e.code(),
                message: e.to_string(),
            }];
        }
    };

    let Some(provider) = lookup(request.provider_id()) else {
        warn!(provider_id = request.provider_id(), request = request.name(), "no such provider");
        return vec![unknown_provider(&request)];
    };

    match &request {
        Request::ListMetrics { max_ids, token, .. } => {
            vec![ServerFrame::List(list_metrics(&provider, *max_ids, token.as_deref()))]
        }
        Request::MetricFetch { metric_id, count, bulk, token, .. } => {
            let (push, response) = metric_fetch(&provider, *metric_id, *count, *bulk, token.as_deref());
            let mut frames = Vec::with_capacity(2);
            if let Some(push) = push {
                frames.push(ServerFrame::Bulk(push));
            }
            frames.push(ServerFrame::Fetch(response));
            frames
        }
    }
}
