use super::endpoint::Endpoint;
use crate::error::{MonError, Result};
use crate::metrics::{MetricId, Sample};
use crate::protocol::{BulkRegion, ProviderId, Request, ServerFrame};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Samples and identity strings returned by one remote fetch
#[derive(Debug, Clone, PartialEq)]
pub struct FetchResult {
    pub samples: Vec<Sample>,
    pub actual_count: usize,
    pub name: String,
    pub ns: String,
}

struct HandleInner {
    endpoint: Mutex<Option<Arc<Endpoint>>>,
    address: String,
    provider_id: ProviderId,
    metric_id: MetricId,
    refcount: AtomicUsize,
    live_handles: Arc<AtomicUsize>,
    max_fetch_count: usize,
    token: Option<String>,
}

/// Client-side reference to a metric on a remote provider.
///
/// Holds only the identity; the server re-resolves it on every request.
/// The explicit refcount governs the endpoint: when the last reference is
/// released the endpoint is dropped and the handle stops working.
#[derive(Clone)]
pub struct RemoteMetricHandle {
    inner: Arc<HandleInner>,
}

impl RemoteMetricHandle {
    pub(crate) fn new(
        endpoint: Arc<Endpoint>,
        provider_id: ProviderId,
        metric_id: MetricId,
        live_handles: Arc<AtomicUsize>,
        max_fetch_count: usize,
        token: Option<String>,
    ) -> Self {
        live_handles.fetch_add(1, Ordering::AcqRel);
        RemoteMetricHandle {
            inner: Arc::new(HandleInner {
                address: endpoint.address().to_string(),
                endpoint: Mutex::new(Some(endpoint)),
                provider_id,
                metric_id,
                refcount: AtomicUsize::new(1),
                live_handles,
                max_fetch_count,
                token,
            }),
        }
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    pub fn provider_id(&self) -> ProviderId {
        self.inner.provider_id
    }

    pub fn metric_id(&self) -> MetricId {
        self.inner.metric_id
    }

    pub fn refcount(&self) -> usize {
        self.inner.refcount.load(Ordering::Acquire)
    }

    /// Take another reference. Fails once the handle has been fully released.
    pub fn ref_incr(&self) -> Result<()> {
        self.inner
            .refcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| (n > 0).then_some(n + 1))
            .map(|_| ())
            .map_err(|_| MonError::InvalidArgs(format!("handle for {} already released", self.inner.metric_id)))
    }

    /// Drop one reference; the last one closes the endpoint
    pub fn release(&self) -> Result<()> {
        let previous = self
            .inner
            .refcount
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .map_err(|_| MonError::InvalidArgs(format!("handle for {} released too often", self.inner.metric_id)))?;
        if previous == 1 {
            self.inner.endpoint.lock().take();
            self.inner.live_handles.fetch_sub(1, Ordering::AcqRel);
            debug!(peer = %self.inner.address, metric_id = %self.inner.metric_id, "remote handle closed");
        }
        Ok(())
    }

    fn endpoint(&self) -> Result<Arc<Endpoint>> {
        self.inner
            .endpoint
            .lock()
            .clone()
            .ok_or_else(|| MonError::InvalidArgs(format!("handle for {} already released", self.inner.metric_id)))
    }

    /// Fetch up to `requested` of the newest samples. The count is clamped
    /// into `[0, max_fetch_count]` before a receive region is allocated.
    pub async fn remote_fetch(&self, requested: i64) -> Result<FetchResult> {
        let endpoint = self.endpoint()?;
        let count = requested.clamp(0, self.inner.max_fetch_count as i64) as usize;
        let mut region = BulkRegion::for_samples(count)?;

        let request = Request::MetricFetch {
            provider_id: self.inner.provider_id,
            metric_id: self.inner.metric_id,
            count: count as i64,
            bulk: region.descriptor(),
            token: self.inner.token.clone(),
        };
        match endpoint.exchange(request.to_resp(), Some(&mut region)).await? {
            ServerFrame::Fetch(reply) => {
                reply.ret.into_result("fetch")?;
                let actual = usize::try_from(reply.actual_count)
                    .map_err(|_| MonError::transport(format!("negative sample count {}", reply.actual_count)))?;
                if actual > count {
                    return Err(MonError::transport(format!(
                        "server returned {} samples for a request of {}",
                        actual, count
                    )));
                }
                let samples = region.samples(actual)?;
                Ok(FetchResult {
                    samples,
                    actual_count: actual,
                    name: reply.name,
                    ns: reply.ns,
                })
            }
            ServerFrame::Rejected { ret, message } => {
                ret.into_result("fetch")?;
                Err(MonError::transport(message))
            }
            other => Err(MonError::transport(format!("unexpected reply to FETCH: {:?}", other))),
        }
    }
}

impl std::fmt::Debug for RemoteMetricHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteMetricHandle")
            .field("address", &self.inner.address)
            .field("provider_id", &self.inner.provider_id)
            .field("metric_id", &self.inner.metric_id)
            .field("refcount", &self.refcount())
            .finish()
    }
}
