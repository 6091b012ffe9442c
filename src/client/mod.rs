//! Client stub
//!
//! A `Client` dials provider servers, hands out `RemoteMetricHandle`s and
//! issues ListMetrics. Connections are shared per address: handles to
//! metrics on the same server reuse one `Endpoint` while any of them is
//! alive.

mod endpoint;
mod handle;

pub use endpoint::Endpoint;
pub use handle::{FetchResult, RemoteMetricHandle};

use crate::error::{MonError, Result};
use crate::metrics::{compute_identity, MetricId, DEFAULT_BUFFER_CAPACITY};
use crate::protocol::{ProviderId, Request, ServerFrame};
use ahash::AHashMap;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tracing::{debug, warn};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Client {
    timeout: Duration,
    max_fetch_count: usize,
    token: Option<String>,
    live_handles: Arc<AtomicUsize>,
    endpoints: Mutex<AHashMap<String, Weak<Endpoint>>>,
}

impl Client {
    pub fn new() -> Self {
        Client {
            timeout: DEFAULT_TIMEOUT,
            max_fetch_count: DEFAULT_BUFFER_CAPACITY,
            token: None,
            live_handles: Arc::new(AtomicUsize::new(0)),
            endpoints: Mutex::new(AHashMap::new()),
        }
    }

    /// Token presented with every request
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Upper bound applied to fetch counts before a region is allocated
    pub fn with_max_fetch_count(mut self, max: usize) -> Self {
        self.max_fetch_count = max;
        self
    }

    fn endpoint(&self, address: &str) -> Arc<Endpoint> {
        let mut endpoints = self.endpoints.lock();
        if let Some(existing) = endpoints.get(address).and_then(Weak::upgrade) {
            return existing;
        }
        endpoints.retain(|_, e| e.strong_count() > 0);
        let endpoint = Arc::new(Endpoint::new(address, self.timeout));
        endpoints.insert(address.to_string(), Arc::downgrade(&endpoint));
        endpoint
    }

    /// Open a handle to `metric_id` on `provider_id` at `address`, with a
    /// refcount of one. No request is sent until the first fetch.
    pub fn remote_handle_create(
        &self,
        address: &str,
        provider_id: ProviderId,
        metric_id: MetricId,
    ) -> Result<RemoteMetricHandle> {
        if address.is_empty() {
            return Err(MonError::InvalidArgs("empty server address".to_string()));
        }
        let handle = RemoteMetricHandle::new(
            self.endpoint(address),
            provider_id,
            metric_id,
            self.live_handles.clone(),
            self.max_fetch_count,
            self.token.clone(),
        );
        debug!(peer = %address, provider_id, metric_id = %metric_id, "remote handle created");
        Ok(handle)
    }

    /// Up to `max_count` metric identities registered on a remote provider
    pub async fn remote_list(
        &self,
        address: &str,
        provider_id: ProviderId,
        max_count: u64,
    ) -> Result<Vec<MetricId>> {
        let endpoint = self.endpoint(address);
        let request = Request::ListMetrics {
            provider_id,
            max_ids: max_count,
            token: self.token.clone(),
        };
        match endpoint.exchange(request.to_resp(), None).await? {
            ServerFrame::List(reply) => {
                reply.ret.into_result("list")?;
                Ok(reply.ids)
            }
            ServerFrame::Rejected { ret, message } => {
                ret.into_result("list")?;
                Err(MonError::transport(message))
            }
            other => Err(MonError::transport(format!("unexpected reply to LIST: {:?}", other))),
        }
    }

    /// Identity a provider assigns to `(namespace, name, tags)`
    pub fn remote_metric_get_id<'a, I>(&self, namespace: &str, name: &str, tags: I) -> MetricId
    where
        I: IntoIterator<Item = &'a str>,
    {
        compute_identity(namespace, name, tags)
    }

    /// Handles created by this client and not yet fully released
    pub fn num_handles(&self) -> usize {
        self.live_handles.load(Ordering::Acquire)
    }

    /// Tear down the client. Returns the number of handles still open,
    /// which are reported but left usable until released.
    pub fn finalize(&self) -> usize {
        let open = self.num_handles();
        if open > 0 {
            warn!("client finalized with {} unreleased metric handles", open);
        }
        self.endpoints.lock().clear();
        open
    }
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_id_matches_provider_identity() {
        let client = Client::new();
        assert_eq!(
            client.remote_metric_get_id("srini", "testmetric", ["tag3", "tag1", "tag2"]),
            compute_identity("srini", "testmetric", ["tag1", "tag2", "tag3"])
        );
    }

    #[test]
    fn test_handles_share_endpoint_per_address() {
        let client = Client::new();
        let a = client.remote_handle_create("127.0.0.1:1", 1, MetricId(1)).unwrap();
        let _b = client.remote_handle_create("127.0.0.1:1", 1, MetricId(2)).unwrap();
        assert_eq!(client.endpoints.lock().len(), 1);
        assert_eq!(client.num_handles(), 2);

        a.release().unwrap();
        assert_eq!(client.num_handles(), 1);
        assert_eq!(client.finalize(), 1);
    }

    #[test]
    fn test_empty_address_rejected() {
        let client = Client::new();
        assert!(matches!(
            client.remote_handle_create("", 1, MetricId(1)),
            Err(MonError::InvalidArgs(_))
        ));
    }
}
