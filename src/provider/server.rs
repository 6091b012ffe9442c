use super::handlers;
use super::{Provider, ProviderArgs};
use crate::error::{ErrorCode, MonError, Result};
use crate::protocol::{ProviderId, RespCodec, ServerFrame};
use ahash::AHashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::codec::Framed;
use tracing::{debug, error, info, warn};

type ProviderTable = Arc<RwLock<AHashMap<ProviderId, Arc<Provider>>>>;

/// TCP endpoint hosting any number of providers, routed by provider id
pub struct RpcServer {
    local_addr: SocketAddr,
    providers: ProviderTable,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl RpcServer {
    /// Bind `addr` and start accepting connections in the background
    pub async fn bind(addr: &str) -> Result<RpcServer> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| MonError::transport(format!("bind {}: {}", addr, e)))?;
        let local_addr = listener.local_addr()?;
        let providers: ProviderTable = Arc::new(RwLock::new(AHashMap::new()));
        info!("RPC server listening on {}", local_addr);

        let table = providers.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let table = table.clone();
                        tokio::spawn(async move {
                            let handler = ConnectionHandler::new(stream, table, peer.to_string());
                            handler.run().await;
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                }
            }
        });

        Ok(RpcServer {
            local_addr,
            providers,
            accept_task: Mutex::new(Some(accept_task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Address clients should dial
    pub fn address(&self) -> String {
        self.local_addr.to_string()
    }

    /// Create a provider and register it under `id`.
    /// A taken id fails with `InvalidProvider`.
    pub fn register_provider(&self, id: ProviderId, args: ProviderArgs) -> Result<Arc<Provider>> {
        if self.providers.read().contains_key(&id) {
            return Err(MonError::InvalidProvider(format!("provider id {} already registered", id)));
        }
        let provider = Provider::new(id, args)?;
        if let Err(e) = self.attach_provider(provider.clone()) {
            provider.finalize();
            return Err(e);
        }
        Ok(provider)
    }

    /// Register an existing provider under its own id
    pub fn attach_provider(&self, provider: Arc<Provider>) -> Result<()> {
        let mut providers = self.providers.write();
        let id = provider.id();
        if providers.contains_key(&id) {
            return Err(MonError::InvalidProvider(format!("provider id {} already registered", id)));
        }
        providers.insert(id, provider);
        info!(provider_id = id, "provider registered");
        Ok(())
    }

    pub fn provider(&self, id: ProviderId) -> Option<Arc<Provider>> {
        self.providers.read().get(&id).cloned()
    }

    pub fn provider_ids(&self) -> Vec<ProviderId> {
        let mut ids: Vec<ProviderId> = self.providers.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Stop routing requests to `id`. The provider itself is not finalized.
    pub fn deregister_provider(&self, id: ProviderId) -> Result<Arc<Provider>> {
        self.providers
            .write()
            .remove(&id)
            .ok_or_else(|| MonError::InvalidProvider(format!("provider id {} not registered", id)))
    }

    /// Stop accepting, drop every provider, and finalize those registered
    /// with `push_finalize_callback`
    pub fn shutdown(&self) {
        if let Some(task) = self.accept_task.lock().take() {
            task.abort();
        }
        let providers: Vec<Arc<Provider>> = self.providers.write().drain().map(|(_, p)| p).collect();
        for provider in providers {
            if provider.push_finalize_callback() {
                provider.finalize();
            }
        }
        info!("RPC server on {} shut down", self.local_addr);
    }
}

impl Drop for RpcServer {
    fn drop(&mut self) {
        if let Some(task) = self.accept_task.get_mut().take() {
            task.abort();
        }
    }
}

struct ConnectionHandler {
    framed: Framed<TcpStream, RespCodec>,
    providers: ProviderTable,
    peer: String,
}

impl ConnectionHandler {
    fn new(stream: TcpStream, providers: ProviderTable, peer: String) -> Self {
        let _ = stream.set_nodelay(true);
        ConnectionHandler {
            framed: Framed::new(stream, RespCodec::server()),
            providers,
            peer,
        }
    }

    async fn run(mut self) {
        debug!(peer = %self.peer, "client connected");

        while let Some(frame) = self.framed.next().await {
            match frame {
                Ok(value) => {
                    let providers = &self.providers;
                    let replies = handlers::handle_request(&value, |id| providers.read().get(&id).cloned());
                    for reply in replies {
                        if let Err(e) = self.framed.feed(reply.to_resp()).await {
                            warn!(peer = %self.peer, "failed to write reply: {}", e);
                            return;
                        }
                    }
                    if let Err(e) = self.framed.flush().await {
                        warn!(peer = %self.peer, "failed to flush replies: {}", e);
                        return;
                    }
                }
                Err(e) => {
                    // The stream cannot be resynchronised after a framing error
                    warn!(peer = %self.peer, "protocol error: {}", e);
                    let rejection = ServerFrame::Rejected {
                        ret: ErrorCode::Transport,
                        message: e.to_string(),
                    };
                    let _ = self.framed.send(rejection.to_resp()).await;
                    break;
                }
            }
        }

        debug!(peer = %self.peer, "client disconnected");
    }
}
