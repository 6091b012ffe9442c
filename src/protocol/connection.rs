//! Framed RESP connection used by outbound clients

use super::resp::{RespCodec, RespValue};
use crate::error::{MonError, Result};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::Framed;
use tracing::debug;

fn as_transport(peer: &str, e: MonError) -> MonError {
    match e {
        MonError::Io(io) => MonError::transport(format!("{}: {}", peer, io)),
        other => other,
    }
}

pub struct RespConnection {
    framed: Framed<TcpStream, RespCodec>,
    peer: String,
}

impl RespConnection {
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| MonError::transport(format!("connect {}: {}", addr, e)))?;
        stream
            .set_nodelay(true)
            .map_err(|e| MonError::transport(format!("{}: {}", addr, e)))?;
        debug!(peer = %addr, "connected");
        Ok(RespConnection {
            framed: Framed::new(stream, RespCodec::default()),
            peer: addr.to_string(),
        })
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub async fn send(&mut self, value: RespValue) -> Result<()> {
        let peer = &self.peer;
        self.framed.send(value).await.map_err(|e| as_transport(peer, e))
    }

    /// Next frame from the peer; a closed connection is a transport error
    pub async fn recv(&mut self) -> Result<RespValue> {
        match self.framed.next().await {
            Some(frame) => frame.map_err(|e| as_transport(&self.peer, e)),
            None => Err(MonError::transport(format!("{} closed the connection", self.peer))),
        }
    }

    pub async fn call(&mut self, value: RespValue) -> Result<RespValue> {
        self.send(value).await?;
        self.recv().await
    }
}
