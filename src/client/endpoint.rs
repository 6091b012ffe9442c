//! Connection to one provider server address

use crate::error::{MonError, Result};
use crate::protocol::{BulkRegion, RespConnection, RespValue, ServerFrame};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::debug;

/// Lazily connected link to a server. Requests on one endpoint are
/// serialised; a failed or timed-out exchange drops the connection so the
/// next exchange starts on a clean stream.
pub struct Endpoint {
    address: String,
    timeout: Duration,
    conn: Mutex<Option<RespConnection>>,
}

impl Endpoint {
    pub fn new(address: impl Into<String>, timeout: Duration) -> Self {
        Endpoint {
            address: address.into(),
            timeout,
            conn: Mutex::new(None),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Send `request` and return the reply frame. `BULK` pushes arriving
    /// first are copied into `region`.
    pub async fn exchange(&self, request: RespValue, mut region: Option<&mut BulkRegion>) -> Result<ServerFrame> {
        let mut guard = self.conn.lock().await;

        let attempt = async {
            if guard.is_none() {
                *guard = Some(RespConnection::connect(&self.address).await?);
            }
            let conn = guard
                .as_mut()
                .ok_or_else(|| MonError::transport(format!("no connection to {}", self.address)))?;

            conn.send(request).await?;
            loop {
                match ServerFrame::from_resp(conn.recv().await?)? {
                    ServerFrame::Bulk(push) => match region.as_deref_mut() {
                        Some(region) => region.accept(&push)?,
                        None => {
                            return Err(MonError::transport(format!(
                                "unsolicited bulk push for region {}",
                                push.region_id
                            )))
                        }
                    },
                    reply => return Ok::<ServerFrame, MonError>(reply),
                }
            }
        };

        let result = match tokio::time::timeout(self.timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(MonError::transport(format!(
                "{} did not answer within {:?}",
                self.address, self.timeout
            ))),
        };
        if let Err(e) = &result {
            debug!(peer = %self.address, error = %e, "dropping connection");
            *guard = None;
        }
        result
    }
}
