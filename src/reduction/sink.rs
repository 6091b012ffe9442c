//! Aggregation sinks
//!
//! The reduction engine only needs two collaborators:
//! - a key-value sink (`put`, `erase`, and their batched forms)
//! - a reducer that combines already-reduced values across a cohort
//!
//! Implementations:
//! - `InMemoryKvSink` / `InMemoryReducer`: for unit tests and single-process setups
//! - `RespKvSink` / `RespReducer`: talk to a Redis-compatible aggregation tier

use crate::error::{MonError, Result};
use crate::metrics::ReductionOp;
use crate::protocol::connection::RespConnection;
use crate::protocol::RespValue;
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

pub type SinkFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Key-value aggregation sink
pub trait KvSink: Send + Sync + 'static {
    /// Store `value` under `key`, replacing any previous value
    fn put<'a>(&'a self, key: &'a str, value: &'a [u8]) -> SinkFuture<'a, ()>;

    /// Delete `key`; deleting a missing key succeeds
    fn erase<'a>(&'a self, key: &'a str) -> SinkFuture<'a, ()>;

    fn multi_put<'a>(&'a self, entries: &'a [(String, Vec<u8>)]) -> SinkFuture<'a, ()> {
        Box::pin(async move {
            for (key, value) in entries {
                self.put(key, value).await?;
            }
            Ok(())
        })
    }

    fn multi_erase<'a>(&'a self, keys: &'a [String]) -> SinkFuture<'a, ()> {
        Box::pin(async move {
            for key in keys {
                self.erase(key).await?;
            }
            Ok(())
        })
    }
}

/// Cross-process combine request for one metric
#[derive(Debug, Clone, PartialEq)]
pub struct ReduceRequest {
    pub namespace: String,
    pub name: String,
    /// Stringified identity; the reducer appends the operator itself
    pub key: String,
    /// Index of the aggregator holding this metric's local result
    pub shard_id: usize,
    pub op: ReductionOp,
    /// Number of providers expected to contribute
    pub cohort_size: u32,
}

pub trait Reducer: Send + Sync + 'static {
    fn reduce<'a>(&'a self, request: &'a ReduceRequest) -> SinkFuture<'a, ()>;
}

/// In-memory sink with operation counters and failure injection
#[derive(Default)]
pub struct InMemoryKvSink {
    data: RwLock<HashMap<String, Vec<u8>>>,
    failing_keys: RwLock<HashSet<String>>,
    puts: AtomicU64,
    erases: AtomicU64,
    batches: AtomicU64,
}

impl InMemoryKvSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        self.data.read().get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.data.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make every later write to `key` fail
    pub fn fail_key(&self, key: impl Into<String>) {
        self.failing_keys.write().insert(key.into());
    }

    pub fn put_count(&self) -> u64 {
        self.puts.load(Ordering::Relaxed)
    }

    pub fn erase_count(&self) -> u64 {
        self.erases.load(Ordering::Relaxed)
    }

    /// Number of `multi_put` / `multi_erase` calls
    pub fn batch_count(&self) -> u64 {
        self.batches.load(Ordering::Relaxed)
    }

    fn check(&self, key: &str) -> Result<()> {
        if self.failing_keys.read().contains(key) {
            return Err(MonError::sink(format!("injected failure for '{}'", key)));
        }
        Ok(())
    }
}

impl KvSink for InMemoryKvSink {
    fn put<'a>(&'a self, key: &'a str, value: &'a [u8]) -> SinkFuture<'a, ()> {
        Box::pin(async move {
            self.check(key)?;
            self.puts.fetch_add(1, Ordering::Relaxed);
            self.data.write().insert(key.to_string(), value.to_vec());
            Ok(())
        })
    }

    fn erase<'a>(&'a self, key: &'a str) -> SinkFuture<'a, ()> {
        Box::pin(async move {
            self.check(key)?;
            self.erases.fetch_add(1, Ordering::Relaxed);
            self.data.write().remove(key);
            Ok(())
        })
    }

    fn multi_put<'a>(&'a self, entries: &'a [(String, Vec<u8>)]) -> SinkFuture<'a, ()> {
        Box::pin(async move {
            for (key, _) in entries {
                self.check(key)?;
            }
            self.batches.fetch_add(1, Ordering::Relaxed);
            let mut data = self.data.write();
            for (key, value) in entries {
                data.insert(key.clone(), value.clone());
            }
            Ok(())
        })
    }

    fn multi_erase<'a>(&'a self, keys: &'a [String]) -> SinkFuture<'a, ()> {
        Box::pin(async move {
            for key in keys {
                self.check(key)?;
            }
            self.batches.fetch_add(1, Ordering::Relaxed);
            let mut data = self.data.write();
            for key in keys {
                data.remove(key);
            }
            Ok(())
        })
    }
}

/// Records every request it receives
#[derive(Default)]
pub struct InMemoryReducer {
    requests: RwLock<Vec<ReduceRequest>>,
}

impl InMemoryReducer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> Vec<ReduceRequest> {
        self.requests.read().clone()
    }
}

impl Reducer for InMemoryReducer {
    fn reduce<'a>(&'a self, request: &'a ReduceRequest) -> SinkFuture<'a, ()> {
        Box::pin(async move {
            self.requests.write().push(request.clone());
            Ok(())
        })
    }
}

/// Lazily (re)connected RESP link shared by the RESP-backed collaborators.
/// A failed call drops the connection so the next call reconnects.
struct LazyConnection {
    addr: String,
    conn: Mutex<Option<RespConnection>>,
}

impl LazyConnection {
    fn new(addr: String) -> Self {
        LazyConnection { addr, conn: Mutex::new(None) }
    }

    async fn call(&self, request: RespValue, select_db: Option<u32>) -> Result<RespValue> {
        let mut guard = self.conn.lock().await;
        if guard.is_none() {
            let mut conn = RespConnection::connect(&self.addr).await?;
            if let Some(db) = select_db {
                let reply = conn
                    .call(RespValue::array(vec![
                        RespValue::bulk_str("SELECT"),
                        RespValue::bulk_str(&db.to_string()),
                    ]))
                    .await?;
                expect_ok(&reply)?;
            }
            *guard = Some(conn);
        }

        let result = match guard.as_mut() {
            Some(conn) => conn.call(request).await,
            None => Err(MonError::transport(format!("no connection to {}", self.addr))),
        };
        if result.is_err() {
            *guard = None;
        }
        result
    }
}

fn expect_ok(reply: &RespValue) -> Result<()> {
    match reply {
        RespValue::SimpleString(_) | RespValue::Integer(_) => Ok(()),
        RespValue::Error(e) => Err(MonError::sink(e.clone())),
        other => Err(MonError::sink(format!("unexpected reply {:?}", other))),
    }
}

/// Aggregator reached over RESP: `SET`, `DEL`, `MSET`
pub struct RespKvSink {
    db_name: String,
    select_db: Option<u32>,
    link: LazyConnection,
}

impl RespKvSink {
    /// A numeric `db_name` is selected on connect; any other name is only a label
    pub fn new(addr: impl Into<String>, db_name: impl Into<String>) -> Self {
        let db_name = db_name.into();
        let select_db = db_name.parse::<u32>().ok();
        RespKvSink {
            db_name,
            select_db,
            link: LazyConnection::new(addr.into()),
        }
    }

    pub fn addr(&self) -> &str {
        &self.link.addr
    }

    pub fn db_name(&self) -> &str {
        &self.db_name
    }

    async fn command(&self, args: Vec<RespValue>) -> Result<()> {
        let reply = self.link.call(RespValue::array(args), self.select_db).await?;
        debug!(aggregator = %self.link.addr, db = %self.db_name, "sink command acknowledged");
        expect_ok(&reply)
    }
}

impl KvSink for RespKvSink {
    fn put<'a>(&'a self, key: &'a str, value: &'a [u8]) -> SinkFuture<'a, ()> {
        Box::pin(async move {
            self.command(vec![
                RespValue::bulk_str("SET"),
                RespValue::bulk_str(key),
                RespValue::bulk(value.to_vec()),
            ])
            .await
        })
    }

    fn erase<'a>(&'a self, key: &'a str) -> SinkFuture<'a, ()> {
        Box::pin(async move {
            self.command(vec![RespValue::bulk_str("DEL"), RespValue::bulk_str(key)])
                .await
        })
    }

    fn multi_put<'a>(&'a self, entries: &'a [(String, Vec<u8>)]) -> SinkFuture<'a, ()> {
        Box::pin(async move {
            if entries.is_empty() {
                return Ok(());
            }
            let mut args = Vec::with_capacity(1 + entries.len() * 2);
            args.push(RespValue::bulk_str("MSET"));
            for (key, value) in entries {
                args.push(RespValue::bulk_str(key));
                args.push(RespValue::bulk(value.clone()));
            }
            self.command(args).await
        })
    }

    fn multi_erase<'a>(&'a self, keys: &'a [String]) -> SinkFuture<'a, ()> {
        Box::pin(async move {
            if keys.is_empty() {
                return Ok(());
            }
            let mut args = Vec::with_capacity(1 + keys.len());
            args.push(RespValue::bulk_str("DEL"));
            args.extend(keys.iter().map(|k| RespValue::bulk_str(k)));
            self.command(args).await
        })
    }
}

/// Reducer reached over RESP: `REDUCE ns name key shard op cohort`
pub struct RespReducer {
    provider_id: u16,
    link: LazyConnection,
}

impl RespReducer {
    pub fn new(addr: impl Into<String>, provider_id: u16) -> Self {
        RespReducer {
            provider_id,
            link: LazyConnection::new(addr.into()),
        }
    }

    pub fn addr(&self) -> &str {
        &self.link.addr
    }

    pub fn provider_id(&self) -> u16 {
        self.provider_id
    }
}

impl Reducer for RespReducer {
    fn reduce<'a>(&'a self, request: &'a ReduceRequest) -> SinkFuture<'a, ()> {
        Box::pin(async move {
            let args = vec![
                RespValue::bulk_str("REDUCE"),
                RespValue::bulk_str(&request.namespace),
                RespValue::bulk_str(&request.name),
                RespValue::bulk_str(&request.key),
                RespValue::bulk_str(&request.shard_id.to_string()),
                RespValue::bulk_str(request.op.op_name()),
                RespValue::bulk_str(&request.cohort_size.to_string()),
            ];
            let reply = self.link.call(RespValue::array(args), None).await?;
            expect_ok(&reply)
        })
    }
}

/// Shared handle types used by the engine
pub type SharedSink = Arc<dyn KvSink>;
pub type SharedReducer = Arc<dyn Reducer>;
