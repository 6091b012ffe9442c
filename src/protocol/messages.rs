//! RPC messages and their RESP shape
//!
//! Requests (client -> provider), all arguments as bulk strings:
//! - `LIST <provider_id> <max_ids> [token]`
//! - `FETCH <provider_id> <metric_id> <count> <region_id> <region_len> [token]`
//!
//! Server frames (provider -> client):
//! - `LIST :ret :count *[:id ...]`
//! - `FETCH :ret :actual_count $name $ns`
//! - `BULK :region_id $payload`, always sent before the `FETCH` reply it belongs to
//! - `-ERR <code> <message>` when a request could not be decoded at all

use super::bulk::{BulkDescriptor, BulkPush};
use super::resp::RespValue;
use crate::error::{ErrorCode, MonError, Result};
use crate::metrics::MetricId;
use bytes::Bytes;

pub type ProviderId = u16;

#[derive(Debug, Clone, PartialEq)]
pub enum Request {
    ListMetrics {
        provider_id: ProviderId,
        max_ids: u64,
        token: Option<String>,
    },
    MetricFetch {
        provider_id: ProviderId,
        metric_id: MetricId,
        count: i64,
        bulk: BulkDescriptor,
        token: Option<String>,
    },
}

impl Request {
    pub fn provider_id(&self) -> ProviderId {
        match self {
            Request::ListMetrics { provider_id, .. } | Request::MetricFetch { provider_id, .. } => {
                *provider_id
            }
        }
    }

    pub fn token(&self) -> Option<&str> {
        match self {
            Request::ListMetrics { token, .. } | Request::MetricFetch { token, .. } => {
                token.as_deref()
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Request::ListMetrics { .. } => "LIST",
            Request::MetricFetch { .. } => "FETCH",
        }
    }

    pub fn to_resp(&self) -> RespValue {
        let mut args = match self {
            Request::ListMetrics { provider_id, max_ids, .. } => vec![
                RespValue::bulk_str("LIST"),
                RespValue::bulk_str(&provider_id.to_string()),
                RespValue::bulk_str(&max_ids.to_string()),
            ],
            Request::MetricFetch { provider_id, metric_id, count, bulk, .. } => vec![
                RespValue::bulk_str("FETCH"),
                RespValue::bulk_str(&provider_id.to_string()),
                RespValue::bulk_str(&metric_id.as_u32().to_string()),
                RespValue::bulk_str(&count.to_string()),
                RespValue::bulk_str(&bulk.region_id.to_string()),
                RespValue::bulk_str(&bulk.len.to_string()),
            ],
        };
        if let Some(token) = self.token() {
            args.push(RespValue::bulk_str(token));
        }
        RespValue::array(args)
    }

    pub fn from_resp(value: &RespValue) -> Result<Request> {
        let args = match value {
            RespValue::Array(Some(args)) if !args.is_empty() => args,
            _ => return Err(MonError::InvalidArgs("expected non-empty array".to_string())),
        };

        let cmd = arg_str(&args[0])?.to_ascii_uppercase();
        match cmd.as_str() {
            "LIST" => {
                if args.len() != 3 && args.len() != 4 {
                    return Err(wrong_arity("LIST"));
                }
                Ok(Request::ListMetrics {
                    provider_id: arg_num(&args[1])?,
                    max_ids: arg_num(&args[2])?,
                    token: args.get(3).map(arg_str).transpose()?,
                })
            }
            "FETCH" => {
                if args.len() != 6 && args.len() != 7 {
                    return Err(wrong_arity("FETCH"));
                }
                Ok(Request::MetricFetch {
                    provider_id: arg_num(&args[1])?,
                    metric_id: MetricId(arg_num(&args[2])?),
                    count: arg_num(&args[3])?,
                    bulk: BulkDescriptor {
                        region_id: arg_num(&args[4])?,
                        len: arg_num(&args[5])?,
                    },
                    token: args.get(6).map(arg_str).transpose()?,
                })
            }
            other => Err(MonError::Unsupported(format!("unknown request '{}'", other))),
        }
    }
}

fn wrong_arity(cmd: &str) -> MonError {
    MonError::InvalidArgs(format!("wrong number of arguments for '{}'", cmd))
}

fn arg_str(value: &RespValue) -> Result<String> {
    match value {
        RespValue::BulkString(Some(data)) => String::from_utf8(data.to_vec())
            .map_err(|_| MonError::InvalidArgs("argument is not UTF-8".to_string())),
        RespValue::SimpleString(s) => Ok(s.clone()),
        _ => Err(MonError::InvalidArgs("expected string argument".to_string())),
    }
}

fn arg_num<T: std::str::FromStr + TryFrom<i64>>(value: &RespValue) -> Result<T> {
    match value {
        RespValue::Integer(n) => T::try_from(*n)
            .map_err(|_| MonError::InvalidArgs(format!("integer {} out of range", n))),
        _ => {
            let s = arg_str(value)?;
            s.parse::<T>()
                .map_err(|_| MonError::InvalidArgs(format!("'{}' is not a valid integer", s)))
        }
    }
}

fn int(value: &RespValue) -> Result<i64> {
    match value {
        RespValue::Integer(n) => Ok(*n),
        other => Err(MonError::transport(format!("expected integer, got {:?}", other))),
    }
}

fn text(value: &RespValue) -> Result<String> {
    match value {
        RespValue::BulkString(Some(data)) => Ok(String::from_utf8_lossy(data).into_owned()),
        RespValue::BulkString(None) => Ok(String::new()),
        other => Err(MonError::transport(format!("expected bulk string, got {:?}", other))),
    }
}

fn ret_code(value: &RespValue) -> Result<ErrorCode> {
    let raw = int(value)?;
    i32::try_from(raw)
        .ok()
        .and_then(ErrorCode::from_i32)
        .ok_or_else(|| MonError::transport(format!("unknown return code {}", raw)))
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListMetricsResponse {
    pub ret: ErrorCode,
    pub ids: Vec<MetricId>,
}

impl ListMetricsResponse {
    pub fn count(&self) -> usize {
        self.ids.len()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricFetchResponse {
    pub ret: ErrorCode,
    pub actual_count: i64,
    pub name: String,
    pub ns: String,
}

impl MetricFetchResponse {
    pub fn failed(ret: ErrorCode) -> Self {
        MetricFetchResponse {
            ret,
            actual_count: 0,
            name: String::new(),
            ns: String::new(),
        }
    }
}

/// Anything the provider writes back on a connection
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    List(ListMetricsResponse),
    Fetch(MetricFetchResponse),
    Bulk(BulkPush),
    Rejected { ret: ErrorCode, message: String },
}

impl ServerFrame {
    pub fn to_resp(&self) -> RespValue {
        match self {
            ServerFrame::List(resp) => RespValue::array(vec![
                RespValue::bulk_str("LIST"),
                RespValue::Integer(resp.ret.as_i32() as i64),
                RespValue::Integer(resp.ids.len() as i64),
                RespValue::array(
                    resp.ids
                        .iter()
                        .map(|id| RespValue::Integer(id.as_u32() as i64))
                        .collect(),
                ),
            ]),
            ServerFrame::Fetch(resp) => RespValue::array(vec![
                RespValue::bulk_str("FETCH"),
                RespValue::Integer(resp.ret.as_i32() as i64),
                RespValue::Integer(resp.actual_count),
                RespValue::bulk_str(&resp.name),
                RespValue::bulk_str(&resp.ns),
            ]),
            ServerFrame::Bulk(push) => RespValue::array(vec![
                RespValue::bulk_str("BULK"),
                RespValue::Integer(push.region_id as i64),
                RespValue::bulk(push.payload.clone()),
            ]),
            ServerFrame::Rejected { ret, message } => {
                RespValue::Error(format!("ERR {} {}", ret.as_i32(), message))
            }
        }
    }

    pub fn from_resp(value: RespValue) -> Result<ServerFrame> {
        let items = match value {
            RespValue::Error(msg) => return Ok(Self::parse_rejection(&msg)),
            RespValue::Array(Some(items)) if !items.is_empty() => items,
            other => return Err(MonError::transport(format!("unexpected frame {:?}", other))),
        };

        let tag = text(&items[0])?;
        match (tag.as_str(), items.len()) {
            ("LIST", 4) => {
                let ret = ret_code(&items[1])?;
                let count = int(&items[2])?;
                let ids = match &items[3] {
                    RespValue::Array(Some(ids)) => ids
                        .iter()
                        .map(|v| {
                            let raw = int(v)?;
                            u32::try_from(raw)
                                .map(MetricId)
                                .map_err(|_| MonError::transport(format!("bad metric id {}", raw)))
                        })
                        .collect::<Result<Vec<_>>>()?,
                    other => {
                        return Err(MonError::transport(format!("expected id array, got {:?}", other)))
                    }
                };
                if count != ids.len() as i64 {
                    return Err(MonError::transport(format!(
                        "LIST announced {} ids but carried {}",
                        count,
                        ids.len()
                    )));
                }
                Ok(ServerFrame::List(ListMetricsResponse { ret, ids }))
            }
            ("FETCH", 5) => Ok(ServerFrame::Fetch(MetricFetchResponse {
                ret: ret_code(&items[1])?,
                actual_count: int(&items[2])?,
                name: text(&items[3])?,
                ns: text(&items[4])?,
            })),
            ("BULK", 3) => {
                let region_id = int(&items[1])? as u64;
                let payload = match &items[2] {
                    RespValue::BulkString(Some(data)) => data.clone(),
                    RespValue::BulkString(None) => Bytes::new(),
                    other => {
                        return Err(MonError::transport(format!("expected payload, got {:?}", other)))
                    }
                };
                Ok(ServerFrame::Bulk(BulkPush { region_id, payload }))
            }
            (tag, n) => Err(MonError::transport(format!(
                "unexpected '{}' frame with {} elements",
                tag, n
            ))),
        }
    }

    fn parse_rejection(msg: &str) -> ServerFrame {
        let mut parts = msg.splitn(3, ' ');
        let _ = parts.next();
        let ret = parts
            .next()
            .and_then(|c| c.parse::<i32>().ok())
            .and_then(ErrorCode::from_i32)
            .unwrap_or(ErrorCode::Transport);
        let message = parts.next().unwrap_or_default().to_string();
        ServerFrame::Rejected { ret, message }
    }
}
