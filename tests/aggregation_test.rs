//! Aggregation Integration Tests
//!
//! Runs local and global reduction against a small in-process RESP
//! aggregator, verifying:
//! - SELECT on connect for numeric database names
//! - Erase-then-put per metric, and the batched MSET path
//! - REDUCE requests carrying the shard and cohort size
//! - Sharding of metrics across several aggregators

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tagmon::protocol::{RespCodec, RespValue};
use tagmon::reduction::{RespKvSink, RespReducer, SharedReducer, SharedSink};
use tagmon::{
    MetricOptions, MetricType, MonError, Provider, ProviderArgs, ReducedValue, ReductionEngine,
    ReductionOp, TagList,
};
use tokio::net::TcpListener;
use tokio_util::codec::Framed;

#[derive(Default)]
struct AggregatorState {
    commands: Vec<Vec<String>>,
    data: HashMap<String, Bytes>,
}

/// Minimal RESP aggregator: answers SELECT, SET, MSET, DEL and REDUCE
struct FakeAggregator {
    addr: String,
    state: Arc<Mutex<AggregatorState>>,
}

impl FakeAggregator {
    async fn start() -> FakeAggregator {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let state = Arc::new(Mutex::new(AggregatorState::default()));

        let shared = state.clone();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let state = shared.clone();
                tokio::spawn(async move {
                    let mut framed = Framed::new(stream, RespCodec::default());
                    while let Some(Ok(value)) = framed.next().await {
                        let reply = Self::apply(&state, value);
                        if framed.send(reply).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });

        FakeAggregator { addr, state }
    }

    fn apply(state: &Mutex<AggregatorState>, value: RespValue) -> RespValue {
        let args: Vec<Bytes> = match value {
            RespValue::Array(Some(items)) => items
                .into_iter()
                .filter_map(|v| match v {
                    RespValue::BulkString(Some(b)) => Some(b),
                    _ => None,
                })
                .collect(),
            _ => return RespValue::Error("ERR expected array".to_string()),
        };
        let text: Vec<String> = args
            .iter()
            .map(|a| String::from_utf8_lossy(a).into_owned())
            .collect();

        let mut state = state.lock();
        state.commands.push(text.clone());
        match text.first().map(String::as_str) {
            Some("SET") if args.len() == 3 => {
                state.data.insert(text[1].clone(), args[2].clone());
                RespValue::ok()
            }
            Some("MSET") => {
                for pair in args[1..].chunks(2) {
                    if let [k, v] = pair {
                        state.data.insert(String::from_utf8_lossy(k).into_owned(), v.clone());
                    }
                }
                RespValue::ok()
            }
            Some("DEL") => {
                let removed = text[1..].iter().filter(|k| state.data.remove(*k).is_some()).count();
                RespValue::Integer(removed as i64)
            }
            Some("SELECT") | Some("REDUCE") => RespValue::ok(),
            _ => RespValue::Error("ERR unknown command".to_string()),
        }
    }

    fn commands(&self) -> Vec<Vec<String>> {
        self.state.lock().commands.clone()
    }

    fn names(&self) -> Vec<String> {
        self.commands().into_iter().map(|c| c[0].clone()).collect()
    }

    fn get(&self, key: &str) -> Option<ReducedValue> {
        let data = self.state.lock().data.get(key).cloned()?;
        Some(ReducedValue::decode(&data).unwrap())
    }

    fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.state.lock().data.keys().cloned().collect();
        keys.sort();
        keys
    }
}

fn provider(engine: ReductionEngine, config: &str) -> Arc<Provider> {
    Provider::new(
        1,
        ProviderArgs {
            config: Some(config.to_string()),
            aggregation: engine,
            ..Default::default()
        },
    )
    .unwrap()
}

fn summed(p: &Provider, name: &str, values: &[f64]) -> tagmon::MetricId {
    let m = p
        .create_metric(
            "ns",
            name,
            MetricType::Gauge,
            TagList::empty(),
            MetricOptions::default().with_reduction(ReductionOp::Sum),
        )
        .unwrap();
    for v in values {
        m.update(*v).unwrap();
    }
    m.id()
}

// ============================================================================
// RESP Sink
// ============================================================================

#[tokio::test]
async fn test_reduce_erases_then_puts() {
    let agg = FakeAggregator::start().await;
    let sink: SharedSink = Arc::new(RespKvSink::new(agg.addr.clone(), "aggdb"));
    let p = provider(ReductionEngine::new(vec![sink], None), r#"{"buffer_capacity": 16}"#);
    let id = summed(&p, "req", &[1.0, 2.0, 3.5]);

    p.reduce_metric(id).await.unwrap();

    // A non-numeric database name is a label only
    assert_eq!(agg.names(), vec!["DEL".to_string(), "SET".to_string()]);
    assert_eq!(agg.get("ns_req_SUM"), Some(ReducedValue::Scalar(6.5)));
}

#[tokio::test]
async fn test_numeric_db_is_selected_once() {
    let agg = FakeAggregator::start().await;
    let sink: SharedSink = Arc::new(RespKvSink::new(agg.addr.clone(), "2"));
    let p = provider(ReductionEngine::new(vec![sink], None), r#"{"buffer_capacity": 16}"#);
    let id = summed(&p, "req", &[1.0]);

    p.reduce_metric(id).await.unwrap();
    p.reduce_metric(id).await.unwrap();

    let commands = agg.commands();
    assert_eq!(commands[0], vec!["SELECT".to_string(), "2".to_string()]);
    assert_eq!(commands.iter().filter(|c| c[0] == "SELECT").count(), 1);
    assert_eq!(commands.len(), 5);
}

#[tokio::test]
async fn test_batched_reduction_uses_one_batch_per_aggregator() {
    let agg = FakeAggregator::start().await;
    let sink: SharedSink = Arc::new(RespKvSink::new(agg.addr.clone(), "aggdb"));
    let p = provider(
        ReductionEngine::new(vec![sink], None),
        r#"{"buffer_capacity": 16, "batched_reduction": true}"#,
    );
    for name in ["a", "b", "c"] {
        summed(&p, name, &[1.0, 1.0]);
    }

    let report = p.reduce_all_batched().await;
    assert_eq!(report.reduced, 3);
    assert_eq!(agg.names(), vec!["DEL".to_string(), "MSET".to_string()]);
    assert_eq!(agg.keys(), vec!["ns_a_SUM", "ns_b_SUM", "ns_c_SUM"]);
}

#[tokio::test]
async fn test_metrics_are_sharded_across_aggregators() {
    let aggs = [
        FakeAggregator::start().await,
        FakeAggregator::start().await,
        FakeAggregator::start().await,
    ];
    let sinks: Vec<SharedSink> = aggs
        .iter()
        .map(|a| Arc::new(RespKvSink::new(a.addr.clone(), "aggdb")) as SharedSink)
        .collect();
    let engine = ReductionEngine::new(sinks, None);
    let p = provider(engine.clone(), r#"{"buffer_capacity": 16}"#);

    let mut expected: Vec<Vec<String>> = vec![Vec::new(); aggs.len()];
    for i in 0..12 {
        let name = format!("m{}", i);
        let id = summed(&p, &name, &[1.0]);
        let shard = engine.shard_for(id).unwrap();
        assert_eq!(shard, id.as_u32() as usize % aggs.len());
        expected[shard].push(format!("ns_{}_SUM", name));
    }

    let report = p.reduce_all().await;
    assert_eq!(report.reduced, 12);
    for (agg, mut keys) in aggs.iter().zip(expected) {
        keys.sort();
        assert_eq!(agg.keys(), keys);
    }
}

#[tokio::test]
async fn test_unreachable_aggregator_is_isolated_per_metric() {
    let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = dead.local_addr().unwrap().to_string();
    drop(dead);

    let sink: SharedSink = Arc::new(RespKvSink::new(addr, "aggdb"));
    let p = provider(ReductionEngine::new(vec![sink], None), r#"{"buffer_capacity": 16}"#);
    let id = summed(&p, "a", &[1.0]);
    summed(&p, "b", &[1.0]);

    assert!(matches!(p.reduce_metric(id).await, Err(MonError::Transport(_))));
    let report = p.reduce_all().await;
    assert_eq!(report.failed, 2);
    assert_eq!(report.reduced, 0);
}

// ============================================================================
// Global Reduction
// ============================================================================

#[tokio::test]
async fn test_global_reduce_sends_reduce_request() {
    let agg = FakeAggregator::start().await;
    let reducer_srv = FakeAggregator::start().await;
    let sink: SharedSink = Arc::new(RespKvSink::new(agg.addr.clone(), "aggdb"));
    let reducer: SharedReducer = Arc::new(RespReducer::new(reducer_srv.addr.clone(), 7));
    let p = provider(
        ReductionEngine::new(vec![sink], Some(reducer)),
        r#"{"buffer_capacity": 16, "cohort_size": 4}"#,
    );
    let m = p
        .create_metric(
            "srini",
            "testmetric",
            MetricType::Gauge,
            TagList::from_slice(&["tag1", "tag2"]).unwrap(),
            MetricOptions::default().with_reduction(ReductionOp::Max),
        )
        .unwrap();
    m.update(3.0).unwrap();

    p.global_reduce_metric(m.id()).await.unwrap();

    assert_eq!(
        reducer_srv.commands(),
        vec![vec![
            "REDUCE".to_string(),
            "srini".to_string(),
            "testmetric".to_string(),
            "srini_testmetric_tag1_tag2".to_string(),
            "0".to_string(),
            "MAX".to_string(),
            "4".to_string(),
        ]]
    );
}
