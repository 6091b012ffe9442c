//! Hot path benchmarks for profiling-driven optimization.
//!
//! Run with: `cargo bench --bench hot_paths`
//! Compare baselines: `cargo bench --bench hot_paths -- --baseline main`
//!
//! These cover the per-sample and per-request paths: identity hashing,
//! buffer appends, fetch window packing, local reduction and RESP
//! frame encoding.

use bytes::BytesMut;
use criterion::{black_box, criterion_group, criterion_main, BatchSize, Criterion, Throughput};
use tagmon::metrics::{compute_identity, SampleBuffer};
use tagmon::protocol::{BulkPush, RespParser, ServerFrame};
use tagmon::reduction::reduce_window;
use tagmon::{MetricType, ReductionOp, Sample};

/// Identity over namespace, name and a growing tag list
fn bench_identity(c: &mut Criterion) {
    let mut group = c.benchmark_group("identity");
    group.throughput(Throughput::Elements(1));

    for n_tags in [0, 3, 8] {
        let tags: Vec<String> = (0..n_tags).map(|i| format!("tag{}", i)).collect();
        group.bench_function(format!("tags_{}", n_tags), |b| {
            b.iter(|| {
                compute_identity(
                    black_box("service"),
                    black_box("request_latency"),
                    tags.iter().map(String::as_str),
                )
            })
        });
    }

    group.finish();
}

/// SampleBuffer::append with the lock uncontended
fn bench_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("append");
    group.throughput(Throughput::Elements(1));

    for metric_type in [MetricType::Gauge, MetricType::Counter] {
        group.bench_function(format!("{:?}", metric_type).to_lowercase(), |b| {
            b.iter_batched(
                || SampleBuffer::with_capacity(metric_type, 10_000).unwrap(),
                |buffer| {
                    for i in 0..1_000 {
                        buffer.append(black_box(i as f64)).unwrap();
                    }
                    buffer
                },
                BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

/// Packing the newest window into a scratch buffer, as a fetch does
fn bench_fetch_window(c: &mut Criterion) {
    let mut group = c.benchmark_group("fetch_window");

    let buffer = SampleBuffer::with_capacity(MetricType::Gauge, 160_000).unwrap();
    for i in 0..160_000 {
        buffer.append(i as f64).unwrap();
    }

    for count in [16usize, 1_024, 65_536] {
        group.throughput(Throughput::Bytes((count * Sample::WIRE_SIZE) as u64));
        group.bench_function(format!("count_{}", count), |b| {
            let mut scratch = BytesMut::with_capacity(count * Sample::WIRE_SIZE);
            b.iter(|| {
                scratch.clear();
                buffer.write_tail_into(black_box(count), &mut scratch)
            })
        });
    }

    group.finish();
}

/// Local reduction over a full window
fn bench_reduce(c: &mut Criterion) {
    let mut group = c.benchmark_group("reduce");
    let window: Vec<Sample> = (0..10_000)
        .map(|i| Sample::new(i as f64, (i % 97) as f64, 1))
        .collect();
    group.throughput(Throughput::Elements(window.len() as u64));

    for op in [ReductionOp::Sum, ReductionOp::Max, ReductionOp::Anomaly] {
        group.bench_function(op.op_name().to_lowercase(), |b| {
            b.iter(|| reduce_window(op, MetricType::Gauge, black_box(&window)))
        });
    }

    group.finish();
}

/// Encoding a BULK push frame
fn bench_bulk_frame(c: &mut Criterion) {
    let mut group = c.benchmark_group("bulk_frame");
    let payload = bytes::Bytes::from(vec![0u8; 1_024 * Sample::WIRE_SIZE]);
    group.throughput(Throughput::Bytes(payload.len() as u64));

    group.bench_function("encode", |b| {
        let frame = ServerFrame::Bulk(BulkPush { region_id: 7, payload: payload.clone() });
        b.iter(|| RespParser::encode(black_box(&frame.to_resp())))
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_identity,
    bench_append,
    bench_fetch_window,
    bench_reduce,
    bench_bulk_frame,
);

criterion_main!(benches);
