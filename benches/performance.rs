//! Performance benchmarks for the sync engine.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use nettable::{
    ConnectionId, DataLog, EngineConfig, FileDataLog, OutboundMessage, ProtocolVersion,
    PubSubOption, SyncEngine, Timestamp, Transport, TransportError,
};
use serde_json::json;
use std::sync::Arc;
use tempfile::TempDir;

struct NullTransport;

impl Transport for NullTransport {
    fn send(&self, _connection: ConnectionId, _message: OutboundMessage) -> Result<(), TransportError> {
        Ok(())
    }
}

fn create_engine() -> SyncEngine {
    SyncEngine::new(EngineConfig::default(), Arc::new(NullTransport))
}

/// Benchmark publish fan-out with varying subscriber counts
fn bench_publish_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("publish_fan_out");

    for subscribers in [1, 10, 100, 500] {
        group.bench_with_input(
            BenchmarkId::new("subscribers", subscribers),
            &subscribers,
            |b, &count| {
                let engine = create_engine();
                let publisher = engine
                    .create_publisher("/bench/value", "double", json!({}))
                    .unwrap();
                for _ in 0..count {
                    engine.subscribe("/bench/", &[PubSubOption::PrefixMatch(true)]);
                }

                let mut ts = 1u64;
                b.iter(|| {
                    ts += 1;
                    black_box(engine.publish(publisher, ts as f64, Timestamp(ts)).unwrap());
                });
            },
        );
    }

    group.finish();
}

/// Benchmark draining a full send-all queue
fn bench_queue_drain(c: &mut Criterion) {
    let mut group = c.benchmark_group("queue_drain");

    for depth in [20, 200, 2000] {
        group.bench_with_input(BenchmarkId::new("depth", depth), &depth, |b, &depth| {
            let engine = create_engine();
            let publisher = engine.create_publisher("/q", "int64", json!({})).unwrap();
            let subscriber = engine.subscribe(
                "/q",
                &[
                    PubSubOption::SendAll(true),
                    PubSubOption::PollStorage(depth as u32),
                ],
            );
            let mut ts = 1u64;

            b.iter(|| {
                for _ in 0..depth {
                    ts += 1;
                    engine.publish(publisher, ts as i64, Timestamp(ts)).unwrap();
                }
                black_box(engine.read_queue(subscriber).unwrap());
            });
        });
    }

    group.finish();
}

/// Benchmark flushing remote peers
fn bench_flush(c: &mut Criterion) {
    let mut group = c.benchmark_group("flush");

    for topics in [10, 100, 1000] {
        group.bench_with_input(BenchmarkId::new("topics", topics), &topics, |b, &topics| {
            let engine = create_engine();
            let handshake = engine.begin_handshake("127.0.0.1", 5810);
            let connection = engine
                .complete_handshake(handshake, "bench", ProtocolVersion::V3_0, Timestamp(1))
                .unwrap();
            let publishers: Vec<_> = (0..topics)
                .map(|i| {
                    engine
                        .create_publisher(&format!("/t/{}", i), "double", json!({}))
                        .unwrap()
                })
                .collect();
            let mut ts = 1_000_000u64;

            b.iter(|| {
                for publisher in &publishers {
                    engine.publish(*publisher, 1.0f64, Timestamp(ts)).unwrap();
                }
                // Step past the flush period each round.
                ts += 1_000_000;
                black_box(engine.flush(connection, Timestamp(ts)).unwrap());
            });
        });
    }

    group.finish();
}

/// Benchmark data log appends
fn bench_data_log_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("data_log_append");

    for payload_size in [8, 256, 4096] {
        group.bench_with_input(
            BenchmarkId::new("payload_size", payload_size),
            &payload_size,
            |b, &size| {
                let dir = TempDir::new().unwrap();
                let log = FileDataLog::open(dir.path().join("bench.ntlog")).unwrap();
                let entry = log.start("/raw", "raw", "{}", Timestamp(1)).unwrap();
                let payload = nettable::Value::Raw(vec![0xAB; size]);
                let mut ts = 1u64;

                b.iter(|| {
                    ts += 1;
                    log.append(entry, &payload, Timestamp(ts)).unwrap();
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_publish_fan_out,
    bench_queue_drain,
    bench_flush,
    bench_data_log_append
);

criterion_main!(benches);
