//! End-to-end request/response benchmarks over the in-memory transport.

use botlink_client::mock::MockTransport;
use botlink_client::{Connection, ConnectionConfig};
use botlink_protocol::{Command, Packet};
use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::sync::Arc;
use tokio::runtime::Runtime;

/// Connection to a simulated robot that echoes every frame it receives.
fn setup_echo_connection(rt: &Runtime) -> Arc<Connection> {
    let mock = Arc::new(MockTransport::new().with_responder(|written| {
        match Packet::decode(written) {
            // 0x72 is fire-and-forget
            Ok(packet) if packet.opcode != 0x72 => vec![Bytes::copy_from_slice(written)],
            _ => Vec::new(),
        }
    }));

    let conn = Arc::new(Connection::new(mock, ConnectionConfig::default()));
    rt.block_on(async {
        conn.connect().await.unwrap();
    });
    conn
}

fn bench_round_trip(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let conn = setup_echo_connection(&rt);

    let mut group = c.benchmark_group("e2e_round_trip");
    group.throughput(Throughput::Elements(1));

    group.bench_function("get_name", |b| {
        b.to_async(&rt).iter(|| async {
            black_box(conn.send(Command::new(0x01, Bytes::new())).await.unwrap())
        });
    });

    group.finish();
}

fn bench_fire_and_forget(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let conn = setup_echo_connection(&rt);

    c.bench_function("e2e_fire_and_forget", |b| {
        b.to_async(&rt).iter(|| async {
            // Retry while the writer catches up with a full queue
            loop {
                match conn
                    .send(Command::new(0x72, vec![0u8]).without_response())
                    .await
                {
                    Ok(sent) => break black_box(sent),
                    Err(_) => tokio::task::yield_now().await,
                }
            }
        });
    });
}

fn bench_concurrent_sequenced(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let conn = setup_echo_connection(&rt);

    let mut group = c.benchmark_group("e2e_concurrent_sequenced");

    for count in [1, 8, 32] {
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, &count| {
            b.to_async(&rt).iter(|| async {
                let requests = (0..count).map(|_| {
                    let seq = conn.next_sequence();
                    conn.send(Command::sequenced(0x64, seq, [0u8; 4]))
                });
                black_box(futures::future::join_all(requests).await)
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_round_trip,
    bench_fire_and_forget,
    bench_concurrent_sequenced,
);

criterion_main!(benches);
