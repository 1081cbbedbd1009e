// Copyright The Photo Cull Authors
// SPDX-License-Identifier: Apache-2.0

//! Criterion benchmarks for in-memory topic fan-out against tokio::sync::broadcast.

use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use cull_pubsub::{InMemoryTopic, TopicOptions};
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

const MSG_COUNT: u64 = 10_000;
const MSG_SIZES: [usize; 2] = [32, 4096];
const SUBSCRIBER_COUNTS: [usize; 4] = [1, 4, 16, 64];

const CAPACITY: usize = 16_384;
const LAG_CAPACITY: usize = 64;
const WARMUP: u64 = u64::MAX;

type Payload = (u64, Arc<[u8]>);

fn make_payload(size: usize) -> Arc<[u8]> {
    Arc::from(vec![42u8; size])
}

#[derive(Clone, Copy)]
struct BenchCase {
    msg_size: usize,
    num_subs: usize,
}

#[derive(Default)]
struct Tally {
    received: u64,
    dropped: u64,
}

/// Spawns `num_subs` readers and returns once each has surfaced a warm-up
/// value, so every reader holds the ring before the measured publishes.
async fn spawn_readers(
    topic: &InMemoryTopic<Payload>,
    ctx: &CancellationToken,
    num_subs: usize,
) -> Vec<tokio::task::JoinHandle<Tally>> {
    let (ready_tx, mut ready_rx) = mpsc::channel::<()>(num_subs);
    let mut handles = Vec::with_capacity(num_subs);
    for _ in 0..num_subs {
        let mut sub = topic.subscribe(ctx.clone());
        let ready = ready_tx.clone();
        handles.push(tokio::spawn(async move {
            let mut tally = Tally::default();
            let mut announced = false;
            while let Some(Ok(delivery)) = sub.recv().await {
                if !announced {
                    announced = true;
                    _ = ready.send(()).await;
                }
                tally.dropped += delivery.undelivered().unwrap_or(0);
                let (seq, payload) = delivery.into_value();
                if seq == WARMUP {
                    continue;
                }
                _ = black_box(&payload);
                tally.received += 1;
                if seq == MSG_COUNT - 1 {
                    break;
                }
            }
            tally
        }));
    }
    drop(ready_tx);

    let warmup = make_payload(1);
    let mut registered = 0;
    while registered < num_subs {
        topic.publish(ctx, (WARMUP, Arc::clone(&warmup))).await.unwrap();
        while let Ok(Some(())) =
            tokio::time::timeout(Duration::from_millis(1), ready_rx.recv()).await
        {
            registered += 1;
        }
    }
    handles
}

async fn run_topic_case(case: BenchCase, capacity: usize) -> Tally {
    let (topic, disposer) = InMemoryTopic::<Payload>::new(
        TopicOptions::default()
            .with_capacity(capacity)
            .with_target_shard_size(8),
    );
    let ctx = CancellationToken::new();
    let readers = spawn_readers(&topic, &ctx, case.num_subs).await;

    let payload = make_payload(case.msg_size);
    for seq in 0..MSG_COUNT {
        topic.publish(&ctx, (seq, Arc::clone(&payload))).await.unwrap();
    }

    let mut total = Tally::default();
    for reader in readers {
        let tally = reader.await.unwrap();
        total.received += tally.received;
        total.dropped += tally.dropped;
    }
    disposer.dispose();
    total
}

async fn run_tokio_broadcast_case(case: BenchCase, capacity: usize) -> Tally {
    let (tx, _rx) = tokio::sync::broadcast::channel::<Payload>(capacity);

    let mut readers = Vec::new();
    for _ in 0..case.num_subs {
        let mut rx = tx.subscribe();
        readers.push(tokio::spawn(async move {
            let mut tally = Tally::default();
            loop {
                match rx.recv().await {
                    Ok((_, payload)) => {
                        _ = black_box(&payload);
                        tally.received += 1;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(missed)) => {
                        tally.dropped += missed;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
            tally
        }));
    }

    let payload = make_payload(case.msg_size);
    for seq in 0..MSG_COUNT {
        _ = tx.send((seq, Arc::clone(&payload)));
        if seq % 256 == 0 {
            tokio::task::yield_now().await;
        }
    }
    drop(tx);

    let mut total = Tally::default();
    for reader in readers {
        let tally = reader.await.unwrap();
        total.received += tally.received;
        total.dropped += tally.dropped;
    }
    total
}

/// Fan-out with a ring large enough that no reader falls behind.
fn bench_topic_fan_out_vs_tokio(c: &mut Criterion) {
    for &msg_size in &MSG_SIZES {
        let mut group = c.benchmark_group(format!("topic_fan_out_vs_tokio/{msg_size}B"));
        _ = group.throughput(Throughput::Elements(MSG_COUNT));

        for &num_subs in &SUBSCRIBER_COUNTS {
            let case = BenchCase { msg_size, num_subs };

            _ = group.bench_with_input(BenchmarkId::new("topic", num_subs), &case, |b, case| {
                let rt = Runtime::new().unwrap();
                b.to_async(&rt).iter(|| async {
                    let tally = run_topic_case(*case, CAPACITY).await;
                    assert_eq!(tally.received, MSG_COUNT * case.num_subs as u64);
                });
            });

            _ = group.bench_with_input(BenchmarkId::new("tokio", num_subs), &case, |b, case| {
                let rt = Runtime::new().unwrap();
                b.to_async(&rt).iter(|| async {
                    let tally = run_tokio_broadcast_case(*case, CAPACITY).await;
                    assert_eq!(tally.received, MSG_COUNT * case.num_subs as u64);
                });
            });
        }

        group.finish();
    }
}

/// Fan-out with a tiny ring, where readers skip ahead.
fn bench_topic_lag_vs_tokio(c: &mut Criterion) {
    let mut group = c.benchmark_group("topic_lag_vs_tokio");
    _ = group.throughput(Throughput::Elements(MSG_COUNT));

    for &num_subs in &SUBSCRIBER_COUNTS {
        let case = BenchCase {
            msg_size: 32,
            num_subs,
        };

        _ = group.bench_with_input(BenchmarkId::new("topic", num_subs), &case, |b, case| {
            let rt = Runtime::new().unwrap();
            b.to_async(&rt).iter(|| async {
                let tally = run_topic_case(*case, LAG_CAPACITY).await;
                _ = black_box((tally.received, tally.dropped));
            });
        });

        _ = group.bench_with_input(BenchmarkId::new("tokio", num_subs), &case, |b, case| {
            let rt = Runtime::new().unwrap();
            b.to_async(&rt).iter(|| async {
                let tally = run_tokio_broadcast_case(*case, LAG_CAPACITY).await;
                _ = black_box((tally.received, tally.dropped));
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_topic_fan_out_vs_tokio, bench_topic_lag_vs_tokio);
criterion_main!(benches);
