//! Broker fan-out benchmarks.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use parley_core::{conversation_channels, Broker};
use parley_protocol::{conversation_location, Event, EventType};
use serde_json::json;
use std::sync::Arc;
use tokio::runtime::Runtime;

fn bench_publish(c: &mut Criterion) {
    let mut group = c.benchmark_group("publish");
    let rt = Runtime::new().unwrap();
    let event = Event::new(
        EventType::Message,
        conversation_location(1),
        json!({"id": 1, "text": "hello"}),
    );

    for participants in [2u64, 16, 128] {
        let broker = Arc::new(Broker::new());
        let channels = conversation_channels(0..participants);

        for channel in &channels {
            let mut session = rt.block_on(async { broker.subscribe(vec![channel.clone()]) }).unwrap();
            rt.spawn(async move { while session.recv().await.is_some() {} });
        }

        group.throughput(Throughput::Elements(participants));
        group.bench_with_input(
            BenchmarkId::from_parameter(participants),
            &channels,
            |b, channels| b.iter(|| broker.publish(black_box(&event), channels)),
        );
    }

    group.finish();
}

fn bench_publish_offline(c: &mut Criterion) {
    let broker = Broker::new();
    let channels = conversation_channels(0..16);
    let event = Event::new(EventType::Typing, conversation_location(1), json!({"user": 1}));

    c.bench_function("publish_offline", |b| {
        b.iter(|| broker.publish(black_box(&event), &channels))
    });
}

criterion_group!(benches, bench_publish, bench_publish_offline);
criterion_main!(benches);
