//! Performance benchmarks for rtb-bridge
//!
//! Run with: cargo bench

use bytes::Bytes;
use criterion::{criterion_group, criterion_main, BatchSize, Criterion};
use rtb_bridge::{
    decode_event, Bid, BidRequest, BridgeConfig, EventKind, FnHandler, RawEvent, RawHandle,
    RtbSystem, SimulatedEngine,
};
use std::sync::Arc;

fn bench_decode(c: &mut Criterion) {
    let raw = RawEvent::new(
        EventKind::BidRequest,
        RawHandle::from_addr(0x1000).unwrap(),
        42,
        Bytes::from_static(b"{\"imp\":[{\"id\":\"1\",\"banner\":{\"w\":300,\"h\":250}}]}"),
    );

    c.bench_function("decode_event bid request", |b| {
        b.iter(|| decode_event(&raw, "agent-1").unwrap());
    });
}

fn bench_lifecycle(c: &mut Criterion) {
    let engine = Arc::new(SimulatedEngine::new());
    let system = RtbSystem::initialize(engine, "bootstrap.json").unwrap();

    c.bench_function("create + release agent", |b| {
        b.iter(|| {
            let agent = system.create_agent("bench").unwrap();
            agent.release().unwrap();
        });
    });
}

fn bench_dispatch_batch(c: &mut Criterion) {
    let engine = Arc::new(SimulatedEngine::new());
    let config = BridgeConfig {
        poll_timeout_ms: 0,
        max_batch: 64,
        ..BridgeConfig::default()
    };
    let system =
        RtbSystem::initialize_with_config(engine.clone(), "bootstrap.json", config).unwrap();
    let _agent = system.create_agent("agent-1").unwrap();
    system
        .register_handler(
            "agent-1",
            Arc::new(FnHandler::new(|_: &str, req: &BidRequest| {
                Some(Bid::new(req.id, 1000))
            })),
        )
        .unwrap();
    let dispatcher = system.dispatcher();

    c.bench_function("dispatch 64 bid requests", |b| {
        b.iter_batched(
            || {
                for id in 0..64 {
                    engine.inject_bid_request("agent-1", id, "");
                }
            },
            |_| dispatcher.dispatch_once().unwrap(),
            BatchSize::SmallInput,
        );
    });
}

criterion_group!(benches, bench_decode, bench_lifecycle, bench_dispatch_batch);
criterion_main!(benches);
