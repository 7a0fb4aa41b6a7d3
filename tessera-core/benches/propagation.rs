//! Propagation benchmarks
//!
//! These benchmarks measure:
//! - Fan-out: one signal read by many memos, each observed externally
//! - Diamond chains: layered diamonds where every join evaluates once per write
//! - Batching: many writes coalesced into a single flush

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use tessera_core::{Ecosystem, EcosystemConfig, Memo, ObserverHandle, Signal};

fn fan_out(width: usize) -> (Ecosystem, Signal<i64>, Vec<ObserverHandle>) {
    let ecosystem = Ecosystem::new(EcosystemConfig::new(format!("bench-fan-out-{width}")));
    let source = Signal::new("source", 0_i64);
    let reader = Memo::family("reader", {
        let source = source.clone();
        move |ecosystem, offset: &i64| Ok(ecosystem.get(&source)? + offset)
    });

    let sink = Arc::new(AtomicI64::new(0));
    let observers = (0..width as i64)
        .map(|offset| {
            let node = ecosystem.get_or_create(&reader, offset).unwrap();
            let sink = sink.clone();
            ecosystem
                .observe(&node, move |notification| {
                    if let Some(value) = notification.value_as::<i64>() {
                        sink.fetch_add(*value, Ordering::Relaxed);
                    }
                })
                .unwrap()
        })
        .collect();
    (ecosystem, source, observers)
}

fn diamonds(depth: usize) -> (Ecosystem, Signal<i64>, ObserverHandle) {
    let ecosystem = Ecosystem::new(EcosystemConfig::new(format!("bench-diamonds-{depth}")));
    let source = Signal::new("source", 0_i64);

    // each layer splits the previous join into two sides and joins them again
    let mut join = Memo::new("join-0", {
        let source = source.clone();
        move |ecosystem| ecosystem.get(&source)
    });
    for layer in 1..=depth {
        let left = Memo::new(&format!("left-{layer}"), {
            let join = join.clone();
            move |ecosystem| Ok(ecosystem.get(&join)? + 1)
        });
        let right = Memo::new(&format!("right-{layer}"), {
            let join = join.clone();
            move |ecosystem| Ok(ecosystem.get(&join)? * 2)
        });
        join = Memo::new(&format!("join-{layer}"), move |ecosystem| {
            Ok(ecosystem.get(&left)? + ecosystem.get(&right)?)
        });
    }

    let node = ecosystem.get_or_create(&join, ()).unwrap();
    let observer = ecosystem.observe(&node, |_| {}).unwrap();
    (ecosystem, source, observer)
}

fn bench_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("fan_out");
    for width in [10, 100, 1000] {
        let (ecosystem, source, _observers) = fan_out(width);
        let mut next = 0_i64;
        group.bench_with_input(BenchmarkId::from_parameter(width), &width, |b, _| {
            b.iter(|| {
                next += 1;
                ecosystem.set(&source, black_box(next)).unwrap();
            });
        });
    }
    group.finish();
}

fn bench_diamonds(c: &mut Criterion) {
    let mut group = c.benchmark_group("diamonds");
    for depth in [1, 10, 50] {
        let (ecosystem, source, _observer) = diamonds(depth);
        let mut next = 0_i64;
        group.bench_with_input(BenchmarkId::from_parameter(depth), &depth, |b, _| {
            b.iter(|| {
                next += 1;
                ecosystem.set(&source, black_box(next)).unwrap();
            });
        });
    }
    group.finish();
}

fn bench_batched_writes(c: &mut Criterion) {
    let (ecosystem, source, _observers) = fan_out(100);
    let mut next = 0_i64;
    c.bench_function("batched_writes_100x100", |b| {
        b.iter(|| {
            ecosystem
                .batch(|| {
                    for _ in 0..100 {
                        next += 1;
                        ecosystem.set(&source, black_box(next)).unwrap();
                    }
                })
                .unwrap();
        });
    });
}

criterion_group!(benches, bench_fan_out, bench_diamonds, bench_batched_writes);
criterion_main!(benches);
