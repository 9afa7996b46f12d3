//! Performance benchmarks for the sync engine.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;
use std::sync::Arc;
use syncstore::{
    CacheBinding, Direction, Engine, EngineConfig, EventEnvelope, FileBackend, Patch,
};
use tempfile::TempDir;

/// Benchmark local set_state with varying subscriber counts
fn bench_set_state(c: &mut Criterion) {
    let mut group = c.benchmark_group("set_state");

    for subscribers in [0, 10, 100] {
        group.bench_with_input(
            BenchmarkId::new("subscribers", subscribers),
            &subscribers,
            |b, &count| {
                let engine = Engine::create(EngineConfig::default()).unwrap();
                for _ in 0..count {
                    engine.subscribe("doc", |v| v.value.get("n").cloned(), |_| {});
                }

                let mut n = 0u64;
                b.iter(|| {
                    n += 1;
                    black_box(engine.set_state("doc", Patch::merge(json!({"n": n}))).unwrap());
                });
            },
        );
    }

    group.finish();
}

/// Benchmark in-order and reversed envelope delivery
fn bench_envelopes(c: &mut Criterion) {
    let mut group = c.benchmark_group("envelopes");

    for reversed in [false, true] {
        group.bench_with_input(
            BenchmarkId::new("reversed", reversed),
            &reversed,
            |b, &reversed| {
                b.iter(|| {
                    let engine = Engine::create(EngineConfig::default()).unwrap();
                    engine.seed_watermark("feed", 0);
                    let mut seqs: Vec<u64> = (1..=200).collect();
                    if reversed {
                        seqs.reverse();
                    }
                    for seq in seqs {
                        engine.on_envelope(EventEnvelope::new("feed", "item.updated", json!({"seq": seq}), seq));
                    }
                    black_box(engine.get_state("feed"));
                });
            },
        );
    }

    group.finish();
}

/// Benchmark cache resolutions against a bound namespace
fn bench_cache_change(c: &mut Criterion) {
    let engine = Engine::create(EngineConfig {
        cache_bindings: vec![CacheBinding::new("tickets/42", "ticket", Direction::Bidirectional)],
        ..Default::default()
    })
    .unwrap();

    let mut n = 0u64;
    c.bench_function("cache_change", |b| {
        b.iter(|| {
            n += 1;
            black_box(engine.on_cache_change("tickets/42", json!({"rev": n})).unwrap());
        });
    });
}

/// Benchmark undo/redo over a full history
fn bench_undo_redo(c: &mut Criterion) {
    let engine = Engine::create(EngineConfig::default()).unwrap();
    for i in 0..100 {
        engine.set_state("doc", Patch::Replace(json!(i))).unwrap();
    }

    c.bench_function("undo_redo", |b| {
        b.iter(|| {
            black_box(engine.undo());
            black_box(engine.redo());
        });
    });
}

/// Benchmark snapshot flush to a file backend
fn bench_flush(c: &mut Criterion) {
    let dir = TempDir::new().unwrap();
    let engine = Engine::builder(EngineConfig {
        persistable_namespaces: vec!["session".into()],
        ..Default::default()
    })
    .backend(Arc::new(FileBackend::open(dir.path()).unwrap()))
    .build()
    .unwrap();

    let mut n = 0u64;
    c.bench_function("flush_persistence", |b| {
        b.iter(|| {
            n += 1;
            engine.set_state("session", Patch::merge(json!({"n": n}))).unwrap();
            black_box(engine.flush_persistence().unwrap());
        });
    });
}

criterion_group!(
    benches,
    bench_set_state,
    bench_envelopes,
    bench_cache_change,
    bench_undo_redo,
    bench_flush,
);
criterion_main!(benches);
