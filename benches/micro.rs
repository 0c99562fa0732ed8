//! Micro-benchmarks for the storage engine's hot paths.
//!
//! Run with `cargo bench --bench micro`. Every put pays a WAL fsync, so
//! absolute numbers track the disk more than the code.

use criterion::{Criterion, criterion_group, criterion_main};
use tempfile::TempDir;

use sisyphusdb::engine::{Engine, EngineConfig};

fn bench_engine(c: &mut Criterion) {
    let tmp = TempDir::new().unwrap();
    let engine = Engine::open(EngineConfig::new(
        tmp.path().join("wal"),
        tmp.path().join("sst"),
    ))
    .unwrap();

    let mut next = 0u64;
    c.bench_function("engine_put", |b| {
        b.iter(|| {
            engine
                .put(format!("key-{next:012}").as_bytes(), b"benchmark-value")
                .unwrap();
            next += 1;
        })
    });

    for i in 0..1000u64 {
        engine
            .put(format!("warm-{i:012}").as_bytes(), b"benchmark-value")
            .unwrap();
    }
    c.bench_function("engine_get_hit", |b| {
        b.iter(|| engine.get(b"warm-000000000500").unwrap())
    });
    c.bench_function("engine_get_miss", |b| {
        b.iter(|| engine.get(b"absent-key").unwrap())
    });

    engine.close().unwrap();
}

criterion_group!(benches, bench_engine);
criterion_main!(benches);
