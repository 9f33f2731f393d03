//! Benchmarks for uncontended lock acquisition latency.

use criterion::{criterion_group, criterion_main, Criterion};
use floc::{
    config::FlocConfig,
    lease::LockMode,
    manager::LockManager,
    store::MemoryLeaseStore,
    time::SystemClock,
};
use std::{sync::Arc, time::Duration};

fn bench_acquire_release(c: &mut Criterion) {
    let manager = Arc::new(LockManager::new(
        Arc::new(MemoryLeaseStore::new()),
        Arc::new(SystemClock),
        FlocConfig::default(),
    ));
    let session = manager.connect();

    let mut group = c.benchmark_group("lock_manager");
    group.bench_function("exclusive_acquire_release", |b| {
        b.to_async(tokio::runtime::Runtime::new().unwrap())
            .iter(|| async {
                let lease = manager
                    .acquire("/bench/exclusive", session, LockMode::Exclusive, Duration::ZERO)
                    .await
                    .unwrap();
                manager.release(&lease).await.unwrap();
            });
    });

    group.bench_function("shared_acquire_release", |b| {
        b.to_async(tokio::runtime::Runtime::new().unwrap())
            .iter(|| async {
                let lease = manager
                    .acquire("/bench/shared", session, LockMode::Shared, Duration::ZERO)
                    .await
                    .unwrap();
                manager.release(&lease).await.unwrap();
            });
    });

    group.finish();
}

criterion_group!(benches, bench_acquire_release);
criterion_main!(benches);
