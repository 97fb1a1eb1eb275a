// Lock manager throughput and contention benchmarks.
// Exercises uncontended acquire/release, shared-lock fan-out, upgrade
// contention, and multi-thread hotspot contention against one LockTable.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::sync::Arc;
use std::time::Duration;

use tupl_core::{LockManager, LockMode};

fn bench_uncontended_exclusive(c: &mut Criterion) {
    let manager = LockManager::new(16, false, Some(Duration::from_secs(1)));

    c.bench_function("uncontended_exclusive_lock_unlock", |b| {
        b.iter(|| {
            let scope = manager.new_scope();
            let result = scope
                .lock(LockMode::Exclusive, 1, b"row-1", None)
                .unwrap();
            black_box(&result);
            scope.release_all();
        });
    });
}

fn bench_shard_count(c: &mut Criterion) {
    let mut group = c.benchmark_group("shard_count");

    for shards in [1usize, 4, 16, 64] {
        group.bench_with_input(BenchmarkId::from_parameter(shards), &shards, |b, &shards| {
            let manager = LockManager::new(shards, false, Some(Duration::from_secs(1)));
            b.iter(|| {
                let scope = manager.new_scope();
                for i in 0..8u32 {
                    scope
                        .lock(LockMode::Exclusive, 1, &i.to_be_bytes(), None)
                        .unwrap();
                }
                scope.release_all();
            });
        });
    }

    group.finish();
}

fn bench_shared_fan_out(c: &mut Criterion) {
    let mut group = c.benchmark_group("shared_fan_out");

    for readers in [1usize, 4, 16] {
        group.bench_with_input(BenchmarkId::from_parameter(readers), &readers, |b, &readers| {
            let manager = Arc::new(LockManager::new(8, false, Some(Duration::from_secs(1))));
            b.iter(|| {
                let scopes: Vec<_> = (0..readers).map(|_| manager.new_scope()).collect();
                for scope in &scopes {
                    scope.lock(LockMode::Shared, 1, b"hot-row", None).unwrap();
                }
                for scope in &scopes {
                    scope.release_all();
                }
            });
        });
    }

    group.finish();
}

fn bench_upgrade(c: &mut Criterion) {
    let manager = LockManager::new(8, true, Some(Duration::from_secs(1)));

    c.bench_function("upgradable_to_exclusive", |b| {
        b.iter(|| {
            let scope = manager.new_scope();
            scope
                .lock(LockMode::Upgradable, 1, b"row-u", None)
                .unwrap();
            let result = scope
                .lock(LockMode::Exclusive, 1, b"row-u", None)
                .unwrap();
            black_box(&result);
            scope.release_all();
        });
    });
}

fn bench_hotspot_contention(c: &mut Criterion) {
    let mut group = c.benchmark_group("hotspot_contention");

    for num_threads in [1usize, 2, 4, 8] {
        group.bench_with_input(
            BenchmarkId::from_parameter(num_threads),
            &num_threads,
            |b, &num_threads| {
                let manager = Arc::new(LockManager::new(8, false, Some(Duration::from_millis(200))));
                b.iter(|| {
                    let handles: Vec<_> = (0..num_threads)
                        .map(|_| {
                            let mgr = manager.clone();
                            std::thread::spawn(move || {
                                for _ in 0..20 {
                                    let scope = mgr.new_scope();
                                    if scope
                                        .lock(LockMode::Exclusive, 1, b"hotspot", None)
                                        .is_ok()
                                    {
                                        scope.release_all();
                                    }
                                }
                            })
                        })
                        .collect();

                    for handle in handles {
                        handle.join().ok();
                    }
                });
            },
        );
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_uncontended_exclusive,
    bench_shard_count,
    bench_shared_fan_out,
    bench_upgrade,
    bench_hotspot_contention
);
criterion_main!(benches);
