use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use applock_core::infrastructure_in_memory::InMemoryLockServer;
use applock_core::{AcquireOptions, AppLockExt};

fn bench_session_cycle(c: &mut Criterion) {
    let server = InMemoryLockServer::new();
    let session = server.connect();
    let options = AcquireOptions::default();

    c.bench_function("session_acquire_release_cycle", |b| {
        b.iter(|| {
            let mut lock = session.acquire_app_lock("bench", &options).unwrap();
            lock.dispose().unwrap();
            black_box(lock.elapsed_held_time())
        })
    });
}

fn bench_transaction_cycle(c: &mut Criterion) {
    let server = InMemoryLockServer::new();
    let session = server.connect();
    let options = AcquireOptions::default();

    c.bench_function("transaction_acquire_commit_cycle", |b| {
        b.iter(|| {
            let transaction = session.begin_transaction().unwrap();
            let mut lock = transaction.acquire_app_lock("bench", &options).unwrap();
            lock.dispose().unwrap();
            transaction.commit();
        })
    });
}

fn bench_distinct_names(c: &mut Criterion) {
    let mut group = c.benchmark_group("held_locks");

    for lock_count in [10, 100, 1000] {
        let names: Vec<String> = (0..lock_count).map(|i| format!("resource-{}", i)).collect();
        group.bench_with_input(BenchmarkId::new("locks", lock_count), &names, |b, names| {
            let server = InMemoryLockServer::new();
            let session = server.connect();
            let options = AcquireOptions::default();

            b.iter(|| {
                let mut locks: Vec<_> = names
                    .iter()
                    .map(|name| session.acquire_app_lock(name, &options).unwrap())
                    .collect();
                black_box(server.held_lock_count());
                for lock in &mut locks {
                    lock.release().unwrap();
                }
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_session_cycle, bench_transaction_cycle, bench_distinct_names);
criterion_main!(benches);
