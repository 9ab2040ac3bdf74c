use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use hatchet::{Guarantee, Map};

/// `m` reader threads doing `get` against `n` pre-populated keys while one
/// writer thread `put`s `n` fresh keys concurrently -- the steady-state
/// contention shape §4.4/§4.5 are meant to hold up under.
fn put_get_contended(guarantee: Guarantee, n: u64, m: usize) {
    let map: Arc<Map<u64, u64>> = Arc::new(Map::new(guarantee));
    for k in 0..n {
        map.put(&k, k);
    }

    let mut readers = Vec::with_capacity(m);
    for _ in 0..m {
        let map = map.clone();
        readers.push(std::thread::spawn(move || {
            for k in 0..n {
                black_box(map.get(&k));
            }
        }));
    }

    let writer_map = map.clone();
    let writer = std::thread::spawn(move || {
        for k in n..(2 * n) {
            writer_map.put(&k, k);
        }
    });

    writer.join().unwrap();
    for r in readers {
        r.join().unwrap();
    }
}

/// The cost of crossing §4.3's load-factor threshold: insert just past the
/// point a fresh table of `initial_capacity` triggers its first migration.
fn migration_cost(guarantee: Guarantee, initial_capacity: usize) {
    let map: Map<u64, u64> = Map::with_capacity(guarantee, initial_capacity);
    let n = (initial_capacity as u64) * 2;
    for k in 0..n {
        map.put(&k, k);
    }
    black_box(map.len());
}

fn lock_free_put_get_n1000_m10(c: &mut Criterion) {
    c.bench_function("lock_free_put_get_n1000_m10", |b| {
        b.iter(|| put_get_contended(Guarantee::LockFree, black_box(1000), 10))
    });
}

fn wait_free_put_get_n1000_m10(c: &mut Criterion) {
    c.bench_function("wait_free_put_get_n1000_m10", |b| {
        b.iter(|| put_get_contended(Guarantee::WaitFree, black_box(1000), 10))
    });
}

fn lock_free_migration_cost(c: &mut Criterion) {
    c.bench_function("lock_free_migration_cost", |b| {
        b.iter(|| migration_cost(Guarantee::LockFree, black_box(64)))
    });
}

fn wait_free_migration_cost(c: &mut Criterion) {
    c.bench_function("wait_free_migration_cost", |b| {
        b.iter(|| migration_cost(Guarantee::WaitFree, black_box(64)))
    });
}

criterion_group!(
    benches,
    lock_free_put_get_n1000_m10,
    wait_free_put_get_n1000_m10,
    lock_free_migration_cost,
    wait_free_migration_cost
);
criterion_main!(benches);
