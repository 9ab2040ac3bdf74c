//! Reclamation correctness: the free handler installed via
//! `Map::set_free_handler` must run exactly once per value, exactly when
//! the last reference anywhere (a live reader's handle, the table's own
//! bucket, or a just-superseded record awaiting SMR collection) is
//! dropped -- never before, never twice.

use hatchet::{Guarantee, Map};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[test]
fn no_leak_overwrite_retires_old_value_once_unreferenced() {
    let freed = Arc::new(AtomicUsize::new(0));
    let mut m: Map<u64, u32> = Map::new(Guarantee::LockFree);
    let f = freed.clone();
    m.set_free_handler(Arc::new(move |_v: u32| {
        f.fetch_add(1, Ordering::SeqCst);
    }));

    m.put(&1, 10);
    let held = m.get(&1); // readers keep the old value alive past overwrite
    m.put(&1, 20);
    m.collect_garbage();
    assert_eq!(freed.load(Ordering::SeqCst), 0, "held reference must block reclamation");

    drop(held);
    m.collect_garbage();
    assert_eq!(freed.load(Ordering::SeqCst), 1, "released reference must trigger exactly one free");
}

#[test]
fn no_leak_removed_value_is_eventually_freed() {
    let freed = Arc::new(AtomicUsize::new(0));
    let mut m: Map<u64, u32> = Map::new(Guarantee::LockFree);
    let f = freed.clone();
    m.set_free_handler(Arc::new(move |_v: u32| {
        f.fetch_add(1, Ordering::SeqCst);
    }));

    m.put(&1, 10);
    m.remove(&1);
    m.collect_garbage();
    assert_eq!(freed.load(Ordering::SeqCst), 1);
}

#[test]
fn no_leak_every_value_freed_exactly_once_under_churn() {
    let freed = Arc::new(AtomicUsize::new(0));
    let mut m: Map<u64, u32> = Map::new(Guarantee::LockFree);
    let f = freed.clone();
    m.set_free_handler(Arc::new(move |_v: u32| {
        f.fetch_add(1, Ordering::SeqCst);
    }));

    let rounds = 200u32;
    for v in 0..rounds {
        m.put(&1, v);
    }
    m.remove(&1);
    m.collect_garbage();

    // Every value installed at key 1 (all `rounds` of them, since each
    // `put` supersedes the last) must eventually be freed exactly once.
    assert_eq!(freed.load(Ordering::SeqCst), rounds as usize);
}

#[test]
fn no_leak_survives_migration() {
    let freed = Arc::new(AtomicUsize::new(0));
    let mut m: Map<u64, u32> = Map::with_capacity(Guarantee::LockFree, 8);
    let f = freed.clone();
    m.set_free_handler(Arc::new(move |_v: u32| {
        f.fetch_add(1, Ordering::SeqCst);
    }));

    for k in 0..7u64 {
        m.put(&k, k as u32);
    }
    // Triggered at least one migration; every key should still resolve to
    // its own value, and nothing should have been freed while still live.
    for k in 0..7u64 {
        assert_eq!(*m.get(&k).unwrap(), k as u32);
    }
    assert_eq!(freed.load(Ordering::SeqCst), 0);

    for k in 0..7u64 {
        m.remove(&k);
    }
    m.collect_garbage();
    assert_eq!(freed.load(Ordering::SeqCst), 7);
}
