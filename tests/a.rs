//! Integration tests reproducing the concrete scenarios from the
//! concurrent-engine's worked examples: literal expected outputs under both
//! single-threaded and concurrent use, covering the lock-free and
//! wait-free map/set engines through their public `Map`/`Set` surface.

use hatchet::{Guarantee, Map, Set};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

// Scenario 1: fresh map, int keys.
//   put(1,"a"); put(2,"b"); put(1,"c");
//   items() (sorted by epoch) = [(1,"c"),(2,"b")]; len = 2.
#[test]
fn scenario_1_fresh_map_int_keys() {
    let m: Map<u64, &'static str> = Map::new(Guarantee::LockFree);
    m.put(&1, "a");
    m.put(&2, "b");
    m.put(&1, "c");

    assert_eq!(m.len(), 2);
    let items = m.items(true);
    assert_eq!(items.len(), 2);
    assert_eq!(*items[0].key(), 1);
    assert_eq!(*items[0], "c"); // key 1, still holds its original epoch
    assert_eq!(*items[1].key(), 2);
    assert_eq!(*items[1], "b"); // key 2, inserted after key 1
}

// Scenario 2: migration trigger.
//   capacity = 8; insert keys {0..6} (7 >= 75% of 8).
//   After the 7th insert, capacity doubles to 16, all seven keys are still
//   present, and len == 7.
#[test]
fn scenario_2_migration_trigger() {
    let m: Map<u64, u64> = Map::with_capacity(Guarantee::LockFree, 8);
    assert_eq!(m.capacity(), 8);
    for k in 0..7u64 {
        m.put(&k, k);
    }
    assert_eq!(m.capacity(), 16);
    assert_eq!(m.len(), 7);
    for k in 0..7u64 {
        assert_eq!(*m.get(&k).unwrap(), k);
    }
}

// Scenario 3: concurrent `add` race.
//   Two threads call add(k, v1) and add(k, v2). Exactly one returns true;
//   the other returns false; get(k) matches the winner.
#[test]
fn scenario_3_concurrent_add_race() {
    for _ in 0..50 {
        let m: Arc<Map<u64, u32>> = Arc::new(Map::new(Guarantee::LockFree));
        let barrier = Arc::new(Barrier::new(2));

        let m1 = m.clone();
        let b1 = barrier.clone();
        let t1 = thread::spawn(move || {
            b1.wait();
            m1.add(&1, 10)
        });

        let m2 = m.clone();
        let b2 = barrier.clone();
        let t2 = thread::spawn(move || {
            b2.wait();
            m2.add(&1, 20)
        });

        let r1 = t1.join().unwrap();
        let r2 = t2.join().unwrap();

        assert_ne!(r1, r2, "exactly one add should win");
        let winner_value = if r1 { 10 } else { 20 };
        assert_eq!(*m.get(&1).unwrap(), winner_value);
        assert_eq!(m.len(), 1);
    }
}

// Scenario 4: set equality under mutation.
//   S1 = {1,2,3}, S2 = {3,2,1}.
//   is_eq(S1,S2) = true, is_superset(S1,S2,proper) = false,
//   is_superset(S1,S2,false) = true.
#[test]
fn scenario_4_set_equality_under_mutation() {
    let s1: Set<u32> = Set::new(Guarantee::LockFree);
    let s2: Set<u32> = Set::new(Guarantee::LockFree);
    for x in [1, 2, 3] {
        s1.insert(x);
    }
    for x in [3, 2, 1] {
        s2.insert(x);
    }

    assert!(s1.is_eq(&s2));
    assert!(!s1.is_superset_of(&s2, true)); // equal sets: no proper superset
    assert!(s1.is_superset_of(&s2, false));
    assert!(s1.is_subset_of(&s2, false));
}

// Scenario 5: union preserves insertion order.
//   A inserts 1,2,3; B inserts 3,4,5 (globally later).
//   union(A,B).items(sort=epoch) = [1,2,3,4,5].
#[test]
fn scenario_5_union_preserves_insertion_order() {
    let a: Set<u32> = Set::new(Guarantee::LockFree);
    let b: Set<u32> = Set::new(Guarantee::LockFree);
    for x in [1, 2, 3] {
        a.insert(x);
    }
    for x in [3, 4, 5] {
        b.insert(x);
    }

    let u = a.union(&b, Guarantee::LockFree);
    let order: Vec<u32> = u.items(true).into_iter().map(|v| *v).collect();
    assert_eq!(order, vec![1, 2, 3, 4, 5]);
}

// Scenario 6: intersection snapshot linearizability.
//   Thread X repeatedly put/removes key 42 on A; thread Y computes
//   intersection(A,B) where 42 is a member of B. Every computed result
//   must be consistent with *some* instant: 42 shows up in the result only
//   if it was live in A at that instant, and every other element of the
//   result is a genuine, stable member of both sides.
#[test]
fn scenario_6_intersection_snapshot_linearizability() {
    let a: Arc<Set<u32>> = Arc::new(Set::new(Guarantee::LockFree));
    let b: Arc<Set<u32>> = Arc::new(Set::new(Guarantee::LockFree));
    for x in [1, 2, 3] {
        a.insert(x);
        b.insert(x);
    }
    b.insert(42);

    let stop = Arc::new(AtomicBool::new(false));

    let a_writer = a.clone();
    let stop_writer = stop.clone();
    let writer = thread::spawn(move || {
        while !stop_writer.load(Ordering::Relaxed) {
            a_writer.insert(42);
            a_writer.remove(&42);
        }
    });

    let mut saw_with_42 = false;
    let mut saw_without_42 = false;
    for _ in 0..2000 {
        let result = a.intersection(&b, Guarantee::LockFree);
        // The stable elements must always be present.
        assert!(result.contains(&1));
        assert!(result.contains(&2));
        assert!(result.contains(&3));
        if result.contains(&42) {
            saw_with_42 = true;
        } else {
            saw_without_42 = true;
        }
        assert_eq!(
            result.len(),
            if result.contains(&42) { 4 } else { 3 },
            "intersection must not contain stray elements"
        );
    }

    stop.store(true, Ordering::Relaxed);
    writer.join().unwrap();

    // With 2000 samples against a tight put/remove loop we expect to
    // observe both states; if every sample came back the same way, the
    // snapshot mechanism (or this test) isn't exercising the race at all.
    assert!(saw_with_42, "never observed 42 present across 2000 samples");
    assert!(saw_without_42, "never observed 42 absent across 2000 samples");
}

// P1/no-lost-insertion smoke test: many concurrent `add`s of distinct keys
// must all be observable afterwards, with no duplicated or missing epoch.
#[test]
fn no_lost_insertion_under_contended_writes() {
    let m: Arc<Map<u64, u32>> = Arc::new(Map::with_capacity(Guarantee::LockFree, 8));
    let n_threads = 8u64;
    let per_thread = 200u64;
    let barrier = Arc::new(Barrier::new(n_threads as usize));

    let handles: Vec<_> = (0..n_threads)
        .map(|t| {
            let m = m.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                for i in 0..per_thread {
                    let key = t * per_thread + i;
                    assert!(m.add(&key, key as u32));
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(m.len(), n_threads * per_thread);
    for t in 0..n_threads {
        for i in 0..per_thread {
            let key = t * per_thread + i;
            assert_eq!(*m.get(&key).unwrap(), key as u32);
        }
    }
}

// Wait-free backend should behave identically under the same workload.
#[test]
fn wait_free_map_matches_lock_free_semantics() {
    let m: Arc<Map<u64, u32>> = Arc::new(Map::with_capacity(Guarantee::WaitFree, 8));
    let n_threads = 6u64;
    let barrier = Arc::new(Barrier::new(n_threads as usize));
    let successes = Arc::new(AtomicU32::new(0));

    let handles: Vec<_> = (0..n_threads)
        .map(|_| {
            let m = m.clone();
            let barrier = barrier.clone();
            let successes = successes.clone();
            thread::spawn(move || {
                barrier.wait();
                if m.add(&7, 7) {
                    successes.fetch_add(1, Ordering::SeqCst);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(successes.load(Ordering::SeqCst), 1);
    assert_eq!(*m.get(&7).unwrap(), 7);
}

// Round-trip laws from the testable-properties section.
#[test]
fn round_trip_laws() {
    let m: Map<u64, u32> = Map::new(Guarantee::LockFree);
    m.put(&1, 10);
    assert_eq!(*m.get(&1).unwrap(), 10);

    assert!(m.add(&2, 20));
    assert!(!m.add(&2, 99));
    assert_eq!(*m.get(&2).unwrap(), 20);

    m.put(&3, 30);
    m.remove(&3);
    assert!(m.get(&3).is_none());
}
