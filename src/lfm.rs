//! The Lock-Free Map (§4.4): `get`/`put`/`replace`/`add`/`remove`/`len`,
//! built directly on [`crate::store`]'s buckets and migration protocol.
//!
//! "Lock-free" here means the usual guarantee: some thread among any set of
//! concurrently operating threads always makes progress, though an
//! individual thread can be made to retry arbitrarily often by others
//! winning races against it. [`crate::wfm`] builds a wait-free map on top of
//! the same store by adding per-operation helping.

use std::sync::Arc;

use crate::hv::Hv;
use crate::record::{Info, Item};
use crate::smr::Mmm;
use crate::store::{self, CasOutcome, Slot, Store};
use crate::top::Top;

/// A lock-free hash table keyed by opaque [`Hv`] values, storing `Arc<Item<T>>`
/// items. [`crate::map::Map`]/[`crate::set::Set`] layer key-typed, owned-value
/// ergonomics on top of this.
pub struct LockFreeMap<T> {
    mmm: Arc<Mmm>,
    top: Top<T>,
    free_handler: Option<Arc<dyn Fn(T) + Send + Sync>>,
}

impl<T: Send + 'static> LockFreeMap<T> {
    pub fn new(mmm: Arc<Mmm>, initial_capacity: usize) -> LockFreeMap<T> {
        LockFreeMap {
            mmm,
            top: Top::new(initial_capacity),
            free_handler: None,
        }
    }

    /// Install a handler invoked exactly once per item, whenever the last
    /// reference to it (held by a reader, the table itself, or a helper
    /// mid-migration) is dropped (§4.1/§6 `set_cleanup_func`/`free_handler`).
    pub fn set_free_handler(&mut self, handler: Arc<dyn Fn(T) + Send + Sync>) {
        self.free_handler = Some(handler);
    }

    pub fn len(&self) -> u64 {
        self.top.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The current store's bucket count. Changes across a migration;
    /// exposed for diagnostics and for tests exercising §4.3 sizing.
    pub fn capacity(&self) -> usize {
        let _guard = self.mmm.start_basic_op();
        self.top.current().capacity()
    }

    pub(crate) fn mmm(&self) -> &Arc<Mmm> {
        &self.mmm
    }

    pub(crate) fn top(&self) -> &Top<T> {
        &self.top
    }

    /// Capture a consistent snapshot of every live entry (§4.6).
    ///
    /// The reservation has to be established *before* `self.top.current()`
    /// is read, not after: reading the guard and the store pointer in the
    /// other order would let the store we're about to walk be retired out
    /// from under us if a migration lands in between the two loads.
    pub fn view(&self, sorted: bool) -> Vec<crate::view::ViewEntry<T>> {
        let (_guard, epoch) = self.mmm.start_linearized_op();
        crate::view::snapshot_at(self.top.current(), sorted, epoch)
    }

    pub fn get(&self, hv: Hv) -> Option<Arc<Item<T>>> {
        let _guard = self.mmm.start_basic_op();
        let store = self.top.current();
        let bucket = store.find(hv)?;
        let ptr = bucket.record_ptr();
        if ptr.is_null() {
            return None;
        }
        let rec = unsafe { crate::store::Bucket::record_ref(ptr) };
        if rec.info.is_live() {
            rec.item.clone()
        } else {
            None
        }
    }

    /// Build a fresh item wrapping the container's cleanup handler, ready to
    /// hand to one of the `_item` primitives below.
    pub fn wrap(&self, value: T) -> Arc<Item<T>> {
        Item::new(value, self.free_handler.clone())
    }

    /// Unconditional insert/overwrite. Returns the previous item, if any.
    pub fn put(&self, hv: Hv, value: T) -> Option<Arc<Item<T>>> {
        let item = self.wrap(value);
        self.put_item(hv, item)
    }

    /// As [`LockFreeMap::put`], but takes an already-built item -- used by
    /// [`crate::wfm`], where the announcing thread builds the item once and
    /// any helper that ends up performing the write must install that exact
    /// `Arc`, not a fresh one.
    pub(crate) fn put_item(&self, hv: Hv, item: Arc<Item<T>>) -> Option<Arc<Item<T>>> {
        self.write(hv, |cur| {
            let epoch = reuse_or_assign_epoch(&self.top, cur);
            Some((
                Some(item.clone()),
                Info {
                    epoch,
                    moving: false,
                    moved: false,
                },
            ))
        })
        .0
    }

    /// Overwrite only if a live item already exists for `hv`. Returns the
    /// previous item on success, or `None` if there was nothing to replace.
    pub fn replace(&self, hv: Hv, value: T) -> Option<Arc<Item<T>>> {
        let item = self.wrap(value);
        self.replace_item(hv, item)
    }

    pub(crate) fn replace_item(&self, hv: Hv, item: Arc<Item<T>>) -> Option<Arc<Item<T>>> {
        let (old, found) = self.write(hv, |cur| {
            let cur = cur?;
            if !cur.info.is_live() {
                return None;
            }
            Some((
                Some(item.clone()),
                Info {
                    epoch: cur.info.epoch,
                    moving: false,
                    moved: false,
                },
            ))
        });
        found.then_some(old).flatten()
    }

    /// Insert only if no live item exists for `hv`. Returns `true` if the
    /// insert happened.
    pub fn add(&self, hv: Hv, value: T) -> bool {
        let item = self.wrap(value);
        self.add_item(hv, item)
    }

    pub(crate) fn add_item(&self, hv: Hv, item: Arc<Item<T>>) -> bool {
        let (_, found) = self.write(hv, |cur| {
            if cur.map(|r| r.info.is_live()).unwrap_or(false) {
                return None;
            }
            let epoch = reuse_or_assign_epoch(&self.top, cur);
            Some((
                Some(item.clone()),
                Info {
                    epoch,
                    moving: false,
                    moved: false,
                },
            ))
        });
        !found
    }

    /// Remove the live item for `hv`, if any. Returns the removed item.
    /// Probing never claims an empty bucket (§4.4: an empty bucket seen on
    /// probe means "not found", full stop).
    pub fn remove(&self, hv: Hv) -> Option<Arc<Item<T>>> {
        loop {
            let _guard = self.mmm.start_basic_op();
            let store = self.top.current();
            let Some(bucket) = store.find(hv) else {
                return None;
            };
            match store::cas_update(&self.mmm, bucket, |cur| {
                let cur = cur?;
                if !cur.info.is_live() {
                    return None;
                }
                Some((None, Info::NONE))
            }) {
                CasOutcome::Committed { old, found } => {
                    if found {
                        self.top.note_remove();
                    }
                    return old;
                }
                CasOutcome::Migrating => {
                    self.top.migrate_and_advance(&self.mmm, store);
                    continue;
                }
            }
        }
    }

    /// Drive the CAS-update retry loop shared by `put`/`replace`/`add`,
    /// including probe-exhaustion and in-flight-migration handling.
    ///
    /// `f` is re-evaluated on every attempt (including across a migration
    /// hop), so it must be idempotent given the same bucket state -- true of
    /// all three write operations above.
    fn write(
        &self,
        hv: Hv,
        mut f: impl FnMut(Option<&crate::record::Record<T>>) -> Option<(Option<Arc<Item<T>>>, Info)>,
    ) -> (Option<Arc<Item<T>>>, bool) {
        loop {
            let _guard = self.mmm.start_basic_op();
            let store = self.top.current();
            match store.find_or_reserve(hv) {
                Slot::Exhausted => {
                    self.top.migrate_and_advance(&self.mmm, store);
                    continue;
                }
                Slot::Found(bucket) | Slot::Reserved(bucket) => {
                    match store::cas_update(&self.mmm, bucket, &mut f) {
                        CasOutcome::Committed { old, found } => {
                            return self.finish_write(store, old, found);
                        }
                        CasOutcome::Migrating => {
                            self.top.migrate_and_advance(&self.mmm, store);
                            continue;
                        }
                    }
                }
            }
        }
    }

    fn finish_write(
        &self,
        store: &Store<T>,
        old: Option<Arc<Item<T>>>,
        previously_found: bool,
    ) -> (Option<Arc<Item<T>>>, bool) {
        if !previously_found {
            self.top.note_insert();
        }
        if store.is_over_threshold() {
            self.top.migrate_and_advance(&self.mmm, store);
        }
        (old, previously_found)
    }
}

/// A record keeps its insertion epoch across `put`/`replace` (I3); a bucket
/// that never had a live record, or is reviving from a tombstone, gets a
/// fresh one from `Top::next_epoch`.
fn reuse_or_assign_epoch<T>(top: &Top<T>, cur: Option<&crate::record::Record<T>>) -> u64 {
    match cur {
        Some(r) if r.info.is_live() => r.info.epoch,
        _ => top.next_insertion_epoch(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hv(n: u64) -> Hv {
        Hv::new(0, n)
    }

    #[test]
    fn put_then_get_roundtrips() {
        let mmm = Mmm::new();
        let m = LockFreeMap::<String>::new(mmm, 8);
        assert!(m.get(hv(1)).is_none());
        m.put(hv(1), "one".to_string());
        assert_eq!(m.get(hv(1)).as_deref().map(|s| s.as_str()), Some("one"));
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn add_does_not_overwrite() {
        let mmm = Mmm::new();
        let m = LockFreeMap::<u32>::new(mmm, 8);
        assert!(m.add(hv(1), 10));
        assert!(!m.add(hv(1), 20));
        assert_eq!(**m.get(hv(1)).unwrap(), 10);
    }

    #[test]
    fn replace_requires_existing_live_item() {
        let mmm = Mmm::new();
        let m = LockFreeMap::<u32>::new(mmm, 8);
        assert!(m.replace(hv(1), 99).is_none());
        m.put(hv(1), 1);
        assert_eq!(**m.replace(hv(1), 2).unwrap(), 1);
        assert_eq!(**m.get(hv(1)).unwrap(), 2);
    }

    #[test]
    fn remove_on_absent_key_is_a_noop() {
        let mmm = Mmm::new();
        let m = LockFreeMap::<u32>::new(mmm, 8);
        assert!(m.remove(hv(1)).is_none());
        m.put(hv(1), 1);
        assert_eq!(**m.remove(hv(1)).unwrap(), 1);
        assert!(m.get(hv(1)).is_none());
        assert_eq!(m.len(), 0);
        assert!(m.remove(hv(1)).is_none());
    }

    #[test]
    fn crossing_threshold_triggers_migration() {
        let mmm = Mmm::new();
        let m = LockFreeMap::<u32>::new(mmm, 8);
        for i in 0..7 {
            m.put(hv(i), i as u32);
        }
        // 8-bucket store has threshold 6; the 7th insert should have already
        // forced a migration to a 16-bucket store.
        assert_eq!(m.top.current().capacity(), 16);
        for i in 0..7 {
            assert_eq!(**m.get(hv(i)).unwrap(), i as u32);
        }
    }

    #[test]
    fn free_handler_fires_once_whichever_reference_drops_last() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        let mmm = Mmm::new();
        let mut m = LockFreeMap::<u32>::new(mmm, 8);
        let freed = Arc::new(AtomicUsize::new(0));
        let freed2 = freed.clone();
        m.set_free_handler(Arc::new(move |_v: u32| {
            freed2.fetch_add(1, Ordering::SeqCst);
        }));
        m.put(hv(1), 1);
        let held = m.get(hv(1));
        m.put(hv(1), 2);
        m.mmm().collect();
        // Old item still referenced by `held`: handler must not have run yet.
        assert_eq!(freed.load(Ordering::SeqCst), 0);
        drop(held);
        assert_eq!(freed.load(Ordering::SeqCst), 1);
    }
}
