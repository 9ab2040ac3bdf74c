//! The bucket array: open addressing, linear probing, and the cooperative
//! migration protocol that replaces it wholesale when it gets full.

#[cfg(loom)]
use loom::sync::{atomic, Arc};
#[cfg(not(loom))]
use std::sync::{atomic, Arc};

use atomic::{AtomicPtr, AtomicUsize, Ordering};

use crate::hv::Hv;
use crate::record::{Info, Item, Record};
use crate::smr::Mmm;

/// Below this many buckets, migration never shrinks further (§4.3).
pub const MIN_CAPACITY: usize = 8;

/// One slot in a [`Store`]. `hv` is installed exactly once (CAS from null);
/// `record` is replaced by CAS on every logical write and read by loading
/// the pointer, both backed by [`crate::record::Record`] indirection boxes
/// per §9's double-width-CAS note.
pub(crate) struct Bucket<T> {
    hv: AtomicPtr<Hv>,
    record: AtomicPtr<Record<T>>,
}

impl<T> Bucket<T> {
    fn empty() -> Self {
        Bucket {
            hv: AtomicPtr::new(std::ptr::null_mut()),
            record: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    /// The hash value installed in this bucket, if any. Once installed it
    /// never changes (I2), so dereferencing is always safe as long as the
    /// owning `Store` is still alive.
    pub(crate) fn hv(&self) -> Option<Hv> {
        let p = self.hv.load(Ordering::Acquire);
        if p.is_null() {
            None
        } else {
            Some(unsafe { *p })
        }
    }

    /// Try to claim this (currently empty) bucket for `hv`. Returns `true`
    /// if this call won the race.
    fn try_claim(&self, hv: Hv) -> bool {
        let boxed = Box::into_raw(Box::new(hv));
        match self
            .hv
            .compare_exchange(std::ptr::null_mut(), boxed, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => true,
            Err(_) => {
                // Lost the race; nobody ever observed `boxed`.
                drop(unsafe { Box::from_raw(boxed) });
                false
            }
        }
    }

    /// Raw pointer to the current record, for use by callers operating
    /// under an SMR reservation. Null means "never had a record installed."
    pub(crate) fn record_ptr(&self) -> *mut Record<T> {
        self.record.load(Ordering::Acquire)
    }

    /// # Safety
    /// `ptr` must be non-null and the caller must hold an SMR reservation
    /// covering the lifetime of the returned reference.
    pub(crate) unsafe fn record_ref<'a>(ptr: *mut Record<T>) -> &'a Record<T> {
        unsafe { &*ptr }
    }

    fn cas_record(
        &self,
        current: *mut Record<T>,
        new: *mut Record<T>,
    ) -> Result<*mut Record<T>, *mut Record<T>> {
        self.record
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
    }
}

impl<T> Drop for Bucket<T> {
    fn drop(&mut self) {
        let hv = *self.hv.get_mut();
        if !hv.is_null() {
            drop(unsafe { Box::from_raw(hv) });
        }
        let rec = *self.record.get_mut();
        if !rec.is_null() {
            drop(unsafe { Box::from_raw(rec) });
        }
    }
}

/// Outcome of probing a store for a hash value while attempting a write.
pub(crate) enum Slot<'a, T> {
    /// Bucket already carries `hv` (live or tombstoned).
    Found(&'a Bucket<T>),
    /// Freshly claimed an empty bucket for `hv`.
    Reserved(&'a Bucket<T>),
    /// Linear probing wrapped all the way around without finding an empty
    /// slot or a match: this store is full, migration is required.
    Exhausted,
}

pub(crate) struct Store<T> {
    pub(crate) last_slot: usize,
    pub(crate) threshold: usize,
    pub(crate) used_count: AtomicUsize,
    buckets: Box<[Bucket<T>]>,
    pub(crate) next: AtomicPtr<Store<T>>,
}

impl<T> Store<T> {
    pub(crate) fn with_capacity(capacity: usize) -> Box<Store<T>> {
        let capacity = capacity.max(MIN_CAPACITY).next_power_of_two();
        let buckets = (0..capacity).map(|_| Bucket::empty()).collect::<Vec<_>>();
        Box::new(Store {
            last_slot: capacity - 1,
            threshold: capacity * 3 / 4,
            used_count: AtomicUsize::new(0),
            buckets: buckets.into_boxed_slice(),
            next: AtomicPtr::new(std::ptr::null_mut()),
        })
    }

    pub(crate) fn capacity(&self) -> usize {
        self.last_slot + 1
    }

    /// Capacity of the store that should replace this one, per §4.3: double
    /// above 50% occupancy, quarter below 12.5% (but never below
    /// [`MIN_CAPACITY`]), unchanged otherwise.
    pub(crate) fn new_size(&self, live_count: usize) -> usize {
        let cap = self.capacity();
        if live_count > cap / 2 {
            cap * 2
        } else if live_count < cap / 8 && cap / 4 >= MIN_CAPACITY {
            cap / 4
        } else {
            cap.max(MIN_CAPACITY)
        }
    }

    fn probe_sequence(&self, hv: Hv) -> impl Iterator<Item = usize> + '_ {
        let start = (hv.low64() as usize) & self.last_slot;
        let cap = self.capacity();
        (0..cap).map(move |i| (start + i) & self.last_slot)
    }

    /// Read-only probe: find the bucket installed for `hv`, without
    /// claiming an empty one. Used by `get`.
    pub(crate) fn find(&self, hv: Hv) -> Option<&Bucket<T>> {
        for idx in self.probe_sequence(hv) {
            let b = &self.buckets[idx];
            match b.hv() {
                None => return None,
                Some(v) if v == hv => return Some(b),
                Some(_) => continue,
            }
        }
        None
    }

    /// Find the bucket for `hv`, claiming an empty one if no match is found
    /// along the probe sequence. Used by `put`/`replace`/`add`/`remove`.
    pub(crate) fn find_or_reserve(&self, hv: Hv) -> Slot<'_, T> {
        for idx in self.probe_sequence(hv) {
            let b = &self.buckets[idx];
            loop {
                match b.hv() {
                    None => {
                        if b.try_claim(hv) {
                            let used = self.used_count.fetch_add(1, Ordering::AcqRel) + 1;
                            if used >= self.threshold {
                                tracing::debug!(used, threshold = self.threshold, "store at migration threshold");
                            }
                            return Slot::Reserved(b);
                        }
                        // Someone else claimed it; re-check what they put there.
                        continue;
                    }
                    Some(v) if v == hv => return Slot::Found(b),
                    Some(_) => break,
                }
            }
        }
        Slot::Exhausted
    }

    pub(crate) fn is_over_threshold(&self) -> bool {
        self.used_count.load(Ordering::Acquire) >= self.threshold
    }

    pub(crate) fn iter_buckets(&self) -> impl Iterator<Item = &Bucket<T>> {
        self.buckets.iter()
    }
}

/// The commit outcome of a CAS-based record update: either it succeeded, or
/// it failed because the bucket is mid-migration and the caller must help
/// finish migrating before retrying in the successor store.
pub(crate) enum CasOutcome<T> {
    Committed {
        old: Option<Arc<Item<T>>>,
        found: bool,
    },
    Migrating,
}

/// Perform one CAS attempt mutating `bucket`'s record per `f`, retrying
/// through benign loser outcomes (another thread installed the exact same
/// logical state we were about to) but bailing out to `CasOutcome::Migrating`
/// the moment `MOVING` is observed.
///
/// `f` receives the current `Info`/item (or `None` if the bucket has never
/// had a record) and returns the new `(item, info)` to install, or `None` to
/// decline (used by `add`, which must not touch an existing live record, and
/// by `replace`, which must not touch a missing one).
///
/// The superseded record's indirection box is retired through `mmm` as
/// usual; whatever cleanup is owed to the item it held runs from
/// [`crate::record::Item`]'s own `Drop`, not from here -- see that type's
/// docs for why.
pub(crate) fn cas_update<T: Send + 'static>(
    mmm: &Mmm,
    bucket: &Bucket<T>,
    mut f: impl FnMut(Option<&Record<T>>) -> Option<(Option<Arc<Item<T>>>, Info)>,
) -> CasOutcome<T> {
    loop {
        let cur_ptr = bucket.record_ptr();
        let cur_ref = if cur_ptr.is_null() {
            None
        } else {
            Some(unsafe { Bucket::record_ref(cur_ptr) })
        };

        if let Some(r) = cur_ref {
            if r.info.moving {
                return CasOutcome::Migrating;
            }
        }

        let found = cur_ref.map(|r| r.info.is_live()).unwrap_or(false);
        let old = cur_ref.and_then(|r| r.item.clone());

        let Some((new_item, new_info)) = f(cur_ref) else {
            return CasOutcome::Committed { old, found };
        };

        let write_epoch = mmm.commit_epoch();
        // Link back to the record being superseded (null on a bucket's
        // first-ever write) so a snapshot captured before this write can
        // still walk back to what the bucket held then -- see
        // `Record::prev` and `crate::view::snapshot_at`.
        let new_box = Box::into_raw(Record::new(new_item, new_info, write_epoch, cur_ptr));

        match bucket.cas_record(cur_ptr, new_box) {
            Ok(_) => {
                if !cur_ptr.is_null() {
                    unsafe { mmm.retire(cur_ptr) };
                }
                return CasOutcome::Committed { old, found };
            }
            Err(_) => {
                // Someone else won; free our unused proposal and retry.
                drop(unsafe { Box::from_raw(new_box) });
                continue;
            }
        }
    }
}

// ---------------------------------------------------------------------
// Migration (§4.3)
// ---------------------------------------------------------------------

/// Phase A: CAS every bucket's record to set `MOVING` (and `MOVED` too, if
/// it held no live item -- nothing to copy). Convergent: flag writes are
/// monotone, so any number of helpers racing this loop reach the same
/// fixed point.
fn freeze<T>(mmm: &Mmm, store: &Store<T>) {
    for bucket in store.iter_buckets() {
        loop {
            let cur_ptr = bucket.record_ptr();
            if cur_ptr.is_null() {
                // Never had a record: nothing to freeze, and `find_or_reserve`
                // in the successor will just treat it as never-inserted.
                break;
            }
            let cur = unsafe { Bucket::record_ref(cur_ptr) };
            if cur.info.moving {
                break;
            }
            let mut info = cur.info;
            info.moving = true;
            if !info.is_live() {
                info.moved = true;
            }
            let write_epoch = cur.write_epoch;
            // Flag-only rewrite, not a new logical version: nothing in
            // `(item, info.epoch, write_epoch)` changes, so there's nothing
            // a snapshot walk would need to recover by chaining back to it.
            let new_box = Box::into_raw(Record::new(
                cur.item.clone(),
                info,
                write_epoch,
                std::ptr::null_mut(),
            ));
            match bucket.cas_record(cur_ptr, new_box) {
                Ok(_) => {
                    unsafe { mmm.retire(cur_ptr) };
                    break;
                }
                Err(_) => {
                    drop(unsafe { Box::from_raw(new_box) });
                    continue;
                }
            }
        }
    }
}

/// Phase B: race to install the successor store. The loser's proposal was
/// never published anywhere else, so it's freed immediately rather than
/// deferred through SMR.
fn install_successor<T>(mmm: &Mmm, store: &Store<T>, live_count: usize) -> *mut Store<T> {
    let proposal = Box::into_raw(Store::with_capacity(store.new_size(live_count)));
    match store
        .next
        .compare_exchange(std::ptr::null_mut(), proposal, Ordering::AcqRel, Ordering::Acquire)
    {
        Ok(_) => proposal,
        Err(existing) => {
            unsafe { mmm.retire_unused(proposal) };
            existing
        }
    }
}

/// Phase C: copy every live, not-yet-moved bucket from `store` into
/// `successor`.
fn copy_into<T>(mmm: &Mmm, store: &Store<T>, successor: &Store<T>) {
    for bucket in store.iter_buckets() {
        let cur_ptr = bucket.record_ptr();
        if cur_ptr.is_null() {
            continue;
        }
        let cur = unsafe { Bucket::record_ref(cur_ptr) };
        if !cur.info.moving || cur.info.moved {
            continue;
        }
        let Some(hv) = bucket.hv() else {
            continue;
        };

        if cur.info.is_live() {
            match successor.find_or_reserve(hv) {
                Slot::Reserved(dest) | Slot::Found(dest) => {
                    let dest_ptr = dest.record_ptr();
                    if dest_ptr.is_null() {
                        // A fresh bucket in a different store: no
                        // predecessor to chain to in the successor's own
                        // version history (see the module note on
                        // cross-migration history in `crate::view`).
                        let new_box = Box::into_raw(Record::new(
                            cur.item.clone(),
                            cur.info,
                            cur.write_epoch,
                            std::ptr::null_mut(),
                        ));
                        if dest.cas_record(std::ptr::null_mut(), new_box).is_err() {
                            // Another helper already installed it: success either way.
                            drop(unsafe { Box::from_raw(new_box) });
                        }
                    }
                    // else: already installed by a racing helper, also success.
                }
                Slot::Exhausted => {
                    // The successor was sized for the live count we observed
                    // when it was allocated; a concurrent helper growing the
                    // live set further than expected would be a sizing bug,
                    // not a condition callers can recover from mid-migration.
                    crate::error::fatal("migration successor exhausted during copy");
                }
            }
        }

        // Mark source as moved, preserving whatever `info` is current.
        loop {
            let cur_ptr = bucket.record_ptr();
            let cur = unsafe { Bucket::record_ref(cur_ptr) };
            if cur.info.moved {
                break;
            }
            let mut info = cur.info;
            info.moved = true;
            let new_box = Box::into_raw(Record::new(
                cur.item.clone(),
                info,
                cur.write_epoch,
                std::ptr::null_mut(),
            ));
            match bucket.cas_record(cur_ptr, new_box) {
                Ok(_) => {
                    unsafe { mmm.retire(cur_ptr) };
                    break;
                }
                Err(_) => drop(unsafe { Box::from_raw(new_box) }),
            }
        }
    }
}

/// Run (or help complete) a full migration of `store`, returning a raw
/// pointer to the successor store. Any number of threads may call this
/// concurrently; the protocol converges regardless of interleaving.
pub(crate) fn migrate<T>(mmm: &Mmm, store: &Store<T>) -> *mut Store<T> {
    // Politeness: if a successor is already installed, this helper can
    // yield briefly in case the current thread is about to finish the job
    // unaided -- purely a throughput knob, never required for correctness.
    if !store.next.load(Ordering::Acquire).is_null() {
        for _ in 0..2 {
            #[cfg(loom)]
            loom::thread::yield_now();
            #[cfg(not(loom))]
            std::thread::yield_now();
            let n = store.next.load(Ordering::Acquire);
            if !n.is_null() {
                // still here; fall through to help copy.
            }
        }
    }

    freeze(mmm, store);

    let live_count = store
        .iter_buckets()
        .filter(|b| {
            let p = b.record_ptr();
            !p.is_null() && unsafe { Bucket::record_ref(p) }.info.is_live()
        })
        .count();

    let successor_ptr = install_successor(mmm, store, live_count);
    let successor = unsafe { &*successor_ptr };

    copy_into(mmm, store, successor);

    let observed_used = successor.used_count.load(Ordering::Acquire);
    if observed_used == 0 && live_count > 0 {
        let _ = successor
            .used_count
            .compare_exchange(0, live_count, Ordering::AcqRel, Ordering::Acquire);
    }

    successor_ptr
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hv::Hv;

    #[test]
    fn new_size_grows_and_shrinks() {
        let s = Store::<u32>::with_capacity(8);
        assert_eq!(s.new_size(5), 16); // > 50% of 8
        assert_eq!(s.new_size(4), 8); // exactly 50%, unchanged
        assert_eq!(s.new_size(0), 8); // below 12.5% but capacity/4 < MIN_CAPACITY
    }

    #[test]
    fn claim_then_find() {
        let s = Store::<u32>::with_capacity(8);
        let hv = Hv::new(0, 42);
        match s.find_or_reserve(hv) {
            Slot::Reserved(_) => {}
            _ => panic!("expected reservation"),
        }
        assert!(s.find(hv).is_some());
        assert!(s.find(Hv::new(0, 43)).is_none());
    }
}
