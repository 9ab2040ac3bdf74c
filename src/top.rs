//! `Top`: the stable header shared by the lock-free and wait-free map
//! variants -- the current store pointer, the published item count, and the
//! monotonic epoch counter used to stamp new insertions.

#[cfg(loom)]
use loom::sync::atomic;
#[cfg(not(loom))]
use std::sync::atomic;

use atomic::{AtomicI64, AtomicPtr, AtomicU64, Ordering};

use crate::smr::Mmm;
use crate::store::{self, Store};

pub(crate) struct Top<T> {
    store_current: AtomicPtr<Store<T>>,
    item_count: AtomicI64,
    next_epoch: AtomicU64,
}

impl<T> Top<T> {
    pub(crate) fn new(initial_capacity: usize) -> Top<T> {
        Top {
            store_current: AtomicPtr::new(Box::into_raw(Store::with_capacity(initial_capacity))),
            item_count: AtomicI64::new(0),
            next_epoch: AtomicU64::new(0),
        }
    }

    /// Load the current store. The returned reference is valid for as long
    /// as the caller's SMR reservation (it is the caller's job to be
    /// holding one -- see `crate::smr::Mmm::start_basic_op`).
    pub(crate) fn current<'a>(&self) -> &'a Store<T> {
        unsafe { &*self.store_current.load(Ordering::Acquire) }
    }

    pub(crate) fn len(&self) -> u64 {
        self.item_count.load(Ordering::Relaxed).max(0) as u64
    }

    pub(crate) fn note_insert(&self) {
        self.item_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_remove(&self) {
        self.item_count.fetch_sub(1, Ordering::Relaxed);
    }

    /// Assign the next monotonic insertion epoch (`Top::next_epoch` in §3),
    /// preserved across migrations because it lives here, not in any
    /// `Store`.
    pub(crate) fn next_insertion_epoch(&self) -> u64 {
        self.next_epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drive (or help finish) migrating `store`, then publish its successor
    /// as the current store if nobody has done so yet. Exactly one helper
    /// wins the publish CAS and retires the old store; everyone else's call
    /// is a harmless no-op (§4.3 Phase D).
    pub(crate) fn migrate_and_advance(&self, mmm: &Mmm, store: &Store<T>) {
        let successor_ptr = store::migrate(mmm, store);
        let store_ptr = store as *const Store<T> as *mut Store<T>;
        if self
            .store_current
            .compare_exchange(store_ptr, successor_ptr, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            unsafe { mmm.retire(store_ptr) };
        }
    }
}

impl<T> Drop for Top<T> {
    fn drop(&mut self) {
        let p = *self.store_current.get_mut();
        if !p.is_null() {
            drop(unsafe { Box::from_raw(p) });
        }
    }
}
