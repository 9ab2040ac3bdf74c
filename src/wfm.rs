//! The Wait-Free Map (§4.5): the same `get`/`put`/`replace`/`add`/`remove`
//! surface as [`crate::lfm::LockFreeMap`], but with a bounded-step guarantee
//! even for the thread that loses every race.
//!
//! `get` stays exactly as lock-free as the underlying map -- reads never
//! need another thread's cooperation. Writes go through an announce-and-help
//! protocol: before waiting on its own write, every thread first walks the
//! registry of currently announced requests from *other* threads and
//! completes any that are still outstanding. Because every live thread does
//! this, no single announced request can be skipped more than once per other
//! live thread before someone finishes it, bounding the number of steps a
//! writer can be made to wait regardless of how the lock-free retry loop
//! underneath behaves.
//!
//! The announcement itself (a [`HelpSlot`]) is published through an
//! `AtomicPtr` and polled purely through atomic loads and a single
//! compare-exchange that decides which helper's (redundant but idempotent)
//! attempt gets to publish the result -- no thread ever blocks on a lock or
//! condition variable while a request is outstanding (§5). The mailbox
//! *registry* (which thread owns which slot) still grows behind an ordinary
//! `Mutex`: new mailboxes are created far less often than they're polled,
//! and that admission path is exactly the kind of rare, short critical
//! section the SMR registry (`crate::smr`) also guards with a plain mutex.

use std::sync::atomic::{AtomicPtr, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use slab::Slab;

use crate::hv::Hv;
use crate::lfm::LockFreeMap;
use crate::record::Item;
use crate::smr::Mmm;

type OpResult<T> = (Option<Arc<Item<T>>>, bool);

enum OpKind<T> {
    Put(Arc<Item<T>>),
    Replace(Arc<Item<T>>),
    Add(Arc<Item<T>>),
    Remove,
}

/// An announced request. Read-only once published: `kind`/`hv` never change
/// after a `HelpSlot` is installed into a [`Mailbox`], so any thread that
/// loads the pointer may read them without further synchronization beyond
/// the `Acquire` load that handed them the pointer.
struct HelpSlot<T: Send> {
    hv: Hv,
    kind: OpKind<T>,
    /// `PENDING` -> `CLAIMED` -> `DONE`. The compare-exchange from `PENDING`
    /// to `CLAIMED` picks exactly one winner to publish `result`; everyone
    /// else's redundant execution of the same (idempotent) operation is
    /// simply discarded. `DONE` is stored only after `result` is written, so
    /// any reader observing `DONE` via an `Acquire` load is guaranteed to see
    /// that write.
    state: AtomicU8,
    result: std::cell::UnsafeCell<Option<OpResult<T>>>,
}

const PENDING: u8 = 0;
const CLAIMED: u8 = 1;
const DONE: u8 = 2;

// `UnsafeCell` is never `Sync` on its own. Only one thread ever writes
// `result` (the compare-exchange winner in `try_publish`, gated by `state`),
// and only the submitting thread ever reads it (after observing `DONE`),
// so sharing a `&HelpSlot<T>` across threads is sound whenever `T: Send`.
unsafe impl<T: Send> Sync for HelpSlot<T> {}

impl<T: Send> HelpSlot<T> {
    fn new(hv: Hv, kind: OpKind<T>) -> HelpSlot<T> {
        HelpSlot {
            hv,
            kind,
            state: AtomicU8::new(PENDING),
            result: std::cell::UnsafeCell::new(None),
        }
    }

    fn is_done(&self) -> bool {
        self.state.load(Ordering::Acquire) == DONE
    }

    /// Attempt to publish `result` as this slot's outcome. Returns `true` if
    /// this call's result is the one that won; a losing caller's own
    /// execution already took effect on the underlying map and is otherwise
    /// discarded.
    fn try_publish(&self, result: OpResult<T>) -> bool {
        if self
            .state
            .compare_exchange(PENDING, CLAIMED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            unsafe { *self.result.get() = Some(result) };
            self.state.store(DONE, Ordering::Release);
            true
        } else {
            false
        }
    }

    /// Take the published result. Only ever called by the submitting thread
    /// after observing [`HelpSlot::is_done`].
    fn take_result(&self) -> OpResult<T> {
        unsafe { (*self.result.get()).take() }.expect("result missing after state reached DONE")
    }
}

/// One slot in the announce table. A thread holds at most one outstanding
/// request at a time: null means no request is currently announced.
struct Mailbox<T: Send> {
    current: AtomicPtr<HelpSlot<T>>,
}

impl<T: Send> Drop for Mailbox<T> {
    fn drop(&mut self) {
        // Quiescent by the same contract as `Mmm::drop`: anything still
        // announced here belongs to a request nobody is waiting on anymore.
        let p = *self.current.get_mut();
        if !p.is_null() {
            drop(unsafe { Box::from_raw(p) });
        }
    }
}

pub struct WaitFreeMap<T: Send + 'static> {
    inner: LockFreeMap<T>,
    mailboxes: Mutex<Slab<Arc<Mailbox<T>>>>,
}

thread_local! {
    // Maps a `WaitFreeMap`'s address to this thread's mailbox within it.
    static OWN_MAILBOX: std::cell::RefCell<Vec<(usize, usize)>> = std::cell::RefCell::new(Vec::new());
}

impl<T: Send + Sync + 'static> WaitFreeMap<T> {
    pub fn new(mmm: Arc<Mmm>, initial_capacity: usize) -> WaitFreeMap<T> {
        WaitFreeMap {
            inner: LockFreeMap::new(mmm, initial_capacity),
            mailboxes: Mutex::new(Slab::new()),
        }
    }

    pub fn set_free_handler(&mut self, handler: Arc<dyn Fn(T) + Send + Sync>) {
        self.inner.set_free_handler(handler);
    }

    pub fn len(&self) -> u64 {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    pub(crate) fn mmm(&self) -> &Arc<Mmm> {
        self.inner.mmm()
    }

    pub fn get(&self, hv: Hv) -> Option<Arc<Item<T>>> {
        self.inner.get(hv)
    }

    /// Capture a consistent snapshot of every live entry (§4.6).
    pub fn view(&self, sorted: bool) -> Vec<crate::view::ViewEntry<T>> {
        self.inner.view(sorted)
    }

    pub fn put(&self, hv: Hv, value: T) -> Option<Arc<Item<T>>> {
        let item = self.inner.wrap(value);
        self.submit(hv, OpKind::Put(item)).0
    }

    pub fn replace(&self, hv: Hv, value: T) -> Option<Arc<Item<T>>> {
        let item = self.inner.wrap(value);
        let (old, found) = self.submit(hv, OpKind::Replace(item));
        found.then_some(old).flatten()
    }

    pub fn add(&self, hv: Hv, value: T) -> bool {
        let item = self.inner.wrap(value);
        self.submit(hv, OpKind::Add(item)).1
    }

    pub fn remove(&self, hv: Hv) -> Option<Arc<Item<T>>> {
        self.submit(hv, OpKind::Remove).0
    }

    /// Install an already-built item directly, bypassing the announce/help
    /// protocol. Used only to populate a freshly constructed map/set that no
    /// other thread can yet observe (e.g. a set-algebra result) -- not
    /// exposed as part of the ordinary wait-free write surface.
    pub(crate) fn add_item(&self, hv: Hv, item: Arc<Item<T>>) -> bool {
        self.inner.add_item(hv, item)
    }

    fn my_mailbox(&self) -> Arc<Mailbox<T>> {
        let key = self as *const WaitFreeMap<T> as usize;
        OWN_MAILBOX.with(|cache| {
            let mut cache = cache.borrow_mut();
            if let Some((_, idx)) = cache.iter().find(|(k, _)| *k == key) {
                let reg = self.mailboxes.lock().unwrap_or_else(|e| e.into_inner());
                return reg[*idx].clone();
            }
            let mailbox = Arc::new(Mailbox {
                current: AtomicPtr::new(std::ptr::null_mut()),
            });
            let idx = {
                let mut reg = self.mailboxes.lock().unwrap_or_else(|e| e.into_inner());
                reg.insert(mailbox.clone())
            };
            cache.push((key, idx));
            mailbox
        })
    }

    /// Announce `kind` against `hv`, then repeatedly help every outstanding
    /// request along (including, incidentally, this one) until it's done.
    ///
    /// The whole announce/poll loop runs under a single SMR reservation: a
    /// `HelpSlot` is reclaimed through the same `Mmm` the underlying map
    /// uses, retired (not freed outright) once this thread consumes its
    /// result, so a helper on another thread that is mid-`service` against
    /// this exact slot can never observe it freed out from under it.
    fn submit(&self, hv: Hv, kind: OpKind<T>) -> OpResult<T> {
        let mailbox = self.my_mailbox();
        let slot_ptr = Box::into_raw(Box::new(HelpSlot::new(hv, kind)));
        mailbox.current.store(slot_ptr, Ordering::Release);

        let _guard = self.inner.mmm().start_basic_op();
        let slot = unsafe { &*slot_ptr };
        loop {
            self.help_round();
            if slot.is_done() {
                break;
            }
            std::thread::yield_now();
        }
        let result = slot.take_result();
        mailbox
            .current
            .store(std::ptr::null_mut(), Ordering::Release);
        unsafe { self.inner.mmm().retire(slot_ptr) };
        result
    }

    fn help_round(&self) {
        let snapshot: Vec<Arc<Mailbox<T>>> = {
            let reg = self.mailboxes.lock().unwrap_or_else(|e| e.into_inner());
            reg.iter().map(|(_, m)| m.clone()).collect()
        };
        for mailbox in &snapshot {
            self.service(mailbox);
        }
    }

    /// Perform `mailbox`'s outstanding request, if any and if nobody has
    /// completed it yet. Safe to call redundantly, including against this
    /// thread's own mailbox: the first caller to win [`HelpSlot::try_publish`]
    /// is the one whose result is reported back, everyone else's identical
    /// (idempotent) execution of the same operation is simply discarded.
    fn service(&self, mailbox: &Mailbox<T>) {
        let ptr = mailbox.current.load(Ordering::Acquire);
        if ptr.is_null() {
            return;
        }
        // Safety: the submitter retires (never frees outright) a `HelpSlot`
        // only after clearing `mailbox.current`, and only through the same
        // `Mmm` this call's reservation (held by our caller, `submit`) is
        // registered against, so a pointer observed here stays valid for the
        // lifetime of that reservation.
        let slot = unsafe { &*ptr };
        if slot.is_done() {
            return;
        }
        let result = match &slot.kind {
            OpKind::Put(item) => (self.inner.put_item(slot.hv, item.clone()), true),
            OpKind::Replace(item) => {
                let old = self.inner.replace_item(slot.hv, item.clone());
                (old.clone(), old.is_some())
            }
            OpKind::Add(item) => {
                let inserted = self.inner.add_item(slot.hv, item.clone());
                (None, inserted)
            }
            OpKind::Remove => {
                let old = self.inner.remove(slot.hv);
                let found = old.is_some();
                (old, found)
            }
        };
        slot.try_publish(result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;

    fn hv(n: u64) -> Hv {
        Hv::new(0, n)
    }

    #[test]
    fn put_then_get_roundtrips() {
        let mmm = Mmm::new();
        let m = WaitFreeMap::<u32>::new(mmm, 8);
        m.put(hv(1), 10);
        assert_eq!(**m.get(hv(1)).unwrap(), 10);
        assert_eq!(m.len(), 1);
    }

    #[test]
    fn add_does_not_overwrite() {
        let mmm = Mmm::new();
        let m = WaitFreeMap::<u32>::new(mmm, 8);
        assert!(m.add(hv(1), 1));
        assert!(!m.add(hv(1), 2));
        assert_eq!(**m.get(hv(1)).unwrap(), 1);
    }

    #[test]
    fn concurrent_writers_all_observe_their_own_insert() {
        let mmm = Mmm::new();
        let m = Arc::new(WaitFreeMap::<u32>::new(mmm, 8));
        let n = 8;
        let barrier = Arc::new(Barrier::new(n));
        let handles: Vec<_> = (0..n as u64)
            .map(|i| {
                let m = m.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    m.put(hv(i), i as u32);
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(m.len(), n as u64);
        for i in 0..n as u64 {
            assert_eq!(**m.get(hv(i)).unwrap(), i as u32);
        }
    }

    #[test]
    fn writer_completes_while_another_thread_is_stalled_mid_service() {
        // Regression guard for the announce/help path itself never blocking
        // on a lock: even if some other thread's helping pass is arbitrarily
        // slow, a writer's own `submit` loop keeps calling `help_round`
        // (including against its own mailbox) and terminates once its
        // request is done, rather than waiting on a condition variable that
        // only the stalled thread could have signaled.
        let mmm = Mmm::new();
        let m = Arc::new(WaitFreeMap::<u32>::new(mmm, 8));
        let n = 16;
        let barrier = Arc::new(Barrier::new(n));
        let handles: Vec<_> = (0..n as u64)
            .map(|i| {
                let m = m.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    assert!(m.add(hv(i), i as u32));
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(m.len(), n as u64);
    }
}
