//! MMM: the epoch-based safe-memory-reclamation layer.
//!
//! One monotonic counter (`global_epoch`) serves two roles that the spec
//! describes separately but which collapse into a single logical clock in
//! this implementation:
//!
//! - **Commit ordering**: [`Mmm::start_linearized_op`] snapshots the
//!   counter's current value as a stable linearization epoch; every record
//!   committed via [`Mmm::commit_epoch`] gets the *next* value, so any
//!   snapshot taken before a commit necessarily has a smaller epoch than
//!   that commit and excludes it (per §4.6's `write_epoch <= E` filter).
//! - **Reclamation safety**: a reservation (entered by [`Mmm::start_basic_op`])
//!   publishes the epoch it observed; [`Mmm::retire`] tags freed memory with
//!   the epoch at retirement time, and a block is freed once every active
//!   reservation's observed epoch is past that tag.
//!
//! The registry shape (a `Mutex<slab::Slab<Arc<ThreadRecord>>>` of per-thread
//! records) mirrors the teacher crate's `epochs: Mutex<Slab<Arc<AtomicUsize>>>`
//! reader registry; each record's own deferred-free list mirrors the
//! teacher's per-writer `prevs` vec and crossbeam-epoch's per-participant
//! garbage bag. Folding the deferred list into the same registry-visible
//! record (rather than a purely thread-local side table) is what lets
//! `Mmm::drop` below reach every thread's garbage, not just its own: a
//! record retired while helping another thread's operation (store.rs's
//! migration `freeze`, for instance) is filed under the *retiring* thread's
//! record, which may not be the thread that eventually drops the `Mmm`.

use std::cell::RefCell;

#[cfg(loom)]
use loom::sync::{atomic, Arc, Mutex};
#[cfg(not(loom))]
use std::sync::{atomic, Arc, Mutex};

use atomic::{fence, AtomicU64, Ordering};
use slab::Slab;

use crate::error::fatal;

/// Sentinel stored in a thread's epoch cell while it holds no reservation.
const NOT_IN_OP: u64 = u64::MAX;

/// Once a thread's deferred-free list for a given [`Mmm`] reaches this many
/// entries, the next `retire` call triggers a reclamation scan instead of
/// waiting for the list to be scanned incidentally.
const GC_THRESHOLD: usize = 64;

/// A process segment of independently reclaimed memory.
///
/// Constructed explicitly and shared (usually via `Arc`) between a `Map`/
/// `Set` and whatever helper threads it spawns; there is no hidden
/// process-wide singleton, so independent subsystems (e.g. two unrelated
/// test harnesses in the same process) can each bring their own `Mmm`.
pub struct Mmm {
    global_epoch: AtomicU64,
    registry: Mutex<Slab<Arc<ThreadRecord>>>,
}

/// Per-thread state for one `Mmm`: its published reservation epoch and its
/// own deferred-free list. Reachable both from the owning thread's
/// thread-local cache and from `Mmm`'s registry, so a cross-thread sweep
/// (`Mmm::drop`) can find it even after the owning thread has gone away.
struct ThreadRecord {
    epoch: AtomicU64,
    deferred: Mutex<Vec<Retired>>,
}

struct ThreadSlot {
    mmm_ptr: usize,
    record: Arc<ThreadRecord>,
    depth: u32,
}

/// One deferred-free record: a type-erased drop closure plus the epoch it
/// was retired at.
struct Retired {
    retire_epoch: u64,
    run: Box<dyn FnOnce() + Send>,
}

/// Asserts `Send` for a raw pointer whose pointee type is already known to
/// be `Send`. Raw pointers opt out of every auto trait unconditionally, so
/// [`Mmm::retire_with`]'s closure can't otherwise be coerced to
/// `Box<dyn FnOnce() + Send>`.
struct SendPtr<T>(*mut T);
unsafe impl<T> Send for SendPtr<T> {}

thread_local! {
    static SLOTS: RefCell<Vec<ThreadSlot>> = RefCell::new(Vec::new());
}

impl Mmm {
    pub fn new() -> Arc<Mmm> {
        Arc::new(Mmm {
            global_epoch: AtomicU64::new(0),
            registry: Mutex::new(Slab::new()),
        })
    }

    fn key(&self) -> usize {
        self as *const Mmm as usize
    }

    /// Find this thread's record for this `Mmm`, registering a fresh one if
    /// this is the first time the thread has touched it.
    fn thread_record(&self) -> Arc<ThreadRecord> {
        let key = self.key();
        SLOTS.with(|slots| {
            let mut slots = slots.borrow_mut();
            if let Some(ts) = slots.iter().find(|s| s.mmm_ptr == key) {
                return ts.record.clone();
            }
            let record = Arc::new(ThreadRecord {
                epoch: AtomicU64::new(NOT_IN_OP),
                deferred: Mutex::new(Vec::new()),
            });
            {
                let mut reg = self
                    .registry
                    .lock()
                    .unwrap_or_else(|e| fatal!("SMR registry poisoned: {e}"));
                // `Slab::insert` grows on demand; registry exhaustion in
                // practice means the process allocator gave up, which the
                // global allocator already turns into an abort. The
                // returned index isn't needed: a thread's slot lives for
                // the thread's lifetime (see the shared-resource policy),
                // it is never individually removed.
                reg.insert(record.clone());
            }
            slots.push(ThreadSlot {
                mmm_ptr: key,
                record: record.clone(),
                depth: 0,
            });
            record
        })
    }

    /// Enter a (possibly nested) reservation that prevents the current
    /// `store_current` and anything retired after entry from being freed
    /// until the returned guard is dropped.
    pub fn start_basic_op(&self) -> OpGuard<'_> {
        let key = self.key();
        let (record, needs_publish) = SLOTS.with(|slots| {
            let mut slots = slots.borrow_mut();
            if let Some(ts) = slots.iter_mut().find(|s| s.mmm_ptr == key) {
                ts.depth += 1;
                return (ts.record.clone(), ts.depth == 1);
            }
            drop(slots);
            let record = self.thread_record();
            SLOTS.with(|slots| {
                let mut slots = slots.borrow_mut();
                let ts = slots
                    .iter_mut()
                    .find(|s| s.mmm_ptr == key)
                    .expect("thread_record just registered this slot");
                ts.depth = 1;
            });
            (record, true)
        });
        if needs_publish {
            self.publish(&record.epoch);
        }
        OpGuard { mmm: self }
    }

    /// As [`Mmm::start_basic_op`], but also returns a stable epoch suitable
    /// for coordinating a multi-structure snapshot (the [`crate::view`]
    /// module and set algebra use this).
    pub fn start_linearized_op(&self) -> (OpGuard<'_>, u64) {
        let guard = self.start_basic_op();
        let epoch = self.global_epoch.load(Ordering::SeqCst);
        (guard, epoch)
    }

    fn publish(&self, cell: &AtomicU64) {
        let e = self.global_epoch.load(Ordering::Relaxed);
        cell.store(e, Ordering::Relaxed);
        // Ensure the published epoch is visible to a concurrent GC scan
        // before we go on to dereference anything epoch-protected.
        fence(Ordering::SeqCst);
    }

    fn end_op(&self) {
        let key = self.key();
        SLOTS.with(|slots| {
            let mut slots = slots.borrow_mut();
            if let Some(ts) = slots.iter_mut().find(|s| s.mmm_ptr == key) {
                ts.depth -= 1;
                if ts.depth == 0 {
                    ts.record.epoch.store(NOT_IN_OP, Ordering::Release);
                }
            }
        });
    }

    /// The epoch a newly committed record should be tagged with. Any
    /// reservation whose published epoch is strictly less than this value
    /// started before the commit and will not observe it in a [`crate::view`]
    /// snapshot.
    pub fn commit_epoch(&self) -> u64 {
        self.global_epoch.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Defer freeing `ptr` (and dropping its contents) until no reservation
    /// can still observe it.
    ///
    /// # Safety
    /// `ptr` must have come from `Box::into_raw` and must not be freed or
    /// dereferenced by anyone else after this call.
    pub unsafe fn retire<T: Send + 'static>(&self, ptr: *mut T) {
        self.retire_with(ptr, |_| {});
    }

    /// As [`Mmm::retire`], but runs `cleanup` on the owned value immediately
    /// before the backing allocation is freed (§4.1 `add_cleanup_handler`
    /// folded into the retire call, since Rust closures make the two-step
    /// C-style API redundant).
    ///
    /// # Safety
    /// Same requirements as [`Mmm::retire`].
    pub unsafe fn retire_with<T: Send + 'static>(
        &self,
        ptr: *mut T,
        cleanup: impl FnOnce(T) + Send + 'static,
    ) {
        let retire_epoch = self.global_epoch.fetch_add(1, Ordering::AcqRel) + 1;
        // A bare `*mut T` capture would make this closure `!Send` regardless
        // of `T` (raw pointers opt out of every auto trait on their own);
        // `SendPtr` asserts what `T: Send` already gives us, that moving
        // this address to whichever thread runs `collect` is fine.
        let ptr = SendPtr(ptr);
        let run: Box<dyn FnOnce() + Send> = Box::new(move || {
            let boxed = unsafe { Box::from_raw(ptr.0) };
            cleanup(*boxed);
        });
        let record = self.thread_record();
        let should_collect = {
            let mut deferred = record
                .deferred
                .lock()
                .unwrap_or_else(|e| fatal!("SMR deferred-list poisoned: {e}"));
            deferred.push(Retired { retire_epoch, run });
            deferred.len() >= GC_THRESHOLD
        };
        if should_collect {
            self.collect();
        }
    }

    /// Free `ptr` immediately. Only legal for a block that was never
    /// published where a concurrent reader could have observed it.
    ///
    /// # Safety
    /// `ptr` must have come from `Box::into_raw`, must never have been
    /// installed into any atomic slot another thread could have loaded, and
    /// must not be freed or dereferenced by anyone else.
    pub unsafe fn retire_unused<T>(&self, ptr: *mut T) {
        drop(unsafe { Box::from_raw(ptr) });
    }

    fn min_active_epoch(&self) -> Option<u64> {
        let reg = self
            .registry
            .lock()
            .unwrap_or_else(|e| fatal!("SMR registry poisoned: {e}"));
        reg.iter()
            .filter_map(|(_, record)| {
                let e = record.epoch.load(Ordering::Acquire);
                (e != NOT_IN_OP).then_some(e)
            })
            .min()
    }

    /// Scan the registry for the oldest epoch any reservation might still
    /// be observing, and free everything *this thread* retired strictly
    /// before it.
    ///
    /// Called automatically once this thread's deferred list crosses
    /// [`GC_THRESHOLD`]; callers may also invoke it directly (e.g. between
    /// benchmark iterations) to bound peak memory. Each thread is
    /// responsible for draining its own deferred list this way while the
    /// `Mmm` is alive; [`Mmm::drop`] sweeps every thread's list
    /// unconditionally once the whole structure is quiescent.
    pub fn collect(&self) {
        let min_active = self.min_active_epoch();
        let record = self.thread_record();
        let mut deferred = record
            .deferred
            .lock()
            .unwrap_or_else(|e| fatal!("SMR deferred-list poisoned: {e}"));
        let mut i = 0;
        while i < deferred.len() {
            let safe = match min_active {
                Some(m) => deferred[i].retire_epoch < m,
                None => true,
            };
            if safe {
                let r = deferred.remove(i);
                (r.run)();
            } else {
                i += 1;
            }
        }
    }
}

impl Drop for Mmm {
    fn drop(&mut self) {
        // Quiescent by contract (§5): no operation may be in flight anywhere.
        // Sweep every contributing thread's deferred-free list, not just
        // the dropping thread's own -- a record retired by a migration
        // helper running on some other thread must still be freed here.
        let reg = self
            .registry
            .lock()
            .unwrap_or_else(|e| fatal!("SMR registry poisoned: {e}"));
        for (_, record) in reg.iter() {
            let mut deferred = record
                .deferred
                .lock()
                .unwrap_or_else(|e| fatal!("SMR deferred-list poisoned: {e}"));
            for r in deferred.drain(..) {
                (r.run)();
            }
        }
    }
}

/// RAII reservation guard returned by [`Mmm::start_basic_op`] /
/// [`Mmm::start_linearized_op`]. Dropping it ends the reservation (or, for
/// a nested entry, decrements the nesting depth).
pub struct OpGuard<'a> {
    mmm: &'a Mmm,
}

impl Drop for OpGuard<'_> {
    fn drop(&mut self) {
        self.mmm.end_op();
    }
}
