//! The atomic unit of bucket state: an owned item plus packed metadata.
//!
//! Per §9's "Double-width CAS" note, the `(item, info)` word is represented
//! here as a single `Box`-allocated `Record<T>` reached through an
//! `AtomicPtr`. The pointer swap *is* the atomic unit; once a `Record<T>`
//! is published, none of its fields change, so readers that load the
//! pointer see an internally consistent snapshot without needing a 128-bit
//! CAS.
//!
//! The item itself is held as `Arc<Item<T>>` rather than a bare `T`. §9
//! describes bucket records as "co-owning" user items and says migration
//! must carry a live item into its successor's record unchanged; with a
//! plain owned `T` that would require `T: Clone`, but the source record's
//! copy is still logically live until its own retirement. `Arc` gives the
//! exact co-ownership the design note asks for: migration copy is an
//! `Arc::clone`.
//!
//! [`Item`] additionally carries the container's optional cleanup handler
//! (§4.1 `add_cleanup_handler` / §6 `free_handler`) and runs it from its own
//! `Drop`. That is deliberate: a caller who got an item out of `get()` holds
//! an `Arc<Item<T>>` clone independent of this record's own reference, so
//! the *last* reference to drop might belong to the reader, not to the SMR
//! reclamation pass. Piggybacking on `Arc`'s native "last owner drops the
//! payload" behavior fires the handler exactly once no matter which side
//! that turns out to be, instead of requiring the SMR path to be the one
//! holding the final count.

/// `EPOCH` bits plus the `MOVING`/`MOVED`/`USED` migration and
/// wait-free-helping flags, packed as the original C record's `info` word
/// would be, but as plain fields on the (already-atomically-published)
/// indirection record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Info {
    /// `0` means "no live item in this record." Assigned from
    /// `Top::next_epoch` on the `0 -> nonzero` transition and preserved
    /// across subsequent `put`/`replace` updates and migration copies.
    pub epoch: u64,
    /// Set during migration phase A; once set, no further logical write
    /// succeeds against this record in this store.
    pub moving: bool,
    /// Set once this (live or already-moving) record has been copied into
    /// the successor store, or immediately in phase A if it held no live
    /// item.
    pub moved: bool,
}

impl Info {
    pub const NONE: Info = Info {
        epoch: 0,
        moving: false,
        moved: false,
    };

    pub const fn is_live(&self) -> bool {
        self.epoch != 0
    }
}

use std::mem::ManuallyDrop;
use std::ops::Deref;
use std::sync::Arc;

/// An owned item plus the container's optional cleanup handler. Dereferences
/// to `&T` for ordinary use; its `Drop` impl is what actually runs the
/// handler, see the module docs above.
pub struct Item<T> {
    value: ManuallyDrop<T>,
    free_handler: Option<Arc<dyn Fn(T) + Send + Sync>>,
}

impl<T> Item<T> {
    pub fn new(value: T, free_handler: Option<Arc<dyn Fn(T) + Send + Sync>>) -> Arc<Item<T>> {
        Arc::new(Item {
            value: ManuallyDrop::new(value),
            free_handler,
        })
    }
}

impl<T> Deref for Item<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.value
    }
}

impl<T> Drop for Item<T> {
    fn drop(&mut self) {
        let value = unsafe { ManuallyDrop::take(&mut self.value) };
        if let Some(handler) = self.free_handler.take() {
            handler(value);
        }
        // Otherwise `value` drops normally falling out of scope here.
    }
}

/// An indirection record: the payload a bucket's `record` pointer points
/// at. The `item` is conceptually an opaque owned reference into
/// caller-supplied storage; in this Rust rendering it is an [`Item<T>`],
/// and the engine never inspects its contents beyond moving it in and out.
pub struct Record<T> {
    pub item: Option<Arc<Item<T>>>,
    pub info: Info,
    /// The epoch this record was committed at, per [`crate::smr::Mmm::commit_epoch`].
    /// Used by [`crate::view`] to exclude records that committed after a
    /// snapshot's linearization epoch.
    pub write_epoch: u64,
    /// Non-owning link to the record this one superseded in the same
    /// bucket, if any. Null for the first record ever installed in a
    /// bucket, or for administrative (flag-only) rewrites that don't
    /// represent a new logical version -- see the module docs on why a raw
    /// pointer here doesn't need its own retire/free handling.
    ///
    /// A reader under an active SMR reservation may walk this chain
    /// backward to reconstruct what a bucket held at some earlier epoch:
    /// [`crate::view::snapshot_at`] is the only place that does so. The
    /// pointee is kept alive by the *same* reservation that protects the
    /// current record, since the record this one superseded was retired no
    /// earlier than this record's own `write_epoch` -- see
    /// [`crate::smr::Mmm::retire`].
    pub prev: *mut Record<T>,
}

// `prev` is a raw pointer, so auto-trait derivation would otherwise make
// `Record<T>` neither `Send` nor `Sync` regardless of `T`. It carries no
// thread affinity of its own: every access to it goes through the same
// SMR-reservation discipline as every other field here (see the `prev` doc
// comment above and `crate::store::Bucket::record_ref`), so `Record<T>`'s
// thread-safety is exactly `T`'s, same as before this field existed.
unsafe impl<T: Send> Send for Record<T> {}
unsafe impl<T: Sync> Sync for Record<T> {}

impl<T> Record<T> {
    pub fn new(
        item: Option<Arc<Item<T>>>,
        info: Info,
        write_epoch: u64,
        prev: *mut Record<T>,
    ) -> Box<Record<T>> {
        Box::new(Record {
            item,
            info,
            write_epoch,
            prev,
        })
    }

    /// A tombstone: no live item, epoch reset to zero per the literal
    /// `remove()` operation definition in §4.4.
    pub fn tombstone(write_epoch: u64) -> Box<Record<T>> {
        Self::new(None, Info::NONE, write_epoch, std::ptr::null_mut())
    }
}
