//! Consistent snapshot views (§4.6): a point-in-time read of every live
//! entry, internally consistent even though it is built from a data
//! structure still being concurrently mutated.
//!
//! The approach: capture a linearization epoch `E` via
//! [`crate::smr::Mmm::start_linearized_op`], then walk the current store's
//! buckets. Each bucket's *current* record may already reflect writes that
//! happened strictly after `E` -- including a removal of something that was
//! still live at `E`. §4.6 requires the view to reconstruct what the bucket
//! held at `E`, not just what it holds now, so each bucket is walked
//! backward through [`crate::record::Record::prev`] until the first record
//! whose `write_epoch <= E` is found; that's "what this bucket held at `E`",
//! and it's included iff it's live. Older generations stay reachable for as
//! long as our own reservation is active, because whatever superseded them
//! did so (and was retired) no earlier than our own captured epoch -- see
//! [`crate::smr::Mmm::retire`] and `Record::prev`'s docs.
//!
//! This reconstruction is scoped to a single `Store`: a migration installs
//! brand new records in the successor with no link back to the
//! predecessor's chain (see `crate::store::copy_into`). A view whose epoch
//! predates a migration that has already completed by the time `view()`
//! captures its reservation walks the *successor* store directly and can
//! only see as far back as each bucket's migration-time copy.

use std::sync::Arc;

use crate::hv::Hv;
use crate::record::{Item, Record};
use crate::smr::Mmm;
use crate::store::{Bucket, Store};

/// One entry in a captured view.
pub struct ViewEntry<T> {
    pub hv: Hv,
    pub item: Arc<Item<T>>,
    /// The item's insertion epoch (`Top::next_epoch` at the time it first
    /// became live), used to order entries when `sorted` is requested.
    /// Stable across migrations, unlike `write_epoch`.
    pub sort_epoch: u64,
}

/// Capture a consistent view of `store` as of the moment this call starts an
/// `Mmm` reservation. If `sorted`, entries come back ordered by
/// `sort_epoch` (oldest insertion first), matching the original's
/// insertion-order iteration guarantee; otherwise order is bucket order,
/// which carries no meaning callers should rely on.
pub(crate) fn snapshot<T>(mmm: &Mmm, store: &Store<T>, sorted: bool) -> Vec<ViewEntry<T>> {
    let (_guard, epoch) = mmm.start_linearized_op();
    snapshot_at(store, sorted, epoch)
}

/// As [`snapshot`], but against an already-captured linearization epoch
/// rather than one taken fresh from `mmm`. Lets a caller fix `E` up front
/// (e.g. via [`crate::smr::Mmm::start_linearized_op`]) and walk the buckets
/// later -- used by [`crate::setops`] to take both operands' views at one
/// shared epoch, and by this module's own tests to exercise the exclusion
/// rule against a write that happens strictly after `E` is fixed.
pub(crate) fn snapshot_at<T>(store: &Store<T>, sorted: bool, epoch: u64) -> Vec<ViewEntry<T>> {
    let mut out = Vec::new();
    for bucket in store.iter_buckets() {
        let Some(hv) = bucket.hv() else { continue };
        let Some(rec) = (unsafe { version_as_of(bucket.record_ptr(), epoch) }) else {
            continue;
        };
        if !rec.info.is_live() {
            continue;
        }
        let Some(item) = rec.item.clone() else {
            continue;
        };
        out.push(ViewEntry {
            hv,
            item,
            sort_epoch: rec.info.epoch,
        });
    }
    if sorted {
        out.sort_by_key(|e| e.sort_epoch);
    }
    out
}

/// Walk a bucket's version chain backward from its current record, looking
/// for the most recent one committed at or before `epoch` -- i.e. what that
/// bucket held "as of" `epoch`, whether or not it's still the current
/// record. Each step's `write_epoch` is strictly smaller than the one
/// before it (a record is only ever chained as `prev` by whatever replaced
/// it, which always commits at a later epoch), so the first match found
/// walking backward is also the latest one, which is the one we want.
///
/// # Safety
/// Must be called while holding an SMR reservation whose published epoch is
/// `<= epoch` (e.g. from [`crate::smr::Mmm::start_linearized_op`]'s
/// result), so that every record this walk might dereference is still
/// guaranteed alive -- same contract as [`crate::store::Bucket::record_ref`],
/// which this is built on.
unsafe fn version_as_of<'a, T>(mut ptr: *mut Record<T>, epoch: u64) -> Option<&'a Record<T>> {
    while !ptr.is_null() {
        let rec = unsafe { Bucket::record_ref(ptr) };
        if rec.write_epoch <= epoch {
            return Some(rec);
        }
        ptr = rec.prev;
    }
    None
}
