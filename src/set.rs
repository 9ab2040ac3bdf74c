//! The public key-typed set façade (§4.7), plus the set-algebra operations
//! over it.
//!
//! A `Set<K>` is a map that stores the key itself as its own "value" -- the
//! same trick the original engine's single-field containers use, since a
//! set-algebra result needs to hand back *keys*, and the lower engines never
//! retain a key past hashing it (see [`crate::map::Map::view`]'s note on
//! this). Wrapping `K` as its own item costs nothing the map path wasn't
//! already paying and gets key recovery for free.

use std::sync::Arc;

use crate::hash::Key;
use crate::lfm::LockFreeMap;
use crate::map::{Backend, Guarantee, Value};
use crate::smr::Mmm;
use crate::wfm::WaitFreeMap;

pub struct Set<K: Send + Sync + 'static> {
    backend: Backend<K>,
}

impl<K: Key + Send + Sync + 'static> Set<K> {
    pub fn new(guarantee: Guarantee) -> Set<K> {
        Self::with_capacity(guarantee, 8)
    }

    pub fn with_capacity(guarantee: Guarantee, initial_capacity: usize) -> Set<K> {
        Self::with_mmm(guarantee, Mmm::new(), initial_capacity)
    }

    pub fn with_mmm(guarantee: Guarantee, mmm: Arc<Mmm>, initial_capacity: usize) -> Set<K> {
        let backend = match guarantee {
            Guarantee::LockFree => Backend::LockFree(LockFreeMap::new(mmm, initial_capacity)),
            Guarantee::WaitFree => Backend::WaitFree(WaitFreeMap::new(mmm, initial_capacity)),
        };
        Set { backend }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.backend.get(key.hash_value()).is_some()
    }

    /// Insert `key` if it isn't already present. Returns `true` if it was
    /// newly inserted.
    pub fn insert(&self, key: K) -> bool {
        let hv = key.hash_value();
        self.backend.add(hv, key)
    }

    pub fn remove(&self, key: &K) -> bool {
        self.backend.remove(key.hash_value()).is_some()
    }

    pub fn len(&self) -> u64 {
        self.backend.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The current store's bucket count (§4.3). Changes across a migration.
    pub fn capacity(&self) -> usize {
        self.backend.capacity()
    }

    /// This set's members (§6 `items([sort])`). `sorted = true` orders
    /// oldest-inserted first, matching the insertion-epoch ordering
    /// `union`/`difference` rely on (§4.7).
    pub fn items(&self, sorted: bool) -> Vec<Value<K>> {
        self.backend
            .view(sorted)
            .into_iter()
            .map(|e| e.item)
            .collect()
    }

    /// This set's entries as `(hash, key)` pairs sorted by hash -- the
    /// common currency `is_eq`/`is_subset`/`is_disjoint`/`intersection`/
    /// `symmetric_difference` merge over, none of which need to preserve
    /// insertion order (§4.7).
    pub(crate) fn sorted_entries(&self) -> Vec<(crate::hv::Hv, Value<K>)> {
        let mut v: Vec<_> = self
            .backend
            .view(false)
            .into_iter()
            .map(|e| (e.hv, e.item))
            .collect();
        v.sort_by_key(|(hv, _)| *hv);
        v
    }

    /// This set's entries sorted by insertion epoch (oldest first) -- the
    /// currency `union`/`difference` merge over, since those two (and only
    /// those two) are required to preserve insertion order (§4.7).
    pub(crate) fn epoch_sorted_entries(&self) -> Vec<(crate::hv::Hv, Value<K>)> {
        self.backend
            .view(true)
            .into_iter()
            .map(|e| (e.hv, e.item))
            .collect()
    }

    fn from_sorted_entries(
        guarantee: Guarantee,
        entries: Vec<(crate::hv::Hv, Value<K>)>,
    ) -> Set<K> {
        let set = Set::with_capacity(guarantee, (entries.len() * 2).max(8));
        for (hv, item) in entries {
            set.backend.add_item(hv, item);
        }
        set
    }

    pub fn is_eq(&self, other: &Set<K>) -> bool {
        crate::setops::is_eq(&self.sorted_entries(), &other.sorted_entries())
    }

    /// `self ⊆ other` (§4.7 `is_subset`, defined there as
    /// `is_superset(other, self, proper)`). If `proper`, also requires
    /// `|self| < |other|`.
    pub fn is_subset_of(&self, other: &Set<K>, proper: bool) -> bool {
        let is_sub = crate::setops::is_subset(&self.sorted_entries(), &other.sorted_entries());
        is_sub && (!proper || self.len() < other.len())
    }

    /// `self ⊇ other` (§4.7 `is_superset`). If `proper`, also requires
    /// `|self| > |other|`.
    pub fn is_superset_of(&self, other: &Set<K>, proper: bool) -> bool {
        other.is_subset_of(self, proper)
    }

    pub fn is_disjoint_from(&self, other: &Set<K>) -> bool {
        crate::setops::is_disjoint(&self.sorted_entries(), &other.sorted_entries())
    }

    pub fn union(&self, other: &Set<K>, guarantee: Guarantee) -> Set<K> {
        let merged =
            crate::setops::union(&self.epoch_sorted_entries(), &other.epoch_sorted_entries());
        Self::from_sorted_entries(guarantee, merged)
    }

    pub fn intersection(&self, other: &Set<K>, guarantee: Guarantee) -> Set<K> {
        let merged = crate::setops::intersection(&self.sorted_entries(), &other.sorted_entries());
        Self::from_sorted_entries(guarantee, merged)
    }

    /// Keys in `self` but not in `other`.
    pub fn difference(&self, other: &Set<K>, guarantee: Guarantee) -> Set<K> {
        let merged = crate::setops::difference(&self.epoch_sorted_entries(), &other.sorted_entries());
        Self::from_sorted_entries(guarantee, merged)
    }

    pub fn symmetric_difference(&self, other: &Set<K>, guarantee: Guarantee) -> Set<K> {
        let merged =
            crate::setops::symmetric_difference(&self.sorted_entries(), &other.sorted_entries());
        Self::from_sorted_entries(guarantee, merged)
    }

    /// Force an SMR reclamation pass now instead of waiting for this
    /// thread's deferred-free list to cross its internal threshold. Useful
    /// to bound peak memory between bursts of writes; never required for
    /// correctness (§4.1).
    pub fn collect_garbage(&self) {
        self.backend.mmm().collect();
    }
}
