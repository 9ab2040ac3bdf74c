//! The public key-typed map façade: wires a [`crate::hash::Key`] type into
//! either engine variant and exposes the ordinary `get`/`put`/`replace`/
//! `add`/`remove`/`keys`/`values`/`items` vocabulary in place of the lower
//! layers' `Hv`-indexed operations.

use std::sync::Arc;

use crate::hash::Key;
use crate::hv::Hv;
use crate::lfm::LockFreeMap;
use crate::record::Item;
use crate::smr::Mmm;
use crate::view::ViewEntry;
use crate::wfm::WaitFreeMap;

/// An item handed back by a map or set: dereferences to `&T`. Cheap to clone
/// (it's a reference-counted handle into the table's own storage), and its
/// drop is what ultimately triggers any cleanup handler installed via
/// [`Map::set_free_handler`] -- see [`crate::record::Item`]. Collapses the
/// `Arc<Item<T>>` the engine actually stores into the single level of
/// indirection callers care about.
pub struct Value<T>(pub(crate) Arc<Item<T>>);

impl<T> Value<T> {
    pub(crate) fn wrap(inner: Arc<Item<T>>) -> Self {
        Value(inner)
    }
}

impl<T> Clone for Value<T> {
    fn clone(&self) -> Self {
        Value(self.0.clone())
    }
}

impl<T> std::ops::Deref for Value<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &**self.0
    }
}

pub(crate) enum Backend<V: Send + 'static> {
    LockFree(LockFreeMap<V>),
    WaitFree(WaitFreeMap<V>),
}

impl<V: Send + Sync + 'static> Backend<V> {
    pub(crate) fn get(&self, hv: Hv) -> Option<Value<V>> {
        match self {
            Backend::LockFree(m) => m.get(hv),
            Backend::WaitFree(m) => m.get(hv),
        }
        .map(Value::wrap)
    }

    pub(crate) fn put(&self, hv: Hv, v: V) -> Option<Value<V>> {
        match self {
            Backend::LockFree(m) => m.put(hv, v),
            Backend::WaitFree(m) => m.put(hv, v),
        }
        .map(Value::wrap)
    }

    pub(crate) fn replace(&self, hv: Hv, v: V) -> Option<Value<V>> {
        match self {
            Backend::LockFree(m) => m.replace(hv, v),
            Backend::WaitFree(m) => m.replace(hv, v),
        }
        .map(Value::wrap)
    }

    pub(crate) fn add(&self, hv: Hv, v: V) -> bool {
        match self {
            Backend::LockFree(m) => m.add(hv, v),
            Backend::WaitFree(m) => m.add(hv, v),
        }
    }

    pub(crate) fn remove(&self, hv: Hv) -> Option<Value<V>> {
        match self {
            Backend::LockFree(m) => m.remove(hv),
            Backend::WaitFree(m) => m.remove(hv),
        }
        .map(Value::wrap)
    }

    /// See [`LockFreeMap::put_item`]/[`WaitFreeMap::add_item`]: installs an
    /// already-built item, used by [`crate::setops`] to populate a
    /// freshly constructed result set.
    pub(crate) fn add_item(&self, hv: Hv, item: Value<V>) -> bool {
        match self {
            Backend::LockFree(m) => m.add_item(hv, item.0),
            Backend::WaitFree(m) => m.add_item(hv, item.0),
        }
    }

    pub(crate) fn len(&self) -> u64 {
        match self {
            Backend::LockFree(m) => m.len(),
            Backend::WaitFree(m) => m.len(),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        match self {
            Backend::LockFree(m) => m.capacity(),
            Backend::WaitFree(m) => m.capacity(),
        }
    }

    pub(crate) fn view(&self, sorted: bool) -> Vec<ViewEntry<V>> {
        match self {
            Backend::LockFree(m) => m.view(sorted),
            Backend::WaitFree(m) => m.view(sorted),
        }
    }

    pub(crate) fn set_free_handler(&mut self, handler: Arc<dyn Fn(V) + Send + Sync>) {
        match self {
            Backend::LockFree(m) => m.set_free_handler(handler),
            Backend::WaitFree(m) => m.set_free_handler(handler),
        }
    }

    pub(crate) fn mmm(&self) -> &Arc<Mmm> {
        match self {
            Backend::LockFree(m) => m.mmm(),
            Backend::WaitFree(m) => m.mmm(),
        }
    }
}

/// The `(key, value)` pair actually stored per entry. The lower engines only
/// ever index on the hash (`Hv`) and never retain the key that produced it;
/// storing it alongside `V` in the same atomically-published record is what
/// lets [`Map::keys`]/[`Map::items`] hand the original key back out, at the
/// cost of requiring `K: Clone` to duplicate it into each new record a
/// `put`/`replace`/`add` installs.
pub struct Entry<K, V> {
    pub key: K,
    pub value: V,
}

/// A value handle returned by [`Map`] operations: dereferences straight to
/// `&V` like [`Value`], and additionally exposes the key it is stored under
/// via [`MapValue::key`].
pub struct MapValue<K, V> {
    entry: Value<Entry<K, V>>,
}

impl<K, V> MapValue<K, V> {
    /// The key this value is stored under.
    pub fn key(&self) -> &K {
        &self.entry.key
    }
}

impl<K, V> Clone for MapValue<K, V> {
    fn clone(&self) -> Self {
        MapValue {
            entry: self.entry.clone(),
        }
    }
}

impl<K, V> std::ops::Deref for MapValue<K, V> {
    type Target = V;
    fn deref(&self) -> &V {
        &self.entry.value
    }
}

fn wrap_entry<K, V>(v: Option<Value<Entry<K, V>>>) -> Option<MapValue<K, V>> {
    v.map(|entry| MapValue { entry })
}

/// A concurrent key/value map over any [`Key`] type `K`, backed by either
/// the lock-free or the wait-free engine (§4.4/§4.5).
pub struct Map<K: Send + 'static, V: Send + Sync + 'static> {
    backend: Backend<Entry<K, V>>,
}

/// Which progress guarantee a [`Map`] or [`crate::set::Set`] should provide.
/// Wait-freedom costs an announce-and-help round on every write; pick
/// lock-free unless a caller genuinely needs a per-operation step bound
/// (e.g. a real-time thread that cannot be starved by contention).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Guarantee {
    LockFree,
    WaitFree,
}

impl<K, V> Map<K, V>
where
    K: Key + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    pub fn new(guarantee: Guarantee) -> Map<K, V> {
        Self::with_capacity(guarantee, 8)
    }

    pub fn with_capacity(guarantee: Guarantee, initial_capacity: usize) -> Map<K, V> {
        let mmm = Mmm::new();
        Self::with_mmm(guarantee, mmm, initial_capacity)
    }

    /// Share an existing [`Mmm`] domain with other containers (so that, e.g.,
    /// a set of related maps reclaim memory under one coordinated epoch
    /// clock rather than each running its own).
    pub fn with_mmm(guarantee: Guarantee, mmm: Arc<Mmm>, initial_capacity: usize) -> Map<K, V> {
        let backend = match guarantee {
            Guarantee::LockFree => Backend::LockFree(LockFreeMap::new(mmm, initial_capacity)),
            Guarantee::WaitFree => Backend::WaitFree(WaitFreeMap::new(mmm, initial_capacity)),
        };
        Map { backend }
    }

    /// Install a handler invoked exactly once per value, when its last
    /// reference anywhere is dropped (§4.1/§6). The handler only ever sees
    /// the value, not the key that was stored alongside it.
    pub fn set_free_handler(&mut self, handler: Arc<dyn Fn(V) + Send + Sync>) {
        self.backend
            .set_free_handler(Arc::new(move |e: Entry<K, V>| handler(e.value)));
    }

    pub fn get(&self, key: &K) -> Option<MapValue<K, V>> {
        wrap_entry(self.backend.get(key.hash_value()))
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Unconditional insert/overwrite. Returns the previous value, if any.
    pub fn put(&self, key: &K, value: V) -> Option<MapValue<K, V>> {
        let hv = key.hash_value();
        wrap_entry(self.backend.put(
            hv,
            Entry {
                key: key.clone(),
                value,
            },
        ))
    }

    /// Overwrite only if `key` already has a live value. Returns the
    /// previous value on success.
    pub fn replace(&self, key: &K, value: V) -> Option<MapValue<K, V>> {
        let hv = key.hash_value();
        wrap_entry(self.backend.replace(
            hv,
            Entry {
                key: key.clone(),
                value,
            },
        ))
    }

    /// Insert only if `key` has no live value yet. Returns `true` if the
    /// insert happened.
    pub fn add(&self, key: &K, value: V) -> bool {
        let hv = key.hash_value();
        self.backend.add(
            hv,
            Entry {
                key: key.clone(),
                value,
            },
        )
    }

    pub fn remove(&self, key: &K) -> Option<MapValue<K, V>> {
        wrap_entry(self.backend.remove(key.hash_value()))
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

    /// The map's keys (§6 `keys([sort])`), in the same consistent snapshot
    /// `values`/`items` draw from (§4.6). `sorted = true` orders
    /// oldest-inserted first.
    pub fn keys(&self, sorted: bool) -> Vec<K> {
        self.backend
            .view(sorted)
            .into_iter()
            .map(|e| e.item.key.clone())
            .collect()
    }

    /// The map's values (§6 `values([sort])`), in the same consistent
    /// snapshot [`Map::keys`] draws from.
    pub fn values(&self, sorted: bool) -> Vec<MapValue<K, V>> {
        self.backend
            .view(sorted)
            .into_iter()
            .map(|e| MapValue {
                entry: Value::wrap(e.item),
            })
            .collect()
    }

    /// The map's `(key, value)` pairs (§6 `items([sort])`); each returned
    /// [`MapValue`] carries both its key (via [`MapValue::key`]) and its
    /// value (via `Deref`).
    pub fn items(&self, sorted: bool) -> Vec<MapValue<K, V>> {
        self.values(sorted)
    }

    /// Force an SMR reclamation pass now instead of waiting for this
    /// thread's deferred-free list to cross its internal threshold. Useful
    /// to bound peak memory between bursts of writes; never required for
    /// correctness (§4.1).
    pub fn collect_garbage(&self) {
        self.backend.mmm().collect();
    }

    pub(crate) fn mmm(&self) -> &Arc<Mmm> {
        self.backend.mmm()
    }
}
