//! Key hashing (§6): turning a caller's key into the opaque 128-bit
//! [`Hv`] the store actually indexes on.
//!
//! The original's `item_type` enum (`INT`, `REAL`, `CSTR`, `PTR`,
//! `OBJ_*`) picks a hashing strategy at construction time and dispatches on
//! it for every operation. Rust's trait system gets the same per-key-type
//! specialization for free and statically, so this is a `Key` trait with
//! blanket impls for the primitive families instead of a runtime tag.

use std::hash::{Hash, Hasher};

use ahash::AHasher;

use crate::hv::Hv;

/// Fixed, distinct key pairs for the two `AHasher` instances that make up a
/// `Hv`'s high and low halves. Arbitrary but fixed: changing them changes
/// every key's hash value, which would be a breaking change for anyone
/// persisting hash values across process runs (nobody does, but there's no
/// reason to churn them either).
const SEED_HI: (u64, u64) = (0x9E3779B97F4A7C15, 0xBF58476D1CE4E5B9);
const SEED_LO: (u64, u64) = (0x94D049BB133111EB, 0x2545F4914F6CDD1D);

/// Types that can be used as a map/set key. `hash_value` must be a pure
/// function of `self`'s logical content -- two equal keys must produce the
/// same `Hv`, and the engine relies on that to treat `Hv` equality as key
/// equality (it never falls back to comparing the original key).
pub trait Key {
    fn hash_value(&self) -> Hv;
}

fn hash_bytes(bytes: &[u8]) -> Hv {
    let mut hi = AHasher::new_with_keys(SEED_HI.0, SEED_HI.1);
    let mut lo = AHasher::new_with_keys(SEED_LO.0, SEED_LO.1);
    hi.write(bytes);
    lo.write(bytes);
    let hv = Hv::new(hi.finish(), lo.finish());
    non_empty(hv)
}

fn hash_std<T: Hash + ?Sized>(value: &T) -> Hv {
    let mut hi = AHasher::new_with_keys(SEED_HI.0, SEED_HI.1);
    let mut lo = AHasher::new_with_keys(SEED_LO.0, SEED_LO.1);
    value.hash(&mut hi);
    value.hash(&mut lo);
    non_empty(Hv::new(hi.finish(), lo.finish()))
}

/// `Hv::EMPTY` is reserved to mean "bucket never claimed" (§3); fold the
/// astronomically unlikely all-zero hash to a fixed nonzero sentinel rather
/// than let a real key collide with it.
fn non_empty(hv: Hv) -> Hv {
    if hv.is_empty() {
        Hv::new(0, 1)
    } else {
        hv
    }
}

macro_rules! int_key {
    ($($t:ty),* $(,)?) => {
        $(
            impl Key for $t {
                fn hash_value(&self) -> Hv {
                    hash_std(self)
                }
            }
        )*
    };
}

int_key!(u8, u16, u32, u64, u128, usize, i8, i16, i32, i64, i128, isize);

/// Floating point keys (`REAL`): hash the bit pattern, with `-0.0` and `0.0`
/// folded together and every `NaN` folded to one canonical pattern so that
/// `==`-equal (under IEEE rules, `-0.0 == 0.0` and no `NaN == NaN`) keys
/// don't silently diverge from hash equality in the common `-0.0`/`0.0` case.
/// `NaN` keys remain usable (each hashes the same as every other `NaN`) but
/// are the caller's responsibility to avoid if they rely on `==` semantics.
impl Key for f64 {
    fn hash_value(&self) -> Hv {
        let bits = if self.is_nan() {
            f64::NAN.to_bits()
        } else if *self == 0.0 {
            0u64
        } else {
            self.to_bits()
        };
        hash_std(&bits)
    }
}

impl Key for f32 {
    fn hash_value(&self) -> Hv {
        (*self as f64).hash_value()
    }
}

/// `CSTR`: byte-content hashing for strings.
impl Key for str {
    fn hash_value(&self) -> Hv {
        hash_bytes(self.as_bytes())
    }
}

impl Key for String {
    fn hash_value(&self) -> Hv {
        self.as_str().hash_value()
    }
}

impl Key for [u8] {
    fn hash_value(&self) -> Hv {
        hash_bytes(self)
    }
}

impl<T: Key + ?Sized> Key for &T {
    fn hash_value(&self) -> Hv {
        (**self).hash_value()
    }
}

/// `PTR`: identity hashing by address, for keys that are meant to be
/// compared by pointer equality rather than pointee content (the original's
/// `PTR` item type).
#[derive(Clone, Copy)]
pub struct ByAddress<'a, T>(pub &'a T);

impl<T> Key for ByAddress<'_, T> {
    fn hash_value(&self) -> Hv {
        hash_std(&(self.0 as *const T as usize))
    }
}

/// `OBJ_*`: an adapter for keys that need a caller-supplied hashing
/// strategy instead of one of the built-in families -- the original's
/// "object with offset/cache/custom-hash configuration" option. `hasher` is
/// the custom-hash knob; `cache` reproduces the original's `CACHE` flag by
/// memoizing the first computed hash inside the adapter itself rather than
/// recomputing it on every `hash_value` call.
pub struct ObjKey<'a, T, F> {
    pub value: &'a T,
    pub hasher: F,
    cache: std::cell::Cell<Option<Hv>>,
}

impl<T, F> Clone for ObjKey<'_, T, F>
where
    F: Clone,
{
    fn clone(&self) -> Self {
        ObjKey {
            value: self.value,
            hasher: self.hasher.clone(),
            cache: std::cell::Cell::new(self.cache.get()),
        }
    }
}

impl<'a, T, F> ObjKey<'a, T, F>
where
    F: Fn(&T) -> u128,
{
    pub fn new(value: &'a T, hasher: F) -> Self {
        ObjKey {
            value,
            hasher,
            cache: std::cell::Cell::new(None),
        }
    }

    /// Drop the memoized hash, forcing the next `hash_value` call to
    /// recompute it. Needed only if `value`'s logical content changes in
    /// place after it has already been hashed once.
    pub fn invalidate_cache(&self) {
        self.cache.set(None);
    }
}

impl<T, F> Key for ObjKey<'_, T, F>
where
    F: Fn(&T) -> u128,
{
    fn hash_value(&self) -> Hv {
        if let Some(hv) = self.cache.get() {
            return hv;
        }
        let hv = non_empty(Hv::from_u128((self.hasher)(self.value)));
        self.cache.set(Some(hv));
        hv
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equal_ints_hash_equal() {
        assert_eq!(42u64.hash_value(), 42u64.hash_value());
        assert_ne!(42u64.hash_value(), 43u64.hash_value());
    }

    #[test]
    fn equal_strings_hash_equal() {
        let a = "hello".to_string();
        let b = "hello".to_string();
        assert_eq!(a.hash_value(), b.hash_value());
        assert_ne!(a.hash_value(), "world".hash_value());
    }

    #[test]
    fn negative_and_positive_zero_hash_equal() {
        assert_eq!(0.0f64.hash_value(), (-0.0f64).hash_value());
    }

    #[test]
    fn obj_key_uses_supplied_hasher() {
        struct Pair(u32, u32);
        let p = Pair(3, 4);
        let k = ObjKey::new(&p, |p: &Pair| ((p.0 as u128) << 64) | p.1 as u128);
        assert_eq!(k.hash_value(), Hv::from_u128((3u128 << 64) | 4));
    }

    #[test]
    fn obj_key_caches_after_first_call() {
        use std::cell::Cell;
        let calls = Cell::new(0u32);
        let value = 7u32;
        let k = ObjKey::new(&value, |v: &u32| {
            calls.set(calls.get() + 1);
            *v as u128
        });
        assert_eq!(k.hash_value(), Hv::from_u128(7));
        assert_eq!(k.hash_value(), Hv::from_u128(7));
        assert_eq!(k.hash_value(), Hv::from_u128(7));
        assert_eq!(calls.get(), 1, "hasher should run once, not on every call");

        k.invalidate_cache();
        assert_eq!(k.hash_value(), Hv::from_u128(7));
        assert_eq!(calls.get(), 2, "invalidate_cache should force a recompute");
    }
}
