//! Set algebra (§4.7): equality, subset/superset/disjoint tests, and
//! union/intersection/difference/symmetric-difference.
//!
//! Two families of snapshot feed these functions, matching the two
//! orderings §4.7 asks for:
//!
//! - `is_eq`/`is_subset`/`is_disjoint`/`intersection`/`symmetric_difference`
//!   merge-scan over each side's *hv-sorted* snapshot (order doesn't matter
//!   to the result, only membership).
//! - `union`/`difference` walk each side's *insertion-epoch-sorted* snapshot
//!   and build the result the way the spec describes ("insert all of A...
//!   using `add`"): membership, not relative hv order, decides what
//!   survives, so the output preserves each operand's own insertion order
//!   instead of re-sorting by hv.
//!
//! The snapshotting and sorting happen in [`crate::set::Set::sorted_entries`]
//! / [`crate::set::Set::epoch_sorted_entries`], which borrow each side's
//! linearization epoch independently. Two concurrent mutations landing
//! mid-merge can't corrupt the result (each side's vector is already a
//! private, stable copy by the time it gets here); they just mean a result
//! reflects each side's state as of its own snapshot instant, not
//! necessarily the same logical instant for both.

use std::cmp::Ordering;
use std::collections::HashSet;

use crate::hv::Hv;
use crate::map::Value;

type Entry<K> = (Hv, Value<K>);

pub(crate) fn is_eq<K>(a: &[Entry<K>], b: &[Entry<K>]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|((ha, _), (hb, _))| ha == hb)
}

pub(crate) fn is_subset<K>(a: &[Entry<K>], b: &[Entry<K>]) -> bool {
    let mut bi = b.iter().peekable();
    for (ha, _) in a {
        loop {
            match bi.peek() {
                None => return false,
                Some((hb, _)) if hb == ha => {
                    bi.next();
                    break;
                }
                Some((hb, _)) if hb < ha => {
                    bi.next();
                }
                _ => return false,
            }
        }
    }
    true
}

pub(crate) fn is_disjoint<K>(a: &[Entry<K>], b: &[Entry<K>]) -> bool {
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].0.cmp(&b[j].0) {
            Ordering::Equal => return false,
            Ordering::Less => i += 1,
            Ordering::Greater => j += 1,
        }
    }
    true
}

/// `a_by_epoch`/`b_by_epoch` are each sorted by insertion epoch (oldest
/// first). Per §4.7: "insert all of A, then add all of B (ignore
/// duplicates)" -- so the result keeps A's entries in A's order, then
/// appends whichever of B's entries weren't already present, in B's order.
pub(crate) fn union<K>(a_by_epoch: &[Entry<K>], b_by_epoch: &[Entry<K>]) -> Vec<Entry<K>> {
    let mut seen: HashSet<Hv> = a_by_epoch.iter().map(|(hv, _)| *hv).collect();
    let mut out = Vec::with_capacity(a_by_epoch.len() + b_by_epoch.len());
    out.extend_from_slice(a_by_epoch);
    for entry in b_by_epoch {
        if seen.insert(entry.0) {
            out.push(entry.clone());
        }
    }
    out
}

pub(crate) fn intersection<K>(a: &[Entry<K>], b: &[Entry<K>]) -> Vec<Entry<K>> {
    let mut out = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].0.cmp(&b[j].0) {
            Ordering::Less => i += 1,
            Ordering::Greater => j += 1,
            Ordering::Equal => {
                out.push(a[i].clone());
                i += 1;
                j += 1;
            }
        }
    }
    out
}

/// `a_by_epoch` is sorted by insertion epoch; `b` only needs to support a
/// membership test, so either ordering works -- we take the hv-sorted form
/// since that's what callers already have on hand. Per §4.7: "insert all of
/// A (sorted by insertion epoch), then remove all of B by hv. Ordering
/// preserved for survivors."
pub(crate) fn difference<K>(a_by_epoch: &[Entry<K>], b: &[Entry<K>]) -> Vec<Entry<K>> {
    let exclude: HashSet<Hv> = b.iter().map(|(hv, _)| *hv).collect();
    a_by_epoch
        .iter()
        .filter(|(hv, _)| !exclude.contains(hv))
        .cloned()
        .collect()
}

pub(crate) fn symmetric_difference<K>(a: &[Entry<K>], b: &[Entry<K>]) -> Vec<Entry<K>> {
    let mut out = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].0.cmp(&b[j].0) {
            Ordering::Less => {
                out.push(a[i].clone());
                i += 1;
            }
            Ordering::Greater => {
                out.push(b[j].clone());
                j += 1;
            }
            Ordering::Equal => {
                i += 1;
                j += 1;
            }
        }
    }
    out.extend_from_slice(&a[i..]);
    out.extend_from_slice(&b[j..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Item;

    fn entries(vals: &[u64]) -> Vec<Entry<u64>> {
        vals.iter()
            .map(|&v| (Hv::new(0, v), Value::wrap(Item::new(v, None))))
            .collect()
    }

    fn hvs<K>(v: &[Entry<K>]) -> Vec<u64> {
        v.iter().map(|(hv, _)| hv.low64()).collect()
    }

    #[test]
    fn union_merges_and_dedups() {
        let a = entries(&[1, 2, 3]);
        let b = entries(&[2, 3, 4]);
        assert_eq!(hvs(&union(&a, &b)), vec![1, 2, 3, 4]);
    }

    #[test]
    fn intersection_keeps_common_only() {
        let a = entries(&[1, 2, 3]);
        let b = entries(&[2, 3, 4]);
        assert_eq!(hvs(&intersection(&a, &b)), vec![2, 3]);
    }

    #[test]
    fn difference_is_asymmetric() {
        let a = entries(&[1, 2, 3]);
        let b = entries(&[2, 3, 4]);
        assert_eq!(hvs(&difference(&a, &b)), vec![1]);
        assert_eq!(hvs(&difference(&b, &a)), vec![4]);
    }

    #[test]
    fn is_subset_empty_set_is_subset_of_anything() {
        let empty: Vec<Entry<u64>> = entries(&[]);
        let b = entries(&[1, 2]);
        assert!(is_subset(&empty, &b));
        assert!(!is_subset(&b, &empty));
    }
}
