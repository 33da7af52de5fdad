//! # Keyed set differences
//!
//! Two primitives:
//!
//! - [`difference`]: entries of one keyed map with no equivalent entry under
//!   the same key in another map. Used for desired-vs-actual address diffing.
//! - [`changes`]: added / removed / modified items between two snapshots of a
//!   list, matched by a key ordering. Used for connector diffing and for
//!   detecting desired-definition changes.
//!
//! Both are pure and never reorder their caller's data.

use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Entries of `a` with no equivalent entry under the same key in `b`.
///
/// A key missing from `b` is never equivalent. Results follow `a`'s key order.
pub fn difference<'a, K, A, B, F>(
    a: &'a BTreeMap<K, A>,
    b: &BTreeMap<K, B>,
    equivalent: F,
) -> Vec<&'a A>
where
    K: Ord,
    F: Fn(&A, &B) -> bool,
{
    a.iter()
        .filter(|(k, va)| match b.get(*k) {
            Some(vb) => !equivalent(*va, vb),
            None => true,
        })
        .map(|(_, va)| va)
        .collect()
}

/// Result of [`changes`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Changes<T> {
    /// Items present after but not before.
    pub added: Vec<T>,
    /// Items present before but not after.
    pub removed: Vec<T>,
    /// Items present in both whose content is no longer equivalent (the after value).
    pub modified: Vec<T>,
    /// Short human-readable summary for logs.
    pub description: String,
}

impl<T> Changes<T> {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }
}

/// Diff two lists matched by `compare`.
///
/// `before == None` means nothing was seen yet, so every item of `after` is
/// added. When `unchanged` is given, items with equal keys that it rejects are
/// reported as modified. Inputs need not be sorted; `label` names items in the
/// description. Returns `None` when nothing changed.
pub fn changes<T, C, U, L>(
    before: Option<&[T]>,
    after: &[T],
    compare: C,
    unchanged: Option<U>,
    label: L,
) -> Option<Changes<T>>
where
    T: Clone,
    C: Fn(&T, &T) -> Ordering,
    U: Fn(&T, &T) -> bool,
    L: Fn(&T) -> String,
{
    let mut old: Vec<&T> = before.map(|b| b.iter().collect()).unwrap_or_default();
    let mut new: Vec<&T> = after.iter().collect();
    old.sort_by(|x, y| compare(*x, *y));
    new.sort_by(|x, y| compare(*x, *y));

    let mut added = Vec::new();
    let mut removed = Vec::new();
    let mut modified = Vec::new();

    let (mut i, mut j) = (0, 0);
    while i < old.len() || j < new.len() {
        if i == old.len() {
            added.push(new[j].clone());
            j += 1;
        } else if j == new.len() {
            removed.push(old[i].clone());
            i += 1;
        } else {
            match compare(old[i], new[j]) {
                Ordering::Less => {
                    removed.push(old[i].clone());
                    i += 1;
                }
                Ordering::Greater => {
                    added.push(new[j].clone());
                    j += 1;
                }
                Ordering::Equal => {
                    if let Some(same) = unchanged.as_ref() {
                        if !same(old[i], new[j]) {
                            modified.push(new[j].clone());
                        }
                    }
                    i += 1;
                    j += 1;
                }
            }
        }
    }

    if before.is_some() && added.is_empty() && removed.is_empty() && modified.is_empty() {
        return None;
    }

    let description = if before.is_none() {
        format!("initial {}", describe(&added, &label))
    } else {
        let mut parts = Vec::new();
        if !added.is_empty() {
            parts.push(format!("added {}", describe(&added, &label)));
        }
        if !removed.is_empty() {
            parts.push(format!("removed {}", describe(&removed, &label)));
        }
        if !modified.is_empty() {
            parts.push(format!("modified {}", describe(&modified, &label)));
        }
        parts.join(", ")
    };

    Some(Changes {
        added,
        removed,
        modified,
        description,
    })
}

/// Diff two lists of plain strings; no notion of modification.
pub fn string_changes(before: &[String], after: &[String]) -> Option<Changes<String>> {
    changes(
        Some(before),
        after,
        |a: &String, b: &String| a.cmp(b),
        None::<fn(&String, &String) -> bool>,
        |s: &String| s.clone(),
    )
}

const DESCRIBE_MAX: usize = 5;

/// At most five labels, then a count of the rest.
pub fn describe<T>(items: &[T], label: impl Fn(&T) -> String) -> String {
    if items.len() > DESCRIBE_MAX {
        let shown: Vec<String> = items[..DESCRIBE_MAX].iter().map(&label).collect();
        format!("{} and {} more", shown.join(", "), items.len() - DESCRIBE_MAX)
    } else {
        let shown: Vec<String> = items.iter().map(&label).collect();
        format!("[{}]", shown.join(", "))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn map(entries: &[(&str, u32)]) -> BTreeMap<String, u32> {
        entries.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_difference_reports_missing_keys() {
        let a = map(&[("a", 1), ("b", 2)]);
        let b = map(&[("a", 1)]);
        assert_eq!(difference(&a, &b, |x, y| x == y), vec![&2]);
    }

    #[test]
    fn test_difference_reports_non_equivalent_values() {
        let a = map(&[("a", 1), ("b", 2)]);
        let b = map(&[("a", 9), ("b", 2)]);
        assert_eq!(difference(&a, &b, |x, y| x == y), vec![&1]);
    }

    #[test]
    fn test_difference_of_empty_is_empty() {
        let a: BTreeMap<String, u32> = BTreeMap::new();
        let b = map(&[("a", 1)]);
        assert!(difference(&a, &b, |x, y| x == y).is_empty());
    }

    #[test]
    fn test_changes_initial_snapshot_adds_everything() {
        let c = changes(
            None,
            &strings(&["b", "a"]),
            |a: &String, b: &String| a.cmp(b),
            None::<fn(&String, &String) -> bool>,
            |s: &String| s.clone(),
        )
        .unwrap();
        assert_eq!(c.added, strings(&["a", "b"]));
        assert!(c.removed.is_empty());
        assert!(c.description.starts_with("initial"));
    }

    #[test]
    fn test_changes_initial_empty_snapshot_still_reports() {
        let c = changes(
            None,
            &[] as &[String],
            |a: &String, b: &String| a.cmp(b),
            None::<fn(&String, &String) -> bool>,
            |s: &String| s.clone(),
        );
        assert!(c.is_some_and(|c| c.is_empty()));
    }

    #[test]
    fn test_string_changes_none_when_equal() {
        assert!(string_changes(&strings(&["a", "b"]), &strings(&["b", "a"])).is_none());
    }

    #[test]
    fn test_string_changes_added_and_removed() {
        let c = string_changes(&strings(&["a", "b", "c"]), &strings(&["b", "d"])).unwrap();
        assert_eq!(c.added, strings(&["d"]));
        assert_eq!(c.removed, strings(&["a", "c"]));
        assert!(c.modified.is_empty());
    }

    #[test]
    fn test_changes_detects_modification_with_predicate() {
        let before = vec![("a".to_string(), 1), ("b".to_string(), 2)];
        let after = vec![("a".to_string(), 1), ("b".to_string(), 3)];
        let c = changes(
            Some(before.as_slice()),
            &after,
            |x: &(String, i32), y: &(String, i32)| x.0.cmp(&y.0),
            Some(|x: &(String, i32), y: &(String, i32)| x.1 == y.1),
            |x: &(String, i32)| x.0.clone(),
        )
        .unwrap();
        assert_eq!(c.modified, vec![("b".to_string(), 3)]);
        assert_eq!(c.description, "modified [b]");
    }

    #[test]
    fn test_describe_truncates_after_five() {
        let items = strings(&["a", "b", "c", "d", "e", "f", "g"]);
        assert_eq!(describe(&items, |s| s.clone()), "a, b, c, d, e and 2 more");
        assert_eq!(describe(&items[..2], |s| s.clone()), "[a, b]");
    }

    proptest! {
        #[test]
        fn prop_string_changes_is_order_independent(
            actual in proptest::collection::btree_set("[a-e]{1,2}", 0..8),
            desired in proptest::collection::btree_set("[a-e]{1,2}", 0..8),
        ) {
            let actual: Vec<String> = actual.into_iter().collect();
            let sorted: Vec<String> = desired.into_iter().collect();
            let mut permuted = sorted.clone();
            permuted.reverse();
            let mid = permuted.len() / 2;
            permuted.rotate_left(mid);

            let a = string_changes(&actual, &sorted);
            let b = string_changes(&actual, &permuted);
            prop_assert_eq!(
                a.as_ref().map(|c| (&c.added, &c.removed)),
                b.as_ref().map(|c| (&c.added, &c.removed))
            );
        }

        #[test]
        fn prop_difference_partitions_keys(
            a in proptest::collection::btree_map("[a-f]", 0u8..3, 0..6),
            b in proptest::collection::btree_map("[a-f]", 0u8..3, 0..6),
        ) {
            let stale = difference(&a, &b, |x, y| x == y);
            let kept = a.iter().filter(|(k, v)| b.get(*k) == Some(*v)).count();
            prop_assert_eq!(stale.len() + kept, a.len());
        }
    }
}
