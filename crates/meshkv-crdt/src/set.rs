//! Grow-only set CRDT.

use crate::Crdt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Grow-only set: elements can be added but never removed.
///
/// Merge is set union. Because there is no removal, no per-node metadata
/// is kept and the type does not participate in removed-node pruning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GSet<T: Ord> {
    elements: BTreeSet<T>,
}

impl<T: Ord> Default for GSet<T> {
    fn default() -> Self {
        Self {
            elements: BTreeSet::new(),
        }
    }
}

impl<T: Ord + Clone> GSet<T> {
    /// An empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an element. Returns false if it was already present.
    pub fn insert(&mut self, element: T) -> bool {
        self.elements.insert(element)
    }

    /// Whether the set contains `element`.
    pub fn contains(&self, element: &T) -> bool {
        self.elements.contains(element)
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Iterate the elements in sorted order.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.elements.iter()
    }
}

impl<T: Ord + Clone> Crdt for GSet<T> {
    fn merge(&self, other: &Self) -> Self {
        Self {
            elements: self.elements.union(&other.elements).cloned().collect(),
        }
    }
}

impl<T: Ord + Clone> FromIterator<T> for GSet<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self {
            elements: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_contains() {
        let mut set = GSet::new();
        assert!(set.insert("x"));
        assert!(!set.insert("x"));
        assert!(set.contains(&"x"));
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_merge_is_union() {
        let a: GSet<&str> = ["x", "y"].into_iter().collect();
        let b: GSet<&str> = ["y", "z"].into_iter().collect();

        let merged = a.merge(&b);
        assert_eq!(merged.len(), 3);
        assert_eq!(merged, b.merge(&a));
    }

    #[test]
    fn test_merge_idempotent() {
        let set: GSet<u32> = [1, 2, 3].into_iter().collect();
        assert_eq!(set.merge(&set), set);
    }

    #[test]
    fn test_empty_is_merge_identity() {
        let set: GSet<u32> = [1, 2].into_iter().collect();
        assert_eq!(set.merge(&GSet::new()), set);
    }
}
