//! Counter CRDTs: grow-only and increment/decrement.

use crate::node::NodeId;
use crate::{Crdt, RemovedNodePruning};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Grow-only counter.
///
/// Each node owns a slot holding the total it has contributed; the counter
/// value is the sum of all slots. Merge takes the per-slot maximum, which
/// is safe because a node only ever increments its own slot.
///
/// Slots are kept in a `BTreeMap` so the serialized form is canonical —
/// the replication engine hashes serialized values for anti-entropy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GCounter {
    slots: BTreeMap<NodeId, u64>,
}

impl GCounter {
    /// An empty counter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `amount` to `node`'s slot.
    pub fn increment(&mut self, node: &NodeId, amount: u64) {
        *self.slots.entry(node.clone()).or_insert(0) += amount;
    }

    /// The counter's value: the sum of every node's contribution.
    pub fn value(&self) -> u64 {
        self.slots.values().sum()
    }

    /// The contribution attributed to `node`, if any.
    pub fn contribution(&self, node: &NodeId) -> Option<u64> {
        self.slots.get(node).copied()
    }

    /// Number of nodes with a slot in this counter.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }
}

impl Crdt for GCounter {
    fn merge(&self, other: &Self) -> Self {
        let mut slots = self.slots.clone();
        for (node, count) in &other.slots {
            let slot = slots.entry(node.clone()).or_insert(0);
            *slot = (*slot).max(*count);
        }
        Self { slots }
    }
}

impl RemovedNodePruning for GCounter {
    fn needs_pruning_from(&self, removed: &NodeId) -> bool {
        self.slots.contains_key(removed)
    }

    fn prune(&self, removed: &NodeId, owner: &NodeId) -> Self {
        let mut slots = self.slots.clone();
        if let Some(count) = slots.remove(removed) {
            *slots.entry(owner.clone()).or_insert(0) += count;
        }
        Self { slots }
    }

    fn pruning_cleanup(&self, removed: &NodeId) -> Self {
        if !self.slots.contains_key(removed) {
            return self.clone();
        }
        let mut slots = self.slots.clone();
        slots.remove(removed);
        Self { slots }
    }
}

/// Increment/decrement counter built from two [`GCounter`]s.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PnCounter {
    increments: GCounter,
    decrements: GCounter,
}

impl PnCounter {
    /// An empty counter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `amount` on behalf of `node`.
    pub fn increment(&mut self, node: &NodeId, amount: u64) {
        self.increments.increment(node, amount);
    }

    /// Subtract `amount` on behalf of `node`.
    pub fn decrement(&mut self, node: &NodeId, amount: u64) {
        self.decrements.increment(node, amount);
    }

    /// The counter's value: increments minus decrements.
    pub fn value(&self) -> i64 {
        self.increments.value() as i64 - self.decrements.value() as i64
    }
}

impl Crdt for PnCounter {
    fn merge(&self, other: &Self) -> Self {
        Self {
            increments: self.increments.merge(&other.increments),
            decrements: self.decrements.merge(&other.decrements),
        }
    }
}

impl RemovedNodePruning for PnCounter {
    fn needs_pruning_from(&self, removed: &NodeId) -> bool {
        self.increments.needs_pruning_from(removed) || self.decrements.needs_pruning_from(removed)
    }

    fn prune(&self, removed: &NodeId, owner: &NodeId) -> Self {
        Self {
            increments: self.increments.prune(removed, owner),
            decrements: self.decrements.prune(removed, owner),
        }
    }

    fn pruning_cleanup(&self, removed: &NodeId) -> Self {
        Self {
            increments: self.increments.pruning_cleanup(removed),
            decrements: self.decrements.pruning_cleanup(removed),
        }
    }
}
