//! Last-writer-wins register CRDT.

use crate::node::NodeId;
use crate::Crdt;
use serde::{Deserialize, Serialize};

/// Last-writer-wins register.
///
/// Holds a single value stamped with `(timestamp, node)`. Merge keeps the
/// entry with the greater stamp; the node identity breaks timestamp ties,
/// so two replicas assigning at the same instant still converge.
///
/// Timestamps are caller-supplied (typically microseconds since the Unix
/// epoch). The register never moves backwards: an assign with an older
/// stamp loses the merge against the current value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LwwRegister<T: Clone> {
    value: T,
    timestamp: u64,
    node: NodeId,
}

impl<T: Clone> LwwRegister<T> {
    /// Create a register holding `value` stamped `(timestamp, node)`.
    pub fn new(value: T, timestamp: u64, node: NodeId) -> Self {
        Self {
            value,
            timestamp,
            node,
        }
    }

    /// The current value.
    pub fn value(&self) -> &T {
        &self.value
    }

    /// The stamp of the current value.
    pub fn stamp(&self) -> (u64, &NodeId) {
        (self.timestamp, &self.node)
    }

    /// Assign a new value. The stamp must come from the caller's clock;
    /// an older stamp than the current one is a lost write by definition.
    pub fn assign(&mut self, value: T, timestamp: u64, node: NodeId) {
        self.value = value;
        self.timestamp = timestamp;
        self.node = node;
    }
}

impl<T: Clone> Crdt for LwwRegister<T> {
    fn merge(&self, other: &Self) -> Self {
        if (other.timestamp, &other.node) > (self.timestamp, &self.node) {
            other.clone()
        } else {
            self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(name: &str) -> NodeId {
        NodeId::new(name, 1)
    }

    #[test]
    fn test_newer_timestamp_wins() {
        let old = LwwRegister::new("v1", 100, node("a"));
        let new = LwwRegister::new("v2", 200, node("b"));
        assert_eq!(*old.merge(&new).value(), "v2");
        assert_eq!(*new.merge(&old).value(), "v2");
    }

    #[test]
    fn test_node_breaks_timestamp_tie() {
        let a = LwwRegister::new("from-a", 100, node("a"));
        let b = LwwRegister::new("from-b", 100, node("b"));
        // Same stamp, greater node wins; both merge orders agree.
        assert_eq!(*a.merge(&b).value(), "from-b");
        assert_eq!(*b.merge(&a).value(), "from-b");
    }

    #[test]
    fn test_merge_idempotent() {
        let reg = LwwRegister::new(42u64, 5, node("a"));
        assert_eq!(reg.merge(&reg), reg);
    }

    #[test]
    fn test_assign_replaces_value_and_stamp() {
        let mut reg = LwwRegister::new("v1", 100, node("a"));
        reg.assign("v2", 150, node("a"));
        assert_eq!(*reg.value(), "v2");
        assert_eq!(reg.stamp().0, 150);
    }
}
