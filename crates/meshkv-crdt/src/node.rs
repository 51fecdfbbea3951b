//! Node identity types shared by payloads and the replication engine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Address-only node identity (e.g. `"kv-3:7600"`).
///
/// A `NodeAddr` is reused when a node restarts at the same address. State
/// that must survive restarts without ambiguity is keyed by [`NodeId`]
/// instead.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeAddr(String);

impl NodeAddr {
    /// Create an address from its string form.
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    /// The string form of the address.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeAddr {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Unique node identity: an address qualified by an incarnation counter.
///
/// The incarnation is bumped every time a node rejoins, so a `NodeId` is
/// never reused even though its [`NodeAddr`] may be. Removed-node
/// bookkeeping (pruning, tombstones) is keyed by `NodeId`.
///
/// The derived `Ord` (address first, then incarnation) is the total order
/// used for owner tie-breaks.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId {
    /// The node's address.
    pub addr: NodeAddr,
    /// Incarnation counter, bumped on every rejoin.
    pub incarnation: u64,
}

impl NodeId {
    /// Create a node identity.
    pub fn new(addr: impl Into<NodeAddr>, incarnation: u64) -> Self {
        Self {
            addr: addr.into(),
            incarnation,
        }
    }
}

impl From<String> for NodeAddr {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.addr, self.incarnation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_addr_roundtrip() {
        let addr = NodeAddr::new("kv-1:7600");
        assert_eq!(addr.as_str(), "kv-1:7600");
        assert_eq!(addr.to_string(), "kv-1:7600");
    }

    #[test]
    fn test_addr_ordering_is_lexicographic() {
        assert!(NodeAddr::new("a") < NodeAddr::new("b"));
        assert!(NodeAddr::new("a:1") < NodeAddr::new("a:2"));
    }

    #[test]
    fn test_node_id_never_equal_across_incarnations() {
        let first = NodeId::new("kv-1", 1);
        let second = NodeId::new("kv-1", 2);
        assert_ne!(first, second);
        assert_eq!(first.addr, second.addr);
    }

    #[test]
    fn test_node_id_order_addr_then_incarnation() {
        let a1 = NodeId::new("a", 1);
        let a2 = NodeId::new("a", 2);
        let b1 = NodeId::new("b", 1);
        assert!(a1 < a2);
        assert!(a2 < b1);
    }

    #[test]
    fn test_node_id_display() {
        assert_eq!(NodeId::new("kv-1", 3).to_string(), "kv-1#3");
    }
}
