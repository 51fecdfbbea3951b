#![warn(missing_docs)]

//! MeshKV CRDT payloads: convergent replicated data types for the
//! replication engine.
//!
//! Every payload is a state-based CRDT: a join-semilattice whose `merge`
//! is commutative, associative, and idempotent. Replicas apply updates
//! locally and exchange full states; merging in any order converges to
//! the same value.
//!
//! Payloads that attribute state to individual nodes (the counters) also
//! implement [`RemovedNodePruning`], which lets the replication engine
//! move a departed node's contribution onto a surviving owner and then
//! strip all traces of the departed node, keeping metadata bounded.

pub mod counter;
pub mod node;
pub mod register;
pub mod set;

pub use counter::{GCounter, PnCounter};
pub use node::{NodeAddr, NodeId};
pub use register::LwwRegister;
pub use set::GSet;

/// A state-based CRDT.
///
/// `merge` must be commutative, associative, and idempotent, and
/// monotonic in the type's semilattice: for any `a`, `b`,
/// `a.merge(&b) == b.merge(&a)` and `a.merge(&a) == a`.
pub trait Crdt: Clone {
    /// Join this state with another replica's state.
    fn merge(&self, other: &Self) -> Self;
}

/// Capability for CRDTs that attribute state to individual nodes and can
/// garbage-collect the metadata of a node that left the cluster.
pub trait RemovedNodePruning: Crdt {
    /// Does this value still carry state contributed by `removed`?
    fn needs_pruning_from(&self, removed: &NodeId) -> bool;

    /// Move the state contributed by `removed` onto `owner`.
    ///
    /// After pruning, the value's observable content is unchanged but the
    /// contribution is re-attributed, so `removed`'s slot can be dropped.
    fn prune(&self, removed: &NodeId, owner: &NodeId) -> Self;

    /// Strip any remaining trace of `removed` from the value.
    ///
    /// Applied when merging states that may still carry the removed
    /// node's slot (late gossip), after the prune has been disseminated.
    fn pruning_cleanup(&self, removed: &NodeId) -> Self;
}
