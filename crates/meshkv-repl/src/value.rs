//! The tagged payload union stored per key.
//!
//! The engine is payload-agnostic: it only needs the merge law, a shape
//! check, and the optional pruning capability. Those are exposed here as
//! a closed enum over the `meshkv-crdt` payload types plus the `Deleted`
//! tombstone, with a [`ValueShape`] discriminant for the per-key
//! type-stability check.

use meshkv_crdt::{Crdt, GCounter, GSet, LwwRegister, NodeId, PnCounter, RemovedNodePruning};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A replicated value: one of the supported CRDT payloads, or the
/// `Deleted` tombstone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    /// Grow-only counter.
    Counter(GCounter),
    /// Increment/decrement counter.
    PnCounter(PnCounter),
    /// Grow-only set of strings.
    Set(GSet<String>),
    /// Last-writer-wins register over a string.
    Register(LwwRegister<String>),
    /// Tombstone: the key has been deleted and can never hold data again.
    /// Merging anything with `Deleted` yields `Deleted`.
    Deleted,
}

/// Structural shape of a [`Value`]; the per-key stability token.
///
/// Every key holds values of a single shape for its whole life (or the
/// tombstone). An update proposing a different shape is rejected without
/// touching the stored entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValueShape {
    /// [`Value::Counter`].
    Counter,
    /// [`Value::PnCounter`].
    PnCounter,
    /// [`Value::Set`].
    Set,
    /// [`Value::Register`].
    Register,
    /// [`Value::Deleted`].
    Deleted,
}

impl fmt::Display for ValueShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueShape::Counter => "counter",
            ValueShape::PnCounter => "pn-counter",
            ValueShape::Set => "set",
            ValueShape::Register => "register",
            ValueShape::Deleted => "deleted",
        };
        f.write_str(name)
    }
}

impl Value {
    /// The shape discriminant of this value.
    pub fn shape(&self) -> ValueShape {
        match self {
            Value::Counter(_) => ValueShape::Counter,
            Value::PnCounter(_) => ValueShape::PnCounter,
            Value::Set(_) => ValueShape::Set,
            Value::Register(_) => ValueShape::Register,
            Value::Deleted => ValueShape::Deleted,
        }
    }

    /// Whether this value is the tombstone.
    pub fn is_deleted(&self) -> bool {
        matches!(self, Value::Deleted)
    }

    /// Merge two values of the same shape.
    ///
    /// `Deleted` on either side absorbs the merge. On a shape mismatch
    /// the receiver (`self`) is kept unchanged; the write and update
    /// paths reject mismatches before ever merging, so hitting this
    /// branch means a remote replica disagrees about the key's type and
    /// the local shape wins.
    pub fn merge(&self, other: &Value) -> Value {
        match (self, other) {
            (Value::Deleted, _) | (_, Value::Deleted) => Value::Deleted,
            (Value::Counter(a), Value::Counter(b)) => Value::Counter(a.merge(b)),
            (Value::PnCounter(a), Value::PnCounter(b)) => Value::PnCounter(a.merge(b)),
            (Value::Set(a), Value::Set(b)) => Value::Set(a.merge(b)),
            (Value::Register(a), Value::Register(b)) => Value::Register(a.merge(b)),
            _ => self.clone(),
        }
    }

    /// Whether the payload supports removed-node pruning at all.
    pub fn supports_pruning(&self) -> bool {
        matches!(self, Value::Counter(_) | Value::PnCounter(_))
    }

    /// Whether the payload still carries state attributed to `removed`.
    pub fn needs_pruning_from(&self, removed: &NodeId) -> bool {
        match self {
            Value::Counter(c) => c.needs_pruning_from(removed),
            Value::PnCounter(c) => c.needs_pruning_from(removed),
            _ => false,
        }
    }

    /// Move `removed`'s contribution onto `owner`. No-op for payloads
    /// without per-node state.
    pub fn prune(&self, removed: &NodeId, owner: &NodeId) -> Value {
        match self {
            Value::Counter(c) => Value::Counter(c.prune(removed, owner)),
            Value::PnCounter(c) => Value::PnCounter(c.prune(removed, owner)),
            other => other.clone(),
        }
    }

    /// Strip remaining traces of `removed`. No-op for payloads without
    /// per-node state.
    pub fn pruning_cleanup(&self, removed: &NodeId) -> Value {
        match self {
            Value::Counter(c) => Value::Counter(c.pruning_cleanup(removed)),
            Value::PnCounter(c) => Value::PnCounter(c.pruning_cleanup(removed)),
            other => other.clone(),
        }
    }
}
