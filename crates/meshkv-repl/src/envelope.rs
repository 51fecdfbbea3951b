//! The replication envelope: a value plus per-removed-node pruning
//! metadata.
//!
//! Envelopes are the unit the engine stores, ships between replicas, and
//! digests for anti-entropy. The pruning map rides along with the data so
//! the three-phase removed-node pruning protocol converges through the
//! same merges as the data itself.

use crate::value::Value;
use meshkv_crdt::{NodeAddr, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Phase of the pruning protocol for one removed node, per key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PruningPhase {
    /// The owner has announced intent to prune; `seen` collects the
    /// addresses of replicas that have acknowledged the announcement.
    Init {
        /// Replica addresses that have witnessed this entry.
        seen: BTreeSet<NodeAddr>,
    },
    /// The owner has re-attributed the removed node's state to itself.
    Performed,
}

/// Pruning state for one removed node within one envelope.
///
/// Forms a join-semilattice: `Performed` absorbs everything; two `Init`s
/// with the same owner union their seen sets; two `Init`s with different
/// owners resolve to the lesser owner (total order on [`NodeId`]), so all
/// replicas agree on a single owner without coordination.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PruningState {
    /// The node that will absorb the removed node's contribution.
    pub owner: NodeId,
    /// Current phase.
    pub phase: PruningPhase,
}

impl PruningState {
    /// A fresh `Init` entry owned by `owner` with an empty seen set.
    pub fn init(owner: NodeId) -> Self {
        Self {
            owner,
            phase: PruningPhase::Init {
                seen: BTreeSet::new(),
            },
        }
    }

    /// Semilattice join of two pruning states.
    pub fn merge(&self, other: &PruningState) -> PruningState {
        match (&self.phase, &other.phase) {
            // Two performed prunes can name different owners after a
            // leadership change; the owner tie-break keeps the join
            // deterministic in that case too.
            (PruningPhase::Performed, PruningPhase::Performed) => {
                if self.owner <= other.owner {
                    self.clone()
                } else {
                    other.clone()
                }
            }
            (PruningPhase::Performed, _) => self.clone(),
            (_, PruningPhase::Performed) => other.clone(),
            (PruningPhase::Init { seen: ours }, PruningPhase::Init { seen: theirs }) => {
                if self.owner == other.owner {
                    PruningState {
                        owner: self.owner.clone(),
                        phase: PruningPhase::Init {
                            seen: ours.union(theirs).cloned().collect(),
                        },
                    }
                } else if self.owner < other.owner {
                    self.clone()
                } else {
                    other.clone()
                }
            }
        }
    }
}

/// A value paired with its pruning metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    /// The replicated payload.
    pub data: Value,
    /// Pruning state per removed node still being erased from `data`.
    pub pruning: BTreeMap<NodeId, PruningState>,
}

impl Envelope {
    /// Wrap a value with no pruning metadata.
    pub fn new(data: Value) -> Self {
        Self {
            data,
            pruning: BTreeMap::new(),
        }
    }

    /// The tombstone envelope.
    pub fn deleted() -> Self {
        Self::new(Value::Deleted)
    }

    /// Whether the envelope holds the tombstone.
    pub fn is_deleted(&self) -> bool {
        self.data.is_deleted()
    }

    /// Merge with another replica's envelope.
    ///
    /// A tombstone on either side absorbs the merge. Otherwise the
    /// pruning maps are joined entry-wise, both payloads are cleaned for
    /// every entry already in phase `Performed`, and the payloads are
    /// merged. Shape disagreement is resolved in the receiver's favour by
    /// [`Value::merge`]; callers that must reject mismatches check shapes
    /// before merging.
    pub fn merge(&self, other: &Envelope) -> Envelope {
        if self.is_deleted() || other.is_deleted() {
            return Envelope::deleted();
        }

        let mut pruning = self.pruning.clone();
        for (removed, state) in &other.pruning {
            match pruning.get(removed) {
                Some(existing) => {
                    let joined = existing.merge(state);
                    pruning.insert(removed.clone(), joined);
                }
                None => {
                    pruning.insert(removed.clone(), state.clone());
                }
            }
        }

        let mut ours = self.data.clone();
        let mut theirs = other.data.clone();
        for (removed, state) in &pruning {
            if state.phase == PruningPhase::Performed {
                ours = ours.pruning_cleanup(removed);
                theirs = theirs.pruning_cleanup(removed);
            }
        }

        Envelope {
            data: ours.merge(&theirs),
            pruning,
        }
    }

    /// Start pruning `removed` with `owner` as the absorbing node.
    /// No-op if an entry for `removed` already exists.
    pub fn init_pruning(&mut self, removed: NodeId, owner: NodeId) {
        self.pruning
            .entry(removed)
            .or_insert_with(|| PruningState::init(owner));
    }

    /// Replace the pruning entry for `removed`, regardless of its current
    /// owner or phase. Used by a leader taking over an orphaned `Init`.
    pub fn set_pruning(&mut self, removed: NodeId, state: PruningState) {
        self.pruning.insert(removed, state);
    }

    /// The pruning entry for `removed`, if any.
    pub fn pruning_state(&self, removed: &NodeId) -> Option<&PruningState> {
        self.pruning.get(removed)
    }

    /// Perform the prune for `removed`: re-attribute its contribution to
    /// the entry's owner and advance the phase to `Performed`.
    ///
    /// Requires an existing pruning entry; without one this is a no-op,
    /// since there is no owner to attribute to.
    pub fn prune(&mut self, removed: &NodeId) {
        if let Some(state) = self.pruning.get_mut(removed) {
            self.data = self.data.prune(removed, &state.owner);
            state.phase = PruningPhase::Performed;
        }
    }

    /// Record that `node` has witnessed every `Init` entry in this
    /// envelope. Returns true if any seen set actually grew, so callers
    /// can skip re-digesting an unchanged envelope.
    pub fn add_seen(&mut self, node: &NodeAddr) -> bool {
        let mut changed = false;
        for state in self.pruning.values_mut() {
            if let PruningPhase::Init { seen } = &mut state.phase {
                changed |= seen.insert(node.clone());
            }
        }
        changed
    }

    /// Strip the pruning entry for `removed` and clean its traces out of
    /// the data. The tombstone-phase rewrite applied once a removed node
    /// graduates from the pruning protocol.
    pub fn strip_removed(&mut self, removed: &NodeId) -> bool {
        let had_entry = self.pruning.remove(removed).is_some();
        let needed = self.data.needs_pruning_from(removed);
        if needed {
            self.data = self.data.pruning_cleanup(removed);
        }
        had_entry || needed
    }
}
