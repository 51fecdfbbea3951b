//! Three-phase garbage collection of removed nodes' CRDT metadata.
//!
//! When a member leaves for good, payloads that attribute state per node
//! (the counters) still carry its slots. The controller erases them in
//! three phases, each gated on the reachability clock so a partitioned
//! replica can never miss the announcement:
//!
//! - **Init** (leader only): after `max_pruning_dissemination`, the
//!   leader stamps every affected envelope with an `Init` entry naming
//!   itself owner. Replicas acknowledge by `add_seen` on every incoming
//!   replication, so the entry's seen set converges towards the peer set.
//! - **Perform**: once every current peer has been seen, the owner moves
//!   the removed node's contribution onto itself and marks `Performed`.
//! - **Tombstone**: after another `max_pruning_dissemination`, the
//!   removed node is added to the tombstone set, its metadata stripped
//!   from every envelope, and every future incoming envelope is cleaned
//!   before merge so late gossip cannot resurrect it.

use crate::config::ReplicatorConfig;
use crate::envelope::{Envelope, PruningPhase, PruningState};
use crate::error::ReplError;
use crate::membership::Membership;
use crate::store::LocalStore;
use meshkv_crdt::NodeId;
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::{debug, info};

/// Per-node pruning bookkeeping, driven by the pruning tick.
#[derive(Debug, Default)]
pub struct PruningController {
    /// Removed nodes awaiting pruning, with their removal time on the
    /// reachability clock.
    removed: BTreeMap<NodeId, Duration>,
    /// Nodes whose prune has been performed (locally or observed via
    /// replication), with the time of that transition.
    performed: BTreeMap<NodeId, Duration>,
    /// Terminally erased nodes. Incoming envelopes are cleaned against
    /// this set before every merge.
    tombstoned: BTreeSet<NodeId>,
}

impl PruningController {
    /// An empty controller.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `node` was removed from the cluster at clock time
    /// `now`.
    pub fn note_removed(&mut self, node: NodeId, now: Duration) {
        debug!(%node, at = ?now, "removed node queued for pruning");
        self.removed.entry(node).or_insert(now);
    }

    /// Record that a `Performed` phase for `node` was observed in an
    /// incoming envelope. Lets non-owner replicas time their own
    /// tombstone phase.
    pub fn observe_performed(&mut self, node: &NodeId, now: Duration) {
        if self.removed.contains_key(node) && !self.performed.contains_key(node) {
            debug!(%node, "observed performed prune via replication");
            self.performed.insert(node.clone(), now);
        }
    }

    /// The tombstoned node set.
    pub fn tombstoned(&self) -> &BTreeSet<NodeId> {
        &self.tombstoned
    }

    /// Nodes currently queued for pruning.
    pub fn removed_nodes(&self) -> impl Iterator<Item = &NodeId> {
        self.removed.keys()
    }

    /// Strip every tombstoned node from an incoming envelope. Applied
    /// before merging anything received from a peer, so stale state for
    /// long-gone nodes is absorbed instead of resurrected.
    pub fn cleanup_envelope(&self, mut envelope: Envelope) -> Envelope {
        for node in &self.tombstoned {
            envelope.strip_removed(node);
        }
        envelope
    }

    /// Run one pruning tick: advance all three phases.
    pub fn tick(
        &mut self,
        store: &mut LocalStore,
        membership: &Membership,
        config: &ReplicatorConfig,
        self_id: &NodeId,
    ) -> Result<(), ReplError> {
        let now = membership.clock();
        if membership.is_leader() {
            self.initialise(store, config, self_id, now)?;
        }
        self.perform(store, membership, self_id, now)?;
        self.tombstone(store, config, now)?;
        Ok(())
    }

    /// Phase A: stamp `Init` entries for ripe removed nodes (leader only;
    /// the caller gates on leadership).
    fn initialise(
        &mut self,
        store: &mut LocalStore,
        config: &ReplicatorConfig,
        self_id: &NodeId,
        now: Duration,
    ) -> Result<(), ReplError> {
        for (removed, removed_at) in &self.removed {
            if now < *removed_at + config.max_pruning_dissemination {
                continue;
            }
            for key in store.live_keys() {
                let Some(entry) = store.get(&key) else { continue };
                if !entry.envelope.data.needs_pruning_from(removed) {
                    continue;
                }
                let overwrite = match entry.envelope.pruning_state(removed) {
                    None => true,
                    // A previous leader's orphaned Init is taken over.
                    Some(state) => {
                        matches!(state.phase, PruningPhase::Init { .. }) && state.owner != *self_id
                    }
                };
                if overwrite {
                    info!(key = %key, %removed, "initialising pruning");
                    let mut envelope = entry.envelope.clone();
                    envelope.set_pruning(removed.clone(), PruningState::init(self_id.clone()));
                    store.set(&key, envelope)?;
                }
            }
        }
        Ok(())
    }

    /// Phase B: perform prunes this node owns once every current peer
    /// has witnessed the Init.
    fn perform(
        &mut self,
        store: &mut LocalStore,
        membership: &Membership,
        self_id: &NodeId,
        now: Duration,
    ) -> Result<(), ReplError> {
        let peers = membership.peers();
        for key in store.all_keys() {
            let Some(entry) = store.get(&key) else { continue };
            let ripe: Vec<NodeId> = entry
                .envelope
                .pruning
                .iter()
                .filter(|(_, state)| state.owner == *self_id)
                .filter_map(|(removed, state)| match &state.phase {
                    PruningPhase::Init { seen } if peers.iter().all(|p| seen.contains(p)) => {
                        Some(removed.clone())
                    }
                    _ => None,
                })
                .collect();
            if ripe.is_empty() {
                continue;
            }
            let mut envelope = entry.envelope.clone();
            for removed in ripe {
                info!(key = %key, %removed, "performing prune");
                envelope.prune(&removed);
                self.performed.entry(removed).or_insert(now);
            }
            store.set(&key, envelope)?;
        }
        Ok(())
    }

    /// Phase C: tombstone nodes whose prune has fully disseminated.
    fn tombstone(
        &mut self,
        store: &mut LocalStore,
        config: &ReplicatorConfig,
        now: Duration,
    ) -> Result<(), ReplError> {
        let ripe: Vec<NodeId> = self
            .performed
            .iter()
            .filter(|(_, performed_at)| now >= **performed_at + config.max_pruning_dissemination)
            .filter(|(removed, _)| self.all_pruning_performed(store, removed))
            .map(|(removed, _)| (*removed).clone())
            .collect();

        for removed in ripe {
            info!(%removed, "tombstoning removed node");
            self.removed.remove(&removed);
            self.performed.remove(&removed);
            self.tombstoned.insert(removed.clone());
            for key in store.all_keys() {
                let Some(entry) = store.get(&key) else { continue };
                let mut envelope = entry.envelope.clone();
                if envelope.strip_removed(&removed) {
                    store.set(&key, envelope)?;
                }
            }
        }
        Ok(())
    }

    /// Whether no key still holds an un-performed Init for `removed`.
    fn all_pruning_performed(&self, store: &LocalStore, removed: &NodeId) -> bool {
        store.all_keys().iter().all(|key| {
            let Some(entry) = store.get(key) else {
                return true;
            };
            match entry.envelope.pruning_state(removed) {
                Some(state) => !matches!(state.phase, PruningPhase::Init { .. }),
                None => !entry.envelope.data.needs_pruning_from(removed),
            }
        })
    }
}
