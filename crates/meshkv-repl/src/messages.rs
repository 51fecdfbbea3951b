//! Protocol messages: the closed peer-to-peer message set, client reply
//! types, cluster events, and subscription notifications.

use crate::consistency::{ReadConsistency, WriteConsistency};
use crate::digest::Digest;
use crate::envelope::Envelope;
use crate::value::{Value, ValueShape};
use meshkv_crdt::{NodeAddr, NodeId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A key in the store.
pub type Key = String;

/// Correlation id linking peer replies back to the coordinator that
/// issued the request. Scoped to the issuing node.
pub type RequestId = u64;

/// The closed message set exchanged between replication engines.
///
/// Envelope-bearing messages serialize with `bincode`; the serialized
/// envelope image is canonical, so equal envelopes yield equal digests
/// on every node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum PeerMessage {
    /// Ask a replica for its envelope for `key`.
    Read {
        /// The key to read.
        key: Key,
        /// Correlation id for the reply.
        req: RequestId,
    },
    /// Reply to [`PeerMessage::Read`]: the replica's envelope, if any.
    ReadResult {
        /// The envelope held by the replying replica, if any.
        envelope: Option<Envelope>,
        /// Correlation id of the originating read.
        req: RequestId,
    },
    /// Replicate an envelope to a peer.
    Write {
        /// The key being written.
        key: Key,
        /// The envelope to merge into the peer's store.
        envelope: Envelope,
        /// Correlation id for the acknowledgement.
        req: RequestId,
    },
    /// Acknowledge a [`PeerMessage::Write`].
    WriteAck {
        /// Correlation id of the acknowledged write.
        req: RequestId,
    },
    /// Write back the merged result of a quorum read to a replica.
    ReadRepair {
        /// The key being repaired.
        key: Key,
        /// The merged envelope.
        envelope: Envelope,
        /// Correlation id for the acknowledgement.
        req: RequestId,
    },
    /// Acknowledge a [`PeerMessage::ReadRepair`].
    ReadRepairAck {
        /// Correlation id of the acknowledged repair.
        req: RequestId,
    },
    /// Gossip digest exchange: the sender's full digest map.
    Status {
        /// Digest of every key in the sender's store.
        digests: BTreeMap<Key, Digest>,
    },
    /// Gossip delta: envelopes the sender believes the receiver lacks or
    /// holds outdated.
    Gossip {
        /// The shipped envelopes, at most `max_delta_elements` of them.
        envelopes: BTreeMap<Key, Envelope>,
    },
}

/// Reply to a `Get`.
#[derive(Debug, Clone, PartialEq)]
pub enum GetReply {
    /// The key was found; `value` is the merged read result.
    Success {
        /// The key that was read.
        key: Key,
        /// The value observed at the requested consistency.
        value: Value,
    },
    /// No replica that answered held the key.
    NotFound {
        /// The key that was read.
        key: Key,
    },
    /// The key has been deleted.
    Deleted {
        /// The key that was read.
        key: Key,
    },
    /// Not enough replicas answered within the timeout.
    Failure {
        /// The key that was read.
        key: Key,
    },
}

/// Reply to an `Update`.
#[derive(Debug, PartialEq)]
pub enum UpdateReply {
    /// The update was committed at the requested write level.
    Success {
        /// The updated key.
        key: Key,
    },
    /// The update committed locally but too few peers acknowledged in
    /// time. The local state keeps the new value; gossip completes the
    /// replication eventually.
    ReplicationFailure {
        /// The updated key.
        key: Key,
    },
    /// The modify function produced a value of a different shape than
    /// the one stored under this key. Nothing was changed.
    ConflictingType {
        /// The key the update targeted.
        key: Key,
        /// The shape stored under the key.
        stored: ValueShape,
        /// The shape the modify function produced.
        proposed: ValueShape,
    },
    /// The update was submitted from a non-local sender. Nothing was
    /// changed.
    InvalidUsage {
        /// The key the update targeted.
        key: Key,
    },
    /// The modify function failed. Nothing was changed.
    ModifyFailure {
        /// The key the update targeted.
        key: Key,
        /// The failure message produced by the modify function.
        reason: String,
    },
    /// The key has been deleted; updates can never succeed again.
    Deleted {
        /// The key the update targeted.
        key: Key,
    },
}

/// Reply to a `Delete`.
#[derive(Debug, Clone, PartialEq)]
pub enum DeleteReply {
    /// The tombstone was committed at the requested write level.
    Success {
        /// The deleted key.
        key: Key,
    },
    /// The tombstone committed locally but too few peers acknowledged in
    /// time. Gossip finishes spreading the tombstone eventually.
    ReplicationFailure {
        /// The deleted key.
        key: Key,
    },
    /// The key was already deleted.
    AlreadyDeleted {
        /// The key the delete targeted.
        key: Key,
    },
}

/// Notification delivered to a key's subscribers.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent {
    /// The key's value changed.
    Changed {
        /// The changed key.
        key: Key,
        /// The new value.
        value: Value,
    },
    /// The key was deleted.
    Deleted {
        /// The deleted key.
        key: Key,
    },
}

/// A cluster member as reported by the membership service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// The member's unique identity.
    pub node: NodeId,
    /// Roles the member carries.
    pub roles: BTreeSet<String>,
}

impl Member {
    /// A member with no roles.
    pub fn new(node: NodeId) -> Self {
        Self {
            node,
            roles: BTreeSet::new(),
        }
    }

    /// A member carrying the given roles.
    pub fn with_roles<I, S>(node: NodeId, roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            node,
            roles: roles.into_iter().map(Into::into).collect(),
        }
    }
}

/// Cluster signals consumed by the engine's membership adapter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterEvent {
    /// A member joined the cluster.
    MemberUp(Member),
    /// A member left the cluster for good.
    MemberRemoved(Member),
    /// A previously unreachable member is reachable again.
    Reachable(NodeAddr),
    /// A member became unreachable.
    Unreachable(NodeAddr),
    /// The cluster leader changed (role-scoped when a role filter is
    /// configured).
    LeaderChanged(Option<NodeAddr>),
}

/// Parameters of an `Update` operation.
#[derive(Debug, Clone, Copy)]
pub struct UpdateSpec {
    /// Consistency of the optional pre-read.
    pub read: ReadConsistency,
    /// Consistency of the write.
    pub write: WriteConsistency,
    /// Budget for each coordinated phase.
    pub timeout: std::time::Duration,
}
