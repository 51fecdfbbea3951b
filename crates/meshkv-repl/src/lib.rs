#![warn(missing_docs)]

//! MeshKV replication engine: a per-node replicated in-memory key-value
//! store over CRDTs.
//!
//! Every node runs an identical replica; clients only ever talk to their
//! local one. Writes are accepted anywhere and converge by monotonic
//! merge; a gossip anti-entropy protocol continuously repairs divergence
//! between replicas; and per-operation consistency levels let callers
//! trade latency for freshness. Metadata attributed to nodes that left
//! the cluster is garbage-collected by a three-phase pruning protocol,
//! keeping state bounded.
//!
//! The engine is a single task per node owning all replica state (see
//! [`engine::Replicator`]); transient read/write coordinators fan
//! operations out to peers and answer when a quorum is reached or the
//! timeout elapses.

pub mod config;
pub mod consistency;
pub mod digest;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod gossip;
pub mod membership;
pub mod messages;
pub mod pruning;
pub mod store;
pub mod transport;
pub mod value;

mod read_coordinator;
mod write_coordinator;

pub use config::ReplicatorConfig;
pub use consistency::{ReadConsistency, WriteConsistency};
pub use digest::Digest;
pub use engine::{Replicator, ReplicatorHandle};
pub use envelope::{Envelope, PruningPhase, PruningState};
pub use error::ReplError;
pub use messages::{
    ClusterEvent, DeleteReply, GetReply, Key, Member, PeerMessage, SubscriptionEvent, UpdateReply,
};
pub use store::WatcherId;
pub use transport::ClusterBus;
pub use value::{Value, ValueShape};
