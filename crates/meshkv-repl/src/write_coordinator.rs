//! Transient write coordinator: broadcasts a committed envelope to every
//! peer and counts acknowledgements until the requested level is met.
//!
//! The value is already committed locally when the coordinator starts; a
//! timeout therefore reports incomplete replication, not a rollback.
//! Gossip finishes spreading the value either way.

use crate::consistency::{Threshold, WriteConsistency};
use crate::engine::{Command, CoordReply};
use crate::envelope::Envelope;
use crate::messages::{DeleteReply, Key, PeerMessage, RequestId, UpdateReply};
use crate::read_coordinator::COORDINATOR_LINGER;
use crate::transport::ClusterBus;
use meshkv_crdt::NodeAddr;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout_at, Instant};
use tracing::debug;

/// Which client operation this write serves; determines the reply type.
pub(crate) enum WriteTarget {
    /// An `Update`'s replication phase.
    Update(oneshot::Sender<UpdateReply>),
    /// A `Delete`'s replication phase.
    Delete(oneshot::Sender<DeleteReply>),
}

pub(crate) struct WriteCoordinator {
    pub req: RequestId,
    pub key: Key,
    pub envelope: Envelope,
    pub consistency: WriteConsistency,
    pub timeout: Duration,
    pub peers: BTreeSet<NodeAddr>,
    pub bus: ClusterBus,
    pub self_addr: NodeAddr,
    pub replies: mpsc::UnboundedReceiver<CoordReply>,
    pub target: Option<WriteTarget>,
    pub engine: mpsc::UnboundedSender<Command>,
}

impl WriteCoordinator {
    pub(crate) async fn run(mut self) {
        let deadline = Instant::now() + self.timeout;
        let threshold = self.consistency.threshold(self.peers.len());

        match threshold {
            Threshold::Unattainable => {
                debug!(key = %self.key, "write level unattainable on this cluster");
                self.reply(false);
            }
            threshold if threshold.met(self.peers.len()) => {
                // Already satisfied (e.g. single-node cluster): answer
                // synchronously, then still broadcast so peers converge
                // without waiting for gossip.
                self.reply(true);
                self.broadcast();
                self.linger().await;
            }
            threshold => {
                self.broadcast();
                let succeeded = self.gather(threshold, deadline).await;
                self.reply(succeeded);
                self.linger().await;
            }
        }

        let _ = self.engine.send(Command::CoordinatorDone { req: self.req });
    }

    fn broadcast(&self) {
        for peer in &self.peers {
            self.bus.send(
                peer,
                self.self_addr.clone(),
                PeerMessage::Write {
                    key: self.key.clone(),
                    envelope: self.envelope.clone(),
                    req: self.req,
                },
            );
        }
    }

    async fn gather(&mut self, threshold: Threshold, deadline: Instant) -> bool {
        let mut remaining = self.peers.clone();
        while !threshold.met(remaining.len()) {
            match timeout_at(deadline, self.replies.recv()).await {
                Ok(Some(CoordReply::WriteAck { from })) => {
                    remaining.remove(&from);
                }
                Ok(Some(other)) => {
                    debug!(key = %self.key, reply = ?other, "unexpected reply to write");
                }
                Ok(None) => return false,
                Err(_) => {
                    debug!(key = %self.key, "write timed out");
                    return false;
                }
            }
        }
        true
    }

    fn reply(&mut self, succeeded: bool) {
        let key = self.key.clone();
        match self.target.take() {
            Some(WriteTarget::Update(sender)) => {
                let reply = if succeeded {
                    UpdateReply::Success { key }
                } else {
                    UpdateReply::ReplicationFailure { key }
                };
                let _ = sender.send(reply);
            }
            Some(WriteTarget::Delete(sender)) => {
                let reply = if succeeded {
                    DeleteReply::Success { key }
                } else {
                    DeleteReply::ReplicationFailure { key }
                };
                let _ = sender.send(reply);
            }
            None => {}
        }
    }

    async fn linger(&mut self) {
        let linger_deadline = Instant::now() + COORDINATOR_LINGER;
        while let Ok(Some(_)) = timeout_at(linger_deadline, self.replies.recv()).await {}
    }
}
