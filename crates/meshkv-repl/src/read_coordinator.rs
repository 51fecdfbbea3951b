//! Transient read coordinator: fans a read out to every peer, merges
//! the replies, applies read-repair locally, and answers at the
//! requested consistency level.

use crate::consistency::{ReadConsistency, Threshold};
use crate::engine::{Command, CoordReply};
use crate::envelope::Envelope;
use crate::messages::{GetReply, Key, PeerMessage, RequestId};
use crate::transport::ClusterBus;
use meshkv_crdt::NodeAddr;
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout_at, Instant};
use tracing::debug;

/// How long a finished coordinator keeps draining late replies so they
/// are not logged as unroutable by the engine.
pub(crate) const COORDINATOR_LINGER: Duration = Duration::from_secs(2);

/// Where the final answer goes.
pub(crate) enum ReadTarget {
    /// A client `Get`: answer on the oneshot.
    Client(oneshot::Sender<GetReply>),
    /// The pre-read of a two-phase update: wake the engine's parked
    /// continuation for the key. The read outcome itself is irrelevant;
    /// read-repair has already folded whatever was learned into the
    /// local store.
    UpdateContinuation,
}

pub(crate) struct ReadCoordinator {
    pub req: RequestId,
    pub key: Key,
    pub consistency: ReadConsistency,
    pub timeout: Duration,
    pub peers: BTreeSet<NodeAddr>,
    pub local: Option<Envelope>,
    pub bus: ClusterBus,
    pub self_addr: NodeAddr,
    pub replies: mpsc::UnboundedReceiver<CoordReply>,
    pub target: ReadTarget,
    pub engine: mpsc::UnboundedSender<Command>,
}

enum ReadOutcome {
    /// Enough replicas answered; the merged result (None = no replica
    /// held the key).
    Complete(Option<Envelope>),
    /// Timeout or unattainable level.
    Failed,
}

impl ReadCoordinator {
    pub(crate) async fn run(mut self) {
        let deadline = Instant::now() + self.timeout;
        let threshold = self.consistency.threshold(self.peers.len());

        let outcome = if threshold == Threshold::Unattainable {
            debug!(key = %self.key, "read level unattainable on this cluster");
            ReadOutcome::Failed
        } else {
            self.broadcast();
            self.gather(threshold, deadline).await
        };

        let repaired = self.read_repair(&outcome, deadline).await;
        self.reply(outcome, repaired);
        self.linger().await;
        let _ = self.engine.send(Command::CoordinatorDone { req: self.req });
    }

    fn broadcast(&self) {
        for peer in &self.peers {
            self.bus.send(
                peer,
                self.self_addr.clone(),
                PeerMessage::Read {
                    key: self.key.clone(),
                    req: self.req,
                },
            );
        }
    }

    async fn gather(&mut self, threshold: Threshold, deadline: Instant) -> ReadOutcome {
        let mut remaining = self.peers.clone();
        let mut result = self.local.clone();

        while !threshold.met(remaining.len()) {
            match timeout_at(deadline, self.replies.recv()).await {
                Ok(Some(CoordReply::ReadResult { from, envelope })) => {
                    // Duplicate replies from one address are harmless:
                    // the first removes it from the remaining set and
                    // merge is idempotent anyway.
                    if remaining.remove(&from) {
                        if let Some(envelope) = envelope {
                            result = Some(match result {
                                Some(acc) => acc.merge(&envelope),
                                None => envelope,
                            });
                        }
                    }
                }
                Ok(Some(other)) => {
                    debug!(key = %self.key, reply = ?other, "unexpected reply to read");
                }
                Ok(None) => return ReadOutcome::Failed,
                Err(_) => {
                    debug!(key = %self.key, "read timed out");
                    return ReadOutcome::Failed;
                }
            }
        }
        ReadOutcome::Complete(result)
    }

    /// Write the merged result back through the local engine and wait
    /// for its acknowledgement, so a subsequent local read observes it.
    async fn read_repair(&mut self, outcome: &ReadOutcome, deadline: Instant) -> bool {
        let ReadOutcome::Complete(Some(envelope)) = outcome else {
            return true;
        };
        self.bus.send(
            &self.self_addr,
            self.self_addr.clone(),
            PeerMessage::ReadRepair {
                key: self.key.clone(),
                envelope: envelope.clone(),
                req: self.req,
            },
        );
        loop {
            match timeout_at(deadline, self.replies.recv()).await {
                Ok(Some(CoordReply::ReadRepairAck { .. })) => return true,
                Ok(Some(other)) => {
                    debug!(key = %self.key, reply = ?other, "late reply while awaiting repair ack");
                }
                Ok(None) | Err(_) => return false,
            }
        }
    }

    fn reply(&mut self, outcome: ReadOutcome, repaired: bool) {
        let answer = match (&outcome, repaired) {
            (ReadOutcome::Complete(Some(envelope)), true) => {
                if envelope.is_deleted() {
                    GetReply::Deleted {
                        key: self.key.clone(),
                    }
                } else {
                    GetReply::Success {
                        key: self.key.clone(),
                        value: envelope.data.clone(),
                    }
                }
            }
            (ReadOutcome::Complete(None), _) => GetReply::NotFound {
                key: self.key.clone(),
            },
            _ => GetReply::Failure {
                key: self.key.clone(),
            },
        };

        match std::mem::replace(&mut self.target, ReadTarget::UpdateContinuation) {
            ReadTarget::Client(sender) => {
                let _ = sender.send(answer);
            }
            ReadTarget::UpdateContinuation => {
                let _ = self.engine.send(Command::UpdateReadComplete {
                    key: self.key.clone(),
                });
            }
        }
    }

    async fn linger(&mut self) {
        let linger_deadline = Instant::now() + COORDINATOR_LINGER;
        while let Ok(Some(_)) = timeout_at(linger_deadline, self.replies.recv()).await {}
    }
}
