//! The replication engine: a single task owning all replica state.
//!
//! Every mutation of the entry store, peer set, pruning bookkeeping, and
//! subscriber table happens on this task; there are no locks. Clients
//! talk to it through a [`ReplicatorHandle`]; peers talk to it through
//! the cluster bus; read/write coordinators are short-lived tasks that
//! communicate with it by message passing and own nothing but their
//! pending reply and deadline.
//!
//! Commands for one key are applied in arrival order. The two-phase
//! update path (quorum read before modify) parks subsequent commands for
//! that key in a FIFO buffer so a client that just wrote through a
//! quorum can read its own write. No ordering holds across keys.

use crate::config::ReplicatorConfig;
use crate::consistency::{ReadConsistency, WriteConsistency};
use crate::envelope::{Envelope, PruningPhase};
use crate::error::ReplError;
use crate::gossip;
use crate::membership::{Membership, MembershipChange};
use crate::messages::{
    ClusterEvent, DeleteReply, GetReply, Key, PeerMessage, RequestId, SubscriptionEvent,
    UpdateReply, UpdateSpec,
};
use crate::pruning::PruningController;
use crate::read_coordinator::{ReadCoordinator, ReadTarget};
use crate::store::{LocalStore, WatcherId};
use crate::transport::{ClusterBus, PeerPacket};
use crate::value::Value;
use crate::write_coordinator::{WriteCoordinator, WriteTarget};
use meshkv_crdt::{NodeAddr, NodeId};
use rand::Rng;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::ops::ControlFlow;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// The modify function an `Update` applies to the current value.
pub type Modify = Box<dyn FnOnce(Option<&Value>) -> Result<Value, String> + Send>;

/// Commands processed by the engine task.
pub(crate) enum Command {
    Get {
        key: Key,
        consistency: ReadConsistency,
        timeout: Duration,
        reply: oneshot::Sender<GetReply>,
    },
    GetKeys {
        reply: oneshot::Sender<BTreeSet<Key>>,
    },
    Update {
        key: Key,
        spec: UpdateSpec,
        origin: NodeAddr,
        modify: Modify,
        reply: oneshot::Sender<UpdateReply>,
    },
    Delete {
        key: Key,
        consistency: WriteConsistency,
        timeout: Duration,
        reply: oneshot::Sender<DeleteReply>,
    },
    Subscribe {
        key: Key,
        watcher: WatcherId,
        sender: mpsc::UnboundedSender<SubscriptionEvent>,
    },
    Unsubscribe {
        key: Key,
        watcher: WatcherId,
    },
    Cluster(ClusterEvent),
    GossipTick,
    PruningTick,
    ClockTick {
        elapsed: Duration,
    },
    /// A two-phase update's pre-read finished (in any way).
    UpdateReadComplete {
        key: Key,
    },
    /// A coordinator fully terminated, linger included.
    CoordinatorDone {
        req: RequestId,
    },
}

/// Peer replies routed from the engine to a waiting coordinator.
#[derive(Debug)]
pub(crate) enum CoordReply {
    ReadResult {
        from: NodeAddr,
        envelope: Option<Envelope>,
    },
    WriteAck {
        from: NodeAddr,
    },
    ReadRepairAck {
        #[allow(dead_code)]
        from: NodeAddr,
    },
}

/// A parked two-phase update waiting for its pre-read.
struct PendingUpdate {
    write: WriteConsistency,
    timeout: Duration,
    modify: Modify,
    reply: oneshot::Sender<UpdateReply>,
}

/// Per-key pipeline state while an update-in-progress parks commands.
#[derive(Default)]
struct KeyPipeline {
    continuation: Option<PendingUpdate>,
    queue: VecDeque<Command>,
}

struct Engine {
    self_id: NodeId,
    config: ReplicatorConfig,
    bus: ClusterBus,
    store: LocalStore,
    membership: Membership,
    pruning: PruningController,
    pending: HashMap<RequestId, mpsc::UnboundedSender<CoordReply>>,
    in_progress: BTreeMap<Key, KeyPipeline>,
    next_req: RequestId,
    cmd_tx: mpsc::UnboundedSender<Command>,
}

impl Engine {
    async fn run(
        mut self,
        mut cmd_rx: mpsc::UnboundedReceiver<Command>,
        mut peer_rx: mpsc::UnboundedReceiver<PeerPacket>,
    ) {
        let mut gossip_timer = tokio::time::interval(self.config.gossip_interval);
        let mut pruning_timer = tokio::time::interval(self.config.pruning_interval);
        gossip_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        pruning_timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_clock = Instant::now();

        info!(node = %self.self_id, "replicator started");
        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => {
                        if self.handle_command(cmd).is_break() {
                            break;
                        }
                    }
                    None => break,
                },
                packet = peer_rx.recv() => match packet {
                    Some(packet) => self.handle_peer(packet),
                    None => break,
                },
                _ = gossip_timer.tick() => {
                    // The gossip interval also drives the reachability
                    // clock, which advances by real elapsed time only
                    // while every peer is reachable.
                    let now = Instant::now();
                    self.membership.tick(now - last_clock);
                    last_clock = now;
                    self.handle_gossip_tick();
                }
                _ = pruning_timer.tick() => self.handle_pruning_tick(),
            }
        }
        self.bus.deregister(&self.self_id.addr);
        info!(node = %self.self_id, "replicator stopped");
    }

    fn handle_command(&mut self, cmd: Command) -> ControlFlow<()> {
        match cmd {
            cmd @ (Command::Get { .. } | Command::Update { .. } | Command::Delete { .. }) => {
                self.dispatch_keyed(cmd);
            }
            Command::GetKeys { reply } => {
                let _ = reply.send(self.store.live_keys());
            }
            Command::Subscribe {
                key,
                watcher,
                sender,
            } => self.store.subscribe(&key, watcher, sender),
            Command::Unsubscribe { key, watcher } => self.store.unsubscribe(&key, watcher),
            Command::Cluster(event) => return self.handle_cluster(event),
            Command::GossipTick => self.handle_gossip_tick(),
            Command::PruningTick => self.handle_pruning_tick(),
            Command::ClockTick { elapsed } => self.membership.tick(elapsed),
            Command::UpdateReadComplete { key } => self.handle_update_read_complete(key),
            Command::CoordinatorDone { req } => {
                self.pending.remove(&req);
            }
        }
        ControlFlow::Continue(())
    }

    /// Route a keyed command, parking it if its key has an update in
    /// progress.
    fn dispatch_keyed(&mut self, cmd: Command) {
        let key = match &cmd {
            Command::Get { key, .. }
            | Command::Update { key, .. }
            | Command::Delete { key, .. } => key.clone(),
            _ => return,
        };
        if let Some(pipeline) = self.in_progress.get_mut(&key) {
            debug!(key = %key, "buffering command behind in-progress update");
            pipeline.queue.push_back(cmd);
            return;
        }
        self.run_keyed(cmd);
    }

    fn run_keyed(&mut self, cmd: Command) {
        match cmd {
            Command::Get {
                key,
                consistency,
                timeout,
                reply,
            } => self.handle_get(key, consistency, timeout, reply),
            Command::Update {
                key,
                spec,
                origin,
                modify,
                reply,
            } => self.handle_update(key, spec, origin, modify, reply),
            Command::Delete {
                key,
                consistency,
                timeout,
                reply,
            } => self.handle_delete(key, consistency, timeout, reply),
            _ => debug!("non-keyed command in keyed path"),
        }
    }

    fn handle_get(
        &mut self,
        key: Key,
        consistency: ReadConsistency,
        timeout: Duration,
        reply: oneshot::Sender<GetReply>,
    ) {
        if consistency.is_local() {
            let answer = match self.store.get(&key) {
                None => GetReply::NotFound { key },
                Some(entry) if entry.envelope.is_deleted() => GetReply::Deleted { key },
                Some(entry) => GetReply::Success {
                    key,
                    value: entry.envelope.data.clone(),
                },
            };
            let _ = reply.send(answer);
            return;
        }
        self.spawn_read(key, consistency, timeout, ReadTarget::Client(reply));
    }

    fn handle_update(
        &mut self,
        key: Key,
        spec: UpdateSpec,
        origin: NodeAddr,
        modify: Modify,
        reply: oneshot::Sender<UpdateReply>,
    ) {
        if origin != *self.membership.self_addr() {
            warn!(key = %key, %origin, "rejecting update from non-local sender");
            let _ = reply.send(UpdateReply::InvalidUsage { key });
            return;
        }
        if spec.read.is_local() {
            self.local_update(key, spec.write, spec.timeout, modify, reply);
            return;
        }
        // Two-phase path: park the modify behind a quorum read so the
        // commit sees everything the quorum saw.
        let pipeline = self.in_progress.entry(key.clone()).or_default();
        pipeline.continuation = Some(PendingUpdate {
            write: spec.write,
            timeout: spec.timeout,
            modify,
            reply,
        });
        self.spawn_read(key, spec.read, spec.timeout, ReadTarget::UpdateContinuation);
    }

    /// The local commit shared by both update paths.
    fn local_update(
        &mut self,
        key: Key,
        write: WriteConsistency,
        timeout: Duration,
        modify: Modify,
        reply: oneshot::Sender<UpdateReply>,
    ) {
        let current = self.store.get(&key).map(|entry| entry.envelope.clone());
        if let Some(envelope) = &current {
            if envelope.is_deleted() {
                let _ = reply.send(UpdateReply::Deleted { key });
                return;
            }
        }

        let new_value = match modify(current.as_ref().map(|envelope| &envelope.data)) {
            Ok(value) => value,
            Err(reason) => {
                let _ = reply.send(UpdateReply::ModifyFailure { key, reason });
                return;
            }
        };

        if let Some(envelope) = &current {
            if new_value.shape() != envelope.data.shape() {
                let _ = reply.send(UpdateReply::ConflictingType {
                    key,
                    stored: envelope.data.shape(),
                    proposed: new_value.shape(),
                });
                return;
            }
        }

        let cleaned = self.pruning.cleanup_envelope(Envelope::new(new_value));
        let merged = match current {
            Some(envelope) => envelope.merge(&cleaned),
            None => cleaned,
        };
        if let Err(error) = self.store.set(&key, merged.clone()) {
            warn!(key = %key, %error, "failed to persist update");
            let _ = reply.send(UpdateReply::ReplicationFailure { key });
            return;
        }

        if write.is_local() {
            let _ = reply.send(UpdateReply::Success { key });
        } else {
            self.spawn_write(key, merged, write, timeout, WriteTarget::Update(reply));
        }
    }

    fn handle_delete(
        &mut self,
        key: Key,
        consistency: WriteConsistency,
        timeout: Duration,
        reply: oneshot::Sender<DeleteReply>,
    ) {
        if let Some(entry) = self.store.get(&key) {
            if entry.envelope.is_deleted() {
                let _ = reply.send(DeleteReply::AlreadyDeleted { key });
                return;
            }
        }
        let tombstone = Envelope::deleted();
        if let Err(error) = self.store.set(&key, tombstone.clone()) {
            warn!(key = %key, %error, "failed to persist delete");
            let _ = reply.send(DeleteReply::ReplicationFailure { key });
            return;
        }
        if consistency.is_local() {
            let _ = reply.send(DeleteReply::Success { key });
        } else {
            self.spawn_write(key, tombstone, consistency, timeout, WriteTarget::Delete(reply));
        }
    }

    fn handle_update_read_complete(&mut self, key: Key) {
        let Some(pipeline) = self.in_progress.get_mut(&key) else {
            debug!(key = %key, "read completion for unknown update");
            return;
        };
        let Some(pending) = pipeline.continuation.take() else {
            debug!(key = %key, "read completion without parked continuation");
            return;
        };
        // Read-repair already folded the quorum's knowledge into the
        // local envelope; the commit path reads it fresh.
        self.local_update(
            key.clone(),
            pending.write,
            pending.timeout,
            pending.modify,
            pending.reply,
        );
        self.drain_key(key);
    }

    /// Replay commands parked behind a finished update, pausing again if
    /// one of them starts its own two-phase update.
    fn drain_key(&mut self, key: Key) {
        let Some(mut pipeline) = self.in_progress.remove(&key) else {
            return;
        };
        while let Some(cmd) = pipeline.queue.pop_front() {
            let parks_again = matches!(
                &cmd,
                Command::Update { spec, origin, .. }
                    if !spec.read.is_local() && *origin == *self.membership.self_addr()
            );
            if parks_again {
                self.in_progress.insert(
                    key.clone(),
                    KeyPipeline {
                        continuation: None,
                        queue: pipeline.queue,
                    },
                );
                self.run_keyed(cmd);
                return;
            }
            self.run_keyed(cmd);
        }
    }

    fn handle_cluster(&mut self, event: ClusterEvent) -> ControlFlow<()> {
        match self.membership.apply(&event, &self.config) {
            MembershipChange::SelfRemoved => return ControlFlow::Break(()),
            MembershipChange::MemberRemoved(node) => {
                self.pruning.note_removed(node, self.membership.clock());
            }
            MembershipChange::None => {}
        }
        ControlFlow::Continue(())
    }

    fn handle_gossip_tick(&mut self) {
        let peers = self.membership.peers();
        if peers.is_empty() {
            return;
        }
        let index = rand::thread_rng().gen_range(0..peers.len());
        let Some(peer) = peers.iter().nth(index).cloned() else {
            return;
        };
        debug!(peer = %peer, "gossip tick");
        self.bus.send(
            &peer,
            self.self_id.addr.clone(),
            PeerMessage::Status {
                digests: self.store.digests(),
            },
        );
    }

    fn handle_pruning_tick(&mut self) {
        if let Err(error) =
            self.pruning
                .tick(&mut self.store, &self.membership, &self.config, &self.self_id)
        {
            warn!(%error, "pruning tick failed");
        }
    }

    fn handle_peer(&mut self, packet: PeerPacket) {
        let PeerPacket { from, msg } = packet;
        match msg {
            PeerMessage::Read { key, req } => {
                let envelope = self.store.get(&key).map(|entry| entry.envelope.clone());
                self.bus.send(
                    &from,
                    self.self_id.addr.clone(),
                    PeerMessage::ReadResult { envelope, req },
                );
            }
            PeerMessage::ReadResult { envelope, req } => {
                self.route(req, CoordReply::ReadResult { from, envelope });
            }
            PeerMessage::Write { key, envelope, req } => {
                if let Err(error) = self.apply_incoming(&key, envelope) {
                    warn!(key = %key, %error, "failed to apply replication write");
                }
                self.bus
                    .send(&from, self.self_id.addr.clone(), PeerMessage::WriteAck { req });
            }
            PeerMessage::WriteAck { req } => self.route(req, CoordReply::WriteAck { from }),
            PeerMessage::ReadRepair { key, envelope, req } => {
                if let Err(error) = self.apply_incoming(&key, envelope) {
                    warn!(key = %key, %error, "failed to apply read repair");
                }
                self.bus.send(
                    &from,
                    self.self_id.addr.clone(),
                    PeerMessage::ReadRepairAck { req },
                );
            }
            PeerMessage::ReadRepairAck { req } => {
                self.route(req, CoordReply::ReadRepairAck { from });
            }
            PeerMessage::Status { digests } => self.handle_status(from, digests),
            PeerMessage::Gossip { envelopes } => {
                for (key, envelope) in envelopes {
                    if let Err(error) = self.apply_incoming(&key, envelope) {
                        warn!(key = %key, %error, "failed to apply gossip delta");
                    }
                }
            }
        }
    }

    /// The single apply path for replication writes, read repairs, and
    /// gossip deltas.
    fn apply_incoming(&mut self, key: &Key, incoming: Envelope) -> Result<(), ReplError> {
        let local = self.store.get(key).map(|entry| entry.envelope.clone());
        if let Some(envelope) = &local {
            // A local tombstone is final; late writes are absorbed.
            if envelope.is_deleted() {
                return Ok(());
            }
        }

        let incoming = self.pruning.cleanup_envelope(incoming);
        if let Some(envelope) = &local {
            if !incoming.is_deleted() && incoming.data.shape() != envelope.data.shape() {
                warn!(
                    key = %key,
                    stored = %envelope.data.shape(),
                    incoming = %incoming.data.shape(),
                    "ignoring replication write with conflicting shape"
                );
                return Ok(());
            }
        }

        let mut merged = match local {
            Some(envelope) => envelope.merge(&incoming),
            None => incoming,
        };
        // This replica has now witnessed every pruning announcement the
        // envelope carries; the echo travels back out with future
        // replication and grows the owners' seen sets.
        merged.add_seen(&self.self_id.addr);

        let now = self.membership.clock();
        for (removed, state) in &merged.pruning {
            if matches!(state.phase, PruningPhase::Performed) {
                self.pruning.observe_performed(removed, now);
            }
        }

        self.store.set(key, merged)?;
        Ok(())
    }

    fn handle_status(&mut self, from: NodeAddr, theirs: BTreeMap<Key, crate::digest::Digest>) {
        let ours = self.store.digests();
        let keys = gossip::delta_keys(&ours, &theirs, self.config.max_delta_elements);
        if keys.is_empty() {
            return;
        }
        let envelopes: BTreeMap<Key, Envelope> = keys
            .into_iter()
            .filter_map(|key| {
                self.store
                    .get(&key)
                    .map(|entry| (key, entry.envelope.clone()))
            })
            .collect();
        debug!(peer = %from, count = envelopes.len(), "shipping gossip delta");
        self.bus.send(
            &from,
            self.self_id.addr.clone(),
            PeerMessage::Gossip { envelopes },
        );
    }

    fn spawn_read(
        &mut self,
        key: Key,
        consistency: ReadConsistency,
        timeout: Duration,
        target: ReadTarget,
    ) {
        let req = self.next_request();
        let (tx, rx) = mpsc::unbounded_channel();
        self.pending.insert(req, tx);
        let coordinator = ReadCoordinator {
            req,
            key: key.clone(),
            consistency,
            timeout,
            peers: self.membership.peers().clone(),
            local: self.store.get(&key).map(|entry| entry.envelope.clone()),
            bus: self.bus.clone(),
            self_addr: self.self_id.addr.clone(),
            replies: rx,
            target,
            engine: self.cmd_tx.clone(),
        };
        tokio::spawn(coordinator.run());
    }

    fn spawn_write(
        &mut self,
        key: Key,
        envelope: Envelope,
        consistency: WriteConsistency,
        timeout: Duration,
        target: WriteTarget,
    ) {
        let req = self.next_request();
        let (tx, rx) = mpsc::unbounded_channel();
        self.pending.insert(req, tx);
        let coordinator = WriteCoordinator {
            req,
            key,
            envelope,
            consistency,
            timeout,
            peers: self.membership.peers().clone(),
            bus: self.bus.clone(),
            self_addr: self.self_id.addr.clone(),
            replies: rx,
            target: Some(target),
            engine: self.cmd_tx.clone(),
        };
        tokio::spawn(coordinator.run());
    }

    fn route(&mut self, req: RequestId, reply: CoordReply) {
        match self.pending.get(&req) {
            Some(tx) => {
                let _ = tx.send(reply);
            }
            None => debug!(req, "reply for finished coordinator dropped"),
        }
    }

    fn next_request(&mut self) -> RequestId {
        self.next_req += 1;
        self.next_req
    }
}

/// Factory for replicator instances.
pub struct Replicator;

impl Replicator {
    /// Spawn a replicator for `self_id` on `bus` and return its handle.
    ///
    /// The engine stops when it is removed from the cluster
    /// ([`ClusterEvent::MemberRemoved`] for its own address) or when
    /// every handle has been dropped.
    pub fn spawn(self_id: NodeId, config: ReplicatorConfig, bus: ClusterBus) -> ReplicatorHandle {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let peer_rx = bus.register(self_id.addr.clone());
        let addr = self_id.addr.clone();
        let engine = Engine {
            membership: Membership::new(self_id.addr.clone()),
            self_id,
            config,
            bus,
            store: LocalStore::new(),
            pruning: PruningController::new(),
            pending: HashMap::new(),
            in_progress: BTreeMap::new(),
            next_req: 0,
            cmd_tx: cmd_tx.clone(),
        };
        tokio::spawn(engine.run(cmd_rx, peer_rx));
        ReplicatorHandle { addr, tx: cmd_tx }
    }
}

/// Cloneable handle to a replicator. Commands submitted through a handle
/// are local to its engine by construction.
#[derive(Clone)]
pub struct ReplicatorHandle {
    addr: NodeAddr,
    tx: mpsc::UnboundedSender<Command>,
}

impl ReplicatorHandle {
    /// The address of the engine this handle talks to.
    pub fn addr(&self) -> &NodeAddr {
        &self.addr
    }

    /// Read `key` at the given consistency level.
    pub async fn get(
        &self,
        key: impl Into<Key>,
        consistency: ReadConsistency,
        timeout: Duration,
    ) -> Result<GetReply, ReplError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Get {
            key: key.into(),
            consistency,
            timeout,
            reply,
        })?;
        rx.await.map_err(|_| ReplError::ReplyDropped)
    }

    /// The set of non-deleted keys in the local store.
    pub async fn get_keys(&self) -> Result<BTreeSet<Key>, ReplError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::GetKeys { reply })?;
        rx.await.map_err(|_| ReplError::ReplyDropped)
    }

    /// Apply `modify` to the current value of `key` and replicate the
    /// result at the given consistency levels.
    pub async fn update<F>(
        &self,
        key: impl Into<Key>,
        read: ReadConsistency,
        write: WriteConsistency,
        timeout: Duration,
        modify: F,
    ) -> Result<UpdateReply, ReplError>
    where
        F: FnOnce(Option<&Value>) -> Result<Value, String> + Send + 'static,
    {
        self.update_from(self.addr.clone(), key, read, write, timeout, modify)
            .await
    }

    /// Like [`update`](Self::update), naming an explicit originating
    /// address. For forwarding layers; updates whose origin is not the
    /// engine's own address are rejected with
    /// [`UpdateReply::InvalidUsage`].
    pub async fn update_from<F>(
        &self,
        origin: NodeAddr,
        key: impl Into<Key>,
        read: ReadConsistency,
        write: WriteConsistency,
        timeout: Duration,
        modify: F,
    ) -> Result<UpdateReply, ReplError>
    where
        F: FnOnce(Option<&Value>) -> Result<Value, String> + Send + 'static,
    {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Update {
            key: key.into(),
            spec: UpdateSpec {
                read,
                write,
                timeout,
            },
            origin,
            modify: Box::new(modify),
            reply,
        })?;
        rx.await.map_err(|_| ReplError::ReplyDropped)
    }

    /// Delete `key` permanently at the given write level.
    pub async fn delete(
        &self,
        key: impl Into<Key>,
        consistency: WriteConsistency,
        timeout: Duration,
    ) -> Result<DeleteReply, ReplError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Delete {
            key: key.into(),
            consistency,
            timeout,
            reply,
        })?;
        rx.await.map_err(|_| ReplError::ReplyDropped)
    }

    /// Subscribe watcher `watcher` to changes of `key`. If the key
    /// already has an entry, its current state is delivered immediately.
    pub fn subscribe(
        &self,
        key: impl Into<Key>,
        watcher: WatcherId,
    ) -> Result<mpsc::UnboundedReceiver<SubscriptionEvent>, ReplError> {
        let (sender, rx) = mpsc::unbounded_channel();
        self.send(Command::Subscribe {
            key: key.into(),
            watcher,
            sender,
        })?;
        Ok(rx)
    }

    /// Remove watcher `watcher`'s subscription on `key`.
    pub fn unsubscribe(&self, key: impl Into<Key>, watcher: WatcherId) -> Result<(), ReplError> {
        self.send(Command::Unsubscribe {
            key: key.into(),
            watcher,
        })
    }

    /// Feed one cluster signal into the engine's membership adapter.
    pub fn cluster_event(&self, event: ClusterEvent) -> Result<(), ReplError> {
        self.send(Command::Cluster(event))
    }

    /// Run one gossip round now, in addition to the periodic ones.
    /// Embedders that drive their own timers use this.
    pub fn trigger_gossip(&self) -> Result<(), ReplError> {
        self.send(Command::GossipTick)
    }

    /// Run one pruning round now, in addition to the periodic ones.
    pub fn trigger_pruning(&self) -> Result<(), ReplError> {
        self.send(Command::PruningTick)
    }

    /// Advance the reachability clock by `elapsed` (it still only moves
    /// if every peer is reachable).
    pub fn advance_clock(&self, elapsed: Duration) -> Result<(), ReplError> {
        self.send(Command::ClockTick { elapsed })
    }

    fn send(&self, cmd: Command) -> Result<(), ReplError> {
        self.tx.send(cmd).map_err(|_| ReplError::Shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Member;
    use meshkv_crdt::GCounter;

    const TIMEOUT: Duration = Duration::from_secs(1);

    fn increment_by(node: NodeId, amount: u64) -> impl FnOnce(Option<&Value>) -> Result<Value, String> + Send {
        move |current| {
            let mut counter = match current {
                Some(Value::Counter(c)) => c.clone(),
                Some(other) => return Ok(other.clone()),
                None => GCounter::new(),
            };
            counter.increment(&node, amount);
            Ok(Value::Counter(counter))
        }
    }

    fn single_node() -> (ReplicatorHandle, NodeId) {
        let bus = ClusterBus::new();
        let id = NodeId::new("solo", 1);
        let handle = Replicator::spawn(id.clone(), ReplicatorConfig::default(), bus);
        (handle, id)
    }

    #[tokio::test]
    async fn test_update_then_local_get() {
        let (handle, id) = single_node();
        let reply = handle
            .update(
                "c",
                ReadConsistency::One,
                WriteConsistency::One,
                TIMEOUT,
                increment_by(id, 1),
            )
            .await
            .unwrap();
        assert_eq!(reply, UpdateReply::Success { key: "c".into() });

        match handle.get("c", ReadConsistency::One, TIMEOUT).await.unwrap() {
            GetReply::Success { value: Value::Counter(c), .. } => assert_eq!(c.value(), 1),
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_get_unknown_key_not_found() {
        let (handle, _) = single_node();
        assert_eq!(
            handle.get("nope", ReadConsistency::One, TIMEOUT).await.unwrap(),
            GetReply::NotFound { key: "nope".into() }
        );
    }

    #[tokio::test]
    async fn test_conflicting_type_rejected_and_state_unchanged() {
        let (handle, id) = single_node();
        handle
            .update(
                "k",
                ReadConsistency::One,
                WriteConsistency::One,
                TIMEOUT,
                increment_by(id.clone(), 2),
            )
            .await
            .unwrap();

        let reply = handle
            .update("k", ReadConsistency::One, WriteConsistency::One, TIMEOUT, |_| {
                Ok(Value::Register(meshkv_crdt::LwwRegister::new(
                    "v".to_string(),
                    1,
                    NodeId::new("solo", 1),
                )))
            })
            .await
            .unwrap();
        assert!(matches!(reply, UpdateReply::ConflictingType { .. }));

        match handle.get("k", ReadConsistency::One, TIMEOUT).await.unwrap() {
            GetReply::Success { value: Value::Counter(c), .. } => assert_eq!(c.value(), 2),
            other => panic!("unexpected reply: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_modify_failure_propagated() {
        let (handle, _) = single_node();
        let reply = handle
            .update("k", ReadConsistency::One, WriteConsistency::One, TIMEOUT, |_| {
                Err("boom".to_string())
            })
            .await
            .unwrap();
        assert_eq!(
            reply,
            UpdateReply::ModifyFailure {
                key: "k".into(),
                reason: "boom".into()
            }
        );
    }

    #[tokio::test]
    async fn test_update_from_foreign_origin_invalid_usage() {
        let (handle, id) = single_node();
        let reply = handle
            .update_from(
                NodeAddr::new("somewhere-else"),
                "k",
                ReadConsistency::One,
                WriteConsistency::One,
                TIMEOUT,
                increment_by(id, 1),
            )
            .await
            .unwrap();
        assert_eq!(reply, UpdateReply::InvalidUsage { key: "k".into() });
    }

    #[tokio::test]
    async fn test_delete_is_permanent() {
        let (handle, id) = single_node();
        handle
            .update(
                "k",
                ReadConsistency::One,
                WriteConsistency::One,
                TIMEOUT,
                increment_by(id.clone(), 1),
            )
            .await
            .unwrap();

        assert_eq!(
            handle.delete("k", WriteConsistency::One, TIMEOUT).await.unwrap(),
            DeleteReply::Success { key: "k".into() }
        );
        assert_eq!(
            handle.delete("k", WriteConsistency::One, TIMEOUT).await.unwrap(),
            DeleteReply::AlreadyDeleted { key: "k".into() }
        );
        assert_eq!(
            handle.get("k", ReadConsistency::One, TIMEOUT).await.unwrap(),
            GetReply::Deleted { key: "k".into() }
        );
        let reply = handle
            .update(
                "k",
                ReadConsistency::One,
                WriteConsistency::One,
                TIMEOUT,
                increment_by(id, 1),
            )
            .await
            .unwrap();
        assert_eq!(reply, UpdateReply::Deleted { key: "k".into() });
    }

    #[tokio::test]
    async fn test_get_keys_excludes_deleted() {
        let (handle, id) = single_node();
        for key in ["a", "b"] {
            handle
                .update(
                    key,
                    ReadConsistency::One,
                    WriteConsistency::One,
                    TIMEOUT,
                    increment_by(id.clone(), 1),
                )
                .await
                .unwrap();
        }
        handle.delete("b", WriteConsistency::One, TIMEOUT).await.unwrap();

        let keys = handle.get_keys().await.unwrap();
        assert!(keys.contains("a"));
        assert!(!keys.contains("b"));
    }

    #[tokio::test]
    async fn test_subscribe_receives_changes_and_delete() {
        let (handle, id) = single_node();
        let mut events = handle.subscribe("k", 1).unwrap();

        handle
            .update(
                "k",
                ReadConsistency::One,
                WriteConsistency::One,
                TIMEOUT,
                increment_by(id, 1),
            )
            .await
            .unwrap();
        match events.recv().await.unwrap() {
            SubscriptionEvent::Changed { key, .. } => assert_eq!(key, "k"),
            other => panic!("unexpected event: {other:?}"),
        }

        handle.delete("k", WriteConsistency::One, TIMEOUT).await.unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            SubscriptionEvent::Deleted { key: "k".into() }
        );
    }

    #[tokio::test]
    async fn test_quorum_on_single_node_fails_fast() {
        let (handle, _) = single_node();
        assert_eq!(
            handle.get("k", ReadConsistency::Quorum, TIMEOUT).await.unwrap(),
            GetReply::Failure { key: "k".into() }
        );
    }

    #[tokio::test]
    async fn test_write_all_with_no_peers_succeeds_synchronously() {
        let (handle, id) = single_node();
        let reply = handle
            .update(
                "k",
                ReadConsistency::One,
                WriteConsistency::All,
                TIMEOUT,
                increment_by(id, 1),
            )
            .await
            .unwrap();
        assert_eq!(reply, UpdateReply::Success { key: "k".into() });
    }

    #[tokio::test]
    async fn test_engine_stops_on_self_removed() {
        let (handle, id) = single_node();
        handle
            .cluster_event(ClusterEvent::MemberRemoved(Member::new(id)))
            .unwrap();

        // The engine drains already-queued commands and then stops; an
        // eventual send must fail with Shutdown.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(
            handle.get("k", ReadConsistency::One, TIMEOUT).await,
            Err(ReplError::Shutdown) | Err(ReplError::ReplyDropped)
        ));
    }
}
