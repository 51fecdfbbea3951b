//! In-process cluster bus connecting replication engines by address.
//!
//! In production the peer protocol travels over a network transport; the
//! bus provides the same delivery contract in-process through tokio mpsc
//! channels, which is what the engine's tests and single-process
//! embeddings (e.g. simulations) use. Delivery is best-effort: messages
//! to unknown addresses are dropped, exactly like a datagram to a node
//! that is gone.
//!
//! Links between address pairs can be severed and restored, so tests can
//! exercise partitions and the anti-entropy repair that follows healing.

use crate::messages::PeerMessage;
use meshkv_crdt::NodeAddr;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

/// A peer message tagged with its sender.
#[derive(Debug, Clone)]
pub struct PeerPacket {
    /// The sending node's address.
    pub from: NodeAddr,
    /// The message.
    pub msg: PeerMessage,
}

#[derive(Default)]
struct BusInner {
    nodes: HashMap<NodeAddr, mpsc::UnboundedSender<PeerPacket>>,
    severed: HashSet<(NodeAddr, NodeAddr)>,
}

/// The shared bus. Cheap to clone; all clones address the same cluster.
#[derive(Clone, Default)]
pub struct ClusterBus {
    inner: Arc<Mutex<BusInner>>,
}

impl ClusterBus {
    /// An empty bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a node and return its inbound packet stream. A second
    /// registration for the same address replaces the first, mirroring a
    /// restarted process reclaiming its address.
    pub fn register(&self, addr: NodeAddr) -> mpsc::UnboundedReceiver<PeerPacket> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().unwrap().nodes.insert(addr, tx);
        rx
    }

    /// Detach a node. Messages to it are dropped from now on.
    pub fn deregister(&self, addr: &NodeAddr) {
        self.inner.lock().unwrap().nodes.remove(addr);
    }

    /// Deliver `msg` from `from` to `to`. Unknown or unreachable
    /// destinations drop the message.
    pub fn send(&self, to: &NodeAddr, from: NodeAddr, msg: PeerMessage) {
        let inner = self.inner.lock().unwrap();
        if inner.severed.contains(&(from.clone(), to.clone())) {
            debug!(%from, %to, "dropping message on severed link");
            return;
        }
        match inner.nodes.get(to) {
            Some(tx) => {
                // A closed channel means the node stopped between lookup
                // and delivery; equivalent to a drop in flight.
                let _ = tx.send(PeerPacket { from, msg });
            }
            None => debug!(%from, %to, "dropping message to unknown node"),
        }
    }

    /// Sever both directions of the link between `a` and `b`.
    pub fn sever(&self, a: &NodeAddr, b: &NodeAddr) {
        let mut inner = self.inner.lock().unwrap();
        inner.severed.insert((a.clone(), b.clone()));
        inner.severed.insert((b.clone(), a.clone()));
    }

    /// Restore the link between `a` and `b`.
    pub fn heal(&self, a: &NodeAddr, b: &NodeAddr) {
        let mut inner = self.inner.lock().unwrap();
        inner.severed.remove(&(a.clone(), b.clone()));
        inner.severed.remove(&(b.clone(), a.clone()));
    }

    /// Addresses currently attached to the bus.
    pub fn addresses(&self) -> Vec<NodeAddr> {
        let inner = self.inner.lock().unwrap();
        let mut addrs: Vec<NodeAddr> = inner.nodes.keys().cloned().collect();
        addrs.sort();
        addrs
    }
}
