//! Test cluster scaffolding.

use meshkv_crdt::{GCounter, NodeAddr, NodeId};
use meshkv_repl::messages::Member;
use meshkv_repl::{
    ClusterBus, ClusterEvent, Envelope, GetReply, PeerMessage, ReadConsistency, Replicator,
    ReplicatorConfig, ReplicatorHandle, Value,
};
use std::collections::BTreeMap;
use std::time::Duration;

/// Operation timeout used throughout the tests.
pub const TIMEOUT: Duration = Duration::from_secs(2);

/// Initialise tracing output for a test run. Safe to call from every
/// test; only the first call installs the subscriber. Run with
/// `RUST_LOG=meshkv_repl=debug` to watch the protocol at work.
pub fn init_tracing() {
    use std::sync::Once;
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// A short timeout for operations that are expected to fail by timing
/// out, so tests stay fast.
pub const SHORT_TIMEOUT: Duration = Duration::from_millis(200);

/// A cluster of replicators on a shared in-process bus.
///
/// Engines are configured with hour-long gossip and pruning intervals so
/// nothing fires on its own; tests drive rounds explicitly via the
/// handles. The first node is the leader.
pub struct TestCluster {
    bus: ClusterBus,
    nodes: Vec<(NodeId, ReplicatorHandle)>,
}

impl TestCluster {
    /// Launch one replicator per name and introduce them to each other.
    pub async fn launch(names: &[&str]) -> Self {
        Self::launch_with_config(names, Self::default_config()).await
    }

    /// Launch with a custom config (intervals are still overridden to
    /// keep the cluster test-driven).
    pub async fn launch_with_config(names: &[&str], config: ReplicatorConfig) -> Self {
        init_tracing();
        let config = ReplicatorConfig {
            gossip_interval: Duration::from_secs(3600),
            pruning_interval: Duration::from_secs(3600),
            ..config
        };
        let bus = ClusterBus::new();
        let nodes: Vec<(NodeId, ReplicatorHandle)> = names
            .iter()
            .map(|name| {
                let id = NodeId::new(*name, 1);
                let handle = Replicator::spawn(id.clone(), config.clone(), bus.clone());
                (id, handle)
            })
            .collect();

        let leader = nodes[0].0.addr.clone();
        for (_, handle) in &nodes {
            for (id, _) in &nodes {
                handle
                    .cluster_event(ClusterEvent::MemberUp(Member::new(id.clone())))
                    .unwrap();
            }
            handle
                .cluster_event(ClusterEvent::LeaderChanged(Some(leader.clone())))
                .unwrap();
        }
        let cluster = Self { bus, nodes };
        cluster.settle().await;
        cluster
    }

    fn default_config() -> ReplicatorConfig {
        ReplicatorConfig::default()
    }

    /// The handle of node `index` (in launch order).
    pub fn node(&self, index: usize) -> &ReplicatorHandle {
        &self.nodes[index].1
    }

    /// The identity of node `index`.
    pub fn id(&self, index: usize) -> &NodeId {
        &self.nodes[index].0
    }

    /// The shared bus, for link manipulation and raw message injection.
    pub fn bus(&self) -> &ClusterBus {
        &self.bus
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Whether the cluster is empty.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Sever the link between two nodes (both directions).
    pub fn sever(&self, a: usize, b: usize) {
        self.bus.sever(&self.nodes[a].0.addr, &self.nodes[b].0.addr);
    }

    /// Restore the link between two nodes.
    pub fn heal(&self, a: usize, b: usize) {
        self.bus.heal(&self.nodes[a].0.addr, &self.nodes[b].0.addr);
    }

    /// Remove node `index` from the cluster: every node (the removed one
    /// included) receives the removal event.
    pub fn remove_node(&self, index: usize) {
        let member = Member::new(self.nodes[index].0.clone());
        for (_, handle) in &self.nodes {
            let _ = handle.cluster_event(ClusterEvent::MemberRemoved(member.clone()));
        }
    }

    /// Advance every node's reachability clock by `elapsed`.
    pub fn advance_clocks(&self, elapsed: Duration) {
        for (_, handle) in &self.nodes {
            let _ = handle.advance_clock(elapsed);
        }
    }

    /// Run one explicit gossip round on every node and let the messages
    /// settle.
    pub async fn gossip_round(&self) {
        for (_, handle) in &self.nodes {
            let _ = handle.trigger_gossip();
        }
        self.settle().await;
    }

    /// Run `rounds` gossip rounds. Peer selection is random, so tests on
    /// clusters larger than two nodes use enough rounds to make missing
    /// a peer vanishingly unlikely.
    pub async fn converge(&self, rounds: usize) {
        for _ in 0..rounds {
            self.gossip_round().await;
        }
    }

    /// Run one pruning round on every node and let the messages settle.
    pub async fn pruning_round(&self) {
        for (_, handle) in &self.nodes {
            let _ = handle.trigger_pruning();
        }
        self.settle().await;
    }

    /// Give the engines time to drain their queues.
    pub async fn settle(&self) {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    /// Fetch the raw envelope a node holds for `key`, by probing it with
    /// an empty gossip status and reading the delta it ships back. Lets
    /// tests inspect pruning metadata that the client API does not
    /// expose.
    pub async fn fetch_envelope(&self, node: usize, key: &str) -> Option<Envelope> {
        let probe = NodeAddr::new(format!("probe-{node}"));
        let mut rx = self.bus.register(probe.clone());
        self.bus.send(
            &self.nodes[node].0.addr,
            probe.clone(),
            PeerMessage::Status {
                digests: BTreeMap::new(),
            },
        );
        let packet = tokio::time::timeout(TIMEOUT, rx.recv())
            .await
            .ok()
            .flatten()?;
        self.bus.deregister(&probe);
        match packet.msg {
            PeerMessage::Gossip { mut envelopes } => envelopes.remove(key),
            _ => None,
        }
    }

    /// Read `key` locally at `node` and return the counter's value.
    pub async fn counter_value(&self, node: usize, key: &str) -> Option<u64> {
        match self
            .node(node)
            .get(key, ReadConsistency::One, TIMEOUT)
            .await
            .unwrap()
        {
            GetReply::Success {
                value: Value::Counter(c),
                ..
            } => Some(c.value()),
            _ => None,
        }
    }
}

/// A modify function that increments a grow-only counter on behalf of
/// `node`, creating it on first use.
pub fn increment_counter(
    node: NodeId,
    amount: u64,
) -> impl FnOnce(Option<&Value>) -> Result<Value, String> + Send + 'static {
    move |current| {
        let mut counter = match current {
            Some(Value::Counter(c)) => c.clone(),
            Some(other) => {
                return Err(format!("expected a counter, found {}", other.shape()));
            }
            None => GCounter::new(),
        };
        counter.increment(&node, amount);
        Ok(Value::Counter(counter))
    }
}

/// Shorthand for a node address.
pub fn addr(name: &str) -> NodeAddr {
    NodeAddr::new(name)
}
