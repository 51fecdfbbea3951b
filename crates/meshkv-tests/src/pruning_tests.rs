//! Removed-node pruning across a live cluster.

#![cfg(test)]

use crate::harness::{addr, increment_counter, TestCluster, TIMEOUT};
use meshkv_crdt::GCounter;
use meshkv_repl::{
    ClusterEvent, Envelope, PeerMessage, PruningPhase, ReadConsistency, Value, WriteConsistency,
};
use std::time::Duration;

/// A hair past the default `max_pruning_dissemination`.
const WINDOW: Duration = Duration::from_secs(61);

async fn seed_counter(cluster: &TestCluster, key: &str) {
    for node in 0..cluster.len() {
        cluster
            .node(node)
            .update(
                key,
                ReadConsistency::One,
                WriteConsistency::All,
                TIMEOUT,
                increment_counter(cluster.id(node).clone(), 1),
            )
            .await
            .unwrap();
        cluster.settle().await;
    }
}

#[tokio::test]
async fn test_pruning_lifecycle_after_member_leaves() {
    let cluster = TestCluster::launch(&["a", "b", "c"]).await;
    seed_counter(&cluster, "k").await;
    assert_eq!(cluster.counter_value(0, "k").await, Some(3));
    assert_eq!(cluster.counter_value(1, "k").await, Some(3));

    // c leaves for good.
    cluster.remove_node(2);
    cluster.settle().await;

    // After the dissemination window the leader initialises pruning.
    cluster.advance_clocks(WINDOW);
    cluster.pruning_round().await;

    let envelope = cluster.fetch_envelope(0, "k").await.unwrap();
    let state = envelope.pruning_state(cluster.id(2)).unwrap();
    assert_eq!(state.owner, *cluster.id(0));
    assert!(matches!(state.phase, PruningPhase::Init { .. }));

    // Two gossip rounds echo the announcement: one carries it to b, the
    // next carries b's acknowledgement back.
    cluster.gossip_round().await;
    cluster.gossip_round().await;

    // The leader performs the prune: c's contribution is re-attributed,
    // the value is unchanged.
    cluster.pruning_round().await;
    let envelope = cluster.fetch_envelope(0, "k").await.unwrap();
    assert_eq!(
        envelope.pruning_state(cluster.id(2)).unwrap().phase,
        PruningPhase::Performed
    );
    assert!(!envelope.data.needs_pruning_from(cluster.id(2)));
    assert_eq!(cluster.counter_value(0, "k").await, Some(3));

    // Spread the performed state, wait out the second window, tombstone.
    cluster.gossip_round().await;
    cluster.advance_clocks(WINDOW);
    cluster.pruning_round().await;

    let envelope = cluster.fetch_envelope(0, "k").await.unwrap();
    assert!(envelope.pruning_state(cluster.id(2)).is_none());
    assert!(!envelope.data.needs_pruning_from(cluster.id(2)));
    assert_eq!(cluster.counter_value(0, "k").await, Some(3));
    assert_eq!(cluster.counter_value(1, "k").await, Some(3));
}

#[tokio::test]
async fn test_late_gossip_referencing_removed_node_is_absorbed() {
    let cluster = TestCluster::launch(&["a", "b", "c"]).await;
    seed_counter(&cluster, "k").await;

    // Full lifecycle: c removed, pruned, tombstoned.
    cluster.remove_node(2);
    cluster.settle().await;
    cluster.advance_clocks(WINDOW);
    cluster.pruning_round().await;
    cluster.gossip_round().await;
    cluster.gossip_round().await;
    cluster.pruning_round().await;
    cluster.gossip_round().await;
    cluster.advance_clocks(WINDOW);
    cluster.pruning_round().await;

    // A slow replica replays the pre-prune envelope, c's slot included.
    // If the tombstone cleanup failed, the merge would double-count c's
    // contribution on top of the re-attributed one.
    let mut stale = GCounter::new();
    stale.increment(cluster.id(0), 1);
    stale.increment(cluster.id(1), 1);
    stale.increment(cluster.id(2), 1);
    let mut probe_rx = cluster.bus().register(addr("late-sender"));
    cluster.bus().send(
        &cluster.id(0).addr,
        addr("late-sender"),
        PeerMessage::Write {
            key: "k".into(),
            envelope: Envelope::new(Value::Counter(stale)),
            req: 1,
        },
    );
    cluster.settle().await;
    assert!(matches!(
        probe_rx.try_recv().unwrap().msg,
        PeerMessage::WriteAck { .. }
    ));

    assert_eq!(cluster.counter_value(0, "k").await, Some(3));
    let envelope = cluster.fetch_envelope(0, "k").await.unwrap();
    assert!(!envelope.data.needs_pruning_from(cluster.id(2)));
    assert!(envelope.pruning_state(cluster.id(2)).is_none());
}

#[tokio::test]
async fn test_pruning_paused_while_any_peer_unreachable() {
    let cluster = TestCluster::launch(&["a", "b", "c"]).await;
    seed_counter(&cluster, "k").await;

    cluster.remove_node(2);
    cluster.settle().await;

    // b is unreachable at the leader: the reachability clock pauses, so
    // the dissemination window never elapses and nothing is initialised.
    cluster
        .node(0)
        .cluster_event(ClusterEvent::Unreachable(cluster.id(1).addr.clone()))
        .unwrap();
    cluster.advance_clocks(WINDOW);
    cluster.pruning_round().await;

    let envelope = cluster.fetch_envelope(0, "k").await.unwrap();
    assert!(envelope.pruning_state(cluster.id(2)).is_none());

    // Reachability restored: the clock resumes and pruning starts.
    cluster
        .node(0)
        .cluster_event(ClusterEvent::Reachable(cluster.id(1).addr.clone()))
        .unwrap();
    cluster.advance_clocks(WINDOW);
    cluster.pruning_round().await;

    let envelope = cluster.fetch_envelope(0, "k").await.unwrap();
    assert!(matches!(
        envelope.pruning_state(cluster.id(2)).unwrap().phase,
        PruningPhase::Init { .. }
    ));
    assert_eq!(cluster.counter_value(0, "k").await, Some(3));
}
