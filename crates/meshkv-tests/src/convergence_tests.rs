//! Anti-entropy convergence and gossip protocol properties.

#![cfg(test)]

use crate::harness::{addr, increment_counter, TestCluster, TIMEOUT};
use meshkv_crdt::GCounter;
use meshkv_repl::{
    Envelope, PeerMessage, ReadConsistency, ReplicatorConfig, Value, WriteConsistency,
};
use std::collections::BTreeMap;

#[tokio::test]
async fn test_replicas_converge_after_independent_updates() {
    let cluster = TestCluster::launch(&["a", "b", "c"]).await;

    // Each node updates each key locally, with no coordination at all.
    for key in ["x", "y"] {
        for node in 0..cluster.len() {
            cluster
                .node(node)
                .update(
                    key,
                    ReadConsistency::One,
                    WriteConsistency::One,
                    TIMEOUT,
                    increment_counter(cluster.id(node).clone(), (node + 1) as u64),
                )
                .await
                .unwrap();
        }
    }

    // Gossip peers are picked at random; enough rounds make a missed
    // pairing vanishingly unlikely.
    cluster.converge(32).await;

    for key in ["x", "y"] {
        let expected = cluster.counter_value(0, key).await;
        assert_eq!(expected, Some(6));
        for node in 1..cluster.len() {
            assert_eq!(
                cluster.counter_value(node, key).await,
                expected,
                "node {node} diverges on {key}"
            );
        }
    }
}

#[tokio::test]
async fn test_reapplying_identical_write_changes_nothing() {
    let cluster = TestCluster::launch(&["a"]).await;
    let mut counter = GCounter::new();
    counter.increment(cluster.id(0), 5);
    let envelope = Envelope::new(Value::Counter(counter));

    let mut probe_rx = cluster.bus().register(addr("writer"));
    for req in 1..=3 {
        cluster.bus().send(
            &cluster.id(0).addr,
            addr("writer"),
            PeerMessage::Write {
                key: "k".into(),
                envelope: envelope.clone(),
                req,
            },
        );
    }
    cluster.settle().await;

    // Every write was acknowledged, and n applications are
    // indistinguishable from one.
    for _ in 0..3 {
        assert!(matches!(
            probe_rx.try_recv().unwrap().msg,
            PeerMessage::WriteAck { .. }
        ));
    }
    assert_eq!(cluster.counter_value(0, "k").await, Some(5));
}

#[tokio::test]
async fn test_gossip_reply_respects_max_delta_elements() {
    let config = ReplicatorConfig {
        max_delta_elements: 5,
        ..Default::default()
    };
    let cluster = TestCluster::launch_with_config(&["a"], config).await;

    for i in 0..10 {
        cluster
            .node(0)
            .update(
                format!("key-{i}"),
                ReadConsistency::One,
                WriteConsistency::One,
                TIMEOUT,
                increment_counter(cluster.id(0).clone(), 1),
            )
            .await
            .unwrap();
    }

    // A peer that claims to have nothing gets at most the cap.
    let mut probe_rx = cluster.bus().register(addr("empty-peer"));
    cluster.bus().send(
        &cluster.id(0).addr,
        addr("empty-peer"),
        PeerMessage::Status {
            digests: BTreeMap::new(),
        },
    );

    let packet = tokio::time::timeout(TIMEOUT, probe_rx.recv())
        .await
        .unwrap()
        .unwrap();
    match packet.msg {
        PeerMessage::Gossip { envelopes } => assert_eq!(envelopes.len(), 5),
        other => panic!("unexpected message: {other:?}"),
    }
}

#[tokio::test]
async fn test_matching_digests_produce_no_gossip_reply() {
    let cluster = TestCluster::launch(&["a"]).await;
    cluster
        .node(0)
        .update(
            "k",
            ReadConsistency::One,
            WriteConsistency::One,
            TIMEOUT,
            increment_counter(cluster.id(0).clone(), 1),
        )
        .await
        .unwrap();

    // Learn the node's digests, then echo them back verbatim.
    let mut probe_rx = cluster.bus().register(addr("mirror"));
    cluster.bus().send(
        &cluster.id(0).addr,
        addr("mirror"),
        PeerMessage::Status {
            digests: BTreeMap::new(),
        },
    );
    let digests = match tokio::time::timeout(TIMEOUT, probe_rx.recv())
        .await
        .unwrap()
        .unwrap()
        .msg
    {
        PeerMessage::Gossip { envelopes } => envelopes
            .iter()
            .map(|(key, envelope)| {
                (
                    key.clone(),
                    meshkv_repl::Digest::of(envelope).unwrap(),
                )
            })
            .collect::<BTreeMap<_, _>>(),
        other => panic!("unexpected message: {other:?}"),
    };

    cluster.bus().send(
        &cluster.id(0).addr,
        addr("mirror"),
        PeerMessage::Status { digests },
    );
    cluster.settle().await;
    assert!(probe_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_deleted_keys_still_gossip_their_tombstone() {
    let cluster = TestCluster::launch(&["a", "b"]).await;
    cluster.sever(0, 1);

    cluster
        .node(0)
        .update(
            "k",
            ReadConsistency::One,
            WriteConsistency::One,
            TIMEOUT,
            increment_counter(cluster.id(0).clone(), 1),
        )
        .await
        .unwrap();
    cluster
        .node(0)
        .delete("k", WriteConsistency::One, TIMEOUT)
        .await
        .unwrap();

    cluster.heal(0, 1);
    cluster.gossip_round().await;
    cluster.gossip_round().await;

    // b never saw the live value, only the tombstone.
    assert_eq!(
        cluster
            .node(1)
            .get("k", ReadConsistency::One, TIMEOUT)
            .await
            .unwrap(),
        meshkv_repl::GetReply::Deleted { key: "k".into() }
    );
}
