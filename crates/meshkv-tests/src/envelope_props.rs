//! Property tests over the envelope layer: the merge laws and digest
//! agreement that replica convergence rests on.

#![cfg(test)]

use meshkv_crdt::{GCounter, NodeAddr, NodeId};
use meshkv_repl::{Digest, Envelope, PruningPhase, PruningState, Value};
use proptest::prelude::*;
use std::collections::BTreeSet;

fn any_node() -> impl Strategy<Value = NodeId> {
    (0u8..4, 1u64..3).prop_map(|(n, inc)| NodeId::new(format!("node-{n}"), inc))
}

fn any_counter_value() -> impl Strategy<Value = Value> {
    proptest::collection::vec((any_node(), 1u64..50), 0..6).prop_map(|increments| {
        let mut counter = GCounter::new();
        for (node, amount) in increments {
            counter.increment(&node, amount);
        }
        Value::Counter(counter)
    })
}

/// Owner, seen set, and whether the prune has been performed.
fn any_pruning_entry() -> impl Strategy<Value = (NodeId, BTreeSet<NodeAddr>, bool)> {
    (
        any_node(),
        proptest::collection::btree_set(
            (0u8..4).prop_map(|n| NodeAddr::new(format!("node-{n}"))),
            0..4,
        ),
        any::<bool>(),
    )
}

/// Envelopes are built through the envelope operations so the generated
/// states satisfy the type's invariants (a performed prune has already
/// cleaned the data).
fn any_envelope() -> impl Strategy<Value = Envelope> {
    (
        any_counter_value(),
        proptest::collection::btree_map(any_node(), any_pruning_entry(), 0..3),
        proptest::bool::weighted(0.1),
    )
        .prop_map(|(data, pruning, deleted)| {
            if deleted {
                return Envelope::deleted();
            }
            let mut envelope = Envelope::new(data);
            for (removed, (owner, seen, performed)) in pruning {
                envelope.set_pruning(
                    removed.clone(),
                    PruningState {
                        owner,
                        phase: PruningPhase::Init { seen },
                    },
                );
                if performed {
                    envelope.prune(&removed);
                }
            }
            envelope
        })
}

proptest! {
    /// Replicas that merged the same set of envelopes in different
    /// orders hold the same envelope, and therefore the same digest.
    #[test]
    fn merge_order_does_not_matter(
        a in any_envelope(),
        b in any_envelope(),
        c in any_envelope(),
    ) {
        let left = a.merge(&b).merge(&c);
        let right = c.merge(&a.merge(&b));
        prop_assert_eq!(&left, &right);
        prop_assert_eq!(
            Digest::of(&left).unwrap(),
            Digest::of(&right).unwrap()
        );
    }

    #[test]
    fn merge_is_commutative(a in any_envelope(), b in any_envelope()) {
        prop_assert_eq!(a.merge(&b), b.merge(&a));
    }

    #[test]
    fn merge_is_idempotent(a in any_envelope()) {
        prop_assert_eq!(a.merge(&a), a);
    }

    /// The tombstone absorbs any merge, in either direction.
    #[test]
    fn deleted_absorbs(a in any_envelope()) {
        prop_assert!(a.merge(&Envelope::deleted()).is_deleted());
        prop_assert!(Envelope::deleted().merge(&a).is_deleted());
    }

    /// Equal digests only for equal envelopes (no spurious collisions in
    /// practice); unequal envelopes digest differently.
    #[test]
    fn digest_distinguishes_envelopes(a in any_envelope(), b in any_envelope()) {
        let da = Digest::of(&a).unwrap();
        let db = Digest::of(&b).unwrap();
        if a == b {
            prop_assert_eq!(da, db);
        } else if !a.is_deleted() && !b.is_deleted() {
            prop_assert_ne!(da, db);
        }
    }
}
