//! Digest comparison for the anti-entropy exchange.
//!
//! A gossip round is digest-driven: the initiating node ships its full
//! digest map in a `Status`; the receiver answers with the envelopes the
//! sender appears to be missing or holding stale, capped at
//! `max_delta_elements`. Keys the *receiver* lacks are not requested in
//! the same round; the receiver's own next gossip tick discovers them,
//! which keeps each round a single request/response pair.

use crate::digest::Digest;
use crate::messages::Key;
use std::collections::BTreeMap;

/// Keys whose envelopes should be shipped to a peer that sent us
/// `theirs`: keys we hold that they lack, plus keys where the digests
/// disagree. At most `max_elements` keys, in key order.
pub fn delta_keys(
    ours: &BTreeMap<Key, Digest>,
    theirs: &BTreeMap<Key, Digest>,
    max_elements: usize,
) -> Vec<Key> {
    ours.iter()
        .filter(|(key, digest)| theirs.get(*key) != Some(*digest))
        .map(|(key, _)| key.clone())
        .take(max_elements)
        .collect()
}
