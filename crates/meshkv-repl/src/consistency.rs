//! Per-operation consistency levels and quorum arithmetic.
//!
//! A coordinator is done once the number of peers it is still waiting on
//! drops to the level's threshold. Thresholds are expressed as signed
//! counts: a negative threshold can never be reached and the coordinator
//! runs into its timeout, which is the correct outcome for e.g.
//! `From(5)` on a three-node cluster.

use serde::{Deserialize, Serialize};

/// Read-side consistency level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReadConsistency {
    /// Serve from the local replica only.
    One,
    /// Wait for two replicas (local plus one peer).
    Two,
    /// Wait for three replicas.
    Three,
    /// Wait for `n` replicas in total.
    From(u32),
    /// Wait for a majority of the cluster. Fails fast on clusters of
    /// fewer than three nodes.
    Quorum,
    /// Wait for every peer.
    All,
}

/// Write-side consistency level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteConsistency {
    /// Commit locally only; replication happens through gossip.
    One,
    /// Wait for acknowledgements from two replicas (local plus one peer).
    Two,
    /// Wait for acknowledgements from three replicas.
    Three,
    /// Wait for acknowledgements from `n` replicas in total.
    To(u32),
    /// Wait for a majority of the cluster. Fails fast on clusters of
    /// fewer than three nodes.
    Quorum,
    /// Wait for every peer.
    All,
}

/// Outcome of threshold derivation for a cluster of `peer_count` peers
/// (the local replica is not counted in `peer_count`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Threshold {
    /// Done once the remaining-peer count is at or below this value.
    Remaining(i64),
    /// The level cannot be satisfied on this cluster; fail immediately.
    Unattainable,
}

impl Threshold {
    /// Whether `remaining` outstanding peers satisfies the threshold.
    pub fn met(&self, remaining: usize) -> bool {
        match self {
            Threshold::Remaining(limit) => (remaining as i64) <= *limit,
            Threshold::Unattainable => false,
        }
    }
}

fn derive(n_replicas: Option<u32>, quorum: bool, all: bool, peer_count: usize) -> Threshold {
    let peers = peer_count as i64;
    if all {
        return Threshold::Remaining(0);
    }
    if quorum {
        let cluster = peers + 1;
        if cluster < 3 {
            return Threshold::Unattainable;
        }
        return Threshold::Remaining(cluster - (cluster / 2 + 1));
    }
    let n = i64::from(n_replicas.unwrap_or(1));
    Threshold::Remaining(peers - (n - 1))
}

impl ReadConsistency {
    /// Threshold for a read fan-out over `peer_count` peers.
    pub fn threshold(&self, peer_count: usize) -> Threshold {
        match self {
            ReadConsistency::One => Threshold::Remaining(peer_count as i64),
            ReadConsistency::Two => derive(Some(2), false, false, peer_count),
            ReadConsistency::Three => derive(Some(3), false, false, peer_count),
            ReadConsistency::From(n) => derive(Some(*n), false, false, peer_count),
            ReadConsistency::Quorum => derive(None, true, false, peer_count),
            ReadConsistency::All => derive(None, false, true, peer_count),
        }
    }

    /// Whether this level is served from the local replica without a
    /// coordinator.
    pub fn is_local(&self) -> bool {
        matches!(self, ReadConsistency::One)
    }
}

impl WriteConsistency {
    /// Threshold for a write fan-out over `peer_count` peers.
    pub fn threshold(&self, peer_count: usize) -> Threshold {
        match self {
            WriteConsistency::One => Threshold::Remaining(peer_count as i64),
            WriteConsistency::Two => derive(Some(2), false, false, peer_count),
            WriteConsistency::Three => derive(Some(3), false, false, peer_count),
            WriteConsistency::To(n) => derive(Some(*n), false, false, peer_count),
            WriteConsistency::Quorum => derive(None, true, false, peer_count),
            WriteConsistency::All => derive(None, false, true, peer_count),
        }
    }

    /// Whether this level commits locally without a coordinator.
    pub fn is_local(&self) -> bool {
        matches!(self, WriteConsistency::One)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_n_threshold() {
        // 4 peers, need 2 replicas total: done with 3 still outstanding.
        assert_eq!(
            ReadConsistency::Two.threshold(4),
            Threshold::Remaining(3)
        );
        assert_eq!(
            WriteConsistency::To(3).threshold(4),
            Threshold::Remaining(2)
        );
    }

    #[test]
    fn test_from_n_larger_than_cluster_never_met() {
        let threshold = ReadConsistency::From(5).threshold(2);
        assert_eq!(threshold, Threshold::Remaining(-2));
        assert!(!threshold.met(0));
    }

    #[test]
    fn test_quorum_three_nodes() {
        // N = 3, majority 2: local + 1 peer, so 1 of 2 peers may remain.
        let threshold = ReadConsistency::Quorum.threshold(2);
        assert_eq!(threshold, Threshold::Remaining(1));
        assert!(threshold.met(1));
        assert!(!threshold.met(2));
    }

    #[test]
    fn test_quorum_five_nodes() {
        // N = 5, majority 3: 2 of 4 peers may remain.
        assert_eq!(
            WriteConsistency::Quorum.threshold(4),
            Threshold::Remaining(2)
        );
    }

    #[test]
    fn test_quorum_under_three_nodes_unattainable() {
        assert_eq!(ReadConsistency::Quorum.threshold(0), Threshold::Unattainable);
        assert_eq!(ReadConsistency::Quorum.threshold(1), Threshold::Unattainable);
        assert_eq!(WriteConsistency::Quorum.threshold(1), Threshold::Unattainable);
        assert!(!Threshold::Unattainable.met(0));
    }

    #[test]
    fn test_all_requires_every_peer() {
        let threshold = WriteConsistency::All.threshold(3);
        assert_eq!(threshold, Threshold::Remaining(0));
        assert!(threshold.met(0));
        assert!(!threshold.met(1));
    }

    #[test]
    fn test_single_node_cluster_trivially_met() {
        // No peers: every non-quorum level is satisfied immediately.
        assert!(ReadConsistency::One.threshold(0).met(0));
        assert!(WriteConsistency::To(1).threshold(0).met(0));
        assert!(WriteConsistency::All.threshold(0).met(0));
    }

    #[test]
    fn test_is_local() {
        assert!(ReadConsistency::One.is_local());
        assert!(!ReadConsistency::Quorum.is_local());
        assert!(WriteConsistency::One.is_local());
        assert!(!WriteConsistency::All.is_local());
    }
}
