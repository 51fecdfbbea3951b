//! Membership adapter: peer set, leader tracking, and the
//! reachability-adjusted clock.
//!
//! The engine consumes cluster signals as an event stream; this module
//! folds them into the state the replication protocol needs. The peer
//! set tracks addresses (restart-stable); removal bookkeeping tracks
//! unique node identities.
//!
//! The reachability clock only advances while every peer is reachable.
//! Pruning deadlines are measured against it, so a partition pauses the
//! pruning protocol instead of letting it run ahead of dissemination and
//! lose data.

use crate::config::ReplicatorConfig;
use crate::messages::ClusterEvent;
use meshkv_crdt::{NodeAddr, NodeId};
use std::collections::BTreeSet;
use std::time::Duration;
use tracing::{debug, info};

/// Effect of one cluster event, for the engine to act on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MembershipChange {
    /// Nothing the engine needs to act on.
    None,
    /// A member matching the role filter was removed.
    MemberRemoved(NodeId),
    /// This node itself was removed; the engine must stop.
    SelfRemoved,
}

/// Folded cluster state.
#[derive(Debug)]
pub struct Membership {
    self_addr: NodeAddr,
    peers: BTreeSet<NodeAddr>,
    unreachable: BTreeSet<NodeAddr>,
    leader: Option<NodeAddr>,
    all_reachable_clock: Duration,
}

impl Membership {
    /// Fresh membership state for a node at `self_addr`.
    pub fn new(self_addr: NodeAddr) -> Self {
        Self {
            self_addr,
            peers: BTreeSet::new(),
            unreachable: BTreeSet::new(),
            leader: None,
            all_reachable_clock: Duration::ZERO,
        }
    }

    /// This node's address.
    pub fn self_addr(&self) -> &NodeAddr {
        &self.self_addr
    }

    /// The current peer set (never contains self).
    pub fn peers(&self) -> &BTreeSet<NodeAddr> {
        &self.peers
    }

    /// Whether this node currently believes it is the leader.
    pub fn is_leader(&self) -> bool {
        self.leader.as_ref() == Some(&self.self_addr)
    }

    /// Current value of the reachability-adjusted clock.
    pub fn clock(&self) -> Duration {
        self.all_reachable_clock
    }

    /// Advance the clock by `elapsed` iff every peer is reachable.
    pub fn tick(&mut self, elapsed: Duration) {
        if self.unreachable.is_empty() {
            self.all_reachable_clock += elapsed;
        }
    }

    /// Fold one cluster event into the state.
    pub fn apply(&mut self, event: &ClusterEvent, config: &ReplicatorConfig) -> MembershipChange {
        match event {
            ClusterEvent::MemberUp(member) => {
                if member.node.addr != self.self_addr
                    && config.matches_role(member.roles.iter().map(String::as_str))
                {
                    debug!(peer = %member.node, "peer up");
                    self.peers.insert(member.node.addr.clone());
                }
                MembershipChange::None
            }
            ClusterEvent::MemberRemoved(member) => {
                if member.node.addr == self.self_addr {
                    info!("this node was removed from the cluster");
                    return MembershipChange::SelfRemoved;
                }
                if !config.matches_role(member.roles.iter().map(String::as_str)) {
                    return MembershipChange::None;
                }
                debug!(peer = %member.node, "peer removed");
                self.peers.remove(&member.node.addr);
                self.unreachable.remove(&member.node.addr);
                MembershipChange::MemberRemoved(member.node.clone())
            }
            ClusterEvent::Reachable(addr) => {
                self.unreachable.remove(addr);
                MembershipChange::None
            }
            ClusterEvent::Unreachable(addr) => {
                debug!(peer = %addr, "peer unreachable, reachability clock paused");
                self.unreachable.insert(addr.clone());
                MembershipChange::None
            }
            ClusterEvent::LeaderChanged(leader) => {
                self.leader = leader.clone();
                MembershipChange::None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::Member;

    fn member(name: &str) -> Member {
        Member::new(NodeId::new(name, 1))
    }

    fn membership() -> (Membership, ReplicatorConfig) {
        (
            Membership::new(NodeAddr::new("self")),
            ReplicatorConfig::default(),
        )
    }

    #[test]
    fn test_member_up_adds_peer_but_never_self() {
        let (mut m, config) = membership();
        m.apply(&ClusterEvent::MemberUp(member("a")), &config);
        m.apply(&ClusterEvent::MemberUp(member("self")), &config);

        assert!(m.peers().contains(&NodeAddr::new("a")));
        assert!(!m.peers().contains(&NodeAddr::new("self")));
    }

    #[test]
    fn test_role_filter_excludes_non_matching_members() {
        let mut m = Membership::new(NodeAddr::new("self"));
        let config = ReplicatorConfig::with_role("kv");

        m.apply(
            &ClusterEvent::MemberUp(Member::with_roles(NodeId::new("a", 1), ["kv"])),
            &config,
        );
        m.apply(
            &ClusterEvent::MemberUp(Member::with_roles(NodeId::new("b", 1), ["web"])),
            &config,
        );

        assert!(m.peers().contains(&NodeAddr::new("a")));
        assert!(!m.peers().contains(&NodeAddr::new("b")));
    }

    #[test]
    fn test_member_removed_reports_node_id() {
        let (mut m, config) = membership();
        m.apply(&ClusterEvent::MemberUp(member("a")), &config);

        let change = m.apply(&ClusterEvent::MemberRemoved(member("a")), &config);
        assert_eq!(change, MembershipChange::MemberRemoved(NodeId::new("a", 1)));
        assert!(m.peers().is_empty());
    }

    #[test]
    fn test_self_removed_stops_engine() {
        let (mut m, config) = membership();
        let change = m.apply(&ClusterEvent::MemberRemoved(member("self")), &config);
        assert_eq!(change, MembershipChange::SelfRemoved);
    }

    #[test]
    fn test_leader_tracking() {
        let (mut m, config) = membership();
        assert!(!m.is_leader());

        m.apply(
            &ClusterEvent::LeaderChanged(Some(NodeAddr::new("self"))),
            &config,
        );
        assert!(m.is_leader());

        m.apply(
            &ClusterEvent::LeaderChanged(Some(NodeAddr::new("a"))),
            &config,
        );
        assert!(!m.is_leader());
    }

    #[test]
    fn test_clock_pauses_while_any_peer_unreachable() {
        let (mut m, config) = membership();
        m.apply(&ClusterEvent::MemberUp(member("a")), &config);

        m.tick(Duration::from_secs(5));
        assert_eq!(m.clock(), Duration::from_secs(5));

        m.apply(&ClusterEvent::Unreachable(NodeAddr::new("a")), &config);
        m.tick(Duration::from_secs(5));
        assert_eq!(m.clock(), Duration::from_secs(5));

        m.apply(&ClusterEvent::Reachable(NodeAddr::new("a")), &config);
        m.tick(Duration::from_secs(1));
        assert_eq!(m.clock(), Duration::from_secs(6));
    }

    #[test]
    fn test_removed_member_no_longer_blocks_clock() {
        let (mut m, config) = membership();
        m.apply(&ClusterEvent::MemberUp(member("a")), &config);
        m.apply(&ClusterEvent::Unreachable(NodeAddr::new("a")), &config);
        m.apply(&ClusterEvent::MemberRemoved(member("a")), &config);

        m.tick(Duration::from_secs(3));
        assert_eq!(m.clock(), Duration::from_secs(3));
    }
}
