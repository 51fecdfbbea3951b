//! Configuration for the replication engine.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Configuration for one replicator instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicatorConfig {
    /// Optional cluster role filter: only members carrying this role are
    /// treated as peers. `None` peers with every member.
    pub role: Option<String>,
    /// Period of the gossip tick (digest exchange with one random peer)
    /// and of the reachability-clock tick.
    pub gossip_interval: Duration,
    /// Maximum number of envelopes shipped in a single gossip reply.
    pub max_delta_elements: usize,
    /// Period of the pruning tick.
    pub pruning_interval: Duration,
    /// Worst-case time for a change to reach every replica through
    /// gossip in a healthy cluster. Both the wait between a member's
    /// removal and pruning initialisation, and between the prune and the
    /// tombstone, are measured against this on the reachability clock.
    pub max_pruning_dissemination: Duration,
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            role: None,
            gossip_interval: Duration::from_secs(2),
            max_delta_elements: 1000,
            pruning_interval: Duration::from_secs(30),
            max_pruning_dissemination: Duration::from_secs(60),
        }
    }
}

impl ReplicatorConfig {
    /// Config with a role filter and defaults for everything else.
    pub fn with_role(role: impl Into<String>) -> Self {
        Self {
            role: Some(role.into()),
            ..Default::default()
        }
    }

    /// Whether a member carrying `roles` matches this config's filter.
    pub fn matches_role<'a>(&self, mut roles: impl Iterator<Item = &'a str>) -> bool {
        match &self.role {
            None => true,
            Some(required) => roles.any(|r| r == required),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = ReplicatorConfig::default();
        assert_eq!(config.role, None);
        assert_eq!(config.gossip_interval, Duration::from_secs(2));
        assert_eq!(config.max_delta_elements, 1000);
        assert_eq!(config.pruning_interval, Duration::from_secs(30));
        assert_eq!(config.max_pruning_dissemination, Duration::from_secs(60));
    }

    #[test]
    fn test_no_role_matches_everyone() {
        let config = ReplicatorConfig::default();
        assert!(config.matches_role(["storage"].into_iter()));
        assert!(config.matches_role(std::iter::empty()));
    }

    #[test]
    fn test_role_filter() {
        let config = ReplicatorConfig::with_role("kv");
        assert!(config.matches_role(["kv", "frontend"].into_iter()));
        assert!(!config.matches_role(["frontend"].into_iter()));
        assert!(!config.matches_role(std::iter::empty()));
    }
}
