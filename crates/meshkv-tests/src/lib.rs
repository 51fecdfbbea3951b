//! MeshKV integration and property tests.
//!
//! Multi-node clusters are assembled on the in-process cluster bus with
//! deterministic driving: the harness configures intervals far beyond
//! test duration and advances gossip, pruning, and the reachability
//! clock explicitly through the replicator handles.

pub mod harness;

mod convergence_tests;
mod envelope_props;
mod pruning_tests;
