//! In-process cluster wiring.
//!
//! `hub` routes encoded frames between registered nodes and injects faults,
//! `node` runs one node (member executor plus, on the leader, the
//! coordinator), and `cluster` starts a whole cluster with one leader.

mod cluster;
mod hub;
mod node;

pub use cluster::{ClusterConfig, LocalCluster};
pub use hub::{HubStats, LocalEndpoint, LocalHub};
pub use node::{LocalNode, LocalNodeOptions};
