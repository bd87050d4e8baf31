//! Whole local cluster with the first node as leader.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;

use super::hub::LocalHub;
use super::node::{LocalNode, LocalNodeOptions};
use crate::coord::{NodeApply, NodeIdentity, NoopApply, DEFAULT_REQUEST_TIMEOUT, DEFAULT_SWEEP_INTERVAL};
use crate::oplog::{FileOpLog, MemoryOpLog, OperationLog};
use crate::sequence::{shared, TransactionSequenceManager, DEFAULT_SLOT_COUNT};

/// Term the leader's operation log starts in.
const INITIAL_TERM: u64 = 1;

#[derive(Clone, Debug)]
pub struct ClusterConfig {
    pub members: usize,
    pub database: String,
    pub slot_count: usize,
    pub request_timeout: Duration,
    pub sweep_interval: Duration,
    /// File-backed logs under `<dir>/<node name>`; in-memory logs when unset.
    pub oplog_dir: Option<PathBuf>,
    /// Seed for the hub's random drops.
    pub seed: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            members: 3,
            database: "db".to_string(),
            slot_count: DEFAULT_SLOT_COUNT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            oplog_dir: None,
            seed: 0,
        }
    }
}

/// Nodes `node1..=nodeN` on one hub; `node1` leads and every node is a member.
pub struct LocalCluster {
    hub: LocalHub,
    nodes: Vec<LocalNode>,
}

impl LocalCluster {
    pub fn start(config: &ClusterConfig) -> anyhow::Result<Self> {
        Self::start_with_apply(config, Arc::new(NoopApply))
    }

    /// Start the cluster with `apply` as every node's local storage hook.
    pub fn start_with_apply(
        config: &ClusterConfig,
        apply: Arc<dyn NodeApply>,
    ) -> anyhow::Result<Self> {
        anyhow::ensure!(config.members > 0, "cluster needs at least one member");
        let hub = LocalHub::new(config.seed);
        let identities: Vec<NodeIdentity> = (1..=config.members as u64)
            .map(|id| NodeIdentity::new(format!("node{id}"), id))
            .collect();
        let leader = identities[0].clone();

        let mut nodes = Vec::with_capacity(identities.len());
        for identity in &identities {
            let oplog: Arc<dyn OperationLog> = match &config.oplog_dir {
                Some(dir) => Arc::new(
                    FileOpLog::open(dir.join(&identity.name))
                        .with_context(|| format!("open operation log for {identity}"))?,
                ),
                None => Arc::new(MemoryOpLog::new()),
            };
            let sequence = shared(TransactionSequenceManager::new(
                identity.name.clone(),
                config.slot_count,
            ));
            let node = LocalNode::start(
                &hub,
                LocalNodeOptions {
                    identity: identity.clone(),
                    leader: leader.clone(),
                    database: config.database.clone(),
                    term: INITIAL_TERM,
                    oplog,
                    sequence,
                    apply: apply.clone(),
                    request_timeout: config.request_timeout,
                    sweep_interval: config.sweep_interval,
                },
            )?;
            nodes.push(node);
        }

        let coordinator = nodes[0]
            .coordinator()
            .context("leader has no coordinator")?;
        for identity in identities {
            coordinator.join(identity)?;
        }
        tracing::info!(
            members = nodes.len(),
            leader = %leader,
            database = %config.database,
            "local cluster started"
        );
        Ok(Self { hub, nodes })
    }

    pub fn hub(&self) -> &LocalHub {
        &self.hub
    }

    pub fn leader(&self) -> &LocalNode {
        &self.nodes[0]
    }

    pub fn nodes(&self) -> &[LocalNode] {
        &self.nodes
    }

    pub fn node(&self, index: usize) -> Option<&LocalNode> {
        self.nodes.get(index)
    }

    /// Stop every node; returns the contexts the coordinator abandoned.
    pub async fn shutdown(self) -> anyhow::Result<usize> {
        let mut abandoned = 0;
        for node in self.nodes {
            abandoned += node.shutdown().await?;
        }
        Ok(abandoned)
    }
}
