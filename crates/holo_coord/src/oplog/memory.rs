//! Volatile operation log.

use std::sync::Mutex;

use super::{LogCore, LogIdStatus, OpLogEntry, OperationLog};
use crate::coord::{LogId, NodeRequest};

/// Operation log kept in memory only; contents are lost on restart.
#[derive(Debug, Default)]
pub struct MemoryOpLog {
    core: Mutex<LogCore>,
}

impl MemoryOpLog {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_core<R>(&self, f: impl FnOnce(&mut LogCore) -> R) -> anyhow::Result<R> {
        let mut core = self
            .core
            .lock()
            .map_err(|_| anyhow::anyhow!("operation log lock poisoned"))?;
        Ok(f(&mut core))
    }
}

impl OperationLog for MemoryOpLog {
    fn log(&self, request: &NodeRequest) -> anyhow::Result<LogId> {
        let (log_id, _) = self.with_core(|core| core.log(request))??;
        Ok(log_id)
    }

    fn log_received(&self, log_id: LogId, request: &NodeRequest) -> anyhow::Result<bool> {
        let (accepted, _) = self.with_core(|core| core.log_received(log_id, request))??;
        Ok(accepted)
    }

    fn last_persistent_log(&self) -> anyhow::Result<Option<LogId>> {
        self.with_core(|core| core.last())
    }

    fn iterate(&self, from: u64, to: u64) -> anyhow::Result<Vec<OpLogEntry>> {
        self.with_core(|core| core.iterate(from, to))
    }

    fn search_from(&self, log_id: LogId) -> anyhow::Result<Option<Vec<OpLogEntry>>> {
        self.with_core(|core| core.search_from(log_id))
    }

    fn remove_after(&self, log_id: LogId) -> anyhow::Result<LogIdStatus> {
        self.with_core(|core| core.remove_after(log_id).0)
    }

    fn set_leader(&self, leader: bool, term: u64) -> anyhow::Result<()> {
        self.with_core(|core| core.set_leader(leader, term))
    }

    fn prune_until(&self, sequence: u64) -> anyhow::Result<usize> {
        self.with_core(|core| core.prune_until(sequence).0)
    }
}
