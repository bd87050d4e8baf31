//! Member-side execution of coordinator rounds.

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;

use super::messages::{NodeRequest, NodeResponse, PrepareOutcome};
use super::types::{LogId, NodeIdentity};
use crate::oplog::OperationLog;
use crate::sequence::{
    with_manager, SharedSequenceManager, TransactionId, TransactionSequenceStatus,
    ValidationResult,
};

/// Local storage hooks invoked by the member executor.
///
/// The defaults accept everything without side effects.
pub trait NodeApply: Send + Sync + 'static {
    fn prepare(&self, _transaction: &TransactionId, _changes: &[u8]) -> anyhow::Result<()> {
        Ok(())
    }

    fn commit(&self, _transaction: &TransactionId) -> anyhow::Result<()> {
        Ok(())
    }

    fn rollback(&self, _transaction: &TransactionId) -> anyhow::Result<()> {
        Ok(())
    }

    fn execute(&self, _command: &[u8]) -> anyhow::Result<()> {
        Ok(())
    }
}

/// `NodeApply` that does nothing.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopApply;

impl NodeApply for NoopApply {}

/// Applies coordinator rounds on one node.
pub struct MemberWorker {
    local: NodeIdentity,
    oplog: Arc<dyn OperationLog>,
    sequence: SharedSequenceManager,
    apply: Arc<dyn NodeApply>,
    /// Transactions prepared locally and not yet decided.
    prepared: HashSet<TransactionId>,
    /// Transactions known to be committed elsewhere but never seen here.
    missing: BTreeSet<TransactionId>,
}

impl MemberWorker {
    pub fn new(
        local: NodeIdentity,
        oplog: Arc<dyn OperationLog>,
        sequence: SharedSequenceManager,
        apply: Arc<dyn NodeApply>,
    ) -> Self {
        Self {
            local,
            oplog,
            sequence,
            apply,
            prepared: HashSet::new(),
            missing: BTreeSet::new(),
        }
    }

    pub fn missing(&self) -> &BTreeSet<TransactionId> {
        &self.missing
    }

    pub fn status(&self) -> anyhow::Result<TransactionSequenceStatus> {
        with_manager(&self.sequence, |manager| manager.current_status())
    }

    /// Execute one round sent by `from`.
    ///
    /// Rounds from this node itself are already in its log (it is the
    /// leader); everything else goes through `log_received` first and is
    /// refused when it does not follow the local log.
    pub fn handle(
        &mut self,
        from: &NodeIdentity,
        log_id: LogId,
        request: &NodeRequest,
    ) -> anyhow::Result<NodeResponse> {
        if from != &self.local && !self.oplog.log_received(log_id, request)? {
            let last = self.oplog.last_persistent_log()?;
            tracing::warn!(
                node = %self.local,
                log_id = %log_id,
                operation = %request.operation_id(),
                last = ?last,
                "operation log out of sync"
            );
            return Ok(NodeResponse::OutOfSync { last });
        }

        match request {
            NodeRequest::Prepare {
                transaction_id,
                changes,
                ..
            } => self.prepare(transaction_id, changes),
            NodeRequest::Decide {
                transaction_id,
                commit: true,
                ..
            } => self.commit(transaction_id),
            NodeRequest::Decide {
                transaction_id,
                commit: false,
                ..
            } => self.rollback(transaction_id),
            NodeRequest::Command { command, .. } => {
                let error = self.apply.execute(command).err().map(|err| {
                    tracing::warn!(node = %self.local, error = ?err, "command failed");
                    format!("{err:#}")
                });
                Ok(NodeResponse::Command { error })
            }
            NodeRequest::SequenceStatus { .. } => {
                Ok(NodeResponse::SequenceStatus(self.status()?))
            }
        }
    }

    fn prepare(
        &mut self,
        transaction_id: &TransactionId,
        changes: &[u8],
    ) -> anyhow::Result<NodeResponse> {
        let validation = with_manager(&self.sequence, |manager| {
            manager.validate_transaction_id(transaction_id)
        })??;
        if validation != ValidationResult::Valid {
            tracing::debug!(
                node = %self.local,
                transaction = %transaction_id,
                validation = ?validation,
                "transaction rejected"
            );
            return Ok(NodeResponse::Prepared(PrepareOutcome::Rejected(validation)));
        }
        match self.apply.prepare(transaction_id, changes) {
            Ok(()) => {
                self.prepared.insert(transaction_id.clone());
                Ok(NodeResponse::Prepared(PrepareOutcome::Prepared))
            }
            Err(err) => {
                tracing::warn!(
                    node = %self.local,
                    transaction = %transaction_id,
                    error = ?err,
                    "prepare failed"
                );
                with_manager(&self.sequence, |manager| {
                    manager.notify_failure(transaction_id)
                })?;
                Ok(NodeResponse::Prepared(PrepareOutcome::Failed(format!(
                    "{err:#}"
                ))))
            }
        }
    }

    fn commit(&mut self, transaction_id: &TransactionId) -> anyhow::Result<NodeResponse> {
        let missing = with_manager(&self.sequence, |manager| {
            manager.notify_success(transaction_id)
        })??;
        self.missing
            .retain(|known| !known.same_transaction(transaction_id));
        if !missing.is_empty() {
            tracing::warn!(
                node = %self.local,
                transaction = %transaction_id,
                missing = missing.len(),
                "committed past missing transactions"
            );
            self.missing.extend(missing.iter().cloned());
        }

        let mut applied = false;
        if self.prepared.remove(transaction_id) {
            match self.apply.commit(transaction_id) {
                Ok(()) => applied = true,
                Err(err) => tracing::error!(
                    node = %self.local,
                    transaction = %transaction_id,
                    error = ?err,
                    "local commit failed"
                ),
            }
        }
        Ok(NodeResponse::Decided { applied, missing })
    }

    fn rollback(&mut self, transaction_id: &TransactionId) -> anyhow::Result<NodeResponse> {
        with_manager(&self.sequence, |manager| {
            manager.notify_failure(transaction_id)
        })?;
        let mut applied = false;
        if self.prepared.remove(transaction_id) {
            match self.apply.rollback(transaction_id) {
                Ok(()) => applied = true,
                Err(err) => tracing::error!(
                    node = %self.local,
                    transaction = %transaction_id,
                    error = ?err,
                    "local rollback failed"
                ),
            }
        }
        Ok(NodeResponse::Decided {
            applied,
            missing: Vec::new(),
        })
    }
}
