//! Built-in operations: two-phase transactions, broadcast commands, and
//! sequence status checks.

use std::collections::BTreeSet;

use super::context::{RequestContext, ResponseHandler};
use super::coordinator::CoordinatorCore;
use super::messages::{
    CommandOutcome, NodeRequest, NodeResponse, PrepareOutcome, SequenceReport, SubmitRequest,
    SubmitResponse, TransactionOutcome,
};
use super::types::{NodeIdentity, Submission};
use crate::sequence::TransactionId;

/// First step of a built-in operation, run on the coordinator task.
pub fn begin_operation(
    core: &mut CoordinatorCore,
    submission: &Submission,
    request: SubmitRequest,
) -> anyhow::Result<()> {
    let operation_id = submission.operation_id.clone();
    match request {
        SubmitRequest::Transaction { changes } => begin_transaction(core, submission, changes),
        SubmitRequest::Command { command } => {
            let request = NodeRequest::Command {
                operation_id,
                command,
            };
            core.send_operation(submission, request, Box::new(CommandHandler))?;
            Ok(())
        }
        SubmitRequest::CheckSequences => {
            let request = NodeRequest::SequenceStatus { operation_id };
            core.send_operation(submission, request, Box::new(CheckSequencesHandler))?;
            Ok(())
        }
    }
}

fn begin_transaction(
    core: &mut CoordinatorCore,
    submission: &Submission,
    changes: Vec<u8>,
) -> anyhow::Result<()> {
    let Some(transaction_id) = core.with_sequence(|manager| manager.next())? else {
        tracing::warn!(
            operation = %submission.operation_id,
            "no free transaction sequence slot"
        );
        core.reply(
            submission,
            SubmitResponse::Error("no free transaction sequence slot".to_string()),
        );
        return Ok(());
    };
    let request = NodeRequest::Prepare {
        operation_id: submission.operation_id.clone(),
        transaction_id: transaction_id.clone(),
        changes,
    };
    let handler = Box::new(PrepareHandler {
        transaction_id: transaction_id.clone(),
    });
    if let Err(err) = core.send_operation(submission, request, handler) {
        core.with_sequence(|manager| manager.notify_failure(&transaction_id))?;
        return Err(err);
    }
    Ok(())
}

/// Phase one: wait for a majority of prepares, then broadcast the decision.
struct PrepareHandler {
    transaction_id: TransactionId,
}

impl PrepareHandler {
    fn decide(
        &self,
        core: &mut CoordinatorCore,
        context: &RequestContext,
        commit: bool,
    ) -> anyhow::Result<()> {
        let missing = core.with_sequence(|manager| {
            if commit {
                manager.notify_success(&self.transaction_id)
            } else {
                manager.notify_failure(&self.transaction_id);
                Ok(Vec::new())
            }
        })??;
        tracing::debug!(
            transaction = %self.transaction_id,
            commit,
            prepared = context.responses.len(),
            "transaction decided"
        );
        let request = NodeRequest::Decide {
            operation_id: context.submission.operation_id.clone(),
            transaction_id: self.transaction_id.clone(),
            commit,
        };
        let handler = Box::new(DecideHandler {
            transaction_id: self.transaction_id.clone(),
            commit,
            missing,
        });
        core.send_operation(&context.submission, request, handler)?;
        Ok(())
    }
}

impl ResponseHandler for PrepareHandler {
    fn receive(
        &mut self,
        core: &mut CoordinatorCore,
        context: &RequestContext,
        _member: &NodeIdentity,
        _response: &NodeResponse,
    ) -> anyhow::Result<bool> {
        let prepared = context
            .responses
            .values()
            .filter(|response| matches!(response, NodeResponse::Prepared(PrepareOutcome::Prepared)))
            .count();
        let refused = context.responses.len() - prepared;
        let quorum = context.quorum();
        if prepared >= quorum {
            self.decide(core, context, true)?;
            return Ok(true);
        }
        if refused > context.involved_members.len().saturating_sub(quorum) {
            tracing::warn!(
                transaction = %self.transaction_id,
                refused,
                quorum,
                "transaction cannot reach quorum"
            );
            self.decide(core, context, false)?;
            return Ok(true);
        }
        Ok(false)
    }

    fn timeout(
        &mut self,
        core: &mut CoordinatorCore,
        context: &RequestContext,
    ) -> anyhow::Result<bool> {
        self.decide(core, context, false)?;
        Ok(true)
    }
}

/// Phase two: reply once every member acknowledged the decision, or at the
/// deadline with whoever did.
struct DecideHandler {
    transaction_id: TransactionId,
    commit: bool,
    /// Gaps the coordinator itself found while confirming.
    missing: Vec<TransactionId>,
}

impl DecideHandler {
    fn outcome(&self, context: &RequestContext) -> SubmitResponse {
        let mut acknowledged = Vec::new();
        let mut missing: BTreeSet<TransactionId> = self.missing.iter().cloned().collect();
        for (member, response) in &context.responses {
            if let NodeResponse::Decided {
                missing: reported, ..
            } = response
            {
                acknowledged.push(member.clone());
                missing.extend(reported.iter().cloned());
            }
        }
        let unacknowledged = context
            .involved_members
            .iter()
            .filter(|member| !acknowledged.contains(*member))
            .cloned()
            .collect();
        SubmitResponse::Transaction(TransactionOutcome {
            transaction_id: self.transaction_id.clone(),
            committed: self.commit,
            acknowledged,
            unacknowledged,
            missing: missing.into_iter().collect(),
        })
    }
}

impl ResponseHandler for DecideHandler {
    fn receive(
        &mut self,
        core: &mut CoordinatorCore,
        context: &RequestContext,
        _member: &NodeIdentity,
        _response: &NodeResponse,
    ) -> anyhow::Result<bool> {
        if !context.is_complete() {
            return Ok(false);
        }
        core.reply(&context.submission, self.outcome(context));
        Ok(true)
    }

    fn timeout(
        &mut self,
        core: &mut CoordinatorCore,
        context: &RequestContext,
    ) -> anyhow::Result<bool> {
        core.reply(&context.submission, self.outcome(context));
        Ok(true)
    }
}

/// Single round executed by every member.
struct CommandHandler;

impl CommandHandler {
    fn outcome(context: &RequestContext) -> SubmitResponse {
        let mut outcome = CommandOutcome {
            succeeded: Vec::new(),
            failed: Vec::new(),
            unresponsive: Vec::new(),
        };
        for member in &context.involved_members {
            match context.responses.get(member) {
                Some(NodeResponse::Command { error: None }) => {
                    outcome.succeeded.push(member.clone())
                }
                Some(NodeResponse::Command { error: Some(error) }) => {
                    outcome.failed.push((member.clone(), error.clone()))
                }
                Some(NodeResponse::OutOfSync { .. }) => outcome
                    .failed
                    .push((member.clone(), "member out of sync".to_string())),
                Some(other) => outcome
                    .failed
                    .push((member.clone(), format!("unexpected response {other:?}"))),
                None => outcome.unresponsive.push(member.clone()),
            }
        }
        SubmitResponse::Command(outcome)
    }
}

impl ResponseHandler for CommandHandler {
    fn receive(
        &mut self,
        core: &mut CoordinatorCore,
        context: &RequestContext,
        _member: &NodeIdentity,
        _response: &NodeResponse,
    ) -> anyhow::Result<bool> {
        if !context.is_complete() {
            return Ok(false);
        }
        core.reply(&context.submission, Self::outcome(context));
        Ok(true)
    }

    fn timeout(
        &mut self,
        core: &mut CoordinatorCore,
        context: &RequestContext,
    ) -> anyhow::Result<bool> {
        core.reply(&context.submission, Self::outcome(context));
        Ok(true)
    }
}

/// Collect member statuses and compare them against the coordinator node.
struct CheckSequencesHandler;

impl CheckSequencesHandler {
    fn report(core: &CoordinatorCore, context: &RequestContext) -> anyhow::Result<SubmitResponse> {
        let mut statuses = Vec::new();
        let mut coordinator_missing = BTreeSet::new();
        for (member, response) in &context.responses {
            if let NodeResponse::SequenceStatus(status) = response {
                coordinator_missing.extend(core.with_sequence(|manager| {
                    manager.check_self_status(status)
                })?);
                statuses.push((member.clone(), status.clone()));
            }
        }
        if !coordinator_missing.is_empty() {
            tracing::warn!(
                missing = coordinator_missing.len(),
                "coordinator is missing transactions"
            );
        }
        Ok(SubmitResponse::SequenceReport(SequenceReport {
            statuses,
            coordinator_missing: coordinator_missing.into_iter().collect(),
        }))
    }
}

impl ResponseHandler for CheckSequencesHandler {
    fn receive(
        &mut self,
        core: &mut CoordinatorCore,
        context: &RequestContext,
        _member: &NodeIdentity,
        _response: &NodeResponse,
    ) -> anyhow::Result<bool> {
        if !context.is_complete() {
            return Ok(false);
        }
        let report = Self::report(core, context)?;
        core.reply(&context.submission, report);
        Ok(true)
    }

    fn timeout(
        &mut self,
        core: &mut CoordinatorCore,
        context: &RequestContext,
    ) -> anyhow::Result<bool> {
        let report = Self::report(core, context)?;
        core.reply(&context.submission, report);
        Ok(true)
    }
}
