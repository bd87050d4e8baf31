//! Leader-side coordinator.
//!
//! All coordinator state lives in `CoordinatorCore`, owned by one tokio task.
//! The cloneable `Coordinator` handle only enqueues commands on that task's
//! mailbox, so contexts, membership, and operation log appends never need a
//! lock. The task also runs a periodic sweep that hands expired contexts to
//! their handler's `timeout`.
//!
//! Every submitted operation is tracked until it has no live contexts left,
//! which gives the exactly-once reply guarantee: a second reply is dropped,
//! and an operation that runs out of work without replying gets an error
//! reply.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{self, Instant, MissedTickBehavior};

use super::context::{RequestContext, ResponseHandler};
use super::handlers::begin_operation;
use super::messages::{NodeRequest, NodeResponse, SubmitRequest, SubmitResponse};
use super::types::{CoordinatorConfig, LogId, Network, NodeIdentity, SessionOperationId, Submission};
use crate::oplog::OperationLog;
use crate::sequence::{with_manager, SharedSequenceManager, TransactionSequenceManager};

/// Shortest sweep period accepted; `tokio::time::interval` rejects zero.
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(1);
/// Longest timeout or sweep period honoured; larger values are clamped so
/// deadlines stay representable.
const MAX_REQUEST_TIMEOUT: Duration = Duration::from_secs(86400 * 365 * 30);

type BeginFn = Box<dyn FnOnce(&mut CoordinatorCore, &Submission) -> anyhow::Result<()> + Send>;

enum Command {
    Join(NodeIdentity),
    Leave(NodeIdentity),
    Submit {
        submission: Submission,
        begin: BeginFn,
    },
    Receive {
        member: NodeIdentity,
        log_id: LogId,
        response: NodeResponse,
    },
    CatchUp {
        member: NodeIdentity,
        last: Option<LogId>,
    },
    Stats(oneshot::Sender<CoordinatorStats>),
    Close(oneshot::Sender<usize>),
}

/// Snapshot of coordinator state and counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct CoordinatorStats {
    pub members: usize,
    pub contexts: usize,
    pub operations: usize,
    pub replies: u64,
    pub timeouts: u64,
    pub stale_responses: u64,
    pub duplicate_submissions: u64,
    pub duplicate_replies: u64,
    pub failed_operations: u64,
}

/// Handle used to drive a running coordinator.
#[derive(Clone)]
pub struct Coordinator {
    tx: mpsc::UnboundedSender<Command>,
}

impl Coordinator {
    /// Start the coordinator task on the current tokio runtime.
    pub fn spawn(
        config: CoordinatorConfig,
        oplog: Arc<dyn OperationLog>,
        network: Arc<dyn Network>,
        sequence: SharedSequenceManager,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let core = CoordinatorCore::new(config, oplog, network, sequence);
        tokio::spawn(run(core, rx));
        Self { tx }
    }

    fn send(&self, command: Command) -> anyhow::Result<()> {
        self.tx
            .send(command)
            .map_err(|_| anyhow::anyhow!("coordinator is closed"))
    }

    /// Add a member to future rounds; rounds already in flight keep their
    /// membership snapshot.
    pub fn join(&self, member: NodeIdentity) -> anyhow::Result<()> {
        self.send(Command::Join(member))
    }

    pub fn leave(&self, member: NodeIdentity) -> anyhow::Result<()> {
        self.send(Command::Leave(member))
    }

    /// Start one of the built-in operations.
    pub fn submit(
        &self,
        requester: NodeIdentity,
        operation_id: SessionOperationId,
        request: SubmitRequest,
    ) -> anyhow::Result<()> {
        self.submit_with(requester, operation_id, move |core, submission| {
            begin_operation(core, submission, request)
        })
    }

    /// Start an operation whose first step is `begin`, run on the coordinator
    /// task. An error from `begin` becomes an error reply.
    pub fn submit_with<F>(
        &self,
        requester: NodeIdentity,
        operation_id: SessionOperationId,
        begin: F,
    ) -> anyhow::Result<()>
    where
        F: FnOnce(&mut CoordinatorCore, &Submission) -> anyhow::Result<()> + Send + 'static,
    {
        self.send(Command::Submit {
            submission: Submission {
                requester,
                operation_id,
            },
            begin: Box::new(begin),
        })
    }

    /// Feed a member response into the coordinator.
    pub fn receive(
        &self,
        member: NodeIdentity,
        log_id: LogId,
        response: NodeResponse,
    ) -> anyhow::Result<()> {
        self.send(Command::Receive {
            member,
            log_id,
            response,
        })
    }

    /// Resend the log entries a member whose log ends at `last` lacks.
    ///
    /// Commands run in order, so the entries go out ahead of any round the
    /// coordinator sends after a later `receive`.
    pub fn catch_up(&self, member: NodeIdentity, last: Option<LogId>) -> anyhow::Result<()> {
        self.send(Command::CatchUp { member, last })
    }

    pub async fn stats(&self) -> anyhow::Result<CoordinatorStats> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Stats(tx))?;
        rx.await.context("coordinator stopped")
    }

    /// Stop the coordinator. Pending contexts are dropped without replying;
    /// the number dropped is returned.
    pub async fn close(&self) -> anyhow::Result<usize> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Close(tx))?;
        rx.await.context("coordinator stopped")
    }
}

async fn run(mut core: CoordinatorCore, mut rx: mpsc::UnboundedReceiver<Command>) {
    let mut sweep = time::interval(
        core.config
            .sweep_interval
            .clamp(MIN_SWEEP_INTERVAL, MAX_REQUEST_TIMEOUT),
    );
    sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            command = rx.recv() => match command {
                Some(command) => {
                    if !core.handle(command) {
                        break;
                    }
                }
                None => {
                    core.close();
                    break;
                }
            },
            _ = sweep.tick() => core.sweep(),
        }
    }
    tracing::debug!(database = %core.config.database, "coordinator stopped");
}

struct Slot {
    context: RequestContext,
    handler: Box<dyn ResponseHandler>,
}

/// Reply bookkeeping for one submitted operation.
struct Operation {
    requester: NodeIdentity,
    live_contexts: usize,
    replied: bool,
}

#[derive(Default)]
struct Counters {
    replies: u64,
    timeouts: u64,
    stale_responses: u64,
    duplicate_submissions: u64,
    duplicate_replies: u64,
    failed_operations: u64,
}

/// Coordinator state, owned by the coordinator task and lent to handlers.
pub struct CoordinatorCore {
    config: CoordinatorConfig,
    oplog: Arc<dyn OperationLog>,
    network: Arc<dyn Network>,
    sequence: SharedSequenceManager,
    members: BTreeSet<NodeIdentity>,
    contexts: BTreeMap<LogId, Slot>,
    operations: HashMap<SessionOperationId, Operation>,
    completed: VecDeque<SessionOperationId>,
    completed_index: HashSet<SessionOperationId>,
    counters: Counters,
}

impl CoordinatorCore {
    fn new(
        config: CoordinatorConfig,
        oplog: Arc<dyn OperationLog>,
        network: Arc<dyn Network>,
        sequence: SharedSequenceManager,
    ) -> Self {
        Self {
            config,
            oplog,
            network,
            sequence,
            members: BTreeSet::new(),
            contexts: BTreeMap::new(),
            operations: HashMap::new(),
            completed: VecDeque::new(),
            completed_index: HashSet::new(),
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    pub fn local(&self) -> &NodeIdentity {
        &self.config.local
    }

    pub fn members(&self) -> &BTreeSet<NodeIdentity> {
        &self.members
    }

    /// Run `f` against this node's transaction sequence manager.
    pub fn with_sequence<R>(
        &self,
        f: impl FnOnce(&mut TransactionSequenceManager) -> R,
    ) -> anyhow::Result<R> {
        with_manager(&self.sequence, f)
    }

    /// Start a round with the default request timeout.
    pub fn send_operation(
        &mut self,
        submission: &Submission,
        request: NodeRequest,
        handler: Box<dyn ResponseHandler>,
    ) -> anyhow::Result<LogId> {
        let timeout = self.config.request_timeout;
        self.send_operation_with_timeout(submission, request, handler, timeout)
    }

    /// Log `request`, register its context, and send it to every current
    /// member.
    ///
    /// With no members the context is still registered; it can only finish
    /// through its timeout.
    pub fn send_operation_with_timeout(
        &mut self,
        submission: &Submission,
        request: NodeRequest,
        handler: Box<dyn ResponseHandler>,
        timeout: Duration,
    ) -> anyhow::Result<LogId> {
        let log_id = self
            .oplog
            .log(&request)
            .with_context(|| format!("log request for {}", submission.operation_id))?;
        let involved = self.members.clone();
        let now = Instant::now();
        let context = RequestContext {
            log_id,
            submission: submission.clone(),
            involved_members: involved.clone(),
            responses: BTreeMap::new(),
            created_at: now,
            deadline: now + timeout.min(MAX_REQUEST_TIMEOUT),
        };

        let replied = self.completed_index.contains(&submission.operation_id);
        self.operations
            .entry(submission.operation_id.clone())
            .or_insert_with(|| Operation {
                requester: submission.requester.clone(),
                live_contexts: 0,
                replied,
            })
            .live_contexts += 1;
        self.contexts.insert(log_id, Slot { context, handler });

        if involved.is_empty() {
            tracing::warn!(
                log_id = %log_id,
                operation = %submission.operation_id,
                "no members joined; request can only time out"
            );
        } else {
            self.network
                .send_request(&involved, &self.config.database, &log_id, &request);
        }
        tracing::debug!(
            log_id = %log_id,
            operation = %submission.operation_id,
            members = involved.len(),
            "request sent"
        );
        Ok(log_id)
    }

    /// Deliver the final response of an operation. Only the first reply per
    /// operation is sent.
    pub fn reply(&mut self, submission: &Submission, response: SubmitResponse) {
        let operation_id = &submission.operation_id;
        let already_replied = match self.operations.get_mut(operation_id) {
            Some(operation) => std::mem::replace(&mut operation.replied, true),
            None => self.completed_index.contains(operation_id),
        };
        if already_replied {
            self.drop_duplicate_reply(operation_id);
            return;
        }
        self.network.reply(
            &submission.requester,
            &self.config.database,
            operation_id,
            &response,
        );
        self.counters.replies += 1;
        if self.operations.contains_key(operation_id) {
            self.finish_if_idle(operation_id);
        } else {
            self.remember_completed(operation_id.clone());
        }
    }

    fn drop_duplicate_reply(&mut self, operation_id: &SessionOperationId) {
        self.counters.duplicate_replies += 1;
        tracing::warn!(operation = %operation_id, "dropping second reply");
    }

    /// Apply a mailbox command; false stops the task.
    fn handle(&mut self, command: Command) -> bool {
        match command {
            Command::Join(member) => {
                tracing::info!(member = %member, "member joined");
                self.members.insert(member);
            }
            Command::Leave(member) => {
                tracing::info!(member = %member, "member left");
                self.members.remove(&member);
            }
            Command::Submit { submission, begin } => self.begin(submission, begin),
            Command::Receive {
                member,
                log_id,
                response,
            } => self.receive(member, log_id, response),
            Command::CatchUp { member, last } => {
                if let Err(err) = self.catch_up(&member, last) {
                    tracing::error!(member = %member, error = ?err, "catch-up failed");
                }
            }
            Command::Stats(done) => {
                let _ = done.send(self.stats());
            }
            Command::Close(done) => {
                let abandoned = self.close();
                let _ = done.send(abandoned);
                return false;
            }
        }
        true
    }

    fn begin(&mut self, submission: Submission, begin: BeginFn) {
        let operation_id = submission.operation_id.clone();
        if self.operations.contains_key(&operation_id)
            || self.completed_index.contains(&operation_id)
        {
            self.counters.duplicate_submissions += 1;
            tracing::debug!(operation = %operation_id, "dropping duplicate submission");
            return;
        }
        self.operations.insert(
            operation_id.clone(),
            Operation {
                requester: submission.requester.clone(),
                live_contexts: 0,
                replied: false,
            },
        );
        match begin(self, &submission) {
            Ok(()) => self.finish_if_idle(&operation_id),
            Err(err) => self.fail_operation(&submission, err),
        }
    }

    fn receive(&mut self, member: NodeIdentity, log_id: LogId, response: NodeResponse) {
        let Some(mut slot) = self.contexts.remove(&log_id) else {
            self.counters.stale_responses += 1;
            tracing::debug!(log_id = %log_id, member = %member, "dropping stale response");
            return;
        };
        if !slot.context.involved_members.contains(&member) {
            self.counters.stale_responses += 1;
            tracing::debug!(
                log_id = %log_id,
                member = %member,
                "dropping response from member outside the round"
            );
            self.contexts.insert(log_id, slot);
            return;
        }
        slot.context
            .responses
            .insert(member.clone(), response.clone());
        let result = slot
            .handler
            .receive(self, &slot.context, &member, &response);
        self.settle(slot, result);
    }

    fn catch_up(&mut self, member: &NodeIdentity, last: Option<LogId>) -> anyhow::Result<()> {
        let entries = match last {
            Some(last) => self.oplog.search_from(last)?,
            None => Some(self.oplog.iterate(0, u64::MAX)?),
        };
        match entries {
            Some(entries) if !entries.is_empty() => {
                tracing::info!(
                    member = %member,
                    entries = entries.len(),
                    "sending operation log catch-up"
                );
                self.network
                    .catch_up(member, &self.config.database, &entries);
            }
            Some(_) => {}
            None => tracing::warn!(
                member = %member,
                last = ?last,
                "member log cannot be caught up; full resync required"
            ),
        }
        Ok(())
    }

    fn sweep(&mut self) {
        let now = Instant::now();
        let expired: Vec<LogId> = self
            .contexts
            .iter()
            .filter(|(_, slot)| slot.context.deadline <= now)
            .map(|(log_id, _)| *log_id)
            .collect();
        for log_id in expired {
            // An earlier failure in this sweep may already have removed it.
            let Some(mut slot) = self.contexts.remove(&log_id) else {
                continue;
            };
            self.counters.timeouts += 1;
            tracing::warn!(
                log_id = %log_id,
                operation = %slot.context.submission.operation_id,
                pending = slot.context.pending_members().len(),
                "request timed out"
            );
            let result = slot.handler.timeout(self, &slot.context);
            self.settle(slot, result);
        }
    }

    /// Put a context back or retire it depending on its handler's result.
    fn settle(&mut self, slot: Slot, result: anyhow::Result<bool>) {
        let submission = slot.context.submission.clone();
        match result {
            Ok(false) => {
                self.contexts.insert(slot.context.log_id, slot);
            }
            Ok(true) => {
                self.release_context(&submission.operation_id);
                self.finish_if_idle(&submission.operation_id);
            }
            Err(err) => {
                self.release_context(&submission.operation_id);
                self.fail_operation(&submission, err);
            }
        }
    }

    fn release_context(&mut self, operation_id: &SessionOperationId) {
        if let Some(operation) = self.operations.get_mut(operation_id) {
            operation.live_contexts = operation.live_contexts.saturating_sub(1);
        }
    }

    /// Drop the remaining contexts of a failed operation and reply with the
    /// error unless a reply already went out.
    fn fail_operation(&mut self, submission: &Submission, err: anyhow::Error) {
        let operation_id = &submission.operation_id;
        self.counters.failed_operations += 1;
        tracing::error!(operation = %operation_id, error = ?err, "operation failed");

        let abandoned: Vec<LogId> = self
            .contexts
            .iter()
            .filter(|(_, slot)| slot.context.submission.operation_id == *operation_id)
            .map(|(log_id, _)| *log_id)
            .collect();
        for log_id in &abandoned {
            self.contexts.remove(log_id);
        }
        let replied = match self.operations.get_mut(operation_id) {
            Some(operation) => {
                operation.live_contexts = operation.live_contexts.saturating_sub(abandoned.len());
                operation.replied
            }
            None => self.completed_index.contains(operation_id),
        };
        if replied {
            self.finish_if_idle(operation_id);
        } else {
            self.reply(submission, SubmitResponse::Error(format!("{err:#}")));
        }
    }

    /// Retire an operation with no live contexts, replying with an error if
    /// it never replied.
    fn finish_if_idle(&mut self, operation_id: &SessionOperationId) {
        let Some(operation) = self.operations.get(operation_id) else {
            return;
        };
        if operation.live_contexts > 0 {
            return;
        }
        let replied = operation.replied;
        let requester = operation.requester.clone();
        self.operations.remove(operation_id);
        self.remember_completed(operation_id.clone());
        if !replied {
            tracing::error!(operation = %operation_id, "operation finished without a reply");
            self.network.reply(
                &requester,
                &self.config.database,
                operation_id,
                &SubmitResponse::Error("operation finished without a reply".to_string()),
            );
            self.counters.replies += 1;
        }
    }

    fn remember_completed(&mut self, operation_id: SessionOperationId) {
        if !self.completed_index.insert(operation_id.clone()) {
            return;
        }
        self.completed.push_back(operation_id);
        while self.completed.len() > self.config.completed_operations_retained {
            if let Some(oldest) = self.completed.pop_front() {
                self.completed_index.remove(&oldest);
            }
        }
    }

    fn stats(&self) -> CoordinatorStats {
        CoordinatorStats {
            members: self.members.len(),
            contexts: self.contexts.len(),
            operations: self.operations.len(),
            replies: self.counters.replies,
            timeouts: self.counters.timeouts,
            stale_responses: self.counters.stale_responses,
            duplicate_submissions: self.counters.duplicate_submissions,
            duplicate_replies: self.counters.duplicate_replies,
            failed_operations: self.counters.failed_operations,
        }
    }

    fn close(&mut self) -> usize {
        let abandoned = self.contexts.len();
        if abandoned > 0 {
            tracing::warn!(
                abandoned,
                operations = self.operations.len(),
                "closing coordinator with pending requests"
            );
        }
        self.contexts.clear();
        self.operations.clear();
        abandoned
    }
}
