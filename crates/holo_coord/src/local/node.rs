//! One node of a local cluster.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time;

use super::hub::{Inbox, LocalEndpoint, LocalHub};
use crate::coord::{
    decode_envelope, Coordinator, CoordinatorConfig, Envelope, MemberWorker, Network,
    NodeApply, NodeIdentity, NodeResponse, SessionOperationId, SubmitRequest, SubmitResponse,
};
use crate::oplog::{OpLogEntry, OperationLog};
use crate::sequence::{SharedSequenceManager, TransactionId, TransactionSequenceStatus};

type PendingReplies = Arc<Mutex<HashMap<SessionOperationId, oneshot::Sender<SubmitResponse>>>>;

/// Everything a local node is built from.
pub struct LocalNodeOptions {
    pub identity: NodeIdentity,
    /// Node running the coordinator; it may be this node.
    pub leader: NodeIdentity,
    pub database: String,
    /// Leader term used for this node's operation log.
    pub term: u64,
    pub oplog: Arc<dyn OperationLog>,
    pub sequence: SharedSequenceManager,
    pub apply: Arc<dyn NodeApply>,
    pub request_timeout: Duration,
    pub sweep_interval: Duration,
}

/// A running node: member executor, optional coordinator, and the task
/// dispatching its inbox.
pub struct LocalNode {
    identity: NodeIdentity,
    leader: NodeIdentity,
    database: String,
    endpoint: LocalEndpoint,
    hub: LocalHub,
    coordinator: Option<Coordinator>,
    member: Arc<Mutex<MemberWorker>>,
    oplog: Arc<dyn OperationLog>,
    pending: PendingReplies,
    next_operation: AtomicU64,
    task: JoinHandle<()>,
}

impl LocalNode {
    /// Register the node on `hub` and start its tasks on the current runtime.
    pub fn start(hub: &LocalHub, options: LocalNodeOptions) -> anyhow::Result<Self> {
        let LocalNodeOptions {
            identity,
            leader,
            database,
            term,
            oplog,
            sequence,
            apply,
            request_timeout,
            sweep_interval,
        } = options;
        let (endpoint, inbox) = hub.register(identity.clone())?;
        let is_leader = identity == leader;
        oplog
            .set_leader(is_leader, term)
            .with_context(|| format!("set log role for {identity}"))?;

        let coordinator = is_leader.then(|| {
            let mut config = CoordinatorConfig::new(database.clone(), identity.clone());
            config.request_timeout = request_timeout;
            config.sweep_interval = sweep_interval;
            Coordinator::spawn(
                config,
                oplog.clone(),
                Arc::new(endpoint.clone()),
                sequence.clone(),
            )
        });
        let member = Arc::new(Mutex::new(MemberWorker::new(
            identity.clone(),
            oplog.clone(),
            sequence,
            apply,
        )));
        let pending: PendingReplies = Arc::default();

        let dispatcher = Dispatcher {
            identity: identity.clone(),
            database: database.clone(),
            endpoint: endpoint.clone(),
            coordinator: coordinator.clone(),
            member: member.clone(),
            oplog: oplog.clone(),
            pending: pending.clone(),
        };
        let task = tokio::spawn(dispatcher.run(inbox));

        Ok(Self {
            identity,
            leader,
            database,
            endpoint,
            hub: hub.clone(),
            coordinator,
            member,
            oplog,
            pending,
            next_operation: AtomicU64::new(0),
            task,
        })
    }

    pub fn identity(&self) -> &NodeIdentity {
        &self.identity
    }

    pub fn is_leader(&self) -> bool {
        self.identity == self.leader
    }

    pub fn coordinator(&self) -> Option<&Coordinator> {
        self.coordinator.as_ref()
    }

    pub fn oplog(&self) -> &Arc<dyn OperationLog> {
        &self.oplog
    }

    pub fn sequence_status(&self) -> anyhow::Result<TransactionSequenceStatus> {
        self.member
            .lock()
            .map_err(|_| anyhow::anyhow!("member lock poisoned"))?
            .status()
    }

    /// Transactions this node knows were committed but never saw.
    pub fn missing(&self) -> anyhow::Result<Vec<TransactionId>> {
        let member = self
            .member
            .lock()
            .map_err(|_| anyhow::anyhow!("member lock poisoned"))?;
        Ok(member.missing().iter().cloned().collect())
    }

    /// Submit an operation to the leader and wait for its reply.
    pub async fn submit(
        &self,
        request: SubmitRequest,
        timeout: Duration,
    ) -> anyhow::Result<SubmitResponse> {
        let counter = self.next_operation.fetch_add(1, Ordering::Relaxed) + 1;
        let operation_id = SessionOperationId::new(self.identity.name.clone(), counter);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .map_err(|_| anyhow::anyhow!("pending replies lock poisoned"))?
            .insert(operation_id.clone(), tx);

        self.endpoint
            .submit(&self.leader, &self.database, &operation_id, &request);
        match time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => anyhow::bail!("reply channel for {operation_id} closed"),
            Err(_) => {
                if let Ok(mut pending) = self.pending.lock() {
                    pending.remove(&operation_id);
                }
                anyhow::bail!("operation {operation_id} timed out")
            }
        }
    }

    /// Stop the node. Returns the number of in-flight contexts the
    /// coordinator abandoned (zero on followers).
    pub async fn shutdown(self) -> anyhow::Result<usize> {
        let abandoned = match &self.coordinator {
            Some(coordinator) => coordinator.close().await?,
            None => 0,
        };
        self.hub.unregister(&self.identity);
        self.task.abort();
        Ok(abandoned)
    }
}

/// Inbox loop of one node.
struct Dispatcher {
    identity: NodeIdentity,
    database: String,
    endpoint: LocalEndpoint,
    coordinator: Option<Coordinator>,
    member: Arc<Mutex<MemberWorker>>,
    oplog: Arc<dyn OperationLog>,
    pending: PendingReplies,
}

impl Dispatcher {
    async fn run(self, mut inbox: Inbox) {
        while let Some(frame) = inbox.recv().await {
            let envelope = match decode_envelope(&frame) {
                Ok(envelope) => envelope,
                Err(err) => {
                    tracing::warn!(node = %self.identity, error = ?err, "undecodable frame");
                    continue;
                }
            };
            if envelope.database() != self.database {
                tracing::debug!(
                    node = %self.identity,
                    database = envelope.database(),
                    "frame for another database"
                );
                continue;
            }
            if let Err(err) = self.dispatch(envelope) {
                tracing::warn!(node = %self.identity, error = ?err, "frame handling failed");
            }
        }
    }

    fn dispatch(&self, envelope: Envelope) -> anyhow::Result<()> {
        match envelope {
            Envelope::Submit {
                from,
                operation_id,
                request,
                ..
            } => match &self.coordinator {
                Some(coordinator) => {
                    tracing::debug!(
                        operation = %operation_id,
                        kind = request.kind(),
                        "operation submitted"
                    );
                    coordinator.submit(from, operation_id, request)?;
                }
                None => self.endpoint.reply(
                    &from,
                    &self.database,
                    &operation_id,
                    &SubmitResponse::Error(format!("{} is not the leader", self.identity)),
                ),
            },
            Envelope::Request {
                from,
                log_id,
                request,
                ..
            } => {
                let response = self
                    .member
                    .lock()
                    .map_err(|_| anyhow::anyhow!("member lock poisoned"))?
                    .handle(&from, log_id, &request)?;
                self.endpoint
                    .send_response(&from, &self.database, &log_id, &response);
            }
            Envelope::Response {
                from,
                log_id,
                response,
                ..
            } => {
                let Some(coordinator) = &self.coordinator else {
                    tracing::debug!(node = %self.identity, "response on a follower");
                    return Ok(());
                };
                if let NodeResponse::OutOfSync { last } = &response {
                    coordinator.catch_up(from.clone(), *last)?;
                }
                coordinator.receive(from, log_id, response)?;
            }
            Envelope::Reply {
                operation_id,
                response,
                ..
            } => {
                let waiter = self
                    .pending
                    .lock()
                    .map_err(|_| anyhow::anyhow!("pending replies lock poisoned"))?
                    .remove(&operation_id);
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.send(response);
                    }
                    None => tracing::debug!(operation = %operation_id, "reply nobody waits for"),
                }
            }
            Envelope::CatchUp { from, entries, .. } => self.apply_catch_up(&from, entries)?,
        }
        Ok(())
    }

    /// Follower side: append resent entries without executing them.
    fn apply_catch_up(&self, from: &NodeIdentity, entries: Vec<OpLogEntry>) -> anyhow::Result<()> {
        let total = entries.len();
        let mut appended = 0;
        for entry in entries {
            if !self.oplog.log_received(entry.log_id, &entry.request)? {
                tracing::warn!(
                    node = %self.identity,
                    leader = %from,
                    log_id = %entry.log_id,
                    "catch-up entry rejected"
                );
                break;
            }
            appended += 1;
        }
        tracing::debug!(node = %self.identity, appended, total, "applied catch-up");
        Ok(())
    }
}
