//! Shared types for the coordinator: identities, log ids, configuration, and
//! the network contract.

use std::cmp::Ordering;
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::messages::{NodeRequest, NodeResponse, SubmitRequest, SubmitResponse};
use crate::oplog::OpLogEntry;

/// Default deadline for one request round.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Default spacing between timeout sweeps.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(1);
/// Default number of finished operation ids remembered for deduplication.
pub const DEFAULT_COMPLETED_OPERATIONS_RETAINED: usize = 4096;

/// Identity of a cluster node.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub name: String,
    pub id: u64,
}

impl NodeIdentity {
    pub fn new(name: impl Into<String>, id: u64) -> Self {
        Self {
            name: name.into(),
            id,
        }
    }
}

impl fmt::Display for NodeIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.name, self.id)
    }
}

/// Position of an entry in the operation log.
///
/// Ordered by `(term, sequence)`. `prev_term` is the term of the entry before
/// this one; followers use it to check that their log matches the leader's.
/// It does not take part in equality or ordering.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct LogId {
    pub sequence: u64,
    pub term: u64,
    pub prev_term: Option<u64>,
}

impl LogId {
    pub const fn new(sequence: u64, term: u64, prev_term: Option<u64>) -> Self {
        Self {
            sequence,
            term,
            prev_term,
        }
    }
}

impl PartialEq for LogId {
    fn eq(&self, other: &Self) -> bool {
        self.term == other.term && self.sequence == other.sequence
    }
}

impl Eq for LogId {}

impl Hash for LogId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.term.hash(state);
        self.sequence.hash(state);
    }
}

impl Ord for LogId {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.term, self.sequence).cmp(&(other.term, other.sequence))
    }
}

impl PartialOrd for LogId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for LogId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.term, self.sequence)
    }
}

/// Caller-assigned correlation id of a submitted operation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SessionOperationId {
    pub node: String,
    pub counter: u64,
}

impl SessionOperationId {
    pub fn new(node: impl Into<String>, counter: u64) -> Self {
        Self {
            node: node.into(),
            counter,
        }
    }
}

impl fmt::Display for SessionOperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.node, self.counter)
    }
}

/// Who submitted an operation and under which id; the final reply goes here.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Submission {
    pub requester: NodeIdentity,
    pub operation_id: SessionOperationId,
}

/// Coordinator configuration and timing.
#[derive(Clone, Debug)]
pub struct CoordinatorConfig {
    pub database: String,
    pub local: NodeIdentity,
    /// Deadline applied by `send_operation`.
    pub request_timeout: Duration,
    /// How often contexts are checked against their deadline.
    pub sweep_interval: Duration,
    /// Finished operation ids kept to drop resubmissions.
    pub completed_operations_retained: usize,
}

impl CoordinatorConfig {
    pub fn new(database: impl Into<String>, local: NodeIdentity) -> Self {
        Self {
            database: database.into(),
            local,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            completed_operations_retained: DEFAULT_COMPLETED_OPERATIONS_RETAINED,
        }
    }
}

/// Message transport used by the coordinator and the nodes.
///
/// Every call is fire-and-forget and delivered at most once. Lost messages
/// only show up as request timeouts; retries show up as duplicates.
pub trait Network: Send + Sync + 'static {
    fn submit(
        &self,
        to: &NodeIdentity,
        database: &str,
        operation_id: &SessionOperationId,
        request: &SubmitRequest,
    );

    fn send_request(
        &self,
        to: &BTreeSet<NodeIdentity>,
        database: &str,
        log_id: &LogId,
        request: &NodeRequest,
    );

    fn send_response(
        &self,
        to: &NodeIdentity,
        database: &str,
        log_id: &LogId,
        response: &NodeResponse,
    );

    fn reply(
        &self,
        to: &NodeIdentity,
        database: &str,
        operation_id: &SessionOperationId,
        response: &SubmitResponse,
    );

    /// Resend log entries to a member whose log fell behind. Transports
    /// without catch-up drop them.
    fn catch_up(&self, _to: &NodeIdentity, _database: &str, _entries: &[OpLogEntry]) {}
}
