//! Coordinator module wiring.
//!
//! `coordinator` owns the in-flight request contexts and runs them on a single
//! task, `handlers` implements the built-in multi-round operations, `member`
//! applies rounds on each node, `messages` defines the closed message enums
//! and their wire encoding, and `types`/`context` hold the shared contracts.

mod context;
mod coordinator;
mod handlers;
mod member;
mod messages;
mod types;

pub use context::{RequestContext, ResponseHandler};
pub use coordinator::{Coordinator, CoordinatorCore, CoordinatorStats};
pub use handlers::begin_operation;
pub use member::{MemberWorker, NodeApply, NoopApply};
pub use messages::{
    decode_envelope, decode_node_request, encode_envelope, encode_node_request, CommandOutcome,
    Envelope, NodeRequest, NodeResponse, PrepareOutcome, SequenceReport, SubmitRequest,
    SubmitResponse, TransactionOutcome,
};
pub use types::{
    CoordinatorConfig, LogId, Network, NodeIdentity, SessionOperationId, Submission,
    DEFAULT_COMPLETED_OPERATIONS_RETAINED, DEFAULT_REQUEST_TIMEOUT, DEFAULT_SWEEP_INTERVAL,
};

pub(crate) use messages::{put_log_id, read_log_id};
