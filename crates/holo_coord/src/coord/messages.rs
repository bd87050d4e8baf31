//! Coordinator messages and their binary encoding.
//!
//! Every message category is a closed enum. Each variant has a fixed wire tag,
//! and decoding matches tags exhaustively, so an unknown tag is an error rather
//! than a silently ignored message. Integers are big-endian, byte strings and
//! strings are u32-length-prefixed.

use serde::{Deserialize, Serialize};

use super::types::{LogId, NodeIdentity, SessionOperationId};
use crate::codec::{
    put_bool, put_bytes, put_str, put_u32, put_u64, put_u8, read_bool_at, read_bytes_at,
    read_string_at, read_u32_at, read_u64_at, read_u8_at,
};
use crate::oplog::OpLogEntry;
use crate::sequence::{
    TransactionId, TransactionOrigin, TransactionSequenceStatus, ValidationResult,
};

/// Client-visible operation submitted to the coordinator.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubmitRequest {
    /// Two-phase transaction carrying opaque changes.
    Transaction { changes: Vec<u8> },
    /// Single-round command every member executes (schema changes and such).
    Command { command: Vec<u8> },
    /// Collect every member's sequence status.
    CheckSequences,
}

impl SubmitRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            SubmitRequest::Transaction { .. } => "transaction",
            SubmitRequest::Command { .. } => "command",
            SubmitRequest::CheckSequences => "check_sequences",
        }
    }
}

/// Unit of work sent to members for one round.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeRequest {
    Prepare {
        operation_id: SessionOperationId,
        transaction_id: TransactionId,
        changes: Vec<u8>,
    },
    Decide {
        operation_id: SessionOperationId,
        transaction_id: TransactionId,
        commit: bool,
    },
    Command {
        operation_id: SessionOperationId,
        command: Vec<u8>,
    },
    SequenceStatus {
        operation_id: SessionOperationId,
    },
}

impl NodeRequest {
    pub fn operation_id(&self) -> &SessionOperationId {
        match self {
            NodeRequest::Prepare { operation_id, .. }
            | NodeRequest::Decide { operation_id, .. }
            | NodeRequest::Command { operation_id, .. }
            | NodeRequest::SequenceStatus { operation_id } => operation_id,
        }
    }
}

/// Member answer to a `Prepare`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum PrepareOutcome {
    Prepared,
    Rejected(ValidationResult),
    Failed(String),
}

/// Member answer to one round.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeResponse {
    Prepared(PrepareOutcome),
    /// `applied` reports whether the local commit/rollback step ran; `missing`
    /// lists transactions this member now knows it has not seen.
    Decided {
        applied: bool,
        missing: Vec<TransactionId>,
    },
    Command {
        error: Option<String>,
    },
    SequenceStatus(TransactionSequenceStatus),
    /// The member's log rejected the entry; the request was not executed.
    OutOfSync {
        last: Option<LogId>,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionOutcome {
    pub transaction_id: TransactionId,
    pub committed: bool,
    pub acknowledged: Vec<NodeIdentity>,
    pub unacknowledged: Vec<NodeIdentity>,
    pub missing: Vec<TransactionId>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub succeeded: Vec<NodeIdentity>,
    pub failed: Vec<(NodeIdentity, String)>,
    pub unresponsive: Vec<NodeIdentity>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SequenceReport {
    pub statuses: Vec<(NodeIdentity, TransactionSequenceStatus)>,
    /// Transactions the coordinator node is missing relative to the members.
    pub coordinator_missing: Vec<TransactionId>,
}

/// Final outcome delivered to the submitter, exactly once per operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubmitResponse {
    Transaction(TransactionOutcome),
    Command(CommandOutcome),
    SequenceReport(SequenceReport),
    Error(String),
}

/// Frame carried by a transport between two nodes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Envelope {
    Submit {
        database: String,
        from: NodeIdentity,
        operation_id: SessionOperationId,
        request: SubmitRequest,
    },
    Request {
        database: String,
        from: NodeIdentity,
        log_id: LogId,
        request: NodeRequest,
    },
    Response {
        database: String,
        from: NodeIdentity,
        log_id: LogId,
        response: NodeResponse,
    },
    Reply {
        database: String,
        operation_id: SessionOperationId,
        response: SubmitResponse,
    },
    /// Log entries resent by the leader to a follower that fell behind.
    CatchUp {
        database: String,
        from: NodeIdentity,
        entries: Vec<OpLogEntry>,
    },
}

impl Envelope {
    pub fn database(&self) -> &str {
        match self {
            Envelope::Submit { database, .. }
            | Envelope::Request { database, .. }
            | Envelope::Response { database, .. }
            | Envelope::Reply { database, .. }
            | Envelope::CatchUp { database, .. } => database,
        }
    }
}

const SUBMIT_TRANSACTION: u8 = 1;
const SUBMIT_COMMAND: u8 = 2;
const SUBMIT_CHECK_SEQUENCES: u8 = 3;

const REQUEST_PREPARE: u8 = 1;
const REQUEST_DECIDE: u8 = 2;
const REQUEST_COMMAND: u8 = 3;
const REQUEST_SEQUENCE_STATUS: u8 = 4;

const PREPARE_OK: u8 = 1;
const PREPARE_REJECTED: u8 = 2;
const PREPARE_FAILED: u8 = 3;

const VALIDATION_VALID: u8 = 1;
const VALIDATION_MISSING_PREVIOUS: u8 = 2;
const VALIDATION_ALREADY_PRESENT: u8 = 3;
const VALIDATION_ALREADY_PROMISED: u8 = 4;

const RESPONSE_PREPARED: u8 = 1;
const RESPONSE_DECIDED: u8 = 2;
const RESPONSE_COMMAND: u8 = 3;
const RESPONSE_SEQUENCE_STATUS: u8 = 4;
const RESPONSE_OUT_OF_SYNC: u8 = 5;

const REPLY_TRANSACTION: u8 = 1;
const REPLY_COMMAND: u8 = 2;
const REPLY_SEQUENCE_REPORT: u8 = 3;
const REPLY_ERROR: u8 = 4;

const ENVELOPE_SUBMIT: u8 = 1;
const ENVELOPE_REQUEST: u8 = 2;
const ENVELOPE_RESPONSE: u8 = 3;
const ENVELOPE_REPLY: u8 = 4;
const ENVELOPE_CATCH_UP: u8 = 5;

/// Encode a transport frame.
pub fn encode_envelope(envelope: &Envelope) -> Vec<u8> {
    let mut buf = Vec::new();
    match envelope {
        Envelope::Submit {
            database,
            from,
            operation_id,
            request,
        } => {
            put_u8(&mut buf, ENVELOPE_SUBMIT);
            put_str(&mut buf, database);
            put_node(&mut buf, from);
            put_operation_id(&mut buf, operation_id);
            put_submit_request(&mut buf, request);
        }
        Envelope::Request {
            database,
            from,
            log_id,
            request,
        } => {
            put_u8(&mut buf, ENVELOPE_REQUEST);
            put_str(&mut buf, database);
            put_node(&mut buf, from);
            put_log_id(&mut buf, log_id);
            put_node_request(&mut buf, request);
        }
        Envelope::Response {
            database,
            from,
            log_id,
            response,
        } => {
            put_u8(&mut buf, ENVELOPE_RESPONSE);
            put_str(&mut buf, database);
            put_node(&mut buf, from);
            put_log_id(&mut buf, log_id);
            put_node_response(&mut buf, response);
        }
        Envelope::Reply {
            database,
            operation_id,
            response,
        } => {
            put_u8(&mut buf, ENVELOPE_REPLY);
            put_str(&mut buf, database);
            put_operation_id(&mut buf, operation_id);
            put_submit_response(&mut buf, response);
        }
        Envelope::CatchUp {
            database,
            from,
            entries,
        } => {
            put_u8(&mut buf, ENVELOPE_CATCH_UP);
            put_str(&mut buf, database);
            put_node(&mut buf, from);
            put_u32(&mut buf, entries.len() as u32);
            for entry in entries {
                put_log_id(&mut buf, &entry.log_id);
                put_node_request(&mut buf, &entry.request);
            }
        }
    }
    buf
}

/// Decode a transport frame; trailing bytes are an error.
pub fn decode_envelope(data: &[u8]) -> anyhow::Result<Envelope> {
    let mut offset = 0;
    let envelope = match read_u8_at(data, &mut offset)? {
        ENVELOPE_SUBMIT => Envelope::Submit {
            database: read_string_at(data, &mut offset)?,
            from: read_node(data, &mut offset)?,
            operation_id: read_operation_id(data, &mut offset)?,
            request: read_submit_request(data, &mut offset)?,
        },
        ENVELOPE_REQUEST => Envelope::Request {
            database: read_string_at(data, &mut offset)?,
            from: read_node(data, &mut offset)?,
            log_id: read_log_id(data, &mut offset)?,
            request: read_node_request(data, &mut offset)?,
        },
        ENVELOPE_RESPONSE => Envelope::Response {
            database: read_string_at(data, &mut offset)?,
            from: read_node(data, &mut offset)?,
            log_id: read_log_id(data, &mut offset)?,
            response: read_node_response(data, &mut offset)?,
        },
        ENVELOPE_REPLY => Envelope::Reply {
            database: read_string_at(data, &mut offset)?,
            operation_id: read_operation_id(data, &mut offset)?,
            response: read_submit_response(data, &mut offset)?,
        },
        ENVELOPE_CATCH_UP => {
            let database = read_string_at(data, &mut offset)?;
            let from = read_node(data, &mut offset)?;
            let count = read_u32_at(data, &mut offset)? as usize;
            let mut entries = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                entries.push(OpLogEntry {
                    log_id: read_log_id(data, &mut offset)?,
                    request: read_node_request(data, &mut offset)?,
                });
            }
            Envelope::CatchUp {
                database,
                from,
                entries,
            }
        }
        other => anyhow::bail!("unknown envelope tag {other}"),
    };
    anyhow::ensure!(offset == data.len(), "trailing bytes after envelope");
    Ok(envelope)
}

/// Encode a node request on its own (operation log payloads).
pub fn encode_node_request(request: &NodeRequest) -> Vec<u8> {
    let mut buf = Vec::new();
    put_node_request(&mut buf, request);
    buf
}

pub fn decode_node_request(data: &[u8]) -> anyhow::Result<NodeRequest> {
    let mut offset = 0;
    let request = read_node_request(data, &mut offset)?;
    anyhow::ensure!(offset == data.len(), "trailing bytes after node request");
    Ok(request)
}

fn put_node(buf: &mut Vec<u8>, node: &NodeIdentity) {
    put_str(buf, &node.name);
    put_u64(buf, node.id);
}

fn read_node(data: &[u8], offset: &mut usize) -> anyhow::Result<NodeIdentity> {
    Ok(NodeIdentity {
        name: read_string_at(data, offset)?,
        id: read_u64_at(data, offset)?,
    })
}

fn put_nodes(buf: &mut Vec<u8>, nodes: &[NodeIdentity]) {
    put_u32(buf, nodes.len() as u32);
    for node in nodes {
        put_node(buf, node);
    }
}

fn read_nodes(data: &[u8], offset: &mut usize) -> anyhow::Result<Vec<NodeIdentity>> {
    let count = read_u32_at(data, offset)? as usize;
    let mut nodes = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        nodes.push(read_node(data, offset)?);
    }
    Ok(nodes)
}

fn put_operation_id(buf: &mut Vec<u8>, id: &SessionOperationId) {
    put_str(buf, &id.node);
    put_u64(buf, id.counter);
}

fn read_operation_id(data: &[u8], offset: &mut usize) -> anyhow::Result<SessionOperationId> {
    Ok(SessionOperationId {
        node: read_string_at(data, offset)?,
        counter: read_u64_at(data, offset)?,
    })
}

pub(crate) fn put_log_id(buf: &mut Vec<u8>, id: &LogId) {
    put_u64(buf, id.sequence);
    put_u64(buf, id.term);
    put_bool(buf, id.prev_term.is_some());
    put_u64(buf, id.prev_term.unwrap_or_default());
}

pub(crate) fn read_log_id(data: &[u8], offset: &mut usize) -> anyhow::Result<LogId> {
    let sequence = read_u64_at(data, offset)?;
    let term = read_u64_at(data, offset)?;
    let has_prev = read_bool_at(data, offset)?;
    let prev = read_u64_at(data, offset)?;
    Ok(LogId::new(sequence, term, has_prev.then_some(prev)))
}

fn put_optional_log_id(buf: &mut Vec<u8>, id: &Option<LogId>) {
    put_bool(buf, id.is_some());
    if let Some(id) = id {
        put_log_id(buf, id);
    }
}

fn read_optional_log_id(data: &[u8], offset: &mut usize) -> anyhow::Result<Option<LogId>> {
    if read_bool_at(data, offset)? {
        Ok(Some(read_log_id(data, offset)?))
    } else {
        Ok(None)
    }
}

fn put_optional_str(buf: &mut Vec<u8>, value: &Option<String>) {
    put_bool(buf, value.is_some());
    if let Some(value) = value {
        put_str(buf, value);
    }
}

fn read_optional_string(data: &[u8], offset: &mut usize) -> anyhow::Result<Option<String>> {
    if read_bool_at(data, offset)? {
        Ok(Some(read_string_at(data, offset)?))
    } else {
        Ok(None)
    }
}

fn put_transaction_id(buf: &mut Vec<u8>, id: &TransactionId) {
    put_bool(buf, id.origin.is_some());
    if let Some(origin) = &id.origin {
        put_str(buf, &origin.node);
        put_u64(buf, origin.generation);
    }
    put_u32(buf, id.position);
    put_u64(buf, id.sequence);
}

fn read_transaction_id(data: &[u8], offset: &mut usize) -> anyhow::Result<TransactionId> {
    let origin = if read_bool_at(data, offset)? {
        Some(TransactionOrigin {
            node: read_string_at(data, offset)?,
            generation: read_u64_at(data, offset)?,
        })
    } else {
        None
    };
    Ok(TransactionId {
        origin,
        position: read_u32_at(data, offset)?,
        sequence: read_u64_at(data, offset)?,
    })
}

fn put_transaction_ids(buf: &mut Vec<u8>, ids: &[TransactionId]) {
    put_u32(buf, ids.len() as u32);
    for id in ids {
        put_transaction_id(buf, id);
    }
}

fn read_transaction_ids(data: &[u8], offset: &mut usize) -> anyhow::Result<Vec<TransactionId>> {
    let count = read_u32_at(data, offset)? as usize;
    let mut ids = Vec::with_capacity(count.min(1024));
    for _ in 0..count {
        ids.push(read_transaction_id(data, offset)?);
    }
    Ok(ids)
}

fn put_status(buf: &mut Vec<u8>, status: &TransactionSequenceStatus) {
    put_u32(buf, status.sequences.len() as u32);
    for sequence in &status.sequences {
        put_u64(buf, *sequence);
    }
}

fn read_status(data: &[u8], offset: &mut usize) -> anyhow::Result<TransactionSequenceStatus> {
    let count = read_u32_at(data, offset)? as usize;
    anyhow::ensure!(
        *offset + count * 8 <= data.len(),
        "sequence status short slots"
    );
    let mut sequences = Vec::with_capacity(count);
    for _ in 0..count {
        sequences.push(read_u64_at(data, offset)?);
    }
    Ok(TransactionSequenceStatus::new(sequences))
}

fn validation_tag(result: ValidationResult) -> u8 {
    match result {
        ValidationResult::Valid => VALIDATION_VALID,
        ValidationResult::MissingPrevious => VALIDATION_MISSING_PREVIOUS,
        ValidationResult::AlreadyPresent => VALIDATION_ALREADY_PRESENT,
        ValidationResult::AlreadyPromised => VALIDATION_ALREADY_PROMISED,
    }
}

fn read_validation(data: &[u8], offset: &mut usize) -> anyhow::Result<ValidationResult> {
    match read_u8_at(data, offset)? {
        VALIDATION_VALID => Ok(ValidationResult::Valid),
        VALIDATION_MISSING_PREVIOUS => Ok(ValidationResult::MissingPrevious),
        VALIDATION_ALREADY_PRESENT => Ok(ValidationResult::AlreadyPresent),
        VALIDATION_ALREADY_PROMISED => Ok(ValidationResult::AlreadyPromised),
        other => anyhow::bail!("unknown validation tag {other}"),
    }
}

fn put_submit_request(buf: &mut Vec<u8>, request: &SubmitRequest) {
    match request {
        SubmitRequest::Transaction { changes } => {
            put_u8(buf, SUBMIT_TRANSACTION);
            put_bytes(buf, changes);
        }
        SubmitRequest::Command { command } => {
            put_u8(buf, SUBMIT_COMMAND);
            put_bytes(buf, command);
        }
        SubmitRequest::CheckSequences => put_u8(buf, SUBMIT_CHECK_SEQUENCES),
    }
}

fn read_submit_request(data: &[u8], offset: &mut usize) -> anyhow::Result<SubmitRequest> {
    match read_u8_at(data, offset)? {
        SUBMIT_TRANSACTION => Ok(SubmitRequest::Transaction {
            changes: read_bytes_at(data, offset)?,
        }),
        SUBMIT_COMMAND => Ok(SubmitRequest::Command {
            command: read_bytes_at(data, offset)?,
        }),
        SUBMIT_CHECK_SEQUENCES => Ok(SubmitRequest::CheckSequences),
        other => anyhow::bail!("unknown submit request tag {other}"),
    }
}

fn put_node_request(buf: &mut Vec<u8>, request: &NodeRequest) {
    match request {
        NodeRequest::Prepare {
            operation_id,
            transaction_id,
            changes,
        } => {
            put_u8(buf, REQUEST_PREPARE);
            put_operation_id(buf, operation_id);
            put_transaction_id(buf, transaction_id);
            put_bytes(buf, changes);
        }
        NodeRequest::Decide {
            operation_id,
            transaction_id,
            commit,
        } => {
            put_u8(buf, REQUEST_DECIDE);
            put_operation_id(buf, operation_id);
            put_transaction_id(buf, transaction_id);
            put_bool(buf, *commit);
        }
        NodeRequest::Command {
            operation_id,
            command,
        } => {
            put_u8(buf, REQUEST_COMMAND);
            put_operation_id(buf, operation_id);
            put_bytes(buf, command);
        }
        NodeRequest::SequenceStatus { operation_id } => {
            put_u8(buf, REQUEST_SEQUENCE_STATUS);
            put_operation_id(buf, operation_id);
        }
    }
}

fn read_node_request(data: &[u8], offset: &mut usize) -> anyhow::Result<NodeRequest> {
    match read_u8_at(data, offset)? {
        REQUEST_PREPARE => Ok(NodeRequest::Prepare {
            operation_id: read_operation_id(data, offset)?,
            transaction_id: read_transaction_id(data, offset)?,
            changes: read_bytes_at(data, offset)?,
        }),
        REQUEST_DECIDE => Ok(NodeRequest::Decide {
            operation_id: read_operation_id(data, offset)?,
            transaction_id: read_transaction_id(data, offset)?,
            commit: read_bool_at(data, offset)?,
        }),
        REQUEST_COMMAND => Ok(NodeRequest::Command {
            operation_id: read_operation_id(data, offset)?,
            command: read_bytes_at(data, offset)?,
        }),
        REQUEST_SEQUENCE_STATUS => Ok(NodeRequest::SequenceStatus {
            operation_id: read_operation_id(data, offset)?,
        }),
        other => anyhow::bail!("unknown node request tag {other}"),
    }
}

fn put_node_response(buf: &mut Vec<u8>, response: &NodeResponse) {
    match response {
        NodeResponse::Prepared(outcome) => {
            put_u8(buf, RESPONSE_PREPARED);
            match outcome {
                PrepareOutcome::Prepared => put_u8(buf, PREPARE_OK),
                PrepareOutcome::Rejected(result) => {
                    put_u8(buf, PREPARE_REJECTED);
                    put_u8(buf, validation_tag(*result));
                }
                PrepareOutcome::Failed(message) => {
                    put_u8(buf, PREPARE_FAILED);
                    put_str(buf, message);
                }
            }
        }
        NodeResponse::Decided { applied, missing } => {
            put_u8(buf, RESPONSE_DECIDED);
            put_bool(buf, *applied);
            put_transaction_ids(buf, missing);
        }
        NodeResponse::Command { error } => {
            put_u8(buf, RESPONSE_COMMAND);
            put_optional_str(buf, error);
        }
        NodeResponse::SequenceStatus(status) => {
            put_u8(buf, RESPONSE_SEQUENCE_STATUS);
            put_status(buf, status);
        }
        NodeResponse::OutOfSync { last } => {
            put_u8(buf, RESPONSE_OUT_OF_SYNC);
            put_optional_log_id(buf, last);
        }
    }
}

fn read_node_response(data: &[u8], offset: &mut usize) -> anyhow::Result<NodeResponse> {
    match read_u8_at(data, offset)? {
        RESPONSE_PREPARED => {
            let outcome = match read_u8_at(data, offset)? {
                PREPARE_OK => PrepareOutcome::Prepared,
                PREPARE_REJECTED => PrepareOutcome::Rejected(read_validation(data, offset)?),
                PREPARE_FAILED => PrepareOutcome::Failed(read_string_at(data, offset)?),
                other => anyhow::bail!("unknown prepare outcome tag {other}"),
            };
            Ok(NodeResponse::Prepared(outcome))
        }
        RESPONSE_DECIDED => Ok(NodeResponse::Decided {
            applied: read_bool_at(data, offset)?,
            missing: read_transaction_ids(data, offset)?,
        }),
        RESPONSE_COMMAND => Ok(NodeResponse::Command {
            error: read_optional_string(data, offset)?,
        }),
        RESPONSE_SEQUENCE_STATUS => Ok(NodeResponse::SequenceStatus(read_status(data, offset)?)),
        RESPONSE_OUT_OF_SYNC => Ok(NodeResponse::OutOfSync {
            last: read_optional_log_id(data, offset)?,
        }),
        other => anyhow::bail!("unknown node response tag {other}"),
    }
}

fn put_submit_response(buf: &mut Vec<u8>, response: &SubmitResponse) {
    match response {
        SubmitResponse::Transaction(outcome) => {
            put_u8(buf, REPLY_TRANSACTION);
            put_transaction_id(buf, &outcome.transaction_id);
            put_bool(buf, outcome.committed);
            put_nodes(buf, &outcome.acknowledged);
            put_nodes(buf, &outcome.unacknowledged);
            put_transaction_ids(buf, &outcome.missing);
        }
        SubmitResponse::Command(outcome) => {
            put_u8(buf, REPLY_COMMAND);
            put_nodes(buf, &outcome.succeeded);
            put_u32(buf, outcome.failed.len() as u32);
            for (node, message) in &outcome.failed {
                put_node(buf, node);
                put_str(buf, message);
            }
            put_nodes(buf, &outcome.unresponsive);
        }
        SubmitResponse::SequenceReport(report) => {
            put_u8(buf, REPLY_SEQUENCE_REPORT);
            put_u32(buf, report.statuses.len() as u32);
            for (node, status) in &report.statuses {
                put_node(buf, node);
                put_status(buf, status);
            }
            put_transaction_ids(buf, &report.coordinator_missing);
        }
        SubmitResponse::Error(message) => {
            put_u8(buf, REPLY_ERROR);
            put_str(buf, message);
        }
    }
}

fn read_submit_response(data: &[u8], offset: &mut usize) -> anyhow::Result<SubmitResponse> {
    match read_u8_at(data, offset)? {
        REPLY_TRANSACTION => Ok(SubmitResponse::Transaction(TransactionOutcome {
            transaction_id: read_transaction_id(data, offset)?,
            committed: read_bool_at(data, offset)?,
            acknowledged: read_nodes(data, offset)?,
            unacknowledged: read_nodes(data, offset)?,
            missing: read_transaction_ids(data, offset)?,
        })),
        REPLY_COMMAND => {
            let succeeded = read_nodes(data, offset)?;
            let count = read_u32_at(data, offset)? as usize;
            let mut failed = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                failed.push((read_node(data, offset)?, read_string_at(data, offset)?));
            }
            let unresponsive = read_nodes(data, offset)?;
            Ok(SubmitResponse::Command(CommandOutcome {
                succeeded,
                failed,
                unresponsive,
            }))
        }
        REPLY_SEQUENCE_REPORT => {
            let count = read_u32_at(data, offset)? as usize;
            let mut statuses = Vec::with_capacity(count.min(1024));
            for _ in 0..count {
                statuses.push((read_node(data, offset)?, read_status(data, offset)?));
            }
            Ok(SubmitResponse::SequenceReport(SequenceReport {
                statuses,
                coordinator_missing: read_transaction_ids(data, offset)?,
            }))
        }
        REPLY_ERROR => Ok(SubmitResponse::Error(read_string_at(data, offset)?)),
        other => anyhow::bail!("unknown submit response tag {other}"),
    }
}
