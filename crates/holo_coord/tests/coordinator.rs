use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use holo_coord::coord::{
    Coordinator, CoordinatorConfig, CoordinatorCore, LogId, Network, NodeIdentity, NodeRequest,
    NodeResponse, PrepareOutcome, RequestContext, ResponseHandler, SessionOperationId,
    SubmitRequest, SubmitResponse,
};
use holo_coord::oplog::{MemoryOpLog, OpLogEntry, OperationLog};
use holo_coord::sequence::{
    shared, with_manager, SharedSequenceManager, TransactionSequenceManager, ValidationResult,
};
use tokio::sync::mpsc;

#[derive(Debug)]
struct SentRequest {
    to: BTreeSet<NodeIdentity>,
    log_id: LogId,
    request: NodeRequest,
}

#[derive(Debug)]
struct SentReply {
    to: NodeIdentity,
    operation_id: SessionOperationId,
    response: SubmitResponse,
}

/// Network that records what the coordinator sends.
struct RecordingNetwork {
    requests: mpsc::UnboundedSender<SentRequest>,
    replies: mpsc::UnboundedSender<SentReply>,
    catch_ups: mpsc::UnboundedSender<(NodeIdentity, Vec<u64>)>,
}

impl Network for RecordingNetwork {
    fn submit(&self, _: &NodeIdentity, _: &str, _: &SessionOperationId, _: &SubmitRequest) {}

    fn send_request(
        &self,
        to: &BTreeSet<NodeIdentity>,
        _database: &str,
        log_id: &LogId,
        request: &NodeRequest,
    ) {
        let _ = self.requests.send(SentRequest {
            to: to.clone(),
            log_id: *log_id,
            request: request.clone(),
        });
    }

    fn send_response(&self, _: &NodeIdentity, _: &str, _: &LogId, _: &NodeResponse) {}

    fn reply(
        &self,
        to: &NodeIdentity,
        _database: &str,
        operation_id: &SessionOperationId,
        response: &SubmitResponse,
    ) {
        let _ = self.replies.send(SentReply {
            to: to.clone(),
            operation_id: operation_id.clone(),
            response: response.clone(),
        });
    }

    fn catch_up(&self, to: &NodeIdentity, _database: &str, entries: &[OpLogEntry]) {
        let sequences = entries.iter().map(|entry| entry.log_id.sequence).collect();
        let _ = self.catch_ups.send((to.clone(), sequences));
    }
}

struct Harness {
    coordinator: Coordinator,
    sequence: SharedSequenceManager,
    requests: mpsc::UnboundedReceiver<SentRequest>,
    replies: mpsc::UnboundedReceiver<SentReply>,
    catch_ups: mpsc::UnboundedReceiver<(NodeIdentity, Vec<u64>)>,
    members: Vec<NodeIdentity>,
}

impl Harness {
    fn start(member_count: u64) -> Self {
        Self::start_with_slots(member_count, 8)
    }

    fn start_with_slots(member_count: u64, slots: usize) -> Self {
        let (requests_tx, requests) = mpsc::unbounded_channel();
        let (replies_tx, replies) = mpsc::unbounded_channel();
        let (catch_ups_tx, catch_ups) = mpsc::unbounded_channel();
        let oplog = Arc::new(MemoryOpLog::new());
        oplog.set_leader(true, 1).expect("leader");
        let sequence = shared(TransactionSequenceManager::with_generation("node1", 1, slots));
        let mut config = CoordinatorConfig::new("db", NodeIdentity::new("node1", 1));
        config.request_timeout = Duration::from_secs(5);
        config.sweep_interval = Duration::from_millis(500);
        let coordinator = Coordinator::spawn(
            config,
            oplog,
            Arc::new(RecordingNetwork {
                requests: requests_tx,
                replies: replies_tx,
                catch_ups: catch_ups_tx,
            }),
            sequence.clone(),
        );
        let members: Vec<_> = (1..=member_count)
            .map(|id| NodeIdentity::new(format!("node{id}"), id))
            .collect();
        for member in &members {
            coordinator.join(member.clone()).expect("join");
        }
        Self {
            coordinator,
            sequence,
            requests,
            replies,
            catch_ups,
            members,
        }
    }

    fn client() -> NodeIdentity {
        NodeIdentity::new("client", 99)
    }

    fn submit(&self, counter: u64, request: SubmitRequest) -> SessionOperationId {
        let operation_id = SessionOperationId::new("client", counter);
        self.coordinator
            .submit(Self::client(), operation_id.clone(), request)
            .expect("submit");
        operation_id
    }

    async fn next_request(&mut self) -> SentRequest {
        self.requests.recv().await.expect("request sent")
    }

    async fn next_reply(&mut self) -> SentReply {
        self.replies.recv().await.expect("reply sent")
    }

    fn respond(&self, member: usize, log_id: LogId, response: NodeResponse) {
        self.coordinator
            .receive(self.members[member].clone(), log_id, response)
            .expect("receive");
    }
}

/// Handler that records what it observes and replies once every member
/// answered.
struct ObservingHandler {
    observed: Arc<Mutex<Vec<(usize, usize)>>>,
}

impl ResponseHandler for ObservingHandler {
    fn receive(
        &mut self,
        core: &mut CoordinatorCore,
        context: &RequestContext,
        _member: &NodeIdentity,
        _response: &NodeResponse,
    ) -> anyhow::Result<bool> {
        self.observed
            .lock()
            .expect("observed lock")
            .push((context.responses.len(), context.involved_members.len()));
        if context.is_complete() {
            core.reply(&context.submission, SubmitResponse::Error("done".into()));
            return Ok(true);
        }
        Ok(false)
    }

    fn timeout(&mut self, _: &mut CoordinatorCore, _: &RequestContext) -> anyhow::Result<bool> {
        Ok(true)
    }
}

fn status_request(operation_id: &SessionOperationId) -> NodeRequest {
    NodeRequest::SequenceStatus {
        operation_id: operation_id.clone(),
    }
}

#[tokio::test]
async fn context_completes_when_every_member_answers() {
    let mut harness = Harness::start(3);
    let observed = Arc::new(Mutex::new(Vec::new()));
    let handler_observed = observed.clone();
    let operation_id = SessionOperationId::new("client", 1);
    harness
        .coordinator
        .submit_with(
            Harness::client(),
            operation_id.clone(),
            move |core, submission| {
                core.send_operation(
                    submission,
                    status_request(&submission.operation_id),
                    Box::new(ObservingHandler {
                        observed: handler_observed,
                    }),
                )?;
                Ok(())
            },
        )
        .expect("submit");

    let sent = harness.next_request().await;
    assert_eq!(sent.to.len(), 3);
    for member in 0..3 {
        harness.respond(member, sent.log_id, NodeResponse::Command { error: None });
    }
    let reply = harness.next_reply().await;
    assert_eq!(reply.operation_id, operation_id);
    assert_eq!(reply.to, Harness::client());
    assert_eq!(
        *observed.lock().expect("observed lock"),
        vec![(1, 3), (2, 3), (3, 3)]
    );
    let stats = harness.coordinator.stats().await.expect("stats");
    assert_eq!(stats.contexts, 0);
    assert_eq!(stats.operations, 0);

    // Late duplicates of a finished round are ignored.
    harness.respond(0, sent.log_id, NodeResponse::Command { error: None });
    let stats = harness.coordinator.stats().await.expect("stats");
    assert_eq!(stats.stale_responses, 1);
    assert_eq!(observed.lock().expect("observed lock").len(), 3);
    assert!(harness.replies.try_recv().is_err());
}

/// First round replies and chains a second round that replies again.
struct ChainingHandler;

impl ResponseHandler for ChainingHandler {
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
        core.reply(&context.submission, SubmitResponse::Error("first".into()));
        core.send_operation(
            &context.submission,
            status_request(&context.submission.operation_id),
            Box::new(ReplyAgainHandler),
        )?;
        Ok(true)
    }

    fn timeout(&mut self, _: &mut CoordinatorCore, _: &RequestContext) -> anyhow::Result<bool> {
        Ok(true)
    }
}

struct ReplyAgainHandler;

impl ResponseHandler for ReplyAgainHandler {
    fn receive(
        &mut self,
        core: &mut CoordinatorCore,
        context: &RequestContext,
        _member: &NodeIdentity,
        _response: &NodeResponse,
    ) -> anyhow::Result<bool> {
        core.reply(&context.submission, SubmitResponse::Error("second".into()));
        Ok(true)
    }

    fn timeout(&mut self, _: &mut CoordinatorCore, _: &RequestContext) -> anyhow::Result<bool> {
        Ok(true)
    }
}

#[tokio::test]
async fn chained_rounds_reply_once() {
    let mut harness = Harness::start(1);
    harness
        .coordinator
        .submit_with(
            Harness::client(),
            SessionOperationId::new("client", 1),
            |core, submission| {
                core.send_operation(
                    submission,
                    status_request(&submission.operation_id),
                    Box::new(ChainingHandler),
                )?;
                Ok(())
            },
        )
        .expect("submit");

    let first = harness.next_request().await;
    harness.respond(0, first.log_id, NodeResponse::Command { error: None });
    let second = harness.next_request().await;
    assert_ne!(first.log_id, second.log_id);
    harness.respond(0, second.log_id, NodeResponse::Command { error: None });

    let reply = harness.next_reply().await;
    assert_eq!(reply.response, SubmitResponse::Error("first".into()));
    let stats = harness.coordinator.stats().await.expect("stats");
    assert_eq!(stats.replies, 1);
    assert_eq!(stats.duplicate_replies, 1);
    assert!(harness.replies.try_recv().is_err());
}

#[tokio::test]
async fn operation_without_reply_gets_an_error() {
    let mut harness = Harness::start(1);
    harness
        .coordinator
        .submit_with(
            Harness::client(),
            SessionOperationId::new("client", 1),
            |_core, _submission| Ok(()),
        )
        .expect("submit");
    match harness.next_reply().await.response {
        SubmitResponse::Error(message) => assert!(message.contains("without a reply")),
        other => panic!("unexpected reply: {other:?}"),
    }

    harness
        .coordinator
        .submit_with(
            Harness::client(),
            SessionOperationId::new("client", 2),
            |_core, _submission| Err(anyhow::anyhow!("begin exploded")),
        )
        .expect("submit");
    match harness.next_reply().await.response {
        SubmitResponse::Error(message) => assert!(message.contains("begin exploded")),
        other => panic!("unexpected reply: {other:?}"),
    }
    let stats = harness.coordinator.stats().await.expect("stats");
    assert_eq!(stats.failed_operations, 1);
    assert_eq!(stats.operations, 0);
}

#[tokio::test]
async fn duplicate_submissions_are_dropped() {
    let mut harness = Harness::start(1);
    let operation_id = harness.submit(1, SubmitRequest::Command { command: vec![1] });
    harness
        .coordinator
        .submit(
            Harness::client(),
            operation_id.clone(),
            SubmitRequest::Command { command: vec![1] },
        )
        .expect("resubmit");
    let sent = harness.next_request().await;
    harness.respond(0, sent.log_id, NodeResponse::Command { error: None });
    let reply = harness.next_reply().await;
    assert_eq!(reply.operation_id, operation_id);

    // Resubmitting after completion is dropped as well.
    harness
        .coordinator
        .submit(
            Harness::client(),
            operation_id,
            SubmitRequest::Command { command: vec![1] },
        )
        .expect("resubmit");
    let stats = harness.coordinator.stats().await.expect("stats");
    assert_eq!(stats.duplicate_submissions, 2);
    assert!(harness.requests.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn unanswered_command_times_out() {
    let mut harness = Harness::start(3);
    harness.submit(1, SubmitRequest::Command { command: b"ddl".to_vec() });
    let sent = harness.next_request().await;
    harness.respond(0, sent.log_id, NodeResponse::Command { error: None });
    harness.respond(
        1,
        sent.log_id,
        NodeResponse::Command {
            error: Some("no such class".into()),
        },
    );

    let reply = harness.next_reply().await;
    match reply.response {
        SubmitResponse::Command(outcome) => {
            assert_eq!(outcome.succeeded, vec![harness.members[0].clone()]);
            assert_eq!(
                outcome.failed,
                vec![(harness.members[1].clone(), "no such class".to_string())]
            );
            assert_eq!(outcome.unresponsive, vec![harness.members[2].clone()]);
        }
        other => panic!("unexpected reply: {other:?}"),
    }
    let stats = harness.coordinator.stats().await.expect("stats");
    assert_eq!(stats.timeouts, 1);
    assert_eq!(stats.contexts, 0);

    // A response after the timeout removed the context is stale.
    harness.respond(2, sent.log_id, NodeResponse::Command { error: None });
    assert_eq!(harness.coordinator.close().await.expect("close"), 0);
    assert!(harness.coordinator.stats().await.is_err());
}

/// Keeps the context through its first timeout.
struct PatientHandler {
    timeouts: Arc<Mutex<u32>>,
}

impl ResponseHandler for PatientHandler {
    fn receive(
        &mut self,
        _: &mut CoordinatorCore,
        _: &RequestContext,
        _: &NodeIdentity,
        _: &NodeResponse,
    ) -> anyhow::Result<bool> {
        Ok(false)
    }

    fn timeout(
        &mut self,
        core: &mut CoordinatorCore,
        context: &RequestContext,
    ) -> anyhow::Result<bool> {
        let mut timeouts = self.timeouts.lock().expect("timeouts lock");
        *timeouts += 1;
        if *timeouts < 2 {
            return Ok(false);
        }
        core.reply(&context.submission, SubmitResponse::Error("gave up".into()));
        Ok(true)
    }
}

#[tokio::test(start_paused = true)]
async fn timeout_returning_false_is_offered_again() {
    let mut harness = Harness::start(0);
    let timeouts = Arc::new(Mutex::new(0));
    let handler_timeouts = timeouts.clone();
    harness
        .coordinator
        .submit_with(
            Harness::client(),
            SessionOperationId::new("client", 1),
            move |core, submission| {
                core.send_operation_with_timeout(
                    submission,
                    status_request(&submission.operation_id),
                    Box::new(PatientHandler {
                        timeouts: handler_timeouts,
                    }),
                    Duration::from_secs(1),
                )?;
                Ok(())
            },
        )
        .expect("submit");

    // With no members nothing is sent; only the deadline can end the round.
    let reply = harness.next_reply().await;
    assert_eq!(reply.response, SubmitResponse::Error("gave up".into()));
    assert_eq!(*timeouts.lock().expect("timeouts lock"), 2);
    assert!(harness.requests.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn close_abandons_pending_contexts() {
    let mut harness = Harness::start(2);
    harness.submit(1, SubmitRequest::CheckSequences);
    harness.submit(2, SubmitRequest::Command { command: Vec::new() });
    harness.next_request().await;
    harness.next_request().await;
    assert_eq!(harness.coordinator.close().await.expect("close"), 2);
    assert!(harness.replies.try_recv().is_err());
    assert!(harness.coordinator.join(NodeIdentity::new("late", 9)).is_err());
}

#[tokio::test]
async fn transaction_commits_with_majority() {
    let mut harness = Harness::start(3);
    harness.submit(1, SubmitRequest::Transaction { changes: b"x=1".to_vec() });

    let prepare = harness.next_request().await;
    let transaction_id = match &prepare.request {
        NodeRequest::Prepare { transaction_id, .. } => transaction_id.clone(),
        other => panic!("unexpected request: {other:?}"),
    };
    harness.respond(0, prepare.log_id, NodeResponse::Prepared(PrepareOutcome::Prepared));
    harness.respond(
        1,
        prepare.log_id,
        NodeResponse::Prepared(PrepareOutcome::Rejected(ValidationResult::MissingPrevious)),
    );
    harness.respond(2, prepare.log_id, NodeResponse::Prepared(PrepareOutcome::Prepared));

    let decide = harness.next_request().await;
    match &decide.request {
        NodeRequest::Decide {
            transaction_id: decided,
            commit,
            ..
        } => {
            assert_eq!(decided, &transaction_id);
            assert!(*commit);
        }
        other => panic!("unexpected request: {other:?}"),
    }
    let status = with_manager(&harness.sequence, |m| m.current_status()).expect("status");
    assert_eq!(status.get(transaction_id.position), Some(transaction_id.sequence));

    let behind = holo_coord::sequence::TransactionId::missing(transaction_id.position, 7);
    for member in 0..3 {
        let missing = if member == 1 {
            vec![behind.clone()]
        } else {
            Vec::new()
        };
        harness.respond(
            member,
            decide.log_id,
            NodeResponse::Decided {
                applied: member != 1,
                missing,
            },
        );
    }
    match harness.next_reply().await.response {
        SubmitResponse::Transaction(outcome) => {
            assert!(outcome.committed);
            assert_eq!(outcome.transaction_id, transaction_id);
            assert_eq!(outcome.acknowledged.len(), 3);
            assert!(outcome.unacknowledged.is_empty());
            assert_eq!(outcome.missing, vec![behind]);
        }
        other => panic!("unexpected reply: {other:?}"),
    }
}

#[tokio::test]
async fn transaction_rolls_back_without_majority() {
    let mut harness = Harness::start(3);
    harness.submit(1, SubmitRequest::Transaction { changes: Vec::new() });
    let prepare = harness.next_request().await;
    let rejected = NodeResponse::Prepared(PrepareOutcome::Rejected(
        ValidationResult::AlreadyPromised,
    ));
    harness.respond(0, prepare.log_id, rejected.clone());
    harness.respond(1, prepare.log_id, rejected);

    let decide = harness.next_request().await;
    assert!(matches!(
        decide.request,
        NodeRequest::Decide { commit: false, .. }
    ));
    // The promise was released, so nothing is pending on the coordinator.
    let pending = with_manager(&harness.sequence, |m| m.pending_promises()).expect("pending");
    assert_eq!(pending, 0);

    // The straggler's prepare answer belongs to a retired round.
    harness.respond(2, prepare.log_id, NodeResponse::Prepared(PrepareOutcome::Prepared));
    for member in 0..3 {
        harness.respond(
            member,
            decide.log_id,
            NodeResponse::Decided {
                applied: false,
                missing: Vec::new(),
            },
        );
    }
    match harness.next_reply().await.response {
        SubmitResponse::Transaction(outcome) => assert!(!outcome.committed),
        other => panic!("unexpected reply: {other:?}"),
    }
    let stats = harness.coordinator.stats().await.expect("stats");
    assert_eq!(stats.stale_responses, 1);
}

#[tokio::test]
async fn transaction_without_free_slot_is_refused() {
    let mut harness = Harness::start_with_slots(1, 1);
    harness.submit(1, SubmitRequest::Transaction { changes: Vec::new() });
    harness.next_request().await;
    harness.submit(2, SubmitRequest::Transaction { changes: Vec::new() });
    let reply = harness.next_reply().await;
    assert_eq!(reply.operation_id.counter, 2);
    match reply.response {
        SubmitResponse::Error(message) => assert!(message.contains("no free transaction")),
        other => panic!("unexpected reply: {other:?}"),
    }
}

#[tokio::test]
async fn check_sequences_reports_coordinator_gaps() {
    let mut harness = Harness::start(2);
    harness.submit(1, SubmitRequest::CheckSequences);
    let sent = harness.next_request().await;
    let mut ahead = vec![0; 8];
    ahead[3] = 2;
    harness.respond(
        0,
        sent.log_id,
        NodeResponse::SequenceStatus(holo_coord::sequence::TransactionSequenceStatus::new(
            vec![0; 8],
        )),
    );
    harness.respond(
        1,
        sent.log_id,
        NodeResponse::SequenceStatus(holo_coord::sequence::TransactionSequenceStatus::new(
            ahead,
        )),
    );
    match harness.next_reply().await.response {
        SubmitResponse::SequenceReport(report) => {
            assert_eq!(report.statuses.len(), 2);
            let coords: Vec<_> = report
                .coordinator_missing
                .iter()
                .map(|id| (id.position, id.sequence))
                .collect();
            assert_eq!(coords, vec![(3, 1), (3, 2)]);
        }
        other => panic!("unexpected reply: {other:?}"),
    }
}

#[tokio::test]
async fn responses_from_outside_the_round_are_ignored() {
    let mut harness = Harness::start(1);
    harness.submit(1, SubmitRequest::Command { command: Vec::new() });
    let sent = harness.next_request().await;
    harness
        .coordinator
        .receive(
            NodeIdentity::new("stranger", 42),
            sent.log_id,
            NodeResponse::Command { error: None },
        )
        .expect("receive");
    // A member joining later is not part of the snapshot either.
    harness
        .coordinator
        .join(NodeIdentity::new("node2", 2))
        .expect("join");
    harness
        .coordinator
        .receive(
            NodeIdentity::new("node2", 2),
            sent.log_id,
            NodeResponse::Command { error: None },
        )
        .expect("receive");
    let stats = harness.coordinator.stats().await.expect("stats");
    assert_eq!(stats.stale_responses, 2);
    assert_eq!(stats.contexts, 1);

    harness.respond(0, sent.log_id, NodeResponse::Command { error: None });
    match harness.next_reply().await.response {
        SubmitResponse::Command(outcome) => {
            assert_eq!(outcome.succeeded, vec![harness.members[0].clone()])
        }
        other => panic!("unexpected reply: {other:?}"),
    }
}

/// Fails the operation on the first response it sees.
struct FailingHandler;

impl ResponseHandler for FailingHandler {
    fn receive(
        &mut self,
        _: &mut CoordinatorCore,
        _: &RequestContext,
        _: &NodeIdentity,
        _: &NodeResponse,
    ) -> anyhow::Result<bool> {
        Err(anyhow::anyhow!("handler failed"))
    }

    fn timeout(&mut self, _: &mut CoordinatorCore, _: &RequestContext) -> anyhow::Result<bool> {
        Ok(true)
    }
}

#[tokio::test]
async fn failing_handler_drops_sibling_contexts() {
    let mut harness = Harness::start(2);
    let observed = Arc::new(Mutex::new(Vec::new()));
    let handler_observed = observed.clone();
    harness
        .coordinator
        .submit_with(
            Harness::client(),
            SessionOperationId::new("client", 1),
            move |core, submission| {
                core.send_operation(
                    submission,
                    status_request(&submission.operation_id),
                    Box::new(FailingHandler),
                )?;
                core.send_operation(
                    submission,
                    status_request(&submission.operation_id),
                    Box::new(ObservingHandler {
                        observed: handler_observed,
                    }),
                )?;
                Ok(())
            },
        )
        .expect("submit");

    let failing = harness.next_request().await;
    let sibling = harness.next_request().await;
    let stats = harness.coordinator.stats().await.expect("stats");
    assert_eq!(stats.contexts, 2);

    harness.respond(0, failing.log_id, NodeResponse::Command { error: None });
    match harness.next_reply().await.response {
        SubmitResponse::Error(message) => assert!(message.contains("handler failed")),
        other => panic!("unexpected reply: {other:?}"),
    }
    let stats = harness.coordinator.stats().await.expect("stats");
    assert_eq!(stats.contexts, 0);
    assert_eq!(stats.operations, 0);
    assert_eq!(stats.failed_operations, 1);

    // The sibling round was dropped with the operation.
    harness.respond(0, sibling.log_id, NodeResponse::Command { error: None });
    let stats = harness.coordinator.stats().await.expect("stats");
    assert_eq!(stats.stale_responses, 1);
    assert!(observed.lock().expect("observed lock").is_empty());
    assert!(harness.replies.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn unbounded_timeout_is_accepted() {
    let mut harness = Harness::start(1);
    harness
        .coordinator
        .submit_with(
            Harness::client(),
            SessionOperationId::new("client", 1),
            |core, submission| {
                core.send_operation_with_timeout(
                    submission,
                    status_request(&submission.operation_id),
                    Box::new(PatientHandler {
                        timeouts: Arc::new(Mutex::new(0)),
                    }),
                    Duration::MAX,
                )?;
                Ok(())
            },
        )
        .expect("submit");
    harness.next_request().await;
    tokio::time::sleep(Duration::from_secs(3600)).await;
    let stats = harness.coordinator.stats().await.expect("stats");
    assert_eq!(stats.contexts, 1);
    assert_eq!(stats.timeouts, 0);
    assert_eq!(harness.coordinator.close().await.expect("close"), 1);
    assert!(harness.replies.try_recv().is_err());
}

#[tokio::test]
async fn catch_up_resends_entries_from_the_member_log() {
    let mut harness = Harness::start(2);
    for counter in 1..=3 {
        harness.submit(counter, SubmitRequest::CheckSequences);
        harness.next_request().await;
    }
    let member = harness.members[1].clone();

    harness
        .coordinator
        .catch_up(member.clone(), Some(LogId::new(1, 1, Some(1))))
        .expect("catch up");
    let (to, sequences) = harness.catch_ups.recv().await.expect("catch-up sent");
    assert_eq!(to, member);
    assert_eq!(sequences, vec![1, 2]);

    harness
        .coordinator
        .catch_up(member.clone(), None)
        .expect("catch up from scratch");
    let (_, sequences) = harness.catch_ups.recv().await.expect("catch-up sent");
    assert_eq!(sequences, vec![0, 1, 2]);

    // A log that ends past the leader's head cannot be caught up.
    harness
        .coordinator
        .catch_up(member, Some(LogId::new(9, 1, Some(1))))
        .expect("catch up past head");
    harness.coordinator.stats().await.expect("stats");
    assert!(harness.catch_ups.try_recv().is_err());
}
