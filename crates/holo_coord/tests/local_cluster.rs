use std::sync::{Arc, Mutex};
use std::time::Duration;

use holo_coord::coord::{NodeApply, SubmitRequest, SubmitResponse};
use holo_coord::local::{ClusterConfig, LocalCluster};
use holo_coord::oplog::{FileOpLog, OperationLog};
use holo_coord::sequence::TransactionId;

const SUBMIT_TIMEOUT: Duration = Duration::from_secs(10);

fn config(members: usize) -> ClusterConfig {
    ClusterConfig {
        members,
        slot_count: 16,
        request_timeout: Duration::from_millis(500),
        sweep_interval: Duration::from_millis(20),
        ..ClusterConfig::default()
    }
}

/// Records what every node applied.
#[derive(Default)]
struct RecordingApply {
    committed: Mutex<Vec<TransactionId>>,
    commands: Mutex<Vec<Vec<u8>>>,
}

impl NodeApply for RecordingApply {
    fn commit(&self, transaction: &TransactionId) -> anyhow::Result<()> {
        self.committed
            .lock()
            .expect("committed lock")
            .push(transaction.clone());
        Ok(())
    }

    fn execute(&self, command: &[u8]) -> anyhow::Result<()> {
        anyhow::ensure!(command != b"fail", "command refused");
        self.commands
            .lock()
            .expect("commands lock")
            .push(command.to_vec());
        Ok(())
    }
}

#[tokio::test]
async fn transaction_commits_on_every_node() {
    let apply = Arc::new(RecordingApply::default());
    let cluster = LocalCluster::start_with_apply(&config(3), apply.clone()).expect("cluster");

    let response = cluster
        .leader()
        .submit(
            SubmitRequest::Transaction {
                changes: b"k=v".to_vec(),
            },
            SUBMIT_TIMEOUT,
        )
        .await
        .expect("submit");
    let outcome = match response {
        SubmitResponse::Transaction(outcome) => outcome,
        other => panic!("unexpected response: {other:?}"),
    };
    assert!(outcome.committed);
    assert_eq!(outcome.acknowledged.len(), 3);
    assert!(outcome.unacknowledged.is_empty());
    assert!(outcome.missing.is_empty());

    let id = outcome.transaction_id;
    for node in cluster.nodes() {
        let status = node.sequence_status().expect("status");
        assert_eq!(status.get(id.position), Some(id.sequence), "{}", node.identity());
    }
    assert_eq!(apply.committed.lock().expect("committed lock").len(), 3);

    let stats = cluster
        .leader()
        .coordinator()
        .expect("leader coordinator")
        .stats()
        .await
        .expect("stats");
    assert_eq!(stats.members, 3);
    assert_eq!(stats.contexts, 0);
    assert_eq!(stats.replies, 1);
    assert_eq!(cluster.shutdown().await.expect("shutdown"), 0);
}

#[tokio::test]
async fn transactions_use_distinct_slots() {
    let cluster = LocalCluster::start(&config(3)).expect("cluster");
    let mut ids = Vec::new();
    for _ in 0..4 {
        match cluster
            .leader()
            .submit(SubmitRequest::Transaction { changes: Vec::new() }, SUBMIT_TIMEOUT)
            .await
            .expect("submit")
        {
            SubmitResponse::Transaction(outcome) => {
                assert!(outcome.committed);
                ids.push(outcome.transaction_id);
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }
    let positions: Vec<u32> = ids.iter().map(|id| id.position).collect();
    assert_eq!(positions, vec![0, 1, 2, 3]);
    assert!(ids.iter().all(|id| id.sequence == 1));
    cluster.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn command_reports_member_failures() {
    let apply = Arc::new(RecordingApply::default());
    let cluster = LocalCluster::start_with_apply(&config(2), apply.clone()).expect("cluster");

    match cluster
        .leader()
        .submit(
            SubmitRequest::Command {
                command: b"create class".to_vec(),
            },
            SUBMIT_TIMEOUT,
        )
        .await
        .expect("submit")
    {
        SubmitResponse::Command(outcome) => {
            assert_eq!(outcome.succeeded.len(), 2);
            assert!(outcome.failed.is_empty());
        }
        other => panic!("unexpected response: {other:?}"),
    }

    match cluster
        .leader()
        .submit(
            SubmitRequest::Command {
                command: b"fail".to_vec(),
            },
            SUBMIT_TIMEOUT,
        )
        .await
        .expect("submit")
    {
        SubmitResponse::Command(outcome) => {
            assert!(outcome.succeeded.is_empty());
            assert_eq!(outcome.failed.len(), 2);
            assert!(outcome.failed[0].1.contains("command refused"));
        }
        other => panic!("unexpected response: {other:?}"),
    }
    assert_eq!(apply.commands.lock().expect("commands lock").len(), 2);
    cluster.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn followers_submit_through_the_leader() {
    let cluster = LocalCluster::start(&config(2)).expect("cluster");
    let follower = cluster.node(1).expect("follower");
    assert!(!follower.is_leader());
    assert!(follower.coordinator().is_none());

    // The follower's own submit goes to the leader and succeeds.
    let response = follower
        .submit(SubmitRequest::CheckSequences, SUBMIT_TIMEOUT)
        .await
        .expect("submit");
    assert!(matches!(response, SubmitResponse::SequenceReport(_)));
    cluster.shutdown().await.expect("shutdown");
}

#[tokio::test(start_paused = true)]
async fn isolated_member_falls_behind_and_catches_up_its_log() {
    // One slot, so every transaction lands in the same sequence.
    let cluster = LocalCluster::start(&ClusterConfig {
        slot_count: 1,
        ..config(3)
    })
    .expect("cluster");
    let lagging = cluster.node(2).expect("third node").identity().clone();
    cluster.hub().isolate(&lagging);

    let outcome = match cluster
        .leader()
        .submit(SubmitRequest::Transaction { changes: Vec::new() }, SUBMIT_TIMEOUT)
        .await
        .expect("submit")
    {
        SubmitResponse::Transaction(outcome) => outcome,
        other => panic!("unexpected response: {other:?}"),
    };
    assert!(outcome.committed);
    assert_eq!(outcome.unacknowledged, vec![lagging.clone()]);
    let id = outcome.transaction_id;

    cluster.hub().heal(&lagging);
    // The first round after healing finds the gap and triggers a catch-up.
    match cluster
        .leader()
        .submit(SubmitRequest::CheckSequences, SUBMIT_TIMEOUT)
        .await
        .expect("submit")
    {
        SubmitResponse::SequenceReport(report) => {
            assert_eq!(report.statuses.len(), 2);
            assert!(report.coordinator_missing.is_empty());
        }
        other => panic!("unexpected response: {other:?}"),
    }
    // Now in sync, the lagging member answers and shows it never committed.
    match cluster
        .leader()
        .submit(SubmitRequest::CheckSequences, SUBMIT_TIMEOUT)
        .await
        .expect("submit")
    {
        SubmitResponse::SequenceReport(report) => {
            assert_eq!(report.statuses.len(), 3);
            let lagging_status = report
                .statuses
                .iter()
                .find(|(member, _)| member == &lagging)
                .map(|(_, status)| status.clone())
                .expect("lagging status");
            assert_eq!(lagging_status.get(id.position), Some(0));
            assert!(report.coordinator_missing.is_empty());
        }
        other => panic!("unexpected response: {other:?}"),
    }
    let lagging_node = cluster.node(2).expect("third node");
    assert_eq!(
        lagging_node.oplog().last_persistent_log().expect("last"),
        cluster.leader().oplog().last_persistent_log().expect("last")
    );

    // Its next commit in that slot exposes the gap.
    let outcome = match cluster
        .leader()
        .submit(SubmitRequest::Transaction { changes: Vec::new() }, SUBMIT_TIMEOUT)
        .await
        .expect("submit")
    {
        SubmitResponse::Transaction(outcome) => outcome,
        other => panic!("unexpected response: {other:?}"),
    };
    assert!(outcome.committed);
    assert_eq!(outcome.transaction_id.sequence, id.sequence + 1);
    assert_eq!(outcome.acknowledged.len(), 3);
    assert_eq!(
        outcome.missing,
        vec![TransactionId::missing(id.position, id.sequence)]
    );
    assert_eq!(
        lagging_node.missing().expect("missing"),
        vec![TransactionId::missing(id.position, id.sequence)]
    );
    cluster.shutdown().await.expect("shutdown");
}

#[tokio::test]
async fn file_backed_logs_survive_shutdown() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cluster = LocalCluster::start(&ClusterConfig {
        oplog_dir: Some(dir.path().to_path_buf()),
        ..config(2)
    })
    .expect("cluster");
    for _ in 0..2 {
        let response = cluster
            .leader()
            .submit(SubmitRequest::Transaction { changes: Vec::new() }, SUBMIT_TIMEOUT)
            .await
            .expect("submit");
        assert!(matches!(
            response,
            SubmitResponse::Transaction(ref outcome) if outcome.committed
        ));
    }
    let leader_last = cluster
        .leader()
        .oplog()
        .last_persistent_log()
        .expect("last")
        .expect("leader log not empty");
    cluster.shutdown().await.expect("shutdown");

    for name in ["node1", "node2"] {
        let log = FileOpLog::open(dir.path().join(name)).expect("reopen");
        assert_eq!(log.last_persistent_log().expect("last"), Some(leader_last));
        // Prepare and decide for each transaction.
        assert_eq!(log.iterate(0, u64::MAX).expect("iterate").len(), 4);
    }
}
