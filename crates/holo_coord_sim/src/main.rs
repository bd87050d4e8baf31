//! Simulator for exercising holo_coord on an in-process cluster.
//!
//! Starts a local cluster, drives a seeded mix of transactions and commands
//! through it (optionally with message loss and an isolated member), finishes
//! with a sequence check, and writes a JSON report.

use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use holo_coord::coord::{CoordinatorStats, NodeIdentity, SubmitRequest, SubmitResponse};
use holo_coord::local::{ClusterConfig, HubStats, LocalCluster};
use holo_coord::sequence::{TransactionId, DEFAULT_SLOT_COUNT};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tokio::time;

/// CLI entry point wrapper.
#[derive(Parser, Debug)]
#[command(name = "holo-coord-sim")]
struct Args {
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    Run(RunArgs),
}

/// CLI options for a simulation run.
#[derive(Parser, Debug, Clone)]
struct RunArgs {
    /// Cluster size; node 1 is the leader.
    #[arg(long, env = "HOLO_COORD_SIM_MEMBERS", default_value_t = 3)]
    members: usize,

    /// Concurrent submitting clients.
    #[arg(long, env = "HOLO_COORD_SIM_CLIENTS", default_value_t = 4)]
    clients: usize,

    /// Total operations submitted across all clients.
    #[arg(long, env = "HOLO_COORD_SIM_OPERATIONS", default_value_t = 200)]
    operations: usize,

    /// Percent of operations that are commands (rest are transactions).
    #[arg(long, env = "HOLO_COORD_SIM_COMMAND_PCT", default_value_t = 10)]
    command_pct: u8,

    /// Transaction sequence slots per node.
    #[arg(long, env = "HOLO_COORD_SIM_SLOTS", default_value_t = DEFAULT_SLOT_COUNT)]
    slots: usize,

    /// Deadline of one coordinator round.
    #[arg(long, env = "HOLO_COORD_SIM_REQUEST_TIMEOUT", default_value = "2s")]
    request_timeout: humantime::Duration,

    /// How often the coordinator looks for expired rounds.
    #[arg(long, env = "HOLO_COORD_SIM_SWEEP_INTERVAL", default_value = "100ms")]
    sweep_interval: humantime::Duration,

    /// Client-side wait for a reply.
    #[arg(long, env = "HOLO_COORD_SIM_OP_TIMEOUT", default_value = "10s")]
    op_timeout: humantime::Duration,

    /// Probability that a frame between two nodes is lost.
    #[arg(long, env = "HOLO_COORD_SIM_DROP_RATE", default_value_t = 0.0)]
    drop_rate: f64,

    /// Isolate the last member for the middle third of the run.
    #[arg(long, env = "HOLO_COORD_SIM_ISOLATE", default_value_t = false)]
    isolate: bool,

    /// Random seed (0 picks a random seed).
    #[arg(long, env = "HOLO_COORD_SIM_SEED", default_value_t = 0)]
    seed: u64,

    /// Keep operation logs in files under this directory instead of memory.
    #[arg(long, env = "HOLO_COORD_SIM_OPLOG_DIR")]
    oplog_dir: Option<PathBuf>,

    /// Write the JSON report here instead of stdout.
    #[arg(long, env = "HOLO_COORD_SIM_OUT")]
    out: Option<PathBuf>,
}

/// Run parameters embedded in the report for reproducibility.
#[derive(Serialize, Debug, Clone)]
struct ReportMeta {
    members: usize,
    clients: usize,
    operations: usize,
    command_pct: u8,
    slots: usize,
    request_timeout_ms: u64,
    sweep_interval_ms: u64,
    drop_rate: f64,
    isolated: Option<String>,
    seed: u64,
}

/// Per-kind outcome counters.
#[derive(Serialize, Debug, Clone, Default)]
struct OutcomeCounts {
    committed: u64,
    rolled_back: u64,
    /// Sum over transactions of members that never acknowledged the decision.
    unacknowledged: u64,
    commands_ok: u64,
    commands_partial: u64,
    errors: u64,
    timeouts: u64,
}

impl OutcomeCounts {
    fn record(&mut self, response: &anyhow::Result<SubmitResponse>) {
        match response {
            Ok(SubmitResponse::Transaction(outcome)) => {
                if outcome.committed {
                    self.committed += 1;
                } else {
                    self.rolled_back += 1;
                }
                self.unacknowledged += outcome.unacknowledged.len() as u64;
            }
            Ok(SubmitResponse::Command(outcome)) => {
                if outcome.failed.is_empty() && outcome.unresponsive.is_empty() {
                    self.commands_ok += 1;
                } else {
                    self.commands_partial += 1;
                }
            }
            Ok(SubmitResponse::SequenceReport(_)) => {}
            Ok(SubmitResponse::Error(_)) => self.errors += 1,
            Err(_) => self.timeouts += 1,
        }
    }

    fn merge(&mut self, other: &OutcomeCounts) {
        self.committed += other.committed;
        self.rolled_back += other.rolled_back;
        self.unacknowledged += other.unacknowledged;
        self.commands_ok += other.commands_ok;
        self.commands_partial += other.commands_partial;
        self.errors += other.errors;
        self.timeouts += other.timeouts;
    }
}

/// Final view of one node.
#[derive(Serialize, Debug, Clone)]
struct NodeReport {
    node: String,
    /// Sum of the highest contiguous sequence over all slots.
    confirmed: u64,
    /// Slots where this node trails the leader.
    slots_behind: usize,
    /// Transactions this node learned were committed without seeing them.
    missing: Vec<TransactionId>,
    /// Whether the node answered the final sequence check.
    reported: bool,
}

#[derive(Serialize, Debug, Clone)]
struct Report {
    meta: ReportMeta,
    outcomes: OutcomeCounts,
    nodes: Vec<NodeReport>,
    coordinator_missing: Vec<TransactionId>,
    coordinator: CoordinatorStats,
    network: HubStats,
    elapsed_ms: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let args = Args::parse();
    match args.cmd {
        Command::Run(args) => run(args).await,
    }
}

fn init_tracing() {
    // ANSI colors only when stdout is a terminal and NO_COLOR is unset.
    let ansi = std::io::stdout().is_terminal() && std::env::var_os("NO_COLOR").is_none();
    tracing_subscriber::fmt()
        .with_ansi(ansi)
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    anyhow::ensure!(args.members > 0, "--members must be > 0");
    anyhow::ensure!(args.clients > 0, "--clients must be > 0");
    anyhow::ensure!(args.slots > 0, "--slots must be > 0");
    anyhow::ensure!(args.command_pct <= 100, "--command-pct must be <= 100");
    anyhow::ensure!(
        (0.0..=1.0).contains(&args.drop_rate),
        "--drop-rate must be within [0, 1]"
    );
    anyhow::ensure!(
        !args.isolate || args.members > 1,
        "--isolate needs at least two members"
    );

    let seed = if args.seed == 0 {
        rand::thread_rng().gen()
    } else {
        args.seed
    };
    let config = ClusterConfig {
        members: args.members,
        database: "sim".to_string(),
        slot_count: args.slots,
        request_timeout: args.request_timeout.into(),
        sweep_interval: args.sweep_interval.into(),
        oplog_dir: args.oplog_dir.clone(),
        seed,
    };
    let cluster = Arc::new(LocalCluster::start(&config).context("start cluster")?);
    cluster.hub().set_drop_rate(args.drop_rate);
    let isolated = args
        .isolate
        .then(|| cluster.nodes()[args.members - 1].identity().clone());
    tracing::info!(seed, members = args.members, operations = args.operations, "simulation started");

    let start = time::Instant::now();
    let op_timeout: Duration = args.op_timeout.into();
    let mut outcomes = OutcomeCounts::default();
    let phase_size = args.operations.div_ceil(3);
    let mut submitted = 0;
    for phase in 0..3 {
        let count = phase_size.min(args.operations - submitted);
        if phase == 1 {
            if let Some(node) = &isolated {
                cluster.hub().isolate(node);
            }
        }
        let phase_outcomes = run_phase(
            &cluster,
            &args,
            isolated.as_ref(),
            seed ^ (phase as u64 + 1),
            count,
            op_timeout,
        )
        .await?;
        outcomes.merge(&phase_outcomes);
        if phase == 1 {
            if let Some(node) = &isolated {
                cluster.hub().heal(node);
            }
        }
        submitted += count;
    }

    let check = final_check(&cluster, op_timeout).await?;
    let coordinator = cluster
        .leader()
        .coordinator()
        .context("leader has no coordinator")?
        .stats()
        .await?;
    let network = cluster.hub().stats();
    let elapsed_ms = start.elapsed().as_millis() as u64;

    let cluster = Arc::try_unwrap(cluster)
        .map_err(|_| anyhow::anyhow!("cluster still shared after the run"))?;
    let abandoned = cluster.shutdown().await?;
    if abandoned > 0 {
        tracing::warn!(abandoned, "requests still in flight at shutdown");
    }

    let report = Report {
        meta: ReportMeta {
            members: args.members,
            clients: args.clients,
            operations: args.operations,
            command_pct: args.command_pct,
            slots: args.slots,
            request_timeout_ms: config.request_timeout.as_millis() as u64,
            sweep_interval_ms: config.sweep_interval.as_millis() as u64,
            drop_rate: args.drop_rate,
            isolated: isolated.map(|node| node.to_string()),
            seed,
        },
        outcomes,
        nodes: check.nodes,
        coordinator_missing: check.coordinator_missing,
        coordinator,
        network,
        elapsed_ms,
    };
    write_report(args.out.as_ref(), &report)
}

/// Submit `count` operations split across the clients and wait for all of
/// them.
async fn run_phase(
    cluster: &Arc<LocalCluster>,
    args: &RunArgs,
    isolated: Option<&NodeIdentity>,
    seed: u64,
    count: usize,
    op_timeout: Duration,
) -> anyhow::Result<OutcomeCounts> {
    // Clients submit through every node except the isolated one.
    let origins: Vec<usize> = (0..args.members)
        .filter(|index| Some(cluster.nodes()[*index].identity()) != isolated)
        .collect();

    let mut tasks = Vec::with_capacity(args.clients);
    for client_id in 0..args.clients {
        let share = count / args.clients + usize::from(client_id < count % args.clients);
        if share == 0 {
            continue;
        }
        let cluster = cluster.clone();
        let origin = origins[client_id % origins.len()];
        let command_pct = args.command_pct;
        // Mix the phase seed with the client id for deterministic per-client RNG.
        let seed = seed ^ (client_id as u64).wrapping_mul(0x9e3779b97f4a7c15);
        tasks.push(tokio::spawn(async move {
            run_client(&cluster, origin, share, command_pct, seed, op_timeout).await
        }));
    }

    let mut outcomes = OutcomeCounts::default();
    for task in tasks {
        let client = task.await.context("client task panicked")?;
        outcomes.merge(&client);
    }
    Ok(outcomes)
}

async fn run_client(
    cluster: &LocalCluster,
    origin: usize,
    operations: usize,
    command_pct: u8,
    seed: u64,
    op_timeout: Duration,
) -> OutcomeCounts {
    let mut rng = SmallRng::seed_from_u64(seed);
    let mut outcomes = OutcomeCounts::default();
    let node = &cluster.nodes()[origin];
    for _ in 0..operations {
        let request = if rng.gen_range(0..100) < u32::from(command_pct) {
            SubmitRequest::Command {
                command: format!("cmd-{}", rng.gen::<u32>()).into_bytes(),
            }
        } else {
            let mut changes = vec![0u8; 16];
            rng.fill(&mut changes[..]);
            SubmitRequest::Transaction { changes }
        };
        let response = node.submit(request, op_timeout).await;
        if let Err(err) = &response {
            tracing::warn!(node = %node.identity(), error = ?err, "operation failed");
        }
        outcomes.record(&response);
    }
    outcomes
}

struct FinalCheck {
    nodes: Vec<NodeReport>,
    coordinator_missing: Vec<TransactionId>,
}

/// Ask every member for its sequence status and compare against the leader.
async fn final_check(cluster: &LocalCluster, op_timeout: Duration) -> anyhow::Result<FinalCheck> {
    let report = match cluster
        .leader()
        .submit(SubmitRequest::CheckSequences, op_timeout)
        .await
        .context("final sequence check")?
    {
        SubmitResponse::SequenceReport(report) => report,
        other => anyhow::bail!("unexpected reply to sequence check: {other:?}"),
    };
    let leader_status = cluster.leader().sequence_status()?;

    let mut nodes = Vec::with_capacity(cluster.nodes().len());
    for node in cluster.nodes() {
        let status = node.sequence_status()?;
        let slots_behind = status
            .sequences
            .iter()
            .zip(&leader_status.sequences)
            .filter(|(own, leader)| own < leader)
            .count();
        nodes.push(NodeReport {
            node: node.identity().to_string(),
            confirmed: status.sequences.iter().sum(),
            slots_behind,
            missing: node.missing()?,
            reported: report
                .statuses
                .iter()
                .any(|(member, _)| member == node.identity()),
        });
    }
    Ok(FinalCheck {
        nodes,
        coordinator_missing: report.coordinator_missing,
    })
}

fn write_report(out: Option<&PathBuf>, report: &Report) -> anyhow::Result<()> {
    let data = serde_json::to_vec_pretty(report).context("serialize report")?;
    match out {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)
                    .with_context(|| format!("create dir {}", parent.display()))?;
            }
            std::fs::write(path, data).with_context(|| format!("write {}", path.display()))?;
            eprintln!("wrote report: {}", path.display());
        }
        None => println!("{}", String::from_utf8_lossy(&data)),
    }
    Ok(())
}
