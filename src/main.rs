/*
    Nodes hold bitcakes and pass them to their neighbors over FIFO channels.
    A snapshot records, without stopping the transfers, a consistent global
    state: every node's balance plus whatever was in flight on the channels
    when the cut passed. The recorded total always equals the number of
    bitcakes in the system.

    Acharya-Badrinath and Alagar-Venkatesan both flood markers and buffer
    transfers that cross the cut. Coordinated checkpointing instead freezes
    transfers, records balances along a request tree and releases nodes once
    acknowledgements flow back to the initiator.
*/

use std::{path::PathBuf, process, time::Duration};

use clap::{Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};

use token_snapshot::{
    cluster::{spawn_node, Cluster},
    common::{
        config::{load_script, ClusterConfig},
        error::Result,
    },
    network::{node::NodeId, runtime::NodeRuntime},
    snapshot::OutputLog,
};

/// Bitcake network with pluggable global snapshot algorithms.
#[derive(Parser)]
#[command(name = "token-snapshot", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every node of the descriptor in this process and play a script.
    Run {
        /// JSON node-graph descriptor.
        #[arg(long)]
        config: PathBuf,
        /// Instruction script (send / snapshot / wait lines).
        #[arg(long)]
        script: PathBuf,
        /// Pause after every scripted command, in milliseconds.
        #[arg(long, default_value = "0")]
        pause_ms: u64,
        /// Time left for in-flight messages after the script ends.
        #[arg(long, default_value = "1000")]
        settle_ms: u64,
    },
    /// Run a single node and read commands from stdin.
    Node {
        #[arg(long)]
        config: PathBuf,
        #[arg(long)]
        id: NodeId,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Commands::Run {
            config,
            script,
            pause_ms,
            settle_ms,
        } => run_cluster(config, script, pause_ms, settle_ms).await,
        Commands::Node { config, id } => run_node(config, id).await,
    };

    if let Err(e) = result {
        error!(error = %e, "fatal");
        process::exit(1);
    }
}

async fn run_cluster(config: PathBuf, script: PathBuf, pause_ms: u64, settle_ms: u64) -> Result<()> {
    let config = ClusterConfig::load(config)?;
    let commands = load_script(script)?;
    let output = OutputLog::file(config.output_path())?;

    let cluster = Cluster::launch(&config, output).await?;
    cluster
        .execute(&commands, Duration::from_millis(pause_ms))
        .await?;
    tokio::time::sleep(Duration::from_millis(settle_ms)).await;

    let balances = cluster.balances();
    for (id, balance) in &balances {
        info!(node = id, balance, "final balance");
    }
    let total = cluster.total();
    if total == config.total_balance() {
        info!(total, "bitcakes conserved");
    } else {
        warn!(
            total,
            expected = config.total_balance(),
            "balances differ from the initial total, transfers may still be in flight"
        );
    }
    Ok(())
}

async fn run_node(config: PathBuf, id: NodeId) -> Result<()> {
    let config = ClusterConfig::load(config)?;
    let output = OutputLog::file(config.output_path())?;
    let runtime = spawn_node(&config, id, output).await?;
    info!(node = id, "commands: send <to> <amount> | snapshot | print | exit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if !interpret(&runtime, line.trim()) {
            break;
        }
    }
    info!(node = id, balance = runtime.balance(), "stopping");
    Ok(())
}

/// Returns false once the node should stop.
fn interpret(runtime: &NodeRuntime, line: &str) -> bool {
    let parts: Vec<&str> = line.split_whitespace().collect();
    match parts.as_slice() {
        [] => {}
        ["send", to, amount] => match (to.parse(), amount.parse()) {
            (Ok(to), Ok(amount)) => {
                runtime.try_send(to, amount);
            }
            _ => warn!("usage: send <to> <amount>"),
        },
        ["snapshot"] => runtime.start_snapshot(),
        ["print"] => info!(
            node = runtime.id(),
            balance = runtime.balance(),
            availability = ?runtime.availability(),
            "status"
        ),
        ["exit" | "quit"] => return false,
        _ => warn!(line, "unknown command"),
    }
    true
}
