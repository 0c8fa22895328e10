use clap::error::ErrorKind;
use clap::{CommandFactory, Parser, ValueEnum};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use raft_node::config::{NodeConfig, RaftConfig};
use raft_node::discovery::DiscoveryNode;
use raft_node::persistence::{FilePersistence, MemoryPersistence, Persistence};
use raft_node::raft::{RaftNode, RaftRole};
use raft_node::registry::RecordingRegistry;
use raft_node::shutdown::install_shutdown_handler;
use raft_node::transport::LocalTransport;

type DemoNode = RaftNode<RecordingRegistry, Box<dyn Persistence>>;

#[derive(Parser, Debug)]
#[command(name = "raft-node")]
#[command(version)]
#[command(about = "Raft coordination node with joint-consensus membership")]
#[command(propagate_version = true)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand, Debug)]
enum Commands {
    /// Run an in-process cluster, replicate some commands and print its status
    Demo(DemoArgs),
}

#[derive(Parser, Debug)]
struct DemoArgs {
    /// Number of nodes in the cluster
    #[arg(long, default_value = "3")]
    nodes: u16,

    /// Host used in node addresses
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port of the first node; the others use the following ports
    #[arg(long, default_value = "7000")]
    base_port: u16,

    /// Number of client commands to submit
    #[arg(long, default_value = "10")]
    commands: u32,

    /// Base election timeout in milliseconds
    #[arg(long, default_value = "300")]
    election_deadline_ms: u64,

    /// Leader heartbeat interval in milliseconds
    #[arg(long, default_value = "50")]
    heartbeat_interval_ms: u64,

    /// Committed entries between snapshots (0 disables snapshots)
    #[arg(long, default_value = "1000")]
    snapshot_interval: u64,

    /// Maximum entries per append batch
    #[arg(long, default_value = "100")]
    max_entries: usize,

    /// Keep node state in per-node directories under this path
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Keep the cluster running until SIGINT/SIGTERM
    #[arg(long)]
    hold: bool,

    /// Output format
    #[arg(long, short = 'o', default_value = "table")]
    output: OutputFormat,
}

#[derive(Debug, Clone, ValueEnum)]
enum OutputFormat {
    Table,
    Json,
}

// =============================================================================
// JSON Output Types
// =============================================================================

#[derive(Serialize)]
struct NodeStatusOutput {
    address: String,
    role: String,
    term: u64,
    last_index: u64,
    committed_index: u64,
    snapshot_index: Option<u64>,
    applied: usize,
}

#[derive(Serialize)]
struct ClusterStatusOutput {
    leader: Option<String>,
    config: String,
    commands_committed: u32,
    nodes: Vec<NodeStatusOutput>,
}

// =============================================================================
// Cluster
// =============================================================================

/// Consecutive addresses from `base_port`, or `None` if a port would overflow.
fn node_addresses(host: &str, base_port: u16, nodes: u16) -> Option<Vec<DiscoveryNode>> {
    (0..nodes)
        .map(|i| {
            base_port
                .checked_add(i)
                .map(|port| DiscoveryNode::new(host.to_string(), port))
        })
        .collect()
}

struct DemoCluster {
    nodes: Vec<Arc<DemoNode>>,
    registries: Vec<RecordingRegistry>,
    handles: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
}

impl DemoCluster {
    fn start(args: &DemoArgs, shutdown: CancellationToken) -> Result<Self, Box<dyn std::error::Error>> {
        let transport = LocalTransport::new();
        let raft = RaftConfig {
            bootstrap: false,
            election_deadline_ms: args.election_deadline_ms,
            heartbeat_interval_ms: args.heartbeat_interval_ms,
            snapshot_interval: args.snapshot_interval,
            max_entries: args.max_entries,
        };

        let addresses = node_addresses(&args.host, args.base_port, args.nodes)
            .ok_or("node ports run past 65535")?;
        let seed = addresses
            .first()
            .cloned()
            .ok_or("cluster needs at least one node")?;

        let mut nodes = Vec::new();
        let mut registries = Vec::new();
        let mut handles = Vec::new();
        for (i, address) in addresses.iter().enumerate() {
            let mut config = NodeConfig::new(address.clone())
                .with_raft(raft.clone())
                .with_bootstrap(i == 0)
                .with_peer(seed.clone());
            if let Some(dir) = &args.data_dir {
                config = config.with_data_dir(dir.join(format!("node-{}", address.port)));
            }

            let persistence: Box<dyn Persistence> = match &config.data_dir {
                Some(dir) => Box::new(FilePersistence::open(dir)?),
                None => Box::new(MemoryPersistence::new()),
            };
            let registry = RecordingRegistry::new();
            let (node, mailbox_rx) = RaftNode::new(
                config,
                persistence,
                registry.clone(),
                Arc::new(transport.endpoint(address.clone())),
            )?;
            let node = Arc::new(node);
            transport.register(address.clone(), node.mailbox());

            let runner = node.clone();
            let token = shutdown.clone();
            handles.push(tokio::spawn(async move {
                runner.run(mailbox_rx, token).await;
            }));

            nodes.push(node);
            registries.push(registry);
        }

        Ok(Self {
            nodes,
            registries,
            handles,
            shutdown,
        })
    }

    async fn leader(&self) -> Option<Arc<DemoNode>> {
        for node in &self.nodes {
            if node.current_state().await == RaftRole::Leader {
                return Some(node.clone());
            }
        }
        None
    }

    async fn wait_for_leader(&self, timeout: Duration) -> Option<Arc<DemoNode>> {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if let Some(leader) = self.leader().await {
                return Some(leader);
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        None
    }

    /// Wait until the leader's stable configuration contains every node.
    async fn wait_for_members(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while tokio::time::Instant::now() < deadline {
            if let Some(leader) = self.leader().await {
                let meta = leader.current_meta().await;
                if !meta.config.is_transitioning() && meta.members().len() == self.nodes.len() {
                    return true;
                }
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        false
    }

    async fn stop(self) {
        self.shutdown.cancel();
        for node in &self.nodes {
            node.shutdown();
        }
        for handle in self.handles {
            let _ = handle.await;
        }
    }
}

async fn print_status(
    cluster: &DemoCluster,
    committed: u32,
    output_format: &OutputFormat,
) -> Result<(), Box<dyn std::error::Error>> {
    let leader = cluster.leader().await;
    let config = match &leader {
        Some(node) => node.current_meta().await.config.to_string(),
        None => "unknown".to_string(),
    };

    let mut nodes = Vec::new();
    for (node, registry) in cluster.nodes.iter().zip(&cluster.registries) {
        let meta = node.current_meta().await;
        let log = node.replicated_log().await;
        nodes.push(NodeStatusOutput {
            address: node.id().to_string(),
            role: node.current_state().await.to_string(),
            term: meta.current_term,
            last_index: log.last_index(),
            committed_index: log.committed_index(),
            snapshot_index: log.snapshot().map(|s| s.meta.last_included_index),
            applied: registry.applied().len(),
        });
    }

    match output_format {
        OutputFormat::Json => {
            let output = ClusterStatusOutput {
                leader: leader.map(|l| l.id().to_string()),
                config,
                commands_committed: committed,
                nodes,
            };
            println!("{}", serde_json::to_string_pretty(&output)?);
        }
        OutputFormat::Table => {
            println!("Cluster Status");
            println!("{}", "=".repeat(60));
            println!(
                "Leader:    {}",
                leader
                    .map(|l| l.id().to_string())
                    .unwrap_or_else(|| "none".to_string())
            );
            println!("Config:    {}", config);
            println!("Committed: {} commands", committed);
            println!();
            println!(
                "{:<22} {:<10} {:>5} {:>6} {:>7} {:>9} {:>8}",
                "ADDRESS", "ROLE", "TERM", "LAST", "COMMIT", "SNAPSHOT", "APPLIED"
            );
            println!("{}", "-".repeat(72));
            for node in nodes {
                println!(
                    "{:<22} {:<10} {:>5} {:>6} {:>7} {:>9} {:>8}",
                    node.address,
                    node.role,
                    node.term,
                    node.last_index,
                    node.committed_index,
                    node.snapshot_index
                        .map(|i| i.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                    node.applied
                );
            }
        }
    }
    Ok(())
}

async fn run_demo(args: DemoArgs) -> Result<(), Box<dyn std::error::Error>> {
    let shutdown = install_shutdown_handler();
    let cluster = DemoCluster::start(&args, shutdown.clone())?;

    let wait = Duration::from_millis(args.election_deadline_ms * 20);
    if cluster.wait_for_leader(wait).await.is_none() {
        cluster.stop().await;
        return Err("no leader elected".into());
    }
    if !cluster.wait_for_members(wait).await {
        tracing::warn!("Not every node joined the cluster in time");
    }

    let mut committed = 0;
    for i in 0..args.commands {
        let Some(leader) = cluster.wait_for_leader(wait).await else {
            tracing::warn!("Lost the leader, stopping submissions");
            break;
        };
        match tokio::time::timeout(wait, leader.command(format!("command-{}", i))).await {
            Ok(Ok(result)) => {
                tracing::debug!(i, result = ?result, "Command committed");
                committed += 1;
            }
            Ok(Err(e)) => tracing::warn!(i, error = %e, "Command failed"),
            Err(_) => tracing::warn!(i, "Command timed out"),
        }
    }

    // Give followers a heartbeat to learn the final commit index.
    tokio::time::sleep(Duration::from_millis(args.heartbeat_interval_ms * 3)).await;
    print_status(&cluster, committed, &args.output).await?;

    if args.hold {
        tracing::info!("Holding cluster, press Ctrl-C to stop");
        shutdown.cancelled().await;
    }

    cluster.stop().await;
    Ok(())
}

// =============================================================================
// Main Entry Point
// =============================================================================

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let Commands::Demo(demo) = &args.command;
    if node_addresses(&demo.host, demo.base_port, demo.nodes).is_none() {
        Args::command()
            .error(
                ErrorKind::ValueValidation,
                format!(
                    "--base-port {} leaves no room for {} nodes",
                    demo.base_port, demo.nodes
                ),
            )
            .exit();
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    match args.command {
        Commands::Demo(demo_args) => {
            run_demo(demo_args).await?;
        }
    }

    Ok(())
}
