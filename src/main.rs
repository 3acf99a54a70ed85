use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use raftkv::config::{parse_peers, NodeConfig};
use raftkv::node::KvNode;
use raftkv::router;
use raftkv::runtime::TimerConfig;
use raftkv::types::NodeId;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(about = "Replicated key-value store node")]
struct Args {
    /// This node's numeric ID (must be unique in the cluster).
    #[arg(long, env = "NODE_ID")]
    id: u64,

    /// TCP address for Raft RPCs. Peers reach this node here.
    #[arg(long, env = "NODE_ADDR")]
    raft_addr: SocketAddr,

    /// TCP address of the client HTTP API.
    #[arg(long, env = "HTTP_ADDR")]
    http_addr: SocketAddr,

    /// Comma-separated peers, each ID=RAFT_ADDR/API_ADDR. Required unless bootstrapping.
    #[arg(long, env = "RAFT_PEERS", default_value = "")]
    peers: String,

    /// Seed a new cluster from this node and its peers.
    #[arg(long, env = "RAFT_BOOTSTRAP")]
    bootstrap: bool,

    /// Directory for persistent state.
    #[arg(long, env = "DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// Base election timeout in milliseconds; the actual timeout is randomized up to twice this.
    #[arg(long, default_value_t = 300)]
    election_timeout_ms: u64,

    #[arg(long, default_value_t = 100)]
    heartbeat_ms: u64,

    /// Applied entries between snapshots (0 disables compaction).
    #[arg(long, default_value_t = 1024)]
    snapshot_threshold: u64,

    #[arg(long, default_value_t = 10)]
    propose_timeout_secs: u64,

    #[arg(long, default_value_t = 5)]
    join_attempts: u32,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    let mut config = NodeConfig::new(
        NodeId::from(args.id),
        args.raft_addr,
        args.http_addr,
        args.data_dir,
    );
    config.peers = parse_peers(&args.peers)?;
    config.bootstrap = args.bootstrap;
    config.timers = TimerConfig {
        election_timeout: Duration::from_millis(args.election_timeout_ms),
        heartbeat_interval: Duration::from_millis(args.heartbeat_ms),
    };
    config.snapshot_threshold = args.snapshot_threshold;
    config.propose_timeout = Duration::from_secs(args.propose_timeout_secs);
    config.join_attempts = args.join_attempts;
    config.validate()?;

    let listener = tokio::net::TcpListener::bind(args.http_addr).await?;
    let node = KvNode::open(config).await?;
    router::serve(listener, node).await?;

    Ok(())
}
