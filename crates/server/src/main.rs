//! Replication server binary.
//!
//! Boots a node from a JSON bootstrap configuration (or command-line
//! flags), starts the server task with a key-value state machine, and
//! exposes the HTTP replication endpoints until interrupted.

mod kv;

use anyhow::{Context, Result};
use clap::Parser;
use common::{NodeId, ServerConfig};
use consensus::{
    start_node, start_server, ClusterRoster, HttpState, HttpTransport, MemberKind, NodeConfig,
};
use kv::KvMachine;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;

const DEFAULT_LISTEN: &str = "127.0.0.1:5000";
const DEFAULT_DATA_DIR: &str = "./raft_data";

#[derive(Parser, Debug)]
#[command(name = "raft-server", about = "Replicated log consensus server")]
struct Args {
    /// Path to a JSON bootstrap configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// This node's id
    #[arg(long, default_value_t = 1)]
    node_id: NodeId,

    /// Address to listen on (ignored when --config names this node)
    #[arg(long, default_value = DEFAULT_LISTEN)]
    listen: String,

    /// Directory for log segments, snapshots, and metadata
    #[arg(long, default_value = DEFAULT_DATA_DIR)]
    data_dir: PathBuf,

    /// Voting peers as id=address pairs (repeatable)
    #[arg(long = "peer", value_parser = parse_peer)]
    peers: Vec<(NodeId, String)>,

    /// Non-voting observers as id=address pairs (repeatable)
    #[arg(long = "observer", value_parser = parse_peer)]
    observers: Vec<(NodeId, String)>,

    /// Join as a non-voting passive member
    #[arg(long)]
    passive: bool,
}

fn parse_peer(raw: &str) -> Result<(NodeId, String), String> {
    let (id, addr) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected id=address, got '{}'", raw))?;
    let id = id
        .parse::<NodeId>()
        .map_err(|e| format!("bad node id '{}': {}", id, e))?;
    Ok((id, addr.to_string()))
}

fn node_config(args: &Args) -> Result<NodeConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("reading config {:?}", path))?;
            let server: ServerConfig =
                serde_json::from_str(&contents).with_context(|| format!("parsing {:?}", path))?;
            NodeConfig::from_server_config(&server, args.node_id)?
        }
        None => {
            let mut config = NodeConfig::new(args.node_id, args.data_dir.clone())
                .with_listen_addr(args.listen.clone());
            for (id, addr) in &args.peers {
                config = config.with_peer(*id, addr.clone());
            }
            for (id, addr) in &args.observers {
                config = config.with_observer(*id, addr.clone());
            }
            config
        }
    };
    if args.passive {
        config = config.with_member_kind(MemberKind::Passive);
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let config = node_config(&args)?;

    let mut roster = ClusterRoster::from_peers(&config.peers);
    for (id, addr) in &config.observers {
        roster.add_node(*id, addr.clone());
    }
    let transport = Arc::new(HttpTransport::new(roster));

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .with_context(|| format!("bad listen address '{}'", config.listen_addr))?;

    let (handle, _server_task) = start_node(config.clone(), Box::new(KvMachine::new()), transport)?;
    let mut http = start_server(addr, HttpState::new(handle)).await?;

    println!("Server listening on {}", http.local_addr());
    println!("Node id: {}", config.node_id);
    println!("Data directory: {:?}", config.data_dir);
    println!();
    println!("Press Ctrl+C to shut down");

    signal::ctrl_c().await?;
    println!("\nShutdown signal received, stopping server...");
    http.shutdown();
    http.wait().await?;

    Ok(())
}
