//! The strand server daemon.
//!
//! Starts one node: the replicated log, gossip membership, and the shared
//! Raft + client RPC listener. Runs until SIGINT/SIGTERM, then shuts the
//! agent down gracefully.
//!
//! ```bash
//! # Bootstrap a fresh single-node cluster
//! strandd --data-dir /var/lib/strand --bootstrap
//!
//! # Join an existing cluster
//! strandd --data-dir /var/lib/strand --node-name node-b \
//!     --start-join-addrs 10.0.0.1:8401
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::info;
use tracing_subscriber::EnvFilter;

use strand_server::{Agent, AgentConfig};

/// strand log service daemon
#[derive(Parser, Debug)]
#[command(name = "strandd", version, about = "Replicated commit log server")]
struct Args {
    /// Configuration file (TOML); flags override it
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Unique node name within the cluster
    #[arg(long, env = "STRAND_NODE_NAME")]
    node_name: Option<String>,

    /// Gossip bind address
    #[arg(long, env = "STRAND_BIND_ADDR")]
    bind_addr: Option<String>,

    /// Port for the shared Raft + client RPC listener
    #[arg(long, env = "STRAND_RPC_PORT")]
    rpc_port: Option<u16>,

    /// Data directory
    #[arg(short = 'd', long, env = "STRAND_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Gossip addresses of existing members to join (comma separated)
    #[arg(long, value_delimiter = ',', env = "STRAND_START_JOIN_ADDRS")]
    start_join_addrs: Vec<String>,

    /// Bootstrap a fresh cluster with this node
    #[arg(long)]
    bootstrap: bool,

    /// ACL policy file
    #[arg(long, env = "STRAND_ACL_POLICY_FILE")]
    acl_policy_file: Option<PathBuf>,

    /// Log filter (overrides RUST_LOG)
    #[arg(long, default_value = "info", env = "STRAND_LOG")]
    log_level: String,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(args.log_level.clone()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .init();

    let config = build_config(&args)?;

    if args.print_config {
        println!("{}", config.to_toml()?);
        return Ok(());
    }

    run(config).await
}

fn build_config(args: &Args) -> Result<AgentConfig> {
    let mut config = match &args.config {
        Some(path) => AgentConfig::from_file(path)?,
        None => {
            let data_dir = args
                .data_dir
                .clone()
                .context("--data-dir is required without a config file")?;
            AgentConfig::new(data_dir)
        }
    };

    if let Some(name) = &args.node_name {
        config.node_name = name.clone();
    }
    if let Some(addr) = &args.bind_addr {
        config.bind_addr = addr.clone();
    }
    if let Some(port) = args.rpc_port {
        config.rpc_port = port;
    }
    if let Some(dir) = &args.data_dir {
        config.data_dir = dir.clone();
    }
    if !args.start_join_addrs.is_empty() {
        config.start_join_addrs = args.start_join_addrs.clone();
    }
    if args.bootstrap {
        config.raft.bootstrap = true;
    }
    if let Some(path) = &args.acl_policy_file {
        config.acl_policy_file = Some(path.clone());
    }

    Ok(config)
}

async fn run(config: AgentConfig) -> Result<()> {
    let agent = Agent::new(config).await?;

    info!(
        rpc_addr = %agent.rpc_addr(),
        gossip_addr = %agent.gossip_addr()?,
        "serving"
    );

    shutdown_signal().await;
    info!("shutdown signal received");

    agent.shutdown().await;
    info!("goodbye");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
