//! Command-line surface and startup for the meshstore daemon.

use anyhow::{Context, Result};
use clap::Parser;
use meshstore_storage::Store;
use meshstore_sync::{NodeConfig, SyncNode};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

const SECS_PER_DAY: u64 = 24 * 60 * 60;

#[derive(Parser, Debug, Clone)]
#[command(name = "meshstore-node")]
#[command(about = "Replicated attribute store node")]
pub struct Args {
    /// Path to the database file
    #[arg(long, default_value = "meshstore.db")]
    pub db: PathBuf,

    /// Keep the database in memory; nothing survives a restart
    #[arg(long)]
    pub volatile: bool,

    /// Address to listen on
    #[arg(long, default_value = "0.0.0.0")]
    pub bind: String,

    /// Port to listen on
    #[arg(short, long, default_value = "7070")]
    pub port: u16,

    /// Peer address to keep connected (repeatable)
    #[arg(long = "peer", value_name = "HOST:PORT")]
    pub peers: Vec<String>,

    /// Idle delay between push passes, in milliseconds
    #[arg(long, default_value = "1000")]
    pub poll_interval_ms: u64,

    /// Drop tombstones older than this many days at startup
    #[arg(long, default_value = "30")]
    pub vacuum_days: u64,

    /// Enable verbose debug logging
    #[arg(short, long)]
    pub verbose: bool,
}

impl Args {
    pub fn node_config(&self) -> NodeConfig {
        NodeConfig {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            ..NodeConfig::default()
        }
    }

    pub fn vacuum_grace(&self) -> Duration {
        Duration::from_secs(self.vacuum_days.saturating_mul(SECS_PER_DAY))
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

/// Opens the store named by `args` and vacuums it.
pub fn open_store(args: &Args) -> Result<Store> {
    let store = if args.volatile {
        info!("Using volatile in-memory store");
        Store::open_in_memory().context("Failed to open in-memory store")?
    } else {
        info!("Opening store at {:?}", args.db);
        Store::open(&args.db).with_context(|| format!("Failed to open store at {:?}", args.db))?
    };
    store
        .vacuum(args.vacuum_grace())
        .context("Failed to vacuum store")?;
    Ok(store)
}

/// Opens the store, binds the listener, and starts replicating.
pub async fn start(args: &Args) -> Result<(SyncNode, SocketAddr)> {
    let store = Arc::new(open_store(args)?);
    let node = SyncNode::new(store, args.node_config());
    let addr = node
        .listen(args.listen_addr())
        .await
        .with_context(|| format!("Failed to listen on {}", args.listen_addr()))?;
    for peer in &args.peers {
        node.add_peer(peer.clone());
    }
    node.start();
    Ok((node, addr))
}
