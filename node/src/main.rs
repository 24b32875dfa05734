//! meshstore replication daemon
//!
//! Serves one store to its peers and keeps it converged with them.
//!
//! Usage:
//!   meshstore-node --db data/node.db --port 7070 --peer 10.0.0.2:7070

use anyhow::{Context, Result};
use clap::Parser;
use meshstore_node::{start, Args};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let log_level = if args.verbose { Level::DEBUG } else { Level::INFO };
    FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .compact()
        .init();

    info!("meshstore node starting...");
    let (node, addr) = start(&args).await?;

    println!("\n========================================");
    println!("  meshstore node running");
    println!("========================================");
    println!("  Name:     {}", node.name());
    println!("  Session:  {}", node.session_id());
    println!("  Listen:   {}", addr);
    println!("  Peers:    {}", args.peers.len());
    println!("========================================\n");

    tokio::signal::ctrl_c()
        .await
        .context("Failed to wait for shutdown signal")?;
    node.shutdown().await;
    info!("meshstore node stopped");
    Ok(())
}
