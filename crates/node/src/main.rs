//! Rollup Node
//!
//! Main entry point: sequencer, aggregator, prover, relayer and the L1
//! contracts in one process. L2 state is persisted when a data directory is
//! given and survives restarts.

use anyhow::Result;
use clap::Parser;
use rollup_node::{NodeConfig, RollupNode};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Two-layer rollup node
#[derive(Parser, Debug)]
#[command(name = "rollup-node")]
#[command(about = "Sequencer, batch settlement and bridge for a validity rollup", long_about = None)]
struct Args {
    /// JSON config file; flags below override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// HTTP RPC bind address
    #[arg(long)]
    rpc_addr: Option<String>,

    /// Data directory for persistent state
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Block time in milliseconds
    #[arg(long)]
    block_time_ms: Option<u64>,

    /// Blocks per batch
    #[arg(long)]
    max_blocks_per_batch: Option<usize>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Args {
    fn node_config(&self) -> Result<NodeConfig> {
        let mut config = match &self.config {
            Some(path) => NodeConfig::load(path)?,
            None => NodeConfig::default(),
        };
        if let Some(addr) = &self.rpc_addr {
            config.rpc_addr = Some(addr.clone());
        }
        if let Some(dir) = &self.data_dir {
            config.data_dir = Some(dir.clone());
        }
        if let Some(ms) = self.block_time_ms {
            config.block_time_ms = ms;
        }
        if let Some(n) = self.max_blocks_per_batch {
            config.max_blocks_per_batch = n;
        }
        config.verbose |= self.verbose;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = args.node_config()?;
    tracing::info!("Starting rollup node");
    tracing::info!("  Block time: {}ms", config.block_time_ms);
    tracing::info!(
        "  Batches: {} blocks / {}ms, {} outstanding",
        config.max_blocks_per_batch,
        config.max_batch_wait_ms,
        config.max_outstanding_batches
    );
    tracing::info!("  Force inclusion window: {} blocks", config.force_inclusion_window);
    match &config.data_dir {
        Some(dir) => tracing::info!("  Data directory: {:?}", dir),
        None => tracing::info!("  No data directory, state is in-memory"),
    }

    let mut node = RollupNode::launch(config.clone()).await?;
    if let Some(addr) = config.rpc_addr {
        tracing::info!("  HTTP RPC: {}", addr);
        node.serve_rpc(addr);
    }

    tracing::info!("Press Ctrl+C to stop.");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;

    let height = node.height();
    node.shutdown().await;
    tracing::info!("Stopped at height {}", height);

    Ok(())
}
