//! `NebulaStream` worker node

mod config;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use nes_core::RuntimeContext;
use nes_network::NetworkManager;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::config::WorkerConfig;

/// NebulaStream worker - executes query fragments and exchanges tuple buffers
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "nes-worker.toml")]
    config: PathBuf,

    /// Log level
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Data port, overrides the configuration file
    #[arg(long)]
    data_port: Option<u16>,

    /// Query worker threads, overrides the configuration file
    #[arg(long)]
    worker_threads: Option<usize>,
}

fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                format!(
                    "nes_worker={level},nes_core={level},nes_network={level},nes_storage={level}",
                    level = args.log_level
                )
                .into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting NebulaStream worker");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("Config file: {}", args.config.display());

    let mut config = WorkerConfig::load(&args.config)?;
    if let Some(port) = args.data_port {
        config.data_port = port;
    }
    if let Some(threads) = args.worker_threads {
        config.worker_threads = threads;
    }
    config.validate()?;

    let runtime = RuntimeContext::new(config.runtime()).context("failed to start execution runtime")?;
    let network = NetworkManager::new(config.network()).context("failed to start exchange server")?;
    info!(
        node_id = %config.node_id(),
        data_addr = %network.local_addr(),
        worker_threads = config.worker_threads,
        spill_dir = %config.sinks().spill_dir.display(),
        "worker ready"
    );

    network
        .handle()
        .block_on(tokio::signal::ctrl_c())
        .context("failed to listen for ctrl-c")?;
    info!("Shutting down");

    network.shutdown();
    runtime.shutdown();
    Ok(())
}
