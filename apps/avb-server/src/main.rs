//! avb-server - standalone headless AVB (IEEE 1722) stream handler daemon.
//!
//! Owns the NIC, the gPTP wallclock, the packet pool, and the TX/RX
//! engines for one Ethernet interface; streams are created through the
//! control API rather than discovered automatically by this binary.

mod bootstrap;
mod config;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;

use crate::config::DaemonConfig;

/// Standalone headless AVB stream handler daemon.
#[derive(Parser, Debug)]
#[command(name = "avb-server")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (YAML).
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (error, warn, info, debug, trace).
    #[arg(short, long, default_value = "info", env = "AVB_LOG_LEVEL")]
    log_level: log::LevelFilter,

    /// NIC interface name (overrides config file).
    #[arg(short, long, env = "AVB_INTERFACE")]
    interface: Option<String>,

    /// Data directory for persistent state.
    #[arg(short = 'd', long, env = "AVB_DATA_DIR")]
    data_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    env_logger::Builder::new()
        .filter_level(args.log_level)
        .format_timestamp_millis()
        .init();

    log::info!("avb-server v{}", env!("CARGO_PKG_VERSION"));

    let mut config = DaemonConfig::load(args.config.as_deref()).context("failed to load configuration")?;

    if let Some(interface) = args.interface {
        config.interface = interface;
    }
    if let Some(data_dir) = args.data_dir {
        config.data_dir = Some(data_dir);
    }

    log::info!(
        "configuration: interface={}, packet_pool_capacity={}, rx_direct_dma={}",
        config.interface,
        config.packet_pool_capacity,
        config.rx_direct_dma,
    );

    let daemon = bootstrap::bootstrap(&config).context("failed to bootstrap engine context")?;

    log::info!("engine running, waiting for shutdown signal");
    shutdown_signal().await;

    log::info!("shutdown signal received, stopping engine");
    daemon.shutdown();

    log::info!("shutdown complete");
    Ok(())
}

/// Waits for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
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
