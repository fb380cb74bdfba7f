//! Meterlink bridge binary.

use anyhow::{Context, Result};
use clap::Parser;
use meterlink::bridge::BridgeSupervisor;
use meterlink::bus::ZenohBusConnector;
use meterlink::config::MeterlinkConfig;
use meterlink::drivers::DriverRegistry;
use meterlink::transport::ModbusTcpConnector;
use std::path::PathBuf;
use tokio::sync::watch;
use tracing::info;

/// Modbus register telemetry to Zenoh bridge.
#[derive(Parser, Debug)]
#[command(name = "meterlink")]
#[command(about = "Polls Modbus meters and inverters and publishes to Zenoh")]
#[command(version)]
struct Args {
    /// Path to configuration file (JSON5 format)
    #[arg(short, long, default_value = "meterlink.json5")]
    config: PathBuf,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = MeterlinkConfig::load_from_file(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;

    let mut logging = config.logging.clone();
    if let Some(level) = &args.log_level {
        logging.level = level.clone();
    }
    meterlink_common::init_tracing(&logging)
        .map_err(|e| anyhow::anyhow!("Failed to init tracing: {}", e))?;

    info!("Starting meterlink");
    info!("Loaded configuration from {:?}", args.config);

    let registry = DriverRegistry::builtin();
    let bridge = BridgeSupervisor::from_config(
        &config,
        registry,
        ZenohBusConnector::new(config.zenoh.clone(), config.bus.format),
        ModbusTcpConnector::new(config.modbus.timeout()),
    )
    .context("Invalid configuration")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut bridge = tokio::spawn(bridge.run(shutdown_rx));

    tokio::select! {
        result = &mut bridge => {
            result.context("Bridge task failed")??;
            info!("Meterlink stopped");
            return Ok(());
        }
        _ = shutdown_signal() => {
            info!("Received shutdown signal");
        }
    }

    let _ = shutdown_tx.send(true);
    bridge.await.context("Bridge task failed")??;
    info!("Meterlink stopped");

    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
