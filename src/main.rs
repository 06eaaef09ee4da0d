//! Tunrats - Transparent Tunneling Client
//!
//! This is the main entry point for the Tunrats application.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use tunrats::config::load_config;
use tunrats::device::Device;
use tunrats::error::{SetupStage, TunratsError};
use tunrats::handler::create_handler;
use tunrats::{Config, Pipeline};

/// Tunrats - transparent tunneling client with fake-IP DNS hijacking
#[derive(Parser, Debug)]
#[command(name = "tunrats")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Enable JSON logging format
    #[arg(long)]
    json_log: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logging
    setup_logging(&args.log_level, args.json_log)?;

    // Load configuration
    let config = load_config(&args.config)?;

    info!("Tunrats v{}", tunrats::VERSION);
    info!("Configuration loaded from: {:?}", args.config);
    info!(
        "Upstream: {}",
        config.server.url.as_deref().unwrap_or("direct")
    );

    let handler = create_handler(&config.server)
        .map_err(|e| TunratsError::setup(SetupStage::Handler, e))?;
    let device = open_device(&config).map_err(|e| TunratsError::setup(SetupStage::Device, e))?;

    let pipeline = Pipeline::start(config, device, handler).await?;

    tokio::select! {
        _ = shutdown_signal() => {}
        _ = pipeline.stopped() => {
            warn!("Pipeline stopped on its own, shutting down...");
        }
    }

    pipeline.shutdown().await;
    Ok(())
}

#[cfg(feature = "tun-device")]
fn open_device(config: &Config) -> Result<Arc<dyn Device>> {
    let device = tunrats::device::TunDevice::create(&config.tun.name, config.tun.mtu as usize)?;
    Ok(Arc::new(device))
}

#[cfg(not(feature = "tun-device"))]
fn open_device(_config: &Config) -> Result<Arc<dyn Device>> {
    anyhow::bail!("built without the tun-device feature; no packet source available")
}

/// Wait for Ctrl+C or SIGTERM
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {
                        info!("Received Ctrl+C, shutting down...");
                    }
                    _ = sigterm.recv() => {
                        info!("Received SIGTERM, shutting down...");
                    }
                }
                return;
            }
            Err(e) => warn!("Failed to setup SIGTERM handler: {}", e),
        }
    }

    let _ = tokio::signal::ctrl_c().await;
    info!("Received Ctrl+C, shutting down...");
}

/// Setup logging based on configuration
fn setup_logging(level: &str, json: bool) -> Result<()> {
    let level = match level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    if json {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .json()
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    } else {
        let subscriber = FmtSubscriber::builder()
            .with_max_level(level)
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber)?;
    }

    Ok(())
}
