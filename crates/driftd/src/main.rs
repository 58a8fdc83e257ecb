//! Drift Sentinel Daemon - watches settings for drift and streams events.
//!
//! Detects flip-flopping and mutated settings, enforces locked values and
//! broadcasts every finding as newline-delimited JSON over TCP.

use anyhow::{Context, Result};
use clap::Parser;
use drift_common::config::CONFIG_PATH;
use drift_common::SentinelConfig;
use driftd::Sentinel;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "driftd")]
#[command(about = "Drift Sentinel - configuration drift detection daemon", long_about = None)]
#[command(version)]
struct Args {
    /// Path to the configuration file
    #[arg(long, default_value = CONFIG_PATH)]
    config: PathBuf,

    /// Override the broadcast listen address (e.g. 0.0.0.0:7878)
    #[arg(long)]
    listen: Option<String>,

    /// Log filter, used when RUST_LOG is unset (e.g. "debug", "driftd=trace")
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(args.log_level.as_deref().unwrap_or("info")))
        .context("Invalid log filter")?;
    tracing_subscriber::fmt().with_env_filter(filter).with_target(false).init();

    info!("Drift Sentinel v{} starting", env!("CARGO_PKG_VERSION"));

    let mut config = SentinelConfig::load(&args.config)
        .with_context(|| format!("Failed to load config from {}", args.config.display()))?;
    if let Some(listen) = args.listen {
        info!("Listen address overridden to {}", listen);
        config.server.listen_addr = listen;
        config.validate().context("Invalid --listen address")?;
    }

    let sentinel = Sentinel::from_config(config)?;

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_signal(cancel.clone()));

    sentinel.run(cancel).await?;
    info!("Shutdown complete");
    Ok(())
}

/// Cancel on Ctrl-C, or SIGTERM on Unix
async fn shutdown_signal(cancel: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl-C"),
        _ = terminate => info!("Received SIGTERM"),
    }
    cancel.cancel();
}
