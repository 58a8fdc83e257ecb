//! Drift Control - CLI client for the drift sentinel
//!
//! Streams live events from a running daemon and checks configuration files.

mod commands;
mod display;

use anyhow::Result;
use clap::{Parser, Subcommand};
use drift_common::config::CONFIG_PATH;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "driftctl")]
#[command(about = "Drift Sentinel - event stream client", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Stream events from a running daemon
    Watch {
        /// Broadcast address of the daemon
        #[arg(long, default_value = "127.0.0.1:7878")]
        addr: String,

        /// Print raw JSON lines instead of summaries
        #[arg(long)]
        json: bool,

        /// Only show one event type (flipflop, mutation, lock, connection)
        #[arg(long)]
        filter: Option<String>,
    },

    /// Load and validate a configuration file
    CheckConfig {
        #[arg(long, default_value = CONFIG_PATH)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Watch { addr, json, filter } => commands::watch(&addr, json, filter.as_deref()).await,
        Commands::CheckConfig { config } => commands::check_config(&config),
    }
}
