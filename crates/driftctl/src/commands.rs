//! Subcommand implementations

use crate::display;
use anyhow::{bail, Context, Result};
use drift_common::{Event, SentinelConfig};
use owo_colors::OwoColorize;
use std::path::Path;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::TcpStream;

const EVENT_TYPES: [&str; 4] = ["flipflop", "mutation", "lock", "connection"];

pub async fn watch(addr: &str, json: bool, filter: Option<&str>) -> Result<()> {
    if let Some(kind) = filter {
        if !EVENT_TYPES.contains(&kind) {
            bail!("Unknown event type '{}' (expected one of: {})", kind, EVENT_TYPES.join(", "));
        }
    }

    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("Failed to connect to driftd at {}", addr))?;
    eprintln!("{} {}", "Connected to".dimmed(), addr.bold());

    let mut lines = BufReader::new(stream).lines();
    let mut shown = 0u64;
    while let Some(line) = lines.next_line().await.context("Event stream failed")? {
        if line.trim().is_empty() {
            continue;
        }

        let event = match Event::from_json_line(&line) {
            Ok(event) => event,
            Err(e) => {
                eprintln!("{} malformed event line: {}", "warning:".yellow(), e);
                continue;
            }
        };

        if filter.is_some_and(|kind| kind != event.kind()) {
            continue;
        }

        if json {
            println!("{}", line);
        } else {
            println!("{}", display::summary(&event));
        }
        shown += 1;
    }

    eprintln!("{} ({} events)", "Stream closed by server".dimmed(), shown);
    Ok(())
}

pub fn check_config(path: &Path) -> Result<()> {
    let config = SentinelConfig::load(path).with_context(|| format!("Invalid config {}", path.display()))?;
    let policies = config.lock_policies()?;

    println!("{} {}", "✓".green(), path.display().bold());
    println!("  listen      {}", config.server.listen_addr);
    println!(
        "  backend     {:?} ({})",
        config.backend.kind,
        config.backend.root.display()
    );
    println!(
        "  drift       {} settings every {}ms, window {}s",
        config.drift.settings.len(),
        config.drift.poll_interval_ms,
        config.drift.window_secs
    );
    for setting in &config.drift.settings {
        println!("    {}", setting);
    }
    println!(
        "  snapshot    {} settings every {}s",
        config.snapshot_settings().len(),
        config.snapshot.poll_interval_secs
    );
    println!(
        "  locks       {} policies every {}s",
        policies.len(),
        config.enforcer.poll_interval_secs
    );
    for policy in &policies {
        let mode = if policy.restore_on_drift { "restore" } else { "report" };
        println!(
            "    {} = {} ({}, {})",
            policy.setting,
            policy.expected,
            policy.expected.kind().as_str(),
            mode
        );
    }
    Ok(())
}
