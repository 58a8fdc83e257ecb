//! Sentinel supervisor.
//!
//! Owns the bus, the detectors and the broadcast server, runs them as tasks
//! and tears everything down on cancellation.

use crate::backend::{self, SettingBackend};
use crate::broadcast::BroadcastServer;
use crate::bus::EventBus;
use crate::drift::DriftDetector;
use crate::policy::PolicyEnforcer;
use crate::snapshot::SnapshotDiffer;
use anyhow::{Context, Result};
use drift_common::SentinelConfig;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub struct Sentinel {
    config: SentinelConfig,
    backend: Arc<dyn SettingBackend>,
    bus: EventBus,
}

impl Sentinel {
    pub fn new(config: SentinelConfig, backend: Arc<dyn SettingBackend>) -> Self {
        let bus = EventBus::new(config.bus.capacity, config.bus.subscriber_capacity);
        Self { config, backend, bus }
    }

    /// Build with the backend named in the configuration
    pub fn from_config(config: SentinelConfig) -> Result<Self> {
        let backend = backend::from_config(&config.backend).context("Failed to create settings backend")?;
        Ok(Self::new(config, backend))
    }

    pub fn config(&self) -> &SentinelConfig {
        &self.config
    }

    /// Bus handle for producers outside the sentinel (connection inventory)
    pub fn publisher(&self) -> EventBus {
        self.bus.clone()
    }

    /// Bind the configured listener and serve until cancelled
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let addr = self.config.server.socket_addr()?;
        let server = BroadcastServer::bind(addr, self.config.server.write_timeout(), self.config.server.client_queue)
            .await
            .with_context(|| format!("Failed to bind broadcast listener on {}", addr))?;
        self.serve(server, cancel).await
    }

    /// Run every component against an already bound server
    pub async fn serve(self, server: BroadcastServer, cancel: CancellationToken) -> Result<()> {
        let policies = self.config.lock_policies()?;
        let snapshot_settings = self.config.snapshot_settings();
        let events = self.bus.subscribe();

        info!(
            "Sentinel v{} starting on {}",
            env!("CARGO_PKG_VERSION"),
            server.local_addr()
        );

        let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        let bus = self.bus.clone();
        let token = cancel.clone();
        tasks.push(("fanout", tokio::spawn(async move { bus.run_fanout(token).await })));
        tasks.push(("broadcast", tokio::spawn(server.run(events, cancel.clone()))));

        if self.config.drift.settings.is_empty() {
            info!("No drift settings configured, flip-flop detection disabled");
        } else {
            let drift = DriftDetector::from_config(&self.config.drift);
            tasks.push((
                "drift",
                tokio::spawn(drift.run(self.backend.clone(), self.bus.clone(), cancel.clone())),
            ));
        }

        if snapshot_settings.is_empty() {
            info!("No snapshot settings configured, mutation detection disabled");
        } else {
            let differ = SnapshotDiffer::new(snapshot_settings, self.config.snapshot.poll_interval());
            tasks.push((
                "snapshot",
                tokio::spawn(differ.run(self.backend.clone(), self.bus.clone(), cancel.clone())),
            ));
        }

        if policies.is_empty() {
            info!("No lock policies configured, enforcement disabled");
        } else {
            let enforcer = PolicyEnforcer::new(policies, self.config.enforcer.poll_interval());
            tasks.push((
                "enforcer",
                tokio::spawn(enforcer.run(self.backend.clone(), self.bus.clone(), cancel.clone())),
            ));
        }

        cancel.cancelled().await;
        info!("Shutdown requested, stopping {} tasks", tasks.len());

        for (name, task) in tasks {
            if let Err(e) = task.await {
                error!("Task {} ended abnormally: {}", name, e);
            }
        }

        if self.bus.dropped() > 0 || self.bus.fanout_dropped() > 0 {
            warn!(
                "Events lost during run: {} at publish, {} at fan-out",
                self.bus.dropped(),
                self.bus.fanout_dropped()
            );
        }
        info!("Sentinel stopped after publishing {} events", self.bus.published());
        Ok(())
    }
}
