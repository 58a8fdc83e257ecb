//! Configuration management for driftd.
//!
//! Loads settings from /etc/drift-sentinel/config.toml or uses defaults.
//! Loaded once at startup; there is no hot reload.

use crate::error::ConfigError;
use crate::setting::{LockPolicy, SettingRef, Value, ValueKind};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Config file path
pub const CONFIG_PATH: &str = "/etc/drift-sentinel/config.toml";

/// Overrides `server.listen_addr`
pub const ENV_LISTEN: &str = "DRIFT_SENTINEL_LISTEN";

/// Overrides `backend.root`
pub const ENV_BACKEND_ROOT: &str = "DRIFT_SENTINEL_BACKEND_ROOT";

/// Broadcast listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the broadcast stream listens on
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Per-line write deadline for a client socket
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,

    /// Lines queued per client before it is considered stalled
    #[serde(default = "default_client_queue")]
    pub client_queue: usize,
}

fn default_listen_addr() -> String {
    "127.0.0.1:7878".to_string()
}

fn default_write_timeout_ms() -> u64 {
    500
}

fn default_client_queue() -> usize {
    256
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            write_timeout_ms: default_write_timeout_ms(),
            client_queue: default_client_queue(),
        }
    }
}

impl ServerConfig {
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.listen_addr
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("listen_addr '{}': {}", self.listen_addr, e)))
    }
}

/// Event bus sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Shared publish queue shared by every producer
    #[serde(default = "default_bus_capacity")]
    pub capacity: usize,

    /// Queue per subscriber behind the fan-out
    #[serde(default = "default_bus_capacity")]
    pub subscriber_capacity: usize,
}

fn default_bus_capacity() -> usize {
    1024
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            capacity: default_bus_capacity(),
            subscriber_capacity: default_bus_capacity(),
        }
    }
}

/// Flip-flop detection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftConfig {
    #[serde(default = "default_drift_poll_ms")]
    pub poll_interval_ms: u64,

    /// History retention per setting
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,

    /// Value changes inside the window needed to report a flip
    #[serde(default = "default_min_flips")]
    pub min_flips: usize,

    /// Observations inside the window needed to report a flip
    #[serde(default = "default_min_observations")]
    pub min_observations: usize,

    #[serde(default)]
    pub settings: Vec<SettingRef>,
}

fn default_drift_poll_ms() -> u64 {
    1_000
}

fn default_window_secs() -> u64 {
    10
}

fn default_min_flips() -> usize {
    2
}

fn default_min_observations() -> usize {
    3
}

impl Default for DriftConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_drift_poll_ms(),
            window_secs: default_window_secs(),
            min_flips: default_min_flips(),
            min_observations: default_min_observations(),
            settings: Vec::new(),
        }
    }
}

impl DriftConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Snapshot diffing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotConfig {
    #[serde(default = "default_snapshot_poll_secs")]
    pub poll_interval_secs: u64,

    /// Settings to snapshot; the drift list is used when empty
    #[serde(default)]
    pub settings: Vec<SettingRef>,
}

fn default_snapshot_poll_secs() -> u64 {
    30
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_snapshot_poll_secs(),
            settings: Vec::new(),
        }
    }
}

impl SnapshotConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnforcerConfig {
    #[serde(default = "default_enforcer_poll_secs")]
    pub poll_interval_secs: u64,
}

fn default_enforcer_poll_secs() -> u64 {
    5
}

impl Default for EnforcerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_enforcer_poll_secs(),
        }
    }
}

impl EnforcerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// One `[[lock]]` entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockEntry {
    pub setting: SettingRef,
    pub expected: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<ValueKind>,
    #[serde(default)]
    pub restore: bool,
}

impl LockEntry {
    pub fn to_policy(&self) -> Result<LockPolicy, ConfigError> {
        let expected = match self.kind {
            Some(kind) => kind.coerce(&self.expected)?,
            // Untyped values compare the way backends report them
            None => Value::infer(&self.expected.to_string()),
        };
        Ok(LockPolicy::new(self.setting.clone(), expected, self.restore))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Settings are files below `root`
    #[default]
    Fs,
    /// In-process map seeded from `seed`
    Memory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    #[serde(default)]
    pub kind: BackendKind,

    #[serde(default = "default_backend_root")]
    pub root: PathBuf,

    /// Initial values for the memory backend, keyed by `namespace\name`
    #[serde(default)]
    pub seed: BTreeMap<String, Value>,
}

fn default_backend_root() -> PathBuf {
    PathBuf::from("/proc/sys")
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            root: default_backend_root(),
            seed: BTreeMap::new(),
        }
    }
}

impl BackendConfig {
    pub fn seed_entries(&self) -> Result<Vec<(SettingRef, Value)>, ConfigError> {
        self.seed
            .iter()
            .map(|(key, value)| Ok((key.parse()?, value.clone())))
            .collect()
    }
}

/// Complete sentinel configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SentinelConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub bus: BusConfig,

    #[serde(default)]
    pub drift: DriftConfig,

    #[serde(default)]
    pub snapshot: SnapshotConfig,

    #[serde(default)]
    pub enforcer: EnforcerConfig,

    #[serde(default, rename = "lock")]
    pub locks: Vec<LockEntry>,

    #[serde(default)]
    pub backend: BackendConfig,
}

impl SentinelConfig {
    /// Load, apply environment overrides and validate
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let mut config = Self::from_toml_str(&content)?;
        config.apply_env_overrides();
        config.validate()?;

        info!(
            "Loaded config from {} ({} drift, {} snapshot, {} locked settings)",
            path.display(),
            config.drift.settings.len(),
            config.snapshot_settings().len(),
            config.locks.len()
        );
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    pub fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var(ENV_LISTEN) {
            debug!("{} overrides listen_addr with {}", ENV_LISTEN, addr);
            self.server.listen_addr = addr;
        }
        if let Ok(root) = std::env::var(ENV_BACKEND_ROOT) {
            debug!("{} overrides backend root with {}", ENV_BACKEND_ROOT, root);
            self.backend.root = PathBuf::from(root);
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.socket_addr()?;

        let nonzero = [
            ("drift.poll_interval_ms", self.drift.poll_interval_ms),
            ("drift.window_secs", self.drift.window_secs),
            ("snapshot.poll_interval_secs", self.snapshot.poll_interval_secs),
            ("enforcer.poll_interval_secs", self.enforcer.poll_interval_secs),
            ("server.write_timeout_ms", self.server.write_timeout_ms),
        ];
        for (field, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be greater than zero", field)));
            }
        }

        if self.drift.min_observations < 1 {
            return Err(ConfigError::Invalid("drift.min_observations must be at least 1".into()));
        }
        if self.drift.min_flips < 1 {
            return Err(ConfigError::Invalid("drift.min_flips must be at least 1".into()));
        }
        if self.bus.capacity == 0 || self.bus.subscriber_capacity == 0 || self.server.client_queue == 0 {
            return Err(ConfigError::Invalid("queue capacities must be greater than zero".into()));
        }

        let mut seen = HashSet::new();
        for entry in &self.locks {
            if !seen.insert(&entry.setting) {
                return Err(ConfigError::Invalid(format!(
                    "setting {} is locked more than once",
                    entry.setting
                )));
            }
            entry.to_policy()?;
        }

        self.backend.seed_entries()?;
        Ok(())
    }

    pub fn snapshot_settings(&self) -> Vec<SettingRef> {
        if self.snapshot.settings.is_empty() {
            self.drift.settings.clone()
        } else {
            self.snapshot.settings.clone()
        }
    }

    pub fn lock_policies(&self) -> Result<Vec<LockPolicy>, ConfigError> {
        self.locks.iter().map(LockEntry::to_policy).collect()
    }
}
