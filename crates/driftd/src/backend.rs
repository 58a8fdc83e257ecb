//! Settings backend capability.
//!
//! The sentinel never knows how a setting is stored. Detectors read through
//! [`SettingReader`], the policy enforcer also writes through
//! [`SettingWriter`]. Two implementations ship with the daemon:
//!
//! - [`FsBackend`]: one file per setting below a root directory (sysctl style,
//!   `kernel\hostname` maps to `<root>/kernel/hostname`)
//! - [`MemoryBackend`]: an in-process map, used for demos and tests

use drift_common::config::{BackendConfig, BackendKind};
use drift_common::{ConfigError, SettingRef, Value};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;
use tokio::task::JoinError;
use tracing::info;

#[derive(Error, Debug)]
pub enum BackendError {
    #[error("setting {0} does not exist")]
    NotFound(SettingRef),

    #[error("failed to read {setting}: {reason}")]
    Read { setting: SettingRef, reason: String },

    #[error("failed to write {setting}: {reason}")]
    Write { setting: SettingRef, reason: String },

    #[error("I/O error on {setting}: {source}")]
    Io {
        setting: SettingRef,
        #[source]
        source: io::Error,
    },
}

pub trait SettingReader: Send + Sync {
    fn read(&self, setting: &SettingRef) -> Result<Value, BackendError>;
}

pub trait SettingWriter: Send + Sync {
    fn write(&self, setting: &SettingRef, value: &Value) -> Result<(), BackendError>;
}

/// Read and write access to settings
pub trait SettingBackend: SettingReader + SettingWriter {}

impl<T: SettingReader + SettingWriter + ?Sized> SettingBackend for T {}

/// Build the backend named by the configuration
pub fn from_config(config: &BackendConfig) -> Result<Arc<dyn SettingBackend>, ConfigError> {
    match config.kind {
        BackendKind::Fs => {
            info!("Using filesystem backend rooted at {}", config.root.display());
            Ok(Arc::new(FsBackend::new(&config.root)))
        }
        BackendKind::Memory => {
            let seed = config.seed_entries()?;
            info!("Using memory backend with {} seeded settings", seed.len());
            Ok(Arc::new(MemoryBackend::with_values(seed)))
        }
    }
}

/// Run one backend pass over `state` on the blocking pool and hand the state
/// back, so slow reads or writes never hold up a runtime worker
pub(crate) async fn blocking_pass<T, R, F>(state: T, pass: F) -> Result<(T, R), JoinError>
where
    T: Send + 'static,
    R: Send + 'static,
    F: FnOnce(&mut T) -> R + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let mut state = state;
        let out = pass(&mut state);
        (state, out)
    })
    .await
}

/// Settings stored as files below a root directory
#[derive(Debug, Clone)]
pub struct FsBackend {
    root: PathBuf,
}

impl FsBackend {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Resolve a setting to its file, refusing anything that escapes the root
    pub fn path_for(&self, setting: &SettingRef) -> Result<PathBuf, BackendError> {
        let mut path = self.root.clone();
        for part in setting.namespace_components().chain(std::iter::once(setting.name())) {
            let mut components = Path::new(part).components();
            match (components.next(), components.next()) {
                (Some(Component::Normal(_)), None) => path.push(part),
                _ => {
                    return Err(BackendError::Read {
                        setting: setting.clone(),
                        reason: format!("invalid path component '{}'", part),
                    })
                }
            }
        }
        Ok(path)
    }
}

impl SettingReader for FsBackend {
    fn read(&self, setting: &SettingRef) -> Result<Value, BackendError> {
        let path = self.path_for(setting)?;
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Value::infer(content.trim_end())),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(BackendError::NotFound(setting.clone())),
            Err(source) => Err(BackendError::Io {
                setting: setting.clone(),
                source,
            }),
        }
    }
}

impl SettingWriter for FsBackend {
    fn write(&self, setting: &SettingRef, value: &Value) -> Result<(), BackendError> {
        let path = self.path_for(setting)?;
        fs::write(&path, format!("{}\n", value)).map_err(|source| BackendError::Io {
            setting: setting.clone(),
            source,
        })
    }
}

/// In-process settings map with failure injection
#[derive(Debug, Default)]
pub struct MemoryBackend {
    values: RwLock<HashMap<SettingRef, Value>>,
    failing_reads: RwLock<HashSet<SettingRef>>,
    failing_writes: RwLock<HashSet<SettingRef>>,
    writes: AtomicU64,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_values(values: impl IntoIterator<Item = (SettingRef, Value)>) -> Self {
        let backend = Self::new();
        backend.write_guard().extend(values);
        backend
    }

    /// Change a value the way an external actor would
    pub fn set(&self, setting: &SettingRef, value: impl Into<Value>) {
        self.write_guard().insert(setting.clone(), value.into());
    }

    pub fn remove(&self, setting: &SettingRef) {
        self.write_guard().remove(setting);
    }

    pub fn get(&self, setting: &SettingRef) -> Option<Value> {
        self.read_guard().get(setting).cloned()
    }

    pub fn fail_reads(&self, setting: &SettingRef, failing: bool) {
        toggle(&self.failing_reads, setting, failing);
    }

    pub fn fail_writes(&self, setting: &SettingRef, failing: bool) {
        toggle(&self.failing_writes, setting, failing);
    }

    /// Successful writes performed through [`SettingWriter`]
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    fn read_guard(&self) -> RwLockReadGuard<'_, HashMap<SettingRef, Value>> {
        self.values.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write_guard(&self) -> RwLockWriteGuard<'_, HashMap<SettingRef, Value>> {
        self.values.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn toggle(set: &RwLock<HashSet<SettingRef>>, setting: &SettingRef, on: bool) {
    let mut set = set.write().unwrap_or_else(|poisoned| poisoned.into_inner());
    if on {
        set.insert(setting.clone());
    } else {
        set.remove(setting);
    }
}

fn contains(set: &RwLock<HashSet<SettingRef>>, setting: &SettingRef) -> bool {
    set.read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .contains(setting)
}

impl SettingReader for MemoryBackend {
    fn read(&self, setting: &SettingRef) -> Result<Value, BackendError> {
        if contains(&self.failing_reads, setting) {
            return Err(BackendError::Read {
                setting: setting.clone(),
                reason: "injected read failure".to_string(),
            });
        }
        self.get(setting)
            .ok_or_else(|| BackendError::NotFound(setting.clone()))
    }
}

impl SettingWriter for MemoryBackend {
    fn write(&self, setting: &SettingRef, value: &Value) -> Result<(), BackendError> {
        if contains(&self.failing_writes, setting) {
            return Err(BackendError::Write {
                setting: setting.clone(),
                reason: "injected write failure".to_string(),
            });
        }
        self.set(setting, value.clone());
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}
