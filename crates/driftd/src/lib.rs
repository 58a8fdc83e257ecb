//! Drift sentinel daemon library - exposes the components for testing.

pub mod backend;
pub mod broadcast;
pub mod bus;
pub mod drift;
pub mod history;
pub mod policy;
pub mod sentinel;
pub mod snapshot;

pub use backend::{BackendError, FsBackend, MemoryBackend, SettingBackend, SettingReader, SettingWriter};
pub use broadcast::{BroadcastServer, ClientSet};
pub use bus::EventBus;
pub use drift::DriftDetector;
pub use history::HistoryWindow;
pub use policy::PolicyEnforcer;
pub use sentinel::Sentinel;
pub use snapshot::{diff_snapshots, take_snapshot, Snapshot, SnapshotDiffer};
