//! Drift Common - shared types for the drift sentinel daemon and its clients.
//!
//! Holds the setting identity and value types, the broadcast event schema and
//! the configuration file model. Nothing in here touches the network or a
//! settings backend.

pub mod config;
pub mod error;
pub mod event;
pub mod setting;

pub use config::SentinelConfig;
pub use error::{ConfigError, SettingRefParseError, ValueCoerceError};
pub use event::{Event, FlipStatus};
pub use setting::{LockPolicy, SettingRef, Value, ValueKind};
