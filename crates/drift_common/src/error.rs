//! Error types shared by the sentinel crates.

use std::path::PathBuf;
use thiserror::Error;

/// A setting name that does not have the `namespace\name` shape.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SettingRefParseError {
    #[error("setting '{0}' has no namespace separator (expected namespace\\name)")]
    MissingSeparator(String),

    #[error("setting '{0}' has an empty namespace")]
    EmptyNamespace(String),

    #[error("setting '{0}' has an empty name")]
    EmptyName(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("cannot convert '{value}' to {kind}")]
pub struct ValueCoerceError {
    pub value: String,
    pub kind: &'static str,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid setting reference: {0}")]
    Setting(#[from] SettingRefParseError),

    #[error("invalid lock policy: {0}")]
    Coerce(#[from] ValueCoerceError),

    #[error("invalid config: {0}")]
    Invalid(String),
}
