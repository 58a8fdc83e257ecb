//! Broadcast event schema.
//!
//! Every event is serialized as one JSON object per line:
//!
//! ```text
//! {"type":"flipflop","setting":"ns\\name","status":"flipping","flips":4,"ts":"<RFC3339>"}
//! {"type":"mutation","setting":"ns\\name","old":"<v>","new":"<v>","ts":"<RFC3339>"}
//! {"type":"lock","setting":"ns\\name","expected":"<v>","actual":"<v>","restored":true,"ts":"<RFC3339>"}
//! {"type":"connection","process":"name","pid":1234,"remote":"ip:port","ts":"<RFC3339>"}
//! ```
//!
//! Values always travel as JSON strings.

use crate::setting::{SettingRef, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FlipStatus {
    Flipping,
}

/// Sentinel event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    /// Setting oscillating inside the drift window
    #[serde(rename = "flipflop")]
    FlipFlop {
        setting: SettingRef,
        status: FlipStatus,
        /// Observations held in the window when the flip was detected
        #[serde(rename = "flips")]
        flip_count: usize,
        ts: DateTime<Utc>,
    },

    /// One-time change between two snapshots
    #[serde(rename = "mutation")]
    Mutation {
        setting: SettingRef,
        #[serde(with = "value_text")]
        old: Value,
        #[serde(with = "value_text")]
        new: Value,
        ts: DateTime<Utc>,
    },

    /// Locked setting found with the wrong value
    #[serde(rename = "lock")]
    LockViolation {
        setting: SettingRef,
        #[serde(with = "value_text")]
        expected: Value,
        #[serde(with = "value_text")]
        actual: Value,
        restored: bool,
        ts: DateTime<Utc>,
    },

    /// Established connection reported by an inventory collector
    #[serde(rename = "connection")]
    ConnectionObserved {
        process: String,
        pid: u32,
        #[serde(rename = "remote")]
        remote_endpoint: String,
        ts: DateTime<Utc>,
    },
}

impl Event {
    pub fn flip_flop(setting: SettingRef, flip_count: usize) -> Self {
        Event::FlipFlop {
            setting,
            status: FlipStatus::Flipping,
            flip_count,
            ts: Utc::now(),
        }
    }

    pub fn mutation(setting: SettingRef, old: Value, new: Value) -> Self {
        Event::Mutation {
            setting,
            old,
            new,
            ts: Utc::now(),
        }
    }

    pub fn lock_violation(setting: SettingRef, expected: Value, actual: Value, restored: bool) -> Self {
        Event::LockViolation {
            setting,
            expected,
            actual,
            restored,
            ts: Utc::now(),
        }
    }

    pub fn connection(process: impl Into<String>, pid: u32, remote_endpoint: impl Into<String>) -> Self {
        Event::ConnectionObserved {
            process: process.into(),
            pid,
            remote_endpoint: remote_endpoint.into(),
            ts: Utc::now(),
        }
    }

    /// Wire tag of this variant
    pub fn kind(&self) -> &'static str {
        match self {
            Event::FlipFlop { .. } => "flipflop",
            Event::Mutation { .. } => "mutation",
            Event::LockViolation { .. } => "lock",
            Event::ConnectionObserved { .. } => "connection",
        }
    }

    /// Setting that triggered the event, if any
    pub fn setting(&self) -> Option<&SettingRef> {
        match self {
            Event::FlipFlop { setting, .. }
            | Event::Mutation { setting, .. }
            | Event::LockViolation { setting, .. } => Some(setting),
            Event::ConnectionObserved { .. } => None,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Event::FlipFlop { ts, .. }
            | Event::Mutation { ts, .. }
            | Event::LockViolation { ts, .. }
            | Event::ConnectionObserved { ts, .. } => *ts,
        }
    }

    /// Serialize to one newline-terminated JSON line
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        Ok(serde_json::to_string(self)? + "\n")
    }

    pub fn from_json_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim_end())
    }
}

mod value_text {
    use crate::setting::Value;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Value, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Value, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Value::infer(&raw))
    }
}
