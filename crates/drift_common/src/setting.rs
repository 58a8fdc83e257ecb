//! Setting identity and observed values.
//!
//! A [`SettingRef`] names one monitored entry as `namespace\name`. The name is
//! everything after the last backslash, so registry-style namespaces such as
//! `HKLM\SOFTWARE\Policies` keep their inner separators.

use crate::error::{SettingRefParseError, ValueCoerceError};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::borrow::Cow;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// Identifier of one monitored setting
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SettingRef {
    namespace: String,
    name: String,
}

impl SettingRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Namespace split into its components (`\` and `/` both separate)
    pub fn namespace_components(&self) -> impl Iterator<Item = &str> {
        self.namespace
            .split(['\\', '/'])
            .filter(|part| !part.is_empty())
    }
}

impl fmt::Display for SettingRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\\{}", self.namespace, self.name)
    }
}

impl FromStr for SettingRef {
    type Err = SettingRefParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (namespace, name) = s
            .rsplit_once('\\')
            .ok_or_else(|| SettingRefParseError::MissingSeparator(s.to_string()))?;

        if namespace.is_empty() {
            return Err(SettingRefParseError::EmptyNamespace(s.to_string()));
        }
        if name.is_empty() {
            return Err(SettingRefParseError::EmptyName(s.to_string()));
        }

        Ok(Self::new(namespace, name))
    }
}

impl Serialize for SettingRef {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for SettingRef {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Observed value of a setting.
///
/// The sentinel only compares and prints values, it never interprets them.
/// Equality and hashing go through the text form, so `Integer(1)` and
/// `String("1")` are the same value no matter which side typed it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Boolean(bool),
    Integer(i64),
    String(String),
}

impl Value {
    /// Parse backend or wire text into the narrowest matching variant
    pub fn infer(raw: &str) -> Self {
        match raw {
            "true" => Value::Boolean(true),
            "false" => Value::Boolean(false),
            _ => match raw.parse::<i64>() {
                Ok(n) => Value::Integer(n),
                Err(_) => Value::String(raw.to_string()),
            },
        }
    }

    /// Text form used for comparison and on the wire
    pub fn as_text(&self) -> Cow<'_, str> {
        match self {
            Value::String(s) => Cow::Borrowed(s),
            other => Cow::Owned(other.to_string()),
        }
    }

    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Boolean(_) => ValueKind::Boolean,
            Value::Integer(_) => ValueKind::Integer,
            Value::String(_) => ValueKind::String,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Boolean(b) => write!(f, "{}", b),
            Value::Integer(n) => write!(f, "{}", n),
            Value::String(s) => f.write_str(s),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Boolean(a), Value::Boolean(b)) => a == b,
            (Value::Integer(a), Value::Integer(b)) => a == b,
            _ => self.as_text() == other.as_text(),
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_text().hash(state);
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Integer(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Boolean(b)
    }
}

/// Declared type of a locked value
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    String,
    Integer,
    Boolean,
}

impl ValueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::String => "string",
            ValueKind::Integer => "integer",
            ValueKind::Boolean => "boolean",
        }
    }

    /// Convert a configured value to this kind
    pub fn coerce(&self, value: &Value) -> Result<Value, ValueCoerceError> {
        let fail = || ValueCoerceError {
            value: value.to_string(),
            kind: self.as_str(),
        };

        match (self, value) {
            (ValueKind::String, v) => Ok(Value::String(v.to_string())),
            (ValueKind::Integer, Value::Integer(n)) => Ok(Value::Integer(*n)),
            (ValueKind::Integer, Value::String(s)) => {
                s.trim().parse().map(Value::Integer).map_err(|_| fail())
            }
            (ValueKind::Integer, Value::Boolean(_)) => Err(fail()),
            (ValueKind::Boolean, Value::Boolean(b)) => Ok(Value::Boolean(*b)),
            (ValueKind::Boolean, Value::Integer(0)) => Ok(Value::Boolean(false)),
            (ValueKind::Boolean, Value::Integer(1)) => Ok(Value::Boolean(true)),
            (ValueKind::Boolean, Value::String(s)) => match s.trim() {
                "true" => Ok(Value::Boolean(true)),
                "false" => Ok(Value::Boolean(false)),
                _ => Err(fail()),
            },
            (ValueKind::Boolean, Value::Integer(_)) => Err(fail()),
        }
    }
}

/// A locked setting and the value it must hold
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockPolicy {
    pub setting: SettingRef,
    pub expected: Value,
    pub restore_on_drift: bool,
}

impl LockPolicy {
    pub fn new(setting: SettingRef, expected: impl Into<Value>, restore_on_drift: bool) -> Self {
        Self {
            setting,
            expected: expected.into(),
            restore_on_drift,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_setting_ref() {
        let r: SettingRef = "kernel\\hostname".parse().unwrap();
        assert_eq!(r.namespace(), "kernel");
        assert_eq!(r.name(), "hostname");
        assert_eq!(r.to_string(), "kernel\\hostname");
    }

    #[test]
    fn test_parse_nested_namespace_uses_last_separator() {
        let r: SettingRef = "HKLM\\SOFTWARE\\Policies\\DeferDays".parse().unwrap();
        assert_eq!(r.namespace(), "HKLM\\SOFTWARE\\Policies");
        assert_eq!(r.name(), "DeferDays");
        let parts: Vec<_> = r.namespace_components().collect();
        assert_eq!(parts, vec!["HKLM", "SOFTWARE", "Policies"]);
    }

    #[test]
    fn test_parse_rejects_malformed() {
        assert_eq!(
            "hostname".parse::<SettingRef>(),
            Err(SettingRefParseError::MissingSeparator("hostname".into()))
        );
        assert!(matches!(
            "\\hostname".parse::<SettingRef>(),
            Err(SettingRefParseError::EmptyNamespace(_))
        ));
        assert!(matches!(
            "kernel\\".parse::<SettingRef>(),
            Err(SettingRefParseError::EmptyName(_))
        ));
    }

    #[test]
    fn test_setting_ref_identity_is_by_value() {
        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(SettingRef::new("net", "ip_forward"));
        assert!(set.contains(&SettingRef::new("net", "ip_forward")));
        assert!(!set.contains(&SettingRef::new("net", "IP_FORWARD")));
    }

    #[test]
    fn test_value_infer() {
        assert_eq!(Value::infer("true"), Value::Boolean(true));
        assert_eq!(Value::infer("-12"), Value::Integer(-12));
        assert_eq!(Value::infer("72h"), Value::String("72h".into()));
        assert_eq!(Value::infer(""), Value::String(String::new()));
        assert_eq!(Value::infer("-12").kind(), ValueKind::Integer);
        assert_eq!(Value::infer("false").kind(), ValueKind::Boolean);
    }

    #[test]
    fn test_value_equality_is_textual() {
        use std::collections::HashSet;

        assert_eq!(Value::Integer(0), Value::String("0".into()));
        assert_eq!(Value::String("true".into()), Value::Boolean(true));
        assert_ne!(Value::Integer(1), Value::Boolean(true));
        assert_ne!(Value::String("01".into()), Value::Integer(1));

        let set: HashSet<Value> = [Value::Integer(7), Value::String("7".into())].into_iter().collect();
        assert_eq!(set.len(), 1);
    }

    #[test]
    fn test_value_kind_coerce() {
        let v = Value::String("42".into());
        assert_eq!(ValueKind::Integer.coerce(&v).unwrap(), Value::Integer(42));
        assert_eq!(
            ValueKind::String.coerce(&Value::Integer(42)).unwrap(),
            Value::String("42".into())
        );
        assert_eq!(
            ValueKind::Boolean.coerce(&Value::Integer(1)).unwrap(),
            Value::Boolean(true)
        );
        let err = ValueKind::Integer.coerce(&Value::String("72h".into())).unwrap_err();
        assert_eq!(err.kind, "integer");
    }
}
