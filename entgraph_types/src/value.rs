//! Dynamic column values.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use thiserror::Error;

// ============================================================================
// FIELD TYPES
// ============================================================================

/// Storage type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Bool,
    Int,
    Float,
    String,
    Time,
    /// A list of strings (labels, domains, tags).
    Strings,
    Json,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FieldType::Bool => "bool",
            FieldType::Int => "int",
            FieldType::Float => "float",
            FieldType::String => "string",
            FieldType::Time => "time",
            FieldType::Strings => "strings",
            FieldType::Json => "json",
        };
        f.write_str(s)
    }
}

/// Conversion failures between [`Value`] and concrete Rust types.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TypeError {
    #[error("expected {expected} value, found {found}")]
    Mismatch { expected: FieldType, found: String },

    #[error("value cannot be used as an id: {0}")]
    InvalidId(String),

    #[error("invalid timestamp '{0}'")]
    InvalidTime(String),
}

// ============================================================================
// VALUE
// ============================================================================

/// A single column value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Time(DateTime<Utc>),
    Strings(Vec<String>),
    Json(serde_json::Value),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Storage type of this value, `None` for `Null`.
    pub fn field_type(&self) -> Option<FieldType> {
        match self {
            Value::Null => None,
            Value::Bool(_) => Some(FieldType::Bool),
            Value::Int(_) => Some(FieldType::Int),
            Value::Float(_) => Some(FieldType::Float),
            Value::String(_) => Some(FieldType::String),
            Value::Time(_) => Some(FieldType::Time),
            Value::Strings(_) => Some(FieldType::Strings),
            Value::Json(_) => Some(FieldType::Json),
        }
    }

    /// True when the value can be stored in a column of type `ty`.
    /// `Null` fits every type; integers are accepted by float columns.
    pub fn fits(&self, ty: FieldType) -> bool {
        match (self, ty) {
            (Value::Null, _) => true,
            (Value::Int(_), FieldType::Float) => true,
            (_, FieldType::Json) => true,
            (v, ty) => v.field_type() == Some(ty),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(f) => Some(*f),
            Value::Int(i) => Some(*i as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_time(&self) -> Option<DateTime<Utc>> {
        match self {
            Value::Time(t) => Some(*t),
            _ => None,
        }
    }

    pub fn as_strings(&self) -> Option<&[String]> {
        match self {
            Value::Strings(v) => Some(v),
            _ => None,
        }
    }

    /// Total-ish ordering used by filters and sorting.
    ///
    /// Values of different types do not compare, except int/float. `Null`
    /// sorts before everything else so that ordering stays deterministic.
    pub fn compare(&self, other: &Value) -> Option<Ordering> {
        match (self, other) {
            (Value::Null, Value::Null) => Some(Ordering::Equal),
            (Value::Null, _) => Some(Ordering::Less),
            (_, Value::Null) => Some(Ordering::Greater),
            (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
            (Value::Int(a), Value::Int(b)) => Some(a.cmp(b)),
            (Value::Float(a), Value::Float(b)) => a.partial_cmp(b),
            (Value::Int(a), Value::Float(b)) => (*a as f64).partial_cmp(b),
            (Value::Float(a), Value::Int(b)) => a.partial_cmp(&(*b as f64)),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (Value::Time(a), Value::Time(b)) => Some(a.cmp(b)),
            (Value::Strings(a), Value::Strings(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }

    /// JSON rendering used by serialized rows and JSONB backends.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Int(i) => serde_json::Value::from(*i),
            Value::Float(f) => serde_json::Value::from(*f),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Time(t) => serde_json::Value::String(t.to_rfc3339()),
            Value::Strings(v) => serde_json::Value::from(v.clone()),
            Value::Json(j) => j.clone(),
        }
    }

    /// Decode a JSON value into a typed [`Value`] for a column of type `ty`.
    pub fn from_json(json: serde_json::Value, ty: FieldType) -> Result<Value, TypeError> {
        use serde_json::Value as J;

        let mismatch = |found: &J| TypeError::Mismatch {
            expected: ty,
            found: found.to_string(),
        };

        match (ty, json) {
            (_, J::Null) => Ok(Value::Null),
            (FieldType::Json, j) => Ok(Value::Json(j)),
            (FieldType::Bool, J::Bool(b)) => Ok(Value::Bool(b)),
            (FieldType::Int, J::Number(n)) => n.as_i64().map(Value::Int).ok_or_else(|| mismatch(&J::Number(n))),
            (FieldType::Float, J::Number(n)) => n.as_f64().map(Value::Float).ok_or_else(|| mismatch(&J::Number(n))),
            (FieldType::String, J::String(s)) => Ok(Value::String(s)),
            (FieldType::Time, J::String(s)) => DateTime::parse_from_rfc3339(&s)
                .map(|t| Value::Time(t.with_timezone(&Utc)))
                .map_err(|_| TypeError::InvalidTime(s)),
            (FieldType::Strings, J::Array(items)) => items
                .into_iter()
                .map(|item| match item {
                    J::String(s) => Ok(s),
                    other => Err(mismatch(&other)),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(Value::Strings),
            (_, other) => Err(mismatch(&other)),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Null => f.write_str("NULL"),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Int(i) => write!(f, "{}", i),
            Value::Float(v) => write!(f, "{}", v),
            Value::String(s) => write!(f, "{:?}", s),
            Value::Time(t) => write!(f, "{}", t.to_rfc3339()),
            Value::Strings(v) => write!(f, "{:?}", v),
            Value::Json(j) => write!(f, "{}", j),
        }
    }
}

// ── Conversions ──

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v as i64)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Time(v)
    }
}

impl From<Vec<String>> for Value {
    fn from(v: Vec<String>) -> Self {
        Value::Strings(v)
    }
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        Value::Json(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(Value::Null)
    }
}
