//! Entity identifiers.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::value::{TypeError, Value};

/// Identifier kind declared by an entity type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdType {
    /// String ids; generated as UUID v4 when the caller does not assign one.
    String,
    /// Integer ids; generated by the store when the caller does not assign one.
    Int,
}

/// The identifier of one entity.
///
/// Hashable and ordered so it can key the edge resolver's demultiplexing maps.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EntityId {
    Int(i64),
    Str(String),
}

impl EntityId {
    pub fn new_uuid() -> Self {
        EntityId::Str(uuid::Uuid::new_v4().to_string())
    }

    pub fn id_type(&self) -> IdType {
        match self {
            EntityId::Int(_) => IdType::Int,
            EntityId::Str(_) => IdType::String,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            EntityId::Str(s) => Some(s),
            EntityId::Int(_) => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            EntityId::Int(i) => Some(*i),
            EntityId::Str(_) => None,
        }
    }

    pub fn to_value(&self) -> Value {
        match self {
            EntityId::Int(i) => Value::Int(*i),
            EntityId::Str(s) => Value::String(s.clone()),
        }
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityId::Int(i) => write!(f, "{}", i),
            EntityId::Str(s) => f.write_str(s),
        }
    }
}

impl From<&str> for EntityId {
    fn from(v: &str) -> Self {
        EntityId::Str(v.to_string())
    }
}

impl From<String> for EntityId {
    fn from(v: String) -> Self {
        EntityId::Str(v)
    }
}

impl From<&String> for EntityId {
    fn from(v: &String) -> Self {
        EntityId::Str(v.clone())
    }
}

impl From<i64> for EntityId {
    fn from(v: i64) -> Self {
        EntityId::Int(v)
    }
}

impl From<EntityId> for Value {
    fn from(v: EntityId) -> Self {
        v.to_value()
    }
}

impl From<&EntityId> for Value {
    fn from(v: &EntityId) -> Self {
        v.to_value()
    }
}

impl TryFrom<&Value> for EntityId {
    type Error = TypeError;

    fn try_from(value: &Value) -> Result<Self, Self::Error> {
        match value {
            Value::Int(i) => Ok(EntityId::Int(*i)),
            Value::String(s) => Ok(EntityId::Str(s.clone())),
            other => Err(TypeError::InvalidId(other.to_string())),
        }
    }
}
