//! Error taxonomy for the entity access engine.
//!
//! `EntError` is what callers see. `StoreError` is what executors return;
//! the pipelines translate it with [`EntError::from_store`] so that constraint
//! violations keep their original cause.

use thiserror::Error;

use crate::entity::Entity;

pub type Result<T> = std::result::Result<T, EntError>;

/// Kind of store-level constraint that rejected a statement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintKind {
    Unique,
    ForeignKey,
    NotNull,
    Check,
}

impl std::fmt::Display for ConstraintKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConstraintKind::Unique => "unique",
            ConstraintKind::ForeignKey => "foreign key",
            ConstraintKind::NotNull => "not null",
            ConstraintKind::Check => "check",
        };
        f.write_str(s)
    }
}

/// Errors raised by an [`Executor`](crate::executor::Executor) implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{kind} constraint violated: {message}")]
    Constraint {
        kind: ConstraintKind,
        message: String,
    },

    #[error("transaction already finished")]
    TxDone,

    #[error("unknown table {0}")]
    UnknownTable(String),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl StoreError {
    pub fn constraint(kind: ConstraintKind, message: impl Into<String>) -> Self {
        StoreError::Constraint {
            kind,
            message: message.into(),
        }
    }

    pub fn is_constraint(&self) -> bool {
        matches!(self, StoreError::Constraint { .. })
    }
}

/// Main error type for engine operations.
#[derive(Debug, Error)]
pub enum EntError {
    #[error("{entity} not found")]
    NotFound { entity: String },

    #[error("{entity} not singular")]
    NotSingular { entity: String },

    #[error("validation failed for {entity}.{field}{}: {reason}", item_suffix(.item))]
    Validation {
        entity: String,
        field: String,
        item: Option<usize>,
        reason: String,
    },

    #[error("constraint failed on {entity}: {source}")]
    Constraint {
        entity: String,
        #[source]
        source: StoreError,
    },

    #[error("edge \"{edge}\" of {entity} was not eager-loaded")]
    EdgeNotLoaded { entity: String, edge: String },

    #[error("permission denied on {entity} ({op}): {reason}")]
    PermissionDenied {
        entity: String,
        op: String,
        reason: String,
    },

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("operation cancelled at {stage}")]
    Cancelled { stage: String },

    #[error("consistency fault loading edge \"{edge}\": {message}")]
    Consistency { edge: String, message: String },

    #[error("history write failed after commit of {} row(s): {source}", .committed.len())]
    HistoryWrite {
        committed: Vec<Entity>,
        #[source]
        source: Box<EntError>,
    },

    #[error("transaction already committed or rolled back")]
    TxClosed,

    #[error("store error: {0}")]
    Store(#[source] StoreError),
}

fn item_suffix(item: &Option<usize>) -> String {
    match item {
        Some(i) => format!(" (item {})", i),
        None => String::new(),
    }
}

impl EntError {
    pub fn validation(
        entity: impl Into<String>,
        field: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        EntError::Validation {
            entity: entity.into(),
            field: field.into(),
            item: None,
            reason: reason.into(),
        }
    }

    pub fn denied(entity: impl Into<String>, op: impl Into<String>, reason: impl Into<String>) -> Self {
        EntError::PermissionDenied {
            entity: entity.into(),
            op: op.into(),
            reason: reason.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        EntError::Configuration(message.into())
    }

    /// Translate an executor failure, keeping constraint violations wrapped.
    pub fn from_store(entity: &str, err: StoreError) -> Self {
        match err {
            e @ StoreError::Constraint { .. } => EntError::Constraint {
                entity: entity.to_string(),
                source: e,
            },
            StoreError::TxDone => EntError::TxClosed,
            other => EntError::Store(other),
        }
    }

    /// Attach a batch item index to a validation error.
    pub(crate) fn at_item(self, index: usize) -> Self {
        match self {
            EntError::Validation {
                entity,
                field,
                reason,
                ..
            } => EntError::Validation {
                entity,
                field,
                item: Some(index),
                reason,
            },
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, EntError::NotFound { .. })
    }

    pub fn is_not_singular(&self) -> bool {
        matches!(self, EntError::NotSingular { .. })
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, EntError::Validation { .. })
    }

    pub fn is_constraint(&self) -> bool {
        matches!(self, EntError::Constraint { .. })
    }

    pub fn is_edge_not_loaded(&self) -> bool {
        matches!(self, EntError::EdgeNotLoaded { .. })
    }

    pub fn is_permission_denied(&self) -> bool {
        matches!(self, EntError::PermissionDenied { .. })
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, EntError::Configuration(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, EntError::Cancelled { .. })
    }

    /// HTTP-style classification for transports sitting on top of the engine.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotFound { .. } => 404,
            Self::NotSingular { .. } => 409,
            Self::Validation { .. } => 422,
            Self::Constraint { .. } => 409,
            Self::PermissionDenied { .. } => 403,
            Self::Cancelled { .. } => 499,
            Self::TxClosed => 409,
            Self::EdgeNotLoaded { .. }
            | Self::Configuration(_)
            | Self::Consistency { .. }
            | Self::HistoryWrite { .. }
            | Self::Store(_) => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_display_names_item_and_field() {
        let err = EntError::validation("note", "title", "missing required field").at_item(2);
        assert_eq!(
            err.to_string(),
            "validation failed for note.title (item 2): missing required field"
        );
    }

    #[test]
    fn constraint_keeps_store_cause() {
        let err = EntError::from_store(
            "note",
            StoreError::constraint(ConstraintKind::Unique, "notes.id = 1"),
        );
        assert!(err.is_constraint());
        let source = std::error::Error::source(&err).unwrap();
        assert_eq!(source.to_string(), "unique constraint violated: notes.id = 1");
    }

    #[test]
    fn finished_transaction_maps_to_tx_closed() {
        let err = EntError::from_store("note", StoreError::TxDone);
        assert!(matches!(err, EntError::TxClosed));
    }

    #[test]
    fn http_status_distinguishes_denied_from_absent() {
        assert_eq!(EntError::denied("note", "query", "nope").http_status(), 403);
        assert_eq!(
            EntError::NotFound {
                entity: "note".into()
            }
            .http_status(),
            404
        );
        assert_eq!(EntError::config("x").http_status(), 500);
    }
}
