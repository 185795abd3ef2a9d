//! entgraph Types - Level 1 Foundation Types
//!
//! Pure data structures shared by the engine and every executor backend:
//!
//! - [`Value`] / [`FieldType`] - the dynamic column value model
//! - [`EntityId`] / [`IdType`] - entity identifiers (string or integer)
//! - [`TableRef`] - a physical table address (namespace + name)
//! - [`Predicate`] / [`EdgeStep`] - composable filter expressions, including
//!   edge traversal
//! - [`Order`] - sort terms
//!
//! ## Critical Rules
//!
//! 1. **NO ENGINE LOGIC** - evaluation lives in executors, policy in the engine
//! 2. **NO WORKSPACE DEPENDENCIES**
//! 3. **SERIALIZABLE** - every type supports serde so specs can be logged/shipped

use std::collections::BTreeMap;

pub mod id;
pub mod order;
pub mod predicate;
pub mod table;
pub mod value;

pub use id::{EntityId, IdType};
pub use order::{Direction, Order};
pub use predicate::{EdgeLink, EdgeStep, Predicate};
pub use table::TableRef;
pub use value::{FieldType, TypeError, Value};

// ============================================================================
// ROWS
// ============================================================================

/// A materialized row: column name to value.
///
/// Ordered so that debug output and serialized specs are deterministic.
pub type Row = BTreeMap<String, Value>;

/// Column every entity table uses for its primary key.
pub const ID_COLUMN: &str = "id";
