//! The relational executor seam.
//!
//! The engine never builds SQL. It hands fully-routed statement specs to an
//! [`Executor`]; [`MemoryExecutor`] evaluates them in process and, with the
//! `database` feature, [`PgExecutor`] renders them for PostgreSQL.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use entgraph_types::{FieldType, Order, Predicate, Row, TableRef, Value};
use serde::{Deserialize, Serialize};

use crate::error::StoreError;

pub mod memory;
#[cfg(feature = "database")]
pub mod postgres;

pub use memory::MemoryExecutor;
#[cfg(feature = "database")]
pub use postgres::PgExecutor;

/// Extra leading column carrying the junction owner key in M2M edge loads.
pub const EDGE_OWNER_COLUMN: &str = "__edge_owner";

pub type StoreResult<T> = std::result::Result<T, StoreError>;

// ============================================================================
// STATEMENT SPECS
// ============================================================================

/// Restrict a target-table read to rows reachable through a junction table
/// from the given owners. Each result row carries the owner key in
/// [`EDGE_OWNER_COLUMN`]; a target linked to two owners appears twice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JunctionJoin {
    pub table: TableRef,
    pub owner_column: String,
    pub target_column: String,
    pub owners: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuerySpec {
    pub table: TableRef,
    pub id_column: String,
    /// Projection; `None` selects every column.
    pub columns: Option<Vec<String>>,
    pub predicate: Option<Predicate>,
    pub order: Vec<Order>,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    /// `SELECT DISTINCT`.
    pub unique: bool,
    pub through: Option<JunctionJoin>,
}

impl QuerySpec {
    pub fn new(table: TableRef, id_column: impl Into<String>) -> Self {
        Self {
            table,
            id_column: id_column.into(),
            columns: None,
            predicate: None,
            order: Vec::new(),
            limit: None,
            offset: None,
            unique: false,
            through: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InsertSpec {
    pub table: TableRef,
    pub id_column: String,
    pub rows: Vec<Row>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateSpec {
    pub table: TableRef,
    pub predicate: Option<Predicate>,
    /// Columns to assign; `Value::Null` clears.
    pub set: Row,
    /// Elements appended to `Strings` columns.
    pub append: BTreeMap<String, Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeleteSpec {
    pub table: TableRef,
    pub predicate: Option<Predicate>,
}

/// Junction rows `(owner, target)` to insert or remove.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkSpec {
    pub table: TableRef,
    pub owner_column: String,
    pub target_column: String,
    pub pairs: Vec<(Value, Value)>,
}

// ============================================================================
// TABLE DEFINITIONS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub ty: FieldType,
    pub nullable: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OnDelete {
    #[default]
    Restrict,
    Cascade,
    SetNull,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub column: String,
    pub references: TableRef,
    pub ref_column: String,
    pub on_delete: OnDelete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TableSchema {
    pub columns: Vec<ColumnDef>,
    pub primary_key: Vec<String>,
    /// Integer column filled by the store when an insert omits it.
    pub auto_increment: Option<String>,
    /// Single-column unique constraints.
    pub unique: Vec<String>,
    pub foreign_keys: Vec<ForeignKey>,
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns.iter().find(|c| c.name == name)
    }
}

// ============================================================================
// TRAITS
// ============================================================================

#[async_trait]
pub trait Executor: Send + Sync {
    /// Create the table if it does not exist.
    async fn ensure_table(&self, table: &TableRef, schema: &TableSchema) -> StoreResult<()>;

    async fn query(&self, spec: &QuerySpec) -> StoreResult<Vec<Row>>;

    /// Number of matching rows, honouring `limit`/`offset`.
    async fn count(&self, spec: &QuerySpec) -> StoreResult<usize>;

    /// Insert all rows atomically; returns them as stored (generated ids filled).
    async fn insert(&self, spec: &InsertSpec) -> StoreResult<Vec<Row>>;

    /// Returns the post-update rows.
    async fn update(&self, spec: &UpdateSpec) -> StoreResult<Vec<Row>>;

    async fn delete(&self, spec: &DeleteSpec) -> StoreResult<usize>;

    /// Insert junction rows; existing pairs are left alone.
    async fn link(&self, spec: &LinkSpec) -> StoreResult<()>;

    async fn unlink(&self, spec: &LinkSpec) -> StoreResult<usize>;

    async fn begin(&self) -> StoreResult<Arc<dyn Transaction>>;
}

/// An open transaction. Statements go through the [`Executor`] methods.
#[async_trait]
pub trait Transaction: Executor {
    async fn commit(&self) -> StoreResult<()>;

    async fn rollback(&self) -> StoreResult<()>;
}
