//! entgraph - a generic, policy-enforced entity access engine.
//!
//! Entity types are described at startup with [`EntityDescriptor`]s and edge
//! descriptors; one generic query and mutation pipeline serves all of them.
//!
//! ## Call chain
//! Builder -> interceptors / hooks -> policy -> schema router -> executor ->
//! entities -> edge resolver -> history writer (mutations only).
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use entgraph::{EngineBuilder, EntityDescriptor, Field, MemoryExecutor, Policy, RequestContext};
//!
//! # async fn demo() -> entgraph::Result<()> {
//! let note = EntityDescriptor::builder("note")
//!     .audited()
//!     .field(Field::string("title").required())
//!     .build()?;
//! let client = EngineBuilder::new()
//!     .entity(note)
//!     .policy(Policy::allow_all("note"))
//!     .build(Arc::new(MemoryExecutor::new()))?;
//!
//! let ctx = RequestContext::new();
//! client.migrate(&ctx).await?;
//! let notes = client.entity("note")?;
//! let created = notes.create().set("title", "hello").save(&ctx).await?;
//! assert_eq!(notes.get(&ctx, created.id().clone()).await?, created);
//! # Ok(())
//! # }
//! ```

// Error taxonomy
pub mod error;

// Request-scoped state and settings
pub mod config;
pub mod context;
pub mod telemetry;

// Entity metadata
pub mod descriptor;
pub mod edge;
pub mod validate;

// Pipelines
pub mod entity;
pub mod hook;
pub mod interceptor;
pub mod mutation;
pub mod policy;
mod predicate;
pub mod query;

// Storage
pub mod executor;
pub mod history;
mod migrate;
pub mod schema;

// Engine assembly
pub mod client;

pub use entgraph_types::{
    Direction, EdgeLink, EdgeStep, EntityId, FieldType, IdType, Order, Predicate, Row, TableRef,
    TypeError, Value, ID_COLUMN,
};

pub use client::{Client, EngineBuilder, EntityClient, Tx};
pub use config::{EngineConfig, HistoryConfig};
pub use context::{CancelToken, Principal, RequestContext};
pub use descriptor::{DefaultValue, EntityDescriptor, Field, FieldDescriptor};
pub use edge::{EdgeDescriptor, EdgeStorage, Relation};
pub use entity::Entity;
pub use error::{ConstraintKind, EntError, Result, StoreError};
pub use executor::{Executor, MemoryExecutor, Transaction};
pub use history::{HistoryOp, HistoryQuery, HistoryRecord};
pub use hook::{EdgeChange, Hook, Mutation, MutationOutput, Next, Op};
pub use interceptor::Interceptor;
pub use mutation::{Create, CreateBulk, Delete, DeleteOne, Update, UpdateOne};
pub use policy::{Decision, MutationRule, Policy, PolicyRegistry, QueryRule};
pub use query::{Query, QueryOp, QueryPlan};
pub use schema::{SchemaConfig, SchemaPerTenant, SingleSchema, StaticTenants, TenantProvider};

#[cfg(feature = "database")]
pub use executor::PgExecutor;
