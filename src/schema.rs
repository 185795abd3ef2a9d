//! Tenant/schema routing.
//!
//! A [`TenantProvider`] turns the request's tenant into a [`SchemaConfig`].
//! The resulting [`SchemaSnapshot`] is resolved once per logical request and
//! cached on the `RequestContext`, so every statement of that request
//! (entity, history and junction tables alike) addresses the same namespace.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use entgraph_types::TableRef;
use serde::{Deserialize, Serialize};

use crate::context::RequestContext;
use crate::error::{EntError, Result};

/// Physical table name to namespace, with a fallback namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaConfig {
    #[serde(default)]
    pub default_schema: Option<String>,
    /// Per-table overrides keyed by physical table name.
    #[serde(default)]
    pub tables: HashMap<String, String>,
}

impl SchemaConfig {
    pub fn new(default_schema: Option<String>) -> Self {
        Self {
            default_schema,
            tables: HashMap::new(),
        }
    }

    pub fn with_table(mut self, table: impl Into<String>, schema: impl Into<String>) -> Self {
        self.tables.insert(table.into(), schema.into());
        self
    }

    pub fn schema_for(&self, table: &str) -> Option<&str> {
        self.tables
            .get(table)
            .map(String::as_str)
            .or(self.default_schema.as_deref())
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| EntError::config(format!("invalid schema config: {}", e)))
    }
}

/// Namespace resolution frozen for one request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaSnapshot {
    pub tenant: Option<String>,
    pub config: SchemaConfig,
}

impl SchemaSnapshot {
    pub fn table(&self, name: &str) -> TableRef {
        TableRef::in_schema(self.config.schema_for(name).map(str::to_string), name)
    }
}

#[async_trait]
pub trait TenantProvider: Send + Sync {
    async fn schema_config(&self, tenant: Option<&str>) -> Result<SchemaConfig>;
}

// ── Providers ──

/// Same configuration for every tenant.
#[derive(Debug, Clone, Default)]
pub struct SingleSchema {
    config: SchemaConfig,
}

impl SingleSchema {
    pub fn new(config: SchemaConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl TenantProvider for SingleSchema {
    async fn schema_config(&self, _tenant: Option<&str>) -> Result<SchemaConfig> {
        Ok(self.config.clone())
    }
}

/// A fixed tenant map, typically loaded from YAML at startup.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StaticTenants {
    #[serde(default)]
    pub tenants: HashMap<String, SchemaConfig>,
    /// Used for requests that carry no tenant.
    #[serde(default)]
    pub fallback: Option<SchemaConfig>,
}

impl StaticTenants {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn tenant(mut self, tenant: impl Into<String>, config: SchemaConfig) -> Self {
        self.tenants.insert(tenant.into(), config);
        self
    }

    pub fn fallback(mut self, config: SchemaConfig) -> Self {
        self.fallback = Some(config);
        self
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| EntError::config(format!("invalid tenant map: {}", e)))
    }
}

#[async_trait]
impl TenantProvider for StaticTenants {
    async fn schema_config(&self, tenant: Option<&str>) -> Result<SchemaConfig> {
        match tenant {
            Some(t) => self
                .tenants
                .get(t)
                .cloned()
                .ok_or_else(|| EntError::denied("tenant", "resolve", format!("unknown tenant '{}'", t))),
            None => self.fallback.clone().ok_or_else(|| {
                EntError::denied("tenant", "resolve", "request carries no tenant")
            }),
        }
    }
}

/// One namespace per tenant: tenant `t` maps to `{prefix}{t}`. Tables listed
/// in `shared` keep their pinned namespace for every tenant.
#[derive(Debug, Clone)]
pub struct SchemaPerTenant {
    prefix: String,
    shared: SchemaConfig,
}

impl SchemaPerTenant {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            shared: SchemaConfig::default(),
        }
    }

    pub fn shared(mut self, shared: SchemaConfig) -> Self {
        self.shared = shared;
        self
    }
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[async_trait]
impl TenantProvider for SchemaPerTenant {
    async fn schema_config(&self, tenant: Option<&str>) -> Result<SchemaConfig> {
        let Some(tenant) = tenant else {
            return Ok(self.shared.clone());
        };
        if !is_identifier(tenant) {
            return Err(EntError::validation(
                "tenant",
                "tenant",
                format!("'{}' is not a valid namespace identifier", tenant),
            ));
        }
        Ok(SchemaConfig {
            default_schema: Some(format!("{}{}", self.prefix, tenant)),
            tables: self.shared.tables.clone(),
        })
    }
}

/// The request's snapshot, resolving it on first use.
pub(crate) async fn snapshot(
    provider: &dyn TenantProvider,
    ctx: &RequestContext,
) -> Result<Arc<SchemaSnapshot>> {
    let snap = ctx
        .schema_cell()
        .get_or_try_init(|| async {
            let tenant = ctx.tenant().map(str::to_string);
            let config = provider.schema_config(tenant.as_deref()).await?;
            tracing::debug!(tenant = ?tenant, default_schema = ?config.default_schema, "schema snapshot resolved");
            Ok::<_, EntError>(Arc::new(SchemaSnapshot { tenant, config }))
        })
        .await?;
    Ok(snap.clone())
}
