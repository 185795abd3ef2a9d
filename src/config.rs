//! Engine configuration.
//!
//! Loaded once at startup, either from `ENTGRAPH_*` environment variables or
//! from YAML.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{EntError, Result};

pub const DEFAULT_HISTORY_SUFFIX: &str = "_history";
pub const DEFAULT_MAX_BATCH_SIZE: usize = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Master switch for the history shadow writer.
    pub enabled: bool,
    /// Appended to an entity table name to form its history table.
    pub table_suffix: String,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            table_suffix: DEFAULT_HISTORY_SUFFIX.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Namespace used for tables no tenant mapping mentions.
    pub default_schema: Option<String>,
    pub history: HistoryConfig,
    /// Upper bound on items in one bulk create.
    pub max_batch_size: usize,
    /// When set, `SchemaPerTenant` maps tenant `t` to schema `{prefix}{t}`.
    pub schema_per_tenant_prefix: Option<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_schema: None,
            history: HistoryConfig::default(),
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            schema_per_tenant_prefix: None,
        }
    }
}

impl EngineConfig {
    /// Read `ENTGRAPH_*` variables, loading `.env` first when present.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();
        let max_batch_size = match std::env::var("ENTGRAPH_MAX_BATCH_SIZE") {
            Ok(v) => v.parse::<usize>().map_err(|_| {
                EntError::config(format!("ENTGRAPH_MAX_BATCH_SIZE must be a positive integer, got '{}'", v))
            })?,
            Err(_) => defaults.max_batch_size,
        };

        let config = Self {
            default_schema: env_opt("ENTGRAPH_DEFAULT_SCHEMA"),
            history: HistoryConfig {
                enabled: env_bool("ENTGRAPH_HISTORY_ENABLED", defaults.history.enabled),
                table_suffix: env_opt("ENTGRAPH_HISTORY_TABLE_SUFFIX")
                    .unwrap_or(defaults.history.table_suffix),
            },
            max_batch_size,
            schema_per_tenant_prefix: env_opt("ENTGRAPH_SCHEMA_PER_TENANT_PREFIX"),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|e| EntError::config(format!("invalid engine config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| EntError::config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_yaml_str(&text)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_batch_size == 0 {
            return Err(EntError::config("max_batch_size must be greater than zero"));
        }
        if self.history.table_suffix.is_empty() {
            return Err(EntError::config("history.table_suffix must not be empty"));
        }
        Ok(())
    }

    /// Physical name of the history table for `table`.
    pub fn history_table(&self, table: &str) -> String {
        format!("{}{}", table, self.history.table_suffix)
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.to_lowercase().as_str(), "true" | "1" | "yes"),
        Err(_) => default,
    }
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
