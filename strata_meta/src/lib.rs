//! Static cluster configuration: physical databases, logical tables and
//! their sharding rules, id generator and executor settings.
//!
//! The file is read once at startup, validated, and shared behind an `Arc`.
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use strata_id::{IdError, IdGeneratorConfig};
use strata_pool::PoolConfig;
use strata_shard::{ShardError, StrategyConfig};
use strata_types::Value;
use thiserror::Error;
use tracing::info;

/// Result type alias for configuration loading.
pub type Result<T> = std::result::Result<T, ConfigError>;

/// Fatal configuration problems. The process should refuse to start.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("no databases configured")]
    NoDatabases,
    #[error("database {0:?} declared twice")]
    DuplicateDatabase(String),
    #[error("database {0:?}: pool max_active must be at least 1")]
    EmptyPool(String),
    #[error("table {0:?} declared twice")]
    DuplicateTable(String),
    #[error("table {table}: {requested} databases requested but only {available} configured")]
    DatabaseCount { table: String, requested: u32, available: usize },
    #[error("table {table}: tables_per_database must be at least 1")]
    ZeroTables { table: String },
    #[error("table {table}: column {column:?} is not declared")]
    UnknownColumn { table: String, column: String },
    #[error("table {table}: {dimension} strategy invalid: {source}")]
    Strategy {
        table: String,
        dimension: &'static str,
        #[source]
        source: ShardError,
    },
    #[error("id generator: {0}")]
    IdGenerator(#[from] IdError),
    #[error("executor: {0}")]
    Executor(String),
}

/// Root of the configuration file.
#[derive(Debug, Clone, Deserialize)]
pub struct ClusterConfig {
    pub id_generator: IdGeneratorConfig,
    #[serde(default)]
    pub executor: ExecutorSettings,
    pub databases: Vec<DatabaseConfig>,
    #[serde(default)]
    pub tables: Vec<TableConfig>,
}

fn default_target_timeout_ms() -> u64 {
    5_000
}

/// Fan-out settings of the execution coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ExecutorSettings {
    /// Concurrent per-target sub-operations within one logical operation.
    /// Defaults to the number of physical databases.
    #[serde(default)]
    pub max_workers: Option<usize>,
    /// Deadline for each per-target sub-operation.
    #[serde(default = "default_target_timeout_ms")]
    pub target_timeout_ms: u64,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self { max_workers: None, target_timeout_ms: default_target_timeout_ms() }
    }
}

impl ExecutorSettings {
    pub fn target_timeout(&self) -> Duration {
        Duration::from_millis(self.target_timeout_ms)
    }
}

/// One physical database. `url` is interpreted by the driver registered for
/// its scheme; `memory://` is built in.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DatabaseConfig {
    pub name: String,
    pub url: String,
    #[serde(default)]
    pub pool: PoolConfig,
}

impl DatabaseConfig {
    /// URL scheme, e.g. `memory` for `memory://ds0`.
    pub fn scheme(&self) -> &str {
        self.url.split_once("://").map_or("", |(scheme, _)| scheme)
    }
}

/// How the primary key is filled when a record arrives without one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyGenerator {
    #[default]
    Snowflake,
    /// Callers always supply the key.
    None,
}

/// Sharding of one dimension (database or table).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ShardingConfig {
    pub column: String,
    pub strategy: StrategyConfig,
}

/// A logical table and how it is split over physical tables.
#[derive(Debug, Clone, Deserialize)]
pub struct TableConfig {
    pub name: String,
    /// Declared columns. When empty, any column is accepted.
    #[serde(default)]
    pub columns: Vec<String>,
    pub primary_key: String,
    #[serde(default)]
    pub key_generator: KeyGenerator,
    /// Number of databases the table spans, taken from the front of
    /// `databases`. Defaults to all of them.
    #[serde(default)]
    pub database_count: Option<u32>,
    pub tables_per_database: u32,
    pub database_sharding: ShardingConfig,
    pub table_sharding: ShardingConfig,
    /// Values filled in on create when the caller leaves a column out.
    #[serde(default)]
    pub defaults: BTreeMap<String, Value>,
    /// Column stamped with the creation time (RFC 3339) on create.
    #[serde(default)]
    pub created_at_column: Option<String>,
}

impl TableConfig {
    /// Effective database count given `available` configured databases.
    pub fn database_count(&self, available: usize) -> u32 {
        self.database_count.unwrap_or(available as u32)
    }

    fn declares(&self, column: &str) -> bool {
        self.columns.is_empty() || self.columns.iter().any(|c| c == column)
    }

    fn validate(&self, available: usize) -> Result<()> {
        let requested = self.database_count(available);
        if requested == 0 || requested as usize > available {
            return Err(ConfigError::DatabaseCount { table: self.name.clone(), requested, available });
        }
        if self.tables_per_database == 0 {
            return Err(ConfigError::ZeroTables { table: self.name.clone() });
        }
        let mut referenced = vec![
            self.primary_key.as_str(),
            self.database_sharding.column.as_str(),
            self.table_sharding.column.as_str(),
        ];
        referenced.extend(self.defaults.keys().map(String::as_str));
        referenced.extend(self.created_at_column.as_deref());
        for column in referenced {
            if !self.declares(column) {
                return Err(ConfigError::UnknownColumn { table: self.name.clone(), column: column.to_string() });
            }
        }
        Ok(())
    }
}

impl ClusterConfig {
    /// Read, parse and validate the YAML file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Arc<Self>> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .map_err(|source| ConfigError::Io { path: path.display().to_string(), source })?;
        let config = Self::from_yaml_str(&content)?;
        info!(
            path = %path.display(),
            databases = config.databases.len(),
            tables = config.tables.len(),
            "loaded cluster configuration"
        );
        Ok(Arc::new(config))
    }

    /// Parse and validate YAML text.
    pub fn from_yaml_str(content: &str) -> Result<Self> {
        let config: ClusterConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Structural checks. Strategy-specific checks happen when the routing
    /// rules are built.
    pub fn validate(&self) -> Result<()> {
        self.id_generator.validate()?;
        if self.executor.max_workers == Some(0) {
            return Err(ConfigError::Executor("max_workers must be at least 1".into()));
        }
        if self.databases.is_empty() {
            return Err(ConfigError::NoDatabases);
        }
        let mut seen = HashSet::new();
        for db in &self.databases {
            if !seen.insert(db.name.as_str()) {
                return Err(ConfigError::DuplicateDatabase(db.name.clone()));
            }
            if db.pool.max_active == 0 {
                return Err(ConfigError::EmptyPool(db.name.clone()));
            }
        }
        let mut seen = HashSet::new();
        for table in &self.tables {
            if !seen.insert(table.name.as_str()) {
                return Err(ConfigError::DuplicateTable(table.name.clone()));
            }
            table.validate(self.databases.len())?;
        }
        Ok(())
    }

    pub fn table(&self, name: &str) -> Option<&TableConfig> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Worker limit for fan-out: configured value, else one per database.
    pub fn max_workers(&self) -> usize {
        self.executor.max_workers.unwrap_or(self.databases.len()).max(1)
    }
}
