use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use strata_meta::{ClusterConfig, ConfigError, KeyGenerator, TableConfig};
use strata_shard::{ShardError, ShardingStrategy, StrategyRegistry};
use strata_types::{DatabaseId, PhysicalTarget, Record, TableId, Value};

use crate::{Result, RouteError};

/// One sharding dimension of a logical table.
#[derive(Debug, Clone)]
pub struct Dimension {
    column: String,
    count: u32,
    strategy: Arc<dyn ShardingStrategy>,
}

impl Dimension {
    pub fn new(column: impl Into<String>, count: u32, strategy: Arc<dyn ShardingStrategy>) -> Self {
        Self { column: column.into(), count, strategy }
    }

    pub fn column(&self) -> &str {
        &self.column
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn strategy_name(&self) -> &str {
        self.strategy.name()
    }

    /// Index for `value`, checked against the dimension size so that a
    /// misbehaving custom strategy cannot address a missing shard.
    pub(crate) fn resolve(&self, table: &str, value: &Value) -> Result<u32> {
        let failure = |source| RouteError::Strategy {
            table: table.to_string(),
            column: self.column.clone(),
            value: value.to_string(),
            source,
        };
        let index = self.strategy.resolve(value, self.count).map_err(failure)?;
        if index >= self.count {
            return Err(failure(ShardError::IndexOutOfRange {
                strategy: self.strategy.name().to_string(),
                index,
                shard_count: self.count,
            }));
        }
        Ok(index)
    }
}

/// Routing metadata of one logical table.
#[derive(Debug, Clone)]
pub struct TableRule {
    name: String,
    columns: Vec<String>,
    primary_key: String,
    key_generator: KeyGenerator,
    databases: Vec<String>,
    database: Dimension,
    table: Dimension,
    defaults: BTreeMap<String, Value>,
    created_at_column: Option<String>,
}

impl TableRule {
    fn from_config(config: &TableConfig, database_names: &[String], strategies: &StrategyRegistry) -> std::result::Result<Self, ConfigError> {
        let db_count = config.database_count(database_names.len());
        let build = |dimension: &'static str, sharding: &strata_meta::ShardingConfig, count: u32| {
            strategies
                .build(&sharding.strategy, count)
                .map(|strategy| Dimension::new(sharding.column.clone(), count, strategy))
                .map_err(|source| ConfigError::Strategy { table: config.name.clone(), dimension, source })
        };
        Ok(Self {
            name: config.name.clone(),
            columns: config.columns.clone(),
            primary_key: config.primary_key.clone(),
            key_generator: config.key_generator,
            databases: database_names.iter().take(db_count as usize).cloned().collect(),
            database: build("database", &config.database_sharding, db_count)?,
            table: build("table", &config.table_sharding, config.tables_per_database)?,
            defaults: config.defaults.clone(),
            created_at_column: config.created_at_column.clone(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn primary_key(&self) -> &str {
        &self.primary_key
    }

    pub fn key_generator(&self) -> KeyGenerator {
        self.key_generator
    }

    pub fn database_dimension(&self) -> &Dimension {
        &self.database
    }

    pub fn table_dimension(&self) -> &Dimension {
        &self.table
    }

    pub fn defaults(&self) -> &BTreeMap<String, Value> {
        &self.defaults
    }

    pub fn created_at_column(&self) -> Option<&str> {
        self.created_at_column.as_deref()
    }

    /// `{logical}_{table_id}`, e.g. `t_order_1`.
    pub fn physical_table_name(&self, table_id: TableId) -> String {
        format!("{}_{}", self.name, table_id)
    }

    pub fn database_name(&self, database_id: DatabaseId) -> Option<&str> {
        self.databases.get(database_id as usize).map(String::as_str)
    }

    /// `database.physical_table`, e.g. `ds1.t_order_0`.
    pub fn describe(&self, target: PhysicalTarget) -> String {
        let db = self.database_name(target.database_id).unwrap_or("?");
        format!("{db}.{}", self.physical_table_name(target.table_id))
    }

    /// Every physical target of the table, database-major.
    pub fn all_targets(&self) -> Vec<PhysicalTarget> {
        (0..self.database.count)
            .flat_map(|db| (0..self.table.count).map(move |tbl| PhysicalTarget::new(db, tbl)))
            .collect()
    }

    pub fn is_sharding_column(&self, column: &str) -> bool {
        column == self.database.column || column == self.table.column
    }

    pub fn declares(&self, column: &str) -> bool {
        self.columns.is_empty() || self.columns.iter().any(|c| c == column)
    }

    /// Reject columns the table does not declare.
    pub fn check_columns<'a>(&self, columns: impl IntoIterator<Item = &'a str>) -> Result<()> {
        for column in columns {
            if !self.declares(column) {
                return Err(RouteError::UnknownColumn { table: self.name.clone(), column: column.to_string() });
            }
        }
        Ok(())
    }

    /// Fill configured defaults for columns missing from `record`.
    pub fn apply_defaults(&self, record: &mut Record) {
        for (column, value) in &self.defaults {
            if record.get_non_null(column).is_none() {
                record.set(column.clone(), value.clone());
            }
        }
    }
}

/// Routing rules for every logical table. Built once, read-only afterwards.
#[derive(Debug, Clone, Default)]
pub struct ShardingRule {
    tables: HashMap<String, Arc<TableRule>>,
}

impl ShardingRule {
    /// Build the rules from validated configuration. Custom strategies are
    /// looked up in `strategies`.
    pub fn from_config(config: &ClusterConfig, strategies: &StrategyRegistry) -> std::result::Result<Self, ConfigError> {
        let names: Vec<String> = config.databases.iter().map(|d| d.name.clone()).collect();
        let mut tables = HashMap::new();
        for table in &config.tables {
            let rule = TableRule::from_config(table, &names, strategies)?;
            tables.insert(table.name.clone(), Arc::new(rule));
        }
        Ok(Self { tables })
    }

    pub fn table(&self, name: &str) -> Result<&Arc<TableRule>> {
        self.tables.get(name).ok_or_else(|| RouteError::UnknownTable(name.to_string()))
    }

    /// Logical table names, sorted.
    pub fn table_names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.tables.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}
