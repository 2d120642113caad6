#![deny(missing_docs)]
#![doc = "StrataDB bootstrap: wires configuration, routing, pools, the id generator and the execution coordinator into one cluster handle."]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use strata_exec::{Coordinator, CoordinatorSettings};
use strata_id::IdGenerator;
use strata_meta::ClusterConfig;
use strata_pool::{ConnectionRegistry, Connector, MemoryDatabase};
use strata_route::{Router, ShardingRule};
use strata_shard::{ShardingStrategy, StrategyRegistry};
use tracing::info;

pub mod demo;

/// Builds a [`Cluster`] from configuration plus any custom strategies and
/// database drivers.
pub struct ClusterBuilder {
    config: Arc<ClusterConfig>,
    strategies: StrategyRegistry,
    connectors: HashMap<String, Arc<dyn Connector>>,
}

impl ClusterBuilder {
    /// Start from a loaded configuration.
    pub fn new(config: Arc<ClusterConfig>) -> Self {
        Self { config, strategies: StrategyRegistry::new(), connectors: HashMap::new() }
    }

    /// Make a custom strategy available to `{ type: custom, name }` entries.
    pub fn strategy(mut self, name: impl Into<String>, strategy: Arc<dyn ShardingStrategy>) -> Self {
        self.strategies.register(name, strategy);
        self
    }

    /// Use `connector` for the database called `database` instead of the
    /// driver implied by its URL.
    pub fn connector(mut self, database: impl Into<String>, connector: Arc<dyn Connector>) -> Self {
        self.connectors.insert(database.into(), connector);
        self
    }

    /// Validate everything and assemble the cluster. In-memory databases
    /// get their physical tables created.
    pub fn build(mut self) -> Result<Cluster> {
        let config = self.config;
        config.validate()?;
        let rule = ShardingRule::from_config(&config, &self.strategies)?;

        let mut registry = ConnectionRegistry::new();
        let mut memory = HashMap::new();
        for db in &config.databases {
            let connector: Arc<dyn Connector> = match self.connectors.remove(&db.name) {
                Some(connector) => connector,
                None if db.scheme() == "memory" => {
                    let database = MemoryDatabase::new(db.name.clone());
                    memory.insert(db.name.clone(), database.clone());
                    Arc::new(database)
                }
                None => bail!("database {}: no driver registered for {}", db.name, db.url),
            };
            registry.add_database(db.name.clone(), db.pool.clone(), connector);
        }

        for name in rule.table_names() {
            let table = rule.table(name)?;
            for db_id in 0..table.database_dimension().count() {
                let Some(database) = table.database_name(db_id).and_then(|n| memory.get(n)) else { continue };
                for tbl_id in 0..table.table_dimension().count() {
                    database.create_table(&table.physical_table_name(tbl_id));
                }
            }
        }

        let ids = IdGenerator::new(config.id_generator.clone()).context("id generator")?;
        let coordinator = Coordinator::new(
            Arc::new(Router::new(rule)),
            Arc::new(registry),
            Arc::new(ids),
            CoordinatorSettings::from_config(&config),
        );
        info!(
            databases = config.databases.len(),
            tables = config.tables.len(),
            node_id = config.id_generator.node_id,
            "cluster ready"
        );
        Ok(Cluster { config, coordinator: Arc::new(coordinator), memory })
    }
}

/// A running router: shared by every request handler.
pub struct Cluster {
    config: Arc<ClusterConfig>,
    coordinator: Arc<Coordinator>,
    memory: HashMap<String, MemoryDatabase>,
}

impl Cluster {
    /// Cluster with built-in drivers and strategies only.
    pub fn from_config(config: Arc<ClusterConfig>) -> Result<Self> {
        ClusterBuilder::new(config).build()
    }

    /// Load `path` and build the cluster.
    pub fn load(path: &str) -> Result<Self> {
        let config = ClusterConfig::load(path).with_context(|| format!("loading {path}"))?;
        Self::from_config(config)
    }

    /// Configuration the cluster was built from.
    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    /// The execution coordinator.
    pub fn coordinator(&self) -> &Arc<Coordinator> {
        &self.coordinator
    }

    /// In-memory database called `name`, if it uses the built-in driver.
    pub fn memory_database(&self, name: &str) -> Option<&MemoryDatabase> {
        self.memory.get(name)
    }

    /// `true` when every database answers a ping.
    pub async fn health_check(&self) -> bool {
        let failed = self.coordinator.pools().ping_all().await;
        for (id, reason) in &failed {
            tracing::warn!(database_id = id, %reason, "health check failed");
        }
        failed.is_empty()
    }

    /// Serve `/readyz` on `listen`.
    pub fn start_readyz(&self, listen: SocketAddr) -> Result<SocketAddr> {
        Ok(self.coordinator.pools().start_readyz(listen)?)
    }

    /// Close every pool.
    pub fn shutdown(&self) {
        self.coordinator.pools().shutdown();
    }
}
