//! Routing engine: maps a logical table plus a predicate or record onto
//! the physical `(database, table)` pairs that hold the matching rows.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use strata_shard::ShardError;
use strata_types::{PhysicalTarget, Predicate, Record, Value};
use thiserror::Error;
use tracing::{debug, warn};

mod rule;

pub use rule::{Dimension, ShardingRule, TableRule};

/// Result type alias for routing.
pub type Result<T> = std::result::Result<T, RouteError>;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RouteError {
    #[error("unknown logical table {0:?}")]
    UnknownTable(String),
    #[error("table {table}: cannot route {column} = {value}: {source}")]
    Strategy {
        table: String,
        column: String,
        value: String,
        #[source]
        source: ShardError,
    },
    /// A write needs both sharding keys.
    #[error("table {table}: record lacks sharding column {column}")]
    IncompleteKey { table: String, column: String },
    #[error("table {table}: unknown column {column:?}")]
    UnknownColumn { table: String, column: String },
    /// A keyed operation named neither a sharding column nor the primary key.
    #[error("table {table}: predicate names no key column")]
    NoKey { table: String },
    /// Sharding columns cannot be changed in place.
    #[error("table {table}: sharding column {column} cannot be updated")]
    ImmutableColumn { table: String, column: String },
}

impl RouteError {
    /// `true` when the error comes from configuration rather than from the
    /// values a caller supplied.
    pub fn is_configuration(&self) -> bool {
        match self {
            RouteError::UnknownTable(_) => true,
            RouteError::Strategy { source, .. } => source.is_configuration(),
            _ => false,
        }
    }
}

/// How much of the key space a route covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteKind {
    /// Both keys known: one target.
    Exact,
    /// Only the table key known: that table index in every database.
    DatabaseBroadcast,
    /// Only the database key known: every table of that database.
    TableBroadcast,
    /// No key known: every target.
    FullBroadcast,
}

impl RouteKind {
    pub fn label(self) -> &'static str {
        match self {
            RouteKind::Exact => "exact",
            RouteKind::DatabaseBroadcast => "databases",
            RouteKind::TableBroadcast => "tables",
            RouteKind::FullBroadcast => "full",
        }
    }
}

/// Outcome of routing one logical operation.
#[derive(Debug, Clone)]
pub struct RouteResult {
    pub table: Arc<TableRule>,
    pub targets: Vec<PhysicalTarget>,
    pub kind: RouteKind,
}

impl RouteResult {
    pub fn is_exact(&self) -> bool {
        self.kind == RouteKind::Exact
    }

    /// Physical names of the targets, e.g. `ds1.t_order_0`.
    pub fn describe(&self) -> Vec<String> {
        self.targets.iter().map(|t| self.table.describe(*t)).collect()
    }
}

/// Stateless apart from a counter of full broadcasts.
#[derive(Debug)]
pub struct Router {
    rule: ShardingRule,
    full_broadcasts: AtomicU64,
}

impl Router {
    pub fn new(rule: ShardingRule) -> Self {
        Self { rule, full_broadcasts: AtomicU64::new(0) }
    }

    pub fn rule(&self) -> &ShardingRule {
        &self.rule
    }

    pub fn table(&self, name: &str) -> Result<&Arc<TableRule>> {
        self.rule.table(name)
    }

    /// Number of unkeyed routes served so far.
    pub fn full_broadcast_count(&self) -> u64 {
        self.full_broadcasts.load(Ordering::Relaxed)
    }

    /// Route a read or update by its equality predicate.
    ///
    /// Missing keys widen the route instead of failing. Unkeyed routes are
    /// logged at warn level and counted.
    pub fn route(&self, table: &str, filter: &Predicate) -> Result<RouteResult> {
        let rule = self.rule.table(table)?;
        rule.check_columns(filter.conditions().iter().map(|(c, _)| c.as_str()))?;
        let db_key = filter.value_of(rule.database_dimension().column());
        let tbl_key = filter.value_of(rule.table_dimension().column());
        self.route_keys(rule, db_key, tbl_key)
    }

    /// Like [`Router::route`], but the predicate must name a sharding column
    /// or the primary key.
    pub fn route_by_key(&self, table: &str, filter: &Predicate) -> Result<RouteResult> {
        let rule = self.rule.table(table)?;
        let keyed = filter
            .conditions()
            .iter()
            .any(|(c, _)| rule.is_sharding_column(c) || c == rule.primary_key());
        if !keyed {
            return Err(RouteError::NoKey { table: table.to_string() });
        }
        self.route(table, filter)
    }

    /// Route a record for insertion. Both sharding columns must be present.
    pub fn route_record(&self, table: &str, record: &Record) -> Result<RouteResult> {
        let rule = self.rule.table(table)?;
        rule.check_columns(record.columns())?;
        for dim in [rule.database_dimension(), rule.table_dimension()] {
            if record.get_non_null(dim.column()).is_none() {
                return Err(RouteError::IncompleteKey { table: table.to_string(), column: dim.column().to_string() });
            }
        }
        let db_key = record.get(rule.database_dimension().column());
        let tbl_key = record.get(rule.table_dimension().column());
        self.route_keys(rule, db_key, tbl_key)
    }

    fn route_keys(&self, rule: &Arc<TableRule>, db_key: Option<&Value>, tbl_key: Option<&Value>) -> Result<RouteResult> {
        let name = rule.name();
        let db = db_key.map(|v| rule.database_dimension().resolve(name, v)).transpose()?;
        let tbl = tbl_key.map(|v| rule.table_dimension().resolve(name, v)).transpose()?;
        let databases: Vec<u32> = match db {
            Some(db) => vec![db],
            None => (0..rule.database_dimension().count()).collect(),
        };
        let tables: Vec<u32> = match tbl {
            Some(tbl) => vec![tbl],
            None => (0..rule.table_dimension().count()).collect(),
        };
        let targets = databases
            .iter()
            .flat_map(|&db| tables.iter().map(move |&tbl| PhysicalTarget::new(db, tbl)))
            .collect::<Vec<_>>();
        let kind = match (db, tbl) {
            (Some(_), Some(_)) => RouteKind::Exact,
            (None, Some(_)) => RouteKind::DatabaseBroadcast,
            (Some(_), None) => RouteKind::TableBroadcast,
            (None, None) => RouteKind::FullBroadcast,
        };
        match kind {
            RouteKind::Exact => {}
            RouteKind::FullBroadcast => {
                self.full_broadcasts.fetch_add(1, Ordering::Relaxed);
                strata_metrics::record_broadcast(name, kind.label());
                warn!(table = name, targets = targets.len(), "no sharding key in predicate, broadcasting to every target");
            }
            _ => {
                strata_metrics::record_broadcast(name, kind.label());
                debug!(table = name, kind = kind.label(), targets = targets.len(), "partially keyed route");
            }
        }
        Ok(RouteResult { table: Arc::clone(rule), targets, kind })
    }

    /// Reject updates that touch a sharding column or an undeclared one.
    pub fn check_mutation<'a>(&self, table: &str, columns: impl IntoIterator<Item = &'a str>) -> Result<()> {
        let rule = self.rule.table(table)?;
        for column in columns {
            if rule.is_sharding_column(column) || column == rule.primary_key() {
                return Err(RouteError::ImmutableColumn { table: table.to_string(), column: column.to_string() });
            }
            rule.check_columns([column])?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_meta::ClusterConfig;
    use strata_shard::StrategyRegistry;

    fn config(db_strategy: &str, tbl_strategy: &str) -> ClusterConfig {
        let yaml = format!(
            r#"
id_generator: {{ node_id: 0 }}
databases:
  - {{ name: ds0, url: "memory://ds0" }}
  - {{ name: ds1, url: "memory://ds1" }}
tables:
  - name: t_order
    columns: [order_id, user_id, amount, status]
    primary_key: order_id
    tables_per_database: 2
    database_sharding: {{ column: user_id, strategy: {db_strategy} }}
    table_sharding: {{ column: order_id, strategy: {tbl_strategy} }}
"#
        );
        ClusterConfig::from_yaml_str(&yaml).unwrap()
    }

    fn router() -> Router {
        let rule = ShardingRule::from_config(&config("{ type: modulo }", "{ type: modulo }"), &StrategyRegistry::new()).unwrap();
        Router::new(rule)
    }

    #[test]
    fn fully_keyed_routes_to_one_target() {
        let r = router().route("t_order", &Predicate::eq("user_id", 3).and_eq("order_id", 10)).unwrap();
        assert_eq!(r.kind, RouteKind::Exact);
        assert_eq!(r.targets, vec![PhysicalTarget::new(1, 0)]);
        assert_eq!(r.describe(), vec!["ds1.t_order_0".to_string()]);
    }

    #[test]
    fn partial_keys_broadcast_over_the_missing_dimension() {
        let router = router();
        let by_order = router.route("t_order", &Predicate::eq("order_id", 7)).unwrap();
        assert_eq!(by_order.kind, RouteKind::DatabaseBroadcast);
        assert_eq!(by_order.targets, vec![PhysicalTarget::new(0, 1), PhysicalTarget::new(1, 1)]);

        let by_user = router.route("t_order", &Predicate::eq("user_id", 4)).unwrap();
        assert_eq!(by_user.kind, RouteKind::TableBroadcast);
        assert_eq!(by_user.targets, vec![PhysicalTarget::new(0, 0), PhysicalTarget::new(0, 1)]);
        assert_eq!(router.full_broadcast_count(), 0);
    }

    #[test]
    fn unkeyed_routes_to_everything_and_is_counted() {
        let router = router();
        let r = router.route("t_order", &Predicate::eq("status", "CREATED")).unwrap();
        assert_eq!(r.kind, RouteKind::FullBroadcast);
        assert_eq!(r.targets.len(), 4);
        router.route("t_order", &Predicate::all()).unwrap();
        assert_eq!(router.full_broadcast_count(), 2);
    }

    #[test]
    fn write_and_read_routes_agree() {
        let router = router();
        for user in 0..20i64 {
            for order in 100..110i64 {
                let record = Record::new().with("user_id", user).with("order_id", order).with("amount", 1);
                let write = router.route_record("t_order", &record).unwrap();
                let read = router.route("t_order", &Predicate::eq("order_id", order).and_eq("user_id", user)).unwrap();
                assert_eq!(write.targets, read.targets);
            }
        }
    }

    #[test]
    fn keyed_routes_need_a_key_column() {
        let router = router();
        let err = router.route_by_key("t_order", &Predicate::eq("status", "PAID")).unwrap_err();
        assert_eq!(err, RouteError::NoKey { table: "t_order".into() });
        assert_eq!(router.full_broadcast_count(), 0);
        assert!(router.route_by_key("t_order", &Predicate::eq("user_id", 2)).is_ok());
    }

    #[test]
    fn records_need_both_keys() {
        let err = router().route_record("t_order", &Record::new().with("user_id", 1)).unwrap_err();
        assert_eq!(err, RouteError::IncompleteKey { table: "t_order".into(), column: "order_id".into() });
    }

    #[test]
    fn bad_values_and_names_are_rejected() {
        let router = router();
        assert_eq!(router.route("t_user", &Predicate::all()).unwrap_err(), RouteError::UnknownTable("t_user".into()));
        let err = router.route("t_order", &Predicate::eq("user_id", -1)).unwrap_err();
        assert!(matches!(err, RouteError::Strategy { source: ShardError::NegativeKey { .. }, .. }));
        assert!(!err.is_configuration());
        let err = router.route("t_order", &Predicate::eq("colour", "red")).unwrap_err();
        assert!(matches!(err, RouteError::UnknownColumn { .. }));
    }

    #[test]
    fn sharding_columns_are_immutable() {
        let router = router();
        assert!(router.check_mutation("t_order", ["status", "amount"]).is_ok());
        assert!(matches!(router.check_mutation("t_order", ["user_id"]), Err(RouteError::ImmutableColumn { .. })));
        assert!(matches!(router.check_mutation("t_order", ["order_id"]), Err(RouteError::ImmutableColumn { .. })));
    }

    #[test]
    fn range_boundaries_must_match_database_count() {
        let cfg = config("{ type: range, boundaries: [100, 200] }", "{ type: modulo }");
        let err = ShardingRule::from_config(&cfg, &StrategyRegistry::new()).unwrap_err();
        assert!(matches!(err, strata_meta::ConfigError::Strategy { dimension: "database", .. }));

        let cfg = config("{ type: range, boundaries: [100] }", "{ type: modulo }");
        let router = Router::new(ShardingRule::from_config(&cfg, &StrategyRegistry::new()).unwrap());
        let r = router.route("t_order", &Predicate::eq("user_id", 150).and_eq("order_id", 3)).unwrap();
        assert_eq!(r.targets, vec![PhysicalTarget::new(1, 1)]);
    }

    #[test]
    fn custom_strategy_out_of_range_is_caught() {
        #[derive(Debug)]
        struct Always(u32);
        impl strata_shard::ShardingStrategy for Always {
            fn name(&self) -> &str {
                "always"
            }
            fn resolve(&self, _: &Value, _: u32) -> strata_shard::Result<u32> {
                Ok(self.0)
            }
        }
        let mut registry = StrategyRegistry::new();
        registry.register("always", Arc::new(Always(5)));
        let cfg = config("{ type: custom, name: always }", "{ type: modulo }");
        let router = Router::new(ShardingRule::from_config(&cfg, &registry).unwrap());
        let err = router.route("t_order", &Predicate::eq("user_id", 1)).unwrap_err();
        assert!(err.is_configuration());
    }
}
