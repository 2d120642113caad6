use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use strata_exec::{CancellationToken, Coordinator, CoordinatorSettings, ExecError, LogicalOp, OpOutput, TargetError};
use strata_id::IdGenerator;
use strata_meta::ClusterConfig;
use strata_pool::{BackendError, BackendResult, Connection, ConnectionRegistry, Connector, MemoryDatabase};
use strata_route::{RouteError, Router, ShardingRule};
use strata_shard::StrategyRegistry;
use strata_types::{AggregateFn, Mutation, PhysicalTarget, Predicate, Record, Value};

struct Harness {
    coord: Coordinator,
    dbs: Vec<MemoryDatabase>,
}

fn config(executor: &str, ds1_pool: &str) -> ClusterConfig {
    let yaml = format!(
        r#"
id_generator: {{ node_id: 7 }}
executor: {executor}
databases:
  - {{ name: ds0, url: "memory://ds0" }}
  - {{ name: ds1, url: "memory://ds1", pool: {ds1_pool} }}
tables:
  - name: t_order
    columns: [order_id, user_id, amount, status, create_time]
    primary_key: order_id
    tables_per_database: 2
    database_sharding: {{ column: user_id, strategy: {{ type: modulo }} }}
    table_sharding: {{ column: order_id, strategy: {{ type: modulo }} }}
    defaults: {{ status: CREATED }}
    created_at_column: create_time
"#
    );
    ClusterConfig::from_yaml_str(&yaml).unwrap()
}

fn harness_with(executor: &str, ds1_pool: &str) -> Harness {
    let config = config(executor, ds1_pool);
    let mut registry = ConnectionRegistry::new();
    let mut dbs = Vec::new();
    for db in &config.databases {
        let memory = MemoryDatabase::new(db.name.clone());
        memory.create_table("t_order_0");
        memory.create_table("t_order_1");
        registry.add_database(db.name.clone(), db.pool.clone(), Arc::new(memory.clone()));
        dbs.push(memory);
    }
    let router = Router::new(ShardingRule::from_config(&config, &StrategyRegistry::new()).unwrap());
    let ids = IdGenerator::new(config.id_generator.clone()).unwrap();
    let coord = Coordinator::new(
        Arc::new(router),
        Arc::new(registry),
        Arc::new(ids),
        CoordinatorSettings::from_config(&config),
    );
    Harness { coord, dbs }
}

fn harness() -> Harness {
    harness_with("{}", "{}")
}

impl Harness {
    fn rows_at(&self, target: PhysicalTarget) -> Vec<Record> {
        self.dbs[target.database_id as usize].rows(&format!("t_order_{}", target.table_id))
    }

    fn all_targets() -> Vec<PhysicalTarget> {
        vec![PhysicalTarget::new(0, 0), PhysicalTarget::new(0, 1), PhysicalTarget::new(1, 0), PhysicalTarget::new(1, 1)]
    }

    async fn load_users(&self, users: std::ops::RangeInclusive<i64>) -> Vec<Value> {
        let mut keys = Vec::new();
        for user in users {
            let record = Record::new().with("user_id", user).with("amount", user * 100);
            keys.push(self.coord.create_record("t_order", record).await.unwrap().key);
        }
        keys
    }
}

#[tokio::test]
async fn insert_lands_on_the_modulo_target() {
    let h = harness();
    let inserted = h
        .coord
        .create_record("t_order", Record::new().with("user_id", 3).with("amount", 999.99))
        .await
        .unwrap();
    let order_id = inserted.key.as_i64().unwrap();
    assert!(inserted.generated.is_some());
    assert_eq!(inserted.target.database_id, 1);
    assert_eq!(i64::from(inserted.target.table_id), order_id % 2);
    assert_eq!(inserted.physical, format!("ds1.t_order_{}", order_id % 2));

    let stored = h.rows_at(inserted.target);
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].get("order_id"), Some(&Value::Int(order_id)));
    assert_eq!(stored[0].get("status"), Some(&Value::from("CREATED")));
    assert!(stored[0].get("create_time").and_then(Value::as_str).is_some());
    assert!(h.dbs[0].rows("t_order_0").is_empty() && h.dbs[0].rows("t_order_1").is_empty());
}

#[tokio::test]
async fn broadcast_sum_merges_every_shard() {
    let h = harness();
    h.load_users(1..=10).await;
    let total = h.coord.aggregate_by_key("t_order", None, &AggregateFn::Sum("amount".into())).await.unwrap();
    assert_eq!(total, Value::Int(5500));
    let count = h.coord.aggregate_by_key("t_order", None, &AggregateFn::Count).await.unwrap();
    assert_eq!(count, Value::Int(10));
    let one_user = h
        .coord
        .aggregate_by_key("t_order", Some(("user_id", Value::Int(4))), &AggregateFn::Sum("amount".into()))
        .await
        .unwrap();
    assert_eq!(one_user, Value::Int(400));
}

#[tokio::test]
async fn aggregate_over_empty_shards_is_the_identity() {
    let h = harness();
    let total = h.coord.aggregate_by_key("t_order", None, &AggregateFn::Sum("amount".into())).await.unwrap();
    assert_eq!(total, Value::Int(0));
    let max = h.coord.aggregate_by_key("t_order", None, &AggregateFn::Max("amount".into())).await.unwrap();
    assert!(max.is_null());
}

#[tokio::test]
async fn get_by_id_hits_exactly_one_target() {
    let h = harness();
    let keys = h.load_users(1..=6).await;
    for key in keys {
        let found = h.coord.get_by_id("t_order", key.clone()).await.unwrap().unwrap();
        assert_eq!(found.get("order_id"), Some(&key));
        let hits: usize = Harness::all_targets()
            .into_iter()
            .map(|t| h.rows_at(t).iter().filter(|r| r.get("order_id") == Some(&key)).count())
            .sum();
        assert_eq!(hits, 1);
    }
    assert!(h.coord.get_by_id("t_order", 42).await.unwrap().is_none());
}

#[tokio::test]
async fn query_update_and_broadcast_by_status() {
    let h = harness();
    let keys = h.load_users(1..=4).await;
    let rows = h.coord.query_by_key("t_order", "user_id", 2).await.unwrap();
    assert_eq!(rows.len(), 1);

    let changed = h.coord.update_by_id("t_order", keys[0].clone(), &Mutation::new().set("status", "PAID")).await.unwrap();
    assert_eq!(changed, 1);
    let paid = h.coord.query_broadcast("t_order", &Predicate::eq("status", "PAID")).await.unwrap();
    assert_eq!(paid.len(), 1);
    assert_eq!(paid[0].get("order_id"), Some(&keys[0]));
    assert!(h.coord.router().full_broadcast_count() >= 1);

    let err = h.coord.update_by_id("t_order", keys[0].clone(), &Mutation::new().set("user_id", 9)).await.unwrap_err();
    assert!(matches!(err, ExecError::Routing(RouteError::ImmutableColumn { .. })));
    let err = h.coord.query_by_key("t_order", "status", "PAID").await.unwrap_err();
    assert!(matches!(err, ExecError::Routing(RouteError::NoKey { .. })));
}

#[tokio::test]
async fn unknown_table_and_bad_keys() {
    let h = harness();
    let err = h.coord.create_record("t_user", Record::new().with("user_id", 1)).await.unwrap_err();
    assert!(matches!(err, ExecError::Configuration(RouteError::UnknownTable(_))));
    let err = h.coord.create_record("t_order", Record::new().with("amount", 1)).await.unwrap_err();
    assert!(matches!(err, ExecError::Routing(RouteError::IncompleteKey { .. })));
    let err = h.coord.create_record("t_order", Record::new().with("user_id", -5)).await.unwrap_err();
    assert!(matches!(err, ExecError::Routing(RouteError::Strategy { .. })));
}

#[tokio::test]
async fn one_unreachable_target_yields_partial_failure() {
    let h = harness();
    h.load_users(1..=12).await;
    h.dbs[1].set_table_offline("t_order_1", true);
    let expected: usize = Harness::all_targets()
        .into_iter()
        .filter(|t| *t != PhysicalTarget::new(1, 1))
        .map(|t| h.rows_at(t).len())
        .sum();

    let err = h.coord.query_broadcast("t_order", &Predicate::all()).await.unwrap_err();
    let partial = err.as_partial_failure().unwrap();
    assert_eq!(partial.failed.len(), 1);
    assert_eq!(partial.failed[0].target, PhysicalTarget::new(1, 1));
    assert_eq!(partial.failed[0].physical, "ds1.t_order_1");
    assert!(matches!(partial.failed[0].error, TargetError::Backend(_)));
    assert_eq!(partial.succeeded.len(), 3);
    assert_eq!(partial.rows().len(), expected);
}

#[tokio::test]
async fn per_target_deadline_is_enforced() {
    let h = harness_with("{ target_timeout_ms: 50 }", "{}");
    let inserted = h.coord.create_record("t_order", Record::new().with("user_id", 2).with("amount", 1)).await.unwrap();
    h.dbs[0].set_latency(Duration::from_millis(300));

    let exact = Predicate::eq("user_id", 2).and_eq("order_id", inserted.key.clone());
    let err = h.coord.query_broadcast("t_order", &exact).await.unwrap_err();
    assert!(matches!(&err, ExecError::Target(f) if matches!(f.error, TargetError::Timeout(_))));
    assert!(err.is_retryable());

    // ds1 answers, ds0 does not.
    let err = h.coord.get_by_id("t_order", inserted.key).await.unwrap_err();
    let partial = err.as_partial_failure().unwrap();
    assert_eq!(partial.failed.len(), 1);
    assert_eq!(partial.failed[0].target.database_id, 0);
    assert!(partial.rows().is_empty());
}

#[tokio::test]
async fn exhausted_pool_on_the_only_target() {
    let h = harness_with("{}", "{ max_active: 1, acquire_timeout_ms: 20 }");
    let _held = h.coord.pools().acquire(1).await.unwrap();
    let err = h.coord.create_record("t_order", Record::new().with("user_id", 1).with("amount", 5)).await.unwrap_err();
    assert!(matches!(err, ExecError::PoolExhausted(_)));
    assert!(err.is_retryable());
    // ds0 is unaffected.
    h.coord.create_record("t_order", Record::new().with("user_id", 2).with("amount", 5)).await.unwrap();
}

#[tokio::test]
async fn cancellation_stops_dispatch() {
    let h = harness_with("{ max_workers: 1 }", "{}");
    h.load_users(1..=8).await;
    for db in &h.dbs {
        db.set_latency(Duration::from_millis(40));
    }
    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(60)).await;
        trigger.cancel();
    });
    let op = LogicalOp::SelectBroadcast { table: "t_order".into(), filter: Predicate::all() };
    let err = h.coord.execute_with_cancel(op, &cancel).await.unwrap_err();
    let cancelled = match err {
        ExecError::Cancelled(cancelled) => cancelled,
        other => panic!("expected cancellation, got {other}"),
    };
    assert!(!cancelled.completed.is_empty());
    assert!(!cancelled.skipped.is_empty());
    assert_eq!(cancelled.completed.len() + cancelled.skipped.len(), 4);
    assert!(matches!(cancelled.partial, OpOutput::Rows(_)));
}

#[tokio::test]
async fn cancelled_before_start_writes_nothing() {
    let h = harness();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let op = LogicalOp::Insert { table: "t_order".into(), record: Record::new().with("user_id", 1).with("amount", 1) };
    let err = h.coord.execute_with_cancel(op, &cancel).await.unwrap_err();
    let cancelled = match err {
        ExecError::Cancelled(cancelled) => cancelled,
        other => panic!("expected cancellation, got {other}"),
    };
    assert!(cancelled.completed.is_empty());
    assert_eq!(cancelled.partial, OpOutput::Empty);
    assert!(Harness::all_targets().into_iter().all(|t| h.rows_at(t).is_empty()));
}

#[tokio::test]
async fn concurrent_inserts_round_trip() {
    let h = Arc::new(harness());
    let mut tasks = Vec::new();
    for user in 0..40i64 {
        let h = Arc::clone(&h);
        tasks.push(tokio::spawn(async move {
            let record = Record::new().with("user_id", user).with("amount", 1);
            h.coord.create_record("t_order", record).await.unwrap()
        }));
    }
    for task in tasks {
        let inserted = task.await.unwrap();
        let rows = h.rows_at(inserted.target);
        assert!(rows.iter().any(|r| r.get("order_id") == Some(&inserted.key)));
        let op = LogicalOp::SelectByKey {
            table: "t_order".into(),
            filter: Predicate::eq("order_id", inserted.key.clone()),
        };
        let OpOutput::Rows(found) = h.coord.execute(op).await.unwrap() else { panic!("expected rows") };
        assert_eq!(found.len(), 1);
    }
}

#[tokio::test]
async fn update_failure_on_one_target_keeps_the_others() {
    let h = harness();
    let keys = h.load_users(1..=4).await;
    h.dbs[1].set_reachable(false);

    // keys[1] belongs to user 2, stored on ds0.
    let err = h.coord.update_by_id("t_order", keys[1].clone(), &Mutation::new().set("status", "PAID")).await.unwrap_err();
    let partial = err.as_partial_failure().unwrap();
    assert_eq!(partial.partial, OpOutput::Affected(1));
    assert_eq!(partial.failed.len(), 1);
    assert_eq!(partial.failed[0].target.database_id, 1);
    assert_eq!(partial.succeeded.len(), 1);

    let row = Harness::all_targets()
        .into_iter()
        .flat_map(|t| h.rows_at(t))
        .find(|r| r.get("order_id") == Some(&keys[1]))
        .unwrap();
    assert_eq!(row.get("status"), Some(&Value::from("PAID")));
}

#[tokio::test]
async fn aggregate_keeps_the_partial_sum_on_failure() {
    let h = harness();
    h.load_users(1..=10).await;
    h.dbs[1].set_table_offline("t_order_1", true);
    let expected: i64 = Harness::all_targets()
        .into_iter()
        .filter(|t| *t != PhysicalTarget::new(1, 1))
        .flat_map(|t| h.rows_at(t))
        .filter_map(|r| r.get("amount").and_then(Value::as_i64))
        .sum();

    let err = h.coord.aggregate_by_key("t_order", None, &AggregateFn::Sum("amount".into())).await.unwrap_err();
    let partial = err.as_partial_failure().unwrap();
    assert_eq!(partial.failed.len(), 1);
    assert_eq!(partial.failed[0].target, PhysicalTarget::new(1, 1));
    assert_eq!(partial.partial, OpOutput::Value(Value::Int(expected)));
}

#[tokio::test]
async fn sum_over_text_is_an_error() {
    let h = harness();
    h.load_users(1..=4).await;
    let err = h.coord.aggregate_by_key("t_order", None, &AggregateFn::Sum("status".into())).await.unwrap_err();
    let partial = err.as_partial_failure().unwrap();
    assert!(!partial.failed.is_empty());
    assert!(partial
        .failed
        .iter()
        .all(|f| matches!(f.error, TargetError::Backend(BackendError::Query { .. }))));

    h.coord
        .create_record("t_order", Record::new().with("user_id", 5).with("amount", "oops"))
        .await
        .unwrap();
    let err = h.coord.aggregate_by_key("t_order", None, &AggregateFn::Sum("amount".into())).await.unwrap_err();
    let partial = err.as_partial_failure().unwrap();
    assert_eq!(partial.failed.len(), 1);
    assert_eq!(partial.failed[0].target.database_id, 1);
}

struct SlowConnect(MemoryDatabase);

#[async_trait]
impl Connector for SlowConnect {
    async fn connect(&self) -> BackendResult<Box<dyn Connection>> {
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.0.connect().await
    }
}

#[tokio::test]
async fn slow_connects_on_one_database_run_side_by_side() {
    let config = ClusterConfig::from_yaml_str(
        r#"
id_generator: { node_id: 2 }
executor: { max_workers: 2, target_timeout_ms: 1000 }
databases:
  - { name: ds0, url: "memory://ds0", pool: { max_active: 2 } }
tables:
  - name: t_order
    primary_key: order_id
    tables_per_database: 2
    database_sharding: { column: user_id, strategy: { type: modulo } }
    table_sharding: { column: order_id, strategy: { type: modulo } }
"#,
    )
    .unwrap();
    let memory = MemoryDatabase::new("ds0");
    memory.create_table("t_order_0");
    memory.create_table("t_order_1");
    let mut registry = ConnectionRegistry::new();
    registry.add_database("ds0", config.databases[0].pool.clone(), Arc::new(SlowConnect(memory.clone())));
    let coord = Arc::new(Coordinator::new(
        Arc::new(Router::new(ShardingRule::from_config(&config, &StrategyRegistry::new()).unwrap())),
        Arc::new(registry),
        Arc::new(IdGenerator::new(config.id_generator.clone()).unwrap()),
        CoordinatorSettings::from_config(&config),
    ));

    let task = {
        let coord = Arc::clone(&coord);
        tokio::spawn(async move { coord.query_broadcast("t_order", &Predicate::eq("user_id", 4)).await })
    };
    let rows = tokio::time::timeout(Duration::from_secs(5), task).await.unwrap().unwrap().unwrap();
    assert!(rows.is_empty());
    assert_eq!(memory.connect_count(), 2);
}

