use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{stream, StreamExt};
use strata_id::IdGenerator;
use strata_meta::{ClusterConfig, KeyGenerator};
use strata_pool::{BackendError, Connection, ConnectionRegistry, PoolError};
use strata_route::{RouteError, RouteResult, Router, TableRule};
use strata_types::{AggregateFn, Mutation, PhysicalTarget, Predicate, Record, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::op::{Inserted, LogicalOp, OpOutput};
use crate::{Cancelled, ExecError, PartialFailure, Result, TargetError, TargetFailure};

/// Fan-out limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoordinatorSettings {
    /// Sub-operations of one logical operation running at once.
    pub max_workers: usize,
    /// Deadline of each sub-operation, pool acquisition included.
    pub target_timeout: Duration,
}

impl CoordinatorSettings {
    pub fn from_config(config: &ClusterConfig) -> Self {
        Self { max_workers: config.max_workers(), target_timeout: config.executor.target_timeout() }
    }
}

/// One physical statement.
enum Work<'a> {
    Insert(&'a Record),
    Select(&'a Predicate),
    Update(&'a Predicate, &'a Mutation),
    Aggregate(&'a Predicate, &'a AggregateFn),
}

/// One target's contribution.
enum Partial {
    Rows(Vec<Record>),
    Affected(u64),
    Value(Value),
}

/// Per-target outcomes of one dispatch.
struct FanOut {
    succeeded: Vec<PhysicalTarget>,
    partials: Vec<Partial>,
    failed: Vec<TargetFailure>,
    skipped: Vec<PhysicalTarget>,
}

impl FanOut {
    /// Fold the successful partials in completion order.
    fn fold<T>(&mut self, init: T, f: impl FnMut(T, Partial) -> T) -> T {
        std::mem::take(&mut self.partials).into_iter().fold(init, f)
    }
}

/// Executes logical operations against the physical shards.
///
/// Routing configuration and pools are shared read-only; every call is
/// independent, so one coordinator serves any number of concurrent callers.
pub struct Coordinator {
    router: Arc<Router>,
    pools: Arc<ConnectionRegistry>,
    ids: Arc<IdGenerator>,
    settings: CoordinatorSettings,
}

impl Coordinator {
    pub fn new(
        router: Arc<Router>,
        pools: Arc<ConnectionRegistry>,
        ids: Arc<IdGenerator>,
        settings: CoordinatorSettings,
    ) -> Self {
        let settings = CoordinatorSettings { max_workers: settings.max_workers.max(1), ..settings };
        Self { router, pools, ids, settings }
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn pools(&self) -> &Arc<ConnectionRegistry> {
        &self.pools
    }

    pub fn id_generator(&self) -> &IdGenerator {
        &self.ids
    }

    pub fn settings(&self) -> CoordinatorSettings {
        self.settings
    }

    /// Run `op` to completion.
    pub async fn execute(&self, op: LogicalOp) -> Result<OpOutput> {
        self.execute_with_cancel(op, &CancellationToken::new()).await
    }

    /// Run `op`, stopping dispatch once `cancel` fires. Sub-operations
    /// already running finish; the call then fails with
    /// [`ExecError::Cancelled`] if any target was left out.
    #[instrument(skip_all, fields(op = op.label(), table = op.table()))]
    pub async fn execute_with_cancel(&self, op: LogicalOp, cancel: &CancellationToken) -> Result<OpOutput> {
        let label = op.label();
        let started = Instant::now();
        let result = match op {
            LogicalOp::Insert { table, record } => self.insert(&table, record, cancel).await.map(OpOutput::Inserted),
            LogicalOp::SelectByKey { table, filter } => self.select(&table, &filter, true, cancel).await.map(OpOutput::Rows),
            LogicalOp::SelectBroadcast { table, filter } => {
                self.select(&table, &filter, false, cancel).await.map(OpOutput::Rows)
            }
            LogicalOp::UpdateByKey { table, filter, changes } => {
                self.update(&table, &filter, &changes, cancel).await.map(OpOutput::Affected)
            }
            LogicalOp::Aggregate { table, filter, func } => {
                self.aggregate(&table, &filter, &func, cancel).await.map(OpOutput::Value)
            }
        };
        strata_metrics::observe_op(label, started.elapsed().as_secs_f64());
        if let Err(e) = &result {
            debug!(op = label, error = %e, "logical operation failed");
        }
        result
    }

    pub(crate) async fn insert(&self, table: &str, mut record: Record, cancel: &CancellationToken) -> Result<Inserted> {
        let rule = Arc::clone(self.router.table(table)?);
        let pk = rule.primary_key();
        let mut generated = None;
        if record.get_non_null(pk).is_none() {
            match rule.key_generator() {
                KeyGenerator::Snowflake => {
                    let id = self.ids.next_id()?;
                    strata_metrics::record_id_generated();
                    record.set(pk, id);
                    generated = Some(id);
                }
                KeyGenerator::None => {
                    return Err(RouteError::IncompleteKey { table: table.to_string(), column: pk.to_string() }.into())
                }
            }
        }
        rule.apply_defaults(&mut record);
        if let Some(column) = rule.created_at_column() {
            if record.get_non_null(column).is_none() {
                record.set(column, now_rfc3339());
            }
        }
        let route = self.router.route_record(table, &record)?;
        let key = record.get(pk).cloned().unwrap_or(Value::Null);
        let Some(&target) = route.targets.first() else {
            return Err(RouteError::IncompleteKey { table: table.to_string(), column: pk.to_string() }.into());
        };
        let key_text = format!("{pk} = {key}");
        let mut fanout = self.dispatch(&route, &key_text, Work::Insert(&record), "insert", cancel).await;
        let written = fanout.fold(0, sum_affected);
        let inserted = (written > 0).then(|| Inserted { key, generated, target, physical: rule.describe(target) });
        match self.conclude(&route, "insert", fanout, inserted)? {
            Some(inserted) => {
                debug!(table, key = %inserted.key, target = %inserted.physical, "record inserted");
                Ok(inserted)
            }
            None => Err(ExecError::Target(TargetFailure {
                table: table.to_string(),
                target,
                physical: rule.describe(target),
                key: key_text,
                error: TargetError::Backend(BackendError::Query {
                    database: rule.database_name(target.database_id).unwrap_or_default().to_string(),
                    message: "insert wrote no row".into(),
                }),
            })),
        }
    }

    pub(crate) async fn select(
        &self,
        table: &str,
        filter: &Predicate,
        keyed: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<Record>> {
        let route = if keyed { self.router.route_by_key(table, filter)? } else { self.router.route(table, filter)? };
        let key = filter.to_string();
        let mut fanout = self.dispatch(&route, &key, Work::Select(filter), "select", cancel).await;
        let rows = fanout.fold(Vec::new(), |mut acc, p| {
            if let Partial::Rows(rows) = p {
                acc.extend(rows);
            }
            acc
        });
        self.conclude(&route, "select", fanout, rows)
    }

    pub(crate) async fn update(
        &self,
        table: &str,
        filter: &Predicate,
        changes: &Mutation,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        self.router.check_mutation(table, changes.columns())?;
        let route = self.router.route_by_key(table, filter)?;
        let key = filter.to_string();
        let mut fanout = self.dispatch(&route, &key, Work::Update(filter, changes), "update", cancel).await;
        let affected = fanout.fold(0, sum_affected);
        self.conclude(&route, "update", fanout, affected)
    }

    pub(crate) async fn aggregate(
        &self,
        table: &str,
        filter: &Predicate,
        func: &AggregateFn,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let route = self.router.route(table, filter)?;
        if let Some(column) = func.column() {
            route.table.check_columns([column])?;
        }
        let key = filter.to_string();
        let mut fanout = self.dispatch(&route, &key, Work::Aggregate(filter, func), "aggregate", cancel).await;
        let merged = fanout.fold(Ok(Value::Null), |acc, p| match (acc, p) {
            (Ok(acc), Partial::Value(v)) => func.merge(acc, v),
            (acc, _) => acc,
        });
        let merged = merged.map_err(|source| ExecError::Aggregate { table: table.to_string(), source })?;
        // Merging only NULL partials leaves NULL; sum and count start at 0.
        let merged = if merged.is_null() { func.identity() } else { merged };
        self.conclude(&route, "aggregate", fanout, merged)
    }

    /// Run `work` on every routed target, at most `max_workers` at a time.
    async fn dispatch(
        &self,
        route: &RouteResult,
        key: &str,
        work: Work<'_>,
        op: &'static str,
        cancel: &CancellationToken,
    ) -> FanOut {
        let rule = route.table.as_ref();
        let work = &work;
        strata_metrics::record_fanout(op, route.targets.len());
        // Each sub-operation checks for cancellation when it gets a worker
        // slot, so nothing new starts once the token fires.
        let outcomes: Vec<_> = stream::iter(route.targets.iter().copied())
            .map(|target| async move {
                if cancel.is_cancelled() {
                    return (target, None);
                }
                (target, Some(self.run_target(rule, target, work).await))
            })
            .buffer_unordered(self.settings.max_workers)
            .collect()
            .await;

        let mut fanout = FanOut { succeeded: Vec::new(), partials: Vec::new(), failed: Vec::new(), skipped: Vec::new() };
        for (target, outcome) in outcomes {
            match outcome {
                None => fanout.skipped.push(target),
                Some(Ok(partial)) => {
                    fanout.succeeded.push(target);
                    fanout.partials.push(partial);
                }
                Some(Err(error)) => {
                    strata_metrics::record_target_failure(error.kind());
                    warn!(table = rule.name(), target = %rule.describe(target), key, %error, "target failed");
                    fanout.failed.push(TargetFailure {
                        table: rule.name().to_string(),
                        target,
                        physical: rule.describe(target),
                        key: key.to_string(),
                        error,
                    });
                }
            }
        }
        fanout
    }

    async fn run_target(&self, rule: &TableRule, target: PhysicalTarget, work: &Work<'_>) -> std::result::Result<Partial, TargetError> {
        let physical = rule.physical_table_name(target.table_id);
        let statement = async {
            let mut conn = self.pools.acquire(target.database_id).await?;
            let partial = match *work {
                Work::Insert(record) => Partial::Affected(conn.insert(&physical, record).await?),
                Work::Select(filter) => Partial::Rows(conn.select(&physical, filter).await?),
                Work::Update(filter, changes) => Partial::Affected(conn.update(&physical, filter, changes).await?),
                Work::Aggregate(filter, func) => Partial::Value(conn.aggregate(&physical, filter, func).await?),
            };
            Ok::<_, TargetError>(partial)
        };
        match tokio::time::timeout(self.settings.target_timeout, statement).await {
            Ok(outcome) => outcome,
            Err(_) => Err(TargetError::Timeout(self.settings.target_timeout)),
        }
    }

    /// Turn per-target outcomes into the operation's result.
    ///
    /// Skipped targets mean cancellation. A single-target route surfaces its
    /// error directly; with several targets any failure becomes a
    /// [`PartialFailure`] carrying what the others produced.
    fn conclude<T: Into<OpOutput>>(&self, route: &RouteResult, op: &'static str, mut fanout: FanOut, value: T) -> Result<T> {
        let table = route.table.name().to_string();
        if !fanout.skipped.is_empty() {
            let mut completed = fanout.succeeded;
            completed.extend(fanout.failed.iter().map(|f| f.target));
            warn!(table, op, skipped = fanout.skipped.len(), "operation cancelled");
            return Err(ExecError::Cancelled(Box::new(Cancelled {
                table,
                op,
                completed,
                skipped: fanout.skipped,
                partial: value.into(),
            })));
        }
        if fanout.failed.is_empty() {
            return Ok(value);
        }
        if route.targets.len() == 1 {
            if let Some(failure) = fanout.failed.pop() {
                return Err(match failure.error {
                    TargetError::Pool(PoolError::Exhausted { .. }) => ExecError::PoolExhausted(failure),
                    _ => ExecError::Target(failure),
                });
            }
        }
        Err(ExecError::PartialFailure(Box::new(PartialFailure {
            table,
            op,
            succeeded: fanout.succeeded,
            failed: fanout.failed,
            partial: value.into(),
        })))
    }
}

fn sum_affected(acc: u64, partial: Partial) -> u64 {
    match partial {
        Partial::Affected(n) => acc + n,
        _ => acc,
    }
}

fn now_rfc3339() -> String {
    let now = OffsetDateTime::now_utc();
    now.format(&Rfc3339).unwrap_or_else(|_| now.unix_timestamp().to_string())
}
