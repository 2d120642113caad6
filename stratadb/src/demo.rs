//! Sample order workload against the `t_order` table: batch insert with
//! route printout, per-user reads, a broadcast total and a status update.
use anyhow::{anyhow, Result};
use strata_exec::{Coordinator, Inserted};
use strata_types::{AggregateFn, Mutation, Predicate, Record, Value};

/// Table the demo writes to.
pub const DEMO_TABLE: &str = "t_order";

/// One inserted order and where the router sent it.
#[derive(Debug, Clone)]
pub struct DemoInsert {
    /// User the order belongs to.
    pub user_id: i64,
    /// Insert outcome.
    pub inserted: Inserted,
}

/// What the demo did.
#[derive(Debug, Clone)]
pub struct DemoReport {
    /// Inserts in order.
    pub inserts: Vec<DemoInsert>,
    /// Orders read back per user.
    pub per_user: Vec<(i64, Vec<Record>)>,
    /// `sum(amount)` over every shard.
    pub total: Value,
    /// Rows moved to `PAID`.
    pub paid: u64,
    /// Rows found by the status broadcast afterwards.
    pub paid_rows: Vec<Record>,
}

/// Insert one order per user in `1..=users` with amount `user * 100`, then
/// read everything back.
pub async fn run(coordinator: &Coordinator, users: i64) -> Result<DemoReport> {
    let mut inserts = Vec::new();
    for user_id in 1..=users {
        let record = Record::new().with("user_id", user_id).with("amount", user_id * 100);
        let inserted = coordinator.create_record(DEMO_TABLE, record).await?;
        inserts.push(DemoInsert { user_id, inserted });
    }

    let mut per_user = Vec::new();
    for user_id in 1..=users {
        per_user.push((user_id, coordinator.query_by_key(DEMO_TABLE, "user_id", user_id).await?));
    }

    let total = coordinator.aggregate_by_key(DEMO_TABLE, None, &AggregateFn::Sum("amount".into())).await?;

    let first = inserts.first().ok_or_else(|| anyhow!("no orders inserted"))?;
    let paid = coordinator
        .update_by_id(DEMO_TABLE, first.inserted.key.clone(), &Mutation::new().set("status", "PAID"))
        .await?;
    let paid_rows = coordinator.query_broadcast(DEMO_TABLE, &Predicate::eq("status", "PAID")).await?;

    Ok(DemoReport { inserts, per_user, total, paid, paid_rows })
}
