//! In-memory physical database.
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use strata_types::{AggregateFn, Mutation, Predicate, Record, Value};

use crate::backend::{BackendError, BackendResult, Connection, Connector};

/// A database held entirely in memory. Cloning yields another handle to the
/// same data.
#[derive(Debug, Clone)]
pub struct MemoryDatabase {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    name: String,
    tables: Mutex<HashMap<String, Vec<Record>>>,
    reachable: AtomicBool,
    offline_tables: Mutex<HashSet<String>>,
    latency_ms: AtomicU64,
    connects: AtomicU64,
    statements: AtomicU64,
}

impl MemoryDatabase {
    /// Empty database called `name`.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                tables: Mutex::new(HashMap::new()),
                reachable: AtomicBool::new(true),
                offline_tables: Mutex::new(HashSet::new()),
                latency_ms: AtomicU64::new(0),
                connects: AtomicU64::new(0),
                statements: AtomicU64::new(0),
            }),
        }
    }

    /// Database name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Create `table` if it does not exist yet.
    pub fn create_table(&self, table: &str) {
        self.tables().entry(table.to_string()).or_default();
    }

    /// Names of existing tables, sorted.
    pub fn table_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.tables().keys().cloned().collect();
        names.sort();
        names
    }

    /// Snapshot of the rows of `table` (empty when it does not exist).
    pub fn rows(&self, table: &str) -> Vec<Record> {
        self.tables().get(table).cloned().unwrap_or_default()
    }

    /// Simulate an outage: connects and statements fail while unreachable.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Make statements against one table fail as if its storage were
    /// unreachable, leaving the rest of the database up.
    pub fn set_table_offline(&self, table: &str, offline: bool) {
        let mut tables = self.inner.offline_tables.lock().unwrap_or_else(PoisonError::into_inner);
        if offline {
            tables.insert(table.to_string());
        } else {
            tables.remove(table);
        }
    }

    /// Delay every statement by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.inner.latency_ms.store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Number of connections opened so far.
    pub fn connect_count(&self) -> u64 {
        self.inner.connects.load(Ordering::SeqCst)
    }

    /// Number of statements executed so far.
    pub fn statement_count(&self) -> u64 {
        self.inner.statements.load(Ordering::SeqCst)
    }

    fn tables(&self) -> MutexGuard<'_, HashMap<String, Vec<Record>>> {
        self.inner.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn check_reachable(&self) -> BackendResult<()> {
        if self.inner.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BackendError::Unreachable { database: self.inner.name.clone() })
        }
    }

    async fn begin_statement(&self, table: &str) -> BackendResult<()> {
        self.check_reachable()?;
        let offline = self.inner.offline_tables.lock().unwrap_or_else(PoisonError::into_inner).contains(table);
        if offline {
            return Err(BackendError::Unreachable { database: format!("{}.{table}", self.inner.name) });
        }
        let latency = self.inner.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        self.inner.statements.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn with_table<T>(&self, table: &str, f: impl FnOnce(&mut Vec<Record>) -> T) -> BackendResult<T> {
        let mut tables = self.tables();
        let rows = tables.get_mut(table).ok_or_else(|| BackendError::UnknownTable {
            database: self.inner.name.clone(),
            table: table.to_string(),
        })?;
        Ok(f(rows))
    }
}

#[async_trait]
impl Connector for MemoryDatabase {
    async fn connect(&self) -> BackendResult<Box<dyn Connection>> {
        self.check_reachable()?;
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(MemoryConnection { db: self.clone() }))
    }
}

struct MemoryConnection {
    db: MemoryDatabase,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn insert(&mut self, table: &str, row: &Record) -> BackendResult<u64> {
        self.db.begin_statement(table).await?;
        self.db.with_table(table, |rows| {
            rows.push(row.clone());
            1
        })
    }

    async fn select(&mut self, table: &str, filter: &Predicate) -> BackendResult<Vec<Record>> {
        self.db.begin_statement(table).await?;
        self.db.with_table(table, |rows| rows.iter().filter(|r| filter.matches(r)).cloned().collect())
    }

    async fn update(&mut self, table: &str, filter: &Predicate, changes: &Mutation) -> BackendResult<u64> {
        self.db.begin_statement(table).await?;
        self.db.with_table(table, |rows| {
            let mut affected = 0;
            for row in rows.iter_mut().filter(|r| filter.matches(r)) {
                changes.apply(row);
                affected += 1;
            }
            affected
        })
    }

    async fn aggregate(&mut self, table: &str, filter: &Predicate, func: &AggregateFn) -> BackendResult<Value> {
        self.db.begin_statement(table).await?;
        self.db
            .with_table(table, |rows| func.compute(rows.iter().filter(|r| filter.matches(r))))?
            .map_err(|err| BackendError::Query { database: self.db.inner.name.clone(), message: err.to_string() })
    }

    async fn ping(&mut self) -> BackendResult<()> {
        self.db.check_reachable()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn crud_against_memory_tables() {
        let db = MemoryDatabase::new("ds0");
        db.create_table("t_order_0");
        let mut conn = db.connect().await.unwrap();
        conn.insert("t_order_0", &Record::new().with("order_id", 1).with("amount", 10)).await.unwrap();
        conn.insert("t_order_0", &Record::new().with("order_id", 2).with("amount", 20)).await.unwrap();

        let rows = conn.select("t_order_0", &Predicate::eq("order_id", 2)).await.unwrap();
        assert_eq!(rows.len(), 1);

        let n = conn
            .update("t_order_0", &Predicate::eq("order_id", 1), &Mutation::new().set("status", "PAID"))
            .await
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(db.rows("t_order_0")[0].get("status"), Some(&Value::from("PAID")));

        let sum = conn.aggregate("t_order_0", &Predicate::all(), &AggregateFn::Sum("amount".into())).await.unwrap();
        assert_eq!(sum, Value::Int(30));
        let none = conn
            .aggregate("t_order_0", &Predicate::eq("order_id", 99), &AggregateFn::Sum("amount".into()))
            .await
            .unwrap();
        assert!(none.is_null());
    }

    #[tokio::test]
    async fn non_numeric_sum_is_a_query_error() {
        let db = MemoryDatabase::new("ds0");
        db.create_table("t_order_0");
        let mut conn = db.connect().await.unwrap();
        conn.insert("t_order_0", &Record::new().with("amount", 10).with("status", "CREATED")).await.unwrap();
        conn.insert("t_order_0", &Record::new().with("amount", "oops")).await.unwrap();

        for column in ["amount", "status"] {
            let err = conn
                .aggregate("t_order_0", &Predicate::all(), &AggregateFn::Sum(column.into()))
                .await
                .unwrap_err();
            assert!(matches!(err, BackendError::Query { .. }), "{err}");
            assert!(!err.is_connection_error());
        }
    }

    #[tokio::test]
    async fn unknown_table_and_outage() {
        let db = MemoryDatabase::new("ds1");
        let mut conn = db.connect().await.unwrap();
        let err = conn.select("nope", &Predicate::all()).await.unwrap_err();
        assert!(matches!(err, BackendError::UnknownTable { .. }));

        db.set_reachable(false);
        assert!(conn.ping().await.unwrap_err().is_connection_error());
        assert!(db.connect().await.is_err());
    }

    #[tokio::test]
    async fn single_table_outage() {
        let db = MemoryDatabase::new("ds0");
        db.create_table("t_0");
        db.create_table("t_1");
        db.set_table_offline("t_1", true);
        let mut conn = db.connect().await.unwrap();
        assert!(conn.select("t_0", &Predicate::all()).await.is_ok());
        assert!(conn.select("t_1", &Predicate::all()).await.unwrap_err().is_connection_error());
    }
}
