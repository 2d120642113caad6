use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::Serialize;
use strata_types::{AggregateFn, DatabaseId, Mutation, Predicate, Record, Value};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::backend::{BackendError, BackendResult, Connection, Connector};
use crate::{PoolConfig, PoolError};

/// Snapshot of one pool, served by the readiness probe.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PoolStatus {
    pub database_id: DatabaseId,
    pub database: String,
    pub max_active: usize,
    pub in_use: usize,
    pub idle: usize,
    pub opened: u64,
    pub closed: bool,
}

/// Bounded pool of connections to one physical database.
///
/// Connections are opened lazily, at most `max_active` are checked out at
/// once, and up to `max_idle` are kept for reuse.
pub struct ConnectionPool {
    database_id: DatabaseId,
    name: String,
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    idle: Mutex<VecDeque<Box<dyn Connection>>>,
    permits: Arc<Semaphore>,
    opened: AtomicU64,
}

impl ConnectionPool {
    pub fn new(
        database_id: DatabaseId,
        name: impl Into<String>,
        config: PoolConfig,
        connector: Arc<dyn Connector>,
    ) -> Arc<Self> {
        Arc::new(Self {
            database_id,
            name: name.into(),
            permits: Arc::new(Semaphore::new(config.max_active)),
            config,
            connector,
            idle: Mutex::new(VecDeque::new()),
            opened: AtomicU64::new(0),
        })
    }

    pub fn database_id(&self) -> DatabaseId {
        self.database_id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Check out a connection, waiting at most `acquire_timeout_ms` for a
    /// free slot. The slot is given back when the returned handle is dropped.
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledConnection, PoolError> {
        let timeout = self.config.acquire_timeout();
        let permit = match tokio::time::timeout(timeout, self.permits.clone().acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(PoolError::Closed { database: self.name.clone() }),
            Err(_) => {
                warn!(database = %self.name, ?timeout, "connection pool exhausted");
                return Err(PoolError::Exhausted { database: self.name.clone(), timeout });
            }
        };
        // The idle lock must be released before connect() suspends.
        let reused = self.idle().pop_front();
        let conn = match reused {
            Some(conn) => conn,
            None => {
                let conn = self
                    .connector
                    .connect()
                    .await
                    .map_err(|source| PoolError::Connect { database: self.name.clone(), source })?;
                self.opened.fetch_add(1, Ordering::Relaxed);
                debug!(database = %self.name, "opened new connection");
                conn
            }
        };
        Ok(PooledConnection {
            conn: Some(conn),
            pool: Arc::clone(self),
            in_flight: false,
            broken: false,
            _permit: permit,
        })
    }

    /// Hand a connection back explicitly. Equivalent to dropping it.
    pub fn release(&self, conn: PooledConnection) {
        drop(conn);
    }

    /// Refuse further acquisitions and drop idle connections.
    pub fn close(&self) {
        self.permits.close();
        self.idle().clear();
    }

    pub fn status(&self) -> PoolStatus {
        PoolStatus {
            database_id: self.database_id,
            database: self.name.clone(),
            max_active: self.config.max_active,
            in_use: self.config.max_active.saturating_sub(self.permits.available_permits()),
            idle: self.idle().len(),
            opened: self.opened.load(Ordering::Relaxed),
            closed: self.permits.is_closed(),
        }
    }

    fn put_back(&self, conn: Box<dyn Connection>) {
        if self.permits.is_closed() {
            return;
        }
        let mut idle = self.idle();
        if idle.len() < self.config.max_idle {
            idle.push_back(conn);
        }
    }

    fn idle(&self) -> MutexGuard<'_, VecDeque<Box<dyn Connection>>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A connection checked out of a [`ConnectionPool`].
///
/// Dropping the handle returns the connection to the pool on every path.
/// Connections that failed with a connection-level error, or that were
/// dropped while a statement was still running, are discarded instead of
/// reused.
pub struct PooledConnection {
    conn: Option<Box<dyn Connection>>,
    pool: Arc<ConnectionPool>,
    in_flight: bool,
    broken: bool,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledConnection")
            .field("database_id", &self.pool.database_id)
            .field("in_flight", &self.in_flight)
            .field("broken", &self.broken)
            .finish_non_exhaustive()
    }
}

impl PooledConnection {
    pub fn database_id(&self) -> DatabaseId {
        self.pool.database_id
    }

    pub fn database_name(&self) -> &str {
        &self.pool.name
    }

    /// Do not return this connection to the pool.
    pub fn mark_broken(&mut self) {
        self.broken = true;
    }

    fn begin(&mut self) -> BackendResult<&mut (dyn Connection + 'static)> {
        self.in_flight = true;
        self.conn.as_deref_mut().ok_or(BackendError::Released)
    }

    fn settle<T>(&mut self, result: &BackendResult<T>) {
        self.in_flight = false;
        if let Err(err) = result {
            if err.is_connection_error() {
                self.broken = true;
            }
        }
    }
}

#[async_trait]
impl Connection for PooledConnection {
    async fn insert(&mut self, table: &str, row: &Record) -> BackendResult<u64> {
        let result = self.begin()?.insert(table, row).await;
        self.settle(&result);
        result
    }

    async fn select(&mut self, table: &str, filter: &Predicate) -> BackendResult<Vec<Record>> {
        let result = self.begin()?.select(table, filter).await;
        self.settle(&result);
        result
    }

    async fn update(&mut self, table: &str, filter: &Predicate, changes: &Mutation) -> BackendResult<u64> {
        let result = self.begin()?.update(table, filter, changes).await;
        self.settle(&result);
        result
    }

    async fn aggregate(&mut self, table: &str, filter: &Predicate, func: &AggregateFn) -> BackendResult<Value> {
        let result = self.begin()?.aggregate(table, filter, func).await;
        self.settle(&result);
        result
    }

    async fn ping(&mut self) -> BackendResult<()> {
        let result = self.begin()?.ping().await;
        self.settle(&result);
        result
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            if self.broken || self.in_flight {
                debug!(database = %self.pool.name, "discarding connection");
            } else {
                self.pool.put_back(conn);
            }
        }
    }
}
