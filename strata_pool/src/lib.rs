//! Connection management for StrataDB: one pool per physical database,
//! the driver seam physical databases are reached through, and an
//! in-memory driver used by tests and the demo cluster.
use std::time::Duration;

use serde::Deserialize;
use strata_types::DatabaseId;
use thiserror::Error;

mod backend;
mod memory;
mod pool;
mod registry;

pub use backend::{BackendError, BackendResult, Connection, Connector};
pub use memory::MemoryDatabase;
pub use pool::{ConnectionPool, PoolStatus, PooledConnection};
pub use registry::ConnectionRegistry;

fn default_max_active() -> usize {
    8
}

fn default_max_idle() -> usize {
    4
}

fn default_acquire_timeout_ms() -> u64 {
    1_000
}

/// Sizing of a single database pool.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PoolConfig {
    /// Upper bound on connections checked out at once.
    #[serde(default = "default_max_active")]
    pub max_active: usize,
    /// Connections kept open while idle.
    #[serde(default = "default_max_idle")]
    pub max_idle: usize,
    /// How long `acquire` waits for a free slot.
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_active: default_max_active(),
            max_idle: default_max_idle(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
        }
    }
}

impl PoolConfig {
    /// Acquisition deadline.
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

/// Pool-level failures.
#[derive(Debug, Clone, Error)]
pub enum PoolError {
    /// No connection slot became free before the acquisition deadline.
    #[error("pool for {database} exhausted: no connection within {timeout:?}")]
    Exhausted {
        /// Database name.
        database: String,
        /// Deadline that expired.
        timeout: Duration,
    },
    /// Opening a new physical connection failed.
    #[error("cannot connect to {database}: {source}")]
    Connect {
        /// Database name.
        database: String,
        /// Driver error.
        #[source]
        source: BackendError,
    },
    /// No pool is registered for this database id.
    #[error("no pool registered for database #{0}")]
    UnknownDatabase(DatabaseId),
    /// The pool was shut down.
    #[error("pool for {database} is closed")]
    Closed {
        /// Database name.
        database: String,
    },
}

impl PoolError {
    /// `true` when retrying later may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, PoolError::Exhausted { .. } | PoolError::Connect { .. })
    }
}
