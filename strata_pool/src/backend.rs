use async_trait::async_trait;
use strata_types::{AggregateFn, Mutation, Predicate, Record, Value};
use thiserror::Error;

/// Result type alias for driver calls.
pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Errors reported by a physical database driver.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BackendError {
    /// The database cannot be reached.
    #[error("database {database} unreachable")]
    Unreachable {
        /// Database name.
        database: String,
    },
    /// The physical table does not exist.
    #[error("table {table} does not exist in {database}")]
    UnknownTable {
        /// Database name.
        database: String,
        /// Physical table name.
        table: String,
    },
    /// The statement failed for another reason.
    #[error("query on {database} failed: {message}")]
    Query {
        /// Database name.
        database: String,
        /// Driver message.
        message: String,
    },
    /// The connection was already returned to its pool.
    #[error("connection already released")]
    Released,
}

impl BackendError {
    /// `true` when the connection that produced the error must not be reused.
    pub fn is_connection_error(&self) -> bool {
        matches!(self, BackendError::Unreachable { .. } | BackendError::Released)
    }
}

/// One open session to a physical database.
///
/// Statements are expressed structurally (table name, equality predicate,
/// assignments); the driver turns them into whatever its database speaks.
#[async_trait]
pub trait Connection: Send {
    /// Insert one row into `table`, returning the number of rows written.
    async fn insert(&mut self, table: &str, row: &Record) -> BackendResult<u64>;

    /// Rows of `table` matching `filter`.
    async fn select(&mut self, table: &str, filter: &Predicate) -> BackendResult<Vec<Record>>;

    /// Apply `changes` to rows matching `filter`, returning the affected count.
    async fn update(&mut self, table: &str, filter: &Predicate, changes: &Mutation) -> BackendResult<u64>;

    /// Evaluate `func` over rows matching `filter`. NULL when nothing matched.
    async fn aggregate(&mut self, table: &str, filter: &Predicate, func: &AggregateFn) -> BackendResult<Value>;

    /// Round trip used by health checks.
    async fn ping(&mut self) -> BackendResult<()>;
}

/// Opens connections to one physical database.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a new connection.
    async fn connect(&self) -> BackendResult<Box<dyn Connection>>;
}
