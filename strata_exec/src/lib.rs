//! Execution coordinator: turns logical operations into per-target
//! sub-operations, runs them with bounded concurrency, and merges the
//! results.
use std::fmt;
use std::time::Duration;

use strata_id::IdError;
use strata_pool::{BackendError, PoolError};
use strata_route::RouteError;
use strata_types::{AggregateError, PhysicalTarget, Record};
use thiserror::Error;

mod api;
mod coordinator;
mod op;

pub use coordinator::{Coordinator, CoordinatorSettings};
pub use op::{Inserted, LogicalOp, OpOutput};
pub use tokio_util::sync::CancellationToken;

/// Result type alias for logical operations.
pub type Result<T> = std::result::Result<T, ExecError>;

/// Why one physical target failed.
#[derive(Debug, Clone, Error)]
pub enum TargetError {
    #[error(transparent)]
    Pool(#[from] PoolError),
    #[error(transparent)]
    Backend(#[from] BackendError),
    /// The sub-operation did not finish within its deadline.
    #[error("no answer within {0:?}")]
    Timeout(Duration),
}

impl TargetError {
    /// Label used for the target failure counter.
    pub fn kind(&self) -> &'static str {
        match self {
            TargetError::Pool(PoolError::Exhausted { .. }) => "pool_exhausted",
            TargetError::Pool(_) => "pool",
            TargetError::Backend(_) => "backend",
            TargetError::Timeout(_) => "timeout",
        }
    }
}

/// A failed sub-operation with enough context to find the shard and the
/// request that hit it.
#[derive(Debug, Clone)]
pub struct TargetFailure {
    pub table: String,
    pub target: PhysicalTarget,
    /// Physical location, e.g. `ds1.t_order_0`.
    pub physical: String,
    /// Predicate or key values of the request.
    pub key: String,
    pub error: TargetError,
}

impl fmt::Display for TargetFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}] ({}): {}", self.physical, self.target, self.key, self.error)
    }
}

/// Outcome of a multi-target operation where some targets failed.
#[derive(Debug, Clone)]
pub struct PartialFailure {
    pub table: String,
    pub op: &'static str,
    pub succeeded: Vec<PhysicalTarget>,
    pub failed: Vec<TargetFailure>,
    /// Merged result of the targets that succeeded.
    pub partial: OpOutput,
}

impl PartialFailure {
    /// Rows collected before the failure, for select operations.
    pub fn rows(&self) -> &[Record] {
        match &self.partial {
            OpOutput::Rows(rows) => rows,
            _ => &[],
        }
    }
}

impl fmt::Display for PartialFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "table {}: {} failed on {} of {} targets",
            self.table,
            self.op,
            self.failed.len(),
            self.failed.len() + self.succeeded.len()
        )?;
        for failure in &self.failed {
            write!(f, "; {failure}")?;
        }
        Ok(())
    }
}

/// A cancelled operation: targets that finished before the request was
/// observed, and targets never dispatched.
#[derive(Debug, Clone)]
pub struct Cancelled {
    pub table: String,
    pub op: &'static str,
    pub completed: Vec<PhysicalTarget>,
    pub skipped: Vec<PhysicalTarget>,
    pub partial: OpOutput,
}

/// Errors of the execution coordinator.
#[derive(Debug, Clone, Error)]
pub enum ExecError {
    /// Configuration problem detected while routing. Not retryable.
    #[error("configuration error: {0}")]
    Configuration(#[source] RouteError),
    /// The caller's input cannot be routed.
    #[error("routing error: {0}")]
    Routing(#[source] RouteError),
    /// No connection to the single target became free in time. Retryable.
    #[error("pool exhausted: {0}")]
    PoolExhausted(TargetFailure),
    /// The clock moved backwards past the tolerance; the generator stays
    /// failed until it is rebuilt.
    #[error("clock skew: {0}")]
    ClockSkew(#[source] IdError),
    /// The id generator cannot issue ids for another reason (exhausted
    /// timestamp space, clock before the epoch).
    #[error("id generation failed: {0}")]
    IdGenerator(#[source] IdError),
    /// Per-target aggregate results could not be merged.
    #[error("table {table}: {source}")]
    Aggregate {
        table: String,
        #[source]
        source: AggregateError,
    },
    /// The only target of the operation failed.
    #[error("{0}")]
    Target(TargetFailure),
    #[error("{0}")]
    PartialFailure(Box<PartialFailure>),
    #[error("table {}: {} cancelled with {} targets not dispatched", .0.table, .0.op, .0.skipped.len())]
    Cancelled(Box<Cancelled>),
}

impl From<RouteError> for ExecError {
    fn from(err: RouteError) -> Self {
        if err.is_configuration() {
            ExecError::Configuration(err)
        } else {
            ExecError::Routing(err)
        }
    }
}

impl From<IdError> for ExecError {
    fn from(err: IdError) -> Self {
        match err {
            IdError::ClockSkew { .. } => ExecError::ClockSkew(err),
            _ => ExecError::IdGenerator(err),
        }
    }
}

impl ExecError {
    /// `true` when the caller may retry the same request later.
    pub fn is_retryable(&self) -> bool {
        match self {
            ExecError::PoolExhausted(_) => true,
            ExecError::Target(f) => matches!(f.error, TargetError::Timeout(_)) || matches!(&f.error, TargetError::Pool(p) if p.is_transient()),
            _ => false,
        }
    }

    pub fn as_partial_failure(&self) -> Option<&PartialFailure> {
        match self {
            ExecError::PartialFailure(p) => Some(p),
            _ => None,
        }
    }
}
