use strata_types::{AggregateFn, GeneratedId, Mutation, PhysicalTarget, Predicate, Record, Value};

/// A request against one logical table.
#[derive(Debug, Clone, PartialEq)]
pub enum LogicalOp {
    /// Insert one record, generating its primary key when absent.
    Insert { table: String, record: Record },
    /// Read rows by a predicate that names a key column.
    SelectByKey { table: String, filter: Predicate },
    /// Read rows by any predicate, broadcasting as needed.
    SelectBroadcast { table: String, filter: Predicate },
    /// Update rows by a predicate that names a key column.
    UpdateByKey { table: String, filter: Predicate, changes: Mutation },
    /// Evaluate an aggregate over every routed target and merge.
    Aggregate { table: String, filter: Predicate, func: AggregateFn },
}

impl LogicalOp {
    pub fn table(&self) -> &str {
        match self {
            LogicalOp::Insert { table, .. }
            | LogicalOp::SelectByKey { table, .. }
            | LogicalOp::SelectBroadcast { table, .. }
            | LogicalOp::UpdateByKey { table, .. }
            | LogicalOp::Aggregate { table, .. } => table,
        }
    }

    /// Short name for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            LogicalOp::Insert { .. } => "insert",
            LogicalOp::SelectByKey { .. } => "select_by_key",
            LogicalOp::SelectBroadcast { .. } => "select_broadcast",
            LogicalOp::UpdateByKey { .. } => "update_by_key",
            LogicalOp::Aggregate { .. } => "aggregate",
        }
    }
}

/// Where a record was written and under which key.
#[derive(Debug, Clone, PartialEq)]
pub struct Inserted {
    /// Primary key value as stored.
    pub key: Value,
    /// Set when the key was generated by the coordinator.
    pub generated: Option<GeneratedId>,
    pub target: PhysicalTarget,
    /// Physical location, e.g. `ds1.t_order_0`.
    pub physical: String,
}

/// Result of a logical operation.
#[derive(Debug, Clone, PartialEq)]
pub enum OpOutput {
    Inserted(Inserted),
    /// Rows in completion order of the targets.
    Rows(Vec<Record>),
    Affected(u64),
    Value(Value),
    /// Nothing was produced (e.g. an insert cancelled before dispatch).
    Empty,
}

impl From<Option<Inserted>> for OpOutput {
    fn from(inserted: Option<Inserted>) -> Self {
        inserted.map_or(OpOutput::Empty, OpOutput::Inserted)
    }
}

impl From<Vec<Record>> for OpOutput {
    fn from(rows: Vec<Record>) -> Self {
        OpOutput::Rows(rows)
    }
}

impl From<u64> for OpOutput {
    fn from(affected: u64) -> Self {
        OpOutput::Affected(affected)
    }
}

impl From<Value> for OpOutput {
    fn from(value: Value) -> Self {
        OpOutput::Value(value)
    }
}
