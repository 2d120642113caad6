use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use thiserror::Error;

use crate::{Record, Value};

/// An aggregate that cannot be evaluated over the values it was given.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum AggregateError {
    /// `sum` met a value that is neither an integer nor a float.
    #[error("{function} over non-numeric value {value}")]
    NotNumeric {
        /// Label of the function, e.g. `sum(amount)`.
        function: String,
        /// Offending value.
        value: Value,
    },
}

/// Aggregate functions that can be computed per shard and merged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "fn", content = "column", rename_all = "snake_case")]
pub enum AggregateFn {
    /// Sum of a numeric column.
    Sum(String),
    /// Number of matching rows.
    Count,
    /// Minimum of a column.
    Min(String),
    /// Maximum of a column.
    Max(String),
}

impl AggregateFn {
    /// Identity element used when a partial result is NULL or empty.
    pub fn identity(&self) -> Value {
        match self {
            AggregateFn::Sum(_) | AggregateFn::Count => Value::Int(0),
            AggregateFn::Min(_) | AggregateFn::Max(_) => Value::Null,
        }
    }

    /// Column the function reads, if any.
    pub fn column(&self) -> Option<&str> {
        match self {
            AggregateFn::Sum(c) | AggregateFn::Min(c) | AggregateFn::Max(c) => Some(c),
            AggregateFn::Count => None,
        }
    }

    /// Compute the function over one shard's rows. Returns NULL for
    /// sum/min/max over zero non-null inputs, like SQL does.
    pub fn compute<'a>(&self, rows: impl IntoIterator<Item = &'a Record>) -> Result<Value, AggregateError> {
        match self {
            AggregateFn::Count => Ok(Value::Int(rows.into_iter().count() as i64)),
            _ => {
                let column = self.column().unwrap_or_default();
                rows.into_iter()
                    .filter_map(|row| row.get_non_null(column).cloned())
                    .try_fold(Value::Null, |acc, v| self.merge(acc, v))
            }
        }
    }

    /// Merge a partial result into an accumulator. NULL on either side is
    /// treated as "no contribution". Sum and count only accept numbers.
    pub fn merge(&self, acc: Value, partial: Value) -> Result<Value, AggregateError> {
        if partial.is_null() {
            return Ok(acc);
        }
        match self {
            AggregateFn::Sum(_) | AggregateFn::Count => {
                let partial = self.numeric(partial)?;
                if acc.is_null() {
                    return Ok(partial);
                }
                Ok(add(self.numeric(acc)?, partial))
            }
            _ if acc.is_null() => Ok(partial),
            AggregateFn::Min(_) => Ok(pick(acc, partial, Ordering::Less)),
            AggregateFn::Max(_) => Ok(pick(acc, partial, Ordering::Greater)),
        }
    }

    fn numeric(&self, value: Value) -> Result<Value, AggregateError> {
        match value {
            Value::Int(_) | Value::Float(_) => Ok(value),
            value => Err(AggregateError::NotNumeric { function: self.label(), value }),
        }
    }

    /// Label used in logs and metrics.
    pub fn label(&self) -> String {
        match self {
            AggregateFn::Sum(c) => format!("sum({c})"),
            AggregateFn::Count => "count(*)".to_string(),
            AggregateFn::Min(c) => format!("min({c})"),
            AggregateFn::Max(c) => format!("max({c})"),
        }
    }
}

/// Both sides are numeric here.
fn add(a: Value, b: Value) -> Value {
    match (&a, &b) {
        (Value::Int(x), Value::Int(y)) => match x.checked_add(*y) {
            Some(sum) => Value::Int(sum),
            None => Value::Float(*x as f64 + *y as f64),
        },
        _ => Value::Float(a.as_f64().unwrap_or_default() + b.as_f64().unwrap_or_default()),
    }
}

fn pick(acc: Value, candidate: Value, wanted: Ordering) -> Value {
    match candidate.partial_cmp_loose(&acc) {
        Some(ord) if ord == wanted => candidate,
        _ => acc,
    }
}
