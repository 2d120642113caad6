//! Record-level entry points used by applications.
use strata_types::{AggregateFn, Mutation, Predicate, Record, Value};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::{Coordinator, Inserted, Result};

impl Coordinator {
    /// Insert `fields` into `table` and return the stored primary key,
    /// generated when absent.
    pub async fn create_record(&self, table: &str, fields: Record) -> Result<Inserted> {
        self.insert(table, fields, &CancellationToken::new()).await
    }

    /// Look a record up by primary key. Only the dimension keyed by the
    /// primary key is narrowed; the other one is probed in full.
    pub async fn get_by_id(&self, table: &str, id: impl Into<Value>) -> Result<Option<Record>> {
        let pk = self.router().table(table)?.primary_key().to_string();
        let filter = Predicate::eq(pk, id);
        let mut rows = self.select(table, &filter, true, &CancellationToken::new()).await?;
        if rows.len() > 1 {
            warn!(table, %filter, hits = rows.len(), "primary key found on more than one target");
        }
        Ok(if rows.is_empty() { None } else { Some(rows.swap_remove(0)) })
    }

    /// Records whose `key_field` equals `key_value`.
    pub async fn query_by_key(&self, table: &str, key_field: &str, key_value: impl Into<Value>) -> Result<Vec<Record>> {
        let filter = Predicate::eq(key_field, key_value);
        self.select(table, &filter, true, &CancellationToken::new()).await
    }

    /// Records matching an arbitrary equality predicate, broadcasting over
    /// whatever the predicate leaves open.
    pub async fn query_broadcast(&self, table: &str, filter: &Predicate) -> Result<Vec<Record>> {
        self.select(table, filter, false, &CancellationToken::new()).await
    }

    /// Evaluate `func` over the records matching `key` (every record when
    /// `None`), merged across targets.
    pub async fn aggregate_by_key(&self, table: &str, key: Option<(&str, Value)>, func: &AggregateFn) -> Result<Value> {
        let filter = key.map_or_else(Predicate::all, |(column, value)| Predicate::eq(column, value));
        self.aggregate(table, &filter, func, &CancellationToken::new()).await
    }

    /// Apply `changes` to the record with primary key `id`. Returns the
    /// number of rows changed.
    pub async fn update_by_id(&self, table: &str, id: impl Into<Value>, changes: &Mutation) -> Result<u64> {
        let pk = self.router().table(table)?.primary_key().to_string();
        self.update(table, &Predicate::eq(pk, id), changes, &CancellationToken::new()).await
    }
}
