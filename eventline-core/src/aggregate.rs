//! Keyed rollups maintained by read-modify-write
//!
//! Callers pass a pure reducer that maps the previous value (or `None` on the
//! first write) to the next one. The read, the reducer call and the write all
//! happen inside one storage transaction, so concurrent updates of the same id
//! never lose an increment.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::db::Database;
use crate::error::Result;
use crate::types::Aggregate;

/// Conventional aggregate id: `<family>_<YYYY-MM-DD>`
pub fn aggregate_key(family: &str, date: NaiveDate) -> String {
    format!("{}_{}", family, date.format("%Y-%m-%d"))
}

/// Typed access to the aggregates collection
#[derive(Clone)]
pub struct AggregateEngine {
    db: Arc<Database>,
}

impl AggregateEngine {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Apply `reducer` to the stored value of `id` and persist the result.
    ///
    /// The reducer must be fast and free of side effects; it runs while the
    /// store's write transaction is open.
    pub fn update<T, F>(&self, id: &str, aggregate_type: &str, reducer: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(Option<T>) -> T,
    {
        let aggregate = self.db.update_aggregate(id, aggregate_type, |previous| {
            let previous = previous.map(serde_json::from_value::<T>).transpose()?;
            Ok(serde_json::to_value(reducer(previous))?)
        })?;

        tracing::trace!(id, aggregate_type, "Aggregate updated");
        Ok(serde_json::from_value(aggregate.data)?)
    }

    /// Current value of `id`, if it has ever been written
    pub fn get<T: DeserializeOwned>(&self, id: &str) -> Result<Option<T>> {
        match self.db.get_aggregate(id)? {
            Some(aggregate) => Ok(Some(serde_json::from_value(aggregate.data)?)),
            None => Ok(None),
        }
    }

    /// Raw aggregates, optionally restricted to one family
    pub fn list(&self, aggregate_type: Option<&str>) -> Result<Vec<Aggregate>> {
        self.db.list_aggregates(aggregate_type)
    }
}

/// A plain running count
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter {
    pub count: u64,
}

impl Counter {
    pub fn increment(previous: Option<Counter>) -> Counter {
        Counter::add(previous, 1)
    }

    pub fn add(previous: Option<Counter>, n: u64) -> Counter {
        let previous = previous.unwrap_or_default();
        Counter {
            count: previous.count.saturating_add(n),
        }
    }
}

/// Counts per bucket label plus the overall total
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Distribution {
    pub total: u64,
    pub buckets: BTreeMap<String, u64>,
}

impl Distribution {
    pub fn record(previous: Option<Distribution>, bucket: &str) -> Distribution {
        let mut dist = previous.unwrap_or_default();
        dist.total = dist.total.saturating_add(1);
        *dist.buckets.entry(bucket.to_string()).or_insert(0) += 1;
        dist
    }

    /// Share of the total that fell into `bucket`
    pub fn share(&self, bucket: &str) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.buckets.get(bucket).copied().unwrap_or(0) as f64 / self.total as f64
    }
}
