//! Batch formation
//!
//! Runs after every successful insert. A new batch is only formed when no
//! batch is pending or sending and at least `batch_size` events are
//! unclaimed, so no event id can be owned by two outstanding batches.

use crate::db::Database;
use crate::error::Result;
use crate::types::Batch;

/// Groups stored events into fixed-size delivery batches
#[derive(Debug, Clone, Copy)]
pub struct BatchScheduler {
    batch_size: usize,
}

impl BatchScheduler {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size: batch_size.max(1),
        }
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Form at most one batch from the oldest unclaimed events.
    ///
    /// The check and the claim happen in one write transaction.
    pub fn after_insert(&self, db: &Database) -> Result<Option<Batch>> {
        let batch = db.write(|tx| {
            if Database::has_outstanding_batch_in(tx)? {
                return Ok(None);
            }

            let unbatched = Database::count_unbatched_in(tx)?;
            if unbatched < self.batch_size as i64 {
                return Ok(None);
            }

            let ids = Database::oldest_unbatched_ids_in(tx, self.batch_size)?;
            Database::insert_batch_in(tx, &ids).map(Some)
        })?;

        if let Some(batch) = &batch {
            tracing::info!(
                batch_id = %batch.batch_id,
                events = batch.event_ids.len(),
                "Formed delivery batch"
            );
        }

        Ok(batch)
    }
}
