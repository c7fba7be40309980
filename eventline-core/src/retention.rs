//! Retention sweeper
//!
//! Removes delivered batch records once they are older than the retention
//! window. Pending, sending and failed batches are never touched; failed
//! batches stay until an operator requeues or deletes them.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::db::Database;
use crate::error::Result;

pub struct RetentionSweeper {
    db: Arc<Database>,
    retention: chrono::Duration,
}

impl RetentionSweeper {
    pub fn new(db: Arc<Database>, retention: chrono::Duration) -> Self {
        Self { db, retention }
    }

    /// Delete complete batches whose `sent_at` is before `now - retention`
    pub fn sweep(&self, now: DateTime<Utc>) -> Result<usize> {
        let cutoff = now - self.retention;
        let deleted = self
            .db
            .write(|tx| Database::delete_complete_batches_before_in(tx, cutoff))?;

        tracing::info!(deleted, cutoff = %cutoff, "Retention sweep finished");
        Ok(deleted)
    }
}
