//! Sync engine: drives batches through delivery
//!
//! ```text
//! pending --claim--> sending --2xx--> complete   (events deleted in the same transaction)
//!                       |
//!                       +--failure, attempts < max_retries--> pending (backing off)
//!                       +--failure, attempts >= max_retries--> failed  (terminal, events kept)
//! ```
//!
//! `attempts` counts observed delivery outcomes. It is bumped after the
//! transport returns, never before the call, so a process that dies mid-call
//! leaves the batch in `sending` with the attempt uncounted.
//! [`SyncEngine::recover_in_flight`] returns such batches to `pending`.
//!
//! Within a running process a batch never stays in `sending`. If the store
//! write that records an outcome keeps failing, the batch is released back to
//! `pending` (a delivered batch may then be sent twice). A release that also
//! fails is remembered and retried at the start of the next run.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::db::Database;
use crate::error::{Error, Result};
use crate::transport::Transport;
use crate::types::{Batch, BatchPayload, BatchStatus, Event, SyncReport};

/// Longest delay between two attempts of the same batch
const MAX_BACKOFF_SECS: u64 = 3600;

/// Store writes recording a delivery outcome are tried this many times
const OUTCOME_WRITE_ATTEMPTS: u32 = 3;

const OUTCOME_WRITE_DELAY: Duration = Duration::from_millis(200);

/// Outcome of delivering one batch
enum Delivery {
    Completed { events: usize },
    Retrying,
    Failed,
    Interrupted,
}

/// Delivers pending batches through a [`Transport`]
pub struct SyncEngine {
    db: Arc<Database>,
    transport: Arc<dyn Transport>,
    max_retries: u32,
    retry_backoff_secs: u64,
    /// Claimed batches this engine could not return to `pending`
    stranded: Mutex<Vec<Batch>>,
}

impl SyncEngine {
    pub fn new(
        db: Arc<Database>,
        transport: Arc<dyn Transport>,
        max_retries: u32,
        retry_backoff_secs: u64,
    ) -> Self {
        Self {
            db,
            transport,
            max_retries: max_retries.max(1),
            retry_backoff_secs,
            stranded: Mutex::new(Vec::new()),
        }
    }

    /// Reset batches left in `sending` by a previous process to `pending`.
    ///
    /// The interrupted attempt is not counted.
    pub fn recover_in_flight(&self) -> Result<usize> {
        let recovered = self.db.write(|tx| {
            let in_flight = Database::list_batches_in(tx, Some(BatchStatus::Sending))?;
            for mut batch in in_flight.iter().cloned() {
                batch.status = BatchStatus::Pending;
                batch.next_attempt_at = None;
                Database::update_batch_in(tx, &batch)?;
            }
            Ok(in_flight.len())
        })?;

        if recovered > 0 {
            tracing::warn!(recovered, "Recovered batches interrupted mid-delivery");
        }
        Ok(recovered)
    }

    /// Process every pending batch once.
    ///
    /// With `respect_backoff`, batches whose `next_attempt_at` lies in the
    /// future are skipped and counted as deferred. A store error on one batch
    /// is logged and the run moves on to the next.
    pub async fn run_once(&self, respect_backoff: bool) -> Result<SyncReport> {
        let mut report = SyncReport::default();
        self.release_stranded();
        let now = Utc::now();

        for batch in self.db.list_batches(Some(BatchStatus::Pending))? {
            if respect_backoff && batch.next_attempt_at.is_some_and(|at| at > now) {
                report.batches_deferred += 1;
                continue;
            }

            let (batch, events) = match self.claim(&batch.batch_id) {
                Ok(Some(claimed)) => claimed,
                Ok(None) => continue,
                Err(e) => {
                    tracing::warn!(batch_id = %batch.batch_id, error = %e, "Could not claim batch");
                    continue;
                }
            };
            report.batches_attempted += 1;

            match self.deliver(batch, events).await {
                Delivery::Completed { events } => {
                    report.batches_completed += 1;
                    report.events_delivered += events;
                }
                Delivery::Retrying => report.batches_retrying += 1,
                Delivery::Failed => report.batches_failed += 1,
                Delivery::Interrupted => report.batches_interrupted += 1,
            }
        }

        if report.batches_attempted > 0 || report.batches_deferred > 0 {
            tracing::info!(
                attempted = report.batches_attempted,
                completed = report.batches_completed,
                retrying = report.batches_retrying,
                failed = report.batches_failed,
                deferred = report.batches_deferred,
                interrupted = report.batches_interrupted,
                events = report.events_delivered,
                "Sync run finished"
            );
        }

        Ok(report)
    }

    /// Move a still-pending batch to `sending` and load its events.
    ///
    /// Returns `None` if another run claimed it first.
    fn claim(&self, batch_id: &str) -> Result<Option<(Batch, Vec<Event>)>> {
        self.db.write(|tx| {
            let Some(mut batch) = Database::batch_in(tx, batch_id)? else {
                return Ok(None);
            };
            if batch.status != BatchStatus::Pending {
                return Ok(None);
            }

            batch.status = BatchStatus::Sending;
            Database::update_batch_in(tx, &batch)?;

            let events = Database::events_in(tx, &batch.event_ids)?;
            Ok(Some((batch, events)))
        })
    }

    async fn deliver(&self, mut batch: Batch, events: Vec<Event>) -> Delivery {
        if events.is_empty() {
            tracing::warn!(
                batch_id = %batch.batch_id,
                "Batch has no stored events left, marking complete"
            );
            batch.status = BatchStatus::Complete;
            batch.sent_at = Some(Utc::now());
            batch.next_attempt_at = None;
            return match self.record(|| self.db.update_batch(&batch)).await {
                Ok(()) => Delivery::Completed { events: 0 },
                Err(e) => self.release(batch, &e),
            };
        }

        let payload = BatchPayload::new(batch.batch_id.clone(), events);
        let outcome = self.transport.deliver(&payload).await;
        batch.attempts += 1;

        match outcome {
            Ok(()) => self.record_success(batch).await,
            Err(e) => self.record_failure(batch, e).await,
        }
    }

    async fn record_success(&self, mut batch: Batch) -> Delivery {
        batch.status = BatchStatus::Complete;
        batch.sent_at = Some(Utc::now());
        batch.next_attempt_at = None;
        batch.last_error = None;

        let written = self
            .record(|| {
                self.db.write(|tx| {
                    let deleted = Database::delete_events_in(tx, &batch.event_ids)?;
                    Database::update_batch_in(tx, &batch)?;
                    Ok(deleted)
                })
            })
            .await;

        match written {
            Ok(delivered) => {
                tracing::info!(
                    batch_id = %batch.batch_id,
                    attempts = batch.attempts,
                    events = delivered,
                    "Batch delivered"
                );
                Delivery::Completed { events: delivered }
            }
            Err(e) => self.release(batch, &e),
        }
    }

    async fn record_failure(&self, mut batch: Batch, error: Error) -> Delivery {
        batch.last_error = Some(error.to_string());

        let delivery = if batch.attempts >= self.max_retries {
            batch.status = BatchStatus::Failed;
            batch.next_attempt_at = None;
            tracing::error!(
                batch_id = %batch.batch_id,
                attempts = batch.attempts,
                error = %error,
                "Batch delivery failed permanently"
            );
            Delivery::Failed
        } else {
            let next = next_attempt_at(Utc::now(), self.retry_backoff_secs, batch.attempts);
            batch.status = BatchStatus::Pending;
            batch.next_attempt_at = Some(next);
            tracing::warn!(
                batch_id = %batch.batch_id,
                attempts = batch.attempts,
                max_retries = self.max_retries,
                retry_at = %next,
                error = %error,
                "Batch delivery failed, will retry"
            );
            Delivery::Retrying
        };

        match self.record(|| self.db.update_batch(&batch)).await {
            Ok(()) => delivery,
            Err(e) => self.release(batch, &e),
        }
    }

    /// Run an outcome write, retrying transient store errors
    async fn record<T>(&self, mut write: impl FnMut() -> Result<T>) -> Result<T> {
        let mut attempt = 1;
        loop {
            match write() {
                Ok(value) => return Ok(value),
                Err(e) if attempt < OUTCOME_WRITE_ATTEMPTS => {
                    tracing::warn!(attempt, error = %e, "Recording delivery outcome failed, retrying");
                    attempt += 1;
                    tokio::time::sleep(OUTCOME_WRITE_DELAY).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Return a batch whose outcome could not be recorded to `pending`.
    ///
    /// The attempt stays counted. Events are untouched, so a batch the
    /// collector already accepted is delivered again.
    fn release(&self, mut batch: Batch, error: &Error) -> Delivery {
        tracing::error!(
            batch_id = %batch.batch_id,
            error = %error,
            "Could not record delivery outcome, returning batch to pending"
        );
        batch.status = BatchStatus::Pending;
        batch.next_attempt_at = None;
        batch.last_error = Some(error.to_string());

        if let Err(e) = self.reset_if_sending(&batch) {
            tracing::error!(batch_id = %batch.batch_id, error = %e, "Release failed, will retry next run");
            self.stranded().push(batch);
        }
        Delivery::Interrupted
    }

    fn release_stranded(&self) {
        let stranded = std::mem::take(&mut *self.stranded());
        for batch in stranded {
            match self.reset_if_sending(&batch) {
                Ok(()) => tracing::info!(batch_id = %batch.batch_id, "Released stranded batch"),
                Err(e) => {
                    tracing::warn!(batch_id = %batch.batch_id, error = %e, "Stranded batch still cannot be released");
                    self.stranded().push(batch);
                }
            }
        }
    }

    /// Write `batch` (already set to `pending`) only while the stored row is
    /// still `sending`
    fn reset_if_sending(&self, batch: &Batch) -> Result<()> {
        self.db.write(|tx| {
            let still_sending = Database::batch_in(tx, &batch.batch_id)?
                .is_some_and(|stored| stored.status == BatchStatus::Sending);
            if still_sending {
                Database::update_batch_in(tx, batch)?;
            }
            Ok(())
        })
    }

    fn stranded(&self) -> MutexGuard<'_, Vec<Batch>> {
        self.stranded
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// `now + min(base * 2^(attempts-1), 1h)`
fn next_attempt_at(now: DateTime<Utc>, base_secs: u64, attempts: u32) -> DateTime<Utc> {
    let exponent = attempts.saturating_sub(1).min(20);
    let delay = base_secs
        .saturating_mul(1u64 << exponent)
        .min(MAX_BACKOFF_SECS);
    now + chrono::Duration::seconds(delay as i64)
}
