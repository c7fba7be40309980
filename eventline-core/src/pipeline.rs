//! The pipeline facade producers and hosts talk to
//!
//! A [`Pipeline`] owns the store, the sanitizer, the scheduler and the
//! engines. In batched mode (an `api_endpoint` is configured) events are
//! persisted, grouped into batches and delivered by a periodic sync task.
//! In immediate mode nothing is queued: each sanitized event goes straight to
//! the transport, if the host supplied one.
//!
//! Producers never see an error from [`Pipeline::store_event`]. A failed
//! store write degrades to direct delivery, and a failed direct delivery is
//! logged and reported as `None`.

use std::sync::Arc;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::aggregate::AggregateEngine;
use crate::config::{Config, PipelineConfig};
use crate::db::Database;
use crate::error::{Error, Result};
use crate::retention::RetentionSweeper;
use crate::sanitize::Sanitizer;
use crate::scheduler::BatchScheduler;
use crate::sync::SyncEngine;
use crate::transport::{deliver_event, HttpTransport, Transport};
use crate::types::{Batch, BatchStatus, Event, SanitizedEvent, StoreStats, SyncReport};

pub struct Pipeline {
    config: PipelineConfig,
    db: Arc<Database>,
    sanitizer: Sanitizer,
    scheduler: BatchScheduler,
    aggregates: AggregateEngine,
    sweeper: Arc<RetentionSweeper>,
    transport: Option<Arc<dyn Transport>>,
    sync: Option<Arc<SyncEngine>>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /// Open the configured database and, in batched mode, the HTTP transport
    pub fn open(config: &Config) -> Result<Self> {
        config.pipeline.validate()?;

        let db = Database::open(&config.database_path())?;
        let transport: Option<Arc<dyn Transport>> = if config.pipeline.is_batched() {
            Some(Arc::new(HttpTransport::new(&config.pipeline)?))
        } else {
            None
        };

        Self::with_database_and_transport(config.pipeline.clone(), db, transport)
    }

    /// Assemble a pipeline from an already opened database.
    ///
    /// Batched mode requires a transport; in immediate mode it is optional.
    pub fn with_database_and_transport(
        config: PipelineConfig,
        db: Database,
        transport: Option<Arc<dyn Transport>>,
    ) -> Result<Self> {
        config.validate()?;
        db.migrate()?;
        let db = Arc::new(db);

        let sync = match (&transport, config.is_batched()) {
            (Some(transport), true) => Some(Arc::new(SyncEngine::new(
                db.clone(),
                transport.clone(),
                config.max_retries,
                config.retry_backoff_secs,
            ))),
            (None, true) => {
                return Err(Error::Config(
                    "batched mode requires a transport".to_string(),
                ))
            }
            (_, false) => None,
        };

        tracing::info!(
            database = %config.database_name,
            batched = config.is_batched(),
            batch_size = config.batch_size,
            privacy_mode = config.privacy_mode.as_str(),
            "Event pipeline opened"
        );

        Ok(Self {
            sanitizer: Sanitizer::new(config.privacy_mode),
            scheduler: BatchScheduler::new(config.batch_size),
            aggregates: AggregateEngine::new(db.clone()),
            sweeper: Arc::new(RetentionSweeper::new(db.clone(), config.retention())),
            config,
            db,
            transport,
            sync,
            shutdown: CancellationToken::new(),
            tasks: Vec::new(),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn is_batched(&self) -> bool {
        self.sync.is_some()
    }

    // ============================================
    // Producer API
    // ============================================

    /// Sanitize and accept one event, returning its id or `None` if it was lost
    pub async fn store_event(&self, event: Event) -> Option<String> {
        let event = self.sanitize(event);

        if self.sync.is_none() {
            return self.send_direct(event).await;
        }
        self.store_one(event).await
    }

    /// Sanitize and accept several events atomically.
    ///
    /// Returns the ids that were stored (or delivered directly), in order.
    pub async fn store_events(&self, events: Vec<Event>) -> Vec<String> {
        let events: Vec<SanitizedEvent> = events.into_iter().map(|e| self.sanitize(e)).collect();
        if events.is_empty() {
            return Vec::new();
        }

        let mut ids = Vec::with_capacity(events.len());

        if self.sync.is_some() {
            match self.db.put_events(&events) {
                Ok(stored) => {
                    self.schedule();
                    return stored;
                }
                Err(e) if e.is_storage() => {
                    tracing::warn!(error = %e, events = events.len(), "Event store write failed, delivering directly");
                }
                Err(e) => {
                    // One bad or already stored event must not sink the rest
                    tracing::debug!(error = %e, "Bulk insert rejected, storing events one by one");
                    for event in events {
                        if let Some(id) = self.store_one(event).await {
                            ids.push(id);
                        }
                    }
                    return ids;
                }
            }
        }

        for event in events {
            if let Some(id) = self.send_direct(event).await {
                ids.push(id);
            }
        }
        ids
    }

    /// Store in batched mode; only storage failures fall back to direct delivery
    async fn store_one(&self, event: SanitizedEvent) -> Option<String> {
        match self.db.put_event(&event) {
            Ok(id) => {
                self.schedule();
                Some(id)
            }
            Err(e) if e.is_duplicate() => {
                let id = event.as_event().id.clone();
                tracing::debug!(event_id = %id, "Event already stored");
                Some(id)
            }
            Err(e) if e.is_storage() => {
                tracing::warn!(error = %e, "Event store write failed, delivering directly");
                self.send_direct(event).await
            }
            Err(e) => {
                tracing::error!(event_id = %event.as_event().id, error = %e, "Event rejected by store, dropped");
                None
            }
        }
    }

    fn sanitize(&self, mut event: Event) -> SanitizedEvent {
        if event.id.is_empty() {
            event.id = uuid::Uuid::new_v4().to_string();
        }
        self.sanitizer.sanitize(event)
    }

    fn schedule(&self) {
        if let Err(e) = self.scheduler.after_insert(&self.db) {
            tracing::warn!(error = %e, "Batch formation failed; retrying on next insert");
        }
    }

    async fn send_direct(&self, event: SanitizedEvent) -> Option<String> {
        let id = event.as_event().id.clone();

        let Some(transport) = &self.transport else {
            tracing::warn!(event_id = %id, "No transport available, event dropped");
            return None;
        };

        match deliver_event(transport.as_ref(), event).await {
            Ok(()) => {
                tracing::debug!(event_id = %id, "Event delivered directly");
                Some(id)
            }
            Err(e) => {
                tracing::error!(event_id = %id, error = %e, "Direct delivery failed, event dropped");
                None
            }
        }
    }

    // ============================================
    // Aggregates
    // ============================================

    /// Read-modify-write the aggregate `id` with a pure reducer
    pub fn update_aggregate_data<T, F>(&self, id: &str, aggregate_type: &str, reducer: F) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce(Option<T>) -> T,
    {
        self.aggregates.update(id, aggregate_type, reducer)
    }

    pub fn get_aggregate_data<T: DeserializeOwned>(&self, id: &str) -> Result<Option<T>> {
        self.aggregates.get(id)
    }

    pub fn aggregates(&self) -> &AggregateEngine {
        &self.aggregates
    }

    // ============================================
    // Operations
    // ============================================

    /// Deliver every pending batch now, ignoring retry backoff
    pub async fn force_sync(&self) -> Result<SyncReport> {
        match &self.sync {
            Some(sync) => sync_tick(sync, &self.db, self.scheduler, false).await,
            None => Ok(SyncReport::default()),
        }
    }

    /// Reset batches a previous process left in `sending`
    pub fn recover_in_flight(&self) -> Result<usize> {
        match &self.sync {
            Some(sync) => sync.recover_in_flight(),
            None => Ok(0),
        }
    }

    /// Delete delivered batch records older than the retention window
    pub fn sweep_retention(&self) -> Result<usize> {
        self.sweeper.sweep(Utc::now())
    }

    pub fn requeue_batch(&self, batch_id: &str) -> Result<Batch> {
        self.db.requeue_batch(batch_id)
    }

    pub fn list_batches(&self, status: Option<BatchStatus>) -> Result<Vec<Batch>> {
        self.db.list_batches(status)
    }

    pub fn stats(&self) -> Result<StoreStats> {
        self.db.stats()
    }

    // ============================================
    // Lifecycle
    // ============================================

    /// Start the periodic sync and retention tasks on the current runtime.
    ///
    /// Both run once immediately. Calling `start` twice has no effect.
    pub fn start(&mut self) -> Result<()> {
        if !self.tasks.is_empty() {
            return Ok(());
        }

        if let Some(sync) = &self.sync {
            sync.recover_in_flight()?;
            self.tasks.push(tokio::spawn(sync_loop(
                sync.clone(),
                self.db.clone(),
                self.scheduler,
                self.config.sync_interval(),
                self.shutdown.clone(),
            )));
        }

        self.tasks.push(tokio::spawn(retention_loop(
            self.sweeper.clone(),
            self.config.retention_sweep_interval(),
            self.shutdown.clone(),
        )));

        tracing::info!(
            sync_interval_secs = self.config.sync_interval,
            retention_sweep_hours = self.config.retention_sweep_hours,
            "Pipeline timers started"
        );
        Ok(())
    }

    /// Stop both timers, letting a sync run already in progress finish.
    ///
    /// Batches still `sending` afterwards are retried on the next start.
    pub async fn close(&mut self) {
        self.shutdown.cancel();
        for handle in self.tasks.drain(..) {
            if let Err(e) = handle.await {
                tracing::warn!(error = %e, "Pipeline task ended abnormally");
            }
        }
        tracing::info!("Event pipeline closed");
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn sync_tick(
    sync: &SyncEngine,
    db: &Database,
    scheduler: BatchScheduler,
    respect_backoff: bool,
) -> Result<SyncReport> {
    let report = sync.run_once(respect_backoff).await?;

    // Events that arrived while a batch was outstanding
    if report.batches_completed > 0 {
        scheduler.after_insert(db)?;
    }
    Ok(report)
}

async fn sync_loop(
    sync: Arc<SyncEngine>,
    db: Arc<Database>,
    scheduler: BatchScheduler,
    period: std::time::Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = sync_tick(&sync, &db, scheduler, true).await {
                    tracing::error!(error = %e, "Sync run failed");
                }
            }
        }
    }

    tracing::debug!("Sync task stopped");
}

async fn retention_loop(
    sweeper: Arc<RetentionSweeper>,
    period: std::time::Duration,
    shutdown: CancellationToken,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = sweeper.sweep(Utc::now()) {
                    tracing::error!(error = %e, "Retention sweep failed");
                }
            }
        }
    }

    tracing::debug!("Retention task stopped");
}
