//! End-to-end tests for the event pipeline
//!
//! These tests run the pipeline against on-disk databases in temporary
//! directories, with either a scripted in-process transport or a mock HTTP
//! collector.

use async_trait::async_trait;
use eventline_core::db::Database;
use eventline_core::{
    BatchPayload, BatchStatus, Error, Event, EventCategory, EventContext, HttpTransport,
    Pipeline, PipelineConfig, PrivacyMode, Result, Transport,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Fails the first `failures` deliveries, then accepts everything
struct ScriptedCollector {
    failures: AtomicUsize,
    received: Mutex<Vec<BatchPayload>>,
}

impl ScriptedCollector {
    fn failing(failures: usize) -> Arc<Self> {
        Arc::new(Self {
            failures: AtomicUsize::new(failures),
            received: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Transport for ScriptedCollector {
    async fn deliver(&self, payload: &BatchPayload) -> Result<()> {
        if self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(Error::Transport("collector returned 503".to_string()));
        }
        self.received.lock().unwrap().push(payload.clone());
        Ok(())
    }
}

fn config(batch_size: usize, max_retries: u32) -> PipelineConfig {
    PipelineConfig {
        api_endpoint: Some("http://collector.test/v1/batches".to_string()),
        batch_size,
        max_retries,
        ..Default::default()
    }
}

fn open(dir: &TempDir, config: PipelineConfig, transport: Arc<dyn Transport>) -> Pipeline {
    let db = Database::open(&dir.path().join("events.db")).unwrap();
    Pipeline::with_database_and_transport(config, db, Some(transport)).unwrap()
}

fn impression(n: usize) -> Event {
    Event::new(
        "ad_impression",
        EventCategory::Impression,
        EventContext::now("session-1"),
    )
    .with_metadata("ad_id", format!("ad-{n}"))
    .with_metadata("email", "someone@example.com")
}

// ============================================
// Delivery lifecycle
// ============================================

#[tokio::test]
async fn test_retry_then_deliver_scenario() {
    let dir = TempDir::new().unwrap();
    let collector = ScriptedCollector::failing(2);
    let pipeline = open(&dir, config(20, 3), collector.clone());

    let ids = pipeline
        .store_events((0..25).map(impression).collect())
        .await;
    assert_eq!(ids.len(), 25);

    let pending = pipeline.list_batches(Some(BatchStatus::Pending)).unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].event_ids, ids[..20].to_vec());
    assert_eq!(pipeline.stats().unwrap().unbatched_events, 5);

    for _ in 0..3 {
        pipeline.force_sync().await.unwrap();
    }

    let batch = pipeline
        .database()
        .get_batch(&pending[0].batch_id)
        .unwrap()
        .unwrap();
    assert_eq!(batch.status, BatchStatus::Complete);
    assert_eq!(batch.attempts, 3);

    let db = pipeline.database();
    assert!(db.get_events(&ids[..20]).unwrap().is_empty());
    assert_eq!(db.get_events(&ids[20..]).unwrap().len(), 5);

    let received = collector.received.lock().unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].count, 20);
    assert!(received[0]
        .events
        .iter()
        .all(|e| e.metadata.get("email").is_none() && e.metadata.contains_key("ad_id")));
}

#[tokio::test]
async fn test_exhausted_batch_stays_failed_and_blocks_nothing() {
    let dir = TempDir::new().unwrap();
    let collector = ScriptedCollector::failing(3);
    let pipeline = open(&dir, config(2, 3), collector.clone());

    let first = pipeline.store_events(vec![impression(0), impression(1)]).await;
    for _ in 0..4 {
        pipeline.force_sync().await.unwrap();
    }

    let failed = pipeline.list_batches(Some(BatchStatus::Failed)).unwrap();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].attempts, 3);
    assert_eq!(failed[0].event_ids, first);
    assert!(failed[0].last_error.is_some());

    // New events form a new batch; the failed batch's events stay put
    pipeline.store_events(vec![impression(2), impression(3)]).await;
    let report = pipeline.force_sync().await.unwrap();
    assert_eq!(report.batches_completed, 1);
    assert_eq!(pipeline.database().get_events(&first).unwrap().len(), 2);

    // Requeue gives the failed batch a fresh budget
    pipeline.requeue_batch(&failed[0].batch_id).unwrap();
    pipeline.force_sync().await.unwrap();
    assert_eq!(pipeline.stats().unwrap().total_events, 0);
    assert_eq!(collector.received.lock().unwrap().len(), 2);
}

#[tokio::test]
async fn test_state_survives_reopen_and_in_flight_is_retried() {
    let dir = TempDir::new().unwrap();
    let batch_id = {
        let pipeline = open(&dir, config(3, 3), ScriptedCollector::failing(0));
        pipeline
            .store_events((0..4).map(impression).collect())
            .await;

        // Simulate a crash mid-delivery
        let mut batch = pipeline
            .list_batches(Some(BatchStatus::Pending))
            .unwrap()
            .remove(0);
        batch.status = BatchStatus::Sending;
        pipeline.database().update_batch(&batch).unwrap();
        batch.batch_id
    };

    let collector = ScriptedCollector::failing(0);
    let pipeline = open(&dir, config(3, 3), collector.clone());
    assert_eq!(pipeline.stats().unwrap().sending_batches, 1);

    assert_eq!(pipeline.recover_in_flight().unwrap(), 1);
    let batch = pipeline.database().get_batch(&batch_id).unwrap().unwrap();
    assert_eq!(batch.status, BatchStatus::Pending);
    assert_eq!(batch.attempts, 0);

    pipeline.force_sync().await.unwrap();
    assert_eq!(pipeline.stats().unwrap().total_events, 1);
    assert_eq!(collector.received.lock().unwrap()[0].batch_id, batch_id);
}

#[tokio::test]
async fn test_retention_sweep_keeps_recent_and_failed() {
    let dir = TempDir::new().unwrap();
    let pipeline = open(&dir, config(1, 1), ScriptedCollector::failing(1));

    pipeline.store_event(impression(0)).await.unwrap();
    pipeline.force_sync().await.unwrap();
    pipeline.store_event(impression(1)).await.unwrap();
    pipeline.force_sync().await.unwrap();

    let stats = pipeline.stats().unwrap();
    assert_eq!(stats.failed_batches, 1);
    assert_eq!(stats.complete_batches, 1);

    // Nothing is older than the 90 day default window yet
    assert_eq!(pipeline.sweep_retention().unwrap(), 0);

    let mut complete = pipeline
        .list_batches(Some(BatchStatus::Complete))
        .unwrap()
        .remove(0);
    complete.sent_at = Some(chrono::Utc::now() - chrono::Duration::days(120));
    pipeline.database().update_batch(&complete).unwrap();

    assert_eq!(pipeline.sweep_retention().unwrap(), 1);
    let stats = pipeline.stats().unwrap();
    assert_eq!(stats.complete_batches, 0);
    assert_eq!(stats.failed_batches, 1);
}

// ============================================
// HTTP collector
// ============================================

#[tokio::test]
async fn test_http_collector_end_to_end() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("POST", "/v1/batches")
        .match_header("authorization", "Bearer secret")
        .match_body(mockito::Matcher::PartialJson(serde_json::json!({ "count": 2 })))
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let dir = TempDir::new().unwrap();
    let config = PipelineConfig {
        api_endpoint: Some(format!("{}/v1/batches", server.url())),
        api_key: Some("secret".to_string()),
        batch_size: 2,
        privacy_mode: PrivacyMode::Enhanced,
        ..Default::default()
    };
    let transport = Arc::new(HttpTransport::new(&config).unwrap());
    let pipeline = open(&dir, config, transport);

    pipeline.store_events(vec![impression(0), impression(1)]).await;
    let report = pipeline.force_sync().await.unwrap();

    assert_eq!(report.batches_completed, 1);
    assert_eq!(report.events_delivered, 2);
    mock.assert_async().await;
}

// ============================================
// Aggregates
// ============================================

#[tokio::test]
async fn test_aggregates_persist_across_reopen() {
    let dir = TempDir::new().unwrap();
    let date = chrono::NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
    let key = eventline_core::aggregate_key("impressions", date);

    {
        let pipeline = open(&dir, config(20, 3), ScriptedCollector::failing(0));
        for _ in 0..3 {
            pipeline
                .update_aggregate_data(&key, "impressions", eventline_core::Counter::increment)
                .unwrap();
        }
    }

    let pipeline = open(&dir, config(20, 3), ScriptedCollector::failing(0));
    let counter: eventline_core::Counter = pipeline.get_aggregate_data(&key).unwrap().unwrap();
    assert_eq!(counter.count, 3);
}
