//! Database repository layer
//!
//! Provides the event store operations. Every method that touches more than
//! one row runs inside a single immediate-mode transaction, so a logical unit
//! (inserting N events, claiming events for a batch, deleting the events of a
//! delivered batch) either fully applies or not at all.
//!
//! The `*_in` helpers take a borrowed connection so the scheduler and the
//! engines can compose several steps into one transaction via
//! [`Database::write`].

use crate::error::{Error, Result};
use crate::types::*;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

/// Subquery yielding event ids still owned by an undelivered batch
const CLAIMED_EVENT_IDS: &str = r#"
    SELECT be.event_id FROM batch_events be
    JOIN batches b ON b.batch_id = be.batch_id
    WHERE b.status != 'complete'
"#;

/// Database handle (single connection)
pub struct Database {
    conn: Mutex<Connection>,
}

/// Timestamps are stored as fixed-width RFC 3339 so they compare as text.
pub(crate) fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(idx: usize, value: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_opt_ts(idx: usize, value: Option<String>) -> rusqlite::Result<Option<DateTime<Utc>>> {
    value.map(|s| parse_ts(idx, &s)).transpose()
}

impl Database {
    /// Open or create a database at the given path
    pub fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA foreign_keys = ON;
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA busy_timeout = 5000;
            ",
        )?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Run migrations on this database
    pub fn migrate(&self) -> Result<()> {
        let conn = self.conn()?;
        super::schema::run_migrations(&conn)
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| Error::LockPoisoned)
    }

    /// Run `f` inside one immediate transaction, committing only if it succeeds.
    pub(crate) fn write<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.conn()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    // ============================================
    // Event operations
    // ============================================

    /// Insert one sanitized event, returning its id
    pub fn put_event(&self, event: &SanitizedEvent) -> Result<String> {
        self.write(|tx| Self::insert_event_in(tx, event))
    }

    /// Insert several sanitized events atomically, returning their ids in order
    pub fn put_events(&self, events: &[SanitizedEvent]) -> Result<Vec<String>> {
        self.write(|tx| {
            events
                .iter()
                .map(|event| Self::insert_event_in(tx, event))
                .collect()
        })
    }

    pub(crate) fn insert_event_in(conn: &Connection, event: &SanitizedEvent) -> Result<String> {
        let mut event = event.as_event().clone();
        if event.id.is_empty() {
            event.id = uuid::Uuid::new_v4().to_string();
        }

        conn.execute(
            r#"
            INSERT INTO events (id, event_type, event_category, session_id, timestamp,
                                severity, data_version, payload, stored_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            "#,
            params![
                event.id,
                event.event_type,
                event.event_category.as_str(),
                event.context.session_id,
                event.context.timestamp,
                event.severity.as_str(),
                event.data_version,
                serde_json::to_string(&event)?,
                format_ts(Utc::now()),
            ],
        )?;

        Ok(event.id)
    }

    /// Get an event by ID
    pub fn get_event(&self, id: &str) -> Result<Option<Event>> {
        let conn = self.conn()?;
        conn.query_row(
            "SELECT payload FROM events WHERE id = ?",
            [id],
            Self::row_to_event,
        )
        .optional()
        .map_err(Error::from)
    }

    /// Get events by ID, in the given order, skipping ids no longer stored
    pub fn get_events(&self, ids: &[String]) -> Result<Vec<Event>> {
        let conn = self.conn()?;
        Self::events_in(&conn, ids)
    }

    pub(crate) fn events_in(conn: &Connection, ids: &[String]) -> Result<Vec<Event>> {
        let mut stmt = conn.prepare_cached("SELECT payload FROM events WHERE id = ?")?;
        let mut events = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(event) = stmt.query_row([id], Self::row_to_event).optional()? {
                events.push(event);
            }
        }
        Ok(events)
    }

    /// List stored events of a type, oldest first
    pub fn get_events_by_type(&self, event_type: &str, limit: usize) -> Result<Vec<Event>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT payload FROM events WHERE event_type = ? ORDER BY timestamp ASC, seq ASC LIMIT ?",
        )?;

        let events = stmt
            .query_map(params![event_type, limit as i64], Self::row_to_event)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(events)
    }

    /// List stored events whose timestamp falls in `[from_ms, to_ms)`
    pub fn get_events_between(&self, from_ms: i64, to_ms: i64) -> Result<Vec<Event>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT payload FROM events WHERE timestamp >= ? AND timestamp < ? ORDER BY timestamp ASC, seq ASC",
        )?;

        let events = stmt
            .query_map(params![from_ms, to_ms], Self::row_to_event)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(events)
    }

    fn row_to_event(row: &Row) -> rusqlite::Result<Event> {
        let payload: String = row.get(0)?;
        serde_json::from_str(&payload)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e)))
    }

    /// Count all stored events
    pub fn count_events(&self) -> Result<i64> {
        let conn = self.conn()?;
        Self::count_events_in(&conn)
    }

    pub(crate) fn count_events_in(conn: &Connection) -> Result<i64> {
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM events", [], |r| r.get(0))?;
        Ok(count)
    }

    /// Count events no undelivered batch has claimed
    pub fn count_unbatched_events(&self) -> Result<i64> {
        let conn = self.conn()?;
        Self::count_unbatched_in(&conn)
    }

    pub(crate) fn count_unbatched_in(conn: &Connection) -> Result<i64> {
        let count: i64 = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM events WHERE id NOT IN ({})",
                CLAIMED_EVENT_IDS
            ),
            [],
            |r| r.get(0),
        )?;
        Ok(count)
    }

    /// Oldest unclaimed event ids, in insertion order
    pub(crate) fn oldest_unbatched_ids_in(conn: &Connection, limit: usize) -> Result<Vec<String>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT id FROM events WHERE id NOT IN ({}) ORDER BY seq ASC LIMIT ?",
            CLAIMED_EVENT_IDS
        ))?;

        let ids = stmt
            .query_map([limit as i64], |r| r.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;

        Ok(ids)
    }

    /// Delete events by id atomically, returning how many were removed
    pub fn delete_events(&self, ids: &[String]) -> Result<usize> {
        self.write(|tx| Self::delete_events_in(tx, ids))
    }

    pub(crate) fn delete_events_in(conn: &Connection, ids: &[String]) -> Result<usize> {
        let mut stmt = conn.prepare_cached("DELETE FROM events WHERE id = ?")?;
        let mut deleted = 0;
        for id in ids {
            deleted += stmt.execute([id])?;
        }
        Ok(deleted)
    }

    // ============================================
    // Batch operations
    // ============================================

    /// Create a pending batch claiming the given events
    pub fn create_batch(&self, event_ids: &[String]) -> Result<Batch> {
        self.write(|tx| Self::insert_batch_in(tx, event_ids))
    }

    pub(crate) fn insert_batch_in(conn: &Connection, event_ids: &[String]) -> Result<Batch> {
        if event_ids.is_empty() {
            return Err(Error::EmptyBatch);
        }

        let mut claimed = conn.prepare_cached(&format!(
            "SELECT EXISTS(SELECT 1 FROM ({}) WHERE event_id = ?)",
            CLAIMED_EVENT_IDS
        ))?;
        for id in event_ids {
            let is_claimed: bool = claimed.query_row([id], |r| r.get(0))?;
            if is_claimed {
                return Err(Error::EventAlreadyBatched(id.clone()));
            }
        }

        let batch = Batch {
            batch_id: uuid::Uuid::new_v4().to_string(),
            event_ids: event_ids.to_vec(),
            status: BatchStatus::Pending,
            created_at: Utc::now(),
            attempts: 0,
            sent_at: None,
            next_attempt_at: None,
            last_error: None,
        };

        conn.execute(
            "INSERT INTO batches (batch_id, status, created_at, attempts) VALUES (?1, ?2, ?3, 0)",
            params![
                batch.batch_id,
                batch.status.as_str(),
                format_ts(batch.created_at)
            ],
        )?;

        let mut insert = conn.prepare_cached(
            "INSERT INTO batch_events (batch_id, position, event_id) VALUES (?1, ?2, ?3)",
        )?;
        for (position, event_id) in event_ids.iter().enumerate() {
            insert.execute(params![batch.batch_id, position as i64, event_id])?;
        }

        Ok(batch)
    }

    /// Whether any batch is pending or sending
    pub(crate) fn has_outstanding_batch_in(conn: &Connection) -> Result<bool> {
        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM batches WHERE status IN ('pending', 'sending'))",
            [],
            |r| r.get(0),
        )?;
        Ok(exists)
    }

    /// Get a batch by ID
    pub fn get_batch(&self, batch_id: &str) -> Result<Option<Batch>> {
        let conn = self.conn()?;
        Self::batch_in(&conn, batch_id)
    }

    pub(crate) fn batch_in(conn: &Connection, batch_id: &str) -> Result<Option<Batch>> {
        let batch = conn
            .query_row(
                "SELECT * FROM batches WHERE batch_id = ?",
                [batch_id],
                Self::row_to_batch,
            )
            .optional()?;

        match batch {
            Some(mut batch) => {
                batch.event_ids = Self::batch_event_ids_in(conn, &batch.batch_id)?;
                Ok(Some(batch))
            }
            None => Ok(None),
        }
    }

    /// List batches, optionally filtered by status, oldest first
    pub fn list_batches(&self, status: Option<BatchStatus>) -> Result<Vec<Batch>> {
        let conn = self.conn()?;
        Self::list_batches_in(&conn, status)
    }

    pub(crate) fn list_batches_in(
        conn: &Connection,
        status: Option<BatchStatus>,
    ) -> Result<Vec<Batch>> {
        let mut stmt = conn.prepare(
            r#"
            SELECT * FROM batches
            WHERE (?1 IS NULL OR status = ?1)
            ORDER BY created_at ASC, rowid ASC
            "#,
        )?;

        let mut batches = stmt
            .query_map([status.map(|s| s.as_str())], Self::row_to_batch)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        for batch in &mut batches {
            batch.event_ids = Self::batch_event_ids_in(conn, &batch.batch_id)?;
        }

        Ok(batches)
    }

    fn batch_event_ids_in(conn: &Connection, batch_id: &str) -> Result<Vec<String>> {
        let mut stmt = conn.prepare_cached(
            "SELECT event_id FROM batch_events WHERE batch_id = ? ORDER BY position ASC",
        )?;
        let ids = stmt
            .query_map([batch_id], |r| r.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(ids)
    }

    fn row_to_batch(row: &Row) -> rusqlite::Result<Batch> {
        let status_str: String = row.get("status")?;
        let status = status_str.parse::<BatchStatus>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                1,
                Type::Text,
                Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, e)),
            )
        })?;
        let created_at_str: String = row.get("created_at")?;

        Ok(Batch {
            batch_id: row.get("batch_id")?,
            event_ids: Vec::new(),
            status,
            created_at: parse_ts(2, &created_at_str)?,
            attempts: row.get("attempts")?,
            sent_at: parse_opt_ts(4, row.get("sent_at")?)?,
            next_attempt_at: parse_opt_ts(5, row.get("next_attempt_at")?)?,
            last_error: row.get("last_error")?,
        })
    }

    /// Persist a batch's mutable fields (status, attempts, timestamps, error)
    pub fn update_batch(&self, batch: &Batch) -> Result<()> {
        self.write(|tx| Self::update_batch_in(tx, batch))
    }

    pub(crate) fn update_batch_in(conn: &Connection, batch: &Batch) -> Result<()> {
        let updated = conn.execute(
            r#"
            UPDATE batches
            SET status = ?2, attempts = ?3, sent_at = ?4, next_attempt_at = ?5, last_error = ?6
            WHERE batch_id = ?1
            "#,
            params![
                batch.batch_id,
                batch.status.as_str(),
                batch.attempts,
                batch.sent_at.map(format_ts),
                batch.next_attempt_at.map(format_ts),
                batch.last_error,
            ],
        )?;

        if updated == 0 {
            return Err(Error::BatchNotFound(batch.batch_id.clone()));
        }
        Ok(())
    }

    /// Delete a batch and its event references; events themselves are untouched
    pub fn delete_batch(&self, batch_id: &str) -> Result<bool> {
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM batches WHERE batch_id = ?", [batch_id])?;
        Ok(deleted > 0)
    }

    /// Delete complete batches delivered before `cutoff`
    pub(crate) fn delete_complete_batches_before_in(
        conn: &Connection,
        cutoff: DateTime<Utc>,
    ) -> Result<usize> {
        let deleted = conn.execute(
            "DELETE FROM batches WHERE status = 'complete' AND sent_at IS NOT NULL AND sent_at < ?",
            [format_ts(cutoff)],
        )?;
        Ok(deleted)
    }

    /// Return a failed batch to `pending` with a fresh retry budget
    pub fn requeue_batch(&self, batch_id: &str) -> Result<Batch> {
        self.write(|tx| {
            let mut batch = Self::batch_in(tx, batch_id)?
                .ok_or_else(|| Error::BatchNotFound(batch_id.to_string()))?;
            if batch.status != BatchStatus::Failed {
                return Err(Error::InvalidBatchState {
                    batch_id: batch.batch_id,
                    status: batch.status,
                });
            }

            batch.status = BatchStatus::Pending;
            batch.attempts = 0;
            batch.next_attempt_at = None;
            Self::update_batch_in(tx, &batch)?;
            Ok(batch)
        })
    }

    // ============================================
    // Aggregate operations
    // ============================================

    /// Read-modify-write an aggregate inside one transaction.
    ///
    /// `reducer` receives the stored data (or `None` on first write) and its
    /// result replaces it with a fresh `last_updated`.
    pub fn update_aggregate<F>(&self, id: &str, aggregate_type: &str, reducer: F) -> Result<Aggregate>
    where
        F: FnOnce(Option<serde_json::Value>) -> Result<serde_json::Value>,
    {
        self.write(|tx| {
            let previous = Self::aggregate_in(tx, id)?.map(|a| a.data);
            let data = reducer(previous)?;
            let last_updated = Utc::now();

            tx.execute(
                r#"
                INSERT INTO aggregates (id, aggregate_type, data, last_updated)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT(id) DO UPDATE SET
                    aggregate_type = excluded.aggregate_type,
                    data = excluded.data,
                    last_updated = excluded.last_updated
                "#,
                params![id, aggregate_type, data.to_string(), format_ts(last_updated)],
            )?;

            Ok(Aggregate {
                id: id.to_string(),
                aggregate_type: aggregate_type.to_string(),
                data,
                last_updated,
            })
        })
    }

    /// Get an aggregate by ID
    pub fn get_aggregate(&self, id: &str) -> Result<Option<Aggregate>> {
        let conn = self.conn()?;
        Self::aggregate_in(&conn, id)
    }

    fn aggregate_in(conn: &Connection, id: &str) -> Result<Option<Aggregate>> {
        conn.query_row(
            "SELECT id, aggregate_type, data, last_updated FROM aggregates WHERE id = ?",
            [id],
            Self::row_to_aggregate,
        )
        .optional()
        .map_err(Error::from)
    }

    /// List aggregates, optionally of one type, by id
    pub fn list_aggregates(&self, aggregate_type: Option<&str>) -> Result<Vec<Aggregate>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, aggregate_type, data, last_updated FROM aggregates
            WHERE (?1 IS NULL OR aggregate_type = ?1)
            ORDER BY id ASC
            "#,
        )?;

        let aggregates = stmt
            .query_map([aggregate_type], Self::row_to_aggregate)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(aggregates)
    }

    fn row_to_aggregate(row: &Row) -> rusqlite::Result<Aggregate> {
        let data_str: String = row.get(2)?;
        let last_updated_str: String = row.get(3)?;

        Ok(Aggregate {
            id: row.get(0)?,
            aggregate_type: row.get(1)?,
            data: serde_json::from_str(&data_str)
                .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(e)))?,
            last_updated: parse_ts(3, &last_updated_str)?,
        })
    }

    // ============================================
    // Statistics
    // ============================================

    /// Get the database file size in bytes.
    pub fn get_database_size(&self) -> Result<u64> {
        let conn = self.conn()?;

        let page_count: u64 = conn.query_row("PRAGMA page_count", [], |row| row.get(0))?;
        let page_size: u64 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;

        Ok(page_count * page_size)
    }

    /// Snapshot counts across all three collections
    pub fn stats(&self) -> Result<StoreStats> {
        let database_size_bytes = self.get_database_size()?;
        let conn = self.conn()?;

        let mut stats = StoreStats {
            database_size_bytes,
            total_events: Self::count_events_in(&conn)?,
            unbatched_events: Self::count_unbatched_in(&conn)?,
            aggregates: conn.query_row("SELECT COUNT(*) FROM aggregates", [], |r| r.get(0))?,
            ..Default::default()
        };

        let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM batches GROUP BY status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        for row in rows {
            let (status, count) = row?;
            match status.parse::<BatchStatus>() {
                Ok(BatchStatus::Pending) => stats.pending_batches = count,
                Ok(BatchStatus::Sending) => stats.sending_batches = count,
                Ok(BatchStatus::Complete) => stats.complete_batches = count,
                Ok(BatchStatus::Failed) => stats.failed_batches = count,
                Err(e) => tracing::warn!(error = %e, "Unknown batch status in store"),
            }
        }

        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PrivacyMode;
    use crate::sanitize::Sanitizer;

    fn test_db() -> Database {
        let db = Database::open_in_memory().unwrap();
        db.migrate().unwrap();
        db
    }

    fn create_test_event(n: i64) -> SanitizedEvent {
        let mut context = EventContext::now("session-1");
        context.timestamp = 1_700_000_000_000 + n;
        let event = Event::new("ad_impression", EventCategory::Impression, context)
            .with_metadata("position", n);
        Sanitizer::new(PrivacyMode::Standard).sanitize(event)
    }

    #[test]
    fn test_event_put_and_get() {
        let db = test_db();
        let event = create_test_event(1);

        let id = db.put_event(&event).unwrap();
        assert_eq!(id, event.as_event().id);

        let retrieved = db.get_event(&id).unwrap().unwrap();
        assert_eq!(&retrieved, event.as_event());
        assert_eq!(db.count_events().unwrap(), 1);
    }

    #[test]
    fn test_put_assigns_missing_ids() {
        let db = test_db();
        let mut event = create_test_event(1).into_inner();
        event.id = String::new();
        let event = Sanitizer::new(PrivacyMode::Standard).sanitize(event);

        let id = db.put_event(&event).unwrap();
        assert!(!id.is_empty());
        assert_eq!(db.get_event(&id).unwrap().unwrap().id, id);
    }

    #[test]
    fn test_put_events_is_atomic() {
        let db = test_db();
        let first = create_test_event(1);
        let duplicate = first.clone();

        let result = db.put_events(&[create_test_event(0), first, duplicate]);
        assert!(result.is_err());
        assert_eq!(db.count_events().unwrap(), 0);

        let ids = db
            .put_events(&[create_test_event(2), create_test_event(3)])
            .unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(db.count_events().unwrap(), 2);
    }

    #[test]
    fn test_events_by_type_and_time() {
        let db = test_db();
        db.put_events(&[create_test_event(5), create_test_event(1), create_test_event(3)])
            .unwrap();

        let by_type = db.get_events_by_type("ad_impression", 10).unwrap();
        let timestamps: Vec<_> = by_type.iter().map(|e| e.context.timestamp).collect();
        assert_eq!(
            timestamps,
            vec![1_700_000_000_001, 1_700_000_000_003, 1_700_000_000_005]
        );

        let window = db
            .get_events_between(1_700_000_000_002, 1_700_000_000_005)
            .unwrap();
        assert_eq!(window.len(), 1);
        assert!(db.get_events_by_type("click", 10).unwrap().is_empty());
    }

    #[test]
    fn test_batch_crud() {
        let db = test_db();
        let ids = db
            .put_events(&[create_test_event(1), create_test_event(2)])
            .unwrap();

        let mut batch = db.create_batch(&ids).unwrap();
        assert_eq!(batch.status, BatchStatus::Pending);
        assert_eq!(batch.attempts, 0);

        let retrieved = db.get_batch(&batch.batch_id).unwrap().unwrap();
        assert_eq!(retrieved.event_ids, ids);

        batch.status = BatchStatus::Failed;
        batch.attempts = 3;
        batch.last_error = Some("collector returned 503".to_string());
        db.update_batch(&batch).unwrap();

        let retrieved = db.get_batch(&batch.batch_id).unwrap().unwrap();
        assert_eq!(retrieved.status, BatchStatus::Failed);
        assert_eq!(retrieved.attempts, 3);
        assert_eq!(retrieved.last_error.as_deref(), Some("collector returned 503"));

        assert_eq!(db.list_batches(Some(BatchStatus::Failed)).unwrap().len(), 1);
        assert!(db.list_batches(Some(BatchStatus::Pending)).unwrap().is_empty());

        assert!(db.delete_batch(&batch.batch_id).unwrap());
        assert!(db.get_batch(&batch.batch_id).unwrap().is_none());
        assert_eq!(db.count_events().unwrap(), 2);
    }

    #[test]
    fn test_create_batch_rejects_claimed_events() {
        let db = test_db();
        let ids = db
            .put_events(&[create_test_event(1), create_test_event(2)])
            .unwrap();

        db.create_batch(&ids[..1]).unwrap();
        assert!(matches!(
            db.create_batch(&ids),
            Err(Error::EventAlreadyBatched(id)) if id == ids[0]
        ));
        assert!(matches!(db.create_batch(&[]), Err(Error::EmptyBatch)));
        assert_eq!(db.count_unbatched_events().unwrap(), 1);
    }

    #[test]
    fn test_requeue_only_failed_batches() {
        let db = test_db();
        let ids = db.put_events(&[create_test_event(1)]).unwrap();
        let mut batch = db.create_batch(&ids).unwrap();

        assert!(matches!(
            db.requeue_batch(&batch.batch_id),
            Err(Error::InvalidBatchState {
                status: BatchStatus::Pending,
                ..
            })
        ));
        assert!(matches!(
            db.requeue_batch("missing"),
            Err(Error::BatchNotFound(_))
        ));

        batch.status = BatchStatus::Failed;
        batch.attempts = 3;
        batch.last_error = Some("timeout".to_string());
        db.update_batch(&batch).unwrap();

        let requeued = db.requeue_batch(&batch.batch_id).unwrap();
        assert_eq!(requeued.status, BatchStatus::Pending);
        assert_eq!(requeued.attempts, 0);
        assert_eq!(requeued.event_ids, ids);
        assert_eq!(requeued.last_error.as_deref(), Some("timeout"));
    }

    #[test]
    fn test_update_missing_batch() {
        let db = test_db();
        let batch = Batch {
            batch_id: "missing".to_string(),
            event_ids: vec![],
            status: BatchStatus::Pending,
            created_at: Utc::now(),
            attempts: 0,
            sent_at: None,
            next_attempt_at: None,
            last_error: None,
        };
        assert!(matches!(
            db.update_batch(&batch),
            Err(Error::BatchNotFound(_))
        ));
    }

    #[test]
    fn test_delete_events() {
        let db = test_db();
        let ids = db
            .put_events(&[create_test_event(1), create_test_event(2), create_test_event(3)])
            .unwrap();

        let deleted = db
            .delete_events(&[ids[0].clone(), "unknown".to_string()])
            .unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(db.count_events().unwrap(), 2);
        assert_eq!(db.get_events(&ids).unwrap().len(), 2);
    }

    #[test]
    fn test_aggregate_read_modify_write() {
        let db = test_db();
        assert!(db.get_aggregate("impressions_2024-01-01").unwrap().is_none());

        let first = db
            .update_aggregate("impressions_2024-01-01", "impressions", |previous| {
                assert!(previous.is_none());
                Ok(serde_json::json!({"count": 1}))
            })
            .unwrap();
        assert_eq!(first.data["count"], 1);

        db.update_aggregate("impressions_2024-01-01", "impressions", |previous| {
            let count = previous.and_then(|v| v["count"].as_i64()).unwrap_or(0);
            Ok(serde_json::json!({"count": count + 1}))
        })
        .unwrap();

        let stored = db.get_aggregate("impressions_2024-01-01").unwrap().unwrap();
        assert_eq!(stored.data["count"], 2);
        assert_eq!(stored.aggregate_type, "impressions");
        assert_eq!(db.list_aggregates(Some("impressions")).unwrap().len(), 1);
        assert!(db.list_aggregates(Some("journeys")).unwrap().is_empty());
    }

    #[test]
    fn test_failed_reducer_leaves_aggregate_untouched() {
        let db = test_db();
        db.update_aggregate("a", "t", |_| Ok(serde_json::json!(1)))
            .unwrap();

        let result = db.update_aggregate("a", "t", |_| Err(Error::Config("boom".to_string())));
        assert!(result.is_err());
        assert_eq!(db.get_aggregate("a").unwrap().unwrap().data, 1);
    }

    #[test]
    fn test_stats() {
        let db = test_db();
        let ids = db
            .put_events(&[create_test_event(1), create_test_event(2), create_test_event(3)])
            .unwrap();
        db.create_batch(&ids[..2]).unwrap();
        db.update_aggregate("a", "t", |_| Ok(serde_json::json!({})))
            .unwrap();

        let stats = db.stats().unwrap();
        assert_eq!(stats.total_events, 3);
        assert_eq!(stats.unbatched_events, 1);
        assert_eq!(stats.pending_batches, 1);
        assert_eq!(stats.failed_batches, 0);
        assert_eq!(stats.aggregates, 1);
        assert!(stats.database_size_bytes > 0);
    }
}
