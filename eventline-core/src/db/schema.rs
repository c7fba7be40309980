//! Database schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.

use rusqlite::Connection;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: event queue, batches, aggregates
    r#"
    -- ============================================
    -- Pending events (immutable once written)
    -- ============================================

    -- seq preserves insertion order for FIFO batch formation
    CREATE TABLE IF NOT EXISTS events (
        seq              INTEGER PRIMARY KEY AUTOINCREMENT,
        id               TEXT NOT NULL UNIQUE,
        event_type       TEXT NOT NULL,
        event_category   TEXT NOT NULL,
        session_id       TEXT NOT NULL,
        timestamp        INTEGER NOT NULL,   -- epoch milliseconds
        severity         TEXT NOT NULL,
        data_version     INTEGER NOT NULL,
        payload          JSON NOT NULL,      -- full sanitized event
        stored_at        DATETIME NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp);
    CREATE INDEX IF NOT EXISTS idx_events_type ON events(event_type);

    -- ============================================
    -- Delivery batches
    -- ============================================

    CREATE TABLE IF NOT EXISTS batches (
        batch_id         TEXT PRIMARY KEY,
        status           TEXT NOT NULL,      -- 'pending', 'sending', 'complete', 'failed'
        created_at       DATETIME NOT NULL,
        attempts         INTEGER NOT NULL DEFAULT 0,
        sent_at          DATETIME
    );

    -- Ordered event references; rows outlive delivered events as history
    CREATE TABLE IF NOT EXISTS batch_events (
        batch_id         TEXT NOT NULL REFERENCES batches(batch_id) ON DELETE CASCADE,
        position         INTEGER NOT NULL,
        event_id         TEXT NOT NULL,

        PRIMARY KEY (batch_id, position)
    );

    CREATE INDEX IF NOT EXISTS idx_batches_status ON batches(status, created_at);
    CREATE INDEX IF NOT EXISTS idx_batch_events_event ON batch_events(event_id);

    -- ============================================
    -- Aggregates (keyed rollups)
    -- ============================================

    CREATE TABLE IF NOT EXISTS aggregates (
        id               TEXT PRIMARY KEY,
        aggregate_type   TEXT NOT NULL,
        data             JSON NOT NULL,
        last_updated     DATETIME NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_aggregates_type ON aggregates(aggregate_type);
    "#,
    // Version 2: retry backoff and failure inspection
    r#"
    ALTER TABLE batches ADD COLUMN next_attempt_at DATETIME;
    ALTER TABLE batches ADD COLUMN last_error TEXT;
    CREATE INDEX IF NOT EXISTS idx_batches_sent_at ON batches(sent_at) WHERE status = 'complete';
    "#,
];

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> crate::error::Result<()> {
    apply_migrations(conn, MIGRATIONS)
}

/// Apply `migrations[i]` as version `i + 1`, each in its own transaction.
///
/// A failing migration is rolled back and leaves `user_version` at the last
/// version that applied cleanly.
fn apply_migrations(conn: &Connection, migrations: &[&str]) -> crate::error::Result<()> {
    let current_version = get_schema_version(conn)?;

    tracing::info!(
        current_version,
        target_version = SCHEMA_VERSION,
        "Checking database migrations"
    );

    for (i, migration) in migrations.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::info!(version, "Running migration");
            let tx = conn.unchecked_transaction()?;
            tx.execute_batch(migration)?;
            tx.pragma_update(None, "user_version", version)?;
            tx.commit()?;
        }
    }

    if current_version < SCHEMA_VERSION {
        tracing::info!(
            from = current_version,
            to = SCHEMA_VERSION,
            "Migrations complete"
        );
    }

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> crate::error::Result<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    Ok(version)
}
