//! Error types for eventline-core

use thiserror::Error;

use crate::types::BatchStatus;

/// Main error type for the eventline-core library
#[derive(Error, Debug)]
pub enum Error {
    /// Database error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding or decoding error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Delivery to the remote collector failed
    #[error("transport error: {0}")]
    Transport(String),

    /// Batch not found
    #[error("batch not found: {0}")]
    BatchNotFound(String),

    /// Event already claimed by an undelivered batch
    #[error("event {0} is already claimed by a batch")]
    EventAlreadyBatched(String),

    /// A batch must reference at least one event
    #[error("cannot create an empty batch")]
    EmptyBatch,

    /// Operation not allowed for the batch's current status
    #[error("batch {batch_id} is {status}")]
    InvalidBatchState { batch_id: String, status: BatchStatus },

    /// A thread panicked while holding the database connection
    #[error("database connection lock poisoned")]
    LockPoisoned,
}

impl Error {
    /// Whether the store could not complete a write (full disk, I/O, busy,
    /// corruption). Constraint violations are not storage failures.
    ///
    /// The pipeline falls back to direct delivery on these instead of
    /// surfacing them to producers.
    pub fn is_storage(&self) -> bool {
        match self {
            Error::Database(rusqlite::Error::SqliteFailure(e, _)) => {
                e.code != rusqlite::ErrorCode::ConstraintViolation
            }
            Error::Io(_) | Error::LockPoisoned => true,
            _ => false,
        }
    }

    /// Whether a write collided with a row that already has the same key
    pub fn is_duplicate(&self) -> bool {
        matches!(
            self,
            Error::Database(rusqlite::Error::SqliteFailure(e, _))
                if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY
                    || e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
        )
    }
}

/// Result type alias for eventline-core
pub type Result<T> = std::result::Result<T, Error>;
