//! Core domain types for eventline
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Event** | Immutable record describing a single observed occurrence |
//! | **Batch** | A group of event ids bundled for one delivery to the collector |
//! | **Aggregate** | A keyed, incrementally maintained summary derived from events |
//! | **Producer** | Any caller that hands the pipeline an event (impression, engagement, ...) |
//!
//! Events are serialized in the collector's wire format (camelCase keys), so
//! the same type is used for storage and for the delivery payload.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current event schema version written by this library
pub const DATA_VERSION: u32 = 1;

// ============================================
// Event
// ============================================

/// Domain an event belongs to.
///
/// The category selects the metadata allow-list applied by the sanitizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventCategory {
    /// Content or ad rendered in view
    Impression,
    /// User interaction with rendered content
    Engagement,
    /// Page / content context classification
    Context,
    /// Navigation and funnel progress
    Journey,
    /// Load times and other client performance figures
    Performance,
    /// Pipeline-internal or lifecycle events
    System,
}

impl EventCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventCategory::Impression => "impression",
            EventCategory::Engagement => "engagement",
            EventCategory::Context => "context",
            EventCategory::Journey => "journey",
            EventCategory::Performance => "performance",
            EventCategory::System => "system",
        }
    }
}

impl std::str::FromStr for EventCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "impression" => Ok(EventCategory::Impression),
            "engagement" => Ok(EventCategory::Engagement),
            "context" => Ok(EventCategory::Context),
            "journey" => Ok(EventCategory::Journey),
            "performance" => Ok(EventCategory::Performance),
            "system" => Ok(EventCategory::System),
            _ => Err(format!("unknown event category: {}", s)),
        }
    }
}

/// Event severity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Debug,
    #[default]
    Info,
    Warning,
    Error,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Debug => "debug",
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
            Severity::Critical => "critical",
        }
    }
}

/// Where in the host application an event originated
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventSource {
    pub page: Option<String>,
    pub section: Option<String>,
    pub component: Option<String>,
    pub placement: Option<String>,
}

/// Session and device hints captured with an event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventContext {
    /// Client session identifier
    pub session_id: String,
    /// Occurrence time in epoch milliseconds
    pub timestamp: i64,
    /// Coarse device class (mobile, desktop, tablet)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
    /// BCP 47 locale tag
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locale: Option<String>,
    /// Raw user agent string; removed in enhanced privacy mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl EventContext {
    /// Context stamped with the current wall-clock time
    pub fn now(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            timestamp: Utc::now().timestamp_millis(),
            device_type: None,
            locale: None,
            user_agent: None,
        }
    }
}

/// An immutable instrumentation record.
///
/// `metadata` is an open JSON object whose shape is owned by the producer of
/// the given `event_type`; `data_version` lets consumers evolve that shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    /// Unique identifier; assigned by the store when left empty
    #[serde(default)]
    pub id: String,
    pub event_type: String,
    pub event_category: EventCategory,
    #[serde(default)]
    pub source: EventSource,
    pub context: EventContext,
    #[serde(default = "empty_metadata")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub severity: Severity,
    #[serde(default = "default_data_version")]
    pub data_version: u32,
}

fn empty_metadata() -> serde_json::Map<String, serde_json::Value> {
    serde_json::Map::new()
}

fn default_data_version() -> u32 {
    DATA_VERSION
}

impl Event {
    /// Create an event with a fresh id and empty metadata
    pub fn new(
        event_type: impl Into<String>,
        event_category: EventCategory,
        context: EventContext,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            event_type: event_type.into(),
            event_category,
            source: EventSource::default(),
            context,
            metadata: serde_json::Map::new(),
            severity: Severity::default(),
            data_version: DATA_VERSION,
        }
    }

    /// Builder-style metadata insertion
    pub fn with_metadata(mut self, key: &str, value: impl Into<serde_json::Value>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    /// Builder-style source assignment
    pub fn with_source(mut self, source: EventSource) -> Self {
        self.source = source;
        self
    }
}

/// An event that has passed through the [`crate::sanitize::Sanitizer`].
///
/// Only the sanitizer can construct this type, and the store and transport
/// accept nothing else, so unsanitized metadata cannot reach either.
#[derive(Debug, Clone, PartialEq)]
pub struct SanitizedEvent(Event);

impl SanitizedEvent {
    pub(crate) fn new(event: Event) -> Self {
        Self(event)
    }

    pub fn as_event(&self) -> &Event {
        &self.0
    }

    pub fn into_inner(self) -> Event {
        self.0
    }
}

// ============================================
// Batch
// ============================================

/// Delivery lifecycle of a batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Waiting for the next sync tick
    Pending,
    /// Delivery in flight
    Sending,
    /// Delivered; events deleted
    Complete,
    /// Retries exhausted; retained for inspection
    Failed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Pending => "pending",
            BatchStatus::Sending => "sending",
            BatchStatus::Complete => "complete",
            BatchStatus::Failed => "failed",
        }
    }

    /// Pending and sending batches still own their events
    pub fn is_outstanding(&self) -> bool {
        matches!(self, BatchStatus::Pending | BatchStatus::Sending)
    }
}

impl std::fmt::Display for BatchStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

impl std::str::FromStr for BatchStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(BatchStatus::Pending),
            "sending" => Ok(BatchStatus::Sending),
            "complete" => Ok(BatchStatus::Complete),
            "failed" => Ok(BatchStatus::Failed),
            _ => Err(format!("unknown batch status: {}", s)),
        }
    }
}

/// A delivery unit referencing stored events by id
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Batch {
    pub batch_id: String,
    /// Referenced event ids, oldest first
    pub event_ids: Vec<String>,
    pub status: BatchStatus,
    pub created_at: DateTime<Utc>,
    /// Number of observed delivery responses
    pub attempts: u32,
    /// Set when the collector acknowledged the batch
    pub sent_at: Option<DateTime<Utc>>,
    /// Earliest time a scheduled tick may retry this batch
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Last delivery error, kept for inspection
    pub last_error: Option<String>,
}

/// JSON body posted to the remote collector
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchPayload {
    pub batch_id: String,
    /// Send time in epoch milliseconds
    pub timestamp: i64,
    pub count: usize,
    pub events: Vec<Event>,
}

impl BatchPayload {
    pub fn new(batch_id: impl Into<String>, events: Vec<Event>) -> Self {
        Self {
            batch_id: batch_id.into(),
            timestamp: Utc::now().timestamp_millis(),
            count: events.len(),
            events,
        }
    }
}

// ============================================
// Aggregate
// ============================================

/// A keyed rollup maintained by the aggregate engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Aggregate {
    /// Caller-chosen key, typically `<metric_family>_<date>`
    pub id: String,
    /// Metric family tag
    pub aggregate_type: String,
    pub data: serde_json::Value,
    pub last_updated: DateTime<Utc>,
}

// ============================================
// Reporting
// ============================================

/// Outcome of one sync run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Batches examined this run
    pub batches_attempted: usize,
    /// Batches acknowledged by the collector
    pub batches_completed: usize,
    /// Batches returned to pending for another try
    pub batches_retrying: usize,
    /// Batches that exhausted their retries
    pub batches_failed: usize,
    /// Events deleted after acknowledgement
    pub events_delivered: usize,
    /// Batches skipped because they are still backing off
    pub batches_deferred: usize,
    /// Batches whose outcome could not be recorded; returned to pending
    pub batches_interrupted: usize,
}

/// Snapshot of what the store currently holds
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub database_size_bytes: u64,
    pub total_events: i64,
    /// Events not referenced by any batch
    pub unbatched_events: i64,
    pub pending_batches: i64,
    pub sending_batches: i64,
    pub complete_batches: i64,
    pub failed_batches: i64,
    pub aggregates: i64,
}
