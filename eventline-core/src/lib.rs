//! # eventline-core
//!
//! Core library for eventline - a durable, privacy-filtered event pipeline.
//!
//! This library provides:
//! - Domain types for events, batches, and aggregates
//! - A sanitizer that strips identifying metadata before anything is stored
//! - SQLite event store, batch scheduler, and sync engine
//! - Aggregate rollups and retention sweeping
//! - Configuration management and logging infrastructure
//!
//! ## Architecture
//!
//! Events flow through four stages:
//! - **Sanitize:** metadata filtered per category and privacy mode
//! - **Store:** sanitized events persisted in insertion order
//! - **Batch:** the oldest `batch_size` events claimed by one pending batch
//! - **Sync:** batches POSTed to the collector; delivered events deleted in
//!   the same transaction that marks the batch complete
//!
//! ## Example
//!
//! ```rust,no_run
//! use eventline_core::{Config, Event, EventCategory, EventContext, Pipeline};
//!
//! # async fn run() -> eventline_core::Result<()> {
//! let config = Config::load()?;
//! let mut pipeline = Pipeline::open(&config)?;
//! pipeline.start()?;
//!
//! let event = Event::new("ad_impression", EventCategory::Impression, EventContext::now("session-1"))
//!     .with_metadata("ad_id", "ad-42");
//! pipeline.store_event(event).await;
//!
//! pipeline.close().await;
//! # Ok(())
//! # }
//! ```

// Re-export commonly used items at the crate root
pub use aggregate::{aggregate_key, AggregateEngine, Counter, Distribution};
pub use config::{Config, PipelineConfig, PrivacyMode};
pub use db::Database;
pub use error::{Error, Result};
pub use pipeline::Pipeline;
pub use sanitize::Sanitizer;
pub use transport::{HttpTransport, Transport};
pub use types::*;

// Public modules
pub mod aggregate;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod pipeline;
pub mod retention;
pub mod sanitize;
pub mod scheduler;
pub mod sync;
pub mod transport;
pub mod types;
