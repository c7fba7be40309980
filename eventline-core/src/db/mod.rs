//! Database layer for eventline
//!
//! This module provides the event store using SQLite with:
//! - Schema migrations
//! - Repository pattern for queries
//! - Transactions spanning every multi-row logical unit

pub mod repo;
pub mod schema;

pub use repo::Database;
