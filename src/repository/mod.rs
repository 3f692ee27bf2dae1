//! Repository layer for database persistence.
//!
//! All database access uses Diesel ORM over SQLite (diesel-async's
//! `SyncConnectionWrapper`).

pub mod context;
pub mod models;
pub mod pool;
pub mod records;
pub mod util;
pub mod work_items;

pub use context::DbContext;
pub use pool::{DbPool, DieselError};
pub use records::{BatchReport, RecordStore, StoredRecord, UpsertOutcome};
pub use work_items::{StatusCount, WorkItemRepository};

use chrono::{DateTime, Utc};

/// Parse a datetime string from the database, defaulting to Unix epoch on error.
pub fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::UNIX_EPOCH)
}
