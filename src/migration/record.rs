//! `LedgerEntry` - Represents rows in the applied-migrations ledger table

use crate::SessionError;
use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Serialize;

/// A persisted record of one successfully applied migration
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LedgerEntry {
    /// Migration file name (primary key)
    pub name: String,

    /// `SHA-256` checksum of the file at the time it was applied
    pub checksum: String,

    /// When the migration was applied (server-assigned)
    pub applied_at: DateTime<Utc>,

    /// Wall-clock duration of the migration SQL in milliseconds
    pub execution_ms: i32,

    /// Deploy run that applied it
    pub batch_id: Option<String>,

    /// Caller-supplied version tag
    pub app_version: Option<String>,
}

impl LedgerEntry {
    /// Create a `LedgerEntry` from a database row
    ///
    /// Expected column order: `name`, `checksum`, `applied_at` (as UTC text),
    /// `execution_ms`, `batch_id`, `app_version`
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Parse` if the timestamp cannot be parsed.
    pub fn from_row(row: &may_postgres::Row) -> Result<Self, SessionError> {
        let applied_at_str: String = row.get(2);
        Ok(Self {
            name: row.get(0),
            checksum: row.get(1),
            applied_at: parse_applied_at(&applied_at_str)?,
            execution_ms: row.get(3),
            batch_id: row.get(4),
            app_version: row.get(5),
        })
    }
}

/// Parse a UTC timestamp as rendered by `PostgreSQL` text output
pub(crate) fn parse_applied_at(text: &str) -> Result<DateTime<Utc>, SessionError> {
    const FORMATS: [&str; 4] = [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S",
    ];
    FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(text, fmt).ok())
        .map(|naive| naive.and_utc())
        .ok_or_else(|| {
            SessionError::Parse(format!(
                "Failed to parse timestamp '{text}': unrecognized format"
            ))
        })
}

/// The insert-side ledger value; `applied_at` is assigned by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewLedgerEntry {
    pub name: String,
    pub checksum: String,
    pub execution_ms: i32,
    pub batch_id: Option<String>,
    pub app_version: Option<String>,
}
