//! Error taxonomy for the migration orchestrator

use crate::migration::drift::DriftReport;
use may_postgres::Error as PostgresError;
use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by a [`MigrationSession`](crate::migration::MigrationSession)
#[derive(Debug, Error)]
pub enum SessionError {
    /// `PostgreSQL` error from `may_postgres`
    #[error("PostgreSQL error: {0}")]
    Postgres(#[from] PostgresError),
    /// Row parsing/conversion error
    #[error("Parse error: {0}")]
    Parse(String),
    /// Other driver errors
    #[error("{0}")]
    Other(String),
}

/// Coarse classification of a [`MigrateError`], used for alarms and exit reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Configuration,
    Integrity,
    Connectivity,
    Execution,
    LockContention,
    Drift,
    Database,
}

/// Orchestrator errors
#[derive(Debug, Error)]
pub enum MigrateError {
    /// Unresolved or incomplete settings
    #[error("Configuration error: {0}")]
    Config(String),

    /// A `.sql` file in the migrations tree does not follow the naming grammar
    #[error(
        "Invalid migration file name '{name}' ({path}): expected \
         YYYY-MM-DDTHHMM__service__description.sql with lowercase [a-z0-9-] tokens"
    )]
    InvalidFileName { name: String, path: PathBuf },

    /// Two migrations share the same name
    #[error("Duplicate migration name '{name}': {first} and {second}")]
    DuplicateName {
        name: String,
        first: PathBuf,
        second: PathBuf,
    },

    /// Migration file could not be read
    #[error("Failed to read migration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Credentials could not be fetched from the secret store
    #[error("Secret resolution failed: {0}")]
    Secret(#[from] crate::secrets::SecretError),

    /// An applied migration was edited after it was recorded in the ledger
    #[error(
        "Migration '{name}' has been modified after being applied.\n\
         Stored checksum: {stored}\n\
         Current checksum: {current}\n\
         Ship the change as a new migration with a later timestamp."
    )]
    ChecksumMismatch {
        name: String,
        stored: String,
        current: String,
    },

    /// All connection attempts to a target failed
    #[error("Could not connect to {label} after {attempts} attempt(s): {source}")]
    Connection {
        label: String,
        attempts: u32,
        #[source]
        source: SessionError,
    },

    /// A migration's SQL or its ledger insert failed; the transaction was rolled back
    #[error("{name}: {source}")]
    Execution {
        name: String,
        #[source]
        source: SessionError,
    },

    /// The advisory lock is held elsewhere
    #[error(
        "Migration lock ({partition}, {token}) is held: validation cannot proceed, \
         another run may be in progress"
    )]
    LockContention { partition: i32, token: i32 },

    /// Ledger and migration files disagree
    #[error("Migration drift detected: {0}")]
    Drift(DriftReport),

    /// Ledger bookkeeping failed
    #[error("Database error: {0}")]
    Database(#[from] SessionError),
}

impl MigrateError {
    /// Classify the error
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            MigrateError::Config(_)
            | MigrateError::InvalidFileName { .. }
            | MigrateError::DuplicateName { .. }
            | MigrateError::Io { .. }
            | MigrateError::Secret(_) => ErrorKind::Configuration,
            MigrateError::ChecksumMismatch { .. } => ErrorKind::Integrity,
            MigrateError::Connection { .. } => ErrorKind::Connectivity,
            MigrateError::Execution { .. } => ErrorKind::Execution,
            MigrateError::LockContention { .. } => ErrorKind::LockContention,
            MigrateError::Drift(_) => ErrorKind::Drift,
            MigrateError::Database(_) => ErrorKind::Database,
        }
    }
}
