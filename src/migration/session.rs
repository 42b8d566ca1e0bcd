//! `MigrationSession` - the database seam used by the ledger, apply engine and
//! drift validator.
//!
//! The orchestrator only ever talks to the database through this trait, which
//! lets tests substitute an in-memory session and keeps all SQL text for the
//! real database in [`crate::connection::postgres`].

use crate::migration::{LedgerTable, LockKey};
use crate::migration::record::{LedgerEntry, NewLedgerEntry};
use crate::SessionError;

/// One live database session
///
/// Advisory locks taken through a session are scoped to it: closing the
/// session releases them.
pub trait MigrationSession {
    /// Round-trip a trivial query to prove the session is usable
    fn ping(&self) -> Result<(), SessionError>;

    /// Create the ledger table if it does not exist
    fn create_ledger(&self, table: &LedgerTable) -> Result<(), SessionError>;

    /// Read every ledger row
    fn ledger_entries(&self, table: &LedgerTable) -> Result<Vec<LedgerEntry>, SessionError>;

    /// Block until the advisory lock is held by this session
    fn advisory_lock(&self, key: LockKey) -> Result<(), SessionError>;

    /// Take the advisory lock if it is free; `false` if another session holds it
    fn try_advisory_lock(&self, key: LockKey) -> Result<bool, SessionError>;

    /// Release the advisory lock; `false` if this session did not hold it
    fn advisory_unlock(&self, key: LockKey) -> Result<bool, SessionError>;

    fn begin(&self) -> Result<(), SessionError>;

    /// Execute a migration script verbatim (may contain several statements)
    fn run_script(&self, sql: &str) -> Result<(), SessionError>;

    /// Insert one ledger row
    fn insert_entry(&self, table: &LedgerTable, entry: &NewLedgerEntry)
        -> Result<(), SessionError>;

    fn commit(&self) -> Result<(), SessionError>;

    fn rollback(&self) -> Result<(), SessionError>;

    /// Close the session, releasing any session-scoped locks
    fn close(self: Box<Self>);
}
