//! Ledger & lock manager
//!
//! Owns the applied-migrations table and the advisory lock key. All ledger
//! writes happen inside the apply engine's per-migration transaction; this type
//! only creates the table, reads it, and hands out lock guards.

use crate::migration::lock::MigrationLockGuard;
use crate::migration::{LedgerEntry, LedgerTable, LockKey, MigrationSession};
use crate::MigrateError;
use std::collections::HashMap;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Ledger {
    table: LedgerTable,
    lock_key: LockKey,
}

impl Ledger {
    #[must_use]
    pub fn new(table: LedgerTable, lock_key: LockKey) -> Self {
        Self { table, lock_key }
    }

    #[must_use]
    pub fn table(&self) -> &LedgerTable {
        &self.table
    }

    #[must_use]
    pub fn lock_key(&self) -> LockKey {
        self.lock_key
    }

    /// Create the ledger table if absent; a no-op when it exists
    ///
    /// # Errors
    ///
    /// Returns `MigrateError::Database` if the DDL fails.
    pub fn ensure(&self, session: &dyn MigrationSession) -> Result<(), MigrateError> {
        session.create_ledger(&self.table)?;
        Ok(())
    }

    /// Load all ledger rows keyed by name
    ///
    /// # Errors
    ///
    /// Returns `MigrateError::Database` if the query fails.
    pub fn entries(
        &self,
        session: &dyn MigrationSession,
    ) -> Result<HashMap<String, LedgerEntry>, MigrateError> {
        Ok(session
            .ledger_entries(&self.table)?
            .into_iter()
            .map(|entry| (entry.name.clone(), entry))
            .collect())
    }

    /// Wait indefinitely for the lock
    ///
    /// # Errors
    ///
    /// Returns `MigrateError::Database` if the lock query fails.
    pub fn acquire_lock<'a>(
        &self,
        session: &'a dyn MigrationSession,
    ) -> Result<MigrationLockGuard<'a>, MigrateError> {
        Ok(MigrationLockGuard::acquire(session, self.lock_key)?)
    }

    /// Take the lock without waiting
    ///
    /// # Errors
    ///
    /// Returns `MigrateError::LockContention` if another session holds the
    /// lock, or `MigrateError::Database` if the lock query fails.
    pub fn try_acquire_lock<'a>(
        &self,
        session: &'a dyn MigrationSession,
    ) -> Result<MigrationLockGuard<'a>, MigrateError> {
        MigrationLockGuard::try_acquire(session, self.lock_key)?.ok_or(
            MigrateError::LockContention {
                partition: self.lock_key.partition,
                token: self.lock_key.token,
            },
        )
    }

    /// Release a held lock; failures are logged, never raised
    pub fn release_lock(&self, guard: MigrationLockGuard<'_>) {
        guard.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{Call, MemorySession};

    #[test]
    fn test_ensure_is_idempotent() {
        let session = MemorySession::new();
        let ledger = Ledger::default();
        ledger.ensure(&session).unwrap();
        ledger.ensure(&session).unwrap();
        assert!(ledger.entries(&session).unwrap().is_empty());
        assert_eq!(session.count(|c| matches!(c, Call::CreateLedger)), 2);
    }

    #[test]
    fn test_try_acquire_lock_contention() {
        let session = MemorySession::new();
        session.hold_lock_elsewhere();
        let ledger = Ledger::new(LedgerTable::default(), LockKey::new(5, 6));
        match ledger.try_acquire_lock(&session) {
            Err(MigrateError::LockContention { partition, token }) => {
                assert_eq!((partition, token), (5, 6));
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("lock should be contended"),
        }
    }

    #[test]
    fn test_entries_keyed_by_name() {
        let session = MemorySession::new();
        session.seed_entry("2024-01-01T1200__auth__init.sql", "abc");
        let entries = Ledger::default().entries(&session).unwrap();
        assert_eq!(entries["2024-01-01T1200__auth__init.sql"].checksum, "abc");
    }
}
