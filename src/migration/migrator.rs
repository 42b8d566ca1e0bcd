//! Migrator - Core migration execution engine

use crate::migration::{
    Catalog, Ledger, LedgerEntry, MigrationFile, MigrationSession, MigrationStatus,
    NewLedgerEntry, PendingMigration, RunResult,
};
use crate::{MigrateError, SessionError};
use std::collections::HashMap;
use std::time::Instant;

/// Per-run values stamped onto every ledger row the run writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyOptions {
    pub batch_id: String,
    pub app_version: Option<String>,
}

impl ApplyOptions {
    /// Options with a fresh random batch id
    #[must_use]
    pub fn new(app_version: Option<String>) -> Self {
        Self {
            batch_id: uuid::Uuid::new_v4().to_string(),
            app_version,
        }
    }
}

/// Core migration execution engine
///
/// One `apply` call is one pass over the sorted catalog while holding the
/// advisory lock. Each pending migration runs in its own transaction together
/// with its ledger insert. The first failure aborts the run: the failing
/// transaction is rolled back, migrations committed before it stay committed,
/// and nothing after it is attempted.
#[derive(Debug, Clone, Default)]
pub struct Migrator {
    ledger: Ledger,
}

impl Migrator {
    #[must_use]
    pub fn new(ledger: Ledger) -> Self {
        Self { ledger }
    }

    #[must_use]
    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    /// Apply every pending migration in catalog order
    ///
    /// # Errors
    ///
    /// - `MigrateError::ChecksumMismatch` if an applied migration was edited
    /// - `MigrateError::Execution` if a migration or its ledger insert fails
    /// - `MigrateError::Database` if ledger bookkeeping or locking fails
    pub fn apply(
        &self,
        session: &dyn MigrationSession,
        catalog: &Catalog,
        options: &ApplyOptions,
    ) -> Result<RunResult, MigrateError> {
        #[cfg(feature = "tracing")]
        let _span = tracing::info_span!(
            "apply_migrations",
            batch_id = %options.batch_id,
            migrations = catalog.len()
        )
        .entered();

        // Concurrent first deploys can race on CREATE TABLE IF NOT EXISTS;
        // the loser retries once the winner has committed
        let created = self.ledger.ensure(session);

        let mut result = RunResult {
            batch_id: Some(options.batch_id.clone()),
            ..RunResult::default()
        };

        if catalog.is_empty() {
            if let Err(e) = created {
                log::warn!("Creating ledger failed ({e}); retrying");
                self.ledger.ensure(session)?;
            }
            log::info!("No migrations discovered, nothing to apply");
            return Ok(result);
        }

        let lock = self.ledger.acquire_lock(session)?;
        if let Err(e) = created {
            log::warn!("Creating ledger failed ({e}); retrying under the lock");
            self.ledger.ensure(session)?;
        }
        // The guard releases the lock on every exit path below
        let applied = self.ledger.entries(session)?;
        warn_orphaned(&applied, catalog);

        for file in catalog {
            if let Some(entry) = applied.get(&file.name) {
                if entry.checksum != file.checksum {
                    return Err(MigrateError::ChecksumMismatch {
                        name: file.name.clone(),
                        stored: entry.checksum.clone(),
                        current: file.checksum.clone(),
                    });
                }
                log::debug!("Skipping {} (already applied)", file.name);
                result.skipped.push(file.name.clone());
                continue;
            }

            let execution_ms = self.apply_one(session, file, options)?;
            log::info!("Applied {} in {}ms", file.name, execution_ms);
            result.applied.push(file.name.clone());
        }

        self.ledger.release_lock(lock);

        log::info!(
            "Migration batch {} finished: {} applied, {} skipped",
            options.batch_id,
            result.applied.len(),
            result.skipped.len()
        );
        Ok(result)
    }

    /// Run one migration and its ledger insert in a single transaction
    fn apply_one(
        &self,
        session: &dyn MigrationSession,
        file: &MigrationFile,
        options: &ApplyOptions,
    ) -> Result<i32, MigrateError> {
        let execution_failed = |source: SessionError| MigrateError::Execution {
            name: file.name.clone(),
            source,
        };

        session.begin().map_err(execution_failed)?;

        let start = Instant::now();
        if let Err(e) = session.run_script(&file.sql) {
            rollback_quietly(session, &file.name);
            return Err(execution_failed(e));
        }
        let execution_ms = i32::try_from(start.elapsed().as_millis()).unwrap_or(i32::MAX);

        let entry = NewLedgerEntry {
            name: file.name.clone(),
            checksum: file.checksum.clone(),
            execution_ms,
            batch_id: Some(options.batch_id.clone()),
            app_version: options.app_version.clone(),
        };
        if let Err(e) = session.insert_entry(self.ledger.table(), &entry) {
            rollback_quietly(session, &file.name);
            return Err(execution_failed(e));
        }

        if let Err(e) = session.commit() {
            rollback_quietly(session, &file.name);
            return Err(execution_failed(e));
        }

        Ok(execution_ms)
    }

    /// Get migration status (applied vs pending) without taking the lock
    ///
    /// Intended for operator tooling; use the drift validator for an
    /// integrity check.
    ///
    /// # Errors
    ///
    /// Returns `MigrateError::Database` if the ledger cannot be read.
    pub fn status(
        &self,
        session: &dyn MigrationSession,
        catalog: &Catalog,
    ) -> Result<MigrationStatus, MigrateError> {
        self.ledger.ensure(session)?;
        let applied = self.ledger.entries(session)?;

        let pending = catalog
            .iter()
            .filter(|file| !applied.contains_key(&file.name))
            .map(|file| PendingMigration {
                name: file.name.clone(),
                path: file.path.clone(),
                checksum: file.checksum.clone(),
            })
            .collect();

        let mut applied: Vec<LedgerEntry> = applied.into_values().collect();
        applied.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(MigrationStatus { applied, pending })
    }
}

fn rollback_quietly(session: &dyn MigrationSession, name: &str) {
    if let Err(e) = session.rollback() {
        log::warn!("Rollback after failed migration {name} also failed: {e}");
    }
}

fn warn_orphaned(applied: &HashMap<String, LedgerEntry>, catalog: &Catalog) {
    for name in applied.keys() {
        if catalog.get(name).is_none() {
            log::warn!("Ledger entry {name} has no matching migration file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::{LedgerTable, LockKey};
    use crate::test_helpers::{Call, MemorySession};
    use crate::ErrorKind;

    const AUTH: &str = "2024-01-01T1200__auth__init.sql";
    const CARDS: &str = "2024-02-15T1530__cards__create-table.sql";
    const SEARCH: &str = "2024-03-01T1200__search__add-index.sql";

    fn file(name: &str, sql: &str) -> MigrationFile {
        MigrationFile::new(name, sql, name).unwrap()
    }

    fn three_files_shuffled() -> Catalog {
        Catalog::new(vec![
            file(SEARCH, "CREATE INDEX cards_email_idx ON cards (email);"),
            file(AUTH, "CREATE TABLE users (id uuid PRIMARY KEY);"),
            file(CARDS, "CREATE TABLE cards (id uuid PRIMARY KEY, email text);"),
        ])
        .unwrap()
    }

    fn options() -> ApplyOptions {
        ApplyOptions {
            batch_id: "batch-1".to_string(),
            app_version: Some("1.4.2".to_string()),
        }
    }

    #[test]
    fn test_first_and_second_run() {
        let session = MemorySession::new();
        let migrator = Migrator::default();
        let catalog = three_files_shuffled();

        let first = migrator.apply(&session, &catalog, &options()).unwrap();
        assert_eq!(first.applied, vec![AUTH, CARDS, SEARCH]);
        assert!(first.skipped.is_empty());
        assert!(!first.paused);
        assert_eq!(first.batch_id.as_deref(), Some("batch-1"));

        let ledger_before = session.ledger();
        let second = migrator.apply(&session, &catalog, &options()).unwrap();
        assert!(second.applied.is_empty());
        assert_eq!(second.skipped, vec![AUTH, CARDS, SEARCH]);
        assert_eq!(session.ledger(), ledger_before);
    }

    #[test]
    fn test_applied_order_follows_names_not_input() {
        let session = MemorySession::new();
        let result = Migrator::default()
            .apply(&session, &three_files_shuffled(), &options())
            .unwrap();
        let scripts: Vec<String> = session
            .calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Script(sql) => Some(sql),
                _ => None,
            })
            .collect();
        assert_eq!(result.applied, vec![AUTH, CARDS, SEARCH]);
        assert!(scripts[0].starts_with("CREATE TABLE users"));
        assert!(scripts[2].starts_with("CREATE INDEX"));
    }

    #[test]
    fn test_ledger_rows_carry_run_metadata() {
        let session = MemorySession::new();
        let catalog = Catalog::new(vec![file(AUTH, "SELECT 1;")]).unwrap();
        Migrator::default().apply(&session, &catalog, &options()).unwrap();

        let ledger = session.ledger();
        let entry = &ledger[AUTH];
        assert_eq!(entry.checksum, catalog.files()[0].checksum);
        assert_eq!(entry.batch_id.as_deref(), Some("batch-1"));
        assert_eq!(entry.app_version.as_deref(), Some("1.4.2"));
        assert!(entry.execution_ms >= 0);
    }

    #[test]
    fn test_checksum_mismatch_is_fatal_and_keeps_earlier_commits() {
        let session = MemorySession::new();
        session.seed_entry(CARDS, "stale-checksum");

        let err = Migrator::default()
            .apply(&session, &three_files_shuffled(), &options())
            .unwrap_err();

        match &err {
            MigrateError::ChecksumMismatch { name, stored, .. } => {
                assert_eq!(name, CARDS);
                assert_eq!(stored, "stale-checksum");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(err.kind(), ErrorKind::Integrity);

        let ledger = session.ledger();
        assert!(ledger.contains_key(AUTH), "earlier migration stays committed");
        assert_eq!(ledger[CARDS].checksum, "stale-checksum");
        assert!(!ledger.contains_key(SEARCH), "later migration not attempted");
        assert_eq!(session.count(|c| matches!(c, Call::Unlock(_))), 1);
    }

    #[test]
    fn test_failing_migration_rolls_back_and_stops() {
        let session = MemorySession::new();
        session.fail_script_containing("cards");

        let err = Migrator::default()
            .apply(&session, &three_files_shuffled(), &options())
            .unwrap_err();

        match &err {
            MigrateError::Execution { name, .. } => assert_eq!(name, CARDS),
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.to_string().starts_with(CARDS));

        let ledger = session.ledger();
        assert_eq!(ledger.len(), 1);
        assert!(ledger.contains_key(AUTH));
        assert_eq!(session.count(|c| matches!(c, Call::Rollback)), 1);
        assert_eq!(session.count(|c| matches!(c, Call::Script(_))), 2);
        assert_eq!(session.count(|c| matches!(c, Call::Lock(_))), 1);
        assert_eq!(session.count(|c| matches!(c, Call::Unlock(_))), 1);
    }

    #[test]
    fn test_failing_ledger_insert_rolls_back() {
        let session = MemorySession::new();
        session.fail_insert_for(AUTH);

        let err = Migrator::default()
            .apply(&session, &three_files_shuffled(), &options())
            .unwrap_err();

        assert!(matches!(err, MigrateError::Execution { ref name, .. } if name == AUTH));
        assert!(session.ledger().is_empty());
        assert_eq!(session.count(|c| matches!(c, Call::Rollback)), 1);
        assert_eq!(session.count(|c| matches!(c, Call::Commit)), 0);
    }

    #[test]
    fn test_successful_run_locks_once() {
        let session = MemorySession::new();
        let key = LockKey::new(11, 12);
        let migrator = Migrator::new(Ledger::new(LedgerTable::default(), key));
        migrator
            .apply(&session, &three_files_shuffled(), &options())
            .unwrap();

        let calls = session.calls();
        assert_eq!(calls.iter().filter(|c| **c == Call::Lock(key)).count(), 1);
        assert_eq!(calls.iter().filter(|c| **c == Call::Unlock(key)).count(), 1);
        assert_eq!(calls.last(), Some(&Call::Unlock(key)));
    }

    #[test]
    fn test_empty_catalog_only_ensures_ledger() {
        let session = MemorySession::new();
        let result = Migrator::default()
            .apply(&session, &Catalog::default(), &options())
            .unwrap();
        assert!(result.applied.is_empty() && result.skipped.is_empty());
        assert_eq!(session.calls(), vec![Call::CreateLedger]);
    }

    #[test]
    fn test_lost_ledger_creation_race_retries_under_lock() {
        let session = MemorySession::new();
        session.fail_ledger_creation(1);
        let key = LockKey::new(11, 12);
        let migrator = Migrator::new(Ledger::new(LedgerTable::default(), key));

        let result = migrator
            .apply(&session, &three_files_shuffled(), &options())
            .unwrap();

        assert_eq!(result.applied.len(), 3);
        assert_eq!(
            &session.calls()[..3],
            &[Call::CreateLedger, Call::Lock(key), Call::CreateLedger]
        );
    }

    #[test]
    fn test_ledger_creation_failing_twice_is_fatal() {
        let session = MemorySession::new();
        session.fail_ledger_creation(2);
        let err = Migrator::default()
            .apply(&session, &three_files_shuffled(), &options())
            .unwrap_err();

        assert!(matches!(err, MigrateError::Database(_)));
        assert!(session.ledger().is_empty());
        assert_eq!(session.count(|c| matches!(c, Call::Unlock(_))), 1);
    }

    #[test]
    fn test_orphaned_ledger_rows_are_left_alone() {
        let session = MemorySession::new();
        session.seed_entry("2023-12-31T2359__legacy__drop-me.sql", "zzz");
        let result = Migrator::default()
            .apply(&session, &three_files_shuffled(), &options())
            .unwrap();
        assert_eq!(result.applied.len(), 3);
        assert!(session
            .ledger()
            .contains_key("2023-12-31T2359__legacy__drop-me.sql"));
    }

    #[test]
    fn test_status_lists_pending() {
        let session = MemorySession::new();
        let catalog = three_files_shuffled();
        session.seed_entry(AUTH, &catalog.files()[0].checksum);

        let status = Migrator::default().status(&session, &catalog).unwrap();
        assert_eq!(status.latest_applied(), Some(AUTH));
        assert_eq!(status.next_pending(), Some(CARDS));
        assert_eq!(status.pending.len(), 2);
        assert!(!status.is_up_to_date());
        assert_eq!(session.count(|c| matches!(c, Call::Lock(_))), 0);
    }
}
