//! Drift validation - read-only comparison of the ledger against the catalog

use crate::migration::{Catalog, Ledger, MigrationSession};
use crate::MigrateError;
use serde::Serialize;
use std::fmt;

/// An applied migration whose file no longer matches the recorded checksum
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChecksumMismatch {
    pub name: String,
    /// Checksum recorded in the ledger
    pub expected: String,
    /// Checksum of the current file
    pub actual: String,
}

/// Discrepancies between local migration files and the ledger
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DriftReport {
    /// Local file with no ledger entry
    pub missing: Vec<String>,
    /// Ledger entry whose checksum differs from the file
    pub mismatched: Vec<ChecksumMismatch>,
    /// Ledger entry with no local file
    pub unexpected: Vec<String>,
}

impl DriftReport {
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.missing.is_empty() && self.mismatched.is_empty() && self.unexpected.is_empty()
    }
}

impl fmt::Display for DriftReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} missing, {} mismatched, {} unexpected",
            self.missing.len(),
            self.mismatched.len(),
            self.unexpected.len()
        )?;
        for name in &self.missing {
            write!(f, "\n  missing: {name}")?;
        }
        for m in &self.mismatched {
            write!(
                f,
                "\n  mismatched: {} (ledger {}, file {})",
                m.name, m.expected, m.actual
            )?;
        }
        for name in &self.unexpected {
            write!(f, "\n  unexpected: {name}")?;
        }
        Ok(())
    }
}

/// Read-only counterpart of the [`Migrator`](crate::migration::Migrator)
///
/// Takes the advisory lock without waiting so it never compares against a
/// ledger that an apply run is still writing.
#[derive(Debug, Clone, Default)]
pub struct DriftValidator {
    ledger: Ledger,
}

impl DriftValidator {
    #[must_use]
    pub fn new(ledger: Ledger) -> Self {
        Self { ledger }
    }

    /// Compare the ledger with the catalog
    ///
    /// Returns the (empty) report when everything matches.
    ///
    /// # Errors
    ///
    /// - `MigrateError::LockContention` if an apply run holds the lock
    /// - `MigrateError::Drift` carrying every discrepancy found
    /// - `MigrateError::Database` if the ledger cannot be read
    pub fn validate(
        &self,
        session: &dyn MigrationSession,
        catalog: &Catalog,
    ) -> Result<DriftReport, MigrateError> {
        #[cfg(feature = "tracing")]
        let _span = tracing::info_span!("validate_migrations", migrations = catalog.len()).entered();

        self.ledger.ensure(session)?;
        let lock = self.ledger.try_acquire_lock(session)?;
        let entries = self.ledger.entries(session)?;
        self.ledger.release_lock(lock);

        let mut report = DriftReport::default();
        for file in catalog {
            match entries.get(&file.name) {
                None => report.missing.push(file.name.clone()),
                Some(entry) if entry.checksum != file.checksum => {
                    report.mismatched.push(ChecksumMismatch {
                        name: file.name.clone(),
                        expected: entry.checksum.clone(),
                        actual: file.checksum.clone(),
                    });
                }
                Some(_) => {}
            }
        }
        let mut unexpected: Vec<String> = entries
            .into_keys()
            .filter(|name| catalog.get(name).is_none())
            .collect();
        unexpected.sort();
        report.unexpected = unexpected;

        if report.is_clean() {
            log::info!("No drift: {} migration(s) match the ledger", catalog.len());
            Ok(report)
        } else {
            Err(MigrateError::Drift(report))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::MigrationFile;
    use crate::test_helpers::{Call, MemorySession};

    const AUTH: &str = "2024-01-01T1200__auth__init.sql";
    const CARDS: &str = "2024-02-15T1530__cards__create-table.sql";

    fn catalog(names: &[&str]) -> Catalog {
        Catalog::new(
            names
                .iter()
                .map(|n| MigrationFile::new(*n, format!("-- {n}"), *n).unwrap())
                .collect(),
        )
        .unwrap()
    }

    fn drift(result: Result<DriftReport, MigrateError>) -> DriftReport {
        match result {
            Err(MigrateError::Drift(report)) => report,
            Err(other) => panic!("unexpected error: {other}"),
            Ok(report) => panic!("expected drift, got clean report {report:?}"),
        }
    }

    #[test]
    fn test_missing_migration() {
        let session = MemorySession::new();
        let report = drift(DriftValidator::default().validate(&session, &catalog(&[AUTH])));
        assert_eq!(report.missing, vec![AUTH]);
        assert!(report.mismatched.is_empty());
        assert!(report.unexpected.is_empty());
    }

    #[test]
    fn test_checksum_mismatch() {
        let session = MemorySession::new();
        let catalog = catalog(&[AUTH]);
        session.seed_entry(AUTH, "deadbeef");
        let report = drift(DriftValidator::default().validate(&session, &catalog));
        assert_eq!(
            report.mismatched,
            vec![ChecksumMismatch {
                name: AUTH.to_string(),
                expected: "deadbeef".to_string(),
                actual: catalog.files()[0].checksum.clone(),
            }]
        );
        assert!(report.missing.is_empty());
        assert!(report.unexpected.is_empty());
    }

    #[test]
    fn test_unexpected_entry() {
        let session = MemorySession::new();
        session.seed_entry(CARDS, "abc");
        let report = drift(DriftValidator::default().validate(&session, &Catalog::default()));
        assert_eq!(report.unexpected, vec![CARDS]);
        assert!(report.missing.is_empty());
        assert!(report.mismatched.is_empty());
    }

    #[test]
    fn test_all_dimensions_reported_together() {
        let session = MemorySession::new();
        session.seed_entry(AUTH, "deadbeef");
        session.seed_entry("2023-06-01T0000__legacy__old.sql", "abc");
        let report = drift(DriftValidator::default().validate(&session, &catalog(&[AUTH, CARDS])));
        assert_eq!(report.missing, vec![CARDS]);
        assert_eq!(report.mismatched.len(), 1);
        assert_eq!(report.unexpected, vec!["2023-06-01T0000__legacy__old.sql"]);
        let rendered = report.to_string();
        assert!(rendered.starts_with("1 missing, 1 mismatched, 1 unexpected"));
    }

    #[test]
    fn test_clean_match() {
        let session = MemorySession::new();
        let catalog = catalog(&[AUTH, CARDS]);
        for file in &catalog {
            session.seed_entry(&file.name, &file.checksum);
        }
        let report = DriftValidator::default().validate(&session, &catalog).unwrap();
        assert!(report.is_clean());
        assert_eq!(session.count(|c| matches!(c, Call::TryLock(_))), 1);
        assert_eq!(session.count(|c| matches!(c, Call::Unlock(_))), 1);
    }

    #[test]
    fn test_fails_fast_when_apply_in_progress() {
        let session = MemorySession::new();
        session.hold_lock_elsewhere();
        let err = DriftValidator::default()
            .validate(&session, &catalog(&[AUTH]))
            .unwrap_err();
        assert!(matches!(err, MigrateError::LockContention { .. }));
        assert_eq!(session.count(|c| matches!(c, Call::LoadLedger)), 0);
    }

    #[test]
    fn test_never_writes() {
        let session = MemorySession::new();
        let _ = DriftValidator::default().validate(&session, &catalog(&[AUTH, CARDS]));
        assert!(session.ledger().is_empty());
        assert_eq!(
            session.count(|c| matches!(
                c,
                Call::Begin | Call::Script(_) | Call::Insert(_) | Call::Commit
            )),
            0
        );
    }
}
