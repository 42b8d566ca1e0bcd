//! Run results and read-only migration status

use crate::migration::LedgerEntry;
use serde::Serialize;
use std::path::PathBuf;

/// Outcome of one orchestrator invocation
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RunResult {
    /// Migrations applied by this run, in apply order
    pub applied: Vec<String>,

    /// Migrations already in the ledger with a matching checksum
    pub skipped: Vec<String>,

    /// The run was short-circuited by an operator pause
    pub paused: bool,

    /// Identifier stamped on every ledger row written by this run
    pub batch_id: Option<String>,
}

impl RunResult {
    /// A run that did nothing because migrations are paused
    #[must_use]
    pub fn paused() -> Self {
        Self {
            paused: true,
            ..Self::default()
        }
    }
}

/// Applied vs pending listing, without any integrity enforcement
#[derive(Debug, Clone)]
pub struct MigrationStatus {
    /// Applied migrations (from the ledger, in name order)
    pub applied: Vec<LedgerEntry>,

    /// Pending migrations (from the catalog)
    pub pending: Vec<PendingMigration>,
}

/// A migration present locally but not in the ledger
#[derive(Debug, Clone)]
pub struct PendingMigration {
    pub name: String,
    pub path: PathBuf,
    pub checksum: String,
}

impl MigrationStatus {
    /// Check if all migrations are applied
    #[must_use]
    pub fn is_up_to_date(&self) -> bool {
        self.pending.is_empty()
    }

    /// Get the most recently named applied migration
    #[must_use]
    pub fn latest_applied(&self) -> Option<&str> {
        self.applied.last().map(|m| m.name.as_str())
    }

    /// Get the next pending migration
    #[must_use]
    pub fn next_pending(&self) -> Option<&str> {
        self.pending.first().map(|m| m.name.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paused_result() {
        let result = RunResult::paused();
        assert!(result.paused);
        assert!(result.applied.is_empty());
        assert!(result.skipped.is_empty());
    }
}
