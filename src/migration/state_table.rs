//! Ledger table naming and SQL

use crate::MigrateError;
use once_cell::sync::Lazy;
use regex::Regex;
use std::fmt;

/// Default ledger table name
pub const DEFAULT_LEDGER_TABLE: &str = "schema_migrations";

static IDENT_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z_][A-Za-z0-9_]{0,62}(\.[A-Za-z_][A-Za-z0-9_]{0,62})?$")
        .expect("identifier pattern is valid")
});

/// A validated, optionally schema-qualified ledger table name
///
/// The name is interpolated into SQL, so only plain identifiers are accepted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerTable(String);

impl LedgerTable {
    /// # Errors
    ///
    /// Returns `MigrateError::Config` if `name` is not a plain identifier.
    pub fn new(name: impl Into<String>) -> Result<Self, MigrateError> {
        let name = name.into();
        if IDENT_RE.is_match(&name) {
            Ok(Self(name))
        } else {
            Err(MigrateError::Config(format!(
                "Ledger table name '{name}' must be an identifier, optionally schema-qualified"
            )))
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// `CREATE TABLE IF NOT EXISTS` statement for the ledger
    #[must_use]
    pub fn create_sql(&self) -> String {
        format!(
            r#"
            CREATE TABLE IF NOT EXISTS {} (
                name TEXT PRIMARY KEY,
                checksum TEXT NOT NULL,
                applied_at TIMESTAMPTZ NOT NULL DEFAULT now(),
                execution_ms INTEGER NOT NULL,
                batch_id TEXT,
                app_version TEXT
            )
            "#,
            self.0
        )
    }

    /// Select every ledger row, `applied_at` rendered as UTC text
    #[must_use]
    pub fn select_sql(&self) -> String {
        format!(
            r#"
            SELECT name, checksum, (applied_at AT TIME ZONE 'UTC')::text,
                   execution_ms, batch_id, app_version
            FROM {}
            ORDER BY name ASC
            "#,
            self.0
        )
    }

    /// Parameterized insert: `$1` name, `$2` checksum, `$3` execution_ms,
    /// `$4` batch_id, `$5` app_version
    #[must_use]
    pub fn insert_sql(&self) -> String {
        format!(
            r#"
            INSERT INTO {} (name, checksum, execution_ms, batch_id, app_version)
            VALUES ($1, $2, $3, $4, $5)
            "#,
            self.0
        )
    }
}

impl Default for LedgerTable {
    fn default() -> Self {
        Self(DEFAULT_LEDGER_TABLE.to_string())
    }
}

impl fmt::Display for LedgerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_table_names() {
        for name in ["schema_migrations", "ops.schema_migrations", "_ledger2"] {
            assert!(LedgerTable::new(name).is_ok(), "Should accept: {name}");
        }
    }

    #[test]
    fn test_invalid_table_names() {
        for name in [
            "",
            "1ledger",
            "ledger; DROP TABLE cards",
            "a.b.c",
            "\"quoted\"",
        ] {
            assert!(LedgerTable::new(name).is_err(), "Should reject: {name}");
        }
    }

    #[test]
    fn test_sql_uses_table_name() {
        let table = LedgerTable::new("ops.ledger").unwrap();
        assert!(table.create_sql().contains("CREATE TABLE IF NOT EXISTS ops.ledger"));
        assert!(table.create_sql().contains("name TEXT PRIMARY KEY"));
        assert!(table.select_sql().contains("FROM ops.ledger"));
        assert!(table.insert_sql().contains("INSERT INTO ops.ledger"));
        assert_eq!(LedgerTable::default().as_str(), DEFAULT_LEDGER_TABLE);
    }
}
