//! Migration system
//!
//! This module provides:
//! - Migration file discovery and checksumming ([`discover_migrations`])
//! - The ledger table and advisory lock ([`Ledger`])
//! - Exactly-once, in-order execution ([`Migrator`])
//! - Read-only drift detection ([`DriftValidator`])
//!
//! # Example
//!
//! ```rust,no_run
//! use schemawarden::migration::{discover_migrations, ApplyOptions, Migrator};
//! use schemawarden::connection::postgres::PgSession;
//! use std::path::Path;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let session = PgSession::connect("host=localhost user=postgres password=postgres dbname=cards")?;
//! let catalog = discover_migrations(Path::new("./migrations"))?;
//! let result = Migrator::default().apply(&session, &catalog, &ApplyOptions::new(None))?;
//! println!("applied {:?}", result.applied);
//! # Ok(())
//! # }
//! ```

pub mod checksum;
pub mod drift;
pub mod file;
pub mod ledger;
pub mod lock;
pub mod migrator;
pub mod record;
pub mod session;
pub mod state_table;
pub mod status;

pub use checksum::calculate_checksum;
pub use drift::{ChecksumMismatch, DriftReport, DriftValidator};
pub use file::{discover_migrations, is_valid_name, Catalog, MigrationFile};
pub use ledger::Ledger;
pub use lock::{LockKey, MigrationLockGuard};
pub use migrator::{ApplyOptions, Migrator};
pub use record::{LedgerEntry, NewLedgerEntry};
pub use session::MigrationSession;
pub use state_table::LedgerTable;
pub use status::{MigrationStatus, PendingMigration, RunResult};
