//! # Schemawarden
//!
//! Schema migration orchestrator for a shared PostgreSQL database.
//!
//! Service teams contribute timestamped SQL files; schemawarden applies each
//! exactly once, in name order, under a session-scoped advisory lock, and can
//! verify that a live ledger has not drifted from the files in source control.
//!
//! Entry points:
//! - [`lifecycle::LifecycleHandler`] for create/update/delete deployment events
//! - [`orchestrator::Orchestrator`] for direct apply / validate / status runs
//! - [`migration`] for the catalog, ledger, apply engine and drift validator

pub mod alarm;
pub mod config;
pub mod connection;
pub mod error;
pub mod lifecycle;
pub mod migration;
pub mod orchestrator;
pub mod secrets;

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers;

pub use config::Settings;
pub use error::{ErrorKind, MigrateError, SessionError};
