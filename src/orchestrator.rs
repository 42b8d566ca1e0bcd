//! The resolve → connect → apply sequence shared by the lifecycle handler and the CLI

use crate::config::Settings;
use crate::connection::{resolve, Connector, Establisher, PoolHealthProbe};
use crate::migration::{
    discover_migrations, ApplyOptions, Catalog, DriftReport, DriftValidator, MigrationSession,
    MigrationStatus, Migrator, RunResult,
};
use crate::secrets::SecretStore;
use crate::MigrateError;

/// External collaborators a run depends on
#[derive(Clone, Copy)]
pub struct Collaborators<'a> {
    pub secrets: &'a dyn SecretStore,
    pub connector: &'a dyn Connector,
    /// Polled before connecting through a pooling proxy, when present
    pub pool_health: Option<&'a dyn PoolHealthProbe>,
}

/// Per-invocation inputs resolved at the caller's boundary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub paused: bool,
    pub batch_id: String,
    pub app_version: Option<String>,
}

impl RunRequest {
    /// Apply run with a fresh batch id
    #[must_use]
    pub fn new(app_version: Option<String>) -> Self {
        let options = ApplyOptions::new(app_version);
        Self {
            paused: false,
            batch_id: options.batch_id,
            app_version: options.app_version,
        }
    }
}

pub struct Orchestrator<'a> {
    settings: Settings,
    deps: Collaborators<'a>,
}

impl<'a> Orchestrator<'a> {
    #[must_use]
    pub fn new(settings: Settings, deps: Collaborators<'a>) -> Self {
        Self { settings, deps }
    }

    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Discover the migration catalog under the configured directory
    ///
    /// # Errors
    ///
    /// Returns the discovery error (bad name, duplicate, unreadable file).
    pub fn catalog(&self) -> Result<Catalog, MigrateError> {
        discover_migrations(&self.settings.migrations_dir)
    }

    /// Apply every pending migration
    ///
    /// A paused request returns immediately without reading files or
    /// touching the database. Files are discovered and validated before any
    /// connection is opened.
    ///
    /// # Errors
    ///
    /// Returns the first error of discovery, resolution, connection or apply.
    pub fn run(&self, request: &RunRequest) -> Result<RunResult, MigrateError> {
        if request.paused {
            log::warn!("Migrations are paused; skipping run {}", request.batch_id);
            return Ok(RunResult::paused());
        }

        let catalog = self.catalog()?;
        let migrator = Migrator::new(self.settings.ledger()?);
        let options = ApplyOptions {
            batch_id: request.batch_id.clone(),
            app_version: request.app_version.clone(),
        };

        log::info!(
            "Starting migration run {} ({} file(s) in {})",
            options.batch_id,
            catalog.len(),
            self.settings.migrations_dir.display()
        );
        self.with_session(|session| migrator.apply(session, &catalog, &options))
    }

    /// Check the ledger against the migration files without writing
    ///
    /// # Errors
    ///
    /// `MigrateError::Drift` with every discrepancy, `LockContention` while an
    /// apply run holds the lock, or any discovery/connection error.
    pub fn validate(&self) -> Result<DriftReport, MigrateError> {
        let catalog = self.catalog()?;
        let validator = DriftValidator::new(self.settings.ledger()?);
        self.with_session(|session| validator.validate(session, &catalog))
    }

    /// Applied vs pending listing
    ///
    /// # Errors
    ///
    /// Returns any discovery, connection or ledger read error.
    pub fn status(&self) -> Result<MigrationStatus, MigrateError> {
        let catalog = self.catalog()?;
        let migrator = Migrator::new(self.settings.ledger()?);
        self.with_session(|session| migrator.status(session, &catalog))
    }

    /// Resolve targets and open a pinged session
    ///
    /// # Errors
    ///
    /// Returns configuration, secret or connection errors.
    pub fn open_session(&self) -> Result<Box<dyn MigrationSession>, MigrateError> {
        let resolved = resolve(&self.settings, self.deps.secrets)?;
        let mut establisher = Establisher::new(self.deps.connector, self.settings.retry_policy());
        if let Some(probe) = self.deps.pool_health {
            establisher = establisher.with_pool_health(probe, self.settings.pool_health_policy());
        }
        establisher.establish(&resolved)
    }

    /// Run `work` on a fresh session, closing it on every path
    fn with_session<T>(
        &self,
        work: impl FnOnce(&dyn MigrationSession) -> Result<T, MigrateError>,
    ) -> Result<T, MigrateError> {
        let session = self.open_session()?;
        let outcome = work(session.as_ref());
        session.close();
        outcome
    }
}
