//! Schemawarden CLI
//!
//! Operator tooling around the migration orchestrator: apply, validate, list
//! and scaffold migrations, or replay a deployment lifecycle event.
//! Settings come from `config/schemawarden.toml` and `SCHEMAWARDEN_*`
//! variables (a `.env` file is loaded first).

use anyhow::Context;
use clap::{Parser, Subcommand};
use colored::Colorize;
use schemawarden::alarm::{AlarmPublisher, LogAlarmPublisher, WebhookAlarmPublisher};
use schemawarden::connection::{HttpPoolHealthProbe, PgConnector, PoolHealthProbe};
use schemawarden::lifecycle::LifecycleHandler;
use schemawarden::orchestrator::{Collaborators, Orchestrator, RunRequest};
use schemawarden::secrets::LocalSecretStore;
use schemawarden::{MigrateError, Settings};
use schemawarden_cli::commands;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(name = "schemawarden")]
#[command(about = "Exactly-once PostgreSQL schema migrations")]
#[command(version)]
struct Cli {
    /// Migrations directory (overrides SCHEMAWARDEN_MIGRATIONS_DIR)
    #[arg(long, global = true)]
    migrations_dir: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Quiet output (errors only)
    #[arg(short, long, global = true)]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply pending migrations
    Apply {
        /// Version tag stamped on ledger rows
        #[arg(long)]
        app_version: Option<String>,

        /// Batch id stamped on ledger rows (default: random)
        #[arg(long)]
        batch_id: Option<String>,
    },

    /// Check the ledger against the migration files without writing
    Validate,

    /// Show applied vs pending migrations
    Status,

    /// List local migration files (no database access)
    List,

    /// Create a new migration file
    New {
        /// Owning service, e.g. "cards"
        service: String,

        /// Short description, e.g. "add-notes-column"
        description: String,
    },

    /// Handle a create/update/delete lifecycle event and print the response
    HandleEvent {
        /// Event JSON file, or "-" for stdin
        #[arg(long, default_value = "-")]
        event: String,
    },
}

fn main() -> ExitCode {
    dotenv::dotenv().ok();
    let cli = Cli::parse();

    let filter = if cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{} {e:#}", "Error:".red().bold());
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> anyhow::Result<()> {
    let mut settings = Settings::load().context("Failed to load settings")?;
    if let Some(dir) = cli.migrations_dir {
        settings.migrations_dir = dir;
    }
    log::debug!("Loaded {settings:?}");

    match cli.command {
        Commands::List => {
            let catalog = commands::list(&settings.migrations_dir)?;
            commands::print_catalog(&catalog);
        }
        Commands::New {
            service,
            description,
        } => {
            let path = commands::create_migration(
                &settings.migrations_dir,
                &service,
                &description,
                chrono::Utc::now(),
            )?;
            println!("{} {}", "Created".green(), path.display());
        }
        Commands::Apply {
            app_version,
            batch_id,
        } => {
            let mut request = RunRequest::new(app_version.or_else(|| settings.app_version.clone()));
            request.paused = settings.pause;
            if let Some(batch_id) = batch_id.or_else(|| settings.batch_id.clone()) {
                request.batch_id = batch_id;
            }
            let result = with_orchestrator(settings, |orchestrator, _| Ok(orchestrator.run(&request)?))?;
            commands::print_run_result(&result);
        }
        Commands::Validate => match with_orchestrator(settings, |o, _| Ok(o.validate()?)) {
            Ok(_) => println!("{}", "Ledger matches migration files".green()),
            Err(e) => {
                if let Some(MigrateError::Drift(report)) = e.downcast_ref::<MigrateError>() {
                    commands::print_drift(report);
                }
                return Err(e);
            }
        },
        Commands::Status => {
            let status = with_orchestrator(settings, |o, _| Ok(o.status()?))?;
            commands::print_status(&status);
        }
        Commands::HandleEvent { event } => {
            let event = commands::read_event(&event)?;
            let response = with_orchestrator(settings, |orchestrator, alarms| {
                Ok(LifecycleHandler::new(orchestrator, alarms).handle(&event)?)
            })?;
            println!("{}", commands::render_response(&response)?);
        }
    }
    Ok(())
}

/// Build an orchestrator over the production collaborators and hand it to `work`
fn with_orchestrator<T>(
    settings: Settings,
    work: impl FnOnce(&Orchestrator<'_>, &dyn AlarmPublisher) -> anyhow::Result<T>,
) -> anyhow::Result<T> {
    let secrets = LocalSecretStore;
    let connector = PgConnector;
    let probe = settings.pool_health_url.clone().map(HttpPoolHealthProbe::new);
    let alarms: Box<dyn AlarmPublisher> = match &settings.alarm_webhook_url {
        Some(url) => Box::new(WebhookAlarmPublisher::new(url.clone())),
        None => Box::new(LogAlarmPublisher),
    };

    let orchestrator = Orchestrator::new(
        settings,
        Collaborators {
            secrets: &secrets,
            connector: &connector,
            pool_health: probe.as_ref().map(|p| p as &dyn PoolHealthProbe),
        },
    );
    work(&orchestrator, alarms.as_ref())
}
