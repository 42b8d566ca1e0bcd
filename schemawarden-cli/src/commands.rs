//! Subcommand implementations that do not need a live database, plus output rendering

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use colored::Colorize;
use schemawarden::lifecycle::{LifecycleEvent, LifecycleResponse};
use schemawarden::migration::{
    discover_migrations, Catalog, DriftReport, MigrationFile, MigrationStatus, RunResult,
};
use std::fs;
use std::io::Read;
use std::path::{Path, PathBuf};

/// Create an empty, correctly named migration file
///
/// # Errors
///
/// Fails on invalid tokens, an existing file of the same name, or I/O errors.
pub fn create_migration(
    migrations_dir: &Path,
    service: &str,
    description: &str,
    now: DateTime<Utc>,
) -> anyhow::Result<PathBuf> {
    let file_name = MigrationFile::new_file_name(now, service, description)?;
    let service_dir = migrations_dir.join(service);
    fs::create_dir_all(&service_dir)
        .with_context(|| format!("Failed to create {}", service_dir.display()))?;

    let path = service_dir.join(&file_name);
    if path.exists() {
        bail!("{} already exists", path.display());
    }

    let template = format!(
        "-- {service}: {description}\n\
         -- Created {}\n\
         -- Applied once, in its own transaction. Never edit after it ships.\n\n",
        now.format("%Y-%m-%d %H:%M UTC")
    );
    fs::write(&path, template).with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}

/// Discover the catalog without touching the database
///
/// # Errors
///
/// Returns the discovery error for bad names, duplicates or unreadable files.
pub fn list(migrations_dir: &Path) -> anyhow::Result<Catalog> {
    Ok(discover_migrations(migrations_dir)?)
}

/// Read a lifecycle event from a file, or stdin when `source` is `-`
///
/// # Errors
///
/// Fails when the source cannot be read or is not a lifecycle event.
pub fn read_event(source: &str) -> anyhow::Result<LifecycleEvent> {
    let raw = if source == "-" {
        let mut buf = String::new();
        std::io::stdin()
            .read_to_string(&mut buf)
            .context("Failed to read lifecycle event from stdin")?;
        buf
    } else {
        fs::read_to_string(source).with_context(|| format!("Failed to read {source}"))?
    };
    parse_event(&raw)
}

/// Parse a lifecycle event
///
/// # Errors
///
/// Fails when the JSON is malformed or lacks a request type.
pub fn parse_event(raw: &str) -> anyhow::Result<LifecycleEvent> {
    serde_json::from_str(raw).context("Invalid lifecycle event")
}

/// Render a lifecycle response as pretty JSON
///
/// # Errors
///
/// Only fails if serialization fails.
pub fn render_response(response: &LifecycleResponse) -> anyhow::Result<String> {
    Ok(serde_json::to_string_pretty(response)?)
}

pub fn print_catalog(catalog: &Catalog) {
    println!("\n{} ({})\n", "Migrations".bold(), catalog.len());
    for file in catalog {
        println!(
            "  {}  {:<12} {}",
            file.timestamp().format("%Y-%m-%d %H:%M"),
            file.service().cyan(),
            file.description()
        );
    }
}

pub fn print_run_result(result: &RunResult) {
    if result.paused {
        println!("{}", "Migrations are paused; nothing was applied".yellow());
        return;
    }
    for name in &result.applied {
        println!("  {} {name}", "applied".green());
    }
    println!(
        "\n{} applied, {} already up to date{}",
        result.applied.len(),
        result.skipped.len(),
        result
            .batch_id
            .as_deref()
            .map(|b| format!(" (batch {b})"))
            .unwrap_or_default()
    );
}

pub fn print_status(status: &MigrationStatus) {
    println!("\n{}\n", "Migration Status".bold());

    if status.applied.is_empty() {
        println!("Applied: none");
    } else {
        println!("Applied ({}):", status.applied.len());
        for entry in &status.applied {
            println!(
                "  {} {} ({}, {}ms)",
                "✓".green(),
                entry.name,
                entry.applied_at.format("%Y-%m-%d %H:%M:%S"),
                entry.execution_ms
            );
        }
    }

    println!();
    if status.pending.is_empty() {
        println!("Pending: none");
    } else {
        println!("Pending ({}):", status.pending.len());
        for pending in &status.pending {
            println!("  {} {}", "…".yellow(), pending.name);
        }
    }

    println!(
        "\nSummary: {} applied, {} pending",
        status.applied.len(),
        status.pending.len()
    );
}

pub fn print_drift(report: &DriftReport) {
    for name in &report.missing {
        println!("  {} {name}", "missing   ".red());
    }
    for mismatch in &report.mismatched {
        println!(
            "  {} {} (ledger {}, file {})",
            "mismatched".red(),
            mismatch.name,
            mismatch.expected,
            mismatch.actual
        );
    }
    for name in &report.unexpected {
        println!("  {} {name}", "unexpected".red());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::TempDir;

    #[test]
    fn test_create_migration_rejects_existing_file() {
        let dir = TempDir::new().unwrap();
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 9, 30, 0).unwrap();
        create_migration(dir.path(), "cards", "add-notes", now).unwrap();
        assert!(create_migration(dir.path(), "cards", "add-notes", now).is_err());
    }

    #[test]
    fn test_parse_event_requires_request_type() {
        assert!(parse_event(r#"{"physicalResourceId":"x"}"#).is_err());
        assert!(parse_event(r#"{"RequestType":"Update"}"#).is_ok());
    }
}
