//! Migration file discovery and parsing

use crate::migration::checksum::calculate_checksum;
use crate::MigrateError;
use chrono::{DateTime, NaiveDateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

/// Layout of the timestamp prefix (minute resolution, UTC)
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H%M";

static FILE_NAME_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^(\d{4}-\d{2}-\d{2}T\d{4})__([a-z0-9-]+)__([a-z0-9-]+)\.sql$")
        .expect("migration file name pattern is valid")
});

static TOKEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9-]+$").expect("token pattern is valid"));

/// A discovered, immutable migration file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MigrationFile {
    /// File name, also the sort key (`TIMESTAMP__service__description.sql`)
    pub name: String,

    /// Full file contents, executed verbatim
    pub sql: String,

    /// SHA-256 checksum of the raw file bytes
    pub checksum: String,

    /// Where the file was found
    pub path: PathBuf,
}

impl MigrationFile {
    /// Build a migration from in-memory contents
    ///
    /// The name is validated against the naming grammar and the checksum is
    /// computed from `sql`.
    ///
    /// # Errors
    ///
    /// Returns `MigrateError::InvalidFileName` if `name` does not conform.
    pub fn new(
        name: impl Into<String>,
        sql: impl Into<String>,
        path: impl Into<PathBuf>,
    ) -> Result<Self, MigrateError> {
        let name = name.into();
        let path = path.into();
        if !is_valid_name(&name) {
            return Err(MigrateError::InvalidFileName { name, path });
        }
        let sql = sql.into();
        let checksum = calculate_checksum(sql.as_bytes());
        Ok(Self {
            name,
            sql,
            checksum,
            path,
        })
    }

    /// Read and validate a migration file from disk
    ///
    /// # Errors
    ///
    /// Returns an error if the name does not conform, the file cannot be read,
    /// or its contents are not valid UTF-8.
    pub fn from_path(path: &Path) -> Result<Self, MigrateError> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();

        if !is_valid_name(&name) {
            return Err(MigrateError::InvalidFileName {
                name,
                path: path.to_path_buf(),
            });
        }

        let bytes = fs::read(path).map_err(|source| MigrateError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        // Hash the bytes as read, before any decoding
        let checksum = calculate_checksum(&bytes);
        let sql = String::from_utf8(bytes).map_err(|e| MigrateError::Io {
            path: path.to_path_buf(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
        })?;

        Ok(Self {
            name,
            sql,
            checksum,
            path: path.to_path_buf(),
        })
    }

    /// Timestamp encoded in the name prefix
    #[must_use]
    pub fn timestamp(&self) -> DateTime<Utc> {
        // The name was validated on construction
        parse_timestamp(&self.name[..15]).unwrap_or_default()
    }

    /// Owning service token
    #[must_use]
    pub fn service(&self) -> &str {
        self.name.split("__").nth(1).unwrap_or_default()
    }

    /// Description token (without the `.sql` extension)
    #[must_use]
    pub fn description(&self) -> &str {
        self.name
            .split("__")
            .nth(2)
            .and_then(|d| d.strip_suffix(".sql"))
            .unwrap_or_default()
    }

    /// Build a conforming file name for a new migration
    ///
    /// # Errors
    ///
    /// Returns `MigrateError::Config` if `service` or `description` contain
    /// anything other than lowercase letters, digits and hyphens.
    pub fn new_file_name(
        now: DateTime<Utc>,
        service: &str,
        description: &str,
    ) -> Result<String, MigrateError> {
        for (label, token) in [("service", service), ("description", description)] {
            if !TOKEN_RE.is_match(token) {
                return Err(MigrateError::Config(format!(
                    "{label} '{token}' must contain only lowercase letters, digits and '-'"
                )));
            }
        }
        Ok(format!(
            "{}__{service}__{description}.sql",
            now.format(TIMESTAMP_FORMAT)
        ))
    }
}

/// Check a file name against the naming grammar, including calendar validity
#[must_use]
pub fn is_valid_name(name: &str) -> bool {
    FILE_NAME_RE
        .captures(name)
        .and_then(|caps| caps.get(1))
        .is_some_and(|stamp| parse_timestamp(stamp.as_str()).is_some())
}

fn parse_timestamp(stamp: &str) -> Option<DateTime<Utc>> {
    NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| naive.and_utc())
}

/// An ordered, de-duplicated set of migrations
///
/// Lexicographic order on the name is the sole ordering authority; the fixed
/// width timestamp prefix makes it chronological.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Catalog {
    files: Vec<MigrationFile>,
}

impl Catalog {
    /// Validate and order an arbitrary list of migrations
    ///
    /// # Errors
    ///
    /// Returns `MigrateError::DuplicateName` if two files share a name.
    pub fn new(mut files: Vec<MigrationFile>) -> Result<Self, MigrateError> {
        let mut seen: HashMap<&str, &Path> = HashMap::with_capacity(files.len());
        for file in &files {
            if let Some(first) = seen.insert(&file.name, &file.path) {
                return Err(MigrateError::DuplicateName {
                    name: file.name.clone(),
                    first: first.to_path_buf(),
                    second: file.path.clone(),
                });
            }
        }

        files.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(Self { files })
    }

    #[must_use]
    pub fn files(&self) -> &[MigrationFile] {
        &self.files
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.files.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&MigrationFile> {
        self.files
            .binary_search_by(|f| f.name.as_str().cmp(name))
            .ok()
            .map(|i| &self.files[i])
    }

    pub fn iter(&self) -> std::slice::Iter<'_, MigrationFile> {
        self.files.iter()
    }
}

impl<'a> IntoIterator for &'a Catalog {
    type Item = &'a MigrationFile;
    type IntoIter = std::slice::Iter<'a, MigrationFile>;

    fn into_iter(self) -> Self::IntoIter {
        self.files.iter()
    }
}

/// Discover all migration files under a directory
///
/// Walks the directory recursively so each service may keep its migrations in
/// its own subdirectory. Only `.sql` files are considered; every one of them
/// must follow the naming grammar.
///
/// A missing directory yields an empty catalog.
///
/// # Errors
///
/// Returns errors if:
/// - The path exists but is not a directory
/// - A `.sql` file has a non-conforming name
/// - Two files share a name
/// - A file cannot be read
pub fn discover_migrations(migrations_dir: &Path) -> Result<Catalog, MigrateError> {
    if !migrations_dir.exists() {
        log::debug!(
            "Migrations directory {} does not exist, nothing to discover",
            migrations_dir.display()
        );
        return Ok(Catalog::default());
    }

    if !migrations_dir.is_dir() {
        return Err(MigrateError::Config(format!(
            "Migrations path is not a directory: {}",
            migrations_dir.display()
        )));
    }

    let mut files = Vec::new();
    collect_sql_files(migrations_dir, &mut HashSet::new(), &mut files)?;
    let catalog = Catalog::new(files)?;

    log::debug!(
        "Discovered {} migration(s) in {}",
        catalog.len(),
        migrations_dir.display()
    );
    Ok(catalog)
}

/// Walk `dir`, following symlinks but entering each real directory once
fn collect_sql_files(
    dir: &Path,
    visited: &mut HashSet<PathBuf>,
    files: &mut Vec<MigrationFile>,
) -> Result<(), MigrateError> {
    let canonical = fs::canonicalize(dir).map_err(|source| MigrateError::Io {
        path: dir.to_path_buf(),
        source,
    })?;
    if !visited.insert(canonical) {
        log::debug!("Skipping {}, already visited", dir.display());
        return Ok(());
    }

    let entries = fs::read_dir(dir).map_err(|source| MigrateError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut paths = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|source| MigrateError::Io {
            path: dir.to_path_buf(),
            source,
        })?;
        paths.push(entry.path());
    }
    // Stable traversal so duplicate reports are reproducible
    paths.sort();

    for path in paths {
        if path.is_dir() {
            collect_sql_files(&path, visited, files)?;
        } else if path.extension().and_then(|s| s.to_str()) == Some("sql") {
            files.push(MigrationFile::from_path(&path)?);
        }
    }
    Ok(())
}
