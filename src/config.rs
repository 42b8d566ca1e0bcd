//! Settings for the orchestrator
//!
//! [`Settings::load`] reads `config/schemawarden.toml` (optional) and then
//! `SCHEMAWARDEN_*` environment variables, e.g. `SCHEMAWARDEN_DB_HOST` or
//! `SCHEMAWARDEN_PROXY_ENDPOINT`.

use crate::connection::{PoolHealthPolicy, RetryPolicy};
use crate::migration::{Ledger, LedgerTable, LockKey};
use crate::MigrateError;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

pub const CONFIG_FILE: &str = "config/schemawarden.toml";
pub const ENV_PREFIX: &str = "SCHEMAWARDEN";

#[derive(Clone, Deserialize)]
pub struct Settings {
    #[serde(default = "default_migrations_dir")]
    pub migrations_dir: PathBuf,

    // Explicit connection values; each wins over the secret's field
    #[serde(default)]
    pub db_host: Option<String>,
    #[serde(default)]
    pub db_port: Option<u16>,
    #[serde(default)]
    pub db_user: Option<String>,
    #[serde(default)]
    pub db_password: Option<String>,
    #[serde(default)]
    pub db_name: Option<String>,
    /// Secret store reference holding JSON credentials
    #[serde(default)]
    pub db_secret_ref: Option<String>,

    /// Connection pool (proxy) endpoint host
    #[serde(default)]
    pub proxy_endpoint: Option<String>,
    /// Pool identity used for backend-target health polling
    #[serde(default)]
    pub proxy_name: Option<String>,
    /// Transport security override
    #[serde(default)]
    pub db_ssl: Option<bool>,

    #[serde(default = "default_connect_max_attempts")]
    pub connect_max_attempts: u32,
    #[serde(default = "default_connect_base_delay_ms")]
    pub connect_base_delay_ms: u64,
    #[serde(default = "default_connect_max_delay_ms")]
    pub connect_max_delay_ms: u64,
    #[serde(default = "default_connect_jitter_ms")]
    pub connect_jitter_ms: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_pool_health_attempts")]
    pub pool_health_attempts: u32,
    #[serde(default = "default_pool_health_interval_ms")]
    pub pool_health_interval_ms: u64,
    #[serde(default)]
    pub pool_health_url: Option<String>,

    #[serde(default = "default_ledger_table")]
    pub ledger_table: String,
    #[serde(default = "default_lock_partition")]
    pub lock_partition: i32,
    #[serde(default = "default_lock_token")]
    pub lock_token: i32,

    #[serde(default)]
    pub app_version: Option<String>,
    #[serde(default)]
    pub batch_id: Option<String>,
    /// Process-wide pause override
    #[serde(default)]
    pub pause: bool,
    #[serde(default)]
    pub alarm_webhook_url: Option<String>,
}

fn default_migrations_dir() -> PathBuf {
    PathBuf::from("migrations")
}

fn default_connect_max_attempts() -> u32 {
    12
}

fn default_connect_base_delay_ms() -> u64 {
    10_000
}

fn default_connect_max_delay_ms() -> u64 {
    120_000
}

fn default_connect_jitter_ms() -> u64 {
    1_000
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_pool_health_attempts() -> u32 {
    60
}

fn default_pool_health_interval_ms() -> u64 {
    10_000
}

fn default_ledger_table() -> String {
    crate::migration::state_table::DEFAULT_LEDGER_TABLE.to_string()
}

fn default_lock_partition() -> i32 {
    crate::migration::lock::DEFAULT_LOCK_PARTITION
}

fn default_lock_token() -> i32 {
    crate::migration::lock::DEFAULT_LOCK_TOKEN
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            migrations_dir: default_migrations_dir(),
            db_host: None,
            db_port: None,
            db_user: None,
            db_password: None,
            db_name: None,
            db_secret_ref: None,
            proxy_endpoint: None,
            proxy_name: None,
            db_ssl: None,
            connect_max_attempts: default_connect_max_attempts(),
            connect_base_delay_ms: default_connect_base_delay_ms(),
            connect_max_delay_ms: default_connect_max_delay_ms(),
            connect_jitter_ms: default_connect_jitter_ms(),
            connect_timeout_secs: default_connect_timeout_secs(),
            pool_health_attempts: default_pool_health_attempts(),
            pool_health_interval_ms: default_pool_health_interval_ms(),
            pool_health_url: None,
            ledger_table: default_ledger_table(),
            lock_partition: default_lock_partition(),
            lock_token: default_lock_token(),
            app_version: None,
            batch_id: None,
            pause: false,
            alarm_webhook_url: None,
        }
    }
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("migrations_dir", &self.migrations_dir)
            .field("db_host", &self.db_host)
            .field("db_port", &self.db_port)
            .field("db_user", &self.db_user)
            .field("db_password", &self.db_password.as_ref().map(|_| "<redacted>"))
            .field("db_name", &self.db_name)
            .field("db_secret_ref", &self.db_secret_ref)
            .field("proxy_endpoint", &self.proxy_endpoint)
            .field("proxy_name", &self.proxy_name)
            .field("db_ssl", &self.db_ssl)
            .field("ledger_table", &self.ledger_table)
            .field("lock_partition", &self.lock_partition)
            .field("lock_token", &self.lock_token)
            .field("pause", &self.pause)
            .finish_non_exhaustive()
    }
}

impl Settings {
    /// Load settings from `config/schemawarden.toml`, overridden by env vars
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a source is malformed or a value has the wrong type.
    pub fn load() -> Result<Self, ConfigError> {
        let builder = Config::builder().add_source(File::with_name(CONFIG_FILE).required(false));

        let settings = match builder.add_source(env_source(None)).build() {
            Ok(cfg) => cfg,
            Err(err) => {
                if std::path::Path::new(CONFIG_FILE).exists() {
                    log::warn!("Failed to load {CONFIG_FILE}, falling back to env: {err}");
                }
                Config::builder()
                    .add_source(env_source(None))
                    .build()
                    .map_err(|env_err| {
                        ConfigError::Message(format!(
                            "Failed to load configuration from file and env: {err}, then env-only error: {env_err}"
                        ))
                    })?
            }
        };

        settings.try_deserialize()
    }

    /// Load settings from an explicit variable map instead of the process environment
    ///
    /// Keys use the same `SCHEMAWARDEN_*` names as the environment.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a value has the wrong type.
    pub fn from_env_map(vars: config::Map<String, String>) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(env_source(Some(vars)))
            .build()?
            .try_deserialize()
    }

    /// Connection retry tuning
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.connect_max_attempts.max(1),
            base_delay: Duration::from_millis(self.connect_base_delay_ms),
            max_delay: Duration::from_millis(self.connect_max_delay_ms),
            max_jitter: Duration::from_millis(self.connect_jitter_ms),
        }
    }

    /// Pool-health polling tuning
    #[must_use]
    pub fn pool_health_policy(&self) -> PoolHealthPolicy {
        PoolHealthPolicy {
            attempts: self.pool_health_attempts,
            interval: Duration::from_millis(self.pool_health_interval_ms),
        }
    }

    /// Ledger table and lock key
    ///
    /// # Errors
    ///
    /// Returns `MigrateError::Config` if the table name is not an identifier.
    pub fn ledger(&self) -> Result<Ledger, MigrateError> {
        Ok(Ledger::new(
            LedgerTable::new(self.ledger_table.clone())?,
            LockKey::new(self.lock_partition, self.lock_token),
        ))
    }
}

fn env_source(vars: Option<config::Map<String, String>>) -> Environment {
    Environment::with_prefix(ENV_PREFIX).source(vars)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> config::Map<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::from_env_map(vars(&[])).unwrap();
        assert_eq!(settings.migrations_dir, PathBuf::from("migrations"));
        assert_eq!(settings.connect_max_attempts, 12);
        assert_eq!(settings.pool_health_attempts, 60);
        assert_eq!(settings.ledger_table, "schema_migrations");
        assert!(!settings.pause);

        let retry = settings.retry_policy();
        assert_eq!(retry.base_delay, Duration::from_secs(10));
        assert_eq!(retry.max_delay, Duration::from_secs(120));
        assert_eq!(retry.max_jitter, Duration::from_secs(1));
    }

    #[test]
    fn test_env_overrides() {
        let settings = Settings::from_env_map(vars(&[
            ("SCHEMAWARDEN_DB_HOST", "db.internal"),
            ("SCHEMAWARDEN_DB_PORT", "6432"),
            ("SCHEMAWARDEN_DB_SSL", "false"),
            ("SCHEMAWARDEN_PAUSE", "true"),
            ("SCHEMAWARDEN_LOCK_PARTITION", "42"),
            ("SCHEMAWARDEN_LOCK_TOKEN", "7"),
            ("SCHEMAWARDEN_LEDGER_TABLE", "ops.ledger"),
            ("SCHEMAWARDEN_CONNECT_MAX_ATTEMPTS", "3"),
        ]))
        .unwrap();

        assert_eq!(settings.db_host.as_deref(), Some("db.internal"));
        assert_eq!(settings.db_port, Some(6432));
        assert_eq!(settings.db_ssl, Some(false));
        assert!(settings.pause);
        let ledger = settings.ledger().unwrap();
        assert_eq!(ledger.lock_key(), LockKey::new(42, 7));
        assert_eq!(ledger.table().as_str(), "ops.ledger");
        assert_eq!(settings.retry_policy().max_attempts, 3);
    }

    #[test]
    fn test_env_strings_keep_their_text() {
        let settings = Settings::from_env_map(vars(&[
            ("SCHEMAWARDEN_DB_PASSWORD", "007"),
            ("SCHEMAWARDEN_APP_VERSION", "1.10"),
            ("SCHEMAWARDEN_BATCH_ID", "2024.0"),
            ("SCHEMAWARDEN_DB_USER", "1e3"),
        ]))
        .unwrap();

        assert_eq!(settings.db_password.as_deref(), Some("007"));
        assert_eq!(settings.app_version.as_deref(), Some("1.10"));
        assert_eq!(settings.batch_id.as_deref(), Some("2024.0"));
        assert_eq!(settings.db_user.as_deref(), Some("1e3"));
    }

    #[test]
    fn test_bad_ledger_table_is_config_error() {
        let settings = Settings {
            ledger_table: "x; drop table y".to_string(),
            ..Settings::default()
        };
        assert!(matches!(settings.ledger(), Err(MigrateError::Config(_))));
    }

    #[test]
    fn test_debug_redacts_password() {
        let settings = Settings {
            db_password: Some("hunter2".to_string()),
            ..Settings::default()
        };
        let rendered = format!("{settings:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }
}
