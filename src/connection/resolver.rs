//! Connection resolution: settings + secret store → primary and fallback targets

use crate::config::Settings;
use crate::secrets::{SecretError, SecretStore};
use crate::MigrateError;
use serde::Deserialize;
use std::fmt;
use std::net::IpAddr;
use std::time::Duration;

/// Label of a pooling-proxy target
pub const PROXY_LABEL: &str = "proxy";
/// Label of a direct database target
pub const DIRECT_LABEL: &str = "direct";

/// One place to connect to
#[derive(Clone, PartialEq, Eq)]
pub struct ConnectionTarget {
    /// Human-readable name used in logs and errors (`proxy` / `direct`)
    pub label: String,
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub database: String,
    /// Transport encryption required
    pub tls: bool,
    pub connect_timeout: Duration,
}

impl ConnectionTarget {
    /// Key-value connection string understood by `may_postgres`
    ///
    /// Carries no `sslmode`: encryption is decided by the connector, see
    /// [`Connector::supports_tls`](crate::connection::Connector::supports_tls).
    #[must_use]
    pub fn connection_string(&self) -> String {
        format!(
            "host={} port={} user={} password={} dbname={} connect_timeout={}",
            quote(&self.host),
            self.port,
            quote(&self.user),
            quote(&self.password),
            quote(&self.database),
            self.connect_timeout.as_secs().max(1),
        )
    }
}

impl fmt::Debug for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionTarget")
            .field("label", &self.label)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("database", &self.database)
            .field("tls", &self.tls)
            .finish()
    }
}

impl fmt::Display for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{}/{})", self.label, self.host, self.port, self.database)
    }
}

fn quote(value: &str) -> String {
    format!("'{}'", value.replace('\\', "\\\\").replace('\'', "\\'"))
}

/// Where to connect, in order of preference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConnection {
    pub primary: ConnectionTarget,
    /// Direct endpoint tried once if the primary (a proxy) is unreachable
    pub fallback: Option<ConnectionTarget>,
    /// Identity of the fronting pool, when the primary is a proxy
    pub pool_identity: Option<String>,
}

/// Credentials as stored in the secret store
#[derive(Debug, Default, Deserialize)]
struct DatabaseSecret {
    #[serde(default)]
    host: Option<String>,
    #[serde(default)]
    port: Option<SecretPort>,
    #[serde(default, alias = "user")]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    #[serde(default, alias = "database")]
    dbname: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum SecretPort {
    Number(u16),
    Text(String),
}

impl SecretPort {
    fn value(&self) -> Option<u16> {
        match self {
            SecretPort::Number(n) => Some(*n),
            SecretPort::Text(s) => s.trim().parse().ok(),
        }
    }
}

/// Resolve connection targets
///
/// Explicit settings win field by field over the secret; the secret is only
/// fetched when a field is missing and `db_secret_ref` is set.
///
/// # Errors
///
/// - `MigrateError::Secret` if the secret cannot be fetched or parsed
/// - `MigrateError::Config` naming every field that could not be resolved
pub fn resolve(settings: &Settings, secrets: &dyn SecretStore) -> Result<ResolvedConnection, MigrateError> {
    let explicit_complete = settings.db_host.is_some()
        && settings.db_port.is_some()
        && settings.db_user.is_some()
        && settings.db_password.is_some()
        && settings.db_name.is_some();

    let secret = match (&settings.db_secret_ref, explicit_complete) {
        (Some(reference), false) => {
            log::debug!("Fetching database credentials from secret {reference}");
            let raw = secrets.fetch(reference)?;
            serde_json::from_str::<DatabaseSecret>(&raw)
                .map_err(|e| SecretError::Invalid(format!("{reference}: {e}")))?
        }
        _ => DatabaseSecret::default(),
    };

    let direct_host = non_empty(settings.db_host.clone()).or(non_empty(secret.host));
    let proxy_host = non_empty(settings.proxy_endpoint.clone());
    let port = settings
        .db_port
        .or_else(|| secret.port.as_ref().and_then(SecretPort::value));
    let user = non_empty(settings.db_user.clone()).or(non_empty(secret.username));
    let password = settings.db_password.clone().or(secret.password);
    let database = non_empty(settings.db_name.clone()).or(non_empty(secret.dbname));

    let mut missing = Vec::new();
    if direct_host.is_none() && proxy_host.is_none() {
        missing.push("host");
    }
    if port.is_none() {
        missing.push("port");
    }
    if user.is_none() {
        missing.push("user");
    }
    if password.is_none() {
        missing.push("password");
    }
    if database.is_none() {
        missing.push("database name");
    }
    let (port, user, password, database) = match (port, user, password, database) {
        (Some(port), Some(user), Some(password), Some(database)) if missing.is_empty() => {
            (port, user, password, database)
        }
        _ => {
            return Err(MigrateError::Config(format!(
                "Missing database connection settings: {}",
                missing.join(", ")
            )))
        }
    };

    let connect_timeout = Duration::from_secs(settings.connect_timeout_secs);
    let target = |label: &str, host: String| ConnectionTarget {
        label: label.to_string(),
        tls: requires_tls(&host, settings.db_ssl),
        host,
        port,
        user: user.clone(),
        password: password.clone(),
        database: database.clone(),
        connect_timeout,
    };

    let resolved = match proxy_host {
        Some(proxy) => {
            let fallback = direct_host
                .filter(|direct| !direct.eq_ignore_ascii_case(&proxy))
                .map(|direct| target(DIRECT_LABEL, direct));
            let pool_identity = non_empty(settings.proxy_name.clone())
                .or_else(|| proxy.split('.').next().map(str::to_string));
            ResolvedConnection {
                primary: target(PROXY_LABEL, proxy),
                fallback,
                pool_identity,
            }
        }
        None => ResolvedConnection {
            // Checked above: at least one host is present
            primary: target(DIRECT_LABEL, direct_host.unwrap_or_default()),
            fallback: None,
            pool_identity: None,
        },
    };

    log::debug!(
        "Resolved primary {} (tls: {}), fallback: {}",
        resolved.primary,
        resolved.primary.tls,
        resolved
            .fallback
            .as_ref()
            .map_or_else(|| "none".to_string(), ToString::to_string)
    );
    Ok(resolved)
}

/// Transport security is on unless the host is loopback or the override says otherwise
#[must_use]
pub fn requires_tls(host: &str, override_ssl: Option<bool>) -> bool {
    override_ssl.unwrap_or_else(|| !is_loopback(host))
}

fn is_loopback(host: &str) -> bool {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    host.eq_ignore_ascii_case("localhost")
        || host
            .parse::<IpAddr>()
            .map(|ip| ip.is_loopback())
            .unwrap_or(false)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}
