//! Connection establishment with bounded retry, pool-health wait and fallback

use crate::connection::pool_health::{any_available, PoolHealthProbe};
use crate::connection::{ConnectionTarget, ResolvedConnection};
use crate::migration::MigrationSession;
use crate::{MigrateError, SessionError};
use rand::Rng;
use std::time::Duration;

/// Opens sessions to a target
pub trait Connector {
    fn connect(&self, target: &ConnectionTarget) -> Result<Box<dyn MigrationSession>, SessionError>;

    /// Whether sessions can be encrypted
    ///
    /// Targets with `tls` set are refused up front by connectors that return false.
    fn supports_tls(&self) -> bool {
        true
    }
}

/// Exponential backoff with jitter for connection attempts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Upper bound of the random delay added to every backoff
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 12,
            base_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(120),
            max_jitter: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Backoff after failed attempt `attempt` (1-based), before jitter
    #[must_use]
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        self.base_delay
            .checked_mul(1_u32 << shift)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    fn delay_with_jitter(&self, attempt: u32) -> Duration {
        let jitter_ms = u64::try_from(self.max_jitter.as_millis()).unwrap_or(u64::MAX);
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=jitter_ms)
        };
        self.backoff(attempt) + Duration::from_millis(jitter)
    }
}

/// Bounded polling of a pool's backend-target health
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolHealthPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for PoolHealthPolicy {
    fn default() -> Self {
        Self {
            attempts: 60,
            interval: Duration::from_secs(10),
        }
    }
}

/// Opens the session a run will use
pub struct Establisher<'a> {
    connector: &'a dyn Connector,
    pool_health: Option<&'a dyn PoolHealthProbe>,
    retry: RetryPolicy,
    pool_policy: PoolHealthPolicy,
}

impl<'a> Establisher<'a> {
    #[must_use]
    pub fn new(connector: &'a dyn Connector, retry: RetryPolicy) -> Self {
        Self {
            connector,
            pool_health: None,
            retry,
            pool_policy: PoolHealthPolicy::default(),
        }
    }

    /// Poll pool health before connecting to a proxy target
    #[must_use]
    pub fn with_pool_health(mut self, probe: &'a dyn PoolHealthProbe, policy: PoolHealthPolicy) -> Self {
        self.pool_health = Some(probe);
        self.pool_policy = policy;
        self
    }

    /// Connect to the primary target, falling back once to the direct endpoint
    ///
    /// The primary is never revisited after switching to the fallback.
    ///
    /// # Errors
    ///
    /// Returns `MigrateError::Connection` for the last target tried.
    pub fn establish(
        &self,
        resolved: &ResolvedConnection,
    ) -> Result<Box<dyn MigrationSession>, MigrateError> {
        #[cfg(feature = "tracing")]
        let _span = tracing::info_span!("establish_connection", primary = %resolved.primary.label).entered();

        if let Some(pool) = &resolved.pool_identity {
            self.wait_for_pool(pool);
        }

        match self.connect(&resolved.primary) {
            Ok(session) => Ok(session),
            Err(primary_err) => match &resolved.fallback {
                Some(fallback) => {
                    log::warn!("{primary_err}; falling back to {fallback}");
                    self.connect(fallback)
                }
                None => Err(primary_err),
            },
        }
    }

    /// Connect to one target with bounded retries
    ///
    /// Each opened session is pinged; a session that fails the ping is closed
    /// before the next attempt.
    ///
    /// # Errors
    ///
    /// Returns `MigrateError::Connection` naming the target once every attempt failed.
    /// Returns `MigrateError::Config` without any attempt when the target
    /// requires TLS and the connector cannot provide it.
    pub fn connect(&self, target: &ConnectionTarget) -> Result<Box<dyn MigrationSession>, MigrateError> {
        if target.tls && !self.connector.supports_tls() {
            return Err(MigrateError::Config(format!(
                "{target} requires TLS but the driver only supports unencrypted sessions; \
                 terminate TLS in front of the database and set SCHEMAWARDEN_DB_SSL=false"
            )));
        }

        let max_attempts = self.retry.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = self.connector.connect(target).and_then(|session| {
                match session.ping() {
                    Ok(()) => Ok(session),
                    Err(e) => {
                        session.close();
                        Err(e)
                    }
                }
            });

            match outcome {
                Ok(session) => {
                    log::info!("Connected to {target} on attempt {attempt}");
                    return Ok(session);
                }
                Err(source) if attempt >= max_attempts => {
                    return Err(MigrateError::Connection {
                        label: target.label.clone(),
                        attempts: attempt,
                        source,
                    });
                }
                Err(e) => {
                    let delay = self.retry.delay_with_jitter(attempt);
                    log::warn!(
                        "Connection attempt {attempt}/{max_attempts} to {target} failed: {e}; retrying in {}ms",
                        delay.as_millis()
                    );
                    std::thread::sleep(delay);
                }
            }
        }
    }

    /// Wait for the pool to report an available backend target
    ///
    /// Best effort: a timeout or probe failure is logged and the caller
    /// proceeds. Returns whether an available target was seen.
    pub fn wait_for_pool(&self, pool: &str) -> bool {
        let Some(probe) = self.pool_health else {
            return false;
        };

        for attempt in 1..=self.pool_policy.attempts {
            match probe.target_states(pool) {
                Ok(states) if any_available(&states) => {
                    log::info!("Pool {pool} reports an available target");
                    return true;
                }
                Ok(states) => log::debug!(
                    "Pool {pool} not ready (attempt {attempt}/{}): {states:?}",
                    self.pool_policy.attempts
                ),
                Err(e) => log::debug!(
                    "Pool {pool} health check failed (attempt {attempt}/{}): {e}",
                    self.pool_policy.attempts
                ),
            }
            if attempt < self.pool_policy.attempts {
                std::thread::sleep(self.pool_policy.interval);
            }
        }

        log::warn!(
            "Pool {pool} reported no available targets after {} check(s); connecting anyway",
            self.pool_policy.attempts
        );
        false
    }
}
