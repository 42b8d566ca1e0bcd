//! Session-scoped advisory locking
//!
//! Every apply run holds a `PostgreSQL` advisory lock for its whole duration,
//! serializing parallel deploys, retried lifecycle invocations and manual
//! re-runs. The lock belongs to the database session, so a crashed or
//! timed-out run releases it when its connection closes.

use crate::migration::MigrationSession;
use crate::SessionError;
use std::fmt;

/// Default advisory lock key
pub const DEFAULT_LOCK_PARTITION: i32 = 7_311_027;
pub const DEFAULT_LOCK_TOKEN: i32 = 1;

/// Two-integer advisory lock key `(partition, token)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockKey {
    pub partition: i32,
    pub token: i32,
}

impl LockKey {
    #[must_use]
    pub const fn new(partition: i32, token: i32) -> Self {
        Self { partition, token }
    }
}

impl Default for LockKey {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_PARTITION, DEFAULT_LOCK_TOKEN)
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.partition, self.token)
    }
}

/// Lock guard that releases the advisory lock when dropped
///
/// Release failures are logged and never escalated: the lock is session-scoped
/// and clears when the connection closes anyway.
pub struct MigrationLockGuard<'a> {
    session: &'a dyn MigrationSession,
    key: LockKey,
    released: bool,
}

impl<'a> MigrationLockGuard<'a> {
    /// Block until the lock is held
    ///
    /// # Errors
    ///
    /// Returns the session error if the lock query itself fails.
    pub fn acquire(session: &'a dyn MigrationSession, key: LockKey) -> Result<Self, SessionError> {
        log::debug!("Waiting for migration lock {key}");
        session.advisory_lock(key)?;
        log::debug!("Acquired migration lock {key}");
        Ok(Self {
            session,
            key,
            released: false,
        })
    }

    /// Take the lock without waiting; `None` when another session holds it
    ///
    /// # Errors
    ///
    /// Returns the session error if the lock query itself fails.
    pub fn try_acquire(
        session: &'a dyn MigrationSession,
        key: LockKey,
    ) -> Result<Option<Self>, SessionError> {
        if session.try_advisory_lock(key)? {
            log::debug!("Acquired migration lock {key}");
            Ok(Some(Self {
                session,
                key,
                released: false,
            }))
        } else {
            Ok(None)
        }
    }

    /// Release now instead of at drop
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        match self.session.advisory_unlock(self.key) {
            Ok(true) => log::debug!("Released migration lock {}", self.key),
            Ok(false) => log::warn!(
                "Migration lock {} was not held by this session at release",
                self.key
            ),
            Err(e) => log::warn!(
                "Failed to release migration lock {}: {e}; it clears when the session closes",
                self.key
            ),
        }
    }
}

impl Drop for MigrationLockGuard<'_> {
    fn drop(&mut self) {
        self.release_inner();
    }
}
