//! In-memory fakes for the orchestrator's collaborators
//!
//! Available to unit tests and, through the `test-helpers` feature, to the
//! integration test crate.

use crate::alarm::{AlarmError, AlarmMessage, AlarmPublisher};
use crate::connection::{ConnectionTarget, Connector, PoolHealthProbe, ProbeError};
use crate::migration::{LedgerEntry, LedgerTable, LockKey, MigrationSession, NewLedgerEntry};
use crate::secrets::{SecretError, SecretStore};
use crate::SessionError;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

/// A session operation as observed by [`MemorySession`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Ping,
    CreateLedger,
    LoadLedger,
    Lock(LockKey),
    TryLock(LockKey),
    Unlock(LockKey),
    Begin,
    Script(String),
    /// Ledger insert, by migration name
    Insert(String),
    Commit,
    Rollback,
    Close,
}

#[derive(Default)]
struct SessionState {
    calls: Vec<Call>,
    ledger: BTreeMap<String, LedgerEntry>,
    staged: Vec<LedgerEntry>,
    in_transaction: bool,
    held: HashSet<LockKey>,
    held_elsewhere: bool,
    fail_ping: bool,
    fail_unlock: bool,
    fail_ledger_creations: usize,
    fail_scripts: Vec<String>,
    fail_inserts: Vec<String>,
}

/// In-memory database session
///
/// Clones share state, so a test can keep a handle while a boxed clone is
/// handed to the code under test. Ledger inserts made inside a transaction
/// become visible on commit and are discarded on rollback.
#[derive(Clone, Default)]
pub struct MemorySession {
    state: Arc<Mutex<SessionState>>,
}

impl MemorySession {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap()
    }

    fn record(&self, call: Call) -> MutexGuard<'_, SessionState> {
        let mut state = self.state();
        state.calls.push(call);
        state
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state().calls.clone()
    }

    pub fn count(&self, predicate: impl Fn(&Call) -> bool) -> usize {
        self.state().calls.iter().filter(|c| predicate(c)).count()
    }

    /// Committed ledger rows keyed by name
    pub fn ledger(&self) -> BTreeMap<String, LedgerEntry> {
        self.state().ledger.clone()
    }

    /// Insert a committed ledger row without recording a call
    pub fn seed_entry(&self, name: &str, checksum: &str) {
        self.state().ledger.insert(
            name.to_string(),
            LedgerEntry {
                name: name.to_string(),
                checksum: checksum.to_string(),
                applied_at: Utc::now(),
                execution_ms: 0,
                batch_id: None,
                app_version: None,
            },
        );
    }

    /// Make the advisory lock appear held by another session
    pub fn hold_lock_elsewhere(&self) {
        self.state().held_elsewhere = true;
    }

    pub fn fail_ping(&self) {
        self.state().fail_ping = true;
    }

    /// Fail the next `times` ledger creations, as a concurrent first deploy can
    pub fn fail_ledger_creation(&self, times: usize) {
        self.state().fail_ledger_creations = times;
    }

    pub fn fail_unlock(&self) {
        self.state().fail_unlock = true;
    }

    /// Fail any script containing `fragment`
    pub fn fail_script_containing(&self, fragment: &str) {
        self.state().fail_scripts.push(fragment.to_string());
    }

    /// Fail the ledger insert for migration `name`
    pub fn fail_insert_for(&self, name: &str) {
        self.state().fail_inserts.push(name.to_string());
    }
}

impl MigrationSession for MemorySession {
    fn ping(&self) -> Result<(), SessionError> {
        let state = self.record(Call::Ping);
        if state.fail_ping {
            return Err(SessionError::Other("server closed the connection".to_string()));
        }
        Ok(())
    }

    fn create_ledger(&self, _table: &LedgerTable) -> Result<(), SessionError> {
        let mut state = self.record(Call::CreateLedger);
        if state.fail_ledger_creations > 0 {
            state.fail_ledger_creations -= 1;
            return Err(SessionError::Other(
                "duplicate key value violates unique constraint \"pg_type_typname_nsp_index\"".to_string(),
            ));
        }
        Ok(())
    }

    fn ledger_entries(&self, _table: &LedgerTable) -> Result<Vec<LedgerEntry>, SessionError> {
        let state = self.record(Call::LoadLedger);
        Ok(state.ledger.values().cloned().collect())
    }

    fn advisory_lock(&self, key: LockKey) -> Result<(), SessionError> {
        let mut state = self.record(Call::Lock(key));
        if state.held_elsewhere {
            return Err(SessionError::Other(format!("lock {key} is held by another session")));
        }
        state.held.insert(key);
        Ok(())
    }

    fn try_advisory_lock(&self, key: LockKey) -> Result<bool, SessionError> {
        let mut state = self.record(Call::TryLock(key));
        if state.held_elsewhere {
            return Ok(false);
        }
        state.held.insert(key);
        Ok(true)
    }

    fn advisory_unlock(&self, key: LockKey) -> Result<bool, SessionError> {
        let mut state = self.record(Call::Unlock(key));
        if state.fail_unlock {
            return Err(SessionError::Other("connection reset".to_string()));
        }
        Ok(state.held.remove(&key))
    }

    fn begin(&self) -> Result<(), SessionError> {
        let mut state = self.record(Call::Begin);
        state.in_transaction = true;
        state.staged.clear();
        Ok(())
    }

    fn run_script(&self, sql: &str) -> Result<(), SessionError> {
        let state = self.record(Call::Script(sql.to_string()));
        if let Some(fragment) = state.fail_scripts.iter().find(|f| sql.contains(f.as_str())) {
            return Err(SessionError::Other(format!("syntax error near \"{fragment}\"")));
        }
        Ok(())
    }

    fn insert_entry(&self, _table: &LedgerTable, entry: &NewLedgerEntry) -> Result<(), SessionError> {
        let mut state = self.record(Call::Insert(entry.name.clone()));
        if state.fail_inserts.contains(&entry.name) {
            return Err(SessionError::Other(format!("insert of {} failed", entry.name)));
        }
        let duplicate = state.ledger.contains_key(&entry.name)
            || state.staged.iter().any(|e| e.name == entry.name);
        if duplicate {
            return Err(SessionError::Other(format!(
                "duplicate key value violates unique constraint: {}",
                entry.name
            )));
        }

        let row = LedgerEntry {
            name: entry.name.clone(),
            checksum: entry.checksum.clone(),
            applied_at: Utc::now(),
            execution_ms: entry.execution_ms,
            batch_id: entry.batch_id.clone(),
            app_version: entry.app_version.clone(),
        };
        if state.in_transaction {
            state.staged.push(row);
        } else {
            state.ledger.insert(row.name.clone(), row);
        }
        Ok(())
    }

    fn commit(&self) -> Result<(), SessionError> {
        let mut state = self.record(Call::Commit);
        let staged = std::mem::take(&mut state.staged);
        for row in staged {
            state.ledger.insert(row.name.clone(), row);
        }
        state.in_transaction = false;
        Ok(())
    }

    fn rollback(&self) -> Result<(), SessionError> {
        let mut state = self.record(Call::Rollback);
        state.staged.clear();
        state.in_transaction = false;
        Ok(())
    }

    fn close(self: Box<Self>) {
        let mut state = self.record(Call::Close);
        state.held.clear();
        state.staged.clear();
        state.in_transaction = false;
    }
}

#[derive(Default)]
struct ConnectorState {
    attempts: HashMap<String, usize>,
    failures: HashMap<String, usize>,
    sessions: HashMap<String, MemorySession>,
    plaintext_only: bool,
}

/// Connector that hands out [`MemorySession`]s by host
///
/// Hosts without a served session refuse every connection.
#[derive(Clone, Default)]
pub struct FakeConnector {
    state: Arc<Mutex<ConnectorState>>,
}

impl FakeConnector {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve clones of `session` for `host`
    pub fn serve(&self, host: &str, session: MemorySession) {
        self.state.lock().unwrap().sessions.insert(host.to_string(), session);
    }

    /// Refuse the next `times` connections to `host`
    pub fn fail_times(&self, host: &str, times: usize) {
        self.state.lock().unwrap().failures.insert(host.to_string(), times);
    }

    /// Behave like a driver without TLS support
    pub fn plaintext_only(&self) {
        self.state.lock().unwrap().plaintext_only = true;
    }

    pub fn attempts(&self, host: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .attempts
            .get(host)
            .copied()
            .unwrap_or(0)
    }
}

impl Connector for FakeConnector {
    fn connect(&self, target: &ConnectionTarget) -> Result<Box<dyn MigrationSession>, SessionError> {
        let mut state = self.state.lock().unwrap();
        *state.attempts.entry(target.host.clone()).or_default() += 1;

        if let Some(remaining) = state.failures.get_mut(&target.host) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(SessionError::Other(format!("{}: connection refused", target.host)));
            }
        }

        match state.sessions.get(&target.host) {
            Some(session) => Ok(Box::new(session.clone())),
            None => Err(SessionError::Other(format!("{}: connection refused", target.host))),
        }
    }

    fn supports_tls(&self) -> bool {
        !self.state.lock().unwrap().plaintext_only
    }
}

/// Alarm publisher that keeps every alarm it receives
#[derive(Clone, Default)]
pub struct RecordingAlarms {
    published: Arc<Mutex<Vec<AlarmMessage>>>,
    fail: Arc<Mutex<bool>>,
}

impl RecordingAlarms {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<AlarmMessage> {
        self.published.lock().unwrap().clone()
    }

    /// Reject every subsequent alarm
    pub fn fail_deliveries(&self) {
        *self.fail.lock().unwrap() = true;
    }
}

impl AlarmPublisher for RecordingAlarms {
    fn publish(&self, alarm: &AlarmMessage) -> Result<(), AlarmError> {
        if *self.fail.lock().unwrap() {
            return Err(AlarmError::Delivery("webhook unreachable".to_string()));
        }
        self.published.lock().unwrap().push(alarm.clone());
        Ok(())
    }
}

/// Secret store with a fixed set of payloads
#[derive(Clone, Default)]
pub struct StaticSecretStore {
    secrets: HashMap<String, String>,
}

impl StaticSecretStore {
    /// A store that fails every fetch
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn new(reference: &str, payload: &str) -> Self {
        let mut secrets = HashMap::new();
        secrets.insert(reference.to_string(), payload.to_string());
        Self { secrets }
    }
}

impl SecretStore for StaticSecretStore {
    fn fetch(&self, reference: &str) -> Result<String, SecretError> {
        self.secrets
            .get(reference)
            .cloned()
            .ok_or_else(|| SecretError::Unsupported(reference.to_string()))
    }
}

/// Pool-health probe replaying scripted responses, then reporting no targets
#[derive(Default)]
pub struct ScriptedPoolHealth {
    responses: Mutex<VecDeque<Result<Vec<String>, ProbeError>>>,
    calls: Mutex<usize>,
}

impl ScriptedPoolHealth {
    #[must_use]
    pub fn new(responses: Vec<Result<Vec<String>, ProbeError>>) -> Self {
        Self {
            responses: Mutex::new(responses.into()),
            calls: Mutex::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        *self.calls.lock().unwrap()
    }
}

impl PoolHealthProbe for ScriptedPoolHealth {
    fn target_states(&self, _pool: &str) -> Result<Vec<String>, ProbeError> {
        *self.calls.lock().unwrap() += 1;
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }
}
