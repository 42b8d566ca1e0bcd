//! Backend-target health of a fronting connection pool

use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

/// State string reported for a backend target that accepts connections
pub const AVAILABLE: &str = "AVAILABLE";

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("pool health request failed: {0}")]
    Request(String),
    #[error("pool health response could not be decoded: {0}")]
    Decode(String),
}

/// Reports the health state of each backend target behind a pool
pub trait PoolHealthProbe {
    fn target_states(&self, pool: &str) -> Result<Vec<String>, ProbeError>;
}

/// True when at least one backend target is available
#[must_use]
pub fn any_available(states: &[String]) -> bool {
    states.iter().any(|s| s.eq_ignore_ascii_case(AVAILABLE))
}

#[derive(Debug, Deserialize)]
struct TargetHealth {
    state: String,
}

/// Probe that GETs `{url}?pool=<identity>` and expects a JSON list of
/// `{ "state": "..." }` objects
pub struct HttpPoolHealthProbe {
    url: String,
    agent: ureq::Agent,
}

impl HttpPoolHealthProbe {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            agent: ureq::AgentBuilder::new()
                .timeout(Duration::from_secs(5))
                .build(),
        }
    }
}

impl PoolHealthProbe for HttpPoolHealthProbe {
    fn target_states(&self, pool: &str) -> Result<Vec<String>, ProbeError> {
        let targets: Vec<TargetHealth> = self
            .agent
            .get(&self.url)
            .query("pool", pool)
            .call()
            .map_err(|e| ProbeError::Request(e.to_string()))?
            .into_json()
            .map_err(|e| ProbeError::Decode(e.to_string()))?;
        Ok(targets.into_iter().map(|t| t.state).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_any_available() {
        assert!(any_available(&["UNAVAILABLE".into(), "available".into()]));
        assert!(!any_available(&["PENDING_PROXY_CAPACITY".into()]));
        assert!(!any_available(&[]));
    }

    #[test]
    fn test_decode_target_list() {
        let targets: Vec<TargetHealth> =
            serde_json::from_str(r#"[{"state":"AVAILABLE","endpoint":"db-1"},{"state":"UNAVAILABLE"}]"#)
                .unwrap();
        assert_eq!(targets.len(), 2);
        assert_eq!(targets[0].state, AVAILABLE);
    }
}
