//! Failure alarms
//!
//! A failed lifecycle event is reported to an [`AlarmPublisher`] before the
//! error is surfaced to the caller. Publishing is best effort: a publisher
//! failure is logged and never masks the original error.

use crate::{ErrorKind, MigrateError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

/// Structured alarm payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AlarmMessage {
    pub message: String,
    /// Error source chain, outermost cause first
    pub stack: Vec<String>,
    pub kind: ErrorKind,
    pub version: Option<String>,
    pub batch_id: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl AlarmMessage {
    #[must_use]
    pub fn from_error(error: &MigrateError, version: Option<String>, batch_id: Option<String>) -> Self {
        let mut stack = Vec::new();
        let mut source = std::error::Error::source(error);
        while let Some(cause) = source {
            stack.push(cause.to_string());
            source = cause.source();
        }

        Self {
            message: error.to_string(),
            stack,
            kind: error.kind(),
            version,
            batch_id,
            occurred_at: Utc::now(),
        }
    }
}

#[derive(Debug, Error)]
pub enum AlarmError {
    #[error("Alarm could not be serialized: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("Alarm delivery failed: {0}")]
    Delivery(String),
}

/// Destination for failure alarms
pub trait AlarmPublisher {
    fn publish(&self, alarm: &AlarmMessage) -> Result<(), AlarmError>;
}

/// Writes alarms to the log at error level
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAlarmPublisher;

impl AlarmPublisher for LogAlarmPublisher {
    fn publish(&self, alarm: &AlarmMessage) -> Result<(), AlarmError> {
        let payload = serde_json::to_string(alarm)?;
        log::error!("Migration alarm: {payload}");
        Ok(())
    }
}

/// POSTs alarms as JSON to a webhook
pub struct WebhookAlarmPublisher {
    url: String,
    agent: ureq::Agent,
}

impl WebhookAlarmPublisher {
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            agent: ureq::AgentBuilder::new()
                .timeout(Duration::from_secs(10))
                .build(),
        }
    }
}

impl AlarmPublisher for WebhookAlarmPublisher {
    fn publish(&self, alarm: &AlarmMessage) -> Result<(), AlarmError> {
        let body = serde_json::to_value(alarm)?;
        self.agent
            .post(&self.url)
            .send_json(body)
            .map_err(|e| AlarmError::Delivery(e.to_string()))?;
        Ok(())
    }
}

/// Publish without letting a delivery failure escape
pub fn publish_quietly(publisher: &dyn AlarmPublisher, alarm: &AlarmMessage) {
    if let Err(e) = publisher.publish(alarm) {
        log::warn!("Failed to publish migration alarm: {e}");
    }
}
