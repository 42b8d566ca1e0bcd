//! Lifecycle adapter
//!
//! Translates a create/update/delete event from a deployment orchestrator into
//! an orchestrator run. The operator pause flag is resolved once here and
//! passed on as a plain boolean.

use crate::alarm::{publish_quietly, AlarmMessage, AlarmPublisher};
use crate::migration::RunResult;
use crate::orchestrator::{Orchestrator, RunRequest};
use crate::MigrateError;
use serde::{Deserialize, Serialize};

/// Physical id reported when the caller did not supply one
pub const DEFAULT_PHYSICAL_ID: &str = "schemawarden-migrations";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum RequestType {
    #[serde(alias = "create", alias = "CREATE")]
    Create,
    #[serde(alias = "update", alias = "UPDATE")]
    Update,
    #[serde(alias = "delete", alias = "DELETE")]
    Delete,
}

/// Pause signal as sent by callers: a boolean or a string such as `"true"`
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum PauseFlag {
    Bool(bool),
    Text(String),
}

impl PauseFlag {
    #[must_use]
    pub fn is_set(&self) -> bool {
        match self {
            PauseFlag::Bool(b) => *b,
            PauseFlag::Text(s) => matches!(
                s.trim().to_ascii_lowercase().as_str(),
                "true" | "1" | "yes" | "on"
            ),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceProperties {
    #[serde(default, alias = "Version")]
    pub version: Option<String>,
    #[serde(default, alias = "Pause")]
    pub pause: Option<PauseFlag>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleEvent {
    #[serde(alias = "RequestType")]
    pub request_type: RequestType,
    #[serde(default, alias = "PhysicalResourceId")]
    pub physical_resource_id: Option<String>,
    #[serde(default, alias = "ResourceProperties")]
    pub resource_properties: Option<ResourceProperties>,
}

impl LifecycleEvent {
    fn properties(&self) -> ResourceProperties {
        self.resource_properties.clone().unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Completed,
    Paused,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResponseData {
    pub status: RunStatus,
    pub applied: usize,
    pub skipped: usize,
}

impl From<&RunResult> for ResponseData {
    fn from(result: &RunResult) -> Self {
        Self {
            status: if result.paused {
                RunStatus::Paused
            } else {
                RunStatus::Completed
            },
            applied: result.applied.len(),
            skipped: result.skipped.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LifecycleResponse {
    pub physical_resource_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ResponseData>,
}

/// Handles lifecycle events against one orchestrator
pub struct LifecycleHandler<'a> {
    orchestrator: &'a Orchestrator<'a>,
    alarms: &'a dyn AlarmPublisher,
}

impl<'a> LifecycleHandler<'a> {
    #[must_use]
    pub fn new(orchestrator: &'a Orchestrator<'a>, alarms: &'a dyn AlarmPublisher) -> Self {
        Self {
            orchestrator,
            alarms,
        }
    }

    /// Handle one event
    ///
    /// Delete is a no-op. Create and Update run every pending migration
    /// unless paused.
    ///
    /// # Errors
    ///
    /// Returns the run's error after publishing an alarm for it.
    pub fn handle(&self, event: &LifecycleEvent) -> Result<LifecycleResponse, MigrateError> {
        let physical_resource_id = event
            .physical_resource_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| DEFAULT_PHYSICAL_ID.to_string());

        if event.request_type == RequestType::Delete {
            log::info!("Delete event for {physical_resource_id}: nothing to do");
            return Ok(LifecycleResponse {
                physical_resource_id,
                data: None,
            });
        }

        let request = self.run_request(event);
        log::info!(
            "{:?} event for {physical_resource_id} (batch {}, version {}, paused: {})",
            event.request_type,
            request.batch_id,
            request.app_version.as_deref().unwrap_or("unknown"),
            request.paused
        );

        match self.orchestrator.run(&request) {
            Ok(result) => Ok(LifecycleResponse {
                physical_resource_id,
                data: Some(ResponseData::from(&result)),
            }),
            Err(error) => {
                log::error!("Migration run {} failed: {error}", request.batch_id);
                let alarm = AlarmMessage::from_error(
                    &error,
                    request.app_version.clone(),
                    Some(request.batch_id.clone()),
                );
                publish_quietly(self.alarms, &alarm);
                Err(error)
            }
        }
    }

    fn run_request(&self, event: &LifecycleEvent) -> RunRequest {
        let settings = self.orchestrator.settings();
        let properties = event.properties();
        let paused = properties.pause.as_ref().is_some_and(PauseFlag::is_set) || settings.pause;
        let app_version = properties
            .version
            .filter(|v| !v.is_empty())
            .or_else(|| settings.app_version.clone());

        let mut request = RunRequest::new(app_version);
        request.paused = paused;
        if let Some(batch_id) = settings.batch_id.clone().filter(|b| !b.is_empty()) {
            request.batch_id = batch_id;
        }
        request
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::orchestrator::Collaborators;
    use crate::test_helpers::{FakeConnector, MemorySession, RecordingAlarms, StaticSecretStore};
    use crate::ErrorKind;
    use std::fs;
    use tempfile::TempDir;

    fn event(json: &str) -> LifecycleEvent {
        serde_json::from_str(json).unwrap()
    }

    fn settings(dir: &TempDir) -> Settings {
        Settings {
            migrations_dir: dir.path().to_path_buf(),
            db_host: Some("db".to_string()),
            db_port: Some(5432),
            db_user: Some("u".to_string()),
            db_password: Some("p".to_string()),
            db_name: Some("cards".to_string()),
            connect_max_attempts: 1,
            ..Settings::default()
        }
    }

    #[test]
    fn test_event_parsing_accepts_both_casings() {
        let camel = event(
            r#"{"requestType":"Create","resourceProperties":{"version":"2.1.0","pause":"yes"}}"#,
        );
        let pascal = event(
            r#"{"RequestType":"create","ResourceProperties":{"Version":"2.1.0","Pause":"yes"}}"#,
        );
        assert_eq!(camel, pascal);
        assert_eq!(camel.request_type, RequestType::Create);
        assert!(camel.properties().pause.unwrap().is_set());
    }

    #[test]
    fn test_pause_flag_values() {
        for on in ["true", "1", "YES", " on "] {
            assert!(PauseFlag::Text(on.to_string()).is_set(), "{on}");
        }
        for off in ["false", "0", "", "paused"] {
            assert!(!PauseFlag::Text(off.to_string()).is_set(), "{off}");
        }
        assert!(PauseFlag::Bool(true).is_set());
    }

    #[test]
    fn test_response_serializes_camel_case() {
        let response = LifecycleResponse {
            physical_resource_id: "id-1".to_string(),
            data: Some(ResponseData {
                status: RunStatus::Paused,
                applied: 0,
                skipped: 0,
            }),
        };
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["physicalResourceId"], "id-1");
        assert_eq!(json["data"]["status"], "paused");

        let delete = LifecycleResponse {
            physical_resource_id: "id-1".to_string(),
            data: None,
        };
        assert!(serde_json::to_value(&delete).unwrap().get("data").is_none());
    }

    #[test]
    fn test_delete_is_noop() {
        let dir = TempDir::new().unwrap();
        let connector = FakeConnector::new();
        let secrets = StaticSecretStore::empty();
        let alarms = RecordingAlarms::new();
        let orchestrator = Orchestrator::new(
            settings(&dir),
            Collaborators {
                secrets: &secrets,
                connector: &connector,
                pool_health: None,
            },
        );
        let handler = LifecycleHandler::new(&orchestrator, &alarms);

        let response = handler
            .handle(&event(r#"{"requestType":"Delete","physicalResourceId":"keep-me"}"#))
            .unwrap();

        assert_eq!(response.physical_resource_id, "keep-me");
        assert!(response.data.is_none());
        assert_eq!(connector.attempts("db"), 0);
    }

    #[test]
    fn test_process_pause_override() {
        let dir = TempDir::new().unwrap();
        let connector = FakeConnector::new();
        let secrets = StaticSecretStore::empty();
        let alarms = RecordingAlarms::new();
        let orchestrator = Orchestrator::new(
            Settings {
                pause: true,
                ..settings(&dir)
            },
            Collaborators {
                secrets: &secrets,
                connector: &connector,
                pool_health: None,
            },
        );
        let handler = LifecycleHandler::new(&orchestrator, &alarms);

        let response = handler.handle(&event(r#"{"requestType":"Update"}"#)).unwrap();

        assert_eq!(response.physical_resource_id, DEFAULT_PHYSICAL_ID);
        assert_eq!(response.data.unwrap().status, RunStatus::Paused);
        assert_eq!(connector.attempts("db"), 0);
    }

    #[test]
    fn test_failure_publishes_alarm_and_reraises() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("2024-01-01T0000__cards__init.sql"), "BROKEN").unwrap();
        let session = MemorySession::new();
        session.fail_script_containing("BROKEN");
        let connector = FakeConnector::new();
        connector.serve("db", session);
        let secrets = StaticSecretStore::empty();
        let alarms = RecordingAlarms::new();
        let orchestrator = Orchestrator::new(
            Settings {
                batch_id: Some("batch-7".to_string()),
                ..settings(&dir)
            },
            Collaborators {
                secrets: &secrets,
                connector: &connector,
                pool_health: None,
            },
        );
        let handler = LifecycleHandler::new(&orchestrator, &alarms);

        let err = handler
            .handle(&event(
                r#"{"requestType":"Create","resourceProperties":{"version":"3.0.0"}}"#,
            ))
            .unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Execution);
        let published = alarms.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].kind, ErrorKind::Execution);
        assert_eq!(published[0].version.as_deref(), Some("3.0.0"));
        assert_eq!(published[0].batch_id.as_deref(), Some("batch-7"));
    }

    #[test]
    fn test_alarm_failure_does_not_mask_error() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("bad.sql"), "SELECT 1").unwrap();
        let connector = FakeConnector::new();
        let secrets = StaticSecretStore::empty();
        let alarms = RecordingAlarms::new();
        alarms.fail_deliveries();
        let orchestrator = Orchestrator::new(
            settings(&dir),
            Collaborators {
                secrets: &secrets,
                connector: &connector,
                pool_health: None,
            },
        );
        let handler = LifecycleHandler::new(&orchestrator, &alarms);

        let err = handler.handle(&event(r#"{"requestType":"Create"}"#)).unwrap_err();

        assert!(matches!(err, MigrateError::InvalidFileName { .. }));
    }
}
