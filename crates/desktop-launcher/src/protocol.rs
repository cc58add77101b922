//! Request/response types between the UI and the launcher.
//!
//! Both enums are serialized as tagged JSON. Payloads that don't parse into a
//! known [`Request`] are answered with [`Response::Error`] and never reach
//! the handlers.

use backend_launch::ServerState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::install_manager::InstallHealth;
use crate::validation::ValidationReport;

/// Requests that the UI can send to the launcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Request {
    /// Latest validation report without re-running validation.
    GetValidationState,

    /// Run validation now.
    ValidateInstallation,

    /// Reinstall the required packages.
    InstallRequirements,

    /// Clear the package cache.
    ClearCache,

    /// Delete and recreate the Python environment.
    ResetVenv,

    /// Restart the backend server.
    RestartCore,

    /// Find a free port on `host`, scanning `start..end`.
    FindPort {
        host: String,
        start: u16,
        #[serde(default)]
        end: Option<u16>,
    },

    /// Backend server status.
    ServerStatus,
}

/// Responses from the launcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Response {
    /// A validation report.
    Validation { report: ValidationReport },

    /// Outcome of a repair action.
    ActionResult { success: bool },

    /// Backend restarted and ready.
    Restarted,

    /// A free port.
    Port { port: u16 },

    /// Backend status.
    Status { status: ServerStatus },

    /// An error occurred.
    Error { message: String },
}

/// Snapshot of the backend server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerStatus {
    pub state: ServerState,
    pub health: InstallHealth,
    pub url: Option<String>,
    pub pid: Option<u32>,
    pub launcher_started_at: DateTime<Utc>,
}

impl Request {
    /// Parse a JSON payload, mapping malformed input to an error response.
    pub fn from_json(payload: &str) -> Result<Request, Response> {
        serde_json::from_str(payload).map_err(|e| Response::Error {
            message: format!("Invalid request: {}", e),
        })
    }
}

impl Response {
    pub fn error(message: impl std::fmt::Display) -> Self {
        Response::Error {
            message: message.to_string(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|e| {
            format!(r#"{{"type":"error","message":"failed to encode response: {}"}}"#, e)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_tags() {
        let json = serde_json::to_string(&Request::ResetVenv).unwrap();
        assert_eq!(json, r#"{"type":"reset_venv"}"#);

        let req = Request::from_json(r#"{"type":"find_port","host":"127.0.0.1","start":8000}"#)
            .unwrap();
        assert_eq!(
            req,
            Request::FindPort {
                host: "127.0.0.1".to_string(),
                start: 8000,
                end: None
            }
        );
    }

    #[test]
    fn test_unknown_request_is_rejected() {
        match Request::from_json(r#"{"type":"format_disk"}"#) {
            Err(Response::Error { message }) => assert!(message.starts_with("Invalid request")),
            other => panic!("expected error response, got {:?}", other),
        }
        assert!(Request::from_json("not json").is_err());
        assert!(Request::from_json(r#"{"type":"find_port","host":"x","start":70000}"#).is_err());
    }

    #[test]
    fn test_status_response_json() {
        let response = Response::Status {
            status: ServerStatus {
                state: ServerState::Running,
                health: InstallHealth::Valid,
                url: Some("http://127.0.0.1:8000".to_string()),
                pid: Some(42),
                launcher_started_at: Utc::now(),
            },
        };
        let value: serde_json::Value = serde_json::from_str(&response.to_json()).unwrap();
        assert_eq!(value["type"], "status");
        assert_eq!(value["status"]["state"], "running");
        assert_eq!(value["status"]["health"], "valid");
    }
}
