//! Progress reporting for environment operations.
//!
//! Provides [`EnvProgressPhase`] events covering environment creation,
//! repair and package installation, and a [`ProgressHandler`] trait that
//! consumers implement to route events and tool output to their UI layer.

use backend_launch::OutputStream;
use serde::{Deserialize, Serialize};

/// Progress phases during environment preparation.
///
/// Serializable for transport over the launcher protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum EnvProgressPhase {
    /// Creating the virtual environment.
    CreatingVenv,
    /// Deleting the virtual environment directory.
    RemovingVenv,
    /// Upgrading pip inside the environment.
    UpgradingPackager,
    /// Installing packages from an index or requirements manifest.
    InstallingPackages { packages: Vec<String> },
    /// Cleaning the uv package cache.
    ClearingCache,
    /// Environment is ready.
    Ready {
        env_path: String,
        python_path: String,
    },
    /// An error occurred.
    Error { message: String },
}

/// Trait for receiving environment progress events.
///
/// Implement this to route progress to your UI layer (observer registry,
/// protocol stream, logs, etc.).
pub trait ProgressHandler: Send + Sync {
    /// Called for each progress phase.
    fn on_progress(&self, phase: EnvProgressPhase);

    /// Called for each output line of the underlying tool, in order.
    fn on_output(&self, stream: OutputStream, line: &str) {
        let _ = (stream, line);
    }
}

/// Log-only progress handler.
///
/// Writes progress phases to the `log` crate at info level and tool output at
/// debug level.
pub struct LogHandler;

impl ProgressHandler for LogHandler {
    fn on_progress(&self, phase: EnvProgressPhase) {
        match &phase {
            EnvProgressPhase::CreatingVenv => {
                log::info!("[venv] Creating virtual environment...");
            }
            EnvProgressPhase::RemovingVenv => {
                log::info!("[venv] Removing virtual environment...");
            }
            EnvProgressPhase::UpgradingPackager => {
                log::info!("[venv] Upgrading pip...");
            }
            EnvProgressPhase::InstallingPackages { packages } => {
                log::info!("[venv] Installing packages: {packages:?}");
            }
            EnvProgressPhase::ClearingCache => {
                log::info!("[venv] Clearing package cache...");
            }
            EnvProgressPhase::Ready {
                env_path,
                python_path,
            } => {
                log::info!("[venv] Ready: env={env_path} python={python_path}");
            }
            EnvProgressPhase::Error { message } => {
                log::error!("[venv] Error: {message}");
            }
        }
    }

    fn on_output(&self, stream: OutputStream, line: &str) {
        log::debug!("[venv] {stream:?}: {line}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_serializes_with_tag() {
        let json = serde_json::to_value(EnvProgressPhase::InstallingPackages {
            packages: vec!["torch".to_string()],
        })
        .unwrap();
        assert_eq!(json["phase"], "installing_packages");
        assert_eq!(json["packages"][0], "torch");

        let parsed: EnvProgressPhase =
            serde_json::from_str(r#"{"phase":"clearing_cache"}"#).unwrap();
        assert_eq!(parsed, EnvProgressPhase::ClearingCache);
    }
}
