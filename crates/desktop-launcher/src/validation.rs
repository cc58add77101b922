//! Read-only installation validation.
//!
//! Every run produces a fresh, fully populated [`ValidationReport`]. The only
//! side effect is a transient probe file used to test that the base path is
//! writable.

use std::path::{Path, PathBuf};

use backend_env::DependencyEnvironment;
use backend_launch::tools::check_uv_available;
use log::{info, warn};
use serde::{Deserialize, Serialize};

const WRITE_PROBE_FILE: &str = ".launcher-write-test";

/// Result of one validation run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationReport {
    pub base_path_exists: bool,
    pub base_path_writable: bool,
    pub uv_present: bool,
    pub environment_exists: bool,
    pub environment_is_valid: bool,
    pub required_packages_present: bool,
    /// True when any check above failed.
    pub has_issues: bool,
    /// One message per failed check, in check order.
    pub error_messages: Vec<String>,
}

impl ValidationReport {
    /// Report held by an installation before its first validation run.
    pub fn not_validated() -> Self {
        Self {
            error_messages: vec!["Installation has not been validated yet".to_string()],
            ..Default::default()
        }
        .finish()
    }

    fn finish(mut self) -> Self {
        self.has_issues = !(self.base_path_exists
            && self.base_path_writable
            && self.uv_present
            && self.environment_exists
            && self.environment_is_valid
            && self.required_packages_present);
        self
    }
}

/// Checks an installation's base path, tools and environment.
pub struct InstallationValidator<'a> {
    base_path: &'a Path,
    uv_path: &'a Path,
    environment: &'a DependencyEnvironment,
}

impl<'a> InstallationValidator<'a> {
    pub fn new(
        base_path: &'a Path,
        uv_path: &'a Path,
        environment: &'a DependencyEnvironment,
    ) -> Self {
        Self {
            base_path,
            uv_path,
            environment,
        }
    }

    pub async fn run(&self) -> ValidationReport {
        let mut report = ValidationReport::default();

        report.base_path_exists = self.base_path.is_dir();
        if !report.base_path_exists {
            report
                .error_messages
                .push(format!("Base path does not exist: {}", self.base_path.display()));
        } else {
            report.base_path_writable = is_writable(self.base_path).await;
            if !report.base_path_writable {
                report.error_messages.push(format!(
                    "Base path is not writable: {}",
                    self.base_path.display()
                ));
            }
        }

        report.uv_present = check_uv_available(self.uv_path).await;
        if !report.uv_present {
            report
                .error_messages
                .push(format!("uv is not available at {}", self.uv_path.display()));
        }

        let venv_path = self.environment.venv_path();
        report.environment_exists = venv_path.is_dir();
        if !report.environment_exists {
            report.error_messages.push(format!(
                "Python environment is missing: {}",
                venv_path.display()
            ));
        } else {
            report.environment_is_valid = self.environment.python_path().is_file();
            if !report.environment_is_valid {
                report.error_messages.push(format!(
                    "Python environment has no interpreter: {}",
                    self.environment.python_path().display()
                ));
            }
        }

        if report.environment_is_valid && report.uv_present {
            report.required_packages_present = match self.environment.has_requirements().await {
                Ok(present) => present,
                Err(e) => {
                    warn!("[validation] Could not check packages: {:#}", e);
                    false
                }
            };
        }
        if !report.required_packages_present {
            report
                .error_messages
                .push("Required Python packages are not installed".to_string());
        }

        let report = report.finish();
        info!(
            "[validation] {} ({} issues)",
            self.base_path.display(),
            report.error_messages.len()
        );
        report
    }
}

async fn is_writable(dir: &Path) -> bool {
    let probe: PathBuf = dir.join(WRITE_PROBE_FILE);
    match tokio::fs::write(&probe, b"").await {
        Ok(()) => {
            let _ = tokio::fs::remove_file(&probe).await;
            true
        }
        Err(e) => {
            warn!("[validation] {:?} is not writable: {}", dir, e);
            false
        }
    }
}
