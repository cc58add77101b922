//! A concrete installation: its descriptor, environment and latest
//! validation report.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use backend_env::DependencyEnvironment;
use backend_launch::{CoreLaunchPaths, LaunchArgs};
use serde::Serialize;

use crate::observer::ObserverRegistry;
use crate::validation::{InstallationValidator, ValidationReport};

/// Immutable description of an installation for the session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstallationDescriptor {
    pub base_path: PathBuf,
    pub environment_path: PathBuf,
    /// User launch arguments in configured order.
    pub configured_launch_args: LaunchArgs,
}

pub struct Installation {
    descriptor: InstallationDescriptor,
    environment: DependencyEnvironment,
    uv_path: PathBuf,
    report: RwLock<Arc<ValidationReport>>,
    observers: Arc<ObserverRegistry>,
}

impl Installation {
    pub fn new(
        base_path: PathBuf,
        launch_args: LaunchArgs,
        environment: DependencyEnvironment,
        uv_path: PathBuf,
        observers: Arc<ObserverRegistry>,
    ) -> Self {
        let descriptor = InstallationDescriptor {
            base_path,
            environment_path: environment.venv_path().to_path_buf(),
            configured_launch_args: launch_args,
        };
        Self {
            descriptor,
            environment,
            uv_path,
            report: RwLock::new(Arc::new(ValidationReport::not_validated())),
            observers,
        }
    }

    pub fn descriptor(&self) -> &InstallationDescriptor {
        &self.descriptor
    }

    pub fn base_path(&self) -> &Path {
        &self.descriptor.base_path
    }

    pub fn environment(&self) -> &DependencyEnvironment {
        &self.environment
    }

    pub fn uv_path(&self) -> &Path {
        &self.uv_path
    }

    pub fn observers(&self) -> &Arc<ObserverRegistry> {
        &self.observers
    }

    /// Most recent validation report, or [`ValidationReport::not_validated`]
    /// before the first run.
    pub fn validation(&self) -> Arc<ValidationReport> {
        self.report
            .read()
            .map(|r| r.clone())
            .unwrap_or_else(|_| Arc::new(ValidationReport::not_validated()))
    }

    /// Run validation, replace the stored report and notify observers.
    ///
    /// Safe to call concurrently; the last run to finish wins.
    pub async fn validate(&self) -> Arc<ValidationReport> {
        let report = Arc::new(
            InstallationValidator::new(&self.descriptor.base_path, &self.uv_path, &self.environment)
                .run()
                .await,
        );

        if let Ok(mut current) = self.report.write() {
            *current = report.clone();
        }
        self.observers.notify_validation(&report);
        report
    }

    /// Core launch paths for this installation.
    pub fn core_paths(&self, front_end_root: PathBuf, extra_models_config: PathBuf) -> CoreLaunchPaths {
        CoreLaunchPaths::for_base_path(&self.descriptor.base_path, front_end_root, extra_models_config)
    }
}
