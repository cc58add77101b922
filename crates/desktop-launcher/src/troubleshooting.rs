//! Recovery actions offered when an installation has issues.
//!
//! Actions are serialised: a second action waits for the first to finish.
//! Each environment action streams its output to the observers and then
//! re-validates the installation.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use backend_launch::ServerSupervisor;
use tokio::sync::Mutex;

use crate::events::track;
use crate::installation::Installation;
use crate::validation::ValidationReport;

pub struct Troubleshooting {
    installation: Arc<Installation>,
    supervisor: Option<Arc<ServerSupervisor>>,
    lock: Mutex<()>,
}

impl Troubleshooting {
    pub fn new(installation: Arc<Installation>) -> Self {
        Self {
            installation,
            supervisor: None,
            lock: Mutex::new(()),
        }
    }

    /// Enable [`Troubleshooting::restart_server`].
    pub fn with_supervisor(mut self, supervisor: Arc<ServerSupervisor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    pub fn installation(&self) -> &Arc<Installation> {
        &self.installation
    }

    /// Latest validation report.
    pub fn validation_state(&self) -> Arc<ValidationReport> {
        self.installation.validation()
    }

    pub async fn validate(&self) -> Arc<ValidationReport> {
        let _guard = self.lock.lock().await;
        self.installation.validate().await
    }

    /// Install the required packages again.
    pub async fn reinstall_requirements(&self) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let result = track("troubleshooting:install_requirements", async {
            let exit = self
                .installation
                .environment()
                .install_requirements(self.installation.observers().as_ref())
                .await?;
            Ok::<_, anyhow::Error>(exit.success())
        })
        .await;
        self.installation.validate().await;
        result
    }

    /// Clear uv's package cache. Installed packages are kept.
    pub async fn clear_package_cache(&self) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let result = track(
            "troubleshooting:clear_cache",
            self.installation
                .environment()
                .clear_package_cache(self.installation.observers().as_ref()),
        )
        .await;
        self.installation.validate().await;
        result
    }

    /// Delete the environment, create it again and upgrade pip, stopping at
    /// the first failing step.
    ///
    /// Packages are not reinstalled; validation will report them missing.
    pub async fn reset_environment(&self) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let result = track(
            "troubleshooting:reset_venv",
            self.installation
                .environment()
                .recreate_environment(self.installation.observers().as_ref()),
        )
        .await;
        self.installation.validate().await;
        result
    }

    /// Kill the backend and start it again with the same arguments.
    pub async fn restart_server(&self) -> Result<()> {
        let supervisor = self
            .supervisor
            .clone()
            .ok_or_else(|| anyhow!("No backend server is managed by this launcher"))?;

        let _guard = self.lock.lock().await;
        track("troubleshooting:restart_core", async {
            supervisor.restart().await.map_err(anyhow::Error::from)
        })
        .await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::app_state::AppState;
    use crate::install_manager::InstallationManager;
    use crate::observer::{ChannelObserver, LauncherEvent, ObserverRegistry};
    use crate::test_support::{fake_uv, launcher_config, FixedWizard};
    use tempfile::TempDir;

    async fn installed(temp: &TempDir, fail_on: &str) -> (Arc<Installation>, Arc<ObserverRegistry>) {
        let config = launcher_config(temp, fake_uv(temp.path(), fail_on));
        let observers = ObserverRegistry::new();
        let manager =
            InstallationManager::new(config, observers.clone(), Arc::new(AppState::new()));
        let outcome = manager
            .ensure_installed(&FixedWizard::new(&temp.path().join("base")))
            .await
            .unwrap();
        (outcome.installation().clone(), observers)
    }

    #[tokio::test]
    async fn test_reset_then_reinstall_restores_valid_state() {
        let temp = TempDir::new().unwrap();
        let (installation, _observers) = installed(&temp, "").await;
        let troubleshooting = Troubleshooting::new(installation.clone());

        assert!(troubleshooting.reset_environment().await.unwrap());
        // Fresh environment: interpreter back, packages gone.
        let report = troubleshooting.validation_state();
        assert!(report.environment_is_valid);
        assert!(!report.required_packages_present);
        assert!(report.has_issues);

        assert!(troubleshooting.reinstall_requirements().await.unwrap());
        assert!(!troubleshooting.validation_state().has_issues);
    }

    #[tokio::test]
    async fn test_removed_environment_fails_validation() {
        let temp = TempDir::new().unwrap();
        let (installation, _) = installed(&temp, "").await;
        assert!(!installation.validation().has_issues);

        assert!(installation.environment().remove_environment_directory().await);
        let report = installation.validate().await;
        assert!(!report.environment_exists);
        assert!(!report.environment_is_valid);
        assert!(report.has_issues);
        assert!(report.base_path_writable);
    }

    #[tokio::test]
    async fn test_clear_cache_revalidates() {
        let temp = TempDir::new().unwrap();
        let (installation, observers) = installed(&temp, "").await;
        let (observer, mut rx) = ChannelObserver::new();
        let _sub = observers.subscribe(observer);

        let troubleshooting = Troubleshooting::new(installation);
        assert!(troubleshooting.clear_package_cache().await.unwrap());

        let mut validated = false;
        while let Ok(event) = rx.try_recv() {
            if let LauncherEvent::Validation { report } = event {
                validated = true;
                assert!(!report.has_issues);
            }
        }
        assert!(validated);
    }

    #[tokio::test]
    async fn test_restart_without_supervisor_fails() {
        let temp = TempDir::new().unwrap();
        let (installation, _) = installed(&temp, "").await;
        let troubleshooting = Troubleshooting::new(installation);
        assert!(troubleshooting.restart_server().await.is_err());
    }

    #[tokio::test]
    async fn test_concurrent_actions_are_serialised() {
        let temp = TempDir::new().unwrap();
        let (installation, _) = installed(&temp, "").await;
        let troubleshooting = Arc::new(Troubleshooting::new(installation));

        let (reset, clear) = tokio::join!(
            troubleshooting.reset_environment(),
            troubleshooting.clear_package_cache()
        );
        assert!(reset.unwrap());
        assert!(clear.unwrap());
        assert!(troubleshooting.validation_state().environment_is_valid);
    }
}
