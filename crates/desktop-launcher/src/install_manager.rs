//! Installation manager: decides between first-run install, validation of an
//! existing installation, and handing a repairable installation back to the
//! caller.
//!
//! The manager never repairs automatically. An installation with issues is
//! returned as [`InstallOutcome::NeedsRepair`] so the UI can offer the
//! troubleshooting actions.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use backend_env::{DependencyEnvironment, EnvironmentConfig, TorchDevice};
use backend_launch::tools::uv_binary_name;
use backend_launch::{get_uv_path, LaunchArgs};
use chrono::Utc;
use futures::future::BoxFuture;
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::app_state::AppState;
use crate::config::{DesktopConfig, InstallState, LauncherConfig};
use crate::installation::Installation;
use crate::observer::ObserverRegistry;
use crate::server_config::{create_base_layout, ExtraModelsConfig};

/// Installation health as seen by the UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallHealth {
    Unknown,
    Validating,
    Valid,
    NeedsInstall,
    HasIssues,
}

/// Choices collected by the install wizard.
#[derive(Debug, Clone)]
pub struct InstallOptions {
    pub base_path: PathBuf,
    pub device: TorchDevice,
    /// Existing install whose models should be reused.
    pub migration_source: Option<PathBuf>,
    pub extra_launch_args: Option<LaunchArgs>,
}

/// Source of [`InstallOptions`] for a first-run install (the UI wizard).
pub trait InstallWizard: Send + Sync {
    fn request_options<'a>(
        &'a self,
        suggested_base_path: &'a Path,
    ) -> BoxFuture<'a, anyhow::Result<InstallOptions>>;
}

pub enum InstallOutcome {
    /// Installed and validated without issues.
    Ready(Arc<Installation>),
    /// Installed, but validation found issues.
    NeedsRepair(Arc<Installation>),
}

impl InstallOutcome {
    pub fn installation(&self) -> &Arc<Installation> {
        match self {
            InstallOutcome::Ready(installation) | InstallOutcome::NeedsRepair(installation) => {
                installation
            }
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, InstallOutcome::Ready(_))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum InstallError {
    #[error("Launcher config error: {0:#}")]
    Config(anyhow::Error),

    #[error("Install wizard did not complete: {0:#}")]
    Wizard(anyhow::Error),

    #[error("uv is not available: {0:#}")]
    UvUnavailable(anyhow::Error),

    #[error("Base path {path:?} is not writable: {source}")]
    BasePathNotWritable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Base path {path:?} is missing or not writable: {details}")]
    BasePathUnavailable { path: PathBuf, details: String },

    #[error("Environment setup failed: could not {step}")]
    EnvironmentSetup { step: &'static str },

    #[error("Failed to run uv: {0:#}")]
    Tool(anyhow::Error),
}

pub struct InstallationManager {
    config: LauncherConfig,
    observers: Arc<ObserverRegistry>,
    app_state: Arc<AppState>,
}

impl InstallationManager {
    pub fn new(
        config: LauncherConfig,
        observers: Arc<ObserverRegistry>,
        app_state: Arc<AppState>,
    ) -> Self {
        Self {
            config,
            observers,
            app_state,
        }
    }

    pub fn config(&self) -> &LauncherConfig {
        &self.config
    }

    /// Make sure a usable installation exists, running the first-run flow
    /// through `wizard` when there is none.
    pub async fn ensure_installed(
        &self,
        wizard: &dyn InstallWizard,
    ) -> Result<InstallOutcome, InstallError> {
        self.app_state.set_install_health(InstallHealth::Validating);
        let mut desktop = self.load_desktop_config()?;

        let installation = match self.open_existing(&desktop).await {
            Some(installation) => installation,
            None => {
                self.app_state.set_install_health(InstallHealth::NeedsInstall);
                self.fresh_install(&mut desktop, wizard).await?
            }
        };

        self.app_state.set_install_health(InstallHealth::Validating);
        let report = installation.validate().await;
        if !report.base_path_writable {
            // Repair actions cannot recreate a lost base path.
            self.app_state.set_install_health(InstallHealth::HasIssues);
            return Err(InstallError::BasePathUnavailable {
                path: installation.base_path().to_path_buf(),
                details: report.error_messages.join("; "),
            });
        }
        if report.has_issues {
            warn!(
                "[install] Installation at {:?} has issues: {:?}",
                installation.base_path(),
                report.error_messages
            );
            self.app_state.set_install_health(InstallHealth::HasIssues);
            Ok(InstallOutcome::NeedsRepair(installation))
        } else {
            info!("[install] Installation at {:?} is valid", installation.base_path());
            self.app_state.set_install_health(InstallHealth::Valid);
            Ok(InstallOutcome::Ready(installation))
        }
    }

    /// The completed installation, if any, without validating it.
    pub async fn load_installation(&self) -> Result<Option<Arc<Installation>>, InstallError> {
        let desktop = self.load_desktop_config()?;
        Ok(self.open_existing(&desktop).await)
    }

    fn load_desktop_config(&self) -> Result<DesktopConfig, InstallError> {
        DesktopConfig::load(&self.config.paths.config_file()).map_err(InstallError::Config)
    }

    fn save_desktop_config(&self, desktop: &DesktopConfig) -> Result<(), InstallError> {
        desktop
            .save(&self.config.paths.config_file())
            .map_err(InstallError::Config)
    }

    async fn open_existing(&self, desktop: &DesktopConfig) -> Option<Arc<Installation>> {
        let base_path = desktop.installed_base_path()?.to_path_buf();
        let uv_path = match self.resolve_uv().await {
            Ok(path) => path,
            Err(e) => {
                // Validation reports the missing tool.
                warn!("[install] {:#}", e);
                PathBuf::from(uv_binary_name())
            }
        };
        Some(self.open(base_path, desktop, uv_path))
    }

    async fn resolve_uv(&self) -> anyhow::Result<PathBuf> {
        match &self.config.overrides.uv_path {
            Some(path) => Ok(path.clone()),
            None => get_uv_path(Some(&self.config.paths.resources_dir)).await,
        }
    }

    fn open(&self, base_path: PathBuf, desktop: &DesktopConfig, uv_path: PathBuf) -> Arc<Installation> {
        let environment = DependencyEnvironment::new(
            EnvironmentConfig::new(&base_path, uv_path.clone())
                .with_requirements(self.config.resources.requirement_manifests())
                .with_device(desktop.device.unwrap_or_default()),
        );
        Arc::new(Installation::new(
            base_path,
            desktop.launch_args.clone(),
            environment,
            uv_path,
            self.observers.clone(),
        ))
    }

    async fn fresh_install(
        &self,
        desktop: &mut DesktopConfig,
        wizard: &dyn InstallWizard,
    ) -> Result<Arc<Installation>, InstallError> {
        let options = wizard
            .request_options(&self.config.paths.suggested_base_path())
            .await
            .map_err(InstallError::Wizard)?;
        info!(
            "[install] Installing to {:?} for {}",
            options.base_path, options.device
        );

        let uv_path = self.resolve_uv().await.map_err(InstallError::UvUnavailable)?;
        let base_path = options.base_path.clone();

        desktop.install_state = Some(InstallState::Started);
        desktop.base_path = Some(base_path.clone());
        desktop.device = Some(options.device);
        desktop.launch_args = options.extra_launch_args.clone().unwrap_or_default();
        self.save_desktop_config(desktop)?;

        create_base_layout(&base_path).map_err(|source| InstallError::BasePathNotWritable {
            path: base_path.clone(),
            source,
        })?;
        ExtraModelsConfig::for_installation(&base_path, options.migration_source.as_deref())
            .write(&self.config.paths.extra_models_config())
            .map_err(InstallError::Config)?;

        let installation = self.open(base_path, desktop, uv_path);
        let environment = installation.environment();
        let handler = self.observers.as_ref();

        if !environment
            .create_environment(handler)
            .await
            .map_err(InstallError::Tool)?
        {
            return Err(InstallError::EnvironmentSetup {
                step: "create the Python environment",
            });
        }
        if !environment
            .upgrade_core_packager(handler)
            .await
            .map_err(InstallError::Tool)?
        {
            return Err(InstallError::EnvironmentSetup { step: "upgrade pip" });
        }
        let exit = environment
            .install_requirements(handler)
            .await
            .map_err(InstallError::Tool)?;
        if !exit.success() {
            return Err(InstallError::EnvironmentSetup {
                step: "install the required packages",
            });
        }

        desktop.install_state = Some(InstallState::Installed);
        desktop.installed_at = Some(Utc::now());
        self.save_desktop_config(desktop)?;
        info!("[install] Installation complete");

        Ok(installation)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::test_support::{fake_uv, launcher_config, FixedWizard, NoWizard};
    use tempfile::TempDir;

    fn manager(config: LauncherConfig) -> (InstallationManager, Arc<AppState>) {
        let app_state = Arc::new(AppState::new());
        (
            InstallationManager::new(config, ObserverRegistry::new(), app_state.clone()),
            app_state,
        )
    }

    #[tokio::test]
    async fn test_first_run_installs_and_persists() {
        let temp = TempDir::new().unwrap();
        let config = launcher_config(&temp, fake_uv(temp.path(), ""));
        let base = temp.path().join("base");
        let (manager, app_state) = manager(config.clone());

        let outcome = manager
            .ensure_installed(&FixedWizard::new(&base))
            .await
            .unwrap();
        assert!(outcome.is_ready());
        assert_eq!(app_state.install_health(), InstallHealth::Valid);

        let desktop = DesktopConfig::load(&config.paths.config_file()).unwrap();
        assert_eq!(desktop.install_state, Some(InstallState::Installed));
        assert_eq!(desktop.installed_base_path(), Some(base.as_path()));
        assert!(desktop.installed_at.is_some());

        assert!(base.join("user").is_dir());
        assert!(base.join("custom_nodes").is_dir());
        let models = ExtraModelsConfig::read(&config.paths.extra_models_config()).unwrap();
        assert_eq!(models.desktop.base_path, base.to_string_lossy());
    }

    #[tokio::test]
    async fn test_existing_install_skips_wizard() {
        let temp = TempDir::new().unwrap();
        let config = launcher_config(&temp, fake_uv(temp.path(), ""));
        let base = temp.path().join("base");

        let (first, _) = manager(config.clone());
        first.ensure_installed(&FixedWizard::new(&base)).await.unwrap();

        let (second, _) = manager(config);
        let outcome = second.ensure_installed(&NoWizard).await.unwrap();
        assert!(outcome.is_ready());
        assert_eq!(outcome.installation().base_path(), base.as_path());
    }

    #[tokio::test]
    async fn test_broken_install_needs_repair() {
        let temp = TempDir::new().unwrap();
        let config = launcher_config(&temp, fake_uv(temp.path(), ""));
        let base = temp.path().join("base");

        let (first, _) = manager(config.clone());
        first.ensure_installed(&FixedWizard::new(&base)).await.unwrap();
        std::fs::remove_dir_all(base.join(".venv")).unwrap();

        let (second, app_state) = manager(config);
        let outcome = second.ensure_installed(&NoWizard).await.unwrap();
        assert!(!outcome.is_ready());
        assert_eq!(app_state.install_health(), InstallHealth::HasIssues);
        let report = outcome.installation().validation();
        assert!(!report.environment_exists);
        assert!(report.has_issues);
    }

    #[tokio::test]
    async fn test_environment_failure_during_first_run() {
        let temp = TempDir::new().unwrap();
        let config = launcher_config(&temp, fake_uv(temp.path(), "venv"));
        let (manager, _) = manager(config.clone());

        let result = manager
            .ensure_installed(&FixedWizard::new(&temp.path().join("base")))
            .await;
        assert!(matches!(result, Err(InstallError::EnvironmentSetup { .. })));

        // The half-finished install is not treated as installed next time.
        let desktop = DesktopConfig::load(&config.paths.config_file()).unwrap();
        assert_eq!(desktop.install_state, Some(InstallState::Started));
        assert!(desktop.installed_base_path().is_none());
    }

    #[tokio::test]
    async fn test_unwritable_base_path() {
        let temp = TempDir::new().unwrap();
        let config = launcher_config(&temp, fake_uv(temp.path(), ""));
        let blocker = temp.path().join("not-a-dir");
        std::fs::write(&blocker, "").unwrap();
        let (manager, _) = manager(config);

        let result = manager
            .ensure_installed(&FixedWizard::new(&blocker.join("base")))
            .await;
        assert!(matches!(
            result,
            Err(InstallError::BasePathNotWritable { .. })
        ));
    }

    #[tokio::test]
    async fn test_missing_base_path_is_fatal() {
        let temp = TempDir::new().unwrap();
        let config = launcher_config(&temp, fake_uv(temp.path(), ""));
        let base = temp.path().join("base");

        let (first, _) = manager(config.clone());
        first.ensure_installed(&FixedWizard::new(&base)).await.unwrap();
        std::fs::remove_dir_all(&base).unwrap();

        let (second, app_state) = manager(config);
        let result = second.ensure_installed(&NoWizard).await;
        match result {
            Err(InstallError::BasePathUnavailable { path, details }) => {
                assert_eq!(path, base);
                assert!(details.contains("does not exist"), "{}", details);
            }
            Err(other) => panic!("unexpected error {:?}", other),
            Ok(_) => panic!("missing base path was accepted"),
        }
        assert_eq!(app_state.install_health(), InstallHealth::HasIssues);
    }

    #[tokio::test]
    async fn test_wizard_failure() {
        let temp = TempDir::new().unwrap();
        let config = launcher_config(&temp, fake_uv(temp.path(), ""));
        let (manager, _) = manager(config);

        let result = manager.ensure_installed(&NoWizard).await;
        assert!(matches!(result, Err(InstallError::Wizard(_))));
    }

    #[tokio::test]
    async fn test_corrupt_config_is_an_error() {
        let temp = TempDir::new().unwrap();
        let config = launcher_config(&temp, fake_uv(temp.path(), ""));
        std::fs::create_dir_all(&config.paths.config_dir).unwrap();
        std::fs::write(config.paths.config_file(), "[").unwrap();
        let (manager, _) = manager(config);

        let result = manager.ensure_installed(&NoWizard).await;
        assert!(matches!(result, Err(InstallError::Config(_))));
    }

    #[tokio::test]
    async fn test_load_installation_without_install() {
        let temp = TempDir::new().unwrap();
        let config = launcher_config(&temp, fake_uv(temp.path(), ""));
        let (manager, _) = manager(config);
        assert!(manager.load_installation().await.unwrap().is_none());
    }
}
