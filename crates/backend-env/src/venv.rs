//! uv-managed virtual environment for the backend server.
//!
//! The environment lives in `<base_path>/.venv` and uses a launcher-private
//! package cache and Python install directory, so it never touches a user's
//! global uv state. Command failures (non-zero exit) are reported as `false` /
//! [`ExitInfo`]; only a failure to run `uv` at all is an `Err`.
//!
//! The environment never repairs itself. Callers decide when to recreate it.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use backend_launch::{run_streaming, ExitInfo};
use log::{info, warn};
use serde::Serialize;

use crate::device::{TorchDevice, TORCH_PACKAGES};
use crate::progress::{EnvProgressPhase, ProgressHandler};

/// Python version requested from uv when creating the environment.
pub const DEFAULT_PYTHON_VERSION: &str = "3.12";

/// Marker uv prints for a dry-run with nothing left to install.
const NOTHING_TO_INSTALL: &str = "Would make no changes";

/// Observable lifecycle of the environment directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvironmentState {
    /// No directory on disk.
    Absent,
    Creating,
    /// Directory with a usable interpreter.
    Ready,
    /// Directory exists but has no interpreter.
    Broken,
    /// Being removed and created again.
    Recreating,
}

/// Where and how the environment is built.
#[derive(Debug, Clone)]
pub struct EnvironmentConfig {
    pub venv_path: PathBuf,
    pub uv_path: PathBuf,
    pub python_version: String,
    /// Exported as `UV_CACHE_DIR`.
    pub cache_dir: PathBuf,
    /// Exported as `UV_PYTHON_INSTALL_DIR`.
    pub python_install_dir: PathBuf,
    /// Requirements manifests installed after torch, in order.
    pub requirements: Vec<PathBuf>,
    pub device: TorchDevice,
}

impl EnvironmentConfig {
    /// Default layout under an installation base path.
    pub fn new(base_path: &Path, uv_path: PathBuf) -> Self {
        Self {
            venv_path: base_path.join(".venv"),
            uv_path,
            python_version: DEFAULT_PYTHON_VERSION.to_string(),
            cache_dir: base_path.join("uv-cache"),
            python_install_dir: base_path.join("uv-python"),
            requirements: Vec::new(),
            device: TorchDevice::default(),
        }
    }

    pub fn with_requirements(mut self, requirements: Vec<PathBuf>) -> Self {
        self.requirements = requirements;
        self
    }

    pub fn with_device(mut self, device: TorchDevice) -> Self {
        self.device = device;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Operation {
    Creating,
    Recreating,
}

/// Clears the in-flight operation when dropped.
struct OperationGuard<'a> {
    slot: &'a Mutex<Option<Operation>>,
    previous: Option<Operation>,
}

impl Drop for OperationGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut slot) = self.slot.lock() {
            *slot = self.previous;
        }
    }
}

/// The backend's isolated Python environment.
pub struct DependencyEnvironment {
    config: EnvironmentConfig,
    operation: Mutex<Option<Operation>>,
}

impl DependencyEnvironment {
    pub fn new(config: EnvironmentConfig) -> Self {
        Self {
            config,
            operation: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &EnvironmentConfig {
        &self.config
    }

    pub fn venv_path(&self) -> &Path {
        &self.config.venv_path
    }

    pub fn python_path(&self) -> PathBuf {
        #[cfg(target_os = "windows")]
        let python_path = self.config.venv_path.join("Scripts").join("python.exe");
        #[cfg(not(target_os = "windows"))]
        let python_path = self.config.venv_path.join("bin").join("python");
        python_path
    }

    /// Current lifecycle state, from the in-flight operation or the disk.
    pub fn state(&self) -> EnvironmentState {
        match *self.operation.lock().unwrap() {
            Some(Operation::Creating) => return EnvironmentState::Creating,
            Some(Operation::Recreating) => return EnvironmentState::Recreating,
            None => {}
        }

        if !self.config.venv_path.exists() {
            EnvironmentState::Absent
        } else if self.python_path().exists() {
            EnvironmentState::Ready
        } else {
            EnvironmentState::Broken
        }
    }

    /// Create the virtual environment.
    ///
    /// Returns `Ok(true)` without running uv when a usable interpreter is
    /// already present.
    pub async fn create_environment(&self, handler: &dyn ProgressHandler) -> Result<bool> {
        let _guard = self.begin(Operation::Creating);

        if self.python_path().exists() {
            info!(
                "[venv] Using existing environment at {:?}",
                self.config.venv_path
            );
            self.report_ready(handler);
            return Ok(true);
        }

        info!("[venv] Creating environment at {:?}", self.config.venv_path);
        handler.on_progress(EnvProgressPhase::CreatingVenv);

        let args: Vec<OsString> = vec![
            "venv".into(),
            "--python".into(),
            self.config.python_version.clone().into(),
            "--python-preference".into(),
            "only-managed".into(),
            self.config.venv_path.clone().into(),
        ];
        let exit = self.run_uv(args, handler).await?;

        if exit.success() {
            self.report_ready(handler);
            Ok(true)
        } else {
            handler.on_progress(EnvProgressPhase::Error {
                message: format!("Failed to create virtual environment: {}", exit),
            });
            Ok(false)
        }
    }

    /// Delete the environment directory.
    ///
    /// `true` when the directory is gone afterwards (including when it never
    /// existed), `false` when removal failed.
    pub async fn remove_environment_directory(&self) -> bool {
        let venv_path = &self.config.venv_path;
        if !venv_path.exists() {
            return true;
        }

        match tokio::fs::remove_dir_all(venv_path).await {
            Ok(()) => {
                info!("[venv] Removed {:?}", venv_path);
                true
            }
            Err(e) => {
                warn!("[venv] Failed to remove {:?}: {}", venv_path, e);
                false
            }
        }
    }

    /// Remove, create, then upgrade pip. Stops at the first failure.
    pub async fn recreate_environment(&self, handler: &dyn ProgressHandler) -> Result<bool> {
        let _guard = self.begin(Operation::Recreating);

        handler.on_progress(EnvProgressPhase::RemovingVenv);
        if !self.remove_environment_directory().await {
            handler.on_progress(EnvProgressPhase::Error {
                message: format!(
                    "Failed to remove virtual environment at {:?}",
                    self.config.venv_path
                ),
            });
            return Ok(false);
        }

        if !self.create_environment(handler).await? {
            return Ok(false);
        }

        self.upgrade_core_packager(handler).await
    }

    /// Install torch for the configured device, then every requirements manifest.
    ///
    /// Stops at the first failing step and returns its exit info.
    pub async fn install_requirements(&self, handler: &dyn ProgressHandler) -> Result<ExitInfo> {
        let mut last = ExitInfo {
            code: Some(0),
            signal: None,
        };

        if self.config.device.installs_torch() {
            let mut args = self.pip_install_args();
            args.extend(TORCH_PACKAGES.iter().map(OsString::from));
            if let Some(index_url) = self.config.device.index_url() {
                args.push("--index-url".into());
                args.push(index_url.into());
            }

            handler.on_progress(EnvProgressPhase::InstallingPackages {
                packages: TORCH_PACKAGES.iter().map(|p| p.to_string()).collect(),
            });
            last = self.run_uv(args, handler).await?;
            if !last.success() {
                self.report_install_failure(handler, "torch", &last);
                return Ok(last);
            }
        }

        for manifest in &self.config.requirements {
            let mut args = self.pip_install_args();
            args.push("-r".into());
            args.push(manifest.clone().into());

            handler.on_progress(EnvProgressPhase::InstallingPackages {
                packages: vec![manifest.display().to_string()],
            });
            last = self.run_uv(args, handler).await?;
            if !last.success() {
                self.report_install_failure(handler, &manifest.display().to_string(), &last);
                return Ok(last);
            }
        }

        Ok(last)
    }

    /// `uv pip install --upgrade pip`.
    pub async fn upgrade_core_packager(&self, handler: &dyn ProgressHandler) -> Result<bool> {
        handler.on_progress(EnvProgressPhase::UpgradingPackager);

        let mut args = self.pip_install_args();
        args.push("--upgrade".into());
        args.push("pip".into());
        let exit = self.run_uv(args, handler).await?;

        if !exit.success() {
            handler.on_progress(EnvProgressPhase::Error {
                message: format!("Failed to upgrade pip: {}", exit),
            });
        }
        Ok(exit.success())
    }

    /// `uv cache clean`. Installed packages are untouched.
    pub async fn clear_package_cache(&self, handler: &dyn ProgressHandler) -> Result<bool> {
        handler.on_progress(EnvProgressPhase::ClearingCache);

        let exit = self
            .run_uv(vec!["cache".into(), "clean".into()], handler)
            .await?;
        if !exit.success() {
            handler.on_progress(EnvProgressPhase::Error {
                message: format!("Failed to clear package cache: {}", exit),
            });
        }
        Ok(exit.success())
    }

    /// Whether every requirements manifest is already satisfied.
    ///
    /// Runs a uv dry-run install; `false` when uv would change anything or
    /// the environment has no interpreter.
    pub async fn has_requirements(&self) -> Result<bool> {
        if !self.python_path().exists() {
            return Ok(false);
        }
        if self.config.requirements.is_empty() {
            return Ok(true);
        }

        let mut args = self.pip_install_args();
        args.push("--dry-run".into());
        for manifest in &self.config.requirements {
            args.push("-r".into());
            args.push(manifest.clone().into());
        }

        let lines = Mutex::new(Vec::new());
        let exit = run_streaming(self.uv_command(&args), |_, line| {
            if let Ok(mut lines) = lines.lock() {
                lines.push(line.to_string());
            }
        })
        .await
        .with_context(|| format!("Failed to run uv at {:?}", self.config.uv_path))?;

        let lines = lines.into_inner().unwrap_or_default();
        let satisfied = exit.success() && lines.iter().any(|l| l.contains(NOTHING_TO_INSTALL));
        if !satisfied {
            info!(
                "[venv] Requirements not satisfied ({}): {:?}",
                exit,
                lines.last()
            );
        }
        Ok(satisfied)
    }

    fn begin(&self, operation: Operation) -> OperationGuard<'_> {
        let mut slot = self.operation.lock().unwrap();
        let previous = *slot;
        // Creating inside a recreate keeps reporting Recreating.
        if previous != Some(Operation::Recreating) {
            *slot = Some(operation);
        }
        OperationGuard {
            slot: &self.operation,
            previous,
        }
    }

    fn pip_install_args(&self) -> Vec<OsString> {
        vec![
            "pip".into(),
            "install".into(),
            "--python".into(),
            self.python_path().into(),
        ]
    }

    fn uv_command(&self, args: &[OsString]) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.config.uv_path);
        cmd.args(args)
            .env("VIRTUAL_ENV", &self.config.venv_path)
            .env("UV_CACHE_DIR", &self.config.cache_dir)
            .env("UV_PYTHON_INSTALL_DIR", &self.config.python_install_dir);
        cmd
    }

    async fn run_uv(&self, args: Vec<OsString>, handler: &dyn ProgressHandler) -> Result<ExitInfo> {
        info!("[venv] uv {:?}", args);
        let exit = run_streaming(self.uv_command(&args), |stream, line| {
            handler.on_output(stream, line)
        })
        .await
        .with_context(|| format!("Failed to run uv at {:?}", self.config.uv_path))?;

        if !exit.success() {
            warn!("[venv] uv {:?} exited with {}", args.first(), exit);
        }
        Ok(exit)
    }

    fn report_ready(&self, handler: &dyn ProgressHandler) {
        handler.on_progress(EnvProgressPhase::Ready {
            env_path: self.config.venv_path.to_string_lossy().to_string(),
            python_path: self.python_path().to_string_lossy().to_string(),
        });
    }

    fn report_install_failure(&self, handler: &dyn ProgressHandler, what: &str, exit: &ExitInfo) {
        handler.on_progress(EnvProgressPhase::Error {
            message: format!("Failed to install {}: {}", what, exit),
        });
    }
}
