//! Launcher configuration.
//!
//! Persisted state lives in a JSON file in the user's config directory:
//! - macOS: ~/Library/Application Support/desktop-launcher/config.json
//! - Linux: ~/.config/desktop-launcher/config.json
//! - Windows: C:\Users\<User>\AppData\Roaming\desktop-launcher\config.json
//!
//! Development overrides come from environment variables and are never
//! persisted.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use backend_env::TorchDevice;
use backend_launch::probe::{DEFAULT_PROBE_INTERVAL, DEFAULT_PROBE_TIMEOUT};
use backend_launch::supervisor::DEFAULT_KILL_TIMEOUT;
use backend_launch::LaunchArgs;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Directory name used under the platform config/data directories.
pub const APP_DIR_NAME: &str = "desktop-launcher";

/// Host the backend listens on unless configured otherwise.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// First port tried for the backend.
pub const DEFAULT_PORT: u16 = 8000;

pub const HOST_ENV: &str = "LAUNCHER_HOST";
pub const PORT_ENV: &str = "LAUNCHER_PORT";
pub const USE_EXTERNAL_SERVER_ENV: &str = "LAUNCHER_USE_EXTERNAL_SERVER";

/// How far the first-run flow got.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstallState {
    Started,
    Installed,
}

/// Persisted launcher state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DesktopConfig {
    #[serde(default)]
    pub install_state: Option<InstallState>,

    /// Root of the user's installation (models, inputs, outputs, venv).
    #[serde(default)]
    pub base_path: Option<PathBuf>,

    #[serde(default)]
    pub device: Option<TorchDevice>,

    /// Extra backend arguments; an empty value is a bare flag.
    #[serde(default)]
    pub launch_args: LaunchArgs,

    #[serde(default)]
    pub installed_at: Option<DateTime<Utc>>,
}

impl DesktopConfig {
    /// Load the config, returning defaults if the file doesn't exist.
    ///
    /// An existing file that cannot be read or parsed is an error.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read launcher config {:?}", path))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid launcher config {:?}", path))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Base path of a completed installation.
    pub fn installed_base_path(&self) -> Option<&Path> {
        match self.install_state {
            Some(InstallState::Installed) => self.base_path.as_deref(),
            _ => None,
        }
    }
}

/// Filesystem locations used by the launcher.
#[derive(Debug, Clone)]
pub struct LauncherPaths {
    /// Holds `config.json` and the generated model paths config.
    pub config_dir: PathBuf,
    /// Default parent for new installations.
    pub data_dir: PathBuf,
    /// Backend server logs.
    pub log_dir: PathBuf,
    /// App resources: bundled uv and the backend sources.
    pub resources_dir: PathBuf,
}

impl Default for LauncherPaths {
    fn default() -> Self {
        let data_dir = dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR_NAME);
        Self {
            config_dir: dirs::config_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(APP_DIR_NAME),
            log_dir: data_dir.join("logs"),
            data_dir,
            resources_dir: default_resources_dir(),
        }
    }
}

impl LauncherPaths {
    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.json")
    }

    pub fn extra_models_config(&self) -> PathBuf {
        self.config_dir.join("extra_models_config.yaml")
    }

    /// Base path suggested to the wizard for a new installation.
    pub fn suggested_base_path(&self) -> PathBuf {
        self.data_dir.join("backend")
    }
}

/// `resources/` next to the executable.
fn default_resources_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("resources")))
        .unwrap_or_else(|| PathBuf::from("resources"))
}

/// Backend sources shipped in the app resources.
#[derive(Debug, Clone)]
pub struct BackendResources {
    /// Directory containing the backend entry point and `requirements.txt`.
    pub server_dir: PathBuf,
    pub main_script: PathBuf,
    pub front_end_root: PathBuf,
}

impl BackendResources {
    pub fn from_resources_dir(resources_dir: &Path) -> Self {
        let server_dir = resources_dir.join("backend");
        Self {
            main_script: server_dir.join("main.py"),
            front_end_root: server_dir.join("web"),
            server_dir,
        }
    }

    /// Requirements manifests: the backend's own, then each bundled custom
    /// node's, sorted by node name.
    pub fn requirement_manifests(&self) -> Vec<PathBuf> {
        let mut manifests = vec![self.server_dir.join("requirements.txt")];

        let mut node_manifests: Vec<PathBuf> = std::fs::read_dir(self.server_dir.join("custom_nodes"))
            .into_iter()
            .flatten()
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path().join("requirements.txt"))
            .filter(|path| path.is_file())
            .collect();
        node_manifests.sort();

        manifests.extend(node_manifests);
        manifests
    }
}

/// Environment-variable overrides for development.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DevOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    /// Connect to a server started outside the launcher instead of spawning one.
    pub use_external_server: bool,
    pub uv_path: Option<PathBuf>,
}

impl DevOverrides {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build overrides from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let port = non_empty(PORT_ENV).and_then(|v| match v.trim().parse::<u16>() {
            Ok(port) if port != 0 => Some(port),
            _ => {
                log::warn!("[config] Ignoring invalid {}={:?}", PORT_ENV, v);
                None
            }
        });

        Self {
            host: non_empty(HOST_ENV),
            port,
            use_external_server: non_empty(USE_EXTERNAL_SERVER_ENV)
                .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
                .unwrap_or(false),
            uv_path: non_empty(backend_launch::tools::UV_PATH_ENV).map(PathBuf::from),
        }
    }
}

/// Timing knobs for the backend server.
#[derive(Debug, Clone)]
pub struct ServerTimings {
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub kill_timeout: Duration,
}

impl Default for ServerTimings {
    fn default() -> Self {
        Self {
            probe_interval: DEFAULT_PROBE_INTERVAL,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            kill_timeout: DEFAULT_KILL_TIMEOUT,
        }
    }
}

/// Everything the launcher needs to know at startup.
#[derive(Debug, Clone)]
pub struct LauncherConfig {
    pub paths: LauncherPaths,
    pub resources: BackendResources,
    pub overrides: DevOverrides,
    pub timings: ServerTimings,
}

impl LauncherConfig {
    pub fn new(paths: LauncherPaths, overrides: DevOverrides) -> Self {
        Self {
            resources: BackendResources::from_resources_dir(&paths.resources_dir),
            paths,
            overrides,
            timings: ServerTimings::default(),
        }
    }
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self::new(LauncherPaths::default(), DevOverrides::from_env())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn test_missing_config_loads_defaults() {
        let temp = TempDir::new().unwrap();
        let config = DesktopConfig::load(&temp.path().join("config.json")).unwrap();
        assert_eq!(config, DesktopConfig::default());
        assert!(config.installed_base_path().is_none());
    }

    #[test]
    fn test_config_roundtrip_keeps_arg_order() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("config.json");

        let config = DesktopConfig {
            install_state: Some(InstallState::Installed),
            base_path: Some(temp.path().join("base")),
            device: Some(TorchDevice::Nvidia),
            launch_args: [("port", "8188"), ("cpu", ""), ("listen", "0.0.0.0")]
                .into_iter()
                .collect(),
            installed_at: Some(Utc::now()),
        };
        config.save(&path).unwrap();

        let loaded = DesktopConfig::load(&path).unwrap();
        assert_eq!(loaded, config);
        let keys: Vec<_> = loaded.launch_args.iter().map(|(k, _)| k).collect();
        assert_eq!(keys, vec!["port", "cpu", "listen"]);
    }

    #[test]
    fn test_started_install_has_no_installed_base_path() {
        let config = DesktopConfig {
            install_state: Some(InstallState::Started),
            base_path: Some(PathBuf::from("/somewhere")),
            ..Default::default()
        };
        assert!(config.installed_base_path().is_none());
    }

    #[test]
    fn test_corrupt_config_is_an_error() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(DesktopConfig::load(&path).is_err());
    }

    #[test]
    fn test_dev_overrides_from_lookup() {
        let vars: HashMap<&str, &str> = [
            (HOST_ENV, "0.0.0.0"),
            (PORT_ENV, "9000"),
            (USE_EXTERNAL_SERVER_ENV, "true"),
        ]
        .into_iter()
        .collect();

        let overrides = DevOverrides::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(overrides.host.as_deref(), Some("0.0.0.0"));
        assert_eq!(overrides.port, Some(9000));
        assert!(overrides.use_external_server);
        assert_eq!(overrides.uv_path, None);
    }

    #[test]
    fn test_dev_overrides_reject_invalid_port() {
        let overrides = DevOverrides::from_lookup(|k| (k == PORT_ENV).then(|| "0".to_string()));
        assert_eq!(overrides.port, None);

        let overrides =
            DevOverrides::from_lookup(|k| (k == PORT_ENV).then(|| "not-a-port".to_string()));
        assert_eq!(overrides.port, None);
    }

    #[test]
    fn test_requirement_manifests_include_custom_nodes() {
        let temp = TempDir::new().unwrap();
        let resources = BackendResources::from_resources_dir(temp.path());
        for node in ["b-node", "a-node"] {
            let dir = resources.server_dir.join("custom_nodes").join(node);
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(dir.join("requirements.txt"), "").unwrap();
        }
        std::fs::create_dir_all(resources.server_dir.join("custom_nodes").join("no-reqs")).unwrap();

        let manifests = resources.requirement_manifests();
        assert_eq!(manifests.len(), 3);
        assert!(manifests[0].ends_with("backend/requirements.txt"));
        assert!(manifests[1].ends_with("a-node/requirements.txt"));
        assert!(manifests[2].ends_with("b-node/requirements.txt"));
    }
}
