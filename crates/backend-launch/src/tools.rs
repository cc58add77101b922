//! Lookup of the `uv` tool used to manage the backend's Python environment.
//!
//! Resolution order:
//! 1. An explicit override (`LAUNCHER_UV_PATH` or a configured path)
//! 2. The copy bundled with the app resources
//! 3. `uv` on PATH

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use log::info;
use tokio::sync::OnceCell;

use crate::process::configure_no_window;

/// Environment variable that forces a specific uv binary.
pub const UV_PATH_ENV: &str = "LAUNCHER_UV_PATH";

/// File name of the uv binary on this platform.
pub fn uv_binary_name() -> &'static str {
    if cfg!(windows) {
        "uv.exe"
    } else {
        "uv"
    }
}

/// Path of the bundled uv binary inside an app resources directory.
pub fn bundled_uv_path(resources_dir: &Path) -> PathBuf {
    let platform_dir = if cfg!(windows) {
        "win"
    } else if cfg!(target_os = "macos") {
        "macos"
    } else {
        "linux"
    };
    resources_dir
        .join("uv")
        .join(platform_dir)
        .join(uv_binary_name())
}

/// Check whether `uv --version` runs successfully with the given binary.
pub async fn check_uv_available(uv_path: &Path) -> bool {
    let mut cmd = tokio::process::Command::new(uv_path);
    cmd.arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    configure_no_window(&mut cmd);
    cmd.status().await.map(|s| s.success()).unwrap_or(false)
}

/// Global cache for the uv found on PATH.
static SYSTEM_UV_PATH: OnceCell<Arc<Result<PathBuf, String>>> = OnceCell::const_new();

/// Get the path to uv.
///
/// `resources_dir` is the app resources directory that may contain a bundled
/// copy. The PATH lookup is cached for subsequent calls.
pub async fn get_uv_path(resources_dir: Option<&Path>) -> Result<PathBuf> {
    if let Ok(path) = std::env::var(UV_PATH_ENV) {
        if !path.is_empty() {
            info!("[tools] Using uv from {}: {}", UV_PATH_ENV, path);
            return Ok(PathBuf::from(path));
        }
    }

    if let Some(dir) = resources_dir {
        let bundled = bundled_uv_path(dir);
        if bundled.exists() {
            info!("[tools] Using bundled uv at {:?}", bundled);
            return Ok(bundled);
        }
    }

    let result = SYSTEM_UV_PATH
        .get_or_init(|| async {
            let system = PathBuf::from(uv_binary_name());
            if check_uv_available(&system).await {
                info!("[tools] Using system uv");
                Arc::new(Ok(system))
            } else {
                Arc::new(Err("uv was not found in app resources or on PATH".to_string()))
            }
        })
        .await;

    match result.as_ref() {
        Ok(path) => Ok(path.clone()),
        Err(e) => Err(anyhow!("{}", e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundled_uv_path_layout() {
        let path = bundled_uv_path(Path::new("/resources"));
        assert!(path.starts_with("/resources/uv"));
        assert!(path.ends_with(uv_binary_name()));
    }

    #[tokio::test]
    async fn test_missing_binary_is_unavailable() {
        assert!(!check_uv_available(Path::new("/nonexistent/uv")).await);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_fake_uv_is_available() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let fake = dir.path().join("uv");
        std::fs::write(&fake, "#!/bin/sh\necho 'uv 0.5.0'\n").unwrap();
        std::fs::set_permissions(&fake, std::fs::Permissions::from_mode(0o755)).unwrap();

        assert!(check_uv_available(&fake).await);
    }
}
