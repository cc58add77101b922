//! Fakes shared by the unit tests: a scripted `uv`, wizards and a launcher
//! config rooted in a temp directory.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use backend_env::TorchDevice;
use futures::future::BoxFuture;
use tempfile::TempDir;

use crate::config::{DevOverrides, LauncherConfig, LauncherPaths};
use crate::install_manager::{InstallOptions, InstallWizard};

/// Stand-in for uv. Exits 1 for the subcommand named in `fail_on`.
///
/// `venv` creates an interpreter script that records its arguments in
/// `<venv>/../backend-args` and then sleeps.
pub fn fake_uv(dir: &Path, fail_on: &str) -> PathBuf {
    let script = format!(
        r#"#!/bin/sh
if [ "$1" = "{fail_on}" ]; then
  echo "error: $1 failed" >&2
  exit 1
fi
case "$1" in
  venv)
    for last; do :; done
    mkdir -p "$last/bin"
    printf '#!/bin/sh\necho "$@" > "%s/../backend-args"\nexec sleep 60\n' "$last" > "$last/bin/python"
    chmod +x "$last/bin/python"
    ;;
  pip)
    case " $* " in
      *" --dry-run "*)
        if [ -f "$VIRTUAL_ENV/installed" ]; then
          echo "Would make no changes"
        else
          echo "Would install 2 packages"
        fi
        ;;
      *" -r "*)
        touch "$VIRTUAL_ENV/installed"
        ;;
    esac
    ;;
  cache)
    rm -rf "$UV_CACHE_DIR"
    ;;
esac
"#,
        fail_on = fail_on,
    );
    let bin = dir.join("bin");
    std::fs::create_dir_all(&bin).unwrap();
    let path = bin.join("uv");
    std::fs::write(&path, script).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// Launcher config with every directory inside `temp` and a minimal backend.
pub fn launcher_config(temp: &TempDir, uv_path: PathBuf) -> LauncherConfig {
    let root = temp.path();
    let paths = LauncherPaths {
        config_dir: root.join("config"),
        data_dir: root.join("data"),
        log_dir: root.join("logs"),
        resources_dir: root.join("resources"),
    };
    let overrides = DevOverrides {
        uv_path: Some(uv_path),
        ..Default::default()
    };
    let mut config = LauncherConfig::new(paths, overrides);

    std::fs::create_dir_all(&config.resources.front_end_root).unwrap();
    std::fs::write(config.resources.server_dir.join("requirements.txt"), "pyyaml\n").unwrap();
    std::fs::write(&config.resources.main_script, "").unwrap();

    config.timings.probe_interval = Duration::from_millis(50);
    config.timings.probe_timeout = Duration::from_secs(10);
    config.timings.kill_timeout = Duration::from_secs(5);
    config
}

/// Always answers with the same options.
pub struct FixedWizard(pub InstallOptions);

impl FixedWizard {
    pub fn new(base_path: &Path) -> Self {
        Self(InstallOptions {
            base_path: base_path.to_path_buf(),
            device: TorchDevice::Cpu,
            migration_source: None,
            extra_launch_args: None,
        })
    }
}

impl InstallWizard for FixedWizard {
    fn request_options<'a>(
        &'a self,
        _suggested_base_path: &'a Path,
    ) -> BoxFuture<'a, anyhow::Result<InstallOptions>> {
        Box::pin(async move { Ok(self.0.clone()) })
    }
}

/// Fails if asked; the user cancelled.
pub struct NoWizard;

impl InstallWizard for NoWizard {
    fn request_options<'a>(
        &'a self,
        _suggested_base_path: &'a Path,
    ) -> BoxFuture<'a, anyhow::Result<InstallOptions>> {
        Box::pin(async { Err(anyhow::anyhow!("install cancelled")) })
    }
}
