//! Hardware device selection for the PyTorch packages.

use std::process::Stdio;

use serde::{Deserialize, Serialize};

/// Package names installed from the device-specific index.
pub const TORCH_PACKAGES: &[&str] = &["torch", "torchvision", "torchaudio"];

/// Compute device the backend will run on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TorchDevice {
    Nvidia,
    Mps,
    #[default]
    Cpu,
    /// User-managed torch; nothing device-specific is installed.
    Unsupported,
}

impl TorchDevice {
    /// Package index serving torch builds for this device.
    ///
    /// `None` means the default index (Apple builds ship on PyPI).
    pub fn index_url(&self) -> Option<&'static str> {
        match self {
            TorchDevice::Nvidia => Some("https://download.pytorch.org/whl/cu128"),
            TorchDevice::Cpu => Some("https://download.pytorch.org/whl/cpu"),
            TorchDevice::Mps | TorchDevice::Unsupported => None,
        }
    }

    /// Whether torch packages should be installed at all.
    pub fn installs_torch(&self) -> bool {
        !matches!(self, TorchDevice::Unsupported)
    }

    /// Best guess for this machine: Apple silicon, then an NVIDIA driver, then CPU.
    pub async fn detect() -> Self {
        if cfg!(all(target_os = "macos", target_arch = "aarch64")) {
            return TorchDevice::Mps;
        }

        let mut cmd = tokio::process::Command::new("nvidia-smi");
        cmd.stdout(Stdio::null()).stderr(Stdio::null());
        backend_launch::process::configure_no_window(&mut cmd);
        let has_nvidia = cmd.status().await.map(|s| s.success()).unwrap_or(false);

        if has_nvidia {
            log::info!("[device] NVIDIA driver detected");
            TorchDevice::Nvidia
        } else {
            TorchDevice::Cpu
        }
    }
}

impl std::fmt::Display for TorchDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TorchDevice::Nvidia => write!(f, "nvidia"),
            TorchDevice::Mps => write!(f, "mps"),
            TorchDevice::Cpu => write!(f, "cpu"),
            TorchDevice::Unsupported => write!(f, "unsupported"),
        }
    }
}
