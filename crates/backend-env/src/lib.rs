//! Python dependency environment management for the desktop backend.
//!
//! This crate owns the isolated virtual environment the backend server runs
//! in. It includes:
//!
//! - A progress reporting trait for environment lifecycle events
//! - Hardware device selection for the PyTorch package index
//! - `uv` driven creation, repair and package installation
//!
//! # Progress Reporting
//!
//! Every operation accepts a [`ProgressHandler`] that receives coarse phases
//! and each output line of the underlying `uv` invocation as it arrives.
//!
//! ```ignore
//! use backend_env::{DependencyEnvironment, EnvironmentConfig, LogHandler};
//!
//! let env = DependencyEnvironment::new(EnvironmentConfig::new(base_path, uv_path));
//! env.create_environment(&LogHandler).await?;
//! ```

pub mod device;
pub mod progress;
pub mod venv;

// Re-export key types
pub use device::TorchDevice;
pub use progress::{EnvProgressPhase, LogHandler, ProgressHandler};
pub use venv::{DependencyEnvironment, EnvironmentConfig, EnvironmentState};
