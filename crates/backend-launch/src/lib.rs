//! Backend server launching and supervision for the desktop launcher.
//!
//! This crate owns everything that touches the backend child process or the
//! network in front of it. It includes:
//!
//! - Free port discovery for the backend listen address
//! - Launch argument construction (core arguments always win)
//! - A streaming command runner shared with environment management
//! - The readiness health probe
//! - Rotated on-disk logs for backend output
//! - `uv` tool lookup
//! - The [`ServerSupervisor`] state machine (start / probe / kill)
//!
//! # Supervising a server
//!
//! ```ignore
//! use backend_launch::{ServerArgs, ServerSupervisor, SupervisorConfig};
//!
//! let supervisor = ServerSupervisor::new(config, observer);
//! supervisor.start(ServerArgs::new("127.0.0.1", 8188)).await?;
//! // ... backend is ready and answering the probe ...
//! supervisor.kill().await?;
//! ```

pub mod args;
pub mod log_files;
pub mod ports;
pub mod probe;
pub mod process;
pub mod supervisor;
pub mod tools;

// Re-export commonly used items
pub use args::{build_launch_args, CoreLaunchPaths, LaunchArgs, ServerArgs};
pub use ports::{find_available_port, next_port_range, PortError};
pub use probe::HealthProbe;
pub use process::{run_streaming, ExitInfo, OutputStream};
pub use supervisor::{
    ServerCommand, ServerObserver, ServerProgress, ServerState, ServerSupervisor,
    SupervisorConfig, SupervisorError,
};
pub use tools::get_uv_path;
