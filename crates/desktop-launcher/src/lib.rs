//! desktop-launcher - installs, validates and supervises the local backend
//! server for the desktop app.
//!
//! The launcher owns the user's installation (base directory layout, Python
//! environment, model paths config), decides on every start whether that
//! installation is usable, and runs the backend server until the app quits.
//! The UI talks to it through typed requests ([`protocol`]) and receives
//! output, validation reports and startup progress through the
//! [`observer::ObserverRegistry`].
//!
//! ```ignore
//! let app = DesktopApp::new(LauncherConfig::default(), AppState::initialize()?, ObserverRegistry::new());
//! match app.ensure_installed(&wizard).await? {
//!     InstallOutcome::Ready(_) => { app.start_server().await?; }
//!     InstallOutcome::NeedsRepair(_) => { /* offer troubleshooting */ }
//! }
//! ```

pub mod app;
pub mod app_state;
pub mod config;
pub mod events;
pub mod install_manager;
pub mod installation;
pub mod observer;
pub mod protocol;
pub mod server_config;
pub mod troubleshooting;
pub mod validation;

#[cfg(all(test, unix))]
pub(crate) mod test_support;

pub use app::DesktopApp;
pub use app_state::{AppState, AppStateError};
pub use config::{DesktopConfig, DevOverrides, LauncherConfig, LauncherPaths};
pub use install_manager::{
    InstallError, InstallHealth, InstallOptions, InstallOutcome, InstallWizard,
    InstallationManager,
};
pub use installation::{Installation, InstallationDescriptor};
pub use observer::{ChannelObserver, LauncherEvent, LauncherObserver, ObserverRegistry, Subscription};
pub use protocol::{Request, Response};
pub use troubleshooting::Troubleshooting;
pub use validation::{InstallationValidator, ValidationReport};
