//! Process-wide application state.
//!
//! Initialised exactly once; a second initialisation is an error. Components
//! receive the state through their constructors rather than reaching for a
//! global.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use backend_launch::ServerProgress;
use chrono::{DateTime, Utc};
use log::info;

use crate::install_manager::InstallHealth;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AppStateError {
    #[error("AppState already initialized")]
    AlreadyInitialized,
}

static APP_STATE: OnceLock<Arc<AppState>> = OnceLock::new();

pub struct AppState {
    started_at: DateTime<Utc>,
    quitting: AtomicBool,
    loaded: AtomicBool,
    install_health: Mutex<InstallHealth>,
    server_progress: Mutex<Option<ServerProgress>>,
}

impl AppState {
    /// Create and register the process-wide state.
    pub fn initialize() -> Result<Arc<AppState>, AppStateError> {
        Self::initialize_in(&APP_STATE)
    }

    /// Like [`AppState::initialize`] but with an explicit cell.
    pub fn initialize_in(cell: &OnceLock<Arc<AppState>>) -> Result<Arc<AppState>, AppStateError> {
        let state = Arc::new(Self::new());
        cell.set(state.clone())
            .map_err(|_| AppStateError::AlreadyInitialized)?;
        info!("[app-state] Initialized");
        Ok(state)
    }

    /// Unregistered state, for embedding and tests.
    pub fn new() -> Self {
        Self {
            started_at: Utc::now(),
            quitting: AtomicBool::new(false),
            loaded: AtomicBool::new(false),
            install_health: Mutex::new(InstallHealth::Unknown),
            server_progress: Mutex::new(None),
        }
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn is_quitting(&self) -> bool {
        self.quitting.load(Ordering::SeqCst)
    }

    pub fn set_quitting(&self) {
        self.quitting.store(true, Ordering::SeqCst);
    }

    /// Whether the backend finished loading at least once this session.
    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    pub fn install_health(&self) -> InstallHealth {
        self.install_health
            .lock()
            .map(|h| *h)
            .unwrap_or(InstallHealth::Unknown)
    }

    pub fn set_install_health(&self, health: InstallHealth) {
        if let Ok(mut current) = self.install_health.lock() {
            *current = health;
        }
    }

    pub fn server_progress(&self) -> Option<ServerProgress> {
        self.server_progress.lock().ok().and_then(|p| *p)
    }

    pub fn set_server_progress(&self, progress: ServerProgress) {
        if progress == ServerProgress::Ready {
            self.loaded.store(true, Ordering::SeqCst);
        }
        if let Ok(mut current) = self.server_progress.lock() {
            *current = Some(progress);
        }
    }
}

impl Default for AppState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_double_initialization_fails() {
        let cell = OnceLock::new();
        let first = AppState::initialize_in(&cell).unwrap();

        let second = AppState::initialize_in(&cell);
        assert_eq!(second.err(), Some(AppStateError::AlreadyInitialized));
        assert_eq!(
            AppStateError::AlreadyInitialized.to_string(),
            "AppState already initialized"
        );
        assert!(Arc::ptr_eq(&first, cell.get().unwrap()));
    }

    #[test]
    fn test_ready_progress_marks_loaded() {
        let state = AppState::new();
        assert!(!state.is_loaded());
        assert_eq!(state.server_progress(), None);

        state.set_server_progress(ServerProgress::StartingServer);
        assert!(!state.is_loaded());
        state.set_server_progress(ServerProgress::Ready);
        assert!(state.is_loaded());
        assert_eq!(state.server_progress(), Some(ServerProgress::Ready));
    }

    #[test]
    fn test_quitting_flag() {
        let state = AppState::default();
        assert!(!state.is_quitting());
        state.set_quitting();
        assert!(state.is_quitting());
    }
}
