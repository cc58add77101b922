//! Observer registry: fan-out of launcher events to any number of listeners.
//!
//! The registry implements the backend crates' callback traits, so it can be
//! handed directly to the server supervisor and to environment operations.
//! Listeners are called synchronously on the producing task and must not
//! block; [`ChannelObserver`] forwards into a channel for async consumers.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, Weak};

use backend_env::{EnvProgressPhase, LogHandler, ProgressHandler};
use backend_launch::{OutputStream, ServerObserver, ServerProgress};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::validation::ValidationReport;

/// Receiver of launcher events. All methods default to no-ops.
pub trait LauncherObserver: Send + Sync {
    fn on_output(&self, _line: &str) {}
    fn on_validation_update(&self, _report: &ValidationReport) {}
    fn on_server_progress(&self, _status: ServerProgress) {}
}

type Entry = (u64, Arc<dyn LauncherObserver>);

#[derive(Default)]
pub struct ObserverRegistry {
    next_id: AtomicU64,
    observers: RwLock<Vec<Entry>>,
}

impl ObserverRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register `observer` until the returned guard is dropped.
    #[must_use = "dropping the subscription unsubscribes immediately"]
    pub fn subscribe(self: &Arc<Self>, observer: Arc<dyn LauncherObserver>) -> Subscription {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut observers) = self.observers.write() {
            observers.push((id, observer));
        }
        Subscription {
            registry: Arc::downgrade(self),
            id,
        }
    }

    pub fn len(&self) -> usize {
        self.observers.read().map(|o| o.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn notify_output(&self, line: &str) {
        for observer in self.snapshot() {
            observer.on_output(line);
        }
    }

    pub fn notify_validation(&self, report: &ValidationReport) {
        for observer in self.snapshot() {
            observer.on_validation_update(report);
        }
    }

    pub fn notify_server_progress(&self, status: ServerProgress) {
        for observer in self.snapshot() {
            observer.on_server_progress(status);
        }
    }

    // Listeners may unsubscribe from inside a callback.
    fn snapshot(&self) -> Vec<Arc<dyn LauncherObserver>> {
        self.observers
            .read()
            .map(|o| o.iter().map(|(_, obs)| obs.clone()).collect())
            .unwrap_or_default()
    }

    fn unsubscribe(&self, id: u64) {
        if let Ok(mut observers) = self.observers.write() {
            observers.retain(|(i, _)| *i != id);
        }
    }
}

impl ServerObserver for ObserverRegistry {
    fn on_output(&self, line: &str) {
        self.notify_output(line);
    }

    fn on_server_progress(&self, status: ServerProgress) {
        self.notify_server_progress(status);
    }
}

impl ProgressHandler for ObserverRegistry {
    fn on_progress(&self, phase: EnvProgressPhase) {
        LogHandler.on_progress(phase.clone());
        if let EnvProgressPhase::Error { message } = phase {
            self.notify_output(&message);
        }
    }

    fn on_output(&self, _stream: OutputStream, line: &str) {
        self.notify_output(line);
    }
}

/// Keeps an observer registered; unsubscribes on drop.
pub struct Subscription {
    registry: Weak<ObserverRegistry>,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unsubscribe(self.id);
        }
    }
}

/// Launcher event as delivered to channel consumers.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LauncherEvent {
    Output { line: String },
    Validation { report: ValidationReport },
    ServerProgress { status: ServerProgress },
}

/// Forwards every event into an unbounded channel.
pub struct ChannelObserver {
    tx: mpsc::UnboundedSender<LauncherEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<LauncherEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Self { tx }), rx)
    }
}

impl LauncherObserver for ChannelObserver {
    fn on_output(&self, line: &str) {
        let _ = self.tx.send(LauncherEvent::Output {
            line: line.to_string(),
        });
    }

    fn on_validation_update(&self, report: &ValidationReport) {
        let _ = self.tx.send(LauncherEvent::Validation {
            report: report.clone(),
        });
    }

    fn on_server_progress(&self, status: ServerProgress) {
        let _ = self.tx.send(LauncherEvent::ServerProgress { status });
    }
}
