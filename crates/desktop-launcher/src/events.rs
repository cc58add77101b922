//! Tracked operations.
//!
//! [`track`] wraps an async operation and emits one `started` event and one
//! `succeeded` or `failed` event on the `launcher::events` log target.

use std::fmt::Display;
use std::future::Future;
use std::time::Instant;

/// Log target for tracked events.
pub const EVENTS_TARGET: &str = "launcher::events";

/// Outcome of a tracked operation.
pub trait TrackedOutcome {
    /// `None` on success, otherwise a short failure description.
    fn failure(&self) -> Option<String>;
}

impl<E: Display> TrackedOutcome for Result<(), E> {
    fn failure(&self) -> Option<String> {
        self.as_ref().err().map(|e| e.to_string())
    }
}

/// `Ok(false)` is a failed operation that did not error.
impl<E: Display> TrackedOutcome for Result<bool, E> {
    fn failure(&self) -> Option<String> {
        match self {
            Ok(true) => None,
            Ok(false) => Some("operation reported failure".to_string()),
            Err(e) => Some(e.to_string()),
        }
    }
}

/// Run `operation`, logging `<name> started` and then its outcome.
pub async fn track<F, O>(name: &str, operation: F) -> O
where
    F: Future<Output = O>,
    O: TrackedOutcome,
{
    log::info!(target: EVENTS_TARGET, "{name} started");
    let started = Instant::now();

    let outcome = operation.await;
    let elapsed_ms = started.elapsed().as_millis();
    match outcome.failure() {
        None => log::info!(target: EVENTS_TARGET, "{name} succeeded in {elapsed_ms}ms"),
        Some(reason) => {
            log::warn!(target: EVENTS_TARGET, "{name} failed after {elapsed_ms}ms: {reason}")
        }
    }
    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_track_passes_result_through() {
        let ok: Result<bool, String> = track("test:ok", async { Ok(true) }).await;
        assert_eq!(ok, Ok(true));

        let err: Result<(), String> = track("test:err", async { Err("boom".to_string()) }).await;
        assert_eq!(err, Err("boom".to_string()));
    }

    #[test]
    fn test_failure_classification() {
        assert_eq!(Ok::<bool, String>(true).failure(), None);
        assert!(Ok::<bool, String>(false).failure().is_some());
        assert_eq!(
            Err::<(), String>("nope".to_string()).failure().as_deref(),
            Some("nope")
        );
    }
}
