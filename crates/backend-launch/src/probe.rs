//! Readiness health probe for the backend HTTP server.
//!
//! The backend is ready once `GET {base_url}/queue` returns any non-error
//! response. Refused connections and request timeouts mean "not yet ready".

use std::time::{Duration, Instant};

use log::debug;

/// Liveness path documented by the backend.
pub const READINESS_PATH: &str = "/queue";

/// Default interval between probe attempts.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(1);

/// Default upper bound on how long to wait for readiness.
///
/// First start can install extra dependencies inside the backend itself,
/// which can take a very long time.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Timeout for a single HTTP request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Error returned when the probe never succeeded.
#[derive(Debug, thiserror::Error)]
#[error("{url} did not become ready within {timeout:?}")]
pub struct ProbeTimeout {
    pub url: String,
    pub timeout: Duration,
}

/// Polling HTTP probe against the backend's liveness endpoint.
#[derive(Debug, Clone)]
pub struct HealthProbe {
    client: reqwest::Client,
    url: String,
    interval: Duration,
    timeout: Duration,
}

impl HealthProbe {
    pub fn new(base_url: &str, interval: Duration, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .no_proxy()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            url: format!("{}{}", base_url.trim_end_matches('/'), READINESS_PATH),
            interval,
            timeout,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Single attempt. Returns `true` if the backend answered without an error status.
    pub async fn check(&self) -> bool {
        match self.client.get(&self.url).send().await {
            Ok(response) => {
                let status = response.status();
                !(status.is_client_error() || status.is_server_error())
            }
            Err(e) => {
                debug!("[probe] {} not ready: {}", self.url, e);
                false
            }
        }
    }

    /// Poll until the backend is ready or the timeout elapses.
    pub async fn wait_until_ready(&self) -> Result<(), ProbeTimeout> {
        let started = Instant::now();
        loop {
            if self.check().await {
                return Ok(());
            }
            if started.elapsed() >= self.timeout {
                return Err(ProbeTimeout {
                    url: self.url.clone(),
                    timeout: self.timeout,
                });
            }
            tokio::time::sleep(self.interval).await;
        }
    }
}
