//! Free port discovery for the backend listen address.
//!
//! The scan binds a throwaway listener on each candidate and releases it
//! immediately. Another process may take the port before the backend binds
//! it; that shows up as a start failure and the caller retries with
//! [`next_port_range`].

use std::time::Duration;

use log::{debug, info};
use tokio::net::TcpListener;

/// Upper bound for a single bind attempt.
const BIND_TIMEOUT: Duration = Duration::from_secs(2);

/// Width of the range scanned by default (`port..port + 1000`).
pub const DEFAULT_PORT_SPAN: u16 = 1000;

/// Error returned when no port in the requested range could be bound.
#[derive(Debug, thiserror::Error)]
pub enum PortError {
    #[error("No available port on {host} in range {start}..{end}")]
    NoAvailablePort { host: String, start: u16, end: u16 },
}

/// Find the first port in `[start, end_exclusive)` that can be bound on `host`.
///
/// Ports are tried in ascending order. Port 0 is never returned.
pub async fn find_available_port(
    host: &str,
    start: u16,
    end_exclusive: u16,
) -> Result<u16, PortError> {
    for port in start.max(1)..end_exclusive {
        if try_bind(host, port).await {
            info!("[ports] Found available port {} on {}", port, host);
            return Ok(port);
        }
    }

    Err(PortError::NoAvailablePort {
        host: host.to_string(),
        start,
        end: end_exclusive,
    })
}

/// Compute the default scan range starting at `port`, clamped to the valid range.
pub fn next_port_range(port: u16) -> (u16, u16) {
    let start = port.max(1);
    (start, start.saturating_add(DEFAULT_PORT_SPAN))
}

async fn try_bind(host: &str, port: u16) -> bool {
    match tokio::time::timeout(BIND_TIMEOUT, TcpListener::bind((host, port))).await {
        Ok(Ok(listener)) => {
            drop(listener);
            true
        }
        Ok(Err(e)) => {
            debug!("[ports] {}:{} unavailable: {}", host, port, e);
            false
        }
        Err(_) => {
            debug!("[ports] {}:{} bind timed out", host, port);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_returns_port_inside_range() {
        let port = find_available_port("127.0.0.1", 40000, 40100).await.unwrap();
        assert!((40000..40100).contains(&port));
    }

    #[tokio::test]
    async fn test_skips_bound_port() {
        let held = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let taken = held.local_addr().unwrap().port();

        let port = find_available_port("127.0.0.1", taken, taken.saturating_add(50))
            .await
            .unwrap();
        assert_ne!(port, taken);
        assert!(port > taken);
    }

    #[tokio::test]
    async fn test_all_ports_bound_fails() {
        let held = TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let taken = held.local_addr().unwrap().port();

        let result = find_available_port("127.0.0.1", taken, taken + 1).await;
        assert!(matches!(
            result,
            Err(PortError::NoAvailablePort { start, end, .. }) if start == taken && end == taken + 1
        ));
    }

    #[tokio::test]
    async fn test_empty_range_fails() {
        let result = find_available_port("127.0.0.1", 8188, 8188).await;
        assert!(result.is_err());
    }

    #[test]
    fn test_next_port_range_clamps() {
        assert_eq!(next_port_range(8188), (8188, 9188));
        assert_eq!(next_port_range(65000), (65000, 65535));
        assert_eq!(next_port_range(0), (1, 1001));
    }
}
