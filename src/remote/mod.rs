//! Authenticated, encrypted channel between beacons.
//!
//! [`session`] drives the initiating side (PROBE, key exchange, AUTH, JOB,
//! DONE), [`responder`] answers those steps on the receiving side, and
//! [`link`] moves frames for both.

pub mod link;
pub mod responder;
pub mod session;

use std::time::Duration;

use tokio::net::TcpStream;

use crate::error::{CohortError, Result};

pub use link::{LinkEvent, PeerLink};
pub use responder::Responder;
pub use session::PeerSession;

/// Progress of one beacon-to-beacon link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Connecting,
    Probed,
    KeyExchanged,
    Authorized,
    JobAssigned,
    Draining,
    Closed,
}

/// Open a TCP connection to `host`, retrying a bounded number of times.
pub async fn connect_with_retry(host: &str, attempts: u32, delay: Duration) -> Result<TcpStream> {
    let mut last_error = None;
    for attempt in 1..=attempts.max(1) {
        match TcpStream::connect(host).await {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                return Ok(stream);
            }
            Err(e) => {
                tracing::debug!(host, attempt, error = %e, "Connection attempt failed");
                last_error = Some(e);
                if attempt < attempts {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
    let reason = last_error
        .map(|e| e.to_string())
        .unwrap_or_else(|| "no connection attempt made".to_string());
    Err(CohortError::LostConnection(format!(
        "{} is unreachable: {}",
        host, reason
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_host_names_address() {
        // Bind then drop to get a port nothing listens on.
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = connect_with_retry(&addr, 2, Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with(&addr));
    }
}
