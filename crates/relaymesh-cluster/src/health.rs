//! HTTP health probing with countdown-based (not backoff-based) node
//! liveness tracking: a node's countdown initializes to the configured
//! threshold, decrements on every failed probe, resets to the threshold
//! on a success, and is treated as down once it reaches zero.

use std::time::Duration;

use http_body_util::Empty;
use tracing::debug;

/// Result of a single HTTP health probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeResult {
    Reachable,
    Unreachable,
}

/// Countdown-based liveness tracker for one node's health endpoint.
#[derive(Debug, Clone, Copy)]
pub struct NodeHealth {
    threshold: u32,
    countdown: u32,
}

impl NodeHealth {
    pub fn new(threshold: u32) -> Self {
        Self {
            threshold,
            countdown: threshold,
        }
    }

    /// Record a probe result; returns whether the node is now down
    /// (countdown has reached zero).
    pub fn record(&mut self, result: ProbeResult) -> bool {
        match result {
            ProbeResult::Reachable => self.countdown = self.threshold,
            ProbeResult::Unreachable => self.countdown = self.countdown.saturating_sub(1),
        }
        self.is_down()
    }

    pub fn is_down(&self) -> bool {
        self.countdown == 0
    }

    pub fn countdown(&self) -> u32 {
        self.countdown
    }
}

/// GET `http://<ip>:<health_port>/`; reachable iff the response status
/// is 200. No response body is required or read beyond the status
/// line's headers.
pub async fn http_probe(ip: &str, health_port: u16, timeout: Duration) -> ProbeResult {
    let address = format!("{ip}:{health_port}");
    let uri = format!("http://{address}/");

    let probe = tokio::time::timeout(timeout, async {
        let stream = match tokio::net::TcpStream::connect(&address).await {
            Ok(s) => s,
            Err(e) => {
                debug!(error = %e, %uri, "node health probe connection failed");
                return ProbeResult::Unreachable;
            }
        };

        let io = hyper_util::rt::TokioIo::new(stream);
        let (mut sender, conn) = match hyper::client::conn::http1::handshake(io).await {
            Ok(pair) => pair,
            Err(e) => {
                debug!(error = %e, %uri, "node health probe handshake failed");
                return ProbeResult::Unreachable;
            }
        };

        tokio::spawn(async move {
            let _ = conn.await;
        });

        let req = http::Request::builder()
            .method("GET")
            .uri(&uri)
            .header("host", &address)
            .body(Empty::<bytes::Bytes>::new())
            .expect("well-formed health probe request");

        match sender.send_request(req).await {
            Ok(resp) if resp.status() == http::StatusCode::OK => ProbeResult::Reachable,
            Ok(resp) => {
                debug!(status = %resp.status(), %uri, "node health probe non-200");
                ProbeResult::Unreachable
            }
            Err(e) => {
                debug!(error = %e, %uri, "node health probe request failed");
                ProbeResult::Unreachable
            }
        }
    })
    .await;

    probe.unwrap_or_else(|_| {
        debug!(%uri, "node health probe timed out");
        ProbeResult::Unreachable
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn countdown_starts_at_threshold() {
        let health = NodeHealth::new(3);
        assert_eq!(health.countdown(), 3);
        assert!(!health.is_down());
    }

    #[test]
    fn unreachable_decrements_until_down() {
        let mut health = NodeHealth::new(2);
        assert!(!health.record(ProbeResult::Unreachable));
        assert_eq!(health.countdown(), 1);
        assert!(health.record(ProbeResult::Unreachable));
        assert_eq!(health.countdown(), 0);
        assert!(health.is_down());
    }

    #[test]
    fn reachable_resets_countdown_to_threshold() {
        let mut health = NodeHealth::new(3);
        health.record(ProbeResult::Unreachable);
        health.record(ProbeResult::Unreachable);
        assert_eq!(health.countdown(), 1);

        health.record(ProbeResult::Reachable);
        assert_eq!(health.countdown(), 3);
        assert!(!health.is_down());
    }

    #[test]
    fn countdown_never_underflows_past_zero() {
        let mut health = NodeHealth::new(1);
        health.record(ProbeResult::Unreachable);
        health.record(ProbeResult::Unreachable);
        health.record(ProbeResult::Unreachable);
        assert_eq!(health.countdown(), 0);
    }
}
