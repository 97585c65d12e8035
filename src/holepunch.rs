//! NAT hole-punch emitter
//!
//! Sends a small UDP datagram from the fixed source port toward the
//! server's WireGuard endpoint once per second, opening a NAT pinhole on
//! that port before the WireGuard device takes it over. The supervisor
//! cancels this loop and awaits its join handle before constructing the
//! device; the two never hold the port simultaneously.

use crate::error::{OlmError, Result};
use serde::Serialize;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

/// Emission cadence
const PUNCH_INTERVAL: Duration = Duration::from_secs(1);

/// WireGuard port of the coordinating server the pinhole is opened toward
const PUNCH_PORT: u16 = 51820;

#[derive(Serialize)]
struct PunchPayload<'a> {
    #[serde(rename = "olmId")]
    olm_id: &'a str,
}

/// Derive the UDP target from the control-plane endpoint URL
pub fn punch_target(endpoint: &str) -> Result<String> {
    let url = Url::parse(endpoint)
        .map_err(|e| OlmError::Config(format!("Invalid endpoint '{}': {}", endpoint, e)))?;
    let host = url
        .host_str()
        .ok_or_else(|| OlmError::Config(format!("Endpoint '{}' has no host", endpoint)))?;
    Ok(format!("{}:{}", host, PUNCH_PORT))
}

/// Spawn the hole-punch loop bound to the fixed source port
pub fn spawn(
    endpoint: String,
    olm_id: String,
    source_port: u16,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = run(&endpoint, &olm_id, source_port, cancel).await {
            warn!("Hole-punch loop exited with error: {}", e);
        }
    })
}

async fn run(
    endpoint: &str,
    olm_id: &str,
    source_port: u16,
    cancel: CancellationToken,
) -> Result<()> {
    let target = punch_target(endpoint)?;
    let socket = UdpSocket::bind(("0.0.0.0", source_port)).await.map_err(|e| {
        OlmError::Transport(format!(
            "Failed to bind hole-punch socket to port {}: {}",
            source_port, e
        ))
    })?;

    let payload = serde_json::to_vec(&PunchPayload { olm_id })?;
    info!("Hole punching {} from source port {}", target, source_port);

    let mut interval = time::interval(PUNCH_INTERVAL);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                // Resolution happens per send so DNS changes are picked up
                if let Err(e) = socket.send_to(&payload, target.as_str()).await {
                    debug!("Hole-punch send to {} failed: {}", target, e);
                }
            }
            _ = cancel.cancelled() => break,
        }
    }

    info!("Hole-punch loop stopped, source port {} released", source_port);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_punch_target_from_https_endpoint() {
        assert_eq!(
            punch_target("https://p.example").unwrap(),
            "p.example:51820"
        );
    }

    #[test]
    fn test_punch_target_ignores_http_port() {
        // The pinhole targets the WireGuard port, not the API port
        assert_eq!(
            punch_target("https://p.example:3000").unwrap(),
            "p.example:51820"
        );
    }

    #[test]
    fn test_punch_target_rejects_garbage() {
        assert!(punch_target("not a url").is_err());
    }

    #[tokio::test]
    async fn test_loop_stops_on_cancel() {
        let cancel = CancellationToken::new();
        let handle = spawn(
            "https://127.0.0.1".to_string(),
            "olm-1".to_string(),
            0, // ephemeral port keeps the test hermetic
            cancel.clone(),
        );

        time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop should stop promptly after cancel")
            .unwrap();
    }
}
