//! Local status and command surface
//!
//! A small HTTP server for local consumers: `GET /status` returns the
//! connection and per-peer reachability snapshot, `POST /connect` feeds
//! startup credentials to the supervisor. The supervisor pushes peer
//! updates into the shared snapshot; the server only ever reads it.

use crate::control::message::SiteId;
use crate::error::{OlmError, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Credentials pushed in via `POST /connect`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectRequest {
    /// Client identifier
    pub id: String,
    /// Client secret
    pub secret: String,
    /// Control-plane endpoint
    pub endpoint: String,
}

/// Reachability of one site as exposed over HTTP
#[derive(Debug, Clone, Serialize)]
pub struct PeerStatus {
    /// Site identifier
    #[serde(rename = "siteId")]
    pub site_id: SiteId,
    /// Whether probes currently succeed
    pub connected: bool,
    /// Last observed round-trip time in milliseconds
    #[serde(rename = "rttMs")]
    pub rtt_ms: Option<u64>,
}

/// The full status snapshot returned by `GET /status`
#[derive(Debug, Clone, Default, Serialize)]
pub struct StatusSnapshot {
    /// Whether the control channel is connected
    pub connected: bool,
    /// Per-site reachability, ordered by site id
    pub peers: BTreeMap<SiteId, PeerStatus>,
}

/// Writer half of the status surface, held by the supervisor
#[derive(Clone)]
pub struct StatusHandle {
    snapshot: Arc<RwLock<StatusSnapshot>>,
    connect_tx: mpsc::Sender<ConnectRequest>,
}

impl StatusHandle {
    /// Record a peer reachability update
    pub fn update_peer_status(&self, site_id: SiteId, connected: bool, rtt: Option<Duration>) {
        let mut snapshot = self.snapshot.write().expect("status lock poisoned");
        snapshot.peers.insert(
            site_id,
            PeerStatus {
                site_id,
                connected,
                rtt_ms: rtt.map(|d| d.as_millis() as u64),
            },
        );
    }

    /// Drop a removed peer from the snapshot
    pub fn remove_peer(&self, site_id: SiteId) {
        let mut snapshot = self.snapshot.write().expect("status lock poisoned");
        snapshot.peers.remove(&site_id);
    }

    /// Record control-channel connectivity
    pub fn set_connection_status(&self, connected: bool) {
        let mut snapshot = self.snapshot.write().expect("status lock poisoned");
        snapshot.connected = connected;
    }

    /// Current snapshot (for tests and local callers)
    pub fn snapshot(&self) -> StatusSnapshot {
        self.snapshot.read().expect("status lock poisoned").clone()
    }
}

/// Create the surface: a writer handle for the supervisor and the
/// single-consumer channel its connect requests arrive on.
pub fn channel() -> (StatusHandle, mpsc::Receiver<ConnectRequest>) {
    let (connect_tx, connect_rx) = mpsc::channel(1);
    let handle = StatusHandle {
        snapshot: Arc::new(RwLock::new(StatusSnapshot::default())),
        connect_tx,
    };
    (handle, connect_rx)
}

/// Build the HTTP router over a status handle
pub fn router(handle: StatusHandle) -> Router {
    Router::new()
        .route("/connect", post(accept_connect))
        .route("/status", get(read_status))
        .with_state(handle)
}

/// Serve the surface until the cancellation token fires
pub async fn serve(addr: String, handle: StatusHandle, shutdown: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| OlmError::Config(format!("Failed to bind status surface to {}: {}", addr, e)))?;

    info!("Status surface listening on {}", addr);

    axum::serve(listener, router(handle))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| OlmError::Transport(format!("Status surface error: {}", e)))
}

async fn accept_connect(
    State(handle): State<StatusHandle>,
    Json(request): Json<ConnectRequest>,
) -> impl IntoResponse {
    info!("Received connect request for id {}", request.id);
    match handle.connect_tx.try_send(request) {
        Ok(()) => (StatusCode::ACCEPTED, "accepted"),
        Err(e) => {
            warn!("Dropping connect request: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, "busy")
        }
    }
}

async fn read_status(State(handle): State<StatusHandle>) -> impl IntoResponse {
    Json(handle.snapshot())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_updates() {
        let (handle, _rx) = channel();

        handle.set_connection_status(true);
        handle.update_peer_status(1, true, Some(Duration::from_millis(42)));
        handle.update_peer_status(2, false, None);

        let snapshot = handle.snapshot();
        assert!(snapshot.connected);
        assert_eq!(snapshot.peers.len(), 2);
        assert_eq!(snapshot.peers[&1].rtt_ms, Some(42));
        assert!(!snapshot.peers[&2].connected);

        handle.remove_peer(1);
        assert_eq!(handle.snapshot().peers.len(), 1);
    }

    #[tokio::test]
    async fn test_connect_request_reaches_consumer() {
        let (handle, mut rx) = channel();

        handle
            .connect_tx
            .try_send(ConnectRequest {
                id: "olm-1".to_string(),
                secret: "s".to_string(),
                endpoint: "https://p.example".to_string(),
            })
            .unwrap();

        let request = rx.recv().await.unwrap();
        assert_eq!(request.id, "olm-1");
    }

    #[test]
    fn test_status_json_shape() {
        let (handle, _rx) = channel();
        handle.update_peer_status(7, true, Some(Duration::from_millis(3)));

        let json = serde_json::to_string(&handle.snapshot()).unwrap();
        assert!(json.contains("\"siteId\":7"));
        assert!(json.contains("\"rttMs\":3"));
        assert!(json.contains("\"connected\""));
    }
}
