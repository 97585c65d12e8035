//! Per-site reachability monitoring and failover
//!
//! Each configured site gets a probe task that measures round-trip time
//! against the endpoint currently in use. Three consecutive failures mark
//! the site unreachable; a `peer/relay` directive then moves the site to
//! its relay endpoint. While on the relay, the primary endpoint keeps
//! being probed and the site reverts as soon as it answers again.
//!
//! Probe results and directives race per site: every directive bumps the
//! site's generation counter, and a probe result is discarded when the
//! generation moved while the probe was in flight.

pub mod probe;

use crate::control::message::{SiteConfig, SiteId};
use crate::error::{OlmError, Result};
use crate::wireguard::{resolve_endpoint, PublicKey, WgDevice};
use probe::probe_once;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default probe cadence; the per-probe timeout equals the cadence
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(1);

/// Consecutive failures before a site is reported unreachable
const FAILURE_THRESHOLD: u32 = 3;

/// Which endpoint a site's traffic is currently selected to use
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionMode {
    /// No probe has succeeded yet
    Unknown,
    /// The site's primary endpoint
    Primary,
    /// A control-plane supplied relay endpoint
    Relay,
}

impl std::fmt::Display for SelectionMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SelectionMode::Unknown => write!(f, "unknown"),
            SelectionMode::Primary => write!(f, "primary"),
            SelectionMode::Relay => write!(f, "relay"),
        }
    }
}

/// Live reachability state for one site
#[derive(Debug, Clone)]
pub struct PeerState {
    /// Endpoint probes and traffic currently target
    pub endpoint: SocketAddr,
    /// Resolved primary endpoint
    pub primary_endpoint: SocketAddr,
    /// Relay endpoint override, once a failover happened
    pub relay_endpoint: Option<SocketAddr>,
    /// Last observed round-trip time
    pub rtt: Option<Duration>,
    /// When the last successful reply arrived
    pub last_seen: Option<Instant>,
    /// Consecutive probe failures
    pub failures: u32,
    /// Whether the site currently answers probes
    pub connected: bool,
    /// Endpoint selection mode
    pub mode: SelectionMode,
    /// Bumped by every directive; stale probe results are discarded
    generation: u64,
}

impl PeerState {
    fn new(primary: SocketAddr) -> Self {
        Self {
            endpoint: primary,
            primary_endpoint: primary,
            relay_endpoint: None,
            rtt: None,
            last_seen: None,
            failures: 0,
            connected: false,
            mode: SelectionMode::Unknown,
            generation: 0,
        }
    }

    /// Apply a successful probe. Returns whether the site just came up.
    fn record_success(&mut self, rtt: Duration) -> bool {
        let came_up = !self.connected;
        self.failures = 0;
        self.rtt = Some(rtt);
        self.last_seen = Some(Instant::now());
        self.connected = true;
        if self.mode == SelectionMode::Unknown {
            self.mode = SelectionMode::Primary;
        }
        came_up
    }

    /// Apply a failed probe. Returns whether the site just went down.
    fn record_failure(&mut self) -> bool {
        self.failures += 1;
        if self.connected && self.failures >= FAILURE_THRESHOLD {
            self.connected = false;
            return true;
        }
        false
    }
}

struct SiteEntry {
    state: PeerState,
    cancel: CancellationToken,
}

/// Reachability notification: `(site, connected, rtt)`
pub type StatusCallback = Arc<dyn Fn(SiteId, bool, Option<Duration>) + Send + Sync>;

/// Runs one probe task per configured site and orchestrates failover
pub struct PeerMonitor {
    device: Arc<WgDevice>,
    /// Server key cached from the hole-punch directive; replies are
    /// validated against it when present
    expected_key: Arc<StdRwLock<Option<PublicKey>>>,
    sites: Arc<Mutex<HashMap<SiteId, SiteEntry>>>,
    notify: StatusCallback,
    probe_interval: Duration,
    shutdown: CancellationToken,
}

impl PeerMonitor {
    /// Create a monitor over the shared device handle
    pub fn new(
        device: Arc<WgDevice>,
        expected_key: Arc<StdRwLock<Option<PublicKey>>>,
        notify: StatusCallback,
        probe_interval: Duration,
    ) -> Self {
        Self {
            device,
            expected_key,
            sites: Arc::new(Mutex::new(HashMap::new())),
            notify,
            probe_interval,
            shutdown: CancellationToken::new(),
        }
    }

    /// Start (or refresh) monitoring for a site.
    ///
    /// An already-monitored site keeps its probe task; its primary
    /// endpoint is re-resolved and any in-flight probe result discarded.
    pub async fn add_site(&self, site: &SiteConfig) -> Result<()> {
        let primary = resolve_endpoint(&site.endpoint).await?;
        let mut sites = self.sites.lock().await;

        if let Some(entry) = sites.get_mut(&site.site_id) {
            entry.state.primary_endpoint = primary;
            if entry.state.mode != SelectionMode::Relay {
                entry.state.endpoint = primary;
            }
            entry.state.generation += 1;
            debug!("Refreshed monitor state for site {}", site.site_id);
            return Ok(());
        }

        let cancel = self.shutdown.child_token();
        sites.insert(
            site.site_id,
            SiteEntry {
                state: PeerState::new(primary),
                cancel: cancel.clone(),
            },
        );
        drop(sites);

        let ctx = ProbeCtx {
            site_id: site.site_id,
            device: Arc::clone(&self.device),
            expected_key: Arc::clone(&self.expected_key),
            sites: Arc::clone(&self.sites),
            notify: Arc::clone(&self.notify),
            probe_interval: self.probe_interval,
        };
        tokio::spawn(probe_loop(ctx, cancel));

        info!("Monitoring site {} at {}", site.site_id, primary);
        Ok(())
    }

    /// Stop monitoring a site and drop its state
    pub async fn remove_site(&self, site_id: SiteId) {
        let mut sites = self.sites.lock().await;
        if let Some(entry) = sites.remove(&site_id) {
            entry.cancel.cancel();
            info!("Stopped monitoring site {}", site_id);
        }
    }

    /// Fail a site over to a relay endpoint (the `peer/relay` directive).
    ///
    /// The endpoint is DNS-resolved first so probes operate on addresses;
    /// when resolution fails a literal `ip:port` parse is still attempted.
    pub async fn handle_failover(&self, site_id: SiteId, endpoint: &str) -> Result<()> {
        let resolved = match resolve_endpoint(endpoint).await {
            Ok(addr) => addr,
            Err(e) => {
                warn!(
                    "DNS resolution of relay '{}' failed ({}); trying it as a literal",
                    endpoint, e
                );
                endpoint.parse::<SocketAddr>().map_err(|_| {
                    OlmError::Transport(format!("Relay endpoint '{}' is unusable", endpoint))
                })?
            }
        };

        let previous = self.device.peer_endpoint(site_id).await;
        self.device.set_peer_endpoint(site_id, resolved).await?;
        if let Some(previous) = previous {
            debug!("Site {} endpoint was {}", site_id, previous);
        }

        let mut sites = self.sites.lock().await;
        let entry = sites
            .get_mut(&site_id)
            .ok_or_else(|| OlmError::Internal(format!("Site {} is not monitored", site_id)))?;

        entry.state.endpoint = resolved;
        entry.state.relay_endpoint = Some(resolved);
        entry.state.mode = SelectionMode::Relay;
        entry.state.failures = 0;
        entry.state.generation += 1;

        info!("Site {} failed over to relay {}", site_id, resolved);
        Ok(())
    }

    /// Current state of a site, if monitored
    pub async fn state(&self, site_id: SiteId) -> Option<PeerState> {
        self.sites.lock().await.get(&site_id).map(|e| e.state.clone())
    }

    /// Cancel all probe tasks and drop all state
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.sites.lock().await.clear();
        info!("Peer monitor stopped");
    }
}

struct ProbeCtx {
    site_id: SiteId,
    device: Arc<WgDevice>,
    expected_key: Arc<StdRwLock<Option<PublicKey>>>,
    sites: Arc<Mutex<HashMap<SiteId, SiteEntry>>>,
    notify: StatusCallback,
    probe_interval: Duration,
}

impl ProbeCtx {
    fn key_matches(&self, responder_key: &[u8; 32]) -> bool {
        match self
            .expected_key
            .read()
            .expect("server key lock poisoned")
            .as_ref()
        {
            Some(expected) => expected.as_bytes() == responder_key,
            None => true,
        }
    }
}

async fn probe_loop(ctx: ProbeCtx, cancel: CancellationToken) {
    let socket = match UdpSocket::bind("0.0.0.0:0").await {
        Ok(s) => s,
        Err(e) => {
            warn!("Probe socket bind failed for site {}: {}", ctx.site_id, e);
            return;
        }
    };

    let mut sequence: u64 = 0;
    let mut interval = time::interval(ctx.probe_interval);
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = cancel.cancelled() => break,
        }

        let Some((target, generation, mode, primary)) = ({
            let sites = ctx.sites.lock().await;
            sites.get(&ctx.site_id).map(|e| {
                (
                    e.state.endpoint,
                    e.state.generation,
                    e.state.mode,
                    e.state.primary_endpoint,
                )
            })
        }) else {
            break;
        };

        sequence += 1;
        let outcome = probe_once(&socket, target, sequence, ctx.probe_interval).await;

        let success_rtt = match outcome {
            Ok(reply) if ctx.key_matches(&reply.responder_key) => Some(reply.rtt),
            Ok(_) => {
                warn!(
                    "Site {} probe reply failed server-key validation, discarding",
                    ctx.site_id
                );
                None
            }
            Err(_) => None,
        };

        apply_probe_result(&ctx, generation, success_rtt).await;

        // While failed over, keep probing the primary path; revert as
        // soon as it answers again.
        if mode == SelectionMode::Relay {
            sequence += 1;
            if let Ok(reply) = probe_once(&socket, primary, sequence, ctx.probe_interval).await {
                if ctx.key_matches(&reply.responder_key) {
                    revert_to_primary(&ctx, generation, primary, reply.rtt).await;
                }
            }
        }
    }

    debug!("Probe task for site {} stopped", ctx.site_id);
}

async fn apply_probe_result(ctx: &ProbeCtx, generation: u64, success_rtt: Option<Duration>) {
    let mut sites = ctx.sites.lock().await;
    let Some(entry) = sites.get_mut(&ctx.site_id) else {
        return;
    };
    if entry.state.generation != generation {
        debug!(
            "Discarding stale probe result for site {} (directive won the race)",
            ctx.site_id
        );
        return;
    }

    match success_rtt {
        Some(rtt) => {
            let came_up = entry.state.record_success(rtt);
            if came_up {
                info!("Site {} reachable (rtt {:?})", ctx.site_id, rtt);
            }
            let rtt = entry.state.rtt;
            drop(sites);
            (ctx.notify)(ctx.site_id, true, rtt);
        }
        None => {
            if entry.state.record_failure() {
                warn!(
                    "Site {} unreachable after {} consecutive probe failures",
                    ctx.site_id, FAILURE_THRESHOLD
                );
                drop(sites);
                (ctx.notify)(ctx.site_id, false, None);
            }
        }
    }
}

async fn revert_to_primary(
    ctx: &ProbeCtx,
    generation: u64,
    primary: SocketAddr,
    rtt: Duration,
) {
    {
        let mut sites = ctx.sites.lock().await;
        let Some(entry) = sites.get_mut(&ctx.site_id) else {
            return;
        };
        if entry.state.generation != generation {
            return;
        }
        entry.state.endpoint = primary;
        entry.state.mode = SelectionMode::Primary;
        entry.state.failures = 0;
        entry.state.connected = true;
        entry.state.rtt = Some(rtt);
        entry.state.last_seen = Some(Instant::now());
        entry.state.generation += 1;
    }

    if let Err(e) = ctx.device.set_peer_endpoint(ctx.site_id, primary).await {
        warn!("Failed to move site {} back to primary: {}", ctx.site_id, e);
        return;
    }

    info!("Site {} primary path recovered, reverting from relay", ctx.site_id);
    (ctx.notify)(ctx.site_id, true, Some(rtt));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state() -> PeerState {
        PeerState::new("1.2.3.4:51820".parse().unwrap())
    }

    #[test]
    fn test_first_success_selects_primary() {
        let mut s = state();
        assert_eq!(s.mode, SelectionMode::Unknown);
        assert!(!s.connected);

        let came_up = s.record_success(Duration::from_millis(12));
        assert!(came_up);
        assert_eq!(s.mode, SelectionMode::Primary);
        assert!(s.connected);
        assert_eq!(s.rtt, Some(Duration::from_millis(12)));
    }

    #[test]
    fn test_unreachable_after_threshold() {
        let mut s = state();
        s.record_success(Duration::from_millis(5));

        assert!(!s.record_failure());
        assert!(!s.record_failure());
        assert!(s.record_failure()); // third failure flips
        assert!(!s.connected);

        // Further failures do not re-notify
        assert!(!s.record_failure());
    }

    #[test]
    fn test_failures_reset_on_success() {
        let mut s = state();
        s.record_success(Duration::from_millis(5));
        s.record_failure();
        s.record_failure();
        assert!(!s.record_success(Duration::from_millis(6)));
        assert_eq!(s.failures, 0);
        assert!(s.connected);
    }

    #[test]
    fn test_no_down_notification_before_first_success() {
        let mut s = state();
        assert!(!s.record_failure());
        assert!(!s.record_failure());
        assert!(!s.record_failure());
        // Never connected, so nothing to report down
        assert_eq!(s.mode, SelectionMode::Unknown);
    }

    #[test]
    fn test_selection_mode_display() {
        assert_eq!(SelectionMode::Primary.to_string(), "primary");
        assert_eq!(SelectionMode::Relay.to_string(), "relay");
        assert_eq!(SelectionMode::Unknown.to_string(), "unknown");
    }
}
