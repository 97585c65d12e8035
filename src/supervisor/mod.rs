//! Supervisor: owns the device handle and wires every component
//!
//! The supervisor assembles the control client, hole-punch loop,
//! registration and ping publishers, WireGuard device, and peer monitor,
//! and installs the control-plane directive handlers. Directives are
//! dispatched serially by the control client, so a `connect` completes
//! (device up, peers configured, monitor started) before any later
//! `peer/*` directive runs.

use crate::config::{CredentialStore, Settings, StoredCredentials};
use crate::control::message::{
    self, HolePunchData, PeerRelayData, PeerRemoveData, PeerStatusData, RegisterData, SiteConfig,
    SiteId, WgData,
};
use crate::control::ControlClient;
use crate::error::{OlmError, Result};
use crate::holepunch;
use crate::monitor::{PeerMonitor, StatusCallback, DEFAULT_PROBE_INTERVAL};
use crate::platform::Platform;
use crate::status::StatusHandle;
use crate::wireguard::{DeviceConfig, KeyPair, PublicKey, WgDevice};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Registration announcement cadence before the tunnel comes up
const REGISTER_INTERVAL: Duration = Duration::from_secs(1);

/// Lowest port considered for the fixed UDP source port
const SOURCE_PORT_MIN: u16 = 49152;

/// Pick a random unused UDP port in the dynamic range. The socket used
/// for the check is dropped; the hole-punch loop rebinds the port first.
pub fn find_free_source_port() -> Result<u16> {
    use rand::Rng;
    let mut rng = rand::thread_rng();

    for _ in 0..64 {
        let port = rng.gen_range(SOURCE_PORT_MIN..=u16::MAX);
        if std::net::UdpSocket::bind(("0.0.0.0", port)).is_ok() {
            return Ok(port);
        }
    }
    Err(OlmError::Internal(
        "Could not find a free UDP source port".to_string(),
    ))
}

/// Upsert a site into the site set by `SiteId`; an add for an existing
/// site behaves as an update. Returns the replaced site's server IP.
pub fn upsert_site(sites: &mut Vec<SiteConfig>, site: SiteConfig) -> Option<String> {
    match sites.iter_mut().find(|s| s.site_id == site.site_id) {
        Some(existing) => {
            let previous_ip = existing.server_ip.clone();
            *existing = site;
            Some(previous_ip)
        }
        None => {
            sites.push(site);
            None
        }
    }
}

/// Remove a site from the site set, returning it when present
pub fn remove_site(sites: &mut Vec<SiteConfig>, site_id: SiteId) -> Option<SiteConfig> {
    let position = sites.iter().position(|s| s.site_id == site_id)?;
    Some(sites.remove(position))
}

/// Supervisor state shared with directive handlers
pub struct Supervisor {
    settings: Settings,
    keypair: KeyPair,
    source_port: u16,
    platform: Arc<dyn Platform>,
    client: Arc<ControlClient>,
    store: CredentialStore,
    status: StatusHandle,

    /// The one device per process; populated by the first connect
    device: Mutex<Option<Arc<WgDevice>>>,
    monitor: Mutex<Option<Arc<PeerMonitor>>>,
    /// Mirror of the control plane's site set, mutated only by handlers
    sites: Mutex<Vec<SiteConfig>>,
    /// Server public key cached from the hole-punch directive
    server_key: Arc<StdRwLock<Option<PublicKey>>>,

    stop_holepunch: CancellationToken,
    stop_register: CancellationToken,
    stop_ping: CancellationToken,
    holepunch_handle: Mutex<Option<JoinHandle<()>>>,
    loops_started: AtomicBool,

    /// Fired by `olm/terminate` or a signal; observed by main
    shutdown: CancellationToken,
}

impl Supervisor {
    /// Build a supervisor from resolved settings. Credentials must be
    /// present; a fresh WireGuard keypair and the fixed source port are
    /// chosen here.
    pub fn new(
        settings: Settings,
        platform: Arc<dyn Platform>,
        status: StatusHandle,
        store: CredentialStore,
    ) -> Result<Arc<Self>> {
        let endpoint = settings
            .endpoint
            .clone()
            .ok_or_else(|| OlmError::Config("Missing endpoint".to_string()))?;
        let id = settings
            .id
            .clone()
            .ok_or_else(|| OlmError::Config("Missing id".to_string()))?;
        let secret = settings
            .secret
            .clone()
            .ok_or_else(|| OlmError::Config("Missing secret".to_string()))?;

        let keypair = KeyPair::generate();
        let source_port = find_free_source_port()?;
        info!(
            "Generated keypair (public key {}) and fixed source port {}",
            keypair.public, source_port
        );

        let client = Arc::new(ControlClient::new(endpoint, id, secret));
        if let Ok(Some(saved)) = store.load() {
            if let Some(token) = saved.token {
                client.set_cached_token(token);
            }
        }

        Ok(Arc::new(Self {
            settings,
            keypair,
            source_port,
            platform,
            client,
            store,
            status,
            device: Mutex::new(None),
            monitor: Mutex::new(None),
            sites: Mutex::new(Vec::new()),
            server_key: Arc::new(StdRwLock::new(None)),
            stop_holepunch: CancellationToken::new(),
            stop_register: CancellationToken::new(),
            stop_ping: CancellationToken::new(),
            holepunch_handle: Mutex::new(None),
            loops_started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }))
    }

    /// Token observed by main; fires on `olm/terminate`
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Register handlers, start the hole-punch loop, and connect the
    /// control client. Returns once the background tasks are launched.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        self.register_handlers();
        self.persist_on_token_update();

        // Publisher loops start on every successful dial, once
        let on_connect = Arc::clone(self);
        self.client.on_connect(move || {
            let supervisor = Arc::clone(&on_connect);
            async move {
                supervisor.status.set_connection_status(true);
                if !supervisor.loops_started.swap(true, Ordering::SeqCst) {
                    supervisor.spawn_register_loop();
                    supervisor.spawn_ping_loop();
                }
            }
        });

        let endpoint = self
            .settings
            .endpoint
            .clone()
            .ok_or_else(|| OlmError::Config("Missing endpoint".to_string()))?;
        let id = self
            .settings
            .id
            .clone()
            .ok_or_else(|| OlmError::Config("Missing id".to_string()))?;

        let punch = holepunch::spawn(endpoint, id, self.source_port, self.stop_holepunch.clone());
        *self.holepunch_handle.lock().await = Some(punch);

        self.client.connect().await;
        Ok(())
    }

    fn persist_on_token_update(self: &Arc<Self>) {
        let store = self.store.clone();
        let settings = self.settings.clone();
        self.client.on_token_update(move |token| {
            let creds = StoredCredentials {
                olm_id: settings.id.clone().unwrap_or_default(),
                secret: settings.secret.clone().unwrap_or_default(),
                endpoint: settings.endpoint.clone().unwrap_or_default(),
                token: Some(token),
            };
            if let Err(e) = store.save(&creds) {
                warn!("Failed to persist credentials: {}", e);
            }
        });
    }

    fn register_handlers(self: &Arc<Self>) {
        let sup = Arc::clone(self);
        self.client.register_handler(message::MSG_HOLEPUNCH, move |data| {
            let sup = Arc::clone(&sup);
            async move { sup.handle_holepunch(data).await }
        });

        let sup = Arc::clone(self);
        self.client.register_handler(message::MSG_CONNECT, move |data| {
            let sup = Arc::clone(&sup);
            async move { sup.handle_connect(data).await }
        });

        let sup = Arc::clone(self);
        self.client.register_handler(message::MSG_PEER_ADD, move |data| {
            let sup = Arc::clone(&sup);
            async move { sup.handle_peer_upsert(data, "add").await }
        });

        let sup = Arc::clone(self);
        self.client.register_handler(message::MSG_PEER_UPDATE, move |data| {
            let sup = Arc::clone(&sup);
            async move { sup.handle_peer_upsert(data, "update").await }
        });

        let sup = Arc::clone(self);
        self.client.register_handler(message::MSG_PEER_REMOVE, move |data| {
            let sup = Arc::clone(&sup);
            async move { sup.handle_peer_remove(data).await }
        });

        let sup = Arc::clone(self);
        self.client.register_handler(message::MSG_PEER_RELAY, move |data| {
            let sup = Arc::clone(&sup);
            async move { sup.handle_peer_relay(data).await }
        });

        let sup = Arc::clone(self);
        self.client.register_handler(message::MSG_TERMINATE, move |_| {
            let sup = Arc::clone(&sup);
            async move {
                info!("Server requested termination");
                sup.shutdown.cancel();
            }
        });
    }

    fn spawn_register_loop(self: &Arc<Self>) {
        let client = Arc::clone(&self.client);
        let public_key = self.keypair.public.to_base64();
        let stop = self.stop_register.clone();

        tokio::spawn(async move {
            let mut interval = time::interval(REGISTER_INTERVAL);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let data = RegisterData { public_key: public_key.clone() };
                        if let Err(e) = client.send_message(message::MSG_REGISTER, &data) {
                            debug!("Register announcement not sent: {}", e);
                        }
                    }
                    _ = stop.cancelled() => break,
                }
            }
            debug!("Registration loop stopped");
        });
    }

    fn spawn_ping_loop(self: &Arc<Self>) {
        let client = Arc::clone(&self.client);
        let stop = self.stop_ping.clone();
        let interval_duration = self.settings.ping_interval;
        let timeout = self.settings.ping_timeout;

        tokio::spawn(async move {
            let mut interval = time::interval(interval_duration);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let empty_payload = serde_json::json!({});
                        let ping = client.send_message_with_timeout(
                            message::MSG_PING,
                            &empty_payload,
                            timeout,
                        );
                        if let Err(e) = ping.await {
                            debug!("Ping not delivered: {}", e);
                        }
                    }
                    _ = stop.cancelled() => break,
                }
            }
            debug!("Ping loop stopped");
        });
    }

    async fn handle_holepunch(&self, data: serde_json::Value) {
        let payload: HolePunchData = match serde_json::from_value(data) {
            Ok(p) => p,
            Err(e) => {
                warn!("Dropping malformed hole-punch directive: {}", e);
                return;
            }
        };

        match PublicKey::from_base64(&payload.server_pub_key) {
            Ok(key) => {
                info!("Cached server public key {}", key);
                *self.server_key.write().expect("server key lock poisoned") = Some(key);
            }
            Err(e) => warn!("Hole-punch directive carried a bad key: {}", e),
        }
    }

    /// The `connect` directive: stop the pre-tunnel loops, hand the fixed
    /// port from the hole-punch emitter to the device, configure every
    /// site, and start the monitor.
    async fn handle_connect(self: &Arc<Self>, data: serde_json::Value) {
        let wg_data: WgData = match serde_json::from_value(data) {
            Ok(d) => d,
            Err(e) => {
                warn!("Dropping malformed connect directive: {}", e);
                return;
            }
        };

        {
            let device = self.device.lock().await;
            if let Some(existing) = device.as_ref() {
                warn!(
                    "Duplicate connect directive ignored; device already {}",
                    existing.state().await
                );
                return;
            }
        }

        info!(
            "Connect directive received: {} site(s), tunnel address {}",
            wg_data.sites.len(),
            wg_data.tunnel_ip
        );

        // The server knows our key now; stop announcing it
        self.stop_register.cancel();

        // The device must not bind until the emitter has released the
        // port, so the join handle is awaited, not just cancelled
        self.stop_holepunch.cancel();
        if let Some(handle) = self.holepunch_handle.lock().await.take() {
            if let Err(e) = handle.await {
                warn!("Hole-punch task join failed: {}", e);
            }
        }

        let config = DeviceConfig {
            interface: self.settings.interface.clone(),
            mtu: wg_data.mtu.unwrap_or(self.settings.mtu),
            keypair: self.keypair.clone(),
            source_port: self.source_port,
        };

        let device = match WgDevice::new(config, self.platform.as_ref()) {
            Ok(d) => Arc::new(d),
            Err(e) => {
                error!("Device creation failed, awaiting next directive: {}", e);
                return;
            }
        };

        let interface = device.interface_name().to_string();
        if let Err(e) = self
            .platform
            .configure_address(&interface, &wg_data.tunnel_ip)
        {
            error!("Interface address assignment failed: {}", e);
            device.close().await;
            return;
        }

        let dns = wg_data.dns.clone().unwrap_or_else(|| self.settings.dns.clone());
        if let Err(e) = self.platform.configure_dns(&interface, &dns) {
            warn!("DNS configuration failed: {}", e);
        }

        if let Err(e) = device.up().await {
            error!("Device bring-up failed: {}", e);
            device.close().await;
            return;
        }

        let monitor = Arc::new(PeerMonitor::new(
            Arc::clone(&device),
            Arc::clone(&self.server_key),
            self.status_callback(),
            DEFAULT_PROBE_INTERVAL,
        ));

        for site in &wg_data.sites {
            self.apply_site(site, &device, &monitor).await;
        }

        info!(
            "Tunnel up on interface {}: {} peer(s), UDP source port {}",
            interface,
            device.peer_count().await,
            device.source_port()
        );

        *self.sites.lock().await = wg_data.sites;
        *self.monitor.lock().await = Some(monitor);
        *self.device.lock().await = Some(device);
    }

    /// Configure one site on the device, install its route, and start
    /// monitoring it. Partial failures keep the site configured.
    async fn apply_site(&self, site: &SiteConfig, device: &Arc<WgDevice>, monitor: &Arc<PeerMonitor>) {
        if let Err(e) = device.configure_peer(site).await {
            error!("Failed to configure site {}: {}", site.site_id, e);
            return;
        }

        // Route failures are retried by a later add/update; the peer
        // stays configured either way
        if let Err(e) = self
            .platform
            .add_route(device.interface_name(), &site.server_ip)
        {
            warn!("Route install for site {} failed: {}", site.site_id, e);
        }

        if let Err(e) = monitor.add_site(site).await {
            warn!("Monitor start for site {} failed: {}", site.site_id, e);
        }
    }

    /// `peer/add` and `peer/update`: both converge to the same upsert.
    async fn handle_peer_upsert(&self, data: serde_json::Value, verb: &str) {
        let site: SiteConfig = match serde_json::from_value(data) {
            Ok(s) => s,
            Err(e) => {
                warn!("Dropping malformed peer/{} directive: {}", verb, e);
                return;
            }
        };

        let (device, monitor) = match self.running_device().await {
            Some(pair) => pair,
            None => {
                warn!("peer/{} for site {} before connect; ignoring", verb, site.site_id);
                return;
            }
        };

        let mut sites = self.sites.lock().await;
        let previous_ip = upsert_site(&mut sites, site.clone());

        // A stale route has no peer behind it anymore; drop it before
        // the new one goes in
        if let Some(old_ip) = &previous_ip {
            if *old_ip != site.server_ip {
                if let Err(e) = self
                    .platform
                    .remove_route(device.interface_name(), old_ip)
                {
                    warn!("Stale route removal for site {} failed: {}", site.site_id, e);
                }
            }
        }

        self.apply_site(&site, &device, &monitor).await;
        info!("peer/{} applied to site {}", verb, site.site_id);
    }

    async fn handle_peer_remove(&self, data: serde_json::Value) {
        let payload: PeerRemoveData = match serde_json::from_value(data) {
            Ok(p) => p,
            Err(e) => {
                warn!("Dropping malformed peer/remove directive: {}", e);
                return;
            }
        };

        let (device, monitor) = match self.running_device().await {
            Some(pair) => pair,
            None => {
                warn!("peer/remove before connect; ignoring");
                return;
            }
        };

        let mut sites = self.sites.lock().await;
        let Some(site) = remove_site(&mut sites, payload.site_id) else {
            warn!("peer/remove for unknown site {}; ignoring", payload.site_id);
            return;
        };
        drop(sites);

        monitor.remove_site(site.site_id).await;
        device.remove_peer(site.site_id).await;
        if let Err(e) = self
            .platform
            .remove_route(device.interface_name(), &site.server_ip)
        {
            warn!("Route removal for site {} failed: {}", site.site_id, e);
        }
        self.status.remove_peer(site.site_id);
        info!("Site {} removed", site.site_id);
    }

    async fn handle_peer_relay(&self, data: serde_json::Value) {
        let payload: PeerRelayData = match serde_json::from_value(data) {
            Ok(p) => p,
            Err(e) => {
                warn!("Dropping malformed peer/relay directive: {}", e);
                return;
            }
        };

        let monitor = self.monitor.lock().await.clone();
        let Some(monitor) = monitor else {
            warn!("peer/relay before connect; ignoring");
            return;
        };

        if let Err(e) = monitor
            .handle_failover(payload.site_id, &payload.endpoint)
            .await
        {
            warn!("Failover for site {} failed: {}", payload.site_id, e);
            return;
        }

        if let Some(state) = monitor.state(payload.site_id).await {
            info!(
                "Site {} now targeting {} in {} mode",
                payload.site_id, state.endpoint, state.mode
            );
        }
    }

    async fn running_device(&self) -> Option<(Arc<WgDevice>, Arc<PeerMonitor>)> {
        let device = self.device.lock().await.clone()?;
        let monitor = self.monitor.lock().await.clone()?;
        Some((device, monitor))
    }

    /// Monitor notification fan-out: always update the local snapshot,
    /// publish to the control plane only when reachability flips.
    fn status_callback(&self) -> StatusCallback {
        let status = self.status.clone();
        let client = Arc::clone(&self.client);
        let last_reported: StdMutex<HashMap<SiteId, bool>> = StdMutex::new(HashMap::new());

        Arc::new(move |site_id, connected, rtt| {
            status.update_peer_status(site_id, connected, rtt);

            let flipped = {
                let mut last = last_reported.lock().expect("status map poisoned");
                last.insert(site_id, connected) != Some(connected)
            };
            if flipped {
                let report = PeerStatusData {
                    site_id,
                    connected,
                    rtt_ms: rtt.map(|d| d.as_millis() as u64),
                };
                if let Err(e) = client.send_message(message::MSG_STATUS, &report) {
                    debug!("Status report for site {} not sent: {}", site_id, e);
                }
            }
        })
    }

    /// Tear everything down in order: loops, client, monitor, device,
    /// routes, DNS. Every cancellation is idempotent.
    pub async fn stop(&self) {
        info!("Shutting down");

        self.stop_holepunch.cancel();
        self.stop_register.cancel();
        self.stop_ping.cancel();

        if let Some(handle) = self.holepunch_handle.lock().await.take() {
            let _ = handle.await;
        }

        self.client.close().await;
        self.status.set_connection_status(false);

        if let Some(monitor) = self.monitor.lock().await.take() {
            monitor.stop().await;
        }

        if let Some(device) = self.device.lock().await.take() {
            let interface = device.interface_name().to_string();
            device.close().await;

            let sites = self.sites.lock().await;
            for site in sites.iter() {
                if let Err(e) = self.platform.remove_route(&interface, &site.server_ip) {
                    debug!("Route cleanup for site {} failed: {}", site.site_id, e);
                }
            }
            if let Err(e) = self.platform.remove_dns(&interface) {
                debug!("DNS cleanup failed: {}", e);
            }
        }

        info!("Shutdown complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_port_in_dynamic_range() {
        let port = find_free_source_port().unwrap();
        assert!(port >= SOURCE_PORT_MIN);
    }

    #[test]
    fn test_source_port_is_actually_free() {
        let port = find_free_source_port().unwrap();
        // The checking socket was dropped, so a rebind must succeed
        std::net::UdpSocket::bind(("0.0.0.0", port)).unwrap();
    }

    fn site(id: SiteId, ip: &str) -> SiteConfig {
        SiteConfig {
            site_id: id,
            public_key: "pk".to_string(),
            endpoint: "1.2.3.4:51820".to_string(),
            server_ip: ip.to_string(),
            server_port: 51820,
        }
    }

    #[test]
    fn test_upsert_add_then_update_converges() {
        let mut sites = Vec::new();

        assert!(upsert_site(&mut sites, site(1, "10.0.0.1")).is_none());
        assert_eq!(sites.len(), 1);

        // Adding the same SiteId again behaves as an update
        let previous = upsert_site(&mut sites, site(1, "10.0.0.9"));
        assert_eq!(previous.as_deref(), Some("10.0.0.1"));
        assert_eq!(sites.len(), 1);
        assert_eq!(sites[0].server_ip, "10.0.0.9");
    }

    #[test]
    fn test_remove_returns_site_and_ignores_unknown() {
        let mut sites = vec![site(1, "10.0.0.1"), site(2, "10.0.0.2")];

        let removed = remove_site(&mut sites, 1).unwrap();
        assert_eq!(removed.server_ip, "10.0.0.1");
        assert_eq!(sites.len(), 1);

        assert!(remove_site(&mut sites, 99).is_none());
        assert_eq!(sites.len(), 1);
    }
}
