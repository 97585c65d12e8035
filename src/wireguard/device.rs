//! WireGuard device facade
//!
//! Wraps a boringtun-based WireGuard device bound to the process's fixed
//! local UDP source port. Each remote site gets its own `Tunn` instance,
//! keyed by `SiteId`; outbound packets are routed to a site by matching
//! the destination address against the site's allowed host IP.
//!
//! Exactly one device exists per process. The UDP socket is bound only
//! after the hole-punch emitter on the same port has been stopped and
//! joined, so the NAT pinhole is handed over intact.

use crate::control::message::{SiteConfig, SiteId};
use crate::error::{OlmError, Result};
use crate::platform::Platform;
use crate::wireguard::KeyPair;
use boringtun::noise::{Tunn, TunnResult};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{IpAddr, SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{lookup_host, UdpSocket as TokioUdpSocket};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tun::Device as TunDevice;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};

/// Maximum packet size for WireGuard
const MAX_PACKET_SIZE: usize = 65535;

/// Buffer size for TUN device reads
const TUN_BUFFER_SIZE: usize = 2048;

/// Timer tick interval for WireGuard operations
const TIMER_TICK_INTERVAL: Duration = Duration::from_millis(250);

/// Persistent keepalive pushed to every site peer, in seconds. Keeps the
/// NAT pinhole warm between data packets.
const PERSISTENT_KEEPALIVE_SECS: u16 = 25;

/// Device lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// No TUN or socket exists yet
    Uninitialized,
    /// TUN created and socket bound, packet pumps not running
    Created,
    /// Packet pumps running
    Up,
    /// Device closed; the socket and TUN are released
    Closed,
}

impl std::fmt::Display for DeviceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceState::Uninitialized => write!(f, "uninitialized"),
            DeviceState::Created => write!(f, "created"),
            DeviceState::Up => write!(f, "up"),
            DeviceState::Closed => write!(f, "closed"),
        }
    }
}

/// Device construction parameters
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Interface name
    pub interface: String,
    /// MTU value
    pub mtu: u16,
    /// Local keypair
    pub keypair: KeyPair,
    /// Fixed local UDP source port
    pub source_port: u16,
}

/// Per-site tunnel state
struct SitePeer {
    site_id: SiteId,
    public_key: X25519PublicKey,
    tunn: Tunn,
    endpoint: SocketAddr,
    /// The site's overlay address; also its allowed host IP
    allowed_ip: IpAddr,
    last_activity: Instant,
}

impl SitePeer {
    fn new(
        site: &SiteConfig,
        endpoint: SocketAddr,
        local_private: StaticSecret,
        index: u32,
    ) -> Result<Self> {
        let public_key = X25519PublicKey::from(*site.parse_public_key()?.as_bytes());
        let allowed_ip: IpAddr = site.server_ip.parse().map_err(|e| {
            OlmError::Device(format!(
                "Site {} has invalid server IP '{}': {}",
                site.site_id, site.server_ip, e
            ))
        })?;

        let tunn = Tunn::new(
            local_private,
            public_key,
            None,
            Some(PERSISTENT_KEEPALIVE_SECS),
            index,
            None,
        )
        .map_err(|e| {
            OlmError::Device(format!(
                "Failed to create tunnel state for site {}: {}",
                site.site_id, e
            ))
        })?;

        Ok(Self {
            site_id: site.site_id,
            public_key,
            tunn,
            endpoint,
            allowed_ip,
            last_activity: Instant::now(),
        })
    }
}

/// WireGuard device bound to the fixed source port
pub struct WgDevice {
    config: DeviceConfig,
    /// Actual interface name (may differ from the requested one on macOS)
    actual_interface: String,
    tun_device: Arc<Mutex<tun::platform::Device>>,
    udp_socket: Arc<TokioUdpSocket>,
    /// Site peers; all facade entry points serialize through this lock
    peers: Arc<Mutex<HashMap<SiteId, SitePeer>>>,
    /// Source-address to site mapping for inbound lookup
    endpoint_map: Arc<RwLock<HashMap<SocketAddr, SiteId>>>,
    state: Mutex<DeviceState>,
    shutdown: CancellationToken,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
    next_index: Mutex<u32>,
}

impl WgDevice {
    /// Create the TUN device and bind the UDP socket to the fixed source
    /// port. Packet pumps do not run until [`WgDevice::up`].
    pub fn new(config: DeviceConfig, platform: &dyn Platform) -> Result<Self> {
        info!(
            "Creating WireGuard device on interface {} (source port {})",
            config.interface, config.source_port
        );

        let tun_device = platform.create_tun(&config.interface, config.mtu)?;

        let actual_interface = tun_device
            .name()
            .map_err(|e| OlmError::Device(format!("Failed to get TUN device name: {}", e)))?;

        tun_device.set_nonblock().map_err(|e| {
            OlmError::Device(format!("Failed to set TUN device to non-blocking: {}", e))
        })?;

        let listen_addr: SocketAddr = format!("0.0.0.0:{}", config.source_port)
            .parse()
            .map_err(|e| OlmError::Config(format!("Invalid source port: {}", e)))?;

        let std_socket = UdpSocket::bind(listen_addr).map_err(|e| {
            OlmError::Device(format!("Failed to bind UDP socket to {}: {}", listen_addr, e))
        })?;
        std_socket.set_nonblocking(true).map_err(|e| {
            OlmError::Device(format!("Failed to set UDP socket to non-blocking: {}", e))
        })?;

        let udp_socket = Arc::new(TokioUdpSocket::from_std(std_socket).map_err(|e| {
            OlmError::Device(format!("Failed to create async UDP socket: {}", e))
        })?);

        info!(
            "Device created: interface {}, UDP bound to {}",
            actual_interface, listen_addr
        );

        Ok(Self {
            config,
            actual_interface,
            tun_device: Arc::new(Mutex::new(tun_device)),
            udp_socket,
            peers: Arc::new(Mutex::new(HashMap::new())),
            endpoint_map: Arc::new(RwLock::new(HashMap::new())),
            state: Mutex::new(DeviceState::Created),
            shutdown: CancellationToken::new(),
            task_handles: Mutex::new(Vec::new()),
            next_index: Mutex::new(0),
        })
    }

    /// Start the packet pumps and mark the device up
    pub async fn up(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        match *state {
            DeviceState::Created => {}
            other => {
                return Err(OlmError::Internal(format!(
                    "Cannot bring device up from state {}",
                    other
                )))
            }
        }

        let mut handles = self.task_handles.lock().await;

        let outbound = {
            let tun_device = Arc::clone(&self.tun_device);
            let udp_socket = Arc::clone(&self.udp_socket);
            let peers = Arc::clone(&self.peers);
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                Self::outbound_task(tun_device, udp_socket, peers, shutdown).await;
            })
        };

        let inbound = {
            let tun_device = Arc::clone(&self.tun_device);
            let udp_socket = Arc::clone(&self.udp_socket);
            let peers = Arc::clone(&self.peers);
            let endpoint_map = Arc::clone(&self.endpoint_map);
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                Self::inbound_task(tun_device, udp_socket, peers, endpoint_map, shutdown).await;
            })
        };

        let timer = {
            let udp_socket = Arc::clone(&self.udp_socket);
            let peers = Arc::clone(&self.peers);
            let shutdown = self.shutdown.clone();
            tokio::spawn(async move {
                Self::timer_task(udp_socket, peers, shutdown).await;
            })
        };

        handles.push(outbound);
        handles.push(inbound);
        handles.push(timer);

        *state = DeviceState::Up;
        info!("WireGuard device up on interface {}", self.actual_interface);
        Ok(())
    }

    /// Outbound pump: TUN -> encrypt -> UDP, routed by destination IP
    async fn outbound_task(
        tun_device: Arc<Mutex<tun::platform::Device>>,
        udp_socket: Arc<TokioUdpSocket>,
        peers: Arc<Mutex<HashMap<SiteId, SitePeer>>>,
        shutdown: CancellationToken,
    ) {
        debug!("Outbound task started");
        let mut tun_buffer = vec![0u8; TUN_BUFFER_SIZE];
        let mut wg_buffer = vec![0u8; MAX_PACKET_SIZE];

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let n = {
                let mut device_guard = tun_device.lock().await;
                match device_guard.read(&mut tun_buffer) {
                    Ok(n) => n,
                    Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                        drop(device_guard);
                        tokio::select! {
                            _ = time::sleep(Duration::from_millis(10)) => continue,
                            _ = shutdown.cancelled() => break,
                        }
                    }
                    Err(e) => {
                        error!("TUN read error: {}", e);
                        continue;
                    }
                }
            };

            if n == 0 {
                continue;
            }

            let Some(dst) = destination_ip(&tun_buffer[..n]) else {
                debug!("Dropping non-IPv4 packet from TUN ({} bytes)", n);
                continue;
            };

            let mut peers_guard = peers.lock().await;
            let Some(peer) = peers_guard.values_mut().find(|p| p.allowed_ip == dst) else {
                debug!("No site routes {}", dst);
                continue;
            };

            match peer.tunn.encapsulate(&tun_buffer[..n], &mut wg_buffer) {
                TunnResult::Done => {}
                TunnResult::Err(e) => {
                    debug!("Encapsulation error for site {}: {:?}", peer.site_id, e);
                }
                TunnResult::WriteToNetwork(data) => {
                    match udp_socket.send_to(data, peer.endpoint).await {
                        Ok(_) => peer.last_activity = Instant::now(),
                        Err(e) => warn!("UDP send error to {}: {}", peer.endpoint, e),
                    }
                }
                TunnResult::WriteToTunnelV4(_, _) | TunnResult::WriteToTunnelV6(_, _) => {
                    debug!("Unexpected WriteToTunnel result in outbound path");
                }
            }
        }
        debug!("Outbound task stopped");
    }

    /// Inbound pump: UDP -> decrypt -> TUN
    async fn inbound_task(
        tun_device: Arc<Mutex<tun::platform::Device>>,
        udp_socket: Arc<TokioUdpSocket>,
        peers: Arc<Mutex<HashMap<SiteId, SitePeer>>>,
        endpoint_map: Arc<RwLock<HashMap<SocketAddr, SiteId>>>,
        shutdown: CancellationToken,
    ) {
        debug!("Inbound task started");
        let mut udp_buffer = vec![0u8; MAX_PACKET_SIZE];
        let mut tun_buffer = vec![0u8; MAX_PACKET_SIZE];

        loop {
            let (n, src) = tokio::select! {
                r = udp_socket.recv_from(&mut udp_buffer) => match r {
                    Ok(v) => v,
                    Err(e) => {
                        error!("UDP recv error: {}", e);
                        time::sleep(Duration::from_millis(100)).await;
                        continue;
                    }
                },
                _ = shutdown.cancelled() => break,
            };

            let site_id = {
                let map = endpoint_map.read().await;
                map.get(&src).copied()
            };
            let Some(site_id) = site_id else {
                debug!("Packet from unknown endpoint {}", src);
                continue;
            };

            let mut peers_guard = peers.lock().await;
            let Some(peer) = peers_guard.get_mut(&site_id) else {
                continue;
            };

            match peer
                .tunn
                .decapsulate(Some(src.ip()), &udp_buffer[..n], &mut tun_buffer)
            {
                TunnResult::Done => {}
                TunnResult::Err(e) => {
                    warn!("Decapsulation error from {}: {:?}", src, e);
                }
                TunnResult::WriteToNetwork(data) => {
                    if let Err(e) = udp_socket.send_to(data, src).await {
                        warn!("UDP send error to {}: {}", src, e);
                    } else {
                        peer.last_activity = Instant::now();
                    }
                }
                TunnResult::WriteToTunnelV4(data, _) | TunnResult::WriteToTunnelV6(data, _) => {
                    peer.last_activity = Instant::now();
                    drop(peers_guard);

                    let mut device_guard = tun_device.lock().await;
                    match device_guard.write(data) {
                        Ok(_) => {}
                        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                            debug!("TUN write would block");
                        }
                        Err(e) => error!("TUN write error: {}", e),
                    }
                }
            }
        }
        debug!("Inbound task stopped");
    }

    /// Timer pump for keepalive and rekey
    async fn timer_task(
        udp_socket: Arc<TokioUdpSocket>,
        peers: Arc<Mutex<HashMap<SiteId, SitePeer>>>,
        shutdown: CancellationToken,
    ) {
        debug!("Timer task started");
        let mut interval = time::interval(TIMER_TICK_INTERVAL);
        let mut wg_buffer = vec![0u8; MAX_PACKET_SIZE];

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = shutdown.cancelled() => break,
            }

            let mut peers_guard = peers.lock().await;
            for peer in peers_guard.values_mut() {
                match peer.tunn.update_timers(&mut wg_buffer) {
                    TunnResult::Done => {}
                    TunnResult::Err(e) => {
                        debug!("Timer update error for site {}: {:?}", peer.site_id, e);
                    }
                    TunnResult::WriteToNetwork(data) => {
                        if let Err(e) = udp_socket.send_to(data, peer.endpoint).await {
                            warn!("UDP send error in timer task: {}", e);
                        } else {
                            peer.last_activity = Instant::now();
                        }
                    }
                    TunnResult::WriteToTunnelV4(_, _) | TunnResult::WriteToTunnelV6(_, _) => {}
                }
            }
        }
        debug!("Timer task stopped");
    }

    /// Upsert a site peer.
    ///
    /// Re-invoking for a site whose public key is unchanged updates the
    /// endpoint only, preserving the established tunnel session and the
    /// allowed host IP. A changed public key replaces the tunnel state.
    pub async fn configure_peer(&self, site: &SiteConfig) -> Result<()> {
        let endpoint = resolve_endpoint(&site.endpoint).await?;

        let mut peers = self.peers.lock().await;
        let mut endpoint_map = self.endpoint_map.write().await;

        if let Some(existing) = peers.get_mut(&site.site_id) {
            let new_key = X25519PublicKey::from(*site.parse_public_key()?.as_bytes());
            if existing.public_key == new_key {
                debug!(
                    "Updating endpoint for site {}: {} -> {}",
                    site.site_id, existing.endpoint, endpoint
                );
                endpoint_map.remove(&existing.endpoint);
                existing.endpoint = endpoint;
                endpoint_map.insert(endpoint, site.site_id);
                return Ok(());
            }

            info!("Site {} rotated its public key, replacing tunnel state", site.site_id);
            endpoint_map.remove(&existing.endpoint);
            peers.remove(&site.site_id);
        }

        let index = {
            let mut next = self.next_index.lock().await;
            let i = *next;
            *next += 1;
            i
        };

        let local_private = StaticSecret::from(*self.config.keypair.private.as_bytes());
        let peer = SitePeer::new(site, endpoint, local_private, index)?;
        endpoint_map.insert(endpoint, site.site_id);
        peers.insert(site.site_id, peer);

        info!(
            "Configured site {} peer at {} (allowed IP {}/32)",
            site.site_id, endpoint, site.server_ip
        );
        Ok(())
    }

    /// Point an existing site peer at a new endpoint (failover path).
    /// Returns an error when the site is not configured.
    pub async fn set_peer_endpoint(&self, site_id: SiteId, endpoint: SocketAddr) -> Result<()> {
        let mut peers = self.peers.lock().await;
        let mut endpoint_map = self.endpoint_map.write().await;

        let peer = peers.get_mut(&site_id).ok_or_else(|| {
            OlmError::Internal(format!("Site {} is not configured on the device", site_id))
        })?;

        endpoint_map.remove(&peer.endpoint);
        peer.endpoint = endpoint;
        endpoint_map.insert(endpoint, site_id);
        info!("Site {} endpoint moved to {}", site_id, endpoint);
        Ok(())
    }

    /// Remove a site peer. Returns whether the site was present.
    pub async fn remove_peer(&self, site_id: SiteId) -> bool {
        let mut peers = self.peers.lock().await;
        let mut endpoint_map = self.endpoint_map.write().await;

        match peers.remove(&site_id) {
            Some(peer) => {
                endpoint_map.remove(&peer.endpoint);
                info!("Removed site {} peer", site_id);
                true
            }
            None => {
                warn!("Site {} not found for removal", site_id);
                false
            }
        }
    }

    /// The endpoint a site's traffic currently flows to
    pub async fn peer_endpoint(&self, site_id: SiteId) -> Option<SocketAddr> {
        self.peers.lock().await.get(&site_id).map(|p| p.endpoint)
    }

    /// Number of configured site peers
    pub async fn peer_count(&self) -> usize {
        self.peers.lock().await.len()
    }

    /// The actual interface name
    pub fn interface_name(&self) -> &str {
        &self.actual_interface
    }

    /// The fixed local UDP source port
    pub fn source_port(&self) -> u16 {
        self.config.source_port
    }

    /// Current lifecycle state
    pub async fn state(&self) -> DeviceState {
        *self.state.lock().await
    }

    /// Stop the pumps and release the socket and TUN. Idempotent.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if *state == DeviceState::Closed {
            return;
        }
        *state = DeviceState::Closed;
        drop(state);

        info!("Closing WireGuard device");
        self.shutdown.cancel();

        let mut handles = self.task_handles.lock().await;
        let join_all = async {
            for handle in handles.drain(..) {
                let _ = handle.await;
            }
        };
        if time::timeout(Duration::from_secs(5), join_all).await.is_err() {
            warn!("Timeout waiting for device tasks to stop");
        }

        self.peers.lock().await.clear();
        self.endpoint_map.write().await.clear();
        info!("WireGuard device closed");
    }
}

/// Extract the IPv4 destination address from a raw TUN packet
fn destination_ip(packet: &[u8]) -> Option<IpAddr> {
    if packet.len() < 20 || packet[0] >> 4 != 4 {
        return None;
    }
    Some(IpAddr::from([
        packet[16], packet[17], packet[18], packet[19],
    ]))
}

/// Resolve a `host:port` endpoint string, taking the first address
pub async fn resolve_endpoint(endpoint: &str) -> Result<SocketAddr> {
    lookup_host(endpoint)
        .await
        .map_err(|e| OlmError::Transport(format!("Failed to resolve '{}': {}", endpoint, e)))?
        .next()
        .ok_or_else(|| {
            OlmError::Transport(format!("Endpoint '{}' resolved to no addresses", endpoint))
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_destination_ip_parses_ipv4() {
        let mut packet = vec![0u8; 20];
        packet[0] = 0x45;
        packet[16] = 10;
        packet[17] = 0;
        packet[18] = 0;
        packet[19] = 1;
        assert_eq!(destination_ip(&packet), Some("10.0.0.1".parse().unwrap()));
    }

    #[test]
    fn test_destination_ip_rejects_short_and_v6() {
        assert_eq!(destination_ip(&[0x45, 0, 0]), None);
        let mut v6 = vec![0u8; 40];
        v6[0] = 0x60;
        assert_eq!(destination_ip(&v6), None);
    }

    #[tokio::test]
    async fn test_resolve_endpoint_literal() {
        let addr = resolve_endpoint("127.0.0.1:51820").await.unwrap();
        assert_eq!(addr.port(), 51820);
        assert!(addr.ip().is_loopback());
    }

    #[tokio::test]
    async fn test_resolve_endpoint_garbage() {
        assert!(resolve_endpoint("not-an-endpoint").await.is_err());
    }

    #[test]
    fn test_device_state_display() {
        assert_eq!(DeviceState::Up.to_string(), "up");
        assert_eq!(DeviceState::Closed.to_string(), "closed");
    }
}
