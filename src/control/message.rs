//! Control-plane message types
//!
//! Every frame on the control channel is a JSON envelope `{type, data}`.
//! Decoding happens in two passes: the envelope first, then the payload
//! for whichever handler is registered for the type string.

use crate::error::Result;
use crate::wireguard::PublicKey;
use serde::{Deserialize, Serialize};

/// Numeric site identifier, unique within the peer set
pub type SiteId = u64;

/// Inbound: cache the server's WireGuard public key
pub const MSG_HOLEPUNCH: &str = "olm/wg/holepunch";
/// Inbound: bring up the tunnel and configure all sites
pub const MSG_CONNECT: &str = "olm/wg/connect";
/// Inbound: reconfigure an existing peer
pub const MSG_PEER_UPDATE: &str = "olm/wg/peer/update";
/// Inbound: add a peer and its route
pub const MSG_PEER_ADD: &str = "olm/wg/peer/add";
/// Inbound: remove a peer and its route
pub const MSG_PEER_REMOVE: &str = "olm/wg/peer/remove";
/// Inbound: fail a peer over to a relay endpoint
pub const MSG_PEER_RELAY: &str = "olm/wg/peer/relay";
/// Inbound: close the client
pub const MSG_TERMINATE: &str = "olm/terminate";

/// Outbound: announce the local public key until a connect arrives
pub const MSG_REGISTER: &str = "newt/wg/register";
/// Outbound: liveness ping
pub const MSG_PING: &str = "olm/ping";
/// Outbound: per-site reachability report
pub const MSG_STATUS: &str = "olm/status";

/// The `{type, data}` envelope every frame carries
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Message type string, e.g. `olm/wg/connect`
    #[serde(rename = "type")]
    pub message_type: String,

    /// Type-specific payload, decoded in a second pass
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Envelope {
    /// Build an envelope from a type string and serializable payload
    pub fn new<T: Serialize>(message_type: &str, data: &T) -> Result<Self> {
        Ok(Self {
            message_type: message_type.to_string(),
            data: serde_json::to_value(data)?,
        })
    }
}

/// One remote site: a WireGuard peer coordinated by the control plane
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    /// Unique site identifier
    #[serde(rename = "siteId")]
    pub site_id: SiteId,

    /// The site's WireGuard public key, base64
    #[serde(rename = "publicKey")]
    pub public_key: String,

    /// The site's primary endpoint, `host:port` (may be a DNS name)
    pub endpoint: String,

    /// The site's overlay IP; also the allowed-IP/route target
    #[serde(rename = "serverIP")]
    pub server_ip: String,

    /// The site's WireGuard listen port
    #[serde(rename = "serverPort")]
    pub server_port: u16,
}

impl SiteConfig {
    /// Decode the site's public key
    pub fn parse_public_key(&self) -> Result<PublicKey> {
        PublicKey::from_base64(&self.public_key)
    }
}

/// Initial tunnel configuration delivered by `olm/wg/connect`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WgData {
    /// Local overlay address for the tunnel interface
    #[serde(rename = "tunnelIP")]
    pub tunnel_ip: String,

    /// MTU override
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u16>,

    /// DNS override
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns: Option<String>,

    /// The initial site set
    #[serde(default)]
    pub sites: Vec<SiteConfig>,
}

/// Payload of `olm/wg/holepunch`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HolePunchData {
    /// The coordinating server's WireGuard public key, base64
    #[serde(rename = "serverPubKey")]
    pub server_pub_key: String,
}

/// Payload of `olm/wg/peer/remove`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRemoveData {
    /// Site to remove
    #[serde(rename = "siteId")]
    pub site_id: SiteId,
}

/// Payload of `olm/wg/peer/relay`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerRelayData {
    /// Site to fail over
    #[serde(rename = "siteId")]
    pub site_id: SiteId,

    /// Relay endpoint, `host:port`
    pub endpoint: String,
}

/// Payload of the outbound `newt/wg/register` announcement
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterData {
    /// The local WireGuard public key, base64
    #[serde(rename = "publicKey")]
    pub public_key: String,
}

/// Payload of the outbound `olm/status` report
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerStatusData {
    /// Site being reported
    #[serde(rename = "siteId")]
    pub site_id: SiteId,

    /// Whether probes currently succeed
    pub connected: bool,

    /// Last observed round-trip time in milliseconds
    #[serde(rename = "rttMs", skip_serializing_if = "Option::is_none")]
    pub rtt_ms: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_roundtrip() {
        let data = PeerRemoveData { site_id: 7 };
        let envelope = Envelope::new(MSG_PEER_REMOVE, &data).unwrap();
        let json = serde_json::to_string(&envelope).unwrap();
        assert!(json.contains("\"type\":\"olm/wg/peer/remove\""));
        assert!(json.contains("\"siteId\":7"));

        let decoded: Envelope = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded.message_type, MSG_PEER_REMOVE);
        let payload: PeerRemoveData = serde_json::from_value(decoded.data).unwrap();
        assert_eq!(payload.site_id, 7);
    }

    #[test]
    fn test_envelope_tolerates_missing_data() {
        let decoded: Envelope = serde_json::from_str(r#"{"type":"olm/terminate"}"#).unwrap();
        assert_eq!(decoded.message_type, MSG_TERMINATE);
        assert!(decoded.data.is_null());
    }

    #[test]
    fn test_site_config_wire_names() {
        let json = r#"{
            "siteId": 1,
            "publicKey": "cGsxcGsxcGsxcGsxcGsxcGsxcGsxcGsxcGsxcGsxcGs=",
            "endpoint": "1.2.3.4:51820",
            "serverIP": "10.0.0.1",
            "serverPort": 51820
        }"#;
        let site: SiteConfig = serde_json::from_str(json).unwrap();
        assert_eq!(site.site_id, 1);
        assert_eq!(site.server_ip, "10.0.0.1");
        assert_eq!(site.server_port, 51820);
        assert!(site.parse_public_key().is_ok());
    }

    #[test]
    fn test_wg_data_optional_overrides() {
        let json = r#"{"tunnelIP": "10.0.0.2", "sites": []}"#;
        let data: WgData = serde_json::from_str(json).unwrap();
        assert_eq!(data.tunnel_ip, "10.0.0.2");
        assert!(data.mtu.is_none());
        assert!(data.dns.is_none());
        assert!(data.sites.is_empty());
    }
}
