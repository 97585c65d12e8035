//! Integration tests for olm
//!
//! These tests exercise the directive data flow across modules: wire
//! decoding, site-set convergence, credential persistence, and the
//! status surface, without touching a real TUN device.

use olm::config::{parse_duration, CredentialStore, Overrides, Settings, StoredCredentials};
use olm::control::message::{
    Envelope, PeerRelayData, PeerRemoveData, SiteConfig, WgData, MSG_CONNECT, MSG_PEER_RELAY,
};
use olm::status;
use olm::supervisor::{find_free_source_port, remove_site, upsert_site};
use std::time::Duration;

fn site(id: u64, ip: &str) -> SiteConfig {
    SiteConfig {
        site_id: id,
        public_key: "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=".to_string(),
        endpoint: "1.2.3.4:51820".to_string(),
        server_ip: ip.to_string(),
        server_port: 51820,
    }
}

#[test]
fn test_connect_directive_decodes_end_to_end() {
    // The wire shape a server actually sends
    let frame = r#"{
        "type": "olm/wg/connect",
        "data": {
            "tunnelIP": "10.0.0.2",
            "sites": [{
                "siteId": 1,
                "publicKey": "AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA=",
                "endpoint": "1.2.3.4:51820",
                "serverIP": "10.0.0.1",
                "serverPort": 51820
            }]
        }
    }"#;

    let envelope: Envelope = serde_json::from_str(frame).unwrap();
    assert_eq!(envelope.message_type, MSG_CONNECT);

    let wg_data: WgData = serde_json::from_value(envelope.data).unwrap();
    assert_eq!(wg_data.tunnel_ip, "10.0.0.2");
    assert_eq!(wg_data.sites.len(), 1);

    let site = &wg_data.sites[0];
    assert_eq!(site.site_id, 1);
    assert_eq!(site.server_ip, "10.0.0.1");
    assert!(site.parse_public_key().is_ok());
}

#[test]
fn test_relay_and_remove_payloads_decode() {
    let relay: Envelope = serde_json::from_str(
        r#"{"type": "olm/wg/peer/relay", "data": {"siteId": 1, "endpoint": "relay.example:51820"}}"#,
    )
    .unwrap();
    assert_eq!(relay.message_type, MSG_PEER_RELAY);
    let relay_data: PeerRelayData = serde_json::from_value(relay.data).unwrap();
    assert_eq!(relay_data.endpoint, "relay.example:51820");

    let remove_data: PeerRemoveData =
        serde_json::from_str(r#"{"siteId": 3}"#).unwrap();
    assert_eq!(remove_data.site_id, 3);
}

#[test]
fn test_add_remove_returns_to_pre_add_state() {
    let mut sites = vec![site(1, "10.0.0.1")];
    let baseline: Vec<u64> = sites.iter().map(|s| s.site_id).collect();

    upsert_site(&mut sites, site(2, "10.0.0.2"));
    assert_eq!(sites.len(), 2);

    remove_site(&mut sites, 2).unwrap();
    let after: Vec<u64> = sites.iter().map(|s| s.site_id).collect();
    assert_eq!(baseline, after);
}

#[test]
fn test_peer_churn_scenario() {
    // connect with site 1, then peer/add site 2, then peer/remove site 1
    let mut sites = vec![site(1, "10.0.0.1")];

    upsert_site(&mut sites, site(2, "10.0.0.5"));
    let removed = remove_site(&mut sites, 1).unwrap();

    assert_eq!(removed.server_ip, "10.0.0.1");
    assert_eq!(sites.len(), 1);
    assert_eq!(sites[0].site_id, 2);
    assert_eq!(sites[0].server_ip, "10.0.0.5");
}

#[test]
fn test_settings_duration_flags() {
    let settings = Settings::resolve(Overrides {
        ping_interval: Some("3s".to_string()),
        ping_timeout: Some("5s".to_string()),
        ..Default::default()
    })
    .unwrap();

    assert_eq!(settings.ping_interval, Duration::from_secs(3));
    assert_eq!(settings.ping_timeout, Duration::from_secs(5));
    assert!(parse_duration("oops").is_err());
}

#[test]
fn test_credentials_survive_restart() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join("credentials.json");

    {
        let store = CredentialStore::new(&path);
        store
            .save(&StoredCredentials {
                olm_id: "olm-1".to_string(),
                secret: "hunter2".to_string(),
                endpoint: "https://p.example".to_string(),
                token: Some("tok".to_string()),
            })
            .unwrap();
    }

    // A fresh store over the same path sees the same credentials
    let store = CredentialStore::new(&path);
    let saved = store.load().unwrap().unwrap();
    assert_eq!(saved.olm_id, "olm-1");
    assert_eq!(saved.token.as_deref(), Some("tok"));
}

#[test]
fn test_status_surface_reflects_peer_lifecycle() {
    let (handle, _rx) = status::channel();

    handle.set_connection_status(true);
    handle.update_peer_status(1, true, Some(Duration::from_millis(10)));
    handle.update_peer_status(1, false, None);
    handle.update_peer_status(2, true, Some(Duration::from_millis(7)));
    handle.remove_peer(1);

    let snapshot = handle.snapshot();
    assert!(snapshot.connected);
    assert_eq!(snapshot.peers.len(), 1);
    assert!(snapshot.peers.contains_key(&2));
}

#[test]
fn test_source_port_selection_is_stable_range() {
    for _ in 0..8 {
        let port = find_free_source_port().unwrap();
        assert!((49152..=65535).contains(&port));
    }
}
