//! Configuration management
//!
//! Settings are assembled from the environment first, then CLI flags, then
//! built-in defaults: an environment variable always wins when set, CLI
//! flags fill the gaps. The three credentials (`id`, `secret`, `endpoint`)
//! may all be absent at startup; the supervisor then blocks until the
//! status surface supplies them.

mod store;

pub use store::{CredentialStore, StoredCredentials};

use crate::error::{OlmError, Result};
use std::time::Duration;

/// Default tunnel MTU
pub const DEFAULT_MTU: u16 = 1280;

/// Default DNS server pushed to the tunnel interface
pub const DEFAULT_DNS: &str = "8.8.8.8";

/// Default tunnel interface name
pub const DEFAULT_INTERFACE: &str = "olm";

/// Default bind address for the status HTTP surface
pub const DEFAULT_HTTP_ADDR: &str = ":9452";

/// Default control-plane ping cadence
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(3);

/// Default per-ping timeout
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(5);

/// CLI flag values handed in by the binary; `None` means the flag was not
/// given and the default applies.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    /// --endpoint
    pub endpoint: Option<String>,
    /// --id
    pub id: Option<String>,
    /// --secret
    pub secret: Option<String>,
    /// --mtu
    pub mtu: Option<u16>,
    /// --dns
    pub dns: Option<String>,
    /// --log-level
    pub log_level: Option<String>,
    /// --interface
    pub interface: Option<String>,
    /// --http-addr
    pub http_addr: Option<String>,
    /// --http
    pub enable_http: bool,
    /// --ping-interval
    pub ping_interval: Option<String>,
    /// --ping-timeout
    pub ping_timeout: Option<String>,
}

/// Resolved agent settings
#[derive(Debug, Clone)]
pub struct Settings {
    /// Client identifier issued by Pangolin
    pub id: Option<String>,
    /// Client secret issued by Pangolin
    pub secret: Option<String>,
    /// Control-plane endpoint, e.g. `https://pangolin.example.com`
    pub endpoint: Option<String>,
    /// Tunnel MTU
    pub mtu: u16,
    /// DNS server for the tunnel interface
    pub dns: String,
    /// Log filter level
    pub log_level: String,
    /// Tunnel interface name
    pub interface: String,
    /// Status surface bind address
    pub http_addr: String,
    /// Whether the status HTTP surface is enabled
    pub enable_http: bool,
    /// Control-plane ping cadence
    pub ping_interval: Duration,
    /// Per-ping timeout
    pub ping_timeout: Duration,
}

impl Settings {
    /// Assemble settings: environment over CLI over defaults.
    ///
    /// Fails on malformed numeric or duration values; a missing credential
    /// is not an error here.
    pub fn resolve(cli: Overrides) -> Result<Self> {
        let endpoint = env_or("PANGOLIN_ENDPOINT", cli.endpoint);
        let id = env_or("OLM_ID", cli.id);
        let secret = env_or("OLM_SECRET", cli.secret);

        let mtu = match std::env::var("MTU") {
            Ok(v) => v
                .parse::<u16>()
                .map_err(|e| OlmError::Config(format!("Invalid MTU '{}': {}", v, e)))?,
            Err(_) => cli.mtu.unwrap_or(DEFAULT_MTU),
        };

        let ping_interval = match env_or("PING_INTERVAL", cli.ping_interval) {
            Some(v) => parse_duration(&v)?,
            None => DEFAULT_PING_INTERVAL,
        };
        let ping_timeout = match env_or("PING_TIMEOUT", cli.ping_timeout) {
            Some(v) => parse_duration(&v)?,
            None => DEFAULT_PING_TIMEOUT,
        };

        Ok(Self {
            id,
            secret,
            endpoint: endpoint.map(|e| e.trim_end_matches('/').to_string()),
            mtu,
            dns: env_or("DNS", cli.dns).unwrap_or_else(|| DEFAULT_DNS.to_string()),
            log_level: env_or("LOG_LEVEL", cli.log_level)
                .unwrap_or_else(|| "INFO".to_string()),
            interface: env_or("INTERFACE", cli.interface)
                .unwrap_or_else(|| DEFAULT_INTERFACE.to_string()),
            http_addr: env_or("HTTP_ADDR", cli.http_addr)
                .unwrap_or_else(|| DEFAULT_HTTP_ADDR.to_string()),
            enable_http: cli.enable_http,
            ping_interval,
            ping_timeout,
        })
    }

    /// Whether all three startup credentials are present
    pub fn has_credentials(&self) -> bool {
        self.id.is_some() && self.secret.is_some() && self.endpoint.is_some()
    }

    /// Fill the credential fields from a status-surface connect request
    pub fn apply_credentials(&mut self, id: String, secret: String, endpoint: String) {
        self.id = Some(id);
        self.secret = Some(secret);
        self.endpoint = Some(endpoint.trim_end_matches('/').to_string());
    }

    /// The status bind address normalized for a socket bind; a bare
    /// `:port` becomes `0.0.0.0:port`.
    pub fn http_bind_addr(&self) -> String {
        if self.http_addr.starts_with(':') {
            format!("0.0.0.0{}", self.http_addr)
        } else {
            self.http_addr.clone()
        }
    }
}

fn env_or(key: &str, cli: Option<String>) -> Option<String> {
    match std::env::var(key) {
        Ok(v) if !v.is_empty() => Some(v),
        _ => cli,
    }
}

/// Parse a duration string of the form `500ms`, `3s`, `1m`, or `2h`.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim();
    let split = s
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| OlmError::Config(format!("Duration '{}' is missing a unit", s)))?;
    let (num, unit) = s.split_at(split);
    let value: u64 = num
        .parse()
        .map_err(|e| OlmError::Config(format!("Invalid duration '{}': {}", s, e)))?;

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        other => Err(OlmError::Config(format!(
            "Unknown duration unit '{}' in '{}'",
            other, s
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("3s").unwrap(), Duration::from_secs(3));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn test_parse_duration_rejects_missing_unit() {
        assert!(parse_duration("3").is_err());
        assert!(parse_duration("").is_err());
        assert!(parse_duration("3d").is_err());
        assert!(parse_duration("s").is_err());
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::resolve(Overrides::default()).unwrap();
        assert_eq!(settings.mtu, DEFAULT_MTU);
        assert_eq!(settings.dns, DEFAULT_DNS);
        assert_eq!(settings.interface, DEFAULT_INTERFACE);
        assert_eq!(settings.http_addr, DEFAULT_HTTP_ADDR);
        assert_eq!(settings.ping_interval, DEFAULT_PING_INTERVAL);
        assert_eq!(settings.ping_timeout, DEFAULT_PING_TIMEOUT);
        assert!(!settings.has_credentials());
    }

    #[test]
    fn test_cli_fills_gaps() {
        let settings = Settings::resolve(Overrides {
            id: Some("olm-1".to_string()),
            secret: Some("hunter2".to_string()),
            endpoint: Some("https://p.example/".to_string()),
            mtu: Some(1420),
            ..Default::default()
        })
        .unwrap();

        assert!(settings.has_credentials());
        assert_eq!(settings.mtu, 1420);
        // Trailing slash is stripped so URL joins stay predictable
        assert_eq!(settings.endpoint.as_deref(), Some("https://p.example"));
    }

    #[test]
    fn test_http_bind_addr() {
        let mut settings = Settings::resolve(Overrides::default()).unwrap();
        assert_eq!(settings.http_bind_addr(), "0.0.0.0:9452");
        settings.http_addr = "127.0.0.1:8080".to_string();
        assert_eq!(settings.http_bind_addr(), "127.0.0.1:8080");
    }

    #[test]
    fn test_apply_credentials() {
        let mut settings = Settings::resolve(Overrides::default()).unwrap();
        settings.apply_credentials(
            "olm-2".to_string(),
            "s".to_string(),
            "https://p.example/".to_string(),
        );
        assert!(settings.has_credentials());
        assert_eq!(settings.endpoint.as_deref(), Some("https://p.example"));
    }
}
