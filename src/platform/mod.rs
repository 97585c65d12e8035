//! Platform-specific implementations
//!
//! TUN device creation, interface addressing, DNS, and host-route
//! manipulation per OS. Peer routes are always exact-host routes paired
//! one-to-one with configured WireGuard peers.

use crate::error::Result;

#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(target_os = "macos")]
pub mod macos;

#[cfg(target_os = "windows")]
pub mod windows;

/// Environment variable carrying an inherited TUN file descriptor
pub const TUN_FD_ENV: &str = "OLM_TUN_FD";

/// Platform trait for cross-platform abstractions
pub trait Platform: Send + Sync {
    /// Create and configure a TUN device for WireGuard packet I/O
    fn create_tun(&self, name: &str, mtu: u16) -> Result<tun::platform::Device>;

    /// Assign the overlay address to the interface
    fn configure_address(&self, interface: &str, address: &str) -> Result<()>;

    /// Configure the DNS server for the interface
    fn configure_dns(&self, interface: &str, dns: &str) -> Result<()>;

    /// Remove DNS configuration for the interface
    fn remove_dns(&self, interface: &str) -> Result<()>;

    /// Install an exact-host route for a peer's overlay IP
    fn add_route(&self, interface: &str, host_ip: &str) -> Result<()>;

    /// Remove a peer's host route
    fn remove_route(&self, interface: &str, host_ip: &str) -> Result<()>;
}

/// Get the platform implementation for the current OS
pub fn get_platform() -> Box<dyn Platform> {
    #[cfg(target_os = "linux")]
    {
        Box::new(linux::LinuxPlatform::new())
    }

    #[cfg(target_os = "macos")]
    {
        Box::new(macos::MacOsPlatform::new())
    }

    #[cfg(target_os = "windows")]
    {
        Box::new(windows::WindowsPlatform::new())
    }
}

/// Build the common tun crate configuration, honoring an inherited file
/// descriptor from `OLM_TUN_FD` when present.
pub(crate) fn base_tun_config(name: &str, mtu: u16) -> tun::Configuration {
    let mut config = tun::Configuration::default();
    config.name(name).mtu(mtu as i32).up();

    #[cfg(unix)]
    if let Ok(fd) = std::env::var(TUN_FD_ENV) {
        if let Ok(fd) = fd.parse::<i32>() {
            config.raw_fd(fd);
        }
    }

    config
}
