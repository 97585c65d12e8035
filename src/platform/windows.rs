//! Windows platform implementation
//!
//! Addressing, routing, and DNS via `netsh` and `route`.

use crate::error::{OlmError, Result};
use crate::platform::Platform;
use std::process::Command;
use tracing::{debug, info};

/// Windows platform implementation
pub struct WindowsPlatform;

impl WindowsPlatform {
    /// Create a new Windows platform instance
    pub fn new() -> Self {
        Self
    }

    /// Execute a system command
    fn run_command(&self, program: &str, args: &[&str]) -> Result<String> {
        debug!("Executing command: {} {:?}", program, args);

        let output = Command::new(program).args(args).output().map_err(|e| {
            OlmError::Platform(format!(
                "Failed to execute {} {}: {}",
                program,
                args.join(" "),
                e
            ))
        })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(OlmError::Platform(format!(
                "Command failed: {} {}: {}",
                program,
                args.join(" "),
                stderr
            )));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl Default for WindowsPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for WindowsPlatform {
    fn create_tun(&self, name: &str, mtu: u16) -> Result<tun::platform::Device> {
        info!("Creating TUN device '{}' with MTU {}", name, mtu);
        let config = crate::platform::base_tun_config(name, mtu);
        let device = tun::create(&config).map_err(|e| {
            OlmError::Device(format!("Failed to create TUN device '{}': {}", name, e))
        })?;
        Ok(device)
    }

    fn configure_address(&self, interface: &str, address: &str) -> Result<()> {
        info!("Assigning {} to interface {}", address, interface);
        self.run_command(
            "netsh",
            &[
                "interface",
                "ip",
                "set",
                "address",
                &format!("name={}", interface),
                "static",
                address,
                "255.255.255.255",
            ],
        )?;
        Ok(())
    }

    fn configure_dns(&self, interface: &str, dns: &str) -> Result<()> {
        info!("Configuring DNS {} for interface {}", dns, interface);
        self.run_command(
            "netsh",
            &[
                "interface",
                "ip",
                "set",
                "dns",
                &format!("name={}", interface),
                "static",
                dns,
            ],
        )?;
        Ok(())
    }

    fn remove_dns(&self, interface: &str) -> Result<()> {
        debug!("Removing DNS configuration for interface {}", interface);
        let _ = self.run_command(
            "netsh",
            &[
                "interface",
                "ip",
                "set",
                "dns",
                &format!("name={}", interface),
                "dhcp",
            ],
        );
        Ok(())
    }

    fn add_route(&self, interface: &str, host_ip: &str) -> Result<()> {
        info!("Adding host route {}/32 via {}", host_ip, interface);
        self.run_command(
            "netsh",
            &[
                "interface",
                "ipv4",
                "add",
                "route",
                &format!("{}/32", host_ip),
                interface,
            ],
        )?;
        Ok(())
    }

    fn remove_route(&self, interface: &str, host_ip: &str) -> Result<()> {
        info!("Removing host route {}/32 from {}", host_ip, interface);
        let _ = self.run_command(
            "netsh",
            &[
                "interface",
                "ipv4",
                "delete",
                "route",
                &format!("{}/32", host_ip),
                interface,
            ],
        );
        Ok(())
    }
}
