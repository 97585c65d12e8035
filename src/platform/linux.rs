//! Linux platform implementation
//!
//! TUN creation via the tun crate; addressing, routing, and DNS via the
//! `ip` and `resolvectl` tools.

use crate::error::{OlmError, Result};
use crate::platform::Platform;
use std::process::Command;
use tracing::{debug, info, warn};

/// Linux platform implementation
pub struct LinuxPlatform;

impl LinuxPlatform {
    /// Create a new Linux platform instance
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

impl Default for LinuxPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for LinuxPlatform {
    fn create_tun(&self, name: &str, mtu: u16) -> Result<tun::platform::Device> {
        info!("Creating TUN device '{}' with MTU {}", name, mtu);

        let mut config = crate::platform::base_tun_config(name, mtu);
        config.platform(|config| {
            // TUN mode, no packet-information header
            config.packet_information(false);
        });

        let device = tun::create(&config).map_err(|e| {
            OlmError::Device(format!("Failed to create TUN device '{}': {}", name, e))
        })?;

        Ok(device)
    }

    fn configure_address(&self, interface: &str, address: &str) -> Result<()> {
        info!("Assigning {} to interface {}", address, interface);
        // Exact-host address; reachability to peers comes from host routes
        self.run_command(
            "ip",
            &["addr", "add", &format!("{}/32", address), "dev", interface],
        )?;
        self.run_command("ip", &["link", "set", interface, "up"])?;
        Ok(())
    }

    fn configure_dns(&self, interface: &str, dns: &str) -> Result<()> {
        info!("Configuring DNS {} for interface {}", dns, interface);

        if self.run_command("resolvectl", &["dns", interface, dns]).is_ok() {
            return Ok(());
        }

        // Fall back to resolvconf when systemd-resolved is absent
        let entry = format!("nameserver {}\n", dns);
        let result = Command::new("resolvconf")
            .args(["-a", interface])
            .stdin(std::process::Stdio::piped())
            .spawn()
            .and_then(|mut child| {
                use std::io::Write;
                if let Some(mut stdin) = child.stdin.take() {
                    stdin.write_all(entry.as_bytes())?;
                }
                child.wait()
            });

        match result {
            Ok(status) if status.success() => Ok(()),
            _ => {
                warn!("No DNS configuration mechanism available, skipping");
                Ok(())
            }
        }
    }

    fn remove_dns(&self, interface: &str) -> Result<()> {
        debug!("Removing DNS configuration for interface {}", interface);
        let _ = self.run_command("resolvectl", &["revert", interface]);
        let _ = self.run_command("resolvconf", &["-d", interface]);
        Ok(())
    }

    fn add_route(&self, interface: &str, host_ip: &str) -> Result<()> {
        info!("Adding host route {}/32 via {}", host_ip, interface);
        self.run_command(
            "ip",
            &["route", "add", &format!("{}/32", host_ip), "dev", interface],
        )?;
        Ok(())
    }

    fn remove_route(&self, interface: &str, host_ip: &str) -> Result<()> {
        info!("Removing host route {}/32 from {}", host_ip, interface);
        // The route may already be gone with the interface
        let _ = self.run_command(
            "ip",
            &["route", "del", &format!("{}/32", host_ip), "dev", interface],
        );
        Ok(())
    }
}
