//! macOS platform implementation
//!
//! macOS tunnels are kernel-managed `utun` devices; the first unused
//! index is picked at creation. Addressing uses point-to-point
//! `ifconfig`, routes use `route`, DNS uses `scutil`.

use crate::error::{OlmError, Result};
use crate::platform::Platform;
use std::io::Write;
use std::process::{Command, Stdio};
use tracing::{debug, info, warn};

/// macOS platform implementation
pub struct MacOsPlatform;

impl MacOsPlatform {
    /// Create a new macOS platform instance
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

    /// First `utunN` name not currently in use
    fn free_utun_name(&self) -> String {
        let existing = self
            .run_command("ifconfig", &["-l"])
            .unwrap_or_default();
        let taken: Vec<&str> = existing.split_whitespace().collect();

        for index in 0..=255u16 {
            let candidate = format!("utun{}", index);
            if !taken.contains(&candidate.as_str()) {
                return candidate;
            }
        }
        "utun255".to_string()
    }

    /// Run a scutil script; failures are logged, not fatal
    fn scutil(&self, script: &str) -> Result<()> {
        let mut child = Command::new("scutil")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| OlmError::Platform(format!("Failed to spawn scutil: {}", e)))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(script.as_bytes())
                .map_err(|e| OlmError::Platform(format!("Failed to write to scutil: {}", e)))?;
        }

        let output = child
            .wait_with_output()
            .map_err(|e| OlmError::Platform(format!("Failed to wait for scutil: {}", e)))?;

        if !output.status.success() {
            warn!(
                "scutil returned non-zero status: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Ok(())
    }
}

impl Default for MacOsPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl Platform for MacOsPlatform {
    fn create_tun(&self, name: &str, mtu: u16) -> Result<tun::platform::Device> {
        // The kernel only hands out utunN names; a configured name like
        // "olm" maps to the first free index
        let utun_name = if name.starts_with("utun") {
            name.to_string()
        } else {
            self.free_utun_name()
        };
        info!("Creating TUN device '{}' with MTU {}", utun_name, mtu);

        let config = crate::platform::base_tun_config(&utun_name, mtu);
        let device = tun::create(&config).map_err(|e| {
            OlmError::Device(format!("Failed to create TUN device '{}': {}", utun_name, e))
        })?;

        Ok(device)
    }

    fn configure_address(&self, interface: &str, address: &str) -> Result<()> {
        info!("Assigning {} to interface {}", address, interface);
        // utun is point-to-point: local and destination are the same
        // host address; peer reachability comes from host routes
        self.run_command("ifconfig", &[interface, address, address, "up"])?;
        Ok(())
    }

    fn configure_dns(&self, interface: &str, dns: &str) -> Result<()> {
        info!("Configuring DNS {} for interface {}", dns, interface);
        let script = format!(
            "d.init\nd.add ServerAddresses * {}\nset State:/Network/Service/{}/DNS\nquit\n",
            dns, interface
        );
        self.scutil(&script)
    }

    fn remove_dns(&self, interface: &str) -> Result<()> {
        debug!("Removing DNS configuration for interface {}", interface);
        let script = format!("remove State:/Network/Service/{}/DNS\nquit\n", interface);
        self.scutil(&script)
    }

    fn add_route(&self, interface: &str, host_ip: &str) -> Result<()> {
        info!("Adding host route {} via {}", host_ip, interface);
        self.run_command(
            "route",
            &["add", "-host", host_ip, "-interface", interface],
        )?;
        Ok(())
    }

    fn remove_route(&self, _interface: &str, host_ip: &str) -> Result<()> {
        info!("Removing host route {}", host_ip);
        let _ = self.run_command("route", &["delete", "-host", host_ip]);
        Ok(())
    }
}
