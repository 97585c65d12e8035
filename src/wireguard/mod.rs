//! WireGuard keys and device facade
//!
//! Key management uses x25519-dalek; the data plane is boringtun driving
//! a TUN device, with the UDP socket pinned to the process's fixed source
//! port.

mod device;
mod keys;

pub use device::{resolve_endpoint, DeviceConfig, DeviceState, WgDevice};
pub use keys::{KeyPair, PrivateKey, PublicKey};
