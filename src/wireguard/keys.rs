//! WireGuard key management
//!
//! Secure generation and encoding of WireGuard x25519 keys. A fresh key
//! pair is generated on every process start; only public keys ever cross
//! a process boundary.

use crate::error::{OlmError, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::fmt;
use x25519_dalek::{PublicKey as X25519PublicKey, StaticSecret};
use zeroize::Zeroizing;

/// WireGuard private key (32 bytes, x25519)
#[derive(Clone)]
pub struct PrivateKey {
    secret: Zeroizing<[u8; 32]>,
}

impl PrivateKey {
    /// Generate a new random private key
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        Self {
            secret: Zeroizing::new(secret.to_bytes()),
        }
    }

    /// Create a private key from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self {
            secret: Zeroizing::new(bytes),
        }
    }

    /// Convert to base64-encoded string
    pub fn to_base64(&self) -> String {
        BASE64.encode(*self.secret)
    }

    /// Get the corresponding public key
    pub fn public_key(&self) -> PublicKey {
        let secret = StaticSecret::from(*self.secret);
        let public = X25519PublicKey::from(&secret);
        PublicKey {
            key: public.to_bytes(),
        }
    }

    /// Get raw bytes (for boringtun)
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.secret
    }
}

impl fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PrivateKey([REDACTED])")
    }
}

// Ensure private keys are never accidentally logged
impl fmt::Display for PrivateKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

/// WireGuard public key (32 bytes, x25519)
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PublicKey {
    key: [u8; 32],
}

impl PublicKey {
    /// Create a public key from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self { key: bytes }
    }

    /// Parse a public key from base64-encoded string
    pub fn from_base64(s: &str) -> Result<Self> {
        let decoded = BASE64
            .decode(s.trim())
            .map_err(|e| OlmError::Config(format!("Invalid base64 public key: {}", e)))?;

        if decoded.len() != 32 {
            return Err(OlmError::Config(format!(
                "Invalid public key length: expected 32 bytes, got {}",
                decoded.len()
            )));
        }

        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&decoded);
        Ok(Self::from_bytes(bytes))
    }

    /// Convert to base64-encoded string
    pub fn to_base64(&self) -> String {
        BASE64.encode(self.key)
    }

    /// Get raw bytes (for boringtun)
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.key
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({})", self.to_base64())
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_base64())
    }
}

/// WireGuard key pair (private + public)
#[derive(Clone)]
pub struct KeyPair {
    /// Private key
    pub private: PrivateKey,
    /// Public key (derived from private)
    pub public: PublicKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        let private = PrivateKey::generate();
        let public = private.public_key();
        Self { private, public }
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("private", &"[REDACTED]")
            .field("public", &self.public)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_keypair() {
        let keypair = KeyPair::generate();
        assert_eq!(keypair.private.as_bytes().len(), 32);
        assert_eq!(keypair.public.as_bytes().len(), 32);
    }

    #[test]
    fn test_public_key_base64_roundtrip() {
        let public = PrivateKey::generate().public_key();
        let base64_str = public.to_base64();
        assert_eq!(base64_str.len(), 44); // Base64 of 32 bytes
        let restored = PublicKey::from_base64(&base64_str).unwrap();
        assert_eq!(public, restored);
    }

    #[test]
    fn test_public_key_derivation_is_deterministic() {
        let private = PrivateKey::generate();
        assert_eq!(private.public_key(), private.public_key());
    }

    #[test]
    fn test_private_key_not_logged() {
        let private = PrivateKey::generate();
        let debug_str = format!("{:?}", private);
        assert!(debug_str.contains("REDACTED"));
        assert!(!debug_str.contains(&private.to_base64()));
    }

    #[test]
    fn test_invalid_base64() {
        assert!(PublicKey::from_base64("invalid!@#$").is_err());
    }

    #[test]
    fn test_invalid_length() {
        let short_key = BASE64.encode([0u8; 16]);
        assert!(PublicKey::from_base64(&short_key).is_err());
    }
}
