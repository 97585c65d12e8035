//! Error types for olm
//!
//! This module defines the error types used throughout the agent.
//! We use `thiserror` for ergonomic error definitions and `anyhow` for
//! error propagation at the binary boundary.

use thiserror::Error;

/// Main error type for olm operations
#[derive(Error, Debug)]
pub enum OlmError {
    /// Configuration-related errors (missing credential, invalid number)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Token acquisition failed or the server rejected the credentials
    #[error("Authentication error: {0}")]
    Auth(String),

    /// Socket dial, DNS resolution, or write failures
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed or unexpected control-plane messages
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// WireGuard device errors (TUN creation, peer configure)
    #[error("Device error: {0}")]
    Device(String),

    /// Platform-specific errors (route install/remove, DNS setup)
    #[error("Platform error: {0}")]
    Platform(String),

    /// Invariant violations that should never happen
    #[error("Internal error: {0}")]
    Internal(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Operation deadline exceeded
    #[error("Operation timed out: {0}")]
    Timeout(String),
}

/// Result type alias using OlmError
pub type Result<T> = std::result::Result<T, OlmError>;

impl From<serde_json::Error> for OlmError {
    fn from(err: serde_json::Error) -> Self {
        OlmError::Serialization(err.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for OlmError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        OlmError::Transport(err.to_string())
    }
}

impl From<reqwest::Error> for OlmError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            OlmError::Timeout(err.to_string())
        } else {
            OlmError::Transport(err.to_string())
        }
    }
}
