//! Reachability probe wire format and the one-shot connectivity tester
//!
//! A probe is a 16-byte datagram: an 8-byte request magic followed by a
//! big-endian sequence number. The responder echoes a reply magic, the
//! same sequence, and its WireGuard public key; the monitor discards
//! replies whose key does not match the one cached from the hole-punch
//! directive.

use crate::error::{OlmError, Result};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time;
use tracing::debug;

/// Request frame marker
const REQUEST_MAGIC: [u8; 8] = *b"OLMPROBE";

/// Reply frame marker
const REPLY_MAGIC: [u8; 8] = *b"OLMREPLY";

/// Request frame size: magic + sequence
pub const REQUEST_LEN: usize = 16;

/// Reply frame size: magic + sequence + responder public key
pub const REPLY_LEN: usize = 48;

/// Timeout for the one-shot tester
pub const TESTER_TIMEOUT: Duration = Duration::from_secs(2);

/// Encode a probe request
pub fn encode_request(sequence: u64) -> [u8; REQUEST_LEN] {
    let mut frame = [0u8; REQUEST_LEN];
    frame[..8].copy_from_slice(&REQUEST_MAGIC);
    frame[8..].copy_from_slice(&sequence.to_be_bytes());
    frame
}

/// Decode a probe reply into (sequence, responder public key).
/// Returns `None` for frames that are not probe replies.
pub fn parse_reply(frame: &[u8]) -> Option<(u64, [u8; 32])> {
    if frame.len() != REPLY_LEN || frame[..8] != REPLY_MAGIC {
        return None;
    }
    let sequence = u64::from_be_bytes(frame[8..16].try_into().ok()?);
    let mut key = [0u8; 32];
    key.copy_from_slice(&frame[16..REPLY_LEN]);
    Some((sequence, key))
}

/// Encode a probe reply; used by tests standing in for the responder
#[cfg(test)]
pub fn encode_reply(sequence: u64, key: &[u8; 32]) -> [u8; REPLY_LEN] {
    let mut frame = [0u8; REPLY_LEN];
    frame[..8].copy_from_slice(&REPLY_MAGIC);
    frame[8..16].copy_from_slice(&sequence.to_be_bytes());
    frame[16..].copy_from_slice(key);
    frame
}

/// Outcome of a single successful probe
#[derive(Debug, Clone, Copy)]
pub struct ProbeReply {
    /// Measured round-trip time
    pub rtt: Duration,
    /// The responder's WireGuard public key
    pub responder_key: [u8; 32],
}

/// Send one probe and wait for the matching reply.
///
/// Frames with the wrong magic or a stale sequence are ignored until the
/// deadline; the caller validates the responder key.
pub async fn probe_once(
    socket: &UdpSocket,
    target: SocketAddr,
    sequence: u64,
    timeout: Duration,
) -> Result<ProbeReply> {
    let request = encode_request(sequence);
    socket
        .send_to(&request, target)
        .await
        .map_err(|e| OlmError::Transport(format!("Probe send to {} failed: {}", target, e)))?;

    let started = Instant::now();
    let mut buffer = [0u8; 64];

    let wait = async {
        loop {
            let (n, src) = socket.recv_from(&mut buffer).await.map_err(|e| {
                OlmError::Transport(format!("Probe receive failed: {}", e))
            })?;
            if src != target {
                debug!("Ignoring probe reply from unexpected source {}", src);
                continue;
            }
            match parse_reply(&buffer[..n]) {
                Some((seq, key)) if seq == sequence => {
                    return Ok(ProbeReply {
                        rtt: started.elapsed(),
                        responder_key: key,
                    });
                }
                Some((seq, _)) => debug!("Ignoring stale probe reply (sequence {})", seq),
                None => debug!("Ignoring non-probe datagram from {}", src),
            }
        }
    };

    time::timeout(timeout, wait)
        .await
        .map_err(|_| OlmError::Timeout(format!("No probe reply from {} within {:?}", target, timeout)))?
}

/// One-shot connectivity test against `host:port` with a 2 s deadline.
/// Used by `--test`; makes no control-plane connection.
pub async fn test_target(target: &str) -> Result<Duration> {
    let addr = crate::wireguard::resolve_endpoint(target).await?;
    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|e| OlmError::Transport(format!("Failed to bind test socket: {}", e)))?;

    let reply = probe_once(&socket, addr, 1, TESTER_TIMEOUT).await?;
    Ok(reply.rtt)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_encoding() {
        let frame = encode_request(42);
        assert_eq!(&frame[..8], b"OLMPROBE");
        assert_eq!(u64::from_be_bytes(frame[8..].try_into().unwrap()), 42);
    }

    #[test]
    fn test_reply_roundtrip() {
        let key = [7u8; 32];
        let frame = encode_reply(9, &key);
        let (seq, parsed_key) = parse_reply(&frame).unwrap();
        assert_eq!(seq, 9);
        assert_eq!(parsed_key, key);
    }

    #[test]
    fn test_parse_reply_rejects_bad_frames() {
        assert!(parse_reply(b"short").is_none());
        assert!(parse_reply(&[0u8; REPLY_LEN]).is_none());
        // A request is not a reply
        let request = encode_request(1);
        assert!(parse_reply(&request).is_none());
    }

    #[tokio::test]
    async fn test_probe_against_mock_responder() {
        let responder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let responder_addr = responder.local_addr().unwrap();
        let key = [3u8; 32];

        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (n, src) = responder.recv_from(&mut buf).await.unwrap();
            let frame = encode_request(0); // sanity: shape matches
            assert_eq!(n, frame.len());
            let seq = u64::from_be_bytes(buf[8..16].try_into().unwrap());
            responder
                .send_to(&encode_reply(seq, &key), src)
                .await
                .unwrap();
        });

        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let reply = probe_once(&socket, responder_addr, 5, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(reply.responder_key, key);
    }

    #[tokio::test]
    async fn test_probe_times_out_without_responder() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let result = probe_once(&socket, target, 1, Duration::from_millis(100)).await;
        assert!(matches!(result, Err(OlmError::Timeout(_))));
    }
}
