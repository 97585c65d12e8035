//! Control-plane token acquisition
//!
//! Tokens are short-lived and fetched over HTTP before each WebSocket
//! dial. A cached token is offered back to the server; when the server
//! answers that the session is still valid the cached token is reused.

use crate::error::{OlmError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// HTTP request timeout for token acquisition
const TOKEN_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Server response marker for a still-valid cached token
const TOKEN_STILL_VALID: &str = "Token session already valid";

#[derive(Debug, Serialize)]
struct TokenRequest<'a> {
    #[serde(rename = "olmId")]
    olm_id: &'a str,
    secret: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    success: bool,
    #[serde(default)]
    message: String,
    #[serde(default)]
    data: Option<TokenData>,
}

#[derive(Debug, Deserialize)]
struct TokenData {
    token: Option<String>,
}

/// Fetch a control-plane token from `{endpoint}/api/v1/auth/olm/get-token`.
///
/// `cached` is offered for revalidation; it is returned as-is when the
/// server reports the session still valid.
pub async fn acquire_token(
    client: &reqwest::Client,
    endpoint: &str,
    olm_id: &str,
    secret: &str,
    cached: Option<&str>,
) -> Result<String> {
    let url = format!("{}/api/v1/auth/olm/get-token", endpoint);
    debug!("Requesting control-plane token from {}", url);

    let response = client
        .post(&url)
        .timeout(TOKEN_REQUEST_TIMEOUT)
        .header("Content-Type", "application/json")
        .header("X-CSRF-Token", "x-csrf-protection")
        .json(&TokenRequest {
            olm_id,
            secret,
            token: cached,
        })
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        return Err(OlmError::Auth(format!(
            "Token endpoint returned HTTP {}",
            status
        )));
    }

    let body: TokenResponse = response
        .json()
        .await
        .map_err(|e| OlmError::Protocol(format!("Malformed token response: {}", e)))?;

    if !body.success {
        return Err(OlmError::Auth(format!(
            "Server rejected credentials: {}",
            body.message
        )));
    }

    if body.message == TOKEN_STILL_VALID {
        if let Some(token) = cached {
            debug!("Cached token still valid, reusing it");
            return Ok(token.to_string());
        }
    }

    body.data
        .and_then(|d| d.token)
        .ok_or_else(|| OlmError::Protocol("Token response carried no token".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let req = TokenRequest {
            olm_id: "olm-1",
            secret: "s",
            token: Some("old"),
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"olmId\":\"olm-1\""));
        assert!(json.contains("\"token\":\"old\""));

        let without = TokenRequest {
            olm_id: "olm-1",
            secret: "s",
            token: None,
        };
        assert!(!serde_json::to_string(&without).unwrap().contains("token"));
    }

    #[test]
    fn test_response_parsing() {
        let body: TokenResponse = serde_json::from_str(
            r#"{"success": true, "message": "ok", "data": {"token": "abc"}}"#,
        )
        .unwrap();
        assert!(body.success);
        assert_eq!(body.data.unwrap().token.as_deref(), Some("abc"));

        let rejected: TokenResponse =
            serde_json::from_str(r#"{"success": false, "message": "bad secret"}"#).unwrap();
        assert!(!rejected.success);
        assert!(rejected.data.is_none());
    }
}
