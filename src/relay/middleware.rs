//! Request parsing and tenant authentication.

use axum::http::HeaderMap;
use serde_json::Value;
use std::net::SocketAddr;

use crate::store::{self, AuthToken};

use super::context::{ClientDialect, RelayRequest};
use super::error::{RelayError, RelayResult};

/// Extract the presented credential from request headers.
///
/// Priority order:
/// 1. `Authorization: Bearer <token>`
/// 2. `x-api-key` (Anthropic-style clients)
/// 3. `x-goog-api-key` (Gemini-style clients)
pub fn extract_bearer(headers: &HeaderMap) -> Option<String> {
    if let Some(auth) = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|raw| raw.strip_prefix("Bearer "))
    {
        let token = auth.trim().to_string();
        if !token.is_empty() {
            return Some(token);
        }
    }
    for key in ["x-api-key", "x-goog-api-key"] {
        if let Some(token) = headers
            .get(key)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
        {
            return Some(token);
        }
    }
    None
}

/// Resolve the presented bearer to an active, unexpired tenant token.
pub fn authenticate(headers: &HeaderMap) -> RelayResult<AuthToken> {
    let bearer = extract_bearer(headers)
        .ok_or_else(|| RelayError::Unauthorized("Missing authentication token".to_string()))?;
    let hash = store::tokens::hash_token(&bearer);
    let token = store::tokens::auth_token_by_hash(&hash)
        .map_err(|e| RelayError::Internal(e.to_string()))?
        .ok_or_else(|| RelayError::Unauthorized("Unknown token".to_string()))?;
    if !token.is_usable(crate::clock::epoch_s()) {
        return Err(RelayError::Unauthorized(
            "Token inactive or expired".to_string(),
        ));
    }
    Ok(token)
}

/// Best client address available: forwarded headers first, then the socket
/// peer.
pub fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    if let Some(forwarded) = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
    {
        return forwarded;
    }
    if let Some(real_ip) = headers
        .get("x-real-ip")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
    {
        return real_ip;
    }
    peer.map(|p| p.ip().to_string()).unwrap_or_else(|| "unknown".to_string())
}

/// Check if request is streaming
pub fn is_streaming_request(payload: &Value) -> bool {
    match payload.get("stream") {
        Some(Value::Bool(stream)) => *stream,
        Some(Value::Number(value)) => value.as_i64().map(|v| v != 0).unwrap_or(false),
        Some(Value::String(value)) => {
            let normalized = value.trim().to_ascii_lowercase();
            matches!(normalized.as_str(), "true" | "1" | "yes" | "on")
        }
        _ => false,
    }
}

/// Extract model ID from request payload
pub fn extract_model_id(payload: &Value) -> RelayResult<String> {
    payload
        .get("model")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
        .filter(|s| !s.is_empty())
        .ok_or_else(|| RelayError::BadRequest("Missing or empty 'model' field".to_string()))
}

/// Assemble the dispatch request from inbound parts.
pub fn build_relay_request(
    dialect: ClientDialect,
    headers: &HeaderMap,
    payload: Value,
    peer: Option<SocketAddr>,
    model: String,
    streaming: bool,
) -> RelayResult<RelayRequest> {
    let token = authenticate(headers)?;
    Ok(RelayRequest {
        request_id: crate::clock::request_id(),
        dialect,
        model,
        payload,
        streaming,
        token,
        client_ip: client_ip(headers, peer),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn bearer_priority_order() {
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_static("apikey"));
        headers.insert("authorization", HeaderValue::from_static("Bearer tok"));
        assert_eq!(extract_bearer(&headers), Some("tok".to_string()));

        let mut headers = HeaderMap::new();
        headers.insert("x-goog-api-key", HeaderValue::from_static("goog"));
        assert_eq!(extract_bearer(&headers), Some("goog".to_string()));

        assert_eq!(extract_bearer(&HeaderMap::new()), None);
    }

    #[test]
    fn streaming_flag_parsing() {
        assert!(is_streaming_request(&serde_json::json!({"stream": true})));
        assert!(is_streaming_request(&serde_json::json!({"stream": 1})));
        assert!(is_streaming_request(&serde_json::json!({"stream": "yes"})));
        assert!(!is_streaming_request(&serde_json::json!({"stream": false})));
        assert!(!is_streaming_request(&serde_json::json!({})));
    }

    #[test]
    fn model_extraction() {
        assert_eq!(
            extract_model_id(&serde_json::json!({"model": "gpt-4o"})).unwrap(),
            "gpt-4o"
        );
        assert!(extract_model_id(&serde_json::json!({"model": ""})).is_err());
        assert!(extract_model_id(&serde_json::json!({})).is_err());
    }

    #[test]
    fn client_ip_prefers_forwarded() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("10.1.2.3, 172.16.0.1"),
        );
        assert_eq!(client_ip(&headers, None), "10.1.2.3");

        let mut headers = HeaderMap::new();
        headers.insert("x-real-ip", HeaderValue::from_static("10.9.9.9"));
        assert_eq!(client_ip(&headers, None), "10.9.9.9");

        let peer: SocketAddr = "192.168.1.5:443".parse().unwrap();
        assert_eq!(client_ip(&HeaderMap::new(), Some(peer)), "192.168.1.5");
        assert_eq!(client_ip(&HeaderMap::new(), None), "unknown");
    }

    #[test]
    fn authentication_rejects_unknown_tokens() {
        let _db = crate::store::testutil::use_temp_db("middleware-auth");
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer nope"));
        assert!(matches!(
            authenticate(&headers),
            Err(RelayError::Unauthorized(_))
        ));

        crate::store::tokens::create_token(&crate::store::tokens::TokenInput {
            token: "tk-mw".to_string(),
            description: String::new(),
            active: true,
            expires_at: None,
            all_channels: true,
            channel_ids: vec![],
        })
        .unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("authorization", HeaderValue::from_static("Bearer tk-mw"));
        let token = authenticate(&headers).unwrap();
        assert!(token.all_channels);
    }
}
