//! HTTP client utilities for upstream calls.
//!
//! One shared connection pool serves all channels; streaming requests use a
//! longer-timeout client over the same pool limits.

use std::time::Duration;

use once_cell::sync::Lazy;
use reqwest::{header::HeaderMap, Client, Response};
use serde_json::Value;

use super::error::{RelayError, RelayResult};

const POOL_MAX_IDLE_PER_HOST: usize = 10;
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

fn build_client(timeout_secs: u64) -> Client {
    Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .connect_timeout(Duration::from_secs(10))
        .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        .pool_idle_timeout(POOL_IDLE_TIMEOUT)
        .build()
        .unwrap_or_default()
}

static DEFAULT_CLIENT: Lazy<Client> = Lazy::new(|| build_client(120));
static STREAMING_CLIENT: Lazy<Client> = Lazy::new(|| build_client(300));

/// Client for non-streaming requests.
pub fn default_client() -> &'static Client {
    &DEFAULT_CLIENT
}

/// Client for streaming requests (longer timeout).
pub fn streaming_client() -> &'static Client {
    &STREAMING_CLIENT
}

/// Make a single POST request attempt.
pub async fn make_request(
    client: &Client,
    url: &str,
    headers: HeaderMap,
    body: &Value,
) -> RelayResult<Response> {
    crate::logger::debug("client", &format!("Sending request to: {}", url));

    client
        .post(url)
        .headers(headers)
        .json(body)
        .send()
        .await
        .map_err(|e| {
            crate::logger::error("client", &format!("Request failed: {}", e));
            if e.is_timeout() {
                RelayError::UpstreamExhausted {
                    status: 504,
                    body: "Request timeout".to_string(),
                }
            } else {
                RelayError::UpstreamExhausted {
                    status: 502,
                    body: format!("Connection failed: {}", e),
                }
            }
        })
}

/// Whether an HTTP status should move dispatch to the next candidate with a
/// channel-level trip.
pub fn is_retryable_status(status: u16) -> bool {
    status >= 500
}

/// Whether an HTTP status indicates a credential problem (key-level trip).
pub fn is_key_status(status: u16) -> bool {
    matches!(status, 401 | 403 | 429)
}

/// Parse a `Retry-After` header as delay seconds.
pub fn parse_retry_after(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}

/// Parse SSE (Server-Sent Events) data line
pub fn parse_sse_data(line: &str) -> Option<&str> {
    if let Some(rest) = line.strip_prefix("data:") {
        return Some(rest.strip_prefix(' ').unwrap_or(rest));
    }
    None
}

/// Check if SSE line indicates stream end
pub fn is_sse_done(data: &str) -> bool {
    data.trim() == "[DONE]"
}

/// Drain complete SSE lines from a byte buffer.
///
/// This handles chunked responses where line breaks may split across reads.
pub fn drain_sse_lines(buffer: &mut Vec<u8>, chunk: &[u8]) -> Vec<String> {
    if !chunk.is_empty() {
        buffer.extend_from_slice(chunk);
    }

    let mut lines = Vec::new();
    loop {
        let Some(pos) = buffer.iter().position(|&b| b == b'\n') else {
            break;
        };

        let mut line = buffer.drain(..=pos).collect::<Vec<u8>>();
        if line.last() == Some(&b'\n') {
            line.pop();
        }
        if line.last() == Some(&b'\r') {
            line.pop();
        }

        lines.push(String::from_utf8_lossy(&line).to_string());
    }

    lines
}

/// Heuristic for upstream bodies reporting an unknown model.
///
/// These responses must not trip cooldowns; the candidate is only unusable
/// for the current request.
pub fn body_indicates_model_missing(status: u16, body: &str) -> bool {
    if status != 404 && status != 400 {
        return false;
    }
    let lowered = body.to_lowercase();
    (lowered.contains("model") && (lowered.contains("not found") || lowered.contains("not exist")))
        || lowered.contains("model_not_found")
        || lowered.contains("unknown model")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable_status(500));
        assert!(is_retryable_status(502));
        assert!(is_retryable_status(503));
        assert!(is_retryable_status(504));

        assert!(!is_retryable_status(400));
        assert!(!is_retryable_status(429));
        assert!(!is_retryable_status(200));
    }

    #[test]
    fn key_statuses() {
        assert!(is_key_status(401));
        assert!(is_key_status(403));
        assert!(is_key_status(429));
        assert!(!is_key_status(500));
        assert!(!is_key_status(200));
    }

    #[test]
    fn test_parse_sse_data() {
        assert_eq!(parse_sse_data("data: hello"), Some("hello"));
        assert_eq!(parse_sse_data("data:hello"), Some("hello"));
        assert_eq!(parse_sse_data("data: [DONE]"), Some("[DONE]"));
        assert_eq!(parse_sse_data("event: message"), None);
        assert_eq!(parse_sse_data("hello"), None);
    }

    #[test]
    fn test_is_sse_done() {
        assert!(is_sse_done("[DONE]"));
        assert!(is_sse_done("  [DONE]  "));
        assert!(!is_sse_done("{}"));
        assert!(!is_sse_done("data"));
    }

    #[test]
    fn test_drain_sse_lines_partial() {
        let mut buffer = Vec::new();
        let lines = drain_sse_lines(&mut buffer, b"data: {\"id\":");
        assert!(lines.is_empty());

        let lines = drain_sse_lines(&mut buffer, b"1}\n");
        assert_eq!(lines, vec!["data: {\"id\":1}"]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_drain_sse_lines_crlf() {
        let mut buffer = Vec::new();
        let lines = drain_sse_lines(&mut buffer, b"data: ok\r\n");
        assert_eq!(lines, vec!["data: ok"]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn model_missing_detection() {
        assert!(body_indicates_model_missing(
            404,
            r#"{"error":{"message":"The model `gpt-5x` does not exist"}}"#
        ));
        assert!(body_indicates_model_missing(
            400,
            r#"{"error":{"type":"model_not_found"}}"#
        ));
        assert!(!body_indicates_model_missing(500, "model not found"));
        assert!(!body_indicates_model_missing(404, "no such route"));
    }
}
