//! Anthropic Messages dialect.
//!
//! Builds `POST {base}/v1/messages?beta=true` requests and decodes the
//! Messages SSE event family (`message_start`, `content_block_delta`,
//! `message_delta`, `message_stop`).

use reqwest::header::HeaderValue;
use serde_json::Value;

use crate::relay::client::parse_sse_data;
use crate::relay::context::{Candidate, TokenUsage};
use crate::relay::error::RelayResult;

use super::{bearer_headers, filter_payload, BuiltRequest, ParsedResponse, StreamStats};

/// Fields forwarded to the Messages API; everything else is dropped.
const ALLOWED_FIELDS: &[&str] = &[
    "model",
    "messages",
    "max_tokens",
    "stream",
    "system",
    "temperature",
    "top_p",
    "top_k",
    "stop_sequences",
    "metadata",
    "tools",
    "tool_choice",
    "thinking",
];

const ANTHROPIC_VERSION: &str = "2023-06-01";

pub struct AnthropicAdapter;

impl AnthropicAdapter {
    pub fn build(
        &self,
        candidate: &Candidate,
        payload: &Value,
        streaming: bool,
    ) -> RelayResult<BuiltRequest> {
        let mut body = filter_payload(payload, ALLOWED_FIELDS);
        if let Some(obj) = body.as_object_mut() {
            obj.insert(
                "model".to_string(),
                Value::String(candidate.effective_model.clone()),
            );
            obj.insert("stream".to_string(), Value::Bool(streaming));
        }

        let mut headers = bearer_headers(&candidate.key.secret);
        headers.insert(
            "anthropic-version",
            HeaderValue::from_static(ANTHROPIC_VERSION),
        );
        if streaming {
            headers.insert("accept", HeaderValue::from_static("text/event-stream"));
        }

        Ok(BuiltRequest {
            url: format!(
                "{}/v1/messages?beta=true",
                candidate.endpoint_url.trim_end_matches('/')
            ),
            headers,
            body,
            streaming,
        })
    }

    pub fn parse(&self, body: &Value) -> ParsedResponse {
        let text = body
            .get("content")
            .and_then(|c| c.as_array())
            .map(|blocks| {
                blocks
                    .iter()
                    .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();

        ParsedResponse {
            text,
            usage: extract_usage(body),
        }
    }

    pub fn decode_line(&self, line: &str, stats: &mut StreamStats) {
        let Some(data) = parse_sse_data(line) else {
            return;
        };
        let Ok(event) = serde_json::from_str::<Value>(data) else {
            return;
        };

        match event.get("type").and_then(|t| t.as_str()) {
            Some("message_start") => {
                if let Some(message) = event.get("message") {
                    stats.usage.merge(&extract_usage(message));
                }
            }
            Some("content_block_delta") => {
                if let Some(delta) = event.get("delta") {
                    if let Some(text) = delta.get("text").and_then(|t| t.as_str()) {
                        stats.text.push_str(text);
                    }
                }
            }
            Some("message_delta") => {
                stats.usage.merge(&extract_usage(&event));
                if let Some(reason) = event
                    .get("delta")
                    .and_then(|d| d.get("stop_reason"))
                    .and_then(|r| r.as_str())
                {
                    stats.finish_reason = Some(reason.to_string());
                }
            }
            Some("message_stop") => {
                stats.done = true;
            }
            _ => {}
        }
    }
}

fn extract_usage(value: &Value) -> TokenUsage {
    let Some(usage) = value.get("usage") else {
        return TokenUsage::default();
    };
    let field = |name: &str| usage.get(name).and_then(|v| v.as_i64()).unwrap_or(0);
    TokenUsage {
        input_tokens: field("input_tokens"),
        output_tokens: field("output_tokens"),
        cache_read_tokens: field("cache_read_input_tokens"),
        cache_creation_tokens: field("cache_creation_input_tokens"),
    }
}
