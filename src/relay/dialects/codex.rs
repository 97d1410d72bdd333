//! Codex/Responses dialect.
//!
//! The Responses API only streams; unary client requests are served by
//! aggregating the SSE events. Official-preset channels additionally send
//! the `chatgpt-account-id` header extracted from the key's JWT payload.

use base64::engine::general_purpose::URL_SAFE;
use base64::Engine;
use reqwest::header::HeaderValue;
use serde_json::Value;

use crate::relay::client::{is_sse_done, parse_sse_data};
use crate::relay::context::{Candidate, TokenUsage};
use crate::relay::error::RelayResult;
use crate::store::Preset;

use super::{bearer_headers, filter_payload, BuiltRequest, ParsedResponse, StreamStats};

const ALLOWED_FIELDS: &[&str] = &[
    "model",
    "instructions",
    "input",
    "tools",
    "tool_choice",
    "reasoning",
    "prompt_cache_key",
    "parallel_tool_calls",
    "store",
    "metadata",
];

pub struct CodexAdapter;

impl CodexAdapter {
    pub fn build(&self, candidate: &Candidate, payload: &Value) -> RelayResult<BuiltRequest> {
        let mut body = filter_payload(payload, ALLOWED_FIELDS);
        if let Some(obj) = body.as_object_mut() {
            obj.insert(
                "model".to_string(),
                Value::String(candidate.effective_model.clone()),
            );
            obj.insert("stream".to_string(), Value::Bool(true));
            obj.insert(
                "include".to_string(),
                serde_json::json!(["reasoning.encrypted_content"]),
            );
        }

        let mut headers = bearer_headers(&candidate.key.secret);
        headers.insert("accept", HeaderValue::from_static("text/event-stream"));
        if candidate.preset == Preset::Official {
            let jwt = candidate
                .key
                .access_token
                .as_deref()
                .unwrap_or(&candidate.key.secret);
            if let Some(account_id) = extract_account_id(jwt) {
                if let Ok(value) = HeaderValue::from_str(&account_id) {
                    headers.insert("chatgpt-account-id", value);
                }
            }
        }

        Ok(BuiltRequest {
            url: format!("{}/responses", candidate.endpoint_url.trim_end_matches('/')),
            headers,
            body,
            streaming: true,
        })
    }

    pub fn parse(&self, body: &Value) -> ParsedResponse {
        // Unary Responses shape: output[] -> content[] -> {type: output_text}.
        let text = body
            .get("output")
            .and_then(|o| o.as_array())
            .map(|items| {
                items
                    .iter()
                    .filter_map(|i| i.get("content").and_then(|c| c.as_array()))
                    .flatten()
                    .filter_map(|c| c.get("text").and_then(|t| t.as_str()))
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
        if is_sse_done(data) {
            stats.done = true;
            return;
        }
        let Ok(event) = serde_json::from_str::<Value>(data) else {
            return;
        };

        match event.get("type").and_then(|t| t.as_str()) {
            Some("response.output_text.delta") => {
                if let Some(delta) = event.get("delta").and_then(|d| d.as_str()) {
                    stats.text.push_str(delta);
                }
            }
            Some("response.completed") => {
                if let Some(response) = event.get("response") {
                    stats.usage.merge(&extract_usage(response));
                    if let Some(status) = response.get("status").and_then(|s| s.as_str()) {
                        stats.finish_reason = Some(status.to_string());
                    }
                }
                stats.done = true;
            }
            Some("response.failed") | Some("response.incomplete") => {
                stats.finish_reason = Some("failed".to_string());
                stats.done = true;
            }
            _ => {}
        }
    }

    pub fn synthesize_unary(&self, stats: &StreamStats, model: &str) -> Value {
        serde_json::json!({
            "object": "response",
            "model": model,
            "status": stats.finish_reason.as_deref().unwrap_or("completed"),
            "output": [{
                "type": "message",
                "role": "assistant",
                "content": [{"type": "output_text", "text": stats.text}]
            }],
            "usage": {
                "input_tokens": stats.usage.input_tokens,
                "output_tokens": stats.usage.output_tokens
            }
        })
    }
}

fn extract_usage(value: &Value) -> TokenUsage {
    let Some(usage) = value.get("usage") else {
        return TokenUsage::default();
    };
    let field = |name: &str| usage.get(name).and_then(|v| v.as_i64()).unwrap_or(0);
    let cached = usage
        .get("input_tokens_details")
        .and_then(|d| d.get("cached_tokens"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    TokenUsage {
        input_tokens: field("input_tokens"),
        output_tokens: field("output_tokens"),
        cache_read_tokens: cached,
        cache_creation_tokens: 0,
    }
}

/// Pull `chatgpt_account_id` out of a JWT's payload segment.
///
/// URL-safe base64 with padding restored, then
/// `["https://api.openai.com/auth"]["chatgpt_account_id"]`.
pub fn extract_account_id(jwt: &str) -> Option<String> {
    let payload = jwt.split('.').nth(1)?;
    let mut padded = payload.to_string();
    while padded.len() % 4 != 0 {
        padded.push('=');
    }
    let decoded = URL_SAFE.decode(padded.as_bytes()).ok()?;
    let claims: Value = serde_json::from_slice(&decoded).ok()?;
    claims
        .get("https://api.openai.com/auth")?
        .get("chatgpt_account_id")?
        .as_str()
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::dialects::testutil::candidate;
    use crate::store::ChannelType;

    fn fake_jwt(account_id: &str) -> String {
        let header = URL_SAFE.encode(br#"{"alg":"none"}"#);
        let payload = URL_SAFE.encode(
            format!(
                r#"{{"https://api.openai.com/auth":{{"chatgpt_account_id":"{}"}}}}"#,
                account_id
            )
            .as_bytes(),
        );
        format!("{}.{}.sig", header.trim_end_matches('='), payload.trim_end_matches('='))
    }

    #[test]
    fn jwt_account_extraction() {
        let jwt = fake_jwt("acct-123");
        assert_eq!(extract_account_id(&jwt), Some("acct-123".to_string()));
        assert_eq!(extract_account_id("not-a-jwt"), None);
        assert_eq!(extract_account_id("a.!!!.c"), None);
    }

    #[test]
    fn build_always_streams_and_includes_reasoning() {
        let c = candidate(ChannelType::Codex, Preset::Empty, "gpt-5-codex");
        let payload = serde_json::json!({
            "model": "codex",
            "input": [{"role": "user", "content": "hi"}],
            "max_output_tokens": 5
        });
        let built = CodexAdapter.build(&c, &payload).unwrap();

        assert_eq!(built.url, "https://upstream.example.com/responses");
        assert!(built.streaming);
        assert_eq!(built.body["stream"], true);
        assert_eq!(built.body["include"][0], "reasoning.encrypted_content");
        assert_eq!(built.body["model"], "gpt-5-codex");
        assert!(built.headers.get("chatgpt-account-id").is_none());
    }

    #[test]
    fn official_preset_adds_account_header() {
        let mut c = candidate(ChannelType::Codex, Preset::Official, "gpt-5-codex");
        c.key.access_token = Some(fake_jwt("acct-777"));
        let built = CodexAdapter
            .build(&c, &serde_json::json!({"input": []}))
            .unwrap();
        assert_eq!(
            built.headers.get("chatgpt-account-id").unwrap().to_str().unwrap(),
            "acct-777"
        );
    }

    #[test]
    fn stream_decode_and_synthesis() {
        let a = CodexAdapter;
        let mut stats = StreamStats::default();

        a.decode_line(
            r#"data: {"type":"response.output_text.delta","delta":"par"}"#,
            &mut stats,
        );
        a.decode_line(
            r#"data: {"type":"response.output_text.delta","delta":"tial"}"#,
            &mut stats,
        );
        a.decode_line(
            r#"data: {"type":"response.completed","response":{"status":"completed","usage":{"input_tokens":30,"output_tokens":12}}}"#,
            &mut stats,
        );

        assert_eq!(stats.text, "partial");
        assert!(stats.done);
        assert_eq!(stats.usage.input_tokens, 30);

        let unary = a.synthesize_unary(&stats, "gpt-5-codex");
        assert_eq!(unary["output"][0]["content"][0]["text"], "partial");
        assert_eq!(unary["usage"]["output_tokens"], 12);
        // The synthesized body parses back to the same accounting view.
        let parsed = a.parse(&unary);
        assert_eq!(parsed.text, "partial");
        assert_eq!(parsed.usage.input_tokens, 30);
    }
}
