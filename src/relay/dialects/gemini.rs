//! Gemini dialects: the public generative-language API and the Cloud Code
//! internal surface used by the Gemini CLI.
//!
//! Both only stream upstream (`alt=sse`); unary client requests are served
//! by aggregating the stream.

use reqwest::header::{HeaderMap, HeaderValue};
use serde_json::Value;

use crate::relay::client::parse_sse_data;
use crate::relay::context::{Candidate, TokenUsage};
use crate::relay::error::RelayResult;
use crate::store::Preset;

use super::{bearer_headers, BuiltRequest, ParsedResponse, StreamStats};

const GEMINI_CLI_HOST: &str = "https://cloudcode-pa.googleapis.com";

const BODY_FIELDS: &[&str] = &[
    "contents",
    "systemInstruction",
    "system_instruction",
    "generationConfig",
    "generation_config",
    "safetySettings",
    "tools",
    "toolConfig",
    "cachedContent",
];

pub struct GeminiAdapter;

impl GeminiAdapter {
    pub fn build(&self, candidate: &Candidate, payload: &Value) -> RelayResult<BuiltRequest> {
        let body = super::filter_payload(payload, BODY_FIELDS);

        // Official preset carries an OAuth bearer; custom deployments use
        // the API-key header.
        let headers = if candidate.preset == Preset::Official {
            bearer_headers(&candidate.key.secret)
        } else {
            let mut headers = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(&candidate.key.secret) {
                headers.insert("x-goog-api-key", value);
            }
            headers.insert("content-type", HeaderValue::from_static("application/json"));
            headers
        };

        Ok(BuiltRequest {
            url: format!(
                "{}/v1beta/models/{}:streamGenerateContent?alt=sse",
                candidate.endpoint_url.trim_end_matches('/'),
                candidate.effective_model
            ),
            headers,
            body,
            streaming: true,
        })
    }

    pub fn parse(&self, body: &Value) -> ParsedResponse {
        parse_generate_content(body)
    }

    pub fn decode_line(&self, line: &str, stats: &mut StreamStats) {
        decode_generate_content_line(line, stats)
    }

    pub fn synthesize_unary(&self, stats: &StreamStats) -> Value {
        synthesize_generate_content(stats)
    }
}

pub struct GeminiCliAdapter;

impl GeminiCliAdapter {
    pub fn build(&self, candidate: &Candidate, payload: &Value) -> RelayResult<BuiltRequest> {
        // The internal surface wraps the generate-content request and keys
        // it by project.
        let request = super::filter_payload(payload, BODY_FIELDS);
        let project = payload
            .get("project")
            .and_then(|p| p.as_str())
            .unwrap_or_default();
        let body = serde_json::json!({
            "model": candidate.effective_model,
            "project": project,
            "user_prompt_id": crate::clock::request_id(),
            "request": request,
        });

        let base = if candidate.endpoint_url.is_empty() {
            GEMINI_CLI_HOST
        } else {
            candidate.endpoint_url.as_str()
        };
        let mut headers = bearer_headers(&candidate.key.secret);
        headers.insert("accept", HeaderValue::from_static("text/event-stream"));

        Ok(BuiltRequest {
            url: format!(
                "{}/v1internal:streamGenerateContent?alt=sse",
                base.trim_end_matches('/')
            ),
            headers,
            body,
            streaming: true,
        })
    }

    pub fn parse(&self, body: &Value) -> ParsedResponse {
        // CLI responses nest the payload under `response`.
        parse_generate_content(body.get("response").unwrap_or(body))
    }

    pub fn decode_line(&self, line: &str, stats: &mut StreamStats) {
        decode_generate_content_line(line, stats)
    }

    pub fn synthesize_unary(&self, stats: &StreamStats) -> Value {
        serde_json::json!({ "response": synthesize_generate_content(stats) })
    }
}

fn parse_generate_content(body: &Value) -> ParsedResponse {
    let text = body
        .get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
        .and_then(|c| c.get("content"))
        .and_then(|c| c.get("parts"))
        .and_then(|p| p.as_array())
        .map(|parts| {
            parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();

    ParsedResponse {
        text,
        usage: extract_usage(body),
    }
}

fn decode_generate_content_line(line: &str, stats: &mut StreamStats) {
    let Some(data) = parse_sse_data(line) else {
        return;
    };
    let Ok(event) = serde_json::from_str::<Value>(data) else {
        return;
    };
    // CLI events nest the payload under `response`.
    let event = event.get("response").unwrap_or(&event);

    if let Some(candidate) = event
        .get("candidates")
        .and_then(|c| c.as_array())
        .and_then(|c| c.first())
    {
        if let Some(parts) = candidate
            .get("content")
            .and_then(|c| c.get("parts"))
            .and_then(|p| p.as_array())
        {
            for part in parts {
                if let Some(text) = part.get("text").and_then(|t| t.as_str()) {
                    stats.text.push_str(text);
                }
            }
        }
        if let Some(reason) = candidate.get("finishReason").and_then(|r| r.as_str()) {
            stats.finish_reason = Some(reason.to_string());
            stats.done = true;
        }
    }
    stats.usage.merge(&extract_usage(event));
}

fn synthesize_generate_content(stats: &StreamStats) -> Value {
    serde_json::json!({
        "candidates": [{
            "content": {"role": "model", "parts": [{"text": stats.text}]},
            "finishReason": stats.finish_reason.as_deref().unwrap_or("STOP")
        }],
        "usageMetadata": {
            "promptTokenCount": stats.usage.input_tokens,
            "candidatesTokenCount": stats.usage.output_tokens,
            "cachedContentTokenCount": stats.usage.cache_read_tokens
        }
    })
}

fn extract_usage(value: &Value) -> TokenUsage {
    let Some(meta) = value.get("usageMetadata") else {
        return TokenUsage::default();
    };
    let field = |name: &str| meta.get(name).and_then(|v| v.as_i64()).unwrap_or(0);
    TokenUsage {
        input_tokens: field("promptTokenCount"),
        output_tokens: field("candidatesTokenCount"),
        cache_read_tokens: field("cachedContentTokenCount"),
        cache_creation_tokens: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::dialects::testutil::candidate;
    use crate::store::ChannelType;

    #[test]
    fn native_build_places_model_in_url() {
        let c = candidate(ChannelType::Gemini, Preset::Empty, "gemini-2.5-pro");
        let payload = serde_json::json!({
            "contents": [{"role": "user", "parts": [{"text": "hi"}]}],
            "model": "should-not-leak"
        });
        let built = GeminiAdapter.build(&c, &payload).unwrap();

        assert_eq!(
            built.url,
            "https://upstream.example.com/v1beta/models/gemini-2.5-pro:streamGenerateContent?alt=sse"
        );
        assert!(built.streaming);
        assert!(built.body.get("model").is_none());
        assert_eq!(
            built.headers.get("x-goog-api-key").unwrap().to_str().unwrap(),
            "sk-test-123456"
        );
        assert!(built.headers.get("authorization").is_none());
    }

    #[test]
    fn official_preset_uses_bearer() {
        let c = candidate(ChannelType::Gemini, Preset::Official, "gemini-2.5-pro");
        let built = GeminiAdapter
            .build(&c, &serde_json::json!({"contents": []}))
            .unwrap();
        assert!(built.headers.get("authorization").is_some());
        assert!(built.headers.get("x-goog-api-key").is_none());
    }

    #[test]
    fn cli_build_wraps_request() {
        let c = candidate(ChannelType::GeminiCli, Preset::Empty, "gemini-2.5-pro");
        let payload = serde_json::json!({
            "project": "proj-1",
            "contents": [{"role": "user", "parts": [{"text": "hi"}]}]
        });
        let built = GeminiCliAdapter.build(&c, &payload).unwrap();

        assert_eq!(
            built.url,
            "https://upstream.example.com/v1internal:streamGenerateContent?alt=sse"
        );
        assert_eq!(built.body["model"], "gemini-2.5-pro");
        assert_eq!(built.body["project"], "proj-1");
        assert!(built.body["request"].get("contents").is_some());
        assert!(!built.body["user_prompt_id"].as_str().unwrap_or("").is_empty());
    }

    #[test]
    fn cli_build_defaults_to_cloudcode_host() {
        let mut c = candidate(ChannelType::GeminiCli, Preset::Empty, "gemini-2.5-pro");
        c.endpoint_url = String::new();
        let built = GeminiCliAdapter
            .build(&c, &serde_json::json!({"contents": []}))
            .unwrap();
        assert!(built.url.starts_with(GEMINI_CLI_HOST));
    }

    #[test]
    fn stream_decode_plain_and_nested() {
        let mut stats = StreamStats::default();
        GeminiAdapter.decode_line(
            r#"data: {"candidates":[{"content":{"parts":[{"text":"a"}]}}]}"#,
            &mut stats,
        );
        GeminiCliAdapter.decode_line(
            r#"data: {"response":{"candidates":[{"content":{"parts":[{"text":"b"}]},"finishReason":"STOP"}],"usageMetadata":{"promptTokenCount":4,"candidatesTokenCount":2}}}"#,
            &mut stats,
        );

        assert_eq!(stats.text, "ab");
        assert_eq!(stats.finish_reason.as_deref(), Some("STOP"));
        assert!(stats.done);
        assert_eq!(stats.usage.input_tokens, 4);
        assert_eq!(stats.usage.output_tokens, 2);
    }

    #[test]
    fn synthesis_round_trips_through_parse() {
        let stats = StreamStats {
            text: "answer".to_string(),
            usage: TokenUsage { input_tokens: 9, output_tokens: 3, ..Default::default() },
            finish_reason: Some("STOP".to_string()),
            done: true,
        };
        let plain = GeminiAdapter.synthesize_unary(&stats);
        let parsed = GeminiAdapter.parse(&plain);
        assert_eq!(parsed.text, "answer");
        assert_eq!(parsed.usage.input_tokens, 9);

        let nested = GeminiCliAdapter.synthesize_unary(&stats);
        let parsed = GeminiCliAdapter.parse(&nested);
        assert_eq!(parsed.text, "answer");
        assert_eq!(parsed.usage.output_tokens, 3);
    }
}
