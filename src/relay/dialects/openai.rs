//! OpenAI chat-completions dialect.
//!
//! Serves both native OpenAI channels and the OpenAI-compatible surface of
//! other providers.

use serde_json::Value;

use crate::relay::client::{is_sse_done, parse_sse_data};
use crate::relay::context::{Candidate, TokenUsage};
use crate::relay::error::RelayResult;

use super::{bearer_headers, filter_payload, BuiltRequest, ParsedResponse, StreamStats};

const ALLOWED_FIELDS: &[&str] = &[
    "model",
    "messages",
    "stream",
    "max_tokens",
    "max_completion_tokens",
    "temperature",
    "top_p",
    "n",
    "stop",
    "presence_penalty",
    "frequency_penalty",
    "tools",
    "tool_choice",
    "response_format",
    "user",
    "stream_options",
];

pub struct OpenAiAdapter;

impl OpenAiAdapter {
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
            if streaming {
                // Ask for the final usage chunk so accounting does not have
                // to estimate.
                obj.entry("stream_options")
                    .or_insert_with(|| serde_json::json!({"include_usage": true}));
            }
        }

        Ok(BuiltRequest {
            url: format!(
                "{}/v1/chat/completions",
                candidate.endpoint_url.trim_end_matches('/')
            ),
            headers: bearer_headers(&candidate.key.secret),
            body,
            streaming,
        })
    }

    pub fn parse(&self, body: &Value) -> ParsedResponse {
        let text = body
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|t| t.as_str())
            .unwrap_or_default()
            .to_string();

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
        let Ok(chunk) = serde_json::from_str::<Value>(data) else {
            return;
        };

        if let Some(choice) = chunk.get("choices").and_then(|c| c.as_array()).and_then(|c| c.first()) {
            if let Some(text) = choice
                .get("delta")
                .and_then(|d| d.get("content"))
                .and_then(|t| t.as_str())
            {
                stats.text.push_str(text);
            }
            if let Some(reason) = choice.get("finish_reason").and_then(|r| r.as_str()) {
                stats.finish_reason = Some(reason.to_string());
            }
        }
        // The usage chunk arrives last, often with an empty choices array.
        stats.usage.merge(&extract_usage(&chunk));
    }
}

fn extract_usage(value: &Value) -> TokenUsage {
    let Some(usage) = value.get("usage").filter(|u| !u.is_null()) else {
        return TokenUsage::default();
    };
    let field = |name: &str| usage.get(name).and_then(|v| v.as_i64()).unwrap_or(0);
    let cached = usage
        .get("prompt_tokens_details")
        .and_then(|d| d.get("cached_tokens"))
        .and_then(|v| v.as_i64())
        .unwrap_or(0);
    TokenUsage {
        input_tokens: field("prompt_tokens"),
        output_tokens: field("completion_tokens"),
        cache_read_tokens: cached,
        cache_creation_tokens: 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::dialects::testutil::candidate;
    use crate::store::{ChannelType, Preset};

    #[test]
    fn build_rewrites_model_and_stream() {
        let c = candidate(ChannelType::Openai, Preset::Empty, "gpt-4o-2024-11-20");
        let payload = serde_json::json!({
            "model": "gpt-4o",
            "messages": [{"role": "user", "content": "hi"}],
            "stream": false,
            "logit_bias": {"50256": -100}
        });
        let built = OpenAiAdapter.build(&c, &payload, true).unwrap();

        assert_eq!(built.url, "https://upstream.example.com/v1/chat/completions");
        assert_eq!(built.body["model"], "gpt-4o-2024-11-20");
        assert_eq!(built.body["stream"], true);
        assert_eq!(built.body["stream_options"]["include_usage"], true);
        assert!(built.body.get("logit_bias").is_none());
    }

    #[test]
    fn unary_build_has_no_stream_options() {
        let c = candidate(ChannelType::Openai, Preset::Empty, "gpt-4o");
        let built = OpenAiAdapter
            .build(&c, &serde_json::json!({"model": "gpt-4o", "messages": []}), false)
            .unwrap();
        assert_eq!(built.body["stream"], false);
        assert!(built.body.get("stream_options").is_none());
    }

    #[test]
    fn parse_reads_first_choice() {
        let body = serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": "hey"}}],
            "usage": {
                "prompt_tokens": 7,
                "completion_tokens": 2,
                "prompt_tokens_details": {"cached_tokens": 3}
            }
        });
        let parsed = OpenAiAdapter.parse(&body);
        assert_eq!(parsed.text, "hey");
        assert_eq!(parsed.usage.input_tokens, 7);
        assert_eq!(parsed.usage.output_tokens, 2);
        assert_eq!(parsed.usage.cache_read_tokens, 3);
    }

    #[test]
    fn stream_decode_collects_text_and_usage() {
        let a = OpenAiAdapter;
        let mut stats = StreamStats::default();

        a.decode_line(
            r#"data: {"object":"chat.completion.chunk","choices":[{"delta":{"content":"Hi "}}]}"#,
            &mut stats,
        );
        a.decode_line(
            r#"data: {"object":"chat.completion.chunk","choices":[{"delta":{"content":"there"},"finish_reason":"stop"}]}"#,
            &mut stats,
        );
        a.decode_line(
            r#"data: {"object":"chat.completion.chunk","choices":[],"usage":{"prompt_tokens":5,"completion_tokens":2}}"#,
            &mut stats,
        );
        a.decode_line("data: [DONE]", &mut stats);

        assert_eq!(stats.text, "Hi there");
        assert_eq!(stats.finish_reason.as_deref(), Some("stop"));
        assert_eq!(stats.usage.input_tokens, 5);
        assert_eq!(stats.usage.output_tokens, 2);
        assert!(stats.done);
    }
}
