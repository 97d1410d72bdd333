//! Dialect adapters.
//!
//! One adapter per upstream wire dialect. Each knows how to build the
//! outbound request (URL suffix, auth headers, body shape), parse a unary
//! response for accounting, and decode streaming events incrementally.
//! Dispatch selects the adapter from `(channel dialect, preset,
//! openai_compat)`.

pub mod anthropic;
pub mod codex;
pub mod gemini;
pub mod openai;

use reqwest::header::HeaderMap;
use serde_json::Value;

use crate::store::ChannelType;

use super::context::{Candidate, ClientDialect, TokenUsage};
use super::error::RelayResult;

/// Outbound request produced by `build`.
#[derive(Debug)]
pub struct BuiltRequest {
    pub url: String,
    pub headers: HeaderMap,
    pub body: Value,
    /// Whether the upstream call is made in streaming mode.
    pub streaming: bool,
}

/// Accounting view of a unary upstream response.
#[derive(Debug, Default)]
pub struct ParsedResponse {
    pub text: String,
    pub usage: TokenUsage,
}

/// Accumulator fed one SSE line at a time while a response streams.
#[derive(Debug, Default)]
pub struct StreamStats {
    pub text: String,
    pub usage: TokenUsage,
    pub finish_reason: Option<String>,
    pub done: bool,
}

pub enum DialectAdapter {
    Anthropic(anthropic::AnthropicAdapter),
    Codex(codex::CodexAdapter),
    GeminiNative(gemini::GeminiAdapter),
    GeminiCli(gemini::GeminiCliAdapter),
    OpenAiCompat(openai::OpenAiAdapter),
}

impl DialectAdapter {
    pub fn name(&self) -> &'static str {
        match self {
            DialectAdapter::Anthropic(_) => "anthropic",
            DialectAdapter::Codex(_) => "codex",
            DialectAdapter::GeminiNative(_) => "gemini",
            DialectAdapter::GeminiCli(_) => "gemini-cli",
            DialectAdapter::OpenAiCompat(_) => "openai",
        }
    }

    /// Dialects whose upstream only speaks SSE; unary client requests are
    /// served by aggregating the stream.
    pub fn requires_streaming(&self) -> bool {
        matches!(
            self,
            DialectAdapter::Codex(_) | DialectAdapter::GeminiNative(_) | DialectAdapter::GeminiCli(_)
        )
    }

    pub fn build(&self, candidate: &Candidate, payload: &Value, streaming: bool) -> RelayResult<BuiltRequest> {
        match self {
            DialectAdapter::Anthropic(a) => a.build(candidate, payload, streaming),
            DialectAdapter::Codex(a) => a.build(candidate, payload),
            DialectAdapter::GeminiNative(a) => a.build(candidate, payload),
            DialectAdapter::GeminiCli(a) => a.build(candidate, payload),
            DialectAdapter::OpenAiCompat(a) => a.build(candidate, payload, streaming),
        }
    }

    pub fn parse(&self, body: &Value) -> ParsedResponse {
        match self {
            DialectAdapter::Anthropic(a) => a.parse(body),
            DialectAdapter::Codex(a) => a.parse(body),
            DialectAdapter::GeminiNative(a) => a.parse(body),
            DialectAdapter::GeminiCli(a) => a.parse(body),
            DialectAdapter::OpenAiCompat(a) => a.parse(body),
        }
    }

    /// Feed one SSE line into the accounting accumulator.
    pub fn decode_line(&self, line: &str, stats: &mut StreamStats) {
        match self {
            DialectAdapter::Anthropic(a) => a.decode_line(line, stats),
            DialectAdapter::Codex(a) => a.decode_line(line, stats),
            DialectAdapter::GeminiNative(a) => a.decode_line(line, stats),
            DialectAdapter::GeminiCli(a) => a.decode_line(line, stats),
            DialectAdapter::OpenAiCompat(a) => a.decode_line(line, stats),
        }
    }

    /// Build a unary response body in the channel dialect from an
    /// aggregated stream, for dialects that only stream upstream.
    pub fn synthesize_unary(&self, stats: &StreamStats, model: &str) -> Value {
        match self {
            DialectAdapter::Codex(a) => a.synthesize_unary(stats, model),
            DialectAdapter::GeminiNative(a) => a.synthesize_unary(stats),
            DialectAdapter::GeminiCli(a) => a.synthesize_unary(stats),
            // Pass-through dialects never synthesize.
            _ => Value::Null,
        }
    }
}

/// Select the adapter for a candidate.
///
/// An OpenAI-shaped request served by a non-OpenAI channel rides the
/// channel's OpenAI-compatible surface; otherwise the channel's native
/// dialect decides, with the preset picking template variants inside the
/// adapter.
pub fn adapter_for(dialect: ClientDialect, candidate: &Candidate) -> DialectAdapter {
    if dialect == ClientDialect::OpenAi
        && candidate.openai_compat
        && candidate.channel_type != ChannelType::Openai
    {
        return DialectAdapter::OpenAiCompat(openai::OpenAiAdapter);
    }
    match candidate.channel_type {
        ChannelType::Anthropic => DialectAdapter::Anthropic(anthropic::AnthropicAdapter),
        ChannelType::Codex => DialectAdapter::Codex(codex::CodexAdapter),
        ChannelType::Gemini => DialectAdapter::GeminiNative(gemini::GeminiAdapter),
        ChannelType::GeminiCli => DialectAdapter::GeminiCli(gemini::GeminiCliAdapter),
        ChannelType::Openai => DialectAdapter::OpenAiCompat(openai::OpenAiAdapter),
    }
}

/// Copy the allowed fields of a client payload, dropping everything else.
pub(crate) fn filter_payload(payload: &Value, allowed: &[&str]) -> Value {
    let mut out = serde_json::Map::new();
    if let Some(obj) = payload.as_object() {
        for (k, v) in obj {
            if allowed.contains(&k.as_str()) {
                out.insert(k.clone(), v.clone());
            }
        }
    }
    Value::Object(out)
}

/// Bearer-auth header map shared by several dialects.
pub(crate) fn bearer_headers(secret: &str) -> HeaderMap {
    use reqwest::header::HeaderValue;
    let mut headers = HeaderMap::new();
    if let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", secret)) {
        headers.insert("authorization", value);
    }
    headers.insert("content-type", HeaderValue::from_static("application/json"));
    headers
}

#[cfg(test)]
pub(crate) mod testutil {
    use crate::cache::ParsedKey;
    use crate::store::{ChannelType, Cooldown, KeyStrategy, Preset};

    use crate::relay::context::Candidate;

    pub fn candidate(channel_type: ChannelType, preset: Preset, model: &str) -> Candidate {
        Candidate {
            channel_id: 1,
            channel_name: "test".to_string(),
            channel_type,
            preset,
            openai_compat: false,
            effective_model: model.to_string(),
            endpoint_url: "https://upstream.example.com".to_string(),
            quota_config: None,
            channel_cooldown: Cooldown::default(),
            key: ParsedKey {
                key_id: 11,
                ordinal: 0,
                secret: "sk-test-123456".to_string(),
                strategy: KeyStrategy::Sequential,
                cooldown: Cooldown::default(),
                access_token: None,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Preset;
    use testutil::candidate;

    #[test]
    fn registry_selects_native_adapters() {
        let c = candidate(ChannelType::Anthropic, Preset::Empty, "m");
        assert_eq!(adapter_for(ClientDialect::Anthropic, &c).name(), "anthropic");

        let c = candidate(ChannelType::Codex, Preset::Official, "m");
        assert_eq!(adapter_for(ClientDialect::Codex, &c).name(), "codex");

        let c = candidate(ChannelType::Gemini, Preset::Empty, "m");
        assert_eq!(adapter_for(ClientDialect::Gemini, &c).name(), "gemini");

        let c = candidate(ChannelType::GeminiCli, Preset::Empty, "m");
        assert_eq!(adapter_for(ClientDialect::Gemini, &c).name(), "gemini-cli");
    }

    #[test]
    fn openai_compat_overrides_native_dialect() {
        let mut c = candidate(ChannelType::Anthropic, Preset::Empty, "m");
        c.openai_compat = true;
        assert_eq!(adapter_for(ClientDialect::OpenAi, &c).name(), "openai");
        // The same channel still serves its native shape natively.
        assert_eq!(adapter_for(ClientDialect::Anthropic, &c).name(), "anthropic");
    }

    #[test]
    fn streaming_required_set() {
        assert!(DialectAdapter::Codex(codex::CodexAdapter).requires_streaming());
        assert!(DialectAdapter::GeminiNative(gemini::GeminiAdapter).requires_streaming());
        assert!(DialectAdapter::GeminiCli(gemini::GeminiCliAdapter).requires_streaming());
        assert!(!DialectAdapter::Anthropic(anthropic::AnthropicAdapter).requires_streaming());
        assert!(!DialectAdapter::OpenAiCompat(openai::OpenAiAdapter).requires_streaming());
    }

    #[test]
    fn payload_filtering() {
        let payload = serde_json::json!({"model": "m", "messages": [], "tool": 1});
        let filtered = filter_payload(&payload, &["model", "messages"]);
        assert!(filtered.get("model").is_some());
        assert!(filtered.get("tool").is_none());
    }
}
