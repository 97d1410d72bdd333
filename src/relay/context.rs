//! Shared dispatch context structures.

use serde_json::Value;

use crate::cache::ParsedKey;
use crate::store::{AuthToken, ChannelType, Cooldown, Preset};

/// Wire dialect requested by the client, derived from the inbound route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientDialect {
    Anthropic,
    OpenAi,
    Gemini,
    Codex,
}

impl ClientDialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientDialect::Anthropic => "anthropic",
            ClientDialect::OpenAi => "openai",
            ClientDialect::Gemini => "gemini",
            ClientDialect::Codex => "codex",
        }
    }

    /// Whether a channel of the given dialect can serve this request shape.
    ///
    /// Identical dialect always matches; `gemini-cli` channels speak the
    /// Gemini shape; any channel with `openai_compat` serves the OpenAI
    /// chat-completions shape.
    pub fn accepts(&self, channel_type: ChannelType, openai_compat: bool) -> bool {
        let native = match self {
            ClientDialect::Anthropic => matches!(channel_type, ChannelType::Anthropic),
            ClientDialect::OpenAi => matches!(channel_type, ChannelType::Openai),
            ClientDialect::Gemini => {
                matches!(channel_type, ChannelType::Gemini | ChannelType::GeminiCli)
            }
            ClientDialect::Codex => matches!(channel_type, ChannelType::Codex),
        };
        native || (matches!(self, ClientDialect::OpenAi) && openai_compat)
    }
}

impl std::fmt::Display for ClientDialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Everything known about one client request before candidate iteration.
#[derive(Debug, Clone)]
pub struct RelayRequest {
    pub request_id: String,
    pub dialect: ClientDialect,
    pub model: String,
    pub payload: Value,
    pub streaming: bool,
    pub token: AuthToken,
    pub client_ip: String,
}

/// One attempt tuple produced by the candidate builder.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub channel_id: i64,
    pub channel_name: String,
    pub channel_type: ChannelType,
    pub preset: Preset,
    pub openai_compat: bool,
    pub effective_model: String,
    pub endpoint_url: String,
    pub quota_config: Option<String>,
    pub channel_cooldown: Cooldown,
    pub key: ParsedKey,
}

/// Token usage counters across the four accounting classes.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TokenUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_read_tokens: i64,
    pub cache_creation_tokens: i64,
}

impl TokenUsage {
    pub fn total(&self) -> i64 {
        self.input_tokens + self.output_tokens + self.cache_read_tokens + self.cache_creation_tokens
    }

    pub fn merge(&mut self, other: &TokenUsage) {
        if other.input_tokens > 0 {
            self.input_tokens = other.input_tokens;
        }
        if other.output_tokens > 0 {
            self.output_tokens = other.output_tokens;
        }
        if other.cache_read_tokens > 0 {
            self.cache_read_tokens = other.cache_read_tokens;
        }
        if other.cache_creation_tokens > 0 {
            self.cache_creation_tokens = other.cache_creation_tokens;
        }
    }
}

/// Estimate tokens from text (rough approximation: ~3.5 chars per token)
pub fn estimate_tokens(text: &str) -> i64 {
    let char_count = text.chars().count();
    (char_count as f64 / 3.5).round() as i64
}
