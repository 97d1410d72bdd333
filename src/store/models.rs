//! Persisted row types.
//!
//! These mirror the semantic columns of the schema; parsing and indexing for
//! the dispatch path happens in the routing cache, not here.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Upstream provider wire dialect of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChannelType {
    Anthropic,
    Codex,
    Gemini,
    GeminiCli,
    Openai,
}

impl ChannelType {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "anthropic" | "claude" => Some(ChannelType::Anthropic),
            "codex" | "responses" => Some(ChannelType::Codex),
            "gemini" => Some(ChannelType::Gemini),
            "gemini-cli" => Some(ChannelType::GeminiCli),
            "openai" => Some(ChannelType::Openai),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelType::Anthropic => "anthropic",
            ChannelType::Codex => "codex",
            ChannelType::Gemini => "gemini",
            ChannelType::GeminiCli => "gemini-cli",
            ChannelType::Openai => "openai",
        }
    }
}

impl std::fmt::Display for ChannelType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Template preset selecting alternative URL/header/body shapes within a
/// dialect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Preset {
    Official,
    Custom,
    #[default]
    #[serde(rename = "")]
    Empty,
}

impl Preset {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "official" => Preset::Official,
            "custom" => Preset::Custom,
            _ => Preset::Empty,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Preset::Official => "official",
            Preset::Custom => "custom",
            Preset::Empty => "",
        }
    }
}

/// Key rotation strategy within a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategy {
    #[default]
    Sequential,
    RoundRobin,
}

impl KeyStrategy {
    pub fn from_str(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "round_robin" => KeyStrategy::RoundRobin,
            _ => KeyStrategy::Sequential,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            KeyStrategy::Sequential => "sequential",
            KeyStrategy::RoundRobin => "round_robin",
        }
    }
}

/// Cooldown deadline pair. `until_s == 0` means not cooling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Cooldown {
    pub until_s: i64,
    pub last_ms: i64,
}

impl Cooldown {
    pub fn is_cooling(&self, now_s: i64) -> bool {
        self.until_s > now_s
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Channel {
    pub id: i64,
    pub name: String,
    pub channel_type: ChannelType,
    /// Canonical base URL, mirrored from the active endpoint.
    pub url: String,
    pub priority: i64,
    pub sort_order: i64,
    pub models: Vec<String>,
    pub model_redirects: HashMap<String, String>,
    pub enabled: bool,
    pub preset: Preset,
    pub openai_compat: bool,
    pub auto_select_endpoint: bool,
    pub quota_config: Option<String>,
    pub cooldown: Cooldown,
    pub created_at: i64,
    pub updated_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKey {
    pub id: i64,
    pub channel_id: i64,
    /// Dense 0-based index within the channel.
    pub key_index: i64,
    pub credential: String,
    pub strategy: KeyStrategy,
    pub cooldown: Cooldown,
    pub access_token: Option<String>,
    pub id_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at: Option<i64>,
    pub device_fingerprint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelEndpoint {
    pub id: i64,
    pub channel_id: i64,
    pub url: String,
    pub is_active: bool,
    pub latency_ms: Option<i64>,
    pub last_status: Option<i64>,
    pub last_test_at: i64,
    pub sort_order: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthToken {
    pub id: i64,
    /// SHA-256 hex of the bearer credential.
    pub token_hash: String,
    pub description: String,
    pub active: bool,
    pub expires_at: Option<i64>,
    pub all_channels: bool,
    pub last_used_at: i64,
    pub success_count: i64,
    pub failure_count: i64,
    pub stream_count: i64,
    pub non_stream_count: i64,
    pub stream_avg_ttfb_s: f64,
    pub non_stream_avg_rt_s: f64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub cache_read_tokens: i64,
    pub cache_creation_tokens: i64,
    pub total_cost_usd: f64,
}

impl AuthToken {
    /// Whether the token may authenticate a request right now.
    pub fn is_usable(&self, now_s: i64) -> bool {
        if !self.active {
            return false;
        }
        match self.expires_at {
            Some(expires) if expires > 0 => expires > now_s,
            _ => true,
        }
    }
}

/// One terminal outcome of a client request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRow {
    pub ts_ms: i64,
    pub model: String,
    pub channel_id: i64,
    pub status: i64,
    pub duration_s: f64,
    pub streaming: bool,
    pub first_byte_s: Option<f64>,
    pub key_excerpt: String,
    pub api_base_url: String,
    pub auth_token_id: i64,
    pub client_ip: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_read_tokens: i64,
    pub cache_creation_tokens: i64,
    pub cost_usd: f64,
    pub message: Option<String>,
}

/// Aggregate keyed `(date, channel_id, model, auth_token_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyStat {
    pub date: String,
    pub channel_id: i64,
    pub model: String,
    pub auth_token_id: i64,
    pub request_count: i64,
    pub success_count: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_read_tokens: i64,
    pub cache_creation_tokens: i64,
    pub cost_usd: f64,
    pub avg_duration_s: f64,
    pub stream_count: i64,
    pub non_stream_count: i64,
}

/// One accounting sample applied to an auth token's running counters.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenStatSample {
    pub success: bool,
    pub streaming: bool,
    pub duration_s: f64,
    pub first_byte_s: Option<f64>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_read_tokens: i64,
    pub cache_creation_tokens: i64,
    pub cost_usd: f64,
}

/// Cooldown subject: a channel or a key row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Subject {
    Channel(i64),
    Key(i64),
}

impl std::fmt::Display for Subject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Subject::Channel(id) => write!(f, "channel:{}", id),
            Subject::Key(id) => write!(f, "key:{}", id),
        }
    }
}

/// Excerpt of a credential safe for log rows: first 4 + last 4 characters.
pub fn key_excerpt(credential: &str) -> String {
    let chars: Vec<char> = credential.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}****{}", head, tail)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_type_roundtrip() {
        for t in [
            ChannelType::Anthropic,
            ChannelType::Codex,
            ChannelType::Gemini,
            ChannelType::GeminiCli,
            ChannelType::Openai,
        ] {
            assert_eq!(ChannelType::from_str(t.as_str()), Some(t));
        }
        assert_eq!(ChannelType::from_str("mistral"), None);
    }

    #[test]
    fn cooldown_observation() {
        let c = Cooldown { until_s: 100, last_ms: 2000 };
        assert!(c.is_cooling(99));
        assert!(!c.is_cooling(100));
        assert!(!Cooldown::default().is_cooling(0));
    }

    #[test]
    fn token_usability() {
        let mut t = AuthToken {
            id: 1,
            token_hash: String::new(),
            description: String::new(),
            active: true,
            expires_at: None,
            all_channels: true,
            last_used_at: 0,
            success_count: 0,
            failure_count: 0,
            stream_count: 0,
            non_stream_count: 0,
            stream_avg_ttfb_s: 0.0,
            non_stream_avg_rt_s: 0.0,
            prompt_tokens: 0,
            completion_tokens: 0,
            cache_read_tokens: 0,
            cache_creation_tokens: 0,
            total_cost_usd: 0.0,
        };
        assert!(t.is_usable(1000));
        t.expires_at = Some(999);
        assert!(!t.is_usable(1000));
        t.expires_at = Some(1001);
        assert!(t.is_usable(1000));
        t.active = false;
        assert!(!t.is_usable(1000));
    }

    #[test]
    fn excerpt_masks_short_keys() {
        assert_eq!(key_excerpt("sk-12345"), "****");
        assert_eq!(key_excerpt("sk-abcdefgh1234"), "sk-a****1234");
    }
}
