//! Configuration.
//!
//! Two layers: a small TOML bootstrap file (bind address, database path,
//! log level) read once at startup, and the routing settings stored in the
//! `system_settings` table and edited through the admin surface. Settings
//! reads on the dispatch path go through a short-TTL in-memory copy.

use dirs::data_dir;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;
use std::time::{Duration, Instant};

const SETTINGS_TTL: Duration = Duration::from_secs(5);

#[derive(Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct Bootstrap {
    pub bind_addr: String,
    /// Database file path; defaults to the platform data directory.
    pub db_path: Option<String>,
    pub log_level: String,
}

impl Default for Bootstrap {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8787".to_string(),
            db_path: None,
            log_level: "info".to_string(),
        }
    }
}

fn bootstrap_path() -> PathBuf {
    let mut p = data_dir().unwrap_or_else(|| PathBuf::from("."));
    p.push("llmrelay");
    std::fs::create_dir_all(&p).ok();
    p.push("config.toml");
    p
}

pub fn bootstrap() -> Bootstrap {
    let p = bootstrap_path();
    if p.exists() {
        let s = std::fs::read_to_string(&p).unwrap_or_default();
        toml::from_str(&s).unwrap_or_else(|e| {
            eprintln!("Failed to parse bootstrap config: {}", e);
            Bootstrap::default()
        })
    } else {
        Bootstrap::default()
    }
}

/// Resolve the SQLite database path. `LLMRELAY_DB` overrides the bootstrap
/// file, which overrides the platform data directory.
pub fn db_path() -> PathBuf {
    if let Ok(p) = std::env::var("LLMRELAY_DB") {
        return PathBuf::from(p);
    }
    if let Some(p) = bootstrap().db_path {
        return PathBuf::from(p);
    }
    let mut p = data_dir().unwrap_or_else(|| PathBuf::from("."));
    p.push("llmrelay");
    std::fs::create_dir_all(&p).ok();
    p.push("llmrelay.db");
    p
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CooldownMode {
    Exponential,
    Fixed,
}

/// Routing settings consumed by the dispatch core. Stored as key/value rows
/// in `system_settings`; unknown keys are ignored, missing keys take the
/// defaults below.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub log_retention_days: i64,
    pub stats_retention_days: i64,
    pub max_key_retries: u32,
    pub cooldown_mode: CooldownMode,
    pub cooldown_fixed_interval: u64,
    pub endpoint_test_count: u32,
    pub auto_test_endpoints_interval: u64,
    pub channel_load_balance: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            log_retention_days: 7,
            stats_retention_days: 365,
            max_key_retries: 3,
            cooldown_mode: CooldownMode::Exponential,
            cooldown_fixed_interval: 60,
            endpoint_test_count: 3,
            auto_test_endpoints_interval: 300,
            channel_load_balance: false,
        }
    }
}

impl Settings {
    pub fn from_pairs(pairs: &HashMap<String, String>) -> Self {
        let mut s = Settings::default();
        if let Some(v) = pairs.get("log_retention_days").and_then(|v| v.parse().ok()) {
            s.log_retention_days = v;
        }
        if let Some(v) = pairs.get("stats_retention_days").and_then(|v| v.parse().ok()) {
            s.stats_retention_days = v;
        }
        if let Some(v) = pairs.get("max_key_retries").and_then(|v| v.parse().ok()) {
            s.max_key_retries = v;
        }
        if let Some(v) = pairs.get("cooldown_mode") {
            if v.eq_ignore_ascii_case("fixed") {
                s.cooldown_mode = CooldownMode::Fixed;
            }
        }
        if let Some(v) = pairs
            .get("cooldown_fixed_interval")
            .and_then(|v| v.parse().ok())
        {
            s.cooldown_fixed_interval = v;
        }
        if let Some(v) = pairs.get("endpoint_test_count").and_then(|v| v.parse().ok()) {
            s.endpoint_test_count = v;
        }
        if let Some(v) = pairs
            .get("auto_test_endpoints_interval")
            .and_then(|v| v.parse().ok())
        {
            s.auto_test_endpoints_interval = v;
        }
        if let Some(v) = pairs.get("channel_load_balance") {
            s.channel_load_balance = matches!(
                v.trim().to_ascii_lowercase().as_str(),
                "true" | "1" | "yes" | "on"
            );
        }
        // Probe count is bounded to keep the prober cheap.
        s.endpoint_test_count = s.endpoint_test_count.clamp(1, 10);
        s
    }

    pub fn to_pairs(&self) -> HashMap<String, String> {
        let mut pairs = HashMap::new();
        pairs.insert(
            "log_retention_days".to_string(),
            self.log_retention_days.to_string(),
        );
        pairs.insert(
            "stats_retention_days".to_string(),
            self.stats_retention_days.to_string(),
        );
        pairs.insert("max_key_retries".to_string(), self.max_key_retries.to_string());
        pairs.insert(
            "cooldown_mode".to_string(),
            match self.cooldown_mode {
                CooldownMode::Exponential => "exponential".to_string(),
                CooldownMode::Fixed => "fixed".to_string(),
            },
        );
        pairs.insert(
            "cooldown_fixed_interval".to_string(),
            self.cooldown_fixed_interval.to_string(),
        );
        pairs.insert(
            "endpoint_test_count".to_string(),
            self.endpoint_test_count.to_string(),
        );
        pairs.insert(
            "auto_test_endpoints_interval".to_string(),
            self.auto_test_endpoints_interval.to_string(),
        );
        pairs.insert(
            "channel_load_balance".to_string(),
            self.channel_load_balance.to_string(),
        );
        pairs
    }
}

static SETTINGS_CACHE: Lazy<RwLock<Option<(Instant, Settings)>>> = Lazy::new(|| RwLock::new(None));

/// Current routing settings, served from a short-TTL cache.
pub fn settings() -> Settings {
    {
        let cache = SETTINGS_CACHE.read().unwrap();
        if let Some((loaded_at, settings)) = cache.as_ref() {
            if loaded_at.elapsed() < SETTINGS_TTL {
                return settings.clone();
            }
        }
    }

    let fresh = match crate::store::settings_pairs() {
        Ok(pairs) => Settings::from_pairs(&pairs),
        Err(e) => {
            crate::logger::warn("config", &format!("Failed to load settings: {}", e));
            Settings::default()
        }
    };

    let mut cache = SETTINGS_CACHE.write().unwrap();
    *cache = Some((Instant::now(), fresh.clone()));
    fresh
}

/// Drop the cached settings copy; the next read reloads from the store.
pub fn invalidate_settings_cache() {
    let mut cache = SETTINGS_CACHE.write().unwrap();
    *cache = None;
}
