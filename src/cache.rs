//! Routing cache.
//!
//! Holds the latest immutable snapshot of channels with parsed keys and
//! endpoints. Readers clone an `Arc` and never lock across a dispatch; a
//! background job rebuilds the snapshot on store invalidation or TTL expiry
//! and publishes it atomically.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::error::AppResult;
use crate::store::{self, Channel, ChannelEndpoint, Cooldown, KeyStrategy};

/// Fallback rebuild period guarding against missed notifications.
pub const REFRESH_TTL: Duration = Duration::from_secs(60);

/// One usable credential form within a channel.
///
/// A stored credential expands to several forms when it is a comma-separated
/// list; a credential that is itself a single JSON object or array (an OAuth
/// bundle) is always one form.
#[derive(Debug, Clone)]
pub struct ParsedKey {
    /// Owning `api_keys` row; cooldown subject id.
    pub key_id: i64,
    /// Dense position in the channel's flattened key list.
    pub ordinal: usize,
    pub secret: String,
    pub strategy: KeyStrategy,
    pub cooldown: Cooldown,
    pub access_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ChannelWithKeys {
    pub channel: Channel,
    pub keys: Vec<ParsedKey>,
    pub endpoints: Vec<ChannelEndpoint>,
}

impl ChannelWithKeys {
    /// Base URL for dispatch: the active endpoint when present, otherwise
    /// the channel's canonical URL.
    pub fn base_url(&self) -> &str {
        self.endpoints
            .iter()
            .find(|e| e.is_active)
            .map(|e| e.url.as_str())
            .unwrap_or(&self.channel.url)
    }

    /// Rotation mode for this channel's key list.
    pub fn rotation(&self) -> KeyStrategy {
        self.keys
            .first()
            .map(|k| k.strategy)
            .unwrap_or(KeyStrategy::Sequential)
    }
}

/// Immutable view of the routing state.
#[derive(Debug, Default)]
pub struct RoutingSnapshot {
    channels: Vec<ChannelWithKeys>,
    by_id: HashMap<i64, usize>,
    pub built_at_s: i64,
}

impl RoutingSnapshot {
    pub fn get(&self, id: i64) -> Option<&ChannelWithKeys> {
        self.by_id.get(&id).map(|&i| &self.channels[i])
    }

    /// Enabled channels ordered by `(-priority, sort_order, id)`.
    pub fn enumerate_enabled(&self) -> impl Iterator<Item = &ChannelWithKeys> {
        self.channels.iter().filter(|c| c.channel.enabled)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

#[cfg(test)]
impl RoutingSnapshot {
    /// Build a snapshot directly from in-memory records for unit tests.
    pub(crate) fn for_test(mut channels: Vec<ChannelWithKeys>) -> Arc<RoutingSnapshot> {
        channels.sort_by(|a, b| {
            (-a.channel.priority, a.channel.sort_order, a.channel.id).cmp(&(
                -b.channel.priority,
                b.channel.sort_order,
                b.channel.id,
            ))
        });
        let by_id = channels
            .iter()
            .enumerate()
            .map(|(i, c)| (c.channel.id, i))
            .collect();
        Arc::new(RoutingSnapshot { channels, by_id, built_at_s: 0 })
    }
}

static SNAPSHOT: Lazy<RwLock<Arc<RoutingSnapshot>>> =
    Lazy::new(|| RwLock::new(Arc::new(RoutingSnapshot::default())));

/// Current snapshot; cheap to call, never blocks on a refresh.
pub fn snapshot() -> Arc<RoutingSnapshot> {
    SNAPSHOT.read().unwrap().clone()
}

/// Split a stored credential into its usable forms.
pub fn parse_key_forms(credential: &str) -> Vec<String> {
    let trimmed = credential.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }
    // A whole-credential JSON object/array is one key (OAuth bundles carry
    // commas inside).
    if (trimmed.starts_with('{') || trimmed.starts_with('['))
        && serde_json::from_str::<serde_json::Value>(trimmed).is_ok()
    {
        return vec![trimmed.to_string()];
    }
    trimmed
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}

fn build_snapshot() -> AppResult<RoutingSnapshot> {
    let rows = store::channels::load_snapshot_rows()?;
    let mut channels = Vec::with_capacity(rows.len());

    for (channel, keys, endpoints) in rows {
        let mut parsed = Vec::new();
        for key in &keys {
            for secret in parse_key_forms(&key.credential) {
                parsed.push(ParsedKey {
                    key_id: key.id,
                    ordinal: parsed.len(),
                    secret,
                    strategy: key.strategy,
                    cooldown: key.cooldown,
                    access_token: key.access_token.clone(),
                });
            }
        }
        channels.push(ChannelWithKeys {
            channel,
            keys: parsed,
            endpoints,
        });
    }

    channels.sort_by(|a, b| {
        (-a.channel.priority, a.channel.sort_order, a.channel.id).cmp(&(
            -b.channel.priority,
            b.channel.sort_order,
            b.channel.id,
        ))
    });

    let by_id = channels
        .iter()
        .enumerate()
        .map(|(i, c)| (c.channel.id, i))
        .collect();

    Ok(RoutingSnapshot {
        channels,
        by_id,
        built_at_s: crate::clock::epoch_s(),
    })
}

/// Rebuild from the store and publish atomically.
pub fn refresh() -> AppResult<()> {
    let fresh = Arc::new(build_snapshot()?);
    let count = fresh.len();
    {
        let mut guard = SNAPSHOT.write().unwrap();
        *guard = fresh;
    }
    crate::logger::debug("cache", &format!("Routing snapshot rebuilt: {} channels", count));
    Ok(())
}

/// Long-lived refresher: rebuilds on store invalidation, with a TTL tick as
/// fallback. Exits when the shutdown signal flips.
pub async fn run_refresher(mut shutdown: tokio::sync::watch::Receiver<bool>) {
    let mut invalidations = store::watch_invalidate();
    loop {
        tokio::select! {
            changed = invalidations.changed() => {
                if changed.is_err() {
                    return;
                }
                if let Err(e) = refresh() {
                    crate::logger::warn("cache", &format!("Snapshot refresh failed: {}", e));
                }
            }
            _ = tokio::time::sleep(REFRESH_TTL) => {
                if let Err(e) = refresh() {
                    crate::logger::warn("cache", &format!("TTL snapshot refresh failed: {}", e));
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::channels::{create_channel, ChannelInput, KeyInput};
    use crate::store::testutil::use_temp_db;

    #[test]
    fn key_forms_split_on_commas() {
        assert_eq!(parse_key_forms("a,b , c"), vec!["a", "b", "c"]);
        assert_eq!(parse_key_forms("single"), vec!["single"]);
        assert_eq!(parse_key_forms("  "), Vec::<String>::new());
        assert_eq!(parse_key_forms("a,,b"), vec!["a", "b"]);
    }

    #[test]
    fn json_blob_is_one_key() {
        let blob = r#"{"access_token":"a,b","refresh_token":"c"}"#;
        assert_eq!(parse_key_forms(blob), vec![blob]);
        let array = r#"["x","y"]"#;
        assert_eq!(parse_key_forms(array), vec![array]);
        // Malformed JSON falls back to comma splitting.
        assert_eq!(parse_key_forms("{broken,json"), vec!["{broken", "json"]);
    }

    fn input(name: &str, priority: i64, sort_order: i64) -> ChannelInput {
        ChannelInput {
            name: name.to_string(),
            channel_type: "openai".to_string(),
            url: format!("https://{}.example.com", name),
            priority,
            sort_order,
            models: vec!["gpt-4o".to_string()],
            model_redirects: Default::default(),
            enabled: true,
            preset: String::new(),
            openai_compat: false,
            auto_select_endpoint: false,
            quota_config: None,
            keys: vec![KeyInput {
                credential: "k1,k2".to_string(),
                strategy: KeyStrategy::Sequential,
            }],
            endpoints: vec![],
        }
    }

    #[test]
    fn snapshot_order_and_lookup() {
        let _db = use_temp_db("cache-snapi");
        let low = create_channel(&input("low", 5, 0)).unwrap();
        let tie_b = create_channel(&input("tie-b", 10, 2)).unwrap();
        let tie_a = create_channel(&input("tie-a", 10, 1)).unwrap();

        refresh().unwrap();
        let snap = snapshot();

        let order: Vec<i64> = snap.enumerate_enabled().map(|c| c.channel.id).collect();
        assert_eq!(order, vec![tie_a, tie_b, low]);

        let ch = snap.get(low).unwrap();
        assert_eq!(ch.channel.name, "low");
        // Comma credential expanded into two parsed keys with one subject id.
        assert_eq!(ch.keys.len(), 2);
        assert_eq!(ch.keys[0].key_id, ch.keys[1].key_id);
        assert_eq!(ch.keys[0].ordinal, 0);
        assert_eq!(ch.keys[1].ordinal, 1);
    }
}
