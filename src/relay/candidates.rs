//! Candidate builder.
//!
//! Produces a lazy, finite, non-restartable sequence of `(channel, key)`
//! attempt tuples for one client request: access control, dialect
//! compatibility, model resolution, cooldown filtering, priority ordering
//! with optional in-group shuffling, and per-channel key rotation.

use once_cell::sync::Lazy;
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crate::cache::{ChannelWithKeys, RoutingSnapshot};
use crate::config::Settings;
use crate::cooldown;
use crate::store::{KeyStrategy, Preset, Subject};

use super::context::{Candidate, RelayRequest};

// Round-robin cursors are process-local; restarts begin at the first key.
static RR_CURSOR: Lazy<Mutex<HashMap<i64, usize>>> = Lazy::new(|| Mutex::new(HashMap::new()));

struct ChannelPlan {
    channel_id: i64,
    effective_model: String,
    attempts: u32,
    banned: bool,
}

pub struct CandidateBuilder {
    snapshot: Arc<RoutingSnapshot>,
    plans: Vec<ChannelPlan>,
    position: usize,
    seen: HashSet<(i64, usize)>,
    max_key_retries: u32,
}

impl CandidateBuilder {
    /// Run the filtering pipeline and fix the channel order for this
    /// request. Key selection stays lazy: it happens per `next()` call so a
    /// key tripped by an earlier attempt is skipped by later ones.
    pub fn new(
        snapshot: Arc<RoutingSnapshot>,
        request: &RelayRequest,
        allowed_channels: Option<&[i64]>,
        settings: &Settings,
        now_s: i64,
    ) -> Self {
        let mut eligible: Vec<(&ChannelWithKeys, String)> = Vec::new();

        for ch in snapshot.enumerate_enabled() {
            // Access filter.
            if let Some(allowed) = allowed_channels {
                if !allowed.contains(&ch.channel.id) {
                    continue;
                }
            }
            // Dialect filter.
            if !request
                .dialect
                .accepts(ch.channel.channel_type, ch.channel.openai_compat)
            {
                continue;
            }
            // Model resolution (redirects, exact, fuzzy).
            let Some(effective_model) = super::model_match::resolve_model(
                &ch.channel.models,
                &ch.channel.model_redirects,
                &request.model,
            ) else {
                continue;
            };
            // Channel cooldown filter.
            if cooldown::observe(Subject::Channel(ch.channel.id), now_s, ch.channel.cooldown) {
                continue;
            }
            eligible.push((ch, effective_model));
        }

        // Snapshot enumeration is already (-priority, sort_order, id); with
        // load balancing on, shuffle within equal (priority, preset) groups.
        if settings.channel_load_balance {
            shuffle_within_groups(&mut eligible);
        }

        let plans = eligible
            .into_iter()
            .map(|(ch, effective_model)| ChannelPlan {
                channel_id: ch.channel.id,
                effective_model,
                attempts: 0,
                banned: false,
            })
            .collect();

        Self {
            snapshot,
            plans,
            position: 0,
            seen: HashSet::new(),
            max_key_retries: settings.max_key_retries.max(1),
        }
    }

    /// Next attempt tuple, or `None` when every channel is exhausted.
    pub fn next(&mut self, now_s: i64) -> Option<Candidate> {
        while self.position < self.plans.len() {
            let plan = &self.plans[self.position];
            if plan.banned || plan.attempts >= self.max_key_retries {
                self.position += 1;
                continue;
            }
            let channel_id = plan.channel_id;

            let snapshot = Arc::clone(&self.snapshot);
            let Some(ch) = snapshot.get(channel_id) else {
                self.position += 1;
                continue;
            };

            match self.select_key(ch, now_s) {
                Some(ordinal) => {
                    let effective_model = {
                        let plan = &mut self.plans[self.position];
                        plan.attempts += 1;
                        plan.effective_model.clone()
                    };
                    self.seen.insert((channel_id, ordinal));
                    return Some(Candidate {
                        channel_id,
                        channel_name: ch.channel.name.clone(),
                        channel_type: ch.channel.channel_type,
                        preset: ch.channel.preset,
                        openai_compat: ch.channel.openai_compat,
                        effective_model,
                        endpoint_url: ch.base_url().to_string(),
                        quota_config: ch.channel.quota_config.clone(),
                        channel_cooldown: ch.channel.cooldown,
                        key: ch.keys[ordinal].clone(),
                    });
                }
                None => {
                    // All keys cooling or already tried: skip this channel.
                    self.position += 1;
                }
            }
        }
        None
    }

    /// Exclude a channel from the remainder of this request (model-missing
    /// responses; no cooldown involved).
    pub fn ban_channel(&mut self, channel_id: i64) {
        for plan in &mut self.plans {
            if plan.channel_id == channel_id {
                plan.banned = true;
            }
        }
    }

    /// Number of channels that survived the filtering pipeline.
    pub fn channel_count(&self) -> usize {
        self.plans.len()
    }

    fn select_key(&self, ch: &ChannelWithKeys, now_s: i64) -> Option<usize> {
        if ch.keys.is_empty() {
            return None;
        }
        let usable = |ordinal: usize| {
            let key = &ch.keys[ordinal];
            !self.seen.contains(&(ch.channel.id, ordinal))
                && !cooldown::observe(Subject::Key(key.key_id), now_s, key.cooldown)
        };

        match ch.rotation() {
            KeyStrategy::Sequential => (0..ch.keys.len()).find(|&i| usable(i)),
            KeyStrategy::RoundRobin => {
                let mut cursors = RR_CURSOR.lock().unwrap();
                let cursor = cursors.entry(ch.channel.id).or_insert(0);
                for step in 0..ch.keys.len() {
                    let ordinal = (*cursor + step) % ch.keys.len();
                    if usable(ordinal) {
                        *cursor = (ordinal + 1) % ch.keys.len();
                        return Some(ordinal);
                    }
                }
                None
            }
        }
    }
}

fn shuffle_within_groups(eligible: &mut [(&ChannelWithKeys, String)]) {
    let mut rng = rand::thread_rng();
    let mut start = 0;
    while start < eligible.len() {
        let group_key = |c: &ChannelWithKeys| (c.channel.priority, c.channel.preset);
        let key: (i64, Preset) = group_key(eligible[start].0);
        let mut end = start + 1;
        while end < eligible.len() && group_key(eligible[end].0) == key {
            end += 1;
        }
        eligible[start..end].shuffle(&mut rng);
        start = end;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{self, ChannelWithKeys, ParsedKey, RoutingSnapshot};
    use crate::store::{Channel, ChannelType, Cooldown, KeyStrategy, Preset};
    use crate::relay::context::{ClientDialect, RelayRequest};
    use crate::store::AuthToken;

    fn token() -> AuthToken {
        AuthToken {
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
        }
    }

    fn request(model: &str) -> RelayRequest {
        RelayRequest {
            request_id: "req".to_string(),
            dialect: ClientDialect::OpenAi,
            model: model.to_string(),
            payload: serde_json::json!({"model": model}),
            streaming: false,
            token: token(),
            client_ip: "127.0.0.1".to_string(),
        }
    }

    fn channel(id: i64, priority: i64, models: &[&str], keys: usize, strategy: KeyStrategy) -> ChannelWithKeys {
        ChannelWithKeys {
            channel: Channel {
                id,
                name: format!("ch-{}", id),
                channel_type: ChannelType::Openai,
                url: format!("https://ch{}.example.com", id),
                priority,
                sort_order: 0,
                models: models.iter().map(|s| s.to_string()).collect(),
                model_redirects: Default::default(),
                enabled: true,
                preset: Preset::Empty,
                openai_compat: false,
                auto_select_endpoint: false,
                quota_config: None,
                cooldown: Cooldown::default(),
                created_at: 0,
                updated_at: 0,
            },
            keys: (0..keys)
                .map(|i| ParsedKey {
                    key_id: id * 100 + i as i64,
                    ordinal: i,
                    secret: format!("sk-{}-{}", id, i),
                    strategy,
                    cooldown: Cooldown::default(),
                    access_token: None,
                })
                .collect(),
            endpoints: vec![],
        }
    }

    fn snapshot_of(channels: Vec<ChannelWithKeys>) -> Arc<RoutingSnapshot> {
        cache::RoutingSnapshot::for_test(channels)
    }

    fn drain(builder: &mut CandidateBuilder) -> Vec<(i64, usize)> {
        let mut out = Vec::new();
        while let Some(c) = builder.next(1000) {
            out.push((c.channel_id, c.key.ordinal));
        }
        out
    }

    #[test]
    fn orders_by_priority_and_dedupes() {
        let snap = snapshot_of(vec![
            channel(1, 5, &["gpt-4o"], 1, KeyStrategy::Sequential),
            channel(2, 10, &["gpt-4o"], 1, KeyStrategy::Sequential),
        ]);
        let mut b = CandidateBuilder::new(snap, &request("gpt-4o"), None, &Settings::default(), 1000);

        let seq = drain(&mut b);
        assert_eq!(seq, vec![(2, 0), (1, 0)]);
        // Non-restartable: exhausted builder yields nothing further.
        assert!(b.next(1000).is_none());
    }

    #[test]
    fn access_filter_restricts_channels() {
        let snap = snapshot_of(vec![
            channel(1, 10, &["gpt-4o"], 1, KeyStrategy::Sequential),
            channel(2, 5, &["gpt-4o"], 1, KeyStrategy::Sequential),
        ]);
        let allowed = vec![2];
        let mut b = CandidateBuilder::new(
            snap,
            &request("gpt-4o"),
            Some(&allowed),
            &Settings::default(),
            1000,
        );
        assert_eq!(drain(&mut b), vec![(2, 0)]);
    }

    #[test]
    fn dialect_filter_excludes_incompatible() {
        let mut anthropic_only = channel(1, 10, &["gpt-4o"], 1, KeyStrategy::Sequential);
        anthropic_only.channel.channel_type = ChannelType::Anthropic;
        let mut compat = channel(2, 5, &["gpt-4o"], 1, KeyStrategy::Sequential);
        compat.channel.channel_type = ChannelType::Anthropic;
        compat.channel.openai_compat = true;

        let snap = snapshot_of(vec![anthropic_only, compat]);
        let mut b = CandidateBuilder::new(snap, &request("gpt-4o"), None, &Settings::default(), 1000);
        assert_eq!(drain(&mut b), vec![(2, 0)]);
    }

    #[test]
    fn cooling_channel_is_dropped() {
        let mut cooling = channel(1, 10, &["gpt-4o"], 1, KeyStrategy::Sequential);
        cooling.channel.cooldown = Cooldown { until_s: 2000, last_ms: 1000 };
        let snap = snapshot_of(vec![cooling, channel(2, 5, &["gpt-4o"], 1, KeyStrategy::Sequential)]);

        let mut b = CandidateBuilder::new(snap, &request("gpt-4o"), None, &Settings::default(), 1000);
        assert_eq!(drain(&mut b), vec![(2, 0)]);
    }

    #[test]
    fn sequential_keys_in_index_order() {
        let snap = snapshot_of(vec![channel(1, 10, &["gpt-4o"], 3, KeyStrategy::Sequential)]);
        let mut b = CandidateBuilder::new(snap, &request("gpt-4o"), None, &Settings::default(), 1000);
        assert_eq!(drain(&mut b), vec![(1, 0), (1, 1), (1, 2)]);
    }

    #[test]
    fn round_robin_cycles_without_repetition() {
        RR_CURSOR.lock().unwrap().clear();
        let settings = Settings::default();

        let mut used = Vec::new();
        for _ in 0..3 {
            let snap = snapshot_of(vec![channel(7, 10, &["gpt-4o"], 3, KeyStrategy::RoundRobin)]);
            let mut b = CandidateBuilder::new(snap, &request("gpt-4o"), None, &settings, 1000);
            let c = b.next(1000).unwrap();
            used.push(c.key.ordinal);
        }
        let mut sorted = used.clone();
        sorted.sort_unstable();
        assert_eq!(sorted, vec![0, 1, 2]);
    }

    #[test]
    fn cooling_key_skipped_within_channel() {
        let mut ch = channel(1, 10, &["gpt-4o"], 2, KeyStrategy::Sequential);
        ch.keys[0].cooldown = Cooldown { until_s: 5000, last_ms: 1000 };
        let snap = snapshot_of(vec![ch]);
        let mut b = CandidateBuilder::new(snap, &request("gpt-4o"), None, &Settings::default(), 1000);
        assert_eq!(drain(&mut b), vec![(1, 1)]);
    }

    #[test]
    fn max_key_retries_caps_channel_attempts() {
        let snap = snapshot_of(vec![channel(1, 10, &["gpt-4o"], 5, KeyStrategy::Sequential)]);
        let settings = Settings { max_key_retries: 2, ..Settings::default() };
        let mut b = CandidateBuilder::new(snap, &request("gpt-4o"), None, &settings, 1000);
        assert_eq!(drain(&mut b).len(), 2);
    }

    #[test]
    fn banned_channel_is_skipped() {
        let snap = snapshot_of(vec![
            channel(1, 10, &["gpt-4o"], 2, KeyStrategy::Sequential),
            channel(2, 5, &["gpt-4o"], 1, KeyStrategy::Sequential),
        ]);
        let mut b = CandidateBuilder::new(snap, &request("gpt-4o"), None, &Settings::default(), 1000);
        let first = b.next(1000).unwrap();
        assert_eq!(first.channel_id, 1);
        b.ban_channel(1);
        let rest = drain(&mut b);
        assert_eq!(rest, vec![(2, 0)]);
    }

    #[test]
    fn fuzzy_resolution_sets_effective_model() {
        let snap = snapshot_of(vec![channel(
            1,
            10,
            &["claude-sonnet-4-5-20250929", "claude-sonnet-4-5-20251001"],
            1,
            KeyStrategy::Sequential,
        )]);
        let mut req = request("sonnet");
        req.dialect = ClientDialect::OpenAi;
        let mut b = CandidateBuilder::new(snap, &req, None, &Settings::default(), 1000);
        let c = b.next(1000).unwrap();
        assert_eq!(c.effective_model, "claude-sonnet-4-5-20251001");
    }

    #[test]
    fn load_balance_shuffle_keeps_priority_groups() {
        let snap = snapshot_of(vec![
            channel(1, 10, &["gpt-4o"], 1, KeyStrategy::Sequential),
            channel(2, 10, &["gpt-4o"], 1, KeyStrategy::Sequential),
            channel(3, 5, &["gpt-4o"], 1, KeyStrategy::Sequential),
        ]);
        let settings = Settings { channel_load_balance: true, ..Settings::default() };
        let mut b = CandidateBuilder::new(snap, &request("gpt-4o"), None, &settings, 1000);
        let order: Vec<i64> = drain(&mut b).into_iter().map(|(id, _)| id).collect();
        // The low-priority channel always comes last.
        assert_eq!(order.len(), 3);
        assert_eq!(*order.last().unwrap(), 3);
        assert!(order[..2].contains(&1) && order[..2].contains(&2));
    }
}
