//! Cooldown engine.
//!
//! Per-subject (channel or key) deadlines with exponential or fixed backoff.
//! The in-memory map is authoritative within a cache epoch; every transition
//! is written through to the store asynchronously so a rebuilt snapshot
//! carries the same state.

use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::config::{CooldownMode, Settings};
use crate::store::{self, Cooldown, Subject};

const INITIAL_MS: i64 = 1_000;
const CAP_MS: i64 = 3_600_000;

static STATE: Lazy<Mutex<HashMap<Subject, Cooldown>>> = Lazy::new(|| Mutex::new(HashMap::new()));

/// Next cooldown duration in milliseconds given the previous one.
pub fn next_duration_ms(settings: &Settings, last_ms: i64) -> i64 {
    match settings.cooldown_mode {
        CooldownMode::Fixed => settings.cooldown_fixed_interval as i64 * 1_000,
        CooldownMode::Exponential => (last_ms * 2).clamp(INITIAL_MS, CAP_MS),
    }
}

/// Whether the subject is cooling at `now_s`.
///
/// The in-memory entry wins over the snapshot's persisted pair; the snapshot
/// value covers subjects this process has not tripped since startup.
pub fn observe(subject: Subject, now_s: i64, persisted: Cooldown) -> bool {
    let state = STATE.lock().unwrap();
    match state.get(&subject) {
        Some(cd) => cd.is_cooling(now_s),
        None => persisted.is_cooling(now_s),
    }
}

/// Trip the subject's cooldown and return the imposed duration in ms.
///
/// `retry_after_s` (from a provider `Retry-After` header) overrides the
/// backoff computation, clamped to the cap. `persisted_last_ms` seeds the
/// doubling when this process has no in-memory entry yet.
pub fn trip(
    subject: Subject,
    now_s: i64,
    settings: &Settings,
    retry_after_s: Option<u64>,
    persisted_last_ms: i64,
) -> i64 {
    let next_ms = {
        let mut state = STATE.lock().unwrap();
        let last_ms = state
            .get(&subject)
            .map(|cd| cd.last_ms)
            .unwrap_or(persisted_last_ms);
        let next_ms = match retry_after_s {
            Some(secs) => ((secs as i64) * 1_000).clamp(INITIAL_MS, CAP_MS),
            None => next_duration_ms(settings, last_ms),
        };
        state.insert(
            subject,
            Cooldown {
                until_s: now_s + next_ms / 1_000,
                last_ms: next_ms,
            },
        );
        next_ms
    };

    crate::logger::info(
        "cooldown",
        &format!("Tripped {} for {}ms", subject, next_ms),
    );
    persist(subject, now_s + next_ms / 1_000, next_ms);
    next_ms
}

/// Clear the subject's cooldown; called on any success for that subject.
pub fn reset(subject: Subject) {
    let had_entry = {
        let mut state = STATE.lock().unwrap();
        state.insert(subject, Cooldown::default()).is_some()
    };
    if had_entry {
        crate::logger::debug("cooldown", &format!("Reset {}", subject));
    }
    persist(subject, 0, 0);
}

/// Drop in-memory entries whose deadline has passed so the map stays small.
pub fn reap_expired(now_s: i64) -> usize {
    let mut state = STATE.lock().unwrap();
    let before = state.len();
    state.retain(|_, cd| cd.is_cooling(now_s) || cd.last_ms > 0);
    before - state.len()
}

// Store write-through. Failures are logged locally; the in-memory state
// remains authoritative for the current cache epoch.
fn persist(subject: Subject, until_s: i64, last_ms: i64) {
    let write = move || {
        if let Err(e) = store::channels::trip_cooldown(subject, until_s, last_ms) {
            crate::logger::warn(
                "cooldown",
                &format!("Cooldown writeback failed for {}: {}", subject, e),
            );
        }
    };
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(write);
        }
        Err(_) => write(),
    }
}

#[cfg(test)]
pub(crate) fn clear_for_test() {
    STATE.lock().unwrap().clear();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testutil::use_temp_db;

    fn exponential() -> Settings {
        Settings::default()
    }

    fn fixed(interval: u64) -> Settings {
        Settings {
            cooldown_mode: CooldownMode::Fixed,
            cooldown_fixed_interval: interval,
            ..Settings::default()
        }
    }

    #[test]
    fn first_trip_is_one_second() {
        assert_eq!(next_duration_ms(&exponential(), 0), 1_000);
    }

    #[test]
    fn doubling_caps_at_one_hour() {
        let s = exponential();
        assert_eq!(next_duration_ms(&s, 1_000), 2_000);
        assert_eq!(next_duration_ms(&s, 2_000), 4_000);
        assert_eq!(next_duration_ms(&s, 3_000_000), CAP_MS);
        assert_eq!(next_duration_ms(&s, CAP_MS), CAP_MS);
    }

    #[test]
    fn fixed_mode_uses_interval() {
        assert_eq!(next_duration_ms(&fixed(90), 0), 90_000);
        assert_eq!(next_duration_ms(&fixed(90), 500_000), 90_000);
    }

    #[test]
    fn trip_observe_reset() {
        let _db = use_temp_db("cooldown-engine");
        clear_for_test();
        let subject = Subject::Channel(4242);
        let now = 1_000_000;

        assert!(!observe(subject, now, Cooldown::default()));

        let d1 = trip(subject, now, &exponential(), None, 0);
        assert_eq!(d1, 1_000);
        assert!(observe(subject, now, Cooldown::default()));

        // Second trip doubles from the in-memory last duration.
        let d2 = trip(subject, now, &exponential(), None, 0);
        assert_eq!(d2, 2_000);

        reset(subject);
        assert!(!observe(subject, now, Cooldown::default()));

        // After reset the backoff starts over.
        let d3 = trip(subject, now, &exponential(), None, 0);
        assert_eq!(d3, 1_000);
    }

    #[test]
    fn retry_after_overrides_and_clamps() {
        let _db = use_temp_db("cooldown-retry-after");
        clear_for_test();
        let subject = Subject::Key(7);
        let now = 2_000_000;

        let d = trip(subject, now, &exponential(), Some(120), 0);
        assert_eq!(d, 120_000);

        let d = trip(subject, now, &exponential(), Some(86_400), 0);
        assert_eq!(d, CAP_MS);
    }

    #[test]
    fn snapshot_value_used_without_memory_entry() {
        clear_for_test();
        let subject = Subject::Key(99);
        let persisted = Cooldown { until_s: 5_000, last_ms: 4_000 };
        assert!(observe(subject, 4_999, persisted));
        assert!(!observe(subject, 5_000, persisted));
    }
}
