//! Background control loops.
//!
//! Independent long-lived tasks: routing-cache refresher, endpoint prober,
//! daily aggregator, and the cooldown/endpoint reaper. All react to the
//! shutdown signal within one iteration.

pub mod aggregator;
pub mod prober;

use std::time::Duration;

const REAPER_INTERVAL: Duration = Duration::from_secs(60);

/// Build the routing cache before the listener accepts requests.
pub fn warm_cache() -> crate::error::AppResult<()> {
    crate::store::channels::ensure_single_active_endpoints()?;
    crate::cache::refresh()
}

/// Spawn every control loop.
pub fn spawn_all(shutdown: tokio::sync::watch::Receiver<bool>) {
    tokio::spawn(crate::cache::run_refresher(shutdown.clone()));
    tokio::spawn(prober::run(shutdown.clone()));
    tokio::spawn(aggregator::run(shutdown.clone()));
    tokio::spawn(run_reaper(shutdown));
    crate::logger::info("tasks", "Control loops started");
}

/// Periodic sweep: clear expired cooldown deadlines (memory and store) and
/// repair the one-active-endpoint invariant.
async fn run_reaper(mut shutdown: tokio::sync::watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(REAPER_INTERVAL) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }

        let now_s = crate::clock::epoch_s();
        crate::cooldown::reap_expired(now_s);
        if let Err(e) = crate::store::channels::reap_expired_cooldowns(now_s) {
            crate::logger::warn("reaper", &format!("Cooldown sweep failed: {}", e));
        }
        if let Err(e) = crate::store::channels::ensure_single_active_endpoints() {
            crate::logger::warn("reaper", &format!("Endpoint repair failed: {}", e));
        }
    }
}
