//! Daily stats aggregator and retention reaper.

use std::time::Duration;

use crate::config;
use crate::store::stats;

const CHECK_INTERVAL: Duration = Duration::from_secs(3600);

/// Aggregate one date and apply retention. Idempotent per date.
pub fn run_once(date: &str) {
    match stats::aggregate_daily(date) {
        Ok(rows) => {
            crate::logger::info(
                "aggregator",
                &format!("Aggregated {} daily-stat rows for {}", rows, date),
            );
        }
        Err(e) => {
            crate::logger::warn("aggregator", &format!("Aggregation for {} failed: {}", date, e));
        }
    }

    let settings = config::settings();
    if settings.log_retention_days >= 0 {
        let cutoff_ms =
            crate::clock::epoch_ms() - settings.log_retention_days * 86_400_000;
        match stats::prune_logs(cutoff_ms) {
            Ok(removed) if removed > 0 => {
                crate::logger::info("aggregator", &format!("Pruned {} log rows", removed));
            }
            Ok(_) => {}
            Err(e) => crate::logger::warn("aggregator", &format!("Log prune failed: {}", e)),
        }
    }
    if settings.stats_retention_days >= 0 {
        let cutoff_date = crate::clock::local_date_days_ago(settings.stats_retention_days);
        match stats::prune_daily_stats(&cutoff_date) {
            Ok(removed) if removed > 0 => {
                crate::logger::info("aggregator", &format!("Pruned {} daily-stat rows", removed));
            }
            Ok(_) => {}
            Err(e) => crate::logger::warn("aggregator", &format!("Stats prune failed: {}", e)),
        }
    }
}

/// Long-lived aggregator: once per day, after local midnight, rebuild the
/// prior day's rollups and prune expired rows. Startup catches up
/// immediately.
pub async fn run(mut shutdown: tokio::sync::watch::Receiver<bool>) {
    let mut last_aggregated = String::new();

    loop {
        let yesterday = crate::clock::local_date_days_ago(1);
        if yesterday != last_aggregated {
            run_once(&yesterday);
            last_aggregated = yesterday;
        }

        tokio::select! {
            _ = tokio::time::sleep(CHECK_INTERVAL) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}
