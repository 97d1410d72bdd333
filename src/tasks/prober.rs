//! Endpoint prober.
//!
//! Periodically measures per-endpoint latency for channels with automatic
//! endpoint selection and activates the fastest one, mirroring its URL onto
//! the channel.

use std::time::{Duration, Instant};

use crate::cache;
use crate::store::ChannelEndpoint;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct LatencyStat {
    pub endpoint_id: i64,
    pub url: String,
    pub ok: bool,
    pub avg_ms: Option<i64>,
    pub last_status: Option<i64>,
}

/// Probe one endpoint `test_count` times and average the successful
/// attempts.
pub async fn measure_endpoint(endpoint: &ChannelEndpoint, test_count: u32) -> LatencyStat {
    let client = crate::relay::client::default_client();
    let mut total_ms: u128 = 0;
    let mut ok_count = 0u32;
    let mut last_status = None;

    for _ in 0..test_count.max(1) {
        let start = Instant::now();
        match client
            .head(&endpoint.url)
            .timeout(PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) => {
                total_ms += start.elapsed().as_millis();
                ok_count += 1;
                last_status = Some(resp.status().as_u16() as i64);
            }
            Err(e) => {
                last_status = e.status().map(|s| s.as_u16() as i64);
            }
        }
    }

    LatencyStat {
        endpoint_id: endpoint.id,
        url: endpoint.url.clone(),
        ok: ok_count > 0,
        avg_ms: (ok_count > 0).then(|| (total_ms / ok_count as u128) as i64),
        last_status,
    }
}

/// Pick the fastest reachable endpoint from a probe round.
pub fn select_fastest(stats: &[LatencyStat]) -> Option<i64> {
    stats
        .iter()
        .filter(|s| s.ok)
        .filter_map(|s| s.avg_ms.map(|ms| (s.endpoint_id, ms)))
        .min_by_key(|&(_, ms)| ms)
        .map(|(id, _)| id)
}

/// Probe all endpoints of one channel, persist the measurements, and switch
/// the active endpoint if a faster one answered.
pub async fn probe_channel(channel_id: i64, test_count: u32) {
    let endpoints = match crate::store::channels::list_endpoints(channel_id) {
        Ok(endpoints) => endpoints,
        Err(e) => {
            crate::logger::warn("prober", &format!("Listing endpoints failed: {}", e));
            return;
        }
    };
    if endpoints.len() < 2 {
        return;
    }

    let mut stats = Vec::with_capacity(endpoints.len());
    for endpoint in &endpoints {
        let stat = measure_endpoint(endpoint, test_count).await;
        if let Err(e) = crate::store::channels::update_endpoint_latency(
            stat.endpoint_id,
            stat.avg_ms,
            stat.last_status,
        ) {
            crate::logger::warn("prober", &format!("Storing latency failed: {}", e));
        }
        stats.push(stat);
    }

    let Some(best_id) = select_fastest(&stats) else {
        crate::logger::warn(
            "prober",
            &format!("Channel {} has no reachable endpoint", channel_id),
        );
        return;
    };

    let currently_active = endpoints.iter().find(|e| e.is_active).map(|e| e.id);
    if currently_active != Some(best_id) {
        match crate::store::channels::set_active_endpoint(channel_id, best_id) {
            Ok(()) => crate::logger::info(
                "prober",
                &format!("Channel {} switched active endpoint to {}", channel_id, best_id),
            ),
            Err(e) => crate::logger::warn("prober", &format!("Endpoint switch failed: {}", e)),
        }
    }
}

/// Long-lived prober loop; interval and probe count are re-read each round
/// so setting changes apply without restart. Interval 0 disables probing.
pub async fn run(mut shutdown: tokio::sync::watch::Receiver<bool>) {
    loop {
        let settings = crate::config::settings();
        let interval = if settings.auto_test_endpoints_interval == 0 {
            // Disabled; re-check the setting once a minute.
            Duration::from_secs(60)
        } else {
            Duration::from_secs(settings.auto_test_endpoints_interval)
        };

        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }

        if settings.auto_test_endpoints_interval == 0 {
            continue;
        }

        let snapshot = cache::snapshot();
        let targets: Vec<i64> = snapshot
            .enumerate_enabled()
            .filter(|ch| ch.channel.auto_select_endpoint && ch.endpoints.len() > 1)
            .map(|ch| ch.channel.id)
            .collect();

        for channel_id in targets {
            probe_channel(channel_id, settings.endpoint_test_count).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stat(id: i64, ok: bool, avg_ms: Option<i64>) -> LatencyStat {
        LatencyStat {
            endpoint_id: id,
            url: format!("https://e{}.example.com", id),
            ok,
            avg_ms,
            last_status: ok.then_some(200),
        }
    }

    #[test]
    fn fastest_endpoint_wins() {
        let stats = vec![stat(1, true, Some(200)), stat(2, true, Some(80)), stat(3, true, Some(150))];
        assert_eq!(select_fastest(&stats), Some(2));
    }

    #[test]
    fn unreachable_endpoints_are_ignored() {
        let stats = vec![stat(1, false, None), stat(2, true, Some(300))];
        assert_eq!(select_fastest(&stats), Some(2));

        let stats = vec![stat(1, false, None), stat(2, false, None)];
        assert_eq!(select_fastest(&stats), None);
    }
}
