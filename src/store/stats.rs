//! Request logs, daily rollups, and retention.

use rusqlite::{params, Row};

use crate::error::AppResult;

use super::models::{DailyStat, LogRow};
use super::open_conn;

pub fn append_log(row: &LogRow) -> AppResult<()> {
    let conn = open_conn()?;
    conn.execute(
        "INSERT INTO logs (ts_ms, model, channel_id, status, duration_s, streaming,
            first_byte_s, key_excerpt, api_base_url, auth_token_id, client_ip,
            input_tokens, output_tokens, cache_read_tokens, cache_creation_tokens,
            cost_usd, message)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        params![
            row.ts_ms,
            row.model,
            row.channel_id,
            row.status,
            row.duration_s,
            row.streaming as i64,
            row.first_byte_s,
            row.key_excerpt,
            row.api_base_url,
            row.auth_token_id,
            row.client_ip,
            row.input_tokens,
            row.output_tokens,
            row.cache_read_tokens,
            row.cache_creation_tokens,
            row.cost_usd,
            row.message,
        ],
    )?;
    Ok(())
}

fn log_from_row(row: &Row<'_>) -> rusqlite::Result<LogRow> {
    Ok(LogRow {
        ts_ms: row.get(0)?,
        model: row.get(1)?,
        channel_id: row.get(2)?,
        status: row.get(3)?,
        duration_s: row.get(4)?,
        streaming: row.get::<_, i64>(5)? != 0,
        first_byte_s: row.get(6)?,
        key_excerpt: row.get(7)?,
        api_base_url: row.get(8)?,
        auth_token_id: row.get(9)?,
        client_ip: row.get(10)?,
        input_tokens: row.get(11)?,
        output_tokens: row.get(12)?,
        cache_read_tokens: row.get(13)?,
        cache_creation_tokens: row.get(14)?,
        cost_usd: row.get(15)?,
        message: row.get(16)?,
    })
}

pub fn recent_logs(limit: i64, offset: i64) -> AppResult<Vec<LogRow>> {
    let conn = open_conn()?;
    let mut stmt = conn.prepare(
        "SELECT ts_ms, model, channel_id, status, duration_s, streaming, first_byte_s,
            key_excerpt, api_base_url, auth_token_id, client_ip, input_tokens, output_tokens,
            cache_read_tokens, cache_creation_tokens, cost_usd, message
         FROM logs ORDER BY ts_ms DESC LIMIT ?1 OFFSET ?2",
    )?;
    let rows = stmt.query_map(params![limit, offset], log_from_row)?;
    Ok(rows.collect::<Result<_, _>>()?)
}

/// Rebuild daily stats for one local date (`YYYY-MM-DD`).
///
/// Delete-then-insert: running the aggregation twice for the same date
/// produces identical rows.
pub fn aggregate_daily(date: &str) -> AppResult<usize> {
    let mut conn = open_conn()?;
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM daily_stats WHERE date = ?1", params![date])?;
    let inserted = tx.execute(
        "INSERT INTO daily_stats (date, channel_id, model, auth_token_id,
            request_count, success_count, input_tokens, output_tokens,
            cache_read_tokens, cache_creation_tokens, cost_usd, avg_duration_s,
            stream_count, non_stream_count)
         SELECT ?1, channel_id, model, auth_token_id,
            COUNT(*),
            SUM(CASE WHEN status >= 200 AND status < 300 THEN 1 ELSE 0 END),
            SUM(input_tokens), SUM(output_tokens),
            SUM(cache_read_tokens), SUM(cache_creation_tokens),
            SUM(cost_usd), AVG(duration_s),
            SUM(streaming), SUM(1 - streaming)
         FROM logs
         WHERE date(ts_ms / 1000, 'unixepoch', 'localtime') = ?1
         GROUP BY channel_id, model, auth_token_id",
        params![date],
    )?;
    tx.commit()?;
    Ok(inserted)
}

pub fn list_daily_stats(date: &str) -> AppResult<Vec<DailyStat>> {
    let conn = open_conn()?;
    let mut stmt = conn.prepare(
        "SELECT date, channel_id, model, auth_token_id, request_count, success_count,
            input_tokens, output_tokens, cache_read_tokens, cache_creation_tokens,
            cost_usd, avg_duration_s, stream_count, non_stream_count
         FROM daily_stats WHERE date = ?1
         ORDER BY channel_id, model, auth_token_id",
    )?;
    let rows = stmt.query_map(params![date], |row| {
        Ok(DailyStat {
            date: row.get(0)?,
            channel_id: row.get(1)?,
            model: row.get(2)?,
            auth_token_id: row.get(3)?,
            request_count: row.get(4)?,
            success_count: row.get(5)?,
            input_tokens: row.get(6)?,
            output_tokens: row.get(7)?,
            cache_read_tokens: row.get(8)?,
            cache_creation_tokens: row.get(9)?,
            cost_usd: row.get(10)?,
            avg_duration_s: row.get(11)?,
            stream_count: row.get(12)?,
            non_stream_count: row.get(13)?,
        })
    })?;
    Ok(rows.collect::<Result<_, _>>()?)
}

/// Delete log rows older than the cutoff. A negative retention means keep
/// forever; callers skip the prune in that case.
pub fn prune_logs(before_ms: i64) -> AppResult<usize> {
    let conn = open_conn()?;
    Ok(conn.execute("DELETE FROM logs WHERE ts_ms < ?1", params![before_ms])?)
}

pub fn prune_daily_stats(before_date: &str) -> AppResult<usize> {
    let conn = open_conn()?;
    Ok(conn.execute(
        "DELETE FROM daily_stats WHERE date < ?1",
        params![before_date],
    )?)
}

/// Totals over the last `days` days for the admin summary.
pub fn summary_since(days: i64) -> AppResult<(i64, i64, f64)> {
    let conn = open_conn()?;
    let cutoff = crate::clock::epoch_ms() - days * 86_400_000;
    let mut stmt = conn.prepare(
        "SELECT COUNT(*), IFNULL(SUM(input_tokens + output_tokens), 0), IFNULL(SUM(cost_usd), 0)
         FROM logs WHERE ts_ms >= ?1",
    )?;
    Ok(stmt.query_row(params![cutoff], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::testutil::use_temp_db;

    fn sample_log(model: &str, channel_id: i64, status: i64, streaming: bool) -> LogRow {
        LogRow {
            ts_ms: crate::clock::epoch_ms(),
            model: model.to_string(),
            channel_id,
            status,
            duration_s: 1.5,
            streaming,
            first_byte_s: streaming.then_some(0.2),
            key_excerpt: "sk-a****0000".to_string(),
            api_base_url: "https://api.example.com".to_string(),
            auth_token_id: 1,
            client_ip: "127.0.0.1".to_string(),
            input_tokens: 100,
            output_tokens: 40,
            cache_read_tokens: 0,
            cache_creation_tokens: 0,
            cost_usd: 0.001,
            message: None,
        }
    }

    #[test]
    fn append_and_read_back() {
        let _db = use_temp_db("logs");
        append_log(&sample_log("m1", 1, 200, true)).unwrap();
        append_log(&sample_log("m1", 2, 502, false)).unwrap();

        let logs = recent_logs(10, 0).unwrap();
        assert_eq!(logs.len(), 2);
        assert!(logs.iter().any(|l| l.channel_id == 2 && l.status == 502));
    }

    #[test]
    fn aggregation_is_idempotent() {
        let _db = use_temp_db("daily");
        append_log(&sample_log("m1", 1, 200, true)).unwrap();
        append_log(&sample_log("m1", 1, 200, false)).unwrap();
        append_log(&sample_log("m1", 1, 502, false)).unwrap();
        append_log(&sample_log("m2", 1, 200, true)).unwrap();

        let date = crate::clock::today_local();
        aggregate_daily(&date).unwrap();
        let first = list_daily_stats(&date).unwrap();
        aggregate_daily(&date).unwrap();
        let second = list_daily_stats(&date).unwrap();

        assert_eq!(first.len(), 2);
        assert_eq!(first.len(), second.len());
        for (a, b) in first.iter().zip(second.iter()) {
            assert_eq!(a.model, b.model);
            assert_eq!(a.request_count, b.request_count);
            assert_eq!(a.success_count, b.success_count);
            assert_eq!(a.stream_count, b.stream_count);
            assert!((a.cost_usd - b.cost_usd).abs() < 1e-12);
        }

        let m1 = first.iter().find(|s| s.model == "m1").unwrap();
        assert_eq!(m1.request_count, 3);
        assert_eq!(m1.success_count, 2);
        assert_eq!(m1.stream_count, 1);
        assert_eq!(m1.non_stream_count, 2);
    }

    #[test]
    fn retention_prunes_old_rows() {
        let _db = use_temp_db("retention");
        let mut old = sample_log("m1", 1, 200, false);
        old.ts_ms = 1_000;
        append_log(&old).unwrap();
        append_log(&sample_log("m1", 1, 200, false)).unwrap();

        let removed = prune_logs(crate::clock::epoch_ms() - 60_000).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(recent_logs(10, 0).unwrap().len(), 1);
    }
}
