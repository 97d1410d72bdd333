//! Model store.
//!
//! All SQL lives under this module. Connections are opened per call against
//! a WAL database; the dispatch path reads through the routing cache, so the
//! store only sees admin traffic, cooldown write-through, and the batched
//! metrics writer.

pub mod channels;
pub mod models;
pub mod stats;
pub mod tokens;

use once_cell::sync::Lazy;
use rusqlite::Connection;
use std::collections::HashMap;
use tokio::sync::watch;

use crate::error::AppResult;

pub use models::*;

// Invalidation epoch bumped on every routing-relevant write.
static INVALIDATE: Lazy<(watch::Sender<u64>, watch::Receiver<u64>)> =
    Lazy::new(|| watch::channel(0));

pub(crate) fn open_conn() -> AppResult<Connection> {
    let conn = Connection::open(crate::config::db_path())?;
    conn.pragma_update(None, "journal_mode", "WAL").ok();
    conn.pragma_update(None, "synchronous", "NORMAL").ok();
    conn.pragma_update(None, "foreign_keys", "ON").ok();
    conn.pragma_update(None, "busy_timeout", "5000").ok();
    Ok(conn)
}

/// Create tables and indexes. Idempotent; called once at startup before the
/// cache warmer runs.
pub fn init() -> AppResult<()> {
    let conn = open_conn()?;
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS channels (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            channel_type TEXT NOT NULL,
            url TEXT NOT NULL DEFAULT '',
            priority INTEGER NOT NULL DEFAULT 0,
            sort_order INTEGER NOT NULL DEFAULT 0,
            model_redirects TEXT NOT NULL DEFAULT '{}',
            enabled INTEGER NOT NULL DEFAULT 1,
            preset TEXT NOT NULL DEFAULT '',
            openai_compat INTEGER NOT NULL DEFAULT 0,
            auto_select_endpoint INTEGER NOT NULL DEFAULT 0,
            quota_config TEXT,
            cooldown_until INTEGER NOT NULL DEFAULT 0,
            cooldown_last_ms INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL DEFAULT 0
        );
        CREATE TABLE IF NOT EXISTS channel_models (
            channel_id INTEGER NOT NULL REFERENCES channels(id) ON DELETE CASCADE,
            model TEXT NOT NULL,
            PRIMARY KEY (channel_id, model)
        );
        CREATE TABLE IF NOT EXISTS api_keys (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            channel_id INTEGER NOT NULL REFERENCES channels(id) ON DELETE CASCADE,
            key_index INTEGER NOT NULL DEFAULT 0,
            credential TEXT NOT NULL,
            strategy TEXT NOT NULL DEFAULT 'sequential',
            cooldown_until INTEGER NOT NULL DEFAULT 0,
            cooldown_last_ms INTEGER NOT NULL DEFAULT 0,
            access_token TEXT,
            id_token TEXT,
            refresh_token TEXT,
            expires_at INTEGER,
            device_fingerprint TEXT
        );
        CREATE TABLE IF NOT EXISTS channel_endpoints (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            channel_id INTEGER NOT NULL REFERENCES channels(id) ON DELETE CASCADE,
            url TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 0,
            latency_ms INTEGER,
            last_status INTEGER,
            last_test_at INTEGER NOT NULL DEFAULT 0,
            sort_order INTEGER NOT NULL DEFAULT 0
        );
        CREATE TABLE IF NOT EXISTS auth_tokens (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            token_hash TEXT NOT NULL UNIQUE,
            description TEXT NOT NULL DEFAULT '',
            active INTEGER NOT NULL DEFAULT 1,
            expires_at INTEGER,
            all_channels INTEGER NOT NULL DEFAULT 1,
            last_used_at INTEGER NOT NULL DEFAULT 0,
            success_count INTEGER NOT NULL DEFAULT 0,
            failure_count INTEGER NOT NULL DEFAULT 0,
            stream_count INTEGER NOT NULL DEFAULT 0,
            non_stream_count INTEGER NOT NULL DEFAULT 0,
            stream_avg_ttfb_s REAL NOT NULL DEFAULT 0,
            non_stream_avg_rt_s REAL NOT NULL DEFAULT 0,
            prompt_tokens INTEGER NOT NULL DEFAULT 0,
            completion_tokens INTEGER NOT NULL DEFAULT 0,
            cache_read_tokens INTEGER NOT NULL DEFAULT 0,
            cache_creation_tokens INTEGER NOT NULL DEFAULT 0,
            total_cost_usd REAL NOT NULL DEFAULT 0
        );
        CREATE TABLE IF NOT EXISTS token_channels (
            token_id INTEGER NOT NULL REFERENCES auth_tokens(id) ON DELETE CASCADE,
            channel_id INTEGER NOT NULL REFERENCES channels(id) ON DELETE CASCADE,
            PRIMARY KEY (token_id, channel_id)
        );
        CREATE TABLE IF NOT EXISTS logs (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            ts_ms INTEGER NOT NULL,
            model TEXT NOT NULL,
            channel_id INTEGER NOT NULL,
            status INTEGER NOT NULL,
            duration_s REAL NOT NULL,
            streaming INTEGER NOT NULL DEFAULT 0,
            first_byte_s REAL,
            key_excerpt TEXT NOT NULL DEFAULT '',
            api_base_url TEXT NOT NULL DEFAULT '',
            auth_token_id INTEGER NOT NULL,
            client_ip TEXT NOT NULL DEFAULT '',
            input_tokens INTEGER NOT NULL DEFAULT 0,
            output_tokens INTEGER NOT NULL DEFAULT 0,
            cache_read_tokens INTEGER NOT NULL DEFAULT 0,
            cache_creation_tokens INTEGER NOT NULL DEFAULT 0,
            cost_usd REAL NOT NULL DEFAULT 0,
            message TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_logs_ts ON logs(ts_ms DESC);
        CREATE INDEX IF NOT EXISTS idx_logs_channel_ts ON logs(channel_id, ts_ms DESC);
        CREATE TABLE IF NOT EXISTS daily_stats (
            date TEXT NOT NULL,
            channel_id INTEGER NOT NULL,
            model TEXT NOT NULL,
            auth_token_id INTEGER NOT NULL,
            request_count INTEGER NOT NULL DEFAULT 0,
            success_count INTEGER NOT NULL DEFAULT 0,
            input_tokens INTEGER NOT NULL DEFAULT 0,
            output_tokens INTEGER NOT NULL DEFAULT 0,
            cache_read_tokens INTEGER NOT NULL DEFAULT 0,
            cache_creation_tokens INTEGER NOT NULL DEFAULT 0,
            cost_usd REAL NOT NULL DEFAULT 0,
            avg_duration_s REAL NOT NULL DEFAULT 0,
            stream_count INTEGER NOT NULL DEFAULT 0,
            non_stream_count INTEGER NOT NULL DEFAULT 0,
            PRIMARY KEY (date, channel_id, model, auth_token_id)
        );
        CREATE TABLE IF NOT EXISTS system_settings (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );",
    )?;
    Ok(())
}

/// Bump the invalidation epoch; the cache refresher rebuilds on the next
/// notification.
pub fn invalidate() {
    let sender = &INVALIDATE.0;
    let next = *sender.borrow() + 1;
    let _ = sender.send(next);
}

/// Subscribe to invalidation notifications.
pub fn watch_invalidate() -> watch::Receiver<u64> {
    INVALIDATE.1.clone()
}

/// All system settings rows as raw key/value pairs.
pub fn settings_pairs() -> AppResult<HashMap<String, String>> {
    let conn = open_conn()?;
    let mut stmt = conn.prepare("SELECT key, value FROM system_settings")?;
    let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?;
    let mut pairs = HashMap::new();
    for row in rows {
        let (k, v) = row?;
        pairs.insert(k, v);
    }
    Ok(pairs)
}

/// Replace system settings with the given pairs and invalidate caches.
pub fn put_settings(pairs: &HashMap<String, String>) -> AppResult<()> {
    let mut conn = open_conn()?;
    let tx = conn.transaction()?;
    for (k, v) in pairs {
        tx.execute(
            "INSERT INTO system_settings (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            rusqlite::params![k, v],
        )?;
    }
    tx.commit()?;
    crate::config::invalidate_settings_cache();
    invalidate();
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalidate_bumps_epoch() {
        let rx = watch_invalidate();
        let before = *rx.borrow();
        invalidate();
        let after = *watch_invalidate().borrow();
        assert!(after > before);
    }
}
