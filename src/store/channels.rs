//! Channel, key, and endpoint persistence.

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{AppError, AppResult};

use super::models::{
    ApiKey, Channel, ChannelEndpoint, ChannelType, Cooldown, KeyStrategy, Preset, Subject,
};
use super::open_conn;

/// Admin payload for creating/updating a channel with embedded keys and
/// endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelInput {
    pub name: String,
    pub channel_type: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub sort_order: i64,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(default)]
    pub model_redirects: HashMap<String, String>,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub preset: String,
    #[serde(default)]
    pub openai_compat: bool,
    #[serde(default)]
    pub auto_select_endpoint: bool,
    #[serde(default)]
    pub quota_config: Option<String>,
    #[serde(default)]
    pub keys: Vec<KeyInput>,
    #[serde(default)]
    pub endpoints: Vec<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyInput {
    pub credential: String,
    #[serde(default)]
    pub strategy: KeyStrategy,
}

fn channel_from_row(row: &Row<'_>) -> rusqlite::Result<Channel> {
    let type_raw: String = row.get(2)?;
    let redirects_raw: String = row.get(6)?;
    let preset_raw: String = row.get(8)?;
    Ok(Channel {
        id: row.get(0)?,
        name: row.get(1)?,
        channel_type: ChannelType::from_str(&type_raw).unwrap_or(ChannelType::Openai),
        url: row.get(3)?,
        priority: row.get(4)?,
        sort_order: row.get(5)?,
        models: Vec::new(),
        model_redirects: serde_json::from_str(&redirects_raw).unwrap_or_default(),
        enabled: row.get::<_, i64>(7)? != 0,
        preset: Preset::from_str(&preset_raw),
        openai_compat: row.get::<_, i64>(9)? != 0,
        auto_select_endpoint: row.get::<_, i64>(10)? != 0,
        quota_config: row.get(11)?,
        cooldown: Cooldown {
            until_s: row.get(12)?,
            last_ms: row.get(13)?,
        },
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
    })
}

const CHANNEL_COLS: &str = "id, name, channel_type, url, priority, sort_order, model_redirects, \
     enabled, preset, openai_compat, auto_select_endpoint, quota_config, \
     cooldown_until, cooldown_last_ms, created_at, updated_at";

fn load_models(conn: &Connection, channel_id: i64) -> AppResult<Vec<String>> {
    let mut stmt =
        conn.prepare("SELECT model FROM channel_models WHERE channel_id = ?1 ORDER BY model")?;
    let rows = stmt.query_map(params![channel_id], |r| r.get::<_, String>(0))?;
    Ok(rows.filter_map(|r| r.ok()).collect())
}

pub fn list_channels() -> AppResult<Vec<Channel>> {
    let conn = open_conn()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM channels ORDER BY priority DESC, sort_order, id",
        CHANNEL_COLS
    ))?;
    let rows = stmt.query_map([], channel_from_row)?;
    let mut channels: Vec<Channel> = rows.collect::<Result<_, _>>()?;
    for ch in &mut channels {
        ch.models = load_models(&conn, ch.id)?;
    }
    Ok(channels)
}

pub fn get_channel(id: i64) -> AppResult<Channel> {
    let conn = open_conn()?;
    let mut ch = conn
        .query_row(
            &format!("SELECT {} FROM channels WHERE id = ?1", CHANNEL_COLS),
            params![id],
            channel_from_row,
        )
        .optional()?
        .ok_or_else(|| AppError::NotFound(format!("Channel {} not found", id)))?;
    ch.models = load_models(&conn, id)?;
    Ok(ch)
}

pub fn create_channel(input: &ChannelInput) -> AppResult<i64> {
    let channel_type = ChannelType::from_str(&input.channel_type)
        .ok_or_else(|| AppError::BadRequest(format!("Unknown dialect '{}'", input.channel_type)))?;
    let now = crate::clock::epoch_s();
    let mut conn = open_conn()?;
    let tx = conn.transaction()?;

    tx.execute(
        "INSERT INTO channels (name, channel_type, url, priority, sort_order, model_redirects,
            enabled, preset, openai_compat, auto_select_endpoint, quota_config, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?12)",
        params![
            input.name,
            channel_type.as_str(),
            input.url,
            input.priority,
            input.sort_order,
            serde_json::to_string(&input.model_redirects)?,
            input.enabled as i64,
            Preset::from_str(&input.preset).as_str(),
            input.openai_compat as i64,
            input.auto_select_endpoint as i64,
            input.quota_config,
            now,
        ],
    )?;
    let id = tx.last_insert_rowid();

    write_children(&tx, id, input)?;
    tx.commit()?;
    super::invalidate();
    Ok(id)
}

pub fn update_channel(id: i64, input: &ChannelInput) -> AppResult<()> {
    let channel_type = ChannelType::from_str(&input.channel_type)
        .ok_or_else(|| AppError::BadRequest(format!("Unknown dialect '{}'", input.channel_type)))?;
    let now = crate::clock::epoch_s();
    let mut conn = open_conn()?;
    let tx = conn.transaction()?;

    let affected = tx.execute(
        "UPDATE channels SET name = ?2, channel_type = ?3, url = ?4, priority = ?5,
            sort_order = ?6, model_redirects = ?7, enabled = ?8, preset = ?9,
            openai_compat = ?10, auto_select_endpoint = ?11, quota_config = ?12, updated_at = ?13
         WHERE id = ?1",
        params![
            id,
            input.name,
            channel_type.as_str(),
            input.url,
            input.priority,
            input.sort_order,
            serde_json::to_string(&input.model_redirects)?,
            input.enabled as i64,
            Preset::from_str(&input.preset).as_str(),
            input.openai_compat as i64,
            input.auto_select_endpoint as i64,
            input.quota_config,
            now,
        ],
    )?;
    if affected == 0 {
        return Err(AppError::NotFound(format!("Channel {} not found", id)));
    }

    tx.execute("DELETE FROM channel_models WHERE channel_id = ?1", params![id])?;
    tx.execute("DELETE FROM api_keys WHERE channel_id = ?1", params![id])?;
    tx.execute(
        "DELETE FROM channel_endpoints WHERE channel_id = ?1",
        params![id],
    )?;
    write_children(&tx, id, input)?;
    tx.commit()?;
    super::invalidate();
    Ok(())
}

fn write_children(tx: &Connection, id: i64, input: &ChannelInput) -> AppResult<()> {
    for model in &input.models {
        tx.execute(
            "INSERT OR IGNORE INTO channel_models (channel_id, model) VALUES (?1, ?2)",
            params![id, model],
        )?;
    }
    for (index, key) in input.keys.iter().enumerate() {
        tx.execute(
            "INSERT INTO api_keys (channel_id, key_index, credential, strategy)
             VALUES (?1, ?2, ?3, ?4)",
            params![id, index as i64, key.credential, key.strategy.as_str()],
        )?;
    }
    for (index, url) in input.endpoints.iter().enumerate() {
        tx.execute(
            "INSERT INTO channel_endpoints (channel_id, url, is_active, sort_order)
             VALUES (?1, ?2, ?3, ?4)",
            params![id, url, (index == 0) as i64, index as i64],
        )?;
    }
    // The canonical URL mirrors the active endpoint when endpoints exist.
    if let Some(first) = input.endpoints.first() {
        tx.execute("UPDATE channels SET url = ?2 WHERE id = ?1", params![id, first])?;
    }
    Ok(())
}

pub fn delete_channel(id: i64) -> AppResult<()> {
    let conn = open_conn()?;
    let affected = conn.execute("DELETE FROM channels WHERE id = ?1", params![id])?;
    if affected == 0 {
        return Err(AppError::NotFound(format!("Channel {} not found", id)));
    }
    super::invalidate();
    Ok(())
}

fn key_from_row(row: &Row<'_>) -> rusqlite::Result<ApiKey> {
    let strategy_raw: String = row.get(4)?;
    Ok(ApiKey {
        id: row.get(0)?,
        channel_id: row.get(1)?,
        key_index: row.get(2)?,
        credential: row.get(3)?,
        strategy: KeyStrategy::from_str(&strategy_raw),
        cooldown: Cooldown {
            until_s: row.get(5)?,
            last_ms: row.get(6)?,
        },
        access_token: row.get(7)?,
        id_token: row.get(8)?,
        refresh_token: row.get(9)?,
        expires_at: row.get(10)?,
        device_fingerprint: row.get(11)?,
    })
}

const KEY_COLS: &str = "id, channel_id, key_index, credential, strategy, cooldown_until, \
     cooldown_last_ms, access_token, id_token, refresh_token, expires_at, device_fingerprint";

pub fn list_keys(channel_id: i64) -> AppResult<Vec<ApiKey>> {
    let conn = open_conn()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM api_keys WHERE channel_id = ?1 ORDER BY key_index",
        KEY_COLS
    ))?;
    let rows = stmt.query_map(params![channel_id], key_from_row)?;
    Ok(rows.collect::<Result<_, _>>()?)
}

/// Restore dense 0..N-1 key indexes after a key mutation.
pub fn reindex_keys(channel_id: i64) -> AppResult<()> {
    let mut conn = open_conn()?;
    let tx = conn.transaction()?;
    let ids: Vec<i64> = {
        let mut stmt = tx.prepare(
            "SELECT id FROM api_keys WHERE channel_id = ?1 ORDER BY key_index, id",
        )?;
        let rows = stmt.query_map(params![channel_id], |r| r.get(0))?;
        rows.collect::<Result<_, _>>()?
    };
    for (index, id) in ids.iter().enumerate() {
        tx.execute(
            "UPDATE api_keys SET key_index = ?2 WHERE id = ?1",
            params![id, index as i64],
        )?;
    }
    tx.commit()?;
    super::invalidate();
    Ok(())
}

fn endpoint_from_row(row: &Row<'_>) -> rusqlite::Result<ChannelEndpoint> {
    Ok(ChannelEndpoint {
        id: row.get(0)?,
        channel_id: row.get(1)?,
        url: row.get(2)?,
        is_active: row.get::<_, i64>(3)? != 0,
        latency_ms: row.get(4)?,
        last_status: row.get(5)?,
        last_test_at: row.get(6)?,
        sort_order: row.get(7)?,
    })
}

const ENDPOINT_COLS: &str =
    "id, channel_id, url, is_active, latency_ms, last_status, last_test_at, sort_order";

pub fn list_endpoints(channel_id: i64) -> AppResult<Vec<ChannelEndpoint>> {
    let conn = open_conn()?;
    let mut stmt = conn.prepare(&format!(
        "SELECT {} FROM channel_endpoints WHERE channel_id = ?1 ORDER BY sort_order, id",
        ENDPOINT_COLS
    ))?;
    let rows = stmt.query_map(params![channel_id], endpoint_from_row)?;
    Ok(rows.collect::<Result<_, _>>()?)
}

pub fn update_endpoint_latency(
    endpoint_id: i64,
    latency_ms: Option<i64>,
    status: Option<i64>,
) -> AppResult<()> {
    let conn = open_conn()?;
    conn.execute(
        "UPDATE channel_endpoints SET latency_ms = ?2, last_status = ?3, last_test_at = ?4
         WHERE id = ?1",
        params![endpoint_id, latency_ms, status, crate::clock::epoch_s()],
    )?;
    Ok(())
}

/// Activate one endpoint of a channel and mirror its URL onto the channel.
pub fn set_active_endpoint(channel_id: i64, endpoint_id: i64) -> AppResult<()> {
    let mut conn = open_conn()?;
    let tx = conn.transaction()?;
    let url: String = tx
        .query_row(
            "SELECT url FROM channel_endpoints WHERE id = ?1 AND channel_id = ?2",
            params![endpoint_id, channel_id],
            |r| r.get(0),
        )
        .optional()?
        .ok_or_else(|| AppError::NotFound(format!("Endpoint {} not found", endpoint_id)))?;
    tx.execute(
        "UPDATE channel_endpoints SET is_active = (id = ?2) WHERE channel_id = ?1",
        params![channel_id, endpoint_id],
    )?;
    tx.execute(
        "UPDATE channels SET url = ?2, updated_at = ?3 WHERE id = ?1",
        params![channel_id, url, crate::clock::epoch_s()],
    )?;
    tx.commit()?;
    super::invalidate();
    Ok(())
}

/// Enforce the one-active-endpoint invariant: channels with endpoints but no
/// active one get the first by sort order activated.
pub fn ensure_single_active_endpoints() -> AppResult<()> {
    let conn = open_conn()?;
    let orphaned: Vec<i64> = {
        let mut stmt = conn.prepare(
            "SELECT DISTINCT channel_id FROM channel_endpoints e
             WHERE NOT EXISTS (
                 SELECT 1 FROM channel_endpoints a
                 WHERE a.channel_id = e.channel_id AND a.is_active = 1
             )",
        )?;
        let rows = stmt.query_map([], |r| r.get(0))?;
        rows.collect::<Result<_, _>>()?
    };
    drop(conn);
    for channel_id in orphaned {
        let endpoints = list_endpoints(channel_id)?;
        if let Some(first) = endpoints.first() {
            set_active_endpoint(channel_id, first.id)?;
        }
    }
    Ok(())
}

/// Persist a cooldown trip for a channel or key.
pub fn trip_cooldown(subject: Subject, until_s: i64, last_ms: i64) -> AppResult<()> {
    let conn = open_conn()?;
    match subject {
        Subject::Channel(id) => {
            conn.execute(
                "UPDATE channels SET cooldown_until = ?2, cooldown_last_ms = ?3 WHERE id = ?1",
                params![id, until_s, last_ms],
            )?;
        }
        Subject::Key(id) => {
            conn.execute(
                "UPDATE api_keys SET cooldown_until = ?2, cooldown_last_ms = ?3 WHERE id = ?1",
                params![id, until_s, last_ms],
            )?;
        }
    }
    Ok(())
}

/// Clear a subject's cooldown.
pub fn reset_cooldown(subject: Subject) -> AppResult<()> {
    trip_cooldown(subject, 0, 0)
}

/// Clear persisted deadlines already in the past so cache predicates stay
/// cheap.
pub fn reap_expired_cooldowns(now_s: i64) -> AppResult<usize> {
    let conn = open_conn()?;
    let mut cleared = conn.execute(
        "UPDATE channels SET cooldown_until = 0
         WHERE cooldown_until > 0 AND cooldown_until <= ?1",
        params![now_s],
    )?;
    cleared += conn.execute(
        "UPDATE api_keys SET cooldown_until = 0
         WHERE cooldown_until > 0 AND cooldown_until <= ?1",
        params![now_s],
    )?;
    Ok(cleared)
}

/// Everything the routing cache needs in one pass.
pub fn load_snapshot_rows() -> AppResult<Vec<(Channel, Vec<ApiKey>, Vec<ChannelEndpoint>)>> {
    let channels = list_channels()?;
    let mut out = Vec::with_capacity(channels.len());
    for ch in channels {
        let keys = list_keys(ch.id)?;
        let endpoints = list_endpoints(ch.id)?;
        out.push((ch, keys, endpoints));
    }
    Ok(out)
}
