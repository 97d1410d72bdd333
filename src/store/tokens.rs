//! Tenant auth tokens and their channel grants.

use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{AppError, AppResult};

use super::models::{AuthToken, TokenStatSample};
use super::open_conn;

/// SHA-256 hex of a bearer credential.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenInput {
    pub token: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub expires_at: Option<i64>,
    #[serde(default = "default_true")]
    pub all_channels: bool,
    #[serde(default)]
    pub channel_ids: Vec<i64>,
}

fn default_true() -> bool {
    true
}

const TOKEN_COLS: &str = "id, token_hash, description, active, expires_at, all_channels, \
     last_used_at, success_count, failure_count, stream_count, non_stream_count, \
     stream_avg_ttfb_s, non_stream_avg_rt_s, prompt_tokens, completion_tokens, \
     cache_read_tokens, cache_creation_tokens, total_cost_usd";

fn token_from_row(row: &Row<'_>) -> rusqlite::Result<AuthToken> {
    Ok(AuthToken {
        id: row.get(0)?,
        token_hash: row.get(1)?,
        description: row.get(2)?,
        active: row.get::<_, i64>(3)? != 0,
        expires_at: row.get(4)?,
        all_channels: row.get::<_, i64>(5)? != 0,
        last_used_at: row.get(6)?,
        success_count: row.get(7)?,
        failure_count: row.get(8)?,
        stream_count: row.get(9)?,
        non_stream_count: row.get(10)?,
        stream_avg_ttfb_s: row.get(11)?,
        non_stream_avg_rt_s: row.get(12)?,
        prompt_tokens: row.get(13)?,
        completion_tokens: row.get(14)?,
        cache_read_tokens: row.get(15)?,
        cache_creation_tokens: row.get(16)?,
        total_cost_usd: row.get(17)?,
    })
}

pub fn create_token(input: &TokenInput) -> AppResult<i64> {
    if input.token.trim().is_empty() {
        return Err(AppError::BadRequest("Token must not be empty".to_string()));
    }
    let mut conn = open_conn()?;
    let tx = conn.transaction()?;
    tx.execute(
        "INSERT INTO auth_tokens (token_hash, description, active, expires_at, all_channels)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            hash_token(input.token.trim()),
            input.description,
            input.active as i64,
            input.expires_at,
            input.all_channels as i64,
        ],
    )?;
    let id = tx.last_insert_rowid();
    for channel_id in &input.channel_ids {
        tx.execute(
            "INSERT OR IGNORE INTO token_channels (token_id, channel_id) VALUES (?1, ?2)",
            params![id, channel_id],
        )?;
    }
    tx.commit()?;
    super::invalidate();
    Ok(id)
}

pub fn list_tokens() -> AppResult<Vec<AuthToken>> {
    let conn = open_conn()?;
    let mut stmt = conn.prepare(&format!("SELECT {} FROM auth_tokens ORDER BY id", TOKEN_COLS))?;
    let rows = stmt.query_map([], token_from_row)?;
    Ok(rows.collect::<Result<_, _>>()?)
}

pub fn delete_token(id: i64) -> AppResult<()> {
    let conn = open_conn()?;
    let affected = conn.execute("DELETE FROM auth_tokens WHERE id = ?1", params![id])?;
    if affected == 0 {
        return Err(AppError::NotFound(format!("Token {} not found", id)));
    }
    super::invalidate();
    Ok(())
}

/// Look up a token row by the SHA-256 of the presented bearer.
pub fn auth_token_by_hash(hash: &str) -> AppResult<Option<AuthToken>> {
    let conn = open_conn()?;
    let token = conn
        .query_row(
            &format!("SELECT {} FROM auth_tokens WHERE token_hash = ?1", TOKEN_COLS),
            params![hash],
            token_from_row,
        )
        .optional()?;
    Ok(token)
}

/// Channel ids granted to a token; consulted only when `all_channels` is
/// false.
pub fn token_channel_ids(token_id: i64) -> AppResult<Vec<i64>> {
    let conn = open_conn()?;
    let mut stmt =
        conn.prepare("SELECT channel_id FROM token_channels WHERE token_id = ?1 ORDER BY channel_id")?;
    let rows = stmt.query_map(params![token_id], |r| r.get(0))?;
    Ok(rows.collect::<Result<_, _>>()?)
}

/// Apply one accounting sample to a token's running counters.
///
/// Read-compute-write in a single transaction; the incremental
/// weighted-average formula requires the pre-update counts. The caller (the
/// metrics writer) serializes samples per token.
pub fn update_token_stats(token_id: i64, sample: &TokenStatSample) -> AppResult<()> {
    let mut conn = open_conn()?;
    let tx = conn.transaction()?;

    let current = tx
        .query_row(
            &format!("SELECT {} FROM auth_tokens WHERE id = ?1", TOKEN_COLS),
            params![token_id],
            token_from_row,
        )
        .optional()?
        .ok_or_else(|| AppError::NotFound(format!("Token {} not found", token_id)))?;

    let (success_count, failure_count) = if sample.success {
        (current.success_count + 1, current.failure_count)
    } else {
        (current.success_count, current.failure_count + 1)
    };

    let mut stream_count = current.stream_count;
    let mut non_stream_count = current.non_stream_count;
    let mut stream_avg = current.stream_avg_ttfb_s;
    let mut non_stream_avg = current.non_stream_avg_rt_s;

    if sample.streaming {
        let sample_ttfb = sample.first_byte_s.unwrap_or(sample.duration_s);
        stream_avg =
            (stream_avg * stream_count as f64 + sample_ttfb) / (stream_count as f64 + 1.0);
        stream_count += 1;
    } else {
        non_stream_avg = (non_stream_avg * non_stream_count as f64 + sample.duration_s)
            / (non_stream_count as f64 + 1.0);
        non_stream_count += 1;
    }

    tx.execute(
        "UPDATE auth_tokens SET
            success_count = ?2, failure_count = ?3,
            stream_count = ?4, non_stream_count = ?5,
            stream_avg_ttfb_s = ?6, non_stream_avg_rt_s = ?7,
            prompt_tokens = prompt_tokens + ?8,
            completion_tokens = completion_tokens + ?9,
            cache_read_tokens = cache_read_tokens + ?10,
            cache_creation_tokens = cache_creation_tokens + ?11,
            total_cost_usd = total_cost_usd + ?12,
            last_used_at = ?13
         WHERE id = ?1",
        params![
            token_id,
            success_count,
            failure_count,
            stream_count,
            non_stream_count,
            stream_avg,
            non_stream_avg,
            sample.input_tokens,
            sample.output_tokens,
            sample.cache_read_tokens,
            sample.cache_creation_tokens,
            sample.cost_usd,
            crate::clock::epoch_s(),
        ],
    )?;
    tx.commit()?;
    Ok(())
}
