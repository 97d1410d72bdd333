//! Global logger.
//!
//! Source-tagged log records go to stderr immediately and are persisted to
//! the `global_logs` SQLite table by a background batch writer (flush on
//! 100 rows or 1 s). Logging must never block or fail the request path.

use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{mpsc, Once, RwLock};
use std::time::{Duration, Instant};

static INIT: Once = Once::new();

// Log message for batching
#[derive(Debug, Clone)]
struct LogMessage {
    timestamp: i64,
    level: String,
    source: String,
    message: String,
}

// Async log channel sender
static LOG_SENDER: RwLock<Option<mpsc::Sender<LogMessage>>> = RwLock::new(None);

// Minimum level written; records below it are dropped at the call site.
static MIN_LEVEL: AtomicU8 = AtomicU8::new(0);

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "debug" => Some(LogLevel::Debug),
            "info" => Some(LogLevel::Info),
            "warn" => Some(LogLevel::Warn),
            "error" => Some(LogLevel::Error),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            LogLevel::Debug => 0,
            LogLevel::Info => 1,
            LogLevel::Warn => 2,
            LogLevel::Error => 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub id: i64,
    pub timestamp: i64,
    pub level: LogLevel,
    pub source: String,
    pub message: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct LogQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub level: Option<LogLevel>,
    pub source: Option<String>,
}

fn open_conn() -> Option<Connection> {
    Connection::open(crate::config::db_path()).ok()
}

/// Initialize the log table and spawn the batch writer.
pub fn init(min_level: LogLevel) {
    MIN_LEVEL.store(min_level.rank(), Ordering::Relaxed);
    INIT.call_once(|| {
        if let Some(conn) = open_conn() {
            let _ = conn.execute(
                "CREATE TABLE IF NOT EXISTS global_logs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    timestamp INTEGER NOT NULL,
                    level TEXT NOT NULL,
                    source TEXT NOT NULL,
                    message TEXT NOT NULL
                )",
                [],
            );
            let _ = conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_global_logs_timestamp ON global_logs(timestamp DESC)",
                [],
            );
        }
        spawn_batch_writer();
    });
}

fn spawn_batch_writer() {
    let (tx, rx) = mpsc::channel::<LogMessage>();

    {
        let mut sender = LOG_SENDER.write().unwrap();
        *sender = Some(tx);
    }

    std::thread::spawn(move || {
        let mut buffer = Vec::with_capacity(100);
        let mut last_flush = Instant::now();
        let flush_interval = Duration::from_secs(1);

        loop {
            let timeout = flush_interval
                .checked_sub(last_flush.elapsed())
                .unwrap_or_else(|| Duration::from_secs(0));

            match rx.recv_timeout(timeout) {
                Ok(msg) => {
                    buffer.push(msg);
                    if buffer.len() >= 100 || last_flush.elapsed() >= flush_interval {
                        flush_logs(&mut buffer);
                        last_flush = Instant::now();
                    }
                }
                Err(mpsc::RecvTimeoutError::Timeout) => {
                    if !buffer.is_empty() {
                        flush_logs(&mut buffer);
                    }
                    last_flush = Instant::now();
                }
                Err(mpsc::RecvTimeoutError::Disconnected) => {
                    break;
                }
            }
        }

        if !buffer.is_empty() {
            flush_logs(&mut buffer);
        }
    });
}

fn flush_logs(buffer: &mut Vec<LogMessage>) {
    if buffer.is_empty() {
        return;
    }

    let Some(mut conn) = open_conn() else {
        buffer.clear();
        return;
    };
    let Ok(tx) = conn.transaction() else {
        buffer.clear();
        return;
    };

    for msg in buffer.drain(..) {
        let _ = tx.execute(
            "INSERT INTO global_logs (timestamp, level, source, message) VALUES (?1, ?2, ?3, ?4)",
            params![msg.timestamp, msg.level, msg.source, msg.message],
        );
    }

    let _ = tx.commit();
}

fn log_internal(level: LogLevel, source: &str, message: &str) {
    if level.rank() < MIN_LEVEL.load(Ordering::Relaxed) {
        return;
    }

    eprintln!("[{}] {}: {}", level.as_str(), source, message);

    let msg = LogMessage {
        timestamp: crate::clock::epoch_s(),
        level: level.as_str().to_string(),
        source: source.to_string(),
        message: message.to_string(),
    };

    if let Ok(guard) = LOG_SENDER.read() {
        if let Some(sender) = guard.as_ref() {
            let _ = sender.send(msg);
        }
    }
}

pub fn debug(source: &str, message: &str) {
    log_internal(LogLevel::Debug, source, message);
}

pub fn info(source: &str, message: &str) {
    log_internal(LogLevel::Info, source, message);
}

pub fn warn(source: &str, message: &str) {
    log_internal(LogLevel::Warn, source, message);
}

pub fn error(source: &str, message: &str) {
    log_internal(LogLevel::Error, source, message);
}

/// Query persisted log entries, newest first.
pub fn query_logs(query: &LogQuery) -> Vec<LogEntry> {
    let Some(conn) = open_conn() else {
        return Vec::new();
    };
    let mut sql =
        String::from("SELECT id, timestamp, level, source, message FROM global_logs WHERE 1=1");
    let mut params_vec: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

    if let Some(ref level) = query.level {
        sql.push_str(" AND level = ?");
        params_vec.push(Box::new(level.as_str().to_string()));
    }
    if let Some(ref source) = query.source {
        sql.push_str(" AND source = ?");
        params_vec.push(Box::new(source.clone()));
    }

    sql.push_str(" ORDER BY timestamp DESC");

    let limit = query.limit.unwrap_or(100);
    let offset = query.offset.unwrap_or(0);
    sql.push_str(&format!(" LIMIT {} OFFSET {}", limit, offset));

    let Ok(mut stmt) = conn.prepare(&sql) else {
        return Vec::new();
    };
    let params_refs: Vec<&dyn rusqlite::ToSql> = params_vec.iter().map(|p| p.as_ref()).collect();

    let rows = stmt.query_map(params_refs.as_slice(), |row| {
        let level_str: String = row.get(2)?;
        Ok(LogEntry {
            id: row.get(0)?,
            timestamp: row.get(1)?,
            level: LogLevel::from_str(&level_str).unwrap_or(LogLevel::Info),
            source: row.get(3)?,
            message: row.get(4)?,
        })
    });

    match rows {
        Ok(rows) => rows.filter_map(|r| r.ok()).collect(),
        Err(_) => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn level_roundtrip() {
        for level in [LogLevel::Debug, LogLevel::Info, LogLevel::Warn, LogLevel::Error] {
            assert_eq!(LogLevel::from_str(level.as_str()), Some(level));
        }
        assert_eq!(LogLevel::from_str("trace"), None);
    }

    #[test]
    fn level_ordering() {
        assert!(LogLevel::Debug.rank() < LogLevel::Info.rank());
        assert!(LogLevel::Warn.rank() < LogLevel::Error.rank());
    }
}
