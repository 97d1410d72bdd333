//! Wall-clock and request-ID helpers.

use uuid::Uuid;

/// Current wall-clock time as unix seconds.
pub fn epoch_s() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Current wall-clock time as unix milliseconds.
pub fn epoch_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Generate a request ID for log correlation.
pub fn request_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Local calendar date as `YYYY-MM-DD`.
pub fn today_local() -> String {
    chrono::Local::now().format("%Y-%m-%d").to_string()
}

/// Local calendar date `days` days before today as `YYYY-MM-DD`.
pub fn local_date_days_ago(days: i64) -> String {
    (chrono::Local::now() - chrono::Duration::days(days))
        .format("%Y-%m-%d")
        .to_string()
}
