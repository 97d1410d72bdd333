//! Model resolution: redirects, exact match, and fuzzy matching.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::HashMap;

static DATE_SUFFIX: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d{8})$").unwrap());
static DIGIT_RUNS: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d+").unwrap());

/// Resolve the model a channel should serve for a requested name.
///
/// Redirects apply first; the redirect target (or, absent a redirect, the
/// requested name) must then match the channel's model list exactly or
/// fuzzily. Returns the effective model, or `None` when the channel cannot
/// serve the request.
pub fn resolve_model(
    models: &[String],
    redirects: &HashMap<String, String>,
    requested: &str,
) -> Option<String> {
    let wanted = redirects.get(requested).map(|s| s.as_str()).unwrap_or(requested);

    if models.iter().any(|m| m == wanted) {
        return Some(wanted.to_string());
    }
    fuzzy_match(models, wanted)
}

/// Case-insensitive substring match; among multiple matches the newest wins.
///
/// Newest is decided by trailing 8-digit date suffix, then by the sequence
/// of integer runs in the name, then lexicographically, all descending.
pub fn fuzzy_match(models: &[String], requested: &str) -> Option<String> {
    let needle = requested.to_lowercase();
    models
        .iter()
        .filter(|m| m.to_lowercase().contains(&needle))
        .max_by(|a, b| rank_key(a).cmp(&rank_key(b)))
        .cloned()
}

fn rank_key(name: &str) -> (u64, Vec<u64>, String) {
    let date = DATE_SUFFIX
        .captures(name)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0);
    let versions = DIGIT_RUNS
        .find_iter(name)
        .filter_map(|m| m.as_str().parse().ok())
        .collect();
    (date, versions, name.to_string())
}
