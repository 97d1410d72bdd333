//! Cost computation from token usage and per-model price tables.
//!
//! A channel's quota config carries prices per million tokens, keyed by
//! model name:
//!
//! ```json
//! {"gpt-4o": {"input": 2.5, "output": 10.0, "cache_read": 1.25, "cache_write": 3.125}}
//! ```

use serde::Deserialize;
use serde_json::Value;

use crate::relay::context::TokenUsage;

/// Prices in USD per million tokens.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct ModelPrice {
    #[serde(default)]
    pub input: f64,
    #[serde(default)]
    pub output: f64,
    #[serde(default)]
    pub cache_read: f64,
    #[serde(default)]
    pub cache_write: f64,
}

/// Look up the price entry for `model` in a channel quota-config JSON.
///
/// Returns `None` when the channel has no quota config or the model has no
/// entry; cost is then treated as zero.
pub fn model_price(quota_config: Option<&str>, model: &str) -> Option<ModelPrice> {
    let raw = quota_config?;
    let table: Value = serde_json::from_str(raw).ok()?;
    let entry = table.get(model)?;
    serde_json::from_value(entry.clone()).ok()
}

/// Compute USD cost for a usage sample.
pub fn cost_usd(usage: &TokenUsage, price: &ModelPrice) -> f64 {
    const MTOK: f64 = 1_000_000.0;
    (usage.input_tokens as f64 / MTOK) * price.input
        + (usage.output_tokens as f64 / MTOK) * price.output
        + (usage.cache_read_tokens as f64 / MTOK) * price.cache_read
        + (usage.cache_creation_tokens as f64 / MTOK) * price.cache_write
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn calc_cost() {
        let price = ModelPrice {
            input: 1.0,
            output: 2.0,
            cache_read: 0.5,
            cache_write: 1.5,
        };
        let usage = TokenUsage {
            input_tokens: 1_000_000,
            output_tokens: 2_000_000,
            cache_read_tokens: 2_000_000,
            cache_creation_tokens: 0,
        };
        assert!((cost_usd(&usage, &price) - 6.0).abs() < 1e-9);
    }

    #[test]
    fn price_lookup() {
        let cfg = r#"{"gpt-4o": {"input": 2.5, "output": 10.0}}"#;
        let price = model_price(Some(cfg), "gpt-4o").unwrap();
        assert!((price.input - 2.5).abs() < 1e-9);
        assert!((price.cache_read).abs() < 1e-9);
        assert!(model_price(Some(cfg), "gpt-3.5").is_none());
        assert!(model_price(None, "gpt-4o").is_none());
    }
}
