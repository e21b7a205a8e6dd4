//! Model pricing and cost estimation.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{CostEstimate, TokenRecord};

/// Model pricing in USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
    pub cache_write_per_million: f64,
    pub cache_read_per_million: f64,
}

impl ModelPricing {
    pub const fn new(input: f64, output: f64, cache_write: f64, cache_read: f64) -> Self {
        Self {
            input_per_million: input,
            output_per_million: output,
            cache_write_per_million: cache_write,
            cache_read_per_million: cache_read,
        }
    }

    /// Calculate cost from token counts.
    pub fn calculate_cost(&self, input: i64, output: i64, cache_write: i64, cache_read: i64) -> f64 {
        (input as f64 * self.input_per_million / 1_000_000.0)
            + (output as f64 * self.output_per_million / 1_000_000.0)
            + (cache_write as f64 * self.cache_write_per_million / 1_000_000.0)
            + (cache_read as f64 * self.cache_read_per_million / 1_000_000.0)
    }
}

/// Pricing tier a model name resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelTier {
    Opus,
    Sonnet,
    Haiku,
}

impl ModelTier {
    /// Resolve a model identifier by its family segment.
    ///
    /// `claude-opus-4-6` and `claude-3-opus-20240229` are both opus.
    /// Anything unrecognized, including an empty name, prices as sonnet.
    pub fn from_model(model: &str) -> Self {
        let lower = model.to_ascii_lowercase();
        let family = lower.split('-').find(|segment| {
            !segment.is_empty()
                && *segment != "claude"
                && !segment.chars().all(|c| c.is_ascii_digit() || c == '.')
        });

        match family {
            Some(f) if f.starts_with("opus") => ModelTier::Opus,
            Some(f) if f.starts_with("haiku") => ModelTier::Haiku,
            _ => ModelTier::Sonnet,
        }
    }

    pub fn pricing(&self) -> ModelPricing {
        match self {
            ModelTier::Opus => ModelPricing::new(15.0, 75.0, 18.75, 1.50),
            ModelTier::Sonnet => ModelPricing::new(3.0, 15.0, 3.75, 0.30),
            ModelTier::Haiku => ModelPricing::new(0.80, 4.0, 1.0, 0.08),
        }
    }
}

/// Cost of one record in USD.
pub fn cost(record: &TokenRecord) -> f64 {
    ModelTier::from_model(&record.model).pricing().calculate_cost(
        record.input_tokens,
        record.output_tokens,
        record.cache_write_tokens,
        record.cache_read_tokens,
    )
}

/// Sum cost over records timestamped at or after `now - window_hours`.
pub fn estimate<'a, I>(records: I, window_hours: i64, now: DateTime<Utc>) -> CostEstimate
where
    I: IntoIterator<Item = &'a TokenRecord>,
{
    let since = now - Duration::hours(window_hours);
    let mut estimate = CostEstimate::default();

    for record in records.into_iter().filter(|r| r.timestamp >= since) {
        estimate.total_cost_usd += cost(record);
        estimate.record_count += 1;
        estimate.oldest = Some(match estimate.oldest {
            Some(t) => t.min(record.timestamp),
            None => record.timestamp,
        });
        estimate.newest = Some(match estimate.newest {
            Some(t) => t.max(record.timestamp),
            None => record.timestamp,
        });
    }

    estimate
}

/// Cost of the whole window if usage continued at the observed rate.
///
/// `cost` is what was spent so far and `percent` the share of the window's
/// limit it consumed. Returns `None` when nothing has been consumed yet.
pub fn project_window_cost(cost: f64, percent: f64) -> Option<f64> {
    if percent > 0.0 && percent.is_finite() {
        Some(cost * 100.0 / percent)
    } else {
        None
    }
}
