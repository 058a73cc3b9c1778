//! # Stat Generator
//!
//! Procedural attributes of a freshly opened mine.
//!
//! Each calibrated stat is produced in two steps:
//!
//! ```text
//! capital ──clamp──> [capital_low, capital_high] ──linear──> mean
//! mean ──Normal(mean, spread)──> reject outside [floor, ceiling] ──> value
//! ```
//!
//! Richer mines get better odds on average, never a guaranteed outcome.

use rand::Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

use crate::config::{CalibratedStat, StatsConfig};

/// Generated, immutable attributes of a mine.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct MineStats {
    /// Structural stability. Higher is slower collapse growth.
    pub stability: f64,
    /// Monetary yield coefficient.
    pub oof_rate: f64,
    /// Card yield coefficient.
    pub card_rate: f64,
    /// Item yield coefficient.
    pub item_rate: f64,
    /// Collapse probability at depth 0.
    pub collapse_prob: f64,
}

/// Linearly maps `value` from `[in_low, in_high]` onto `[out_low, out_high]`.
///
/// Inputs outside the input range are clamped to its bounds first.
#[inline]
#[must_use]
pub fn map_rate(value: f64, in_low: f64, in_high: f64, out_low: f64, out_high: f64) -> f64 {
    let clamped = value.clamp(in_low, in_high);
    out_low + (clamped - in_low) / (in_high - in_low) * (out_high - out_low)
}

/// Draws from `Normal(mean, spread)` truncated to `[floor, ceiling]`.
///
/// Samples outside the bounds are redrawn up to `max_redraws` times; if
/// every draw misses, the last one is clamped into bounds.
pub fn truncated_normal<R: Rng + ?Sized>(
    rng: &mut R,
    mean: f64,
    spread: f64,
    floor: f64,
    ceiling: f64,
    max_redraws: u32,
) -> f64 {
    let Ok(normal) = Normal::new(mean, spread) else {
        return mean.clamp(floor, ceiling);
    };

    let mut sample = mean;
    for _ in 0..max_redraws.max(1) {
        sample = normal.sample(rng);
        if (floor..=ceiling).contains(&sample) {
            return sample;
        }
    }

    tracing::warn!(
        mean,
        spread,
        floor,
        ceiling,
        max_redraws,
        "truncated normal hit its redraw cap, clamping"
    );
    sample.clamp(floor, ceiling)
}

fn calibrated<R: Rng + ?Sized>(
    rng: &mut R,
    stat: &CalibratedStat,
    starting_capital: f64,
    max_redraws: u32,
) -> f64 {
    let mean = map_rate(
        starting_capital,
        stat.capital_low,
        stat.capital_high,
        stat.mean_low,
        stat.mean_high,
    );
    truncated_normal(rng, mean, stat.spread, stat.floor, stat.ceiling, max_redraws)
}

/// Generates the attributes of a new mine from its starting capital.
///
/// The three yield coefficients are independent draws.
pub fn generate<R: Rng + ?Sized>(
    config: &StatsConfig,
    starting_capital: f64,
    rng: &mut R,
) -> MineStats {
    let redraws = config.max_redraws;
    MineStats {
        stability: calibrated(rng, &config.stability, starting_capital, redraws),
        oof_rate: calibrated(rng, &config.yield_rate, starting_capital, redraws),
        card_rate: calibrated(rng, &config.yield_rate, starting_capital, redraws),
        item_rate: calibrated(rng, &config.yield_rate, starting_capital, redraws),
        collapse_prob: truncated_normal(
            rng,
            config.base_collapse_mean,
            config.base_collapse_spread,
            0.0,
            1.0,
            redraws,
        ),
    }
}
