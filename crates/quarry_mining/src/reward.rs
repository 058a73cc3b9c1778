//! # Reward Model
//!
//! Three independent channels are rolled once for every depth unit a dig
//! survives:
//!
//! - **Monetary**: fires with probability `oof_rate * depth`, pays
//!   `depth * fee`.
//! - **Card** / **Item**: fire with the saturating curve below and pick one
//!   eligible entry of the mine's distribution map by weight.
//!
//! ```text
//! f(depth, rate) = (((1 + k·depth) / (k·depth))^(k·depth) − 1 + rate·s) · c
//! ```
//!
//! As depth grows the base term tends to `e`, so rewards get more likely
//! with depth but stay bounded. Nothing here touches mine state.

use std::collections::BTreeMap;

use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::catalog::{Catalog, RewardKind};
use crate::config::RewardConfig;

/// Rewards accumulated by one dig.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rewards {
    /// Card name to count.
    pub cards: BTreeMap<String, u32>,
    /// Items in the order they were found.
    pub items: Vec<String>,
}

impl Rewards {
    /// True when nothing was found.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.cards.is_empty() && self.items.is_empty()
    }

    /// Total number of reward tokens.
    #[must_use]
    pub fn len(&self) -> usize {
        self.cards.values().map(|&c| c as usize).sum::<usize>() + self.items.len()
    }

    /// Records one card.
    pub fn add_card(&mut self, name: String) {
        *self.cards.entry(name).or_insert(0) += 1;
    }

    /// Records one item.
    pub fn add_item(&mut self, name: String) {
        self.items.push(name);
    }

    /// Drops everything.
    pub fn clear(&mut self) {
        self.cards.clear();
        self.items.clear();
    }
}

/// Monetary channel. Returns the payout if the roll fires.
///
/// `oof_rate * depth` is clamped to `[0, 1]`; the roll is uniform in
/// `[0, 1)` so the clamp never changes an outcome.
pub fn roll_monetary<R: Rng + ?Sized>(
    rng: &mut R,
    oof_rate: f64,
    depth: u64,
    fee: u64,
) -> Option<u64> {
    #[allow(clippy::cast_precision_loss)]
    let chance = (oof_rate * depth as f64).clamp(0.0, 1.0);
    if rng.gen::<f64>() < chance {
        Some(depth.saturating_mul(fee))
    } else {
        None
    }
}

/// Trigger probability of the card and item channels.
#[must_use]
pub fn curve_probability(config: &RewardConfig, depth: u64, rate: f64) -> f64 {
    #[allow(clippy::cast_precision_loss)]
    let x = config.curve_k * depth as f64;
    // (1 + 1/x)^x -> 1 as x -> 0
    let base = if x > 0.0 { ((1.0 + x) / x).powf(x) } else { 1.0 };
    (base - 1.0 + rate * config.rate_scale) * config.curve_scale
}

/// Picks one name by weight. Non-positive and non-finite weights are
/// ineligible; `None` when nothing is eligible.
pub fn weighted_choice<'a, R, I>(rng: &mut R, entries: I) -> Option<&'a str>
where
    R: Rng + ?Sized,
    I: IntoIterator<Item = (&'a str, f64)>,
{
    let (names, weights): (Vec<&str>, Vec<f64>) = entries
        .into_iter()
        .filter(|(_, w)| w.is_finite() && *w > 0.0)
        .unzip();
    let index = WeightedIndex::new(&weights).ok()?;
    Some(names[index.sample(rng)])
}

/// Card or item channel. Returns the selected name if the roll fires and
/// the distribution map has at least one eligible entry.
pub fn roll_catalog<R: Rng + ?Sized>(
    rng: &mut R,
    config: &RewardConfig,
    kind: RewardKind,
    depth: u64,
    rate: f64,
    distributions: &BTreeMap<String, f64>,
    catalog: &Catalog,
) -> Option<String> {
    let chance = curve_probability(config, depth, rate);
    tracing::debug!(?kind, depth, chance, "catalog reward chance");
    if rng.gen::<f64>() >= chance {
        return None;
    }

    let eligible = distributions
        .iter()
        .filter(|(name, _)| catalog.contains(kind, name))
        .map(|(name, weight)| (name.as_str(), *weight));
    weighted_choice(rng, eligible).map(str::to_owned)
}
