//! # Mining Configuration
//!
//! Every balance number of the mining economy lives here and can be loaded
//! from a TOML file at startup. Missing sections fall back to the shipped
//! defaults, so an empty file is a valid configuration.
//!
//! ```toml
//! [registry]
//! id_space = 999999999
//!
//! [stats.stability]
//! capital_low = 200.0
//! capital_high = 1000.0
//! mean_low = 20.0
//! mean_high = 50.0
//! spread = 5.0
//! floor = 5.0
//! ceiling = 95.0
//! ```

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{MiningError, MiningResult};
use crate::mine::MineId;

/// A stat whose mean follows the starting capital and whose value is a
/// truncated normal draw around that mean.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CalibratedStat {
    /// Capital at (or below) which the mean is `mean_low`.
    pub capital_low: f64,
    /// Capital at (or above) which the mean is `mean_high`.
    pub capital_high: f64,
    /// Mean for the poorest mines.
    pub mean_low: f64,
    /// Mean for the richest mines.
    pub mean_high: f64,
    /// Standard deviation of the draw.
    pub spread: f64,
    /// Draws below this are rejected.
    pub floor: f64,
    /// Draws above this are rejected.
    pub ceiling: f64,
}

impl CalibratedStat {
    #[allow(clippy::neg_cmp_op_on_partial_ord)]
    fn validate(&self, name: &str) -> MiningResult<()> {
        if !(self.capital_high > self.capital_low) {
            return Err(MiningError::InvalidConfig(format!(
                "{name}: capital range is empty"
            )));
        }
        if !(self.spread > 0.0) {
            return Err(MiningError::InvalidConfig(format!(
                "{name}: spread must be positive"
            )));
        }
        if !(self.ceiling >= self.floor) {
            return Err(MiningError::InvalidConfig(format!(
                "{name}: ceiling below floor"
            )));
        }
        Ok(())
    }
}

/// Stat generation parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatsConfig {
    /// Structural stability, dampens the collapse ratchet.
    pub stability: CalibratedStat,
    /// Shared calibration of the three yield coefficients.
    pub yield_rate: CalibratedStat,
    /// Mean of the initial collapse probability.
    pub base_collapse_mean: f64,
    /// Spread of the initial collapse probability.
    pub base_collapse_spread: f64,
    /// Redraw cap for every truncated normal draw.
    pub max_redraws: u32,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            stability: CalibratedStat {
                capital_low: 200.0,
                capital_high: 1000.0,
                mean_low: 20.0,
                mean_high: 50.0,
                spread: 5.0,
                floor: 5.0,
                ceiling: 95.0,
            },
            yield_rate: CalibratedStat {
                capital_low: 200.0,
                capital_high: 1000.0,
                mean_low: 5.0,
                mean_high: 20.0,
                spread: 1.8,
                floor: 0.0,
                ceiling: 100.0,
            },
            base_collapse_mean: 1e-5,
            base_collapse_spread: 1e-6,
            max_redraws: 10_000,
        }
    }
}

/// Registry parameters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistryConfig {
    /// Ids are drawn from `1..=id_space`. Collapsed ids are never reused,
    /// so this bounds every mine ever opened, not just the live ones.
    pub id_space: MineId,
    /// Seed for id allocation and per-mine RNG streams. `None` = OS entropy.
    pub seed: Option<u64>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            id_space: 999_999_999,
            seed: None,
        }
    }
}

/// Card/item reward curve parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardConfig {
    /// Depth scale `k` of the saturating curve.
    pub curve_k: f64,
    /// Weight of the mine's yield coefficient.
    pub rate_scale: f64,
    /// Overall multiplier of the curve.
    pub curve_scale: f64,
}

impl Default for RewardConfig {
    fn default() -> Self {
        Self {
            curve_k: 0.000_04,
            rate_scale: 0.000_1,
            curve_scale: 55.0,
        }
    }
}

/// Collapse probability ratchet parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RatchetConfig {
    /// Flat growth per depth unit, divided by `stability^stability_exponent`.
    pub base: f64,
    /// Exponent on stability of the flat term.
    pub stability_exponent: f64,
    /// Exponent on depth of the depth term.
    pub depth_exponent: f64,
    /// Scale of the depth term, divided by stability.
    pub depth_scale: f64,
    /// Half-width of the uniform noise term.
    pub noise: f64,
}

impl Default for RatchetConfig {
    fn default() -> Self {
        Self {
            base: 1e-5,
            stability_exponent: 1.1,
            depth_exponent: 1.5,
            depth_scale: 1e-7,
            noise: 1e-6,
        }
    }
}

/// Toll parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FeeConfig {
    /// Opening toll is `starting_capital / opening_divisor`.
    pub opening_divisor: f64,
    /// Exponent on depth.
    pub depth_exponent: f64,
    /// Added to `depth^depth_exponent` before the square root.
    pub depth_offset: f64,
    /// Final multiplier.
    pub scale: f64,
}

impl Default for FeeConfig {
    fn default() -> Self {
        Self {
            opening_divisor: 20.0,
            depth_exponent: 0.7,
            depth_offset: 10.0,
            scale: 0.000_4,
        }
    }
}

/// Breadth random walk parameters.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreadthConfig {
    /// Growth probability is `up_base^breadth`.
    pub up_base: f64,
    /// Shrink threshold on the same draw.
    pub down_prob: f64,
}

impl Default for BreadthConfig {
    fn default() -> Self {
        Self {
            up_base: 0.3,
            down_prob: 0.25,
        }
    }
}

/// Complete mining configuration.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MiningConfig {
    /// Stat generation.
    pub stats: StatsConfig,
    /// Registry sizing and seeding.
    pub registry: RegistryConfig,
    /// Reward curves.
    pub rewards: RewardConfig,
    /// Collapse ratchet.
    pub ratchet: RatchetConfig,
    /// Toll formula.
    pub fee: FeeConfig,
    /// Breadth walk.
    pub breadth: BreadthConfig,
}

impl MiningConfig {
    /// Parses and validates a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`MiningError::InvalidConfig`] on syntax errors or
    /// degenerate parameters.
    pub fn from_toml_str(source: &str) -> MiningResult<Self> {
        let config: Self =
            toml::from_str(source).map_err(|e| MiningError::InvalidConfig(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`MiningError::InvalidConfig`] if the file cannot be read or
    /// is invalid.
    pub fn from_file(path: impl AsRef<Path>) -> MiningResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|e| {
            MiningError::InvalidConfig(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::from_toml_str(&source)
    }

    /// Checks that no parameter makes a formula degenerate.
    ///
    /// # Errors
    ///
    /// Returns [`MiningError::InvalidConfig`] naming the first bad field.
    #[allow(clippy::neg_cmp_op_on_partial_ord)]
    pub fn validate(&self) -> MiningResult<()> {
        self.stats.stability.validate("stats.stability")?;
        self.stats.yield_rate.validate("stats.yield_rate")?;
        if !(self.stats.base_collapse_spread > 0.0) {
            return Err(MiningError::InvalidConfig(
                "stats.base_collapse_spread must be positive".to_string(),
            ));
        }
        if self.stats.max_redraws == 0 {
            return Err(MiningError::InvalidConfig(
                "stats.max_redraws must be at least 1".to_string(),
            ));
        }
        if self.registry.id_space == 0 {
            return Err(MiningError::InvalidConfig(
                "registry.id_space must be at least 1".to_string(),
            ));
        }
        if !(self.fee.opening_divisor > 0.0) {
            return Err(MiningError::InvalidConfig(
                "fee.opening_divisor must be positive".to_string(),
            ));
        }
        if !(0.0..1.0).contains(&self.breadth.up_base) {
            return Err(MiningError::InvalidConfig(
                "breadth.up_base must be in [0, 1)".to_string(),
            ));
        }
        Ok(())
    }
}
