//! # Mine State Machine
//!
//! One extraction site and the in-memory half of the dig transaction.
//!
//! ## Lifecycle
//!
//! ```text
//! open() ──> Active ──dig (survive)──> Active
//!               │
//!               └──dig (collapse)──> Collapsed   (terminal)
//! ```
//!
//! ## One dig, step by step
//!
//! ```text
//! steps = round(speed * strength / (depth + strength))
//! repeat steps times:
//!     r ~ U[0, 1)
//!     r > collapse_prob  -> ratchet, depth += 1, roll rewards
//!     otherwise          -> collapse, keep rewards only with "escape"
//! survived -> reprice toll, walk breadth
//! ```
//!
//! Wallets and persistence are NOT touched here; see
//! [`crate::registry::MineHandle::dig`] for the full transaction.

use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::catalog::{Catalog, RewardKind};
use crate::config::{BreadthConfig, FeeConfig, MiningConfig, RatchetConfig};
use crate::reward::{roll_catalog, roll_monetary, Rewards};
use crate::stats::{self, MineStats};

/// Mine identifier, unique among live mines.
pub type MineId = u32;

/// User identifier.
pub type UserId = u64;

/// Chat context a mine was opened in. `0` is a private context.
pub type LocationId = u64;

/// Boost token that keeps the rewards of a dig that collapses.
pub const ESCAPE_TOKEN: &str = "escape";

/// Digging tool supplied by the caller.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tool {
    /// How fast the tool digs. Also scales the toll.
    pub speed: f64,
    /// How well reach holds up as the mine deepens.
    pub strength: f64,
}

impl Tool {
    /// Creates a tool.
    #[inline]
    #[must_use]
    pub const fn new(speed: f64, strength: f64) -> Self {
        Self { speed, strength }
    }

    /// Depth units this tool attempts in one dig at `depth`.
    ///
    /// Diminishes as accumulated depth grows relative to strength.
    #[must_use]
    pub fn steps(&self, depth: u64) -> u64 {
        #[allow(clippy::cast_precision_loss)]
        let reach = self.speed * self.strength / (depth as f64 + self.strength);
        round_to_u64(reach)
    }
}

/// Lifecycle state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MineState {
    /// Listed in the registry and accepting digs.
    Active,
    /// Removed from the registry. Terminal.
    Collapsed,
}

/// A temporary effect attached to a mine (reinforced, brittle, ...).
///
/// Stored and persisted, not interpreted by the dig loop.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusModifier {
    /// Effect name.
    pub name: String,
    /// Depth units left before it expires, if depth-bound.
    pub remaining_depth: Option<u64>,
    /// Seconds left before it expires, if time-bound.
    pub remaining_secs: Option<u64>,
}

/// Plain copy of every field of a mine, for display and persistence.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MineSnapshot {
    /// Mine id.
    pub id: MineId,
    /// Owner.
    pub owner: UserId,
    /// Where it was opened.
    pub location: LocationId,
    /// Capital invested at opening.
    pub starting_capital: u64,
    /// Structural stability.
    pub stability: f64,
    /// Monetary yield coefficient.
    pub oof_rate: f64,
    /// Card yield coefficient.
    pub card_rate: f64,
    /// Item yield coefficient.
    pub item_rate: f64,
    /// Extraction width.
    pub breadth: u32,
    /// Current toll.
    pub fee: u64,
    /// Current depth.
    pub depth: u64,
    /// Current collapse probability.
    pub collapse_prob: f64,
    /// Tolls collected so far.
    pub income: u64,
    /// Reward name to selection weight.
    pub distributions: BTreeMap<String, f64>,
    /// Attached effects.
    pub status: Vec<StatusModifier>,
    /// Lifecycle state.
    pub state: MineState,
}

/// Outcome of one dig. Handed to the gateway, never kept by the core.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DigRecord {
    /// Mine that was dug.
    pub mine_id: MineId,
    /// Who dug.
    pub miner: UserId,
    /// Unix time of the dig in milliseconds.
    pub timestamp_ms: u64,
    /// Toll paid.
    pub toll: u64,
    /// Boost tokens consumed.
    pub boosts: Vec<String>,
    /// Depth units attempted.
    pub steps: u64,
    /// Depth units actually gained.
    pub depth_gained: u64,
    /// Money earned.
    pub income: u64,
    /// Cards and items earned.
    pub rewards: Rewards,
    /// Whether this dig collapsed the mine.
    pub collapsed: bool,
    /// Minutes before the miner should dig again. Zero after a collapse.
    pub cooling: u64,
    /// Breadth change applied after the dig: -1, 0 or +1.
    pub breadth_delta: i8,
}

impl DigRecord {
    fn begin(mine_id: MineId, miner: UserId, toll: u64, boosts: &[&str]) -> Self {
        let timestamp_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or_default();
        Self {
            mine_id,
            miner,
            timestamp_ms,
            toll,
            boosts: boosts.iter().map(|&b| b.to_owned()).collect(),
            steps: 0,
            depth_gained: 0,
            income: 0,
            rewards: Rewards::default(),
            collapsed: false,
            cooling: 0,
            breadth_delta: 0,
        }
    }
}

/// One extraction site.
#[derive(Clone, Debug, PartialEq)]
pub struct Mine {
    id: MineId,
    owner: UserId,
    location: LocationId,
    starting_capital: u64,
    stats: MineStats,
    breadth: u32,
    fee: u64,
    depth: u64,
    collapse_prob: f64,
    income: u64,
    distributions: BTreeMap<String, f64>,
    status: Vec<StatusModifier>,
    state: MineState,
}

impl Mine {
    /// Opens a new mine with freshly generated stats.
    ///
    /// The distribution map starts as the catalog's default weights.
    pub fn open<R: Rng + ?Sized>(
        id: MineId,
        owner: UserId,
        location: LocationId,
        starting_capital: u64,
        config: &MiningConfig,
        catalog: &Catalog,
        rng: &mut R,
    ) -> Self {
        #[allow(clippy::cast_precision_loss)]
        let capital = starting_capital as f64;
        let stats = stats::generate(&config.stats, capital, rng);
        Self {
            id,
            owner,
            location,
            starting_capital,
            stats,
            breadth: 1,
            fee: round_to_u64(capital / config.fee.opening_divisor),
            depth: 0,
            collapse_prob: stats.collapse_prob,
            income: 0,
            distributions: catalog.default_distributions(),
            status: Vec::new(),
            state: MineState::Active,
        }
    }

    /// Rebuilds a mine from a persisted snapshot.
    ///
    /// Breadth below 1 and collapse probability outside `[0, 1]` are
    /// clamped back into range.
    #[must_use]
    pub fn restore(snapshot: MineSnapshot) -> Self {
        Self {
            id: snapshot.id,
            owner: snapshot.owner,
            location: snapshot.location,
            starting_capital: snapshot.starting_capital,
            stats: MineStats {
                stability: snapshot.stability,
                oof_rate: snapshot.oof_rate,
                card_rate: snapshot.card_rate,
                item_rate: snapshot.item_rate,
                collapse_prob: snapshot.collapse_prob,
            },
            breadth: snapshot.breadth.max(1),
            fee: snapshot.fee,
            depth: snapshot.depth,
            collapse_prob: snapshot.collapse_prob.clamp(0.0, 1.0),
            income: snapshot.income,
            distributions: snapshot.distributions,
            status: snapshot.status,
            state: snapshot.state,
        }
    }

    /// Copies every field out.
    #[must_use]
    pub fn snapshot(&self) -> MineSnapshot {
        MineSnapshot {
            id: self.id,
            owner: self.owner,
            location: self.location,
            starting_capital: self.starting_capital,
            stability: self.stats.stability,
            oof_rate: self.stats.oof_rate,
            card_rate: self.stats.card_rate,
            item_rate: self.stats.item_rate,
            breadth: self.breadth,
            fee: self.fee,
            depth: self.depth,
            collapse_prob: self.collapse_prob,
            income: self.income,
            distributions: self.distributions.clone(),
            status: self.status.clone(),
            state: self.state,
        }
    }

    /// Mine id.
    #[inline]
    #[must_use]
    pub const fn id(&self) -> MineId {
        self.id
    }

    /// Owner.
    #[inline]
    #[must_use]
    pub const fn owner(&self) -> UserId {
        self.owner
    }

    /// Where the mine was opened.
    #[inline]
    #[must_use]
    pub const fn location(&self) -> LocationId {
        self.location
    }

    /// Capital invested at opening.
    #[inline]
    #[must_use]
    pub const fn starting_capital(&self) -> u64 {
        self.starting_capital
    }

    /// Generated stats. `collapse_prob` here is the probability the mine
    /// was opened or last restored with; it does not follow the ratchet.
    /// See [`Mine::collapse_prob`] for the live value.
    #[inline]
    #[must_use]
    pub const fn stats(&self) -> &MineStats {
        &self.stats
    }

    /// Extraction width.
    #[inline]
    #[must_use]
    pub const fn breadth(&self) -> u32 {
        self.breadth
    }

    /// Current toll.
    #[inline]
    #[must_use]
    pub const fn fee(&self) -> u64 {
        self.fee
    }

    /// Current depth.
    #[inline]
    #[must_use]
    pub const fn depth(&self) -> u64 {
        self.depth
    }

    /// Current collapse probability.
    #[inline]
    #[must_use]
    pub const fn collapse_prob(&self) -> f64 {
        self.collapse_prob
    }

    /// Tolls collected so far.
    #[inline]
    #[must_use]
    pub const fn income(&self) -> u64 {
        self.income
    }

    /// Reward name to selection weight.
    #[inline]
    #[must_use]
    pub const fn distributions(&self) -> &BTreeMap<String, f64> {
        &self.distributions
    }

    /// Attached effects.
    #[inline]
    #[must_use]
    pub fn status(&self) -> &[StatusModifier] {
        &self.status
    }

    /// Lifecycle state.
    #[inline]
    #[must_use]
    pub const fn state(&self) -> MineState {
        self.state
    }

    /// Whether the mine still accepts digs.
    #[inline]
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == MineState::Active
    }

    /// Books a toll that the gateway already debited.
    pub(crate) fn accept_toll(&mut self, toll: u64) {
        self.income = self.income.saturating_add(toll);
    }

    /// Runs the step loop and, if the mine survives, reprices and walks
    /// breadth. The toll must already be booked with `accept_toll`.
    ///
    /// On collapse the mine moves to [`MineState::Collapsed`]; removing it
    /// from the registry is the caller's job.
    #[allow(clippy::too_many_arguments)]
    pub fn excavate<R: Rng + ?Sized>(
        &mut self,
        rng: &mut R,
        miner: UserId,
        tool: &Tool,
        boosts: &[&str],
        toll: u64,
        config: &MiningConfig,
        catalog: &Catalog,
    ) -> DigRecord {
        debug_assert!(self.is_active(), "excavate on a collapsed mine");

        let mut record = DigRecord::begin(self.id, miner, toll, boosts);
        let start_depth = self.depth;
        let steps = tool.steps(self.depth);
        record.steps = steps;

        for _ in 0..steps {
            if rng.gen::<f64>() > self.collapse_prob {
                self.ratchet(rng, &config.ratchet);
                self.depth += 1;
                self.roll_rewards(rng, &mut record, config, catalog);
            } else {
                if !boosts.contains(&ESCAPE_TOKEN) {
                    record.income = 0;
                    record.rewards.clear();
                }
                record.collapsed = true;
                self.state = MineState::Collapsed;
                break;
            }
        }

        record.depth_gained = self.depth - start_depth;

        if !record.collapsed {
            self.reprice(tool, &config.fee);
            record.breadth_delta = self.walk_breadth(rng, &config.breadth);
            record.cooling = self.depth.saturating_mul(2).saturating_add(steps);
        }

        record
    }

    fn roll_rewards<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
        record: &mut DigRecord,
        config: &MiningConfig,
        catalog: &Catalog,
    ) {
        if let Some(money) = roll_monetary(rng, self.stats.oof_rate, self.depth, self.fee) {
            record.income = record.income.saturating_add(money);
        }
        if let Some(card) = roll_catalog(
            rng,
            &config.rewards,
            RewardKind::Card,
            self.depth,
            self.stats.card_rate,
            &self.distributions,
            catalog,
        ) {
            record.rewards.add_card(card);
        }
        if let Some(item) = roll_catalog(
            rng,
            &config.rewards,
            RewardKind::Item,
            self.depth,
            self.stats.item_rate,
            &self.distributions,
            catalog,
        ) {
            record.rewards.add_item(item);
        }
    }

    /// Raises the collapse probability for one surviving depth unit.
    ///
    /// The increment is floored at zero and the result capped at one.
    fn ratchet<R: Rng + ?Sized>(&mut self, rng: &mut R, config: &RatchetConfig) {
        #[allow(clippy::cast_precision_loss)]
        let depth = self.depth as f64;
        let stability = self.stats.stability;
        let noise_width = config.noise.abs();
        let noise = rng.gen_range(-noise_width..=noise_width);

        let increment = config.base / stability.powf(config.stability_exponent)
            + depth.powf(config.depth_exponent) * config.depth_scale / stability
            + noise;
        if increment.is_finite() {
            self.collapse_prob = (self.collapse_prob + increment.max(0.0)).min(1.0);
        }
    }

    /// `fee = round(capital * sqrt(depth^0.7 + 10) * 0.0004 * speed)`
    fn reprice(&mut self, tool: &Tool, config: &FeeConfig) {
        #[allow(clippy::cast_precision_loss)]
        let (capital, depth) = (self.starting_capital as f64, self.depth as f64);
        let fee = capital
            * (depth.powf(config.depth_exponent) + config.depth_offset).sqrt()
            * config.scale
            * tool.speed;
        self.fee = round_to_u64(fee);
    }

    /// Random walk of breadth. Both thresholds are tested against the same
    /// draw, so shrinking is only possible once `up_base^breadth < down_prob`.
    fn walk_breadth<R: Rng + ?Sized>(&mut self, rng: &mut R, config: &BreadthConfig) -> i8 {
        let up_prob = config
            .up_base
            .powi(i32::try_from(self.breadth).unwrap_or(i32::MAX));
        let dice: f64 = rng.gen();
        if dice < up_prob {
            self.breadth += 1;
            1
        } else if self.breadth > 1 && dice < config.down_prob {
            self.breadth -= 1;
            -1
        } else {
            0
        }
    }
}

/// Rounds half away from zero; negative and NaN become 0, overflow saturates.
#[inline]
pub(crate) fn round_to_u64(value: f64) -> u64 {
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let rounded = value.round().max(0.0) as u64;
    rounded
}
