//! # Quarry Mining Economy
//!
//! Persistent, multi-tenant mining for a chat-bot economy. Users open mines
//! with an up-front investment, other users pay a toll to dig in them, and
//! every mine eventually collapses.
//!
//! ## Design Principles
//!
//! 1. **Per-mine serialization** - Digs on one mine never interleave; different mines never wait on each other
//! 2. **Pay before mutate** - The toll is debited before any state changes
//! 3. **Monotonic danger** - Depth and collapse probability only go up
//! 4. **External configuration** - All balance data in TOML files
//!
//! ## Components
//!
//! - [`MineRegistry`] / [`MineHandle`]: the live mines and the dig transaction
//! - [`Mine`]: one mine and its in-memory step loop
//! - [`EconomyGateway`]: wallets and persistence, supplied by the host
//! - [`Ledger`]: a journaled in-process gateway
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use quarry_mining::{Catalog, Ledger, MineRegistry, MiningConfig, Tool};
//!
//! let ledger = Arc::new(Ledger::open("data/quarry.wal")?);
//! let config = MiningConfig::from_file("data/mining.toml")?;
//! let catalog = Catalog::from_file("data/catalog.toml")?;
//! let registry = MineRegistry::bootstrap(config, catalog, ledger.clone())?;
//!
//! let mine = registry.create_for_level(owner, channel, 500, owner_level)?;
//! let record = registry.get(mine.id())?.dig(miner, &Tool::new(10.0, 5.0), &[])?;
//! if record.collapsed {
//!     announce_collapse(&record);
//! }
//!
//! registry.shutdown()?;
//! ```

#![deny(missing_docs)]
#![deny(unsafe_code)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![deny(clippy::perf)]

pub mod catalog;
pub mod config;
pub mod error;
pub mod gateway;
pub mod ledger;
pub mod mine;
pub mod registry;
pub mod reward;
pub mod stats;
pub mod wal;

#[cfg(test)]
mod testing;

pub use catalog::{Catalog, RewardKind};
pub use config::MiningConfig;
pub use error::{MiningError, MiningResult};
pub use gateway::EconomyGateway;
pub use ledger::{CollapsedMine, Ledger, MinerRecord};
pub use mine::{
    DigRecord, LocationId, Mine, MineId, MineSnapshot, MineState, StatusModifier, Tool, UserId,
    ESCAPE_TOKEN,
};
pub use registry::{concurrent_limit, MineHandle, MineRegistry};
pub use reward::Rewards;
pub use stats::MineStats;
pub use wal::{WalOperation, WriteAheadLog};
