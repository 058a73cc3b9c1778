//! # Mine Registry
//!
//! The authoritative set of active mines and the entry point for digging.
//!
//! ## Locking
//!
//! ```text
//! Directory  RwLock   id -> Arc<MineSlot>, pending + retired ids, id/seed RNG
//!   └─ MineSlot  Mutex  one mine + its own RNG stream
//! ```
//!
//! Lock order is always slot, then directory. Registry-wide readers clone
//! the slot handles and release the directory before touching any slot, so
//! a long dig never blocks listing or digs on other mines. Gateway calls
//! never run under the directory lock: `create` reserves its id, releases
//! the lock for the gateway writes, then publishes the mine.
//!
//! ## One dig
//!
//! ```text
//! lock slot ─ active? ─ register miner ─ debit toll ─ excavate
//!     ├─ survived:  persist mine, append record, credit income
//!     └─ collapsed: retire id, record collapse, credit escaped income
//! ```

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::catalog::Catalog;
use crate::config::MiningConfig;
use crate::error::{MiningError, MiningResult};
use crate::gateway::EconomyGateway;
use crate::mine::{
    DigRecord, LocationId, Mine, MineId, MineSnapshot, MineState, Tool, UserId, ESCAPE_TOKEN,
};

/// Random id draws before falling back to a scan.
const SAMPLE_ATTEMPTS: usize = 64;

/// How many mines an owner of `level` may run at once.
///
/// `0` at level 0, otherwise `(level - 1) / 2`.
#[inline]
#[must_use]
pub const fn concurrent_limit(level: u32) -> usize {
    if level == 0 {
        0
    } else {
        ((level - 1) / 2) as usize
    }
}

struct MineCell {
    mine: Mine,
    rng: ChaCha8Rng,
}

struct MineSlot {
    id: MineId,
    owner: UserId,
    cell: Mutex<MineCell>,
}

impl MineSlot {
    fn new(mine: Mine, rng: ChaCha8Rng) -> Arc<Self> {
        Arc::new(Self {
            id: mine.id(),
            owner: mine.owner(),
            cell: Mutex::new(MineCell { mine, rng }),
        })
    }
}

struct Directory {
    mines: HashMap<MineId, Arc<MineSlot>>,
    /// Ids handed to a `create` whose gateway writes are in flight.
    pending: HashMap<MineId, UserId>,
    retired: HashSet<MineId>,
    rng: ChaCha8Rng,
}

impl Directory {
    fn is_free(&self, id: MineId) -> bool {
        !self.mines.contains_key(&id)
            && !self.pending.contains_key(&id)
            && !self.retired.contains(&id)
    }

    fn allocate_id(&mut self, bound: MineId) -> MiningResult<MineId> {
        for _ in 0..SAMPLE_ATTEMPTS {
            let id = self.rng.gen_range(1..=bound);
            if self.is_free(id) {
                return Ok(id);
            }
        }

        let start = self.rng.gen_range(1..=bound);
        tracing::warn!(
            bound,
            live = self.mines.len(),
            retired = self.retired.len(),
            "Mine id sampling saturated, scanning"
        );
        (start..=bound)
            .chain(1..start)
            .find(|&id| self.is_free(id))
            .ok_or(MiningError::IdSpaceExhausted { bound })
    }

    /// A fresh RNG stream for one mine.
    fn fork_rng(&mut self) -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(self.rng.gen())
    }

    /// Live and pending mines of `owner`.
    fn count_by_owner(&self, owner: UserId) -> usize {
        let live = self.mines.values().filter(|slot| slot.owner == owner).count();
        live + self.pending.values().filter(|&&o| o == owner).count()
    }
}

struct Shared {
    config: MiningConfig,
    catalog: Catalog,
    gateway: Arc<dyn EconomyGateway>,
    directory: RwLock<Directory>,
}

/// Registry of active mines. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct MineRegistry {
    shared: Arc<Shared>,
}

impl MineRegistry {
    /// Creates an empty registry.
    ///
    /// # Errors
    ///
    /// Returns [`MiningError::InvalidConfig`] if `config` does not validate.
    pub fn new(
        config: MiningConfig,
        catalog: Catalog,
        gateway: Arc<dyn EconomyGateway>,
    ) -> MiningResult<Self> {
        config.validate()?;
        let rng = match config.registry.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::from_entropy(),
        };
        Ok(Self {
            shared: Arc::new(Shared {
                config,
                catalog,
                gateway,
                directory: RwLock::new(Directory {
                    mines: HashMap::new(),
                    pending: HashMap::new(),
                    retired: HashSet::new(),
                    rng,
                }),
            }),
        })
    }

    /// Rebuilds the registry from the mines the gateway reports as active.
    ///
    /// # Errors
    ///
    /// Invalid configuration or gateway failures.
    pub fn bootstrap(
        config: MiningConfig,
        catalog: Catalog,
        gateway: Arc<dyn EconomyGateway>,
    ) -> MiningResult<Self> {
        let snapshots = gateway.active_mines()?;
        let retired = gateway.retired_ids()?;
        let registry = Self::new(config, catalog, gateway)?;

        {
            let mut directory = registry.shared.directory.write();
            directory.retired.extend(retired);
            for snapshot in snapshots {
                if snapshot.state != MineState::Active {
                    continue;
                }
                let rng = directory.fork_rng();
                let slot = MineSlot::new(Mine::restore(snapshot), rng);
                directory.mines.insert(slot.id, slot);
            }
            tracing::info!(
                active = directory.mines.len(),
                retired = directory.retired.len(),
                "Mine registry bootstrapped"
            );
        }

        Ok(registry)
    }

    /// Configuration in use.
    #[must_use]
    pub fn config(&self) -> &MiningConfig {
        &self.shared.config
    }

    /// Reward catalog in use.
    #[must_use]
    pub fn catalog(&self) -> &Catalog {
        &self.shared.catalog
    }

    /// Opens a mine without a concurrency limit check.
    ///
    /// # Errors
    ///
    /// [`MiningError::IdSpaceExhausted`] or gateway failures.
    pub fn create(
        &self,
        owner: UserId,
        location: LocationId,
        starting_capital: u64,
    ) -> MiningResult<MineHandle> {
        let (id, rng) = {
            let mut directory = self.shared.directory.write();
            Self::reserve(&mut directory, owner, self.shared.config.registry.id_space)?
        };
        self.open_reserved(id, rng, owner, location, starting_capital)
    }

    /// Opens a mine if `owner` runs fewer than [`concurrent_limit`]`(level)`.
    ///
    /// The check and the id reservation happen under one lock, so racing
    /// calls for one owner cannot both pass.
    ///
    /// # Errors
    ///
    /// [`MiningError::ConcurrentLimitExceeded`],
    /// [`MiningError::IdSpaceExhausted`] or gateway failures.
    pub fn create_for_level(
        &self,
        owner: UserId,
        location: LocationId,
        starting_capital: u64,
        level: u32,
    ) -> MiningResult<MineHandle> {
        let (id, rng) = {
            let mut directory = self.shared.directory.write();
            let active = directory.count_by_owner(owner);
            let limit = concurrent_limit(level);
            if active >= limit {
                return Err(MiningError::ConcurrentLimitExceeded {
                    owner,
                    active,
                    limit,
                });
            }
            Self::reserve(&mut directory, owner, self.shared.config.registry.id_space)?
        };
        self.open_reserved(id, rng, owner, location, starting_capital)
    }

    fn reserve(
        directory: &mut Directory,
        owner: UserId,
        bound: MineId,
    ) -> MiningResult<(MineId, ChaCha8Rng)> {
        let id = directory.allocate_id(bound)?;
        directory.pending.insert(id, owner);
        Ok((id, directory.fork_rng()))
    }

    /// Generates, persists and publishes a mine under a reserved id. The
    /// reservation is dropped whatever the outcome.
    fn open_reserved(
        &self,
        id: MineId,
        mut rng: ChaCha8Rng,
        owner: UserId,
        location: LocationId,
        starting_capital: u64,
    ) -> MiningResult<MineHandle> {
        let shared = &self.shared;
        let mine = Mine::open(
            id,
            owner,
            location,
            starting_capital,
            &shared.config,
            &shared.catalog,
            &mut rng,
        );

        let persisted = Self::persist_opening(shared.gateway.as_ref(), &mine);
        let mut directory = shared.directory.write();
        directory.pending.remove(&id);
        persisted?;

        tracing::info!(
            mine = id,
            owner,
            capital = starting_capital,
            fee = mine.fee(),
            stability = mine.stats().stability,
            "Mine opened"
        );

        let slot = MineSlot::new(mine, rng);
        directory.mines.insert(id, Arc::clone(&slot));
        Ok(MineHandle {
            slot,
            shared: Arc::clone(shared),
        })
    }

    fn persist_opening(gateway: &dyn EconomyGateway, mine: &Mine) -> MiningResult<()> {
        if !gateway.miner_exists(mine.owner()) {
            gateway.register_miner(mine.owner())?;
        }
        gateway.open_mine(&mine.snapshot())
    }

    /// Looks up an active mine.
    ///
    /// # Errors
    ///
    /// [`MiningError::MineNotFound`] for unknown or collapsed ids.
    pub fn get(&self, id: MineId) -> MiningResult<MineHandle> {
        let slot = self
            .shared
            .directory
            .read()
            .mines
            .get(&id)
            .cloned()
            .ok_or(MiningError::MineNotFound(id))?;
        Ok(MineHandle {
            slot,
            shared: Arc::clone(&self.shared),
        })
    }

    /// Number of active mines owned by `owner`, counting mines whose
    /// `create` is still in flight.
    #[must_use]
    pub fn count_by_owner(&self, owner: UserId) -> usize {
        self.shared.directory.read().count_by_owner(owner)
    }

    /// Number of active mines.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.directory.read().mines.len()
    }

    /// Whether no mine is active.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of one active mine.
    ///
    /// # Errors
    ///
    /// [`MiningError::MineNotFound`] for unknown or collapsed ids.
    pub fn snapshot(&self, id: MineId) -> MiningResult<MineSnapshot> {
        self.get(id)?.snapshot()
    }

    /// Snapshots of every active mine, sorted by id.
    #[must_use]
    pub fn list(&self) -> Vec<MineSnapshot> {
        self.collect(|_| true)
    }

    /// Snapshots of `owner`'s active mines, sorted by id.
    #[must_use]
    pub fn owned_by(&self, owner: UserId) -> Vec<MineSnapshot> {
        self.collect(|slot| slot.owner == owner)
    }

    fn slots(&self) -> Vec<Arc<MineSlot>> {
        self.shared.directory.read().mines.values().cloned().collect()
    }

    fn collect(&self, keep: impl Fn(&MineSlot) -> bool) -> Vec<MineSnapshot> {
        let mut snapshots: Vec<MineSnapshot> = self
            .slots()
            .into_iter()
            .filter(|slot| keep(slot))
            .filter_map(|slot| {
                let cell = slot.cell.lock();
                cell.mine.is_active().then(|| cell.mine.snapshot())
            })
            .collect();
        snapshots.sort_by_key(|s| s.id);
        snapshots
    }

    /// Persists every active mine and flushes the gateway.
    ///
    /// # Errors
    ///
    /// The first gateway failure.
    pub fn shutdown(&self) -> MiningResult<()> {
        let mut persisted = 0usize;
        for slot in self.slots() {
            let cell = slot.cell.lock();
            if cell.mine.is_active() {
                self.shared.gateway.persist_mine(&cell.mine.snapshot())?;
                persisted += 1;
            }
        }
        self.shared.gateway.flush()?;
        tracing::info!(persisted, "Mine registry shut down");
        Ok(())
    }
}

/// Handle on one mine, obtained from [`MineRegistry::get`] or `create`.
///
/// A handle outlives a collapse; every call on it then reports
/// [`MiningError::MineNotFound`].
#[derive(Clone)]
pub struct MineHandle {
    slot: Arc<MineSlot>,
    shared: Arc<Shared>,
}

impl fmt::Debug for MineHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MineHandle")
            .field("id", &self.slot.id)
            .field("owner", &self.slot.owner)
            .finish()
    }
}

impl MineHandle {
    /// Mine id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> MineId {
        self.slot.id
    }

    /// Owner.
    #[inline]
    #[must_use]
    pub fn owner(&self) -> UserId {
        self.slot.owner
    }

    /// Current state of the mine.
    ///
    /// # Errors
    ///
    /// [`MiningError::MineNotFound`] once the mine has collapsed.
    pub fn snapshot(&self) -> MiningResult<MineSnapshot> {
        let cell = self.slot.cell.lock();
        if cell.mine.is_active() {
            Ok(cell.mine.snapshot())
        } else {
            Err(MiningError::MineNotFound(self.slot.id))
        }
    }

    /// Digs once.
    ///
    /// Digs on the same mine are serialized; the toll is debited before
    /// anything changes, and an [`MiningError::InsufficientFunds`] leaves the
    /// mine untouched.
    ///
    /// # Errors
    ///
    /// [`MiningError::MineNotFound`], [`MiningError::InsufficientFunds`] or
    /// gateway failures. Gateway failures after the debit are propagated
    /// without compensation.
    pub fn dig(&self, miner: UserId, tool: &Tool, boosts: &[&str]) -> MiningResult<DigRecord> {
        let shared = &self.shared;
        let gateway = &shared.gateway;
        let id = self.slot.id;

        let mut cell = self.slot.cell.lock();
        if !cell.mine.is_active() {
            return Err(MiningError::MineNotFound(id));
        }

        if !gateway.miner_exists(miner) {
            gateway.register_miner(miner)?;
        }
        let toll = cell.mine.fee();
        if toll > 0 {
            gateway.debit(miner, toll)?;
        }

        let MineCell { mine, rng } = &mut *cell;
        mine.accept_toll(toll);
        let record = mine.excavate(rng, miner, tool, boosts, toll, &shared.config, &shared.catalog);

        if record.collapsed {
            {
                let mut directory = shared.directory.write();
                directory.mines.remove(&id);
                directory.retired.insert(id);
            }
            gateway.record_collapse(&mine.snapshot(), miner)?;
            tracing::info!(
                mine = id,
                owner = mine.owner(),
                victim = miner,
                depth = mine.depth(),
                income = mine.income(),
                escaped = record.boosts.iter().any(|b| b == ESCAPE_TOKEN),
                "Mine collapsed"
            );
            if record.income > 0 {
                gateway.credit(miner, record.income)?;
            }
        } else {
            gateway.persist_mine(&mine.snapshot())?;
            gateway.append_dig_record(id, &record)?;
            if record.income > 0 {
                gateway.credit(miner, record.income)?;
            }
            tracing::debug!(
                mine = id,
                miner,
                toll,
                gained = record.depth_gained,
                depth = mine.depth(),
                income = record.income,
                rewards = record.rewards.len(),
                "Dig committed"
            );
        }

        Ok(record)
    }
}
