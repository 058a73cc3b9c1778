//! # Ledger
//!
//! Reference [`EconomyGateway`]: wallets, persisted mines, dig sheets,
//! miner statistics and the collapse archive, journaled through the
//! [`WriteAheadLog`].
//!
//! ## Write Path
//!
//! ```text
//! gateway call ──> validate against books ──> WAL commit (fsync) ──> apply
//!                        (books locked for the whole sequence)
//! ```
//!
//! Replay after a restart runs the committed operations through the same
//! `apply`, so live and recovered state cannot drift apart.

use std::collections::BTreeMap;
use std::path::Path;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{MiningError, MiningResult};
use crate::gateway::EconomyGateway;
use crate::mine::{DigRecord, MineId, MineSnapshot, UserId};
use crate::wal::{WalOperation, WriteAheadLog};

/// Lifetime statistics of one user, as owner and as miner.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinerRecord {
    /// Digs performed.
    pub dig_count: u64,
    /// Deepest depth reached in any dig.
    pub deepest_reach: u64,
    /// Deepest depth one of this owner's mines reached before collapsing.
    pub deepest_keep: Option<u64>,
    /// Shallowest depth one of this owner's mines collapsed at.
    pub fastest_collapse: Option<u64>,
    /// Shallowest depth (+1) at which this miner caused a collapse.
    pub shallowest_collapse: Option<u64>,
    /// Collapses this miner caused.
    pub collapse_count: u64,
    /// Mines this owner opened.
    pub dev_count: u64,
    /// Highest toll income of a collapsed mine of this owner.
    pub max_income: u64,
    /// Lowest toll income of a collapsed mine of this owner.
    pub min_income: Option<u64>,
    /// Collapsed mines of this owner that earned nothing.
    pub break_even: u64,
}

/// Archive entry of a collapsed mine.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollapsedMine {
    /// Id the mine had. Never reused.
    pub mine_id: MineId,
    /// Owner.
    pub owner: UserId,
    /// Depth at collapse.
    pub depth: u64,
    /// Miner whose dig collapsed it.
    pub victim: UserId,
    /// Capital invested at opening.
    pub starting_capital: u64,
    /// Tolls collected over its life.
    pub income: u64,
}

#[derive(Default)]
struct Books {
    wallets: BTreeMap<UserId, u64>,
    miners: BTreeMap<UserId, MinerRecord>,
    mines: BTreeMap<MineId, MineSnapshot>,
    sheets: BTreeMap<MineId, Vec<DigRecord>>,
    collapsed: Vec<CollapsedMine>,
}

fn keep_min(slot: &mut Option<u64>, value: u64) {
    *slot = Some(slot.map_or(value, |current| current.min(value)));
}

impl Books {
    fn balance(&self, user: UserId) -> u64 {
        self.wallets.get(&user).copied().unwrap_or(0)
    }

    fn apply(&mut self, op: WalOperation) {
        match op {
            WalOperation::Credit { user, amount } => {
                let wallet = self.wallets.entry(user).or_default();
                *wallet = wallet.saturating_add(amount);
            }
            WalOperation::Debit { user, amount } => {
                let wallet = self.wallets.entry(user).or_default();
                *wallet = wallet.saturating_sub(amount);
            }
            WalOperation::RegisterMiner { user } => {
                self.miners.entry(user).or_default();
            }
            WalOperation::OpenMine { mine } => {
                self.miners.entry(mine.owner).or_default().dev_count += 1;
                self.mines.insert(mine.id, mine);
            }
            WalOperation::PersistMine { mine } => {
                self.mines.insert(mine.id, mine);
            }
            WalOperation::AppendDig { mine_id, record } => {
                let depth = self.mines.get(&mine_id).map_or(0, |m| m.depth);
                let miner = self.miners.entry(record.miner).or_default();
                miner.dig_count += 1;
                miner.deepest_reach = miner.deepest_reach.max(depth);
                self.sheets.entry(mine_id).or_default().push(record);
            }
            WalOperation::Collapse { mine, victim } => self.apply_collapse(&mine, victim),
            WalOperation::Image {
                wallets,
                miners,
                mines,
                sheets,
                collapsed,
            } => {
                *self = Self {
                    wallets,
                    miners,
                    mines,
                    sheets,
                    collapsed,
                };
            }
        }
    }

    fn apply_collapse(&mut self, mine: &MineSnapshot, victim: UserId) {
        let depth = mine.depth;

        let culprit = self.miners.entry(victim).or_default();
        culprit.collapse_count += 1;
        keep_min(&mut culprit.shallowest_collapse, depth + 1);

        let owner = self.miners.entry(mine.owner).or_default();
        owner.deepest_keep = Some(owner.deepest_keep.map_or(depth, |d| d.max(depth)));
        keep_min(&mut owner.fastest_collapse, depth);
        owner.max_income = owner.max_income.max(mine.income);
        keep_min(&mut owner.min_income, mine.income);
        if mine.income == 0 {
            owner.break_even += 1;
        }

        self.collapsed.push(CollapsedMine {
            mine_id: mine.id,
            owner: mine.owner,
            depth,
            victim,
            starting_capital: mine.starting_capital,
            income: mine.income,
        });
        self.mines.remove(&mine.id);
        self.sheets.remove(&mine.id);
    }

    fn image(&self) -> WalOperation {
        WalOperation::Image {
            wallets: self.wallets.clone(),
            miners: self.miners.clone(),
            mines: self.mines.clone(),
            sheets: self.sheets.clone(),
            collapsed: self.collapsed.clone(),
        }
    }
}

/// In-memory economy books with an optional write-ahead log.
pub struct Ledger {
    books: Mutex<Books>,
    wal: Option<WriteAheadLog>,
}

impl Ledger {
    /// A ledger that forgets everything when dropped.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            books: Mutex::new(Books::default()),
            wal: None,
        }
    }

    /// Opens a journaled ledger, replaying whatever the log holds.
    ///
    /// # Errors
    ///
    /// Returns [`MiningError::Wal`] if the log cannot be opened.
    pub fn open(path: impl AsRef<Path>) -> MiningResult<Self> {
        let (wal, committed) = WriteAheadLog::open(path)?;
        let replayed = committed.len();

        let mut books = Books::default();
        for op in committed {
            books.apply(op);
        }
        tracing::info!(
            replayed,
            mines = books.mines.len(),
            wallets = books.wallets.len(),
            "Ledger recovered"
        );

        Ok(Self {
            books: Mutex::new(books),
            wal: Some(wal),
        })
    }

    /// Journals `ops` as one transaction, then applies them.
    fn commit(&self, books: &mut Books, ops: Vec<WalOperation>) -> MiningResult<()> {
        if let Some(wal) = &self.wal {
            let mut txn = wal.begin_transaction();
            for op in &ops {
                txn.add_operation(op.clone());
            }
            txn.commit()?;
        }
        for op in ops {
            books.apply(op);
        }
        Ok(())
    }

    fn commit_one(&self, op: WalOperation) -> MiningResult<()> {
        let mut books = self.books.lock();
        self.commit(&mut books, vec![op])
    }

    /// Adds money to a wallet from outside the mining economy.
    ///
    /// # Errors
    ///
    /// Returns [`MiningError::Wal`] if journaling fails.
    pub fn deposit(&self, user: UserId, amount: u64) -> MiningResult<()> {
        self.commit_one(WalOperation::Credit { user, amount })
    }

    /// Current wallet balance. Unknown users have zero.
    #[must_use]
    pub fn balance(&self, user: UserId) -> u64 {
        self.books.lock().balance(user)
    }

    /// Lifetime statistics of a user, if they ever dug or opened a mine.
    #[must_use]
    pub fn miner(&self, user: UserId) -> Option<MinerRecord> {
        self.books.lock().miners.get(&user).cloned()
    }

    /// Last persisted state of an active mine.
    #[must_use]
    pub fn mine(&self, id: MineId) -> Option<MineSnapshot> {
        self.books.lock().mines.get(&id).cloned()
    }

    /// Dig ledger of an active mine, oldest first.
    #[must_use]
    pub fn dig_sheet(&self, id: MineId) -> Vec<DigRecord> {
        self.books.lock().sheets.get(&id).cloned().unwrap_or_default()
    }

    /// Collapse archive, oldest first.
    #[must_use]
    pub fn collapsed(&self) -> Vec<CollapsedMine> {
        self.books.lock().collapsed.clone()
    }

    /// Rewrites the journal as a single image of the current books.
    /// No-op for in-memory ledgers.
    ///
    /// # Errors
    ///
    /// Returns [`MiningError::Wal`] if the new journal cannot be written.
    pub fn compact(&self) -> MiningResult<()> {
        let Some(wal) = &self.wal else {
            return Ok(());
        };
        let books = self.books.lock();
        wal.compact(&[books.image()])?;
        tracing::info!(path = %wal.path().display(), "Ledger compacted");
        Ok(())
    }
}

impl EconomyGateway for Ledger {
    fn debit(&self, user: UserId, amount: u64) -> MiningResult<()> {
        let mut books = self.books.lock();
        let available = books.balance(user);
        if available < amount {
            return Err(MiningError::InsufficientFunds {
                user,
                required: amount,
                available,
            });
        }
        self.commit(&mut books, vec![WalOperation::Debit { user, amount }])
    }

    fn credit(&self, user: UserId, amount: u64) -> MiningResult<()> {
        self.commit_one(WalOperation::Credit { user, amount })
    }

    fn open_mine(&self, mine: &MineSnapshot) -> MiningResult<()> {
        self.commit_one(WalOperation::OpenMine { mine: mine.clone() })
    }

    fn persist_mine(&self, mine: &MineSnapshot) -> MiningResult<()> {
        self.commit_one(WalOperation::PersistMine { mine: mine.clone() })
    }

    fn append_dig_record(&self, mine_id: MineId, record: &DigRecord) -> MiningResult<()> {
        self.commit_one(WalOperation::AppendDig {
            mine_id,
            record: record.clone(),
        })
    }

    fn record_collapse(&self, mine: &MineSnapshot, victim: UserId) -> MiningResult<()> {
        self.commit_one(WalOperation::Collapse {
            mine: mine.clone(),
            victim,
        })
    }

    fn miner_exists(&self, user: UserId) -> bool {
        self.books.lock().miners.contains_key(&user)
    }

    fn register_miner(&self, user: UserId) -> MiningResult<()> {
        let mut books = self.books.lock();
        if books.miners.contains_key(&user) {
            return Ok(());
        }
        self.commit(&mut books, vec![WalOperation::RegisterMiner { user }])
    }

    fn active_mines(&self) -> MiningResult<Vec<MineSnapshot>> {
        Ok(self.books.lock().mines.values().cloned().collect())
    }

    fn retired_ids(&self) -> MiningResult<Vec<MineId>> {
        Ok(self.books.lock().collapsed.iter().map(|c| c.mine_id).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mine::MineState;
    use crate::reward::Rewards;
    use std::fs;
    use std::path::PathBuf;

    fn temp_wal_path() -> PathBuf {
        let id = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("test_quarry_ledger_{id}_{}.wal", std::process::id()))
    }

    fn mine(id: MineId, owner: UserId, depth: u64, income: u64) -> MineSnapshot {
        MineSnapshot {
            id,
            owner,
            location: 0,
            starting_capital: 400,
            stability: 30.0,
            oof_rate: 10.0,
            card_rate: 10.0,
            item_rate: 10.0,
            breadth: 1,
            fee: 20,
            depth,
            collapse_prob: 1e-5,
            income,
            distributions: BTreeMap::new(),
            status: Vec::new(),
            state: MineState::Active,
        }
    }

    fn record(mine_id: MineId, miner: UserId) -> DigRecord {
        DigRecord {
            mine_id,
            miner,
            timestamp_ms: 0,
            toll: 20,
            boosts: Vec::new(),
            steps: 3,
            depth_gained: 3,
            income: 0,
            rewards: Rewards::default(),
            collapsed: false,
            cooling: 9,
            breadth_delta: 0,
        }
    }

    #[test]
    fn test_debit_checks_funds() {
        let ledger = Ledger::in_memory();
        ledger.deposit(1, 50).unwrap();

        let err = ledger.debit(1, 80).unwrap_err();
        assert_eq!(
            err,
            MiningError::InsufficientFunds {
                user: 1,
                required: 80,
                available: 50
            }
        );
        assert_eq!(ledger.balance(1), 50);

        ledger.debit(1, 50).unwrap();
        assert_eq!(ledger.balance(1), 0);
    }

    #[test]
    fn test_open_mine_counts_dev() {
        let ledger = Ledger::in_memory();
        ledger.open_mine(&mine(1, 9, 0, 0)).unwrap();
        ledger.open_mine(&mine(2, 9, 0, 0)).unwrap();

        assert_eq!(ledger.miner(9).unwrap().dev_count, 2);
        assert_eq!(ledger.active_mines().unwrap().len(), 2);
    }

    #[test]
    fn test_append_dig_tracks_reach() {
        let ledger = Ledger::in_memory();
        ledger.open_mine(&mine(1, 9, 0, 0)).unwrap();
        ledger.persist_mine(&mine(1, 9, 12, 20)).unwrap();
        ledger.append_dig_record(1, &record(1, 4)).unwrap();

        let stats = ledger.miner(4).unwrap();
        assert_eq!(stats.dig_count, 1);
        assert_eq!(stats.deepest_reach, 12);
        assert_eq!(ledger.dig_sheet(1).len(), 1);
    }

    #[test]
    fn test_record_collapse_statistics() {
        let ledger = Ledger::in_memory();
        ledger.open_mine(&mine(1, 9, 0, 0)).unwrap();
        ledger.open_mine(&mine(2, 9, 0, 0)).unwrap();
        ledger.append_dig_record(1, &record(1, 4)).unwrap();

        ledger.record_collapse(&mine(1, 9, 30, 120), 4).unwrap();
        ledger.record_collapse(&mine(2, 9, 5, 0), 5).unwrap();

        let owner = ledger.miner(9).unwrap();
        assert_eq!(owner.deepest_keep, Some(30));
        assert_eq!(owner.fastest_collapse, Some(5));
        assert_eq!(owner.max_income, 120);
        assert_eq!(owner.min_income, Some(0));
        assert_eq!(owner.break_even, 1);

        let first = ledger.miner(4).unwrap();
        assert_eq!(first.collapse_count, 1);
        assert_eq!(first.shallowest_collapse, Some(31));

        assert!(ledger.mine(1).is_none());
        assert!(ledger.dig_sheet(1).is_empty());
        assert_eq!(ledger.retired_ids().unwrap(), vec![1, 2]);
        assert_eq!(ledger.collapsed()[0].victim, 4);
    }

    #[test]
    fn test_register_miner_is_idempotent() {
        let ledger = Ledger::in_memory();
        assert!(!ledger.miner_exists(3));
        ledger.register_miner(3).unwrap();
        ledger.register_miner(3).unwrap();
        assert!(ledger.miner_exists(3));
        assert_eq!(ledger.miner(3), Some(MinerRecord::default()));
    }

    #[test]
    fn test_replay_restores_books() {
        let path = temp_wal_path();
        {
            let ledger = Ledger::open(&path).unwrap();
            ledger.deposit(1, 500).unwrap();
            ledger.debit(1, 20).unwrap();
            ledger.open_mine(&mine(7, 2, 0, 0)).unwrap();
            ledger.persist_mine(&mine(7, 2, 4, 20)).unwrap();
            ledger.append_dig_record(7, &record(7, 1)).unwrap();
            ledger.open_mine(&mine(8, 2, 0, 0)).unwrap();
            ledger.record_collapse(&mine(8, 2, 0, 0), 1).unwrap();
        }
        {
            let ledger = Ledger::open(&path).unwrap();
            assert_eq!(ledger.balance(1), 480);
            assert_eq!(ledger.mine(7).unwrap().depth, 4);
            assert_eq!(ledger.dig_sheet(7).len(), 1);
            assert_eq!(ledger.miner(2).unwrap().dev_count, 2);
            assert_eq!(ledger.miner(1).unwrap().collapse_count, 1);
            assert_eq!(ledger.retired_ids().unwrap(), vec![8]);
        }
        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_compact_preserves_books() {
        let path = temp_wal_path();
        {
            let ledger = Ledger::open(&path).unwrap();
            for _ in 0..20 {
                ledger.deposit(1, 10).unwrap();
            }
            ledger.open_mine(&mine(3, 1, 0, 0)).unwrap();
            ledger.compact().unwrap();
            ledger.debit(1, 15).unwrap();
        }
        {
            let ledger = Ledger::open(&path).unwrap();
            assert_eq!(ledger.balance(1), 185);
            assert!(ledger.mine(3).is_some());
            assert_eq!(ledger.miner(1).unwrap().dev_count, 1);
        }
        fs::remove_file(&path).ok();
    }
}
