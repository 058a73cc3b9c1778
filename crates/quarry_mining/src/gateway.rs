//! # Economy Gateway
//!
//! Everything the mining core needs from the rest of the application:
//! wallets, persistence of mines and dig records, and miner statistics.
//!
//! Implementations must be thread safe. Each method is one atomic unit of
//! work; in particular [`EconomyGateway::record_collapse`] spans several
//! records and must be all-or-nothing.

use crate::error::MiningResult;
use crate::mine::{DigRecord, MineId, MineSnapshot, UserId};

/// Wallet and persistence collaborator of the mining core.
pub trait EconomyGateway: Send + Sync {
    /// Atomically removes `amount` from `user`'s wallet.
    ///
    /// # Errors
    ///
    /// [`crate::MiningError::InsufficientFunds`] if the balance is too low;
    /// the wallet is unchanged in that case.
    fn debit(&self, user: UserId, amount: u64) -> MiningResult<()>;

    /// Adds `amount` to `user`'s wallet.
    ///
    /// # Errors
    ///
    /// Persistence failures.
    fn credit(&self, user: UserId, amount: u64) -> MiningResult<()>;

    /// Stores a newly opened mine and counts it for its owner.
    ///
    /// # Errors
    ///
    /// Persistence failures.
    fn open_mine(&self, mine: &MineSnapshot) -> MiningResult<()> {
        self.persist_mine(mine)
    }

    /// Upserts the full mutable state of a mine.
    ///
    /// # Errors
    ///
    /// Persistence failures.
    fn persist_mine(&self, mine: &MineSnapshot) -> MiningResult<()>;

    /// Appends one entry to a mine's dig ledger.
    ///
    /// # Errors
    ///
    /// Persistence failures.
    fn append_dig_record(&self, mine_id: MineId, record: &DigRecord) -> MiningResult<()>;

    /// Books a collapse: owner and victim statistics, archive entry, and
    /// removal of the mine and its dig ledger. All or nothing.
    ///
    /// # Errors
    ///
    /// Persistence failures.
    fn record_collapse(&self, mine: &MineSnapshot, victim: UserId) -> MiningResult<()>;

    /// Whether `user` has a miner record.
    fn miner_exists(&self, user: UserId) -> bool;

    /// Creates a miner record. Idempotent.
    ///
    /// # Errors
    ///
    /// Persistence failures.
    fn register_miner(&self, user: UserId) -> MiningResult<()>;

    /// Mines that were active when the process last stopped.
    ///
    /// # Errors
    ///
    /// Persistence failures.
    fn active_mines(&self) -> MiningResult<Vec<MineSnapshot>>;

    /// Ids of collapsed mines. They are never handed out again.
    ///
    /// # Errors
    ///
    /// Persistence failures.
    fn retired_ids(&self) -> MiningResult<Vec<MineId>> {
        Ok(Vec::new())
    }

    /// Makes everything written so far durable.
    ///
    /// # Errors
    ///
    /// Persistence failures.
    fn flush(&self) -> MiningResult<()> {
        Ok(())
    }
}
