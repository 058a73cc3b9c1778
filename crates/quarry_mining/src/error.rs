//! # Mining Error Types
//!
//! All errors that can occur in the mining economy.
//!
//! A collapse is NOT an error: it is a normal terminal outcome of a dig and
//! is reported through [`crate::DigRecord::collapsed`].

use thiserror::Error;

use crate::mine::{MineId, UserId};

/// Errors that can occur in the mining economy.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MiningError {
    /// The miner cannot pay the toll. Nothing was mutated.
    #[error("insufficient funds: user {user} needs {required}, has {available}")]
    InsufficientFunds {
        /// The user that was charged.
        user: UserId,
        /// The toll required.
        required: u64,
        /// The balance available.
        available: u64,
    },

    /// Stale or invalid mine id (never existed, or already collapsed).
    #[error("mine not found: {0}")]
    MineNotFound(MineId),

    /// The owner already runs as many mines as their level allows.
    #[error("concurrent mine limit reached: user {owner} runs {active} of {limit}")]
    ConcurrentLimitExceeded {
        /// The owner that tried to open a mine.
        owner: UserId,
        /// Mines currently active for this owner.
        active: usize,
        /// Mines allowed at the owner's level.
        limit: usize,
    },

    /// The registry has no free id left in its bounded id space.
    #[error("mine id space exhausted: all {bound} ids in use or retired")]
    IdSpaceExhausted {
        /// Upper bound of the id space.
        bound: MineId,
    },

    /// The economy gateway failed while committing.
    #[error("persistence failed: {reason}")]
    Persistence {
        /// What went wrong.
        reason: String,
    },

    /// The write-ahead log could not be read or written.
    #[error("write-ahead log failure: {reason}")]
    Wal {
        /// What went wrong.
        reason: String,
    },

    /// Invalid configuration file.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl MiningError {
    /// Shorthand for a WAL error built from any displayable cause.
    pub(crate) fn wal(context: &str, cause: impl std::fmt::Display) -> Self {
        Self::Wal {
            reason: format!("{context}: {cause}"),
        }
    }
}

/// Result type for mining operations.
pub type MiningResult<T> = Result<T, MiningError>;
