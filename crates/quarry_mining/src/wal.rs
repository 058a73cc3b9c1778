//! # Write-Ahead Log (WAL)
//!
//! **Crash-Safe Ledger Journal**
//!
//! Every change to the ledger is written here before it is applied in
//! memory. On restart the committed transactions are replayed in order:
//! - Committed transactions: returned for replay
//! - Torn transactions (no COMMIT before EOF or the next BEGIN): discarded
//!
//! ## Guarantees
//!
//! 1. **Durability**: Once `commit()` returns, data is on disk
//! 2. **Atomicity**: A transaction is written BEGIN..OPS..COMMIT under one
//!    lock, so transactions never interleave on disk
//! 3. **Compaction**: `compact()` atomically replaces the journal with a
//!    single transaction describing the current state
//!
//! ## Format
//!
//! ```text
//! [4 bytes: magic "QWAL"]
//! [4 bytes: version]
//! [8 bytes: LSN at last compaction]
//!
//! Entry format:
//! [8 bytes: LSN (Log Sequence Number)]
//! [1 byte: record type (BEGIN/OP/COMMIT)]
//! [4 bytes: payload length]
//! [N bytes: payload (bincode operation)]
//! [4 bytes: CRC32 of above]
//! ```

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{MiningError, MiningResult};
use crate::ledger::{CollapsedMine, MinerRecord};
use crate::mine::{DigRecord, MineId, MineSnapshot, UserId};

/// Magic bytes identifying a WAL file.
const WAL_MAGIC: &[u8; 4] = b"QWAL";

/// Current WAL format version.
const WAL_VERSION: u32 = 1;

/// Header length in bytes.
const HEADER_LEN: u64 = 16;

/// Upper bound on a single payload, to reject garbage lengths.
const MAX_PAYLOAD: usize = 64 * 1024 * 1024;

/// WAL record types.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// Begin a new transaction.
    Begin = 1,
    /// An operation within a transaction.
    Operation = 2,
    /// Commit the transaction (durable).
    Commit = 3,
}

impl RecordType {
    /// Converts from u8.
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::Begin),
            2 => Some(Self::Operation),
            3 => Some(Self::Commit),
            _ => None,
        }
    }
}

/// Types of operations that can be logged.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum WalOperation {
    /// Money added to a wallet.
    Credit {
        /// Wallet owner.
        user: UserId,
        /// Amount added.
        amount: u64,
    },
    /// Money removed from a wallet.
    Debit {
        /// Wallet owner.
        user: UserId,
        /// Amount removed.
        amount: u64,
    },
    /// First sighting of a miner.
    RegisterMiner {
        /// The miner.
        user: UserId,
    },
    /// A mine was opened.
    OpenMine {
        /// Its initial state.
        mine: MineSnapshot,
    },
    /// A mine's state changed.
    PersistMine {
        /// Its new state.
        mine: MineSnapshot,
    },
    /// A dig was committed.
    AppendDig {
        /// The mine dug.
        mine_id: MineId,
        /// What happened.
        record: DigRecord,
    },
    /// A mine collapsed.
    Collapse {
        /// Its final state.
        mine: MineSnapshot,
        /// Who collapsed it.
        victim: UserId,
    },
    /// Complete ledger state, written by compaction.
    Image {
        /// Wallet balances.
        wallets: BTreeMap<UserId, u64>,
        /// Miner statistics.
        miners: BTreeMap<UserId, MinerRecord>,
        /// Active mines.
        mines: BTreeMap<MineId, MineSnapshot>,
        /// Dig ledgers of active mines.
        sheets: BTreeMap<MineId, Vec<DigRecord>>,
        /// Collapse archive.
        collapsed: Vec<CollapsedMine>,
    },
}

impl WalOperation {
    /// Serializes the operation to bytes.
    fn serialize(&self) -> MiningResult<Vec<u8>> {
        bincode::serialize(self).map_err(|e| MiningError::wal("encode failed", e))
    }

    /// Deserializes an operation from bytes.
    fn deserialize(data: &[u8]) -> Option<Self> {
        bincode::deserialize(data).ok()
    }
}

/// A WAL record on disk.
#[derive(Clone, Debug)]
pub struct WalRecord {
    /// Log Sequence Number (unique, monotonic).
    pub lsn: u64,
    /// Record type.
    pub record_type: RecordType,
    /// Payload data.
    pub payload: Vec<u8>,
}

/// Transaction handle for grouping operations.
///
/// Operations are buffered and only reach the disk on `commit()`. Dropping
/// the handle discards them.
pub struct Transaction<'a> {
    /// Reference to the WAL.
    wal: &'a WriteAheadLog,
    /// Operations in this transaction.
    operations: Vec<WalOperation>,
}

impl Transaction<'_> {
    /// Adds an operation to the transaction.
    pub fn add_operation(&mut self, op: WalOperation) {
        self.operations.push(op);
    }

    /// Writes and syncs the transaction. Returns the LSN of its BEGIN.
    ///
    /// # Errors
    ///
    /// Returns [`MiningError::Wal`] if encoding or any write fails.
    pub fn commit(self) -> MiningResult<u64> {
        let payloads = self
            .operations
            .iter()
            .map(WalOperation::serialize)
            .collect::<MiningResult<Vec<_>>>()?;

        let mut file = self.wal.file.lock();
        let begin = self.wal.write_record(&mut *file, RecordType::Begin, &[])?;
        for payload in &payloads {
            self.wal.write_record(&mut *file, RecordType::Operation, payload)?;
        }
        self.wal.write_record(&mut *file, RecordType::Commit, &[])?;
        WriteAheadLog::sync(&mut file)?;

        Ok(begin)
    }
}

/// Write-Ahead Log for crash-safe ledger updates.
pub struct WriteAheadLog {
    /// Path to the WAL file.
    path: PathBuf,
    /// Next Log Sequence Number.
    current_lsn: AtomicU64,
    /// File handle (protected by mutex for writes).
    file: Mutex<BufWriter<File>>,
}

impl WriteAheadLog {
    /// Opens or creates a WAL file and recovers it.
    ///
    /// Returns the log and the committed operations, oldest first.
    ///
    /// # Errors
    ///
    /// Returns [`MiningError::Wal`] if the file cannot be opened or carries a
    /// foreign header.
    pub fn open(path: impl AsRef<Path>) -> MiningResult<(Self, Vec<WalOperation>)> {
        let path = path.as_ref().to_path_buf();

        let is_new = fs::metadata(&path).map(|m| m.len() == 0).unwrap_or(true);
        if is_new {
            let mut file = File::create(&path).map_err(|e| MiningError::wal("create failed", e))?;
            Self::write_header(&mut file, 0)?;
            file.sync_all().map_err(|e| MiningError::wal("sync failed", e))?;
        }

        let (committed, next_lsn, valid_len) = Self::recover(&path)?;

        let file = OpenOptions::new()
            .append(true)
            .open(&path)
            .map_err(|e| MiningError::wal("open failed", e))?;
        // Cut a torn tail so new records follow the last good one.
        file.set_len(valid_len)
            .map_err(|e| MiningError::wal("truncate failed", e))?;

        let wal = Self {
            path,
            current_lsn: AtomicU64::new(next_lsn),
            file: Mutex::new(BufWriter::new(file)),
        };
        Ok((wal, committed))
    }

    /// Path of the journal file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Next LSN that will be assigned.
    #[must_use]
    pub fn next_lsn(&self) -> u64 {
        self.current_lsn.load(Ordering::SeqCst)
    }

    /// Begins a new transaction.
    #[must_use]
    pub fn begin_transaction(&self) -> Transaction<'_> {
        Transaction {
            wal: self,
            operations: Vec::new(),
        }
    }

    /// Replaces the journal with a single committed transaction holding
    /// `ops`. The swap is a rename, so a crash leaves either the old or the
    /// new journal.
    ///
    /// # Errors
    ///
    /// Returns [`MiningError::Wal`] if the new journal cannot be written.
    pub fn compact(&self, ops: &[WalOperation]) -> MiningResult<()> {
        let payloads = ops
            .iter()
            .map(WalOperation::serialize)
            .collect::<MiningResult<Vec<_>>>()?;

        let mut file = self.file.lock();
        file.flush().map_err(|e| MiningError::wal("flush failed", e))?;

        let tmp_path = self.path.with_extension("compact");
        let tmp = File::create(&tmp_path).map_err(|e| MiningError::wal("create failed", e))?;
        let mut writer = BufWriter::new(tmp);
        Self::write_header(&mut writer, self.next_lsn())?;
        self.write_record(&mut writer, RecordType::Begin, &[])?;
        for payload in &payloads {
            self.write_record(&mut writer, RecordType::Operation, payload)?;
        }
        self.write_record(&mut writer, RecordType::Commit, &[])?;
        Self::sync(&mut writer)?;
        drop(writer);

        fs::rename(&tmp_path, &self.path).map_err(|e| MiningError::wal("rename failed", e))?;

        let reopened = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .map_err(|e| MiningError::wal("reopen failed", e))?;
        *file = BufWriter::new(reopened);
        Ok(())
    }

    fn write_header(writer: &mut impl Write, lsn: u64) -> MiningResult<()> {
        writer
            .write_all(WAL_MAGIC)
            .and_then(|()| writer.write_all(&WAL_VERSION.to_le_bytes()))
            .and_then(|()| writer.write_all(&lsn.to_le_bytes()))
            .map_err(|e| MiningError::wal("header write failed", e))
    }

    /// Writes a record and returns its LSN.
    fn write_record(
        &self,
        writer: &mut impl Write,
        record_type: RecordType,
        payload: &[u8],
    ) -> MiningResult<u64> {
        let lsn = self.current_lsn.fetch_add(1, Ordering::SeqCst);
        let len = u32::try_from(payload.len())
            .map_err(|_| MiningError::wal("payload too large", payload.len()))?;

        let mut crc = crc32fast::Hasher::new();
        crc.update(&lsn.to_le_bytes());
        crc.update(&[record_type as u8]);
        crc.update(&len.to_le_bytes());
        crc.update(payload);

        writer
            .write_all(&lsn.to_le_bytes())
            .and_then(|()| writer.write_all(&[record_type as u8]))
            .and_then(|()| writer.write_all(&len.to_le_bytes()))
            .and_then(|()| writer.write_all(payload))
            .and_then(|()| writer.write_all(&crc.finalize().to_le_bytes()))
            .map_err(|e| MiningError::wal("write failed", e))?;

        Ok(lsn)
    }

    /// Flushes the buffer and fsyncs.
    fn sync(file: &mut BufWriter<File>) -> MiningResult<()> {
        file.flush().map_err(|e| MiningError::wal("flush failed", e))?;
        file.get_ref()
            .sync_all()
            .map_err(|e| MiningError::wal("sync failed", e))
    }

    /// Scans the journal.
    ///
    /// Returns committed operations, the next LSN, and the byte length of
    /// the valid prefix.
    fn recover(path: &Path) -> MiningResult<(Vec<WalOperation>, u64, u64)> {
        let file = File::open(path).map_err(|e| MiningError::wal("open for recovery failed", e))?;
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 4];
        reader
            .read_exact(&mut magic)
            .map_err(|e| MiningError::wal("header read failed", e))?;
        if &magic != WAL_MAGIC {
            return Err(MiningError::wal("recovery", "invalid WAL magic"));
        }

        let mut version_bytes = [0u8; 4];
        reader
            .read_exact(&mut version_bytes)
            .map_err(|e| MiningError::wal("header read failed", e))?;
        let version = u32::from_le_bytes(version_bytes);
        if version != WAL_VERSION {
            return Err(MiningError::wal("unsupported WAL version", version));
        }

        let mut lsn_bytes = [0u8; 8];
        reader
            .read_exact(&mut lsn_bytes)
            .map_err(|e| MiningError::wal("header read failed", e))?;
        let mut next_lsn = u64::from_le_bytes(lsn_bytes);

        let mut committed = Vec::new();
        let mut pending: Option<Vec<WalOperation>> = None;
        let mut valid_len = HEADER_LEN;
        let mut offset = HEADER_LEN;
        let mut torn = 0usize;

        while let Some(record) = Self::read_record(&mut reader) {
            offset += 17 + record.payload.len() as u64;
            next_lsn = next_lsn.max(record.lsn + 1);

            match record.record_type {
                RecordType::Begin => {
                    if pending.replace(Vec::new()).is_some() {
                        torn += 1;
                    }
                }
                RecordType::Operation => match (&mut pending, WalOperation::deserialize(&record.payload)) {
                    (Some(ops), Some(op)) => ops.push(op),
                    _ => {
                        torn += usize::from(pending.take().is_some());
                    }
                },
                RecordType::Commit => {
                    if let Some(ops) = pending.take() {
                        committed.extend(ops);
                        valid_len = offset;
                    }
                }
            }
        }

        if pending.is_some() {
            torn += 1;
        }
        if torn > 0 {
            tracing::warn!(torn, path = %path.display(), "WAL recovery discarded uncommitted transactions");
        }

        Ok((committed, next_lsn, valid_len))
    }

    /// Reads a single record. `None` at end of file or on corruption.
    fn read_record(reader: &mut impl Read) -> Option<WalRecord> {
        let mut head = [0u8; 13];
        if let Err(e) = reader.read_exact(&mut head) {
            if e.kind() != ErrorKind::UnexpectedEof {
                tracing::warn!(error = %e, "WAL read failed");
            }
            return None;
        }
        let lsn = u64::from_le_bytes(head[0..8].try_into().ok()?);
        let record_type = RecordType::from_u8(head[8])?;
        let payload_len = u32::from_le_bytes(head[9..13].try_into().ok()?) as usize;
        if payload_len > MAX_PAYLOAD {
            return None;
        }

        let mut payload = vec![0u8; payload_len];
        reader.read_exact(&mut payload).ok()?;

        let mut crc_bytes = [0u8; 4];
        reader.read_exact(&mut crc_bytes).ok()?;

        let mut crc = crc32fast::Hasher::new();
        crc.update(&head);
        crc.update(&payload);
        if u32::from_le_bytes(crc_bytes) != crc.finalize() {
            tracing::warn!(lsn, "WAL CRC mismatch, stopping replay");
            return None;
        }

        Some(WalRecord {
            lsn,
            record_type,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_wal_path() -> PathBuf {
        let id = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("test_quarry_wal_{id}_{}.wal", std::process::id()))
    }

    #[test]
    fn test_wal_create_and_open() {
        let path = temp_wal_path();
        {
            let (_wal, ops) = WriteAheadLog::open(&path).unwrap();
            assert!(ops.is_empty());
        }
        assert!(path.exists());
        assert_eq!(fs::metadata(&path).unwrap().len(), HEADER_LEN);
        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_wal_commit_and_replay() {
        let path = temp_wal_path();
        {
            let (wal, _) = WriteAheadLog::open(&path).unwrap();
            let mut txn = wal.begin_transaction();
            txn.add_operation(WalOperation::Credit { user: 1, amount: 100 });
            txn.add_operation(WalOperation::Debit { user: 1, amount: 30 });
            txn.commit().unwrap();

            let mut txn = wal.begin_transaction();
            txn.add_operation(WalOperation::RegisterMiner { user: 2 });
            txn.commit().unwrap();
        }
        {
            let (wal, ops) = WriteAheadLog::open(&path).unwrap();
            assert_eq!(
                ops,
                vec![
                    WalOperation::Credit { user: 1, amount: 100 },
                    WalOperation::Debit { user: 1, amount: 30 },
                    WalOperation::RegisterMiner { user: 2 },
                ]
            );
            // 2 transactions: BEGIN + 2 OPS + COMMIT, BEGIN + OP + COMMIT
            assert_eq!(wal.next_lsn(), 7);
        }
        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_wal_dropped_transaction_is_not_written() {
        let path = temp_wal_path();
        {
            let (wal, _) = WriteAheadLog::open(&path).unwrap();
            let mut txn = wal.begin_transaction();
            txn.add_operation(WalOperation::Credit { user: 1, amount: 5 });
            drop(txn);
        }
        let (_wal, ops) = WriteAheadLog::open(&path).unwrap();
        assert!(ops.is_empty());
        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_wal_torn_tail_is_discarded() {
        let path = temp_wal_path();
        {
            let (wal, _) = WriteAheadLog::open(&path).unwrap();
            let mut txn = wal.begin_transaction();
            txn.add_operation(WalOperation::Credit { user: 1, amount: 5 });
            txn.commit().unwrap();
        }
        let good_len = fs::metadata(&path).unwrap().len();
        {
            // Half a record of garbage, as if the process died mid-write.
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[0xAB; 9]).unwrap();
        }
        {
            let (wal, ops) = WriteAheadLog::open(&path).unwrap();
            assert_eq!(ops, vec![WalOperation::Credit { user: 1, amount: 5 }]);
            assert_eq!(fs::metadata(&path).unwrap().len(), good_len);

            let mut txn = wal.begin_transaction();
            txn.add_operation(WalOperation::Credit { user: 1, amount: 7 });
            txn.commit().unwrap();
        }
        let (_wal, ops) = WriteAheadLog::open(&path).unwrap();
        assert_eq!(ops.len(), 2);
        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_wal_compact_replaces_history() {
        let path = temp_wal_path();
        {
            let (wal, _) = WriteAheadLog::open(&path).unwrap();
            for amount in 0..10 {
                let mut txn = wal.begin_transaction();
                txn.add_operation(WalOperation::Credit { user: 1, amount });
                txn.commit().unwrap();
            }
            wal.compact(&[WalOperation::Credit { user: 1, amount: 45 }]).unwrap();

            let mut txn = wal.begin_transaction();
            txn.add_operation(WalOperation::Debit { user: 1, amount: 5 });
            txn.commit().unwrap();
        }
        let (_wal, ops) = WriteAheadLog::open(&path).unwrap();
        assert_eq!(
            ops,
            vec![
                WalOperation::Credit { user: 1, amount: 45 },
                WalOperation::Debit { user: 1, amount: 5 },
            ]
        );
        fs::remove_file(&path).ok();
    }

    #[test]
    fn test_wal_rejects_foreign_file() {
        let path = temp_wal_path();
        fs::write(&path, b"NOPE0000000000000000").unwrap();
        assert!(matches!(WriteAheadLog::open(&path), Err(MiningError::Wal { .. })));
        fs::remove_file(&path).ok();
    }
}
