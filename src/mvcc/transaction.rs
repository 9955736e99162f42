//! Transaction status tracking.
//!
//! The [`TransactionIndex`] is the engine-wide table resolving provisional
//! version handles to a transaction's fate. Versions written by a
//! transaction carry its sequence number until cleanup rewrites them to
//! the commit timestamp; until then, every reader consults this table.
//!
//! Recovery rebuilds the table from the journal: commits past the last
//! checkpoint are reinstated, unfinished transactions are marked aborted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use log::warn;
use parking_lot::Mutex;

use crate::common::{PageId, Timestamp, VolumeId};

/// The fate of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnStatus {
    Active { start_ts: Timestamp },
    Committed { commit_ts: Timestamp },
    Aborted,
}

/// Engine-wide transaction status table.
///
/// Statuses are kept for the life of the process; an entry becomes dead
/// weight only after pruning has rewritten every version that references
/// it, and recovery rebuilds the table from the journal on restart.
pub struct TransactionIndex {
    statuses: Mutex<HashMap<u64, TxnStatus>>,
}

impl TransactionIndex {
    pub fn new() -> Self {
        Self {
            statuses: Mutex::new(HashMap::new()),
        }
    }

    /// Register a transaction at `begin`.
    pub fn register(&self, seq: u64, start_ts: Timestamp) {
        self.statuses
            .lock()
            .insert(seq, TxnStatus::Active { start_ts });
    }

    /// Mark a transaction committed.
    pub fn commit(&self, seq: u64, commit_ts: Timestamp) {
        self.statuses
            .lock()
            .insert(seq, TxnStatus::Committed { commit_ts });
    }

    /// Mark a transaction aborted.
    pub fn abort(&self, seq: u64) {
        self.statuses.lock().insert(seq, TxnStatus::Aborted);
    }

    /// Look up a transaction's status.
    ///
    /// An unknown sequence is treated as aborted: its versions must never
    /// become visible.
    pub fn status(&self, seq: u64) -> TxnStatus {
        match self.statuses.lock().get(&seq) {
            Some(&status) => status,
            None => {
                warn!("status lookup for unknown transaction {}", seq);
                TxnStatus::Aborted
            }
        }
    }

    /// The earliest start timestamp of any live transaction, or
    /// `default_ts` when none is live.
    ///
    /// Pruning may drop anything invisible to a snapshot at this floor.
    pub fn floor(&self, default_ts: Timestamp) -> Timestamp {
        self.statuses
            .lock()
            .values()
            .filter_map(|s| match s {
                TxnStatus::Active { start_ts } => Some(*start_ts),
                _ => None,
            })
            .min()
            .unwrap_or(default_ts)
    }

    /// Number of live transactions.
    pub fn live_count(&self) -> usize {
        self.statuses
            .lock()
            .values()
            .filter(|s| matches!(s, TxnStatus::Active { .. }))
            .count()
    }
}

impl Default for TransactionIndex {
    fn default() -> Self {
        Self::new()
    }
}

/// A key modified by a transaction, revisited at commit validation and
/// queued for pruning afterwards.
#[derive(Debug, Clone)]
pub struct WriteRef {
    pub volume: VolumeId,
    pub tree: String,
    pub key: Vec<u8>,
    /// Leaf the version was stored into; pruning starts here. Splits may
    /// move the key, which only makes the hint a harmless no-op.
    pub leaf_hint: PageId,
}

/// Per-transaction bookkeeping shared between the public handle and the
/// engine.
pub struct TxnRecord {
    pub seq: u64,
    pub start_ts: Timestamp,
    finished: AtomicBool,
    /// Whether a TXN_START record has been journaled (set at first write;
    /// read-only transactions never touch the journal).
    journaled: AtomicBool,
    writes: Mutex<Vec<WriteRef>>,
}

impl TxnRecord {
    pub fn new(seq: u64, start_ts: Timestamp) -> Self {
        Self {
            seq,
            start_ts,
            finished: AtomicBool::new(false),
            journaled: AtomicBool::new(false),
            writes: Mutex::new(Vec::new()),
        }
    }

    /// Record a write for commit validation; returns `true` the first time
    /// (the caller then journals TXN_START).
    pub fn record_write(&self, write: WriteRef) -> bool {
        self.writes.lock().push(write);
        !self.journaled.swap(true, Ordering::Relaxed)
    }

    /// Snapshot of the write set.
    pub fn writes(&self) -> Vec<WriteRef> {
        self.writes.lock().clone()
    }

    pub fn has_writes(&self) -> bool {
        !self.writes.lock().is_empty()
    }

    /// Mark the transaction finished; returns `false` if it already was.
    pub fn finish(&self) -> bool {
        !self.finished.swap(true, Ordering::Relaxed)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_lifecycle() {
        let index = TransactionIndex::new();
        index.register(1, 10);
        assert_eq!(index.status(1), TxnStatus::Active { start_ts: 10 });
        assert_eq!(index.live_count(), 1);

        index.commit(1, 20);
        assert_eq!(index.status(1), TxnStatus::Committed { commit_ts: 20 });
        assert_eq!(index.live_count(), 0);

        index.register(2, 30);
        index.abort(2);
        assert_eq!(index.status(2), TxnStatus::Aborted);
    }

    #[test]
    fn test_unknown_is_aborted() {
        let index = TransactionIndex::new();
        assert_eq!(index.status(999), TxnStatus::Aborted);
    }

    #[test]
    fn test_floor() {
        let index = TransactionIndex::new();
        assert_eq!(index.floor(100), 100);

        index.register(1, 40);
        index.register(2, 30);
        index.register(3, 50);
        assert_eq!(index.floor(100), 30);

        index.commit(2, 60);
        assert_eq!(index.floor(100), 40);
    }

    #[test]
    fn test_txn_record_write_tracking() {
        let record = TxnRecord::new(5, 100);
        assert!(!record.has_writes());

        let first = record.record_write(WriteRef {
            volume: VolumeId::new(0),
            tree: "t".into(),
            key: vec![1],
            leaf_hint: PageId::new(2),
        });
        assert!(first);

        let second = record.record_write(WriteRef {
            volume: VolumeId::new(0),
            tree: "t".into(),
            key: vec![2],
            leaf_hint: PageId::new(2),
        });
        assert!(!second);
        assert_eq!(record.writes().len(), 2);
    }

    #[test]
    fn test_txn_record_finish_once() {
        let record = TxnRecord::new(5, 100);
        assert!(record.finish());
        assert!(!record.finish());
        assert!(record.is_finished());
    }
}
