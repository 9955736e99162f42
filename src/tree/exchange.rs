//! Exchange - a per-thread cursor/mutator over one tree.
//!
//! An [`Exchange`] owns a [`Key`] and a [`Value`] workspace and is bound
//! to one (engine, volume, tree). It is the only place the MVCC layer,
//! the long-record engine and the B+-tree meet:
//!
//! - `fetch`/`next`/`previous` filter version chains against the caller's
//!   snapshot and inflate long values
//! - `store`/`remove` append versions (AntiValues for deletes), spilling
//!   oversized values into long-record chains
//! - traversal skips keys whose visible version is a tombstone
//!
//! An exchange is intended for a single thread: methods take `&mut self`,
//! so the borrow checker enforces it. Cloning yields an independent
//! handle over the same tree.

use std::sync::Arc;

use crate::buffer::BufferPool;
use crate::common::{Error, Result};
use crate::encoding::{Key, Value};
use crate::engine::EngineShared;
use crate::longrec;
use crate::mvcc::version::{self, VersionEntry};
use crate::mvcc::{Snapshot, TxnRecord, WriteRef, FLAG_ANTIVALUE, FLAG_LONG_RECORD};
use crate::tree::btree::{Tree, TreeOps};
use crate::tree::TreeStatistics;
use crate::volume::Volume;

/// A single-threaded cursor over one tree.
pub struct Exchange {
    shared: Arc<EngineShared>,
    volume: Arc<Volume>,
    tree: Arc<Tree>,
    pool: Arc<BufferPool>,
    key: Key,
    value: Value,
    txn: Option<Arc<TxnRecord>>,
}

impl Exchange {
    pub(crate) fn new(
        shared: Arc<EngineShared>,
        volume: Arc<Volume>,
        tree: Arc<Tree>,
        pool: Arc<BufferPool>,
    ) -> Self {
        Self {
            shared,
            volume,
            tree,
            pool,
            key: Key::new(),
            value: Value::new(),
            txn: None,
        }
    }

    fn ops(&self) -> TreeOps<'_> {
        TreeOps {
            pool: &self.pool,
            volume: &self.volume,
            tree: &self.tree,
            split_policy: self.shared.split_policy,
            join_policy: self.shared.join_policy,
            timestamps: &self.shared.timestamps,
        }
    }

    fn snapshot(&self) -> Snapshot<'_> {
        match &self.txn {
            Some(txn) => Snapshot {
                ts: txn.start_ts,
                txn_seq: Some(txn.seq),
                index: &self.shared.txn_index,
            },
            None => Snapshot {
                ts: self.shared.timestamps.current(),
                txn_seq: None,
                index: &self.shared.txn_index,
            },
        }
    }

    // ========================================================================
    // Key/value workspace
    // ========================================================================

    /// Position the cursor at `key`.
    pub fn to(&mut self, key: &Key) -> &mut Self {
        self.key.assign(key);
        self
    }

    /// The cursor's key.
    pub fn key(&self) -> &Key {
        &self.key
    }

    /// Mutable access to the cursor's key.
    pub fn key_mut(&mut self) -> &mut Key {
        &mut self.key
    }

    /// The cursor's value workspace.
    pub fn value(&self) -> &Value {
        &self.value
    }

    /// Mutable access to the cursor's value workspace.
    pub fn value_mut(&mut self) -> &mut Value {
        &mut self.value
    }

    /// Reset key and value to their initial state.
    pub fn clear(&mut self) -> &mut Self {
        self.key.clear();
        self.value.clear();
        self
    }

    /// Bind subsequent operations to a transaction.
    pub fn set_transaction(&mut self, txn: &crate::engine::Transaction) -> &mut Self {
        self.txn = Some(txn.record_arc());
        self
    }

    /// Detach from any transaction; operations auto-commit individually.
    pub fn clear_transaction(&mut self) -> &mut Self {
        self.txn = None;
        self
    }

    /// The tree this exchange is bound to.
    pub fn tree_name(&self) -> &str {
        self.tree.name()
    }

    /// Occupancy statistics for the bound tree.
    pub fn tree_statistics(&self) -> Result<TreeStatistics> {
        self.shared.check_open()?;
        self.ops().statistics()
    }

    // ========================================================================
    // Fetch
    // ========================================================================

    /// Fetch the value visible at the cursor's key into the value
    /// workspace. Returns whether a (non-tombstone) value was found.
    pub fn fetch(&mut self) -> Result<bool> {
        self.shared.check_open()?;
        self.require_real_key()?;

        let visible = self.visible_payload(self.key.encoded().to_vec())?;
        match visible {
            Some(payload) => {
                self.value.set_encoded(&payload);
                Ok(true)
            }
            None => {
                self.value.clear();
                Ok(false)
            }
        }
    }

    /// The visible payload for an encoded key, with long records inflated.
    fn visible_payload(&self, key: Vec<u8>) -> Result<Option<Vec<u8>>> {
        let Some(stored) = self.ops().fetch(&key)? else {
            return Ok(None);
        };
        self.resolve_stored(&stored)
    }

    // ========================================================================
    // Store / remove
    // ========================================================================

    /// Store the value workspace at the cursor's key.
    ///
    /// Within a transaction the version stays provisional until commit;
    /// without one the single operation commits immediately.
    pub fn store(&mut self) -> Result<()> {
        self.shared.check_writable()?;
        self.require_real_key()?;
        if !self.value.is_defined() {
            return Err(Error::InvalidValue(
                "store with an undefined value; use remove to delete".into(),
            ));
        }
        let payload = self.value.encoded().to_vec();
        self.write_version(payload, false)?;
        Ok(())
    }

    /// Append an AntiValue at the cursor's key.
    ///
    /// Returns whether the key was visible beforehand.
    pub fn remove(&mut self) -> Result<bool> {
        self.shared.check_writable()?;
        self.require_real_key()?;

        let existed = self.visible_payload(self.key.encoded().to_vec())?.is_some();
        if existed {
            self.write_version(Vec::new(), true)?;
        }
        Ok(existed)
    }

    /// Remove every key visible to this exchange's snapshot.
    ///
    /// Returns the number of keys removed.
    pub fn remove_all(&mut self) -> Result<u64> {
        self.shared.check_writable()?;

        let mut removed = 0u64;
        let mut cursor = Key::before();
        loop {
            let Some(next) = self.next_visible(cursor.encoded().to_vec(), false)? else {
                break;
            };
            cursor = Key::from_encoded(&next.0);
            self.key.assign(&cursor);
            self.write_version(Vec::new(), true)?;
            removed += 1;
        }
        self.key.clear();
        self.value.clear();
        Ok(removed)
    }

    /// Append one version at the cursor's key.
    fn write_version(&mut self, payload: Vec<u8>, antivalue: bool) -> Result<()> {
        if let Some(txn) = &self.txn {
            if txn.is_finished() {
                return Err(Error::Rollback(
                    "transaction has already committed or rolled back".into(),
                ));
            }
        }

        let op_ts = self.shared.timestamps.allocate();
        let key_bytes = self.key.encoded().to_vec();

        // Spill oversized values into a long-record chain first; only the
        // descriptor lands in the leaf.
        let (flags, payload) = if antivalue {
            (FLAG_ANTIVALUE, Vec::new())
        } else if payload.len() > longrec::threshold(self.pool.page_size()) {
            let descriptor = longrec::store_long(
                &self.pool,
                &self.volume,
                &self.shared.timestamps,
                &payload,
            )?;
            (FLAG_LONG_RECORD, descriptor)
        } else {
            (0u8, payload)
        };

        let handle = match &self.txn {
            Some(txn) => version::provisional_handle(txn.seq),
            None => op_ts,
        };
        let my_seq = self.txn.as_ref().map(|t| t.seq);
        let txn_index = &self.shared.txn_index;

        // The whole read-modify-write runs atomically under the tree
        // latch and the leaf pin, so a concurrent writer or a prune pass
        // can never interleave between the read and the store.
        let mut replaced_long: Vec<Vec<u8>> = Vec::new();
        let update_result = self.ops().update(&key_bytes, op_ts, |existing| {
            replaced_long.clear();
            let mut entries = match existing {
                Some(stored) => version::decode(stored)?,
                None => Vec::new(),
            };

            // A live version from another transaction is a write-write
            // conflict; the later writer loses immediately.
            for entry in &entries {
                if version::is_provisional(entry.handle) {
                    let seq = version::provisional_seq(entry.handle);
                    if Some(seq) != my_seq
                        && matches!(
                            txn_index.status(seq),
                            crate::mvcc::TxnStatus::Active { .. }
                        )
                    {
                        return Err(Error::Rollback(format!(
                            "write-write conflict with live transaction {}",
                            seq
                        )));
                    }
                }
            }

            // Re-storing within the same transaction replaces the earlier
            // provisional version; a replaced long chain is freed once the
            // update lands (nobody else could ever see it).
            entries.retain(|entry| {
                if entry.handle == handle {
                    if entry.is_long() {
                        replaced_long.push(entry.payload.clone());
                    }
                    false
                } else {
                    true
                }
            });
            entries.push(VersionEntry {
                handle,
                flags,
                payload: payload.clone(),
            });
            Ok(version::encode(&entries))
        });

        let outcome = match update_result {
            Ok(outcome) => outcome,
            Err(e) => {
                // The chain written ahead of a failed append would leak.
                if flags & FLAG_LONG_RECORD != 0 {
                    self.enqueue_chain_free(&payload)?;
                }
                return Err(e);
            }
        };

        for descriptor in replaced_long {
            self.enqueue_chain_free(&descriptor)?;
        }

        match &self.txn {
            Some(txn) => {
                let first_write = txn.record_write(WriteRef {
                    volume: self.volume.id(),
                    tree: self.tree.name().to_string(),
                    key: key_bytes,
                    leaf_hint: outcome.leaf,
                });
                if first_write {
                    self.shared.journal.write_txn_start(txn.seq, txn.start_ts)?;
                }
            }
            None => {
                // Auto-committed: the chain can collapse to primordial as
                // soon as the cleanup queue gets to it.
                self.shared.cleanup.enqueue(
                    crate::cleanup::CleanupAction::PruneVersionChain {
                        volume: self.volume.id(),
                        tree: self.tree.name().to_string(),
                        page: outcome.leaf,
                    },
                );
            }
        }
        Ok(())
    }

    fn enqueue_chain_free(&self, descriptor: &[u8]) -> Result<()> {
        for page in longrec::chain_pages(&self.pool, &self.volume, descriptor)? {
            self.shared
                .cleanup
                .enqueue(crate::cleanup::CleanupAction::FreePage {
                    volume: self.volume.id(),
                    page,
                });
        }
        Ok(())
    }

    // ========================================================================
    // Traversal
    // ========================================================================

    /// Advance to the next visible key. Returns `false` at the end.
    ///
    /// On success the cursor's key and value are updated; on failure the
    /// key is left at AFTER.
    pub fn next(&mut self) -> Result<bool> {
        self.shared.check_open()?;
        if self.key.is_after() {
            return Ok(false);
        }
        match self.next_visible(self.key.encoded().to_vec(), false)? {
            Some((key, payload)) => {
                self.key = Key::from_encoded(&key);
                self.value.set_encoded(&payload);
                Ok(true)
            }
            None => {
                self.key = Key::after();
                self.value.clear();
                Ok(false)
            }
        }
    }

    /// Step back to the previous visible key. Returns `false` at the
    /// beginning.
    pub fn previous(&mut self) -> Result<bool> {
        self.shared.check_open()?;
        if self.key.is_before() {
            return Ok(false);
        }
        let mut cursor = self.key.encoded().to_vec();
        loop {
            let Some((key, stored)) = self.ops().previous_entry(&cursor, false)? else {
                self.key = Key::before();
                self.value.clear();
                return Ok(false);
            };
            if let Some(payload) = self.resolve_stored(&stored)? {
                self.key = Key::from_encoded(&key);
                self.value.set_encoded(&payload);
                return Ok(true);
            }
            cursor = key;
        }
    }

    /// The next visible (key, payload) strictly after (or at, when
    /// `inclusive`) the given encoded key.
    fn next_visible(
        &self,
        mut cursor: Vec<u8>,
        inclusive: bool,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let mut include = inclusive;
        loop {
            let Some((key, stored)) = self.ops().next_entry(&cursor, include)? else {
                return Ok(None);
            };
            if let Some(payload) = self.resolve_stored(&stored)? {
                return Ok(Some((key, payload)));
            }
            cursor = key;
            include = false;
        }
    }

    /// Visibility-filter stored bytes and inflate long payloads.
    fn resolve_stored(&self, stored: &[u8]) -> Result<Option<Vec<u8>>> {
        let entries = version::decode(stored)?;
        let snap = self.snapshot();
        match version::visible(&entries, &snap) {
            Some(entry) if entry.is_antivalue() => Ok(None),
            Some(entry) if entry.is_long() => {
                Ok(Some(longrec::read_long(&self.pool, &self.volume, &entry.payload)?))
            }
            Some(entry) => Ok(Some(entry.payload.clone())),
            None => Ok(None),
        }
    }

    fn require_real_key(&self) -> Result<()> {
        if self.key.is_before() || self.key.is_after() {
            return Err(Error::InvalidKey(
                "operation requires a real key, not BEFORE/AFTER".into(),
            ));
        }
        Ok(())
    }
}

impl Clone for Exchange {
    /// An independent cursor over the same tree, bound to the same
    /// transaction (if any), with a fresh key/value workspace.
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            volume: Arc::clone(&self.volume),
            tree: Arc::clone(&self.tree),
            pool: Arc::clone(&self.pool),
            key: Key::new(),
            value: Value::new(),
            txn: self.txn.clone(),
        }
    }
}
