//! B+-tree operations over the buffer pool.
//!
//! A [`Tree`] is a named B+-tree in a volume. Its root page id is stable
//! for the life of the tree: a root split reparents the content into two
//! fresh children and turns the root into an index page in place, and a
//! root collapse pulls the last child's content back up. Leaf pages form a
//! singly linked chain in key order through their right-sibling field.
//!
//! Index pages hold (separator, child-id) entries; entry 0 carries the
//! empty key and covers everything below entry 1's separator. Leaves hold
//! (key, stored-value) records; the tree is agnostic to what the stored
//! bytes mean (the MVCC layer interprets them).
//!
//! Structure changes (splits, joins, pruning) run under the tree's
//! exclusive latch; plain reads and in-page updates share it.

use std::sync::Arc;

use log::{debug, trace};
use parking_lot::RwLock;

use crate::buffer::{BufferPool, PageWriteGuard};
use crate::common::{Error, PageId, Result, Timestamp, TimestampAllocator, VolumeId};
use crate::mvcc::TransactionIndex;
use crate::page::{Page, PageType, KEYBLOCK_LENGTH};
use crate::volume::Volume;

use super::policy::{JoinPolicy, Sequence, SplitPolicy};

/// Maximum encoded key length accepted by the tree.
pub const MAX_KEY_LENGTH: usize = 2047;

/// A leaf joins with a sibling when its occupancy falls below this
/// fraction of capacity (and the join policy accepts the merge).
const JOIN_TRIGGER_DIVISOR: usize = 3;

/// A named B+-tree within a volume.
pub struct Tree {
    volume_id: VolumeId,
    name: String,
    root: PageId,
    /// Structure latch: exclusive for splits/joins/pruning, shared for
    /// reads and in-page updates.
    latch: RwLock<()>,
}

impl Tree {
    pub fn new(volume_id: VolumeId, name: impl Into<String>, root: PageId) -> Self {
        Self {
            volume_id,
            name: name.into(),
            root,
            latch: RwLock::new(()),
        }
    }

    #[inline]
    pub fn volume_id(&self) -> VolumeId {
        self.volume_id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The tree's root page id (stable for the tree's lifetime).
    #[inline]
    pub fn root(&self) -> PageId {
        self.root
    }

    #[inline]
    pub(crate) fn latch(&self) -> &RwLock<()> {
        &self.latch
    }
}

/// Occupancy summary used by tests and monitoring.
#[derive(Debug, Clone, Default)]
pub struct TreeStatistics {
    /// Number of leaf pages.
    pub leaf_count: usize,
    /// Per-leaf used-space fraction, left to right.
    pub leaf_fill: Vec<f64>,
    /// Tree height (1 for a lone leaf root).
    pub height: usize,
}

/// Where a store landed.
#[derive(Debug, Clone, Copy)]
pub struct StoreOutcome {
    /// Leaf page the entry ended up in.
    pub leaf: PageId,
    /// Whether an existing entry was replaced.
    pub replaced: bool,
}

/// Result of pruning one leaf page.
#[derive(Debug, Default)]
pub struct PruneResult {
    /// Long-record descriptors whose chains must be freed.
    pub freed_long: Vec<Vec<u8>>,
    /// Records whose version chains changed.
    pub pruned_records: usize,
    /// Whether the page ended up empty (and a join was attempted).
    pub emptied: bool,
}

/// A borrowed bundle of everything a tree operation needs.
///
/// Exchanges construct one of these per operation; nothing here owns
/// anything, so building it is free.
pub(crate) struct TreeOps<'a> {
    pub pool: &'a BufferPool,
    pub volume: &'a Arc<Volume>,
    pub tree: &'a Tree,
    pub split_policy: SplitPolicy,
    pub join_policy: JoinPolicy,
    pub timestamps: &'a TimestampAllocator,
}

impl<'a> TreeOps<'a> {
    // ========================================================================
    // Fetch
    // ========================================================================

    /// The stored bytes for `key`, if present.
    pub fn fetch(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let _latch = self.tree.latch().read();
        let leaf = self.descend_to_leaf(key)?;
        let guard = self.pool.get_shared(self.tree.volume_id(), leaf)?;
        match guard.search(key) {
            Ok(index) => Ok(Some(guard.value_at(index).to_vec())),
            Err(_) => Ok(None),
        }
    }

    // ========================================================================
    // Store
    // ========================================================================

    /// Insert or replace the stored bytes for `key`.
    pub fn store(&self, key: &[u8], stored: &[u8], ts: Timestamp) -> Result<StoreOutcome> {
        self.update(key, ts, |_| Ok(stored.to_vec()))
    }

    /// Atomically read, transform and store the bytes for `key`.
    ///
    /// `compute` receives the current stored bytes (None if absent) and
    /// returns the replacement; it runs under the latch and the leaf's
    /// exclusive pin, so no concurrent writer or pruner can slip between
    /// the read and the write. It may be invoked a second time if the
    /// result forces a split.
    pub fn update<F>(&self, key: &[u8], ts: Timestamp, mut compute: F) -> Result<StoreOutcome>
    where
        F: FnMut(Option<&[u8]>) -> Result<Vec<u8>>,
    {
        if key.is_empty() || key.len() > MAX_KEY_LENGTH {
            return Err(Error::InvalidKey(format!(
                "key length {} outside 1..={}",
                key.len(),
                MAX_KEY_LENGTH
            )));
        }

        // Optimistic pass: shared latch, in-page update only.
        {
            let _latch = self.tree.latch().read();
            let leaf = self.descend_to_leaf(key)?;
            let mut guard = self.pool.get_exclusive(self.tree.volume_id(), leaf)?;
            match guard.search(key) {
                Ok(index) => {
                    let existing = guard.value_at(index).to_vec();
                    let stored = compute(Some(&existing))?;
                    if guard.replace_value(index, &stored) {
                        guard.stamp(ts);
                        return Ok(StoreOutcome {
                            leaf,
                            replaced: true,
                        });
                    }
                }
                Err(index) => {
                    let stored = compute(None)?;
                    if guard.insert_record(index, key, &stored) {
                        guard.stamp(ts);
                        return Ok(StoreOutcome {
                            leaf,
                            replaced: false,
                        });
                    }
                }
            }
        }

        // Split path: recompute under the exclusive latch, which keeps
        // every other writer and the pruner out until the store lands.
        let _latch = self.tree.latch().write();
        let (ancestors, leaf) = self.descend_path(key)?;
        let (stored, replaced) = {
            let guard = self.pool.get_shared(self.tree.volume_id(), leaf)?;
            match guard.search(key) {
                Ok(index) => {
                    let existing = guard.value_at(index).to_vec();
                    (compute(Some(&existing))?, true)
                }
                Err(_) => (compute(None)?, false),
            }
        };
        self.insert_splitting(&ancestors, leaf, key, &stored, ts)?;
        Ok(StoreOutcome { leaf, replaced })
    }

    /// Insert (key, value) into `page_id`, splitting as needed; ancestors
    /// is the path from the root down to the page's parent.
    ///
    /// Caller holds the exclusive latch.
    fn insert_splitting(
        &self,
        ancestors: &[PageId],
        page_id: PageId,
        key: &[u8],
        value: &[u8],
        ts: Timestamp,
    ) -> Result<()> {
        let volume_id = self.tree.volume_id();
        let mut guard = self.pool.get_exclusive(volume_id, page_id)?;
        let capacity = guard.capacity();

        if Page::entry_size(key.len(), value.len()) > capacity / 2 {
            return Err(Error::InvalidValue(format!(
                "entry of {} bytes cannot fit a page of capacity {}",
                Page::entry_size(key.len(), value.len()),
                capacity
            )));
        }

        let (position, replace) = match guard.search(key) {
            Ok(index) => {
                if guard.replace_value(index, value) {
                    guard.stamp(ts);
                    return Ok(());
                }
                (index, true)
            }
            Err(index) => {
                if guard.insert_record(index, key, value) {
                    guard.stamp(ts);
                    return Ok(());
                }
                (index, false)
            }
        };

        // Gather every entry plus the incoming one.
        let count = guard.key_block_count();
        let mut entries: Vec<(Vec<u8>, Vec<u8>)> = Vec::with_capacity(count + 1);
        for i in 0..count {
            entries.push((guard.key_at(i).to_vec(), guard.value_at(i).to_vec()));
        }
        if replace {
            entries[position].1 = value.to_vec();
        } else {
            entries.insert(position, (key.to_vec(), value.to_vec()));
        }

        let sequence = if replace {
            Sequence::None
        } else if position == count {
            Sequence::Forward
        } else if position == 0 && count > 0 {
            Sequence::Reverse
        } else {
            Sequence::None
        };

        let split = self.choose_split(&entries, position, replace, sequence, capacity);
        let level = guard.level();
        let page_type = guard.page_type();
        trace!(
            "split {} at {}/{} entries (policy {:?}, seq {:?})",
            page_id,
            split,
            entries.len(),
            self.split_policy,
            sequence
        );

        if ancestors.is_empty() {
            // Root split: the root page id is stable, so distribute the
            // entries into two fresh children and index them in place.
            let old_sibling = guard.right_sibling();
            debug_assert!(!old_sibling.is_valid());

            let mut right = self.pool.get_for_new(self.volume, page_type, level, ts)?;
            let right_id = right.page_id();
            fill_page(&mut right, &entries[split..]);
            right.set_right_sibling(old_sibling);
            right.stamp(ts);
            drop(right);

            let mut left = self.pool.get_for_new(self.volume, page_type, level, ts)?;
            let left_id = left.page_id();
            fill_page(&mut left, &entries[..split]);
            left.set_right_sibling(right_id);
            left.stamp(ts);
            drop(left);

            guard.init(PageType::Index, level + 1, page_id);
            let inserted = guard.insert_record(0, b"", &left_id.0.to_le_bytes())
                && guard.insert_record(1, &entries[split].0, &right_id.0.to_le_bytes());
            debug_assert!(inserted);
            guard.stamp(ts);
            debug!(
                "root {} split into {} | {} at level {}",
                page_id, left_id, right_id, level
            );
            return Ok(());
        }

        // Non-root: current page keeps the left half, a new right sibling
        // takes the rest, and the separator ascends.
        let mut right = self.pool.get_for_new(self.volume, page_type, level, ts)?;
        let right_id = right.page_id();
        fill_page(&mut right, &entries[split..]);
        right.set_right_sibling(guard.right_sibling());
        right.stamp(ts);
        drop(right);

        guard.init(page_type, level, page_id);
        fill_page(&mut guard, &entries[..split]);
        guard.set_right_sibling(right_id);
        guard.stamp(ts);
        drop(guard);

        let separator = entries[split].0.clone();
        let parent = *ancestors.last().unwrap();
        self.insert_splitting(
            &ancestors[..ancestors.len() - 1],
            parent,
            &separator,
            &right_id.0.to_le_bytes(),
            ts,
        )
    }

    /// Score every candidate split position and pick the best.
    fn choose_split(
        &self,
        entries: &[(Vec<u8>, Vec<u8>)],
        insert_position: usize,
        replace: bool,
        sequence: Sequence,
        capacity: usize,
    ) -> usize {
        let costs: Vec<usize> = entries
            .iter()
            .map(|(k, v)| Page::entry_size(k.len(), v.len()))
            .collect();
        let total: usize = costs.iter().sum();

        let insert_at = insert_position * KEYBLOCK_LENGTH;
        let mut best = 0usize;
        let mut best_score = 0usize;
        let mut left = 0usize;
        for split in 1..entries.len() {
            left += costs[split - 1];
            let right = total - left;
            let score = self.split_policy.split_fit(
                sequence,
                insert_at,
                split * KEYBLOCK_LENGTH,
                replace,
                left,
                right,
                capacity,
                best_score,
            );
            if score > best_score {
                best_score = score;
                best = split;
            }
        }

        if best_score > 0 {
            return best;
        }

        // Every candidate overflowed a side under the policy; fall back to
        // the most balanced cut that fits.
        let mut fallback = 1;
        let mut fallback_worst = usize::MAX;
        let mut left = 0usize;
        for split in 1..entries.len() {
            left += costs[split - 1];
            let right = total - left;
            let worst = left.max(right);
            if worst < fallback_worst {
                fallback_worst = worst;
                fallback = split;
            }
        }
        fallback
    }

    // ========================================================================
    // Remove (physical)
    // ========================================================================

    /// Physically remove `key`, joining underfull pages afterwards.
    ///
    /// MVCC deletes go through [`TreeOps::store`] with an AntiValue; this
    /// entry point serves metadata trees and version pruning.
    pub fn remove(&self, key: &[u8], ts: Timestamp) -> Result<bool> {
        let _latch = self.tree.latch().write();
        let (ancestors, leaf) = self.descend_path(key)?;
        let volume_id = self.tree.volume_id();

        let (removed, underfull) = {
            let mut guard = self.pool.get_exclusive(volume_id, leaf)?;
            match guard.search(key) {
                Ok(index) => {
                    guard.remove_record(index);
                    guard.stamp(ts);
                    let underfull =
                        guard.used_space() < guard.capacity() / JOIN_TRIGGER_DIVISOR;
                    (true, underfull)
                }
                Err(_) => (false, false),
            }
        };

        if removed && underfull {
            self.join_if_possible(&ancestors, leaf, ts)?;
        }
        Ok(removed)
    }

    /// Merge `page_id` with an adjacent same-parent sibling when the join
    /// policy admits the combined page. Propagates underflow upward and
    /// collapses the root when it indexes a single child.
    ///
    /// Caller holds the exclusive latch.
    fn join_if_possible(
        &self,
        ancestors: &[PageId],
        page_id: PageId,
        ts: Timestamp,
    ) -> Result<()> {
        let volume_id = self.tree.volume_id();

        let Some(&parent_id) = ancestors.last() else {
            return self.collapse_root(ts);
        };

        let mut parent = self.pool.get_exclusive(volume_id, parent_id)?;
        let parent_count = parent.key_block_count();
        let Some(child_index) =
            (0..parent_count).find(|&i| parent.child_at(i) == page_id)
        else {
            // The page moved since the caller looked; nothing to do.
            return Ok(());
        };

        // Prefer merging with the right sibling; fall back to acting as
        // the right side of the left sibling.
        let (left_id, right_id, right_parent_index) = if child_index + 1 < parent_count {
            (page_id, parent.child_at(child_index + 1), child_index + 1)
        } else if child_index > 0 {
            (parent.child_at(child_index - 1), page_id, child_index)
        } else {
            // Only child: the parent will be handled by a root collapse
            // or its own join.
            return Ok(());
        };

        // Probe sizes with shared pins before dirtying anything.
        let admitted = {
            let left = self.pool.get_shared(volume_id, left_id)?;
            let right = self.pool.get_shared(volume_id, right_id)?;
            let combined = left.used_space() + right.used_space();
            let capacity = left.capacity();
            self.join_policy.accept_join(combined, capacity)
                && self.join_policy.join_fit(combined, 0, capacity) > 0
        };
        if !admitted {
            return Ok(());
        }

        {
            let mut left = self.pool.get_exclusive(volume_id, left_id)?;
            let right = self.pool.get_shared(volume_id, right_id)?;

            for i in 0..right.key_block_count() {
                let at = left.key_block_count();
                let inserted = left.insert_record(at, right.key_at(i), right.value_at(i));
                debug_assert!(inserted, "join overflow despite accept_join");
            }
            left.set_right_sibling(right.right_sibling());
            left.stamp(ts);
        }

        parent.remove_record(right_parent_index);
        parent.stamp(ts);
        let parent_underfull =
            parent.used_space() < parent.capacity() / JOIN_TRIGGER_DIVISOR;
        drop(parent);

        self.volume.free_page(self.pool, right_id, ts)?;
        debug!("joined {} into {} under {}", right_id, left_id, parent_id);

        if parent_underfull || parent_id == self.tree.root() {
            self.join_if_possible(&ancestors[..ancestors.len() - 1], parent_id, ts)?;
        }
        Ok(())
    }

    /// While the root is an index page with a single child, pull that
    /// child's content up and free it.
    fn collapse_root(&self, ts: Timestamp) -> Result<()> {
        let volume_id = self.tree.volume_id();
        loop {
            let root_id = self.tree.root();
            let mut root = self.pool.get_exclusive(volume_id, root_id)?;
            if root.page_type() != PageType::Index || root.key_block_count() != 1 {
                return Ok(());
            }
            let child_id = root.child_at(0);
            {
                let child = self.pool.get_shared(volume_id, child_id)?;
                root.init(child.page_type(), child.level(), root_id);
                for i in 0..child.key_block_count() {
                    let inserted =
                        root.insert_record(i, child.key_at(i), child.value_at(i));
                    debug_assert!(inserted);
                }
                root.set_right_sibling(child.right_sibling());
                root.stamp(ts);
            }
            drop(root);
            self.volume.free_page(self.pool, child_id, ts)?;
            debug!("root collapsed, absorbed {}", child_id);
        }
    }

    // ========================================================================
    // Traversal
    // ========================================================================

    /// The first entry with key greater than `from` (or equal, when
    /// `inclusive`).
    pub fn next_entry(
        &self,
        from: &[u8],
        inclusive: bool,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let _latch = self.tree.latch().read();
        let volume_id = self.tree.volume_id();
        let mut leaf = self.descend_to_leaf(from)?;
        let mut first_probe = true;

        loop {
            let guard = self.pool.get_shared(volume_id, leaf)?;
            let index = if first_probe {
                match guard.search(from) {
                    Ok(i) => {
                        if inclusive {
                            i
                        } else {
                            i + 1
                        }
                    }
                    Err(i) => i,
                }
            } else {
                0
            };

            if index < guard.key_block_count() {
                return Ok(Some((
                    guard.key_at(index).to_vec(),
                    guard.value_at(index).to_vec(),
                )));
            }

            let next = guard.right_sibling();
            if !next.is_valid() {
                return Ok(None);
            }
            leaf = next;
            first_probe = false;
        }
    }

    /// The last entry with key less than `from` (or equal, when
    /// `inclusive`).
    pub fn previous_entry(
        &self,
        from: &[u8],
        inclusive: bool,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let _latch = self.tree.latch().read();
        self.previous_in_subtree(self.tree.root(), from, inclusive)
    }

    fn previous_in_subtree(
        &self,
        page_id: PageId,
        below: &[u8],
        inclusive: bool,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let volume_id = self.tree.volume_id();
        let guard = self.pool.get_shared(volume_id, page_id)?;

        if guard.page_type() != PageType::Index {
            let candidate = match guard.search(below) {
                Ok(i) => {
                    if inclusive {
                        Some(i)
                    } else {
                        i.checked_sub(1)
                    }
                }
                Err(i) => i.checked_sub(1),
            };
            return Ok(candidate.map(|i| {
                (guard.key_at(i).to_vec(), guard.value_at(i).to_vec())
            }));
        }

        let start = index_descent_slot(&guard, below);
        let children: Vec<PageId> = (0..=start).rev().map(|i| guard.child_at(i)).collect();
        drop(guard);

        for child in children {
            if let Some(found) = self.previous_in_subtree(child, below, inclusive)? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }

    // ========================================================================
    // Pruning
    // ========================================================================

    /// Prune every version chain in a leaf page against the transaction
    /// floor, joining the page away if it empties.
    pub fn prune_page(
        &self,
        page_id: PageId,
        txn_index: &TransactionIndex,
        ts: Timestamp,
    ) -> Result<PruneResult> {
        use crate::mvcc::version;

        let _latch = self.tree.latch().write();
        let volume_id = self.tree.volume_id();
        let floor = txn_index.floor(self.timestamps.current());
        let mut result = PruneResult::default();

        // A join absorbs the right sibling's (unpruned) entries into this
        // page, so pruning repeats until the page stops emptying.
        loop {
            let probe_key = {
                let mut guard = self.pool.get_exclusive(volume_id, page_id)?;
                if guard.page_type() != PageType::Data {
                    // Freed or repurposed since the action was queued.
                    return Ok(result);
                }
                let probe = (guard.key_block_count() > 0).then(|| guard.key_at(0).to_vec());

                let mut changed = false;
                let mut i = 0;
                while i < guard.key_block_count() {
                    let entries = version::decode(guard.value_at(i))?;
                    let outcome = version::prune(entries, floor, txn_index);
                    result.freed_long.extend(outcome.freed_long);
                    if outcome.changed {
                        changed = true;
                        result.pruned_records += 1;
                        if outcome.entries.is_empty() {
                            guard.remove_record(i);
                            continue; // same index now holds the next record
                        }
                        let replaced =
                            guard.replace_value(i, &version::encode(&outcome.entries));
                        debug_assert!(replaced, "pruned chain grew");
                    }
                    i += 1;
                }
                if changed {
                    guard.stamp(ts);
                }
                result.emptied = guard.key_block_count() == 0;
                probe
            };

            if !result.emptied || page_id == self.tree.root() {
                return Ok(result);
            }
            let Some(probe) = probe_key else {
                return Ok(result);
            };
            let (ancestors, leaf) = self.descend_path(&probe)?;
            if leaf != page_id {
                return Ok(result);
            }
            let before = {
                let guard = self.pool.get_shared(volume_id, page_id)?;
                (guard.page_type(), guard.key_block_count())
            };
            self.join_if_possible(&ancestors, page_id, ts)?;
            let after = {
                let guard = self.pool.get_shared(volume_id, page_id)?;
                (guard.page_type(), guard.key_block_count())
            };
            if after == before {
                // No join happened; nothing more to do.
                return Ok(result);
            }
        }
    }

    // ========================================================================
    // Statistics
    // ========================================================================

    /// Walk the leaf chain and report occupancy.
    pub fn statistics(&self) -> Result<TreeStatistics> {
        let _latch = self.tree.latch().read();
        let volume_id = self.tree.volume_id();

        let mut height = 1;
        let mut page_id = self.tree.root();
        loop {
            let guard = self.pool.get_shared(volume_id, page_id)?;
            if guard.page_type() != PageType::Index {
                break;
            }
            height += 1;
            page_id = guard.child_at(0);
        }

        let mut stats = TreeStatistics {
            height,
            ..Default::default()
        };
        loop {
            let guard = self.pool.get_shared(volume_id, page_id)?;
            stats.leaf_count += 1;
            stats
                .leaf_fill
                .push(guard.used_space() as f64 / guard.capacity() as f64);
            let next = guard.right_sibling();
            if !next.is_valid() {
                break;
            }
            page_id = next;
        }
        Ok(stats)
    }

    // ========================================================================
    // Descent helpers
    // ========================================================================

    /// Leaf page covering `key`.
    fn descend_to_leaf(&self, key: &[u8]) -> Result<PageId> {
        Ok(self.descend_path(key)?.1)
    }

    /// Path of index pages from the root (exclusive of the leaf) plus the
    /// leaf covering `key`.
    fn descend_path(&self, key: &[u8]) -> Result<(Vec<PageId>, PageId)> {
        let volume_id = self.tree.volume_id();
        let mut ancestors = Vec::new();
        let mut page_id = self.tree.root();
        loop {
            let guard = self.pool.get_shared(volume_id, page_id)?;
            if guard.page_type() != PageType::Index {
                return Ok((ancestors, page_id));
            }
            let slot = index_descent_slot(&guard, key);
            ancestors.push(page_id);
            page_id = guard.child_at(slot);
        }
    }
}

/// The child slot covering `key` in an index page: the last entry whose
/// separator is at or below the key (entry 0 holds the empty separator).
fn index_descent_slot(page: &Page, key: &[u8]) -> usize {
    match page.search(key) {
        Ok(i) => i,
        Err(0) => 0,
        Err(i) => i - 1,
    }
}

/// Fill an empty page with pre-sorted entries.
fn fill_page(guard: &mut PageWriteGuard<'_>, entries: &[(Vec<u8>, Vec<u8>)]) {
    for (i, (key, value)) in entries.iter().enumerate() {
        let inserted = guard.insert_record(i, key, value);
        debug_assert!(inserted, "split arithmetic produced an overfull page");
    }
}
