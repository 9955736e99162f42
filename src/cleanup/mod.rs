//! Cleanup manager - background pruning and page reclamation.
//!
//! A single worker consumes a prioritized queue of [`CleanupAction`]s:
//! freeing deallocated pages first (they unblock allocation), then
//! tombstone pruning, then general version-chain pruning. Each wake-up
//! processes a bounded batch; `poll_interval_ms = -1` suspends the worker
//! so tests can drive the queue deterministically through
//! [`CleanupManager::poll`].

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::common::{PageId, Result, VolumeId};
use crate::engine::EngineShared;
use crate::sequencer;
use crate::tree::btree::TreeOps;

/// Actions processed per wake-up or [`CleanupManager::poll`] call.
pub const CLEANUP_BATCH: usize = 256;

/// One unit of background work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CleanupAction {
    /// Drop version entries no live transaction can see.
    PruneVersionChain {
        volume: VolumeId,
        tree: String,
        page: PageId,
    },
    /// Remove tombstones below the earliest live snapshot; join the page
    /// away if it empties.
    PruneAntiValues {
        volume: VolumeId,
        tree: String,
        page: PageId,
    },
    /// Attach a page to the volume free chain.
    FreePage { volume: VolumeId, page: PageId },
}

impl CleanupAction {
    /// Larger runs earlier.
    fn priority(&self) -> u8 {
        match self {
            CleanupAction::FreePage { .. } => 2,
            CleanupAction::PruneAntiValues { .. } => 1,
            CleanupAction::PruneVersionChain { .. } => 0,
        }
    }
}

/// Heap entry: priority first, then FIFO within a priority class.
struct QueuedAction {
    action: CleanupAction,
    seq: u64,
}

impl PartialEq for QueuedAction {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == std::cmp::Ordering::Equal
    }
}
impl Eq for QueuedAction {}
impl PartialOrd for QueuedAction {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueuedAction {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.action
            .priority()
            .cmp(&other.action.priority())
            .then(other.seq.cmp(&self.seq))
    }
}

struct QueueState {
    heap: BinaryHeap<QueuedAction>,
    next_seq: u64,
}

/// The background cleanup queue and its worker.
pub struct CleanupManager {
    queue: Mutex<QueueState>,
    wake: Condvar,
    poll_interval_ms: AtomicI64,
    stop: AtomicBool,
    enqueued: AtomicU64,
    performed: AtomicU64,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl CleanupManager {
    pub fn new(poll_interval_ms: i64) -> Self {
        Self {
            queue: Mutex::new(QueueState {
                heap: BinaryHeap::new(),
                next_seq: 0,
            }),
            wake: Condvar::new(),
            poll_interval_ms: AtomicI64::new(poll_interval_ms),
            stop: AtomicBool::new(false),
            enqueued: AtomicU64::new(0),
            performed: AtomicU64::new(0),
            worker: Mutex::new(None),
        }
    }

    /// Add an action to the queue.
    pub fn enqueue(&self, action: CleanupAction) {
        let mut queue = self.queue.lock();
        let seq = queue.next_seq;
        queue.next_seq += 1;
        queue.heap.push(QueuedAction { action, seq });
        self.enqueued.fetch_add(1, Ordering::Relaxed);
    }

    /// Actions waiting in the queue.
    pub fn pending(&self) -> usize {
        self.queue.lock().heap.len()
    }

    /// Actions performed so far.
    pub fn performed(&self) -> u64 {
        self.performed.load(Ordering::Relaxed)
    }

    /// Change the worker's wake-up interval; `-1` suspends it.
    pub fn set_poll_interval(&self, interval_ms: i64) {
        self.poll_interval_ms.store(interval_ms, Ordering::Relaxed);
        self.wake.notify_all();
    }

    /// Process up to [`CLEANUP_BATCH`] queued actions synchronously.
    pub(crate) fn poll(&self, engine: &EngineShared) -> Result<usize> {
        let mut performed = 0;
        while performed < CLEANUP_BATCH {
            let action = {
                let mut queue = self.queue.lock();
                match queue.heap.pop() {
                    Some(queued) => queued.action,
                    None => break,
                }
            };
            if let Err(e) = self.apply(engine, &action) {
                // Transient failures (pin timeouts) retry on a later poll;
                // anything else is dropped with a complaint.
                if e.is_transient() {
                    self.enqueue(action);
                } else {
                    warn!("cleanup action {:?} failed: {}", action, e);
                }
                break;
            }
            performed += 1;
            self.performed.fetch_add(1, Ordering::Relaxed);
        }
        if performed > 0 {
            debug!("cleanup performed {} actions", performed);
        }
        Ok(performed)
    }

    fn apply(&self, engine: &EngineShared, action: &CleanupAction) -> Result<()> {
        match action {
            CleanupAction::FreePage { volume, page } => {
                sequencer::at(sequencer::CLEANUP_FREE_PAGE);
                let volume = engine.volume_by_id(*volume)?;
                let pool = engine.pool_for(volume.page_size())?;
                let ts = engine.timestamps.allocate();
                volume.free_page(&pool, *page, ts)
            }
            CleanupAction::PruneVersionChain { volume, tree, page }
            | CleanupAction::PruneAntiValues { volume, tree, page } => {
                let volume = engine.volume_by_id(*volume)?;
                let pool = engine.pool_for(volume.page_size())?;
                let Some(tree) = engine.tree_if_cached(volume.id(), tree) else {
                    // Tree was dropped (or never opened this run); its
                    // pages are reclaimed through drop_tree instead.
                    return Ok(());
                };
                let ops = TreeOps {
                    pool: &pool,
                    volume: &volume,
                    tree: &tree,
                    split_policy: engine.split_policy,
                    join_policy: engine.join_policy,
                    timestamps: &engine.timestamps,
                };
                let ts = engine.timestamps.allocate();
                let result = ops.prune_page(*page, &engine.txn_index, ts)?;
                // Chains of dropped long versions go back to the volume.
                for descriptor in &result.freed_long {
                    for chain_page in
                        crate::longrec::chain_pages(&pool, &volume, descriptor)?
                    {
                        self.enqueue(CleanupAction::FreePage {
                            volume: volume.id(),
                            page: chain_page,
                        });
                    }
                }
                Ok(())
            }
        }
    }

    /// Spawn the background worker. The worker holds a weak engine
    /// reference and exits when the engine goes away or `stop` is set.
    pub(crate) fn start_worker(self: &Arc<Self>, engine: Weak<EngineShared>) {
        let manager = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("folio-cleanup".to_string())
            .spawn(move || manager.worker_loop(engine))
            .expect("spawn cleanup worker");
        *self.worker.lock() = Some(handle);
    }

    fn worker_loop(&self, engine: Weak<EngineShared>) {
        loop {
            {
                let mut queue = self.queue.lock();
                let interval = self.poll_interval_ms.load(Ordering::Relaxed);
                let wait = if interval < 0 {
                    // Suspended: check back for an interval change or stop.
                    Duration::from_millis(250)
                } else {
                    Duration::from_millis(interval as u64)
                };
                let _ = self.wake.wait_for(&mut queue, wait);
            }
            if self.stop.load(Ordering::Relaxed) {
                return;
            }
            if self.poll_interval_ms.load(Ordering::Relaxed) < 0 {
                continue;
            }
            let Some(engine) = engine.upgrade() else {
                return;
            };
            if let Err(e) = self.poll(&engine) {
                warn!("cleanup poll failed: {}", e);
            }
        }
    }

    /// Ask the worker to stop and wait for it within `timeout`.
    pub(crate) fn shutdown(&self, timeout: Duration) {
        self.stop.store(true, Ordering::Relaxed);
        self.wake.notify_all();
        let Some(handle) = self.worker.lock().take() else {
            return;
        };
        let deadline = std::time::Instant::now() + timeout;
        while !handle.is_finished() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        if handle.is_finished() {
            let _ = handle.join();
        } else {
            warn!("cleanup worker did not quiesce within {:?}; detaching", timeout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prune(page: u64) -> CleanupAction {
        CleanupAction::PruneVersionChain {
            volume: VolumeId::new(0),
            tree: "t".into(),
            page: PageId::new(page),
        }
    }

    fn free(page: u64) -> CleanupAction {
        CleanupAction::FreePage {
            volume: VolumeId::new(0),
            page: PageId::new(page),
        }
    }

    #[test]
    fn test_priority_order() {
        let manager = CleanupManager::new(-1);
        manager.enqueue(prune(1));
        manager.enqueue(free(2));
        manager.enqueue(prune(3));
        manager.enqueue(free(4));

        let mut queue = manager.queue.lock();
        let first = queue.heap.pop().unwrap().action;
        let second = queue.heap.pop().unwrap().action;
        let third = queue.heap.pop().unwrap().action;
        let fourth = queue.heap.pop().unwrap().action;

        // Frees first, FIFO within class.
        assert_eq!(first, free(2));
        assert_eq!(second, free(4));
        assert_eq!(third, prune(1));
        assert_eq!(fourth, prune(3));
    }

    #[test]
    fn test_pending_counts() {
        let manager = CleanupManager::new(-1);
        assert_eq!(manager.pending(), 0);
        manager.enqueue(free(1));
        manager.enqueue(free(2));
        assert_eq!(manager.pending(), 2);
    }
}
