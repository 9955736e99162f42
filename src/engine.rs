//! The engine handle: initialization, recovery, background workers,
//! transactions and shutdown.
//!
//! There is no process-wide state; everything hangs off an [`Engine`],
//! which is an `Arc` around the shared internals. Dedicated worker
//! threads run the journal flusher, the checkpointer, the page writer and
//! the cleanup queue; all of them observe a common stop signal and are
//! joined (with a timeout) at close.
//!
//! Lock order, outermost first: tree latch, page pin, pool index, volume
//! free chain, journal, timestamp counter.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{error, info, warn};
use parking_lot::{Condvar, Mutex, RwLock};

use crate::buffer::{BufferPool, StatsSnapshot};
use crate::cleanup::{CleanupAction, CleanupManager};
use crate::common::{
    Configuration, Error, Result, SyncPolicy, Timestamp, TimestampAllocator, VolumeId,
};
use crate::journal::{recovery, JournalManager};
use crate::mvcc::{version, TransactionIndex, TxnRecord, TxnStatus};
use crate::tree::btree::TreeOps;
use crate::tree::directory::{self, DIRECTORY_TREE_NAME};
use crate::tree::{Exchange, JoinPolicy, SplitPolicy, Tree};
use crate::volume::Volume;

/// Shared internals behind every [`Engine`], [`Exchange`] and
/// [`Transaction`].
pub(crate) struct EngineShared {
    pub(crate) config: Configuration,
    pub(crate) timestamps: TimestampAllocator,
    pub(crate) txn_index: TransactionIndex,
    txn_seq: AtomicU64,
    pub(crate) journal: Arc<JournalManager>,
    /// One pool per page-size class.
    pools: HashMap<usize, Arc<BufferPool>>,
    volumes_by_name: RwLock<HashMap<String, Arc<Volume>>>,
    volumes_by_id: RwLock<HashMap<VolumeId, Arc<Volume>>>,
    trees: Mutex<HashMap<(VolumeId, String), Arc<Tree>>>,
    pub(crate) split_policy: SplitPolicy,
    pub(crate) join_policy: JoinPolicy,
    pub(crate) cleanup: Arc<CleanupManager>,
    closed: AtomicBool,
    stop_flag: Mutex<bool>,
    stop_signal: Condvar,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl EngineShared {
    /// Fail unless the engine is open.
    pub(crate) fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(Error::EngineClosed);
        }
        Ok(())
    }

    /// Fail unless the engine is open and not degraded.
    ///
    /// Reads of undamaged trees remain possible while degraded; writes
    /// fail fast.
    pub(crate) fn check_writable(&self) -> Result<()> {
        self.check_open()?;
        if self.journal.is_fatal() {
            return Err(Error::Fatal(
                "engine is degraded after an integrity violation; writes are refused".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn pool_for(&self, page_size: usize) -> Result<Arc<BufferPool>> {
        self.pools
            .get(&page_size)
            .cloned()
            .ok_or_else(|| Error::Fatal(format!("no buffer pool for page size {}", page_size)))
    }

    pub(crate) fn volume_by_id(&self, id: VolumeId) -> Result<Arc<Volume>> {
        self.volumes_by_id
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::Fatal(format!("unknown volume id {}", id)))
    }

    fn volume_by_name(&self, name: &str) -> Result<Arc<Volume>> {
        self.volumes_by_name
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("no volume named {:?}", name),
            )))
    }

    /// A cached tree handle, if one was opened this run.
    pub(crate) fn tree_if_cached(&self, volume: VolumeId, name: &str) -> Option<Arc<Tree>> {
        self.trees.lock().get(&(volume, name.to_string())).cloned()
    }

    /// The directory tree handle for a volume (cached; the directory root
    /// never moves).
    fn directory_tree(&self, volume: &Arc<Volume>) -> Arc<Tree> {
        let key = (volume.id(), DIRECTORY_TREE_NAME.to_string());
        self.trees
            .lock()
            .entry(key)
            .or_insert_with(|| {
                Arc::new(Tree::new(
                    volume.id(),
                    DIRECTORY_TREE_NAME,
                    volume.directory_root(),
                ))
            })
            .clone()
    }

    /// Resolve (and cache) a named tree, optionally creating it.
    ///
    /// The cache always hands back the tree itself, never a stale
    /// indirection: a hit is an `Arc<Tree>` clone.
    pub(crate) fn tree_handle(
        &self,
        volume: &Arc<Volume>,
        name: &str,
        create: bool,
    ) -> Result<Arc<Tree>> {
        if let Some(tree) = self.tree_if_cached(volume.id(), name) {
            return Ok(tree);
        }

        let pool = self.pool_for(volume.page_size())?;
        let dir_tree = self.directory_tree(volume);
        let dir_ops = TreeOps {
            pool: &pool,
            volume,
            tree: &dir_tree,
            split_policy: self.split_policy,
            join_policy: self.join_policy,
            timestamps: &self.timestamps,
        };

        let root = match directory::lookup_tree(&dir_ops, name)? {
            Some(root) => root,
            None if create => {
                self.check_writable()?;
                directory::create_tree(&dir_ops, &self.journal, name)?
            }
            None => return Err(Error::TreeNotFound(name.to_string())),
        };

        let tree = Arc::new(Tree::new(volume.id(), name, root));
        self.trees
            .lock()
            .insert((volume.id(), name.to_string()), Arc::clone(&tree));
        Ok(tree)
    }

    /// Flush dirty images, write a checkpoint record, then write pages
    /// back to their volumes.
    fn checkpoint_now(&self) -> Result<()> {
        self.check_open()?;
        for pool in self.pools.values() {
            pool.write_images_to_journal()?;
        }
        let ts = self.timestamps.allocate();
        let floor = self.txn_index.floor(self.timestamps.current());
        self.journal.write_checkpoint(ts, floor)?;

        for pool in self.pools.values() {
            pool.write_back_pass()?;
        }
        for volume in self.volumes_by_name.read().values() {
            volume.sync()?;
        }
        Ok(())
    }
}

/// The embedded storage engine.
///
/// # Example
/// ```no_run
/// use foliodb::{Configuration, Engine, Key, VolumeSpec};
///
/// let config = Configuration::new("/var/lib/folio/journal")
///     .volume(VolumeSpec::new("data", "/var/lib/folio/data.v01"));
/// let engine = Engine::initialize(config).unwrap();
///
/// let mut ex = engine.exchange("data", "greetings", true).unwrap();
/// let mut key = Key::new();
/// key.append_str("hello");
/// ex.to(&key).value_mut().put_str("world");
/// ex.store().unwrap();
///
/// engine.close().unwrap();
/// ```
pub struct Engine {
    shared: Arc<EngineShared>,
}

impl Engine {
    /// Open volumes and the journal, run recovery, and start the
    /// background workers.
    pub fn initialize(config: Configuration) -> Result<Engine> {
        config.validate()?;

        // Recovery scans the journal before anything is opened.
        let recovered = recovery::recover(&config.journal_path)?;
        let journal = Arc::new(JournalManager::open(
            config.journal_path.clone(),
            config.journal_segment_size,
            config.sync_policy,
            recovered.next_generation,
            recovered.page_index,
        )?);

        let timestamps = TimestampAllocator::new(recovered.max_timestamp);
        let txn_index = TransactionIndex::new();
        for &(seq, commit_ts) in &recovered.committed {
            txn_index.commit(seq, commit_ts);
        }
        for &seq in &recovered.aborted {
            txn_index.abort(seq);
        }

        // One pool per page-size class in use.
        let mut pools: HashMap<usize, Arc<BufferPool>> = HashMap::new();
        for spec in &config.volumes {
            pools.entry(spec.page_size).or_insert_with(|| {
                Arc::new(BufferPool::new(
                    spec.page_size,
                    config.frames_for(spec.page_size),
                    Arc::clone(&journal),
                    config.pin_timeout(),
                ))
            });
        }

        let mut volumes_by_name = HashMap::new();
        let mut volumes_by_id = HashMap::new();
        for (index, spec) in config.volumes.iter().enumerate() {
            let volume = Arc::new(Volume::open_or_create(
                VolumeId::new(index as u32),
                spec,
            )?);
            let pool = pools
                .get(&spec.page_size)
                .expect("pool created for every page size");
            pool.register_volume(Arc::clone(&volume));
            // Reconcile the cached header (free chain included) with any
            // newer journaled image before serving allocations.
            volume.refresh_state(pool)?;
            volumes_by_id.insert(volume.id(), Arc::clone(&volume));
            volumes_by_name.insert(spec.name.clone(), volume);
        }

        let split_policy = SplitPolicy::by_name(&config.split_policy)?;
        let join_policy = JoinPolicy::by_name(&config.join_policy)?;
        let cleanup = Arc::new(CleanupManager::new(config.cleanup_poll_ms));

        let shared = Arc::new(EngineShared {
            timestamps,
            txn_index,
            txn_seq: AtomicU64::new(recovered.max_txn_seq + 1),
            journal,
            pools,
            volumes_by_name: RwLock::new(volumes_by_name),
            volumes_by_id: RwLock::new(volumes_by_id),
            trees: Mutex::new(HashMap::new()),
            split_policy,
            join_policy,
            cleanup,
            closed: AtomicBool::new(false),
            stop_flag: Mutex::new(false),
            stop_signal: Condvar::new(),
            workers: Mutex::new(Vec::new()),
            config,
        });

        if !recovered.clean_shutdown {
            info!("journal replay complete; writing post-recovery checkpoint");
            shared.checkpoint_now()?;
        }

        Self::start_workers(&shared);
        Ok(Engine { shared })
    }

    fn start_workers(shared: &Arc<EngineShared>) {
        shared.cleanup.start_worker(Arc::downgrade(shared));

        let flusher_interval = match shared.config.sync_policy {
            SyncPolicy::GroupCommit => shared.config.group_commit_window_ms.max(1),
            _ => 100,
        };
        Self::spawn_worker(shared, "folio-flusher", flusher_interval, |shared| {
            shared.journal.sync()
        });
        Self::spawn_worker(
            shared,
            "folio-page-writer",
            shared.config.page_writer_interval_ms.max(1),
            |shared| {
                for pool in shared.pools.values() {
                    pool.write_back_pass()?;
                }
                Ok(())
            },
        );
        Self::spawn_worker(
            shared,
            "folio-checkpointer",
            shared.config.checkpoint_interval_ms.max(1),
            |shared| shared.checkpoint_now(),
        );
    }

    fn spawn_worker(
        shared: &Arc<EngineShared>,
        name: &str,
        interval_ms: u64,
        work: impl Fn(&EngineShared) -> Result<()> + Send + 'static,
    ) {
        let weak: Weak<EngineShared> = Arc::downgrade(shared);
        let handle = std::thread::Builder::new()
            .name(name.to_string())
            .spawn(move || loop {
                let Some(shared) = weak.upgrade() else {
                    return;
                };
                {
                    let mut stopped = shared.stop_flag.lock();
                    if *stopped {
                        return;
                    }
                    let _ = shared
                        .stop_signal
                        .wait_for(&mut stopped, Duration::from_millis(interval_ms));
                    if *stopped {
                        return;
                    }
                }
                if let Err(e) = work(&shared) {
                    warn!("background worker failed: {}", e);
                }
            })
            .expect("spawn background worker");
        shared.workers.lock().push(handle);
    }

    // ========================================================================
    // Public API
    // ========================================================================

    /// Look up a volume by configured name.
    pub fn volume(&self, name: &str) -> Result<Arc<Volume>> {
        self.shared.check_open()?;
        self.shared.volume_by_name(name)
    }

    /// Create an [`Exchange`] over `(volume, tree)`.
    ///
    /// With `create` set, an absent tree is created; otherwise
    /// `TreeNotFound` is returned.
    pub fn exchange(&self, volume: &str, tree: &str, create: bool) -> Result<Exchange> {
        self.shared.check_open()?;
        if !directory::valid_tree_name(tree) {
            return Err(Error::InvalidConfiguration(
                "tree".to_string(),
                format!("invalid tree name {:?}", tree),
            ));
        }
        let volume = self.shared.volume_by_name(volume)?;
        let pool = self.shared.pool_for(volume.page_size())?;
        let tree = self.shared.tree_handle(&volume, tree, create)?;
        Ok(Exchange::new(
            Arc::clone(&self.shared),
            volume,
            tree,
            pool,
        ))
    }

    /// Begin a snapshot-isolated transaction.
    pub fn begin_transaction(&self) -> Result<Transaction> {
        self.shared.check_writable()?;
        let seq = self.shared.txn_seq.fetch_add(1, Ordering::Relaxed);
        let start_ts = self.shared.timestamps.allocate();
        self.shared.txn_index.register(seq, start_ts);
        Ok(Transaction {
            shared: Arc::clone(&self.shared),
            record: Arc::new(TxnRecord::new(seq, start_ts)),
        })
    }

    /// Force a checkpoint now.
    pub fn checkpoint(&self) -> Result<()> {
        self.shared.check_writable()?;
        self.shared.checkpoint_now()
    }

    /// Drop a named tree, freeing all of its pages.
    pub fn drop_tree(&self, volume: &str, tree: &str) -> Result<()> {
        self.shared.check_writable()?;
        if !directory::valid_tree_name(tree) {
            return Err(Error::InvalidConfiguration(
                "tree".to_string(),
                format!("invalid tree name {:?}", tree),
            ));
        }
        let volume = self.shared.volume_by_name(volume)?;
        let pool = self.shared.pool_for(volume.page_size())?;
        let handle = self.shared.tree_handle(&volume, tree, false)?;

        let dir_tree = self.shared.directory_tree(&volume);
        let dir_ops = TreeOps {
            pool: &pool,
            volume: &volume,
            tree: &dir_tree,
            split_policy: self.shared.split_policy,
            join_policy: self.shared.join_policy,
            timestamps: &self.shared.timestamps,
        };
        let tree_ops = TreeOps {
            pool: &pool,
            volume: &volume,
            tree: &handle,
            split_policy: self.shared.split_policy,
            join_policy: self.shared.join_policy,
            timestamps: &self.shared.timestamps,
        };

        let _structure = handle.latch().write();
        directory::drop_tree(&dir_ops, &tree_ops, &self.shared.journal, tree)?;
        self.shared
            .trees
            .lock()
            .remove(&(volume.id(), tree.to_string()));
        Ok(())
    }

    /// Synchronously process a batch of queued cleanup actions.
    pub fn cleanup_poll(&self) -> Result<usize> {
        self.shared.check_open()?;
        self.shared.cleanup.poll(&self.shared)
    }

    /// Queued-but-unprocessed cleanup actions.
    pub fn cleanup_pending(&self) -> usize {
        self.shared.cleanup.pending()
    }

    /// Change the cleanup worker's poll interval; `-1` suspends it.
    pub fn set_cleanup_poll_interval(&self, interval_ms: i64) {
        self.shared.cleanup.set_poll_interval(interval_ms);
    }

    /// Whether a fatal integrity violation has degraded the engine.
    pub fn is_degraded(&self) -> bool {
        self.shared.journal.is_fatal()
    }

    /// Buffer pool statistics for a page-size class.
    pub fn buffer_stats(&self, page_size: usize) -> Option<StatsSnapshot> {
        self.shared
            .pools
            .get(&page_size)
            .map(|pool| pool.stats().snapshot())
    }

    /// Quiesce workers, flush everything, and mark a clean shutdown.
    ///
    /// Waits up to the configured shutdown timeout for each worker, then
    /// detaches stragglers.
    pub fn close(&self) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::Relaxed) {
            return Ok(());
        }
        info!("engine closing");

        {
            let mut stopped = self.shared.stop_flag.lock();
            *stopped = true;
            self.shared.stop_signal.notify_all();
        }
        let timeout = self.shared.config.shutdown_timeout();
        self.shared.cleanup.shutdown(timeout);

        let workers = std::mem::take(&mut *self.shared.workers.lock());
        let deadline = std::time::Instant::now() + timeout;
        for handle in workers {
            while !handle.is_finished() && std::time::Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(5));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!("background worker did not quiesce; detaching");
            }
        }

        // Final flush: images, write-back, checkpoint, clean tail.
        let mut first_error = None;
        for pool in self.shared.pools.values() {
            if let Err(e) = pool.flush_all() {
                error!("flush at close failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
        for volume in self.shared.volumes_by_name.read().values() {
            if let Err(e) = volume.sync() {
                error!("volume sync at close failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
        if first_error.is_none() && !self.shared.journal.is_fatal() {
            let ts = self.shared.timestamps.allocate();
            let floor = self.shared.txn_index.floor(self.shared.timestamps.current());
            if let Err(e) = self
                .shared
                .journal
                .write_checkpoint(ts, floor)
                .and_then(|_| self.shared.journal.write_clean_tail(ts))
            {
                error!("clean-tail write failed: {}", e);
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!("close on drop failed: {}", e);
        }
    }
}

/// A snapshot-isolated transaction handle.
///
/// Dropping an unfinished transaction rolls it back.
pub struct Transaction {
    shared: Arc<EngineShared>,
    record: Arc<TxnRecord>,
}

impl Transaction {
    /// The transaction's sequence number.
    pub fn id(&self) -> u64 {
        self.record.seq
    }

    /// The snapshot this transaction reads at.
    pub fn start_timestamp(&self) -> Timestamp {
        self.record.start_ts
    }

    pub(crate) fn record_arc(&self) -> Arc<TxnRecord> {
        Arc::clone(&self.record)
    }

    /// Validate the write set, assign a commit timestamp, journal the
    /// commit and make it durable per the sync policy.
    ///
    /// # Errors
    /// `Rollback` on a write-write conflict: some key in the write set
    /// has a version committed after this transaction began. The
    /// transaction is aborted either way.
    pub fn commit(self) -> Result<()> {
        if !self.record.finish() {
            return Err(Error::Rollback(
                "transaction has already committed or rolled back".into(),
            ));
        }
        if let Err(e) = self.shared.check_writable() {
            self.abort_bookkeeping();
            return Err(e);
        }

        // First-committer-wins validation.
        if let Err(conflict) = self.validate_writes() {
            self.abort_bookkeeping();
            return Err(conflict);
        }

        if self.record.has_writes() {
            // The images of every modified page must be durable before
            // the commit record claims the transaction happened.
            let durable = (|| -> Result<Timestamp> {
                for pool in self.shared.pools.values() {
                    pool.write_images_to_journal()?;
                }
                let commit_ts = self.shared.timestamps.allocate();
                self.shared
                    .journal
                    .write_txn_commit(self.record.seq, commit_ts)?;
                Ok(commit_ts)
            })();
            let commit_ts = match durable {
                Ok(ts) => ts,
                Err(e) => {
                    self.abort_bookkeeping();
                    return Err(e);
                }
            };
            self.shared.txn_index.commit(self.record.seq, commit_ts);

            // Queue the provisional-to-committed rewrites.
            let mut seen = std::collections::HashSet::new();
            for write in self.record.writes() {
                if seen.insert((write.volume, write.leaf_hint)) {
                    self.shared.cleanup.enqueue(CleanupAction::PruneVersionChain {
                        volume: write.volume,
                        tree: write.tree,
                        page: write.leaf_hint,
                    });
                }
            }
        } else {
            let commit_ts = self.shared.timestamps.allocate();
            self.shared.txn_index.commit(self.record.seq, commit_ts);
        }
        Ok(())
    }

    /// Abort the transaction, discarding its provisional versions.
    pub fn rollback(self) -> Result<()> {
        if !self.record.finish() {
            return Err(Error::Rollback(
                "transaction has already committed or rolled back".into(),
            ));
        }
        self.abort_bookkeeping();
        Ok(())
    }

    fn validate_writes(&self) -> Result<()> {
        for write in self.record.writes() {
            let volume = self.shared.volume_by_id(write.volume)?;
            let pool = self.shared.pool_for(volume.page_size())?;
            let Some(tree) = self.shared.tree_if_cached(volume.id(), &write.tree) else {
                continue;
            };
            let ops = TreeOps {
                pool: &pool,
                volume: &volume,
                tree: &tree,
                split_policy: self.shared.split_policy,
                join_policy: self.shared.join_policy,
                timestamps: &self.shared.timestamps,
            };
            let Some(stored) = ops.fetch(&write.key)? else {
                continue;
            };
            for entry in version::decode(&stored)? {
                let committed_at = if version::is_provisional(entry.handle) {
                    let seq = version::provisional_seq(entry.handle);
                    if seq == self.record.seq {
                        continue;
                    }
                    match self.shared.txn_index.status(seq) {
                        TxnStatus::Committed { commit_ts } => commit_ts,
                        TxnStatus::Active { .. } | TxnStatus::Aborted => continue,
                    }
                } else {
                    entry.handle
                };
                if committed_at > self.record.start_ts {
                    return Err(Error::Rollback(format!(
                        "write-write conflict on a key in tree {:?}: committed at {} after start {}",
                        write.tree, committed_at, self.record.start_ts
                    )));
                }
            }
        }
        Ok(())
    }

    fn abort_bookkeeping(&self) {
        self.shared.txn_index.abort(self.record.seq);
        if self.record.has_writes() {
            let ts = self.shared.timestamps.current();
            if let Err(e) = self.shared.journal.write_txn_abort(self.record.seq, ts) {
                warn!("abort record for txn {} not journaled: {}", self.record.seq, e);
            }
            // Aborted versions are garbage; let cleanup sweep them.
            let mut seen = std::collections::HashSet::new();
            for write in self.record.writes() {
                if seen.insert((write.volume, write.leaf_hint)) {
                    self.shared.cleanup.enqueue(CleanupAction::PruneVersionChain {
                        volume: write.volume,
                        tree: write.tree,
                        page: write.leaf_hint,
                    });
                }
            }
        }
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if self.record.finish() {
            warn!(
                "transaction {} dropped without commit or rollback; rolling back",
                self.record.seq
            );
            self.abort_bookkeeping();
        }
    }
}

impl std::fmt::Debug for Transaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transaction")
            .field("seq", &self.record.seq)
            .field("start_ts", &self.record.start_ts)
            .field("finished", &self.record.is_finished())
            .finish()
    }
}
