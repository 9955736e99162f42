//! Journal manager - the append-only write-ahead log.
//!
//! The [`JournalManager`] owns the current segment file, the append head
//! and the in-memory **page-index**: the map from (volume, page) to the
//! newest journaled image of that page.
//!
//! # The monotonicity invariant
//! For successive page-index insertions at one (volume, page) slot, the
//! recorded timestamp must be non-decreasing. An attempt to journal a page
//! image with a timestamp *below* the indexed one is a programming-class
//! fatal error: the manager latches itself fatal, the engine degrades and
//! refuses further writes.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Seek, SeekFrom, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use log::{debug, error, info};
use parking_lot::{Condvar, Mutex};

use crate::common::{Error, PageId, Result, SyncPolicy, Timestamp, VolumeId};

use super::record::{
    self, PageIndexEntry, RecordKind, TreeMetaOp, SEGMENT_HEADER_SIZE,
};

/// How long a group-commit waiter will block before forcing its own sync.
const GROUP_COMMIT_MAX_WAIT: Duration = Duration::from_millis(500);

/// Name of a segment file for a generation.
pub fn segment_file_name(generation: u64) -> String {
    format!("jrn.{:012}", generation)
}

struct JournalInner {
    file: File,
    generation: u64,
    /// Append offset within the current segment.
    offset: u64,
    /// Timestamp of the newest appended record.
    last_ts: Timestamp,
    /// Timestamp covered by the last fsync.
    synced_ts: Timestamp,
    /// Newest journaled image per (volume, page).
    page_index: HashMap<(VolumeId, PageId), PageIndexEntry>,
}

/// The append-only, segmented write-ahead journal.
pub struct JournalManager {
    dir: PathBuf,
    segment_max: u64,
    sync_policy: SyncPolicy,
    inner: Mutex<JournalInner>,
    /// Wakes group-commit waiters after a sync.
    sync_cv: Condvar,
    /// Latched on an integrity violation; all writes fail afterwards.
    fatal: AtomicBool,
}

impl JournalManager {
    /// Open the journal in `dir`, starting a fresh segment at
    /// `next_generation` seeded with `page_index` (both from recovery;
    /// an empty index and generation 1 for a new journal).
    pub fn open(
        dir: PathBuf,
        segment_max: u64,
        sync_policy: SyncPolicy,
        next_generation: u64,
        page_index: HashMap<(VolumeId, PageId), PageIndexEntry>,
    ) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        let file = create_segment(&dir, next_generation)?;
        info!(
            "journal open at {:?}, generation {}, {} indexed pages",
            dir,
            next_generation,
            page_index.len()
        );
        Ok(Self {
            dir,
            segment_max,
            sync_policy,
            inner: Mutex::new(JournalInner {
                file,
                generation: next_generation,
                offset: SEGMENT_HEADER_SIZE,
                last_ts: 0,
                synced_ts: 0,
                page_index,
            }),
            sync_cv: Condvar::new(),
            fatal: AtomicBool::new(false),
        })
    }

    /// Whether the journal has latched a fatal integrity violation.
    pub fn is_fatal(&self) -> bool {
        self.fatal.load(Ordering::Relaxed)
    }

    /// The configured sync policy.
    pub fn sync_policy(&self) -> SyncPolicy {
        self.sync_policy
    }

    // ========================================================================
    // Appends
    // ========================================================================

    /// Append a page image and update the page-index.
    ///
    /// # Errors
    /// `Fatal` if `ts` is below the timestamp already indexed for this
    /// page - the monotonicity invariant. The journal latches fatal.
    pub fn write_page_image(
        &self,
        volume: VolumeId,
        page: PageId,
        ts: Timestamp,
        bytes: &[u8],
    ) -> Result<()> {
        let mut inner = self.lock_checked()?;

        if let Some(existing) = inner.page_index.get(&(volume, page)) {
            if existing.timestamp > ts {
                self.fatal.store(true, Ordering::Relaxed);
                error!(
                    "page-index timestamp regression for {} {}: indexed {} > new {}",
                    volume, page, existing.timestamp, ts
                );
                return Err(Error::Fatal(format!(
                    "journal page-index timestamp regression: {} {} indexed at {}, new image at {}",
                    volume, page, existing.timestamp, ts
                )));
            }
        }

        let payload = record::encode_page_image(volume, page, bytes);
        let (generation, offset) =
            self.append_record(&mut inner, RecordKind::PageImage, ts, &payload)?;
        inner.page_index.insert(
            (volume, page),
            PageIndexEntry {
                generation,
                offset,
                timestamp: ts,
            },
        );
        Ok(())
    }

    /// Append a TXN_START record.
    pub fn write_txn_start(&self, seq: u64, start_ts: Timestamp) -> Result<()> {
        let mut inner = self.lock_checked()?;
        self.append_record(
            &mut inner,
            RecordKind::TxnStart,
            start_ts,
            &record::encode_txn(seq),
        )?;
        Ok(())
    }

    /// Append a TXN_COMMIT record and make it durable per the sync policy.
    ///
    /// Under `EveryCommit` the record is synced immediately; under
    /// `GroupCommit` the caller blocks until a sync (its own, the
    /// flusher's, or a fellow committer's) covers the commit timestamp;
    /// under `Periodic` the call returns at once.
    pub fn write_txn_commit(&self, seq: u64, commit_ts: Timestamp) -> Result<()> {
        let mut inner = self.lock_checked()?;
        self.append_record(
            &mut inner,
            RecordKind::TxnCommit,
            commit_ts,
            &record::encode_txn(seq),
        )?;

        match self.sync_policy {
            SyncPolicy::EveryCommit => self.sync_locked(&mut inner)?,
            SyncPolicy::GroupCommit => {
                let deadline = std::time::Instant::now() + GROUP_COMMIT_MAX_WAIT;
                while inner.synced_ts < commit_ts {
                    let timed_out = self
                        .sync_cv
                        .wait_until(&mut inner, deadline)
                        .timed_out();
                    if inner.synced_ts >= commit_ts {
                        break;
                    }
                    if timed_out {
                        self.sync_locked(&mut inner)?;
                        break;
                    }
                }
            }
            SyncPolicy::Periodic => {}
        }
        Ok(())
    }

    /// Append a TXN_ABORT record.
    pub fn write_txn_abort(&self, seq: u64, ts: Timestamp) -> Result<()> {
        let mut inner = self.lock_checked()?;
        self.append_record(&mut inner, RecordKind::TxnAbort, ts, &record::encode_txn(seq))?;
        Ok(())
    }

    /// Append a TREE_METADATA record.
    pub fn write_tree_meta(
        &self,
        op: TreeMetaOp,
        volume: VolumeId,
        name: &str,
        root: PageId,
        ts: Timestamp,
    ) -> Result<()> {
        let mut inner = self.lock_checked()?;
        let payload = record::encode_tree_meta(op, volume, name, root);
        self.append_record(&mut inner, RecordKind::TreeMeta, ts, &payload)?;
        Ok(())
    }

    /// Append a CHECKPOINT record carrying the current page-index snapshot
    /// and sync.
    pub fn write_checkpoint(&self, ts: Timestamp, earliest_live_ts: Timestamp) -> Result<()> {
        let mut inner = self.lock_checked()?;
        let payload = record::encode_checkpoint(earliest_live_ts, &inner.page_index);
        self.append_record(&mut inner, RecordKind::Checkpoint, ts, &payload)?;
        self.sync_locked(&mut inner)?;
        debug!("checkpoint at ts {} ({} pages indexed)", ts, inner.page_index.len());
        Ok(())
    }

    /// Append the graceful-shutdown marker and sync.
    pub fn write_clean_tail(&self, ts: Timestamp) -> Result<()> {
        let mut inner = self.lock_checked()?;
        self.append_record(&mut inner, RecordKind::CleanTail, ts, &[])?;
        self.sync_locked(&mut inner)
    }

    // ========================================================================
    // Sync
    // ========================================================================

    /// fsync the current segment.
    pub fn sync(&self) -> Result<()> {
        let mut inner = self.inner.lock();
        self.sync_locked(&mut inner)
    }

    /// Ensure the journal is synced at or past `ts`.
    ///
    /// This is the gate the page writer passes before a volume write.
    pub fn sync_to(&self, ts: Timestamp) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.synced_ts >= ts {
            return Ok(());
        }
        self.sync_locked(&mut inner)
    }

    fn sync_locked(&self, inner: &mut JournalInner) -> Result<()> {
        inner.file.sync_data()?;
        inner.synced_ts = inner.last_ts;
        self.sync_cv.notify_all();
        Ok(())
    }

    // ========================================================================
    // Page-index reads
    // ========================================================================

    /// Location of the newest journaled image of a page, if any.
    pub fn page_location(&self, volume: VolumeId, page: PageId) -> Option<PageIndexEntry> {
        self.inner.lock().page_index.get(&(volume, page)).copied()
    }

    /// Number of entries in the page-index.
    pub fn page_index_len(&self) -> usize {
        self.inner.lock().page_index.len()
    }

    /// Read the newest journaled image of a page into `buf`.
    ///
    /// Returns `false` if the page has no journaled image (the caller
    /// falls back to the volume file).
    pub fn read_page_image(
        &self,
        volume: VolumeId,
        page: PageId,
        buf: &mut [u8],
    ) -> Result<bool> {
        let Some(entry) = self.page_location(volume, page) else {
            return Ok(false);
        };

        let path = self.dir.join(segment_file_name(entry.generation));
        let mut file = File::open(&path)?;
        file.seek(SeekFrom::Start(entry.offset))?;
        let mut reader = BufReader::new(file);
        let record = record::read_record(&mut reader)?.ok_or_else(|| {
            Error::CorruptJournal(format!(
                "indexed record at {}:{} unreadable",
                entry.generation, entry.offset
            ))
        })?;
        if record.kind != RecordKind::PageImage {
            return Err(Error::CorruptJournal(format!(
                "indexed record at {}:{} is not a page image",
                entry.generation, entry.offset
            )));
        }
        let (rec_volume, rec_page, bytes) = record::decode_page_image(&record.payload)?;
        if rec_volume != volume || rec_page != page || bytes.len() != buf.len() {
            return Err(Error::CorruptJournal(format!(
                "indexed record at {}:{} does not match {} {}",
                entry.generation, entry.offset, volume, page
            )));
        }
        buf.copy_from_slice(bytes);
        Ok(true)
    }

    // ========================================================================
    // Internal
    // ========================================================================

    fn lock_checked(&self) -> Result<parking_lot::MutexGuard<'_, JournalInner>> {
        if self.is_fatal() {
            return Err(Error::Fatal(
                "journal has latched a fatal integrity violation".into(),
            ));
        }
        Ok(self.inner.lock())
    }

    /// Append one record, rolling to a new segment when the current one is
    /// full. Returns the (generation, offset) where the record landed.
    fn append_record(
        &self,
        inner: &mut JournalInner,
        kind: RecordKind,
        ts: Timestamp,
        payload: &[u8],
    ) -> Result<(u64, u64)> {
        let encoded = record::encode_record(kind, ts, payload);

        if inner.offset + encoded.len() as u64 > self.segment_max
            && inner.offset > SEGMENT_HEADER_SIZE
        {
            inner.file.sync_data()?;
            inner.generation += 1;
            inner.file = create_segment(&self.dir, inner.generation)?;
            inner.offset = SEGMENT_HEADER_SIZE;
            debug!("journal rolled to generation {}", inner.generation);
        }

        let offset = inner.offset;
        inner.file.write_all(&encoded)?;
        inner.offset += encoded.len() as u64;
        if ts > inner.last_ts {
            inner.last_ts = ts;
        }
        Ok((inner.generation, offset))
    }
}

fn create_segment(dir: &std::path::Path, generation: u64) -> Result<File> {
    let path = dir.join(segment_file_name(generation));
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .create_new(true)
        .open(&path)?;
    file.write_all(&record::encode_segment_header(generation))?;
    file.sync_data()?;
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_journal(dir: &std::path::Path) -> JournalManager {
        JournalManager::open(
            dir.to_path_buf(),
            4 * 1024 * 1024,
            SyncPolicy::EveryCommit,
            1,
            HashMap::new(),
        )
        .unwrap()
    }

    fn page_bytes(fill: u8) -> Vec<u8> {
        vec![fill; 1024]
    }

    #[test]
    fn test_page_image_roundtrip_through_index() {
        let dir = tempdir().unwrap();
        let journal = open_journal(dir.path());

        let bytes = page_bytes(0x5A);
        journal
            .write_page_image(VolumeId::new(0), PageId::new(3), 10, &bytes)
            .unwrap();

        let mut buf = vec![0u8; 1024];
        assert!(journal
            .read_page_image(VolumeId::new(0), PageId::new(3), &mut buf)
            .unwrap());
        assert_eq!(buf, bytes);

        assert!(!journal
            .read_page_image(VolumeId::new(0), PageId::new(4), &mut buf)
            .unwrap());
    }

    #[test]
    fn test_newer_image_wins() {
        let dir = tempdir().unwrap();
        let journal = open_journal(dir.path());

        journal
            .write_page_image(VolumeId::new(0), PageId::new(3), 10, &page_bytes(1))
            .unwrap();
        journal
            .write_page_image(VolumeId::new(0), PageId::new(3), 20, &page_bytes(2))
            .unwrap();

        let mut buf = vec![0u8; 1024];
        journal
            .read_page_image(VolumeId::new(0), PageId::new(3), &mut buf)
            .unwrap();
        assert_eq!(buf, page_bytes(2));
    }

    #[test]
    fn test_timestamp_regression_is_fatal() {
        let dir = tempdir().unwrap();
        let journal = open_journal(dir.path());

        journal
            .write_page_image(VolumeId::new(0), PageId::new(3), 20, &page_bytes(1))
            .unwrap();

        // Equal timestamps are allowed (non-decreasing).
        journal
            .write_page_image(VolumeId::new(0), PageId::new(3), 20, &page_bytes(2))
            .unwrap();

        let err = journal
            .write_page_image(VolumeId::new(0), PageId::new(3), 19, &page_bytes(3))
            .unwrap_err();
        assert!(matches!(err, Error::Fatal(_)));
        assert!(journal.is_fatal());

        // Everything fails after the latch.
        assert!(journal.write_txn_start(1, 30).is_err());
    }

    #[test]
    fn test_segment_rollover() {
        let dir = tempdir().unwrap();
        let journal = JournalManager::open(
            dir.path().to_path_buf(),
            // Tiny segments: every image rolls over.
            2048,
            SyncPolicy::Periodic,
            1,
            HashMap::new(),
        )
        .unwrap();

        for i in 0..4u64 {
            journal
                .write_page_image(VolumeId::new(0), PageId::new(i), i + 1, &page_bytes(i as u8))
                .unwrap();
        }
        journal.sync().unwrap();

        let segments: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("jrn."))
            .collect();
        assert!(segments.len() >= 2, "expected rollover, got {} segments", segments.len());

        // Every image remains readable across segments.
        let mut buf = vec![0u8; 1024];
        for i in 0..4u64 {
            assert!(journal
                .read_page_image(VolumeId::new(0), PageId::new(i), &mut buf)
                .unwrap());
            assert_eq!(buf, page_bytes(i as u8));
        }
    }

    #[test]
    fn test_sync_to_is_idempotent() {
        let dir = tempdir().unwrap();
        let journal = open_journal(dir.path());
        journal
            .write_page_image(VolumeId::new(0), PageId::new(1), 5, &page_bytes(1))
            .unwrap();
        journal.sync_to(5).unwrap();
        journal.sync_to(5).unwrap();
        journal.sync_to(1).unwrap();
    }
}
