//! Volume - a file of fixed-size pages.
//!
//! A volume holds:
//! - the header page at offset 0 (magic, version, page size, directory
//!   root, free-chain head, next-unused-page, uuid, checksum)
//! - a directory B+-tree mapping tree names to root page ids
//! - data, index, long-record and garbage pages
//!
//! Page N is located at file offset `N × page_size`. Freed pages are
//! threaded into a chain through their `right_sibling` header field, with
//! the chain head kept in the volume header; allocation pops the chain
//! head before extending the file.
//!
//! All mutations of the header page and the free chain happen through the
//! buffer pool so they are journaled like any other page write. Page 0 is
//! only ever pinned while holding the volume state lock.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use log::info;
use parking_lot::Mutex;

use crate::buffer::BufferPool;
use crate::common::config::VolumeSpec;
use crate::common::{Error, PageId, Result, Timestamp, VolumeId};
use crate::page::{Page, PageHeader, PageType};

const VOLUME_MAGIC: u32 = 0x464F_4C56; // "FOLV"
const VOLUME_VERSION: u32 = 1;

// Header-page payload layout, relative to PageHeader::SIZE.
const OFF_MAGIC: usize = 0;
const OFF_VERSION: usize = 4;
const OFF_PAGE_SIZE: usize = 8;
const OFF_VOLUME_ID: usize = 12;
const OFF_DIRECTORY_ROOT: usize = 16;
const OFF_FREE_CHAIN: usize = 24;
const OFF_NEXT_PAGE: usize = 32;
const OFF_MAX_PAGES: usize = 40;
const OFF_UUID: usize = 48;

/// Result of a page allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocatedPage {
    /// Popped off the free chain; its in-memory image may be dirty and
    /// already carry a timestamp from the cleanup that freed it.
    Reused(PageId),
    /// Newly appended past the previous end of the volume.
    Fresh(PageId),
}

impl AllocatedPage {
    /// The allocated page id, regardless of provenance.
    pub fn page_id(&self) -> PageId {
        match *self {
            AllocatedPage::Reused(pid) | AllocatedPage::Fresh(pid) => pid,
        }
    }
}

/// Cached copy of the mutable header fields.
#[derive(Debug, Clone)]
struct VolumeState {
    directory_root: PageId,
    free_chain_head: PageId,
    next_page: u64,
    max_pages: u64,
    uuid: [u8; 16],
}

/// A file of fixed-size pages.
pub struct Volume {
    id: VolumeId,
    name: String,
    path: PathBuf,
    page_size: usize,
    file: Mutex<File>,
    state: Mutex<VolumeState>,
}

impl Volume {
    // ========================================================================
    // Open / create
    // ========================================================================

    /// Create a new volume file.
    ///
    /// Writes the header page and an empty directory-root leaf directly;
    /// subsequent mutations go through the buffer pool.
    ///
    /// # Errors
    /// Returns an error if the file already exists or cannot be created.
    pub fn create(id: VolumeId, spec: &VolumeSpec) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&spec.path)?;

        let state = VolumeState {
            directory_root: PageId::new(1),
            free_chain_head: PageId::INVALID,
            next_page: 2,
            max_pages: spec.max_pages,
            uuid: generate_uuid(id),
        };

        // Header page
        let mut header = Page::new(spec.page_size);
        header.init(PageType::Header, 0, PageId::new(0));
        write_state(&mut header, id, spec.page_size, &state);
        header.update_checksum();
        file.write_all(header.as_slice())?;

        // Directory root: an empty leaf
        let mut directory = Page::new(spec.page_size);
        directory.init(PageType::Data, 0, PageId::new(1));
        directory.update_checksum();
        file.write_all(directory.as_slice())?;

        // Preallocate the configured initial extent
        if spec.initial_pages > 2 {
            file.set_len(spec.initial_pages * spec.page_size as u64)?;
        }
        file.sync_all()?;

        info!("created volume {:?} at {:?}", spec.name, spec.path);
        Ok(Self {
            id,
            name: spec.name.clone(),
            path: spec.path.clone(),
            page_size: spec.page_size,
            file: Mutex::new(file),
            state: Mutex::new(state),
        })
    }

    /// Open an existing volume file, validating its header.
    ///
    /// # Errors
    /// `CorruptVolume` if the magic, version, page size or checksum do not
    /// match.
    pub fn open(spec: &VolumeSpec) -> Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(&spec.path)?;

        let mut header = Page::new(spec.page_size);
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(header.as_mut_slice())?;

        if !header.verify_checksum() {
            return Err(Error::CorruptVolume(
                spec.name.clone(),
                "header page checksum mismatch".to_string(),
            ));
        }
        let payload = &header.as_slice()[PageHeader::SIZE..];
        if u32_at(payload, OFF_MAGIC) != VOLUME_MAGIC {
            return Err(Error::CorruptVolume(
                spec.name.clone(),
                "bad magic".to_string(),
            ));
        }
        if u32_at(payload, OFF_VERSION) != VOLUME_VERSION {
            return Err(Error::CorruptVolume(
                spec.name.clone(),
                format!("unsupported version {}", u32_at(payload, OFF_VERSION)),
            ));
        }
        if u32_at(payload, OFF_PAGE_SIZE) as usize != spec.page_size {
            return Err(Error::CorruptVolume(
                spec.name.clone(),
                format!(
                    "page size mismatch: file has {}, configured {}",
                    u32_at(payload, OFF_PAGE_SIZE),
                    spec.page_size
                ),
            ));
        }

        let id = VolumeId::new(u32_at(payload, OFF_VOLUME_ID));
        let state = read_state(payload);

        Ok(Self {
            id,
            name: spec.name.clone(),
            path: spec.path.clone(),
            page_size: spec.page_size,
            file: Mutex::new(file),
            state: Mutex::new(state),
        })
    }

    /// Open an existing volume, or create it if absent and the spec allows.
    pub fn open_or_create(id: VolumeId, spec: &VolumeSpec) -> Result<Self> {
        if spec.path.exists() {
            Self::open(spec)
        } else if spec.create {
            Self::create(id, spec)
        } else {
            Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("volume file {:?} does not exist", spec.path),
            )))
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    #[inline]
    pub fn id(&self) -> VolumeId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[inline]
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Root page of the directory tree.
    pub fn directory_root(&self) -> PageId {
        self.state.lock().directory_root
    }

    /// Head of the free-page chain.
    pub fn free_chain_head(&self) -> PageId {
        self.state.lock().free_chain_head
    }

    /// First never-allocated page id.
    pub fn next_page(&self) -> u64 {
        self.state.lock().next_page
    }

    // ========================================================================
    // Raw page I/O (used by the buffer pool)
    // ========================================================================

    /// Read a page's bytes from the file.
    pub fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.page_size);
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(page_id.0 * self.page_size as u64))?;
        file.read_exact(buf)?;
        Ok(())
    }

    /// Write a page's bytes to the file.
    ///
    /// Durability is the journal's business: no fsync happens here. The
    /// caller must have synced the journal past the page's timestamp.
    pub fn write_page(&self, page_id: PageId, bytes: &[u8]) -> Result<()> {
        debug_assert_eq!(bytes.len(), self.page_size);
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(page_id.0 * self.page_size as u64))?;
        file.write_all(bytes)?;
        Ok(())
    }

    /// fsync the volume file.
    pub fn sync(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }

    // ========================================================================
    // Allocation
    // ========================================================================

    /// Allocate a page, preferring the free chain.
    ///
    /// # Errors
    /// `VolumeFull` when the chain is empty and the volume is at its
    /// configured maximum.
    pub fn allocate_page(&self, pool: &BufferPool, ts: Timestamp) -> Result<AllocatedPage> {
        let mut state = self.state.lock();

        if state.free_chain_head.is_valid() {
            let head = state.free_chain_head;
            let next = {
                let guard = pool.get_exclusive(self.id, head)?;
                debug_assert_eq!(guard.page_type(), PageType::Garbage);
                guard.right_sibling()
            };
            state.free_chain_head = next;
            self.persist_state(pool, &state, ts)?;
            Ok(AllocatedPage::Reused(head))
        } else if state.next_page < state.max_pages {
            let page_id = PageId::new(state.next_page);
            state.next_page += 1;
            self.persist_state(pool, &state, ts)?;
            Ok(AllocatedPage::Fresh(page_id))
        } else {
            Err(Error::VolumeFull(self.name.clone()))
        }
    }

    /// Return a page to the free chain.
    ///
    /// The page is rewritten as a Garbage page stamped with `ts` (or its
    /// own newer timestamp) and becomes the new chain head. The dirty
    /// image a later allocator sees is exactly this one.
    pub fn free_page(&self, pool: &BufferPool, page_id: PageId, ts: Timestamp) -> Result<()> {
        let mut state = self.state.lock();
        {
            let mut guard = pool.get_exclusive(self.id, page_id)?;
            guard.init(PageType::Garbage, 0, page_id);
            guard.set_right_sibling(state.free_chain_head);
            guard.stamp(ts);
        }
        state.free_chain_head = page_id;
        self.persist_state(pool, &state, ts)
    }

    /// Re-read the cached header state through the buffer pool.
    ///
    /// Called after recovery: the journal may hold a newer header image
    /// than the volume file, and the free chain must be reconciled before
    /// the volume serves allocations.
    pub fn refresh_state(&self, pool: &BufferPool) -> Result<()> {
        let mut state = self.state.lock();
        let guard = pool.get_shared(self.id, PageId::new(0))?;
        let payload = &guard.as_slice()[PageHeader::SIZE..];
        *state = read_state(payload);
        Ok(())
    }

    /// Serialize the state into the pooled header page.
    fn persist_state(&self, pool: &BufferPool, state: &VolumeState, ts: Timestamp) -> Result<()> {
        let mut guard = pool.get_exclusive(self.id, PageId::new(0))?;
        write_state(&mut guard, self.id, self.page_size, state);
        guard.stamp(ts);
        Ok(())
    }
}

fn write_state(page: &mut Page, id: VolumeId, page_size: usize, state: &VolumeState) {
    let payload = &mut page.as_mut_slice()[PageHeader::SIZE..];
    payload[OFF_MAGIC..OFF_MAGIC + 4].copy_from_slice(&VOLUME_MAGIC.to_le_bytes());
    payload[OFF_VERSION..OFF_VERSION + 4].copy_from_slice(&VOLUME_VERSION.to_le_bytes());
    payload[OFF_PAGE_SIZE..OFF_PAGE_SIZE + 4]
        .copy_from_slice(&(page_size as u32).to_le_bytes());
    payload[OFF_VOLUME_ID..OFF_VOLUME_ID + 4].copy_from_slice(&id.0.to_le_bytes());
    payload[OFF_DIRECTORY_ROOT..OFF_DIRECTORY_ROOT + 8]
        .copy_from_slice(&state.directory_root.0.to_le_bytes());
    payload[OFF_FREE_CHAIN..OFF_FREE_CHAIN + 8]
        .copy_from_slice(&state.free_chain_head.0.to_le_bytes());
    payload[OFF_NEXT_PAGE..OFF_NEXT_PAGE + 8].copy_from_slice(&state.next_page.to_le_bytes());
    payload[OFF_MAX_PAGES..OFF_MAX_PAGES + 8].copy_from_slice(&state.max_pages.to_le_bytes());
    payload[OFF_UUID..OFF_UUID + 16].copy_from_slice(&state.uuid);
}

fn read_state(payload: &[u8]) -> VolumeState {
    let mut uuid = [0u8; 16];
    uuid.copy_from_slice(&payload[OFF_UUID..OFF_UUID + 16]);
    VolumeState {
        directory_root: PageId::new(u64_at(payload, OFF_DIRECTORY_ROOT)),
        free_chain_head: PageId::new(u64_at(payload, OFF_FREE_CHAIN)),
        next_page: u64_at(payload, OFF_NEXT_PAGE),
        max_pages: u64_at(payload, OFF_MAX_PAGES),
        uuid,
    }
}

fn u32_at(bytes: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([bytes[off], bytes[off + 1], bytes[off + 2], bytes[off + 3]])
}

fn u64_at(bytes: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&bytes[off..off + 8]);
    u64::from_le_bytes(b)
}

fn generate_uuid(id: VolumeId) -> [u8; 16] {
    // Not cryptographic; just distinct across volumes and creations.
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let mut uuid = [0u8; 16];
    uuid[..8].copy_from_slice(&(nanos as u64).to_le_bytes());
    uuid[8..12].copy_from_slice(&id.0.to_le_bytes());
    uuid[12..].copy_from_slice(&((nanos >> 64) as u32).to_le_bytes());
    uuid
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn spec(dir: &Path, name: &str) -> VolumeSpec {
        VolumeSpec::new(name, dir.join(format!("{}.v01", name))).page_size(4096)
    }

    #[test]
    fn test_create_and_open() {
        let dir = tempdir().unwrap();
        let spec = spec(dir.path(), "data");

        {
            let vol = Volume::create(VolumeId::new(0), &spec).unwrap();
            assert_eq!(vol.directory_root(), PageId::new(1));
            assert_eq!(vol.free_chain_head(), PageId::INVALID);
            assert_eq!(vol.next_page(), 2);
        }

        let vol = Volume::open(&spec).unwrap();
        assert_eq!(vol.id(), VolumeId::new(0));
        assert_eq!(vol.page_size(), 4096);
        assert_eq!(vol.next_page(), 2);
    }

    #[test]
    fn test_create_existing_fails() {
        let dir = tempdir().unwrap();
        let spec = spec(dir.path(), "data");
        Volume::create(VolumeId::new(0), &spec).unwrap();
        assert!(Volume::create(VolumeId::new(0), &spec).is_err());
    }

    #[test]
    fn test_open_rejects_corruption() {
        let dir = tempdir().unwrap();
        let spec = spec(dir.path(), "data");
        Volume::create(VolumeId::new(0), &spec).unwrap();

        // Flip a byte in the header page
        {
            let mut file = OpenOptions::new()
                .write(true)
                .open(&spec.path)
                .unwrap();
            file.seek(SeekFrom::Start(200)).unwrap();
            file.write_all(&[0xFF]).unwrap();
        }

        assert!(matches!(
            Volume::open(&spec),
            Err(Error::CorruptVolume(_, _))
        ));
    }

    #[test]
    fn test_open_rejects_page_size_mismatch() {
        let dir = tempdir().unwrap();
        let spec4k = spec(dir.path(), "data");
        Volume::create(VolumeId::new(0), &spec4k).unwrap();

        let spec8k = VolumeSpec::new("data", spec4k.path.clone()).page_size(8192);
        assert!(Volume::open(&spec8k).is_err());
    }

    #[test]
    fn test_raw_page_io() {
        let dir = tempdir().unwrap();
        let spec = spec(dir.path(), "data");
        let vol = Volume::create(VolumeId::new(0), &spec).unwrap();

        let mut page = Page::new(4096);
        page.init(PageType::Data, 0, PageId::new(2));
        page.insert_record(0, b"k", b"v");
        page.update_checksum();
        vol.write_page(PageId::new(2), page.as_slice()).unwrap();

        let mut buf = vec![0u8; 4096];
        vol.read_page(PageId::new(2), &mut buf).unwrap();
        assert_eq!(&buf[..], page.as_slice());
    }
}
