//! Frame - a slot in the buffer pool.
//!
//! A [`Frame`] holds a [`Page`] plus metadata needed for buffer management:
//! - Which (volume, page) is loaded (if any)
//! - Pin count for reference counting
//! - Dirty flag for write-back tracking
//! - Write-in-progress flag (a pooled page is exactly one of clean, dirty,
//!   or being-written)
//! - The timestamp of the newest page image safely in the journal

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::common::{PageId, Timestamp, VolumeId};
use crate::page::Page;

/// A frame in the buffer pool.
///
/// Frames are the "slots" in the buffer pool. Each frame can hold one page.
/// The buffer pool has a fixed number of frames allocated at startup.
///
/// # Thread Safety
/// All fields use interior mutability for safe concurrent access:
/// - `page`: `RwLock` for shared/exclusive pin synchronization
/// - `identity`: `Mutex` for safe updates
/// - `pin_count`: `AtomicU32` for lock-free reference counting
/// - flags and `journaled_ts`: atomics
pub struct Frame {
    /// The page data, protected by RwLock.
    page: RwLock<Page>,

    /// Which (volume, page) is currently loaded, or None if frame is empty.
    identity: Mutex<Option<(VolumeId, PageId)>>,

    /// Number of active references to this frame.
    pin_count: AtomicU32,

    /// Whether the page has been modified since loading.
    is_dirty: AtomicBool,

    /// Whether a flush of this frame is in progress.
    is_writing: AtomicBool,

    /// Timestamp of the newest image of this page known to be durable in
    /// the journal (or the volume, for pages loaded clean from disk).
    journaled_ts: AtomicU64,
}

impl Frame {
    /// Create a new empty frame holding a zeroed page of `page_size` bytes.
    pub fn new(page_size: usize) -> Self {
        Self {
            page: RwLock::new(Page::new(page_size)),
            identity: Mutex::new(None),
            pin_count: AtomicU32::new(0),
            is_dirty: AtomicBool::new(false),
            is_writing: AtomicBool::new(false),
            journaled_ts: AtomicU64::new(0),
        }
    }

    // ========================================================================
    // Page access (RwLock)
    // ========================================================================

    /// Acquire read lock on the page.
    #[inline]
    pub fn page(&self) -> RwLockReadGuard<'_, Page> {
        self.page.read()
    }

    /// Acquire write lock on the page.
    #[inline]
    pub fn page_mut(&self) -> RwLockWriteGuard<'_, Page> {
        self.page.write()
    }

    /// Acquire read lock with a timeout.
    #[inline]
    pub fn try_page_for(
        &self,
        timeout: std::time::Duration,
    ) -> Option<RwLockReadGuard<'_, Page>> {
        self.page.try_read_for(timeout)
    }

    /// Acquire write lock with a timeout.
    #[inline]
    pub fn try_page_mut_for(
        &self,
        timeout: std::time::Duration,
    ) -> Option<RwLockWriteGuard<'_, Page>> {
        self.page.try_write_for(timeout)
    }

    // ========================================================================
    // Identity management
    // ========================================================================

    /// Get the (volume, page) identity of the loaded page.
    #[inline]
    pub fn identity(&self) -> Option<(VolumeId, PageId)> {
        *self.identity.lock()
    }

    /// Set the identity.
    #[inline]
    pub fn set_identity(&self, identity: Option<(VolumeId, PageId)>) {
        *self.identity.lock() = identity;
    }

    // ========================================================================
    // Pin count operations (Atomic)
    // ========================================================================

    /// Increment the pin count. Returns the new pin count.
    #[inline]
    pub fn pin(&self) -> u32 {
        self.pin_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Decrement the pin count. Returns the new pin count.
    ///
    /// # Panics
    /// Panics if pin count is already 0.
    #[inline]
    pub fn unpin(&self) -> u32 {
        let old = self.pin_count.fetch_sub(1, Ordering::Relaxed);
        assert!(old > 0, "pin count underflow");
        old - 1
    }

    /// Get the current pin count.
    #[inline]
    pub fn pin_count(&self) -> u32 {
        self.pin_count.load(Ordering::Relaxed)
    }

    /// Check if the frame is currently pinned.
    #[inline]
    pub fn is_pinned(&self) -> bool {
        self.pin_count() > 0
    }

    // ========================================================================
    // Dirty / writing flags (Atomic)
    // ========================================================================

    /// Mark the frame as dirty (modified).
    #[inline]
    pub fn mark_dirty(&self) {
        self.is_dirty.store(true, Ordering::Relaxed);
    }

    /// Clear the dirty flag.
    #[inline]
    pub fn clear_dirty(&self) {
        self.is_dirty.store(false, Ordering::Relaxed);
    }

    /// Check if the frame is dirty.
    #[inline]
    pub fn is_dirty(&self) -> bool {
        self.is_dirty.load(Ordering::Relaxed)
    }

    /// Mark a flush in progress (or finished).
    #[inline]
    pub fn set_writing(&self, writing: bool) {
        self.is_writing.store(writing, Ordering::Relaxed);
    }

    /// Whether a flush of this frame is in progress.
    #[inline]
    pub fn is_writing(&self) -> bool {
        self.is_writing.load(Ordering::Relaxed)
    }

    /// Timestamp of the newest durable image of this page.
    #[inline]
    pub fn journaled_ts(&self) -> Timestamp {
        self.journaled_ts.load(Ordering::Relaxed)
    }

    /// Record that an image at `ts` is durable.
    #[inline]
    pub fn set_journaled_ts(&self, ts: Timestamp) {
        self.journaled_ts.store(ts, Ordering::Relaxed);
    }

    // ========================================================================
    // Frame state queries
    // ========================================================================

    /// Check if the frame is empty (no page loaded).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.identity().is_none()
    }

    /// Check if the frame can be evicted.
    #[inline]
    pub fn is_evictable(&self) -> bool {
        self.identity().is_some() && !self.is_pinned() && !self.is_writing()
    }

    /// Reset the frame to empty state.
    ///
    /// Called after eviction to prepare for reuse.
    pub fn reset(&self) {
        self.page_mut().reset();
        self.set_identity(None);
        self.pin_count.store(0, Ordering::Relaxed);
        self.is_dirty.store(false, Ordering::Relaxed);
        self.is_writing.store(false, Ordering::Relaxed);
        self.journaled_ts.store(0, Ordering::Relaxed);
    }
}
