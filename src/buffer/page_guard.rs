//! RAII guards for page access.
//!
//! These guards provide safe access to pages in the buffer pool:
//! - [`PageReadGuard`] - Shared pin (multiple readers allowed)
//! - [`PageWriteGuard`] - Exclusive pin (auto-marks dirty)
//!
//! Both guards auto-unpin the page when dropped. A pin never downgrades:
//! a reader that decides to mutate must release its shared pin and
//! reacquire exclusively.

use std::ops::{Deref, DerefMut};

use parking_lot::{RwLockReadGuard, RwLockWriteGuard};

use crate::common::{FrameId, PageId, VolumeId};
use crate::page::Page;

use super::pool::BufferPool;

/// Guard for a shared pin on a page.
///
/// Multiple `PageReadGuard`s can exist for the same page simultaneously.
/// The page is automatically unpinned when the guard is dropped.
pub struct PageReadGuard<'a> {
    /// Reference back to the pool for unpin on drop.
    pool: &'a BufferPool,
    /// Frame holding this page.
    frame_id: FrameId,
    /// Identity for convenience.
    volume_id: VolumeId,
    page_id: PageId,
    /// Lock guard providing access to page data.
    lock: RwLockReadGuard<'a, Page>,
}

impl<'a> PageReadGuard<'a> {
    pub(crate) fn new(
        pool: &'a BufferPool,
        frame_id: FrameId,
        volume_id: VolumeId,
        page_id: PageId,
        lock: RwLockReadGuard<'a, Page>,
    ) -> Self {
        Self {
            pool,
            frame_id,
            volume_id,
            page_id,
            lock,
        }
    }

    #[inline]
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    #[inline]
    pub fn volume_id(&self) -> VolumeId {
        self.volume_id
    }

    #[inline]
    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }
}

impl Deref for PageReadGuard<'_> {
    type Target = Page;

    #[inline]
    fn deref(&self) -> &Page {
        &self.lock
    }
}

impl Drop for PageReadGuard<'_> {
    fn drop(&mut self) {
        // Shared pin: not dirty
        self.pool.unpin_page_internal(self.frame_id, false);
    }
}

/// Guard for an exclusive pin on a page.
///
/// Only one `PageWriteGuard` can exist for a page at a time.
/// The page is automatically marked dirty and unpinned when the guard is
/// dropped.
pub struct PageWriteGuard<'a> {
    pool: &'a BufferPool,
    frame_id: FrameId,
    volume_id: VolumeId,
    page_id: PageId,
    lock: RwLockWriteGuard<'a, Page>,
}

impl<'a> PageWriteGuard<'a> {
    pub(crate) fn new(
        pool: &'a BufferPool,
        frame_id: FrameId,
        volume_id: VolumeId,
        page_id: PageId,
        lock: RwLockWriteGuard<'a, Page>,
    ) -> Self {
        Self {
            pool,
            frame_id,
            volume_id,
            page_id,
            lock,
        }
    }

    #[inline]
    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    #[inline]
    pub fn volume_id(&self) -> VolumeId {
        self.volume_id
    }

    #[inline]
    pub fn frame_id(&self) -> FrameId {
        self.frame_id
    }
}

impl Deref for PageWriteGuard<'_> {
    type Target = Page;

    #[inline]
    fn deref(&self) -> &Page {
        &self.lock
    }
}

impl DerefMut for PageWriteGuard<'_> {
    #[inline]
    fn deref_mut(&mut self) -> &mut Page {
        &mut self.lock
    }
}

impl Drop for PageWriteGuard<'_> {
    fn drop(&mut self) {
        // Exclusive pin: always dirty
        self.pool.unpin_page_internal(self.frame_id, true);
    }
}
