//! Engine-wide timestamp allocation.
//!
//! Every mutation in the engine is ordered by a single monotonic counter:
//! page modification times, version commit timestamps, checkpoint times and
//! cleanup stamps all draw from the same source. Commit-order therefore
//! equals timestamp-order.

use std::sync::atomic::{AtomicU64, Ordering};

/// An engine-wide logical timestamp.
///
/// Timestamps start at 1; 0 is reserved for "primordial" state that is
/// visible to every snapshot.
pub type Timestamp = u64;

/// Timestamp reserved for state visible to all snapshots.
pub const PRIMORDIAL: Timestamp = 0;

/// Issues monotonically increasing timestamps.
///
/// A single allocator instance is shared by the whole engine. All operations
/// are lock-free.
#[derive(Debug)]
pub struct TimestampAllocator {
    counter: AtomicU64,
}

impl TimestampAllocator {
    /// Create an allocator whose next issued timestamp is `start + 1`.
    ///
    /// Recovery seeds `start` with the highest timestamp found in the
    /// journal so that post-recovery timestamps continue the sequence.
    pub fn new(start: Timestamp) -> Self {
        Self {
            counter: AtomicU64::new(start),
        }
    }

    /// Allocate the next timestamp.
    #[inline]
    pub fn allocate(&self) -> Timestamp {
        self.counter.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// The most recently issued timestamp.
    #[inline]
    pub fn current(&self) -> Timestamp {
        self.counter.load(Ordering::Relaxed)
    }

    /// Raise the counter to at least `ts`.
    ///
    /// Used during recovery when replayed records carry timestamps above
    /// the checkpoint's.
    pub fn advance_to(&self, ts: Timestamp) {
        self.counter.fetch_max(ts, Ordering::Relaxed);
    }
}
