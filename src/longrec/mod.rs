//! Long-record engine: values spanning multiple pages.
//!
//! A value whose stored form exceeds [`threshold`] is written as a chain
//! of LongRecord pages linked through their right-sibling field; the leaf
//! record keeps only a 12-byte descriptor `[size u32][first-page u64]`
//! (flagged `FLAG_LONG_RECORD` at the version layer).
//!
//! # Timestamps on reallocated pages
//! Allocation prefers the volume free chain. A page popped off the chain
//! may still be dirty in the buffer pool, stamped by the cleanup that
//! freed it. The writer's timestamp is known to be at or above that stamp
//! only because both draw from the same monotonic allocator **and** the
//! writer allocated after the free was enqueued; the page must therefore
//! keep `max(writer_ts, existing_ts)`. Writing a lower timestamp would
//! put a regressing image into the journal's page-index, which is a
//! fatal integrity violation there.
//! [`BufferPool::get_for_new`] implements the max; this module is its
//! main customer.

use std::sync::Arc;

use crate::buffer::BufferPool;
use crate::common::{Error, PageId, Result, TimestampAllocator};
use crate::page::{PageHeader, PageType};
use crate::sequencer;
use crate::volume::Volume;

/// Size of the inline descriptor stored in the leaf.
pub const DESCRIPTOR_SIZE: usize = 12;

/// Stored-value length above which a value goes long: a quarter of the
/// page's usable capacity, so a leaf always holds several records.
pub fn threshold(page_size: usize) -> usize {
    (page_size - PageHeader::SIZE) / 4
}

/// Payload bytes carried per chain page.
fn chunk_capacity(page_size: usize) -> usize {
    page_size - PageHeader::SIZE
}

/// Encode a descriptor.
pub fn encode_descriptor(size: usize, first: PageId) -> Vec<u8> {
    let mut out = Vec::with_capacity(DESCRIPTOR_SIZE);
    out.extend_from_slice(&(size as u32).to_le_bytes());
    out.extend_from_slice(&first.0.to_le_bytes());
    out
}

/// Decode a descriptor.
pub fn decode_descriptor(bytes: &[u8]) -> Result<(usize, PageId)> {
    if bytes.len() != DESCRIPTOR_SIZE {
        return Err(Error::InvalidValue(format!(
            "long-record descriptor is {} bytes, expected {}",
            bytes.len(),
            DESCRIPTOR_SIZE
        )));
    }
    let size = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let mut p = [0u8; 8];
    p.copy_from_slice(&bytes[4..12]);
    Ok((size, PageId::new(u64::from_le_bytes(p))))
}

/// Write `payload` as a chain of long-record pages.
///
/// Pages are allocated tail-first so each page already knows its
/// successor when it is initialized. Returns the descriptor to store
/// inline.
pub fn store_long(
    pool: &BufferPool,
    volume: &Arc<Volume>,
    timestamps: &TimestampAllocator,
    payload: &[u8],
) -> Result<Vec<u8>> {
    debug_assert!(!payload.is_empty());
    let chunk = chunk_capacity(volume.page_size());
    let pages = payload.len().div_ceil(chunk);
    let ts = timestamps.allocate();

    let mut next = PageId::INVALID;
    for i in (0..pages).rev() {
        sequencer::at(sequencer::LONG_RECORD_ALLOCATE);
        // get_for_new keeps max(ts, existing) on pages reused off the
        // free chain.
        let mut guard = pool.get_for_new(volume, PageType::LongRecord, 0, ts)?;
        let start = i * chunk;
        let end = (start + chunk).min(payload.len());
        guard.as_mut_slice()[PageHeader::SIZE..PageHeader::SIZE + (end - start)]
            .copy_from_slice(&payload[start..end]);
        guard.set_right_sibling(next);
        next = guard.page_id();
    }

    Ok(encode_descriptor(payload.len(), next))
}

/// Read a long value back by following its chain.
///
/// # Errors
/// `CorruptVolume` if the chain ends before `size` bytes are assembled or
/// a link is not a long-record page.
pub fn read_long(pool: &BufferPool, volume: &Arc<Volume>, descriptor: &[u8]) -> Result<Vec<u8>> {
    let (size, first) = decode_descriptor(descriptor)?;
    let chunk = chunk_capacity(volume.page_size());

    let mut out = Vec::with_capacity(size);
    let mut page_id = first;
    while out.len() < size {
        if !page_id.is_valid() {
            return Err(Error::CorruptVolume(
                volume.name().to_string(),
                format!("long-record chain truncated at {} of {} bytes", out.len(), size),
            ));
        }
        let guard = pool.get_shared(volume.id(), page_id)?;
        if guard.page_type() != PageType::LongRecord {
            return Err(Error::CorruptVolume(
                volume.name().to_string(),
                format!("long-record chain link {} has wrong page type", page_id),
            ));
        }
        let take = chunk.min(size - out.len());
        out.extend_from_slice(&guard.as_slice()[PageHeader::SIZE..PageHeader::SIZE + take]);
        page_id = guard.right_sibling();
    }
    Ok(out)
}

/// The page ids of a long record's chain, for freeing.
pub fn chain_pages(
    pool: &BufferPool,
    volume: &Arc<Volume>,
    descriptor: &[u8],
) -> Result<Vec<PageId>> {
    let (size, first) = decode_descriptor(descriptor)?;
    let chunk = chunk_capacity(volume.page_size());
    let expected = size.div_ceil(chunk);

    let mut pages = Vec::with_capacity(expected);
    let mut page_id = first;
    while pages.len() < expected && page_id.is_valid() {
        pages.push(page_id);
        let guard = pool.get_shared(volume.id(), page_id)?;
        page_id = guard.right_sibling();
    }
    Ok(pages)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_roundtrip() {
        let descriptor = encode_descriptor(1_000_000, PageId::new(42));
        assert_eq!(descriptor.len(), DESCRIPTOR_SIZE);
        let (size, first) = decode_descriptor(&descriptor).unwrap();
        assert_eq!(size, 1_000_000);
        assert_eq!(first, PageId::new(42));
    }

    #[test]
    fn test_descriptor_rejects_wrong_length() {
        assert!(decode_descriptor(&[0u8; 11]).is_err());
        assert!(decode_descriptor(&[0u8; 13]).is_err());
    }

    #[test]
    fn test_threshold_scales_with_page_size() {
        assert!(threshold(4096) < threshold(16384));
        // A long value never fits a quarter page.
        assert_eq!(threshold(4096), (4096 - PageHeader::SIZE) / 4);
    }
}
