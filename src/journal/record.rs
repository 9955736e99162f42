//! Journal record framing and payload codecs.
//!
//! A journal segment is `jrn.<generation>`: a 16-byte header (magic,
//! version, generation) followed by length-prefixed, CRC-checksummed
//! records:
//!
//! ```text
//! [kind u8][payload_len u32][timestamp u64][payload...][crc32 u32]
//! ```
//!
//! The CRC covers everything before it. A record that fails its CRC marks
//! the tail of the journal: recovery stops there.

use std::io::Read;

use crate::common::{Error, PageId, Result, Timestamp, VolumeId};

/// Magic at the start of every segment file ("FJRN").
pub const JOURNAL_MAGIC: u32 = 0x464A_524E;

/// Segment format version.
pub const JOURNAL_VERSION: u32 = 1;

/// Size of the segment file header.
pub const SEGMENT_HEADER_SIZE: u64 = 16;

/// Size of the fixed record header (kind + len + timestamp).
pub const RECORD_HEADER_SIZE: usize = 13;

/// Size of the CRC trailer.
pub const RECORD_TRAILER_SIZE: usize = 4;

/// Kinds of journal records.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordKind {
    /// Full image of one page: `{volume, page, page bytes}`.
    PageImage = 1,
    /// A transaction began; payload is its sequence number.
    TxnStart = 2,
    /// A transaction committed; payload is its sequence number, the record
    /// timestamp is the commit timestamp.
    TxnCommit = 3,
    /// A transaction aborted; payload is its sequence number.
    TxnAbort = 4,
    /// A recoverable prefix marker with a page-index snapshot.
    Checkpoint = 5,
    /// Create/drop/root-move of a named tree.
    TreeMeta = 6,
    /// Graceful-shutdown marker; always the last record when present.
    CleanTail = 7,
}

impl RecordKind {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(RecordKind::PageImage),
            2 => Some(RecordKind::TxnStart),
            3 => Some(RecordKind::TxnCommit),
            4 => Some(RecordKind::TxnAbort),
            5 => Some(RecordKind::Checkpoint),
            6 => Some(RecordKind::TreeMeta),
            7 => Some(RecordKind::CleanTail),
            _ => None,
        }
    }
}

/// Location of the newest journaled image of a page.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageIndexEntry {
    pub generation: u64,
    /// Offset of the record within its segment file.
    pub offset: u64,
    pub timestamp: Timestamp,
}

/// Tree metadata operations.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeMetaOp {
    Create = 1,
    Drop = 2,
}

impl TreeMetaOp {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(TreeMetaOp::Create),
            2 => Some(TreeMetaOp::Drop),
            _ => None,
        }
    }
}

/// Encode the segment file header.
pub fn encode_segment_header(generation: u64) -> [u8; SEGMENT_HEADER_SIZE as usize] {
    let mut header = [0u8; SEGMENT_HEADER_SIZE as usize];
    header[0..4].copy_from_slice(&JOURNAL_MAGIC.to_le_bytes());
    header[4..8].copy_from_slice(&JOURNAL_VERSION.to_le_bytes());
    header[8..16].copy_from_slice(&generation.to_le_bytes());
    header
}

/// Validate a segment file header; returns the stored generation.
pub fn decode_segment_header(header: &[u8]) -> Result<u64> {
    if header.len() < SEGMENT_HEADER_SIZE as usize {
        return Err(Error::CorruptJournal("segment header truncated".into()));
    }
    let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    if magic != JOURNAL_MAGIC {
        return Err(Error::CorruptJournal("bad segment magic".into()));
    }
    let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if version != JOURNAL_VERSION {
        return Err(Error::CorruptJournal(format!(
            "unsupported journal version {}",
            version
        )));
    }
    let mut g = [0u8; 8];
    g.copy_from_slice(&header[8..16]);
    Ok(u64::from_le_bytes(g))
}

/// Encode a full record, including the CRC trailer.
pub fn encode_record(kind: RecordKind, timestamp: Timestamp, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(RECORD_HEADER_SIZE + payload.len() + RECORD_TRAILER_SIZE);
    out.push(kind as u8);
    out.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    out.extend_from_slice(&timestamp.to_le_bytes());
    out.extend_from_slice(payload);
    let crc = crc32fast::hash(&out);
    out.extend_from_slice(&crc.to_le_bytes());
    out
}

/// A record read back from a segment.
#[derive(Debug, Clone)]
pub struct JournalRecord {
    pub kind: RecordKind,
    pub timestamp: Timestamp,
    pub payload: Vec<u8>,
}

/// Read the next record, verifying its CRC.
///
/// Returns `Ok(None)` at a clean or torn tail (EOF, zeroed header, bad
/// kind, or CRC mismatch); callers treat the journal as ending there.
pub fn read_record<R: Read>(reader: &mut R) -> Result<Option<JournalRecord>> {
    let mut header = [0u8; RECORD_HEADER_SIZE];
    match reader.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let Some(kind) = RecordKind::from_u8(header[0]) else {
        return Ok(None);
    };
    let payload_len =
        u32::from_le_bytes([header[1], header[2], header[3], header[4]]) as usize;
    let mut ts = [0u8; 8];
    ts.copy_from_slice(&header[5..13]);
    let timestamp = u64::from_le_bytes(ts);

    let mut body = vec![0u8; payload_len + RECORD_TRAILER_SIZE];
    match reader.read_exact(&mut body) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }

    let stored_crc = u32::from_le_bytes([
        body[payload_len],
        body[payload_len + 1],
        body[payload_len + 2],
        body[payload_len + 3],
    ]);
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&header);
    hasher.update(&body[..payload_len]);
    if hasher.finalize() != stored_crc {
        return Ok(None);
    }

    body.truncate(payload_len);
    Ok(Some(JournalRecord {
        kind,
        timestamp,
        payload: body,
    }))
}

/// The size of an encoded record with the given payload length.
pub fn record_size(payload_len: usize) -> u64 {
    (RECORD_HEADER_SIZE + payload_len + RECORD_TRAILER_SIZE) as u64
}

// ============================================================================
// Payload codecs
// ============================================================================

/// Page-image payload: `[volume u32][page u64][page bytes]`.
pub fn encode_page_image(volume: VolumeId, page: PageId, bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + bytes.len());
    out.extend_from_slice(&volume.0.to_le_bytes());
    out.extend_from_slice(&page.0.to_le_bytes());
    out.extend_from_slice(bytes);
    out
}

pub fn decode_page_image(payload: &[u8]) -> Result<(VolumeId, PageId, &[u8])> {
    if payload.len() < 12 {
        return Err(Error::CorruptJournal("page image payload truncated".into()));
    }
    let volume = VolumeId::new(u32::from_le_bytes([
        payload[0], payload[1], payload[2], payload[3],
    ]));
    let mut p = [0u8; 8];
    p.copy_from_slice(&payload[4..12]);
    Ok((volume, PageId::new(u64::from_le_bytes(p)), &payload[12..]))
}

/// Transaction payload: the sequence number.
pub fn encode_txn(seq: u64) -> Vec<u8> {
    seq.to_le_bytes().to_vec()
}

pub fn decode_txn(payload: &[u8]) -> Result<u64> {
    let arr: [u8; 8] = payload
        .try_into()
        .map_err(|_| Error::CorruptJournal("transaction payload truncated".into()))?;
    Ok(u64::from_le_bytes(arr))
}

/// Checkpoint payload: the earliest live start timestamp and a snapshot of
/// the page index.
pub fn encode_checkpoint(
    earliest_live_ts: Timestamp,
    index: &std::collections::HashMap<(VolumeId, PageId), PageIndexEntry>,
) -> Vec<u8> {
    let mut out = Vec::with_capacity(12 + index.len() * 36);
    out.extend_from_slice(&earliest_live_ts.to_le_bytes());
    out.extend_from_slice(&(index.len() as u32).to_le_bytes());
    for ((volume, page), entry) in index {
        out.extend_from_slice(&volume.0.to_le_bytes());
        out.extend_from_slice(&page.0.to_le_bytes());
        out.extend_from_slice(&entry.generation.to_le_bytes());
        out.extend_from_slice(&entry.offset.to_le_bytes());
        out.extend_from_slice(&entry.timestamp.to_le_bytes());
    }
    out
}

pub type CheckpointSnapshot = (
    Timestamp,
    std::collections::HashMap<(VolumeId, PageId), PageIndexEntry>,
);

pub fn decode_checkpoint(payload: &[u8]) -> Result<CheckpointSnapshot> {
    if payload.len() < 12 {
        return Err(Error::CorruptJournal("checkpoint payload truncated".into()));
    }
    let mut ts = [0u8; 8];
    ts.copy_from_slice(&payload[..8]);
    let earliest = u64::from_le_bytes(ts);
    let count =
        u32::from_le_bytes([payload[8], payload[9], payload[10], payload[11]]) as usize;

    let mut index = std::collections::HashMap::with_capacity(count);
    let mut pos = 12;
    for _ in 0..count {
        if pos + 36 > payload.len() {
            return Err(Error::CorruptJournal("checkpoint snapshot truncated".into()));
        }
        let u64_at = |p: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&payload[p..p + 8]);
            u64::from_le_bytes(b)
        };
        let volume = VolumeId::new(u32::from_le_bytes([
            payload[pos],
            payload[pos + 1],
            payload[pos + 2],
            payload[pos + 3],
        ]));
        let page = PageId::new(u64_at(pos + 4));
        index.insert(
            (volume, page),
            PageIndexEntry {
                generation: u64_at(pos + 12),
                offset: u64_at(pos + 20),
                timestamp: u64_at(pos + 28),
            },
        );
        pos += 36;
    }
    Ok((earliest, index))
}

/// Tree-metadata payload.
pub fn encode_tree_meta(op: TreeMetaOp, volume: VolumeId, name: &str, root: PageId) -> Vec<u8> {
    let mut out = Vec::with_capacity(15 + name.len());
    out.push(op as u8);
    out.extend_from_slice(&volume.0.to_le_bytes());
    out.extend_from_slice(&root.0.to_le_bytes());
    out.extend_from_slice(&(name.len() as u16).to_le_bytes());
    out.extend_from_slice(name.as_bytes());
    out
}

pub fn decode_tree_meta(payload: &[u8]) -> Result<(TreeMetaOp, VolumeId, String, PageId)> {
    if payload.len() < 15 {
        return Err(Error::CorruptJournal("tree meta payload truncated".into()));
    }
    let op = TreeMetaOp::from_u8(payload[0])
        .ok_or_else(|| Error::CorruptJournal("bad tree meta op".into()))?;
    let volume = VolumeId::new(u32::from_le_bytes([
        payload[1], payload[2], payload[3], payload[4],
    ]));
    let mut r = [0u8; 8];
    r.copy_from_slice(&payload[5..13]);
    let root = PageId::new(u64::from_le_bytes(r));
    let name_len = u16::from_le_bytes([payload[13], payload[14]]) as usize;
    if payload.len() < 15 + name_len {
        return Err(Error::CorruptJournal("tree meta name truncated".into()));
    }
    let name = String::from_utf8(payload[15..15 + name_len].to_vec())
        .map_err(|_| Error::CorruptJournal("tree meta name is not UTF-8".into()))?;
    Ok((op, volume, name, root))
}
