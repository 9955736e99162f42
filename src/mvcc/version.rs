//! Multi-version value encoding and visibility.
//!
//! The value bytes stored in a leaf record are either a single committed
//! version visible to every snapshot ("plain") or a list of versions, each
//! tagged with a version handle:
//!
//! - a plain commit timestamp, or
//! - a provisional handle (`PROVISIONAL_BIT | txn-seq`) that resolves
//!   through the [`TransactionIndex`](super::TransactionIndex) until
//!   pruning rewrites it to the commit timestamp.
//!
//! A delete appends an AntiValue (tombstone) version instead of removing
//! the record; traversal and fetch treat a visible AntiValue as absence.
//!
//! # Encoded forms
//! ```text
//! plain:    [0x00][flags u8][payload...]
//! versions: [0x01][count u16] then per version:
//!           [handle u64][flags u8][len u32][payload...]
//! ```

use crate::common::{Error, Result, Timestamp};

use super::transaction::{TransactionIndex, TxnStatus};

/// Version flag: this version is an AntiValue tombstone.
pub const FLAG_ANTIVALUE: u8 = 0x01;

/// Version flag: the payload is a long-record descriptor, not the value.
pub const FLAG_LONG_RECORD: u8 = 0x02;

/// High bit marking a version handle as provisional (txn-seq, not yet a
/// commit timestamp).
pub const PROVISIONAL_BIT: u64 = 1 << 63;

const TAG_PLAIN: u8 = 0x00;
const TAG_VERSIONS: u8 = 0x01;

/// Build a provisional handle for a transaction sequence number.
#[inline]
pub fn provisional_handle(txn_seq: u64) -> u64 {
    debug_assert_eq!(txn_seq & PROVISIONAL_BIT, 0);
    txn_seq | PROVISIONAL_BIT
}

/// Whether a handle is provisional.
#[inline]
pub fn is_provisional(handle: u64) -> bool {
    handle & PROVISIONAL_BIT != 0
}

/// The transaction sequence of a provisional handle.
#[inline]
pub fn provisional_seq(handle: u64) -> u64 {
    handle & !PROVISIONAL_BIT
}

/// One version of a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionEntry {
    /// Commit timestamp, or a provisional handle.
    pub handle: u64,
    /// `FLAG_ANTIVALUE` / `FLAG_LONG_RECORD` bits.
    pub flags: u8,
    /// Value payload, or a long-record descriptor.
    pub payload: Vec<u8>,
}

impl VersionEntry {
    #[inline]
    pub fn is_antivalue(&self) -> bool {
        self.flags & FLAG_ANTIVALUE != 0
    }

    #[inline]
    pub fn is_long(&self) -> bool {
        self.flags & FLAG_LONG_RECORD != 0
    }
}

/// Decode stored value bytes into version entries.
///
/// The plain form decodes as a single entry with handle 0 (primordial,
/// visible to everyone).
pub fn decode(stored: &[u8]) -> Result<Vec<VersionEntry>> {
    match stored.first() {
        Some(&TAG_PLAIN) => {
            if stored.len() < 2 {
                return Err(Error::InvalidValue("truncated plain value".into()));
            }
            Ok(vec![VersionEntry {
                handle: 0,
                flags: stored[1],
                payload: stored[2..].to_vec(),
            }])
        }
        Some(&TAG_VERSIONS) => {
            if stored.len() < 3 {
                return Err(Error::InvalidValue("truncated version list".into()));
            }
            let count = u16::from_le_bytes([stored[1], stored[2]]) as usize;
            let mut entries = Vec::with_capacity(count);
            let mut pos = 3;
            for _ in 0..count {
                if pos + 13 > stored.len() {
                    return Err(Error::InvalidValue("truncated version entry".into()));
                }
                let mut h = [0u8; 8];
                h.copy_from_slice(&stored[pos..pos + 8]);
                let handle = u64::from_le_bytes(h);
                let flags = stored[pos + 8];
                let mut l = [0u8; 4];
                l.copy_from_slice(&stored[pos + 9..pos + 13]);
                let len = u32::from_le_bytes(l) as usize;
                pos += 13;
                if pos + len > stored.len() {
                    return Err(Error::InvalidValue("version payload past end".into()));
                }
                entries.push(VersionEntry {
                    handle,
                    flags,
                    payload: stored[pos..pos + len].to_vec(),
                });
                pos += len;
            }
            Ok(entries)
        }
        Some(tag) => Err(Error::InvalidValue(format!("unknown value tag {}", tag))),
        None => Err(Error::InvalidValue("empty stored value".into())),
    }
}

/// Encode version entries into stored value bytes.
///
/// A single fully-committed, non-tombstone entry with handle 0 collapses
/// to the plain form.
pub fn encode(entries: &[VersionEntry]) -> Vec<u8> {
    if entries.len() == 1 && entries[0].handle == 0 && !entries[0].is_antivalue() {
        let mut out = Vec::with_capacity(2 + entries[0].payload.len());
        out.push(TAG_PLAIN);
        out.push(entries[0].flags);
        out.extend_from_slice(&entries[0].payload);
        return out;
    }
    let mut out = Vec::new();
    out.push(TAG_VERSIONS);
    out.extend_from_slice(&(entries.len() as u16).to_le_bytes());
    for entry in entries {
        out.extend_from_slice(&entry.handle.to_le_bytes());
        out.push(entry.flags);
        out.extend_from_slice(&(entry.payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&entry.payload);
    }
    out
}

/// The reader's view used to filter version chains.
pub struct Snapshot<'a> {
    /// Start timestamp of the reading transaction (or the current
    /// timestamp for non-transactional reads).
    pub ts: Timestamp,
    /// The reading transaction's sequence, for read-your-writes.
    pub txn_seq: Option<u64>,
    /// Status table resolving provisional handles.
    pub index: &'a TransactionIndex,
}

/// Select the version visible to `snap`, if any.
///
/// A reader sees its own provisional writes (newest first), else the
/// newest version whose commit timestamp is at or below its snapshot.
/// Returns the visible entry even if it is an AntiValue; callers map
/// tombstones to absence.
pub fn visible<'e>(entries: &'e [VersionEntry], snap: &Snapshot<'_>) -> Option<&'e VersionEntry> {
    let mut own: Option<&VersionEntry> = None;
    let mut committed: Option<(&VersionEntry, Timestamp)> = None;

    for entry in entries {
        if is_provisional(entry.handle) {
            let seq = provisional_seq(entry.handle);
            match snap.index.status(seq) {
                TxnStatus::Active { .. } => {
                    if snap.txn_seq == Some(seq) {
                        own = Some(entry);
                    }
                }
                TxnStatus::Committed { commit_ts } => {
                    if commit_ts <= snap.ts
                        && committed.map_or(true, |(_, best)| commit_ts >= best)
                    {
                        committed = Some((entry, commit_ts));
                    }
                }
                TxnStatus::Aborted => {}
            }
        } else if entry.handle <= snap.ts
            && committed.map_or(true, |(_, best)| entry.handle >= best)
        {
            committed = Some((entry, entry.handle));
        }
    }

    own.or(committed.map(|(e, _)| e))
}

/// Result of pruning a version chain.
#[derive(Debug, Default)]
pub struct PruneOutcome {
    /// Surviving entries (empty means the whole record can be removed).
    pub entries: Vec<VersionEntry>,
    /// Long-record descriptors of dropped versions; their chains must be
    /// freed.
    pub freed_long: Vec<Vec<u8>>,
    /// Whether anything changed relative to the input.
    pub changed: bool,
}

/// Prune a version chain against the earliest live snapshot `floor`.
///
/// - provisional handles of committed transactions are rewritten to their
///   commit timestamps
/// - versions of aborted transactions are dropped
/// - committed versions superseded by a newer committed version at or
///   below the floor are dropped
/// - a tombstone at or below the floor with nothing older left is dropped
/// - a single surviving committed version at or below the floor collapses
///   to the primordial handle 0
pub fn prune(
    entries: Vec<VersionEntry>,
    floor: Timestamp,
    index: &TransactionIndex,
) -> PruneOutcome {
    let mut out = PruneOutcome::default();

    // Resolve provisional handles.
    let mut resolved: Vec<VersionEntry> = Vec::with_capacity(entries.len());
    for mut entry in entries {
        if is_provisional(entry.handle) {
            match index.status(provisional_seq(entry.handle)) {
                TxnStatus::Active { .. } => resolved.push(entry),
                TxnStatus::Committed { commit_ts } => {
                    entry.handle = commit_ts;
                    out.changed = true;
                    resolved.push(entry);
                }
                TxnStatus::Aborted => {
                    out.changed = true;
                    if entry.is_long() {
                        out.freed_long.push(entry.payload);
                    }
                }
            }
        } else {
            resolved.push(entry);
        }
    }

    // Newest committed version at or below the floor anchors the chain.
    let anchor = resolved
        .iter()
        .filter(|e| !is_provisional(e.handle) && e.handle <= floor)
        .map(|e| e.handle)
        .max();

    for entry in resolved {
        let keep = if is_provisional(entry.handle) {
            true
        } else if entry.handle > floor {
            true
        } else {
            // At or below the floor: only the anchor survives, and a
            // tombstone anchor is itself droppable.
            Some(entry.handle) == anchor && !entry.is_antivalue()
        };
        if keep {
            out.entries.push(entry);
        } else {
            out.changed = true;
            if entry.is_long() {
                out.freed_long.push(entry.payload);
            }
        }
    }

    // Collapse a lone committed survivor to primordial.
    if out.entries.len() == 1
        && !is_provisional(out.entries[0].handle)
        && out.entries[0].handle != 0
        && out.entries[0].handle <= floor
    {
        out.entries[0].handle = 0;
        out.changed = true;
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mvcc::transaction::TransactionIndex;

    fn entry(handle: u64, flags: u8, payload: &[u8]) -> VersionEntry {
        VersionEntry {
            handle,
            flags,
            payload: payload.to_vec(),
        }
    }

    fn snapshot(index: &TransactionIndex, ts: Timestamp) -> Snapshot<'_> {
        Snapshot {
            ts,
            txn_seq: None,
            index,
        }
    }

    #[test]
    fn test_plain_roundtrip() {
        let entries = vec![entry(0, 0, b"RED_FOX")];
        let encoded = encode(&entries);
        assert_eq!(encoded[0], TAG_PLAIN);
        assert_eq!(decode(&encoded).unwrap(), entries);
    }

    #[test]
    fn test_version_list_roundtrip() {
        let entries = vec![
            entry(10, 0, b"v1"),
            entry(20, FLAG_ANTIVALUE, b""),
            entry(provisional_handle(3), FLAG_LONG_RECORD, &[1; 12]),
        ];
        let encoded = encode(&entries);
        assert_eq!(encoded[0], TAG_VERSIONS);
        assert_eq!(decode(&encoded).unwrap(), entries);
    }

    #[test]
    fn test_visibility_by_snapshot() {
        let index = TransactionIndex::new();
        let entries = vec![entry(10, 0, b"v1"), entry(20, 0, b"v2")];

        assert!(visible(&entries, &snapshot(&index, 5)).is_none());
        assert_eq!(
            visible(&entries, &snapshot(&index, 15)).unwrap().payload,
            b"v1"
        );
        assert_eq!(
            visible(&entries, &snapshot(&index, 25)).unwrap().payload,
            b"v2"
        );
    }

    #[test]
    fn test_read_your_writes() {
        let index = TransactionIndex::new();
        index.register(7, 100);
        let entries = vec![
            entry(10, 0, b"committed"),
            entry(provisional_handle(7), 0, b"mine"),
        ];

        // Another reader does not see the provisional version.
        assert_eq!(
            visible(&entries, &snapshot(&index, 200)).unwrap().payload,
            b"committed"
        );

        // The owner does.
        let snap = Snapshot {
            ts: 100,
            txn_seq: Some(7),
            index: &index,
        };
        assert_eq!(visible(&entries, &snap).unwrap().payload, b"mine");
    }

    #[test]
    fn test_provisional_resolves_after_commit() {
        let index = TransactionIndex::new();
        index.register(7, 100);
        let entries = vec![entry(provisional_handle(7), 0, b"x")];

        assert!(visible(&entries, &snapshot(&index, 300)).is_none());

        index.commit(7, 150);
        assert_eq!(
            visible(&entries, &snapshot(&index, 300)).unwrap().payload,
            b"x"
        );
        assert!(visible(&entries, &snapshot(&index, 120)).is_none());
    }

    #[test]
    fn test_prune_rewrites_committed_handles() {
        let index = TransactionIndex::new();
        index.register(7, 100);
        index.commit(7, 150);

        let outcome = prune(
            vec![entry(provisional_handle(7), 0, b"x")],
            // Floor below the commit: version must survive as committed.
            100,
            &index,
        );
        assert!(outcome.changed);
        assert_eq!(outcome.entries.len(), 1);
        assert_eq!(outcome.entries[0].handle, 150);
    }

    #[test]
    fn test_prune_drops_aborted_and_superseded() {
        let index = TransactionIndex::new();
        index.register(9, 100);
        index.abort(9);

        let outcome = prune(
            vec![
                entry(10, 0, b"old"),
                entry(20, 0, b"new"),
                entry(provisional_handle(9), 0, b"gone"),
            ],
            50,
            &index,
        );
        assert!(outcome.changed);
        // "old" superseded by "new" below the floor; aborted dropped.
        assert_eq!(outcome.entries.len(), 1);
        assert_eq!(outcome.entries[0].payload, b"new");
        // Lone committed survivor collapses to primordial.
        assert_eq!(outcome.entries[0].handle, 0);
    }

    #[test]
    fn test_prune_keeps_versions_above_floor() {
        let index = TransactionIndex::new();
        let outcome = prune(
            vec![entry(10, 0, b"a"), entry(20, 0, b"b"), entry(30, 0, b"c")],
            15,
            &index,
        );
        // "a" is the anchor at floor 15; "b" and "c" are above the floor.
        assert_eq!(outcome.entries.len(), 3);
        assert_eq!(outcome.entries[0].handle, 10);
    }

    #[test]
    fn test_prune_drops_tombstone_below_floor() {
        let index = TransactionIndex::new();
        let outcome = prune(
            vec![entry(10, 0, b"v"), entry(20, FLAG_ANTIVALUE, b"")],
            100,
            &index,
        );
        assert!(outcome.changed);
        assert!(outcome.entries.is_empty());
    }

    #[test]
    fn test_prune_collects_long_descriptors() {
        let index = TransactionIndex::new();
        let outcome = prune(
            vec![
                entry(10, FLAG_LONG_RECORD, &[0xAA; 12]),
                entry(20, 0, b"short"),
            ],
            100,
            &index,
        );
        assert_eq!(outcome.freed_long.len(), 1);
        assert_eq!(outcome.freed_long[0], vec![0xAA; 12]);
    }
}
