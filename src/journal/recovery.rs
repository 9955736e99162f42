//! Crash recovery: rebuild engine state from the journal.
//!
//! On startup the journal directory is scanned forward:
//! 1. Locate the most recent valid CHECKPOINT (CRC-validated tail scan).
//! 2. Seed the page-index from the checkpoint's snapshot.
//! 3. Replay subsequent PAGE_IMAGE records, keeping later timestamps only.
//! 4. Build the transaction table: a START without a COMMIT/ABORT by
//!    journal end is aborted; commits are reinstated with their commit
//!    timestamps.
//! 5. Recover the highest timestamp ever issued and the next journal
//!    generation.
//!
//! The caller (engine initialization) then reconciles each volume's
//! cached header state through the buffer pool, which serves the
//! journaled header image, before any allocation is served.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use log::{info, warn};

use crate::common::{Error, PageId, Result, Timestamp, VolumeId};

use super::record::{
    self, JournalRecord, PageIndexEntry, RecordKind, TreeMetaOp, SEGMENT_HEADER_SIZE,
};

/// A tree create/drop/root-move replayed from the journal.
#[derive(Debug, Clone)]
pub struct TreeMetaEvent {
    pub op: TreeMetaOp,
    pub volume: VolumeId,
    pub name: String,
    pub root: PageId,
}

/// Everything recovery learns from the journal.
#[derive(Debug, Default)]
pub struct RecoveredState {
    /// (volume, page) to newest journaled image.
    pub page_index: HashMap<(VolumeId, PageId), PageIndexEntry>,
    /// Highest timestamp seen anywhere in the journal.
    pub max_timestamp: Timestamp,
    /// Highest transaction sequence seen.
    pub max_txn_seq: u64,
    /// Transactions with a COMMIT record: (seq, commit_ts).
    pub committed: Vec<(u64, Timestamp)>,
    /// Transactions rolled back: explicit aborts plus unfinished starts.
    pub aborted: Vec<u64>,
    /// Earliest live start timestamp recorded by the last checkpoint.
    pub checkpoint_floor: Timestamp,
    /// Generation the journal should continue at.
    pub next_generation: u64,
    /// Whether the journal ended with a clean-tail marker.
    pub clean_shutdown: bool,
    /// Tree metadata events, in order.
    pub tree_events: Vec<TreeMetaEvent>,
}

/// One record plus where it was found.
struct PlacedRecord {
    generation: u64,
    offset: u64,
    record: JournalRecord,
}

/// Scan the journal directory and rebuild recoverable state.
///
/// An empty or missing directory yields a default state starting at
/// generation 1 (a fresh database).
pub fn recover(dir: &Path) -> Result<RecoveredState> {
    let mut state = RecoveredState {
        next_generation: 1,
        clean_shutdown: true,
        ..Default::default()
    };

    let mut generations = list_generations(dir)?;
    if generations.is_empty() {
        info!("no journal segments under {:?}; starting fresh", dir);
        return Ok(state);
    }
    generations.sort_unstable();

    // Pass 1: read every valid record, stopping at the first torn tail.
    let mut records: Vec<PlacedRecord> = Vec::new();
    let last_generation = *generations.last().unwrap();
    for &generation in &generations {
        let path = dir.join(super::manager::segment_file_name(generation));
        let torn = read_segment(&path, generation, &mut records)?;
        if torn && generation != last_generation {
            return Err(Error::CorruptJournal(format!(
                "segment {} is torn but not the newest",
                generation
            )));
        }
    }
    state.next_generation = last_generation + 1;

    // Locate the newest checkpoint.
    let checkpoint_pos = records
        .iter()
        .rposition(|r| r.record.kind == RecordKind::Checkpoint);
    if let Some(pos) = checkpoint_pos {
        let (floor, snapshot) = record::decode_checkpoint(&records[pos].record.payload)?;
        state.checkpoint_floor = floor;
        state.page_index = snapshot;
    }

    // Pass 2: replay.
    let mut started: HashMap<u64, Timestamp> = HashMap::new();
    let mut ended: HashMap<u64, bool> = HashMap::new(); // true = committed
    let replay_from = checkpoint_pos.map_or(0, |p| p + 1);
    state.clean_shutdown = false;

    for (position, placed) in records.iter().enumerate() {
        let record = &placed.record;
        if record.timestamp > state.max_timestamp {
            state.max_timestamp = record.timestamp;
        }

        match record.kind {
            RecordKind::PageImage if position >= replay_from => {
                let (volume, page, _) = record::decode_page_image(&record.payload)?;
                let slot = (volume, page);
                let newer = state
                    .page_index
                    .get(&slot)
                    .map_or(true, |existing| record.timestamp >= existing.timestamp);
                if newer {
                    state.page_index.insert(
                        slot,
                        PageIndexEntry {
                            generation: placed.generation,
                            offset: placed.offset,
                            timestamp: record.timestamp,
                        },
                    );
                } else {
                    warn!(
                        "replay skipped stale image of {} {} at ts {}",
                        volume, page, record.timestamp
                    );
                }
            }
            RecordKind::PageImage => {}
            RecordKind::TxnStart => {
                let seq = record::decode_txn(&record.payload)?;
                started.insert(seq, record.timestamp);
                state.max_txn_seq = state.max_txn_seq.max(seq);
            }
            RecordKind::TxnCommit => {
                let seq = record::decode_txn(&record.payload)?;
                ended.insert(seq, true);
                state.max_txn_seq = state.max_txn_seq.max(seq);
                state.committed.push((seq, record.timestamp));
            }
            RecordKind::TxnAbort => {
                let seq = record::decode_txn(&record.payload)?;
                ended.insert(seq, false);
                state.max_txn_seq = state.max_txn_seq.max(seq);
            }
            RecordKind::Checkpoint => {}
            RecordKind::TreeMeta => {
                let (op, volume, name, root) = record::decode_tree_meta(&record.payload)?;
                state.tree_events.push(TreeMetaEvent {
                    op,
                    volume,
                    name,
                    root,
                });
            }
            RecordKind::CleanTail => {
                state.clean_shutdown = position == records.len() - 1;
            }
        }
    }

    // Unfinished transactions roll back.
    for (&seq, _) in started.iter() {
        if !ended.contains_key(&seq) {
            state.aborted.push(seq);
        }
    }
    for (&seq, &committed) in ended.iter() {
        if !committed {
            state.aborted.push(seq);
        }
    }
    state.aborted.sort_unstable();
    state.aborted.dedup();

    info!(
        "recovery: {} segments, {} indexed pages, {} committed, {} rolled back, max ts {}, clean={}",
        generations.len(),
        state.page_index.len(),
        state.committed.len(),
        state.aborted.len(),
        state.max_timestamp,
        state.clean_shutdown
    );
    Ok(state)
}

fn list_generations(dir: &Path) -> Result<Vec<u64>> {
    let mut generations = Vec::new();
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(generations),
        Err(e) => return Err(e.into()),
    };
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(digits) = name.strip_prefix("jrn.") {
            if let Ok(generation) = digits.parse::<u64>() {
                generations.push(generation);
            }
        }
    }
    Ok(generations)
}

/// Read all valid records from one segment. Returns `true` if the segment
/// ended in a torn record rather than clean EOF.
fn read_segment(path: &Path, generation: u64, out: &mut Vec<PlacedRecord>) -> Result<bool> {
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);

    let mut header = [0u8; SEGMENT_HEADER_SIZE as usize];
    use std::io::Read;
    reader.read_exact(&mut header)?;
    let stored_generation = record::decode_segment_header(&header)?;
    if stored_generation != generation {
        return Err(Error::CorruptJournal(format!(
            "segment file {:?} claims generation {}",
            path, stored_generation
        )));
    }

    let mut offset = SEGMENT_HEADER_SIZE;
    loop {
        match record::read_record(&mut reader)? {
            Some(record) => {
                let size = record::record_size(record.payload.len());
                out.push(PlacedRecord {
                    generation,
                    offset,
                    record,
                });
                offset += size;
            }
            None => {
                // Clean EOF means we consumed exactly the file; anything
                // left is a torn tail.
                return Ok(offset < file_len);
            }
        }
    }
}
