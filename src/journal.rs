//! Recovery-journal input parsing and missing-decrement synthesis. The
//! journal is produced by the deduplicating block device above the index;
//! recovery consumes it together with the block-map leaves to make
//! reference counts converge after a crash.
//!
//! A journal block is 4 KiB: a 32-byte header, then 512-byte sectors. Every
//! sector repeats a check byte derived from the block's sequence number and
//! the recovery count; a sector that disagrees is torn and is dropped along
//! with everything after it. A header claiming fewer entries than the
//! sectors hold truncates the block.

use std::collections::HashMap;

use dedup_index_common::{Block, IndexError, BYTES_PER_BLOCK};
use tracing::debug;

pub const JOURNAL_BLOCK_HEADER_SIZE: usize = 32;
pub const SECTOR_SIZE: usize = 512;
pub const SECTOR_HEADER_SIZE: usize = 4;
pub const ENTRY_SIZE: usize = 16;
pub const ENTRIES_PER_SECTOR: usize = (SECTOR_SIZE - SECTOR_HEADER_SIZE) / ENTRY_SIZE;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JournalBlockHeader {
    pub sequence_number: u64,
    pub recovery_count: u8,
    pub entry_count: u16,
    pub head: u64,
    pub checkpoint: bool,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct JournalEntry {
    pub lbn: u64,
    pub pbn: u64,
    pub increment: bool,
}

/// Check byte all sectors of a block must repeat.
pub fn check_byte(sequence_number: u64) -> u8 {
    ((sequence_number & 0x3F) as u8) | 0x80
}

/// Entries one block can hold (seven sectors follow the header).
pub const ENTRIES_PER_BLOCK: usize = 7 * ENTRIES_PER_SECTOR;

pub fn encode_journal_block(
    header: &JournalBlockHeader,
    entries: &[JournalEntry],
) -> Box<Block> {
    assert!(entries.len() <= ENTRIES_PER_BLOCK);
    let mut block = dedup_index_common::empty_block();
    block[0..8].copy_from_slice(&header.sequence_number.to_le_bytes());
    block[8] = header.recovery_count;
    block[9] = header.checkpoint as u8;
    block[10..12].copy_from_slice(&header.entry_count.to_le_bytes());
    block[12..20].copy_from_slice(&header.head.to_le_bytes());

    for (sector_index, chunk) in entries.chunks(ENTRIES_PER_SECTOR).enumerate() {
        let at = (sector_index + 1) * SECTOR_SIZE;
        block[at] = check_byte(header.sequence_number);
        block[at + 1] = header.recovery_count;
        block[at + 2] = chunk.len() as u8;
        for (i, entry) in chunk.iter().enumerate() {
            let entry_at = at + SECTOR_HEADER_SIZE + i * ENTRY_SIZE;
            block[entry_at..entry_at + 8].copy_from_slice(&entry.lbn.to_le_bytes());
            let packed = (entry.pbn << 1) | entry.increment as u64;
            block[entry_at + 8..entry_at + 16].copy_from_slice(&packed.to_le_bytes());
        }
    }
    block
}

/// Decode one journal block. Returns `None` for a block that was never
/// written (zero header). Torn sectors end the entry list early; the header
/// entry count caps it in the short-header (partial write) case.
pub fn decode_journal_block(
    block: &Block,
) -> Result<Option<(JournalBlockHeader, Vec<JournalEntry>)>, IndexError> {
    debug_assert_eq!(block.len(), BYTES_PER_BLOCK);
    let sequence_number = u64::from_le_bytes(block[0..8].try_into().unwrap());
    if sequence_number == 0 {
        return Ok(None);
    }
    let header = JournalBlockHeader {
        sequence_number,
        recovery_count: block[8],
        checkpoint: block[9] != 0,
        entry_count: u16::from_le_bytes(block[10..12].try_into().unwrap()),
        head: u64::from_le_bytes(block[12..20].try_into().unwrap()),
    };

    let expected_check = check_byte(sequence_number);
    let mut entries = Vec::with_capacity(header.entry_count as usize);
    'sectors: for sector_index in 1..BYTES_PER_BLOCK / SECTOR_SIZE {
        let at = sector_index * SECTOR_SIZE;
        if block[at] != expected_check || block[at + 1] != header.recovery_count {
            // Torn sector: everything from here on predates this block.
            debug!(
                sequence = sequence_number,
                sector = sector_index,
                "torn journal sector"
            );
            break;
        }
        let count = (block[at + 2] as usize).min(ENTRIES_PER_SECTOR);
        for i in 0..count {
            if entries.len() == header.entry_count as usize {
                break 'sectors; // short header truncates
            }
            let entry_at = at + SECTOR_HEADER_SIZE + i * ENTRY_SIZE;
            let lbn = u64::from_le_bytes(block[entry_at..entry_at + 8].try_into().unwrap());
            let packed =
                u64::from_le_bytes(block[entry_at + 8..entry_at + 16].try_into().unwrap());
            entries.push(JournalEntry {
                lbn,
                pbn: packed >> 1,
                increment: packed & 1 != 0,
            });
        }
    }
    Ok(Some((header, entries)))
}

// ---------------------------------------------------------------------------
// Missing-decrement synthesis
// ---------------------------------------------------------------------------

/// Walk the journal's increment/decrement trail against the block-map
/// leaves and emit one synthetic decrement for every physical block the
/// journal still holds a reference to that the map no longer points at.
///
/// Idempotent by construction: blocks whose recovery count does not match
/// `recovery_count` are from an earlier epoch and are ignored, so running
/// this again after recovery bumped the count synthesizes nothing.
pub fn synthesize_missing_decrements(
    blocks: &[Box<Block>],
    recovery_count: u8,
    block_map: &HashMap<u64, u64>,
) -> Result<Vec<JournalEntry>, IndexError> {
    // Net journal mapping per LBN, applied in sequence order.
    let mut decoded = Vec::new();
    for block in blocks {
        if let Some((header, entries)) = decode_journal_block(block)? {
            if header.recovery_count != recovery_count {
                continue;
            }
            decoded.push((header.sequence_number, entries));
        }
    }
    decoded.sort_by_key(|(sequence, _)| *sequence);

    let mut journal_view: HashMap<u64, u64> = HashMap::new();
    for (_, entries) in &decoded {
        for entry in entries {
            if entry.increment {
                journal_view.insert(entry.lbn, entry.pbn);
            } else {
                journal_view.remove(&entry.lbn);
            }
        }
    }

    let mut synthetic = Vec::new();
    for (&lbn, &pbn) in &journal_view {
        if block_map.get(&lbn) != Some(&pbn) {
            synthetic.push(JournalEntry {
                lbn,
                pbn,
                increment: false,
            });
        }
    }
    synthetic.sort_by_key(|e| e.lbn);
    debug!(count = synthetic.len(), "synthetic decrements");
    Ok(synthetic)
}
