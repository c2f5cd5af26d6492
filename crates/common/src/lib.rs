use std::fmt;

pub mod config;
pub mod geometry;

pub use config::{compute_index_size, IndexConfig, MemoryPreset};
pub use geometry::Geometry;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Monotonically increasing virtual chapter number.
pub type VirtualChapter = u64;

/// 4 KiB block, the unit of all volume and layout I/O.
pub const BYTES_PER_BLOCK: usize = 4096;

pub const RECORD_NAME_SIZE: usize = 32;
pub const RECORD_DATA_SIZE: usize = 16;

/// On-disk record slot: name + metadata padded to a power of two so records
/// never straddle a page and slot addressing stays shift/mask.
pub const BYTES_PER_RECORD_SLOT: usize = 64;

/// Bytes of a record in a saved open chapter (no slot padding).
pub const BYTES_PER_PACKED_RECORD: usize = RECORD_NAME_SIZE + RECORD_DATA_SIZE;

/// Upper bound on index zone counts accepted anywhere in the engine.
pub const MAX_ZONES: usize = 16;

/// A fixed-size 4 KiB page image.
pub type Block = [u8; BYTES_PER_BLOCK];

pub fn empty_block() -> Box<Block> {
    Box::new([0u8; BYTES_PER_BLOCK])
}

/// Opaque record name, typically a content fingerprint supplied by the
/// caller. Disjoint byte windows feed the different sub-structures so their
/// probe sequences are independent.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RecordName(pub [u8; RECORD_NAME_SIZE]);

/// Opaque per-record metadata; never interpreted by the index.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct RecordData(pub [u8; RECORD_DATA_SIZE]);

impl RecordName {
    /// Bits selecting a volume-index delta list and an address within it.
    pub fn volume_index_field(&self) -> u64 {
        u64::from_le_bytes(self.0[0..8].try_into().unwrap())
    }

    /// Bits selecting a chapter delta list and an address within it.
    pub fn chapter_index_field(&self) -> u64 {
        u64::from_le_bytes(self.0[8..16].try_into().unwrap())
    }

    /// Bits deciding whether a name is sampled into the sparse index.
    pub fn sample_field(&self) -> u32 {
        u32::from_le_bytes(self.0[16..20].try_into().unwrap())
    }

    /// Bits driving the open-chapter hash table probe.
    pub fn open_chapter_field(&self) -> u64 {
        u64::from_le_bytes(self.0[24..32].try_into().unwrap())
    }

    fn set_chapter_index_field(&mut self, field: u64) {
        self.0[8..16].copy_from_slice(&field.to_le_bytes());
    }
}

impl fmt::Debug for RecordName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RecordName(")?;
        for byte in &self.0[..8] {
            write!(f, "{byte:02x}")?;
        }
        write!(f, "…)")
    }
}

// ---------------------------------------------------------------------------
// Block store: the capability boundary to the backing device
// ---------------------------------------------------------------------------

/// Byte store divided into fixed 4 KiB blocks. The engine only ever reads and
/// writes whole blocks; `sync` is a write fence.
pub trait BlockStore: Send + Sync {
    fn read_block(&self, block: u64, buf: &mut Block) -> Result<(), IndexError>;
    fn write_block(&self, block: u64, buf: &Block) -> Result<(), IndexError>;
    fn block_count(&self) -> u64;
    fn sync(&self) -> Result<(), IndexError>;
}

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("no space left in {0}")]
    NoSpace(&'static str),

    #[error("delta list overflow")]
    Overflow,

    #[error("corrupt data: {0}")]
    CorruptData(&'static str),

    #[error("unsupported version {major}.{minor}")]
    UnsupportedVersion { major: u32, minor: u32 },

    #[error("bad magic")]
    BadMagic,

    #[error("nonce mismatch: expected {expected:#x}, found {found:#x}")]
    BadNonce { expected: u64, found: u64 },

    #[error("checksum mismatch: expected {expected:#010x}, found {found:#010x}")]
    ChecksumMismatch { expected: u32, found: u32 },

    #[error("incorrect component id {0}")]
    IncorrectComponent(u32),

    #[error("index was not saved cleanly")]
    IndexNotSavedCleanly,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("value out of range: {0}")]
    OutOfRange(&'static str),

    #[error("index is read-only")]
    ReadOnly,

    #[error("index is disabled")]
    Disabled,

    #[error("unexpected end of file")]
    EndOfFile,
}

// ---------------------------------------------------------------------------
// Small shared arithmetic
// ---------------------------------------------------------------------------

/// Number of bits needed to represent `n` (1 for zero).
pub fn bits_per(n: u64) -> u32 {
    if n == 0 {
        1
    } else {
        64 - n.leading_zeros()
    }
}

/// Ceiling division on u64.
pub fn div_round_up(numerator: u64, denominator: u64) -> u64 {
    numerator.div_ceil(denominator)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bits_per() {
        assert_eq!(bits_per(0), 1);
        assert_eq!(bits_per(1), 1);
        assert_eq!(bits_per(2), 2);
        assert_eq!(bits_per(255), 8);
        assert_eq!(bits_per(256), 9);
        assert_eq!(bits_per(1023), 10);
        assert_eq!(bits_per(u64::MAX), 64);
    }

    #[test]
    fn test_name_fields_are_disjoint() {
        let mut bytes = [0u8; RECORD_NAME_SIZE];
        for (i, b) in bytes.iter_mut().enumerate() {
            *b = i as u8;
        }
        let name = RecordName(bytes);

        assert_eq!(name.volume_index_field().to_le_bytes(), bytes[0..8]);
        assert_eq!(name.chapter_index_field().to_le_bytes(), bytes[8..16]);
        assert_eq!(name.sample_field().to_le_bytes(), bytes[16..20]);
        assert_eq!(name.open_chapter_field().to_le_bytes(), bytes[24..32]);
    }
}
