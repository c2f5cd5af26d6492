//! On-store layout: the super block (geometry block plus index
//! configuration record), the dirty seal, two rotating save slots, and the
//! volume region.
//!
//! ```text
//! [0: super block][1: seal][2: reserved][save A][save B][volume...]
//! save slot = [header block][page map][open chapter][volume index zones]
//! ```

use std::sync::Arc;

use dedup_index_common::config::{compute_layout_sizes, LayoutSizes};
use dedup_index_common::{
    empty_block, BlockStore, Geometry, IndexConfig, IndexError, VirtualChapter, MAX_ZONES,
};
use tracing::{debug, info};

use crate::io::{BufferedReader, BufferedWriter, IoFactory};

pub const GEOMETRY_MAGIC: &[u8; 8] = b"dmvdo001";
pub const COMPONENT_GEOMETRY: u32 = 5;
pub const COMPONENT_INDEX_CONFIG: u32 = 6;
const SEAL_MAGIC: &[u8; 4] = b"SEAL";
const SAVE_MAGIC: &[u8; 4] = b"DSAV";
const SAVE_VERSION: u32 = 1;

/// Geometry block versions supported on load. New indexes are written v5.
pub const GEOMETRY_VERSION_V4: u32 = 4;
pub const GEOMETRY_VERSION_V5: u32 = 5;

const RELEASE_VERSION: u32 = 5;

// ---------------------------------------------------------------------------
// Geometry block (bit-exact)
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GeometryBlock {
    pub version_major: u32,
    pub release_version: u32,
    pub nonce: u64,
    pub uuid: [u8; 16],
    /// Present in v5 only.
    pub bio_offset: u64,
    pub regions: [(u32, u64); 2],
    pub mem_code: u32,
    pub sparse: bool,
}

/// Encoded size: 93 bytes for v4, 101 for v5.
pub fn encode_geometry_block(block: &GeometryBlock) -> Vec<u8> {
    let v5 = block.version_major >= GEOMETRY_VERSION_V5;
    let payload_size: u64 = if v5 { 73 } else { 65 }; // payload + trailing crc

    let mut out = Vec::with_capacity(101);
    out.extend_from_slice(GEOMETRY_MAGIC);
    out.extend_from_slice(&COMPONENT_GEOMETRY.to_le_bytes());
    out.extend_from_slice(&block.version_major.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // minor
    out.extend_from_slice(&payload_size.to_le_bytes());
    out.extend_from_slice(&block.release_version.to_le_bytes());
    out.extend_from_slice(&block.nonce.to_le_bytes());
    out.extend_from_slice(&block.uuid);
    if v5 {
        out.extend_from_slice(&block.bio_offset.to_le_bytes());
    }
    for (id, start) in &block.regions {
        out.extend_from_slice(&id.to_le_bytes());
        out.extend_from_slice(&start.to_le_bytes());
    }
    out.extend_from_slice(&block.mem_code.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // pad
    out.push(block.sparse as u8);

    let crc = crc32fast::hash(&out[8..]);
    out.extend_from_slice(&crc.to_le_bytes());
    out
}

pub fn decode_geometry_block(bytes: &[u8]) -> Result<(GeometryBlock, usize), IndexError> {
    if bytes.len() < 93 {
        return Err(IndexError::EndOfFile);
    }
    if &bytes[0..8] != GEOMETRY_MAGIC {
        return Err(IndexError::BadMagic);
    }
    let id = read_u32(&bytes[8..]);
    if id != COMPONENT_GEOMETRY {
        return Err(IndexError::IncorrectComponent(id));
    }
    let major = read_u32(&bytes[12..]);
    let minor = read_u32(&bytes[16..]);
    if !(major == GEOMETRY_VERSION_V4 || major == GEOMETRY_VERSION_V5) || minor != 0 {
        return Err(IndexError::UnsupportedVersion { major, minor });
    }
    let v5 = major == GEOMETRY_VERSION_V5;
    let total = if v5 { 101 } else { 93 };
    if bytes.len() < total {
        return Err(IndexError::EndOfFile);
    }
    let expected = read_u32(&bytes[total - 4..]);
    let found = crc32fast::hash(&bytes[8..total - 4]);
    if expected != found {
        return Err(IndexError::ChecksumMismatch { expected, found });
    }

    let mut at = 28;
    let release_version = read_u32(&bytes[at..]);
    at += 4;
    let nonce = read_u64(&bytes[at..]);
    at += 8;
    let mut uuid = [0u8; 16];
    uuid.copy_from_slice(&bytes[at..at + 16]);
    at += 16;
    let bio_offset = if v5 {
        let v = read_u64(&bytes[at..]);
        at += 8;
        v
    } else {
        0
    };
    let mut regions = [(0u32, 0u64); 2];
    for region in &mut regions {
        region.0 = read_u32(&bytes[at..]);
        region.1 = read_u64(&bytes[at + 4..]);
        at += 12;
    }
    let mem_code = read_u32(&bytes[at..]);
    at += 8; // mem + pad
    let sparse = bytes[at] != 0;

    Ok((
        GeometryBlock {
            version_major: major,
            release_version,
            nonce,
            uuid,
            bio_offset,
            regions,
            mem_code,
            sparse,
        },
        total,
    ))
}

// ---------------------------------------------------------------------------
// Index configuration record (follows the geometry block in block 0)
// ---------------------------------------------------------------------------

fn encode_config_record(config: &IndexConfig) -> Vec<u8> {
    let mut out = Vec::with_capacity(56);
    out.extend_from_slice(&COMPONENT_INDEX_CONFIG.to_le_bytes());
    out.extend_from_slice(&1u32.to_le_bytes()); // major
    out.extend_from_slice(&0u32.to_le_bytes()); // minor
    out.extend_from_slice(&32u64.to_le_bytes()); // payload + crc
    out.extend_from_slice(&config.geometry.record_pages_per_chapter.to_le_bytes());
    out.extend_from_slice(&config.geometry.chapters_per_volume.to_le_bytes());
    out.extend_from_slice(&config.geometry.sparse_chapters_per_volume.to_le_bytes());
    out.extend_from_slice(&(config.zone_count as u32).to_le_bytes());
    out.extend_from_slice(&config.sparse_sample_rate.to_le_bytes());
    out.extend_from_slice(&config.volume_index_mean_delta.to_le_bytes());
    out.extend_from_slice(&config.cache_chapters.to_le_bytes());
    let crc = crc32fast::hash(&out);
    out.extend_from_slice(&crc.to_le_bytes());
    out
}

fn decode_config_record(bytes: &[u8], nonce: u64) -> Result<IndexConfig, IndexError> {
    if bytes.len() < 52 {
        return Err(IndexError::EndOfFile);
    }
    let id = read_u32(bytes);
    if id != COMPONENT_INDEX_CONFIG {
        return Err(IndexError::IncorrectComponent(id));
    }
    let major = read_u32(&bytes[4..]);
    let minor = read_u32(&bytes[8..]);
    if major != 1 || minor != 0 {
        return Err(IndexError::UnsupportedVersion { major, minor });
    }
    let expected = read_u32(&bytes[48..]);
    let found = crc32fast::hash(&bytes[0..48]);
    if expected != found {
        return Err(IndexError::ChecksumMismatch { expected, found });
    }
    let record_pages = read_u32(&bytes[20..]);
    let chapters = read_u32(&bytes[24..]);
    let sparse_chapters = read_u32(&bytes[28..]);
    let zone_count = read_u32(&bytes[32..]) as usize;
    let sample_rate = read_u32(&bytes[36..]);
    let mean_delta = read_u32(&bytes[40..]);
    let cache_chapters = read_u32(&bytes[44..]);

    let geometry = Geometry::new(record_pages, chapters, sparse_chapters)?;
    let mut config = IndexConfig::custom(geometry, zone_count, nonce)?;
    config.sparse_sample_rate = sample_rate;
    config.volume_index_mean_delta = mean_delta;
    config.cache_chapters = cache_chapters;
    Ok(config)
}

// ---------------------------------------------------------------------------
// Save headers
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SaveHeader {
    pub generation: u64,
    pub newest_vcn: VirtualChapter,
    pub oldest_vcn: VirtualChapter,
    pub open_vcn: VirtualChapter,
    pub zone_count: u32,
    pub clean: bool,
    /// Per-zone (offset, length) in blocks within the volume-index region.
    pub vi_zones: Vec<(u32, u32)>,
}

fn encode_save_header(header: &SaveHeader) -> Box<dedup_index_common::Block> {
    let mut block = empty_block();
    block[0..4].copy_from_slice(SAVE_MAGIC);
    block[4..8].copy_from_slice(&SAVE_VERSION.to_le_bytes());
    block[8..16].copy_from_slice(&header.generation.to_le_bytes());
    block[16..24].copy_from_slice(&header.newest_vcn.to_le_bytes());
    block[24..32].copy_from_slice(&header.oldest_vcn.to_le_bytes());
    block[32..40].copy_from_slice(&header.open_vcn.to_le_bytes());
    block[40..44].copy_from_slice(&header.zone_count.to_le_bytes());
    block[44] = header.clean as u8;
    let mut at = 48;
    for zone in 0..MAX_ZONES {
        let (offset, length) = header.vi_zones.get(zone).copied().unwrap_or((0, 0));
        block[at..at + 4].copy_from_slice(&offset.to_le_bytes());
        block[at + 4..at + 8].copy_from_slice(&length.to_le_bytes());
        at += 8;
    }
    let crc = crc32fast::hash(&block[0..at]);
    block[at..at + 4].copy_from_slice(&crc.to_le_bytes());
    block
}

fn decode_save_header(block: &dedup_index_common::Block) -> Result<Option<SaveHeader>, IndexError> {
    if block[0..4] == [0u8; 4] {
        return Ok(None); // slot never written
    }
    if &block[0..4] != SAVE_MAGIC {
        return Err(IndexError::BadMagic);
    }
    let version = read_u32(&block[4..]);
    if version != SAVE_VERSION {
        return Err(IndexError::UnsupportedVersion {
            major: version,
            minor: 0,
        });
    }
    let crc_at = 48 + MAX_ZONES * 8;
    let expected = read_u32(&block[crc_at..]);
    let found = crc32fast::hash(&block[0..crc_at]);
    if expected != found {
        return Err(IndexError::ChecksumMismatch { expected, found });
    }
    let zone_count = read_u32(&block[40..]);
    let mut vi_zones = Vec::with_capacity(zone_count as usize);
    for zone in 0..zone_count as usize {
        let at = 48 + zone * 8;
        vi_zones.push((read_u32(&block[at..]), read_u32(&block[at + 4..])));
    }
    Ok(Some(SaveHeader {
        generation: read_u64(&block[8..]),
        newest_vcn: read_u64(&block[16..]),
        oldest_vcn: read_u64(&block[24..]),
        open_vcn: read_u64(&block[32..]),
        zone_count,
        clean: block[44] != 0,
        vi_zones,
    }))
}

// ---------------------------------------------------------------------------
// Layout
// ---------------------------------------------------------------------------

const SUPER_BLOCK: u64 = 0;
const SEAL_BLOCK: u64 = 1;
const BASE_BLOCKS: u64 = 3;

pub struct IndexLayout {
    factory: IoFactory,
    config: IndexConfig,
    sizes: LayoutSizes,
    uuid: [u8; 16],
}

impl IndexLayout {
    /// Format a store for a new index: super block, clean seal, empty save
    /// slots.
    pub fn format(
        store: Arc<dyn BlockStore>,
        config: &IndexConfig,
        uuid: [u8; 16],
    ) -> Result<Self, IndexError> {
        let sizes = compute_layout_sizes(config);
        if store.block_count() < sizes.total_blocks {
            return Err(IndexError::NoSpace("backing store smaller than layout"));
        }

        let layout = IndexLayout {
            factory: IoFactory::new(store),
            config: config.clone(),
            sizes,
            uuid,
        };

        let geometry_block = GeometryBlock {
            version_major: GEOMETRY_VERSION_V5,
            release_version: RELEASE_VERSION,
            nonce: config.nonce,
            uuid,
            bio_offset: 0,
            regions: [
                (1, BASE_BLOCKS),
                (2, layout.volume_first_block()),
            ],
            mem_code: 0,
            sparse: config.geometry.is_sparse(),
        };
        let mut block = empty_block();
        let encoded = encode_geometry_block(&geometry_block);
        block[..encoded.len()].copy_from_slice(&encoded);
        let record = encode_config_record(config);
        block[encoded.len()..encoded.len() + record.len()].copy_from_slice(&record);
        layout.store().write_block(SUPER_BLOCK, &block)?;

        layout.write_seal(false)?;
        let zero = empty_block();
        layout
            .store()
            .write_block(layout.save_slot_start(0), &zero)?;
        layout
            .store()
            .write_block(layout.save_slot_start(1), &zero)?;
        layout.store().sync()?;
        info!(
            total_blocks = layout.sizes.total_blocks,
            "index layout formatted"
        );
        Ok(layout)
    }

    /// Open an existing layout, validating the super block. When
    /// `expected_nonce` is given, a mismatch fails with `BadNonce`.
    pub fn load(
        store: Arc<dyn BlockStore>,
        expected_nonce: Option<u64>,
    ) -> Result<Self, IndexError> {
        let mut block = empty_block();
        store.read_block(SUPER_BLOCK, &mut block)?;
        let (geometry_block, used) = decode_geometry_block(&block[..])?;
        if let Some(nonce) = expected_nonce {
            if nonce != geometry_block.nonce {
                return Err(IndexError::BadNonce {
                    expected: nonce,
                    found: geometry_block.nonce,
                });
            }
        }
        let config = decode_config_record(&block[used..], geometry_block.nonce)?;
        let sizes = compute_layout_sizes(&config);
        if store.block_count() < sizes.total_blocks {
            return Err(IndexError::CorruptData("store shrank under the layout"));
        }
        debug!(nonce = geometry_block.nonce, "index layout loaded");
        Ok(IndexLayout {
            factory: IoFactory::new(store),
            config,
            sizes,
            uuid: geometry_block.uuid,
        })
    }

    pub fn store(&self) -> &Arc<dyn BlockStore> {
        self.factory.store()
    }

    pub fn factory(&self) -> &IoFactory {
        &self.factory
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    pub fn uuid(&self) -> [u8; 16] {
        self.uuid
    }

    pub fn sizes(&self) -> &LayoutSizes {
        &self.sizes
    }

    pub fn save_slot_start(&self, slot: usize) -> u64 {
        BASE_BLOCKS + slot as u64 * self.sizes.save_blocks
    }

    pub fn volume_first_block(&self) -> u64 {
        BASE_BLOCKS + 2 * self.sizes.save_blocks
    }

    /// Regions within a save slot, after the header block.
    pub fn page_map_region(&self, slot: usize) -> (u64, u64) {
        (self.save_slot_start(slot) + 1, self.sizes.page_map_blocks)
    }

    pub fn open_chapter_region(&self, slot: usize) -> (u64, u64) {
        let (start, blocks) = self.page_map_region(slot);
        (start + blocks, self.sizes.open_chapter_blocks)
    }

    pub fn volume_index_region(&self, slot: usize) -> (u64, u64) {
        let (start, blocks) = self.open_chapter_region(slot);
        (start + blocks, self.sizes.volume_index_blocks)
    }

    pub fn region_reader(&self, region: (u64, u64)) -> BufferedReader {
        self.factory.reader(region.0, region.1)
    }

    pub fn region_writer(&self, region: (u64, u64)) -> BufferedWriter {
        self.factory.writer(region.0, region.1)
    }

    // -- seal (dirty flag) --------------------------------------------------

    pub fn write_seal(&self, dirty: bool) -> Result<(), IndexError> {
        let mut block = empty_block();
        block[0..4].copy_from_slice(SEAL_MAGIC);
        block[4..8].copy_from_slice(&1u32.to_le_bytes());
        block[8] = dirty as u8;
        let crc = crc32fast::hash(&block[0..12]);
        block[12..16].copy_from_slice(&crc.to_le_bytes());
        self.store().write_block(SEAL_BLOCK, &block)?;
        self.store().sync()
    }

    pub fn is_dirty(&self) -> Result<bool, IndexError> {
        let mut block = empty_block();
        self.store().read_block(SEAL_BLOCK, &mut block)?;
        if &block[0..4] != SEAL_MAGIC {
            return Err(IndexError::CorruptData("seal block"));
        }
        let expected = read_u32(&block[12..]);
        let found = crc32fast::hash(&block[0..12]);
        if expected != found {
            return Err(IndexError::ChecksumMismatch { expected, found });
        }
        Ok(block[8] != 0)
    }

    // -- save slots ---------------------------------------------------------

    pub fn read_save_header(&self, slot: usize) -> Result<Option<SaveHeader>, IndexError> {
        let mut block = empty_block();
        self.store().read_block(self.save_slot_start(slot), &mut block)?;
        decode_save_header(&block)
    }

    pub fn write_save_header(
        &self,
        slot: usize,
        header: &SaveHeader,
    ) -> Result<(), IndexError> {
        let block = encode_save_header(header);
        self.store().write_block(self.save_slot_start(slot), &block)?;
        self.store().sync()
    }

    /// Newest valid save, if any. An unreadable slot is skipped rather than
    /// failing the load; the other slot may still be good.
    pub fn latest_save(&self) -> Result<Option<(usize, SaveHeader)>, IndexError> {
        let mut best: Option<(usize, SaveHeader)> = None;
        for slot in 0..2 {
            match self.read_save_header(slot) {
                Ok(Some(header)) => {
                    if best
                        .as_ref()
                        .map_or(true, |(_, b)| header.generation > b.generation)
                    {
                        best = Some((slot, header));
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(slot, error = %e, "unreadable save slot");
                }
            }
        }
        Ok(best)
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes(bytes[0..4].try_into().unwrap())
}

fn read_u64(bytes: &[u8]) -> u64 {
    u64::from_le_bytes(bytes[0..8].try_into().unwrap())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::MemoryStore;

    fn tiny_config() -> IndexConfig {
        let geometry = Geometry::new(16, 8, 0).unwrap();
        IndexConfig::custom(geometry, 2, 0x1020_304b_eef5_1ab5).unwrap()
    }

    #[test]
    fn test_geometry_block_golden_prefix() {
        let block = GeometryBlock {
            version_major: GEOMETRY_VERSION_V5,
            release_version: RELEASE_VERSION,
            nonce: 0x1020_304b_eef5_1ab5,
            uuid: *b"fake\0uuid hares\0",
            bio_offset: 0,
            regions: [(1, 3), (2, 100)],
            mem_code: 256,
            sparse: false,
        };
        let encoded = encode_geometry_block(&block);
        assert_eq!(encoded.len(), 101);
        // magic, then component id 5, then major version 5, little-endian.
        assert_eq!(
            &encoded[0..16],
            &[
                0x64, 0x6d, 0x76, 0x64, 0x6f, 0x30, 0x30, 0x31, 0x05, 0x00, 0x00, 0x00, 0x05,
                0x00, 0x00, 0x00
            ]
        );
        assert_eq!(&encoded[32..40], &0x1020_304b_eef5_1ab5u64.to_le_bytes());

        let (decoded, used) = decode_geometry_block(&encoded).unwrap();
        assert_eq!(used, 101);
        assert_eq!(decoded, block);
    }

    #[test]
    fn test_geometry_block_v4_omits_bio_offset() {
        let block = GeometryBlock {
            version_major: GEOMETRY_VERSION_V4,
            release_version: RELEASE_VERSION,
            nonce: 42,
            uuid: [7; 16],
            bio_offset: 0,
            regions: [(1, 3), (2, 50)],
            mem_code: 0,
            sparse: true,
        };
        let encoded = encode_geometry_block(&block);
        assert_eq!(encoded.len(), 93);
        let (decoded, used) = decode_geometry_block(&encoded).unwrap();
        assert_eq!(used, 93);
        assert_eq!(decoded.nonce, 42);
        assert!(decoded.sparse);
    }

    #[test]
    fn test_geometry_block_corruption_taxonomy() {
        let block = GeometryBlock {
            version_major: GEOMETRY_VERSION_V5,
            release_version: RELEASE_VERSION,
            nonce: 1,
            uuid: [0; 16],
            bio_offset: 0,
            regions: [(1, 3), (2, 9)],
            mem_code: 0,
            sparse: false,
        };
        let encoded = encode_geometry_block(&block);

        let mut bad = encoded.clone();
        bad[0..5].copy_from_slice(b"FOOBA");
        assert!(matches!(
            decode_geometry_block(&bad),
            Err(IndexError::BadMagic)
        ));

        let mut bad = encoded.clone();
        bad[12..17].copy_from_slice(b"XXXXX");
        assert!(matches!(
            decode_geometry_block(&bad),
            Err(IndexError::UnsupportedVersion { .. })
        ));

        let mut bad = encoded.clone();
        let last = bad.len() - 1;
        bad[last] ^= 0x01;
        assert!(matches!(
            decode_geometry_block(&bad),
            Err(IndexError::ChecksumMismatch { .. })
        ));

        let mut bad = encoded;
        bad[8] = 9; // wrong component id
        assert!(matches!(
            decode_geometry_block(&bad),
            Err(IndexError::IncorrectComponent(9))
        ));
    }

    #[test]
    fn test_format_and_load_round_trip() {
        let config = tiny_config();
        let sizes = compute_layout_sizes(&config);
        let store = Arc::new(MemoryStore::new(sizes.total_blocks));
        let layout = IndexLayout::format(store.clone() as _, &config, [9; 16]).unwrap();
        assert!(!layout.is_dirty().unwrap());
        assert!(layout.latest_save().unwrap().is_none());

        let loaded = IndexLayout::load(store.clone() as _, Some(config.nonce)).unwrap();
        assert_eq!(loaded.config().geometry, config.geometry);
        assert_eq!(loaded.config().zone_count, config.zone_count);
        assert_eq!(loaded.uuid(), [9; 16]);

        assert!(matches!(
            IndexLayout::load(store as _, Some(999)),
            Err(IndexError::BadNonce { .. })
        ));
    }

    #[test]
    fn test_seal_round_trip() {
        let config = tiny_config();
        let sizes = compute_layout_sizes(&config);
        let store = Arc::new(MemoryStore::new(sizes.total_blocks));
        let layout = IndexLayout::format(store as _, &config, [0; 16]).unwrap();

        layout.write_seal(true).unwrap();
        assert!(layout.is_dirty().unwrap());
        layout.write_seal(false).unwrap();
        assert!(!layout.is_dirty().unwrap());
    }

    #[test]
    fn test_save_header_rotation() {
        let config = tiny_config();
        let sizes = compute_layout_sizes(&config);
        let store = Arc::new(MemoryStore::new(sizes.total_blocks));
        let layout = IndexLayout::format(store as _, &config, [0; 16]).unwrap();

        let header = SaveHeader {
            generation: 1,
            newest_vcn: 10,
            oldest_vcn: 3,
            open_vcn: 11,
            zone_count: 2,
            clean: true,
            vi_zones: vec![(0, 4), (4, 4)],
        };
        layout.write_save_header(0, &header).unwrap();
        let (slot, latest) = layout.latest_save().unwrap().unwrap();
        assert_eq!(slot, 0);
        assert_eq!(latest, header);

        let newer = SaveHeader {
            generation: 2,
            open_vcn: 12,
            ..header.clone()
        };
        layout.write_save_header(1, &newer).unwrap();
        let (slot, latest) = layout.latest_save().unwrap().unwrap();
        assert_eq!(slot, 1);
        assert_eq!(latest.generation, 2);
    }

    #[test]
    fn test_regions_are_disjoint_and_ordered() {
        let config = tiny_config();
        let sizes = compute_layout_sizes(&config);
        let store = Arc::new(MemoryStore::new(sizes.total_blocks));
        let layout = IndexLayout::format(store as _, &config, [0; 16]).unwrap();

        for slot in 0..2 {
            let pm = layout.page_map_region(slot);
            let oc = layout.open_chapter_region(slot);
            let vi = layout.volume_index_region(slot);
            assert_eq!(pm.0, layout.save_slot_start(slot) + 1);
            assert_eq!(oc.0, pm.0 + pm.1);
            assert_eq!(vi.0, oc.0 + oc.1);
            assert_eq!(
                vi.0 + vi.1,
                layout.save_slot_start(slot) + sizes.save_blocks
            );
        }
        assert_eq!(layout.volume_first_block(), 3 + 2 * sizes.save_blocks);
        assert_eq!(
            layout.volume_first_block() + sizes.volume_blocks,
            sizes.total_blocks
        );
    }
}
