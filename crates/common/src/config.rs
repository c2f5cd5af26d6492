use serde::{Deserialize, Serialize};

use crate::geometry::Geometry;
use crate::{bits_per, div_round_up, IndexError, BYTES_PER_BLOCK, MAX_ZONES};

// ---------------------------------------------------------------------------
// Tunables shared by sizing and the runtime structures
// ---------------------------------------------------------------------------

pub const DEFAULT_CHAPTERS_PER_VOLUME: u32 = 1024;
pub const DEFAULT_VOLUME_INDEX_MEAN_DELTA: u32 = 4096;
pub const DEFAULT_SPARSE_SAMPLE_RATE: u32 = 32;
pub const DEFAULT_CACHE_CHAPTERS: u32 = 7;

/// Sparse geometries index ten times the window, nine tenths of it sparse.
const SPARSE_MULTIPLIER: u32 = 10;

/// Expected names per volume-index delta list.
const VOLUME_INDEX_LIST_SIZE: u64 = 256;

/// Bit cost of one immutable delta-list header on a chapter index page.
const IMMUTABLE_LIST_HEADER_BITS: u64 = 32;

/// Byte cost of a chapter index page header (magic, version, vcn, list
/// range, checksum).
pub const CHAPTER_INDEX_PAGE_HEADER_SIZE: usize = 28;

/// Per-zone bookkeeping record in a volume index save stream.
const DELTA_LIST_SAVE_INFO_SIZE: u64 = 16;

/// Each index save keeps two rotating slots.
pub const MAX_SAVES: u64 = 2;

// ---------------------------------------------------------------------------
// Delta coding arithmetic (shared with crates/delta)
// ---------------------------------------------------------------------------

/// Constants of the delta code for a given mean delta. `incr_keys` is the
/// rounded value of `mean * ln 2`; deltas below `min_keys` fit in `min_bits`
/// and every further `incr_keys` of delta costs one more bit.
pub fn compute_coding_constants(mean_delta: u32) -> (u32, u32, u32) {
    let incr_keys = ((mean_delta as u64 * 693_147 + 500_000) / 1_000_000) as u32;
    let min_bits = bits_per(incr_keys as u64 + 1);
    let min_keys = (1u32 << min_bits) - incr_keys;
    (min_bits, min_keys, incr_keys)
}

/// Expected bit size of a delta index holding `entry_count` entries. Each
/// delta averages about `min_bits + 1.5` bits.
pub fn delta_index_bit_size(entry_count: u64, mean_delta: u32, payload_bits: u32) -> u64 {
    let (min_bits, _, _) = compute_coding_constants(mean_delta);
    entry_count * (payload_bits as u64 + min_bits as u64 + 1) + entry_count / 2
}

/// Number of immutable index pages needed to hold one chapter's delta index.
pub fn chapter_index_page_count(
    entry_count: u32,
    list_count: u32,
    mean_delta: u32,
    payload_bits: u32,
) -> u32 {
    let mut bits = delta_index_bit_size(entry_count as u64, mean_delta, payload_bits);
    let bits_per_list = bits / list_count as u64;
    bits += list_count as u64 * IMMUTABLE_LIST_HEADER_BITS;
    // One list header plus one average list of slack per page covers the
    // internal fragmentation at page boundaries.
    let usable = (BYTES_PER_BLOCK - CHAPTER_INDEX_PAGE_HEADER_SIZE) as u64 * 8
        - IMMUTABLE_LIST_HEADER_BITS
        - bits_per_list;
    div_round_up(bits, usable) as u32
}

// ---------------------------------------------------------------------------
// Memory presets
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum MemoryPreset {
    Mb256,
    Mb512,
    Mb768,
    Gb1,
}

impl MemoryPreset {
    pub fn record_pages_per_chapter(self) -> u32 {
        match self {
            MemoryPreset::Mb256 => 1024,
            MemoryPreset::Mb512 => 2048,
            MemoryPreset::Mb768 => 3072,
            MemoryPreset::Gb1 => 4096,
        }
    }

    /// Encoding used in the super-block index_config field.
    pub fn as_mem_code(self) -> u32 {
        match self {
            MemoryPreset::Mb256 => 256,
            MemoryPreset::Mb512 => 512,
            MemoryPreset::Mb768 => 768,
            MemoryPreset::Gb1 => 1024,
        }
    }

    pub fn from_mem_code(code: u32) -> Result<Self, IndexError> {
        match code {
            256 => Ok(MemoryPreset::Mb256),
            512 => Ok(MemoryPreset::Mb512),
            768 => Ok(MemoryPreset::Mb768),
            1024 => Ok(MemoryPreset::Gb1),
            _ => Err(IndexError::InvalidArgument("unknown memory preset")),
        }
    }
}

/// User-facing index parameters, as accepted by `Session::open_index`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexParameters {
    pub preset: MemoryPreset,
    pub sparse: bool,
    /// One chapter smaller, for stores that must leave room for a header.
    pub reduced: bool,
    pub zone_count: usize,
    pub nonce: u64,
}

impl IndexParameters {
    pub fn chapters_per_volume(&self) -> u32 {
        let mut chapters = DEFAULT_CHAPTERS_PER_VOLUME;
        if self.sparse {
            chapters *= SPARSE_MULTIPLIER;
        }
        if self.reduced {
            chapters -= 1;
        }
        chapters
    }

    pub fn sparse_chapters_per_volume(&self) -> u32 {
        if self.sparse {
            9 * (DEFAULT_CHAPTERS_PER_VOLUME * SPARSE_MULTIPLIER) / 10
        } else {
            0
        }
    }
}

/// Full configuration of one index instance.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct IndexConfig {
    pub geometry: Geometry,
    pub zone_count: usize,
    pub volume_index_mean_delta: u32,
    pub sparse_sample_rate: u32,
    pub cache_chapters: u32,
    pub nonce: u64,
}

impl IndexConfig {
    pub fn from_parameters(params: &IndexParameters) -> Result<Self, IndexError> {
        if params.zone_count == 0 || params.zone_count > MAX_ZONES {
            return Err(IndexError::InvalidArgument("zone count out of range"));
        }
        let geometry = Geometry::new(
            params.preset.record_pages_per_chapter(),
            params.chapters_per_volume(),
            params.sparse_chapters_per_volume(),
        )?;
        Ok(IndexConfig {
            geometry,
            zone_count: params.zone_count,
            volume_index_mean_delta: DEFAULT_VOLUME_INDEX_MEAN_DELTA,
            sparse_sample_rate: DEFAULT_SPARSE_SAMPLE_RATE,
            cache_chapters: DEFAULT_CACHE_CHAPTERS,
            nonce: params.nonce,
        })
    }

    /// A small hand-built geometry, used by embedders and tests that do not
    /// want a multi-gigabyte volume.
    pub fn custom(geometry: Geometry, zone_count: usize, nonce: u64) -> Result<Self, IndexError> {
        if zone_count == 0 || zone_count > MAX_ZONES {
            return Err(IndexError::InvalidArgument("zone count out of range"));
        }
        Ok(IndexConfig {
            geometry,
            zone_count,
            volume_index_mean_delta: DEFAULT_VOLUME_INDEX_MEAN_DELTA,
            sparse_sample_rate: DEFAULT_SPARSE_SAMPLE_RATE,
            cache_chapters: DEFAULT_CACHE_CHAPTERS,
            nonce,
        })
    }

    /// Chapter counts are kept odd only by the reduced variants, so parity
    /// identifies them; sizing then rounds up to keep the name-to-list
    /// mapping identical to the unreduced index.
    pub fn rounded_chapters(&self) -> u32 {
        let chapters = self.geometry.chapters_per_volume;
        chapters + (chapters % 2)
    }
}

// ---------------------------------------------------------------------------
// Volume index sizing
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SubIndexParams {
    pub entry_count: u64,
    pub list_count: u64,
    pub chapter_bits: u32,
    pub mean_delta: u32,
    pub memory_size: u64,
    /// Names between this sub-index's lists: 1 for the dense sub-index, the
    /// sample rate for the hook sub-index.
    pub sample_modulus: u32,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VolumeIndexParams {
    /// Chapters the index retains entries for, including flush slack.
    pub chapters_in_index: u32,
    pub non_hook: SubIndexParams,
    pub hook: Option<SubIndexParams>,
    pub sample_rate: u32,
}

fn sub_index_params(
    entry_count: u64,
    list_count: u64,
    chapter_bits: u32,
    mean_delta: u32,
    sample_modulus: u32,
) -> SubIndexParams {
    let bits = delta_index_bit_size(entry_count, mean_delta, chapter_bits);
    // Six percent of slack lets lists fill unevenly before a rebalance.
    let memory_size = (bits / 8) * 106 / 100;
    SubIndexParams {
        entry_count,
        list_count,
        chapter_bits,
        mean_delta,
        memory_size,
        sample_modulus,
    }
}

pub fn compute_volume_index_params(config: &IndexConfig) -> VolumeIndexParams {
    let geometry = &config.geometry;
    let records = geometry.records_per_chapter as u64;
    let rounded = config.rounded_chapters() as u64;
    // Slack chapters allow the early LRU flush to lag behind the window.
    let invalid = (rounded / 256).max(2);
    let window = rounded + invalid;
    let chapter_bits = bits_per(window - 1);
    let mean = config.volume_index_mean_delta;

    if geometry.is_sparse() {
        let dense = rounded - geometry.sparse_chapters_per_volume as u64;
        let rate = config.sparse_sample_rate as u64;
        let hook = sub_index_params(
            records * window / rate,
            (records * rounded / rate / VOLUME_INDEX_LIST_SIZE).max(256),
            chapter_bits,
            mean,
            config.sparse_sample_rate,
        );
        let non_hook = sub_index_params(
            records * (dense + invalid),
            (records * rounded / VOLUME_INDEX_LIST_SIZE).max(256),
            chapter_bits,
            mean,
            1,
        );
        VolumeIndexParams {
            chapters_in_index: window as u32,
            non_hook,
            hook: Some(hook),
            sample_rate: config.sparse_sample_rate,
        }
    } else {
        let non_hook = sub_index_params(
            records * window,
            (records * rounded / VOLUME_INDEX_LIST_SIZE).max(256),
            chapter_bits,
            mean,
            1,
        );
        VolumeIndexParams {
            chapters_in_index: window as u32,
            non_hook,
            hook: None,
            sample_rate: config.sparse_sample_rate,
        }
    }
}

/// Blocks needed to save the volume index, at any zone count up to the
/// maximum.
pub fn compute_volume_index_save_blocks(config: &IndexConfig) -> u64 {
    let params = compute_volume_index_params(config);
    let mut memory = params.non_hook.memory_size + params.non_hook.list_count * 8;
    if let Some(hook) = &params.hook {
        memory += hook.memory_size + hook.list_count * 8;
    }
    div_round_up(
        memory + MAX_ZONES as u64 * DELTA_LIST_SAVE_INFO_SIZE,
        BYTES_PER_BLOCK as u64,
    ) + MAX_ZONES as u64
}

// ---------------------------------------------------------------------------
// Layout sizing
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LayoutSizes {
    pub volume_blocks: u64,
    pub volume_index_blocks: u64,
    pub page_map_blocks: u64,
    pub open_chapter_blocks: u64,
    pub save_blocks: u64,
    pub total_blocks: u64,
}

pub fn compute_layout_sizes(config: &IndexConfig) -> LayoutSizes {
    let geometry = &config.geometry;
    let rounded = config.rounded_chapters() as u64;
    let volume_blocks = geometry.bytes_per_volume / BYTES_PER_BLOCK as u64;
    let volume_index_blocks = compute_volume_index_save_blocks(config);
    // Sized on the rounded chapter count so reduced layouts differ from
    // their parents by exactly one chapter of volume.
    let page_map_blocks = div_round_up(
        16 + rounded * (geometry.index_pages_per_chapter as u64 - 1) * 2,
        BYTES_PER_BLOCK as u64,
    );
    let open_chapter_blocks = div_round_up(
        20 + geometry.records_per_chapter as u64 * crate::BYTES_PER_PACKED_RECORD as u64,
        BYTES_PER_BLOCK as u64,
    );
    let save_blocks = 1 + volume_index_blocks + page_map_blocks + open_chapter_blocks;
    let total_blocks = 3 + volume_blocks + MAX_SAVES * save_blocks;
    LayoutSizes {
        volume_blocks,
        volume_index_blocks,
        page_map_blocks,
        open_chapter_blocks,
        save_blocks,
        total_blocks,
    }
}

/// Bytes of backing store needed for an index with the given parameters.
/// Pure: depends on nothing but the parameters.
pub fn compute_index_size(params: &IndexParameters) -> Result<u64, IndexError> {
    let config = IndexConfig::from_parameters(params)?;
    Ok(compute_layout_sizes(&config).total_blocks * BYTES_PER_BLOCK as u64)
}
