use serde::{Deserialize, Serialize};

use crate::{
    bits_per, IndexError, RecordName, VirtualChapter, BYTES_PER_BLOCK, BYTES_PER_RECORD_SLOT,
};

/// Address bits inside one chapter delta list. With 64 records per list this
/// yields a mean delta of 2^16 between adjacent chapter index entries.
pub const CHAPTER_ADDRESS_BITS: u32 = 22;

/// One volume header page precedes the chapter data.
pub const HEADER_PAGES_PER_VOLUME: u64 = 1;

/// Records per 4 KiB page (64-byte record slots).
pub const RECORDS_PER_PAGE: u32 = (BYTES_PER_BLOCK / BYTES_PER_RECORD_SLOT) as u32;

/// Immutable chapter geometry: all the counts and bit widths that shape one
/// volume. Never changes after the index is formatted.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Geometry {
    pub bytes_per_page: u32,
    pub record_pages_per_chapter: u32,
    pub chapters_per_volume: u32,
    pub sparse_chapters_per_volume: u32,

    pub records_per_page: u32,
    pub records_per_chapter: u32,
    pub records_per_volume: u64,

    pub chapter_delta_list_bits: u32,
    pub delta_lists_per_chapter: u32,
    pub chapter_mean_delta: u32,
    pub chapter_payload_bits: u32,
    pub chapter_address_bits: u32,

    pub index_pages_per_chapter: u32,
    pub pages_per_chapter: u32,
    pub pages_per_volume: u64,
    pub bytes_per_volume: u64,
}

impl Geometry {
    pub fn new(
        record_pages_per_chapter: u32,
        chapters_per_volume: u32,
        sparse_chapters_per_volume: u32,
    ) -> Result<Self, IndexError> {
        if record_pages_per_chapter == 0 || chapters_per_volume == 0 {
            return Err(IndexError::InvalidArgument("empty geometry"));
        }
        if sparse_chapters_per_volume >= chapters_per_volume {
            return Err(IndexError::InvalidArgument(
                "sparse chapters must leave at least one dense chapter",
            ));
        }

        let records_per_page = RECORDS_PER_PAGE;
        let records_per_chapter = records_per_page * record_pages_per_chapter;
        let records_per_volume = records_per_chapter as u64 * chapters_per_volume as u64;

        // One delta list per 64 records, rounded up to a power of two so the
        // list number is a plain bit field of the name.
        let chapter_delta_list_bits = bits_per((records_per_chapter as u64 - 1) / 64);
        let delta_lists_per_chapter = 1u32 << chapter_delta_list_bits;
        let chapter_mean_delta = ((1u64 << (CHAPTER_ADDRESS_BITS + chapter_delta_list_bits))
            / records_per_chapter as u64) as u32;
        let chapter_payload_bits = bits_per(record_pages_per_chapter as u64 - 1);

        let index_pages_per_chapter = crate::config::chapter_index_page_count(
            records_per_chapter,
            delta_lists_per_chapter,
            chapter_mean_delta,
            chapter_payload_bits,
        );

        let pages_per_chapter = index_pages_per_chapter + record_pages_per_chapter;
        let pages_per_volume = pages_per_chapter as u64 * chapters_per_volume as u64;
        let bytes_per_volume =
            BYTES_PER_BLOCK as u64 * (pages_per_volume + HEADER_PAGES_PER_VOLUME);

        Ok(Geometry {
            bytes_per_page: BYTES_PER_BLOCK as u32,
            record_pages_per_chapter,
            chapters_per_volume,
            sparse_chapters_per_volume,
            records_per_page,
            records_per_chapter,
            records_per_volume,
            chapter_delta_list_bits,
            delta_lists_per_chapter,
            chapter_mean_delta,
            chapter_payload_bits,
            chapter_address_bits: CHAPTER_ADDRESS_BITS,
            index_pages_per_chapter,
            pages_per_chapter,
            pages_per_volume,
            bytes_per_volume,
        })
    }

    pub fn dense_chapters_per_volume(&self) -> u32 {
        self.chapters_per_volume - self.sparse_chapters_per_volume
    }

    pub fn is_sparse(&self) -> bool {
        self.sparse_chapters_per_volume > 0
    }

    /// Physical chapter slot holding a virtual chapter.
    pub fn physical_chapter(&self, vcn: VirtualChapter) -> u32 {
        (vcn % self.chapters_per_volume as u64) as u32
    }

    /// Whether the chapter at `vcn` has aged into the sparse region, given
    /// the newest chapter in the window.
    pub fn is_chapter_sparse(&self, newest: VirtualChapter, vcn: VirtualChapter) -> bool {
        self.is_sparse() && newest.saturating_sub(vcn) >= self.dense_chapters_per_volume() as u64
    }

    /// First block of a page within the volume region (block 0 of the region
    /// is the volume header page).
    pub fn volume_page_block(&self, vcn: VirtualChapter, page_in_chapter: u32) -> u64 {
        HEADER_PAGES_PER_VOLUME
            + self.physical_chapter(vcn) as u64 * self.pages_per_chapter as u64
            + page_in_chapter as u64
    }

    // -- name hashing -------------------------------------------------------

    /// Chapter delta list selected by a name.
    pub fn hash_to_chapter_delta_list(&self, name: &RecordName) -> u32 {
        ((name.chapter_index_field() >> self.chapter_address_bits)
            & (self.delta_lists_per_chapter as u64 - 1)) as u32
    }

    /// Key of a name inside its chapter delta list.
    pub fn hash_to_chapter_delta_address(&self, name: &RecordName) -> u32 {
        (name.chapter_index_field() & ((1u64 << self.chapter_address_bits) - 1)) as u32
    }

    /// Rewrite the delta-list bits of a name; used by tests and by the
    /// record-page collation to synthesize bucket probes.
    pub fn set_chapter_delta_list_bits(&self, name: &RecordName, list: u32) -> RecordName {
        let mut out = *name;
        let mask = (self.delta_lists_per_chapter as u64 - 1) << self.chapter_address_bits;
        let field = (name.chapter_index_field() & !mask)
            | ((list as u64) << self.chapter_address_bits);
        out.set_chapter_index_field(field);
        out
    }

}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_and_record_identities() {
        for (rp, chapters, sparse) in [(1024, 1024, 0), (64, 256, 0), (16, 10240, 9216)] {
            let g = Geometry::new(rp, chapters, sparse).unwrap();
            assert_eq!(
                g.pages_per_chapter,
                g.index_pages_per_chapter + g.record_pages_per_chapter
            );
            assert_eq!(
                g.records_per_volume,
                g.records_per_chapter as u64 * g.chapters_per_volume as u64
            );
            assert_eq!(
                g.bytes_per_volume,
                BYTES_PER_BLOCK as u64 * (g.pages_per_volume + HEADER_PAGES_PER_VOLUME)
            );
            assert_eq!(g.delta_lists_per_chapter, 1 << g.chapter_delta_list_bits);
        }
    }

    #[test]
    fn test_default_dense_geometry() {
        let g = Geometry::new(1024, 1024, 0).unwrap();
        assert_eq!(g.records_per_chapter, 65536);
        assert_eq!(g.records_per_volume, 64 * 1024 * 1024);
        assert_eq!(g.delta_lists_per_chapter, 1024);
        assert_eq!(g.chapter_mean_delta, 65536);
        assert_eq!(g.chapter_payload_bits, 10);
    }

    #[test]
    fn test_physical_chapter_wraps() {
        let g = Geometry::new(64, 256, 0).unwrap();
        assert_eq!(g.physical_chapter(0), 0);
        assert_eq!(g.physical_chapter(255), 255);
        assert_eq!(g.physical_chapter(256), 0);
        assert_eq!(g.physical_chapter(1000), 1000 % 256);
    }

    #[test]
    fn test_delta_list_bits_round_trip() {
        let g = Geometry::new(64, 256, 0).unwrap();
        let name = RecordName([0xA5; 32]);
        for list in [0, 1, 17, g.delta_lists_per_chapter - 1] {
            let renamed = g.set_chapter_delta_list_bits(&name, list);
            assert_eq!(g.hash_to_chapter_delta_list(&renamed), list);
            // untouched windows stay intact
            assert_eq!(renamed.volume_index_field(), name.volume_index_field());
            assert_eq!(renamed.open_chapter_field(), name.open_chapter_field());
            assert_eq!(
                g.hash_to_chapter_delta_address(&renamed),
                g.hash_to_chapter_delta_address(&name)
            );
        }
    }

    #[test]
    fn test_sparse_chapter_aging() {
        let g = Geometry::new(16, 100, 90).unwrap();
        assert_eq!(g.dense_chapters_per_volume(), 10);
        // newest = 50: chapters 41..=50 are dense, 40 and older are sparse
        assert!(!g.is_chapter_sparse(50, 45));
        assert!(!g.is_chapter_sparse(50, 41));
        assert!(g.is_chapter_sparse(50, 40));
        assert!(g.is_chapter_sparse(50, 0));
    }
}
