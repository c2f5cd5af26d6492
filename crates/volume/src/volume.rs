//! The on-disk record store: a circular array of chapters, each a run of
//! index pages followed by record pages. Reads go through the shared page
//! cache; only the chapter writer issues writes.

use std::sync::Arc;

use dedup_index_common::{
    Block, BlockStore, Geometry, IndexError, RecordData, RecordName, VirtualChapter,
};
use dedup_index_delta::page::{read_header, search_page, DeltaCoding, DeltaPageHeader};
use tracing::{debug, warn};

use crate::index_page_map::IndexPageMap;
use crate::page_cache::{PageCache, PageCacheStats, PinnedPage};
use crate::record_page::{read_record_page, search_record_page};

pub struct Volume {
    pub geometry: Geometry,
    store: Arc<dyn BlockStore>,
    first_block: u64,
    cache: PageCache,
    coding: DeltaCoding,
}

impl Volume {
    pub fn new(
        geometry: Geometry,
        store: Arc<dyn BlockStore>,
        first_block: u64,
        cache_pages: usize,
    ) -> Self {
        let coding = DeltaCoding::new(geometry.chapter_mean_delta, geometry.chapter_payload_bits);
        Volume {
            geometry,
            store,
            first_block,
            cache: PageCache::new(cache_pages),
            coding,
        }
    }

    pub fn coding(&self) -> DeltaCoding {
        self.coding
    }

    fn absolute_page(&self, vcn: VirtualChapter, page_in_chapter: u32) -> u64 {
        self.first_block + self.geometry.volume_page_block(vcn, page_in_chapter)
    }

    /// Pin a chapter page through the cache.
    pub fn fetch_page(
        &self,
        vcn: VirtualChapter,
        page_in_chapter: u32,
    ) -> Result<PinnedPage, IndexError> {
        self.cache
            .get(self.store.as_ref(), self.absolute_page(vcn, page_in_chapter))
    }

    /// Look a name up in a stored chapter: route to the index page, search
    /// the chapter delta index, then fetch the record.
    pub fn lookup(
        &self,
        map: &IndexPageMap,
        name: &RecordName,
        vcn: VirtualChapter,
    ) -> Result<Option<RecordData>, IndexError> {
        let chapter = self.geometry.physical_chapter(vcn);
        let page_number = map.find_index_page_number(&self.geometry, name, chapter);
        let pinned = self.fetch_page(vcn, page_number)?;
        let header = match self.chapter_page_header(pinned.data())? {
            Some(header) => header,
            None => return Ok(None), // never written
        };
        if header.vcn != vcn {
            // The physical slot has been reused by a newer chapter.
            return Ok(None);
        }

        let list = self.geometry.hash_to_chapter_delta_list(name);
        let key = self.geometry.hash_to_chapter_delta_address(name);
        let record_page =
            match search_page(pinned.data(), &header, &self.coding, list, key, &name.0)? {
                Some(value) => value,
                None => return Ok(None),
            };
        drop(pinned);

        if record_page >= self.geometry.record_pages_per_chapter {
            return Err(IndexError::CorruptData("record page number out of range"));
        }
        let pinned = self.fetch_page(
            vcn,
            self.geometry.index_pages_per_chapter + record_page,
        )?;
        Ok(search_record_page(pinned.data(), name))
    }

    fn chapter_page_header(
        &self,
        page: &Block,
    ) -> Result<Option<DeltaPageHeader>, IndexError> {
        if page[0..4] == [0u8; 4] {
            return Ok(None);
        }
        match read_header(page) {
            Ok(header) => Ok(Some(header)),
            Err(IndexError::BadMagic) => Err(IndexError::CorruptData("chapter index page")),
            Err(e) => Err(e),
        }
    }

    /// Write one closed chapter: index pages, then record pages, then a
    /// fence. The physical slot is dropped from the cache first.
    pub fn write_chapter(
        &self,
        vcn: VirtualChapter,
        index_pages: &[Box<Block>],
        record_pages: &[Box<Block>],
    ) -> Result<(), IndexError> {
        debug_assert_eq!(index_pages.len() as u32, self.geometry.index_pages_per_chapter);
        debug_assert_eq!(
            record_pages.len() as u32,
            self.geometry.record_pages_per_chapter
        );
        self.cache.invalidate_range(
            self.absolute_page(vcn, 0),
            self.geometry.pages_per_chapter as u64,
        );
        for (i, page) in index_pages.iter().enumerate() {
            self.store
                .write_block(self.absolute_page(vcn, i as u32), page)?;
        }
        for (i, page) in record_pages.iter().enumerate() {
            self.store.write_block(
                self.absolute_page(vcn, self.geometry.index_pages_per_chapter + i as u32),
                page,
            )?;
        }
        self.store.sync()?;
        debug!(vcn, chapter = self.geometry.physical_chapter(vcn), "chapter written");
        Ok(())
    }

    /// Virtual chapter currently stored in a physical slot, if any.
    pub fn stored_chapter(&self, physical_chapter: u32) -> Result<Option<u64>, IndexError> {
        let block = self.first_block
            + dedup_index_common::geometry::HEADER_PAGES_PER_VOLUME
            + physical_chapter as u64 * self.geometry.pages_per_chapter as u64;
        let mut page = dedup_index_common::empty_block();
        self.store.read_block(block, &mut page)?;
        Ok(self.chapter_page_header(&page)?.map(|h| h.vcn))
    }

    /// Scan every physical slot for the live window. Returns
    /// `(oldest, newest)` or `None` for a freshly formatted volume.
    pub fn find_chapter_bounds(&self) -> Result<Option<(u64, u64)>, IndexError> {
        let mut bounds: Option<(u64, u64)> = None;
        for chapter in 0..self.geometry.chapters_per_volume {
            let vcn = match self.stored_chapter(chapter) {
                Ok(Some(vcn)) => vcn,
                Ok(None) => continue,
                Err(e) => {
                    warn!(chapter, error = %e, "unreadable chapter header during scan");
                    return Err(e);
                }
            };
            bounds = Some(match bounds {
                None => (vcn, vcn),
                Some((lo, hi)) => (lo.min(vcn), hi.max(vcn)),
            });
        }
        Ok(bounds)
    }

    /// All index page headers of a stored chapter, in page order; `None`
    /// when the chapter is incoherent (a crash caught it mid-write), which
    /// the rebuild treats as absent. Checksum damage is still an error.
    pub fn chapter_index_headers(
        &self,
        vcn: VirtualChapter,
    ) -> Result<Option<Vec<DeltaPageHeader>>, IndexError> {
        let mut headers = Vec::with_capacity(self.geometry.index_pages_per_chapter as usize);
        for page in 0..self.geometry.index_pages_per_chapter {
            let pinned = self.fetch_page(vcn, page)?;
            match self.chapter_page_header(pinned.data())? {
                Some(header) if header.vcn == vcn => headers.push(header),
                Some(_) | None => return Ok(None),
            }
        }
        Ok(Some(headers))
    }

    /// All records of a stored chapter, for replay into the volume index.
    pub fn chapter_records(
        &self,
        vcn: VirtualChapter,
    ) -> Result<Vec<(RecordName, RecordData)>, IndexError> {
        let mut records = Vec::new();
        for page in 0..self.geometry.record_pages_per_chapter {
            let pinned =
                self.fetch_page(vcn, self.geometry.index_pages_per_chapter + page)?;
            records.extend(read_record_page(pinned.data()));
        }
        Ok(records)
    }

    pub fn cache_stats(&self) -> PageCacheStats {
        self.cache.stats()
    }
}
