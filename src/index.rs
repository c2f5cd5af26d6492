//! The index engine: ties the volume, volume index, open chapters, chapter
//! writer and layout together, and applies the request semantics.

use std::io::Read;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use dedup_index_common::{
    BlockStore, Geometry, IndexConfig, IndexError, RecordData, RecordName, VirtualChapter,
};
use dedup_index_volume::index_page_map::IndexPageMap;
use dedup_index_volume::layout::{IndexLayout, SaveHeader};
use dedup_index_volume::volume::Volume;
use tracing::{debug, error, info, warn};

use crate::chapter_writer::build_chapter;
use crate::open_chapter::{load_open_chapter, save_open_chapter, OpenChapterZone};
use crate::request::{Request, RequestType};
use crate::stats::{IndexStats, Stats};
use crate::volume_index::VolumeIndex;

/// How an open is allowed to treat existing state.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OpenMode {
    /// Format the store, discarding anything on it.
    Create,
    /// Load; a dirty index is rebuilt from the volume.
    Load,
    /// Load, but refuse a dirty index.
    NoRebuild,
}

struct ChapterState {
    open_vcn: VirtualChapter,
    oldest_vcn: VirtualChapter,
    newest_written: Option<VirtualChapter>,
}

pub struct Index {
    config: IndexConfig,
    layout: IndexLayout,
    volume: Volume,
    page_map: RwLock<IndexPageMap>,
    volume_index: VolumeIndex,
    open_chapters: Vec<Mutex<OpenChapterZone>>,
    chapter_state: Mutex<ChapterState>,
    stats: Stats,
    read_only: AtomicBool,
    writable: bool,
}

impl Index {
    pub fn geometry(&self) -> &Geometry {
        &self.volume.geometry
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    pub fn zone_count(&self) -> usize {
        self.config.zone_count
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::SeqCst)
    }

    fn zone_capacity(geometry: &Geometry, zone_count: usize) -> u32 {
        geometry.records_per_chapter / zone_count as u32
    }

    fn cache_pages(config: &IndexConfig) -> usize {
        let pages = config.cache_chapters as u64 * config.geometry.pages_per_chapter as u64;
        pages.clamp(16, 16 * 1024) as usize
    }

    // -- construction -------------------------------------------------------

    /// Format the store and start an empty index.
    pub fn create(store: Arc<dyn BlockStore>, config: &IndexConfig) -> Result<Self, IndexError> {
        let layout = IndexLayout::format(Arc::clone(&store), config, [0u8; 16])?;
        let geometry = layout.config().geometry.clone();
        let volume = Volume::new(
            geometry.clone(),
            store,
            layout.volume_first_block(),
            Self::cache_pages(config),
        );
        let volume_index = VolumeIndex::new(config)?;
        let zone_capacity = Self::zone_capacity(&geometry, config.zone_count);
        let open_chapters = (0..config.zone_count)
            .map(|_| Mutex::new(OpenChapterZone::new(zone_capacity)))
            .collect();

        let index = Index {
            config: config.clone(),
            layout,
            volume,
            page_map: RwLock::new(IndexPageMap::new(&geometry)),
            volume_index,
            open_chapters,
            chapter_state: Mutex::new(ChapterState {
                open_vcn: 0,
                oldest_vcn: 0,
                newest_written: None,
            }),
            stats: Stats::default(),
            read_only: AtomicBool::new(false),
            writable: true,
        };
        index.layout.write_seal(true)?; // dirty until the first clean save
        info!("index created");
        Ok(index)
    }

    /// Open an existing index. `Load` rebuilds a dirty index from the
    /// volume; `NoRebuild` refuses it. `writable = false` performs no
    /// writes at all and serves lookups only.
    pub fn open(
        store: Arc<dyn BlockStore>,
        mode: OpenMode,
        expected_nonce: Option<u64>,
        zone_count: usize,
        writable: bool,
    ) -> Result<Self, IndexError> {
        debug_assert_ne!(mode, OpenMode::Create);
        let layout = IndexLayout::load(Arc::clone(&store), expected_nonce)?;
        let mut config = layout.config().clone();
        if zone_count > 0 {
            config.zone_count = zone_count;
        }
        let geometry = config.geometry.clone();
        let volume = Volume::new(
            geometry.clone(),
            Arc::clone(&store),
            layout.volume_first_block(),
            Self::cache_pages(&config),
        );
        let zone_capacity = Self::zone_capacity(&geometry, config.zone_count);
        let open_chapters: Vec<_> = (0..config.zone_count)
            .map(|_| Mutex::new(OpenChapterZone::new(zone_capacity)))
            .collect();

        let dirty = layout.is_dirty()?;
        let latest = layout.latest_save()?;
        let have_clean_save = latest.as_ref().map_or(false, |(_, h)| h.clean);

        let mut index = Index {
            config: config.clone(),
            layout,
            volume,
            page_map: RwLock::new(IndexPageMap::new(&geometry)),
            volume_index: VolumeIndex::new(&config)?,
            open_chapters,
            chapter_state: Mutex::new(ChapterState {
                open_vcn: 0,
                oldest_vcn: 0,
                newest_written: None,
            }),
            stats: Stats::default(),
            read_only: AtomicBool::new(!writable),
            writable,
        };

        if !dirty && have_clean_save {
            let (slot, header) = latest.unwrap();
            index.restore_from_save(slot, &header)?;
        } else if mode == OpenMode::NoRebuild {
            return Err(IndexError::IndexNotSavedCleanly);
        } else {
            info!(dirty, "index was not saved cleanly, rebuilding");
            index.rebuild()?;
        }

        if writable {
            if let Err(e) = index.layout.write_seal(true) {
                // The store refuses writes: stay up, but read-only.
                error!(error = %e, "cannot mark index dirty, latching read-only");
                index.read_only.store(true, Ordering::SeqCst);
            }
        }
        Ok(index)
    }

    fn restore_from_save(&mut self, slot: usize, header: &SaveHeader) -> Result<(), IndexError> {
        let mut reader = self.layout.region_reader(self.layout.page_map_region(slot));
        *self.page_map.write().unwrap() =
            IndexPageMap::load(&self.config.geometry, &mut reader)?;

        // Volume index zones were laid out by the saving process; read each
        // zone's sub-stream and redistribute into our zone count.
        let vi_region = self.layout.volume_index_region(slot);
        let mut streams: Vec<Vec<u8>> = Vec::with_capacity(header.vi_zones.len());
        for &(offset, length) in &header.vi_zones {
            let mut reader = self
                .layout
                .factory()
                .reader(vi_region.0 + offset as u64, length as u64);
            let mut bytes = Vec::new();
            reader.read_to_end(&mut bytes)?;
            streams.push(bytes);
        }
        let mut slices: Vec<&[u8]> = streams.iter().map(|s| s.as_slice()).collect();
        let mut readers: Vec<&mut dyn Read> =
            slices.iter_mut().map(|s| s as &mut dyn Read).collect();
        self.volume_index =
            VolumeIndex::restore(&self.config, self.config.zone_count, &mut readers)?;
        self.volume_index.set_open_chapter(header.open_vcn);

        // Reload the open chapter, redistributing by zone and silently
        // discarding per-zone overflow.
        let mut reader = self
            .layout
            .region_reader(self.layout.open_chapter_region(slot));
        match load_open_chapter(&mut reader) {
            Ok(loaded) => {
                let mut discarded = 0u64;
                for (name, data) in loaded.records {
                    let zone = self.volume_index.zone_for_name(&name);
                    let remaining = self.open_chapters[zone].lock().unwrap().put(&name, &data);
                    if remaining == 0
                        && self.open_chapters[zone].lock().unwrap().search(&name).is_none()
                    {
                        discarded += 1;
                        continue;
                    }
                    let record = self.volume_index.get_record(&name)?;
                    if !record.is_found {
                        self.volume_index.put_record(&record, header.open_vcn)?;
                    }
                }
                for _ in 0..discarded {
                    self.stats.entries_discarded();
                }
            }
            Err(e) => {
                // A damaged or missing open chapter costs those records
                // only.
                warn!(error = %e, "open chapter save unreadable, starting empty");
            }
        }

        let mut state = self.chapter_state.lock().unwrap();
        state.open_vcn = header.open_vcn;
        state.oldest_vcn = header.oldest_vcn;
        state.newest_written = (header.open_vcn > 0).then(|| header.newest_vcn);
        drop(state);
        info!(
            open = header.open_vcn,
            oldest = header.oldest_vcn,
            "index restored from save"
        );
        Ok(())
    }

    /// Scrub the volume back into the in-memory structures after an unclean
    /// shutdown.
    fn rebuild(&mut self) -> Result<(), IndexError> {
        let geometry = self.config.geometry.clone();
        let bounds = self.volume.find_chapter_bounds()?;
        let Some((oldest, newest)) = bounds else {
            debug!("empty volume, nothing to rebuild");
            return Ok(());
        };

        let mut replayed = 0u64;
        for vcn in oldest..=newest {
            let headers = match self.volume.chapter_index_headers(vcn)? {
                Some(headers) => headers,
                None => {
                    warn!(vcn, "incoherent chapter skipped during rebuild");
                    continue;
                }
            };
            {
                let mut map = self.page_map.write().unwrap();
                for (page, header) in headers.iter().enumerate() {
                    let last = if header.list_count > 0 {
                        header.first_list + header.list_count - 1
                    } else {
                        geometry.delta_lists_per_chapter - 1
                    };
                    map.update(&geometry, vcn, page as u32, last)?;
                }
            }

            self.volume_index.set_open_chapter(vcn);
            let sparse_chapter = geometry.is_chapter_sparse(newest, vcn);
            for (name, _) in self.volume.chapter_records(vcn)? {
                if sparse_chapter && !self.volume_index.is_sample(&name) {
                    continue;
                }
                let record = self.volume_index.get_record(&name)?;
                if record.is_found {
                    self.volume_index.set_record_chapter(&record, vcn)?;
                } else {
                    self.volume_index.put_record(&record, vcn)?;
                }
                replayed += 1;
            }
        }

        let open_vcn = newest + 1;
        self.volume_index.set_open_chapter(open_vcn);
        {
            let mut state = self.chapter_state.lock().unwrap();
            state.open_vcn = open_vcn;
            state.oldest_vcn = oldest;
            state.newest_written = Some(newest);
        }

        // The open chapter save may still be readable even though the index
        // is dirty; a missing or damaged one just means starting empty.
        if let Some((slot, header)) = self.layout.latest_save()? {
            if header.open_vcn == open_vcn {
                let mut reader = self
                    .layout
                    .region_reader(self.layout.open_chapter_region(slot));
                if let Ok(loaded) = load_open_chapter(&mut reader) {
                    for (name, data) in loaded.records {
                        let zone = self.volume_index.zone_for_name(&name);
                        let remaining =
                            self.open_chapters[zone].lock().unwrap().put(&name, &data);
                        if remaining > 0 {
                            let record = self.volume_index.get_record(&name)?;
                            if !record.is_found {
                                self.volume_index.put_record(&record, open_vcn)?;
                            }
                        }
                    }
                }
            }
        }

        info!(oldest, newest, replayed, "rebuild complete");
        Ok(())
    }

    // -- chapter close ------------------------------------------------------

    /// Close the open chapter `expected`: quiesce puts, snapshot every
    /// zone, advance the window, build and write the chapter.
    fn close_chapter(&self, expected: VirtualChapter) -> Result<(), IndexError> {
        let records = {
            let mut state = self.chapter_state.lock().unwrap();
            if state.open_vcn != expected {
                return Ok(()); // another thread closed it first
            }
            let mut records = Vec::new();
            let mut guards: Vec<_> = self
                .open_chapters
                .iter()
                .map(|z| z.lock().unwrap())
                .collect();
            for zone in guards.iter_mut() {
                records.extend(zone.take_records());
            }
            state.open_vcn = expected + 1;
            self.volume_index.set_open_chapter(expected + 1);
            records
            // zone guards drop here; puts resume into the next chapter
        };

        let built = build_chapter(&self.volume.geometry, expected, &records)?;
        // Route the map first: a lookup racing the write sees a coherent
        // map and simply misses on the not-yet-written chapter.
        {
            let mut map = self.page_map.write().unwrap();
            for (page, &last) in built.last_lists.iter().enumerate() {
                map.update(&self.volume.geometry, expected, page as u32, last)?;
            }
        }
        if let Err(e) = self
            .volume
            .write_chapter(expected, &built.index_pages, &built.record_pages)
        {
            error!(vcn = expected, error = %e, "chapter write failed, latching read-only");
            self.read_only.store(true, Ordering::SeqCst);
            return Err(e);
        }
        {
            let mut state = self.chapter_state.lock().unwrap();
            state.newest_written = Some(state.newest_written.map_or(expected, |n| n.max(expected)));
            let chapters = self.volume.geometry.chapters_per_volume as u64;
            state.oldest_vcn = state.oldest_vcn.max((expected + 1).saturating_sub(chapters));
        }
        debug!(vcn = expected, records = built.record_count, "chapter closed");
        Ok(())
    }

    /// Add a record to the zone's open chapter, closing the chapter when
    /// this put fills the last slot.
    fn add_to_open_chapter(
        &self,
        zone: usize,
        name: &RecordName,
        data: &RecordData,
    ) -> Result<(), IndexError> {
        let (remaining, open_vcn) = {
            let open_vcn = self.volume_index.zone_open_chapter(zone);
            let mut chapter = self.open_chapters[zone].lock().unwrap();
            (chapter.put(name, data), open_vcn)
        };
        if remaining == 0 {
            self.close_chapter(open_vcn)?;
        }
        Ok(())
    }

    // -- request semantics --------------------------------------------------

    pub fn zone_for_name(&self, name: &RecordName) -> usize {
        self.volume_index.zone_for_name(name)
    }

    /// Resolve a name to its current metadata, if any.
    fn resolve(
        &self,
        zone: usize,
        name: &RecordName,
        vcn: VirtualChapter,
    ) -> Result<Option<RecordData>, IndexError> {
        let open_vcn = self.volume_index.zone_open_chapter(zone);
        if vcn == open_vcn {
            return Ok(self.open_chapters[zone].lock().unwrap().search(name));
        }
        let oldest = self.chapter_state.lock().unwrap().oldest_vcn;
        if vcn < oldest || vcn > open_vcn {
            return Ok(None);
        }
        let map = self.page_map.read().unwrap();
        self.volume.lookup(&map, name, vcn)
    }

    /// Execute one request on the calling (zone) thread.
    pub fn serve(&self, request: &mut Request) -> Result<(), IndexError> {
        self.stats.requests();
        let name = request.name;
        let zone = self.zone_for_name(&name);
        let mutating = !matches!(
            request.request_type,
            RequestType::Query | RequestType::QueryNoUpdate
        );
        if mutating && self.is_read_only() {
            return Err(IndexError::ReadOnly);
        }

        let record = self.volume_index.get_record(&name)?;
        let existing = if record.is_found {
            self.resolve(zone, &name, record.virtual_chapter)?
        } else {
            None
        };
        let open_vcn = self.volume_index.zone_open_chapter(zone);

        match request.request_type {
            RequestType::Post => {
                if let Some(old) = existing {
                    self.stats.posts_found();
                    request.found = true;
                    request.old_metadata = Some(old);
                    let data = request.new_metadata.unwrap_or(old);
                    if record.virtual_chapter != open_vcn {
                        self.volume_index.set_record_chapter(&record, open_vcn)?;
                    }
                    self.add_to_open_chapter(zone, &name, &data)?;
                } else {
                    self.stats.posts_not_found();
                    let data = request.new_metadata.unwrap_or_default();
                    self.volume_index.put_record(&record, open_vcn)?;
                    self.add_to_open_chapter(zone, &name, &data)?;
                }
            }
            RequestType::Update => {
                if let Some(old) = existing {
                    self.stats.updates_found();
                    request.found = true;
                    request.old_metadata = Some(old);
                } else {
                    self.stats.updates_not_found();
                }
                let data = request.new_metadata.unwrap_or_default();
                if record.is_found && existing.is_some() {
                    if record.virtual_chapter != open_vcn {
                        self.volume_index.set_record_chapter(&record, open_vcn)?;
                    }
                } else {
                    self.volume_index.put_record(&record, open_vcn)?;
                }
                self.add_to_open_chapter(zone, &name, &data)?;
            }
            RequestType::Query | RequestType::QueryNoUpdate => {
                if let Some(old) = existing {
                    self.stats.queries_found();
                    request.found = true;
                    request.old_metadata = Some(old);
                } else {
                    self.stats.queries_not_found();
                }
            }
            RequestType::Delete => {
                if existing.is_some() {
                    self.stats.deletions_found();
                    request.found = true;
                    request.old_metadata = existing;
                    if record.virtual_chapter == open_vcn {
                        self.open_chapters[zone].lock().unwrap().remove(&name);
                    }
                    self.volume_index.remove_record(&record)?;
                    self.stats.entries_discarded();
                } else {
                    self.stats.deletions_not_found();
                }
            }
        }
        Ok(())
    }

    // -- persistence --------------------------------------------------------

    /// Write a clean save into the next slot and clear the dirty seal.
    pub fn save(&self) -> Result<(), IndexError> {
        if !self.writable || self.is_read_only() {
            return Ok(());
        }
        let result = self.save_inner();
        if let Err(e) = &result {
            error!(error = %e, "save failed, latching read-only");
            self.read_only.store(true, Ordering::SeqCst);
        }
        result
    }

    fn save_inner(&self) -> Result<(), IndexError> {
        let (slot, generation) = match self.layout.latest_save()? {
            Some((slot, header)) => (1 - slot, header.generation + 1),
            None => (0, 1),
        };

        {
            let mut writer = self.layout.region_writer(self.layout.page_map_region(slot));
            self.page_map.read().unwrap().save(&mut writer)?;
            writer.finish()?;
        }
        {
            let mut writer = self
                .layout
                .region_writer(self.layout.open_chapter_region(slot));
            let guards: Vec<_> = self
                .open_chapters
                .iter()
                .map(|z| z.lock().unwrap())
                .collect();
            let zones: Vec<&OpenChapterZone> = guards.iter().map(|g| &**g).collect();
            save_open_chapter(&zones, &mut writer)?;
            writer.finish()?;
        }

        let vi_region = self.layout.volume_index_region(slot);
        let mut vi_zones = Vec::with_capacity(self.config.zone_count);
        let mut offset = 0u64;
        for zone in 0..self.config.zone_count {
            let mut writer = self
                .layout
                .factory()
                .writer(vi_region.0 + offset, vi_region.1 - offset);
            self.volume_index.save_zone(zone, &mut writer)?;
            writer.finish()?;
            let blocks = writer.blocks_written();
            vi_zones.push((offset as u32, blocks as u32));
            offset += blocks;
        }

        let state = self.chapter_state.lock().unwrap();
        let header = SaveHeader {
            generation,
            newest_vcn: state.newest_written.unwrap_or(0),
            oldest_vcn: state.oldest_vcn,
            open_vcn: state.open_vcn,
            zone_count: self.config.zone_count as u32,
            clean: true,
            vi_zones,
        };
        drop(state);
        self.layout.write_save_header(slot, &header)?;
        self.layout.write_seal(false)?;
        info!(slot, generation, "index saved cleanly");
        Ok(())
    }

    // -- introspection ------------------------------------------------------

    pub fn stats(&self) -> IndexStats {
        let mut snapshot = self.stats.snapshot();
        let vi = self.volume_index.stats();
        snapshot.entries_indexed = vi.record_count;
        snapshot.collisions = vi.collision_count;
        snapshot.early_flushes = vi.early_flushes;
        snapshot.memory_used = vi.memory_allocated;
        snapshot
    }

    pub fn open_chapter_vcn(&self) -> VirtualChapter {
        self.chapter_state.lock().unwrap().open_vcn
    }

    pub fn oldest_chapter_vcn(&self) -> VirtualChapter {
        self.chapter_state.lock().unwrap().oldest_vcn
    }
}
