//! Per-chapter routing table: for every physical chapter, the last delta
//! list held by each index page except the final one (which implicitly runs
//! through the last list). A name is routed to its index page with one
//! binary search, no page reads.

use std::io::{Read, Write};

use dedup_index_common::{Geometry, IndexError, RecordName, VirtualChapter};

const MAP_MAGIC: &[u8; 4] = b"IPM5";
const MAP_VERSION: u32 = 1;

pub struct IndexPageMap {
    chapters: u32,
    entries_per_chapter: u32,
    entries: Vec<u16>,
    last_update: VirtualChapter,
}

impl IndexPageMap {
    pub fn new(geometry: &Geometry) -> Self {
        let entries_per_chapter = geometry.index_pages_per_chapter - 1;
        IndexPageMap {
            chapters: geometry.chapters_per_volume,
            entries_per_chapter,
            entries: vec![0; (geometry.chapters_per_volume * entries_per_chapter) as usize],
            last_update: 0,
        }
    }

    pub fn last_update(&self) -> VirtualChapter {
        self.last_update
    }

    /// Record that index page `page_in_chapter` of the chapter now ends at
    /// `last_list`. The final index page has no entry.
    pub fn update(
        &mut self,
        geometry: &Geometry,
        vcn: VirtualChapter,
        page_in_chapter: u32,
        last_list: u32,
    ) -> Result<(), IndexError> {
        if page_in_chapter >= geometry.index_pages_per_chapter {
            return Err(IndexError::OutOfRange("index page number"));
        }
        self.last_update = vcn;
        if page_in_chapter == self.entries_per_chapter {
            return Ok(()); // implicit final page
        }
        let chapter = geometry.physical_chapter(vcn);
        self.entries[(chapter * self.entries_per_chapter + page_in_chapter) as usize] =
            last_list as u16;
        Ok(())
    }

    /// Index page within `physical_chapter` holding the delta list of
    /// `name`.
    pub fn find_index_page_number(
        &self,
        geometry: &Geometry,
        name: &RecordName,
        physical_chapter: u32,
    ) -> u32 {
        let list = geometry.hash_to_chapter_delta_list(name) as u16;
        self.find_page_for_list(list, physical_chapter)
    }

    pub fn find_page_for_list(&self, list: u16, physical_chapter: u32) -> u32 {
        let base = (physical_chapter * self.entries_per_chapter) as usize;
        let slice = &self.entries[base..base + self.entries_per_chapter as usize];
        // First page whose last list is >= the target; past the end means
        // the implicit final page.
        slice.partition_point(|&last| last < list) as u32
    }

    /// Last delta list on a page, for bounds checks; `None` for the final
    /// (implicit) page.
    pub fn last_list_on_page(&self, physical_chapter: u32, page: u32) -> Option<u16> {
        if page >= self.entries_per_chapter {
            return None;
        }
        Some(self.entries[(physical_chapter * self.entries_per_chapter + page) as usize])
    }

    // -- persistence --------------------------------------------------------

    pub fn save(&self, writer: &mut dyn Write) -> Result<(), IndexError> {
        let mut hasher = crc32fast::Hasher::new();
        let mut head = Vec::with_capacity(16);
        head.extend_from_slice(MAP_MAGIC);
        head.extend_from_slice(&MAP_VERSION.to_le_bytes());
        head.extend_from_slice(&self.last_update.to_le_bytes());
        hasher.update(&head);
        writer.write_all(&head)?;

        let mut body = Vec::with_capacity(self.entries.len() * 2);
        for &entry in &self.entries {
            body.extend_from_slice(&entry.to_le_bytes());
        }
        hasher.update(&body);
        writer.write_all(&body)?;
        writer.write_all(&hasher.finalize().to_le_bytes())?;
        Ok(())
    }

    pub fn load(geometry: &Geometry, reader: &mut dyn Read) -> Result<Self, IndexError> {
        let mut hasher = crc32fast::Hasher::new();
        let mut head = [0u8; 16];
        reader.read_exact(&mut head).map_err(eof)?;
        hasher.update(&head);
        if &head[0..4] != MAP_MAGIC {
            return Err(IndexError::BadMagic);
        }
        let version = u32::from_le_bytes(head[4..8].try_into().unwrap());
        if version != MAP_VERSION {
            return Err(IndexError::UnsupportedVersion {
                major: version,
                minor: 0,
            });
        }
        let last_update = u64::from_le_bytes(head[8..16].try_into().unwrap());

        let mut map = IndexPageMap::new(geometry);
        let mut body = vec![0u8; map.entries.len() * 2];
        reader.read_exact(&mut body).map_err(eof)?;
        hasher.update(&body);
        for (i, chunk) in body.chunks_exact(2).enumerate() {
            map.entries[i] = u16::from_le_bytes(chunk.try_into().unwrap());
        }

        let mut crc = [0u8; 4];
        reader.read_exact(&mut crc).map_err(eof)?;
        let expected = u32::from_le_bytes(crc);
        let found = hasher.finalize();
        if expected != found {
            return Err(IndexError::ChecksumMismatch { expected, found });
        }
        map.last_update = last_update;
        Ok(map)
    }
}

fn eof(e: std::io::Error) -> IndexError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        IndexError::EndOfFile
    } else {
        IndexError::Io(e)
    }
}
