//! The open chapter: the accumulator for records of the chapter currently
//! being filled, sharded into zones. A flat record array paired with a
//! quadratic-probed slot table; deletion leaves a marker so probe chains
//! stay intact until the chapter closes.

use std::io::{Read, Write};

use dedup_index_common::{
    IndexError, RecordData, RecordName, BYTES_PER_PACKED_RECORD, RECORD_DATA_SIZE,
    RECORD_NAME_SIZE,
};
use tracing::debug;

pub const OPEN_CHAPTER_MAGIC: &[u8; 4] = b"OCFM";
pub const OPEN_CHAPTER_VERSION: u32 = 2;

struct OpenRecord {
    name: RecordName,
    data: RecordData,
    deleted: bool,
}

pub struct OpenChapterZone {
    capacity: u32,
    slot_mask: u32,
    /// Slot table: 0 empty, otherwise record index + 1.
    slots: Vec<u32>,
    records: Vec<OpenRecord>,
    deletions: u32,
}

impl OpenChapterZone {
    pub fn new(capacity: u32) -> Self {
        let slot_count = (2 * capacity.max(1)).next_power_of_two();
        OpenChapterZone {
            capacity,
            slot_mask: slot_count - 1,
            slots: vec![0; slot_count as usize],
            records: Vec::with_capacity(capacity as usize),
            deletions: 0,
        }
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Appended records, including deletion markers.
    pub fn size(&self) -> u32 {
        self.records.len() as u32
    }

    pub fn deletions(&self) -> u32 {
        self.deletions
    }

    /// Live records.
    pub fn record_count(&self) -> u32 {
        self.size() - self.deletions
    }

    /// Quadratic probe: h, h+1, h+3, h+6, ...
    fn probe<F>(&self, name: &RecordName, mut visit: F) -> Option<usize>
    where
        F: FnMut(usize, u32) -> bool,
    {
        let mut slot = (name.open_chapter_field() & self.slot_mask as u64) as u32;
        for step in 1..=self.slot_mask {
            let record = self.slots[slot as usize];
            if visit(slot as usize, record) {
                return Some(slot as usize);
            }
            slot = (slot + step) & self.slot_mask;
        }
        None
    }

    /// Insert or overwrite. Returns the remaining capacity; 0 means the
    /// zone is full and (unless the name was already present) the record
    /// was not stored.
    pub fn put(&mut self, name: &RecordName, data: &RecordData) -> u32 {
        let mut existing: Option<u32> = None;
        let mut empty_slot: Option<usize> = None;
        self.probe(name, |slot_idx, record| {
            if record == 0 {
                empty_slot = Some(slot_idx);
                return true;
            }
            if self.records[(record - 1) as usize].name == *name {
                existing = Some(record - 1);
                return true;
            }
            false
        });

        if let Some(idx) = existing {
            let record = &mut self.records[idx as usize];
            record.data = *data;
            if record.deleted {
                record.deleted = false;
                self.deletions -= 1;
            }
            return self.capacity - self.size();
        }

        if self.size() >= self.capacity {
            return 0;
        }
        let Some(slot) = empty_slot else {
            return 0;
        };
        self.records.push(OpenRecord {
            name: *name,
            data: *data,
            deleted: false,
        });
        self.slots[slot] = self.records.len() as u32;
        self.capacity - self.size()
    }

    pub fn search(&self, name: &RecordName) -> Option<RecordData> {
        let mut found = None;
        self.probe(name, |_, record| {
            if record == 0 {
                return true;
            }
            let entry = &self.records[(record - 1) as usize];
            if entry.name == *name {
                if !entry.deleted {
                    found = Some(entry.data);
                }
                return true;
            }
            false
        });
        found
    }

    /// Mark a record deleted. The slot stays occupied so later probes still
    /// pass through it.
    pub fn remove(&mut self, name: &RecordName) -> bool {
        let mut hit = None;
        self.probe(name, |_, record| {
            if record == 0 {
                return true;
            }
            if self.records[(record - 1) as usize].name == *name {
                hit = Some(record - 1);
                return true;
            }
            false
        });
        match hit {
            Some(idx) if !self.records[idx as usize].deleted => {
                self.records[idx as usize].deleted = true;
                self.deletions += 1;
                true
            }
            _ => false,
        }
    }

    /// Clear for the next chapter; keeps the allocations.
    pub fn reset(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = 0);
        self.records.clear();
        self.deletions = 0;
    }

    /// Live records in insertion order.
    pub fn live_records(&self) -> impl Iterator<Item = (&RecordName, &RecordData)> {
        self.records
            .iter()
            .filter(|r| !r.deleted)
            .map(|r| (&r.name, &r.data))
    }

    /// Drain the live records, resetting the zone.
    pub fn take_records(&mut self) -> Vec<(RecordName, RecordData)> {
        let out = self
            .records
            .iter()
            .filter(|r| !r.deleted)
            .map(|r| (r.name, r.data))
            .collect();
        self.reset();
        out
    }
}

// ---------------------------------------------------------------------------
// Save and load
// ---------------------------------------------------------------------------

/// Persist the union of all zones' live records.
pub fn save_open_chapter(
    zones: &[&OpenChapterZone],
    writer: &mut dyn Write,
) -> Result<(), IndexError> {
    let total: u32 = zones.iter().map(|z| z.record_count()).sum();
    writer.write_all(OPEN_CHAPTER_MAGIC)?;
    writer.write_all(&OPEN_CHAPTER_VERSION.to_le_bytes())?;
    writer.write_all(&total.to_le_bytes())?;
    for zone in zones {
        for (name, data) in zone.live_records() {
            writer.write_all(&name.0)?;
            writer.write_all(&data.0)?;
        }
    }
    Ok(())
}

pub struct LoadedOpenChapter {
    pub records: Vec<(RecordName, RecordData)>,
}

/// Read a saved open chapter back. The caller re-distributes records into
/// zones (possibly a different number than at save time) and enforces the
/// per-zone capacity, discarding any overflow.
pub fn load_open_chapter(reader: &mut dyn Read) -> Result<LoadedOpenChapter, IndexError> {
    let mut head = [0u8; 12];
    reader.read_exact(&mut head).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            IndexError::EndOfFile
        } else {
            IndexError::Io(e)
        }
    })?;
    if &head[0..4] != OPEN_CHAPTER_MAGIC {
        return Err(IndexError::BadMagic);
    }
    let version = u32::from_le_bytes(head[4..8].try_into().unwrap());
    if version != OPEN_CHAPTER_VERSION {
        return Err(IndexError::UnsupportedVersion {
            major: version,
            minor: 0,
        });
    }
    let count = u32::from_le_bytes(head[8..12].try_into().unwrap());

    let mut records = Vec::with_capacity(count as usize);
    let mut buf = [0u8; BYTES_PER_PACKED_RECORD];
    for _ in 0..count {
        reader.read_exact(&mut buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                IndexError::EndOfFile
            } else {
                IndexError::Io(e)
            }
        })?;
        let mut name = [0u8; RECORD_NAME_SIZE];
        name.copy_from_slice(&buf[0..RECORD_NAME_SIZE]);
        let mut data = [0u8; RECORD_DATA_SIZE];
        data.copy_from_slice(&buf[RECORD_NAME_SIZE..]);
        records.push((RecordName(name), RecordData(data)));
    }
    debug!(count, "open chapter loaded");
    Ok(LoadedOpenChapter { records })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(tag: u32) -> RecordName {
        let mut bytes = [0u8; RECORD_NAME_SIZE];
        bytes[0..4].copy_from_slice(&tag.to_le_bytes());
        bytes[24..28].copy_from_slice(&tag.wrapping_mul(2654435761).to_le_bytes());
        RecordName(bytes)
    }

    fn data(tag: u8) -> RecordData {
        RecordData([tag; RECORD_DATA_SIZE])
    }

    #[test]
    fn test_put_search_remove() {
        let mut zone = OpenChapterZone::new(16);
        assert_eq!(zone.put(&name(1), &data(1)), 15);
        assert_eq!(zone.put(&name(2), &data(2)), 14);
        assert_eq!(zone.search(&name(1)), Some(data(1)));
        assert_eq!(zone.search(&name(3)), None);

        assert!(zone.remove(&name(1)));
        assert!(!zone.remove(&name(1)));
        assert_eq!(zone.search(&name(1)), None);
        assert_eq!(zone.size(), 2);
        assert_eq!(zone.deletions(), 1);
        assert_eq!(zone.record_count(), 1);
    }

    #[test]
    fn test_put_overwrites_metadata() {
        let mut zone = OpenChapterZone::new(8);
        zone.put(&name(7), &data(1));
        zone.put(&name(7), &data(9));
        assert_eq!(zone.search(&name(7)), Some(data(9)));
        assert_eq!(zone.size(), 1);
    }

    #[test]
    fn test_reput_after_remove_revives() {
        let mut zone = OpenChapterZone::new(8);
        zone.put(&name(4), &data(1));
        zone.remove(&name(4));
        zone.put(&name(4), &data(2));
        assert_eq!(zone.search(&name(4)), Some(data(2)));
        assert_eq!(zone.deletions(), 0);
    }

    #[test]
    fn test_fills_to_capacity_then_rejects() {
        let mut zone = OpenChapterZone::new(4);
        for i in 0..4 {
            assert_eq!(zone.put(&name(i), &data(i as u8)), 3 - i);
        }
        // Full: new names are rejected with 0 remaining.
        assert_eq!(zone.put(&name(100), &data(0)), 0);
        assert_eq!(zone.search(&name(100)), None);
        // Overwriting an existing name still works at capacity.
        assert_eq!(zone.put(&name(2), &data(0xEE)), 0);
        assert_eq!(zone.search(&name(2)), Some(data(0xEE)));
    }

    #[test]
    fn test_reset_clears() {
        let mut zone = OpenChapterZone::new(8);
        for i in 0..8 {
            zone.put(&name(i), &data(i as u8));
        }
        zone.reset();
        assert_eq!(zone.size(), 0);
        assert_eq!(zone.search(&name(3)), None);
        assert_eq!(zone.put(&name(3), &data(3)), 7);
    }

    #[test]
    fn test_save_load_round_trip() {
        let mut a = OpenChapterZone::new(8);
        let mut b = OpenChapterZone::new(8);
        for i in 0..5 {
            a.put(&name(i), &data(i as u8));
        }
        for i in 5..9 {
            b.put(&name(i), &data(i as u8));
        }
        a.remove(&name(2));

        let mut stream = Vec::new();
        save_open_chapter(&[&a, &b], &mut stream).unwrap();
        let loaded = load_open_chapter(&mut stream.as_slice()).unwrap();
        assert_eq!(loaded.records.len(), 8); // 9 written, 1 deleted

        assert!(!loaded.records.iter().any(|(n, _)| *n == name(2)));
        for i in [0u32, 1, 3, 4, 5, 6, 7, 8] {
            assert!(loaded.records.iter().any(|(n, d)| *n == name(i) && *d == data(i as u8)));
        }
    }

    #[test]
    fn test_load_rejects_bad_header() {
        let mut zone = OpenChapterZone::new(4);
        zone.put(&name(1), &data(1));
        let mut stream = Vec::new();
        save_open_chapter(&[&zone], &mut stream).unwrap();

        let mut bad = stream.clone();
        bad[0] = b'Z';
        assert!(matches!(
            load_open_chapter(&mut bad.as_slice()),
            Err(IndexError::BadMagic)
        ));

        let mut bad = stream;
        bad[4] = 77;
        assert!(matches!(
            load_open_chapter(&mut bad.as_slice()),
            Err(IndexError::UnsupportedVersion { .. })
        ));
    }
}
