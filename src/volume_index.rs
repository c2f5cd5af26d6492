//! The volume index: for every live name, the virtual chapter that most
//! recently indexed it. Sharded into zones, each zone a pair of delta
//! sub-indexes (all names over the dense window, plus, for sparse
//! geometries, sampled names over the full window). Entries older than the
//! retention window are flushed lazily as their lists are next touched.

use std::io::{Read, Write};
use std::sync::Mutex;

use dedup_index_common::config::{compute_volume_index_params, SubIndexParams, VolumeIndexParams};
use dedup_index_common::{bits_per, IndexConfig, IndexError, RecordName, VirtualChapter};
use dedup_index_delta::index::{read_saved_zone, zone_for_list, DeltaIndex};
use tracing::debug;

const VI_MAGIC: &[u8; 4] = b"DVI1";
const VI_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Routing
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug)]
struct SubRouting {
    list_count: u64,
    address_bits: u32,
    address_mask: u64,
}

impl SubRouting {
    fn new(params: &SubIndexParams) -> Self {
        // Address space per list spans one mean delta per expected entry.
        let address_bits = bits_per(params.mean_delta as u64 * 256 - 1);
        SubRouting {
            list_count: params.list_count,
            address_bits,
            address_mask: (1u64 << address_bits) - 1,
        }
    }

    fn list(&self, name: &RecordName) -> u64 {
        (name.volume_index_field() >> self.address_bits) % self.list_count
    }

    fn address(&self, name: &RecordName) -> u32 {
        (name.volume_index_field() & self.address_mask) as u32
    }
}

// ---------------------------------------------------------------------------
// Zone state
// ---------------------------------------------------------------------------

struct ZoneSubIndex {
    index: DeltaIndex,
    first_list: u64,
    list_count: u64,
    /// Open chapter at the last flush of each local list.
    flush_chapters: Vec<u64>,
}

struct VolumeIndexZone {
    non_hook: ZoneSubIndex,
    hook: Option<ZoneSubIndex>,
    open_chapter: VirtualChapter,
    early_flushes: u64,
}

/// Outcome of a `get_record` probe, consumed by the mutating calls.
#[derive(Clone, Copy, Debug)]
pub struct VolumeIndexRecord {
    pub is_found: bool,
    pub virtual_chapter: VirtualChapter,
    pub is_collision: bool,
    pub zone: usize,
    name: RecordName,
    hook: bool,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VolumeIndexStats {
    pub record_count: u64,
    pub collision_count: u64,
    pub memory_allocated: u64,
    pub rebalance_count: u64,
    pub early_flushes: u64,
    pub overflow_count: u64,
}

pub struct VolumeIndex {
    zone_count: usize,
    sparse: bool,
    sample_rate: u32,
    chapter_bits: u32,
    chapter_mask: u64,
    window: u64,
    non_hook_routing: SubRouting,
    hook_routing: Option<SubRouting>,
    zones: Vec<Mutex<VolumeIndexZone>>,
}

fn zone_sub_index(
    params: &SubIndexParams,
    routing: &SubRouting,
    zone: usize,
    zone_count: usize,
) -> Result<ZoneSubIndex, IndexError> {
    let total = routing.list_count;
    let first = total * zone as u64 / zone_count as u64;
    let next = total * (zone as u64 + 1) / zone_count as u64;
    let count = next - first;
    let memory = params.memory_size * count / total;
    Ok(ZoneSubIndex {
        index: DeltaIndex::new(
            1,
            count.max(1) as u32,
            params.mean_delta,
            params.chapter_bits,
            memory.max(1024),
        )?,
        first_list: first,
        list_count: count,
        flush_chapters: vec![0; count.max(1) as usize],
    })
}

impl VolumeIndex {
    pub fn new(config: &IndexConfig) -> Result<Self, IndexError> {
        Self::with_params(compute_volume_index_params(config), config.zone_count)
    }

    fn with_params(params: VolumeIndexParams, zone_count: usize) -> Result<Self, IndexError> {
        let non_hook_routing = SubRouting::new(&params.non_hook);
        let hook_routing = params.hook.as_ref().map(SubRouting::new);

        let mut zones = Vec::with_capacity(zone_count);
        for zone in 0..zone_count {
            zones.push(Mutex::new(VolumeIndexZone {
                non_hook: zone_sub_index(&params.non_hook, &non_hook_routing, zone, zone_count)?,
                hook: match (&params.hook, &hook_routing) {
                    (Some(hook), Some(routing)) => {
                        Some(zone_sub_index(hook, routing, zone, zone_count)?)
                    }
                    _ => None,
                },
                open_chapter: 0,
                early_flushes: 0,
            }));
        }
        Ok(VolumeIndex {
            zone_count,
            sparse: params.hook.is_some(),
            sample_rate: params.sample_rate,
            chapter_bits: params.non_hook.chapter_bits,
            chapter_mask: (1u64 << params.non_hook.chapter_bits) - 1,
            window: params.chapters_in_index as u64,
            non_hook_routing,
            hook_routing,
            zones,
        })
    }

    pub fn zone_count(&self) -> usize {
        self.zone_count
    }

    /// Whether a name is sampled into the sparse hook index.
    pub fn is_sample(&self, name: &RecordName) -> bool {
        self.sparse && name.sample_field() % self.sample_rate == 0
    }

    fn routes_to_hook(&self, name: &RecordName) -> bool {
        self.is_sample(name) && self.hook_routing.is_some()
    }

    /// Zone owning a name: a pure function of the name and the zone count.
    pub fn zone_for_name(&self, name: &RecordName) -> usize {
        if self.routes_to_hook(name) {
            let routing = self.hook_routing.as_ref().unwrap();
            zone_for_list(
                routing.list(name) as u32,
                routing.list_count as u32,
                self.zone_count,
            )
        } else {
            zone_for_list(
                self.non_hook_routing.list(name) as u32,
                self.non_hook_routing.list_count as u32,
                self.zone_count,
            )
        }
    }

    fn encode_chapter(&self, vcn: VirtualChapter) -> u32 {
        (vcn & self.chapter_mask) as u32
    }

    fn decode_chapter(&self, stored: u32, open: VirtualChapter) -> Option<VirtualChapter> {
        let age = open.wrapping_sub(stored as u64) & self.chapter_mask;
        if age >= self.window {
            return None;
        }
        open.checked_sub(age)
    }

    // -- core operations ----------------------------------------------------

    fn with_zone<T>(
        &self,
        name: &RecordName,
        op: impl FnOnce(&mut VolumeIndexZone, &SubRouting, bool) -> T,
    ) -> T {
        let hook = self.routes_to_hook(name);
        let routing = if hook {
            self.hook_routing.as_ref().unwrap()
        } else {
            &self.non_hook_routing
        };
        let zone = zone_for_list(
            routing.list(name) as u32,
            routing.list_count as u32,
            self.zone_count,
        );
        let mut guard = self.zones[zone].lock().unwrap();
        op(&mut guard, routing, hook)
    }

    /// Drop entries that have aged out of the window from one list. Returns
    /// how many were removed.
    fn flush_list(
        sub: &mut ZoneSubIndex,
        local: u32,
        open: VirtualChapter,
        window: u64,
        chapter_mask: u64,
    ) -> Result<u64, IndexError> {
        let mut removed = 0;
        let mut entry = sub.index.start_search(local);
        while !entry.at_end {
            let stored = sub.index.get_value(&entry) as u64;
            let age = open.wrapping_sub(stored) & chapter_mask;
            if age >= window || age > open {
                sub.index.remove_entry(&mut entry)?;
                removed += 1;
            } else {
                sub.index.next_entry(&mut entry);
            }
        }
        Ok(removed)
    }

    fn maybe_flush(
        &self,
        zone: &mut VolumeIndexZone,
        hook: bool,
        local: u32,
    ) -> Result<(), IndexError> {
        let open = zone.open_chapter;
        let (window, mask) = (self.window, self.chapter_mask);
        let sub = if hook {
            zone.hook.as_mut().unwrap()
        } else {
            &mut zone.non_hook
        };
        let last_touched = sub.flush_chapters[local as usize];
        if last_touched == open {
            return Ok(());
        }
        // Nothing in the list can be newer than its last touch, so a list
        // idle for a whole window holds only stale entries; clearing it
        // outright also keeps masked chapter ages from aliasing.
        let removed = if open.saturating_sub(last_touched) >= window {
            let mut dropped = 0;
            let mut entry = sub.index.start_search(local);
            while !entry.at_end {
                sub.index.remove_entry(&mut entry)?;
                dropped += 1;
            }
            dropped
        } else {
            Self::flush_list(sub, local, open, window, mask)?
        };
        sub.flush_chapters[local as usize] = open;
        if removed > 0 {
            zone.early_flushes += 1;
        }
        Ok(())
    }

    /// Probe for a name. The result feeds `put_record`,
    /// `set_record_chapter` and `remove_record`.
    pub fn get_record(&self, name: &RecordName) -> Result<VolumeIndexRecord, IndexError> {
        let zone_number = self.zone_for_name(name);
        let record = self.with_zone(name, |zone, routing, hook| {
            let open = zone.open_chapter;
            let sub = if hook {
                zone.hook.as_mut().unwrap()
            } else {
                &mut zone.non_hook
            };
            let local = (routing.list(name) - sub.first_list) as u32;
            let address = routing.address(name);
            let entry = sub.index.get_entry(local, address, Some(&name.0));
            if entry.at_end || entry.key != address {
                return VolumeIndexRecord {
                    is_found: false,
                    virtual_chapter: 0,
                    is_collision: false,
                    zone: zone_number,
                    name: *name,
                    hook,
                };
            }
            let stored = sub.index.get_value(&entry);
            match self.decode_chapter(stored, open) {
                Some(vcn) => VolumeIndexRecord {
                    is_found: true,
                    virtual_chapter: vcn,
                    is_collision: entry.is_collision,
                    zone: zone_number,
                    name: *name,
                    hook,
                },
                None => VolumeIndexRecord {
                    is_found: false,
                    virtual_chapter: 0,
                    is_collision: false,
                    zone: zone_number,
                    name: *name,
                    hook,
                },
            }
        });
        Ok(record)
    }

    /// Insert a new mapping. When the probe found an entry for the same
    /// address belonging to a different name, the insert becomes a
    /// collision entry carrying the full name.
    pub fn put_record(
        &self,
        record: &VolumeIndexRecord,
        vcn: VirtualChapter,
    ) -> Result<(), IndexError> {
        let name = record.name;
        let value = self.encode_chapter(vcn);
        self.with_zone(&name, |zone, routing, hook| {
            let list = routing.list(&name);
            let sub_first = if hook {
                zone.hook.as_ref().unwrap().first_list
            } else {
                zone.non_hook.first_list
            };
            let local = (list - sub_first) as u32;
            self.maybe_flush(zone, hook, local)?;
            let sub = if hook {
                zone.hook.as_mut().unwrap()
            } else {
                &mut zone.non_hook
            };
            let address = routing.address(&name);
            let mut entry = sub.index.get_entry(local, address, Some(&name.0));
            let result = if !entry.at_end && entry.key == address {
                if entry.is_collision {
                    // This exact name already has a collision entry.
                    sub.index.set_value(&entry, value)
                } else {
                    sub.index.put_entry(&mut entry, address, value, Some(&name.0))
                }
            } else {
                sub.index.put_entry(&mut entry, address, value, None)
            };
            match result {
                Err(IndexError::Overflow) => {
                    // Make room by forcing the LRU flush, then try once more.
                    let open = zone.open_chapter;
                    let (window, mask) = (self.window, self.chapter_mask);
                    let sub = if hook {
                        zone.hook.as_mut().unwrap()
                    } else {
                        &mut zone.non_hook
                    };
                    let removed = Self::flush_list(sub, local, open, window, mask)?;
                    sub.flush_chapters[local as usize] = open;
                    if removed > 0 {
                        zone.early_flushes += 1;
                    }
                    let sub = if hook {
                        zone.hook.as_mut().unwrap()
                    } else {
                        &mut zone.non_hook
                    };
                    let mut entry = sub.index.get_entry(local, address, Some(&name.0));
                    if !entry.at_end && entry.key == address {
                        if entry.is_collision {
                            sub.index.set_value(&entry, value)
                        } else {
                            sub.index.put_entry(&mut entry, address, value, Some(&name.0))
                        }
                    } else {
                        sub.index.put_entry(&mut entry, address, value, None)
                    }
                }
                other => other,
            }
        })
    }

    /// Rewrite the chapter of an existing mapping in place.
    pub fn set_record_chapter(
        &self,
        record: &VolumeIndexRecord,
        vcn: VirtualChapter,
    ) -> Result<(), IndexError> {
        let name = record.name;
        let value = self.encode_chapter(vcn);
        self.with_zone(&name, |zone, routing, hook| {
            let sub_first = if hook {
                zone.hook.as_ref().unwrap().first_list
            } else {
                zone.non_hook.first_list
            };
            let local = (routing.list(&name) - sub_first) as u32;
            // Keep the list's flush mark current so the rewritten entry is
            // never older than it.
            self.maybe_flush(zone, hook, local)?;
            let sub = if hook {
                zone.hook.as_mut().unwrap()
            } else {
                &mut zone.non_hook
            };
            let address = routing.address(&name);
            let entry = sub.index.get_entry(local, address, Some(&name.0));
            if entry.at_end || entry.key != address {
                return Err(IndexError::InvalidArgument(
                    "set_record_chapter on an absent record",
                ));
            }
            sub.index.set_value(&entry, value)
        })
    }

    /// Remove a mapping; absent names are a no-op returning false.
    pub fn remove_record(&self, record: &VolumeIndexRecord) -> Result<bool, IndexError> {
        let name = record.name;
        self.with_zone(&name, |zone, routing, hook| {
            let sub = if hook {
                zone.hook.as_mut().unwrap()
            } else {
                &mut zone.non_hook
            };
            let local = (routing.list(&name) - sub.first_list) as u32;
            let address = routing.address(&name);
            let mut entry = sub.index.get_entry(local, address, Some(&name.0));
            if entry.at_end || entry.key != address {
                return Ok(false);
            }
            sub.index.remove_entry(&mut entry)?;
            Ok(true)
        })
    }

    /// Read-only probe: the chapter currently mapped for a name. Returns
    /// `None` for unknown names, including unsampled names in sparse mode.
    pub fn lookup_name(&self, name: &RecordName) -> Result<Option<VirtualChapter>, IndexError> {
        let record = self.get_record(name)?;
        Ok(record.is_found.then_some(record.virtual_chapter))
    }

    // -- window management --------------------------------------------------

    /// Advance every zone's view of the open chapter.
    pub fn set_open_chapter(&self, vcn: VirtualChapter) {
        for zone in 0..self.zone_count {
            self.set_zone_open_chapter(zone, vcn);
        }
    }

    pub fn set_zone_open_chapter(&self, zone: usize, vcn: VirtualChapter) {
        let mut guard = self.zones[zone].lock().unwrap();
        guard.open_chapter = vcn;
    }

    pub fn zone_open_chapter(&self, zone: usize) -> VirtualChapter {
        self.zones[zone].lock().unwrap().open_chapter
    }

    pub fn stats(&self) -> VolumeIndexStats {
        let mut stats = VolumeIndexStats::default();
        for zone in &self.zones {
            let guard = zone.lock().unwrap();
            for sub in std::iter::once(&guard.non_hook).chain(guard.hook.as_ref()) {
                let s = sub.index.stats();
                stats.record_count += s.record_count;
                stats.collision_count += s.collision_count;
                stats.memory_allocated += s.memory_allocated;
                stats.rebalance_count += s.rebalance_count;
                stats.overflow_count += s.overflow_count;
            }
            stats.early_flushes += guard.early_flushes;
        }
        stats
    }

    // -- save and restore ---------------------------------------------------

    /// Serialize one zone: a wrapper header, then the non-hook and hook
    /// delta streams.
    pub fn save_zone(&self, zone: usize, writer: &mut dyn Write) -> Result<(), IndexError> {
        let guard = self.zones[zone].lock().unwrap();
        writer.write_all(VI_MAGIC)?;
        writer.write_all(&VI_VERSION.to_le_bytes())?;
        writer.write_all(&(zone as u32).to_le_bytes())?;
        writer.write_all(&(self.zone_count as u32).to_le_bytes())?;
        writer.write_all(&guard.open_chapter.to_le_bytes())?;
        writer.write_all(&guard.early_flushes.to_le_bytes())?;
        writer.write_all(&[guard.hook.is_some() as u8])?;

        for sub in std::iter::once(&guard.non_hook).chain(guard.hook.as_ref()) {
            writer.write_all(&sub.first_list.to_le_bytes())?;
            writer.write_all(&sub.list_count.to_le_bytes())?;
            sub.index.save_zone(0, writer)?;
        }
        Ok(())
    }

    /// Rebuild a volume index from saved zone streams, at the same or a
    /// different zone count.
    pub fn restore(
        config: &IndexConfig,
        zone_count: usize,
        readers: &mut [&mut dyn Read],
    ) -> Result<Self, IndexError> {
        let params = compute_volume_index_params(config);
        let index = Self::with_params(params, zone_count)?;
        let same_sharding = readers.len() == zone_count;

        for (saved_zone, reader) in readers.iter_mut().enumerate() {
            let reader: &mut dyn Read = &mut **reader;
            let mut head = [0u8; 33];
            reader.read_exact(&mut head).map_err(|e| {
                if e.kind() == std::io::ErrorKind::UnexpectedEof {
                    IndexError::EndOfFile
                } else {
                    IndexError::Io(e)
                }
            })?;
            if &head[0..4] != VI_MAGIC {
                return Err(IndexError::BadMagic);
            }
            let version = u32::from_le_bytes(head[4..8].try_into().unwrap());
            if version != VI_VERSION {
                return Err(IndexError::UnsupportedVersion {
                    major: version,
                    minor: 0,
                });
            }
            let zone_number = u32::from_le_bytes(head[8..12].try_into().unwrap());
            if zone_number as usize != saved_zone {
                return Err(IndexError::CorruptData("volume index zone out of order"));
            }
            let open_chapter = u64::from_le_bytes(head[16..24].try_into().unwrap());
            let early_flushes = u64::from_le_bytes(head[24..32].try_into().unwrap());
            let has_hook = head[32] != 0;
            if has_hook != index.sparse {
                return Err(IndexError::CorruptData("sparse flag mismatch in save"));
            }

            let sub_count = 1 + has_hook as usize;
            for sub_idx in 0..sub_count {
                let mut sub_head = [0u8; 16];
                reader.read_exact(&mut sub_head).map_err(IndexError::Io)?;
                let first_list = u64::from_le_bytes(sub_head[0..8].try_into().unwrap());
                let saved = read_saved_zone(reader)?;
                let hook = sub_idx == 1;
                for (i, (bytes, bits)) in saved.lists.iter().enumerate() {
                    let global = first_list + i as u64;
                    index.adopt_saved_list(hook, global, bytes, *bits, open_chapter)?;
                }
                if same_sharding {
                    let mut guard = index.zones[saved_zone].lock().unwrap();
                    let sub = if hook {
                        guard.hook.as_mut().unwrap()
                    } else {
                        &mut guard.non_hook
                    };
                    sub.index
                        .set_zone_counts(0, saved.record_count, saved.collision_count);
                }
            }

            if same_sharding {
                let mut guard = index.zones[saved_zone].lock().unwrap();
                guard.early_flushes = early_flushes;
            }
            for zone in 0..zone_count {
                let mut guard = index.zones[zone].lock().unwrap();
                guard.open_chapter = guard.open_chapter.max(open_chapter);
            }
        }

        if !same_sharding {
            for zone in 0..zone_count {
                let mut guard = index.zones[zone].lock().unwrap();
                guard.non_hook.index.recount();
                if let Some(hook) = guard.hook.as_mut() {
                    hook.index.recount();
                }
            }
        }
        debug!(zones = zone_count, "volume index restored");
        Ok(index)
    }

    fn adopt_saved_list(
        &self,
        hook: bool,
        global_list: u64,
        bytes: &[u8],
        bits: u64,
        open_chapter: VirtualChapter,
    ) -> Result<(), IndexError> {
        let routing = if hook {
            self.hook_routing.as_ref().unwrap()
        } else {
            &self.non_hook_routing
        };
        let zone = zone_for_list(
            global_list as u32,
            routing.list_count as u32,
            self.zone_count,
        );
        let mut guard = self.zones[zone].lock().unwrap();
        let sub = if hook {
            guard.hook.as_mut().unwrap()
        } else {
            &mut guard.non_hook
        };
        let local = (global_list - sub.first_list) as u32;
        sub.index.adopt_list(local, bytes, bits)?;
        sub.flush_chapters[local as usize] = open_chapter;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dedup_index_common::Geometry;

    fn test_config(zones: usize) -> IndexConfig {
        let geometry = Geometry::new(4, 64, 0).unwrap();
        IndexConfig::custom(geometry, zones, 0).unwrap()
    }

    fn sparse_config(zones: usize) -> IndexConfig {
        let geometry = Geometry::new(4, 100, 90).unwrap();
        IndexConfig::custom(geometry, zones, 0).unwrap()
    }

    fn name(tag: u64) -> RecordName {
        let mut bytes = [0u8; 32];
        bytes[0..8].copy_from_slice(&tag.wrapping_mul(0x9E37_79B9_7F4A_7C15).to_le_bytes());
        bytes[16..24].copy_from_slice(&tag.to_le_bytes());
        bytes[24..32].copy_from_slice(&(!tag).to_le_bytes());
        RecordName(bytes)
    }

    #[test]
    fn test_put_get_single_zone() {
        let vi = VolumeIndex::new(&test_config(1)).unwrap();
        vi.set_open_chapter(5);

        let n = name(1);
        let record = vi.get_record(&n).unwrap();
        assert!(!record.is_found);
        vi.put_record(&record, 5).unwrap();

        let record = vi.get_record(&n).unwrap();
        assert!(record.is_found);
        assert_eq!(record.virtual_chapter, 5);
        assert_eq!(vi.lookup_name(&n).unwrap(), Some(5));
        assert_eq!(vi.stats().record_count, 1);
    }

    #[test]
    fn test_one_entry_per_name() {
        let vi = VolumeIndex::new(&test_config(2)).unwrap();
        vi.set_open_chapter(3);
        let n = name(42);
        let record = vi.get_record(&n).unwrap();
        vi.put_record(&record, 3).unwrap();

        // Re-putting the same name updates in place rather than duplicating.
        let record = vi.get_record(&n).unwrap();
        assert!(record.is_found);
        vi.set_record_chapter(&record, 3).unwrap();
        assert_eq!(vi.stats().record_count, 1);
    }

    #[test]
    fn test_many_names_across_zones() {
        let vi = VolumeIndex::new(&test_config(3)).unwrap();
        vi.set_open_chapter(10);
        for tag in 0..500u64 {
            let n = name(tag);
            let record = vi.get_record(&n).unwrap();
            if !record.is_found {
                vi.put_record(&record, 10).unwrap();
            }
        }
        for tag in 0..500u64 {
            let n = name(tag);
            let got = vi.lookup_name(&n).unwrap();
            assert_eq!(got, Some(10), "name {tag}");
        }
    }

    #[test]
    fn test_remove_record() {
        let vi = VolumeIndex::new(&test_config(1)).unwrap();
        vi.set_open_chapter(1);
        let n = name(9);
        let record = vi.get_record(&n).unwrap();
        vi.put_record(&record, 1).unwrap();

        let record = vi.get_record(&n).unwrap();
        assert!(vi.remove_record(&record).unwrap());
        assert_eq!(vi.lookup_name(&n).unwrap(), None);
        assert!(!vi.remove_record(&record).unwrap());
        assert_eq!(vi.stats().record_count, 0);
    }

    #[test]
    fn test_window_aging() {
        let config = test_config(1);
        let vi = VolumeIndex::new(&config).unwrap();
        vi.set_open_chapter(0);
        let n = name(77);
        let record = vi.get_record(&n).unwrap();
        vi.put_record(&record, 0).unwrap();

        // Still visible inside the window.
        vi.set_open_chapter(10);
        assert_eq!(vi.lookup_name(&n).unwrap(), Some(0));

        // Advance far past the retention window: the entry reads as absent.
        vi.set_open_chapter(1000);
        assert_eq!(vi.lookup_name(&n).unwrap(), None);
    }

    #[test]
    fn test_early_flush_reclaims_entries() {
        let config = test_config(1);
        let vi = VolumeIndex::new(&config).unwrap();
        vi.set_open_chapter(0);
        for tag in 0..200u64 {
            let n = name(tag);
            let record = vi.get_record(&n).unwrap();
            if !record.is_found {
                vi.put_record(&record, 0).unwrap();
            }
        }
        let before = vi.stats().record_count;
        assert!(before > 0);

        // Far beyond the window; the next touch of each list flushes it.
        vi.set_open_chapter(2000);
        for tag in 200..400u64 {
            let n = name(tag);
            let record = vi.get_record(&n).unwrap();
            if !record.is_found {
                vi.put_record(&record, 2000).unwrap();
            }
        }
        let stats = vi.stats();
        assert!(stats.early_flushes > 0);
        assert!(stats.record_count < before + 200);
    }

    #[test]
    fn test_sparse_sampling_routes() {
        let config = sparse_config(2);
        let vi = VolumeIndex::new(&config).unwrap();
        vi.set_open_chapter(1);

        let mut sampled = 0;
        let mut unsampled = 0;
        for tag in 0..300u64 {
            let n = name(tag);
            let record = vi.get_record(&n).unwrap();
            if !record.is_found {
                vi.put_record(&record, 1).unwrap();
            }
            if vi.is_sample(&n) {
                sampled += 1;
            } else {
                unsampled += 1;
            }
            assert_eq!(vi.lookup_name(&n).unwrap(), Some(1), "name {tag}");
        }
        assert!(sampled > 0);
        assert!(unsampled > 0);
    }

    #[test]
    fn test_save_restore_same_zone_count() {
        let config = test_config(2);
        let vi = VolumeIndex::new(&config).unwrap();
        vi.set_open_chapter(7);
        for tag in 0..300u64 {
            let n = name(tag);
            let record = vi.get_record(&n).unwrap();
            if !record.is_found {
                vi.put_record(&record, 7).unwrap();
            }
        }
        let before = vi.stats();

        let mut streams = Vec::new();
        for zone in 0..2 {
            let mut buf = Vec::new();
            vi.save_zone(zone, &mut buf).unwrap();
            streams.push(buf);
        }
        let mut slices: Vec<&[u8]> = streams.iter().map(|s| s.as_slice()).collect();
        let mut readers: Vec<&mut dyn Read> =
            slices.iter_mut().map(|s| s as &mut dyn Read).collect();
        let restored = VolumeIndex::restore(&config, 2, &mut readers).unwrap();

        let after = restored.stats();
        assert_eq!(before.record_count, after.record_count);
        assert_eq!(before.collision_count, after.collision_count);
        assert_eq!(before.memory_allocated, after.memory_allocated);
        for tag in 0..300u64 {
            let n = name(tag);
            assert_eq!(restored.lookup_name(&n).unwrap(), Some(7), "name {tag}");
        }
    }

    #[test]
    fn test_save_restore_across_zone_counts() {
        let config = test_config(1);
        let vi = VolumeIndex::new(&config).unwrap();
        vi.set_open_chapter(4);
        for tag in 0..200u64 {
            let n = name(tag);
            let record = vi.get_record(&n).unwrap();
            if !record.is_found {
                vi.put_record(&record, 4).unwrap();
            }
        }
        let expected = vi.stats().record_count;

        let mut stream = Vec::new();
        vi.save_zone(0, &mut stream).unwrap();

        for new_zones in [1usize, 2, 3, 5, 8] {
            let mut config = test_config(1);
            config.zone_count = new_zones;
            let mut slice = stream.as_slice();
            let mut readers: Vec<&mut dyn Read> = vec![&mut slice as &mut dyn Read];
            let restored = VolumeIndex::restore(&config, new_zones, &mut readers).unwrap();
            assert_eq!(restored.stats().record_count, expected, "zones {new_zones}");
            for tag in 0..200u64 {
                let n = name(tag);
                assert_eq!(
                    restored.lookup_name(&n).unwrap(),
                    Some(4),
                    "zones {new_zones} name {tag}"
                );
            }
        }
    }
}
