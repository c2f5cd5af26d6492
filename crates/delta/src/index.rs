use std::io::{Read, Write};

use dedup_index_common::config::compute_coding_constants;
use dedup_index_common::{IndexError, RECORD_NAME_SIZE};
use tracing::debug;

use crate::bits::{
    copy_bits, count_zero_run, get_field, move_bits, set_field, BitBuffer, GUARD_BYTES,
};

const COLLISION_NAME_BITS: u64 = (RECORD_NAME_SIZE * 8) as u64;

/// Trailing bits of each zone arena left unused so decode windows never run
/// off the end.
const TAIL_GUARD_BITS: u64 = 64;

const SAVE_MAGIC: &[u8; 4] = b"DLZ1";
const SAVE_VERSION: u32 = 1;
const SAVE_GUARD: &[u8; 8] = b"DLGUARD\0";

// ---------------------------------------------------------------------------
// Entry cursor
// ---------------------------------------------------------------------------

/// Cursor over one delta list. Produced by the search entry points and
/// consumed by the mutation methods; all offsets are bits within the list.
#[derive(Clone, Copy, Debug)]
pub struct DeltaEntry {
    pub list: u32,
    pub key: u32,
    pub delta: u32,
    pub is_collision: bool,
    pub at_end: bool,
    /// Key of the preceding entry (0 at the list head); the base the delta
    /// was measured from.
    prev_key: u32,
    offset: u64,
    delta_bits: u32,
    entry_bits: u64,
}

impl DeltaEntry {
    fn end(list: u32, prev_key: u32, offset: u64) -> Self {
        DeltaEntry {
            list,
            key: 0,
            delta: 0,
            is_collision: false,
            at_end: true,
            prev_key,
            offset,
            delta_bits: 0,
            entry_bits: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Zones and lists
// ---------------------------------------------------------------------------

#[derive(Clone, Default)]
struct DeltaList {
    start: u64,
    size: u64,
    save_key: u32,
    save_offset: u64,
}

struct DeltaZone {
    first_list: u32,
    list_count: u32,
    memory: Vec<u8>,
    capacity_bits: u64,
    lists: Vec<DeltaList>,
    record_count: u64,
    collision_count: u64,
    rebalance_count: u64,
    overflow_count: u64,
}

/// Aggregated statistics over all zones.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DeltaIndexStats {
    pub record_count: u64,
    pub collision_count: u64,
    pub memory_allocated: u64,
    pub rebalance_count: u64,
    pub overflow_count: u64,
}

/// Bit-packed sparse associative array: `list_count` delta lists sharded
/// over `zone_count` arenas, each list a strictly-increasing key sequence
/// encoded as deltas with a small payload per entry. Collision entries share
/// their predecessor's key and carry the full record name inline.
pub struct DeltaIndex {
    zone_count: usize,
    list_count: u32,
    mean_delta: u32,
    payload_bits: u32,
    min_bits: u32,
    min_keys: u32,
    incr_keys: u32,
    zones: Vec<DeltaZone>,
}

/// Zone owning a global delta list under a given sharding.
pub fn zone_for_list(list: u32, list_count: u32, zone_count: usize) -> usize {
    let zone =
        (list as u64 * zone_count as u64 + zone_count as u64 - 1) / list_count as u64;
    (zone as usize).min(zone_count - 1)
}

fn first_list_in_zone(zone: usize, list_count: u32, zone_count: usize) -> u32 {
    (list_count as u64 * zone as u64 / zone_count as u64) as u32
}

impl DeltaIndex {
    pub fn new(
        zone_count: usize,
        list_count: u32,
        mean_delta: u32,
        payload_bits: u32,
        memory_size: u64,
    ) -> Result<Self, IndexError> {
        if zone_count == 0 || list_count == 0 {
            return Err(IndexError::InvalidArgument("empty delta index"));
        }
        if zone_count > list_count as usize {
            return Err(IndexError::InvalidArgument("more zones than delta lists"));
        }
        let (min_bits, min_keys, incr_keys) = compute_coding_constants(mean_delta);
        let mut zones = Vec::with_capacity(zone_count);
        for zone in 0..zone_count {
            let first_list = first_list_in_zone(zone, list_count, zone_count);
            let next_first = first_list_in_zone(zone + 1, list_count, zone_count);
            let zone_lists = next_first - first_list;
            let zone_bytes =
                (memory_size * zone_lists as u64 / list_count as u64).max(256) as usize;
            let mut z = DeltaZone {
                first_list,
                list_count: zone_lists,
                memory: vec![0; zone_bytes + GUARD_BYTES],
                capacity_bits: zone_bytes as u64 * 8 - TAIL_GUARD_BITS,
                lists: vec![DeltaList::default(); zone_lists as usize],
                record_count: 0,
                collision_count: 0,
                rebalance_count: 0,
                overflow_count: 0,
            };
            layout_lists(&mut z, usize::MAX, 0);
            zones.push(z);
        }
        Ok(DeltaIndex {
            zone_count,
            list_count,
            mean_delta,
            payload_bits,
            min_bits,
            min_keys,
            incr_keys,
            zones,
        })
    }

    pub fn list_count(&self) -> u32 {
        self.list_count
    }

    pub fn zone_count(&self) -> usize {
        self.zone_count
    }

    pub fn payload_bits(&self) -> u32 {
        self.payload_bits
    }

    pub fn mean_delta(&self) -> u32 {
        self.mean_delta
    }

    fn locate(&self, list: u32) -> (usize, usize) {
        let zone = zone_for_list(list, self.list_count, self.zone_count);
        (zone, (list - self.zones[zone].first_list) as usize)
    }

    // -- decoding -----------------------------------------------------------

    fn decode_at(&self, zone: &DeltaZone, list: u32, local: usize, offset: u64, prev_key: u32) -> DeltaEntry {
        let dl = &zone.lists[local];
        if offset >= dl.size {
            return DeltaEntry::end(list, prev_key, dl.size);
        }
        let abs = dl.start + offset;
        let field = get_field(&zone.memory, abs, self.min_bits);
        let (delta, delta_bits) = if field < self.min_keys {
            (field, self.min_bits)
        } else {
            let limit = (dl.size - offset).saturating_sub(self.min_bits as u64);
            let zeros = count_zero_run(&zone.memory, abs + self.min_bits as u64, limit);
            (
                field + zeros as u32 * self.incr_keys,
                self.min_bits + zeros as u32 + 1,
            )
        };
        let is_collision = delta == 0 && offset > 0;
        let entry_bits = delta_bits as u64
            + self.payload_bits as u64
            + if is_collision { COLLISION_NAME_BITS } else { 0 };
        DeltaEntry {
            list,
            key: prev_key + delta,
            delta,
            is_collision,
            at_end: false,
            prev_key,
            offset,
            delta_bits,
            entry_bits,
        }
    }

    /// First entry of a list.
    pub fn start_search(&self, list: u32) -> DeltaEntry {
        let (zone, local) = self.locate(list);
        self.decode_at(&self.zones[zone], list, local, 0, 0)
    }

    /// Advance the cursor to the following entry.
    pub fn next_entry(&self, entry: &mut DeltaEntry) {
        if entry.at_end {
            return;
        }
        let (zone, local) = self.locate(entry.list);
        *entry = self.decode_at(
            &self.zones[zone],
            entry.list,
            local,
            entry.offset + entry.entry_bits,
            entry.key,
        );
    }

    /// Payload value of the entry under the cursor.
    pub fn get_value(&self, entry: &DeltaEntry) -> u32 {
        debug_assert!(!entry.at_end);
        let (zone, local) = self.locate(entry.list);
        let dl = &self.zones[zone].lists[local];
        get_field(
            &self.zones[zone].memory,
            dl.start + entry.offset + entry.delta_bits as u64,
            self.payload_bits,
        )
    }

    /// Collision name stored with the entry under the cursor.
    pub fn get_collision_name(&self, entry: &DeltaEntry) -> [u8; RECORD_NAME_SIZE] {
        debug_assert!(entry.is_collision);
        let (zone, local) = self.locate(entry.list);
        let dl = &self.zones[zone].lists[local];
        let base = dl.start + entry.offset + entry.delta_bits as u64 + self.payload_bits as u64;
        let mut name = [0u8; RECORD_NAME_SIZE];
        for (i, byte) in name.iter_mut().enumerate() {
            *byte = get_field(&self.zones[zone].memory, base + i as u64 * 8, 8) as u8;
        }
        name
    }

    /// Position on the first entry with key >= `key`. When `name` is given
    /// and the key has collision entries, the cursor moves onto the matching
    /// collision if one exists.
    pub fn get_entry(
        &mut self,
        list: u32,
        key: u32,
        name: Option<&[u8; RECORD_NAME_SIZE]>,
    ) -> DeltaEntry {
        let (zone_idx, local) = self.locate(list);
        let dl = &self.zones[zone_idx].lists[local];
        // Resume from the saved cursor only when its base key is strictly
        // below the target, so collisions of the target key are never behind
        // the starting point.
        let (mut offset, mut prev_key) = if dl.save_key < key && dl.save_offset <= dl.size {
            (dl.save_offset, dl.save_key)
        } else {
            (0, 0)
        };

        let mut entry;
        loop {
            entry = self.decode_at(&self.zones[zone_idx], list, local, offset, prev_key);
            if entry.at_end || (!entry.is_collision && entry.key >= key) {
                break;
            }
            offset = entry.offset + entry.entry_bits;
            prev_key = entry.key;
        }

        if let Some(target) = name {
            if !entry.at_end && entry.key == key {
                let mut probe = entry;
                loop {
                    self.next_entry(&mut probe);
                    if probe.at_end || !probe.is_collision {
                        break;
                    }
                    if self.get_collision_name(&probe) == *target {
                        entry = probe;
                        break;
                    }
                }
            }
        }

        let dl = &mut self.zones[zone_idx].lists[local];
        dl.save_key = entry.prev_key;
        dl.save_offset = entry.offset;
        entry
    }

    // -- encoding -----------------------------------------------------------

    fn encode_delta(&self, buf: &mut BitBuffer, delta: u32) {
        if delta < self.min_keys {
            buf.push(delta, self.min_bits);
        } else {
            let t = delta - self.min_keys;
            buf.push(self.min_keys + t % self.incr_keys, self.min_bits);
            buf.push_zeros((t / self.incr_keys) as u64);
            buf.push(1, 1);
        }
    }

    fn encode_entry(
        &self,
        buf: &mut BitBuffer,
        delta: u32,
        value: u32,
        name: Option<&[u8; RECORD_NAME_SIZE]>,
    ) {
        self.encode_delta(buf, delta);
        buf.push(value, self.payload_bits);
        if let Some(name) = name {
            buf.push_bytes(name);
        }
    }

    /// Replace bits `[from, to)` of a list with `replacement`, growing or
    /// shrinking the list.
    fn splice(
        &mut self,
        zone_idx: usize,
        local: usize,
        from: u64,
        to: u64,
        replacement: &BitBuffer,
    ) -> Result<(), IndexError> {
        let new_bits = replacement.len();
        let old_bits = to - from;
        if new_bits > old_bits {
            self.ensure_room(zone_idx, local, new_bits - old_bits)?;
        }
        let zone = &mut self.zones[zone_idx];
        let dl = &zone.lists[local];
        let (start, size) = (dl.start, dl.size);
        move_bits(
            &mut zone.memory,
            start + to,
            start + from + new_bits,
            size - to,
        );
        copy_bits(
            replacement.bytes(),
            0,
            &mut zone.memory,
            start + from,
            new_bits,
        );
        zone.lists[local].size = size - old_bits + new_bits;
        Ok(())
    }

    fn ensure_room(&mut self, zone_idx: usize, local: usize, extra: u64) -> Result<(), IndexError> {
        let zone = &self.zones[zone_idx];
        let list_end = zone.lists[local].start + zone.lists[local].size;
        let next_start = zone
            .lists
            .get(local + 1)
            .map(|l| l.start)
            .unwrap_or(zone.capacity_bits);
        if next_start - list_end >= extra {
            return Ok(());
        }
        let used: u64 = zone.lists.iter().map(|l| l.size).sum();
        if used + extra > zone.capacity_bits {
            self.zones[zone_idx].overflow_count += 1;
            return Err(IndexError::Overflow);
        }
        let zone = &mut self.zones[zone_idx];
        layout_lists(zone, local, extra);
        zone.rebalance_count += 1;
        debug!(
            zone = zone_idx,
            rebalances = zone.rebalance_count,
            "delta zone rebalanced"
        );
        Ok(())
    }

    /// Insert an entry at the cursor. Without a name the cursor must sit at
    /// the first entry past `key` (or at the end); with a name the cursor
    /// must sit on the existing entry for `key` and a collision is chained
    /// after it.
    pub fn put_entry(
        &mut self,
        entry: &mut DeltaEntry,
        key: u32,
        value: u32,
        name: Option<&[u8; RECORD_NAME_SIZE]>,
    ) -> Result<(), IndexError> {
        if self.payload_bits < 32 && u64::from(value) >= 1u64 << self.payload_bits {
            return Err(IndexError::OutOfRange("delta index value"));
        }
        let (zone_idx, local) = self.locate(entry.list);

        if let Some(name) = name {
            if entry.at_end || entry.key != key {
                return Err(IndexError::InvalidArgument(
                    "collision insert requires a cursor on the colliding key",
                ));
            }
            let ins = entry.offset + entry.entry_bits;
            let mut buf = BitBuffer::new();
            self.encode_entry(&mut buf, 0, value, Some(name));
            let new_bits = buf.len();
            self.splice(zone_idx, local, ins, ins, &buf)?;
            let prev_key = entry.key;
            *entry = DeltaEntry {
                list: entry.list,
                key,
                delta: 0,
                is_collision: true,
                at_end: false,
                prev_key,
                offset: ins,
                delta_bits: self.min_bits,
                entry_bits: new_bits,
            };
            let zone = &mut self.zones[zone_idx];
            zone.record_count += 1;
            zone.collision_count += 1;
            zone.lists[local].save_key = prev_key;
            zone.lists[local].save_offset = ins;
            return Ok(());
        }

        if !entry.at_end && entry.key == key {
            return Err(IndexError::InvalidArgument(
                "duplicate key needs a collision name",
            ));
        }
        if !entry.at_end && entry.key < key {
            return Err(IndexError::InvalidArgument("cursor behind insertion key"));
        }

        let delta = key - entry.prev_key;
        let mut buf = BitBuffer::new();
        self.encode_entry(&mut buf, delta, value, None);
        let new_entry_bits = buf.len();
        let replaced_to = if entry.at_end {
            entry.offset
        } else {
            // Re-encode the successor's delta against the new key.
            self.encode_delta(&mut buf, entry.key - key);
            entry.offset + entry.delta_bits as u64
        };
        self.splice(zone_idx, local, entry.offset, replaced_to, &buf)?;

        let prev_key = entry.prev_key;
        *entry = DeltaEntry {
            list: entry.list,
            key,
            delta,
            is_collision: false,
            at_end: false,
            prev_key,
            offset: entry.offset,
            delta_bits: (new_entry_bits - self.payload_bits as u64) as u32,
            entry_bits: new_entry_bits,
        };
        let zone = &mut self.zones[zone_idx];
        zone.record_count += 1;
        zone.lists[local].save_key = prev_key;
        zone.lists[local].save_offset = entry.offset;
        Ok(())
    }

    /// Rewrite the payload of the entry under the cursor in place.
    pub fn set_value(&mut self, entry: &DeltaEntry, value: u32) -> Result<(), IndexError> {
        if entry.at_end {
            return Err(IndexError::InvalidArgument("set_value past the end"));
        }
        if self.payload_bits < 32 && u64::from(value) >= 1u64 << self.payload_bits {
            return Err(IndexError::OutOfRange("delta index value"));
        }
        let (zone_idx, local) = self.locate(entry.list);
        let zone = &mut self.zones[zone_idx];
        let start = zone.lists[local].start;
        set_field(
            &mut zone.memory,
            start + entry.offset + entry.delta_bits as u64,
            self.payload_bits,
            value,
        );
        Ok(())
    }

    /// Delete the entry under the cursor; the cursor moves to its successor.
    pub fn remove_entry(&mut self, entry: &mut DeltaEntry) -> Result<(), IndexError> {
        if entry.at_end {
            return Err(IndexError::InvalidArgument("remove past the end"));
        }
        let (zone_idx, local) = self.locate(entry.list);
        let was_collision = entry.is_collision;

        if was_collision {
            let empty = BitBuffer::new();
            self.splice(
                zone_idx,
                local,
                entry.offset,
                entry.offset + entry.entry_bits,
                &empty,
            )?;
        } else {
            let successor = self.decode_at(
                &self.zones[zone_idx],
                entry.list,
                local,
                entry.offset + entry.entry_bits,
                entry.key,
            );
            if !successor.at_end && successor.is_collision {
                // Promote the first collision: it keeps its value, takes the
                // removed entry's delta, and drops the inline name.
                let value = self.get_value(&successor);
                let mut buf = BitBuffer::new();
                self.encode_entry(&mut buf, entry.delta, value, None);
                self.splice(
                    zone_idx,
                    local,
                    entry.offset,
                    successor.offset + successor.entry_bits,
                    &buf,
                )?;
                self.zones[zone_idx].collision_count -= 1;
            } else if !successor.at_end {
                // Fold the removed delta into the successor.
                let mut buf = BitBuffer::new();
                self.encode_delta(&mut buf, successor.delta + entry.delta);
                self.splice(
                    zone_idx,
                    local,
                    entry.offset,
                    successor.offset + successor.delta_bits as u64,
                    &buf,
                )?;
            } else {
                let empty = BitBuffer::new();
                self.splice(
                    zone_idx,
                    local,
                    entry.offset,
                    entry.offset + entry.entry_bits,
                    &empty,
                )?;
            }
        }

        let zone = &mut self.zones[zone_idx];
        zone.record_count -= 1;
        if was_collision {
            zone.collision_count -= 1;
        }
        zone.lists[local].save_key = entry.prev_key;
        zone.lists[local].save_offset = entry.offset;
        let (prev_key, offset, list) = (entry.prev_key, entry.offset, entry.list);
        *entry = self.decode_at(&self.zones[zone_idx], list, local, offset, prev_key);
        Ok(())
    }

    // -- bulk access --------------------------------------------------------

    pub fn list_size(&self, list: u32) -> u64 {
        let (zone, local) = self.locate(list);
        self.zones[zone].lists[local].size
    }

    /// Copy a list's raw bits into `target` starting at bit `to`.
    pub fn copy_list_bits(&self, list: u32, target: &mut [u8], to: u64) {
        let (zone, local) = self.locate(list);
        let dl = &self.zones[zone].lists[local];
        copy_bits(&self.zones[zone].memory, dl.start, target, to, dl.size);
    }

    pub fn stats(&self) -> DeltaIndexStats {
        let mut stats = DeltaIndexStats::default();
        for zone in &self.zones {
            stats.record_count += zone.record_count;
            stats.collision_count += zone.collision_count;
            stats.memory_allocated += zone.memory.len() as u64;
            stats.rebalance_count += zone.rebalance_count;
            stats.overflow_count += zone.overflow_count;
        }
        stats
    }

    // -- save and restore ---------------------------------------------------

    /// Serialize one zone of lists followed by a terminating guard record.
    pub fn save_zone(&self, zone_idx: usize, writer: &mut dyn Write) -> Result<(), IndexError> {
        let zone = &self.zones[zone_idx];
        let mut hasher = crc32fast::Hasher::new();
        let mut header = Vec::with_capacity(40);
        header.extend_from_slice(SAVE_MAGIC);
        header.extend_from_slice(&SAVE_VERSION.to_le_bytes());
        header.extend_from_slice(&(zone_idx as u32).to_le_bytes());
        header.extend_from_slice(&(self.zone_count as u32).to_le_bytes());
        header.extend_from_slice(&zone.first_list.to_le_bytes());
        header.extend_from_slice(&zone.list_count.to_le_bytes());
        header.extend_from_slice(&zone.record_count.to_le_bytes());
        header.extend_from_slice(&zone.collision_count.to_le_bytes());
        hasher.update(&header);
        writer.write_all(&header)?;

        let mut sizes = Vec::with_capacity(zone.list_count as usize * 4);
        for dl in &zone.lists {
            sizes.extend_from_slice(&(dl.size as u32).to_le_bytes());
        }
        hasher.update(&sizes);
        writer.write_all(&sizes)?;

        for local in 0..zone.list_count as usize {
            let dl = &zone.lists[local];
            let byte_len = dl.size.div_ceil(8) as usize;
            let mut bytes = vec![0u8; byte_len + GUARD_BYTES];
            copy_bits(&zone.memory, dl.start, &mut bytes, 0, dl.size);
            bytes.truncate(byte_len);
            hasher.update(&bytes);
            writer.write_all(&bytes)?;
        }

        writer.write_all(SAVE_GUARD)?;
        writer.write_all(&hasher.finalize().to_le_bytes())?;
        Ok(())
    }

    /// Rebuild an index from saved zone streams. The number of streams may
    /// differ from the index's own zone count; lists land in their new homes
    /// by the deterministic list sharding.
    pub fn restore(
        zone_count: usize,
        list_count: u32,
        mean_delta: u32,
        payload_bits: u32,
        memory_size: u64,
        readers: &mut [&mut dyn Read],
    ) -> Result<Self, IndexError> {
        let mut index =
            DeltaIndex::new(zone_count, list_count, mean_delta, payload_bits, memory_size)?;
        let mut lists_seen = 0u64;
        let same_sharding = readers.len() == zone_count;

        for (saved_zone, reader) in readers.iter_mut().enumerate() {
            let saved = read_saved_zone(&mut **reader)?;
            if saved.zone as usize != saved_zone {
                return Err(IndexError::CorruptData("delta save zone out of order"));
            }
            if saved.first_list + saved.list_count > list_count {
                return Err(IndexError::CorruptData("delta save list range"));
            }
            for (i, (bytes, size)) in saved.lists.iter().enumerate() {
                index.adopt_list(saved.first_list + i as u32, bytes, *size)?;
                lists_seen += 1;
            }
            if same_sharding {
                let zone = &mut index.zones[saved_zone];
                zone.record_count = saved.record_count;
                zone.collision_count = saved.collision_count;
            }
        }

        if lists_seen != list_count as u64 {
            return Err(IndexError::CorruptData("delta save missing lists"));
        }
        if !same_sharding {
            index.recount();
        }
        Ok(index)
    }

    /// Load a single list's raw bits, growing room for it first. Restore
    /// plumbing for callers that re-shard saved lists themselves.
    pub fn adopt_list(&mut self, list: u32, bytes: &[u8], size: u64) -> Result<(), IndexError> {
        let (zone_idx, local) = self.locate(list);
        self.ensure_room(zone_idx, local, size)?;
        let zone = &mut self.zones[zone_idx];
        let start = zone.lists[local].start;
        copy_bits(bytes, 0, &mut zone.memory, start, size);
        zone.lists[local].size = size;
        zone.lists[local].save_key = 0;
        zone.lists[local].save_offset = 0;
        Ok(())
    }

    /// Install saved per-zone counters after a same-sharding restore.
    pub fn set_zone_counts(&mut self, zone: usize, records: u64, collisions: u64) {
        self.zones[zone].record_count = records;
        self.zones[zone].collision_count = collisions;
    }

    /// Recompute per-zone record and collision counts by scanning; used
    /// after lists have been adopted across a sharding change.
    pub fn recount(&mut self) {
        for zone_idx in 0..self.zone_count {
            let mut records = 0;
            let mut collisions = 0;
            for local in 0..self.zones[zone_idx].list_count {
                let list = self.zones[zone_idx].first_list + local;
                let mut entry = self.start_search(list);
                while !entry.at_end {
                    records += 1;
                    if entry.is_collision {
                        collisions += 1;
                    }
                    self.next_entry(&mut entry);
                }
            }
            self.zones[zone_idx].record_count = records;
            self.zones[zone_idx].collision_count = collisions;
        }
    }
}

/// Re-flow a zone's lists, giving `reserve` extra gap after list
/// `favored` and spreading the remaining free bits evenly.
fn layout_lists(zone: &mut DeltaZone, favored: usize, reserve: u64) {
    let count = zone.lists.len();
    if count == 0 {
        return;
    }
    let used: u64 = zone.lists.iter().map(|l| l.size).sum();
    let free = zone.capacity_bits - used - reserve.min(zone.capacity_bits - used);

    // Lift every list out, then re-place at the new offsets.
    let mut rescue = vec![0u8; zone.memory.len()];
    let mut harvested = Vec::with_capacity(count);
    let mut cursor = 0u64;
    for dl in &zone.lists {
        copy_bits(&zone.memory, dl.start, &mut rescue, cursor, dl.size);
        harvested.push(cursor);
        cursor += dl.size;
    }

    zone.memory.iter_mut().for_each(|b| *b = 0);
    let mut start = 0u64;
    for (i, dl) in zone.lists.iter_mut().enumerate() {
        let mut gap = free / (count as u64 + 1);
        if i == favored {
            gap += reserve;
        }
        copy_bits(&rescue, harvested[i], &mut zone.memory, start, dl.size);
        dl.start = start;
        start += dl.size + gap;
        // Offsets moved; the saved cursor keys survive but offsets are
        // relative to the list start, so they stay valid.
    }
}

/// One zone of a saved delta index, parsed back into raw list bits. Used by
/// callers that redistribute lists over a different zone count on restore.
pub struct SavedZone {
    pub zone: u32,
    pub zone_count: u32,
    pub first_list: u32,
    pub list_count: u32,
    pub record_count: u64,
    pub collision_count: u64,
    /// Per list in order: (guarded bytes, bit length).
    pub lists: Vec<(Vec<u8>, u64)>,
}

/// Read one zone stream written by `save_zone`, validating the guard record
/// and checksum.
pub fn read_saved_zone(reader: &mut dyn Read) -> Result<SavedZone, IndexError> {
    let mut hasher = crc32fast::Hasher::new();
    let mut header = [0u8; 40];
    read_exact(reader, &mut header)?;
    hasher.update(&header);
    if &header[0..4] != SAVE_MAGIC {
        return Err(IndexError::BadMagic);
    }
    let version = read_u32(&header[4..8]);
    if version != SAVE_VERSION {
        return Err(IndexError::UnsupportedVersion {
            major: version,
            minor: 0,
        });
    }
    let zone = read_u32(&header[8..12]);
    let zone_count = read_u32(&header[12..16]);
    let first_list = read_u32(&header[16..20]);
    let list_count = read_u32(&header[20..24]);
    let record_count = read_u64(&header[24..32]);
    let collision_count = read_u64(&header[32..40]);

    let mut sizes = vec![0u8; list_count as usize * 4];
    read_exact(reader, &mut sizes)?;
    hasher.update(&sizes);

    let mut lists = Vec::with_capacity(list_count as usize);
    for i in 0..list_count as usize {
        let bits = read_u32(&sizes[i * 4..i * 4 + 4]) as u64;
        let byte_len = bits.div_ceil(8) as usize;
        let mut bytes = vec![0u8; byte_len];
        read_exact(reader, &mut bytes)?;
        hasher.update(&bytes);
        bytes.resize(byte_len + GUARD_BYTES, 0);
        lists.push((bytes, bits));
    }

    let mut guard = [0u8; 8];
    read_exact(reader, &mut guard)?;
    if &guard != SAVE_GUARD {
        return Err(IndexError::CorruptData("missing delta save guard"));
    }
    let mut crc = [0u8; 4];
    read_exact(reader, &mut crc)?;
    let expected = read_u32(&crc);
    let found = hasher.finalize();
    if expected != found {
        return Err(IndexError::ChecksumMismatch { expected, found });
    }

    Ok(SavedZone {
        zone,
        zone_count,
        first_list,
        list_count,
        record_count,
        collision_count,
        lists,
    })
}

fn read_exact(reader: &mut dyn Read, buf: &mut [u8]) -> Result<(), IndexError> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            IndexError::EndOfFile
        } else {
            IndexError::Io(e)
        }
    })
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
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::collections::BTreeMap;

    fn small_index() -> DeltaIndex {
        DeltaIndex::new(1, 8, 1024, 8, 16 * 1024).unwrap()
    }

    fn name_of(tag: u8) -> [u8; RECORD_NAME_SIZE] {
        let mut name = [0u8; RECORD_NAME_SIZE];
        name[0] = tag;
        name[31] = tag ^ 0xFF;
        name
    }

    #[test]
    fn test_empty_list_search() {
        let mut index = small_index();
        let entry = index.get_entry(0, 100, None);
        assert!(entry.at_end);
        assert_eq!(index.stats().record_count, 0);
    }

    #[test]
    fn test_put_and_get_single() {
        let mut index = small_index();
        let mut entry = index.get_entry(3, 500, None);
        index.put_entry(&mut entry, 500, 42, None).unwrap();
        assert!(!entry.at_end);
        assert_eq!(entry.key, 500);
        assert_eq!(index.get_value(&entry), 42);

        let found = index.get_entry(3, 500, None);
        assert!(!found.at_end);
        assert_eq!(found.key, 500);
        assert_eq!(index.get_value(&found), 42);
        assert_eq!(index.stats().record_count, 1);
    }

    #[test]
    fn test_insert_before_existing_reencodes_successor() {
        let mut index = small_index();
        let mut entry = index.get_entry(0, 1000, None);
        index.put_entry(&mut entry, 1000, 1, None).unwrap();
        let mut entry = index.get_entry(0, 200, None);
        assert_eq!(entry.key, 1000);
        index.put_entry(&mut entry, 200, 2, None).unwrap();

        // Scan sees 200 then 1000 with intact values.
        let mut scan = index.start_search(0);
        assert_eq!((scan.key, index.get_value(&scan)), (200, 2));
        index.next_entry(&mut scan);
        assert_eq!((scan.key, index.get_value(&scan)), (1000, 1));
        assert_eq!(scan.delta, 800);
        index.next_entry(&mut scan);
        assert!(scan.at_end);
    }

    #[test]
    fn test_collision_insert_and_lookup() {
        let mut index = small_index();
        let base = name_of(1);
        let other = name_of(2);

        let mut entry = index.get_entry(1, 77, None);
        index.put_entry(&mut entry, 77, 10, None).unwrap();

        let mut entry = index.get_entry(1, 77, Some(&other));
        assert!(!entry.is_collision); // no matching collision yet
        index.put_entry(&mut entry, 77, 20, Some(&other)).unwrap();
        assert!(entry.is_collision);

        let found = index.get_entry(1, 77, Some(&other));
        assert!(found.is_collision);
        assert_eq!(index.get_value(&found), 20);
        assert_eq!(index.get_collision_name(&found), other);

        // The base entry still resolves names that do not match a collision.
        let found = index.get_entry(1, 77, Some(&base));
        assert!(!found.is_collision);
        assert_eq!(index.get_value(&found), 10);

        let stats = index.stats();
        assert_eq!(stats.record_count, 2);
        assert_eq!(stats.collision_count, 1);
    }

    #[test]
    fn test_remove_promotes_collision() {
        let mut index = small_index();
        let other = name_of(9);
        let mut entry = index.get_entry(2, 50, None);
        index.put_entry(&mut entry, 50, 5, None).unwrap();
        let mut entry = index.get_entry(2, 50, Some(&other));
        index.put_entry(&mut entry, 50, 6, Some(&other)).unwrap();

        let mut base = index.get_entry(2, 50, None);
        assert!(!base.is_collision);
        index.remove_entry(&mut base).unwrap();

        // The collision became the plain entry for key 50, keeping value 6.
        let found = index.get_entry(2, 50, None);
        assert!(!found.is_collision);
        assert_eq!(found.key, 50);
        assert_eq!(index.get_value(&found), 6);
        let stats = index.stats();
        assert_eq!(stats.record_count, 1);
        assert_eq!(stats.collision_count, 0);
    }

    #[test]
    fn test_remove_folds_delta_into_successor() {
        let mut index = small_index();
        for (key, value) in [(10, 1), (20, 2), (30, 3)] {
            let mut entry = index.get_entry(4, key, None);
            index.put_entry(&mut entry, key, value, None).unwrap();
        }
        let mut middle = index.get_entry(4, 20, None);
        index.remove_entry(&mut middle).unwrap();
        assert_eq!(middle.key, 30); // cursor lands on the successor

        let mut scan = index.start_search(4);
        assert_eq!(scan.key, 10);
        index.next_entry(&mut scan);
        assert_eq!(scan.key, 30);
        assert_eq!(scan.delta, 20);
        assert_eq!(index.get_value(&scan), 3);
    }

    #[test]
    fn test_set_value_in_place() {
        let mut index = small_index();
        let mut entry = index.get_entry(5, 9, None);
        index.put_entry(&mut entry, 9, 1, None).unwrap();
        index.set_value(&entry, 200).unwrap();
        let found = index.get_entry(5, 9, None);
        assert_eq!(index.get_value(&found), 200);
        // payload is 8 bits here
        assert!(matches!(
            index.set_value(&entry, 256),
            Err(IndexError::OutOfRange(_))
        ));
    }

    #[test]
    fn test_key_zero_first_entry_is_not_collision() {
        let mut index = small_index();
        let mut entry = index.get_entry(0, 0, None);
        index.put_entry(&mut entry, 0, 7, None).unwrap();
        let scan = index.start_search(0);
        assert_eq!(scan.key, 0);
        assert_eq!(scan.delta, 0);
        assert!(!scan.is_collision);
    }

    #[test]
    fn test_overflow_is_reported_not_silent() {
        let mut index = DeltaIndex::new(1, 2, 1024, 8, 64).unwrap();
        let mut inserted = 0u32;
        let result = loop {
            let mut entry = index.get_entry(0, inserted * 3, None);
            match index.put_entry(&mut entry, inserted * 3, 1, None) {
                Ok(()) => inserted += 1,
                Err(e) => break e,
            }
            if inserted > 10_000 {
                panic!("tiny arena never overflowed");
            }
        };
        assert!(matches!(result, IndexError::Overflow));
        assert_eq!(index.stats().record_count, inserted as u64);
        assert!(index.stats().overflow_count >= 1);
        // Every inserted entry is still intact.
        let mut scan = index.start_search(0);
        let mut seen = 0;
        while !scan.at_end {
            seen += 1;
            index.next_entry(&mut scan);
        }
        assert_eq!(seen, inserted);
    }

    #[test]
    fn test_locked_delta_width_table() {
        // mean delta 1024, payload 4 bits: the encoded delta width must
        // follow min_bits + (incr - min + delta) / incr with
        // (min_bits, min_keys, incr_keys) = (10, 314, 710).
        let index = DeltaIndex::new(1, 1, 1024, 4, 4096).unwrap();
        let expected: &[(u32, u64)] = &[
            (0, 10),
            (1, 10),
            (313, 10),
            (314, 11),
            (1023, 11),
            (1024, 12),
            (1733, 12),
            (1734, 13),
            (2443, 13),
            (2444, 14),
            (0x1FFFFF, 2964),
        ];
        for &(delta, width) in expected {
            let mut buf = BitBuffer::new();
            index.encode_delta(&mut buf, delta);
            assert_eq!(buf.len(), width, "delta {delta}");
        }
    }

    #[test]
    fn test_full_width_table_progression() {
        // 27 steps of the width ladder, one per boundary.
        let index = DeltaIndex::new(1, 1, 1024, 4, 4096).unwrap();
        for step in 0..27u32 {
            let delta = if step == 0 { 0 } else { 314 + (step - 1) * 710 };
            let mut buf = BitBuffer::new();
            index.encode_delta(&mut buf, delta);
            assert_eq!(buf.len() as u32, 10 + step, "boundary step {step}");
        }
    }

    #[test]
    fn test_random_model_check() {
        // Mirror of the invariant: after any sequence of put/remove, a full
        // scan recovers exactly the live set and the stats agree.
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut index = DeltaIndex::new(2, 16, 256, 10, 64 * 1024).unwrap();
        let mut model: BTreeMap<(u32, u32), u32> = BTreeMap::new();

        for _ in 0..4000 {
            let list = rng.gen_range(0..16);
            let key = rng.gen_range(0..4000u32);
            if rng.gen_bool(0.7) {
                let value = rng.gen_range(0..1024);
                let mut entry = index.get_entry(list, key, None);
                if !entry.at_end && entry.key == key {
                    index.set_value(&entry, value).unwrap();
                } else {
                    index.put_entry(&mut entry, key, value, None).unwrap();
                }
                model.insert((list, key), value);
            } else {
                let mut entry = index.get_entry(list, key, None);
                if !entry.at_end && entry.key == key {
                    index.remove_entry(&mut entry).unwrap();
                    model.remove(&(list, key));
                } else {
                    assert!(!model.contains_key(&(list, key)));
                }
            }
        }

        let mut recovered = BTreeMap::new();
        for list in 0..16 {
            let mut entry = index.start_search(list);
            let mut last_key = None;
            while !entry.at_end {
                assert!(!entry.is_collision);
                if let Some(last) = last_key {
                    assert!(entry.key > last, "keys must strictly increase");
                    assert_eq!(entry.key - entry.delta, last);
                }
                last_key = Some(entry.key);
                recovered.insert((list, entry.key), index.get_value(&entry));
                index.next_entry(&mut entry);
            }
        }
        assert_eq!(recovered, model);
        assert_eq!(index.stats().record_count, model.len() as u64);
        assert_eq!(index.stats().collision_count, 0);
    }

    #[test]
    fn test_save_restore_round_trip_same_zones() {
        let mut rng = StdRng::seed_from_u64(7);
        let mut index = DeltaIndex::new(3, 24, 512, 12, 64 * 1024).unwrap();
        let mut inserted = Vec::new();
        for _ in 0..500 {
            let list = rng.gen_range(0..24);
            let key = rng.gen_range(0..100_000u32);
            let value = rng.gen_range(0..4096);
            let mut entry = index.get_entry(list, key, None);
            if entry.at_end || entry.key != key {
                index.put_entry(&mut entry, key, value, None).unwrap();
                inserted.push((list, key, value));
            }
        }
        let before = index.stats();

        let mut streams: Vec<Vec<u8>> = Vec::new();
        for zone in 0..3 {
            let mut buf = Vec::new();
            index.save_zone(zone, &mut buf).unwrap();
            streams.push(buf);
        }

        let mut slices: Vec<&[u8]> = streams.iter().map(|s| s.as_slice()).collect();
        let mut readers: Vec<&mut dyn Read> =
            slices.iter_mut().map(|s| s as &mut dyn Read).collect();
        let mut restored =
            DeltaIndex::restore(3, 24, 512, 12, 64 * 1024, &mut readers).unwrap();

        let after = restored.stats();
        assert_eq!(before.record_count, after.record_count);
        assert_eq!(before.collision_count, after.collision_count);
        for (list, key, value) in inserted {
            let entry = restored.get_entry(list, key, None);
            assert!(!entry.at_end && entry.key == key, "lost {list}/{key}");
            assert_eq!(restored.get_value(&entry), value);
        }
    }

    #[test]
    fn test_restore_into_different_zone_count() {
        let mut index = DeltaIndex::new(1, 12, 512, 12, 32 * 1024).unwrap();
        for key in (0..600u32).step_by(3) {
            let list = key % 12;
            let mut entry = index.get_entry(list, key, None);
            index.put_entry(&mut entry, key, (key % 4096) as u32, None).unwrap();
        }
        let before = index.stats();

        let mut stream = Vec::new();
        index.save_zone(0, &mut stream).unwrap();
        let mut slice = stream.as_slice();
        let mut readers: Vec<&mut dyn Read> = vec![&mut slice as &mut dyn Read];
        let mut restored =
            DeltaIndex::restore(4, 12, 512, 12, 32 * 1024, &mut readers).unwrap();

        assert_eq!(restored.stats().record_count, before.record_count);
        for key in (0..600u32).step_by(3) {
            let entry = restored.get_entry(key % 12, key, None);
            assert!(!entry.at_end && entry.key == key);
            assert_eq!(restored.get_value(&entry), key % 4096);
        }
    }

    #[test]
    fn test_restore_detects_corruption() {
        let mut index = small_index();
        let mut entry = index.get_entry(0, 10, None);
        index.put_entry(&mut entry, 10, 1, None).unwrap();
        let mut stream = Vec::new();
        index.save_zone(0, &mut stream).unwrap();

        // Flip a data byte: checksum must catch it.
        let mut bad = stream.clone();
        let mid = bad.len() / 2;
        bad[mid] ^= 0xFF;
        let mut slice = bad.as_slice();
        let mut readers: Vec<&mut dyn Read> = vec![&mut slice as &mut dyn Read];
        let result = DeltaIndex::restore(1, 8, 1024, 8, 16 * 1024, &mut readers);
        assert!(matches!(
            result,
            Err(IndexError::ChecksumMismatch { .. }) | Err(IndexError::CorruptData(_))
        ));

        // Break the magic.
        let mut bad = stream;
        bad[0] = b'X';
        let mut slice = bad.as_slice();
        let mut readers: Vec<&mut dyn Read> = vec![&mut slice as &mut dyn Read];
        assert!(matches!(
            DeltaIndex::restore(1, 8, 1024, 8, 16 * 1024, &mut readers),
            Err(IndexError::BadMagic)
        ));
    }
}
