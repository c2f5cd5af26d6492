//! Record pages: 64 fixed slots of (name, metadata), filled in delta-list
//! bucket order at chapter close.

use dedup_index_common::{
    Block, RecordData, RecordName, BYTES_PER_BLOCK, BYTES_PER_RECORD_SLOT, RECORD_DATA_SIZE,
    RECORD_NAME_SIZE,
};

pub const RECORDS_PER_PAGE: usize = BYTES_PER_BLOCK / BYTES_PER_RECORD_SLOT;

/// Write a run of records into consecutive slots starting at `first_slot`.
pub fn fill_record_page(page: &mut Block, records: &[(RecordName, RecordData)]) {
    debug_assert!(records.len() <= RECORDS_PER_PAGE);
    page.fill(0);
    for (slot, (name, data)) in records.iter().enumerate() {
        let at = slot * BYTES_PER_RECORD_SLOT;
        page[at..at + RECORD_NAME_SIZE].copy_from_slice(&name.0);
        page[at + RECORD_NAME_SIZE..at + RECORD_NAME_SIZE + RECORD_DATA_SIZE]
            .copy_from_slice(&data.0);
    }
}

/// Find a record by name. Empty slots are all-zero and simply never match a
/// real fingerprint.
pub fn search_record_page(page: &Block, name: &RecordName) -> Option<RecordData> {
    for slot in 0..RECORDS_PER_PAGE {
        let at = slot * BYTES_PER_RECORD_SLOT;
        if page[at..at + RECORD_NAME_SIZE] == name.0 {
            let mut data = [0u8; RECORD_DATA_SIZE];
            data.copy_from_slice(
                &page[at + RECORD_NAME_SIZE..at + RECORD_NAME_SIZE + RECORD_DATA_SIZE],
            );
            return Some(RecordData(data));
        }
    }
    None
}

/// All records on a page, skipping empty slots; used by rebuild.
pub fn read_record_page(page: &Block) -> Vec<(RecordName, RecordData)> {
    let mut out = Vec::new();
    for slot in 0..RECORDS_PER_PAGE {
        let at = slot * BYTES_PER_RECORD_SLOT;
        let name_bytes: [u8; RECORD_NAME_SIZE] =
            page[at..at + RECORD_NAME_SIZE].try_into().unwrap();
        if name_bytes == [0u8; RECORD_NAME_SIZE] {
            continue;
        }
        let mut data = [0u8; RECORD_DATA_SIZE];
        data.copy_from_slice(
            &page[at + RECORD_NAME_SIZE..at + RECORD_NAME_SIZE + RECORD_DATA_SIZE],
        );
        out.push((RecordName(name_bytes), RecordData(data)));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use dedup_index_common::empty_block;

    fn record(tag: u8) -> (RecordName, RecordData) {
        let mut name = [tag; RECORD_NAME_SIZE];
        name[0] = tag.wrapping_add(1);
        (RecordName(name), RecordData([tag; RECORD_DATA_SIZE]))
    }

    #[test]
    fn test_fill_and_search() {
        let records: Vec<_> = (1..=10u8).map(record).collect();
        let mut page = empty_block();
        fill_record_page(&mut page, &records);

        for (name, data) in &records {
            assert_eq!(search_record_page(&page, name), Some(*data));
        }
        let (absent, _) = record(99);
        assert_eq!(search_record_page(&page, &absent), None);
    }

    #[test]
    fn test_read_back_skips_empty_slots() {
        let records: Vec<_> = (1..=7u8).map(record).collect();
        let mut page = empty_block();
        fill_record_page(&mut page, &records);
        assert_eq!(read_record_page(&page), records);
    }

    #[test]
    fn test_full_page() {
        let records: Vec<_> = (1..=RECORDS_PER_PAGE as u8).map(record).collect();
        assert_eq!(records.len(), RECORDS_PER_PAGE);
        let mut page = empty_block();
        fill_record_page(&mut page, &records);
        assert_eq!(read_record_page(&page).len(), RECORDS_PER_PAGE);
    }
}
