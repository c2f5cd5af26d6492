//! Closing a chapter: collate the zones' open-chapter snapshots into
//! delta-list bucket order, build the chapter's immutable delta index and
//! record pages, and hand the page images to the volume.

use dedup_index_common::config::delta_index_bit_size;
use dedup_index_common::{
    Block, Geometry, IndexError, RecordData, RecordName, VirtualChapter,
};
use dedup_index_delta::index::DeltaIndex;
use dedup_index_delta::page::pack_page;
use dedup_index_volume::record_page::fill_record_page;
use tracing::debug;

/// Page images of one built chapter, ready for the volume.
pub struct BuiltChapter {
    pub vcn: VirtualChapter,
    pub index_pages: Vec<Box<Block>>,
    pub record_pages: Vec<Box<Block>>,
    /// Last delta list covered by each index page, for the page map.
    pub last_lists: Vec<u32>,
    pub record_count: u32,
}

/// Build the on-disk form of a closed chapter from its records.
pub fn build_chapter(
    geometry: &Geometry,
    vcn: VirtualChapter,
    records: &[(RecordName, RecordData)],
) -> Result<BuiltChapter, IndexError> {
    if records.len() > geometry.records_per_chapter as usize {
        return Err(IndexError::InvalidArgument("too many records for a chapter"));
    }

    // Bucket records by chapter delta list.
    let list_count = geometry.delta_lists_per_chapter;
    let mut buckets: Vec<Vec<&(RecordName, RecordData)>> = vec![Vec::new(); list_count as usize];
    for record in records {
        buckets[geometry.hash_to_chapter_delta_list(&record.0) as usize].push(record);
    }

    // Lay the buckets out contiguously across the record pages, building
    // the chapter index as we go; the payload is the record page number.
    let memory = delta_index_bit_size(
        geometry.records_per_chapter as u64,
        geometry.chapter_mean_delta,
        geometry.chapter_payload_bits,
    ) / 8
        * 106
        / 100
        + 1024;
    let mut index = DeltaIndex::new(
        1,
        list_count,
        geometry.chapter_mean_delta,
        geometry.chapter_payload_bits,
        memory,
    )?;

    let records_per_page = geometry.records_per_page as usize;
    let mut ordered: Vec<(RecordName, RecordData)> = Vec::with_capacity(records.len());
    for (list, bucket) in buckets.iter().enumerate() {
        for record in bucket {
            let page_number = (ordered.len() / records_per_page) as u32;
            let address = geometry.hash_to_chapter_delta_address(&record.0);
            let mut entry = index.get_entry(list as u32, address, Some(&record.0 .0));
            if !entry.at_end && entry.key == address && !entry.is_collision {
                index.put_entry(&mut entry, address, page_number, Some(&record.0 .0))?;
            } else if entry.at_end || entry.key != address {
                index.put_entry(&mut entry, address, page_number, None)?;
            } else {
                // Cursor sits on a collision already carrying this name:
                // the same name twice in one chapter cannot happen, but be
                // safe and refresh the page number.
                index.set_value(&entry, page_number)?;
            }
            ordered.push(**record);
        }
    }

    // Pack the delta lists onto the chapter's index pages.
    let mut index_pages = Vec::with_capacity(geometry.index_pages_per_chapter as usize);
    let mut last_lists = Vec::with_capacity(geometry.index_pages_per_chapter as usize);
    let mut first_list = 0u32;
    for _ in 0..geometry.index_pages_per_chapter {
        let mut page = vec![0u8; dedup_index_common::BYTES_PER_BLOCK];
        let packed = pack_page(&mut page, &index, vcn, first_list)?;
        first_list += packed;
        last_lists.push(if first_list == 0 {
            list_count - 1
        } else {
            first_list - 1
        });
        let boxed: Box<Block> = page
            .into_boxed_slice()
            .try_into()
            .map_err(|_| IndexError::CorruptData("page size"))?;
        index_pages.push(boxed);
    }
    if first_list < list_count {
        return Err(IndexError::NoSpace("chapter index pages"));
    }

    // Fill the record pages from the ordered layout.
    let mut record_pages = Vec::with_capacity(geometry.record_pages_per_chapter as usize);
    for chunk_start in (0..geometry.record_pages_per_chapter as usize * records_per_page)
        .step_by(records_per_page)
    {
        let chunk_end = (chunk_start + records_per_page).min(ordered.len());
        let mut page = dedup_index_common::empty_block();
        if chunk_start < ordered.len() {
            fill_record_page(&mut page, &ordered[chunk_start..chunk_end]);
        }
        record_pages.push(page);
    }

    debug!(vcn, records = ordered.len(), "chapter built");
    Ok(BuiltChapter {
        vcn,
        index_pages,
        record_pages,
        last_lists,
        record_count: ordered.len() as u32,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use dedup_index_delta::page::{read_header, search_page, DeltaCoding};
    use dedup_index_volume::record_page::search_record_page;

    fn geometry() -> Geometry {
        Geometry::new(4, 16, 0).unwrap()
    }

    fn name(tag: u32) -> RecordName {
        let mut bytes = [0u8; 32];
        bytes[8..12].copy_from_slice(&tag.wrapping_mul(2654435761).to_le_bytes());
        bytes[12..16].copy_from_slice(&tag.to_le_bytes());
        bytes[24..28].copy_from_slice(&tag.to_le_bytes());
        RecordName(bytes)
    }

    fn data(tag: u32) -> RecordData {
        RecordData([(tag % 251) as u8; 16])
    }

    #[test]
    fn test_build_and_search_chapter() {
        let g = geometry();
        let records: Vec<_> = (0..200u32).map(|i| (name(i), data(i))).collect();
        let built = build_chapter(&g, 12, &records).unwrap();

        assert_eq!(built.index_pages.len(), g.index_pages_per_chapter as usize);
        assert_eq!(built.record_pages.len(), g.record_pages_per_chapter as usize);
        assert_eq!(built.record_count, 200);

        // Every record resolves through the chapter index to its page.
        let coding = DeltaCoding::new(g.chapter_mean_delta, g.chapter_payload_bits);
        for (record_name, record_data) in &records {
            let list = g.hash_to_chapter_delta_list(record_name);
            let key = g.hash_to_chapter_delta_address(record_name);
            let page_idx = built
                .last_lists
                .iter()
                .position(|&last| list <= last)
                .unwrap();
            let header = read_header(&built.index_pages[page_idx][..]).unwrap();
            assert_eq!(header.vcn, 12);
            let value = search_page(
                &built.index_pages[page_idx][..],
                &header,
                &coding,
                list,
                key,
                &record_name.0,
            )
            .unwrap()
            .expect("record must be indexed");
            let found = search_record_page(&built.record_pages[value as usize], record_name)
                .expect("record must be stored");
            assert_eq!(found, *record_data);
        }
    }

    #[test]
    fn test_build_empty_chapter() {
        let g = geometry();
        let built = build_chapter(&g, 3, &[]).unwrap();
        assert_eq!(built.record_count, 0);
        assert_eq!(built.index_pages.len(), g.index_pages_per_chapter as usize);
        // Index pages still carry valid headers for the rebuild scan.
        for page in &built.index_pages {
            let header = read_header(&page[..]).unwrap();
            assert_eq!(header.vcn, 3);
        }
    }

    #[test]
    fn test_collision_addresses_in_one_chapter() {
        // Two names forced onto the same list and address must both be
        // retrievable: the second becomes a collision entry.
        let g = geometry();
        let a = name(1);
        let mut b_bytes = name(2).0;
        b_bytes[8..16].copy_from_slice(&a.0[8..16]); // same list and address
        let b = RecordName(b_bytes);
        assert_ne!(a, b);
        assert_eq!(
            g.hash_to_chapter_delta_address(&b),
            g.hash_to_chapter_delta_address(&a)
        );
        assert_eq!(
            g.hash_to_chapter_delta_list(&b),
            g.hash_to_chapter_delta_list(&a)
        );

        let records = vec![(a, data(1)), (b, data(2))];
        let built = build_chapter(&g, 9, &records).unwrap();

        let coding = DeltaCoding::new(g.chapter_mean_delta, g.chapter_payload_bits);
        for (record_name, record_data) in &records {
            let list = g.hash_to_chapter_delta_list(record_name);
            let key = g.hash_to_chapter_delta_address(record_name);
            let page_idx = built
                .last_lists
                .iter()
                .position(|&last| list <= last)
                .unwrap();
            let header = read_header(&built.index_pages[page_idx][..]).unwrap();
            let value = search_page(
                &built.index_pages[page_idx][..],
                &header,
                &coding,
                list,
                key,
                &record_name.0,
            )
            .unwrap()
            .unwrap();
            let found =
                search_record_page(&built.record_pages[value as usize], record_name).unwrap();
            assert_eq!(found, *record_data);
        }
    }
}
