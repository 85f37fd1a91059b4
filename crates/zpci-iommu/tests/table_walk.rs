use proptest::prelude::*;
use zpci_iommu::{
    page_index, region_index, segment_index, walk, IoTranslationAnchor, PageEntry, Permission,
    RegionEntry, SegmentEntry, TableLevel, TranslateFault, PAGE_SIZE, REGION_SIZE, SEGMENT_SIZE,
};
use zpci_mem::{GuestMemory, GuestRam};

const RT: u64 = 0x4000;
const ST: u64 = 0x2_0000;
const PT: u64 = 0x3_0000;

fn frame_for(dma: u64) -> u64 {
    0x80_0000 + ((dma >> 12) & 0xff) * PAGE_SIZE
}

/// Builds a single region → segment → page chain for `dma`.
fn single_chain(dma: u64) -> GuestRam {
    let ram = GuestRam::new(0x100_0000).unwrap();
    ram.write_u64_be(RT + region_index(dma) * 8, RegionEntry::encode(ST, false))
        .unwrap();
    ram.write_u64_be(ST + segment_index(dma) * 8, SegmentEntry::encode(PT, false))
        .unwrap();
    ram.write_u64_be(
        PT + page_index(dma) * 8,
        PageEntry::encode(frame_for(dma), false),
    )
    .unwrap();
    ram
}

#[test]
fn reference_chain() {
    let ram = single_chain(0x1_0000_1000);
    let entry = walk(&ram, IoTranslationAnchor::region_third(RT), 0x1_0000_1000).unwrap();
    assert_eq!(entry.translated_addr, frame_for(0x1_0000_1000));
    assert_eq!(entry.perm, Permission::READ_WRITE);
    assert_eq!(entry.addr_mask, 0xfff);
}

#[test]
fn wrong_region_type_is_a_table_type_fault() {
    let dma = 0x1_0000_0000;
    let ram = single_chain(dma);
    // Segment-type tag where a region-third entry is expected.
    ram.write_u64_be(RT + region_index(dma) * 8, ST | 0x3).unwrap();
    let err = walk(&ram, IoTranslationAnchor::region_third(RT), dma).unwrap_err();
    assert_eq!(
        err,
        TranslateFault::TableType {
            level: TableLevel::Region,
            entry_addr: RT + region_index(dma) * 8
        }
    );
    assert_eq!(err.event_code(), 0x9);
}

#[test]
fn invalid_region_unmaps_the_whole_region() {
    let dma = 0x1_2345_6000;
    let ram = single_chain(dma);
    ram.write_u64_be(
        RT + region_index(dma) * 8,
        RegionEntry::encode(ST, false) | 0x20,
    )
    .unwrap();
    let entry = walk(&ram, IoTranslationAnchor::region_third(RT), dma).unwrap();
    assert_eq!(entry.perm, Permission::NONE);
    assert_eq!(entry.len(), REGION_SIZE);
    assert_eq!(entry.iova, dma & !(REGION_SIZE - 1));
}

#[test]
fn table_outside_guest_memory_is_an_invalid_entry() {
    let ram = GuestRam::new(0x1000).unwrap();
    let err = walk(&ram, IoTranslationAnchor::region_third(0x10_0000), 0).unwrap_err();
    assert!(matches!(
        err,
        TranslateFault::InvalidEntry {
            level: TableLevel::Region,
            ..
        }
    ));
}

#[test]
fn table_at_the_top_of_the_address_space_is_an_invalid_entry() {
    let ram = GuestRam::new(0x1000).unwrap();
    let origin = 0xffff_ffff_ffff_f000;
    let err = walk(&ram, IoTranslationAnchor::region_third(origin), 0x3ff_8000_0000).unwrap_err();
    assert_eq!(
        err,
        TranslateFault::InvalidEntry {
            level: TableLevel::Region,
            entry_addr: origin
        }
    );
}

proptest! {
    #[test]
    fn any_page_in_the_window_resolves_to_its_frame(
        page in (0x1_0000_0000u64 >> 12)..=(0x1_ffff_ffffu64 >> 12),
        offset in 0u64..PAGE_SIZE,
    ) {
        let dma = (page << 12) | offset;
        let ram = single_chain(dma);
        let entry = walk(&ram, IoTranslationAnchor::region_third(RT), dma).unwrap();
        prop_assert_eq!(entry.iova, dma & !(PAGE_SIZE - 1));
        prop_assert_eq!(entry.translate(dma), frame_for(dma) + offset);
        prop_assert_eq!(entry.perm, Permission::READ_WRITE);
    }

    #[test]
    fn neighbouring_segment_is_unpopulated(page in 0u64..256) {
        let dma = 0x1_0000_0000 + page * PAGE_SIZE;
        let ram = single_chain(dma);
        let err = walk(&ram, IoTranslationAnchor::region_third(RT), dma + SEGMENT_SIZE)
            .unwrap_err();
        let is_segment_fault = matches!(
            err,
            TranslateFault::InvalidEntry {
                level: TableLevel::Segment,
                ..
            }
        );
        prop_assert!(is_segment_fault);
    }
}
