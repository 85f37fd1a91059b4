use zpci_mem::GuestMemory;

use crate::{
    page_index, region_index, segment_index, IoTlbEntry, IoTranslationAnchor, PageEntry,
    Permission, RegionEntry, SegmentEntry, TableLevel, TranslateFault,
};

fn read_entry<M: GuestMemory + ?Sized>(
    mem: &M,
    level: TableLevel,
    entry_addr: u64,
) -> Result<u64, TranslateFault> {
    // Unbacked table memory is indistinguishable from a never-populated entry.
    mem.read_u64_be(entry_addr)
        .map_err(|_| TranslateFault::InvalidEntry { level, entry_addr })
}

/// Address of entry `index` in the table at `origin`; a table wrapping past the top of the
/// address space has no such entry.
fn entry_addr(level: TableLevel, origin: u64, index: u64) -> Result<u64, TranslateFault> {
    origin
        .checked_add(index * 8)
        .ok_or(TranslateFault::InvalidEntry {
            level,
            entry_addr: origin,
        })
}

fn restrict(perm: Permission, protected: bool) -> Permission {
    if protected {
        perm & Permission::READ
    } else {
        perm
    }
}

fn unmapped(addr: u64, level: TableLevel) -> IoTlbEntry {
    let size = level.frame_size();
    IoTlbEntry {
        iova: addr & !(size - 1),
        translated_addr: 0,
        addr_mask: size - 1,
        perm: Permission::NONE,
    }
}

/// Translates `addr` through the tables rooted at `anchor`.
///
/// Invalid (as opposed to empty) entries are not faults: they yield an entry with
/// [`Permission::NONE`] covering the whole range that level describes, which is what a
/// translation refresh needs in order to drop stale mappings.
pub fn walk<M: GuestMemory + ?Sized>(
    mem: &M,
    anchor: IoTranslationAnchor,
    addr: u64,
) -> Result<IoTlbEntry, TranslateFault> {
    if anchor.is_zero() {
        return Err(TranslateFault::NoTranslation);
    }
    if !anchor.is_supported() {
        return Err(TranslateFault::UnsupportedDesignation {
            designation: anchor.designation(),
        });
    }
    let perm = restrict(Permission::READ_WRITE, anchor.protected());

    let rte_addr = entry_addr(TableLevel::Region, anchor.table_origin(), region_index(addr))?;
    let (sto, perm) = match RegionEntry::decode(read_entry(mem, TableLevel::Region, rte_addr)?) {
        RegionEntry::Empty => {
            return Err(TranslateFault::InvalidEntry {
                level: TableLevel::Region,
                entry_addr: rte_addr,
            })
        }
        RegionEntry::Invalid => return Ok(unmapped(addr, TableLevel::Region)),
        RegionEntry::BadLength => {
            return Err(TranslateFault::InvalidLength {
                entry_addr: rte_addr,
            })
        }
        RegionEntry::WrongType => {
            return Err(TranslateFault::TableType {
                level: TableLevel::Region,
                entry_addr: rte_addr,
            })
        }
        RegionEntry::SegmentTable { origin, protected } => (origin, restrict(perm, protected)),
    };

    let ste_addr = entry_addr(TableLevel::Segment, sto, segment_index(addr))?;
    let (pto, perm) = match SegmentEntry::decode(read_entry(mem, TableLevel::Segment, ste_addr)?)
    {
        SegmentEntry::Empty => {
            return Err(TranslateFault::InvalidEntry {
                level: TableLevel::Segment,
                entry_addr: ste_addr,
            })
        }
        SegmentEntry::Invalid => return Ok(unmapped(addr, TableLevel::Segment)),
        SegmentEntry::WrongType => {
            return Err(TranslateFault::TableType {
                level: TableLevel::Segment,
                entry_addr: ste_addr,
            })
        }
        SegmentEntry::LargeFrame { frame, protected } => {
            return Ok(IoTlbEntry {
                iova: addr & !(crate::SEGMENT_SIZE - 1),
                translated_addr: frame,
                addr_mask: crate::SEGMENT_SIZE - 1,
                perm: restrict(perm, protected),
            })
        }
        SegmentEntry::PageTable { origin, protected } => (origin, restrict(perm, protected)),
    };

    let pte_addr = entry_addr(TableLevel::Page, pto, page_index(addr))?;
    let iova = addr & !(crate::PAGE_SIZE - 1);
    let entry = match PageEntry::decode(read_entry(mem, TableLevel::Page, pte_addr)?) {
        PageEntry::Empty => {
            return Err(TranslateFault::InvalidEntry {
                level: TableLevel::Page,
                entry_addr: pte_addr,
            })
        }
        PageEntry::Invalid { frame } => IoTlbEntry {
            iova,
            translated_addr: frame,
            addr_mask: crate::PAGE_SIZE - 1,
            perm: Permission::NONE,
        },
        PageEntry::Frame { frame, protected } => IoTlbEntry {
            iova,
            translated_addr: frame,
            addr_mask: crate::PAGE_SIZE - 1,
            perm: restrict(perm, protected),
        },
    };
    tracing::trace!(
        iova = format_args!("{:#x}", entry.iova),
        translated = format_args!("{:#x}", entry.translated_addr),
        perm = ?entry.perm,
        "io table walk"
    );
    Ok(entry)
}
