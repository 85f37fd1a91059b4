//! DMA address translation for zPCI functions.
//!
//! A function's DMA addresses are translated through a guest-resident, three-level radix
//! table (region-third → segment → page). The walker in this crate is pure: it reads table
//! entries through [`zpci_mem::GuestMemory`] and reports either an [`IoTlbEntry`] or a
//! [`TranslateFault`]. Fault isolation and event reporting are left to the caller.

#![forbid(unsafe_code)]

mod anchor;
mod entry;
mod iotlb;
mod walk;

use bitflags::bitflags;
use thiserror::Error;

pub use anchor::{DesignationType, IoTranslationAnchor};
pub use entry::{PageEntry, RegionEntry, SegmentEntry};
pub use iotlb::{IoTlb, IoTlbUpdate};
pub use walk::walk;

pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;
pub const SEGMENT_SHIFT: u32 = 20;
pub const SEGMENT_SIZE: u64 = 1 << SEGMENT_SHIFT;
pub const REGION_SHIFT: u32 = 31;
pub const REGION_SIZE: u64 = 1 << REGION_SHIFT;

const REGION_INDEX_MASK: u64 = 0x7ff;
const SEGMENT_INDEX_MASK: u64 = 0x7ff;
const PAGE_INDEX_MASK: u64 = 0xff;

/// Region-third table index (11 bits) of a DMA address.
pub const fn region_index(addr: u64) -> u64 {
    (addr >> REGION_SHIFT) & REGION_INDEX_MASK
}

/// Segment table index (11 bits) of a DMA address.
pub const fn segment_index(addr: u64) -> u64 {
    (addr >> SEGMENT_SHIFT) & SEGMENT_INDEX_MASK
}

/// Page table index (8 bits) of a DMA address.
pub const fn page_index(addr: u64) -> u64 {
    (addr >> PAGE_SHIFT) & PAGE_INDEX_MASK
}

bitflags! {
    /// Access rights granted by a translation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Permission: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const READ_WRITE = Self::READ.bits() | Self::WRITE.bits();
    }
}

impl Permission {
    pub const NONE: Self = Self::empty();
}

/// Which table level an entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableLevel {
    Region,
    Segment,
    Page,
}

impl TableLevel {
    pub const fn frame_size(self) -> u64 {
        match self {
            TableLevel::Region => REGION_SIZE,
            TableLevel::Segment => SEGMENT_SIZE,
            TableLevel::Page => PAGE_SIZE,
        }
    }
}

impl std::fmt::Display for TableLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TableLevel::Region => "region",
            TableLevel::Segment => "segment",
            TableLevel::Page => "page",
        })
    }
}

/// Result of translating one DMA address.
///
/// `iova` and `translated_addr` are aligned to `addr_mask + 1`; an entry with
/// [`Permission::NONE`] describes an unmapped range of that size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoTlbEntry {
    pub iova: u64,
    pub translated_addr: u64,
    pub addr_mask: u64,
    pub perm: Permission,
}

impl IoTlbEntry {
    pub const fn len(&self) -> u64 {
        self.addr_mask + 1
    }

    pub fn is_mapped(&self) -> bool {
        !self.perm.is_empty()
    }

    /// Applies the translation to an address inside `[iova, iova + len)`.
    pub const fn translate(&self, addr: u64) -> u64 {
        self.translated_addr | (addr & self.addr_mask)
    }
}

/// Why a DMA address could not be translated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TranslateFault {
    #[error("no I/O address translation registered")]
    NoTranslation,
    #[error("DMA address {addr:#x} outside window [{base:#x}, {limit:#x}]")]
    OutOfRange { addr: u64, base: u64, limit: u64 },
    #[error("DMA write at {addr:#x} through a read-only translation")]
    Protection { addr: u64 },
    #[error("translation designation {designation:?} is not supported")]
    UnsupportedDesignation { designation: DesignationType },
    #[error("empty {level} table entry at {entry_addr:#x}")]
    InvalidEntry { level: TableLevel, entry_addr: u64 },
    #[error("region table entry at {entry_addr:#x} has an invalid table length")]
    InvalidLength { entry_addr: u64 },
    #[error("{level} table entry at {entry_addr:#x} has the wrong table type")]
    TableType { level: TableLevel, entry_addr: u64 },
}

impl TranslateFault {
    /// Architected error-event code reported to the guest for this fault.
    pub const fn event_code(&self) -> u16 {
        match self {
            TranslateFault::NoTranslation => 0x1,
            TranslateFault::OutOfRange { .. } => 0x2,
            TranslateFault::UnsupportedDesignation { .. } => 0x3,
            TranslateFault::Protection { .. } => 0x4,
            TranslateFault::InvalidEntry { .. } => 0x7,
            TranslateFault::InvalidLength { .. } => 0x8,
            TranslateFault::TableType { .. } => 0x9,
        }
    }
}
