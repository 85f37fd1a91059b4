//! Decoding of the three translation-table entry formats.
//!
//! Each level gets its own closed enum so the walker matches on meaning instead of masking
//! bits inline.

const TABLE_TYPE_MASK: u64 = 0xc;
const TABLE_TYPE_REGION: u64 = 0x4;
const TABLE_TYPE_SEGMENT: u64 = 0x0;
const TABLE_LEN_MASK: u64 = 0x3;
const TABLE_LEN_REGION: u64 = 0x3;
const TABLE_OFFSET_MASK: u64 = 0xc0;
const TABLE_INVALID: u64 = 0x20;
const TABLE_PROTECTED: u64 = 0x200;
const SEGMENT_FORMAT_CONTROL: u64 = 0x400;
const PAGE_INVALID: u64 = 0x400;

const REGION_ORIGIN_MASK: u64 = !0x3fff;
const SEGMENT_ORIGIN_MASK: u64 = !0x7ff;
const PAGE_FRAME_MASK: u64 = !0xfff;
const SEGMENT_FRAME_MASK: u64 = !0xf_ffff;

/// Region-third table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegionEntry {
    /// All-zero entry: the guest never populated this slot.
    Empty,
    /// Invalid bit set: the whole 2 GiB region is unmapped.
    Invalid,
    /// Table length/offset fields do not describe a full segment table.
    BadLength,
    /// Type tag does not name a region-third entry.
    WrongType,
    SegmentTable { origin: u64, protected: bool },
}

impl RegionEntry {
    pub fn decode(raw: u64) -> Self {
        if raw == 0 {
            return Self::Empty;
        }
        if raw & TABLE_INVALID != 0 {
            return Self::Invalid;
        }
        if raw & TABLE_LEN_MASK != TABLE_LEN_REGION || raw & TABLE_OFFSET_MASK != 0 {
            return Self::BadLength;
        }
        if raw & TABLE_TYPE_MASK != TABLE_TYPE_REGION {
            return Self::WrongType;
        }
        match raw & REGION_ORIGIN_MASK {
            0 => Self::WrongType,
            origin => Self::SegmentTable {
                origin,
                protected: raw & TABLE_PROTECTED != 0,
            },
        }
    }

    pub const fn encode(origin: u64, protected: bool) -> u64 {
        let prot = if protected { TABLE_PROTECTED } else { 0 };
        (origin & REGION_ORIGIN_MASK) | TABLE_TYPE_REGION | TABLE_LEN_REGION | prot
    }
}

/// Segment table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentEntry {
    Empty,
    Invalid,
    WrongType,
    PageTable { origin: u64, protected: bool },
    /// Format-control set: the entry maps a 1 MiB frame directly.
    LargeFrame { frame: u64, protected: bool },
}

impl SegmentEntry {
    pub fn decode(raw: u64) -> Self {
        if raw == 0 {
            return Self::Empty;
        }
        if raw & TABLE_INVALID != 0 {
            return Self::Invalid;
        }
        if raw & TABLE_TYPE_MASK != TABLE_TYPE_SEGMENT {
            return Self::WrongType;
        }
        let protected = raw & TABLE_PROTECTED != 0;
        if raw & SEGMENT_FORMAT_CONTROL != 0 {
            return Self::LargeFrame {
                frame: raw & SEGMENT_FRAME_MASK,
                protected,
            };
        }
        match raw & SEGMENT_ORIGIN_MASK {
            0 => Self::WrongType,
            origin => Self::PageTable { origin, protected },
        }
    }

    pub const fn encode(origin: u64, protected: bool) -> u64 {
        let prot = if protected { TABLE_PROTECTED } else { 0 };
        (origin & SEGMENT_ORIGIN_MASK) | TABLE_TYPE_SEGMENT | prot
    }

    pub const fn encode_large(frame: u64, protected: bool) -> u64 {
        let prot = if protected { TABLE_PROTECTED } else { 0 };
        (frame & SEGMENT_FRAME_MASK) | SEGMENT_FORMAT_CONTROL | prot
    }
}

/// Page table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageEntry {
    Empty,
    Invalid { frame: u64 },
    Frame { frame: u64, protected: bool },
}

impl PageEntry {
    pub fn decode(raw: u64) -> Self {
        let frame = raw & PAGE_FRAME_MASK;
        if raw == 0 {
            Self::Empty
        } else if raw & PAGE_INVALID != 0 {
            Self::Invalid { frame }
        } else {
            Self::Frame {
                frame,
                protected: raw & TABLE_PROTECTED != 0,
            }
        }
    }

    pub const fn encode(frame: u64, protected: bool) -> u64 {
        let prot = if protected { TABLE_PROTECTED } else { 0 };
        (frame & PAGE_FRAME_MASK) | prot
    }

    pub const fn encode_invalid(frame: u64) -> u64 {
        (frame & PAGE_FRAME_MASK) | PAGE_INVALID
    }
}
