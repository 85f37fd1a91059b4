/// Translation-table format named by the low bits of an I/O translation anchor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DesignationType {
    SegmentTable,
    RegionThird,
    RegionSecond,
    RegionFirst,
    PageFrameAbsolute,
    IoPageFrameAbsolute,
    Reserved,
    IoPageTable,
}

impl DesignationType {
    pub const fn from_bits(bits: u8) -> Self {
        match bits & 0x7 {
            0 => Self::SegmentTable,
            1 => Self::RegionThird,
            2 => Self::RegionSecond,
            3 => Self::RegionFirst,
            4 => Self::PageFrameAbsolute,
            5 => Self::IoPageFrameAbsolute,
            6 => Self::Reserved,
            _ => Self::IoPageTable,
        }
    }

    pub const fn bits(self) -> u8 {
        match self {
            Self::SegmentTable => 0,
            Self::RegionThird => 1,
            Self::RegionSecond => 2,
            Self::RegionFirst => 3,
            Self::PageFrameAbsolute => 4,
            Self::IoPageFrameAbsolute => 5,
            Self::Reserved => 6,
            Self::IoPageTable => 7,
        }
    }
}

/// Guest-supplied root of a function's translation tables (the "IOTA").
///
/// Layout of the 64-bit word:
/// - bits 2..=4: designation type
/// - bit 9: protection (all translations read-only)
/// - bit 11: translation enabled
/// - the remaining high bits: table origin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IoTranslationAnchor(u64);

impl IoTranslationAnchor {
    pub const TRANSLATION_ENABLED: u64 = 0x800;
    pub const PROTECTED: u64 = 0x200;
    const DESIGNATION_SHIFT: u32 = 2;
    const REGION_THIRD_FLAGS: u64 =
        Self::TRANSLATION_ENABLED | ((DesignationType::RegionThird.bits() as u64) << 2);

    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Builds an anchor naming a region-third table at `origin` with translation enabled.
    pub const fn region_third(origin: u64) -> Self {
        Self(origin | Self::REGION_THIRD_FLAGS)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub const fn designation(self) -> DesignationType {
        DesignationType::from_bits((self.0 >> Self::DESIGNATION_SHIFT) as u8)
    }

    pub const fn translation_enabled(self) -> bool {
        self.0 & Self::TRANSLATION_ENABLED != 0
    }

    pub const fn protected(self) -> bool {
        self.0 & Self::PROTECTED != 0
    }

    /// True for the single supported configuration: a region-third table with translation on.
    pub const fn is_supported(self) -> bool {
        self.translation_enabled() && matches!(self.designation(), DesignationType::RegionThird)
    }

    pub const fn table_origin(self) -> u64 {
        self.0 & !Self::REGION_THIRD_FLAGS
    }
}
