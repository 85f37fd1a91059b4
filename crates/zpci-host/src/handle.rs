use std::fmt;

/// Guest-visible function handle.
///
/// The low 16 bits name the slot, the class byte says whether the function is emulated or
/// backed by a host device, and the top bit tracks whether the guest has enabled it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FunctionHandle(u32);

impl FunctionHandle {
    pub const ENABLED: u32 = 0x8000_0000;
    pub const INSTANCE_MASK: u32 = 0x7f00_0000;
    pub const CLASS_MASK: u32 = 0x00ff_0000;
    pub const INDEX_MASK: u32 = 0x0000_ffff;

    pub const CLASS_PASSTHROUGH: u32 = 0x0001_0000;
    pub const CLASS_EMULATED: u32 = 0x0002_0000;

    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    /// Disabled handle for the function occupying `index`.
    pub const fn for_slot(index: u16, passthrough: bool) -> Self {
        let class = if passthrough {
            Self::CLASS_PASSTHROUGH
        } else {
            Self::CLASS_EMULATED
        };
        Self(class | index as u32)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    pub const fn index(self) -> u16 {
        (self.0 & Self::INDEX_MASK) as u16
    }

    pub const fn is_enabled(self) -> bool {
        self.0 & Self::ENABLED != 0
    }

    pub const fn is_passthrough(self) -> bool {
        self.0 & Self::CLASS_MASK == Self::CLASS_PASSTHROUGH
    }

    #[must_use]
    pub const fn with_enabled(self, enabled: bool) -> Self {
        if enabled {
            Self(self.0 | Self::ENABLED)
        } else {
            Self(self.0 & !Self::ENABLED)
        }
    }
}

impl fmt::Debug for FunctionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FunctionHandle({:#010x})", self.0)
    }
}

impl fmt::LowerHex for FunctionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}
