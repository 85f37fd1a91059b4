/// Address the guest's MSI doorbell writes are aimed at.
pub const MSI_ADDRESS: u64 = 0xfe00_0000_0000_0000;
/// Size of the doorbell window at [`MSI_ADDRESS`].
pub const MSI_WINDOW_SIZE: u64 = 0x1000;

pub const DEFAULT_DMA_START: u64 = 0x1_0000_0000;
pub const DEFAULT_DMA_END: u64 = 0x1ff_ffff_ffff_ffff;
pub const DEFAULT_GROUP_ID: u8 = 0x20;
/// Measurement update interval, in milliseconds.
pub const DEFAULT_MEASUREMENT_INTERVAL: u16 = 4000;

/// The handle index field is 16 bits wide.
pub const MAX_SLOTS: usize = 1 << 16;

/// Inclusive range of DMA addresses a function may register a translation window in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DmaWindowBounds {
    pub start: u64,
    pub end: u64,
}

impl Default for DmaWindowBounds {
    fn default() -> Self {
        Self {
            start: DEFAULT_DMA_START,
            end: DEFAULT_DMA_END,
        }
    }
}

/// Properties shared by all functions of a function group, reported through
/// query-function-group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionGroup {
    pub id: u8,
    /// Maximum number of MSI vectors per function.
    pub max_interrupts: u16,
    pub version: u8,
    /// Frame/refresh flags byte; bit 0 requests translation refresh for every mapping.
    pub frame_flags: u8,
    /// Largest block accepted by buffered store, in bytes.
    pub max_store_block: u16,
    pub measurement_interval_ms: u16,
    /// Supported DMA translation sizes.
    pub translation_sizes: u8,
    pub dma_address_space_mask: u64,
    pub msi_address: u64,
}

impl FunctionGroup {
    pub fn new(id: u8) -> Self {
        Self {
            id,
            max_interrupts: 128,
            version: 0,
            frame_flags: 1,
            max_store_block: 128,
            measurement_interval_ms: DEFAULT_MEASUREMENT_INTERVAL,
            translation_sizes: 0x40,
            dma_address_space_mask: 0,
            msi_address: MSI_ADDRESS,
        }
    }
}

impl Default for FunctionGroup {
    fn default() -> Self {
        Self::new(DEFAULT_GROUP_ID)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostBridgeConfig {
    /// Number of function slots in the registry.
    pub slots: usize,
    pub dma_window: DmaWindowBounds,
    pub msi_address: u64,
    pub groups: Vec<FunctionGroup>,
    /// Refuse to plug devices without an MSI-X capability.
    pub require_msix: bool,
    /// Let passthrough functions use host interrupt forwarding when the host offers it.
    pub interrupt_forwarding: bool,
}

impl Default for HostBridgeConfig {
    fn default() -> Self {
        Self {
            slots: 256,
            dma_window: DmaWindowBounds::default(),
            msi_address: MSI_ADDRESS,
            groups: vec![FunctionGroup::default()],
            require_msix: true,
            interrupt_forwarding: true,
        }
    }
}

impl HostBridgeConfig {
    pub fn group(&self, id: u8) -> Option<&FunctionGroup> {
        self.groups.iter().find(|group| group.id == id)
    }

    pub(crate) fn slot_count(&self) -> usize {
        self.slots.clamp(1, MAX_SLOTS)
    }
}
