use thiserror::Error;
use zpci_iommu::TranslateFault;
use zpci_mem::GuestMemoryError;

/// Errors from registry maintenance (plug, unplug, configuration changes).
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("slot {slot} is outside the {slots}-slot table")]
    SlotOutOfRange { slot: u16, slots: usize },
    #[error("slot {slot} is already occupied")]
    SlotOccupied { slot: u16 },
    #[error("no free function slot")]
    NoFreeSlot,
    #[error("function id {fid:#x} is already in use")]
    FidInUse { fid: u32 },
    #[error("uid {uid:#x} is already in use")]
    UidInUse { uid: u16 },
    #[error("no free uid")]
    NoFreeUid,
    #[error("function group {group:#x} is not configured")]
    UnknownGroup { group: u8 },
    #[error("device has no MSI-X capability")]
    MissingMsix,
    #[error("no function with id {fid:#x}")]
    NoSuchFunction { fid: u32 },
}

/// Why a device-initiated DMA access failed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DmaError {
    #[error("function is isolated after an earlier error")]
    FunctionInError,
    #[error("no function with id {fid:#x}")]
    NoSuchFunction { fid: u32 },
    #[error(transparent)]
    Translate(#[from] TranslateFault),
    #[error(transparent)]
    Memory(#[from] GuestMemoryError),
}
