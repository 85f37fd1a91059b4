//! The device-model seam: what the bridge needs from a PCI function it wraps.

use thiserror::Error;

pub const PCI_VENDOR_ID: u16 = 0x00;
pub const PCI_DEVICE_ID: u16 = 0x02;
pub const PCI_STATUS: u16 = 0x06;
pub const PCI_BASE_ADDRESS_0: u16 = 0x10;
pub const PCI_CAP_PTR_OFFSET: u16 = 0x34;
pub const PCI_STATUS_CAP_LIST: u32 = 1 << 4;
pub const PCI_CONFIG_SPACE_SIZE: usize = 256;
pub const PCI_BAR_COUNT: u8 = 6;

pub const PCI_CAP_ID_MSIX: u8 = 0x11;
pub const MSIX_ENTRY_SIZE: u64 = 16;
/// Offset of the message-data word inside an MSI-X table entry.
pub const MSIX_ENTRY_DATA: u64 = 8;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BarAccessError {
    #[error("BAR {bar} is not implemented")]
    NoSuchBar { bar: u8 },
    #[error("{len}-byte access at {offset:#x} is outside BAR {bar}")]
    OutOfRange { bar: u8, offset: u64, len: u8 },
    #[error("device rejected the access")]
    Rejected,
}

/// A PCI function model attached to the bridge.
///
/// Configuration space values use PCI (little-endian) semantics: `config_read(0, 2)` returns
/// the vendor id as a plain integer. BAR accesses carry the value exactly as the guest sees it
/// in its register; the bridge never swaps BAR data.
pub trait PciFunctionDevice: Send {
    fn config_read(&mut self, offset: u16, len: u8) -> u32;

    fn config_write(&mut self, offset: u16, len: u8, value: u32);

    /// Size of BAR `bar` in bytes, or 0 when it is not implemented.
    fn bar_size(&self, bar: u8) -> u64;

    fn bar_read(&mut self, bar: u8, offset: u64, len: u8) -> Result<u64, BarAccessError>;

    fn bar_write(&mut self, bar: u8, offset: u64, len: u8, value: u64)
        -> Result<(), BarAccessError>;

    /// Returns the function to its power-on state.
    fn reset(&mut self) {}

    fn vendor_id(&mut self) -> u16 {
        self.config_read(PCI_VENDOR_ID, 2) as u16
    }

    fn device_id(&mut self) -> u16 {
        self.config_read(PCI_DEVICE_ID, 2) as u16
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapabilityInfo {
    pub id: u8,
    pub offset: u8,
}

/// Walks the standard capability list through config reads.
pub fn capability_list(dev: &mut dyn PciFunctionDevice) -> Vec<CapabilityInfo> {
    let mut caps = Vec::new();
    if dev.config_read(PCI_STATUS, 2) & PCI_STATUS_CAP_LIST == 0 {
        return caps;
    }

    let mut seen = [false; PCI_CONFIG_SPACE_SIZE];
    let mut offset = (dev.config_read(PCI_CAP_PTR_OFFSET, 1) as u8) & 0xfc;
    while offset != 0 {
        let off = usize::from(offset);
        if off + 1 >= PCI_CONFIG_SPACE_SIZE || seen[off] {
            break;
        }
        seen[off] = true;

        let header = dev.config_read(u16::from(offset), 2);
        caps.push(CapabilityInfo {
            id: header as u8,
            offset,
        });
        offset = ((header >> 8) as u8) & 0xfc;
    }
    caps
}

pub fn find_capability(dev: &mut dyn PciFunctionDevice, id: u8) -> Option<u8> {
    capability_list(dev)
        .into_iter()
        .find(|cap| cap.id == id)
        .map(|cap| cap.offset)
}

/// Where a function's MSI-X table and pending-bit array live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsixLayout {
    pub table_bar: u8,
    pub table_offset: u32,
    pub entries: u16,
    pub pba_bar: u8,
    pub pba_offset: u32,
}

impl MsixLayout {
    pub fn probe(dev: &mut dyn PciFunctionDevice) -> Option<Self> {
        let cap = u16::from(find_capability(dev, PCI_CAP_ID_MSIX)?);
        let control = dev.config_read(cap + 2, 2);
        let table = dev.config_read(cap + 4, 4);
        let pba = dev.config_read(cap + 8, 4);
        Some(Self {
            table_bar: (table & 0x7) as u8,
            table_offset: table & !0x7,
            entries: (control & 0x7ff) as u16 + 1,
            pba_bar: (pba & 0x7) as u8,
            pba_offset: pba & !0x7,
        })
    }

    pub fn table_len(&self) -> u64 {
        u64::from(self.entries) * MSIX_ENTRY_SIZE
    }

    /// True when `offset` in BAR `bar` falls inside the MSI-X table.
    pub fn table_contains(&self, bar: u8, offset: u64) -> bool {
        let start = u64::from(self.table_offset);
        bar == self.table_bar && offset >= start && offset < start + self.table_len()
    }

    /// True when an access at `offset` targets the message-data word of a table entry.
    pub fn is_message_data(&self, bar: u8, offset: u64) -> bool {
        self.table_contains(bar, offset)
            && (offset - u64::from(self.table_offset)) % MSIX_ENTRY_SIZE == MSIX_ENTRY_DATA
    }
}
