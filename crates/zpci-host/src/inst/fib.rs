//! Function information block, the operand of MPCIFC and STPCIFC.

pub const FIB_LEN: usize = 80;

const FIB_FMT: usize = 0;
const FIB_FC: usize = 8;
const FIB_PBA: usize = 16;
const FIB_PAL: usize = 24;
const FIB_IOTA: usize = 32;
const FIB_DATA: usize = 40;
const FIB_AIBV: usize = 48;
const FIB_AISB: usize = 56;
const FIB_FMB_ADDR: usize = 64;
const FIB_GD: usize = 76;

pub const FIB_FC_ENABLED: u8 = 0x80;
pub const FIB_FC_BLOCKED: u8 = 0x40;
pub const FIB_FC_ERROR: u8 = 0x20;
pub const FIB_FC_TRANSLATION: u8 = 0x10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Fib {
    pub fmt: u8,
    pub fc: u8,
    /// PCI base address of the DMA window.
    pub pba: u64,
    /// PCI address limit of the DMA window.
    pub pal: u64,
    pub iota: u64,
    pub isc: u8,
    /// Number of interrupts.
    pub noi: u16,
    /// Offset of the first vector bit in the indicator vector.
    pub aibvo: u8,
    pub sum: bool,
    /// Summary bit offset.
    pub aisbo: u8,
    /// Indicator vector address.
    pub aibv: u64,
    /// Summary bit byte address.
    pub aisb: u64,
    pub fmb_addr: u64,
    pub gd: u32,
}

fn be_u64(buf: &[u8; FIB_LEN], at: usize) -> u64 {
    let mut word = [0u8; 8];
    word.copy_from_slice(&buf[at..at + 8]);
    u64::from_be_bytes(word)
}

fn be_u32(buf: &[u8; FIB_LEN], at: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&buf[at..at + 4]);
    u32::from_be_bytes(word)
}

impl Fib {
    pub fn decode(buf: &[u8; FIB_LEN]) -> Self {
        let data = be_u32(buf, FIB_DATA);
        Self {
            fmt: buf[FIB_FMT],
            fc: buf[FIB_FC],
            pba: be_u64(buf, FIB_PBA),
            pal: be_u64(buf, FIB_PAL),
            iota: be_u64(buf, FIB_IOTA),
            isc: ((data >> 28) & 0x7) as u8,
            noi: ((data >> 16) & 0xfff) as u16,
            aibvo: ((data >> 8) & 0x3f) as u8,
            sum: data & 0x80 != 0,
            aisbo: (data & 0x3f) as u8,
            aibv: be_u64(buf, FIB_AIBV),
            aisb: be_u64(buf, FIB_AISB),
            fmb_addr: be_u64(buf, FIB_FMB_ADDR),
            gd: be_u32(buf, FIB_GD),
        }
    }

    /// The packed interrupt-control word.
    pub fn data(&self) -> u32 {
        (u32::from(self.isc & 0x7) << 28)
            | (u32::from(self.noi & 0xfff) << 16)
            | (u32::from(self.aibvo & 0x3f) << 8)
            | (u32::from(self.sum) << 7)
            | u32::from(self.aisbo & 0x3f)
    }

    pub fn encode(&self) -> [u8; FIB_LEN] {
        let mut buf = [0u8; FIB_LEN];
        buf[FIB_FMT] = self.fmt;
        buf[FIB_FC] = self.fc;
        buf[FIB_PBA..FIB_PBA + 8].copy_from_slice(&self.pba.to_be_bytes());
        buf[FIB_PAL..FIB_PAL + 8].copy_from_slice(&self.pal.to_be_bytes());
        buf[FIB_IOTA..FIB_IOTA + 8].copy_from_slice(&self.iota.to_be_bytes());
        buf[FIB_DATA..FIB_DATA + 4].copy_from_slice(&self.data().to_be_bytes());
        buf[FIB_AIBV..FIB_AIBV + 8].copy_from_slice(&self.aibv.to_be_bytes());
        buf[FIB_AISB..FIB_AISB + 8].copy_from_slice(&self.aisb.to_be_bytes());
        buf[FIB_FMB_ADDR..FIB_FMB_ADDR + 8].copy_from_slice(&self.fmb_addr.to_be_bytes());
        buf[FIB_GD..FIB_GD + 4].copy_from_slice(&self.gd.to_be_bytes());
        buf
    }
}
