//! Guest physical memory as seen by the zPCI host bridge.
//!
//! Every structure the bridge exchanges with the guest (translation tables, indicator bit
//! vectors, measurement blocks) lives in big-endian guest memory, so [`GuestMemory`] exposes
//! big-endian accessors by default. Interrupt indicators are shared with the guest and with
//! other vCPU threads, which is why the trait also carries a byte-granular atomic
//! compare-exchange: [`GuestMemory::fetch_or_u8`] is built on top of it and never loses a
//! concurrent bit set.

#![forbid(unsafe_code)]

mod ram;

use std::sync::Arc;

use thiserror::Error;

pub use ram::GuestRam;

/// Errors returned by [`GuestMemory`] backends.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuestMemoryError {
    /// The requested address range is outside the guest physical memory size.
    #[error("guest memory access out of range: paddr={paddr:#x} len={len} size={size:#x}")]
    OutOfRange { paddr: u64, len: usize, size: u64 },
    /// The requested size cannot be represented by the current platform's `usize`.
    #[error("guest memory size {size} does not fit in usize")]
    SizeTooLarge { size: u64 },
}

pub type GuestMemoryResult<T> = Result<T, GuestMemoryError>;

/// Validates `[paddr, paddr + len)` against a memory of `size` bytes and returns the starting
/// offset as a `usize`.
pub fn check_range(paddr: u64, len: usize, size: u64) -> GuestMemoryResult<usize> {
    let out_of_range = GuestMemoryError::OutOfRange { paddr, len, size };
    let end = paddr.checked_add(len as u64).ok_or(out_of_range.clone())?;
    if end > size {
        return Err(out_of_range);
    }
    usize::try_from(paddr).map_err(|_| out_of_range)
}

/// Guest *physical* memory storage shared between vCPU threads and device models.
///
/// Writes take `&self`: backends are expected to provide interior mutability because indicator
/// updates race with the guest and with other emulated functions.
pub trait GuestMemory: Send + Sync {
    fn size(&self) -> u64;

    /// Reads bytes from guest physical memory into `dst`.
    fn read_into(&self, paddr: u64, dst: &mut [u8]) -> GuestMemoryResult<()>;

    /// Writes bytes from `src` into guest physical memory.
    fn write_from(&self, paddr: u64, src: &[u8]) -> GuestMemoryResult<()>;

    /// Atomically stores `new` at `paddr` if the byte still holds `current`.
    ///
    /// The outer result reports addressing errors; the inner one mirrors
    /// [`std::sync::atomic::AtomicU8::compare_exchange`]: `Ok(previous)` on success,
    /// `Err(actual)` when another writer got there first.
    fn compare_exchange_u8(&self, paddr: u64, current: u8, new: u8)
        -> GuestMemoryResult<Result<u8, u8>>;

    /// Atomically ORs `bits` into the byte at `paddr`, returning the previous value.
    fn fetch_or_u8(&self, paddr: u64, bits: u8) -> GuestMemoryResult<u8> {
        let mut current = self.read_u8(paddr)?;
        loop {
            match self.compare_exchange_u8(paddr, current, current | bits)? {
                Ok(previous) => return Ok(previous),
                Err(actual) => current = actual,
            }
        }
    }

    fn read_u8(&self, paddr: u64) -> GuestMemoryResult<u8> {
        let mut buf = [0u8; 1];
        self.read_into(paddr, &mut buf)?;
        Ok(buf[0])
    }

    fn read_u16_be(&self, paddr: u64) -> GuestMemoryResult<u16> {
        let mut buf = [0u8; 2];
        self.read_into(paddr, &mut buf)?;
        Ok(u16::from_be_bytes(buf))
    }

    fn read_u32_be(&self, paddr: u64) -> GuestMemoryResult<u32> {
        let mut buf = [0u8; 4];
        self.read_into(paddr, &mut buf)?;
        Ok(u32::from_be_bytes(buf))
    }

    fn read_u64_be(&self, paddr: u64) -> GuestMemoryResult<u64> {
        let mut buf = [0u8; 8];
        self.read_into(paddr, &mut buf)?;
        Ok(u64::from_be_bytes(buf))
    }

    fn write_u8(&self, paddr: u64, value: u8) -> GuestMemoryResult<()> {
        self.write_from(paddr, &[value])
    }

    fn write_u16_be(&self, paddr: u64, value: u16) -> GuestMemoryResult<()> {
        self.write_from(paddr, &value.to_be_bytes())
    }

    fn write_u32_be(&self, paddr: u64, value: u32) -> GuestMemoryResult<()> {
        self.write_from(paddr, &value.to_be_bytes())
    }

    fn write_u64_be(&self, paddr: u64, value: u64) -> GuestMemoryResult<()> {
        self.write_from(paddr, &value.to_be_bytes())
    }
}

impl<T: GuestMemory + ?Sized> GuestMemory for Arc<T> {
    fn size(&self) -> u64 {
        (**self).size()
    }

    fn read_into(&self, paddr: u64, dst: &mut [u8]) -> GuestMemoryResult<()> {
        (**self).read_into(paddr, dst)
    }

    fn write_from(&self, paddr: u64, src: &[u8]) -> GuestMemoryResult<()> {
        (**self).write_from(paddr, src)
    }

    fn compare_exchange_u8(
        &self,
        paddr: u64,
        current: u8,
        new: u8,
    ) -> GuestMemoryResult<Result<u8, u8>> {
        (**self).compare_exchange_u8(paddr, current, new)
    }
}
