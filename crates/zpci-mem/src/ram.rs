use std::sync::atomic::{AtomicU8, Ordering};

use crate::{check_range, GuestMemory, GuestMemoryError, GuestMemoryResult};

/// Dense guest RAM backed by one atomic cell per byte.
///
/// Plain reads and writes use relaxed per-byte accesses; only
/// [`GuestMemory::compare_exchange_u8`] provides ordering guarantees. That matches how the
/// indicator protocol uses memory: the guest clears bits with its own interlocked
/// instructions and the bridge only ever sets them.
pub struct GuestRam {
    cells: Box<[AtomicU8]>,
}

impl GuestRam {
    pub fn new(size: u64) -> GuestMemoryResult<Self> {
        let len = usize::try_from(size).map_err(|_| GuestMemoryError::SizeTooLarge { size })?;
        let cells = (0..len).map(|_| AtomicU8::new(0)).collect();
        Ok(Self { cells })
    }

    fn span(&self, paddr: u64, len: usize) -> GuestMemoryResult<&[AtomicU8]> {
        let start = check_range(paddr, len, self.size())?;
        Ok(&self.cells[start..start + len])
    }
}

impl std::fmt::Debug for GuestRam {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestRam")
            .field("size", &self.cells.len())
            .finish()
    }
}

impl GuestMemory for GuestRam {
    fn size(&self) -> u64 {
        self.cells.len() as u64
    }

    fn read_into(&self, paddr: u64, dst: &mut [u8]) -> GuestMemoryResult<()> {
        let span = self.span(paddr, dst.len())?;
        for (out, cell) in dst.iter_mut().zip(span) {
            *out = cell.load(Ordering::Relaxed);
        }
        Ok(())
    }

    fn write_from(&self, paddr: u64, src: &[u8]) -> GuestMemoryResult<()> {
        let span = self.span(paddr, src.len())?;
        for (value, cell) in src.iter().zip(span) {
            cell.store(*value, Ordering::Relaxed);
        }
        Ok(())
    }

    fn compare_exchange_u8(
        &self,
        paddr: u64,
        current: u8,
        new: u8,
    ) -> GuestMemoryResult<Result<u8, u8>> {
        let span = self.span(paddr, 1)?;
        Ok(span[0].compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire))
    }
}
