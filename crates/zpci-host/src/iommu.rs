//! Per-function DMA address space: the doorbell window, the translation window and the
//! refresh shadow.

use zpci_iommu::{walk, IoTlbEntry, IoTranslationAnchor, Permission, TranslateFault};

use crate::config::MSI_WINDOW_SIZE;
use crate::error::DmaError;
use crate::event::PendingEvent;
use crate::function::{DmaSpace, DmaWindow, FunctionInner, ZpciFunction};
use crate::host::DmaMapNotifier;
use crate::{lock, HostBridge};

/// Where a device DMA address lands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaTarget {
    /// Inside the MSI doorbell window, at `offset` from its start.
    Doorbell { offset: u64 },
    /// Guest memory through a table translation; may carry [`Permission::NONE`].
    Memory(IoTlbEntry),
}

/// Value a device reads from the doorbell window.
const DOORBELL_READ_VALUE: u8 = 0xff;

impl HostBridge {
    fn doorbell_offset(&self, addr: u64) -> Option<u64> {
        addr.checked_sub(self.config.msi_address)
            .filter(|&offset| offset < MSI_WINDOW_SIZE)
    }

    /// Walks the function's tables for `addr` without touching its error state.
    pub(crate) fn walk_function(
        &self,
        dma: &DmaSpace,
        addr: u64,
    ) -> Result<IoTlbEntry, TranslateFault> {
        if !dma.enabled {
            return Err(TranslateFault::NoTranslation);
        }
        if !dma.window.contains(addr) {
            return Err(TranslateFault::OutOfRange {
                addr,
                base: dma.window.base,
                limit: dma.window.limit,
            });
        }
        walk(&*self.mem, dma.anchor, addr)
    }

    /// Marks the function as failed and reports `fault` to the guest.
    pub(crate) fn isolate(
        &self,
        function: &ZpciFunction,
        inner: &mut FunctionInner,
        fault: &TranslateFault,
        addr: u64,
    ) {
        tracing::debug!(
            fid = function.fid,
            addr = format_args!("{addr:#x}"),
            %fault,
            "isolating zpci function"
        );
        inner.error_state = true;
        inner.load_store_blocked = true;
        self.events.push(PendingEvent::error(
            fault.event_code(),
            inner.fh.raw(),
            function.fid,
            addr,
            0,
        ));
    }

    /// Resolves a device DMA address. A fault isolates the function.
    pub fn translate(&self, function: &ZpciFunction, addr: u64) -> Result<DmaTarget, DmaError> {
        let mut inner = lock(&function.inner);
        if inner.error_state {
            return Err(DmaError::FunctionInError);
        }
        if let Some(offset) = self.doorbell_offset(addr) {
            return Ok(DmaTarget::Doorbell { offset });
        }
        match self.walk_function(&inner.dma, addr) {
            Ok(entry) => Ok(DmaTarget::Memory(entry)),
            Err(fault) => {
                self.isolate(function, &mut inner, &fault, addr);
                Err(fault.into())
            }
        }
    }

    /// Like [`HostBridge::translate`] for a memory target, but also checks that the translation
    /// grants `access`.
    fn translate_for(
        &self,
        function: &ZpciFunction,
        addr: u64,
        access: Permission,
    ) -> Result<DmaTarget, DmaError> {
        let target = self.translate(function, addr)?;
        if let DmaTarget::Memory(entry) = target {
            if !entry.perm.contains(access) {
                let fault = TranslateFault::Protection { addr };
                let mut inner = lock(&function.inner);
                self.isolate(function, &mut inner, &fault, addr);
                return Err(fault.into());
            }
        }
        Ok(target)
    }

    /// Device read of `buf.len()` bytes at DMA address `addr` on behalf of function `fid`.
    pub fn dma_read(&self, fid: u32, addr: u64, buf: &mut [u8]) -> Result<(), DmaError> {
        let function = self
            .find_by_fid(fid)
            .ok_or(DmaError::NoSuchFunction { fid })?;
        let mut done = 0usize;
        while done < buf.len() {
            let cur = addr.wrapping_add(done as u64);
            let chunk = match self.translate_for(&function, cur, Permission::READ)? {
                DmaTarget::Doorbell { offset } => {
                    let n = chunk_len(buf.len() - done, MSI_WINDOW_SIZE - offset);
                    buf[done..done + n].fill(DOORBELL_READ_VALUE);
                    n
                }
                DmaTarget::Memory(entry) => {
                    let n = chunk_len(buf.len() - done, entry.iova + entry.len() - cur);
                    self.mem
                        .read_into(entry.translate(cur), &mut buf[done..done + n])?;
                    n
                }
            };
            done += chunk;
        }
        Ok(())
    }

    /// Device write of `data` at DMA address `addr` on behalf of function `fid`.
    ///
    /// Writes into the doorbell window are MSI messages and are delivered as adapter
    /// interrupts.
    pub fn dma_write(&self, fid: u32, addr: u64, data: &[u8]) -> Result<(), DmaError> {
        let function = self
            .find_by_fid(fid)
            .ok_or(DmaError::NoSuchFunction { fid })?;
        let mut done = 0usize;
        while done < data.len() {
            let cur = addr.wrapping_add(done as u64);
            let chunk = match self.translate_for(&function, cur, Permission::WRITE)? {
                DmaTarget::Doorbell { offset } => {
                    let n = chunk_len(data.len() - done, MSI_WINDOW_SIZE - offset);
                    let payload = data[done..done + n]
                        .iter()
                        .take(8)
                        .enumerate()
                        .fold(0u64, |acc, (i, b)| acc | (u64::from(*b) << (8 * i)));
                    self.doorbell_write(payload);
                    n
                }
                DmaTarget::Memory(entry) => {
                    let n = chunk_len(data.len() - done, entry.iova + entry.len() - cur);
                    self.mem
                        .write_from(entry.translate(cur), &data[done..done + n])?;
                    n
                }
            };
            done += chunk;
        }
        Ok(())
    }

    /// Installs a translation for `function`. The caller has validated window and anchor.
    pub(crate) fn register_translation(
        &self,
        function: &ZpciFunction,
        inner: &mut FunctionInner,
        window: DmaWindow,
        anchor: IoTranslationAnchor,
    ) {
        tracing::debug!(
            fid = function.fid,
            base = format_args!("{:#x}", window.base),
            limit = format_args!("{:#x}", window.limit),
            iota = format_args!("{:#x}", anchor.raw()),
            "register io translation"
        );
        inner.dma.window = window;
        inner.dma.anchor = anchor;
        inner.dma.enabled = true;
    }

    /// Removes the translation, dropping every shadowed mapping and returning its budget.
    pub(crate) fn deregister_translation(
        &self,
        function: &ZpciFunction,
        inner: &mut FunctionInner,
    ) {
        tracing::debug!(fid = function.fid, "deregister io translation");
        let dropped = inner.dma.iotlb.drain();
        if let Some(limit) = &function.dma_limit {
            for _ in &dropped {
                limit.give_back();
            }
        }
        let mut batch = UnmapBatch::new(function.notifier());
        for entry in &dropped {
            batch.push(entry.iova, entry.len());
        }
        batch.flush();
        inner.dma = DmaSpace::default();
    }
}

fn chunk_len(remaining: usize, in_range: u64) -> usize {
    usize::try_from(in_range).map_or(remaining, |n| n.min(remaining))
}

/// Accumulates unmapped IOVA ranges and reports contiguous runs as single notifications.
pub(crate) struct UnmapBatch<'a> {
    notifier: Option<&'a dyn DmaMapNotifier>,
    run: Option<(u64, u64)>,
}

impl<'a> UnmapBatch<'a> {
    pub fn new(notifier: Option<&'a dyn DmaMapNotifier>) -> Self {
        Self { notifier, run: None }
    }

    pub fn push(&mut self, iova: u64, len: u64) {
        match &mut self.run {
            Some((start, run_len)) if *start + *run_len == iova => *run_len += len,
            _ => {
                self.flush();
                self.run = Some((iova, len));
            }
        }
    }

    pub fn flush(&mut self) {
        if let (Some((iova, len)), Some(notifier)) = (self.run.take(), self.notifier) {
            notifier.unmap(iova, len);
        }
    }
}

impl Drop for UnmapBatch<'_> {
    fn drop(&mut self) {
        self.flush();
    }
}
