//! Refresh PCI translations.
//!
//! The guest issues RPCIT after changing its DMA tables. The bridge re-walks the range and
//! folds the result into the function's shadow, telling the host about every mapping that
//! appeared, changed or went away. New mappings draw on the function's DMA budget when it has
//! one.

use zpci_iommu::{IoTlbEntry, IoTlbUpdate, TranslateFault, PAGE_SIZE};

use super::{
    fail_with, privileged, ConditionCode, InstResult, ProgramInterrupt, Vcpu,
    MOD_ST_ERROR_RECOVER, ST_FUNC_IN_ERR, ST_INSUF_RES,
};
use crate::fmb::Counter;
use crate::function::{FunctionInner, ZpciFunction};
use crate::iommu::UnmapBatch;
use crate::{lock, HostBridge};

/// How one pass over the range ended.
enum Pass {
    Done,
    /// Some mapping could not be made for lack of budget.
    Starved,
    Fault(TranslateFault, u64),
}

impl HostBridge {
    /// RPCIT: refreshes the translations of `[reg[r2], reg[r2] + reg[r2 + 1])` for the function
    /// named in `reg[r1]`.
    pub fn rpcit<C: Vcpu + ?Sized>(&self, cpu: &mut C, r1: u8, r2: u8) -> InstResult {
        privileged(cpu)?;
        if r2 & 1 != 0 {
            return Err(ProgramInterrupt::Specification);
        }
        let fh = (cpu.reg(r1) >> 32) as u32;
        let start = cpu.reg(r2);
        let end = start.saturating_add(cpu.reg(r2 + 1));

        let Some(function) = self.enabled_function(fh) else {
            return Ok(ConditionCode::InvalidHandle);
        };
        let mut inner = lock(&function.inner);
        if inner.error_state {
            drop(inner);
            return fail_with(cpu, r1, MOD_ST_ERROR_RECOVER);
        }

        let precheck = if !inner.dma.enabled {
            Some(TranslateFault::NoTranslation)
        } else if end < inner.dma.window.base || start > inner.dma.window.limit {
            Some(TranslateFault::OutOfRange {
                addr: start,
                base: inner.dma.window.base,
                limit: inner.dma.window.limit,
            })
        } else {
            None
        };
        if let Some(fault) = precheck {
            self.isolate(&function, &mut inner, &fault, start);
            drop(inner);
            return fail_with(cpu, r1, ST_FUNC_IN_ERR);
        }

        tracing::debug!(
            fid = function.fid,
            start = format_args!("{start:#x}"),
            end = format_args!("{end:#x}"),
            "rpcit"
        );
        let mut pass = self.refresh_pass(&function, &mut inner, start, end);
        // A starved pass may have freed budget further up the range; go again while that
        // leaves something to spend.
        while matches!(pass, Pass::Starved)
            && function.dma_limit.as_ref().is_some_and(|limit| limit.available() > 0)
        {
            pass = self.refresh_pass(&function, &mut inner, start, end);
        }

        match pass {
            Pass::Done => {
                drop(inner);
                function.counters.bump(Counter::Refresh);
                Ok(ConditionCode::Ok)
            }
            Pass::Starved => {
                drop(inner);
                function.counters.bump(Counter::Refresh);
                tracing::warn!(fid = function.fid, "DMA mapping budget exhausted");
                fail_with(cpu, r1, ST_INSUF_RES)
            }
            Pass::Fault(fault, addr) => {
                self.isolate(&function, &mut inner, &fault, addr);
                drop(inner);
                fail_with(cpu, r1, ST_FUNC_IN_ERR)
            }
        }
    }

    fn refresh_pass(
        &self,
        function: &ZpciFunction,
        inner: &mut FunctionInner,
        start: u64,
        end: u64,
    ) -> Pass {
        let notifier = function.notifier();
        let mut unmaps = UnmapBatch::new(notifier);
        let mut starved = false;
        let mut addr = start;

        while addr < end {
            let entry = match self.walk_function(&inner.dma, addr) {
                Ok(entry) => entry,
                Err(fault) => return Pass::Fault(fault, addr),
            };
            let stop = entry.iova.saturating_add(entry.len()).min(end);

            if !entry.is_mapped() {
                for old in inner.dma.iotlb.remove_range(addr & !(PAGE_SIZE - 1), stop) {
                    if let Some(limit) = &function.dma_limit {
                        limit.give_back();
                    }
                    unmaps.push(old.iova, old.len());
                }
                addr = stop;
                continue;
            }

            let mut page = addr & !(PAGE_SIZE - 1);
            while page < stop {
                let shadow = IoTlbEntry {
                    iova: page,
                    translated_addr: entry.translate(page),
                    addr_mask: PAGE_SIZE - 1,
                    perm: entry.perm,
                };
                if inner.dma.iotlb.would_allocate(&shadow)
                    && !function.dma_limit.as_ref().map_or(true, |limit| limit.try_take())
                {
                    starved = true;
                    break;
                }
                match inner.dma.iotlb.update(shadow) {
                    IoTlbUpdate::Unchanged | IoTlbUpdate::NotPresent => {}
                    IoTlbUpdate::Mapped { new } => {
                        unmaps.flush();
                        if let Some(n) = notifier {
                            n.map(new.iova, new.translated_addr, new.len(), new.perm);
                        }
                    }
                    IoTlbUpdate::Remapped { old, new } => {
                        unmaps.flush();
                        if let Some(n) = notifier {
                            n.unmap(old.iova, old.len());
                            n.map(new.iova, new.translated_addr, new.len(), new.perm);
                        }
                    }
                    IoTlbUpdate::Unmapped { old } => {
                        if let Some(limit) = &function.dma_limit {
                            limit.give_back();
                        }
                        unmaps.push(old.iova, old.len());
                    }
                }
                page += PAGE_SIZE;
            }
            addr = stop;
        }

        if starved {
            Pass::Starved
        } else {
            Pass::Done
        }
    }
}
