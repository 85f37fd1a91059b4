//! Store PCI function controls.

use super::fib::{Fib, FIB_FC_BLOCKED, FIB_FC_ENABLED, FIB_FC_ERROR, FIB_FC_TRANSLATION};
use super::{
    fail_with, privileged, ConditionCode, InstResult, ProgramInterrupt, Vcpu,
    STPCIFC_ST_INVAL_DMAAS,
};
use crate::function::{FunctionInner, FunctionState};
use crate::handle::FunctionHandle;
use crate::{lock, HostBridge};

/// Set in `reg[r1]` when the caller's handle is stale: the function is enabled but the handle
/// passed in does not say so.
const STALE_HANDLE: u64 = 1 << 63;

fn snapshot(inner: &FunctionInner) -> Fib {
    let mut fib = Fib {
        fc: FIB_FC_ENABLED,
        fmb_addr: inner.measurement.addr,
        ..Fib::default()
    };
    if inner.error_state {
        fib.fc |= FIB_FC_ERROR;
    }
    if inner.load_store_blocked {
        fib.fc |= FIB_FC_BLOCKED;
    }
    if inner.dma.enabled {
        fib.fc |= FIB_FC_TRANSLATION;
        fib.pba = inner.dma.window.base;
        fib.pal = inner.dma.window.limit;
        fib.iota = inner.dma.anchor.raw();
    }
    if let Some(irq) = &inner.interrupts {
        let config = &irq.config;
        fib.isc = config.isc;
        fib.noi = config.interrupts;
        fib.sum = config.summary;
        fib.aibv = config.route.indicator_addr;
        fib.aibvo = config.route.indicator_offset as u8;
        fib.aisb = config.route.summary_addr;
        fib.aisbo = config.route.summary_offset as u8;
    }
    fib
}

impl HostBridge {
    /// STPCIFC: stores the controls of the function named in `reg[r1]` as a FIB at `fiba`.
    pub fn stpcifc<C: Vcpu + ?Sized>(&self, cpu: &mut C, r1: u8, fiba: u64, ar: u8) -> InstResult {
        privileged(cpu)?;
        let reg = cpu.reg(r1);
        let fh = FunctionHandle::new((reg >> 32) as u32);
        let dmaas = (reg >> 16) & 0xff;
        if dmaas != 0 {
            return fail_with(cpu, r1, STPCIFC_ST_INVAL_DMAAS);
        }
        if fiba & 7 != 0 {
            return Err(ProgramInterrupt::Specification);
        }

        // Looked up by slot alone so a guest holding a stale handle can learn the current state.
        let Some(function) = self.find_by_slot(fh.index()) else {
            return Ok(ConditionCode::InvalidHandle);
        };
        let (fib, stale) = {
            let inner = lock(&function.inner);
            match inner.state {
                FunctionState::Reserved | FunctionState::Standby => {
                    return Ok(ConditionCode::InvalidHandle)
                }
                FunctionState::Configured if fh.is_enabled() => {
                    return Ok(ConditionCode::InvalidHandle)
                }
                FunctionState::Configured => (Fib::default(), false),
                FunctionState::Enabled => (snapshot(&inner), !fh.is_enabled()),
            }
        };

        cpu.write_virtual(fiba, ar, &fib.encode())?;
        if stale {
            cpu.set_reg(r1, reg | STALE_HANDLE);
        }
        tracing::trace!(fid = function.fid, fc = format_args!("{:#x}", fib.fc), "stpcifc");
        Ok(ConditionCode::Ok)
    }
}
