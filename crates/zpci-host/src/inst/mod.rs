//! The zPCI instructions.
//!
//! Each handler runs to completion on the calling vCPU's thread. Architectural program
//! exceptions come back as `Err(ProgramInterrupt)` and leave the registers untouched; every
//! other outcome is a condition code, with a status code stored into bits 24..31 of the
//! instruction's function register where the architecture calls for one.

mod clp;
mod fib;
mod load_store;
mod mpcifc;
mod rpcit;
mod stpcifc;

use std::sync::Arc;

use thiserror::Error;

pub use clp::{
    ClpCommand, CLP_BLK_SIZE, CLP_LIST_ENTRY_SIZE, CLP_LIST_HDR_LEN, CLP_RC_8K, CLP_RC_ALRDY,
    CLP_RC_CMD, CLP_RC_FMT, CLP_RC_LEN, CLP_RC_LISTPCI_BADRT, CLP_RC_OK,
    CLP_RC_QUERYPCIFG_PFGID, CLP_RC_RESNOT0, CLP_RC_SETPCIFN_DMAAS, CLP_RC_SETPCIFN_FH,
    CLP_RC_SETPCIFN_FHOP, CLP_RC_SETPCIFN_RES, CLP_REQ_LEN,
};
pub use fib::{Fib, FIB_FC_BLOCKED, FIB_FC_ENABLED, FIB_FC_ERROR, FIB_FC_TRANSLATION, FIB_LEN};
pub use mpcifc::ModifyOp;

use crate::function::ZpciFunction;
use crate::handle::FunctionHandle;
use crate::HostBridge;

/// Architected program interruptions the handlers can raise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ProgramInterrupt {
    #[error("privileged-operation exception")]
    Privileged,
    #[error("protection exception")]
    Protection,
    #[error("addressing exception")]
    Addressing,
    #[error("specification exception")]
    Specification,
    #[error("operand exception")]
    Operand,
}

impl ProgramInterrupt {
    pub const fn code(self) -> u16 {
        match self {
            ProgramInterrupt::Privileged => 0x02,
            ProgramInterrupt::Protection => 0x04,
            ProgramInterrupt::Addressing => 0x05,
            ProgramInterrupt::Specification => 0x06,
            ProgramInterrupt::Operand => 0x15,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConditionCode {
    Ok = 0,
    Error = 1,
    Busy = 2,
    InvalidHandle = 3,
}

/// The calling virtual processor, as seen by an instruction handler.
pub trait Vcpu {
    /// True when running in problem (unprivileged) state.
    fn problem_state(&self) -> bool;

    fn reg(&self, r: u8) -> u64;

    fn set_reg(&mut self, r: u8, value: u64);

    /// Reads guest virtual memory through access register `ar`. The error is the exception
    /// the access raised.
    fn read_virtual(&mut self, addr: u64, ar: u8, buf: &mut [u8]) -> Result<(), ProgramInterrupt>;

    fn write_virtual(&mut self, addr: u64, ar: u8, buf: &[u8]) -> Result<(), ProgramInterrupt>;
}

pub type InstResult = Result<ConditionCode, ProgramInterrupt>;

// Load/store/refresh status codes.
pub const ST_NOT_ENABLED: u8 = 4;
pub const ST_FUNC_IN_ERR: u8 = 8;
pub const ST_BLOCKED: u8 = 12;
pub const ST_INSUF_RES: u8 = 16;
pub const ST_INVAL_AS: u8 = 20;

// Modify-function-controls status codes.
pub const MOD_ST_RES_NOT_AVAIL: u8 = 4;
pub const MOD_ST_INSUF_RES: u8 = 16;
pub const MOD_ST_SEQUENCE: u8 = 24;
pub const MOD_ST_DMAAS_INVAL: u8 = 28;
pub const MOD_ST_ERROR_RECOVER: u8 = 40;

pub const STPCIFC_ST_INVAL_DMAAS: u8 = 28;

/// Address-space selector naming configuration space.
pub const CONFIG_SPACE_AS: u8 = 15;

/// Stores `status` into bits 24..31 of register `r`.
pub fn set_status<C: Vcpu + ?Sized>(cpu: &mut C, r: u8, status: u8) {
    let value = (cpu.reg(r) & !0xff00_0000) | (u64::from(status) << 24);
    cpu.set_reg(r, value);
}

fn fail_with<C: Vcpu + ?Sized>(cpu: &mut C, r: u8, status: u8) -> InstResult {
    set_status(cpu, r, status);
    Ok(ConditionCode::Error)
}

fn privileged<C: Vcpu + ?Sized>(cpu: &C) -> Result<(), ProgramInterrupt> {
    if cpu.problem_state() {
        return Err(ProgramInterrupt::Privileged);
    }
    Ok(())
}

impl HostBridge {
    /// Looks up a function for a load/store style access: the handle must carry the enabled
    /// bit and match exactly.
    fn enabled_function(&self, fh: u32) -> Option<Arc<ZpciFunction>> {
        if !FunctionHandle::new(fh).is_enabled() {
            return None;
        }
        self.find_by_handle(fh)
    }
}
