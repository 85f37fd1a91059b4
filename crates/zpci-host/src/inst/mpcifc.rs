//! Modify PCI function controls.

use zpci_iommu::IoTranslationAnchor;

use super::fib::{Fib, FIB_LEN};
use super::{
    fail_with, privileged, ConditionCode, InstResult, ProgramInterrupt, Vcpu,
    MOD_ST_DMAAS_INVAL, MOD_ST_RES_NOT_AVAIL, MOD_ST_SEQUENCE,
};
use crate::doorbell::RegisterInterruptsError;
use crate::event::{PendingEvent, ERR_MEASUREMENT_PROTECTION};
use crate::fmb::{Measurement, FMB_KEY_MASK};
use crate::function::{DmaWindow, FunctionInner, InterruptConfig, ZpciFunction};
use crate::indicator::{adapter_id, AdapterRoute};
use crate::{lock, HostBridge};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModifyOp {
    RegisterInterrupts = 2,
    DeregisterInterrupts = 3,
    RegisterIoat = 4,
    DeregisterIoat = 5,
    ReregisterIoat = 6,
    ResetError = 7,
    ResetBlock = 9,
    SetMeasurement = 10,
}

impl ModifyOp {
    pub fn from_u8(oc: u8) -> Option<Self> {
        Some(match oc {
            2 => ModifyOp::RegisterInterrupts,
            3 => ModifyOp::DeregisterInterrupts,
            4 => ModifyOp::RegisterIoat,
            5 => ModifyOp::DeregisterIoat,
            6 => ModifyOp::ReregisterIoat,
            7 => ModifyOp::ResetError,
            9 => ModifyOp::ResetBlock,
            10 => ModifyOp::SetMeasurement,
            _ => return None,
        })
    }
}

/// Result of one modify operation short of a program interrupt.
enum Outcome {
    Done,
    Status(u8),
    /// Condition code 1 without a status.
    Refused,
}

impl HostBridge {
    /// MPCIFC: applies the operation in `reg[r1]` using the FIB at `fiba`.
    pub fn mpcifc<C: Vcpu + ?Sized>(&self, cpu: &mut C, r1: u8, fiba: u64, ar: u8) -> InstResult {
        privileged(cpu)?;
        let reg = cpu.reg(r1);
        let oc = (reg & 0xff) as u8;
        let dmaas = ((reg >> 16) & 0xff) as u8;
        let fh = (reg >> 32) as u32;
        if fiba & 7 != 0 {
            return Err(ProgramInterrupt::Specification);
        }

        let Some(function) = self.enabled_function(fh) else {
            return Ok(ConditionCode::InvalidHandle);
        };

        let mut buf = [0u8; FIB_LEN];
        cpu.read_virtual(fiba, ar, &mut buf)?;
        let fib = Fib::decode(&buf);
        if fib.fmt != 0 {
            return Err(ProgramInterrupt::Operand);
        }
        let op = ModifyOp::from_u8(oc).ok_or(ProgramInterrupt::Operand)?;
        tracing::debug!(fid = function.fid, ?op, "mpcifc");

        let outcome = {
            let mut inner = lock(&function.inner);
            self.modify(&function, &mut inner, op, dmaas, &fib)?
        };
        match outcome {
            Outcome::Done => Ok(ConditionCode::Ok),
            Outcome::Status(status) => fail_with(cpu, r1, status),
            Outcome::Refused => Ok(ConditionCode::Error),
        }
    }

    fn modify(
        &self,
        function: &ZpciFunction,
        inner: &mut FunctionInner,
        op: ModifyOp,
        dmaas: u8,
        fib: &Fib,
    ) -> Result<Outcome, ProgramInterrupt> {
        let outcome = match op {
            ModifyOp::RegisterInterrupts => {
                if inner.interrupts.is_some() {
                    return Ok(Outcome::Status(MOD_ST_SEQUENCE));
                }
                let config = InterruptConfig {
                    isc: fib.isc,
                    interrupts: fib.noi,
                    summary: fib.sum,
                    route: AdapterRoute {
                        summary_addr: fib.aisb,
                        summary_offset: u32::from(fib.aisbo),
                        indicator_addr: fib.aibv,
                        indicator_offset: u32::from(fib.aibvo),
                        adapter_id: adapter_id(fib.isc),
                    },
                    forwarded: false,
                };
                match self.register_interrupts(function, inner, config) {
                    Ok(()) => Outcome::Done,
                    Err(RegisterInterruptsError::Indicator(err)) => {
                        tracing::warn!(fid = function.fid, %err, "interrupt registration failed");
                        Outcome::Status(MOD_ST_RES_NOT_AVAIL)
                    }
                    Err(RegisterInterruptsError::Forwarding(err)) => {
                        tracing::warn!(fid = function.fid, %err, "interrupt forwarding refused");
                        Outcome::Status(MOD_ST_SEQUENCE)
                    }
                }
            }
            ModifyOp::DeregisterInterrupts => {
                if inner.interrupts.is_none() {
                    return Ok(Outcome::Status(MOD_ST_SEQUENCE));
                }
                self.deregister_interrupts(function, inner);
                Outcome::Done
            }
            ModifyOp::RegisterIoat | ModifyOp::DeregisterIoat | ModifyOp::ReregisterIoat
                if dmaas != 0 =>
            {
                Outcome::Status(MOD_ST_DMAAS_INVAL)
            }
            ModifyOp::RegisterIoat => {
                if inner.dma.enabled {
                    return Ok(Outcome::Status(MOD_ST_SEQUENCE));
                }
                let (window, anchor) = self.validate_ioat(fib)?;
                self.register_translation(function, inner, window, anchor);
                Outcome::Done
            }
            ModifyOp::DeregisterIoat => {
                if !inner.dma.enabled {
                    return Ok(Outcome::Status(MOD_ST_SEQUENCE));
                }
                self.deregister_translation(function, inner);
                Outcome::Done
            }
            ModifyOp::ReregisterIoat => {
                if !inner.dma.enabled {
                    return Ok(Outcome::Status(MOD_ST_SEQUENCE));
                }
                let (window, anchor) = self.validate_ioat(fib)?;
                self.deregister_translation(function, inner);
                self.register_translation(function, inner, window, anchor);
                Outcome::Done
            }
            ModifyOp::ResetError => {
                if !inner.error_state && !inner.load_store_blocked {
                    return Ok(Outcome::Status(MOD_ST_SEQUENCE));
                }
                inner.error_state = false;
                inner.load_store_blocked = false;
                Outcome::Done
            }
            ModifyOp::ResetBlock => {
                if !inner.load_store_blocked {
                    return Ok(Outcome::Status(MOD_ST_SEQUENCE));
                }
                inner.load_store_blocked = false;
                Outcome::Done
            }
            ModifyOp::SetMeasurement => self.set_measurement(function, inner, fib.fmb_addr),
        };
        Ok(outcome)
    }

    /// Checks a FIB's DMA window and anchor; a bad operand is an operand exception.
    fn validate_ioat(
        &self,
        fib: &Fib,
    ) -> Result<(DmaWindow, IoTranslationAnchor), ProgramInterrupt> {
        let base = fib.pba & !0xfff;
        let limit = fib.pal | 0xfff;
        let bounds = self.config.dma_window;
        if base > limit || base < bounds.start || limit > bounds.end {
            tracing::debug!(
                base = format_args!("{base:#x}"),
                limit = format_args!("{limit:#x}"),
                "dma window outside bounds"
            );
            return Err(ProgramInterrupt::Operand);
        }
        let anchor = IoTranslationAnchor::new(fib.iota);
        if !anchor.is_supported() {
            tracing::debug!(
                iota = format_args!("{:#x}", fib.iota),
                designation = ?anchor.designation(),
                translation = anchor.translation_enabled(),
                "unsupported io translation anchor"
            );
            return Err(ProgramInterrupt::Operand);
        }
        Ok((DmaWindow { base, limit }, anchor))
    }

    fn set_measurement(
        &self,
        function: &ZpciFunction,
        inner: &mut FunctionInner,
        addr: u64,
    ) -> Outcome {
        if addr & FMB_KEY_MASK != 0 {
            inner.measurement = Measurement::default();
            function.counters.clear();
            self.events.push(PendingEvent::error(
                ERR_MEASUREMENT_PROTECTION,
                inner.fh.raw(),
                function.fid,
                addr,
                0,
            ));
            return Outcome::Refused;
        }
        if addr == 0 {
            tracing::debug!(fid = function.fid, "measurement stopped");
            inner.measurement = Measurement::default();
            function.counters.clear();
        } else {
            tracing::debug!(
                fid = function.fid,
                addr = format_args!("{addr:#x}"),
                "measurement started"
            );
            inner.measurement.addr = addr;
        }
        Outcome::Done
    }
}
