//! PCI load, PCI store and PCI store block.

use super::{
    fail_with, privileged, ConditionCode, InstResult, ProgramInterrupt, Vcpu, CONFIG_SPACE_AS,
    ST_BLOCKED, ST_INVAL_AS,
};
use crate::device::{PCI_BAR_COUNT, MSIX_ENTRY_DATA};
use crate::doorbell::{DOORBELL_FID_SHIFT, DOORBELL_VECTOR_MASK};
use crate::fmb::Counter;
use crate::function::ZpciFunction;
use crate::{lock, HostBridge};

/// Extended configuration space size.
const CONFIG_SPACE_LIMIT: u64 = 0x1000;
const STORE_BLOCK_LENGTHS: [u16; 4] = [16, 32, 64, 128];

/// Decoded `reg[r2]`/`reg[r2 + 1]` operand pair of PCILG and PCISTG.
struct Access {
    fh: u32,
    pcias: u8,
    len: u8,
    offset: u64,
}

impl Access {
    fn decode<C: Vcpu + ?Sized>(cpu: &C, r2: u8) -> Result<Self, ProgramInterrupt> {
        if r2 & 1 != 0 {
            return Err(ProgramInterrupt::Specification);
        }
        let reg = cpu.reg(r2);
        Ok(Self {
            fh: (reg >> 32) as u32,
            pcias: ((reg >> 16) & 0xf) as u8,
            len: (reg & 0xf) as u8,
            offset: cpu.reg(r2 + 1),
        })
    }

    /// BAR accesses may not cross a doubleword.
    fn bar_len_ok(&self) -> bool {
        self.len != 0 && u64::from(self.len) <= 8 - (self.offset & 7)
    }

    /// Config accesses are 1, 2 or 4 bytes within one word.
    fn config_len_ok(&self) -> bool {
        matches!(self.len, 1 | 2 | 4)
            && u64::from(self.len) <= 4 - (self.offset & 3)
            && self
                .offset
                .checked_add(u64::from(self.len))
                .is_some_and(|end| end <= CONFIG_SPACE_LIMIT)
    }
}

/// Swaps between the big-endian register image and little-endian config space.
fn config_swap(value: u64, len: u8) -> u32 {
    match len {
        2 => u32::from((value as u16).swap_bytes()),
        4 => (value as u32).swap_bytes(),
        _ => value as u32 & 0xff,
    }
}

fn is_bar(pcias: u8) -> bool {
    pcias < PCI_BAR_COUNT
}

impl HostBridge {
    fn blocked(&self, function: &ZpciFunction) -> bool {
        lock(&function.inner).load_store_blocked
    }

    /// PCILG: loads from a BAR or config space of the function named in `reg[r2]` into
    /// `reg[r1]`.
    pub fn pcilg<C: Vcpu + ?Sized>(&self, cpu: &mut C, r1: u8, r2: u8) -> InstResult {
        privileged(cpu)?;
        let access = Access::decode(cpu, r2)?;
        let Some(function) = self.enabled_function(access.fh) else {
            return Ok(ConditionCode::InvalidHandle);
        };
        if self.blocked(&function) {
            return fail_with(cpu, r2, ST_BLOCKED);
        }

        let data = if is_bar(access.pcias) {
            if !access.bar_len_ok() {
                return Err(ProgramInterrupt::Operand);
            }
            function
                .with_device(|dev| dev.bar_read(access.pcias, access.offset, access.len))
                .map_err(|err| {
                    tracing::debug!(fid = function.fid, %err, "pcilg bar read failed");
                    ProgramInterrupt::Operand
                })?
        } else if access.pcias == CONFIG_SPACE_AS {
            if !access.config_len_ok() {
                return Err(ProgramInterrupt::Operand);
            }
            let raw =
                function.with_device(|dev| dev.config_read(access.offset as u16, access.len));
            u64::from(config_swap(u64::from(raw), access.len))
        } else {
            tracing::debug!(
                fid = function.fid,
                pcias = access.pcias,
                "pcilg invalid address space"
            );
            return fail_with(cpu, r2, ST_INVAL_AS);
        };

        tracing::trace!(
            fid = function.fid,
            pcias = access.pcias,
            offset = format_args!("{:#x}", access.offset),
            len = access.len,
            data = format_args!("{data:#x}"),
            "pcilg"
        );
        function.counters.bump(Counter::Load);
        cpu.set_reg(r1, data);
        Ok(ConditionCode::Ok)
    }

    /// PCISTG: stores `reg[r1]` to a BAR or config space of the function named in `reg[r2]`.
    pub fn pcistg<C: Vcpu + ?Sized>(&self, cpu: &mut C, r1: u8, r2: u8) -> InstResult {
        privileged(cpu)?;
        let access = Access::decode(cpu, r2)?;
        let mut data = cpu.reg(r1);
        let Some(function) = self.enabled_function(access.fh) else {
            return Ok(ConditionCode::InvalidHandle);
        };
        if self.blocked(&function) {
            return fail_with(cpu, r2, ST_BLOCKED);
        }

        if is_bar(access.pcias) {
            if !access.bar_len_ok() {
                return Err(ProgramInterrupt::Operand);
            }
            if access.len == 4
                && function
                    .msix
                    .is_some_and(|msix| msix.is_message_data(access.pcias, access.offset))
            {
                // Tag the message with the function id so doorbell writes can be attributed.
                data = (u64::from(function.fid) << DOORBELL_FID_SHIFT)
                    | (data & DOORBELL_VECTOR_MASK);
                tracing::trace!(
                    fid = function.fid,
                    offset = format_args!("{:#x}", access.offset - MSIX_ENTRY_DATA),
                    data = format_args!("{data:#x}"),
                    "msi-x message data rewritten"
                );
            }
            function
                .with_device(|dev| dev.bar_write(access.pcias, access.offset, access.len, data))
                .map_err(|err| {
                    tracing::debug!(fid = function.fid, %err, "pcistg bar write failed");
                    ProgramInterrupt::Operand
                })?;
        } else if access.pcias == CONFIG_SPACE_AS {
            if !access.config_len_ok() {
                return Err(ProgramInterrupt::Operand);
            }
            let value = config_swap(data, access.len);
            function.with_device(|dev| dev.config_write(access.offset as u16, access.len, value));
        } else {
            tracing::debug!(
                fid = function.fid,
                pcias = access.pcias,
                "pcistg invalid address space"
            );
            return fail_with(cpu, r2, ST_INVAL_AS);
        }

        tracing::trace!(
            fid = function.fid,
            pcias = access.pcias,
            offset = format_args!("{:#x}", access.offset),
            len = access.len,
            data = format_args!("{data:#x}"),
            "pcistg"
        );
        function.counters.bump(Counter::Store);
        Ok(ConditionCode::Ok)
    }

    /// PCISTB: copies a block from guest memory at `gaddr` into a BAR, a doubleword at a time.
    pub fn pcistb<C: Vcpu + ?Sized>(
        &self,
        cpu: &mut C,
        r1: u8,
        r3: u8,
        gaddr: u64,
        ar: u8,
    ) -> InstResult {
        privileged(cpu)?;
        let reg = cpu.reg(r1);
        let fh = (reg >> 32) as u32;
        let pcias = ((reg >> 16) & 0xf) as u8;
        let len = (reg & 0x1fff) as u16;
        let offset = cpu.reg(r3);

        let Some(function) = self.enabled_function(fh) else {
            return Ok(ConditionCode::InvalidHandle);
        };
        if self.blocked(&function) {
            return fail_with(cpu, r1, ST_BLOCKED);
        }
        if !is_bar(pcias) {
            return fail_with(cpu, r1, ST_INVAL_AS);
        }

        let max_store_block = self
            .config
            .group(function.group)
            .map_or(128, |group| group.max_store_block);
        if offset % 8 != 0
            || !STORE_BLOCK_LENGTHS.contains(&len)
            || len > max_store_block
            || (offset & 0xfff) + u64::from(len) > 0x1000
            || gaddr & 7 != 0
        {
            return Err(ProgramInterrupt::Specification);
        }

        let bar_size = function.with_device(|dev| dev.bar_size(pcias));
        if offset.checked_add(u64::from(len)).map_or(true, |end| end > bar_size) {
            return Err(ProgramInterrupt::Operand);
        }

        let mut block = [0u8; 128];
        let block = &mut block[..usize::from(len)];
        cpu.read_virtual(gaddr, ar, block)?;

        function
            .with_device(|dev| {
                block.chunks_exact(8).zip((offset..).step_by(8)).try_for_each(|(chunk, at)| {
                    let mut word = [0u8; 8];
                    word.copy_from_slice(chunk);
                    dev.bar_write(pcias, at, 8, u64::from_be_bytes(word))
                })
            })
            .map_err(|err| {
                tracing::debug!(fid = function.fid, %err, "pcistb bar write failed");
                ProgramInterrupt::Operand
            })?;

        tracing::trace!(
            fid = function.fid,
            pcias,
            offset = format_args!("{offset:#x}"),
            len,
            "pcistb"
        );
        function.counters.bump(Counter::StoreBlock);
        Ok(ConditionCode::Ok)
    }
}
