//! Call logical processor: the administrative request/response interface used to list,
//! query and enable functions.

use std::sync::Arc;

use super::{privileged, ConditionCode, InstResult, ProgramInterrupt, Vcpu};
use crate::device::{PCI_BAR_COUNT, PCI_BASE_ADDRESS_0};
use crate::fmb::FMB_LEN;
use crate::function::{FunctionState, ZpciFunction};
use crate::handle::FunctionHandle;
use crate::registry::SetFunctionOutcome;
use crate::HostBridge;

/// Largest combined request + response block.
pub const CLP_BLK_SIZE: usize = 8192;
/// Every supported request is exactly this long.
pub const CLP_REQ_LEN: u16 = 32;
pub const CLP_LIST_HDR_LEN: u16 = 32;
pub const CLP_LIST_ENTRY_SIZE: u16 = 16;

const CLP_HDR_LEN: usize = 16;

pub const CLP_RC_OK: u16 = 0x0010;
pub const CLP_RC_CMD: u16 = 0x0020;
pub const CLP_RC_FMT: u16 = 0x0040;
pub const CLP_RC_LEN: u16 = 0x0050;
pub const CLP_RC_8K: u16 = 0x0060;
pub const CLP_RC_RESNOT0: u16 = 0x0070;
pub const CLP_RC_SETPCIFN_FH: u16 = 0x0101;
pub const CLP_RC_SETPCIFN_FHOP: u16 = 0x0102;
pub const CLP_RC_SETPCIFN_DMAAS: u16 = 0x0103;
pub const CLP_RC_SETPCIFN_RES: u16 = 0x0104;
pub const CLP_RC_ALRDY: u16 = 0x0105;
pub const CLP_RC_LISTPCI_BADRT: u16 = 0x010a;
pub const CLP_RC_QUERYPCIFG_PFGID: u16 = 0x010b;

const CLP_MASK_FMT: u32 = 0xf000_0000;
const LIST_MIN_RSP_LEN: u16 = 48;
const QUERY_RSP_LEN: u16 = 192;
const QUERY_GROUP_RSP_LEN: u16 = 48;
const SET_RSP_LEN: u16 = 24;
const LIST_FLAG_UID_CHECKING: u8 = 0x01;
const LIST_CONFIGURED: u32 = 1 << 31;

const SET_ENABLE: u8 = 0;
const SET_DISABLE: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClpCommand {
    ListPci = 2,
    QueryPci = 3,
    QueryPciGroup = 4,
    SetPci = 5,
}

impl ClpCommand {
    pub fn from_u16(cmd: u16) -> Option<Self> {
        Some(match cmd {
            2 => ClpCommand::ListPci,
            3 => ClpCommand::QueryPci,
            4 => ClpCommand::QueryPciGroup,
            5 => ClpCommand::SetPci,
            _ => return None,
        })
    }

    /// Response block length the command needs to report success; the list command sizes
    /// its own response.
    pub fn fixed_response_len(self) -> Option<u16> {
        match self {
            ClpCommand::ListPci => None,
            ClpCommand::QueryPci => Some(QUERY_RSP_LEN),
            ClpCommand::QueryPciGroup => Some(QUERY_GROUP_RSP_LEN),
            ClpCommand::SetPci => Some(SET_RSP_LEN),
        }
    }
}

/// Big-endian field access on a slice of the CLP block.
struct Block<'a>(&'a mut [u8]);

impl Block<'_> {
    fn u8(&self, at: usize) -> u8 {
        self.0[at]
    }

    fn u16(&self, at: usize) -> u16 {
        u16::from_be_bytes([self.0[at], self.0[at + 1]])
    }

    fn u32(&self, at: usize) -> u32 {
        let mut b = [0u8; 4];
        b.copy_from_slice(&self.0[at..at + 4]);
        u32::from_be_bytes(b)
    }

    fn u64(&self, at: usize) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.0[at..at + 8]);
        u64::from_be_bytes(b)
    }

    fn set_u8(&mut self, at: usize, v: u8) {
        self.0[at] = v;
    }

    fn set_u16(&mut self, at: usize, v: u16) {
        self.0[at..at + 2].copy_from_slice(&v.to_be_bytes());
    }

    fn set_u32(&mut self, at: usize, v: u32) {
        self.0[at..at + 4].copy_from_slice(&v.to_be_bytes());
    }

    fn set_u64(&mut self, at: usize, v: u64) {
        self.0[at..at + 8].copy_from_slice(&v.to_be_bytes());
    }

    fn set_rsp(&mut self, code: u16) {
        self.set_u16(2, code);
    }
}

impl HostBridge {
    /// CLP: executes the request block addressed by `reg[r2]` and stores the response behind
    /// it.
    pub fn clp<C: Vcpu + ?Sized>(&self, cpu: &mut C, r2: u8) -> InstResult {
        privileged(cpu)?;
        let addr = cpu.reg(r2);

        let mut buf = vec![0u8; CLP_BLK_SIZE];
        cpu.read_virtual(addr, r2, &mut buf[..CLP_HDR_LEN])?;
        let req_len = usize::from(u16::from_be_bytes([buf[0], buf[1]]));
        if !(16..=8184).contains(&req_len) || req_len % 8 != 0 {
            return Err(ProgramInterrupt::Operand);
        }

        // Request plus the response length word.
        cpu.read_virtual(addr, r2, &mut buf[..req_len + 8])?;
        let rsp_len = usize::from(u16::from_be_bytes([buf[req_len], buf[req_len + 1]]));
        if !(8..=8176).contains(&rsp_len) || rsp_len % 8 != 0 || req_len + rsp_len > CLP_BLK_SIZE
        {
            return Err(ProgramInterrupt::Operand);
        }
        cpu.read_virtual(addr, r2, &mut buf[..req_len + rsp_len])?;

        let (req, rsp) = buf.split_at_mut(req_len);
        let req = Block(req);
        let mut rsp = Block(rsp);
        let cmd = req.u16(2);
        let cc = if req_len != usize::from(CLP_REQ_LEN) {
            rsp.set_rsp(CLP_RC_LEN);
            ConditionCode::Ok
        } else {
            match ClpCommand::from_u16(cmd) {
                Some(command)
                    if command
                        .fixed_response_len()
                        .is_some_and(|min| rsp_len < usize::from(min)) =>
                {
                    tracing::debug!(cmd, rsp_len, "clp response block too short");
                    rsp.set_rsp(CLP_RC_8K);
                    ConditionCode::Ok
                }
                Some(ClpCommand::ListPci) => self.clp_list(&req, &mut rsp),
                Some(ClpCommand::SetPci) => {
                    self.clp_set(&req, &mut rsp);
                    ConditionCode::Ok
                }
                Some(ClpCommand::QueryPci) => {
                    self.clp_query(&req, &mut rsp);
                    ConditionCode::Ok
                }
                Some(ClpCommand::QueryPciGroup) => {
                    self.clp_query_group(&req, &mut rsp);
                    ConditionCode::Ok
                }
                None => {
                    tracing::debug!(cmd, "unknown clp command");
                    rsp.set_rsp(CLP_RC_CMD);
                    ConditionCode::Ok
                }
            }
        };
        tracing::trace!(cmd, rsp = format_args!("{:#x}", rsp.u16(2)), "clp");

        cpu.write_virtual(addr, r2, &buf[..req_len + rsp_len])?;
        Ok(cc)
    }

    /// Handle lookup for set/query, ignoring whether the caller's copy has the enabled bit.
    fn clp_function(&self, fh: u32) -> Option<Arc<ZpciFunction>> {
        let wanted = FunctionHandle::new(fh).with_enabled(false);
        self.find_by_slot(wanted.index())
            .filter(|f| f.handle().with_enabled(false) == wanted)
    }

    fn clp_list(&self, req: &Block<'_>, rsp: &mut Block<'_>) -> ConditionCode {
        let fmt = req.u32(4);
        if fmt & CLP_MASK_FMT != 0 {
            rsp.set_rsp(CLP_RC_FMT);
            return ConditionCode::Ok;
        }
        if fmt & !CLP_MASK_FMT != 0 || req.u64(8) != 0 {
            rsp.set_rsp(CLP_RC_RESNOT0);
            return ConditionCode::Ok;
        }

        let functions = self.functions();
        let token = req.u64(16);
        let start = match usize::try_from(token) {
            Ok(start) if token == 0 || start < functions.len() => start,
            _ => {
                rsp.set_rsp(CLP_RC_LISTPCI_BADRT);
                return ConditionCode::Ok;
            }
        };

        let rsp_len = rsp.u16(0);
        if rsp_len < LIST_MIN_RSP_LEN {
            rsp.set_rsp(CLP_RC_8K);
            return ConditionCode::Ok;
        }
        if (rsp_len - CLP_LIST_HDR_LEN) % CLP_LIST_ENTRY_SIZE != 0 {
            rsp.set_rsp(CLP_RC_LEN);
            return ConditionCode::InvalidHandle;
        }

        rsp.set_u32(4, 0);
        rsp.set_u64(8, 0);
        rsp.set_u32(24, FunctionHandle::CLASS_MASK);
        rsp.set_u16(
            28,
            u16::try_from(self.config.slot_count()).unwrap_or(u16::MAX),
        );
        rsp.set_u8(30, LIST_FLAG_UID_CHECKING);
        rsp.set_u8(31, CLP_LIST_ENTRY_SIZE as u8);

        let capacity = usize::from((rsp_len - CLP_LIST_HDR_LEN) / CLP_LIST_ENTRY_SIZE);
        let mut len = usize::from(CLP_LIST_HDR_LEN);
        let mut next = start;
        for function in functions.iter().skip(start).take(capacity) {
            let (device_id, vendor_id) = function.with_device(|d| (d.device_id(), d.vendor_id()));
            let config = if function.state() == FunctionState::Standby {
                0
            } else {
                LIST_CONFIGURED
            };
            rsp.set_u16(len, device_id);
            rsp.set_u16(len + 2, vendor_id);
            rsp.set_u32(len + 4, config);
            rsp.set_u32(len + 8, function.fid);
            rsp.set_u32(len + 12, function.handle().raw());
            len += usize::from(CLP_LIST_ENTRY_SIZE);
            next += 1;
        }

        let resume = if next < functions.len() { next as u64 } else { 0 };
        tracing::debug!(start, listed = next - start, resume, "clp list pci");
        rsp.set_u64(16, resume);
        rsp.set_u16(0, len as u16);
        rsp.set_rsp(CLP_RC_OK);
        ConditionCode::Ok
    }

    fn clp_set(&self, req: &Block<'_>, rsp: &mut Block<'_>) {
        let fh = req.u32(16);
        let Some(function) = self.clp_function(fh) else {
            rsp.set_rsp(CLP_RC_SETPCIFN_FH);
            return;
        };

        let enable = match req.u8(22) {
            SET_ENABLE => match req.u8(23) {
                0 => return rsp.set_rsp(CLP_RC_SETPCIFN_DMAAS),
                1 => true,
                _ => return rsp.set_rsp(CLP_RC_SETPCIFN_RES),
            },
            SET_DISABLE => false,
            oc => {
                tracing::debug!(oc, "unknown set-pci-function operation");
                return rsp.set_rsp(CLP_RC_SETPCIFN_FHOP);
            }
        };

        match self.set_function_enabled(&function, enable) {
            SetFunctionOutcome::Changed(fh) => {
                rsp.set_u32(16, fh.raw());
                rsp.set_rsp(CLP_RC_OK);
            }
            SetFunctionOutcome::AlreadyInState(fh) => {
                rsp.set_u32(16, fh.raw());
                rsp.set_rsp(CLP_RC_ALRDY);
            }
            SetFunctionOutcome::NotConfigured => rsp.set_rsp(CLP_RC_SETPCIFN_FHOP),
        }
    }

    fn clp_query(&self, req: &Block<'_>, rsp: &mut Block<'_>) {
        let Some(function) = self.clp_function(req.u32(16)) else {
            rsp.set_rsp(CLP_RC_SETPCIFN_FH);
            return;
        };

        rsp.set_u16(16, 0);
        rsp.set_u8(18, 0);
        rsp.set_u8(19, function.group);
        rsp.set_u32(20, function.fid);
        rsp.set_u16(30, function.pchid);
        function.with_device(|dev| {
            for bar in 0..PCI_BAR_COUNT {
                let i = usize::from(bar);
                let size = dev.bar_size(bar);
                let log2 = if size == 0 { 0 } else { size.trailing_zeros() as u8 };
                rsp.set_u8(24 + i, log2);
                let value = dev.config_read(PCI_BASE_ADDRESS_0 + 4 * u16::from(bar), 4);
                rsp.set_u32(32 + 4 * i, value);
            }
        });
        rsp.0[56..60].fill(0);
        rsp.set_u8(62, FMB_LEN);
        rsp.set_u8(63, 0);
        rsp.set_u64(64, self.config.dma_window.start);
        rsp.set_u64(72, self.config.dma_window.end);
        rsp.set_u32(124, u32::from(function.uid));
        rsp.0[128..192].fill(0);
        rsp.set_rsp(CLP_RC_OK);
    }

    fn clp_query_group(&self, req: &Block<'_>, rsp: &mut Block<'_>) {
        let Some(group) = self.config.group(req.u8(19)) else {
            rsp.set_rsp(CLP_RC_QUERYPCIFG_PFGID);
            return;
        };
        rsp.set_u16(16, group.max_interrupts);
        rsp.set_u8(18, group.version);
        rsp.set_u8(19, group.frame_flags);
        rsp.set_u16(20, group.max_store_block);
        rsp.set_u16(22, group.measurement_interval_ms);
        rsp.set_u8(24, group.translation_sizes);
        rsp.set_u64(32, group.dma_address_space_mask);
        rsp.set_u64(40, group.msi_address);
        rsp.set_rsp(CLP_RC_OK);
    }
}
