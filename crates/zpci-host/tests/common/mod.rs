#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use zpci_host::device::{
    PCI_CAP_ID_MSIX, PCI_CAP_PTR_OFFSET, PCI_CONFIG_SPACE_SIZE, PCI_STATUS, PCI_STATUS_CAP_LIST,
};
use zpci_host::host::{AdapterMapError, HostControlError, HostFunctionId, HostResourceId};
use zpci_host::indicator::AdapterRoute;
use zpci_host::inst::{Fib, InstResult, FIB_LEN};
use zpci_host::{
    AdapterInterrupts, BarAccessError, BridgeServices, ConditionCode, DmaMapNotifier,
    EventChannel, HostBridge, HostBridgeConfig, HostPciControl, PciFunctionDevice, PlugRequest,
    ProgramInterrupt, Vcpu, ZpciFunction,
};
use zpci_iommu::{
    page_index, region_index, segment_index, IoTranslationAnchor, PageEntry, Permission,
    RegionEntry, SegmentEntry,
};
use zpci_mem::{GuestMemory, GuestRam};

pub const RAM_SIZE: u64 = 0x20_0000;

// Guest memory layout used by every test.
pub const CLP_ADDR: u64 = 0x1000;
pub const FIB_ADDR: u64 = 0x4000;
pub const SUMMARY_ADDR: u64 = 0x5000;
pub const VECTOR_ADDR: u64 = 0x5100;
pub const FMB_ADDR: u64 = 0x6000;
pub const BLOCK_ADDR: u64 = 0x8000;
pub const ROOT_TABLE: u64 = 0x2_0000;
const TABLE_POOL: u64 = 0x4_0000;
pub const FRAME_POOL: u64 = 0x10_0000;

pub const DMA_BASE: u64 = 0x1_0000_0000;
pub const DMA_LIMIT: u64 = 0x1_ffff_ffff;

pub const TEST_VENDOR: u16 = 0x1af4;
pub const TEST_DEVICE: u16 = 0x1041;
pub const MSIX_BAR: u8 = 2;
pub const MSIX_ENTRIES: u16 = 8;

pub const ISC: u8 = 3;

/// vCPU with a plain register file reading guest memory directly.
pub struct TestCpu {
    pub regs: [u64; 16],
    pub problem_state: bool,
    mem: Arc<GuestRam>,
}

impl TestCpu {
    pub fn new(mem: Arc<GuestRam>) -> Self {
        Self {
            regs: [0; 16],
            problem_state: false,
            mem,
        }
    }

    /// Status byte stored into register `r` by a failing instruction.
    pub fn status(&self, r: u8) -> u8 {
        (self.regs[usize::from(r)] >> 24) as u8
    }
}

impl Vcpu for TestCpu {
    fn problem_state(&self) -> bool {
        self.problem_state
    }

    fn reg(&self, r: u8) -> u64 {
        self.regs[usize::from(r)]
    }

    fn set_reg(&mut self, r: u8, value: u64) {
        self.regs[usize::from(r)] = value;
    }

    fn read_virtual(&mut self, addr: u64, _ar: u8, buf: &mut [u8]) -> Result<(), ProgramInterrupt> {
        self.mem
            .read_into(addr, buf)
            .map_err(|_| ProgramInterrupt::Addressing)
    }

    fn write_virtual(&mut self, addr: u64, _ar: u8, buf: &[u8]) -> Result<(), ProgramInterrupt> {
        self.mem
            .write_from(addr, buf)
            .map_err(|_| ProgramInterrupt::Addressing)
    }
}

#[derive(Default)]
pub struct RecordingAdapters {
    pub injected: Mutex<Vec<(u8, u32)>>,
    pub mapped: Mutex<Vec<(u32, u64)>>,
    pub unmapped: Mutex<Vec<(u32, u64)>>,
    pub refuse_map: AtomicBool,
}

impl RecordingAdapters {
    pub fn injections(&self) -> usize {
        self.injected.lock().unwrap().len()
    }
}

impl AdapterInterrupts for RecordingAdapters {
    fn inject(&self, isc: u8, io_int_word: u32) {
        self.injected.lock().unwrap().push((isc, io_int_word));
    }

    fn map_indicator(&self, adapter_id: u32, addr: u64) -> Result<(), AdapterMapError> {
        if self.refuse_map.load(Ordering::SeqCst) {
            return Err(AdapterMapError::Failed { addr });
        }
        self.mapped.lock().unwrap().push((adapter_id, addr));
        Ok(())
    }

    fn unmap_indicator(&self, adapter_id: u32, addr: u64) {
        self.unmapped.lock().unwrap().push((adapter_id, addr));
    }
}

/// Host control whose answers the test sets up front.
#[derive(Default)]
pub struct ScriptedHost {
    pub budget: Option<u32>,
    pub forwarding: bool,
    pub host_fh: Mutex<Option<u32>>,
    pub forwarding_enabled: Mutex<Vec<u32>>,
    pub forwarding_disabled: Mutex<Vec<u32>>,
}

impl HostPciControl for ScriptedHost {
    fn dma_mapping_budget(&self, _resource: HostResourceId) -> Option<u32> {
        self.budget
    }

    fn forwarding_available(&self) -> bool {
        self.forwarding
    }

    fn host_handle(&self, _function: HostFunctionId) -> Option<u32> {
        *self.host_fh.lock().unwrap()
    }

    fn enable_forwarding(
        &self,
        host_fh: u32,
        _isc: u8,
        _interrupts: u16,
        _route: &AdapterRoute,
    ) -> Result<(), HostControlError> {
        self.forwarding_enabled.lock().unwrap().push(host_fh);
        Ok(())
    }

    fn disable_forwarding(&self, host_fh: u32) -> Result<(), HostControlError> {
        self.forwarding_disabled.lock().unwrap().push(host_fh);
        Ok(())
    }
}

#[derive(Default)]
pub struct CountingEvents(pub AtomicUsize);

impl CountingEvents {
    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

impl EventChannel for CountingEvents {
    fn condition_changed(&self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapOp {
    Map {
        iova: u64,
        translated_addr: u64,
        len: u64,
        perm: Permission,
    },
    Unmap {
        iova: u64,
        len: u64,
    },
}

#[derive(Default)]
pub struct RecordingNotifier(pub Mutex<Vec<MapOp>>);

impl RecordingNotifier {
    pub fn take(&self) -> Vec<MapOp> {
        std::mem::take(&mut *self.0.lock().unwrap())
    }
}

impl DmaMapNotifier for RecordingNotifier {
    fn map(&self, iova: u64, translated_addr: u64, len: u64, perm: Permission) {
        self.0.lock().unwrap().push(MapOp::Map {
            iova,
            translated_addr,
            len,
            perm,
        });
    }

    fn unmap(&self, iova: u64, len: u64) {
        self.0.lock().unwrap().push(MapOp::Unmap { iova, len });
    }
}

/// Observable state of a [`TestDevice`], shared with the test after the device is plugged.
pub struct DeviceState {
    pub config: Vec<u8>,
    pub bars: Vec<Vec<u8>>,
    pub resets: usize,
}

impl DeviceState {
    /// BAR contents are kept in big-endian order, the way the guest lays them out.
    pub fn bar_u64(&self, bar: u8, offset: usize) -> u64 {
        let mut b = [0u8; 8];
        b.copy_from_slice(&self.bars[usize::from(bar)][offset..offset + 8]);
        u64::from_be_bytes(b)
    }

    pub fn bar_u32(&self, bar: u8, offset: usize) -> u32 {
        let mut b = [0u8; 4];
        b.copy_from_slice(&self.bars[usize::from(bar)][offset..offset + 4]);
        u32::from_be_bytes(b)
    }

    pub fn config_u32(&self, offset: usize) -> u32 {
        let mut b = [0u8; 4];
        b.copy_from_slice(&self.config[offset..offset + 4]);
        u32::from_le_bytes(b)
    }
}

/// Function with three memory BARs and an MSI-X table at the start of BAR 2.
pub struct TestDevice {
    state: Arc<Mutex<DeviceState>>,
}

impl TestDevice {
    pub fn new(with_msix: bool) -> (Self, Arc<Mutex<DeviceState>>) {
        let mut config = vec![0u8; PCI_CONFIG_SPACE_SIZE];
        config[0..2].copy_from_slice(&TEST_VENDOR.to_le_bytes());
        config[2..4].copy_from_slice(&TEST_DEVICE.to_le_bytes());
        config[0x10..0x14].copy_from_slice(&0xc000_000cu32.to_le_bytes());
        config[0x18..0x1c].copy_from_slice(&0xc000_100cu32.to_le_bytes());
        config[0x20..0x24].copy_from_slice(&0xc000_2000u32.to_le_bytes());
        if with_msix {
            config[usize::from(PCI_STATUS)] = PCI_STATUS_CAP_LIST as u8;
            config[usize::from(PCI_CAP_PTR_OFFSET)] = 0x40;
            config[0x40] = PCI_CAP_ID_MSIX;
            config[0x41] = 0;
            config[0x42..0x44].copy_from_slice(&(MSIX_ENTRIES - 1).to_le_bytes());
            config[0x44..0x48].copy_from_slice(&u32::from(MSIX_BAR).to_le_bytes());
            config[0x48..0x4c].copy_from_slice(&(0x800u32 | u32::from(MSIX_BAR)).to_le_bytes());
        }
        let mut bars = vec![Vec::new(); 6];
        bars[0] = vec![0; 0x1000];
        bars[2] = vec![0; 0x1000];
        bars[4] = vec![0; 0x100];

        let state = Arc::new(Mutex::new(DeviceState {
            config,
            bars,
            resets: 0,
        }));
        (
            Self {
                state: state.clone(),
            },
            state,
        )
    }
}

impl PciFunctionDevice for TestDevice {
    fn config_read(&mut self, offset: u16, len: u8) -> u32 {
        let state = self.state.lock().unwrap();
        let mut value = 0u32;
        for i in 0..usize::from(len) {
            let byte = state.config.get(usize::from(offset) + i).copied().unwrap_or(0);
            value |= u32::from(byte) << (8 * i);
        }
        value
    }

    fn config_write(&mut self, offset: u16, len: u8, value: u32) {
        let mut state = self.state.lock().unwrap();
        for i in 0..usize::from(len) {
            if let Some(byte) = state.config.get_mut(usize::from(offset) + i) {
                *byte = (value >> (8 * i)) as u8;
            }
        }
    }

    fn bar_size(&self, bar: u8) -> u64 {
        let state = self.state.lock().unwrap();
        state.bars.get(usize::from(bar)).map_or(0, |b| b.len() as u64)
    }

    fn bar_read(&mut self, bar: u8, offset: u64, len: u8) -> Result<u64, BarAccessError> {
        let state = self.state.lock().unwrap();
        let mem = state
            .bars
            .get(usize::from(bar))
            .filter(|b| !b.is_empty())
            .ok_or(BarAccessError::NoSuchBar { bar })?;
        let start = offset as usize;
        let bytes = mem
            .get(start..start + usize::from(len))
            .ok_or(BarAccessError::OutOfRange { bar, offset, len })?;
        Ok(bytes.iter().fold(0u64, |acc, b| (acc << 8) | u64::from(*b)))
    }

    fn bar_write(
        &mut self,
        bar: u8,
        offset: u64,
        len: u8,
        value: u64,
    ) -> Result<(), BarAccessError> {
        let mut state = self.state.lock().unwrap();
        let mem = state
            .bars
            .get_mut(usize::from(bar))
            .filter(|b| !b.is_empty())
            .ok_or(BarAccessError::NoSuchBar { bar })?;
        let start = offset as usize;
        let bytes = mem
            .get_mut(start..start + usize::from(len))
            .ok_or(BarAccessError::OutOfRange { bar, offset, len })?;
        let n = bytes.len();
        for (i, byte) in bytes.iter_mut().enumerate() {
            *byte = (value >> (8 * (n - 1 - i))) as u8;
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.state.lock().unwrap().resets += 1;
    }
}

/// Builds region → segment → page chains under [`ROOT_TABLE`].
pub struct Tables {
    mem: Arc<GuestRam>,
    next: u64,
    segments: HashMap<u64, u64>,
    pages: HashMap<(u64, u64), u64>,
}

impl Tables {
    pub fn new(mem: Arc<GuestRam>) -> Self {
        Self {
            mem,
            next: TABLE_POOL,
            segments: HashMap::new(),
            pages: HashMap::new(),
        }
    }

    pub fn anchor(&self) -> IoTranslationAnchor {
        IoTranslationAnchor::region_third(ROOT_TABLE)
    }

    fn alloc(&mut self, size: u64) -> u64 {
        let at = self.next;
        self.next += size;
        at
    }

    fn page_entry_addr(&mut self, dma: u64) -> u64 {
        let rx = region_index(dma);
        let st = match self.segments.get(&rx) {
            Some(&st) => st,
            None => {
                let st = self.alloc(0x4000);
                self.mem
                    .write_u64_be(ROOT_TABLE + rx * 8, RegionEntry::encode(st, false))
                    .unwrap();
                self.segments.insert(rx, st);
                st
            }
        };
        let sx = segment_index(dma);
        let pt = match self.pages.get(&(rx, sx)) {
            Some(&pt) => pt,
            None => {
                let pt = self.alloc(0x800);
                self.mem
                    .write_u64_be(st + sx * 8, SegmentEntry::encode(pt, false))
                    .unwrap();
                self.pages.insert((rx, sx), pt);
                pt
            }
        };
        pt + page_index(dma) * 8
    }

    pub fn map(&mut self, dma: u64, frame: u64) {
        self.map_with(dma, frame, false);
    }

    pub fn map_read_only(&mut self, dma: u64, frame: u64) {
        self.map_with(dma, frame, true);
    }

    fn map_with(&mut self, dma: u64, frame: u64, protected: bool) {
        let entry = self.page_entry_addr(dma);
        self.mem
            .write_u64_be(entry, PageEntry::encode(frame, protected))
            .unwrap();
    }

    pub fn invalidate(&mut self, dma: u64) {
        let entry = self.page_entry_addr(dma);
        self.mem
            .write_u64_be(entry, PageEntry::encode_invalid(0))
            .unwrap();
    }
}

pub struct Harness {
    pub bridge: Arc<HostBridge>,
    pub mem: Arc<GuestRam>,
    pub adapters: Arc<RecordingAdapters>,
    pub host: Arc<ScriptedHost>,
    pub events: Arc<CountingEvents>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(HostBridgeConfig::default(), ScriptedHost::default())
    }

    pub fn with(config: HostBridgeConfig, host: ScriptedHost) -> Self {
        let mem = Arc::new(GuestRam::new(RAM_SIZE).unwrap());
        let adapters = Arc::new(RecordingAdapters::default());
        let host = Arc::new(host);
        let events = Arc::new(CountingEvents::default());
        let services = BridgeServices {
            host: host.clone(),
            adapters: adapters.clone(),
            events: events.clone(),
        };
        let bridge = Arc::new(HostBridge::new(config, mem.clone(), services));
        Self {
            bridge,
            mem,
            adapters,
            host,
            events,
        }
    }

    pub fn cpu(&self) -> TestCpu {
        TestCpu::new(self.mem.clone())
    }

    pub fn tables(&self) -> Tables {
        Tables::new(self.mem.clone())
    }

    pub fn plug(&self, slot: u16) -> (Arc<ZpciFunction>, Arc<Mutex<DeviceState>>) {
        self.plug_request(|req| req.slot(slot))
    }

    pub fn plug_request(
        &self,
        build: impl FnOnce(PlugRequest) -> PlugRequest,
    ) -> (Arc<ZpciFunction>, Arc<Mutex<DeviceState>>) {
        let (device, state) = TestDevice::new(true);
        let function = self
            .bridge
            .plug(build(PlugRequest::new(Box::new(device))))
            .unwrap();
        (function, state)
    }

    /// Runs one CLP request and returns the condition code and the response block.
    pub fn clp(&self, cpu: &mut TestCpu, req: [u8; 32], rsp_len: u16) -> (InstResult, Vec<u8>) {
        self.mem.write_from(CLP_ADDR, &vec![0u8; 8192]).unwrap();
        self.mem.write_from(CLP_ADDR, &req).unwrap();
        self.mem.write_u16_be(CLP_ADDR + 32, rsp_len).unwrap();
        cpu.regs[2] = CLP_ADDR;
        let cc = self.bridge.clp(cpu, 2);
        let mut rsp = vec![0u8; usize::from(rsp_len)];
        self.mem.read_into(CLP_ADDR + 32, &mut rsp).unwrap();
        (cc, rsp)
    }

    /// Enables `function` through CLP and returns the new handle.
    pub fn enable(&self, function: &ZpciFunction) -> u32 {
        let mut cpu = self.cpu();
        let (cc, rsp) = self.clp(&mut cpu, set_req(function.handle().raw(), 0, 1), 32);
        assert_eq!(cc, Ok(ConditionCode::Ok));
        assert_eq!(be_u16(&rsp, 2), zpci_host::inst::CLP_RC_OK);
        be_u32(&rsp, 16)
    }

    /// Issues MPCIFC `oc` for `fh` with `fib` stored at [`FIB_ADDR`].
    pub fn mpcifc(&self, cpu: &mut TestCpu, fh: u32, oc: u8, fib: &Fib) -> InstResult {
        self.mem.write_from(FIB_ADDR, &fib.encode()).unwrap();
        cpu.regs[1] = (u64::from(fh) << 32) | u64::from(oc);
        self.bridge.mpcifc(cpu, 1, FIB_ADDR, 0)
    }

    pub fn stpcifc(&self, cpu: &mut TestCpu, fh: u32) -> (InstResult, Fib) {
        self.mem.write_from(FIB_ADDR, &[0xaa; FIB_LEN]).unwrap();
        cpu.regs[1] = u64::from(fh) << 32;
        let cc = self.bridge.stpcifc(cpu, 1, FIB_ADDR, 0);
        let mut buf = [0u8; FIB_LEN];
        self.mem.read_into(FIB_ADDR, &mut buf).unwrap();
        (cc, Fib::decode(&buf))
    }

    /// Registers a translation over [`DMA_BASE`]..=[`DMA_LIMIT`] rooted at [`ROOT_TABLE`].
    pub fn register_ioat(&self, fh: u32) -> InstResult {
        let mut cpu = self.cpu();
        self.mpcifc(&mut cpu, fh, 4, &ioat_fib(DMA_BASE, DMA_LIMIT))
    }

    /// Registers `noi` interrupts with indicators at [`VECTOR_ADDR`] and [`SUMMARY_ADDR`].
    pub fn register_irq(&self, fh: u32, noi: u16, summary: bool) -> InstResult {
        let mut cpu = self.cpu();
        self.mpcifc(&mut cpu, fh, 2, &irq_fib(noi, summary))
    }

    pub fn rpcit(&self, cpu: &mut TestCpu, fh: u32, start: u64, len: u64) -> InstResult {
        cpu.regs[1] = u64::from(fh) << 32;
        cpu.regs[2] = start;
        cpu.regs[3] = len;
        self.bridge.rpcit(cpu, 1, 2)
    }

    pub fn pcilg(&self, cpu: &mut TestCpu, fh: u32, pcias: u8, offset: u64, len: u8) -> InstResult {
        cpu.regs[2] = access_reg(fh, pcias, len);
        cpu.regs[3] = offset;
        self.bridge.pcilg(cpu, 4, 2)
    }

    pub fn pcistg(
        &self,
        cpu: &mut TestCpu,
        fh: u32,
        pcias: u8,
        offset: u64,
        len: u8,
        data: u64,
    ) -> InstResult {
        cpu.regs[2] = access_reg(fh, pcias, len);
        cpu.regs[3] = offset;
        cpu.regs[4] = data;
        self.bridge.pcistg(cpu, 4, 2)
    }

    pub fn pcistb(
        &self,
        cpu: &mut TestCpu,
        fh: u32,
        pcias: u8,
        offset: u64,
        len: u16,
        gaddr: u64,
    ) -> InstResult {
        cpu.regs[1] = (u64::from(fh) << 32) | (u64::from(pcias) << 16) | u64::from(len);
        cpu.regs[3] = offset;
        self.bridge.pcistb(cpu, 1, 3, gaddr, 0)
    }
}

pub fn access_reg(fh: u32, pcias: u8, len: u8) -> u64 {
    (u64::from(fh) << 32) | (u64::from(pcias) << 16) | u64::from(len)
}

pub fn ioat_fib(pba: u64, pal: u64) -> Fib {
    Fib {
        pba,
        pal,
        iota: IoTranslationAnchor::region_third(ROOT_TABLE).raw(),
        ..Fib::default()
    }
}

pub fn irq_fib(noi: u16, summary: bool) -> Fib {
    Fib {
        isc: ISC,
        noi,
        sum: summary,
        aibv: VECTOR_ADDR,
        aisb: SUMMARY_ADDR,
        ..Fib::default()
    }
}

fn request(cmd: u16) -> [u8; 32] {
    let mut req = [0u8; 32];
    req[0..2].copy_from_slice(&32u16.to_be_bytes());
    req[2..4].copy_from_slice(&cmd.to_be_bytes());
    req
}

pub fn list_req(resume_token: u64) -> [u8; 32] {
    let mut req = request(2);
    req[16..24].copy_from_slice(&resume_token.to_be_bytes());
    req
}

pub fn query_req(fh: u32) -> [u8; 32] {
    let mut req = request(3);
    req[16..20].copy_from_slice(&fh.to_be_bytes());
    req
}

pub fn group_req(pfgid: u8) -> [u8; 32] {
    let mut req = request(4);
    req[19] = pfgid;
    req
}

pub fn set_req(fh: u32, oc: u8, ndas: u8) -> [u8; 32] {
    let mut req = request(5);
    req[16..20].copy_from_slice(&fh.to_be_bytes());
    req[22] = oc;
    req[23] = ndas;
    req
}

pub fn be_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([buf[at], buf[at + 1]])
}

pub fn be_u32(buf: &[u8], at: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[at..at + 4]);
    u32::from_be_bytes(b)
}

pub fn be_u64(buf: &[u8], at: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[at..at + 8]);
    u64::from_be_bytes(b)
}
