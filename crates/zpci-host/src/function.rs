use std::sync::{Arc, Mutex};

use zpci_iommu::{IoTlb, IoTranslationAnchor};

use crate::device::{MsixLayout, PciFunctionDevice};
use crate::dma_limit::DmaLimitRecord;
use crate::fmb::{Measurement, MeasurementCounters};
use crate::handle::FunctionHandle;
use crate::host::{DmaMapNotifier, PassthroughInfo};
use crate::indicator::{AdapterRoute, Indicator};
use crate::lock;

/// Lifecycle of a function slot. `Reserved` is only observed on a function that has been
/// unplugged while something still held a reference to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FunctionState {
    Reserved,
    Standby,
    Configured,
    Enabled,
}

/// Inclusive DMA address window registered for a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DmaWindow {
    pub base: u64,
    pub limit: u64,
}

impl DmaWindow {
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr <= self.limit
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InterruptConfig {
    /// Interruption subclass.
    pub isc: u8,
    /// Number of interrupt vectors.
    pub interrupts: u16,
    /// Whether the summary bit is maintained.
    pub summary: bool,
    pub route: AdapterRoute,
    /// Delivered by the host instead of through the doorbell.
    pub forwarded: bool,
}

#[derive(Debug)]
pub(crate) struct InterruptRegistration {
    pub config: InterruptConfig,
    /// Summary (only with the summary flag) and vector indicators, when delivery goes
    /// through this bridge.
    pub indicators: Option<(Option<Indicator>, Indicator)>,
}

#[derive(Debug, Default)]
pub(crate) struct DmaSpace {
    pub window: DmaWindow,
    pub anchor: IoTranslationAnchor,
    /// Translation installed; cleared before the window and anchor are reset.
    pub enabled: bool,
    pub iotlb: IoTlb,
}

#[derive(Debug)]
pub(crate) struct FunctionInner {
    pub fh: FunctionHandle,
    pub state: FunctionState,
    pub error_state: bool,
    pub load_store_blocked: bool,
    pub unplug_requested: bool,
    pub dma: DmaSpace,
    pub interrupts: Option<InterruptRegistration>,
    pub measurement: Measurement,
}

/// Point-in-time view of a function's guest-visible state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FunctionStatus {
    pub handle: FunctionHandle,
    pub state: FunctionState,
    pub error_state: bool,
    pub load_store_blocked: bool,
    pub unplug_requested: bool,
    pub translation: Option<(DmaWindow, IoTranslationAnchor)>,
    pub interrupts: Option<InterruptConfig>,
    pub measurement_addr: u64,
}

/// One virtual PCI function attached to the bridge.
pub struct ZpciFunction {
    pub(crate) index: u16,
    pub(crate) fid: u32,
    pub(crate) uid: u16,
    pub(crate) group: u8,
    pub(crate) pchid: u16,
    pub(crate) msix: Option<MsixLayout>,
    pub(crate) passthrough: Option<PassthroughInfo>,
    pub(crate) dma_limit: Option<Arc<DmaLimitRecord>>,
    pub(crate) device: Mutex<Box<dyn PciFunctionDevice>>,
    pub(crate) inner: Mutex<FunctionInner>,
    pub(crate) counters: MeasurementCounters,
}

impl ZpciFunction {
    pub fn fid(&self) -> u32 {
        self.fid
    }

    pub fn slot(&self) -> u16 {
        self.index
    }

    pub fn uid(&self) -> u16 {
        self.uid
    }

    pub fn group(&self) -> u8 {
        self.group
    }

    pub fn msix(&self) -> Option<MsixLayout> {
        self.msix
    }

    pub fn passthrough(&self) -> Option<&PassthroughInfo> {
        self.passthrough.as_ref()
    }

    pub fn dma_limit(&self) -> Option<&Arc<DmaLimitRecord>> {
        self.dma_limit.as_ref()
    }

    pub(crate) fn notifier(&self) -> Option<&dyn DmaMapNotifier> {
        self.passthrough
            .as_ref()
            .and_then(|info| info.notifier.as_deref())
    }

    pub fn counters(&self) -> &MeasurementCounters {
        &self.counters
    }

    pub fn handle(&self) -> FunctionHandle {
        lock(&self.inner).fh
    }

    pub fn state(&self) -> FunctionState {
        lock(&self.inner).state
    }

    pub fn status(&self) -> FunctionStatus {
        let inner = lock(&self.inner);
        FunctionStatus {
            handle: inner.fh,
            state: inner.state,
            error_state: inner.error_state,
            load_store_blocked: inner.load_store_blocked,
            unplug_requested: inner.unplug_requested,
            translation: inner
                .dma
                .enabled
                .then_some((inner.dma.window, inner.dma.anchor)),
            interrupts: inner.interrupts.as_ref().map(|irq| irq.config),
            measurement_addr: inner.measurement.addr,
        }
    }

    /// Number of translations currently shadowed for refresh.
    pub fn shadowed_translations(&self) -> usize {
        lock(&self.inner).dma.iotlb.len()
    }

    /// Runs `f` with exclusive access to the wrapped device model.
    pub fn with_device<R>(&self, f: impl FnOnce(&mut dyn PciFunctionDevice) -> R) -> R {
        let mut device = lock(&self.device);
        f(device.as_mut())
    }
}

impl std::fmt::Debug for ZpciFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ZpciFunction")
            .field("slot", &self.index)
            .field("fid", &self.fid)
            .field("uid", &self.uid)
            .field("msix", &self.msix)
            .field("passthrough", &self.passthrough)
            .finish_non_exhaustive()
    }
}
