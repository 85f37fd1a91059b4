//! The function table and the lifecycle operations that change it.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use zpci_mem::GuestMemory;

use crate::config::HostBridgeConfig;
use crate::device::{MsixLayout, PciFunctionDevice};
use crate::dma_limit::DmaLimiter;
use crate::error::RegistryError;
use crate::event::{
    EventQueue, PendingEvent, EVENT_CONFIGURED_TO_STANDBY_RESERVED, EVENT_DECONFIGURE_REQUEST,
    EVENT_RESERVED_TO_STANDBY, EVENT_STANDBY_TO_RESERVED, EVENT_TO_CONFIGURED,
};
use crate::fmb::{Measurement, MeasurementCounters};
use crate::function::{DmaSpace, FunctionInner, FunctionState, ZpciFunction};
use crate::handle::FunctionHandle;
use crate::host::{BridgeServices, PassthroughInfo};
use crate::indicator::IndicatorAllocator;
use crate::lock;

/// Everything needed to attach a device model to the bridge.
pub struct PlugRequest {
    pub device: Box<dyn PciFunctionDevice>,
    /// Slot to occupy; the next free slot when absent.
    pub slot: Option<u16>,
    /// Function id; defaults to the slot number when that id is free.
    pub fid: Option<u32>,
    pub uid: Option<u16>,
    /// Function group; defaults to the first configured group.
    pub group: Option<u8>,
    pub pchid: u16,
    /// Attached while the guest is running (as opposed to at machine creation).
    pub hotplugged: bool,
    pub passthrough: Option<PassthroughInfo>,
}

impl PlugRequest {
    pub fn new(device: Box<dyn PciFunctionDevice>) -> Self {
        Self {
            device,
            slot: None,
            fid: None,
            uid: None,
            group: None,
            pchid: 0,
            hotplugged: false,
            passthrough: None,
        }
    }

    pub fn slot(mut self, slot: u16) -> Self {
        self.slot = Some(slot);
        self
    }

    pub fn fid(mut self, fid: u32) -> Self {
        self.fid = Some(fid);
        self
    }

    pub fn uid(mut self, uid: u16) -> Self {
        self.uid = Some(uid);
        self
    }

    pub fn group(mut self, group: u8) -> Self {
        self.group = Some(group);
        self
    }

    pub fn hotplugged(mut self, hotplugged: bool) -> Self {
        self.hotplugged = hotplugged;
        self
    }

    pub fn passthrough(mut self, info: PassthroughInfo) -> Self {
        self.passthrough = Some(info);
        self
    }
}

/// Result of a service-processor configure/deconfigure request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SclpOutcome {
    Done,
    AlreadyInState,
    NoSuchFunction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnplugProgress {
    /// The function was removed.
    Completed,
    /// The guest was asked to deconfigure the function first.
    Pending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetFunctionOutcome {
    Changed(FunctionHandle),
    AlreadyInState(FunctionHandle),
    NotConfigured,
}

struct FunctionTable {
    slots: Vec<Option<Arc<ZpciFunction>>>,
    next_slot: usize,
}

impl FunctionTable {
    fn occupied(&self) -> impl Iterator<Item = &Arc<ZpciFunction>> {
        self.slots.iter().flatten()
    }

    fn pick_slot(&self, requested: Option<u16>) -> Result<usize, RegistryError> {
        if let Some(slot) = requested {
            let idx = usize::from(slot);
            return match self.slots.get(idx) {
                None => Err(RegistryError::SlotOutOfRange {
                    slot,
                    slots: self.slots.len(),
                }),
                Some(Some(_)) => Err(RegistryError::SlotOccupied { slot }),
                Some(None) => Ok(idx),
            };
        }
        // Rotate through the table so a freed slot (and with it the handle) is not handed out
        // again straight away.
        let len = self.slots.len();
        (0..len)
            .map(|i| (self.next_slot + i) % len)
            .find(|&idx| self.slots[idx].is_none())
            .ok_or(RegistryError::NoFreeSlot)
    }

    fn pick_fid(&self, requested: Option<u32>, slot: usize) -> Result<u32, RegistryError> {
        let used: HashSet<u32> = self.occupied().map(|f| f.fid).collect();
        match requested {
            Some(fid) if used.contains(&fid) => Err(RegistryError::FidInUse { fid }),
            Some(fid) => Ok(fid),
            None => Ok((slot as u32..)
                .chain(0..slot as u32)
                .find(|fid| !used.contains(fid))
                .unwrap_or(slot as u32)),
        }
    }

    fn pick_uid(&self, requested: Option<u16>) -> Result<u16, RegistryError> {
        let used: HashSet<u16> = self.occupied().map(|f| f.uid).collect();
        match requested {
            Some(uid) if used.contains(&uid) => Err(RegistryError::UidInUse { uid }),
            Some(uid) => Ok(uid),
            None => (1..=u16::MAX)
                .find(|uid| !used.contains(uid))
                .ok_or(RegistryError::NoFreeUid),
        }
    }
}

/// The virtual zPCI host bridge: the function registry plus the shared services every
/// instruction handler needs.
pub struct HostBridge {
    pub(crate) config: HostBridgeConfig,
    pub(crate) mem: Arc<dyn GuestMemory>,
    pub(crate) services: BridgeServices,
    pub(crate) events: EventQueue,
    pub(crate) indicators: IndicatorAllocator,
    pub(crate) dma_limits: DmaLimiter,
    table: Mutex<FunctionTable>,
}

impl HostBridge {
    pub fn new(
        config: HostBridgeConfig,
        mem: Arc<dyn GuestMemory>,
        services: BridgeServices,
    ) -> Self {
        let slots = config.slot_count();
        Self {
            events: EventQueue::new(services.events.clone()),
            indicators: IndicatorAllocator::new(),
            dma_limits: DmaLimiter::new(),
            table: Mutex::new(FunctionTable {
                slots: vec![None; slots],
                next_slot: 0,
            }),
            config,
            mem,
            services,
        }
    }

    pub fn config(&self) -> &HostBridgeConfig {
        &self.config
    }

    pub fn events(&self) -> &EventQueue {
        &self.events
    }

    pub fn indicators(&self) -> &IndicatorAllocator {
        &self.indicators
    }

    pub fn dma_limits(&self) -> &DmaLimiter {
        &self.dma_limits
    }

    pub fn guest_memory(&self) -> &Arc<dyn GuestMemory> {
        &self.mem
    }

    /// All attached functions, in slot order.
    pub fn functions(&self) -> Vec<Arc<ZpciFunction>> {
        lock(&self.table).occupied().cloned().collect()
    }

    pub fn find_by_slot(&self, slot: u16) -> Option<Arc<ZpciFunction>> {
        lock(&self.table)
            .slots
            .get(usize::from(slot))
            .and_then(|f| f.clone())
    }

    /// Exact handle match, enabled bit included.
    pub fn find_by_handle(&self, fh: u32) -> Option<Arc<ZpciFunction>> {
        self.find_by_slot(FunctionHandle::new(fh).index())
            .filter(|f| f.handle().raw() == fh)
    }

    pub fn find_by_fid(&self, fid: u32) -> Option<Arc<ZpciFunction>> {
        lock(&self.table).occupied().find(|f| f.fid == fid).cloned()
    }

    /// The `n`th attached function counting only occupied slots.
    pub fn find_by_index(&self, n: usize) -> Option<Arc<ZpciFunction>> {
        lock(&self.table).occupied().nth(n).cloned()
    }

    pub fn plug(&self, req: PlugRequest) -> Result<Arc<ZpciFunction>, RegistryError> {
        let PlugRequest {
            mut device,
            slot,
            fid,
            uid,
            group,
            pchid,
            hotplugged,
            passthrough,
        } = req;

        let group = match group {
            Some(id) => self
                .config
                .group(id)
                .ok_or(RegistryError::UnknownGroup { group: id })?
                .id,
            None => self
                .config
                .groups
                .first()
                .map_or(crate::config::DEFAULT_GROUP_ID, |g| g.id),
        };

        let msix = MsixLayout::probe(device.as_mut());
        if msix.is_none() && self.config.require_msix {
            return Err(RegistryError::MissingMsix);
        }

        let function = {
            let mut table = lock(&self.table);
            let idx = table.pick_slot(slot)?;
            let fid = table.pick_fid(fid, idx)?;
            let uid = table.pick_uid(uid)?;

            let dma_limit = passthrough
                .as_ref()
                .and_then(|info| self.dma_limits.acquire(info.resource, &*self.services.host));
            let fh = FunctionHandle::for_slot(idx as u16, passthrough.is_some());
            let function = Arc::new(ZpciFunction {
                index: idx as u16,
                fid,
                uid,
                group,
                pchid,
                msix,
                passthrough,
                dma_limit,
                device: Mutex::new(device),
                inner: Mutex::new(FunctionInner {
                    fh,
                    state: FunctionState::Configured,
                    error_state: false,
                    load_store_blocked: false,
                    unplug_requested: false,
                    dma: DmaSpace::default(),
                    interrupts: None,
                    measurement: Measurement::default(),
                }),
                counters: MeasurementCounters::default(),
            });
            table.slots[idx] = Some(function.clone());
            table.next_slot = (idx + 1) % table.slots.len();
            function
        };

        let fh = function.handle().raw();
        tracing::debug!(
            slot = function.index,
            fid = function.fid,
            uid = function.uid,
            fh = format_args!("{fh:#x}"),
            hotplugged,
            "plugged zpci function"
        );
        if hotplugged {
            self.events.push(PendingEvent::availability(
                EVENT_RESERVED_TO_STANDBY,
                fh,
                function.fid,
            ));
            self.events
                .push(PendingEvent::availability(EVENT_TO_CONFIGURED, fh, function.fid));
        }
        Ok(function)
    }

    /// Detaches a function, releasing everything it holds, and returns its slot to the
    /// reserved state.
    pub fn unplug(&self, fid: u32) -> Result<(), RegistryError> {
        let function = {
            let mut table = lock(&self.table);
            let idx = table
                .slots
                .iter()
                .position(|slot| slot.as_ref().is_some_and(|f| f.fid == fid))
                .ok_or(RegistryError::NoSuchFunction { fid })?;
            table.slots[idx].take()
        }
        .ok_or(RegistryError::NoSuchFunction { fid })?;

        let mut inner = lock(&function.inner);
        let was = inner.state;
        let fh = inner.fh.raw();
        self.release_function_resources(&function, &mut inner);
        inner.state = FunctionState::Reserved;
        inner.fh = FunctionHandle::default();
        inner.error_state = false;
        inner.load_store_blocked = false;
        inner.unplug_requested = false;
        drop(inner);

        if let Some(limit) = &function.dma_limit {
            self.dma_limits.release(limit);
        }

        tracing::debug!(fid, fh = format_args!("{fh:#x}"), ?was, "unplugged zpci function");
        if was != FunctionState::Standby {
            self.events.push(PendingEvent::availability(
                EVENT_CONFIGURED_TO_STANDBY_RESERVED,
                fh,
                fid,
            ));
        }
        self.events
            .push(PendingEvent::availability(EVENT_STANDBY_TO_RESERVED, fh, fid));
        Ok(())
    }

    /// Asks for a function to be removed. A function in standby goes immediately; otherwise
    /// the guest is sent a deconfigure request and removal completes on deconfigure.
    pub fn request_unplug(&self, fid: u32) -> Result<UnplugProgress, RegistryError> {
        let function = self
            .find_by_fid(fid)
            .ok_or(RegistryError::NoSuchFunction { fid })?;
        let mut inner = lock(&function.inner);
        if inner.state == FunctionState::Standby {
            drop(inner);
            self.unplug(fid)?;
            return Ok(UnplugProgress::Completed);
        }
        inner.unplug_requested = true;
        let fh = inner.fh.raw();
        drop(inner);
        self.events
            .push(PendingEvent::availability(EVENT_DECONFIGURE_REQUEST, fh, fid));
        Ok(UnplugProgress::Pending)
    }

    /// Service-processor "configure": standby → configured.
    pub fn configure(&self, fid: u32) -> SclpOutcome {
        let Some(function) = self.find_by_fid(fid) else {
            return SclpOutcome::NoSuchFunction;
        };
        let mut inner = lock(&function.inner);
        if inner.state != FunctionState::Standby {
            return SclpOutcome::AlreadyInState;
        }
        inner.state = FunctionState::Configured;
        inner.fh = inner.fh.with_enabled(false);
        tracing::debug!(fid, "configured zpci function");
        SclpOutcome::Done
    }

    /// Service-processor "deconfigure": configured or enabled → standby.
    pub fn deconfigure(&self, fid: u32) -> SclpOutcome {
        let Some(function) = self.find_by_fid(fid) else {
            return SclpOutcome::NoSuchFunction;
        };
        let mut inner = lock(&function.inner);
        if inner.state == FunctionState::Standby {
            return SclpOutcome::AlreadyInState;
        }
        self.reset_function(&function, &mut inner);
        inner.state = FunctionState::Standby;
        let unplug = inner.unplug_requested;
        drop(inner);
        tracing::debug!(fid, unplug, "deconfigured zpci function");

        if unplug {
            // Nothing else can have removed it: unplug only runs under this fid's request.
            if let Err(err) = self.unplug(fid) {
                tracing::warn!(fid, %err, "deferred unplug failed");
            }
        }
        SclpOutcome::Done
    }

    /// Machine reset: finishes pending unplugs and disables every enabled function.
    pub fn reset(&self) {
        for function in self.functions() {
            let mut inner = lock(&function.inner);
            if inner.unplug_requested {
                drop(inner);
                if let Err(err) = self.unplug(function.fid) {
                    tracing::warn!(fid = function.fid, %err, "unplug on reset failed");
                }
                continue;
            }
            if inner.state == FunctionState::Enabled {
                self.reset_function(&function, &mut inner);
                inner.state = FunctionState::Configured;
            }
        }
    }

    /// Guest enable/disable of a configured function.
    pub fn set_function_enabled(
        &self,
        function: &ZpciFunction,
        enable: bool,
    ) -> SetFunctionOutcome {
        let mut inner = lock(&function.inner);
        match (inner.state, enable) {
            (FunctionState::Enabled, true) | (FunctionState::Configured, false) => {
                SetFunctionOutcome::AlreadyInState(inner.fh)
            }
            (FunctionState::Configured, true) => {
                inner.state = FunctionState::Enabled;
                inner.fh = inner.fh.with_enabled(true);
                tracing::debug!(
                    fid = function.fid,
                    fh = format_args!("{:#x}", inner.fh),
                    "enabled zpci function"
                );
                SetFunctionOutcome::Changed(inner.fh)
            }
            (FunctionState::Enabled, false) => {
                self.reset_function(function, &mut inner);
                inner.state = FunctionState::Configured;
                tracing::debug!(fid = function.fid, "disabled zpci function");
                SetFunctionOutcome::Changed(inner.fh)
            }
            (FunctionState::Standby | FunctionState::Reserved, _) => {
                SetFunctionOutcome::NotConfigured
            }
        }
    }

    /// Returns a function to its freshly-configured condition: no interrupts, no
    /// translation, no measurement, error flags clear and the device reset.
    pub(crate) fn reset_function(&self, function: &ZpciFunction, inner: &mut FunctionInner) {
        self.release_function_resources(function, inner);
        inner.error_state = false;
        inner.load_store_blocked = false;
        inner.fh = inner.fh.with_enabled(false);
        lock(&function.device).reset();
    }

    fn release_function_resources(&self, function: &ZpciFunction, inner: &mut FunctionInner) {
        if inner.interrupts.is_some() {
            self.deregister_interrupts(function, inner);
        }
        if inner.dma.enabled {
            self.deregister_translation(function, inner);
        }
        inner.measurement = Measurement::default();
        function.counters.clear();
    }
}
