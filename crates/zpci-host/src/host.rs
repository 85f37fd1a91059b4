//! Interfaces to the hypervisor and platform around the bridge.

use std::sync::Arc;

use thiserror::Error;
use zpci_iommu::Permission;

use crate::indicator::AdapterRoute;

/// Identifies a host DMA resource (an IOMMU container) shared by passthrough functions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HostResourceId(pub u32);

/// Identifies a host PCI function backing a passthrough function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostFunctionId(pub u32);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostControlError {
    #[error("host does not support this operation")]
    Unsupported,
    #[error("host rejected the request: {0}")]
    Rejected(String),
}

/// Host hypervisor control used for passthrough functions.
pub trait HostPciControl: Send + Sync {
    /// Number of concurrent DMA mappings the host allows for `resource`, if it reports one.
    fn dma_mapping_budget(&self, resource: HostResourceId) -> Option<u32>;

    /// Whether the host can deliver adapter interrupts for passthrough functions itself.
    fn forwarding_available(&self) -> bool {
        false
    }

    /// Current host-side handle for `function`.
    ///
    /// The host may change this behind the guest's back (e.g. across a host-side reset), so
    /// callers look it up at each use instead of caching it.
    fn host_handle(&self, function: HostFunctionId) -> Option<u32>;

    fn enable_forwarding(
        &self,
        _host_fh: u32,
        _isc: u8,
        _interrupts: u16,
        _route: &AdapterRoute,
    ) -> Result<(), HostControlError> {
        Err(HostControlError::Unsupported)
    }

    fn disable_forwarding(&self, _host_fh: u32) -> Result<(), HostControlError> {
        Err(HostControlError::Unsupported)
    }
}

/// Host control for a bridge with only emulated functions.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoHostControl;

impl HostPciControl for NoHostControl {
    fn dma_mapping_budget(&self, _resource: HostResourceId) -> Option<u32> {
        None
    }

    fn host_handle(&self, _function: HostFunctionId) -> Option<u32> {
        None
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdapterMapError {
    /// The platform has no indicator-mapping facility; delivery still works through guest
    /// memory.
    #[error("adapter indicator mapping is not supported")]
    Unsupported,
    #[error("indicator at {addr:#x} cannot be mapped")]
    Failed { addr: u64 },
}

/// Platform side of adapter (I/O) interrupt delivery.
pub trait AdapterInterrupts: Send + Sync {
    /// Raises a floating adapter interrupt for interruption subclass `isc`.
    fn inject(&self, isc: u8, io_int_word: u32);

    fn map_indicator(&self, _adapter_id: u32, _addr: u64) -> Result<(), AdapterMapError> {
        Err(AdapterMapError::Unsupported)
    }

    fn unmap_indicator(&self, _adapter_id: u32, _addr: u64) {}
}

/// Adapter-interruption word for a floating interrupt on subclass `isc`.
pub const fn io_int_word(isc: u8) -> u32 {
    ((isc as u32) << 27) | 0x8000_0000
}

/// Receives translation changes for a passthrough function so the host can mirror them.
pub trait DmaMapNotifier: Send + Sync {
    fn map(&self, iova: u64, translated_addr: u64, len: u64, perm: Permission);

    fn unmap(&self, iova: u64, len: u64);
}

/// Sink for the "condition changed" signal raised when an event is queued.
pub trait EventChannel: Send + Sync {
    fn condition_changed(&self);
}

/// Host-backed identity of a passthrough function.
#[derive(Clone)]
pub struct PassthroughInfo {
    pub resource: HostResourceId,
    pub function: HostFunctionId,
    pub notifier: Option<Arc<dyn DmaMapNotifier>>,
}

impl std::fmt::Debug for PassthroughInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PassthroughInfo")
            .field("resource", &self.resource)
            .field("function", &self.function)
            .field("notifier", &self.notifier.is_some())
            .finish()
    }
}

/// Everything outside the bridge it calls into.
#[derive(Clone)]
pub struct BridgeServices {
    pub host: Arc<dyn HostPciControl>,
    pub adapters: Arc<dyn AdapterInterrupts>,
    pub events: Arc<dyn EventChannel>,
}
