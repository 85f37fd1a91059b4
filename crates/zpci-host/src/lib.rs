//! Virtual zPCI host bridge.
//!
//! Guests on this platform do not touch PCI devices through memory-mapped I/O. They issue a
//! small set of privileged instructions (CLP, PCILG, PCISTG, PCISTB, RPCIT, MPCIFC and
//! STPCIFC) naming a function by its handle, and the bridge carries the access out on the
//! wrapped device model. Device DMA is translated through a guest-resident radix table and
//! MSI delivery goes through guest-memory indicator bits.
//!
//! [`HostBridge`] is the entry point. Every instruction handler takes the calling vCPU as a
//! [`inst::Vcpu`] and returns either a condition code or the program interrupt to raise.

#![forbid(unsafe_code)]

pub mod config;
pub mod device;
pub mod dma_limit;
pub mod doorbell;
pub mod error;
pub mod event;
pub mod fmb;
pub mod function;
pub mod handle;
pub mod host;
pub mod indicator;
pub mod inst;
pub mod iommu;
mod registry;

use std::sync::{Mutex, MutexGuard};

pub use config::{DmaWindowBounds, FunctionGroup, HostBridgeConfig};
pub use device::{BarAccessError, MsixLayout, PciFunctionDevice};
pub use doorbell::{doorbell_payload, DoorbellOutcome};
pub use error::{DmaError, RegistryError};
pub use event::{EventClass, EventQueue, PendingEvent};
pub use function::{DmaWindow, FunctionState, FunctionStatus, InterruptConfig, ZpciFunction};
pub use handle::FunctionHandle;
pub use host::{
    AdapterInterrupts, BridgeServices, DmaMapNotifier, EventChannel, HostPciControl,
    NoHostControl, PassthroughInfo,
};
pub use inst::{ConditionCode, ProgramInterrupt, Vcpu};
pub use iommu::DmaTarget;
pub use registry::{HostBridge, PlugRequest, SclpOutcome, SetFunctionOutcome, UnplugProgress};

/// Locks `m`, recovering the guard if a previous holder panicked.
///
/// Bridge state stays consistent across a panicking device model: every mutation is completed
/// before the guard is dropped.
pub(crate) fn lock<T: ?Sized>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}
