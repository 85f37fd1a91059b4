//! Guest-memory indicator bit vectors used for adapter interrupt delivery.

use std::collections::HashMap;
use std::sync::Mutex;

use thiserror::Error;
use zpci_mem::{GuestMemory, GuestMemoryError, GuestMemoryResult};

use crate::host::{AdapterInterrupts, AdapterMapError};
use crate::lock;

/// Adapter type of PCI functions in adapter ids.
pub const PCI_ADAPTER_TYPE: u32 = 1;

pub const fn adapter_id(isc: u8) -> u32 {
    (PCI_ADAPTER_TYPE << 3) | isc as u32
}

/// Where a function's interrupts land in guest memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AdapterRoute {
    pub summary_addr: u64,
    pub summary_offset: u32,
    pub indicator_addr: u64,
    pub indicator_offset: u32,
    pub adapter_id: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IndicatorError {
    #[error(transparent)]
    Map(#[from] AdapterMapError),
}

/// A reference to a shared indicator area, obtained from [`IndicatorAllocator::get`].
#[derive(Debug, PartialEq, Eq)]
pub struct Indicator {
    addr: u64,
    len: u32,
}

impl Indicator {
    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

#[derive(Debug)]
struct IndicatorSlot {
    len: u32,
    refs: usize,
    mapped: bool,
}

/// Refcounted indicator areas keyed by guest address.
///
/// Several functions may share one summary byte (and, in principle, one indicator vector);
/// the platform mapping is established once and torn down with the last reference.
#[derive(Debug, Default)]
pub struct IndicatorAllocator {
    slots: Mutex<HashMap<u64, IndicatorSlot>>,
}

impl IndicatorAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, addr: u64, len: u32) -> Indicator {
        let mut slots = lock(&self.slots);
        let slot = slots.entry(addr).or_insert(IndicatorSlot {
            len,
            refs: 0,
            mapped: false,
        });
        slot.refs += 1;
        Indicator {
            addr,
            len: slot.len,
        }
    }

    /// Maps the indicator into the platform's adapter routing.
    ///
    /// A platform without mapping support is fine: delivery goes through guest memory anyway.
    pub fn map(
        &self,
        adapters: &dyn AdapterInterrupts,
        adapter_id: u32,
        indicator: &Indicator,
    ) -> Result<(), IndicatorError> {
        let mut slots = lock(&self.slots);
        let Some(slot) = slots.get_mut(&indicator.addr) else {
            return Ok(());
        };
        if slot.mapped {
            return Ok(());
        }
        match adapters.map_indicator(adapter_id, indicator.addr) {
            Ok(()) => {
                slot.mapped = true;
                Ok(())
            }
            Err(AdapterMapError::Unsupported) => Ok(()),
            Err(err) => {
                tracing::warn!(
                    addr = format_args!("{:#x}", indicator.addr),
                    %err,
                    "failed to map adapter indicator"
                );
                Err(err.into())
            }
        }
    }

    pub fn release(&self, adapters: &dyn AdapterInterrupts, adapter_id: u32, indicator: Indicator) {
        let mut slots = lock(&self.slots);
        let Some(slot) = slots.get_mut(&indicator.addr) else {
            return;
        };
        slot.refs -= 1;
        if slot.refs == 0 {
            if slot.mapped {
                adapters.unmap_indicator(adapter_id, indicator.addr);
            }
            slots.remove(&indicator.addr);
        }
    }

    pub fn refs(&self, addr: u64) -> usize {
        lock(&self.slots).get(&addr).map_or(0, |slot| slot.refs)
    }
}

/// Atomically sets bit `bit` (MSB-first numbering) of the vector at `base`.
///
/// Returns whether the bit was already set.
pub fn set_indicator_bit<M: GuestMemory + ?Sized>(
    mem: &M,
    base: u64,
    bit: u64,
) -> GuestMemoryResult<bool> {
    let addr = base
        .checked_add(bit / 8)
        .ok_or(GuestMemoryError::OutOfRange {
            paddr: base,
            len: (bit / 8 + 1) as usize,
            size: mem.size(),
        })?;
    let mask = 0x80u8 >> (bit % 8);
    let previous = mem.fetch_or_u8(addr, mask)?;
    Ok(previous & mask != 0)
}
