//! Function measurement blocks: per-function activity counters the guest asks the bridge to
//! publish into its memory at a fixed interval.

use std::sync::atomic::{AtomicU64, Ordering};

use zpci_mem::{GuestMemory, GuestMemoryError, GuestMemoryResult};

use crate::event::{PendingEvent, ERR_MEASUREMENT_ADDRESS};
use crate::{lock, HostBridge};

pub const FMB_LEN: u8 = 48;
/// Low address bits carry a storage key; a block address with any of them set is refused.
pub const FMB_KEY_MASK: u64 = 0xf;

const FMB_SAMPLE: u64 = 4;
const FMB_LAST_UPDATE: u64 = 8;
const FMB_COUNTERS: u64 = 16;
const UPDATE_IN_PROGRESS: u64 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    Load = 0,
    Store = 1,
    StoreBlock = 2,
    Refresh = 3,
}

#[derive(Debug, Default)]
pub struct MeasurementCounters([AtomicU64; 4]);

impl MeasurementCounters {
    pub fn bump(&self, counter: Counter) {
        self.0[counter as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.0[counter as usize].load(Ordering::Relaxed)
    }

    pub(crate) fn clear(&self) {
        for c in &self.0 {
            c.store(0, Ordering::Relaxed);
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct Measurement {
    pub addr: u64,
    pub sample: u32,
    pub last_update: u64,
}

impl Measurement {
    pub fn is_active(&self) -> bool {
        self.addr != 0
    }

    /// Publishes one sample: flag the block as being updated, write the sample number and
    /// counters, then store the new timestamp with the flag cleared.
    pub fn publish<M: GuestMemory + ?Sized>(
        &mut self,
        mem: &M,
        counters: &MeasurementCounters,
        tod: u64,
    ) -> GuestMemoryResult<()> {
        let base = self.addr;
        if base.checked_add(u64::from(FMB_LEN)).is_none() {
            return Err(GuestMemoryError::OutOfRange {
                paddr: base,
                len: usize::from(FMB_LEN),
                size: mem.size(),
            });
        }
        mem.write_u64_be(base + FMB_LAST_UPDATE, self.last_update | UPDATE_IN_PROGRESS)?;
        mem.write_u32_be(base + FMB_SAMPLE, self.sample)?;
        self.sample = self.sample.wrapping_add(1);
        for (i, counter) in [
            Counter::Load,
            Counter::Store,
            Counter::StoreBlock,
            Counter::Refresh,
        ]
        .into_iter()
        .enumerate()
        {
            mem.write_u64_be(base + FMB_COUNTERS + 8 * i as u64, counters.get(counter))?;
        }
        self.last_update = tod << 1;
        mem.write_u64_be(base + FMB_LAST_UPDATE, self.last_update)
    }
}

impl HostBridge {
    /// Publishes every active measurement block. Driven by the platform timer at the
    /// group's measurement interval; `tod` is the current time-of-day clock value.
    pub fn update_measurements(&self, tod: u64) {
        for function in self.functions() {
            let mut inner = lock(&function.inner);
            if !inner.measurement.is_active() {
                continue;
            }
            let addr = inner.measurement.addr;
            if let Err(err) = inner
                .measurement
                .publish(&*self.mem, &function.counters, tod)
            {
                tracing::debug!(fid = function.fid, %err, "measurement block unreachable");
                inner.measurement = Measurement::default();
                function.counters.clear();
                let fh = inner.fh.raw();
                drop(inner);
                self.events.push(PendingEvent::error(
                    ERR_MEASUREMENT_ADDRESS,
                    fh,
                    function.fid,
                    addr,
                    0,
                ));
            }
        }
    }
}
