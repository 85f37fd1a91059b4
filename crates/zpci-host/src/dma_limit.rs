use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use crate::host::{HostPciControl, HostResourceId};
use crate::lock;

/// Remaining DMA mapping budget of one host resource.
#[derive(Debug)]
pub struct DmaLimitRecord {
    resource: HostResourceId,
    available: AtomicU32,
}

impl DmaLimitRecord {
    pub fn resource(&self) -> HostResourceId {
        self.resource
    }

    pub fn available(&self) -> u32 {
        self.available.load(Ordering::Acquire)
    }

    /// Takes one mapping from the budget; false when it is exhausted.
    pub fn try_take(&self) -> bool {
        self.available
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok()
    }

    pub fn give_back(&self) {
        self.available.fetch_add(1, Ordering::AcqRel);
    }
}

struct LimitEntry {
    record: Arc<DmaLimitRecord>,
    users: usize,
}

/// Reference-counted registry of per-resource DMA budgets.
///
/// Functions behind the same host resource share one record; the host is only asked for
/// the budget when the first of them attaches.
#[derive(Default)]
pub struct DmaLimiter {
    entries: Mutex<HashMap<HostResourceId, LimitEntry>>,
}

impl DmaLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `None` when the host does not report a budget for `resource`.
    pub fn acquire(
        &self,
        resource: HostResourceId,
        host: &dyn HostPciControl,
    ) -> Option<Arc<DmaLimitRecord>> {
        let mut entries = lock(&self.entries);
        if let Some(entry) = entries.get_mut(&resource) {
            entry.users += 1;
            return Some(entry.record.clone());
        }

        let budget = host.dma_mapping_budget(resource)?;
        tracing::debug!(resource = resource.0, budget, "new DMA limit record");
        let record = Arc::new(DmaLimitRecord {
            resource,
            available: AtomicU32::new(budget),
        });
        entries.insert(
            resource,
            LimitEntry {
                record: record.clone(),
                users: 1,
            },
        );
        Some(record)
    }

    pub fn release(&self, record: &Arc<DmaLimitRecord>) {
        let mut entries = lock(&self.entries);
        let Some(entry) = entries.get_mut(&record.resource) else {
            return;
        };
        entry.users -= 1;
        if entry.users == 0 {
            entries.remove(&record.resource);
            tracing::debug!(resource = record.resource.0, "DMA limit record freed");
        }
    }

    pub fn users(&self, resource: HostResourceId) -> usize {
        lock(&self.entries)
            .get(&resource)
            .map_or(0, |entry| entry.users)
    }
}
