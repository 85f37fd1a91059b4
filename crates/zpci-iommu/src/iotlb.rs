use std::collections::BTreeMap;

use crate::IoTlbEntry;

/// Outcome of folding a fresh walk result into the shadow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoTlbUpdate {
    /// The shadow already held this exact translation.
    Unchanged,
    /// The walk reported an unmapped range that was not shadowed either.
    NotPresent,
    Mapped { new: IoTlbEntry },
    Remapped { old: IoTlbEntry, new: IoTlbEntry },
    Unmapped { old: IoTlbEntry },
}

/// Host-side shadow of the translations a function's guest has published via refresh.
///
/// Passthrough devices cannot walk guest tables on every access, so the shadow is what the
/// host mapping layer gets told about: every transition produced by [`IoTlb::update`] is
/// turned into a map or unmap notification by the caller.
#[derive(Debug, Default)]
pub struct IoTlb {
    entries: BTreeMap<u64, IoTlbEntry>,
}

impl IoTlb {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, iova: u64) -> Option<&IoTlbEntry> {
        self.entries.get(&iova)
    }

    /// True when applying `entry` would add a mapping the shadow does not hold yet.
    pub fn would_allocate(&self, entry: &IoTlbEntry) -> bool {
        entry.is_mapped() && !self.entries.contains_key(&entry.iova)
    }

    pub fn update(&mut self, entry: IoTlbEntry) -> IoTlbUpdate {
        if !entry.is_mapped() {
            return match self.entries.remove(&entry.iova) {
                Some(old) => IoTlbUpdate::Unmapped { old },
                None => IoTlbUpdate::NotPresent,
            };
        }
        match self.entries.insert(entry.iova, entry) {
            None => IoTlbUpdate::Mapped { new: entry },
            Some(old) if old == entry => IoTlbUpdate::Unchanged,
            Some(old) => IoTlbUpdate::Remapped { old, new: entry },
        }
    }

    /// Drops the shadowed translations with an IOVA in `[start, end)`, sorted by IOVA.
    pub fn remove_range(&mut self, start: u64, end: u64) -> Vec<IoTlbEntry> {
        if start >= end {
            return Vec::new();
        }
        let inside: Vec<u64> = self.entries.range(start..end).map(|(&iova, _)| iova).collect();
        inside
            .into_iter()
            .filter_map(|iova| self.entries.remove(&iova))
            .collect()
    }

    /// Drops every shadowed translation, returning them sorted by IOVA.
    pub fn drain(&mut self) -> Vec<IoTlbEntry> {
        std::mem::take(&mut self.entries).into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Permission;

    fn page(iova: u64, frame: u64, perm: Permission) -> IoTlbEntry {
        IoTlbEntry {
            iova,
            translated_addr: frame,
            addr_mask: 0xfff,
            perm,
        }
    }

    #[test]
    fn transitions() {
        let mut tlb = IoTlb::new();
        let a = page(0x1000, 0x9000, Permission::READ_WRITE);

        assert!(tlb.would_allocate(&a));
        assert_eq!(tlb.update(a), IoTlbUpdate::Mapped { new: a });
        assert!(!tlb.would_allocate(&a));
        assert_eq!(tlb.update(a), IoTlbUpdate::Unchanged);

        let b = page(0x1000, 0xa000, Permission::READ);
        assert_eq!(tlb.update(b), IoTlbUpdate::Remapped { old: a, new: b });

        let gone = page(0x1000, 0, Permission::NONE);
        assert_eq!(tlb.update(gone), IoTlbUpdate::Unmapped { old: b });
        assert_eq!(tlb.update(gone), IoTlbUpdate::NotPresent);
        assert!(tlb.is_empty());
    }

    #[test]
    fn drain_is_sorted() {
        let mut tlb = IoTlb::new();
        for iova in [0x3000u64, 0x1000, 0x2000] {
            tlb.update(page(iova, iova + 0x10_0000, Permission::READ_WRITE));
        }
        let drained: Vec<u64> = tlb.drain().iter().map(|e| e.iova).collect();
        assert_eq!(drained, vec![0x1000, 0x2000, 0x3000]);
        assert_eq!(tlb.len(), 0);
    }

    #[test]
    fn remove_range_is_half_open() {
        let mut tlb = IoTlb::new();
        for iova in [0x1000u64, 0x2000, 0x5000, 0x9000] {
            tlb.update(page(iova, iova, Permission::READ_WRITE));
        }
        let gone: Vec<u64> = tlb.remove_range(0x2000, 0x9000).iter().map(|e| e.iova).collect();
        assert_eq!(gone, vec![0x2000, 0x5000]);
        assert!(tlb.get(0x1000).is_some());
        assert!(tlb.get(0x9000).is_some());

        assert!(tlb.remove_range(0x9000, 0x9000).is_empty());
        assert!(tlb.remove_range(0xa000, 0x1000).is_empty());
        assert_eq!(tlb.len(), 2);
    }
}
