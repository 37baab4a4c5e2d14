//! Per-address-space page-table cache (PTC).
//!
//! Each address space keeps its coarse tables in an index ordered by the first
//! virtual address a table serves. Tables are created lazily on first access to
//! a range, found again by containment and cloned wholesale on fork. The ranges
//! in one index never overlap, so the only candidate for an address is the
//! entry with the greatest key not above it.

use alloc::collections::BTreeMap;

use crate::{
    Mmu, PageTableDescriptor, PageTableInfo, PageTableRequest, Ptm, VirtualAddress, VmError, arch,
};

/// Ordered index of the coarse tables of one address space.
#[derive(Debug, Default)]
pub struct PageTableCache {
    tables: BTreeMap<VirtualAddress, PageTableDescriptor>,
}

impl PageTableCache {
    /// Creates an empty cache.
    pub const fn new() -> Self {
        Self {
            tables: BTreeMap::new(),
        }
    }

    /// Returns the number of cached descriptors.
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Returns true if the cache holds no tables.
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Iterates over the cached tables in address order.
    pub fn iter(&self) -> impl Iterator<Item = PageTableInfo> + '_ {
        self.tables.values().map(|table| table.info())
    }

    /// Finds the table mapping `vaddr`.
    pub fn find(&self, vaddr: VirtualAddress) -> Option<PageTableInfo> {
        self.tables
            .range(..=vaddr)
            .next_back()
            .map(|(_, table)| table.info())
            .filter(|table| table.contains(vaddr))
    }

    /// Returns the table covering `[vaddr, vaddr + min_size)`, creating and
    /// attaching one under `master` if none maps `vaddr` yet.
    ///
    /// A new table starts at the section containing `vaddr` and spans as many
    /// sections as needed. The index never keeps a table that failed to attach.
    pub fn get_or_create<M: Mmu>(
        &mut self,
        ptm: &Ptm,
        mmu: &M,
        master: &PageTableInfo,
        vaddr: VirtualAddress,
        min_size: usize,
    ) -> Result<PageTableInfo, VmError> {
        let size = min_size.max(1);
        if let Some(table) = self.find(vaddr) {
            if !table.covers(vaddr, size) {
                log::error!(
                    "ptc: {:?} does not cover {} bytes at {}",
                    table,
                    size,
                    vaddr
                );
                return Err(VmError::Inconsistent);
            }
            return Ok(table);
        }

        let base = vaddr.section_base();
        let span = (vaddr - base) as u64 + size as u64;
        let coverage = span.div_ceil(arch::SECTION_SIZE as u64) * arch::SECTION_SIZE as u64;
        if base.as_usize() as u64 + coverage > arch::ADDRESS_SPACE_SIZE {
            return Err(VmError::OutOfRange);
        }
        if self.overlaps(base, coverage) {
            log::error!(
                "ptc: new table at {} ({} bytes) would overlap a cached table",
                base,
                coverage
            );
            return Err(VmError::Inconsistent);
        }

        let count = (coverage / arch::SECTION_SIZE as u64) as usize;
        let request = PageTableRequest::coarse(base, count, master.paddr(), master.domain());
        let table = ptm.alloc(&request)?;
        if let Err(err) = mmu.init_page_table(&table) {
            discard(ptm, table);
            return Err(err);
        }

        let info = table.info();
        self.tables.insert(base, table);
        if let Err(err) = mmu.attach_page_table(&info) {
            log::warn!("ptc: attaching {:?} failed: {}", info, err);
            if let Some(table) = self.tables.remove(&base) {
                discard(ptm, table);
            }
            return Err(err);
        }

        Ok(info)
    }

    /// Builds the cache of a forked address space.
    ///
    /// Every table gets a fresh copy with the same range under `master`, holding
    /// the same entries. On failure everything cloned so far is torn down.
    pub fn try_clone<M: Mmu>(
        &self,
        ptm: &Ptm,
        mmu: &M,
        master: &PageTableInfo,
    ) -> Result<Self, VmError> {
        let mut clone = Self::new();
        for table in self.tables.values() {
            if let Err(err) = clone.clone_table(ptm, mmu, master, table) {
                clone.destroy(ptm, mmu);
                return Err(err);
            }
        }
        Ok(clone)
    }

    fn clone_table<M: Mmu>(
        &mut self,
        ptm: &Ptm,
        mmu: &M,
        master: &PageTableInfo,
        source: &PageTableInfo,
    ) -> Result<(), VmError> {
        let request = PageTableRequest::coarse(
            source.vaddr(),
            source.count(),
            master.paddr(),
            master.domain(),
        );
        let table = ptm.alloc(&request)?;
        if let Err(err) = mmu
            .init_page_table(&table)
            .and_then(|()| mmu.copy_table_contents(&table, source))
        {
            discard(ptm, table);
            return Err(err);
        }

        let info = table.info();
        self.tables.insert(info.vaddr(), table);
        if let Err(err) = mmu.attach_page_table(&info) {
            if let Some(table) = self.tables.remove(&info.vaddr()) {
                discard(ptm, table);
            }
            return Err(err);
        }
        Ok(())
    }

    /// Detaches and frees the table mapping `vaddr`.
    pub fn release<M: Mmu>(
        &mut self,
        ptm: &Ptm,
        mmu: &M,
        vaddr: VirtualAddress,
    ) -> Result<(), VmError> {
        let base = self.find(vaddr).ok_or(VmError::OutOfRange)?.vaddr();
        let table = self.tables.remove(&base).ok_or(VmError::Inconsistent)?;
        mmu.detach_page_table(&table);
        ptm.free(table)
    }

    /// Detaches and frees every cached table.
    ///
    /// Teardown cannot fail; a table the allocator refuses is logged and dropped.
    pub fn destroy<M: Mmu>(&mut self, ptm: &Ptm, mmu: &M) {
        while let Some((_, table)) = self.tables.pop_first() {
            mmu.detach_page_table(&table);
            discard(ptm, table);
        }
    }

    /// Returns true if `[base, base + coverage)` intersects a cached range.
    fn overlaps(&self, base: VirtualAddress, coverage: u64) -> bool {
        let end = base.as_usize() as u64 + coverage;
        // Ranges are disjoint, so the last table starting before `end` also ends last.
        let last = match usize::try_from(end).ok().and_then(VirtualAddress::try_new) {
            Some(end) => self.tables.range(..end).next_back(),
            None => self.tables.iter().next_back(),
        };
        last.is_some_and(|(start, table)| {
            start.as_usize() as u64 + table.coverage() as u64 > base.as_usize() as u64
        })
    }
}

/// Gives a table that never made it into service back to the allocator.
fn discard(ptm: &Ptm, table: PageTableDescriptor) {
    if let Err(err) = ptm.free(table) {
        log::error!("ptc: failed to free page table: {}", err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::EmulatedMmu;
    use crate::{BootPtm, Domain, PhysicalAddress, Protection, RegionMapping};

    const BASE: PhysicalAddress = PhysicalAddress::new(0x0010_0000);
    const SIZE: usize = 64 * arch::PTM_BLOCK_SIZE;

    fn setup() -> (Ptm, EmulatedMmu, PageTableDescriptor) {
        let ptm = BootPtm::new(BASE, SIZE).unwrap().start();
        let mmu = EmulatedMmu::new(BASE, SIZE);
        let master = ptm.alloc(&PageTableRequest::master(Domain::USER)).unwrap();
        mmu.init_page_table(&master).unwrap();
        (ptm, mmu, master)
    }

    fn va(addr: usize) -> VirtualAddress {
        VirtualAddress::new(addr)
    }

    #[test]
    fn creates_once_then_finds() {
        let (ptm, mmu, master) = setup();
        let mut cache = PageTableCache::new();

        let table = cache
            .get_or_create(&ptm, &mmu, &master, va(0x1000_0000), 4096)
            .unwrap();
        assert_eq!(table.vaddr(), va(0x1000_0000));
        assert_eq!(table.count(), 1);
        assert_eq!(table.master(), master.paddr());
        assert_eq!(
            mmu.master_entry(&master, va(0x1000_0000)),
            crate::arch::coarse_link_entry(table.paddr(), Domain::USER.as_u8())
        );

        let stats = ptm.stats();
        let again = cache
            .get_or_create(&ptm, &mmu, &master, va(0x1000_8000), 4096)
            .unwrap();
        assert_eq!(again, table);
        assert_eq!(ptm.stats(), stats);
        assert_eq!(cache.len(), 1);

        assert_eq!(cache.find(va(0x100F_FFFF)), Some(table));
        assert_eq!(cache.find(va(0x1010_0000)), None);
        assert_eq!(cache.find(va(0x0FFF_FFFF)), None);
    }

    #[test]
    fn new_tables_span_sections() {
        let (ptm, mmu, master) = setup();
        let mut cache = PageTableCache::new();

        let table = cache
            .get_or_create(&ptm, &mmu, &master, va(0x100F_F000), 0x2000)
            .unwrap();
        assert_eq!(table.vaddr(), va(0x1000_0000));
        assert_eq!(table.count(), 2);
        assert!(table.covers(va(0x100F_F000), 0x2000));
        assert_eq!(cache.find(va(0x1010_0000)), Some(table));
        assert_eq!(ptm.stats().allocated_tables, 1 + 2);
    }

    #[test]
    fn short_or_overlapping_tables_are_inconsistent() {
        let (ptm, mmu, master) = setup();
        let mut cache = PageTableCache::new();
        cache
            .get_or_create(&ptm, &mmu, &master, va(0x1000_0000), 4096)
            .unwrap();
        cache
            .get_or_create(&ptm, &mmu, &master, va(0x2010_0000), 4096)
            .unwrap();
        let stats = ptm.stats();

        assert_eq!(
            cache.get_or_create(&ptm, &mmu, &master, va(0x100F_F000), 0x2000),
            Err(VmError::Inconsistent)
        );
        assert_eq!(
            cache.get_or_create(&ptm, &mmu, &master, va(0x2000_0000), 2 * arch::SECTION_SIZE),
            Err(VmError::Inconsistent)
        );
        assert_eq!(ptm.stats(), stats);
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn ranges_past_the_address_space_are_rejected() {
        let (ptm, mmu, master) = setup();
        let mut cache = PageTableCache::new();
        assert_eq!(
            cache.get_or_create(&ptm, &mmu, &master, va(0xFFF0_0000), 2 * arch::SECTION_SIZE),
            Err(VmError::OutOfRange)
        );

        // The last section itself is fine.
        let last = cache
            .get_or_create(&ptm, &mmu, &master, va(0xFFF0_0000), arch::SECTION_SIZE)
            .unwrap();
        assert_eq!(last.count(), 1);
        assert_eq!(cache.find(va(0xFFFF_FFFF)), Some(last));
    }

    #[test]
    fn attach_failure_leaves_nothing_behind() {
        let (ptm, mmu, master) = setup();
        let mut cache = PageTableCache::new();
        let stats = ptm.stats();

        mmu.fail_attach_after(0);
        assert_eq!(
            cache.get_or_create(&ptm, &mmu, &master, va(0x1000_0000), 4096),
            Err(VmError::AttachFailed)
        );
        assert!(cache.is_empty());
        assert_eq!(ptm.stats(), stats);
        assert_eq!(ptm.allocated_blocks(), arch::MASTER_BLOCKS);
    }

    #[test]
    fn clone_copies_every_table() {
        let (ptm, mmu, master) = setup();
        let mut cache = PageTableCache::new();
        for (vaddr, size) in [(0x1000_0000, 4096), (0x2000_0000, 0x0020_0000), (0x3000_0000, 1)] {
            cache
                .get_or_create(&ptm, &mmu, &master, va(vaddr), size)
                .unwrap();
        }
        let mapped = cache.find(va(0x2000_0000)).unwrap();
        let mapping = RegionMapping {
            vaddr: va(0x2010_0000),
            paddr: PhysicalAddress::new(0x0200_0000),
            pages: 4,
            prot: Protection::READ | Protection::WRITE | Protection::USER,
        };
        mmu.map_region(&mapped, &mapping).unwrap();

        let child_master = ptm.alloc(&PageTableRequest::master(Domain::USER)).unwrap();
        let clone = cache.try_clone(&ptm, &mmu, &child_master).unwrap();
        assert_eq!(clone.len(), cache.len());

        for (parent, child) in cache.iter().zip(clone.iter()) {
            assert_eq!(parent.vaddr(), child.vaddr());
            assert_eq!(parent.count(), child.count());
            assert_eq!(parent.size(), child.size());
            assert_ne!(parent.paddr(), child.paddr());
            assert_eq!(child.master(), child_master.paddr());
            assert_eq!(mmu.table_bytes(&parent), mmu.table_bytes(&child));
            assert_eq!(
                mmu.master_entry(&child_master, child.vaddr()),
                crate::arch::coarse_link_entry(child.paddr(), Domain::USER.as_u8())
            );
        }
        assert_ne!(mmu.page_entry(&mapped, va(0x2010_0000)), 0);
    }

    #[test]
    fn failed_clone_is_unwound() {
        let (ptm, mmu, master) = setup();
        let mut cache = PageTableCache::new();
        for vaddr in [0x1000_0000, 0x2000_0000, 0x3000_0000] {
            cache
                .get_or_create(&ptm, &mmu, &master, va(vaddr), 4096)
                .unwrap();
        }
        let child_master = ptm.alloc(&PageTableRequest::master(Domain::USER)).unwrap();
        let stats = ptm.stats();
        let attached = mmu.attached_tables();

        mmu.fail_attach_after(2);
        assert_eq!(
            cache.try_clone(&ptm, &mmu, &child_master).unwrap_err(),
            VmError::AttachFailed
        );
        assert_eq!(ptm.stats(), stats);
        assert_eq!(mmu.attached_tables(), attached);
        assert_eq!(cache.len(), 3);
    }

    #[test]
    fn release_and_destroy_return_blocks() {
        let (ptm, mmu, master) = setup();
        let before = ptm.stats();
        let mut cache = PageTableCache::new();
        for vaddr in [0x1000_0000, 0x2000_0000] {
            cache
                .get_or_create(&ptm, &mmu, &master, va(vaddr), 4096)
                .unwrap();
        }

        cache.release(&ptm, &mmu, va(0x1000_0ABC)).unwrap();
        assert_eq!(cache.find(va(0x1000_0000)), None);
        assert_eq!(mmu.master_entry(&master, va(0x1000_0000)), 0);
        assert_eq!(
            cache.release(&ptm, &mmu, va(0x1000_0000)),
            Err(VmError::OutOfRange)
        );

        cache.destroy(&ptm, &mmu);
        assert!(cache.is_empty());
        assert_eq!(ptm.stats(), before);
        assert_eq!(mmu.attached_tables(), 0);
    }
}
