//! Address space management.
//!
//! An address space owns a master table, the cache of coarse tables hanging off
//! it and a fixed array of region slots. The kernel range is mapped by the
//! system table, which every master links to and no cache ever contains.

use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;

use crate::{
    Domain, Mmu, PageTableCache, PageTableDescriptor, PageTableInfo, PageTableRequest, Region,
    RegionMapping, Release, VirtualAddress, VmError, VmSystem,
};

/// Number of region slots in an address space.
pub const MAX_REGIONS: usize = 16;

/// First slot not reserved for a well-known region.
pub const FIRST_DYNAMIC_SLOT: usize = 4;

/// Well-known region slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(usize)]
pub enum RegionSlot {
    Code = 0,
    KernelStack = 1,
    Stack = 2,
    Heap = 3,
}

impl RegionSlot {
    /// Returns the slot index.
    pub const fn index(self) -> usize {
        self as usize
    }
}

bitflags! {
    /// How much of the hardware state `attach_region` updates right away.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AttachOptions: u32 {
        /// Create or locate the page table covering the region.
        const SET_PT = 1 << 0;
        /// Also write the region's entries into that table.
        const MAP = 1 << 1;
    }
}

struct Mappings {
    cache: PageTableCache,
    slots: [Option<Arc<Region>>; MAX_REGIONS],
    populated: usize,
}

impl Mappings {
    const fn new() -> Self {
        Self {
            cache: PageTableCache::new(),
            slots: [const { None }; MAX_REGIONS],
            populated: 0,
        }
    }
}

/// A process address space.
///
/// Every structure change happens under the address space's own lock, so a
/// fork sees a consistent snapshot of the cache and the slots.
pub struct AddressSpace<'vm, M: Mmu> {
    vm: &'vm VmSystem<M>,
    master: PageTableDescriptor,
    inner: spin::Mutex<Mappings>,
}

impl<'vm, M: Mmu> AddressSpace<'vm, M> {
    /// Creates an empty address space whose master already links the kernel tables.
    pub fn new(vm: &'vm VmSystem<M>) -> Result<Self, VmError> {
        let source = vm.system_master();
        let space = Self::with_master_copy(vm, &source)?;
        log::debug!("vm: new address space, master at {}", space.master.paddr());
        Ok(space)
    }

    /// Allocates a master holding a copy of `source` and wraps it in an empty space.
    fn with_master_copy(vm: &'vm VmSystem<M>, source: &PageTableInfo) -> Result<Self, VmError> {
        let ptm = vm.ptm();
        let mmu = vm.mmu();

        let master = ptm.alloc(&PageTableRequest::master(Domain::USER))?;
        if let Err(err) = mmu
            .init_page_table(&master)
            .and_then(|()| mmu.copy_table_contents(&master, source))
            .and_then(|()| mmu.attach_page_table(&master))
        {
            if let Err(free_err) = ptm.free(master) {
                log::error!("vm: failed to free master table: {}", free_err);
            }
            return Err(err);
        }

        Ok(Self {
            vm,
            master,
            inner: spin::Mutex::new(Mappings::new()),
        })
    }

    /// Returns the master table.
    pub fn master(&self) -> PageTableInfo {
        self.master.info()
    }

    /// Returns the page table covering `[vaddr, vaddr + min_size)`, creating it
    /// if needed. Kernel addresses resolve to the system table.
    pub fn page_table(
        &self,
        vaddr: VirtualAddress,
        min_size: usize,
    ) -> Result<PageTableInfo, VmError> {
        if self.vm.is_kernel_address(vaddr) {
            let table = self.vm.system_table();
            if !table.covers(vaddr, min_size.max(1)) {
                log::error!(
                    "vm: {} bytes at {} run past the kernel tables",
                    min_size,
                    vaddr
                );
                return Err(VmError::Inconsistent);
            }
            return Ok(table);
        }
        let mut inner = self.inner.lock();
        inner
            .cache
            .get_or_create(self.vm.ptm(), self.vm.mmu(), &self.master, vaddr, min_size)
    }

    /// Returns the page table mapping `vaddr`, if there is one.
    pub fn find_page_table(&self, vaddr: VirtualAddress) -> Option<PageTableInfo> {
        if self.vm.is_kernel_address(vaddr) {
            return Some(self.vm.system_table());
        }
        self.inner.lock().cache.find(vaddr)
    }

    /// Detaches and frees the page table mapping `vaddr`.
    ///
    /// The system table cannot be released through an address space.
    pub fn release_page_table(&self, vaddr: VirtualAddress) -> Result<(), VmError> {
        if self.vm.is_kernel_address(vaddr) {
            return Err(VmError::OutOfRange);
        }
        self.inner
            .lock()
            .cache
            .release(self.vm.ptm(), self.vm.mmu(), vaddr)
    }

    /// Returns the number of coarse tables owned by this address space.
    pub fn page_table_count(&self) -> usize {
        self.inner.lock().cache.len()
    }

    /// Installs `region` in `slot`, taking a reference to it.
    ///
    /// A region already in the slot is released. A region whose last reference
    /// is already gone is refused with [`VmError::Released`].
    pub fn attach_region(
        &self,
        slot: usize,
        region: &Arc<Region>,
        opts: AttachOptions,
    ) -> Result<(), VmError> {
        if slot >= MAX_REGIONS {
            return Err(VmError::OutOfRange);
        }
        let mut inner = self.inner.lock();
        self.attach_locked(&mut inner, slot, region, opts)
    }

    /// Installs `region` in the first free dynamic slot and returns the slot.
    pub fn insert_region(
        &self,
        region: &Arc<Region>,
        opts: AttachOptions,
    ) -> Result<usize, VmError> {
        let mut inner = self.inner.lock();
        let slot = (FIRST_DYNAMIC_SLOT..MAX_REGIONS)
            .find(|&slot| inner.slots[slot].is_none())
            .ok_or(VmError::OutOfMemory)?;
        self.attach_locked(&mut inner, slot, region, opts)?;
        Ok(slot)
    }

    fn attach_locked(
        &self,
        inner: &mut Mappings,
        slot: usize,
        region: &Arc<Region>,
        opts: AttachOptions,
    ) -> Result<(), VmError> {
        region.acquire()?;
        if let Err(err) = self.wire_region(inner, region, opts) {
            region.release();
            return Err(err);
        }

        match inner.slots[slot].replace(Arc::clone(region)) {
            Some(displaced) => {
                displaced.release();
            }
            None => inner.populated += 1,
        }
        Ok(())
    }

    fn wire_region(
        &self,
        inner: &mut Mappings,
        region: &Region,
        opts: AttachOptions,
    ) -> Result<(), VmError> {
        if opts.intersects(AttachOptions::SET_PT | AttachOptions::MAP) {
            let mapping = region.mapping();
            let table = if self.vm.is_kernel_address(mapping.vaddr) {
                self.vm.system_table()
            } else {
                inner.cache.get_or_create(
                    self.vm.ptm(),
                    self.vm.mmu(),
                    &self.master,
                    mapping.vaddr,
                    mapping.size(),
                )?
            };
            if opts.contains(AttachOptions::MAP) {
                self.vm.mmu().map_region(&table, &mapping)?;
            }
        }
        Ok(())
    }

    /// Removes the region in `slot` and drops the slot's reference to it.
    ///
    /// With [`AttachOptions::MAP`] the region's entries are cleared as well.
    pub fn detach_region(
        &self,
        slot: usize,
        opts: AttachOptions,
    ) -> Result<Option<Release>, VmError> {
        if slot >= MAX_REGIONS {
            return Err(VmError::OutOfRange);
        }

        let mut inner = self.inner.lock();
        let Some(region) = inner.slots[slot].take() else {
            return Ok(None);
        };
        inner.populated -= 1;

        if opts.contains(AttachOptions::MAP) {
            let mapping = region.mapping();
            if let Some(table) = self.table_for(&inner.cache, &mapping) {
                self.vm.mmu().unmap_region(&table, &mapping);
            }
        }
        Ok(Some(region.release()))
    }

    /// Returns the region in `slot`.
    pub fn region(&self, slot: usize) -> Option<Arc<Region>> {
        self.inner.lock().slots.get(slot)?.clone()
    }

    /// Returns the region containing `vaddr`.
    pub fn find_region(&self, vaddr: VirtualAddress) -> Option<Arc<Region>> {
        self.inner
            .lock()
            .slots
            .iter()
            .flatten()
            .find(|region| region.contains(vaddr))
            .cloned()
    }

    /// Returns the number of populated slots.
    pub fn region_count(&self) -> usize {
        self.inner.lock().populated
    }

    /// Creates the address space of a forked process.
    ///
    /// The child gets a copy of the master, a copy of every cached table and,
    /// for every populated slot, whatever [`Region::clone_for_fork`] hands out.
    /// Duplicated regions are remapped in the child; shared copy-on-write
    /// regions are remapped read-only in both. If anything fails the child is
    /// torn down completely and shared regions get their protection and parent
    /// entries back before the error is returned.
    pub fn try_clone(&self) -> Result<Self, VmError> {
        let ptm = self.vm.ptm();
        let mmu = self.vm.mmu();
        let parent = self.inner.lock();

        let mut child = Self::with_master_copy(self.vm, &self.master)?;
        let cache = parent.cache.try_clone(ptm, mmu, &child.master)?;

        let child_master = child.master();
        let inner = child.inner.get_mut();
        inner.cache = cache;

        let mut shared = Vec::new();
        let mut remapped = 0;
        if let Err(err) = self.fork_regions(&parent, inner, &mut shared, &mut remapped) {
            for (i, (region, before)) in shared.iter().enumerate().rev() {
                region.set_protection(before.prot);
                if i >= remapped {
                    continue;
                }
                let Some(table) = self.table_for(&parent.cache, before) else {
                    continue;
                };
                if let Err(restore_err) = mmu.map_region(&table, before) {
                    log::error!(
                        "vm: failed to restore mapping at {}: {}",
                        before.vaddr,
                        restore_err
                    );
                }
            }
            return Err(err);
        }

        log::debug!(
            "vm: forked address space {} into {} ({} tables, {} regions)",
            self.master.paddr(),
            child_master.paddr(),
            inner.cache.len(),
            inner.populated
        );
        Ok(child)
    }

    /// Fills the child's slots and rewrites the affected entries.
    ///
    /// Nothing in the parent changes until every region has been cloned and
    /// mapped in the child. Shared regions are recorded with their mapping
    /// from before the fork, and `remapped` counts how many of them may
    /// already have read-only entries in the parent.
    fn fork_regions(
        &self,
        parent: &Mappings,
        child: &mut Mappings,
        shared: &mut Vec<(Arc<Region>, RegionMapping)>,
        remapped: &mut usize,
    ) -> Result<(), VmError> {
        let mmu = self.vm.mmu();

        for (slot, region) in parent.slots.iter().enumerate() {
            let Some(region) = region else {
                continue;
            };

            let before = region.mapping();
            let copy = region.clone_for_fork()?;
            if Arc::ptr_eq(region, &copy) {
                shared.push((Arc::clone(region), before));
            }
            child.slots[slot] = Some(copy);
            child.populated += 1;
        }

        for region in child.slots.iter().flatten() {
            let mapping = region.mapping();
            if let Some(table) = self.table_for(&child.cache, &mapping) {
                mmu.map_region(&table, &mapping)?;
            }
        }

        for (region, _) in shared.iter() {
            let mapping = region.mapping();
            *remapped += 1;
            if let Some(table) = self.table_for(&parent.cache, &mapping) {
                mmu.map_region(&table, &mapping)?;
            }
        }
        Ok(())
    }

    /// Tears the address space down: frees the cached tables, drops every
    /// slot's region reference and frees the master.
    pub fn destroy(self) {
        drop(self);
    }

    /// Returns the cached table mapping all of `mapping`, skipping the kernel
    /// range, whose entries are shared by every address space.
    fn table_for(
        &self,
        cache: &PageTableCache,
        mapping: &RegionMapping,
    ) -> Option<PageTableInfo> {
        if self.vm.is_kernel_address(mapping.vaddr) {
            return None;
        }
        cache
            .find(mapping.vaddr)
            .filter(|table| table.covers(mapping.vaddr, mapping.size()))
    }
}

impl<M: Mmu> Drop for AddressSpace<'_, M> {
    fn drop(&mut self) {
        let ptm = self.vm.ptm();
        let mmu = self.vm.mmu();
        let inner = self.inner.get_mut();

        inner.cache.destroy(ptm, mmu);
        for region in inner.slots.iter_mut().filter_map(Option::take) {
            region.release();
        }
        inner.populated = 0;

        mmu.detach_page_table(&self.master);
        if let Err(err) = ptm.release(&self.master) {
            log::error!("vm: failed to free master table {:?}: {}", self.master, err);
        }
        log::debug!("vm: destroyed address space, master at {}", self.master.paddr());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{EmulatedDynmem, EmulatedMmu, small_page_entry};
    use crate::{Backing, PhysicalAddress, Protection, VmConfig, arch};

    fn boot() -> VmSystem<EmulatedMmu> {
        let config = VmConfig::default();
        VmSystem::boot(config, EmulatedMmu::new(config.ptm_base, config.ptm_size))
    }

    fn va(addr: usize) -> VirtualAddress {
        VirtualAddress::new(addr)
    }

    fn anonymous(dynmem: &Arc<EmulatedDynmem>, vaddr: usize, pages: usize) -> Arc<Region> {
        Region::new(
            RegionMapping {
                vaddr: va(vaddr),
                paddr: dynmem.allocate(pages).unwrap(),
                pages,
                prot: Protection::READ | Protection::WRITE | Protection::USER,
            },
            Backing::Anonymous(dynmem.clone()),
        )
    }

    fn framebuffer(vaddr: usize) -> Arc<Region> {
        Region::new(
            RegionMapping {
                vaddr: va(vaddr),
                paddr: PhysicalAddress::new(0x3000_0000),
                pages: 4,
                prot: Protection::READ | Protection::WRITE | Protection::USER | Protection::COW,
            },
            Backing::Device,
        )
    }

    #[test]
    fn new_spaces_share_the_kernel_tables() {
        let vm = boot();
        let space = vm.new_address_space().unwrap();

        let master = space.master();
        assert_eq!(master.domain(), Domain::USER);
        assert_ne!(master.paddr(), vm.system_master().paddr());
        assert_eq!(
            vm.mmu().master_entry(&master, va(0)),
            vm.mmu().master_entry(&vm.system_master(), va(0))
        );
        assert_ne!(vm.mmu().master_entry(&master, va(0)), 0);

        assert_eq!(space.page_table(va(0x0000_2000), 4096), Ok(vm.system_table()));
        assert_eq!(space.find_page_table(va(0x0008_0000)), Some(vm.system_table()));
        assert_eq!(space.page_table_count(), 0);
        assert_eq!(space.region_count(), 0);
        assert_eq!(space.release_page_table(va(0)), Err(VmError::OutOfRange));
    }

    #[test]
    fn kernel_requests_past_the_system_table_are_inconsistent() {
        let vm = boot();
        let space = vm.new_address_space().unwrap();
        let end = vm.config().kernel_size;

        assert_eq!(
            space.page_table(va(end - arch::PAGE_SIZE), arch::PAGE_SIZE),
            Ok(vm.system_table())
        );
        assert_eq!(
            space.page_table(va(end - arch::PAGE_SIZE), 2 * arch::PAGE_SIZE),
            Err(VmError::Inconsistent)
        );
        assert_eq!(space.page_table_count(), 0);
    }

    #[test]
    fn create_find_clone_destroy() {
        let vm = boot();
        let before = vm.ptm().stats();

        let a = vm.new_address_space().unwrap();
        let table = a.page_table(va(0x1000_0000), 4096).unwrap();
        let stats = vm.ptm().stats();
        assert_eq!(a.page_table(va(0x1000_0000), 4096).unwrap(), table);
        assert_eq!(vm.ptm().stats(), stats);

        let b = a.try_clone().unwrap();
        let cloned = b.find_page_table(va(0x1000_0000)).unwrap();
        assert_ne!(cloned.paddr(), table.paddr());
        assert_eq!(cloned.size(), table.size());
        assert_eq!(b.page_table_count(), a.page_table_count());

        a.destroy();
        b.destroy();
        assert_eq!(vm.ptm().stats(), before);
        assert_eq!(vm.ptm().allocated_blocks(), arch::MASTER_BLOCKS + 1);
    }

    #[test]
    fn attach_map_and_detach() {
        let vm = boot();
        let dynmem = Arc::new(EmulatedDynmem::new());
        let space = vm.new_address_space().unwrap();
        let code = anonymous(&dynmem, 0x1000_0000, 2);

        space
            .attach_region(
                RegionSlot::Code.index(),
                &code,
                AttachOptions::SET_PT | AttachOptions::MAP,
            )
            .unwrap();
        assert_eq!(code.refcount(), 2);
        assert_eq!(space.region_count(), 1);
        assert_eq!(space.page_table_count(), 1);

        let mapping = code.mapping();
        let table = space.find_page_table(mapping.vaddr).unwrap();
        assert_eq!(
            vm.mmu().page_entry(&table, mapping.vaddr + arch::PAGE_SIZE),
            small_page_entry(mapping.paddr + arch::PAGE_SIZE, mapping.prot)
        );
        assert!(Arc::ptr_eq(
            &space.find_region(mapping.vaddr + 0x1800).unwrap(),
            &code
        ));

        // The creator's hold goes away; the slot keeps the region alive.
        assert_eq!(code.release(), Release::Held(1));
        assert_eq!(
            space.detach_region(RegionSlot::Code.index(), AttachOptions::MAP),
            Ok(Some(Release::Freed))
        );
        assert_eq!(dynmem.released(), 1);
        assert_eq!(vm.mmu().page_entry(&table, mapping.vaddr), 0);
        assert_eq!(space.region_count(), 0);
        assert_eq!(
            space.detach_region(RegionSlot::Code.index(), AttachOptions::MAP),
            Ok(None)
        );
    }

    #[test]
    fn attach_release_restores_refcount() {
        let vm = boot();
        let dynmem = Arc::new(EmulatedDynmem::new());
        let space = vm.new_address_space().unwrap();
        let heap = anonymous(&dynmem, 0x2000_0000, 1);

        for slot in FIRST_DYNAMIC_SLOT..FIRST_DYNAMIC_SLOT + 3 {
            space.attach_region(slot, &heap, AttachOptions::empty()).unwrap();
        }
        assert_eq!(heap.refcount(), 4);
        for slot in FIRST_DYNAMIC_SLOT..FIRST_DYNAMIC_SLOT + 3 {
            space.detach_region(slot, AttachOptions::empty()).unwrap();
        }
        assert_eq!(heap.refcount(), 1);
        assert_eq!(dynmem.released(), 0);
        assert_eq!(space.page_table_count(), 0);
    }

    #[test]
    fn displaced_regions_are_released() {
        let vm = boot();
        let dynmem = Arc::new(EmulatedDynmem::new());
        let space = vm.new_address_space().unwrap();
        let old = anonymous(&dynmem, 0x2000_0000, 1);
        let new = anonymous(&dynmem, 0x2000_0000, 1);

        let heap = RegionSlot::Heap.index();
        space.attach_region(heap, &old, AttachOptions::empty()).unwrap();
        old.release();
        space.attach_region(heap, &new, AttachOptions::empty()).unwrap();

        assert_eq!(old.refcount(), 0);
        assert_eq!(dynmem.released(), 1);
        assert_eq!(space.region_count(), 1);
        assert!(Arc::ptr_eq(&space.region(heap).unwrap(), &new));
    }

    #[test]
    fn released_regions_are_refused() {
        let vm = boot();
        let dynmem = Arc::new(EmulatedDynmem::new());
        let space = vm.new_address_space().unwrap();
        let heap = anonymous(&dynmem, 0x2000_0000, 1);
        let stats = vm.ptm().stats();

        assert_eq!(heap.release(), Release::Freed);
        assert_eq!(
            space.attach_region(
                RegionSlot::Heap.index(),
                &heap,
                AttachOptions::SET_PT | AttachOptions::MAP
            ),
            Err(VmError::Released)
        );
        assert_eq!(
            space.insert_region(&heap, AttachOptions::empty()),
            Err(VmError::Released)
        );

        assert_eq!(heap.refcount(), 0);
        assert_eq!(space.region_count(), 0);
        assert_eq!(space.page_table_count(), 0);
        assert_eq!(vm.ptm().stats(), stats);
        assert_eq!(
            space.detach_region(RegionSlot::Heap.index(), AttachOptions::MAP),
            Ok(None)
        );
        assert_eq!(dynmem.released(), 1);
    }

    #[test]
    fn slot_bounds() {
        let vm = boot();
        let dynmem = Arc::new(EmulatedDynmem::new());
        let space = vm.new_address_space().unwrap();
        let region = anonymous(&dynmem, 0x2000_0000, 1);

        assert_eq!(
            space.attach_region(MAX_REGIONS, &region, AttachOptions::empty()),
            Err(VmError::OutOfRange)
        );
        assert_eq!(
            space.detach_region(MAX_REGIONS, AttachOptions::empty()),
            Err(VmError::OutOfRange)
        );
        assert!(space.region(MAX_REGIONS).is_none());

        for expected in FIRST_DYNAMIC_SLOT..MAX_REGIONS {
            assert_eq!(space.insert_region(&region, AttachOptions::empty()), Ok(expected));
        }
        assert_eq!(
            space.insert_region(&region, AttachOptions::empty()),
            Err(VmError::OutOfMemory)
        );
        assert_eq!(region.refcount(), 1 + MAX_REGIONS - FIRST_DYNAMIC_SLOT);
        assert!(space.region(RegionSlot::Code.index()).is_none());
    }

    #[test]
    fn failed_map_leaves_slot_empty() {
        let vm = boot();
        let dynmem = Arc::new(EmulatedDynmem::new());
        let space = vm.new_address_space().unwrap();
        space.page_table(va(0x2000_0000), 4096).unwrap();

        // Crosses out of the single-section table that already maps its start.
        let region = anonymous(&dynmem, 0x200F_F000, 2);
        assert_eq!(
            space.attach_region(RegionSlot::Heap.index(), &region, AttachOptions::MAP),
            Err(VmError::Inconsistent)
        );
        assert_eq!(region.refcount(), 1);
        assert_eq!(space.region_count(), 0);
    }

    #[test]
    fn fork_duplicates_and_remaps_anonymous_regions() {
        let vm = boot();
        let dynmem = Arc::new(EmulatedDynmem::new());
        let parent = vm.new_address_space().unwrap();
        let stack = anonymous(&dynmem, 0x7FF0_0000, 4);
        parent
            .attach_region(
                RegionSlot::Stack.index(),
                &stack,
                AttachOptions::SET_PT | AttachOptions::MAP,
            )
            .unwrap();
        stack.release();

        let child = parent.try_clone().unwrap();
        assert_eq!(dynmem.duplicated(), 1);
        assert_eq!(child.region_count(), 1);

        let copy = child.region(RegionSlot::Stack.index()).unwrap();
        assert!(!Arc::ptr_eq(&copy, &stack));
        assert_eq!(copy.refcount(), 1);
        assert_eq!(stack.refcount(), 1);

        let vaddr = stack.mapping().vaddr;
        let parent_table = parent.find_page_table(vaddr).unwrap();
        let child_table = child.find_page_table(vaddr).unwrap();
        assert_eq!(
            vm.mmu().page_entry(&parent_table, vaddr),
            small_page_entry(stack.mapping().paddr, stack.mapping().prot)
        );
        assert_eq!(
            vm.mmu().page_entry(&child_table, vaddr),
            small_page_entry(copy.mapping().paddr, copy.mapping().prot)
        );

        child.destroy();
        assert_eq!(dynmem.released(), 1);
        assert_eq!(stack.refcount(), 1);
    }

    #[test]
    fn fork_shares_cow_device_regions() {
        let vm = boot();
        let parent = vm.new_address_space().unwrap();
        let fb = framebuffer(0x4000_0000);
        let slot = parent
            .insert_region(&fb, AttachOptions::SET_PT | AttachOptions::MAP)
            .unwrap();
        assert_eq!(fb.release(), Release::Held(1));

        let child = parent.try_clone().unwrap();
        assert!(Arc::ptr_eq(&child.region(slot).unwrap(), &fb));
        assert_eq!(fb.refcount(), 2);

        let mapping = fb.mapping();
        assert!(!mapping.prot.contains(Protection::WRITE));
        let read_only = small_page_entry(mapping.paddr, mapping.prot);
        for space in [&parent, &child] {
            let table = space.find_page_table(mapping.vaddr).unwrap();
            assert_eq!(vm.mmu().page_entry(&table, mapping.vaddr), read_only);
        }

        child.destroy();
        assert_eq!(fb.refcount(), 1);
        parent.destroy();
        // Device memory is never released.
        assert_eq!(fb.refcount(), 1);
        assert_eq!(fb.release(), Release::Pinned);
    }

    #[test]
    fn failed_fork_restores_shared_regions() {
        let vm = boot();
        let parent = vm.new_address_space().unwrap();
        let fb = framebuffer(0x4000_0000);
        parent
            .insert_region(&fb, AttachOptions::SET_PT | AttachOptions::MAP)
            .unwrap();
        parent
            .attach_region(FIRST_DYNAMIC_SLOT + 1, &fb, AttachOptions::empty())
            .unwrap();
        fb.release();
        let device = Region::new(
            RegionMapping {
                vaddr: va(0x5000_0000),
                paddr: PhysicalAddress::new(0x3800_0000),
                pages: 1,
                prot: Protection::READ | Protection::WRITE,
            },
            Backing::Device,
        );
        assert_eq!(
            parent.insert_region(&device, AttachOptions::empty()),
            Ok(FIRST_DYNAMIC_SLOT + 2)
        );

        let before = fb.mapping();
        let table = parent.find_page_table(before.vaddr).unwrap();
        let entry = vm.mmu().page_entry(&table, before.vaddr);
        let stats = vm.ptm().stats();

        assert_eq!(parent.try_clone().err(), Some(VmError::NotClonable));
        assert_eq!(fb.mapping(), before);
        assert!(fb.mapping().prot.contains(Protection::WRITE));
        assert_eq!(vm.mmu().page_entry(&table, before.vaddr), entry);
        assert_eq!(fb.refcount(), 2);
        assert_eq!(vm.ptm().stats(), stats);
    }

    #[test]
    fn fork_rejects_plain_device_regions() {
        let vm = boot();
        let parent = vm.new_address_space().unwrap();
        let device = Region::new(
            RegionMapping {
                vaddr: va(0x4000_0000),
                paddr: PhysicalAddress::new(0x3000_0000),
                pages: 1,
                prot: Protection::READ | Protection::WRITE,
            },
            Backing::Device,
        );
        parent.insert_region(&device, AttachOptions::empty()).unwrap();
        let stats = vm.ptm().stats();

        assert_eq!(parent.try_clone().err(), Some(VmError::NotClonable));
        assert_eq!(vm.ptm().stats(), stats);
        assert_eq!(device.refcount(), 2);
    }

    #[test]
    fn failed_fork_leaves_no_trace() {
        let vm = boot();
        let dynmem = Arc::new(EmulatedDynmem::new());
        let parent = vm.new_address_space().unwrap();
        let regions = [
            anonymous(&dynmem, 0x1000_0000, 2),
            anonymous(&dynmem, 0x2000_0000, 2),
        ];
        for region in &regions {
            parent
                .insert_region(region, AttachOptions::SET_PT | AttachOptions::MAP)
                .unwrap();
        }
        let kstack = Region::new(
            RegionMapping {
                vaddr: va(0x0008_0000),
                paddr: dynmem.allocate(2).unwrap(),
                pages: 2,
                prot: Protection::READ | Protection::WRITE,
            },
            Backing::KernelStack(dynmem.clone()),
        );
        parent
            .attach_region(RegionSlot::KernelStack.index(), &kstack, AttachOptions::SET_PT)
            .unwrap();

        let stats = vm.ptm().stats();
        let attached = vm.mmu().attached_tables();

        // A table attach fails halfway through the cache clone.
        vm.mmu().fail_attach_after(1);
        assert_eq!(parent.try_clone().err(), Some(VmError::AttachFailed));
        vm.mmu().clear_attach_failure();
        assert_eq!(vm.ptm().stats(), stats);
        assert_eq!(vm.mmu().attached_tables(), attached);

        // The backing allocator cannot copy the kernel stack.
        let released = dynmem.released();
        dynmem.set_exhausted(true);
        assert_eq!(parent.try_clone().err(), Some(VmError::OutOfMemory));
        dynmem.set_exhausted(false);
        assert_eq!(vm.ptm().stats(), stats);
        assert_eq!(dynmem.released(), released);
        for region in &regions {
            assert_eq!(region.refcount(), 2);
        }
        assert_eq!(kstack.refcount(), 2);

        assert_eq!(parent.region_count(), 3);
        assert_eq!(parent.page_table_count(), 2);
        let child = parent.try_clone().unwrap();
        assert_eq!(child.region_count(), 3);
    }
}
