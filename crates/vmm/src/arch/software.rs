//! Software emulation of the MMU binding and the dynamic memory allocator.
//!
//! This lets the bookkeeping run on any host. [`EmulatedMmu`] keeps a byte
//! buffer standing in for the physical page-table region and writes ARMv6-shaped
//! descriptors into it, so tests can look at the actual table contents.
//! [`EmulatedDynmem`] hands out physical addresses for region backing and counts
//! what the VM subsystem asks of it.

use alloc::vec;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use super::{COARSE_TABLE_SIZE, PAGE_SIZE};
use crate::{
    BackingAllocator, Mmu, PageTableInfo, PageTableKind, PhysicalAddress, Protection,
    RegionMapping, VirtualAddress, VmError,
};

/// First-level descriptor type bits for a coarse table link.
const L1_COARSE: u32 = 0b01;

/// Second-level descriptor type bits for a small page.
const L2_SMALL_PAGE: u32 = 0b10;

/// Execute-never bit of a small page descriptor.
const L2_XN: u32 = 1 << 0;

/// Encodes the access permission bits (APX, AP[1:0]) of a small page.
fn access_bits(prot: Protection) -> u32 {
    let writable = prot.contains(Protection::WRITE);
    match (prot.contains(Protection::USER), writable) {
        (true, true) => 0b11 << 4,
        (true, false) => 0b10 << 4,
        (false, true) => 0b01 << 4,
        (false, false) => (1 << 9) | (0b01 << 4),
    }
}

/// Encodes a small page descriptor.
pub fn small_page_entry(paddr: PhysicalAddress, prot: Protection) -> u32 {
    let mut entry = paddr.as_usize() as u32 | access_bits(prot) | L2_SMALL_PAGE;
    if !prot.contains(Protection::EXECUTE) {
        entry |= L2_XN;
    }
    entry
}

/// Encodes a first-level descriptor linking a coarse table.
pub fn coarse_link_entry(table: PhysicalAddress, domain: u8) -> u32 {
    table.as_usize() as u32 | (u32::from(domain) << 5) | L1_COARSE
}

/// Emulated page-table region and MMU.
pub struct EmulatedMmu {
    base: PhysicalAddress,
    size: usize,
    memory: spin::Mutex<Vec<u8>>,
    /// Number of coarse attaches that will still succeed.
    attach_budget: AtomicUsize,
    attached: AtomicUsize,
}

impl EmulatedMmu {
    /// Creates an emulated region of `size` bytes at `base`.
    pub fn new(base: PhysicalAddress, size: usize) -> Self {
        Self {
            base,
            size,
            memory: spin::Mutex::new(vec![0; size]),
            attach_budget: AtomicUsize::new(usize::MAX),
            attached: AtomicUsize::new(0),
        }
    }

    /// Lets the next `successes` coarse attaches succeed and fails every one after.
    pub fn fail_attach_after(&self, successes: usize) {
        self.attach_budget.store(successes, Ordering::Release);
    }

    /// Makes every attach succeed again.
    pub fn clear_attach_failure(&self) {
        self.attach_budget.store(usize::MAX, Ordering::Release);
    }

    /// Returns the number of coarse tables currently linked into any master.
    pub fn attached_tables(&self) -> usize {
        self.attached.load(Ordering::Acquire)
    }

    /// Returns the raw bytes of a table.
    pub fn table_bytes(&self, table: &PageTableInfo) -> Vec<u8> {
        match self.offset(table.paddr(), table.size()) {
            Ok(offset) => self.memory.lock()[offset..offset + table.size()].to_vec(),
            Err(_) => Vec::new(),
        }
    }

    /// Returns the first-level entry of `master` for the section containing `vaddr`.
    pub fn master_entry(&self, master: &PageTableInfo, vaddr: VirtualAddress) -> u32 {
        self.read(master.paddr() + vaddr.section_index() * 4)
    }

    /// Returns the second-level entry of `table` for the page containing `vaddr`.
    pub fn page_entry(&self, table: &PageTableInfo, vaddr: VirtualAddress) -> u32 {
        let index = (vaddr - table.vaddr()) / PAGE_SIZE;
        self.read(table.paddr() + index * 4)
    }

    fn offset(&self, addr: PhysicalAddress, len: usize) -> Result<usize, VmError> {
        if addr < self.base || addr - self.base + len > self.size {
            return Err(VmError::OutOfRange);
        }
        Ok(addr - self.base)
    }

    fn read(&self, addr: PhysicalAddress) -> u32 {
        let Ok(offset) = self.offset(addr, 4) else {
            return 0;
        };
        let memory = self.memory.lock();
        let mut bytes = [0; 4];
        bytes.copy_from_slice(&memory[offset..offset + 4]);
        u32::from_le_bytes(bytes)
    }

    fn write_entries(
        &self,
        first: PhysicalAddress,
        entries: impl Iterator<Item = u32>,
        count: usize,
    ) -> Result<(), VmError> {
        let offset = self.offset(first, count * 4)?;
        let mut memory = self.memory.lock();
        for (i, entry) in entries.take(count).enumerate() {
            let at = offset + i * 4;
            memory[at..at + 4].copy_from_slice(&entry.to_le_bytes());
        }
        Ok(())
    }

    /// Locates the entries of `table` that map `mapping`.
    fn page_slot(
        table: &PageTableInfo,
        mapping: &RegionMapping,
    ) -> Result<PhysicalAddress, VmError> {
        if table.kind() != PageTableKind::Coarse || !table.covers(mapping.vaddr, mapping.size()) {
            return Err(VmError::OutOfRange);
        }
        let index = (mapping.vaddr - table.vaddr()) / PAGE_SIZE;
        Ok(table.paddr() + index * 4)
    }
}

impl Mmu for EmulatedMmu {
    fn init_page_table(&self, table: &PageTableInfo) -> Result<(), VmError> {
        let offset = self.offset(table.paddr(), table.size())?;
        self.memory.lock()[offset..offset + table.size()].fill(0);
        Ok(())
    }

    fn attach_page_table(&self, table: &PageTableInfo) -> Result<(), VmError> {
        if table.kind() == PageTableKind::Master {
            return Ok(());
        }

        let granted = self
            .attach_budget
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |budget| match budget {
                0 => None,
                usize::MAX => Some(usize::MAX),
                n => Some(n - 1),
            });
        if granted.is_err() {
            return Err(VmError::AttachFailed);
        }

        let domain = table.domain().as_u8();
        let links = (0..table.count())
            .map(|i| coarse_link_entry(table.paddr() + i * COARSE_TABLE_SIZE, domain));
        let first = table.master() + table.vaddr().section_index() * 4;
        self.write_entries(first, links, table.count())?;
        self.attached.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn detach_page_table(&self, table: &PageTableInfo) {
        if table.kind() == PageTableKind::Master {
            return;
        }
        let first = table.master() + table.vaddr().section_index() * 4;
        if self
            .write_entries(first, core::iter::repeat(0), table.count())
            .is_ok()
        {
            self.attached.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn copy_table_contents(
        &self,
        dest: &PageTableInfo,
        src: &PageTableInfo,
    ) -> Result<(), VmError> {
        if dest.size() != src.size() {
            return Err(VmError::InvalidDescriptor);
        }
        let from = self.offset(src.paddr(), src.size())?;
        let to = self.offset(dest.paddr(), dest.size())?;
        self.memory.lock().copy_within(from..from + src.size(), to);
        Ok(())
    }

    fn map_region(&self, table: &PageTableInfo, mapping: &RegionMapping) -> Result<(), VmError> {
        let first = Self::page_slot(table, mapping)?;
        let entries = (0..mapping.pages)
            .map(|i| small_page_entry(mapping.paddr + i * PAGE_SIZE, mapping.prot));
        self.write_entries(first, entries, mapping.pages)
    }

    fn unmap_region(&self, table: &PageTableInfo, mapping: &RegionMapping) {
        if let Ok(first) = Self::page_slot(table, mapping) {
            let _ = self.write_entries(first, core::iter::repeat(0), mapping.pages);
        }
    }
}

/// Physical window handed out by [`EmulatedDynmem`].
const DYNMEM_BASE: usize = 0x0200_0000;

/// Emulated dynamic memory allocator for region backing.
///
/// Memory is handed out by bumping a pointer and never reused; the counters
/// record what the VM subsystem asked for.
pub struct EmulatedDynmem {
    next: AtomicUsize,
    duplicated: AtomicUsize,
    released: AtomicUsize,
    exhausted: AtomicBool,
}

impl EmulatedDynmem {
    /// Creates an allocator starting at a fixed physical window.
    pub const fn new() -> Self {
        Self {
            next: AtomicUsize::new(DYNMEM_BASE),
            duplicated: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
            exhausted: AtomicBool::new(false),
        }
    }

    /// Allocates `pages` small pages.
    pub fn allocate(&self, pages: usize) -> Result<PhysicalAddress, VmError> {
        if self.exhausted.load(Ordering::Acquire) {
            return Err(VmError::OutOfMemory);
        }
        let addr = self.next.fetch_add(pages * PAGE_SIZE, Ordering::AcqRel);
        PhysicalAddress::try_new(addr).ok_or(VmError::OutOfMemory)
    }

    /// Makes every following allocation fail (or succeed again).
    pub fn set_exhausted(&self, exhausted: bool) {
        self.exhausted.store(exhausted, Ordering::Release);
    }

    /// Returns how many regions have been duplicated.
    pub fn duplicated(&self) -> usize {
        self.duplicated.load(Ordering::Acquire)
    }

    /// Returns how many regions have been released.
    pub fn released(&self) -> usize {
        self.released.load(Ordering::Acquire)
    }
}

impl Default for EmulatedDynmem {
    fn default() -> Self {
        Self::new()
    }
}

impl BackingAllocator for EmulatedDynmem {
    fn duplicate(&self, mapping: &RegionMapping) -> Result<PhysicalAddress, VmError> {
        let paddr = self.allocate(mapping.pages)?;
        self.duplicated.fetch_add(1, Ordering::AcqRel);
        Ok(paddr)
    }

    fn release(&self, _mapping: &RegionMapping) {
        self.released.fetch_add(1, Ordering::AcqRel);
    }
}
