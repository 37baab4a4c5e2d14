//! Reference-counted memory regions.
//!
//! A region describes mapped bytes: where they live virtually and physically,
//! how many pages they span and how they may be accessed. Regions are shared by
//! every address space slot that points at them, and the backing memory is
//! released when the last reference goes away. Page tables are not owned by
//! regions; see the page-table cache for those.

use alloc::sync::Arc;
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};

use bitflags::bitflags;

use crate::{PhysicalAddress, VirtualAddress, VmError, arch};

bitflags! {
    /// Access rights of a region.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Protection: u32 {
        /// Readable.
        const READ = 1 << 0;
        /// Writable.
        const WRITE = 1 << 1;
        /// Executable.
        const EXECUTE = 1 << 2;
        /// Shared until first write, then copied by the fault handler.
        const COW = 1 << 3;
        /// Accessible from user mode.
        const USER = 1 << 4;
    }
}

/// The placement and protection of a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionMapping {
    /// First mapped virtual address.
    pub vaddr: VirtualAddress,
    /// Physical address backing `vaddr`.
    pub paddr: PhysicalAddress,
    /// Number of small pages.
    pub pages: usize,
    /// Access rights.
    pub prot: Protection,
}

impl RegionMapping {
    /// Returns the size of the mapping in bytes.
    pub const fn size(&self) -> usize {
        self.pages * arch::PAGE_SIZE
    }

    /// Returns true if `addr` lies inside the mapping.
    pub const fn contains(&self, addr: VirtualAddress) -> bool {
        addr.as_usize() >= self.vaddr.as_usize()
            && addr.as_usize() - self.vaddr.as_usize() < self.size()
    }
}

/// Allocator of the physical memory behind ordinary regions.
///
/// This is the kernel's dynamic memory allocator as seen from the VM subsystem.
pub trait BackingAllocator: Send + Sync {
    /// Allocates new memory of the same size as `mapping`, copies the contents
    /// of `mapping` into it and returns its physical base.
    fn duplicate(&self, mapping: &RegionMapping) -> Result<PhysicalAddress, VmError>;

    /// Releases the memory behind `mapping`.
    fn release(&self, mapping: &RegionMapping);
}

/// What a region's memory comes from, and therefore how it is copied and freed.
#[derive(Clone)]
pub enum Backing {
    /// Anonymous memory (code, data, heap, user stacks) from the dynamic allocator.
    Anonymous(Arc<dyn BackingAllocator>),
    /// A thread's kernel stack. Always copied on fork, never shared.
    KernelStack(Arc<dyn BackingAllocator>),
    /// Device memory such as a framebuffer.
    ///
    /// Device memory cannot be copied and is never released: the region stays
    /// pinned at one reference after its last user lets go.
    Device,
}

impl Backing {
    /// Returns true if the memory can be physically duplicated.
    pub const fn is_clonable(&self) -> bool {
        matches!(self, Backing::Anonymous(_) | Backing::KernelStack(_))
    }

    fn allocator(&self) -> Option<&Arc<dyn BackingAllocator>> {
        match self {
            Backing::Anonymous(allocator) | Backing::KernelStack(allocator) => Some(allocator),
            Backing::Device => None,
        }
    }
}

impl fmt::Debug for Backing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backing::Anonymous(_) => f.write_str("Anonymous"),
            Backing::KernelStack(_) => f.write_str("KernelStack"),
            Backing::Device => f.write_str("Device"),
        }
    }
}

/// Result of dropping a reference to a region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Other references remain; carries the new count.
    Held(usize),
    /// That was the last reference and the backing memory has been released.
    Freed,
    /// Device memory at its last reference; nothing was released.
    Pinned,
}

/// A reference-counted region of mapped memory.
///
/// The reference count is the number of address space slots pointing at the
/// region plus any transient holds, such as the one returned by [`Region::new`].
pub struct Region {
    mapping: spin::Mutex<RegionMapping>,
    refcount: AtomicUsize,
    backing: Backing,
}

impl Region {
    /// Creates a region. The caller holds the first reference.
    pub fn new(mapping: RegionMapping, backing: Backing) -> Arc<Self> {
        Arc::new(Self {
            mapping: spin::Mutex::new(mapping),
            refcount: AtomicUsize::new(1),
            backing,
        })
    }

    /// Returns the current placement and protection.
    pub fn mapping(&self) -> RegionMapping {
        *self.mapping.lock()
    }

    /// Moves the region to a new virtual address.
    pub fn set_vaddr(&self, vaddr: VirtualAddress) {
        self.mapping.lock().vaddr = vaddr;
    }

    /// Replaces the access rights.
    pub fn set_protection(&self, prot: Protection) {
        self.mapping.lock().prot = prot;
    }

    /// Returns true if `addr` lies inside the region.
    pub fn contains(&self, addr: VirtualAddress) -> bool {
        self.mapping.lock().contains(addr)
    }

    /// Returns the backing of the region.
    pub const fn backing(&self) -> &Backing {
        &self.backing
    }

    /// Returns true if the region's memory can be physically duplicated.
    pub const fn is_clonable(&self) -> bool {
        self.backing.is_clonable()
    }

    /// Returns the current reference count.
    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    /// Takes a reference, returning the new count.
    ///
    /// A region whose count has reached zero has already released its backing
    /// and cannot be revived; that is [`VmError::Released`].
    pub fn acquire(&self) -> Result<usize, VmError> {
        let mut current = self.refcount.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return Err(VmError::Released);
            }
            match self.refcount.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(current + 1),
                Err(actual) => current = actual,
            }
        }
    }

    /// Drops a reference.
    ///
    /// The backing memory is released exactly once, by whoever takes the count
    /// from one to zero. Device regions never go below one.
    ///
    /// # Panics
    ///
    /// Panics if the region holds no references.
    pub fn release(&self) -> Release {
        let pinned = matches!(self.backing, Backing::Device);
        let mut current = self.refcount.load(Ordering::Acquire);
        loop {
            assert_ne!(current, 0, "region reference count underflow");
            if pinned && current == 1 {
                return Release::Pinned;
            }

            match self.refcount.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        if current > 1 {
            return Release::Held(current - 1);
        }

        let mapping = self.mapping();
        if let Some(allocator) = self.backing.allocator() {
            allocator.release(&mapping);
        }
        log::trace!("region at {} released", mapping.vaddr);
        Release::Freed
    }

    /// Physically copies the region into new backing memory.
    ///
    /// The copy has the same placement and protection and a single reference,
    /// held by the caller. Regions that cannot be copied are a hard error: the
    /// caller must not fall back to aliasing them.
    pub fn duplicate(&self) -> Result<Arc<Region>, VmError> {
        let Some(allocator) = self.backing.allocator() else {
            return Err(VmError::NotClonable);
        };

        let mapping = self.mapping();
        let paddr = allocator.duplicate(&mapping)?;
        Ok(Region::new(
            RegionMapping { paddr, ..mapping },
            self.backing.clone(),
        ))
    }

    /// Produces the region a forked address space gets in place of this one.
    ///
    /// Clonable regions are duplicated. Other regions marked copy-on-write are
    /// shared: the count goes up by one and write access is dropped, so both
    /// address spaces fault on the first write. Anything else is
    /// [`VmError::NotClonable`]. Either way the caller holds one reference to
    /// the returned region.
    pub fn clone_for_fork(self: &Arc<Self>) -> Result<Arc<Region>, VmError> {
        if self.is_clonable() {
            return self.duplicate();
        }

        let mut mapping = self.mapping.lock();
        if !mapping.prot.contains(Protection::COW) {
            return Err(VmError::NotClonable);
        }

        self.acquire()?;
        mapping.prot.remove(Protection::WRITE);
        Ok(Arc::clone(self))
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("mapping", &self.mapping())
            .field("refcount", &self.refcount())
            .field("backing", &self.backing)
            .finish()
    }
}
