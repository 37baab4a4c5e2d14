//! Hardware page table descriptors.
//!
//! A [`PageTableRequest`] describes a table that has not been allocated yet. The
//! page-table region allocator turns it into a [`PageTableDescriptor`], which owns
//! its run of allocator blocks until it is handed back to `free`. Descriptors are
//! not `Clone`; lookups hand out [`PageTableInfo`] snapshots instead.

use core::fmt;
use core::ops::Deref;

use crate::{PhysicalAddress, VirtualAddress, arch};

/// The two kinds of ARMv6 translation tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageTableKind {
    /// First-level table, one per address space.
    Master,
    /// Second-level table mapping 1 MiB with 4 KiB pages.
    Coarse,
}

impl PageTableKind {
    /// Number of allocator blocks occupied by one table of this kind.
    pub const fn blocks_per_table(self) -> usize {
        match self {
            PageTableKind::Master => arch::MASTER_BLOCKS,
            PageTableKind::Coarse => 1,
        }
    }

    /// Required alignment, in allocator blocks, of a table of this kind.
    pub const fn alignment(self) -> usize {
        self.blocks_per_table()
    }

    /// Size in bytes of one table of this kind.
    pub const fn table_size(self) -> usize {
        match self {
            PageTableKind::Master => arch::MASTER_TABLE_SIZE,
            PageTableKind::Coarse => arch::COARSE_TABLE_SIZE,
        }
    }
}

/// A hardware access-control domain tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Domain(u8);

impl Domain {
    /// Domain of the kernel's own tables.
    pub const KERNEL: Domain = Domain(0);
    /// Domain of per-process tables.
    pub const USER: Domain = Domain(1);

    /// Creates a domain tag.
    ///
    /// # Panics
    ///
    /// Panics if `domain` is not one of the 16 hardware domains.
    pub const fn new(domain: u8) -> Self {
        assert!(domain < arch::DOMAIN_COUNT, "domain out of range");
        Self(domain)
    }

    /// Returns the raw domain number.
    pub const fn as_u8(self) -> u8 {
        self.0
    }
}

/// A page table that has not been allocated yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageTableRequest {
    pub(crate) kind: PageTableKind,
    pub(crate) count: usize,
    pub(crate) vaddr: VirtualAddress,
    pub(crate) master: Option<PhysicalAddress>,
    pub(crate) domain: Domain,
}

impl PageTableRequest {
    /// Requests a master table.
    pub const fn master(domain: Domain) -> Self {
        Self::masters(1, domain)
    }

    /// Requests `count` contiguous master tables, each aligned to its own size.
    pub const fn masters(count: usize, domain: Domain) -> Self {
        Self {
            kind: PageTableKind::Master,
            count,
            vaddr: VirtualAddress::new(0),
            master: None,
            domain,
        }
    }

    /// Requests `count` contiguous coarse tables serving the sections from
    /// `vaddr`, linked into the master table at `master`.
    pub const fn coarse(
        vaddr: VirtualAddress,
        count: usize,
        master: PhysicalAddress,
        domain: Domain,
    ) -> Self {
        Self {
            kind: PageTableKind::Coarse,
            count,
            vaddr,
            master: Some(master),
            domain,
        }
    }

    /// Returns the number of allocator blocks this request needs.
    pub const fn blocks(&self) -> usize {
        self.count * self.kind.blocks_per_table()
    }
}

/// A snapshot of an allocated page table.
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PageTableInfo {
    kind: PageTableKind,
    count: usize,
    vaddr: VirtualAddress,
    paddr: PhysicalAddress,
    master: PhysicalAddress,
    domain: Domain,
}

impl PageTableInfo {
    /// Returns the kind of the table.
    pub const fn kind(&self) -> PageTableKind {
        self.kind
    }

    /// Returns how many contiguous tables this descriptor spans.
    pub const fn count(&self) -> usize {
        self.count
    }

    /// Returns the first virtual address served by the table.
    pub const fn vaddr(&self) -> VirtualAddress {
        self.vaddr
    }

    /// Returns the physical backing address of the table.
    pub const fn paddr(&self) -> PhysicalAddress {
        self.paddr
    }

    /// Returns the physical address of the owning master table.
    ///
    /// A master table is its own master.
    pub const fn master(&self) -> PhysicalAddress {
        self.master
    }

    /// Returns the domain tag.
    pub const fn domain(&self) -> Domain {
        self.domain
    }

    /// Returns the size of the table memory in bytes.
    pub const fn size(&self) -> usize {
        self.count * self.kind.table_size()
    }

    /// Returns the number of allocator blocks backing the table.
    pub const fn blocks(&self) -> usize {
        self.count * self.kind.blocks_per_table()
    }

    /// Returns the number of bytes of virtual address space the table maps.
    ///
    /// Only meaningful for coarse tables; a master table maps everything.
    pub const fn coverage(&self) -> usize {
        self.count * arch::SECTION_SIZE
    }

    /// Returns true if a coarse table maps `addr`.
    pub const fn contains(&self, addr: VirtualAddress) -> bool {
        addr.as_usize() >= self.vaddr.as_usize()
            && addr.as_usize() - self.vaddr.as_usize() < self.coverage()
    }

    /// Returns true if the coarse table maps all of `[addr, addr + size)`.
    pub const fn covers(&self, addr: VirtualAddress, size: usize) -> bool {
        self.contains(addr)
            && (addr.as_usize() - self.vaddr.as_usize()) as u64 + size as u64
                <= self.coverage() as u64
    }
}

impl fmt::Debug for PageTableInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageTable")
            .field("kind", &self.kind)
            .field("count", &self.count)
            .field("vaddr", &self.vaddr)
            .field("paddr", &self.paddr)
            .field("master", &self.master)
            .field("domain", &self.domain.0)
            .finish()
    }
}

/// An allocated page table.
///
/// Owning a descriptor means owning its run of page-table region blocks; the
/// only way to give the blocks back is to pass the descriptor to `free`.
#[derive(PartialEq, Eq)]
pub struct PageTableDescriptor {
    info: PageTableInfo,
}

impl PageTableDescriptor {
    /// Populates a descriptor for a request that has been given backing memory.
    pub(crate) const fn allocated(request: &PageTableRequest, paddr: PhysicalAddress) -> Self {
        let master = match (request.kind, request.master) {
            (PageTableKind::Coarse, Some(master)) => master,
            _ => paddr,
        };

        Self {
            info: PageTableInfo {
                kind: request.kind,
                count: request.count,
                vaddr: request.vaddr,
                paddr,
                master,
                domain: request.domain,
            },
        }
    }

    /// Returns a copyable snapshot of the descriptor.
    pub const fn info(&self) -> PageTableInfo {
        self.info
    }
}

impl Deref for PageTableDescriptor {
    type Target = PageTableInfo;

    fn deref(&self) -> &Self::Target {
        &self.info
    }
}

impl fmt::Debug for PageTableDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.info.fmt(f)
    }
}
