//! Page-table region allocator (PTM).
//!
//! The kernel reserves one physically contiguous region for hardware translation
//! tables. This module carves it into [`arch::PTM_BLOCK_SIZE`] blocks tracked by a
//! [`Bitmap`]: a coarse table takes one block, a master table takes
//! [`arch::MASTER_BLOCKS`] blocks aligned to its own size.
//!
//! The allocator has two phases. During boot, before any other thread exists, the
//! [`BootPtm`] is used through `&mut self` and needs no lock. [`BootPtm::start`]
//! moves the state behind a spin lock and returns the [`Ptm`] used for the rest
//! of the kernel's lifetime; there is no unlocked access to a running allocator.

use core::fmt;

use crate::{
    Bitmap, BlockIndex, PageTableDescriptor, PageTableInfo, PageTableRequest, PhysicalAddress,
    VmError, arch,
};

/// Diagnostic counters of the page-table region allocator.
///
/// The counters are maintained by `alloc` and `free`, never recomputed from the
/// bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PtmStats {
    /// Size of the managed region in bytes.
    pub total_bytes: usize,
    /// Bytes not currently backing a page table.
    pub free_bytes: usize,
    /// Number of tables currently allocated; a multi-table descriptor counts each table.
    pub allocated_tables: usize,
}

impl fmt::Display for PtmStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} of {} bytes free, {} tables",
            self.free_bytes, self.total_bytes, self.allocated_tables
        )
    }
}

/// The bookkeeping state of the page-table region.
///
/// A bit is set if and only if a live [`PageTableDescriptor`] owns that block.
#[derive(Debug)]
pub struct PtmState {
    base: PhysicalAddress,
    bitmap: Bitmap,
    free_bytes: usize,
    allocated_tables: usize,
}

impl PtmState {
    /// Creates the state for the region `[base, base + size)`.
    ///
    /// The base must be aligned to a master table so that block alignment
    /// implies physical alignment. Any tail smaller than a block is ignored.
    pub fn new(base: PhysicalAddress, size: usize) -> Result<Self, VmError> {
        let blocks = size / arch::PTM_BLOCK_SIZE;
        if !base.is_aligned(arch::MASTER_TABLE_SIZE) || blocks == 0 {
            return Err(VmError::OutOfRange);
        }
        if base.checked_add(blocks * arch::PTM_BLOCK_SIZE - 1).is_none() {
            return Err(VmError::OutOfRange);
        }

        Ok(Self {
            base,
            bitmap: Bitmap::new(blocks),
            free_bytes: blocks * arch::PTM_BLOCK_SIZE,
            allocated_tables: 0,
        })
    }

    /// Returns the base address of the region.
    pub const fn base(&self) -> PhysicalAddress {
        self.base
    }

    /// Returns the number of blocks in the region.
    pub const fn total_blocks(&self) -> usize {
        self.bitmap.len()
    }

    /// Returns the current diagnostic counters.
    pub const fn stats(&self) -> PtmStats {
        PtmStats {
            total_bytes: self.bitmap.len() * arch::PTM_BLOCK_SIZE,
            free_bytes: self.free_bytes,
            allocated_tables: self.allocated_tables,
        }
    }

    /// Returns the bitmap, for diagnostics.
    pub const fn bitmap(&self) -> &Bitmap {
        &self.bitmap
    }

    /// Converts a block index to the physical address of the block.
    pub fn address_of(&self, block: BlockIndex) -> Result<PhysicalAddress, VmError> {
        if block.as_usize() >= self.total_blocks() {
            return Err(VmError::OutOfRange);
        }
        Ok(self.base + block.as_usize() * arch::PTM_BLOCK_SIZE)
    }

    /// Converts a block's physical address back to its index.
    pub fn block_of(&self, addr: PhysicalAddress) -> Result<BlockIndex, VmError> {
        if addr < self.base {
            return Err(VmError::OutOfRange);
        }
        let offset = addr - self.base;
        if offset % arch::PTM_BLOCK_SIZE != 0 {
            return Err(VmError::OutOfRange);
        }
        let block = BlockIndex::new(offset / arch::PTM_BLOCK_SIZE);
        if block.as_usize() >= self.total_blocks() {
            return Err(VmError::OutOfRange);
        }
        Ok(block)
    }

    /// Allocates backing blocks for `request`.
    pub(crate) fn alloc(
        &mut self,
        request: &PageTableRequest,
    ) -> Result<PageTableDescriptor, VmError> {
        let blocks = request.blocks();
        if blocks == 0 {
            return Err(VmError::InvalidDescriptor);
        }

        let found = if blocks > self.total_blocks() {
            Err(VmError::OutOfMemory)
        } else {
            self.bitmap.alloc_aligned(blocks, request.kind.alignment())
        };
        let start = match found {
            Ok(start) => BlockIndex::new(start),
            Err(err) if err.is_exhaustion() => {
                log::warn!(
                    "page table region exhausted: {:?} x{} needs {} blocks ({})",
                    request.kind,
                    request.count,
                    blocks,
                    self.stats()
                );
                return Err(err);
            }
            Err(err) => return Err(err),
        };

        let paddr = self.address_of(start)?;
        let table = PageTableDescriptor::allocated(request, paddr);
        self.free_bytes -= table.size();
        self.allocated_tables += table.count();

        log::trace!("ptm: allocated {:?} at block {}", table, start);
        Ok(table)
    }

    /// Returns a table's blocks to the region.
    ///
    /// The run length is taken from the descriptor itself.
    pub(crate) fn release(&mut self, table: &PageTableInfo) -> Result<(), VmError> {
        let blocks = table.blocks();
        if blocks == 0 {
            log::error!("ptm: refusing to free zero-sized table {:?}", table);
            return Err(VmError::InvalidDescriptor);
        }

        let start = self.block_of(table.paddr())?;
        self.bitmap.free(start.as_usize(), blocks)?;
        self.free_bytes += table.size();
        self.allocated_tables -= table.count();

        log::trace!("ptm: freed {:?} at block {}", table, start);
        Ok(())
    }

    /// Frees a page table.
    pub(crate) fn free(&mut self, table: PageTableDescriptor) -> Result<(), VmError> {
        self.release(&table.info())
    }
}

/// The page-table region allocator while the kernel is still single-threaded.
///
/// All operations take `&mut self`, so only the owner of the boot allocator,
/// i.e. the boot path itself, can use it.
#[derive(Debug)]
pub struct BootPtm {
    state: PtmState,
}

impl BootPtm {
    /// Creates the boot-time allocator for the region `[base, base + size)`.
    pub fn new(base: PhysicalAddress, size: usize) -> Result<Self, VmError> {
        Ok(Self {
            state: PtmState::new(base, size)?,
        })
    }

    /// Allocates a page table.
    pub fn alloc(&mut self, request: &PageTableRequest) -> Result<PageTableDescriptor, VmError> {
        self.state.alloc(request)
    }

    /// Frees a page table.
    pub fn free(&mut self, table: PageTableDescriptor) -> Result<(), VmError> {
        self.state.free(table)
    }

    /// Returns the current diagnostic counters.
    pub const fn stats(&self) -> PtmStats {
        self.state.stats()
    }

    /// Ends the boot phase. From here on every access goes through the lock.
    pub fn start(self) -> Ptm {
        log::debug!("ptm: running ({})", self.state.stats());
        Ptm {
            state: spin::Mutex::new(self.state),
        }
    }
}

/// The page-table region allocator.
///
/// A single instance exists for the whole kernel. The lock is held only for the
/// bitmap search and update, never across hardware table attachment.
pub struct Ptm {
    state: spin::Mutex<PtmState>,
}

impl Ptm {
    /// Allocates a page table.
    pub fn alloc(&self, request: &PageTableRequest) -> Result<PageTableDescriptor, VmError> {
        self.state.lock().alloc(request)
    }

    /// Frees a page table.
    pub fn free(&self, table: PageTableDescriptor) -> Result<(), VmError> {
        self.state.lock().free(table)
    }

    /// Frees the blocks of a table that is being torn down in place.
    pub(crate) fn release(&self, table: &PageTableInfo) -> Result<(), VmError> {
        self.state.lock().release(table)
    }

    /// Returns the current diagnostic counters.
    pub fn stats(&self) -> PtmStats {
        self.state.lock().stats()
    }

    /// Converts a block index to the physical address of the block.
    pub fn address_of(&self, block: BlockIndex) -> Result<PhysicalAddress, VmError> {
        self.state.lock().address_of(block)
    }

    /// Converts a block's physical address back to its index.
    pub fn block_of(&self, addr: PhysicalAddress) -> Result<BlockIndex, VmError> {
        self.state.lock().block_of(addr)
    }

    /// Returns the number of set bits in the bitmap.
    ///
    /// This scans the bitmap and is meant for consistency checks only.
    pub fn allocated_blocks(&self) -> usize {
        self.state.lock().bitmap().count_set()
    }

    /// Shuts the allocator down, returning the final counters.
    pub fn shutdown(self) -> PtmStats {
        let stats = self.state.into_inner().stats();
        if stats.allocated_tables != 0 {
            log::warn!("ptm: shutting down with {} live tables", stats.allocated_tables);
        }
        stats
    }
}
