//! Board memory layout used by the VM subsystem.

use crate::{PhysicalAddress, VirtualAddress, VmError, arch};

/// Where the page-table region lives and which virtual range belongs to the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// Physical base of the page-table region. Must be aligned to a master table.
    pub ptm_base: PhysicalAddress,
    /// Size of the page-table region in bytes.
    pub ptm_size: usize,
    /// First virtual address of the kernel range, shared by every address space.
    pub kernel_base: VirtualAddress,
    /// Size of the kernel range in bytes. Must be a whole number of sections.
    pub kernel_size: usize,
}

impl VmConfig {
    /// The layout of the reference board: a 1 MiB page-table region at 1 MiB,
    /// and the kernel in the first megabyte of virtual memory.
    pub const DEFAULT: VmConfig = VmConfig::new(
        PhysicalAddress::new(0x0010_0000),
        0x0010_0000,
        VirtualAddress::new(0),
        arch::SECTION_SIZE,
    );

    /// Creates a layout.
    pub const fn new(
        ptm_base: PhysicalAddress,
        ptm_size: usize,
        kernel_base: VirtualAddress,
        kernel_size: usize,
    ) -> Self {
        Self {
            ptm_base,
            ptm_size,
            kernel_base,
            kernel_size,
        }
    }

    /// Number of coarse tables needed to map the kernel range.
    pub const fn kernel_sections(&self) -> usize {
        self.kernel_size / arch::SECTION_SIZE
    }

    /// Returns true if `vaddr` lies in the kernel range.
    pub const fn is_kernel_address(&self, vaddr: VirtualAddress) -> bool {
        vaddr.as_usize() >= self.kernel_base.as_usize()
            && vaddr.as_usize() - self.kernel_base.as_usize() < self.kernel_size
    }

    /// Checks that the layout can be booted.
    ///
    /// The page-table region must hold the system master and kernel tables
    /// plus at least one more master, otherwise no process could ever exist.
    pub fn validate(&self) -> Result<(), VmError> {
        if !self.ptm_base.is_aligned(arch::MASTER_TABLE_SIZE) {
            return Err(VmError::OutOfRange);
        }
        if !self.kernel_base.is_aligned(arch::SECTION_SIZE)
            || self.kernel_size == 0
            || self.kernel_size % arch::SECTION_SIZE != 0
        {
            return Err(VmError::OutOfRange);
        }
        let kernel_end = self.kernel_base.as_usize() as u64 + self.kernel_size as u64;
        if kernel_end > arch::ADDRESS_SPACE_SIZE {
            return Err(VmError::OutOfRange);
        }
        if self.ptm_base.checked_add(self.ptm_size.saturating_sub(1)).is_none() {
            return Err(VmError::OutOfRange);
        }

        let needed = 2 * arch::MASTER_TABLE_SIZE + self.kernel_sections() * arch::COARSE_TABLE_SIZE;
        if self.ptm_size < needed {
            return Err(VmError::OutOfMemory);
        }
        Ok(())
    }
}

impl Default for VmConfig {
    fn default() -> Self {
        Self::DEFAULT
    }
}
