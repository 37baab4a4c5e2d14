//! Process-wide VM state: the page-table region, the MMU binding and the
//! kernel's own tables.
//!
//! The kernel boots exactly one [`VmSystem`]. Address spaces borrow it, so it
//! cannot be shut down while any of them is alive.

use crate::{
    AddressSpace, BootPtm, Domain, Mmu, PageTableDescriptor, PageTableInfo, PageTableRequest, Ptm,
    PtmStats, VirtualAddress, VmConfig, VmError,
};

/// The booted virtual memory subsystem.
pub struct VmSystem<M: Mmu> {
    config: VmConfig,
    ptm: Ptm,
    mmu: M,
    system_master: PageTableDescriptor,
    system_table: PageTableDescriptor,
}

impl<M: Mmu> VmSystem<M> {
    /// Sets up the page-table region and the kernel's tables.
    ///
    /// The system master and the coarse tables mapping the kernel range are
    /// allocated while the page-table region allocator is still in its boot
    /// phase, then the allocator is started.
    pub fn try_boot(config: VmConfig, mmu: M) -> Result<Self, VmError> {
        config.validate()?;
        let mut boot = BootPtm::new(config.ptm_base, config.ptm_size)?;

        let system_master = boot.alloc(&PageTableRequest::master(Domain::KERNEL))?;
        mmu.init_page_table(&system_master)?;
        mmu.attach_page_table(&system_master)?;

        let system_table = boot.alloc(&PageTableRequest::coarse(
            config.kernel_base,
            config.kernel_sections(),
            system_master.paddr(),
            Domain::KERNEL,
        ))?;
        mmu.init_page_table(&system_table)?;
        mmu.attach_page_table(&system_table)?;

        let ptm = boot.start();
        log::info!(
            "vm: kernel master at {}, {} kernel tables at {}; ptm {}",
            system_master.paddr(),
            system_table.count(),
            system_table.paddr(),
            ptm.stats()
        );

        Ok(Self {
            config,
            ptm,
            mmu,
            system_master,
            system_table,
        })
    }

    /// Boots the subsystem.
    ///
    /// # Panics
    ///
    /// Panics if the kernel's own tables cannot be set up. There is no way to
    /// run without them.
    pub fn boot(config: VmConfig, mmu: M) -> Self {
        match Self::try_boot(config, mmu) {
            Ok(vm) => vm,
            Err(err) => panic!("failed to set up kernel page tables: {}", err),
        }
    }

    /// Creates an empty address space sharing the kernel tables.
    pub fn new_address_space(&self) -> Result<AddressSpace<'_, M>, VmError> {
        AddressSpace::new(self)
    }

    /// Returns true if `vaddr` belongs to the kernel range mapped by the system table.
    pub const fn is_kernel_address(&self, vaddr: VirtualAddress) -> bool {
        self.config.is_kernel_address(vaddr)
    }

    /// Returns the kernel's master table.
    pub fn system_master(&self) -> PageTableInfo {
        self.system_master.info()
    }

    /// Returns the coarse table(s) mapping the kernel range.
    pub fn system_table(&self) -> PageTableInfo {
        self.system_table.info()
    }

    /// Returns the page-table region allocator.
    pub const fn ptm(&self) -> &Ptm {
        &self.ptm
    }

    /// Returns the MMU binding.
    pub const fn mmu(&self) -> &M {
        &self.mmu
    }

    /// Returns the layout the system was booted with.
    pub const fn config(&self) -> &VmConfig {
        &self.config
    }

    /// Frees the kernel tables and stops the page-table region allocator.
    pub fn shutdown(self) -> PtmStats {
        let Self {
            ptm,
            mmu,
            system_master,
            system_table,
            ..
        } = self;

        mmu.detach_page_table(&system_table);
        for table in [system_table, system_master] {
            if let Err(err) = ptm.free(table) {
                log::error!("vm: failed to free kernel table: {}", err);
            }
        }

        let stats = ptm.shutdown();
        log::info!("vm: shut down, ptm {}", stats);
        stats
    }
}
