//! Binding to the hardware MMU.
//!
//! Everything that touches real translation table entries, TLBs or caches lives
//! behind this trait. The bookkeeping in this crate decides *which* tables exist
//! and *what* they map; the binding decides how that is encoded.

use crate::{PageTableInfo, RegionMapping, VmError};

/// Hardware operations on translation tables.
pub trait Mmu {
    /// Clears a freshly allocated table so that it maps nothing.
    fn init_page_table(&self, table: &PageTableInfo) -> Result<(), VmError>;

    /// Links a coarse table into its master table. For a master table this
    /// makes it usable as a translation table base.
    fn attach_page_table(&self, table: &PageTableInfo) -> Result<(), VmError>;

    /// Unlinks a coarse table from its master table.
    fn detach_page_table(&self, table: &PageTableInfo);

    /// Copies every entry of `src` into `dest`. Both tables must be the same size.
    fn copy_table_contents(&self, dest: &PageTableInfo, src: &PageTableInfo)
    -> Result<(), VmError>;

    /// Writes the entries mapping `mapping` into the coarse table `table`.
    fn map_region(&self, table: &PageTableInfo, mapping: &RegionMapping) -> Result<(), VmError>;

    /// Clears the entries mapping `mapping` from the coarse table `table`.
    fn unmap_region(&self, table: &PageTableInfo, mapping: &RegionMapping);
}
