//! ARMv6 (ARM11) translation table geometry.
//!
//! The hardware walks a two-level structure: a 16 KiB master (L1) table with one
//! 4-byte entry per 1 MiB section, and 1 KiB coarse (L2) tables with one 4-byte
//! entry per 4 KiB small page. The page-table region allocator hands out memory
//! in units of one coarse table, so a master table is [`MASTER_BLOCKS`] blocks.

// Software emulation of the MMU binding is only compiled for tests or when the
// software-emulation feature is explicitly enabled.
#[cfg(any(test, feature = "software-emulation"))]
mod software;
#[cfg(any(test, feature = "software-emulation"))]
pub use software::*;

/// Number of bits in a physical or virtual address.
pub const ADDRESS_BITS: u32 = 32;

/// Size of the whole 32-bit address space in bytes.
pub const ADDRESS_SPACE_SIZE: u64 = 1 << ADDRESS_BITS;

/// Small page size in bytes (4 KiB).
pub const PAGE_SIZE: usize = 4096;

/// Bytes of virtual address space covered by one master table entry (1 MiB).
pub const SECTION_SIZE: usize = 1 << 20;

/// Size of one coarse (L2) table: 256 entries of 4 bytes.
pub const COARSE_TABLE_SIZE: usize = 1024;

/// Size of the master (L1) table: 4096 entries of 4 bytes.
pub const MASTER_TABLE_SIZE: usize = 16 * 1024;

/// Size of one page-table region allocator block.
pub const PTM_BLOCK_SIZE: usize = COARSE_TABLE_SIZE;

/// Number of allocator blocks making up one master table.
pub const MASTER_BLOCKS: usize = MASTER_TABLE_SIZE / PTM_BLOCK_SIZE;

/// Number of hardware access-control domains.
pub const DOMAIN_COUNT: u8 = 16;

/// Validates that an address fits the 32-bit address space.
#[inline]
pub const fn validate_address(addr: usize) -> bool {
    (addr as u64) < ADDRESS_SPACE_SIZE
}

/// Returns the master table index (section number) for a virtual address.
#[inline]
pub const fn section_index(addr: usize) -> usize {
    addr / SECTION_SIZE
}
