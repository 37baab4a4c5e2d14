#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Polaris Virtual Memory Manager (VMM)
//!
//! The bookkeeping half of virtual memory for ARMv6 (ARM11) kernels. It provides:
//!
//! - A first-fit bitmap allocator.
//! - The page-table region allocator, which hands out master and coarse tables
//!   from one physically contiguous region.
//! - A per-address-space cache of coarse tables, created lazily and cloned on fork.
//! - Reference-counted regions with copy-on-write sharing.
//! - Address spaces tying all of the above together.
//!
//! Programming actual translation table entries is left to an [`Mmu`]
//! implementation supplied by the kernel; region backing memory comes from a
//! [`BackingAllocator`]. Software emulations of both are available for testing
//! in non-kernel environments.

extern crate alloc;

mod address;
mod address_space;
pub mod arch;
mod bitmap;
mod config;
mod error;
mod mmu;
mod numbers;
mod page_table;
mod ptc;
mod ptm;
mod region;
mod system;

pub use address::{PhysicalAddress, VirtualAddress};
pub use address_space::{AddressSpace, AttachOptions, FIRST_DYNAMIC_SLOT, MAX_REGIONS, RegionSlot};
pub use bitmap::Bitmap;
pub use config::VmConfig;
pub use error::VmError;
pub use mmu::Mmu;
pub use numbers::BlockIndex;
pub use page_table::{Domain, PageTableDescriptor, PageTableInfo, PageTableKind, PageTableRequest};
pub use ptc::PageTableCache;
pub use ptm::{BootPtm, Ptm, PtmState, PtmStats};
pub use region::{Backing, BackingAllocator, Protection, Region, RegionMapping, Release};
pub use system::VmSystem;

pub use arch::{PAGE_SIZE, SECTION_SIZE};
