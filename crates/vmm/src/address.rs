//! Address types for physical and virtual memory.
//!
//! Physical and virtual addresses are distinct newtypes so a page-table backing
//! address can never be passed where a mapped virtual address is expected. Both
//! are validated against the 32-bit ARMv6 address space on construction.

use core::fmt;
use core::ops::{Add, Sub};

use crate::arch;

/// Macro to define common address type functionality.
macro_rules! impl_address_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Creates a new address.
            ///
            /// # Panics
            ///
            /// Panics if the address does not fit the 32-bit address space.
            #[inline]
            pub const fn new(addr: usize) -> Self {
                assert!(
                    arch::validate_address(addr),
                    "address exceeds 32-bit address space"
                );
                Self(addr)
            }

            /// Creates a new address, returning `None` if it does not fit the
            /// 32-bit address space.
            #[inline]
            pub const fn try_new(addr: usize) -> Option<Self> {
                if arch::validate_address(addr) {
                    Some(Self(addr))
                } else {
                    None
                }
            }

            /// Returns the raw address value.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            /// Checks if the address is aligned to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn is_aligned(self, align: usize) -> bool {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                self.0 & (align - 1) == 0
            }

            /// Aligns the address down to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_down(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self(self.0 & !(align - 1))
            }

            /// Adds an offset, returning `None` if the result leaves the address space.
            #[inline]
            pub const fn checked_add(self, offset: usize) -> Option<Self> {
                match self.0.checked_add(offset) {
                    Some(addr) => Self::try_new(addr),
                    None => None,
                }
            }
        }

        impl fmt::Pointer for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:p}", self.0 as *const u8)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#010x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#010x}", self.0)
            }
        }

        impl From<u32> for $name {
            #[inline]
            fn from(addr: u32) -> Self {
                Self(addr as usize)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self::new(self.0 + rhs)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: usize) -> Self::Output {
                Self::new(self.0 - rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = usize;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }
    };
}

impl_address_common!(
    PhysicalAddress,
    "A physical memory address.\n\n\
     Page tables handed out by the page-table region allocator are identified by\n\
     their physical backing address."
);

impl_address_common!(
    VirtualAddress,
    "A virtual memory address.\n\n\
     Used for the ranges served by coarse page tables and for region placement."
);

impl VirtualAddress {
    /// Returns the master table index of the section containing this address.
    #[inline]
    pub const fn section_index(self) -> usize {
        arch::section_index(self.0)
    }

    /// Returns the base address of the 1 MiB section containing this address.
    #[inline]
    pub const fn section_base(self) -> Self {
        self.align_down(arch::SECTION_SIZE)
    }

    /// Returns the offset of this address within its small page.
    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & (arch::PAGE_SIZE - 1)
    }
}
