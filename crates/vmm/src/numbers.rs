//! Block numbers used by the page-table region allocator.

use core::fmt;
use core::ops::{Add, Sub};

/// Index of a block within the page-table region.
///
/// This is a bit position in the allocator's bitmap, never a byte count. The
/// only conversions to and from addresses are the checked
/// [`PtmState::address_of`](crate::PtmState::address_of) and
/// [`PtmState::block_of`](crate::PtmState::block_of).
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct BlockIndex(usize);

impl BlockIndex {
    /// Creates a new block index.
    #[inline]
    pub const fn new(index: usize) -> Self {
        Self(index)
    }

    /// Returns the raw block index.
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }
}

impl fmt::Debug for BlockIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlockIndex({})", self.0)
    }
}

impl fmt::Display for BlockIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Add<usize> for BlockIndex {
    type Output = Self;

    #[inline]
    fn add(self, rhs: usize) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl Sub<BlockIndex> for BlockIndex {
    type Output = usize;

    #[inline]
    fn sub(self, rhs: BlockIndex) -> Self::Output {
        self.0 - rhs.0
    }
}
