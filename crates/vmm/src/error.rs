//! Error type shared by the virtual memory subsystem.

use thiserror::Error;

/// Errors that can occur while managing page tables, regions and address spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum VmError {
    /// The bitmap, the slot array or a backing allocator is exhausted.
    #[error("out of memory")]
    OutOfMemory,
    /// A bit, block, address or run lies outside the managed range.
    #[error("index or address out of range")]
    OutOfRange,
    /// A page table descriptor or request is malformed (e.g. zero-sized).
    #[error("invalid page table descriptor")]
    InvalidDescriptor,
    /// The MMU binding rejected a page table.
    #[error("page table attach failed")]
    AttachFailed,
    /// The region can neither be duplicated nor shared copy-on-write.
    #[error("region is not clonable")]
    NotClonable,
    /// A cached page table does not cover the requested range.
    #[error("page table cache inconsistent")]
    Inconsistent,
    /// The region's last reference is gone and its backing has been released.
    #[error("region already released")]
    Released,
}

impl VmError {
    /// Returns true if the error reports resource exhaustion, which the syscall
    /// layer surfaces to the process as `ENOMEM`.
    pub const fn is_exhaustion(self) -> bool {
        matches!(self, VmError::OutOfMemory)
    }
}
