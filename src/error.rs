use thiserror::Error;

/// Everything that can go wrong when building or using a
/// [`PoolAllocator`](crate::PoolAllocator).
///
/// Addresses are reported as plain integers so the error stays `Send`,
/// `Sync` and comparable.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// A zero-byte request. Zero-sized allocations are never handed out.
    #[error("allocation size must be greater than zero")]
    InvalidSize,

    /// Neither a pool, the bump region, nor the page source could serve the
    /// request.
    #[error("out of memory allocating {size} bytes")]
    OutOfMemory { size: usize },

    /// The page source refused a region while the allocator was being built.
    /// Everything acquired before the failure has already been released.
    #[error("failed to acquire a {bytes} byte region while building the allocator")]
    PoolCreationFailed { bytes: usize },

    /// A size class that can't be laid out: too small to hold a free-list
    /// node, not a multiple of the alignment, empty, or duplicated.
    #[error("invalid size class: {blocks} blocks of {block_size} bytes")]
    InvalidSizeClass { block_size: usize, blocks: usize },

    /// The block at `addr` is already on its pool's free list.
    #[error("double free of block at {addr:#x}")]
    DoubleFree { addr: usize },

    /// The size given to `free` can't belong to the block at `addr`: it is
    /// larger than the block, or differs from the size recorded in its tag.
    #[error("size mismatch freeing {addr:#x}: expected {expected} bytes, got {found}")]
    SizeMismatch {
        addr: usize,
        expected: usize,
        found: usize,
    },

    /// `addr` was not handed out by this allocator.
    #[error("pointer {addr:#x} does not belong to this allocator")]
    UnknownPointer { addr: usize },
}
