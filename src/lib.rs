#![no_std]

//! A size-classed pool allocator.
//!
//! A [`PoolAllocator`] owns an ordered set of pools, one per size class. Each
//! pool is a single region cut into equal blocks and threaded into an
//! intrusive free list, so taking and returning a block are both O(1).
//! Requests too large for any class, or whose class has run dry, fall back to
//! a bump region, and past that to the [`PageSource`] directly.
//!
//! ```
//! use pool_allocator::{Config, HeapPageSource, PoolAllocator};
//!
//! let config = Config::new().class(64, 4).class(256, 2).oversize(4096);
//! let mut allocator = PoolAllocator::new(HeapPageSource, config).unwrap();
//!
//! let ptr = allocator.allocate(40).unwrap();
//! assert_eq!(allocator.stats().class(64).unwrap().free_count, 3);
//! unsafe { allocator.free(ptr, 40).unwrap() };
//! assert_eq!(allocator.stats().class(64).unwrap().free_count, 4);
//! ```
//!
//! The allocator is not thread-safe; see [`LockedAllocator`] for a spin-locked
//! wrapper.

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod allocator;
pub mod config;
pub mod error;
pub mod oversize;
pub mod pages;
pub mod pool;
pub mod stats;

pub use allocator::{Location, LockedAllocator, PoolAllocator};
pub use config::{Config, SizeClass};
pub use error::AllocError;
#[cfg(all(unix, feature = "use_libc"))]
pub use pages::MmapPageSource;
pub use pages::{DefaultPageSource, HeapPageSource, PageSource, ToyHeap};
pub use stats::{ClassStats, OversizeStats, Stats};

/// Every pointer handed out is aligned to this many bytes, and every block
/// size is a multiple of it.
pub const ALIGNMENT: usize = 16;

// Round up value to the nearest multiple of increment, or None on overflow
pub(crate) fn round_up(value: usize, increment: usize) -> Option<usize> {
    if value == 0 {
        return Some(0);
    }
    increment.checked_mul((value - 1) / increment + 1)
}
