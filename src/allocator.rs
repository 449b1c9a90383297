//! The allocator proper, and a thread-safe wrapper around it.
//!
//! ## [`PoolAllocator`]
//!
//! A single-threaded set of pools, one per size class, with two fallback
//! tiers behind them: the bump region, then the page source itself. It owns
//! its page source and every region it acquired from it, and hands them all
//! back when destroyed or dropped.
//!
//! ## [`LockedAllocator`]
//!
//! A `PoolAllocator` behind a spin lock, for sharing between threads.

use alloc::vec::Vec;
use core::ptr::NonNull;

use spin::{Mutex, MutexGuard};

use crate::config::Config;
use crate::error::AllocError;
use crate::oversize::BumpRegion;
use crate::pages::PageSource;
use crate::pool::{Pool, Validity};
use crate::stats::{Stats, StatsRecorder};

/// A region acquired for a single request too large for the bump region.
struct Mapping {
    ptr: NonNull<u8>,
    len: usize,
}

// Owned exclusively by the allocator that made it.
unsafe impl Send for Mapping {}

impl Mapping {
    fn contains(&self, ptr: *const u8) -> bool {
        let start = self.ptr.as_ptr() as usize;
        let addr = ptr as usize;
        addr >= start && addr - start < self.len
    }
}

/// Where a pointer lives, as far as an allocator can tell.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Location {
    /// Inside the pool for this block size.
    Pool { block_size: usize },
    /// Inside the bump region.
    Oversize,
    /// Inside a region acquired from the page source for a single request.
    Direct,
    /// Not memory this allocator manages.
    Unknown,
}

/// A size-classed pool allocator.
///
/// Requests are routed to the smallest class whose block size fits. If that
/// pool is exhausted, the request goes to the bump region (or, with
/// [`Config::allow_class_overflow`], to the next larger pools first).
/// Requests larger than the whole bump region go to the page source directly.
///
/// Nothing about outstanding allocations is stored: `free` takes the size
/// back from the caller and works out the owner from the address.
pub struct PoolAllocator<S: PageSource> {
    source: S,
    // Ascending by block size
    pools: Vec<Pool>,
    oversize: Option<BumpRegion>,
    mappings: Vec<Mapping>,
    stats: StatsRecorder,
    config: Config,
}

impl<S: PageSource> Drop for PoolAllocator<S> {
    fn drop(&mut self) {
        self.release_all();
    }
}

impl<S: PageSource> PoolAllocator<S> {
    /// Build an allocator, acquiring every pool and the bump region from
    /// `source` up front.
    ///
    /// If any region can't be acquired, the ones already acquired are released
    /// before the error is returned.
    pub fn new(source: S, config: Config) -> Result<Self, AllocError> {
        let classes = config.sorted_classes()?;

        // Dropping a partly built allocator releases whatever it holds.
        let mut allocator = PoolAllocator {
            source,
            pools: Vec::with_capacity(classes.len()),
            oversize: None,
            mappings: Vec::new(),
            stats: StatsRecorder::new(classes.len()),
            config,
        };

        for class in &classes {
            let pool = Pool::create(
                &mut allocator.source,
                class.block_size,
                class.blocks,
                allocator.config.size_tags,
            )?;
            allocator.pools.push(pool);
        }

        if allocator.config.oversize_capacity > 0 {
            let region =
                BumpRegion::create(&mut allocator.source, allocator.config.oversize_capacity)?;
            allocator.oversize = Some(region);
        }

        log::info!(
            "Pool allocator ready: {} classes, {} byte oversize region",
            allocator.pools.len(),
            allocator.config.oversize_capacity
        );

        Ok(allocator)
    }

    // Index of the smallest pool whose blocks fit `size`
    fn class_index(&self, size: usize) -> Option<usize> {
        self.pools.iter().position(|p| p.block_size() >= size)
    }

    /// The block size a request of `size` bytes is routed to, or `None` if it
    /// is larger than every class.
    pub fn size_class(&self, size: usize) -> Option<usize> {
        if size == 0 {
            return None;
        }
        self.class_index(size).map(|i| self.pools[i].block_size())
    }

    /// Allocate `size` bytes, aligned to [`ALIGNMENT`](crate::ALIGNMENT).
    pub fn allocate(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        if size == 0 {
            return Err(AllocError::InvalidSize);
        }

        if let Some(index) = self.class_index(size) {
            let last = if self.config.allow_class_overflow {
                self.pools.len()
            } else {
                index + 1
            };

            for i in index..last {
                let pool = &mut self.pools[i];
                if let Some(block) = pool.take() {
                    unsafe { pool.write_tag(block, size) };
                    let perfect_fit = pool.block_size() == size;
                    self.stats.record_hit(i, perfect_fit);
                    return Ok(block);
                }
            }

            log::trace!(
                "{} byte class exhausted, falling back for {} bytes",
                self.pools[index].block_size(),
                size
            );
        }

        self.allocate_fallback(size)
    }

    fn allocate_fallback(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        if let Some(region) = self.oversize.as_mut() {
            if size <= region.capacity() {
                return match region.bump(size) {
                    Some(ptr) => {
                        self.stats.record_fallback(false);
                        Ok(ptr)
                    }
                    None => {
                        log::debug!("Oversize region full, can't fit {} bytes", size);
                        self.stats.record_failure();
                        Err(AllocError::OutOfMemory { size })
                    }
                };
            }
        }

        if !self.config.direct_fallback {
            self.stats.record_failure();
            return Err(AllocError::OutOfMemory { size });
        }

        match unsafe { self.source.acquire(size) } {
            Ok((ptr, len)) => {
                log::trace!("Mapped {} bytes at {:p} for {} bytes", len, ptr, size);
                self.mappings.push(Mapping { ptr, len });
                self.stats.record_fallback(true);
                Ok(ptr)
            }
            Err(err) => {
                log::debug!("Page source refused {} bytes: {:?}", size, err);
                self.stats.record_failure();
                Err(AllocError::OutOfMemory { size })
            }
        }
    }

    /// Like [`allocate`](Self::allocate), with the `size` bytes zeroed.
    pub fn allocate_zeroed(&mut self, size: usize) -> Result<NonNull<u8>, AllocError> {
        let ptr = self.allocate(size)?;
        unsafe { ptr.as_ptr().write_bytes(0, size) };
        Ok(ptr)
    }

    /// Free memory returned by [`allocate`](Self::allocate).
    ///
    /// Pool blocks go back on their free list. Bump-region memory is never
    /// reclaimed individually, so freeing it does nothing (see
    /// [`reset_oversize`](Self::reset_oversize)). Direct mappings go back to
    /// the page source.
    ///
    /// The owner is found from the address, not from `size`. A pooled block
    /// always goes back to the pool it came from, even when `size` would route
    /// to a different class: a smaller `size` is accepted, and one larger than
    /// the block is a [`SizeMismatch`](AllocError::SizeMismatch). Only with
    /// [`Config::size_tags`] must `size` match the allocation exactly.
    ///
    /// A pointer this allocator doesn't manage is an error with
    /// [`Config::strict_free`], and is ignored otherwise.
    ///
    /// # Safety
    ///
    /// `size` must be the size `ptr` was allocated with, and nothing may use
    /// the memory afterwards. Without the double-free guard or size tags,
    /// freeing a pooled block twice corrupts its pool.
    pub unsafe fn free(&mut self, ptr: NonNull<u8>, size: usize) -> Result<(), AllocError> {
        if size == 0 {
            return Err(AllocError::InvalidSize);
        }
        let addr = ptr.as_ptr() as *const u8;

        if let Some(index) = self.owning_pool(addr, size) {
            return self.free_pooled(index, ptr, size);
        }

        if self.oversize.as_ref().map_or(false, |r| r.contains(addr)) {
            log::trace!("Leaking {} bytes at {:p} in the oversize region", size, ptr);
            self.stats.record_fallback_free(true);
            return Ok(());
        }

        if let Some(i) = self.mappings.iter().position(|m| m.ptr == ptr) {
            let mapping = self.mappings.swap_remove(i);
            self.source.release(mapping.ptr, mapping.len);
            self.stats.record_fallback_free(false);
            return Ok(());
        }

        self.reject(ptr)
    }

    // The pool whose region holds `ptr`. The class `size` routes to is checked
    // first; the rest only matter after class overflow or a bad size.
    fn owning_pool(&self, ptr: *const u8, size: usize) -> Option<usize> {
        if let Some(index) = self.class_index(size) {
            if self.pools[index].contains(ptr) {
                return Some(index);
            }
        }
        self.pools.iter().position(|p| p.contains(ptr))
    }

    unsafe fn free_pooled(
        &mut self,
        index: usize,
        ptr: NonNull<u8>,
        size: usize,
    ) -> Result<(), AllocError> {
        if self.pools[index].block_index(ptr.as_ptr()).is_none() {
            // Points into the middle of a block
            return self.reject(ptr);
        }

        let addr = ptr.as_ptr() as usize;
        let pool = &mut self.pools[index];

        if size > pool.block_size() {
            return Err(AllocError::SizeMismatch {
                addr,
                expected: pool.block_size(),
                found: size,
            });
        }

        if self.config.double_free_guard && pool.is_free(ptr) {
            log::error!("Double free of {} byte block at {:p}", pool.block_size(), ptr);
            return Err(AllocError::DoubleFree { addr });
        }

        match pool.read_tag(ptr) {
            Some(0) => {
                log::error!("Double free of {} byte block at {:p}", pool.block_size(), ptr);
                return Err(AllocError::DoubleFree { addr });
            }
            Some(tag) if tag != size => {
                return Err(AllocError::SizeMismatch {
                    addr,
                    expected: tag,
                    found: size,
                });
            }
            _ => {}
        }

        pool.give_back(ptr);
        self.stats.record_pool_free(index);
        Ok(())
    }

    fn reject(&self, ptr: NonNull<u8>) -> Result<(), AllocError> {
        if self.config.strict_free {
            log::error!("Free of {:p}, which this allocator never handed out", ptr);
            Err(AllocError::UnknownPointer {
                addr: ptr.as_ptr() as usize,
            })
        } else {
            log::warn!("Ignoring free of unknown pointer {:p}", ptr);
            Ok(())
        }
    }

    /// Where `ptr` lives.
    pub fn locate(&self, ptr: *const u8) -> Location {
        if let Some(pool) = self.pools.iter().find(|p| p.contains(ptr)) {
            return Location::Pool {
                block_size: pool.block_size(),
            };
        }
        if self.oversize.as_ref().map_or(false, |r| r.contains(ptr)) {
            return Location::Oversize;
        }
        if self.mappings.iter().any(|m| m.contains(ptr)) {
            return Location::Direct;
        }
        Location::Unknown
    }

    /// Throw away everything in the bump region and start a new generation.
    /// Returns the new generation, or `None` without a bump region.
    ///
    /// # Safety
    ///
    /// Every pointer the bump region has handed out becomes invalid, and its
    /// memory will be handed out again.
    pub unsafe fn reset_oversize(&mut self) -> Option<u64> {
        self.oversize.as_mut().map(|region| region.reset())
    }

    pub fn oversize_generation(&self) -> Option<u64> {
        self.oversize.as_ref().map(BumpRegion::generation)
    }

    /// A copy of the current counters.
    pub fn stats(&self) -> Stats {
        self.stats.snapshot(&self.pools, self.oversize.as_ref())
    }

    /// Check every pool's free list.
    pub fn validate(&self) -> Validity {
        let mut validity = Validity::default();
        for pool in &self.pools {
            validity.merge(pool.validate());
        }
        validity
    }

    /// The pools, smallest block size first.
    pub fn pools(&self) -> &[Pool] {
        &self.pools
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Hand every region back to the page source. All outstanding pointers
    /// become invalid. Dropping the allocator does the same.
    pub fn destroy(mut self) {
        log::info!("Destroying pool allocator: {}", self.stats());
        self.release_all();
    }

    // Newest regions first. Safe to call twice: everything released is gone.
    fn release_all(&mut self) {
        for mapping in self.mappings.drain(..).rev() {
            unsafe { self.source.release(mapping.ptr, mapping.len) };
        }
        if let Some(region) = self.oversize.take() {
            unsafe { region.release(&mut self.source) };
        }
        while let Some(pool) = self.pools.pop() {
            unsafe { pool.release(&mut self.source) };
        }
    }
}

/// A thread-safe allocator, using a spin lock around a `PoolAllocator`.
pub struct LockedAllocator<S: PageSource> {
    inner: Mutex<PoolAllocator<S>>,
}

impl<S: PageSource> From<PoolAllocator<S>> for LockedAllocator<S> {
    fn from(allocator: PoolAllocator<S>) -> Self {
        LockedAllocator {
            inner: Mutex::new(allocator),
        }
    }
}

impl<S: PageSource> LockedAllocator<S> {
    pub fn new(source: S, config: Config) -> Result<Self, AllocError> {
        PoolAllocator::new(source, config).map(LockedAllocator::from)
    }

    /// Get a reference to the underlying `PoolAllocator`.
    ///
    /// Every other thread's allocations wait while the guard is held.
    pub fn lock(&self) -> MutexGuard<'_, PoolAllocator<S>> {
        self.inner.lock()
    }

    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, AllocError> {
        self.inner.lock().allocate(size)
    }

    /// # Safety
    ///
    /// See [`PoolAllocator::free`].
    pub unsafe fn free(&self, ptr: NonNull<u8>, size: usize) -> Result<(), AllocError> {
        self.inner.lock().free(ptr, size)
    }

    pub fn stats(&self) -> Stats {
        self.inner.lock().stats()
    }

    pub fn into_inner(self) -> PoolAllocator<S> {
        self.inner.into_inner()
    }
}
