//! The oversize region: a bump allocator for requests the pools can't serve.
//!
//! Allocations are carved off a single region by advancing a cursor. They are
//! never reclaimed one by one; freeing one is a deliberate leak. The only way
//! to get the space back is to [`reset`](BumpRegion::reset) the whole region,
//! which starts a new generation and invalidates everything handed out in the
//! previous one.

use core::ops::Range;
use core::ptr::NonNull;

use crate::error::AllocError;
use crate::pages::PageSource;
use crate::{round_up, ALIGNMENT};

pub struct BumpRegion {
    base: NonNull<u8>,
    len: usize,
    cursor: usize,
    generation: u64,
    allocations: u64,
}

// The region is exclusively owned by the BumpRegion.
unsafe impl Send for BumpRegion {}

impl BumpRegion {
    /// Acquire a region of at least `capacity` bytes.
    pub fn create<S: PageSource>(source: &mut S, capacity: usize) -> Result<Self, AllocError> {
        // SAFETY: released only through `release`, with the same source.
        let (base, len) = unsafe { source.acquire(capacity) }.map_err(|err| {
            log::warn!(
                "Page source refused {} bytes for the oversize region: {:?}",
                capacity,
                err
            );
            AllocError::PoolCreationFailed { bytes: capacity }
        })?;

        log::debug!("Created oversize region at {:p} ({} bytes)", base, len);

        Ok(BumpRegion {
            base,
            len,
            cursor: 0,
            generation: 0,
            allocations: 0,
        })
    }

    /// Carve `size` bytes off the region, aligned to [`ALIGNMENT`]. `None` if
    /// there isn't room left.
    pub fn bump(&mut self, size: usize) -> Option<NonNull<u8>> {
        let start = round_up(self.cursor, ALIGNMENT)?;
        let end = start.checked_add(size)?;
        if end > self.len {
            return None;
        }

        self.cursor = end;
        self.allocations += 1;
        // SAFETY: start < end <= len, so this stays inside the region.
        Some(unsafe { NonNull::new_unchecked(self.base.as_ptr().add(start)) })
    }

    /// Rewind the cursor to the start and begin a new generation. Returns the
    /// new generation.
    ///
    /// # Safety
    ///
    /// Every pointer handed out by [`bump`](Self::bump) so far becomes
    /// invalid, and its memory will be handed out again.
    pub unsafe fn reset(&mut self) -> u64 {
        self.cursor = 0;
        self.generation += 1;
        log::debug!(
            "Reset oversize region at {:p}, now generation {}",
            self.base,
            self.generation
        );
        self.generation
    }

    pub fn range(&self) -> Range<*const u8> {
        let start = self.base.as_ptr() as *const u8;
        unsafe { start..start.add(self.len) }
    }

    pub fn contains(&self, ptr: *const u8) -> bool {
        self.range().contains(&ptr)
    }

    /// Total bytes in the region.
    pub fn capacity(&self) -> usize {
        self.len
    }

    /// Bytes handed out in this generation, including alignment padding.
    pub fn used(&self) -> usize {
        self.cursor
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Allocations made over the region's whole life.
    pub fn allocations(&self) -> u64 {
        self.allocations
    }

    /// Hand the region back to the page source.
    ///
    /// # Safety
    ///
    /// `source` must be the page source this region was created from. Every
    /// pointer into the region becomes invalid.
    pub unsafe fn release<S: PageSource>(self, source: &mut S) {
        log::debug!("Releasing oversize region at {:p}", self.base);
        source.release(self.base, self.len);
    }
}
