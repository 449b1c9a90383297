//! Page sources: where pools and the bump region get their memory from.
//!
//! ## [`PageSource`]
//!
//! A simple trait interface meant to abstract over the calls to the OS (or
//! whatever else) that hand out large, page-granular regions of memory.
//!
//! ## [`MmapPageSource`]
//!
//! Anonymous private `mmap`/`munmap` through `libc`. Only available on unix
//! with the `use_libc` feature, which is on by default.
//!
//! ## [`HeapPageSource`]
//!
//! Page-aligned blocks from the global allocator. Works everywhere `alloc`
//! does, and is what [`DefaultPageSource`] falls back to without `libc`.
//!
//! ## [`ToyHeap`]
//!
//! A fixed buffer that can pretend to be a heap. It keeps count of what has
//! been handed out and given back, which makes it the page source of choice
//! for tests.

use core::alloc::Layout;
use core::fmt;
use core::ptr::NonNull;

#[cfg(all(unix, feature = "use_libc"))]
use core::ptr::null_mut;

#[cfg(all(unix, feature = "use_libc"))]
use errno::Errno;

use crate::{round_up, ALIGNMENT};

pub trait PageSource {
    type Err: fmt::Debug;

    /// Acquire at least `size` bytes. Returns a pointer and the size of the
    /// memory available at that pointer.
    ///
    /// # Safety
    ///
    /// For this to function properly with the other types in this crate:
    ///
    /// - On success, the returned length must be at least `size`, and the
    ///   memory must be aligned to at least [`ALIGNMENT`] bytes.
    /// - The memory must be readable, writable, and untracked by any other
    ///   rust code until it is passed back to [`release`](Self::release).
    unsafe fn acquire(&mut self, size: usize) -> Result<(NonNull<u8>, usize), Self::Err>;

    /// Give a region back.
    ///
    /// # Safety
    ///
    /// `ptr` and `size` must be exactly a pointer and length previously
    /// returned by [`acquire`](Self::acquire) on this source, not yet
    /// released, and nothing may touch the memory afterwards.
    unsafe fn release(&mut self, ptr: NonNull<u8>, size: usize);

    /// The granularity regions are rounded up to.
    fn page_size(&self) -> usize;
}

impl<S: PageSource + ?Sized> PageSource for &mut S {
    type Err = S::Err;

    unsafe fn acquire(&mut self, size: usize) -> Result<(NonNull<u8>, usize), Self::Err> {
        (**self).acquire(size)
    }

    unsafe fn release(&mut self, ptr: NonNull<u8>, size: usize) {
        (**self).release(ptr, size)
    }

    fn page_size(&self) -> usize {
        (**self).page_size()
    }
}

/// The page source used when none is given explicitly.
#[cfg(all(unix, feature = "use_libc"))]
pub type DefaultPageSource = MmapPageSource;

/// The page source used when none is given explicitly.
#[cfg(not(all(unix, feature = "use_libc")))]
pub type DefaultPageSource = HeapPageSource;

/// MmapPageSource uses virtual memory to hand out regions upon request.
#[cfg(all(unix, feature = "use_libc"))]
#[derive(Default, Debug)]
pub struct MmapPageSource {
    // Just for tracking, not really needed
    pages: usize,
    mappings: usize,
}

#[cfg(all(unix, feature = "use_libc"))]
impl MmapPageSource {
    pub const fn new() -> Self {
        MmapPageSource {
            pages: 0,
            mappings: 0,
        }
    }

    /// Pages currently mapped through this source.
    pub fn pages(&self) -> usize {
        self.pages
    }

    /// Mappings currently live.
    pub fn mappings(&self) -> usize {
        self.mappings
    }
}

#[cfg(all(unix, feature = "use_libc"))]
impl PageSource for MmapPageSource {
    type Err = Errno;

    unsafe fn acquire(&mut self, size: usize) -> Result<(NonNull<u8>, usize), Errno> {
        let pagesize = self.page_size();
        let to_allocate = round_up(size.max(1), pagesize).ok_or(Errno(libc::ENOMEM))?;

        let ptr = libc::mmap(
            // Address we want the memory at. We don't care, so null it is.
            null_mut(),
            // Amount of memory to allocate
            to_allocate,
            // We want read/write access to this memory
            libc::PROT_WRITE | libc::PROT_READ,
            // MAP_ANON: We don't want a file descriptor, we're just going to
            //   use the memory.
            //
            // MAP_PRIVATE: We're not sharing this with any other process.
            libc::MAP_ANON | libc::MAP_PRIVATE,
            // No file behind the mapping.
            -1,
            0,
        );

        if ptr == libc::MAP_FAILED {
            return Err(errno::errno());
        }

        let ptr = NonNull::new(ptr as *mut u8).ok_or(Errno(libc::ENOMEM))?;

        self.pages += to_allocate / pagesize;
        self.mappings += 1;

        Ok((ptr, to_allocate))
    }

    unsafe fn release(&mut self, ptr: NonNull<u8>, size: usize) {
        if libc::munmap(ptr.as_ptr() as *mut libc::c_void, size) != 0 {
            log::warn!("munmap({:p}, {}) failed: {}", ptr, size, errno::errno());
            return;
        }

        self.pages -= size / self.page_size();
        self.mappings -= 1;
    }

    fn page_size(&self) -> usize {
        sysconf::page::pagesize()
    }
}

/// Page-aligned regions from the global allocator.
#[derive(Default, Debug, Clone, Copy)]
pub struct HeapPageSource;

/// The global allocator returned null.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapExhausted {
    pub requested: usize,
}

impl HeapPageSource {
    /// Page size is 4 kb "on most architectures"
    pub const PAGE_SIZE: usize = 4096;

    fn layout(size: usize) -> Option<Layout> {
        let rounded = round_up(size.max(1), Self::PAGE_SIZE)?;
        Layout::from_size_align(rounded, Self::PAGE_SIZE).ok()
    }
}

impl PageSource for HeapPageSource {
    type Err = HeapExhausted;

    unsafe fn acquire(&mut self, size: usize) -> Result<(NonNull<u8>, usize), HeapExhausted> {
        let layout = Self::layout(size).ok_or(HeapExhausted { requested: size })?;
        let ptr = alloc::alloc::alloc(layout);
        NonNull::new(ptr)
            .map(|p| (p, layout.size()))
            .ok_or(HeapExhausted { requested: size })
    }

    unsafe fn release(&mut self, ptr: NonNull<u8>, size: usize) {
        // `size` came out of `acquire`, so it is already page-rounded and
        // rebuilds the same layout.
        if let Some(layout) = Self::layout(size) {
            alloc::alloc::dealloc(ptr.as_ptr(), layout);
        }
    }

    fn page_size(&self) -> usize {
        Self::PAGE_SIZE
    }
}

/// A fixed buffer pretending to be a heap.
///
/// Regions are carved off the top in `page_size` steps. Releasing the topmost
/// region lowers the top again; anything else released is only counted.
pub struct ToyHeap {
    pub page_size: usize,
    /// Bytes between the bottom of the buffer and the current top.
    pub size: usize,
    heap: NonNull<u8>,
    layout: Layout,
    live: usize,
    acquisitions: usize,
    releases: usize,
}

/// The toy heap has no room left for the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToyHeapOverflowError {
    pub requested: usize,
}

// The buffer is owned exclusively by the ToyHeap.
unsafe impl Send for ToyHeap {}

impl Default for ToyHeap {
    fn default() -> Self {
        ToyHeap::new(256 * 1024, 64)
    }
}

impl ToyHeap {
    /// A toy heap of (at least) `capacity` bytes handing out regions in
    /// multiples of `page_size`.
    ///
    /// Panics if `page_size` is not a power of two of at least [`ALIGNMENT`].
    pub fn new(capacity: usize, page_size: usize) -> Self {
        assert!(
            page_size >= ALIGNMENT && page_size.is_power_of_two(),
            "ToyHeap page size must be a power of two >= {}, got {}",
            ALIGNMENT,
            page_size
        );
        let capacity = round_up(capacity.max(1), page_size).expect("ToyHeap capacity overflows");
        let layout =
            Layout::from_size_align(capacity, page_size).expect("ToyHeap capacity overflows");

        let heap = unsafe { alloc::alloc::alloc_zeroed(layout) };
        let heap = match NonNull::new(heap) {
            Some(heap) => heap,
            None => alloc::alloc::handle_alloc_error(layout),
        };

        ToyHeap {
            page_size,
            size: 0,
            heap,
            layout,
            live: 0,
            acquisitions: 0,
            releases: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.layout.size()
    }

    /// Bytes acquired and not yet released.
    pub fn live_bytes(&self) -> usize {
        self.live
    }

    pub fn acquisitions(&self) -> usize {
        self.acquisitions
    }

    pub fn releases(&self) -> usize {
        self.releases
    }

    /// Whether `ptr` points into the buffer.
    pub fn contains(&self, ptr: *const u8) -> bool {
        let start = self.heap.as_ptr() as usize;
        let addr = ptr as usize;
        addr >= start && addr < start + self.capacity()
    }
}

impl Drop for ToyHeap {
    fn drop(&mut self) {
        unsafe { alloc::alloc::dealloc(self.heap.as_ptr(), self.layout) };
    }
}

impl PageSource for ToyHeap {
    type Err = ToyHeapOverflowError;

    unsafe fn acquire(&mut self, size: usize) -> Result<(NonNull<u8>, usize), Self::Err> {
        let overflow = ToyHeapOverflowError { requested: size };
        let allocating = round_up(size.max(1), self.page_size).ok_or(overflow)?;
        if allocating > self.capacity() - self.size {
            return Err(overflow);
        }

        let ptr = NonNull::new_unchecked(self.heap.as_ptr().add(self.size));
        self.size += allocating;
        self.live += allocating;
        self.acquisitions += 1;
        Ok((ptr, allocating))
    }

    unsafe fn release(&mut self, ptr: NonNull<u8>, size: usize) {
        self.live -= size;
        self.releases += 1;

        let top = self.heap.as_ptr().add(self.size);
        if ptr.as_ptr().add(size) == top {
            self.size -= size;
        }
    }

    fn page_size(&self) -> usize {
        self.page_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use test_log::test;

    #[test]
    fn test_toy_heap_rounds_to_pages() {
        let mut heap = ToyHeap::new(1024, 64);

        let (first, len) = unsafe { heap.acquire(100).unwrap() };
        assert_eq!(len, 128);
        assert_eq!(first.as_ptr() as usize % 64, 0);
        assert_eq!(heap.size, 128);

        let (second, len) = unsafe { heap.acquire(1).unwrap() };
        assert_eq!(len, 64);
        assert_eq!(second.as_ptr(), unsafe { first.as_ptr().add(128) });
        assert_eq!(heap.live_bytes(), 192);
        assert_eq!(heap.acquisitions(), 2);
    }

    #[test]
    fn test_toy_heap_overflow() {
        let mut heap = ToyHeap::new(256, 64);
        assert!(unsafe { heap.acquire(192) }.is_ok());
        let err = unsafe { heap.acquire(128) }.unwrap_err();
        assert_eq!(err, ToyHeapOverflowError { requested: 128 });
        // A failed request leaves the heap alone
        assert_eq!(heap.size, 192);
        assert!(unsafe { heap.acquire(64) }.is_ok());
    }

    #[test]
    fn test_toy_heap_release_lowers_top() {
        let mut heap = ToyHeap::new(1024, 64);
        let (a, a_len) = unsafe { heap.acquire(64).unwrap() };
        let (b, b_len) = unsafe { heap.acquire(64).unwrap() };

        // Releasing a region below the top only counts it
        unsafe { heap.release(a, a_len) };
        assert_eq!(heap.size, 128);
        assert_eq!(heap.live_bytes(), 64);

        unsafe { heap.release(b, b_len) };
        assert_eq!(heap.size, 64);
        assert_eq!(heap.live_bytes(), 0);
        assert_eq!(heap.releases(), 2);
    }

    #[test]
    fn test_borrowed_source_delegates() {
        fn round_trip<S: PageSource>(mut source: S) {
            assert_eq!(source.page_size(), 64);
            let (ptr, len) = unsafe { source.acquire(10).unwrap() };
            unsafe { source.release(ptr, len) };
        }

        let mut heap = ToyHeap::new(1024, 64);
        round_trip(&mut heap);
        assert_eq!(heap.acquisitions(), 1);
        assert_eq!(heap.releases(), 1);
        assert_eq!(heap.live_bytes(), 0);
    }

    #[test]
    fn test_heap_page_source() {
        let mut source = HeapPageSource;
        let (ptr, len) = unsafe { source.acquire(5000).unwrap() };
        assert_eq!(len, 2 * HeapPageSource::PAGE_SIZE);
        assert_eq!(ptr.as_ptr() as usize % HeapPageSource::PAGE_SIZE, 0);
        unsafe {
            ptr.as_ptr().write_bytes(0xAB, len);
            assert_eq!(ptr.as_ptr().add(len - 1).read(), 0xAB);
            source.release(ptr, len);
        }
    }

    #[cfg(all(unix, feature = "use_libc"))]
    #[test]
    fn test_mmap_page_source() {
        let mut source = MmapPageSource::new();
        let pagesize = source.page_size();

        let (ptr, len) = unsafe { source.acquire(8).unwrap() };
        log::info!("Returned: ({:p}, {})", ptr, len);
        assert_eq!(len, pagesize);
        assert_eq!(source.pages(), 1);
        assert_eq!(source.mappings(), 1);

        unsafe {
            ptr.as_ptr().write_bytes(0x11, len);
            source.release(ptr, len);
        }
        assert_eq!(source.pages(), 0);
        assert_eq!(source.mappings(), 0);
    }
}
