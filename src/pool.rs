use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use core::ops::Range;
use core::ptr::NonNull;

use static_assertions::const_assert;

use crate::error::AllocError;
use crate::pages::PageSource;
use crate::ALIGNMENT;

/// The header for our free blocks.
///
/// It lives in the first bytes of the block itself, and only while the block
/// is free: once handed out, the client owns those bytes.
///
/// We use C representation and align to 16 bytes, the same as every block.
#[repr(C, align(16))]
pub struct FreeNode {
    next: Option<NonNull<FreeNode>>,
}

/// Every block is at least this large, so that a free block can hold its
/// header.
pub const HEADER_SIZE: usize = 16;
const_assert!(HEADER_SIZE == core::mem::size_of::<FreeNode>());
const_assert!(HEADER_SIZE % ALIGNMENT == 0);

/// Bytes in front of each block when size tags are on. The tag is a single
/// `usize`; the rest is padding to keep blocks aligned.
pub const TAG_SIZE: usize = 16;
const_assert!(TAG_SIZE >= core::mem::size_of::<usize>());
const_assert!(TAG_SIZE % ALIGNMENT == 0);

/// A `Pool` serves a single size class out of one contiguous region.
///
/// The region is cut into `blocks_total` slots of `stride` bytes. Without size
/// tags the stride is the block size; with them, each slot starts with a
/// [`TAG_SIZE`] tag holding the size requested for the block, followed by the
/// block itself.
///
/// It maintains a few internal invariants:
///
/// - `free_head` is `None` or points at the block start of a free slot in
///   this pool, and so does every `next` link after it.
/// - The free list has exactly `free_count` entries, never more than
///   `blocks_total`.
/// - A slot is either on the free list or handed out, never both. Its bit in
///   `in_use` says which, and lives outside the region so clients can't
///   touch it.
pub struct Pool {
    block_size: usize,
    blocks_total: usize,
    stride: usize,
    tag_size: usize,
    region: NonNull<u8>,
    region_len: usize,
    free_head: Option<NonNull<FreeNode>>,
    free_count: usize,
    // One bit per slot, set while the block is handed out
    in_use: Vec<u64>,
}

// A Pool is sendable - it exclusively owns its region and every link in its
// free list points into that region.
unsafe impl Send for Pool {}

/// Validity contains a representation of all invalid states found in a
/// pool's free list.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct Validity {
    /// Number of links pointing outside their pool, or into the middle of a
    /// slot.
    ///
    /// This indicates corruption; the walk stops at the first one.
    pub stray_links: usize,

    /// Number of free lists longer than their pool, which means they loop.
    ///
    /// A block freed twice without the guard ends up here.
    pub cycles: usize,

    /// Number of pools whose free count disagrees with their list.
    pub count_mismatches: usize,
}

impl Validity {
    /// Returns a boolean - a simple check if all cases are 0
    pub fn is_valid(&self) -> bool {
        self.stray_links == 0 && self.cycles == 0 && self.count_mismatches == 0
    }

    /// Fold another pool's findings into this one.
    pub fn merge(&mut self, other: Validity) {
        self.stray_links += other.stray_links;
        self.cycles += other.cycles;
        self.count_mismatches += other.count_mismatches;
    }
}

impl From<Validity> for bool {
    fn from(v: Validity) -> bool {
        v.is_valid()
    }
}

impl Pool {
    /// Acquire a region for `blocks_total` blocks of `block_size` bytes and
    /// put every block on the free list, in address order.
    ///
    /// `block_size` must be a multiple of [`ALIGNMENT`] and at least
    /// [`HEADER_SIZE`]; [`Config`](crate::Config) checks this.
    pub fn create<S: PageSource>(
        source: &mut S,
        block_size: usize,
        blocks_total: usize,
        tagged: bool,
    ) -> Result<Pool, AllocError> {
        debug_assert!(block_size >= HEADER_SIZE && block_size % ALIGNMENT == 0);
        debug_assert!(blocks_total > 0);

        let tag_size = if tagged { TAG_SIZE } else { 0 };
        let stride = block_size
            .checked_add(tag_size)
            .ok_or(AllocError::PoolCreationFailed { bytes: usize::MAX })?;
        let bytes = stride
            .checked_mul(blocks_total)
            .ok_or(AllocError::PoolCreationFailed { bytes: usize::MAX })?;

        // SAFETY: the region is handed back to a page source only through
        // `release`, whose caller promises it is this same source.
        let (region, region_len) = unsafe { source.acquire(bytes) }.map_err(|err| {
            log::warn!(
                "Page source refused {} bytes for the {} byte class: {:?}",
                bytes,
                block_size,
                err
            );
            AllocError::PoolCreationFailed { bytes }
        })?;
        debug_assert!(region_len >= bytes);
        debug_assert!(region.as_ptr() as usize % ALIGNMENT == 0);

        let mut pool = Pool {
            block_size,
            blocks_total,
            stride,
            tag_size,
            region,
            region_len,
            free_head: None,
            free_count: 0,
            in_use: vec![0; blocks_total.div_ceil(64)],
        };

        // Push from the top down, so the list ends up in address order and the
        // first block handed out is the lowest one.
        for index in (0..blocks_total).rev() {
            let block = pool.block_at(index);
            unsafe {
                pool.give_back(block);
            }
        }

        log::debug!(
            "Created pool of {} x {} bytes at {:p} ({} bytes)",
            blocks_total,
            block_size,
            region,
            region_len
        );

        Ok(pool)
    }

    // The start of the block in slot `index`.
    fn block_at(&self, index: usize) -> NonNull<u8> {
        debug_assert!(index < self.blocks_total);
        unsafe {
            NonNull::new_unchecked(
                self.region
                    .as_ptr()
                    .add(index * self.stride + self.tag_size),
            )
        }
    }

    // Slot of a block start; callers guarantee `block` is one.
    fn slot_of(&self, block: NonNull<u8>) -> usize {
        let offset = block.as_ptr() as usize - self.region.as_ptr() as usize;
        (offset - self.tag_size) / self.stride
    }

    fn mark(&mut self, slot: usize, in_use: bool) {
        let bit = 1u64 << (slot % 64);
        let word = &mut self.in_use[slot / 64];
        if in_use {
            *word |= bit;
        } else {
            *word &= !bit;
        }
    }

    /// Pop the head of the free list, or `None` if the pool is exhausted.
    ///
    /// An exhausted pool is left untouched.
    pub fn take(&mut self) -> Option<NonNull<u8>> {
        let mut node = self.free_head?;

        // SAFETY: by the pool invariants, free_head points at a free block
        // of this pool holding a valid header.
        unsafe {
            self.free_head = node.as_mut().next.take();
        }
        self.free_count -= 1;

        let block = node.cast();
        self.mark(self.slot_of(block), true);
        Some(block)
    }

    /// Push a block back onto the free list.
    ///
    /// # Safety
    ///
    /// `block` must be the start of a block of this pool (see
    /// [`block_index`](Self::block_index)) that is currently handed out.
    /// Giving back a block that is already free corrupts the free list.
    #[allow(clippy::cast_ptr_alignment)]
    pub unsafe fn give_back(&mut self, block: NonNull<u8>) {
        self.write_tag(block, 0);

        let node: NonNull<FreeNode> = block.cast();
        node.as_ptr().write(FreeNode {
            next: self.free_head,
        });
        self.free_head = Some(node);
        self.free_count += 1;
        self.mark(self.slot_of(block), false);
    }

    /// Whether `block` is a block start of this pool that is not handed out.
    ///
    /// Reads only the pool's own bookkeeping, never the block, so nothing a
    /// client writes into a block can change the answer.
    pub fn is_free(&self, block: NonNull<u8>) -> bool {
        match self.block_index(block.as_ptr()) {
            Some(slot) => self.in_use[slot / 64] & (1u64 << (slot % 64)) == 0,
            None => false,
        }
    }

    /// Record `size` in the block's tag. Does nothing without size tags.
    ///
    /// # Safety
    ///
    /// `block` must be the start of a block of this pool.
    #[allow(clippy::cast_ptr_alignment)]
    pub unsafe fn write_tag(&mut self, block: NonNull<u8>, size: usize) {
        if self.tag_size == 0 {
            return;
        }
        (block.as_ptr().sub(self.tag_size) as *mut usize).write(size);
    }

    /// The size recorded in the block's tag: zero while the block is free, and
    /// `None` without size tags.
    ///
    /// # Safety
    ///
    /// `block` must be the start of a block of this pool.
    #[allow(clippy::cast_ptr_alignment)]
    pub unsafe fn read_tag(&self, block: NonNull<u8>) -> Option<usize> {
        if self.tag_size == 0 {
            return None;
        }
        Some((block.as_ptr().sub(self.tag_size) as *const usize).read())
    }

    /// The bytes covered by this pool's slots.
    pub fn range(&self) -> Range<*const u8> {
        let start = self.region.as_ptr() as *const u8;
        unsafe { start..start.add(self.stride * self.blocks_total) }
    }

    /// Whether `ptr` points anywhere into this pool's slots.
    pub fn contains(&self, ptr: *const u8) -> bool {
        self.range().contains(&ptr)
    }

    /// The slot `ptr` is the block start of, or `None` if it isn't one.
    pub fn block_index(&self, ptr: *const u8) -> Option<usize> {
        if !self.contains(ptr) {
            return None;
        }
        let offset = ptr as usize - self.region.as_ptr() as usize;
        if offset % self.stride != self.tag_size {
            return None;
        }
        Some(offset / self.stride)
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn blocks_total(&self) -> usize {
        self.blocks_total
    }

    pub fn free_count(&self) -> usize {
        self.free_count
    }

    pub fn is_exhausted(&self) -> bool {
        self.free_head.is_none()
    }

    /// Whether the pool was laid out with size tags.
    pub fn is_tagged(&self) -> bool {
        self.tag_size != 0
    }

    /// Iterate over the free blocks, head first.
    ///
    /// The walk stops after a link that leaves the pool, and after
    /// `blocks_total + 1` blocks, so a corrupt list can't send it anywhere
    /// else or loop forever.
    pub fn iter(&self) -> FreeIter<'_> {
        FreeIter {
            pool: self,
            next: self.free_head,
            remaining: self.blocks_total + 1,
        }
    }

    /// Walk the free list and check it against the pool invariants.
    pub fn validate(&self) -> Validity {
        let mut validity = Validity::default();
        let mut length = 0;

        for block in self.iter() {
            if self.block_index(block.as_ptr()).is_none() {
                validity.stray_links += 1;
                return validity;
            }
            length += 1;
        }

        if length > self.blocks_total {
            validity.cycles += 1;
        } else if length != self.free_count {
            validity.count_mismatches += 1;
        }

        validity
    }

    /// Hand the region back to the page source.
    ///
    /// # Safety
    ///
    /// `source` must be the page source this pool was created from. Every
    /// block of the pool becomes invalid.
    pub unsafe fn release<S: PageSource>(self, source: &mut S) {
        log::debug!(
            "Releasing pool of {} x {} bytes at {:p}",
            self.blocks_total,
            self.block_size,
            self.region
        );
        source.release(self.region, self.region_len);
    }
}

pub struct FreeIter<'pool> {
    pool: &'pool Pool,
    next: Option<NonNull<FreeNode>>,
    remaining: usize,
}

impl<'pool> Iterator for FreeIter<'pool> {
    type Item = NonNull<u8>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let node = self.next.take()?;
        self.remaining -= 1;

        // Only follow links that stay inside the pool.
        if self.pool.block_index(node.as_ptr() as *const u8).is_some() {
            self.next = unsafe { node.as_ref().next };
        }

        Some(node.cast())
    }
}

impl fmt::Display for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Pool({} x {}, {} free: ",
            self.blocks_total, self.block_size, self.free_count
        )?;
        let mut start = true;
        for block in self.iter() {
            if !start {
                write!(f, ", ")?;
            } else {
                start = false;
            }
            write!(f, "{:?}", block)?;
        }

        write!(f, ")")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use alloc::format;
    use alloc::vec::Vec;

    use test_log::test;

    use crate::pages::ToyHeap;

    #[test]
    fn test_create_threads_blocks_in_order() {
        let mut heap = ToyHeap::default();
        let mut pool = Pool::create(&mut heap, 64, 4, false).unwrap();
        log::info!("created: {}", pool);

        assert_eq!(pool.free_count(), 4);
        assert!(pool.validate().is_valid());

        let start = pool.range().start;
        let blocks: Vec<*const u8> = (0..4)
            .map(|_| pool.take().unwrap().as_ptr() as *const u8)
            .collect();
        for (i, &block) in blocks.iter().enumerate() {
            assert_eq!(block, unsafe { start.add(i * 64) });
            assert_eq!(pool.block_index(block), Some(i));
        }

        assert!(pool.is_exhausted());
        assert_eq!(pool.free_count(), 0);
        assert!(pool.validate().is_valid());

        unsafe { pool.release(&mut heap) };
        assert_eq!(heap.live_bytes(), 0);
    }

    #[test]
    fn test_exhausted_pool_is_untouched() {
        let mut heap = ToyHeap::default();
        let mut pool = Pool::create(&mut heap, 32, 1, false).unwrap();

        assert!(pool.take().is_some());
        assert!(pool.take().is_none());
        assert!(pool.take().is_none());
        assert_eq!(pool.free_count(), 0);
        assert!(pool.validate().is_valid());
    }

    #[test]
    fn test_give_back_is_lifo() {
        let mut heap = ToyHeap::default();
        let mut pool = Pool::create(&mut heap, 64, 4, false).unwrap();

        let a = pool.take().unwrap();
        let b = pool.take().unwrap();
        unsafe {
            pool.give_back(a);
            pool.give_back(b);
        }
        log::info!("after give_back: {}", pool);
        assert_eq!(pool.free_count(), 4);
        assert!(pool.validate().is_valid());

        // Most recently freed first
        assert_eq!(pool.take(), Some(b));
        assert_eq!(pool.take(), Some(a));
    }

    #[test]
    fn test_in_use_bits_track_blocks() {
        let mut heap = ToyHeap::default();
        let mut pool = Pool::create(&mut heap, 16, 70, false).unwrap();

        let blocks: Vec<_> = (0..70).map(|_| pool.take().unwrap()).collect();
        assert!(blocks.iter().all(|&b| !pool.is_free(b)));

        // Slots past the first word
        unsafe { pool.give_back(blocks[66]) };
        assert!(pool.is_free(blocks[66]));
        assert!(!pool.is_free(blocks[65]));
        assert!(!pool.is_free(blocks[2]));

        let interior = unsafe { NonNull::new_unchecked(blocks[3].as_ptr().add(8)) };
        assert!(!pool.is_free(interior));
    }

    #[test]
    fn test_block_contents_dont_affect_free_bits() {
        let mut heap = ToyHeap::default();
        let mut pool = Pool::create(&mut heap, 32, 2, false).unwrap();

        let block = pool.take().unwrap();
        // Whatever a free block's header looks like, a live one can hold it
        let free_neighbour = pool.iter().next().unwrap();
        unsafe {
            core::ptr::copy_nonoverlapping(free_neighbour.as_ptr(), block.as_ptr(), 32);
        }
        assert!(!pool.is_free(block));
        assert!(pool.is_free(free_neighbour));
    }

    #[test]
    fn test_double_give_back_is_caught_by_validate() {
        let mut heap = ToyHeap::default();
        let mut pool = Pool::create(&mut heap, 64, 3, false).unwrap();

        let block = pool.take().unwrap();
        unsafe {
            pool.give_back(block);
            pool.give_back(block);
        }

        // The block now links to itself
        let validity = pool.validate();
        assert!(!validity.is_valid());
        assert_eq!(validity.cycles, 1);
        assert_eq!(pool.iter().count(), 4);
    }

    #[test]
    fn test_block_index_rejects_interior_pointers() {
        let mut heap = ToyHeap::default();
        let pool = Pool::create(&mut heap, 64, 2, false).unwrap();
        let start = pool.range().start;

        assert_eq!(pool.block_index(start), Some(0));
        assert_eq!(pool.block_index(unsafe { start.add(8) }), None);
        assert_eq!(pool.block_index(unsafe { start.add(64) }), Some(1));
        assert_eq!(pool.block_index(unsafe { start.add(128) }), None);
        assert!(!pool.contains(unsafe { start.add(128) }));
    }

    #[test]
    fn test_tagged_layout() {
        let mut heap = ToyHeap::default();
        let mut pool = Pool::create(&mut heap, 64, 2, true).unwrap();
        assert!(pool.is_tagged());

        let start = pool.range().start;
        assert_eq!(pool.range().end, unsafe { start.add(2 * (64 + TAG_SIZE)) });

        let first = pool.take().unwrap();
        assert_eq!(first.as_ptr() as *const u8, unsafe { start.add(TAG_SIZE) });
        assert_eq!(pool.block_index(start), None);
        assert_eq!(pool.block_index(first.as_ptr()), Some(0));

        unsafe {
            assert_eq!(pool.read_tag(first), Some(0));
            pool.write_tag(first, 48);
            assert_eq!(pool.read_tag(first), Some(48));
            pool.give_back(first);
            assert_eq!(pool.read_tag(first), Some(0));
        }
    }

    #[test]
    fn test_untagged_pool_has_no_tags() {
        let mut heap = ToyHeap::default();
        let mut pool = Pool::create(&mut heap, 64, 1, false).unwrap();
        let block = pool.take().unwrap();
        unsafe {
            pool.write_tag(block, 10);
            assert_eq!(pool.read_tag(block), None);
        }
    }

    #[test]
    fn test_create_fails_cleanly() {
        let mut heap = ToyHeap::new(256, 64);
        let err = Pool::create(&mut heap, 64, 8, false).err().unwrap();
        assert_eq!(err, AllocError::PoolCreationFailed { bytes: 512 });
        assert_eq!(heap.live_bytes(), 0);
    }

    #[test]
    fn test_display() {
        let mut heap = ToyHeap::default();
        let mut pool = Pool::create(&mut heap, 16, 2, false).unwrap();
        pool.take().unwrap();
        pool.take().unwrap();
        assert_eq!(format!("{}", pool), "Pool(2 x 16, 0 free: )");
    }
}
