//! Two-level segregated fit allocator.
//!
//! Based on "Implementation of a constant-time dynamic storage allocator" by
//! Masmano et al. Free blocks are kept in segregated doubly-linked lists
//! indexed by a two-level size class; two bitmaps make the suitable-list
//! search a pair of bit scans, so allocate and deallocate are O(1). Boundary
//! tags at both ends of every block let deallocation coalesce with physical
//! neighbors immediately.
//!
//! The implementation is NOT thread-safe.

mod block;

use core::alloc::Layout;
use core::cell::Cell;
use core::ptr::{self, NonNull};

use block::{BoundaryTag, FreeBlock, TAG_ALIGN, TAG_SIZE};

use super::traits::assert_fundamental_alignment;
use super::{AllocError, AllocResult, Allocator, MemoryUsage};
use crate::utils::{MAX_ALIGN, aligned_offset};

/// Snapshot of a [`TlsfAllocator`]'s counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TlsfStats {
    /// Live allocations
    pub allocation_count: usize,
    /// Live allocations that occupy a minimum-size block
    pub small_allocation_count: usize,
    /// Bytes in allocated blocks, headers and padding included
    pub allocated_byte_count: usize,
    /// Highest value `allocated_byte_count` has reached
    pub allocated_byte_count_high_watermark: usize,
    /// Bytes in free blocks
    pub free_byte_count: usize,
}

/// Number of second-level ranges each first-level bucket is split into.
const J: usize = 5;
const SECOND_LEVEL_RANGE_COUNT: usize = 1 << J;
const _: () = assert!(
    usize::BITS as usize >= SECOND_LEVEL_RANGE_COUNT,
    "second level ranges have to fit the bitmap word"
);

/// Smaller blocks would need special handling as second-level lists could
/// have extra ranges, and a free block must fit the list record plus its
/// back tag.
const MIN_BLOCK_SIZE: usize = 128;
const _: () = assert!(MIN_BLOCK_SIZE > size_of::<FreeBlock>() + TAG_SIZE);

/// Space ahead of the user pointer: front tag, pointer back to the front
/// tag, and alignment slack for the user pointer itself.
const PRE_ALLOC_PADDING: usize = TAG_SIZE + size_of::<*mut u8>() + MAX_ALIGN;

/// Position of a free list in the two-level index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FreeListIndex {
    fl: usize,
    sl: usize,
}

/// Index of the highest set bit
#[inline]
fn fls(v: usize) -> usize {
    debug_assert!(v != 0);
    (usize::BITS - 1 - v.leading_zeros()) as usize
}

/// Index of the lowest set bit
#[inline]
fn ffs(v: usize) -> usize {
    debug_assert!(v != 0);
    v.trailing_zeros() as usize
}

/// Constant-time general-purpose allocator over a single backing buffer.
///
/// The buffer holds the index metadata (second-level bitmap words and
/// segregated list heads), a sentinel tag, the managed region and a closing
/// sentinel tag, in that order. Allocated blocks carry a pointer to their
/// front tag right before the user pointer, so `deallocate` recovers the
/// block without any lookup.
///
/// Note that the allocator might not be able to allocate a single block with
/// size near or matching the capacity due to how available blocks are
/// searched internally.
pub struct TlsfAllocator {
    data: NonNull<u8>,
    backing_layout: Layout,
    full_size: usize,
    first_block_addr: usize,
    first_level_bucket_count: usize,
    first_level_bitmap: Cell<usize>,
    second_level_bitmaps: NonNull<usize>,
    segregated_lists: NonNull<*mut FreeBlock>,
    stats: Cell<TlsfStats>,
}

impl TlsfAllocator {
    /// Creates an allocator managing `capacity` bytes.
    ///
    /// # Errors
    /// Returns an error if the backing buffer cannot be allocated.
    ///
    /// # Panics
    /// Panics if `capacity` is under 1 KiB; the first size bucket starts at
    /// the minimum block size and tiny arenas aren't worth the metadata.
    pub fn new(capacity: usize) -> AllocResult<Self> {
        assert!(capacity >= 1024, "TLSF arena capacity must be at least 1 KiB");

        // Boundary tags are written right after the managed bytes
        let capacity = aligned_offset(capacity, TAG_ALIGN);

        // Need alignment and space for the back boundary tag. Could skip the
        // alignment when allocation alignment and size are nice, but that
        // only saves a handful of bytes.
        let mut block_size = PRE_ALLOC_PADDING + capacity;
        block_size = aligned_offset(block_size, TAG_ALIGN);
        block_size += TAG_SIZE;

        // Buckets have to cover the initial block, whose byte count includes
        // the allocation overhead on top of the requested capacity
        let first_level_bucket_count = fls(block_size) + 1;

        let metadata_size = size_of::<usize>()
            + size_of::<usize>() * first_level_bucket_count
            + size_of::<*mut FreeBlock>() * SECOND_LEVEL_RANGE_COUNT * first_level_bucket_count
            + TAG_SIZE
            + MAX_ALIGN;

        // Metadata and the memory pool are backed by the same allocation
        let full_size = metadata_size + block_size + TAG_SIZE;
        let backing_layout =
            Layout::from_size_align(full_size, MAX_ALIGN).map_err(|_| AllocError::InvalidLayout)?;
        let data = NonNull::new(unsafe { std::alloc::alloc(backing_layout) })
            .ok_or(AllocError::out_of_memory(backing_layout))?;

        // Set up metadata at the front of the chunk
        let second_level_bitmaps = data.cast::<usize>();
        unsafe {
            ptr::write_bytes(second_level_bitmaps.as_ptr(), 0, first_level_bucket_count);
        }
        let segregated_lists = unsafe {
            second_level_bitmaps
                .add(first_level_bucket_count)
                .cast::<*mut FreeBlock>()
        };
        let head_count = first_level_bucket_count * SECOND_LEVEL_RANGE_COUNT;
        unsafe {
            ptr::write_bytes(segregated_lists.as_ptr(), 0, head_count);
        }

        let front_tag = unsafe { segregated_lists.add(head_count).cast::<BoundaryTag>() };
        debug_assert!(front_tag.as_ptr() as usize % TAG_ALIGN == 0);
        unsafe {
            front_tag.write(BoundaryTag::new(true, 0));
        }

        let back_tag = unsafe { front_tag.byte_add(TAG_SIZE + block_size) };
        debug_assert!(back_tag.as_ptr() as usize % TAG_ALIGN == 0);
        unsafe {
            back_tag.write(BoundaryTag::new(true, 0));
        }

        // The one free block spanning the whole managed region starts right
        // after the front sentinel; that address is already tag-aligned
        let first_block = unsafe { front_tag.byte_add(TAG_SIZE).cast::<FreeBlock>() };
        debug_assert!(first_block.as_ptr() as usize % align_of::<FreeBlock>() == 0);

        let allocator = Self {
            data,
            backing_layout,
            full_size,
            first_block_addr: first_block.as_ptr() as usize,
            first_level_bucket_count,
            first_level_bitmap: Cell::new(0),
            second_level_bitmaps,
            segregated_lists,
            stats: Cell::new(TlsfStats {
                free_byte_count: capacity,
                ..TlsfStats::default()
            }),
        };

        unsafe {
            first_block.write(FreeBlock {
                tag: BoundaryTag::new(false, block_size),
                previous: ptr::null_mut(),
                next: ptr::null_mut(),
            });
            copy_front_tag_to_back(first_block.as_ptr());
            allocator.insert_block(first_block.as_ptr());
        }

        #[cfg(feature = "logging")]
        tracing::trace!(capacity, full_size, "created TLSF allocator");

        Ok(allocator)
    }

    /// Current counters
    #[inline]
    #[must_use]
    pub fn stats(&self) -> TlsfStats {
        self.stats.get()
    }

    fn update_stats(&self, f: impl FnOnce(&mut TlsfStats)) {
        let mut stats = self.stats.get();
        f(&mut stats);
        self.stats.set(stats);
    }

    #[inline]
    fn mapping_insert(r: usize) -> FreeListIndex {
        debug_assert!(r >= SECOND_LEVEL_RANGE_COUNT);
        let i = fls(r);
        let j = (r >> (i - J)) - SECOND_LEVEL_RANGE_COUNT;
        FreeListIndex { fl: i, sl: j }
    }

    #[inline]
    fn mapping_search(r: usize) -> FreeListIndex {
        // Round the size up to the next range, so that whatever block the
        // search finds is large enough
        let r = r + (1 << (fls(r) - J)) - 1;
        Self::mapping_insert(r)
    }

    #[inline]
    fn sl_bitmap(&self, fl: usize) -> usize {
        debug_assert!(fl < self.first_level_bucket_count);
        unsafe { *self.second_level_bitmaps.as_ptr().add(fl) }
    }

    #[inline]
    fn set_sl_bitmap(&self, fl: usize, value: usize) {
        debug_assert!(fl < self.first_level_bucket_count);
        unsafe { *self.second_level_bitmaps.as_ptr().add(fl) = value }
    }

    #[inline]
    fn head_slot(&self, index: FreeListIndex) -> *mut *mut FreeBlock {
        debug_assert!(index.fl < self.first_level_bucket_count);
        debug_assert!(index.sl < SECOND_LEVEL_RANGE_COUNT);
        unsafe {
            self.segregated_lists
                .as_ptr()
                .add(index.fl * SECOND_LEVEL_RANGE_COUNT + index.sl)
        }
    }

    /// Finds the first list at or after `start_index` whose head is a
    /// sufficient block.
    fn find_suitable_block(&self, start_index: FreeListIndex) -> Option<FreeListIndex> {
        if start_index.fl >= self.first_level_bucket_count {
            return None;
        }

        let bitmap = self.sl_bitmap(start_index.fl) & (usize::MAX << start_index.sl);
        if bitmap != 0 {
            return Some(FreeListIndex {
                fl: start_index.fl,
                sl: ffs(bitmap),
            });
        }

        let shift = start_index.fl + 1;
        if shift >= usize::BITS as usize {
            return None;
        }
        let bitmap = self.first_level_bitmap.get() & (usize::MAX << shift);
        if bitmap == 0 {
            return None;
        }

        let fl = ffs(bitmap);
        let sl = ffs(self.sl_bitmap(fl));
        Some(FreeListIndex { fl, sl })
    }

    /// Pushes a free block to the head of its list, updating the bitmaps if
    /// the list was empty.
    unsafe fn insert_block(&self, block: *mut FreeBlock) {
        unsafe {
            debug_assert!(!block.is_null());
            debug_assert!(front_and_back_tags_match(block));
            debug_assert!(!(*block).tag.is_allocated());
            debug_assert!((*block).previous.is_null());
            debug_assert!((*block).next.is_null());

            let index = Self::mapping_insert((*block).tag.byte_count());
            let slot = self.head_slot(index);

            let head = *slot;
            if head.is_null() {
                // Mark the newly populated list in the bitmaps
                self.first_level_bitmap
                    .set(self.first_level_bitmap.get() | 1 << index.fl);
                self.set_sl_bitmap(index.fl, self.sl_bitmap(index.fl) | 1 << index.sl);
            } else {
                (*head).previous = block;
                (*block).next = head;
            }

            *slot = block;
        }
    }

    /// Detaches the head of the list at `index`, clearing the bitmap bits if
    /// the list becomes empty.
    unsafe fn remove_head(&self, index: FreeListIndex) -> *mut FreeBlock {
        unsafe {
            let slot = self.head_slot(index);
            let block = *slot;
            debug_assert!(!block.is_null());
            debug_assert!(front_and_back_tags_match(block));
            debug_assert!(!(*block).tag.is_allocated());
            debug_assert!((*block).tag.byte_count() >= MIN_BLOCK_SIZE);

            if (*block).next.is_null() {
                *slot = ptr::null_mut();

                // Drop the now empty list from the bitmaps
                self.first_level_bitmap
                    .set(self.first_level_bitmap.get() & !(1 << index.fl));
                self.set_sl_bitmap(index.fl, self.sl_bitmap(index.fl) & !(1 << index.sl));
            } else {
                *slot = (*block).next;
                (**slot).previous = ptr::null_mut();
            }

            (*block).previous = ptr::null_mut();
            (*block).next = ptr::null_mut();

            block
        }
    }

    /// Unlinks a block from anywhere in its list.
    unsafe fn remove_block(&self, block: *mut FreeBlock) {
        unsafe {
            debug_assert!(!block.is_null());
            debug_assert!(front_and_back_tags_match(block));
            debug_assert!(!(*block).tag.is_allocated());
            debug_assert!((*block).tag.byte_count() >= MIN_BLOCK_SIZE);

            if (*block).previous.is_null() {
                let index = Self::mapping_insert((*block).tag.byte_count());
                let head = self.remove_head(index);
                debug_assert!(head == block);
            } else {
                // Not the head, so the list stays nonempty and the bitmaps
                // are untouched
                if !(*block).next.is_null() {
                    (*(*block).next).previous = (*block).previous;
                }
                (*(*block).previous).next = (*block).next;
            }

            (*block).previous = ptr::null_mut();
            (*block).next = ptr::null_mut();
        }
    }

    /// Carves `first_byte_count` off the front of `block`, returning the
    /// remainder as a new free block.
    unsafe fn split_block(&self, block: *mut FreeBlock, first_byte_count: usize) -> *mut FreeBlock {
        unsafe {
            debug_assert!(!block.is_null());
            debug_assert!(front_and_back_tags_match(block));
            debug_assert!(!(*block).tag.is_allocated());
            debug_assert!((*block).tag.byte_count() >= MIN_BLOCK_SIZE);

            let remaining = block.byte_add(first_byte_count);
            debug_assert!(remaining as usize % align_of::<FreeBlock>() == 0);

            remaining.write(FreeBlock {
                tag: BoundaryTag::new(false, (*block).tag.byte_count() - first_byte_count),
                previous: ptr::null_mut(),
                next: ptr::null_mut(),
            });
            copy_front_tag_to_back(remaining);

            (*block).tag.set_byte_count(first_byte_count);
            copy_front_tag_to_back(block);

            remaining
        }
    }

    /// Absorbs `block` into its lower neighbor if that neighbor is free.
    unsafe fn merge_previous(&self, block: *mut FreeBlock) -> *mut FreeBlock {
        unsafe {
            debug_assert!(front_and_back_tags_match(block));
            debug_assert!(!(*block).tag.is_allocated());

            // The word right below this block is the lower neighbor's back
            // tag (or a sentinel)
            let prev_tag = *block.cast::<BoundaryTag>().byte_sub(TAG_SIZE);
            if prev_tag.is_allocated() {
                return block;
            }

            let prev_block = block.byte_sub(prev_tag.byte_count());
            debug_assert!(prev_block as usize >= self.first_block_addr);
            debug_assert!(prev_block as usize % align_of::<FreeBlock>() == 0);

            self.remove_block(prev_block);

            (*prev_block)
                .tag
                .set_byte_count((*prev_block).tag.byte_count() + (*block).tag.byte_count());
            copy_front_tag_to_back(prev_block);

            prev_block
        }
    }

    /// Absorbs the upper neighbor into `block` if that neighbor is free.
    unsafe fn merge_next(&self, block: *mut FreeBlock) -> *mut FreeBlock {
        unsafe {
            debug_assert!(front_and_back_tags_match(block));
            debug_assert!(!(*block).tag.is_allocated());

            let next_tag_addr = block.byte_add((*block).tag.byte_count());
            let next_tag = *next_tag_addr.cast::<BoundaryTag>();
            if next_tag.is_allocated() {
                return block;
            }

            // The front tag of a free block is the first field of its
            // FreeBlock record
            let next_block = next_tag_addr;
            self.remove_block(next_block);

            (*block)
                .tag
                .set_byte_count((*block).tag.byte_count() + (*next_block).tag.byte_count());
            copy_front_tag_to_back(block);

            block
        }
    }
}

/// Mirrors the front tag to the block's trailing tag slot.
unsafe fn copy_front_tag_to_back(block: *mut FreeBlock) {
    unsafe {
        debug_assert!((*block).tag.byte_count() >= MIN_BLOCK_SIZE);

        let tag = block
            .cast::<BoundaryTag>()
            .byte_add((*block).tag.byte_count() - TAG_SIZE);
        debug_assert!(tag as usize % TAG_ALIGN == 0);
        *tag = (*block).tag;
    }
}

unsafe fn front_and_back_tags_match(block: *mut FreeBlock) -> bool {
    unsafe {
        let tag = *block
            .cast::<BoundaryTag>()
            .byte_add((*block).tag.byte_count() - TAG_SIZE);
        tag == (*block).tag
    }
}

unsafe impl Allocator for TlsfAllocator {
    unsafe fn allocate(&self, layout: Layout) -> AllocResult<NonNull<[u8]>> {
        assert_fundamental_alignment(layout);

        if layout.size() == 0 {
            return Ok(NonNull::slice_from_raw_parts(NonNull::dangling(), 0));
        }

        // Block layout: front tag, pointer to front, padding to the user
        // pointer's alignment, the user bytes, back tag
        let mut num_bytes = PRE_ALLOC_PADDING
            .checked_add(layout.size())
            .ok_or(AllocError::SizeOverflow)?;
        num_bytes = aligned_offset(num_bytes, TAG_ALIGN);
        num_bytes += TAG_SIZE;
        if num_bytes < MIN_BLOCK_SIZE {
            num_bytes = MIN_BLOCK_SIZE;
        }

        // First list that could hold a sufficient block, then the first list
        // that actually has one
        let Some(index) = self.find_suitable_block(Self::mapping_search(num_bytes)) else {
            #[cfg(feature = "logging")]
            tracing::debug!(requested = layout.size(), "no suitable free block left");
            return Err(AllocError::out_of_memory(layout));
        };

        unsafe {
            let block = self.remove_head(index);
            debug_assert!(front_and_back_tags_match(block));
            debug_assert!(!(*block).tag.is_allocated());
            debug_assert!((*block).tag.byte_count() >= num_bytes);

            // Put potential extra memory back into the free lists
            if (*block).tag.byte_count() - num_bytes > MIN_BLOCK_SIZE {
                let remaining = self.split_block(block, num_bytes);
                self.insert_block(remaining);
            }

            // The user pointer is aligned after the front tag and the
            // pointer back to it
            let raw = block.cast::<u8>().add(TAG_SIZE + size_of::<*mut u8>());
            let padding = aligned_offset(raw as usize, MAX_ALIGN) - raw as usize;
            let alloc_ptr = raw.add(padding);

            // Store the way back so deallocate can recover the block
            let ptr_to_front = alloc_ptr.sub(size_of::<*mut u8>()).cast::<*mut FreeBlock>();
            debug_assert!(ptr_to_front as usize % align_of::<*mut u8>() == 0);
            ptr_to_front.write(block);

            (*block).tag.set_allocated(true);
            copy_front_tag_to_back(block);

            let block_bytes = (*block).tag.byte_count();
            self.update_stats(|stats| {
                stats.allocation_count += 1;
                if block_bytes == MIN_BLOCK_SIZE {
                    stats.small_allocation_count += 1;
                }
                stats.free_byte_count -= block_bytes;
                stats.allocated_byte_count += block_bytes;
                if stats.allocated_byte_count > stats.allocated_byte_count_high_watermark {
                    stats.allocated_byte_count_high_watermark = stats.allocated_byte_count;
                }
            });

            Ok(NonNull::slice_from_raw_parts(
                NonNull::new_unchecked(alloc_ptr),
                layout.size(),
            ))
        }
    }

    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        if layout.size() == 0 {
            return;
        }

        let addr = ptr.as_ptr() as usize;
        let base = self.data.as_ptr() as usize;
        assert!(
            addr > base && addr - base < self.full_size,
            "tried to deallocate a pointer outside the managed region"
        );

        unsafe {
            // The pointer to the front of the block sits just before the
            // allocation pointer
            let block = *ptr.as_ptr().sub(size_of::<*mut u8>()).cast::<*mut FreeBlock>();
            debug_assert!(block as usize % align_of::<FreeBlock>() == 0);
            assert!(
                (*block).tag.is_allocated(),
                "tried to deallocate a block that isn't allocated"
            );
            debug_assert!((*block).tag.byte_count() >= MIN_BLOCK_SIZE);
            (*block).previous = ptr::null_mut();
            (*block).next = ptr::null_mut();

            // Counters use the original block size, before any merging
            let block_bytes = (*block).tag.byte_count();
            self.update_stats(|stats| {
                stats.allocation_count -= 1;
                if block_bytes == MIN_BLOCK_SIZE {
                    stats.small_allocation_count -= 1;
                }
                stats.free_byte_count += block_bytes;
                stats.allocated_byte_count -= block_bytes;
            });

            (*block).tag.set_allocated(false);
            copy_front_tag_to_back(block);

            // Coalesce with physical neighbors to avoid needless
            // fragmentation
            let block = self.merge_previous(block);
            let block = self.merge_next(block);
            debug_assert!(!(*block).tag.is_allocated());

            // The front or back tag location may have moved
            copy_front_tag_to_back(block);

            self.insert_block(block);
        }
    }
}

impl MemoryUsage for TlsfAllocator {
    fn used_memory(&self) -> usize {
        self.stats.get().allocated_byte_count
    }

    fn available_memory(&self) -> Option<usize> {
        Some(self.stats.get().free_byte_count)
    }
}

impl Drop for TlsfAllocator {
    fn drop(&mut self) {
        let stats = self.stats.get();
        assert!(
            self.first_level_bitmap.get().count_ones() == 1,
            "expected one contiguous free block remaining; not all allocations \
             were deallocated before the allocator was destroyed"
        );
        assert!(
            stats.allocation_count == 0
                && stats.small_allocation_count == 0
                && stats.allocated_byte_count == 0,
            "allocation counters are nonzero; not all allocations were \
             deallocated before the allocator was destroyed"
        );

        #[cfg(feature = "logging")]
        tracing::trace!(
            high_watermark = stats.allocated_byte_count_high_watermark,
            "dropping TLSF allocator"
        );

        unsafe { std::alloc::dealloc(self.data.as_ptr(), self.backing_layout) };
    }
}
