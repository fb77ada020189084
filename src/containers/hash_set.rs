//! Open-addressed hash set over an explicit allocator.
//!
//! Based on Google's SwissMap cppcon 2017 talk by Matt Kulukundis, without
//! the SIMD probing: one metadata byte per slot carries the occupancy state
//! or seven bits of the element's hash, so most probe steps never touch the
//! element array.

use core::alloc::Layout;
use core::fmt;
use core::hash::{BuildHasher, Hash};
use core::ptr::{self, NonNull};

use super::{DefaultHashBuilder, alloc_failure};
use crate::allocator::Allocator;
use crate::error::AllocError;
use crate::utils::{MAX_ALIGN, next_power_of_two};

/// Metadata byte for a slot that has never held an element.
pub(super) const EMPTY: u8 = 0x80;
/// Metadata byte for a tombstone: the element was removed but probes must
/// keep walking past it.
pub(super) const DELETED: u8 = 0xFF;

/// True for Empty and Deleted slots alike; an occupied slot has the high
/// bit clear.
#[inline]
pub(super) fn is_vacant(metadata: u8) -> bool {
    metadata & EMPTY == EMPTY
}

/// Probe-start bits of a hash
#[inline]
pub(super) fn h1(hash: u64) -> u64 {
    hash >> 7
}

/// Metadata-tag bits of a hash
#[inline]
pub(super) fn h2(hash: u64) -> u8 {
    (hash & 0x7F) as u8
}

/// Hash set with one metadata byte per slot and strict linear probing.
///
/// Capacity is always a power of two and at least 32; the table grows at a
/// 15/16 load factor so a probe always finds an Empty slot to stop at.
pub struct HashSet<'a, T, S = DefaultHashBuilder> {
    allocator: &'a dyn Allocator,
    data: *mut T,
    metadata: *mut u8,
    size: usize,
    capacity: usize,
    hash_builder: S,
}

impl<'a, T, S> HashSet<'a, T, S>
where
    T: Eq + Hash,
    S: BuildHasher + Default,
{
    /// Creates a set with the default initial capacity.
    ///
    /// # Panics
    /// Panics if the allocator is exhausted.
    #[must_use]
    pub fn new(allocator: &'a dyn Allocator) -> Self {
        Self::with_capacity(allocator, 32)
    }

    /// Creates a set with at least `initial_capacity` slots.
    ///
    /// # Panics
    /// Panics if the allocator is exhausted.
    #[must_use]
    pub fn with_capacity(allocator: &'a dyn Allocator, initial_capacity: usize) -> Self {
        Self::with_hasher(allocator, initial_capacity, S::default())
    }
}

impl<'a, T, S> HashSet<'a, T, S>
where
    T: Eq + Hash,
    S: BuildHasher,
{
    /// Creates a set with at least `initial_capacity` slots and the given
    /// hasher.
    ///
    /// # Panics
    /// Panics if the allocator is exhausted.
    #[must_use]
    pub fn with_hasher(
        allocator: &'a dyn Allocator,
        initial_capacity: usize,
        hash_builder: S,
    ) -> Self {
        const { assert!(align_of::<T>() <= MAX_ALIGN) };

        // The max load factor is 15/16, so capacity has to start at 32 to
        // guarantee the table grows in time to always keep at least one
        // Empty slot terminating find's probe
        let initial_capacity = next_power_of_two(initial_capacity.max(32));

        let mut set = Self {
            allocator,
            data: ptr::null_mut(),
            metadata: ptr::null_mut(),
            size: 0,
            capacity: 0,
            hash_builder,
        };
        set.grow(initial_capacity);
        set
    }

    /// Number of elements
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.size
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Number of slots
    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Checks whether `value` is in the set.
    #[must_use]
    pub fn contains(&self, value: &T) -> bool {
        self.find_pos(value).is_some()
    }

    /// Returns a reference to the stored element equal to `value`.
    #[must_use]
    pub fn get(&self, value: &T) -> Option<&T> {
        self.find_pos(value)
            // SAFETY: find_pos only returns occupied slots
            .map(|pos| unsafe { &*self.data.add(pos) })
    }

    /// Inserts `value`, returning whether it was newly added.
    ///
    /// # Panics
    /// Panics if the table needs to grow and the allocator is exhausted.
    pub fn insert(&mut self, value: T) -> bool {
        if self.is_over_max_load() {
            self.grow(self.capacity * 2);
        }

        let hash = self.hash_builder.hash_one(&value);
        let tag = h2(hash);
        let mut pos = (h1(hash) as usize) & (self.capacity - 1);
        loop {
            // SAFETY: pos < capacity by the mask
            let metadata = unsafe { *self.metadata.add(pos) };
            if is_vacant(metadata) {
                unsafe {
                    self.data.add(pos).write(value);
                    *self.metadata.add(pos) = tag;
                }
                self.size += 1;
                return true;
            } else if metadata == tag && unsafe { &*self.data.add(pos) } == &value {
                return false;
            }

            pos = (pos + 1) & (self.capacity - 1);
        }
    }

    /// Removes `value`, returning whether it was present.
    pub fn remove(&mut self, value: &T) -> bool {
        let Some(pos) = self.find_pos(value) else {
            return false;
        };

        unsafe {
            ptr::drop_in_place(self.data.add(pos));
            *self.metadata.add(pos) = DELETED;
        }
        self.size -= 1;

        // Probes for missing values get really bad if every slot is
        // Deleted, so flush the tombstones whenever the table drains
        if self.size == 0 {
            self.clear();
        }

        true
    }

    /// Drops every element and resets all metadata to Empty.
    pub fn clear(&mut self) {
        if self.size > 0 {
            for pos in 0..self.capacity {
                unsafe {
                    if !is_vacant(*self.metadata.add(pos)) {
                        ptr::drop_in_place(self.data.add(pos));
                    }
                }
            }
            self.size = 0;
        }
        unsafe { ptr::write_bytes(self.metadata, EMPTY, self.capacity) };
    }

    /// Iterates over the elements in unspecified order.
    pub fn iter(&self) -> Iter<'_, 'a, T, S> {
        Iter { set: self, pos: 0 }
    }

    fn find_pos(&self, value: &T) -> Option<usize> {
        let hash = self.hash_builder.hash_one(value);
        let tag = h2(hash);
        // Keep the start position around so the probe stops after a full
        // cycle when every slot is occupied or deleted
        let start_pos = (h1(hash) as usize) & (self.capacity - 1);
        let mut pos = start_pos;
        // SAFETY: pos < capacity by the mask
        while unsafe { *self.metadata.add(pos) } != EMPTY {
            let metadata = unsafe { *self.metadata.add(pos) };
            if metadata == tag && unsafe { &*self.data.add(pos) } == value {
                return Some(pos);
            }

            pos = (pos + 1) & (self.capacity - 1);
            if pos == start_pos {
                break;
            }
        }

        None
    }

    fn is_over_max_load(&self) -> bool {
        // Magic factor from the SwissMap talk; reading one metadata byte at
        // a time behaves like the arbitrary-offset SSE version
        16 * (self.size + 1) > 15 * self.capacity
    }

    fn grow(&mut self, capacity: usize) {
        debug_assert!(capacity > self.capacity);
        debug_assert!(capacity.is_power_of_two());

        let old_data = self.data;
        let old_metadata = self.metadata;
        let old_capacity = self.capacity;

        let data_layout =
            Layout::array::<T>(capacity).unwrap_or_else(|_| alloc_failure(AllocError::SizeOverflow));
        let metadata_layout =
            Layout::array::<u8>(capacity).unwrap_or_else(|_| alloc_failure(AllocError::SizeOverflow));

        self.data = unsafe {
            self.allocator
                .allocate(data_layout)
                .unwrap_or_else(|err| alloc_failure(err))
                .cast::<T>()
                .as_ptr()
        };
        self.metadata = unsafe {
            self.allocator
                .allocate(metadata_layout)
                .unwrap_or_else(|err| alloc_failure(err))
                .cast::<u8>()
                .as_ptr()
        };

        self.size = 0;
        self.capacity = capacity;
        unsafe { ptr::write_bytes(self.metadata, EMPTY, capacity) };

        for pos in 0..old_capacity {
            unsafe {
                if is_vacant(*old_metadata.add(pos)) {
                    continue;
                }
                // Move the element over; no destructor runs for the source
                self.insert(old_data.add(pos).read());
            }
        }

        if !old_data.is_null() {
            unsafe {
                let old_data_layout =
                    Layout::from_size_align_unchecked(size_of::<T>() * old_capacity, align_of::<T>());
                self.allocator
                    .deallocate(NonNull::new_unchecked(old_data.cast()), old_data_layout);
                self.allocator.deallocate(
                    NonNull::new_unchecked(old_metadata),
                    Layout::from_size_align_unchecked(old_capacity, 1),
                );
            }
        }
    }
}

impl<T, S> Drop for HashSet<'_, T, S> {
    fn drop(&mut self) {
        if self.data.is_null() {
            return;
        }

        if self.size > 0 {
            for pos in 0..self.capacity {
                unsafe {
                    if !is_vacant(*self.metadata.add(pos)) {
                        ptr::drop_in_place(self.data.add(pos));
                    }
                }
            }
        }

        unsafe {
            let data_layout =
                Layout::from_size_align_unchecked(size_of::<T>() * self.capacity, align_of::<T>());
            self.allocator
                .deallocate(NonNull::new_unchecked(self.data.cast()), data_layout);
            self.allocator.deallocate(
                NonNull::new_unchecked(self.metadata),
                Layout::from_size_align_unchecked(self.capacity, 1),
            );
        }
    }
}

impl<T: fmt::Debug + Eq + Hash, S: BuildHasher> fmt::Debug for HashSet<'_, T, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Iterator over a [`HashSet`]'s elements.
pub struct Iter<'s, 'a, T, S> {
    set: &'s HashSet<'a, T, S>,
    pos: usize,
}

impl<'s, T, S> Iterator for Iter<'s, '_, T, S> {
    type Item = &'s T;

    fn next(&mut self) -> Option<&'s T> {
        while self.pos < self.set.capacity {
            let pos = self.pos;
            self.pos += 1;
            unsafe {
                if !is_vacant(*self.set.metadata.add(pos)) {
                    return Some(&*self.set.data.add(pos));
                }
            }
        }
        None
    }
}

impl<'s, 'a, T, S> IntoIterator for &'s HashSet<'a, T, S>
where
    T: Eq + Hash,
    S: BuildHasher,
{
    type Item = &'s T;
    type IntoIter = Iter<'s, 'a, T, S>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
