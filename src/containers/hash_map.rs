//! Open-addressed hash map over an explicit allocator.
//!
//! Shares the metadata-byte design with [`HashSet`](super::HashSet): the
//! same H1/H2 hash split, 15/16 load factor and tombstone handling, with
//! keys and values in parallel slot arrays.

use core::alloc::Layout;
use core::fmt;
use core::hash::{BuildHasher, Hash};
use core::ptr::{self, NonNull};

use super::hash_set::{DELETED, EMPTY, h1, h2, is_vacant};
use super::{DefaultHashBuilder, alloc_failure};
use crate::allocator::Allocator;
use crate::error::AllocError;
use crate::utils::{MAX_ALIGN, next_power_of_two};

/// Hash map with one metadata byte per slot and strict linear probing.
///
/// Capacity is always a power of two and at least 32.
pub struct HashMap<'a, K, V, S = DefaultHashBuilder> {
    allocator: &'a dyn Allocator,
    keys: *mut K,
    values: *mut V,
    metadata: *mut u8,
    size: usize,
    capacity: usize,
    hash_builder: S,
}

impl<'a, K, V, S> HashMap<'a, K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher + Default,
{
    /// Creates a map with the default initial capacity.
    ///
    /// # Panics
    /// Panics if the allocator is exhausted.
    #[must_use]
    pub fn new(allocator: &'a dyn Allocator) -> Self {
        Self::with_capacity(allocator, 32)
    }

    /// Creates a map with at least `initial_capacity` slots.
    ///
    /// # Panics
    /// Panics if the allocator is exhausted.
    #[must_use]
    pub fn with_capacity(allocator: &'a dyn Allocator, initial_capacity: usize) -> Self {
        Self::with_hasher(allocator, initial_capacity, S::default())
    }
}

impl<'a, K, V, S> HashMap<'a, K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    /// Creates a map with at least `initial_capacity` slots and the given
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
        const { assert!(align_of::<K>() <= MAX_ALIGN) };
        const { assert!(align_of::<V>() <= MAX_ALIGN) };

        let initial_capacity = next_power_of_two(initial_capacity.max(32));

        let mut map = Self {
            allocator,
            keys: ptr::null_mut(),
            values: ptr::null_mut(),
            metadata: ptr::null_mut(),
            size: 0,
            capacity: 0,
            hash_builder,
        };
        map.grow(initial_capacity);
        map
    }

    /// Number of entries
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

    /// Checks whether `key` is in the map.
    #[must_use]
    pub fn contains_key(&self, key: &K) -> bool {
        self.find_pos(key).is_some()
    }

    /// Returns a reference to the value stored for `key`.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<&V> {
        self.find_pos(key)
            // SAFETY: find_pos only returns occupied slots
            .map(|pos| unsafe { &*self.values.add(pos) })
    }

    /// Returns a mutable reference to the value stored for `key`.
    #[must_use]
    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.find_pos(key)
            // SAFETY: find_pos only returns occupied slots
            .map(|pos| unsafe { &mut *self.values.add(pos) })
    }

    /// Inserts a key/value pair, returning the previous value if the key
    /// was already present.
    ///
    /// # Panics
    /// Panics if the table needs to grow and the allocator is exhausted.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        if self.is_over_max_load() {
            self.grow(self.capacity * 2);
        }

        let hash = self.hash_builder.hash_one(&key);
        let tag = h2(hash);
        let mut pos = (h1(hash) as usize) & (self.capacity - 1);
        loop {
            // SAFETY: pos < capacity by the mask
            let metadata = unsafe { *self.metadata.add(pos) };
            if is_vacant(metadata) {
                unsafe {
                    self.keys.add(pos).write(key);
                    self.values.add(pos).write(value);
                    *self.metadata.add(pos) = tag;
                }
                self.size += 1;
                return None;
            } else if metadata == tag && unsafe { &*self.keys.add(pos) } == &key {
                return Some(unsafe { ptr::replace(self.values.add(pos), value) });
            }

            pos = (pos + 1) & (self.capacity - 1);
        }
    }

    /// Removes `key`, returning its value if it was present.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let pos = self.find_pos(key)?;

        let value = unsafe {
            ptr::drop_in_place(self.keys.add(pos));
            *self.metadata.add(pos) = DELETED;
            self.values.add(pos).read()
        };
        self.size -= 1;

        // Flush the tombstones whenever the table drains
        if self.size == 0 {
            self.clear();
        }

        Some(value)
    }

    /// Drops every entry and resets all metadata to Empty.
    pub fn clear(&mut self) {
        if self.size > 0 {
            for pos in 0..self.capacity {
                unsafe {
                    if !is_vacant(*self.metadata.add(pos)) {
                        ptr::drop_in_place(self.keys.add(pos));
                        ptr::drop_in_place(self.values.add(pos));
                    }
                }
            }
            self.size = 0;
        }
        unsafe { ptr::write_bytes(self.metadata, EMPTY, self.capacity) };
    }

    /// Iterates over the entries in unspecified order.
    pub fn iter(&self) -> Iter<'_, 'a, K, V, S> {
        Iter { map: self, pos: 0 }
    }

    fn find_pos(&self, key: &K) -> Option<usize> {
        let hash = self.hash_builder.hash_one(key);
        let tag = h2(hash);
        let start_pos = (h1(hash) as usize) & (self.capacity - 1);
        let mut pos = start_pos;
        // SAFETY: pos < capacity by the mask
        while unsafe { *self.metadata.add(pos) } != EMPTY {
            let metadata = unsafe { *self.metadata.add(pos) };
            if metadata == tag && unsafe { &*self.keys.add(pos) } == key {
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
        16 * (self.size + 1) > 15 * self.capacity
    }

    fn grow(&mut self, capacity: usize) {
        debug_assert!(capacity > self.capacity);
        debug_assert!(capacity.is_power_of_two());

        let old_keys = self.keys;
        let old_values = self.values;
        let old_metadata = self.metadata;
        let old_capacity = self.capacity;

        let keys_layout =
            Layout::array::<K>(capacity).unwrap_or_else(|_| alloc_failure(AllocError::SizeOverflow));
        let values_layout =
            Layout::array::<V>(capacity).unwrap_or_else(|_| alloc_failure(AllocError::SizeOverflow));
        let metadata_layout =
            Layout::array::<u8>(capacity).unwrap_or_else(|_| alloc_failure(AllocError::SizeOverflow));

        self.keys = unsafe {
            self.allocator
                .allocate(keys_layout)
                .unwrap_or_else(|err| alloc_failure(err))
                .cast::<K>()
                .as_ptr()
        };
        self.values = unsafe {
            self.allocator
                .allocate(values_layout)
                .unwrap_or_else(|err| alloc_failure(err))
                .cast::<V>()
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
                // Move the entry over; no destructors run for the sources
                self.insert(old_keys.add(pos).read(), old_values.add(pos).read());
            }
        }

        if !old_keys.is_null() {
            unsafe {
                self.allocator.deallocate(
                    NonNull::new_unchecked(old_keys.cast()),
                    Layout::from_size_align_unchecked(size_of::<K>() * old_capacity, align_of::<K>()),
                );
                self.allocator.deallocate(
                    NonNull::new_unchecked(old_values.cast()),
                    Layout::from_size_align_unchecked(size_of::<V>() * old_capacity, align_of::<V>()),
                );
                self.allocator.deallocate(
                    NonNull::new_unchecked(old_metadata),
                    Layout::from_size_align_unchecked(old_capacity, 1),
                );
            }
        }
    }
}

impl<K, V, S> Drop for HashMap<'_, K, V, S> {
    fn drop(&mut self) {
        if self.keys.is_null() {
            return;
        }

        if self.size > 0 {
            for pos in 0..self.capacity {
                unsafe {
                    if !is_vacant(*self.metadata.add(pos)) {
                        ptr::drop_in_place(self.keys.add(pos));
                        ptr::drop_in_place(self.values.add(pos));
                    }
                }
            }
        }

        unsafe {
            self.allocator.deallocate(
                NonNull::new_unchecked(self.keys.cast()),
                Layout::from_size_align_unchecked(
                    size_of::<K>() * self.capacity,
                    align_of::<K>(),
                ),
            );
            self.allocator.deallocate(
                NonNull::new_unchecked(self.values.cast()),
                Layout::from_size_align_unchecked(
                    size_of::<V>() * self.capacity,
                    align_of::<V>(),
                ),
            );
            self.allocator.deallocate(
                NonNull::new_unchecked(self.metadata),
                Layout::from_size_align_unchecked(self.capacity, 1),
            );
        }
    }
}

impl<K, V, S> fmt::Debug for HashMap<'_, K, V, S>
where
    K: fmt::Debug + Eq + Hash,
    V: fmt::Debug,
    S: BuildHasher,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

/// Iterator over a [`HashMap`]'s entries.
pub struct Iter<'s, 'a, K, V, S> {
    map: &'s HashMap<'a, K, V, S>,
    pos: usize,
}

impl<'s, K, V, S> Iterator for Iter<'s, '_, K, V, S> {
    type Item = (&'s K, &'s V);

    fn next(&mut self) -> Option<(&'s K, &'s V)> {
        while self.pos < self.map.capacity {
            let pos = self.pos;
            self.pos += 1;
            unsafe {
                if !is_vacant(*self.map.metadata.add(pos)) {
                    return Some((&*self.map.keys.add(pos), &*self.map.values.add(pos)));
                }
            }
        }
        None
    }
}

impl<'s, 'a, K, V, S> IntoIterator for &'s HashMap<'a, K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher,
{
    type Item = (&'s K, &'s V);
    type IntoIter = Iter<'s, 'a, K, V, S>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
