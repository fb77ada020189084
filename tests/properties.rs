//! Property tests for the allocator invariants.

use std::alloc::Layout;

use nebula_alloc::utils::{MAX_ALIGN, aligned_offset, next_power_of_two};
use nebula_alloc::{Allocator, LinearAllocator, TlsfAllocator};
use proptest::prelude::*;

proptest! {
    #[test]
    fn aligned_offset_invariants(
        offset in 0usize..(1 << 40),
        align_pow in 0u32..=4,
    ) {
        let alignment = 1usize << align_pow;
        prop_assume!(alignment <= MAX_ALIGN);

        let aligned = aligned_offset(offset, alignment);
        prop_assert!(aligned >= offset);
        prop_assert_eq!(aligned % alignment, 0);
        prop_assert!(aligned - offset < alignment);
    }

    #[test]
    fn next_power_of_two_invariants(value in 0usize..(1 << 31)) {
        let rounded = next_power_of_two(value);
        prop_assert!(rounded.is_power_of_two());
        prop_assert!(rounded >= value);
        if value > 1 {
            prop_assert!(rounded / 2 < value);
        }
    }

    #[test]
    fn linear_allocations_stay_in_bounds_and_disjoint(
        sizes in prop::collection::vec(1usize..256, 1..32),
    ) {
        const CAPACITY: usize = 64 * 1024;
        let allocator = LinearAllocator::new(CAPACITY).unwrap();

        let mut regions: Vec<(usize, usize)> = Vec::new();
        for &size in &sizes {
            let layout = Layout::from_size_align(size, 1).unwrap();
            let ptr = unsafe { allocator.allocate(layout).unwrap() };
            let start = ptr.cast::<u8>().as_ptr() as usize;
            prop_assert_eq!(start % MAX_ALIGN, 0);
            regions.push((start, start + size));
        }

        for window in regions.windows(2) {
            let (_, end) = window[0];
            let (start, _) = window[1];
            prop_assert!(start >= end);
        }

        let total: usize = regions.last().map(|&(_, end)| end).unwrap_or(0)
            - regions.first().map(|&(start, _)| start).unwrap_or(0);
        prop_assert!(total <= CAPACITY);
    }

    #[test]
    fn tlsf_counters_balance_over_random_churn(
        sizes in prop::collection::vec(1usize..2048, 1..64),
    ) {
        let allocator = TlsfAllocator::new(1024 * 1024).unwrap();
        let initial = allocator.stats();

        let blocks: Vec<_> = sizes
            .iter()
            .map(|&size| {
                let layout = Layout::from_size_align(size, 1).unwrap();
                (unsafe { allocator.allocate(layout).unwrap() }, layout)
            })
            .collect();

        let stats = allocator.stats();
        prop_assert_eq!(stats.allocation_count, sizes.len());
        prop_assert!(stats.allocated_byte_count > 0);

        // Free in FIFO order so both merge directions get exercised
        for (ptr, layout) in blocks {
            unsafe { allocator.deallocate(ptr.cast(), layout) };
        }

        let stats = allocator.stats();
        prop_assert_eq!(stats.allocation_count, 0);
        prop_assert_eq!(stats.small_allocation_count, 0);
        prop_assert_eq!(stats.allocated_byte_count, 0);
        prop_assert_eq!(stats.free_byte_count, initial.free_byte_count);
        // Dropping the allocator asserts that one contiguous block remains
    }
}
