//! Integration tests for the TLSF allocator.

mod common;

use std::alloc::Layout;

use common::Aligned16;
use nebula_alloc::{Allocator, Array, MemoryUsage, TlsfAllocator};

#[test]
fn roundtrip_restores_counters() {
    let allocator = TlsfAllocator::new(4 * 1024 * 1024).unwrap();
    let initial = allocator.stats();
    assert_eq!(initial.allocation_count, 0);
    assert!(initial.free_byte_count > 0);

    let layout = Layout::from_size_align(2048, 1).unwrap();
    unsafe {
        let alloc = allocator.allocate(layout).unwrap();
        let ptr = alloc.cast::<u8>().as_ptr();
        std::ptr::write_bytes(ptr, 0, 2048);
        *ptr = 0x12;
        *ptr.add(2047) = 0x23;
        assert_eq!(*ptr, 0x12);
        assert_eq!(*ptr.add(2047), 0x23);

        let mid = allocator.stats();
        assert_eq!(mid.allocation_count, 1);
        assert!(mid.allocated_byte_count > 0);
        assert!(mid.free_byte_count < initial.free_byte_count);

        allocator.deallocate(alloc.cast(), layout);
    }

    let after = allocator.stats();
    assert_eq!(after.allocation_count, 0);
    assert_eq!(after.allocated_byte_count, 0);
    assert_eq!(after.free_byte_count, initial.free_byte_count);
    assert!(after.allocated_byte_count_high_watermark > 0);
}

#[test]
fn aligned_allocations() {
    let allocator = TlsfAllocator::new(4 * 1024 * 1024).unwrap();

    unsafe {
        let a = allocator.allocate(Layout::new::<Aligned16>()).unwrap();
        let b = allocator.allocate(Layout::new::<u8>()).unwrap();
        let c = allocator.allocate(Layout::new::<Aligned16>()).unwrap();

        assert_eq!(a.cast::<u8>().as_ptr() as usize % align_of::<Aligned16>(), 0);
        assert_eq!(c.cast::<u8>().as_ptr() as usize % align_of::<Aligned16>(), 0);

        // Release out of allocation order to exercise merging both ways
        allocator.deallocate(c.cast(), Layout::new::<Aligned16>());
        allocator.deallocate(b.cast(), Layout::new::<u8>());
        allocator.deallocate(a.cast(), Layout::new::<Aligned16>());
    }

    assert_eq!(allocator.stats().allocation_count, 0);
}

#[test]
fn small_allocations_are_counted() {
    let allocator = TlsfAllocator::new(1024 * 1024).unwrap();
    let layout = Layout::new::<u8>();

    unsafe {
        let a = allocator.allocate(layout).unwrap();
        assert_eq!(allocator.stats().small_allocation_count, 1);
        allocator.deallocate(a.cast(), layout);
    }
    assert_eq!(allocator.stats().small_allocation_count, 0);
}

#[test]
fn saturation_with_growing_arrays() {
    let allocator = TlsfAllocator::new(4 * 1024 * 1024).unwrap();

    {
        // This should get the allocator sufficiently saturated, with plenty
        // of reallocations for good measure
        let mut arrays: Array<Array<u32>> = Array::new(&allocator);
        let mut watermark = 0;
        for _ in 0..900 {
            let mut values = Array::new(&allocator);
            for i in 0..1000u32 {
                values.push(i);
            }
            arrays.push(values);

            let stats = allocator.stats();
            assert!(stats.allocated_byte_count_high_watermark >= watermark);
            watermark = stats.allocated_byte_count_high_watermark;
        }

        assert!(watermark > 0);
        assert_eq!(arrays.len(), 900);
        assert_eq!(arrays[899][999], 999);
        assert_eq!(arrays[0][0], 0);
    }

    // Every container is gone, the pool must be balanced again
    let stats = allocator.stats();
    assert_eq!(stats.allocation_count, 0);
    assert_eq!(stats.allocated_byte_count, 0);
}

#[test]
fn memory_comes_back_coalesced() {
    let allocator = TlsfAllocator::new(1024 * 1024).unwrap();
    let layout = Layout::from_size_align(4096, 1).unwrap();

    // Allocate a run, free every other block, then the rest; afterwards a
    // block spanning most of the pool has to be available again
    unsafe {
        let blocks: Vec<_> = (0..16)
            .map(|_| allocator.allocate(layout).unwrap())
            .collect();
        for block in blocks.iter().step_by(2) {
            allocator.deallocate(block.cast(), layout);
        }
        for block in blocks.iter().skip(1).step_by(2) {
            allocator.deallocate(block.cast(), layout);
        }

        let big = Layout::from_size_align(512 * 1024, 1).unwrap();
        let ptr = allocator.allocate(big).unwrap();
        allocator.deallocate(ptr.cast(), big);
    }

    assert_eq!(allocator.stats().allocation_count, 0);
}

#[test]
fn exhaustion_returns_error() {
    let allocator = TlsfAllocator::new(1024).unwrap();
    let err = unsafe {
        allocator
            .allocate(Layout::from_size_align(1 << 20, 1).unwrap())
            .unwrap_err()
    };
    assert!(err.is_out_of_memory());
}

#[test]
fn usage_reporting_tracks_stats() {
    let allocator = TlsfAllocator::new(1024 * 1024).unwrap();
    assert_eq!(allocator.used_memory(), 0);

    let layout = Layout::from_size_align(1024, 1).unwrap();
    unsafe {
        let ptr = allocator.allocate(layout).unwrap();
        assert!(allocator.used_memory() >= 1024);
        assert!(allocator.available_memory().unwrap() > 0);
        allocator.deallocate(ptr.cast(), layout);
    }
    assert_eq!(allocator.used_memory(), 0);
}

#[test]
#[should_panic(expected = "outside the managed region")]
fn foreign_pointer_deallocation_panics() {
    let allocator = TlsfAllocator::new(1024).unwrap();
    let foreign = Box::new(0u64);
    unsafe {
        allocator.deallocate(
            std::ptr::NonNull::from(&*foreign).cast(),
            Layout::new::<u64>(),
        );
    }
}

#[test]
#[should_panic(expected = "before the allocator was destroyed")]
fn dropping_with_outstanding_allocation_panics() {
    let allocator = TlsfAllocator::new(1024).unwrap();
    let _leaked = unsafe { allocator.allocate(Layout::new::<u64>()).unwrap() };
    drop(allocator);
}
