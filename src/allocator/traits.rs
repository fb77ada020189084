//! Core allocator traits.

use core::alloc::Layout;
use core::ptr::NonNull;

use crate::error::AllocResult;
use crate::utils::MAX_ALIGN;

/// Polymorphic allocation capability.
///
/// The contract is deliberately small: request storage, release storage.
/// Implementations return pointers aligned to `layout.align()`; alignments up
/// to [`MAX_ALIGN`] are supported everywhere, anything larger is a contract
/// violation that trips an assertion in the concrete allocators.
///
/// The trait is dyn-compatible so containers can hold `&dyn Allocator` and
/// stay independent of the concrete strategy.
///
/// # Safety Requirements
///
/// Implementors must ensure that:
/// - Returned pointers are valid for reads and writes of `layout.size()`
///   bytes until deallocated (or until a bulk invalidation such as
///   [`Resettable::reset`])
/// - Returned pointers are aligned to `layout.align()`
/// - Exhaustion is reported as `Err`, never by panicking or aborting
pub unsafe trait Allocator {
    /// Allocates memory for the given layout.
    ///
    /// # Safety
    /// - The returned memory is uninitialized and must be written before read
    /// - The caller must not use the pointer past its deallocation
    ///
    /// # Errors
    /// Returns an error on exhaustion or on an unsatisfiable layout.
    unsafe fn allocate(&self, layout: Layout) -> AllocResult<NonNull<[u8]>>;

    /// Deallocates memory previously returned by this allocator.
    ///
    /// Bump-style allocators treat this as a no-op.
    ///
    /// # Safety
    /// - `ptr` must have been returned by `allocate` on this allocator
    /// - `layout` must match the allocation layout
    /// - Double-free is undefined behavior
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout);
}

/// Blanket implementation for references so borrowed allocators flow through
/// generic code.
unsafe impl<A: Allocator + ?Sized> Allocator for &A {
    #[inline]
    unsafe fn allocate(&self, layout: Layout) -> AllocResult<NonNull<[u8]>> {
        unsafe { (**self).allocate(layout) }
    }

    #[inline]
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { (**self).deallocate(ptr, layout) }
    }
}

/// Memory usage reporting for allocators that own a bounded region.
pub trait MemoryUsage {
    /// Bytes currently handed out and not yet released
    fn used_memory(&self) -> usize;

    /// Bytes still available, or `None` for unbounded allocators
    fn available_memory(&self) -> Option<usize>;

    /// Total capacity, or `None` for unbounded allocators
    fn total_memory(&self) -> Option<usize> {
        self.available_memory()
            .map(|available| self.used_memory() + available)
    }
}

/// Allocators that can invalidate every outstanding allocation at once.
pub trait Resettable {
    /// Resets the allocator to its initial state.
    ///
    /// # Safety
    /// All pointers previously returned by this allocator become invalid;
    /// the caller must ensure no live references remain.
    unsafe fn reset(&self);
}

/// Asserts that `layout` fits the fundamental-alignment contract.
///
/// Shared by the concrete allocators; over-aligned requests are programmer
/// errors, not runtime conditions.
#[inline]
pub(crate) fn assert_fundamental_alignment(layout: Layout) {
    assert!(
        layout.align() <= MAX_ALIGN,
        "requested alignment {} exceeds the maximum fundamental alignment {}",
        layout.align(),
        MAX_ALIGN
    );
}
