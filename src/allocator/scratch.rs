//! Scope stack over a linear allocator.
//!
//! Implements Frostbite's Scope Stack:
//! <https://www.ea.com/frostbite/news/scope-stack-allocation>
//!
//! A scope records the linear allocator's offset at construction, tracks a
//! destructor record for every object allocated through it, and on drop runs
//! those destructors newest-to-oldest before rewinding the allocator to the
//! recorded mark. Nested child scopes give the same guarantee for inner
//! lifetimes; while a child is alive the parent rejects all allocations.

use core::alloc::Layout;
use core::cell::Cell;
use core::mem::MaybeUninit;
use core::ptr::{self, NonNull};

use super::{AllocResult, Allocator, LinearAllocator};
use crate::utils::MAX_ALIGN;

/// Destructor record for one tracked object.
///
/// Records are themselves bump-allocated in the underlying arena, right
/// before the object storage they describe, and chained newest-first.
struct ScopeRecord {
    data: *mut u8,
    dtor: unsafe fn(*mut u8),
    previous: *mut ScopeRecord,
}

/// Calls `T`'s destructor through a type-erased pointer.
///
/// # Safety
/// `ptr` must point to a live, properly aligned `T`.
unsafe fn drop_erased<T>(ptr: *mut u8) {
    unsafe { ptr::drop_in_place(ptr.cast::<T>()) }
}

/// Scoped scratch arena with destructor-tracked allocations.
///
/// Borrowing rules enforce the lifetime ordering: a scratch cannot outlive
/// its allocator, a child cannot outlive its parent, and references handed
/// out by [`alloc`](Self::alloc) cannot outlive the scratch that produced
/// them.
pub struct ScopedScratch<'a> {
    allocator: &'a LinearAllocator,
    mark: usize,
    parent: Option<&'a ScopedScratch<'a>>,
    has_child_scope: Cell<bool>,
    objects: Cell<*mut ScopeRecord>,
}

impl<'a> ScopedScratch<'a> {
    /// Opens a scope at the allocator's current offset.
    pub fn new(allocator: &'a LinearAllocator) -> Self {
        Self {
            allocator,
            mark: allocator.offset(),
            parent: None,
            has_child_scope: Cell::new(false),
            objects: Cell::new(ptr::null_mut()),
        }
    }

    /// Opens a nested scope sharing this scope's allocator.
    ///
    /// Until the child is dropped, this scope rejects allocations and
    /// further children.
    ///
    /// # Panics
    /// Panics if a child scope is already active.
    pub fn child_scope(&self) -> ScopedScratch<'_> {
        assert!(
            !self.has_child_scope.get(),
            "tried to create a child scope from a ScopedScratch that already has one"
        );
        self.has_child_scope.set(true);

        ScopedScratch {
            allocator: self.allocator,
            mark: self.allocator.offset(),
            parent: Some(self),
            has_child_scope: Cell::new(false),
            objects: Cell::new(ptr::null_mut()),
        }
    }

    /// Allocates uninitialized storage for a `T` without destructor
    /// tracking.
    ///
    /// For plain data only: whatever is written here is never dropped, the
    /// storage is simply reclaimed when the scope exits.
    ///
    /// # Errors
    /// Returns an error when the underlying allocator is exhausted.
    ///
    /// # Panics
    /// Panics if a child scope is active.
    pub fn alloc_pod<T>(&self) -> AllocResult<&mut MaybeUninit<T>> {
        const { assert!(align_of::<T>() <= MAX_ALIGN) };
        assert!(
            !self.has_child_scope.get(),
            "tried to allocate from a ScopedScratch that has a child scope"
        );

        let storage = unsafe { self.allocator.allocate(Layout::new::<T>())? };
        // SAFETY: freshly allocated, properly aligned, uninitialized
        Ok(unsafe { storage.cast::<MaybeUninit<T>>().as_mut() })
    }

    /// Allocates and constructs a `T`, registering its destructor to run on
    /// scope exit.
    ///
    /// Destructors run in reverse allocation order.
    ///
    /// # Errors
    /// Returns an error when the underlying allocator is exhausted; partial
    /// progress (the record allocation) is rewound first.
    ///
    /// # Panics
    /// Panics if a child scope is active.
    pub fn alloc<T>(&self, value: T) -> AllocResult<&mut T> {
        const { assert!(align_of::<T>() <= MAX_ALIGN) };
        assert!(
            !self.has_child_scope.get(),
            "tried to allocate from a ScopedScratch that has a child scope"
        );

        let record = unsafe { self.allocator.allocate(Layout::new::<ScopeRecord>())? }
            .cast::<ScopeRecord>();

        let storage = match unsafe { self.allocator.allocate(Layout::new::<T>()) } {
            Ok(storage) => storage.cast::<T>(),
            Err(err) => {
                // Roll back the record so the arena doesn't leak it
                unsafe { self.allocator.rewind(record.cast()) };
                return Err(err);
            }
        };

        unsafe {
            storage.write(value);
            record.write(ScopeRecord {
                data: storage.as_ptr().cast(),
                dtor: drop_erased::<T>,
                previous: self.objects.get(),
            });
        }
        self.objects.set(record.as_ptr());

        // SAFETY: just initialized, unique until the scope drops
        Ok(unsafe { &mut *storage.as_ptr() })
    }
}

unsafe impl Allocator for ScopedScratch<'_> {
    /// Forwards to the underlying linear allocator without destructor
    /// tracking, so containers can live inside a scratch scope.
    unsafe fn allocate(&self, layout: Layout) -> AllocResult<NonNull<[u8]>> {
        assert!(
            !self.has_child_scope.get(),
            "tried to allocate from a ScopedScratch that has a child scope"
        );
        unsafe { self.allocator.allocate(layout) }
    }

    #[inline]
    unsafe fn deallocate(&self, ptr: NonNull<u8>, layout: Layout) {
        unsafe { self.allocator.deallocate(ptr, layout) }
    }
}

impl Drop for ScopedScratch<'_> {
    fn drop(&mut self) {
        let mut record = self.objects.get();
        while !record.is_null() {
            unsafe {
                ((*record).dtor)((*record).data);
                record = (*record).previous;
            }
        }

        // SAFETY: everything past the mark belonged to this scope and its
        // destructors have just run
        unsafe { self.allocator.rewind_to(self.mark) };

        if let Some(parent) = self.parent {
            parent.has_child_scope.set(false);
        }
    }
}
