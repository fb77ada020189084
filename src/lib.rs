//! # Nebula Alloc
//!
//! Explicit allocator primitives and allocator-aware containers for engine
//! and runtime code that avoids hidden allocation, hidden destruction and
//! hidden reallocation.
//!
//! The crate provides four allocation strategies behind one [`Allocator`]
//! trait:
//!
//! - [`SystemAllocator`] — thin wrapper over the platform heap
//! - [`LinearAllocator`] — fixed-buffer bump allocator with `reset`/`rewind`
//! - [`ScopedScratch`] — scope stack over a linear allocator with ordered,
//!   destructor-tracked teardown
//! - [`TlsfAllocator`] — constant-time two-level segregated fit general
//!   allocator with boundary-tag coalescing
//!
//! and containers parameterized by a borrowed allocator:
//!
//! - [`Array`] — growable contiguous sequence
//! - [`HashSet`] / [`HashMap`] — open-addressed Swiss-style tables
//!
//! Everything is single-threaded by contract. Allocation exhaustion is a
//! recoverable [`AllocError`]; contract violations are hard assertions.

pub mod allocator;
pub mod containers;
pub mod error;
pub mod utils;

// Re-export main types
pub use allocator::{
    Allocator, LinearAllocator, MemoryUsage, Resettable, ScopedScratch, SystemAllocator,
    TlsfAllocator, TlsfStats,
};
pub use containers::{Array, DefaultHashBuilder, HashMap, HashSet};
pub use error::{AllocError, AllocResult};
