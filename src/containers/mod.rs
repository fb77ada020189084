//! Containers parameterized by a borrowed allocator.
//!
//! Containers never own their allocator; the borrow checker pins each
//! container to an allocator that outlives it. Element destructors run on
//! every removal path. Allocator exhaustion inside a mutating operation is
//! treated like the standard library treats it: the operation panics, with
//! `try_`-prefixed entry points for callers that want to recover.

mod array;
mod hash_map;
mod hash_set;

use core::hash::BuildHasherDefault;

pub use array::Array;
pub use hash_map::HashMap;
pub use hash_set::HashSet;

/// Default hasher for the hash containers, wyhash behind the standard
/// `BuildHasher` plumbing.
pub type DefaultHashBuilder = BuildHasherDefault<wyhash::WyHash>;

use crate::error::AllocError;

/// Terminal path for container operations that have no way to report
/// allocation failure.
#[cold]
#[inline(never)]
pub(crate) fn alloc_failure(err: AllocError) -> ! {
    panic!("container allocation failed: {err}");
}
