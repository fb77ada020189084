//! Shared fixtures for the integration tests.
//!
//! Lifecycle counting goes through per-test `Rc` handles instead of process
//! globals so tests stay independent under the parallel test runner.

#![allow(dead_code)]

use std::cell::Cell;
use std::hash::{Hash, Hasher};
use std::rc::Rc;

/// Per-test lifecycle counters.
#[derive(Default)]
pub struct LifecycleCounters {
    pub drops: Cell<usize>,
    pub clones: Cell<usize>,
}

pub type CounterHandle = Rc<LifecycleCounters>;

pub fn counters() -> CounterHandle {
    Rc::new(LifecycleCounters::default())
}

/// Element that reports its clones and drops into shared counters.
///
/// Equality and hashing only look at the value, so `Tracked` works as a
/// hash-table element too.
pub struct Tracked {
    pub value: u32,
    counters: CounterHandle,
}

impl Tracked {
    pub fn new(value: u32, counters: &CounterHandle) -> Self {
        Self {
            value,
            counters: Rc::clone(counters),
        }
    }
}

impl Clone for Tracked {
    fn clone(&self) -> Self {
        self.counters.clones.set(self.counters.clones.get() + 1);
        Self {
            value: self.value,
            counters: Rc::clone(&self.counters),
        }
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.counters.drops.set(self.counters.drops.get() + 1);
    }
}

impl PartialEq for Tracked {
    fn eq(&self, other: &Self) -> bool {
        self.value == other.value
    }
}

impl Eq for Tracked {}

impl Hash for Tracked {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.value.hash(state);
    }
}

/// Over-aligned element for alignment checks.
#[repr(align(16))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Aligned16 {
    pub value: u8,
}
