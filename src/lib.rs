//! Slab Cache Allocator
//!
//! This crate implements a slab allocator for fixed-size objects, featuring:
//! - Per-size caches with free, partial and full slab lists
//! - Address-ordered free lists inside every slab
//! - Two slab layouts: co-located chunk headers, or headers kept apart from
//!   an aligned data block
//! - An explicit allocator context owning the cache registry

#![no_std]

extern crate alloc;

use core::alloc::Layout;

// Logging support - conditionally import log crate
#[cfg(feature = "log")]
extern crate log;

// Stub macros when log is disabled - these become no-ops
#[cfg(not(feature = "log"))]
macro_rules! error {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! warn {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
#[allow(unused_macros)]
macro_rules! info {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
macro_rules! debug {
    ($($arg:tt)*) => {};
}
#[cfg(not(feature = "log"))]
#[allow(unused_macros)]
macro_rules! trace {
    ($($arg:tt)*) => {};
}

/// Number of chunks in a slab unless a cache asks for another capacity.
pub const DEFAULT_SLAB_CAPACITY: usize = 16;

/// The error type used for allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// Invalid size, alignment, capacity or handle, or a list operation on a
    /// slab that is not on that list.
    InvalidParam,
    /// The memory provider could not satisfy a request.
    NoMemory,
    /// No cache serves the requested object size.
    CacheNotFound,
}

/// A [`Result`] type with [`AllocError`] as the error type.
pub type AllocResult<T = ()> = Result<T, AllocError>;

/// Source of the raw blocks slabs are carved from.
pub trait MemoryProvider {
    /// Allocate a block satisfying `layout`, returning its start address.
    fn alloc_block(&mut self, layout: Layout) -> AllocResult<usize>;

    /// Return a block to the provider.
    ///
    /// # Safety
    ///
    /// `addr` must come from [`alloc_block`](Self::alloc_block) on this
    /// provider with the same `layout`, and must not be used afterwards.
    unsafe fn dealloc_block(&mut self, addr: usize, layout: Layout);
}

/// Round `pos` up to a multiple of `align`, or `None` on overflow.
#[inline]
const fn checked_align_up(pos: usize, align: usize) -> Option<usize> {
    match pos.checked_add(align - 1) {
        Some(sum) => Some(sum & !(align - 1)),
        None => None,
    }
}

/// Checks whether the address has the demanded alignment.
///
/// Equivalent to `addr % align == 0`, but the alignment must be a power of two.
#[inline]
const fn is_aligned(base_addr: usize, align: usize) -> bool {
    base_addr & (align - 1) == 0
}

pub mod config;
pub use config::CacheConfig;

pub mod slab;
pub use slab::{CacheStats, SlabCache, SlabLayout, SlabList};

pub mod slab_allocator;
#[cfg(feature = "tracking")]
pub use slab_allocator::UsageStats;
pub use slab_allocator::{CacheId, SlabAllocator};

pub mod system_memory;
pub use system_memory::SystemMemory;
