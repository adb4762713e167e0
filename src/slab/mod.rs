//! Slab allocator implementation.
//!
//! A cache serves one object size from slabs of fixed capacity. Each slab
//! keeps its free chunks on an address-ordered list, and sits on the cache's
//! free, partial or full list according to how many chunks are free.

mod chunk;
pub mod layout;
pub mod slab_cache;
mod slab_node;

// Re-export public types
pub use layout::SlabLayout;
pub use slab_cache::{CacheStats, SlabCache, SlabList};
