//! Memory provider backed by the global allocator.

use alloc::alloc::{alloc, dealloc};
use core::alloc::Layout;

use crate::{AllocError, AllocResult, MemoryProvider};

/// Hands out blocks from the global allocator (`alloc::alloc`).
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemMemory;

impl MemoryProvider for SystemMemory {
    fn alloc_block(&mut self, layout: Layout) -> AllocResult<usize> {
        if layout.size() == 0 {
            return Err(AllocError::InvalidParam);
        }
        let addr = unsafe { alloc(layout) } as usize;
        if addr == 0 {
            return Err(AllocError::NoMemory);
        }
        Ok(addr)
    }

    unsafe fn dealloc_block(&mut self, addr: usize, layout: Layout) {
        dealloc(addr as *mut u8, layout);
    }
}
