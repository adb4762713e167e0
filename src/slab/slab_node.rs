//! Slab node implementation.
//!
//! A slab is a header followed by `capacity` chunk headers, all placed in a
//! block obtained from the [`MemoryProvider`]. The header embeds the sentinel
//! chunk anchoring both the creation-order chunk list and the free list.

use core::alloc::Layout;
use core::mem::offset_of;
use core::ops::Range;

#[cfg(feature = "log")]
use log::error;

use super::chunk::{ChunkHeader, ChunkNode};
use super::layout::SlabLayout;
use super::slab_cache::SlabList;
use crate::{AllocResult, MemoryProvider};

#[repr(C)]
pub(crate) struct SlabHeader {
    magic: u32,
    list: SlabList,
    owner: usize,
    layout: SlabLayout,
    object_size: usize,
    chunk_stride: usize,
    capacity: usize,
    free_count: usize,
    data_base: usize,
    prev: usize,
    next: usize,
    sentinel: ChunkHeader,
}

impl SlabHeader {
    pub(crate) const SIZE: usize = core::mem::size_of::<SlabHeader>();
    pub(crate) const ALIGN: usize = core::mem::align_of::<SlabHeader>();
}

// Chunk headers follow the slab header directly.
const _: () = assert!(SlabHeader::SIZE % ChunkHeader::ALIGN == 0);
const _: () = assert!(SlabHeader::ALIGN >= ChunkHeader::ALIGN);

const SLAB_HEADER_MAGIC: u32 = 0x534c_4142;

/// Shape of every slab of one cache, computed and validated once.
#[derive(Debug, Clone, Copy)]
pub(crate) struct SlabGeometry {
    pub owner: usize,
    pub layout: SlabLayout,
    pub object_size: usize,
    pub capacity: usize,
    pub chunk_stride: usize,
    pub meta_layout: Layout,
    pub data_layout: Option<Layout>,
}

impl SlabGeometry {
    pub fn new(
        owner: usize,
        layout: SlabLayout,
        object_size: usize,
        capacity: usize,
    ) -> AllocResult<Self> {
        let meta_layout = layout.meta_layout(object_size, capacity)?;
        let data_layout = layout.data_layout(object_size, capacity)?;
        let chunk_stride = layout
            .chunk_stride(object_size)
            .ok_or(crate::AllocError::InvalidParam)?;
        Ok(Self {
            owner,
            layout,
            object_size,
            capacity,
            chunk_stride,
            meta_layout,
            data_layout,
        })
    }

    /// Bytes one slab takes from the provider.
    pub fn slab_bytes(&self) -> usize {
        self.meta_layout.size() + self.data_layout.map_or(0, |layout| layout.size())
    }
}

/// Handle to a slab header at a fixed address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct SlabNode {
    addr: usize,
}

impl SlabNode {
    pub const fn new(addr: usize) -> Self {
        Self { addr }
    }

    pub fn addr(&self) -> usize {
        self.addr
    }

    fn header(&self) -> &SlabHeader {
        unsafe { &*(self.addr as *const SlabHeader) }
    }

    fn header_mut(&mut self) -> &mut SlabHeader {
        unsafe { &mut *(self.addr as *mut SlabHeader) }
    }

    /// Allocate a slab with every chunk free.
    ///
    /// Either all blocks of the slab are obtained or none are kept.
    pub fn create(
        provider: &mut dyn MemoryProvider,
        geometry: &SlabGeometry,
    ) -> AllocResult<Self> {
        let meta_base = provider.alloc_block(geometry.meta_layout)?;
        let data_base = match geometry.data_layout {
            Some(data_layout) => match provider.alloc_block(data_layout) {
                Ok(base) => base,
                Err(err) => {
                    unsafe { provider.dealloc_block(meta_base, geometry.meta_layout) };
                    return Err(err);
                }
            },
            None => 0,
        };

        let mut slab = SlabNode::new(meta_base);
        slab.init(geometry, data_base);
        Ok(slab)
    }

    fn init(&mut self, geometry: &SlabGeometry, data_base: usize) {
        unsafe {
            core::ptr::write(
                self.addr as *mut SlabHeader,
                SlabHeader {
                    magic: SLAB_HEADER_MAGIC,
                    list: SlabList::Free,
                    owner: geometry.owner,
                    layout: geometry.layout,
                    object_size: geometry.object_size,
                    chunk_stride: geometry.chunk_stride,
                    capacity: geometry.capacity,
                    free_count: geometry.capacity,
                    data_base,
                    prev: 0,
                    next: 0,
                    sentinel: ChunkHeader::new(self.addr, 0),
                },
            );
        }

        let mut prev = self.sentinel();
        for index in 0..geometry.capacity {
            let chunk_addr = self.chunk_addr(index);
            let data_addr =
                geometry
                    .layout
                    .data_addr(chunk_addr, data_base, geometry.object_size, index);
            unsafe {
                core::ptr::write(
                    chunk_addr as *mut ChunkHeader,
                    ChunkHeader::new(self.addr, data_addr),
                );
            }

            let mut chunk = ChunkNode::new(chunk_addr);
            prev.set_next(Some(chunk));
            prev.set_next_free(Some(chunk));
            chunk.set_prev_free(Some(prev));
            prev = chunk;
        }
    }

    /// Give the slab's blocks back to the provider.
    ///
    /// # Safety
    ///
    /// The slab must be unlinked and never touched again, and `geometry` must
    /// be the one it was created with.
    pub unsafe fn release(self, provider: &mut dyn MemoryProvider, geometry: &SlabGeometry) {
        if let Some(data_layout) = geometry.data_layout {
            provider.dealloc_block(self.header().data_base, data_layout);
        }
        provider.dealloc_block(self.addr, geometry.meta_layout);
    }

    pub fn is_valid_for(&self, owner: usize) -> bool {
        let header = self.header();
        header.magic == SLAB_HEADER_MAGIC && header.owner == owner
    }

    pub fn capacity(&self) -> usize {
        self.header().capacity
    }

    pub fn free_count(&self) -> usize {
        self.header().free_count
    }

    pub fn in_use(&self) -> usize {
        self.capacity() - self.free_count()
    }

    pub fn is_full(&self) -> bool {
        self.free_count() == 0
    }

    pub fn is_empty(&self) -> bool {
        self.free_count() == self.capacity()
    }

    pub fn list(&self) -> SlabList {
        self.header().list
    }

    pub fn set_list(&mut self, list: SlabList) {
        self.header_mut().list = list;
    }

    pub fn prev(&self) -> Option<SlabNode> {
        match self.header().prev {
            0 => None,
            prev => Some(SlabNode::new(prev)),
        }
    }

    pub fn next(&self) -> Option<SlabNode> {
        match self.header().next {
            0 => None,
            next => Some(SlabNode::new(next)),
        }
    }

    pub fn set_prev(&mut self, prev: Option<SlabNode>) {
        self.header_mut().prev = prev.map_or(0, |slab| slab.addr);
    }

    pub fn set_next(&mut self, next: Option<SlabNode>) {
        self.header_mut().next = next.map_or(0, |slab| slab.addr);
    }

    fn sentinel(&self) -> ChunkNode {
        ChunkNode::new(self.addr + offset_of!(SlabHeader, sentinel))
    }

    fn chunk_addr(&self, index: usize) -> usize {
        self.addr + SlabHeader::SIZE + index * self.header().chunk_stride
    }

    #[cfg(test)]
    pub fn chunk_at(&self, index: usize) -> Option<ChunkNode> {
        (index < self.capacity()).then(|| ChunkNode::new(self.chunk_addr(index)))
    }

    /// All data chunks in creation order.
    pub fn chunks(&self) -> impl Iterator<Item = ChunkNode> {
        core::iter::successors(self.sentinel().next(), |chunk| chunk.next())
    }

    /// Free chunks in list order (ascending object address).
    pub fn free_chunks(&self) -> impl Iterator<Item = ChunkNode> {
        core::iter::successors(self.sentinel().next_free(), |chunk| chunk.next_free())
    }

    /// Address range covered by the slab's object slots.
    pub fn data_range(&self) -> Range<usize> {
        let header = self.header();
        match header.layout {
            SlabLayout::CoLocated => {
                let start = self.addr + SlabHeader::SIZE + ChunkHeader::SIZE;
                let end = self.addr + SlabHeader::SIZE + header.capacity * header.chunk_stride;
                start..end
            }
            SlabLayout::Separated { .. } => {
                header.data_base..header.data_base + header.capacity * header.object_size
            }
        }
    }

    /// Find the chunk whose object starts exactly at `obj_addr`.
    pub fn find_chunk(&self, obj_addr: usize) -> Option<ChunkNode> {
        if !self.data_range().contains(&obj_addr) {
            return None;
        }
        self.chunks().find(|chunk| chunk.data_addr() == obj_addr)
    }

    /// Take the first chunk off the free list.
    pub fn pop_free(&mut self) -> Option<ChunkNode> {
        let mut sentinel = self.sentinel();
        let mut chunk = sentinel.next_free()?;
        let next = chunk.next_free();

        sentinel.set_next_free(next);
        if let Some(mut next) = next {
            next.set_prev_free(Some(sentinel));
        }
        chunk.set_next_free(None);
        chunk.set_prev_free(None);

        self.header_mut().free_count -= 1;
        Some(chunk)
    }

    /// Put `chunk` back on the free list, keeping it sorted by object address.
    ///
    /// Returns `false` and changes nothing if the chunk is already free.
    pub fn push_free(&mut self, mut chunk: ChunkNode) -> bool {
        if chunk.is_free() {
            return false;
        }

        let mut prev = self.sentinel();
        while let Some(next) = prev.next_free() {
            if next.data_addr() > chunk.data_addr() {
                break;
            }
            prev = next;
        }

        let next = prev.next_free();
        chunk.set_next_free(next);
        chunk.set_prev_free(Some(prev));
        if let Some(mut next) = next {
            next.set_prev_free(Some(chunk));
        }
        prev.set_next_free(Some(chunk));

        self.header_mut().free_count += 1;
        true
    }

    /// Verify the free list: back links, ascending order and length.
    pub fn check_free_list(&self) -> bool {
        let capacity = self.capacity();
        let mut prev = self.sentinel();
        let mut count = 0;

        for chunk in self.free_chunks().take(capacity + 1) {
            if chunk.prev_free() != Some(prev) {
                error!("slab {:#x}: broken free list back link", self.addr);
                return false;
            }
            if count > 0 && chunk.data_addr() <= prev.data_addr() {
                error!("slab {:#x}: free list out of address order", self.addr);
                return false;
            }
            prev = chunk;
            count += 1;
        }

        if count != self.free_count() {
            error!(
                "slab {:#x}: {} chunks on free list, free count says {}",
                self.addr,
                count,
                self.free_count()
            );
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SystemMemory;
    use alloc::vec::Vec;

    fn make_slab(layout: SlabLayout, object_size: usize, capacity: usize) -> (SlabNode, SlabGeometry) {
        let geometry = SlabGeometry::new(7, layout, object_size, capacity).unwrap();
        let slab = SlabNode::create(&mut SystemMemory, &geometry).unwrap();
        (slab, geometry)
    }

    #[test]
    fn test_new_slab_all_free() {
        let (slab, geometry) = make_slab(SlabLayout::CoLocated, 64, 16);

        assert!(slab.is_valid_for(7));
        assert!(!slab.is_valid_for(8));
        assert!(slab.is_empty());
        assert!(!slab.is_full());
        assert_eq!(slab.free_count(), 16);
        assert_eq!(slab.in_use(), 0);
        assert_eq!(slab.list(), SlabList::Free);
        assert_eq!(slab.chunks().count(), 16);
        assert_eq!(slab.free_chunks().count(), 16);
        assert!(slab.check_free_list());

        // Both lists start out identical.
        assert!(slab.chunks().eq(slab.free_chunks()));

        unsafe { slab.release(&mut SystemMemory, &geometry) };
    }

    #[test]
    fn test_colocated_data_follows_header() {
        let (slab, geometry) = make_slab(SlabLayout::CoLocated, 28, 4);

        for index in 0..4 {
            let chunk = slab.chunk_at(index).unwrap();
            assert_eq!(chunk.data_addr(), chunk.addr() + ChunkHeader::SIZE);
            assert_eq!(chunk.slab(), slab);
            assert!(slab.data_range().contains(&chunk.data_addr()));
        }
        assert_eq!(slab.chunk_at(4), None);

        unsafe { slab.release(&mut SystemMemory, &geometry) };
    }

    #[test]
    fn test_separated_data_is_contiguous_and_aligned() {
        let (slab, geometry) = make_slab(SlabLayout::Separated { align: 64 }, 64, 8);

        let base = slab.chunk_at(0).unwrap().data_addr();
        assert!(crate::is_aligned(base, 64));
        for index in 0..8 {
            let chunk = slab.chunk_at(index).unwrap();
            assert_eq!(chunk.data_addr(), base + index * 64);
        }
        assert_eq!(slab.data_range(), base..base + 8 * 64);

        unsafe { slab.release(&mut SystemMemory, &geometry) };
    }

    #[test]
    fn test_pop_and_push_keep_order() {
        let (mut slab, geometry) = make_slab(SlabLayout::CoLocated, 32, 8);

        let popped: Vec<ChunkNode> = (0..8).map(|_| slab.pop_free().unwrap()).collect();
        assert!(slab.is_full());
        assert_eq!(slab.pop_free(), None);
        assert!(popped.iter().all(|chunk| !chunk.is_free()));

        // Return out of order; the free list must come back sorted.
        for &index in &[5, 1, 7, 0, 3] {
            assert!(slab.push_free(popped[index]));
        }
        assert_eq!(slab.free_count(), 5);
        assert!(slab.check_free_list());

        let order: Vec<usize> = slab.free_chunks().map(|chunk| chunk.data_addr()).collect();
        let expected: Vec<usize> = [0, 1, 3, 5, 7]
            .iter()
            .map(|&index| popped[index].data_addr())
            .collect();
        assert_eq!(order, expected);

        // The head is the lowest free address.
        assert_eq!(slab.pop_free(), Some(popped[0]));

        unsafe { slab.release(&mut SystemMemory, &geometry) };
    }

    #[test]
    fn test_push_free_rejects_free_chunk() {
        let (mut slab, geometry) = make_slab(SlabLayout::CoLocated, 32, 4);

        let chunk = slab.pop_free().unwrap();
        assert!(slab.push_free(chunk));
        assert!(!slab.push_free(chunk));
        assert_eq!(slab.free_count(), 4);
        assert!(slab.check_free_list());

        unsafe { slab.release(&mut SystemMemory, &geometry) };
    }

    #[test]
    fn test_find_chunk() {
        let (mut slab, geometry) = make_slab(SlabLayout::Separated { align: 16 }, 48, 4);

        let chunk = slab.pop_free().unwrap();
        let addr = chunk.data_addr();
        assert_eq!(slab.find_chunk(addr), Some(chunk));
        assert_eq!(slab.find_chunk(addr + 1), None);
        assert_eq!(slab.find_chunk(slab.data_range().end), None);

        unsafe { slab.release(&mut SystemMemory, &geometry) };
    }
}
