//! Chunk headers.
//!
//! Every object slot has a header living in slab-owned memory. Headers thread
//! two intrusive lists: the creation-order list (`next`) used to enumerate a
//! slab, and the doubly-linked free list (`next_free` / `prev_free`) kept in
//! ascending `data_addr` order. Links are raw addresses, `0` meaning none.

use super::slab_node::SlabNode;

#[repr(C)]
pub(crate) struct ChunkHeader {
    next: usize,
    next_free: usize,
    prev_free: usize,
    slab: usize,
    data_addr: usize,
}

impl ChunkHeader {
    pub(crate) const SIZE: usize = core::mem::size_of::<ChunkHeader>();
    pub(crate) const ALIGN: usize = core::mem::align_of::<ChunkHeader>();

    pub(crate) const fn new(slab: usize, data_addr: usize) -> Self {
        Self {
            next: 0,
            next_free: 0,
            prev_free: 0,
            slab,
            data_addr,
        }
    }
}

fn to_link(chunk: Option<ChunkNode>) -> usize {
    chunk.map_or(0, |chunk| chunk.addr)
}

fn from_link(addr: usize) -> Option<ChunkNode> {
    if addr == 0 {
        None
    } else {
        Some(ChunkNode::new(addr))
    }
}

/// Handle to a chunk header at a fixed address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ChunkNode {
    addr: usize,
}

impl ChunkNode {
    pub const fn new(addr: usize) -> Self {
        Self { addr }
    }

    #[cfg(test)]
    pub fn addr(&self) -> usize {
        self.addr
    }

    fn header(&self) -> &ChunkHeader {
        unsafe { &*(self.addr as *const ChunkHeader) }
    }

    fn header_mut(&mut self) -> &mut ChunkHeader {
        unsafe { &mut *(self.addr as *mut ChunkHeader) }
    }

    /// Address of the object slot this chunk describes (`0` for a sentinel).
    pub fn data_addr(&self) -> usize {
        self.header().data_addr
    }

    pub fn slab(&self) -> SlabNode {
        SlabNode::new(self.header().slab)
    }

    pub fn next(&self) -> Option<ChunkNode> {
        from_link(self.header().next)
    }

    pub fn set_next(&mut self, next: Option<ChunkNode>) {
        self.header_mut().next = to_link(next);
    }

    pub fn next_free(&self) -> Option<ChunkNode> {
        from_link(self.header().next_free)
    }

    pub fn set_next_free(&mut self, next: Option<ChunkNode>) {
        self.header_mut().next_free = to_link(next);
    }

    pub fn prev_free(&self) -> Option<ChunkNode> {
        from_link(self.header().prev_free)
    }

    pub fn set_prev_free(&mut self, prev: Option<ChunkNode>) {
        self.header_mut().prev_free = to_link(prev);
    }

    /// Whether the chunk is linked into its slab's free list.
    ///
    /// Only meaningful for data chunks: a free chunk always has a predecessor
    /// (the sentinel or another chunk), an allocated one never does.
    pub fn is_free(&self) -> bool {
        self.header().prev_free != 0
    }
}
