//! Physical slab layouts.
//!
//! ```text
//! CoLocated:  [SlabHeader | sentinel][chunk 0][object 0][chunk 1][object 1]...
//!
//! Separated:  [SlabHeader | sentinel][chunk 0][chunk 1]...[chunk C-1]
//!             [object 0][object 1]...[object C-1]      <- aligned data block
//! ```
//!
//! A provider only guarantees the alignment of a block's start, so objects
//! that need a stricter alignment than the chunk header cannot be interleaved
//! with headers and get a block of their own.

use core::alloc::Layout;

use super::chunk::{ChunkHeader, ChunkNode};
use super::slab_node::SlabHeader;
use crate::{AllocError, AllocResult};

/// Placement of chunk headers relative to object slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlabLayout {
    /// Each object directly follows its chunk header in one block.
    CoLocated,
    /// Headers in a metadata block, objects in a block aligned to `align`.
    Separated { align: usize },
}

impl SlabLayout {
    /// `0` selects [`SlabLayout::CoLocated`].
    pub const fn from_alignment(alignment: usize) -> Self {
        if alignment == 0 {
            SlabLayout::CoLocated
        } else {
            SlabLayout::Separated { align: alignment }
        }
    }

    /// The requested object alignment, `0` for the co-located layout.
    pub const fn alignment(&self) -> usize {
        match self {
            SlabLayout::CoLocated => 0,
            SlabLayout::Separated { align } => *align,
        }
    }

    /// Distance between consecutive chunk headers in the metadata block.
    ///
    /// Co-located pairs are padded so every header stays aligned.
    pub(crate) fn chunk_stride(&self, object_size: usize) -> Option<usize> {
        match self {
            SlabLayout::CoLocated => crate::checked_align_up(
                ChunkHeader::SIZE.checked_add(object_size)?,
                ChunkHeader::ALIGN,
            ),
            SlabLayout::Separated { .. } => Some(ChunkHeader::SIZE),
        }
    }

    pub(crate) fn meta_layout(&self, object_size: usize, capacity: usize) -> AllocResult<Layout> {
        let size = self
            .chunk_stride(object_size)
            .and_then(|stride| stride.checked_mul(capacity))
            .and_then(|chunks| chunks.checked_add(SlabHeader::SIZE))
            .ok_or(AllocError::InvalidParam)?;
        Layout::from_size_align(size, SlabHeader::ALIGN).map_err(|_| AllocError::InvalidParam)
    }

    /// Layout of the separate object block, if this layout uses one.
    pub(crate) fn data_layout(
        &self,
        object_size: usize,
        capacity: usize,
    ) -> AllocResult<Option<Layout>> {
        match self {
            SlabLayout::CoLocated => Ok(None),
            SlabLayout::Separated { align } => {
                let size = object_size
                    .checked_mul(capacity)
                    .ok_or(AllocError::InvalidParam)?;
                Layout::from_size_align(size, *align)
                    .map(Some)
                    .map_err(|_| AllocError::InvalidParam)
            }
        }
    }

    /// Object address for chunk `index` whose header lives at `chunk_addr`.
    pub(crate) fn data_addr(
        &self,
        chunk_addr: usize,
        data_base: usize,
        object_size: usize,
        index: usize,
    ) -> usize {
        match self {
            SlabLayout::CoLocated => chunk_addr + ChunkHeader::SIZE,
            SlabLayout::Separated { .. } => data_base + index * object_size,
        }
    }
}

/// Recover the chunk header of a co-located object by pointer arithmetic.
///
/// Returns `None` when the header in front of `obj_addr` does not describe
/// `obj_addr`.
///
/// # Safety
///
/// `obj_addr` must be an address handed out by a co-located slab that is
/// still alive. Any other address makes this read memory the allocator does
/// not own.
pub(crate) unsafe fn colocated_chunk_of(obj_addr: usize) -> Option<ChunkNode> {
    let chunk_addr = obj_addr.checked_sub(ChunkHeader::SIZE)?;
    if chunk_addr == 0 || !crate::is_aligned(chunk_addr, ChunkHeader::ALIGN) {
        return None;
    }
    let chunk = ChunkNode::new(chunk_addr);
    (chunk.data_addr() == obj_addr).then_some(chunk)
}
