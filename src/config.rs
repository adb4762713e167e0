//! Cache configuration.

use crate::{AllocError, AllocResult, DEFAULT_SLAB_CAPACITY};

/// Parameters of a single-size cache.
///
/// An `alignment` of `0` selects the co-located slab layout, where chunk
/// headers sit directly in front of their objects. A nonzero alignment selects
/// the separated layout: the object size is rounded up to the alignment and
/// objects live in their own aligned block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheConfig {
    pub object_size: usize,
    pub alignment: usize,
    pub slab_capacity: usize,
}

impl CacheConfig {
    pub const fn new(object_size: usize) -> Self {
        Self {
            object_size,
            alignment: 0,
            slab_capacity: DEFAULT_SLAB_CAPACITY,
        }
    }

    pub const fn with_alignment(mut self, alignment: usize) -> Self {
        self.alignment = alignment;
        self
    }

    pub const fn with_slab_capacity(mut self, slab_capacity: usize) -> Self {
        self.slab_capacity = slab_capacity;
        self
    }

    /// Validate the configuration and return it with `object_size` rounded up
    /// to the alignment.
    pub fn resolve(&self) -> AllocResult<Self> {
        if self.object_size == 0 || self.slab_capacity == 0 {
            return Err(AllocError::InvalidParam);
        }
        if self.alignment != 0 && !self.alignment.is_power_of_two() {
            return Err(AllocError::InvalidParam);
        }

        let object_size = if self.alignment == 0 {
            self.object_size
        } else {
            crate::checked_align_up(self.object_size, self.alignment)
                .ok_or(AllocError::InvalidParam)?
        };

        Ok(Self {
            object_size,
            ..*self
        })
    }
}
