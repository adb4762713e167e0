//! Slab cache implementation for a single object size.
//!
//! This module implements SlabCache which manages three lists (free, partial,
//! full) of slab nodes. A slab's list is a function of its free count alone,
//! and every move between lists goes through `SlabCache::reclassify`.

#[cfg(feature = "log")]
use log::{debug, error, warn};

use super::chunk::ChunkNode;
use super::layout::{colocated_chunk_of, SlabLayout};
use super::slab_node::{SlabGeometry, SlabNode};
use crate::{AllocError, AllocResult, CacheConfig, MemoryProvider};

/// The three slab lists of a cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlabList {
    /// Every chunk free.
    Free,
    /// Some chunks free.
    Partial,
    /// No chunk free.
    Full,
}

impl SlabList {
    pub const ALL: [SlabList; 3] = [SlabList::Free, SlabList::Partial, SlabList::Full];

    /// The list a slab with `free_count` of `capacity` chunks free belongs to.
    pub const fn classify(free_count: usize, capacity: usize) -> Self {
        if free_count == capacity {
            SlabList::Free
        } else if free_count == 0 {
            SlabList::Full
        } else {
            SlabList::Partial
        }
    }

    fn of(slab: &SlabNode) -> Self {
        if slab.is_empty() {
            SlabList::Free
        } else if slab.is_full() {
            SlabList::Full
        } else {
            SlabList::Partial
        }
    }
}

/// Doubly-linked list of slabs threaded through their headers.
///
/// The only place a slab's list tag is written.
struct SlabIntrusiveList {
    kind: SlabList,
    head: Option<SlabNode>,
    len: usize,
}

impl SlabIntrusiveList {
    const fn new(kind: SlabList) -> Self {
        Self {
            kind,
            head: None,
            len: 0,
        }
    }

    fn len(&self) -> usize {
        self.len
    }

    fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    fn front(&self) -> Option<SlabNode> {
        self.head
    }

    fn iter(&self) -> impl Iterator<Item = SlabNode> {
        core::iter::successors(self.head, |slab| slab.next())
    }

    fn push_front(&mut self, mut slab: SlabNode) {
        slab.set_prev(None);
        slab.set_next(self.head);
        if let Some(mut head) = self.head {
            head.set_prev(Some(slab));
        }
        slab.set_list(self.kind);

        self.head = Some(slab);
        self.len += 1;
    }

    fn remove(&mut self, mut slab: SlabNode) -> AllocResult {
        if slab.list() != self.kind || self.is_empty() {
            error!(
                "slab list {:?}: slab {:#x} is on list {:?}",
                self.kind,
                slab.addr(),
                slab.list()
            );
            return Err(AllocError::InvalidParam);
        }

        let prev = slab.prev();
        let next = slab.next();

        if let Some(mut prev) = prev {
            prev.set_next(next);
        } else {
            self.head = next;
        }
        if let Some(mut next) = next {
            next.set_prev(prev);
        }

        slab.set_prev(None);
        slab.set_next(None);
        self.len -= 1;
        Ok(())
    }

    fn pop_front(&mut self) -> Option<SlabNode> {
        let head = self.head?;
        self.remove(head).ok()?;
        Some(head)
    }
}

/// Snapshot of a cache's occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    pub object_size: usize,
    pub alignment: usize,
    pub slab_capacity: usize,
    pub free_slabs: usize,
    pub partial_slabs: usize,
    pub full_slabs: usize,
    /// Chunks on free lists, summed over all slabs.
    pub free_objects: usize,
    /// Objects handed out and not yet freed.
    pub live_objects: usize,
    /// Bytes obtained from the memory provider.
    pub reserved_bytes: usize,
}

impl CacheStats {
    pub fn slab_count(&self) -> usize {
        self.free_slabs + self.partial_slabs + self.full_slabs
    }

    pub fn total_objects(&self) -> usize {
        self.slab_count() * self.slab_capacity
    }
}

/// Allocator for objects of one fixed size.
///
/// Created and destroyed through [`SlabAllocator`](crate::SlabAllocator),
/// which owns the memory provider its slabs come from.
pub struct SlabCache {
    config: CacheConfig,
    geometry: SlabGeometry,
    free: SlabIntrusiveList,
    partial: SlabIntrusiveList,
    full: SlabIntrusiveList,
}

impl SlabCache {
    /// Create a cache and eagerly grow its first slab.
    ///
    /// `owner` tags every slab so addresses from other caches are recognised.
    pub(crate) fn new(
        config: CacheConfig,
        owner: usize,
        provider: &mut dyn MemoryProvider,
    ) -> AllocResult<Self> {
        let config = config.resolve()?;
        let geometry = SlabGeometry::new(
            owner,
            SlabLayout::from_alignment(config.alignment),
            config.object_size,
            config.slab_capacity,
        )?;

        let mut cache = Self {
            config,
            geometry,
            free: SlabIntrusiveList::new(SlabList::Free),
            partial: SlabIntrusiveList::new(SlabList::Partial),
            full: SlabIntrusiveList::new(SlabList::Full),
        };
        cache.grow(provider)?;
        Ok(cache)
    }

    /// Configuration with the object size already rounded to the alignment.
    pub fn config(&self) -> CacheConfig {
        self.config
    }

    pub fn object_size(&self) -> usize {
        self.config.object_size
    }

    pub fn alignment(&self) -> usize {
        self.config.alignment
    }

    pub fn slab_capacity(&self) -> usize {
        self.config.slab_capacity
    }

    pub fn layout(&self) -> SlabLayout {
        self.geometry.layout
    }

    pub fn slab_count(&self) -> usize {
        self.free.len() + self.partial.len() + self.full.len()
    }

    /// Number of slabs currently on `list`.
    pub fn slabs_on(&self, list: SlabList) -> usize {
        self.list(list).len()
    }

    /// Bytes obtained from the memory provider for this cache's slabs.
    pub fn reserved_bytes(&self) -> usize {
        self.slab_count() * self.geometry.slab_bytes()
    }

    fn list(&self, kind: SlabList) -> &SlabIntrusiveList {
        match kind {
            SlabList::Free => &self.free,
            SlabList::Partial => &self.partial,
            SlabList::Full => &self.full,
        }
    }

    fn list_mut(&mut self, kind: SlabList) -> &mut SlabIntrusiveList {
        match kind {
            SlabList::Free => &mut self.free,
            SlabList::Partial => &mut self.partial,
            SlabList::Full => &mut self.full,
        }
    }

    /// Allocate one new slab onto the free list.
    ///
    /// On failure the cache is left untouched.
    pub(crate) fn grow(&mut self, provider: &mut dyn MemoryProvider) -> AllocResult {
        let slab = SlabNode::create(provider, &self.geometry).map_err(|err| {
            warn!(
                "slab cache: growing {}-byte cache failed: {:?}",
                self.config.object_size, err
            );
            err
        })?;
        self.free.push_front(slab);

        debug!(
            "slab cache: new slab {:#x} for {}-byte objects ({} slabs)",
            slab.addr(),
            self.config.object_size,
            self.slab_count()
        );
        Ok(())
    }

    /// Move `slab` to the list its free count calls for.
    fn reclassify(&mut self, slab: SlabNode) -> AllocResult {
        let current = slab.list();
        let target = SlabList::of(&slab);
        if current != target {
            self.list_mut(current).remove(slab)?;
            self.list_mut(target).push_front(slab);
        }
        Ok(())
    }

    /// Allocate an object, growing the cache if no slab has a free chunk.
    ///
    /// Partial slabs are served before free ones.
    pub(crate) fn alloc_object(&mut self, provider: &mut dyn MemoryProvider) -> AllocResult<usize> {
        let mut slab = match self.partial.front().or_else(|| self.free.front()) {
            Some(slab) => slab,
            None => {
                self.grow(provider)?;
                self.free.front().ok_or(AllocError::NoMemory)?
            }
        };

        let Some(chunk) = slab.pop_free() else {
            error!(
                "slab cache: slab {:#x} on {:?} list has no free chunk",
                slab.addr(),
                slab.list()
            );
            return Err(AllocError::InvalidParam);
        };
        self.reclassify(slab)?;

        Ok(chunk.data_addr())
    }

    fn find_chunk(&self, obj_addr: usize) -> Option<ChunkNode> {
        self.partial
            .iter()
            .chain(self.full.iter())
            .find_map(|slab| slab.find_chunk(obj_addr))
    }

    /// Return an object to its slab.
    ///
    /// Returns `Ok(false)` without changing anything if `obj_addr` is not a
    /// live object of this cache (unknown address or double free).
    ///
    /// # Safety
    ///
    /// For co-located caches `obj_addr` must have been returned by
    /// [`alloc_object`](Self::alloc_object) of a co-located cache whose slabs
    /// are still alive; its header is found by pointer arithmetic.
    pub(crate) unsafe fn dealloc_object(&mut self, obj_addr: usize) -> AllocResult<bool> {
        let chunk = match self.geometry.layout {
            SlabLayout::CoLocated => colocated_chunk_of(obj_addr),
            SlabLayout::Separated { .. } => self.find_chunk(obj_addr),
        };
        let Some(chunk) = chunk else {
            warn!(
                "slab cache: {:#x} is not an object of the {}-byte cache",
                obj_addr, self.config.object_size
            );
            return Ok(false);
        };

        let mut slab = chunk.slab();
        if !slab.is_valid_for(self.geometry.owner) {
            warn!(
                "slab cache: {:#x} belongs to another cache, ignored",
                obj_addr
            );
            return Ok(false);
        }
        if !slab.push_free(chunk) {
            warn!("slab cache: double free of {:#x} ignored", obj_addr);
            return Ok(false);
        }
        self.reclassify(slab)?;

        Ok(true)
    }

    /// Release every slab, live objects included.
    pub(crate) fn destroy(mut self, provider: &mut dyn MemoryProvider) {
        let mut released = 0;
        for kind in SlabList::ALL {
            while let Some(slab) = self.list_mut(kind).pop_front() {
                unsafe { slab.release(provider, &self.geometry) };
                released += 1;
            }
        }
        debug!(
            "slab cache: destroyed {}-byte cache, released {} slabs",
            self.config.object_size, released
        );
    }

    pub fn stats(&self) -> CacheStats {
        let free_objects: usize = SlabList::ALL
            .iter()
            .flat_map(|&kind| self.list(kind).iter())
            .map(|slab| slab.free_count())
            .sum();
        let live_objects: usize = SlabList::ALL
            .iter()
            .flat_map(|&kind| self.list(kind).iter())
            .map(|slab| slab.in_use())
            .sum();

        CacheStats {
            object_size: self.config.object_size,
            alignment: self.config.alignment,
            slab_capacity: self.config.slab_capacity,
            free_slabs: self.free.len(),
            partial_slabs: self.partial.len(),
            full_slabs: self.full.len(),
            free_objects,
            live_objects,
            reserved_bytes: self.reserved_bytes(),
        }
    }

    /// Check list membership and free-list accounting of every slab.
    ///
    /// Logs the first violation found.
    pub fn is_consistent(&self) -> bool {
        for kind in SlabList::ALL {
            let list = self.list(kind);
            let mut walked = 0;

            for slab in list.iter().take(list.len() + 1) {
                walked += 1;
                if !slab.is_valid_for(self.geometry.owner) {
                    error!("slab cache: slab {:#x} has a bad header", slab.addr());
                    return false;
                }
                if slab.list() != kind
                    || SlabList::classify(slab.free_count(), slab.capacity()) != kind
                {
                    error!(
                        "slab cache: slab {:#x} with {} free chunks misfiled on {:?} list",
                        slab.addr(),
                        slab.free_count(),
                        kind
                    );
                    return false;
                }
                if !slab.check_free_list() {
                    return false;
                }
            }

            if walked != list.len() {
                error!(
                    "slab cache: {:?} list walks {} slabs, length says {}",
                    kind,
                    walked,
                    list.len()
                );
                return false;
            }
        }
        true
    }
}
