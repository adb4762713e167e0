//! Allocator context.
//!
//! [`SlabAllocator`] owns the memory provider and the registry of every live
//! cache. The registry is a doubly-linked list threaded through a slot table,
//! newest cache first; lookups by object size walk it from the head.

use alloc::vec::Vec;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

#[cfg(feature = "log")]
use log::{debug, warn};

use crate::{AllocError, AllocResult, CacheConfig, MemoryProvider, SlabCache, SystemMemory};

/// Source of slab owner tags, unique for the life of the process.
static NEXT_OWNER: AtomicUsize = AtomicUsize::new(1);

/// Usage counters
#[cfg(feature = "tracking")]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct UsageStats {
    pub caches_created: usize,
    pub caches_destroyed: usize,
    pub allocations: usize,
    pub failed_allocations: usize,
    /// Slabs obtained from the provider, first slabs of new caches included.
    pub slabs_grown: usize,
    pub deallocations: usize,
    /// Frees of addresses no cache recognised (unknown or already free).
    pub ignored_deallocations: usize,
}

/// Handle to a cache of a [`SlabAllocator`].
///
/// Handles of destroyed caches are rejected with
/// [`AllocError::InvalidParam`], even after the slot is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CacheId {
    index: usize,
    generation: u32,
}

struct RegistryEntry {
    cache: SlabCache,
    prev: Option<usize>,
    next: Option<usize>,
}

struct CacheSlot {
    generation: u32,
    entry: Option<RegistryEntry>,
}

/// Slab allocator context owning a set of single-size caches.
///
/// Not synchronised; wrap it in a lock to share it between threads.
pub struct SlabAllocator<P: MemoryProvider = SystemMemory> {
    provider: P,
    slots: Vec<CacheSlot>,
    vacant: Vec<usize>,
    head: Option<usize>,
    len: usize,
    #[cfg(feature = "tracking")]
    stats: UsageStats,
}

impl SlabAllocator<SystemMemory> {
    /// Allocator backed by the global allocator.
    pub const fn new() -> Self {
        Self::with_provider(SystemMemory)
    }
}

impl Default for SlabAllocator<SystemMemory> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: MemoryProvider> SlabAllocator<P> {
    pub const fn with_provider(provider: P) -> Self {
        Self {
            provider,
            slots: Vec::new(),
            vacant: Vec::new(),
            head: None,
            len: 0,
            #[cfg(feature = "tracking")]
            stats: UsageStats {
                caches_created: 0,
                caches_destroyed: 0,
                allocations: 0,
                failed_allocations: 0,
                slabs_grown: 0,
                deallocations: 0,
                ignored_deallocations: 0,
            },
        }
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    /// Create a cache for `size`-byte objects with co-located chunk headers.
    pub fn create_cache(&mut self, size: usize) -> AllocResult<CacheId> {
        self.create_cache_with(CacheConfig::new(size))
    }

    /// Create a cache whose objects are aligned to `alignment`.
    ///
    /// The object size is rounded up to the alignment. An alignment of `0`
    /// is the same as [`create_cache`](Self::create_cache).
    pub fn create_cache_aligned(&mut self, size: usize, alignment: usize) -> AllocResult<CacheId> {
        self.create_cache_with(CacheConfig::new(size).with_alignment(alignment))
    }

    /// Create a cache and link it at the head of the registry.
    ///
    /// The cache gets its first slab immediately, so a cache that could be
    /// created can serve at least one slab's worth of objects.
    pub fn create_cache_with(&mut self, config: CacheConfig) -> AllocResult<CacheId> {
        self.slots
            .try_reserve(1)
            .map_err(|_| AllocError::NoMemory)?;
        // Room for every slot to become vacant, so destroy never allocates.
        self.vacant
            .try_reserve((self.slots.len() + 1).saturating_sub(self.vacant.len()))
            .map_err(|_| AllocError::NoMemory)?;

        let owner = NEXT_OWNER.fetch_add(1, Ordering::Relaxed);
        let cache = SlabCache::new(config, owner, &mut self.provider)?;
        debug!(
            "slab allocator: created cache of {}-byte objects",
            cache.object_size()
        );

        let index = match self.vacant.pop() {
            Some(index) => index,
            None => {
                self.slots.push(CacheSlot {
                    generation: 0,
                    entry: None,
                });
                self.slots.len() - 1
            }
        };

        let old_head = self.head;
        let slot = &mut self.slots[index];
        slot.entry = Some(RegistryEntry {
            cache,
            prev: None,
            next: old_head,
        });
        let id = CacheId {
            index,
            generation: slot.generation,
        };

        if let Some(head) = old_head {
            if let Some(entry) = self.entry_mut(head) {
                entry.prev = Some(index);
            }
        }
        self.head = Some(index);
        self.len += 1;

        #[cfg(feature = "tracking")]
        {
            self.stats.caches_created += 1;
            self.stats.slabs_grown += 1;
        }
        Ok(id)
    }

    /// Destroy a cache and release all of its slabs.
    ///
    /// Objects still allocated from the cache become dangling.
    pub fn destroy_cache(&mut self, id: CacheId) -> AllocResult {
        let index = self.checked_index(id)?;
        self.unlink(index);

        let slot = &mut self.slots[index];
        let entry = slot.entry.take().ok_or(AllocError::InvalidParam)?;
        slot.generation = slot.generation.wrapping_add(1);
        self.vacant.push(index);

        debug!(
            "slab allocator: destroying {}-byte cache #{}",
            entry.cache.object_size(),
            index
        );
        entry.cache.destroy(&mut self.provider);

        #[cfg(feature = "tracking")]
        {
            self.stats.caches_destroyed += 1;
        }
        Ok(())
    }

    /// Allocate one object from the cache.
    ///
    /// The returned memory is uninitialised and `object_size` bytes long.
    pub fn alloc(&mut self, id: CacheId) -> AllocResult<NonNull<u8>> {
        let (cache, provider) = self.cache_and_provider(id)?;
        #[cfg(feature = "tracking")]
        let slabs_before = cache.slab_count();
        let result = cache
            .alloc_object(provider)
            .and_then(|addr| NonNull::new(addr as *mut u8).ok_or(AllocError::NoMemory));

        #[cfg(feature = "tracking")]
        {
            if cache.slab_count() > slabs_before {
                self.stats.slabs_grown += 1;
            }
            match result {
                Ok(_) => self.stats.allocations += 1,
                Err(_) => self.stats.failed_allocations += 1,
            }
        }
        result
    }

    /// Return an object to the cache it came from.
    ///
    /// Returns `Ok(true)` if the object was released and `Ok(false)` if the
    /// address is not a live object of this cache, in which case nothing
    /// changes.
    ///
    /// # Safety
    ///
    /// `ptr` must have been returned by [`alloc`](Self::alloc) on this cache
    /// (or [`alloc_by_size`](Self::alloc_by_size) resolving to it). Caches
    /// without alignment locate the chunk header by pointer arithmetic and
    /// read memory in front of `ptr`.
    pub unsafe fn dealloc(&mut self, id: CacheId, ptr: NonNull<u8>) -> AllocResult<bool> {
        let (cache, _) = self.cache_and_provider(id)?;
        let released = cache.dealloc_object(ptr.as_ptr() as usize)?;

        #[cfg(feature = "tracking")]
        {
            if released {
                self.stats.deallocations += 1;
            } else {
                self.stats.ignored_deallocations += 1;
            }
        }
        Ok(released)
    }

    /// The most recently created cache whose object size is exactly `size`.
    pub fn find_cache(&self, size: usize) -> Option<CacheId> {
        self.cache_ids()
            .find(|&id| self.cache(id).is_some_and(|cache| cache.object_size() == size))
    }

    /// Allocate from the cache [`find_cache`](Self::find_cache) picks.
    ///
    /// There is no matching free by size: release the object with
    /// [`dealloc`](Self::dealloc) on the cache `find_cache(size)` returns.
    pub fn alloc_by_size(&mut self, size: usize) -> AllocResult<NonNull<u8>> {
        let Some(id) = self.find_cache(size) else {
            warn!("slab allocator: no cache for {}-byte objects", size);
            return Err(AllocError::CacheNotFound);
        };
        self.alloc(id)
    }

    pub fn cache(&self, id: CacheId) -> Option<&SlabCache> {
        self.slots
            .get(id.index)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_ref())
            .map(|entry| &entry.cache)
    }

    /// Live caches in registry order, newest first.
    pub fn cache_ids(&self) -> impl Iterator<Item = CacheId> + '_ {
        core::iter::successors(self.head, move |&index| {
            self.entry(index).and_then(|entry| entry.next)
        })
        .take(self.len)
        .filter_map(move |index| {
            self.slots.get(index).map(|slot| CacheId {
                index,
                generation: slot.generation,
            })
        })
    }

    pub fn cache_count(&self) -> usize {
        self.len
    }

    /// Bytes obtained from the provider by all caches.
    pub fn total_bytes(&self) -> usize {
        self.caches().map(|cache| cache.reserved_bytes()).sum()
    }

    /// Bytes of objects currently handed out.
    pub fn used_bytes(&self) -> usize {
        self.caches()
            .map(|cache| cache.stats().live_objects * cache.object_size())
            .sum()
    }

    pub fn available_bytes(&self) -> usize {
        self.total_bytes().saturating_sub(self.used_bytes())
    }

    #[cfg(feature = "tracking")]
    pub fn usage_stats(&self) -> UsageStats {
        self.stats
    }

    fn caches(&self) -> impl Iterator<Item = &SlabCache> + '_ {
        self.cache_ids().filter_map(move |id| self.cache(id))
    }

    fn entry(&self, index: usize) -> Option<&RegistryEntry> {
        self.slots.get(index).and_then(|slot| slot.entry.as_ref())
    }

    fn entry_mut(&mut self, index: usize) -> Option<&mut RegistryEntry> {
        self.slots.get_mut(index).and_then(|slot| slot.entry.as_mut())
    }

    fn checked_index(&self, id: CacheId) -> AllocResult<usize> {
        match self.slots.get(id.index) {
            Some(slot) if slot.generation == id.generation && slot.entry.is_some() => Ok(id.index),
            _ => Err(AllocError::InvalidParam),
        }
    }

    fn cache_and_provider(&mut self, id: CacheId) -> AllocResult<(&mut SlabCache, &mut P)> {
        let entry = self
            .slots
            .get_mut(id.index)
            .filter(|slot| slot.generation == id.generation)
            .and_then(|slot| slot.entry.as_mut())
            .ok_or(AllocError::InvalidParam)?;
        Ok((&mut entry.cache, &mut self.provider))
    }

    fn unlink(&mut self, index: usize) {
        let Some((prev, next)) = self.entry(index).map(|entry| (entry.prev, entry.next)) else {
            return;
        };

        match prev {
            Some(prev) => {
                if let Some(entry) = self.entry_mut(prev) {
                    entry.next = next;
                }
            }
            None => self.head = next,
        }
        if let Some(next) = next {
            if let Some(entry) = self.entry_mut(next) {
                entry.prev = prev;
            }
        }

        if let Some(entry) = self.entry_mut(index) {
            entry.prev = None;
            entry.next = None;
        }
        self.len -= 1;
    }
}

impl<P: MemoryProvider> Drop for SlabAllocator<P> {
    fn drop(&mut self) {
        while let Some(head) = self.head {
            let Some(generation) = self.slots.get(head).map(|slot| slot.generation) else {
                break;
            };
            if self.destroy_cache(CacheId { index: head, generation }).is_err() {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    #[test]
    fn test_registry_order_and_lookup() {
        let mut allocator = SlabAllocator::new();
        let a = allocator.create_cache(32).unwrap();
        let b = allocator.create_cache(64).unwrap();
        let c = allocator.create_cache(32).unwrap();

        let ids: Vec<CacheId> = allocator.cache_ids().collect();
        assert_eq!(ids, [c, b, a]);
        assert_eq!(allocator.cache_count(), 3);

        // Newest match wins.
        assert_eq!(allocator.find_cache(32), Some(c));
        assert_eq!(allocator.find_cache(64), Some(b));
        assert_eq!(allocator.find_cache(48), None);

        allocator.destroy_cache(c).unwrap();
        assert_eq!(allocator.find_cache(32), Some(a));
        let ids: Vec<CacheId> = allocator.cache_ids().collect();
        assert_eq!(ids, [b, a]);
    }

    #[test]
    fn test_unlink_middle_and_tail() {
        let mut allocator = SlabAllocator::new();
        let a = allocator.create_cache(8).unwrap();
        let b = allocator.create_cache(16).unwrap();
        let c = allocator.create_cache(24).unwrap();

        allocator.destroy_cache(b).unwrap();
        let ids: Vec<CacheId> = allocator.cache_ids().collect();
        assert_eq!(ids, [c, a]);

        allocator.destroy_cache(a).unwrap();
        let ids: Vec<CacheId> = allocator.cache_ids().collect();
        assert_eq!(ids, [c]);

        allocator.destroy_cache(c).unwrap();
        assert_eq!(allocator.cache_ids().count(), 0);
        assert_eq!(allocator.cache_count(), 0);
    }

    #[test]
    fn test_stale_handle_rejected() {
        let mut allocator = SlabAllocator::new();
        let old = allocator.create_cache(32).unwrap();
        allocator.destroy_cache(old).unwrap();

        // The slot is reused, the old handle stays dead.
        let new = allocator.create_cache(32).unwrap();
        assert_ne!(old, new);
        assert_eq!(allocator.alloc(old), Err(AllocError::InvalidParam));
        assert_eq!(allocator.destroy_cache(old), Err(AllocError::InvalidParam));
        assert!(allocator.cache(old).is_none());
        assert!(allocator.alloc(new).is_ok());
    }

    #[test]
    fn test_alloc_by_size() {
        let mut allocator = SlabAllocator::new();
        assert_eq!(allocator.alloc_by_size(32), Err(AllocError::CacheNotFound));

        let id = allocator.create_cache_aligned(40, 64).unwrap();
        assert_eq!(allocator.find_cache(40), None);
        assert_eq!(allocator.find_cache(64), Some(id));

        let ptr = allocator.alloc_by_size(64).unwrap();
        assert_eq!(unsafe { allocator.dealloc(id, ptr) }, Ok(true));
    }

    #[test]
    fn test_invalid_config_leaves_registry_empty() {
        let mut allocator = SlabAllocator::new();
        assert_eq!(allocator.create_cache(0), Err(AllocError::InvalidParam));
        assert_eq!(
            allocator.create_cache_aligned(32, 24),
            Err(AllocError::InvalidParam)
        );
        assert_eq!(allocator.cache_count(), 0);
        assert_eq!(allocator.total_bytes(), 0);
    }

    #[test]
    fn test_byte_accounting() {
        let mut allocator = SlabAllocator::new();
        let id = allocator.create_cache(100).unwrap();
        let reserved = allocator.total_bytes();
        assert!(reserved >= 16 * 100);
        assert_eq!(allocator.used_bytes(), 0);

        let ptr = allocator.alloc(id).unwrap();
        assert_eq!(allocator.used_bytes(), 100);
        assert_eq!(allocator.available_bytes(), reserved - 100);

        unsafe { allocator.dealloc(id, ptr).unwrap() };
        assert_eq!(allocator.used_bytes(), 0);
        assert_eq!(allocator.total_bytes(), reserved);
    }

    #[cfg(feature = "tracking")]
    #[test]
    fn test_usage_stats() {
        let mut allocator = SlabAllocator::new();
        let id = allocator.create_cache(32).unwrap();
        let ptr = allocator.alloc(id).unwrap();
        unsafe {
            allocator.dealloc(id, ptr).unwrap();
            allocator.dealloc(id, ptr).unwrap();
        }
        allocator.destroy_cache(id).unwrap();

        let stats = allocator.usage_stats();
        assert_eq!(stats.caches_created, 1);
        assert_eq!(stats.caches_destroyed, 1);
        assert_eq!(stats.allocations, 1);
        assert_eq!(stats.slabs_grown, 1);
        assert_eq!(stats.deallocations, 1);
        assert_eq!(stats.ignored_deallocations, 1);
    }
}
