//! Per-thread allocation caches.

use std::ptr::NonNull;

use crate::{
    alloc::{class_capacity, retained_slots, slots_per_block},
    freelist::FreeList,
    header::{HeaderFlags, Kind},
    heap::Heap,
    layout::{
        GRANULE_SIZE, MAX_KINDS, MAX_SMALL_BYTES, MAX_SMALL_GRANULES,
        bytes_to_granules,
    },
};

/// Allocation state private to one thread.
///
/// Small objects come from local free lists that are refilled and drained
/// in batches, so the common path takes no lock. Dropping the context
/// hands every cached object back and unregisters it from the heap.
pub struct ThreadContext {
    heap: Heap,
    caches: Vec<Option<FreeList>>,
    never_allocates: bool,
}

impl std::fmt::Debug for ThreadContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadContext")
            .field("cached", &self.cached())
            .field("never_allocates", &self.never_allocates)
            .finish()
    }
}

#[inline]
fn slot(kind: Kind, granules: usize) -> usize {
    kind.index() * (MAX_SMALL_GRANULES + 1) + granules
}

fn cache_for(
    caches: &mut [Option<FreeList>],
    kind: Kind,
    granules: usize,
) -> &mut FreeList {
    caches[slot(kind, granules)]
        .get_or_insert_with(|| FreeList::with_capacity(class_capacity(granules)))
}

impl ThreadContext {
    pub(crate) fn new(heap: Heap) -> Self {
        heap.register_context();
        Self {
            heap,
            caches: (0..MAX_KINDS * (MAX_SMALL_GRANULES + 1))
                .map(|_| None)
                .collect(),
            never_allocates: false,
        }
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Objects currently held in local caches.
    pub fn cached(&self) -> usize {
        self.caches.iter().flatten().map(FreeList::len).sum()
    }

    pub fn allocate(&mut self, size: usize) -> Option<NonNull<u8>> {
        self.allocate_kind(size, Kind::NORMAL)
    }

    pub fn allocate_kind(
        &mut self,
        size: usize,
        kind: Kind,
    ) -> Option<NonNull<u8>> {
        if size > MAX_SMALL_BYTES || !self.heap.settings().thread_local_caches
        {
            return self.heap.allocate_with(size, kind, HeaderFlags::empty());
        }
        self.heap.check_open("allocate");
        let granules = bytes_to_granules(size);
        let alloc = self.heap.allocator();
        let cache = cache_for(&mut self.caches, kind, granules);
        if cache.is_empty() {
            let batch = (slots_per_block(granules) / 2).max(1);
            alloc.malloc_many(granules, kind, cache, batch);
        }
        let addr = cache.pop()?;
        if alloc.kind_clears(kind) {
            // SAFETY: the slot is owned by the caller from here on
            unsafe {
                (addr as *mut u8).write_bytes(0, granules * GRANULE_SIZE)
            };
        }
        NonNull::new(addr as *mut u8)
    }

    pub fn release(&mut self, ptr: NonNull<u8>) {
        if !self.heap.settings().thread_local_caches {
            return self.heap.release(ptr);
        }
        self.heap.check_open("release");
        let addr = ptr.as_ptr() as usize;
        let Some((hdr, base)) = self.heap.allocator().resolve(addr) else {
            log::warn!("ignoring release of foreign pointer {addr:#x}");
            return;
        };
        if !hdr.is_small() {
            return self.heap.release(ptr);
        }
        let (kind, granules) = (hdr.kind(), hdr.granules());
        let cache = cache_for(&mut self.caches, kind, granules);
        if !hdr.is_marked((base - hdr.block()) / GRANULE_SIZE)
            || cache.contains(base)
        {
            log::warn!("release of unallocated slot {base:#x} ignored");
            return;
        }
        let keep = if self.never_allocates {
            0
        } else {
            retained_slots(granules)
        };
        let alloc = self.heap.allocator();
        if cache.is_full() {
            alloc.drain_cache(granules, kind, cache, keep);
        }
        cache.push(base);
        if keep == 0 {
            alloc.drain_cache(granules, kind, cache, 0);
        }
    }

    /// A thread that will not allocate again keeps nothing cached.
    pub fn declare_never_allocates(&mut self, flag: bool) {
        self.never_allocates = flag;
        if flag {
            self.drain_all(0);
        }
    }

    fn drain_all(&mut self, keep: usize) {
        let alloc = self.heap.allocator();
        for (idx, cache) in self.caches.iter_mut().enumerate() {
            let Some(cache) = cache else { continue };
            let kind = Kind((idx / (MAX_SMALL_GRANULES + 1)) as u8);
            let granules = idx % (MAX_SMALL_GRANULES + 1);
            alloc.drain_cache(granules, kind, cache, keep);
        }
    }
}

impl Drop for ThreadContext {
    fn drop(&mut self) {
        if self.heap.is_closed() {
            if self.cached() > 0 {
                log::warn!(
                    "thread context outlived close, {} cached objects leak",
                    self.cached()
                );
            }
        } else {
            self.drain_all(0);
        }
        self.heap.unregister_context();
    }
}
