//! Object allocation on top of the block allocator.
//!
//! Small objects are served from per-(kind, size class) free lists guarded
//! by one lock per size class. Large objects and every block-level change
//! go through the global lock. Locks are always taken in the order
//! size class, global, index.
//!
//! A slot on any free list keeps its mark bit set: the allocator owns it.
//! Only truncation clears the bit and hands the slot back to its block.

use std::ptr::NonNull;

use parking_lot::{Mutex, RwLock};

use crate::{
    blocks::BlockAllocator,
    config::HeapSettings,
    freelist::FreeList,
    header::{HeaderFlags, HeaderList, HeaderRef, Kind, LinkTag},
    index::BlockIndex,
    layout::{
        AreaRef, BLOCK_SIZE, GRANULE_SIZE, MAX_KINDS, MAX_SMALL_BYTES,
        MAX_SMALL_GRANULES, bytes_to_granules,
    },
};

/// Objects carved from one block of `granules`-sized slots.
#[inline]
pub fn slots_per_block(granules: usize) -> usize {
    BLOCK_SIZE / (granules * GRANULE_SIZE)
}

/// Free list capacity of a size class. Once reached, the list is
/// truncated down to [`retained_slots`].
#[inline]
pub fn class_capacity(granules: usize) -> usize {
    2 * slots_per_block(granules)
}

#[inline]
pub fn retained_slots(granules: usize) -> usize {
    slots_per_block(granules)
}

/// Free objects and partially free blocks of one (kind, size class).
#[derive(Debug)]
pub struct ClassLists {
    pub free: FreeList,
    pub reclaim: HeaderList,
}

#[derive(Debug)]
pub struct SizeClass {
    granules: usize,
    kinds: Vec<Option<ClassLists>>,
}

impl SizeClass {
    fn new(granules: usize) -> Self {
        Self {
            granules,
            kinds: (0..MAX_KINDS).map(|_| None).collect(),
        }
    }

    pub fn granules(&self) -> usize {
        self.granules
    }

    /// Lists for `kind`, created on first use.
    pub fn lists(&mut self, kind: Kind) -> &mut ClassLists {
        let granules = self.granules;
        self.kinds[kind.index()].get_or_insert_with(|| ClassLists {
            free: FreeList::with_capacity(class_capacity(granules)),
            reclaim: HeaderList::new(),
        })
    }

    pub fn existing(&mut self) -> impl Iterator<Item = (Kind, &mut ClassLists)> {
        self.kinds
            .iter_mut()
            .enumerate()
            .filter_map(|(idx, lists)| {
                lists.as_mut().map(|lists| (Kind(idx as u8), lists))
            })
    }
}

pub struct Allocator {
    pub(crate) area: AreaRef,
    pub(crate) index: RwLock<BlockIndex>,
    pub(crate) global: Mutex<BlockAllocator>,
    pub(crate) classes: Box<[Mutex<SizeClass>]>,
    pub(crate) settings: HeapSettings,
}

impl std::fmt::Debug for Allocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Allocator")
            .field("area", &self.area)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl Allocator {
    pub fn new(
        area: AreaRef,
        blocks: BlockAllocator,
        settings: HeapSettings,
    ) -> Self {
        Self {
            area,
            index: RwLock::new(BlockIndex::new()),
            global: Mutex::new(blocks),
            classes: (0..=MAX_SMALL_GRANULES)
                .map(|granules| Mutex::new(SizeClass::new(granules)))
                .collect(),
            settings,
        }
    }

    pub fn kind_count(&self) -> usize {
        // SAFETY: valid area
        unsafe { (&raw const (*self.area.kinds()).count).read_volatile() }
    }

    fn check_kind(&self, kind: Kind) {
        if kind.index() >= self.kind_count() {
            crate::fatal!("allocation with unregistered kind {}", kind.0);
        }
    }

    pub fn kind_clears(&self, kind: Kind) -> bool {
        // SAFETY: valid area; kind was checked
        unsafe {
            let record = &raw const (*self.area.kinds()).kinds[kind.index()];
            (&raw const (*record).clear).read_volatile() != 0
        }
    }

    pub fn allocate(
        &self,
        size: usize,
        kind: Kind,
        flags: HeaderFlags,
    ) -> Option<NonNull<u8>> {
        self.check_kind(kind);
        if size <= MAX_SMALL_BYTES {
            self.allocate_small(bytes_to_granules(size), kind)
        } else {
            self.allocate_large(size, kind, flags)
        }
    }

    fn allocate_small(&self, granules: usize, kind: Kind) -> Option<NonNull<u8>> {
        let mut class = self.classes[granules].lock();
        let lists = class.lists(kind);
        let addr = match lists.free.pop() {
            Some(addr) => addr,
            None => {
                if !self.refill(lists, granules, kind, 1) {
                    return None;
                }
                lists.free.pop()?
            }
        };
        if self.kind_clears(kind) {
            // SAFETY: the slot is owned by the caller from here on
            unsafe {
                (addr as *mut u8).write_bytes(0, granules * GRANULE_SIZE)
            };
        }
        NonNull::new(addr as *mut u8)
    }

    fn allocate_large(
        &self,
        size: usize,
        kind: Kind,
        flags: HeaderFlags,
    ) -> Option<NonNull<u8>> {
        let size = bytes_to_granules(size) * GRANULE_SIZE;
        let mut global = self.global.lock();
        let hdr = {
            let mut index = self.index.write();
            global.allocate(&mut index, size, kind, flags)?
        };
        hdr.try_mark(0);
        hdr.set_n_marks(1);
        if self.kind_clears(kind) {
            // SAFETY: freshly claimed block group
            unsafe { (hdr.block() as *mut u8).write_bytes(0, size) };
        }
        drop(global);
        NonNull::new(hdr.block() as *mut u8)
    }

    /// Tops `lists.free` up to `want` entries: first by sweeping blocks on
    /// the reclaim list, then by carving fresh blocks. Returns `false` if
    /// the list is still empty.
    pub(crate) fn refill(
        &self,
        lists: &mut ClassLists,
        granules: usize,
        kind: Kind,
        want: usize,
    ) -> bool {
        let want = want.min(lists.free.capacity());
        self.continue_reclaim(lists, want);
        while lists.free.len() < want {
            let hdr = {
                let mut global = self.global.lock();
                let mut index = self.index.write();
                global.allocate(
                    &mut index,
                    granules * GRANULE_SIZE,
                    kind,
                    HeaderFlags::empty(),
                )
            };
            match hdr {
                Some(hdr) => self.carve_block(lists, hdr),
                None => break,
            }
        }
        !lists.free.is_empty()
    }

    /// Chops a fresh block into slots. Slots that do not fit on the free
    /// list stay unmarked and the block goes on the reclaim list.
    fn carve_block(&self, lists: &mut ClassLists, hdr: HeaderRef) {
        let size = hdr.size();
        let step = hdr.granules();
        let capacity = hdr.capacity();
        let mut carved = 0;
        for slot in (0..capacity).rev() {
            if lists.free.is_full() {
                break;
            }
            hdr.try_mark(slot * step);
            lists.free.push(hdr.block() + slot * size);
            carved += 1;
        }
        hdr.set_n_marks(carved);
        if carved < capacity {
            lists.reclaim.push(LinkTag::Reclaim, hdr);
        }
        log::trace!(
            "carved {carved} slots of {size} bytes at {:#x}",
            hdr.block()
        );
    }

    /// Header and object start for a pointer handed back by a caller.
    pub(crate) fn resolve(&self, addr: usize) -> Option<(HeaderRef, usize)> {
        let hdr = self.index.read().find_header(addr)?;
        if hdr.is_free() {
            return None;
        }
        let offset = addr - hdr.block();
        let base = if hdr.is_small() {
            let slot = offset / hdr.size();
            if slot >= hdr.capacity() {
                return None;
            }
            hdr.block() + slot * hdr.size()
        } else {
            hdr.block()
        };
        (self.settings.all_interior_pointers || base == addr)
            .then_some((hdr, base))
    }

    pub fn release(&self, ptr: NonNull<u8>) {
        let addr = ptr.as_ptr() as usize;
        let Some((hdr, base)) = self.resolve(addr) else {
            log::warn!("ignoring release of foreign pointer {addr:#x}");
            return;
        };
        if hdr.is_small() {
            self.release_small(hdr, base);
        } else {
            self.release_large(hdr, base);
        }
    }

    /// A second release is caught while the slot sits on this class's
    /// global list or after truncation has returned it to its block. A
    /// slot parked in some thread's cache still looks allocated here.
    fn release_small(&self, hdr: HeaderRef, base: usize) {
        let granules = hdr.granules();
        let mut class = self.classes[granules].lock();
        let granule = (base - hdr.block()) / GRANULE_SIZE;
        let lists = class.lists(hdr.kind());
        if !hdr.is_marked(granule) || lists.free.contains(base) {
            log::warn!("release of unallocated slot {base:#x} ignored");
            return;
        }
        if lists.free.is_full() {
            self.truncate_free_list(lists, retained_slots(granules));
        }
        lists.free.push(base);
    }

    fn release_large(&self, hdr: HeaderRef, base: usize) {
        let mut global = self.global.lock();
        let mut index = self.index.write();
        if index.header_at(base) != Some(hdr) || hdr.is_free() {
            log::warn!("double free of {base:#x} ignored");
            return;
        }
        global.free(&mut index, hdr, crate::blocks::FreeMode::Online);
    }

    /// Moves up to `n` objects of one class into `out`, refilling the
    /// global list first if needed. Returns the number moved.
    pub fn malloc_many(
        &self,
        granules: usize,
        kind: Kind,
        out: &mut FreeList,
        n: usize,
    ) -> usize {
        self.check_kind(kind);
        let n = n.min(out.remaining());
        let mut class = self.classes[granules].lock();
        let lists = class.lists(kind);
        if lists.free.len() < n {
            self.refill(lists, granules, kind, n);
        }
        let mut moved = 0;
        while moved < n {
            let Some(addr) = lists.free.pop() else { break };
            out.push(addr);
            moved += 1;
        }
        moved
    }

    /// Hands all but `keep` entries of a thread cache back: to the global
    /// list while it has room, to their blocks otherwise.
    pub fn drain_cache(
        &self,
        granules: usize,
        kind: Kind,
        cache: &mut FreeList,
        keep: usize,
    ) {
        if cache.len() <= keep {
            return;
        }
        let mut class = self.classes[granules].lock();
        let lists = class.lists(kind);
        let mut excess = cache.len() - keep;
        while excess > 0 && lists.free.len() < retained_slots(granules) {
            let Some(addr) = cache.pop_front() else { break };
            lists.free.push(addr);
            excess -= 1;
        }
        if excess > 0 {
            let victims = cache.drain_front(excess);
            self.truncate_fast_free_list(lists, &victims);
        }
    }

    /// Returns every slot held on a global free list to its block.
    pub fn drain_global_lists(&self) {
        for class in self.classes.iter() {
            let mut class = class.lock();
            for (_, lists) in class.existing() {
                self.truncate_free_list(lists, 0);
            }
        }
    }

    /// Drops all free and reclaim lists without touching mark bits.
    pub fn forget_class_lists(&self) {
        for class in self.classes.iter() {
            let mut class = class.lock();
            for (_, lists) in class.existing() {
                lists.free.clear();
                while lists.reclaim.pop(LinkTag::Reclaim).is_some() {}
            }
        }
    }

    /// Slots currently on global free lists, per (kind, granules).
    pub fn free_list_lengths(&self) -> Vec<(Kind, usize, usize)> {
        let mut out = Vec::new();
        for class in self.classes.iter() {
            let mut class = class.lock();
            let granules = class.granules();
            for (kind, lists) in class.existing() {
                if !lists.free.is_empty() {
                    out.push((kind, granules, lists.free.len()));
                }
            }
        }
        out
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        blocks::tests::fixture,
        layout::AREA_SIZE,
        mark::Descriptor,
        region::AnonymousRegion,
    };
    use std::{collections::HashSet, sync::Arc};

    pub(crate) struct TestAllocator {
        pub(crate) _region: Arc<AnonymousRegion>,
        pub(crate) alloc: Allocator,
    }

    pub(crate) fn allocator(region_bytes: usize) -> TestAllocator {
        let fx = fixture(region_bytes + AREA_SIZE, 16);
        let area = fx.blocks.area();
        // SAFETY: test area
        unsafe {
            let kinds = area.kinds();
            (*kinds).kinds[0].descriptor = Descriptor::POINTER_FREE.encode();
            (*kinds).kinds[1].descriptor = Descriptor::WHOLE_OBJECT.encode();
            (*kinds).kinds[1].clear = 1;
            (*kinds).count = 2;
        }
        let alloc = Allocator::new(area, fx.blocks, HeapSettings::default());
        *alloc.index.write() = fx.index;
        TestAllocator {
            _region: fx.region,
            alloc,
        }
    }

    #[test]
    fn size_classes_round_to_granules() {
        let t = allocator(4 << 20);
        for size in [1, 15, 16, 17, 100, 2047, 2048, 2049, 5000] {
            let ptr = t.alloc.allocate(size, Kind::NORMAL, HeaderFlags::empty());
            let addr = ptr.unwrap().as_ptr() as usize;
            let hdr = t.alloc.index.read().find_header(addr).unwrap();
            assert!(hdr.size() >= size, "size {size}");
            assert!(hdr.size() < size + GRANULE_SIZE, "size {size}");
            assert_eq!(addr % GRANULE_SIZE, 0);
            assert!(!hdr.is_free());
        }
    }

    #[test]
    fn freed_slot_is_reused_first() {
        let t = allocator(4 << 20);
        let a = t.alloc.allocate(48, Kind::NORMAL, HeaderFlags::empty()).unwrap();
        let b = t.alloc.allocate(48, Kind::NORMAL, HeaderFlags::empty()).unwrap();
        assert_ne!(a, b);
        t.alloc.release(b);
        let c = t.alloc.allocate(40, Kind::NORMAL, HeaderFlags::empty()).unwrap();
        assert_eq!(b, c);
    }

    #[test]
    fn cleared_kind_is_zeroed_on_allocation() {
        let t = allocator(4 << 20);
        let a = t.alloc.allocate(64, Kind::NORMAL, HeaderFlags::empty()).unwrap();
        // SAFETY: owned object
        unsafe { a.as_ptr().write_bytes(0xee, 64) };
        t.alloc.release(a);
        let b = t.alloc.allocate(64, Kind::NORMAL, HeaderFlags::empty()).unwrap();
        assert_eq!(a, b);
        // SAFETY: owned object
        let bytes = unsafe { std::slice::from_raw_parts(b.as_ptr(), 64) };
        assert!(bytes.iter().all(|&byte| byte == 0));
    }

    #[test]
    fn truncation_returns_empty_blocks() {
        let t = allocator(8 << 20);
        let slots = slots_per_block(2);
        let objects: Vec<_> = (0..3 * slots)
            .map(|_| t.alloc.allocate(32, Kind::NORMAL, HeaderFlags::empty()).unwrap())
            .collect();
        let free_before = t.alloc.global.lock().free_bytes();
        for &obj in &objects {
            t.alloc.release(obj);
        }
        t.alloc.drain_global_lists();
        assert!(t.alloc.free_list_lengths().is_empty());
        let free_after = t.alloc.global.lock().free_bytes();
        assert_eq!(free_after - free_before, 3 * BLOCK_SIZE);
    }

    #[test]
    fn double_free_is_ignored() {
        let t = allocator(4 << 20);
        let a = t.alloc.allocate(32, Kind::NORMAL, HeaderFlags::empty()).unwrap();
        t.alloc.release(a);
        t.alloc.drain_global_lists();
        // the slot is unmarked now; a second release must not list it
        t.alloc.release(a);
        assert!(t.alloc.free_list_lengths().is_empty());
    }

    #[test]
    fn double_free_while_listed_is_ignored() {
        let t = allocator(4 << 20);
        let a = t.alloc.allocate(32, Kind::NORMAL, HeaderFlags::empty()).unwrap();
        t.alloc.release(a);
        let listed = t.alloc.free_list_lengths();
        t.alloc.release(a);
        assert_eq!(t.alloc.free_list_lengths(), listed);

        let (_, _, n) = listed[0];
        let handed: HashSet<_> = (0..n)
            .map(|_| t.alloc.allocate(32, Kind::NORMAL, HeaderFlags::empty()).unwrap())
            .collect();
        assert_eq!(handed.len(), n);
        assert!(handed.contains(&a));
    }

    #[test]
    fn large_objects_go_to_blocks() {
        let t = allocator(4 << 20);
        let big = t
            .alloc
            .allocate(3 * BLOCK_SIZE, Kind::PTRFREE, HeaderFlags::IGNORE_OFF_PAGE)
            .unwrap();
        let addr = big.as_ptr() as usize;
        let hdr = t.alloc.index.read().find_header(addr + BLOCK_SIZE).unwrap();
        assert_eq!(hdr.block(), addr);
        assert!(hdr.flags().contains(HeaderFlags::IGNORE_OFF_PAGE));
        let free_before = t.alloc.global.lock().free_bytes();
        t.alloc.release(big);
        assert_eq!(
            t.alloc.global.lock().free_bytes(),
            free_before + 3 * BLOCK_SIZE
        );
    }

    #[test]
    fn concurrent_allocations_are_disjoint() {
        let t = allocator(32 << 20);
        let alloc = &t.alloc;
        let results: Vec<Vec<usize>> = std::thread::scope(|s| {
            let workers: Vec<_> = (0..4u64)
                .map(|id| {
                    s.spawn(move || {
                        let mut seed = id + 1;
                        let mut held = Vec::new();
                        for _ in 0..4000 {
                            seed = seed
                                .wrapping_mul(6364136223846793005)
                                .wrapping_add(1);
                            let size = 1 + (seed >> 40) as usize % 300;
                            if (seed >> 20) % 3 == 0 && !held.is_empty() {
                                let (ptr, _): (NonNull<u8>, usize) =
                                    held.swap_remove((seed >> 8) as usize % held.len());
                                alloc.release(ptr);
                            } else if let Some(ptr) =
                                alloc.allocate(size, Kind::NORMAL, HeaderFlags::empty())
                            {
                                held.push((ptr, size));
                            }
                        }
                        held.iter()
                            .map(|&(p, size)| {
                                let addr = p.as_ptr() as usize;
                                let hdr = alloc.index.read().find_header(addr).unwrap();
                                assert!(!hdr.is_free());
                                assert!(hdr.size() >= size);
                                addr
                            })
                            .collect::<Vec<_>>()
                    })
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        let mut ranges: Vec<(usize, usize)> = Vec::new();
        let mut seen = HashSet::new();
        for addr in results.into_iter().flatten() {
            assert!(seen.insert(addr), "{addr:#x} handed out twice");
            let hdr = t.alloc.index.read().find_header(addr).unwrap();
            ranges.push((addr, addr + hdr.size()));
        }
        ranges.sort_unstable();
        for pair in ranges.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "overlap {pair:?}");
        }
    }
}
