//! Lazy sweeping and free list truncation.
//!
//! After marking, blocks are only classified: empty blocks go back to the
//! block allocator and partially marked ones wait on a reclaim list until
//! an allocation of their size class needs slots.

use crate::{
    alloc::{Allocator, ClassLists},
    blocks::FreeMode,
    freelist::FreeList,
    header::{HeaderRef, LinkTag},
    index::HeaderCache,
    layout::GRANULE_SIZE,
};

const TALLY_SLOTS: usize = 32;

/// Evicted slots counted per block, so each block is settled once.
struct BlockTally {
    entries: [Option<(HeaderRef, usize)>; TALLY_SLOTS],
    len: usize,
}

impl BlockTally {
    fn new() -> Self {
        Self {
            entries: [None; TALLY_SLOTS],
            len: 0,
        }
    }

    /// Counts one slot of `hdr`. Returns `false` when the table is full.
    fn add(&mut self, hdr: HeaderRef) -> bool {
        let mut idx = (hdr.block() / crate::layout::BLOCK_SIZE) % TALLY_SLOTS;
        if self.len == TALLY_SLOTS {
            return self.entries.iter_mut().flatten().any(|(present, count)| {
                let hit = *present == hdr;
                *count += hit as usize;
                hit
            });
        }
        loop {
            let slot = &mut self.entries[idx];
            match slot {
                Some((present, count)) if *present == hdr => {
                    *count += 1;
                    return true;
                }
                Some(_) => idx = (idx + 1) % TALLY_SLOTS,
                None => {
                    *slot = Some((hdr, 1));
                    self.len += 1;
                    return true;
                }
            }
        }
    }

    fn drain(&mut self) -> impl Iterator<Item = (HeaderRef, usize)> + '_ {
        self.len = 0;
        self.entries.iter_mut().filter_map(Option::take)
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReclaimStats {
    pub freed_blocks: usize,
    pub partial_blocks: usize,
    pub full_blocks: usize,
}

impl Allocator {
    /// Sweeps blocks off the reclaim list until `lists.free` holds `want`
    /// entries or the list is exhausted.
    pub(crate) fn continue_reclaim(&self, lists: &mut ClassLists, want: usize) {
        while lists.free.len() < want {
            let Some(hdr) = lists.reclaim.pop(LinkTag::Reclaim) else {
                break;
            };
            if !sweep_block(hdr, &mut lists.free) {
                lists.reclaim.push(LinkTag::Reclaim, hdr);
                break;
            }
        }
    }

    /// Shrinks `lists.free` to `keep` entries, returning the oldest ones
    /// to their blocks one at a time.
    pub(crate) fn truncate_free_list(&self, lists: &mut ClassLists, keep: usize) {
        let excess = lists.free.len().saturating_sub(keep);
        if excess == 0 {
            return;
        }
        let victims = lists.free.drain_front(excess);
        let resolved: Vec<_> = {
            let index = self.index.read();
            victims
                .iter()
                .map(|&addr| (addr, index.find_header(addr)))
                .collect()
        };
        for (addr, hdr) in resolved {
            let Some(hdr) = hdr.filter(|h| !h.is_free()) else {
                log::warn!("free list entry {addr:#x} has no live block");
                continue;
            };
            if !hdr.clear_mark((addr - hdr.block()) / GRANULE_SIZE) {
                log::warn!("double free of {addr:#x} skipped");
                continue;
            }
            let left = hdr.dec_marks();
            self.settle(lists, hdr, left);
        }
    }

    /// Returns `victims` to their blocks, batching the live-count update
    /// per block.
    pub(crate) fn truncate_fast_free_list(
        &self,
        lists: &mut ClassLists,
        victims: &[usize],
    ) {
        let resolved: Vec<_> = {
            let index = self.index.read();
            let mut cache = HeaderCache::default();
            victims
                .iter()
                .map(|&addr| (addr, cache.lookup(&index, addr)))
                .collect()
        };
        let mut tally = BlockTally::new();
        for (addr, hdr) in resolved {
            let Some(hdr) = hdr.filter(|h| !h.is_free()) else {
                log::warn!("cached entry {addr:#x} has no live block");
                continue;
            };
            if !hdr.clear_mark((addr - hdr.block()) / GRANULE_SIZE) {
                log::warn!("double free of {addr:#x} skipped");
                continue;
            }
            if !tally.add(hdr) {
                self.apply_tally(lists, &mut tally);
                tally.add(hdr);
            }
        }
        self.apply_tally(lists, &mut tally);
    }

    fn apply_tally(&self, lists: &mut ClassLists, tally: &mut BlockTally) {
        let settled: Vec<_> = tally.drain().collect();
        for (hdr, count) in settled {
            let left = hdr.sub_marks(count);
            self.settle(lists, hdr, left);
        }
    }

    /// Moves a block whose live count dropped to `left` to where it
    /// belongs: the block allocator when empty, the reclaim list once it
    /// has room.
    fn settle(&self, lists: &mut ClassLists, hdr: HeaderRef, left: usize) {
        if left == 0 {
            if hdr.link_tag() == LinkTag::Reclaim {
                lists.reclaim.remove(LinkTag::Reclaim, hdr);
            }
            let mut global = self.global.lock();
            let mut index = self.index.write();
            global.free(&mut index, hdr, FreeMode::Online);
        } else if left <= self.settings.nearly_full(hdr.capacity())
            && hdr.link_tag() == LinkTag::Detached
        {
            lists.reclaim.push(LinkTag::Reclaim, hdr);
        }
    }

    /// Classifies every block after a full mark. Empty blocks are freed
    /// without maintaining the buckets, which are rebuilt afterwards.
    /// Class lists must have been forgotten before marking.
    pub(crate) fn reclaim_after_mark(&self, live: &[HeaderRef]) -> ReclaimStats {
        let mut sorted = live.to_vec();
        sorted.sort_unstable_by_key(|hdr| hdr.block());
        let mut stats = ReclaimStats::default();
        let mut partial = Vec::new();
        {
            let mut global = self.global.lock();
            let mut index = self.index.write();
            global.reset_buckets();
            for hdr in sorted {
                if hdr.is_unused() || hdr.is_free() {
                    continue;
                }
                let count = hdr.recount_marks();
                if count == 0 {
                    global.free(&mut index, hdr, FreeMode::Recovery);
                    stats.freed_blocks += 1;
                } else if hdr.is_small() && count < hdr.capacity() {
                    if count <= self.settings.nearly_full(hdr.capacity()) {
                        partial.push(hdr);
                    }
                    stats.partial_blocks += 1;
                } else {
                    stats.full_blocks += 1;
                }
            }
            let live = global.headers.rebuild();
            global.rebuild_buckets(&live);
        }
        self.enlist(partial);
        stats
    }

    /// Recounts the marks of every allocated block found at startup and
    /// rebuilds the reclaim lists from them.
    pub(crate) fn rebuild_reclaim_lists(&self, live: &[HeaderRef]) -> ReclaimStats {
        let mut stats = ReclaimStats::default();
        let mut empty = Vec::new();
        let mut partial = Vec::new();
        for &hdr in live {
            if hdr.is_unused() || hdr.is_free() {
                continue;
            }
            let count = hdr.recount_marks();
            if !hdr.is_small() {
                stats.full_blocks += 1;
            } else if count == 0 {
                empty.push(hdr);
            } else if count < hdr.capacity() {
                if count <= self.settings.nearly_full(hdr.capacity()) {
                    partial.push(hdr);
                }
                stats.partial_blocks += 1;
            } else {
                stats.full_blocks += 1;
            }
        }
        if !empty.is_empty() {
            let mut global = self.global.lock();
            let mut index = self.index.write();
            for &hdr in &empty {
                // an earlier merge may have consumed this header
                if !hdr.is_unused() && !hdr.is_free() {
                    global.free(&mut index, hdr, FreeMode::Online);
                }
            }
        }
        stats.freed_blocks = empty.len();
        self.enlist(partial);
        stats
    }

    fn enlist(&self, blocks: Vec<HeaderRef>) {
        for hdr in blocks {
            let mut class = self.classes[hdr.granules()].lock();
            class.lists(hdr.kind()).reclaim.push(LinkTag::Reclaim, hdr);
        }
    }
}

/// Moves every unmarked slot of `hdr` onto `free`, marking it. Returns
/// `false` if `free` filled up first.
fn sweep_block(hdr: HeaderRef, free: &mut FreeList) -> bool {
    let size = hdr.size();
    let step = hdr.granules();
    let mut swept = 0;
    for slot in 0..hdr.capacity() {
        if hdr.is_marked(slot * step) {
            continue;
        }
        if free.is_full() {
            log::trace!("sweep of {:#x} stopped after {swept}", hdr.block());
            return false;
        }
        hdr.try_mark(slot * step);
        hdr.inc_marks();
        free.push(hdr.block() + slot * size);
        swept += 1;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        alloc::{slots_per_block, tests::allocator},
        header::{HeaderFlags, Kind},
        layout::BLOCK_SIZE,
    };
    use std::ptr::NonNull;

    fn header(t: &crate::alloc::tests::TestAllocator, ptr: NonNull<u8>) -> HeaderRef {
        t.alloc.index.read().find_header(ptr.as_ptr() as usize).unwrap()
    }

    #[test]
    fn lazy_sweep_hands_out_unmarked_slots() {
        let t = allocator(4 << 20);
        let slots = slots_per_block(4);
        let objects: Vec<_> = (0..slots)
            .map(|_| t.alloc.allocate(64, Kind::NORMAL, HeaderFlags::empty()).unwrap())
            .collect();
        let hdr = header(&t, objects[0]);
        assert_eq!(hdr.n_marks(), slots);

        // what a collection that found only even slots reachable leaves
        t.alloc.forget_class_lists();
        for (i, obj) in objects.iter().enumerate() {
            if i % 2 == 1 {
                hdr.clear_mark((obj.as_ptr() as usize - hdr.block()) / GRANULE_SIZE);
            }
        }
        let stats = t.alloc.rebuild_reclaim_lists(&[hdr]);
        assert_eq!(stats.partial_blocks, 1);
        assert_eq!(hdr.link_tag(), LinkTag::Reclaim);

        let mut reused = Vec::new();
        for _ in 0..slots / 2 {
            let ptr = t.alloc.allocate(64, Kind::NORMAL, HeaderFlags::empty()).unwrap();
            reused.push(ptr);
        }
        reused.sort();
        let odd: Vec<_> = objects.iter().copied().skip(1).step_by(2).collect();
        assert_eq!(reused, odd);
        assert_eq!(hdr.n_marks(), slots);
        assert_eq!(hdr.link_tag(), LinkTag::Detached);
    }

    #[test]
    fn fast_truncation_settles_each_block_once() {
        let t = allocator(8 << 20);
        let slots = slots_per_block(1);
        let mut cache = FreeList::with_capacity(2 * slots);
        let moved = t.alloc.malloc_many(1, Kind::NORMAL, &mut cache, 2 * slots);
        assert_eq!(moved, 2 * slots);
        let blocks: Vec<_> = cache
            .iter()
            .map(|addr| crate::layout::block_of(addr))
            .collect::<std::collections::BTreeSet<_>>()
            .into_iter()
            .collect();
        assert_eq!(blocks.len(), 2);

        let free_before = t.alloc.global.lock().free_bytes();
        t.alloc.drain_cache(1, Kind::NORMAL, &mut cache, 0);
        assert!(cache.is_empty());

        // half went back to the global list, the rest to their blocks
        let listed: usize = t
            .alloc
            .free_list_lengths()
            .iter()
            .map(|&(_, _, len)| len)
            .sum();
        assert_eq!(listed, slots);
        t.alloc.drain_global_lists();
        assert_eq!(
            t.alloc.global.lock().free_bytes(),
            free_before + 2 * BLOCK_SIZE
        );
    }

    #[test]
    fn block_with_room_rejoins_reclaim_list() {
        let t = allocator(4 << 20);
        let slots = slots_per_block(8);
        let objects: Vec<_> = (0..slots)
            .map(|_| t.alloc.allocate(128, Kind::NORMAL, HeaderFlags::empty()).unwrap())
            .collect();
        let hdr = header(&t, objects[0]);
        assert_eq!(hdr.link_tag(), LinkTag::Detached);

        let nearly_full = t.alloc.settings.nearly_full(slots);
        let to_free = slots - nearly_full;
        let mut class = t.alloc.classes[8].lock();
        let lists = class.lists(Kind::NORMAL);
        let victims: Vec<usize> = objects[..to_free]
            .iter()
            .map(|p| p.as_ptr() as usize)
            .collect();
        t.alloc.truncate_fast_free_list(lists, &victims);
        assert_eq!(hdr.n_marks(), nearly_full);
        assert_eq!(hdr.link_tag(), LinkTag::Reclaim);

        // a second eviction of the same slot is a double free
        t.alloc.truncate_fast_free_list(lists, &victims[..1]);
        assert_eq!(hdr.n_marks(), nearly_full);
    }

    #[test]
    fn tally_counts_per_block() {
        let t = allocator(4 << 20);
        let a = t.alloc.allocate(16, Kind::NORMAL, HeaderFlags::empty()).unwrap();
        let big = t
            .alloc
            .allocate(BLOCK_SIZE, Kind::NORMAL, HeaderFlags::empty())
            .unwrap();
        let (ha, hb) = (header(&t, a), header(&t, big));
        let mut tally = BlockTally::new();
        for _ in 0..3 {
            assert!(tally.add(ha));
        }
        assert!(tally.add(hb));
        let mut counts: Vec<_> = tally.drain().map(|(h, n)| (h.block(), n)).collect();
        counts.sort();
        let mut expected = vec![(ha.block(), 3), (hb.block(), 1)];
        expected.sort();
        assert_eq!(counts, expected);
        assert_eq!(tally.drain().count(), 0);
    }
}
