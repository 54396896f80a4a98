//! Block-level allocation: free block buckets, splitting, coalescing and
//! heap growth.
//!
//! Every header change is made inside a failure-atomic section. Bucket
//! membership is volatile and rebuilt from the headers at startup.

use std::sync::Arc;

use crate::{
    config::HeapSettings,
    durability::{DurabilityPolicy, UndoLog, persist_word},
    header::{HeaderFlags, HeaderList, HeaderRef, Kind, LinkTag},
    index::{BlockIndex, HeaderStore},
    layout::{AreaRef, BLOCK_SIZE, Extent, MAX_HEAP_SECTIONS, blocks_for},
    region::ExtentSource,
};

/// Buckets below this hold one exact block count each.
pub const UNIQUE_THRESHOLD: usize = 32;
/// Buckets from here on share one list.
pub const HUGE_THRESHOLD: usize = 256;
/// Block counts per bucket between the two thresholds.
pub const FL_COMPRESSION: usize = 8;
pub const N_BUCKETS: usize = UNIQUE_THRESHOLD
    + (HUGE_THRESHOLD - UNIQUE_THRESHOLD) / FL_COMPRESSION
    + 1;

#[inline]
pub fn bucket_index(blocks: usize) -> usize {
    if blocks <= UNIQUE_THRESHOLD {
        blocks
    } else if blocks >= HUGE_THRESHOLD {
        N_BUCKETS - 1
    } else {
        (blocks - UNIQUE_THRESHOLD) / FL_COMPRESSION + UNIQUE_THRESHOLD
    }
}

/// Whether freeing maintains the buckets, or leaves them to a later
/// rebuild.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum FreeMode {
    Online,
    Recovery,
}

#[derive(Debug, Clone, Copy)]
pub struct Growth {
    pub min_blocks: usize,
    pub max_blocks: usize,
    pub divisor: usize,
}

impl From<&HeapSettings> for Growth {
    fn from(settings: &HeapSettings) -> Self {
        Self {
            min_blocks: settings.min_heap_increment,
            max_blocks: settings.max_heap_increment,
            divisor: settings.heap_growth_divisor,
        }
    }
}

fn unlink(buckets: &mut [HeaderList], hdr: HeaderRef) {
    buckets[bucket_index(hdr.span())].remove(LinkTag::FreeBlocks, hdr);
}

fn link(buckets: &mut [HeaderList], hdr: HeaderRef) {
    buckets[bucket_index(hdr.span())].push(LinkTag::FreeBlocks, hdr);
}

/// State guarded by the global allocation lock.
pub struct BlockAllocator {
    area: AreaRef,
    pub(crate) log: UndoLog,
    pub(crate) headers: HeaderStore,
    buckets: Vec<HeaderList>,
    free_bytes: usize,
    source: Arc<dyn ExtentSource>,
    growth: Growth,
}

impl std::fmt::Debug for BlockAllocator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockAllocator")
            .field("free_bytes", &self.free_bytes)
            .field("headers", &self.headers)
            .field("growth", &self.growth)
            .finish()
    }
}

impl BlockAllocator {
    pub fn new(
        area: AreaRef,
        source: Arc<dyn ExtentSource>,
        log: UndoLog,
        growth: Growth,
    ) -> Self {
        Self {
            area,
            log,
            headers: HeaderStore::new(area, source.clone()),
            buckets: (0..N_BUCKETS).map(|_| HeaderList::new()).collect(),
            free_bytes: 0,
            source,
            growth,
        }
    }

    pub fn area(&self) -> AreaRef {
        self.area
    }

    pub fn policy(&self) -> &dyn DurabilityPolicy {
        self.log.policy()
    }

    pub fn free_bytes(&self) -> usize {
        self.free_bytes
    }

    pub fn free_blocks(&self) -> impl Iterator<Item = HeaderRef> + '_ {
        self.buckets
            .iter()
            .flat_map(|bucket| bucket.iter(LinkTag::FreeBlocks))
    }

    /// Claims a block group for one object of `size` bytes (or a block of
    /// small objects of that size), growing the heap if needed.
    pub fn allocate(
        &mut self,
        index: &mut BlockIndex,
        size: usize,
        kind: Kind,
        flags: HeaderFlags,
    ) -> Option<HeaderRef> {
        debug_assert!(size > 0);
        let blocks = blocks_for(size);
        if let Some(hdr) = self.find_free(blocks) {
            return Some(self.claim(index, hdr, size, kind, flags));
        }
        if !self.expand_heap(index, blocks) {
            return None;
        }
        let hdr = self.find_free(blocks)?;
        Some(self.claim(index, hdr, size, kind, flags))
    }

    fn find_free(&self, blocks: usize) -> Option<HeaderRef> {
        let start = bucket_index(blocks);
        let exact = self.buckets[start]
            .iter(LinkTag::FreeBlocks)
            .find(|hdr| hdr.span() == blocks);
        if exact.is_some() {
            return exact;
        }

        for bucket in &self.buckets[start..] {
            let Some(mut found) = bucket
                .iter(LinkTag::FreeBlocks)
                .find(|hdr| hdr.span() >= blocks)
            else {
                continue;
            };
            // a smaller block right behind that still fits is split instead
            while let Some(next) = found.links(LinkTag::FreeBlocks).next {
                if next.span() >= blocks && next.span() < found.span() {
                    found = next;
                } else {
                    break;
                }
            }
            return Some(found);
        }
        None
    }

    fn claim(
        &mut self,
        index: &mut BlockIndex,
        hdr: HeaderRef,
        size: usize,
        kind: Kind,
        flags: HeaderFlags,
    ) -> HeaderRef {
        let blocks = blocks_for(size);
        let span = hdr.span();
        unlink(&mut self.buckets, hdr);
        self.free_bytes -= span * BLOCK_SIZE;

        let mut tx = self.log.begin();
        let rest = (span > blocks).then(|| {
            let rest = self.headers.allocate(&mut tx);
            rest.set_block(&mut tx, hdr.block() + blocks * BLOCK_SIZE);
            rest.set_size(&mut tx, (span - blocks) * BLOCK_SIZE);
            rest.set_info(&mut tx, Kind::PTRFREE, HeaderFlags::FREE);
            rest
        });
        hdr.set_size(&mut tx, size);
        hdr.set_info(&mut tx, kind, flags - HeaderFlags::FREE);
        tx.commit();

        hdr.clear_marks();
        index.install(hdr);
        if let Some(rest) = rest {
            log::trace!(
                "split {span} blocks at {:#x}, {} left",
                hdr.block(),
                rest.span()
            );
            index.install(rest);
            link(&mut self.buckets, rest);
            self.free_bytes += rest.size();
        }
        hdr
    }

    /// Returns the group of `hdr` to the free blocks, merging it with free
    /// neighbors in the same heap section.
    pub fn free(
        &mut self,
        index: &mut BlockIndex,
        hdr: HeaderRef,
        mode: FreeMode,
    ) {
        if hdr.is_free() || hdr.is_unused() {
            crate::fatal!("freeing a block that is not allocated: {hdr:?}");
        }
        let Some(section) = self.area.section_of(hdr.block()) else {
            crate::fatal!("block {:#x} outside every heap section", hdr.block());
        };
        let online = mode == FreeMode::Online;
        hdr.clear_marks();

        let mut tx = self.log.begin();
        let mut size = hdr.span() * BLOCK_SIZE;
        hdr.set_size(&mut tx, size);
        hdr.set_info(&mut tx, Kind::PTRFREE, HeaderFlags::FREE);

        let after = hdr.block() + size;
        if after < section.end() {
            if let Some(next) = index.header_at(after).filter(|h| h.is_free()) {
                if online {
                    unlink(&mut self.buckets, next);
                    self.free_bytes -= next.size();
                }
                size += next.size();
                hdr.set_size(&mut tx, size);
                self.headers.release(&mut tx, next);
            }
        }

        let mut merged = hdr;
        if hdr.block() > section.start {
            let prev = index
                .find_header(hdr.block() - 1)
                .filter(|h| h.is_free() && h.end() == hdr.block());
            if let Some(prev) = prev {
                if online {
                    unlink(&mut self.buckets, prev);
                    self.free_bytes -= prev.size();
                }
                prev.set_size(&mut tx, prev.size() + size);
                self.headers.release(&mut tx, hdr);
                merged = prev;
            }
        }
        tx.commit();

        index.install(merged);
        if online {
            link(&mut self.buckets, merged);
            self.free_bytes += merged.size();
        }
    }

    /// Grows the heap by at least `blocks`. Returns `false` if the extent
    /// source is exhausted.
    pub fn expand_heap(&mut self, index: &mut BlockIndex, blocks: usize) -> bool {
        let needed = blocks * BLOCK_SIZE;
        let Growth {
            min_blocks,
            max_blocks,
            divisor,
        } = self.growth;
        let mut bytes = needed
            .max(self.area.heap_size() / divisor)
            .max(min_blocks * BLOCK_SIZE);
        if bytes > max_blocks * BLOCK_SIZE {
            bytes = needed.max(max_blocks * BLOCK_SIZE);
        }
        bytes = bytes.div_ceil(BLOCK_SIZE) * BLOCK_SIZE;

        // SAFETY: valid area
        let count = unsafe { (*self.area.meta()).section_count };
        if count >= MAX_HEAP_SECTIONS {
            log::warn!("heap section table full, cannot grow");
            return false;
        }

        let space = match self.source.acquire(BLOCK_SIZE, bytes) {
            Some(space) => space,
            None if bytes > needed => {
                log::debug!(
                    "extent of {bytes} bytes unavailable, retrying with {needed}"
                );
                bytes = needed;
                match self.source.acquire(BLOCK_SIZE, needed) {
                    Some(space) => space,
                    None => {
                        log::warn!("heap exhausted, needed {needed} bytes");
                        return false;
                    }
                }
            }
            None => {
                log::warn!("heap exhausted, needed {needed} bytes");
                return false;
            }
        };
        let start = space.as_ptr() as usize;

        self.set_growth(start, bytes);
        self.add_to_heap(index, Extent { start, bytes });
        self.set_growth(0, 0);
        log::debug!(
            "heap grew by {bytes} bytes at {start:#x}, now {} bytes",
            self.area.heap_size()
        );
        true
    }

    fn set_growth(&self, addr: usize, size: usize) {
        let meta = self.area.meta();
        let policy = self.log.policy();
        // SAFETY: valid area
        unsafe {
            persist_word(policy, &raw mut (*meta).growth_size, size);
            persist_word(policy, &raw mut (*meta).growth_addr, addr);
        }
    }

    fn add_to_heap(&mut self, index: &mut BlockIndex, extent: Extent) {
        let meta = self.area.meta();
        let mut tx = self.log.begin();
        // SAFETY: valid area; callers checked the section table has room
        unsafe {
            let count = (*meta).section_count;
            let slot = &raw mut (*meta).sections[count];
            tx.store(&raw mut (*slot).start, extent.start);
            tx.store(&raw mut (*slot).bytes, extent.bytes);
            tx.store(&raw mut (*meta).section_count, count + 1);
            tx.store(
                &raw mut (*meta).heap_size,
                (*meta).heap_size + extent.bytes,
            );
            let least = (*meta).least_plausible;
            if least == 0 || extent.start < least {
                tx.store(&raw mut (*meta).least_plausible, extent.start);
            }
            if extent.end() > (*meta).greatest_plausible {
                tx.store(&raw mut (*meta).greatest_plausible, extent.end());
            }
        }
        let hdr = self.headers.allocate(&mut tx);
        hdr.set_block(&mut tx, extent.start);
        hdr.set_size(&mut tx, extent.bytes);
        hdr.set_info(&mut tx, Kind::PTRFREE, HeaderFlags::FREE);
        tx.commit();

        index.install(hdr);
        link(&mut self.buckets, hdr);
        self.free_bytes += extent.bytes;
    }

    /// Integrates an extent acquired by a growth that was interrupted
    /// before its section committed.
    pub fn finish_expand_heap(&mut self, index: &mut BlockIndex) {
        // SAFETY: valid area
        let (addr, size) = unsafe {
            let meta = self.area.meta();
            ((*meta).growth_addr, (*meta).growth_size)
        };
        if addr == 0 {
            return;
        }
        let done = self.area.sections().iter().any(|s| s.start == addr);
        // SAFETY: valid area
        let count = unsafe { (*self.area.meta()).section_count };
        if !done && size > 0 && count < MAX_HEAP_SECTIONS {
            log::info!("finishing interrupted heap growth at {addr:#x}");
            self.add_to_heap(index, Extent { start: addr, bytes: size });
        }
        self.set_growth(0, 0);
    }

    /// Forgets bucket membership of every free block.
    pub fn reset_buckets(&mut self) {
        for bucket in &mut self.buckets {
            while bucket.pop(LinkTag::FreeBlocks).is_some() {}
        }
        self.free_bytes = 0;
    }

    /// Refills the buckets from the free headers among `live`.
    pub fn rebuild_buckets(&mut self, live: &[HeaderRef]) {
        self.reset_buckets();
        for &hdr in live {
            if hdr.is_free() && !hdr.is_unused() {
                if hdr.link_tag() != LinkTag::Detached {
                    crate::fatal!("free header already linked: {hdr:?}");
                }
                link(&mut self.buckets, hdr);
                self.free_bytes += hdr.size();
            }
        }
    }
}
