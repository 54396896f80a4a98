//! Block-address to header lookup, and the persistent header storage it
//! is rebuilt from.
//!
//! The index is never made durable. Every startup scans header storage and
//! reinstalls each live record, so a crash can at worst leave the index
//! out of date in a process that no longer exists.

use std::{collections::HashMap, sync::Arc};

use crate::{
    durability::Section,
    header::{HEADER_SIZE, HeaderFlags, HeaderRef, Kind},
    layout::{
        AreaRef, BLOCK_SIZE, Extent, HEADER_EXTENT_SIZE, LOG_BLOCK_SIZE,
        MAX_HEADER_EXTENTS, block_of,
    },
    region::ExtentSource,
    system::CACHE_LINE_SIZE,
};

const LOG_BOTTOM: usize = 10;
const BOTTOM_SLOTS: usize = 1 << LOG_BOTTOM;

/// Largest forwarding distance stored in one slot. Header addresses are
/// always above it.
pub const MAX_JUMP: usize = BLOCK_SIZE - 1;

/// Two-level map from block address to header.
///
/// Bottom nodes live in an arena and are named by their position; the top
/// level maps the high address bits to that position. Slots hold zero for
/// unmapped blocks, a forwarding distance for interior blocks of a
/// multi-block group, or the header address for the first block.
#[derive(Debug, Default)]
pub struct BlockIndex {
    top: HashMap<usize, u32, ahash::RandomState>,
    nodes: Vec<Box<[usize]>>,
}

impl BlockIndex {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    fn split(block: usize) -> (usize, usize) {
        let page = block >> LOG_BLOCK_SIZE;
        (page >> LOG_BOTTOM, page & (BOTTOM_SLOTS - 1))
    }

    #[inline]
    fn entry(&self, block: usize) -> usize {
        let (key, slot) = Self::split(block);
        match self.top.get(&key) {
            Some(&node) => self.nodes[node as usize][slot],
            None => 0,
        }
    }

    fn set_entry(&mut self, block: usize, value: usize) {
        let (key, slot) = Self::split(block);
        let node = match self.top.get(&key) {
            Some(&node) => node as usize,
            None if value == 0 => return,
            None => {
                let node = self.nodes.len();
                self.nodes.push(vec![0; BOTTOM_SLOTS].into_boxed_slice());
                self.top.insert(key, node as u32);
                node
            }
        };
        self.nodes[node][slot] = value;
    }

    /// Header of the block group containing `addr`, if any.
    pub fn find_header(&self, addr: usize) -> Option<HeaderRef> {
        let mut block = block_of(addr);
        loop {
            match self.entry(block) {
                0 => return None,
                jump @ 1..=MAX_JUMP => {
                    block = block.checked_sub(jump * BLOCK_SIZE)?;
                }
                raw => {
                    // SAFETY: only header addresses exceed MAX_JUMP
                    let hdr = unsafe { HeaderRef::from_addr(raw) };
                    return (addr >= hdr.block() && addr < hdr.end())
                        .then_some(hdr);
                }
            }
        }
    }

    /// Header whose group starts exactly at `block`.
    pub fn header_at(&self, block: usize) -> Option<HeaderRef> {
        match self.entry(block) {
            raw if raw > MAX_JUMP => {
                // SAFETY: only header addresses exceed MAX_JUMP
                let hdr = unsafe { HeaderRef::from_addr(raw) };
                (hdr.block() == block).then_some(hdr)
            }
            _ => None,
        }
    }

    /// Points every block `hdr` spans at it.
    pub fn install(&mut self, hdr: HeaderRef) {
        let base = hdr.block();
        if base % BLOCK_SIZE != 0 || hdr.is_unused() {
            crate::fatal!("installing malformed header {hdr:?}");
        }
        self.set_entry(base, hdr.addr());
        for i in 1..hdr.span() {
            self.set_entry(base + i * BLOCK_SIZE, i.min(MAX_JUMP));
        }
    }

    pub fn remove(&mut self, block: usize, span: usize) {
        for i in 0..span {
            self.set_entry(block + i * BLOCK_SIZE, 0);
        }
    }

    pub fn clear(&mut self) {
        self.top.clear();
        self.nodes.clear();
    }

    /// Bottom nodes allocated so far.
    pub fn nodes(&self) -> usize {
        self.nodes.len()
    }
}

const CACHE_ENTRIES: usize = 64;

/// Direct-mapped cache in front of [`BlockIndex`]. An entry only hits when
/// the cached header still covers the queried address.
#[derive(Debug, Clone)]
pub struct HeaderCache {
    entries: [(usize, Option<HeaderRef>); CACHE_ENTRIES],
}

impl Default for HeaderCache {
    fn default() -> Self {
        Self {
            entries: [(0, None); CACHE_ENTRIES],
        }
    }
}

impl HeaderCache {
    pub fn lookup(
        &mut self,
        index: &BlockIndex,
        addr: usize,
    ) -> Option<HeaderRef> {
        let block = block_of(addr);
        let slot = (block >> LOG_BLOCK_SIZE) % CACHE_ENTRIES;
        if let (cached, Some(hdr)) = self.entries[slot] {
            if cached == block
                && !hdr.is_unused()
                && hdr.block() <= addr
                && addr < hdr.end()
            {
                return Some(hdr);
            }
        }
        let hdr = index.find_header(addr)?;
        self.entries[slot] = (block, Some(hdr));
        Some(hdr)
    }

    pub fn invalidate(&mut self) {
        self.entries = [(0, None); CACHE_ENTRIES];
    }
}

/// Persistent storage for header records.
///
/// Records are bump-allocated out of extents listed in the base metadata;
/// the bump cursor is the scratch cursor of the region header. Records
/// with size zero are unused and collected on a volatile free list.
pub struct HeaderStore {
    area: AreaRef,
    source: Arc<dyn ExtentSource>,
    free: Vec<HeaderRef>,
    in_use: usize,
}

impl std::fmt::Debug for HeaderStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeaderStore")
            .field("free", &self.free.len())
            .field("in_use", &self.in_use)
            .finish()
    }
}

impl HeaderStore {
    pub fn new(area: AreaRef, source: Arc<dyn ExtentSource>) -> Self {
        Self {
            area,
            source,
            free: Vec::new(),
            in_use: 0,
        }
    }

    pub fn in_use(&self) -> usize {
        self.in_use
    }

    fn cursor_ptr(&self) -> *mut usize {
        // SAFETY: valid area
        unsafe { &raw mut (*self.area.header()).scratch_cursor }
    }

    fn current_extent(&self) -> Option<Extent> {
        // SAFETY: valid area
        unsafe {
            let meta = self.area.meta();
            let count = (*meta).header_extent_count;
            count.checked_sub(1).map(|last| (*meta).header_extents[last])
        }
    }

    /// Hands out an unused header record. Every field the caller sets must
    /// go through `tx`; marks and links start cleared.
    pub fn allocate(&mut self, tx: &mut Section<'_>) -> HeaderRef {
        while let Some(hdr) = self.free.pop() {
            if hdr.is_unused() {
                hdr.clear_marks();
                hdr.detach();
                self.in_use += 1;
                return hdr;
            }
        }

        // SAFETY: valid area
        let mut cursor = unsafe { self.cursor_ptr().read_volatile() };
        let fits = self
            .current_extent()
            .is_some_and(|ext| cursor >= ext.start && cursor + HEADER_SIZE <= ext.end());
        if !fits {
            cursor = self.grow(tx);
        }
        // SAFETY: valid area
        unsafe { tx.store(self.cursor_ptr(), cursor + HEADER_SIZE) };
        // SAFETY: cursor lies inside a header extent
        let hdr = unsafe { HeaderRef::from_addr(cursor) };
        hdr.clear_marks();
        hdr.detach();
        self.in_use += 1;
        hdr
    }

    fn grow(&mut self, tx: &mut Section<'_>) -> usize {
        let meta = self.area.meta();
        // SAFETY: valid area
        let count = unsafe { (*meta).header_extent_count };
        if count >= MAX_HEADER_EXTENTS {
            crate::fatal!("header storage exhausted ({count} extents)");
        }
        let Some(space) =
            self.source.acquire(CACHE_LINE_SIZE, HEADER_EXTENT_SIZE)
        else {
            crate::fatal!("cannot acquire header storage");
        };
        let start = space.as_ptr() as usize;
        // SAFETY: valid area; count < MAX_HEADER_EXTENTS
        unsafe {
            let slot = &raw mut (*meta).header_extents[count];
            tx.store(&raw mut (*slot).start, start);
            tx.store(&raw mut (*slot).bytes, HEADER_EXTENT_SIZE);
            tx.store(&raw mut (*meta).header_extent_count, count + 1);
        }
        log::debug!("header storage extent {count} at {start:#x}");
        start
    }

    /// Returns `hdr` to the free list. Its block and size are cleared
    /// through `tx`, so a crash restores them.
    pub fn release(&mut self, tx: &mut Section<'_>, hdr: HeaderRef) {
        hdr.set_block(tx, 0);
        hdr.set_size(tx, 0);
        hdr.set_info(tx, Kind::PTRFREE, HeaderFlags::empty());
        hdr.clear_marks();
        hdr.detach();
        self.free.push(hdr);
        self.in_use -= 1;
    }

    /// Scans header storage up to the scratch cursor. Unused records go to
    /// the free list; live ones are returned detached.
    pub fn rebuild(&mut self) -> Vec<HeaderRef> {
        self.free.clear();
        let extents = self.area.header_extents();
        // SAFETY: valid area
        let cursor = unsafe { self.cursor_ptr().read_volatile() };
        let mut live = Vec::new();
        for (idx, ext) in extents.iter().enumerate() {
            let end = if idx + 1 == extents.len() {
                cursor.clamp(ext.start, ext.end())
            } else {
                ext.end()
            };
            let mut at = ext.start;
            while at + HEADER_SIZE <= end {
                // SAFETY: inside a recorded header extent
                let hdr = unsafe { HeaderRef::from_addr(at) };
                if hdr.is_unused() {
                    self.free.push(hdr);
                } else {
                    if hdr.block() % BLOCK_SIZE != 0 || hdr.block() == 0 {
                        crate::fatal!("corrupt header record {hdr:?}");
                    }
                    hdr.detach();
                    live.push(hdr);
                }
                at += HEADER_SIZE;
            }
        }
        self.in_use = live.len();
        log::debug!(
            "header storage: {} live, {} free records",
            live.len(),
            self.free.len()
        );
        live
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::DurabilityMode,
        durability::{UndoLog, policy_for},
        header::tests::{HeaderArena, volatile_log},
        layout::AREA_SIZE,
        region::AnonymousRegion,
    };

    fn sized(hdr: HeaderRef, block: usize, size: usize, log: &mut UndoLog) {
        let mut tx = log.begin();
        hdr.set_block(&mut tx, block);
        hdr.set_size(&mut tx, size);
        tx.commit();
    }

    #[test]
    fn interior_blocks_forward_to_header() {
        let mut arena = HeaderArena::new(2);
        let (mut entries, mut version) = (Vec::new(), 1);
        let mut log = volatile_log(&mut entries, &mut version);

        let base = 0x7000_0000;
        let span = MAX_JUMP + 10;
        let big = arena.get(0);
        sized(big, base, span * BLOCK_SIZE, &mut log);
        let small = arena.get(1);
        sized(small, base + span * BLOCK_SIZE, 64, &mut log);

        let mut index = BlockIndex::new();
        index.install(big);
        index.install(small);

        assert_eq!(index.find_header(base), Some(big));
        assert_eq!(index.find_header(base + 17), Some(big));
        assert_eq!(index.find_header(base + 5 * BLOCK_SIZE + 8), Some(big));
        let last = base + (span - 1) * BLOCK_SIZE + BLOCK_SIZE - 1;
        assert_eq!(index.find_header(last), Some(big));
        assert_eq!(index.find_header(last + 1), Some(small));
        assert_eq!(index.find_header(base - 1), None);
        assert_eq!(index.header_at(base), Some(big));
        assert_eq!(index.header_at(base + BLOCK_SIZE), None);

        index.remove(base, span);
        assert_eq!(index.find_header(base + 5 * BLOCK_SIZE), None);
        assert_eq!(index.find_header(last + 1), Some(small));
    }

    #[test]
    fn cache_never_returns_stale_header() {
        let mut arena = HeaderArena::new(2);
        let (mut entries, mut version) = (Vec::new(), 1);
        let mut log = volatile_log(&mut entries, &mut version);

        let base = 0x9000_0000;
        let first = arena.get(0);
        sized(first, base, 2 * BLOCK_SIZE, &mut log);
        let mut index = BlockIndex::new();
        index.install(first);

        let mut cache = HeaderCache::default();
        let inner = base + BLOCK_SIZE + 8;
        assert_eq!(cache.lookup(&index, inner), Some(first));

        // split: the second block gets its own header
        let second = arena.get(1);
        sized(first, base, BLOCK_SIZE, &mut log);
        sized(second, base + BLOCK_SIZE, BLOCK_SIZE, &mut log);
        index.install(first);
        index.install(second);
        assert_eq!(cache.lookup(&index, inner), Some(second));
        assert_eq!(cache.lookup(&index, base), Some(first));
    }

    #[test]
    fn header_store_reuses_and_rebuilds() {
        let region = Arc::new(AnonymousRegion::new(4 << 20).unwrap());
        let area_ptr = region.acquire(4096, AREA_SIZE).unwrap();
        // SAFETY: freshly mapped, zeroed area
        let area = unsafe { AreaRef::from_addr(area_ptr.as_ptr() as usize) }
            .unwrap();
        // SAFETY: area outlives the log
        let mut log = unsafe {
            UndoLog::new(
                area.log_entries(),
                area.log_version(),
                policy_for(DurabilityMode::Volatile),
            )
        };
        let mut store = HeaderStore::new(area, region.clone());

        let mut tx = log.begin();
        let hdrs: Vec<_> = (0..3)
            .map(|i| {
                let hdr = store.allocate(&mut tx);
                hdr.set_block(&mut tx, 0x1000_0000 + i * BLOCK_SIZE);
                hdr.set_size(&mut tx, BLOCK_SIZE);
                hdr
            })
            .collect();
        tx.commit();
        assert_eq!(hdrs[1].addr(), hdrs[0].addr() + HEADER_SIZE);
        assert_eq!(store.in_use(), 3);

        let mut tx = log.begin();
        store.release(&mut tx, hdrs[1]);
        let again = store.allocate(&mut tx);
        assert_eq!(again, hdrs[1]);
        store.release(&mut tx, again);
        tx.commit();

        let mut fresh = HeaderStore::new(area, region.clone());
        let live = fresh.rebuild();
        assert_eq!(live, vec![hdrs[0], hdrs[2]]);
        assert_eq!(fresh.in_use(), 2);
        let mut tx = log.begin();
        assert_eq!(fresh.allocate(&mut tx), hdrs[1]);
        tx.commit();
    }
}
