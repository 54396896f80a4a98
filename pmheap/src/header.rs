//! Out-of-line block headers.
//!
//! Headers live in persistent header storage, one record per block group.
//! Size, back pointer and info word are only changed through logged stores
//! so a crash can be rolled back. Marks and list links are either
//! recomputed at startup or owned by the collector, and are written without
//! logging.

use std::{
    fmt,
    ptr::NonNull,
    sync::atomic::{AtomicU64, AtomicUsize, Ordering},
};

use bitflags::bitflags;

use crate::{
    durability::Section,
    layout::{BLOCK_SIZE, GRANULE_SIZE, MARK_WORDS, blocks_for},
};

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq)]
    pub struct HeaderFlags: u8 {
        /// The block group is on a block free list.
        const FREE = 1 << 0;
        /// Only pointers into the first block keep this object alive.
        const IGNORE_OFF_PAGE = 1 << 1;
    }
}

/// Object kind index into the persistent kind table.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct Kind(pub u8);

impl Kind {
    /// Never scanned, never cleared.
    pub const PTRFREE: Kind = Kind(0);
    /// Scanned conservatively, cleared on allocation.
    pub const NORMAL: Kind = Kind(1);

    #[inline]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

const KIND_MASK: usize = 0xff;
const FLAGS_SHIFT: usize = 8;

/// What the link words of a header currently mean.
#[repr(usize)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum LinkTag {
    Detached = 0,
    FreeBlocks = 1,
    Reclaim = 2,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct Links {
    pub prev: Option<HeaderRef>,
    pub next: Option<HeaderRef>,
}

#[repr(C)]
pub struct BlockHeader {
    /// First byte of the block group; zero for an unused record.
    block: usize,
    /// Object size in bytes, or the whole group for free blocks. Zero marks
    /// an unused record.
    size: usize,
    /// Kind in the low byte, flags in the next.
    info: usize,
    /// Approximate number of set mark bits.
    n_marks: AtomicUsize,
    link_tag: usize,
    next: usize,
    prev: usize,
    marks: [AtomicU64; MARK_WORDS],
}

pub const HEADER_SIZE: usize = std::mem::size_of::<BlockHeader>();

/// Copyable handle to a header record in persistent memory.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct HeaderRef(NonNull<BlockHeader>);

// SAFETY: header records live in the persistent area for the whole life of
// the heap; mutation is serialized by the allocator locks.
unsafe impl Send for HeaderRef {}
// SAFETY: see above
unsafe impl Sync for HeaderRef {}

impl fmt::Debug for HeaderRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeaderRef")
            .field("at", &self.0)
            .field("block", &format_args!("{:#x}", self.block()))
            .field("size", &self.size())
            .field("flags", &self.flags())
            .finish()
    }
}

impl HeaderRef {
    /// # Safety
    /// `addr` must point at a header record inside header storage.
    #[inline]
    pub unsafe fn from_addr(addr: usize) -> HeaderRef {
        // SAFETY: upheld by caller
        HeaderRef(unsafe { NonNull::new_unchecked(addr as *mut BlockHeader) })
    }

    #[inline]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    #[inline]
    fn raw(self) -> *mut BlockHeader {
        self.0.as_ptr()
    }

    #[inline]
    fn get(&self) -> &BlockHeader {
        // SAFETY: valid by construction
        unsafe { self.0.as_ref() }
    }

    #[inline]
    pub fn block(self) -> usize {
        // SAFETY: valid by construction
        unsafe { (&raw const (*self.raw()).block).read_volatile() }
    }

    #[inline]
    pub fn size(self) -> usize {
        // SAFETY: valid by construction
        unsafe { (&raw const (*self.raw()).size).read_volatile() }
    }

    #[inline]
    fn info(self) -> usize {
        // SAFETY: valid by construction
        unsafe { (&raw const (*self.raw()).info).read_volatile() }
    }

    #[inline]
    pub fn kind(self) -> Kind {
        Kind((self.info() & KIND_MASK) as u8)
    }

    #[inline]
    pub fn flags(self) -> HeaderFlags {
        HeaderFlags::from_bits_truncate((self.info() >> FLAGS_SHIFT) as u8)
    }

    #[inline]
    pub fn is_free(self) -> bool {
        self.flags().contains(HeaderFlags::FREE)
    }

    /// A record with size zero is unused and may be recycled.
    #[inline]
    pub fn is_unused(self) -> bool {
        self.size() == 0
    }

    /// Number of blocks the group spans.
    #[inline]
    pub fn span(self) -> usize {
        blocks_for(self.size())
    }

    #[inline]
    pub fn end(self) -> usize {
        self.block() + self.span() * BLOCK_SIZE
    }

    /// Whether objects of this block are carved from a single block.
    #[inline]
    pub fn is_small(self) -> bool {
        self.size() <= BLOCK_SIZE / 2
    }

    #[inline]
    pub fn granules(self) -> usize {
        self.size() / GRANULE_SIZE
    }

    /// Object slots in a small-object block, one for large objects.
    #[inline]
    pub fn capacity(self) -> usize {
        if self.is_small() {
            BLOCK_SIZE / self.size()
        } else {
            1
        }
    }

    // ── logged field updates ──────────────────────────────────────────

    pub fn set_block(self, tx: &mut Section<'_>, block: usize) {
        // SAFETY: valid persistent word
        unsafe { tx.store(&raw mut (*self.raw()).block, block) };
    }

    pub fn set_size(self, tx: &mut Section<'_>, size: usize) {
        // SAFETY: valid persistent word
        unsafe { tx.store(&raw mut (*self.raw()).size, size) };
    }

    pub fn set_info(self, tx: &mut Section<'_>, kind: Kind, flags: HeaderFlags) {
        let info = kind.index() | ((flags.bits() as usize) << FLAGS_SHIFT);
        // SAFETY: valid persistent word
        unsafe { tx.store(&raw mut (*self.raw()).info, info) };
    }

    pub fn set_flags(self, tx: &mut Section<'_>, flags: HeaderFlags) {
        self.set_info(tx, self.kind(), flags);
    }

    // ── mark bits ─────────────────────────────────────────────────────

    #[inline]
    pub fn n_marks(self) -> usize {
        self.get().n_marks.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_n_marks(self, count: usize) {
        self.get().n_marks.store(count, Ordering::Relaxed);
    }

    #[inline]
    pub fn inc_marks(self) {
        self.get().n_marks.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn dec_marks(self) -> usize {
        let prev = self.get().n_marks.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(prev > 0, "live-mark count underflow");
        prev - 1
    }

    #[inline]
    pub fn sub_marks(self, count: usize) -> usize {
        let prev = self.get().n_marks.fetch_sub(count, Ordering::Relaxed);
        debug_assert!(prev >= count, "live-mark count underflow");
        prev - count
    }

    #[inline]
    pub fn is_marked(self, granule: usize) -> bool {
        let word = self.get().marks[granule / 64].load(Ordering::Relaxed);
        word & (1 << (granule % 64)) != 0
    }

    /// Sets the mark bit of `granule`. Returns `true` if it was clear
    /// before; concurrent callers see exactly one winner.
    #[inline]
    pub fn try_mark(self, granule: usize) -> bool {
        let bit = 1u64 << (granule % 64);
        let prev =
            self.get().marks[granule / 64].fetch_or(bit, Ordering::AcqRel);
        prev & bit == 0
    }

    /// Clears the mark bit of `granule`. Returns `true` if it was set.
    #[inline]
    pub fn clear_mark(self, granule: usize) -> bool {
        let bit = 1u64 << (granule % 64);
        let prev =
            self.get().marks[granule / 64].fetch_and(!bit, Ordering::AcqRel);
        prev & bit != 0
    }

    pub fn clear_marks(self) {
        for word in &self.get().marks {
            word.store(0, Ordering::Relaxed);
        }
        self.set_n_marks(0);
    }

    /// Counts set mark bits at object starts and stores the count.
    pub fn recount_marks(self) -> usize {
        let count = if self.is_small() {
            let step = self.granules().max(1);
            (0..self.capacity())
                .filter(|slot| self.is_marked(slot * step))
                .count()
        } else {
            self.is_marked(0) as usize
        };
        self.set_n_marks(count);
        count
    }

    /// Address and length of the mark words, for write-back.
    pub fn marks_range(self) -> (usize, usize) {
        let start = self.get().marks.as_ptr() as usize;
        (start, std::mem::size_of::<[AtomicU64; MARK_WORDS]>())
    }

    // ── list links ────────────────────────────────────────────────────

    #[inline]
    pub fn link_tag(self) -> LinkTag {
        // SAFETY: valid by construction
        let raw = unsafe { (&raw const (*self.raw()).link_tag).read() };
        match raw {
            1 => LinkTag::FreeBlocks,
            2 => LinkTag::Reclaim,
            _ => LinkTag::Detached,
        }
    }

    /// Links of a list this header is on. Fails hard on a tag mismatch.
    #[inline]
    pub fn links(self, expected: LinkTag) -> Links {
        let tag = self.link_tag();
        if tag != expected {
            crate::fatal!(
                "header {:#x} is on {tag:?}, expected {expected:?}",
                self.addr()
            );
        }
        // SAFETY: valid by construction
        let (next, prev) = unsafe {
            ((*self.raw()).next, (*self.raw()).prev)
        };
        Links {
            // SAFETY: links only ever hold header addresses or zero
            prev: (prev != 0).then(|| unsafe { HeaderRef::from_addr(prev) }),
            // SAFETY: see above
            next: (next != 0).then(|| unsafe { HeaderRef::from_addr(next) }),
        }
    }

    #[inline]
    pub fn set_links(self, tag: LinkTag, links: Links) {
        // SAFETY: valid by construction; links are volatile state
        unsafe {
            (*self.raw()).link_tag = tag as usize;
            (*self.raw()).prev = links.prev.map_or(0, HeaderRef::addr);
            (*self.raw()).next = links.next.map_or(0, HeaderRef::addr);
        }
    }

    #[inline]
    pub fn set_next(self, tag: LinkTag, next: Option<HeaderRef>) {
        let mut links = self.links(tag);
        links.next = next;
        self.set_links(tag, links);
    }

    #[inline]
    pub fn set_prev(self, tag: LinkTag, prev: Option<HeaderRef>) {
        let mut links = self.links(tag);
        links.prev = prev;
        self.set_links(tag, links);
    }

    #[inline]
    pub fn detach(self) {
        self.set_links(
            LinkTag::Detached,
            Links {
                prev: None,
                next: None,
            },
        );
    }
}

/// Intrusive doubly linked list threaded through header links.
#[derive(Debug, Default)]
pub struct HeaderList {
    head: Option<HeaderRef>,
    len: usize,
}

impl HeaderList {
    pub const fn new() -> Self {
        Self { head: None, len: 0 }
    }

    pub fn head(&self) -> Option<HeaderRef> {
        self.head
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    pub fn push(&mut self, tag: LinkTag, hdr: HeaderRef) {
        debug_assert_eq!(hdr.link_tag(), LinkTag::Detached);
        hdr.set_links(
            tag,
            Links {
                prev: None,
                next: self.head,
            },
        );
        if let Some(old) = self.head {
            old.set_prev(tag, Some(hdr));
        }
        self.head = Some(hdr);
        self.len += 1;
    }

    pub fn remove(&mut self, tag: LinkTag, hdr: HeaderRef) {
        let Links { prev, next } = hdr.links(tag);
        match prev {
            Some(prev) => prev.set_next(tag, next),
            None => {
                debug_assert_eq!(self.head, Some(hdr));
                self.head = next;
            }
        }
        if let Some(next) = next {
            next.set_prev(tag, prev);
        }
        hdr.detach();
        self.len -= 1;
    }

    pub fn pop(&mut self, tag: LinkTag) -> Option<HeaderRef> {
        let head = self.head?;
        self.remove(tag, head);
        Some(head)
    }

    pub fn iter(&self, tag: LinkTag) -> impl Iterator<Item = HeaderRef> {
        let mut cursor = self.head;
        std::iter::from_fn(move || {
            let current = cursor?;
            cursor = current.links(tag).next;
            Some(current)
        })
    }

    /// Forgets every member without touching their links.
    pub fn reset(&mut self) {
        self.head = None;
        self.len = 0;
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::{
        config::DurabilityMode,
        durability::{LogEntry, UndoLog, policy_for},
        layout::LOG_CAPACITY,
    };

    /// Zeroed header records backed by a Vec.
    pub(crate) struct HeaderArena {
        records: Vec<[u64; HEADER_SIZE / 8]>,
    }

    impl HeaderArena {
        pub(crate) fn new(count: usize) -> Self {
            Self {
                records: vec![[0; HEADER_SIZE / 8]; count],
            }
        }

        pub(crate) fn get(&mut self, idx: usize) -> HeaderRef {
            // SAFETY: records are header sized and zeroed
            unsafe { HeaderRef::from_addr(self.records[idx].as_mut_ptr() as usize) }
        }
    }

    pub(crate) fn volatile_log(
        entries: &mut Vec<LogEntry>,
        version: &mut u64,
    ) -> UndoLog {
        entries.resize(LOG_CAPACITY, LogEntry::EMPTY);
        // SAFETY: test storage outlives the log
        unsafe {
            UndoLog::new(
                NonNull::new(entries.as_mut_ptr()).unwrap(),
                NonNull::from(version),
                policy_for(DurabilityMode::Volatile),
            )
        }
    }

    #[test]
    fn header_is_word_aligned() {
        assert_eq!(HEADER_SIZE % 8, 0);
        assert_eq!(HEADER_SIZE, 7 * 8 + MARK_WORDS * 8);
    }

    #[test]
    fn info_word_round_trips_kind_and_flags() {
        let mut arena = HeaderArena::new(1);
        let hdr = arena.get(0);
        let (mut entries, mut version) = (Vec::new(), 1);
        let mut log = volatile_log(&mut entries, &mut version);
        let mut tx = log.begin();
        hdr.set_block(&mut tx, 0x4000);
        hdr.set_size(&mut tx, 64);
        hdr.set_info(&mut tx, Kind(3), HeaderFlags::IGNORE_OFF_PAGE);
        tx.commit();

        assert_eq!(hdr.kind(), Kind(3));
        assert_eq!(hdr.flags(), HeaderFlags::IGNORE_OFF_PAGE);
        assert!(!hdr.is_free());
        assert!(hdr.is_small());
        assert_eq!(hdr.capacity(), BLOCK_SIZE / 64);
        assert_eq!(hdr.end(), 0x4000 + BLOCK_SIZE);
    }

    #[test]
    fn marks_count_once() {
        let mut arena = HeaderArena::new(1);
        let hdr = arena.get(0);
        let (mut entries, mut version) = (Vec::new(), 1);
        let mut log = volatile_log(&mut entries, &mut version);
        let mut tx = log.begin();
        hdr.set_size(&mut tx, 32);
        tx.commit();

        assert!(hdr.try_mark(0));
        assert!(!hdr.try_mark(0));
        assert!(hdr.try_mark(2));
        assert!(hdr.try_mark(3)); // not an object start for 32 byte slots
        assert_eq!(hdr.recount_marks(), 2);
        assert!(hdr.clear_mark(2));
        assert!(!hdr.clear_mark(2));
        hdr.clear_marks();
        assert_eq!(hdr.n_marks(), 0);
        assert!(!hdr.is_marked(0));
    }

    #[test]
    fn intrusive_list_push_remove() {
        let mut arena = HeaderArena::new(3);
        let (a, b, c) = (arena.get(0), arena.get(1), arena.get(2));
        let mut list = HeaderList::new();
        list.push(LinkTag::Reclaim, a);
        list.push(LinkTag::Reclaim, b);
        list.push(LinkTag::Reclaim, c);
        assert_eq!(list.len(), 3);
        assert_eq!(list.iter(LinkTag::Reclaim).collect::<Vec<_>>(), vec![c, b, a]);

        list.remove(LinkTag::Reclaim, b);
        assert_eq!(b.link_tag(), LinkTag::Detached);
        assert_eq!(list.iter(LinkTag::Reclaim).collect::<Vec<_>>(), vec![c, a]);

        assert_eq!(list.pop(LinkTag::Reclaim), Some(c));
        assert_eq!(list.pop(LinkTag::Reclaim), Some(a));
        assert!(list.is_empty());
    }
}
