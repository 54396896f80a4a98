//! Conservative marking.
//!
//! Marking runs a small state machine around a shared mark stack. Roots are
//! pushed as word ranges; every candidate pointer found while scanning is
//! checked against the plausible heap bounds and the block index before its
//! mark bit is set. When the bounded shared stack overflows, entries are
//! dropped and the heap is rescanned from every marked object until a pass
//! completes without overflow.

use std::{
    collections::VecDeque,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
    thread,
};

use parking_lot::Mutex;

use crate::{
    barrier::Quiescence,
    header::{HeaderFlags, HeaderRef},
    index::{BlockIndex, HeaderCache},
    layout::{
        AreaRef, BLOCK_SIZE, GRANULE_SIZE, KindRecord, MAX_KINDS,
        MAX_PERSISTENT_ROOTS, WORD_SIZE,
    },
};

const TAG_BITS: usize = 2;
const TAG_MASK: usize = (1 << TAG_BITS) - 1;
const TAG_LENGTH: usize = 0;
const TAG_BITMAP: usize = 1;
const TAG_PER_OBJECT: usize = 2;
const TAG_PROCEDURE: usize = 3;

/// Largest range scanned in one step; the rest is pushed back.
const MARK_CHUNK: usize = 4096;
const LOCAL_LIMIT: usize = 512;
const STEAL_BATCH: usize = 32;

/// How the pointer-bearing words of an object are found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Descriptor {
    /// The first `n` bytes are scanned conservatively.
    Length(usize),
    /// Bit `i` set means word `i` may hold a pointer. At most 62 words.
    Bitmap(u64),
    /// The object holds its own encoded descriptor at this byte offset.
    PerObject { offset: usize },
    /// Marking procedures are not supported; reaching one is fatal.
    Procedure(usize),
}

impl Descriptor {
    /// Scan every word of the object.
    pub const WHOLE_OBJECT: Descriptor = Descriptor::Length(usize::MAX >> TAG_BITS);
    /// Never scan.
    pub const POINTER_FREE: Descriptor = Descriptor::Length(0);

    pub fn encode(self) -> usize {
        match self {
            Self::Length(n) => (n << TAG_BITS) | TAG_LENGTH,
            Self::Bitmap(bits) => {
                debug_assert!(bits >> 62 == 0, "bitmap exceeds 62 words");
                ((bits as usize) << TAG_BITS) | TAG_BITMAP
            }
            Self::PerObject { offset } => (offset << TAG_BITS) | TAG_PER_OBJECT,
            Self::Procedure(id) => (id << TAG_BITS) | TAG_PROCEDURE,
        }
    }

    pub fn decode(raw: usize) -> Descriptor {
        let value = raw >> TAG_BITS;
        match raw & TAG_MASK {
            TAG_LENGTH => Self::Length(value),
            TAG_BITMAP => Self::Bitmap(value as u64),
            TAG_PER_OBJECT => Self::PerObject { offset: value },
            _ => Self::Procedure(value),
        }
    }
}

/// A range still to be scanned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkEntry {
    pub start: usize,
    pub descr: Descriptor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkState {
    None,
    PushRescuers,
    PushRoots,
    RootsPushed,
    /// Mark bits are meaningless and must be cleared.
    Invalid,
    /// Some marked objects may have unmarked children.
    PartiallyInvalid,
}

#[derive(Debug, Clone, Copy)]
pub struct MarkConfig {
    pub helpers: usize,
    pub stack_limit: usize,
    pub all_interior_pointers: bool,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MarkStats {
    pub marked: usize,
    pub overflows: usize,
    pub final_stack_limit: usize,
}

/// Read-only view of the heap shared by all marker threads.
pub struct MarkContext<'a> {
    index: &'a BlockIndex,
    kinds: [KindRecord; MAX_KINDS],
    least: usize,
    greatest: usize,
    interior: bool,
    marked: AtomicUsize,
}

impl<'a> MarkContext<'a> {
    pub fn new(index: &'a BlockIndex, area: AreaRef, interior: bool) -> Self {
        let (least, greatest) = area.plausible();
        // SAFETY: valid area; kinds only change under the global lock,
        // which the collector holds
        let kinds = unsafe { (*area.kinds()).kinds };
        Self {
            index,
            kinds,
            least,
            greatest,
            interior,
            marked: AtomicUsize::new(0),
        }
    }

    /// Start of the object `addr` points into, if it is one.
    fn object_base(&self, hdr: HeaderRef, addr: usize) -> Option<usize> {
        let offset = addr - hdr.block();
        let base = if hdr.is_small() {
            let size = hdr.size();
            let slot = offset / size;
            if slot >= hdr.capacity() {
                return None;
            }
            hdr.block() + slot * size
        } else {
            if hdr.flags().contains(HeaderFlags::IGNORE_OFF_PAGE)
                && offset >= BLOCK_SIZE
            {
                return None;
            }
            hdr.block()
        };
        (self.interior || base == addr).then_some(base)
    }

    /// The descriptor of the object at `base`, with length descriptors
    /// clamped to the object.
    fn object_entry(&self, hdr: HeaderRef, base: usize) -> Option<MarkEntry> {
        let size = hdr.size();
        let record = self.kinds[hdr.kind().index() % MAX_KINDS];
        let mut descr = record.descriptor();
        if let Descriptor::PerObject { offset } = descr {
            if offset + WORD_SIZE > size {
                crate::fatal!("per-object descriptor offset {offset} outside object");
            }
            // SAFETY: inside a live object
            let raw = unsafe { ((base + offset) as *const usize).read_volatile() };
            descr = Descriptor::decode(raw);
        }
        match descr {
            Descriptor::Length(0) | Descriptor::Bitmap(0) => None,
            Descriptor::Length(n) => Some(MarkEntry {
                start: base,
                descr: Descriptor::Length(n.min(size)),
            }),
            Descriptor::Bitmap(bits) => {
                let words = size / WORD_SIZE;
                let mask = if words >= 64 { u64::MAX } else { (1u64 << words) - 1 };
                Some(MarkEntry {
                    start: base,
                    descr: Descriptor::Bitmap(bits & mask),
                })
            }
            Descriptor::PerObject { .. } => {
                crate::fatal!("nested per-object descriptor at {base:#x}")
            }
            Descriptor::Procedure(id) => {
                crate::fatal!("mark procedure {id} is not supported")
            }
        }
    }

    /// Marks the object `addr` refers to. Pushes its contents the first time
    /// it is marked.
    pub fn mark_and_push(
        &self,
        cache: &mut HeaderCache,
        addr: usize,
        out: &mut Vec<MarkEntry>,
    ) {
        if addr < self.least || addr >= self.greatest {
            return;
        }
        let Some(hdr) = cache.lookup(self.index, addr) else {
            return;
        };
        if hdr.is_free() {
            return;
        }
        let Some(base) = self.object_base(hdr, addr) else {
            return;
        };
        let granule = (base - hdr.block()) / GRANULE_SIZE;
        if granule >= crate::layout::GRANULES_PER_BLOCK {
            return;
        }
        if hdr.try_mark(granule) {
            hdr.inc_marks();
            self.marked.fetch_add(1, Ordering::Relaxed);
            if let Some(entry) = self.object_entry(hdr, base) {
                out.push(entry);
            }
        }
    }

    /// Scans one entry, pushing what it references onto `out`.
    pub fn scan(
        &self,
        cache: &mut HeaderCache,
        entry: MarkEntry,
        out: &mut Vec<MarkEntry>,
    ) {
        match entry.descr {
            Descriptor::Length(len) => {
                let mut len = len;
                if len > MARK_CHUNK {
                    out.push(MarkEntry {
                        start: entry.start + MARK_CHUNK,
                        descr: Descriptor::Length(len - MARK_CHUNK),
                    });
                    len = MARK_CHUNK;
                }
                let end = entry.start + len;
                let mut at = entry.start;
                while at + WORD_SIZE <= end {
                    // SAFETY: entries only cover live objects and roots
                    let word = unsafe { (at as *const usize).read_volatile() };
                    self.mark_and_push(cache, word, out);
                    at += WORD_SIZE;
                }
            }
            Descriptor::Bitmap(mut bits) => {
                let mut at = entry.start;
                while bits != 0 {
                    if bits & 1 != 0 {
                        // SAFETY: bitmap was clamped to the object
                        let word =
                            unsafe { (at as *const usize).read_volatile() };
                        self.mark_and_push(cache, word, out);
                    }
                    bits >>= 1;
                    at += WORD_SIZE;
                }
            }
            other => crate::fatal!("unexpected mark stack entry {other:?}"),
        }
    }

    pub fn marked(&self) -> usize {
        self.marked.load(Ordering::Relaxed)
    }
}

/// Bounded stack shared between marker threads. Workers steal from the
/// front and spill to the back.
struct SharedStack {
    entries: Mutex<VecDeque<MarkEntry>>,
    limit: usize,
    overflow: AtomicBool,
    quiescence: Quiescence,
}

impl SharedStack {
    fn new(limit: usize, workers: usize) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(limit.min(1 << 16))),
            limit,
            overflow: AtomicBool::new(false),
            quiescence: Quiescence::new(workers),
        }
    }

    fn spill(&self, batch: impl Iterator<Item = MarkEntry>) {
        {
            let mut entries = self.entries.lock();
            for entry in batch {
                if entries.len() >= self.limit {
                    self.overflow.store(true, Ordering::Relaxed);
                    break;
                }
                entries.push_back(entry);
            }
        }
        self.quiescence.notify();
    }

    fn steal(&self, out: &mut Vec<MarkEntry>) -> bool {
        let mut entries = self.entries.lock();
        let n = entries.len().min(STEAL_BATCH);
        out.extend(entries.drain(..n));
        n > 0
    }

    fn has_work(&self) -> bool {
        !self.entries.lock().is_empty()
    }
}

fn drain_worker(ctx: &MarkContext<'_>, shared: &SharedStack, seeds: Vec<MarkEntry>) {
    let mut local = seeds;
    let mut cache = HeaderCache::default();
    loop {
        while let Some(entry) = local.pop() {
            ctx.scan(&mut cache, entry, &mut local);
            if local.len() > LOCAL_LIMIT {
                let half = local.len() / 2;
                shared.spill(local.drain(..half));
            }
        }
        if shared.steal(&mut local) {
            continue;
        }
        if !shared.quiescence.idle(|| shared.has_work()) {
            break;
        }
    }
}

/// Scans `seeds` and everything reachable from them. Returns `true` if
/// the shared stack overflowed.
fn drain(
    ctx: &MarkContext<'_>,
    seeds: Vec<MarkEntry>,
    config: &MarkConfig,
    limit: usize,
) -> bool {
    let shared = SharedStack::new(limit, config.helpers + 1);
    if config.helpers == 0 {
        drain_worker(ctx, &shared, seeds);
    } else {
        thread::scope(|s| {
            for _ in 0..config.helpers {
                s.spawn(|| drain_worker(ctx, &shared, Vec::new()));
            }
            drain_worker(ctx, &shared, seeds);
        });
    }
    shared.overflow.load(Ordering::Relaxed)
}

/// Word ranges of the persistent roots: maximal runs of non-zero slots,
/// plus the heap root word.
pub fn root_ranges(area: AreaRef) -> Vec<MarkEntry> {
    let roots = area.roots();
    let mut ranges = Vec::new();
    let mut run_start = None;
    for idx in 0..=MAX_PERSISTENT_ROOTS {
        let live = idx < MAX_PERSISTENT_ROOTS
            && roots[idx].load(Ordering::Acquire) != 0;
        match (live, run_start) {
            (true, None) => run_start = Some(idx),
            (false, Some(first)) => {
                ranges.push(MarkEntry {
                    start: roots[first].as_ptr() as usize,
                    descr: Descriptor::Length((idx - first) * WORD_SIZE),
                });
                run_start = None;
            }
            _ => {}
        }
    }
    // SAFETY: valid area
    let heap_root = unsafe { &raw const (*area.header()).heap_root };
    // SAFETY: as above
    if unsafe { heap_root.read_volatile() } != 0 {
        ranges.push(MarkEntry {
            start: heap_root as usize,
            descr: Descriptor::Length(WORD_SIZE),
        });
    }
    ranges
}

/// Entries for the contents of every marked object, used to recover from
/// a mark stack overflow.
fn rescuers(ctx: &MarkContext<'_>, live: &[HeaderRef]) -> Vec<MarkEntry> {
    let mut out = Vec::new();
    for &hdr in live {
        if hdr.is_free() || hdr.is_unused() {
            continue;
        }
        let step = hdr.granules().max(1);
        for slot in 0..hdr.capacity() {
            if hdr.is_marked(slot * step) {
                let base = hdr.block() + slot * hdr.size().min(BLOCK_SIZE);
                if let Some(entry) = ctx.object_entry(hdr, base) {
                    out.push(entry);
                }
            }
        }
    }
    out
}

/// Runs a full mark phase over the headers in `live`, which must be every
/// allocated block of the heap.
pub fn mark_heap(
    index: &BlockIndex,
    area: AreaRef,
    live: &[HeaderRef],
    config: &MarkConfig,
) -> MarkStats {
    let ctx = MarkContext::new(index, area, config.all_interior_pointers);
    let mut limit = config.stack_limit.max(STEAL_BATCH);
    let mut overflows = 0;
    let mut state = MarkState::Invalid;

    loop {
        log::trace!("mark state {state:?}");
        state = match state {
            MarkState::None => break,
            MarkState::Invalid => {
                for &hdr in live {
                    if !hdr.is_unused() {
                        hdr.clear_marks();
                    }
                }
                MarkState::PushRoots
            }
            MarkState::PushRoots => {
                if drain(&ctx, root_ranges(area), config, limit) {
                    MarkState::PartiallyInvalid
                } else {
                    MarkState::RootsPushed
                }
            }
            MarkState::PartiallyInvalid => {
                overflows += 1;
                limit *= 2;
                log::debug!("mark stack overflow, limit now {limit}");
                MarkState::PushRescuers
            }
            MarkState::PushRescuers => {
                let mut seeds = root_ranges(area);
                seeds.extend(rescuers(&ctx, live));
                if drain(&ctx, seeds, config, limit) {
                    MarkState::PartiallyInvalid
                } else {
                    MarkState::RootsPushed
                }
            }
            MarkState::RootsPushed => MarkState::None,
        };
    }

    MarkStats {
        marked: ctx.marked(),
        overflows,
        final_stack_limit: limit,
    }
}
