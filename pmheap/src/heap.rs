//! Heap handle and its startup, recovery and collection entry points.
//!
//! A heap is brought up over a region in one of three ways:
//! [`Heap::start`] formats a fresh metadata area, [`Heap::restart`]
//! reattaches to a cleanly closed one, and [`Heap::start_offline`] accepts
//! any initialized region, undoing an interrupted section first. Only the
//! persistent area, the header records and the heap sections survive a
//! process; the index and every free or reclaim list are rebuilt here.

use std::{
    ops::Deref,
    ptr::NonNull,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    thread,
};

use crate::{
    alloc::Allocator,
    blocks::{BlockAllocator, Growth},
    config::HeapSettings,
    durability::{
        DurabilityPolicy, UndoLog, persist_byte, persist_word, policy_for,
        replay,
    },
    error::StartupError,
    header::{HeaderFlags, HeaderRef, Kind},
    layout::{
        AREA_SIZE, AreaRef, CONSISTENCY_INCONSISTENT, CONSISTENCY_NONE,
        HEAP_MAGIC, KindRecord, MAX_KINDS, MAX_PERSISTENT_ROOTS,
    },
    mark::{Descriptor, MarkConfig, mark_heap},
    reclaim::ReclaimStats,
    region::ExtentSource,
    system::OS_PAGE_SIZE,
    thread::ThreadContext,
};

/// Snapshot of heap occupancy.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HeapStats {
    pub heap_bytes: usize,
    pub sections: usize,
    pub free_bytes: usize,
    pub allocated_blocks: usize,
    pub header_records: usize,
    /// Slots parked on global size-class free lists.
    pub free_list_slots: usize,
    pub kinds: usize,
}

// ── HeapInner ─────────────────────────────────────────────────────────

/// Shared heap state.
pub struct HeapInner {
    area: AreaRef,
    _source: Arc<dyn ExtentSource>,
    alloc: Allocator,
    policy: Arc<dyn DurabilityPolicy>,
    settings: HeapSettings,
    closed: AtomicBool,
    contexts: AtomicUsize,
}

impl std::fmt::Debug for HeapInner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeapInner")
            .field("base", &format_args!("{:#x}", self.area.addr()))
            .field("policy", &self.policy)
            .field("closed", &self.closed)
            .field("contexts", &self.contexts)
            .finish_non_exhaustive()
    }
}

impl HeapInner {
    /// Address of the persistent area; pass it to the restart paths.
    pub fn base(&self) -> usize {
        self.area.addr()
    }

    pub fn settings(&self) -> &HeapSettings {
        &self.settings
    }

    pub(crate) fn allocator(&self) -> &Allocator {
        &self.alloc
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn check_open(&self, op: &str) {
        if self.is_closed() {
            crate::fatal!("{op} on a closed heap");
        }
    }

    pub(crate) fn register_context(&self) {
        self.contexts.fetch_add(1, Ordering::AcqRel);
    }

    pub(crate) fn unregister_context(&self) {
        self.contexts.fetch_sub(1, Ordering::AcqRel);
    }

    /// Allocates `size` bytes of the conservatively scanned, zeroed kind.
    /// `None` means the extent source is exhausted.
    #[inline]
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        self.allocate_with(size, Kind::NORMAL, HeaderFlags::empty())
    }

    #[inline]
    pub fn allocate_kind(&self, size: usize, kind: Kind) -> Option<NonNull<u8>> {
        self.allocate_with(size, kind, HeaderFlags::empty())
    }

    /// `flags` may carry [`HeaderFlags::IGNORE_OFF_PAGE`] for large
    /// objects only ever referenced through their first block.
    pub fn allocate_with(
        &self,
        size: usize,
        kind: Kind,
        flags: HeaderFlags,
    ) -> Option<NonNull<u8>> {
        self.check_open("allocate");
        self.alloc.allocate(size, kind, flags & HeaderFlags::IGNORE_OFF_PAGE)
    }

    pub fn release(&self, ptr: NonNull<u8>) {
        self.check_open("release");
        self.alloc.release(ptr);
    }

    /// Writes `len` bytes at `ptr` back to persistent memory.
    pub fn persist(&self, ptr: *const u8, len: usize) {
        self.policy.flush_range(ptr as usize, len);
        self.policy.fence();
    }

    fn root_slot(&self, id: usize) -> &AtomicUsize {
        self.area.roots().get(id).unwrap_or_else(|| {
            crate::fatal!(
                "persistent root {id} out of range (capacity \
                 {MAX_PERSISTENT_ROOTS})"
            )
        })
    }

    pub fn persistent_root(&self, id: usize) -> *mut u8 {
        self.root_slot(id).load(Ordering::Acquire) as *mut u8
    }

    pub fn set_persistent_root(&self, id: usize, ptr: *mut u8) {
        let slot = self.root_slot(id);
        slot.store(ptr as usize, Ordering::Release);
        self.policy.flush(slot.as_ptr() as usize);
        self.policy.fence();
    }

    /// The root slot itself, for callers that update it in place. Stores
    /// through it must be persisted with [`HeapInner::persist`].
    pub fn persistent_root_address(&self, id: usize) -> &AtomicUsize {
        self.root_slot(id)
    }

    pub fn heap_root(&self) -> *mut u8 {
        // SAFETY: valid area
        unsafe {
            (&raw const (*self.area.header()).heap_root).read_volatile()
                as *mut u8
        }
    }

    pub fn set_heap_root(&self, ptr: *mut u8) {
        // SAFETY: valid area
        unsafe {
            persist_word(
                &*self.policy,
                &raw mut (*self.area.header()).heap_root,
                ptr as usize,
            )
        };
    }

    /// Registers an object kind in the persistent kind table. Aborts once
    /// the table is full.
    pub fn new_kind(&self, descriptor: Descriptor, clear: bool) -> Kind {
        self.check_open("new_kind");
        let mut global = self.alloc.global.lock();
        let kinds = self.area.kinds();
        // SAFETY: valid area; the table only changes under the global lock
        let count = unsafe { (*kinds).count };
        if count >= MAX_KINDS {
            crate::fatal!("object kind table full ({MAX_KINDS} kinds)");
        }
        let mut tx = global.log.begin();
        // SAFETY: count < MAX_KINDS
        unsafe {
            let record = &raw mut (*kinds).kinds[count];
            tx.store(&raw mut (*record).descriptor, descriptor.encode());
            tx.store(&raw mut (*record).clear, clear as usize);
            tx.store(&raw mut (*kinds).count, count + 1);
        }
        tx.commit();
        log::debug!("registered kind {count}: {descriptor:?}, clear {clear}");
        Kind(count as u8)
    }

    pub fn stats(&self) -> HeapStats {
        let free_list_slots = self
            .alloc
            .free_list_lengths()
            .iter()
            .map(|&(_, _, len)| len)
            .sum();
        let global = self.alloc.global.lock();
        let free_blocks = global.free_blocks().count();
        let header_records = global.headers.in_use();
        HeapStats {
            heap_bytes: self.area.heap_size(),
            sections: self.area.sections().len(),
            free_bytes: global.free_bytes(),
            allocated_blocks: header_records.saturating_sub(free_blocks),
            header_records,
            free_list_slots,
            kinds: self.alloc.kind_count(),
        }
    }

    fn persist_consistency(&self, value: u8) {
        // SAFETY: valid area
        unsafe {
            persist_byte(
                &*self.policy,
                &raw mut (*self.area.meta()).consistency,
                value,
            )
        };
    }

    fn persist_mandatory_gc(&self, value: u8) {
        // SAFETY: valid area
        unsafe {
            persist_byte(
                &*self.policy,
                &raw mut (*self.area.meta()).mandatory_gc,
                value,
            )
        };
    }

    /// Writes every header record and the metadata area back.
    fn flush_metadata(&self) {
        for ext in self.area.header_extents() {
            self.policy.flush_range(ext.start, ext.bytes);
        }
        self.policy.flush_range(self.area.addr(), AREA_SIZE);
        self.policy.fence();
    }

    /// Returns cached slots to their blocks, flushes metadata and marks
    /// the region clean. Thread contexts still alive at this point leak
    /// whatever they cache.
    pub fn close(&self) {
        if self.is_closed() {
            return;
        }
        let contexts = self.contexts.load(Ordering::Acquire);
        if contexts > 0 {
            log::warn!("closing heap with {contexts} live thread contexts");
        }
        self.alloc.drain_global_lists();
        self.flush_metadata();
        self.persist_consistency(CONSISTENCY_NONE);
        self.closed.store(true, Ordering::Release);
        log::info!(
            "heap at {:#x} closed, {} bytes in {} sections",
            self.area.addr(),
            self.area.heap_size(),
            self.area.sections().len()
        );
    }

    /// Full synchronous mark-sweep from the persistent roots. Needs
    /// exclusive use of the heap: returns `false` without collecting if a
    /// thread context is registered or the heap is closed.
    ///
    /// Every global free list and reclaim list is discarded first, so
    /// slots parked there are reclaimed unless something reaches them.
    pub fn collect_offline(&self) -> bool {
        if self.is_closed() {
            log::warn!("collect_offline on a closed heap");
            return false;
        }
        let contexts = self.contexts.load(Ordering::Acquire);
        if contexts > 0 {
            log::warn!(
                "collect_offline needs exclusive use, {contexts} thread \
                 contexts registered"
            );
            return false;
        }

        self.persist_mandatory_gc(1);
        self.alloc.forget_class_lists();

        let (live, marks): (Vec<HeaderRef>, _) = {
            let mut global = self.alloc.global.lock();
            global.reset_buckets();
            let live: Vec<HeaderRef> = global
                .headers
                .rebuild()
                .into_iter()
                .filter(|hdr| !hdr.is_free())
                .collect();
            let index = self.alloc.index.read();
            let config = MarkConfig {
                helpers: self.settings.parallel_markers,
                stack_limit: self.settings.initial_mark_stack,
                all_interior_pointers: self.settings.all_interior_pointers,
            };
            let marks = mark_heap(&index, self.area, &live, &config);
            (live, marks)
        };
        let swept = self.alloc.reclaim_after_mark(&live);

        self.flush_metadata();
        self.persist_mandatory_gc(0);
        log::info!(
            "offline collection: {} objects marked, {} blocks freed, {} \
             partial, {} full, {} stack overflows",
            marks.marked,
            swept.freed_blocks,
            swept.partial_blocks,
            swept.full_blocks,
            marks.overflows
        );
        true
    }
}

// ── Heap (Arc wrapper) ────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct Heap(Arc<HeapInner>);

impl Heap {
    /// Formats a fresh heap. The metadata area is the first extent taken
    /// from `source`; its address is [`HeapInner::base`].
    pub fn start(
        source: Arc<dyn ExtentSource>,
        settings: HeapSettings,
    ) -> Result<Heap, StartupError> {
        settings.validate().map_err(StartupError::InvalidSettings)?;
        let policy = policy_for(settings.durability);
        let base = source
            .acquire(OS_PAGE_SIZE, AREA_SIZE)
            .ok_or(StartupError::OutOfSpace)?;
        // SAFETY: freshly acquired extent of AREA_SIZE bytes
        let area = unsafe { AreaRef::from_addr(base.as_ptr() as usize) }
            .ok_or(StartupError::OutOfSpace)?;

        // SAFETY: the extent is ours and nothing references it yet
        unsafe {
            base.as_ptr().write_bytes(0, AREA_SIZE);
            let meta = area.meta();
            (*meta).log_start = area.log_entries().as_ptr() as usize;
            (*meta).log_version = 1;
            (*meta).roots_addr = area.roots().as_ptr() as usize;
            let kinds = area.kinds();
            (*kinds).kinds[Kind::PTRFREE.index()] = KindRecord {
                descriptor: Descriptor::POINTER_FREE.encode(),
                clear: 0,
            };
            (*kinds).kinds[Kind::NORMAL.index()] = KindRecord {
                descriptor: Descriptor::WHOLE_OBJECT.encode(),
                clear: 1,
            };
            (*kinds).count = 2;
        }

        let alloc = Self::build_allocator(area, &source, &policy, &settings);
        {
            let mut global = alloc.global.lock();
            let mut index = alloc.index.write();
            if !global.expand_heap(&mut index, settings.min_heap_increment) {
                return Err(StartupError::OutOfSpace);
            }
        }

        let heap = Self::assemble(area, source, alloc, policy, settings);
        heap.flush_metadata();
        heap.persist_consistency(CONSISTENCY_INCONSISTENT);
        // SAFETY: valid area
        unsafe {
            persist_word(
                &*heap.policy,
                (&raw mut (*area.header()).magic).cast::<usize>(),
                HEAP_MAGIC as usize,
            )
        };
        log::info!(
            "fresh heap at {:#x}, {} bytes",
            area.addr(),
            area.heap_size()
        );
        Ok(heap)
    }

    /// Reattaches to a heap that was closed cleanly.
    ///
    /// # Safety
    /// `base` must be the [`HeapInner::base`] of a heap formatted over
    /// `source`, mapped at the same address, and no other heap may be
    /// attached to it.
    pub unsafe fn restart(
        base: usize,
        source: Arc<dyn ExtentSource>,
        settings: HeapSettings,
    ) -> Result<Heap, StartupError> {
        settings.validate().map_err(StartupError::InvalidSettings)?;
        // SAFETY: upheld by caller
        let area = unsafe { Self::initialized(base) }?;
        if area.consistency() != CONSISTENCY_NONE {
            return Err(StartupError::Inconsistent);
        }
        if area.mandatory_gc() != 0 {
            return Err(StartupError::MandatoryGc);
        }
        let policy = policy_for(settings.durability);
        Ok(Self::attach(area, source, policy, settings))
    }

    /// Attaches to any initialized heap, undoing an interrupted
    /// failure-atomic section first. Follow with
    /// [`HeapInner::collect_offline`] to reclaim what a crash leaked.
    ///
    /// # Safety
    /// Same as [`Heap::restart`].
    pub unsafe fn start_offline(
        base: usize,
        source: Arc<dyn ExtentSource>,
        settings: HeapSettings,
    ) -> Result<Heap, StartupError> {
        settings.validate().map_err(StartupError::InvalidSettings)?;
        // SAFETY: upheld by caller
        let area = unsafe { Self::initialized(base) }?;
        let policy = policy_for(settings.durability);
        if area.consistency() != CONSISTENCY_NONE {
            // SAFETY: the log and every logged address lie in the region
            let undone = unsafe {
                replay(area.log_entries(), area.log_version(), &*policy)
            };
            log::info!(
                "heap at {base:#x} was not closed, undid {undone} logged \
                 stores"
            );
        }
        if area.mandatory_gc() != 0 {
            log::warn!("heap at {base:#x} has an interrupted collection");
        }
        Ok(Self::attach(area, source, policy, settings))
    }

    /// # Safety
    /// `base` must be mapped for at least [`AREA_SIZE`] bytes.
    unsafe fn initialized(base: usize) -> Result<AreaRef, StartupError> {
        // SAFETY: upheld by caller
        let area = unsafe { AreaRef::from_addr(base) }
            .ok_or(StartupError::NotInitialized)?;
        if area.magic() != HEAP_MAGIC {
            return Err(StartupError::NotInitialized);
        }
        Ok(area)
    }

    fn build_allocator(
        area: AreaRef,
        source: &Arc<dyn ExtentSource>,
        policy: &Arc<dyn DurabilityPolicy>,
        settings: &HeapSettings,
    ) -> Allocator {
        // SAFETY: the area outlives the allocator that owns the log
        let log = unsafe {
            UndoLog::new(area.log_entries(), area.log_version(), policy.clone())
        };
        let blocks =
            BlockAllocator::new(area, source.clone(), log, Growth::from(settings));
        Allocator::new(area, blocks, settings.clone())
    }

    fn assemble(
        area: AreaRef,
        source: Arc<dyn ExtentSource>,
        alloc: Allocator,
        policy: Arc<dyn DurabilityPolicy>,
        settings: HeapSettings,
    ) -> Heap {
        Heap(Arc::new(HeapInner {
            area,
            _source: source,
            alloc,
            policy,
            settings,
            closed: AtomicBool::new(false),
            contexts: AtomicUsize::new(0),
        }))
    }

    /// Rebuilds the volatile structures from header storage.
    fn attach(
        area: AreaRef,
        source: Arc<dyn ExtentSource>,
        policy: Arc<dyn DurabilityPolicy>,
        settings: HeapSettings,
    ) -> Heap {
        let alloc = Self::build_allocator(area, &source, &policy, &settings);
        let live = {
            let mut global = alloc.global.lock();
            let mut index = alloc.index.write();
            let live = global.headers.rebuild();
            for &hdr in &live {
                index.install(hdr);
            }
            global.rebuild_buckets(&live);
            global.finish_expand_heap(&mut index);
            live
        };
        // marks of an interrupted collection say nothing about liveness
        let lists = if area.mandatory_gc() != 0 {
            log::info!(
                "leaving {} blocks for the pending collection",
                live.len()
            );
            ReclaimStats::default()
        } else {
            alloc.rebuild_reclaim_lists(&live)
        };

        let heap = Self::assemble(area, source, alloc, policy, settings);
        heap.persist_consistency(CONSISTENCY_INCONSISTENT);
        log::info!(
            "attached heap at {:#x}: {} headers, {} empty blocks freed, {} \
             blocks to reclaim",
            area.addr(),
            live.len(),
            lists.freed_blocks,
            lists.partial_blocks
        );
        heap
    }

    /// Allocation context for the calling thread. Keep one per thread.
    pub fn thread_context(&self) -> ThreadContext {
        ThreadContext::new(self.clone())
    }

    /// Runs `f` on a new thread with its own [`ThreadContext`], which is
    /// drained and unregistered when `f` returns.
    pub fn spawn<F, T>(&self, f: F) -> thread::JoinHandle<T>
    where
        F: FnOnce(&mut ThreadContext) -> T + Send + 'static,
        T: Send + 'static,
    {
        let mut ctx = self.thread_context();
        thread::spawn(move || f(&mut ctx))
    }
}

impl Deref for Heap {
    type Target = HeapInner;
    fn deref(&self) -> &Self::Target {
        &self.0
    }
}
