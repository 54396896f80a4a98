//! Fixed layout of the persistent metadata area.
//!
//! The area is acquired once by a fresh start and never moves. Everything
//! a restart needs to find is reachable from its base address at the
//! offsets of [`PersistentArea`].

use std::{mem, ptr::NonNull, sync::atomic::AtomicUsize};

use crate::{durability::LogEntry, mark::Descriptor};

pub const LOG_BLOCK_SIZE: usize = 12;
/// Heap block size; objects are carved out of one or more blocks.
pub const BLOCK_SIZE: usize = 1 << LOG_BLOCK_SIZE;
pub const GRANULE_SIZE: usize = 16;
pub const GRANULES_PER_BLOCK: usize = BLOCK_SIZE / GRANULE_SIZE;
pub const WORD_SIZE: usize = mem::size_of::<usize>();
/// Largest object served from per-size-class free lists.
pub const MAX_SMALL_BYTES: usize = BLOCK_SIZE / 2;
pub const MAX_SMALL_GRANULES: usize = MAX_SMALL_BYTES / GRANULE_SIZE;
pub const MARK_WORDS: usize = GRANULES_PER_BLOCK / 64;

pub const MAX_KINDS: usize = 16;
pub const MAX_HEAP_SECTIONS: usize = 512;
pub const MAX_HEADER_EXTENTS: usize = 256;
pub const MAX_PERSISTENT_ROOTS: usize = 1024;
pub const LOG_CAPACITY: usize = 1024;
/// Bytes of header storage requested from the extent source at a time.
pub const HEADER_EXTENT_SIZE: usize = 64 * 1024;

pub const HEAP_MAGIC: u64 = 0x504d_4845_4150_0001;

pub const CONSISTENCY_NONE: u8 = 0;
pub const CONSISTENCY_INCONSISTENT: u8 = 1;

const _: () = assert!(usize::BITS == 64, "pmheap needs 64 bit addresses");
const _: () = assert!(GRANULES_PER_BLOCK % 64 == 0);

/// Start and length of a contiguous range of persistent memory.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Extent {
    pub start: usize,
    pub bytes: usize,
}

impl Extent {
    #[inline]
    pub fn end(&self) -> usize {
        self.start + self.bytes
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end()
    }
}

/// First words of the area: the magic marker, the scratch cursor of header
/// storage and the user heap root.
#[repr(C)]
#[derive(Debug)]
pub struct RegionHeader {
    pub magic: u64,
    pub scratch_cursor: usize,
    pub heap_root: usize,
}

#[repr(C)]
#[derive(Debug)]
pub struct BaseMetadata {
    pub consistency: u8,
    pub mandatory_gc: u8,
    _pad: [u8; 6],
    pub heap_size: usize,
    /// Extent acquired for a heap extension that may not be integrated yet.
    pub growth_addr: usize,
    pub growth_size: usize,
    pub least_plausible: usize,
    pub greatest_plausible: usize,
    pub log_start: usize,
    pub log_version: u64,
    pub roots_addr: usize,
    pub section_count: usize,
    pub sections: [Extent; MAX_HEAP_SECTIONS],
    pub header_extent_count: usize,
    pub header_extents: [Extent; MAX_HEADER_EXTENTS],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct KindRecord {
    pub descriptor: usize,
    pub clear: usize,
}

impl KindRecord {
    pub fn descriptor(&self) -> Descriptor {
        Descriptor::decode(self.descriptor)
    }
}

#[repr(C)]
#[derive(Debug)]
pub struct KindTable {
    pub count: usize,
    pub kinds: [KindRecord; MAX_KINDS],
}

#[repr(C, align(4096))]
pub struct PersistentArea {
    pub header: RegionHeader,
    pub meta: BaseMetadata,
    pub kinds: KindTable,
    pub roots: [AtomicUsize; MAX_PERSISTENT_ROOTS],
    pub log: [LogEntry; LOG_CAPACITY],
}

pub const AREA_SIZE: usize = mem::size_of::<PersistentArea>();

/// Handle to the persistent area. Fields are reached through raw pointers
/// only; no reference to the area itself is ever formed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AreaRef(NonNull<PersistentArea>);

// SAFETY: the area is mapped for the life of the heap and every mutable
// field is guarded by the allocator locks or written atomically.
unsafe impl Send for AreaRef {}
// SAFETY: see above
unsafe impl Sync for AreaRef {}

impl AreaRef {
    /// # Safety
    /// `addr` must be the base of a mapped region of at least
    /// [`AREA_SIZE`] bytes that stays mapped while the handle is used.
    pub unsafe fn from_addr(addr: usize) -> Option<AreaRef> {
        if addr % mem::align_of::<PersistentArea>() != 0 {
            return None;
        }
        NonNull::new(addr as *mut PersistentArea).map(AreaRef)
    }

    #[inline]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    #[inline]
    pub fn header(self) -> *mut RegionHeader {
        // SAFETY: valid by construction
        unsafe { &raw mut (*self.0.as_ptr()).header }
    }

    #[inline]
    pub fn meta(self) -> *mut BaseMetadata {
        // SAFETY: valid by construction
        unsafe { &raw mut (*self.0.as_ptr()).meta }
    }

    #[inline]
    pub fn kinds(self) -> *mut KindTable {
        // SAFETY: valid by construction
        unsafe { &raw mut (*self.0.as_ptr()).kinds }
    }

    #[inline]
    pub fn roots(&self) -> &[AtomicUsize; MAX_PERSISTENT_ROOTS] {
        // SAFETY: roots are only ever accessed atomically
        unsafe { &(*self.0.as_ptr()).roots }
    }

    #[inline]
    pub fn log_entries(self) -> NonNull<LogEntry> {
        // SAFETY: valid by construction
        let ptr = unsafe { &raw mut (*self.0.as_ptr()).log };
        // SAFETY: derived from a non-null base
        unsafe { NonNull::new_unchecked(ptr.cast()) }
    }

    #[inline]
    pub fn log_version(self) -> NonNull<u64> {
        // SAFETY: valid by construction
        let ptr = unsafe { &raw mut (*self.meta()).log_version };
        // SAFETY: derived from a non-null base
        unsafe { NonNull::new_unchecked(ptr) }
    }

    #[inline]
    pub fn magic(self) -> u64 {
        // SAFETY: valid by construction
        unsafe { (&raw const (*self.header()).magic).read_volatile() }
    }

    #[inline]
    pub fn consistency(self) -> u8 {
        // SAFETY: valid by construction
        unsafe { (&raw const (*self.meta()).consistency).read_volatile() }
    }

    #[inline]
    pub fn mandatory_gc(self) -> u8 {
        // SAFETY: valid by construction
        unsafe { (&raw const (*self.meta()).mandatory_gc).read_volatile() }
    }

    #[inline]
    pub fn heap_size(self) -> usize {
        // SAFETY: valid by construction
        unsafe { (*self.meta()).heap_size }
    }

    /// Plausible heap address bounds, `least..greatest`.
    #[inline]
    pub fn plausible(self) -> (usize, usize) {
        // SAFETY: valid by construction
        unsafe {
            let meta = self.meta();
            ((*meta).least_plausible, (*meta).greatest_plausible)
        }
    }

    /// Copies out the heap sections recorded so far.
    pub fn sections(self) -> Vec<Extent> {
        // SAFETY: valid by construction
        unsafe {
            let meta = self.meta();
            let count = (*meta).section_count.min(MAX_HEAP_SECTIONS);
            (&(*meta).sections)[..count].to_vec()
        }
    }

    /// Copies out the header storage extents recorded so far.
    pub fn header_extents(self) -> Vec<Extent> {
        // SAFETY: valid by construction
        unsafe {
            let meta = self.meta();
            let count = (*meta).header_extent_count.min(MAX_HEADER_EXTENTS);
            (&(*meta).header_extents)[..count].to_vec()
        }
    }

    /// Heap section holding `addr`.
    pub fn section_of(self, addr: usize) -> Option<Extent> {
        // SAFETY: valid by construction
        unsafe {
            let meta = self.meta();
            let count = (*meta).section_count.min(MAX_HEAP_SECTIONS);
            (&(*meta).sections)[..count]
                .iter()
                .copied()
                .find(|s| s.contains(addr))
        }
    }
}

#[inline(always)]
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

#[inline(always)]
pub const fn block_of(addr: usize) -> usize {
    addr & !(BLOCK_SIZE - 1)
}

#[inline(always)]
pub const fn bytes_to_granules(bytes: usize) -> usize {
    if bytes == 0 {
        1
    } else {
        (bytes + GRANULE_SIZE - 1) / GRANULE_SIZE
    }
}

#[inline(always)]
pub const fn blocks_for(bytes: usize) -> usize {
    if bytes == 0 {
        1
    } else {
        (bytes + BLOCK_SIZE - 1) / BLOCK_SIZE
    }
}
