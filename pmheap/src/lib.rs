//! Crash-consistent allocator and mark-sweep collector for persistent
//! memory.
//!
//! Metadata lives in a fixed area at the start of the region and every
//! block-level change goes through an undo-logged failure-atomic section.
//! After a crash, [`Heap::start_offline`] undoes the interrupted section
//! and [`HeapInner::collect_offline`] reclaims whatever the crash leaked.

mod alloc;
mod barrier;
mod blocks;
mod config;
mod durability;
pub mod error;
mod freelist;
mod header;
mod heap;
mod index;
mod layout;
mod mark;
mod reclaim;
mod region;
mod system;
mod thread;

pub use config::{DurabilityMode, HeapSettings};
pub use durability::{DurabilityPolicy, FlushOnly, LogAndFlush, Volatile};
pub use error::StartupError;
pub use header::{HeaderFlags as AllocFlags, Kind};
pub use heap::{Heap, HeapInner, HeapStats};
pub use layout::{BLOCK_SIZE, GRANULE_SIZE, MAX_KINDS, MAX_PERSISTENT_ROOTS};
pub use mark::Descriptor;
pub use region::{AnonymousRegion, ExtentSource, FileRegion};
pub use system::OS_PAGE_SIZE;
pub use thread::ThreadContext;
