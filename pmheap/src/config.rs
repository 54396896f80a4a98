//! Heap tuning knobs.
//!
//! Layout invariants (block size, granule size, table capacities) are
//! constants in [`crate::layout`]; everything here may differ between two
//! runs over the same persistent region.

/// How persistent stores are made durable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DurabilityMode {
    /// Undo-log every logged store and flush touched cache lines.
    #[default]
    LogAndFlush,
    /// Flush touched cache lines but never write undo records.
    FlushOnly,
    /// Neither log nor flush. Only useful for volatile testing.
    Volatile,
}

#[derive(Debug, Clone)]
pub struct HeapSettings {
    pub durability: DurabilityMode,
    /// Accept pointers into the middle of objects as references to them,
    /// both when marking and when releasing.
    pub all_interior_pointers: bool,
    /// Give spawned threads private free lists.
    pub thread_local_caches: bool,
    /// Helper threads joining the main thread during marking.
    pub parallel_markers: usize,
    /// Smallest heap extension in blocks.
    pub min_heap_increment: usize,
    /// Largest heap extension in blocks, unless a single request needs more.
    pub max_heap_increment: usize,
    /// Heap grows by at least `heap_size / heap_growth_divisor`.
    pub heap_growth_divisor: usize,
    /// Occupancy (0.0 - 1.0) above which a small-object block is kept off
    /// the reclaim list.
    pub reclaim_threshold: f64,
    /// Initial capacity of the global mark stack in entries.
    pub initial_mark_stack: usize,
}

impl Default for HeapSettings {
    fn default() -> Self {
        Self {
            durability: DurabilityMode::LogAndFlush,
            all_interior_pointers: false,
            thread_local_caches: true,
            parallel_markers: 0,
            min_heap_increment: 64,   // 256 KB
            max_heap_increment: 8192, // 32 MB
            heap_growth_divisor: 4,
            reclaim_threshold: 0.875,
            initial_mark_stack: 4096,
        }
    }
}

impl HeapSettings {
    #[inline]
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.min_heap_increment == 0 {
            return Err("min_heap_increment must be > 0");
        }
        if self.max_heap_increment < self.min_heap_increment {
            return Err("max_heap_increment must be >= min_heap_increment");
        }
        if self.heap_growth_divisor == 0 {
            return Err("heap_growth_divisor must be > 0");
        }
        if !(0.0..=1.0).contains(&self.reclaim_threshold) {
            return Err("reclaim_threshold must be between 0.0 and 1.0");
        }
        if self.initial_mark_stack < 64 {
            return Err("initial_mark_stack must hold at least 64 entries");
        }
        if self.parallel_markers > 64 {
            return Err("parallel_markers must be <= 64");
        }
        Ok(())
    }

    /// Live-slot count above which a block with `capacity` slots counts as
    /// nearly full.
    #[inline]
    pub fn nearly_full(&self, capacity: usize) -> usize {
        let limit = (capacity as f64 * self.reclaim_threshold) as usize;
        limit.min(capacity.saturating_sub(1))
    }
}
