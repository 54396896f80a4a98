//! Cache-line flushing, the undo log and failure-atomic sections.
//!
//! A [`Section`] groups logged stores. Every logged store first appends an
//! undo record holding the old value, makes it durable, and only then
//! overwrites the target. Touched lines are collected in a small flush
//! table and written back once at commit, after which the log version is
//! bumped. Records carrying the current version therefore always belong
//! to a section that did not commit, and [`replay`] undoes them newest
//! first.

use std::{fmt, ptr::NonNull, sync::Arc};

use crate::{
    config::DurabilityMode,
    layout::LOG_CAPACITY,
    system::{self, CACHE_LINE_SIZE},
};

/// Strategy for making stores durable, chosen at startup.
pub trait DurabilityPolicy: Send + Sync + fmt::Debug {
    /// Writes the cache line holding `addr` back to persistent memory.
    fn flush(&self, addr: usize);
    /// Orders earlier flushes before later stores.
    fn fence(&self);
    /// Whether logged stores write undo records.
    fn logs(&self) -> bool;

    fn flush_range(&self, start: usize, len: usize) {
        if len == 0 {
            return;
        }
        let mut line = system::line_of(start);
        while line < start + len {
            self.flush(line);
            line += CACHE_LINE_SIZE;
        }
    }
}

#[derive(Debug, Default)]
pub struct LogAndFlush;

impl DurabilityPolicy for LogAndFlush {
    fn flush(&self, addr: usize) {
        system::flush_line(addr);
    }

    fn fence(&self) {
        system::store_fence();
    }

    fn logs(&self) -> bool {
        true
    }
}

#[derive(Debug, Default)]
pub struct FlushOnly;

impl DurabilityPolicy for FlushOnly {
    fn flush(&self, addr: usize) {
        system::flush_line(addr);
    }

    fn fence(&self) {
        system::store_fence();
    }

    fn logs(&self) -> bool {
        false
    }
}

#[derive(Debug, Default)]
pub struct Volatile;

impl DurabilityPolicy for Volatile {
    fn flush(&self, _addr: usize) {}

    fn fence(&self) {}

    fn logs(&self) -> bool {
        false
    }
}

pub fn policy_for(mode: DurabilityMode) -> Arc<dyn DurabilityPolicy> {
    match mode {
        DurabilityMode::LogAndFlush => Arc::new(LogAndFlush),
        DurabilityMode::FlushOnly => Arc::new(FlushOnly),
        DurabilityMode::Volatile => Arc::new(Volatile),
    }
}

/// Stores `value` at `addr` outside any section and makes it durable.
///
/// # Safety
/// `addr` must be valid for writes.
pub unsafe fn persist_word(
    policy: &dyn DurabilityPolicy,
    addr: *mut usize,
    value: usize,
) {
    // SAFETY: upheld by caller
    unsafe { addr.write_volatile(value) };
    policy.flush(addr as usize);
    policy.fence();
}

/// # Safety
/// `addr` must be valid for writes.
pub unsafe fn persist_byte(policy: &dyn DurabilityPolicy, addr: *mut u8, value: u8) {
    // SAFETY: upheld by caller
    unsafe { addr.write_volatile(value) };
    policy.flush(addr as usize);
    policy.fence();
}

const TAG_EMPTY: usize = 0;
const TAG_WORD: usize = 1;
const TAG_BYTE: usize = 2;

/// One undo record, padded to a cache line.
#[repr(C, align(64))]
#[derive(Debug, Clone, Copy)]
pub struct LogEntry {
    addr: usize,
    tag: usize,
    old: u64,
    version: u64,
}

impl LogEntry {
    pub const EMPTY: LogEntry = LogEntry {
        addr: 0,
        tag: TAG_EMPTY,
        old: 0,
        version: 0,
    };
}

const FLUSH_TABLE_SIZE: usize = 64;

/// Deduplicating set of cache lines awaiting write-back.
#[derive(Debug)]
pub struct FlushTable {
    lines: [usize; FLUSH_TABLE_SIZE],
    len: usize,
}

impl Default for FlushTable {
    fn default() -> Self {
        Self {
            lines: [0; FLUSH_TABLE_SIZE],
            len: 0,
        }
    }
}

impl FlushTable {
    #[inline]
    fn slot(line: usize) -> usize {
        (line / CACHE_LINE_SIZE) % FLUSH_TABLE_SIZE
    }

    /// Records `addr`'s line. A full table is drained into `policy` first.
    pub fn insert(&mut self, addr: usize, policy: &dyn DurabilityPolicy) {
        let line = system::line_of(addr);
        if line == 0 {
            return;
        }
        if self.len >= FLUSH_TABLE_SIZE * 3 / 4 {
            self.drain(policy);
        }
        let mut idx = Self::slot(line);
        loop {
            match self.lines[idx] {
                0 => {
                    self.lines[idx] = line;
                    self.len += 1;
                    return;
                }
                present if present == line => return,
                _ => idx = (idx + 1) % FLUSH_TABLE_SIZE,
            }
        }
    }

    pub fn drain(&mut self, policy: &dyn DurabilityPolicy) {
        if self.len == 0 {
            return;
        }
        for line in &mut self.lines {
            if *line != 0 {
                policy.flush(*line);
                *line = 0;
            }
        }
        self.len = 0;
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

/// Volatile state of the persistent undo log. Owned by the global
/// allocation lock.
#[derive(Debug)]
pub struct UndoLog {
    entries: NonNull<LogEntry>,
    version: NonNull<u64>,
    cursor: usize,
    open: bool,
    pending: FlushTable,
    policy: Arc<dyn DurabilityPolicy>,
}

// SAFETY: the pointers target the persistent area, which outlives the log,
// and all access goes through `&mut self`.
unsafe impl Send for UndoLog {}

impl UndoLog {
    /// # Safety
    /// `entries` must point to `LOG_CAPACITY` records and `version` to the
    /// persistent log version, both valid for the life of the log.
    pub unsafe fn new(
        entries: NonNull<LogEntry>,
        version: NonNull<u64>,
        policy: Arc<dyn DurabilityPolicy>,
    ) -> Self {
        Self {
            entries,
            version,
            cursor: 0,
            open: false,
            pending: FlushTable::default(),
            policy,
        }
    }

    pub fn policy(&self) -> &dyn DurabilityPolicy {
        &*self.policy
    }

    pub fn version(&self) -> u64 {
        // SAFETY: valid by construction
        unsafe { self.version.as_ptr().read_volatile() }
    }

    /// Opens a failure-atomic section. Sections never nest.
    pub fn begin(&mut self) -> Section<'_> {
        if self.open {
            crate::fatal!("failure-atomic sections cannot nest");
        }
        self.open = true;
        self.cursor = 0;
        Section { log: self }
    }

    fn append(&mut self, addr: usize, tag: usize, old: u64) {
        if !self.policy.logs() {
            return;
        }
        if self.cursor >= LOG_CAPACITY {
            crate::fatal!("undo log overflow ({LOG_CAPACITY} records)");
        }
        let version = self.version();
        // SAFETY: cursor < LOG_CAPACITY
        let entry = unsafe { self.entries.as_ptr().add(self.cursor) };
        // SAFETY: entry is a valid record; the version is written last so a
        // torn record never carries the current version
        unsafe {
            (&raw mut (*entry).addr).write_volatile(addr);
            (&raw mut (*entry).tag).write_volatile(tag);
            (&raw mut (*entry).old).write_volatile(old);
            std::sync::atomic::compiler_fence(
                std::sync::atomic::Ordering::SeqCst,
            );
            (&raw mut (*entry).version).write_volatile(version);
        }
        self.policy.flush(entry as usize);
        self.policy.fence();
        self.cursor += 1;
    }

    fn commit(&mut self) {
        self.pending.drain(&*self.policy);
        self.policy.fence();
        let next = self.version() + 1;
        // SAFETY: valid by construction
        unsafe { self.version.as_ptr().write_volatile(next) };
        self.policy.flush(self.version.as_ptr() as usize);
        self.policy.fence();
        self.cursor = 0;
        self.open = false;
    }
}

/// An open failure-atomic section. Dropping it without [`Section::commit`]
/// behaves like a crash at that point: the stores stay applied in memory
/// and [`replay`] will undo them.
#[must_use]
pub struct Section<'a> {
    log: &'a mut UndoLog,
}

impl Section<'_> {
    /// Logged word store.
    ///
    /// # Safety
    /// `addr` must be a valid, aligned word in persistent memory.
    pub unsafe fn store(&mut self, addr: *mut usize, value: usize) {
        // SAFETY: upheld by caller
        let old = unsafe { addr.read_volatile() };
        if old == value {
            return;
        }
        self.log.append(addr as usize, TAG_WORD, old as u64);
        // SAFETY: upheld by caller
        unsafe { addr.write_volatile(value) };
        self.defer_flush(addr as usize);
    }

    /// Logged byte store.
    ///
    /// # Safety
    /// `addr` must be valid for writes in persistent memory.
    pub unsafe fn store_byte(&mut self, addr: *mut u8, value: u8) {
        // SAFETY: upheld by caller
        let old = unsafe { addr.read_volatile() };
        if old == value {
            return;
        }
        self.log.append(addr as usize, TAG_BYTE, old as u64);
        // SAFETY: upheld by caller
        unsafe { addr.write_volatile(value) };
        self.defer_flush(addr as usize);
    }

    /// Store that recovery can reconstruct without the log.
    ///
    /// # Safety
    /// `addr` must be a valid, aligned word.
    pub unsafe fn store_unlogged(&mut self, addr: *mut usize, value: usize) {
        // SAFETY: upheld by caller
        unsafe { addr.write_volatile(value) };
        self.defer_flush(addr as usize);
    }

    /// Schedules the line holding `addr` for write-back at commit.
    pub fn defer_flush(&mut self, addr: usize) {
        let log = &mut *self.log;
        log.pending.insert(addr, &*log.policy);
    }

    /// Number of undo records written so far.
    pub fn records(&self) -> usize {
        self.log.cursor
    }

    pub fn policy(&self) -> &dyn DurabilityPolicy {
        &*self.log.policy
    }

    /// Flushes every touched line, then advances the log version.
    pub fn commit(self) {
        self.log.commit();
    }
}

/// Undoes the records of an interrupted section, newest first, and then
/// retires them by advancing the version. Returns the number of records
/// applied. Running it again is a no-op.
///
/// # Safety
/// `entries` and `version` must describe the persistent log, and every
/// logged address must still be mapped.
pub unsafe fn replay(
    entries: NonNull<LogEntry>,
    version: NonNull<u64>,
    policy: &dyn DurabilityPolicy,
) -> usize {
    // SAFETY: upheld by caller
    let current = unsafe { version.as_ptr().read_volatile() };
    let mut valid = 0;
    while valid < LOG_CAPACITY {
        // SAFETY: valid < LOG_CAPACITY
        let entry = unsafe { entries.as_ptr().add(valid).read_volatile() };
        if entry.version != current || entry.tag == TAG_EMPTY {
            break;
        }
        valid += 1;
    }

    for idx in (0..valid).rev() {
        // SAFETY: idx < valid
        let entry = unsafe { entries.as_ptr().add(idx).read_volatile() };
        match entry.tag {
            // SAFETY: the record was written for a mapped persistent word
            TAG_WORD => unsafe {
                (entry.addr as *mut usize).write_volatile(entry.old as usize)
            },
            // SAFETY: as above
            TAG_BYTE => unsafe {
                (entry.addr as *mut u8).write_volatile(entry.old as u8)
            },
            other => crate::fatal!("corrupt undo record tag {other}"),
        }
        policy.flush(entry.addr);
    }
    policy.fence();

    if valid > 0 {
        log::info!("undo log: rolled back {valid} records of version {current}");
        // SAFETY: upheld by caller
        unsafe { version.as_ptr().write_volatile(current + 1) };
        policy.flush(version.as_ptr() as usize);
        policy.fence();
    }
    valid
}

#[cfg(test)]
mod tests {
    use super::*;

    struct TestLog {
        entries: Box<[LogEntry]>,
        version: Box<u64>,
    }

    impl TestLog {
        fn new() -> Self {
            Self {
                entries: vec![LogEntry::EMPTY; LOG_CAPACITY].into_boxed_slice(),
                version: Box::new(1),
            }
        }

        fn pointers(&mut self) -> (NonNull<LogEntry>, NonNull<u64>) {
            (
                NonNull::new(self.entries.as_mut_ptr()).unwrap(),
                NonNull::from(&mut *self.version),
            )
        }

        fn undo_log(&mut self) -> UndoLog {
            let (entries, version) = self.pointers();
            // SAFETY: boxes outlive the log within each test
            unsafe { UndoLog::new(entries, version, Arc::new(Volatile)) }
        }
    }

    // Volatile never writes records; tests need a logging policy that
    // does not depend on clflush being available.
    #[derive(Debug)]
    struct LogOnly;

    impl DurabilityPolicy for LogOnly {
        fn flush(&self, _addr: usize) {}
        fn fence(&self) {}
        fn logs(&self) -> bool {
            true
        }
    }

    fn logging(test: &mut TestLog) -> UndoLog {
        let (entries, version) = test.pointers();
        // SAFETY: boxes outlive the log within each test
        unsafe { UndoLog::new(entries, version, Arc::new(LogOnly)) }
    }

    #[test]
    fn committed_section_is_not_replayed() {
        let mut test = TestLog::new();
        let mut words = vec![1usize, 2, 3];
        {
            let mut log = logging(&mut test);
            let mut tx = log.begin();
            // SAFETY: words outlives the section
            unsafe {
                tx.store(&mut words[0], 10);
                tx.store(&mut words[2], 30);
            }
            assert_eq!(tx.records(), 2);
            tx.commit();
            assert_eq!(log.version(), 2);
        }
        let (entries, version) = test.pointers();
        // SAFETY: test pointers
        let replayed = unsafe { replay(entries, version, &LogOnly) };
        assert_eq!(replayed, 0);
        assert_eq!(words, vec![10, 2, 30]);
    }

    #[test]
    fn truncated_section_rolls_back_at_every_boundary() {
        let original = [7usize, 8, 9, 10];
        let updates = [(0, 70), (1, 80), (0, 700), (3, 100)];

        for cut in 0..=updates.len() {
            let mut test = TestLog::new();
            let mut words = original.to_vec();
            let mut flag = 5u8;
            {
                let mut log = logging(&mut test);
                let mut tx = log.begin();
                for &(idx, value) in &updates[..cut] {
                    // SAFETY: words outlives the section
                    unsafe { tx.store(&mut words[idx], value) };
                }
                // SAFETY: flag outlives the section
                unsafe { tx.store_byte(&mut flag, 6) };
                // crash: the section is dropped without commit
            }

            let (entries, version) = test.pointers();
            // SAFETY: test pointers
            unsafe { replay(entries, version, &LogOnly) };
            assert_eq!(words, original.to_vec(), "cut at {cut}");
            assert_eq!(flag, 5);

            let snapshot = words.clone();
            // SAFETY: test pointers
            let again = unsafe { replay(entries, version, &LogOnly) };
            assert_eq!(again, 0);
            assert_eq!(words, snapshot);
        }
    }

    #[test]
    fn stale_records_of_older_sections_are_ignored() {
        let mut test = TestLog::new();
        let mut words = vec![0usize; 4];
        {
            let mut log = logging(&mut test);
            let mut tx = log.begin();
            for (idx, word) in words.iter_mut().enumerate() {
                // SAFETY: words outlives the section
                unsafe { tx.store(word, idx + 1) };
            }
            tx.commit();

            let mut tx = log.begin();
            // SAFETY: as above
            unsafe { tx.store(&mut words[1], 99) };
        }
        let (entries, version) = test.pointers();
        // SAFETY: test pointers
        let replayed = unsafe { replay(entries, version, &LogOnly) };
        assert_eq!(replayed, 1);
        assert_eq!(words, vec![1, 2, 3, 4]);
    }

    #[test]
    fn volatile_policy_writes_no_records() {
        let mut test = TestLog::new();
        let mut word = 1usize;
        let mut log = test.undo_log();
        let mut tx = log.begin();
        // SAFETY: word outlives the section
        unsafe { tx.store(&mut word, 2) };
        assert_eq!(tx.records(), 0);
        tx.commit();
        assert_eq!(word, 2);
    }

    #[test]
    fn flush_table_deduplicates_lines() {
        let mut table = FlushTable::default();
        table.insert(0x1000, &Volatile);
        table.insert(0x1008, &Volatile);
        table.insert(0x1040, &Volatile);
        assert_eq!(table.len(), 2);
        for i in 0..100 {
            table.insert(0x10_0000 + i * CACHE_LINE_SIZE, &Volatile);
        }
        assert!(table.len() <= FLUSH_TABLE_SIZE);
        table.drain(&Volatile);
        assert!(table.is_empty());
    }
}
