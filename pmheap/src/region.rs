//! Sources of persistent address space.
//!
//! The heap never maps memory itself. Every extent it uses, including the
//! metadata area, comes from an [`ExtentSource`], which must hand out
//! addresses that stay valid when the region is reopened.

use std::{
    fs::{File, OpenOptions},
    io::{self, Read},
    os::fd::AsRawFd,
    path::Path,
    ptr::NonNull,
};

use parking_lot::Mutex;

use crate::{
    layout::align_up,
    system::{self, OS_PAGE_SIZE},
};

pub trait ExtentSource: Send + Sync {
    /// Returns `size` bytes aligned to `align`, or `None` when the region
    /// is exhausted. Memory is zeroed the first time it is handed out.
    fn acquire(&self, align: usize, size: usize) -> Option<NonNull<u8>>;
}

fn bump(
    base: usize,
    len: usize,
    cursor: usize,
    align: usize,
    size: usize,
) -> Option<(usize, usize)> {
    let start = align_up(base + cursor, align.max(1));
    let end = start.checked_add(size)?;
    if end > base + len {
        return None;
    }
    Some((start, end - base))
}

/// Anonymous mapping handed out with a bump cursor.
///
/// Bytes survive dropping a heap that was started over it, which is how
/// tests simulate a crash and a restart within one process.
#[derive(Debug)]
pub struct AnonymousRegion {
    base: NonNull<u8>,
    len: usize,
    cursor: Mutex<usize>,
}

// SAFETY: the mapping is owned by the region and the cursor is locked
unsafe impl Send for AnonymousRegion {}
// SAFETY: see above
unsafe impl Sync for AnonymousRegion {}

impl AnonymousRegion {
    pub fn new(len: usize) -> Option<Self> {
        let len = align_up(len, OS_PAGE_SIZE);
        let base = system::map_memory(len)?;
        Some(Self {
            base,
            len,
            cursor: Mutex::new(0),
        })
    }

    /// Address the first extent is handed out at.
    pub fn base(&self) -> usize {
        self.base.as_ptr() as usize
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn used(&self) -> usize {
        *self.cursor.lock()
    }
}

impl ExtentSource for AnonymousRegion {
    fn acquire(&self, align: usize, size: usize) -> Option<NonNull<u8>> {
        let mut cursor = self.cursor.lock();
        let (start, next) = bump(self.base(), self.len, *cursor, align, size)?;
        *cursor = next;
        NonNull::new(start as *mut u8)
    }
}

impl Drop for AnonymousRegion {
    fn drop(&mut self) {
        system::unmap_memory(self.base, self.len);
    }
}

const FILE_MAGIC: u64 = 0x504d_5245_4749_4f4e;

/// First page of a region file.
#[repr(C)]
struct FileHeader {
    magic: u64,
    map_addr: u64,
    len: u64,
    cursor: u64,
}

/// A file mapped shared at a fixed virtual address.
///
/// The first page holds the mapping address and the bump cursor, so
/// reopening the file reproduces every extent at its old address.
#[derive(Debug)]
pub struct FileRegion {
    _file: File,
    base: NonNull<u8>,
    len: usize,
    lock: Mutex<()>,
}

// SAFETY: the mapping is owned by the region and the cursor is locked
unsafe impl Send for FileRegion {}
// SAFETY: see above
unsafe impl Sync for FileRegion {}

fn invalid(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

impl FileRegion {
    /// Creates (or truncates) `path` to `len` bytes and maps it at
    /// `map_addr`.
    pub fn create(
        path: impl AsRef<Path>,
        len: usize,
        map_addr: usize,
    ) -> io::Result<Self> {
        let len = align_up(len, OS_PAGE_SIZE);
        if map_addr % OS_PAGE_SIZE != 0 || len <= OS_PAGE_SIZE {
            return Err(invalid("region address or size is unusable"));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(len as u64)?;
        let region = Self::map(file, map_addr, len)?;
        // SAFETY: the header page was just mapped
        unsafe {
            region.header().write(FileHeader {
                magic: FILE_MAGIC,
                map_addr: map_addr as u64,
                len: len as u64,
                cursor: OS_PAGE_SIZE as u64,
            });
        }
        region.sync()?;
        log::info!(
            "created region of {len} bytes at {map_addr:#x}",
        );
        Ok(region)
    }

    /// Maps an existing region file at the address it was created with.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut raw = [0u8; 32];
        file.read_exact(&mut raw)?;
        let word = |idx: usize| {
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&raw[idx * 8..idx * 8 + 8]);
            u64::from_ne_bytes(bytes)
        };
        if word(0) != FILE_MAGIC {
            return Err(invalid("not a pmheap region file"));
        }
        let (map_addr, len) = (word(1) as usize, word(2) as usize);
        if file.metadata()?.len() < len as u64 {
            return Err(invalid("region file is shorter than recorded"));
        }
        let region = Self::map(file, map_addr, len)?;
        log::info!("opened region of {len} bytes at {map_addr:#x}");
        Ok(region)
    }

    fn map(file: File, map_addr: usize, len: usize) -> io::Result<Self> {
        let base = system::map_file_fixed(map_addr, len, file.as_raw_fd())
            .ok_or_else(|| {
                io::Error::new(
                    io::ErrorKind::AddrInUse,
                    "region address is not available",
                )
            })?;
        Ok(Self {
            _file: file,
            base,
            len,
            lock: Mutex::new(()),
        })
    }

    fn header(&self) -> *mut FileHeader {
        self.base.as_ptr().cast()
    }

    /// Address of the heap area of a region whose first acquisition was
    /// the heap start.
    pub fn heap_base(&self) -> usize {
        self.base.as_ptr() as usize + OS_PAGE_SIZE
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn used(&self) -> usize {
        // SAFETY: header page is mapped
        unsafe { (*self.header()).cursor as usize }
    }

    /// Flushes the whole mapping to the file.
    pub fn sync(&self) -> io::Result<()> {
        if system::sync_memory(self.base, self.len) {
            Ok(())
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

impl ExtentSource for FileRegion {
    fn acquire(&self, align: usize, size: usize) -> Option<NonNull<u8>> {
        let _guard = self.lock.lock();
        let base = self.base.as_ptr() as usize;
        let (start, next) = bump(base, self.len, self.used(), align, size)?;
        // SAFETY: header page is mapped
        let cursor = unsafe { &raw mut (*self.header()).cursor };
        // SAFETY: as above
        unsafe { cursor.write_volatile(next as u64) };
        system::flush_line(cursor as usize);
        system::store_fence();
        NonNull::new(start as *mut u8)
    }
}

impl Drop for FileRegion {
    fn drop(&mut self) {
        let _ = self.sync();
        system::unmap_memory(self.base, self.len);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_region_bumps_aligned() {
        let region = AnonymousRegion::new(64 * 1024).unwrap();
        let a = region.acquire(4096, 100).unwrap();
        let b = region.acquire(4096, 100).unwrap();
        assert_eq!(a.as_ptr() as usize, region.base());
        assert_eq!(b.as_ptr() as usize, region.base() + 4096);
        assert!(region.acquire(16, 64 * 1024).is_none());
        assert_eq!(region.used(), 4096 + 100);
    }

    #[test]
    fn file_region_reopens_at_same_address() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("pmheap-region-{}", std::process::id()));
        let addr = 0x5e00_0000_0000;
        let extent = {
            let region = match FileRegion::create(&path, 1 << 20, addr) {
                Ok(region) => region,
                // address space layout of the test host may not allow it
                Err(e) if e.kind() == io::ErrorKind::AddrInUse => return,
                Err(e) => panic!("{e}"),
            };
            let extent = region.acquire(4096, 8192).unwrap();
            assert_eq!(extent.as_ptr() as usize, region.heap_base());
            // SAFETY: freshly acquired
            unsafe { extent.as_ptr().write(42) };
            extent.as_ptr() as usize
        };

        let region = FileRegion::open(&path).unwrap();
        assert_eq!(region.heap_base(), extent);
        // SAFETY: mapped at the same address again
        assert_eq!(unsafe { *(extent as *const u8) }, 42);
        let next = region.acquire(16, 16).unwrap();
        assert_eq!(next.as_ptr() as usize, extent + 8192);
        drop(region);
        let _ = std::fs::remove_file(&path);
    }
}
