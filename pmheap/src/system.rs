use std::{
    os::fd::RawFd,
    ptr::NonNull,
    sync::atomic::{Ordering, fence},
};

#[cfg(unix)]
#[allow(unused)]
mod unix {
    use core::ffi::c_void;

    pub const PROT_NONE: i32 = 0x0;
    pub const PROT_READ: i32 = 0x1;
    pub const PROT_WRITE: i32 = 0x2;

    pub const MAP_SHARED: i32 = 0x01;
    pub const MAP_PRIVATE: i32 = 0x02;
    pub const MAP_FIXED: i32 = 0x10;

    #[cfg(target_os = "linux")]
    pub const MAP_FIXED_NOREPLACE: i32 = 0x10_0000;
    // without NOREPLACE the requested address is only a hint and the caller
    // checks where the mapping landed
    #[cfg(not(target_os = "linux"))]
    pub const MAP_FIXED_NOREPLACE: i32 = 0;

    #[cfg(target_os = "linux")]
    pub const MAP_ANON: i32 = 0x20;
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    pub const MAP_ANON: i32 = 0x1000;

    #[cfg(target_os = "linux")]
    pub const MS_SYNC: i32 = 0x4;
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    pub const MS_SYNC: i32 = 0x10;

    pub const MAP_FAILED: isize = -1;

    /// posix mmap, munmap and msync
    /// # Safety
    /// see valid mmap and munmap usage online
    unsafe extern "C" {
        pub fn mmap(
            addr: *mut c_void,
            length: usize,
            prot: i32,
            flags: i32,
            fd: i32,
            offset: isize,
        ) -> *mut c_void;

        pub fn munmap(addr: *mut c_void, length: usize) -> i32;

        pub fn msync(addr: *mut c_void, length: usize, flags: i32) -> i32;
    }

    /// posix memory allocation using mmap
    /// # Safety
    /// null must be checked
    #[inline]
    pub unsafe fn anonymous_mmap(len: usize) -> *mut u8 {
        // SAFETY: safe if contract holds
        let p = unsafe {
            mmap(
                core::ptr::null_mut(),
                len,
                PROT_READ | PROT_WRITE,
                MAP_PRIVATE | MAP_ANON,
                -1,
                0,
            )
        };
        if (p as isize) == MAP_FAILED {
            core::ptr::null_mut()
        } else {
            p as *mut u8
        }
    }

    /// maps `len` bytes of `fd` shared, asking for `addr`
    /// # Safety
    /// `fd` must be an open file descriptor
    #[inline]
    pub unsafe fn fixed_file_mmap(addr: *mut u8, len: usize, fd: i32) -> *mut u8 {
        // SAFETY: safe if contract holds
        let p = unsafe {
            mmap(
                addr.cast(),
                len,
                PROT_READ | PROT_WRITE,
                MAP_SHARED | MAP_FIXED_NOREPLACE,
                fd,
                0,
            )
        };
        if (p as isize) == MAP_FAILED {
            core::ptr::null_mut()
        } else {
            p as *mut u8
        }
    }

    /// posix memory deallocation using munmap
    /// # Safety
    /// must be allocated by mmmap
    #[inline]
    pub unsafe fn unmap(ptr: *mut u8, len: usize) {
        // SAFETY: safe if contract holds
        let _ = unsafe { munmap(ptr.cast(), len) };
    }
}

pub const OS_PAGE_SIZE: usize = 4096;
pub const CACHE_LINE_SIZE: usize = 64;

#[must_use]
pub fn map_memory(size: usize) -> Option<NonNull<u8>> {
    // SAFETY: this is safe
    let ptr = unsafe { unix::anonymous_mmap(size) };
    NonNull::new(ptr)
}

/// Maps a file at a fixed address so persistent pointers stay valid across
/// process restarts. Fails instead of replacing an existing mapping.
#[must_use]
pub fn map_file_fixed(
    addr: usize,
    size: usize,
    fd: RawFd,
) -> Option<NonNull<u8>> {
    // SAFETY: the kernel refuses to clobber live mappings
    let ptr = unsafe { unix::fixed_file_mmap(addr as *mut u8, size, fd) };
    let mapped = NonNull::new(ptr)?;
    if mapped.as_ptr() as usize != addr {
        unmap_memory(mapped, size);
        return None;
    }
    Some(mapped)
}

pub fn unmap_memory(ptr: NonNull<u8>, size: usize) {
    // SAFETY: ptr must be from mmap allocation
    unsafe { unix::unmap(ptr.as_ptr(), size) };
}

/// Writes back dirty pages of a shared file mapping.
pub fn sync_memory(ptr: NonNull<u8>, size: usize) -> bool {
    // SAFETY: ptr must be from a shared mmap allocation
    unsafe { unix::msync(ptr.as_ptr().cast(), size, unix::MS_SYNC) == 0 }
}

#[inline(always)]
pub fn line_of(addr: usize) -> usize {
    addr & !(CACHE_LINE_SIZE - 1)
}

/// Writes the cache line holding `addr` back to memory.
#[inline]
pub fn flush_line(addr: usize) {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: clflush is baseline on x86_64 and only needs a mapped address
    unsafe {
        core::arch::x86_64::_mm_clflush(addr as *const u8)
    };
    #[cfg(not(target_arch = "x86_64"))]
    {
        let _ = addr;
        fence(Ordering::SeqCst);
    }
}

/// Orders every earlier flush before any later store.
#[inline]
pub fn store_fence() {
    #[cfg(target_arch = "x86_64")]
    // SAFETY: sfence is baseline on x86_64
    unsafe {
        core::arch::x86_64::_mm_sfence()
    };
    fence(Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn map_and_flush_anonymous_memory() {
        let size = 4 * OS_PAGE_SIZE;
        let mem = map_memory(size).expect("mmap");
        assert_eq!(mem.as_ptr() as usize % OS_PAGE_SIZE, 0);

        // SAFETY: freshly mapped
        unsafe { mem.as_ptr().write_bytes(0xab, size) };
        let mut line = line_of(mem.as_ptr() as usize + 3);
        while line < mem.as_ptr() as usize + size {
            flush_line(line);
            line += CACHE_LINE_SIZE;
        }
        store_fence();

        // SAFETY: freshly mapped
        assert_eq!(unsafe { *mem.as_ptr().add(size - 1) }, 0xab);
        unmap_memory(mem, size);
    }

    #[test]
    fn line_rounding() {
        assert_eq!(line_of(0x1000), 0x1000);
        assert_eq!(line_of(0x103f), 0x1000);
        assert_eq!(line_of(0x1040), 0x1040);
    }
}
