//! Host memory acquisition.
//!
//! The runtime backs all guest-visible memory with one anonymous private
//! mapping obtained from the operating system. [`HostMem`] owns that mapping
//! and releases it on drop; everything above this layer deals in plain host
//! addresses inside the mapped range.

use core::ptr;

use log::warn;

use crate::mm::{MemError, PAGE_SIZE_BITS};
use crate::util::align::align_up;

/// An owned, read-write, page-aligned host memory mapping.
pub struct HostMem {
    ptr: *mut u8,
    len: usize,
}

// The mapping is plain memory; the owner decides how accesses are serialized.
unsafe impl Send for HostMem {}
unsafe impl Sync for HostMem {}

impl HostMem {
    /// Map `len` bytes (rounded up to whole pages) of zeroed anonymous memory.
    pub fn map(len: usize) -> Result<HostMem, MemError> {
        let len = align_up(len, PAGE_SIZE_BITS);
        debug_assert!(len > 0);
        let ptr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            warn!("mmap of {} bytes failed", len);
            return Err(MemError::OutOfMemory);
        }
        Ok(HostMem {
            ptr: ptr as *mut u8,
            len,
        })
    }

    /// Base address of the mapping.
    #[inline(always)]
    pub fn addr(&self) -> usize {
        self.ptr as usize
    }

    /// Length of the mapping in bytes. Always a multiple of the page size.
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Drop for HostMem {
    fn drop(&mut self) {
        let rc = unsafe { libc::munmap(self.ptr as *mut libc::c_void, self.len) };
        debug_assert_eq!(rc, 0);
    }
}
