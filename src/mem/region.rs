use std::io;
use std::ptr::{self, NonNull};

use log::{debug, warn};

use crate::error::MemError;

/// An anonymous memory mapping, unmapped on drop.
pub(crate) struct Region {
    addr: NonNull<u8>,
    len: usize,
    hugepage: bool,
}

// SAFETY: the mapping is plain memory owned by this value.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

fn mmap(len: usize, extra_flags: libc::c_int) -> io::Result<NonNull<u8>> {
    // SAFETY: FFI; an anonymous private mapping has no preconditions.
    let addr = unsafe {
        libc::mmap(
            ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | extra_flags,
            -1,
            0,
        )
    };
    if addr == libc::MAP_FAILED {
        return Err(io::Error::last_os_error());
    }
    NonNull::new(addr.cast()).ok_or_else(|| io::Error::from(io::ErrorKind::OutOfMemory))
}

impl Region {
    /// Map `len` bytes, trying huge pages first if asked to.
    pub fn new(len: usize, hugepage: bool) -> Result<Self, MemError> {
        if hugepage {
            match mmap(len, libc::MAP_HUGETLB) {
                Ok(addr) => {
                    debug!("mapped {} bytes on huge pages at {:p}", len, addr);
                    return Ok(Self { addr, len, hugepage: true });
                }
                Err(e) => warn!("huge page mapping of {} bytes failed ({}), using normal pages", len, e),
            }
        }
        let addr = mmap(len, 0).map_err(MemError::Mmap)?;
        debug!("mapped {} bytes at {:p}", len, addr);
        Ok(Self { addr, len, hugepage: false })
    }

    #[inline]
    pub fn addr(&self) -> *mut u8 {
        self.addr.as_ptr()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_hugepage(&self) -> bool {
        self.hugepage
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        // SAFETY: the mapping was created by `mmap` with this length.
        unsafe { libc::munmap(self.addr.as_ptr().cast(), self.len) };
    }
}
