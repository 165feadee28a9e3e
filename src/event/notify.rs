use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use crate::utils::interop::{from_libc_ret, would_block};

/// A non-blocking `eventfd` used to wake a reactor from another thread.
#[derive(Debug)]
pub struct Notifier {
    fd: OwnedFd,
}

impl Notifier {
    pub fn new() -> io::Result<Self> {
        // SAFETY: FFI.
        let fd = from_libc_ret(unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) })?;
        // SAFETY: `fd` was just created and is owned by nobody else.
        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
        })
    }

    /// Make the descriptor readable.
    pub fn notify(&self) -> io::Result<()> {
        let one = 1u64;
        // SAFETY: FFI; writes eight bytes from a valid `u64`.
        let ret = unsafe { libc::write(self.fd.as_raw_fd(), (&one as *const u64).cast(), 8) };
        match from_libc_ret(ret) {
            Ok(_) => Ok(()),
            // The counter is saturated, so the descriptor is readable anyway.
            Err(e) if would_block(&e) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Reset the descriptor to non-readable. Return the number of
    /// notifications consumed.
    pub fn drain(&self) -> io::Result<u64> {
        let mut count = 0u64;
        // SAFETY: FFI; reads eight bytes into a valid `u64`.
        let ret = unsafe { libc::read(self.fd.as_raw_fd(), (&mut count as *mut u64).cast(), 8) };
        match from_libc_ret(ret) {
            Ok(_) => Ok(count),
            Err(e) if would_block(&e) => Ok(0),
            Err(e) => Err(e),
        }
    }
}

impl AsRawFd for Notifier {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notifications_coalesce() -> anyhow::Result<()> {
        let n = Notifier::new()?;
        assert_eq!(n.drain()?, 0);
        n.notify()?;
        n.notify()?;
        assert_eq!(n.drain()?, 2);
        assert_eq!(n.drain()?, 0);
        Ok(())
    }
}
