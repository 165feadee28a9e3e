use std::io;

use super::select::*;

/// Converts a C return value to a Rust `Result`.
///
/// libibverbs returns the error number directly, so a non-zero `ret` is
/// interpreted as an `errno` value.
#[inline(always)]
pub(crate) fn from_c_ret(ret: i32) -> io::Result<()> {
    (ret == 0).select(|| Ok(()), || Err(io::Error::from_raw_os_error(ret.abs())))
}

/// Converts a libc return value (`-1` on failure with `errno` set) to a Rust
/// `Result` carrying the non-negative value.
#[inline(always)]
pub(crate) fn from_libc_ret<T>(ret: T) -> io::Result<T>
where
    T: Copy + PartialOrd + Default,
{
    if ret < T::default() {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret)
    }
}

/// Whether the error means that a non-blocking operation should be retried
/// on the next readiness notification.
#[inline]
pub(crate) fn would_block(err: &io::Error) -> bool {
    matches!(err.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn c_ret_conversion() {
        assert!(from_c_ret(0).is_ok());
        let err = from_c_ret(libc::EINVAL).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EINVAL));
        let err = from_c_ret(-libc::ENOMEM).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOMEM));
    }

    #[test]
    fn libc_ret_conversion() {
        assert_eq!(from_libc_ret(5isize).unwrap(), 5);
        assert!(from_libc_ret(-1i32).is_err());
    }
}
