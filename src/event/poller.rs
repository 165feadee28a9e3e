use std::collections::HashMap;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::sync::Arc;
use std::time::Duration;
use std::{fmt, io, ops};

use log::trace;
use parking_lot::Mutex;

use crate::utils::interop::from_libc_ret;

/// Readiness a callback is interested in.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest(u32);

impl Interest {
    pub const READABLE: Interest = Interest(1);
    pub const WRITABLE: Interest = Interest(1 << 1);

    #[inline]
    pub fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }

    fn epoll_bits(self) -> u32 {
        let mut bits = (libc::EPOLLET | libc::EPOLLRDHUP) as u32;
        if self.contains(Self::READABLE) {
            bits |= libc::EPOLLIN as u32;
        }
        if self.contains(Self::WRITABLE) {
            bits |= libc::EPOLLOUT as u32;
        }
        bits
    }
}

impl ops::BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Self) -> Self {
        Interest(self.0 | rhs.0)
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.contains(Self::READABLE), self.contains(Self::WRITABLE)) {
            (true, true) => write!(f, "READABLE | WRITABLE"),
            (true, false) => write!(f, "READABLE"),
            (false, true) => write!(f, "WRITABLE"),
            (false, false) => write!(f, "(empty)"),
        }
    }
}

/// Handler of readiness events of one file descriptor.
///
/// Events are edge-triggered: a handler must consume everything available
/// before returning.
pub trait EventCallback: Send + Sync {
    fn on_readable(&self) {}
    fn on_writable(&self) {}
    fn on_error(&self) {}
}

/// An edge-triggered `epoll` instance.
///
/// Registration is thread-safe; `process_events` is meant to be called by
/// the owner thread only.
pub struct EventPoller {
    epfd: OwnedFd,
    callbacks: Mutex<HashMap<RawFd, Arc<dyn EventCallback>>>,
    events: Mutex<Vec<libc::epoll_event>>,
}

impl fmt::Debug for EventPoller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EventPoller<{}>", self.epfd.as_raw_fd())
    }
}

impl EventPoller {
    /// Maximum number of events handled per wait.
    pub const MAX_EVENTS: usize = 128;

    pub fn new() -> io::Result<Self> {
        // SAFETY: FFI.
        let epfd = from_libc_ret(unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) })?;
        Ok(Self {
            // SAFETY: `epfd` was just created and is owned by nobody else.
            epfd: unsafe { OwnedFd::from_raw_fd(epfd) },
            callbacks: Mutex::new(HashMap::new()),
            events: Mutex::new(vec![libc::epoll_event { events: 0, u64: 0 }; Self::MAX_EVENTS]),
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut ev = libc::epoll_event {
            events: interest.epoll_bits(),
            u64: fd as u64,
        };
        // SAFETY: FFI.
        from_libc_ret(unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, &mut ev) }).map(|_| ())
    }

    /// Register `fd`, or change the interest and callback of an already
    /// registered one.
    pub fn set_event(&self, fd: RawFd, interest: Interest, cb: Arc<dyn EventCallback>) -> io::Result<()> {
        let mut callbacks = self.callbacks.lock();
        let op = if callbacks.contains_key(&fd) {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        self.ctl(op, fd, interest)?;
        callbacks.insert(fd, cb);
        trace!("epoll {}: set fd {} {:?}", self.epfd.as_raw_fd(), fd, interest);
        Ok(())
    }

    /// Unregister `fd`. Return its callback, if it was registered.
    pub fn del_event(&self, fd: RawFd) -> io::Result<Option<Arc<dyn EventCallback>>> {
        let mut callbacks = self.callbacks.lock();
        let Some(cb) = callbacks.remove(&fd) else {
            return Ok(None);
        };
        // The descriptor may already be closed, which removed it from the set.
        if let Err(e) = self.ctl(libc::EPOLL_CTL_DEL, fd, Interest::default()) {
            if !matches!(e.raw_os_error(), Some(libc::EBADF) | Some(libc::ENOENT)) {
                callbacks.insert(fd, cb);
                return Err(e);
            }
        }
        trace!("epoll {}: del fd {}", self.epfd.as_raw_fd(), fd);
        Ok(Some(cb))
    }

    /// Number of registered descriptors.
    pub fn event_num(&self) -> usize {
        self.callbacks.lock().len()
    }

    /// Drop every callback.
    pub fn clear(&self) {
        let fds: Vec<RawFd> = self.callbacks.lock().keys().copied().collect();
        for fd in fds {
            let _ = self.del_event(fd);
        }
    }

    /// Wait up to `timeout` (forever when `None`) and dispatch ready events.
    /// Return the number of events dispatched.
    pub fn process_events(&self, timeout: Option<Duration>) -> io::Result<usize> {
        let timeout_ms = match timeout {
            None => -1,
            Some(t) if t.is_zero() => 0,
            Some(t) => t.as_millis().clamp(1, i32::MAX as u128) as libc::c_int,
        };

        let mut events = self.events.lock();
        // SAFETY: FFI; `events` holds `MAX_EVENTS` entries.
        let n = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                events.as_mut_ptr(),
                Self::MAX_EVENTS as libc::c_int,
                timeout_ms,
            )
        };
        let n = match from_libc_ret(n) {
            Ok(n) => n as usize,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => 0,
            Err(e) => return Err(e),
        };

        let ready: Vec<(u32, RawFd)> = events[..n].iter().map(|ev| (ev.events, ev.u64 as RawFd)).collect();
        drop(events);

        for (bits, fd) in ready {
            // Never call back with the map locked.
            let Some(cb) = self.callbacks.lock().get(&fd).cloned() else {
                continue;
            };
            if bits & (libc::EPOLLIN | libc::EPOLLRDHUP) as u32 != 0 {
                cb.on_readable();
            }
            if bits & libc::EPOLLOUT as u32 != 0 {
                cb.on_writable();
            }
            if bits & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                cb.on_error();
            }
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Notifier;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter {
        notifier: Notifier,
        hits: AtomicUsize,
    }

    impl EventCallback for Counter {
        fn on_readable(&self) {
            let _ = self.notifier.drain();
            self.hits.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn dispatch_readable() -> anyhow::Result<()> {
        let poller = EventPoller::new()?;
        let counter = Arc::new(Counter {
            notifier: Notifier::new()?,
            hits: AtomicUsize::new(0),
        });
        let fd = counter.notifier.as_raw_fd();
        poller.set_event(fd, Interest::READABLE, counter.clone())?;
        assert_eq!(poller.event_num(), 1);

        assert_eq!(poller.process_events(Some(Duration::ZERO))?, 0);
        counter.notifier.notify()?;
        assert_eq!(poller.process_events(Some(Duration::from_secs(1)))?, 1);
        assert_eq!(counter.hits.load(Ordering::SeqCst), 1);

        // Edge-triggered: drained, so nothing more.
        assert_eq!(poller.process_events(Some(Duration::ZERO))?, 0);

        assert!(poller.del_event(fd)?.is_some());
        assert!(poller.del_event(fd)?.is_none());
        counter.notifier.notify()?;
        assert_eq!(poller.process_events(Some(Duration::ZERO))?, 0);
        Ok(())
    }
}
