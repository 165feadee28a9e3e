use std::collections::VecDeque;
use std::io::{self, Read};
use std::net::{Shutdown, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::{fmt, mem};

use bytes::{Buf, Bytes, BytesMut};
use log::{debug, info, trace, warn};
use parking_lot::Mutex;

use crate::conn::{ConnBase, ConnId, ConnRef, Connection};
use crate::error::{MsgError, Result};
use crate::event::{EventCallback, Interest};
use crate::msg::{Msg, MsgHeader, NodeAddr, TransportType, WireError};
use crate::utils::interop::{from_libc_ret, would_block};
use crate::worker::MsgWorker;

/// Largest payload accepted from a peer.
pub const MAX_PAYLOAD: usize = 1 << 30;

/// Largest number of buffers handed to one `sendmsg`.
const MAX_IOV: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum TcpState {
    Connecting = 0,
    Connected = 1,
    Closed = 2,
}

impl From<u8> for TcpState {
    fn from(v: u8) -> Self {
        match v {
            0 => TcpState::Connecting,
            1 => TcpState::Connected,
            _ => TcpState::Closed,
        }
    }
}

/// Receive cursor: a header being read, then its payload.
#[derive(Default)]
struct RxState {
    header: [u8; MsgHeader::LEN],
    header_got: usize,
    body: Option<(MsgHeader, BytesMut, usize)>,
}

/// A message-framed TCP connection.
///
/// Outbound messages are queued as header and payload pieces and written
/// with `sendmsg`; a write that would block leaves the rest queued until
/// the socket is writable again.
pub struct TcpConnection {
    base: ConnBase,
    me: Weak<TcpConnection>,
    stream: TcpStream,
    state: AtomicU8,
    tx: Mutex<VecDeque<Bytes>>,
    rx: Mutex<RxState>,
    submit_posted: AtomicBool,
}

impl fmt::Debug for TcpConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConnection")
            .field("id", &self.base.id())
            .field("peer", &self.base.peer_addr())
            .field("state", &self.state())
            .finish()
    }
}

impl TcpConnection {
    /// Wrap a socket and register it with `worker`. `connecting` tells
    /// that a non-blocking connect is still in progress.
    pub(crate) fn new(
        stream: TcpStream,
        worker: MsgWorker,
        connecting: bool,
        peer: Option<NodeAddr>,
    ) -> io::Result<Arc<Self>> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        let fd = stream.as_raw_fd();
        let state = if connecting {
            TcpState::Connecting
        } else {
            TcpState::Connected
        };

        let conn = Arc::new_cyclic(|me| Self {
            base: ConnBase::new(
                ConnId {
                    ttype: TransportType::Tcp,
                    id: fd as u32,
                },
                worker.clone(),
                peer,
            ),
            me: me.clone(),
            stream,
            state: AtomicU8::new(state as u8),
            tx: Mutex::new(VecDeque::new()),
            rx: Mutex::new(RxState::default()),
            submit_posted: AtomicBool::new(false),
        });
        worker.set_event(fd, Interest::READABLE | Interest::WRITABLE, conn.clone())?;
        debug!("tcp connection {} on worker {} ({:?})", fd, worker.id(), state);
        Ok(conn)
    }

    #[inline]
    fn state(&self) -> TcpState {
        TcpState::from(self.state.load(Ordering::Acquire))
    }

    #[inline]
    fn conn_ref(&self) -> Option<ConnRef> {
        self.me.upgrade().map(|c| c as ConnRef)
    }

    /// Write queued pieces until the queue is empty or the socket is full.
    fn submit(&self) {
        if self.state() != TcpState::Connected {
            return;
        }
        let fd = self.stream.as_raw_fd();
        let mut tx = self.tx.lock();
        let mut wrote = false;
        while !tx.is_empty() {
            let cnt = tx.len().min(MAX_IOV);
            // SAFETY: plain C structs, every used entry is filled below.
            let mut iov: [libc::iovec; MAX_IOV] = unsafe { mem::zeroed() };
            for (slot, piece) in iov.iter_mut().zip(tx.iter()) {
                slot.iov_base = piece.as_ptr() as *mut libc::c_void;
                slot.iov_len = piece.len();
            }
            // SAFETY: as above.
            let mut hdr: libc::msghdr = unsafe { mem::zeroed() };
            hdr.msg_iov = iov.as_mut_ptr();
            hdr.msg_iovlen = cnt as _;
            let flags = libc::MSG_NOSIGNAL | if tx.len() > cnt { libc::MSG_MORE } else { 0 };

            // SAFETY: FFI; the iovecs point into pieces kept alive by `tx`.
            let ret = unsafe { libc::sendmsg(fd, &hdr, flags) };
            match from_libc_ret(ret) {
                Ok(sent) => {
                    trace!("tcp {} sent {} bytes", fd, sent);
                    consume(&mut tx, sent as usize);
                    wrote = true;
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if would_block(&e) => return,
                Err(e) => {
                    drop(tx);
                    warn!("tcp {} send failed: {}", fd, e);
                    self.shutdown();
                    return;
                }
            }
        }
        drop(tx);
        if wrote {
            if let Some(conn) = self.conn_ref() {
                self.base.notify_write(&conn);
            }
        }
    }

    /// Read until the socket is drained. `Ok(false)` means the peer closed.
    fn read_available(&self, out: &mut Vec<Msg>) -> Result<bool> {
        let mut rx = self.rx.lock();
        loop {
            let RxState {
                header,
                header_got,
                body,
            } = &mut *rx;
            let target = match body {
                None => &mut header[*header_got..],
                Some((_, buf, got)) => &mut buf[*got..],
            };
            let n = match (&self.stream).read(target) {
                Ok(0) => return Ok(false),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if would_block(&e) => return Ok(true),
                Err(e) => return Err(e.into()),
            };

            if body.is_none() {
                *header_got += n;
                if *header_got < MsgHeader::LEN {
                    continue;
                }
                *header_got = 0;
                let (h, _) = MsgHeader::decode(&header[..])?;
                let len = h.len as usize;
                if len > MAX_PAYLOAD {
                    return Err(WireError::TooLong(len, MAX_PAYLOAD).into());
                }
                if len == 0 {
                    out.push(Msg::from_parts(h, Bytes::new(), TransportType::Tcp));
                } else {
                    *body = Some((h, BytesMut::zeroed(len), 0));
                }
                continue;
            }

            let complete = match body.as_mut() {
                Some((_, buf, got)) => {
                    *got += n;
                    *got == buf.len()
                }
                None => false,
            };
            if complete {
                if let Some((h, buf, _)) = body.take() {
                    out.push(Msg::from_parts(h, buf.freeze(), TransportType::Tcp));
                }
            }
        }
    }

    /// Close the socket and report it, once.
    fn shutdown(&self) {
        if self.state.swap(TcpState::Closed as u8, Ordering::AcqRel) == TcpState::Closed as u8 {
            return;
        }
        let fd = self.stream.as_raw_fd();
        if let Err(e) = self.base.worker().del_event(fd) {
            debug!("tcp {} cannot leave the reactor: {}", fd, e);
        }
        let _ = self.stream.shutdown(Shutdown::Both);
        self.tx.lock().clear();
        info!("tcp connection {} to {:?} closed", fd, self.base.peer_addr());
        if let Some(conn) = self.conn_ref() {
            self.base.notify_error(&conn);
        }
    }
}

fn consume(queue: &mut VecDeque<Bytes>, mut n: usize) {
    while n > 0 {
        let Some(front) = queue.front_mut() else {
            break;
        };
        if front.len() <= n {
            n -= front.len();
            queue.pop_front();
        } else {
            front.advance(n);
            n = 0;
        }
    }
}

impl EventCallback for TcpConnection {
    fn on_readable(&self) {
        if self.state() == TcpState::Closed {
            return;
        }
        let mut msgs = Vec::new();
        let result = self.read_available(&mut msgs);
        if let Some(conn) = self.conn_ref() {
            for msg in msgs {
                self.base.deliver(&conn, msg);
            }
        }
        match result {
            Ok(true) => {}
            Ok(false) => {
                debug!("tcp {} closed by peer", self.stream.as_raw_fd());
                self.shutdown();
            }
            Err(e) => {
                warn!("tcp {} receive failed: {}", self.stream.as_raw_fd(), e);
                self.shutdown();
            }
        }
    }

    fn on_writable(&self) {
        if self.state() == TcpState::Connecting {
            match self.stream.take_error() {
                Ok(None) => {
                    let _ = self.state.compare_exchange(
                        TcpState::Connecting as u8,
                        TcpState::Connected as u8,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                    info!("tcp connection {} to {:?} established", self.stream.as_raw_fd(), self.base.peer_addr());
                }
                Ok(Some(e)) | Err(e) => {
                    warn!("tcp connect to {:?} failed: {}", self.base.peer_addr(), e);
                    self.shutdown();
                    return;
                }
            }
        }
        self.submit();
    }

    fn on_error(&self) {
        if self.state() == TcpState::Closed {
            return;
        }
        if let Ok(Some(e)) = self.stream.take_error() {
            warn!("tcp {} error: {}", self.stream.as_raw_fd(), e);
        }
        self.shutdown();
    }
}

impl Connection for TcpConnection {
    #[inline]
    fn id(&self) -> ConnId {
        self.base.id()
    }

    fn send_msg(&self, msg: Msg) -> Result<()> {
        if self.state() == TcpState::Closed {
            return Err(MsgError::NotConnected);
        }
        trace!("tcp {} queue {:?}", self.stream.as_raw_fd(), msg.header());
        self.tx.lock().extend(msg.into_wire_pieces());

        let worker = self.base.worker();
        if worker.am_self() {
            self.submit();
        } else if !self.submit_posted.swap(true, Ordering::AcqRel) {
            if let Some(me) = self.me.upgrade() {
                worker.post_work(move || {
                    me.submit_posted.store(false, Ordering::Release);
                    me.submit();
                });
            }
        }
        Ok(())
    }

    fn close(&self) {
        let worker = self.base.worker();
        if worker.am_self() {
            self.shutdown();
        } else if let Some(me) = self.me.upgrade() {
            worker.post_work(move || me.shutdown());
        }
    }

    #[inline]
    fn is_connected(&self) -> bool {
        self.state() == TcpState::Connected
    }

    #[inline]
    fn is_closed(&self) -> bool {
        self.state() == TcpState::Closed
    }

    #[inline]
    fn peer_addr(&self) -> Option<NodeAddr> {
        self.base.peer_addr()
    }

    #[inline]
    fn worker(&self) -> &MsgWorker {
        self.base.worker()
    }

    #[inline]
    fn base(&self) -> &ConnBase {
        &self.base
    }
}
