//! Queue pair bootstrap over a TCP control socket.
//!
//! The active side sends its record, receives the passive side's record,
//! activates its QP and sends its record again as an acknowledgement. The
//! passive side activates its QP as soon as it has the active side's record
//! and becomes writable once the acknowledgement names its own QP.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream};
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::{fmt, str};

use log::{debug, info, trace, warn};
use parking_lot::Mutex;
use regex::Regex;

use super::verbs::{Gid, Lid, Psn, Qpn};
use super::RdmaConnection;
use crate::error::{HandshakeError, Result};
use crate::event::{EventCallback, Interest};
use crate::utils::interop::would_block;
use crate::worker::MsgWorker;

/// Length of an encoded [`HandshakeRecord`], terminating NUL included.
pub const RECORD_LEN: usize = 68;

/// What one side tells the other to connect a queue pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeRecord {
    pub lid: Lid,
    pub qpn: Qpn,
    pub psn: Psn,
    /// QP number the sender expects on the other side; 0 if not known yet.
    pub peer_qpn: Qpn,
    /// Service level.
    pub sl: u8,
    pub gid: Gid,
}

fn record_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^([0-9a-f]{4}):([0-9a-f]{8}):([0-9a-f]{8}):([0-9a-f]{8}):([0-9a-f]{2}):([0-9a-f]{32})$",
        )
        .expect("handshake record pattern is valid")
    })
}

impl HandshakeRecord {
    /// Encode as `lid:qpn:psn:peer_qpn:sl:gid` in fixed-width lowercase hex,
    /// NUL-padded to [`RECORD_LEN`] bytes.
    pub fn encode(&self) -> [u8; RECORD_LEN] {
        let text = format!(
            "{:04x}:{:08x}:{:08x}:{:08x}:{:02x}:{}",
            self.lid, self.qpn, self.psn, self.peer_qpn, self.sl, self.gid
        );
        let mut out = [0u8; RECORD_LEN];
        let n = text.len().min(RECORD_LEN - 1);
        out[..n].copy_from_slice(&text.as_bytes()[..n]);
        out
    }

    pub fn parse(buf: &[u8]) -> Result<Self, HandshakeError> {
        let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
        let raw = &buf[..end];
        let malformed = || HandshakeError::Malformed(String::from_utf8_lossy(raw).into_owned());

        let text = str::from_utf8(raw).map_err(|_| malformed())?;
        let caps = record_regex().captures(text).ok_or_else(malformed)?;
        let field = |i: usize| u32::from_str_radix(&caps[i], 16).map_err(|_| malformed());
        let gid = u128::from_str_radix(&caps[6], 16).map_err(|_| malformed())?;

        Ok(Self {
            lid: field(1)? as Lid,
            qpn: field(2)?,
            psn: field(3)?,
            peer_qpn: field(4)?,
            sl: field(5)? as u8,
            gid: Gid(gid.to_be_bytes()),
        })
    }
}

/// Handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrepStatus {
    Init,
    /// The local record is out.
    SynedMyMsg,
    /// The peer's record is in.
    SynedPeerMsg,
    Acked,
    Closed,
}

/// In-flight handshakes by ID, owned by the RDMA stack.
pub(crate) type PrepRegistry = Mutex<HashMap<u64, Arc<RdmaPrepConn>>>;

struct PrepState {
    status: PrepStatus,
    connected: bool,
    out: [u8; RECORD_LEN],
    out_off: usize,
    inbuf: [u8; RECORD_LEN],
    in_got: usize,
}

/// One handshake, driven by a worker through the control socket's readiness.
pub struct RdmaPrepConn {
    id: u64,
    stream: TcpStream,
    server: bool,
    worker: MsgWorker,
    conn: Arc<RdmaConnection>,
    registry: Weak<PrepRegistry>,
    state: Mutex<PrepState>,
    done: AtomicBool,
}

impl fmt::Debug for RdmaPrepConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RdmaPrepConn")
            .field("id", &self.id)
            .field("server", &self.server)
            .field("qpn", &self.conn.qp_num())
            .field("status", &self.status())
            .finish()
    }
}

impl RdmaPrepConn {
    /// Prepare a handshake for `conn` over `stream`. Nothing happens until
    /// [`RdmaPrepConn::start`].
    pub(crate) fn new(
        id: u64,
        stream: TcpStream,
        server: bool,
        worker: MsgWorker,
        conn: Arc<RdmaConnection>,
        registry: Weak<PrepRegistry>,
    ) -> io::Result<Arc<Self>> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;

        // The active side speaks first.
        let (out, out_off) = if server {
            ([0u8; RECORD_LEN], RECORD_LEN)
        } else {
            (conn.local_record().encode(), 0)
        };
        Ok(Arc::new(Self {
            id,
            stream,
            server,
            worker,
            conn,
            registry,
            state: Mutex::new(PrepState {
                status: PrepStatus::Init,
                connected: server,
                out,
                out_off,
                inbuf: [0u8; RECORD_LEN],
                in_got: 0,
            }),
            done: AtomicBool::new(false),
        }))
    }

    /// Register the control socket with the worker.
    pub(crate) fn start(self: &Arc<Self>) -> io::Result<()> {
        let fd = self.stream.as_raw_fd();
        self.worker
            .set_event(fd, Interest::READABLE | Interest::WRITABLE, self.clone())?;
        debug!(
            "handshake {} for QP {:#x} started ({})",
            self.id,
            self.conn.qp_num(),
            if self.server { "passive" } else { "active" }
        );
        Ok(())
    }

    #[inline]
    pub fn id(&self) -> u64 {
        self.id
    }

    #[inline]
    pub fn is_server(&self) -> bool {
        self.server
    }

    #[inline]
    pub fn status(&self) -> PrepStatus {
        self.state.lock().status
    }

    /// The RDMA connection being set up.
    #[inline]
    pub fn conn(&self) -> &Arc<RdmaConnection> {
        &self.conn
    }

    fn drive(&self) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        let result = {
            let mut st = self.state.lock();
            self.progress(&mut st)
        };
        match result {
            Ok(true) => self.finish(true),
            Ok(false) => {}
            Err(e) => {
                warn!("handshake {} for QP {:#x} failed: {}", self.id, self.conn.qp_num(), e);
                self.finish(false);
            }
        }
    }

    /// Advance as far as the socket allows. `Ok(true)` once acknowledged.
    fn progress(&self, st: &mut PrepState) -> Result<bool> {
        if !st.connected {
            if let Some(e) = self.stream.take_error()? {
                return Err(e.into());
            }
            match self.stream.peer_addr() {
                Ok(_) => st.connected = true,
                Err(e) if e.kind() == io::ErrorKind::NotConnected => return Ok(false),
                Err(e) => return Err(e.into()),
            }
        }

        loop {
            match (self.server, st.status) {
                (_, PrepStatus::Acked) | (_, PrepStatus::Closed) => return Ok(true),

                (false, PrepStatus::Init) => {
                    if !self.flush_out(st)? {
                        return Ok(false);
                    }
                    st.status = PrepStatus::SynedMyMsg;
                }
                (false, PrepStatus::SynedMyMsg) => {
                    if !self.fill_in(st)? {
                        return Ok(false);
                    }
                    let peer = HandshakeRecord::parse(&st.inbuf)?;
                    trace!("handshake {} got {:?}", self.id, peer);
                    let qpn = self.conn.qp_num();
                    if peer.peer_qpn != qpn {
                        return Err(HandshakeError::QpnMismatch {
                            expected: qpn,
                            got: peer.peer_qpn,
                        }
                        .into());
                    }
                    self.conn.activate(&peer)?;
                    self.conn.set_writable();
                    self.load_out(st);
                    st.status = PrepStatus::SynedPeerMsg;
                }
                (false, PrepStatus::SynedPeerMsg) => {
                    if !self.flush_out(st)? {
                        return Ok(false);
                    }
                    st.status = PrepStatus::Acked;
                }

                (true, PrepStatus::Init) => {
                    if !self.fill_in(st)? {
                        return Ok(false);
                    }
                    let peer = HandshakeRecord::parse(&st.inbuf)?;
                    trace!("handshake {} got {:?}", self.id, peer);
                    self.conn.adopt_service_level(peer.sl);
                    self.conn.activate(&peer)?;
                    self.load_out(st);
                    st.status = PrepStatus::SynedPeerMsg;
                }
                (true, PrepStatus::SynedPeerMsg) => {
                    if !self.flush_out(st)? {
                        return Ok(false);
                    }
                    st.status = PrepStatus::SynedMyMsg;
                }
                (true, PrepStatus::SynedMyMsg) => {
                    if !self.fill_in(st)? {
                        return Ok(false);
                    }
                    let ack = HandshakeRecord::parse(&st.inbuf)?;
                    let qpn = self.conn.qp_num();
                    if ack.peer_qpn != qpn {
                        return Err(HandshakeError::QpnMismatch {
                            expected: qpn,
                            got: ack.peer_qpn,
                        }
                        .into());
                    }
                    self.conn.set_writable();
                    st.status = PrepStatus::Acked;
                }
            }
        }
    }

    fn load_out(&self, st: &mut PrepState) {
        st.out = self.conn.local_record().encode();
        st.out_off = 0;
    }

    /// Write the pending record. `Ok(true)` once all of it is out.
    fn flush_out(&self, st: &mut PrepState) -> io::Result<bool> {
        while st.out_off < RECORD_LEN {
            match (&self.stream).write(&st.out[st.out_off..]) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => st.out_off += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if would_block(&e) => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Read one record into `inbuf`. `Ok(true)` once complete.
    fn fill_in(&self, st: &mut PrepState) -> io::Result<bool> {
        while st.in_got < RECORD_LEN {
            match (&self.stream).read(&mut st.inbuf[st.in_got..]) {
                Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
                Ok(n) => st.in_got += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if would_block(&e) => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        st.in_got = 0;
        Ok(true)
    }

    /// Close the control socket and leave the registry, once.
    fn finish(&self, ok: bool) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        let fd = self.stream.as_raw_fd();
        if let Err(e) = self.worker.del_event(fd) {
            debug!("handshake {} cannot leave the reactor: {}", self.id, e);
        }
        let _ = self.stream.shutdown(Shutdown::Both);
        if !ok {
            self.state.lock().status = PrepStatus::Closed;
        }
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().remove(&self.id);
        }

        if ok {
            info!("handshake {} for QP {:#x} done", self.id, self.conn.qp_num());
        } else {
            self.conn.fault();
        }
    }

    /// Give up, as on shutdown.
    pub(crate) fn abort(&self) {
        self.finish(false);
    }
}

impl EventCallback for RdmaPrepConn {
    fn on_readable(&self) {
        self.drive();
    }

    fn on_writable(&self) {
        self.drive();
    }

    fn on_error(&self) {
        if self.done.load(Ordering::Acquire) {
            return;
        }
        match self.stream.take_error() {
            Ok(Some(e)) | Err(e) => warn!("handshake {} control socket error: {}", self.id, e),
            Ok(None) => debug!("handshake {} control socket hung up", self.id),
        }
        self.finish(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> HandshakeRecord {
        HandshakeRecord {
            lid: 0x12,
            qpn: 0xabcdef,
            psn: 0x42,
            peer_qpn: 0x100,
            sl: 3,
            gid: Gid::from_words([0xfe800000, 0, 0x0211_22ff, 0xfe33_4455]),
        }
    }

    #[test]
    fn record_text_layout() {
        let buf = record().encode();
        let text = str::from_utf8(&buf[..RECORD_LEN - 1]).unwrap();
        assert_eq!(
            text,
            "0012:00abcdef:00000042:00000100:03:fe80000000000000021122fffe334455"
        );
        assert_eq!(buf[RECORD_LEN - 1], 0);
        assert_eq!(HandshakeRecord::parse(&buf).unwrap(), record());
    }

    #[test]
    fn malformed_records_are_rejected() {
        let mut buf = record().encode();
        buf[4] = b'-';
        assert!(matches!(
            HandshakeRecord::parse(&buf),
            Err(HandshakeError::Malformed(_))
        ));
        assert!(HandshakeRecord::parse(b"0012:00abcdef").is_err());
        assert!(HandshakeRecord::parse(&[0u8; RECORD_LEN]).is_err());
    }
}
