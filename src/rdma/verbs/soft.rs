//! In-process verbs provider.
//!
//! Queue pairs of every [`Context`] in the process live on one software
//! fabric, keyed by QP number; memory regions are keyed by their key. Work
//! requests execute synchronously inside `post_send`, and completions are
//! pushed to the completion queues of both ends just like an RC transport
//! would generate them.
//!
//! Lock discipline: at most one fabric, queue, or CQ lock is held at a time.

use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::Ipv6Addr;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::{Mutex, RwLock};

use super::*;
use crate::utils::interop::from_libc_ret;

/// Name of the only device of the in-process provider.
pub const SOFT_DEVICE_NAME: &str = "soft_0";

const MAX_QP_WR: u32 = 16384;
const MAX_INLINE_DATA: u32 = 1024;
const MAX_CQE: u32 = 1 << 22;
const ACTIVE_MTU: u32 = 4096;

#[derive(Clone, Copy)]
struct Region {
    addr: u64,
    len: u64,
}

impl Region {
    #[inline]
    fn covers(&self, addr: u64, len: u64) -> bool {
        addr >= self.addr && addr.saturating_add(len) <= self.addr + self.len
    }
}

struct Fabric {
    next_qpn: AtomicU32,
    next_key: AtomicU32,
    qps: RwLock<HashMap<Qpn, Weak<QpInner>>>,
    regions: RwLock<HashMap<u32, Region>>,
}

fn fabric() -> &'static Fabric {
    static FABRIC: OnceLock<Fabric> = OnceLock::new();
    FABRIC.get_or_init(|| Fabric {
        next_qpn: AtomicU32::new(0x100),
        next_key: AtomicU32::new(0x1000),
        qps: RwLock::new(HashMap::new()),
        regions: RwLock::new(HashMap::new()),
    })
}

impl Fabric {
    fn qp(&self, qpn: Qpn) -> Option<Arc<QpInner>> {
        self.qps.read().get(&qpn).and_then(Weak::upgrade)
    }

    fn check(&self, key: u32, addr: u64, len: u64) -> bool {
        self.regions
            .read()
            .get(&key)
            .is_some_and(|region| region.covers(addr, len))
    }
}

/// Device context.
#[derive(Debug, Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

#[derive(Debug)]
struct ContextInner {
    port_num: PortNum,
    gid_index: u8,
    lid: Lid,
    gid: Gid,
}

impl Context {
    /// Open a device.
    ///
    /// If `dev_name` is `None` or empty, the first device found is used.
    pub fn open(dev_name: Option<&str>, port_num: PortNum, gid_index: u8) -> io::Result<Self> {
        if let Some(name) = dev_name.filter(|name| !name.is_empty()) {
            if name != SOFT_DEVICE_NAME {
                return Err(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("device {} not found", name),
                ));
            }
        }
        if port_num != 1 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid port number {}", port_num),
            ));
        }

        let gid = Gid(Ipv6Addr::from([0, 0, 0, 0, 0, 0xffff, 0x7f00, 0x0001]).octets());
        Ok(Self {
            inner: Arc::new(ContextInner {
                port_num,
                gid_index,
                lid: 1,
                gid,
            }),
        })
    }

    #[inline]
    pub fn name(&self) -> &str {
        SOFT_DEVICE_NAME
    }

    #[inline]
    pub fn lid(&self) -> Lid {
        self.inner.lid
    }

    #[inline]
    pub fn port_num(&self) -> PortNum {
        self.inner.port_num
    }

    #[inline]
    pub fn gid(&self) -> Gid {
        self.inner.gid
    }

    #[inline]
    pub fn gid_index(&self) -> u8 {
        self.inner.gid_index
    }

    /// Active path MTU of the port, in bytes.
    #[inline]
    pub fn active_mtu(&self) -> u32 {
        ACTIVE_MTU
    }

    #[inline]
    pub fn max_qp_wr(&self) -> u32 {
        MAX_QP_WR
    }
}

/// Protection domain.
#[derive(Debug, Clone)]
pub struct Pd {
    ctx: Context,
}

impl Pd {
    pub fn new(ctx: &Context) -> io::Result<Self> {
        Ok(Self { ctx: ctx.clone() })
    }

    #[inline]
    pub fn context(&self) -> &Context {
        &self.ctx
    }
}

/// Memory region with local and remote access.
#[derive(Debug)]
pub struct Mr {
    _pd: Pd,
    addr: *mut u8,
    len: usize,
    key: u32,
}

unsafe impl Send for Mr {}
unsafe impl Sync for Mr {}

impl Mr {
    /// Register a memory region.
    ///
    /// # Safety
    ///
    /// The memory area must stay valid until the returned `Mr` is dropped.
    pub unsafe fn reg(pd: &Pd, addr: *mut u8, len: usize) -> io::Result<Self> {
        if addr.is_null() || len == 0 {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        let fabric = fabric();
        let key = fabric.next_key.fetch_add(1, Ordering::Relaxed);
        fabric.regions.write().insert(
            key,
            Region {
                addr: addr as u64,
                len: len as u64,
            },
        );
        Ok(Self {
            _pd: pd.clone(),
            addr,
            len,
            key,
        })
    }

    #[inline]
    pub fn addr(&self) -> *mut u8 {
        self.addr
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn lkey(&self) -> LKey {
        self.key
    }

    #[inline]
    pub fn rkey(&self) -> RKey {
        self.key
    }
}

impl Drop for Mr {
    fn drop(&mut self) {
        fabric().regions.write().remove(&self.key);
    }
}

/// Completion event channel, readable when an armed CQ receives a completion.
#[derive(Debug, Clone)]
pub struct CompChannel {
    fd: Arc<OwnedFd>,
}

impl CompChannel {
    pub fn new(_ctx: &Context) -> io::Result<Self> {
        // SAFETY: FFI.
        let fd = from_libc_ret(unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) })?;
        // SAFETY: `fd` is a freshly created descriptor owned by nobody else.
        let fd = unsafe { OwnedFd::from_raw_fd(fd) };
        Ok(Self { fd: Arc::new(fd) })
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    /// Consume all pending completion events.
    pub fn get_events(&self) -> io::Result<()> {
        let mut val = 0u64;
        // SAFETY: FFI, reading 8 bytes into a `u64`.
        let ret = unsafe { libc::read(self.fd(), ptr::addr_of_mut!(val).cast(), 8) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::WouldBlock {
                return Err(err);
            }
        }
        Ok(())
    }

    fn raise(&self) {
        let val = 1u64;
        // SAFETY: FFI, writing 8 bytes from a `u64`.
        unsafe { libc::write(self.fd(), ptr::addr_of!(val).cast(), 8) };
    }
}

struct CqInner {
    entries: Mutex<VecDeque<Wc>>,
    armed: AtomicBool,
    channel: Option<CompChannel>,
    capacity: u32,
}

/// Completion queue.
#[derive(Clone)]
pub struct Cq {
    inner: Arc<CqInner>,
}

impl Cq {
    /// The default CQ depth.
    pub const DEFAULT_CQ_DEPTH: u32 = 128;

    pub fn new(
        _ctx: &Context,
        capacity: u32,
        channel: Option<&CompChannel>,
    ) -> Result<Cq, CqCreationError> {
        if capacity > MAX_CQE {
            return Err(CqCreationError::TooManyCqes(MAX_CQE));
        }
        Ok(Self {
            inner: Arc::new(CqInner {
                entries: Mutex::new(VecDeque::new()),
                armed: AtomicBool::new(false),
                channel: channel.cloned(),
                capacity,
            }),
        })
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        self.inner.capacity
    }

    /// Non-blockingly poll into the given buffer. Return the number of work
    /// completions polled.
    pub fn poll_into(&self, wc: &mut [Wc]) -> io::Result<usize> {
        let mut entries = self.inner.entries.lock();
        let n = wc.len().min(entries.len());
        for (slot, entry) in wc.iter_mut().zip(entries.drain(..n)) {
            *slot = entry;
        }
        Ok(n)
    }

    /// Request a completion event on the next completion.
    pub fn req_notify(&self) -> io::Result<()> {
        self.inner.armed.store(true, Ordering::Release);
        Ok(())
    }

    fn push(&self, wc: Wc) {
        self.inner.entries.lock().push_back(wc);
        if self.inner.armed.swap(false, Ordering::AcqRel) {
            if let Some(channel) = &self.inner.channel {
                channel.raise();
            }
        }
    }
}

/// Data arriving at a receive queue.
#[derive(Debug)]
struct Inbound {
    data: Vec<u8>,
    imm: Option<ImmData>,
    opcode: WcOpcode,
}

/// Posted receive WRs plus messages that arrived before a WR was available.
#[derive(Default)]
struct RecvQueue {
    wrs: VecDeque<RecvWr>,
    backlog: VecDeque<(Weak<QpInner>, Inbound)>,
}

impl RecvQueue {
    /// Accept `wrs` and pair them with the backlog.
    fn post(&mut self, wrs: &[RecvWr]) -> Vec<(Weak<QpInner>, RecvWr, Inbound)> {
        self.wrs.extend(wrs.iter().copied());
        let mut matched = Vec::new();
        while !self.backlog.is_empty() && !self.wrs.is_empty() {
            if let (Some((qp, inbound)), Some(wr)) = (self.backlog.pop_front(), self.wrs.pop_front()) {
                matched.push((qp, wr, inbound));
            }
        }
        matched
    }

    /// Take a WR for `inbound`, or park it in the backlog to keep ordering.
    fn take(&mut self, qp: &Arc<QpInner>, inbound: Inbound) -> Option<(RecvWr, Inbound)> {
        if self.backlog.is_empty() {
            if let Some(wr) = self.wrs.pop_front() {
                return Some((wr, inbound));
            }
        }
        self.backlog.push_back((Arc::downgrade(qp), inbound));
        None
    }
}

/// Shared receive queue.
#[derive(Clone)]
pub struct Srq {
    inner: Arc<Mutex<RecvQueue>>,
}

impl Srq {
    pub fn new(_pd: &Pd, max_wr: u32, _max_sge: u32) -> io::Result<Self> {
        if max_wr > MAX_QP_WR {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        Ok(Self {
            inner: Arc::new(Mutex::new(RecvQueue::default())),
        })
    }

    /// Post a list of receive work requests.
    pub fn post_recv(&self, wrs: &[RecvWr]) -> io::Result<()> {
        let matched = self.inner.lock().post(wrs);
        for (qp, wr, inbound) in matched {
            if let Some(qp) = qp.upgrade() {
                qp.complete_recv(wr, inbound);
            }
        }
        Ok(())
    }
}

struct QpInner {
    qpn: Qpn,
    state: Mutex<QpState>,
    peer: AtomicU32,
    send_cq: Cq,
    recv_cq: Cq,
    srq: Option<Srq>,
    rq: Mutex<RecvQueue>,
    caps: QpCaps,
}

impl Drop for QpInner {
    fn drop(&mut self) {
        fabric().qps.write().remove(&self.qpn);
    }
}

impl QpInner {
    #[inline]
    fn state(&self) -> QpState {
        *self.state.lock()
    }

    fn can_receive(&self) -> bool {
        matches!(self.state(), QpState::Rtr | QpState::Rts)
    }

    /// Hand `inbound` to this QP's receive queue.
    fn deliver(self: &Arc<Self>, inbound: Inbound) {
        let taken = match &self.srq {
            Some(srq) => srq.inner.lock().take(self, inbound),
            None => self.rq.lock().take(self, inbound),
        };
        if let Some((wr, inbound)) = taken {
            self.complete_recv(wr, inbound);
        }
    }

    fn complete_recv(&self, wr: RecvWr, inbound: Inbound) {
        let mut wc = Wc {
            wr_id: wr.wr_id,
            status: WcStatus::Success,
            opcode: inbound.opcode,
            byte_len: inbound.data.len() as u32,
            imm: inbound.imm,
            qp_num: self.qpn,
        };
        if !self.can_receive() {
            wc.status = WcStatus::WrFlushErr;
        } else if inbound.data.len() > wr.sge.length as usize {
            wc.status = WcStatus::LocLenErr;
        } else if !inbound.data.is_empty() {
            if !fabric().check(wr.sge.lkey, wr.sge.addr, inbound.data.len() as u64) {
                wc.status = WcStatus::LocProtErr;
            } else {
                // SAFETY: the destination lies in a registered region, which
                // the key check above verified.
                unsafe {
                    ptr::copy_nonoverlapping(
                        inbound.data.as_ptr(),
                        wr.sge.addr as *mut u8,
                        inbound.data.len(),
                    )
                };
            }
        }
        self.recv_cq.push(wc);
    }

    /// Flush the private receive queue into the receive CQ.
    fn flush_rq(&self) {
        let flushed: Vec<RecvWr> = {
            let mut rq = self.rq.lock();
            rq.backlog.clear();
            rq.wrs.drain(..).collect()
        };
        for wr in flushed {
            self.recv_cq.push(Wc {
                wr_id: wr.wr_id,
                status: WcStatus::WrFlushErr,
                opcode: WcOpcode::Recv,
                byte_len: 0,
                imm: None,
                qp_num: self.qpn,
            });
        }
    }

    fn set_error(&self) {
        *self.state.lock() = QpState::Error;
        if self.srq.is_none() {
            self.flush_rq();
        }
    }

    /// Execute one send work request, returning the completion status.
    fn execute(&self, wr: &SendWr) -> WcStatus {
        let fabric = fabric();
        let peer = match fabric.qp(self.peer.load(Ordering::Acquire)) {
            Some(peer) if peer.can_receive() => peer,
            _ => return WcStatus::RetryExcErr,
        };

        let (local_addr, local_len) = wr.sge.map_or((0, 0), |sge| (sge.addr, sge.length as u64));
        if local_len > 0 {
            let lkey = wr.sge.map_or(0, |sge| sge.lkey);
            if !fabric.check(lkey, local_addr, local_len) {
                return WcStatus::LocProtErr;
            }
        }
        let gather = || -> Vec<u8> {
            let mut data = vec![0u8; local_len as usize];
            if local_len > 0 {
                // SAFETY: the source lies in a registered region.
                unsafe {
                    ptr::copy_nonoverlapping(local_addr as *const u8, data.as_mut_ptr(), data.len())
                };
            }
            data
        };

        match wr.op {
            SendOp::Send | SendOp::SendWithImm(_) => {
                let imm = match wr.op {
                    SendOp::SendWithImm(imm) => Some(imm),
                    _ => None,
                };
                peer.deliver(Inbound {
                    data: gather(),
                    imm,
                    opcode: WcOpcode::Recv,
                });
            }
            SendOp::Write(remote) | SendOp::WriteWithImm(remote, _) => {
                if local_len > 0 {
                    if !fabric.check(remote.rkey, remote.addr, local_len) {
                        return WcStatus::RemAccessErr;
                    }
                    // SAFETY: both areas lie in registered regions.
                    unsafe {
                        ptr::copy(
                            local_addr as *const u8,
                            remote.addr as *mut u8,
                            local_len as usize,
                        )
                    };
                }
                if let SendOp::WriteWithImm(_, imm) = wr.op {
                    peer.deliver(Inbound {
                        data: Vec::new(),
                        imm: Some(imm),
                        opcode: WcOpcode::RecvRdmaImm,
                    });
                }
            }
            SendOp::Read(remote) => {
                if local_len > 0 {
                    if !fabric.check(remote.rkey, remote.addr, local_len) {
                        return WcStatus::RemAccessErr;
                    }
                    // SAFETY: both areas lie in registered regions.
                    unsafe {
                        ptr::copy(
                            remote.addr as *const u8,
                            local_addr as *mut u8,
                            local_len as usize,
                        )
                    };
                }
            }
        }
        WcStatus::Success
    }
}

/// Reliable-connected queue pair.
#[derive(Clone)]
pub struct Qp {
    inner: Arc<QpInner>,
}

impl std::fmt::Debug for Qp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Qp<{:#x}>", self.inner.qpn)
    }
}

impl Qp {
    pub fn new(_pd: &Pd, init_attr: QpInitAttr<'_>) -> Result<Qp, QpCreationError> {
        check_caps(&init_attr.caps, MAX_QP_WR, MAX_INLINE_DATA)?;

        let fabric = fabric();
        let qpn = fabric.next_qpn.fetch_add(1, Ordering::Relaxed) & 0x00ff_ffff;
        let inner = Arc::new(QpInner {
            qpn,
            state: Mutex::new(QpState::Reset),
            peer: AtomicU32::new(0),
            send_cq: init_attr.send_cq.clone(),
            recv_cq: init_attr.recv_cq.clone(),
            srq: init_attr.srq.cloned(),
            rq: Mutex::new(RecvQueue::default()),
            caps: init_attr.caps,
        });
        fabric.qps.write().insert(qpn, Arc::downgrade(&inner));
        Ok(Self { inner })
    }

    #[inline]
    pub fn qp_num(&self) -> Qpn {
        self.inner.qpn
    }

    #[inline]
    pub fn state(&self) -> QpState {
        self.inner.state()
    }

    #[inline]
    pub fn caps(&self) -> &QpCaps {
        &self.inner.caps
    }

    fn transition(&self, from: QpState, to: QpState) -> io::Result<()> {
        let mut state = self.inner.state.lock();
        if *state != from {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        *state = to;
        Ok(())
    }

    /// Modify the queue pair from RESET to INIT.
    pub fn modify_to_init(&self, _port_num: PortNum) -> io::Result<()> {
        self.transition(QpState::Reset, QpState::Init)
    }

    /// Modify the queue pair from INIT to RTR.
    pub fn modify_to_rtr(&self, attr: &RtrAttr) -> io::Result<()> {
        self.inner.peer.store(attr.dest_qpn, Ordering::Release);
        self.transition(QpState::Init, QpState::Rtr)
    }

    /// Modify the queue pair from RTR to RTS.
    pub fn modify_to_rts(&self, _attr: &RtsAttr) -> io::Result<()> {
        self.transition(QpState::Rtr, QpState::Rts)
    }

    /// Modify the queue pair to ERROR, flushing outstanding receive WRs.
    pub fn modify_to_error(&self) -> io::Result<()> {
        self.inner.set_error();
        Ok(())
    }

    /// Post a list of send work requests.
    pub fn post_send(&self, wrs: &[SendWr]) -> io::Result<()> {
        let inner = &self.inner;
        match inner.state() {
            QpState::Rts | QpState::Error => {}
            _ => return Err(io::Error::from_raw_os_error(libc::EINVAL)),
        }
        for wr in wrs {
            if wr.inline && wr.sge.map_or(0, |sge| sge.length) > inner.caps.max_inline_data {
                return Err(io::Error::from_raw_os_error(libc::EINVAL));
            }
        }

        for wr in wrs {
            let status = if inner.state() == QpState::Error {
                WcStatus::WrFlushErr
            } else {
                let status = inner.execute(wr);
                if status != WcStatus::Success {
                    inner.set_error();
                }
                status
            };
            if wr.signaled || status != WcStatus::Success {
                let (opcode, byte_len) = match wr.op {
                    SendOp::Send | SendOp::SendWithImm(_) => (WcOpcode::Send, 0),
                    SendOp::Write(_) | SendOp::WriteWithImm(..) => (WcOpcode::RdmaWrite, 0),
                    SendOp::Read(_) => (WcOpcode::RdmaRead, wr.sge.map_or(0, |sge| sge.length)),
                };
                inner.send_cq.push(Wc {
                    wr_id: wr.wr_id,
                    status,
                    opcode,
                    byte_len,
                    imm: None,
                    qp_num: inner.qpn,
                });
            }
        }
        Ok(())
    }

    /// Post a list of receive work requests.
    pub fn post_recv(&self, wrs: &[RecvWr]) -> io::Result<()> {
        let inner = &self.inner;
        if inner.srq.is_some() {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        if inner.state() == QpState::Error {
            for wr in wrs {
                inner.recv_cq.push(Wc {
                    wr_id: wr.wr_id,
                    status: WcStatus::WrFlushErr,
                    opcode: WcOpcode::Recv,
                    byte_len: 0,
                    imm: None,
                    qp_num: inner.qpn,
                });
            }
            return Ok(());
        }
        let matched = inner.rq.lock().post(wrs);
        for (_, wr, inbound) in matched {
            inner.complete_recv(wr, inbound);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Side {
        cq: Cq,
        qp: Qp,
        mr: Mr,
        _buf: Vec<u8>,
    }

    fn side(pd: &Pd, srq: Option<&Srq>) -> Side {
        let cq = Cq::new(pd.context(), 128, None).unwrap();
        let qp = Qp::new(
            pd,
            QpInitAttr {
                send_cq: &cq,
                recv_cq: &cq,
                srq,
                caps: QpCaps::default(),
            },
        )
        .unwrap();
        let mut buf = vec![0u8; 4096];
        let mr = unsafe { Mr::reg(pd, buf.as_mut_ptr(), buf.len()) }.unwrap();
        Side {
            cq,
            qp,
            mr,
            _buf: buf,
        }
    }

    fn connect(a: &Qp, b: &Qp) {
        for (x, y) in [(a, b), (b, a)] {
            x.modify_to_init(1).unwrap();
            x.modify_to_rtr(&RtrAttr {
                dest_qpn: y.qp_num(),
                rq_psn: 0,
                dlid: 1,
                dgid: Gid::default(),
                sl: 0,
                traffic_class: 0,
                path_mtu: 4096,
                min_rnr_timer: 12,
            })
            .unwrap();
            x.modify_to_rts(&RtsAttr {
                sq_psn: 0,
                timeout: 14,
                retry_cnt: 7,
                rnr_retry: 7,
            })
            .unwrap();
        }
    }

    fn poll_all(cq: &Cq) -> Vec<Wc> {
        let mut wc = [Wc::default(); 16];
        let n = cq.poll_into(&mut wc).unwrap();
        wc[..n].to_vec()
    }

    fn sge(mr: &Mr, off: usize, len: u32) -> Sge {
        Sge {
            addr: mr.addr() as u64 + off as u64,
            length: len,
            lkey: mr.lkey(),
        }
    }

    #[test]
    fn send_waits_for_a_receive() {
        let ctx = Context::open(None, 1, 0).unwrap();
        let pd = Pd::new(&ctx).unwrap();
        let (a, b) = (side(&pd, None), side(&pd, None));
        connect(&a.qp, &b.qp);

        unsafe { ptr::copy_nonoverlapping(b"ping".as_ptr(), a.mr.addr(), 4) };
        a.qp
            .post_send(&[SendWr {
                wr_id: 1,
                op: SendOp::SendWithImm(9),
                sge: Some(sge(&a.mr, 0, 4)),
                signaled: true,
                inline: true,
            }])
            .unwrap();
        assert_eq!(poll_all(&a.cq).len(), 1);
        assert!(poll_all(&b.cq).is_empty());

        b.qp
            .post_recv(&[RecvWr {
                wr_id: 7,
                sge: sge(&b.mr, 100, 64),
            }])
            .unwrap();
        let wcs = poll_all(&b.cq);
        assert_eq!(wcs.len(), 1);
        assert_eq!(wcs[0].wr_id(), 7);
        assert_eq!(wcs[0].ok(), Ok(4));
        assert_eq!(wcs[0].imm(), Some(9));
        assert_eq!(wcs[0].qp_num(), b.qp.qp_num());
        let got = unsafe { std::slice::from_raw_parts(b.mr.addr().add(100), 4) };
        assert_eq!(got, b"ping");
    }

    #[test]
    fn one_sided_access_checks_keys() {
        let ctx = Context::open(None, 1, 0).unwrap();
        let pd = Pd::new(&ctx).unwrap();
        let (a, b) = (side(&pd, None), side(&pd, None));
        connect(&a.qp, &b.qp);

        unsafe { ptr::write_bytes(b.mr.addr(), 0x5a, 128) };
        let remote = RemoteMem {
            addr: b.mr.addr() as u64,
            rkey: b.mr.rkey(),
        };
        a.qp
            .post_send(&[SendWr {
                wr_id: 2,
                op: SendOp::Read(remote),
                sge: Some(sge(&a.mr, 0, 128)),
                signaled: true,
                inline: false,
            }])
            .unwrap();
        let wcs = poll_all(&a.cq);
        assert_eq!(wcs[0].opcode(), WcOpcode::RdmaRead);
        assert_eq!(wcs[0].ok(), Ok(128));
        assert_eq!(unsafe { *a.mr.addr().add(127) }, 0x5a);

        let bad = RemoteMem {
            addr: remote.addr + 4000,
            rkey: remote.rkey,
        };
        a.qp
            .post_send(&[
                SendWr {
                    wr_id: 3,
                    op: SendOp::Write(bad),
                    sge: Some(sge(&a.mr, 0, 128)),
                    signaled: true,
                    inline: false,
                },
                SendWr {
                    wr_id: 4,
                    op: SendOp::Send,
                    sge: None,
                    signaled: true,
                    inline: false,
                },
            ])
            .unwrap();
        let wcs = poll_all(&a.cq);
        assert_eq!(wcs[0].status(), WcStatus::RemAccessErr);
        assert_eq!(wcs[1].status(), WcStatus::WrFlushErr);
        assert_eq!(a.qp.state(), QpState::Error);
    }

    #[test]
    fn srq_backlog_keeps_order_and_error_flushes() {
        let ctx = Context::open(None, 1, 0).unwrap();
        let pd = Pd::new(&ctx).unwrap();
        let srq = Srq::new(&pd, 16, 1).unwrap();
        let a = side(&pd, None);
        let b = side(&pd, Some(&srq));
        connect(&a.qp, &b.qp);

        for i in 0..3u8 {
            unsafe { *a.mr.addr().add(i as usize) = i };
            a.qp
                .post_send(&[SendWr {
                    wr_id: i as u64,
                    op: SendOp::Send,
                    sge: Some(sge(&a.mr, i as usize, 1)),
                    signaled: false,
                    inline: false,
                }])
                .unwrap();
        }
        let wrs: Vec<RecvWr> = (0..3)
            .map(|i| RecvWr {
                wr_id: 10 + i,
                sge: sge(&b.mr, 8 * i as usize, 8),
            })
            .collect();
        srq.post_recv(&wrs).unwrap();
        let wcs = poll_all(&b.cq);
        assert_eq!(wcs.iter().map(|wc| wc.wr_id()).collect::<Vec<_>>(), [10, 11, 12]);
        assert_eq!(unsafe { *b.mr.addr().add(16) }, 2);

        a.qp
            .post_recv(&[RecvWr {
                wr_id: 99,
                sge: sge(&a.mr, 0, 8),
            }])
            .unwrap();
        a.qp.modify_to_error().unwrap();
        let wcs = poll_all(&a.cq);
        assert_eq!(wcs.len(), 1);
        assert_eq!(wcs[0].status(), WcStatus::WrFlushErr);

        // The peer is gone from the fabric's point of view.
        b.qp
            .post_send(&[SendWr {
                wr_id: 5,
                op: SendOp::Send,
                sge: None,
                signaled: true,
                inline: false,
            }])
            .unwrap();
        assert_eq!(poll_all(&b.cq)[0].status(), WcStatus::RetryExcErr);
    }

    #[test]
    fn comp_channel_fires_once_per_arm() {
        let ctx = Context::open(None, 1, 0).unwrap();
        let channel = CompChannel::new(&ctx).unwrap();
        let cq = Cq::new(&ctx, 16, Some(&channel)).unwrap();
        cq.req_notify().unwrap();
        cq.push(Wc::default());
        cq.push(Wc::default());

        let mut val = 0u64;
        let n = unsafe { libc::read(channel.fd(), ptr::addr_of_mut!(val).cast(), 8) };
        assert_eq!(n, 8);
        assert_eq!(val, 1);
        channel.get_events().unwrap();
        assert_eq!(poll_all(&cq).len(), 2);
        assert!(Context::open(Some("mlx5_0"), 1, 0).is_err());
    }
}
