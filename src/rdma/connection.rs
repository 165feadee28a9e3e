use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use bytes::{Buf, Bytes, BytesMut};
use log::{debug, error, info, trace, warn};
use parking_lot::Mutex;

use super::prep::HandshakeRecord;
use super::rw::{RdmaRwWork, RW_WORK_BUFS_LIMIT};
use super::stack::RdmaWorker;
use super::verbs::{Qp, QpCaps, QpInitAttr, Qpn, RtrAttr, RtsAttr, SendOp, SendWr, Wc, WcStatus};
use super::wr::{make_wr_id, wr_kind, WrKind};
use crate::conn::{ConnBase, ConnId, ConnRef, Connection};
use crate::error::{MemError, MsgError, Result};
use crate::mem::RdmaBuffer;
use crate::msg::{Msg, MsgHeader, NodeAddr, TransportType, WireError};
use crate::tcp::MAX_PAYLOAD;
use crate::worker::MsgWorker;

/// Largest number of work requests posted at once.
const MAX_BATCH: usize = 32;

/// Delay before retrying a send stalled on buffer exhaustion.
const RETRY_DELAY_US: u64 = 1000;

const MIN_RNR_TIMER: u8 = 12;
const TIMEOUT: u8 = 14;
const RETRY_CNT: u8 = 7;
const RNR_RETRY: u8 = 7;

/// Connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RdmaStatus {
    Error = 0,
    /// The queue pair is being connected.
    Init = 1,
    CanWrite = 2,
    /// Closed locally; waiting for the peer to echo the fin.
    ClosingPositive = 3,
    /// Closed by the peer; the echo is on its way.
    ClosingPassive = 4,
    Closed = 5,
}

impl From<u8> for RdmaStatus {
    fn from(v: u8) -> Self {
        match v {
            1 => RdmaStatus::Init,
            2 => RdmaStatus::CanWrite,
            3 => RdmaStatus::ClosingPositive,
            4 => RdmaStatus::ClosingPassive,
            5 => RdmaStatus::Closed,
            _ => RdmaStatus::Error,
        }
    }
}

/// Teardown progress. A draining connection waits for the completions of
/// everything it posted before it forgets its queue pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Liveness {
    Active,
    /// Completions still expected.
    Draining(usize),
    Dead,
}

/// What an outstanding send work request holds on to.
enum TxSlot {
    Chunk { _buf: RdmaBuffer },
    Rw(RdmaRwWork),
    Fin,
    Imm,
}

/// Rebuilds messages from a stream of received chunks.
#[derive(Default)]
struct Reassembler {
    header: [u8; MsgHeader::LEN],
    header_got: usize,
    body: Option<(MsgHeader, BytesMut)>,
}

impl Reassembler {
    fn feed(&mut self, mut data: &[u8], out: &mut Vec<Msg>) -> Result<(), WireError> {
        while !data.is_empty() {
            if self.body.is_none() {
                let n = (MsgHeader::LEN - self.header_got).min(data.len());
                self.header[self.header_got..self.header_got + n].copy_from_slice(&data[..n]);
                self.header_got += n;
                data = &data[n..];
                if self.header_got < MsgHeader::LEN {
                    continue;
                }
                self.header_got = 0;
                let (h, _) = MsgHeader::decode(&self.header)?;
                let len = h.len as usize;
                if len > MAX_PAYLOAD {
                    return Err(WireError::TooLong(len, MAX_PAYLOAD));
                }
                if len == 0 {
                    out.push(Msg::from_parts(h, Bytes::new(), TransportType::Rdma));
                } else {
                    self.body = Some((h, BytesMut::with_capacity(len)));
                }
                continue;
            }

            let complete = match self.body.as_mut() {
                Some((h, buf)) => {
                    let n = (h.len as usize - buf.len()).min(data.len());
                    buf.extend_from_slice(&data[..n]);
                    data = &data[n..];
                    buf.len() == h.len as usize
                }
                None => false,
            };
            if complete {
                if let Some((h, buf)) = self.body.take() {
                    out.push(Msg::from_parts(h, buf.freeze(), TransportType::Rdma));
                }
            }
        }
        Ok(())
    }
}

struct ConnInner {
    liveness: Liveness,
    qp_errored: bool,
    tx_pieces: VecDeque<Bytes>,
    tx_bytes: usize,
    rw_queue: VecDeque<RdmaRwWork>,
    imm_queue: VecDeque<u32>,
    fin_pending: bool,
    tx_outstanding: usize,
    tx_inflight: HashMap<u64, TxSlot>,
    next_seq: u64,
    retry_scheduled: bool,
    /// Receive buffers on the private receive queue.
    rx_posted: usize,
    rx: Reassembler,
}

impl ConnInner {
    fn alloc_id(&mut self, kind: WrKind) -> u64 {
        self.next_seq += 1;
        make_wr_id(kind, self.next_seq)
    }
}

fn initial_psn() -> u32 {
    static CLOCK: OnceLock<quanta::Clock> = OnceLock::new();
    (CLOCK.get_or_init(quanta::Clock::new).raw() as u32) & 0x00ff_ffff
}

/// Copy queued pieces into `dst` until it is full or the queue is empty.
fn fill_chunk(pieces: &mut VecDeque<Bytes>, dst: &mut [u8]) -> usize {
    let mut off = 0;
    while off < dst.len() {
        let Some(front) = pieces.front_mut() else {
            break;
        };
        let n = front.len().min(dst.len() - off);
        dst[off..off + n].copy_from_slice(&front[..n]);
        off += n;
        if n == front.len() {
            pieces.pop_front();
        } else {
            front.advance(n);
        }
    }
    off
}

/// A message-framed connection over a reliable-connected queue pair.
///
/// Outbound messages are packed back to back into registered chunks of the
/// buffer unit size and sent two-sided; the receiver reassembles them from
/// the chunk stream. Every state change happens on the owning worker.
pub struct RdmaConnection {
    base: ConnBase,
    me: Weak<RdmaConnection>,
    worker: Arc<RdmaWorker>,
    qp: Qp,
    local: Mutex<HandshakeRecord>,
    peer: Mutex<Option<HandshakeRecord>>,
    status: AtomicU8,
    inner: Mutex<ConnInner>,
    submit_posted: AtomicBool,
    sent_chunks: AtomicU64,
    fin_received: AtomicBool,
}

impl fmt::Debug for RdmaConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RdmaConnection")
            .field("qpn", &self.qp.qp_num())
            .field("peer", &self.base.peer_addr())
            .field("status", &self.status())
            .finish()
    }
}

impl RdmaConnection {
    /// Create a queue pair on `worker` and move it to INIT. Without a shared
    /// receive queue, the private one is filled right away.
    pub(crate) fn new(worker: &Arc<RdmaWorker>, sl: u8, peer: Option<NodeAddr>) -> Result<Arc<Self>> {
        let params = worker.params();
        let caps = QpCaps {
            max_send_wr: params.send_queue_len,
            max_recv_wr: params.recv_queue_len,
            max_send_sge: 1,
            max_recv_sge: 1,
            max_inline_data: params.max_inline,
        };
        let qp = Qp::new(
            worker.pd(),
            QpInitAttr {
                send_cq: worker.tx_cq(),
                recv_cq: worker.rx_cq(),
                srq: worker.srq(),
                caps,
            },
        )?;
        qp.modify_to_init(params.port_num)?;

        let ctx = worker.pd().context();
        let local = HandshakeRecord {
            lid: ctx.lid(),
            qpn: qp.qp_num(),
            psn: initial_psn(),
            peer_qpn: 0,
            sl,
            gid: ctx.gid(),
        };
        let conn = Arc::new_cyclic(|me| Self {
            base: ConnBase::new(
                ConnId {
                    ttype: TransportType::Rdma,
                    id: qp.qp_num(),
                },
                worker.owner().clone(),
                peer,
            ),
            me: me.clone(),
            worker: worker.clone(),
            qp,
            local: Mutex::new(local),
            peer: Mutex::new(None),
            status: AtomicU8::new(RdmaStatus::Init as u8),
            inner: Mutex::new(ConnInner {
                liveness: Liveness::Active,
                qp_errored: false,
                tx_pieces: VecDeque::new(),
                tx_bytes: 0,
                rw_queue: VecDeque::new(),
                imm_queue: VecDeque::new(),
                fin_pending: false,
                tx_outstanding: 0,
                tx_inflight: HashMap::new(),
                next_seq: 0,
                retry_scheduled: false,
                rx_posted: 0,
                rx: Reassembler::default(),
            }),
            submit_posted: AtomicBool::new(false),
            sent_chunks: AtomicU64::new(0),
            fin_received: AtomicBool::new(false),
        });
        worker.register(conn.clone());

        if worker.srq().is_none() {
            let bufs = worker.mem().get_buffers(params.recv_queue_len as usize);
            if bufs.is_empty() {
                worker.unregister(conn.qp_num());
                return Err(MemError::Exhausted(worker.mem().allocator().region_count()).into());
            }
            let mut inner = conn.inner.lock();
            inner.rx_posted = bufs.len();
            if let Err(e) = worker.post_recv_buffers(Some(&conn.qp), bufs) {
                inner.rx_posted = 0;
                drop(inner);
                worker.unregister(conn.qp_num());
                return Err(e.into());
            }
        }
        debug!("rdma QP {:#x} created on rdma worker {}", conn.qp_num(), worker.id());
        Ok(conn)
    }

    #[inline]
    pub fn status(&self) -> RdmaStatus {
        RdmaStatus::from(self.status.load(Ordering::Acquire))
    }

    #[inline]
    fn set_status(&self, status: RdmaStatus) {
        self.status.store(status as u8, Ordering::Release);
    }

    #[inline]
    pub fn qp_num(&self) -> Qpn {
        self.qp.qp_num()
    }

    /// The record this side advertises.
    pub fn local_record(&self) -> HandshakeRecord {
        *self.local.lock()
    }

    pub fn peer_record(&self) -> Option<HandshakeRecord> {
        *self.peer.lock()
    }

    /// Number of two-sided chunks handed to the queue pair so far.
    #[inline]
    pub fn sent_chunks(&self) -> u64 {
        self.sent_chunks.load(Ordering::Relaxed)
    }

    /// Whether the peer's fin (or its echo of ours) has arrived.
    #[inline]
    pub fn fin_received(&self) -> bool {
        self.fin_received.load(Ordering::Acquire)
    }

    #[inline]
    fn conn_ref(&self) -> Option<ConnRef> {
        self.me.upgrade().map(|c| c as ConnRef)
    }

    pub(crate) fn adopt_service_level(&self, sl: u8) {
        self.local.lock().sl = sl;
    }

    /// Connect the queue pair to `peer`: INIT to RTR to RTS.
    pub(crate) fn activate(&self, peer: &HandshakeRecord) -> Result<()> {
        let local = {
            let mut local = self.local.lock();
            local.peer_qpn = peer.qpn;
            *local
        };
        let params = self.worker.params();
        let mtu = params.path_mtu.min(self.worker.pd().context().active_mtu());

        self.qp.modify_to_rtr(&RtrAttr {
            dest_qpn: peer.qpn,
            rq_psn: peer.psn,
            dlid: peer.lid,
            dgid: peer.gid,
            sl: local.sl,
            traffic_class: params.traffic_class,
            path_mtu: mtu,
            min_rnr_timer: MIN_RNR_TIMER,
        })?;
        self.qp.modify_to_rts(&RtsAttr {
            sq_psn: local.psn,
            timeout: TIMEOUT,
            retry_cnt: RETRY_CNT,
            rnr_retry: RNR_RETRY,
        })?;
        *self.peer.lock() = Some(*peer);
        debug!(
            "rdma QP {:#x} connected to QP {:#x} (mtu {}, sl {})",
            local.qpn, peer.qpn, mtu, local.sl
        );
        Ok(())
    }

    /// The handshake is over; start sending what was queued.
    pub(crate) fn set_writable(&self) {
        if self
            .status
            .compare_exchange(
                RdmaStatus::Init as u8,
                RdmaStatus::CanWrite as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            info!("rdma connection {:#x} to {:?} established", self.qp_num(), self.base.peer_addr());
            self.kick();
        }
    }

    /// Queue a batch of one-sided reads or writes.
    pub fn post_rdma_rw(&self, work: RdmaRwWork) -> Result<()> {
        if work.len() > RW_WORK_BUFS_LIMIT {
            return Err(MsgError::TooManyRwBufs(work.len()));
        }
        if !matches!(self.status(), RdmaStatus::Init | RdmaStatus::CanWrite) {
            return Err(MsgError::NotConnected);
        }
        {
            let mut inner = self.inner.lock();
            if inner.liveness != Liveness::Active {
                return Err(MsgError::NotConnected);
            }
            inner.rw_queue.push_back(work);
        }
        self.kick();
        Ok(())
    }

    /// Send a zero-length message carrying `imm`; the peer receives it as an
    /// `ImmData` message.
    pub fn post_imm_data(&self, imm: u32) -> Result<()> {
        if !matches!(self.status(), RdmaStatus::Init | RdmaStatus::CanWrite) {
            return Err(MsgError::NotConnected);
        }
        {
            let mut inner = self.inner.lock();
            if inner.liveness != Liveness::Active {
                return Err(MsgError::NotConnected);
            }
            inner.imm_queue.push_back(imm);
        }
        self.kick();
        Ok(())
    }

    /// Fail the connection from any thread.
    pub(crate) fn fault(&self) {
        self.on_owner(|conn| conn.shutdown(true));
    }

    /// Run `f` on the owning worker.
    fn on_owner(&self, f: impl FnOnce(&RdmaConnection) + Send + 'static) {
        let worker = self.base.worker();
        if worker.am_self() {
            f(self);
        } else if let Some(me) = self.me.upgrade() {
            worker.post_work(move || f(&me));
        }
    }

    /// Submit now if on the owner, otherwise post one submission.
    fn kick(&self) {
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
    }

    fn submit(&self) {
        let result = {
            let mut inner = self.inner.lock();
            self.submit_locked(&mut inner)
        };
        match result {
            Ok(true) => {
                if let Some(conn) = self.conn_ref() {
                    self.base.notify_write(&conn);
                }
            }
            Ok(false) => {}
            Err(e) => {
                error!("rdma {:#x} post failed: {}", self.qp_num(), e);
                self.shutdown(true);
            }
        }
    }

    /// Post immediate data, then read/write works, then message chunks, as
    /// far as the send queue allows. `Ok(true)` if every queued message
    /// went out.
    fn submit_locked(&self, inner: &mut ConnInner) -> io::Result<bool> {
        if self.status() != RdmaStatus::CanWrite || inner.liveness != Liveness::Active {
            return Ok(false);
        }
        let cap = self.worker.params().send_queue_len as usize;

        // Immediate data.
        let mut wrs = Vec::new();
        while let Some(&imm) = inner.imm_queue.front() {
            if wrs.len() == MAX_BATCH || inner.tx_outstanding + wrs.len() >= cap {
                break;
            }
            inner.imm_queue.pop_front();
            wrs.push(SendWr {
                wr_id: inner.alloc_id(WrKind::Imm),
                op: SendOp::SendWithImm(imm),
                sge: None,
                signaled: true,
                inline: false,
            });
        }
        if !wrs.is_empty() {
            self.qp.post_send(&wrs)?;
            inner.tx_outstanding += wrs.len();
            inner.tx_inflight.extend(wrs.iter().map(|wr| (wr.wr_id, TxSlot::Imm)));
            trace!("rdma {:#x} posted {} immediates", self.qp_num(), wrs.len());
        }

        // One-sided works, each as a whole.
        while let Some(work) = inner.rw_queue.front() {
            if inner.tx_outstanding + work.len() > cap {
                break;
            }
            let Some(mut work) = inner.rw_queue.pop_front() else {
                break;
            };
            let id = inner.alloc_id(WrKind::Rw);
            let wrs = work.start(id);
            if let Err(e) = self.qp.post_send(&wrs) {
                inner.rw_queue.push_front(work);
                return Err(e);
            }
            inner.tx_outstanding += wrs.len();
            inner.tx_inflight.insert(id, TxSlot::Rw(work));
            trace!("rdma {:#x} posted a work of {} pairs", self.qp_num(), wrs.len());
        }

        // Message chunks.
        let mem = self.worker.mem();
        let unit = mem.unit_size();
        let max_inline = self.worker.params().max_inline as usize;
        let mut wrote = false;
        while inner.tx_bytes > 0 {
            let free = cap.saturating_sub(inner.tx_outstanding);
            if free == 0 {
                break;
            }
            let want = inner.tx_bytes.div_ceil(unit).min(MAX_BATCH).min(free);
            let bufs = mem.get_buffers(want);
            if bufs.is_empty() {
                self.schedule_retry(inner);
                break;
            }

            let mut wrs = Vec::with_capacity(bufs.len());
            let mut slots = Vec::with_capacity(bufs.len());
            for mut buf in bufs {
                let len = fill_chunk(&mut inner.tx_pieces, &mut buf.as_mut_slice()[..unit]);
                if len == 0 {
                    break;
                }
                inner.tx_bytes -= len;
                buf.set_len(len);
                let wr_id = inner.alloc_id(WrKind::Send);
                wrs.push(SendWr {
                    wr_id,
                    op: SendOp::Send,
                    sge: Some(buf.sge(len)),
                    signaled: true,
                    inline: len < max_inline,
                });
                slots.push((wr_id, TxSlot::Chunk { _buf: buf }));
            }
            self.qp.post_send(&wrs)?;
            inner.tx_outstanding += wrs.len();
            inner.tx_inflight.extend(slots);
            self.sent_chunks.fetch_add(wrs.len() as u64, Ordering::Relaxed);
            trace!("rdma {:#x} posted {} chunks, {} bytes left", self.qp_num(), wrs.len(), inner.tx_bytes);
            wrote = true;
        }
        Ok(wrote && inner.tx_bytes == 0)
    }

    fn schedule_retry(&self, inner: &mut ConnInner) {
        if inner.retry_scheduled {
            return;
        }
        inner.retry_scheduled = true;
        warn!("rdma {:#x} is out of registered buffers, retrying", self.qp_num());
        let me = self.me.clone();
        self.base.worker().post_time_work(RETRY_DELAY_US, move || {
            if let Some(conn) = me.upgrade() {
                conn.inner.lock().retry_scheduled = false;
                conn.submit();
            }
        });
    }

    /// Post the close notification if one is pending and a slot is free.
    fn post_fin(&self, inner: &mut ConnInner) -> io::Result<()> {
        let cap = self.worker.params().send_queue_len as usize;
        if !inner.fin_pending || inner.tx_outstanding >= cap {
            return Ok(());
        }
        let wr_id = inner.alloc_id(WrKind::Fin);
        self.qp.post_send(&[SendWr {
            wr_id,
            op: SendOp::Send,
            sge: None,
            signaled: true,
            inline: false,
        }])?;
        inner.fin_pending = false;
        inner.tx_outstanding += 1;
        inner.tx_inflight.insert(wr_id, TxSlot::Fin);
        debug!("rdma {:#x} sent fin", self.qp_num());
        Ok(())
    }

    /// Stop the connection: flush what fits and announce the close, or
    /// fail it. The listener hears about it once; teardown completes when
    /// the queue pair has drained.
    fn shutdown(&self, fault: bool) {
        {
            let mut inner = self.inner.lock();
            match inner.liveness {
                Liveness::Active => {}
                // A failure while closing gives up on the echo.
                Liveness::Draining(_) if fault => {
                    if self.status() != RdmaStatus::Closed {
                        self.set_status(RdmaStatus::Error);
                    }
                    return;
                }
                _ => return,
            }
            if fault {
                if self.status() != RdmaStatus::Closed {
                    self.set_status(RdmaStatus::Error);
                }
            } else {
                match self.status() {
                    RdmaStatus::CanWrite => {
                        if let Err(e) = self.submit_locked(&mut inner) {
                            debug!("rdma {:#x} final submit failed: {}", self.qp_num(), e);
                        }
                        self.set_status(RdmaStatus::ClosingPositive);
                        inner.fin_pending = true;
                    }
                    RdmaStatus::ClosingPassive => inner.fin_pending = true,
                    RdmaStatus::Init => self.set_status(RdmaStatus::Closed),
                    _ => {}
                }
            }
            if inner.tx_bytes > 0 {
                debug!("rdma {:#x} drops {} unsent bytes", self.qp_num(), inner.tx_bytes);
            }
            inner.tx_pieces.clear();
            inner.tx_bytes = 0;
            inner.imm_queue.clear();
            inner.liveness = Liveness::Draining(0);
        }
        info!(
            "rdma connection {:#x} to {:?} {}",
            self.qp_num(),
            self.base.peer_addr(),
            if fault { "failed" } else { "closing" }
        );
        if let Some(conn) = self.conn_ref() {
            self.base.notify_error(&conn);
        }
        self.advance_drain();
    }

    /// Move teardown forward: send the pending fin, wait for send
    /// completions and for the peer's echo, flush the queue pair, wait for
    /// the flushed receives.
    fn advance_drain(&self) {
        let dead = {
            let mut inner = self.inner.lock();
            if !matches!(inner.liveness, Liveness::Draining(_)) {
                return;
            }
            let failed = self.status() == RdmaStatus::Error;
            if inner.fin_pending && !failed {
                if let Err(e) = self.post_fin(&mut inner) {
                    debug!("rdma {:#x} cannot send fin: {}", self.qp_num(), e);
                    inner.fin_pending = false;
                }
            }
            if !inner.qp_errored {
                let awaiting_echo = self.status() == RdmaStatus::ClosingPositive;
                if !failed && (inner.tx_outstanding > 0 || inner.fin_pending || awaiting_echo) {
                    inner.liveness = Liveness::Draining(inner.tx_outstanding + inner.rx_posted);
                    return;
                }
                inner.fin_pending = false;
                if let Err(e) = self.qp.modify_to_error() {
                    warn!("rdma {:#x} cannot enter the error state: {}", self.qp_num(), e);
                }
                inner.qp_errored = true;
            }
            let remaining = inner.tx_outstanding + inner.rx_posted;
            if remaining > 0 {
                inner.liveness = Liveness::Draining(remaining);
                false
            } else {
                inner.liveness = Liveness::Dead;
                true
            }
        };
        if dead {
            self.bury();
        }
    }

    /// Release everything and leave the worker.
    fn bury(&self) {
        let works: Vec<RdmaRwWork> = {
            let mut inner = self.inner.lock();
            let mut works: Vec<_> = inner.rw_queue.drain(..).collect();
            works.extend(inner.tx_inflight.drain().filter_map(|(_, slot)| match slot {
                TxSlot::Rw(work) => Some(work),
                _ => None,
            }));
            works
        };
        for mut work in works {
            work.fail_rest();
            work.finish();
        }
        if self.status() != RdmaStatus::Error {
            self.set_status(RdmaStatus::Closed);
        }
        self.worker.unregister(self.qp_num());
        info!("rdma connection {:#x} released ({:?})", self.qp_num(), self.status());
    }

    /// Tear down at once, without waiting for completions.
    pub(crate) fn abort(&self) {
        let was_active = {
            let mut inner = self.inner.lock();
            let was_active = inner.liveness == Liveness::Active;
            inner.liveness = Liveness::Dead;
            inner.tx_pieces.clear();
            inner.tx_bytes = 0;
            inner.imm_queue.clear();
            inner.fin_pending = false;
            was_active
        };
        if !matches!(self.status(), RdmaStatus::Closed) {
            self.set_status(RdmaStatus::Error);
        }
        if let Err(e) = self.qp.modify_to_error() {
            warn!("rdma {:#x} cannot enter the error state: {}", self.qp_num(), e);
        }
        if was_active {
            if let Some(conn) = self.conn_ref() {
                self.base.notify_error(&conn);
            }
        }
        self.bury();
    }

    fn after_completion(&self) {
        let draining = matches!(self.inner.lock().liveness, Liveness::Draining(_));
        if draining {
            self.advance_drain();
        } else {
            self.submit();
        }
    }

    /// Handle a send-side completion.
    pub(crate) fn on_send_completion(&self, wc: &Wc) {
        let status = wc.status();
        let mut finished = None;
        {
            let mut inner = self.inner.lock();
            inner.tx_outstanding = inner.tx_outstanding.saturating_sub(1);
            let wr_id = wc.wr_id();
            if wr_kind(wr_id) == Some(WrKind::Rw) {
                let done = match inner.tx_inflight.get_mut(&wr_id) {
                    Some(TxSlot::Rw(work)) => work.complete_one(status == WcStatus::Success),
                    _ => false,
                };
                if done {
                    if let Some(TxSlot::Rw(work)) = inner.tx_inflight.remove(&wr_id) {
                        finished = Some(work);
                    }
                }
            } else {
                inner.tx_inflight.remove(&wr_id);
            }
        }
        if let Some(work) = finished {
            work.finish();
        }

        match status {
            WcStatus::Success => {}
            WcStatus::WrFlushErr => debug!("rdma {:#x} send {:#x} flushed", self.qp_num(), wc.wr_id()),
            s => {
                error!("rdma {:#x} send {:#x} failed: {}", self.qp_num(), wc.wr_id(), s);
                self.shutdown(true);
            }
        }
        self.after_completion();
    }

    /// Handle a receive completion on `buf`.
    pub(crate) fn on_recv(&self, wc: &Wc, buf: RdmaBuffer) {
        let private_rq = self.worker.srq().is_none();
        let mut msgs = Vec::new();
        let mut fin = false;
        let mut fault = false;
        {
            let mut inner = self.inner.lock();
            if private_rq {
                inner.rx_posted = inner.rx_posted.saturating_sub(1);
            }
            match wc.status() {
                WcStatus::Success => {
                    if let Some(imm) = wc.imm() {
                        msgs.push(Msg::imm_data(imm));
                    } else if wc.bytes() == 0 {
                        fin = true;
                    } else {
                        let n = wc.bytes().min(buf.len());
                        trace!("rdma {:#x} received {} bytes", self.qp_num(), n);
                        if let Err(e) = inner.rx.feed(&buf.as_slice()[..n], &mut msgs) {
                            warn!("rdma {:#x} received a malformed stream: {}", self.qp_num(), e);
                            fault = true;
                        }
                    }
                }
                WcStatus::WrFlushErr => debug!("rdma {:#x} receive flushed", self.qp_num()),
                s => {
                    error!("rdma {:#x} receive failed: {}", self.qp_num(), s);
                    fault = true;
                }
            }

            let repost = if private_rq {
                inner.liveness == Liveness::Active && !fin && !fault
            } else {
                true
            };
            if repost {
                let qp = private_rq.then_some(&self.qp);
                if private_rq {
                    inner.rx_posted += 1;
                }
                if let Err(e) = self.worker.post_recv_buffers(qp, vec![buf]) {
                    warn!("rdma {:#x} cannot repost a receive: {}", self.qp_num(), e);
                    if private_rq {
                        inner.rx_posted -= 1;
                        fault = true;
                    }
                }
            }
        }

        if let Some(conn) = self.conn_ref() {
            for msg in msgs {
                self.base.deliver(&conn, msg);
            }
        }
        if fin {
            self.on_peer_fin();
        }
        if fault {
            self.shutdown(true);
        }
        self.after_completion();
    }

    /// A fin either answers ours or starts a passive close, which echoes
    /// it back before the queue pair is flushed.
    fn on_peer_fin(&self) {
        debug!("rdma {:#x} got fin in {:?}", self.qp_num(), self.status());
        self.fin_received.store(true, Ordering::Release);
        match self.status() {
            RdmaStatus::ClosingPositive => self.set_status(RdmaStatus::Closed),
            RdmaStatus::Init | RdmaStatus::CanWrite => {
                self.set_status(RdmaStatus::ClosingPassive);
                self.shutdown(false);
            }
            _ => {}
        }
    }
}

impl Connection for RdmaConnection {
    #[inline]
    fn id(&self) -> ConnId {
        self.base.id()
    }

    fn send_msg(&self, msg: Msg) -> Result<()> {
        if !matches!(self.status(), RdmaStatus::Init | RdmaStatus::CanWrite) {
            return Err(MsgError::NotConnected);
        }
        trace!("rdma {:#x} queue {:?}", self.qp_num(), msg.header());
        {
            let mut inner = self.inner.lock();
            if inner.liveness != Liveness::Active {
                return Err(MsgError::NotConnected);
            }
            for piece in msg.into_wire_pieces() {
                inner.tx_bytes += piece.len();
                inner.tx_pieces.push_back(piece);
            }
        }
        self.kick();
        Ok(())
    }

    fn close(&self) {
        self.on_owner(|conn| conn.shutdown(false));
    }

    #[inline]
    fn is_connected(&self) -> bool {
        self.status() == RdmaStatus::CanWrite
    }

    #[inline]
    fn is_closed(&self) -> bool {
        matches!(self.status(), RdmaStatus::Closed | RdmaStatus::Error)
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

    #[inline]
    fn as_rdma(&self) -> Option<&RdmaConnection> {
        Some(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::msg::MsgType;

    fn wire(msgs: &[Msg]) -> Vec<u8> {
        msgs.iter()
            .cloned()
            .flat_map(|m| m.into_wire_pieces())
            .flat_map(|b| b.to_vec())
            .collect()
    }

    #[test]
    fn reassembly_across_arbitrary_cuts() {
        let mut a = Msg::new(MsgType::Io);
        a.append_data(&[7u8; 300]);
        let b = Msg::new(MsgType::Ctl);
        let mut c = Msg::new(MsgType::Io);
        c.append_data(b"tail");
        let stream = wire(&[a, b, c]);

        for cut in [1, 5, 8, 64, 1000] {
            let mut rx = Reassembler::default();
            let mut out = Vec::new();
            for piece in stream.chunks(cut) {
                rx.feed(piece, &mut out).unwrap();
            }
            assert_eq!(out.len(), 3, "cut {}", cut);
            assert_eq!(out[0].payload_len(), 300);
            assert_eq!(out[1].msg_type(), MsgType::Ctl);
            assert_eq!(&out[2].flatten()[..], b"tail");
            assert!(out.iter().all(|m| m.transport() == Some(TransportType::Rdma)));
        }
    }

    #[test]
    fn chunks_are_packed_back_to_back() {
        let mut pieces: VecDeque<Bytes> =
            [&b"abc"[..], b"defgh", b"ij"].into_iter().map(Bytes::from_static).collect();
        let mut dst = [0u8; 4];
        assert_eq!(fill_chunk(&mut pieces, &mut dst), 4);
        assert_eq!(&dst, b"abcd");
        assert_eq!(fill_chunk(&mut pieces, &mut dst), 4);
        assert_eq!(&dst, b"efgh");
        assert_eq!(fill_chunk(&mut pieces, &mut dst), 2);
        assert_eq!(&dst[..2], b"ij");
        assert!(pieces.is_empty());
    }
}
