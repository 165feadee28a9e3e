use std::collections::HashMap;
use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, error, info, warn};
use parking_lot::Mutex;

use super::verbs::{CompChannel, Context, Cq, Pd, Qp, Qpn, RecvWr, Srq, Wc, WrId};
use super::wr::{make_wr_id, WrKind};
use super::RdmaConnection;
use crate::config::MsgConfig;
use crate::error::{MemError, MsgError, Result};
use crate::event::{EventCallback, Interest};
use crate::mem::{MemoryManager, RdmaBuffer};
use crate::worker::{MsgWorker, PollerId, WorkerPool};

/// Depth of each completion queue.
const CQ_DEPTH: u32 = 8192;

/// Completions polled per batch.
const CQ_BATCH: usize = 16;

/// RDMA settings taken from the configuration.
#[derive(Debug, Clone)]
pub struct RdmaParams {
    pub port_num: u8,
    pub max_inline: u32,
    pub send_queue_len: u32,
    pub recv_queue_len: u32,
    pub enable_srq: bool,
    pub traffic_class: u8,
    pub service_level: u8,
    pub path_mtu: u32,
    pub poll_event: bool,
}

impl RdmaParams {
    pub fn from_config(cfg: &MsgConfig) -> Self {
        Self {
            port_num: cfg.rdma_port_num,
            max_inline: cfg.rdma_max_inline_data,
            send_queue_len: cfg.rdma_send_queue_len,
            recv_queue_len: cfg.rdma_recv_queue_len,
            enable_srq: cfg.rdma_enable_srq,
            traffic_class: cfg.rdma_traffic_class,
            service_level: cfg.rdma_service_level,
            path_mtu: cfg.rdma_path_mtu,
            poll_event: cfg.rdma_poll_event,
        }
    }
}

/// A pair of completion queues, served by one message worker, and the
/// connections whose queue pairs use them.
pub struct RdmaWorker {
    id: usize,
    owner: MsgWorker,
    pd: Pd,
    mem: Arc<MemoryManager>,
    params: RdmaParams,
    tx_cq: Cq,
    rx_cq: Cq,
    channel: Option<CompChannel>,
    srq: Option<Srq>,
    conns: Mutex<HashMap<Qpn, Arc<RdmaConnection>>>,
    /// Posted receive buffers by work request ID.
    rx_bufs: Mutex<HashMap<WrId, RdmaBuffer>>,
    next_rx_id: AtomicU64,
    poller: Mutex<Option<PollerId>>,
}

impl fmt::Debug for RdmaWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RdmaWorker")
            .field("id", &self.id)
            .field("owner", &self.owner.id())
            .field("conns", &self.conn_num())
            .finish()
    }
}

impl RdmaWorker {
    pub fn new(
        id: usize,
        owner: MsgWorker,
        pd: Pd,
        mem: Arc<MemoryManager>,
        params: RdmaParams,
    ) -> Result<Arc<Self>> {
        let ctx = pd.context();
        let channel = if params.poll_event {
            Some(CompChannel::new(ctx)?)
        } else {
            None
        };
        let tx_cq = Cq::new(ctx, CQ_DEPTH, channel.as_ref())?;
        let rx_cq = Cq::new(ctx, CQ_DEPTH, channel.as_ref())?;
        let srq = if params.enable_srq {
            Some(Srq::new(&pd, params.recv_queue_len, 1)?)
        } else {
            None
        };

        let worker = Arc::new(Self {
            id,
            owner,
            pd,
            mem,
            params,
            tx_cq,
            rx_cq,
            channel,
            srq,
            conns: Mutex::new(HashMap::new()),
            rx_bufs: Mutex::new(HashMap::new()),
            next_rx_id: AtomicU64::new(0),
            poller: Mutex::new(None),
        });

        if worker.srq.is_some() {
            let bufs = worker.mem.get_buffers(worker.params.recv_queue_len as usize);
            if bufs.is_empty() {
                return Err(MemError::Exhausted(worker.mem.allocator().region_count()).into());
            }
            let n = worker.post_recv_buffers(None, bufs)?;
            debug!("rdma worker {} filled its SRQ with {} buffers", id, n);
        }
        worker.arm()?;
        info!(
            "rdma worker {} on worker {} ({})",
            id,
            worker.owner.id(),
            if worker.channel.is_some() { "event" } else { "polling" }
        );
        Ok(worker)
    }

    /// Get completions delivered to the owner: through the completion
    /// channel, or by a poller run every loop iteration.
    fn arm(self: &Arc<Self>) -> io::Result<()> {
        match &self.channel {
            Some(channel) => {
                self.tx_cq.req_notify()?;
                self.rx_cq.req_notify()?;
                self.owner.set_event(channel.fd(), Interest::READABLE, self.clone())
            }
            None => {
                let me = Arc::downgrade(self);
                let id = self.owner.reg_poller(move || {
                    if let Some(worker) = me.upgrade() {
                        worker.poll_cq();
                    }
                });
                *self.poller.lock() = Some(id);
                Ok(())
            }
        }
    }

    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    /// The message worker completions are processed on.
    #[inline]
    pub fn owner(&self) -> &MsgWorker {
        &self.owner
    }

    #[inline]
    pub fn pd(&self) -> &Pd {
        &self.pd
    }

    #[inline]
    pub fn mem(&self) -> &MemoryManager {
        &self.mem
    }

    #[inline]
    pub fn params(&self) -> &RdmaParams {
        &self.params
    }

    #[inline]
    pub fn tx_cq(&self) -> &Cq {
        &self.tx_cq
    }

    #[inline]
    pub fn rx_cq(&self) -> &Cq {
        &self.rx_cq
    }

    #[inline]
    pub fn srq(&self) -> Option<&Srq> {
        self.srq.as_ref()
    }

    pub fn conn(&self, qpn: Qpn) -> Option<Arc<RdmaConnection>> {
        self.conns.lock().get(&qpn).cloned()
    }

    pub fn conn_num(&self) -> usize {
        self.conns.lock().len()
    }

    pub(crate) fn register(&self, conn: Arc<RdmaConnection>) {
        self.conns.lock().insert(conn.qp_num(), conn);
        self.owner.update_job_num(1);
    }

    pub(crate) fn unregister(&self, qpn: Qpn) {
        if self.conns.lock().remove(&qpn).is_some() {
            self.owner.update_job_num(-1);
        }
    }

    /// Post `bufs` as receives on `qp`, or on the shared receive queue when
    /// `qp` is `None`. Return how many were posted.
    pub(crate) fn post_recv_buffers(&self, qp: Option<&Qp>, bufs: Vec<RdmaBuffer>) -> io::Result<usize> {
        let unit = self.mem.unit_size();
        let mut wrs = Vec::with_capacity(bufs.len());
        {
            let mut table = self.rx_bufs.lock();
            for buf in bufs {
                let seq = self.next_rx_id.fetch_add(1, Ordering::Relaxed);
                let wr_id = make_wr_id(WrKind::Recv, seq);
                wrs.push(RecvWr {
                    wr_id,
                    sge: buf.sge(unit),
                });
                table.insert(wr_id, buf);
            }
        }

        let ret = match (qp, &self.srq) {
            (Some(qp), _) => qp.post_recv(&wrs),
            (None, Some(srq)) => srq.post_recv(&wrs),
            (None, None) => Err(io::Error::from_raw_os_error(libc::EINVAL)),
        };
        if let Err(e) = ret {
            let mut table = self.rx_bufs.lock();
            for wr in &wrs {
                table.remove(&wr.wr_id);
            }
            return Err(e);
        }
        Ok(wrs.len())
    }

    fn process_cq(&self) {
        if let Some(channel) = &self.channel {
            if let Err(e) = channel.get_events() {
                warn!("rdma worker {} cannot read completion events: {}", self.id, e);
            }
            for cq in [&self.tx_cq, &self.rx_cq] {
                if let Err(e) = cq.req_notify() {
                    error!("rdma worker {} cannot rearm its CQ: {}", self.id, e);
                }
            }
        }
        self.poll_cq();
    }

    /// Reap both queues until they are empty.
    fn poll_cq(&self) {
        let mut wc = [Wc::default(); CQ_BATCH];
        loop {
            let rx = self.poll_batch(&self.rx_cq, &mut wc);
            for wc in &wc[..rx] {
                self.handle_recv(wc);
            }
            let tx = self.poll_batch(&self.tx_cq, &mut wc);
            for wc in &wc[..tx] {
                self.handle_send(wc);
            }
            if rx == 0 && tx == 0 {
                break;
            }
        }
    }

    fn poll_batch(&self, cq: &Cq, wc: &mut [Wc]) -> usize {
        cq.poll_into(wc).unwrap_or_else(|e| {
            error!("rdma worker {} cannot poll its CQ: {}", self.id, e);
            0
        })
    }

    fn handle_recv(&self, wc: &Wc) {
        let Some(buf) = self.rx_bufs.lock().remove(&wc.wr_id()) else {
            warn!("rdma worker {} got an unknown receive {:#x}", self.id, wc.wr_id());
            return;
        };
        match self.conn(wc.qp_num()) {
            Some(conn) => conn.on_recv(wc, buf),
            None => {
                debug!("receive on released QP {:#x}: {}", wc.qp_num(), wc.status());
                if self.srq.is_some() {
                    if let Err(e) = self.post_recv_buffers(None, vec![buf]) {
                        warn!("rdma worker {} cannot repost a receive: {}", self.id, e);
                    }
                }
            }
        }
    }

    fn handle_send(&self, wc: &Wc) {
        match self.conn(wc.qp_num()) {
            Some(conn) => conn.on_send_completion(wc),
            None => debug!("send completion on released QP {:#x}: {}", wc.qp_num(), wc.status()),
        }
    }

    /// Leave the reactor and abort every connection.
    pub fn stop(&self) {
        if let Some(channel) = &self.channel {
            if let Err(e) = self.owner.del_event(channel.fd()) {
                debug!("rdma worker {} cannot leave the reactor: {}", self.id, e);
            }
        }
        if let Some(id) = self.poller.lock().take() {
            self.owner.unreg_poller(id);
        }
        let conns: Vec<_> = self.conns.lock().values().cloned().collect();
        for conn in conns {
            conn.abort();
        }
        self.rx_bufs.lock().clear();
    }
}

impl EventCallback for RdmaWorker {
    fn on_readable(&self) {
        self.process_cq();
    }

    fn on_error(&self) {
        error!("rdma worker {} completion channel failed", self.id);
    }
}

/// The RDMA device and the workers serving its completion queues.
pub struct RdmaManager {
    ctx: Context,
    pd: Pd,
    mem: Arc<MemoryManager>,
    params: RdmaParams,
    workers: Vec<Arc<RdmaWorker>>,
}

impl fmt::Debug for RdmaManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RdmaManager")
            .field("workers", &self.workers.len())
            .field("params", &self.params)
            .finish()
    }
}

impl RdmaManager {
    /// Open the device and create the RDMA workers. With more than one
    /// message worker, worker 0 is left to accepts and handshakes.
    pub fn new(cfg: &MsgConfig, pool: &WorkerPool) -> Result<Self> {
        let dev = Some(cfg.rdma_device_name.as_str()).filter(|name| !name.is_empty());
        let ctx = Context::open(dev, cfg.rdma_port_num, cfg.rdma_gid_index)?;
        let pd = Pd::new(&ctx)?;
        let mem = Arc::new(MemoryManager::new(&pd, cfg)?);
        let params = RdmaParams::from_config(cfg);

        let n = pool.len();
        let workers = (0..cfg.cq_pair_num())
            .map(|i| {
                let idx = if n > 1 { i % (n - 1) + 1 } else { 0 };
                let owner = pool.get(idx).cloned().ok_or(MsgError::Shutdown)?;
                RdmaWorker::new(i, owner, pd.clone(), mem.clone(), params.clone())
            })
            .collect::<Result<Vec<_>>>()?;
        info!(
            "rdma device ready: lid {}, gid {}, {} workers, {} byte units",
            ctx.lid(),
            ctx.gid(),
            workers.len(),
            mem.unit_size()
        );
        Ok(Self {
            ctx,
            pd,
            mem,
            params,
            workers,
        })
    }

    #[inline]
    pub fn context(&self) -> &Context {
        &self.ctx
    }

    #[inline]
    pub fn pd(&self) -> &Pd {
        &self.pd
    }

    #[inline]
    pub fn mem(&self) -> &Arc<MemoryManager> {
        &self.mem
    }

    #[inline]
    pub fn params(&self) -> &RdmaParams {
        &self.params
    }

    #[inline]
    pub fn workers(&self) -> &[Arc<RdmaWorker>] {
        &self.workers
    }

    /// The worker with the fewest connections; the lowest id wins ties.
    pub fn lightest_load_rdma_worker(&self) -> Option<&Arc<RdmaWorker>> {
        self.workers.iter().min_by_key(|w| w.conn_num())
    }

    pub fn stop(&self) {
        for w in &self.workers {
            w.stop();
        }
    }
}
