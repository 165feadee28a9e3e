//! RDMA transport.
//!
//! Connections are bootstrapped over a TCP control socket (see
//! [`RdmaPrepConn`]) and then carry framed messages over reliable-connected
//! queue pairs, plus one-sided reads and writes ([`RdmaRwWork`]).

pub mod verbs;

mod connection;
mod listen;
mod prep;
mod rw;
mod stack;
mod wr;

use std::net::{IpAddr, SocketAddr, TcpStream};
use std::ops::RangeInclusive;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use log::debug;

pub use self::connection::{RdmaConnection, RdmaStatus};
pub use self::listen::RdmaListenPort;
pub use self::prep::{HandshakeRecord, PrepStatus, RdmaPrepConn, RECORD_LEN};
pub use self::rw::{RdmaRwWork, RwCallback, RW_WORK_BUFS_LIMIT};
pub use self::stack::{RdmaManager, RdmaParams, RdmaWorker};
use self::prep::PrepRegistry;
use crate::config::MsgConfig;
use crate::conn::{ConnRef, ListenPortListener};
use crate::error::{MsgError, Result};
use crate::msg::{NodeAddr, TransportType};
use crate::tcp::net;
use crate::worker::{MsgWorker, WorkerPool};

struct StackInner {
    manager: RdmaManager,
    workers: Arc<WorkerPool>,
    preps: Arc<PrepRegistry>,
    next_prep: AtomicU64,
}

/// Factory of RDMA connections and listen ports. Cheap to clone.
#[derive(Clone)]
pub struct RdmaStack {
    inner: Arc<StackInner>,
}

impl RdmaStack {
    /// Open the RDMA device and start serving completions on `workers`.
    pub fn new(cfg: &MsgConfig, workers: Arc<WorkerPool>) -> Result<Self> {
        let manager = RdmaManager::new(cfg, &workers)?;
        Ok(Self {
            inner: Arc::new(StackInner {
                manager,
                workers,
                preps: Arc::new(PrepRegistry::default()),
                next_prep: AtomicU64::new(1),
            }),
        })
    }

    #[inline]
    pub fn manager(&self) -> &RdmaManager {
        &self.inner.manager
    }

    /// The worker handshakes and accepts run on.
    pub(crate) fn control_worker(&self) -> Option<MsgWorker> {
        self.inner.workers.get(0).cloned()
    }

    /// Connect to the control port at `addr` with the configured service
    /// level. Messages may be queued right away; they are sent once the
    /// handshake is over.
    pub fn connect(&self, addr: &NodeAddr) -> Result<ConnRef> {
        self.connect_with_sl(addr, self.manager().params().service_level)
    }

    pub fn connect_with_sl(&self, addr: &NodeAddr, sl: u8) -> Result<ConnRef> {
        let worker = self
            .manager()
            .lightest_load_rdma_worker()
            .ok_or(MsgError::Shutdown)?;
        let peer = NodeAddr::new(TransportType::Rdma, addr.socket_addr());
        let conn = RdmaConnection::new(worker, sl, Some(peer))?;

        let started = net::connect_nonblocking(addr.socket_addr())
            .map_err(MsgError::from)
            .and_then(|stream| self.start_prep(stream, false, conn.clone()));
        if let Err(e) = started {
            conn.fault();
            return Err(e);
        }
        Ok(conn)
    }

    /// Set up the passive side of a handshake on an accepted control socket.
    pub(crate) fn accept(&self, stream: TcpStream, peer: SocketAddr) -> Result<Arc<RdmaConnection>> {
        let worker = self
            .manager()
            .lightest_load_rdma_worker()
            .ok_or(MsgError::Shutdown)?;
        let sl = self.manager().params().service_level;
        let conn = RdmaConnection::new(worker, sl, Some(NodeAddr::new(TransportType::Rdma, peer)))?;
        if let Err(e) = self.start_prep(stream, true, conn.clone()) {
            conn.fault();
            return Err(e);
        }
        Ok(conn)
    }

    fn start_prep(&self, stream: TcpStream, server: bool, conn: Arc<RdmaConnection>) -> Result<()> {
        let worker = self.control_worker().ok_or(MsgError::Shutdown)?;
        let id = self.inner.next_prep.fetch_add(1, Ordering::Relaxed);
        let prep = RdmaPrepConn::new(id, stream, server, worker, conn, Arc::downgrade(&self.inner.preps))?;

        self.inner.preps.lock().insert(id, prep.clone());
        if let Err(e) = prep.start() {
            self.inner.preps.lock().remove(&id);
            return Err(e.into());
        }
        Ok(())
    }

    pub fn create_listen_port(
        &self,
        ip: IpAddr,
        ports: RangeInclusive<u16>,
        handler: Weak<dyn ListenPortListener>,
    ) -> Result<Arc<RdmaListenPort>> {
        RdmaListenPort::bind(ip, ports, self.clone(), handler)
    }

    /// Number of handshakes in progress.
    pub fn prep_conn_num(&self) -> usize {
        self.inner.preps.lock().len()
    }

    /// Abort pending handshakes and every connection.
    pub fn stop(&self) {
        let preps: Vec<_> = self.inner.preps.lock().drain().map(|(_, p)| p).collect();
        if !preps.is_empty() {
            debug!("aborting {} handshakes", preps.len());
        }
        for prep in preps {
            prep.abort();
        }
        self.inner.manager.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::{self, Connection, ConnectionListener};
    use crate::msg::{Msg, MsgHeader, MsgType, RdmaBufDesc};
    use std::io::{Read, Write};
    use std::net::{Ipv4Addr, TcpListener};
    use std::sync::mpsc::{self, Receiver, Sender};
    use std::sync::Mutex;
    use std::time::{Duration, Instant};

    struct Sink {
        conns: Mutex<Vec<ConnRef>>,
        me: Weak<Sink>,
        msgs: Mutex<Sender<Msg>>,
        errors: Mutex<Sender<()>>,
    }

    impl Sink {
        fn new() -> (Arc<Self>, Receiver<Msg>, Receiver<()>) {
            let (mtx, mrx) = mpsc::channel();
            let (etx, erx) = mpsc::channel();
            let sink = Arc::new_cyclic(|me| Sink {
                conns: Mutex::new(Vec::new()),
                me: me.clone(),
                msgs: Mutex::new(mtx),
                errors: Mutex::new(etx),
            });
            (sink, mrx, erx)
        }

        fn adopt(&self, conn: &ConnRef) {
            let me: Weak<dyn ConnectionListener> = self.me.clone();
            conn::set_listener(conn, me);
            self.conns.lock().unwrap().push(conn.clone());
        }

        fn first(&self) -> Option<ConnRef> {
            self.conns.lock().unwrap().first().cloned()
        }
    }

    impl ConnectionListener for Sink {
        fn on_conn_recv(&self, _conn: &ConnRef, msg: Msg) {
            let _ = self.msgs.lock().unwrap().send(msg);
        }

        fn on_conn_error(&self, _conn: &ConnRef) {
            let _ = self.errors.lock().unwrap().send(());
        }
    }

    impl ListenPortListener for Sink {
        fn on_new_connection(&self, conn: ConnRef) {
            self.adopt(&conn);
        }
    }

    fn wait_until(what: &str, mut cond: impl FnMut() -> bool) -> anyhow::Result<()> {
        let deadline = Instant::now() + Duration::from_secs(10);
        while !cond() {
            anyhow::ensure!(Instant::now() < deadline, "timed out waiting for {}", what);
            std::thread::sleep(Duration::from_millis(2));
        }
        Ok(())
    }

    fn config() -> MsgConfig {
        MsgConfig {
            worker_num: 3,
            rdma_enable: true,
            rdma_buffer_size: 64 << 10,
            rdma_recv_queue_len: 64,
            rdma_enable_hugepage: false,
            rdma_mem_max_level: 22,
            ..Default::default()
        }
    }

    struct Fixture {
        pool: Arc<WorkerPool>,
        stack: RdmaStack,
        port: Arc<RdmaListenPort>,
        server: Arc<Sink>,
        server_rx: Receiver<Msg>,
        server_err: Receiver<()>,
    }

    impl Fixture {
        fn new() -> anyhow::Result<Self> {
            let cfg = config();
            let pool = Arc::new(WorkerPool::new(cfg.worker_num, &[])?);
            pool.start()?;
            let stack = RdmaStack::new(&cfg, pool.clone())?;
            let (server, server_rx, server_err) = Sink::new();
            let handler: Weak<dyn ListenPortListener> = Arc::downgrade(&server) as _;
            let port = stack.create_listen_port(IpAddr::V4(Ipv4Addr::LOCALHOST), 0..=0, handler)?;
            Ok(Self {
                pool,
                stack,
                port,
                server,
                server_rx,
                server_err,
            })
        }

        /// Connect and wait until both ends are writable.
        fn connect(&self, client: &Sink) -> anyhow::Result<(ConnRef, ConnRef)> {
            let conn = self.stack.connect(&self.port.addr())?;
            client.adopt(&conn);
            wait_until("client", || conn.is_connected())?;
            wait_until("server", || self.server.first().is_some_and(|c| c.is_connected()))?;
            let accepted = self.server.first().ok_or_else(|| anyhow::anyhow!("no server side"))?;
            Ok((conn, accepted))
        }

        fn stop(self) {
            self.port.close();
            self.stack.stop();
            self.pool.stop();
        }
    }

    #[test]
    fn large_message_is_chunked_and_reassembled() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let (client, _, client_err) = Sink::new();
        let (conn, accepted) = fx.connect(&client)?;

        let client_qp = conn.as_rdma().map(|c| c.local_record());
        let server_qp = accepted.as_rdma().map(|c| c.local_record());
        assert_eq!(client_qp.map(|r| r.peer_qpn), server_qp.map(|r| r.qpn));
        assert_eq!(server_qp.map(|r| r.peer_qpn), client_qp.map(|r| r.qpn));
        assert_eq!(fx.stack.prep_conn_num(), 0);

        const LEN: usize = 10 << 20;
        let payload: Vec<u8> = (0..LEN).map(|i| (i % 251) as u8).collect();
        let mut msg = Msg::new(MsgType::Io);
        msg.append_data(&payload);
        conn.send_msg(msg)?;

        let got = fx.server_rx.recv_timeout(Duration::from_secs(20))?;
        assert_eq!(got.msg_type(), MsgType::Io);
        assert_eq!(got.transport(), Some(TransportType::Rdma));
        assert!(got.flatten()[..] == payload[..]);
        let chunk = config().rdma_buffer_size;
        let expected = (LEN + MsgHeader::LEN).div_ceil(chunk) as u64;
        // The header spills the message into one extra chunk.
        assert_eq!(expected, (LEN / chunk) as u64 + 1);
        assert_eq!(conn.as_rdma().map(|c| c.sent_chunks()), Some(expected));

        conn.as_rdma().map(|c| c.post_imm_data(0xfeed)).transpose()?;
        let imm = fx.server_rx.recv_timeout(Duration::from_secs(5))?;
        assert_eq!(imm.msg_type(), MsgType::ImmData);
        assert_eq!(&imm.flatten()[..], &0xfeedu32.to_le_bytes());

        conn.close();
        client_err.recv_timeout(Duration::from_secs(5))?;
        fx.server_err.recv_timeout(Duration::from_secs(5))?;
        wait_until("teardown", || conn.is_closed() && accepted.is_closed())?;
        // The initiator only finishes once the peer echoed its fin.
        assert_eq!(conn.as_rdma().map(|c| c.fin_received()), Some(true));
        assert_eq!(accepted.as_rdma().map(|c| c.fin_received()), Some(true));
        assert_eq!(conn.as_rdma().map(|c| c.status()), Some(RdmaStatus::Closed));
        assert_eq!(accepted.as_rdma().map(|c| c.status()), Some(RdmaStatus::Closed));
        assert!(conn.send_msg(Msg::new(MsgType::Ctl)).is_err());

        fx.stop();
        Ok(())
    }

    #[test]
    fn rw_work_records_failed_pairs() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let (client, _, _) = Sink::new();
        let (conn, _accepted) = fx.connect(&client)?;
        let mem = fx.stack.manager().mem();

        let target = mem.get_buffer().ok_or_else(|| anyhow::anyhow!("no buffer"))?;
        let mut bufs = mem.get_buffers(2);
        anyhow::ensure!(bufs.len() == 2);
        for buf in &mut bufs {
            buf.as_mut_slice()[..64].fill(0xab);
            buf.set_len(64);
        }
        let good = RdmaBufDesc {
            len: 64,
            ..target.desc()
        };
        let bad = RdmaBufDesc { rkey: 0, ..good };
        let pairs = bufs.into_iter().zip([good, bad]).collect();

        let (tx, rx) = mpsc::channel();
        let work = RdmaRwWork::write(pairs, 0, move |work| {
            let _ = tx.send(work.failed_indexes().to_vec());
        });
        conn.as_rdma().map(|c| c.post_rdma_rw(work)).transpose()?;

        assert_eq!(rx.recv_timeout(Duration::from_secs(5))?, vec![1]);
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        assert!(target.as_slice()[..64].iter().all(|&b| b == 0xab));

        // A remote access error is fatal to the connection.
        wait_until("fault", || conn.is_closed())?;
        assert_eq!(conn.as_rdma().map(|c| c.status()), Some(RdmaStatus::Error));

        let too_many = (0..RW_WORK_BUFS_LIMIT + 1)
            .filter_map(|_| mem.get_buffer())
            .map(|buf| (buf, good))
            .collect();
        let work = RdmaRwWork::read(too_many, |_| {});
        assert!(matches!(
            conn.as_rdma().map(|c| c.post_rdma_rw(work)),
            Some(Err(MsgError::TooManyRwBufs(9)))
        ));

        fx.stop();
        Ok(())
    }

    #[test]
    fn mismatched_handshake_never_becomes_writable() -> anyhow::Result<()> {
        let cfg = config();
        let pool = Arc::new(WorkerPool::new(cfg.worker_num, &[])?);
        pool.start()?;
        let stack = RdmaStack::new(&cfg, pool.clone())?;

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
        let addr = NodeAddr::new(TransportType::Rdma, listener.local_addr()?);
        let fake = std::thread::spawn(move || -> anyhow::Result<()> {
            let (mut s, _) = listener.accept()?;
            let mut buf = [0u8; RECORD_LEN];
            s.read_exact(&mut buf)?;
            let theirs = HandshakeRecord::parse(&buf)?;
            let bogus = HandshakeRecord {
                lid: 1,
                qpn: 0x7f_ffff,
                psn: 1,
                peer_qpn: theirs.qpn ^ 1,
                sl: 0,
                gid: theirs.gid,
            };
            s.write_all(&bogus.encode())?;
            // Until the client hangs up.
            let _ = s.read(&mut buf);
            Ok(())
        });

        let (client, _, client_err) = Sink::new();
        let conn = stack.connect(&addr)?;
        client.adopt(&conn);
        client_err.recv_timeout(Duration::from_secs(5))?;
        wait_until("fault", || conn.is_closed())?;
        let rdma = conn.as_rdma().ok_or_else(|| anyhow::anyhow!("not rdma"))?;
        assert_eq!(rdma.status(), RdmaStatus::Error);
        assert!(rdma.peer_record().is_none());
        wait_until("handshake cleanup", || stack.prep_conn_num() == 0)?;
        fake.join().map_err(|_| anyhow::anyhow!("fake server panicked"))??;

        stack.stop();
        pool.stop();
        Ok(())
    }

    #[test]
    fn passive_side_rejects_a_bad_ack() -> anyhow::Result<()> {
        let fx = Fixture::new()?;
        let ctx = fx.stack.manager().context();
        let mut mine = HandshakeRecord {
            lid: ctx.lid(),
            qpn: 0x7f_ffff,
            psn: 1,
            peer_qpn: 0,
            sl: 2,
            gid: ctx.gid(),
        };
        let mut s = std::net::TcpStream::connect(fx.port.addr().socket_addr())?;
        s.set_read_timeout(Some(Duration::from_secs(5)))?;
        s.write_all(&mine.encode())?;
        let mut buf = [0u8; RECORD_LEN];
        s.read_exact(&mut buf)?;
        let theirs = HandshakeRecord::parse(&buf)?;
        assert_eq!(theirs.peer_qpn, mine.qpn);
        assert_eq!(theirs.sl, 2);

        // Acknowledge some other queue pair.
        mine.peer_qpn = theirs.qpn ^ 1;
        s.write_all(&mine.encode())?;

        fx.server_err.recv_timeout(Duration::from_secs(5))?;
        let accepted = fx.server.first().ok_or_else(|| anyhow::anyhow!("no server side"))?;
        wait_until("fault", || accepted.is_closed())?;
        assert!(!accepted.is_connected());
        assert_eq!(accepted.as_rdma().map(|c| c.status()), Some(RdmaStatus::Error));
        wait_until("handshake cleanup", || fx.stack.prep_conn_num() == 0)?;
        // The control socket is shut down.
        assert_eq!(s.read(&mut buf)?, 0);

        fx.stop();
        Ok(())
    }
}
