//! Listen ports, sessions and identity declarations.

use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Weak};

use log::{debug, info, trace, warn};
use parking_lot::{Mutex, RwLock};

use crate::config::ListenSpec;
use crate::conn::{self, ConnId, ConnRef, ConnectionListener, ListenPortListener};
use crate::error::{MsgError, Result};
use crate::msg::{DeclareId, Msg, MsgType, MsgerId, NodeAddr, TransportType};
use crate::rdma::{RdmaListenPort, RdmaStack};
use crate::session::{Session, SessionTable};
use crate::tcp::{TcpListenPort, TcpStack};
use crate::worker::{MsgWorker, WorkerPool};

/// Receiver of messenger events. Called on worker threads.
pub trait MsgerCallback: Send + Sync {
    /// A connection was accepted; its peer is not known yet.
    fn on_listen_accept(&self, _conn: &ConnRef) {}

    /// A connection declared its peer and joined `session`.
    fn on_conn_declared(&self, _conn: &ConnRef, _session: &Arc<Session>) {}

    /// A message other than a declaration arrived.
    fn on_conn_recv(&self, conn: &ConnRef, msg: Msg);

    /// A connection is closed. It has already left its session.
    fn on_conn_error(&self, _conn: &ConnRef) {}
}

/// A listen port of either transport.
#[derive(Debug, Clone)]
pub enum ListenPort {
    Tcp(Arc<TcpListenPort>),
    Rdma(Arc<RdmaListenPort>),
}

impl ListenPort {
    pub fn addr(&self) -> NodeAddr {
        match self {
            ListenPort::Tcp(lp) => lp.addr(),
            ListenPort::Rdma(lp) => lp.addr(),
        }
    }

    pub fn close(&self) {
        match self {
            ListenPort::Tcp(lp) => lp.close(),
            ListenPort::Rdma(lp) => lp.close(),
        }
    }
}

/// Owner of the listen ports and the session table.
///
/// Every outbound connection starts with an identity declaration; every
/// accepted connection stays in an undeclared set until its declaration
/// arrives and attaches it to the session of its peer.
pub struct MsgManager {
    me: Weak<MsgManager>,
    msger_id: Option<MsgerId>,
    workers: Arc<WorkerPool>,
    tcp: TcpStack,
    rdma: Option<RdmaStack>,
    callback: RwLock<Option<Weak<dyn MsgerCallback>>>,
    listen_ports: Mutex<Vec<ListenPort>>,
    sessions: SessionTable,
    undeclared: Mutex<HashMap<ConnId, ConnRef>>,
    declare_msg: Mutex<Option<Msg>>,
    /// Connections closed by [`MsgManager::clear`].
    closing: Mutex<Vec<ConnRef>>,
}

impl fmt::Debug for MsgManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MsgManager")
            .field("msger_id", &self.msger_id())
            .field("listen_ports", &self.listen_addrs())
            .field("sessions", &self.sessions.len())
            .field("rdma", &self.rdma.is_some())
            .finish()
    }
}

impl MsgManager {
    /// `msger_id` is the identity declared to peers; `None` takes it from
    /// the first IPv4 listen port.
    pub fn new(msger_id: Option<MsgerId>, workers: Arc<WorkerPool>, rdma: Option<RdmaStack>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            msger_id,
            tcp: TcpStack::new(workers.clone()),
            workers,
            rdma,
            callback: RwLock::new(None),
            listen_ports: Mutex::new(Vec::new()),
            sessions: SessionTable::new(),
            undeclared: Mutex::new(HashMap::new()),
            declare_msg: Mutex::new(None),
            closing: Mutex::new(Vec::new()),
        })
    }

    pub fn set_msger_cb(&self, cb: Weak<dyn MsgerCallback>) {
        *self.callback.write() = Some(cb);
    }

    fn msger_cb(&self) -> Option<Arc<dyn MsgerCallback>> {
        self.callback.read().as_ref().and_then(Weak::upgrade)
    }

    /// Identity declared to peers.
    pub fn msger_id(&self) -> MsgerId {
        if let Some(id) = self.msger_id {
            return id;
        }
        let ports = self.listen_ports.lock();
        let first_v4 = |ttype: Option<TransportType>| {
            ports.iter().map(ListenPort::addr).find_map(|a| match a.ip() {
                IpAddr::V4(ip) if ttype.map_or(true, |t| t == a.transport()) => Some(MsgerId::new(ip, a.port())),
                _ => None,
            })
        };
        first_v4(Some(TransportType::Tcp))
            .or_else(|| first_v4(None))
            .unwrap_or(MsgerId::new(Ipv4Addr::UNSPECIFIED, 0))
    }

    #[inline]
    pub fn workers(&self) -> &Arc<WorkerPool> {
        &self.workers
    }

    /// The worker with the fewest jobs.
    pub fn lightest_load_worker(&self) -> Option<&MsgWorker> {
        self.workers.lightest_load_worker()
    }

    #[inline]
    pub fn tcp_stack(&self) -> &TcpStack {
        &self.tcp
    }

    #[inline]
    pub fn rdma_stack(&self) -> Option<&RdmaStack> {
        self.rdma.as_ref()
    }

    fn rdma(&self) -> Result<&RdmaStack> {
        self.rdma.as_ref().ok_or(MsgError::TransportDisabled(TransportType::Rdma))
    }

    /// Listen on the first free port of `spec`. Returns the bound address.
    pub fn add_listen_port(&self, spec: &ListenSpec) -> Result<NodeAddr> {
        trace!("add listen port {:?}", spec);
        let handler: Weak<dyn ListenPortListener> = self.me.clone();
        let lp = match spec.ttype {
            TransportType::Tcp => ListenPort::Tcp(self.tcp.create_listen_port(spec.ip, spec.ports.clone(), handler)?),
            TransportType::Rdma => {
                ListenPort::Rdma(self.rdma()?.create_listen_port(spec.ip, spec.ports.clone(), handler)?)
            }
            TransportType::Unknown => return Err(MsgError::TransportDisabled(spec.ttype)),
        };
        let addr = lp.addr();
        self.listen_ports.lock().push(lp);
        self.declare_msg.lock().take();
        Ok(addr)
    }

    /// Stop listening on `addr`. Returns whether such a port existed.
    pub fn del_listen_port(&self, addr: &NodeAddr) -> bool {
        trace!("del listen port {}", addr);
        let lp = {
            let mut ports = self.listen_ports.lock();
            match ports.iter().position(|lp| lp.addr() == *addr) {
                Some(pos) => ports.remove(pos),
                None => return false,
            }
        };
        lp.close();
        self.declare_msg.lock().take();
        true
    }

    pub fn listen_addrs(&self) -> Vec<NodeAddr> {
        self.listen_ports.lock().iter().map(ListenPort::addr).collect()
    }

    /// The declaration sent on every new outbound connection, built once
    /// per set of listen ports.
    fn declare_msg(&self, priority: u8) -> Msg {
        let mut cached = self.declare_msg.lock();
        let mut msg = match &*cached {
            Some(msg) => msg.clone(),
            None => {
                let addrs = self.listen_addrs();
                let first = |t: TransportType| addrs.iter().copied().find(|a| a.transport() == t);
                let declare = DeclareId {
                    msger_id: self.msger_id(),
                    tcp_listen: first(TransportType::Tcp),
                    rdma_listen: first(TransportType::Rdma),
                };
                let mut msg = Msg::new(MsgType::DeclareId);
                msg.append_data(&declare.to_vec());
                debug!("declaring {:?}", declare);
                cached.insert(msg).clone()
            }
        };
        msg.set_priority(priority);
        msg
    }

    /// Open a connection to the listen address `addr` and declare
    /// ourselves on it with `priority`. The caller owns the connection.
    pub fn add_connection(&self, addr: &NodeAddr, priority: u8) -> Result<ConnRef> {
        trace!("add connection to {} with priority {}", addr, priority);
        let conn = match addr.transport() {
            TransportType::Tcp => self.tcp.connect(addr)?,
            TransportType::Rdma => self.rdma()?.connect(addr)?,
            TransportType::Unknown => return Err(MsgError::TransportDisabled(addr.transport())),
        };
        let listener: Weak<dyn ConnectionListener> = self.me.clone();
        conn::set_listener(&conn, listener);
        if let Err(e) = conn.send_msg(self.declare_msg(priority)) {
            conn.close();
            return Err(e);
        }
        info!("connecting {} to {}", conn.id(), addr);
        Ok(conn)
    }

    /// Detach `conn` from its session or from the undeclared set. The
    /// connection is not closed.
    pub fn del_connection(&self, conn: &ConnRef) {
        trace!("del connection {}", conn.id());
        {
            let mut undeclared = self.undeclared.lock();
            if undeclared.get(&conn.id()).is_some_and(|c| Arc::ptr_eq(c, conn)) {
                undeclared.remove(&conn.id());
                return;
            }
        }
        if let Some(session) = conn.session_key().and_then(|key| self.sessions.get(&key)) {
            session.del_conn(conn);
        }
    }

    /// The session of `peer`, created if absent.
    pub fn get_session(&self, peer: MsgerId) -> Arc<Session> {
        self.sessions.get_or_create(peer)
    }

    /// The session of `peer`, if any.
    pub fn find_session(&self, peer: &MsgerId) -> Option<Arc<Session>> {
        self.sessions.get(peer)
    }

    /// Drop the session of `peer` from the table. Its connections are
    /// released, not closed. Returns whether it existed.
    pub fn del_session(&self, peer: &MsgerId) -> bool {
        trace!("del session {}", peer);
        self.sessions.remove(peer).is_some()
    }

    pub fn session_num(&self) -> usize {
        self.sessions.len()
    }

    /// Number of accepted connections that have not declared their peer.
    pub fn undeclared_conn_num(&self) -> usize {
        self.undeclared.lock().len()
    }

    /// Stop listening and close every known connection.
    pub fn clear(&self) {
        let ports: Vec<_> = self.listen_ports.lock().drain(..).collect();
        for lp in ports {
            lp.close();
        }
        self.declare_msg.lock().take();

        let mut conns: Vec<ConnRef> = self.undeclared.lock().drain().map(|(_, c)| c).collect();
        for session in self.sessions.drain() {
            conns.extend(session.connections());
        }
        info!("closing {} connections", conns.len());
        for conn in &conns {
            conn.close();
        }
        self.closing.lock().extend(conns);
    }

    /// Whether every connection closed by [`MsgManager::clear`] is closed.
    pub fn is_clear_done(&self) -> bool {
        let mut closing = self.closing.lock();
        closing.retain(|c| !c.is_closed());
        closing.is_empty()
    }

    fn on_declare(&self, conn: &ConnRef, msg: &Msg) {
        let declare = match DeclareId::decode(&msg.flatten()) {
            Ok((declare, _)) => declare,
            Err(e) => {
                warn!("{} sent a bad declaration: {}", conn.id(), e);
                self.del_connection(conn);
                conn.close();
                return;
            }
        };
        debug!("{} declares {:?}", conn.id(), declare);

        let session = self.get_session(declare.msger_id);
        for addr in [declare.tcp_listen, declare.rdma_listen].into_iter().flatten() {
            session.set_listen_addr(addr);
        }
        self.undeclared.lock().remove(&conn.id());

        match session.add_inbound(conn, conn.transport(), msg.priority(), self.msger_id()) {
            Ok(displaced) => {
                info!("{} joined {} with priority {}", conn.id(), session, msg.priority());
                if let Some(old) = displaced {
                    info!("{} replaces our {} to {}", conn.id(), old.id(), session);
                    old.close();
                }
                if let Some(cb) = self.msger_cb() {
                    cb.on_conn_declared(conn, &session);
                }
            }
            Err(e) => {
                info!("dropping {} of {}: {}", conn.id(), session, e);
                conn.close();
            }
        }
    }
}

impl ListenPortListener for MsgManager {
    fn on_new_connection(&self, conn: ConnRef) {
        trace!("accepted {}", conn.id());
        self.undeclared.lock().insert(conn.id(), conn.clone());
        let listener: Weak<dyn ConnectionListener> = self.me.clone();
        conn::set_listener(&conn, listener);
        if let Some(cb) = self.msger_cb() {
            cb.on_listen_accept(&conn);
        }
    }
}

impl ConnectionListener for MsgManager {
    fn on_conn_recv(&self, conn: &ConnRef, msg: Msg) {
        trace!("{} received {:?}", conn.id(), msg.header());
        if msg.msg_type() == MsgType::DeclareId {
            self.on_declare(conn, &msg);
            return;
        }
        match self.msger_cb() {
            Some(cb) => cb.on_conn_recv(conn, msg),
            None => debug!("{} dropped a message: no callback", conn.id()),
        }
    }

    fn on_conn_error(&self, conn: &ConnRef) {
        trace!("{} closed", conn.id());
        self.del_connection(conn);
        if let Some(cb) = self.msger_cb() {
            cb.on_conn_error(conn);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::Connection;
    use crate::msg::{priority, MsgHeader};
    use std::io::{self, Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::mpsc::{self, Receiver, Sender};
    use std::time::{Duration, Instant};

    struct Recorder {
        declared: Mutex<Sender<(ConnId, MsgerId)>>,
        msgs: Mutex<Sender<Msg>>,
        errors: Mutex<Sender<ConnId>>,
    }

    impl Recorder {
        fn new() -> (Arc<Self>, Receiver<(ConnId, MsgerId)>, Receiver<Msg>, Receiver<ConnId>) {
            let (dtx, drx) = mpsc::channel();
            let (mtx, mrx) = mpsc::channel();
            let (etx, erx) = mpsc::channel();
            let rec = Arc::new(Self {
                declared: Mutex::new(dtx),
                msgs: Mutex::new(mtx),
                errors: Mutex::new(etx),
            });
            (rec, drx, mrx, erx)
        }
    }

    impl MsgerCallback for Recorder {
        fn on_conn_declared(&self, conn: &ConnRef, session: &Arc<Session>) {
            let _ = self.declared.lock().send((conn.id(), session.peer()));
        }

        fn on_conn_recv(&self, _conn: &ConnRef, msg: Msg) {
            let _ = self.msgs.lock().send(msg);
        }

        fn on_conn_error(&self, conn: &ConnRef) {
            let _ = self.errors.lock().send(conn.id());
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

    fn wire(msg: Msg) -> Vec<u8> {
        msg.into_wire_pieces().flat_map(|b| b.to_vec()).collect()
    }

    fn read_msg(s: &mut TcpStream) -> anyhow::Result<(MsgHeader, Vec<u8>)> {
        let mut head = [0u8; MsgHeader::LEN];
        s.read_exact(&mut head)?;
        let (h, _) = MsgHeader::decode(&head)?;
        let mut body = vec![0u8; h.len as usize];
        s.read_exact(&mut body)?;
        Ok((h, body))
    }

    fn hung_up(s: &mut TcpStream) -> bool {
        let mut buf = [0u8; 1];
        match s.read(&mut buf) {
            Ok(0) => true,
            Err(e) => e.kind() == io::ErrorKind::ConnectionReset,
            Ok(_) => false,
        }
    }

    /// Manager A connects to a peer whose own connection to A is already
    /// declared. Both declarations cross; the peer side is played by raw
    /// sockets following the same rule.
    fn cross(peer_id: MsgerId) -> anyhow::Result<()> {
        let pool = Arc::new(WorkerPool::new(2, &[])?);
        pool.start()?;
        let a_id = MsgerId::new(Ipv4Addr::new(10, 0, 0, 5), 5000);
        let a = MsgManager::new(Some(a_id), pool.clone(), None);
        let (rec, declared, msgs, _) = Recorder::new();
        a.set_msger_cb(Arc::downgrade(&rec) as Weak<dyn MsgerCallback>);
        let a_addr = a.add_listen_port(&tcp_spec())?;

        let peer_listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
        let peer_addr = NodeAddr::new(TransportType::Tcp, peer_listener.local_addr()?);
        let session = a.get_session(peer_id);
        session.set_listen_addr(peer_addr);
        let ours = session.get_connection(&a, TransportType::Tcp, priority::DEFAULT)?;
        let (mut ours_far, _) = peer_listener.accept()?;
        ours_far.set_read_timeout(Some(Duration::from_secs(5)))?;
        let (h, body) = read_msg(&mut ours_far)?;
        assert_eq!(h.msg_type, MsgType::DeclareId);
        assert_eq!(DeclareId::decode(&body)?.0.msger_id, a_id);

        let mut theirs = TcpStream::connect(a_addr.socket_addr())?;
        theirs.set_read_timeout(Some(Duration::from_secs(5)))?;
        let mut declare = Msg::new(MsgType::DeclareId);
        declare.append_data(
            &DeclareId {
                msger_id: peer_id,
                tcp_listen: Some(peer_addr),
                rdma_listen: None,
            }
            .to_vec(),
        );
        declare.set_priority(priority::DEFAULT);
        theirs.write_all(&wire(declare))?;

        let mut hello = Msg::new(MsgType::Ctl);
        hello.append_data(b"hi");
        if a_id > peer_id {
            // The peer's connection is refused; ours stays.
            assert!(hung_up(&mut theirs));
            assert!(ours.is_connected());
            ours.send_msg(hello)?;
            assert_eq!(read_msg(&mut ours_far)?.1, b"hi");
        } else {
            // The peer's connection replaces ours.
            let (accepted, peer) = declared.recv_timeout(Duration::from_secs(5))?;
            assert_eq!(peer, peer_id);
            assert!(hung_up(&mut ours_far));
            wait_until("our connection closed", || ours.is_closed())?;
            assert_eq!(ours.session_key(), None);
            let kept = session
                .conn(TransportType::Tcp, priority::DEFAULT)
                .ok_or_else(|| anyhow::anyhow!("no link left"))?;
            assert_eq!(kept.id(), accepted);
            theirs.write_all(&wire(hello))?;
            assert_eq!(&msgs.recv_timeout(Duration::from_secs(5))?.flatten()[..], b"hi");
        }
        assert_eq!(session.conn_num(), 1);

        a.clear();
        wait_until("clear", || a.is_clear_done())?;
        pool.stop();
        Ok(())
    }

    #[test]
    fn crossing_connects_keep_one_link() -> anyhow::Result<()> {
        cross(MsgerId::new(Ipv4Addr::new(10, 0, 0, 1), 5000))?;
        cross(MsgerId::new(Ipv4Addr::new(10, 0, 0, 9), 5000))
    }

    fn tcp_spec() -> ListenSpec {
        ListenSpec {
            ttype: TransportType::Tcp,
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ports: 0..=0,
        }
    }

    #[test]
    fn declared_connections_join_sessions() -> anyhow::Result<()> {
        let pool = Arc::new(WorkerPool::new(2, &[])?);
        pool.start()?;

        let a = MsgManager::new(None, pool.clone(), None);
        let (rec, declared, msgs, _) = Recorder::new();
        a.set_msger_cb(Arc::downgrade(&rec) as Weak<dyn MsgerCallback>);
        let a_addr = a.add_listen_port(&tcp_spec())?;
        assert_eq!(a.msger_id(), MsgerId::new(Ipv4Addr::LOCALHOST, a_addr.port()));

        let b_id = MsgerId::new(Ipv4Addr::new(10, 9, 8, 7), 4242);
        let b = MsgManager::new(Some(b_id), pool.clone(), None);
        let b_addr = b.add_listen_port(&tcp_spec())?;
        assert!(matches!(
            b.add_listen_port(&ListenSpec {
                ttype: TransportType::Rdma,
                ..tcp_spec()
            }),
            Err(MsgError::TransportDisabled(TransportType::Rdma))
        ));

        let session = b.get_session(a.msger_id());
        assert!(matches!(
            session.get_connection(&b, TransportType::Tcp, priority::DEFAULT),
            Err(MsgError::NoListenAddr(TransportType::Tcp))
        ));
        session.set_listen_addr(a_addr);
        let conn = session.get_connection(&b, TransportType::Tcp, priority::DEFAULT)?;
        let again = session.get_connection(&b, TransportType::Tcp, priority::DEFAULT)?;
        assert!(Arc::ptr_eq(&conn, &again));
        assert_eq!(conn.session_key(), Some(a.msger_id()));

        let (accepted, peer) = declared.recv_timeout(Duration::from_secs(5))?;
        assert_eq!(peer, b_id);
        assert_eq!(a.undeclared_conn_num(), 0);
        let a_session = a.find_session(&b_id).ok_or_else(|| anyhow::anyhow!("no session"))?;
        assert_eq!(a_session.listen_addr(TransportType::Tcp), Some(b_addr));
        let reverse = a_session
            .conn(TransportType::Tcp, priority::DEFAULT)
            .ok_or_else(|| anyhow::anyhow!("not registered"))?;
        assert_eq!(reverse.id(), accepted);

        // Traffic after the declaration reaches the callback.
        let mut hello = Msg::new(MsgType::Ctl);
        hello.append_data(b"hello");
        conn.send_msg(hello)?;
        let got = msgs.recv_timeout(Duration::from_secs(5))?;
        assert_eq!(&got.flatten()[..], b"hello");

        a.clear();
        b.clear();
        wait_until("clear", || a.is_clear_done() && b.is_clear_done())?;
        assert_eq!(a.session_num(), 0);
        assert!(a.listen_addrs().is_empty());
        pool.stop();
        Ok(())
    }

    #[test]
    fn later_duplicate_is_closed() -> anyhow::Result<()> {
        let pool = Arc::new(WorkerPool::new(2, &[])?);
        pool.start()?;

        let a = MsgManager::new(None, pool.clone(), None);
        let (rec, declared, _, errors) = Recorder::new();
        a.set_msger_cb(Arc::downgrade(&rec) as Weak<dyn MsgerCallback>);
        let a_addr = a.add_listen_port(&tcp_spec())?;

        let b_id = MsgerId::new(Ipv4Addr::new(10, 9, 8, 7), 4242);
        let b = MsgManager::new(Some(b_id), pool.clone(), None);

        let first = b.add_connection(&a_addr, priority::DEFAULT)?;
        let (kept, _) = declared.recv_timeout(Duration::from_secs(5))?;
        let second = b.add_connection(&a_addr, priority::DEFAULT)?;

        // The acceptor closes its side of the second connection.
        let dropped = errors.recv_timeout(Duration::from_secs(5))?;
        assert_ne!(dropped, kept);
        wait_until("peer close", || second.is_closed())?;
        assert!(first.is_connected());
        assert!(declared.recv_timeout(Duration::from_millis(200)).is_err());

        let session = a.find_session(&b_id).ok_or_else(|| anyhow::anyhow!("no session"))?;
        assert_eq!(session.conn_num(), 1);
        assert_eq!(session.conn(TransportType::Tcp, priority::DEFAULT).map(|c| c.id()), Some(kept));

        // Another priority is another key.
        let _third = b.add_connection(&a_addr, priority::HIGH)?;
        declared.recv_timeout(Duration::from_secs(5))?;
        assert_eq!(session.conn_num(), 2);

        first.close();
        second.close();
        a.clear();
        pool.stop();
        Ok(())
    }
}
