//! Transport-agnostic connection contract.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use log::debug;
use parking_lot::{Mutex, RwLock};

use crate::error::Result;
use crate::msg::{Msg, MsgerId, NodeAddr, TransportType};
use crate::rdma::RdmaConnection;
use crate::worker::MsgWorker;

/// Identity of a connection within its transport: the socket descriptor of a
/// TCP connection, the QP number of an RDMA connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnId {
    pub ttype: TransportType,
    pub id: u32,
}

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.ttype, self.id)
    }
}

/// Receiver of connection events. Called on the connection's worker thread.
pub trait ConnectionListener: Send + Sync {
    fn on_conn_recv(&self, conn: &ConnRef, msg: Msg);

    /// The connection is closed or faulted. Called exactly once.
    fn on_conn_error(&self, conn: &ConnRef);

    /// Every queued message has been handed to the transport.
    fn on_conn_write(&self, _conn: &ConnRef) {}
}

/// Receiver of accepted connections.
pub trait ListenPortListener: Send + Sync {
    fn on_new_connection(&self, conn: ConnRef);
}

/// A connection of either transport.
pub trait Connection: Send + Sync + fmt::Debug {
    fn id(&self) -> ConnId;

    #[inline]
    fn transport(&self) -> TransportType {
        self.id().ttype
    }

    /// Queue `msg`. Messages of one connection reach the peer in the order
    /// they were queued.
    fn send_msg(&self, msg: Msg) -> Result<()>;

    /// Close the connection. The listener is notified once.
    fn close(&self);

    /// Whether messages can be sent.
    fn is_connected(&self) -> bool;

    fn is_closed(&self) -> bool;

    /// Address of the remote end.
    fn peer_addr(&self) -> Option<NodeAddr>;

    /// The worker driving this connection.
    fn worker(&self) -> &MsgWorker;

    fn base(&self) -> &ConnBase;

    /// Peer identity of the session this connection belongs to.
    #[inline]
    fn session_key(&self) -> Option<MsgerId> {
        self.base().session_key()
    }

    #[inline]
    fn set_session_key(&self, key: Option<MsgerId>) {
        self.base().set_session_key(key)
    }

    /// RDMA-specific operations, if this is an RDMA connection.
    #[inline]
    fn as_rdma(&self) -> Option<&RdmaConnection> {
        None
    }
}

pub type ConnRef = Arc<dyn Connection>;

/// Install `listener` on `conn`. Events that happened before are replayed
/// on the connection's worker, in order.
pub fn set_listener(conn: &ConnRef, listener: Weak<dyn ConnectionListener>) {
    *conn.base().listener.write() = Some(listener);
    let conn = conn.clone();
    let worker = conn.worker().clone();
    worker.post_work(move || conn.base().flush(&conn));
}

/// State common to every connection.
pub struct ConnBase {
    id: ConnId,
    worker: MsgWorker,
    listener: RwLock<Option<Weak<dyn ConnectionListener>>>,
    /// Messages received while no listener was installed.
    pending: Mutex<VecDeque<Msg>>,
    error_pending: AtomicBool,
    error_notified: AtomicBool,
    session_key: Mutex<Option<MsgerId>>,
    peer_addr: Mutex<Option<NodeAddr>>,
}

impl fmt::Debug for ConnBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnBase")
            .field("id", &self.id)
            .field("worker", &self.worker.id())
            .field("session", &*self.session_key.lock())
            .finish()
    }
}

impl ConnBase {
    pub fn new(id: ConnId, worker: MsgWorker, peer_addr: Option<NodeAddr>) -> Self {
        Self {
            id,
            worker,
            listener: RwLock::new(None),
            pending: Mutex::new(VecDeque::new()),
            error_pending: AtomicBool::new(false),
            error_notified: AtomicBool::new(false),
            session_key: Mutex::new(None),
            peer_addr: Mutex::new(peer_addr),
        }
    }

    #[inline]
    pub fn id(&self) -> ConnId {
        self.id
    }

    #[inline]
    pub fn worker(&self) -> &MsgWorker {
        &self.worker
    }

    #[inline]
    pub fn session_key(&self) -> Option<MsgerId> {
        *self.session_key.lock()
    }

    #[inline]
    pub fn set_session_key(&self, key: Option<MsgerId>) {
        *self.session_key.lock() = key;
    }

    #[inline]
    pub fn peer_addr(&self) -> Option<NodeAddr> {
        *self.peer_addr.lock()
    }

    #[inline]
    pub fn set_peer_addr(&self, addr: Option<NodeAddr>) {
        *self.peer_addr.lock() = addr;
    }

    fn listener(&self) -> Option<Arc<dyn ConnectionListener>> {
        self.listener.read().as_ref().and_then(Weak::upgrade)
    }

    /// Hand a received message to the listener.
    pub fn deliver(&self, conn: &ConnRef, msg: Msg) {
        let listener = {
            let mut pending = self.pending.lock();
            match self.listener() {
                Some(l) if pending.is_empty() => l,
                _ => {
                    pending.push_back(msg);
                    return;
                }
            }
        };
        listener.on_conn_recv(conn, msg);
    }

    /// Report the connection as closed, once.
    pub fn notify_error(&self, conn: &ConnRef) {
        if self.error_notified.load(Ordering::Acquire) {
            return;
        }
        match self.listener() {
            Some(l) if self.pending.lock().is_empty() => {
                if !self.error_notified.swap(true, Ordering::AcqRel) {
                    debug!("connection {} reports closure", self.id);
                    l.on_conn_error(conn);
                }
            }
            _ => self.error_pending.store(true, Ordering::Release),
        }
    }

    pub fn notify_write(&self, conn: &ConnRef) {
        if let Some(l) = self.listener() {
            l.on_conn_write(conn);
        }
    }

    fn flush(&self, conn: &ConnRef) {
        let Some(listener) = self.listener() else {
            return;
        };
        loop {
            let Some(msg) = self.pending.lock().pop_front() else {
                break;
            };
            listener.on_conn_recv(conn, msg);
        }
        if self.error_pending.swap(false, Ordering::AcqRel) {
            self.notify_error(conn);
        }
    }
}
