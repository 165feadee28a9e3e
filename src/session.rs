//! Sessions: every connection to one peer identity, at most one per
//! transport and priority.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use log::{debug, info};
use parking_lot::{Mutex, RwLock};

use crate::conn::ConnRef;
use crate::error::{MsgError, Result};
use crate::manager::MsgManager;
use crate::msg::{MsgerId, NodeAddr, TransportType};

struct ConnEntry {
    ttype: TransportType,
    priority: u8,
    /// Opened by this side.
    outbound: bool,
    conn: ConnRef,
}

/// Listen addresses of a peer and the connections to it.
///
/// Connections only remember the peer identity of their session; the
/// session itself is looked up in the [`SessionTable`] on each use.
///
/// When both ends connect to each other at once, the connection opened by
/// the larger identity is the one both ends keep.
pub struct Session {
    peer: MsgerId,
    tcp_listen: Mutex<Option<NodeAddr>>,
    rdma_listen: Mutex<Option<NodeAddr>>,
    conns: Mutex<Vec<ConnEntry>>,
    /// Serializes outbound connection setup.
    connecting: Mutex<()>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("peer", &self.peer)
            .field("tcp_listen", &*self.tcp_listen.lock())
            .field("rdma_listen", &*self.rdma_listen.lock())
            .field("conns", &self.conns.lock().len())
            .finish()
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Session<{}>", self.peer)
    }
}

impl Session {
    pub fn new(peer: MsgerId) -> Self {
        Self {
            peer,
            tcp_listen: Mutex::new(None),
            rdma_listen: Mutex::new(None),
            conns: Mutex::new(Vec::with_capacity(4)),
            connecting: Mutex::new(()),
        }
    }

    #[inline]
    pub fn peer(&self) -> MsgerId {
        self.peer
    }

    fn listen_slot(&self, ttype: TransportType) -> Option<&Mutex<Option<NodeAddr>>> {
        match ttype {
            TransportType::Tcp => Some(&self.tcp_listen),
            TransportType::Rdma => Some(&self.rdma_listen),
            TransportType::Unknown => None,
        }
    }

    /// Listen address the peer declared for `ttype`.
    pub fn listen_addr(&self, ttype: TransportType) -> Option<NodeAddr> {
        self.listen_slot(ttype).and_then(|slot| *slot.lock())
    }

    /// Record a listen address of the peer, replacing the previous one of
    /// the same transport.
    pub fn set_listen_addr(&self, addr: NodeAddr) {
        if let Some(slot) = self.listen_slot(addr.transport()) {
            *slot.lock() = Some(addr);
        }
    }

    /// Whether listen addresses of both transports are known.
    pub fn ready(&self) -> bool {
        self.tcp_listen.lock().is_some() && self.rdma_listen.lock().is_some()
    }

    /// The connection registered under `(ttype, priority)`.
    pub fn conn(&self, ttype: TransportType, priority: u8) -> Option<ConnRef> {
        self.conns
            .lock()
            .iter()
            .find(|e| e.ttype == ttype && e.priority == priority)
            .map(|e| e.conn.clone())
    }

    /// Connections of this session, in registration order.
    pub fn connections(&self) -> Vec<ConnRef> {
        self.conns.lock().iter().map(|e| e.conn.clone()).collect()
    }

    pub fn conn_num(&self) -> usize {
        self.conns.lock().len()
    }

    /// Return the connection registered under `(ttype, priority)`, or open
    /// one to the peer's listen address for `ttype` and register it.
    ///
    /// If the peer's own connection for the key was registered meanwhile,
    /// the one opened by the larger identity is kept and the other closed.
    pub fn get_connection(&self, manager: &MsgManager, ttype: TransportType, priority: u8) -> Result<ConnRef> {
        if let Some(conn) = self.conn(ttype, priority) {
            return Ok(conn);
        }
        let _connecting = self.connecting.lock();
        if let Some(conn) = self.conn(ttype, priority) {
            return Ok(conn);
        }

        let addr = self.listen_addr(ttype).ok_or(MsgError::NoListenAddr(ttype))?;
        let local = manager.msger_id();
        let conn = manager.add_connection(&addr, priority)?;

        let mut conns = self.conns.lock();
        let (kept, dropped) = match conns.iter_mut().find(|e| e.ttype == ttype && e.priority == priority) {
            Some(e) if !e.outbound && local > self.peer => {
                let old = std::mem::replace(&mut e.conn, conn.clone());
                e.outbound = true;
                conn.set_session_key(Some(self.peer));
                (conn, old)
            }
            Some(e) => (e.conn.clone(), conn),
            None => {
                conn.set_session_key(Some(self.peer));
                conns.push(ConnEntry {
                    ttype,
                    priority,
                    outbound: true,
                    conn: conn.clone(),
                });
                drop(conns);
                info!("{} opened {} with priority {}", self, conn.id(), priority);
                return Ok(conn);
            }
        };
        drop(conns);
        debug!("{} keeps {} and drops {}", self, kept.id(), dropped.id());
        dropped.set_session_key(None);
        dropped.close();
        Ok(kept)
    }

    /// Register `conn` under `(ttype, priority)`.
    ///
    /// Registering the same connection twice is a no-op; a different
    /// connection under a taken key is rejected.
    pub fn add_conn(&self, conn: &ConnRef, ttype: TransportType, priority: u8) -> Result<()> {
        self.add_accepted(conn, ttype, priority, None).map(|_| ())
    }

    /// Register `conn`, opened by the peer, under `(ttype, priority)`.
    ///
    /// If the key is held by a connection this side opened to the peer and
    /// the peer's identity is larger than `local`, `conn` takes the key and
    /// the displaced connection is returned for closing. Otherwise a taken
    /// key rejects `conn`.
    pub(crate) fn add_inbound(
        &self,
        conn: &ConnRef,
        ttype: TransportType,
        priority: u8,
        local: MsgerId,
    ) -> Result<Option<ConnRef>> {
        self.add_accepted(conn, ttype, priority, Some(local))
    }

    fn add_accepted(
        &self,
        conn: &ConnRef,
        ttype: TransportType,
        priority: u8,
        local: Option<MsgerId>,
    ) -> Result<Option<ConnRef>> {
        if ttype == TransportType::Unknown {
            return Err(MsgError::TransportDisabled(ttype));
        }
        let mut conns = self.conns.lock();
        if conns.iter().any(|e| Arc::ptr_eq(&e.conn, conn)) {
            return Ok(None);
        }
        let displaced = match conns.iter_mut().find(|e| e.ttype == ttype && e.priority == priority) {
            Some(e) if e.outbound && local.is_some_and(|local| self.peer > local) => {
                e.outbound = false;
                Some(std::mem::replace(&mut e.conn, conn.clone()))
            }
            Some(_) => return Err(MsgError::DuplicateConnection(ttype, priority)),
            None => {
                conns.push(ConnEntry {
                    ttype,
                    priority,
                    outbound: false,
                    conn: conn.clone(),
                });
                None
            }
        };
        conn.set_session_key(Some(self.peer));
        drop(conns);
        if let Some(old) = &displaced {
            old.set_session_key(None);
        }
        Ok(displaced)
    }

    /// Forget `conn`. Returns whether it was registered here.
    pub fn del_conn(&self, conn: &ConnRef) -> bool {
        let mut conns = self.conns.lock();
        let Some(pos) = conns.iter().position(|e| Arc::ptr_eq(&e.conn, conn)) else {
            return false;
        };
        let entry = conns.remove(pos);
        drop(conns);
        if entry.conn.session_key() == Some(self.peer) {
            entry.conn.set_session_key(None);
        }
        true
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        for entry in self.conns.get_mut().drain(..) {
            if entry.conn.session_key() == Some(self.peer) {
                entry.conn.set_session_key(None);
            }
        }
    }
}

/// Sessions by peer identity.
#[derive(Default)]
pub struct SessionTable {
    sessions: RwLock<HashMap<MsgerId, Arc<Session>>>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// The session of `peer`, created if absent. Concurrent callers get the
    /// same session.
    pub fn get_or_create(&self, peer: MsgerId) -> Arc<Session> {
        if let Some(s) = self.sessions.read().get(&peer) {
            return s.clone();
        }
        self.sessions
            .write()
            .entry(peer)
            .or_insert_with(|| {
                debug!("new session for {}", peer);
                Arc::new(Session::new(peer))
            })
            .clone()
    }

    pub fn get(&self, peer: &MsgerId) -> Option<Arc<Session>> {
        self.sessions.read().get(peer).cloned()
    }

    /// Drop the table's reference to the session of `peer`.
    pub fn remove(&self, peer: &MsgerId) -> Option<Arc<Session>> {
        self.sessions.write().remove(peer)
    }

    /// Empty the table, returning what it held.
    pub fn drain(&self) -> Vec<Arc<Session>> {
        self.sessions.write().drain().map(|(_, s)| s).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::{ConnBase, ConnId, Connection};
    use crate::msg::Msg;
    use crate::worker::MsgWorker;
    use std::net::Ipv4Addr;

    /// A connection that goes nowhere.
    #[derive(Debug)]
    struct Dummy {
        base: ConnBase,
    }

    impl Dummy {
        fn new(worker: &MsgWorker, ttype: TransportType, id: u32) -> ConnRef {
            Arc::new(Self {
                base: ConnBase::new(ConnId { ttype, id }, worker.clone(), None),
            })
        }
    }

    impl Connection for Dummy {
        fn id(&self) -> ConnId {
            self.base.id()
        }

        fn send_msg(&self, _msg: Msg) -> Result<()> {
            Ok(())
        }

        fn close(&self) {}

        fn is_connected(&self) -> bool {
            true
        }

        fn is_closed(&self) -> bool {
            false
        }

        fn peer_addr(&self) -> Option<NodeAddr> {
            None
        }

        fn worker(&self) -> &MsgWorker {
            self.base.worker()
        }

        fn base(&self) -> &ConnBase {
            &self.base
        }
    }

    const PEER: MsgerId = MsgerId::new(Ipv4Addr::new(10, 0, 0, 1), 7000);

    #[test]
    fn one_connection_per_key() -> anyhow::Result<()> {
        let worker = MsgWorker::new(0, None)?;
        let session = Session::new(PEER);
        let first = Dummy::new(&worker, TransportType::Tcp, 1);
        let second = Dummy::new(&worker, TransportType::Tcp, 2);

        session.add_conn(&first, TransportType::Tcp, 127)?;
        session.add_conn(&first, TransportType::Tcp, 127)?;
        assert!(matches!(
            session.add_conn(&second, TransportType::Tcp, 127),
            Err(MsgError::DuplicateConnection(TransportType::Tcp, 127))
        ));
        assert_eq!(second.session_key(), None);

        // Other keys are free.
        session.add_conn(&second, TransportType::Tcp, 255)?;
        assert_eq!(session.conn_num(), 2);
        assert_eq!(first.session_key(), Some(PEER));

        assert!(session.del_conn(&first));
        assert!(!session.del_conn(&first));
        assert_eq!(first.session_key(), None);
        assert!(session.conn(TransportType::Tcp, 127).is_none());

        drop(session);
        assert_eq!(second.session_key(), None);
        Ok(())
    }

    #[test]
    fn racing_registrations_keep_one() -> anyhow::Result<()> {
        let worker = MsgWorker::new(0, None)?;
        let table = Arc::new(SessionTable::new());
        let conns: Vec<ConnRef> = (0..8).map(|i| Dummy::new(&worker, TransportType::Rdma, i)).collect();

        let handles: Vec<_> = conns
            .iter()
            .cloned()
            .map(|conn| {
                let table = table.clone();
                std::thread::spawn(move || {
                    let session = table.get_or_create(PEER);
                    session.add_conn(&conn, TransportType::Rdma, 127).is_ok()
                })
            })
            .collect();
        let mut winners = 0;
        for h in handles {
            if h.join().map_err(|_| anyhow::anyhow!("thread panicked"))? {
                winners += 1;
            }
        }

        assert_eq!(winners, 1);
        assert_eq!(table.len(), 1);
        let session = table.get(&PEER).ok_or_else(|| anyhow::anyhow!("no session"))?;
        assert_eq!(session.conn_num(), 1);
        let kept = session
            .conn(TransportType::Rdma, 127)
            .ok_or_else(|| anyhow::anyhow!("no connection"))?;
        assert_eq!(conns.iter().filter(|c| c.session_key().is_some()).count(), 1);
        assert_eq!(kept.session_key(), Some(PEER));

        assert!(table.remove(&PEER).is_some());
        assert!(table.is_empty());
        Ok(())
    }

    #[test]
    fn listen_addresses() -> anyhow::Result<()> {
        let session = Session::new(PEER);
        assert!(!session.ready());
        let tcp: NodeAddr = "tcp@10.0.0.1/7000".parse()?;
        let rdma: NodeAddr = "rdma@10.0.0.1/7100".parse()?;
        session.set_listen_addr(tcp);
        assert_eq!(session.listen_addr(TransportType::Tcp), Some(tcp));
        assert!(!session.ready());
        session.set_listen_addr(rdma);
        assert!(session.ready());
        assert_eq!(session.listen_addr(TransportType::Rdma), Some(rdma));
        Ok(())
    }
}
