//! TCP transport.

mod connection;
mod listen;
pub(crate) mod net;

use std::net::IpAddr;
use std::ops::RangeInclusive;
use std::sync::{Arc, Weak};

pub use self::connection::{TcpConnection, MAX_PAYLOAD};
pub use self::listen::TcpListenPort;
use crate::conn::{ConnRef, ListenPortListener};
use crate::error::{MsgError, Result};
use crate::msg::{NodeAddr, TransportType};
use crate::worker::WorkerPool;

/// Factory of TCP connections and listen ports over a worker pool.
#[derive(Clone)]
pub struct TcpStack {
    workers: Arc<WorkerPool>,
}

impl TcpStack {
    pub fn new(workers: Arc<WorkerPool>) -> Self {
        Self { workers }
    }

    /// Start connecting to `addr` on the least loaded worker. Messages may
    /// be queued right away; they are written once connected.
    pub fn connect(&self, addr: &NodeAddr) -> Result<ConnRef> {
        let worker = self.workers.lightest_load_worker().ok_or(MsgError::Shutdown)?;
        let stream = net::connect_nonblocking(addr.socket_addr())?;
        let peer = NodeAddr::new(TransportType::Tcp, addr.socket_addr());
        let conn = TcpConnection::new(stream, worker.clone(), true, Some(peer))?;
        Ok(conn)
    }

    pub fn create_listen_port(
        &self,
        ip: IpAddr,
        ports: RangeInclusive<u16>,
        handler: Weak<dyn ListenPortListener>,
    ) -> Result<Arc<TcpListenPort>> {
        TcpListenPort::bind(ip, ports, self.workers.clone(), handler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::{self, Connection, ConnectionListener};
    use crate::msg::{Msg, MsgType};
    use std::net::Ipv4Addr;
    use std::sync::mpsc::{self, Receiver, Sender};
    use std::sync::Mutex;
    use std::time::Duration;

    /// Accepts connections and forwards what they receive.
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

    fn pattern(len: usize, seed: u8) -> Vec<u8> {
        (0..len).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect()
    }

    #[test]
    fn messages_arrive_in_order() -> anyhow::Result<()> {
        let pool = Arc::new(WorkerPool::new(3, &[])?);
        pool.start()?;
        let stack = TcpStack::new(pool.clone());

        let (server, rx, _) = Sink::new();
        let server_handler: Weak<dyn ListenPortListener> = Arc::downgrade(&server) as _;
        let port = stack.create_listen_port(IpAddr::V4(Ipv4Addr::LOCALHOST), 0..=0, server_handler)?;
        assert_ne!(port.addr().port(), 0);

        let (client, _, _) = Sink::new();
        let conn = stack.connect(&port.addr())?;
        client.adopt(&conn);

        // Large payloads force partial writes and resumptions.
        let payloads = [pattern(8 << 20, 1), pattern(1, 2), pattern(3 << 20, 3)];
        for (i, p) in payloads.iter().enumerate() {
            let mut msg = Msg::new(MsgType::Io);
            msg.header_mut().reserved = i as u8;
            msg.append_data(&p[..1]);
            msg.append_bytes(bytes::Bytes::copy_from_slice(&p[1..]));
            conn.send_msg(msg)?;
        }
        let mut empty = Msg::new(MsgType::Ctl);
        empty.header_mut().reserved = 3;
        conn.send_msg(empty)?;

        for (i, p) in payloads.iter().enumerate() {
            let msg = rx.recv_timeout(Duration::from_secs(20))?;
            assert_eq!(msg.header().reserved, i as u8);
            assert_eq!(msg.msg_type(), MsgType::Io);
            assert_eq!(msg.transport(), Some(TransportType::Tcp));
            assert_eq!(msg.payload_len(), p.len());
            assert!(msg.flatten()[..] == p[..], "payload {} differs", i);
        }
        let msg = rx.recv_timeout(Duration::from_secs(5))?;
        assert_eq!(msg.msg_type(), MsgType::Ctl);
        assert_eq!(msg.payload_len(), 0);
        assert!(conn.is_connected());

        port.close();
        pool.stop();
        Ok(())
    }

    #[test]
    fn peer_close_is_reported_once() -> anyhow::Result<()> {
        let pool = Arc::new(WorkerPool::new(2, &[])?);
        pool.start()?;
        let stack = TcpStack::new(pool.clone());

        let (server, _, server_err) = Sink::new();
        let handler: Weak<dyn ListenPortListener> = Arc::downgrade(&server) as _;
        let port = stack.create_listen_port(IpAddr::V4(Ipv4Addr::LOCALHOST), 0..=0, handler)?;

        let (client, _, client_err) = Sink::new();
        let conn = stack.connect(&port.addr())?;
        client.adopt(&conn);
        conn.send_msg(Msg::new(MsgType::Ctl))?;

        // Wait until the server side exists, then close it.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        let accepted = loop {
            if let Some(c) = server.conns.lock().unwrap().first().cloned() {
                break c;
            }
            assert!(std::time::Instant::now() < deadline);
            std::thread::sleep(Duration::from_millis(5));
        };
        accepted.close();

        server_err.recv_timeout(Duration::from_secs(5))?;
        client_err.recv_timeout(Duration::from_secs(5))?;
        accepted.close();
        conn.close();
        assert!(client_err.recv_timeout(Duration::from_millis(200)).is_err());
        assert!(server_err.recv_timeout(Duration::from_millis(200)).is_err());
        assert!(conn.is_closed());
        assert!(conn.send_msg(Msg::new(MsgType::Ctl)).is_err());

        pool.stop();
        Ok(())
    }
}
