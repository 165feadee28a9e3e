use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr, TcpListener, TcpStream};
use std::ops::RangeInclusive;
use std::os::fd::AsRawFd;
use std::sync::{Arc, Weak};

use log::{debug, info, warn};

use super::RdmaStack;
use crate::conn::{ConnRef, ListenPortListener};
use crate::error::{MsgError, Result};
use crate::event::{EventCallback, Interest};
use crate::msg::{NodeAddr, TransportType};
use crate::tcp::net;
use crate::utils::interop::would_block;
use crate::worker::MsgWorker;

/// A listening control socket. Every accepted socket runs the passive side
/// of a handshake; its RDMA connection goes to the handler right away and
/// becomes writable when the handshake completes.
pub struct RdmaListenPort {
    listener: TcpListener,
    addr: NodeAddr,
    worker: MsgWorker,
    stack: RdmaStack,
    handler: Weak<dyn ListenPortListener>,
}

impl fmt::Debug for RdmaListenPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RdmaListenPort<{}>", self.addr)
    }
}

impl RdmaListenPort {
    pub(crate) fn bind(
        ip: IpAddr,
        ports: RangeInclusive<u16>,
        stack: RdmaStack,
        handler: Weak<dyn ListenPortListener>,
    ) -> Result<Arc<Self>> {
        let worker = stack.control_worker().ok_or(MsgError::Shutdown)?;
        let listener = net::bind_first_free(ip, ports)?;
        let addr = NodeAddr::new(TransportType::Rdma, listener.local_addr()?);
        let port = Arc::new(Self {
            listener,
            addr,
            worker: worker.clone(),
            stack,
            handler,
        });
        worker.set_event(port.listener.as_raw_fd(), Interest::READABLE, port.clone())?;
        info!("listening on {}", port.addr);
        Ok(port)
    }

    #[inline]
    pub fn addr(&self) -> NodeAddr {
        self.addr
    }

    /// Stop accepting.
    pub fn close(&self) {
        if let Err(e) = self.worker.del_event(self.listener.as_raw_fd()) {
            debug!("{} cannot leave the reactor: {}", self.addr, e);
        }
        info!("stopped listening on {}", self.addr);
    }

    fn accept_all(&self) -> io::Result<Vec<(TcpStream, SocketAddr)>> {
        let mut accepted = Vec::new();
        loop {
            match self.listener.accept() {
                Ok(pair) => accepted.push(pair),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if would_block(&e) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(accepted)
    }
}

impl EventCallback for RdmaListenPort {
    fn on_readable(&self) {
        let accepted = match self.accept_all() {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("{} accept failed: {}", self.addr, e);
                return;
            }
        };
        let handler = self.handler.upgrade();
        for (stream, peer) in accepted {
            debug!("{} accepted control socket from {}", self.addr, peer);
            let conn = match self.stack.accept(stream, peer) {
                Ok(conn) => conn,
                Err(e) => {
                    warn!("{} cannot set up a connection for {}: {}", self.addr, peer, e);
                    continue;
                }
            };
            match &handler {
                Some(handler) => handler.on_new_connection(conn as ConnRef),
                None => conn.fault(),
            }
        }
    }

    fn on_error(&self) {
        warn!("listen port {} reported an error", self.addr);
    }
}
