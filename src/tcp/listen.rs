use std::fmt;
use std::io;
use std::net::{IpAddr, TcpListener};
use std::ops::RangeInclusive;
use std::os::fd::AsRawFd;
use std::sync::{Arc, Weak};

use log::{debug, info, warn};

use super::net;
use super::TcpConnection;
use crate::conn::{ConnRef, ListenPortListener};
use crate::error::{MsgError, Result};
use crate::event::{EventCallback, Interest};
use crate::msg::{NodeAddr, TransportType};
use crate::utils::interop::would_block;
use crate::worker::{MsgWorker, WorkerPool};

/// A listening TCP socket, driven by one worker. Accepted connections are
/// spread over the pool by load.
pub struct TcpListenPort {
    listener: TcpListener,
    addr: NodeAddr,
    worker: MsgWorker,
    workers: Arc<WorkerPool>,
    handler: Weak<dyn ListenPortListener>,
}

impl fmt::Debug for TcpListenPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TcpListenPort<{}>", self.addr)
    }
}

impl TcpListenPort {
    /// Bind on the first free port of `ports` and start accepting on
    /// worker 0.
    pub fn bind(
        ip: IpAddr,
        ports: RangeInclusive<u16>,
        workers: Arc<WorkerPool>,
        handler: Weak<dyn ListenPortListener>,
    ) -> Result<Arc<Self>> {
        let worker = workers.get(0).cloned().ok_or(MsgError::Shutdown)?;
        let listener = net::bind_first_free(ip, ports)?;
        let addr = NodeAddr::new(TransportType::Tcp, listener.local_addr()?);
        let port = Arc::new(Self {
            listener,
            addr,
            worker: worker.clone(),
            workers,
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

    /// Accept every pending socket and wrap it as a TCP connection.
    fn accept_all(&self) -> io::Result<Vec<ConnRef>> {
        let mut conns = Vec::new();
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let Some(worker) = self.workers.lightest_load_worker() else {
                        break;
                    };
                    debug!("{} accepted {}", self.addr, peer);
                    let peer = NodeAddr::new(TransportType::Tcp, peer);
                    let conn = TcpConnection::new(stream, worker.clone(), false, Some(peer))?;
                    conns.push(conn as ConnRef);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if would_block(&e) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(conns)
    }
}

impl EventCallback for TcpListenPort {
    fn on_readable(&self) {
        let conns = match self.accept_all() {
            Ok(conns) => conns,
            Err(e) => {
                warn!("{} accept failed: {}", self.addr, e);
                return;
            }
        };
        let Some(handler) = self.handler.upgrade() else {
            for conn in conns {
                conn.close();
            }
            return;
        };
        for conn in conns {
            handler.on_new_connection(conn);
        }
    }

    fn on_error(&self) {
        warn!("listen port {} reported an error", self.addr);
    }
}
