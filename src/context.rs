//! The messenger of one process: configuration, workers, stacks and the
//! manager, built once at startup and torn down at shutdown.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{info, warn};
use parking_lot::Mutex;

use crate::config::MsgConfig;
use crate::error::{MsgError, Result};
use crate::manager::MsgManager;
use crate::rdma::RdmaStack;
use crate::worker::WorkerPool;

/// How long [`MsgContext::fin`] waits for connections to close.
pub const CLEAR_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle of a [`MsgContext`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MsgState {
    /// Built, workers not running.
    Init,
    Running,
    /// Listen ports closed, connections closing.
    Clearing,
    /// Every connection closed.
    ClearDone,
    /// Stacks and workers stopped.
    Fin,
}

impl fmt::Display for MsgState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MsgState::Init => "INIT",
            MsgState::Running => "RUNNING",
            MsgState::Clearing => "CLEARING",
            MsgState::ClearDone => "CLEAR_DONE",
            MsgState::Fin => "FIN",
        };
        f.write_str(s)
    }
}

pub struct MsgContext {
    config: MsgConfig,
    state: Mutex<MsgState>,
    workers: Arc<WorkerPool>,
    rdma: Option<RdmaStack>,
    manager: Arc<MsgManager>,
}

impl fmt::Debug for MsgContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MsgContext")
            .field("state", &*self.state.lock())
            .field("workers", &self.workers.len())
            .field("manager", &self.manager)
            .finish()
    }
}

impl MsgContext {
    /// Validate `config` and build every component. Nothing runs until
    /// [`MsgContext::start`].
    pub fn new(config: MsgConfig) -> Result<Self> {
        config.validate()?;
        let cpu_map = config.cpu_map()?;
        let workers = Arc::new(WorkerPool::new(config.worker_num, &cpu_map)?);
        let rdma = if config.rdma_enable {
            Some(RdmaStack::new(&config, workers.clone())?)
        } else {
            None
        };
        let manager = MsgManager::new(config.msger()?, workers.clone(), rdma.clone());
        Ok(Self {
            config,
            state: Mutex::new(MsgState::Init),
            workers,
            rdma,
            manager,
        })
    }

    /// Build from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        Self::new(MsgConfig::load(path)?)
    }

    #[inline]
    pub fn config(&self) -> &MsgConfig {
        &self.config
    }

    pub fn state(&self) -> MsgState {
        *self.state.lock()
    }

    #[inline]
    pub fn workers(&self) -> &Arc<WorkerPool> {
        &self.workers
    }

    #[inline]
    pub fn rdma_stack(&self) -> Option<&RdmaStack> {
        self.rdma.as_ref()
    }

    #[inline]
    pub fn manager(&self) -> &Arc<MsgManager> {
        &self.manager
    }

    fn set_state(&self, state: MsgState) {
        *self.state.lock() = state;
        info!("messenger state: {}", state);
    }

    /// Start the workers and listen on the configured ports.
    pub fn start(&self) -> Result<()> {
        match self.state() {
            MsgState::Init => {}
            MsgState::Running => return Ok(()),
            _ => return Err(MsgError::Shutdown),
        }
        self.workers.start()?;
        for spec in self.config.listen_specs()? {
            match self.manager.add_listen_port(&spec) {
                Ok(addr) => info!("listen: {}", addr),
                Err(e) => {
                    warn!("cannot listen on {:?}: {}", spec, e);
                    self.fin();
                    return Err(e);
                }
            }
        }
        self.set_state(MsgState::Running);
        Ok(())
    }

    /// Close every connection, waiting up to [`CLEAR_TIMEOUT`] for them,
    /// then stop the stacks and the workers.
    pub fn fin(&self) {
        if self.state() == MsgState::Fin {
            return;
        }
        self.set_state(MsgState::Clearing);
        self.manager.clear();
        let deadline = Instant::now() + CLEAR_TIMEOUT;
        while !self.manager.is_clear_done() {
            if Instant::now() >= deadline {
                warn!("connections still open after {:?}", CLEAR_TIMEOUT);
                break;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        self.set_state(MsgState::ClearDone);

        if let Some(rdma) = &self.rdma {
            rdma.stop();
        }
        self.workers.stop();
        self.set_state(MsgState::Fin);
    }
}

impl Drop for MsgContext {
    fn drop(&mut self) {
        if self.state() != MsgState::Fin {
            self.fin();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::{ConnRef, Connection};
    use crate::manager::MsgerCallback;
    use crate::msg::{Msg, MsgType, TransportType};
    use std::sync::mpsc;
    use std::sync::Weak;

    struct Echo {
        tx: std::sync::Mutex<mpsc::Sender<Vec<u8>>>,
    }

    impl MsgerCallback for Echo {
        fn on_conn_recv(&self, _conn: &ConnRef, msg: Msg) {
            let _ = self.tx.lock().unwrap().send(msg.flatten().to_vec());
        }
    }

    fn config(listen: &str) -> MsgConfig {
        MsgConfig {
            node_listen_ports: vec![listen.to_owned()],
            worker_num: 2,
            ..Default::default()
        }
    }

    #[test]
    fn lifecycle() -> anyhow::Result<()> {
        let server = MsgContext::new(config("TCP@127.0.0.1/0"))?;
        assert_eq!(server.state(), MsgState::Init);
        server.start()?;
        assert_eq!(server.state(), MsgState::Running);
        let (tx, rx) = mpsc::channel();
        let echo = Arc::new(Echo {
            tx: std::sync::Mutex::new(tx),
        });
        server.manager().set_msger_cb(Arc::downgrade(&echo) as Weak<dyn MsgerCallback>);
        let addr = server.manager().listen_addrs()[0];
        assert_eq!(addr.transport(), TransportType::Tcp);

        let client = MsgContext::new(config("TCP@127.0.0.1/0"))?;
        client.start()?;
        let session = client.manager().get_session(server.manager().msger_id());
        session.set_listen_addr(addr);
        let conn = session.get_connection(client.manager(), TransportType::Tcp, 127)?;
        let mut msg = Msg::new(MsgType::Ctl);
        msg.append_data(b"ping");
        conn.send_msg(msg)?;
        assert_eq!(rx.recv_timeout(Duration::from_secs(5))?, b"ping");

        client.fin();
        assert_eq!(client.state(), MsgState::Fin);
        assert!(conn.is_closed());
        assert!(matches!(client.start(), Err(MsgError::Shutdown)));

        server.fin();
        assert_eq!(server.state(), MsgState::Fin);
        assert!(server.manager().listen_addrs().is_empty());
        Ok(())
    }

    #[test]
    fn invalid_config_is_rejected() {
        let cfg = MsgConfig {
            worker_num: 0,
            ..Default::default()
        };
        assert!(matches!(MsgContext::new(cfg), Err(MsgError::Config(_))));
    }
}
