//! A reactor-based messaging layer over TCP and RDMA transports.
//!
//! `rrmsg` moves messages between the components of a distributed storage
//! cluster. A fixed set of worker threads ([`worker::WorkerPool`]) each run
//! one reactor; connections of either transport are bound to one worker and
//! only driven on its thread. On top of the transports sit sessions, which
//! hold at most one connection per transport and priority for every peer
//! identity, and a [`dispatcher::Dispatcher`] routing component messages.
//!
//! RDMA resources are reached through [`rdma::verbs`]. By default it is an
//! in-process provider, so that RDMA connections work between contexts of
//! one process; the `verbs` feature drives real NICs through libibverbs.
//!
//! # Example
//!
//! ```no_run
//! use rrmsg::prelude::*;
//! use anyhow::Result;
//!
//! fn main() -> Result<()> {
//!     let config = MsgConfig::from_toml_str(
//!         r#"
//!         msger_id = "127.0.0.1/7000"
//!         node_listen_ports = ["TCP@127.0.0.1/7000"]
//!         "#,
//!     )?;
//!     let ctx = MsgContext::new(config)?;
//!     ctx.start()?;
//!
//!     let peer: MsgerId = "127.0.0.1/8000".parse()?;
//!     let session = ctx.manager().get_session(peer);
//!     session.set_listen_addr("tcp@127.0.0.1/8000".parse()?);
//!     let conn = session.get_connection(ctx.manager(), TransportType::Tcp, priority::DEFAULT)?;
//!     conn.send_msg(Msg::new(MsgType::Ctl))?;
//!
//!     ctx.fin();
//!     Ok(())
//! }
//! ```

/// Messenger configuration.
pub mod config;

/// Connection contract shared by both transports.
pub mod conn;

pub mod context;
pub mod dispatcher;

/// Error types.
pub mod error;

pub mod event;

/// Registered memory pool.
pub mod mem;

pub mod manager;
pub mod msg;
pub mod prelude;
pub mod rdma;
pub mod session;
pub mod tcp;

mod utils;

pub mod worker;
