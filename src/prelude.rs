//! The messenger prelude.
//!
//! The purpose of this module is to alleviate imports of the commonly-used
//! messenger types.

pub use crate::config::{ListenSpec, MsgConfig};
pub use crate::conn::{ConnId, ConnRef, Connection, ConnectionListener, ListenPortListener};
pub use crate::context::{MsgContext, MsgState};
pub use crate::dispatcher::{AddressResolver, Channel, Dispatcher, Message, MessageHeader, PeerAddress};
pub use crate::error::MsgError;
pub use crate::manager::{MsgManager, MsgerCallback};
pub use crate::mem::{MemoryManager, RdmaBuffer};
pub use crate::msg::{priority, Msg, MsgFlags, MsgType, MsgerId, NodeAddr, RdmaBufDesc, TransportType};
pub use crate::rdma::{RdmaConnection, RdmaRwWork, RdmaStack, RdmaStatus};
pub use crate::session::Session;
pub use crate::tcp::TcpStack;
pub use crate::worker::{MsgWorker, WorkerPool};
