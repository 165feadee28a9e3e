//! Error types.

use std::io;

use thiserror::Error;

use crate::msg::{TransportType, WireError};
use crate::rdma::verbs::{CqCreationError, QpCreationError};

/// Configuration loading or validation error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read configuration file")]
    Io(#[from] io::Error),

    #[error("malformed configuration")]
    Toml(#[from] toml::de::Error),

    /// A key holds a value outside its valid range or syntax.
    #[error("invalid `{0}`: {1}")]
    Invalid(&'static str, String),
}

/// Registered memory error.
#[derive(Debug, Error)]
pub enum MemError {
    /// Buddy allocator level bounds are not acceptable. The fields are the
    /// minimum and the maximum level.
    #[error("bad buddy levels: min {0}, max {1}")]
    BadLevels(u32, u32),

    /// A request exceeds the largest block. The fields are the requested and
    /// the largest size.
    #[error("request of {0} bytes exceeds the largest block of {1} bytes")]
    TooLarge(usize, usize),

    /// No more region may be added to the pool.
    #[error("memory pool exhausted at {0} regions")]
    Exhausted(usize),

    #[error("cannot map memory region")]
    Mmap(#[source] io::Error),

    #[error("cannot register memory region")]
    Register(#[source] io::Error),
}

/// RDMA handshake error.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The control record does not parse.
    #[error("malformed handshake record: {0:?}")]
    Malformed(String),

    /// The peer advertised a different QP number for us than the one we own.
    #[error("peer expects QP {got:#x}, local QP is {expected:#x}")]
    QpnMismatch { expected: u32, got: u32 },
}

/// Messaging layer error.
#[derive(Debug, Error)]
pub enum MsgError {
    #[error("I/O error")]
    Io(#[from] io::Error),

    #[error("wire format error")]
    Wire(#[from] WireError),

    #[error("configuration error")]
    Config(#[from] ConfigError),

    #[error("memory error")]
    Mem(#[from] MemError),

    #[error("handshake error")]
    Handshake(#[from] HandshakeError),

    #[error("QP creation error")]
    QpCreation(#[from] QpCreationError),

    #[error("CQ creation error")]
    CqCreation(#[from] CqCreationError),

    /// The session already holds a connection under the same key.
    #[error("duplicate {0} connection with priority {1}")]
    DuplicateConnection(TransportType, u8),

    /// The peer did not declare a listen address for the transport.
    #[error("no {0} listen address known for the peer")]
    NoListenAddr(TransportType),

    #[error("{0} transport is not enabled")]
    TransportDisabled(TransportType),

    #[error("connection is not usable")]
    NotConnected,

    /// A read/write work carries more pairs than allowed. The field is the
    /// number of pairs.
    #[error("too many buffer pairs in one RDMA work: {0}")]
    TooManyRwBufs(usize),

    /// Local buffers and remote descriptors of an RDMA transfer differ in
    /// number.
    #[error("{bufs} local buffers for {descs} remote buffers")]
    RdmaPairMismatch { bufs: usize, descs: usize },

    #[error("messenger is shutting down")]
    Shutdown,

    #[error("no channel registered for component {0:#x}")]
    ChannelNotFound(u64),

    #[error("cannot resolve component {0:#x}")]
    Unresolvable(u64),
}

/// Result type of the messaging layer.
pub type Result<T, E = MsgError> = std::result::Result<T, E>;
