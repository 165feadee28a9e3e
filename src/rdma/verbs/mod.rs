//! RDMA verbs.
//!
//! Two providers expose the same resource types ([`Context`], [`Pd`], [`Mr`],
//! [`CompChannel`], [`Cq`], [`Srq`], and [`Qp`]):
//!
//! - the in-process provider (default), which emulates reliable-connected
//!   queue pairs, memory keys, two-sided sends with immediate data, one-sided
//!   reads and writes, and completion channels inside one process;
//! - the libibverbs provider, enabled with the `verbs` feature.
//!
//! All resource holder types are `Arc`-based and cheap to clone.

mod wc;

#[cfg(not(feature = "verbs"))]
mod soft;
#[cfg(not(feature = "verbs"))]
pub use self::soft::*;

#[cfg(feature = "verbs")]
mod hw;
#[cfg(feature = "verbs")]
pub use self::hw::*;

use std::fmt;
use std::io;

use thiserror::Error;

pub use self::wc::*;

/// [`u8`]: **Port number**, identifies a port on an HCA.
pub type PortNum = u8;

/// [`u16`]: **Local identifier (LID)**, identifies a port in the cluster.
pub type Lid = u16;

/// [`u32`]: **Queue pair number**, identifies a local queue pair.
pub type Qpn = u32;

/// [`u32`]: **Packet sequence number (PSN)**, identifies a packet in a flow.
pub type Psn = u32;

/// [`u32`]: **Local key**, identifies a local memory region.
pub type LKey = u32;

/// [`u32`]: **Remote key**, identifies a remote memory region.
pub type RKey = u32;

/// [`u64`]: **Work request identifier**, designated by the user to identify a work request.
pub type WrId = u64;

/// [`u32`]: **Immediate data**, carried in send-type work requests.
pub type ImmData = u32;

/// Global identifier of a port.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Gid(pub [u8; 16]);

impl Gid {
    /// The GID as four big-endian words.
    pub fn words(&self) -> [u32; 4] {
        let mut words = [0u32; 4];
        for (i, w) in words.iter_mut().enumerate() {
            *w = u32::from_be_bytes([
                self.0[4 * i],
                self.0[4 * i + 1],
                self.0[4 * i + 2],
                self.0[4 * i + 3],
            ]);
        }
        words
    }

    pub fn from_words(words: [u32; 4]) -> Self {
        let mut raw = [0u8; 16];
        for (i, w) in words.iter().enumerate() {
            raw[4 * i..4 * i + 4].copy_from_slice(&w.to_be_bytes());
        }
        Gid(raw)
    }
}

impl fmt::Debug for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Gid({})", self)
    }
}

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for w in self.words() {
            write!(f, "{:08x}", w)?;
        }
        Ok(())
    }
}

/// Queue pair state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpState {
    Reset,
    Init,
    Rtr,
    Rts,
    Error,
}

/// Queue pair capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QpCaps {
    pub max_send_wr: u32,
    pub max_recv_wr: u32,
    pub max_send_sge: u32,
    pub max_recv_sge: u32,
    pub max_inline_data: u32,
}

impl Default for QpCaps {
    fn default() -> Self {
        Self {
            max_send_wr: 64,
            max_recv_wr: 1024,
            max_send_sge: 1,
            max_recv_sge: 1,
            max_inline_data: 128,
        }
    }
}

/// Queue pair creation attributes.
pub struct QpInitAttr<'a> {
    pub send_cq: &'a Cq,
    pub recv_cq: &'a Cq,
    pub srq: Option<&'a Srq>,
    pub caps: QpCaps,
}

/// Attributes for the INIT to RTR transition.
#[derive(Debug, Clone, Copy)]
pub struct RtrAttr {
    pub dest_qpn: Qpn,
    pub rq_psn: Psn,
    pub dlid: Lid,
    pub dgid: Gid,
    pub sl: u8,
    pub traffic_class: u8,
    /// Path MTU in bytes.
    pub path_mtu: u32,
    pub min_rnr_timer: u8,
}

/// Attributes for the RTR to RTS transition.
#[derive(Debug, Clone, Copy)]
pub struct RtsAttr {
    pub sq_psn: Psn,
    pub timeout: u8,
    pub retry_cnt: u8,
    pub rnr_retry: u8,
}

/// Scatter-gather element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sge {
    pub addr: u64,
    pub length: u32,
    pub lkey: LKey,
}

/// Remote memory area targeted by a one-sided operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RemoteMem {
    pub addr: u64,
    pub rkey: RKey,
}

/// Operation of a send work request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOp {
    Send,
    SendWithImm(ImmData),
    Write(RemoteMem),
    WriteWithImm(RemoteMem, ImmData),
    Read(RemoteMem),
}

/// Send work request.
#[derive(Debug, Clone, Copy)]
pub struct SendWr {
    pub wr_id: WrId,
    pub op: SendOp,
    /// `None` for zero-length operations.
    pub sge: Option<Sge>,
    pub signaled: bool,
    pub inline: bool,
}

/// Receive work request.
#[derive(Debug, Clone, Copy)]
pub struct RecvWr {
    pub wr_id: WrId,
    pub sge: Sge,
}

/// Queue pair creation error type.
#[derive(Debug, Error)]
pub enum QpCreationError {
    /// Verbs interfaces returned an error.
    #[error("I/O error from verbs")]
    IoError(#[from] io::Error),

    /// Specified capabilities are not supported by the device.
    /// The three fields are for the capability name, the maximum supported
    /// value, and the required value.
    #[error("capability not enough: {0} supports up to {1}, {2} required")]
    CapabilityNotEnough(String, u32, u32),
}

/// CQ creation error type.
#[derive(Debug, Error)]
pub enum CqCreationError {
    /// Verbs interfaces returned an error.
    #[error("I/O error from verbs")]
    IoError(#[from] io::Error),

    /// The capacity of the CQ is larger than the device's maximum allowed
    /// capacity, which is contained in the error.
    #[error("CQ capacity too large (maximum: {0})")]
    TooManyCqes(u32),
}

pub(crate) fn check_caps(caps: &QpCaps, max_wr: u32, max_inline: u32) -> Result<(), QpCreationError> {
    let checks = [
        ("max_send_wr", max_wr, caps.max_send_wr),
        ("max_recv_wr", max_wr, caps.max_recv_wr),
        ("max_inline_data", max_inline, caps.max_inline_data),
    ];
    for (name, max, required) in checks {
        if required > max {
            return Err(QpCreationError::CapabilityNotEnough(
                name.to_owned(),
                max,
                required,
            ));
        }
    }
    Ok(())
}
