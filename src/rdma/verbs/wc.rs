use std::fmt;

use thiserror::Error;

/// Opcode of a completion queue entry.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum WcOpcode {
    /// Send request.
    #[default]
    Send = 0,
    /// RDMA write request.
    RdmaWrite = 1,
    /// RDMA read request.
    RdmaRead = 2,
    /// RDMA compare-and-swap request.
    CompSwap = 3,
    /// RDMA fetch-and-add request.
    FetchAdd = 4,
    /// Memory window bind request.
    BindMw = 5,
    /// Receive request.
    Recv = 128,
    /// Receive request with immediate data, consumed by an RDMA write.
    RecvRdmaImm = 129,
}

impl WcOpcode {
    /// Whether the completion belongs to a receive work request.
    #[inline]
    pub fn is_recv(&self) -> bool {
        (*self as u32) & 128 != 0
    }
}

impl TryFrom<u32> for WcOpcode {
    type Error = u32;

    fn try_from(wc_opcode: u32) -> Result<Self, Self::Error> {
        Ok(match wc_opcode {
            0 => WcOpcode::Send,
            1 => WcOpcode::RdmaWrite,
            2 => WcOpcode::RdmaRead,
            3 => WcOpcode::CompSwap,
            4 => WcOpcode::FetchAdd,
            5 => WcOpcode::BindMw,
            128 => WcOpcode::Recv,
            129 => WcOpcode::RecvRdmaImm,
            x => return Err(x),
        })
    }
}

/// Status of a completion queue entry.
///
/// The discriminants follow the `ibv_wc_status` enumeration.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Error)]
#[repr(u32)]
pub enum WcStatus {
    /// **Operation completed successfully:** the Work Request (and all of the
    /// unsignaled Work Requests posted before it) ended and its memory
    /// buffers are ready to be (re)used.
    #[default]
    #[error("success")]
    Success = 0,

    /// **Local Length Error:** a posted message exceeds the maximum message
    /// size, or a receive buffer is too small for the incoming message.
    #[error("local length error")]
    LocLenErr = 1,

    /// **Local QP Operation Error:** an internal QP consistency error.
    #[error("local QP operation error")]
    LocQpOpErr = 2,

    #[error("local EE context operation error")]
    LocEecOpErr = 3,

    /// **Local Protection Error:** a local buffer does not reference a Memory
    /// Region valid for the requested operation.
    #[error("local protection error")]
    LocProtErr = 4,

    /// **Work Request Flushed Error:** a Work Request was in process or
    /// outstanding when the QP transitioned into the Error State.
    #[error("WR flush error")]
    WrFlushErr = 5,

    #[error("memory window bind error")]
    MwBindErr = 6,

    #[error("bad response error")]
    BadRespErr = 7,

    #[error("local access error")]
    LocAccessErr = 8,

    /// **Remote Invalid Request Error:** the responder detected an invalid
    /// message on the channel.
    #[error("remote invalid request error")]
    RemInvReqErr = 9,

    /// **Remote Access Error:** a protection error occurred on a remote data
    /// buffer to be read or written.
    #[error("remote access error")]
    RemAccessErr = 10,

    #[error("remote operation error")]
    RemOpErr = 11,

    /// **Transport Retry Counter Exceeded:** the remote side didn't send any
    /// Ack or Nack. After the first message, this usually means the remote
    /// QP isn't available anymore.
    #[error("transport retry counter exceeded")]
    RetryExcErr = 12,

    /// **RNR Retry Counter Exceeded:** the remote side didn't post any WR to
    /// its Receive Queue in time.
    #[error("RNR retry counter exceeded")]
    RnrRetryExcErr = 13,

    #[error("local RDD violation error")]
    LocRddViolErr = 14,

    #[error("remote invalid RD request")]
    RemInvRdReqErr = 15,

    #[error("remote aborted error")]
    RemAbortErr = 16,

    #[error("invalid EE context number")]
    InvEecnErr = 17,

    #[error("invalid EE context state error")]
    InvEecStateErr = 18,

    #[error("fatal error")]
    FatalErr = 19,

    #[error("response timeout error")]
    RespTimeoutErr = 20,

    /// **General Error:** other error which isn't one of the above errors.
    #[error("general error")]
    GeneralErr = 21,
}

impl From<u32> for WcStatus {
    fn from(wc_status: u32) -> Self {
        use WcStatus::*;
        const ALL: [WcStatus; 22] = [
            Success,
            LocLenErr,
            LocQpOpErr,
            LocEecOpErr,
            LocProtErr,
            WrFlushErr,
            MwBindErr,
            BadRespErr,
            LocAccessErr,
            RemInvReqErr,
            RemAccessErr,
            RemOpErr,
            RetryExcErr,
            RnrRetryExcErr,
            LocRddViolErr,
            RemInvRdReqErr,
            RemAbortErr,
            InvEecnErr,
            InvEecStateErr,
            FatalErr,
            RespTimeoutErr,
            GeneralErr,
        ];
        ALL.get(wc_status as usize).copied().unwrap_or(GeneralErr)
    }
}

/// Work completion entry.
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct Wc {
    pub(crate) wr_id: u64,
    pub(crate) status: WcStatus,
    pub(crate) opcode: WcOpcode,
    pub(crate) byte_len: u32,
    pub(crate) imm: Option<u32>,
    pub(crate) qp_num: u32,
}

impl Wc {
    /// Get the work request ID.
    #[inline]
    pub fn wr_id(&self) -> u64 {
        self.wr_id
    }

    /// Get the completion status.
    #[inline]
    pub fn status(&self) -> WcStatus {
        self.status
    }

    /// Get the completion status as a `Result`.
    ///
    /// - If the status is `Success`, return the number of bytes processed or transferred.
    /// - Otherwise, return an error.
    #[inline]
    pub fn ok(&self) -> Result<usize, WcStatus> {
        match self.status {
            WcStatus::Success => Ok(self.bytes()),
            status => Err(status),
        }
    }

    /// Get the opcode of the work request.
    ///
    /// **NOTE:** the opcode is not reliable for unsuccessful completions.
    #[inline]
    pub fn opcode(&self) -> WcOpcode {
        self.opcode
    }

    /// Get the number of bytes processed or transferred.
    #[inline]
    pub fn bytes(&self) -> usize {
        self.byte_len as usize
    }

    /// Get the immediate data, in host byte order.
    #[inline]
    pub fn imm(&self) -> Option<u32> {
        self.imm
    }

    /// Get the number of the local queue pair that the work request belongs to.
    #[inline]
    pub fn qp_num(&self) -> u32 {
        self.qp_num
    }
}

impl fmt::Debug for Wc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wc")
            .field("wr_id", &self.wr_id)
            .field("status", &self.status)
            .field("opcode", &self.opcode)
            .field("qp_num", &self.qp_num)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_follow_verbs() {
        assert_eq!(WcStatus::from(0), WcStatus::Success);
        assert_eq!(WcStatus::from(5), WcStatus::WrFlushErr);
        assert_eq!(WcStatus::from(12), WcStatus::RetryExcErr);
        assert_eq!(WcStatus::from(99), WcStatus::GeneralErr);
        assert_eq!(WcStatus::RemAccessErr as u32, 10);
    }

    #[test]
    fn ok_reports_bytes_or_status() {
        let mut wc = Wc {
            byte_len: 42,
            ..Default::default()
        };
        assert_eq!(wc.ok(), Ok(42));
        wc.status = WcStatus::WrFlushErr;
        assert_eq!(wc.ok(), Err(WcStatus::WrFlushErr));
        assert!(WcOpcode::RecvRdmaImm.is_recv());
        assert!(!WcOpcode::RdmaRead.is_recv());
        assert_eq!(WcOpcode::try_from(129), Ok(WcOpcode::RecvRdmaImm));
    }
}
