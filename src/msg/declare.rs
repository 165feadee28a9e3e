use super::{MsgerId, NodeAddr, WireError};

/// Identity declaration, sent as the first message of every outbound
/// connection so the acceptor can attach it to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclareId {
    pub msger_id: MsgerId,
    pub tcp_listen: Option<NodeAddr>,
    pub rdma_listen: Option<NodeAddr>,
}

impl DeclareId {
    /// Length of the encoded payload.
    pub fn encoded_len(&self) -> usize {
        MsgerId::ENCODED_LEN
            + 2
            + self.tcp_listen.map_or(0, |_| NodeAddr::ENCODED_LEN)
            + self.rdma_listen.map_or(0, |_| NodeAddr::ENCODED_LEN)
    }

    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, WireError> {
        let len = self.encoded_len();
        if buf.len() < len {
            return Err(WireError::BufferTooSmall(len, buf.len()));
        }

        let mut off = self.msger_id.encode(buf)?;
        buf[off] = self.tcp_listen.is_some() as u8;
        buf[off + 1] = self.rdma_listen.is_some() as u8;
        off += 2;
        for addr in [self.tcp_listen, self.rdma_listen].into_iter().flatten() {
            off += addr.encode(&mut buf[off..])?;
        }
        Ok(off)
    }

    pub fn to_vec(&self) -> Vec<u8> {
        let mut buf = vec![0u8; self.encoded_len()];
        // Sized exactly above.
        let _ = self.encode(&mut buf);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<(Self, usize), WireError> {
        let (msger_id, mut off) = MsgerId::decode(buf)?;
        if buf.len() < off + 2 {
            return Err(WireError::Truncated(off + 2, buf.len()));
        }
        let has_tcp = buf[off] != 0;
        let has_rdma = buf[off + 1] != 0;
        off += 2;

        let mut read_addr = |present: bool| -> Result<Option<NodeAddr>, WireError> {
            if !present {
                return Ok(None);
            }
            let (addr, n) = NodeAddr::decode(&buf[off..])
                .map_err(|_| WireError::Truncated(off + NodeAddr::ENCODED_LEN, buf.len()))?;
            off += n;
            Ok(Some(addr))
        };
        let tcp_listen = read_addr(has_tcp)?;
        let rdma_listen = read_addr(has_rdma)?;

        Ok((
            Self {
                msger_id,
                tcp_listen,
                rdma_listen,
            },
            off,
        ))
    }
}
