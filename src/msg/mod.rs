//! Wire format shared by all transports.

mod addr;
mod declare;
mod header;

use bytes::{Bytes, BytesMut};

pub use self::addr::*;
pub use self::declare::*;
pub use self::header::*;

/// Descriptor of a registered buffer that a peer may access with one-sided
/// RDMA operations.
///
/// Encoded as `{ addr: u64, rkey: u32, len: u32 }` in little-endian byte
/// order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RdmaBufDesc {
    pub addr: u64,
    pub rkey: u32,
    pub len: u32,
}

impl RdmaBufDesc {
    pub const ENCODED_LEN: usize = 16;

    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, WireError> {
        if buf.len() < Self::ENCODED_LEN {
            return Err(WireError::BufferTooSmall(Self::ENCODED_LEN, buf.len()));
        }
        buf[0..8].copy_from_slice(&self.addr.to_le_bytes());
        buf[8..12].copy_from_slice(&self.rkey.to_le_bytes());
        buf[12..16].copy_from_slice(&self.len.to_le_bytes());
        Ok(Self::ENCODED_LEN)
    }

    pub fn decode(buf: &[u8]) -> Result<(Self, usize), WireError> {
        if buf.len() < Self::ENCODED_LEN {
            return Err(WireError::Truncated(Self::ENCODED_LEN, buf.len()));
        }
        let mut addr = [0u8; 8];
        addr.copy_from_slice(&buf[0..8]);
        let desc = Self {
            addr: u64::from_le_bytes(addr),
            rkey: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            len: u32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]),
        };
        Ok((desc, Self::ENCODED_LEN))
    }
}

/// Encode a descriptor list as a payload prefix.
pub fn encode_rdma_descs(descs: &[RdmaBufDesc]) -> Bytes {
    let mut buf = BytesMut::zeroed(descs.len() * RdmaBufDesc::ENCODED_LEN);
    for (i, desc) in descs.iter().enumerate() {
        let off = i * RdmaBufDesc::ENCODED_LEN;
        // Sized exactly above.
        let _ = desc.encode(&mut buf[off..]);
    }
    buf.freeze()
}

/// Decode `count` descriptors from the beginning of `buf`.
pub fn decode_rdma_descs(buf: &[u8], count: usize) -> Result<(Vec<RdmaBufDesc>, usize), WireError> {
    let need = count * RdmaBufDesc::ENCODED_LEN;
    if buf.len() < need {
        return Err(WireError::Truncated(need, buf.len()));
    }
    let descs = buf[..need]
        .chunks_exact(RdmaBufDesc::ENCODED_LEN)
        .map(|chunk| RdmaBufDesc::decode(chunk).map(|(d, _)| d))
        .collect::<Result<Vec<_>, _>>()?;
    Ok((descs, need))
}

/// A message: a fixed header followed by a payload made of segments.
///
/// Small payloads are copied in with [`Msg::append_data`]; bulk payloads are
/// attached by reference with [`Msg::append_bytes`].
#[derive(Debug, Clone, Default)]
pub struct Msg {
    header: MsgHeader,
    segments: Vec<Bytes>,
    ttype: Option<TransportType>,
}

impl Msg {
    pub fn new(msg_type: MsgType) -> Self {
        Self {
            header: MsgHeader::new(msg_type),
            segments: Vec::new(),
            ttype: None,
        }
    }

    /// Build a received message from a decoded header and its payload.
    pub(crate) fn from_parts(header: MsgHeader, payload: Bytes, ttype: TransportType) -> Self {
        let segments = if payload.is_empty() {
            Vec::new()
        } else {
            vec![payload]
        };
        Self {
            header,
            segments,
            ttype: Some(ttype),
        }
    }

    /// An immediate-data message as delivered by the RDMA transport.
    pub(crate) fn imm_data(imm: u32) -> Self {
        let mut msg = Self::new(MsgType::ImmData);
        msg.header.flags = MsgFlags::IMM;
        msg.append_data(&imm.to_le_bytes());
        msg.ttype = Some(TransportType::Rdma);
        msg
    }

    #[inline]
    pub fn header(&self) -> &MsgHeader {
        &self.header
    }

    #[inline]
    pub fn header_mut(&mut self) -> &mut MsgHeader {
        &mut self.header
    }

    #[inline]
    pub fn msg_type(&self) -> MsgType {
        self.header.msg_type
    }

    #[inline]
    pub fn flags(&self) -> MsgFlags {
        self.header.flags
    }

    #[inline]
    pub fn priority(&self) -> u8 {
        self.header.priority
    }

    #[inline]
    pub fn set_priority(&mut self, priority: u8) {
        self.header.priority = priority;
    }

    /// Transport the message arrived on, `None` for locally built messages.
    #[inline]
    pub fn transport(&self) -> Option<TransportType> {
        self.ttype
    }

    /// Payload length, excluding the header.
    #[inline]
    pub fn payload_len(&self) -> usize {
        self.header.len as usize
    }

    /// Length of the message on the wire.
    #[inline]
    pub fn total_bytes(&self) -> usize {
        MsgHeader::LEN + self.payload_len()
    }

    /// Encoded header.
    #[inline]
    pub fn encode_header(&self) -> [u8; MsgHeader::LEN] {
        self.header.to_bytes()
    }

    /// Copy `data` into the payload.
    pub fn append_data(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.append_bytes(Bytes::copy_from_slice(data));
    }

    /// Attach `data` to the payload without copying.
    pub fn append_bytes(&mut self, data: Bytes) {
        if data.is_empty() {
            return;
        }
        self.header.len += data.len() as u32;
        self.segments.push(data);
    }

    /// Attach a list of RDMA buffer descriptors. Must be called before any
    /// other payload is appended.
    pub fn set_rdma_descs(&mut self, descs: &[RdmaBufDesc], fetch: bool) {
        debug_assert!(self.segments.is_empty());
        debug_assert!(descs.len() <= u8::MAX as usize);
        self.header.flags.insert(MsgFlags::RDMA);
        if fetch {
            self.header.flags.insert(MsgFlags::MEM_FETCH);
        }
        self.header.reserved = descs.len() as u8;
        self.append_bytes(encode_rdma_descs(descs));
    }

    /// Decode the RDMA buffer descriptors prefixing the payload, if any.
    /// Return the descriptors and the remaining payload.
    pub fn rdma_descs(&self) -> Result<(Vec<RdmaBufDesc>, Bytes), WireError> {
        let payload = self.flatten();
        if !self.header.flags.contains(MsgFlags::RDMA) {
            return Ok((Vec::new(), payload));
        }
        let (descs, used) = decode_rdma_descs(&payload, self.header.reserved as usize)?;
        Ok((descs, payload.slice(used..)))
    }

    /// Payload segments in order.
    #[inline]
    pub fn data_segments(&self) -> &[Bytes] {
        &self.segments
    }

    /// The whole payload as one contiguous buffer.
    pub fn flatten(&self) -> Bytes {
        match self.segments.len() {
            0 => Bytes::new(),
            1 => self.segments[0].clone(),
            _ => {
                let mut buf = BytesMut::with_capacity(self.payload_len());
                for seg in &self.segments {
                    buf.extend_from_slice(seg);
                }
                buf.freeze()
            }
        }
    }

    /// Header bytes followed by every payload segment, in wire order.
    pub(crate) fn into_wire_pieces(self) -> impl Iterator<Item = Bytes> {
        let header = Bytes::copy_from_slice(&self.header.to_bytes());
        std::iter::once(header).chain(self.segments)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn payload_segments() {
        let mut msg = Msg::new(MsgType::Io);
        msg.append_data(b"hello ");
        msg.append_bytes(Bytes::from_static(b"world"));
        msg.append_data(b"");
        assert_eq!(msg.payload_len(), 11);
        assert_eq!(msg.total_bytes(), 19);
        assert_eq!(msg.data_segments().len(), 2);
        assert_eq!(&msg.flatten()[..], b"hello world");

        let pieces: Vec<Bytes> = msg.clone().into_wire_pieces().collect();
        assert_eq!(pieces.len(), 3);
        let (header, _) = MsgHeader::decode(&pieces[0]).unwrap();
        assert_eq!(header.len, 11);
    }

    #[test]
    fn rdma_descriptor_prefix() {
        let descs = [
            RdmaBufDesc {
                addr: 0x1000,
                rkey: 7,
                len: 4096,
            },
            RdmaBufDesc {
                addr: 0x9000,
                rkey: 7,
                len: 100,
            },
        ];
        let mut msg = Msg::new(MsgType::Io);
        msg.set_rdma_descs(&descs, true);
        msg.append_data(b"tail");
        assert!(msg.flags().contains(MsgFlags::RDMA | MsgFlags::MEM_FETCH));
        assert_eq!(msg.header().reserved, 2);

        let (decoded, rest) = msg.rdma_descs().unwrap();
        assert_eq!(decoded, descs);
        assert_eq!(&rest[..], b"tail");
    }

    #[test]
    fn imm_message() {
        let msg = Msg::imm_data(0xdead_beef);
        assert_eq!(msg.msg_type(), MsgType::ImmData);
        assert_eq!(&msg.flatten()[..], &0xdead_beefu32.to_le_bytes());
        assert_eq!(msg.transport(), Some(TransportType::Rdma));
    }
}
