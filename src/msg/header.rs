use std::fmt;

use thiserror::Error;

/// Wire format error type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    /// The destination buffer cannot hold the encoded item. The fields are
    /// the required and the available length.
    #[error("buffer too small: {0} bytes required, {1} available")]
    BufferTooSmall(usize, usize),

    /// The source buffer ends before the item is complete. The fields are
    /// the required and the available length.
    #[error("truncated input: {0} bytes required, {1} available")]
    Truncated(usize, usize),

    /// The header carries a message type this layer does not know.
    #[error("unknown message type {0}")]
    UnknownType(u8),

    /// A node address is malformed.
    #[error("bad address: {0}")]
    BadAddress(String),

    /// The header announces a payload larger than accepted. The fields are
    /// the announced and the largest accepted length.
    #[error("payload of {0} bytes exceeds the limit of {1} bytes")]
    TooLong(usize, usize),
}

/// Type of a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MsgType {
    /// Empty message.
    None = 0,
    /// Control message.
    Ctl = 1,
    /// I/O message carrying component traffic.
    Io = 2,
    /// Identity declaration, sent once as the first message of a connection.
    DeclareId = 3,
    /// Immediate data delivered without a payload.
    ImmData = 4,
}

impl TryFrom<u8> for MsgType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(MsgType::None),
            1 => Ok(MsgType::Ctl),
            2 => Ok(MsgType::Io),
            3 => Ok(MsgType::DeclareId),
            4 => Ok(MsgType::ImmData),
            _ => Err(WireError::UnknownType(value)),
        }
    }
}

/// Flag bits of a message header.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct MsgFlags(pub u8);

impl MsgFlags {
    /// The message is a response.
    pub const RESP: MsgFlags = MsgFlags(1);
    /// The payload starts with `reserved` RDMA buffer descriptors.
    pub const RDMA: MsgFlags = MsgFlags(1 << 1);
    /// The described buffers are to be fetched by the receiver.
    pub const MEM_FETCH: MsgFlags = MsgFlags(1 << 2);
    /// The message carries immediate data only.
    pub const IMM: MsgFlags = MsgFlags(1 << 3);

    /// Empty flag set.
    #[inline]
    pub const fn empty() -> Self {
        MsgFlags(0)
    }

    /// Whether all bits in `other` are set.
    #[inline]
    pub const fn contains(self, other: MsgFlags) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn insert(&mut self, other: MsgFlags) {
        self.0 |= other.0;
    }

    #[inline]
    pub fn remove(&mut self, other: MsgFlags) {
        self.0 &= !other.0;
    }
}

impl std::ops::BitOr for MsgFlags {
    type Output = MsgFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        MsgFlags(self.0 | rhs.0)
    }
}

impl fmt::Debug for MsgFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut set = f.debug_set();
        for (flag, name) in [
            (Self::RESP, "RESP"),
            (Self::RDMA, "RDMA"),
            (Self::MEM_FETCH, "MEM_FETCH"),
            (Self::IMM, "IMM"),
        ] {
            if self.contains(flag) {
                set.entry(&name);
            }
        }
        set.finish()
    }
}

/// Message priorities.
pub mod priority {
    pub const LOW: u8 = 64;
    pub const DEFAULT: u8 = 127;
    pub const HIGH: u8 = 196;
    pub const HIGHEST: u8 = 255;
}

/// Fixed-size message header.
///
/// Encoded as `{ type: u8, flags: u8, priority: u8, reserved: u8, len: u32 }`
/// in little-endian byte order. `len` never includes the header itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgHeader {
    pub msg_type: MsgType,
    pub flags: MsgFlags,
    pub priority: u8,
    /// RDMA descriptor count when [`MsgFlags::RDMA`] is set.
    pub reserved: u8,
    /// Payload length in bytes.
    pub len: u32,
}

impl Default for MsgHeader {
    fn default() -> Self {
        Self::new(MsgType::None)
    }
}

impl MsgHeader {
    /// Length of an encoded header.
    pub const LEN: usize = 8;

    /// Create a header of the given type with default priority and no payload.
    pub const fn new(msg_type: MsgType) -> Self {
        Self {
            msg_type,
            flags: MsgFlags::empty(),
            priority: priority::DEFAULT,
            reserved: 0,
            len: 0,
        }
    }

    /// Encode the header into the beginning of `buf`.
    /// Return the number of bytes written.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, WireError> {
        if buf.len() < Self::LEN {
            return Err(WireError::BufferTooSmall(Self::LEN, buf.len()));
        }
        buf[0] = self.msg_type as u8;
        buf[1] = self.flags.0;
        buf[2] = self.priority;
        buf[3] = self.reserved;
        buf[4..8].copy_from_slice(&self.len.to_le_bytes());
        Ok(Self::LEN)
    }

    /// Encode the header into a fixed-size array.
    #[inline]
    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        buf[0] = self.msg_type as u8;
        buf[1] = self.flags.0;
        buf[2] = self.priority;
        buf[3] = self.reserved;
        buf[4..8].copy_from_slice(&self.len.to_le_bytes());
        buf
    }

    /// Decode a header from the beginning of `buf`.
    /// Return the header and the number of bytes read.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), WireError> {
        if buf.len() < Self::LEN {
            return Err(WireError::Truncated(Self::LEN, buf.len()));
        }
        let header = Self {
            msg_type: MsgType::try_from(buf[0])?,
            flags: MsgFlags(buf[1]),
            priority: buf[2],
            reserved: buf[3],
            len: u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]),
        };
        Ok((header, Self::LEN))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let mut header = MsgHeader::new(MsgType::Io);
        header.flags = MsgFlags::RESP | MsgFlags::RDMA;
        header.priority = priority::HIGH;
        header.reserved = 3;
        header.len = 0x0102_0304;

        let mut buf = [0u8; 16];
        assert_eq!(header.encode(&mut buf).unwrap(), MsgHeader::LEN);
        assert_eq!(&buf[4..8], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&buf[..MsgHeader::LEN], &header.to_bytes());

        let (decoded, read) = MsgHeader::decode(&buf).unwrap();
        assert_eq!(read, MsgHeader::LEN);
        assert_eq!(decoded, header);
    }

    #[test]
    fn encode_into_short_buffer_fails() {
        let header = MsgHeader::new(MsgType::Ctl);
        let mut buf = [0xAAu8; MsgHeader::LEN - 1];
        assert_eq!(
            header.encode(&mut buf),
            Err(WireError::BufferTooSmall(MsgHeader::LEN, MsgHeader::LEN - 1))
        );
        // Nothing is partially written.
        assert!(buf.iter().all(|b| *b == 0xAA));
    }

    #[test]
    fn decode_rejects_truncated_and_unknown() {
        assert!(matches!(
            MsgHeader::decode(&[1, 0, 0]),
            Err(WireError::Truncated(8, 3))
        ));
        let buf = [42u8, 0, 0, 0, 0, 0, 0, 0];
        assert_eq!(MsgHeader::decode(&buf), Err(WireError::UnknownType(42)));
    }

    #[test]
    fn flag_ops() {
        let mut flags = MsgFlags::empty();
        flags.insert(MsgFlags::RDMA);
        flags.insert(MsgFlags::MEM_FETCH);
        assert!(flags.contains(MsgFlags::RDMA | MsgFlags::MEM_FETCH));
        flags.remove(MsgFlags::RDMA);
        assert!(!flags.contains(MsgFlags::RDMA));
        assert_eq!(format!("{:?}", flags), "{\"MEM_FETCH\"}");
    }
}
