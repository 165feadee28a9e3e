use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::str::FromStr;

use super::WireError;

/// Transport kind of a connection or a listen address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum TransportType {
    Unknown = 0,
    Tcp = 1,
    Rdma = 2,
}

impl From<u8> for TransportType {
    fn from(value: u8) -> Self {
        match value {
            1 => TransportType::Tcp,
            2 => TransportType::Rdma,
            _ => TransportType::Unknown,
        }
    }
}

impl fmt::Display for TransportType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportType::Unknown => write!(f, "unknown"),
            TransportType::Tcp => write!(f, "tcp"),
            TransportType::Rdma => write!(f, "rdma"),
        }
    }
}

impl FromStr for TransportType {
    type Err = WireError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "tcp" => Ok(TransportType::Tcp),
            "rdma" => Ok(TransportType::Rdma),
            _ => Err(WireError::BadAddress(format!("unknown transport `{}`", s))),
        }
    }
}

const ADDR_TYPE_IPV4: u8 = 1;
const ADDR_TYPE_IPV6: u8 = 2;

/// Address of a transport endpoint.
///
/// The binary form is `{ ttype: u8, addr_type: u8, port: u16, addr: [u8; 16] }`
/// with the port in little-endian byte order and IPv4 addresses occupying
/// the first four address bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeAddr {
    ttype: TransportType,
    addr: SocketAddr,
}

impl NodeAddr {
    /// Length of the binary form.
    pub const ENCODED_LEN: usize = 20;

    pub fn new(ttype: TransportType, addr: SocketAddr) -> Self {
        Self { ttype, addr }
    }

    #[inline]
    pub fn transport(&self) -> TransportType {
        self.ttype
    }

    #[inline]
    pub fn socket_addr(&self) -> SocketAddr {
        self.addr
    }

    #[inline]
    pub fn ip(&self) -> IpAddr {
        self.addr.ip()
    }

    #[inline]
    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Same address with a different port.
    pub fn with_port(&self, port: u16) -> Self {
        Self::new(self.ttype, SocketAddr::new(self.addr.ip(), port))
    }

    /// Encode the address into the beginning of `buf`.
    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, WireError> {
        if buf.len() < Self::ENCODED_LEN {
            return Err(WireError::BufferTooSmall(Self::ENCODED_LEN, buf.len()));
        }
        buf[..Self::ENCODED_LEN].fill(0);
        buf[0] = self.ttype as u8;
        buf[2..4].copy_from_slice(&self.addr.port().to_le_bytes());
        match self.addr.ip() {
            IpAddr::V4(ip) => {
                buf[1] = ADDR_TYPE_IPV4;
                buf[4..8].copy_from_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                buf[1] = ADDR_TYPE_IPV6;
                buf[4..20].copy_from_slice(&ip.octets());
            }
        }
        Ok(Self::ENCODED_LEN)
    }

    /// Decode an address from the beginning of `buf`.
    pub fn decode(buf: &[u8]) -> Result<(Self, usize), WireError> {
        if buf.len() < Self::ENCODED_LEN {
            return Err(WireError::Truncated(Self::ENCODED_LEN, buf.len()));
        }
        let ttype = TransportType::from(buf[0]);
        let port = u16::from_le_bytes([buf[2], buf[3]]);
        let ip = match buf[1] {
            ADDR_TYPE_IPV4 => IpAddr::V4(Ipv4Addr::new(buf[4], buf[5], buf[6], buf[7])),
            ADDR_TYPE_IPV6 => {
                let mut octets = [0u8; 16];
                octets.copy_from_slice(&buf[4..20]);
                IpAddr::V6(Ipv6Addr::from(octets))
            }
            other => {
                return Err(WireError::BadAddress(format!(
                    "unknown address family {}",
                    other
                )))
            }
        };
        Ok((Self::new(ttype, SocketAddr::new(ip, port)), Self::ENCODED_LEN))
    }
}

impl fmt::Display for NodeAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}/{}", self.ttype, self.addr.ip(), self.addr.port())
    }
}

impl FromStr for NodeAddr {
    type Err = WireError;

    /// Parse the `tcp@127.0.0.1/6666` form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || WireError::BadAddress(s.to_owned());
        let (ttype, rest) = s.split_once('@').ok_or_else(bad)?;
        let (ip, port) = rest.rsplit_once('/').ok_or_else(bad)?;
        let ttype = ttype.parse()?;
        let ip: IpAddr = ip.parse().map_err(|_| bad())?;
        let port: u16 = port.parse().map_err(|_| bad())?;
        Ok(Self::new(ttype, SocketAddr::new(ip, port)))
    }
}

/// Logical identity of a messenger, independent of any connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MsgerId {
    pub ip: Ipv4Addr,
    pub port: u16,
}

impl MsgerId {
    /// Length of the binary form `{ ip: u32, port: u16 }`.
    pub const ENCODED_LEN: usize = 6;

    pub const fn new(ip: Ipv4Addr, port: u16) -> Self {
        Self { ip, port }
    }

    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, WireError> {
        if buf.len() < Self::ENCODED_LEN {
            return Err(WireError::BufferTooSmall(Self::ENCODED_LEN, buf.len()));
        }
        buf[0..4].copy_from_slice(&u32::from(self.ip).to_le_bytes());
        buf[4..6].copy_from_slice(&self.port.to_le_bytes());
        Ok(Self::ENCODED_LEN)
    }

    pub fn decode(buf: &[u8]) -> Result<(Self, usize), WireError> {
        if buf.len() < Self::ENCODED_LEN {
            return Err(WireError::Truncated(Self::ENCODED_LEN, buf.len()));
        }
        let ip = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let port = u16::from_le_bytes([buf[4], buf[5]]);
        Ok((Self::new(Ipv4Addr::from(ip), port), Self::ENCODED_LEN))
    }
}

impl fmt::Display for MsgerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.ip, self.port)
    }
}

impl FromStr for MsgerId {
    type Err = WireError;

    /// Parse the `10.0.0.1/100` form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bad = || WireError::BadAddress(s.to_owned());
        let (ip, port) = s.trim().split_once('/').ok_or_else(bad)?;
        Ok(Self::new(
            ip.parse().map_err(|_| bad())?,
            port.parse().map_err(|_| bad())?,
        ))
    }
}
