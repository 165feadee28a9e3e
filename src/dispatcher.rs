//! Component routing.
//!
//! Components are addressed by 64-bit ids: the component type in the top
//! 16 bits and an instance id in the low 48 bits. A [`Dispatcher`] hands
//! messages for registered components to their [`Channel`] and forwards
//! everything else to the peer an [`AddressResolver`] names.
//!
//! On the wire a component message is an [`MsgType::Io`] message whose
//! payload is, in order: the RDMA buffer descriptors (if any), the 64-byte
//! [`MessageHeader`], and the content.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use log::{debug, trace, warn};
use parking_lot::RwLock;

use crate::conn::ConnRef;
use crate::error::{MsgError, Result};
use crate::manager::{MsgManager, MsgerCallback};
use crate::mem::RdmaBuffer;
use crate::msg::{priority, Msg, MsgFlags, MsgType, MsgerId, NodeAddr, RdmaBufDesc, TransportType, WireError};
use crate::rdma::RdmaRwWork;
use crate::session::Session;

/// Bytes of the header reserved for request-specific use.
pub const MESSAGE_RESERVED_LEN: usize = 32;

const COMP_ID_BITS: u32 = 48;
const COMP_ID_MASK: u64 = (1 << COMP_ID_BITS) - 1;

/// Compose a component id.
#[inline]
pub const fn comp_id(ctype: u16, id: u64) -> u64 {
    ((ctype as u64) << COMP_ID_BITS) | (id & COMP_ID_MASK)
}

/// Type part of a component id.
#[inline]
pub const fn comp_type(comp: u64) -> u16 {
    (comp >> COMP_ID_BITS) as u16
}

/// Instance part of a component id.
#[inline]
pub const fn comp_instance(comp: u64) -> u64 {
    comp & COMP_ID_MASK
}

/// Header of a component message.
///
/// Layout (little-endian): `src: u64, dst: u64, typ: u8, tgt: u8, cls: u8,
/// num: u8, rqg: u16, rqn: u16, flg: u16, arg: u16, len: u32`, then
/// [`MESSAGE_RESERVED_LEN`] reserved bytes.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct MessageHeader {
    pub src: u64,
    pub dst: u64,
    /// Request type, admin or I/O.
    pub typ: u8,
    /// Target component type of the request.
    pub tgt: u8,
    /// Request class, grouping requests.
    pub cls: u8,
    /// Request number within the class.
    pub num: u8,
    /// Request group.
    pub rqg: u16,
    /// Request number.
    pub rqn: u16,
    pub flg: u16,
    /// Return code of a response.
    pub arg: u16,
    /// Content length.
    pub len: u32,
    pub data: [u8; MESSAGE_RESERVED_LEN],
}

impl fmt::Debug for MessageHeader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MessageHeader")
            .field("src", &format_args!("{:#x}", self.src))
            .field("dst", &format_args!("{:#x}", self.dst))
            .field("req", &format_args!("{:#010x}", self.req_id()))
            .field("rqg", &self.rqg)
            .field("rqn", &self.rqn)
            .field("flg", &format_args!("{:#x}", self.flg))
            .field("arg", &self.arg)
            .field("len", &self.len)
            .finish()
    }
}

impl MessageHeader {
    pub const LEN: usize = 32 + MESSAGE_RESERVED_LEN;

    /// Set on responses.
    pub const FLAG_RESPONSE: u16 = 0x1;
    /// The reserved bytes are in use and counted in `len`.
    pub const FLAG_RESERVED: u16 = 0x2;

    pub fn new(src: u64, dst: u64) -> Self {
        Self {
            src,
            dst,
            ..Default::default()
        }
    }

    #[inline]
    pub fn is_res(&self) -> bool {
        self.flg & Self::FLAG_RESPONSE != 0
    }

    #[inline]
    pub fn is_req(&self) -> bool {
        !self.is_res()
    }

    pub fn set_flag(&mut self, flag: u16, on: bool) {
        if on {
            self.flg |= flag;
        } else {
            self.flg &= !flag;
        }
    }

    /// `typ`, `tgt`, `cls` and `num` packed from the most significant byte.
    #[inline]
    pub fn req_id(&self) -> u32 {
        u32::from_be_bytes([self.typ, self.tgt, self.cls, self.num])
    }

    #[inline]
    pub fn set_req_id(&mut self, id: u32) {
        [self.typ, self.tgt, self.cls, self.num] = id.to_be_bytes();
    }

    pub fn encode(&self, buf: &mut [u8]) -> Result<usize, WireError> {
        if buf.len() < Self::LEN {
            return Err(WireError::BufferTooSmall(Self::LEN, buf.len()));
        }
        buf[..Self::LEN].copy_from_slice(&self.to_bytes());
        Ok(Self::LEN)
    }

    pub fn to_bytes(&self) -> [u8; Self::LEN] {
        let mut buf = [0u8; Self::LEN];
        buf[0..8].copy_from_slice(&self.src.to_le_bytes());
        buf[8..16].copy_from_slice(&self.dst.to_le_bytes());
        buf[16..20].copy_from_slice(&[self.typ, self.tgt, self.cls, self.num]);
        buf[20..22].copy_from_slice(&self.rqg.to_le_bytes());
        buf[22..24].copy_from_slice(&self.rqn.to_le_bytes());
        buf[24..26].copy_from_slice(&self.flg.to_le_bytes());
        buf[26..28].copy_from_slice(&self.arg.to_le_bytes());
        buf[28..32].copy_from_slice(&self.len.to_le_bytes());
        buf[32..Self::LEN].copy_from_slice(&self.data);
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<(Self, usize), WireError> {
        if buf.len() < Self::LEN {
            return Err(WireError::Truncated(Self::LEN, buf.len()));
        }
        let u16_at = |i: usize| u16::from_le_bytes([buf[i], buf[i + 1]]);
        let mut u64s = [0u64; 2];
        for (i, v) in u64s.iter_mut().enumerate() {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[i * 8..i * 8 + 8]);
            *v = u64::from_le_bytes(b);
        }
        let mut data = [0u8; MESSAGE_RESERVED_LEN];
        data.copy_from_slice(&buf[32..Self::LEN]);
        let header = Self {
            src: u64s[0],
            dst: u64s[1],
            typ: buf[16],
            tgt: buf[17],
            cls: buf[18],
            num: buf[19],
            rqg: u16_at(20),
            rqn: u16_at(22),
            flg: u16_at(24),
            arg: u16_at(26),
            len: u32::from_le_bytes([buf[28], buf[29], buf[30], buf[31]]),
            data,
        };
        Ok((header, Self::LEN))
    }
}

/// A component message.
#[derive(Debug)]
pub struct Message {
    pub header: MessageHeader,
    /// Priority of the connection the message travels on.
    pub priority: u8,
    pub content: Bytes,
    /// Remote-accessible buffers. Outbound requests describe buffers of the
    /// sender, which must stay alive until the response; outbound fetch
    /// responses carry the requester's buffers to write into. Inbound, the
    /// descriptors the peer sent.
    pub rdma_descs: Vec<RdmaBufDesc>,
    /// Whether the described buffers are to be written by the responder
    /// rather than read by the receiver.
    pub rdma_fetch: bool,
    /// Local registered buffers. Outbound fetch responses write them to
    /// `rdma_descs` before the response is sent; inbound push requests
    /// arrive with the pulled data here.
    pub rdma_bufs: Vec<RdmaBuffer>,
}

impl Message {
    pub fn new(header: MessageHeader) -> Self {
        Self {
            header,
            priority: priority::DEFAULT,
            content: Bytes::new(),
            rdma_descs: Vec::new(),
            rdma_fetch: false,
            rdma_bufs: Vec::new(),
        }
    }

    pub fn with_content(header: MessageHeader, content: Bytes) -> Self {
        Self {
            content,
            ..Self::new(header)
        }
    }

    #[inline]
    pub fn src(&self) -> u64 {
        self.header.src
    }

    #[inline]
    pub fn dst(&self) -> u64 {
        self.header.dst
    }

    /// Whether the message moves data with one-sided RDMA operations.
    #[inline]
    pub fn has_rdma(&self) -> bool {
        !self.rdma_descs.is_empty() || !self.rdma_bufs.is_empty()
    }

    /// Whether this is a response writing fetched data.
    #[inline]
    fn is_fetch_response(&self) -> bool {
        self.header.is_res() && !self.rdma_bufs.is_empty()
    }

    /// Transport form. The local buffers are left behind.
    fn to_msg(&self) -> Msg {
        let mut msg = Msg::new(MsgType::Io);
        msg.set_priority(self.priority);
        if self.header.is_res() {
            msg.header_mut().flags.insert(MsgFlags::RESP);
        }
        if self.is_fetch_response() {
            msg.header_mut().flags.insert(MsgFlags::RDMA | MsgFlags::MEM_FETCH);
        } else if !self.rdma_descs.is_empty() {
            msg.set_rdma_descs(&self.rdma_descs, self.rdma_fetch);
        }

        let mut header = self.header;
        header.len = self.content.len() as u32;
        msg.append_data(&header.to_bytes());
        msg.append_bytes(self.content.clone());
        msg
    }

    /// Parse a received transport message.
    fn from_msg(msg: &Msg) -> Result<Self, WireError> {
        let (descs, rest) = msg.rdma_descs()?;
        let (mut header, used) = MessageHeader::decode(&rest)?;
        let content = rest.slice(used..);
        if content.len() != header.len as usize {
            debug!("content of {:?} is {} bytes", header, content.len());
            header.len = content.len() as u32;
        }
        Ok(Self {
            header,
            priority: msg.priority(),
            content,
            rdma_descs: descs,
            rdma_fetch: msg.flags().contains(MsgFlags::MEM_FETCH),
            rdma_bufs: Vec::new(),
        })
    }
}

/// Receiver of messages for one local component.
///
/// Connection events are offered to every channel in component id order
/// until one returns `true`.
pub trait Channel: Send + Sync {
    /// A message delivered from this process.
    fn on_local_recv(&self, message: Message);

    /// A message received from `conn`.
    fn on_conn_recv(&self, conn: &ConnRef, message: Message);

    /// An RDMA transfer of a message addressed to or sent by this component
    /// finished; `failed` are the indexes of the buffers that failed.
    fn on_rdma_done(&self, _conn: &ConnRef, _header: &MessageHeader, _failed: &[usize]) {}

    fn on_listen_accept(&self, _conn: &ConnRef) -> bool {
        false
    }

    fn on_conn_declared(&self, _conn: &ConnRef, _session: &Arc<Session>) -> bool {
        false
    }

    fn on_conn_error(&self, _conn: &ConnRef) -> bool {
        false
    }
}

/// Where a remote component lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddress {
    pub msger_id: MsgerId,
    pub tcp_listen: Option<NodeAddr>,
    pub rdma_listen: Option<NodeAddr>,
}

/// Source of component locations.
pub trait AddressResolver: Send + Sync {
    fn resolve(&self, comp: u64) -> Option<PeerAddress>;
}

/// Routes component messages. Installed as the messenger callback of its
/// manager.
pub struct Dispatcher {
    manager: Arc<MsgManager>,
    resolver: Arc<dyn AddressResolver>,
    channels: RwLock<BTreeMap<u64, Arc<dyn Channel>>>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("channels", &self.channels.read().keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Dispatcher {
    pub fn new(manager: Arc<MsgManager>, resolver: Arc<dyn AddressResolver>) -> Arc<Self> {
        let dispatcher = Arc::new(Self {
            manager,
            resolver,
            channels: RwLock::new(BTreeMap::new()),
        });
        let cb: Weak<dyn MsgerCallback> = Arc::downgrade(&dispatcher) as _;
        dispatcher.manager.set_msger_cb(cb);
        dispatcher
    }

    #[inline]
    pub fn manager(&self) -> &Arc<MsgManager> {
        &self.manager
    }

    /// Route messages for `comp` to `channel`. Returns the channel it
    /// replaces.
    pub fn register(&self, comp: u64, channel: Arc<dyn Channel>) -> Option<Arc<dyn Channel>> {
        debug!("register component {:#x}", comp);
        self.channels.write().insert(comp, channel)
    }

    pub fn unregister(&self, comp: u64) -> Option<Arc<dyn Channel>> {
        debug!("unregister component {:#x}", comp);
        self.channels.write().remove(&comp)
    }

    pub fn channel(&self, comp: u64) -> Option<Arc<dyn Channel>> {
        self.channels.read().get(&comp).cloned()
    }

    fn channels(&self) -> Vec<Arc<dyn Channel>> {
        self.channels.read().values().cloned().collect()
    }

    /// Hand `message` to the channel of its destination, or send it to the
    /// peer hosting the destination.
    pub fn deliver(&self, message: Message) -> Result<()> {
        match self.channel(message.dst()) {
            Some(channel) => {
                trace!("local delivery {:?}", message.header);
                channel.on_local_recv(message);
                Ok(())
            }
            None => self.deliver_to_remote(message),
        }
    }

    fn deliver_to_remote(&self, message: Message) -> Result<()> {
        let dst = message.dst();
        let peer = self.resolver.resolve(dst).ok_or(MsgError::Unresolvable(dst))?;
        let session = self.manager.get_session(peer.msger_id);
        for addr in [peer.tcp_listen, peer.rdma_listen].into_iter().flatten() {
            session.set_listen_addr(addr);
        }

        let ttype = if message.has_rdma()
            || (self.manager.rdma_stack().is_some() && session.listen_addr(TransportType::Rdma).is_some())
        {
            TransportType::Rdma
        } else {
            TransportType::Tcp
        };
        let conn = session.get_connection(&self.manager, ttype, message.priority)?;
        trace!("forward {:?} over {}", message.header, conn.id());

        if message.is_fetch_response() {
            return self.write_then_send(conn, message);
        }
        conn.send_msg(message.to_msg())
    }

    /// Write the local buffers of a fetch response to the requester, then
    /// send the response.
    fn write_then_send(&self, conn: ConnRef, mut message: Message) -> Result<()> {
        let (bufs, descs) = (message.rdma_bufs.len(), message.rdma_descs.len());
        if bufs != descs {
            return Err(MsgError::RdmaPairMismatch { bufs, descs });
        }
        let msg = message.to_msg();
        let header = message.header;
        let pairs = message.rdma_bufs.drain(..).zip(message.rdma_descs.drain(..)).collect();
        let channel = self.channel(header.src);

        let done_conn = conn.clone();
        let work = RdmaRwWork::write(pairs, 0, move |work| {
            if let Some(channel) = &channel {
                channel.on_rdma_done(&done_conn, &header, work.failed_indexes());
            }
            if !work.is_ok() {
                warn!("fetch response {:?} failed on {:?}", header, work.failed_indexes());
                return;
            }
            if let Err(e) = done_conn.send_msg(msg) {
                warn!("cannot send fetch response {:?}: {}", header, e);
            }
        });
        conn.as_rdma().ok_or(MsgError::NotConnected)?.post_rdma_rw(work)
    }

    /// Pull the buffers of a push request, then hand it to `channel`.
    fn pull_then_deliver(&self, conn: &ConnRef, channel: Arc<dyn Channel>, mut message: Message) {
        let Some(rdma) = conn.as_rdma() else {
            warn!("{} carries RDMA descriptors over {}", conn.id(), conn.transport());
            return;
        };
        let Some(stack) = self.manager.rdma_stack() else {
            warn!("push request on {} without an RDMA stack", conn.id());
            return;
        };
        let alloc = stack.manager().mem().allocator();
        let mut pairs = Vec::with_capacity(message.rdma_descs.len());
        for desc in message.rdma_descs.drain(..) {
            match alloc.alloc(desc.len as usize) {
                Some(buf) => pairs.push((buf, desc)),
                None => {
                    warn!("no buffer of {} bytes for {:?}", desc.len, message.header);
                    return;
                }
            }
        }

        let header = message.header;
        let done_conn = conn.clone();
        let work = RdmaRwWork::read(pairs, move |work| {
            channel.on_rdma_done(&done_conn, &header, work.failed_indexes());
            if !work.is_ok() {
                warn!("pulling {:?} failed on {:?}", header, work.failed_indexes());
                return;
            }
            message.rdma_bufs = work.into_buffers();
            channel.on_conn_recv(&done_conn, message);
        });
        if let Err(e) = rdma.post_rdma_rw(work) {
            warn!("cannot pull {:?} on {}: {}", header, conn.id(), e);
        }
    }
}

impl MsgerCallback for Dispatcher {
    fn on_listen_accept(&self, conn: &ConnRef) {
        for channel in self.channels() {
            if channel.on_listen_accept(conn) {
                break;
            }
        }
    }

    fn on_conn_declared(&self, conn: &ConnRef, session: &Arc<Session>) {
        for channel in self.channels() {
            if channel.on_conn_declared(conn, session) {
                break;
            }
        }
    }

    fn on_conn_error(&self, conn: &ConnRef) {
        for channel in self.channels() {
            if channel.on_conn_error(conn) {
                break;
            }
        }
    }

    fn on_conn_recv(&self, conn: &ConnRef, msg: Msg) {
        if msg.msg_type() != MsgType::Io {
            trace!("{} ignores {:?}", conn.id(), msg.header());
            return;
        }
        let message = match Message::from_msg(&msg) {
            Ok(message) => message,
            Err(e) => {
                warn!("{} sent a malformed message: {}", conn.id(), e);
                return;
            }
        };
        let Some(channel) = self.channel(message.dst()) else {
            warn!("unknown destination, dropping {:?}", message.header);
            return;
        };

        if message.header.is_req() && !message.rdma_fetch && !message.rdma_descs.is_empty() {
            self.pull_then_deliver(conn, channel, message);
            return;
        }
        channel.on_conn_recv(conn, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ListenSpec, MsgConfig};
    use crate::rdma::RdmaStack;
    use crate::worker::WorkerPool;
    use std::collections::HashMap;
    use std::net::{IpAddr, Ipv4Addr};
    use std::sync::mpsc::{self, Receiver, Sender};
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct StaticResolver {
        peers: Mutex<HashMap<u64, PeerAddress>>,
    }

    impl AddressResolver for StaticResolver {
        fn resolve(&self, comp: u64) -> Option<PeerAddress> {
            self.peers.lock().unwrap().get(&comp).copied()
        }
    }

    struct Inbox {
        local: Mutex<Sender<Message>>,
        remote: Mutex<Sender<Message>>,
        rdma_done: Mutex<Sender<Vec<usize>>>,
    }

    impl Inbox {
        fn new() -> (Arc<Self>, Receiver<Message>, Receiver<Message>, Receiver<Vec<usize>>) {
            let (ltx, lrx) = mpsc::channel();
            let (rtx, rrx) = mpsc::channel();
            let (dtx, drx) = mpsc::channel();
            let inbox = Arc::new(Self {
                local: Mutex::new(ltx),
                remote: Mutex::new(rtx),
                rdma_done: Mutex::new(dtx),
            });
            (inbox, lrx, rrx, drx)
        }
    }

    impl Channel for Inbox {
        fn on_local_recv(&self, message: Message) {
            let _ = self.local.lock().unwrap().send(message);
        }

        fn on_conn_recv(&self, _conn: &ConnRef, message: Message) {
            let _ = self.remote.lock().unwrap().send(message);
        }

        fn on_rdma_done(&self, _conn: &ConnRef, _header: &MessageHeader, failed: &[usize]) {
            let _ = self.rdma_done.lock().unwrap().send(failed.to_vec());
        }
    }

    const CLIENT: u64 = comp_id(3, 1);
    const SERVER: u64 = comp_id(2, 7);

    fn spec(ttype: TransportType) -> ListenSpec {
        ListenSpec {
            ttype,
            ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
            ports: 0..=0,
        }
    }

    #[test]
    fn header_layout() -> anyhow::Result<()> {
        let mut h = MessageHeader::new(CLIENT, SERVER);
        h.set_req_id(0x0102_0304);
        h.rqn = 0xbeef;
        h.set_flag(MessageHeader::FLAG_RESPONSE, true);
        h.len = 5;
        h.data[31] = 9;
        let mut buf = [0u8; MessageHeader::LEN];
        assert_eq!(h.encode(&mut buf)?, 64);
        assert_eq!(&buf[16..20], &[1, 2, 3, 4]);
        assert_eq!(&buf[22..24], &0xbeefu16.to_le_bytes());
        assert_eq!(buf[63], 9);
        assert_eq!(MessageHeader::decode(&buf)?.0, h);
        assert!(h.is_res());
        assert_eq!(comp_type(SERVER), 2);
        assert_eq!(comp_instance(SERVER), 7);
        assert!(MessageHeader::decode(&buf[..63]).is_err());
        assert!(h.encode(&mut buf[..10]).is_err());
        assert_eq!(h.to_bytes(), buf);
        Ok(())
    }

    #[test]
    fn transport_form_leads_with_the_header() -> anyhow::Result<()> {
        let mut h = MessageHeader::new(CLIENT, SERVER);
        h.set_req_id(42);
        let msg = Message::with_content(h, Bytes::from_static(b"abc")).to_msg();
        assert_eq!(msg.msg_type(), MsgType::Io);
        let wire = msg.flatten();
        assert_eq!(wire.len(), MessageHeader::LEN + 3);
        h.len = 3;
        assert_eq!(&wire[..MessageHeader::LEN], &h.to_bytes()[..]);
        assert_eq!(&wire[MessageHeader::LEN..], b"abc");
        Ok(())
    }

    #[test]
    fn local_delivery_and_unknown_destinations() -> anyhow::Result<()> {
        let pool = Arc::new(WorkerPool::new(1, &[])?);
        let manager = MsgManager::new(None, pool, None);
        let dispatcher = Dispatcher::new(manager, Arc::new(StaticResolver::default()));

        let (inbox, local, _, _) = Inbox::new();
        assert!(dispatcher.register(SERVER, inbox).is_none());
        let msg = Message::with_content(MessageHeader::new(CLIENT, SERVER), Bytes::from_static(b"hi"));
        dispatcher.deliver(msg)?;
        let got = local.recv_timeout(Duration::from_secs(1))?;
        assert_eq!(got.src(), CLIENT);
        assert_eq!(&got.content[..], b"hi");

        assert!(dispatcher.unregister(SERVER).is_some());
        let msg = Message::new(MessageHeader::new(CLIENT, SERVER));
        assert!(matches!(dispatcher.deliver(msg), Err(MsgError::Unresolvable(SERVER))));
        Ok(())
    }

    #[test]
    fn remote_forwarding_over_tcp() -> anyhow::Result<()> {
        let pool = Arc::new(WorkerPool::new(2, &[])?);
        pool.start()?;

        let server_mgr = MsgManager::new(None, pool.clone(), None);
        let server_addr = server_mgr.add_listen_port(&spec(TransportType::Tcp))?;
        let server = Dispatcher::new(server_mgr.clone(), Arc::new(StaticResolver::default()));
        let (inbox, _, remote, _) = Inbox::new();
        server.register(SERVER, inbox);

        let client_mgr = MsgManager::new(None, pool.clone(), None);
        client_mgr.add_listen_port(&spec(TransportType::Tcp))?;
        let resolver = Arc::new(StaticResolver::default());
        resolver.peers.lock().unwrap().insert(
            SERVER,
            PeerAddress {
                msger_id: server_mgr.msger_id(),
                tcp_listen: Some(server_addr),
                rdma_listen: None,
            },
        );
        let client = Dispatcher::new(client_mgr.clone(), resolver);

        for i in 0..3u16 {
            let mut header = MessageHeader::new(CLIENT, SERVER);
            header.rqn = i;
            let content = Bytes::from(vec![i as u8; 100 * (i as usize + 1)]);
            client.deliver(Message::with_content(header, content))?;
        }
        for i in 0..3u16 {
            let got = remote.recv_timeout(Duration::from_secs(5))?;
            assert_eq!(got.header.rqn, i);
            assert_eq!(got.src(), CLIENT);
            assert_eq!(got.header.len as usize, 100 * (i as usize + 1));
            assert!(got.content.iter().all(|&b| b == i as u8));
        }
        assert_eq!(client_mgr.session_num(), 1);
        let session = client_mgr
            .find_session(&server_mgr.msger_id())
            .ok_or_else(|| anyhow::anyhow!("no session"))?;
        assert_eq!(session.conn_num(), 1);

        client_mgr.clear();
        server_mgr.clear();
        pool.stop();
        Ok(())
    }

    #[test]
    fn push_request_is_pulled_before_delivery() -> anyhow::Result<()> {
        let cfg = MsgConfig {
            worker_num: 3,
            rdma_enable: true,
            rdma_buffer_size: 16 << 10,
            rdma_recv_queue_len: 32,
            rdma_enable_hugepage: false,
            rdma_mem_max_level: 22,
            ..Default::default()
        };
        let pool = Arc::new(WorkerPool::new(cfg.worker_num, &[])?);
        pool.start()?;
        let stack = RdmaStack::new(&cfg, pool.clone())?;

        let server_mgr = MsgManager::new(None, pool.clone(), Some(stack.clone()));
        server_mgr.add_listen_port(&spec(TransportType::Tcp))?;
        let server_rdma = server_mgr.add_listen_port(&spec(TransportType::Rdma))?;
        let server = Dispatcher::new(server_mgr.clone(), Arc::new(StaticResolver::default()));
        let (inbox, _, remote, pulled) = Inbox::new();
        server.register(SERVER, inbox);

        let client_mgr = MsgManager::new(None, pool.clone(), Some(stack.clone()));
        client_mgr.add_listen_port(&spec(TransportType::Tcp))?;
        let resolver = Arc::new(StaticResolver::default());
        resolver.peers.lock().unwrap().insert(
            SERVER,
            PeerAddress {
                msger_id: server_mgr.msger_id(),
                tcp_listen: None,
                rdma_listen: Some(server_rdma),
            },
        );
        let client = Dispatcher::new(client_mgr.clone(), resolver);

        let mut data = stack
            .manager()
            .mem()
            .allocator()
            .alloc(3000)
            .ok_or_else(|| anyhow::anyhow!("no buffer"))?;
        for (i, b) in data.as_mut_slice()[..3000].iter_mut().enumerate() {
            *b = (i % 253) as u8;
        }
        data.set_len(3000);

        let mut message = Message::with_content(MessageHeader::new(CLIENT, SERVER), Bytes::from_static(b"push"));
        message.rdma_descs = vec![data.desc()];
        client.deliver(message)?;

        assert_eq!(pulled.recv_timeout(Duration::from_secs(10))?, Vec::<usize>::new());
        let got = remote.recv_timeout(Duration::from_secs(5))?;
        assert_eq!(&got.content[..], b"push");
        assert_eq!(got.rdma_bufs.len(), 1);
        assert!(got.rdma_bufs[0].as_slice() == data.as_slice());

        client_mgr.clear();
        server_mgr.clear();
        stack.stop();
        pool.stop();
        Ok(())
    }
}
