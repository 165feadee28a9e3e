//! libibverbs provider.

mod bindings;

use std::ffi::CStr;
use std::os::fd::RawFd;
use std::os::raw::c_int;
use std::ptr::{self, NonNull};
use std::sync::Arc;
use std::{fmt, io, mem};

use self::bindings::*;
use super::*;
use crate::utils::interop::from_c_ret;

macro_rules! impl_ibv_wrapper_traits {
    ($ibv_ty:ty, $wrapper_ty:ty) => {
        impl ::std::ops::Deref for $wrapper_ty {
            type Target = ::std::ptr::NonNull<$ibv_ty>;

            fn deref(&self) -> &Self::Target {
                &self.0
            }
        }

        unsafe impl Send for $wrapper_ty {}
        unsafe impl Sync for $wrapper_ty {}
    };
}

fn mtu_from_bytes(bytes: u32) -> ibv_mtu::Type {
    match bytes {
        0..=256 => ibv_mtu::IBV_MTU_256,
        257..=512 => ibv_mtu::IBV_MTU_512,
        513..=1024 => ibv_mtu::IBV_MTU_1024,
        1025..=2048 => ibv_mtu::IBV_MTU_2048,
        _ => ibv_mtu::IBV_MTU_4096,
    }
}

#[repr(transparent)]
struct IbvContext(NonNull<ibv_context>);
impl_ibv_wrapper_traits!(ibv_context, IbvContext);

struct ContextInner {
    ctx: IbvContext,
    name: String,
    dev_attr: ibv_device_attr,
    port_attr: ibv_port_attr,
    port_num: PortNum,
    gid: Gid,
    gid_index: u8,
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        // SAFETY: FFI; called once when the last holder goes away.
        unsafe { ibv_close_device(self.ctx.as_ptr()) };
    }
}

/// Device context.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("name", &self.inner.name)
            .field("gid", &self.inner.gid)
            .finish()
    }
}

impl Context {
    /// Open a device and query the related attributes (device and port).
    ///
    /// If `dev_name` is `None` or empty, the first device found is used.
    pub fn open(dev_name: Option<&str>, port_num: PortNum, gid_index: u8) -> io::Result<Self> {
        let mut num = 0;
        // SAFETY: FFI.
        let list = unsafe { ibv_get_device_list(&mut num) };
        if list.is_null() {
            return Err(io::Error::last_os_error());
        }

        // SAFETY: `list` holds `num` valid device pointers.
        let devices = unsafe { std::slice::from_raw_parts(list, num.max(0) as usize) };
        let found = devices.iter().copied().find_map(|dev| {
            // SAFETY: FFI on a listed device.
            let name = unsafe { CStr::from_ptr(ibv_get_device_name(dev)) }
                .to_string_lossy()
                .into_owned();
            let wanted = dev_name.filter(|n| !n.is_empty()).map_or(true, |n| n == name);
            wanted.then_some((dev, name))
        });
        let opened = found.map(|(dev, name)| {
            // SAFETY: FFI; the device list is still alive.
            (unsafe { ibv_open_device(dev) }, name)
        });
        // SAFETY: devices are no longer referenced.
        unsafe { ibv_free_device_list(list) };

        let (ctx, name) = opened.ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "no matching RDMA device")
        })?;
        let ctx = IbvContext(NonNull::new(ctx).ok_or_else(io::Error::last_os_error)?);

        // SAFETY: POD types filled by FFI below.
        let mut dev_attr = unsafe { mem::zeroed::<ibv_device_attr>() };
        let mut port_attr = unsafe { mem::zeroed::<ibv_port_attr>() };
        let mut gid = unsafe { mem::zeroed::<ibv_gid>() };
        let ret = unsafe { ibv_query_device(ctx.as_ptr(), &mut dev_attr) };
        let ret = if ret == 0 {
            unsafe { ibv_query_port(ctx.as_ptr(), port_num, ptr::addr_of_mut!(port_attr).cast()) }
        } else {
            ret
        };
        let ret = if ret == 0 {
            unsafe { ibv_query_gid(ctx.as_ptr(), port_num, gid_index as c_int, &mut gid) }
        } else {
            ret
        };
        if ret != 0 {
            let err = io::Error::last_os_error();
            // SAFETY: FFI; the context was opened above.
            unsafe { ibv_close_device(ctx.as_ptr()) };
            return Err(err);
        }
        if port_attr.state != ibv_port_state::IBV_PORT_ACTIVE {
            // SAFETY: FFI; the context was opened above.
            unsafe { ibv_close_device(ctx.as_ptr()) };
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                format!("port {} is not active", port_num),
            ));
        }

        Ok(Self {
            inner: Arc::new(ContextInner {
                ctx,
                name,
                dev_attr,
                port_attr,
                port_num,
                // SAFETY: union of plain bytes.
                gid: Gid(unsafe { gid.raw }),
                gid_index,
            }),
        })
    }

    #[inline]
    fn as_raw(&self) -> *mut ibv_context {
        self.inner.ctx.as_ptr()
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[inline]
    pub fn lid(&self) -> Lid {
        self.inner.port_attr.lid
    }

    #[inline]
    pub fn port_num(&self) -> PortNum {
        self.inner.port_num
    }

    #[inline]
    pub fn gid(&self) -> Gid {
        self.inner.gid
    }

    #[inline]
    pub fn gid_index(&self) -> u8 {
        self.inner.gid_index
    }

    /// Active path MTU of the port, in bytes.
    #[inline]
    pub fn active_mtu(&self) -> u32 {
        128 << self.inner.port_attr.active_mtu
    }

    #[inline]
    pub fn max_qp_wr(&self) -> u32 {
        self.inner.dev_attr.max_qp_wr as u32
    }
}

#[repr(transparent)]
struct IbvPd(NonNull<ibv_pd>);
impl_ibv_wrapper_traits!(ibv_pd, IbvPd);

struct PdInner {
    ctx: Context,
    pd: IbvPd,
}

impl Drop for PdInner {
    fn drop(&mut self) {
        // SAFETY: FFI; called once.
        unsafe { ibv_dealloc_pd(self.pd.as_ptr()) };
    }
}

/// Protection domain.
#[derive(Clone)]
pub struct Pd {
    inner: Arc<PdInner>,
}

impl Pd {
    pub fn new(ctx: &Context) -> io::Result<Self> {
        // SAFETY: FFI.
        let pd = NonNull::new(unsafe { ibv_alloc_pd(ctx.as_raw()) }).ok_or_else(io::Error::last_os_error)?;
        Ok(Self {
            inner: Arc::new(PdInner {
                ctx: ctx.clone(),
                pd: IbvPd(pd),
            }),
        })
    }

    #[inline]
    fn as_raw(&self) -> *mut ibv_pd {
        self.inner.pd.as_ptr()
    }

    #[inline]
    pub fn context(&self) -> &Context {
        &self.inner.ctx
    }
}

#[repr(transparent)]
struct IbvMr(NonNull<ibv_mr>);
impl_ibv_wrapper_traits!(ibv_mr, IbvMr);

/// Memory region with local and remote access.
pub struct Mr {
    _pd: Pd,
    mr: IbvMr,
}

impl fmt::Debug for Mr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Mr<{:p}, lkey={:#x}>", self.addr(), self.lkey())
    }
}

impl Mr {
    /// Register a memory region.
    ///
    /// # Safety
    ///
    /// The memory area must stay valid until the returned `Mr` is dropped.
    pub unsafe fn reg(pd: &Pd, addr: *mut u8, len: usize) -> io::Result<Self> {
        let access = ibv_access_flags::IBV_ACCESS_LOCAL_WRITE
            | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE
            | ibv_access_flags::IBV_ACCESS_REMOTE_READ;
        let mr = ibv_reg_mr(pd.as_raw(), addr.cast(), len, access.0 as c_int);
        let mr = NonNull::new(mr).ok_or_else(io::Error::last_os_error)?;
        Ok(Self {
            _pd: pd.clone(),
            mr: IbvMr(mr),
        })
    }

    #[inline]
    pub fn addr(&self) -> *mut u8 {
        // SAFETY: the MR is alive.
        unsafe { (*self.mr.as_ptr()).addr.cast() }
    }

    #[inline]
    pub fn len(&self) -> usize {
        // SAFETY: the MR is alive.
        unsafe { (*self.mr.as_ptr()).length }
    }

    #[inline]
    pub fn lkey(&self) -> LKey {
        // SAFETY: the MR is alive.
        unsafe { (*self.mr.as_ptr()).lkey }
    }

    #[inline]
    pub fn rkey(&self) -> RKey {
        // SAFETY: the MR is alive.
        unsafe { (*self.mr.as_ptr()).rkey }
    }
}

impl Drop for Mr {
    fn drop(&mut self) {
        // SAFETY: FFI; called once.
        unsafe { ibv_dereg_mr(self.mr.as_ptr()) };
    }
}

#[repr(transparent)]
struct IbvCompChannel(NonNull<ibv_comp_channel>);
impl_ibv_wrapper_traits!(ibv_comp_channel, IbvCompChannel);

struct CompChannelInner {
    _ctx: Context,
    channel: IbvCompChannel,
}

impl Drop for CompChannelInner {
    fn drop(&mut self) {
        // SAFETY: FFI; every CQ holding this channel is gone.
        unsafe { ibv_destroy_comp_channel(self.channel.as_ptr()) };
    }
}

/// Completion event channel.
#[derive(Clone)]
pub struct CompChannel {
    inner: Arc<CompChannelInner>,
}

impl CompChannel {
    pub fn new(ctx: &Context) -> io::Result<Self> {
        // SAFETY: FFI.
        let channel = unsafe { ibv_create_comp_channel(ctx.as_raw()) };
        let channel = IbvCompChannel(NonNull::new(channel).ok_or_else(io::Error::last_os_error)?);

        // SAFETY: FFI on the channel's descriptor.
        let fd = unsafe { (*channel.as_ptr()).fd };
        let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
        if flags < 0 || unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
            let err = io::Error::last_os_error();
            unsafe { ibv_destroy_comp_channel(channel.as_ptr()) };
            return Err(err);
        }

        Ok(Self {
            inner: Arc::new(CompChannelInner {
                _ctx: ctx.clone(),
                channel,
            }),
        })
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        // SAFETY: the channel is alive.
        unsafe { (*self.inner.channel.as_ptr()).fd }
    }

    /// Consume and acknowledge all pending completion events.
    pub fn get_events(&self) -> io::Result<()> {
        loop {
            let mut cq = ptr::null_mut();
            let mut cq_ctx = ptr::null_mut();
            // SAFETY: FFI; the descriptor is non-blocking.
            let ret = unsafe { ibv_get_cq_event(self.inner.channel.as_ptr(), &mut cq, &mut cq_ctx) };
            if ret != 0 {
                let err = io::Error::last_os_error();
                return if err.kind() == io::ErrorKind::WouldBlock {
                    Ok(())
                } else {
                    Err(err)
                };
            }
            // SAFETY: FFI; acknowledging the event just got.
            unsafe { ibv_ack_cq_events(cq, 1) };
        }
    }
}

#[repr(transparent)]
struct IbvCq(NonNull<ibv_cq>);
impl_ibv_wrapper_traits!(ibv_cq, IbvCq);

struct CqInner {
    ctx: Context,
    _channel: Option<CompChannel>,
    cq: IbvCq,
}

impl Drop for CqInner {
    fn drop(&mut self) {
        // SAFETY: FFI; called once, after every QP using it.
        unsafe { ibv_destroy_cq(self.cq.as_ptr()) };
    }
}

/// Completion queue.
#[derive(Clone)]
pub struct Cq {
    inner: Arc<CqInner>,
}

impl Cq {
    /// The default CQ depth.
    pub const DEFAULT_CQ_DEPTH: u32 = 128;

    pub fn new(
        ctx: &Context,
        capacity: u32,
        channel: Option<&CompChannel>,
    ) -> Result<Cq, CqCreationError> {
        let max_capacity = ctx.inner.dev_attr.max_cqe as u32;
        if capacity > max_capacity {
            return Err(CqCreationError::TooManyCqes(max_capacity));
        }

        let channel_ptr = channel.map_or(ptr::null_mut(), |ch| ch.inner.channel.as_ptr());
        // SAFETY: FFI.
        let cq = unsafe {
            ibv_create_cq(ctx.as_raw(), capacity as c_int, ptr::null_mut(), channel_ptr, 0)
        };
        let cq = NonNull::new(cq).ok_or_else(io::Error::last_os_error)?;
        Ok(Self {
            inner: Arc::new(CqInner {
                ctx: ctx.clone(),
                _channel: channel.cloned(),
                cq: IbvCq(cq),
            }),
        })
    }

    #[inline]
    fn as_raw(&self) -> *mut ibv_cq {
        self.inner.cq.as_ptr()
    }

    #[inline]
    pub fn capacity(&self) -> u32 {
        // SAFETY: the CQ is alive.
        (unsafe { (*self.as_raw()).cqe }) as u32
    }

    /// Non-blockingly poll into the given buffer. Return the number of work
    /// completions polled.
    pub fn poll_into(&self, wc: &mut [Wc]) -> io::Result<usize> {
        const BATCH: usize = 16;
        let mut raw = [ibv_wc::default(); BATCH];
        let mut polled = 0;
        while polled < wc.len() {
            let want = (wc.len() - polled).min(BATCH);
            // SAFETY: FFI; `raw` holds at least `want` entries.
            let n = unsafe { ibv_poll_cq(self.as_raw(), want as c_int, raw.as_mut_ptr()) };
            if n < 0 {
                return Err(io::Error::from_raw_os_error(-n));
            }
            for (slot, entry) in wc[polled..].iter_mut().zip(&raw[..n as usize]) {
                *slot = Wc {
                    wr_id: entry.wr_id,
                    status: WcStatus::from(entry.status),
                    opcode: WcOpcode::try_from(entry.opcode).unwrap_or_default(),
                    byte_len: entry.byte_len,
                    imm: (entry.wc_flags & IBV_WC_WITH_IMM != 0).then(|| u32::from_be(entry.imm_data)),
                    qp_num: entry.qp_num,
                };
            }
            polled += n as usize;
            if (n as usize) < want {
                break;
            }
        }
        Ok(polled)
    }

    /// Request a completion event on the next completion.
    pub fn req_notify(&self) -> io::Result<()> {
        // SAFETY: FFI.
        from_c_ret(unsafe { ibv_req_notify_cq(self.as_raw(), 0) })
    }
}

#[repr(transparent)]
struct IbvSrq(NonNull<ibv_srq>);
impl_ibv_wrapper_traits!(ibv_srq, IbvSrq);

struct SrqInner {
    _pd: Pd,
    srq: IbvSrq,
}

impl Drop for SrqInner {
    fn drop(&mut self) {
        // SAFETY: FFI; called once, after every QP using it.
        unsafe { ibv_destroy_srq(self.srq.as_ptr()) };
    }
}

fn build_recv_wrs(wrs: &[RecvWr], sges: &mut Vec<ibv_sge>) -> Vec<ibv_recv_wr> {
    sges.extend(wrs.iter().map(|wr| ibv_sge {
        addr: wr.sge.addr,
        length: wr.sge.length,
        lkey: wr.sge.lkey,
    }));
    let mut raw: Vec<ibv_recv_wr> = wrs
        .iter()
        .enumerate()
        .map(|(i, wr)| ibv_recv_wr {
            wr_id: wr.wr_id,
            next: ptr::null_mut(),
            sg_list: &mut sges[i],
            num_sge: 1,
        })
        .collect();
    for i in 1..raw.len() {
        let next: *mut ibv_recv_wr = &mut raw[i];
        raw[i - 1].next = next;
    }
    raw
}

/// Shared receive queue.
#[derive(Clone)]
pub struct Srq {
    inner: Arc<SrqInner>,
}

impl Srq {
    pub fn new(pd: &Pd, max_wr: u32, max_sge: u32) -> io::Result<Self> {
        let mut init_attr = ibv_srq_init_attr {
            srq_context: ptr::null_mut(),
            attr: ibv_srq_attr {
                max_wr,
                max_sge,
                srq_limit: 0,
            },
        };
        // SAFETY: FFI.
        let srq = unsafe { ibv_create_srq(pd.as_raw(), &mut init_attr) };
        let srq = NonNull::new(srq).ok_or_else(io::Error::last_os_error)?;
        Ok(Self {
            inner: Arc::new(SrqInner {
                _pd: pd.clone(),
                srq: IbvSrq(srq),
            }),
        })
    }

    /// Post a list of receive work requests.
    pub fn post_recv(&self, wrs: &[RecvWr]) -> io::Result<()> {
        if wrs.is_empty() {
            return Ok(());
        }
        let mut sges = Vec::with_capacity(wrs.len());
        let mut raw = build_recv_wrs(wrs, &mut sges);
        let mut bad = ptr::null_mut();
        // SAFETY: FFI; the WR list and SGEs outlive the call.
        from_c_ret(unsafe { ibv_post_srq_recv(self.inner.srq.as_ptr(), raw.as_mut_ptr(), &mut bad) })
    }
}

#[repr(transparent)]
struct IbvQp(NonNull<ibv_qp>);
impl_ibv_wrapper_traits!(ibv_qp, IbvQp);

struct QpInner {
    _pd: Pd,
    _send_cq: Cq,
    _recv_cq: Cq,
    srq: Option<Srq>,
    qp: IbvQp,
    caps: QpCaps,
    port_num: PortNum,
}

impl Drop for QpInner {
    fn drop(&mut self) {
        // SAFETY: FFI; called once.
        unsafe { ibv_destroy_qp(self.qp.as_ptr()) };
    }
}

/// Reliable-connected queue pair.
#[derive(Clone)]
pub struct Qp {
    inner: Arc<QpInner>,
}

impl fmt::Debug for Qp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Qp<{:#x}>", self.qp_num())
    }
}

impl Qp {
    pub fn new(pd: &Pd, init_attr: QpInitAttr<'_>) -> Result<Qp, QpCreationError> {
        let ctx = pd.context();
        check_caps(&init_attr.caps, ctx.max_qp_wr(), 1024)?;

        let caps = init_attr.caps;
        // SAFETY: POD type.
        let mut attr = unsafe { mem::zeroed::<ibv_qp_init_attr>() };
        attr.send_cq = init_attr.send_cq.as_raw();
        attr.recv_cq = init_attr.recv_cq.as_raw();
        attr.srq = init_attr.srq.map_or(ptr::null_mut(), |srq| srq.inner.srq.as_ptr());
        attr.cap = ibv_qp_cap {
            max_send_wr: caps.max_send_wr,
            max_recv_wr: caps.max_recv_wr,
            max_send_sge: caps.max_send_sge,
            max_recv_sge: caps.max_recv_sge,
            max_inline_data: caps.max_inline_data,
        };
        attr.qp_type = ibv_qp_type::IBV_QPT_RC;
        attr.sq_sig_all = 0;

        // SAFETY: FFI.
        let qp = unsafe { ibv_create_qp(pd.as_raw(), &mut attr) };
        let qp = NonNull::new(qp).ok_or_else(io::Error::last_os_error)?;
        Ok(Self {
            inner: Arc::new(QpInner {
                _pd: pd.clone(),
                _send_cq: init_attr.send_cq.clone(),
                _recv_cq: init_attr.recv_cq.clone(),
                srq: init_attr.srq.cloned(),
                qp: IbvQp(qp),
                caps,
                port_num: ctx.port_num(),
            }),
        })
    }

    #[inline]
    fn as_raw(&self) -> *mut ibv_qp {
        self.inner.qp.as_ptr()
    }

    #[inline]
    pub fn qp_num(&self) -> Qpn {
        // SAFETY: the QP is alive.
        unsafe { (*self.as_raw()).qp_num }
    }

    pub fn state(&self) -> QpState {
        // SAFETY: the QP is alive.
        match unsafe { (*self.as_raw()).state } {
            ibv_qp_state::IBV_QPS_RESET => QpState::Reset,
            ibv_qp_state::IBV_QPS_INIT => QpState::Init,
            ibv_qp_state::IBV_QPS_RTR => QpState::Rtr,
            ibv_qp_state::IBV_QPS_RTS => QpState::Rts,
            _ => QpState::Error,
        }
    }

    #[inline]
    pub fn caps(&self) -> &QpCaps {
        &self.inner.caps
    }

    fn modify(&self, attr: &mut ibv_qp_attr, mask: ibv_qp_attr_mask) -> io::Result<()> {
        // SAFETY: FFI.
        from_c_ret(unsafe { ibv_modify_qp(self.as_raw(), attr, mask.0 as c_int) })
    }

    /// Modify the queue pair from RESET to INIT.
    pub fn modify_to_init(&self, port_num: PortNum) -> io::Result<()> {
        // SAFETY: POD type.
        let mut attr = unsafe { mem::zeroed::<ibv_qp_attr>() };
        attr.qp_state = ibv_qp_state::IBV_QPS_INIT;
        attr.pkey_index = 0;
        attr.port_num = port_num;
        attr.qp_access_flags = (ibv_access_flags::IBV_ACCESS_LOCAL_WRITE
            | ibv_access_flags::IBV_ACCESS_REMOTE_WRITE
            | ibv_access_flags::IBV_ACCESS_REMOTE_READ)
            .0 as _;
        let mask = ibv_qp_attr_mask::IBV_QP_STATE
            | ibv_qp_attr_mask::IBV_QP_PKEY_INDEX
            | ibv_qp_attr_mask::IBV_QP_PORT
            | ibv_qp_attr_mask::IBV_QP_ACCESS_FLAGS;
        self.modify(&mut attr, mask)
    }

    /// Modify the queue pair from INIT to RTR.
    pub fn modify_to_rtr(&self, rtr: &RtrAttr) -> io::Result<()> {
        // SAFETY: POD type.
        let mut attr = unsafe { mem::zeroed::<ibv_qp_attr>() };
        attr.qp_state = ibv_qp_state::IBV_QPS_RTR;
        attr.path_mtu = mtu_from_bytes(rtr.path_mtu);
        attr.dest_qp_num = rtr.dest_qpn;
        attr.rq_psn = rtr.rq_psn;
        attr.max_dest_rd_atomic = 16;
        attr.min_rnr_timer = rtr.min_rnr_timer;

        attr.ah_attr.grh.dgid.raw = rtr.dgid.0;
        attr.ah_attr.grh.flow_label = 0;
        attr.ah_attr.grh.sgid_index = 0;
        attr.ah_attr.grh.hop_limit = 0xFF;
        attr.ah_attr.grh.traffic_class = rtr.traffic_class;
        attr.ah_attr.dlid = rtr.dlid;
        attr.ah_attr.sl = rtr.sl;
        attr.ah_attr.src_path_bits = 0;
        attr.ah_attr.port_num = self.inner.port_num;
        attr.ah_attr.is_global = 1;

        let mask = ibv_qp_attr_mask::IBV_QP_STATE
            | ibv_qp_attr_mask::IBV_QP_AV
            | ibv_qp_attr_mask::IBV_QP_PATH_MTU
            | ibv_qp_attr_mask::IBV_QP_DEST_QPN
            | ibv_qp_attr_mask::IBV_QP_RQ_PSN
            | ibv_qp_attr_mask::IBV_QP_MAX_DEST_RD_ATOMIC
            | ibv_qp_attr_mask::IBV_QP_MIN_RNR_TIMER;
        self.modify(&mut attr, mask)
    }

    /// Modify the queue pair from RTR to RTS.
    pub fn modify_to_rts(&self, rts: &RtsAttr) -> io::Result<()> {
        // SAFETY: POD type.
        let mut attr = unsafe { mem::zeroed::<ibv_qp_attr>() };
        attr.qp_state = ibv_qp_state::IBV_QPS_RTS;
        attr.sq_psn = rts.sq_psn;
        attr.max_rd_atomic = 16;
        attr.timeout = rts.timeout;
        attr.retry_cnt = rts.retry_cnt;
        attr.rnr_retry = rts.rnr_retry;
        let mask = ibv_qp_attr_mask::IBV_QP_STATE
            | ibv_qp_attr_mask::IBV_QP_SQ_PSN
            | ibv_qp_attr_mask::IBV_QP_MAX_QP_RD_ATOMIC
            | ibv_qp_attr_mask::IBV_QP_TIMEOUT
            | ibv_qp_attr_mask::IBV_QP_RETRY_CNT
            | ibv_qp_attr_mask::IBV_QP_RNR_RETRY;
        self.modify(&mut attr, mask)
    }

    /// Modify the queue pair to ERROR, flushing outstanding work requests.
    pub fn modify_to_error(&self) -> io::Result<()> {
        // SAFETY: POD type.
        let mut attr = unsafe { mem::zeroed::<ibv_qp_attr>() };
        attr.qp_state = ibv_qp_state::IBV_QPS_ERR;
        self.modify(&mut attr, ibv_qp_attr_mask::IBV_QP_STATE)
    }

    /// Post a list of send work requests.
    pub fn post_send(&self, wrs: &[SendWr]) -> io::Result<()> {
        if wrs.is_empty() {
            return Ok(());
        }
        let mut sges: Vec<ibv_sge> = wrs
            .iter()
            .map(|wr| {
                let sge = wr.sge.unwrap_or(Sge {
                    addr: 0,
                    length: 0,
                    lkey: 0,
                });
                ibv_sge {
                    addr: sge.addr,
                    length: sge.length,
                    lkey: sge.lkey,
                }
            })
            .collect();

        let mut raw: Vec<ibv_send_wr> = Vec::with_capacity(wrs.len());
        for (i, wr) in wrs.iter().enumerate() {
            // SAFETY: POD type.
            let mut r = unsafe { mem::zeroed::<ibv_send_wr>() };
            r.wr_id = wr.wr_id;
            if wr.sge.is_some() {
                r.sg_list = &mut sges[i];
                r.num_sge = 1;
            }
            let mut flags = 0;
            if wr.signaled {
                flags |= ibv_send_flags::IBV_SEND_SIGNALED.0;
            }
            if wr.inline {
                flags |= ibv_send_flags::IBV_SEND_INLINE.0;
            }
            r.send_flags = flags as _;

            let set_remote = |r: &mut ibv_send_wr, remote: &RemoteMem| {
                r.wr.rdma = rdma_t {
                    remote_addr: remote.addr,
                    rkey: remote.rkey,
                };
            };
            match &wr.op {
                SendOp::Send => r.opcode = ibv_wr_opcode::IBV_WR_SEND,
                SendOp::SendWithImm(imm) => {
                    r.opcode = ibv_wr_opcode::IBV_WR_SEND_WITH_IMM;
                    r.imm_data = imm.to_be();
                }
                SendOp::Write(remote) => {
                    r.opcode = ibv_wr_opcode::IBV_WR_RDMA_WRITE;
                    set_remote(&mut r, remote);
                }
                SendOp::WriteWithImm(remote, imm) => {
                    r.opcode = ibv_wr_opcode::IBV_WR_RDMA_WRITE_WITH_IMM;
                    r.imm_data = imm.to_be();
                    set_remote(&mut r, remote);
                }
                SendOp::Read(remote) => {
                    r.opcode = ibv_wr_opcode::IBV_WR_RDMA_READ;
                    set_remote(&mut r, remote);
                }
            }
            raw.push(r);
        }
        for i in 1..raw.len() {
            let next: *mut ibv_send_wr = &mut raw[i];
            raw[i - 1].next = next;
        }

        let mut bad = ptr::null_mut();
        // SAFETY: FFI; the WR list and SGEs outlive the call.
        from_c_ret(unsafe { ibv_post_send(self.as_raw(), raw.as_mut_ptr(), &mut bad) })
    }

    /// Post a list of receive work requests.
    pub fn post_recv(&self, wrs: &[RecvWr]) -> io::Result<()> {
        if self.inner.srq.is_some() {
            return Err(io::Error::from_raw_os_error(libc::EINVAL));
        }
        if wrs.is_empty() {
            return Ok(());
        }
        let mut sges = Vec::with_capacity(wrs.len());
        let mut raw = build_recv_wrs(wrs, &mut sges);
        let mut bad = ptr::null_mut();
        // SAFETY: FFI; the WR list and SGEs outlive the call.
        from_c_ret(unsafe { ibv_post_recv(self.as_raw(), raw.as_mut_ptr(), &mut bad) })
    }
}
