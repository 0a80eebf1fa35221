//! libibverbs-backed device.
//!
//! One [`VerbsDevice`] per adapter, registered under the kernel device name.
//! Completion queues carry a completion channel whose fd joins the endpoint's
//! epoll set; polling acknowledges channel events, re-arms notification and
//! drains the hardware queue.
//!
//! Hardware work request ids are tokens issued by the completion queue. The
//! token maps back to the caller's `wr_id` and the operation kind, because a
//! flushed hardware completion carries no valid opcode.

use super::{
    CompletionQueue, Device, DeviceAttributes, DeviceError, DeviceFactory, Gid, MemoryRegistration,
    QpEndpoint, QpState, QueuePair, QueuePairConfig, SendOpcode, SendRequest, WcOpcode, WcStatus,
    WorkCompletion,
};
use crate::region::{AccessFlags, SharedRegion};
use ibverbs_sys as ffi;
use nix::fcntl::{FcntlArg, OFlag, fcntl};
use parking_lot::Mutex;
use rand::Rng;
use std::collections::HashMap;
use std::ffi::CStr;
use std::io;
use std::net::IpAddr;
use std::os::fd::{AsFd, BorrowedFd};
use std::ptr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, trace, warn};

const PSN_MASK: u32 = 0x00FF_FFFF;
const POLL_BATCH: usize = 16;
const MIN_RNR_TIMER: u8 = 12;
const ACK_TIMEOUT: u8 = 14;
const RETRY_COUNT: u8 = 7;
const RNR_RETRY: u8 = 7;

fn last_error(call: &'static str) -> DeviceError {
    DeviceError::Verbs {
        call,
        source: io::Error::last_os_error(),
    }
}

fn errno_error(call: &'static str, errno: i32) -> DeviceError {
    DeviceError::Verbs {
        call,
        source: io::Error::from_raw_os_error(errno),
    }
}

// ─── Device list ────────────────────────────────────────────────────

struct DeviceList {
    list: *mut *mut ffi::ibv_device,
    len: usize,
}

impl DeviceList {
    fn open() -> Result<Self, DeviceError> {
        let mut n = 0i32;
        let list = unsafe { ffi::ibv_get_device_list(&mut n as *mut _) };
        if list.is_null() {
            return Err(last_error("ibv_get_device_list"));
        }
        Ok(Self {
            list,
            len: usize::try_from(n).unwrap_or(0),
        })
    }

    fn devices(&self) -> impl Iterator<Item = *mut ffi::ibv_device> + '_ {
        // SAFETY: the list holds `len` valid entries until freed in Drop.
        (0..self.len).map(move |i| unsafe { *self.list.add(i) })
    }
}

impl Drop for DeviceList {
    fn drop(&mut self) {
        unsafe { ffi::ibv_free_device_list(self.list) };
    }
}

fn device_name(dev: *mut ffi::ibv_device) -> Option<String> {
    let name = unsafe { ffi::ibv_get_device_name(dev) };
    if name.is_null() {
        return None;
    }
    Some(unsafe { CStr::from_ptr(name) }.to_string_lossy().into_owned())
}

/// Names of every adapter libibverbs can see. Empty without rdma-core.
pub fn device_names() -> Vec<String> {
    match DeviceList::open() {
        Ok(list) => list.devices().filter_map(device_name).collect(),
        Err(e) => {
            debug!(error = %e, "No verbs devices available");
            Vec::new()
        }
    }
}

// ─── Context ────────────────────────────────────────────────────────

/// Open device context plus its protection domain.
struct Context {
    ctx: *mut ffi::ibv_context,
    pd: *mut ffi::ibv_pd,
}

// SAFETY: libibverbs objects may be used from any thread.
unsafe impl Send for Context {}
unsafe impl Sync for Context {}

impl Context {
    fn open(name: &str) -> Result<Self, DeviceError> {
        let list = DeviceList::open()?;
        let dev = list
            .devices()
            .find(|dev| device_name(*dev).as_deref() == Some(name))
            .ok_or_else(|| DeviceError::NotFound(name.to_string()))?;

        let ctx = unsafe { ffi::ibv_open_device(dev) };
        if ctx.is_null() {
            return Err(last_error("ibv_open_device"));
        }
        let pd = unsafe { ffi::ibv_alloc_pd(ctx) };
        if pd.is_null() {
            let err = last_error("ibv_alloc_pd");
            unsafe { ffi::ibv_close_device(ctx) };
            return Err(err);
        }
        Ok(Self { ctx, pd })
    }

    fn query_port(&self, port: u8) -> Result<ffi::ibv_port_attr, DeviceError> {
        let mut attr = ffi::ibv_port_attr::default();
        let errno = unsafe {
            ffi::ibv_query_port(self.ctx, port, &mut attr as *mut ffi::ibv_port_attr as *mut _)
        };
        if errno != 0 {
            return Err(errno_error("ibv_query_port", errno));
        }
        Ok(attr)
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        let errno = unsafe { ffi::ibv_dealloc_pd(self.pd) };
        if errno != 0 {
            warn!(errno, "ibv_dealloc_pd failed");
        }
        let errno = unsafe { ffi::ibv_close_device(self.ctx) };
        if errno != 0 {
            warn!(errno, "ibv_close_device failed");
        }
    }
}

// ─── Registrations ──────────────────────────────────────────────────

struct Registered {
    registration: MemoryRegistration,
    mr: *mut ffi::ibv_mr,
}

// SAFETY: the MR handle is only passed back to libibverbs.
unsafe impl Send for Registered {}

type Registrations = Arc<Mutex<HashMap<u32, Registered>>>;

fn access_bits(access: AccessFlags) -> ffi::ibv_access_flags {
    let mut bits = ffi::ibv_access_flags(0);
    if access.contains(AccessFlags::LOCAL_WRITE) {
        bits |= ffi::ibv_access_flags::IBV_ACCESS_LOCAL_WRITE;
    }
    if access.contains(AccessFlags::REMOTE_WRITE) {
        bits |= ffi::ibv_access_flags::IBV_ACCESS_REMOTE_WRITE;
    }
    if access.contains(AccessFlags::REMOTE_READ) {
        bits |= ffi::ibv_access_flags::IBV_ACCESS_REMOTE_READ;
    }
    bits
}

// ─── Device ─────────────────────────────────────────────────────────

/// One RDMA adapter opened through libibverbs.
pub struct VerbsDevice {
    name: String,
    attributes: DeviceAttributes,
    registrations: Registrations,
    // Dropped last: every handle above belongs to this context.
    context: Arc<Context>,
}

impl VerbsDevice {
    /// Open the adapter called `name`.
    ///
    /// # Errors
    ///
    /// `NotFound` if no adapter has that name, `Verbs` if it cannot be opened
    /// or queried.
    pub fn open(name: &str) -> Result<Self, DeviceError> {
        let context = Context::open(name)?;

        let mut dev_attr = ffi::ibv_device_attr::default();
        let errno = unsafe { ffi::ibv_query_device(context.ctx, &mut dev_attr) };
        if errno != 0 {
            return Err(errno_error("ibv_query_device", errno));
        }
        let port = context.query_port(1)?;

        let attributes = DeviceAttributes {
            max_mr_size: usize::try_from(dev_attr.max_mr_size).unwrap_or(usize::MAX),
            max_qp: u32::try_from(dev_attr.max_qp).unwrap_or(0),
            max_cqe: usize::try_from(dev_attr.max_cqe).unwrap_or(0),
            port_count: dev_attr.phys_port_cnt,
            gid_table_len: u8::try_from(port.gid_tbl_len).unwrap_or(u8::MAX),
        };
        info!(device = name, ?attributes, lid = port.lid, "Verbs device opened");

        Ok(Self {
            name: name.to_string(),
            attributes,
            registrations: Arc::new(Mutex::new(HashMap::new())),
            context: Arc::new(context),
        })
    }

    /// [`DeviceFactory`] entry for the registry.
    pub fn factory(name: &str) -> Result<Arc<dyn Device>, DeviceError> {
        Ok(Arc::new(Self::open(name)?))
    }

    fn check_port(&self, port: u8) -> Result<(), DeviceError> {
        let count = self.attributes.port_count;
        if port == 0 || port > count {
            return Err(DeviceError::InvalidPort { port, count });
        }
        Ok(())
    }
}

const _: DeviceFactory = VerbsDevice::factory;

impl Drop for VerbsDevice {
    fn drop(&mut self) {
        for (lkey, reg) in self.registrations.lock().drain() {
            let errno = unsafe { ffi::ibv_dereg_mr(reg.mr) };
            if errno != 0 {
                warn!(lkey, errno, "ibv_dereg_mr failed");
            }
        }
    }
}

impl Device for VerbsDevice {
    fn name(&self) -> &str {
        &self.name
    }

    fn attributes(&self) -> DeviceAttributes {
        self.attributes
    }

    fn query_gid(&self, port: u8, index: u8) -> Result<Gid, DeviceError> {
        self.check_port(port)?;
        if index >= self.attributes.gid_table_len {
            return Err(DeviceError::InvalidGidIndex {
                index,
                len: self.attributes.gid_table_len,
            });
        }
        let mut raw = [0u8; 16];
        let errno = unsafe {
            ffi::ibv_query_gid(
                self.context.ctx,
                port,
                i32::from(index),
                raw.as_mut_ptr().cast::<ffi::ibv_gid>(),
            )
        };
        if errno != 0 {
            return Err(last_error("ibv_query_gid"));
        }
        Ok(Gid(raw))
    }

    fn register_region(
        &self,
        region: &Arc<SharedRegion>,
        access: AccessFlags,
    ) -> Result<MemoryRegistration, DeviceError> {
        if region.len() > self.attributes.max_mr_size {
            return Err(DeviceError::Exhausted("region exceeds max_mr_size"));
        }
        let mr = unsafe {
            ffi::ibv_reg_mr(
                self.context.pd,
                region.addr() as *mut _,
                region.len(),
                access_bits(access).0 as i32,
            )
        };
        if mr.is_null() {
            return Err(last_error("ibv_reg_mr"));
        }
        // SAFETY: non-null MR returned by ibv_reg_mr.
        let (lkey, rkey) = unsafe { ((*mr).lkey, (*mr).rkey) };

        let registration = MemoryRegistration {
            lkey,
            rkey,
            addr: region.addr(),
            len: region.len(),
            access,
            region: Arc::clone(region),
        };
        self.registrations.lock().insert(
            lkey,
            Registered {
                registration: registration.clone(),
                mr,
            },
        );
        debug!(device = %self.name, lkey, rkey = format_args!("{rkey:#x}"), len = region.len(), "Region registered");
        Ok(registration)
    }

    fn deregister_region(&self, lkey: u32) -> Result<(), DeviceError> {
        let reg = self
            .registrations
            .lock()
            .remove(&lkey)
            .ok_or(DeviceError::InvalidKey { key: lkey })?;
        let errno = unsafe { ffi::ibv_dereg_mr(reg.mr) };
        if errno != 0 {
            return Err(errno_error("ibv_dereg_mr", errno));
        }
        debug!(device = %self.name, lkey, "Region deregistered");
        Ok(())
    }

    fn registration_count(&self) -> usize {
        self.registrations.lock().len()
    }

    fn create_completion_queue(&self, depth: usize) -> Result<Arc<CompletionQueue>, DeviceError> {
        if depth == 0 || depth > self.attributes.max_cqe {
            return Err(DeviceError::Exhausted("completion queue depth"));
        }
        let cq = VerbsCq::new(Arc::clone(&self.context), depth)?;
        Ok(Arc::new(CompletionQueue::from_verbs(depth, cq)))
    }

    fn create_queue_pair(
        &self,
        config: QueuePairConfig,
        cq: Arc<CompletionQueue>,
    ) -> Result<Box<dyn QueuePair>, DeviceError> {
        let gid = self.query_gid(config.port, config.sgid_index)?;
        let port = self.context.query_port(config.port)?;
        let qp = VerbsQueuePair::new(
            Arc::clone(&self.context),
            Arc::clone(&self.registrations),
            cq,
            config,
            port,
            gid,
        )?;
        Ok(Box::new(qp))
    }
}

// ─── Completion queue ───────────────────────────────────────────────

/// Hardware completion queue with its completion channel.
pub struct VerbsCq {
    channel: *mut ffi::ibv_comp_channel,
    cq: *mut ffi::ibv_cq,
    depth: usize,
    pending: Mutex<HashMap<u64, (u64, WcOpcode)>>,
    next_token: AtomicU64,
    context: Arc<Context>,
}

// SAFETY: verbs calls are thread-safe; bookkeeping is behind a mutex.
unsafe impl Send for VerbsCq {}
unsafe impl Sync for VerbsCq {}

impl VerbsCq {
    fn new(context: Arc<Context>, depth: usize) -> Result<Self, DeviceError> {
        let channel = unsafe { ffi::ibv_create_comp_channel(context.ctx) };
        if channel.is_null() {
            return Err(last_error("ibv_create_comp_channel"));
        }

        let cqe = i32::try_from(depth).map_err(|_| DeviceError::Exhausted("completion queue depth"))?;
        let cq = unsafe { ffi::ibv_create_cq(context.ctx, cqe, ptr::null_mut(), channel, 0) };
        if cq.is_null() {
            let err = last_error("ibv_create_cq");
            unsafe { ffi::ibv_destroy_comp_channel(channel) };
            return Err(err);
        }

        let this = Self {
            channel,
            cq,
            depth,
            pending: Mutex::new(HashMap::with_capacity(depth)),
            next_token: AtomicU64::new(1),
            context,
        };
        let flags = OFlag::from_bits_truncate(fcntl(this.as_fd(), FcntlArg::F_GETFL)?);
        fcntl(this.as_fd(), FcntlArg::F_SETFL(flags | OFlag::O_NONBLOCK))?;
        this.arm()?;
        Ok(this)
    }

    pub(crate) fn raw(&self) -> *mut ffi::ibv_cq {
        self.cq
    }

    /// Reserve a token for a work request. Refused once `depth` are in flight.
    fn track(&self, wr_id: u64, opcode: WcOpcode) -> Result<u64, DeviceError> {
        let mut pending = self.pending.lock();
        if pending.len() >= self.depth {
            return Err(DeviceError::Exhausted("completion queue"));
        }
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        pending.insert(token, (wr_id, opcode));
        Ok(token)
    }

    fn untrack(&self, token: u64) {
        self.pending.lock().remove(&token);
    }

    fn arm(&self) -> Result<(), DeviceError> {
        // SAFETY: `cq` is live and its context outlives it.
        let notify = unsafe { (*self.context.ctx).ops.req_notify_cq }
            .ok_or(DeviceError::Unsupported("req_notify_cq"))?;
        let errno = unsafe { notify(self.cq, 0) };
        if errno != 0 {
            return Err(errno_error("ibv_req_notify_cq", errno));
        }
        Ok(())
    }

    fn ack_events(&self) {
        let mut events = 0u32;
        loop {
            let mut ev_cq: *mut ffi::ibv_cq = ptr::null_mut();
            let mut ev_ctx: *mut std::ffi::c_void = ptr::null_mut();
            let rc = unsafe { ffi::ibv_get_cq_event(self.channel, &mut ev_cq, &mut ev_ctx) };
            if rc != 0 {
                break;
            }
            events += 1;
        }
        if events > 0 {
            unsafe { ffi::ibv_ack_cq_events(self.cq, events) };
        }
    }

    /// Acknowledge channel events, re-arm, then drain up to `max` completions.
    pub(crate) fn poll(&self, max: usize) -> Result<Vec<WorkCompletion>, DeviceError> {
        self.ack_events();
        self.arm()?;

        let poll_cq = unsafe { (*self.context.ctx).ops.poll_cq }
            .ok_or(DeviceError::Unsupported("poll_cq"))?;
        let mut out = Vec::new();
        let mut batch = [ffi::ibv_wc::default(); POLL_BATCH];
        while out.len() < max {
            let want = POLL_BATCH.min(max - out.len());
            let n = unsafe { poll_cq(self.cq, want as i32, batch.as_mut_ptr()) };
            if n < 0 {
                return Err(errno_error("ibv_poll_cq", -n));
            }
            let n = n as usize;
            for wc in &batch[..n] {
                if let Some(done) = self.translate(wc) {
                    out.push(done);
                }
            }
            if n < want {
                break;
            }
        }
        Ok(out)
    }

    fn translate(&self, wc: &ffi::ibv_wc) -> Option<WorkCompletion> {
        let Some((wr_id, opcode)) = self.pending.lock().remove(&wc.wr_id()) else {
            warn!(token = wc.wr_id(), "Completion for an unknown work request");
            return None;
        };
        let status = match wc.error() {
            None => WcStatus::Success,
            Some((status, vendor)) => {
                trace!(status, vendor, wr_id, "Work request failed");
                map_status(status)
            }
        };
        let imm_data = wc.imm_data().map(u32::from_be);
        let opcode = match (opcode, imm_data) {
            (WcOpcode::Recv, Some(_)) => WcOpcode::RecvWithImm,
            (opcode, _) => opcode,
        };
        Some(WorkCompletion {
            wr_id,
            opcode,
            status,
            byte_len: if status.is_success() { wc.len() as u32 } else { 0 },
            imm_data,
            qp_num: wc.qp_num,
        })
    }
}

fn map_status(status: ffi::ibv_wc_status::Type) -> WcStatus {
    match status {
        ffi::ibv_wc_status::IBV_WC_SUCCESS => WcStatus::Success,
        ffi::ibv_wc_status::IBV_WC_WR_FLUSH_ERR => WcStatus::FlushError,
        ffi::ibv_wc_status::IBV_WC_REM_ACCESS_ERR | ffi::ibv_wc_status::IBV_WC_REM_INV_REQ_ERR => {
            WcStatus::RemoteAccessError
        }
        ffi::ibv_wc_status::IBV_WC_LOC_PROT_ERR
        | ffi::ibv_wc_status::IBV_WC_LOC_LEN_ERR
        | ffi::ibv_wc_status::IBV_WC_LOC_ACCESS_ERR => WcStatus::LocalProtectionError,
        _ => WcStatus::LinkError,
    }
}

impl AsFd for VerbsCq {
    fn as_fd(&self) -> BorrowedFd<'_> {
        // SAFETY: the channel fd stays open until Drop destroys the channel.
        unsafe { BorrowedFd::borrow_raw((*self.channel).fd) }
    }
}

impl Drop for VerbsCq {
    fn drop(&mut self) {
        // Unacknowledged events would block ibv_destroy_cq.
        self.ack_events();
        let errno = unsafe { ffi::ibv_destroy_cq(self.cq) };
        if errno != 0 {
            warn!(errno, "ibv_destroy_cq failed");
        }
        let errno = unsafe { ffi::ibv_destroy_comp_channel(self.channel) };
        if errno != 0 {
            warn!(errno, "ibv_destroy_comp_channel failed");
        }
    }
}

// ─── Queue pair ─────────────────────────────────────────────────────

/// Reliable-connected hardware queue pair.
pub struct VerbsQueuePair {
    qp: *mut ffi::ibv_qp,
    local: QpEndpoint,
    config: QueuePairConfig,
    port_attr: ffi::ibv_port_attr,
    state: QpState,
    registrations: Registrations,
    cq: Arc<CompletionQueue>,
    destroyed: bool,
    _context: Arc<Context>,
}

// SAFETY: the QP handle is only used through &mut self.
unsafe impl Send for VerbsQueuePair {}

impl VerbsQueuePair {
    fn new(
        context: Arc<Context>,
        registrations: Registrations,
        cq: Arc<CompletionQueue>,
        config: QueuePairConfig,
        port: ffi::ibv_port_attr,
        gid: Gid,
    ) -> Result<Self, DeviceError> {
        let raw_cq = cq
            .verbs()
            .map(VerbsCq::raw)
            .ok_or(DeviceError::Unsupported("software completion queue on a verbs device"))?;
        let wr_depth = u32::try_from(cq.depth()).unwrap_or(u32::MAX);

        let mut init = ffi::ibv_qp_init_attr {
            qp_context: ptr::null_mut(),
            send_cq: raw_cq,
            recv_cq: raw_cq,
            srq: ptr::null_mut(),
            cap: ffi::ibv_qp_cap {
                max_send_wr: wr_depth,
                max_recv_wr: wr_depth,
                max_send_sge: 1,
                max_recv_sge: 1,
                max_inline_data: 0,
            },
            qp_type: ffi::ibv_qp_type::IBV_QPT_RC,
            sq_sig_all: 0,
        };
        let qp = unsafe { ffi::ibv_create_qp(context.pd, &mut init) };
        if qp.is_null() {
            return Err(last_error("ibv_create_qp"));
        }

        let local = QpEndpoint {
            // SAFETY: non-null QP returned by ibv_create_qp.
            qp_num: unsafe { (*qp).qp_num },
            psn: rand::thread_rng().gen_range(0..=PSN_MASK),
            lid: port.lid,
            gid,
        };
        debug!(qp = local.qp_num, psn = local.psn, lid = local.lid, %gid, "Queue pair created");

        Ok(Self {
            qp,
            local,
            config,
            port_attr: port,
            state: QpState::Reset,
            registrations,
            cq,
            destroyed: false,
            _context: context,
        })
    }

    fn expect_state(&self, accepted: &[QpState], expected: &'static str) -> Result<(), DeviceError> {
        let state = self.state();
        if accepted.contains(&state) {
            Ok(())
        } else {
            Err(DeviceError::InvalidQpState {
                qp_num: self.local.qp_num,
                state,
                expected,
            })
        }
    }

    fn modify(
        &mut self,
        mut attr: ffi::ibv_qp_attr,
        mask: ffi::ibv_qp_attr_mask,
        target: QpState,
    ) -> Result<(), DeviceError> {
        let errno = unsafe { ffi::ibv_modify_qp(self.qp, &mut attr as *mut _, mask.0 as i32) };
        if errno != 0 {
            self.state = QpState::Error;
            return Err(errno_error("ibv_modify_qp", errno));
        }
        trace!(qp = self.local.qp_num, from = ?self.state, to = ?target, "Queue pair transition");
        self.state = target;
        Ok(())
    }

    fn verbs_cq(&self) -> Result<&VerbsCq, DeviceError> {
        self.cq
            .verbs()
            .ok_or(DeviceError::Unsupported("software completion queue on a verbs device"))
    }
}

fn qp_state(state: ffi::ibv_qp_state::Type) -> QpState {
    match state {
        ffi::ibv_qp_state::IBV_QPS_RESET => QpState::Reset,
        ffi::ibv_qp_state::IBV_QPS_INIT => QpState::Init,
        ffi::ibv_qp_state::IBV_QPS_RTR => QpState::Rtr,
        ffi::ibv_qp_state::IBV_QPS_RTS => QpState::Rts,
        _ => QpState::Error,
    }
}

impl QueuePair for VerbsQueuePair {
    fn qp_num(&self) -> u32 {
        self.local.qp_num
    }

    /// Hardware state; a fault raised by the adapter shows up here.
    fn state(&self) -> QpState {
        if self.destroyed {
            return QpState::Error;
        }
        let mut attr = ffi::ibv_qp_attr::default();
        // SAFETY: plain C struct; ibv_query_qp only writes into it.
        let mut init: ffi::ibv_qp_init_attr = unsafe { std::mem::zeroed() };
        let mask = ffi::ibv_qp_attr_mask::IBV_QP_STATE;
        let errno = unsafe { ffi::ibv_query_qp(self.qp, &mut attr, mask.0 as i32, &mut init) };
        if errno != 0 {
            return self.state;
        }
        qp_state(attr.qp_state)
    }

    fn local_endpoint(&self) -> QpEndpoint {
        self.local
    }

    fn modify_to_init(&mut self, access: AccessFlags) -> Result<(), DeviceError> {
        self.expect_state(&[QpState::Reset], "RESET")?;
        let mut attr = ffi::ibv_qp_attr::default();
        attr.qp_state = ffi::ibv_qp_state::IBV_QPS_INIT;
        attr.qp_access_flags = access_bits(access).0;
        attr.pkey_index = 0;
        attr.port_num = self.config.port;
        let mask = ffi::ibv_qp_attr_mask::IBV_QP_STATE
            | ffi::ibv_qp_attr_mask::IBV_QP_PKEY_INDEX
            | ffi::ibv_qp_attr_mask::IBV_QP_PORT
            | ffi::ibv_qp_attr_mask::IBV_QP_ACCESS_FLAGS;
        self.modify(attr, mask, QpState::Init)
    }

    fn modify_to_rtr(&mut self, remote: &QpEndpoint, _peer_ip: IpAddr) -> Result<(), DeviceError> {
        self.expect_state(&[QpState::Init], "INIT")?;
        let mut attr = ffi::ibv_qp_attr::default();
        attr.qp_state = ffi::ibv_qp_state::IBV_QPS_RTR;
        attr.path_mtu = self.port_attr.active_mtu;
        attr.dest_qp_num = remote.qp_num;
        attr.rq_psn = remote.psn;
        attr.max_dest_rd_atomic = 1;
        attr.min_rnr_timer = MIN_RNR_TIMER;
        attr.ah_attr.dlid = remote.lid;
        attr.ah_attr.sl = 0;
        attr.ah_attr.src_path_bits = 0;
        attr.ah_attr.port_num = self.config.port;
        // RoCE and routed fabrics address the peer by GID.
        if remote.gid != Gid::default() {
            attr.ah_attr.is_global = 1;
            attr.ah_attr.grh.dgid.raw = remote.gid.0;
            attr.ah_attr.grh.sgid_index = self.config.sgid_index;
            attr.ah_attr.grh.hop_limit = 0xff;
        }
        let mask = ffi::ibv_qp_attr_mask::IBV_QP_STATE
            | ffi::ibv_qp_attr_mask::IBV_QP_AV
            | ffi::ibv_qp_attr_mask::IBV_QP_PATH_MTU
            | ffi::ibv_qp_attr_mask::IBV_QP_DEST_QPN
            | ffi::ibv_qp_attr_mask::IBV_QP_RQ_PSN
            | ffi::ibv_qp_attr_mask::IBV_QP_MAX_DEST_RD_ATOMIC
            | ffi::ibv_qp_attr_mask::IBV_QP_MIN_RNR_TIMER;
        self.modify(attr, mask, QpState::Rtr)
    }

    fn modify_to_rts(&mut self) -> Result<(), DeviceError> {
        self.expect_state(&[QpState::Rtr], "RTR")?;
        let mut attr = ffi::ibv_qp_attr::default();
        attr.qp_state = ffi::ibv_qp_state::IBV_QPS_RTS;
        attr.timeout = ACK_TIMEOUT;
        attr.retry_cnt = RETRY_COUNT;
        attr.sq_psn = self.local.psn;
        attr.rnr_retry = RNR_RETRY;
        attr.max_rd_atomic = 1;
        let mask = ffi::ibv_qp_attr_mask::IBV_QP_STATE
            | ffi::ibv_qp_attr_mask::IBV_QP_TIMEOUT
            | ffi::ibv_qp_attr_mask::IBV_QP_RETRY_CNT
            | ffi::ibv_qp_attr_mask::IBV_QP_SQ_PSN
            | ffi::ibv_qp_attr_mask::IBV_QP_RNR_RETRY
            | ffi::ibv_qp_attr_mask::IBV_QP_MAX_QP_RD_ATOMIC;
        self.modify(attr, mask, QpState::Rts)?;
        info!(qp = self.local.qp_num, "Queue pair ready to send");
        Ok(())
    }

    fn post_send(&mut self, wr: SendRequest) -> Result<(), DeviceError> {
        self.expect_state(&[QpState::Rts], "RTS")?;
        {
            let registrations = self.registrations.lock();
            let reg = registrations
                .get(&wr.lkey)
                .ok_or(DeviceError::InvalidKey { key: wr.lkey })?;
            reg.registration
                .offset_of(wr.local_addr, u64::from(wr.len))
                .ok_or(DeviceError::LocalRange {
                    addr: wr.local_addr,
                    len: wr.len,
                })?;
        }

        let (opcode, wc_opcode, imm) = match wr.opcode {
            SendOpcode::Write => (ffi::ibv_wr_opcode::IBV_WR_RDMA_WRITE, WcOpcode::Write, None),
            SendOpcode::WriteWithImm { imm } => (
                ffi::ibv_wr_opcode::IBV_WR_RDMA_WRITE_WITH_IMM,
                WcOpcode::WriteWithImm,
                Some(imm),
            ),
            SendOpcode::Read => (ffi::ibv_wr_opcode::IBV_WR_RDMA_READ, WcOpcode::Read, None),
        };
        let cq = self.verbs_cq()?;
        let token = cq.track(wr.wr_id, wc_opcode)?;

        let mut sge = ffi::ibv_sge {
            addr: wr.local_addr,
            length: wr.len,
            lkey: wr.lkey,
        };
        let mut send = ffi::ibv_send_wr {
            wr_id: token,
            next: ptr::null_mut(),
            sg_list: &mut sge as *mut _,
            num_sge: 1,
            opcode,
            send_flags: ffi::ibv_send_flags::IBV_SEND_SIGNALED.0,
            wr: Default::default(),
            qp_type: Default::default(),
            __bindgen_anon_1: Default::default(),
            __bindgen_anon_2: Default::default(),
        };
        let mut bad: *mut ffi::ibv_send_wr = ptr::null_mut();

        let errno = unsafe {
            send.wr.rdma.remote_addr = wr.remote_addr;
            send.wr.rdma.rkey = wr.rkey;
            if let Some(imm) = imm {
                send.__bindgen_anon_1.imm_data = imm.to_be();
            }
            match (*(*self.qp).context).ops.post_send {
                Some(post) => post(self.qp, &mut send, &mut bad),
                None => missing_op(),
            }
        };
        if errno != 0 {
            cq.untrack(token);
            return Err(errno_error("ibv_post_send", errno));
        }
        trace!(qp = self.local.qp_num, wr_id = wr.wr_id, token, opcode = ?wr.opcode, len = wr.len, "Posted send");
        Ok(())
    }

    fn post_recv(&mut self, wr_id: u64) -> Result<(), DeviceError> {
        self.expect_state(&[QpState::Init, QpState::Rtr, QpState::Rts], "INIT, RTR or RTS")?;
        let cq = self.verbs_cq()?;
        let token = cq.track(wr_id, WcOpcode::Recv)?;

        // No scatter entries: a write with immediate carries no receive payload.
        let mut recv = ffi::ibv_recv_wr {
            wr_id: token,
            next: ptr::null_mut(),
            sg_list: ptr::null_mut(),
            num_sge: 0,
        };
        let mut bad: *mut ffi::ibv_recv_wr = ptr::null_mut();
        let errno = unsafe {
            match (*(*self.qp).context).ops.post_recv {
                Some(post) => post(self.qp, &mut recv, &mut bad),
                None => missing_op(),
            }
        };
        if errno != 0 {
            cq.untrack(token);
            return Err(errno_error("ibv_post_recv", errno));
        }
        Ok(())
    }

    fn destroy(&mut self) -> Result<(), DeviceError> {
        if self.destroyed {
            return Ok(());
        }
        self.destroyed = true;
        self.state = QpState::Error;
        let errno = unsafe { ffi::ibv_destroy_qp(self.qp) };
        if errno != 0 {
            return Err(errno_error("ibv_destroy_qp", errno));
        }
        debug!(qp = self.local.qp_num, "Queue pair destroyed");
        Ok(())
    }
}

/// Errno reported when the provider leaves a data-path op unset.
fn missing_op() -> i32 {
    nix::errno::Errno::ENOSYS as i32
}

impl Drop for VerbsQueuePair {
    fn drop(&mut self) {
        if let Err(e) = self.destroy() {
            warn!(qp = self.local.qp_num, error = %e, "Queue pair destroy failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn access_flags_map_to_verbs_bits() {
        let bits = access_bits(AccessFlags::connection_default());
        let want = ffi::ibv_access_flags::IBV_ACCESS_LOCAL_WRITE
            | ffi::ibv_access_flags::IBV_ACCESS_REMOTE_WRITE
            | ffi::ibv_access_flags::IBV_ACCESS_REMOTE_READ;
        assert_eq!(bits.0, want.0);
        assert_eq!(access_bits(AccessFlags::empty()).0, 0);
    }

    #[test]
    fn hardware_statuses_fold_into_completion_statuses() {
        use ffi::ibv_wc_status::*;
        assert_eq!(map_status(IBV_WC_SUCCESS), WcStatus::Success);
        assert_eq!(map_status(IBV_WC_WR_FLUSH_ERR), WcStatus::FlushError);
        assert_eq!(map_status(IBV_WC_REM_ACCESS_ERR), WcStatus::RemoteAccessError);
        assert_eq!(map_status(IBV_WC_LOC_PROT_ERR), WcStatus::LocalProtectionError);
        assert_eq!(map_status(IBV_WC_RETRY_EXC_ERR), WcStatus::LinkError);
    }

    #[test]
    fn qp_states_fold_into_device_states() {
        use ffi::ibv_qp_state::*;
        assert_eq!(qp_state(IBV_QPS_RESET), QpState::Reset);
        assert_eq!(qp_state(IBV_QPS_RTS), QpState::Rts);
        assert_eq!(qp_state(IBV_QPS_SQE), QpState::Error);
        assert_eq!(qp_state(IBV_QPS_ERR), QpState::Error);
    }

    #[test]
    fn unknown_adapter_not_found() {
        assert!(!device_names().iter().any(|n| n == "no-such-adapter"));
        assert!(matches!(
            VerbsDevice::open("no-such-adapter"),
            Err(DeviceError::NotFound(_) | DeviceError::Verbs { .. })
        ));
    }
}
