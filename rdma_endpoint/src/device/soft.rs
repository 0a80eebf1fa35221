//! Software RDMA device.
//!
//! Emulates reliable-connected queue pairs over TCP so the endpoint runs on
//! hosts without an RDMA NIC. Each queue pair listens on its own port (the
//! port number doubles as the LID) and, once connected, runs one receive
//! thread that plays the part of the NIC: it applies remote writes directly
//! into the registered region, answers remote reads, and posts completions.
//!
//! Link setup: the side with the lower `(psn, qpn, lid)` tuple dials, the
//! other accepts. Both then swap a `HELLO` frame naming both QPNs.

use super::frame::{
    FrameHeader, OP_ACK, OP_HELLO, OP_READ_REQ, OP_READ_RESP, OP_WRITE, OP_WRITE_IMM, read_header,
    write_frame,
};
use super::{
    CompletionQueue, Device, DeviceAttributes, DeviceError, DeviceFactory, Gid, MemoryRegistration,
    QpEndpoint, QpState, QueuePair, QueuePairConfig, SendOpcode, SendRequest, WcOpcode, WcStatus,
    WorkCompletion,
};
use crate::region::{AccessFlags, SharedRegion};
use parking_lot::Mutex;
use rand::Rng;
use rdma_common::consts::SHM_MAX_SIZE;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::io::{self, Read};
use std::net::{IpAddr, Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// Registry name of the software device.
pub const SOFT_DEVICE_NAME: &str = "soft";

const SOFT_MAX_QP: u32 = 1024;
const SOFT_MAX_CQE: usize = 65_536;
const QPN_MASK: u32 = 0x00FF_FFFF;
const ACCEPT_POLL: Duration = Duration::from_millis(2);

/// GID table: index 0 defers addressing to the rendezvous peer address,
/// index 1 pins the loopback interface.
const GID_TABLE: [Ipv4Addr; 2] = [Ipv4Addr::UNSPECIFIED, Ipv4Addr::LOCALHOST];

// ─── Registrations ──────────────────────────────────────────────────

#[derive(Default)]
struct Registrations {
    next_lkey: u32,
    by_lkey: HashMap<u32, MemoryRegistration>,
}

/// Keys issued by one device instance.
#[derive(Default)]
struct RegistrationTable {
    inner: Mutex<Registrations>,
}

impl RegistrationTable {
    fn insert(&self, region: &Arc<SharedRegion>, access: AccessFlags) -> MemoryRegistration {
        let mut inner = self.inner.lock();
        inner.next_lkey = inner.next_lkey.wrapping_add(1).max(1);
        let lkey = inner.next_lkey;

        let mut rng = rand::thread_rng();
        let rkey = loop {
            let candidate: u32 = rng.r#gen::<u32>() | 1;
            if !inner.by_lkey.values().any(|r| r.rkey == candidate) {
                break candidate;
            }
        };

        let registration = MemoryRegistration {
            lkey,
            rkey,
            addr: region.addr(),
            len: region.len(),
            access,
            region: Arc::clone(region),
        };
        inner.by_lkey.insert(lkey, registration.clone());
        registration
    }

    fn remove(&self, lkey: u32) -> Option<MemoryRegistration> {
        self.inner.lock().by_lkey.remove(&lkey)
    }

    fn by_lkey(&self, lkey: u32) -> Option<MemoryRegistration> {
        self.inner.lock().by_lkey.get(&lkey).cloned()
    }

    fn by_rkey(&self, rkey: u32) -> Option<MemoryRegistration> {
        self.inner
            .lock()
            .by_lkey
            .values()
            .find(|r| r.rkey == rkey)
            .cloned()
    }

    fn len(&self) -> usize {
        self.inner.lock().by_lkey.len()
    }

    /// Resolve a remote access to `(region, offset)` or the status to report.
    fn remote_access(
        &self,
        rkey: u32,
        addr: u64,
        len: u32,
        needed: AccessFlags,
    ) -> Result<(Arc<SharedRegion>, usize), WcStatus> {
        let reg = self.by_rkey(rkey).ok_or(WcStatus::RemoteAccessError)?;
        if !reg.access.contains(needed) {
            return Err(WcStatus::RemoteAccessError);
        }
        let offset = reg
            .offset_of(addr, u64::from(len))
            .ok_or(WcStatus::RemoteAccessError)?;
        Ok((reg.region, offset))
    }
}

// ─── Device ─────────────────────────────────────────────────────────

/// Software RDMA device instance.
pub struct SoftDevice {
    registrations: Arc<RegistrationTable>,
    qp_count: Arc<AtomicU32>,
}

impl SoftDevice {
    /// Create a device with an empty key table.
    pub fn new() -> Self {
        Self {
            registrations: Arc::new(RegistrationTable::default()),
            qp_count: Arc::new(AtomicU32::new(0)),
        }
    }

    /// [`DeviceFactory`] entry for the registry.
    pub fn factory(_name: &str) -> Result<Arc<dyn Device>, DeviceError> {
        Ok(Arc::new(Self::new()))
    }

    fn check_port(&self, port: u8) -> Result<(), DeviceError> {
        let count = self.attributes().port_count;
        if port == 0 || port > count {
            return Err(DeviceError::InvalidPort { port, count });
        }
        Ok(())
    }
}

impl Default for SoftDevice {
    fn default() -> Self {
        Self::new()
    }
}

// Keep the factory signature in sync with the registry.
const _: DeviceFactory = SoftDevice::factory;

impl Device for SoftDevice {
    fn name(&self) -> &str {
        SOFT_DEVICE_NAME
    }

    fn attributes(&self) -> DeviceAttributes {
        DeviceAttributes {
            max_mr_size: SHM_MAX_SIZE,
            max_qp: SOFT_MAX_QP,
            max_cqe: SOFT_MAX_CQE,
            port_count: 1,
            gid_table_len: GID_TABLE.len() as u8,
        }
    }

    fn query_gid(&self, port: u8, index: u8) -> Result<Gid, DeviceError> {
        self.check_port(port)?;
        GID_TABLE
            .get(usize::from(index))
            .map(|ip| Gid::from_ipv4(*ip))
            .ok_or(DeviceError::InvalidGidIndex {
                index,
                len: GID_TABLE.len() as u8,
            })
    }

    fn register_region(
        &self,
        region: &Arc<SharedRegion>,
        access: AccessFlags,
    ) -> Result<MemoryRegistration, DeviceError> {
        if region.len() > self.attributes().max_mr_size {
            return Err(DeviceError::Exhausted("region exceeds max_mr_size"));
        }
        let reg = self.registrations.insert(region, access);
        debug!(lkey = reg.lkey, rkey = format_args!("{:#x}", reg.rkey), len = reg.len, "Region registered");
        Ok(reg)
    }

    fn deregister_region(&self, lkey: u32) -> Result<(), DeviceError> {
        self.registrations
            .remove(lkey)
            .map(|_| debug!(lkey, "Region deregistered"))
            .ok_or(DeviceError::InvalidKey { key: lkey })
    }

    fn registration_count(&self) -> usize {
        self.registrations.len()
    }

    fn create_completion_queue(&self, depth: usize) -> Result<Arc<CompletionQueue>, DeviceError> {
        if depth == 0 || depth > SOFT_MAX_CQE {
            return Err(DeviceError::Exhausted("completion queue depth"));
        }
        Ok(Arc::new(CompletionQueue::new(depth)?))
    }

    fn create_queue_pair(
        &self,
        config: QueuePairConfig,
        cq: Arc<CompletionQueue>,
    ) -> Result<Box<dyn QueuePair>, DeviceError> {
        let gid = self.query_gid(config.port, config.sgid_index)?;

        let previous = self.qp_count.fetch_add(1, Ordering::AcqRel);
        if previous >= SOFT_MAX_QP {
            self.qp_count.fetch_sub(1, Ordering::AcqRel);
            return Err(DeviceError::Exhausted("queue pairs"));
        }

        let qp = SoftQueuePair::new(
            config,
            gid,
            cq,
            Arc::clone(&self.registrations),
            Arc::clone(&self.qp_count),
        );
        if qp.is_err() {
            self.qp_count.fetch_sub(1, Ordering::AcqRel);
        }
        Ok(Box::new(qp?))
    }

    fn attaches_streams(&self) -> bool {
        true
    }
}

// ─── Queue pair ─────────────────────────────────────────────────────

/// Receive routed into the queue by a peer's write-with-immediate that
/// arrived before any receive was posted; its ACK is held back.
struct PendingImm {
    seq: u64,
    imm: u32,
    byte_len: u32,
}

struct Outstanding {
    wr_id: u64,
    opcode: WcOpcode,
    len: u32,
    // Destination of a read.
    sink: Option<(Arc<SharedRegion>, usize)>,
}

#[derive(Default)]
struct WorkState {
    recv_queue: VecDeque<u64>,
    pending_imm: VecDeque<PendingImm>,
    outstanding: BTreeMap<u64, Outstanding>,
}

/// State shared between the owner and the receive thread.
struct QpShared {
    qp_num: u32,
    state: Mutex<QpState>,
    closing: AtomicBool,
    work: Mutex<WorkState>,
}

impl QpShared {
    fn completion(&self, wr_id: u64, opcode: WcOpcode, status: WcStatus, byte_len: u32) -> WorkCompletion {
        WorkCompletion {
            wr_id,
            opcode,
            status,
            byte_len,
            imm_data: None,
            qp_num: self.qp_num,
        }
    }

    /// Move to ERROR and flush every posted request. Idempotent.
    fn fail(&self, cq: &CompletionQueue, reason: &str) {
        {
            let mut state = self.state.lock();
            if *state == QpState::Error {
                return;
            }
            *state = QpState::Error;
        }
        warn!(qp = self.qp_num, reason, "Queue pair entered error state");

        let mut work = self.work.lock();
        let mut flushed = 0usize;
        for (_, op) in std::mem::take(&mut work.outstanding) {
            cq.push(self.completion(op.wr_id, op.opcode, WcStatus::FlushError, 0));
            flushed += 1;
        }
        for wr_id in work.recv_queue.drain(..) {
            cq.push(self.completion(wr_id, WcOpcode::Recv, WcStatus::FlushError, 0));
            flushed += 1;
        }
        work.pending_imm.clear();

        if flushed == 0 {
            cq.push(self.completion(0, WcOpcode::Recv, WcStatus::LinkError, 0));
        }
    }
}

/// Soft reliable-connected queue pair.
pub struct SoftQueuePair {
    local: QpEndpoint,
    config: QueuePairConfig,
    access: AccessFlags,
    link_listener: Option<TcpListener>,
    attached: Option<TcpStream>,
    link: Option<TcpStream>,
    writer: Option<Arc<Mutex<TcpStream>>>,
    receiver: Option<JoinHandle<()>>,
    next_seq: u64,
    shared: Arc<QpShared>,
    registrations: Arc<RegistrationTable>,
    cq: Arc<CompletionQueue>,
    qp_count: Arc<AtomicU32>,
    destroyed: bool,
}

impl SoftQueuePair {
    fn new(
        config: QueuePairConfig,
        gid: Gid,
        cq: Arc<CompletionQueue>,
        registrations: Arc<RegistrationTable>,
        qp_count: Arc<AtomicU32>,
    ) -> Result<Self, DeviceError> {
        let link_listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0))?;
        let lid = link_listener.local_addr()?.port();

        let mut rng = rand::thread_rng();
        let local = QpEndpoint {
            qp_num: rng.gen_range(1..=QPN_MASK),
            psn: rng.gen_range(0..=QPN_MASK),
            lid,
            gid,
        };

        debug!(qp = local.qp_num, psn = local.psn, lid, "Queue pair created");

        Ok(Self {
            local,
            config,
            access: AccessFlags::empty(),
            link_listener: Some(link_listener),
            attached: None,
            link: None,
            writer: None,
            receiver: None,
            next_seq: 1,
            shared: Arc::new(QpShared {
                qp_num: local.qp_num,
                state: Mutex::new(QpState::Reset),
                closing: AtomicBool::new(false),
                work: Mutex::new(WorkState::default()),
            }),
            registrations,
            cq,
            qp_count,
            destroyed: false,
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

    fn set_state(&self, state: QpState) {
        *self.shared.state.lock() = state;
    }

    fn establish_link(&mut self, remote: &QpEndpoint, peer_ip: IpAddr) -> Result<TcpStream, DeviceError> {
        let timeout = self.config.link_timeout;
        if let Some(stream) = self.attached.take() {
            debug!(qp = self.local.qp_num, "Using attached stream as data path");
            return Ok(stream);
        }

        let ours = (self.local.psn, self.local.qp_num, self.local.lid);
        let theirs = (remote.psn, remote.qp_num, remote.lid);
        if ours == theirs {
            return Err(DeviceError::Peer("peer advertised our own queue pair".to_string()));
        }

        if ours < theirs {
            let addr = SocketAddr::new(peer_ip, remote.lid);
            debug!(qp = self.local.qp_num, %addr, "Dialing peer queue pair");
            TcpStream::connect_timeout(&addr, timeout)
                .map_err(|e| DeviceError::Link(format!("connect {addr}: {e}")))
        } else {
            let listener = self
                .link_listener
                .as_ref()
                .ok_or(DeviceError::Link("link listener already consumed".to_string()))?;
            listener.set_nonblocking(true)?;
            let deadline = Instant::now() + timeout;
            loop {
                match listener.accept() {
                    Ok((stream, from)) => {
                        debug!(qp = self.local.qp_num, %from, "Peer queue pair connected");
                        stream.set_nonblocking(false)?;
                        break Ok(stream);
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        if Instant::now() >= deadline {
                            break Err(DeviceError::Link(format!(
                                "peer did not connect within {timeout:?}"
                            )));
                        }
                        std::thread::sleep(ACCEPT_POLL);
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => break Err(DeviceError::Link(format!("accept: {e}"))),
                }
            }
        }
    }

    fn greet(&self, stream: &mut TcpStream, remote: &QpEndpoint) -> Result<(), DeviceError> {
        let timeout = Some(self.config.link_timeout);
        stream.set_nodelay(true)?;
        stream.set_read_timeout(timeout)?;
        stream.set_write_timeout(timeout)?;

        write_frame(stream, &FrameHeader::hello(self.local.qp_num, remote.qp_num), &[])
            .map_err(|e| DeviceError::Link(format!("hello: {e}")))?;
        let hello = read_header(stream).map_err(|e| DeviceError::Link(format!("hello: {e}")))?;

        if hello.opcode != OP_HELLO {
            return Err(DeviceError::Peer(format!("expected HELLO, got opcode {}", hello.opcode)));
        }
        if hello.seq.get() != u64::from(remote.qp_num) || hello.imm.get() != self.local.qp_num {
            return Err(DeviceError::Peer(format!(
                "HELLO names {}→{}, expected {}→{}",
                hello.seq.get(),
                hello.imm.get(),
                remote.qp_num,
                self.local.qp_num
            )));
        }
        Ok(())
    }

    fn send(&self, header: &FrameHeader, payload: &[u8]) -> io::Result<()> {
        let writer = self
            .writer
            .as_ref()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "no data path"))?;
        write_frame(&mut *writer.lock(), header, payload)
    }

    /// Refuse new work once everything in flight could not fit in the CQ.
    fn check_capacity(&self) -> Result<(), DeviceError> {
        let work = self.shared.work.lock();
        let in_flight = work.outstanding.len() + work.recv_queue.len() + self.cq.len();
        if in_flight >= self.cq.depth() {
            debug!(qp = self.local.qp_num, in_flight, "Completion queue full; post refused");
            return Err(DeviceError::Exhausted("completion queue"));
        }
        Ok(())
    }

    fn fail_send(&self, seq: u64, err: io::Error) {
        let lost = self.shared.work.lock().outstanding.remove(&seq);
        if let Some(op) = lost {
            self.cq.push(self.shared.completion(op.wr_id, op.opcode, WcStatus::LinkError, 0));
        }
        self.shared.fail(&self.cq, &err.to_string());
        if let Some(writer) = &self.writer {
            let _ = writer.lock().shutdown(Shutdown::Both);
        }
    }
}

impl QueuePair for SoftQueuePair {
    fn qp_num(&self) -> u32 {
        self.local.qp_num
    }

    fn state(&self) -> QpState {
        *self.shared.state.lock()
    }

    fn local_endpoint(&self) -> QpEndpoint {
        self.local
    }

    fn modify_to_init(&mut self, access: AccessFlags) -> Result<(), DeviceError> {
        self.expect_state(&[QpState::Reset], "RESET")?;
        self.access = access;
        self.set_state(QpState::Init);
        trace!(qp = self.local.qp_num, "RESET -> INIT");
        Ok(())
    }

    fn modify_to_rtr(&mut self, remote: &QpEndpoint, peer_ip: IpAddr) -> Result<(), DeviceError> {
        self.expect_state(&[QpState::Init], "INIT")?;

        let result = self
            .establish_link(remote, peer_ip)
            .and_then(|mut stream| self.greet(&mut stream, remote).map(|()| stream));
        self.link_listener = None;

        match result {
            Ok(stream) => {
                self.link = Some(stream);
                self.set_state(QpState::Rtr);
                trace!(qp = self.local.qp_num, remote_qp = remote.qp_num, "INIT -> RTR");
                Ok(())
            }
            Err(e) => {
                self.set_state(QpState::Error);
                Err(e)
            }
        }
    }

    fn modify_to_rts(&mut self) -> Result<(), DeviceError> {
        self.expect_state(&[QpState::Rtr], "RTR")?;
        let link = self
            .link
            .take()
            .ok_or(DeviceError::Link("no link established".to_string()))?;
        link.set_read_timeout(None)?;
        let writer = Arc::new(Mutex::new(link.try_clone()?));

        let receiver = Receiver {
            stream: link,
            shared: Arc::clone(&self.shared),
            writer: Arc::clone(&writer),
            registrations: Arc::clone(&self.registrations),
            cq: Arc::clone(&self.cq),
        };
        let handle = std::thread::Builder::new()
            .name(format!("rdma-qp-{:06x}", self.local.qp_num))
            .spawn(move || receiver.run())?;

        self.writer = Some(writer);
        self.receiver = Some(handle);
        self.set_state(QpState::Rts);
        info!(qp = self.local.qp_num, "Queue pair ready to send");
        Ok(())
    }

    fn attach_stream(&mut self, stream: TcpStream) -> Result<(), DeviceError> {
        self.expect_state(&[QpState::Reset, QpState::Init], "RESET or INIT")?;
        self.attached = Some(stream);
        Ok(())
    }

    fn post_send(&mut self, wr: SendRequest) -> Result<(), DeviceError> {
        self.expect_state(&[QpState::Rts], "RTS")?;
        self.check_capacity()?;

        let reg = self
            .registrations
            .by_lkey(wr.lkey)
            .ok_or(DeviceError::InvalidKey { key: wr.lkey })?;
        let offset = reg
            .offset_of(wr.local_addr, u64::from(wr.len))
            .ok_or(DeviceError::LocalRange {
                addr: wr.local_addr,
                len: wr.len,
            })?;

        let seq = self.next_seq;
        self.next_seq += 1;

        let (header, payload, outstanding) = match wr.opcode {
            SendOpcode::Write | SendOpcode::WriteWithImm { .. } => {
                let (imm, opcode) = match wr.opcode {
                    SendOpcode::WriteWithImm { imm } => (Some(imm), WcOpcode::WriteWithImm),
                    _ => (None, WcOpcode::Write),
                };
                let payload = reg
                    .region
                    .read_at(offset, wr.len as usize)
                    .map_err(|_| DeviceError::LocalRange {
                        addr: wr.local_addr,
                        len: wr.len,
                    })?;
                (
                    FrameHeader::write(seq, wr.remote_addr, wr.rkey, wr.len, imm),
                    payload,
                    Outstanding {
                        wr_id: wr.wr_id,
                        opcode,
                        len: wr.len,
                        sink: None,
                    },
                )
            }
            SendOpcode::Read => (
                FrameHeader::read_request(seq, wr.remote_addr, wr.rkey, wr.len),
                Vec::new(),
                Outstanding {
                    wr_id: wr.wr_id,
                    opcode: WcOpcode::Read,
                    len: wr.len,
                    sink: Some((Arc::clone(&reg.region), offset)),
                },
            ),
        };

        self.shared.work.lock().outstanding.insert(seq, outstanding);
        trace!(qp = self.local.qp_num, seq, wr_id = wr.wr_id, opcode = ?wr.opcode, len = wr.len, "Posted send");

        if let Err(e) = self.send(&header, &payload) {
            self.fail_send(seq, e);
        }
        Ok(())
    }

    fn post_recv(&mut self, wr_id: u64) -> Result<(), DeviceError> {
        self.expect_state(&[QpState::Init, QpState::Rtr, QpState::Rts], "INIT, RTR or RTS")?;
        self.check_capacity()?;

        let matched = {
            let mut work = self.shared.work.lock();
            match work.pending_imm.pop_front() {
                Some(pending) => Some(pending),
                None => {
                    work.recv_queue.push_back(wr_id);
                    None
                }
            }
        };

        if let Some(pending) = matched {
            let mut wc = self
                .shared
                .completion(wr_id, WcOpcode::RecvWithImm, WcStatus::Success, pending.byte_len);
            wc.imm_data = Some(pending.imm);
            self.cq.push(wc);
            if let Err(e) = self.send(&FrameHeader::ack(pending.seq, WcStatus::Success.code()), &[]) {
                self.shared.fail(&self.cq, &e.to_string());
            }
        }
        Ok(())
    }

    fn destroy(&mut self) -> Result<(), DeviceError> {
        if self.destroyed {
            return Ok(());
        }
        self.destroyed = true;
        self.shared.closing.store(true, Ordering::Release);

        if let Some(writer) = self.writer.take() {
            let _ = writer.lock().shutdown(Shutdown::Both);
        }
        if let Some(stream) = self.link.take().or_else(|| self.attached.take()) {
            let _ = stream.shutdown(Shutdown::Both);
        }
        self.link_listener = None;

        if let Some(handle) = self.receiver.take() {
            if handle.join().is_err() {
                warn!(qp = self.local.qp_num, "Receive thread panicked");
            }
        }

        self.set_state(QpState::Error);
        self.qp_count.fetch_sub(1, Ordering::AcqRel);
        debug!(qp = self.local.qp_num, "Queue pair destroyed");
        Ok(())
    }
}

impl Drop for SoftQueuePair {
    fn drop(&mut self) {
        let _ = self.destroy();
    }
}

// ─── Receive path ───────────────────────────────────────────────────

struct Receiver {
    stream: TcpStream,
    shared: Arc<QpShared>,
    writer: Arc<Mutex<TcpStream>>,
    registrations: Arc<RegistrationTable>,
    cq: Arc<CompletionQueue>,
}

impl Receiver {
    fn run(mut self) {
        loop {
            if let Err(e) = self.step() {
                if self.shared.closing.load(Ordering::Acquire) {
                    trace!(qp = self.shared.qp_num, "Receive thread stopping");
                } else {
                    self.shared.fail(&self.cq, &e.to_string());
                    let _ = self.stream.shutdown(Shutdown::Both);
                }
                return;
            }
        }
    }

    fn step(&mut self) -> io::Result<()> {
        let header = read_header(&mut self.stream)?;
        match header.opcode {
            OP_WRITE | OP_WRITE_IMM => self.on_write(&header),
            OP_READ_REQ => self.on_read_request(&header),
            OP_READ_RESP => self.on_read_response(&header),
            OP_ACK => {
                self.on_ack(&header);
                Ok(())
            }
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("unexpected opcode {other}"),
            )),
        }
    }

    fn read_payload(&mut self, len: u32) -> io::Result<Vec<u8>> {
        let mut payload = vec![0u8; len as usize];
        self.stream.read_exact(&mut payload)?;
        Ok(payload)
    }

    /// Consume a payload that will not be applied.
    fn discard(&mut self, len: u32) -> io::Result<()> {
        let mut rest = (&self.stream).take(u64::from(len));
        let skipped = io::copy(&mut rest, &mut io::sink())?;
        if skipped != u64::from(len) {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "payload truncated"));
        }
        Ok(())
    }

    fn send(&self, header: &FrameHeader, payload: &[u8]) -> io::Result<()> {
        write_frame(&mut *self.writer.lock(), header, payload)
    }

    fn on_write(&mut self, header: &FrameHeader) -> io::Result<()> {
        let seq = header.seq.get();
        let len = header.len.get();

        // The key and range bound the payload size before anything is buffered.
        let status = match self.registrations.remote_access(
            header.rkey.get(),
            header.addr.get(),
            len,
            AccessFlags::REMOTE_WRITE,
        ) {
            Ok((region, offset)) => {
                let payload = self.read_payload(len)?;
                match region.write_at(offset, &payload) {
                    Ok(()) => WcStatus::Success,
                    Err(_) => WcStatus::RemoteAccessError,
                }
            }
            Err(status) => {
                self.discard(len)?;
                status
            }
        };

        trace!(qp = self.shared.qp_num, seq, len, ?status, "Remote write applied");

        if header.opcode == OP_WRITE || !status.is_success() {
            return self.send(&FrameHeader::ack(seq, status.code()), &[]);
        }

        let imm = header.imm.get();
        let consumed = {
            let mut work = self.shared.work.lock();
            match work.recv_queue.pop_front() {
                Some(wr_id) => {
                    let mut wc = self
                        .shared
                        .completion(wr_id, WcOpcode::RecvWithImm, WcStatus::Success, len);
                    wc.imm_data = Some(imm);
                    self.cq.push(wc);
                    true
                }
                None => {
                    work.pending_imm.push_back(PendingImm {
                        seq,
                        imm,
                        byte_len: len,
                    });
                    false
                }
            }
        };

        if consumed {
            self.send(&FrameHeader::ack(seq, WcStatus::Success.code()), &[])
        } else {
            debug!(qp = self.shared.qp_num, seq, "No receive posted; holding acknowledgement");
            Ok(())
        }
    }

    fn on_read_request(&mut self, header: &FrameHeader) -> io::Result<()> {
        let seq = header.seq.get();
        let len = header.len.get();
        let data = self
            .registrations
            .remote_access(header.rkey.get(), header.addr.get(), len, AccessFlags::REMOTE_READ)
            .and_then(|(region, offset)| {
                region
                    .read_at(offset, len as usize)
                    .map_err(|_| WcStatus::RemoteAccessError)
            });

        match data {
            Ok(bytes) => self.send(&FrameHeader::read_response(seq, WcStatus::Success.code(), len), &bytes),
            Err(status) => self.send(&FrameHeader::read_response(seq, status.code(), 0), &[]),
        }
    }

    fn on_read_response(&mut self, header: &FrameHeader) -> io::Result<()> {
        let seq = header.seq.get();
        let status = WcStatus::from_code(header.status);
        let len = header.len.get();

        // Only a response matching a posted read of the same length is buffered.
        let expected = self.shared.work.lock().outstanding.get(&seq).map(|op| op.len);
        let payload = match (status, expected) {
            (WcStatus::Success, Some(want)) if want == len => Some(self.read_payload(len)?),
            (WcStatus::Success, _) => {
                self.discard(len)?;
                None
            }
            _ => None,
        };

        let mut work = self.shared.work.lock();
        let Some(op) = work.outstanding.remove(&seq) else {
            warn!(qp = self.shared.qp_num, seq, "Read response for unknown request");
            return Ok(());
        };

        let status = match (&op.sink, status, payload) {
            (Some((region, offset)), WcStatus::Success, Some(payload)) => {
                match region.write_at(*offset, &payload) {
                    Ok(()) => WcStatus::Success,
                    Err(_) => WcStatus::LocalProtectionError,
                }
            }
            (_, WcStatus::Success, _) => WcStatus::LocalProtectionError,
            (_, other, _) => other,
        };
        let byte_len = if status.is_success() { op.len } else { 0 };
        self.cq
            .push(self.shared.completion(op.wr_id, op.opcode, status, byte_len));
        Ok(())
    }

    fn on_ack(&mut self, header: &FrameHeader) {
        let seq = header.seq.get();
        let status = WcStatus::from_code(header.status);
        let mut work = self.shared.work.lock();
        match work.outstanding.remove(&seq) {
            Some(op) => {
                let byte_len = if status.is_success() { op.len } else { 0 };
                self.cq
                    .push(self.shared.completion(op.wr_id, op.opcode, status, byte_len));
            }
            None => warn!(qp = self.shared.qp_num, seq, "Acknowledgement for unknown request"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    const TIMEOUT: Duration = Duration::from_secs(5);

    struct Side {
        device: SoftDevice,
        region: Arc<SharedRegion>,
        reg: MemoryRegistration,
        cq: Arc<CompletionQueue>,
        qp: Box<dyn QueuePair>,
    }

    fn side(name: &str) -> Side {
        side_with_depth(name, 64)
    }

    fn side_with_depth(name: &str, depth: usize) -> Side {
        let device = SoftDevice::new();
        let region = Arc::new(SharedRegion::create(name, 4096).unwrap());
        let reg = device
            .register_region(&region, AccessFlags::connection_default())
            .unwrap();
        let cq = device.create_completion_queue(depth).unwrap();
        let config = QueuePairConfig {
            port: 1,
            sgid_index: 0,
            link_timeout: TIMEOUT,
        };
        let qp = device.create_queue_pair(config, Arc::clone(&cq)).unwrap();
        Side {
            device,
            region,
            reg,
            cq,
            qp,
        }
    }

    /// Bring two queue pairs to RTS against each other.
    fn connect_pair(a: &mut Side, b: &mut Side) {
        let a_ep = a.qp.local_endpoint();
        let b_ep = b.qp.local_endpoint();
        a.qp.modify_to_init(AccessFlags::connection_default()).unwrap();
        b.qp.modify_to_init(AccessFlags::connection_default()).unwrap();

        let loopback = IpAddr::V4(Ipv4Addr::LOCALHOST);
        thread::scope(|s| {
            let handle = s.spawn(|| b.qp.modify_to_rtr(&a_ep, loopback));
            a.qp.modify_to_rtr(&b_ep, loopback).unwrap();
            handle.join().unwrap().unwrap();
        });

        a.qp.modify_to_rts().unwrap();
        b.qp.modify_to_rts().unwrap();
    }

    fn wait_for(cq: &CompletionQueue, count: usize) -> Vec<WorkCompletion> {
        let deadline = Instant::now() + TIMEOUT;
        let mut out = Vec::new();
        while out.len() < count && Instant::now() < deadline {
            out.extend(cq.drain());
            thread::sleep(Duration::from_millis(1));
        }
        out
    }

    fn write_request(from: &Side, to: &Side, wr_id: u64, opcode: SendOpcode, len: u32) -> SendRequest {
        SendRequest {
            wr_id,
            opcode,
            local_addr: from.reg.addr,
            lkey: from.reg.lkey,
            len,
            remote_addr: to.reg.addr,
            rkey: to.reg.rkey,
        }
    }

    #[test]
    fn gid_table_and_ports() {
        let device = SoftDevice::new();
        assert!(device.query_gid(1, 0).unwrap().to_ipv4().is_none());
        assert_eq!(device.query_gid(1, 1).unwrap().to_ipv4(), Some(Ipv4Addr::LOCALHOST));
        assert!(matches!(device.query_gid(2, 0), Err(DeviceError::InvalidPort { .. })));
        assert!(matches!(device.query_gid(1, 9), Err(DeviceError::InvalidGidIndex { .. })));
    }

    #[test]
    fn deregister_twice_is_invalid_key() {
        let device = SoftDevice::new();
        let region = Arc::new(SharedRegion::create("soft-dereg", 64).unwrap());
        let reg = device.register_region(&region, AccessFlags::connection_default()).unwrap();
        assert_ne!(reg.lkey, reg.rkey);
        assert_eq!(device.registration_count(), 1);
        device.deregister_region(reg.lkey).unwrap();
        assert_eq!(device.registration_count(), 0);
        assert!(matches!(
            device.deregister_region(reg.lkey),
            Err(DeviceError::InvalidKey { .. })
        ));
    }

    #[test]
    fn qp_transitions_in_order_only() {
        let mut a = side("soft-order");
        let remote = a.qp.local_endpoint();
        assert!(a.qp.modify_to_rts().is_err());
        assert!(a.qp.post_recv(1).is_err(), "receives need INIT");
        assert!(
            a.qp.modify_to_rtr(&remote, IpAddr::V4(Ipv4Addr::LOCALHOST)).is_err(),
            "RTR needs INIT"
        );
        a.qp.modify_to_init(AccessFlags::connection_default()).unwrap();
        assert_eq!(a.qp.state(), QpState::Init);
        a.qp.post_recv(1).unwrap();
    }

    #[test]
    fn write_with_imm_consumes_receive() {
        let mut a = side("soft-wimm-a");
        let mut b = side("soft-wimm-b");
        connect_pair(&mut a, &mut b);

        a.region.fill(0, 4096, 0x5A).unwrap();
        b.qp.post_recv(77).unwrap();
        a.qp
            .post_send(write_request(&a, &b, 1, SendOpcode::WriteWithImm { imm: 0xBEEF }, 4096))
            .unwrap();

        let at_b = wait_for(&b.cq, 1);
        assert_eq!(at_b.len(), 1);
        assert_eq!(at_b[0].wr_id, 77);
        assert_eq!(at_b[0].opcode, WcOpcode::RecvWithImm);
        assert_eq!(at_b[0].imm_data, Some(0xBEEF));
        assert_eq!(at_b[0].byte_len, 4096);
        assert_eq!(b.region.read_at(0, 4096).unwrap(), vec![0x5A; 4096]);

        let at_a = wait_for(&a.cq, 1);
        assert_eq!(at_a[0].wr_id, 1);
        assert_eq!(at_a[0].opcode, WcOpcode::WriteWithImm);
        assert!(at_a[0].status.is_success());
    }

    #[test]
    fn imm_before_receive_is_held() {
        let mut a = side("soft-hold-a");
        let mut b = side("soft-hold-b");
        connect_pair(&mut a, &mut b);

        a.qp
            .post_send(write_request(&a, &b, 5, SendOpcode::WriteWithImm { imm: 1 }, 16))
            .unwrap();
        thread::sleep(Duration::from_millis(50));
        assert!(a.cq.is_empty(), "sender completes only once a receive is consumed");
        assert!(b.cq.is_empty());

        b.qp.post_recv(9).unwrap();
        assert_eq!(wait_for(&b.cq, 1)[0].wr_id, 9);
        assert_eq!(wait_for(&a.cq, 1)[0].wr_id, 5);
    }

    #[test]
    fn read_fetches_peer_bytes() {
        let mut a = side("soft-read-a");
        let mut b = side("soft-read-b");
        connect_pair(&mut a, &mut b);

        b.region.write_at(128, b"remote bytes").unwrap();
        let mut wr = write_request(&a, &b, 3, SendOpcode::Read, 12);
        wr.remote_addr = b.reg.addr + 128;
        a.qp.post_send(wr).unwrap();

        let done = wait_for(&a.cq, 1);
        assert_eq!(done[0].opcode, WcOpcode::Read);
        assert!(done[0].status.is_success());
        assert_eq!(a.region.read_at(0, 12).unwrap(), b"remote bytes");
    }

    #[test]
    fn bad_rkey_reports_remote_access_error() {
        let mut a = side("soft-rkey-a");
        let mut b = side("soft-rkey-b");
        connect_pair(&mut a, &mut b);

        let mut wr = write_request(&a, &b, 4, SendOpcode::Write, 8);
        wr.rkey ^= 0xFFFF_0000;
        a.qp.post_send(wr).unwrap();

        let done = wait_for(&a.cq, 1);
        assert_eq!(done[0].status, WcStatus::RemoteAccessError);
        assert!(b.cq.is_empty());
    }

    #[test]
    fn rejected_write_payload_is_skipped() {
        let mut a = side("soft-skip-a");
        let mut b = side("soft-skip-b");
        connect_pair(&mut a, &mut b);

        let mut bad = write_request(&a, &b, 1, SendOpcode::Write, 4096);
        bad.rkey ^= 0xFFFF_0000;
        a.qp.post_send(bad).unwrap();
        a.region.write_at(0, b"in sync").unwrap();
        a.qp.post_send(write_request(&a, &b, 2, SendOpcode::Write, 7)).unwrap();

        let done = wait_for(&a.cq, 2);
        assert_eq!(done.len(), 2);
        assert_eq!((done[0].wr_id, done[0].status), (1, WcStatus::RemoteAccessError));
        assert_eq!((done[1].wr_id, done[1].status), (2, WcStatus::Success));
        assert_eq!(b.region.read_at(0, 7).unwrap(), b"in sync");
        assert_eq!(b.qp.state(), QpState::Rts);
    }

    #[test]
    fn posts_beyond_cq_depth_are_exhausted() {
        let mut a = side_with_depth("soft-depth-a", 4);
        let mut b = side("soft-depth-b");
        connect_pair(&mut a, &mut b);

        for wr_id in 0..4 {
            a.qp.post_send(write_request(&a, &b, wr_id, SendOpcode::Write, 8)).unwrap();
        }
        assert!(matches!(
            a.qp.post_send(write_request(&a, &b, 4, SendOpcode::Write, 8)),
            Err(DeviceError::Exhausted(_))
        ));
        assert!(matches!(a.qp.post_recv(5), Err(DeviceError::Exhausted(_))));

        let done = wait_for(&a.cq, 4);
        let ids: Vec<_> = done.iter().map(|wc| wc.wr_id).collect();
        assert_eq!(ids, vec![0, 1, 2, 3]);
        assert!(done.iter().all(|wc| wc.status.is_success()));
        assert_eq!(a.cq.overruns(), 0);
        assert!(!a.cq.take_fault());

        a.qp.post_send(write_request(&a, &b, 6, SendOpcode::Write, 8)).unwrap();
        assert_eq!(wait_for(&a.cq, 1)[0].wr_id, 6);
    }

    #[test]
    fn peer_destroy_flushes_posted_receives() {
        let mut a = side("soft-flush-a");
        let mut b = side("soft-flush-b");
        connect_pair(&mut a, &mut b);

        b.qp.post_recv(11).unwrap();
        a.qp.destroy().unwrap();

        let flushed = wait_for(&b.cq, 1);
        assert_eq!(flushed[0].wr_id, 11);
        assert_eq!(flushed[0].status, WcStatus::FlushError);
        assert_eq!(b.qp.state(), QpState::Error);
        assert!(a.cq.is_empty(), "destroyed queue pair reports nothing");
        assert!(b.qp.post_send(write_request(&b, &a, 1, SendOpcode::Write, 1)).is_err());
    }
}
