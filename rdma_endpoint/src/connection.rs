//! One point-to-point connection: its registration, completion queue and
//! queue pair, driven through [`ConnectionStateMachine`].

use crate::device::{
    CompletionQueue, Device, DeviceError, MemoryRegistration, QpState, QueuePair, QueuePairConfig,
    SendOpcode, SendRequest, WcOpcode, WcStatus, WorkCompletion,
};
use crate::error::{EndpointError, EndpointResult};
use crate::multiplexer::ConnectionId;
use crate::region::{AccessFlags, RemoteRegion, SharedRegion};
use crate::rendezvous::{Exchange, RendezvousRecord, TransportKind};
use crate::state::{
    ConnectionEvent, ConnectionRole, ConnectionState, ConnectionStateMachine, TransitionResult,
};
use std::net::{IpAddr, Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A connection owned by an endpoint.
pub struct Connection {
    id: ConnectionId,
    machine: ConnectionStateMachine,
    transport: TransportKind,
    device: Arc<dyn Device>,
    registration: Option<MemoryRegistration>,
    cq: Arc<CompletionQueue>,
    qp: Option<Box<dyn QueuePair>>,
    local: Option<RendezvousRecord>,
    remote: Option<RendezvousRecord>,
}

fn apply(
    machine: &mut ConnectionStateMachine,
    id: ConnectionId,
    event: ConnectionEvent,
    operation: &'static str,
) -> EndpointResult<ConnectionState> {
    match machine.handle_event(event) {
        TransitionResult::Ok(state) => {
            debug!(connection = %id, ?event, ?state, "Connection transition");
            Ok(state)
        }
        TransitionResult::Rejected(reason) => {
            debug!(connection = %id, ?event, reason, "Connection transition rejected");
            Err(EndpointError::InvalidState {
                operation,
                state: machine.state(),
            })
        }
    }
}

fn activation(err: DeviceError) -> EndpointError {
    EndpointError::Activation {
        reason: err.to_string(),
    }
}

impl Connection {
    /// Register `region`, create a completion queue and a queue pair.
    ///
    /// # Errors
    ///
    /// `EndpointError::Allocation` if the device refuses the registration,
    /// `EndpointError::Device` if the queue resources cannot be created.
    pub fn new(
        id: ConnectionId,
        role: ConnectionRole,
        transport: TransportKind,
        device: Arc<dyn Device>,
        region: &Arc<SharedRegion>,
        qp_config: QueuePairConfig,
        cq_depth: usize,
    ) -> EndpointResult<Self> {
        let registration = device
            .register_region(region, AccessFlags::connection_default())
            .map_err(|e| EndpointError::Allocation {
                size: region.len(),
                reason: e.to_string(),
            })?;

        let cq = match device.create_completion_queue(cq_depth) {
            Ok(cq) => cq,
            Err(e) => {
                let _ = device.deregister_region(registration.lkey);
                return Err(e.into());
            }
        };

        let mut conn = Self {
            id,
            machine: ConnectionStateMachine::new(role),
            transport,
            device,
            registration: Some(registration),
            cq: Arc::clone(&cq),
            qp: None,
            local: None,
            remote: None,
        };
        // On failure `conn` drops here and releases the registration.
        conn.qp = Some(conn.device.create_queue_pair(qp_config, cq)?);
        Ok(conn)
    }

    /// Endpoint-assigned identifier.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.machine.state()
    }

    /// Listener or connector.
    pub fn role(&self) -> ConnectionRole {
        self.machine.role()
    }

    /// Data path in use.
    pub fn transport(&self) -> TransportKind {
        self.transport
    }

    /// Local queue pair number, while the queue pair exists.
    pub fn qp_num(&self) -> Option<u32> {
        self.qp.as_ref().map(|qp| qp.qp_num())
    }

    /// This side's registration, until closed.
    pub fn registration(&self) -> Option<&MemoryRegistration> {
        self.registration.as_ref()
    }

    /// Record this side sent, once exchanged.
    pub fn local_record(&self) -> Option<&RendezvousRecord> {
        self.local.as_ref()
    }

    /// Record the peer sent, once exchanged.
    pub fn remote_record(&self) -> Option<&RendezvousRecord> {
        self.remote.as_ref()
    }

    /// Completion queue whose channel the multiplexer watches.
    pub fn completion_queue(&self) -> &Arc<CompletionQueue> {
        &self.cq
    }

    /// Start the role-specific handshake step.
    pub fn begin(&mut self) -> EndpointResult<ConnectionState> {
        let event = match self.role() {
            ConnectionRole::Listener => ConnectionEvent::Listen,
            ConnectionRole::Connector => ConnectionEvent::Connect,
        };
        apply(&mut self.machine, self.id, event, "begin handshake")
    }

    /// Record to send to the peer. The channel fills in the socket address.
    pub fn rendezvous_record(&self) -> EndpointResult<RendezvousRecord> {
        let (Some(qp), Some(reg)) = (self.qp.as_ref(), self.registration.as_ref()) else {
            return Err(EndpointError::AlreadyClosed { id: self.id.0 });
        };
        Ok(RendezvousRecord {
            transport: self.transport,
            queue_pair: qp.local_endpoint(),
            region: RemoteRegion {
                addr: reg.addr,
                len: reg.len as u64,
                rkey: reg.rkey,
            },
            addr: SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0),
        })
    }

    /// Consume a finished exchange and bring the queue pair to ready.
    ///
    /// # Errors
    ///
    /// `EndpointError::Activation` if the device rejects a transition; the
    /// connection is then in `Error`.
    pub fn activate(&mut self, exchange: Exchange) -> EndpointResult<()> {
        apply(&mut self.machine, self.id, ConnectionEvent::ParamsReceived, "exchange parameters")?;
        self.local = Some(exchange.local);
        self.remote = Some(exchange.remote);

        let result = self.bring_up(exchange);
        if let Err(e) = &result {
            warn!(connection = %self.id, error = %e, "Activation failed");
            self.fault();
        }
        result
    }

    fn bring_up(&mut self, exchange: Exchange) -> EndpointResult<()> {
        let remote = exchange.remote;
        let Some(qp) = self.qp.as_mut() else {
            return Err(EndpointError::AlreadyClosed { id: self.id.0 });
        };

        // A mapped GID names the peer interface; otherwise use the
        // address the rendezvous came from.
        let peer_ip = remote
            .queue_pair
            .gid
            .to_ipv4()
            .unwrap_or(*remote.addr.ip());

        qp.modify_to_init(AccessFlags::connection_default())
            .map_err(activation)?;
        if self.transport == TransportKind::Socket {
            qp.attach_stream(exchange.stream).map_err(activation)?;
        }
        apply(&mut self.machine, self.id, ConnectionEvent::QueuePairInitialized, "initialize queue pair")?;

        qp.modify_to_rtr(&remote.queue_pair, IpAddr::V4(peer_ip))
            .map_err(activation)?;
        qp.modify_to_rts().map_err(activation)?;
        apply(&mut self.machine, self.id, ConnectionEvent::QueuePairActivated, "activate queue pair")?;

        info!(
            connection = %self.id,
            role = ?self.machine.role(),
            transport = ?self.transport,
            local_qp = qp.qp_num(),
            remote_qp = remote.queue_pair.qp_num,
            %peer_ip,
            "Connection ready"
        );
        Ok(())
    }

    fn fault(&mut self) {
        let _ = self.machine.handle_event(ConnectionEvent::Fault);
    }

    fn check_postable(&self, operation: &'static str) -> EndpointResult<()> {
        match self.state() {
            ConnectionState::Error => Err(EndpointError::ConnectionFailed { id: self.id.0 }),
            ConnectionState::Closed => Err(EndpointError::AlreadyClosed { id: self.id.0 }),
            state if state.can_post() => Ok(()),
            state => Err(EndpointError::InvalidState { operation, state }),
        }
    }

    fn post(&mut self, opcode: SendOpcode, wr_id: u64, local_offset: usize, len: usize, remote_offset: usize) -> EndpointResult<()> {
        let operation = match opcode {
            SendOpcode::Read => "post_read",
            _ => "post_write",
        };
        self.check_postable(operation)?;

        let (Some(reg), Some(remote)) = (self.registration.as_ref(), self.remote.as_ref()) else {
            return Err(EndpointError::InvalidState {
                operation,
                state: self.state(),
            });
        };
        if !reg.region.contains(local_offset, len) {
            return Err(EndpointError::OutOfBounds {
                offset: local_offset,
                len,
                region_len: reg.len,
            });
        }
        let remote_addr = remote.region.address_of(remote_offset, len)?;
        let wire_len = u32::try_from(len).map_err(|_| EndpointError::OutOfBounds {
            offset: local_offset,
            len,
            region_len: reg.len,
        })?;

        let wr = SendRequest {
            wr_id,
            opcode,
            local_addr: reg.addr + local_offset as u64,
            lkey: reg.lkey,
            len: wire_len,
            remote_addr,
            rkey: remote.region.rkey,
        };

        let Some(qp) = self.qp.as_mut() else {
            return Err(EndpointError::AlreadyClosed { id: self.id.0 });
        };
        match qp.post_send(wr) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.post_failed(e)),
        }
    }

    fn post_failed(&mut self, err: DeviceError) -> EndpointError {
        let qp_failed = self
            .qp
            .as_ref()
            .is_some_and(|qp| qp.state() == QpState::Error);
        if qp_failed {
            self.fault();
            EndpointError::ConnectionFailed { id: self.id.0 }
        } else {
            err.into()
        }
    }

    /// Write `len` bytes at `local_offset` to the peer's region at
    /// `remote_offset`. With `imm`, the peer consumes a posted receive.
    pub fn post_write(
        &mut self,
        wr_id: u64,
        local_offset: usize,
        len: usize,
        remote_offset: usize,
        imm: Option<u32>,
    ) -> EndpointResult<()> {
        let opcode = match imm {
            Some(imm) => SendOpcode::WriteWithImm { imm },
            None => SendOpcode::Write,
        };
        self.post(opcode, wr_id, local_offset, len, remote_offset)
    }

    /// Read `len` bytes from the peer's region at `remote_offset` into the
    /// local region at `local_offset`.
    pub fn post_read(&mut self, wr_id: u64, local_offset: usize, len: usize, remote_offset: usize) -> EndpointResult<()> {
        self.post(SendOpcode::Read, wr_id, local_offset, len, remote_offset)
    }

    /// Post a receive for a peer's write with immediate.
    pub fn post_recv(&mut self, wr_id: u64) -> EndpointResult<()> {
        self.check_postable("post_recv")?;
        let Some(qp) = self.qp.as_mut() else {
            return Err(EndpointError::AlreadyClosed { id: self.id.0 });
        };
        match qp.post_recv(wr_id) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.post_failed(e)),
        }
    }

    /// Drain the completion queue and advance the state accordingly.
    ///
    /// The first success moves a ready connection to `Active`; any failed
    /// completion moves it to `Error`. Completions the queue could not hold
    /// are reported as one trailing `LinkError`.
    pub fn drain_completions(&mut self) -> Vec<WorkCompletion> {
        let mut completions = self.cq.drain();
        if self.cq.take_fault() {
            warn!(connection = %self.id, overruns = self.cq.overruns(), "Completions lost");
            completions.push(WorkCompletion {
                wr_id: 0,
                opcode: WcOpcode::Recv,
                status: WcStatus::LinkError,
                byte_len: 0,
                imm_data: None,
                qp_num: self.qp_num().unwrap_or(0),
            });
        }
        for wc in &completions {
            if wc.status.is_success() {
                if self.state() == ConnectionState::QueuePairReady {
                    let _ = apply(&mut self.machine, self.id, ConnectionEvent::FirstCompletion, "complete");
                    info!(connection = %self.id, "Connection active");
                }
            } else if !self.state().is_terminal() {
                warn!(connection = %self.id, wr_id = wc.wr_id, status = ?wc.status, "Connection failed");
                self.fault();
            }
        }
        completions
    }

    /// Release the queue pair and the registration.
    ///
    /// # Errors
    ///
    /// `EndpointError::AlreadyClosed` on a second call.
    pub fn close(&mut self) -> EndpointResult<()> {
        if self.state() == ConnectionState::Closed {
            return Err(EndpointError::AlreadyClosed { id: self.id.0 });
        }
        self.release();
        apply(&mut self.machine, self.id, ConnectionEvent::Close, "close")?;
        info!(connection = %self.id, "Connection closed");
        Ok(())
    }

    fn release(&mut self) {
        // Queue pair first so no completion references freed keys.
        if let Some(mut qp) = self.qp.take() {
            if let Err(e) = qp.destroy() {
                warn!(connection = %self.id, error = %e, "Queue pair destroy failed");
            }
        }
        if let Some(reg) = self.registration.take() {
            if let Err(e) = self.device.deregister_region(reg.lkey) {
                warn!(connection = %self.id, error = %e, "Deregistration failed");
            }
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("role", &self.role())
            .field("transport", &self.transport)
            .field("qp_num", &self.qp_num())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::soft::SoftDevice;
    use std::time::Duration;

    fn qp_config() -> QueuePairConfig {
        QueuePairConfig {
            port: 1,
            sgid_index: 0,
            link_timeout: Duration::from_secs(1),
        }
    }

    fn fixture(role: ConnectionRole) -> (Arc<dyn Device>, Arc<SharedRegion>, Connection) {
        let device: Arc<dyn Device> = Arc::new(SoftDevice::new());
        let region = Arc::new(SharedRegion::create("conn-unit", 4096).unwrap());
        let conn = Connection::new(
            ConnectionId(1),
            role,
            TransportKind::Rdma,
            Arc::clone(&device),
            &region,
            qp_config(),
            16,
        )
        .unwrap();
        (device, region, conn)
    }

    #[test]
    fn new_registers_region() {
        let (device, region, conn) = fixture(ConnectionRole::Connector);
        assert_eq!(device.registration_count(), 1);
        assert_eq!(conn.state(), ConnectionState::Created);
        let record = conn.rendezvous_record().unwrap();
        assert_eq!(record.region.addr, region.addr());
        assert_eq!(record.region.len, 4096);
        assert_eq!(record.transport, TransportKind::Rdma);
    }

    #[test]
    fn posting_before_ready_is_invalid_state() {
        let (_device, _region, mut conn) = fixture(ConnectionRole::Listener);
        conn.begin().unwrap();
        assert!(matches!(
            conn.post_write(1, 0, 8, 0, None),
            Err(EndpointError::InvalidState { state: ConnectionState::Listening, .. })
        ));
        assert!(matches!(
            conn.post_recv(1),
            Err(EndpointError::InvalidState { .. })
        ));
    }

    #[test]
    fn close_releases_once() {
        let (device, _region, mut conn) = fixture(ConnectionRole::Connector);
        conn.close().unwrap();
        assert_eq!(device.registration_count(), 0);
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(matches!(conn.close(), Err(EndpointError::AlreadyClosed { id: 1 })));
        assert!(matches!(
            conn.post_recv(1),
            Err(EndpointError::AlreadyClosed { .. })
        ));
    }

    #[test]
    fn drop_releases_registration() {
        let (device, _region, conn) = fixture(ConnectionRole::Connector);
        drop(conn);
        assert_eq!(device.registration_count(), 0);
    }

    #[test]
    fn lost_completions_fail_the_connection() {
        let (_device, _region, mut conn) = fixture(ConnectionRole::Connector);
        let qp_num = conn.qp_num().unwrap();
        let ok = WorkCompletion {
            wr_id: 7,
            opcode: WcOpcode::Write,
            status: WcStatus::Success,
            byte_len: 8,
            imm_data: None,
            qp_num,
        };
        for _ in 0..=conn.completion_queue().depth() {
            conn.completion_queue().push(ok);
        }

        let drained = conn.drain_completions();
        assert_eq!(drained.len(), 17);
        let last = drained.last().unwrap();
        assert_eq!(last.status, WcStatus::LinkError);
        assert_eq!(last.qp_num, qp_num);
        assert_eq!(conn.state(), ConnectionState::Error);

        assert!(conn.drain_completions().is_empty(), "the loss is reported once");
    }
}
