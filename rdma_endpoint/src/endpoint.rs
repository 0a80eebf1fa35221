//! Endpoint façade: one region, one device, one multiplexer, and the table
//! of listeners and connections built on them.
//!
//! ```text
//!   bind ──► listener ──(IncomingConnection)──► accept ──┐
//!                                                        ├──► Connection ──► poll_events
//!   connect ─────────────────────────────────────────────┘
//! ```

use crate::connection::Connection;
use crate::device::soft::SoftDevice;
use crate::device::{Device, DeviceRegistry, QueuePairConfig, WorkCompletion};
use crate::error::{EndpointError, EndpointResult};
use crate::multiplexer::{ConnectionId, ListenerId, Multiplexer, Source};
use crate::region::{self, SharedRegion};
use crate::rendezvous::{self, FileSync, ListenInfo, RendezvousListener, RendezvousSync, TransportKind};
use crate::state::{ConnectionRole, ConnectionState};
use rdma_common::config::EndpointConfig;
use rdma_common::consts::DEFAULT_IB_PORT;
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Something the caller's loop should act on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// A peer is waiting on a listener; call [`Endpoint::accept`].
    IncomingConnection {
        /// Listener with a pending peer.
        listener: ListenerId,
    },
    /// An operation finished successfully.
    Completion {
        /// Owning connection.
        connection: ConnectionId,
        /// The completion.
        completion: WorkCompletion,
    },
    /// An operation failed; the connection is now in `Error`.
    ConnectionError {
        /// Failed connection.
        connection: ConnectionId,
        /// The failed completion.
        completion: WorkCompletion,
    },
}

impl Event {
    /// Connection the event belongs to, if any.
    pub fn connection(&self) -> Option<ConnectionId> {
        match self {
            Event::IncomingConnection { .. } => None,
            Event::Completion { connection, .. } | Event::ConnectionError { connection, .. } => {
                Some(*connection)
            }
        }
    }
}

/// Transport endpoint of one process.
pub struct Endpoint {
    config: EndpointConfig,
    device: Arc<dyn Device>,
    // Carries socket-transport connections when `device` cannot.
    fallback: Option<Arc<dyn Device>>,
    region: Arc<SharedRegion>,
    mux: Multiplexer,
    sync: Box<dyn RendezvousSync>,
    listeners: HashMap<ListenerId, RendezvousListener>,
    connections: BTreeMap<ConnectionId, Connection>,
    next_listener: u64,
    next_connection: u64,
}

impl Endpoint {
    /// Endpoint on the built-in devices, publishing through the configured
    /// listen info and ready files.
    pub fn new(config: EndpointConfig) -> EndpointResult<Self> {
        let sync = FileSync::new(
            config.rdma.listen_info_file_path.clone(),
            config.rdma.listen_ready_file_path.clone(),
        );
        Self::with_sync(config, &DeviceRegistry::with_builtin(), Box::new(sync))
    }

    /// Endpoint with an explicit device registry and readiness sync.
    ///
    /// # Errors
    ///
    /// `Config` on invalid settings, `Device` if the device, port or GID
    /// index cannot be found, `Allocation` if the region cannot be reserved,
    /// `Multiplexer` if the epoll set cannot be created.
    pub fn with_sync(
        config: EndpointConfig,
        registry: &DeviceRegistry,
        sync: Box<dyn RendezvousSync>,
    ) -> EndpointResult<Self> {
        config.validate()?;
        let rdma = &config.rdma;

        let device = registry.open(&rdma.device)?;
        let gid = device.query_gid(rdma.port, rdma.sgid_index)?;
        let region = region::allocate(&*device, &config.shared.service_name, rdma.shm_size)?;
        let mux = Multiplexer::new()?;
        let fallback = (!device.attaches_streams()).then(|| {
            debug!(device = device.name(), "Socket transport served by the software device");
            Arc::new(SoftDevice::new()) as Arc<dyn Device>
        });

        info!(
            service = %config.shared.service_name,
            device = device.name(),
            port = rdma.port,
            %gid,
            shm_size = rdma.shm_size,
            transport = ?TransportKind::from_config(rdma.connect_using_rdma),
            "Endpoint initialized"
        );

        Ok(Self {
            config,
            device,
            fallback,
            region,
            mux,
            sync,
            listeners: HashMap::new(),
            connections: BTreeMap::new(),
            next_listener: 1,
            next_connection: 1,
        })
    }

    /// Configuration the endpoint was built with.
    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    /// Device serving the endpoint.
    pub fn device(&self) -> &Arc<dyn Device> {
        &self.device
    }

    /// Software device carrying socket-transport connections, when the
    /// configured device cannot attach a stream.
    pub fn fallback_device(&self) -> Option<&Arc<dyn Device>> {
        self.fallback.as_ref()
    }

    /// Shared region used by every connection.
    pub fn region(&self) -> &Arc<SharedRegion> {
        &self.region
    }

    /// Bind a rendezvous listener, register it for events, and publish it.
    ///
    /// # Errors
    ///
    /// `EndpointError::Bind` if the address is in use.
    pub fn bind(&mut self, addr: SocketAddr) -> EndpointResult<ListenerId> {
        let socket = RendezvousListener::bind(addr)?;
        let id = ListenerId(self.next_listener);
        self.next_listener += 1;

        self.mux.register(&socket, Source::Listener(id))?;
        let info = ListenInfo {
            addr: socket.local_addr(),
        };
        if let Err(e) = self.sync.publish(&info) {
            let _ = self.mux.deregister(&socket, Source::Listener(id));
            return Err(e);
        }

        self.listeners.insert(id, socket);
        info!(listener = %id, addr = %info.addr, "Listening");
        Ok(id)
    }

    /// Bound address of a listener.
    pub fn listener_addr(&self, id: ListenerId) -> Option<SocketAddr> {
        self.listeners.get(&id).map(RendezvousListener::local_addr)
    }

    /// Accept the one peer of `listener` and bring the connection up.
    ///
    /// The listener is consumed whether or not the handshake succeeds. The
    /// publication is withdrawn once no listener remains bound.
    pub fn accept(&mut self, listener: ListenerId) -> EndpointResult<ConnectionId> {
        let socket = self
            .listeners
            .remove(&listener)
            .ok_or(EndpointError::UnknownListener { id: listener.0 })?;
        self.mux.deregister(&socket, Source::Listener(listener))?;

        let result = self.accept_on(&socket);
        if self.listeners.is_empty() {
            if let Err(e) = self.sync.withdraw() {
                warn!(listener = %listener, error = %e, "Failed to withdraw listener publication");
            }
        }
        if let Err(e) = &result {
            warn!(listener = %listener, error = %e, "Accept failed");
        }
        result
    }

    fn accept_on(&mut self, socket: &RendezvousListener) -> EndpointResult<ConnectionId> {
        let incoming = socket.accept(self.config.rdma.handshake_timeout())?;
        let id = self.next_connection_id();
        debug!(connection = %id, peer = %incoming.peer(), "Peer record received");

        // The listener follows whichever data path the connector asked for.
        let mut conn = self.new_connection(id, ConnectionRole::Listener, incoming.remote().transport)?;
        conn.begin()?;
        let exchange = incoming.reply(conn.rendezvous_record()?)?;
        conn.activate(exchange)?;
        self.install(conn)
    }

    /// Bind `addr` and accept one peer (`RdmaListen`).
    pub fn listen(&mut self, addr: SocketAddr) -> EndpointResult<ConnectionId> {
        let listener = self.bind(addr)?;
        self.accept(listener)
    }

    /// Dial a listener and bring the connection up (`RdmaConnect`).
    ///
    /// Waits for the listener's ready marker first when one is configured.
    /// Nothing is added to the connection table on failure.
    ///
    /// # Errors
    ///
    /// `EndpointError::Connect` if the listener never becomes ready or is
    /// unreachable, `Protocol` on a malformed reply, `Activation` if the
    /// queue pair cannot be brought up.
    pub fn connect(&mut self, addr: SocketAddr) -> EndpointResult<ConnectionId> {
        let rdma = &self.config.rdma;
        let published = self
            .sync
            .wait_ready(rdma.ready_timeout(), rdma.ready_poll_interval())
            .map_err(|e| EndpointError::connect(addr, e))?;
        if let Some(info) = published {
            if info.addr != addr {
                debug!(published = %info.addr, %addr, "Dialing an address other than the published one");
            }
        }

        let id = self.next_connection_id();
        let transport = TransportKind::from_config(self.config.rdma.connect_using_rdma);
        let mut conn = self.new_connection(id, ConnectionRole::Connector, transport)?;
        conn.begin()?;

        let result = rendezvous::connect(addr, conn.rendezvous_record()?, self.config.rdma.handshake_timeout())
            .and_then(|exchange| conn.activate(exchange));
        if let Err(e) = result {
            warn!(connection = %id, %addr, error = %e, "Connect failed");
            return Err(e);
        }
        self.install(conn)
    }

    fn next_connection_id(&mut self) -> ConnectionId {
        let id = ConnectionId(self.next_connection);
        self.next_connection += 1;
        id
    }

    fn new_connection(
        &self,
        id: ConnectionId,
        role: ConnectionRole,
        transport: TransportKind,
    ) -> EndpointResult<Connection> {
        let rdma = &self.config.rdma;
        let (device, port, sgid_index) = match (&self.fallback, transport) {
            (Some(soft), TransportKind::Socket) => (Arc::clone(soft), DEFAULT_IB_PORT, 0),
            _ => (Arc::clone(&self.device), rdma.port, rdma.sgid_index),
        };
        Connection::new(
            id,
            role,
            transport,
            device,
            &self.region,
            QueuePairConfig {
                port,
                sgid_index,
                link_timeout: rdma.handshake_timeout(),
            },
            rdma.cq_depth,
        )
    }

    fn install(&mut self, conn: Connection) -> EndpointResult<ConnectionId> {
        let id = conn.id();
        self.mux
            .register(conn.completion_queue().as_ref(), Source::Connection(id))?;
        self.connections.insert(id, conn);
        Ok(id)
    }

    /// Look up a connection.
    pub fn connection(&self, id: ConnectionId) -> Option<&Connection> {
        self.connections.get(&id)
    }

    fn connection_mut(&mut self, id: ConnectionId) -> EndpointResult<&mut Connection> {
        self.connections
            .get_mut(&id)
            .ok_or(EndpointError::UnknownConnection { id: id.0 })
    }

    /// Identifiers of every connection in the table, closed ones included.
    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.connections.keys().copied().collect()
    }

    /// See [`Connection::post_write`].
    pub fn post_write(
        &mut self,
        id: ConnectionId,
        wr_id: u64,
        local_offset: usize,
        len: usize,
        remote_offset: usize,
        imm: Option<u32>,
    ) -> EndpointResult<()> {
        self.connection_mut(id)?
            .post_write(wr_id, local_offset, len, remote_offset, imm)
    }

    /// See [`Connection::post_read`].
    pub fn post_read(
        &mut self,
        id: ConnectionId,
        wr_id: u64,
        local_offset: usize,
        len: usize,
        remote_offset: usize,
    ) -> EndpointResult<()> {
        self.connection_mut(id)?
            .post_read(wr_id, local_offset, len, remote_offset)
    }

    /// See [`Connection::post_recv`].
    pub fn post_recv(&mut self, id: ConnectionId, wr_id: u64) -> EndpointResult<()> {
        self.connection_mut(id)?.post_recv(wr_id)
    }

    /// Wait for events (`RdmaEvent`).
    ///
    /// Returns every event pending at wake-up. `None` blocks until at least
    /// one event exists; `Some(d)` returns an empty batch after `d`.
    ///
    /// # Errors
    ///
    /// `EndpointError::Multiplexer` if the wait primitive fails; fatal.
    pub fn poll_events(&mut self, timeout: Option<Duration>) -> EndpointResult<Vec<Event>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        loop {
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            let fired = self.mux.wait(remaining)?;
            let events = self.collect(&fired);
            if !events.is_empty() {
                return Ok(events);
            }
            if remaining.is_some_and(|r| r.is_zero()) {
                return Ok(events);
            }
            if fired.is_empty() && deadline.is_some() {
                return Ok(events);
            }
        }
    }

    /// Block until at least one event is pending.
    pub fn next_events(&mut self) -> EndpointResult<Vec<Event>> {
        self.poll_events(None)
    }

    fn collect(&mut self, fired: &[Source]) -> Vec<Event> {
        let mut events = Vec::new();
        for source in fired {
            match *source {
                Source::Listener(listener) => {
                    if self.listeners.contains_key(&listener) {
                        events.push(Event::IncomingConnection { listener });
                    }
                }
                Source::Connection(connection) => {
                    let Some(conn) = self.connections.get_mut(&connection) else {
                        continue;
                    };
                    for completion in conn.drain_completions() {
                        events.push(if completion.status.is_success() {
                            Event::Completion {
                                connection,
                                completion,
                            }
                        } else {
                            Event::ConnectionError {
                                connection,
                                completion,
                            }
                        });
                    }
                }
            }
        }
        events
    }

    /// Close one connection. It stays in the table as `Closed`.
    ///
    /// # Errors
    ///
    /// `AlreadyClosed` on a second call, `UnknownConnection` for a foreign id.
    pub fn close(&mut self, id: ConnectionId) -> EndpointResult<()> {
        let conn = self
            .connections
            .get_mut(&id)
            .ok_or(EndpointError::UnknownConnection { id: id.0 })?;
        let cq = Arc::clone(conn.completion_queue());
        conn.close()?;
        self.mux.deregister(cq.as_ref(), Source::Connection(id))
    }

    /// Close every connection and listener and withdraw the publication.
    pub fn shutdown(&mut self) -> EndpointResult<()> {
        let open: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|(_, conn)| conn.state() != ConnectionState::Closed)
            .map(|(id, _)| *id)
            .collect();
        for id in open {
            if let Err(e) = self.close(id) {
                warn!(connection = %id, error = %e, "Close during shutdown failed");
            }
        }

        for (id, socket) in self.listeners.drain() {
            let _ = self.mux.deregister(&socket, Source::Listener(id));
        }
        self.sync.withdraw()?;
        info!(service = %self.config.shared.service_name, "Endpoint shut down");
        Ok(())
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        if !self.listeners.is_empty() {
            let _ = self.sync.withdraw();
        }
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("service", &self.config.shared.service_name)
            .field("device", &self.device.name())
            .field("region", &self.region)
            .field("listeners", &self.listeners.len())
            .field("connections", &self.connections.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rendezvous::MemorySync;
    use crate::device::DeviceError;

    fn config(name: &str) -> EndpointConfig {
        let mut config = EndpointConfig::new(name);
        config.rdma.handshake_timeout_ms = 2_000;
        config.rdma.ready_timeout_ms = 100;
        config
    }

    #[test]
    fn invalid_config_rejected() {
        let mut cfg = config("ep-unit");
        cfg.rdma.shm_size = 0;
        assert!(matches!(Endpoint::new(cfg), Err(EndpointError::Config { .. })));
    }

    #[test]
    fn unknown_device_rejected() {
        let mut cfg = config("ep-unit");
        cfg.rdma.device = "no-such-device".to_string();
        assert!(matches!(
            Endpoint::new(cfg),
            Err(EndpointError::Device {
                source: DeviceError::NotFound(_)
            })
        ));
    }

    #[test]
    fn bad_gid_index_rejected() {
        let mut cfg = config("ep-unit");
        cfg.rdma.sgid_index = 200;
        assert!(matches!(
            Endpoint::new(cfg),
            Err(EndpointError::Device {
                source: DeviceError::InvalidGidIndex { .. }
            })
        ));
    }

    #[test]
    fn region_sized_from_config() {
        let mut cfg = config("ep-unit");
        cfg.rdma.shm_size = 8192;
        let ep = Endpoint::new(cfg).unwrap();
        assert_eq!(ep.region().len(), 8192);
    }

    #[test]
    fn bind_publishes_and_shutdown_withdraws() {
        let sync = MemorySync::new();
        let mut ep = Endpoint::with_sync(
            config("ep-unit"),
            &DeviceRegistry::with_builtin(),
            Box::new(sync.clone()),
        )
        .unwrap();

        let listener = ep.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let addr = ep.listener_addr(listener).unwrap();
        assert_eq!(sync.current().map(|i| i.addr), Some(addr));

        ep.shutdown().unwrap();
        assert!(sync.current().is_none());
        assert!(ep.listener_addr(listener).is_none());
    }

    #[test]
    fn accept_keeps_publication_while_listeners_remain() {
        let sync = MemorySync::new();
        let mut cfg = config("ep-unit");
        cfg.rdma.handshake_timeout_ms = 20;
        let mut ep =
            Endpoint::with_sync(cfg, &DeviceRegistry::with_builtin(), Box::new(sync.clone())).unwrap();

        let first = ep.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let second = ep.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let published = ep.listener_addr(second).unwrap();

        assert!(matches!(ep.accept(first), Err(EndpointError::Accept { .. })));
        assert_eq!(sync.current().map(|i| i.addr), Some(published));

        assert!(matches!(ep.accept(second), Err(EndpointError::Accept { .. })));
        assert!(sync.current().is_none());
    }

    /// Soft device that does not advertise stream attachment.
    struct Streamless(SoftDevice);

    impl Device for Streamless {
        fn name(&self) -> &str {
            "streamless"
        }
        fn attributes(&self) -> crate::device::DeviceAttributes {
            self.0.attributes()
        }
        fn query_gid(&self, port: u8, index: u8) -> Result<crate::device::Gid, DeviceError> {
            self.0.query_gid(port, index)
        }
        fn register_region(
            &self,
            region: &Arc<SharedRegion>,
            access: crate::region::AccessFlags,
        ) -> Result<crate::device::MemoryRegistration, DeviceError> {
            self.0.register_region(region, access)
        }
        fn deregister_region(&self, lkey: u32) -> Result<(), DeviceError> {
            self.0.deregister_region(lkey)
        }
        fn registration_count(&self) -> usize {
            self.0.registration_count()
        }
        fn create_completion_queue(
            &self,
            depth: usize,
        ) -> Result<Arc<crate::device::CompletionQueue>, DeviceError> {
            self.0.create_completion_queue(depth)
        }
        fn create_queue_pair(
            &self,
            config: QueuePairConfig,
            cq: Arc<crate::device::CompletionQueue>,
        ) -> Result<Box<dyn crate::device::QueuePair>, DeviceError> {
            self.0.create_queue_pair(config, cq)
        }
    }

    fn streamless(_name: &str) -> Result<Arc<dyn Device>, DeviceError> {
        Ok(Arc::new(Streamless(SoftDevice::new())))
    }

    #[test]
    fn socket_connections_use_fallback_device() {
        let mut registry = DeviceRegistry::new();
        registry.register("streamless", streamless);
        let mut cfg = config("ep-unit");
        cfg.rdma.device = "streamless".to_string();
        let ep = Endpoint::with_sync(cfg, &registry, Box::new(MemorySync::new())).unwrap();
        let fallback = Arc::clone(ep.fallback_device().expect("fallback for a streamless device"));

        let socket = ep
            .new_connection(ConnectionId(1), ConnectionRole::Connector, TransportKind::Socket)
            .unwrap();
        assert_eq!(fallback.registration_count(), 1);
        assert_eq!(ep.device().registration_count(), 0);

        let rdma = ep
            .new_connection(ConnectionId(2), ConnectionRole::Connector, TransportKind::Rdma)
            .unwrap();
        assert_eq!(ep.device().registration_count(), 1);

        drop((socket, rdma));
        assert_eq!(fallback.registration_count(), 0);
        assert_eq!(ep.device().registration_count(), 0);
    }

    #[test]
    fn soft_device_needs_no_fallback() {
        let ep = Endpoint::new(config("ep-unit")).unwrap();
        assert!(ep.fallback_device().is_none());
    }

    #[test]
    fn idle_poll_times_out_empty() {
        let mut ep = Endpoint::new(config("ep-unit")).unwrap();
        ep.bind("127.0.0.1:0".parse().unwrap()).unwrap();
        let events = ep.poll_events(Some(Duration::from_millis(20))).unwrap();
        assert!(events.is_empty());
    }

    #[test]
    fn unknown_ids_rejected() {
        let mut ep = Endpoint::new(config("ep-unit")).unwrap();
        assert!(matches!(
            ep.post_recv(ConnectionId(9), 1),
            Err(EndpointError::UnknownConnection { id: 9 })
        ));
        assert!(matches!(
            ep.accept(ListenerId(3)),
            Err(EndpointError::UnknownListener { id: 3 })
        ));
        assert!(matches!(
            ep.close(ConnectionId(9)),
            Err(EndpointError::UnknownConnection { .. })
        ));
    }

    #[test]
    fn connect_waits_for_ready_then_fails() {
        let mut ep = Endpoint::with_sync(
            config("ep-unit"),
            &DeviceRegistry::with_builtin(),
            Box::new(MemorySync::new()),
        )
        .unwrap();
        let err = ep.connect("127.0.0.1:9".parse().unwrap()).unwrap_err();
        assert!(matches!(err, EndpointError::Connect { .. }));
        assert!(ep.connection_ids().is_empty());
        assert_eq!(ep.device().registration_count(), 0);
    }
}
