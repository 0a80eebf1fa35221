//! RDMA device abstraction.
//!
//! The verbs surface the endpoint needs (memory registration, completion
//! queues with a pollable channel, reliable-connected queue pairs) lives
//! behind the [`Device`] and [`QueuePair`] traits. Devices are created by
//! name through a [`DeviceRegistry`].
//!
//! Two implementations ship with the crate: the software device (`soft`),
//! which needs no RDMA hardware, and, with the `verbs` feature, one device
//! per libibverbs adapter registered under its kernel name (`mlx5_0`, ...).
//!
//! # Queue pair bring-up
//!
//! ```text
//!  RESET ──modify_to_init──► INIT ──modify_to_rtr──► RTR ──modify_to_rts──► RTS
//!                              │                      │                     │
//!                              └──────────────────────┴──── fault ──────────┴──► ERROR
//! ```

pub mod cq;
pub mod frame;
pub mod soft;
#[cfg(feature = "verbs")]
pub mod verbs;

pub use cq::CompletionQueue;

use crate::region::{AccessFlags, SharedRegion};
use std::collections::HashMap;
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, TcpStream};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Device-level errors.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// No device registered under the requested name.
    #[error("Device not found: {0}")]
    NotFound(String),

    /// Port number outside the device's port range.
    #[error("Invalid port {port} (device has {count})")]
    InvalidPort {
        /// Requested port
        port: u8,
        /// Number of ports on the device
        count: u8,
    },

    /// GID index outside the port's GID table.
    #[error("Invalid GID index {index} (table has {len} entries)")]
    InvalidGidIndex {
        /// Requested index
        index: u8,
        /// Table length
        len: u8,
    },

    /// Unknown memory key.
    #[error("Invalid memory key {key:#x}")]
    InvalidKey {
        /// The key that was not found
        key: u32,
    },

    /// Local address range not covered by the registration.
    #[error("Local range {addr:#x}+{len} outside registration")]
    LocalRange {
        /// Start address
        addr: u64,
        /// Length
        len: u32,
    },

    /// Queue pair transition or post attempted in the wrong state.
    #[error("Queue pair {qp_num} is {state:?}, expected {expected}")]
    InvalidQpState {
        /// Queue pair number
        qp_num: u32,
        /// Current state
        state: QpState,
        /// Accepted states
        expected: &'static str,
    },

    /// Peer parameters rejected.
    #[error("Peer rejected: {0}")]
    Peer(String),

    /// Link to the peer could not be established or was lost.
    #[error("Link error: {0}")]
    Link(String),

    /// Capability not offered by this device.
    #[error("Unsupported: {0}")]
    Unsupported(&'static str),

    /// Resource limit reached.
    #[error("Resource exhausted: {0}")]
    Exhausted(&'static str),

    /// A verbs library call failed.
    #[error("{call} failed: {source}")]
    Verbs {
        /// The failing call
        call: &'static str,
        /// OS error it reported
        #[source]
        source: std::io::Error,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Nix system call error
    #[error("System call error: {0}")]
    Nix(#[from] nix::Error),
}

/// Static device capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceAttributes {
    /// Largest region a single registration can cover.
    pub max_mr_size: usize,
    /// Maximum number of queue pairs.
    pub max_qp: u32,
    /// Maximum completion queue depth.
    pub max_cqe: usize,
    /// Number of physical ports, numbered from 1.
    pub port_count: u8,
    /// GID table length per port.
    pub gid_table_len: u8,
}

/// 128-bit global port identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Gid(pub [u8; 16]);

impl Gid {
    /// IPv4-mapped GID (`::ffff:a.b.c.d`).
    pub fn from_ipv4(addr: Ipv4Addr) -> Self {
        Self(addr.to_ipv6_mapped().octets())
    }

    /// The IPv4 address a mapped GID carries, if any and if specified.
    pub fn to_ipv4(&self) -> Option<Ipv4Addr> {
        let v6 = std::net::Ipv6Addr::from(self.0);
        v6.to_ipv4_mapped().filter(|v4| !v4.is_unspecified())
    }
}

impl fmt::Debug for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Gid({})", std::net::Ipv6Addr::from(self.0))
    }
}

impl fmt::Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", std::net::Ipv6Addr::from(self.0))
    }
}

/// Addressing information one queue pair publishes to its peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QpEndpoint {
    /// Queue pair number (24 bits).
    pub qp_num: u32,
    /// Initial packet sequence number (24 bits).
    pub psn: u32,
    /// Local identifier of the port.
    pub lid: u16,
    /// Global identifier of the port.
    pub gid: Gid,
}

/// Queue pair state as the device sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QpState {
    /// Freshly created.
    Reset,
    /// Access rights set, receives may be posted.
    Init,
    /// Ready to receive; peer known.
    Rtr,
    /// Ready to send.
    Rts,
    /// Unrecoverable fault; posted requests are flushed.
    Error,
}

/// Send-side operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOpcode {
    /// One-sided write into the peer's region.
    Write,
    /// Write that also consumes a receive at the peer and carries `imm`.
    WriteWithImm {
        /// Immediate data delivered with the receive completion.
        imm: u32,
    },
    /// One-sided read from the peer's region.
    Read,
}

/// Send work request in verbs terms: virtual addresses plus keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendRequest {
    /// Caller-chosen identifier echoed in the completion.
    pub wr_id: u64,
    /// Operation.
    pub opcode: SendOpcode,
    /// Local virtual address.
    pub local_addr: u64,
    /// Local key of the registration covering `local_addr`.
    pub lkey: u32,
    /// Transfer length in bytes.
    pub len: u32,
    /// Remote virtual address.
    pub remote_addr: u64,
    /// Remote key.
    pub rkey: u32,
}

/// Completed operation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcOpcode {
    /// Local write finished.
    Write,
    /// Local write with immediate finished.
    WriteWithImm,
    /// Local read finished; data is in the local region.
    Read,
    /// Receive consumed (flushed receives report this).
    Recv,
    /// Receive consumed by a peer's write with immediate.
    RecvWithImm,
}

/// Completion status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcStatus {
    /// Operation succeeded.
    Success,
    /// Peer rejected the key, the access rights, or the range.
    RemoteAccessError,
    /// Local key or range invalid.
    LocalProtectionError,
    /// Queue pair entered the error state before the request finished.
    FlushError,
    /// Link to the peer failed.
    LinkError,
}

impl WcStatus {
    /// Wire encoding used in acknowledgements.
    pub const fn code(self) -> u8 {
        match self {
            WcStatus::Success => 0,
            WcStatus::RemoteAccessError => 1,
            WcStatus::LocalProtectionError => 2,
            WcStatus::FlushError => 3,
            WcStatus::LinkError => 4,
        }
    }

    /// Decode an acknowledgement status; unknown codes read as link errors.
    pub const fn from_code(code: u8) -> Self {
        match code {
            0 => WcStatus::Success,
            1 => WcStatus::RemoteAccessError,
            2 => WcStatus::LocalProtectionError,
            3 => WcStatus::FlushError,
            _ => WcStatus::LinkError,
        }
    }

    /// True for `Success`.
    pub const fn is_success(self) -> bool {
        matches!(self, WcStatus::Success)
    }
}

/// Work completion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkCompletion {
    /// Identifier of the finished request.
    pub wr_id: u64,
    /// What finished.
    pub opcode: WcOpcode,
    /// Outcome.
    pub status: WcStatus,
    /// Bytes transferred.
    pub byte_len: u32,
    /// Immediate data for `RecvWithImm`.
    pub imm_data: Option<u32>,
    /// Queue pair the completion belongs to.
    pub qp_num: u32,
}

/// Handle to a registered region.
#[derive(Debug, Clone)]
pub struct MemoryRegistration {
    /// Key for local work requests.
    pub lkey: u32,
    /// Key peers present to access the region.
    pub rkey: u32,
    /// Base virtual address.
    pub addr: u64,
    /// Registered length.
    pub len: usize,
    /// Granted rights.
    pub access: AccessFlags,
    /// The registered memory.
    pub region: Arc<SharedRegion>,
}

impl MemoryRegistration {
    /// Offset of `addr..addr+len` within the region, if covered.
    pub fn offset_of(&self, addr: u64, len: u64) -> Option<usize> {
        let offset = addr.checked_sub(self.addr)?;
        let end = offset.checked_add(len)?;
        (end <= self.len as u64).then_some(offset as usize)
    }
}

/// Queue pair creation parameters.
#[derive(Debug, Clone, Copy)]
pub struct QueuePairConfig {
    /// Physical port, numbered from 1.
    pub port: u8,
    /// GID table index.
    pub sgid_index: u8,
    /// Upper bound for establishing the link to the peer.
    pub link_timeout: Duration,
}

/// One end of a reliable-connected link.
pub trait QueuePair: Send {
    /// Queue pair number.
    fn qp_num(&self) -> u32;

    /// Current device state.
    fn state(&self) -> QpState;

    /// Parameters the peer needs to reach this queue pair.
    fn local_endpoint(&self) -> QpEndpoint;

    /// RESET → INIT.
    fn modify_to_init(&mut self, access: AccessFlags) -> Result<(), DeviceError>;

    /// INIT → RTR: bind to the peer and establish the link.
    fn modify_to_rtr(&mut self, remote: &QpEndpoint, peer_ip: IpAddr) -> Result<(), DeviceError>;

    /// RTR → RTS.
    fn modify_to_rts(&mut self) -> Result<(), DeviceError>;

    /// Carry the data path over an already connected stream instead of a
    /// dedicated link. Must be called before `modify_to_rtr`.
    fn attach_stream(&mut self, _stream: TcpStream) -> Result<(), DeviceError> {
        Err(DeviceError::Unsupported("stream attachment"))
    }

    /// Post a send-side work request.
    fn post_send(&mut self, wr: SendRequest) -> Result<(), DeviceError>;

    /// Post a receive.
    fn post_recv(&mut self, wr_id: u64) -> Result<(), DeviceError>;

    /// Stop all device activity for this queue pair.
    ///
    /// No completion is produced for it afterwards. Idempotent.
    fn destroy(&mut self) -> Result<(), DeviceError>;
}

/// An RDMA-capable device.
pub trait Device: Send + Sync {
    /// Device name as registered.
    fn name(&self) -> &str;

    /// Static capabilities.
    fn attributes(&self) -> DeviceAttributes;

    /// GID table entry for `port`.
    fn query_gid(&self, port: u8, index: u8) -> Result<Gid, DeviceError>;

    /// Register `region` for local and remote access.
    fn register_region(
        &self,
        region: &Arc<SharedRegion>,
        access: AccessFlags,
    ) -> Result<MemoryRegistration, DeviceError>;

    /// Release a registration by local key.
    fn deregister_region(&self, lkey: u32) -> Result<(), DeviceError>;

    /// Number of live registrations.
    fn registration_count(&self) -> usize;

    /// Create a completion queue holding up to `depth` entries.
    fn create_completion_queue(&self, depth: usize) -> Result<Arc<CompletionQueue>, DeviceError>;

    /// Create a queue pair reporting into `cq`.
    fn create_queue_pair(
        &self,
        config: QueuePairConfig,
        cq: Arc<CompletionQueue>,
    ) -> Result<Box<dyn QueuePair>, DeviceError>;

    /// Whether queue pairs accept [`QueuePair::attach_stream`].
    fn attaches_streams(&self) -> bool {
        false
    }
}

/// Factory creating a device instance from its registered name.
pub type DeviceFactory = fn(&str) -> Result<Arc<dyn Device>, DeviceError>;

/// Registry of available devices.
///
/// Constructed at startup and passed to the endpoint; no global state.
pub struct DeviceRegistry {
    factories: HashMap<String, DeviceFactory>,
}

impl DeviceRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry with every device shipped in this crate.
    ///
    /// With the `verbs` feature, each adapter libibverbs reports is added
    /// under its own name. An adapter whose name is already taken is skipped.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(soft::SOFT_DEVICE_NAME, soft::SoftDevice::factory);

        #[cfg(feature = "verbs")]
        for name in verbs::device_names() {
            if registry.contains(&name) {
                warn!(device = %name, "Verbs device shadowed by an existing registration");
                continue;
            }
            registry.register(name, verbs::VerbsDevice::factory);
        }
        registry
    }

    /// Register a device factory.
    ///
    /// # Panics
    /// Panics if a device with the same name is already registered.
    pub fn register(&mut self, name: impl Into<String>, factory: DeviceFactory) {
        let name = name.into();
        if self.factories.contains_key(&name) {
            panic!("Device '{name}' is already registered");
        }
        self.factories.insert(name, factory);
    }

    /// Whether a device is registered under `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Open a device by name.
    ///
    /// # Errors
    /// Returns `DeviceError::NotFound` if no device with the given name is registered.
    pub fn open(&self, name: &str) -> Result<Arc<dyn Device>, DeviceError> {
        let Some(factory) = self.factories.get(name).copied() else {
            warn!(device = name, available = ?self.list_devices(), "Requested device is not registered");
            return Err(DeviceError::NotFound(name.to_string()));
        };
        factory(name)
    }

    /// Registered device names, sorted.
    pub fn list_devices(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::with_builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_registry_opens_soft() {
        let registry = DeviceRegistry::with_builtin();
        assert!(registry.list_devices().iter().any(|n| n == soft::SOFT_DEVICE_NAME));
        let device = registry.open(soft::SOFT_DEVICE_NAME).unwrap();
        assert_eq!(device.name(), soft::SOFT_DEVICE_NAME);
        assert!(device.attaches_streams());
    }

    #[test]
    fn list_devices_is_sorted() {
        let mut registry = DeviceRegistry::new();
        registry.register("rxe0", soft::SoftDevice::factory);
        registry.register("mlx5_1", soft::SoftDevice::factory);
        registry.register("mlx5_0", soft::SoftDevice::factory);
        assert_eq!(registry.list_devices(), vec!["mlx5_0", "mlx5_1", "rxe0"]);
        assert!(registry.contains("rxe0"));
        assert!(!registry.contains("rxe1"));
    }

    #[test]
    fn unknown_device_not_found() {
        let registry = DeviceRegistry::new();
        assert!(matches!(registry.open("mlx5_0"), Err(DeviceError::NotFound(_))));
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn duplicate_registration_panics() {
        let mut registry = DeviceRegistry::with_builtin();
        registry.register(soft::SOFT_DEVICE_NAME, soft::SoftDevice::factory);
    }

    #[test]
    fn gid_ipv4_mapping() {
        let gid = Gid::from_ipv4(Ipv4Addr::new(10, 0, 0, 7));
        assert_eq!(gid.to_ipv4(), Some(Ipv4Addr::new(10, 0, 0, 7)));
        assert_eq!(gid.to_string(), "::ffff:10.0.0.7");
        assert_eq!(Gid::from_ipv4(Ipv4Addr::UNSPECIFIED).to_ipv4(), None);
        assert_eq!(Gid::default().to_ipv4(), None);
    }

    #[test]
    fn status_codes_roundtrip() {
        for status in [
            WcStatus::Success,
            WcStatus::RemoteAccessError,
            WcStatus::LocalProtectionError,
            WcStatus::FlushError,
            WcStatus::LinkError,
        ] {
            assert_eq!(WcStatus::from_code(status.code()), status);
        }
        assert_eq!(WcStatus::from_code(200), WcStatus::LinkError);
    }

    #[test]
    fn registration_offsets() {
        let region = Arc::new(SharedRegion::create("device-unit", 256).unwrap());
        let reg = MemoryRegistration {
            lkey: 1,
            rkey: 2,
            addr: region.addr(),
            len: region.len(),
            access: AccessFlags::connection_default(),
            region: Arc::clone(&region),
        };
        assert_eq!(reg.offset_of(region.addr() + 16, 16), Some(16));
        assert_eq!(reg.offset_of(region.addr(), 256), Some(0));
        assert_eq!(reg.offset_of(region.addr() + 250, 16), None);
        assert_eq!(reg.offset_of(region.addr().wrapping_sub(1), 1), None);
    }
}
