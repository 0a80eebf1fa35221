//! Transport constants.
//!
//! These constants are the single source of truth for region limits, the
//! rendezvous wire format and configuration defaults. Other crates import
//! them from here.

/// Maximum shared memory region size in bytes.
///
/// Set to 1GB as a reasonable upper limit to prevent excessive memory usage.
pub const SHM_MAX_SIZE: usize = 1_073_741_824; // 1GB

/// Default shared memory region size (one page).
pub const DEFAULT_SHM_SIZE: usize = 4096;

/// Magic bytes opening every rendezvous record: `"RDV1"`.
pub const RENDEZVOUS_MAGIC: [u8; 4] = *b"RDV1";

/// Size of an encoded rendezvous record in bytes (length prefix excluded).
pub const RENDEZVOUS_RECORD_LEN: usize = 64;

/// Name of the built-in software RDMA device.
pub const DEFAULT_DEVICE: &str = "soft";

/// Default physical port index (ports are numbered from 1).
pub const DEFAULT_IB_PORT: u8 = 1;

/// Default completion queue depth per connection.
pub const DEFAULT_CQ_DEPTH: usize = 256;

/// Default timeout for socket operations during the handshake.
pub const DEFAULT_HANDSHAKE_TIMEOUT_MS: u64 = 5_000;

/// Default time a connector waits for the listener's ready marker.
pub const DEFAULT_READY_TIMEOUT_MS: u64 = 10_000;

/// Default polling interval while waiting for the ready marker.
pub const DEFAULT_READY_POLL_INTERVAL_MS: u64 = 10;
