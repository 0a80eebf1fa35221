//! # RDMA Transport Endpoint
//!
//! Point-to-point transport between two processes: each side exposes one
//! registered shared-memory region, exchanges queue pair and region
//! parameters over a short TCP rendezvous, then moves data with one-sided
//! writes (optionally carrying an immediate value) and reads. Completions
//! and incoming peers are surfaced through a single epoll-backed event loop.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  record (64 B)  ┌──────────────┐
//! │  Endpoint A  │◄───── TCP ─────►│  Endpoint B  │
//! │              │                 │              │
//! │ SharedRegion │   WRITE / READ  │ SharedRegion │
//! │ QueuePair    ├────────────────►│ QueuePair    │
//! │ CQ ─► epoll  │                 │ CQ ─► epoll  │
//! └──────────────┘                 └──────────────┘
//! ```
//!
//! The verbs layer sits behind [`device::Device`]. The built-in `soft`
//! device implements reliable-connected semantics over a per-queue-pair TCP
//! link, so the endpoint runs without RDMA hardware. Building with the
//! `verbs` feature adds every libibverbs adapter under its kernel name;
//! socket-transport connections on such a device run over `soft`.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use rdma_common::config::EndpointConfig;
//! use rdma_endpoint::{Endpoint, Event};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut endpoint = Endpoint::new(EndpointConfig::new("writer"))?;
//! let conn = endpoint.connect("10.0.0.2:7471".parse()?)?;
//!
//! endpoint.region().write_at(0, b"payload")?;
//! endpoint.post_write(conn, 1, 0, 7, 0, Some(0xfeed))?;
//!
//! for event in endpoint.next_events()? {
//!     if let Event::Completion { completion, .. } = event {
//!         println!("wr {} done", completion.wr_id);
//!     }
//! }
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod connection;
pub mod device;
pub mod endpoint;
pub mod error;
pub mod multiplexer;
pub mod platform;
pub mod region;
pub mod rendezvous;
pub mod state;

pub use connection::Connection;
pub use device::{
    CompletionQueue, Device, DeviceError, DeviceRegistry, WcOpcode, WcStatus, WorkCompletion,
};
pub use endpoint::{Endpoint, Event};
pub use error::{EndpointError, EndpointResult};
pub use multiplexer::{ConnectionId, ListenerId};
pub use region::{AccessFlags, RemoteRegion, SharedRegion};
pub use rendezvous::{FileSync, ListenInfo, MemorySync, RendezvousSync, TransportKind};
pub use state::{ConnectionRole, ConnectionState};

/// Install a global fmt subscriber filtered by `RUST_LOG`.
///
/// Safe to call more than once; later calls are ignored.
pub fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_thread_ids(true)
        .with_line_number(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}
