//! Out-of-band rendezvous: wire record, TCP channel, readiness publication.

pub mod channel;
pub mod record;
pub mod sync;

pub use channel::{Exchange, Incoming, RendezvousListener, connect};
pub use record::{RendezvousRecord, TransportKind};
pub use sync::{FileSync, ListenInfo, MemorySync, RendezvousSync};
