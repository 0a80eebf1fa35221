//! Error types for endpoint operations

use crate::device::DeviceError;
use crate::state::ConnectionState;
use rdma_common::config::ConfigError;
use std::net::SocketAddr;
use thiserror::Error;

/// Errors that can occur while setting up or driving a connection
#[derive(Error, Debug)]
pub enum EndpointError {
    /// Shared region could not be reserved or registered
    #[error("Allocation of {size} bytes failed: {reason}")]
    Allocation {
        /// Requested size in bytes
        size: usize,
        /// What went wrong
        reason: String,
    },

    /// Listening socket could not be bound
    #[error("Cannot bind {addr}: {source}")]
    Bind {
        /// Requested address
        addr: SocketAddr,
        /// Source IO error
        source: std::io::Error,
    },

    /// Accepting or serving the incoming handshake failed
    #[error("Accept failed: {reason}")]
    Accept {
        /// What went wrong
        reason: String,
    },

    /// Peer unreachable, refused, or never became ready
    #[error("Connect to {addr} failed: {reason}")]
    Connect {
        /// Peer address
        addr: SocketAddr,
        /// What went wrong
        reason: String,
    },

    /// Malformed rendezvous record
    #[error("Protocol error: {reason}")]
    Protocol {
        /// What was wrong with the record
        reason: String,
    },

    /// Device refused to bring the queue pair up
    #[error("Activation failed: {reason}")]
    Activation {
        /// Device error description
        reason: String,
    },

    /// The shared wait primitive failed
    #[error("Multiplexer failure: {source}")]
    Multiplexer {
        /// Source errno
        source: nix::Error,
    },

    /// Listener never published its ready marker
    #[error("Listener not ready after {waited_ms} ms")]
    NotReady {
        /// Time spent waiting
        waited_ms: u64,
    },

    /// Operation not allowed in the connection's current state
    #[error("{operation} not allowed in state {state:?}")]
    InvalidState {
        /// Attempted operation
        operation: &'static str,
        /// Current state
        state: ConnectionState,
    },

    /// Offset range falls outside a region
    #[error("Range {offset}+{len} outside region of {region_len} bytes")]
    OutOfBounds {
        /// Start offset
        offset: usize,
        /// Range length
        len: usize,
        /// Region length
        region_len: usize,
    },

    /// Connection was already closed
    #[error("Connection {id} already closed")]
    AlreadyClosed {
        /// Connection id
        id: u64,
    },

    /// Connection is in the error state; nothing can be posted
    #[error("Connection {id} failed")]
    ConnectionFailed {
        /// Connection id
        id: u64,
    },

    /// No such connection in the endpoint's table
    #[error("Unknown connection {id}")]
    UnknownConnection {
        /// Connection id
        id: u64,
    },

    /// No such listener in the endpoint's table
    #[error("Unknown listener {id}")]
    UnknownListener {
        /// Listener id
        id: u64,
    },

    /// Configuration rejected
    #[error("Configuration error: {source}")]
    Config {
        /// Source config error
        #[from]
        source: ConfigError,
    },

    /// Device level failure
    #[error("Device error: {source}")]
    Device {
        /// Source device error
        #[from]
        source: DeviceError,
    },

    /// IO error
    #[error("IO error: {source}")]
    Io {
        /// Source IO error
        #[from]
        source: std::io::Error,
    },

    /// Nix system call error
    #[error("System call error: {source}")]
    Nix {
        /// Source nix error
        #[from]
        source: nix::Error,
    },
}

impl EndpointError {
    pub(crate) fn protocol(reason: impl Into<String>) -> Self {
        EndpointError::Protocol {
            reason: reason.into(),
        }
    }

    pub(crate) fn accept(reason: impl ToString) -> Self {
        EndpointError::Accept {
            reason: reason.to_string(),
        }
    }

    pub(crate) fn connect(addr: SocketAddr, reason: impl ToString) -> Self {
        EndpointError::Connect {
            addr,
            reason: reason.to_string(),
        }
    }
}

/// Result type for endpoint operations
pub type EndpointResult<T> = Result<T, EndpointError>;
