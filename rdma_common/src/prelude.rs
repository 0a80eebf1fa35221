//! Prelude module for common re-exports.
//!
//! ```rust
//! use rdma_common::prelude::*;
//! ```

use std::time::Duration;

// ─── Configuration ──────────────────────────────────────────────────
pub use crate::config::{ConfigError, ConfigLoader, EndpointConfig, LogLevel, RdmaConfig, SharedConfig};

// ─── Constants ──────────────────────────────────────────────────────
pub use crate::consts::{DEFAULT_DEVICE, DEFAULT_SHM_SIZE, SHM_MAX_SIZE};

/// Default timeout for a single `RdmaEvent` poll in tools that need a tick.
pub const DEFAULT_EVENT_TICK: Duration = Duration::from_millis(100);
