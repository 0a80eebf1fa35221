//! Configuration loading traits and types.
//!
//! This module provides a standardized way to load TOML configuration files
//! for the transport endpoint and its tools.
//!
//! # Usage
//!
//! ```rust,no_run
//! use rdma_common::config::{ConfigError, ConfigLoader, EndpointConfig};
//! use std::path::Path;
//!
//! fn main() -> Result<(), ConfigError> {
//!     let config = EndpointConfig::load(Path::new("endpoint.toml"))?;
//!     config.validate()?;
//!     println!("Device: {}", config.rdma.device);
//!     Ok(())
//! }
//! ```

use crate::consts::{
    DEFAULT_CQ_DEPTH, DEFAULT_DEVICE, DEFAULT_HANDSHAKE_TIMEOUT_MS, DEFAULT_IB_PORT,
    DEFAULT_READY_POLL_INTERVAL_MS, DEFAULT_READY_TIMEOUT_MS, DEFAULT_SHM_SIZE, SHM_MAX_SIZE,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Error type for configuration loading operations.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at specified path.
    #[error("Configuration file not found")]
    FileNotFound,

    /// TOML parsing failed.
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}

/// Log level for application logging.
///
/// Uses lowercase serde values for TOML compatibility.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Most verbose, detailed tracing information.
    Trace,
    /// Debug information useful during development.
    Debug,
    /// General information about application operation.
    #[default]
    Info,
    /// Warning messages for potentially problematic situations.
    Warn,
    /// Error messages for serious problems.
    Error,
}

impl LogLevel {
    /// Filter directive understood by `tracing_subscriber::EnvFilter`.
    pub const fn as_directive(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Common configuration fields shared across all applications.
///
/// # TOML Example
///
/// ```toml
/// [shared]
/// log_level = "debug"
/// service_name = "rdma-proxy-0"
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedConfig {
    /// Logging verbosity level.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Application instance identifier.
    pub service_name: String,
}

impl SharedConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if `service_name` is empty.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.is_empty() {
            return Err(ConfigError::ValidationError(
                "service_name cannot be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Transport parameters for one endpoint.
///
/// Field names follow the endpoint's own vocabulary; the historical
/// `ib_*` names are accepted as aliases.
///
/// # TOML Example
///
/// ```toml
/// [rdma]
/// device = "soft"
/// port = 1
/// sgid_index = 0
/// shm_size = 4096
/// connect_using_rdma = true
/// listen_info_file_path = "/tmp/rdma.info"
/// listen_ready_file_path = "/tmp/rdma.ready"
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RdmaConfig {
    /// Name of the RDMA device to open.
    #[serde(default = "default_device", alias = "ib_devname")]
    pub device: String,

    /// Physical port index on the device (1-based).
    #[serde(default = "default_port", alias = "ib_port")]
    pub port: u8,

    /// GID table index used for addressing.
    #[serde(default, alias = "ib_sgid_idx")]
    pub sgid_index: u8,

    /// Size of the shared memory region in bytes.
    #[serde(default = "default_shm_size")]
    pub shm_size: usize,

    /// Carry data over a dedicated queue-pair link (`true`) or fall back to
    /// the rendezvous socket (`false`).
    #[serde(default = "default_true", alias = "ib_connect")]
    pub connect_using_rdma: bool,

    /// File receiving the listener's bound address.
    #[serde(default)]
    pub listen_info_file_path: Option<PathBuf>,

    /// Marker file created once the listener accepts connections.
    #[serde(default)]
    pub listen_ready_file_path: Option<PathBuf>,

    /// Socket timeout for the out-of-band exchange, in milliseconds.
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,

    /// How long a connector waits for the ready marker, in milliseconds.
    #[serde(default = "default_ready_timeout_ms")]
    pub ready_timeout_ms: u64,

    /// Ready marker polling interval, in milliseconds.
    #[serde(default = "default_ready_poll_interval_ms")]
    pub ready_poll_interval_ms: u64,

    /// Completion queue depth per connection.
    #[serde(default = "default_cq_depth")]
    pub cq_depth: usize,
}

fn default_device() -> String {
    DEFAULT_DEVICE.to_string()
}

fn default_port() -> u8 {
    DEFAULT_IB_PORT
}

fn default_shm_size() -> usize {
    DEFAULT_SHM_SIZE
}

fn default_true() -> bool {
    true
}

fn default_handshake_timeout_ms() -> u64 {
    DEFAULT_HANDSHAKE_TIMEOUT_MS
}

fn default_ready_timeout_ms() -> u64 {
    DEFAULT_READY_TIMEOUT_MS
}

fn default_ready_poll_interval_ms() -> u64 {
    DEFAULT_READY_POLL_INTERVAL_MS
}

fn default_cq_depth() -> usize {
    DEFAULT_CQ_DEPTH
}

impl Default for RdmaConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            port: DEFAULT_IB_PORT,
            sgid_index: 0,
            shm_size: DEFAULT_SHM_SIZE,
            connect_using_rdma: true,
            listen_info_file_path: None,
            listen_ready_file_path: None,
            handshake_timeout_ms: DEFAULT_HANDSHAKE_TIMEOUT_MS,
            ready_timeout_ms: DEFAULT_READY_TIMEOUT_MS,
            ready_poll_interval_ms: DEFAULT_READY_POLL_INTERVAL_MS,
            cq_depth: DEFAULT_CQ_DEPTH,
        }
    }
}

impl RdmaConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if:
    /// - `device` is empty
    /// - `port` is 0
    /// - `shm_size` is 0 or larger than `SHM_MAX_SIZE`
    /// - any timeout or `cq_depth` is 0
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.device.is_empty() {
            return Err(ConfigError::ValidationError(
                "device cannot be empty".to_string(),
            ));
        }
        if self.port == 0 {
            return Err(ConfigError::ValidationError(
                "port numbers start at 1".to_string(),
            ));
        }
        if self.shm_size == 0 || self.shm_size > SHM_MAX_SIZE {
            return Err(ConfigError::ValidationError(format!(
                "shm_size {} outside 1..={}",
                self.shm_size, SHM_MAX_SIZE
            )));
        }
        if self.handshake_timeout_ms == 0
            || self.ready_timeout_ms == 0
            || self.ready_poll_interval_ms == 0
        {
            return Err(ConfigError::ValidationError(
                "timeouts must be non-zero".to_string(),
            ));
        }
        if self.cq_depth == 0 {
            return Err(ConfigError::ValidationError(
                "cq_depth must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Socket timeout for the out-of-band exchange.
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }

    /// Upper bound for waiting on the listener's ready marker.
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    /// Ready marker polling interval.
    pub fn ready_poll_interval(&self) -> Duration {
        Duration::from_millis(self.ready_poll_interval_ms)
    }
}

/// Complete configuration file of an endpoint process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    /// Common application settings.
    pub shared: SharedConfig,

    /// Transport parameters.
    #[serde(default)]
    pub rdma: RdmaConfig,
}

impl EndpointConfig {
    /// Configuration with default transport parameters.
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            shared: SharedConfig {
                log_level: LogLevel::default(),
                service_name: service_name.into(),
            },
            rdma: RdmaConfig::default(),
        }
    }

    /// Validate every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.shared.validate()?;
        self.rdma.validate()
    }
}

/// Trait for loading configuration from TOML files.
///
/// # Contract
///
/// - Returns `ConfigError::FileNotFound` if the file does not exist
/// - Returns `ConfigError::ParseError` if TOML syntax is invalid
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a TOML file.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ConfigError::FileNotFound
            } else {
                ConfigError::ParseError(e.to_string())
            }
        })?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

// Blanket implementation for all types that implement DeserializeOwned.
impl<T: serde::de::DeserializeOwned> ConfigLoader for T {}
