//! Endpoint configuration file tests.
//!
//! Covers loading full and minimal `EndpointConfig` files, default filling,
//! unknown field rejection and semantic validation.

use rdma_common::config::{ConfigError, ConfigLoader, EndpointConfig, LogLevel};
use rdma_common::consts::{DEFAULT_DEVICE, DEFAULT_SHM_SIZE};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Write `content` as `endpoint.toml` in `dir` and return its path.
fn write_config(dir: &Path, content: &str) -> PathBuf {
    let path = dir.join("endpoint.toml");
    fs::write(&path, content).unwrap();
    path
}

#[test]
fn full_config_loads() {
    let tmp = TempDir::new().unwrap();
    let path = write_config(
        tmp.path(),
        r#"
[shared]
log_level = "debug"
service_name = "proxy-a"

[rdma]
device = "soft"
port = 1
sgid_index = 2
shm_size = 65536
connect_using_rdma = false
listen_info_file_path = "/tmp/a.info"
listen_ready_file_path = "/tmp/a.ready"
handshake_timeout_ms = 250
ready_timeout_ms = 1000
ready_poll_interval_ms = 5
cq_depth = 64
"#,
    );

    let config = EndpointConfig::load(&path).unwrap();
    config.validate().unwrap();

    assert_eq!(config.shared.log_level, LogLevel::Debug);
    assert_eq!(config.shared.service_name, "proxy-a");
    assert_eq!(config.rdma.sgid_index, 2);
    assert_eq!(config.rdma.shm_size, 65536);
    assert!(!config.rdma.connect_using_rdma);
    assert_eq!(
        config.rdma.listen_info_file_path.as_deref(),
        Some(Path::new("/tmp/a.info"))
    );
    assert_eq!(config.rdma.cq_depth, 64);
}

#[test]
fn missing_rdma_section_uses_defaults() {
    let tmp = TempDir::new().unwrap();
    let path = write_config(
        tmp.path(),
        r#"
[shared]
service_name = "proxy-b"
"#,
    );

    let config = EndpointConfig::load(&path).unwrap();
    config.validate().unwrap();

    assert_eq!(config.shared.log_level, LogLevel::Info);
    assert_eq!(config.rdma.device, DEFAULT_DEVICE);
    assert_eq!(config.rdma.shm_size, DEFAULT_SHM_SIZE);
    assert!(config.rdma.connect_using_rdma);
    assert!(config.rdma.listen_info_file_path.is_none());
    assert!(config.rdma.listen_ready_file_path.is_none());
}

#[test]
fn unknown_rdma_field_rejected() {
    let tmp = TempDir::new().unwrap();
    let path = write_config(
        tmp.path(),
        r#"
[shared]
service_name = "proxy-c"

[rdma]
shm_sise = 4096
"#,
    );

    let result = EndpointConfig::load(&path);
    assert!(matches!(result, Err(ConfigError::ParseError(_))));
}

#[test]
fn zero_region_size_fails_validation() {
    let tmp = TempDir::new().unwrap();
    let path = write_config(
        tmp.path(),
        r#"
[shared]
service_name = "proxy-d"

[rdma]
shm_size = 0
"#,
    );

    let config = EndpointConfig::load(&path).unwrap();
    assert!(matches!(
        config.validate(),
        Err(ConfigError::ValidationError(_))
    ));
}

#[test]
fn empty_service_name_fails_validation() {
    let mut config = EndpointConfig::new("x");
    config.shared.service_name.clear();
    assert!(matches!(
        config.validate(),
        Err(ConfigError::ValidationError(_))
    ));
}
