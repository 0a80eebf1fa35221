//! RDMA Common Library
//!
//! This crate provides shared constants and configuration loading utilities
//! for the RDMA transport workspace crates.
//!
//! # Module Structure
//!
//! - [`consts`] - Region limits, rendezvous wire constants and defaults
//! - [`config`] - Configuration loading traits and types
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! ```rust
//! use rdma_common::consts::SHM_MAX_SIZE;
//! use rdma_common::config::{ConfigLoader, EndpointConfig};
//! ```

pub mod config;
pub mod consts;
pub mod prelude;
