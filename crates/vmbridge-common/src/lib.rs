//! Common types and errors for vmbridge.
//!
//! This crate provides shared functionality used across the vmbridge workspace:
//! - Error types using `thiserror` for the bridge and its host functions
//! - Configuration structures for the engine, asyncify bridge, I/O and driver
//! - TOML configuration file loading

pub mod config;
pub mod config_file;
pub mod error;

pub use config::{AsyncifyConfig, BridgeConfig, DriverConfig, EngineConfig, IoConfig, KeydownPolicy};
pub use config_file::{ConfigFile, ConfigFileError, GuestEntry};
pub use error::{BridgeError, HostFunctionError};
