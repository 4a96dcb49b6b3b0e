//! Configuration file structures for vmbridge.
//!
//! This module defines structures for TOML configuration files:
//! - [`ConfigFile`]: Top-level configuration file structure
//! - [`GuestEntry`]: The guest module to run

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::BridgeConfig;

/// Top-level configuration file structure.
///
/// # Example
///
/// ```toml
/// [guest]
/// path = "./out.wasm"
///
/// [bridge.asyncify]
/// data_addr = 16
/// scratch_start = 24
/// scratch_end = 1024
///
/// [bridge.io]
/// sentinel = "login:"
/// keydown_policy = "suspend"
///
/// [bridge.driver]
/// quantum = 30_000
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConfigFile {
    /// Bridge configuration (engine, asyncify, io and driver settings).
    #[serde(default)]
    pub bridge: BridgeConfig,

    /// Guest module to load at startup.
    #[serde(default)]
    pub guest: Option<GuestEntry>,
}

impl ConfigFile {
    /// Load configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigFileError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigFileError::Io {
            path: path.as_ref().display().to_string(),
            source: e,
        })?;

        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed as TOML.
    pub fn from_toml(content: &str) -> Result<Self, ConfigFileError> {
        toml::from_str(content).map_err(|e| ConfigFileError::Parse {
            message: e.to_string(),
        })
    }
}

/// The guest module entry.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GuestEntry {
    /// Path to the asyncified WebAssembly module.
    pub path: String,
}

/// Configuration file errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigFileError {
    /// Failed to read configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse configuration file.
    #[error("Failed to parse config file: {message}")]
    Parse { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KeydownPolicy;

    #[test]
    fn test_default_config_file() {
        let config = ConfigFile::default();

        assert!(config.guest.is_none());
        assert_eq!(config.bridge.io.sentinel, "login:");
        assert_eq!(config.bridge.driver.quantum, 30_000);
    }

    #[test]
    fn test_parse_minimal_config() {
        let toml = r#"
            [guest]
            path = "./out.wasm"
        "#;

        let config = ConfigFile::from_toml(toml).unwrap();

        assert_eq!(config.guest.unwrap().path, "./out.wasm");
        // Defaults applied
        assert_eq!(config.bridge.asyncify.scratch_end, 1024);
    }

    #[test]
    fn test_parse_full_config() {
        let toml = r##"
            [guest]
            path = "./linux.wasm"

            [bridge.engine]
            pooling_allocator = true
            instance_memory_mb = 2048

            [bridge.asyncify]
            data_addr = 32
            scratch_start = 64
            scratch_end = 8192

            [bridge.io]
            sentinel = "# "
            keydown_policy = "poll"
            keydown_poll_attempts = 4

            [bridge.driver]
            quantum = 10_000
            step_export = "tick"
        "##;

        let config = ConfigFile::from_toml(toml).unwrap();

        assert_eq!(config.guest.unwrap().path, "./linux.wasm");
        assert!(config.bridge.engine.pooling_allocator);
        assert_eq!(config.bridge.engine.instance_memory_mb, 2048);
        assert_eq!(config.bridge.asyncify.data_addr, 32);
        assert_eq!(config.bridge.asyncify.scratch_start, 64);
        assert_eq!(config.bridge.asyncify.scratch_end, 8192);
        assert_eq!(config.bridge.io.sentinel, "# ");
        assert_eq!(config.bridge.io.keydown_policy, KeydownPolicy::Poll);
        assert_eq!(config.bridge.io.keydown_poll_attempts, 4);
        assert_eq!(config.bridge.driver.quantum, 10_000);
        assert_eq!(config.bridge.driver.step_export, "tick");
        assert!(config.bridge.validate().is_ok());
    }

    #[test]
    fn test_parse_invalid_toml() {
        let invalid = "this is not valid toml [";
        let result = ConfigFile::from_toml(invalid);
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_file() {
        let result = ConfigFile::from_file("/nonexistent/vmbridge.toml");
        assert!(matches!(result, Err(ConfigFileError::Io { .. })));
    }
}
