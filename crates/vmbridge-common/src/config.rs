//! Configuration structures for vmbridge.
//!
//! This module defines configuration options for each layer of the bridge:
//! - [`BridgeConfig`]: Top-level configuration containing all settings
//! - [`EngineConfig`]: Wasmtime engine settings
//! - [`AsyncifyConfig`]: Control offset and scratch region of the unwind/rewind protocol
//! - [`IoConfig`]: Serial device behavior (sentinel, keydown policy)
//! - [`DriverConfig`]: Run loop settings (quantum, step export)

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::BridgeError;

/// Top-level bridge configuration.
///
/// Every section falls back to its defaults, so an empty TOML table or JSON
/// object is a valid configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct BridgeConfig {
    /// Wasmtime engine configuration.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Asyncify control header and scratch region.
    #[serde(default)]
    pub asyncify: AsyncifyConfig,

    /// Serial device configuration.
    #[serde(default)]
    pub io: IoConfig,

    /// Run loop configuration.
    #[serde(default)]
    pub driver: DriverConfig,
}

impl BridgeConfig {
    /// Check the cross-field invariants of every section.
    pub fn validate(&self) -> Result<(), BridgeError> {
        self.asyncify.validate()?;
        self.io.validate()?;
        self.driver.validate()?;
        debug!(
            data_addr = self.asyncify.data_addr,
            scratch_start = self.asyncify.scratch_start,
            scratch_end = self.asyncify.scratch_end,
            quantum = self.driver.quantum,
            "Bridge configuration validated"
        );
        Ok(())
    }
}

/// Wasmtime engine configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Enable the pooling allocator.
    ///
    /// Only one guest runs per bridge, so this is off by default.
    #[serde(default)]
    pub pooling_allocator: bool,

    /// Maximum linear memory of the guest in megabytes.
    ///
    /// Only effective when `pooling_allocator` is enabled. Emulated cores
    /// carry their whole RAM image in linear memory.
    #[serde(default = "defaults::instance_memory_mb")]
    pub instance_memory_mb: u32,

    /// Optimize generated code for speed.
    #[serde(default = "defaults::cranelift_opt")]
    pub cranelift_opt: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pooling_allocator: false,
            instance_memory_mb: defaults::instance_memory_mb(),
            cranelift_opt: defaults::cranelift_opt(),
        }
    }
}

/// Asyncify control header configuration.
///
/// The header is two little-endian 32-bit words at `data_addr` holding
/// `(scratch_start, scratch_end)`. The guest runtime serializes its call
/// stack into `[scratch_start, scratch_end)` during an unwind. The bridge
/// cannot see guest stack depth: overflowing the region is an unrecoverable
/// guest fault, equivalent to exhausting a fixed-depth call stack.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AsyncifyConfig {
    /// Byte offset of the control header in linear memory.
    #[serde(default = "defaults::data_addr")]
    pub data_addr: u32,

    /// First byte of the scratch region.
    #[serde(default = "defaults::scratch_start")]
    pub scratch_start: u32,

    /// One past the last byte of the scratch region.
    #[serde(default = "defaults::scratch_end")]
    pub scratch_end: u32,
}

impl Default for AsyncifyConfig {
    fn default() -> Self {
        Self {
            data_addr: defaults::data_addr(),
            scratch_start: defaults::scratch_start(),
            scratch_end: defaults::scratch_end(),
        }
    }
}

impl AsyncifyConfig {
    /// Size of the control header in bytes.
    pub const HEADER_LEN: u32 = 8;

    /// Scratch region capacity in bytes.
    pub fn scratch_capacity(&self) -> u32 {
        self.scratch_end.saturating_sub(self.scratch_start)
    }

    /// Check that the header and the scratch region do not overlap and the
    /// region is non-empty.
    pub fn validate(&self) -> Result<(), BridgeError> {
        let header_end = self
            .data_addr
            .checked_add(Self::HEADER_LEN)
            .ok_or_else(|| BridgeError::invalid_config("asyncify.data_addr overflows"))?;

        if self.scratch_start < header_end && self.scratch_end > self.data_addr {
            return Err(BridgeError::invalid_config(format!(
                "asyncify scratch region {}..{} overlaps the control header at {}",
                self.scratch_start, self.scratch_end, self.data_addr
            )));
        }

        if self.scratch_end <= self.scratch_start {
            return Err(BridgeError::invalid_config(format!(
                "asyncify scratch region {}..{} is empty",
                self.scratch_start, self.scratch_end
            )));
        }

        Ok(())
    }
}

/// How the `keydown` import behaves when no input is queued.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum KeydownPolicy {
    /// Return `false` immediately.
    Poll,
    /// Suspend the guest through asyncify for a bounded number of
    /// scheduler yields, then report whatever is queued.
    #[default]
    Suspend,
}

/// Serial device configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IoConfig {
    /// Output substring that marks the guest as ready.
    #[serde(default = "defaults::sentinel")]
    pub sentinel: String,

    /// Behavior of `keydown` on an empty input queue.
    #[serde(default)]
    pub keydown_policy: KeydownPolicy,

    /// Scheduler yields a suspended `keydown` waits before giving up.
    #[serde(default = "defaults::keydown_poll_attempts")]
    pub keydown_poll_attempts: u32,
}

impl Default for IoConfig {
    fn default() -> Self {
        Self {
            sentinel: defaults::sentinel(),
            keydown_policy: KeydownPolicy::default(),
            keydown_poll_attempts: defaults::keydown_poll_attempts(),
        }
    }
}

impl IoConfig {
    fn validate(&self) -> Result<(), BridgeError> {
        if self.sentinel.is_empty() {
            return Err(BridgeError::invalid_config("io.sentinel must not be empty"));
        }
        if self.keydown_poll_attempts == 0 {
            return Err(BridgeError::invalid_config(
                "io.keydown_poll_attempts must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Run loop configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DriverConfig {
    /// Steps executed back-to-back between scheduler yields once running.
    #[serde(default = "defaults::quantum")]
    pub quantum: u32,

    /// Name of the guest export that advances the core by one step.
    #[serde(default = "defaults::step_export")]
    pub step_export: String,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            quantum: defaults::quantum(),
            step_export: defaults::step_export(),
        }
    }
}

impl DriverConfig {
    fn validate(&self) -> Result<(), BridgeError> {
        if self.quantum == 0 {
            return Err(BridgeError::invalid_config("driver.quantum must be at least 1"));
        }
        Ok(())
    }
}

/// Default value functions for serde.
mod defaults {
    pub const fn instance_memory_mb() -> u32 {
        1024
    }

    pub const fn cranelift_opt() -> bool {
        true
    }

    pub const fn data_addr() -> u32 {
        16
    }

    pub const fn scratch_start() -> u32 {
        24
    }

    pub const fn scratch_end() -> u32 {
        1024
    }

    pub fn sentinel() -> String {
        "login:".to_string()
    }

    pub const fn keydown_poll_attempts() -> u32 {
        1
    }

    pub const fn quantum() -> u32 {
        30_000
    }

    pub fn step_export() -> String {
        "step".to_string()
    }
}
