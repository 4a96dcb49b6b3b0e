//! Error types for vmbridge.
//!
//! This module defines a hierarchy of error types using `thiserror`:
//! - [`BridgeError`]: Top-level errors for the bridge and its run loop
//! - [`HostFunctionError`]: Errors from host import implementations

use std::io;

use thiserror::Error;

/// Top-level bridge errors.
///
/// Apart from configuration and I/O problems, every variant is fatal: the
/// bridge has no recovery path once the asyncify stack protocol is broken or
/// the guest traps.
#[derive(Error, Debug)]
pub enum BridgeError {
    /// The asyncify state was not the one the protocol requires.
    ///
    /// Raised by idle assertions and after stopping an unwind.
    #[error("Invalid async state {actual}, expected {expected}")]
    InvalidState {
        /// Raw state value reported by the guest.
        actual: i32,
        /// Raw state value the protocol required.
        expected: i32,
    },

    /// The guest is rewinding but no resolved value is waiting for it.
    #[error("Rewind observed without a resolved pending value")]
    UnexpectedRewind,

    /// The guest is unwinding but no deferred value was stored.
    #[error("Unwind observed without a pending value")]
    MissingPendingValue,

    /// A host import deferred while another deferred value was outstanding.
    #[error("A deferred value is already pending")]
    PendingValueOccupied,

    /// No linear memory was exported by the guest and none was supplied.
    #[error("Guest has no linear memory (no `memory` export and no imported fallback)")]
    MemoryNotFound,

    /// A required export is missing from the guest instance.
    #[error("Export not found: {name}")]
    ExportNotFound {
        /// Name of the missing export.
        name: String,
    },

    /// A guest memory access fell outside linear memory.
    #[error("Memory access out of bounds: {offset}+{len} (memory size {size})")]
    MemoryOutOfBounds {
        /// Byte offset of the access.
        offset: usize,
        /// Length of the access in bytes.
        len: usize,
        /// Current size of linear memory in bytes.
        size: usize,
    },

    /// WebAssembly compilation failed.
    #[error("Compilation failed: {reason}")]
    CompilationFailed {
        /// Description of the compilation failure.
        reason: String,
    },

    /// Instantiating the guest module failed.
    #[error("Instantiation failed: {reason}")]
    InstantiationFailed {
        /// Description of the instantiation failure.
        reason: String,
    },

    /// A host function returned an error.
    #[error("Host function error: {0}")]
    HostFunction(#[from] HostFunctionError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// A WebAssembly trap occurred during execution.
    #[error("Wasm trap: {message}")]
    Trap {
        /// Description of the trap.
        message: String,
    },

    /// Invalid configuration was provided.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the configuration error.
        reason: String,
    },
}

/// Errors from host import implementations.
#[derive(Error, Debug)]
pub enum HostFunctionError {
    /// `rx` was called with nothing queued.
    ///
    /// Callers must gate every dequeue behind a successful `keydown`.
    #[error("Input queue is empty")]
    InputQueueEmpty,

    /// Invalid argument was passed to a host function.
    #[error("Invalid argument: {reason}")]
    InvalidArgument {
        /// Description of why the argument was invalid.
        reason: String,
    },

    /// The receiving side of a channel has been dropped.
    #[error("Channel closed: {channel}")]
    ChannelClosed {
        /// Which channel was closed.
        channel: String,
    },
}

impl BridgeError {
    /// Create a new `InvalidState` error.
    pub fn invalid_state(actual: i32, expected: i32) -> Self {
        Self::InvalidState { actual, expected }
    }

    /// Create a new `ExportNotFound` error.
    pub fn export_not_found(name: impl Into<String>) -> Self {
        Self::ExportNotFound { name: name.into() }
    }

    /// Create a new `CompilationFailed` error.
    pub fn compilation_failed(reason: impl Into<String>) -> Self {
        Self::CompilationFailed {
            reason: reason.into(),
        }
    }

    /// Create a new `InstantiationFailed` error.
    pub fn instantiation_failed(reason: impl Into<String>) -> Self {
        Self::InstantiationFailed {
            reason: reason.into(),
        }
    }

    /// Create a new `Trap` error.
    pub fn trap(message: impl Into<String>) -> Self {
        Self::Trap {
            message: message.into(),
        }
    }

    /// Create a new `InvalidConfig` error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Returns `true` if this error is a violation of the asyncify stack protocol.
    pub fn is_fatal_protocol(&self) -> bool {
        matches!(
            self,
            Self::InvalidState { .. }
                | Self::UnexpectedRewind
                | Self::MissingPendingValue
                | Self::PendingValueOccupied
        )
    }

    /// Returns `true` if this error was raised while binding a guest instance.
    pub fn is_initialization(&self) -> bool {
        matches!(
            self,
            Self::MemoryNotFound
                | Self::ExportNotFound { .. }
                | Self::MemoryOutOfBounds { .. }
                | Self::InstantiationFailed { .. }
        )
    }
}

impl HostFunctionError {
    /// Create a new `ChannelClosed` error.
    pub fn channel_closed(channel: impl Into<String>) -> Self {
        Self::ChannelClosed {
            channel: channel.into(),
        }
    }
}
