//! WebAssembly module compilation.
//!
//! This module provides [`CompiledModule`], a wrapper around Wasmtime's [`Module`]
//! that validates and compiles the guest and inspects its asyncify surface.

use std::hash::{DefaultHasher, Hash, Hasher};
use std::path::Path;
use std::time::Instant;

use tracing::{info, instrument};
use wasmtime::{Engine, ExternType, MemoryType, Module};

use vmbridge_common::BridgeError;

use crate::asyncify::CONTROL_EXPORTS;

/// A compiled guest module.
///
/// Wraps a Wasmtime [`Module`] with the hash of its source bytes for
/// logging and debugging.
#[derive(Clone)]
pub struct CompiledModule {
    /// The compiled Wasmtime module.
    inner: Module,

    /// Hash of the original Wasm bytes.
    content_hash: String,

    /// When this module was compiled.
    compiled_at: Instant,
}

impl CompiledModule {
    /// Compile a module from WebAssembly bytes.
    ///
    /// # Errors
    ///
    /// Returns an error if compilation fails (e.g., invalid Wasm).
    #[instrument(skip(engine, bytes), fields(bytes_len = bytes.len()))]
    pub fn from_bytes(engine: &Engine, bytes: &[u8]) -> Result<Self, BridgeError> {
        let start = Instant::now();

        Self::validate_wasm_header(bytes)?;

        let module = Module::new(engine, bytes).map_err(|e| {
            BridgeError::compilation_failed(format!("Module compilation failed: {e}"))
        })?;

        let content_hash = compute_hash(bytes);

        info!(
            content_hash = %content_hash,
            duration_ms = start.elapsed().as_millis(),
            "Guest module compiled"
        );

        Ok(Self {
            inner: module,
            content_hash,
            compiled_at: Instant::now(),
        })
    }

    /// Read and compile a module from disk.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or does not compile.
    #[instrument(skip(engine, path))]
    pub fn from_file(engine: &Engine, path: impl AsRef<Path>) -> Result<Self, BridgeError> {
        let bytes = std::fs::read(path.as_ref())?;
        Self::from_bytes(engine, &bytes)
    }

    /// Compile a module from WAT (WebAssembly Text Format).
    ///
    /// This is primarily for testing purposes.
    #[instrument(skip(engine, wat))]
    pub fn from_wat(engine: &Engine, wat: &str) -> Result<Self, BridgeError> {
        let start = Instant::now();

        let module = Module::new(engine, wat).map_err(|e| {
            BridgeError::compilation_failed(format!("WAT compilation failed: {e}"))
        })?;

        let content_hash = compute_hash(wat.as_bytes());

        info!(
            content_hash = %content_hash,
            duration_ms = start.elapsed().as_millis(),
            "WAT module compiled"
        );

        Ok(Self {
            inner: module,
            content_hash,
            compiled_at: Instant::now(),
        })
    }

    /// Names of the asyncify control exports this module lacks.
    pub fn missing_control_exports(&self) -> Vec<&'static str> {
        CONTROL_EXPORTS
            .iter()
            .copied()
            .filter(|name| {
                !matches!(
                    self.inner.get_export(name),
                    Some(ExternType::Func(_))
                )
            })
            .collect()
    }

    /// Check whether the module was built with the asyncify transform.
    pub fn is_asyncified(&self) -> bool {
        self.missing_control_exports().is_empty()
    }

    /// Check whether the module exports its linear memory as `memory`.
    pub fn exports_memory(&self) -> bool {
        matches!(self.inner.get_export("memory"), Some(ExternType::Memory(_)))
    }

    /// The memory type the module imports, if it imports one.
    pub fn imported_memory(&self) -> Option<(String, String, MemoryType)> {
        self.inner.imports().find_map(|import| match import.ty() {
            ExternType::Memory(ty) => Some((
                import.module().to_string(),
                import.name().to_string(),
                ty,
            )),
            _ => None,
        })
    }

    /// Get the content hash of the original Wasm bytes.
    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    /// Get when this module was compiled.
    pub fn compiled_at(&self) -> Instant {
        self.compiled_at
    }

    /// Get the inner Wasmtime module.
    pub fn as_module(&self) -> &Module {
        &self.inner
    }

    /// Validate WebAssembly header (magic number).
    fn validate_wasm_header(bytes: &[u8]) -> Result<(), BridgeError> {
        if bytes.len() < 8 {
            return Err(BridgeError::compilation_failed(
                "Invalid Wasm: file too small",
            ));
        }

        // Check magic number: \0asm
        if &bytes[0..4] != b"\0asm" {
            return Err(BridgeError::compilation_failed(
                "Invalid Wasm: bad magic number",
            ));
        }

        Ok(())
    }
}

impl std::fmt::Debug for CompiledModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledModule")
            .field("content_hash", &self.content_hash)
            .field("is_asyncified", &self.is_asyncified())
            .finish_non_exhaustive()
    }
}

/// Compute a hash of the given bytes.
fn compute_hash(bytes: &[u8]) -> String {
    let mut hasher = DefaultHasher::new();
    bytes.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}
