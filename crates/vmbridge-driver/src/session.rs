//! Session lifecycle.
//!
//! A [`Session`] owns everything that outlives a single guest: the engine,
//! the validated configuration and the linker with every host import
//! installed. [`Session::start`] instantiates a guest against it and splits
//! the result into the [`CoreDriver`] that runs it and the [`SessionHandle`]
//! the host uses to talk to it. Dropping both shuts the session down.

use std::path::Path;

use tokio::sync::watch;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use wasmtime::Linker;

use vmbridge_common::{BridgeConfig, BridgeError, HostFunctionError};
use vmbridge_core::{
    BridgeContext, CompiledModule, GuestInstance, ImportTable, InputSender, OutputReceiver,
    WasmEngine, create_store,
};
use vmbridge_host::register_all;

use crate::driver::CoreDriver;

/// Shared setup for running guests.
pub struct Session {
    config: BridgeConfig,
    engine: WasmEngine,
    linker: Linker<BridgeContext>,
}

impl Session {
    /// Validate `config`, create the engine and install the host imports.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or the engine
    /// cannot be created.
    #[instrument(skip(config))]
    pub fn new(config: BridgeConfig) -> Result<Self, BridgeError> {
        config.validate()?;

        let engine = WasmEngine::new(&config.engine)?;

        let mut imports = ImportTable::new();
        register_all(&mut imports, engine.inner());

        let mut linker = Linker::new(engine.inner());
        imports.install(&mut linker)?;

        Ok(Self {
            config,
            engine,
            linker,
        })
    }

    /// The session configuration.
    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// The session's engine.
    pub fn engine(&self) -> &WasmEngine {
        &self.engine
    }

    /// Compile a guest from a `.wasm` file.
    pub fn load_file(&self, path: impl AsRef<Path>) -> Result<CompiledModule, BridgeError> {
        CompiledModule::from_file(self.engine.inner(), path)
    }

    /// Compile a guest from Wasm bytes.
    pub fn load_bytes(&self, bytes: &[u8]) -> Result<CompiledModule, BridgeError> {
        CompiledModule::from_bytes(self.engine.inner(), bytes)
    }

    /// Compile a guest from WAT text.
    pub fn load_wat(&self, wat: &str) -> Result<CompiledModule, BridgeError> {
        CompiledModule::from_wat(self.engine.inner(), wat)
    }

    /// Instantiate and initialize `module`.
    ///
    /// Every call starts an independent guest with its own store, bridge
    /// state and I/O channels.
    ///
    /// # Errors
    ///
    /// Returns an error if instantiation or bridge initialization fails, or
    /// the guest lacks the configured step export.
    #[instrument(skip_all, fields(session_id = tracing::field::Empty))]
    pub fn start(
        &self,
        module: &CompiledModule,
    ) -> Result<(CoreDriver, SessionHandle), BridgeError> {
        let session_id = Uuid::new_v4().to_string();
        tracing::Span::current().record("session_id", session_id.as_str());

        let missing = module.missing_control_exports();
        if !missing.is_empty() {
            warn!(?missing, "Guest was not built with the asyncify transform");
        }

        let (store, channels) = create_store(&self.engine, &self.config, session_id.clone());
        let guest =
            GuestInstance::instantiate(&self.linker, module, store, &self.config.asyncify)?;
        let driver = CoreDriver::new(guest, &self.config.driver)?;

        info!(
            sentinel = %self.config.io.sentinel,
            keydown_policy = ?self.config.io.keydown_policy,
            quantum = self.config.driver.quantum,
            "Session started"
        );

        let handle = SessionHandle {
            session_id,
            input: channels.input,
            output: channels.output,
            ready: channels.ready,
        };
        Ok((driver, handle))
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// The host's side of a running guest.
#[derive(Debug)]
pub struct SessionHandle {
    session_id: String,
    input: InputSender,
    output: OutputReceiver,
    ready: watch::Receiver<bool>,
}

impl SessionHandle {
    /// Unique identifier of this guest.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Sender for input codes; clone it to feed input from another thread.
    pub fn input(&self) -> &InputSender {
        &self.input
    }

    /// Queue every character of `text` as guest input.
    pub fn send_str(&self, text: &str) -> Result<(), HostFunctionError> {
        self.input.send_str(text)
    }

    /// Next output code, waiting if none is available yet.
    ///
    /// Returns `None` once the guest's store has been dropped.
    pub async fn recv_output(&mut self) -> Option<u32> {
        self.output.recv().await
    }

    /// Next output code if one is available now.
    pub fn try_recv_output(&mut self) -> Option<u32> {
        self.output.try_recv().ok()
    }

    /// Returns `true` once the readiness sentinel has been written.
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Wait until the guest is ready.
    ///
    /// # Errors
    ///
    /// Returns [`HostFunctionError::ChannelClosed`] if the guest was dropped
    /// before it became ready.
    pub async fn wait_ready(&mut self) -> Result<(), HostFunctionError> {
        self.ready
            .wait_for(|ready| *ready)
            .await
            .map(|_| ())
            .map_err(|_| HostFunctionError::channel_closed("ready"))
    }

    /// Split into the input sender, output receiver and readiness receiver.
    pub fn into_parts(self) -> (InputSender, OutputReceiver, watch::Receiver<bool>) {
        (self.input, self.output, self.ready)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_creation() {
        let session = Session::new(BridgeConfig::default()).unwrap();
        assert_eq!(session.config().driver.quantum, 30_000);
    }

    #[test]
    fn test_session_rejects_invalid_config() {
        let mut config = BridgeConfig::default();
        config.driver.quantum = 0;

        let err = Session::new(config).unwrap_err();
        assert!(matches!(err, BridgeError::InvalidConfig { .. }));
    }

    #[test]
    fn test_load_wat_uses_session_engine() {
        let session = Session::new(BridgeConfig::default()).unwrap();
        let module = session.load_wat(r#"(module (func (export "step")))"#).unwrap();

        assert!(!module.is_asyncified());
    }

    #[test]
    fn test_start_requires_control_exports() {
        let session = Session::new(BridgeConfig::default()).unwrap();
        let module = session
            .load_wat(r#"(module (memory (export "memory") 1) (func (export "step")))"#)
            .unwrap();

        let err = session.start(&module).unwrap_err();
        assert!(matches!(err, BridgeError::ExportNotFound { .. }));
    }
}
