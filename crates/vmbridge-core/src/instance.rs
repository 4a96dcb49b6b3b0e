//! Guest instance lifecycle.
//!
//! [`GuestInstance`] takes a compiled module through instantiation and the
//! bridge's one-time initialization:
//!
//! 1. Provide a host memory if the module imports one
//! 2. Instantiate with the host imports on the linker
//! 3. Resolve linear memory (export `memory`, else the host memory)
//! 4. Write the asyncify control header
//! 5. Bind the control exports and wrap every other function export
//!
//! After that, guest code is only ever entered through [`GuestInstance::call`].

use std::time::Instant;

use tracing::{debug, info, instrument};
use wasmtime::{Instance, Linker, Memory, Store, Val};

use vmbridge_common::{AsyncifyConfig, BridgeError};

use crate::CompiledModule;
use crate::asyncify::{AsyncifyExports, AsyncifyView, ExecutionState, GET_STATE, call_wrapped};
use crate::memory::{LinearMemory, ScratchRegion};
use crate::store::BridgeContext;
use crate::table::{ExportHandle, ExportTable};

/// An initialized guest, ready to be called through the bridge.
pub struct GuestInstance {
    store: Store<BridgeContext>,
    instance: Instance,
    memory: LinearMemory,
    scratch: ScratchRegion,
    exports: ExportTable,
}

impl GuestInstance {
    /// Instantiate `module` and initialize the bridge for it.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Instantiation fails (e.g. an import is not on the linker)
    /// - No linear memory can be found ([`BridgeError::MemoryNotFound`])
    /// - The scratch region does not fit in memory
    /// - An asyncify control export is missing ([`BridgeError::ExportNotFound`])
    #[instrument(skip_all, fields(session_id = %store.data().session_id, module = %module.content_hash()))]
    pub fn instantiate(
        linker: &Linker<BridgeContext>,
        module: &CompiledModule,
        mut store: Store<BridgeContext>,
        config: &AsyncifyConfig,
    ) -> Result<Self, BridgeError> {
        let start = Instant::now();

        let mut linker = linker.clone();
        let host_memory = match module.imported_memory() {
            Some((module_name, name, ty)) => {
                let memory = Memory::new(&mut store, ty).map_err(|e| {
                    BridgeError::instantiation_failed(format!("Failed to create memory: {e}"))
                })?;
                linker
                    .define(&store, &module_name, &name, memory)
                    .map_err(|e| {
                        BridgeError::instantiation_failed(format!(
                            "Failed to define {module_name}.{name}: {e}"
                        ))
                    })?;
                debug!(module = %module_name, name = %name, "Providing host memory");
                Some(memory)
            }
            None => None,
        };

        let instance = linker
            .instantiate(&mut store, module.as_module())
            .map_err(|e| BridgeError::instantiation_failed(format!("Instantiation failed: {e}")))?;

        let memory = instance
            .get_memory(&mut store, "memory")
            .or(host_memory)
            .map(LinearMemory::new)
            .ok_or(BridgeError::MemoryNotFound)?;

        let scratch = memory.write_scratch_header(&mut store, config)?;

        let controls = AsyncifyExports::from_instance(&mut store, &instance)?;
        store.data_mut().asyncify().bind(controls);

        let exports = ExportTable::wrap_all(&mut store, &instance);

        info!(
            exports = exports.len(),
            memory_bytes = memory.size(&store),
            scratch_bytes = scratch.capacity(),
            duration_ms = start.elapsed().as_millis(),
            "Guest initialized"
        );

        Ok(Self {
            store,
            instance,
            memory,
            scratch,
            exports,
        })
    }

    /// Handle of a wrapped export.
    pub fn export(&self, name: &str) -> Option<ExportHandle> {
        self.exports.handle(name)
    }

    /// Handle of a wrapped export, or [`BridgeError::ExportNotFound`].
    pub fn require_export(&self, name: &str) -> Result<ExportHandle, BridgeError> {
        self.export(name)
            .ok_or_else(|| BridgeError::export_not_found(name))
    }

    /// Call a wrapped export, suspending and resuming it as often as its
    /// imports require.
    ///
    /// Resolves with the export's results once it has run to completion.
    pub async fn call(
        &mut self,
        handle: ExportHandle,
        params: &[Val],
    ) -> Result<Vec<Val>, BridgeError> {
        let export = self
            .exports
            .get(handle)
            .ok_or_else(|| BridgeError::export_not_found(format!("{handle:?}")))?;
        let func = export.func();
        let mut results = vec![Val::I32(0); export.ty().results().len()];

        call_wrapped(&mut self.store, func, params, &mut results).await?;
        Ok(results)
    }

    /// Call a wrapped export by name.
    pub async fn call_export(
        &mut self,
        name: &str,
        params: &[Val],
    ) -> Result<Vec<Val>, BridgeError> {
        let handle = self.require_export(name)?;
        self.call(handle, params).await
    }

    /// The guest's current asyncify state.
    pub fn state(&mut self) -> Result<ExecutionState, BridgeError> {
        let controls = self
            .store
            .data_mut()
            .asyncify()
            .exports()
            .cloned()
            .ok_or_else(|| BridgeError::export_not_found(GET_STATE))?;
        controls.state(&mut self.store)
    }

    /// Read the asyncify control header back from memory.
    pub fn scratch_header(&self) -> Result<ScratchRegion, BridgeError> {
        let data_addr = self.store.data().bridge().data_addr();
        self.memory.read_scratch_header(&self.store, data_addr)
    }

    /// The scratch region written at initialization.
    pub fn scratch(&self) -> ScratchRegion {
        self.scratch
    }

    /// The guest's linear memory.
    pub fn memory(&self) -> LinearMemory {
        self.memory
    }

    /// The wrapped exports.
    pub fn exports(&self) -> &ExportTable {
        &self.exports
    }

    /// The raw Wasmtime instance.
    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    /// The session's store data.
    pub fn context(&self) -> &BridgeContext {
        self.store.data()
    }

    /// Mutable access to the session's store data.
    pub fn context_mut(&mut self) -> &mut BridgeContext {
        self.store.data_mut()
    }

    /// The underlying store.
    pub fn store(&self) -> &Store<BridgeContext> {
        &self.store
    }
}

impl std::fmt::Debug for GuestInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuestInstance")
            .field("context", self.store.data())
            .field("scratch", &self.scratch)
            .field("exports", &self.exports.names().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}
