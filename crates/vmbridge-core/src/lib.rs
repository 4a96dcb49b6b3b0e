//! Core Wasmtime runtime for vmbridge.
//!
//! This crate lets a synchronous, asyncify-transformed guest call host
//! imports whose results arrive later:
//! - [`WasmEngine`]: Configured Wasmtime engine
//! - [`CompiledModule`]: Compiled guest module wrapper
//! - [`asyncify`]: Unwind/rewind state machine and the import/export wrappers
//! - [`ImportTable`] / [`ExportTable`]: Memoized registration of wrapped functions
//! - [`BridgeContext`]: Per-session store data (bridge state, serial device, clock)
//! - [`GuestInstance`]: Instantiation, initialization and bridged calls
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                     WasmEngine                          │
//! │  - Compilation settings                                 │
//! │  - Synchronous execution (no fibers)                    │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │        CompiledModule + ImportTable → Linker            │
//! │  - Host imports wrapped for suspension                  │
//! └─────────────────────────────────────────────────────────┘
//!                            │
//!                            ▼
//! ┌─────────────────────────────────────────────────────────┐
//! │         GuestInstance (Store<BridgeContext>)            │
//! │  - Linear memory + asyncify control header              │
//! │  - Single pending-value slot                            │
//! │  - Exports called through call_wrapped                  │
//! └─────────────────────────────────────────────────────────┘
//! ```

pub mod asyncify;
pub mod engine;
pub mod instance;
pub mod io;
pub mod memory;
pub mod module;
pub mod store;
pub mod table;

pub use asyncify::{Asyncify, AsyncifyExports, AsyncifyView, ExecutionState, HostReturn};
pub use engine::WasmEngine;
pub use instance::GuestInstance;
pub use io::{InputQueue, InputSender, OutputAccumulator, OutputReceiver};
pub use memory::{LinearMemory, ScratchRegion};
pub use module::CompiledModule;
pub use store::{BridgeChannels, BridgeContext, BridgeMetrics, create_store};
pub use table::{ExportHandle, ExportTable, ImportHandle, ImportTable};
