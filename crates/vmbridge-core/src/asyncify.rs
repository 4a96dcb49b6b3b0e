//! Asyncify control-flow bridge.
//!
//! Guests built with Binaryen's asyncify pass can serialize their call stack
//! into linear memory (unwind) and later restore it (rewind). This module uses
//! that to let synchronous guest code call host imports whose results are not
//! available yet:
//!
//! ```text
//!  host                               guest
//!  ────                               ─────
//!  call_wrapped(step) ──────────────▶ step() ─▶ keydown()
//!                                                │ import returns Deferred
//!                     ◀── unwind ─────────────── start_unwind(data_addr)
//!  stop_unwind
//!  value = deferred.await
//!  start_rewind ────────────────────▶ step() ─▶ keydown()
//!                                                │ state == Rewinding:
//!                                                │ stop_rewind, return value
//!                     ◀──────────────────────── step() returns
//! ```
//!
//! Exactly one value can be pending at a time and every entry into guest
//! code outside of a rewind requires the guest to be idle. Any violation is a
//! fatal [`BridgeError`]: the guest stack cannot be trusted afterwards.
//!
//! The scratch region written at initialization bounds how much stack the
//! guest can serialize. Overflowing it is detected (if at all) by the guest
//! runtime, never by the bridge.

use std::fmt;
use std::future::Future;
use std::pin::Pin;

use tracing::{debug, trace};
use wasmtime::{
    AsContextMut, Caller, Extern, Func, FuncType, Instance, Store, Trap, TypedFunc, V128, Val,
    ValType, WasmParams, WasmResults,
};

use vmbridge_common::{AsyncifyConfig, BridgeError, HostFunctionError};

/// Export that reports the current [`ExecutionState`].
pub const GET_STATE: &str = "asyncify_get_state";
/// Export that starts an unwind from the control header.
pub const START_UNWIND: &str = "asyncify_start_unwind";
/// Export that stops an unwind once control is back in the host.
pub const STOP_UNWIND: &str = "asyncify_stop_unwind";
/// Export that starts a rewind from the control header.
pub const START_REWIND: &str = "asyncify_start_rewind";
/// Export that stops a rewind at the suspended call site.
pub const STOP_REWIND: &str = "asyncify_stop_rewind";

/// Every control export an asyncified guest provides.
pub const CONTROL_EXPORTS: [&str; 5] = [
    GET_STATE,
    START_UNWIND,
    STOP_UNWIND,
    START_REWIND,
    STOP_REWIND,
];

/// Returns `true` for the asyncify control exports, which are never wrapped.
pub fn is_control_export(name: &str) -> bool {
    name.starts_with("asyncify_")
}

/// The guest runtime's asyncify state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionState {
    /// Normal execution.
    None,
    /// The guest is serializing its stack into the scratch region.
    Unwinding,
    /// The guest is restoring its stack from the scratch region.
    Rewinding,
}

impl ExecutionState {
    /// Raw value reported by `asyncify_get_state`.
    pub fn as_raw(self) -> i32 {
        match self {
            ExecutionState::None => 0,
            ExecutionState::Unwinding => 1,
            ExecutionState::Rewinding => 2,
        }
    }
}

impl TryFrom<i32> for ExecutionState {
    type Error = BridgeError;

    fn try_from(raw: i32) -> Result<Self, Self::Error> {
        match raw {
            0 => Ok(ExecutionState::None),
            1 => Ok(ExecutionState::Unwinding),
            2 => Ok(ExecutionState::Rewinding),
            other => Err(BridgeError::invalid_state(
                other,
                ExecutionState::None.as_raw(),
            )),
        }
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionState::None => write!(f, "none"),
            ExecutionState::Unwinding => write!(f, "unwinding"),
            ExecutionState::Rewinding => write!(f, "rewinding"),
        }
    }
}

/// A host result that is not available yet.
pub type Deferred = Pin<Box<dyn Future<Output = Option<Val>> + Send + 'static>>;

/// What a host import produced.
pub enum HostReturn {
    /// The result is available now; the guest keeps running.
    Ready(Option<Val>),
    /// The result must be awaited; the guest is suspended until it resolves.
    Deferred(Deferred),
}

impl HostReturn {
    /// An import with no result.
    pub fn unit() -> Self {
        Self::Ready(None)
    }

    /// An immediately available result.
    pub fn value(value: impl Into<Val>) -> Self {
        Self::Ready(Some(value.into()))
    }

    /// A result produced by `future`.
    pub fn deferred<F, V>(future: F) -> Self
    where
        F: Future<Output = V> + Send + 'static,
        V: Into<Val>,
    {
        Self::Deferred(Box::pin(async move { Some(future.await.into()) }))
    }

    /// Returns `true` if the guest has to be suspended for this result.
    pub fn is_deferred(&self) -> bool {
        matches!(self, Self::Deferred(_))
    }
}

impl fmt::Debug for HostReturn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready(value) => f.debug_tuple("Ready").field(value).finish(),
            Self::Deferred(_) => f.write_str("Deferred(..)"),
        }
    }
}

/// The single pending-value slot.
enum PendingValue {
    /// Stored by an import, awaited by the export wrapper.
    Deferred(Deferred),
    /// Awaited, waiting for the rewind to hand it to the import.
    Resolved(Option<Val>),
}

/// Typed handles to the guest's asyncify control exports.
#[derive(Clone)]
pub struct AsyncifyExports {
    get_state: TypedFunc<(), i32>,
    start_unwind: TypedFunc<i32, ()>,
    stop_unwind: TypedFunc<(), ()>,
    start_rewind: TypedFunc<i32, ()>,
    stop_rewind: TypedFunc<(), ()>,
}

impl AsyncifyExports {
    /// Resolve the control exports of an instance.
    pub fn from_instance(
        mut store: impl AsContextMut,
        instance: &Instance,
    ) -> Result<Self, BridgeError> {
        fn get<P: WasmParams, R: WasmResults>(
            store: &mut impl AsContextMut,
            instance: &Instance,
            name: &str,
        ) -> Result<TypedFunc<P, R>, BridgeError> {
            instance
                .get_typed_func::<P, R>(store, name)
                .map_err(|_| BridgeError::export_not_found(name))
        }

        Ok(Self {
            get_state: get(&mut store, instance, GET_STATE)?,
            start_unwind: get(&mut store, instance, START_UNWIND)?,
            stop_unwind: get(&mut store, instance, STOP_UNWIND)?,
            start_rewind: get(&mut store, instance, START_REWIND)?,
            stop_rewind: get(&mut store, instance, STOP_REWIND)?,
        })
    }

    /// Resolve the control exports from inside a host call.
    pub fn from_caller<T: 'static>(caller: &mut Caller<'_, T>) -> Result<Self, BridgeError> {
        fn get<P: WasmParams, R: WasmResults, T: 'static>(
            caller: &mut Caller<'_, T>,
            name: &str,
        ) -> Result<TypedFunc<P, R>, BridgeError> {
            caller
                .get_export(name)
                .and_then(Extern::into_func)
                .ok_or_else(|| BridgeError::export_not_found(name))?
                .typed::<P, R>(&*caller)
                .map_err(|_| BridgeError::export_not_found(name))
        }

        Ok(Self {
            get_state: get(caller, GET_STATE)?,
            start_unwind: get(caller, START_UNWIND)?,
            stop_unwind: get(caller, STOP_UNWIND)?,
            start_rewind: get(caller, START_REWIND)?,
            stop_rewind: get(caller, STOP_REWIND)?,
        })
    }

    /// Query the guest's current state.
    pub fn state(&self, store: impl AsContextMut) -> Result<ExecutionState, BridgeError> {
        let raw = self.get_state.call(store, ()).map_err(into_bridge_error)?;
        ExecutionState::try_from(raw)
    }

    /// Fail unless the guest is idle.
    pub fn assert_idle(&self, store: impl AsContextMut) -> Result<(), BridgeError> {
        match self.state(store)? {
            ExecutionState::None => Ok(()),
            other => Err(BridgeError::invalid_state(
                other.as_raw(),
                ExecutionState::None.as_raw(),
            )),
        }
    }

    /// Begin serializing the guest stack described by the header at `data_addr`.
    #[allow(clippy::cast_possible_wrap)]
    pub fn start_unwind(&self, store: impl AsContextMut, data_addr: u32) -> Result<(), BridgeError> {
        self.start_unwind
            .call(store, data_addr as i32)
            .map_err(into_bridge_error)
    }

    /// End an unwind once control is back in the host.
    pub fn stop_unwind(&self, store: impl AsContextMut) -> Result<(), BridgeError> {
        self.stop_unwind.call(store, ()).map_err(into_bridge_error)
    }

    /// Begin restoring the guest stack described by the header at `data_addr`.
    #[allow(clippy::cast_possible_wrap)]
    pub fn start_rewind(&self, store: impl AsContextMut, data_addr: u32) -> Result<(), BridgeError> {
        self.start_rewind
            .call(store, data_addr as i32)
            .map_err(into_bridge_error)
    }

    /// End a rewind at the suspended call site.
    pub fn stop_rewind(&self, store: impl AsContextMut) -> Result<(), BridgeError> {
        self.stop_rewind.call(store, ()).map_err(into_bridge_error)
    }
}

impl fmt::Debug for AsyncifyExports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncifyExports").finish_non_exhaustive()
    }
}

/// Bridge state kept in the store data.
///
/// Holds the bound control exports, the control offset and the single
/// pending-value slot.
pub struct Asyncify {
    data_addr: u32,
    exports: Option<AsyncifyExports>,
    pending: Option<PendingValue>,
    suspensions: u64,
    resumptions: u64,
}

impl Asyncify {
    /// Create unbound bridge state for the given header location.
    pub fn new(config: &AsyncifyConfig) -> Self {
        Self {
            data_addr: config.data_addr,
            exports: None,
            pending: None,
            suspensions: 0,
            resumptions: 0,
        }
    }

    /// Offset of the control header passed to `start_unwind`/`start_rewind`.
    pub fn data_addr(&self) -> u32 {
        self.data_addr
    }

    /// Bind the control exports of the running instance.
    pub fn bind(&mut self, exports: AsyncifyExports) {
        self.exports = Some(exports);
    }

    /// The bound control exports.
    pub fn exports(&self) -> Option<&AsyncifyExports> {
        self.exports.as_ref()
    }

    /// Returns `true` while a value is stored in the slot.
    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Number of times the guest was suspended.
    pub fn suspensions(&self) -> u64 {
        self.suspensions
    }

    /// Number of resolved values handed back to the guest.
    pub fn resumptions(&self) -> u64 {
        self.resumptions
    }

    /// Store a deferred value; fails if one is already outstanding.
    pub(crate) fn park(&mut self, deferred: Deferred) -> Result<(), BridgeError> {
        if self.pending.is_some() {
            return Err(BridgeError::PendingValueOccupied);
        }
        self.pending = Some(PendingValue::Deferred(deferred));
        self.suspensions += 1;
        Ok(())
    }

    /// Take the deferred value an unwind left behind.
    pub(crate) fn take_deferred(&mut self) -> Result<Deferred, BridgeError> {
        match self.pending.take() {
            Some(PendingValue::Deferred(deferred)) => Ok(deferred),
            other => {
                self.pending = other;
                Err(BridgeError::MissingPendingValue)
            }
        }
    }

    /// Replace the slot with the resolved value.
    pub(crate) fn resolve(&mut self, value: Option<Val>) {
        self.pending = Some(PendingValue::Resolved(value));
    }

    /// Take the resolved value for the import being rewound into.
    pub(crate) fn take_resolved(&mut self) -> Result<Option<Val>, BridgeError> {
        match self.pending.take() {
            Some(PendingValue::Resolved(value)) => {
                self.resumptions += 1;
                Ok(value)
            }
            other => {
                self.pending = other;
                Err(BridgeError::UnexpectedRewind)
            }
        }
    }
}

impl fmt::Debug for Asyncify {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Asyncify")
            .field("data_addr", &self.data_addr)
            .field("bound", &self.exports.is_some())
            .field("pending", &self.pending.is_some())
            .field("suspensions", &self.suspensions)
            .field("resumptions", &self.resumptions)
            .finish()
    }
}

/// Store data that carries asyncify bridge state.
pub trait AsyncifyView {
    /// The bridge state.
    fn asyncify(&mut self) -> &mut Asyncify;
}

/// Wrap a host import so it can suspend the guest.
///
/// The returned closure has the shape `Linker::func_new` expects. When the
/// guest is rewinding it stops the rewind and returns the resolved value
/// without calling `f`. Otherwise it requires the guest to be idle, calls
/// `f`, passes ready results straight through, and for deferred results
/// parks the value and starts an unwind.
pub fn wrap_import<T, F>(
    name: &str,
    ty: &FuncType,
    f: F,
) -> impl Fn(Caller<'_, T>, &[Val], &mut [Val]) -> wasmtime::Result<()> + Send + Sync + 'static
where
    T: AsyncifyView + 'static,
    F: Fn(&mut Caller<'_, T>, &[Val]) -> wasmtime::Result<HostReturn> + Send + Sync + 'static,
{
    let name = name.to_string();
    let result_types: Vec<ValType> = ty.results().collect();

    move |mut caller: Caller<'_, T>, params: &[Val], results: &mut [Val]| {
        let exports = bound_exports(&mut caller)?;

        if exports.state(&mut caller)? == ExecutionState::Rewinding {
            exports.stop_rewind(&mut caller)?;
            let value = caller.data_mut().asyncify().take_resolved()?;
            trace!(import = %name, "Resuming guest at suspended import");
            write_results(results, value)?;
            return Ok(());
        }

        exports.assert_idle(&mut caller)?;

        match f(&mut caller, params)? {
            HostReturn::Ready(value) => write_results(results, value)?,
            HostReturn::Deferred(deferred) => {
                let asyncify = caller.data_mut().asyncify();
                asyncify.park(deferred)?;
                let data_addr = asyncify.data_addr();

                exports.start_unwind(&mut caller, data_addr)?;
                debug!(import = %name, "Guest suspended at deferred import");

                // Discarded by the guest while it unwinds
                for (slot, ty) in results.iter_mut().zip(&result_types) {
                    *slot = placeholder(ty)?;
                }
            }
        }

        Ok(())
    }
}

/// Call a guest export through the bridge.
///
/// Requires the guest to be idle, calls `func`, and while the guest reports
/// an unwind: stops it, awaits the pending value, starts a rewind and calls
/// `func` again. Wasm arity is fixed, so re-entries pass `params` again; a
/// rewinding guest ignores them. Returns the number of rewinds performed.
///
/// Each loop iteration waits on exactly one deferred value, so a call may
/// span any number of scheduler turns. There is no timeout.
pub async fn call_wrapped<T>(
    store: &mut Store<T>,
    func: Func,
    params: &[Val],
    results: &mut [Val],
) -> Result<u32, BridgeError>
where
    T: AsyncifyView + Send + 'static,
{
    let asyncify = store.data_mut().asyncify();
    let data_addr = asyncify.data_addr();
    let exports = asyncify
        .exports()
        .cloned()
        .ok_or_else(|| BridgeError::export_not_found(GET_STATE))?;

    exports.assert_idle(&mut *store)?;
    func.call(&mut *store, params, results)
        .map_err(into_bridge_error)?;

    let mut rewinds = 0;
    while exports.state(&mut *store)? == ExecutionState::Unwinding {
        exports.stop_unwind(&mut *store)?;

        let deferred = store.data_mut().asyncify().take_deferred()?;
        let value = deferred.await;
        store.data_mut().asyncify().resolve(value);

        exports.assert_idle(&mut *store)?;
        exports.start_rewind(&mut *store, data_addr)?;
        rewinds += 1;
        trace!(rewinds, "Rewinding guest");

        func.call(&mut *store, params, results)
            .map_err(into_bridge_error)?;
    }

    exports.assert_idle(&mut *store)?;
    Ok(rewinds)
}

/// Convert an error surfaced by a guest call into a [`BridgeError`].
///
/// Bridge and host-function errors raised inside imports travel through the
/// guest as traps; they are recovered here so callers see the original fault.
pub fn into_bridge_error(error: wasmtime::Error) -> BridgeError {
    let error = match error.downcast::<BridgeError>() {
        Ok(bridge) => return bridge,
        Err(error) => error,
    };
    let error = match error.downcast::<HostFunctionError>() {
        Ok(host) => return host.into(),
        Err(error) => error,
    };

    match error.downcast_ref::<Trap>() {
        Some(trap) => BridgeError::trap(format!("{trap}: {error}")),
        None => BridgeError::trap(error.to_string()),
    }
}

fn bound_exports<T: AsyncifyView + 'static>(caller: &mut Caller<'_, T>) -> Result<AsyncifyExports, BridgeError> {
    if let Some(exports) = caller.data_mut().asyncify().exports() {
        return Ok(exports.clone());
    }
    let exports = AsyncifyExports::from_caller(caller)?;
    caller.data_mut().asyncify().bind(exports.clone());
    Ok(exports)
}

fn write_results(results: &mut [Val], value: Option<Val>) -> Result<(), BridgeError> {
    match (results, value) {
        ([], None) => Ok(()),
        ([slot], Some(value)) => {
            *slot = value;
            Ok(())
        }
        (results, value) => Err(BridgeError::trap(format!(
            "host import produced {} value(s), guest expects {}",
            usize::from(value.is_some()),
            results.len()
        ))),
    }
}

fn placeholder(ty: &ValType) -> Result<Val, BridgeError> {
    match ty {
        ValType::I32 => Ok(Val::I32(0)),
        ValType::I64 => Ok(Val::I64(0)),
        ValType::F32 => Ok(Val::F32(0)),
        ValType::F64 => Ok(Val::F64(0)),
        ValType::V128 => Ok(Val::V128(V128::from(0u128))),
        other => Err(BridgeError::trap(format!(
            "deferred imports cannot return {other:?}"
        ))),
    }
}
