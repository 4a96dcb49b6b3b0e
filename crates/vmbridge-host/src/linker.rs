//! Host import registration.
//!
//! Every guest import lives in the `env` module:
//!
//! | Import       | Signature     | Behavior                                      |
//! |--------------|---------------|-----------------------------------------------|
//! | `elapsed_us` | `() -> f64`   | microseconds since the previous call          |
//! | `tx`         | `(i32)`       | write one output code                         |
//! | `keydown`    | `() -> i32`   | `1` if input is waiting; may suspend          |
//! | `rx`         | `() -> i32`   | take one input code; requires `keydown == 1`  |
//! | `wait`       | `(i32)`       | busy-wait for the given microseconds          |
//!
//! Imports are registered on an [`ImportTable`] and only reach a Wasmtime
//! linker through [`ImportTable::install`], which wraps each of them for the
//! asyncify bridge.

use tracing::debug;
use wasmtime::{Caller, Engine, FuncType, Linker, Val, ValType};

use vmbridge_common::{BridgeError, HostFunctionError};
use vmbridge_core::{BridgeContext, HostReturn, ImportTable};

use crate::serial::SerialHost;
use crate::timer::TimerHost;

/// Module name of every host import.
pub const MODULE: &str = "env";

/// Register all host imports on `imports`.
///
/// This registers:
/// - `env::elapsed_us` and `env::wait` (timer)
/// - `env::tx`, `env::keydown` and `env::rx` (serial device)
pub fn register_all(imports: &mut ImportTable<BridgeContext>, engine: &Engine) {
    register_timer(imports, engine);
    register_serial(imports, engine);
    debug!(imports = imports.len(), "Host imports registered");
}

/// Register `env::elapsed_us` and `env::wait`.
pub fn register_timer(imports: &mut ImportTable<BridgeContext>, engine: &Engine) {
    imports.register(
        MODULE,
        "elapsed_us",
        FuncType::new(engine, [], [ValType::F64]),
        |caller: &mut Caller<'_, BridgeContext>, _params: &[Val]| {
            let micros = TimerHost::elapsed_micros(caller.data_mut());
            Ok(HostReturn::value(micros))
        },
    );

    imports.register(
        MODULE,
        "wait",
        FuncType::new(engine, [ValType::I32], []),
        |caller: &mut Caller<'_, BridgeContext>, params: &[Val]| {
            let micros = u32_param(params, "wait")?;
            TimerHost::busy_wait(caller.data_mut(), micros);
            Ok(HostReturn::unit())
        },
    );
}

/// Register `env::tx`, `env::keydown` and `env::rx`.
pub fn register_serial(imports: &mut ImportTable<BridgeContext>, engine: &Engine) {
    imports.register(
        MODULE,
        "tx",
        FuncType::new(engine, [ValType::I32], []),
        |caller: &mut Caller<'_, BridgeContext>, params: &[Val]| {
            let code = u32_param(params, "tx")?;
            SerialHost::transmit(caller.data_mut(), code);
            Ok(HostReturn::unit())
        },
    );

    imports.register(
        MODULE,
        "keydown",
        FuncType::new(engine, [], [ValType::I32]),
        |caller: &mut Caller<'_, BridgeContext>, _params: &[Val]| {
            Ok(SerialHost::keydown(caller.data()))
        },
    );

    imports.register(
        MODULE,
        "rx",
        FuncType::new(engine, [], [ValType::I32]),
        |caller: &mut Caller<'_, BridgeContext>, _params: &[Val]| {
            #[allow(clippy::cast_possible_wrap)]
            let code = SerialHost::receive(caller.data_mut())? as i32;
            Ok(HostReturn::value(code))
        },
    );
}

/// Build a linker with every host import installed.
///
/// # Errors
///
/// Returns an error if an import cannot be defined.
pub fn build_linker(engine: &Engine) -> Result<Linker<BridgeContext>, BridgeError> {
    let mut imports = ImportTable::new();
    register_all(&mut imports, engine);

    let mut linker = Linker::new(engine);
    imports.install(&mut linker)?;
    Ok(linker)
}

/// Reinterpret the first parameter as an unsigned word.
#[allow(clippy::cast_sign_loss)]
fn u32_param(params: &[Val], import: &str) -> Result<u32, HostFunctionError> {
    params
        .first()
        .and_then(Val::i32)
        .map(|raw| raw as u32)
        .ok_or_else(|| HostFunctionError::InvalidArgument {
            reason: format!("{import} expects one i32 parameter"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmbridge_common::EngineConfig;
    use vmbridge_core::WasmEngine;

    #[test]
    fn test_register_all() {
        let engine = WasmEngine::new(&EngineConfig::default()).unwrap();
        let mut imports = ImportTable::new();

        register_all(&mut imports, engine.inner());

        assert_eq!(imports.len(), 5);
        for name in ["elapsed_us", "tx", "keydown", "rx", "wait"] {
            assert!(imports.handle(MODULE, name).is_some(), "{name} missing");
        }
    }

    #[test]
    fn test_register_all_twice_is_memoized() {
        let engine = WasmEngine::new(&EngineConfig::default()).unwrap();
        let mut imports = ImportTable::new();

        register_all(&mut imports, engine.inner());
        let tx = imports.handle(MODULE, "tx");
        register_all(&mut imports, engine.inner());

        assert_eq!(imports.len(), 5);
        assert_eq!(imports.handle(MODULE, "tx"), tx);
    }

    #[test]
    fn test_signatures() {
        let engine = WasmEngine::new(&EngineConfig::default()).unwrap();
        let mut imports = ImportTable::new();
        register_all(&mut imports, engine.inner());

        let elapsed = imports
            .signature(imports.handle(MODULE, "elapsed_us").unwrap())
            .unwrap();
        assert!(matches!(elapsed.results().next(), Some(ValType::F64)));

        let wait = imports
            .signature(imports.handle(MODULE, "wait").unwrap())
            .unwrap();
        assert_eq!(wait.params().len(), 1);
        assert_eq!(wait.results().len(), 0);
    }

    #[test]
    fn test_build_linker() {
        let engine = WasmEngine::new(&EngineConfig::default()).unwrap();
        assert!(build_linker(engine.inner()).is_ok());
    }

    #[test]
    fn test_u32_param() {
        assert_eq!(u32_param(&[Val::I32(65)], "tx").unwrap(), 65);
        assert_eq!(u32_param(&[Val::I32(-1)], "tx").unwrap(), u32::MAX);
        assert!(u32_param(&[], "tx").is_err());
        assert!(u32_param(&[Val::F64(0)], "tx").is_err());
    }
}
