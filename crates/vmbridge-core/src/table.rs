//! Registration tables for wrapped imports and exports.
//!
//! Both tables are built once at initialization from a statically known set
//! of functions and hand out a handle per function. Registering a function
//! that is already present returns its existing handle and does not wrap it
//! a second time.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;
use wasmtime::{AsContextMut, Caller, Func, FuncType, Instance, Linker, Val};

use vmbridge_common::BridgeError;

use crate::asyncify::{AsyncifyView, HostReturn, is_control_export, wrap_import};

/// Handle to a registered import.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImportHandle(usize);

/// Handle to a wrapped guest export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExportHandle(usize);

type SharedHostFn<T> =
    Arc<dyn Fn(&mut Caller<'_, T>, &[Val]) -> wasmtime::Result<HostReturn> + Send + Sync>;

struct ImportEntry<T> {
    module: String,
    name: String,
    ty: FuncType,
    func: SharedHostFn<T>,
}

/// Host imports offered to the guest, keyed by `(module, name)`.
pub struct ImportTable<T> {
    entries: Vec<ImportEntry<T>>,
    index: HashMap<(String, String), ImportHandle>,
}

impl<T: AsyncifyView + 'static> ImportTable<T> {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            index: HashMap::new(),
        }
    }

    /// Register a host function under `module.name`.
    ///
    /// If the symbol is already registered the existing handle is returned
    /// and `func` is dropped.
    pub fn register(
        &mut self,
        module: &str,
        name: &str,
        ty: FuncType,
        func: impl Fn(&mut Caller<'_, T>, &[Val]) -> wasmtime::Result<HostReturn>
        + Send
        + Sync
        + 'static,
    ) -> ImportHandle {
        let key = (module.to_string(), name.to_string());
        if let Some(handle) = self.index.get(&key) {
            return *handle;
        }

        let handle = ImportHandle(self.entries.len());
        self.entries.push(ImportEntry {
            module: key.0.clone(),
            name: key.1.clone(),
            ty,
            func: Arc::new(func),
        });
        self.index.insert(key, handle);
        handle
    }

    /// Look up the handle of a registered symbol.
    pub fn handle(&self, module: &str, name: &str) -> Option<ImportHandle> {
        self.index
            .get(&(module.to_string(), name.to_string()))
            .copied()
    }

    /// Signature of a registered import.
    pub fn signature(&self, handle: ImportHandle) -> Option<&FuncType> {
        self.entries.get(handle.0).map(|entry| &entry.ty)
    }

    /// Number of registered imports.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Wrap every registered import and define it on `linker`.
    pub fn install(&self, linker: &mut Linker<T>) -> Result<(), BridgeError> {
        for entry in &self.entries {
            let func = Arc::clone(&entry.func);
            let wrapped = wrap_import(
                &entry.name,
                &entry.ty,
                move |caller: &mut Caller<'_, T>, params: &[Val]| func(caller, params),
            );

            linker
                .func_new(&entry.module, &entry.name, entry.ty.clone(), wrapped)
                .map_err(|e| {
                    BridgeError::invalid_config(format!(
                        "Failed to register {}.{}: {e}",
                        entry.module, entry.name
                    ))
                })?;
        }

        debug!(imports = self.entries.len(), "Host imports installed");
        Ok(())
    }
}

impl<T: AsyncifyView + 'static> Default for ImportTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> std::fmt::Debug for ImportTable<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self
            .entries
            .iter()
            .map(|entry| format!("{}.{}", entry.module, entry.name))
            .collect();
        f.debug_struct("ImportTable").field("entries", &names).finish()
    }
}

/// A guest export that is only ever called through the asyncify bridge.
#[derive(Debug, Clone)]
pub struct WrappedExport {
    name: String,
    func: Func,
    ty: FuncType,
}

impl WrappedExport {
    /// Export name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The raw guest function.
    pub fn func(&self) -> Func {
        self.func
    }

    /// Signature of the export.
    pub fn ty(&self) -> &FuncType {
        &self.ty
    }
}

/// Guest exports wrapped for bridged calls, keyed by name.
#[derive(Debug, Default)]
pub struct ExportTable {
    entries: Vec<WrappedExport>,
    index: HashMap<String, ExportHandle>,
}

impl ExportTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap every function export of `instance` except the asyncify controls.
    ///
    /// Memories, globals and tables are left untouched.
    pub fn wrap_all(mut store: impl AsContextMut, instance: &Instance) -> Self {
        let funcs: Vec<(String, Func)> = instance
            .exports(&mut store)
            .filter_map(|export| {
                let name = export.name().to_string();
                export.into_func().map(|func| (name, func))
            })
            .collect();

        let mut table = Self::new();
        for (name, func) in funcs {
            if is_control_export(&name) {
                continue;
            }
            let ty = func.ty(&store);
            table.wrap(&name, func, ty);
        }
        table
    }

    /// Wrap `func` under `name`, or return the handle it already has.
    pub fn wrap(&mut self, name: &str, func: Func, ty: FuncType) -> ExportHandle {
        if let Some(handle) = self.index.get(name) {
            return *handle;
        }

        let handle = ExportHandle(self.entries.len());
        self.entries.push(WrappedExport {
            name: name.to_string(),
            func,
            ty,
        });
        self.index.insert(name.to_string(), handle);
        handle
    }

    /// Handle of a wrapped export.
    pub fn handle(&self, name: &str) -> Option<ExportHandle> {
        self.index.get(name).copied()
    }

    /// The wrapped export behind `handle`.
    pub fn get(&self, handle: ExportHandle) -> Option<&WrappedExport> {
        self.entries.get(handle.0)
    }

    /// Names of all wrapped exports, in export order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(WrappedExport::name)
    }

    /// Number of wrapped exports.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns `true` if nothing is wrapped.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asyncify::Asyncify;
    use vmbridge_common::AsyncifyConfig;
    use wasmtime::{Engine, Module, Store, ValType};

    struct TestData {
        asyncify: Asyncify,
    }

    impl AsyncifyView for TestData {
        fn asyncify(&mut self) -> &mut Asyncify {
            &mut self.asyncify
        }
    }

    fn unit_ty(engine: &Engine) -> FuncType {
        FuncType::new(engine, [], [])
    }

    #[test]
    fn test_import_registration_is_memoized() {
        let engine = Engine::default();
        let mut table = ImportTable::<TestData>::new();

        let first = table.register("env", "tick", unit_ty(&engine), |_, _| {
            Ok(HostReturn::unit())
        });
        let second = table.register("env", "tick", unit_ty(&engine), |_, _| {
            Ok(HostReturn::value(1i32))
        });

        assert_eq!(first, second);
        assert_eq!(table.len(), 1);
        assert_eq!(table.handle("env", "tick"), Some(first));
        assert!(table.handle("env", "tock").is_none());
    }

    #[test]
    fn test_import_signature() {
        let engine = Engine::default();
        let mut table = ImportTable::<TestData>::new();

        let ty = FuncType::new(&engine, [], [ValType::F64]);
        let handle = table.register("env", "elapsed_us", ty, |_, _| {
            Ok(HostReturn::value(0.0f64))
        });

        let sig = table.signature(handle).unwrap();
        assert_eq!(sig.params().len(), 0);
        assert_eq!(sig.results().len(), 1);
    }

    #[test]
    fn test_install_defines_imports() {
        let engine = Engine::default();
        let mut linker = Linker::<TestData>::new(&engine);
        let mut table = ImportTable::<TestData>::new();
        table.register("env", "tick", unit_ty(&engine), |_, _| Ok(HostReturn::unit()));

        table.install(&mut linker).unwrap();

        let mut store = Store::new(
            &engine,
            TestData {
                asyncify: Asyncify::new(&AsyncifyConfig::default()),
            },
        );
        assert!(linker.get(&mut store, "env", "tick").is_some());
    }

    #[test]
    fn test_export_table_skips_controls_and_memory() {
        let engine = Engine::default();
        let module = Module::new(
            &engine,
            r#"
            (module
                (memory (export "memory") 1)
                (func (export "asyncify_get_state") (result i32) (i32.const 0))
                (func (export "step"))
                (func (export "status") (result i32) (i32.const 3))
            )
            "#,
        )
        .unwrap();
        let mut store = Store::new(&engine, ());
        let instance = Instance::new(&mut store, &module, &[]).unwrap();

        let table = ExportTable::wrap_all(&mut store, &instance);

        assert_eq!(table.len(), 2);
        assert_eq!(table.names().collect::<Vec<_>>(), vec!["step", "status"]);
        assert!(table.handle("asyncify_get_state").is_none());
        assert!(table.handle("memory").is_none());
    }

    #[test]
    fn test_export_wrapping_is_memoized() {
        let engine = Engine::default();
        let module = Module::new(&engine, r#"(module (func (export "step")))"#).unwrap();
        let mut store = Store::new(&engine, ());
        let instance = Instance::new(&mut store, &module, &[]).unwrap();

        let mut table = ExportTable::wrap_all(&mut store, &instance);
        let step = instance.get_func(&mut store, "step").unwrap();
        let ty = step.ty(&store);

        let handle = table.handle("step").unwrap();
        assert_eq!(table.wrap("step", step, ty), handle);
        assert_eq!(table.len(), 1);
        assert_eq!(table.get(handle).unwrap().name(), "step");
    }
}
