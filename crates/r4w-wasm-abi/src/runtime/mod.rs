//! Contracts of the external collaborators: the module loader and the
//! sandboxed runtime it exposes.
//!
//! | Trait | Provides |
//! |-------|----------|
//! | [`ModuleLoader`] | open a sandboxed library by path |
//! | [`LoadedModule`] | symbol lookup, the runtime info symbol, close on drop |
//! | [`SandboxRuntime`] | instances, function table, memory, calls |
//!
//! Two implementations ship with the crate: [`local`], an in-process runtime
//! whose sandboxed functions are Rust closures, and (with the `wasmtime`
//! feature) a runtime that executes real WebAssembly modules.

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::abi::{Lane, WasmValue, WireSignature};

pub mod local;

#[cfg(feature = "wasmtime")]
pub mod wasmtime;

/// Opaque handle to a runtime instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceHandle(pub u64);

impl InstanceHandle {
    /// Value passed as the leading execution-context argument of every call.
    pub fn context_value(self) -> WasmValue {
        WasmValue::from_native_pointer(self.0 as usize)
    }
}

/// A resolved function symbol of a loaded module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncRef(pub u64);

/// How a function bound into the sandbox function table is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackKind {
    /// A host function called through a trampoline
    External,
    /// A function that already follows the sandbox calling convention
    Internal,
}

/// Function bound into a sandbox function table.
///
/// Receives and returns values in wire form, without the context argument.
pub type WireFn = Arc<dyn Fn(&[WasmValue]) -> Option<WasmValue> + Send + Sync>;

/// Parameters of instance creation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstanceParams {
    /// Maximum linear-memory pages (0 = runtime default)
    pub max_pages: u64,
    /// Instance arguments (argc/argv)
    pub args: Vec<String>,
}

/// Location of an instance's linear memory in the host address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearMemory {
    /// Host address of offset 0
    pub base: usize,
    /// Current size in bytes
    pub size: usize,
}

/// Runtime functions exported by a sandboxed module.
pub trait SandboxRuntime: Send + Sync {
    /// One-time process-wide runtime initialization.
    fn sys_init(&self) {}

    /// Create an instance, or `None` on failure.
    fn create_instance(&self, params: &InstanceParams) -> Option<InstanceHandle>;

    /// Destroy an instance.
    fn destroy_instance(&self, instance: InstanceHandle);

    /// Index of the function type with `param_count` parameters followed by
    /// `result_count` results, given as one lane array.
    fn lookup_func_index(
        &self,
        instance: InstanceHandle,
        param_count: u32,
        result_count: u32,
        types: &[Lane],
    ) -> u32;

    /// Bind `func` into the function table, returning its slot, or `None`
    /// when the table cannot take another entry.
    fn add_callback(
        &self,
        instance: InstanceHandle,
        func_type: u32,
        func: WireFn,
        kind: CallbackKind,
    ) -> Option<u32>;

    /// Unbind a function table slot.
    fn remove_callback(&self, instance: InstanceHandle, slot: u32);

    /// Heap index of a non-function export.
    fn lookup_nonfunc_export(&self, _instance: InstanceHandle, _name: &str) -> Option<u32> {
        None
    }

    /// The instance's linear memory, for runtimes that have one.
    fn memory(&self, _instance: InstanceHandle) -> Option<LinearMemory> {
        None
    }

    /// Call `func` with wire arguments.
    ///
    /// `args[0]` is the execution-context value of `instance`; `signature`
    /// includes it. Returns the trap message if the sandboxed code traps.
    fn call(
        &self,
        instance: InstanceHandle,
        func: FuncRef,
        signature: &WireSignature,
        args: &[WasmValue],
    ) -> std::result::Result<Option<WasmValue>, String>;
}

/// A sandboxed library opened by a [`ModuleLoader`]. Dropping it closes the
/// library.
pub trait LoadedModule: Send + Sync {
    /// Resolve the runtime info symbol.
    fn sandbox_info(&self, symbol: &str) -> Option<Arc<dyn SandboxRuntime>>;

    /// Resolve a function symbol.
    fn resolve_symbol(&self, name: &str) -> Option<FuncRef>;
}

impl fmt::Debug for dyn LoadedModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("LoadedModule")
    }
}

/// Opens sandboxed libraries.
pub trait ModuleLoader {
    /// Open the library at `path`.
    fn open(&self, path: &Path) -> std::result::Result<Box<dyn LoadedModule>, String>;
}
