//! Flat-heap runtime executing WebAssembly modules with wasmtime.
//!
//! A `.wasm` or `.wat` file stands in for a wasm2c-compiled library:
//!
//! | wasm2c library | wasmtime module |
//! |----------------|-----------------|
//! | `w2c_<name>` function symbols | function exports named `<name>` |
//! | `w2c_memory` | the `memory` export |
//! | sandbox function table | the `__indirect_function_table` export |
//! | non-function exports | `i32` global exports holding a heap offset |
//!
//! Compiled modules do not take the execution-context argument, so it is
//! checked and dropped at the call boundary. Host functions bound into the
//! table run with the store borrowed by the calling wasm frame; calls they
//! make back into the same instance reuse that borrow.

use std::cell::RefCell;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use wasmtime::{
    AsContextMut, Caller, Engine, Extern, Func, FuncType, Linker, Memory, Module, Ref,
    ResourceLimiter, Store, StoreContextMut, StoreLimits, StoreLimitsBuilder, Table, Val, ValType,
};

use super::{
    CallbackKind, FuncRef, InstanceHandle, InstanceParams, LinearMemory, LoadedModule,
    ModuleLoader, SandboxRuntime, WireFn,
};
use crate::abi::{Lane, WasmValue, WireSignature};
use crate::error::{AbiError, Result};
use crate::heap::PAGE_SIZE;

const INFO_SYMBOL: &str = "get_wasm2c_sandbox_info";
const SYMBOL_PREFIX: &str = "w2c_";
const TABLE_EXPORT: &str = "__indirect_function_table";
const MEMORY_EXPORT: &str = "memory";

/// Loads WebAssembly modules as flat-heap sandboxed libraries.
#[derive(Clone, Default)]
pub struct WasmtimeLoader {
    engine: Engine,
}

impl WasmtimeLoader {
    /// Loader with a default engine.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loader sharing `engine`.
    pub fn with_engine(engine: Engine) -> Self {
        Self { engine }
    }

    /// Compile a module from bytes (binary or text format).
    pub fn load_bytes(&self, bytes: impl AsRef<[u8]>) -> Result<Box<dyn LoadedModule>> {
        let module = Module::new(&self.engine, bytes)
            .map_err(|e| AbiError::LoadFailed {
                path: "<bytes>".into(),
                reason: e.to_string(),
            })?;
        Ok(Box::new(WasmtimeLibrary::new(&self.engine, module)))
    }
}

impl ModuleLoader for WasmtimeLoader {
    fn open(&self, path: &Path) -> std::result::Result<Box<dyn LoadedModule>, String> {
        let module = Module::from_file(&self.engine, path).map_err(|e| e.to_string())?;
        tracing::debug!(path = %path.display(), "wasm module compiled");
        Ok(Box::new(WasmtimeLibrary::new(&self.engine, module)))
    }
}

impl std::fmt::Debug for WasmtimeLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WasmtimeLoader").finish_non_exhaustive()
    }
}

struct WasmtimeLibrary {
    runtime: Arc<WasmtimeRuntime>,
}

impl WasmtimeLibrary {
    fn new(engine: &Engine, module: Module) -> Self {
        let func_names = module
            .exports()
            .filter(|e| e.ty().func().is_some())
            .map(|e| e.name().to_string())
            .collect();
        Self {
            runtime: Arc::new(WasmtimeRuntime {
                engine: engine.clone(),
                module,
                func_names,
                instances: Mutex::new(HashMap::new()),
                next_instance: AtomicU64::new(1),
            }),
        }
    }
}

impl LoadedModule for WasmtimeLibrary {
    fn sandbox_info(&self, symbol: &str) -> Option<Arc<dyn SandboxRuntime>> {
        if !symbol.ends_with(INFO_SYMBOL) {
            return None;
        }
        let runtime: Arc<dyn SandboxRuntime> = self.runtime.clone();
        Some(runtime)
    }

    fn resolve_symbol(&self, name: &str) -> Option<FuncRef> {
        let name = name.strip_prefix(SYMBOL_PREFIX)?;
        self.runtime
            .func_names
            .iter()
            .position(|n| n == name)
            .map(|i| FuncRef(i as u64))
    }
}

// ============================================================================
// Store state
// ============================================================================

struct HostState {
    limits: StoreLimits,
    memory_size: Arc<AtomicUsize>,
}

impl ResourceLimiter for HostState {
    fn memory_growing(
        &mut self,
        current: usize,
        desired: usize,
        maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        let allowed = self.limits.memory_growing(current, desired, maximum)?;
        if allowed {
            self.memory_size.store(desired, Ordering::Release);
        }
        Ok(allowed)
    }

    fn table_growing(
        &mut self,
        current: usize,
        desired: usize,
        maximum: Option<usize>,
    ) -> wasmtime::Result<bool> {
        self.limits.table_growing(current, desired, maximum)
    }
}

struct WasmtimeInstance {
    id: u64,
    store: Mutex<Store<HostState>>,
    funcs: Vec<Option<Func>>,
    memory: Option<(usize, Arc<AtomicUsize>)>,
    table: Option<Table>,
    globals: HashMap<String, u32>,
    types: Mutex<Vec<WireSignature>>,
}

// Host functions bound into a table run inside a wasm frame that holds the
// store. Their `Caller` is published here so nested calls can use it.
thread_local! {
    static ACTIVE_CALLERS: RefCell<Vec<(u64, *mut ())>> = const { RefCell::new(Vec::new()) };
}

struct CallerGuard;

impl CallerGuard {
    fn push(instance: u64, caller: &mut Caller<'_, HostState>) -> Self {
        let ptr = caller as *mut Caller<'_, HostState> as *mut ();
        ACTIVE_CALLERS.with(|c| c.borrow_mut().push((instance, ptr)));
        CallerGuard
    }
}

impl Drop for CallerGuard {
    fn drop(&mut self) {
        ACTIVE_CALLERS.with(|c| c.borrow_mut().pop());
    }
}

impl WasmtimeInstance {
    /// Run `f` with the store, reusing the borrow of an enclosing host
    /// function on this thread.
    fn with_store<R>(&self, f: impl FnOnce(StoreContextMut<'_, HostState>) -> R) -> R {
        let active = ACTIVE_CALLERS.with(|c| c.borrow().last().copied());
        match active {
            Some((id, ptr)) if id == self.id => {
                // SAFETY: the pointer was published by a `CallerGuard` whose
                // host function frame is still below us on this thread.
                let caller = unsafe { &mut *(ptr as *mut Caller<'_, HostState>) };
                f(caller.as_context_mut())
            }
            _ => {
                let mut store = self.store.lock();
                f(store.as_context_mut())
            }
        }
    }
}

// ============================================================================
// Runtime
// ============================================================================

struct WasmtimeRuntime {
    engine: Engine,
    module: Module,
    func_names: Vec<String>,
    instances: Mutex<HashMap<u64, Arc<WasmtimeInstance>>>,
    next_instance: AtomicU64,
}

impl WasmtimeRuntime {
    fn instance(&self, handle: InstanceHandle) -> std::result::Result<Arc<WasmtimeInstance>, String> {
        self.instances
            .lock()
            .get(&handle.0)
            .cloned()
            .ok_or_else(|| format!("unknown instance {}", handle.0))
    }

    fn instantiate(&self, id: u64, params: &InstanceParams) -> wasmtime::Result<WasmtimeInstance> {
        let memory_size = Arc::new(AtomicUsize::new(0));
        let mut limits = StoreLimitsBuilder::new();
        if params.max_pages != 0 {
            limits = limits.memory_size((params.max_pages * PAGE_SIZE) as usize);
        }
        let mut store = Store::new(
            &self.engine,
            HostState {
                limits: limits.build(),
                memory_size: memory_size.clone(),
            },
        );
        store.limiter(|state| state);

        let mut linker = Linker::new(&self.engine);
        linker.define_unknown_imports_as_traps(&self.module)?;
        let instance = linker.instantiate(&mut store, &self.module)?;

        let funcs = self
            .func_names
            .iter()
            .map(|name| instance.get_func(&mut store, name))
            .collect();

        let memory = instance
            .get_memory(&mut store, MEMORY_EXPORT)
            .map(|m: Memory| {
                memory_size.store(m.data_size(&store), Ordering::Release);
                (m.data_ptr(&store) as usize, memory_size.clone())
            });

        let table = instance.get_table(&mut store, TABLE_EXPORT);

        let mut globals = HashMap::new();
        let exports = instance
            .exports(&mut store)
            .map(|e| (e.name().to_string(), e.into_extern()))
            .collect::<Vec<_>>();
        for (name, export) in exports {
            if let Extern::Global(global) = export {
                if let Val::I32(offset) = global.get(&mut store) {
                    globals.insert(name, offset as u32);
                }
            }
        }

        Ok(WasmtimeInstance {
            id,
            store: Mutex::new(store),
            funcs,
            memory,
            table,
            globals,
            types: Mutex::new(Vec::new()),
        })
    }
}

fn val_type(lane: Lane) -> ValType {
    match lane {
        Lane::I32 => ValType::I32,
        Lane::I64 => ValType::I64,
        Lane::F32 => ValType::F32,
        Lane::F64 => ValType::F64,
    }
}

fn to_val(value: WasmValue) -> Val {
    match value {
        WasmValue::I32(v) => Val::I32(v as i32),
        WasmValue::I64(v) => Val::I64(v as i64),
        WasmValue::F32(v) => Val::F32(v.to_bits()),
        WasmValue::F64(v) => Val::F64(v.to_bits()),
    }
}

fn from_val(value: &Val) -> Option<WasmValue> {
    match value {
        Val::I32(v) => Some(WasmValue::I32(*v as u32)),
        Val::I64(v) => Some(WasmValue::I64(*v as u64)),
        Val::F32(bits) => Some(WasmValue::F32(f32::from_bits(*bits))),
        Val::F64(bits) => Some(WasmValue::F64(f64::from_bits(*bits))),
        _ => None,
    }
}

impl SandboxRuntime for WasmtimeRuntime {
    fn create_instance(&self, params: &InstanceParams) -> Option<InstanceHandle> {
        let id = self.next_instance.fetch_add(1, Ordering::Relaxed);
        match self.instantiate(id, params) {
            Ok(instance) => {
                self.instances.lock().insert(id, Arc::new(instance));
                Some(InstanceHandle(id))
            }
            Err(e) => {
                tracing::debug!(error = %e, "wasm instantiation failed");
                None
            }
        }
    }

    fn destroy_instance(&self, instance: InstanceHandle) {
        self.instances.lock().remove(&instance.0);
    }

    fn lookup_func_index(
        &self,
        instance: InstanceHandle,
        param_count: u32,
        result_count: u32,
        types: &[Lane],
    ) -> u32 {
        let Ok(inst) = self.instance(instance) else {
            return u32::MAX;
        };
        let params = types.iter().take(param_count as usize).copied().collect::<Vec<_>>();
        let result = match result_count {
            0 => None,
            _ => types.get(param_count as usize).copied(),
        };
        let signature = WireSignature::new(params, result);

        let mut interned = inst.types.lock();
        match interned.iter().position(|t| *t == signature) {
            Some(i) => i as u32,
            None => {
                interned.push(signature);
                (interned.len() - 1) as u32
            }
        }
    }

    fn add_callback(
        &self,
        instance: InstanceHandle,
        func_type: u32,
        func: WireFn,
        kind: CallbackKind,
    ) -> Option<u32> {
        let inst = self.instance(instance).ok()?;
        let table = inst.table?;
        let signature = inst.types.lock().get(func_type as usize).cloned()?;
        let ty = FuncType::new(
            &self.engine,
            signature.params.iter().copied().map(val_type),
            signature.result.map(val_type),
        );

        let id = inst.id;
        inst.with_store(|mut store| {
            let host = Func::new(&mut store, ty, move |mut caller, params, results| {
                let _active = CallerGuard::push(id, &mut caller);
                let args = params
                    .iter()
                    .map(from_val)
                    .collect::<Option<Vec<_>>>()
                    .ok_or_else(|| wasmtime::Error::msg("reference argument to a host function"))?;
                let result = func(&args);
                if let (Some(slot), Some(value)) = (results.first_mut(), result) {
                    *slot = to_val(value);
                }
                Ok(())
            });

            let size = table.size(&store);
            let free = (1..size).find(|i| matches!(table.get(&mut store, *i), Some(Ref::Func(None))));
            let slot = match free {
                Some(slot) => slot,
                None => {
                    // slot 0 stays null
                    let grow = if size == 0 { 2 } else { 1 };
                    let start = table.grow(&mut store, grow, Ref::Func(None)).ok()?;
                    start + grow - 1
                }
            };
            table.set(&mut store, slot, Ref::Func(Some(host))).ok()?;
            tracing::trace!(slot, ?kind, "host function bound into table");
            u32::try_from(slot).ok()
        })
    }

    fn remove_callback(&self, instance: InstanceHandle, slot: u32) {
        let Ok(inst) = self.instance(instance) else {
            return;
        };
        if let Some(table) = inst.table {
            inst.with_store(|mut store| {
                if let Err(e) = table.set(&mut store, u64::from(slot), Ref::Func(None)) {
                    tracing::warn!(slot, error = %e, "could not clear table slot");
                }
            });
        }
    }

    fn lookup_nonfunc_export(&self, instance: InstanceHandle, name: &str) -> Option<u32> {
        let name = name.strip_prefix(SYMBOL_PREFIX)?;
        self.instance(instance).ok()?.globals.get(name).copied()
    }

    fn memory(&self, instance: InstanceHandle) -> Option<LinearMemory> {
        let inst = self.instance(instance).ok()?;
        inst.memory.as_ref().map(|(base, size)| LinearMemory {
            base: *base,
            size: size.load(Ordering::Acquire),
        })
    }

    fn call(
        &self,
        instance: InstanceHandle,
        func: FuncRef,
        signature: &WireSignature,
        args: &[WasmValue],
    ) -> std::result::Result<Option<WasmValue>, String> {
        let inst = self.instance(instance)?;
        let target = inst
            .funcs
            .get(func.0 as usize)
            .copied()
            .flatten()
            .ok_or_else(|| format!("unknown function {}", func.0))?;

        match args.first() {
            Some(cx) if *cx == instance.context_value() => {}
            _ => return Err("call without the instance context".into()),
        }
        let params = args[1..].iter().copied().map(to_val).collect::<Vec<_>>();
        let mut results = vec![Val::I32(0); signature.result_count()];

        inst.with_store(|mut store| {
            let ty = target.ty(&store);
            let declared = ty.params().count() == params.len() && ty.results().len() == results.len();
            if !declared {
                return Err(format!("function {} called as {}", func.0, signature));
            }
            target
                .call(&mut store, &params, &mut results)
                .map_err(|e| e.to_string())
        })?;

        Ok(results.first().and_then(from_val))
    }
}
