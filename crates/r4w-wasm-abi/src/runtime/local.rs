//! In-process reference runtime.
//!
//! Sandboxed functions are Rust closures operating on a [`GuestCx`], which
//! gives them the same view a compiled module has: a linear memory addressed
//! by 32-bit offsets, an allocator living inside that memory, and a function
//! table reached through type-checked indirect calls.
//!
//! | Type | Role |
//! |------|------|
//! | [`LocalModuleBuilder`] | declare exports, data, memory size, failure injection |
//! | [`LocalModule`] | a built module; also the runtime it exports |
//! | [`LocalLoader`] | maps paths to modules |
//! | [`GuestCx`] | what a sandboxed function sees while it runs |
//!
//! ```rust,no_run
//! use r4w_wasm_abi::runtime::local::{GuestCx, LocalLoader, LocalModule};
//!
//! let module = LocalModule::builder()
//!     .export_fn("square", |_: &GuestCx, x: u32| x * x)
//!     .build();
//! let loader = LocalLoader::new().with_module("square.so", module.clone());
//! # let _ = loader;
//! ```

use std::alloc::{self, Layout};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::path::{Path, PathBuf};
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::{
    CallbackKind, FuncRef, InstanceHandle, InstanceParams, LinearMemory, LoadedModule,
    ModuleLoader, SandboxRuntime, WireFn,
};
use crate::abi::typed::for_each_function_signature;
use crate::abi::{flat_bytes, Flat, Lane, WasmValue, WireSignature};
use crate::heap::PAGE_SIZE;

/// Body of a sandboxed function. Receives wire arguments without the
/// execution-context argument; an `Err` is a trap.
pub type GuestFn =
    Arc<dyn Fn(&GuestCx, &[WasmValue]) -> std::result::Result<Option<WasmValue>, String> + Send + Sync>;

/// Memory size of a flat module when none is declared.
pub const DEFAULT_PAGES: u32 = 16;

/// Function table capacity when none is declared.
pub const DEFAULT_TABLE_SIZE: u32 = 1024;

// Offset 0 stays null; data exports start here.
const DATA_START: u32 = 16;
const ALLOC_ALIGN: u32 = 8;

// ============================================================================
// Typed guest functions
// ============================================================================

/// A Rust type a sandboxed function can take as a wire argument.
pub trait WireArg: Sized + 'static {
    /// Lane the value occupies.
    const LANE: Lane;

    /// Decode from a wire value.
    fn from_wire(value: WasmValue) -> Option<Self>;

    /// Encode to a wire value.
    fn into_wire(self) -> WasmValue;
}

macro_rules! wire_args {
    ($($ty:ty => $lane:ident, $variant:ident, $raw:ty;)*) => {
        $(
            impl WireArg for $ty {
                const LANE: Lane = Lane::$lane;

                fn from_wire(value: WasmValue) -> Option<Self> {
                    match value {
                        WasmValue::$variant(v) => Some(v as $ty),
                        _ => None,
                    }
                }

                fn into_wire(self) -> WasmValue {
                    WasmValue::$variant(self as $raw)
                }
            }
        )*
    };
}

wire_args! {
    u32 => I32, I32, u32;
    i32 => I32, I32, u32;
    u64 => I64, I64, u64;
    i64 => I64, I64, u64;
    f32 => F32, F32, f32;
    f64 => F64, F64, f64;
}

impl WireArg for usize {
    const LANE: Lane = Lane::NATIVE_POINTER;

    fn from_wire(value: WasmValue) -> Option<Self> {
        match (Lane::NATIVE_POINTER, value) {
            (Lane::I64, WasmValue::I64(v)) => usize::try_from(v).ok(),
            (Lane::I32, WasmValue::I32(v)) => Some(v as usize),
            _ => None,
        }
    }

    fn into_wire(self) -> WasmValue {
        WasmValue::from_native_pointer(self)
    }
}

/// A Rust type a sandboxed function can return.
pub trait WireResult: Sized + 'static {
    /// Result lane, `None` for no result.
    const LANE: Option<Lane>;

    /// Encode the result.
    fn into_wire(self) -> Option<WasmValue>;
}

impl WireResult for () {
    const LANE: Option<Lane> = None;

    fn into_wire(self) -> Option<WasmValue> {
        None
    }
}

impl<T: WireArg> WireResult for T {
    const LANE: Option<Lane> = Some(T::LANE);

    fn into_wire(self) -> Option<WasmValue> {
        Some(WireArg::into_wire(self))
    }
}

/// Conversion of a typed closure into a [`GuestFn`] and its wire signature.
pub trait IntoGuestFn<P, R> {
    /// Wrap `self`.
    fn into_guest_fn(self) -> (WireSignature, GuestFn);
}

macro_rules! impl_into_guest_fn {
    ($n:tt $($args:ident)*) => {
        #[allow(non_snake_case)]
        impl<F, $($args,)* R> IntoGuestFn<($($args,)*), R> for F
        where
            F: Fn(&GuestCx, $($args),*) -> R + Send + Sync + 'static,
            $($args: WireArg,)*
            R: WireResult,
        {
            #[allow(unused_mut, unused_variables)]
            fn into_guest_fn(self) -> (WireSignature, GuestFn) {
                let signature =
                    WireSignature::new(vec![$(<$args as WireArg>::LANE),*], <R as WireResult>::LANE);
                let func: GuestFn = Arc::new(move |cx: &GuestCx, values: &[WasmValue]| {
                    let mut iter = values.iter().copied();
                    $(
                        let $args = iter
                            .next()
                            .and_then(<$args as WireArg>::from_wire)
                            .ok_or_else(|| format!("bad argument list {:?}", values))?;
                    )*
                    Ok(WireResult::into_wire(self(cx, $($args),*)))
                });
                (signature, func)
            }
        }
    };
}

for_each_function_signature!(impl_into_guest_fn);

// ============================================================================
// Module definition
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Flat,
    Capability,
}

impl Mode {
    fn symbol_prefix(self) -> &'static str {
        match self {
            Mode::Flat => "w2c_",
            Mode::Capability => "",
        }
    }

    fn info_symbol(self) -> &'static str {
        match self {
            Mode::Flat => "get_wasm2c_sandbox_info",
            Mode::Capability => "get_mswasm_sandbox_info",
        }
    }
}

struct Export {
    name: String,
    signature: WireSignature,
    func: GuestFn,
}

/// Builder for [`LocalModule`].
pub struct LocalModuleBuilder {
    mode: Mode,
    module_name: String,
    exports: Vec<Export>,
    data: Vec<(String, Vec<u8>)>,
    pages: u32,
    table_size: u32,
    allocator: bool,
    fail_instance_creation: bool,
    hide_memory: bool,
    hide_info_symbol: bool,
}

impl Default for LocalModuleBuilder {
    fn default() -> Self {
        Self {
            mode: Mode::Flat,
            module_name: String::new(),
            exports: Vec::new(),
            data: Vec::new(),
            pages: DEFAULT_PAGES,
            table_size: DEFAULT_TABLE_SIZE,
            allocator: true,
            fail_instance_creation: false,
            hide_memory: false,
            hide_info_symbol: false,
        }
    }
}

impl LocalModuleBuilder {
    /// Build a capability-model module: native pointers, no linear memory,
    /// unprefixed symbols.
    ///
    /// # Safety
    ///
    /// Sandboxed functions of such a module dereference host addresses
    /// handed to them; the caller is responsible for passing only valid
    /// pointers.
    pub unsafe fn capability(mut self) -> Self {
        self.mode = Mode::Capability;
        self.allocator = false;
        self
    }

    /// Builder: set module name (prefix of the info symbol)
    pub fn module_name(mut self, name: impl Into<String>) -> Self {
        self.module_name = name.into();
        self
    }

    /// Builder: set initial memory size in pages
    pub fn pages(mut self, pages: u32) -> Self {
        self.pages = pages.max(1);
        self
    }

    /// Builder: set function table capacity
    pub fn table_size(mut self, slots: u32) -> Self {
        self.table_size = slots;
        self
    }

    /// Builder: export a function with an explicit wire signature
    pub fn export<F>(
        mut self,
        name: impl Into<String>,
        params: impl Into<Vec<Lane>>,
        result: Option<Lane>,
        func: F,
    ) -> Self
    where
        F: Fn(&GuestCx, &[WasmValue]) -> std::result::Result<Option<WasmValue>, String>
            + Send
            + Sync
            + 'static,
    {
        self.exports.push(Export {
            name: name.into(),
            signature: WireSignature::new(params, result),
            func: Arc::new(func),
        });
        self
    }

    /// Builder: export a typed closure
    pub fn export_fn<P, R>(mut self, name: impl Into<String>, func: impl IntoGuestFn<P, R>) -> Self {
        let (signature, func) = func.into_guest_fn();
        self.exports.push(Export {
            name: name.into(),
            signature,
            func,
        });
        self
    }

    /// Builder: export initialized data
    pub fn export_data(mut self, name: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        self.data.push((name.into(), bytes.into()));
        self
    }

    /// Builder: do not export `malloc`/`free`
    pub fn without_allocator(mut self) -> Self {
        self.allocator = false;
        self
    }

    /// Builder: make every instance creation fail
    pub fn fail_instance_creation(mut self) -> Self {
        self.fail_instance_creation = true;
        self
    }

    /// Builder: hide the linear memory from the host
    pub fn without_memory(mut self) -> Self {
        self.hide_memory = true;
        self
    }

    /// Builder: do not export the runtime info symbol
    pub fn without_info_symbol(mut self) -> Self {
        self.hide_info_symbol = true;
        self
    }

    /// Finish the module.
    pub fn build(mut self) -> LocalModule {
        if self.allocator {
            self = self
                .export_fn("malloc", |cx: &GuestCx, size: u32| cx.malloc(size))
                .export("free", [Lane::I32], None, |cx: &GuestCx, args: &[WasmValue]| {
                    let p = args
                        .first()
                        .and_then(WasmValue::as_u32)
                        .ok_or("free takes one i32")?;
                    cx.free(p)?;
                    Ok(None)
                });
        }

        let mut offset = DATA_START;
        let mut data = Vec::with_capacity(self.data.len());
        for (name, bytes) in self.data {
            let len = u32::try_from(bytes.len()).unwrap_or(u32::MAX);
            data.push(DataExport {
                name,
                offset,
                bytes,
            });
            offset = align_up(offset.saturating_add(len), ALLOC_ALIGN);
        }

        LocalModule {
            runtime: Arc::new(LocalRuntime {
                mode: self.mode,
                module_name: self.module_name,
                exports: self.exports,
                data,
                heap_start: align_up(offset, 16),
                pages: self.pages,
                table_size: self.table_size,
                fail_instance_creation: self.fail_instance_creation,
                hide_memory: self.hide_memory,
                hide_info_symbol: self.hide_info_symbol,
                instances: Mutex::new(HashMap::new()),
                next_instance: AtomicU64::new(1),
                open_libraries: AtomicUsize::new(0),
            }),
        }
    }
}

impl From<LocalModuleBuilder> for LocalModule {
    fn from(builder: LocalModuleBuilder) -> Self {
        builder.build()
    }
}

fn align_up(value: u32, align: u32) -> u32 {
    value.saturating_add(align - 1) & !(align - 1)
}

struct DataExport {
    name: String,
    offset: u32,
    bytes: Vec<u8>,
}

/// A built module and the runtime it exports.
///
/// Cloning shares the module; every clone sees the same instances.
#[derive(Clone)]
pub struct LocalModule {
    runtime: Arc<LocalRuntime>,
}

impl LocalModule {
    /// Start declaring a flat-heap module.
    pub fn builder() -> LocalModuleBuilder {
        LocalModuleBuilder::default()
    }

    /// Instances currently alive.
    pub fn live_instances(&self) -> usize {
        self.runtime.instances.lock().len()
    }

    /// Times the module is currently open.
    pub fn open_libraries(&self) -> usize {
        self.runtime.open_libraries.load(Ordering::Acquire)
    }

    /// Outstanding sandbox allocations across all live instances.
    pub fn live_allocations(&self) -> usize {
        self.runtime
            .instances
            .lock()
            .values()
            .map(|i| i.heap.lock().live_count())
            .sum()
    }

    /// Occupied function table slots across all live instances.
    pub fn bound_functions(&self) -> usize {
        self.runtime
            .instances
            .lock()
            .values()
            .map(|i| i.table.lock().bound())
            .sum()
    }
}

impl fmt::Debug for LocalModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalModule")
            .field("mode", &self.runtime.mode)
            .field("exports", &self.runtime.exports.len())
            .field("pages", &self.runtime.pages)
            .finish()
    }
}

// ============================================================================
// Loader
// ============================================================================

/// Loader resolving paths to in-process modules.
#[derive(Debug, Default)]
pub struct LocalLoader {
    modules: HashMap<PathBuf, LocalModule>,
}

impl LocalLoader {
    /// Empty loader.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: serve `module` at `path`
    pub fn with_module(mut self, path: impl Into<PathBuf>, module: impl Into<LocalModule>) -> Self {
        self.modules.insert(path.into(), module.into());
        self
    }
}

impl ModuleLoader for LocalLoader {
    fn open(&self, path: &Path) -> std::result::Result<Box<dyn LoadedModule>, String> {
        let module = self
            .modules
            .get(path)
            .ok_or_else(|| "no such module".to_string())?;
        module.runtime.open_libraries.fetch_add(1, Ordering::AcqRel);
        Ok(Box::new(LocalLibrary {
            runtime: module.runtime.clone(),
        }))
    }
}

struct LocalLibrary {
    runtime: Arc<LocalRuntime>,
}

impl LoadedModule for LocalLibrary {
    fn sandbox_info(&self, symbol: &str) -> Option<Arc<dyn SandboxRuntime>> {
        let rt = &self.runtime;
        let expected = format!("{}{}", rt.module_name, rt.mode.info_symbol());
        if rt.hide_info_symbol || symbol != expected {
            return None;
        }
        let runtime: Arc<dyn SandboxRuntime> = rt.clone();
        Some(runtime)
    }

    fn resolve_symbol(&self, name: &str) -> Option<FuncRef> {
        let name = name.strip_prefix(self.runtime.mode.symbol_prefix())?;
        self.runtime
            .exports
            .iter()
            .position(|e| e.name == name)
            .map(|i| FuncRef(i as u64))
    }
}

impl Drop for LocalLibrary {
    fn drop(&mut self) {
        self.runtime.open_libraries.fetch_sub(1, Ordering::AcqRel);
    }
}

// ============================================================================
// Runtime
// ============================================================================

/// Runtime exported by a [`LocalModule`].
pub struct LocalRuntime {
    mode: Mode,
    module_name: String,
    exports: Vec<Export>,
    data: Vec<DataExport>,
    heap_start: u32,
    pages: u32,
    table_size: u32,
    fail_instance_creation: bool,
    hide_memory: bool,
    hide_info_symbol: bool,
    instances: Mutex<HashMap<u64, Arc<LocalInstance>>>,
    next_instance: AtomicU64,
    open_libraries: AtomicUsize,
}

impl LocalRuntime {
    fn instance(&self, handle: InstanceHandle) -> std::result::Result<Arc<LocalInstance>, String> {
        self.instances
            .lock()
            .get(&handle.0)
            .cloned()
            .ok_or_else(|| format!("unknown instance {}", handle.0))
    }

    fn new_instance(&self, params: &InstanceParams) -> Option<LocalInstance> {
        let memory = match self.mode {
            Mode::Capability => None,
            Mode::Flat => {
                let memory = Region::new(self.pages as usize * PAGE_SIZE as usize)?;
                for data in &self.data {
                    // SAFETY: data exports were laid out below `heap_start`,
                    // inside the fresh region.
                    unsafe {
                        ptr::copy_nonoverlapping(
                            data.bytes.as_ptr(),
                            memory.base().add(data.offset as usize),
                            data.bytes.len(),
                        )
                    };
                }
                Some(memory)
            }
        };

        let heap_end = memory
            .as_ref()
            .map_or(0, |m| u32::try_from(m.size).unwrap_or(u32::MAX));

        Some(LocalInstance {
            memory,
            heap: Mutex::new(FirstFit::new(self.heap_start, heap_end)),
            table: Mutex::new(FuncTable::new(self.table_size)),
            types: Mutex::new(Vec::new()),
            args: params.args.clone(),
        })
    }
}

impl SandboxRuntime for LocalRuntime {
    fn create_instance(&self, params: &InstanceParams) -> Option<InstanceHandle> {
        if self.fail_instance_creation {
            return None;
        }
        if params.max_pages != 0 && u64::from(self.pages) > params.max_pages {
            tracing::debug!(
                pages = self.pages,
                max_pages = params.max_pages,
                "module memory exceeds the requested maximum"
            );
            return None;
        }

        let instance = self.new_instance(params)?;
        let id = self.next_instance.fetch_add(1, Ordering::Relaxed);
        self.instances.lock().insert(id, Arc::new(instance));
        Some(InstanceHandle(id))
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
        let params = types.iter().take(param_count as usize).copied().collect::<Vec<_>>();
        let result = match result_count {
            0 => None,
            _ => types.get(param_count as usize).copied(),
        };
        match self.instance(instance) {
            Ok(inst) => inst.intern_type(WireSignature::new(params, result)),
            Err(_) => u32::MAX,
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
        let mut table = inst.table.lock();
        table.add(TableEntry {
            func_type,
            func,
            kind,
        })
    }

    fn remove_callback(&self, instance: InstanceHandle, slot: u32) {
        if let Ok(inst) = self.instance(instance) {
            inst.table.lock().remove(slot);
        }
    }

    fn lookup_nonfunc_export(&self, _instance: InstanceHandle, name: &str) -> Option<u32> {
        let name = name.strip_prefix(self.mode.symbol_prefix())?;
        self.data.iter().find(|d| d.name == name).map(|d| d.offset)
    }

    fn memory(&self, instance: InstanceHandle) -> Option<LinearMemory> {
        if self.hide_memory {
            return None;
        }
        let inst = self.instance(instance).ok()?;
        inst.memory.as_ref().map(|m| LinearMemory {
            base: m.base() as usize,
            size: m.size,
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
        let export = self
            .exports
            .get(func.0 as usize)
            .ok_or_else(|| format!("unknown function {}", func.0))?;

        let mut expected = vec![Lane::NATIVE_POINTER];
        expected.extend_from_slice(&export.signature.params);
        if signature.params != expected || signature.result != export.signature.result {
            return Err(format!(
                "{} has type {}, called as {}",
                export.name, export.signature, signature
            ));
        }
        if args.len() != expected.len() || args.iter().zip(&expected).any(|(v, l)| v.lane() != *l) {
            return Err(format!("{} called with {:?}", export.name, args));
        }
        if args[0] != instance.context_value() {
            return Err(format!("{} called with a foreign context", export.name));
        }

        let cx = GuestCx { instance: inst };
        let result = (export.func)(&cx, &args[1..])?;
        check_result(&export.signature, result)
    }
}

impl fmt::Debug for LocalRuntime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalRuntime")
            .field("mode", &self.mode)
            .field("module_name", &self.module_name)
            .finish()
    }
}

fn check_result(
    signature: &WireSignature,
    result: Option<WasmValue>,
) -> std::result::Result<Option<WasmValue>, String> {
    if result.map(|v| v.lane()) != signature.result {
        return Err(format!("{} returned {:?}", signature, result));
    }
    Ok(result)
}

// ============================================================================
// Instance state
// ============================================================================

struct LocalInstance {
    memory: Option<Region>,
    heap: Mutex<FirstFit>,
    table: Mutex<FuncTable>,
    types: Mutex<Vec<WireSignature>>,
    args: Vec<String>,
}

impl LocalInstance {
    fn intern_type(&self, signature: WireSignature) -> u32 {
        let mut types = self.types.lock();
        match types.iter().position(|t| *t == signature) {
            Some(i) => i as u32,
            None => {
                types.push(signature);
                (types.len() - 1) as u32
            }
        }
    }
}

/// Zeroed linear memory aligned to the page size.
struct Region {
    base: NonNull<u8>,
    size: usize,
    layout: Layout,
}

// SAFETY: the region is plain memory owned by the instance; concurrent
// access goes through raw copies, as it would for a compiled sandbox.
unsafe impl Send for Region {}
// SAFETY: see above.
unsafe impl Sync for Region {}

impl Region {
    fn new(size: usize) -> Option<Self> {
        let layout = Layout::from_size_align(size.max(PAGE_SIZE as usize), PAGE_SIZE as usize).ok()?;
        // SAFETY: the layout has a non-zero size.
        let base = NonNull::new(unsafe { alloc::alloc_zeroed(layout) })?;
        Some(Self {
            base,
            size: layout.size(),
            layout,
        })
    }

    fn base(&self) -> *mut u8 {
        self.base.as_ptr()
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout.
        unsafe { alloc::dealloc(self.base.as_ptr(), self.layout) }
    }
}

/// First-fit allocator over `[start, end)` of the linear memory.
#[derive(Debug)]
struct FirstFit {
    free: BTreeMap<u32, u32>,
    live: HashMap<u32, u32>,
}

impl FirstFit {
    fn new(start: u32, end: u32) -> Self {
        let mut free = BTreeMap::new();
        if end > start {
            free.insert(start, end - start);
        }
        Self {
            free,
            live: HashMap::new(),
        }
    }

    fn alloc(&mut self, size: u32) -> Option<u32> {
        let size = size.max(1).checked_add(ALLOC_ALIGN - 1)? & !(ALLOC_ALIGN - 1);
        let (offset, len) = self
            .free
            .iter()
            .find(|(_, len)| **len >= size)
            .map(|(o, l)| (*o, *l))?;
        self.free.remove(&offset);
        if len > size {
            self.free.insert(offset + size, len - size);
        }
        self.live.insert(offset, size);
        Some(offset)
    }

    fn free(&mut self, offset: u32) -> std::result::Result<(), String> {
        if offset == 0 {
            return Ok(());
        }
        let size = self
            .live
            .remove(&offset)
            .ok_or_else(|| format!("free of unallocated offset {offset:#x}"))?;

        let mut start = offset;
        let mut len = size;
        if let Some(next) = self.free.remove(&(offset + size)) {
            len += next;
        }
        if let Some((&prev, &prev_len)) = self.free.range(..offset).next_back() {
            if prev + prev_len == offset {
                self.free.remove(&prev);
                start = prev;
                len += prev_len;
            }
        }
        self.free.insert(start, len);
        Ok(())
    }

    fn live_count(&self) -> usize {
        self.live.len()
    }
}

#[derive(Clone)]
struct TableEntry {
    func_type: u32,
    func: WireFn,
    kind: CallbackKind,
}

/// Function table. Slot 0 is never bound, so a null function pointer never
/// resolves.
struct FuncTable {
    slots: Vec<Option<TableEntry>>,
    capacity: u32,
}

impl FuncTable {
    fn new(capacity: u32) -> Self {
        Self {
            slots: vec![None],
            capacity,
        }
    }

    fn add(&mut self, entry: TableEntry) -> Option<u32> {
        if let Some(i) = self.slots.iter().skip(1).position(Option::is_none) {
            let slot = i + 1;
            self.slots[slot] = Some(entry);
            return Some(slot as u32);
        }
        let slot = u32::try_from(self.slots.len()).ok()?;
        if slot > self.capacity {
            return None;
        }
        self.slots.push(Some(entry));
        Some(slot)
    }

    fn remove(&mut self, slot: u32) {
        if let Some(entry) = self.slots.get_mut(slot as usize) {
            *entry = None;
        }
    }

    fn get(&self, slot: u32) -> Option<&TableEntry> {
        self.slots.get(slot as usize).and_then(Option::as_ref)
    }

    fn bound(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

// ============================================================================
// Guest view
// ============================================================================

/// What a sandboxed function sees while it runs.
pub struct GuestCx {
    instance: Arc<LocalInstance>,
}

impl GuestCx {
    /// Size of the linear memory (0 for capability modules).
    pub fn memory_size(&self) -> usize {
        self.instance.memory.as_ref().map_or(0, |m| m.size)
    }

    /// Instance arguments.
    pub fn args(&self) -> &[String] {
        &self.instance.args
    }

    fn host_addr(&self, offset: u32, len: usize) -> std::result::Result<*mut u8, String> {
        let memory = self
            .instance
            .memory
            .as_ref()
            .ok_or("module has no linear memory")?;
        match (offset as usize).checked_add(len) {
            Some(end) if end <= memory.size => {
                // SAFETY: the range was checked against the region size.
                Ok(unsafe { memory.base().add(offset as usize) })
            }
            _ => Err(format!("out of bounds memory access at {offset:#x}+{len}")),
        }
    }

    /// Copy `len` bytes out of linear memory.
    pub fn read_bytes(&self, offset: u32, len: usize) -> std::result::Result<Vec<u8>, String> {
        let src = self.host_addr(offset, len)?;
        let mut bytes = vec![0u8; len];
        // SAFETY: `host_addr` checked the range.
        unsafe { ptr::copy_nonoverlapping(src, bytes.as_mut_ptr(), len) };
        Ok(bytes)
    }

    /// Copy `bytes` into linear memory.
    pub fn write_bytes(&self, offset: u32, bytes: &[u8]) -> std::result::Result<(), String> {
        let dst = self.host_addr(offset, bytes.len())?;
        // SAFETY: `host_addr` checked the range.
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), dst, bytes.len()) };
        Ok(())
    }

    /// Read a `T` at `offset`.
    pub fn read<T: Flat>(&self, offset: u32) -> std::result::Result<T, String> {
        let src = self.host_addr(offset, std::mem::size_of::<T>())?;
        // SAFETY: range checked; `Flat` accepts any bit pattern.
        Ok(unsafe { ptr::read_unaligned(src as *const T) })
    }

    /// Write a `T` at `offset`.
    pub fn write<T: Flat>(&self, offset: u32, value: T) -> std::result::Result<(), String> {
        self.write_bytes(offset, flat_bytes(&value))
    }

    /// Read a `T` at a native address.
    ///
    /// # Safety
    ///
    /// `addr` must point to `size_of::<T>()` readable bytes.
    pub unsafe fn read_native<T: Flat>(&self, addr: usize) -> T {
        // SAFETY: upheld by the caller.
        unsafe { ptr::read_unaligned(addr as *const T) }
    }

    /// Write a `T` at a native address.
    ///
    /// # Safety
    ///
    /// `addr` must point to `size_of::<T>()` writable bytes.
    pub unsafe fn write_native<T: Flat>(&self, addr: usize, value: T) {
        // SAFETY: upheld by the caller.
        unsafe { ptr::write_unaligned(addr as *mut T, value) }
    }

    /// Allocate from the module heap. 0 when exhausted.
    pub fn malloc(&self, size: u32) -> u32 {
        self.instance.heap.lock().alloc(size).unwrap_or(0)
    }

    /// Release a heap allocation. Freeing 0 is a no-op.
    pub fn free(&self, offset: u32) -> std::result::Result<(), String> {
        self.instance.heap.lock().free(offset)
    }

    /// Call function table slot `slot`, which must have type `signature`.
    pub fn call_indirect(
        &self,
        slot: u32,
        signature: &WireSignature,
        args: &[WasmValue],
    ) -> std::result::Result<Option<WasmValue>, String> {
        let entry = self
            .instance
            .table
            .lock()
            .get(slot)
            .cloned()
            .ok_or_else(|| format!("call through unbound table slot {slot}"))?;

        let expected = self.instance.intern_type(signature.clone());
        if entry.func_type != expected {
            return Err(format!("indirect call type mismatch at slot {slot}"));
        }
        if args.len() != signature.params.len()
            || args.iter().zip(&signature.params).any(|(v, l)| v.lane() != *l)
        {
            return Err(format!("indirect call to slot {slot} with {:?}", args));
        }

        tracing::trace!(slot, kind = ?entry.kind, "call_indirect");
        let result = (entry.func)(args);
        check_result(signature, result)
    }
}

impl fmt::Debug for GuestCx {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GuestCx")
            .field("memory_size", &self.memory_size())
            .finish()
    }
}
