//! Sandbox setup, teardown, and memory access.

use std::ops::Deref;
use std::path::Path;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, RwLock};

use crate::abi::Flat;
use crate::callback::CallbackTable;
use crate::config::SandboxConfig;
use crate::error::{fatal, AbiError, OrFatal, Result};
use crate::heap::ReturnSlot;
use crate::model::{FlatHeap, MemoryModel};
use crate::runtime::{InstanceHandle, LoadedModule, ModuleLoader, SandboxRuntime};

/// Shared state of one sandbox instance.
///
/// Reached through [`Sandbox`], which owns the instance, or through the
/// execution context while a call is in flight.
pub struct SandboxCore<M: MemoryModel> {
    this: Weak<SandboxCore<M>>,
    runtime: Arc<dyn SandboxRuntime>,
    // Closed on drop, after the instance is destroyed.
    module: Box<dyn LoadedModule>,
    instance: InstanceHandle,
    heap: M::Heap,
    config: SandboxConfig,
    pub(crate) return_slot: Mutex<ReturnSlot<M::Pointer>>,
    pub(crate) callbacks: RwLock<CallbackTable>,
    destroyed: AtomicBool,
}

impl<M: MemoryModel> std::fmt::Debug for SandboxCore<M> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxCore")
            .field("model", &M::NAME)
            .field("instance", &self.instance)
            .field("heap", &self.heap)
            .field("destroyed", &self.destroyed.load(Ordering::Relaxed))
            .finish()
    }
}

/// Destroys a created instance unless disarmed.
struct InstanceGuard<'a> {
    runtime: &'a dyn SandboxRuntime,
    instance: Option<InstanceHandle>,
}

impl InstanceGuard<'_> {
    fn disarm(mut self) -> Option<InstanceHandle> {
        self.instance.take()
    }
}

impl Drop for InstanceGuard<'_> {
    fn drop(&mut self) {
        if let Some(instance) = self.instance.take() {
            self.runtime.destroy_instance(instance);
        }
    }
}

impl<M: MemoryModel> SandboxCore<M> {
    fn create(
        loader: &dyn ModuleLoader,
        path: &Path,
        config: &SandboxConfig,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let module = loader.open(path).map_err(|reason| AbiError::LoadFailed {
            path: path.display().to_string(),
            reason,
        })?;

        let info_symbol = format!("{}{}", config.module_name, M::INFO_SYMBOL);
        let runtime = module
            .sandbox_info(&info_symbol)
            .ok_or(AbiError::MissingSymbol(info_symbol))?;

        M::runtime_init().call_once(|| runtime.sys_init());

        let params = M::instance_params(config)?;
        let instance = runtime
            .create_instance(&params)
            .ok_or(AbiError::InstanceCreation)?;
        let guard = InstanceGuard {
            runtime: runtime.as_ref(),
            instance: Some(instance),
        };

        let heap = M::setup_heap(runtime.as_ref(), module.as_ref(), instance, config)?;
        guard.disarm();

        tracing::debug!(
            model = M::NAME,
            path = %path.display(),
            instance = instance.0,
            "sandbox created"
        );

        Ok(Arc::new_cyclic(|this| SandboxCore {
            this: this.clone(),
            runtime,
            module,
            instance,
            heap,
            config: config.clone(),
            return_slot: Mutex::new(ReturnSlot::new(M::NULL)),
            callbacks: RwLock::new(CallbackTable::new(config.max_callbacks)),
            destroyed: AtomicBool::new(false),
        }))
    }

    /// Free the return slot and destroy the instance. Runs once.
    fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }

        let live = self.callbacks.write().drain();
        if !live.is_empty() {
            tracing::warn!(count = live.len(), "destroying sandbox with registered callbacks");
        }

        let slot = self.return_slot.lock().take();
        if let Some(slot) = slot {
            M::free(self, slot);
        }

        self.runtime.destroy_instance(self.instance);
        tracing::debug!(model = M::NAME, instance = self.instance.0, "sandbox destroyed");
    }

    /// Strong handle to this sandbox.
    pub(crate) fn self_arc(&self) -> Arc<Self> {
        self.this
            .upgrade()
            .unwrap_or_else(|| fatal(AbiError::NoActiveSandbox))
    }

    pub(crate) fn this_weak(&self) -> Weak<Self> {
        self.this.clone()
    }

    /// The runtime collaborator.
    pub fn runtime(&self) -> &dyn SandboxRuntime {
        self.runtime.as_ref()
    }

    /// The loaded module.
    pub fn module(&self) -> &dyn LoadedModule {
        self.module.as_ref()
    }

    /// The runtime instance.
    pub fn instance(&self) -> InstanceHandle {
        self.instance
    }

    /// Heap state captured at creation.
    pub fn heap(&self) -> &M::Heap {
        &self.heap
    }

    /// Creation config.
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Whether the sandbox has been destroyed.
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    // ========================================================================
    // Symbols
    // ========================================================================

    /// Resolve an exported function by its unprefixed name.
    pub fn lookup_function(&self, name: &str) -> Option<crate::runtime::FuncRef> {
        let symbol = format!("{}{}", M::SYMBOL_PREFIX, name);
        self.module.resolve_symbol(&symbol)
    }

    /// Resolve an exported symbol by its unprefixed name.
    ///
    /// Falls back to non-function exports, which resolve to a host address
    /// inside sandbox memory.
    pub fn lookup_symbol(&self, name: &str) -> Option<Symbol> {
        let symbol = format!("{}{}", M::SYMBOL_PREFIX, name);
        if let Some(func) = self.module.resolve_symbol(&symbol) {
            return Some(Symbol::Function(func));
        }
        M::lookup_data(self, &symbol).map(Symbol::Data)
    }

    // ========================================================================
    // Heap
    // ========================================================================

    /// Allocate `size` bytes in the sandbox. Null when the sandbox is out
    /// of memory.
    ///
    /// Fatal if `size` does not fit the sandbox pointer width.
    pub fn malloc_in_sandbox(&self, size: usize) -> M::Pointer {
        self.try_malloc_in_sandbox(size).or_fatal()
    }

    /// Allocate `size` bytes in the sandbox, reporting sizes that do not fit
    /// the sandbox pointer width as an error.
    pub fn try_malloc_in_sandbox(&self, size: usize) -> Result<M::Pointer> {
        let p = M::malloc(self, size)?;
        tracing::trace!(size, ptr = ?p, "sandbox malloc");
        Ok(p)
    }

    /// Release sandbox memory.
    pub fn free_in_sandbox(&self, p: M::Pointer) {
        tracing::trace!(ptr = ?p, "sandbox free");
        M::free(self, p);
    }

    /// Size of sandbox memory.
    pub fn get_total_memory(&self) -> usize {
        M::total_memory(self)
    }

    /// Host address of sandbox memory.
    pub fn get_memory_location(&self) -> usize {
        M::memory_location(self)
    }

    // ========================================================================
    // Raw memory access
    // ========================================================================

    /// Copy `len` bytes out of sandbox memory at host address `addr`.
    pub(crate) fn read_bytes(&self, addr: usize, len: usize) -> Result<Vec<u8>> {
        M::check_range(self, addr, len)?;
        let mut bytes = vec![0u8; len];
        // SAFETY: the range lies in sandbox memory, which stays mapped for
        // the sandbox lifetime; the sandbox may write it concurrently, so
        // bytes are copied out rather than borrowed.
        unsafe { ptr::copy_nonoverlapping(addr as *const u8, bytes.as_mut_ptr(), len) };
        Ok(bytes)
    }

    /// Copy `bytes` into sandbox memory at host address `addr`.
    pub(crate) fn write_bytes(&self, addr: usize, bytes: &[u8]) -> Result<()> {
        M::check_range(self, addr, bytes.len())?;
        // SAFETY: see `read_bytes`.
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), addr as *mut u8, bytes.len()) };
        Ok(())
    }

    /// Read a `T` at sandbox pointer `p` without bounds guarantees.
    ///
    /// # Safety
    ///
    /// `p` must point to `size_of::<T>()` readable bytes. The flat heap
    /// model checks this; for native pointers the caller vouches for it.
    pub unsafe fn read_unchecked<T: Flat>(&self, p: M::Pointer) -> Result<T> {
        let bytes = self.read_bytes(M::to_host(self, p), std::mem::size_of::<T>())?;
        // SAFETY: `Flat` types accept any bit pattern of their size.
        Ok(unsafe { ptr::read_unaligned(bytes.as_ptr() as *const T) })
    }

    /// Write a `T` at sandbox pointer `p` without bounds guarantees.
    ///
    /// # Safety
    ///
    /// `p` must point to `size_of::<T>()` writable bytes. The flat heap
    /// model checks this; for native pointers the caller vouches for it.
    pub unsafe fn write_unchecked<T: Flat>(&self, p: M::Pointer, value: T) -> Result<()> {
        self.write_bytes(M::to_host(self, p), crate::abi::flat_bytes(&value))
    }
}

impl SandboxCore<FlatHeap> {
    /// Whether the heap base is 4GB aligned, which the context-free
    /// swizzles on [`FlatHeap`] require.
    pub fn is_heap_aligned(&self) -> bool {
        self.heap().aligned
    }

    /// Read a `T` at sandbox offset `p`.
    pub fn read<T: Flat>(&self, p: u32) -> Result<T> {
        // SAFETY: flat heap accesses are bounds checked against the memory.
        unsafe { self.read_unchecked(p) }
    }

    /// Write a `T` at sandbox offset `p`.
    pub fn write<T: Flat>(&self, p: u32, value: T) -> Result<()> {
        // SAFETY: flat heap accesses are bounds checked against the memory.
        unsafe { self.write_unchecked(p, value) }
    }
}

/// Result of [`SandboxCore::lookup_symbol`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Symbol {
    /// Exported function
    Function(crate::runtime::FuncRef),
    /// Host address of exported data
    Data(usize),
}

// ============================================================================
// Owner
// ============================================================================

/// An owned sandbox instance. Dropping it destroys the instance.
#[derive(Debug)]
pub struct Sandbox<M: MemoryModel> {
    core: Arc<SandboxCore<M>>,
}

impl<M: MemoryModel> Sandbox<M> {
    /// Load the library at `path` and create a sandbox instance.
    ///
    /// In infallible mode (the default) any failure is fatal. In fallible
    /// mode creation errors are returned after partial state is torn down.
    pub fn create(
        loader: &dyn ModuleLoader,
        path: impl AsRef<Path>,
        config: &SandboxConfig,
    ) -> Result<Self> {
        match SandboxCore::create(loader, path.as_ref(), config) {
            Ok(core) => Ok(Self { core }),
            Err(e) if config.infallible => fatal(e),
            Err(e) => {
                tracing::debug!(error = %e, "sandbox creation failed");
                Err(e)
            }
        }
    }

    /// Destroy the sandbox. Equivalent to dropping it.
    pub fn destroy(self) {
        drop(self)
    }

    /// Shared handle to the sandbox state.
    pub fn core(&self) -> &Arc<SandboxCore<M>> {
        &self.core
    }
}

impl<M: MemoryModel> Deref for Sandbox<M> {
    type Target = SandboxCore<M>;

    fn deref(&self) -> &SandboxCore<M> {
        &self.core
    }
}

impl<M: MemoryModel> Drop for Sandbox<M> {
    fn drop(&mut self) {
        self.core.destroy();
    }
}
