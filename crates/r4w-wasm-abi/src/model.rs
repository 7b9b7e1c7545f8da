//! Memory models: how sandbox pointers relate to host addresses and who
//! owns the heap.
//!
//! | Model | Sandbox pointer | Allocator | Symbol prefix |
//! |-------|-----------------|-----------|---------------|
//! | [`FlatHeap`] | `u32` offset from the heap base | sandbox `malloc`/`free` | `w2c_` |
//! | [`Capability`] | native address | host allocator | none |
//!
//! The swizzles here are pure address arithmetic. Null handling for values
//! crossing the boundary lives in the marshaling layer.

use std::fmt;
use std::hash::Hash;
use std::sync::Once;

use crate::abi::{AbiType, HostValue, Lane, Signature, WasmValue};
use crate::config::SandboxConfig;
use crate::error::{AbiError, Result};
use crate::heap::{adjusted_heap_size, heap_page_count};
use crate::runtime::{FuncRef, InstanceHandle, InstanceParams, LoadedModule, SandboxRuntime};
use crate::sandbox::SandboxCore;

/// A pointer representation and heap ownership scheme.
pub trait MemoryModel: Sized + Send + Sync + 'static {
    /// Sandbox pointer representation
    type Pointer: Copy + Eq + Hash + fmt::Debug + Send + Sync + 'static;

    /// Per-sandbox heap state captured at creation
    type Heap: fmt::Debug + Send + Sync;

    /// Model name, for diagnostics.
    const NAME: &'static str;

    /// Suffix of the runtime info symbol (after the module name).
    const INFO_SYMBOL: &'static str;

    /// Prefix applied to exported symbol names.
    const SYMBOL_PREFIX: &'static str;

    /// Lane of a sandbox pointer.
    const POINTER_LANE: Lane;

    /// Sandbox null.
    const NULL: Self::Pointer;

    /// Guard for the process-wide runtime initialization hook.
    fn runtime_init() -> &'static Once;

    /// Instance creation parameters derived from the configuration.
    fn instance_params(config: &SandboxConfig) -> Result<InstanceParams>;

    /// Capture heap state of a freshly created instance.
    fn setup_heap(
        runtime: &dyn SandboxRuntime,
        module: &dyn LoadedModule,
        instance: InstanceHandle,
        config: &SandboxConfig,
    ) -> Result<Self::Heap>;

    /// Pointer to its wire value.
    fn pointer_to_wire(p: Self::Pointer) -> WasmValue;

    /// Pointer from its wire value.
    fn pointer_from_wire(v: WasmValue) -> Option<Self::Pointer>;

    /// Raw bits of a pointer.
    fn pointer_to_bits(p: Self::Pointer) -> u64;

    /// Pointer from raw bits, if representable.
    fn pointer_from_bits(bits: u64) -> Option<Self::Pointer>;

    /// Host address of sandbox data.
    fn to_host(sandbox: &SandboxCore<Self>, p: Self::Pointer) -> usize;

    /// Sandbox pointer of host data.
    fn to_sandbox(sandbox: &SandboxCore<Self>, addr: usize) -> Self::Pointer;

    /// Check that `len` bytes at `addr` lie in sandbox memory.
    fn check_range(sandbox: &SandboxCore<Self>, addr: usize, len: usize) -> Result<()>;

    /// Whether `addr` lies in sandbox memory.
    fn in_sandbox_memory(sandbox: &SandboxCore<Self>, addr: usize) -> bool;

    /// Whether two host addresses belong to the same sandbox, as seen from
    /// `sandbox`.
    fn same_sandbox(sandbox: &SandboxCore<Self>, a: usize, b: usize) -> bool;

    /// Size of sandbox memory.
    fn total_memory(sandbox: &SandboxCore<Self>) -> usize;

    /// Host address of sandbox memory.
    fn memory_location(sandbox: &SandboxCore<Self>) -> usize;

    /// Host address of a non-function export.
    fn lookup_data(sandbox: &SandboxCore<Self>, name: &str) -> Option<usize>;

    /// Allocate `size` bytes of sandbox memory. Returns null when the
    /// sandbox allocator is exhausted.
    fn malloc(sandbox: &SandboxCore<Self>, size: usize) -> Result<Self::Pointer>;

    /// Release memory obtained from [`MemoryModel::malloc`].
    fn free(sandbox: &SandboxCore<Self>, p: Self::Pointer);
}

// ============================================================================
// Flat heap
// ============================================================================

/// 32-bit offsets into one contiguous linear memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlatHeap {}

/// Heap state of a [`FlatHeap`] sandbox.
#[derive(Debug, Clone, Copy)]
pub struct FlatHeapState {
    /// Host address of offset 0, fixed for the sandbox lifetime
    pub base: usize,
    /// Memory size observed at creation
    pub initial_size: usize,
    /// Base is 4GB aligned on a 64-bit host, so the context-free swizzles
    /// and the mask comparison of [`FlatHeap::same_aligned_heap`] hold
    pub aligned: bool,
    /// Exported allocator
    pub malloc: FuncRef,
    /// Exported deallocator
    pub free: FuncRef,
}

static FLAT_HEAP_INIT: Once = Once::new();

impl FlatHeap {
    /// Mask selecting the bits above the 32-bit offset.
    pub const HEAP_BASE_MASK: usize = !(u32::MAX as usize);

    /// Host address of `p` without sandbox context, using any host pointer
    /// into the same sandbox to recover the heap base.
    ///
    /// Only valid on 64-bit hosts for heaps aligned to 4GB; check
    /// [`SandboxCore::is_heap_aligned`] or create the sandbox with
    /// [`SandboxConfig::aligned`]. On other heaps the result is wrong.
    pub fn unsandboxed_pointer_no_ctx(p: u32, example_host_ptr: usize) -> usize {
        (example_host_ptr & Self::HEAP_BASE_MASK) | p as usize
    }

    /// Offset of `addr` without sandbox context.
    ///
    /// Same precondition as [`FlatHeap::unsandboxed_pointer_no_ctx`].
    pub fn sandboxed_pointer_no_ctx(addr: usize) -> u32 {
        (addr & !Self::HEAP_BASE_MASK) as u32
    }

    /// Whether two addresses share the bits above the 32-bit offset.
    ///
    /// Identifies the sandbox only when every heap is 4GB aligned.
    pub fn same_aligned_heap(a: usize, b: usize) -> bool {
        (a & Self::HEAP_BASE_MASK) == (b & Self::HEAP_BASE_MASK)
    }

    fn allocator_signature(ret: AbiType) -> Signature {
        Signature::new([AbiType::U32], ret)
    }
}

impl MemoryModel for FlatHeap {
    type Pointer = u32;
    type Heap = FlatHeapState;

    const NAME: &'static str = "flat-heap";
    const INFO_SYMBOL: &'static str = "get_wasm2c_sandbox_info";
    const SYMBOL_PREFIX: &'static str = "w2c_";
    const POINTER_LANE: Lane = Lane::I32;
    const NULL: u32 = 0;

    fn runtime_init() -> &'static Once {
        &FLAT_HEAP_INIT
    }

    fn instance_params(config: &SandboxConfig) -> Result<InstanceParams> {
        let heap_size = adjusted_heap_size(config.max_heap_size);
        let max_pages = heap_page_count(heap_size)?;
        Ok(InstanceParams {
            max_pages,
            args: Vec::new(),
        })
    }

    fn setup_heap(
        runtime: &dyn SandboxRuntime,
        module: &dyn LoadedModule,
        instance: InstanceHandle,
        config: &SandboxConfig,
    ) -> Result<FlatHeapState> {
        let memory = runtime.memory(instance).ok_or(AbiError::MissingMemory)?;

        let aligned =
            cfg!(target_pointer_width = "64") && memory.base & !Self::HEAP_BASE_MASK == 0;
        if cfg!(target_pointer_width = "64") && config.require_aligned_heap && !aligned {
            return Err(AbiError::MisalignedHeap(memory.base));
        }

        let resolve = |name: &str| {
            let symbol = format!("{}{}", Self::SYMBOL_PREFIX, name);
            module
                .resolve_symbol(&symbol)
                .ok_or(AbiError::MissingSymbol(symbol))
        };

        Ok(FlatHeapState {
            base: memory.base,
            initial_size: memory.size,
            aligned,
            malloc: resolve("malloc")?,
            free: resolve("free")?,
        })
    }

    fn pointer_to_wire(p: u32) -> WasmValue {
        WasmValue::I32(p)
    }

    fn pointer_from_wire(v: WasmValue) -> Option<u32> {
        v.as_u32()
    }

    fn pointer_to_bits(p: u32) -> u64 {
        u64::from(p)
    }

    fn pointer_from_bits(bits: u64) -> Option<u32> {
        u32::try_from(bits).ok()
    }

    fn to_host(sandbox: &SandboxCore<Self>, p: u32) -> usize {
        sandbox.heap().base.wrapping_add(p as usize)
    }

    fn to_sandbox(sandbox: &SandboxCore<Self>, addr: usize) -> u32 {
        addr.wrapping_sub(sandbox.heap().base) as u32
    }

    fn check_range(sandbox: &SandboxCore<Self>, addr: usize, len: usize) -> Result<()> {
        let base = sandbox.heap().base;
        let size = Self::total_memory(sandbox);
        let end = addr.checked_add(len);
        match end {
            Some(end) if addr >= base && end <= base + size => Ok(()),
            _ => Err(AbiError::OutOfBounds { addr, len }),
        }
    }

    fn in_sandbox_memory(sandbox: &SandboxCore<Self>, addr: usize) -> bool {
        let base = sandbox.heap().base;
        addr >= base && addr < base + Self::total_memory(sandbox)
    }

    fn same_sandbox(sandbox: &SandboxCore<Self>, a: usize, b: usize) -> bool {
        if sandbox.heap().aligned {
            Self::same_aligned_heap(a, b)
        } else {
            Self::in_sandbox_memory(sandbox, a) && Self::in_sandbox_memory(sandbox, b)
        }
    }

    fn total_memory(sandbox: &SandboxCore<Self>) -> usize {
        sandbox
            .runtime()
            .memory(sandbox.instance())
            .map_or(sandbox.heap().initial_size, |m| m.size)
    }

    fn memory_location(sandbox: &SandboxCore<Self>) -> usize {
        sandbox.heap().base
    }

    fn lookup_data(sandbox: &SandboxCore<Self>, name: &str) -> Option<usize> {
        let index = sandbox
            .runtime()
            .lookup_nonfunc_export(sandbox.instance(), name)?;
        Some(sandbox.heap().base + index as usize)
    }

    fn malloc(sandbox: &SandboxCore<Self>, size: usize) -> Result<u32> {
        let size = u32::try_from(size).map_err(|_| AbiError::AllocationTooLarge(size))?;
        let signature = Self::allocator_signature(AbiType::U32);
        match sandbox.invoke(sandbox.heap().malloc, &signature, &[HostValue::Int(i64::from(size))]) {
            HostValue::Int(p) => Ok(p as u32),
            other => Err(AbiError::SignatureMismatch(format!(
                "malloc returned {:?}",
                other
            ))),
        }
    }

    fn free(sandbox: &SandboxCore<Self>, p: u32) {
        let signature = Self::allocator_signature(AbiType::Void);
        sandbox.invoke(sandbox.heap().free, &signature, &[HostValue::Int(i64::from(p))]);
    }
}

// ============================================================================
// Object capability
// ============================================================================

/// Native pointers; isolation is enforced below this layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {}

/// Heap state of a [`Capability`] sandbox. The heap is the host heap.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostHeap;

static CAPABILITY_INIT: Once = Once::new();

impl MemoryModel for Capability {
    type Pointer = usize;
    type Heap = HostHeap;

    const NAME: &'static str = "capability";
    const INFO_SYMBOL: &'static str = "get_mswasm_sandbox_info";
    const SYMBOL_PREFIX: &'static str = "";
    const POINTER_LANE: Lane = Lane::NATIVE_POINTER;
    const NULL: usize = 0;

    fn runtime_init() -> &'static Once {
        &CAPABILITY_INIT
    }

    fn instance_params(config: &SandboxConfig) -> Result<InstanceParams> {
        Ok(InstanceParams {
            max_pages: 0,
            args: config.args.clone(),
        })
    }

    fn setup_heap(
        _runtime: &dyn SandboxRuntime,
        _module: &dyn LoadedModule,
        _instance: InstanceHandle,
        _config: &SandboxConfig,
    ) -> Result<HostHeap> {
        Ok(HostHeap)
    }

    fn pointer_to_wire(p: usize) -> WasmValue {
        WasmValue::from_native_pointer(p)
    }

    fn pointer_from_wire(v: WasmValue) -> Option<usize> {
        match (Lane::NATIVE_POINTER, v) {
            (Lane::I64, WasmValue::I64(p)) => usize::try_from(p).ok(),
            (Lane::I32, WasmValue::I32(p)) => Some(p as usize),
            _ => None,
        }
    }

    fn pointer_to_bits(p: usize) -> u64 {
        p as u64
    }

    fn pointer_from_bits(bits: u64) -> Option<usize> {
        usize::try_from(bits).ok()
    }

    fn to_host(_sandbox: &SandboxCore<Self>, p: usize) -> usize {
        p
    }

    fn to_sandbox(_sandbox: &SandboxCore<Self>, addr: usize) -> usize {
        addr
    }

    fn check_range(_sandbox: &SandboxCore<Self>, addr: usize, len: usize) -> Result<()> {
        if addr == 0 || addr.checked_add(len).is_none() {
            return Err(AbiError::OutOfBounds { addr, len });
        }
        Ok(())
    }

    fn in_sandbox_memory(_sandbox: &SandboxCore<Self>, _addr: usize) -> bool {
        true
    }

    fn same_sandbox(_sandbox: &SandboxCore<Self>, _a: usize, _b: usize) -> bool {
        true
    }

    fn total_memory(_sandbox: &SandboxCore<Self>) -> usize {
        usize::MAX
    }

    fn memory_location(_sandbox: &SandboxCore<Self>) -> usize {
        0
    }

    fn lookup_data(_sandbox: &SandboxCore<Self>, _name: &str) -> Option<usize> {
        None
    }

    fn malloc(_sandbox: &SandboxCore<Self>, size: usize) -> Result<usize> {
        // SAFETY: plain host allocation; a null result is passed through.
        let p = unsafe { libc::malloc(size) };
        Ok(p as usize)
    }

    fn free(_sandbox: &SandboxCore<Self>, p: usize) {
        // SAFETY: `p` came from `malloc` above or is null.
        unsafe { libc::free(p as *mut libc::c_void) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_no_ctx_swizzle() {
        let base = 0x7f00_0000_0000usize;
        let host = FlatHeap::unsandboxed_pointer_no_ctx(0x1234, base + 0x10);
        assert_eq!(host, base + 0x1234);
        assert_eq!(FlatHeap::sandboxed_pointer_no_ctx(host), 0x1234);
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_flat_same_sandbox() {
        let base = 0x7f00_0000_0000usize;
        assert!(FlatHeap::same_aligned_heap(base + 4, base + 0xFFFF_FFFF));
        assert!(!FlatHeap::same_aligned_heap(base + 4, base + 0x1_0000_0004));
    }

    #[test]
    fn test_flat_instance_params() {
        let config = SandboxConfig::default().max_heap_size(100_000);
        let params = FlatHeap::instance_params(&config).unwrap();
        assert_eq!(params.max_pages, 2);

        let params = FlatHeap::instance_params(&SandboxConfig::default()).unwrap();
        assert_eq!(params.max_pages, 0);
    }

    #[test]
    fn test_flat_heap_request_above_4gb_is_capped() {
        let config = SandboxConfig::default().max_heap_size(u64::MAX);
        let params = FlatHeap::instance_params(&config).unwrap();
        assert_eq!(params.max_pages, crate::heap::MAX_PAGES);
    }

    #[test]
    fn test_capability_instance_params_forward_args() {
        let config = SandboxConfig::default().arg("prog").arg("--fast");
        let params = Capability::instance_params(&config).unwrap();
        assert_eq!(params.args, vec!["prog".to_string(), "--fast".to_string()]);
        assert_eq!(params.max_pages, 0);
    }
}
