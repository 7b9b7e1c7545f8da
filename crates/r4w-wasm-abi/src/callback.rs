//! Callback registry and trampolines.
//!
//! A sandbox reaches host code through a bounded table of callbacks. Each
//! registered callback gets a trampoline bound into the sandbox function
//! table; when sandboxed code calls through that slot, the trampoline
//! resolves the host callback under a shared lock, converts the wire
//! arguments to host values, and runs it.
//!
//! ```text
//!   sandbox call_indirect(slot)
//!        │
//!        ▼
//!   trampoline(index) ── last callback = index
//!        │
//!        ├── read lock: callbacks[index] ── clone, unlock
//!        ├── wire args ─► host values (aggregates read from sandbox memory)
//!        ├── callback(host values)
//!        └── result ─► wire (aggregates written through the out pointer)
//! ```

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::num::NonZeroUsize;
use std::sync::Arc;

use crate::abi::{AbiType, HostValue, Signature, WasmValue};
use crate::context;
use crate::error::{fatal, AbiError, OrFatal};
use crate::model::MemoryModel;
use crate::runtime::{CallbackKind, FuncRef, WireFn};
use crate::sandbox::SandboxCore;

/// Caller-chosen identity of a registered callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CallbackKey(NonZeroUsize);

impl CallbackKey {
    /// Key from a non-zero value.
    pub fn new(value: usize) -> Option<Self> {
        NonZeroUsize::new(value).map(Self)
    }

    /// Key derived from the address of `object`.
    pub fn of<T>(object: &T) -> Self {
        let addr = object as *const T as usize;
        Self(NonZeroUsize::new(addr).unwrap_or(NonZeroUsize::MIN))
    }

    /// Raw key value.
    pub fn get(self) -> usize {
        self.0.get()
    }
}

/// Host function body of a callback, over host values.
pub type HostCallbackFn = dyn Fn(&[HostValue]) -> HostValue + Send + Sync;

/// A host function with its logical signature.
#[derive(Clone)]
pub struct Callback {
    signature: Signature,
    func: Arc<HostCallbackFn>,
}

impl Callback {
    /// Create a callback.
    pub fn new<F>(signature: Signature, func: F) -> Self
    where
        F: Fn(&[HostValue]) -> HostValue + Send + Sync + 'static,
    {
        Self {
            signature,
            func: Arc::new(func),
        }
    }

    /// Logical signature.
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Run the host function.
    pub fn call(&self, args: &[HostValue]) -> HostValue {
        (self.func)(args)
    }

    /// Whether both handles refer to the same host function.
    pub fn ptr_eq(&self, other: &Callback) -> bool {
        Arc::ptr_eq(&self.func, &other.func)
    }
}

impl fmt::Debug for Callback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callback")
            .field("signature", &self.signature)
            .field("func", &Arc::as_ptr(&self.func))
            .finish()
    }
}

/// What a sandbox function table slot resolves to on the host side.
#[derive(Debug, Clone)]
pub enum HostFunction {
    /// A module export bound as an internal function
    Export(FuncRef),
    /// A registered host callback
    Callback(Callback),
}

#[derive(Debug, Clone)]
pub(crate) struct CallbackEntry {
    pub(crate) key: CallbackKey,
    pub(crate) callback: Callback,
    pub(crate) slot: u32,
}

/// Fixed-capacity callback arena with a free set.
///
/// Registration takes the lowest free index, so freed indices are reused
/// first-empty-first.
#[derive(Debug)]
pub(crate) struct CallbackTable {
    entries: Vec<Option<CallbackEntry>>,
    free: BTreeSet<usize>,
    by_key: HashMap<CallbackKey, usize>,
    /// Module exports bound into the function table, by export.
    pub(crate) internal: HashMap<FuncRef, u32>,
    /// Function table slot to host function.
    pub(crate) slot_assignments: HashMap<u32, HostFunction>,
}

impl CallbackTable {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            entries: vec![None; capacity],
            free: (0..capacity).collect(),
            by_key: HashMap::new(),
            internal: HashMap::new(),
            slot_assignments: HashMap::new(),
        }
    }

    pub(crate) fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Number of registered callbacks.
    pub(crate) fn len(&self) -> usize {
        self.by_key.len()
    }

    pub(crate) fn first_free(&self) -> Option<usize> {
        self.free.first().copied()
    }

    pub(crate) fn contains_key(&self, key: CallbackKey) -> bool {
        self.by_key.contains_key(&key)
    }

    pub(crate) fn insert(&mut self, index: usize, entry: CallbackEntry) {
        debug_assert!(self.entries[index].is_none());
        self.free.remove(&index);
        self.by_key.insert(entry.key, index);
        self.slot_assignments
            .insert(entry.slot, HostFunction::Callback(entry.callback.clone()));
        self.entries[index] = Some(entry);
    }

    pub(crate) fn remove(&mut self, key: CallbackKey) -> Option<(usize, CallbackEntry)> {
        let index = self.by_key.remove(&key)?;
        let entry = self.entries[index].take()?;
        self.slot_assignments.remove(&entry.slot);
        self.free.insert(index);
        Some((index, entry))
    }

    pub(crate) fn get(&self, index: usize) -> Option<&CallbackEntry> {
        self.entries.get(index).and_then(Option::as_ref)
    }

    pub(crate) fn drain(&mut self) -> Vec<CallbackEntry> {
        let entries = self.entries.iter_mut().filter_map(Option::take).collect();
        self.free = (0..self.entries.len()).collect();
        self.by_key.clear();
        self.slot_assignments.clear();
        self.internal.clear();
        entries
    }
}

// ============================================================================
// Registration
// ============================================================================

impl<M: MemoryModel> SandboxCore<M> {
    /// Register `callback` under `key` and return its sandbox function pointer.
    ///
    /// Fatal when every callback index is in use or `key` is already
    /// registered. The table is left untouched in both cases.
    pub fn register_callback(&self, key: CallbackKey, callback: Callback) -> M::Pointer {
        let mut table = self.callbacks.write();

        if table.contains_key(key) {
            fatal(AbiError::DuplicateCallbackKey(key.get()));
        }
        let index = table.first_free().unwrap_or_else(|| {
            fatal(AbiError::CallbackTableFull {
                capacity: table.capacity(),
            })
        });

        let func_type = self.func_type_index(callback.signature());
        let trampoline = trampoline::<M>(index);
        let slot = self
            .runtime()
            .add_callback(self.instance(), func_type, trampoline, CallbackKind::External)
            .unwrap_or_else(|| {
                fatal(AbiError::CallbackTableFull {
                    capacity: table.capacity(),
                })
            });

        tracing::debug!(index, slot, key = key.get(), "callback registered");
        table.insert(
            index,
            CallbackEntry {
                key,
                callback,
                slot,
            },
        );
        M::pointer_from_bits(u64::from(slot))
            .ok_or_else(|| AbiError::SignatureMismatch(format!("slot {slot} is not a sandbox pointer")))
            .or_fatal()
    }

    /// Register a closure as a callback. See [`SandboxCore::register_callback`].
    pub fn register_fn<P, R>(
        &self,
        key: CallbackKey,
        func: impl crate::abi::IntoCallback<P, R>,
    ) -> M::Pointer {
        self.register_callback(key, func.into_callback())
    }

    /// Unregister the callback registered under `key`.
    ///
    /// Fatal if `key` is not registered.
    pub fn unregister_callback(&self, key: CallbackKey) {
        let mut table = self.callbacks.write();
        let (index, entry) = table
            .remove(key)
            .unwrap_or_else(|| fatal(AbiError::UnknownCallback));
        self.runtime().remove_callback(self.instance(), entry.slot);
        tracing::debug!(index, slot = entry.slot, key = key.get(), "callback unregistered");
    }

    /// Number of registered callbacks.
    pub fn callback_count(&self) -> usize {
        self.callbacks.read().len()
    }

    /// Index of the sandbox function type a callback with `signature`
    /// occupies.
    pub(crate) fn func_type_index(&self, signature: &Signature) -> u32 {
        let wire = signature.rewrite_for_callback().lower(M::POINTER_LANE);
        self.runtime().lookup_func_index(
            self.instance(),
            wire.params.len() as u32,
            wire.result_count() as u32,
            &wire.type_array(),
        )
    }

    /// Run `callback` for a trampoline firing with wire arguments.
    pub(crate) fn dispatch_callback(
        &self,
        callback: &Callback,
        args: &[WasmValue],
    ) -> Option<WasmValue> {
        let signature = callback.signature();
        let promoted = signature.returns_aggregate();
        let expected = signature.params().len() + usize::from(promoted);
        if args.len() != expected {
            fatal(AbiError::SignatureMismatch(format!(
                "callback {} received {} arguments",
                signature,
                args.len()
            )));
        }

        let (out, params) = if promoted {
            (Some(args[0]), &args[1..])
        } else {
            (None, args)
        };

        let host_args = signature
            .params()
            .iter()
            .zip(params)
            .map(|(ty, v)| self.wire_to_host(ty, *v))
            .collect::<Vec<_>>();

        let result = callback.call(&host_args);

        match out {
            Some(out) => {
                let out = M::pointer_from_wire(out).unwrap_or_else(|| {
                    fatal(AbiError::SignatureMismatch(format!(
                        "callback out pointer {:?}",
                        out
                    )))
                });
                match (signature.ret(), result) {
                    (AbiType::Aggregate(layout), HostValue::Aggregate(bytes))
                        if bytes.len() == layout.size =>
                    {
                        self.write_bytes(M::to_host(self, out), &bytes).or_fatal();
                    }
                    (ty, other) => fatal(AbiError::SignatureMismatch(format!(
                        "callback returned {:?} for {}",
                        other, ty
                    ))),
                }
                None
            }
            None => self.host_to_wire(&signature.ret(), &result),
        }
    }

    /// The sandbox and key of the callback executing on this thread.
    pub fn get_executed_callback_sandbox_and_key() -> Option<(Arc<SandboxCore<M>>, CallbackKey)> {
        let sandbox = context::current_sandbox::<M>()?;
        let index = context::last_callback()? as usize;
        let key = sandbox.callbacks.read().get(index).map(|e| e.key)?;
        Some((sandbox, key))
    }
}

/// Trampoline for callback table index `index`.
///
/// Resolves the sandbox from the thread's execution context, since the
/// sandbox calling convention carries no sandbox argument for callbacks.
fn trampoline<M: MemoryModel>(index: usize) -> WireFn {
    Arc::new(move |args: &[WasmValue]| {
        let _callback = context::enter_callback(index as u32);
        let sandbox =
            context::current_sandbox::<M>().unwrap_or_else(|| fatal(AbiError::NoActiveSandbox));
        let callback = {
            let table = sandbox.callbacks.read();
            table
                .get(index)
                .map(|entry| entry.callback.clone())
                .unwrap_or_else(|| fatal(AbiError::EmptyCallbackSlot(index)))
        };
        sandbox.dispatch_callback(&callback, args)
    })
}
