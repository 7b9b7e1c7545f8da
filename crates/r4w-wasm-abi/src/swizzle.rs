//! Pointer swizzling between host addresses and sandbox pointers.

use std::sync::Arc;

use crate::abi::{Signature, WasmValue};
use crate::callback::HostFunction;
use crate::error::{fatal, AbiError};
use crate::model::MemoryModel;
use crate::runtime::{CallbackKind, FuncRef, WireFn};
use crate::sandbox::SandboxCore;

impl<M: MemoryModel> SandboxCore<M> {
    /// Host address of sandbox data pointer `p`.
    pub fn get_unsandboxed_pointer(&self, p: M::Pointer) -> usize {
        M::to_host(self, p)
    }

    /// Sandbox pointer of host data address `addr`.
    pub fn get_sandboxed_pointer(&self, addr: usize) -> M::Pointer {
        M::to_sandbox(self, addr)
    }

    /// Host function bound at sandbox function pointer `p`.
    ///
    /// `None` when `p` was never bound by this sandbox, e.g. a function of
    /// the sandboxed module itself.
    pub fn get_unsandboxed_fn_pointer(&self, p: M::Pointer) -> Option<HostFunction> {
        let bits = M::pointer_to_bits(p);
        let slot = u32::try_from(bits).ok()?;
        self.callbacks.read().slot_assignments.get(&slot).cloned()
    }

    /// Sandbox function pointer for the module export `func`.
    ///
    /// The first request binds `func` into the sandbox function table as an
    /// internal function; later requests return the same slot.
    pub fn get_sandboxed_fn_pointer(&self, func: FuncRef, signature: &Signature) -> M::Pointer {
        let mut table = self.callbacks.write();

        let slot = match table.internal.get(&func) {
            Some(slot) => *slot,
            None => {
                let func_type = self.func_type_index(signature);
                let slot = self
                    .runtime()
                    .add_callback(
                        self.instance(),
                        func_type,
                        self.internal_binding(func, signature),
                        CallbackKind::Internal,
                    )
                    .unwrap_or_else(|| {
                        fatal(AbiError::CallbackTableFull {
                            capacity: table.capacity(),
                        })
                    });
                table.internal.insert(func, slot);
                table.slot_assignments.insert(slot, HostFunction::Export(func));
                tracing::debug!(func = func.0, slot, "export bound into function table");
                slot
            }
        };

        M::pointer_from_bits(u64::from(slot)).unwrap_or_else(|| {
            fatal(AbiError::SignatureMismatch(format!(
                "slot {slot} is not a sandbox pointer"
            )))
        })
    }

    /// Table entry forwarding to an export with the sandbox context added.
    fn internal_binding(&self, func: FuncRef, signature: &Signature) -> WireFn {
        let sandbox = self.this_weak();
        let wire_signature = signature.rewrite_for_call().lower(M::POINTER_LANE);
        Arc::new(move |args: &[WasmValue]| {
            let sandbox = sandbox
                .upgrade()
                .unwrap_or_else(|| fatal(AbiError::NoActiveSandbox));
            let mut full = Vec::with_capacity(args.len() + 1);
            full.push(sandbox.instance().context_value());
            full.extend_from_slice(args);
            sandbox
                .runtime()
                .call(sandbox.instance(), func, &wire_signature, &full)
                .unwrap_or_else(|trap| fatal(AbiError::Trap(trap)))
        })
    }

    /// Whether two host addresses lie in the same sandbox.
    ///
    /// On a flat heap that is not 4GB aligned both addresses must lie in
    /// this sandbox's memory.
    pub fn is_in_same_sandbox(&self, a: usize, b: usize) -> bool {
        M::same_sandbox(self, a, b)
    }

    /// Whether `addr` lies in this sandbox's memory.
    pub fn is_pointer_in_sandbox_memory(&self, addr: usize) -> bool {
        M::in_sandbox_memory(self, addr)
    }

    /// Whether `addr` lies outside this sandbox's memory.
    pub fn is_pointer_in_app_memory(&self, addr: usize) -> bool {
        !self.is_pointer_in_sandbox_memory(addr)
    }
}
