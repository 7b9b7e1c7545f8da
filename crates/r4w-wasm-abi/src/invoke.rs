//! Invocation adapter: host → sandbox calls and value marshaling.
//!
//! A call is rewritten for the sandbox calling convention:
//!
//! 1. an aggregate return becomes a leading out-pointer into the return slot
//! 2. the execution context is prepended
//! 3. aggregate arguments are copied into scratch sandbox memory and passed
//!    by pointer; the scratch memory is freed after the call returns

use crate::abi::{scalar_from_wire, scalar_to_wire, AbiType, HostValue, Signature, WasmValue};
use crate::context;
use crate::error::{fatal, AbiError, OrFatal};
use crate::model::MemoryModel;
use crate::runtime::FuncRef;
use crate::sandbox::SandboxCore;

impl<M: MemoryModel> SandboxCore<M> {
    /// Call the sandboxed function `func`, whose host-level signature is
    /// `signature`.
    ///
    /// Pointer arguments are host addresses and are swizzled on the way in;
    /// pointer results are swizzled back. Function pointer arguments are
    /// passed in their sandbox representation. A trap in the sandbox, an
    /// argument that does not match `signature`, or running out of sandbox
    /// memory for scratch copies is fatal.
    #[doc(alias = "invoke_with_func_ptr")]
    pub fn invoke(&self, func: FuncRef, signature: &Signature, args: &[HostValue]) -> HostValue {
        let _context = context::enter(self.self_arc());

        if let AbiType::Aggregate(layout) = signature.ret() {
            let slot = self.ensure_return_slot(layout.size);
            let slot_addr = M::to_host(self, slot);

            let mut promoted_args = Vec::with_capacity(args.len() + 1);
            promoted_args.push(HostValue::Pointer(slot_addr));
            promoted_args.extend_from_slice(args);
            self.invoke(func, &signature.promote_return(), &promoted_args);

            return HostValue::Aggregate(self.read_bytes(slot_addr, layout.size).or_fatal());
        }

        self.check_args(signature, args);

        let mut scratch = Vec::with_capacity(signature.aggregate_param_count());
        let mut wire_args = Vec::with_capacity(args.len() + 1);
        wire_args.push(self.instance().context_value());
        for (ty, arg) in signature.params().iter().zip(args) {
            wire_args.push(self.arg_to_wire(ty, arg, &mut scratch));
        }

        let wire_signature = signature.rewrite_for_call().lower(M::POINTER_LANE);
        let result = self
            .runtime()
            .call(self.instance(), func, &wire_signature, &wire_args)
            .unwrap_or_else(|trap| fatal(AbiError::Trap(trap)));

        if !scratch.is_empty() {
            tracing::trace!(count = scratch.len(), "freeing aggregate argument copies");
        }
        for p in scratch {
            M::free(self, p);
        }

        match (signature.ret(), result) {
            (AbiType::Void, None) => HostValue::Void,
            (ty, Some(value)) if ty != AbiType::Void => self.wire_to_host(&ty, value),
            (ty, other) => fatal(AbiError::SignatureMismatch(format!(
                "{} returned {:?}, expected {}",
                wire_signature, other, ty
            ))),
        }
    }

    /// Grow the return slot to at least `size` bytes.
    fn ensure_return_slot(&self, size: usize) -> M::Pointer {
        let mut slot = self.return_slot.lock();
        slot.ensure(
            size,
            |n| match M::malloc(self, n)? {
                p if p == M::NULL => Err(AbiError::OutOfMemory(n)),
                p => Ok(p),
            },
            |p| M::free(self, p),
        )
        .or_fatal()
    }

    fn check_args(&self, signature: &Signature, args: &[HostValue]) {
        let matches = signature.params().len() == args.len()
            && signature.params().iter().zip(args).all(|(ty, v)| v.matches(ty));
        if !matches {
            fatal(AbiError::SignatureMismatch(format!(
                "arguments {:?} do not match {}",
                args, signature
            )));
        }
    }

    // ========================================================================
    // Marshaling
    // ========================================================================

    /// Convert an argument, copying aggregates into scratch sandbox memory.
    fn arg_to_wire(
        &self,
        ty: &AbiType,
        value: &HostValue,
        scratch: &mut Vec<M::Pointer>,
    ) -> WasmValue {
        match (ty, value) {
            (AbiType::Aggregate(layout), HostValue::Aggregate(bytes)) => {
                let p = M::malloc(self, layout.size).or_fatal();
                if p == M::NULL {
                    fatal(AbiError::OutOfMemory(layout.size));
                }
                scratch.push(p);
                self.write_bytes(M::to_host(self, p), bytes).or_fatal();
                M::pointer_to_wire(p)
            }
            _ => self.host_to_wire(ty, value).unwrap_or_else(|| {
                fatal(AbiError::SignatureMismatch(format!("{:?} passed as {}", value, ty)))
            }),
        }
    }

    /// Convert a non-aggregate host value to its wire form. `None` for void.
    pub(crate) fn host_to_wire(&self, ty: &AbiType, value: &HostValue) -> Option<WasmValue> {
        match (ty, value) {
            (AbiType::Void, HostValue::Void) => None,
            (AbiType::Pointer, HostValue::Pointer(0)) => Some(M::pointer_to_wire(M::NULL)),
            (AbiType::Pointer, HostValue::Pointer(addr)) => {
                Some(M::pointer_to_wire(M::to_sandbox(self, *addr)))
            }
            (AbiType::FuncPointer, HostValue::FuncRef(bits)) => {
                let p = M::pointer_from_bits(*bits).unwrap_or_else(|| {
                    fatal(AbiError::SignatureMismatch(format!(
                        "function pointer {bits:#x} is not a sandbox pointer"
                    )))
                });
                Some(M::pointer_to_wire(p))
            }
            _ => Some(scalar_to_wire(ty, value).unwrap_or_else(|| {
                fatal(AbiError::SignatureMismatch(format!("{:?} passed as {}", value, ty)))
            })),
        }
    }

    /// Convert a wire value to host form, reading aggregates out of sandbox
    /// memory.
    pub(crate) fn wire_to_host(&self, ty: &AbiType, value: WasmValue) -> HostValue {
        let pointer = || {
            M::pointer_from_wire(value).unwrap_or_else(|| {
                fatal(AbiError::SignatureMismatch(format!(
                    "{:?} is not a {} pointer",
                    value,
                    M::NAME
                )))
            })
        };

        match ty {
            AbiType::Pointer => match pointer() {
                p if p == M::NULL => HostValue::Pointer(0),
                p => HostValue::Pointer(M::to_host(self, p)),
            },
            AbiType::FuncPointer => HostValue::FuncRef(M::pointer_to_bits(pointer())),
            AbiType::Aggregate(layout) => {
                let addr = M::to_host(self, pointer());
                HostValue::Aggregate(self.read_bytes(addr, layout.size).or_fatal())
            }
            _ => scalar_from_wire(ty, value).unwrap_or_else(|| {
                fatal(AbiError::SignatureMismatch(format!("{:?} received as {}", value, ty)))
            }),
        }
    }
}
