//! Static typing over the value-level ABI description.
//!
//! Rust types implement [`GuestType`] to state their [`AbiType`] once;
//! tuples of them describe parameter lists. A type without an impl cannot be
//! passed across the boundary, so unmapped types are rejected at build time.

use std::fmt;
use std::marker::PhantomData;
use std::mem;
use std::ptr;

use super::signature::Signature;
use super::types::{AbiType, IntType, IntWidth};
use super::value::HostValue;
use crate::callback::Callback;
use crate::error::{fatal, AbiError};
use crate::model::MemoryModel;
use crate::runtime::FuncRef;
use crate::sandbox::SandboxCore;

/// Plain data that can be copied byte-for-byte across the boundary.
///
/// # Safety
///
/// Implementors must be `#[repr(C)]` (or `#[repr(transparent)]`) structs of
/// scalars without padding bytes, valid for every bit pattern.
pub unsafe trait Flat: Copy + Send + Sync + 'static {}

macro_rules! flat_scalars {
    ($($ty:ty)*) => {
        $(
            // SAFETY: primitive scalars have no padding and accept any bits.
            unsafe impl Flat for $ty {}
        )*
    };
}

flat_scalars!(i8 u8 i16 u16 i32 u32 i64 u64 f32 f64);

// SAFETY: arrays of flat elements have no padding between elements.
unsafe impl<T: Flat, const N: usize> Flat for [T; N] {}

/// The bytes of a flat value.
pub(crate) fn flat_bytes<T: Flat>(value: &T) -> &[u8] {
    // SAFETY: `Flat` guarantees every byte is initialized.
    unsafe { std::slice::from_raw_parts(value as *const T as *const u8, mem::size_of::<T>()) }
}

/// A flat struct passed by value at the host level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct ByValue<T>(pub T);

/// A function pointer in its sandbox representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SandboxFnPtr(pub u64);

/// A Rust type with a sandbox representation.
pub trait GuestType: Sized + 'static {
    /// Boundary type description.
    const ABI: AbiType;

    /// Convert to a host value.
    fn into_host(self) -> HostValue;

    /// Convert from a host value of type [`GuestType::ABI`].
    fn from_host(value: &HostValue) -> Option<Self>;
}

macro_rules! int_guest_types {
    ($($ty:ty => $width:expr, $signed:expr;)*) => {
        $(
            impl GuestType for $ty {
                const ABI: AbiType = AbiType::Int(IntType::new($width, $signed));

                fn into_host(self) -> HostValue {
                    HostValue::Int(self as i64)
                }

                fn from_host(value: &HostValue) -> Option<Self> {
                    match value {
                        HostValue::Int(v) => Some(*v as $ty),
                        _ => None,
                    }
                }
            }
        )*
    };
}

int_guest_types! {
    i8 => IntWidth::W8, true;
    u8 => IntWidth::W8, false;
    i16 => IntWidth::W16, true;
    u16 => IntWidth::W16, false;
    i32 => IntWidth::W32, true;
    u32 => IntWidth::W32, false;
    i64 => IntWidth::W64, true;
    u64 => IntWidth::W64, false;
    isize => IntWidth::NATIVE, true;
    usize => IntWidth::NATIVE, false;
}

impl GuestType for bool {
    const ABI: AbiType = AbiType::Int(IntType::new(IntWidth::W8, false));

    fn into_host(self) -> HostValue {
        HostValue::Int(i64::from(self))
    }

    fn from_host(value: &HostValue) -> Option<Self> {
        match value {
            HostValue::Int(v) => Some(*v != 0),
            _ => None,
        }
    }
}

impl GuestType for f32 {
    const ABI: AbiType = AbiType::F32;

    fn into_host(self) -> HostValue {
        HostValue::F32(self)
    }

    fn from_host(value: &HostValue) -> Option<Self> {
        match value {
            HostValue::F32(v) => Some(*v),
            _ => None,
        }
    }
}

impl GuestType for f64 {
    const ABI: AbiType = AbiType::F64;

    fn into_host(self) -> HostValue {
        HostValue::F64(self)
    }

    fn from_host(value: &HostValue) -> Option<Self> {
        match value {
            HostValue::F64(v) => Some(*v),
            _ => None,
        }
    }
}

impl<T: 'static> GuestType for *mut T {
    const ABI: AbiType = AbiType::Pointer;

    fn into_host(self) -> HostValue {
        HostValue::Pointer(self as usize)
    }

    fn from_host(value: &HostValue) -> Option<Self> {
        match value {
            HostValue::Pointer(addr) => Some(*addr as *mut T),
            _ => None,
        }
    }
}

impl<T: 'static> GuestType for *const T {
    const ABI: AbiType = AbiType::Pointer;

    fn into_host(self) -> HostValue {
        HostValue::Pointer(self as usize)
    }

    fn from_host(value: &HostValue) -> Option<Self> {
        match value {
            HostValue::Pointer(addr) => Some(*addr as *const T),
            _ => None,
        }
    }
}

impl GuestType for SandboxFnPtr {
    const ABI: AbiType = AbiType::FuncPointer;

    fn into_host(self) -> HostValue {
        HostValue::FuncRef(self.0)
    }

    fn from_host(value: &HostValue) -> Option<Self> {
        match value {
            HostValue::FuncRef(bits) => Some(SandboxFnPtr(*bits)),
            _ => None,
        }
    }
}

impl<T: Flat> GuestType for ByValue<T> {
    const ABI: AbiType = AbiType::aggregate::<T>();

    fn into_host(self) -> HostValue {
        HostValue::Aggregate(flat_bytes(&self.0).to_vec())
    }

    fn from_host(value: &HostValue) -> Option<Self> {
        match value {
            HostValue::Aggregate(bytes) if bytes.len() == mem::size_of::<T>() => {
                // SAFETY: length checked; `Flat` accepts any bit pattern.
                Some(ByValue(unsafe { ptr::read_unaligned(bytes.as_ptr() as *const T) }))
            }
            _ => None,
        }
    }
}

/// A return type: any [`GuestType`] or `()`.
pub trait GuestResult: Sized + 'static {
    /// Boundary type description.
    const ABI: AbiType;

    /// Convert to a host value.
    fn into_host(self) -> HostValue;

    /// Convert from a host value.
    fn from_host(value: &HostValue) -> Option<Self>;
}

impl GuestResult for () {
    const ABI: AbiType = AbiType::Void;

    fn into_host(self) -> HostValue {
        HostValue::Void
    }

    fn from_host(value: &HostValue) -> Option<Self> {
        matches!(value, HostValue::Void).then_some(())
    }
}

impl<T: GuestType> GuestResult for T {
    const ABI: AbiType = T::ABI;

    fn into_host(self) -> HostValue {
        GuestType::into_host(self)
    }

    fn from_host(value: &HostValue) -> Option<Self> {
        GuestType::from_host(value)
    }
}

/// A parameter list: tuples of [`GuestType`]s.
pub trait GuestParams: Sized + 'static {
    /// Parameter type descriptions.
    fn abi_types() -> Vec<AbiType>;

    /// Convert to host values.
    fn into_host_values(self) -> Vec<HostValue>;
}

/// Conversion of a closure into a [`Callback`].
pub trait IntoCallback<P, R> {
    /// Wrap `self` with its signature.
    fn into_callback(self) -> Callback;
}

#[cold]
fn argument_mismatch(signature: &Signature, values: &[HostValue]) -> ! {
    fatal(AbiError::SignatureMismatch(format!(
        "callback {} received {:?}",
        signature, values
    )))
}

macro_rules! for_each_function_signature {
    ($mac:ident) => {
        $mac!(0);
        $mac!(1 A1);
        $mac!(2 A1 A2);
        $mac!(3 A1 A2 A3);
        $mac!(4 A1 A2 A3 A4);
        $mac!(5 A1 A2 A3 A4 A5);
        $mac!(6 A1 A2 A3 A4 A5 A6);
        $mac!(7 A1 A2 A3 A4 A5 A6 A7);
        $mac!(8 A1 A2 A3 A4 A5 A6 A7 A8);
    };
}

pub(crate) use for_each_function_signature;

macro_rules! impl_guest_params {
    ($n:tt $($args:ident)*) => {
        #[allow(non_snake_case)]
        impl<$($args: GuestType,)*> GuestParams for ($($args,)*) {
            fn abi_types() -> Vec<AbiType> {
                vec![$(<$args as GuestType>::ABI,)*]
            }

            fn into_host_values(self) -> Vec<HostValue> {
                let ($($args,)*) = self;
                vec![$(GuestType::into_host($args),)*]
            }
        }
    };
}

for_each_function_signature!(impl_guest_params);

macro_rules! impl_into_callback {
    ($n:tt $($args:ident)*) => {
        #[allow(non_snake_case)]
        impl<F, $($args,)* R> IntoCallback<($($args,)*), R> for F
        where
            F: Fn($($args),*) -> R + Send + Sync + 'static,
            $($args: GuestType,)*
            R: GuestResult,
        {
            #[allow(unused_mut, unused_variables)]
            fn into_callback(self) -> Callback {
                let signature =
                    Signature::new(vec![$(<$args as GuestType>::ABI,)*], <R as GuestResult>::ABI);
                let sig = signature.clone();
                Callback::new(signature, move |values: &[HostValue]| {
                    let mut iter = values.iter();
                    $(
                        let $args = match iter.next().and_then(<$args as GuestType>::from_host) {
                            Some(v) => v,
                            None => argument_mismatch(&sig, values),
                        };
                    )*
                    GuestResult::into_host(self($($args),*))
                })
            }
        }
    };
}

for_each_function_signature!(impl_into_callback);

/// A resolved sandbox function with a static signature.
pub struct TypedFunc<P, R> {
    func: FuncRef,
    signature: Signature,
    _marker: PhantomData<fn(P) -> R>,
}

impl<P: GuestParams, R: GuestResult> TypedFunc<P, R> {
    /// Wrap a resolved function.
    pub fn new(func: FuncRef) -> Self {
        Self {
            func,
            signature: Signature::new(P::abi_types(), <R as GuestResult>::ABI),
            _marker: PhantomData,
        }
    }

    /// The resolved function.
    pub fn func(&self) -> FuncRef {
        self.func
    }

    /// The host-level signature.
    pub fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Call the function in `sandbox`.
    pub fn call<M: MemoryModel>(&self, sandbox: &SandboxCore<M>, params: P) -> R {
        let result = sandbox.invoke(self.func, &self.signature, &params.into_host_values());
        <R as GuestResult>::from_host(&result).unwrap_or_else(|| {
            fatal(AbiError::SignatureMismatch(format!(
                "{} returned {:?}",
                self.signature, result
            )))
        })
    }

    /// Sandbox function pointer for this function, binding it into the
    /// sandbox function table on first use.
    pub fn sandboxed_pointer<M: MemoryModel>(&self, sandbox: &SandboxCore<M>) -> M::Pointer {
        sandbox.get_sandboxed_fn_pointer(self.func, &self.signature)
    }
}

impl<P, R> Clone for TypedFunc<P, R> {
    fn clone(&self) -> Self {
        Self {
            func: self.func,
            signature: self.signature.clone(),
            _marker: PhantomData,
        }
    }
}

impl<P, R> fmt::Debug for TypedFunc<P, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypedFunc")
            .field("func", &self.func)
            .field("signature", &self.signature)
            .finish()
    }
}

impl<M: MemoryModel> SandboxCore<M> {
    /// Resolve an exported function with a static signature.
    pub fn typed_func<P: GuestParams, R: GuestResult>(&self, name: &str) -> Option<TypedFunc<P, R>> {
        self.lookup_function(name).map(TypedFunc::new)
    }
}
