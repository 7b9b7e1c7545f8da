//! Wire values (sandbox calling convention) and host values.

use super::types::{AbiType, IntType, IntWidth, Lane};

/// A value in one of the four sandbox lanes.
///
/// Integers are stored as raw bits; signedness lives in the [`AbiType`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WasmValue {
    /// 32-bit integer lane
    I32(u32),
    /// 64-bit integer lane
    I64(u64),
    /// 32-bit float lane
    F32(f32),
    /// 64-bit float lane
    F64(f64),
}

impl WasmValue {
    /// The lane this value occupies.
    pub fn lane(&self) -> Lane {
        match self {
            WasmValue::I32(_) => Lane::I32,
            WasmValue::I64(_) => Lane::I64,
            WasmValue::F32(_) => Lane::F32,
            WasmValue::F64(_) => Lane::F64,
        }
    }

    /// Zero of the given lane.
    pub fn zero(lane: Lane) -> Self {
        match lane {
            Lane::I32 => WasmValue::I32(0),
            Lane::I64 => WasmValue::I64(0),
            Lane::F32 => WasmValue::F32(0.0),
            Lane::F64 => WasmValue::F64(0.0),
        }
    }

    /// Host address carried in the native pointer lane.
    pub fn from_native_pointer(addr: usize) -> Self {
        match Lane::NATIVE_POINTER {
            Lane::I64 => WasmValue::I64(addr as u64),
            _ => WasmValue::I32(addr as u32),
        }
    }

    /// Integer payload widened to 64 bits, zero-extending the `i32` lane.
    pub fn as_u64(&self) -> Option<u64> {
        match *self {
            WasmValue::I32(v) => Some(u64::from(v)),
            WasmValue::I64(v) => Some(v),
            _ => None,
        }
    }

    /// Payload of the `i32` lane.
    pub fn as_u32(&self) -> Option<u32> {
        match *self {
            WasmValue::I32(v) => Some(v),
            _ => None,
        }
    }

    /// Payload of the `f32` lane.
    pub fn as_f32(&self) -> Option<f32> {
        match *self {
            WasmValue::F32(v) => Some(v),
            _ => None,
        }
    }

    /// Payload of the `f64` lane.
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            WasmValue::F64(v) => Some(v),
            _ => None,
        }
    }
}

/// A value in host representation.
///
/// Pointers are host addresses; function pointers carry the sandbox-side
/// function reference so they can be invoked or passed back unchanged.
#[derive(Debug, Clone, PartialEq)]
pub enum HostValue {
    /// No value
    Void,
    /// Any integral type, normalized to its declared width
    Int(i64),
    /// `float`
    F32(f32),
    /// `double`
    F64(f64),
    /// Host address of sandbox data (0 for null)
    Pointer(usize),
    /// Sandbox function reference (0 for null)
    FuncRef(u64),
    /// Raw bytes of a flat aggregate
    Aggregate(Vec<u8>),
}

impl HostValue {
    /// Whether this value can be passed as `ty`.
    pub fn matches(&self, ty: &AbiType) -> bool {
        match (self, ty) {
            (HostValue::Void, AbiType::Void) => true,
            (HostValue::Int(_), AbiType::Int(_)) => true,
            (HostValue::F32(_), AbiType::F32) => true,
            (HostValue::F64(_), AbiType::F64) => true,
            (HostValue::Pointer(_), AbiType::Pointer) => true,
            (HostValue::FuncRef(_), AbiType::FuncPointer) => true,
            (HostValue::Aggregate(bytes), AbiType::Aggregate(layout)) => bytes.len() == layout.size,
            _ => false,
        }
    }
}

/// Integer to its wire lane.
pub(crate) fn int_to_wire(int: IntType, value: i64) -> WasmValue {
    let value = int.normalize(value);
    match int.width {
        IntWidth::W64 => WasmValue::I64(value as u64),
        _ => WasmValue::I32(value as u32),
    }
}

/// Integer from its wire lane, sign- or zero-extended per `int`.
pub(crate) fn int_from_wire(int: IntType, value: WasmValue) -> Option<i64> {
    let bits = match (int.width, value) {
        (IntWidth::W64, WasmValue::I64(v)) => v as i64,
        (IntWidth::W64, _) => return None,
        (_, WasmValue::I32(v)) => i64::from(v),
        _ => return None,
    };
    Some(int.normalize(bits))
}

/// Convert a scalar (non-pointer, non-aggregate) host value.
pub(crate) fn scalar_to_wire(ty: &AbiType, value: &HostValue) -> Option<WasmValue> {
    match (ty, value) {
        (AbiType::Int(int), HostValue::Int(v)) => Some(int_to_wire(*int, *v)),
        (AbiType::F32, HostValue::F32(v)) => Some(WasmValue::F32(*v)),
        (AbiType::F64, HostValue::F64(v)) => Some(WasmValue::F64(*v)),
        _ => None,
    }
}

/// Inverse of [`scalar_to_wire`].
pub(crate) fn scalar_from_wire(ty: &AbiType, value: WasmValue) -> Option<HostValue> {
    match ty {
        AbiType::Int(int) => int_from_wire(*int, value).map(HostValue::Int),
        AbiType::F32 => value.as_f32().map(HostValue::F32),
        AbiType::F64 => value.as_f64().map(HostValue::F64),
        _ => None,
    }
}
