//! Host type descriptions and their sandbox lanes.

use std::fmt;
use std::mem;

/// The four value lanes of the sandbox calling convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lane {
    /// 32-bit integer
    I32,
    /// 64-bit integer
    I64,
    /// 32-bit float
    F32,
    /// 64-bit float
    F64,
}

impl Lane {
    /// Lane of a host-native pointer.
    #[cfg(target_pointer_width = "64")]
    pub const NATIVE_POINTER: Lane = Lane::I64;
    /// Lane of a host-native pointer.
    #[cfg(not(target_pointer_width = "64"))]
    pub const NATIVE_POINTER: Lane = Lane::I32;
}

impl fmt::Display for Lane {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Lane::I32 => "i32",
            Lane::I64 => "i64",
            Lane::F32 => "f32",
            Lane::F64 => "f64",
        };
        f.write_str(name)
    }
}

/// Width of an integral (or enum) host type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IntWidth {
    /// 1 byte
    W8,
    /// 2 bytes
    W16,
    /// 4 bytes
    W32,
    /// 8 bytes
    W64,
}

impl IntWidth {
    /// Width of `usize`/`isize` on this host.
    #[cfg(target_pointer_width = "64")]
    pub const NATIVE: IntWidth = IntWidth::W64;
    /// Width of `usize`/`isize` on this host.
    #[cfg(not(target_pointer_width = "64"))]
    pub const NATIVE: IntWidth = IntWidth::W32;

    /// Size in bytes.
    pub const fn bytes(self) -> usize {
        match self {
            IntWidth::W8 => 1,
            IntWidth::W16 => 2,
            IntWidth::W32 => 4,
            IntWidth::W64 => 8,
        }
    }
}

/// An integral host type: width plus signedness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IntType {
    /// Storage width
    pub width: IntWidth,
    /// Whether values sign-extend
    pub signed: bool,
}

impl IntType {
    /// Create an integer type description.
    pub const fn new(width: IntWidth, signed: bool) -> Self {
        Self { width, signed }
    }

    /// Truncate (and sign- or zero-extend) raw bits to this type.
    pub(crate) fn normalize(self, bits: i64) -> i64 {
        match (self.width, self.signed) {
            (IntWidth::W8, true) => bits as i8 as i64,
            (IntWidth::W8, false) => bits as u8 as i64,
            (IntWidth::W16, true) => bits as i16 as i64,
            (IntWidth::W16, false) => bits as u16 as i64,
            (IntWidth::W32, true) => bits as i32 as i64,
            (IntWidth::W32, false) => bits as u32 as i64,
            (IntWidth::W64, _) => bits,
        }
    }
}

/// Size and alignment of a flat aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AggregateLayout {
    /// Size in bytes
    pub size: usize,
    /// Alignment in bytes
    pub align: usize,
}

impl AggregateLayout {
    /// Layout of `T`.
    pub const fn of<T>() -> Self {
        Self {
            size: mem::size_of::<T>(),
            align: mem::align_of::<T>(),
        }
    }
}

/// Description of a host type crossing the boundary.
///
/// Only types with an explicit conversion rule can be described, so the
/// mapping to lanes is total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AbiType {
    /// No value (return position only)
    Void,
    /// Integral or enum type
    Int(IntType),
    /// `float`
    F32,
    /// `double`
    F64,
    /// Data pointer, swizzled between host addresses and sandbox pointers
    Pointer,
    /// Function pointer, swizzled through the callback tables
    FuncPointer,
    /// Flat struct passed by value at the host level
    Aggregate(AggregateLayout),
    /// Execution-context pointer injected by signature rewriting
    Context,
}

impl AbiType {
    /// `i8`
    pub const I8: AbiType = AbiType::Int(IntType::new(IntWidth::W8, true));
    /// `u8`
    pub const U8: AbiType = AbiType::Int(IntType::new(IntWidth::W8, false));
    /// `i16`
    pub const I16: AbiType = AbiType::Int(IntType::new(IntWidth::W16, true));
    /// `u16`
    pub const U16: AbiType = AbiType::Int(IntType::new(IntWidth::W16, false));
    /// `i32`
    pub const I32: AbiType = AbiType::Int(IntType::new(IntWidth::W32, true));
    /// `u32`
    pub const U32: AbiType = AbiType::Int(IntType::new(IntWidth::W32, false));
    /// `i64`
    pub const I64: AbiType = AbiType::Int(IntType::new(IntWidth::W64, true));
    /// `u64`
    pub const U64: AbiType = AbiType::Int(IntType::new(IntWidth::W64, false));

    /// Aggregate type with the layout of `T`.
    pub const fn aggregate<T>() -> Self {
        AbiType::Aggregate(AggregateLayout::of::<T>())
    }

    /// Whether values of this type are passed through sandbox memory.
    pub fn is_aggregate(&self) -> bool {
        matches!(self, AbiType::Aggregate(_))
    }

    /// The lane this type occupies, given the model's pointer lane.
    ///
    /// Rules, in order: integers up to 32 bits use `i32`, wider integers use
    /// `i64`, floats keep their width, and pointers and aggregates take the
    /// pointer representation. `Void` has no lane.
    pub fn lane(&self, pointer: Lane) -> Option<Lane> {
        match self {
            AbiType::Void => None,
            AbiType::Int(int) if int.width <= IntWidth::W32 => Some(Lane::I32),
            AbiType::Int(_) => Some(Lane::I64),
            AbiType::F32 => Some(Lane::F32),
            AbiType::F64 => Some(Lane::F64),
            AbiType::Pointer | AbiType::FuncPointer | AbiType::Aggregate(_) => Some(pointer),
            AbiType::Context => Some(Lane::NATIVE_POINTER),
        }
    }
}

impl fmt::Display for AbiType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbiType::Void => f.write_str("void"),
            AbiType::Int(int) => {
                let prefix = if int.signed { 'i' } else { 'u' };
                write!(f, "{}{}", prefix, int.width.bytes() * 8)
            }
            AbiType::F32 => f.write_str("f32"),
            AbiType::F64 => f.write_str("f64"),
            AbiType::Pointer => f.write_str("ptr"),
            AbiType::FuncPointer => f.write_str("fnptr"),
            AbiType::Aggregate(layout) => write!(f, "struct[{}]", layout.size),
            AbiType::Context => f.write_str("ctx"),
        }
    }
}
