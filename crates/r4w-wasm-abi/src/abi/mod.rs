//! Type conversion between host values and the sandbox calling convention.
//!
//! | Host type | [`AbiType`] | Lane |
//! |-----------|-------------|------|
//! | integers and enums up to 32 bits | `Int` | `i32` |
//! | 64-bit integers | `Int` | `i64` |
//! | `f32` / `f64` | `F32` / `F64` | `f32` / `f64` |
//! | data pointers | `Pointer` | sandbox pointer lane |
//! | function pointers | `FuncPointer` | sandbox pointer lane |
//! | flat structs by value | `Aggregate` | sandbox pointer lane |
//!
//! Signatures are described at the value level ([`Signature`]) and rewritten
//! for the sandbox calling convention before being lowered to lanes
//! ([`WireSignature`]). The [`typed`] layer derives signatures from Rust
//! types.

mod signature;
mod types;
pub mod typed;
mod value;

pub use signature::{Signature, WireSignature};
pub use typed::{
    ByValue, Flat, GuestParams, GuestResult, GuestType, IntoCallback, SandboxFnPtr, TypedFunc,
};
pub use types::{AbiType, AggregateLayout, IntType, IntWidth, Lane};
pub use value::{HostValue, WasmValue};

pub(crate) use typed::flat_bytes;
pub(crate) use value::{scalar_from_wire, scalar_to_wire};

#[cfg(test)]
mod tests;
