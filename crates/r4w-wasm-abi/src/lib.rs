//! # R4W Wasm ABI
//!
//! Boundary layer between a host application and a library running inside a
//! WebAssembly-style sandbox.
//!
//! The sandbox has a 32-bit address space and its own calling convention;
//! the host has native pointers. This crate converts values between the two,
//! swizzles pointers, marshals flat structs that the sandbox cannot pass by
//! value, and routes sandbox calls to host function pointers through
//! trampolines.
//!
//! ## Memory Models
//!
//! | Model | Sandbox pointer | Heap | Use Case |
//! |-------|-----------------|------|----------|
//! | [`FlatHeap`] | 32-bit offset | sandbox `malloc`/`free` | wasm2c-style linear memory |
//! | [`Capability`] | native address | host allocator | hardware capability isolation |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use r4w_wasm_abi::runtime::local::{GuestCx, LocalLoader, LocalModule};
//! use r4w_wasm_abi::{CallbackKey, FlatHeap, Sandbox, SandboxConfig};
//!
//! let loader = LocalLoader::new().with_module(
//!     "adder.so",
//!     LocalModule::builder().export_fn("add", |_: &GuestCx, a: u32, b: u32| a + b),
//! );
//!
//! let sandbox = Sandbox::<FlatHeap>::create(&loader, "adder.so", &SandboxConfig::default())?;
//!
//! let add = sandbox.typed_func::<(u32, u32), u32>("add").expect("export");
//! assert_eq!(add.call(&sandbox, (2, 3)), 5);
//!
//! // Hand a host closure to the sandbox as a function pointer
//! let key = CallbackKey::new(1).expect("non-zero");
//! let fn_ptr = sandbox.register_fn(key, |x: u32| x * 2);
//! # let _ = fn_ptr;
//! sandbox.unregister_callback(key);
//! # Ok::<(), r4w_wasm_abi::AbiError>(())
//! ```
//!
//! ## Features
//!
//! - `wasmtime` - Flat-heap runtime executing real WebAssembly modules
//!
//! ## Failure Modes
//!
//! Sandbox creation is fallible only when [`SandboxConfig::infallible`] is
//! off. Every failure after creation (allocator exhaustion, a full callback
//! table, a trap) is fatal: it is logged and the thread panics.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]

pub mod abi;
pub mod callback;
pub mod config;
pub mod context;
pub mod error;
pub mod heap;
mod invoke;
pub mod model;
pub mod runtime;
pub mod sandbox;
mod swizzle;

// Re-export main types
pub use abi::{AbiType, ByValue, Flat, HostValue, Signature, TypedFunc};
pub use callback::{Callback, CallbackKey, HostFunction};
pub use config::SandboxConfig;
pub use error::{AbiError, Result};
pub use model::{Capability, FlatHeap, MemoryModel};
pub use runtime::FuncRef;
pub use sandbox::{Sandbox, SandboxCore, Symbol};
