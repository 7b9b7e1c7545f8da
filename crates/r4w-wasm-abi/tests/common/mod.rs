//! Fixtures shared by the integration tests.

#![allow(dead_code)]

use r4w_wasm_abi::abi::{Lane, WasmValue, WireSignature};
use r4w_wasm_abi::runtime::local::{GuestCx, LocalLoader, LocalModule, LocalModuleBuilder};
use r4w_wasm_abi::{Flat, FlatHeap, Sandbox, SandboxConfig};

pub const FLAT_PATH: &str = "libflat.so";

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Pair {
    pub a: u32,
    pub b: u32,
}

// SAFETY: two u32 fields, no padding.
unsafe impl Flat for Pair {}

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stats {
    pub sum: u64,
    pub product: u64,
}

// SAFETY: two u64 fields, no padding.
unsafe impl Flat for Stats {}

/// Host-side reference for the sandboxed `stats` function.
pub fn reference_stats(pair: Pair) -> Stats {
    Stats {
        sum: u64::from(pair.a) + u64::from(pair.b),
        product: u64::from(pair.a) * u64::from(pair.b),
    }
}

pub fn arg(args: &[WasmValue], i: usize) -> Result<u32, String> {
    args.get(i)
        .and_then(WasmValue::as_u32)
        .ok_or_else(|| format!("argument {i} missing"))
}

pub fn unary_i32() -> WireSignature {
    WireSignature::new([Lane::I32], Some(Lane::I32))
}

pub fn binary_i32() -> WireSignature {
    WireSignature::new([Lane::I32, Lane::I32], Some(Lane::I32))
}

/// A flat-heap module exercising every marshaling path.
pub fn flat_module() -> LocalModuleBuilder {
    LocalModule::builder()
        .export_fn("add", |_: &GuestCx, a: u32, b: u32| a.wrapping_add(b))
        .export_fn("null_ptr", |_: &GuestCx| 0u32)
        .export(
            "load32",
            [Lane::I32],
            Some(Lane::I32),
            |cx: &GuestCx, args: &[WasmValue]| {
                let value: u32 = cx.read(arg(args, 0)?)?;
                Ok(Some(WasmValue::I32(value)))
            },
        )
        .export(
            "stats",
            [Lane::I32, Lane::I32],
            None,
            |cx: &GuestCx, args: &[WasmValue]| {
                let pair: Pair = cx.read(arg(args, 1)?)?;
                cx.write(arg(args, 0)?, reference_stats(pair))?;
                Ok(None)
            },
        )
        .export(
            "sum_pair",
            [Lane::I32],
            Some(Lane::I32),
            |cx: &GuestCx, args: &[WasmValue]| {
                let pair: Pair = cx.read(arg(args, 0)?)?;
                Ok(Some(WasmValue::I32(pair.a + pair.b)))
            },
        )
        .export(
            "apply",
            [Lane::I32, Lane::I32],
            Some(Lane::I32),
            |cx: &GuestCx, args: &[WasmValue]| {
                cx.call_indirect(arg(args, 0)?, &unary_i32(), &args[1..])
            },
        )
        .export(
            "apply_binary",
            [Lane::I32, Lane::I32, Lane::I32],
            Some(Lane::I32),
            |cx: &GuestCx, args: &[WasmValue]| {
                cx.call_indirect(arg(args, 0)?, &binary_i32(), &args[1..])
            },
        )
        .export(
            "apply_stats",
            [Lane::I32, Lane::I32, Lane::I32],
            None,
            |cx: &GuestCx, args: &[WasmValue]| {
                let out = args[0];
                let f = arg(args, 1)?;
                let pair = args[2];
                cx.call_indirect(f, &WireSignature::new([Lane::I32, Lane::I32], None), &[out, pair])
            },
        )
        .export_data("greeting", *b"hello")
}

/// Loader serving `module` at [`FLAT_PATH`].
pub fn loader_for(module: &LocalModule) -> LocalLoader {
    LocalLoader::new().with_module(FLAT_PATH, module.clone())
}

/// A sandbox over a fresh [`flat_module`], and the module for inspection.
pub fn flat_sandbox() -> (Sandbox<FlatHeap>, LocalModule) {
    flat_sandbox_with(&SandboxConfig::default())
}

pub fn flat_sandbox_with(config: &SandboxConfig) -> (Sandbox<FlatHeap>, LocalModule) {
    let module = flat_module().build();
    let sandbox =
        Sandbox::<FlatHeap>::create(&loader_for(&module), FLAT_PATH, config).expect("create sandbox");
    (sandbox, module)
}
