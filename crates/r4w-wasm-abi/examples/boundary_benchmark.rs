//! Boundary Crossing Benchmarks
//!
//! Run with: cargo run -p r4w-wasm-abi --example boundary_benchmark --release

use r4w_wasm_abi::abi::{Lane, SandboxFnPtr, WasmValue, WireSignature};
use r4w_wasm_abi::runtime::local::{GuestCx, LocalLoader, LocalModule};
use r4w_wasm_abi::{ByValue, CallbackKey, Flat, FlatHeap, Sandbox, SandboxConfig};
use std::time::Instant;

const PATH: &str = "libbench.so";

#[repr(C)]
#[derive(Debug, Clone, Copy)]
struct Sample {
    i: f32,
    q: f32,
}

// SAFETY: two f32 fields, no padding.
unsafe impl Flat for Sample {}

fn loader() -> LocalLoader {
    let module = LocalModule::builder()
        .export_fn("add", |_: &GuestCx, a: u32, b: u32| a.wrapping_add(b))
        .export(
            "conjugate",
            [Lane::I32, Lane::I32],
            None,
            |cx: &GuestCx, args: &[WasmValue]| {
                let out = args[0].as_u32().ok_or("out")?;
                let s: Sample = cx.read(args[1].as_u32().ok_or("sample")?)?;
                cx.write(out, Sample { i: s.i, q: -s.q })?;
                Ok(None)
            },
        )
        .export(
            "apply",
            [Lane::I32, Lane::I32],
            Some(Lane::I32),
            |cx: &GuestCx, args: &[WasmValue]| {
                let f = args[0].as_u32().ok_or("f")?;
                cx.call_indirect(f, &WireSignature::new([Lane::I32], Some(Lane::I32)), &args[1..])
            },
        );
    LocalLoader::new().with_module(PATH, module)
}

fn main() {
    println!("=== Sandbox Boundary Benchmarks ===\n");

    bench_creation();
    bench_scalar_calls();
    bench_aggregate_calls();
    bench_callbacks();
    bench_heap();

    println!("\n=== Benchmark Complete ===");
}

fn bench_creation() {
    println!("## Sandbox Creation");

    let loader = loader();
    let config = SandboxConfig::default();
    let mut times = Vec::new();

    for _ in 0..100 {
        let start = Instant::now();
        let sandbox = Sandbox::<FlatHeap>::create(&loader, PATH, &config).unwrap();
        times.push(start.elapsed().as_micros() as u64);
        drop(sandbox);
    }

    print_stats("create", &times);
    println!();
}

fn bench_scalar_calls() {
    println!("## Scalar Call Overhead");

    let sandbox = Sandbox::<FlatHeap>::create(&loader(), PATH, &SandboxConfig::default()).unwrap();
    let add = sandbox.typed_func::<(u32, u32), u32>("add").unwrap();

    // Warm up
    for i in 0..100 {
        add.call(&sandbox, (i, 1));
    }

    let mut times = Vec::new();
    for i in 0..1000 {
        let start = Instant::now();
        let _ = add.call(&sandbox, (i, 1));
        times.push(start.elapsed().as_nanos() as u64);
    }

    print_stats_ns("add(u32, u32)", &times);
    println!();
}

fn bench_aggregate_calls() {
    println!("## Aggregate Marshaling");

    let sandbox = Sandbox::<FlatHeap>::create(&loader(), PATH, &SandboxConfig::default()).unwrap();
    let conjugate = sandbox
        .typed_func::<(ByValue<Sample>,), ByValue<Sample>>("conjugate")
        .unwrap();

    let mut times = Vec::new();
    for n in 0..1000 {
        let sample = Sample { i: n as f32, q: 1.0 };
        let start = Instant::now();
        let ByValue(out) = conjugate.call(&sandbox, (ByValue(sample),));
        times.push(start.elapsed().as_nanos() as u64);
        assert_eq!(out.q, -1.0);
    }

    print_stats_ns("conjugate(Sample) -> Sample", &times);
    println!();
}

fn bench_callbacks() {
    println!("## Callback Round Trip");

    let sandbox = Sandbox::<FlatHeap>::create(&loader(), PATH, &SandboxConfig::default()).unwrap();
    let key = CallbackKey::new(1).unwrap();
    let f = sandbox.register_fn(key, |x: u32| x ^ 0x5555_5555);
    let apply = sandbox
        .typed_func::<(SandboxFnPtr, u32), u32>("apply")
        .unwrap();

    let mut times = Vec::new();
    for i in 0..1000 {
        let start = Instant::now();
        let _ = apply.call(&sandbox, (SandboxFnPtr(u64::from(f)), i));
        times.push(start.elapsed().as_nanos() as u64);
    }
    print_stats_ns("host -> sandbox -> host", &times);

    let mut times = Vec::new();
    for n in 0..100 {
        let key = CallbackKey::new(100 + n).unwrap();
        let start = Instant::now();
        sandbox.register_fn(key, |x: u32| x);
        sandbox.unregister_callback(key);
        times.push(start.elapsed().as_nanos() as u64);
    }
    print_stats_ns("register + unregister", &times);

    sandbox.unregister_callback(key);
    println!();
}

fn bench_heap() {
    println!("## Sandbox Heap");

    let sandbox = Sandbox::<FlatHeap>::create(&loader(), PATH, &SandboxConfig::default()).unwrap();

    for size in [16usize, 1024, 65536] {
        let mut times = Vec::new();
        for _ in 0..100 {
            let start = Instant::now();
            let p = sandbox.malloc_in_sandbox(size);
            sandbox.free_in_sandbox(p);
            times.push(start.elapsed().as_nanos() as u64);
        }
        print_stats_ns(&format!("malloc + free {} bytes", size), &times);
    }
    println!();
}

fn print_stats(name: &str, times: &[u64]) {
    print_stats_unit(name, times, "us");
}

fn print_stats_ns(name: &str, times: &[u64]) {
    print_stats_unit(name, times, "ns");
}

fn print_stats_unit(name: &str, times: &[u64], unit: &str) {
    if times.is_empty() {
        println!("  {}: no samples", name);
        return;
    }

    let mut sorted = times.to_vec();
    sorted.sort();

    let min = sorted[0];
    let max = sorted[sorted.len() - 1];
    let mean = times.iter().sum::<u64>() as f64 / times.len() as f64;
    let p50 = sorted[sorted.len() / 2];
    let p99 = sorted[(sorted.len() * 99) / 100];

    println!("  {}: n={} min={}{u} mean={:.1}{u} p50={}{u} p99={}{u} max={}{u}",
             name, times.len(), min, mean, p50, p99, max, u = unit);
}
