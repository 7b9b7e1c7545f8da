//! Flat-heap sandboxes over real WebAssembly, compiled by wasmtime.

#![cfg(feature = "wasmtime")]

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use r4w_wasm_abi::abi::SandboxFnPtr;
use r4w_wasm_abi::context;
use r4w_wasm_abi::runtime::wasmtime::WasmtimeLoader;
use r4w_wasm_abi::{CallbackKey, FlatHeap, Sandbox, SandboxConfig, Symbol};

const MODULE: &str = r#"
(module
  (type $unary (func (param i32) (result i32)))
  (memory (export "memory") 2)
  (table (export "__indirect_function_table") 1 funcref)
  (global $heap (mut i32) (i32.const 1024))
  (global (export "greeting") i32 (i32.const 16))
  (data (i32.const 16) "hello")

  ;; bump allocator, 8-byte aligned
  (func (export "malloc") (param $size i32) (result i32)
    (local $p i32)
    global.get $heap
    local.set $p
    global.get $heap
    local.get $size
    i32.const 7
    i32.add
    i32.const -8
    i32.and
    i32.add
    global.set $heap
    local.get $p)
  (func (export "free") (param i32))

  (func (export "add") (param i32 i32) (result i32)
    local.get 0
    local.get 1
    i32.add)
  (func (export "load32") (param i32) (result i32)
    local.get 0
    i32.load)
  (func (export "apply") (param $f i32) (param $x i32) (result i32)
    local.get $x
    local.get $f
    call_indirect (type $unary)))
"#;

/// Writes the test module to a per-test file and removes it on drop.
struct ModuleFile(PathBuf);

impl ModuleFile {
    fn new(name: &str) -> Self {
        let path = std::env::temp_dir().join(format!(
            "r4w-wasm-abi-{}-{}.wat",
            name,
            std::process::id()
        ));
        std::fs::write(&path, MODULE).expect("write module");
        Self(path)
    }
}

impl Drop for ModuleFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

fn sandbox(name: &str) -> Sandbox<FlatHeap> {
    let file = ModuleFile::new(name);
    Sandbox::<FlatHeap>::create(&WasmtimeLoader::new(), &file.0, &SandboxConfig::default())
        .expect("wasm sandbox")
}

fn apply(sandbox: &Sandbox<FlatHeap>, f: u32, x: u32) -> u32 {
    sandbox
        .typed_func::<(SandboxFnPtr, u32), u32>("apply")
        .expect("apply export")
        .call(sandbox, (SandboxFnPtr(u64::from(f)), x))
}

#[test]
fn test_call_export() {
    let sandbox = sandbox("call");
    let add = sandbox.typed_func::<(u32, u32), u32>("add").expect("add");
    assert_eq!(add.call(&sandbox, (40, 2)), 42);
    assert_eq!(add.call(&sandbox, (u32::MAX, 1)), 0);
    assert_eq!(sandbox.get_total_memory(), 2 * 65536);
}

#[test]
fn test_memory_and_heap() {
    let sandbox = sandbox("memory");
    let p = sandbox.malloc_in_sandbox(8);
    assert_eq!(p, 1024);
    sandbox.write(p, 0x0102_0304u32).expect("write");

    let load = sandbox.typed_func::<(*mut u32,), u32>("load32").expect("load32");
    let host = sandbox.get_unsandboxed_pointer(p) as *mut u32;
    assert_eq!(load.call(&sandbox, (host,)), 0x0102_0304);
}

#[test]
fn test_data_export() {
    let sandbox = sandbox("data");
    let Some(Symbol::Data(addr)) = sandbox.lookup_symbol("greeting") else {
        panic!("greeting should resolve to data");
    };
    assert_eq!(addr, sandbox.get_memory_location() + 16);
    let bytes = sandbox
        .read::<[u8; 5]>(sandbox.get_sandboxed_pointer(addr))
        .expect("read");
    assert_eq!(&bytes, b"hello");
}

#[test]
fn test_callback_through_table() {
    let sandbox = sandbox("callback");
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&calls);
    let key = CallbackKey::new(1).expect("key");
    let f = sandbox.register_fn(key, move |x: u32| {
        counter.fetch_add(1, Ordering::Relaxed);
        x * 2
    });
    assert_ne!(f, 0);

    assert_eq!(apply(&sandbox, f, 21), 42);
    assert_eq!(calls.load(Ordering::Relaxed), 1);

    sandbox.unregister_callback(key);
    let g = sandbox.register_fn(key, |x: u32| x + 1);
    assert_eq!(g, f);
    assert_eq!(apply(&sandbox, g, 1), 2);
}

#[test]
fn test_nested_call_from_callback() {
    let sandbox = sandbox("nested");
    let weak = Arc::downgrade(sandbox.core());

    let f = sandbox.register_fn(CallbackKey::new(1).expect("key"), move |x: u32| {
        let sandbox = weak.upgrade().expect("sandbox alive");
        let add = sandbox.typed_func::<(u32, u32), u32>("add").expect("add");
        add.call(&sandbox, (x, 100))
    });

    assert_eq!(apply(&sandbox, f, 5), 105);
}

#[test]
fn test_callback_calls_another_instance() {
    let outer = sandbox("cross-outer");
    let inner = sandbox("cross-inner");
    let inner_core = Arc::clone(inner.core());
    let outer_weak = Arc::downgrade(outer.core());

    let g = inner.register_fn(CallbackKey::new(1).expect("key"), |x: u32| x + 1);
    let f = outer.register_fn(CallbackKey::new(1).expect("key"), move |x: u32| {
        let add = inner_core.typed_func::<(u32, u32), u32>("add").expect("add");
        let sum = add.call(&inner_core, (x, 100));
        let nested = inner_core
            .typed_func::<(SandboxFnPtr, u32), u32>("apply")
            .expect("apply")
            .call(&inner_core, (SandboxFnPtr(u64::from(g)), sum));
        let active = context::current_sandbox::<FlatHeap>().expect("outer is active");
        assert!(Weak::ptr_eq(&Arc::downgrade(&active), &outer_weak));
        nested
    });

    assert_eq!(apply(&outer, f, 5), 106);
    assert_eq!(apply(&inner, g, 1), 2);
    assert!(context::current_sandbox::<FlatHeap>().is_none());
}

#[test]
#[should_panic(expected = "sandbox trapped")]
fn test_null_function_pointer_traps() {
    let sandbox = sandbox("trap");
    apply(&sandbox, 0, 1);
}
