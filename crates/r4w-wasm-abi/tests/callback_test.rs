//! Host callbacks: registration, trampolines, and execution context.

mod common;

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;

use common::{flat_sandbox, flat_sandbox_with, reference_stats, Pair, Stats};
use r4w_wasm_abi::abi::SandboxFnPtr;
use r4w_wasm_abi::context;
use r4w_wasm_abi::{
    AbiType, ByValue, CallbackKey, FlatHeap, HostFunction, Sandbox, SandboxConfig, SandboxCore,
    Signature,
};

fn key(n: usize) -> CallbackKey {
    CallbackKey::new(n).expect("non-zero key")
}

fn apply(sandbox: &Sandbox<FlatHeap>, f: u32, x: u32) -> u32 {
    sandbox
        .typed_func::<(SandboxFnPtr, u32), u32>("apply")
        .expect("apply export")
        .call(sandbox, (SandboxFnPtr(u64::from(f)), x))
}

#[test]
fn test_registered_closure_is_callable_from_sandbox() {
    let (sandbox, _module) = flat_sandbox();

    let double = sandbox.register_fn(key(1), |x: u32| x * 2);
    let square = sandbox.register_fn(key(2), |x: u32| x * x);
    assert_ne!(double, 0);
    assert_ne!(double, square);
    assert_eq!(sandbox.callback_count(), 2);

    assert_eq!(apply(&sandbox, double, 21), 42);
    assert_eq!(apply(&sandbox, square, 9), 81);

    sandbox.unregister_callback(key(1));
    sandbox.unregister_callback(key(2));
    assert_eq!(sandbox.callback_count(), 0);
}

#[test]
fn test_unregistered_slot_is_reused() {
    let (sandbox, module) = flat_sandbox();

    let _p1 = sandbox.register_fn(key(1), |x: u32| x);
    let p2 = sandbox.register_fn(key(2), |x: u32| x + 1);
    let _p3 = sandbox.register_fn(key(3), |x: u32| x + 2);
    assert_eq!(module.bound_functions(), 3);

    sandbox.unregister_callback(key(2));
    assert_eq!(module.bound_functions(), 2);
    assert!(sandbox.get_unsandboxed_fn_pointer(p2).is_none());

    let p4 = sandbox.register_fn(key(4), |x: u32| x + 3);
    assert_eq!(p4, p2);
    assert_eq!(apply(&sandbox, p4, 10), 13);
}

#[test]
fn test_callback_table_full_is_fatal() {
    let (sandbox, _module) = flat_sandbox();
    let capacity = sandbox.config().max_callbacks;

    let pointers = (1..=capacity)
        .map(|i| sandbox.register_fn(key(i), move |x: u32| x + i as u32))
        .collect::<Vec<_>>();
    assert_eq!(sandbox.callback_count(), capacity);

    let overflow = catch_unwind(AssertUnwindSafe(|| {
        sandbox.register_fn(key(capacity + 1), |x: u32| x);
    }));
    assert!(overflow.is_err());
    assert_eq!(sandbox.callback_count(), capacity);

    // The registered callbacks keep working.
    assert_eq!(apply(&sandbox, pointers[0], 0), 1);
    assert_eq!(apply(&sandbox, pointers[capacity - 1], 0), capacity as u32);
}

#[test]
fn test_small_callback_table() {
    let config = SandboxConfig::default().max_callbacks(2);
    let (sandbox, _module) = flat_sandbox_with(&config);

    sandbox.register_fn(key(1), |x: u32| x);
    sandbox.register_fn(key(2), |x: u32| x);
    let overflow = catch_unwind(AssertUnwindSafe(|| {
        sandbox.register_fn(key(3), |x: u32| x);
    }));
    assert!(overflow.is_err());

    sandbox.unregister_callback(key(1));
    sandbox.register_fn(key(3), |x: u32| x);
    assert_eq!(sandbox.callback_count(), 2);
}

#[test]
#[should_panic(expected = "is already registered")]
fn test_duplicate_key_is_fatal() {
    let (sandbox, _module) = flat_sandbox();
    sandbox.register_fn(key(7), |x: u32| x);
    sandbox.register_fn(key(7), |x: u32| x + 1);
}

#[test]
#[should_panic(expected = "could not find callback to unregister")]
fn test_unregister_unknown_key_is_fatal() {
    let (sandbox, _module) = flat_sandbox();
    sandbox.unregister_callback(key(99));
}

#[test]
fn test_executed_callback_key() {
    let (sandbox, _module) = flat_sandbox();
    let seen = Arc::new(AtomicUsize::new(0));

    let recorder = Arc::clone(&seen);
    let f = sandbox.register_fn(key(0xBEEF), move |x: u32| {
        if let Some((active, key)) = SandboxCore::<FlatHeap>::get_executed_callback_sandbox_and_key()
        {
            assert!(active.callback_count() >= 1);
            recorder.store(key.get(), Ordering::SeqCst);
        }
        x
    });

    assert_eq!(apply(&sandbox, f, 5), 5);
    assert_eq!(seen.load(Ordering::SeqCst), 0xBEEF);

    // Nothing is executing once the call has returned.
    assert!(SandboxCore::<FlatHeap>::get_executed_callback_sandbox_and_key().is_none());
    assert_eq!(context::last_callback(), None);
}

#[test]
fn test_callback_returning_aggregate() {
    let (sandbox, module) = flat_sandbox();

    let f = sandbox.register_fn(key(1), |ByValue(pair): ByValue<Pair>| {
        ByValue(reference_stats(pair))
    });
    assert_eq!(
        sandbox.get_unsandboxed_fn_pointer(f).map(|h| match h {
            HostFunction::Callback(cb) => cb.signature().clone(),
            HostFunction::Export(_) => panic!("expected a host callback"),
        }),
        Some(Signature::new(
            vec![AbiType::aggregate::<Pair>()],
            AbiType::aggregate::<Stats>()
        ))
    );

    let apply_stats = sandbox
        .typed_func::<(SandboxFnPtr, ByValue<Pair>), ByValue<Stats>>("apply_stats")
        .expect("apply_stats export");

    let pair = Pair { a: 6, b: 7 };
    let ByValue(stats) = apply_stats.call(&sandbox, (SandboxFnPtr(u64::from(f)), ByValue(pair)));
    assert_eq!(stats, reference_stats(pair));

    // Return slot only.
    assert_eq!(module.live_allocations(), 1);
}

#[test]
fn test_pointer_arguments_are_swizzled_for_callbacks() {
    let (sandbox, _module) = flat_sandbox();
    let p = sandbox.malloc_in_sandbox(4);
    sandbox.write(p, 1234u32).expect("write");

    let base = sandbox.get_memory_location();
    let f = sandbox.register_fn(key(1), move |ptr: *mut u32| {
        assert!(ptr as usize >= base);
        // SAFETY: the sandbox passes a pointer to its own live allocation.
        unsafe { ptr.read_unaligned() }
    });

    assert_eq!(apply(&sandbox, f, p), 1234);
}

#[test]
fn test_concurrent_callbacks() {
    let (sandbox, _module) = flat_sandbox();
    let calls = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&calls);
    let f = sandbox.register_fn(key(1), move |x: u32| {
        counter.fetch_add(1, Ordering::Relaxed);
        x + 1
    });

    thread::scope(|s| {
        for t in 0..4u32 {
            let sandbox = &sandbox;
            s.spawn(move || {
                for i in 0..50u32 {
                    assert_eq!(apply(sandbox, f, t * 1000 + i), t * 1000 + i + 1);
                }
            });
        }

        // Churns other keys while the readers call through `f`.
        let sandbox = &sandbox;
        s.spawn(move || {
            for n in 0..500u32 {
                let k = key(100 + (n % 8) as usize);
                let g = sandbox.register_fn(k, move |x: u32| x * 3 + n);
                assert_ne!(g, f);
                assert_eq!(apply(sandbox, g, n), n * 4);
                sandbox.unregister_callback(k);
            }
        });
    });

    assert_eq!(calls.load(Ordering::Relaxed), 200);
    assert_eq!(sandbox.callback_count(), 1);
    assert_eq!(apply(&sandbox, f, 7), 8);
}

#[test]
fn test_nested_call_into_same_sandbox() {
    let (sandbox, _module) = flat_sandbox();
    let weak = Arc::downgrade(sandbox.core());

    let f = sandbox.register_fn(key(1), move |x: u32| {
        let sandbox = weak.upgrade().expect("sandbox alive");
        let add = sandbox.typed_func::<(u32, u32), u32>("add").expect("add");
        let sum = add.call(&sandbox, (x, 100));
        assert!(Arc::ptr_eq(
            &context::current_sandbox::<FlatHeap>().expect("active"),
            &sandbox
        ));
        sum
    });

    assert_eq!(apply(&sandbox, f, 1), 101);
    assert!(context::current_sandbox::<FlatHeap>().is_none());
}

#[test]
fn test_context_restored_across_sandboxes() {
    let (inner, _inner_module) = flat_sandbox();
    let (outer, _outer_module) = flat_sandbox();

    let observed = Arc::new(Mutex::new(Vec::new()));

    let log = Arc::clone(&observed);
    let inner_core = Arc::clone(inner.core());
    let inner_cb = inner.register_fn(key(10), move |x: u32| {
        let active = context::current_sandbox::<FlatHeap>().expect("active");
        assert!(Arc::ptr_eq(&active, &inner_core));
        log.lock().unwrap().push(("inner", context::last_callback()));
        x * 3
    });

    let log = Arc::clone(&observed);
    let inner_core = Arc::clone(inner.core());
    let outer_core = Arc::downgrade(outer.core());
    let _filler = outer.register_fn(key(1), |x: u32| x);
    let outer_cb = outer.register_fn(key(2), move |x: u32| {
        let tripled = inner_core
            .typed_func::<(SandboxFnPtr, u32), u32>("apply")
            .expect("apply")
            .call(&inner_core, (SandboxFnPtr(u64::from(inner_cb)), x));

        let active = context::current_sandbox::<FlatHeap>().expect("active");
        assert!(Arc::ptr_eq(&active, &outer_core.upgrade().expect("outer alive")));
        log.lock().unwrap().push(("outer", context::last_callback()));
        tripled + 1
    });

    assert_eq!(apply(&outer, outer_cb, 5), 16);
    assert_eq!(
        *observed.lock().unwrap(),
        vec![("inner", Some(0)), ("outer", Some(1))]
    );
    assert!(context::current_sandbox::<FlatHeap>().is_none());
    assert_eq!(context::last_callback(), None);
}

#[test]
fn test_export_bound_as_function_pointer() {
    let (sandbox, module) = flat_sandbox();
    let add = sandbox.typed_func::<(u32, u32), u32>("add").expect("add");

    let p = add.sandboxed_pointer(&sandbox);
    assert_ne!(p, 0);
    assert_eq!(add.sandboxed_pointer(&sandbox), p);
    assert_eq!(module.bound_functions(), 1);

    assert!(matches!(
        sandbox.get_unsandboxed_fn_pointer(p),
        Some(HostFunction::Export(func)) if func == add.func()
    ));

    let apply_binary = sandbox
        .typed_func::<(SandboxFnPtr, u32, u32), u32>("apply_binary")
        .expect("apply_binary export");
    assert_eq!(
        apply_binary.call(&sandbox, (SandboxFnPtr(u64::from(p)), 40, 2)),
        42
    );

    assert!(sandbox.get_unsandboxed_fn_pointer(p + 500).is_none());
}
