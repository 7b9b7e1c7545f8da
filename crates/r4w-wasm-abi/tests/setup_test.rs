//! Sandbox creation and teardown.

mod common;

use common::{flat_module, loader_for, FLAT_PATH};
use r4w_wasm_abi::runtime::local::{GuestCx, LocalLoader, LocalModule};
use r4w_wasm_abi::{AbiError, FlatHeap, Sandbox, SandboxConfig};

fn try_create(module: &LocalModule, config: &SandboxConfig) -> r4w_wasm_abi::Result<Sandbox<FlatHeap>> {
    Sandbox::<FlatHeap>::create(&loader_for(module), FLAT_PATH, config)
}

#[test]
fn test_unknown_library() {
    let result = Sandbox::<FlatHeap>::create(
        &LocalLoader::new(),
        "libmissing.so",
        &SandboxConfig::fallible(),
    );
    match result {
        Err(AbiError::LoadFailed { path, reason }) => {
            assert_eq!(path, "libmissing.so");
            assert_eq!(reason, "no such module");
        }
        other => panic!("unexpected result {:?}", other.map(|_| ())),
    }
}

#[test]
fn test_missing_info_symbol() {
    let module = flat_module().without_info_symbol().build();
    let err = try_create(&module, &SandboxConfig::fallible()).unwrap_err();
    assert!(matches!(
        err,
        AbiError::MissingSymbol(ref s) if s == "get_wasm2c_sandbox_info"
    ));
    assert!(err.is_setup_error());
    assert_eq!(module.open_libraries(), 0);
}

#[test]
fn test_module_name_prefixes_info_symbol() {
    let module = flat_module().module_name("codec_").build();

    let err = try_create(&module, &SandboxConfig::fallible()).unwrap_err();
    assert!(matches!(err, AbiError::MissingSymbol(_)));

    let sandbox = try_create(&module, &SandboxConfig::fallible().module_name("codec_"))
        .expect("prefixed info symbol");
    let add = sandbox.typed_func::<(u32, u32), u32>("add").expect("add");
    assert_eq!(add.call(&sandbox, (1, 2)), 3);
}

#[test]
fn test_instance_creation_failure() {
    let module = flat_module().fail_instance_creation().build();
    let err = try_create(&module, &SandboxConfig::fallible()).unwrap_err();
    assert!(matches!(err, AbiError::InstanceCreation));
    assert_eq!(module.live_instances(), 0);
    assert_eq!(module.open_libraries(), 0);
}

#[test]
fn test_missing_memory_tears_down_instance() {
    let module = flat_module().without_memory().build();
    let err = try_create(&module, &SandboxConfig::fallible()).unwrap_err();
    assert!(matches!(err, AbiError::MissingMemory));
    assert!(err.is_setup_error());
    assert_eq!(module.live_instances(), 0);
    assert_eq!(module.open_libraries(), 0);
}

#[test]
fn test_missing_allocator() {
    let module = LocalModule::builder()
        .export_fn("add", |_: &GuestCx, a: u32, b: u32| a + b)
        .without_allocator()
        .build();
    let err = try_create(&module, &SandboxConfig::fallible()).unwrap_err();
    assert!(matches!(err, AbiError::MissingSymbol(ref s) if s == "w2c_malloc"));
    assert_eq!(module.live_instances(), 0);
}

#[test]
#[should_panic(expected = "could not load sandboxed library")]
fn test_infallible_creation_is_fatal() {
    let _ = Sandbox::<FlatHeap>::create(&LocalLoader::new(), "libmissing.so", &SandboxConfig::default());
}

#[test]
fn test_invalid_config_is_rejected() {
    let module = flat_module().build();
    let config = SandboxConfig::fallible().max_callbacks(0);
    let err = try_create(&module, &config).unwrap_err();
    assert!(matches!(err, AbiError::Config(_)));
    assert!(!err.is_setup_error());
    assert_eq!(module.open_libraries(), 0);
}

#[test]
fn test_config_from_json() {
    let config = SandboxConfig::from_json(r#"{ "infallible": false, "max_callbacks": 4 }"#)
        .expect("valid config");
    assert!(!config.infallible);
    assert_eq!(config.max_callbacks, 4);

    let module = flat_module().build();
    let sandbox = try_create(&module, &config).expect("sandbox");
    assert_eq!(sandbox.config().max_callbacks, 4);
}

#[test]
fn test_destroy_releases_instance_and_library() {
    let module = flat_module().build();
    let sandbox = try_create(&module, &SandboxConfig::default()).expect("sandbox");
    assert_eq!(module.live_instances(), 1);
    assert_eq!(module.open_libraries(), 1);

    let core = std::sync::Arc::clone(sandbox.core());
    sandbox.destroy();
    assert!(core.is_destroyed());
    assert_eq!(module.live_instances(), 0);

    drop(core);
    assert_eq!(module.open_libraries(), 0);
}

#[test]
fn test_independent_sandboxes_share_a_module() {
    let module = flat_module().build();
    let loader = loader_for(&module);
    let config = SandboxConfig::default();

    let a = Sandbox::<FlatHeap>::create(&loader, FLAT_PATH, &config).expect("a");
    let b = Sandbox::<FlatHeap>::create(&loader, FLAT_PATH, &config).expect("b");
    assert_eq!(module.live_instances(), 2);
    assert_ne!(a.get_memory_location(), b.get_memory_location());
    assert_ne!(a.instance(), b.instance());

    let p = a.malloc_in_sandbox(4);
    a.write(p, 7u32).expect("write");
    assert!(!b.is_pointer_in_sandbox_memory(a.get_unsandboxed_pointer(p)));

    drop(a);
    assert_eq!(module.live_instances(), 1);
    drop(b);
    assert_eq!(module.live_instances(), 0);
}

#[test]
#[cfg(target_pointer_width = "64")]
fn test_aligned_config_refuses_unaligned_heap() {
    let module = flat_module().build();
    let config = SandboxConfig::aligned().infallible(false);
    match try_create(&module, &config) {
        Ok(sandbox) => assert!(sandbox.is_heap_aligned()),
        Err(AbiError::MisalignedHeap(base)) => {
            assert_ne!(base as u64 % (1 << 32), 0);
            assert_eq!(module.live_instances(), 0);
        }
        Err(other) => panic!("unexpected error {other}"),
    }
}
