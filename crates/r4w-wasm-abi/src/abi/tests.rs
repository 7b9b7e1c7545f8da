//! Tests for type conversion and signature rewriting.

use super::*;

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq)]
struct Pair {
    a: u32,
    b: u32,
}

// SAFETY: two u32 fields, no padding.
unsafe impl Flat for Pair {}

#[test]
fn test_lane_rules() {
    let ptr = Lane::I32;
    assert_eq!(AbiType::I8.lane(ptr), Some(Lane::I32));
    assert_eq!(AbiType::U16.lane(ptr), Some(Lane::I32));
    assert_eq!(AbiType::I32.lane(ptr), Some(Lane::I32));
    assert_eq!(AbiType::U64.lane(ptr), Some(Lane::I64));
    assert_eq!(AbiType::F32.lane(ptr), Some(Lane::F32));
    assert_eq!(AbiType::F64.lane(ptr), Some(Lane::F64));
    assert_eq!(AbiType::Pointer.lane(ptr), Some(Lane::I32));
    assert_eq!(AbiType::FuncPointer.lane(Lane::I64), Some(Lane::I64));
    assert_eq!(AbiType::aggregate::<Pair>().lane(ptr), Some(Lane::I32));
    assert_eq!(AbiType::Void.lane(ptr), None);
}

#[test]
fn test_rewrite_for_call_order() {
    let pair = AbiType::aggregate::<Pair>();
    let sig = Signature::new(vec![AbiType::I32, pair], pair);
    let rewritten = sig.rewrite_for_call();

    assert_eq!(
        rewritten.params(),
        &[AbiType::Context, AbiType::Pointer, AbiType::I32, AbiType::Pointer]
    );
    assert_eq!(rewritten.ret(), AbiType::Void);
}

#[test]
fn test_rewrite_scalar_signature_only_adds_context() {
    let sig = Signature::new(vec![AbiType::U32, AbiType::F64], AbiType::I64);
    let rewritten = sig.rewrite_for_call();
    assert_eq!(rewritten.params(), &[AbiType::Context, AbiType::U32, AbiType::F64]);
    assert_eq!(rewritten.ret(), AbiType::I64);
    assert!(!rewritten.returns_aggregate());
}

#[test]
fn test_callback_type_puts_out_pointer_first() {
    let pair = AbiType::aggregate::<Pair>();
    let sig = Signature::new(vec![AbiType::F32], pair);
    let wire = sig.rewrite_for_callback().lower(Lane::I32);

    assert_eq!(wire.params, vec![Lane::I32, Lane::F32]);
    assert_eq!(wire.result, None);
    assert_eq!(wire.result_count(), 0);
    assert_eq!(wire.type_array(), vec![Lane::I32, Lane::F32]);
}

#[test]
fn test_type_array_appends_result() {
    let wire = Signature::new(vec![AbiType::U8, AbiType::U64], AbiType::F64).lower(Lane::I32);
    assert_eq!(wire.type_array(), vec![Lane::I32, Lane::I64, Lane::F64]);
    assert_eq!(wire.to_string(), "(i32, i64) -> f64");
}

#[test]
#[should_panic(expected = "void is not a parameter type")]
fn test_void_param_rejected() {
    Signature::new(vec![AbiType::Void], AbiType::Void);
}

#[test]
fn test_guest_params_describe_tuples() {
    assert_eq!(<() as GuestParams>::abi_types(), Vec::<AbiType>::new());
    assert_eq!(
        <(u8, i64, *mut u32) as GuestParams>::abi_types(),
        vec![AbiType::U8, AbiType::I64, AbiType::Pointer]
    );
    assert_eq!(
        <(ByValue<Pair>,) as GuestParams>::abi_types(),
        vec![AbiType::aggregate::<Pair>()]
    );
}

#[test]
fn test_guest_type_round_trip_through_host_value() {
    let value = ByValue(Pair { a: 7, b: 9 });
    let host = GuestType::into_host(value);
    assert_eq!(host, HostValue::Aggregate(vec![7, 0, 0, 0, 9, 0, 0, 0]));
    assert_eq!(<ByValue<Pair> as GuestType>::from_host(&host), Some(value));

    assert_eq!(<i8 as GuestType>::from_host(&HostValue::Int(-3)), Some(-3i8));
    assert_eq!(<bool as GuestType>::from_host(&HostValue::Int(2)), Some(true));
    assert_eq!(<f32 as GuestType>::from_host(&HostValue::F64(1.0)), None);
}

#[test]
fn test_closure_into_callback() {
    let callback = (|a: u32, b: u32| a.wrapping_mul(b)).into_callback();
    assert_eq!(
        callback.signature(),
        &Signature::new(vec![AbiType::U32, AbiType::U32], AbiType::U32)
    );
    assert_eq!(
        callback.call(&[HostValue::Int(6), HostValue::Int(7)]),
        HostValue::Int(42)
    );

    let unit = (|| ()).into_callback();
    assert_eq!(unit.signature().ret(), AbiType::Void);
    assert_eq!(unit.call(&[]), HostValue::Void);
}

#[test]
#[should_panic(expected = "signature mismatch")]
fn test_callback_argument_mismatch_is_fatal() {
    let callback = (|a: u32| a).into_callback();
    callback.call(&[HostValue::F32(1.0)]);
}
