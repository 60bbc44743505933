//! Opcode semantics: stack shuffles, literals, arithmetic, conversions,
//! locals and parameters, calls, field access and exception control flow.

use super::{run, single_function};
use crate::{
    builtins::BuiltinClass,
    bytecode::Opcode,
    class::ValueKind,
    function::FunctionBuilder,
    package::{ClassDef, PackageBuilder},
    Error, Interpreter, Value,
};
use assert_matches::assert_matches;

#[test]
fn return_an_integer() {
    let result = run(|f| {
        f.returns(ValueKind::I32);
        f.op_i(Opcode::I32, 42);
        f.op(Opcode::Ret);
    });
    assert_eq!(result.unwrap(), 42);
}

#[test]
fn narrow_literals_sign_extend() {
    let result = run(|f| {
        f.returns(ValueKind::I8);
        f.op_i(Opcode::I8, -100);
        f.op(Opcode::Ret);
    });
    assert_eq!(result.unwrap(), -100);
}

#[test]
fn float_literals_carry_raw_bits() {
    let result = run(|f| {
        f.returns(ValueKind::F64);
        f.f64_const(-2.5);
        f.op(Opcode::Ret);
    });
    assert_eq!(result.unwrap() as u64, (-2.5f64).to_bits());
}

#[test]
fn dup_then_drop_is_identity() {
    let result = run(|f| {
        f.returns(ValueKind::I32);
        f.op_i(Opcode::I32, 7);
        f.op(Opcode::Dup);
        f.op(Opcode::Drop);
        f.op(Opcode::Ret);
    });
    assert_eq!(result.unwrap(), 7);
}

#[test]
fn swap_twice_is_identity() {
    let result = run(|f| {
        f.returns(ValueKind::I32);
        f.op_i(Opcode::I32, 1);
        f.op_i(Opcode::I32, 2);
        f.op(Opcode::Swap);
        f.op(Opcode::Swap);
        f.op(Opcode::Drop);
        f.op(Opcode::Ret);
    });
    assert_eq!(result.unwrap(), 1);
}

#[test]
fn swap2_reaches_two_below() {
    let result = run(|f| {
        f.returns(ValueKind::I32);
        f.op_i(Opcode::I32, 1);
        f.op_i(Opcode::I32, 2);
        f.op_i(Opcode::I32, 3);
        f.op(Opcode::Swap2);
        f.op(Opcode::Ret);
    });
    assert_eq!(result.unwrap(), 1);
}

#[test]
fn dupi_copies_a_deep_slot() {
    let result = run(|f| {
        f.returns(ValueKind::I32);
        f.op_i(Opcode::I32, 10);
        f.op_i(Opcode::I32, 20);
        f.op_i(Opcode::DupI, 1);
        f.op(Opcode::Ret);
    });
    assert_eq!(result.unwrap(), 10);
}

#[test]
fn integer_arithmetic_wraps_in_its_width() {
    let result = run(|f| {
        f.returns(ValueKind::I8);
        f.op_i(Opcode::I8, 127);
        f.op_i(Opcode::I8, 1);
        f.op(Opcode::AddI8);
        f.op(Opcode::Ret);
    });
    assert_eq!(result.unwrap(), -128);

    let result = run(|f| {
        f.returns(ValueKind::I32);
        f.op_i(Opcode::I32, i32::MIN as i64);
        f.op_i(Opcode::I32, -1);
        f.op(Opcode::DivI32);
        f.op(Opcode::Ret);
    });
    assert_eq!(result.unwrap(), i32::MIN as i64);
}

#[test]
fn division_by_zero_throws_the_generic_exception() {
    let result = run(|f| {
        f.returns(ValueKind::I32);
        f.op_i(Opcode::I32, 1);
        f.op_i(Opcode::I32, 0);
        f.op(Opcode::DivI32);
        f.op(Opcode::Ret);
    });
    assert_matches!(result, Err(Error::UnhandledException(_)));
}

#[test]
fn shift_amounts_mask_to_the_operand_width() {
    let result = run(|f| {
        f.returns(ValueKind::I32);
        f.op_i(Opcode::I32, 1);
        f.op_i(Opcode::I32, 33);
        f.op(Opcode::LslI32);
        f.op(Opcode::Ret);
    });
    assert_eq!(result.unwrap(), 2);

    let result = run(|f| {
        f.returns(ValueKind::I32);
        f.op_i(Opcode::I32, -1);
        f.op_i(Opcode::I32, 1);
        f.op(Opcode::LsrI32);
        f.op(Opcode::Ret);
    });
    assert_eq!(result.unwrap(), 0x7fff_ffff);

    let result = run(|f| {
        f.returns(ValueKind::I32);
        f.op_i(Opcode::I32, -2);
        f.op_i(Opcode::I32, 1);
        f.op(Opcode::AsrI32);
        f.op(Opcode::Ret);
    });
    assert_eq!(result.unwrap(), -1);
}

#[test]
fn nan_compares_unordered() {
    let relops = [
        (Opcode::LtF64, 0),
        (Opcode::LeF64, 0),
        (Opcode::GtF64, 0),
        (Opcode::GeF64, 0),
        (Opcode::EqF64, 0),
        (Opcode::NeF64, 1),
    ];
    for (relop, expected) in relops {
        let result = run(|f| {
            f.returns(ValueKind::Bool);
            f.f64_const(f64::NAN);
            f.f64_const(1.0);
            f.op(relop);
            f.op(Opcode::Ret);
        });
        assert_eq!(result.unwrap(), expected, "{relop:?}");
    }
}

#[test]
fn sext_then_trunc_is_identity() {
    let result = run(|f| {
        f.returns(ValueKind::I8);
        f.op_i(Opcode::I8, -5);
        f.op(Opcode::Sext8To64);
        f.op(Opcode::TruncI8);
        f.op(Opcode::Ret);
    });
    assert_eq!(result.unwrap(), -5);
}

#[test]
fn zext_is_a_pure_no_op() {
    let result = run(|f| {
        f.returns(ValueKind::I64);
        f.op_i(Opcode::I64, -1);
        f.op(Opcode::ZextI32);
        f.op(Opcode::Ret);
    });
    assert_eq!(result.unwrap(), -1);
}

#[test]
fn trunc_keeps_low_bits_and_sign_extends() {
    let result = run(|f| {
        f.returns(ValueKind::I8);
        f.op_i(Opcode::I32, 0x1234);
        f.op(Opcode::TruncI8);
        f.op(Opcode::Ret);
    });
    assert_eq!(result.unwrap(), 0x34);
}

#[test]
fn float_conversions_round_toward_zero() {
    let result = run(|f| {
        f.returns(ValueKind::I32);
        f.f32_const(2.9);
        f.op(Opcode::FcvtI32);
        f.op(Opcode::Ret);
    });
    assert_eq!(result.unwrap(), 2);

    let result = run(|f| {
        f.returns(ValueKind::F32);
        f.op_i(Opcode::I32, 3);
        f.op(Opcode::IcvtF32);
        f.op(Opcode::Ret);
    });
    assert_eq!(result.unwrap() as u64, u64::from(3.0f32.to_bits()));
}

#[test]
fn float_demote_and_promote() {
    let result = run(|f| {
        f.returns(ValueKind::F32);
        f.f64_const(1.5);
        f.op(Opcode::TruncF32);
        f.op(Opcode::Ret);
    });
    assert_eq!(result.unwrap() as u64, u64::from(1.5f32.to_bits()));

    let result = run(|f| {
        f.returns(ValueKind::F64);
        f.f32_const(1.5);
        f.op(Opcode::ExtF64);
        f.op(Opcode::Ret);
    });
    assert_eq!(result.unwrap() as u64, 1.5f64.to_bits());
}

#[test]
fn reinterpretations_preserve_the_word() {
    let result = run(|f| {
        f.returns(ValueKind::I32);
        f.f32_const(1.0);
        f.op(Opcode::FtoI32);
        f.op(Opcode::Ret);
    });
    assert_eq!(result.unwrap() as u64, u64::from(1.0f32.to_bits()));
}

#[test]
fn branch_on_condition() {
    let result = run(|f| {
        f.returns(ValueKind::I32);
        f.block();
        f.op(Opcode::True);
        f.op_ii(Opcode::BranchIf, 1, 2);
        f.block();
        f.op_i(Opcode::I32, 1);
        f.op(Opcode::Ret);
        f.block();
        f.op_i(Opcode::I32, 0);
        f.op(Opcode::Ret);
    });
    assert_eq!(result.unwrap(), 1);
}

#[test]
fn locals_load_and_store() {
    let result = run(|f| {
        f.returns(ValueKind::I64).local(ValueKind::I64);
        f.op_i(Opcode::I64, 9);
        f.op_i(Opcode::StLocal, -1);
        f.op_i(Opcode::LdLocal, -1);
        f.op(Opcode::Ret);
    });
    assert_eq!(result.unwrap(), 9);
}

#[test]
fn parameters_arrive_through_the_frame() {
    let (mut interp, package, index) = single_function(|f| {
        f.param(ValueKind::I32).returns(ValueKind::I32);
        f.op_i(Opcode::LdLocal, 0);
        f.op_i(Opcode::I32, 1);
        f.op(Opcode::AddI32);
        f.op(Opcode::Ret);
    });
    interp.push_arg(Value::I32(5));
    assert_eq!(interp.call(&package.function(index)).unwrap(), 6);
}

#[test]
fn parameter_slot_zero_is_the_last_pushed_argument() {
    let mut package = PackageBuilder::new();
    let mut callee = FunctionBuilder::new();
    callee
        .param(ValueKind::I32)
        .param(ValueKind::I32)
        .returns(ValueKind::I32);
    callee.op_i(Opcode::LdLocal, 0);
    callee.op_i(Opcode::LdLocal, 1);
    callee.op(Opcode::SubI32);
    callee.op(Opcode::Ret);
    let callee = package.add_function(callee.finish());

    let mut main = FunctionBuilder::new();
    main.returns(ValueKind::I32);
    main.op_i(Opcode::I32, 10);
    main.op_i(Opcode::I32, 4);
    main.op_ii(Opcode::CallG, 2, callee);
    main.op(Opcode::Ret);
    let main = package.add_function(main.finish());

    let mut interp = Interpreter::new();
    let package = package.instantiate(&mut interp).unwrap();
    // Slot 0 is the argument pushed last (4), slot 1 the one pushed first.
    assert_eq!(interp.call(&package.function(main)).unwrap(), 4 - 10);
}

#[test]
fn nested_calls_return_through_the_caller() {
    let mut package = PackageBuilder::new();
    let mut callee = FunctionBuilder::new();
    callee.returns(ValueKind::I32);
    callee.op_i(Opcode::I32, 3);
    callee.op(Opcode::Ret);
    let callee = package.add_function(callee.finish());

    let mut main = FunctionBuilder::new();
    main.returns(ValueKind::I32);
    main.op_ii(Opcode::CallG, 0, callee);
    main.op_i(Opcode::I32, 4);
    main.op(Opcode::AddI32);
    main.op(Opcode::Ret);
    let main = package.add_function(main.finish());

    let mut interp = Interpreter::new();
    let package = package.instantiate(&mut interp).unwrap();
    assert_eq!(interp.call(&package.function(main)).unwrap(), 7);
}

#[test]
fn pushtry_then_poptry_leaves_no_trace() {
    let (mut interp, package, index) = single_function(|f| {
        f.returns(ValueKind::I32);
        f.block();
        f.op_ii(Opcode::PushTry, 1, 2);
        f.block();
        f.op_i(Opcode::I32, 5);
        f.op_i(Opcode::PopTry, 3);
        f.block();
        f.op(Opcode::Drop);
        f.op_i(Opcode::I32, 9);
        f.op(Opcode::Ret);
        f.block();
        f.op(Opcode::Ret);
    });
    let function = package.function(index);
    assert_eq!(interp.call(&function).unwrap(), 5);
    assert_eq!(interp.handler_count(), 0);
    assert_eq!(interp.stack().sp(), interp.stack().limit());
    assert_eq!(interp.stack().fp(), interp.stack().limit());
}

#[test]
fn throw_unwinds_nested_frames_to_the_handler() {
    let mut package = PackageBuilder::new();
    let mut thrower = FunctionBuilder::new();
    thrower.returns(ValueKind::I32);
    thrower.op_i(Opcode::AllocObj, BuiltinClass::Exception.id());
    thrower.op(Opcode::Throw);
    let thrower = package.add_function(thrower.finish());

    let mut main = FunctionBuilder::new();
    main.returns(ValueKind::I32);
    main.block();
    main.op_ii(Opcode::PushTry, 1, 2);
    main.block();
    main.op_ii(Opcode::CallG, 0, thrower);
    main.op_i(Opcode::PopTry, 3);
    main.block();
    main.op(Opcode::Drop);
    main.op_i(Opcode::I32, 42);
    main.op(Opcode::Ret);
    main.block();
    main.op(Opcode::Ret);
    let main = package.add_function(main.finish());

    let mut interp = Interpreter::new();
    let package = package.instantiate(&mut interp).unwrap();
    assert_eq!(interp.call(&package.function(main)).unwrap(), 42);
    assert_eq!(interp.handler_count(), 0);
    assert_eq!(interp.stack().fp(), interp.stack().limit());
}

#[test]
fn unhandled_exception_resets_the_instance() {
    let mut package = PackageBuilder::new();
    let mut thrower = FunctionBuilder::new();
    thrower.op_i(Opcode::AllocObj, BuiltinClass::Exception.id());
    thrower.op(Opcode::Throw);
    let thrower = package.add_function(thrower.finish());

    let mut ok = FunctionBuilder::new();
    ok.returns(ValueKind::I32);
    ok.op_i(Opcode::I32, 1);
    ok.op(Opcode::Ret);
    let ok = package.add_function(ok.finish());

    let mut interp = Interpreter::new();
    let package = package.instantiate(&mut interp).unwrap();
    assert_matches!(
        interp.call(&package.function(thrower)),
        Err(Error::UnhandledException(_))
    );
    assert_eq!(interp.handler_count(), 0);
    assert_eq!(interp.stack().sp(), interp.stack().limit());
    // The instance reset itself and stays usable.
    assert_eq!(interp.call(&package.function(ok)).unwrap(), 1);
}

#[test]
fn fields_store_and_load_sized_values() {
    let mut package = PackageBuilder::new();
    package.add_class(
        ClassDef::new("Box")
            .field(ValueKind::I8)
            .field(ValueKind::I64),
    );
    let mut f = FunctionBuilder::new();
    f.returns(ValueKind::I8).local(ValueKind::Ref);
    f.op_i(Opcode::AllocObj, 0);
    f.op_i(Opcode::StLocal, -1);
    f.op_i(Opcode::I8, -3);
    f.op_i(Opcode::LdLocal, -1);
    f.op_i(Opcode::St8, 0);
    f.op_i(Opcode::LdLocal, -1);
    f.op_i(Opcode::Ld8, 0);
    f.op(Opcode::Ret);
    let index = package.add_function(f.finish());

    let mut interp = Interpreter::new();
    let package = package.instantiate(&mut interp).unwrap();
    assert_eq!(interp.call(&package.function(index)).unwrap(), -3);
}

#[test]
fn reference_stores_notify_the_write_barrier() {
    let mut package = PackageBuilder::new();
    let hello = package.add_string("hello");
    package.add_class(ClassDef::new("Holder").field(ValueKind::Ref));
    let mut f = FunctionBuilder::new();
    f.returns(ValueKind::Ref).local(ValueKind::Ref);
    f.op_i(Opcode::AllocObj, 0);
    f.op_i(Opcode::StLocal, -1);
    f.op_i(Opcode::String, hello);
    f.op_i(Opcode::LdLocal, -1);
    f.op_i(Opcode::Stp, 0);
    f.op_i(Opcode::LdLocal, -1);
    f.op_i(Opcode::Ldp, 0);
    f.op(Opcode::Ret);
    let index = package.add_function(f.finish());

    let mut interp = Interpreter::new();
    let package = package.instantiate(&mut interp).unwrap();
    let result = interp.call(&package.function(index)).unwrap();
    let loaded = crate::Ref::from_bits(result as u64);
    assert_eq!(interp.heap().string(loaded), Some("hello"));
    assert_eq!(interp.heap().remembered_writes().len(), 1);
}

#[test]
fn null_field_access_throws_null_pointer_exception() {
    let result = run(|f| {
        f.returns(ValueKind::Ref);
        f.op(Opcode::Nul);
        f.op_i(Opcode::Ldp, 0);
        f.op(Opcode::Ret);
    });
    assert_matches!(result, Err(Error::UnhandledException(_)));
}

#[test]
fn ldpc_rejects_the_uninitialized_sentinel() {
    let mut package = PackageBuilder::new();
    package.add_class(ClassDef::new("Cell").field(ValueKind::Ref));
    let mut f = FunctionBuilder::new();
    f.returns(ValueKind::Ref).local(ValueKind::Ref);
    f.op_i(Opcode::AllocObj, 0);
    f.op_i(Opcode::StLocal, -1);
    f.op(Opcode::Uninitialized);
    f.op_i(Opcode::LdLocal, -1);
    f.op_i(Opcode::Stp, 0);
    f.op_i(Opcode::LdLocal, -1);
    f.op_i(Opcode::Ldpc, 0);
    f.op(Opcode::Ret);
    let index = package.add_function(f.finish());

    let mut interp = Interpreter::new();
    let package = package.instantiate(&mut interp).unwrap();
    assert_matches!(
        interp.call(&package.function(index)),
        Err(Error::UnhandledException(_))
    );
}

#[test]
fn reference_identity_distinguishes_constants() {
    let mut package = PackageBuilder::new();
    let a = package.add_string("a");
    let b = package.add_string("b");
    let mut same = FunctionBuilder::new();
    same.returns(ValueKind::Bool);
    same.op_i(Opcode::String, a);
    same.op_i(Opcode::String, a);
    same.op(Opcode::EqP);
    same.op(Opcode::Ret);
    let same = package.add_function(same.finish());

    let mut different = FunctionBuilder::new();
    different.returns(ValueKind::Bool);
    different.op_i(Opcode::String, a);
    different.op_i(Opcode::String, b);
    different.op(Opcode::EqP);
    different.op(Opcode::Ret);
    let different = package.add_function(different.finish());

    let mut interp = Interpreter::new();
    let package = package.instantiate(&mut interp).unwrap();
    assert_eq!(interp.call(&package.function(same)).unwrap(), 1);
    assert_eq!(interp.call(&package.function(different)).unwrap(), 0);
}

#[test]
fn type_metadata_opcodes_are_runtime_no_ops() {
    let result = run(|f| {
        f.returns(ValueKind::I32);
        f.op_i(Opcode::Tycs, 99);
        f.op_i(Opcode::Tyvs, -7);
        f.op_i(Opcode::I32, 11);
        f.op(Opcode::Ret);
    });
    assert_eq!(result.unwrap(), 11);
}
