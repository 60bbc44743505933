//! The built-in dispatcher: string operations, formatting, reflection and
//! host I/O.

use super::run;
use crate::{
    builtins::{BuiltinClass, BuiltinFunction},
    bytecode::Opcode,
    class::ValueKind,
    function::FunctionBuilder,
    io::Io,
    package::{ClassDef, PackageBuilder},
    Error, Interpreter, Ref,
};
use assert_matches::assert_matches;
use silvan_core::HostError;
use std::{cell::RefCell, collections::VecDeque, rc::Rc};

/// Buffer-backed stand-in for the process stdio.
#[derive(Default)]
struct BufIo {
    output: Rc<RefCell<String>>,
    input: VecDeque<String>,
}

impl Io for BufIo {
    fn print(&mut self, text: &str) -> Result<(), Box<dyn HostError>> {
        self.output.borrow_mut().push_str(text);
        Ok(())
    }

    fn read_line(&mut self) -> Result<Option<String>, Box<dyn HostError>> {
        Ok(self.input.pop_front())
    }
}

fn string_result(interp: &Interpreter, word: i64) -> String {
    interp
        .heap()
        .string(Ref::from_bits(word as u64))
        .expect("result is a string")
        .to_owned()
}

#[test]
fn concat_allocates_a_new_string() {
    let mut package = PackageBuilder::new();
    let left = package.add_string("ab");
    let right = package.add_string("cd");
    let mut f = FunctionBuilder::new();
    f.returns(ValueKind::Ref);
    f.op_i(Opcode::String, left);
    f.op_i(Opcode::String, right);
    f.op_ii(Opcode::CallG, 2, BuiltinFunction::StringConcatOp.id());
    f.op(Opcode::Ret);
    let index = package.add_function(f.finish());

    let mut interp = Interpreter::new();
    let package = package.instantiate(&mut interp).unwrap();
    let result = interp.call(&package.function(index)).unwrap();
    assert_eq!(string_result(&interp, result), "abcd");
}

#[test]
fn string_comparisons_are_lexicographic() {
    let cases = [
        (BuiltinFunction::StringLtOp, 1),
        (BuiltinFunction::StringLeOp, 1),
        (BuiltinFunction::StringGtOp, 0),
        (BuiltinFunction::StringGeOp, 0),
        (BuiltinFunction::StringEqOp, 0),
        (BuiltinFunction::StringNeOp, 1),
    ];
    for (op, expected) in cases {
        let mut package = PackageBuilder::new();
        let left = package.add_string("ab");
        let right = package.add_string("cd");
        let mut f = FunctionBuilder::new();
        f.returns(ValueKind::Bool);
        f.op_i(Opcode::String, left);
        f.op_i(Opcode::String, right);
        f.op_ii(Opcode::CallG, 2, op.id());
        f.op(Opcode::Ret);
        let index = package.add_function(f.finish());

        let mut interp = Interpreter::new();
        let package = package.instantiate(&mut interp).unwrap();
        assert_eq!(
            interp.call(&package.function(index)).unwrap(),
            expected,
            "{op:?}"
        );
    }
}

#[test]
fn primitive_to_string_formats_decimals() {
    let (mut interp, package, index) = super::single_function(|f| {
        f.returns(ValueKind::Ref);
        f.op_i(Opcode::I32, -7);
        f.op_ii(Opcode::CallG, 1, BuiltinFunction::I32ToString.id());
        f.op(Opcode::Ret);
    });
    let result = interp.call(&package.function(index)).unwrap();
    assert_eq!(string_result(&interp, result), "-7");

    let (mut interp, package, index) = super::single_function(|f| {
        f.returns(ValueKind::Ref);
        f.op(Opcode::True);
        f.op_ii(Opcode::CallG, 1, BuiltinFunction::BooleanToString.id());
        f.op(Opcode::Ret);
    });
    let result = interp.call(&package.function(index)).unwrap();
    assert_eq!(string_result(&interp, result), "true");

    let (mut interp, package, index) = super::single_function(|f| {
        f.returns(ValueKind::Ref);
        f.op(Opcode::Unit);
        f.op_ii(Opcode::CallG, 1, BuiltinFunction::UnitToString.id());
        f.op(Opcode::Ret);
    });
    let result = interp.call(&package.function(index)).unwrap();
    assert_eq!(string_result(&interp, result), "unit");

    let (mut interp, package, index) = super::single_function(|f| {
        f.returns(ValueKind::Ref);
        f.f64_const(1.5);
        f.op_ii(Opcode::CallG, 1, BuiltinFunction::F64ToString.id());
        f.op(Opcode::Ret);
    });
    let result = interp.call(&package.function(index)).unwrap();
    assert_eq!(string_result(&interp, result), "1.5");
}

#[test]
fn print_writes_through_the_io_shell() {
    let output = Rc::new(RefCell::new(String::new()));
    let mut package = PackageBuilder::new();
    let hi = package.add_string("hi");
    let mut f = FunctionBuilder::new();
    f.op_i(Opcode::String, hi);
    f.op_ii(Opcode::CallG, 1, BuiltinFunction::PrintFunction.id());
    f.op(Opcode::Ret);
    let index = package.add_function(f.finish());

    let mut interp = Interpreter::new();
    interp.set_io(Box::new(BufIo {
        output: output.clone(),
        input: VecDeque::new(),
    }));
    let package = package.instantiate(&mut interp).unwrap();
    interp.call(&package.function(index)).unwrap();
    assert_eq!(*output.borrow(), "hi");
}

#[test]
fn read_returns_a_line_and_throws_at_end_of_input() {
    let mut package = PackageBuilder::new();
    let mut f = FunctionBuilder::new();
    f.returns(ValueKind::Ref);
    f.op_ii(Opcode::CallG, 0, BuiltinFunction::ReadFunction.id());
    f.op(Opcode::Ret);
    let index = package.add_function(f.finish());

    let mut interp = Interpreter::new();
    interp.set_io(Box::new(BufIo {
        output: Rc::default(),
        input: VecDeque::from(["line one".to_owned()]),
    }));
    let package = package.instantiate(&mut interp).unwrap();
    let function = package.function(index);
    let result = interp.call(&function).unwrap();
    assert_eq!(string_result(&interp, result), "line one");
    assert_matches!(interp.call(&function), Err(Error::UnhandledException(_)));
}

#[test]
fn typeof_and_subtype_checks_reflect_the_hierarchy() {
    let mut package = PackageBuilder::new();
    package.add_class(
        ClassDef::new("C")
            .method(BuiltinFunction::RootClassCtor.id())
            .method(BuiltinFunction::RootClassTypeof.id()),
    );
    let mut f = FunctionBuilder::new();
    f.returns(ValueKind::Bool);
    f.op_i(Opcode::AllocObj, 0);
    f.op_ii(Opcode::CallV, 1, 1);
    f.op_i(Opcode::AllocObj, BuiltinClass::Root.id());
    f.op_ii(Opcode::CallV, 1, 1);
    f.op_ii(Opcode::CallG, 2, BuiltinFunction::TypeIsSubtypeOf.id());
    f.op(Opcode::Ret);
    let subtype = package.add_function(f.finish());

    let mut g = FunctionBuilder::new();
    g.returns(ValueKind::Bool);
    g.op_i(Opcode::AllocObj, BuiltinClass::Root.id());
    g.op_ii(Opcode::CallV, 1, 1);
    g.op_i(Opcode::AllocObj, 0);
    g.op_ii(Opcode::CallV, 1, 1);
    g.op_ii(Opcode::CallG, 2, BuiltinFunction::TypeIsSubtypeOf.id());
    g.op(Opcode::Ret);
    let supertype = package.add_function(g.finish());

    let mut interp = Interpreter::new();
    let package = package.instantiate(&mut interp).unwrap();
    // C is a subtype of Root but not the other way around.
    assert_eq!(interp.call(&package.function(subtype)).unwrap(), 1);
    assert_eq!(interp.call(&package.function(supertype)).unwrap(), 0);
}

#[test]
fn type_ctor_installs_the_class() {
    let mut package = PackageBuilder::new();
    let mut f = FunctionBuilder::new();
    f.returns(ValueKind::Ref).local(ValueKind::Ref);
    f.op_i(Opcode::AllocObj, BuiltinClass::Type.id());
    f.op(Opcode::Dup);
    f.op_i(Opcode::StLocal, -1);
    f.op_i(Opcode::Cls, BuiltinClass::Root.id());
    f.op_ii(Opcode::CallG, 2, BuiltinFunction::TypeCtor.id());
    f.op(Opcode::Drop);
    f.op_i(Opcode::LdLocal, -1);
    f.op(Opcode::Ret);
    let index = package.add_function(f.finish());

    let mut interp = Interpreter::new();
    let package = package.instantiate(&mut interp).unwrap();
    let result = interp.call(&package.function(index)).unwrap();
    let instance = Ref::from_bits(result as u64);
    let installed = Ref::from_bits(interp.heap().load::<u64>(instance, 0));
    let root_mirror = interp.roots().builtin_class(BuiltinClass::Root.id()).mirror();
    assert_eq!(installed, root_mirror);
}

#[test]
fn builtin_constructors_return_unit() {
    let result = run(|f| {
        f.returns(ValueKind::Unit);
        f.op_i(Opcode::AllocObj, BuiltinClass::Exception.id());
        f.op_ii(Opcode::CallV, 1, 0);
        f.op(Opcode::Ret);
    });
    assert_eq!(result.unwrap(), 0);
}
