//! Built-in classes, built-in functions and the VM roots table.
//!
//! Builtin ids share the id space of package constant-pool indices: package
//! entries are non-negative, builtins are negative, and `is_builtin_id` is
//! the bit-pattern predicate splitting the two. Index `!id` (the bitwise
//! complement) addresses the roots tables.

use crate::{
    class::{Class, ClassRef, MetaRef, ValueKind},
    function::{FuncRef, Function},
    heap::{Heap, Ref},
};
use silvan_core::TrapCode;
use std::rc::Rc;

/// Whether an id in the instruction stream names a builtin.
pub fn is_builtin_id(id: i64) -> bool {
    id < 0
}

/// Ids of the built-in classes.
#[repr(i64)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum BuiltinClass {
    /// The root of the class hierarchy.
    Root = -1,
    /// Reified types produced by `typeof`.
    Type = -2,
    /// Immutable UTF-8 strings.
    String = -3,
    /// The generic exception class.
    Exception = -4,
    /// Thrown when a null receiver is dereferenced.
    NullPointerException = -5,
    /// Thrown when an uninitialized reference field is read with `LDPC`.
    UninitializedException = -6,
}

const BUILTIN_CLASSES: &[BuiltinClass] = &[
    BuiltinClass::Root,
    BuiltinClass::Type,
    BuiltinClass::String,
    BuiltinClass::Exception,
    BuiltinClass::NullPointerException,
    BuiltinClass::UninitializedException,
];

impl BuiltinClass {
    /// Decodes a wire id.
    pub fn from_id(id: i64) -> Option<BuiltinClass> {
        BUILTIN_CLASSES.get((!id) as usize).copied()
    }

    /// The wire id of this class.
    pub fn id(self) -> i64 {
        self as i64
    }
}

/// Ids of the built-in functions.
#[repr(i64)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum BuiltinFunction {
    RootClassCtor = -1,
    RootClassTypeof = -2,
    TypeCtor = -3,
    TypeIsSubtypeOf = -4,
    ExceptionCtor = -5,
    NullPointerExceptionCtor = -6,
    StringConcatOp = -7,
    StringLtOp = -8,
    StringLeOp = -9,
    StringGtOp = -10,
    StringGeOp = -11,
    StringEqOp = -12,
    StringNeOp = -13,
    UnitToString = -14,
    BooleanToString = -15,
    I8ToString = -16,
    I16ToString = -17,
    I32ToString = -18,
    I64ToString = -19,
    F32ToString = -20,
    F64ToString = -21,
    PrintFunction = -22,
    ReadFunction = -23,
}

const BUILTIN_FUNCTIONS: &[BuiltinFunction] = &[
    BuiltinFunction::RootClassCtor,
    BuiltinFunction::RootClassTypeof,
    BuiltinFunction::TypeCtor,
    BuiltinFunction::TypeIsSubtypeOf,
    BuiltinFunction::ExceptionCtor,
    BuiltinFunction::NullPointerExceptionCtor,
    BuiltinFunction::StringConcatOp,
    BuiltinFunction::StringLtOp,
    BuiltinFunction::StringLeOp,
    BuiltinFunction::StringGtOp,
    BuiltinFunction::StringGeOp,
    BuiltinFunction::StringEqOp,
    BuiltinFunction::StringNeOp,
    BuiltinFunction::UnitToString,
    BuiltinFunction::BooleanToString,
    BuiltinFunction::I8ToString,
    BuiltinFunction::I16ToString,
    BuiltinFunction::I32ToString,
    BuiltinFunction::I64ToString,
    BuiltinFunction::F32ToString,
    BuiltinFunction::F64ToString,
    BuiltinFunction::PrintFunction,
    BuiltinFunction::ReadFunction,
];

impl BuiltinFunction {
    /// Decodes a wire id.
    pub fn from_id(id: i64) -> Option<BuiltinFunction> {
        BUILTIN_FUNCTIONS.get((!id) as usize).copied()
    }

    /// The wire id of this function.
    pub fn id(self) -> i64 {
        self as i64
    }

    /// Static operand stack effect: how many words the builtin pops and
    /// whether the word it pushes is a reference. Used by the pointer map
    /// builder; the dispatcher must agree with this table.
    pub(crate) fn stack_effect(self) -> (usize, bool) {
        use BuiltinFunction::*;
        match self {
            RootClassCtor | ExceptionCtor | NullPointerExceptionCtor => (1, false),
            RootClassTypeof => (1, true),
            TypeCtor => (2, false),
            TypeIsSubtypeOf => (2, false),
            StringConcatOp => (2, true),
            StringLtOp | StringLeOp | StringGtOp | StringGeOp | StringEqOp | StringNeOp => {
                (2, false)
            }
            UnitToString | BooleanToString => (1, true),
            I8ToString | I16ToString | I32ToString | I64ToString | F32ToString | F64ToString => {
                (1, true)
            }
            PrintFunction => (1, false),
            ReadFunction => (0, true),
        }
    }
}

/// The roots table: built-in classes and functions, plus the pre-allocated
/// exception instances thrown by the interpreter's own checks.
pub struct Roots {
    classes: Vec<ClassRef>,
    functions: Vec<FuncRef>,
    exceptions: Vec<(BuiltinClass, Ref)>,
}

impl Roots {
    pub(crate) fn new(heap: &mut Heap) -> Roots {
        use BuiltinFunction::*;
        let functions: Vec<FuncRef> = vec![
            Function::new_builtin(RootClassCtor, &[ValueKind::Ref], ValueKind::Unit),
            Function::new_builtin(RootClassTypeof, &[ValueKind::Ref], ValueKind::Ref),
            Function::new_builtin(TypeCtor, &[ValueKind::Ref, ValueKind::Ref], ValueKind::Unit),
            Function::new_builtin(
                TypeIsSubtypeOf,
                &[ValueKind::Ref, ValueKind::Ref],
                ValueKind::Bool,
            ),
            Function::new_builtin(ExceptionCtor, &[ValueKind::Ref], ValueKind::Unit),
            Function::new_builtin(NullPointerExceptionCtor, &[ValueKind::Ref], ValueKind::Unit),
            Function::new_builtin(
                StringConcatOp,
                &[ValueKind::Ref, ValueKind::Ref],
                ValueKind::Ref,
            ),
            Function::new_builtin(StringLtOp, &[ValueKind::Ref, ValueKind::Ref], ValueKind::Bool),
            Function::new_builtin(StringLeOp, &[ValueKind::Ref, ValueKind::Ref], ValueKind::Bool),
            Function::new_builtin(StringGtOp, &[ValueKind::Ref, ValueKind::Ref], ValueKind::Bool),
            Function::new_builtin(StringGeOp, &[ValueKind::Ref, ValueKind::Ref], ValueKind::Bool),
            Function::new_builtin(StringEqOp, &[ValueKind::Ref, ValueKind::Ref], ValueKind::Bool),
            Function::new_builtin(StringNeOp, &[ValueKind::Ref, ValueKind::Ref], ValueKind::Bool),
            Function::new_builtin(UnitToString, &[ValueKind::Unit], ValueKind::Ref),
            Function::new_builtin(BooleanToString, &[ValueKind::Bool], ValueKind::Ref),
            Function::new_builtin(I8ToString, &[ValueKind::I8], ValueKind::Ref),
            Function::new_builtin(I16ToString, &[ValueKind::I16], ValueKind::Ref),
            Function::new_builtin(I32ToString, &[ValueKind::I32], ValueKind::Ref),
            Function::new_builtin(I64ToString, &[ValueKind::I64], ValueKind::Ref),
            Function::new_builtin(F32ToString, &[ValueKind::F32], ValueKind::Ref),
            Function::new_builtin(F64ToString, &[ValueKind::F64], ValueKind::Ref),
            Function::new_builtin(PrintFunction, &[ValueKind::Ref], ValueKind::Unit),
            Function::new_builtin(ReadFunction, &[], ValueKind::Ref),
        ];

        let builtin_fn = |id: BuiltinFunction| functions[(!id.id()) as usize].clone();

        let root = Rc::new(Class::new("Root", None, &[], None));
        root.set_methods(vec![builtin_fn(RootClassCtor), builtin_fn(RootClassTypeof)]);

        let type_class = Rc::new(Class::new(
            "Type",
            Some(root.clone()),
            &[ValueKind::Ref],
            None,
        ));
        type_class.set_methods(vec![builtin_fn(TypeCtor), builtin_fn(TypeIsSubtypeOf)]);

        let string = Rc::new(Class::new("String", Some(root.clone()), &[], None));
        string.set_methods(vec![
            builtin_fn(StringConcatOp),
            builtin_fn(StringLtOp),
            builtin_fn(StringLeOp),
            builtin_fn(StringGtOp),
            builtin_fn(StringGeOp),
            builtin_fn(StringEqOp),
            builtin_fn(StringNeOp),
        ]);

        let exception = Rc::new(Class::new("Exception", Some(root.clone()), &[], None));
        exception.set_methods(vec![builtin_fn(ExceptionCtor)]);

        let null_pointer = Rc::new(Class::new(
            "NullPointerException",
            Some(exception.clone()),
            &[],
            None,
        ));
        null_pointer.set_methods(vec![builtin_fn(NullPointerExceptionCtor)]);

        let uninitialized = Rc::new(Class::new(
            "UninitializedException",
            Some(exception.clone()),
            &[],
            None,
        ));
        uninitialized.set_methods(vec![builtin_fn(ExceptionCtor)]);

        let classes = vec![root, type_class, string, exception, null_pointer, uninitialized];
        for class in &classes {
            let mirror = heap
                .allocate_class_mirror(class.clone())
                .unwrap_or_else(|| panic!("{}", TrapCode::HeapExhausted));
            class.set_mirror(mirror);
        }

        // The interpreter's null and initialization checks throw at sites
        // the pointer maps do not cover, so the instances they throw are
        // allocated once here and kept as roots.
        let exceptions = [
            BuiltinClass::Exception,
            BuiltinClass::NullPointerException,
            BuiltinClass::UninitializedException,
        ]
        .iter()
        .map(|&id| {
            let class = &classes[(!id.id()) as usize];
            let meta = Class::ensure_instance_meta(class);
            let instance = heap
                .try_allocate(&meta)
                .unwrap_or_else(|| panic!("{}", TrapCode::HeapExhausted));
            (id, instance)
        })
        .collect();

        Roots {
            classes,
            functions,
            exceptions,
        }
    }

    /// Looks up a built-in class by wire id.
    ///
    /// # Panics
    ///
    /// Panics if `id` names no built-in class; the bytecode is trusted.
    pub fn builtin_class(&self, id: i64) -> &ClassRef {
        self.classes
            .get((!id) as usize)
            .unwrap_or_else(|| panic!("unknown builtin class id {id}"))
    }

    /// Returns (building if necessary) the instance meta of a built-in class.
    pub fn builtin_meta(&self, id: i64) -> MetaRef {
        Class::ensure_instance_meta(self.builtin_class(id))
    }

    /// Looks up a built-in function.
    pub fn builtin_function(&self, id: BuiltinFunction) -> FuncRef {
        self.functions[(!id.id()) as usize].clone()
    }

    pub(crate) fn pooled_exception(&self, class: BuiltinClass) -> Ref {
        self.exceptions
            .iter()
            .find(|(id, _)| *id == class)
            .map(|(_, instance)| *instance)
            .expect("no pooled instance for builtin exception class")
    }

    pub(crate) fn each_root(&self, mut f: impl FnMut(Ref)) {
        for class in &self.classes {
            f(class.mirror());
        }
        for (_, instance) in &self.exceptions {
            f(*instance);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_complement_indexes_the_tables() {
        assert!(is_builtin_id(-1));
        assert!(!is_builtin_id(0));
        assert_eq!(BuiltinClass::from_id(-1), Some(BuiltinClass::Root));
        assert_eq!(
            BuiltinClass::from_id(BuiltinClass::UninitializedException.id()),
            Some(BuiltinClass::UninitializedException),
        );
        assert_eq!(BuiltinClass::from_id(-7), None);
        assert_eq!(BuiltinClass::from_id(3), None);
        assert_eq!(
            BuiltinFunction::from_id(-23),
            Some(BuiltinFunction::ReadFunction),
        );
    }
}
