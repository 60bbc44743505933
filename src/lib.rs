//! # silvan
//!
//! Silvan is the bytecode interpreter of a small managed-language virtual
//! machine: a stack-based execution engine with an activation-record stack
//! that doubles as the expression stack, structured exception handling,
//! virtual dispatch through per-object metadata, and a safepoint protocol
//! that lets a tracing collector walk the stack with lazily built pointer
//! maps.
//!
//! The package-file loader, the production collector and the host driver are
//! external collaborators; this crate talks to them through narrow
//! interfaces ([`PackageBuilder`], the heap allocation entry points, and
//! [`Io`]) and ships working stand-ins for all three.
//!
//! # Examples
//!
//! ```rust
//! use silvan::{FunctionBuilder, Interpreter, Opcode, PackageBuilder, ValueKind};
//!
//! let mut function = FunctionBuilder::new();
//! function.returns(ValueKind::I32);
//! function.op_i(Opcode::I32, 42);
//! function.op(Opcode::Ret);
//!
//! let mut package = PackageBuilder::new();
//! let entry = package.add_function(function.finish());
//!
//! let mut interp = Interpreter::new();
//! let package = package.instantiate(&mut interp).expect("valid package");
//! assert_eq!(interp.call(&package.function(entry)).expect("no exception"), 42);
//! ```

#![warn(missing_docs)]

mod builtins;
mod bytecode;
mod class;
mod function;
mod heap;
mod io;
mod package;
mod pmap;
mod runner;
mod stack;

#[cfg(test)]
mod tests;

use core::fmt;

pub use silvan_core::{memory_units, HostError, TrapCode, Word};

pub use self::{
    builtins::{is_builtin_id, BuiltinClass, BuiltinFunction, Roots},
    bytecode::{read_vbn, write_vbn, Opcode},
    class::{Class, ClassRef, Field, Meta, MetaRef, ValueKind},
    function::{FuncRef, Function, FunctionBuilder, FunctionDef},
    heap::{Heap, Ref},
    io::{Io, StdIo, StdIoError},
    package::{ClassDef, Package, PackageBuilder, PackageRef},
    pmap::StackPointerMap,
    runner::{Interpreter, DEFAULT_HEAP_CAPACITY, DEFAULT_STACK_SIZE},
    stack::{Stack, FRAME_CONTROL_SIZE, WORD_SIZE},
};

/// A typed value handed to the interpreter from outside, used to push call
/// arguments. On the stack every variant occupies one word.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum Value {
    /// 8-bit signed integer.
    I8(i8),
    /// 16-bit signed integer.
    I16(i16),
    /// 32-bit signed integer.
    I32(i32),
    /// 64-bit signed integer.
    I64(i64),
    /// 32-bit float.
    F32(f32),
    /// 64-bit float.
    F64(f64),
    /// Boolean.
    Bool(bool),
    /// The unit value.
    Unit,
    /// The null reference.
    Null,
    /// A heap reference.
    Ref(Ref),
}

impl From<Value> for Word {
    fn from(value: Value) -> Word {
        match value {
            Value::I8(value) => value.into(),
            Value::I16(value) => value.into(),
            Value::I32(value) => value.into(),
            Value::I64(value) => value.into(),
            Value::F32(value) => value.into(),
            Value::F64(value) => value.into(),
            Value::Bool(value) => value.into(),
            Value::Unit | Value::Null => Word::ZERO,
            Value::Ref(value) => value.into(),
        }
    }
}

/// Error type surfaced to the host.
///
/// Language-level exceptions are not errors in this sense: they unwind to an
/// installed handler and running code recovers. Only an exception that
/// reaches the outermost frame, a malformed definition, or a failing host
/// I/O shell surface here. Fatal invariant violations (unknown opcode,
/// allocation failure after collection, stack overflow, unanalyzable
/// bytecode) abort the process instead.
#[derive(Debug)]
pub enum Error {
    /// An exception reached the outermost frame. The interpreter has reset
    /// itself and can be reused; the payload is the exception object.
    UnhandledException(Ref),
    /// A definition fed to the builders was malformed.
    Definition(String),
    /// A custom [`Io`] implementation failed.
    Host(Box<dyn HostError>),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::UnhandledException(_) => write!(f, "unhandled exception"),
            Error::Definition(message) => write!(f, "definition error: {message}"),
            Error::Host(error) => write!(f, "host error: {error}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<Box<dyn HostError>> for Error {
    fn from(error: Box<dyn HostError>) -> Error {
        Error::Host(error)
    }
}
