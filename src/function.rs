//! Runtime representation of functions.
//!
//! A [`Function`] is an immutable descriptor: instruction bytes, the basic
//! block table, the parameter and local layout, and a back reference to the
//! owning package whose constant pools the instructions index into. Host
//! intrinsics are functions too; they carry a builtin id instead of a body
//! and are dispatched without building a frame.

use crate::{
    bytecode::{self, Opcode},
    builtins::BuiltinFunction,
    class::ValueKind,
    package::{Package, PackageRef},
    pmap::StackPointerMap,
    stack::WORD_SIZE,
};
use std::{
    cell::RefCell,
    fmt,
    rc::{Rc, Weak},
};

/// Reference to a function. Cloning is cheap (reference counted).
#[derive(Clone)]
pub struct FuncRef(Rc<Function>);

impl ::core::ops::Deref for FuncRef {
    type Target = Function;
    fn deref(&self) -> &Function {
        &self.0
    }
}

impl fmt::Debug for FuncRef {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.builtin_id() {
            Some(id) => write!(f, "Function {{ builtin {id:?} }}"),
            None => write!(f, "Function {{ index {} }}", self.index()),
        }
    }
}

/// Runtime representation of a function.
pub struct Function {
    index: u32,
    instructions: Box<[u8]>,
    block_offsets: Box<[u32]>,
    /// Parameter kinds in slot order: index 0 is the slot immediately above
    /// the frame control words, which is the argument the caller pushed last.
    param_kinds: Box<[ValueKind]>,
    return_kind: ValueKind,
    local_kinds: Box<[ValueKind]>,
    builtin_id: Option<BuiltinFunction>,
    package: Weak<Package>,
    pointer_map: RefCell<Option<Rc<StackPointerMap>>>,
}

impl Function {
    pub(crate) fn from_def(index: u32, def: FunctionDef, package: &PackageRef) -> FuncRef {
        FuncRef(Rc::new(Function {
            index,
            instructions: def.code.into_boxed_slice(),
            block_offsets: def.blocks.into_boxed_slice(),
            param_kinds: {
                let mut kinds = def.param_kinds;
                // Declared in push order; the slot nearest the control words
                // is the argument pushed last.
                kinds.reverse();
                kinds.into_boxed_slice()
            },
            return_kind: def.return_kind,
            local_kinds: def.local_kinds.into_boxed_slice(),
            builtin_id: None,
            package: Rc::downgrade(package),
            pointer_map: RefCell::new(None),
        }))
    }

    pub(crate) fn new_builtin(
        id: BuiltinFunction,
        param_kinds: &[ValueKind],
        return_kind: ValueKind,
    ) -> FuncRef {
        FuncRef(Rc::new(Function {
            index: u32::MAX,
            instructions: Box::default(),
            block_offsets: Box::default(),
            param_kinds: param_kinds.into(),
            return_kind,
            local_kinds: Box::default(),
            builtin_id: Some(id),
            package: Weak::new(),
            pointer_map: RefCell::new(None),
        }))
    }

    /// Position of this function in the owning package's function table.
    pub fn index(&self) -> u32 {
        self.index
    }

    /// The instruction bytes.
    pub fn instructions(&self) -> &[u8] {
        &self.instructions
    }

    /// Resolves a basic block index to its byte offset.
    pub fn block_offset(&self, index: usize) -> u64 {
        u64::from(self.block_offsets[index])
    }

    /// Parameter kinds in slot order.
    pub fn param_kinds(&self) -> &[ValueKind] {
        &self.param_kinds
    }

    /// Kind of the returned value.
    pub fn return_kind(&self) -> ValueKind {
        self.return_kind
    }

    /// Local slot kinds; index 0 is the slot just below the frame pointer.
    pub fn local_kinds(&self) -> &[ValueKind] {
        &self.local_kinds
    }

    /// Total size of the incoming parameters on the stack, in bytes.
    pub fn parameters_size(&self) -> usize {
        self.param_kinds.len() * WORD_SIZE
    }

    /// Byte offset of a parameter slot above the frame control words.
    pub fn parameter_offset(&self, index: usize) -> usize {
        debug_assert!(index < self.param_kinds.len());
        index * WORD_SIZE
    }

    /// Size of the locals area, in bytes.
    pub fn locals_size(&self) -> usize {
        self.local_kinds.len() * WORD_SIZE
    }

    /// The owning package.
    ///
    /// # Panics
    ///
    /// Panics if the package was deallocated, which would mean a function
    /// outlived its constant pools.
    pub fn package(&self) -> PackageRef {
        self.package.upgrade().expect("package deallocated")
    }

    /// The builtin id if this function is a host intrinsic.
    pub fn builtin_id(&self) -> Option<BuiltinFunction> {
        self.builtin_id
    }

    pub(crate) fn pointer_map(&self) -> Option<Rc<StackPointerMap>> {
        self.pointer_map.borrow().clone()
    }

    pub(crate) fn set_pointer_map(&self, map: Rc<StackPointerMap>) {
        *self.pointer_map.borrow_mut() = Some(map);
    }
}

/// A function definition assembled by [`FunctionBuilder`], ready to be added
/// to a package.
pub struct FunctionDef {
    pub(crate) code: Vec<u8>,
    pub(crate) blocks: Vec<u32>,
    pub(crate) param_kinds: Vec<ValueKind>,
    pub(crate) return_kind: ValueKind,
    pub(crate) local_kinds: Vec<ValueKind>,
}

/// Assembles the instruction stream and layout of one function.
///
/// Instructions are emitted in order; [`FunctionBuilder::block`] starts a new
/// basic block at the current offset and returns its index for use as a
/// branch target. Block 0 starts at offset 0 whether or not it was declared.
#[derive(Default)]
pub struct FunctionBuilder {
    code: Vec<u8>,
    blocks: Vec<u32>,
    param_kinds: Vec<ValueKind>,
    return_kind: Option<ValueKind>,
    local_kinds: Vec<ValueKind>,
}

impl FunctionBuilder {
    /// Creates an empty builder for a function returning `unit`.
    pub fn new() -> FunctionBuilder {
        FunctionBuilder::default()
    }

    /// Declares one parameter. Parameters are declared in push order: the
    /// first declared parameter is the first one the caller pushes.
    pub fn param(&mut self, kind: ValueKind) -> &mut Self {
        self.param_kinds.push(kind);
        self
    }

    /// Declares the return kind.
    pub fn returns(&mut self, kind: ValueKind) -> &mut Self {
        self.return_kind = Some(kind);
        self
    }

    /// Declares one local slot. The first declared local is index −1 in
    /// `LDLOCAL`/`STLOCAL`.
    pub fn local(&mut self, kind: ValueKind) -> &mut Self {
        self.local_kinds.push(kind);
        self
    }

    /// Starts a basic block at the current offset and returns its index.
    pub fn block(&mut self) -> i64 {
        self.blocks.push(self.code.len() as u32);
        (self.blocks.len() - 1) as i64
    }

    /// Emits an opcode without immediates.
    pub fn op(&mut self, opcode: Opcode) -> &mut Self {
        self.code.push(opcode as u8);
        self
    }

    /// Emits an opcode with one VBN immediate.
    pub fn op_i(&mut self, opcode: Opcode, immediate: i64) -> &mut Self {
        self.code.push(opcode as u8);
        bytecode::write_vbn(&mut self.code, immediate);
        self
    }

    /// Emits an opcode with two VBN immediates.
    pub fn op_ii(&mut self, opcode: Opcode, first: i64, second: i64) -> &mut Self {
        self.code.push(opcode as u8);
        bytecode::write_vbn(&mut self.code, first);
        bytecode::write_vbn(&mut self.code, second);
        self
    }

    /// Emits an `F32` literal.
    pub fn f32_const(&mut self, value: f32) -> &mut Self {
        self.code.push(Opcode::F32 as u8);
        self.code.extend_from_slice(&value.to_bits().to_le_bytes());
        self
    }

    /// Emits an `F64` literal.
    pub fn f64_const(&mut self, value: f64) -> &mut Self {
        self.code.push(Opcode::F64 as u8);
        self.code.extend_from_slice(&value.to_bits().to_le_bytes());
        self
    }

    /// Finishes assembly and returns the definition.
    pub fn finish(&mut self) -> FunctionDef {
        let builder = std::mem::take(self);
        let mut blocks = builder.blocks;
        if blocks.is_empty() {
            blocks.push(0);
        }
        FunctionDef {
            code: builder.code,
            blocks,
            param_kinds: builder.param_kinds,
            return_kind: builder.return_kind.unwrap_or(ValueKind::Unit),
            local_kinds: builder.local_kinds,
        }
    }
}
