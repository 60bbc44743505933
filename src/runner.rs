//! The execution engine: frame protocol, opcode dispatch, exception unwind,
//! builtin dispatch and the safepoint protocol.

use crate::{
    builtins::{is_builtin_id, BuiltinClass, BuiltinFunction, Roots},
    bytecode::{self, Opcode},
    class::{Class, ClassRef, MetaRef},
    function::FuncRef,
    heap::{Heap, HeapValue, Ref},
    io::{Io, StdIo},
    pmap::StackPointerMap,
    stack::{Stack, FRAME_CONTROL_SIZE, SAVED_FP_OFFSET, SAVED_FUNCTION_OFFSET, SAVED_PC_OFFSET, WORD_SIZE},
    Error, Value,
};
use silvan_core::{
    memory_units::Bytes,
    ArithmeticOps,
    ExtendInto,
    Integer,
    LittleEndianConvert,
    TrapCode,
    TruncateSaturateInto,
    Word,
    WrapInto,
};
use std::rc::Rc;

/// Default size of the interpreter stack region.
pub const DEFAULT_STACK_SIZE: Bytes = Bytes(128 * 1024);

/// Default heap capacity.
pub const DEFAULT_HEAP_CAPACITY: Bytes = Bytes(16 * 1024 * 1024);

/// The pc sentinel marking the outermost caller: returning to it ends the
/// dispatch loop.
pub(crate) const PC_DONE: u64 = u64::MAX;

/// A handler snapshot taken by `PUSHTRY`: where exception flow resumes.
#[derive(Debug, Copy, Clone)]
struct Handler {
    /// Frame pointer offset at the moment the try region was entered.
    fp: usize,
    /// Stack pointer offset at the same moment.
    sp: usize,
    /// Byte offset of the catch block.
    pc: u64,
}

/// A bytecode interpreter instance.
///
/// One instance owns its stack, heap and roots table and is single-threaded
/// and non-reentrant: [`Interpreter::call`] runs to completion before it can
/// be called again. After an unhandled exception the instance resets itself
/// and stays usable.
pub struct Interpreter {
    stack: Stack,
    heap: Heap,
    roots: Roots,
    handlers: Vec<Handler>,
    function: Option<FuncRef>,
    pc: u64,
    io: Box<dyn Io>,
}

impl Default for Interpreter {
    fn default() -> Interpreter {
        Interpreter::new()
    }
}

impl Interpreter {
    /// Creates an interpreter with default limits and the process stdio.
    pub fn new() -> Interpreter {
        Interpreter::with_limits(DEFAULT_STACK_SIZE, DEFAULT_HEAP_CAPACITY)
    }

    /// Creates an interpreter with an explicit stack size and heap capacity.
    pub fn with_limits(stack_size: Bytes, heap_capacity: Bytes) -> Interpreter {
        let mut heap = Heap::new(heap_capacity);
        let roots = Roots::new(&mut heap);
        Interpreter {
            stack: Stack::new(stack_size),
            heap,
            roots,
            handlers: Vec::new(),
            function: None,
            pc: PC_DONE,
            io: Box::new(StdIo),
        }
    }

    /// Replaces the I/O shell used by the `print` and `read` builtins.
    pub fn set_io(&mut self, io: Box<dyn Io>) {
        self.io = io;
    }

    /// The heap of this instance.
    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    /// Mutable access to the heap, for embedders installing constants.
    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    /// The roots table of this instance.
    pub fn roots(&self) -> &Roots {
        &self.roots
    }

    #[cfg(test)]
    pub(crate) fn stack(&self) -> &Stack {
        &self.stack
    }

    #[cfg(test)]
    pub(crate) fn handler_count(&self) -> usize {
        self.handlers.len()
    }

    /// Pushes an argument for the next [`Interpreter::call`].
    ///
    /// Arguments are pushed in declaration order, first parameter first.
    pub fn push_arg(&mut self, value: Value) {
        self.stack.push(value.into());
    }

    /// Executes `callee` from offset 0 with its arguments already pushed and
    /// returns its return value as a raw word.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnhandledException`] if an exception reaches the
    /// outermost frame (the instance has reset itself and can be reused),
    /// or [`Error::Host`] if the I/O shell fails.
    pub fn call(&mut self, callee: &FuncRef) -> Result<i64, Error> {
        assert_eq!(self.pc, PC_DONE, "interpreter instance is already executing");
        self.enter(callee);
        let mut result = 0;
        while self.pc != PC_DONE {
            let opcode = self.fetch_opcode();
            if let Err(error) = self.step(opcode, &mut result) {
                // `throw` already resets on the unhandled-exception path; a
                // host error can surface mid-frame, so reset here as well.
                self.stack.reset();
                self.handlers.clear();
                self.function = None;
                self.pc = PC_DONE;
                return Err(error);
            }
            #[cfg(feature = "extra-checks")]
            self.check_stack_shape();
        }
        Ok(result)
    }

    fn fetch_opcode(&mut self) -> Opcode {
        let function = self.function.as_ref().expect("no function to execute");
        let byte = function.instructions()[self.pc as usize];
        self.pc += 1;
        Opcode::from_u8(byte).unwrap_or_else(|| panic!("{}: 0x{byte:02x}", TrapCode::UnknownOpcode))
    }

    fn step(&mut self, opcode: Opcode, result: &mut i64) -> Result<(), Error> {
        match opcode {
            Opcode::Nop => {}

            Opcode::Ret => {
                let value: i64 = self.pop();
                self.leave();
                if self.pc == PC_DONE {
                    *result = value;
                } else {
                    self.push(value);
                }
            }

            Opcode::Branch => {
                let block = self.read_vbn();
                self.pc = self.current_function().block_offset(block as usize);
            }

            Opcode::BranchIf => {
                let on_true = self.read_vbn();
                let on_false = self.read_vbn();
                let condition: bool = self.pop();
                let block = if condition { on_true } else { on_false };
                self.pc = self.current_function().block_offset(block as usize);
            }

            Opcode::PushTry => {
                let try_block = self.read_vbn();
                let catch_block = self.read_vbn();
                let function = self.current_function();
                self.pc = function.block_offset(try_block as usize);
                self.handlers.push(Handler {
                    fp: self.stack.fp(),
                    sp: self.stack.sp(),
                    pc: function.block_offset(catch_block as usize),
                });
            }

            Opcode::PopTry => {
                let done_block = self.read_vbn();
                self.pc = self.current_function().block_offset(done_block as usize);
                self.handlers.pop();
            }

            Opcode::Throw => {
                let exception = self.pop_ref();
                self.throw(exception)?;
            }

            Opcode::Drop => {
                self.stack.pop();
            }

            Opcode::Dup => {
                let top = self.stack.peek(0);
                self.stack.push(top);
            }

            Opcode::DupI => {
                let depth = self.read_vbn() as usize;
                let value = self.stack.peek(depth);
                self.stack.push(value);
            }

            Opcode::Swap => {
                let top = self.stack.peek(0);
                let other = self.stack.peek(1);
                self.stack.set_peek(0, other);
                self.stack.set_peek(1, top);
            }

            Opcode::Swap2 => {
                let top = self.stack.peek(0);
                let other = self.stack.peek(2);
                self.stack.set_peek(0, other);
                self.stack.set_peek(2, top);
            }

            Opcode::Unit | Opcode::False | Opcode::Nul => self.push(Word::ZERO),
            Opcode::True => self.push(true),
            Opcode::Uninitialized => self.push_ref(Ref::UNINITIALIZED),

            Opcode::I8 => {
                let value = self.read_vbn() as i8;
                self.push(value);
            }
            Opcode::I16 => {
                let value = self.read_vbn() as i16;
                self.push(value);
            }
            Opcode::I32 => {
                let value = self.read_vbn() as i32;
                self.push(value);
            }
            Opcode::I64 => {
                let value = self.read_vbn();
                self.push(value);
            }

            Opcode::F32 => {
                let bits = self.read_f32_bits();
                self.push(Word::from_bits(u64::from(bits)));
            }
            Opcode::F64 => {
                let bits = self.read_f64_bits();
                self.push(Word::from_bits(bits));
            }

            Opcode::String => {
                let index = self.read_vbn();
                let string = self.current_function().package().string(index);
                self.push_ref(string);
            }

            Opcode::Cls => {
                let id = self.read_vbn();
                let class = if is_builtin_id(id) {
                    self.roots.builtin_class(id).clone()
                } else {
                    self.current_function().package().class(id)
                };
                self.push_ref(class.mirror());
            }

            Opcode::Tycs | Opcode::Tyvs => {
                // Type metadata is consumed by verification only.
                self.read_vbn();
            }

            Opcode::LdLocal => {
                let index = self.read_vbn();
                let offset = self.local_offset(index);
                let value = self.stack.read_word(offset);
                self.stack.push(Word::from_bits(value));
            }

            Opcode::StLocal => {
                let index = self.read_vbn();
                let offset = self.local_offset(index);
                let value = self.stack.pop();
                self.stack.write_word(offset, value.to_bits());
            }

            Opcode::Ld8 => self.run_load::<i8>()?,
            Opcode::Ld16 => self.run_load::<i16>()?,
            Opcode::Ld32 => self.run_load::<i32>()?,
            Opcode::Ld64 => self.run_load::<i64>()?,
            Opcode::Ldp => self.run_load_ref(false)?,
            Opcode::Ldpc => self.run_load_ref(true)?,

            Opcode::St8 => self.run_store::<i8>()?,
            Opcode::St16 => self.run_store::<i16>()?,
            Opcode::St32 => self.run_store::<i32>()?,
            Opcode::St64 => self.run_store::<i64>()?,
            Opcode::Stp => self.run_store_ref()?,

            Opcode::AllocObj => {
                let class_id = self.read_vbn();
                let meta = self.meta_for_class_id(class_id);
                let object = self.allocate_retry(|heap| heap.try_allocate(&meta));
                self.push_ref(object);
            }

            Opcode::AllocArri => {
                let class_id = self.read_vbn();
                let length = self.read_vbn() as u64;
                let meta = self.meta_for_class_id(class_id);
                let object = self.allocate_retry(|heap| heap.try_allocate_array(&meta, length));
                self.push_ref(object);
            }

            Opcode::CallG => {
                // The argument count is encoded but unused at runtime: the
                // operands are already on the stack.
                self.read_vbn();
                let id = self.read_vbn();
                if is_builtin_id(id) {
                    let builtin = BuiltinFunction::from_id(id)
                        .unwrap_or_else(|| panic!("unknown builtin function id {id}"));
                    self.run_builtin(builtin)?;
                } else {
                    let callee = self.current_function().package().function(id);
                    self.enter(&callee);
                }
            }

            Opcode::CallV => {
                let argument_count = self.read_vbn();
                let method_index = self.read_vbn();
                let receiver = Ref::from(self.stack.peek((argument_count - 1) as usize));
                if receiver.is_null() {
                    return self.throw_builtin(BuiltinClass::NullPointerException);
                }
                let callee = self.instance_meta_of(receiver).method(method_index as usize);
                match callee.builtin_id() {
                    Some(builtin) => self.run_builtin(builtin)?,
                    None => self.enter(&callee),
                }
            }

            Opcode::EqP => self.run_relop::<u64, _>(|left, right| left == right),
            Opcode::NeP => self.run_relop::<u64, _>(|left, right| left != right),

            Opcode::AddI8 => self.run_add::<i8>(),
            Opcode::AddI16 => self.run_add::<i16>(),
            Opcode::AddI32 => self.run_add::<i32>(),
            Opcode::AddI64 => self.run_add::<i64>(),
            Opcode::SubI8 => self.run_sub::<i8>(),
            Opcode::SubI16 => self.run_sub::<i16>(),
            Opcode::SubI32 => self.run_sub::<i32>(),
            Opcode::SubI64 => self.run_sub::<i64>(),
            Opcode::MulI8 => self.run_mul::<i8>(),
            Opcode::MulI16 => self.run_mul::<i16>(),
            Opcode::MulI32 => self.run_mul::<i32>(),
            Opcode::MulI64 => self.run_mul::<i64>(),
            Opcode::DivI8 => self.run_div::<i8>()?,
            Opcode::DivI16 => self.run_div::<i16>()?,
            Opcode::DivI32 => self.run_div::<i32>()?,
            Opcode::DivI64 => self.run_div::<i64>()?,
            Opcode::ModI8 => self.run_rem::<i8>()?,
            Opcode::ModI16 => self.run_rem::<i16>()?,
            Opcode::ModI32 => self.run_rem::<i32>()?,
            Opcode::ModI64 => self.run_rem::<i64>()?,
            Opcode::LslI8 => self.run_lsl::<i8>(),
            Opcode::LslI16 => self.run_lsl::<i16>(),
            Opcode::LslI32 => self.run_lsl::<i32>(),
            Opcode::LslI64 => self.run_lsl::<i64>(),
            Opcode::LsrI8 => self.run_lsr::<i8>(),
            Opcode::LsrI16 => self.run_lsr::<i16>(),
            Opcode::LsrI32 => self.run_lsr::<i32>(),
            Opcode::LsrI64 => self.run_lsr::<i64>(),
            Opcode::AsrI8 => self.run_asr::<i8>(),
            Opcode::AsrI16 => self.run_asr::<i16>(),
            Opcode::AsrI32 => self.run_asr::<i32>(),
            Opcode::AsrI64 => self.run_asr::<i64>(),
            Opcode::AndI8 => self.run_binop::<i8, _>(|l, r| l & r),
            Opcode::AndI16 => self.run_binop::<i16, _>(|l, r| l & r),
            Opcode::AndI32 => self.run_binop::<i32, _>(|l, r| l & r),
            Opcode::AndI64 => self.run_binop::<i64, _>(|l, r| l & r),
            Opcode::OrI8 => self.run_binop::<i8, _>(|l, r| l | r),
            Opcode::OrI16 => self.run_binop::<i16, _>(|l, r| l | r),
            Opcode::OrI32 => self.run_binop::<i32, _>(|l, r| l | r),
            Opcode::OrI64 => self.run_binop::<i64, _>(|l, r| l | r),
            Opcode::XorI8 => self.run_binop::<i8, _>(|l, r| l ^ r),
            Opcode::XorI16 => self.run_binop::<i16, _>(|l, r| l ^ r),
            Opcode::XorI32 => self.run_binop::<i32, _>(|l, r| l ^ r),
            Opcode::XorI64 => self.run_binop::<i64, _>(|l, r| l ^ r),
            Opcode::EqI8 => self.run_relop::<i8, _>(|l, r| l == r),
            Opcode::EqI16 => self.run_relop::<i16, _>(|l, r| l == r),
            Opcode::EqI32 => self.run_relop::<i32, _>(|l, r| l == r),
            Opcode::EqI64 => self.run_relop::<i64, _>(|l, r| l == r),
            Opcode::NeI8 => self.run_relop::<i8, _>(|l, r| l != r),
            Opcode::NeI16 => self.run_relop::<i16, _>(|l, r| l != r),
            Opcode::NeI32 => self.run_relop::<i32, _>(|l, r| l != r),
            Opcode::NeI64 => self.run_relop::<i64, _>(|l, r| l != r),
            Opcode::LtI8 => self.run_relop::<i8, _>(|l, r| l < r),
            Opcode::LtI16 => self.run_relop::<i16, _>(|l, r| l < r),
            Opcode::LtI32 => self.run_relop::<i32, _>(|l, r| l < r),
            Opcode::LtI64 => self.run_relop::<i64, _>(|l, r| l < r),
            Opcode::LeI8 => self.run_relop::<i8, _>(|l, r| l <= r),
            Opcode::LeI16 => self.run_relop::<i16, _>(|l, r| l <= r),
            Opcode::LeI32 => self.run_relop::<i32, _>(|l, r| l <= r),
            Opcode::LeI64 => self.run_relop::<i64, _>(|l, r| l <= r),
            Opcode::GtI8 => self.run_relop::<i8, _>(|l, r| l > r),
            Opcode::GtI16 => self.run_relop::<i16, _>(|l, r| l > r),
            Opcode::GtI32 => self.run_relop::<i32, _>(|l, r| l > r),
            Opcode::GtI64 => self.run_relop::<i64, _>(|l, r| l > r),
            Opcode::GeI8 => self.run_relop::<i8, _>(|l, r| l >= r),
            Opcode::GeI16 => self.run_relop::<i16, _>(|l, r| l >= r),
            Opcode::GeI32 => self.run_relop::<i32, _>(|l, r| l >= r),
            Opcode::GeI64 => self.run_relop::<i64, _>(|l, r| l >= r),
            Opcode::NegI8 => self.run_neg::<i8>(),
            Opcode::NegI16 => self.run_neg::<i16>(),
            Opcode::NegI32 => self.run_neg::<i32>(),
            Opcode::NegI64 => self.run_neg::<i64>(),
            Opcode::InvI8 => self.run_inv::<i8>(),
            Opcode::InvI16 => self.run_inv::<i16>(),
            Opcode::InvI32 => self.run_inv::<i32>(),
            Opcode::InvI64 => self.run_inv::<i64>(),

            Opcode::AddF32 => self.run_add::<f32>(),
            Opcode::AddF64 => self.run_add::<f64>(),
            Opcode::SubF32 => self.run_sub::<f32>(),
            Opcode::SubF64 => self.run_sub::<f64>(),
            Opcode::MulF32 => self.run_mul::<f32>(),
            Opcode::MulF64 => self.run_mul::<f64>(),
            Opcode::DivF32 => self.run_div::<f32>()?,
            Opcode::DivF64 => self.run_div::<f64>()?,
            Opcode::EqF32 => self.run_relop::<f32, _>(|l, r| l == r),
            Opcode::EqF64 => self.run_relop::<f64, _>(|l, r| l == r),
            Opcode::NeF32 => self.run_relop::<f32, _>(|l, r| l != r),
            Opcode::NeF64 => self.run_relop::<f64, _>(|l, r| l != r),
            Opcode::LtF32 => self.run_relop::<f32, _>(|l, r| l < r),
            Opcode::LtF64 => self.run_relop::<f64, _>(|l, r| l < r),
            Opcode::LeF32 => self.run_relop::<f32, _>(|l, r| l <= r),
            Opcode::LeF64 => self.run_relop::<f64, _>(|l, r| l <= r),
            Opcode::GtF32 => self.run_relop::<f32, _>(|l, r| l > r),
            Opcode::GtF64 => self.run_relop::<f64, _>(|l, r| l > r),
            Opcode::GeF32 => self.run_relop::<f32, _>(|l, r| l >= r),
            Opcode::GeF64 => self.run_relop::<f64, _>(|l, r| l >= r),
            Opcode::NegF32 => self.run_neg::<f32>(),
            Opcode::NegF64 => self.run_neg::<f64>(),

            Opcode::NotB => {
                let value: bool = self.pop();
                self.push(!value);
            }

            Opcode::TruncI8 => self.run_trunc::<i8>(),
            Opcode::TruncI16 => self.run_trunc::<i16>(),
            Opcode::TruncI32 => self.run_trunc::<i32>(),
            Opcode::TruncF32 => self.run_wrap::<f64, f32>(),
            Opcode::Sext8To16 => self.run_extend::<i8, i16>(),
            Opcode::Sext8To32 => self.run_extend::<i8, i32>(),
            Opcode::Sext8To64 => self.run_extend::<i8, i64>(),
            Opcode::Sext16To32 => self.run_extend::<i16, i32>(),
            Opcode::Sext16To64 => self.run_extend::<i16, i64>(),
            Opcode::Sext32To64 => self.run_extend::<i32, i64>(),
            Opcode::ExtF64 => self.run_extend::<f32, f64>(),
            Opcode::FcvtI32 => self.run_trunc_to_int::<f32, i32>(),
            Opcode::FcvtI64 => self.run_trunc_to_int::<f64, i64>(),
            Opcode::IcvtF32 => self.run_extend::<i32, f32>(),
            Opcode::IcvtF64 => self.run_extend::<i64, f64>(),

            // Zero extensions and bit-preserving reinterpretations are
            // no-ops on word-sized slots.
            Opcode::ZextI16
            | Opcode::ZextI32
            | Opcode::ZextI64
            | Opcode::FtoI32
            | Opcode::FtoI64
            | Opcode::ItoF32
            | Opcode::ItoF64 => {}
        }
        Ok(())
    }

    // Decoding.

    fn read_vbn(&mut self) -> i64 {
        let function = self.function.as_ref().expect("no function to execute");
        let mut pos = self.pc as usize;
        let value = bytecode::read_vbn(function.instructions(), &mut pos);
        self.pc = pos as u64;
        value
    }

    fn read_f32_bits(&mut self) -> u32 {
        let function = self.function.as_ref().expect("no function to execute");
        let mut pos = self.pc as usize;
        let bits = bytecode::read_f32_bits(function.instructions(), &mut pos);
        self.pc = pos as u64;
        bits
    }

    fn read_f64_bits(&mut self) -> u64 {
        let function = self.function.as_ref().expect("no function to execute");
        let mut pos = self.pc as usize;
        let bits = bytecode::read_f64_bits(function.instructions(), &mut pos);
        self.pc = pos as u64;
        bits
    }

    // Typed stack access.

    fn push<T: Into<Word>>(&mut self, value: T) {
        self.stack.push(value.into());
    }

    fn pop<T: From<Word>>(&mut self) -> T {
        self.stack.pop().into()
    }

    fn pop_pair<T: From<Word>>(&mut self) -> (T, T) {
        let right = self.pop();
        let left = self.pop();
        (left, right)
    }

    fn push_ref(&mut self, value: Ref) {
        self.stack.push(value.into());
    }

    fn pop_ref(&mut self) -> Ref {
        self.stack.pop().into()
    }

    fn current_function(&self) -> FuncRef {
        self.function
            .as_ref()
            .expect("no function to execute")
            .clone()
    }

    fn local_offset(&self, index: i64) -> usize {
        let fp = self.stack.fp();
        if index >= 0 {
            // Parameter: slot 0 sits immediately above the control words.
            fp + FRAME_CONTROL_SIZE + self.current_function().parameter_offset(index as usize)
        } else {
            // Local: -1 is the first local, growing downward in word steps.
            fp - (-index as usize) * WORD_SIZE
        }
    }

    // Frame protocol.

    fn enter(&mut self, callee: &FuncRef) {
        // The callee needs a pointer map before its frame exists; building
        // it may look up other functions, which is why construction waits
        // until the function is actually called.
        self.ensure_pointer_map(callee);
        log::trace!("enter function {}", callee.index());
        self.stack.align();
        self.stack.push(Word::from_bits(self.pc));
        self.stack.push(Word::from_bits(self.caller_word()));
        self.stack.push(Word::from_bits(self.stack.fp() as u64));
        let fp = self.stack.sp();
        self.stack.set_fp(fp);
        for _ in 0..callee.local_kinds().len() {
            // Locals start as null so reference slots are valid at the
            // earliest safepoint.
            self.stack.push(Word::ZERO);
        }
        self.function = Some(callee.clone());
        self.pc = 0;
    }

    fn leave(&mut self) {
        let function = self.function.take().expect("no frame to leave");
        let fp = self.stack.fp();
        self.pc = self.stack.read_word(fp + SAVED_PC_OFFSET);
        let caller = self.stack.read_word(fp + SAVED_FUNCTION_OFFSET);
        self.function = if caller == 0 {
            None
        } else {
            Some(function.package().function((caller - 1) as i64))
        };
        self.stack
            .set_sp(fp + FRAME_CONTROL_SIZE + function.parameters_size());
        let saved_fp = self.stack.read_word(fp + SAVED_FP_OFFSET) as usize;
        self.stack.set_fp(saved_fp);
    }

    fn caller_word(&self) -> u64 {
        self.function
            .as_ref()
            .map_or(0, |function| u64::from(function.index()) + 1)
    }

    fn ensure_pointer_map(&self, function: &FuncRef) {
        if function.pointer_map().is_none() {
            let map = StackPointerMap::build(function);
            function.set_pointer_map(Rc::new(map));
        }
    }

    // Exceptions.

    fn throw(&mut self, exception: Ref) -> Result<(), Error> {
        match self.handlers.pop() {
            None => {
                // Unwind everything and reset so the instance can be reused.
                log::trace!("unhandled exception {exception:?}");
                self.stack.reset();
                self.function = None;
                self.pc = PC_DONE;
                Err(Error::UnhandledException(exception))
            }
            Some(handler) => {
                debug_assert!(
                    handler.fp >= self.stack.fp(),
                    "handler frame was popped without POPTRY"
                );
                // Restore fp and sp straight from the snapshot; frames are
                // walked only to re-derive the function of the handler's
                // frame.
                let package = self.current_function().package();
                let mut fp = self.stack.fp();
                while fp != handler.fp {
                    let caller = self.stack.read_word(fp + SAVED_FUNCTION_OFFSET);
                    debug_assert_ne!(caller, 0, "handler outside every live frame");
                    self.function = Some(package.function((caller - 1) as i64));
                    fp = self.stack.read_word(fp + SAVED_FP_OFFSET) as usize;
                }
                self.stack.set_fp(handler.fp);
                self.stack.set_sp(handler.sp);
                self.pc = handler.pc;
                self.push_ref(exception);
                Ok(())
            }
        }
    }

    fn throw_builtin(&mut self, class: BuiltinClass) -> Result<(), Error> {
        // Checks fire at pcs the pointer maps do not cover, so the thrown
        // instance comes from the pre-allocated pool instead of the heap.
        log::trace!("throwing builtin {class:?}");
        let exception = self.roots.pooled_exception(class);
        self.throw(exception)
    }

    // Safepoints and allocation.

    fn allocate_retry(&mut self, allocate: impl Fn(&mut Heap) -> Option<Ref>) -> Ref {
        if let Some(object) = allocate(&mut self.heap) {
            return object;
        }
        self.collect_garbage();
        allocate(&mut self.heap).unwrap_or_else(|| panic!("{}", TrapCode::HeapExhausted))
    }

    fn collect_garbage(&mut self) {
        let function = self.function.clone().expect("collection outside a frame");
        // Save the pc on the stack across the collection so the program
        // point of the innermost frame stays discoverable.
        self.stack.push(Word::from_bits(self.pc));
        #[cfg(feature = "extra-checks")]
        self.verify_safepoint(&function);
        self.heap.collect(&self.stack, &function, self.pc, &self.roots);
        self.stack.pop();
    }

    fn meta_for_class_id(&mut self, id: i64) -> MetaRef {
        if is_builtin_id(id) {
            return self.roots.builtin_meta(id);
        }
        let class = self.current_function().package().class(id);
        Class::ensure_instance_meta(&class)
    }

    fn instance_meta_of(&self, receiver: Ref) -> MetaRef {
        match self.heap.get(receiver) {
            HeapValue::Object { meta, .. } => meta.clone(),
            HeapValue::String(_) => self.roots.builtin_meta(BuiltinClass::String.id()),
            HeapValue::Class(_) => panic!("virtual call on a class mirror"),
        }
    }

    #[cfg(feature = "extra-checks")]
    fn check_stack_shape(&self) {
        assert!(self.stack.sp() <= self.stack.fp(), "sp above fp");
        assert!(self.stack.fp() <= self.stack.limit(), "fp out of bounds");
    }

    #[cfg(feature = "extra-checks")]
    fn verify_safepoint(&self, function: &FuncRef) {
        crate::heap::each_stack_ref(&self.stack, function, self.pc, |r| {
            assert!(
                r.is_null() || r.is_uninitialized() || self.heap.is_live(r),
                "pointer map reports a non-reference slot as reference: {r:?}"
            );
        });
    }

    // Object field access.

    fn field_offset(&self, object: Ref, index: i64) -> u32 {
        self.heap
            .object_meta(object)
            .class()
            .field_offset(index as usize)
    }

    fn run_load<T>(&mut self) -> Result<(), Error>
    where
        T: LittleEndianConvert + Into<Word>,
    {
        let index = self.read_vbn();
        let object = self.pop_ref();
        if object.is_null() {
            return self.throw_builtin(BuiltinClass::NullPointerException);
        }
        let offset = self.field_offset(object, index);
        let value: T = self.heap.load(object, offset);
        self.push(value);
        Ok(())
    }

    fn run_load_ref(&mut self, check_initialized: bool) -> Result<(), Error> {
        let index = self.read_vbn();
        let object = self.pop_ref();
        if object.is_null() {
            return self.throw_builtin(BuiltinClass::NullPointerException);
        }
        let offset = self.field_offset(object, index);
        let value = Ref::from_bits(self.heap.load::<u64>(object, offset));
        if check_initialized && value.is_uninitialized() {
            return self.throw_builtin(BuiltinClass::UninitializedException);
        }
        self.push_ref(value);
        Ok(())
    }

    fn run_store<T>(&mut self) -> Result<(), Error>
    where
        T: LittleEndianConvert + From<Word>,
    {
        let index = self.read_vbn();
        let object = self.pop_ref();
        let value: T = self.pop();
        if object.is_null() {
            return self.throw_builtin(BuiltinClass::NullPointerException);
        }
        let offset = self.field_offset(object, index);
        self.heap.store(object, offset, value);
        Ok(())
    }

    fn run_store_ref(&mut self) -> Result<(), Error> {
        let index = self.read_vbn();
        let object = self.pop_ref();
        let value = self.pop_ref();
        if object.is_null() {
            return self.throw_builtin(BuiltinClass::NullPointerException);
        }
        let offset = self.field_offset(object, index);
        self.heap.store::<u64>(object, offset, value.to_bits());
        self.heap.record_write(object, offset, value);
        Ok(())
    }

    // Typed operation families.

    fn run_binop<T, F>(&mut self, f: F)
    where
        T: From<Word> + Into<Word>,
        F: FnOnce(T, T) -> T,
    {
        let (left, right) = self.pop_pair::<T>();
        self.push(f(left, right));
    }

    fn run_relop<T, F>(&mut self, f: F)
    where
        T: From<Word>,
        F: FnOnce(T, T) -> bool,
    {
        let (left, right) = self.pop_pair::<T>();
        self.push(f(left, right));
    }

    fn run_add<T: ArithmeticOps<T> + From<Word> + Into<Word>>(&mut self) {
        self.run_binop::<T, _>(|left, right| left.add(right));
    }

    fn run_sub<T: ArithmeticOps<T> + From<Word> + Into<Word>>(&mut self) {
        self.run_binop::<T, _>(|left, right| left.sub(right));
    }

    fn run_mul<T: ArithmeticOps<T> + From<Word> + Into<Word>>(&mut self) {
        self.run_binop::<T, _>(|left, right| left.mul(right));
    }

    fn run_div<T: ArithmeticOps<T> + From<Word> + Into<Word>>(&mut self) -> Result<(), Error> {
        let (left, right) = self.pop_pair::<T>();
        match left.div(right) {
            Ok(value) => {
                self.push(value);
                Ok(())
            }
            Err(_) => self.throw_builtin(BuiltinClass::Exception),
        }
    }

    fn run_rem<T: Integer<T> + From<Word> + Into<Word>>(&mut self) -> Result<(), Error> {
        let (left, right) = self.pop_pair::<T>();
        match left.rem(right) {
            Ok(value) => {
                self.push(value);
                Ok(())
            }
            Err(_) => self.throw_builtin(BuiltinClass::Exception),
        }
    }

    fn run_lsl<T: Integer<T> + From<Word> + Into<Word>>(&mut self) {
        self.run_binop::<T, _>(|left, right| left.lsl(right));
    }

    fn run_lsr<T: Integer<T> + From<Word> + Into<Word>>(&mut self) {
        self.run_binop::<T, _>(|left, right| left.lsr(right));
    }

    fn run_asr<T: Integer<T> + From<Word> + Into<Word>>(&mut self) {
        self.run_binop::<T, _>(|left, right| left.asr(right));
    }

    fn run_neg<T: ArithmeticOps<T> + From<Word> + Into<Word>>(&mut self) {
        let value: T = self.pop();
        self.push(value.neg());
    }

    fn run_inv<T: Integer<T> + From<Word> + Into<Word>>(&mut self) {
        let value: T = self.pop();
        self.push(value.inv());
    }

    fn run_trunc<T: From<Word> + Into<Word>>(&mut self) {
        let value: T = self.pop();
        self.push(value);
    }

    fn run_extend<F, T>(&mut self)
    where
        F: From<Word> + ExtendInto<T>,
        T: Into<Word>,
    {
        let value: F = self.pop();
        self.push(value.extend_into());
    }

    fn run_wrap<F, T>(&mut self)
    where
        F: From<Word> + WrapInto<T>,
        T: Into<Word>,
    {
        let value: F = self.pop();
        self.push(value.wrap_into());
    }

    fn run_trunc_to_int<F, T>(&mut self)
    where
        F: From<Word> + TruncateSaturateInto<T>,
        T: Into<Word>,
    {
        let value: F = self.pop();
        self.push(value.truncate_saturate_into());
    }

    // Builtins.

    fn run_builtin(&mut self, id: BuiltinFunction) -> Result<(), Error> {
        use BuiltinFunction::*;
        log::trace!("builtin {id:?}");
        match id {
            RootClassTypeof => {
                // Allocate first: the receiver stays on the stack and thus
                // visible to the collector.
                let meta = self.roots.builtin_meta(BuiltinClass::Type.id());
                let instance = self.allocate_retry(|heap| heap.try_allocate(&meta));
                let receiver = self.pop_ref();
                let mirror = self.class_mirror_of(receiver);
                self.heap.store::<u64>(instance, 0, mirror.to_bits());
                self.heap.record_write(instance, 0, mirror);
                self.push_ref(instance);
            }

            RootClassCtor | ExceptionCtor | NullPointerExceptionCtor => {
                // A no-op constructor: overwrite the receiver with unit.
                self.stack.set_peek(0, Word::ZERO);
            }

            TypeCtor => {
                let class = self.pop_ref();
                let receiver = self.pop_ref();
                self.heap.store::<u64>(receiver, 0, class.to_bits());
                self.heap.record_write(receiver, 0, class);
                self.push(0i8);
            }

            TypeIsSubtypeOf => {
                let other = self.pop_ref();
                let receiver = self.pop_ref();
                let receiver_class = self.type_argument(receiver);
                let other_class = self.type_argument(other);
                self.push(Class::is_subtype_of(&receiver_class, &other_class));
            }

            StringConcatOp => {
                // Operands stay on the stack until the concatenation is
                // allocated, keeping them rooted across a collection.
                let right = Ref::from(self.stack.peek(0));
                let left = Ref::from(self.stack.peek(1));
                let text = {
                    let left = self.heap.string(left).expect("string operand");
                    let right = self.heap.string(right).expect("string operand");
                    let mut text = String::with_capacity(left.len() + right.len());
                    text.push_str(left);
                    text.push_str(right);
                    text
                };
                let result = self.allocate_retry(|heap| heap.try_allocate_string(&text));
                self.stack.pop();
                self.stack.pop();
                self.push_ref(result);
            }

            StringLtOp => {
                let ordering = self.pop_string_ordering();
                self.push(ordering.is_lt());
            }
            StringLeOp => {
                let ordering = self.pop_string_ordering();
                self.push(ordering.is_le());
            }
            StringGtOp => {
                let ordering = self.pop_string_ordering();
                self.push(ordering.is_gt());
            }
            StringGeOp => {
                let ordering = self.pop_string_ordering();
                self.push(ordering.is_ge());
            }
            StringEqOp => {
                let ordering = self.pop_string_ordering();
                self.push(ordering.is_eq());
            }
            StringNeOp => {
                let ordering = self.pop_string_ordering();
                self.push(ordering.is_ne());
            }

            UnitToString => {
                let string = self.allocate_retry(|heap| heap.try_allocate_string("unit"));
                self.stack.set_peek(0, string.into());
            }

            BooleanToString => {
                let value: bool = self.pop();
                let text = if value { "true" } else { "false" };
                let string = self.allocate_retry(|heap| heap.try_allocate_string(text));
                self.push_ref(string);
            }

            I8ToString => self.run_int_to_string::<i8>(),
            I16ToString => self.run_int_to_string::<i16>(),
            I32ToString => self.run_int_to_string::<i32>(),
            I64ToString => self.run_int_to_string::<i64>(),

            F32ToString => {
                let value: f32 = self.pop();
                let text = value.to_string();
                let string = self.allocate_retry(|heap| heap.try_allocate_string(&text));
                self.push_ref(string);
            }
            F64ToString => {
                let value: f64 = self.pop();
                let text = value.to_string();
                let string = self.allocate_retry(|heap| heap.try_allocate_string(&text));
                self.push_ref(string);
            }

            PrintFunction => {
                let string = self.pop_ref();
                let text = self.heap.string(string).expect("string argument");
                self.io.print(text).map_err(Error::Host)?;
                self.push(0i8);
            }

            ReadFunction => match self.io.read_line() {
                Err(host) => return Err(Error::Host(host)),
                Ok(None) => return self.throw_builtin(BuiltinClass::Exception),
                Ok(Some(line)) => {
                    let string = self.allocate_retry(|heap| heap.try_allocate_string(&line));
                    self.push_ref(string);
                }
            },
        }
        Ok(())
    }

    fn run_int_to_string<T>(&mut self)
    where
        T: From<Word> + Into<i64>,
    {
        let value: T = self.pop();
        let text = Into::<i64>::into(value).to_string();
        let string = self.allocate_retry(|heap| heap.try_allocate_string(&text));
        self.push_ref(string);
    }

    fn pop_string_ordering(&mut self) -> std::cmp::Ordering {
        let right = self.pop_ref();
        let left = self.pop_ref();
        let left = self.heap.string(left).expect("string operand");
        let right = self.heap.string(right).expect("string operand");
        left.cmp(right)
    }

    fn class_mirror_of(&self, receiver: Ref) -> Ref {
        match self.heap.get(receiver) {
            HeapValue::Object { meta, .. } => meta.class().mirror(),
            HeapValue::String(_) => self.roots.builtin_class(BuiltinClass::String.id()).mirror(),
            HeapValue::Class(_) => panic!("typeof on a class mirror"),
        }
    }

    fn type_argument(&self, instance: Ref) -> ClassRef {
        let mirror = Ref::from_bits(self.heap.load::<u64>(instance, 0));
        self.heap
            .class_of_mirror(mirror)
            .expect("Type instance without a class")
    }
}
