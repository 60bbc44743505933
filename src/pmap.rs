//! Lazy construction of per-function stack pointer maps.
//!
//! A pointer map answers one question for the collector: at this safepoint
//! pc, which slots of the frame hold references? Safepoints are the pcs the
//! interpreter can invoke the collector from — immediately after the
//! immediates of `ALLOCOBJ`, `ALLOCARRI`, `CALLG` and `CALLV` — because that
//! is the pc value saved on the stack (or in a caller's control words) while
//! the collector runs.
//!
//! The builder runs a forward abstract interpretation over the instruction
//! stream, in the same shape as a bytecode validation pass: a worklist of
//! basic-block entry states, one reference/primitive tag per operand slot.
//! Parameter and local tags are static, taken from the function's declared
//! layout. Maps can only be built once every function the analyzed code
//! calls is resolvable through the package, which is why construction is
//! deferred until a function is actually entered.

use crate::{
    builtins::{is_builtin_id, BuiltinFunction},
    bytecode::{self, Opcode},
    function::Function,
};
use silvan_core::TrapCode;
use std::collections::{BTreeMap, HashMap};

/// Reference-slot information for one function.
///
/// Slot index `i` of a safepoint bitmap addresses the frame word at
/// `fp - (i + 1) * WORD_SIZE`: the locals first, then the operand stack in
/// push order. Parameter slots are covered by a separate bitmap addressing
/// `fp + FRAME_CONTROL_SIZE + slot * WORD_SIZE`.
pub struct StackPointerMap {
    params: Box<[bool]>,
    safepoints: BTreeMap<u64, Box<[bool]>>,
}

impl StackPointerMap {
    /// Reference tags of the parameter slots.
    pub fn params(&self) -> &[bool] {
        &self.params
    }

    /// Reference tags of the frame slots at a safepoint pc, if `pc` is one.
    pub fn safepoint(&self, pc: u64) -> Option<&[bool]> {
        self.safepoints.get(&pc).map(|bits| &**bits)
    }

    /// Number of recorded safepoints.
    pub fn safepoint_count(&self) -> usize {
        self.safepoints.len()
    }

    /// Builds the map for `function`.
    ///
    /// # Panics
    ///
    /// Panics if the instruction stream cannot be analyzed (operand stack
    /// underflow, inconsistent stack shapes at a join, or a block that falls
    /// off the end of the code). A function with an unanalyzable body cannot
    /// be entered, and the interpreter treats that as fatal.
    pub(crate) fn build(function: &Function) -> StackPointerMap {
        Builder::new(function).run()
    }
}

struct Builder<'a> {
    function: &'a Function,
    locals: Vec<bool>,
    safepoints: BTreeMap<u64, Box<[bool]>>,
    visited: HashMap<usize, Vec<bool>>,
    worklist: Vec<(usize, Vec<bool>)>,
}

impl<'a> Builder<'a> {
    fn new(function: &'a Function) -> Builder<'a> {
        Builder {
            function,
            locals: function.local_kinds().iter().map(|k| k.is_ref()).collect(),
            safepoints: BTreeMap::new(),
            visited: HashMap::new(),
            worklist: vec![(0, Vec::new())],
        }
    }

    fn run(mut self) -> StackPointerMap {
        while let Some((offset, tags)) = self.worklist.pop() {
            if let Some(seen) = self.visited.get(&offset) {
                if *seen != tags {
                    panic!(
                        "{}: inconsistent operand stacks at offset {offset}",
                        TrapCode::PointerMapUnavailable
                    );
                }
                continue;
            }
            self.visited.insert(offset, tags.clone());
            self.simulate(offset, tags);
        }
        StackPointerMap {
            params: self
                .function
                .param_kinds()
                .iter()
                .map(|k| k.is_ref())
                .collect(),
            safepoints: self.safepoints,
        }
    }

    fn simulate(&mut self, offset: usize, mut tags: Vec<bool>) {
        let code = self.function.instructions();
        let mut pos = offset;
        loop {
            if pos >= code.len() {
                panic!(
                    "{}: control falls off the end of the code",
                    TrapCode::PointerMapUnavailable
                );
            }
            let byte = code[pos];
            pos += 1;
            let opcode = Opcode::from_u8(byte)
                .unwrap_or_else(|| panic!("{}: 0x{byte:02x}", TrapCode::UnknownOpcode));
            match opcode {
                Opcode::Nop => {}
                Opcode::Ret => {
                    pop(&mut tags);
                    return;
                }
                Opcode::Branch => {
                    let target = bytecode::read_vbn(code, &mut pos);
                    self.edge(target, tags);
                    return;
                }
                Opcode::BranchIf => {
                    let on_true = bytecode::read_vbn(code, &mut pos);
                    let on_false = bytecode::read_vbn(code, &mut pos);
                    pop(&mut tags);
                    self.edge(on_true, tags.clone());
                    self.edge(on_false, tags);
                    return;
                }
                Opcode::PushTry => {
                    let try_block = bytecode::read_vbn(code, &mut pos);
                    let catch_block = bytecode::read_vbn(code, &mut pos);
                    // The handler resumes with the snapshot stack plus the
                    // thrown exception.
                    let mut catch_tags = tags.clone();
                    catch_tags.push(true);
                    self.edge(try_block, tags);
                    self.edge(catch_block, catch_tags);
                    return;
                }
                Opcode::PopTry => {
                    let done_block = bytecode::read_vbn(code, &mut pos);
                    self.edge(done_block, tags);
                    return;
                }
                Opcode::Throw => {
                    pop(&mut tags);
                    return;
                }
                Opcode::Drop => {
                    pop(&mut tags);
                }
                Opcode::Dup => {
                    let top = *tags.last().expect("dup on empty operand stack");
                    tags.push(top);
                }
                Opcode::DupI => {
                    let depth = bytecode::read_vbn(code, &mut pos) as usize;
                    let tag = tags[tags.len() - 1 - depth];
                    tags.push(tag);
                }
                Opcode::Swap => {
                    let len = tags.len();
                    tags.swap(len - 1, len - 2);
                }
                Opcode::Swap2 => {
                    let len = tags.len();
                    tags.swap(len - 1, len - 3);
                }
                Opcode::Unit | Opcode::False | Opcode::True => tags.push(false),
                Opcode::Nul | Opcode::Uninitialized => tags.push(true),
                Opcode::I8 | Opcode::I16 | Opcode::I32 | Opcode::I64 => {
                    bytecode::read_vbn(code, &mut pos);
                    tags.push(false);
                }
                Opcode::F32 => {
                    pos += 4;
                    tags.push(false);
                }
                Opcode::F64 => {
                    pos += 8;
                    tags.push(false);
                }
                Opcode::String | Opcode::Cls => {
                    bytecode::read_vbn(code, &mut pos);
                    tags.push(true);
                }
                Opcode::Tycs | Opcode::Tyvs => {
                    bytecode::read_vbn(code, &mut pos);
                }
                Opcode::LdLocal => {
                    let index = bytecode::read_vbn(code, &mut pos);
                    tags.push(self.slot_tag(index));
                }
                Opcode::StLocal => {
                    bytecode::read_vbn(code, &mut pos);
                    pop(&mut tags);
                }
                Opcode::Ld8 | Opcode::Ld16 | Opcode::Ld32 | Opcode::Ld64 => {
                    bytecode::read_vbn(code, &mut pos);
                    pop(&mut tags);
                    tags.push(false);
                }
                Opcode::Ldp | Opcode::Ldpc => {
                    bytecode::read_vbn(code, &mut pos);
                    pop(&mut tags);
                    tags.push(true);
                }
                Opcode::St8 | Opcode::St16 | Opcode::St32 | Opcode::St64 | Opcode::Stp => {
                    bytecode::read_vbn(code, &mut pos);
                    pop(&mut tags);
                    pop(&mut tags);
                }
                Opcode::AllocObj => {
                    bytecode::read_vbn(code, &mut pos);
                    self.record(pos, &tags);
                    tags.push(true);
                }
                Opcode::AllocArri => {
                    bytecode::read_vbn(code, &mut pos);
                    bytecode::read_vbn(code, &mut pos);
                    self.record(pos, &tags);
                    tags.push(true);
                }
                Opcode::CallG => {
                    bytecode::read_vbn(code, &mut pos);
                    let id = bytecode::read_vbn(code, &mut pos);
                    self.record(pos, &tags);
                    let (pops, pushes_ref) = if is_builtin_id(id) {
                        BuiltinFunction::from_id(id)
                            .unwrap_or_else(|| panic!("unknown builtin function id {id}"))
                            .stack_effect()
                    } else {
                        let callee = self.function.package().function(id);
                        (callee.param_kinds().len(), callee.return_kind().is_ref())
                    };
                    for _ in 0..pops {
                        pop(&mut tags);
                    }
                    tags.push(pushes_ref);
                }
                Opcode::CallV => {
                    let argument_count = bytecode::read_vbn(code, &mut pos);
                    bytecode::read_vbn(code, &mut pos);
                    self.record(pos, &tags);
                    for _ in 0..argument_count {
                        pop(&mut tags);
                    }
                    // The static type of a virtual result is not encoded in
                    // the stream; it is treated as a primitive word, so a
                    // returned reference is only safe on the stack until the
                    // next safepoint. The verifier contract keeps compiled
                    // code within that window.
                    tags.push(false);
                }
                other => {
                    let (pops, pushes) = other
                        .value_op_effect()
                        .expect("every remaining opcode is a value op");
                    for _ in 0..pops {
                        pop(&mut tags);
                    }
                    for _ in 0..pushes {
                        tags.push(false);
                    }
                }
            }
        }
    }

    fn slot_tag(&self, index: i64) -> bool {
        if index >= 0 {
            self.function.param_kinds()[index as usize].is_ref()
        } else {
            self.locals[(-index - 1) as usize]
        }
    }

    fn edge(&mut self, block: i64, tags: Vec<bool>) {
        let target = self.function.block_offset(block as usize) as usize;
        self.worklist.push((target, tags));
    }

    fn record(&mut self, pc: usize, tags: &[bool]) {
        let bits: Box<[bool]> = self.locals.iter().chain(tags.iter()).copied().collect();
        if let Some(existing) = self.safepoints.get(&(pc as u64)) {
            if **existing != *bits {
                panic!(
                    "{}: conflicting safepoint records at pc {pc}",
                    TrapCode::PointerMapUnavailable
                );
            }
            return;
        }
        self.safepoints.insert(pc as u64, bits);
    }
}

fn pop(tags: &mut Vec<bool>) {
    tags.pop().unwrap_or_else(|| {
        panic!(
            "{}: operand stack underflow in analysis",
            TrapCode::PointerMapUnavailable
        )
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        builtins::BuiltinClass,
        class::ValueKind,
        function::FunctionBuilder,
        package::PackageBuilder,
        Interpreter,
    };

    fn build_for(mut assemble: impl FnMut(&mut FunctionBuilder)) -> StackPointerMap {
        let mut function = FunctionBuilder::new();
        assemble(&mut function);
        let mut package = PackageBuilder::new();
        let index = package.add_function(function.finish());
        let mut interp = Interpreter::new();
        let package = package.instantiate(&mut interp).unwrap();
        StackPointerMap::build(&package.function(index))
    }

    #[test]
    fn allocation_site_sees_locals_and_operands() {
        let map = build_for(|f| {
            f.returns(ValueKind::I32).local(ValueKind::Ref);
            f.op(Opcode::Nul);
            f.op_i(Opcode::StLocal, -1);
            f.op_i(Opcode::I32, 5);
            f.op(Opcode::Nul);
            f.op_i(Opcode::AllocObj, BuiltinClass::Exception.id());
            f.op(Opcode::Drop);
            f.op(Opcode::Drop);
            f.op(Opcode::Ret);
        });
        assert_eq!(map.safepoint_count(), 1);
        // NUL; STLOCAL -1 is 3 bytes, I32 5 is 2, NUL is 1, ALLOCOBJ -4 is 2.
        let bits = map.safepoint(8).expect("allocation safepoint");
        // Local (ref), then the i32 and the null on the operand stack.
        assert_eq!(bits, [true, false, true]);
    }

    #[test]
    fn branch_join_merges_consistent_states() {
        let map = build_for(|f| {
            f.returns(ValueKind::I32);
            f.block();
            f.op(Opcode::True);
            f.op_ii(Opcode::BranchIf, 1, 2);
            f.block();
            f.op(Opcode::Nul);
            f.op_i(Opcode::Branch, 3);
            f.block();
            f.op(Opcode::Nul);
            f.op_i(Opcode::Branch, 3);
            f.block();
            f.op_i(Opcode::AllocObj, BuiltinClass::Exception.id());
            f.op(Opcode::Drop);
            f.op(Opcode::Drop);
            f.op_i(Opcode::I32, 0);
            f.op(Opcode::Ret);
        });
        let bits = map
            .safepoint(map.safepoints.keys().next().copied().unwrap())
            .unwrap();
        assert_eq!(bits, [true]);
    }

    #[test]
    fn parameter_tags_follow_the_declared_layout() {
        let map = build_for(|f| {
            f.param(ValueKind::Ref).param(ValueKind::I64);
            f.returns(ValueKind::I64);
            f.op_i(Opcode::LdLocal, 0);
            f.op(Opcode::Ret);
        });
        // Slot order is reversed push order.
        assert_eq!(map.params(), [false, true]);
    }

    #[test]
    #[should_panic(expected = "stack pointer map could not be built")]
    fn inconsistent_join_is_fatal() {
        build_for(|f| {
            f.returns(ValueKind::I32);
            f.block();
            f.op(Opcode::True);
            f.op_ii(Opcode::BranchIf, 1, 2);
            f.block();
            f.op(Opcode::Nul);
            f.op_i(Opcode::Branch, 3);
            f.block();
            f.op_i(Opcode::I32, 1);
            f.op_i(Opcode::Branch, 3);
            f.block();
            f.op_i(Opcode::AllocObj, BuiltinClass::Exception.id());
            f.op(Opcode::Drop);
            f.op(Opcode::Drop);
            f.op_i(Opcode::I32, 0);
            f.op(Opcode::Ret);
        });
    }
}
