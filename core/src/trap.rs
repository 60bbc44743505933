use core::fmt::{self, Display};

/// A condition that violates an interpreter invariant.
///
/// Unlike language-level exceptions, which unwind to an installed handler,
/// a trap is not recoverable by running code: the interpreter either turns
/// it into a thrown built-in exception (division by zero) or aborts the
/// process (everything else), because a violated invariant means the stack
/// or heap can no longer be trusted.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum TrapCode {
    /// Attempt to divide by zero in `DIV` or `MOD`.
    ///
    /// The verifier contract leaves this undefined; this implementation
    /// raises the generic built-in exception.
    DivisionByZero,

    /// The operand stack ran out of room.
    ///
    /// No stack-overflow exception is modeled; exhausting the stack is a
    /// fatal host error.
    StackOverflow,

    /// A byte in the instruction stream does not name any opcode.
    UnknownOpcode,

    /// An allocation failed even after a garbage collection pass.
    ///
    /// The heap is too small for the request.
    HeapExhausted,

    /// A function was entered whose stack pointer map could not be built.
    PointerMapUnavailable,
}

impl TrapCode {
    /// Returns the human readable trap message.
    pub fn trap_message(&self) -> &'static str {
        match self {
            TrapCode::DivisionByZero => "integer divide by zero",
            TrapCode::StackOverflow => "value stack exhausted",
            TrapCode::UnknownOpcode => "unknown opcode",
            TrapCode::HeapExhausted => "heap exhausted after garbage collection",
            TrapCode::PointerMapUnavailable => "stack pointer map could not be built",
        }
    }
}

impl Display for TrapCode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.trap_message())
    }
}
