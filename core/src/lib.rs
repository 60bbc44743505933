//! Core value model shared by the Silvan interpreter and its embedders.
//!
//! Everything the execution engine pushes onto its operand stack is a single
//! machine word. This crate defines that word ([`Word`]), the numeric traits
//! the opcode families are implemented against, and the [`HostError`] trait
//! used to surface embedder-specific failures through the interpreter.

mod host_error;
mod trap;
mod value;
mod word;

/// Byte sizes and units used to configure interpreter resources.
pub mod memory_units {
    pub use memory_units::{size_of, ByteSize, Bytes, RoundUpTo};
}

pub use self::{
    host_error::HostError,
    trap::TrapCode,
    value::{
        ArithmeticOps,
        ExtendInto,
        Integer,
        LittleEndianConvert,
        TruncateSaturateInto,
        WrapInto,
    },
    word::Word,
};
