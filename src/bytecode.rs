//! The instruction set and its wire encoding.
//!
//! Opcodes are single bytes in a fixed enumeration. Most opcodes are followed
//! by zero or more VBN immediates: variable-length signed integers in base-128
//! little-endian order, with the MSB of each byte as a continuation flag and
//! bit 6 of the final byte as the sign to extend from. The two float literal
//! opcodes instead embed their raw 4- or 8-byte little-endian bit pattern.
//!
//! The arithmetic, comparison and conversion families follow a regular
//! `<op>I{8,16,32,64}` / `<op>F{32,64}` pattern, so the whole table is
//! generated from one description.

macro_rules! define_opcodes {
    ( $( $name:ident ),* $(,)? ) => {
        /// A single byte of the instruction stream, decoded.
        #[repr(u8)]
        #[derive(Debug, Copy, Clone, PartialEq, Eq)]
        pub enum Opcode {
            $( #[allow(missing_docs)] $name ),*
        }

        /// Every opcode in wire order; the index is the wire byte.
        const OPCODES: &[Opcode] = &[ $( Opcode::$name ),* ];
    };
}

define_opcodes! {
    // Control.
    Nop,
    Ret,
    Branch,
    BranchIf,
    PushTry,
    PopTry,
    Throw,
    // Stack shuffles.
    Drop,
    Dup,
    DupI,
    Swap,
    Swap2,
    // Literals.
    Unit,
    False,
    True,
    Nul,
    Uninitialized,
    I8,
    I16,
    I32,
    I64,
    F32,
    F64,
    String,
    Cls,
    Tycs,
    Tyvs,
    // Locals.
    LdLocal,
    StLocal,
    // Object fields.
    Ld8,
    Ld16,
    Ld32,
    Ld64,
    Ldp,
    Ldpc,
    St8,
    St16,
    St32,
    St64,
    Stp,
    // Allocation.
    AllocObj,
    AllocArri,
    // Calls.
    CallG,
    CallV,
    // Reference identity.
    EqP,
    NeP,
    // Integer arithmetic, logic and comparison.
    AddI8, AddI16, AddI32, AddI64,
    SubI8, SubI16, SubI32, SubI64,
    MulI8, MulI16, MulI32, MulI64,
    DivI8, DivI16, DivI32, DivI64,
    ModI8, ModI16, ModI32, ModI64,
    LslI8, LslI16, LslI32, LslI64,
    LsrI8, LsrI16, LsrI32, LsrI64,
    AsrI8, AsrI16, AsrI32, AsrI64,
    AndI8, AndI16, AndI32, AndI64,
    OrI8, OrI16, OrI32, OrI64,
    XorI8, XorI16, XorI32, XorI64,
    EqI8, EqI16, EqI32, EqI64,
    NeI8, NeI16, NeI32, NeI64,
    LtI8, LtI16, LtI32, LtI64,
    LeI8, LeI16, LeI32, LeI64,
    GtI8, GtI16, GtI32, GtI64,
    GeI8, GeI16, GeI32, GeI64,
    NegI8, NegI16, NegI32, NegI64,
    InvI8, InvI16, InvI32, InvI64,
    // Float arithmetic and comparison.
    AddF32, AddF64,
    SubF32, SubF64,
    MulF32, MulF64,
    DivF32, DivF64,
    EqF32, EqF64,
    NeF32, NeF64,
    LtF32, LtF64,
    LeF32, LeF64,
    GtF32, GtF64,
    GeF32, GeF64,
    NegF32, NegF64,
    // Boolean negation.
    NotB,
    // Conversions.
    TruncI8,
    TruncI16,
    TruncI32,
    TruncF32,
    Sext8To16,
    Sext8To32,
    Sext8To64,
    Sext16To32,
    Sext16To64,
    Sext32To64,
    ZextI16,
    ZextI32,
    ZextI64,
    ExtF64,
    FcvtI32,
    FcvtI64,
    IcvtF32,
    IcvtF64,
    FtoI32,
    FtoI64,
    ItoF32,
    ItoF64,
}

impl Opcode {
    /// Decodes a wire byte, or `None` if the byte names no opcode.
    pub fn from_u8(byte: u8) -> Option<Opcode> {
        OPCODES.get(byte as usize).copied()
    }

    /// Static operand effect `(pops, pushes)` of the immediate-free value
    /// opcodes: the arithmetic, comparison and conversion families plus the
    /// reference identity tests. Derived from the dense family layout of the
    /// enumeration; `None` for every opcode with immediates or control
    /// effects.
    ///
    /// Everything these opcodes push is a non-reference word.
    pub(crate) fn value_op_effect(self) -> Option<(usize, usize)> {
        use Opcode::*;
        let byte = self as u8;
        let within = |low: Opcode, high: Opcode| (low as u8..=high as u8).contains(&byte);
        if within(EqP, GeI64) || within(AddF32, GeF64) {
            Some((2, 1))
        } else if within(NegI8, InvI64)
            || within(NegF32, NegF64)
            || self == NotB
            || within(TruncI8, Sext32To64)
            || within(ExtF64, IcvtF64)
        {
            Some((1, 1))
        } else if within(ZextI16, ZextI64) || within(FtoI32, ItoF64) {
            Some((0, 0))
        } else {
            None
        }
    }
}

/// Reads a VBN immediate starting at `bytes[*pos]` and advances `pos` past it.
///
/// # Panics
///
/// Panics if the encoding runs past the end of `bytes`. The bytecode is
/// trusted; a truncated immediate means the instruction stream is corrupt.
pub fn read_vbn(bytes: &[u8], pos: &mut usize) -> i64 {
    let mut result = 0u64;
    let mut shift = 0u32;
    loop {
        let byte = bytes[*pos];
        *pos += 1;
        if shift < 64 {
            result |= u64::from(byte & 0x7f) << shift;
        }
        shift += 7;
        if byte & 0x80 == 0 {
            if shift < 64 && byte & 0x40 != 0 {
                result |= !0u64 << shift;
            }
            return result as i64;
        }
        debug_assert!(shift < 70, "unterminated VBN immediate");
    }
}

/// Appends the VBN encoding of `value` to `out`.
pub fn write_vbn(out: &mut Vec<u8>, mut value: i64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        let done = (value == 0 && byte & 0x40 == 0) || (value == -1 && byte & 0x40 != 0);
        if done {
            out.push(byte);
            return;
        }
        out.push(byte | 0x80);
    }
}

/// Reads the raw 4-byte bit pattern of an `F32` literal and advances `pos`.
pub fn read_f32_bits(bytes: &[u8], pos: &mut usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[*pos..*pos + 4]);
    *pos += 4;
    u32::from_le_bytes(raw)
}

/// Reads the raw 8-byte bit pattern of an `F64` literal and advances `pos`.
pub fn read_f64_bits(bytes: &[u8], pos: &mut usize) -> u64 {
    let mut raw = [0u8; 8];
    raw.copy_from_slice(&bytes[*pos..*pos + 8]);
    *pos += 8;
    u64::from_le_bytes(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn round_trip(value: i64) -> (i64, usize) {
        let mut buf = Vec::new();
        write_vbn(&mut buf, value);
        let mut pos = 0;
        let decoded = read_vbn(&buf, &mut pos);
        assert_eq!(pos, buf.len());
        (decoded, buf.len())
    }

    #[test]
    fn vbn_known_encodings() {
        let mut buf = Vec::new();
        write_vbn(&mut buf, 0);
        assert_eq!(buf, [0x00]);

        buf.clear();
        write_vbn(&mut buf, -1);
        assert_eq!(buf, [0x7f]);

        // 64 does not fit in one byte: bit 6 would read back as a sign.
        buf.clear();
        write_vbn(&mut buf, 64);
        assert_eq!(buf, [0xc0, 0x00]);

        buf.clear();
        write_vbn(&mut buf, -65);
        assert_eq!(buf, [0xbf, 0x7f]);
    }

    #[test]
    fn vbn_round_trips_extremes() {
        for value in [0, 1, -1, 63, -64, 64, -65, i64::MAX, i64::MIN] {
            assert_eq!(round_trip(value).0, value);
        }
        assert_eq!(round_trip(i64::MIN).1, 10);
    }

    #[test]
    fn vbn_round_trips_random() {
        let mut rng = rand::thread_rng();
        for _ in 0..1000 {
            let value: i64 = rng.gen();
            let shift = rng.gen_range(0..64);
            assert_eq!(round_trip(value >> shift).0, value >> shift);
        }
    }

    #[test]
    fn opcode_wire_bytes_are_dense() {
        assert_eq!(Opcode::from_u8(0), Some(Opcode::Nop));
        assert_eq!(Opcode::from_u8(Opcode::Ret as u8), Some(Opcode::Ret));
        assert_eq!(Opcode::from_u8(Opcode::ItoF64 as u8), Some(Opcode::ItoF64));
        assert_eq!(Opcode::from_u8(Opcode::ItoF64 as u8 + 1), None);
        assert_eq!(Opcode::from_u8(0xff), None);
    }

    #[test]
    fn float_literal_bits() {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&1.5f32.to_bits().to_le_bytes());
        bytes.extend_from_slice(&(-2.5f64).to_bits().to_le_bytes());
        let mut pos = 0;
        assert_eq!(read_f32_bits(&bytes, &mut pos), 1.5f32.to_bits());
        assert_eq!(read_f64_bits(&bytes, &mut pos), (-2.5f64).to_bits());
        assert_eq!(pos, 12);
    }
}
