use crate::TrapCode;

/// Arithmetic operations of the typed opcode families.
///
/// Integer implementations wrap modulo `2^width`; float implementations
/// follow IEEE 754.
pub trait ArithmeticOps<T>: Copy {
    /// Add two values.
    fn add(self, other: T) -> T;
    /// Subtract two values.
    fn sub(self, other: T) -> T;
    /// Multiply two values.
    fn mul(self, other: T) -> T;
    /// Divide two values.
    fn div(self, other: T) -> Result<T, TrapCode>;
    /// Negate a value.
    fn neg(self) -> T;
}

/// Operations defined on the integer widths only.
pub trait Integer<T>: ArithmeticOps<T> {
    /// Get division remainder.
    fn rem(self, other: T) -> Result<T, TrapCode>;
    /// Logical shift left; the shift amount is masked to the operand width.
    fn lsl(self, other: T) -> T;
    /// Logical (unsigned) shift right, masked like `lsl`.
    fn lsr(self, other: T) -> T;
    /// Arithmetic (signed) shift right, masked like `lsl`.
    fn asr(self, other: T) -> T;
    /// Bitwise complement.
    fn inv(self) -> T;
}

/// Convert one type to another by extension: sign extension between integer
/// widths, exact conversion from an integer to a float, or the float promote.
pub trait ExtendInto<T> {
    /// Extend `self` into the wider type.
    fn extend_into(self) -> T;
}

/// Convert one type to another by losing width (the float demote).
pub trait WrapInto<T> {
    /// Wrap `self` into the narrower type.
    fn wrap_into(self) -> T;
}

/// Convert a float to an integer by rounding toward zero.
///
/// Values outside the destination range saturate and NaN becomes zero; the
/// bytecode contract leaves out-of-range inputs implementation-defined.
pub trait TruncateSaturateInto<T> {
    /// Round toward zero into the integer type.
    fn truncate_saturate_into(self) -> T;
}

/// Types that can be converted from and to little endian bytes.
pub trait LittleEndianConvert {
    /// The little endian bytes representation.
    type Bytes: Default + AsRef<[u8]> + AsMut<[u8]>;

    /// Converts `self` into little endian bytes.
    fn into_le_bytes(self) -> Self::Bytes;

    /// Converts little endian bytes into `Self`.
    fn from_le_bytes(bytes: Self::Bytes) -> Self;
}

macro_rules! impl_arithmetic_ops_for_int {
    ( $( $int:ty ),* $(,)? ) => {
        $(
            impl ArithmeticOps<$int> for $int {
                #[inline]
                fn add(self, other: $int) -> $int {
                    self.wrapping_add(other)
                }

                #[inline]
                fn sub(self, other: $int) -> $int {
                    self.wrapping_sub(other)
                }

                #[inline]
                fn mul(self, other: $int) -> $int {
                    self.wrapping_mul(other)
                }

                #[inline]
                fn div(self, other: $int) -> Result<$int, TrapCode> {
                    if other == 0 {
                        return Err(TrapCode::DivisionByZero);
                    }
                    Ok(self.wrapping_div(other))
                }

                #[inline]
                fn neg(self) -> $int {
                    self.wrapping_neg()
                }
            }
        )*
    };
}
impl_arithmetic_ops_for_int!(i8, i16, i32, i64);

macro_rules! impl_arithmetic_ops_for_float {
    ( $( $float:ty ),* $(,)? ) => {
        $(
            impl ArithmeticOps<$float> for $float {
                #[inline]
                fn add(self, other: $float) -> $float {
                    self + other
                }

                #[inline]
                fn sub(self, other: $float) -> $float {
                    self - other
                }

                #[inline]
                fn mul(self, other: $float) -> $float {
                    self * other
                }

                #[inline]
                fn div(self, other: $float) -> Result<$float, TrapCode> {
                    Ok(self / other)
                }

                #[inline]
                fn neg(self) -> $float {
                    -self
                }
            }
        )*
    };
}
impl_arithmetic_ops_for_float!(f32, f64);

macro_rules! impl_integer {
    ( $( ($int:ty, $uint:ty) ),* $(,)? ) => {
        $(
            impl Integer<$int> for $int {
                #[inline]
                fn rem(self, other: $int) -> Result<$int, TrapCode> {
                    if other == 0 {
                        return Err(TrapCode::DivisionByZero);
                    }
                    Ok(self.wrapping_rem(other))
                }

                #[inline]
                fn lsl(self, other: $int) -> $int {
                    self.wrapping_shl(other as u32)
                }

                #[inline]
                fn lsr(self, other: $int) -> $int {
                    (self as $uint).wrapping_shr(other as u32) as $int
                }

                #[inline]
                fn asr(self, other: $int) -> $int {
                    self.wrapping_shr(other as u32)
                }

                #[inline]
                fn inv(self) -> $int {
                    !self
                }
            }
        )*
    };
}
impl_integer!((i8, u8), (i16, u16), (i32, u32), (i64, u64));

macro_rules! impl_extend_into {
    ( $( $from:ty => $to:ty ),* $(,)? ) => {
        $(
            impl ExtendInto<$to> for $from {
                #[inline]
                fn extend_into(self) -> $to {
                    self as $to
                }
            }
        )*
    };
}
impl_extend_into! {
    i8 => i16,
    i8 => i32,
    i8 => i64,
    i16 => i32,
    i16 => i64,
    i32 => i64,
    i32 => f32,
    i64 => f64,
}

impl ExtendInto<f64> for f32 {
    #[inline]
    fn extend_into(self) -> f64 {
        f64::from(self)
    }
}

impl WrapInto<f32> for f64 {
    #[inline]
    fn wrap_into(self) -> f32 {
        self as f32
    }
}

macro_rules! impl_truncate_saturate_into {
    ( $( $from:ty => $to:ty ),* $(,)? ) => {
        $(
            impl TruncateSaturateInto<$to> for $from {
                #[inline]
                fn truncate_saturate_into(self) -> $to {
                    // `as` rounds toward zero, saturates at the bounds and
                    // maps NaN to zero.
                    self as $to
                }
            }
        )*
    };
}
impl_truncate_saturate_into! {
    f32 => i32,
    f64 => i64,
}

macro_rules! impl_little_endian_convert {
    ( $( $primitive:ty ),* $(,)? ) => {
        $(
            impl LittleEndianConvert for $primitive {
                type Bytes = [u8; core::mem::size_of::<$primitive>()];

                #[inline]
                fn into_le_bytes(self) -> Self::Bytes {
                    <$primitive>::to_le_bytes(self)
                }

                #[inline]
                fn from_le_bytes(bytes: Self::Bytes) -> Self {
                    <$primitive>::from_le_bytes(bytes)
                }
            }
        )*
    };
}
impl_little_endian_convert!(u8, u16, u32, u64, i8, i16, i32, i64, f32, f64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn int_arithmetic_wraps() {
        assert_eq!(i8::MAX.add(1), i8::MIN);
        assert_eq!(i32::MIN.sub(1), i32::MAX);
        assert_eq!(i64::MIN.neg(), i64::MIN);
        assert_eq!(i32::MIN.div(-1), Ok(i32::MIN));
    }

    #[test]
    fn division_by_zero_traps() {
        assert_eq!(1i32.div(0), Err(TrapCode::DivisionByZero));
        assert_eq!(1i64.rem(0), Err(TrapCode::DivisionByZero));
    }

    #[test]
    fn shifts_mask_to_width() {
        assert_eq!(1i8.lsl(9), 2);
        assert_eq!((-1i8).lsr(1), 0x7f);
        assert_eq!((-2i8).asr(1), -1);
        assert_eq!(1i64.lsl(65), 2);
    }

    #[test]
    fn float_to_int_saturates() {
        assert_eq!(f32::NAN.truncate_saturate_into(), 0i32);
        assert_eq!(1e30f32.truncate_saturate_into(), i32::MAX);
        assert_eq!((-1.9f64).truncate_saturate_into(), -1i64);
    }
}
