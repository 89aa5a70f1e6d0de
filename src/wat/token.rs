//! Token types for the WAT lexer, including the numeric literal
//! representations and their conversions to concrete machine types.

use std::fmt;

/// A location in source text.
///
/// Spans track byte offsets (for slicing) and line/column (for errors).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: usize,
    pub end: usize,
    /// Line number (1-indexed).
    pub line: u32,
    /// Column number (1-indexed, counting characters not bytes).
    pub column: u32,
}

impl Span {
    pub const ZERO: Span = Span {
        start: 0,
        end: 0,
        line: 1,
        column: 1,
    };

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn new(start: usize, end: usize, line: u32, column: u32) -> Self {
        Self {
            start,
            end,
            line,
            column,
        }
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// A lexical token with its location in source.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub kind: TokenKind,
    pub span: Span,
}

impl Token {
    pub fn new(kind: TokenKind, span: Span) -> Self {
        Self { kind, span }
    }
}

/// The kind of token, with associated data where relevant.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenKind {
    /// Opening parenthesis `(`.
    LeftParen,
    /// Closing parenthesis `)`.
    RightParen,
    /// A bare word like `module`, `func`, `i32.add`.
    Keyword(String),
    /// An identifier like `$name`; the stored string excludes the `$`.
    Id(String),
    /// A string literal with escapes resolved; arbitrary bytes.
    String(Vec<u8>),
    /// An unsigned integer literal (no written sign).
    UnsignedInteger(IntegerLit),
    /// A signed integer literal (`+` or `-` was written).
    SignedInteger(IntegerLit),
    /// A floating-point literal.
    Float(FloatLit),
    /// An idchar sequence that is no other token kind; reported by the
    /// parser when it reaches one.
    Reserved(String),
}

/// An integer literal: magnitude plus the written sign.
///
/// Carrying the magnitude as `u64` preserves the full range of both signed
/// and unsigned 64-bit immediates; the conversions below apply the
/// per-operator range and signedness rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IntegerLit {
    pub magnitude: u64,
    pub negative: bool,
}

impl IntegerLit {
    pub fn new(magnitude: u64, negative: bool) -> Self {
        Self { magnitude, negative }
    }

    /// i32 immediate: accepts `-2^31 ..= 2^32-1`, producing the matching
    /// bit pattern.
    pub fn to_i32(self) -> Option<i32> {
        if self.negative {
            if self.magnitude <= 1 << 31 {
                Some((self.magnitude as i64).wrapping_neg() as i32)
            } else {
                None
            }
        } else if self.magnitude <= u32::MAX as u64 {
            Some(self.magnitude as u32 as i32)
        } else {
            None
        }
    }

    /// i64 immediate: accepts `-2^63 ..= 2^64-1`, producing the matching
    /// bit pattern.
    pub fn to_i64(self) -> Option<i64> {
        if self.negative {
            if self.magnitude <= 1 << 63 {
                Some(self.magnitude.wrapping_neg() as i64)
            } else {
                None
            }
        } else {
            Some(self.magnitude as i64)
        }
    }

    /// Unsigned 32-bit value; `-0` counts as 0.
    pub fn to_u32(self) -> Option<u32> {
        if self.negative && self.magnitude != 0 {
            return None;
        }
        u32::try_from(self.magnitude).ok()
    }
}

/// A floating-point literal.
///
/// Decimal and hex forms keep their digit strings so f32 and f64 can each
/// round independently; NaN forms keep their payloads so canonical and
/// arithmetic NaNs stay distinguishable.
#[derive(Debug, Clone, PartialEq)]
pub enum FloatLit {
    Decimal { negative: bool, digits: String },
    Hex { negative: bool, digits: String },
    Inf { negative: bool },
    Nan { negative: bool, payload: Option<u64> },
    NanCanonical,
    NanArithmetic,
}

// f32: 1 sign, 8 exponent, 23 mantissa bits.
const F32_MANTISSA_BITS: u32 = 23;
const F32_CANONICAL_NAN: u32 = 0x7fc0_0000;
// f64: 1 sign, 11 exponent, 52 mantissa bits.
const F64_MANTISSA_BITS: u32 = 52;
const F64_CANONICAL_NAN: u64 = 0x7ff8_0000_0000_0000;

impl FloatLit {
    /// Converts to f32, rounding at binary32 precision.
    pub fn to_f32(&self) -> Option<f32> {
        match self {
            FloatLit::Decimal { negative, digits } => {
                let value: f32 = digits.parse().ok()?;
                Some(if *negative { -value } else { value })
            }
            FloatLit::Hex { negative, digits } => {
                let bits = parse_hex_float(digits, F32_MANTISSA_BITS, 8)? as u32;
                let value = f32::from_bits(bits);
                Some(if *negative { -value } else { value })
            }
            FloatLit::Inf { negative } => Some(if *negative { f32::NEG_INFINITY } else { f32::INFINITY }),
            FloatLit::Nan { negative, payload } => {
                let payload = match payload {
                    Some(p) => {
                        if *p == 0 || *p > 0x7f_ffff {
                            return None;
                        }
                        *p as u32
                    }
                    None => F32_CANONICAL_NAN & 0x7f_ffff,
                };
                let sign = if *negative { 1u32 << 31 } else { 0 };
                Some(f32::from_bits(sign | 0x7f80_0000 | payload))
            }
            FloatLit::NanCanonical => Some(f32::from_bits(F32_CANONICAL_NAN)),
            // Any NaN with the mantissa top bit set; the canonical payload
            // is the representative.
            FloatLit::NanArithmetic => Some(f32::from_bits(F32_CANONICAL_NAN)),
        }
    }

    /// Converts to f64, rounding at binary64 precision.
    pub fn to_f64(&self) -> Option<f64> {
        match self {
            FloatLit::Decimal { negative, digits } => {
                let value: f64 = digits.parse().ok()?;
                Some(if *negative { -value } else { value })
            }
            FloatLit::Hex { negative, digits } => {
                let bits = parse_hex_float(digits, F64_MANTISSA_BITS, 11)?;
                let value = f64::from_bits(bits);
                Some(if *negative { -value } else { value })
            }
            FloatLit::Inf { negative } => Some(if *negative { f64::NEG_INFINITY } else { f64::INFINITY }),
            FloatLit::Nan { negative, payload } => {
                let payload = match payload {
                    Some(p) => {
                        if *p == 0 || *p > 0xf_ffff_ffff_ffff {
                            return None;
                        }
                        *p
                    }
                    None => F64_CANONICAL_NAN & 0xf_ffff_ffff_ffff,
                };
                let sign = if *negative { 1u64 << 63 } else { 0 };
                Some(f64::from_bits(sign | 0x7ff0_0000_0000_0000 | payload))
            }
            FloatLit::NanCanonical => Some(f64::from_bits(F64_CANONICAL_NAN)),
            FloatLit::NanArithmetic => Some(f64::from_bits(F64_CANONICAL_NAN)),
        }
    }
}

/// Parses a hex float mantissa+exponent string (no `0x` prefix, no sign)
/// into an IEEE-754 bit pattern with the given mantissa/exponent widths,
/// rounding to nearest, ties to even.
///
/// The input has the shape `hhh`, `hhh.hhh`, `hhh.hhhp±d`, or `hhhp±d`
/// with underscores already stripped.
fn parse_hex_float(digits: &str, mantissa_bits: u32, exponent_bits: u32) -> Option<u64> {
    let (mantissa_str, exp_str) = match digits.split_once(|c| c == 'p' || c == 'P') {
        Some((m, e)) => (m, Some(e)),
        None => (digits, None),
    };
    let written_exp: i64 = match exp_str {
        Some(e) => e.parse().ok()?,
        None => 0,
    };

    let (int_str, frac_str) = match mantissa_str.split_once('.') {
        Some((i, f)) => (i, f),
        None => (mantissa_str, ""),
    };
    if int_str.is_empty() && frac_str.is_empty() {
        return None;
    }

    // Accumulate significant hex digits into a 128-bit mantissa, tracking
    // the binary exponent of the least significant accumulated bit and a
    // sticky bit for anything dropped.
    let mut mantissa: u128 = 0;
    let mut exp2: i64 = written_exp;
    let mut sticky = false;

    for c in int_str.chars() {
        let digit = c.to_digit(16)? as u128;
        if mantissa >> 120 == 0 {
            mantissa = (mantissa << 4) | digit;
        } else {
            sticky |= digit != 0;
            exp2 += 4;
        }
    }
    for c in frac_str.chars() {
        let digit = c.to_digit(16)? as u128;
        if mantissa >> 120 == 0 {
            mantissa = (mantissa << 4) | digit;
            exp2 -= 4;
        } else {
            sticky |= digit != 0;
        }
    }

    let exp_bias = (1i64 << (exponent_bits - 1)) - 1;
    let exp_max = (1i64 << exponent_bits) - 1;

    if mantissa == 0 {
        return Some(0);
    }

    // Normalise to the available significand width: mantissa_bits + 1 for
    // normal numbers, fewer once the exponent pins to the subnormal range.
    let top = 127 - mantissa.leading_zeros() as i64; // position of msb
    let want = mantissa_bits as i64 + 1;
    let mut biased = top + exp2 + exp_bias;
    let effective_want = if biased < 1 { want + biased - 1 } else { want };
    if effective_want < 0 {
        // Below half the smallest subnormal.
        return Some(0);
    }

    let shift = top + 1 - effective_want;
    let mut kept: u128;
    if shift > 0 {
        let dropped_mask = (1u128 << shift) - 1;
        let dropped = mantissa & dropped_mask;
        kept = mantissa >> shift;
        let half = 1u128 << (shift - 1);
        sticky |= dropped & (half - 1) != 0;
        if dropped >= half && (sticky || dropped > half || kept & 1 == 1) {
            kept += 1;
        }
    } else {
        kept = mantissa << (-shift);
    }

    let mantissa_mask = (1u64 << mantissa_bits) - 1;
    if biased < 1 {
        // Subnormal. A round-up carry into 2^mantissa_bits is exactly the
        // smallest normal's bit pattern, so the cast covers both.
        return Some(kept as u64);
    }

    // Rounding may have carried into a new significand bit.
    if kept >> want != 0 {
        kept >>= 1;
        biased += 1;
    }
    if biased >= exp_max {
        return Some((exp_max as u64) << mantissa_bits); // infinity
    }
    Some(((biased as u64) << mantissa_bits) | (kept as u64 & mantissa_mask))
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TokenKind::LeftParen => write!(f, "("),
            TokenKind::RightParen => write!(f, ")"),
            TokenKind::Keyword(s) => write!(f, "{s}"),
            TokenKind::Id(s) => write!(f, "${s}"),
            TokenKind::String(bytes) => {
                write!(f, "\"")?;
                for &b in bytes {
                    if b.is_ascii_graphic() || b == b' ' {
                        write!(f, "{}", b as char)?;
                    } else {
                        write!(f, "\\{b:02x}")?;
                    }
                }
                write!(f, "\"")
            }
            TokenKind::UnsignedInteger(lit) => write!(f, "{}", lit.magnitude),
            TokenKind::SignedInteger(lit) => {
                write!(f, "{}{}", if lit.negative { "-" } else { "+" }, lit.magnitude)
            }
            TokenKind::Float(lit) => match lit {
                FloatLit::Decimal { negative, digits } | FloatLit::Hex { negative, digits } => {
                    write!(f, "{}{digits}", if *negative { "-" } else { "" })
                }
                FloatLit::Inf { negative } => write!(f, "{}inf", if *negative { "-" } else { "" }),
                FloatLit::Nan { negative, payload: None } => {
                    write!(f, "{}nan", if *negative { "-" } else { "" })
                }
                FloatLit::Nan {
                    negative,
                    payload: Some(p),
                } => write!(f, "{}nan:0x{p:x}", if *negative { "-" } else { "" }),
                FloatLit::NanCanonical => write!(f, "nan:canonical"),
                FloatLit::NanArithmetic => write!(f, "nan:arithmetic"),
            },
            TokenKind::Reserved(s) => write!(f, "{s}"),
        }
    }
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}", self.kind, self.span)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_to_i32_range() {
        assert_eq!(IntegerLit::new(42, false).to_i32(), Some(42));
        assert_eq!(IntegerLit::new(42, true).to_i32(), Some(-42));
        assert_eq!(IntegerLit::new(0x7fff_ffff, false).to_i32(), Some(i32::MAX));
        assert_eq!(IntegerLit::new(0x8000_0000, true).to_i32(), Some(i32::MIN));
        // The unsigned interpretation reaches 2^32-1.
        assert_eq!(IntegerLit::new(0xffff_ffff, false).to_i32(), Some(-1));
        assert_eq!(IntegerLit::new(0x1_0000_0000, false).to_i32(), None);
        assert_eq!(IntegerLit::new(0x8000_0001, true).to_i32(), None);
    }

    #[test]
    fn integer_to_i64_range() {
        assert_eq!(IntegerLit::new(u64::MAX, false).to_i64(), Some(-1));
        assert_eq!(IntegerLit::new(1 << 63, true).to_i64(), Some(i64::MIN));
        assert_eq!(IntegerLit::new((1 << 63) + 1, true).to_i64(), None);
    }

    #[test]
    fn integer_to_u32() {
        assert_eq!(IntegerLit::new(10, false).to_u32(), Some(10));
        assert_eq!(IntegerLit::new(0, true).to_u32(), Some(0));
        assert_eq!(IntegerLit::new(10, true).to_u32(), None);
        assert_eq!(IntegerLit::new(1 << 33, false).to_u32(), None);
    }

    #[test]
    fn decimal_floats_round_independently() {
        let lit = FloatLit::Decimal {
            negative: false,
            digits: "0.1".to_string(),
        };
        assert_eq!(lit.to_f64(), Some(0.1f64));
        assert_eq!(lit.to_f32(), Some(0.1f32));
        assert_ne!(lit.to_f32().unwrap() as f64, lit.to_f64().unwrap());
    }

    #[test]
    fn hex_floats() {
        let hex = |digits: &str| FloatLit::Hex {
            negative: false,
            digits: digits.to_string(),
        };
        assert_eq!(hex("1.8p1").to_f64(), Some(3.0));
        assert_eq!(hex("1.8p1").to_f32(), Some(3.0));
        assert_eq!(hex("1p0").to_f64(), Some(1.0));
        assert_eq!(hex("8p-3").to_f64(), Some(1.0));
        assert_eq!(hex("ff").to_f64(), Some(255.0));
        assert_eq!(hex(".8").to_f64(), Some(0.5));
        assert_eq!(hex("1.fffffep+127").to_f32(), Some(f32::MAX));
        assert_eq!(hex("1.fffffffffffffp+1023").to_f64(), Some(f64::MAX));
        // Smallest subnormals.
        assert_eq!(hex("1p-149").to_f32(), Some(f32::from_bits(1)));
        assert_eq!(hex("1p-1074").to_f64(), Some(f64::from_bits(1)));
        // Past the representable range.
        assert_eq!(hex("1p128").to_f32(), Some(f32::INFINITY));
        assert_eq!(hex("1p-150").to_f32(), Some(0.0));
    }

    #[test]
    fn hex_float_rounding_ties_to_even() {
        // 1.000000fp0 at f32: the dropped bits are below half; rounds down.
        let low = FloatLit::Hex {
            negative: false,
            digits: "1.000000fp0".to_string(),
        };
        assert_eq!(low.to_f32(), Some(1.0));
        // Exactly half with even candidate below: stays even.
        let tie = FloatLit::Hex {
            negative: false,
            digits: "1.000001p0".to_string(),
        };
        assert_eq!(tie.to_f32(), Some(1.0));
        // Just above half: rounds up.
        let up = FloatLit::Hex {
            negative: false,
            digits: "1.0000012p0".to_string(),
        };
        assert_eq!(up.to_f32(), Some(f32::from_bits(0x3f80_0001)));
    }

    #[test]
    fn nan_payloads() {
        let nan = FloatLit::Nan {
            negative: false,
            payload: Some(0x1234),
        };
        assert_eq!(nan.to_f32().unwrap().to_bits(), 0x7f80_1234);
        assert_eq!(nan.to_f64().unwrap().to_bits(), 0x7ff0_0000_0000_1234);

        let neg = FloatLit::Nan {
            negative: true,
            payload: None,
        };
        assert_eq!(neg.to_f32().unwrap().to_bits(), 0xffc0_0000);

        assert_eq!(FloatLit::NanCanonical.to_f32().unwrap().to_bits(), 0x7fc0_0000);
        assert_eq!(
            FloatLit::NanCanonical.to_f64().unwrap().to_bits(),
            0x7ff8_0000_0000_0000
        );

        // Payload out of range for the width.
        let wide = FloatLit::Nan {
            negative: false,
            payload: Some(0x80_0000),
        };
        assert_eq!(wide.to_f32(), None);
        assert!(wide.to_f64().is_some());
    }
}
