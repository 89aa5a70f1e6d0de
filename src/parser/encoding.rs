//! Binary encoding primitives for WebAssembly values.
//!
//! Provides LEB128 integer encoding, IEEE 754 float encoding, and the wire
//! constants of the binary format. All functions write directly into a
//! caller-provided `&mut Vec<u8>` buffer, avoiding intermediate allocations.
//!
//! Encoding always produces the canonical (shortest) form; the matching
//! decoders in [`crate::parser::reader`] reject anything longer.

use byteorder::{LittleEndian, WriteBytesExt};
use std::io;

// ---------------------------------------------------------------------------
// WebAssembly binary format constants (spec section 5)
// ---------------------------------------------------------------------------

/// Module preamble: magic `\0asm` followed by version 1, little-endian.
pub const MAGIC: u32 = 0x6d73_6100;
pub const VERSION: u32 = 1;

// Section IDs (§5.5.2)
pub const SECTION_CUSTOM: u8 = 0;
pub const SECTION_TYPE: u8 = 1;
pub const SECTION_IMPORT: u8 = 2;
pub const SECTION_FUNCTION: u8 = 3;
pub const SECTION_TABLE: u8 = 4;
pub const SECTION_MEMORY: u8 = 5;
pub const SECTION_GLOBAL: u8 = 6;
pub const SECTION_EXPORT: u8 = 7;
pub const SECTION_START: u8 = 8;
pub const SECTION_ELEMENT: u8 = 9;
pub const SECTION_CODE: u8 = 10;
pub const SECTION_DATA: u8 = 11;

/// Highest known (non-custom) section id. Anything above is malformed.
pub const SECTION_MAX: u8 = SECTION_DATA;

// Type constructors (§5.3.6)
pub const TYPE_FUNC: u8 = 0x60;

// Value type bytes (§5.3.4)
pub const VT_I32: u8 = 0x7f;
pub const VT_I64: u8 = 0x7e;
pub const VT_F32: u8 = 0x7d;
pub const VT_F64: u8 = 0x7c;

// Table element type (§5.3.5); funcref is the only MVP element kind
pub const ELEM_TYPE_FUNCREF: u8 = 0x70;

// Import/export descriptor kinds (§5.5.5, §5.5.10)
pub const DESC_FUNC: u8 = 0x00;
pub const DESC_TABLE: u8 = 0x01;
pub const DESC_MEMORY: u8 = 0x02;
pub const DESC_GLOBAL: u8 = 0x03;

// Limits flag (§5.3.7)
pub const LIMITS_MIN_ONLY: u8 = 0x00;
pub const LIMITS_MIN_MAX: u8 = 0x01;

// Expression terminator (§5.4.9)
pub const OP_END: u8 = 0x0B;

// Block type: empty (§5.4.1)
pub const BLOCK_TYPE_EMPTY: u8 = 0x40;

// Extended opcode prefix, reserved in the MVP (§5.4.7)
pub const OP_PREFIX_FC: u8 = 0xFC;

// Name custom-section subsection ids ("name" section)
pub const NAME_SUBSECTION_MODULE: u8 = 0;
pub const NAME_SUBSECTION_FUNCTION: u8 = 1;
pub const NAME_SUBSECTION_LOCAL: u8 = 2;

// ---------------------------------------------------------------------------
// Unsigned LEB128
// ---------------------------------------------------------------------------

/// Appends the unsigned LEB128 encoding of a u64 value to `buf`.
fn write_vu(buf: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.push(byte);
            break;
        }
        byte |= 0x80;
        buf.push(byte);
    }
}

/// Appends the unsigned LEB128 encoding of a u32 value to `buf`.
pub fn write_vu32(buf: &mut Vec<u8>, v: u32) {
    write_vu(buf, v as u64);
}

/// Appends the unsigned LEB128 encoding of a u64 value to `buf`.
pub fn write_vu64(buf: &mut Vec<u8>, v: u64) {
    write_vu(buf, v);
}

/// Appends a single-bit boolean as a one-byte LEB128 value (0x00 or 0x01).
pub fn write_vu1(buf: &mut Vec<u8>, v: bool) {
    buf.push(if v { 1 } else { 0 });
}

// ---------------------------------------------------------------------------
// Signed LEB128
// ---------------------------------------------------------------------------

/// Appends the signed LEB128 encoding of an i64 value to `buf`.
fn write_vs(buf: &mut Vec<u8>, mut value: i64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if (value == 0 && (byte & 0x40) == 0) || (value == -1 && (byte & 0x40) != 0) {
            buf.push(byte);
            break;
        }
        byte |= 0x80;
        buf.push(byte);
    }
}

/// Appends the signed LEB128 encoding of an i32 value to `buf`.
pub fn write_vs32(buf: &mut Vec<u8>, v: i32) {
    write_vs(buf, v as i64);
}

/// Appends the signed LEB128 encoding of an i64 value to `buf`.
pub fn write_vs64(buf: &mut Vec<u8>, v: i64) {
    write_vs(buf, v);
}

// ---------------------------------------------------------------------------
// IEEE 754 floats (little-endian)
// ---------------------------------------------------------------------------

/// Appends the little-endian IEEE 754 encoding of an f32 value to `buf`.
///
/// NaN bit patterns pass through untouched.
pub fn write_f32(buf: &mut Vec<u8>, v: f32) {
    let mut bytes = [0u8; 4];
    let mut wtr = io::Cursor::new(&mut bytes[..]);
    wtr.write_f32::<LittleEndian>(v).unwrap();
    buf.extend_from_slice(&bytes);
}

/// Appends the little-endian IEEE 754 encoding of an f64 value to `buf`.
pub fn write_f64(buf: &mut Vec<u8>, v: f64) {
    let mut bytes = [0u8; 8];
    let mut wtr = io::Cursor::new(&mut bytes[..]);
    wtr.write_f64::<LittleEndian>(v).unwrap();
    buf.extend_from_slice(&bytes);
}

// ---------------------------------------------------------------------------
// Names and byte vectors
// ---------------------------------------------------------------------------

/// Appends a UTF-8 name as a length-prefixed byte vector.
pub fn write_name(buf: &mut Vec<u8>, name: &str) {
    let bytes = name.as_bytes();
    write_vu32(buf, bytes.len() as u32);
    buf.extend_from_slice(bytes);
}

/// Appends a length-prefixed byte vector.
pub fn write_bytes(buf: &mut Vec<u8>, bytes: &[u8]) {
    write_vu32(buf, bytes.len() as u32);
    buf.extend_from_slice(bytes);
}
