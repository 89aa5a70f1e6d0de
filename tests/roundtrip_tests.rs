//! Round-trip laws across the codec and the assembler:
//! `encode(parse(b)) == b` for canonical binaries, and
//! `parse(encode(assemble(t)))` structurally equal to `assemble(t)`.

use wasmite::encoder;
use wasmite::parser;
use wasmite::parser::module::Module;
use wasmite::wat;

const PREAMBLE: &[u8] = b"\0asm\x01\x00\x00\x00";

fn assemble(source: &str) -> Module {
    wat::parse(source).expect("module should assemble")
}

fn assert_structurally_equal(a: &Module, b: &Module) {
    assert_eq!(a.types.types, b.types.types);
    assert_eq!(a.imports.imports, b.imports.imports);
    assert_eq!(a.functions.functions, b.functions.functions);
    assert_eq!(a.tables.tables, b.tables.tables);
    assert_eq!(a.memories.memories, b.memories.memories);
    assert_eq!(a.globals.globals, b.globals.globals);
    assert_eq!(a.exports.exports, b.exports.exports);
    assert_eq!(a.start.start, b.start.start);
    assert_eq!(a.elements.elements, b.elements.elements);
    assert_eq!(a.code.code, b.code.code);
    assert_eq!(a.data.data, b.data.data);
    assert_eq!(a.names, b.names);
}

/// Assembles `source`, encodes it, reparses, and checks both laws.
fn roundtrip(source: &str) -> Module {
    let assembled = assemble(source);
    let bytes = encoder::encode(&assembled);
    let reparsed = parser::parse(bytes.clone()).expect("encoded module should parse");
    assert_structurally_equal(&assembled, &reparsed);
    assert_eq!(encoder::encode(&reparsed), bytes, "binary round trip must be byte-identical");
    reparsed
}

#[test]
fn empty_module_binary_is_the_preamble() {
    let module = assemble("(module)");
    assert_eq!(encoder::encode(&module), PREAMBLE);
    roundtrip("(module)");
}

#[test]
fn named_module_roundtrip() {
    let module = roundtrip("(module $m)");
    assert_eq!(module.names.module_name.as_deref(), Some("m"));
}

#[test]
fn add_function_roundtrip() {
    roundtrip(
        r#"(module (func (export "add") (param i32 i32) (result i32)
            local.get 0
            local.get 1
            i32.add))"#,
    );
}

#[test]
fn memory_data_roundtrip() {
    let module = roundtrip(r#"(module (memory (data "hello world")))"#);
    assert_eq!(module.data.data[0].init, b"hello world");
}

#[test]
fn control_flow_roundtrip() {
    roundtrip(
        r#"(module (func (export "count") (param i32) (result i32)
            (local $n i32)
            (block $done
                (loop $again
                    (br_if $done (i32.eqz (local.get 0)))
                    (local.set 0 (i32.sub (local.get 0) (i32.const 1)))
                    (local.set $n (i32.add (local.get $n) (i32.const 1)))
                    (br $again)))
            (local.get $n)))"#,
    );
}

#[test]
fn full_feature_roundtrip() {
    roundtrip(
        r#"(module $kitchen
            (import "env" "callback" (func $callback (param i32) (result i32)))
            (import "env" "base" (global $base i32))
            (type $sig (func (param i32) (result i32)))
            (table 4 8 funcref)
            (memory 1 4)
            (global $counter (mut i32) (global.get $base))
            (func $dispatch (param $x i32) (result i32)
                (call_indirect (type $sig) (local.get $x) (i32.const 0)))
            (func $double (type $sig) (i32.mul (local.get 0) (i32.const 2)))
            (elem (i32.const 0) $double $callback)
            (data (i32.const 16) "\01\02\03")
            (export "dispatch" (func $dispatch))
            (export "mem" (memory 0))
            (start $noop)
            (func $noop))"#,
    );
}

#[test]
fn float_constants_roundtrip_bit_exact() {
    // NaN constants defeat PartialEq, so this law is checked at the byte
    // and bit level rather than through assert_structurally_equal.
    let assembled = assemble(
        r#"(module (func (result f64)
            f32.const nan:0x200000
            drop
            f32.const -0
            drop
            f64.const 0x1.fffffffffffffp+1023))"#,
    );
    let bytes = encoder::encode(&assembled);
    let module = parser::parse(bytes.clone()).expect("encoded module should parse");
    assert_eq!(encoder::encode(&module), bytes);

    use wasmite::parser::instruction::Instruction;
    let body = &module.code.code[0].instructions;
    let Instruction::F32Const { value } = body[0] else {
        panic!("expected f32.const");
    };
    assert_eq!(value.to_bits(), 0x7fa0_0000);
    let Instruction::F32Const { value } = body[2] else {
        panic!("expected f32.const");
    };
    assert_eq!(value.to_bits(), 0x8000_0000);
    let Instruction::F64Const { value } = body[4] else {
        panic!("expected f64.const");
    };
    assert_eq!(value, f64::MAX);
}

#[test]
fn i64_extremes_roundtrip() {
    roundtrip(
        r#"(module (func
            i64.const -9223372036854775808
            drop
            i64.const 9223372036854775807
            drop
            i32.const -2147483648
            drop))"#,
    );
}

#[test]
fn custom_sections_preserved() {
    // Build a binary with a custom section by hand, then round-trip it.
    let mut bytes = PREAMBLE.to_vec();
    bytes.extend_from_slice(&[0x00, 0x07, 0x03, b'a', b'b', b'c', 0x01, 0x02, 0x03]);
    let module = parser::parse(bytes.clone()).expect("parse");
    assert_eq!(module.custom.len(), 1);
    assert_eq!(module.custom[0].name, "abc");
    assert_eq!(encoder::encode(&module), bytes);
}

#[test]
fn function_names_roundtrip_through_name_section() {
    let module = roundtrip(
        r#"(module $named
            (func $first (param $x i32))
            (func $second))"#,
    );
    assert_eq!(module.names.module_name.as_deref(), Some("named"));
    assert_eq!(module.names.function_names.get(&0).map(String::as_str), Some("first"));
    assert_eq!(module.names.function_names.get(&1).map(String::as_str), Some("second"));
    let locals = module.names.local_names.get(&0).unwrap();
    assert_eq!(locals.get(&0).map(String::as_str), Some("x"));
}
