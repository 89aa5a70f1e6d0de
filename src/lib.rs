//! A WebAssembly MVP toolchain core: binary codec, text assembler, and
//! interpreter.
//!
//! wasmite provides one pipeline over a single module representation:
//! binary parsing, text format (WAT) assembly, validation, binary
//! encoding, and execution via a stack-machine interpreter.
//!
//! # Modules
//!
//! - [`parser`] -- Binary format decoder. Reads `.wasm` bytes into a
//!   [`parser::module::Module`].
//! - [`wat`] -- Text format assembler. Lowers WAT source into the same
//!   `Module` representation.
//! - [`encoder`] -- Binary encoder. Serialises a `Module` back to `.wasm`
//!   bytes, byte-identical for canonical inputs.
//! - [`runtime`] -- Interpreter: instantiation against an importer,
//!   memories, tables, globals, and spec-conformant trapping.
//!
//! # Example
//!
//! Assemble a WAT module, instantiate it, and call an exported function:
//!
//! ```
//! use wasmite::runtime::{EmptyImporter, ExecutionPolicy, ModuleInstance, Value};
//! use wasmite::wat;
//!
//! let module = wat::parse(r#"
//!     (module
//!         (func (export "add") (param i32 i32) (result i32)
//!             local.get 0
//!             local.get 1
//!             i32.add))
//! "#).unwrap();
//!
//! let instance = ModuleInstance::instantiate(
//!     &module,
//!     &EmptyImporter,
//!     ExecutionPolicy::default(),
//! ).unwrap();
//! let results = instance.invoke("add", vec![Value::I32(2), Value::I32(3)]).unwrap();
//! assert_eq!(results, vec![Value::I32(5)]);
//! ```
//!
//! # Scope
//!
//! The MVP baseline plus the mutable-globals convention: value types
//! `i32 i64 f32 f64`, `funcref` tables, single memory, active segments.
//! The reserved `0xFC` opcode prefix is recognised and rejected.

pub mod encoder;
pub mod parser;
pub mod runtime;
pub mod wat;
