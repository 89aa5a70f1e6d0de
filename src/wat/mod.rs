//! WebAssembly text format (WAT) support.
//!
//! The front-end is layered: [`lexer`] turns source into tokens, [`sexpr`]
//! groups tokens into parenthesised trees, and [`parser`] lowers a
//! `(module …)` tree into the same [`crate::parser::module::Module`]
//! representation the binary reader produces.
//!
//! # Example
//!
//! ```
//! use wasmite::wat;
//!
//! let module = wat::parse(r#"
//!     (module
//!         (func (export "add") (param i32 i32) (result i32)
//!             local.get 0
//!             local.get 1
//!             i32.add))
//! "#).unwrap();
//! assert_eq!(module.functions.len(), 1);
//! ```

mod cursor;
pub mod error;
pub mod lexer;
pub mod parser;
pub mod sexpr;
pub mod token;

pub use error::{Diagnostic, Diagnostics, LexError, ParseError, Severity};
pub use lexer::Lexer;
pub use parser::{parse, parse_with_diagnostics};
pub use token::{FloatLit, IntegerLit, Span, Token, TokenKind};
