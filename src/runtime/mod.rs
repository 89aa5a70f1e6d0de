//! WebAssembly interpreter: instantiation, the stack machine, and the
//! runtime error/trap model.
//!
//! Execution is single-threaded and cooperative. Instance state (memories,
//! tables, globals) lives behind `Rc<RefCell<…>>` handles so imports can
//! share storage and host functions may re-enter the instance on the same
//! thread.

pub mod control;
pub mod executor;
pub mod imports;
pub mod instance;
pub mod memory;
pub mod ops;
pub mod policy;
pub mod spectest;
pub mod stack;
pub mod structure;
pub mod table;
pub mod value;

pub use executor::{DefaultInterpreter, OpInterpreter};
pub use imports::{EmptyImporter, HostFunction, Importer, NamespacedImporter};
pub use instance::ModuleInstance;
pub use memory::Memory;
pub use policy::ExecutionPolicy;
pub use spectest::SpectestImporter;
pub use table::Table;
pub use value::Value;

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use thiserror::Error;

/// Shared handle to a linear memory.
pub type SharedMemory = Rc<RefCell<Memory>>;
/// Shared handle to a table.
pub type SharedTable = Rc<RefCell<Table>>;
/// Shared handle to a global.
pub type SharedGlobal = Rc<RefCell<GlobalInstance>>;

/// A global's runtime storage.
#[derive(Debug, Clone, PartialEq)]
pub struct GlobalInstance {
    pub value: Value,
    pub mutable: bool,
}

impl GlobalInstance {
    pub fn new(value: Value, mutable: bool) -> SharedGlobal {
        Rc::new(RefCell::new(GlobalInstance { value, mutable }))
    }
}

/// The closed set of specification trap conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapKind {
    OutOfBoundsMemoryAccess,
    IntegerDivideByZero,
    IntegerOverflow,
    InvalidConversionToInteger,
    UndefinedElement,
    UninitializedElement,
    IndirectCallTypeMismatch,
    Unreachable,
    CallStackExhausted,
}

impl TrapKind {
    /// The specification's message for this trap.
    pub fn message(self) -> &'static str {
        match self {
            TrapKind::OutOfBoundsMemoryAccess => "out of bounds memory access",
            TrapKind::IntegerDivideByZero => "integer divide by zero",
            TrapKind::IntegerOverflow => "integer overflow",
            TrapKind::InvalidConversionToInteger => "invalid conversion to integer",
            TrapKind::UndefinedElement => "undefined element",
            TrapKind::UninitializedElement => "uninitialized element",
            TrapKind::IndirectCallTypeMismatch => "indirect call type mismatch",
            TrapKind::Unreachable => "unreachable",
            TrapKind::CallStackExhausted => "call stack exhausted",
        }
    }
}

/// A runtime fault mandated by the specification.
///
/// Carries the spec message plus an implementation detail string. A trap
/// aborts the current invocation; memory writes that happened before it
/// persist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Trap {
    pub kind: TrapKind,
    pub detail: String,
}

impl std::error::Error for Trap {}

impl Trap {
    pub fn new(kind: TrapKind, detail: impl Into<String>) -> Trap {
        Trap {
            kind,
            detail: detail.into(),
        }
    }

    /// The spec-mandated message.
    pub fn message(&self) -> &'static str {
        self.kind.message()
    }
}

impl fmt::Display for Trap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.detail.is_empty() {
            write!(f, "{}", self.kind.message())
        } else {
            write!(f, "{} ({})", self.kind.message(), self.detail)
        }
    }
}

/// Any failure at the execution API boundary.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error(transparent)]
    Trap(#[from] Trap),

    #[error("stack underflow")]
    StackUnderflow,

    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },

    #[error("unknown export: {0}")]
    UnknownExport(String),

    #[error("export \"{0}\" is not a function")]
    NotAFunction(String),

    #[error("function index out of bounds: {0}")]
    FunctionIndexOutOfBounds(u32),

    #[error("local index out of bounds: {0}")]
    LocalIndexOutOfBounds(u32),

    #[error("global index out of bounds: {0}")]
    GlobalIndexOutOfBounds(u32),

    #[error("global {0} is immutable")]
    ImmutableGlobal(u32),

    #[error("argument count mismatch: expected {expected}, got {actual}")]
    ArgumentCount { expected: usize, actual: usize },

    #[error("instance has no memory")]
    NoMemory,

    #[error("instance has no table")]
    NoTable,

    #[error("memory error: {0}")]
    Memory(String),

    #[error("unresolved import {module}.{name}: {reason}")]
    Import {
        module: String,
        name: String,
        reason: String,
    },

    #[error("import {module}.{name} has incompatible type: {reason}")]
    ImportType {
        module: String,
        name: String,
        reason: String,
    },

    #[error("invalid initializer expression: {0}")]
    InvalidInitExpr(String),

    #[error("malformed function body: {0}")]
    MalformedBody(String),
}

impl RuntimeError {
    /// The trap kind, when this error is a trap.
    pub fn trap_kind(&self) -> Option<TrapKind> {
        match self {
            RuntimeError::Trap(trap) => Some(trap.kind),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trap_messages_are_the_spec_set() {
        let kinds = [
            (TrapKind::OutOfBoundsMemoryAccess, "out of bounds memory access"),
            (TrapKind::IntegerDivideByZero, "integer divide by zero"),
            (TrapKind::IntegerOverflow, "integer overflow"),
            (TrapKind::InvalidConversionToInteger, "invalid conversion to integer"),
            (TrapKind::UndefinedElement, "undefined element"),
            (TrapKind::UninitializedElement, "uninitialized element"),
            (TrapKind::IndirectCallTypeMismatch, "indirect call type mismatch"),
            (TrapKind::Unreachable, "unreachable"),
            (TrapKind::CallStackExhausted, "call stack exhausted"),
        ];
        for (kind, message) in kinds {
            assert_eq!(kind.message(), message);
        }
    }

    #[test]
    fn trap_display_includes_detail() {
        let trap = Trap::new(TrapKind::Unreachable, "");
        assert_eq!(trap.to_string(), "unreachable");
        let trap = Trap::new(TrapKind::IntegerDivideByZero, "i32.div_s");
        assert_eq!(trap.to_string(), "integer divide by zero (i32.div_s)");
    }

    #[test]
    fn runtime_error_exposes_trap_kind() {
        let err = RuntimeError::from(Trap::new(TrapKind::Unreachable, ""));
        assert_eq!(err.trap_kind(), Some(TrapKind::Unreachable));
        assert_eq!(RuntimeError::StackUnderflow.trap_kind(), None);
    }
}
