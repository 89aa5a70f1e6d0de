//! The built-in `spectest` host module the specification test suite
//! imports from: no-op-ish print functions that side-effect a writer,
//! three immutable globals, a memory with limits (1, 2), and a funcref
//! table with limits (10, 20).

use super::imports::{HostFunction, Importer};
use super::memory::Memory;
use super::table::Table;
use super::{
    GlobalInstance, RuntimeError, SharedGlobal, SharedMemory, SharedTable, Value,
};
use crate::parser::module::{FunctionType, GlobalType, Limits, TableType, ValueType};
use std::cell::RefCell;
use std::fmt::Write as _;
use std::rc::Rc;

/// Importer for the `spectest` namespace.
///
/// Printed output accumulates in an internal buffer, readable via
/// [`SpectestImporter::output`].
pub struct SpectestImporter {
    writer: Rc<RefCell<String>>,
    memory: SharedMemory,
    table: SharedTable,
    global_i32: SharedGlobal,
    global_f32: SharedGlobal,
    global_f64: SharedGlobal,
}

impl SpectestImporter {
    pub fn new() -> SpectestImporter {
        SpectestImporter {
            writer: Rc::new(RefCell::new(String::new())),
            memory: Rc::new(RefCell::new(
                Memory::new(1, Some(2), 0).expect("spectest memory limits are static"),
            )),
            table: Rc::new(RefCell::new(
                Table::new(Limits::new(10, Some(20))).expect("spectest table limits are static"),
            )),
            global_i32: GlobalInstance::new(Value::I32(666), false),
            global_f32: GlobalInstance::new(Value::F32(666.6), false),
            global_f64: GlobalInstance::new(Value::F64(666.6), false),
        }
    }

    /// Everything the print functions have written so far.
    pub fn output(&self) -> String {
        self.writer.borrow().clone()
    }

    fn print_function(&self, parameters: Vec<ValueType>) -> HostFunction {
        let writer = Rc::clone(&self.writer);
        HostFunction::new(
            FunctionType {
                parameters,
                return_types: vec![],
            },
            move |args| {
                let mut out = writer.borrow_mut();
                for (i, value) in args.iter().enumerate() {
                    if i > 0 {
                        out.push(' ');
                    }
                    let _ = write!(out, "{value}");
                }
                out.push('\n');
                Ok(vec![])
            },
        )
    }
}

impl Default for SpectestImporter {
    fn default() -> Self {
        Self::new()
    }
}

impl Importer for SpectestImporter {
    fn import_function(
        &self,
        module: &str,
        name: &str,
        _expected: &FunctionType,
    ) -> Result<HostFunction, RuntimeError> {
        use ValueType::*;
        if module != "spectest" {
            return Err(unknown(module, name));
        }
        let function = match name {
            "print" => self.print_function(vec![]),
            "print_i32" => self.print_function(vec![I32]),
            "print_i64" => self.print_function(vec![I64]),
            "print_f32" => self.print_function(vec![F32]),
            "print_f64" => self.print_function(vec![F64]),
            "print_i32_f32" => self.print_function(vec![I32, F32]),
            "print_f64_f64" => self.print_function(vec![F64, F64]),
            _ => return Err(unknown(module, name)),
        };
        Ok(function)
    }

    fn import_global(&self, module: &str, name: &str, _expected: &GlobalType) -> Result<SharedGlobal, RuntimeError> {
        if module != "spectest" {
            return Err(unknown(module, name));
        }
        match name {
            "global_i32" => Ok(Rc::clone(&self.global_i32)),
            "global_f32" => Ok(Rc::clone(&self.global_f32)),
            "global_f64" => Ok(Rc::clone(&self.global_f64)),
            _ => Err(unknown(module, name)),
        }
    }

    fn import_memory(&self, module: &str, name: &str, _expected: &Limits) -> Result<SharedMemory, RuntimeError> {
        if module == "spectest" && name == "memory" {
            Ok(Rc::clone(&self.memory))
        } else {
            Err(unknown(module, name))
        }
    }

    fn import_table(&self, module: &str, name: &str, _expected: &TableType) -> Result<SharedTable, RuntimeError> {
        if module == "spectest" && name == "table" {
            Ok(Rc::clone(&self.table))
        } else {
            Err(unknown(module, name))
        }
    }
}

fn unknown(module: &str, name: &str) -> RuntimeError {
    RuntimeError::Import {
        module: module.to_string(),
        name: name.to_string(),
        reason: "not part of the spectest namespace".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::module::ElemType;

    #[test]
    fn globals() {
        let spectest = SpectestImporter::new();
        let g = spectest
            .import_global(
                "spectest",
                "global_i32",
                &GlobalType {
                    value_type: ValueType::I32,
                    mutable: false,
                },
            )
            .unwrap();
        assert_eq!(g.borrow().value, Value::I32(666));
        assert!(!g.borrow().mutable);

        let g = spectest
            .import_global(
                "spectest",
                "global_f64",
                &GlobalType {
                    value_type: ValueType::F64,
                    mutable: false,
                },
            )
            .unwrap();
        assert_eq!(g.borrow().value, Value::F64(666.6));
    }

    #[test]
    fn memory_and_table_limits() {
        let spectest = SpectestImporter::new();
        let memory = spectest
            .import_memory("spectest", "memory", &Limits::new(1, Some(2)))
            .unwrap();
        assert_eq!(memory.borrow().size(), 1);
        assert_eq!(memory.borrow().max_pages(), Some(2));

        let table = spectest
            .import_table(
                "spectest",
                "table",
                &TableType {
                    elem_type: ElemType::FuncRef,
                    limits: Limits::new(10, Some(20)),
                },
            )
            .unwrap();
        assert_eq!(table.borrow().size(), 10);
        assert_eq!(table.borrow().max(), Some(20));
    }

    #[test]
    fn print_writes_to_the_sink() {
        let spectest = SpectestImporter::new();
        let expected = FunctionType {
            parameters: vec![ValueType::I32],
            return_types: vec![],
        };
        let print_i32 = spectest.import_function("spectest", "print_i32", &expected).unwrap();
        assert_eq!(print_i32.func_type, expected);

        (print_i32.call)(&[Value::I32(42)]).unwrap();
        assert_eq!(spectest.output(), "i32:42\n");
    }

    #[test]
    fn unknown_names_refused() {
        let spectest = SpectestImporter::new();
        assert!(spectest
            .import_function(
                "spectest",
                "print_v128",
                &FunctionType {
                    parameters: vec![],
                    return_types: vec![]
                }
            )
            .is_err());
        assert!(spectest
            .import_memory("other", "memory", &Limits::new(1, None))
            .is_err());
    }
}
