//! The importer contract: how instantiation resolves a module's imports.
//!
//! An [`Importer`] supplies external values on demand, one operation per
//! external kind. [`NamespacedImporter`] composes several importers by
//! module-name prefix; [`EmptyImporter`] satisfies modules with no imports.

use super::{RuntimeError, SharedGlobal, SharedMemory, SharedTable, Value};
use crate::parser::module::{FunctionType, GlobalType, Limits, TableType};
use std::collections::HashMap;
use std::rc::Rc;

/// A host callable: boxed values in, boxed values (or a trap) out.
pub type HostFunc = Rc<dyn Fn(&[Value]) -> Result<Vec<Value>, RuntimeError>>;

/// A host function together with its declared signature.
#[derive(Clone)]
pub struct HostFunction {
    pub func_type: FunctionType,
    pub call: HostFunc,
}

impl HostFunction {
    pub fn new(
        func_type: FunctionType,
        call: impl Fn(&[Value]) -> Result<Vec<Value>, RuntimeError> + 'static,
    ) -> HostFunction {
        HostFunction {
            func_type,
            call: Rc::new(call),
        }
    }
}

impl std::fmt::Debug for HostFunction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HostFunction")
            .field("func_type", &self.func_type)
            .finish_non_exhaustive()
    }
}

/// Supplies external values during instantiation.
///
/// Each operation receives the expected type from the importing module's
/// declaration; instantiation additionally verifies compatibility on the
/// returned value, so importers may ignore the expectation.
pub trait Importer {
    fn import_function(
        &self,
        module: &str,
        name: &str,
        expected: &FunctionType,
    ) -> Result<HostFunction, RuntimeError>;

    fn import_global(&self, module: &str, name: &str, expected: &GlobalType) -> Result<SharedGlobal, RuntimeError>;

    fn import_memory(&self, module: &str, name: &str, expected: &Limits) -> Result<SharedMemory, RuntimeError>;

    fn import_table(&self, module: &str, name: &str, expected: &TableType) -> Result<SharedTable, RuntimeError>;
}

fn unresolved(module: &str, name: &str, kind: &str) -> RuntimeError {
    RuntimeError::Import {
        module: module.to_string(),
        name: name.to_string(),
        reason: format!("no {kind} to import"),
    }
}

/// An importer that supplies nothing.
#[derive(Debug, Default)]
pub struct EmptyImporter;

impl Importer for EmptyImporter {
    fn import_function(&self, module: &str, name: &str, _: &FunctionType) -> Result<HostFunction, RuntimeError> {
        Err(unresolved(module, name, "function"))
    }

    fn import_global(&self, module: &str, name: &str, _: &GlobalType) -> Result<SharedGlobal, RuntimeError> {
        Err(unresolved(module, name, "global"))
    }

    fn import_memory(&self, module: &str, name: &str, _: &Limits) -> Result<SharedMemory, RuntimeError> {
        Err(unresolved(module, name, "memory"))
    }

    fn import_table(&self, module: &str, name: &str, _: &TableType) -> Result<SharedTable, RuntimeError> {
        Err(unresolved(module, name, "table"))
    }
}

/// Routes import requests to member importers by module name.
#[derive(Default)]
pub struct NamespacedImporter {
    namespaces: HashMap<String, Box<dyn Importer>>,
}

impl NamespacedImporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `importer` to answer requests for `module_name`.
    pub fn register(&mut self, module_name: impl Into<String>, importer: Box<dyn Importer>) {
        self.namespaces.insert(module_name.into(), importer);
    }

    fn route(&self, module: &str, name: &str, kind: &str) -> Result<&dyn Importer, RuntimeError> {
        self.namespaces
            .get(module)
            .map(|b| b.as_ref())
            .ok_or_else(|| unresolved(module, name, kind))
    }
}

impl Importer for NamespacedImporter {
    fn import_function(
        &self,
        module: &str,
        name: &str,
        expected: &FunctionType,
    ) -> Result<HostFunction, RuntimeError> {
        self.route(module, name, "function")?
            .import_function(module, name, expected)
    }

    fn import_global(&self, module: &str, name: &str, expected: &GlobalType) -> Result<SharedGlobal, RuntimeError> {
        self.route(module, name, "global")?.import_global(module, name, expected)
    }

    fn import_memory(&self, module: &str, name: &str, expected: &Limits) -> Result<SharedMemory, RuntimeError> {
        self.route(module, name, "memory")?.import_memory(module, name, expected)
    }

    fn import_table(&self, module: &str, name: &str, expected: &TableType) -> Result<SharedTable, RuntimeError> {
        self.route(module, name, "table")?.import_table(module, name, expected)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::GlobalInstance;

    struct OneGlobal;

    impl Importer for OneGlobal {
        fn import_function(&self, m: &str, n: &str, _: &FunctionType) -> Result<HostFunction, RuntimeError> {
            Err(unresolved(m, n, "function"))
        }

        fn import_global(&self, _: &str, name: &str, _: &GlobalType) -> Result<SharedGlobal, RuntimeError> {
            if name == "answer" {
                Ok(GlobalInstance::new(Value::I32(42), false))
            } else {
                Err(unresolved("env", name, "global"))
            }
        }

        fn import_memory(&self, m: &str, n: &str, _: &Limits) -> Result<SharedMemory, RuntimeError> {
            Err(unresolved(m, n, "memory"))
        }

        fn import_table(&self, m: &str, n: &str, _: &TableType) -> Result<SharedTable, RuntimeError> {
            Err(unresolved(m, n, "table"))
        }
    }

    fn i32_global() -> GlobalType {
        GlobalType {
            value_type: crate::parser::module::ValueType::I32,
            mutable: false,
        }
    }

    #[test]
    fn empty_importer_refuses() {
        let importer = EmptyImporter;
        assert!(matches!(
            importer.import_global("env", "x", &i32_global()),
            Err(RuntimeError::Import { .. })
        ));
    }

    #[test]
    fn namespaced_routing() {
        let mut importer = NamespacedImporter::new();
        importer.register("env", Box::new(OneGlobal));

        let global = importer.import_global("env", "answer", &i32_global()).unwrap();
        assert_eq!(global.borrow().value, Value::I32(42));

        // Wrong namespace, wrong name.
        assert!(importer.import_global("sys", "answer", &i32_global()).is_err());
        assert!(importer.import_global("env", "question", &i32_global()).is_err());
    }

    #[test]
    fn host_function_calls() {
        let double = HostFunction::new(
            FunctionType {
                parameters: vec![crate::parser::module::ValueType::I32],
                return_types: vec![crate::parser::module::ValueType::I32],
            },
            |args| {
                let v = args[0].as_i32().unwrap();
                Ok(vec![Value::I32(v * 2)])
            },
        );
        assert_eq!((double.call)(&[Value::I32(21)]).unwrap(), vec![Value::I32(42)]);
    }
}
