//! Module instantiation and invocation.
//!
//! Instantiation proceeds in the fixed order the specification gives and
//! fails atomically: resolve imports, allocate memories and tables,
//! initialise globals, copy data and element segments (out-of-bounds copy
//! traps), then run the start function.

use super::executor::{self, DefaultInterpreter, OpInterpreter};
use super::imports::Importer;
use super::memory::Memory;
use super::policy::ExecutionPolicy;
use super::structure::{self, StructuredBody};
use super::table::Table;
use super::{
    GlobalInstance, HostFunction, RuntimeError, SharedGlobal, SharedMemory, SharedTable, Trap,
    TrapKind, Value,
};
use crate::parser::instruction::Instruction;
use crate::parser::module::{ExportIndex, ExternalKind, FunctionType, Limits, Module};
use std::cell::{Cell, RefCell};
use std::rc::Rc;

/// One entry of the instance's function index space.
enum FuncInstance {
    /// A local function: its type plus its code-section slot.
    Local { body_index: usize },
    /// An imported host callable.
    Host(HostFunction),
}

/// A running instance of a module.
///
/// All mutable state sits behind shared handles, so invocation takes
/// `&self` and host functions may re-enter the instance.
pub struct ModuleInstance<'m> {
    module: &'m Module,
    policy: ExecutionPolicy,
    interpreter: Box<dyn OpInterpreter>,
    functions: Vec<FuncInstance>,
    memories: Vec<SharedMemory>,
    tables: Vec<SharedTable>,
    globals: Vec<SharedGlobal>,
    /// Current call depth, shared across wasm frames and host re-entries.
    depth: Cell<usize>,
    /// Per-function memoised flat -> tree translations
    /// (`policy.translation_cache`).
    translations: RefCell<Vec<Option<Rc<StructuredBody>>>>,
}

impl<'m> std::fmt::Debug for ModuleInstance<'m> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleInstance")
            .field("module", &self.module)
            .field("policy", &self.policy)
            .field("memories", &self.memories)
            .field("tables", &self.tables)
            .field("globals", &self.globals)
            .field("depth", &self.depth)
            .finish_non_exhaustive()
    }
}

impl<'m> ModuleInstance<'m> {
    /// Instantiates `module` against `importer` with the default
    /// interpreter.
    pub fn instantiate(
        module: &'m Module,
        importer: &dyn Importer,
        policy: ExecutionPolicy,
    ) -> Result<ModuleInstance<'m>, RuntimeError> {
        Self::instantiate_with(module, importer, policy, Box::new(DefaultInterpreter))
    }

    /// Instantiates with a caller-supplied operator interpreter (e.g. a
    /// compiling backend).
    pub fn instantiate_with(
        module: &'m Module,
        importer: &dyn Importer,
        policy: ExecutionPolicy,
        interpreter: Box<dyn OpInterpreter>,
    ) -> Result<ModuleInstance<'m>, RuntimeError> {
        let mut functions = Vec::new();
        let mut memories = Vec::new();
        let mut tables = Vec::new();
        let mut globals = Vec::new();

        // (1) Resolve imports in declaration order, checking compatibility.
        for import in &module.imports.imports {
            match &import.external_kind {
                ExternalKind::Function(type_idx) => {
                    let expected = module
                        .types
                        .get(*type_idx)
                        .ok_or_else(|| RuntimeError::MalformedBody(format!("import type {type_idx} out of range")))?;
                    let host = importer.import_function(&import.module, &import.name, expected)?;
                    if host.func_type != *expected {
                        return Err(import_type_error(
                            import,
                            format!("expected {expected}, importer supplied {}", host.func_type),
                        ));
                    }
                    functions.push(FuncInstance::Host(host));
                }
                ExternalKind::Memory(declared) => {
                    let memory = importer.import_memory(&import.module, &import.name, declared)?;
                    check_memory_compat(import, declared, &memory)?;
                    memories.push(memory);
                }
                ExternalKind::Table(declared) => {
                    let table = importer.import_table(&import.module, &import.name, declared)?;
                    check_table_compat(import, &declared.limits, &table)?;
                    tables.push(table);
                }
                ExternalKind::Global(declared) => {
                    let global = importer.import_global(&import.module, &import.name, declared)?;
                    {
                        let g = global.borrow();
                        if g.value.typ() != declared.value_type || g.mutable != declared.mutable {
                            return Err(import_type_error(
                                import,
                                format!(
                                    "expected {declared}, importer supplied {} {}",
                                    if g.mutable { "(mut)" } else { "(const)" },
                                    g.value.typ()
                                ),
                            ));
                        }
                    }
                    globals.push(global);
                }
            }
        }

        // Local functions follow imports in the index space.
        for body_index in 0..module.code.len() {
            functions.push(FuncInstance::Local { body_index });
        }

        // (2) Allocate local memories (zero-filled) and tables (all slots
        // null).
        for declared in &module.memories.memories {
            let memory = Memory::new(declared.limits.min, declared.limits.max, policy.max_memory_pages)?;
            memories.push(Rc::new(RefCell::new(memory)));
        }
        for declared in &module.tables.tables {
            let table = Table::new(declared.limits)?;
            tables.push(Rc::new(RefCell::new(table)));
        }

        // (3) Initialise globals; each initializer sees only the globals
        // defined before it (validation restricts them to imports).
        for global in &module.globals.globals {
            let value = eval_init(&globals, &global.init)?;
            globals.push(GlobalInstance::new(value, global.global_type.mutable));
        }

        let translations = RefCell::new(vec![None; module.code.len()]);
        let instance = ModuleInstance {
            module,
            policy,
            interpreter,
            functions,
            memories,
            tables,
            globals,
            depth: Cell::new(0),
            translations,
        };

        // (4) Copy data and element segments; an out-of-bounds copy traps,
        // aborting instantiation.
        instance.initialise_segments()?;

        // (5) Run the start function.
        if let Some(start) = module.start.start {
            instance.invoke_index(start, Vec::new())?;
        }

        Ok(instance)
    }

    fn initialise_segments(&self) -> Result<(), RuntimeError> {
        for segment in &self.module.data.data {
            let offset = eval_init(&self.globals, &segment.offset)?
                .as_i32()
                .ok_or_else(|| RuntimeError::InvalidInitExpr("data offset is not i32".to_string()))?
                as u32;
            let memory = self
                .memories
                .get(segment.memory_index as usize)
                .ok_or(RuntimeError::NoMemory)?;

            let end = offset as u64 + segment.init.len() as u64;
            if end > memory.borrow().size_bytes() as u64 {
                return Err(Trap::new(
                    TrapKind::OutOfBoundsMemoryAccess,
                    format!("data segment [{offset}, {end}) exceeds memory size"),
                )
                .into());
            }
            memory.borrow_mut().write_bytes(offset as u64, &segment.init)?;
        }

        for segment in &self.module.elements.elements {
            let offset = eval_init(&self.globals, &segment.offset)?
                .as_i32()
                .ok_or_else(|| RuntimeError::InvalidInitExpr("element offset is not i32".to_string()))?
                as u32;
            let table = self
                .tables
                .get(segment.table_index as usize)
                .ok_or(RuntimeError::NoTable)?;
            table.borrow_mut().init(offset, &segment.func_indices)?;
        }

        Ok(())
    }

    /// Invokes an exported function by name.
    pub fn invoke(&self, name: &str, args: Vec<Value>) -> Result<Vec<Value>, RuntimeError> {
        let export = self
            .module
            .exports
            .find(name)
            .ok_or_else(|| RuntimeError::UnknownExport(name.to_string()))?;
        match export.index {
            ExportIndex::Function(func_idx) => self.invoke_index(func_idx, args),
            _ => Err(RuntimeError::NotAFunction(name.to_string())),
        }
    }

    /// Invokes a function by index in the function index space.
    ///
    /// Argument arity and types are checked against the declared
    /// signature. Depth accounting covers wasm and host frames alike; the
    /// policy bound trips a `call stack exhausted` trap.
    pub fn invoke_index(&self, func_idx: u32, args: Vec<Value>) -> Result<Vec<Value>, RuntimeError> {
        let func_type = self
            .function_type(func_idx)
            .ok_or(RuntimeError::FunctionIndexOutOfBounds(func_idx))?
            .clone();

        if args.len() != func_type.parameters.len() {
            return Err(RuntimeError::ArgumentCount {
                expected: func_type.parameters.len(),
                actual: args.len(),
            });
        }
        for (value, expected) in args.iter().zip(&func_type.parameters) {
            if value.typ() != *expected {
                return Err(RuntimeError::TypeMismatch {
                    expected: expected.to_string(),
                    actual: value.typ().to_string(),
                });
            }
        }

        let _depth = DepthGuard::enter(&self.depth, self.policy.max_call_stack_depth)?;

        match &self.functions[func_idx as usize] {
            FuncInstance::Host(host) => (host.call)(&args),
            FuncInstance::Local { body_index } => {
                let body = self.translated_body(*body_index)?;

                // Locals: parameters, then zero-initialised declarations.
                let declared = &self.module.code.code[*body_index].locals;
                let mut locals = args;
                locals.reserve(declared.count() as usize);
                for local_type in declared.iter_types() {
                    locals.push(Value::default_for(local_type));
                }

                executor::execute_function(self, &body, locals, &func_type.return_types)
            }
        }
    }

    fn translated_body(&self, body_index: usize) -> Result<Rc<StructuredBody>, RuntimeError> {
        if self.policy.translation_cache {
            if let Some(cached) = &self.translations.borrow()[body_index] {
                return Ok(Rc::clone(cached));
            }
        }
        let body = Rc::new(structure::build(
            &self.module.code.code[body_index].instructions,
        )?);
        if self.policy.translation_cache {
            self.translations.borrow_mut()[body_index] = Some(Rc::clone(&body));
        }
        Ok(body)
    }

    // -- Accessors used by the executor and embedders ----------------------

    pub fn module(&self) -> &'m Module {
        self.module
    }

    /// The type of a function in the index space.
    pub fn function_type(&self, func_idx: u32) -> Option<&FunctionType> {
        match self.functions.get(func_idx as usize)? {
            FuncInstance::Host(host) => Some(&host.func_type),
            FuncInstance::Local { .. } => self.module.function_type(func_idx),
        }
    }

    /// Memory 0, when present.
    pub fn memory(&self) -> Option<SharedMemory> {
        self.memories.first().cloned()
    }

    /// Table 0, when present.
    pub fn table(&self) -> Option<SharedTable> {
        self.tables.first().cloned()
    }

    pub fn globals(&self) -> &[SharedGlobal] {
        &self.globals
    }

    /// The value of a global by index.
    pub fn global_value(&self, global_idx: u32) -> Option<Value> {
        self.globals.get(global_idx as usize).map(|g| g.borrow().value)
    }

    pub(crate) fn interpreter(&self) -> &dyn OpInterpreter {
        self.interpreter.as_ref()
    }
}

/// Evaluates an initializer expression against the globals resolved so
/// far.
fn eval_init(globals: &[SharedGlobal], init: &[Instruction]) -> Result<Value, RuntimeError> {
    match init.first() {
        Some(Instruction::I32Const { value }) => Ok(Value::I32(*value)),
        Some(Instruction::I64Const { value }) => Ok(Value::I64(*value)),
        Some(Instruction::F32Const { value }) => Ok(Value::F32(*value)),
        Some(Instruction::F64Const { value }) => Ok(Value::F64(*value)),
        Some(Instruction::GlobalGet { global_idx }) => globals
            .get(*global_idx as usize)
            .map(|g| g.borrow().value)
            .ok_or(RuntimeError::GlobalIndexOutOfBounds(*global_idx)),
        other => Err(RuntimeError::InvalidInitExpr(format!(
            "expected a constant operator, found {other:?}"
        ))),
    }
}

fn import_type_error(import: &crate::parser::module::Import, reason: String) -> RuntimeError {
    RuntimeError::ImportType {
        module: import.module.clone(),
        name: import.name.clone(),
        reason,
    }
}

/// Imported memory must start at least as large as declared; when both
/// maxima are present the imported one must not exceed the declared one.
fn check_memory_compat(
    import: &crate::parser::module::Import,
    declared: &Limits,
    memory: &SharedMemory,
) -> Result<(), RuntimeError> {
    let supplied = memory.borrow();
    if supplied.size() < declared.min {
        return Err(import_type_error(
            import,
            format!("memory has {} pages, import requires at least {}", supplied.size(), declared.min),
        ));
    }
    if let (Some(declared_max), Some(supplied_max)) = (declared.max, supplied.max_pages()) {
        if supplied_max > declared_max {
            return Err(import_type_error(
                import,
                format!("memory maximum {supplied_max} exceeds declared maximum {declared_max}"),
            ));
        }
    }
    Ok(())
}

fn check_table_compat(
    import: &crate::parser::module::Import,
    declared: &Limits,
    table: &SharedTable,
) -> Result<(), RuntimeError> {
    let supplied = table.borrow();
    if supplied.size() < declared.min {
        return Err(import_type_error(
            import,
            format!(
                "table has {} elements, import requires at least {}",
                supplied.size(),
                declared.min
            ),
        ));
    }
    if let (Some(declared_max), Some(supplied_max)) = (declared.max, supplied.max()) {
        if supplied_max > declared_max {
            return Err(import_type_error(
                import,
                format!("table maximum {supplied_max} exceeds declared maximum {declared_max}"),
            ));
        }
    }
    Ok(())
}

/// RAII guard for the shared call-depth counter.
struct DepthGuard<'a> {
    depth: &'a Cell<usize>,
}

impl<'a> DepthGuard<'a> {
    fn enter(depth: &'a Cell<usize>, limit: usize) -> Result<DepthGuard<'a>, RuntimeError> {
        let next = depth.get() + 1;
        if next > limit {
            return Err(Trap::new(TrapKind::CallStackExhausted, format!("depth limit {limit}")).into());
        }
        depth.set(next);
        Ok(DepthGuard { depth })
    }
}

impl Drop for DepthGuard<'_> {
    fn drop(&mut self) {
        self.depth.set(self.depth.get() - 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::EmptyImporter;
    use crate::wat;

    fn instantiate<'m>(module: &'m Module) -> ModuleInstance<'m> {
        ModuleInstance::instantiate(module, &EmptyImporter, ExecutionPolicy::for_tests()).expect("instantiate")
    }

    #[test]
    fn data_segments_copied_at_offset() {
        let module = wat::parse(r#"(module (memory 1) (data (i32.const 8) "hi"))"#).unwrap();
        let instance = instantiate(&module);
        let memory = instance.memory().unwrap();
        assert_eq!(memory.borrow().read_bytes(8, 2).unwrap(), b"hi");
        assert_eq!(memory.borrow().read_u8(7).unwrap(), 0);
    }

    #[test]
    fn data_segment_out_of_bounds_aborts() {
        let module = wat::parse(r#"(module (memory 1) (data (i32.const 65535) "hi"))"#).unwrap();
        let result = ModuleInstance::instantiate(&module, &EmptyImporter, ExecutionPolicy::for_tests());
        assert!(matches!(
            result.unwrap_err(),
            RuntimeError::Trap(t) if t.kind == TrapKind::OutOfBoundsMemoryAccess
        ));
    }

    #[test]
    fn element_segments_fill_table() {
        let module = wat::parse(
            r#"(module
                (table 4 funcref)
                (func $f (result i32) (i32.const 1))
                (func $g (result i32) (i32.const 2))
                (elem (i32.const 1) $f $g))"#,
        )
        .unwrap();
        let instance = instantiate(&module);
        let table = instance.table().unwrap();
        assert_eq!(table.borrow().get(0).unwrap(), None);
        assert_eq!(table.borrow().get(1).unwrap(), Some(0));
        assert_eq!(table.borrow().get(2).unwrap(), Some(1));
    }

    #[test]
    fn element_segment_out_of_bounds_aborts() {
        let module = wat::parse(
            r#"(module
                (table 1 funcref)
                (func $f)
                (elem (i32.const 1) $f))"#,
        )
        .unwrap();
        let result = ModuleInstance::instantiate(&module, &EmptyImporter, ExecutionPolicy::for_tests());
        assert!(matches!(
            result.unwrap_err(),
            RuntimeError::Trap(t) if t.kind == TrapKind::UndefinedElement
        ));
    }

    #[test]
    fn globals_initialise_in_order() {
        let module = wat::parse(
            r#"(module
                (global $a i32 (i32.const 7))
                (global $b (mut f64) (f64.const 2.5)))"#,
        )
        .unwrap();
        let instance = instantiate(&module);
        assert_eq!(instance.global_value(0), Some(Value::I32(7)));
        assert_eq!(instance.global_value(1), Some(Value::F64(2.5)));
    }

    #[test]
    fn start_function_runs() {
        let module = wat::parse(
            r#"(module
                (memory 1)
                (func $init (i32.store8 (i32.const 0) (i32.const 42)))
                (start $init))"#,
        )
        .unwrap();
        let instance = instantiate(&module);
        assert_eq!(instance.memory().unwrap().borrow().read_u8(0).unwrap(), 42);
    }

    #[test]
    fn unknown_export() {
        let module = wat::parse("(module)").unwrap();
        let instance = instantiate(&module);
        assert!(matches!(
            instance.invoke("missing", vec![]),
            Err(RuntimeError::UnknownExport(_))
        ));
    }

    #[test]
    fn argument_checking() {
        let module = wat::parse(r#"(module (func (export "f") (param i32)))"#).unwrap();
        let instance = instantiate(&module);
        assert!(matches!(
            instance.invoke("f", vec![]),
            Err(RuntimeError::ArgumentCount { expected: 1, actual: 0 })
        ));
        assert!(matches!(
            instance.invoke("f", vec![Value::I64(1)]),
            Err(RuntimeError::TypeMismatch { .. })
        ));
        assert!(instance.invoke("f", vec![Value::I32(1)]).is_ok());
    }

    #[test]
    fn missing_import_fails_instantiation() {
        let module = wat::parse(r#"(module (import "env" "f" (func)))"#).unwrap();
        let result = ModuleInstance::instantiate(&module, &EmptyImporter, ExecutionPolicy::default());
        assert!(matches!(result.unwrap_err(), RuntimeError::Import { .. }));
    }
}
