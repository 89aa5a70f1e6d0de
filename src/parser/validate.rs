//! Module validation: the invariants every well-formed module satisfies.
//!
//! Runs over a decoded or assembled [`Module`] before it reaches the encoder
//! or the interpreter. Checks index spaces, limits, initializer expressions,
//! the start signature, and export uniqueness.

use super::instruction::Instruction;
use super::module::{ExportIndex, ExternalKind, Module, ValueType};
use std::collections::HashSet;
use thiserror::Error;

/// Maximum number of 64 KiB pages addressable in a 32-bit memory.
pub const MAX_PAGES: u32 = 65536;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("type index {index} out of bounds (type section has {count})")]
    TypeIndexOutOfBounds { index: u32, count: usize },

    #[error("function index {index} out of bounds (index space has {count})")]
    FunctionIndexOutOfBounds { index: u32, count: usize },

    #[error("table index {index} out of bounds (index space has {count})")]
    TableIndexOutOfBounds { index: u32, count: usize },

    #[error("memory index {index} out of bounds (index space has {count})")]
    MemoryIndexOutOfBounds { index: u32, count: usize },

    #[error("global index {index} out of bounds (index space has {count})")]
    GlobalIndexOutOfBounds { index: u32, count: usize },

    #[error("local index {index} out of bounds in function {func} ({count} locals)")]
    LocalIndexOutOfBounds { func: u32, index: u32, count: usize },

    #[error("limits minimum {min} exceeds maximum {max}")]
    LimitsMinExceedsMax { min: u32, max: u32 },

    #[error("memory limits exceed the {MAX_PAGES}-page address space")]
    MemoryTooLarge,

    #[error("multiple memories are not supported")]
    MultipleMemories,

    #[error("multiple tables are not supported")]
    MultipleTables,

    #[error("duplicate export name \"{name}\"")]
    DuplicateExportName { name: String },

    #[error("start function {index} must have type [] -> [], found {found}")]
    StartFunctionSignature { index: u32, found: String },

    #[error("invalid initializer expression: {reason}")]
    InvalidInitExpr { reason: String },

    #[error("initializer expression yields {found}, expected {expected}")]
    InitExprType { expected: ValueType, found: ValueType },

    #[error("initializer global.get {index} must reference an imported immutable global")]
    InitExprGlobal { index: u32 },
}

/// Validates every module invariant. The first violation is returned.
pub fn validate_module(module: &Module) -> Result<(), ValidationError> {
    validate_types_referenced(module)?;
    validate_limits(module)?;
    validate_globals(module)?;
    validate_exports(module)?;
    validate_start(module)?;
    validate_segments(module)?;
    validate_code(module)?;
    Ok(())
}

fn check_limits(min: u32, max: Option<u32>) -> Result<(), ValidationError> {
    if let Some(max) = max {
        if min > max {
            return Err(ValidationError::LimitsMinExceedsMax { min, max });
        }
    }
    Ok(())
}

fn validate_types_referenced(module: &Module) -> Result<(), ValidationError> {
    let count = module.types.len();
    for import in &module.imports.imports {
        if let ExternalKind::Function(type_idx) = import.external_kind {
            if type_idx as usize >= count {
                return Err(ValidationError::TypeIndexOutOfBounds { index: type_idx, count });
            }
        }
    }
    for function in &module.functions.functions {
        if function.ftype_index as usize >= count {
            return Err(ValidationError::TypeIndexOutOfBounds {
                index: function.ftype_index,
                count,
            });
        }
    }
    Ok(())
}

fn validate_limits(module: &Module) -> Result<(), ValidationError> {
    if module.memory_index_space() > 1 {
        return Err(ValidationError::MultipleMemories);
    }
    if module.table_index_space() > 1 {
        return Err(ValidationError::MultipleTables);
    }

    for import in &module.imports.imports {
        match &import.external_kind {
            ExternalKind::Memory(limits) => {
                check_limits(limits.min, limits.max)?;
                check_memory_pages(limits.min, limits.max)?;
            }
            ExternalKind::Table(table) => check_limits(table.limits.min, table.limits.max)?,
            _ => {}
        }
    }
    for memory in &module.memories.memories {
        check_limits(memory.limits.min, memory.limits.max)?;
        check_memory_pages(memory.limits.min, memory.limits.max)?;
    }
    for table in &module.tables.tables {
        check_limits(table.limits.min, table.limits.max)?;
    }
    Ok(())
}

fn check_memory_pages(min: u32, max: Option<u32>) -> Result<(), ValidationError> {
    if min > MAX_PAGES || max.is_some_and(|m| m > MAX_PAGES) {
        return Err(ValidationError::MemoryTooLarge);
    }
    Ok(())
}

/// Checks an initializer expression: a single constant-producing operator or
/// `global.get` of an imported immutable global, followed by `end`.
fn validate_init_expr(
    module: &Module,
    init: &[Instruction],
    expected: ValueType,
) -> Result<(), ValidationError> {
    let malformed = |reason: &str| ValidationError::InvalidInitExpr {
        reason: reason.to_string(),
    };

    if init.len() != 2 || init[1] != Instruction::End {
        return Err(malformed("expected one constant operator followed by end"));
    }

    let found = match &init[0] {
        Instruction::I32Const { .. } => ValueType::I32,
        Instruction::I64Const { .. } => ValueType::I64,
        Instruction::F32Const { .. } => ValueType::F32,
        Instruction::F64Const { .. } => ValueType::F64,
        Instruction::GlobalGet { global_idx } => {
            let imported = module.imports.global_count() as u32;
            if *global_idx >= imported {
                return Err(ValidationError::InitExprGlobal { index: *global_idx });
            }
            let global_type = module
                .global_type(*global_idx)
                .ok_or(ValidationError::GlobalIndexOutOfBounds {
                    index: *global_idx,
                    count: module.global_index_space(),
                })?;
            if global_type.mutable {
                return Err(ValidationError::InitExprGlobal { index: *global_idx });
            }
            global_type.value_type
        }
        other => {
            return Err(malformed(&format!("{} is not constant", other.mnemonic())));
        }
    };

    if found != expected {
        return Err(ValidationError::InitExprType { expected, found });
    }
    Ok(())
}

fn validate_globals(module: &Module) -> Result<(), ValidationError> {
    for global in &module.globals.globals {
        validate_init_expr(module, &global.init, global.global_type.value_type)?;
    }
    Ok(())
}

fn validate_exports(module: &Module) -> Result<(), ValidationError> {
    let mut seen: HashSet<&str> = HashSet::new();
    for export in &module.exports.exports {
        if !seen.insert(&export.name) {
            return Err(ValidationError::DuplicateExportName {
                name: export.name.clone(),
            });
        }
        match export.index {
            ExportIndex::Function(index) => {
                let count = module.function_index_space();
                if index as usize >= count {
                    return Err(ValidationError::FunctionIndexOutOfBounds { index, count });
                }
            }
            ExportIndex::Table(index) => {
                let count = module.table_index_space();
                if index as usize >= count {
                    return Err(ValidationError::TableIndexOutOfBounds { index, count });
                }
            }
            ExportIndex::Memory(index) => {
                let count = module.memory_index_space();
                if index as usize >= count {
                    return Err(ValidationError::MemoryIndexOutOfBounds { index, count });
                }
            }
            ExportIndex::Global(index) => {
                let count = module.global_index_space();
                if index as usize >= count {
                    return Err(ValidationError::GlobalIndexOutOfBounds { index, count });
                }
            }
        }
    }
    Ok(())
}

fn validate_start(module: &Module) -> Result<(), ValidationError> {
    let Some(index) = module.start.start else {
        return Ok(());
    };
    let count = module.function_index_space();
    let Some(func_type) = module.function_type(index) else {
        return Err(ValidationError::FunctionIndexOutOfBounds { index, count });
    };
    if !func_type.parameters.is_empty() || !func_type.return_types.is_empty() {
        return Err(ValidationError::StartFunctionSignature {
            index,
            found: func_type.to_string(),
        });
    }
    Ok(())
}

fn validate_segments(module: &Module) -> Result<(), ValidationError> {
    let func_space = module.function_index_space();

    for element in &module.elements.elements {
        let table_space = module.table_index_space();
        if element.table_index as usize >= table_space {
            return Err(ValidationError::TableIndexOutOfBounds {
                index: element.table_index,
                count: table_space,
            });
        }
        validate_init_expr(module, &element.offset, ValueType::I32)?;
        for &index in &element.func_indices {
            if index as usize >= func_space {
                return Err(ValidationError::FunctionIndexOutOfBounds {
                    index,
                    count: func_space,
                });
            }
        }
    }

    for data in &module.data.data {
        let memory_space = module.memory_index_space();
        if data.memory_index as usize >= memory_space {
            return Err(ValidationError::MemoryIndexOutOfBounds {
                index: data.memory_index,
                count: memory_space,
            });
        }
        validate_init_expr(module, &data.offset, ValueType::I32)?;
    }

    Ok(())
}

/// Walks every function body checking that call, global, and local indices
/// stay within their index spaces.
fn validate_code(module: &Module) -> Result<(), ValidationError> {
    let func_space = module.function_index_space();
    let global_space = module.global_index_space();
    let imported_functions = module.imports.function_count();

    for (i, body) in module.code.code.iter().enumerate() {
        let func_idx = (imported_functions + i) as u32;
        // Type-index validity was checked above; a missing type here means
        // the function/code sections are unpaired, reported separately.
        let Some(func_type) = module.function_type(func_idx) else {
            continue;
        };
        let local_count = func_type.parameters.len() + body.locals.count() as usize;

        for instruction in &body.instructions {
            match instruction {
                Instruction::Call { func_idx: index } => {
                    if *index as usize >= func_space {
                        return Err(ValidationError::FunctionIndexOutOfBounds {
                            index: *index,
                            count: func_space,
                        });
                    }
                }
                Instruction::CallIndirect { type_idx } => {
                    if *type_idx as usize >= module.types.len() {
                        return Err(ValidationError::TypeIndexOutOfBounds {
                            index: *type_idx,
                            count: module.types.len(),
                        });
                    }
                }
                Instruction::LocalGet { local_idx }
                | Instruction::LocalSet { local_idx }
                | Instruction::LocalTee { local_idx } => {
                    if *local_idx as usize >= local_count {
                        return Err(ValidationError::LocalIndexOutOfBounds {
                            func: func_idx,
                            index: *local_idx,
                            count: local_count,
                        });
                    }
                }
                Instruction::GlobalGet { global_idx } | Instruction::GlobalSet { global_idx } => {
                    if *global_idx as usize >= global_space {
                        return Err(ValidationError::GlobalIndexOutOfBounds {
                            index: *global_idx,
                            count: global_space,
                        });
                    }
                }
                _ => {}
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::module::{
        Data, Element, Export, FunctionBody, FunctionType, Global, GlobalType, Import, Limits,
        Locals, Memory,
    };

    fn empty_module() -> Module {
        Module::new()
    }

    fn nullary_module() -> Module {
        let mut module = empty_module();
        module.types.push(FunctionType {
            parameters: vec![],
            return_types: vec![],
        });
        module.push_function(
            0,
            FunctionBody {
                locals: Locals::empty(),
                instructions: vec![Instruction::End],
            },
        );
        module
    }

    #[test]
    fn empty_module_is_valid() {
        assert!(validate_module(&empty_module()).is_ok());
    }

    #[test]
    fn type_index_bounds() {
        let mut module = empty_module();
        module.push_function(
            3,
            FunctionBody {
                locals: Locals::empty(),
                instructions: vec![Instruction::End],
            },
        );
        assert!(matches!(
            validate_module(&module),
            Err(ValidationError::TypeIndexOutOfBounds { index: 3, count: 0 })
        ));
    }

    #[test]
    fn limits_min_over_max() {
        let mut module = empty_module();
        module.memories.memories.push(Memory {
            limits: Limits::new(10, Some(5)),
        });
        assert!(matches!(
            validate_module(&module),
            Err(ValidationError::LimitsMinExceedsMax { min: 10, max: 5 })
        ));
    }

    #[test]
    fn at_most_one_memory() {
        let mut module = empty_module();
        module.memories.memories.push(Memory {
            limits: Limits::new(1, None),
        });
        module.memories.memories.push(Memory {
            limits: Limits::new(1, None),
        });
        assert!(matches!(
            validate_module(&module),
            Err(ValidationError::MultipleMemories)
        ));
    }

    #[test]
    fn duplicate_export_names() {
        let mut module = nullary_module();
        module.exports.push(Export {
            name: "f".to_string(),
            index: ExportIndex::Function(0),
        });
        module.exports.push(Export {
            name: "f".to_string(),
            index: ExportIndex::Function(0),
        });
        assert!(matches!(
            validate_module(&module),
            Err(ValidationError::DuplicateExportName { .. })
        ));
    }

    #[test]
    fn export_index_bounds() {
        let mut module = empty_module();
        module.exports.push(Export {
            name: "f".to_string(),
            index: ExportIndex::Function(0),
        });
        assert!(matches!(
            validate_module(&module),
            Err(ValidationError::FunctionIndexOutOfBounds { index: 0, count: 0 })
        ));
    }

    #[test]
    fn start_signature() {
        let mut module = empty_module();
        module.types.push(FunctionType {
            parameters: vec![ValueType::I32],
            return_types: vec![],
        });
        module.push_function(
            0,
            FunctionBody {
                locals: Locals::empty(),
                instructions: vec![Instruction::End],
            },
        );
        module.start.start = Some(0);
        assert!(matches!(
            validate_module(&module),
            Err(ValidationError::StartFunctionSignature { index: 0, .. })
        ));
    }

    #[test]
    fn global_init_type_must_match() {
        let mut module = empty_module();
        module.globals.globals.push(Global {
            global_type: GlobalType {
                value_type: ValueType::I64,
                mutable: false,
            },
            init: vec![Instruction::I32Const { value: 1 }, Instruction::End],
        });
        assert!(matches!(
            validate_module(&module),
            Err(ValidationError::InitExprType {
                expected: ValueType::I64,
                found: ValueType::I32
            })
        ));
    }

    #[test]
    fn global_init_must_be_constant() {
        let mut module = empty_module();
        module.globals.globals.push(Global {
            global_type: GlobalType {
                value_type: ValueType::I32,
                mutable: false,
            },
            init: vec![Instruction::I32Add, Instruction::End],
        });
        assert!(matches!(
            validate_module(&module),
            Err(ValidationError::InvalidInitExpr { .. })
        ));
    }

    #[test]
    fn global_init_may_reference_imported_immutable() {
        let mut module = empty_module();
        module.imports.push(Import {
            module: "env".to_string(),
            name: "base".to_string(),
            external_kind: ExternalKind::Global(GlobalType {
                value_type: ValueType::I32,
                mutable: false,
            }),
        });
        module.globals.globals.push(Global {
            global_type: GlobalType {
                value_type: ValueType::I32,
                mutable: true,
            },
            init: vec![Instruction::GlobalGet { global_idx: 0 }, Instruction::End],
        });
        assert!(validate_module(&module).is_ok());

        // A local (non-imported) global is not a valid initializer source.
        module.globals.globals.push(Global {
            global_type: GlobalType {
                value_type: ValueType::I32,
                mutable: false,
            },
            init: vec![Instruction::GlobalGet { global_idx: 1 }, Instruction::End],
        });
        assert!(matches!(
            validate_module(&module),
            Err(ValidationError::InitExprGlobal { index: 1 })
        ));
    }

    #[test]
    fn element_function_indices_checked() {
        let mut module = nullary_module();
        module.tables.tables.push(crate::parser::module::TableType {
            elem_type: crate::parser::module::ElemType::FuncRef,
            limits: Limits::new(2, None),
        });
        module.elements.elements.push(Element {
            table_index: 0,
            offset: vec![Instruction::I32Const { value: 0 }, Instruction::End],
            func_indices: vec![0, 7],
        });
        assert!(matches!(
            validate_module(&module),
            Err(ValidationError::FunctionIndexOutOfBounds { index: 7, .. })
        ));
    }

    #[test]
    fn data_segment_offset_must_be_i32() {
        let mut module = empty_module();
        module.memories.memories.push(Memory {
            limits: Limits::new(1, None),
        });
        module.data.data.push(Data {
            memory_index: 0,
            offset: vec![Instruction::I64Const { value: 0 }, Instruction::End],
            init: vec![1, 2, 3],
        });
        assert!(matches!(
            validate_module(&module),
            Err(ValidationError::InitExprType {
                expected: ValueType::I32,
                found: ValueType::I64
            })
        ));
    }

    #[test]
    fn code_indices_checked() {
        let mut module = empty_module();
        module.types.push(FunctionType {
            parameters: vec![],
            return_types: vec![],
        });
        module.push_function(
            0,
            FunctionBody {
                locals: Locals::empty(),
                instructions: vec![Instruction::Call { func_idx: 9 }, Instruction::End],
            },
        );
        assert!(matches!(
            validate_module(&module),
            Err(ValidationError::FunctionIndexOutOfBounds { index: 9, count: 1 })
        ));

        let mut module = empty_module();
        module.types.push(FunctionType {
            parameters: vec![ValueType::I32],
            return_types: vec![],
        });
        module.push_function(
            0,
            FunctionBody {
                locals: Locals::from_types(&[ValueType::I64]),
                instructions: vec![Instruction::LocalGet { local_idx: 2 }, Instruction::End],
            },
        );
        assert!(matches!(
            validate_module(&module),
            Err(ValidationError::LocalIndexOutOfBounds { index: 2, count: 2, .. })
        ));
    }
}
