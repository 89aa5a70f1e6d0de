//! Assembler: S-expression tree -> WebAssembly [`Module`].
//!
//! Dispatches on the keyword of each module field (`type`, `import`,
//! `func`, `table`, `memory`, `global`, `export`, `start`, `elem`, `data`).
//! Forward references resolve through a pre-registration pass that binds
//! every `$name` to its final index before bodies are parsed.
//!
//! Diagnostics accumulate in a [`Diagnostics`] sink: a missing instruction
//! immediate reports once and substitutes a zero literal so assembly keeps
//! going; an unresolved identifier reports with a closest-match suggestion.

use super::error::{Diagnostics, ParseError};
use super::sexpr::{self, SExpr, SExprList};
use super::token::{Span, TokenKind};
use crate::parser::instruction::{BlockType, Instruction, MemArg};
use crate::parser::module::{
    Data, Element, ElemType, Export, ExportIndex, ExternalKind, Function, FunctionBody,
    FunctionType, Global, GlobalType, Import, Limits, Locals, Memory, Module, TableType, ValueType,
};
use crate::parser::names::NameSection;
use crate::parser::validate;
use std::collections::HashMap;

/// 64 KiB, the linear-memory page size.
const PAGE_SIZE: usize = 65536;

// Natural alignments (log2) used when the source omits `align=`.
const ALIGN_8: u32 = 0;
const ALIGN_16: u32 = 1;
const ALIGN_32: u32 = 2;
const ALIGN_64: u32 = 3;

/// Assembles WAT source into a validated module.
///
/// Returns the first error-severity diagnostic on failure.
pub fn parse(source: &str) -> Result<Module, ParseError> {
    let (module, diagnostics) = parse_with_diagnostics(source);
    if let Some(error) = diagnostics.first_error() {
        return Err(error);
    }
    module.ok_or_else(|| ParseError::new("no module found", Span::ZERO))
}

/// Assembles WAT source, accumulating every diagnostic.
///
/// The returned module is best-effort: present whenever the source had a
/// `(module …)` form at all, even if `diagnostics.has_errors()`.
pub fn parse_with_diagnostics(source: &str) -> (Option<Module>, Diagnostics) {
    let mut diagnostics = Diagnostics::new();

    let sexpr = match sexpr::read(source) {
        Ok(sexpr) => sexpr,
        Err(e) => {
            diagnostics.error(ParseError::new(e.message, e.span));
            return (None, diagnostics);
        }
    };

    let mut ctx = ParseContext::new(diagnostics);
    if let Err(e) = parse_module(&sexpr, &mut ctx) {
        ctx.diagnostics.error(e);
    }
    let (module, mut diagnostics) = ctx.into_module();

    if !diagnostics.has_errors() {
        if let Err(e) = validate::validate_module(&module) {
            diagnostics.error(ParseError::new(e.to_string(), Span::ZERO));
        }
    }

    (Some(module), diagnostics)
}

// ============================================================================
// Namespaces
// ============================================================================

/// The independent identifier contexts of the text format.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Namespace {
    Type,
    Func,
    Table,
    Memory,
    Global,
    Local,
}

impl Namespace {
    fn name(self) -> &'static str {
        match self {
            Namespace::Type => "type",
            Namespace::Func => "function",
            Namespace::Table => "table",
            Namespace::Memory => "memory",
            Namespace::Global => "global",
            Namespace::Local => "local",
        }
    }
}

// ============================================================================
// Parse context
// ============================================================================

/// Accumulates name tables, section entries, and diagnostics while the
/// module's fields are walked.
struct ParseContext {
    type_names: HashMap<String, u32>,
    func_names: HashMap<String, u32>,
    table_names: HashMap<String, u32>,
    memory_names: HashMap<String, u32>,
    global_names: HashMap<String, u32>,
    local_names: HashMap<String, u32>,

    // Counters include imports.
    type_count: u32,
    func_count: u32,
    table_count: u32,
    memory_count: u32,
    global_count: u32,
    local_count: u32,

    // Stack of enclosing block labels, innermost last.
    label_stack: Vec<Option<String>>,

    // Once a local definition of a kind exists, imports of it are rejected.
    has_func_def: bool,
    has_table_def: bool,
    has_memory_def: bool,
    has_global_def: bool,

    types: Vec<FunctionType>,
    imports: Vec<Import>,
    functions: Vec<Function>,
    tables: Vec<TableType>,
    memories: Vec<Memory>,
    globals: Vec<Global>,
    exports: Vec<Export>,
    start: Option<u32>,
    elements: Vec<Element>,
    code: Vec<FunctionBody>,
    data: Vec<Data>,
    names: NameSection,

    diagnostics: Diagnostics,
}

impl ParseContext {
    fn new(diagnostics: Diagnostics) -> Self {
        Self {
            type_names: HashMap::new(),
            func_names: HashMap::new(),
            table_names: HashMap::new(),
            memory_names: HashMap::new(),
            global_names: HashMap::new(),
            local_names: HashMap::new(),
            type_count: 0,
            func_count: 0,
            table_count: 0,
            memory_count: 0,
            global_count: 0,
            local_count: 0,
            label_stack: Vec::new(),
            has_func_def: false,
            has_table_def: false,
            has_memory_def: false,
            has_global_def: false,
            types: Vec::new(),
            imports: Vec::new(),
            functions: Vec::new(),
            tables: Vec::new(),
            memories: Vec::new(),
            globals: Vec::new(),
            exports: Vec::new(),
            start: None,
            elements: Vec::new(),
            code: Vec::new(),
            data: Vec::new(),
            names: NameSection::default(),
            diagnostics: Diagnostics::new(),
        }
        .with_diagnostics(diagnostics)
    }

    fn with_diagnostics(mut self, diagnostics: Diagnostics) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    fn ns_mut(&mut self, ns: Namespace) -> (&mut HashMap<String, u32>, &mut u32) {
        match ns {
            Namespace::Type => (&mut self.type_names, &mut self.type_count),
            Namespace::Func => (&mut self.func_names, &mut self.func_count),
            Namespace::Table => (&mut self.table_names, &mut self.table_count),
            Namespace::Memory => (&mut self.memory_names, &mut self.memory_count),
            Namespace::Global => (&mut self.global_names, &mut self.global_count),
            Namespace::Local => (&mut self.local_names, &mut self.local_count),
        }
    }

    fn ns(&self, ns: Namespace) -> &HashMap<String, u32> {
        match ns {
            Namespace::Type => &self.type_names,
            Namespace::Func => &self.func_names,
            Namespace::Table => &self.table_names,
            Namespace::Memory => &self.memory_names,
            Namespace::Global => &self.global_names,
            Namespace::Local => &self.local_names,
        }
    }

    /// Pre-registers a name, assigning the next index in the namespace.
    /// A second definition of the same name is a diagnostic; the first
    /// binding wins so assembly can continue.
    fn pre_register(&mut self, ns: Namespace, name: Option<&str>, span: Span) {
        let (names, count) = self.ns_mut(ns);
        let index = *count;
        *count += 1;
        let duplicate = match name {
            Some(name) if names.contains_key(name) => true,
            Some(name) => {
                names.insert(name.to_string(), index);
                false
            }
            None => false,
        };
        if duplicate {
            self.diagnostics
                .error(ParseError::duplicate(ns.name(), name.unwrap_or(""), span));
        }
    }

    /// Resets the pre-registration counters; names stay bound.
    fn reset_pre_registration(&mut self) {
        self.func_count = 0;
        self.table_count = 0;
        self.memory_count = 0;
        self.global_count = 0;
    }

    /// Claims the next index in a namespace during the main pass.
    fn register(&mut self, ns: Namespace, name: Option<&str>, span: Span) -> u32 {
        let is_local = ns == Namespace::Local;
        let (names, count) = self.ns_mut(ns);
        let index = *count;
        *count += 1;
        let mut duplicate = false;
        if let Some(name) = name {
            if is_local {
                if names.contains_key(name) {
                    duplicate = true;
                } else {
                    names.insert(name.to_string(), index);
                }
            } else {
                // Pre-registered; keep the existing binding.
                names.entry(name.to_string()).or_insert(index);
            }
        }
        if duplicate {
            self.diagnostics
                .error(ParseError::duplicate("local", name.unwrap_or(""), span));
        }
        index
    }

    /// Resolves a name in a namespace, suggesting the closest defined name
    /// on failure.
    fn resolve(&self, ns: Namespace, name: &str, span: Span) -> Result<u32, ParseError> {
        let names = self.ns(ns);
        names.get(name).copied().ok_or_else(|| {
            let suggestion = closest_match(names.keys(), name);
            ParseError::undefined(ns.name(), name, suggestion.as_deref(), span)
        })
    }

    /// Resolves a label name to a branch depth by walking the enclosing
    /// blocks innermost-out.
    fn resolve_label(&self, name: &str, span: Span) -> Result<u32, ParseError> {
        for (depth, label) in self.label_stack.iter().rev().enumerate() {
            if label.as_deref() == Some(name) {
                return Ok(depth as u32);
            }
        }
        let defined: Vec<String> = self.label_stack.iter().flatten().cloned().collect();
        let suggestion = closest_match(defined.iter(), name);
        Err(ParseError::undefined("label", name, suggestion.as_deref(), span))
    }

    fn push_label(&mut self, name: Option<String>) {
        self.label_stack.push(name);
    }

    fn pop_label(&mut self) {
        self.label_stack.pop();
    }

    /// Per-function state reset.
    fn reset_function(&mut self) {
        self.local_names.clear();
        self.local_count = 0;
        self.label_stack.clear();
    }

    /// Adds an explicit type definition; each `(type …)` gets its own
    /// index.
    fn add_type(&mut self, name: Option<&str>, func_type: FunctionType, span: Span) -> u32 {
        let index = self.type_count;
        self.type_count += 1;
        if let Some(name) = name {
            if self.type_names.contains_key(name) {
                self.diagnostics.error(ParseError::duplicate("type", name, span));
            } else {
                self.type_names.insert(name.to_string(), index);
            }
        }
        self.types.push(func_type);
        index
    }

    /// Index of an existing structurally equal type, or a fresh anonymous
    /// one. Implicit type uses deduplicate; explicit definitions do not.
    fn find_or_add_type(&mut self, func_type: FunctionType) -> u32 {
        for (index, existing) in self.types.iter().enumerate() {
            if *existing == func_type {
                return index as u32;
            }
        }
        let index = self.type_count;
        self.type_count += 1;
        self.types.push(func_type);
        index
    }

    fn into_module(self) -> (Module, Diagnostics) {
        let mut module = Module::new();
        for func_type in self.types {
            module.types.push(func_type);
        }
        module.imports.imports = self.imports;
        module.functions.functions = self.functions;
        module.tables.tables = self.tables;
        module.memories.memories = self.memories;
        module.globals.globals = self.globals;
        module.exports.exports = self.exports;
        module.start.start = self.start;
        module.elements.elements = self.elements;
        module.code.code = self.code;
        module.data.data = self.data;
        module.names = self.names;
        (module, self.diagnostics)
    }
}

/// Closest defined name within edit distance 2, for "did you mean"
/// suggestions.
fn closest_match<'a>(candidates: impl Iterator<Item = &'a String>, target: &str) -> Option<String> {
    candidates
        .map(|c| (edit_distance(c, target), c))
        .filter(|(d, _)| *d <= 2)
        .min_by_key(|(d, _)| *d)
        .map(|(_, c)| c.clone())
}

fn edit_distance(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    let mut row: Vec<usize> = (0..=b.len()).collect();

    for (i, &ca) in a.iter().enumerate() {
        let mut prev = row[0];
        row[0] = i + 1;
        for (j, &cb) in b.iter().enumerate() {
            let cost = if ca == cb { prev } else { prev + 1 };
            prev = row[j + 1];
            row[j + 1] = cost.min(row[j] + 1).min(prev + 1);
        }
    }
    row[b.len()]
}

// ============================================================================
// Module structure
// ============================================================================

/// Grammar: `module ::= '(' 'module' id? field* ')'`
fn parse_module(sexpr: &SExpr, ctx: &mut ParseContext) -> Result<(), ParseError> {
    let list = sexpr.expect_list().map_err(|e| ParseError::new(e.message, e.span))?;
    list.expect_head("module")
        .map_err(|e| ParseError::new(e.message, e.span))?;

    let mut start_idx = 1;
    if let Some(name) = list.get(1).and_then(|s| s.as_id()) {
        ctx.names.module_name = Some(name.to_string());
        start_idx = 2;
    }

    // Pre-registration pass: bind every name to its final index so forward
    // references resolve.
    pre_register_fields(list, start_idx, ctx);

    // Explicit type definitions resolve first so `(type $t)` uses work
    // regardless of field order.
    for item in list.iter_from(start_idx) {
        if item.is_list_headed_by("type") {
            if let Err(e) = parse_type_def(item.as_list().unwrap(), ctx) {
                ctx.diagnostics.error(e);
            }
        }
    }

    for item in list.iter_from(start_idx) {
        if item.is_list_headed_by("type") {
            continue;
        }
        if let Err(e) = parse_field(item, ctx) {
            ctx.diagnostics.error(e);
        }
    }

    Ok(())
}

/// Binds names to their final indices without parsing bodies. Field order
/// equals index order because imports are required to precede definitions
/// of the same kind.
fn pre_register_fields(list: SExprList<'_>, start: usize, ctx: &mut ParseContext) {
    for item in list.iter_from(start) {
        let Some(inner) = item.as_list() else { continue };
        let Some(keyword) = inner.head_keyword() else { continue };
        match keyword {
            "func" | "table" | "memory" | "global" => {
                let ns = match keyword {
                    "func" => Namespace::Func,
                    "table" => Namespace::Table,
                    "memory" => Namespace::Memory,
                    _ => Namespace::Global,
                };
                let name = inner.get(1).and_then(|s| s.as_id());
                ctx.pre_register(ns, name, inner.span);
            }
            "import" => {
                // (import "mod" "field" (func|table|memory|global $name? …))
                if let Some(desc) = inner.get(3).and_then(|s| s.as_list()) {
                    let ns = match desc.head_keyword() {
                        Some("func") => Some(Namespace::Func),
                        Some("table") => Some(Namespace::Table),
                        Some("memory") => Some(Namespace::Memory),
                        Some("global") => Some(Namespace::Global),
                        _ => None,
                    };
                    if let Some(ns) = ns {
                        let name = desc.get(1).and_then(|s| s.as_id());
                        ctx.pre_register(ns, name, desc.span);
                    }
                }
            }
            _ => {}
        }
    }
    ctx.reset_pre_registration();
}

/// Grammar: `field ::= import | func | table | memory | global | export
///                   | start | elem | data`
fn parse_field(sexpr: &SExpr, ctx: &mut ParseContext) -> Result<(), ParseError> {
    let list = sexpr.expect_list().map_err(|e| ParseError::new(e.message, e.span))?;
    let keyword = list
        .head_keyword()
        .ok_or_else(|| ParseError::new("expected field keyword", sexpr.span()))?;

    match keyword {
        "import" => parse_import(list, ctx),
        "func" => parse_func(list, ctx),
        "table" => parse_table(list, ctx),
        "memory" => parse_memory(list, ctx),
        "global" => parse_global(list, ctx),
        "export" => parse_export(list, ctx),
        "start" => parse_start(list, ctx),
        "elem" => parse_elem(list, ctx),
        "data" => parse_data(list, ctx),
        _ => Err(ParseError::new(format!("unknown field type: {keyword}"), list.span)),
    }
}

// ============================================================================
// Types
// ============================================================================

/// Grammar: `type ::= '(' 'type' id? '(' 'func' functype ')' ')'`
fn parse_type_def(list: SExprList<'_>, ctx: &mut ParseContext) -> Result<(), ParseError> {
    let mut idx = 1;
    let name = take_optional_name(list, &mut idx);

    let func_sexpr = list
        .get(idx)
        .ok_or_else(|| ParseError::new("expected function type", list.span))?;
    let func_list = func_sexpr.expect_list().map_err(|e| ParseError::new(e.message, e.span))?;
    func_list
        .expect_head("func")
        .map_err(|e| ParseError::new(e.message, e.span))?;

    let func_type = parse_func_type(func_list)?;
    ctx.add_type(name, func_type, list.span);
    Ok(())
}

/// Grammar: `functype ::= '(' 'func' param* result* ')'`
fn parse_func_type(list: SExprList<'_>) -> Result<FunctionType, ParseError> {
    let mut parameters = Vec::new();
    let mut return_types = Vec::new();
    let mut seen_result = false;

    for item in list.iter_from(1) {
        let inner = item.expect_list().map_err(|e| ParseError::new(e.message, e.span))?;
        match inner.head_keyword() {
            Some("param") => {
                if seen_result {
                    return Err(ParseError::new("param after result", inner.span));
                }
                for param in inner.iter_from(1) {
                    if param.as_id().is_some() {
                        continue; // parameter names are allowed but unbound here
                    }
                    parameters.push(parse_valtype(param)?);
                }
            }
            Some("result") => {
                seen_result = true;
                for result in inner.iter_from(1) {
                    return_types.push(parse_valtype(result)?);
                }
            }
            Some(kw) => {
                return Err(ParseError::new(
                    format!("expected 'param' or 'result', found '{kw}'"),
                    inner.span,
                ))
            }
            None => return Err(ParseError::new("expected keyword in type", inner.span)),
        }
    }

    Ok(FunctionType {
        parameters,
        return_types,
    })
}

/// Grammar: `valtype ::= 'i32' | 'i64' | 'f32' | 'f64'`
fn parse_valtype(sexpr: &SExpr) -> Result<ValueType, ParseError> {
    match sexpr.as_keyword() {
        Some("i32") => Ok(ValueType::I32),
        Some("i64") => Ok(ValueType::I64),
        Some("f32") => Ok(ValueType::F32),
        Some("f64") => Ok(ValueType::F64),
        Some(kw) => Err(ParseError::expected("value type", &format!("'{kw}'"), sexpr.span())),
        None => Err(ParseError::expected("value type", "list", sexpr.span())),
    }
}

/// Parses a type use: `(type idx)` and/or inline `(param …) (result …)`.
///
/// When both forms appear they must resolve to structurally equal function
/// types. Returns the type index and the position after the last consumed
/// item. `register_locals` binds parameter names into the local namespace
/// (used for function definitions).
fn parse_type_use(
    list: SExprList<'_>,
    start: usize,
    register_locals: bool,
    ctx: &mut ParseContext,
) -> Result<(u32, usize), ParseError> {
    let mut params = Vec::new();
    let mut results = Vec::new();
    let mut explicit_idx = None;
    let mut idx = start;
    let mut seen_param = false;
    let mut seen_result = false;

    while let Some(item) = list.get(idx) {
        let Some(inner) = item.as_list() else { break };

        match inner.head_keyword() {
            Some("type") => {
                if seen_param || seen_result || explicit_idx.is_some() {
                    return Err(ParseError::new("misplaced type use", inner.span));
                }
                explicit_idx = Some(parse_index_strict(inner.get(1), Namespace::Type, ctx, inner.span)?);
                idx += 1;
            }
            Some("param") => {
                if seen_result {
                    return Err(ParseError::new("param after result", inner.span));
                }
                seen_param = true;
                let name = inner.get(1).and_then(|s| s.as_id());
                if let Some(name) = name {
                    // Named form: exactly one value type.
                    let ty_item = inner
                        .get(2)
                        .ok_or_else(|| ParseError::new("expected value type after param name", inner.span))?;
                    let ty = parse_valtype(ty_item)?;
                    if register_locals {
                        ctx.register(Namespace::Local, Some(name), inner.span);
                    }
                    params.push(ty);
                } else {
                    for param in inner.iter_from(1) {
                        let ty = parse_valtype(param)?;
                        if register_locals {
                            ctx.register(Namespace::Local, None, inner.span);
                        }
                        params.push(ty);
                    }
                }
                idx += 1;
            }
            Some("result") => {
                seen_result = true;
                for result in inner.iter_from(1) {
                    results.push(parse_valtype(result)?);
                }
                idx += 1;
            }
            _ => break,
        }
    }

    let type_idx = if let Some(explicit) = explicit_idx {
        let declared = ctx
            .types
            .get(explicit as usize)
            .cloned()
            .ok_or_else(|| ParseError::new(format!("type index {explicit} out of range"), list.span))?;
        if seen_param || seen_result {
            let inline = FunctionType {
                parameters: params,
                return_types: results,
            };
            if inline != declared {
                return Err(ParseError::new(
                    format!("inline type use disagrees with type {explicit} ({declared})"),
                    list.span,
                ));
            }
        } else if register_locals {
            // Bare type reference: anonymous locals stand in for the
            // declared parameters so local indices line up.
            for _ in 0..declared.parameters.len() {
                ctx.register(Namespace::Local, None, list.span);
            }
        }
        explicit
    } else {
        ctx.find_or_add_type(FunctionType {
            parameters: params,
            return_types: results,
        })
    };

    Ok((type_idx, idx))
}

// ============================================================================
// Imports and exports
// ============================================================================

/// Grammar: `import ::= '(' 'import' name name importdesc ')'`
fn parse_import(list: SExprList<'_>, ctx: &mut ParseContext) -> Result<(), ParseError> {
    let module_name = parse_string_utf8(
        list.get(1)
            .ok_or_else(|| ParseError::new("expected module name string", list.span))?,
    )?;
    let field_name = parse_string_utf8(
        list.get(2)
            .ok_or_else(|| ParseError::new("expected field name string", list.span))?,
    )?;

    let desc = list
        .get(3)
        .ok_or_else(|| ParseError::new("expected import descriptor", list.span))?
        .expect_list()
        .map_err(|e| ParseError::new(e.message, e.span))?;

    let external_kind = match desc.head_keyword() {
        Some("func") => {
            check_import_order(ctx.has_func_def, "function", list.span)?;
            let name = desc.get(1).and_then(|s| s.as_id());
            ctx.register(Namespace::Func, name, desc.span);
            let start = if name.is_some() { 2 } else { 1 };
            let (type_idx, _) = parse_type_use(desc, start, false, ctx)?;
            ExternalKind::Function(type_idx)
        }
        Some("table") => {
            check_import_order(ctx.has_table_def, "table", list.span)?;
            let name = desc.get(1).and_then(|s| s.as_id());
            ctx.register(Namespace::Table, name, desc.span);
            let start = if name.is_some() { 2 } else { 1 };
            let (limits, next) = parse_limits(desc, start)?;
            parse_elem_type(desc.get(next))?;
            ExternalKind::Table(TableType {
                elem_type: ElemType::FuncRef,
                limits,
            })
        }
        Some("memory") => {
            check_import_order(ctx.has_memory_def, "memory", list.span)?;
            let name = desc.get(1).and_then(|s| s.as_id());
            ctx.register(Namespace::Memory, name, desc.span);
            let start = if name.is_some() { 2 } else { 1 };
            let (limits, _) = parse_limits(desc, start)?;
            ExternalKind::Memory(limits)
        }
        Some("global") => {
            check_import_order(ctx.has_global_def, "global", list.span)?;
            let name = desc.get(1).and_then(|s| s.as_id());
            ctx.register(Namespace::Global, name, desc.span);
            let start = if name.is_some() { 2 } else { 1 };
            ExternalKind::Global(parse_global_type(desc, start)?)
        }
        Some(kw) => return Err(ParseError::new(format!("unknown import kind: {kw}"), desc.span)),
        None => return Err(ParseError::new("expected import kind", desc.span)),
    };

    ctx.imports.push(Import {
        module: module_name,
        name: field_name,
        external_kind,
    });
    Ok(())
}

fn check_import_order(has_def: bool, kind: &str, span: Span) -> Result<(), ParseError> {
    if has_def {
        Err(ParseError::new(format!("import after {kind} definition"), span))
    } else {
        Ok(())
    }
}

/// Consumes inline `(export "name")` forms, registering each export at the
/// field's index.
fn collect_inline_exports(
    list: SExprList<'_>,
    mut idx: usize,
    index: ExportIndex,
    ctx: &mut ParseContext,
) -> Result<usize, ParseError> {
    while let Some(item) = list.get(idx) {
        if !item.is_list_headed_by("export") {
            break;
        }
        let export_list = item.as_list().unwrap();
        let name = parse_string_utf8(
            export_list
                .get(1)
                .ok_or_else(|| ParseError::new("expected export name", export_list.span))?,
        )?;
        ctx.exports.push(Export { name, index });
        idx += 1;
    }
    Ok(idx)
}

/// Detects an inline `(import "mod" "name")` form at `list[idx]`.
fn parse_inline_import(list: SExprList<'_>, idx: usize) -> Result<Option<(String, String)>, ParseError> {
    let Some(item) = list.get(idx) else { return Ok(None) };
    if !item.is_list_headed_by("import") {
        return Ok(None);
    }
    let import_list = item.as_list().unwrap();
    let module_name = parse_string_utf8(
        import_list
            .get(1)
            .ok_or_else(|| ParseError::new("expected import module string", import_list.span))?,
    )?;
    let field_name = parse_string_utf8(
        import_list
            .get(2)
            .ok_or_else(|| ParseError::new("expected import field string", import_list.span))?,
    )?;
    Ok(Some((module_name, field_name)))
}

/// Grammar: `export ::= '(' 'export' name '(' exportdesc ')' ')'`
fn parse_export(list: SExprList<'_>, ctx: &mut ParseContext) -> Result<(), ParseError> {
    let name = parse_string_utf8(
        list.get(1)
            .ok_or_else(|| ParseError::new("expected export name", list.span))?,
    )?;

    let desc = list
        .get(2)
        .ok_or_else(|| ParseError::new("expected export descriptor", list.span))?
        .expect_list()
        .map_err(|e| ParseError::new(e.message, e.span))?;

    let index = match desc.head_keyword() {
        Some("func") => ExportIndex::Function(parse_index_strict(desc.get(1), Namespace::Func, ctx, desc.span)?),
        Some("table") => ExportIndex::Table(parse_index_strict(desc.get(1), Namespace::Table, ctx, desc.span)?),
        Some("memory") => ExportIndex::Memory(parse_index_strict(desc.get(1), Namespace::Memory, ctx, desc.span)?),
        Some("global") => ExportIndex::Global(parse_index_strict(desc.get(1), Namespace::Global, ctx, desc.span)?),
        Some(kw) => return Err(ParseError::new(format!("unknown export kind: {kw}"), desc.span)),
        None => return Err(ParseError::new("expected export kind", desc.span)),
    };

    ctx.exports.push(Export { name, index });
    Ok(())
}

/// Grammar: `start ::= '(' 'start' funcidx ')'`
fn parse_start(list: SExprList<'_>, ctx: &mut ParseContext) -> Result<(), ParseError> {
    if ctx.start.is_some() {
        return Err(ParseError::new("multiple start sections", list.span));
    }
    ctx.start = Some(parse_index_strict(list.get(1), Namespace::Func, ctx, list.span)?);
    Ok(())
}

// ============================================================================
// Functions
// ============================================================================

/// Grammar: `func ::= '(' 'func' id? export* typeuse local* instr* ')'`
///          `func ::= '(' 'func' id? export* '(' 'import' nm nm ')' typeuse ')'`
fn parse_func(list: SExprList<'_>, ctx: &mut ParseContext) -> Result<(), ParseError> {
    ctx.reset_function();

    let mut idx = 1;
    let name = take_optional_name(list, &mut idx);
    let func_idx = ctx.register(Namespace::Func, name, list.span);
    if let Some(name) = name {
        ctx.names.function_names.insert(func_idx, name.to_string());
    }

    idx = collect_inline_exports(list, idx, ExportIndex::Function(func_idx), ctx)?;

    if let Some((module_name, field_name)) = parse_inline_import(list, idx)? {
        check_import_order(ctx.has_func_def, "function", list.span)?;
        idx += 1;
        let (type_idx, _) = parse_type_use(list, idx, false, ctx)?;
        ctx.imports.push(Import {
            module: module_name,
            name: field_name,
            external_kind: ExternalKind::Function(type_idx),
        });
        return Ok(());
    }

    ctx.has_func_def = true;

    let (type_idx, body_start) = parse_type_use(list, idx, true, ctx)?;

    // Locals precede all instructions.
    let mut local_types = Vec::new();
    let mut body_idx = body_start;
    while let Some(item) = list.get(body_idx) {
        if !item.is_list_headed_by("local") {
            break;
        }
        parse_local(item.as_list().unwrap(), &mut local_types, ctx)?;
        body_idx += 1;
    }

    // Record local names (parameters included) in the name section.
    let local_names: Vec<(u32, String)> = ctx
        .local_names
        .iter()
        .map(|(n, i)| (*i, n.clone()))
        .collect();
    if !local_names.is_empty() {
        let entry = ctx.names.local_names.entry(func_idx).or_default();
        for (index, name) in local_names {
            entry.insert(index, name);
        }
    }

    // Body: plain and folded instructions, terminated by an implicit end.
    let mut body = Vec::new();
    while body_idx < list.len() {
        body_idx = parse_body_item(list, body_idx, &mut body, ctx)?;
    }
    body.push(Instruction::End);

    ctx.functions.push(Function { ftype_index: type_idx });
    ctx.code.push(FunctionBody {
        locals: Locals::from_types(&local_types),
        instructions: body,
    });

    Ok(())
}

/// Grammar: `local ::= '(' 'local' id valtype ')' | '(' 'local' valtype* ')'`
fn parse_local(
    list: SExprList<'_>,
    locals: &mut Vec<ValueType>,
    ctx: &mut ParseContext,
) -> Result<(), ParseError> {
    let mut idx = 1;
    let name = take_optional_name(list, &mut idx);

    if name.is_some() {
        let item = list
            .get(idx)
            .ok_or_else(|| ParseError::new("expected value type after local name", list.span))?;
        let ty = parse_valtype(item)?;
        ctx.register(Namespace::Local, name, list.span);
        locals.push(ty);
        if list.get(idx + 1).is_some() {
            return Err(ParseError::new("named local must have exactly one type", list.span));
        }
    } else {
        while let Some(item) = list.get(idx) {
            let ty = parse_valtype(item)?;
            ctx.register(Namespace::Local, None, list.span);
            locals.push(ty);
            idx += 1;
        }
    }
    Ok(())
}

// ============================================================================
// Tables, memories, globals
// ============================================================================

/// Grammar: `table ::= '(' 'table' id? export* tabledesc ')'`
/// where tabledesc is an inline import plus limits, limits plus `funcref`,
/// or the `funcref (elem …)` sugar.
fn parse_table(list: SExprList<'_>, ctx: &mut ParseContext) -> Result<(), ParseError> {
    let mut idx = 1;
    let name = take_optional_name(list, &mut idx);
    let table_idx = ctx.register(Namespace::Table, name, list.span);
    idx = collect_inline_exports(list, idx, ExportIndex::Table(table_idx), ctx)?;

    if let Some((module_name, field_name)) = parse_inline_import(list, idx)? {
        check_import_order(ctx.has_table_def, "table", list.span)?;
        idx += 1;
        let (limits, next) = parse_limits(list, idx)?;
        parse_elem_type(list.get(next))?;
        ctx.imports.push(Import {
            module: module_name,
            name: field_name,
            external_kind: ExternalKind::Table(TableType {
                elem_type: ElemType::FuncRef,
                limits,
            }),
        });
        return Ok(());
    }

    ctx.has_table_def = true;

    // Sugar: (table funcref (elem $f1 $f2)) fixes the size to the element
    // count and adds a segment at offset 0.
    if list.get(idx).and_then(|s| s.as_keyword()) == Some("funcref") {
        let elem_list = list
            .get(idx + 1)
            .and_then(|s| s.as_list())
            .filter(|l| l.head_keyword() == Some("elem"))
            .ok_or_else(|| ParseError::new("expected (elem …) after funcref", list.span))?;

        let mut func_indices = Vec::new();
        for item in elem_list.iter_from(1) {
            func_indices.push(parse_index_strict(Some(item), Namespace::Func, ctx, item.span())?);
        }
        let n = func_indices.len() as u32;
        ctx.tables.push(TableType {
            elem_type: ElemType::FuncRef,
            limits: Limits::new(n, Some(n)),
        });
        ctx.elements.push(Element {
            table_index: table_idx,
            offset: vec![Instruction::I32Const { value: 0 }, Instruction::End],
            func_indices,
        });
        return Ok(());
    }

    let (limits, next) = parse_limits(list, idx)?;
    parse_elem_type(list.get(next))?;
    ctx.tables.push(TableType {
        elem_type: ElemType::FuncRef,
        limits,
    });
    Ok(())
}

/// `funcref` is the only accepted table element type.
fn parse_elem_type(sexpr: Option<&SExpr>) -> Result<(), ParseError> {
    match sexpr {
        Some(item) => match item.as_keyword() {
            Some("funcref") => Ok(()),
            Some(kw) => Err(ParseError::new(
                format!("funcref is the only supported element type, found '{kw}'"),
                item.span(),
            )),
            None => Err(ParseError::expected("funcref", "list", item.span())),
        },
        None => Err(ParseError::new("expected element type", Span::ZERO)),
    }
}

/// Grammar: `memory ::= '(' 'memory' id? export* memorydesc ')'`
/// where memorydesc is an inline import plus limits, plain limits, a
/// `(limits min max?)` clause, or the `(data …)` sugar.
fn parse_memory(list: SExprList<'_>, ctx: &mut ParseContext) -> Result<(), ParseError> {
    let mut idx = 1;
    let name = take_optional_name(list, &mut idx);
    let memory_idx = ctx.register(Namespace::Memory, name, list.span);
    idx = collect_inline_exports(list, idx, ExportIndex::Memory(memory_idx), ctx)?;

    if let Some((module_name, field_name)) = parse_inline_import(list, idx)? {
        check_import_order(ctx.has_memory_def, "memory", list.span)?;
        idx += 1;
        if list.get(idx).is_none() {
            // A bare import-memory has no size to allocate against.
            return Err(ParseError::new("imported memory requires limits", list.span));
        }
        let (limits, _) = parse_limits(list, idx)?;
        ctx.imports.push(Import {
            module: module_name,
            name: field_name,
            external_kind: ExternalKind::Memory(limits),
        });
        return Ok(());
    }

    ctx.has_memory_def = true;

    // Sugar: (memory (data "…")) sizes the memory to hold the bytes exactly
    // and adds a data segment at offset 0.
    if let Some(item) = list.get(idx) {
        if item.is_list_headed_by("data") {
            let data_list = item.as_list().unwrap();
            let mut bytes = Vec::new();
            for piece in data_list.iter_from(1) {
                bytes.extend_from_slice(&parse_byte_string(piece)?);
            }
            if list.get(idx + 1).is_some() {
                return Err(ParseError::new("unexpected token after inline data", list.span));
            }
            let pages = bytes.len().div_ceil(PAGE_SIZE) as u32;
            ctx.memories.push(Memory {
                limits: Limits::new(pages, Some(pages)),
            });
            ctx.data.push(Data {
                memory_index: memory_idx,
                offset: vec![Instruction::I32Const { value: 0 }, Instruction::End],
                init: bytes,
            });
            return Ok(());
        }
    }

    let (limits, next) = parse_limits(list, idx)?;
    if let Some(extra) = list.get(next) {
        if extra.is_list_headed_by("limits") {
            return Err(ParseError::new("duplicate limits", extra.span()));
        }
        return Err(ParseError::new("unexpected token after limits", extra.span()));
    }
    ctx.memories.push(Memory { limits });
    Ok(())
}

/// Grammar: `global ::= '(' 'global' id? export* globaltype expr ')'`
fn parse_global(list: SExprList<'_>, ctx: &mut ParseContext) -> Result<(), ParseError> {
    let mut idx = 1;
    let name = take_optional_name(list, &mut idx);
    let global_idx = ctx.register(Namespace::Global, name, list.span);
    idx = collect_inline_exports(list, idx, ExportIndex::Global(global_idx), ctx)?;

    if let Some((module_name, field_name)) = parse_inline_import(list, idx)? {
        check_import_order(ctx.has_global_def, "global", list.span)?;
        idx += 1;
        let global_type = parse_global_type(list, idx)?;
        ctx.imports.push(Import {
            module: module_name,
            name: field_name,
            external_kind: ExternalKind::Global(global_type),
        });
        return Ok(());
    }

    ctx.has_global_def = true;

    let global_type = parse_global_type(list, idx)?;
    idx += 1;

    let init_sexpr = list
        .get(idx)
        .ok_or_else(|| ParseError::new("expected initializer expression", list.span))?;
    if list.get(idx + 1).is_some() {
        return Err(ParseError::new(
            "unexpected token after initializer",
            list.get(idx + 1).unwrap().span(),
        ));
    }
    let init = parse_const_expr(init_sexpr, ctx)?;

    ctx.globals.push(Global { global_type, init });
    Ok(())
}

/// Grammar: `globaltype ::= valtype | '(' 'mut' valtype ')'`
fn parse_global_type(list: SExprList<'_>, idx: usize) -> Result<GlobalType, ParseError> {
    let item = list
        .get(idx)
        .ok_or_else(|| ParseError::new("expected global type", list.span))?;

    if let Some(inner) = item.as_list() {
        inner
            .expect_head("mut")
            .map_err(|e| ParseError::new(e.message, e.span))?;
        let value_type = parse_valtype(
            inner
                .get(1)
                .ok_or_else(|| ParseError::new("expected value type in mut", inner.span))?,
        )?;
        Ok(GlobalType {
            value_type,
            mutable: true,
        })
    } else {
        Ok(GlobalType {
            value_type: parse_valtype(item)?,
            mutable: false,
        })
    }
}

/// Parses limits: plain `min max?` integers or one `(limits min max?)`
/// clause. Returns the limits and the position after them. Signed integers
/// are rejected (counts are unsigned).
fn parse_limits(list: SExprList<'_>, idx: usize) -> Result<(Limits, usize), ParseError> {
    if let Some(item) = list.get(idx) {
        if item.is_list_headed_by("limits") {
            let clause = item.as_list().unwrap();
            let min = parse_u32_atom(clause.get(1), clause.span)?;
            let max = match clause.get(2) {
                Some(max_item) => Some(parse_u32_atom(Some(max_item), clause.span)?),
                None => None,
            };
            if clause.get(3).is_some() {
                return Err(ParseError::new("unexpected token in limits", clause.span));
            }
            // A second limits clause is malformed; the caller reports it by
            // position.
            if let Some(next) = list.get(idx + 1) {
                if next.is_list_headed_by("limits") {
                    return Err(ParseError::new("duplicate limits", next.span()));
                }
            }
            return Ok((Limits::new(min, max), idx + 1));
        }
    }

    let min = parse_u32_atom(list.get(idx), list.span)?;
    match list.get(idx + 1).and_then(|s| s.as_atom()) {
        Some(token) if matches!(token.kind, TokenKind::UnsignedInteger(_) | TokenKind::SignedInteger(_)) => {
            let max = parse_u32_atom(list.get(idx + 1), list.span)?;
            Ok((Limits::new(min, Some(max)), idx + 2))
        }
        _ => Ok((Limits::new(min, None), idx + 1)),
    }
}

/// An unsigned 32-bit count. Signed literals (`+10`, `-1`) are rejected.
fn parse_u32_atom(sexpr: Option<&SExpr>, fallback: Span) -> Result<u32, ParseError> {
    let item = sexpr.ok_or_else(|| ParseError::new("expected unsigned integer", fallback))?;
    let token = item
        .as_atom()
        .ok_or_else(|| ParseError::expected("unsigned integer", "list", item.span()))?;
    match &token.kind {
        TokenKind::UnsignedInteger(lit) => lit
            .to_u32()
            .ok_or_else(|| ParseError::new("integer out of unsigned 32-bit range", token.span)),
        TokenKind::SignedInteger(_) => Err(ParseError::new(
            "expected unsigned integer, found signed literal",
            token.span,
        )),
        other => Err(ParseError::expected("unsigned integer", &format!("'{other}'"), token.span)),
    }
}

// ============================================================================
// Element and data segments
// ============================================================================

/// Grammar: `elem ::= '(' 'elem' tableuse? offset 'func'? funcidx* ')'`
///          `tableuse ::= '(' 'table' tableidx ')' | tableidx`
fn parse_elem(list: SExprList<'_>, ctx: &mut ParseContext) -> Result<(), ParseError> {
    let mut idx = 1;

    // Optional table use.
    let mut table_index = 0u32;
    if let Some(item) = list.get(idx) {
        if item.is_list_headed_by("table") {
            let table_list = item.as_list().unwrap();
            table_index = parse_index_strict(table_list.get(1), Namespace::Table, ctx, table_list.span)?;
            idx += 1;
        } else if item
            .as_atom()
            .is_some_and(|t| matches!(t.kind, TokenKind::UnsignedInteger(_)))
        {
            table_index = parse_u32_atom(Some(item), list.span)?;
            idx += 1;
        }
    }

    let offset_sexpr = list
        .get(idx)
        .ok_or_else(|| ParseError::new("expected offset expression", list.span))?;
    let offset = parse_const_expr(offset_sexpr, ctx)?;
    idx += 1;

    // Optional 'func' keyword before the index list.
    if list.get(idx).and_then(|s| s.as_keyword()) == Some("func") {
        idx += 1;
    }

    let mut func_indices = Vec::new();
    for item in list.iter_from(idx) {
        func_indices.push(parse_index_strict(Some(item), Namespace::Func, ctx, item.span())?);
    }

    ctx.elements.push(Element {
        table_index,
        offset,
        func_indices,
    });
    Ok(())
}

/// Grammar: `data ::= '(' 'data' memuse? offset string* ')'`
///          `memuse ::= '(' 'memory' memidx ')' | memidx`
fn parse_data(list: SExprList<'_>, ctx: &mut ParseContext) -> Result<(), ParseError> {
    let mut idx = 1;

    let mut memory_index = 0u32;
    if let Some(item) = list.get(idx) {
        if item.is_list_headed_by("memory") {
            let mem_list = item.as_list().unwrap();
            memory_index = parse_index_strict(mem_list.get(1), Namespace::Memory, ctx, mem_list.span)?;
            idx += 1;
        } else if item
            .as_atom()
            .is_some_and(|t| matches!(t.kind, TokenKind::UnsignedInteger(_)))
        {
            memory_index = parse_u32_atom(Some(item), list.span)?;
            idx += 1;
        }
    }

    let offset_sexpr = list
        .get(idx)
        .ok_or_else(|| ParseError::new("expected offset expression", list.span))?;
    let offset = parse_const_expr(offset_sexpr, ctx)?;
    idx += 1;

    let mut init = Vec::new();
    for item in list.iter_from(idx) {
        init.extend_from_slice(&parse_byte_string(item)?);
    }

    ctx.data.push(Data {
        memory_index,
        offset,
        init,
    });
    Ok(())
}

/// Parses an initializer expression: `(offset instr)` or a folded single
/// instruction like `(i32.const 0)`. The result carries its `end`.
fn parse_const_expr(sexpr: &SExpr, ctx: &mut ParseContext) -> Result<Vec<Instruction>, ParseError> {
    let list = sexpr
        .as_list()
        .ok_or_else(|| ParseError::expected("offset expression", "atom", sexpr.span()))?;

    let mut instructions = Vec::new();
    if list.head_keyword() == Some("offset") {
        if list.len() < 2 {
            return Err(ParseError::new("expected expression after offset", list.span));
        }
        // Both (offset (i32.const 0)) and (offset i32.const 0) occur.
        let inner: Vec<SExpr> = list.iter_from(1).cloned().collect();
        parse_folded_body(&inner, &mut instructions, ctx)?;
    } else {
        parse_instruction(sexpr, &mut instructions, ctx)?;
    }
    instructions.push(Instruction::End);
    Ok(instructions)
}

// ============================================================================
// Strings
// ============================================================================

/// A string literal whose bytes are used verbatim.
fn parse_byte_string(sexpr: &SExpr) -> Result<Vec<u8>, ParseError> {
    match sexpr.as_atom().map(|t| &t.kind) {
        Some(TokenKind::String(bytes)) => Ok(bytes.clone()),
        _ => Err(ParseError::expected("string literal", "other form", sexpr.span())),
    }
}

/// A string literal used as a name: must decode as UTF-8.
fn parse_string_utf8(sexpr: &SExpr) -> Result<String, ParseError> {
    let bytes = parse_byte_string(sexpr)?;
    String::from_utf8(bytes).map_err(|_| ParseError::new("name is not valid utf-8", sexpr.span()))
}

// ============================================================================
// Instructions
// ============================================================================

/// Argument source for instruction parsing, abstracting folded
/// (`(i32.add (…) (…))` — children) and flat (`local.get 0` — siblings)
/// syntax.
enum ArgSource<'a> {
    Folded(&'a [SExpr]),
    Flat { list: SExprList<'a>, start: usize },
}

impl<'a> ArgSource<'a> {
    fn get(&self, idx: usize) -> Option<&'a SExpr> {
        match self {
            ArgSource::Folded(args) => args.get(idx),
            ArgSource::Flat { list, start } => list.get(*start + idx),
        }
    }
}

/// Parses one body item (an instruction and any flat arguments). Returns
/// the next unconsumed index.
fn parse_body_item(
    list: SExprList<'_>,
    idx: usize,
    out: &mut Vec<Instruction>,
    ctx: &mut ParseContext,
) -> Result<usize, ParseError> {
    let item = list
        .get(idx)
        .ok_or_else(|| ParseError::new("expected instruction", list.span))?;

    match item {
        SExpr::Atom(token) => match &token.kind {
            TokenKind::Keyword(kw) => match kw.as_str() {
                "block" | "loop" => parse_flat_block(kw, list, idx + 1, out, ctx),
                "if" => parse_flat_if(list, idx + 1, out, ctx),
                // Handled by the enclosing flat block/if parsers; reaching
                // one here is a stray terminator.
                "else" | "end" => Err(ParseError::new(format!("mismatched '{kw}'"), token.span)),
                _ => {
                    let args = ArgSource::Flat { list, start: idx + 1 };
                    let (instruction, consumed) = parse_instruction_kind(kw, args, token.span, ctx)?;
                    out.push(instruction);
                    Ok(idx + 1 + consumed)
                }
            },
            TokenKind::Reserved(text) => Err(ParseError::new(format!("unexpected token: {text}"), token.span)),
            other => Err(ParseError::expected("instruction", &format!("'{other}'"), token.span)),
        },
        SExpr::List { .. } => {
            parse_instruction(item, out, ctx)?;
            Ok(idx + 1)
        }
    }
}

/// Parses a folded instruction (or bare keyword atom), appending the
/// linearised sequence to `out`: children first, then the parent.
fn parse_instruction(sexpr: &SExpr, out: &mut Vec<Instruction>, ctx: &mut ParseContext) -> Result<(), ParseError> {
    match sexpr {
        SExpr::Atom(token) => {
            if let TokenKind::Keyword(kw) = &token.kind {
                let (instruction, _) = parse_instruction_kind(kw, ArgSource::Folded(&[]), token.span, ctx)?;
                out.push(instruction);
                Ok(())
            } else {
                Err(ParseError::expected("instruction", "atom", token.span))
            }
        }
        SExpr::List { items, span } => {
            let Some(head) = items.first() else {
                return Err(ParseError::new("empty instruction", *span));
            };
            let kw = head
                .as_keyword()
                .ok_or_else(|| ParseError::expected("instruction keyword", "list", head.span()))?;

            match kw {
                "block" | "loop" => parse_folded_block(kw, &items[1..], out, ctx),
                "if" => parse_folded_if(&items[1..], *span, out, ctx),
                _ => {
                    // Folded form: nested operand expressions come first.
                    for arg in &items[1..] {
                        if arg.as_list().is_some() && !is_immediate_list(arg) {
                            parse_instruction(arg, out, ctx)?;
                        }
                    }
                    let (instruction, _) = parse_instruction_kind(kw, ArgSource::Folded(&items[1..]), *span, ctx)?;
                    out.push(instruction);
                    Ok(())
                }
            }
        }
    }
}

/// Lists that are immediates rather than nested operand instructions.
fn is_immediate_list(sexpr: &SExpr) -> bool {
    sexpr.is_list_headed_by("type") || sexpr.is_list_headed_by("param") || sexpr.is_list_headed_by("result")
}

/// Flat `block`/`loop` … `end` inside a function body.
fn parse_flat_block(
    kw: &str,
    list: SExprList<'_>,
    start: usize,
    out: &mut Vec<Instruction>,
    ctx: &mut ParseContext,
) -> Result<usize, ParseError> {
    let mut idx = start;

    let label = list.get(idx).and_then(|s| s.as_id()).map(String::from);
    if label.is_some() {
        idx += 1;
    }

    let (block_type, consumed) = parse_block_type(list, idx, ctx)?;
    idx += consumed;

    ctx.push_label(label.clone());
    out.push(if kw == "block" {
        Instruction::Block { block_type }
    } else {
        Instruction::Loop { block_type }
    });

    let mut closed = false;
    while let Some(item) = list.get(idx) {
        if item.as_keyword() == Some("end") {
            idx += 1;
            check_end_label(list, &mut idx, &label)?;
            closed = true;
            break;
        }
        idx = parse_body_item(list, idx, out, ctx)?;
    }
    ctx.pop_label();
    if !closed {
        return Err(ParseError::new(format!("'{kw}' without matching 'end'"), list.span));
    }

    out.push(Instruction::End);
    Ok(idx)
}

/// Flat `if` … `else`? … `end` inside a function body.
fn parse_flat_if(
    list: SExprList<'_>,
    start: usize,
    out: &mut Vec<Instruction>,
    ctx: &mut ParseContext,
) -> Result<usize, ParseError> {
    let mut idx = start;

    let label = list.get(idx).and_then(|s| s.as_id()).map(String::from);
    if label.is_some() {
        idx += 1;
    }

    let (block_type, consumed) = parse_block_type(list, idx, ctx)?;
    idx += consumed;

    ctx.push_label(label.clone());
    out.push(Instruction::If { block_type });

    let mut closed = false;
    while let Some(item) = list.get(idx) {
        if let Some(kw) = item.as_keyword() {
            if kw == "else" {
                out.push(Instruction::Else);
                idx += 1;
                check_end_label(list, &mut idx, &label)?;
                continue;
            }
            if kw == "end" {
                idx += 1;
                check_end_label(list, &mut idx, &label)?;
                closed = true;
                break;
            }
        }
        idx = parse_body_item(list, idx, out, ctx)?;
    }
    ctx.pop_label();
    if !closed {
        return Err(ParseError::new("'if' without matching 'end'", list.span));
    }

    out.push(Instruction::End);
    Ok(idx)
}

/// An optional repeated label after `end`/`else` must match the block's.
fn check_end_label(list: SExprList<'_>, idx: &mut usize, expected: &Option<String>) -> Result<(), ParseError> {
    if let Some(end_label) = list.get(*idx).and_then(|s| s.as_id()) {
        if expected.as_deref() != Some(end_label) {
            return Err(ParseError::new(
                format!("mismatching label ${end_label}"),
                list.get(*idx).unwrap().span(),
            ));
        }
        *idx += 1;
    }
    Ok(())
}

/// Folded `(block …)` / `(loop …)`.
fn parse_folded_block(
    kw: &str,
    args: &[SExpr],
    out: &mut Vec<Instruction>,
    ctx: &mut ParseContext,
) -> Result<(), ParseError> {
    let mut idx = 0;

    let label = args.get(idx).and_then(|s| s.as_id()).map(String::from);
    if label.is_some() {
        idx += 1;
    }

    let (block_type, consumed) = parse_block_type_slice(args, idx, ctx)?;
    idx += consumed;

    ctx.push_label(label);
    out.push(if kw == "block" {
        Instruction::Block { block_type }
    } else {
        Instruction::Loop { block_type }
    });

    let result = parse_folded_body(&args[idx..], out, ctx);
    ctx.pop_label();
    result?;

    out.push(Instruction::End);
    Ok(())
}

/// Folded `(if cond (then …) (else …)?)`.
fn parse_folded_if(
    args: &[SExpr],
    span: Span,
    out: &mut Vec<Instruction>,
    ctx: &mut ParseContext,
) -> Result<(), ParseError> {
    let mut idx = 0;

    let label = args.get(idx).and_then(|s| s.as_id()).map(String::from);
    if label.is_some() {
        idx += 1;
    }

    let (block_type, consumed) = parse_block_type_slice(args, idx, ctx)?;
    idx += consumed;

    // Condition: folded expressions before (then …).
    while idx < args.len() && !args[idx].is_list_headed_by("then") {
        let item = &args[idx];
        if item.as_list().is_none() {
            return Err(ParseError::new("expected folded condition before 'then'", item.span()));
        }
        parse_instruction(item, out, ctx)?;
        idx += 1;
    }

    ctx.push_label(label);
    out.push(Instruction::If { block_type });

    let finish = (|| -> Result<(), ParseError> {
        let then_list = args
            .get(idx)
            .and_then(|s| s.as_list())
            .filter(|l| l.head_keyword() == Some("then"))
            .ok_or_else(|| ParseError::new("expected (then …) in if", span))?;
        let then_items: Vec<SExpr> = then_list.iter_from(1).cloned().collect();
        parse_folded_body(&then_items, out, ctx)?;
        idx += 1;

        if let Some(else_item) = args.get(idx) {
            let else_list = else_item
                .as_list()
                .filter(|l| l.head_keyword() == Some("else"))
                .ok_or_else(|| ParseError::new("expected (else …) in if", else_item.span()))?;
            out.push(Instruction::Else);
            let else_items: Vec<SExpr> = else_list.iter_from(1).cloned().collect();
            parse_folded_body(&else_items, out, ctx)?;
            idx += 1;
        }
        if let Some(extra) = args.get(idx) {
            return Err(ParseError::new("unexpected token after else", extra.span()));
        }
        Ok(())
    })();
    ctx.pop_label();
    finish?;

    out.push(Instruction::End);
    Ok(())
}

/// A sequence of instructions inside a folded body, where flat
/// instructions may still consume sibling immediates
/// (e.g. `(block i32.const 0 drop)`).
fn parse_folded_body(args: &[SExpr], out: &mut Vec<Instruction>, ctx: &mut ParseContext) -> Result<(), ParseError> {
    let mut i = 0;
    while i < args.len() {
        match &args[i] {
            SExpr::List { .. } => {
                parse_instruction(&args[i], out, ctx)?;
                i += 1;
            }
            SExpr::Atom(token) => {
                if let TokenKind::Keyword(kw) = &token.kind {
                    match kw.as_str() {
                        "block" | "loop" => {
                            // The flat block consumes through its matching
                            // end within this slice.
                            let list = SExprList {
                                span: token.span,
                                items: args,
                            };
                            i = parse_flat_block(kw, list, i + 1, out, ctx)?;
                        }
                        "if" => {
                            let list = SExprList {
                                span: token.span,
                                items: args,
                            };
                            i = parse_flat_if(list, i + 1, out, ctx)?;
                        }
                        _ => {
                            let (instruction, consumed) =
                                parse_instruction_kind(kw, ArgSource::Folded(&args[i + 1..]), token.span, ctx)?;
                            out.push(instruction);
                            i += 1 + consumed;
                        }
                    }
                } else {
                    return Err(ParseError::expected("instruction", &format!("'{}'", token.kind), token.span));
                }
            }
        }
    }
    Ok(())
}

/// Block type: nothing or `(result valtype)` (single value in the MVP).
fn parse_block_type(list: SExprList<'_>, idx: usize, ctx: &mut ParseContext) -> Result<(BlockType, usize), ParseError> {
    parse_block_type_slice(list.items, idx, ctx)
}

fn parse_block_type_slice(
    args: &[SExpr],
    idx: usize,
    _ctx: &mut ParseContext,
) -> Result<(BlockType, usize), ParseError> {
    let Some(first) = args.get(idx) else {
        return Ok((BlockType::Empty, 0));
    };

    if first.is_list_headed_by("result") {
        let inner = first.as_list().unwrap();
        let mut types = Vec::new();
        for item in inner.iter_from(1) {
            types.push(parse_valtype(item)?);
        }
        match types.len() {
            0 => Ok((BlockType::Empty, 1)),
            1 => Ok((BlockType::Value(types[0]), 1)),
            n => Err(ParseError::new(
                format!("blocks yield at most one value, found {n}"),
                inner.span,
            )),
        }
    } else {
        Ok((BlockType::Empty, 0))
    }
}

// ============================================================================
// Immediates
// ============================================================================

/// Resolves an index immediate: a `$name` in the namespace or a bare
/// unsigned index. A missing immediate is reported once and becomes 0 so
/// assembly continues.
fn parse_index(args: &ArgSource<'_>, at: usize, ns: Namespace, span: Span, ctx: &mut ParseContext) -> (u32, usize) {
    match parse_index_strict(args.get(at), ns, ctx, span) {
        Ok(index) => (index, 1),
        Err(e) => {
            ctx.diagnostics.error(e);
            (0, if args.get(at).is_some() { 1 } else { 0 })
        }
    }
}

/// Resolves an index immediate, failing on absence or malformation.
fn parse_index_strict(
    sexpr: Option<&SExpr>,
    ns: Namespace,
    ctx: &ParseContext,
    fallback: Span,
) -> Result<u32, ParseError> {
    let item = sexpr.ok_or_else(|| ParseError::new(format!("expected {} index", ns.name()), fallback))?;
    if let Some(name) = item.as_id() {
        return ctx.resolve(ns, name, item.span());
    }
    let token = item
        .as_atom()
        .ok_or_else(|| ParseError::expected(&format!("{} index", ns.name()), "list", item.span()))?;
    match &token.kind {
        TokenKind::UnsignedInteger(lit) => lit
            .to_u32()
            .ok_or_else(|| ParseError::new("index out of unsigned 32-bit range", token.span)),
        other => Err(ParseError::expected(
            &format!("{} index", ns.name()),
            &format!("'{other}'"),
            token.span,
        )),
    }
}

/// Branch target: a label name or a numeric relative depth.
fn parse_label(args: &ArgSource<'_>, at: usize, span: Span, ctx: &mut ParseContext) -> (u32, usize) {
    let resolve = |item: &SExpr, ctx: &ParseContext| -> Result<u32, ParseError> {
        if let Some(name) = item.as_id() {
            return ctx.resolve_label(name, item.span());
        }
        match item.as_atom().map(|t| &t.kind) {
            Some(TokenKind::UnsignedInteger(lit)) => lit
                .to_u32()
                .ok_or_else(|| ParseError::new("branch depth out of range", item.span())),
            _ => Err(ParseError::expected("label", "other form", item.span())),
        }
    };

    match args.get(at) {
        Some(item) => match resolve(item, ctx) {
            Ok(depth) => (depth, 1),
            Err(e) => {
                ctx.diagnostics.error(e);
                (0, 1)
            }
        },
        None => {
            ctx.diagnostics
                .error(ParseError::new("expected branch target", span));
            (0, 0)
        }
    }
}

/// True when the argument can be a branch target (used by br_table to count
/// its target list).
fn is_label_arg(sexpr: &SExpr, ctx: &ParseContext) -> bool {
    if let Some(name) = sexpr.as_id() {
        return ctx.resolve_label(name, sexpr.span()).is_ok();
    }
    matches!(
        sexpr.as_atom().map(|t| &t.kind),
        Some(TokenKind::UnsignedInteger(_))
    )
}

/// i32 immediate; missing or out-of-range values are reported and become 0.
fn parse_i32(args: &ArgSource<'_>, span: Span, ctx: &mut ParseContext) -> (i32, usize) {
    match args.get(0).and_then(|s| s.as_atom()) {
        Some(token) => {
            let value = match &token.kind {
                TokenKind::UnsignedInteger(lit) | TokenKind::SignedInteger(lit) => lit.to_i32(),
                _ => None,
            };
            match value {
                Some(v) => (v, 1),
                None => {
                    ctx.diagnostics
                        .error(ParseError::new("i32 constant out of range", token.span));
                    (0, 1)
                }
            }
        }
        None => {
            ctx.diagnostics
                .error(ParseError::new("expected i32 constant", span));
            (0, 0)
        }
    }
}

fn parse_i64(args: &ArgSource<'_>, span: Span, ctx: &mut ParseContext) -> (i64, usize) {
    match args.get(0).and_then(|s| s.as_atom()) {
        Some(token) => {
            let value = match &token.kind {
                TokenKind::UnsignedInteger(lit) | TokenKind::SignedInteger(lit) => lit.to_i64(),
                _ => None,
            };
            match value {
                Some(v) => (v, 1),
                None => {
                    ctx.diagnostics
                        .error(ParseError::new("i64 constant out of range", token.span));
                    (0, 1)
                }
            }
        }
        None => {
            ctx.diagnostics
                .error(ParseError::new("expected i64 constant", span));
            (0, 0)
        }
    }
}

fn parse_f32(args: &ArgSource<'_>, span: Span, ctx: &mut ParseContext) -> (f32, usize) {
    match args.get(0).and_then(|s| s.as_atom()) {
        Some(token) => {
            let value = match &token.kind {
                TokenKind::Float(lit) => lit.to_f32(),
                TokenKind::UnsignedInteger(lit) | TokenKind::SignedInteger(lit) => {
                    let magnitude = lit.magnitude as f32;
                    Some(if lit.negative { -magnitude } else { magnitude })
                }
                _ => None,
            };
            match value {
                Some(v) => (v, 1),
                None => {
                    ctx.diagnostics
                        .error(ParseError::new("invalid f32 constant", token.span));
                    (0.0, 1)
                }
            }
        }
        None => {
            ctx.diagnostics
                .error(ParseError::new("expected f32 constant", span));
            (0.0, 0)
        }
    }
}

fn parse_f64(args: &ArgSource<'_>, span: Span, ctx: &mut ParseContext) -> (f64, usize) {
    match args.get(0).and_then(|s| s.as_atom()) {
        Some(token) => {
            let value = match &token.kind {
                TokenKind::Float(lit) => lit.to_f64(),
                TokenKind::UnsignedInteger(lit) | TokenKind::SignedInteger(lit) => {
                    let magnitude = lit.magnitude as f64;
                    Some(if lit.negative { -magnitude } else { magnitude })
                }
                _ => None,
            };
            match value {
                Some(v) => (v, 1),
                None => {
                    ctx.diagnostics
                        .error(ParseError::new("invalid f64 constant", token.span));
                    (0.0, 1)
                }
            }
        }
        None => {
            ctx.diagnostics
                .error(ParseError::new("expected f64 constant", span));
            (0.0, 0)
        }
    }
}

/// Memory immediates: optional `offset=N` then optional `align=N` keywords.
/// `align` must be a power of two and is stored as log2.
fn parse_memarg(args: &ArgSource<'_>, natural_align: u32) -> Result<(MemArg, usize), ParseError> {
    let mut offset = 0u32;
    let mut align = natural_align;
    let mut consumed = 0;

    if let Some((text, span)) = memarg_field(args.get(consumed), "offset=") {
        offset = parse_memarg_number(text, span)?;
        consumed += 1;
    }
    if let Some((text, span)) = memarg_field(args.get(consumed), "align=") {
        let bytes = parse_memarg_number(text, span)?;
        if bytes == 0 || !bytes.is_power_of_two() {
            return Err(ParseError::new("alignment must be a power of two", span));
        }
        align = bytes.trailing_zeros();
        consumed += 1;
    }

    Ok((MemArg { align, offset }, consumed))
}

fn memarg_field<'a>(sexpr: Option<&'a SExpr>, prefix: &str) -> Option<(&'a str, Span)> {
    let item = sexpr?;
    let kw = item.as_keyword()?;
    kw.strip_prefix(prefix).map(|rest| (rest, item.span()))
}

fn parse_memarg_number(text: &str, span: Span) -> Result<u32, ParseError> {
    let clean: String = text.chars().filter(|&c| c != '_').collect();
    let parsed = if let Some(hex) = clean.strip_prefix("0x") {
        u32::from_str_radix(hex, 16).ok()
    } else {
        clean.parse().ok()
    };
    parsed.ok_or_else(|| ParseError::new(format!("invalid memory immediate: {text}"), span))
}

// ============================================================================
// The instruction table
// ============================================================================

/// Single source of truth for instruction parsing, shared by flat and
/// folded syntax. Returns the instruction and the number of immediate
/// arguments consumed.
fn parse_instruction_kind(
    kw: &str,
    args: ArgSource<'_>,
    span: Span,
    ctx: &mut ParseContext,
) -> Result<(Instruction, usize), ParseError> {
    use Instruction::*;

    let instruction = match kw {
        // Control
        "unreachable" => (Unreachable, 0),
        "nop" => (Nop, 0),
        "return" => (Return, 0),
        "br" => {
            let (label_idx, consumed) = parse_label(&args, 0, span, ctx);
            (Br { label_idx }, consumed)
        }
        "br_if" => {
            let (label_idx, consumed) = parse_label(&args, 0, span, ctx);
            (BrIf { label_idx }, consumed)
        }
        "br_table" => {
            let mut count = 0;
            while let Some(item) = args.get(count) {
                if !is_label_arg(item, ctx) {
                    break;
                }
                count += 1;
            }
            if count == 0 {
                ctx.diagnostics
                    .error(ParseError::new("br_table requires at least one target", span));
                return Ok((BrTable { labels: vec![], default: 0 }, 0));
            }
            let mut labels = Vec::with_capacity(count);
            for i in 0..count {
                labels.push(parse_label(&args, i, span, ctx).0);
            }
            let default = labels.pop().unwrap();
            (BrTable { labels, default }, count)
        }
        "call" => {
            let (func_idx, consumed) = parse_index(&args, 0, Namespace::Func, span, ctx);
            (Call { func_idx }, consumed)
        }
        "call_indirect" => {
            // call_indirect typeuse; the table operand is implicit in the
            // MVP.
            let mut consumed = 0;
            let mut params = Vec::new();
            let mut results = Vec::new();
            let mut explicit = None;
            let mut seen_result = false;
            while let Some(item) = args.get(consumed) {
                let Some(inner) = item.as_list() else { break };
                match inner.head_keyword() {
                    Some("type") => {
                        if explicit.is_some() || !params.is_empty() || seen_result {
                            return Err(ParseError::new("misplaced type use", inner.span));
                        }
                        explicit = Some(parse_index_strict(inner.get(1), Namespace::Type, ctx, inner.span)?);
                        consumed += 1;
                    }
                    Some("param") => {
                        if seen_result {
                            return Err(ParseError::new("param after result", inner.span));
                        }
                        for p in inner.iter_from(1) {
                            if p.as_id().is_some() {
                                return Err(ParseError::new("unexpected param name", p.span()));
                            }
                            params.push(parse_valtype(p)?);
                        }
                        consumed += 1;
                    }
                    Some("result") => {
                        seen_result = true;
                        for r in inner.iter_from(1) {
                            results.push(parse_valtype(r)?);
                        }
                        consumed += 1;
                    }
                    _ => break,
                }
            }
            let type_idx = match explicit {
                Some(explicit) => {
                    if !params.is_empty() || seen_result {
                        let inline = FunctionType {
                            parameters: params,
                            return_types: results,
                        };
                        let declared = ctx.types.get(explicit as usize);
                        if declared != Some(&inline) {
                            return Err(ParseError::new(
                                format!("inline type use disagrees with type {explicit}"),
                                span,
                            ));
                        }
                    }
                    explicit
                }
                None => ctx.find_or_add_type(FunctionType {
                    parameters: params,
                    return_types: results,
                }),
            };
            (CallIndirect { type_idx }, consumed)
        }

        // Parametric
        "drop" => (Drop, 0),
        "select" => (Select, 0),

        // Variable
        "local.get" => {
            let (local_idx, consumed) = parse_index(&args, 0, Namespace::Local, span, ctx);
            (LocalGet { local_idx }, consumed)
        }
        "local.set" => {
            let (local_idx, consumed) = parse_index(&args, 0, Namespace::Local, span, ctx);
            (LocalSet { local_idx }, consumed)
        }
        "local.tee" => {
            let (local_idx, consumed) = parse_index(&args, 0, Namespace::Local, span, ctx);
            (LocalTee { local_idx }, consumed)
        }
        "global.get" => {
            let (global_idx, consumed) = parse_index(&args, 0, Namespace::Global, span, ctx);
            (GlobalGet { global_idx }, consumed)
        }
        "global.set" => {
            let (global_idx, consumed) = parse_index(&args, 0, Namespace::Global, span, ctx);
            (GlobalSet { global_idx }, consumed)
        }

        // Constants
        "i32.const" => {
            let (value, consumed) = parse_i32(&args, span, ctx);
            (I32Const { value }, consumed)
        }
        "i64.const" => {
            let (value, consumed) = parse_i64(&args, span, ctx);
            (I64Const { value }, consumed)
        }
        "f32.const" => {
            let (value, consumed) = parse_f32(&args, span, ctx);
            (F32Const { value }, consumed)
        }
        "f64.const" => {
            let (value, consumed) = parse_f64(&args, span, ctx);
            (F64Const { value }, consumed)
        }

        // Memory operators with memarg immediates
        "i32.load" => memarg_instruction(&args, ALIGN_32, |memarg| I32Load { memarg })?,
        "i64.load" => memarg_instruction(&args, ALIGN_64, |memarg| I64Load { memarg })?,
        "f32.load" => memarg_instruction(&args, ALIGN_32, |memarg| F32Load { memarg })?,
        "f64.load" => memarg_instruction(&args, ALIGN_64, |memarg| F64Load { memarg })?,
        "i32.load8_s" => memarg_instruction(&args, ALIGN_8, |memarg| I32Load8S { memarg })?,
        "i32.load8_u" => memarg_instruction(&args, ALIGN_8, |memarg| I32Load8U { memarg })?,
        "i32.load16_s" => memarg_instruction(&args, ALIGN_16, |memarg| I32Load16S { memarg })?,
        "i32.load16_u" => memarg_instruction(&args, ALIGN_16, |memarg| I32Load16U { memarg })?,
        "i64.load8_s" => memarg_instruction(&args, ALIGN_8, |memarg| I64Load8S { memarg })?,
        "i64.load8_u" => memarg_instruction(&args, ALIGN_8, |memarg| I64Load8U { memarg })?,
        "i64.load16_s" => memarg_instruction(&args, ALIGN_16, |memarg| I64Load16S { memarg })?,
        "i64.load16_u" => memarg_instruction(&args, ALIGN_16, |memarg| I64Load16U { memarg })?,
        "i64.load32_s" => memarg_instruction(&args, ALIGN_32, |memarg| I64Load32S { memarg })?,
        "i64.load32_u" => memarg_instruction(&args, ALIGN_32, |memarg| I64Load32U { memarg })?,
        "i32.store" => memarg_instruction(&args, ALIGN_32, |memarg| I32Store { memarg })?,
        "i64.store" => memarg_instruction(&args, ALIGN_64, |memarg| I64Store { memarg })?,
        "f32.store" => memarg_instruction(&args, ALIGN_32, |memarg| F32Store { memarg })?,
        "f64.store" => memarg_instruction(&args, ALIGN_64, |memarg| F64Store { memarg })?,
        "i32.store8" => memarg_instruction(&args, ALIGN_8, |memarg| I32Store8 { memarg })?,
        "i32.store16" => memarg_instruction(&args, ALIGN_16, |memarg| I32Store16 { memarg })?,
        "i64.store8" => memarg_instruction(&args, ALIGN_8, |memarg| I64Store8 { memarg })?,
        "i64.store16" => memarg_instruction(&args, ALIGN_16, |memarg| I64Store16 { memarg })?,
        "i64.store32" => memarg_instruction(&args, ALIGN_32, |memarg| I64Store32 { memarg })?,

        "memory.size" => (MemorySize, 0),
        "memory.grow" => (MemoryGrow, 0),

        _ => match nullary_instruction(kw) {
            Some(instruction) => (instruction, 0),
            None => return Err(ParseError::new(format!("unknown instruction: {kw}"), span)),
        },
    };

    Ok(instruction)
}

fn memarg_instruction(
    args: &ArgSource<'_>,
    natural_align: u32,
    build: impl FnOnce(MemArg) -> Instruction,
) -> Result<(Instruction, usize), ParseError> {
    let (memarg, consumed) = parse_memarg(args, natural_align)?;
    Ok((build(memarg), consumed))
}

/// Operators with no immediates, by text mnemonic.
fn nullary_instruction(kw: &str) -> Option<Instruction> {
    use Instruction::*;
    let instruction = match kw {
        // i32 test/comparison
        "i32.eqz" => I32Eqz,
        "i32.eq" => I32Eq,
        "i32.ne" => I32Ne,
        "i32.lt_s" => I32LtS,
        "i32.lt_u" => I32LtU,
        "i32.gt_s" => I32GtS,
        "i32.gt_u" => I32GtU,
        "i32.le_s" => I32LeS,
        "i32.le_u" => I32LeU,
        "i32.ge_s" => I32GeS,
        "i32.ge_u" => I32GeU,
        // i64 test/comparison
        "i64.eqz" => I64Eqz,
        "i64.eq" => I64Eq,
        "i64.ne" => I64Ne,
        "i64.lt_s" => I64LtS,
        "i64.lt_u" => I64LtU,
        "i64.gt_s" => I64GtS,
        "i64.gt_u" => I64GtU,
        "i64.le_s" => I64LeS,
        "i64.le_u" => I64LeU,
        "i64.ge_s" => I64GeS,
        "i64.ge_u" => I64GeU,
        // f32 comparison
        "f32.eq" => F32Eq,
        "f32.ne" => F32Ne,
        "f32.lt" => F32Lt,
        "f32.gt" => F32Gt,
        "f32.le" => F32Le,
        "f32.ge" => F32Ge,
        // f64 comparison
        "f64.eq" => F64Eq,
        "f64.ne" => F64Ne,
        "f64.lt" => F64Lt,
        "f64.gt" => F64Gt,
        "f64.le" => F64Le,
        "f64.ge" => F64Ge,
        // i32 arithmetic
        "i32.clz" => I32Clz,
        "i32.ctz" => I32Ctz,
        "i32.popcnt" => I32Popcnt,
        "i32.add" => I32Add,
        "i32.sub" => I32Sub,
        "i32.mul" => I32Mul,
        "i32.div_s" => I32DivS,
        "i32.div_u" => I32DivU,
        "i32.rem_s" => I32RemS,
        "i32.rem_u" => I32RemU,
        "i32.and" => I32And,
        "i32.or" => I32Or,
        "i32.xor" => I32Xor,
        "i32.shl" => I32Shl,
        "i32.shr_s" => I32ShrS,
        "i32.shr_u" => I32ShrU,
        "i32.rotl" => I32Rotl,
        "i32.rotr" => I32Rotr,
        // i64 arithmetic
        "i64.clz" => I64Clz,
        "i64.ctz" => I64Ctz,
        "i64.popcnt" => I64Popcnt,
        "i64.add" => I64Add,
        "i64.sub" => I64Sub,
        "i64.mul" => I64Mul,
        "i64.div_s" => I64DivS,
        "i64.div_u" => I64DivU,
        "i64.rem_s" => I64RemS,
        "i64.rem_u" => I64RemU,
        "i64.and" => I64And,
        "i64.or" => I64Or,
        "i64.xor" => I64Xor,
        "i64.shl" => I64Shl,
        "i64.shr_s" => I64ShrS,
        "i64.shr_u" => I64ShrU,
        "i64.rotl" => I64Rotl,
        "i64.rotr" => I64Rotr,
        // f32 arithmetic
        "f32.abs" => F32Abs,
        "f32.neg" => F32Neg,
        "f32.ceil" => F32Ceil,
        "f32.floor" => F32Floor,
        "f32.trunc" => F32Trunc,
        "f32.nearest" => F32Nearest,
        "f32.sqrt" => F32Sqrt,
        "f32.add" => F32Add,
        "f32.sub" => F32Sub,
        "f32.mul" => F32Mul,
        "f32.div" => F32Div,
        "f32.min" => F32Min,
        "f32.max" => F32Max,
        "f32.copysign" => F32Copysign,
        // f64 arithmetic
        "f64.abs" => F64Abs,
        "f64.neg" => F64Neg,
        "f64.ceil" => F64Ceil,
        "f64.floor" => F64Floor,
        "f64.trunc" => F64Trunc,
        "f64.nearest" => F64Nearest,
        "f64.sqrt" => F64Sqrt,
        "f64.add" => F64Add,
        "f64.sub" => F64Sub,
        "f64.mul" => F64Mul,
        "f64.div" => F64Div,
        "f64.min" => F64Min,
        "f64.max" => F64Max,
        "f64.copysign" => F64Copysign,
        // Conversions
        "i32.wrap_i64" => I32WrapI64,
        "i32.trunc_f32_s" => I32TruncF32S,
        "i32.trunc_f32_u" => I32TruncF32U,
        "i32.trunc_f64_s" => I32TruncF64S,
        "i32.trunc_f64_u" => I32TruncF64U,
        "i64.extend_i32_s" => I64ExtendI32S,
        "i64.extend_i32_u" => I64ExtendI32U,
        "i64.trunc_f32_s" => I64TruncF32S,
        "i64.trunc_f32_u" => I64TruncF32U,
        "i64.trunc_f64_s" => I64TruncF64S,
        "i64.trunc_f64_u" => I64TruncF64U,
        "f32.convert_i32_s" => F32ConvertI32S,
        "f32.convert_i32_u" => F32ConvertI32U,
        "f32.convert_i64_s" => F32ConvertI64S,
        "f32.convert_i64_u" => F32ConvertI64U,
        "f32.demote_f64" => F32DemoteF64,
        "f64.convert_i32_s" => F64ConvertI32S,
        "f64.convert_i32_u" => F64ConvertI32U,
        "f64.convert_i64_s" => F64ConvertI64S,
        "f64.convert_i64_u" => F64ConvertI64U,
        "f64.promote_f32" => F64PromoteF32,
        "i32.reinterpret_f32" => I32ReinterpretF32,
        "i64.reinterpret_f64" => I64ReinterpretF64,
        "f32.reinterpret_i32" => F32ReinterpretI32,
        "f64.reinterpret_i64" => F64ReinterpretI64,
        _ => return None,
    };
    Some(instruction)
}

// ============================================================================
// Small shared helpers
// ============================================================================

/// Consumes an optional `$id` at `list[*idx]`.
fn take_optional_name<'a>(list: SExprList<'a>, idx: &mut usize) -> Option<&'a str> {
    let name = list.get(*idx).and_then(|s| s.as_id());
    if name.is_some() {
        *idx += 1;
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::instruction::Instruction as I;

    fn parse_ok(source: &str) -> Module {
        parse(source).expect("module should assemble")
    }

    fn body_of(module: &Module, index: usize) -> &[Instruction] {
        &module.code.code[index].instructions
    }

    // ------------------------------------------------------------------------
    // Module structure
    // ------------------------------------------------------------------------

    #[test]
    fn empty_module_has_no_sections() {
        let module = parse_ok("(module)");
        assert!(module.types.is_empty());
        assert!(module.functions.is_empty());
        assert!(module.memories.memories.is_empty());
        assert!(module.names.is_empty());
        assert!(module.start.start.is_none());
    }

    #[test]
    fn named_module_populates_name_section() {
        let module = parse_ok("(module $m)");
        assert_eq!(module.names.module_name.as_deref(), Some("m"));
    }

    #[test]
    fn function_and_local_names_recorded() {
        let module = parse_ok(
            r#"(module (func $sum (param $a i32) (param $b i32) (result i32)
                (local $tmp i32)
                local.get $a local.get $b i32.add))"#,
        );
        assert_eq!(module.names.function_names.get(&0).map(String::as_str), Some("sum"));
        let locals = module.names.local_names.get(&0).unwrap();
        assert_eq!(locals.get(&0).map(String::as_str), Some("a"));
        assert_eq!(locals.get(&2).map(String::as_str), Some("tmp"));
    }

    // ------------------------------------------------------------------------
    // Functions, type uses, locals
    // ------------------------------------------------------------------------

    #[test]
    fn add_function() {
        let module = parse_ok(
            r#"(module (func (export "add") (param i32 i32) (result i32)
                local.get 0
                local.get 1
                i32.add))"#,
        );
        assert_eq!(module.exports.exports[0].name, "add");
        assert_eq!(module.exports.exports[0].index, ExportIndex::Function(0));
        assert_eq!(
            body_of(&module, 0),
            &[
                I::LocalGet { local_idx: 0 },
                I::LocalGet { local_idx: 1 },
                I::I32Add,
                I::End,
            ]
        );
        let ty = module.types.get(0).unwrap();
        assert_eq!(ty.parameters, vec![ValueType::I32, ValueType::I32]);
        assert_eq!(ty.return_types, vec![ValueType::I32]);
    }

    #[test]
    fn folded_and_plain_forms_assemble_identically() {
        let plain = parse_ok(
            r#"(module (func (param i32 i32) (result i32)
                local.get 0 local.get 1 i32.add))"#,
        );
        let folded = parse_ok(
            r#"(module (func (param i32 i32) (result i32)
                (i32.add (local.get 0) (local.get 1))))"#,
        );
        assert_eq!(body_of(&plain, 0), body_of(&folded, 0));
    }

    #[test]
    fn named_parameters_resolve() {
        let module = parse_ok(
            r#"(module (func (param $x i32) (param $y i32) (result i32)
                (i32.sub (local.get $y) (local.get $x))))"#,
        );
        assert_eq!(
            body_of(&module, 0),
            &[
                I::LocalGet { local_idx: 1 },
                I::LocalGet { local_idx: 0 },
                I::I32Sub,
                I::End,
            ]
        );
    }

    #[test]
    fn locals_compress_and_zero_index_after_params() {
        let module = parse_ok(
            r#"(module (func (param i32) (local i64 i64) (local $f f32)
                local.get $f drop))"#,
        );
        let locals = &module.code.code[0].locals;
        assert_eq!(locals.groups(), &[(2, ValueType::I64), (1, ValueType::F32)]);
        assert_eq!(body_of(&module, 0)[0], I::LocalGet { local_idx: 3 });
    }

    #[test]
    fn explicit_type_use() {
        let module = parse_ok(
            r#"(module
                (type $binop (func (param i32 i32) (result i32)))
                (func (type $binop) local.get 0 local.get 1 i32.add))"#,
        );
        assert_eq!(module.types.len(), 1);
        assert_eq!(module.functions.functions[0].ftype_index, 0);
    }

    #[test]
    fn type_use_agreement_checked() {
        let err = parse(
            r#"(module
                (type $t (func (param i32) (result i32)))
                (func (type $t) (param f64) (result i32) i32.const 0))"#,
        )
        .unwrap_err();
        assert!(err.message.contains("disagrees"), "{}", err.message);
    }

    #[test]
    fn implicit_type_uses_deduplicate() {
        let module = parse_ok(
            r#"(module
                (func (param i32) (result i32) local.get 0)
                (func (param i32) (result i32) local.get 0))"#,
        );
        assert_eq!(module.types.len(), 1);
    }

    #[test]
    fn explicit_type_definitions_do_not_deduplicate() {
        let module = parse_ok(
            r#"(module
                (type (func (param i32)))
                (type (func (param i32))))"#,
        );
        assert_eq!(module.types.len(), 2);
    }

    // ------------------------------------------------------------------------
    // Forward references and identifier diagnostics
    // ------------------------------------------------------------------------

    #[test]
    fn forward_references_resolve() {
        let module = parse_ok(
            r#"(module
                (func $caller (result i32) (call $callee))
                (func $callee (result i32) (i32.const 9)))"#,
        );
        assert_eq!(body_of(&module, 0)[0], I::Call { func_idx: 1 });
    }

    #[test]
    fn unresolved_identifier_reports_suggestion() {
        let err = parse(
            r#"(module
                (func $helper)
                (func (call $helpre)))"#,
        )
        .unwrap_err();
        assert!(err.message.contains("undefined function: $helpre"), "{}", err.message);
        assert!(err.message.contains("did you mean $helper"), "{}", err.message);
    }

    #[test]
    fn duplicate_identifier_reported() {
        let err = parse(
            r#"(module
                (func $f)
                (func $f))"#,
        )
        .unwrap_err();
        assert_eq!(err.message, "duplicate function $f");

        let err = parse(r#"(module (func (local $x i32) (local $x i32)))"#).unwrap_err();
        assert_eq!(err.message, "duplicate local $x");
    }

    #[test]
    fn multiple_errors_accumulate() {
        let (module, diagnostics) = parse_with_diagnostics(
            r#"(module
                (func (call $missing1))
                (func (call $missing2)))"#,
        );
        assert!(module.is_some());
        assert!(diagnostics.has_errors());
        assert_eq!(
            diagnostics
                .entries()
                .iter()
                .filter(|d| d.message.starts_with("undefined"))
                .count(),
            2
        );
    }

    #[test]
    fn missing_immediate_reports_and_continues() {
        let (module, diagnostics) = parse_with_diagnostics(
            r#"(module (func (result i32)
                i32.const
                ))"#,
        );
        assert!(diagnostics.has_errors());
        // The zero literal keeps the body well-formed for later passes.
        let module = module.unwrap();
        assert_eq!(body_of(&module, 0)[0], I::I32Const { value: 0 });
    }

    // ------------------------------------------------------------------------
    // Control flow
    // ------------------------------------------------------------------------

    #[test]
    fn block_labels_resolve_by_depth() {
        let module = parse_ok(
            r#"(module (func
                (block $outer
                    (block $inner
                        (br $outer)
                        (br $inner)
                        (br 0)))))"#,
        );
        assert_eq!(
            body_of(&module, 0),
            &[
                I::Block {
                    block_type: crate::parser::instruction::BlockType::Empty
                },
                I::Block {
                    block_type: crate::parser::instruction::BlockType::Empty
                },
                I::Br { label_idx: 1 },
                I::Br { label_idx: 0 },
                I::Br { label_idx: 0 },
                I::End,
                I::End,
                I::End,
            ]
        );
    }

    #[test]
    fn loop_label_targets_itself() {
        let module = parse_ok(
            r#"(module (func
                (loop $continue (br $continue))))"#,
        );
        assert_eq!(body_of(&module, 0)[1], I::Br { label_idx: 0 });
    }

    #[test]
    fn flat_control_flow() {
        let module = parse_ok(
            r#"(module (func (result i32)
                block $b (result i32)
                    i32.const 1
                    br $b
                end))"#,
        );
        use crate::parser::instruction::BlockType;
        assert_eq!(
            body_of(&module, 0),
            &[
                I::Block {
                    block_type: BlockType::Value(ValueType::I32)
                },
                I::I32Const { value: 1 },
                I::Br { label_idx: 0 },
                I::End,
                I::End,
            ]
        );
    }

    #[test]
    fn folded_if_emits_condition_first() {
        let module = parse_ok(
            r#"(module (func (param i32) (result i32)
                (if (result i32) (local.get 0)
                    (then (i32.const 1))
                    (else (i32.const 2)))))"#,
        );
        use crate::parser::instruction::BlockType;
        assert_eq!(
            body_of(&module, 0),
            &[
                I::LocalGet { local_idx: 0 },
                I::If {
                    block_type: BlockType::Value(ValueType::I32)
                },
                I::I32Const { value: 1 },
                I::Else,
                I::I32Const { value: 2 },
                I::End,
                I::End,
            ]
        );
    }

    #[test]
    fn br_table_targets_and_default() {
        let module = parse_ok(
            r#"(module (func (param i32)
                (block $a (block $b
                    (br_table $b $a 1 (local.get 0))))))"#,
        );
        let body = body_of(&module, 0);
        assert_eq!(
            body[3],
            I::BrTable {
                labels: vec![0, 1],
                default: 1
            }
        );
    }

    #[test]
    fn undefined_label_reported() {
        let err = parse(r#"(module (func (block (br $nowhere))))"#).unwrap_err();
        assert!(err.message.contains("undefined label"), "{}", err.message);
    }

    // ------------------------------------------------------------------------
    // Immediates
    // ------------------------------------------------------------------------

    #[test]
    fn integer_immediate_ranges() {
        let module = parse_ok(
            r#"(module (func
                i64.const -9223372036854775808
                drop
                i64.const 18446744073709551615
                drop
                i32.const 0xffffffff
                drop))"#,
        );
        assert_eq!(body_of(&module, 0)[0], I::I64Const { value: i64::MIN });
        assert_eq!(body_of(&module, 0)[2], I::I64Const { value: -1 });
        assert_eq!(body_of(&module, 0)[4], I::I32Const { value: -1 });
    }

    #[test]
    fn out_of_range_immediates_rejected() {
        assert!(parse(r#"(module (func i32.const 4294967296 drop))"#).is_err());
        assert!(parse(r#"(module (func i32.const -2147483649 drop))"#).is_err());
    }

    #[test]
    fn float_immediates() {
        let module = parse_ok(
            r#"(module (func
                f32.const 0x1.8p1
                drop
                f64.const -nan:0x8000000000000
                drop
                f32.const 2
                drop))"#,
        );
        assert_eq!(body_of(&module, 0)[0], I::F32Const { value: 3.0 });
        let I::F64Const { value } = body_of(&module, 0)[2] else {
            panic!("expected f64.const");
        };
        assert_eq!(value.to_bits(), 0xfff8_0000_0000_0000);
        assert_eq!(body_of(&module, 0)[4], I::F32Const { value: 2.0 });
    }

    #[test]
    fn memarg_immediates() {
        let module = parse_ok(
            r#"(module (memory 1) (func (param i32)
                (i32.load offset=4 align=1 (local.get 0))
                drop
                (i64.load (local.get 0))
                drop))"#,
        );
        assert_eq!(
            body_of(&module, 0)[1],
            I::I32Load {
                memarg: MemArg { align: 0, offset: 4 }
            }
        );
        assert_eq!(
            body_of(&module, 0)[4],
            I::I64Load {
                memarg: MemArg { align: 3, offset: 0 }
            }
        );
    }

    #[test]
    fn alignment_must_be_power_of_two() {
        assert!(parse(r#"(module (memory 1) (func (i32.load align=3 (i32.const 0)) drop))"#).is_err());
    }

    #[test]
    fn unknown_instruction_reported() {
        let err = parse(r#"(module (func i32.frobnicate))"#).unwrap_err();
        assert!(err.message.contains("unknown instruction: i32.frobnicate"));
    }

    // ------------------------------------------------------------------------
    // Memory, limits, data
    // ------------------------------------------------------------------------

    #[test]
    fn plain_and_clause_limits() {
        let module = parse_ok("(module (memory 1 2))");
        assert_eq!(module.memories.memories[0].limits, Limits::new(1, Some(2)));

        let module = parse_ok("(module (memory (limits 10 40)))");
        assert_eq!(module.memories.memories[0].limits, Limits::new(10, Some(40)));

        let module = parse_ok("(module (memory (limits 5)))");
        assert_eq!(module.memories.memories[0].limits, Limits::new(5, None));
    }

    #[test]
    fn signed_limits_are_a_syntax_error() {
        let err = parse("(module (memory (limits +10 +40)))").unwrap_err();
        assert!(err.message.contains("signed"), "{}", err.message);
    }

    #[test]
    fn duplicate_limits_clauses_rejected() {
        let err = parse("(module (memory (limits 10 40) (limits 10 40)))").unwrap_err();
        assert!(err.message.contains("duplicate limits"), "{}", err.message);
    }

    #[test]
    fn imported_memory_requires_limits() {
        let err = parse(r#"(module (memory (import "mod" "mem")))"#).unwrap_err();
        assert!(err.message.contains("limits"), "{}", err.message);
    }

    #[test]
    fn inline_data_sizes_memory() {
        let module = parse_ok(r#"(module (memory (data "hello world")))"#);
        assert_eq!(module.memories.memories[0].limits, Limits::new(1, Some(1)));
        let segment = &module.data.data[0];
        assert_eq!(segment.memory_index, 0);
        assert_eq!(segment.init, b"hello world");
        assert_eq!(
            segment.offset,
            vec![I::I32Const { value: 0 }, I::End]
        );
    }

    #[test]
    fn data_segment_bytes_verbatim() {
        let module = parse_ok(r#"(module (memory 1) (data (i32.const 8) "a" "\00\ff"))"#);
        assert_eq!(module.data.data[0].init, vec![b'a', 0x00, 0xff]);
    }

    // ------------------------------------------------------------------------
    // Imports, exports, tables, globals, elements
    // ------------------------------------------------------------------------

    #[test]
    fn import_field_forms() {
        let module = parse_ok(
            r#"(module
                (import "env" "f" (func $f (param i32)))
                (import "env" "g" (global $g i32))
                (import "env" "m" (memory 1 2))
                (import "env" "t" (table 10 20 funcref)))"#,
        );
        assert_eq!(module.imports.imports.len(), 4);
        assert_eq!(module.imports.function_count(), 1);
        assert!(matches!(
            module.imports.imports[3].external_kind,
            ExternalKind::Table(TableType {
                limits: Limits { min: 10, max: Some(20) },
                ..
            })
        ));
    }

    #[test]
    fn inline_import_sugar() {
        let module = parse_ok(
            r#"(module
                (func $f (import "env" "f") (param i32))
                (memory $m (import "env" "m") 1)
                (global $g (import "env" "g") (mut i64))
                (table $t (import "env" "t") 5 funcref))"#,
        );
        assert_eq!(module.imports.imports.len(), 4);
        assert!(module.functions.is_empty());
        assert!(module.memories.memories.is_empty());
    }

    #[test]
    fn imports_resolve_before_local_definitions() {
        let module = parse_ok(
            r#"(module
                (import "env" "first" (func $first))
                (func $second (call $first) (call $second)))"#,
        );
        // $first is index 0 (import), $second index 1.
        assert_eq!(body_of(&module, 0)[0], I::Call { func_idx: 0 });
        assert_eq!(body_of(&module, 0)[1], I::Call { func_idx: 1 });
    }

    #[test]
    fn import_after_definition_rejected() {
        let err = parse(
            r#"(module
                (func $f)
                (import "env" "g" (func $g)))"#,
        )
        .unwrap_err();
        assert!(err.message.contains("import after function"), "{}", err.message);
    }

    #[test]
    fn inline_export_sugar() {
        let module = parse_ok(
            r#"(module
                (memory (export "mem") 1)
                (func (export "f") (export "alias")))"#,
        );
        assert_eq!(module.exports.exports.len(), 3);
        assert_eq!(module.exports.exports[0].index, ExportIndex::Memory(0));
        assert_eq!(module.exports.exports[1].name, "f");
        assert_eq!(module.exports.exports[2].name, "alias");
        assert_eq!(module.exports.exports[2].index, ExportIndex::Function(0));
    }

    #[test]
    fn table_forms() {
        let module = parse_ok("(module (table 2 10 funcref))");
        assert_eq!(module.tables.tables[0].limits, Limits::new(2, Some(10)));

        let module = parse_ok(
            r#"(module
                (func $a) (func $b)
                (table funcref (elem $a $b)))"#,
        );
        assert_eq!(module.tables.tables[0].limits, Limits::new(2, Some(2)));
        assert_eq!(module.elements.elements[0].func_indices, vec![0, 1]);
    }

    #[test]
    fn funcref_is_the_only_element_type() {
        let err = parse("(module (table 1 externref))").unwrap_err();
        assert!(err.message.contains("funcref"), "{}", err.message);
    }

    #[test]
    fn element_segment_forms() {
        let module = parse_ok(
            r#"(module
                (table 4 funcref)
                (func $f)
                (elem (i32.const 1) $f)
                (elem (table 0) (offset (i32.const 2)) func $f))"#,
        );
        assert_eq!(module.elements.elements.len(), 2);
        assert_eq!(
            module.elements.elements[1].offset,
            vec![I::I32Const { value: 2 }, I::End]
        );
    }

    #[test]
    fn globals_and_start() {
        let module = parse_ok(
            r#"(module
                (global $g (mut i32) (i32.const 7))
                (func $main)
                (start $main))"#,
        );
        assert!(module.globals.globals[0].global_type.mutable);
        assert_eq!(
            module.globals.globals[0].init,
            vec![I::I32Const { value: 7 }, I::End]
        );
        assert_eq!(module.start.start, Some(0));
    }

    #[test]
    fn global_init_may_use_imported_global() {
        let module = parse_ok(
            r#"(module
                (import "env" "base" (global $base i32))
                (global $derived i32 (global.get $base)))"#,
        );
        assert_eq!(
            module.globals.globals[0].init,
            vec![I::GlobalGet { global_idx: 0 }, I::End]
        );
    }

    #[test]
    fn call_indirect_type_uses() {
        let module = parse_ok(
            r#"(module
                (type $sig (func (param i32) (result i32)))
                (table 1 funcref)
                (func (param i32) (result i32)
                    (call_indirect (type $sig) (local.get 0) (i32.const 0))))"#,
        );
        let body = body_of(&module, 0);
        assert_eq!(body[2], I::CallIndirect { type_idx: 0 });
    }

    // ------------------------------------------------------------------------
    // Validation hookup
    // ------------------------------------------------------------------------

    #[test]
    fn assembled_modules_are_validated() {
        // Start function with a parameter: caught by validation after
        // assembly.
        let err = parse(
            r#"(module
                (func $f (param i32))
                (start $f))"#,
        )
        .unwrap_err();
        assert!(err.message.contains("start function"), "{}", err.message);
    }

    #[test]
    fn duplicate_export_names_rejected() {
        let err = parse(
            r#"(module
                (func (export "f"))
                (func (export "f")))"#,
        )
        .unwrap_err();
        assert!(err.message.contains("duplicate export"), "{}", err.message);
    }
}
