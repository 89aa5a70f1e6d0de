//! The in-memory representation of a WebAssembly module.
//!
//! A [`Module`] is produced by the binary reader ([`crate::parser::parse`])
//! or the text assembler ([`crate::wat::parse`]) and consumed by the binary
//! writer ([`crate::encoder::encode`]) and the interpreter. It is immutable
//! once built.
//!
//! Index spaces (functions, tables, memories, globals) are the concatenation
//! of imports followed by local definitions, in declaration order.

use super::instruction::Instruction;
use super::names::NameSection;
use std::fmt;

/// The closed set of MVP value types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueType {
    I32,
    I64,
    F32,
    F64,
}

impl ValueType {
    pub fn decode(byte: u8) -> Result<Self, u8> {
        match byte {
            0x7f => Ok(ValueType::I32),
            0x7e => Ok(ValueType::I64),
            0x7d => Ok(ValueType::F32),
            0x7c => Ok(ValueType::F64),
            _ => Err(byte),
        }
    }

    pub fn wire_byte(&self) -> u8 {
        match self {
            ValueType::I32 => 0x7f,
            ValueType::I64 => 0x7e,
            ValueType::F32 => 0x7d,
            ValueType::F64 => 0x7c,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}",
            match self {
                ValueType::I32 => "i32",
                ValueType::I64 => "i64",
                ValueType::F32 => "f32",
                ValueType::F64 => "f64",
            }
        )
    }
}

/// Table element kind. `funcref` is the only MVP kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElemType {
    FuncRef,
}

impl ElemType {
    pub fn wire_byte(&self) -> u8 {
        0x70
    }
}

impl fmt::Display for ElemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "funcref")
    }
}

/// Resizable limits: an initial count and an optional maximum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    pub min: u32,
    pub max: Option<u32>,
}

impl Limits {
    pub fn new(min: u32, max: Option<u32>) -> Limits {
        Limits { min, max }
    }
}

impl fmt::Display for Limits {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.max {
            Some(max) => write!(f, "min={} max={}", self.min, max),
            None => write!(f, "min={}", self.min),
        }
    }
}

/// A function signature: parameter and result types.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionType {
    pub parameters: Vec<ValueType>,
    pub return_types: Vec<ValueType>,
}

impl fmt::Display for FunctionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}) -> {}",
            self.parameters
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<String>>()
                .join(", "),
            if self.return_types.is_empty() {
                "nil".to_string()
            } else {
                self.return_types
                    .iter()
                    .map(ToString::to_string)
                    .collect::<Vec<String>>()
                    .join(", ")
            }
        )
    }
}

/// A table declaration: element kind plus limits, measured in elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableType {
    pub elem_type: ElemType,
    pub limits: Limits,
}

/// A memory declaration: limits measured in 64 KiB pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Memory {
    pub limits: Limits,
}

/// A global's type: value type plus mutability.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalType {
    pub value_type: ValueType,
    pub mutable: bool,
}

impl fmt::Display for GlobalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.mutable {
            write!(f, "(mut {})", self.value_type)
        } else {
            write!(f, "{}", self.value_type)
        }
    }
}

/// A global definition: type plus initializer expression.
#[derive(Debug, Clone, PartialEq)]
pub struct Global {
    pub global_type: GlobalType,
    /// Initializer expression, terminated by `end`.
    pub init: Vec<Instruction>,
}

/// What an import provides, with its type descriptor.
#[derive(Debug, Clone, PartialEq)]
pub enum ExternalKind {
    Function(u32),
    Table(TableType),
    Memory(Limits),
    Global(GlobalType),
}

impl ExternalKind {
    pub fn kind_name(&self) -> &'static str {
        match self {
            ExternalKind::Function(_) => "function",
            ExternalKind::Table(_) => "table",
            ExternalKind::Memory(_) => "memory",
            ExternalKind::Global(_) => "global",
        }
    }
}

/// One import: `(module, field, descriptor)`.
#[derive(Debug, Clone, PartialEq)]
pub struct Import {
    pub module: String,
    pub name: String,
    pub external_kind: ExternalKind,
}

impl fmt::Display for Import {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{} ({})", self.module, self.name, self.external_kind.kind_name())
    }
}

/// A local function declaration: index into the type section.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Function {
    pub ftype_index: u32,
}

/// The target of an export, addressing the per-kind index space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportIndex {
    Function(u32),
    Table(u32),
    Memory(u32),
    Global(u32),
}

impl ExportIndex {
    pub fn kind_name(&self) -> &'static str {
        match self {
            ExportIndex::Function(_) => "func",
            ExportIndex::Table(_) => "table",
            ExportIndex::Memory(_) => "memory",
            ExportIndex::Global(_) => "global",
        }
    }
}

/// One export: a name bound to an index-space entry.
#[derive(Debug, Clone, PartialEq)]
pub struct Export {
    pub name: String,
    pub index: ExportIndex,
}

/// An element segment: function indices copied into a table at
/// instantiation time.
#[derive(Debug, Clone, PartialEq)]
pub struct Element {
    pub table_index: u32,
    /// Offset initializer expression yielding i32, terminated by `end`.
    pub offset: Vec<Instruction>,
    pub func_indices: Vec<u32>,
}

/// A data segment: bytes copied into a linear memory at instantiation time.
#[derive(Debug, Clone, PartialEq)]
pub struct Data {
    pub memory_index: u32,
    /// Offset initializer expression yielding i32, terminated by `end`.
    pub offset: Vec<Instruction>,
    pub init: Vec<u8>,
}

/// Local declarations in the compressed `(count, type)` form of the binary
/// format.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Locals {
    groups: Vec<(u32, ValueType)>,
}

impl Locals {
    pub fn new(groups: Vec<(u32, ValueType)>) -> Locals {
        Locals { groups }
    }

    pub fn empty() -> Locals {
        Locals { groups: Vec::new() }
    }

    /// Compresses a flat list of local types into run-length groups.
    pub fn from_types(types: &[ValueType]) -> Locals {
        let mut groups: Vec<(u32, ValueType)> = Vec::new();
        for &ty in types {
            match groups.last_mut() {
                Some((count, last)) if *last == ty => *count += 1,
                _ => groups.push((1, ty)),
            }
        }
        Locals { groups }
    }

    pub fn groups(&self) -> &[(u32, ValueType)] {
        &self.groups
    }

    /// Total number of declared locals (excluding parameters).
    pub fn count(&self) -> u32 {
        self.groups.iter().map(|(count, _)| count).sum()
    }

    /// Iterates the flattened local types in declaration order.
    pub fn iter_types(&self) -> impl Iterator<Item = ValueType> + '_ {
        self.groups
            .iter()
            .flat_map(|&(count, ty)| std::iter::repeat(ty).take(count as usize))
    }
}

/// A function body: local groups plus a flat instruction sequence
/// terminated by `end`.
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionBody {
    pub locals: Locals,
    pub instructions: Vec<Instruction>,
}

/// A custom section, preserved verbatim.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomSection {
    pub name: String,
    pub data: Vec<u8>,
}

/// Byte range a section occupied in the binary it was read from.
/// `(0, 0)` means the section was absent (or synthesized by the assembler).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SectionPosition {
    pub start: u32,
    pub end: u32,
}

impl SectionPosition {
    pub fn new(start: u32, end: u32) -> SectionPosition {
        SectionPosition { start, end }
    }

    pub fn len(&self) -> u32 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Display for SectionPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "start=0x{:08x} end=0x{:08x} (size=0x{:08x})",
            self.start,
            self.end,
            self.len()
        )
    }
}

pub trait Positional {
    fn set_position(&mut self, start: u32, end: u32);
    fn has_position(&self) -> bool;
}

macro_rules! impl_positional {
    ($($t:ty),*) => {
        $(
            impl Positional for $t {
                fn set_position(&mut self, start: u32, end: u32) {
                    self.position.start = start;
                    self.position.end = end;
                }

                fn has_position(&self) -> bool {
                    self.position.start != 0 || self.position.end != 0
                }
            }
        )*
    }
}

impl_positional!(
    TypeSection,
    ImportSection,
    FunctionSection,
    TableSection,
    MemorySection,
    GlobalSection,
    ExportSection,
    StartSection,
    ElementSection,
    CodeSection,
    DataSection
);

#[derive(Debug, Default)]
pub struct TypeSection {
    pub types: Vec<FunctionType>,
    pub position: SectionPosition,
}

impl TypeSection {
    pub fn push(&mut self, function_type: FunctionType) -> u32 {
        self.types.push(function_type);
        (self.types.len() - 1) as u32
    }

    pub fn get(&self, index: u32) -> Option<&FunctionType> {
        self.types.get(index as usize)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }

    /// Index of an existing structurally equal type.
    pub fn find(&self, function_type: &FunctionType) -> Option<u32> {
        self.types.iter().position(|t| t == function_type).map(|i| i as u32)
    }
}

#[derive(Debug, Default)]
pub struct ImportSection {
    pub imports: Vec<Import>,
    pub position: SectionPosition,
}

impl ImportSection {
    pub fn push(&mut self, import: Import) {
        self.imports.push(import);
    }

    pub fn function_count(&self) -> usize {
        self.imports
            .iter()
            .filter(|i| matches!(i.external_kind, ExternalKind::Function(_)))
            .count()
    }

    pub fn table_count(&self) -> usize {
        self.imports
            .iter()
            .filter(|i| matches!(i.external_kind, ExternalKind::Table(_)))
            .count()
    }

    pub fn memory_count(&self) -> usize {
        self.imports
            .iter()
            .filter(|i| matches!(i.external_kind, ExternalKind::Memory(_)))
            .count()
    }

    pub fn global_count(&self) -> usize {
        self.imports
            .iter()
            .filter(|i| matches!(i.external_kind, ExternalKind::Global(_)))
            .count()
    }
}

#[derive(Debug, Default)]
pub struct FunctionSection {
    pub functions: Vec<Function>,
    pub position: SectionPosition,
}

impl FunctionSection {
    pub fn push(&mut self, function: Function) {
        self.functions.push(function);
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct TableSection {
    pub tables: Vec<TableType>,
    pub position: SectionPosition,
}

#[derive(Debug, Default)]
pub struct MemorySection {
    pub memories: Vec<Memory>,
    pub position: SectionPosition,
}

#[derive(Debug, Default)]
pub struct GlobalSection {
    pub globals: Vec<Global>,
    pub position: SectionPosition,
}

impl GlobalSection {
    pub fn get(&self, index: u32) -> Option<&Global> {
        self.globals.get(index as usize)
    }
}

#[derive(Debug, Default)]
pub struct ExportSection {
    pub exports: Vec<Export>,
    pub position: SectionPosition,
}

impl ExportSection {
    pub fn push(&mut self, export: Export) {
        self.exports.push(export);
    }

    pub fn find(&self, name: &str) -> Option<&Export> {
        self.exports.iter().find(|e| e.name == name)
    }
}

#[derive(Debug, Default)]
pub struct StartSection {
    pub start: Option<u32>,
    pub position: SectionPosition,
}

#[derive(Debug, Default)]
pub struct ElementSection {
    pub elements: Vec<Element>,
    pub position: SectionPosition,
}

#[derive(Debug, Default)]
pub struct CodeSection {
    pub code: Vec<FunctionBody>,
    pub position: SectionPosition,
}

impl CodeSection {
    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct DataSection {
    pub data: Vec<Data>,
    pub position: SectionPosition,
}

/// A complete module: the known sections plus preserved custom sections
/// and the decoded `name` section facade.
#[derive(Debug, Default)]
pub struct Module {
    pub types: TypeSection,
    pub imports: ImportSection,
    pub functions: FunctionSection,
    pub tables: TableSection,
    pub memories: MemorySection,
    pub globals: GlobalSection,
    pub exports: ExportSection,
    pub start: StartSection,
    pub elements: ElementSection,
    pub code: CodeSection,
    pub data: DataSection,
    /// Custom sections other than `name`, preserved for round trips.
    pub custom: Vec<CustomSection>,
    /// The `name` custom section facade.
    pub names: NameSection,
}

impl Module {
    pub fn new() -> Module {
        Module::default()
    }

    /// Appends a local function: one type-index slot in the function
    /// section paired with one body in the code section. Returns the
    /// function's index in the function index space.
    pub fn push_function(&mut self, ftype_index: u32, body: FunctionBody) -> u32 {
        self.functions.push(Function { ftype_index });
        self.code.code.push(body);
        (self.imports.function_count() + self.functions.len() - 1) as u32
    }

    /// Resolves a function index (imports first, then locals) to its type.
    pub fn function_type(&self, func_idx: u32) -> Option<&FunctionType> {
        let imported = self.imports.function_count();
        if (func_idx as usize) < imported {
            self.imports
                .imports
                .iter()
                .filter_map(|i| match &i.external_kind {
                    ExternalKind::Function(type_idx) => Some(*type_idx),
                    _ => None,
                })
                .nth(func_idx as usize)
                .and_then(|type_idx| self.types.get(type_idx))
        } else {
            let local_idx = func_idx as usize - imported;
            self.functions
                .functions
                .get(local_idx)
                .and_then(|f| self.types.get(f.ftype_index))
        }
    }

    /// Size of the function index space (imports + locals).
    pub fn function_index_space(&self) -> usize {
        self.imports.function_count() + self.functions.len()
    }

    /// Size of the table index space (imports + locals).
    pub fn table_index_space(&self) -> usize {
        self.imports.table_count() + self.tables.tables.len()
    }

    /// Size of the memory index space (imports + locals).
    pub fn memory_index_space(&self) -> usize {
        self.imports.memory_count() + self.memories.memories.len()
    }

    /// Size of the global index space (imports + locals).
    pub fn global_index_space(&self) -> usize {
        self.imports.global_count() + self.globals.globals.len()
    }

    /// The type of a global by index (imports first, then locals).
    pub fn global_type(&self, global_idx: u32) -> Option<GlobalType> {
        let imported = self.imports.global_count();
        if (global_idx as usize) < imported {
            self.imports
                .imports
                .iter()
                .filter_map(|i| match &i.external_kind {
                    ExternalKind::Global(gt) => Some(*gt),
                    _ => None,
                })
                .nth(global_idx as usize)
        } else {
            self.globals
                .globals
                .get(global_idx as usize - imported)
                .map(|g| g.global_type)
        }
    }
}

/// Rendering formats for [`Module::to_string`].
pub enum ModuleFormat {
    /// Section table: positions and entry counts.
    Header,
    /// Per-entry listing of types, functions, exports, and segments.
    Details,
    /// Function bodies with one instruction per line.
    Disassemble,
}

impl Module {
    pub fn to_string(&self, format: ModuleFormat) -> String {
        match format {
            ModuleFormat::Header => self.to_header_string(),
            ModuleFormat::Details => self.to_details_string(),
            ModuleFormat::Disassemble => self.to_disassemble_string(),
        }
    }

    fn to_header_string(&self) -> String {
        let mut result = String::new();
        if self.types.has_position() {
            result.push_str(&format!(
                "     Type {} count: {}\n",
                self.types.position,
                self.types.len()
            ));
        }
        if self.imports.has_position() {
            result.push_str(&format!(
                "   Import {} count: {}\n",
                self.imports.position,
                self.imports.imports.len()
            ));
        }
        if self.functions.has_position() {
            result.push_str(&format!(
                " Function {} count: {}\n",
                self.functions.position,
                self.functions.len()
            ));
        }
        if self.exports.has_position() {
            result.push_str(&format!(
                "   Export {} count: {}\n",
                self.exports.position,
                self.exports.exports.len()
            ));
        }
        if self.code.has_position() {
            result.push_str(&format!("     Code {} count: {}\n", self.code.position, self.code.len()));
        }
        result
    }

    fn to_details_string(&self) -> String {
        let mut result = String::new();

        if !self.types.is_empty() {
            result.push_str(&format!("Type[{}]:\n", self.types.len()));
            for (i, ty) in self.types.types.iter().enumerate() {
                result.push_str(&format!(" - type[{i}] {ty}\n"));
            }
        }
        if !self.imports.imports.is_empty() {
            result.push_str(&format!("Import[{}]:\n", self.imports.imports.len()));
            for (i, import) in self.imports.imports.iter().enumerate() {
                result.push_str(&format!(" - import[{i}] {import}\n"));
            }
        }
        if !self.functions.is_empty() {
            result.push_str(&format!("Function[{}]:\n", self.functions.len()));
            let imported = self.imports.function_count();
            for (i, function) in self.functions.functions.iter().enumerate() {
                let func_idx = (imported + i) as u32;
                let export = self.export_name_of(ExportIndex::Function(func_idx));
                result.push_str(&format!(
                    " - func[{func_idx}] sig={}{export}\n",
                    function.ftype_index
                ));
            }
        }
        if !self.exports.exports.is_empty() {
            result.push_str(&format!("Export[{}]:\n", self.exports.exports.len()));
            for export in &self.exports.exports {
                result.push_str(&format!(" - {} -> \"{}\"\n", export.index.kind_name(), export.name));
            }
        }
        if !self.data.data.is_empty() {
            result.push_str(&format!("Data[{}]:\n", self.data.data.len()));
            for (i, segment) in self.data.data.iter().enumerate() {
                result.push_str(&format!(
                    " - segment[{i}] memory={} size={}\n",
                    segment.memory_index,
                    segment.init.len()
                ));
            }
        }
        result
    }

    fn to_disassemble_string(&self) -> String {
        let mut result = String::new();
        let imported = self.imports.function_count();
        for (i, body) in self.code.code.iter().enumerate() {
            let func_idx = (imported + i) as u32;
            let export = self.export_name_of(ExportIndex::Function(func_idx));
            result.push_str(&format!("func[{func_idx}]{export}:\n"));
            let mut indent = 1usize;
            for instruction in &body.instructions {
                match instruction {
                    Instruction::End | Instruction::Else => indent = indent.saturating_sub(1),
                    _ => {}
                }
                result.push_str(&format!("{:indent$}{instruction}\n", "", indent = indent * 2));
                match instruction {
                    Instruction::Block { .. }
                    | Instruction::Loop { .. }
                    | Instruction::If { .. }
                    | Instruction::Else => indent += 1,
                    _ => {}
                }
            }
        }
        result
    }

    fn export_name_of(&self, index: ExportIndex) -> String {
        for export in &self.exports.exports {
            if export.index == index {
                return format!(" <{}>", export.name);
            }
        }
        String::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_type_codec() {
        for vt in [ValueType::I32, ValueType::I64, ValueType::F32, ValueType::F64] {
            assert_eq!(ValueType::decode(vt.wire_byte()), Ok(vt));
        }
        assert_eq!(ValueType::decode(0x7b), Err(0x7b));
    }

    #[test]
    fn locals_compression() {
        use ValueType::*;
        let locals = Locals::from_types(&[I32, I32, F64, I32]);
        assert_eq!(locals.groups(), &[(2, I32), (1, F64), (1, I32)]);
        assert_eq!(locals.count(), 4);
        assert_eq!(locals.iter_types().collect::<Vec<_>>(), vec![I32, I32, F64, I32]);
    }

    #[test]
    fn function_index_space_spans_imports() {
        let mut module = Module::new();
        module.types.push(FunctionType {
            parameters: vec![ValueType::I32],
            return_types: vec![],
        });
        module.types.push(FunctionType {
            parameters: vec![],
            return_types: vec![ValueType::I64],
        });
        module.imports.push(Import {
            module: "env".to_string(),
            name: "callback".to_string(),
            external_kind: ExternalKind::Function(0),
        });
        let idx = module.push_function(
            1,
            FunctionBody {
                locals: Locals::empty(),
                instructions: vec![Instruction::I64Const { value: 7 }, Instruction::End],
            },
        );

        assert_eq!(idx, 1);
        assert_eq!(module.function_index_space(), 2);
        assert_eq!(module.function_type(0).unwrap().parameters, vec![ValueType::I32]);
        assert_eq!(module.function_type(1).unwrap().return_types, vec![ValueType::I64]);
        assert!(module.function_type(2).is_none());
    }

    #[test]
    fn global_type_lookup_spans_imports() {
        let mut module = Module::new();
        module.imports.push(Import {
            module: "env".to_string(),
            name: "g".to_string(),
            external_kind: ExternalKind::Global(GlobalType {
                value_type: ValueType::F32,
                mutable: false,
            }),
        });
        module.globals.globals.push(Global {
            global_type: GlobalType {
                value_type: ValueType::I32,
                mutable: true,
            },
            init: vec![Instruction::I32Const { value: 0 }, Instruction::End],
        });

        assert_eq!(module.global_type(0).unwrap().value_type, ValueType::F32);
        assert!(module.global_type(1).unwrap().mutable);
        assert!(module.global_type(2).is_none());
    }

    #[test]
    fn export_lookup() {
        let mut module = Module::new();
        module.exports.push(Export {
            name: "main".to_string(),
            index: ExportIndex::Function(0),
        });
        assert!(module.exports.find("main").is_some());
        assert!(module.exports.find("missing").is_none());
    }
}
