//! Binary format decoder. Reads `.wasm` bytes into a [`module::Module`].
//!
//! The reader enforces the canonical encoding rules: shortest-form LEB128,
//! strictly increasing known-section ids (custom sections may appear
//! anywhere), and authoritative payload lengths — a section decoder that
//! consumes fewer or more bytes than the declared payload length is a
//! malformed binary.

pub mod encoding;
pub mod instruction;
pub mod module;
pub mod names;
pub mod reader;
pub mod validate;

use encoding::{
    DESC_FUNC, DESC_GLOBAL, DESC_MEMORY, DESC_TABLE, ELEM_TYPE_FUNCREF, LIMITS_MIN_MAX,
    LIMITS_MIN_ONLY, MAGIC, SECTION_CODE, SECTION_CUSTOM, SECTION_DATA, SECTION_ELEMENT,
    SECTION_EXPORT, SECTION_FUNCTION, SECTION_GLOBAL, SECTION_IMPORT, SECTION_MAX, SECTION_MEMORY,
    SECTION_START, SECTION_TABLE, SECTION_TYPE, TYPE_FUNC, VERSION,
};
use instruction::decode_expression;
use module::{
    CustomSection, Data, Element, ElemType, Export, ExportIndex, ExternalKind, Function,
    FunctionBody, FunctionType, Global, GlobalType, Import, Limits, Locals, Memory, Module,
    Positional, TableType, ValueType,
};
use names::NameSection;
use reader::Reader;
use thiserror::Error;

/// A malformed binary: structural defects detected while decoding.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("unexpected end of input at offset {offset}")]
    UnexpectedEof { offset: usize },

    #[error("bad magic number {found:#010x}, expected \\0asm")]
    BadMagic { found: u32 },

    #[error("unsupported version {found}, expected 1")]
    BadVersion { found: u32 },

    #[error("LEB128 value exceeds {bits}-bit bound at offset {offset}")]
    Leb128Overlong { bits: u32, offset: usize },

    #[error("non-canonical LEB128 padding bits in {bits}-bit value at offset {offset}")]
    Leb128Padding { bits: u32, offset: usize },

    #[error("invalid utf-8 in name at offset {offset}")]
    InvalidUtf8 { offset: usize },

    #[error("unknown section id {id} at offset {offset}")]
    UnknownSection { id: u8, offset: usize },

    #[error("section id {id} out of order (previous id {prev})")]
    SectionOutOfOrder { id: u8, prev: u8 },

    #[error("section {id} declared {declared} payload bytes but decoder consumed {consumed}")]
    SectionLength { id: u8, declared: usize, consumed: usize },

    #[error("function body {index} declared {declared} bytes but decoder consumed {consumed}")]
    BodyLength { index: usize, declared: usize, consumed: usize },

    #[error("function section has {functions} entries but code section has {bodies}")]
    FunctionCodeCountMismatch { functions: usize, bodies: usize },

    #[error("unknown opcode {opcode:#04x} at offset {offset} {detail}")]
    UnknownOpcode { opcode: u8, detail: String, offset: usize },

    #[error("reserved immediate must be zero at offset {offset}")]
    NonZeroReserved { offset: usize },

    #[error("invalid value type {byte:#04x} at offset {offset}")]
    InvalidValueType { byte: u8, offset: usize },

    #[error("invalid block type {byte:#04x}")]
    InvalidBlockType { byte: u8 },

    #[error("invalid table element type {byte:#04x} at offset {offset}")]
    InvalidElemType { byte: u8, offset: usize },

    #[error("invalid import/export kind {byte:#04x} at offset {offset}")]
    InvalidExternalKind { byte: u8, offset: usize },

    #[error("invalid limits flag {byte:#04x} at offset {offset}")]
    InvalidLimitsFlag { byte: u8, offset: usize },

    #[error("expected function type marker 0x60, found {byte:#04x} at offset {offset}")]
    InvalidFuncTypeMarker { byte: u8, offset: usize },
}

/// Any failure while reading a binary module: malformed bytes, or a
/// well-formed binary that violates a module invariant.
#[derive(Debug, Error)]
pub enum BinaryError {
    #[error(transparent)]
    Malformed(#[from] DecodeError),
    #[error(transparent)]
    Invalid(#[from] validate::ValidationError),
}

/// Reads and validates a binary module.
pub fn parse(bytes: Vec<u8>) -> Result<Module, BinaryError> {
    let module = decode(bytes)?;
    validate::validate_module(&module)?;
    Ok(module)
}

/// Reads a binary module without running module validation.
pub fn decode(bytes: Vec<u8>) -> Result<Module, DecodeError> {
    let mut reader = Reader::new(bytes);
    let mut module = Module::new();

    read_preamble(&mut reader)?;

    let mut prev_id = 0u8;
    while reader.has_at_least(1) {
        let id = reader.read_vu7()?;
        let payload_len = reader.read_vu32()? as usize;
        let start = reader.pos();
        let end = start + payload_len;
        if !reader.has_at_least(payload_len) {
            return Err(DecodeError::UnexpectedEof { offset: reader.pos() });
        }

        if id == SECTION_CUSTOM {
            read_custom_section(&mut reader, end, &mut module)?;
            reader.skip_to(end);
            continue;
        }

        if id > SECTION_MAX {
            return Err(DecodeError::UnknownSection { id, offset: start });
        }
        if id <= prev_id {
            return Err(DecodeError::SectionOutOfOrder { id, prev: prev_id });
        }
        prev_id = id;

        read_section(&mut reader, id, &mut module)?;

        // The declared payload length is authoritative.
        let consumed = reader.pos() - start;
        if consumed != payload_len {
            return Err(DecodeError::SectionLength {
                id,
                declared: payload_len,
                consumed,
            });
        }
        set_section_position(&mut module, id, start as u32, end as u32);
    }

    if module.functions.len() != module.code.len() {
        return Err(DecodeError::FunctionCodeCountMismatch {
            functions: module.functions.len(),
            bodies: module.code.len(),
        });
    }

    Ok(module)
}

fn read_preamble(reader: &mut Reader) -> Result<(), DecodeError> {
    let magic = reader.read_u32()?;
    if magic != MAGIC {
        return Err(DecodeError::BadMagic { found: magic });
    }
    let version = reader.read_u32()?;
    if version != VERSION {
        return Err(DecodeError::BadVersion { found: version });
    }
    Ok(())
}

fn read_section(reader: &mut Reader, id: u8, module: &mut Module) -> Result<(), DecodeError> {
    match id {
        SECTION_TYPE => read_section_type(reader, module),
        SECTION_IMPORT => read_section_import(reader, module),
        SECTION_FUNCTION => read_section_function(reader, module),
        SECTION_TABLE => read_section_table(reader, module),
        SECTION_MEMORY => read_section_memory(reader, module),
        SECTION_GLOBAL => read_section_global(reader, module),
        SECTION_EXPORT => read_section_export(reader, module),
        SECTION_START => read_section_start(reader, module),
        SECTION_ELEMENT => read_section_element(reader, module),
        SECTION_CODE => read_section_code(reader, module),
        SECTION_DATA => read_section_data(reader, module),
        _ => unreachable!("section id range checked by caller"),
    }
}

fn set_section_position(module: &mut Module, id: u8, start: u32, end: u32) {
    match id {
        SECTION_TYPE => module.types.set_position(start, end),
        SECTION_IMPORT => module.imports.set_position(start, end),
        SECTION_FUNCTION => module.functions.set_position(start, end),
        SECTION_TABLE => module.tables.set_position(start, end),
        SECTION_MEMORY => module.memories.set_position(start, end),
        SECTION_GLOBAL => module.globals.set_position(start, end),
        SECTION_EXPORT => module.exports.set_position(start, end),
        SECTION_START => module.start.set_position(start, end),
        SECTION_ELEMENT => module.elements.set_position(start, end),
        SECTION_CODE => module.code.set_position(start, end),
        SECTION_DATA => module.data.set_position(start, end),
        _ => {}
    }
}

// -- Shared pieces ----------------------------------------------------------

fn read_value_type(reader: &mut Reader) -> Result<ValueType, DecodeError> {
    let offset = reader.pos();
    let byte = reader.read_byte()?;
    ValueType::decode(byte).map_err(|byte| DecodeError::InvalidValueType { byte, offset })
}

fn read_limits(reader: &mut Reader) -> Result<Limits, DecodeError> {
    let offset = reader.pos();
    let flag = reader.read_byte()?;
    match flag {
        LIMITS_MIN_ONLY => Ok(Limits::new(reader.read_vu32()?, None)),
        LIMITS_MIN_MAX => {
            let min = reader.read_vu32()?;
            let max = reader.read_vu32()?;
            Ok(Limits::new(min, Some(max)))
        }
        byte => Err(DecodeError::InvalidLimitsFlag { byte, offset }),
    }
}

fn read_table_type(reader: &mut Reader) -> Result<TableType, DecodeError> {
    let offset = reader.pos();
    let byte = reader.read_byte()?;
    if byte != ELEM_TYPE_FUNCREF {
        return Err(DecodeError::InvalidElemType { byte, offset });
    }
    Ok(TableType {
        elem_type: ElemType::FuncRef,
        limits: read_limits(reader)?,
    })
}

fn read_global_type(reader: &mut Reader) -> Result<GlobalType, DecodeError> {
    let value_type = read_value_type(reader)?;
    let mutable = reader.read_vu1()?;
    Ok(GlobalType { value_type, mutable })
}

// -- Section readers --------------------------------------------------------

fn read_custom_section(reader: &mut Reader, end: usize, module: &mut Module) -> Result<(), DecodeError> {
    let name = reader.read_name()?;
    let data = reader.read_bytes(end - reader.pos())?;
    if name == "name" {
        module.names = NameSection::decode(data)?;
    } else {
        module.custom.push(CustomSection { name, data });
    }
    Ok(())
}

fn read_section_type(reader: &mut Reader, module: &mut Module) -> Result<(), DecodeError> {
    let count = reader.read_vu32()?;
    for _ in 0..count {
        let offset = reader.pos();
        let marker = reader.read_byte()?;
        if marker != TYPE_FUNC {
            return Err(DecodeError::InvalidFuncTypeMarker { byte: marker, offset });
        }
        let param_count = reader.read_vu32()?;
        let mut parameters = Vec::with_capacity(param_count as usize);
        for _ in 0..param_count {
            parameters.push(read_value_type(reader)?);
        }
        let result_count = reader.read_vu32()?;
        let mut return_types = Vec::with_capacity(result_count as usize);
        for _ in 0..result_count {
            return_types.push(read_value_type(reader)?);
        }
        module.types.push(FunctionType {
            parameters,
            return_types,
        });
    }
    Ok(())
}

fn read_section_import(reader: &mut Reader, module: &mut Module) -> Result<(), DecodeError> {
    let count = reader.read_vu32()?;
    for _ in 0..count {
        let import_module = reader.read_name()?;
        let name = reader.read_name()?;
        let offset = reader.pos();
        let kind = reader.read_byte()?;
        let external_kind = match kind {
            DESC_FUNC => ExternalKind::Function(reader.read_vu32()?),
            DESC_TABLE => ExternalKind::Table(read_table_type(reader)?),
            DESC_MEMORY => ExternalKind::Memory(read_limits(reader)?),
            DESC_GLOBAL => ExternalKind::Global(read_global_type(reader)?),
            byte => return Err(DecodeError::InvalidExternalKind { byte, offset }),
        };
        module.imports.push(Import {
            module: import_module,
            name,
            external_kind,
        });
    }
    Ok(())
}

fn read_section_function(reader: &mut Reader, module: &mut Module) -> Result<(), DecodeError> {
    let count = reader.read_vu32()?;
    for _ in 0..count {
        module.functions.push(Function {
            ftype_index: reader.read_vu32()?,
        });
    }
    Ok(())
}

fn read_section_table(reader: &mut Reader, module: &mut Module) -> Result<(), DecodeError> {
    let count = reader.read_vu32()?;
    for _ in 0..count {
        let table_type = read_table_type(reader)?;
        module.tables.tables.push(table_type);
    }
    Ok(())
}

fn read_section_memory(reader: &mut Reader, module: &mut Module) -> Result<(), DecodeError> {
    let count = reader.read_vu32()?;
    for _ in 0..count {
        let limits = read_limits(reader)?;
        module.memories.memories.push(Memory { limits });
    }
    Ok(())
}

fn read_section_global(reader: &mut Reader, module: &mut Module) -> Result<(), DecodeError> {
    let count = reader.read_vu32()?;
    for _ in 0..count {
        let global_type = read_global_type(reader)?;
        let init = decode_expression(reader)?;
        module.globals.globals.push(Global { global_type, init });
    }
    Ok(())
}

fn read_section_export(reader: &mut Reader, module: &mut Module) -> Result<(), DecodeError> {
    let count = reader.read_vu32()?;
    for _ in 0..count {
        let name = reader.read_name()?;
        let offset = reader.pos();
        let kind = reader.read_byte()?;
        let idx = reader.read_vu32()?;
        let index = match kind {
            DESC_FUNC => ExportIndex::Function(idx),
            DESC_TABLE => ExportIndex::Table(idx),
            DESC_MEMORY => ExportIndex::Memory(idx),
            DESC_GLOBAL => ExportIndex::Global(idx),
            byte => return Err(DecodeError::InvalidExternalKind { byte, offset }),
        };
        module.exports.push(Export { name, index });
    }
    Ok(())
}

fn read_section_start(reader: &mut Reader, module: &mut Module) -> Result<(), DecodeError> {
    module.start.start = Some(reader.read_vu32()?);
    Ok(())
}

fn read_section_element(reader: &mut Reader, module: &mut Module) -> Result<(), DecodeError> {
    let count = reader.read_vu32()?;
    for _ in 0..count {
        let table_index = reader.read_vu32()?;
        let offset = decode_expression(reader)?;
        let elem_count = reader.read_vu32()?;
        let mut func_indices = Vec::with_capacity(elem_count as usize);
        for _ in 0..elem_count {
            func_indices.push(reader.read_vu32()?);
        }
        module.elements.elements.push(Element {
            table_index,
            offset,
            func_indices,
        });
    }
    Ok(())
}

fn read_section_code(reader: &mut Reader, module: &mut Module) -> Result<(), DecodeError> {
    let count = reader.read_vu32()?;
    for index in 0..count as usize {
        let body_size = reader.read_vu32()? as usize;
        let start = reader.pos();

        let group_count = reader.read_vu32()?;
        let mut groups = Vec::with_capacity(group_count as usize);
        for _ in 0..group_count {
            let local_count = reader.read_vu32()?;
            let value_type = read_value_type(reader)?;
            groups.push((local_count, value_type));
        }

        let instructions = decode_expression(reader)?;

        let consumed = reader.pos() - start;
        if consumed != body_size {
            return Err(DecodeError::BodyLength {
                index,
                declared: body_size,
                consumed,
            });
        }

        module.code.code.push(FunctionBody {
            locals: Locals::new(groups),
            instructions,
        });
    }
    Ok(())
}

fn read_section_data(reader: &mut Reader, module: &mut Module) -> Result<(), DecodeError> {
    let count = reader.read_vu32()?;
    for _ in 0..count {
        let memory_index = reader.read_vu32()?;
        let offset = decode_expression(reader)?;
        let init = reader.read_u8vec()?;
        module.data.data.push(Data {
            memory_index,
            offset,
            init,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::instruction::Instruction;

    const PREAMBLE: [u8; 8] = [0x00, 0x61, 0x73, 0x6d, 0x01, 0x00, 0x00, 0x00];

    fn with_sections(sections: &[&[u8]]) -> Vec<u8> {
        let mut bytes = PREAMBLE.to_vec();
        for section in sections {
            bytes.extend_from_slice(section);
        }
        bytes
    }

    #[test]
    fn empty_module() {
        let module = parse(PREAMBLE.to_vec()).expect("empty module");
        assert!(module.types.is_empty());
        assert!(module.functions.is_empty());
        assert!(module.start.start.is_none());
    }

    #[test]
    fn bad_magic() {
        let bytes = vec![0x00, 0x61, 0x73, 0x6e, 0x01, 0x00, 0x00, 0x00];
        assert!(matches!(decode(bytes), Err(DecodeError::BadMagic { .. })));
    }

    #[test]
    fn bad_version() {
        let bytes = vec![0x00, 0x61, 0x73, 0x6d, 0x02, 0x00, 0x00, 0x00];
        assert!(matches!(decode(bytes), Err(DecodeError::BadVersion { found: 2 })));
    }

    #[test]
    fn truncated_preamble() {
        assert!(matches!(
            decode(vec![0x00, 0x61, 0x73]),
            Err(DecodeError::UnexpectedEof { .. })
        ));
    }

    #[test]
    fn type_section_decoding() {
        // (func (param i32 i32) (result i32))
        let bytes = with_sections(&[&[1, 7, 1, 0x60, 2, 0x7f, 0x7f, 1, 0x7f]]);
        let module = decode(bytes).expect("module");
        assert_eq!(module.types.len(), 1);
        let ty = module.types.get(0).unwrap();
        assert_eq!(ty.parameters, vec![ValueType::I32, ValueType::I32]);
        assert_eq!(ty.return_types, vec![ValueType::I32]);
        assert!(module.types.has_position());
    }

    #[test]
    fn sections_must_be_ordered() {
        // Function section (3) before type section (1).
        let bytes = with_sections(&[&[3, 2, 1, 0], &[1, 4, 1, 0x60, 0, 0]]);
        assert!(matches!(
            decode(bytes),
            Err(DecodeError::SectionOutOfOrder { id: 1, prev: 3 })
        ));
    }

    #[test]
    fn duplicate_section_rejected() {
        let section: &[u8] = &[5, 3, 1, 0x00, 1];
        let bytes = with_sections(&[section, section]);
        assert!(matches!(
            decode(bytes),
            Err(DecodeError::SectionOutOfOrder { id: 5, prev: 5 })
        ));
    }

    #[test]
    fn custom_sections_allowed_anywhere() {
        // custom, type, custom
        let custom: &[u8] = &[0, 5, 3, b'a', b'b', b'c', 0xff];
        let ty: &[u8] = &[1, 4, 1, 0x60, 0, 0];
        let module = decode(with_sections(&[custom, ty, custom])).expect("module");
        assert_eq!(module.custom.len(), 2);
        assert_eq!(module.custom[0].name, "abc");
        assert_eq!(module.custom[0].data, vec![0xff]);
        assert_eq!(module.types.len(), 1);
    }

    #[test]
    fn payload_length_is_authoritative() {
        // Type section declares 5 payload bytes but its contents use 4.
        let bytes = with_sections(&[&[1, 5, 1, 0x60, 0, 0, 0]]);
        assert!(matches!(
            decode(bytes),
            Err(DecodeError::SectionLength { id: 1, declared: 5, consumed: 4 })
        ));
    }

    #[test]
    fn section_payload_truncated() {
        let bytes = with_sections(&[&[1, 200, 1]]);
        assert!(matches!(decode(bytes), Err(DecodeError::UnexpectedEof { .. })));
    }

    #[test]
    fn memory_section_limits() {
        let bytes = with_sections(&[&[5, 4, 1, 0x01, 1, 2]]);
        let module = decode(bytes).expect("module");
        assert_eq!(module.memories.memories[0].limits, Limits::new(1, Some(2)));
    }

    #[test]
    fn invalid_limits_flag() {
        let bytes = with_sections(&[&[5, 3, 1, 0x02, 1]]);
        assert!(matches!(
            decode(bytes),
            Err(DecodeError::InvalidLimitsFlag { byte: 0x02, .. })
        ));
    }

    #[test]
    fn table_elem_type_must_be_funcref() {
        let bytes = with_sections(&[&[4, 4, 1, 0x6f, 0x00, 1]]);
        assert!(matches!(
            decode(bytes),
            Err(DecodeError::InvalidElemType { byte: 0x6f, .. })
        ));
    }

    #[test]
    fn code_body_length_is_authoritative() {
        let ty: &[u8] = &[1, 4, 1, 0x60, 0, 0];
        let func: &[u8] = &[3, 2, 1, 0];
        // Body declares 4 bytes but contains 3 (no locals, nop, end).
        let code: &[u8] = &[10, 6, 1, 4, 0, 0x01, 0x0b, 0x0b];
        assert!(matches!(
            decode(with_sections(&[ty, func, code])),
            Err(DecodeError::BodyLength { index: 0, declared: 4, .. })
        ));
    }

    #[test]
    fn function_and_code_counts_must_match() {
        let ty: &[u8] = &[1, 4, 1, 0x60, 0, 0];
        let func: &[u8] = &[3, 2, 1, 0];
        assert!(matches!(
            decode(with_sections(&[ty, func])),
            Err(DecodeError::FunctionCodeCountMismatch { functions: 1, bodies: 0 })
        ));
    }

    #[test]
    fn full_add_module() {
        // (module (func (export "add") (param i32 i32) (result i32)
        //   local.get 0 local.get 1 i32.add))
        let bytes = with_sections(&[
            &[1, 7, 1, 0x60, 2, 0x7f, 0x7f, 1, 0x7f],
            &[3, 2, 1, 0],
            &[7, 7, 1, 3, b'a', b'd', b'd', 0x00, 0],
            &[10, 9, 1, 7, 0, 0x20, 0, 0x20, 1, 0x6a, 0x0b],
        ]);
        let module = parse(bytes).expect("module");
        assert_eq!(module.exports.exports[0].name, "add");
        assert_eq!(
            module.code.code[0].instructions,
            vec![
                Instruction::LocalGet { local_idx: 0 },
                Instruction::LocalGet { local_idx: 1 },
                Instruction::I32Add,
                Instruction::End,
            ]
        );
    }

    #[test]
    fn name_section_decoded() {
        // (module $m)
        let bytes = with_sections(&[&[0, 9, 4, b'n', b'a', b'm', b'e', 0, 2, 1, b'm']]);
        let module = decode(bytes).expect("module");
        assert_eq!(module.names.module_name.as_deref(), Some("m"));
        assert!(module.custom.is_empty());
    }

    #[test]
    fn data_section_decoding() {
        let mem: &[u8] = &[5, 3, 1, 0x00, 1];
        // data: memory 0, offset (i32.const 8; end), 2 bytes
        let data: &[u8] = &[11, 8, 1, 0, 0x41, 8, 0x0b, 2, 0xca, 0xfe];
        let module = decode(with_sections(&[mem, data])).expect("module");
        let segment = &module.data.data[0];
        assert_eq!(segment.memory_index, 0);
        assert_eq!(segment.init, vec![0xca, 0xfe]);
        assert_eq!(
            segment.offset,
            vec![Instruction::I32Const { value: 8 }, Instruction::End]
        );
    }

    #[test]
    fn unknown_section_id() {
        let bytes = with_sections(&[&[13, 1, 0]]);
        assert!(matches!(
            decode(bytes),
            Err(DecodeError::UnknownSection { id: 13, .. })
        ));
    }
}
