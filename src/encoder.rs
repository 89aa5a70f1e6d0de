//! Encodes a [`Module`] to WebAssembly binary format (`.wasm`).
//!
//! This is the inverse of [`crate::parser::parse`]. Sections are emitted in
//! canonical id order, only when non-empty, with each payload serialised to
//! a staging buffer first so the section length prefix can be computed. All
//! integers use shortest-form LEB128, so `encode(parse(b)) == b` holds for
//! canonical inputs.

use crate::parser::encoding::{
    write_bytes, write_name, write_vu1, write_vu32, DESC_FUNC, DESC_GLOBAL, DESC_MEMORY,
    DESC_TABLE, LIMITS_MIN_MAX, LIMITS_MIN_ONLY, SECTION_CODE, SECTION_CUSTOM, SECTION_DATA,
    SECTION_ELEMENT, SECTION_EXPORT, SECTION_FUNCTION, SECTION_GLOBAL, SECTION_IMPORT,
    SECTION_MEMORY, SECTION_START, SECTION_TABLE, SECTION_TYPE, TYPE_FUNC,
};
use crate::parser::instruction::Instruction;
use crate::parser::module::{ExportIndex, ExternalKind, Limits, Module};

/// Encodes a module to its binary representation.
pub fn encode(module: &Module) -> Vec<u8> {
    let mut buf = Vec::new();

    buf.extend_from_slice(b"\0asm");
    buf.extend_from_slice(&1u32.to_le_bytes());

    encode_type_section(&mut buf, module);
    encode_import_section(&mut buf, module);
    encode_function_section(&mut buf, module);
    encode_table_section(&mut buf, module);
    encode_memory_section(&mut buf, module);
    encode_global_section(&mut buf, module);
    encode_export_section(&mut buf, module);
    encode_start_section(&mut buf, module);
    encode_element_section(&mut buf, module);
    encode_code_section(&mut buf, module);
    encode_data_section(&mut buf, module);
    encode_custom_sections(&mut buf, module);

    buf
}

// ===========================================================================
// Section encoders (in wire order)
// ===========================================================================

fn encode_type_section(buf: &mut Vec<u8>, module: &Module) {
    let types = &module.types.types;
    if types.is_empty() {
        return;
    }

    let mut contents = Vec::new();
    write_vu32(&mut contents, types.len() as u32);
    for ty in types {
        contents.push(TYPE_FUNC);
        write_vu32(&mut contents, ty.parameters.len() as u32);
        for p in &ty.parameters {
            contents.push(p.wire_byte());
        }
        write_vu32(&mut contents, ty.return_types.len() as u32);
        for r in &ty.return_types {
            contents.push(r.wire_byte());
        }
    }
    emit_section(buf, SECTION_TYPE, &contents);
}

fn encode_import_section(buf: &mut Vec<u8>, module: &Module) {
    let imports = &module.imports.imports;
    if imports.is_empty() {
        return;
    }

    let mut contents = Vec::new();
    write_vu32(&mut contents, imports.len() as u32);
    for import in imports {
        write_name(&mut contents, &import.module);
        write_name(&mut contents, &import.name);
        match &import.external_kind {
            ExternalKind::Function(type_idx) => {
                contents.push(DESC_FUNC);
                write_vu32(&mut contents, *type_idx);
            }
            ExternalKind::Table(table_type) => {
                contents.push(DESC_TABLE);
                contents.push(table_type.elem_type.wire_byte());
                emit_limits(&mut contents, &table_type.limits);
            }
            ExternalKind::Memory(limits) => {
                contents.push(DESC_MEMORY);
                emit_limits(&mut contents, limits);
            }
            ExternalKind::Global(global_type) => {
                contents.push(DESC_GLOBAL);
                contents.push(global_type.value_type.wire_byte());
                write_vu1(&mut contents, global_type.mutable);
            }
        }
    }
    emit_section(buf, SECTION_IMPORT, &contents);
}

fn encode_function_section(buf: &mut Vec<u8>, module: &Module) {
    let functions = &module.functions.functions;
    if functions.is_empty() {
        return;
    }

    let mut contents = Vec::new();
    write_vu32(&mut contents, functions.len() as u32);
    for function in functions {
        write_vu32(&mut contents, function.ftype_index);
    }
    emit_section(buf, SECTION_FUNCTION, &contents);
}

fn encode_table_section(buf: &mut Vec<u8>, module: &Module) {
    let tables = &module.tables.tables;
    if tables.is_empty() {
        return;
    }

    let mut contents = Vec::new();
    write_vu32(&mut contents, tables.len() as u32);
    for table in tables {
        contents.push(table.elem_type.wire_byte());
        emit_limits(&mut contents, &table.limits);
    }
    emit_section(buf, SECTION_TABLE, &contents);
}

fn encode_memory_section(buf: &mut Vec<u8>, module: &Module) {
    let memories = &module.memories.memories;
    if memories.is_empty() {
        return;
    }

    let mut contents = Vec::new();
    write_vu32(&mut contents, memories.len() as u32);
    for memory in memories {
        emit_limits(&mut contents, &memory.limits);
    }
    emit_section(buf, SECTION_MEMORY, &contents);
}

fn encode_global_section(buf: &mut Vec<u8>, module: &Module) {
    let globals = &module.globals.globals;
    if globals.is_empty() {
        return;
    }

    let mut contents = Vec::new();
    write_vu32(&mut contents, globals.len() as u32);
    for global in globals {
        contents.push(global.global_type.value_type.wire_byte());
        write_vu1(&mut contents, global.global_type.mutable);
        emit_expression(&mut contents, &global.init);
    }
    emit_section(buf, SECTION_GLOBAL, &contents);
}

fn encode_export_section(buf: &mut Vec<u8>, module: &Module) {
    let exports = &module.exports.exports;
    if exports.is_empty() {
        return;
    }

    let mut contents = Vec::new();
    write_vu32(&mut contents, exports.len() as u32);
    for export in exports {
        write_name(&mut contents, &export.name);
        match export.index {
            ExportIndex::Function(idx) => {
                contents.push(DESC_FUNC);
                write_vu32(&mut contents, idx);
            }
            ExportIndex::Table(idx) => {
                contents.push(DESC_TABLE);
                write_vu32(&mut contents, idx);
            }
            ExportIndex::Memory(idx) => {
                contents.push(DESC_MEMORY);
                write_vu32(&mut contents, idx);
            }
            ExportIndex::Global(idx) => {
                contents.push(DESC_GLOBAL);
                write_vu32(&mut contents, idx);
            }
        }
    }
    emit_section(buf, SECTION_EXPORT, &contents);
}

fn encode_start_section(buf: &mut Vec<u8>, module: &Module) {
    let Some(start) = module.start.start else {
        return;
    };

    let mut contents = Vec::new();
    write_vu32(&mut contents, start);
    emit_section(buf, SECTION_START, &contents);
}

fn encode_element_section(buf: &mut Vec<u8>, module: &Module) {
    let elements = &module.elements.elements;
    if elements.is_empty() {
        return;
    }

    let mut contents = Vec::new();
    write_vu32(&mut contents, elements.len() as u32);
    for element in elements {
        write_vu32(&mut contents, element.table_index);
        emit_expression(&mut contents, &element.offset);
        write_vu32(&mut contents, element.func_indices.len() as u32);
        for index in &element.func_indices {
            write_vu32(&mut contents, *index);
        }
    }
    emit_section(buf, SECTION_ELEMENT, &contents);
}

fn encode_code_section(buf: &mut Vec<u8>, module: &Module) {
    let bodies = &module.code.code;
    if bodies.is_empty() {
        return;
    }

    let mut contents = Vec::new();
    write_vu32(&mut contents, bodies.len() as u32);
    for body in bodies {
        // Stage the body so its size prefix can be computed.
        let mut staged = Vec::new();
        let groups = body.locals.groups();
        write_vu32(&mut staged, groups.len() as u32);
        for (count, value_type) in groups {
            write_vu32(&mut staged, *count);
            staged.push(value_type.wire_byte());
        }
        for instruction in &body.instructions {
            instruction.encode(&mut staged);
        }

        write_vu32(&mut contents, staged.len() as u32);
        contents.extend(staged);
    }
    emit_section(buf, SECTION_CODE, &contents);
}

fn encode_data_section(buf: &mut Vec<u8>, module: &Module) {
    let data = &module.data.data;
    if data.is_empty() {
        return;
    }

    let mut contents = Vec::new();
    write_vu32(&mut contents, data.len() as u32);
    for segment in data {
        write_vu32(&mut contents, segment.memory_index);
        emit_expression(&mut contents, &segment.offset);
        write_bytes(&mut contents, &segment.init);
    }
    emit_section(buf, SECTION_DATA, &contents);
}

/// Custom sections come last: the `name` section (when non-empty) followed
/// by any preserved custom sections.
fn encode_custom_sections(buf: &mut Vec<u8>, module: &Module) {
    if let Some(payload) = module.names.encode() {
        let mut contents = Vec::new();
        write_name(&mut contents, "name");
        contents.extend(payload);
        emit_section(buf, SECTION_CUSTOM, &contents);
    }
    for custom in &module.custom {
        let mut contents = Vec::new();
        write_name(&mut contents, &custom.name);
        contents.extend_from_slice(&custom.data);
        emit_section(buf, SECTION_CUSTOM, &contents);
    }
}

// ===========================================================================
// Shared helpers
// ===========================================================================

/// Wraps section contents with a section id and length prefix.
fn emit_section(buf: &mut Vec<u8>, id: u8, contents: &[u8]) {
    buf.push(id);
    write_vu32(buf, contents.len() as u32);
    buf.extend_from_slice(contents);
}

fn emit_limits(buf: &mut Vec<u8>, limits: &Limits) {
    match limits.max {
        Some(max) => {
            buf.push(LIMITS_MIN_MAX);
            write_vu32(buf, limits.min);
            write_vu32(buf, max);
        }
        None => {
            buf.push(LIMITS_MIN_ONLY);
            write_vu32(buf, limits.min);
        }
    }
}

/// Emits an initializer expression. The stored form already carries its
/// terminating `end`.
fn emit_expression(buf: &mut Vec<u8>, instructions: &[Instruction]) {
    for instruction in instructions {
        instruction.encode(buf);
    }
}
