//! The `name` custom section: module name plus function and local name maps.
//!
//! The facade is decoded from binaries and populated by the text assembler
//! from `$identifiers`; the encoder re-emits it when non-empty.

use super::encoding::{
    self, NAME_SUBSECTION_FUNCTION, NAME_SUBSECTION_LOCAL, NAME_SUBSECTION_MODULE,
};
use super::reader::Reader;
use super::DecodeError;
use std::collections::BTreeMap;

/// Decoded `name` section contents.
///
/// Maps are ordered so encoding is deterministic.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NameSection {
    pub module_name: Option<String>,
    /// function index -> name
    pub function_names: BTreeMap<u32, String>,
    /// function index -> (local index -> name)
    pub local_names: BTreeMap<u32, BTreeMap<u32, String>>,
}

impl NameSection {
    pub fn is_empty(&self) -> bool {
        self.module_name.is_none() && self.function_names.is_empty() && self.local_names.is_empty()
    }

    /// Decodes the payload of a `name` custom section (after the section
    /// name itself).
    pub fn decode(payload: Vec<u8>) -> Result<NameSection, DecodeError> {
        let mut names = NameSection::default();
        let mut reader = Reader::new(payload);

        while reader.has_at_least(1) {
            let id = reader.read_vu7()?;
            let len = reader.read_vu32()? as usize;
            let end = reader.pos() + len;
            if !reader.has_at_least(len) {
                return Err(DecodeError::UnexpectedEof { offset: reader.pos() });
            }
            match id {
                NAME_SUBSECTION_MODULE => {
                    names.module_name = Some(reader.read_name()?);
                }
                NAME_SUBSECTION_FUNCTION => {
                    let count = reader.read_vu32()?;
                    for _ in 0..count {
                        let index = reader.read_vu32()?;
                        let name = reader.read_name()?;
                        names.function_names.insert(index, name);
                    }
                }
                NAME_SUBSECTION_LOCAL => {
                    let count = reader.read_vu32()?;
                    for _ in 0..count {
                        let func_index = reader.read_vu32()?;
                        let local_count = reader.read_vu32()?;
                        let locals = names.local_names.entry(func_index).or_default();
                        for _ in 0..local_count {
                            let local_index = reader.read_vu32()?;
                            let name = reader.read_name()?;
                            locals.insert(local_index, name);
                        }
                    }
                }
                // Unknown subsections are skipped, not rejected: tools add
                // their own.
                _ => {}
            }
            reader.skip_to(end);
        }

        Ok(names)
    }

    /// Encodes the section payload, or `None` when there is nothing to emit.
    pub fn encode(&self) -> Option<Vec<u8>> {
        if self.is_empty() {
            return None;
        }

        let mut payload = Vec::new();

        if let Some(module_name) = &self.module_name {
            let mut sub = Vec::new();
            encoding::write_name(&mut sub, module_name);
            emit_subsection(&mut payload, NAME_SUBSECTION_MODULE, &sub);
        }

        if !self.function_names.is_empty() {
            let mut sub = Vec::new();
            encoding::write_vu32(&mut sub, self.function_names.len() as u32);
            for (index, name) in &self.function_names {
                encoding::write_vu32(&mut sub, *index);
                encoding::write_name(&mut sub, name);
            }
            emit_subsection(&mut payload, NAME_SUBSECTION_FUNCTION, &sub);
        }

        if !self.local_names.is_empty() {
            let mut sub = Vec::new();
            encoding::write_vu32(&mut sub, self.local_names.len() as u32);
            for (func_index, locals) in &self.local_names {
                encoding::write_vu32(&mut sub, *func_index);
                encoding::write_vu32(&mut sub, locals.len() as u32);
                for (local_index, name) in locals {
                    encoding::write_vu32(&mut sub, *local_index);
                    encoding::write_name(&mut sub, name);
                }
            }
            emit_subsection(&mut payload, NAME_SUBSECTION_LOCAL, &sub);
        }

        Some(payload)
    }
}

fn emit_subsection(buf: &mut Vec<u8>, id: u8, contents: &[u8]) {
    buf.push(id);
    encoding::write_vu32(buf, contents.len() as u32);
    buf.extend_from_slice(contents);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_encodes_to_nothing() {
        assert_eq!(NameSection::default().encode(), None);
    }

    #[test]
    fn module_name_roundtrip() {
        let names = NameSection {
            module_name: Some("m".to_string()),
            ..Default::default()
        };
        let payload = names.encode().unwrap();
        // subsection 0, length 2, name "m"
        assert_eq!(payload, vec![0, 2, 1, b'm']);
        assert_eq!(NameSection::decode(payload).unwrap(), names);
    }

    #[test]
    fn function_and_local_names_roundtrip() {
        let mut names = NameSection::default();
        names.function_names.insert(0, "add".to_string());
        names.function_names.insert(2, "mul".to_string());
        names
            .local_names
            .entry(0)
            .or_default()
            .insert(1, "rhs".to_string());

        let payload = names.encode().unwrap();
        assert_eq!(NameSection::decode(payload).unwrap(), names);
    }

    #[test]
    fn unknown_subsections_skipped() {
        // Subsection 9 (unknown), then a module name.
        let mut payload = vec![9, 3, 0xaa, 0xbb, 0xcc];
        payload.extend_from_slice(&[0, 2, 1, b'x']);
        let names = NameSection::decode(payload).unwrap();
        assert_eq!(names.module_name.as_deref(), Some("x"));
    }
}
