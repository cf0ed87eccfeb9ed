// tagbus
//
// pure-rust tag I/O for PLCs over EtherNet/IP (CIP, PCCC) and Modbus TCP.
// Copyright: 2024, tagbus contributors
// License: MIT

//! controller tag directory and UDT template cache.
//!
//! Reading the special tag `@tags` fills the tag buffer with directory
//! records; `@udt/<id>` fetches one template definition. Parsed template
//! descriptors are cached for the life of the process, keyed by template
//! id, with insertion on first encounter and no eviction.

use crate::cip;
use crate::slice::Slice;
use crate::{ErrorKind, Result};
use once_cell::sync::Lazy;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// symbol type flag marking a structured tag; the low bits carry the
/// template id
pub const SYMBOL_TYPE_STRUCT: u16 = 0x8000;
pub const SYMBOL_TEMPLATE_MASK: u16 = 0x0FFF;

/// one record of the controller tag directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TagDirEntry {
    pub instance_id: u32,
    pub name: String,
    pub symbol_type: u16,
    pub elem_size: u16,
    pub dims: [u32; 3],
}

impl TagDirEntry {
    /// template id when this symbol is a structure
    pub fn template_id(&self) -> Option<u16> {
        if self.symbol_type & SYMBOL_TYPE_STRUCT != 0 {
            Some(self.symbol_type & SYMBOL_TEMPLATE_MASK)
        } else {
            None
        }
    }

    /// serialize one record; the test server uses this to answer
    /// directory requests in the exact format the client parses
    pub fn encode_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.instance_id.to_le_bytes());
        out.extend_from_slice(&(self.name.len() as u16).to_le_bytes());
        out.extend_from_slice(self.name.as_bytes());
        out.extend_from_slice(&self.symbol_type.to_le_bytes());
        out.extend_from_slice(&self.elem_size.to_le_bytes());
        for dim in self.dims {
            out.extend_from_slice(&dim.to_le_bytes());
        }
    }
}

fn parse_entry(input: &Slice<'_>, offset: usize) -> Result<(TagDirEntry, usize)> {
    let instance_id = input.u32_le(offset);
    let name_len = input.u16_le(offset + 4) as usize;
    let name_slice = input.sub(offset + 6, name_len);
    if input.has_error() {
        return Err(ErrorKind::BadReply.into());
    }
    let name = String::from_utf8_lossy(name_slice.bytes()).into_owned();
    let mut pos = offset + 6 + name_len;
    let symbol_type = input.u16_le(pos);
    let elem_size = input.u16_le(pos + 2);
    pos += 4;
    let mut dims = [0u32; 3];
    for dim in dims.iter_mut() {
        *dim = input.u32_le(pos);
        pos += 4;
    }
    if input.has_error() {
        return Err(ErrorKind::BadReply.into());
    }
    Ok((
        TagDirEntry {
            instance_id,
            name,
            symbol_type,
            elem_size,
            dims,
        },
        pos,
    ))
}

/// parse a complete tag directory payload
pub fn parse_tag_directory(bytes: &[u8]) -> Result<Vec<TagDirEntry>> {
    let input = Slice::new(bytes);
    let mut entries = Vec::new();
    let mut offset = 0;
    while offset < bytes.len() {
        let (entry, next) = parse_entry(&input, offset)?;
        entries.push(entry);
        offset = next;
    }
    Ok(entries)
}

/// the highest instance id in a (possibly partial) directory payload;
/// the next listing request continues one past it
pub(crate) fn last_instance_id(bytes: &[u8]) -> Option<u32> {
    let input = Slice::new(bytes);
    let mut offset = 0;
    let mut last = None;
    while offset < bytes.len() {
        let (entry, next) = parse_entry(&input, offset).ok()?;
        last = Some(entry.instance_id);
        offset = next;
    }
    last
}

/// one field of a user-defined type
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdtField {
    pub name: String,
    pub type_code: u16,
    /// array count for array fields, bit number for packed bools
    pub info: u16,
    pub offset: u32,
    /// size in bytes when the field type is atomic
    pub size: usize,
}

/// a cached user-defined type descriptor
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UdtDef {
    pub id: u16,
    pub handle: u16,
    pub instance_size: u32,
    pub name: String,
    pub fields: Vec<UdtField>,
}

impl UdtDef {
    /// serialize in the template wire format; shared with the test server
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&(self.fields.len() as u16).to_le_bytes());
        out.extend_from_slice(&self.handle.to_le_bytes());
        out.extend_from_slice(&self.instance_size.to_le_bytes());
        for field in &self.fields {
            out.extend_from_slice(&field.info.to_le_bytes());
            out.extend_from_slice(&field.type_code.to_le_bytes());
            out.extend_from_slice(&field.offset.to_le_bytes());
        }
        out.extend_from_slice(self.name.as_bytes());
        out.push(b';');
        for field in &self.fields {
            out.extend_from_slice(field.name.as_bytes());
            out.push(0);
        }
        out
    }
}

/// parse a template payload: field records then the semicolon-terminated
/// template name and null-terminated field names
pub fn parse_template(id: u16, bytes: &[u8]) -> Result<UdtDef> {
    let input = Slice::new(bytes);
    let field_count = input.u16_le(0) as usize;
    let handle = input.u16_le(2);
    let instance_size = input.u32_le(4);
    if input.has_error() {
        return Err(ErrorKind::BadReply.into());
    }

    let mut fields = Vec::with_capacity(field_count);
    let mut offset = 8;
    for _ in 0..field_count {
        let info = input.u16_le(offset);
        let type_code = input.u16_le(offset + 2);
        let field_offset = input.u32_le(offset + 4);
        offset += 8;
        if input.has_error() {
            return Err(ErrorKind::BadReply.into());
        }
        fields.push(UdtField {
            name: String::new(),
            type_code,
            info,
            offset: field_offset,
            size: cip::atomic_type_size(type_code).unwrap_or(0),
        });
    }

    let names = &bytes[offset.min(bytes.len())..];
    let mut parts = names.split(|&b| b == b';');
    let name = String::from_utf8_lossy(parts.next().unwrap_or(&[])).into_owned();
    let rest = parts.next().unwrap_or(&[]);
    for (field, raw) in fields.iter_mut().zip(rest.split(|&b| b == 0)) {
        field.name = String::from_utf8_lossy(raw).into_owned();
    }

    Ok(UdtDef {
        id,
        handle,
        instance_size,
        name,
        fields,
    })
}

static CACHE: Lazy<RwLock<HashMap<u16, Arc<UdtDef>>>> = Lazy::new(|| RwLock::new(HashMap::new()));

/// look up a cached template definition
pub fn lookup(id: u16) -> Option<Arc<UdtDef>> {
    CACHE.read().get(&id).cloned()
}

/// insert a parsed definition; the first insertion wins
pub fn insert(def: UdtDef) -> Arc<UdtDef> {
    let mut cache = CACHE.write();
    Arc::clone(cache.entry(def.id).or_insert_with(|| Arc::new(def)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_entries() -> Vec<TagDirEntry> {
        vec![
            TagDirEntry {
                instance_id: 1,
                name: "TestBigArray".into(),
                symbol_type: cip::TYPE_DINT,
                elem_size: 4,
                dims: [10, 0, 0],
            },
            TagDirEntry {
                instance_id: 5,
                name: "Pos".into(),
                symbol_type: SYMBOL_TYPE_STRUCT | 0x0123,
                elem_size: 16,
                dims: [0, 0, 0],
            },
        ]
    }

    #[test]
    fn test_directory_roundtrip() {
        let entries = sample_entries();
        let mut payload = Vec::new();
        let mut expected_len = 0;
        for entry in &entries {
            entry.encode_to(&mut payload);
            // id + name length word + name + type + size + three dims
            expected_len += 4 + 2 + entry.name.len() + 2 + 2 + 12;
        }
        assert_eq!(payload.len(), expected_len);
        let parsed = parse_tag_directory(&payload).unwrap();
        assert_eq!(parsed, entries);
        assert_eq!(last_instance_id(&payload), Some(5));
    }

    #[test]
    fn test_template_id_extraction() {
        let entries = sample_entries();
        assert_eq!(entries[0].template_id(), None);
        assert_eq!(entries[1].template_id(), Some(0x0123));
    }

    #[test]
    fn test_truncated_directory_is_bad_reply() {
        let mut payload = Vec::new();
        sample_entries()[0].encode_to(&mut payload);
        payload.truncate(payload.len() - 3);
        assert!(parse_tag_directory(&payload).is_err());
        assert_eq!(last_instance_id(&payload), None);
    }

    #[test]
    fn test_template_roundtrip_and_cache() {
        let def = UdtDef {
            id: 0x0123,
            handle: 0xBEEF,
            instance_size: 12,
            name: "Pos".into(),
            fields: vec![
                UdtField {
                    name: "x".into(),
                    type_code: cip::TYPE_REAL,
                    info: 0,
                    offset: 0,
                    size: 4,
                },
                UdtField {
                    name: "y".into(),
                    type_code: cip::TYPE_REAL,
                    info: 0,
                    offset: 4,
                    size: 4,
                },
                UdtField {
                    name: "ts".into(),
                    type_code: cip::TYPE_LINT,
                    info: 0,
                    offset: 8,
                    size: 8,
                },
            ],
        };
        let parsed = parse_template(0x0123, &def.encode()).unwrap();
        assert_eq!(parsed, def);

        let cached = insert(parsed);
        assert_eq!(lookup(0x0123).as_deref(), Some(cached.as_ref()));
        // first insertion wins
        let mut other = def.clone();
        other.name = "Other".into();
        insert(other);
        assert_eq!(lookup(0x0123).unwrap().name, "Pos");
    }
}
