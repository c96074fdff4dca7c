//! BTF (BPF Type Format) parsing and introspection.
//!
//! The kernel exports its own type graph at `/sys/kernel/btf/vmlinux`:
//! a 24-byte header, a type section, and a string section. Types are
//! indexed from 1 (0 is `void`) and reference each other by index;
//! qualifiers (typedef/const/volatile/restrict) form chains that must be
//! walked with a cycle guard because nothing in the format forbids a
//! malformed loop.

use std::path::Path;

use crate::error::{Error, Result};
use crate::util::{read_u32_le, trimmed_c_str};

pub const VMLINUX_BTF_PATH: &str = "/sys/kernel/btf/vmlinux";

const BTF_MAGIC: u16 = 0xeb9f;
const BTF_VERSION: u8 = 1;
const HEADER_LEN: usize = 24;

/// Upper bound on qualifier-chain hops before declaring a cycle.
const MAX_RESOLVE_DEPTH: usize = 32;

/// A struct or union member. `bit_size` is non-zero only for bitfields
/// declared through the kind_flag packing; bitfields in non-packed
/// structs surface through their int type's encoding instead.
#[derive(Debug, Clone)]
pub struct Member {
    pub name: Option<String>,
    pub type_id: u32,
    pub bit_offset: u32,
    pub bit_size: u32,
}

#[derive(Debug, Clone)]
pub struct EnumValue {
    pub name: Option<String>,
    pub value: i64,
}

#[derive(Debug, Clone)]
pub struct Param {
    pub name: Option<String>,
    pub type_id: u32,
}

#[derive(Debug, Clone)]
pub struct DatasecVar {
    pub type_id: u32,
    pub offset: u32,
    pub size: u32,
}

/// Kind-specific payload of a BTF type.
#[derive(Debug, Clone)]
pub enum TypeData {
    Void,
    Int {
        size: u32,
        bits: u8,
        bit_offset: u8,
        signed: bool,
        char: bool,
        bool_: bool,
    },
    Ptr {
        type_id: u32,
    },
    Array {
        elem_type: u32,
        index_type: u32,
        nelems: u32,
    },
    Struct {
        size: u32,
        members: Vec<Member>,
    },
    Union {
        size: u32,
        members: Vec<Member>,
    },
    Enum {
        size: u32,
        signed: bool,
        values: Vec<EnumValue>,
    },
    Enum64 {
        size: u32,
        signed: bool,
        values: Vec<EnumValue>,
    },
    Fwd {
        union_: bool,
    },
    Typedef {
        type_id: u32,
    },
    Volatile {
        type_id: u32,
    },
    Const {
        type_id: u32,
    },
    Restrict {
        type_id: u32,
    },
    Func {
        proto_type_id: u32,
        linkage: u32,
    },
    FuncProto {
        ret_type_id: u32,
        params: Vec<Param>,
    },
    Var {
        type_id: u32,
        linkage: u32,
    },
    Datasec {
        size: u32,
        vars: Vec<DatasecVar>,
    },
    Float {
        size: u32,
    },
    DeclTag {
        type_id: u32,
        component_index: i32,
    },
    TypeTag {
        type_id: u32,
    },
}

#[derive(Debug, Clone)]
pub struct BtfType {
    pub name: Option<String>,
    pub data: TypeData,
}

impl BtfType {
    fn void() -> Self {
        BtfType {
            name: None,
            data: TypeData::Void,
        }
    }
}

/// A parsed BTF blob: the ordered type vector, names already resolved
/// out of the string section.
pub struct Btf {
    types: Vec<BtfType>,
}

impl Btf {
    /// Load and parse the running kernel's type graph. A kernel built
    /// without CONFIG_DEBUG_INFO_BTF has no vmlinux blob to offer;
    /// that surfaces as `Unsupported` rather than a bare file error.
    pub fn vmlinux() -> Result<Self> {
        Self::from_file(VMLINUX_BTF_PATH).map_err(|e| match e {
            Error::Io(io) if io.kind() == std::io::ErrorKind::NotFound => Error::Unsupported {
                feature: format!("kernel BTF at {VMLINUX_BTF_PATH}"),
                kernel: crate::progs::kernel_release(),
            },
            other => other,
        })
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read(path.as_ref())?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &[u8]) -> Result<Self> {
        if raw.len() < HEADER_LEN {
            return Err(Error::shape("BTF blob shorter than its header"));
        }
        let magic = u16::from_le_bytes([raw[0], raw[1]]);
        if magic != BTF_MAGIC {
            return Err(Error::shape(format!("bad BTF magic {magic:#06x}")));
        }
        if raw[2] != BTF_VERSION {
            return Err(Error::shape(format!("unsupported BTF version {}", raw[2])));
        }
        let hdr_len = read_u32_le(raw, 4) as usize;
        let type_off = read_u32_le(raw, 8) as usize;
        let type_len = read_u32_le(raw, 12) as usize;
        let str_off = read_u32_le(raw, 16) as usize;
        let str_len = read_u32_le(raw, 20) as usize;

        let section = |off: usize, len: usize, what: &str| -> Result<&[u8]> {
            let start = hdr_len.checked_add(off);
            let end = start.and_then(|s| s.checked_add(len));
            match (start, end) {
                (Some(s), Some(e)) if e <= raw.len() => Ok(&raw[s..e]),
                _ => Err(Error::shape(format!("BTF {what} section out of bounds"))),
            }
        };
        let type_section = section(type_off, type_len, "type")?;
        let str_section = section(str_off, str_len, "string")?;

        let mut parser = TypeParser {
            buf: type_section,
            pos: 0,
            strings: str_section,
        };
        let mut types = vec![BtfType::void()];
        while parser.pos < parser.buf.len() {
            types.push(parser.next_type()?);
        }
        log::debug!("parsed BTF: {} types", types.len() - 1);
        Ok(Btf { types })
    }

    /// Number of real types (excluding the implicit void at 0).
    pub fn len(&self) -> usize {
        self.types.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn type_by_id(&self, id: u32) -> Result<&BtfType> {
        self.types
            .get(id as usize)
            .ok_or_else(|| Error::not_found(format!("BTF type id {id}")))
    }

    /// First type with the given name, scanning in index order.
    pub fn find_by_name(&self, name: &str) -> Option<(u32, &BtfType)> {
        self.types
            .iter()
            .enumerate()
            .find(|(_, t)| t.name.as_deref() == Some(name))
            .map(|(id, t)| (id as u32, t))
    }

    /// Id of the named function, as needed for `attach_btf_id`.
    pub fn find_func_id(&self, name: &str) -> Result<u32> {
        self.types
            .iter()
            .enumerate()
            .find(|(_, t)| {
                matches!(t.data, TypeData::Func { .. }) && t.name.as_deref() == Some(name)
            })
            .map(|(id, _)| id as u32)
            .ok_or_else(|| Error::not_found(format!("BTF function {name}")))
    }

    /// Chase typedef/const/volatile/restrict/type_tag down to the
    /// underlying type id.
    pub fn resolve_qualifiers(&self, mut id: u32) -> Result<u32> {
        for _ in 0..MAX_RESOLVE_DEPTH {
            match &self.type_by_id(id)?.data {
                TypeData::Typedef { type_id }
                | TypeData::Const { type_id }
                | TypeData::Volatile { type_id }
                | TypeData::Restrict { type_id }
                | TypeData::TypeTag { type_id } => id = *type_id,
                _ => return Ok(id),
            }
        }
        Err(Error::shape(format!(
            "qualifier chain from type id {id} exceeds {MAX_RESOLVE_DEPTH} hops"
        )))
    }

    /// Byte size of a type. Pointers are 8 on every supported ISA;
    /// arrays multiply out; sized kinds report their explicit size.
    pub fn size_of(&self, id: u32) -> Result<u32> {
        let id = self.resolve_qualifiers(id)?;
        match &self.type_by_id(id)?.data {
            TypeData::Ptr { .. } => Ok(8),
            TypeData::Array {
                elem_type, nelems, ..
            } => Ok(self.size_of(*elem_type)? * nelems),
            TypeData::Int { size, .. }
            | TypeData::Struct { size, .. }
            | TypeData::Union { size, .. }
            | TypeData::Enum { size, .. }
            | TypeData::Enum64 { size, .. }
            | TypeData::Float { size }
            | TypeData::Datasec { size, .. } => Ok(*size),
            other => Err(Error::shape(format!(
                "type id {id} ({other:?}) has no size"
            ))),
        }
    }

    /// Members of a struct or union, after peeling qualifiers.
    pub fn members(&self, id: u32) -> Result<&[Member]> {
        let id = self.resolve_qualifiers(id)?;
        match &self.type_by_id(id)?.data {
            TypeData::Struct { members, .. } | TypeData::Union { members, .. } => Ok(members),
            _ => Err(Error::shape(format!("type id {id} has no members"))),
        }
    }

    pub fn enum_values(&self, id: u32) -> Result<&[EnumValue]> {
        let id = self.resolve_qualifiers(id)?;
        match &self.type_by_id(id)?.data {
            TypeData::Enum { values, .. } | TypeData::Enum64 { values, .. } => Ok(values),
            _ => Err(Error::shape(format!("type id {id} is not an enum"))),
        }
    }

    /// Return type and parameters of a function or function prototype.
    pub fn func_signature(&self, id: u32) -> Result<(u32, &[Param])> {
        let id = self.resolve_qualifiers(id)?;
        let proto_id = match &self.type_by_id(id)?.data {
            TypeData::Func { proto_type_id, .. } => *proto_type_id,
            _ => id,
        };
        match &self.type_by_id(proto_id)?.data {
            TypeData::FuncProto {
                ret_type_id,
                params,
            } => Ok((*ret_type_id, params)),
            _ => Err(Error::shape(format!("type id {id} is not a function"))),
        }
    }
}

// kind numbers from uapi
const KIND_INT: u32 = 1;
const KIND_PTR: u32 = 2;
const KIND_ARRAY: u32 = 3;
const KIND_STRUCT: u32 = 4;
const KIND_UNION: u32 = 5;
const KIND_ENUM: u32 = 6;
const KIND_FWD: u32 = 7;
const KIND_TYPEDEF: u32 = 8;
const KIND_VOLATILE: u32 = 9;
const KIND_CONST: u32 = 10;
const KIND_RESTRICT: u32 = 11;
const KIND_FUNC: u32 = 12;
const KIND_FUNC_PROTO: u32 = 13;
const KIND_VAR: u32 = 14;
const KIND_DATASEC: u32 = 15;
const KIND_FLOAT: u32 = 16;
const KIND_DECL_TAG: u32 = 17;
const KIND_TYPE_TAG: u32 = 18;
const KIND_ENUM64: u32 = 19;

struct TypeParser<'a> {
    buf: &'a [u8],
    pos: usize,
    strings: &'a [u8],
}

impl<'a> TypeParser<'a> {
    fn take_u32(&mut self) -> Result<u32> {
        if self.pos + 4 > self.buf.len() {
            return Err(Error::shape("truncated BTF type section"));
        }
        let v = read_u32_le(self.buf, self.pos);
        self.pos += 4;
        Ok(v)
    }

    fn string(&self, offset: u32) -> Result<Option<String>> {
        if offset == 0 {
            return Ok(None);
        }
        let offset = offset as usize;
        if offset >= self.strings.len() {
            return Err(Error::shape(format!(
                "string offset {offset} outside the string section"
            )));
        }
        let bytes = trimmed_c_str(&self.strings[offset..]);
        let s = std::str::from_utf8(bytes)
            .map_err(|_| Error::shape("BTF string is not UTF-8"))?;
        Ok(Some(s.to_string()))
    }

    /// One `struct btf_type` record plus its kind-specific tail.
    fn next_type(&mut self) -> Result<BtfType> {
        let name_off = self.take_u32()?;
        let info = self.take_u32()?;
        let size_or_type = self.take_u32()?;

        let vlen = (info & 0xffff) as usize;
        let kind = (info >> 24) & 0x1f;
        let kind_flag = info >> 31 != 0;
        let name = self.string(name_off)?;

        let data = match kind {
            KIND_INT => {
                let enc = self.take_u32()?;
                TypeData::Int {
                    size: size_or_type,
                    bits: (enc & 0xff) as u8,
                    bit_offset: ((enc >> 16) & 0xff) as u8,
                    signed: enc & (1 << 24) != 0,
                    char: enc & (2 << 24) != 0,
                    bool_: enc & (4 << 24) != 0,
                }
            }
            KIND_PTR => TypeData::Ptr {
                type_id: size_or_type,
            },
            KIND_ARRAY => {
                let elem_type = self.take_u32()?;
                let index_type = self.take_u32()?;
                let nelems = self.take_u32()?;
                TypeData::Array {
                    elem_type,
                    index_type,
                    nelems,
                }
            }
            KIND_STRUCT | KIND_UNION => {
                let mut members = Vec::with_capacity(vlen);
                for _ in 0..vlen {
                    let m_name = self.take_u32()?;
                    let m_type = self.take_u32()?;
                    let m_offset = self.take_u32()?;
                    // kind_flag packs (bit_size << 24 | bit_offset)
                    let (bit_offset, bit_size) = if kind_flag {
                        (m_offset & 0x00ff_ffff, m_offset >> 24)
                    } else {
                        (m_offset, 0)
                    };
                    members.push(Member {
                        name: self.string(m_name)?,
                        type_id: m_type,
                        bit_offset,
                        bit_size,
                    });
                }
                if kind == KIND_STRUCT {
                    TypeData::Struct {
                        size: size_or_type,
                        members,
                    }
                } else {
                    TypeData::Union {
                        size: size_or_type,
                        members,
                    }
                }
            }
            KIND_ENUM => {
                let mut values = Vec::with_capacity(vlen);
                for _ in 0..vlen {
                    let v_name = self.take_u32()?;
                    let v_val = self.take_u32()? as i32;
                    values.push(EnumValue {
                        name: self.string(v_name)?,
                        value: v_val as i64,
                    });
                }
                TypeData::Enum {
                    size: size_or_type,
                    signed: kind_flag,
                    values,
                }
            }
            KIND_ENUM64 => {
                let mut values = Vec::with_capacity(vlen);
                for _ in 0..vlen {
                    let v_name = self.take_u32()?;
                    let lo = self.take_u32()? as u64;
                    let hi = self.take_u32()? as u64;
                    values.push(EnumValue {
                        name: self.string(v_name)?,
                        value: ((hi << 32) | lo) as i64,
                    });
                }
                TypeData::Enum64 {
                    size: size_or_type,
                    signed: kind_flag,
                    values,
                }
            }
            KIND_FWD => TypeData::Fwd { union_: kind_flag },
            KIND_TYPEDEF => TypeData::Typedef {
                type_id: size_or_type,
            },
            KIND_VOLATILE => TypeData::Volatile {
                type_id: size_or_type,
            },
            KIND_CONST => TypeData::Const {
                type_id: size_or_type,
            },
            KIND_RESTRICT => TypeData::Restrict {
                type_id: size_or_type,
            },
            KIND_FUNC => TypeData::Func {
                proto_type_id: size_or_type,
                linkage: vlen as u32,
            },
            KIND_FUNC_PROTO => {
                let mut params = Vec::with_capacity(vlen);
                for _ in 0..vlen {
                    let p_name = self.take_u32()?;
                    let p_type = self.take_u32()?;
                    params.push(Param {
                        name: self.string(p_name)?,
                        type_id: p_type,
                    });
                }
                TypeData::FuncProto {
                    ret_type_id: size_or_type,
                    params,
                }
            }
            KIND_VAR => {
                let linkage = self.take_u32()?;
                TypeData::Var {
                    type_id: size_or_type,
                    linkage,
                }
            }
            KIND_DATASEC => {
                let mut vars = Vec::with_capacity(vlen);
                for _ in 0..vlen {
                    let type_id = self.take_u32()?;
                    let offset = self.take_u32()?;
                    let size = self.take_u32()?;
                    vars.push(DatasecVar {
                        type_id,
                        offset,
                        size,
                    });
                }
                TypeData::Datasec {
                    size: size_or_type,
                    vars,
                }
            }
            KIND_FLOAT => TypeData::Float { size: size_or_type },
            KIND_DECL_TAG => {
                let component_index = self.take_u32()? as i32;
                TypeData::DeclTag {
                    type_id: size_or_type,
                    component_index,
                }
            }
            KIND_TYPE_TAG => TypeData::TypeTag {
                type_id: size_or_type,
            },
            other => {
                return Err(Error::shape(format!("unknown BTF kind {other}")));
            }
        };
        Ok(BtfType { name, data })
    }
}

/// Test-only blob builder shared with the relocator tests.
#[cfg(test)]
pub(crate) mod testutil {
    /// Assembles a valid BTF blob from raw type records and a string
    /// table. Strings are registered up front; `str_off(name)` yields
    /// the offset to embed in records.
    pub struct BlobBuilder {
        types: Vec<u8>,
        strings: Vec<u8>,
    }

    impl BlobBuilder {
        pub fn new() -> Self {
            BlobBuilder {
                types: Vec::new(),
                // offset 0 is the empty string by convention
                strings: vec![0],
            }
        }

        pub fn str_off(&mut self, s: &str) -> u32 {
            let off = self.strings.len() as u32;
            self.strings.extend_from_slice(s.as_bytes());
            self.strings.push(0);
            off
        }

        pub fn raw_type(&mut self, name_off: u32, info: u32, size_or_type: u32, tail: &[u32]) {
            self.types.extend_from_slice(&name_off.to_le_bytes());
            self.types.extend_from_slice(&info.to_le_bytes());
            self.types.extend_from_slice(&size_or_type.to_le_bytes());
            for word in tail {
                self.types.extend_from_slice(&word.to_le_bytes());
            }
        }

        pub fn int(&mut self, name: &str, size: u32, signed: bool) {
            let name_off = self.str_off(name);
            let enc = (size * 8) | if signed { 1 << 24 } else { 0 };
            self.raw_type(name_off, 1 << 24, size, &[enc]);
        }

        pub fn struct_(&mut self, name: &str, size: u32, members: &[(&str, u32, u32)]) {
            let name_off = self.str_off(name);
            let member_offs: Vec<u32> = members.iter().map(|(n, _, _)| self.str_off(n)).collect();
            let info = (4 << 24) | members.len() as u32;
            self.raw_type(name_off, info, size, &[]);
            for ((_, type_id, bit_offset), name_off) in members.iter().zip(member_offs) {
                self.raw_type(name_off, *type_id, *bit_offset, &[]);
            }
        }

        pub fn enum_(&mut self, name: &str, values: &[(&str, i32)]) {
            let name_off = self.str_off(name);
            let value_offs: Vec<u32> = values.iter().map(|(n, _)| self.str_off(n)).collect();
            let info = (6 << 24) | values.len() as u32;
            self.raw_type(name_off, info, 4, &[]);
            // enum value records are 8 bytes, not a full btf_type
            for ((_, value), name_off) in values.iter().zip(value_offs) {
                self.types.extend_from_slice(&name_off.to_le_bytes());
                self.types.extend_from_slice(&value.to_le_bytes());
            }
        }

        pub fn modifier(&mut self, kind: u32, type_id: u32) {
            self.raw_type(0, kind << 24, type_id, &[]);
        }

        pub fn build(&self) -> Vec<u8> {
            let mut blob = Vec::new();
            blob.extend_from_slice(&0xeb9fu16.to_le_bytes());
            blob.push(1); // version
            blob.push(0); // flags
            blob.extend_from_slice(&24u32.to_le_bytes()); // hdr_len
            blob.extend_from_slice(&0u32.to_le_bytes()); // type_off
            blob.extend_from_slice(&(self.types.len() as u32).to_le_bytes());
            blob.extend_from_slice(&(self.types.len() as u32).to_le_bytes()); // str_off
            blob.extend_from_slice(&(self.strings.len() as u32).to_le_bytes());
            blob.extend_from_slice(&self.types);
            blob.extend_from_slice(&self.strings);
            blob
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testutil::BlobBuilder;
    use super::*;

    /// u32 at 1, u64 at 2, struct pair { u32 a; u64 b; } at 3.
    fn pair_btf() -> Btf {
        let mut b = BlobBuilder::new();
        b.int("u32", 4, false);
        b.int("u64", 8, false);
        b.struct_("pair", 16, &[("a", 1, 0), ("b", 2, 64)]);
        Btf::parse(&b.build()).unwrap()
    }

    #[test]
    fn rejects_bad_magic() {
        let mut blob = BlobBuilder::new().build();
        blob[0] = 0x00;
        assert!(matches!(Btf::parse(&blob), Err(Error::InvalidShape { .. })));
    }

    #[test]
    fn parses_struct_with_two_members() {
        let mut b = BlobBuilder::new();
        b.int("u32", 4, false);
        b.struct_("point", 8, &[("a", 1, 0), ("b", 1, 32)]);
        let btf = Btf::parse(&b.build()).unwrap();

        let (id, ty) = btf.find_by_name("point").unwrap();
        assert_eq!(id, 2);
        match &ty.data {
            TypeData::Struct { size, members } => {
                assert_eq!(*size, 8);
                assert_eq!(members.len(), 2);
                assert_eq!(members[0].name.as_deref(), Some("a"));
                assert_eq!(members[0].bit_offset, 0);
                assert_eq!(members[1].name.as_deref(), Some("b"));
                assert_eq!(members[1].bit_offset, 32);
            }
            other => panic!("expected struct, got {other:?}"),
        }
        assert_eq!(btf.size_of(id).unwrap(), 8);
    }

    #[test]
    fn qualifier_chains_resolve_and_cycles_are_bounded() {
        let mut b = BlobBuilder::new();
        b.int("long", 8, true); // 1
        b.modifier(KIND_CONST, 1); // 2
        b.modifier(KIND_VOLATILE, 2); // 3
        // a two-type cycle
        b.modifier(KIND_TYPEDEF, 5); // 4
        b.modifier(KIND_TYPEDEF, 4); // 5
        let btf = Btf::parse(&b.build()).unwrap();

        assert_eq!(btf.resolve_qualifiers(3).unwrap(), 1);
        assert_eq!(btf.size_of(3).unwrap(), 8);
        assert!(btf.resolve_qualifiers(4).is_err());
    }

    #[test]
    fn enum_values_readable() {
        let mut b = BlobBuilder::new();
        b.enum_("state", &[("IDLE", 0), ("BUSY", 3), ("DEAD", -1)]);
        let btf = Btf::parse(&b.build()).unwrap();
        let values = btf.enum_values(1).unwrap();
        assert_eq!(values[1].name.as_deref(), Some("BUSY"));
        assert_eq!(values[1].value, 3);
        assert_eq!(values[2].value as i32, -1);
    }

    #[test]
    fn array_size_multiplies_out() {
        let mut b = BlobBuilder::new();
        b.int("u32", 4, false); // 1
        let name = 0;
        b.raw_type(name, 3 << 24, 0, &[1, 1, 16]); // 2: u32[16]
        let btf = Btf::parse(&b.build()).unwrap();
        assert_eq!(btf.size_of(2).unwrap(), 64);
    }

    #[test]
    fn pointers_are_eight_bytes() {
        let mut b = BlobBuilder::new();
        b.int("u32", 4, false); // 1
        b.modifier(KIND_PTR, 1); // 2
        let btf = Btf::parse(&b.build()).unwrap();
        assert_eq!(btf.size_of(2).unwrap(), 8);
    }

    #[test]
    fn member_bit_offsets_of_mixed_struct() {
        let btf = pair_btf();
        let members = btf.members(3).unwrap();
        assert_eq!(members[0].bit_offset, 0);
        assert_eq!(members[1].bit_offset, 64);
        assert_eq!(btf.size_of(members[1].type_id).unwrap(), 8);
    }
}
