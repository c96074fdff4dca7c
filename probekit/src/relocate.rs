//! CO-RE relocation.
//!
//! Takes the pending relocations an [`Asm`](crate::insn::Asm) stream
//! accumulated, resolves each against the target kernel's BTF, and
//! patches the placeholder instruction's immediate in the assembled
//! bytecode. Existence probes resolve to 0 when the target is absent;
//! any other unresolvable site is stamped with the poison value so the
//! verifier rejects the program if the value is actually used.

use crate::btf::{Btf, TypeData};
use crate::error::{Error, Result};
use crate::insn::{CoreReloc, CoreRelocKind, CoreTarget, Insn};

/// Stamped into the immediate of an unresolvable non-probe site. The
/// value is the conventional CO-RE sentinel; the verifier refuses any
/// program that consumes it as a pointer offset.
pub const CORE_POISON: u32 = 0xbad2310;

/// Outcome of one relocation pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelocSummary {
    pub resolved: usize,
    pub poisoned: usize,
}

pub struct Relocator<'a> {
    btf: &'a Btf,
}

/// Where an access walk landed: accumulated bit offset from the root,
/// the final member's type, and bitfield geometry when the final member
/// is one.
struct FieldInfo {
    bit_offset: u64,
    type_id: u32,
    bitfield_size: Option<u32>,
}

impl<'a> Relocator<'a> {
    pub fn new(btf: &'a Btf) -> Self {
        Relocator { btf }
    }

    /// Resolve every record and patch `bytecode` in place.
    pub fn apply(&self, bytecode: &mut [u8], relocs: &[CoreReloc]) -> Result<RelocSummary> {
        let mut summary = RelocSummary::default();
        for reloc in relocs {
            if reloc.insn_offset + Insn::SIZE > bytecode.len() {
                return Err(Error::shape(format!(
                    "relocation at byte {} is outside the {}-byte program",
                    reloc.insn_offset,
                    bytecode.len()
                )));
            }
            let value = match self.resolve(reloc) {
                Ok(v) => {
                    summary.resolved += 1;
                    v
                }
                Err(err) if reloc.kind.is_existence_probe() => {
                    log::debug!("CO-RE probe {reloc:?} resolved absent: {err}");
                    summary.resolved += 1;
                    0
                }
                Err(err) => {
                    log::warn!("CO-RE relocation {reloc:?} failed ({err}); poisoning");
                    summary.poisoned += 1;
                    CORE_POISON
                }
            };
            let imm_at = reloc.insn_offset + 4;
            bytecode[imm_at..imm_at + 4].copy_from_slice(&value.to_le_bytes());
        }
        Ok(summary)
    }

    fn root_id(&self, target: &CoreTarget) -> Result<u32> {
        match target {
            CoreTarget::Id(id) => {
                self.btf.type_by_id(*id)?;
                Ok(*id)
            }
            CoreTarget::Name(name) => self
                .btf
                .find_by_name(name)
                .map(|(id, _)| id)
                .ok_or_else(|| Error::not_found(format!("BTF type {name}"))),
        }
    }

    fn resolve(&self, reloc: &CoreReloc) -> Result<u32> {
        use CoreRelocKind::*;
        let root = self.root_id(&reloc.target)?;
        match reloc.kind {
            TypeExists | TypeMatches => Ok(1),
            TypeIdLocal | TypeIdTarget => Ok(root),
            TypeSize => self.btf.size_of(root),
            EnumvalExists => {
                self.enum_value(root, &reloc.access)?;
                Ok(1)
            }
            EnumvalValue => {
                let value = self.enum_value(root, &reloc.access)?;
                Ok(value as u32)
            }
            FieldByteOffset => {
                let field = self.walk(root, &reloc.access)?;
                Ok((field.bit_offset / 8) as u32)
            }
            FieldByteSize => {
                let field = self.walk(root, &reloc.access)?;
                match field.bitfield_size {
                    Some(bits) => Ok(bits.div_ceil(8)),
                    None => self.btf.size_of(field.type_id),
                }
            }
            FieldExists => {
                self.walk(root, &reloc.access)?;
                Ok(1)
            }
            FieldSigned => {
                let field = self.walk(root, &reloc.access)?;
                let resolved = self.btf.resolve_qualifiers(field.type_id)?;
                let signed = matches!(
                    self.btf.type_by_id(resolved)?.data,
                    TypeData::Int { signed: true, .. }
                        | TypeData::Enum { signed: true, .. }
                        | TypeData::Enum64 { signed: true, .. }
                );
                Ok(signed as u32)
            }
            FieldLshiftU64 => {
                let (bit_offset, bit_size) = self.bitfield_geometry(root, &reloc.access)?;
                Ok((64 - (bit_offset % 8) - bit_size) as u32)
            }
            FieldRshiftU64 => {
                let (_, bit_size) = self.bitfield_geometry(root, &reloc.access)?;
                Ok((64 - bit_size) as u32)
            }
        }
    }

    fn enum_value(&self, root: u32, name: &str) -> Result<i64> {
        self.btf
            .enum_values(root)?
            .iter()
            .find(|v| v.name.as_deref() == Some(name))
            .map(|v| v.value)
            .ok_or_else(|| Error::not_found(format!("enumerator {name}")))
    }

    fn bitfield_geometry(&self, root: u32, access: &str) -> Result<(u64, u64)> {
        let field = self.walk(root, access)?;
        let bit_size = match field.bitfield_size {
            Some(bits) => bits as u64,
            // not declared as a bitfield: the extraction covers the
            // whole member
            None => self.btf.size_of(field.type_id)? as u64 * 8,
        };
        Ok((field.bit_offset, bit_size))
    }

    /// Walk an `"i0:i1:i2"` path. The leading index treats the root as
    /// an array element (almost always 0); each later index selects a
    /// struct/union member or an array element, peeling qualifiers as
    /// it goes.
    fn walk(&self, root: u32, access: &str) -> Result<FieldInfo> {
        let mut parts = access.split(':');
        let first: u64 = parts
            .next()
            .and_then(|p| p.parse().ok())
            .ok_or_else(|| Error::shape(format!("bad access string {access:?}")))?;

        let mut bit_offset = first * self.btf.size_of(root)? as u64 * 8;
        let mut type_id = root;
        let mut bitfield_size = None;

        for part in parts {
            let index: usize = part
                .parse()
                .map_err(|_| Error::shape(format!("bad access string {access:?}")))?;
            let resolved = self.btf.resolve_qualifiers(type_id)?;
            match &self.btf.type_by_id(resolved)?.data {
                TypeData::Struct { members, .. } | TypeData::Union { members, .. } => {
                    let member = members.get(index).ok_or_else(|| {
                        Error::not_found(format!("member index {index} of type {resolved}"))
                    })?;
                    bit_offset += member.bit_offset as u64;
                    type_id = member.type_id;
                    bitfield_size = (member.bit_size != 0).then_some(member.bit_size);
                }
                TypeData::Array {
                    elem_type, nelems, ..
                } => {
                    if index as u32 >= *nelems {
                        return Err(Error::not_found(format!(
                            "array index {index} of type {resolved}"
                        )));
                    }
                    bit_offset += index as u64 * self.btf.size_of(*elem_type)? as u64 * 8;
                    type_id = *elem_type;
                    bitfield_size = None;
                }
                other => {
                    return Err(Error::shape(format!(
                        "cannot index into {other:?} with {index}"
                    )));
                }
            }
        }
        Ok(FieldInfo {
            bit_offset,
            type_id,
            bitfield_size,
        })
    }
}

impl CoreRelocKind {
    /// Probes answer "absent" with 0 instead of poisoning.
    fn is_existence_probe(self) -> bool {
        matches!(
            self,
            CoreRelocKind::FieldExists
                | CoreRelocKind::TypeExists
                | CoreRelocKind::TypeMatches
                | CoreRelocKind::EnumvalExists
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::btf::testutil::BlobBuilder;
    use crate::insn::{Asm, Reg};

    /// u32 at 1, u64 at 2, struct s { u32 a; u64 b@bit32; } at 3.
    fn small_btf() -> Btf {
        let mut b = BlobBuilder::new();
        b.int("u32", 4, false);
        b.int("u64", 8, false);
        b.struct_("s", 12, &[("a", 1, 0), ("b", 2, 32)]);
        Btf::parse(&b.build()).unwrap()
    }

    fn imm_at(bytecode: &[u8], insn_offset: usize) -> u32 {
        u32::from_le_bytes(
            bytecode[insn_offset + 4..insn_offset + 8]
                .try_into()
                .unwrap(),
        )
    }

    #[test]
    fn field_byte_offset_resolves() {
        let btf = small_btf();
        let mut asm = Asm::new();
        asm.core_field_offset(Reg::R2, "s", "0:1").exit();
        let (mut bytecode, relocs) = asm.into_parts();

        let summary = Relocator::new(&btf).apply(&mut bytecode, &relocs).unwrap();
        assert_eq!(summary, RelocSummary { resolved: 1, poisoned: 0 });
        assert_eq!(imm_at(&bytecode, 0), 4);
        // the rest of the instruction is untouched
        assert_eq!(bytecode[0], 0xb7);
        assert_eq!(bytecode[1], 0x02);
    }

    #[test]
    fn missing_field_poisons_the_immediate() {
        let btf = small_btf();
        let mut asm = Asm::new();
        asm.core_field_offset(Reg::R0, "s", "0:7");
        let (mut bytecode, relocs) = asm.into_parts();

        let summary = Relocator::new(&btf).apply(&mut bytecode, &relocs).unwrap();
        assert_eq!(summary.poisoned, 1);
        assert_eq!(imm_at(&bytecode, 0), CORE_POISON);
        assert_eq!(bytecode[0], 0xb7, "opcode intact");
        assert_eq!(bytecode[2], 0, "offset intact");
    }

    #[test]
    fn existence_probes_answer_zero_not_poison() {
        let btf = small_btf();
        let mut asm = Asm::new();
        asm.core_field_exists(Reg::R0, "s", "0:1")
            .core_field_exists(Reg::R0, "s", "0:9")
            .core_type_exists(Reg::R0, "no_such_type");
        let (mut bytecode, relocs) = asm.into_parts();

        let summary = Relocator::new(&btf).apply(&mut bytecode, &relocs).unwrap();
        assert_eq!(summary.poisoned, 0);
        assert_eq!(imm_at(&bytecode, 0), 1);
        assert_eq!(imm_at(&bytecode, 8), 0);
        assert_eq!(imm_at(&bytecode, 16), 0);
    }

    #[test]
    fn type_size_and_id() {
        let btf = small_btf();
        let mut asm = Asm::new();
        asm.core_type_size(Reg::R1, "s").core_type_id(Reg::R1, "u64");
        let (mut bytecode, relocs) = asm.into_parts();

        Relocator::new(&btf).apply(&mut bytecode, &relocs).unwrap();
        assert_eq!(imm_at(&bytecode, 0), 12);
        assert_eq!(imm_at(&bytecode, 8), 2);
    }

    #[test]
    fn enum_values_resolve_by_name() {
        let mut b = BlobBuilder::new();
        b.enum_("io_dir", &[("READ", 0), ("WRITE", 1), ("FLUSH", 7)]);
        let btf = Btf::parse(&b.build()).unwrap();

        let mut asm = Asm::new();
        asm.core_enum_value(Reg::R3, "io_dir", "FLUSH")
            .core_enumval_exists(Reg::R3, "io_dir", "WRITE")
            .core_enumval_exists(Reg::R3, "io_dir", "TRIM");
        let (mut bytecode, relocs) = asm.into_parts();

        let summary = Relocator::new(&btf).apply(&mut bytecode, &relocs).unwrap();
        assert_eq!(summary.poisoned, 0);
        assert_eq!(imm_at(&bytecode, 0), 7);
        assert_eq!(imm_at(&bytecode, 8), 1);
        assert_eq!(imm_at(&bytecode, 16), 0);
    }

    #[test]
    fn bitfield_shift_derivation() {
        // struct flags { u32 full; u32 low:5 @ bit 37 } via kind_flag
        // packing: bit_size 5 << 24 | bit_offset 37.
        let mut b = BlobBuilder::new();
        b.int("u32", 4, false); // 1
        let name_off = b.str_off("flags");
        let full_off = b.str_off("full");
        let low_off = b.str_off("low");
        let info = (1 << 31) | (4 << 24) | 2u32;
        b.raw_type(name_off, info, 8, &[]);
        b.raw_type(full_off, 1, 0, &[]);
        b.raw_type(low_off, 1, (5 << 24) | 37, &[]);
        let btf = Btf::parse(&b.build()).unwrap();

        let mut asm = Asm::new();
        asm.core_field_lshift(Reg::R1, "flags", "0:1")
            .core_field_rshift(Reg::R1, "flags", "0:1")
            .core_field_size(Reg::R1, "flags", "0:1");
        let (mut bytecode, relocs) = asm.into_parts();
        Relocator::new(&btf).apply(&mut bytecode, &relocs).unwrap();

        // lshift = 64 - (37 % 8) - 5 = 54, rshift = 64 - 5 = 59
        assert_eq!(imm_at(&bytecode, 0), 54);
        assert_eq!(imm_at(&bytecode, 8), 59);
        assert_eq!(imm_at(&bytecode, 16), 1, "5 bits round up to one byte");
    }

    #[test]
    fn array_steps_accumulate_offsets() {
        // struct outer { u32 pad; u32 vals[4]; }, access 0:1:2
        let mut b = BlobBuilder::new();
        b.int("u32", 4, false); // 1
        b.raw_type(0, 3 << 24, 0, &[1, 1, 4]); // 2: u32[4]
        b.struct_("outer", 20, &[("pad", 1, 0), ("vals", 2, 32)]); // 3
        let btf = Btf::parse(&b.build()).unwrap();

        let mut asm = Asm::new();
        asm.core_field_offset(Reg::R1, "outer", "0:1:2");
        let (mut bytecode, relocs) = asm.into_parts();
        Relocator::new(&btf).apply(&mut bytecode, &relocs).unwrap();
        assert_eq!(imm_at(&bytecode, 0), 4 + 2 * 4);
    }
}
