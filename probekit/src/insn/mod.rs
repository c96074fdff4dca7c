//! The bytecode DSL.
//!
//! [`Insn`] is the fixed 8-byte instruction record; [`Asm`] in
//! [`builder`] emits streams of them. The `lddw` form occupies two
//! slots, the second a degenerate instruction carrying the upper
//! immediate bits.

pub mod builder;
pub mod opcode;

use std::fmt;

pub use builder::{Asm, CoreReloc, CoreRelocKind, CoreTarget};

/// An eBPF register. r0 holds helper returns and the exit code, r1-r5
/// are the helper calling convention, r6-r9 are callee-saved, r10 is
/// the read-only frame pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Reg {
    R0 = 0,
    R1 = 1,
    R2 = 2,
    R3 = 3,
    R4 = 4,
    R5 = 5,
    R6 = 6,
    R7 = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
}

/// One 8-byte instruction: opcode, packed register pair (dst in the low
/// nibble, src in the high), signed 16-bit offset, signed 32-bit
/// immediate.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct Insn {
    pub opcode: u8,
    pub regs: u8,
    pub offset: i16,
    pub imm: i32,
}

impl Insn {
    pub const SIZE: usize = 8;

    pub const fn new(opcode: u8, dst: u8, src: u8, offset: i16, imm: i32) -> Self {
        Insn {
            opcode,
            regs: (src << 4) | (dst & 0x0f),
            offset,
            imm,
        }
    }

    pub const fn dst(&self) -> u8 {
        self.regs & 0x0f
    }

    pub const fn src(&self) -> u8 {
        (self.regs >> 4) & 0x0f
    }

    /// Little-endian wire form.
    pub fn to_bytes(self) -> [u8; Self::SIZE] {
        let mut out = [0u8; Self::SIZE];
        out[0] = self.opcode;
        out[1] = self.regs;
        out[2..4].copy_from_slice(&self.offset.to_le_bytes());
        out[4..8].copy_from_slice(&self.imm.to_le_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8; Self::SIZE]) -> Self {
        Insn {
            opcode: bytes[0],
            regs: bytes[1],
            offset: i16::from_le_bytes([bytes[2], bytes[3]]),
            imm: i32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }

    /// True for the first slot of an `lddw` pair.
    pub const fn is_wide(&self) -> bool {
        self.opcode == 0x18
    }
}

impl fmt::Debug for Insn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Insn")
            .field("opcode", &format_args!("{:#04x}", self.opcode))
            .field("dst", &self.dst())
            .field("src", &self.src())
            .field("offset", &self.offset)
            .field("imm", &self.imm)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_is_eight_bytes() {
        assert_eq!(std::mem::size_of::<Insn>(), Insn::SIZE);
    }

    #[test]
    fn register_pair_packing() {
        let insn = Insn::new(0x07, 5, 3, 0, 0);
        assert_eq!(insn.dst(), 5);
        assert_eq!(insn.src(), 3);
        assert_eq!(insn.regs, 0x35);
    }

    #[test]
    fn wire_roundtrip() {
        let insn = Insn::new(0x63, 10, 1, -8, 0x7fff_0001);
        let decoded = Insn::from_bytes(&insn.to_bytes());
        assert_eq!(decoded, insn);
        assert_eq!(decoded.offset, -8);
    }
}
