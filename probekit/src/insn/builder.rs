//! Instruction stream assembly.
//!
//! [`Asm`] accumulates instructions; single-instruction emitters append
//! one record, macro emitters (helper calls, ring-buffer sequences)
//! append several. CO-RE emitters append a placeholder `mov dst, 0` and
//! register a pending relocation that the relocator patches before load.

use std::os::fd::RawFd;

use crate::arch;
use crate::consts::{helper, PSEUDO_MAP_FD};
use crate::error::Result;
use crate::insn::opcode::{self, AluOp, Class, JmpOp, MemMode, MemSize, Src};
use crate::insn::{Insn, Reg};

/// What a CO-RE site should resolve against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoreTarget {
    /// A type id in the target BTF.
    Id(u32),
    /// A type name, resolved through find-by-name at relocation time.
    Name(String),
}

impl From<u32> for CoreTarget {
    fn from(id: u32) -> Self {
        CoreTarget::Id(id)
    }
}

impl From<&str> for CoreTarget {
    fn from(name: &str) -> Self {
        CoreTarget::Name(name.to_string())
    }
}

/// The relocation kinds the resolver understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreRelocKind {
    FieldByteOffset,
    FieldByteSize,
    FieldExists,
    FieldSigned,
    FieldLshiftU64,
    FieldRshiftU64,
    TypeIdLocal,
    TypeIdTarget,
    TypeExists,
    TypeSize,
    EnumvalExists,
    EnumvalValue,
    TypeMatches,
}

/// A pending CO-RE relocation: which instruction to patch, against what
/// type, along which access path.
///
/// The access string is a colon-separated member index path (`"0:1:2"`)
/// for field kinds, or an enumerator name for the enumval kinds.
#[derive(Debug, Clone)]
pub struct CoreReloc {
    /// Byte offset of the placeholder instruction within the stream.
    pub insn_offset: usize,
    pub target: CoreTarget,
    pub access: String,
    pub kind: CoreRelocKind,
}

/// An instruction stream under construction.
#[derive(Default)]
pub struct Asm {
    insns: Vec<Insn>,
    relocs: Vec<CoreReloc>,
}

impl Asm {
    pub fn new() -> Self {
        Asm::default()
    }

    pub fn push(&mut self, insn: Insn) -> &mut Self {
        self.insns.push(insn);
        self
    }

    /// Byte offset the next instruction will land at.
    pub fn cursor(&self) -> usize {
        self.insns.len() * Insn::SIZE
    }

    pub fn insns(&self) -> &[Insn] {
        &self.insns
    }

    pub fn relocs(&self) -> &[CoreReloc] {
        &self.relocs
    }

    /// Concatenate every instruction into wire bytes.
    pub fn assemble(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.insns.len() * Insn::SIZE);
        for insn in &self.insns {
            out.extend_from_slice(&insn.to_bytes());
        }
        out
    }

    pub fn into_parts(self) -> (Vec<u8>, Vec<CoreReloc>) {
        let bytes = self.assemble();
        (bytes, self.relocs)
    }

    // -- ALU ---------------------------------------------------------------

    pub fn alu64(&mut self, op: AluOp, dst: Reg, imm: i32) -> &mut Self {
        self.push(Insn::new(
            opcode::alu(Class::Alu64, op, Src::Imm),
            dst as u8,
            0,
            0,
            imm,
        ))
    }

    pub fn alu64_reg(&mut self, op: AluOp, dst: Reg, src: Reg) -> &mut Self {
        self.push(Insn::new(
            opcode::alu(Class::Alu64, op, Src::Reg),
            dst as u8,
            src as u8,
            0,
            0,
        ))
    }

    pub fn alu32(&mut self, op: AluOp, dst: Reg, imm: i32) -> &mut Self {
        self.push(Insn::new(
            opcode::alu(Class::Alu, op, Src::Imm),
            dst as u8,
            0,
            0,
            imm,
        ))
    }

    pub fn alu32_reg(&mut self, op: AluOp, dst: Reg, src: Reg) -> &mut Self {
        self.push(Insn::new(
            opcode::alu(Class::Alu, op, Src::Reg),
            dst as u8,
            src as u8,
            0,
            0,
        ))
    }

    pub fn mov64(&mut self, dst: Reg, imm: i32) -> &mut Self {
        self.alu64(AluOp::Mov, dst, imm)
    }

    pub fn mov64_reg(&mut self, dst: Reg, src: Reg) -> &mut Self {
        self.alu64_reg(AluOp::Mov, dst, src)
    }

    pub fn add64(&mut self, dst: Reg, imm: i32) -> &mut Self {
        self.alu64(AluOp::Add, dst, imm)
    }

    pub fn sub64(&mut self, dst: Reg, imm: i32) -> &mut Self {
        self.alu64(AluOp::Sub, dst, imm)
    }

    pub fn neg64(&mut self, dst: Reg) -> &mut Self {
        self.push(Insn::new(
            opcode::alu(Class::Alu64, AluOp::Neg, Src::Imm),
            dst as u8,
            0,
            0,
            0,
        ))
    }

    // -- jumps -------------------------------------------------------------

    pub fn ja(&mut self, offset: i16) -> &mut Self {
        self.push(Insn::new(
            opcode::jump(Class::Jmp, JmpOp::Ja, Src::Imm),
            0,
            0,
            offset,
            0,
        ))
    }

    pub fn jmp_imm(&mut self, op: JmpOp, dst: Reg, imm: i32, offset: i16) -> &mut Self {
        self.push(Insn::new(
            opcode::jump(Class::Jmp, op, Src::Imm),
            dst as u8,
            0,
            offset,
            imm,
        ))
    }

    pub fn jmp_reg(&mut self, op: JmpOp, dst: Reg, src: Reg, offset: i16) -> &mut Self {
        self.push(Insn::new(
            opcode::jump(Class::Jmp, op, Src::Reg),
            dst as u8,
            src as u8,
            offset,
            0,
        ))
    }

    pub fn jmp32_imm(&mut self, op: JmpOp, dst: Reg, imm: i32, offset: i16) -> &mut Self {
        self.push(Insn::new(
            opcode::jump(Class::Jmp32, op, Src::Imm),
            dst as u8,
            0,
            offset,
            imm,
        ))
    }

    pub fn call(&mut self, helper_id: i32) -> &mut Self {
        self.push(Insn::new(
            opcode::jump(Class::Jmp, JmpOp::Call, Src::Imm),
            0,
            0,
            0,
            helper_id,
        ))
    }

    pub fn exit(&mut self) -> &mut Self {
        self.push(Insn::new(
            opcode::jump(Class::Jmp, JmpOp::Exit, Src::Imm),
            0,
            0,
            0,
            0,
        ))
    }

    // -- memory ------------------------------------------------------------

    /// `dst = *(size *)(src + offset)`
    pub fn load(&mut self, size: MemSize, dst: Reg, src: Reg, offset: i16) -> &mut Self {
        self.push(Insn::new(
            opcode::mem(Class::Ldx, size, MemMode::Mem),
            dst as u8,
            src as u8,
            offset,
            0,
        ))
    }

    /// `*(size *)(dst + offset) = src`
    pub fn store_reg(&mut self, size: MemSize, dst: Reg, src: Reg, offset: i16) -> &mut Self {
        self.push(Insn::new(
            opcode::mem(Class::Stx, size, MemMode::Mem),
            dst as u8,
            src as u8,
            offset,
            0,
        ))
    }

    /// `*(size *)(dst + offset) = imm`
    pub fn store_imm(&mut self, size: MemSize, dst: Reg, offset: i16, imm: i32) -> &mut Self {
        self.push(Insn::new(
            opcode::mem(Class::St, size, MemMode::Mem),
            dst as u8,
            0,
            offset,
            imm,
        ))
    }

    /// Load a 64-bit immediate: two slots, upper half in the second imm.
    pub fn lddw(&mut self, dst: Reg, value: u64) -> &mut Self {
        self.push(Insn::new(
            opcode::mem(Class::Ld, MemSize::DWord, MemMode::Imm),
            dst as u8,
            0,
            0,
            value as u32 as i32,
        ));
        self.push(Insn::new(0, 0, 0, 0, (value >> 32) as u32 as i32))
    }

    /// `lddw` with src=1, which tells the verifier the immediate is a
    /// map FD to be rewritten into a map pointer at load time.
    pub fn ld_map_fd(&mut self, dst: Reg, map_fd: RawFd) -> &mut Self {
        self.push(Insn::new(
            opcode::mem(Class::Ld, MemSize::DWord, MemMode::Imm),
            dst as u8,
            PSEUDO_MAP_FD,
            0,
            map_fd,
        ));
        self.push(Insn::new(0, 0, 0, 0, 0))
    }

    /// `STX|ATOMIC`: apply `op` (an `opcode::atomic` selector) to
    /// `*(size *)(dst + offset)` with operand `src`. Word and double-word
    /// widths only; the selector already carries the fetch bit where the
    /// operation returns the old value.
    pub fn atomic(&mut self, op: i32, size: MemSize, dst: Reg, src: Reg, offset: i16) -> &mut Self {
        debug_assert!(matches!(size, MemSize::Word | MemSize::DWord));
        self.push(Insn::new(
            opcode::mem(Class::Stx, size, MemMode::Atomic),
            dst as u8,
            src as u8,
            offset,
            op,
        ))
    }

    pub fn atomic_add(&mut self, size: MemSize, dst: Reg, src: Reg, offset: i16, fetch: bool) -> &mut Self {
        let op = opcode::atomic::ADD | if fetch { opcode::atomic::FETCH } else { 0 };
        self.atomic(op, size, dst, src, offset)
    }

    pub fn atomic_xchg(&mut self, size: MemSize, dst: Reg, src: Reg, offset: i16) -> &mut Self {
        self.atomic(opcode::atomic::XCHG, size, dst, src, offset)
    }

    pub fn atomic_cmpxchg(&mut self, size: MemSize, dst: Reg, src: Reg, offset: i16) -> &mut Self {
        self.atomic(opcode::atomic::CMPXCHG, size, dst, src, offset)
    }

    // -- probed-context access ---------------------------------------------

    /// Load the probed function's i-th argument out of the `pt_regs`
    /// context pointer.
    pub fn kprobe_arg(&mut self, dst: Reg, ctx: Reg, index: usize) -> Result<&mut Self> {
        let offset = arch::kprobe_arg_offset(index)?;
        Ok(self.load(MemSize::DWord, dst, ctx, offset))
    }

    // -- helper wrappers ---------------------------------------------------
    //
    // Each wrapper sets up r1..r5 per the calling convention and emits
    // the call; the result lands in r0. Stack offsets are relative to
    // r10 and must be negative.

    /// r0 = pointer to the value for the key at `fp + key_offset`, or 0.
    pub fn map_lookup_elem(&mut self, map_fd: RawFd, key_offset: i16) -> &mut Self {
        self.ld_map_fd(Reg::R1, map_fd);
        self.mov64_reg(Reg::R2, Reg::R10);
        self.add64(Reg::R2, key_offset as i32);
        self.call(helper::MAP_LOOKUP_ELEM)
    }

    pub fn map_update_elem(
        &mut self,
        map_fd: RawFd,
        key_offset: i16,
        value_offset: i16,
        flags: i32,
    ) -> &mut Self {
        self.ld_map_fd(Reg::R1, map_fd);
        self.mov64_reg(Reg::R2, Reg::R10);
        self.add64(Reg::R2, key_offset as i32);
        self.mov64_reg(Reg::R3, Reg::R10);
        self.add64(Reg::R3, value_offset as i32);
        self.mov64(Reg::R4, flags);
        self.call(helper::MAP_UPDATE_ELEM)
    }

    pub fn map_delete_elem(&mut self, map_fd: RawFd, key_offset: i16) -> &mut Self {
        self.ld_map_fd(Reg::R1, map_fd);
        self.mov64_reg(Reg::R2, Reg::R10);
        self.add64(Reg::R2, key_offset as i32);
        self.call(helper::MAP_DELETE_ELEM)
    }

    /// Jump into the program at `index` of a prog_array. On a missing
    /// slot the helper falls through and execution continues here.
    pub fn tail_call(&mut self, ctx: Reg, prog_array_fd: RawFd, index: i32) -> &mut Self {
        if ctx != Reg::R1 {
            self.mov64_reg(Reg::R1, ctx);
        }
        self.ld_map_fd(Reg::R2, prog_array_fd);
        self.mov64(Reg::R3, index);
        self.call(helper::TAIL_CALL)
    }

    pub fn ktime_get_ns(&mut self) -> &mut Self {
        self.call(helper::KTIME_GET_NS)
    }

    pub fn get_current_pid_tgid(&mut self) -> &mut Self {
        self.call(helper::GET_CURRENT_PID_TGID)
    }

    pub fn get_current_uid_gid(&mut self) -> &mut Self {
        self.call(helper::GET_CURRENT_UID_GID)
    }

    pub fn get_smp_processor_id(&mut self) -> &mut Self {
        self.call(helper::GET_SMP_PROCESSOR_ID)
    }

    pub fn get_prandom_u32(&mut self) -> &mut Self {
        self.call(helper::GET_PRANDOM_U32)
    }

    /// Copy the current task's comm into `fp + buf_offset`.
    pub fn get_current_comm(&mut self, buf_offset: i16, len: i32) -> &mut Self {
        self.mov64_reg(Reg::R1, Reg::R10);
        self.add64(Reg::R1, buf_offset as i32);
        self.mov64(Reg::R2, len);
        self.call(helper::GET_CURRENT_COMM)
    }

    /// Read `size` kernel bytes from the address in `src` into
    /// `fp + dst_offset`.
    pub fn probe_read_kernel(&mut self, dst_offset: i16, size: i32, src: Reg) -> &mut Self {
        self.mov64_reg(Reg::R1, Reg::R10);
        self.add64(Reg::R1, dst_offset as i32);
        self.mov64(Reg::R2, size);
        if src != Reg::R3 {
            self.mov64_reg(Reg::R3, src);
        }
        self.call(helper::PROBE_READ_KERNEL)
    }

    /// Emit `size` bytes at `fp + data_offset` through a perf event
    /// array. `flags` is a full 64-bit value because BPF_F_CURRENT_CPU
    /// does not survive the sign-extending `mov`.
    pub fn perf_event_output(
        &mut self,
        ctx: Reg,
        map_fd: RawFd,
        flags: u64,
        data_offset: i16,
        size: i32,
    ) -> &mut Self {
        if ctx != Reg::R1 {
            self.mov64_reg(Reg::R1, ctx);
        }
        self.ld_map_fd(Reg::R2, map_fd);
        self.lddw(Reg::R3, flags);
        self.mov64_reg(Reg::R4, Reg::R10);
        self.add64(Reg::R4, data_offset as i32);
        self.mov64(Reg::R5, size);
        self.call(helper::PERF_EVENT_OUTPUT)
    }

    /// Copy `size` bytes at `fp + data_offset` into the ring buffer in
    /// one step.
    pub fn ringbuf_output(&mut self, map_fd: RawFd, data_offset: i16, size: i32) -> &mut Self {
        self.ld_map_fd(Reg::R1, map_fd);
        self.mov64_reg(Reg::R2, Reg::R10);
        self.add64(Reg::R2, data_offset as i32);
        self.mov64(Reg::R3, size);
        self.mov64(Reg::R4, 0);
        self.call(helper::RINGBUF_OUTPUT)
    }

    /// r0 = reserved pointer, or 0 when the buffer is full. The caller
    /// must branch on NULL before storing through it, and must release
    /// the reservation with [`Asm::ringbuf_submit`] or
    /// [`Asm::ringbuf_discard`] on every path.
    pub fn ringbuf_reserve(&mut self, map_fd: RawFd, size: i32) -> &mut Self {
        self.ld_map_fd(Reg::R1, map_fd);
        self.mov64(Reg::R2, size);
        self.mov64(Reg::R3, 0);
        self.call(helper::RINGBUF_RESERVE)
    }

    pub fn ringbuf_submit(&mut self, record: Reg) -> &mut Self {
        if record != Reg::R1 {
            self.mov64_reg(Reg::R1, record);
        }
        self.mov64(Reg::R2, 0);
        self.call(helper::RINGBUF_SUBMIT)
    }

    pub fn ringbuf_discard(&mut self, record: Reg) -> &mut Self {
        if record != Reg::R1 {
            self.mov64_reg(Reg::R1, record);
        }
        self.mov64(Reg::R2, 0);
        self.call(helper::RINGBUF_DISCARD)
    }

    // -- CO-RE placeholders ------------------------------------------------
    //
    // Each emits `mov64 dst, 0` and queues a relocation against the
    // placeholder's byte offset. The immediate is patched before load;
    // unresolvable sites are poisoned so the verifier rejects any use.

    fn core_site(
        &mut self,
        dst: Reg,
        target: impl Into<CoreTarget>,
        access: &str,
        kind: CoreRelocKind,
    ) -> &mut Self {
        self.relocs.push(CoreReloc {
            insn_offset: self.cursor(),
            target: target.into(),
            access: access.to_string(),
            kind,
        });
        self.mov64(dst, 0)
    }

    pub fn core_field_offset(
        &mut self,
        dst: Reg,
        target: impl Into<CoreTarget>,
        access: &str,
    ) -> &mut Self {
        self.core_site(dst, target, access, CoreRelocKind::FieldByteOffset)
    }

    pub fn core_field_size(
        &mut self,
        dst: Reg,
        target: impl Into<CoreTarget>,
        access: &str,
    ) -> &mut Self {
        self.core_site(dst, target, access, CoreRelocKind::FieldByteSize)
    }

    pub fn core_field_exists(
        &mut self,
        dst: Reg,
        target: impl Into<CoreTarget>,
        access: &str,
    ) -> &mut Self {
        self.core_site(dst, target, access, CoreRelocKind::FieldExists)
    }

    pub fn core_field_signed(
        &mut self,
        dst: Reg,
        target: impl Into<CoreTarget>,
        access: &str,
    ) -> &mut Self {
        self.core_site(dst, target, access, CoreRelocKind::FieldSigned)
    }

    /// Left-shift count for 64-bit bitfield extraction.
    pub fn core_field_lshift(
        &mut self,
        dst: Reg,
        target: impl Into<CoreTarget>,
        access: &str,
    ) -> &mut Self {
        self.core_site(dst, target, access, CoreRelocKind::FieldLshiftU64)
    }

    /// Right-shift count for 64-bit bitfield extraction.
    pub fn core_field_rshift(
        &mut self,
        dst: Reg,
        target: impl Into<CoreTarget>,
        access: &str,
    ) -> &mut Self {
        self.core_site(dst, target, access, CoreRelocKind::FieldRshiftU64)
    }

    pub fn core_type_exists(&mut self, dst: Reg, target: impl Into<CoreTarget>) -> &mut Self {
        self.core_site(dst, target, "0", CoreRelocKind::TypeExists)
    }

    pub fn core_type_size(&mut self, dst: Reg, target: impl Into<CoreTarget>) -> &mut Self {
        self.core_site(dst, target, "0", CoreRelocKind::TypeSize)
    }

    pub fn core_type_id(&mut self, dst: Reg, target: impl Into<CoreTarget>) -> &mut Self {
        self.core_site(dst, target, "0", CoreRelocKind::TypeIdTarget)
    }

    pub fn core_type_matches(&mut self, dst: Reg, target: impl Into<CoreTarget>) -> &mut Self {
        self.core_site(dst, target, "0", CoreRelocKind::TypeMatches)
    }

    pub fn core_enum_value(
        &mut self,
        dst: Reg,
        target: impl Into<CoreTarget>,
        enumerator: &str,
    ) -> &mut Self {
        self.core_site(dst, target, enumerator, CoreRelocKind::EnumvalValue)
    }

    pub fn core_enumval_exists(
        &mut self,
        dst: Reg,
        target: impl Into<CoreTarget>,
        enumerator: &str,
    ) -> &mut Self {
        self.core_site(dst, target, enumerator, CoreRelocKind::EnumvalExists)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mov_and_exit_encode_to_known_bytes() {
        let mut asm = Asm::new();
        asm.mov64(Reg::R0, 42).exit();
        let bytes = asm.assemble();
        assert_eq!(
            bytes,
            [
                0xb7, 0x00, 0x00, 0x00, 0x2a, 0x00, 0x00, 0x00, // mov r0, 42
                0x95, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, // exit
            ]
        );
    }

    #[test]
    fn grammar_roundtrip() {
        use crate::insn::opcode::{AluOp, JmpOp, MemSize};

        let mut asm = Asm::new();
        asm.mov64(Reg::R3, -7)
            .alu64_reg(AluOp::Add, Reg::R3, Reg::R4)
            .alu32(AluOp::Xor, Reg::R2, 0x55)
            .jmp_imm(JmpOp::Jne, Reg::R3, 9, 4)
            .jmp_reg(JmpOp::Jsgt, Reg::R1, Reg::R2, -2)
            .jmp32_imm(JmpOp::Jlt, Reg::R5, 100, 1)
            .load(MemSize::Half, Reg::R0, Reg::R6, 12)
            .store_reg(MemSize::DWord, Reg::R10, Reg::R7, -16)
            .store_imm(MemSize::Byte, Reg::R8, 3, 0x7f)
            .call(5)
            .exit();

        let bytes = asm.assemble();
        for (i, insn) in asm.insns().iter().enumerate() {
            let mut chunk = [0u8; 8];
            chunk.copy_from_slice(&bytes[i * 8..i * 8 + 8]);
            assert_eq!(&Insn::from_bytes(&chunk), insn, "instruction {i}");
        }
    }

    #[test]
    fn lddw_splits_the_immediate() {
        let mut asm = Asm::new();
        asm.lddw(Reg::R0, 0x1234_5678_9abc_def0);
        let insns = asm.insns();
        assert_eq!(insns.len(), 2);
        assert_eq!(insns[0].opcode, 0x18);
        assert_eq!(insns[0].dst(), 0);
        assert_eq!(insns[0].imm as u32, 0x9abc_def0);
        assert_eq!(insns[1].opcode, 0);
        assert_eq!(insns[1].imm as u32, 0x1234_5678);
    }

    #[test]
    fn ld_map_fd_flags_the_pseudo_register() {
        let mut asm = Asm::new();
        asm.ld_map_fd(Reg::R1, 14);
        let insns = asm.insns();
        assert_eq!(insns[0].src(), PSEUDO_MAP_FD);
        assert_eq!(insns[0].imm, 14);
        assert_eq!(insns[1].imm, 0);
    }

    #[test]
    fn atomic_fetch_bit() {
        let mut asm = Asm::new();
        asm.atomic_add(MemSize::DWord, Reg::R1, Reg::R2, 0, false)
            .atomic_add(MemSize::DWord, Reg::R1, Reg::R2, 0, true)
            .atomic_xchg(MemSize::Word, Reg::R1, Reg::R2, 8);
        let insns = asm.insns();
        assert_eq!(insns[0].opcode, 0xdb);
        assert_eq!(insns[0].imm, 0x00);
        assert_eq!(insns[1].imm, 0x01);
        assert_eq!(insns[2].opcode, 0xc3);
        assert_eq!(insns[2].imm, 0xe0 | 0x01);
    }

    #[test]
    fn ringbuf_reserve_sequence() {
        let mut asm = Asm::new();
        asm.ringbuf_reserve(9, 64);
        let insns = asm.insns();
        // lddw pair, size, flags, call 131
        assert_eq!(insns.len(), 5);
        assert_eq!(insns[0].src(), PSEUDO_MAP_FD);
        assert_eq!(insns[2].imm, 64);
        assert_eq!(insns[3].imm, 0);
        assert_eq!(insns[4].imm, helper::RINGBUF_RESERVE);
    }

    #[test]
    fn core_placeholder_registers_reloc() {
        let mut asm = Asm::new();
        asm.mov64(Reg::R6, 1);
        asm.core_field_offset(Reg::R2, "task_struct", "0:1");
        let relocs = asm.relocs();
        assert_eq!(relocs.len(), 1);
        assert_eq!(relocs[0].insn_offset, 8);
        assert_eq!(relocs[0].kind, CoreRelocKind::FieldByteOffset);
        assert_eq!(relocs[0].access, "0:1");
        // the placeholder itself is an ordinary mov dst, 0
        let insn = asm.insns()[1];
        assert_eq!(insn.opcode, 0xb7);
        assert_eq!(insn.dst(), 2);
        assert_eq!(insn.imm, 0);
    }

    #[test]
    fn tail_call_sequence_preserves_ctx_in_r1() {
        let mut asm = Asm::new();
        asm.tail_call(Reg::R1, 5, 3);
        // no mov for ctx already in r1: lddw pair + index + call
        assert_eq!(asm.insns().len(), 4);
        assert_eq!(asm.insns()[3].imm, helper::TAIL_CALL);
    }
}
