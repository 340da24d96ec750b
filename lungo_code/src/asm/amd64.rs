//! AMD64 instruction encoder.
//!
//! A thin assembler over the [`CodeBuffer`]: each method appends the encoding of one
//! instruction. Operand sizes are explicit (`wide` selects the 64-bit form); the caller is
//! responsible for choosing sizes that match its operand kinds.

use crate::asm::code_buffer::{CodeBuffer, Label};
use crate::bytecode::Condition;
use crate::operand::Scale;
use crate::register::Register;

/// A memory operand: `[base + index * scale + displacement]`, or an absolute 32-bit address
/// when no base register is given.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Mem {
    pub base: Option<Register>,
    pub index: Option<(Register, Scale)>,
    pub displacement: i32,
}

impl Mem {
    /// `[base + displacement]`
    #[must_use]
    pub fn base(base: Register, displacement: i32) -> Mem {
        Mem {
            base: Some(base),
            index: None,
            displacement,
        }
    }

    /// `[base + index * scale + displacement]`
    #[must_use]
    pub fn indexed(base: Register, index: Register, scale: Scale, displacement: i32) -> Mem {
        Mem {
            base: Some(base),
            index: Some((index, scale)),
            displacement,
        }
    }

    /// `[displacement]`, absolute
    #[must_use]
    pub fn absolute(displacement: i32) -> Mem {
        Mem {
            base: None,
            index: None,
            displacement,
        }
    }
}

/// Two-operand integer ALU operations sharing one encoding pattern.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum AluOp {
    Add,
    Or,
    And,
    Sub,
    Xor,
    Cmp,
}

impl AluOp {
    /// Opcode for the `r/m, r` direction.
    fn opcode(self) -> u8 {
        match self {
            AluOp::Add => 0x01,
            AluOp::Or => 0x09,
            AluOp::And => 0x21,
            AluOp::Sub => 0x29,
            AluOp::Xor => 0x31,
            AluOp::Cmp => 0x39,
        }
    }

    /// The `/n` extension used with immediate forms.
    fn extension(self) -> u8 {
        match self {
            AluOp::Add => 0,
            AluOp::Or => 1,
            AluOp::And => 4,
            AluOp::Sub => 5,
            AluOp::Xor => 6,
            AluOp::Cmp => 7,
        }
    }
}

/// Shift operations.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ShiftKind {
    Shl,
    Shr,
    Sar,
}

impl ShiftKind {
    fn extension(self) -> u8 {
        match self {
            ShiftKind::Shl => 4,
            ShiftKind::Shr => 5,
            ShiftKind::Sar => 7,
        }
    }
}

/// Scalar SSE operations sharing one encoding pattern.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SseOp {
    Add,
    Sub,
    Mul,
    Div,
    Sqrt,
}

impl SseOp {
    fn opcode(self) -> u8 {
        match self {
            SseOp::Add => 0x58,
            SseOp::Sub => 0x5c,
            SseOp::Mul => 0x59,
            SseOp::Div => 0x5e,
            SseOp::Sqrt => 0x51,
        }
    }
}

/// Map a condition to its x86 condition code.
fn condition_code(condition: Condition) -> u8 {
    match condition {
        Condition::Equal => 0x4,
        Condition::NotEqual => 0x5,
        Condition::Less => 0xc,
        Condition::GreaterEqual => 0xd,
        Condition::LessEqual => 0xe,
        Condition::Greater => 0xf,
        Condition::Below => 0x2,
        Condition::AboveEqual => 0x3,
        Condition::BelowEqual => 0x6,
        Condition::Above => 0x7,
    }
}

/// The AMD64 assembler.
#[derive(Debug, Default)]
pub struct Amd64Assembler {
    buffer: CodeBuffer,
}

impl Amd64Assembler {
    #[must_use]
    pub fn new() -> Amd64Assembler {
        Amd64Assembler {
            buffer: CodeBuffer::new(),
        }
    }

    /// Return the underlying buffer.
    #[must_use]
    pub fn buffer(&self) -> &CodeBuffer {
        &self.buffer
    }

    /// Return the underlying buffer mutably.
    pub fn buffer_mut(&mut self) -> &mut CodeBuffer {
        &mut self.buffer
    }

    /// Return the current emission position.
    #[must_use]
    pub fn position(&self) -> usize {
        self.buffer.position()
    }

    /// Finish emission.
    #[must_use]
    pub fn finish(self) -> CodeBuffer {
        self.buffer
    }

    /// Bind a label at the current position.
    pub fn bind(&mut self, label: &mut Label) {
        self.buffer.bind(label);
    }

    fn emit_rex(&mut self, wide: bool, reg_ext: bool, index_ext: bool, base_ext: bool) {
        let rex = 0x40
            | (u8::from(wide) << 3)
            | (u8::from(reg_ext) << 2)
            | (u8::from(index_ext) << 1)
            | u8::from(base_ext);
        if rex != 0x40 {
            self.buffer.emit_u8(rex);
        }
    }

    /// REX for instructions with an 8-bit register operand, where encodings 4..8 need an empty
    /// REX to address sil/dil instead of the high-byte registers.
    fn emit_rex_for_byte(&mut self, reg: Register, base_ext: bool) {
        let rex = 0x40 | (u8::from(reg.is_extended()) << 2) | u8::from(base_ext);
        if rex != 0x40 || reg.low_encoding() >= 4 {
            self.buffer.emit_u8(rex);
        }
    }

    fn rex_for_mem(&mut self, wide: bool, reg: Register, mem: &Mem) {
        let index_ext = mem.index.is_some_and(|(index, _)| index.is_extended());
        let base_ext = mem.base.is_some_and(|base| base.is_extended());
        self.emit_rex(wide, reg.is_extended(), index_ext, base_ext);
    }

    fn modrm_reg(&mut self, reg: u8, rm: Register) {
        self.buffer.emit_u8(0xc0 | (reg << 3) | rm.low_encoding());
    }

    fn modrm_mem(&mut self, reg: u8, mem: &Mem) {
        match mem.base {
            None => {
                // Absolute disp32 via SIB with no base
                self.buffer.emit_u8((reg << 3) | 0x4);
                let index = mem
                    .index
                    .map_or(0x20, |(index, scale)| (scale.shift() << 6) | (index.low_encoding() << 3));
                self.buffer.emit_u8(index | 0x5);
                self.buffer.emit_u32(mem.displacement.cast_unsigned());
            }
            Some(base) => {
                let need_sib = mem.index.is_some() || base.low_encoding() == 4;
                let short_disp = i8::try_from(mem.displacement).is_ok();
                let mode: u8 = if mem.displacement == 0 && base.low_encoding() != 5 {
                    0
                } else if short_disp {
                    1
                } else {
                    2
                };
                let rm = if need_sib { 0x4 } else { base.low_encoding() };
                self.buffer.emit_u8((mode << 6) | (reg << 3) | rm);
                if need_sib {
                    let sib = match mem.index {
                        Some((index, scale)) => {
                            (scale.shift() << 6) | (index.low_encoding() << 3) | base.low_encoding()
                        }
                        None => 0x20 | base.low_encoding(),
                    };
                    self.buffer.emit_u8(sib);
                }
                if mode == 1 {
                    self.buffer
                        .emit_u8(i8::try_from(mem.displacement).unwrap_or(0).cast_unsigned());
                } else if mode == 2 {
                    self.buffer.emit_u32(mem.displacement.cast_unsigned());
                }
            }
        }
    }

    // Integer moves

    /// `mov dst, src`
    pub fn mov_rr(&mut self, wide: bool, dst: Register, src: Register) {
        self.emit_rex(wide, src.is_extended(), false, dst.is_extended());
        self.buffer.emit_u8(0x89);
        self.modrm_reg(src.low_encoding(), dst);
    }

    /// `mov dst, imm32` (32-bit form, zero extends)
    pub fn mov32_ri(&mut self, dst: Register, imm: i32) {
        self.emit_rex(false, false, false, dst.is_extended());
        self.buffer.emit_u8(0xb8 + dst.low_encoding());
        self.buffer.emit_u32(imm.cast_unsigned());
    }

    /// `mov dst, imm` choosing the shortest 64-bit form.
    pub fn mov_ri(&mut self, dst: Register, imm: i64) {
        if let Ok(imm) = i32::try_from(imm) {
            // Sign extended 32-bit immediate
            self.emit_rex(true, false, false, dst.is_extended());
            self.buffer.emit_u8(0xc7);
            self.modrm_reg(0, dst);
            self.buffer.emit_u32(imm.cast_unsigned());
        } else {
            self.emit_rex(true, false, false, dst.is_extended());
            self.buffer.emit_u8(0xb8 + dst.low_encoding());
            self.buffer.emit_u64(imm.cast_unsigned());
        }
    }

    /// `mov dst, imm64` always in the 8-byte form; returns the position of the immediate so
    /// the installer can patch it.
    pub fn mov_ri64_patchable(&mut self, dst: Register, imm: i64) -> usize {
        self.emit_rex(true, false, false, dst.is_extended());
        self.buffer.emit_u8(0xb8 + dst.low_encoding());
        let position = self.buffer.position();
        self.buffer.emit_u64(imm.cast_unsigned());
        position
    }

    /// `lea dst, [mem]`
    pub fn lea(&mut self, dst: Register, mem: &Mem) {
        self.rex_for_mem(true, dst, mem);
        self.buffer.emit_u8(0x8d);
        self.modrm_mem(dst.low_encoding(), mem);
    }

    // Integer loads and stores

    /// `mov dst, [mem]` (32-bit)
    pub fn load32(&mut self, dst: Register, mem: &Mem) {
        self.rex_for_mem(false, dst, mem);
        self.buffer.emit_u8(0x8b);
        self.modrm_mem(dst.low_encoding(), mem);
    }

    /// `mov dst, [mem]` (64-bit)
    pub fn load64(&mut self, dst: Register, mem: &Mem) {
        self.rex_for_mem(true, dst, mem);
        self.buffer.emit_u8(0x8b);
        self.modrm_mem(dst.low_encoding(), mem);
    }

    /// `movsx dst, byte [mem]`
    pub fn load8_signed(&mut self, dst: Register, mem: &Mem) {
        self.rex_for_mem(false, dst, mem);
        self.buffer.emit_u8(0x0f);
        self.buffer.emit_u8(0xbe);
        self.modrm_mem(dst.low_encoding(), mem);
    }

    /// `movzx dst, byte [mem]`
    pub fn load8_unsigned(&mut self, dst: Register, mem: &Mem) {
        self.rex_for_mem(false, dst, mem);
        self.buffer.emit_u8(0x0f);
        self.buffer.emit_u8(0xb6);
        self.modrm_mem(dst.low_encoding(), mem);
    }

    /// `movsx dst, word [mem]`
    pub fn load16_signed(&mut self, dst: Register, mem: &Mem) {
        self.rex_for_mem(false, dst, mem);
        self.buffer.emit_u8(0x0f);
        self.buffer.emit_u8(0xbf);
        self.modrm_mem(dst.low_encoding(), mem);
    }

    /// `movzx dst, word [mem]`
    pub fn load16_unsigned(&mut self, dst: Register, mem: &Mem) {
        self.rex_for_mem(false, dst, mem);
        self.buffer.emit_u8(0x0f);
        self.buffer.emit_u8(0xb7);
        self.modrm_mem(dst.low_encoding(), mem);
    }

    /// `mov [mem], src` (8-bit)
    pub fn store8(&mut self, mem: &Mem, src: Register) {
        let base_ext = mem.base.is_some_and(|base| base.is_extended());
        self.emit_rex_for_byte(src, base_ext);
        self.buffer.emit_u8(0x88);
        self.modrm_mem(src.low_encoding(), mem);
    }

    /// `mov [mem], src` (16-bit)
    pub fn store16(&mut self, mem: &Mem, src: Register) {
        self.buffer.emit_u8(0x66);
        self.rex_for_mem(false, src, mem);
        self.buffer.emit_u8(0x89);
        self.modrm_mem(src.low_encoding(), mem);
    }

    /// `mov [mem], src` (32-bit)
    pub fn store32(&mut self, mem: &Mem, src: Register) {
        self.rex_for_mem(false, src, mem);
        self.buffer.emit_u8(0x89);
        self.modrm_mem(src.low_encoding(), mem);
    }

    /// `mov [mem], src` (64-bit)
    pub fn store64(&mut self, mem: &Mem, src: Register) {
        self.rex_for_mem(true, src, mem);
        self.buffer.emit_u8(0x89);
        self.modrm_mem(src.low_encoding(), mem);
    }

    /// `mov dword [mem], imm32`
    pub fn store32_imm(&mut self, mem: &Mem, imm: i32) {
        let base_ext = mem.base.is_some_and(|base| base.is_extended());
        let index_ext = mem.index.is_some_and(|(index, _)| index.is_extended());
        self.emit_rex(false, false, index_ext, base_ext);
        self.buffer.emit_u8(0xc7);
        self.modrm_mem(0, mem);
        self.buffer.emit_u32(imm.cast_unsigned());
    }

    /// `mov byte [mem], imm8`
    pub fn store8_imm(&mut self, mem: &Mem, imm: i8) {
        let base_ext = mem.base.is_some_and(|base| base.is_extended());
        let index_ext = mem.index.is_some_and(|(index, _)| index.is_extended());
        self.emit_rex(false, false, index_ext, base_ext);
        self.buffer.emit_u8(0xc6);
        self.modrm_mem(0, mem);
        self.buffer.emit_u8(imm.cast_unsigned());
    }

    // Integer arithmetic

    /// `op dst, src`
    pub fn alu_rr(&mut self, op: AluOp, wide: bool, dst: Register, src: Register) {
        self.emit_rex(wide, src.is_extended(), false, dst.is_extended());
        self.buffer.emit_u8(op.opcode());
        self.modrm_reg(src.low_encoding(), dst);
    }

    /// `op dst, imm32`
    pub fn alu_ri(&mut self, op: AluOp, wide: bool, dst: Register, imm: i32) {
        self.emit_rex(wide, false, false, dst.is_extended());
        self.buffer.emit_u8(0x81);
        self.modrm_reg(op.extension(), dst);
        self.buffer.emit_u32(imm.cast_unsigned());
    }

    /// `imul dst, src`
    pub fn imul_rr(&mut self, wide: bool, dst: Register, src: Register) {
        self.emit_rex(wide, dst.is_extended(), false, src.is_extended());
        self.buffer.emit_u8(0x0f);
        self.buffer.emit_u8(0xaf);
        self.modrm_reg(dst.low_encoding(), src);
    }

    /// `neg reg`
    pub fn neg(&mut self, wide: bool, reg: Register) {
        self.emit_rex(wide, false, false, reg.is_extended());
        self.buffer.emit_u8(0xf7);
        self.modrm_reg(3, reg);
    }

    /// `cdq` / `cqo`: sign extend rax into rdx
    pub fn sign_extend_rax(&mut self, wide: bool) {
        self.emit_rex(wide, false, false, false);
        self.buffer.emit_u8(0x99);
    }

    /// `idiv divisor`: divides rdx:rax, quotient in rax, remainder in rdx
    pub fn idiv(&mut self, wide: bool, divisor: Register) {
        self.emit_rex(wide, false, false, divisor.is_extended());
        self.buffer.emit_u8(0xf7);
        self.modrm_reg(7, divisor);
    }

    /// `test x, y`
    pub fn test_rr(&mut self, wide: bool, x: Register, y: Register) {
        self.emit_rex(wide, y.is_extended(), false, x.is_extended());
        self.buffer.emit_u8(0x85);
        self.modrm_reg(y.low_encoding(), x);
    }

    /// `shift reg, cl`
    pub fn shift_cl(&mut self, kind: ShiftKind, wide: bool, reg: Register) {
        self.emit_rex(wide, false, false, reg.is_extended());
        self.buffer.emit_u8(0xd3);
        self.modrm_reg(kind.extension(), reg);
    }

    /// `shift reg, imm8`
    pub fn shift_imm(&mut self, kind: ShiftKind, wide: bool, reg: Register, amount: u8) {
        self.emit_rex(wide, false, false, reg.is_extended());
        self.buffer.emit_u8(0xc1);
        self.modrm_reg(kind.extension(), reg);
        self.buffer.emit_u8(amount);
    }

    // Width conversions

    /// `movsx dst, src_8` (sign extend low byte)
    pub fn movsx8_rr(&mut self, dst: Register, src: Register) {
        self.emit_rex(false, dst.is_extended(), false, src.is_extended());
        self.buffer.emit_u8(0x0f);
        self.buffer.emit_u8(0xbe);
        self.modrm_reg(dst.low_encoding(), src);
    }

    /// `movzx dst, src_8`
    pub fn movzx8_rr(&mut self, dst: Register, src: Register) {
        self.emit_rex(false, dst.is_extended(), false, src.is_extended());
        self.buffer.emit_u8(0x0f);
        self.buffer.emit_u8(0xb6);
        self.modrm_reg(dst.low_encoding(), src);
    }

    /// `movzx dst, src_16`
    pub fn movzx16_rr(&mut self, dst: Register, src: Register) {
        self.emit_rex(false, dst.is_extended(), false, src.is_extended());
        self.buffer.emit_u8(0x0f);
        self.buffer.emit_u8(0xb7);
        self.modrm_reg(dst.low_encoding(), src);
    }

    /// `movsx dst, src_16`
    pub fn movsx16_rr(&mut self, dst: Register, src: Register) {
        self.emit_rex(false, dst.is_extended(), false, src.is_extended());
        self.buffer.emit_u8(0x0f);
        self.buffer.emit_u8(0xbf);
        self.modrm_reg(dst.low_encoding(), src);
    }

    /// `movsxd dst, src_32` (sign extend int to long)
    pub fn movsxd_rr(&mut self, dst: Register, src: Register) {
        self.emit_rex(true, dst.is_extended(), false, src.is_extended());
        self.buffer.emit_u8(0x63);
        self.modrm_reg(dst.low_encoding(), src);
    }

    // Control flow

    /// `jcc label`
    pub fn jcc(&mut self, condition: Condition, label: &mut Label) {
        self.buffer.emit_u8(0x0f);
        self.buffer.emit_u8(0x80 + condition_code(condition));
        self.buffer.emit_rel32(label);
    }

    /// `jp label` (jump if parity, for NaN handling)
    pub fn jp(&mut self, label: &mut Label) {
        self.buffer.emit_u8(0x0f);
        self.buffer.emit_u8(0x8a);
        self.buffer.emit_rel32(label);
    }

    /// `jmp label`
    pub fn jmp(&mut self, label: &mut Label) {
        self.buffer.emit_u8(0xe9);
        self.buffer.emit_rel32(label);
    }

    /// `jmp reg`
    pub fn jmp_reg(&mut self, reg: Register) {
        self.emit_rex(false, false, false, reg.is_extended());
        self.buffer.emit_u8(0xff);
        self.modrm_reg(4, reg);
    }

    /// `call rel32` with a zero displacement; returns the position of the displacement word
    /// for the installer to patch.
    pub fn call_rel32(&mut self) -> usize {
        self.buffer.emit_u8(0xe8);
        let position = self.buffer.position();
        self.buffer.emit_u32(0);
        position
    }

    /// `call label`
    pub fn call_label(&mut self, label: &mut Label) {
        self.buffer.emit_u8(0xe8);
        self.buffer.emit_rel32(label);
    }

    /// `call reg`
    pub fn call_reg(&mut self, reg: Register) {
        self.emit_rex(false, false, false, reg.is_extended());
        self.buffer.emit_u8(0xff);
        self.modrm_reg(2, reg);
    }

    /// `setcc reg8`
    pub fn setcc(&mut self, condition: Condition, reg: Register) {
        self.emit_rex_for_byte(reg, false);
        self.buffer.emit_u8(0x0f);
        self.buffer.emit_u8(0x90 + condition_code(condition));
        // The reg field is ignored
        self.buffer.emit_u8(0xc0 | reg.low_encoding());
    }

    pub fn ret(&mut self) {
        self.buffer.emit_u8(0xc3);
    }

    pub fn push(&mut self, reg: Register) {
        self.emit_rex(false, false, false, reg.is_extended());
        self.buffer.emit_u8(0x50 + reg.low_encoding());
    }

    pub fn pop(&mut self, reg: Register) {
        self.emit_rex(false, false, false, reg.is_extended());
        self.buffer.emit_u8(0x58 + reg.low_encoding());
    }

    pub fn nop(&mut self) {
        self.buffer.emit_u8(0x90);
    }

    pub fn int3(&mut self) {
        self.buffer.emit_u8(0xcc);
    }

    /// `mfence`
    pub fn mfence(&mut self) {
        self.buffer.emit_u8(0x0f);
        self.buffer.emit_u8(0xae);
        self.buffer.emit_u8(0xf0);
    }

    /// `lock cmpxchg [mem], src`: compares rax with `[mem]`, stores `src` on equality.
    pub fn lock_cmpxchg(&mut self, wide: bool, mem: &Mem, src: Register) {
        self.buffer.emit_u8(0xf0);
        self.rex_for_mem(wide, src, mem);
        self.buffer.emit_u8(0x0f);
        self.buffer.emit_u8(0xb1);
        self.modrm_mem(src.low_encoding(), mem);
    }

    // SSE scalar floating point

    /// `movss/movsd dst, src` between xmm registers
    pub fn movf_rr(&mut self, double: bool, dst: Register, src: Register) {
        self.buffer.emit_u8(if double { 0xf2 } else { 0xf3 });
        self.emit_rex(false, dst.is_extended(), false, src.is_extended());
        self.buffer.emit_u8(0x0f);
        self.buffer.emit_u8(0x10);
        self.modrm_reg(dst.low_encoding(), src);
    }

    /// `movss/movsd dst, [mem]`
    pub fn loadf(&mut self, double: bool, dst: Register, mem: &Mem) {
        self.buffer.emit_u8(if double { 0xf2 } else { 0xf3 });
        self.rex_for_mem(false, dst, mem);
        self.buffer.emit_u8(0x0f);
        self.buffer.emit_u8(0x10);
        self.modrm_mem(dst.low_encoding(), mem);
    }

    /// `movss/movsd [mem], src`
    pub fn storef(&mut self, double: bool, mem: &Mem, src: Register) {
        self.buffer.emit_u8(if double { 0xf2 } else { 0xf3 });
        self.rex_for_mem(false, src, mem);
        self.buffer.emit_u8(0x0f);
        self.buffer.emit_u8(0x11);
        self.modrm_mem(src.low_encoding(), mem);
    }

    /// `addss/subss/... dst, src`
    pub fn sse_rr(&mut self, op: SseOp, double: bool, dst: Register, src: Register) {
        self.buffer.emit_u8(if double { 0xf2 } else { 0xf3 });
        self.emit_rex(false, dst.is_extended(), false, src.is_extended());
        self.buffer.emit_u8(0x0f);
        self.buffer.emit_u8(op.opcode());
        self.modrm_reg(dst.low_encoding(), src);
    }

    /// `ucomiss/ucomisd x, y`
    pub fn ucomi(&mut self, double: bool, x: Register, y: Register) {
        if double {
            self.buffer.emit_u8(0x66);
        }
        self.emit_rex(false, x.is_extended(), false, y.is_extended());
        self.buffer.emit_u8(0x0f);
        self.buffer.emit_u8(0x2e);
        self.modrm_reg(x.low_encoding(), y);
    }

    /// `cvtsi2ss/cvtsi2sd dst, src`; `wide` selects a 64-bit integer source
    pub fn cvtsi2f(&mut self, double: bool, wide: bool, dst: Register, src: Register) {
        self.buffer.emit_u8(if double { 0xf2 } else { 0xf3 });
        self.emit_rex(wide, dst.is_extended(), false, src.is_extended());
        self.buffer.emit_u8(0x0f);
        self.buffer.emit_u8(0x2a);
        self.modrm_reg(dst.low_encoding(), src);
    }

    /// `cvttss2si/cvttsd2si dst, src`; `wide` selects a 64-bit integer destination
    pub fn cvtf2si(&mut self, double: bool, wide: bool, dst: Register, src: Register) {
        self.buffer.emit_u8(if double { 0xf2 } else { 0xf3 });
        self.emit_rex(wide, dst.is_extended(), false, src.is_extended());
        self.buffer.emit_u8(0x0f);
        self.buffer.emit_u8(0x2c);
        self.modrm_reg(dst.low_encoding(), src);
    }

    /// `cvtss2sd/cvtsd2ss dst, src`
    pub fn cvtf2f(&mut self, to_double: bool, dst: Register, src: Register) {
        self.buffer.emit_u8(if to_double { 0xf3 } else { 0xf2 });
        self.emit_rex(false, dst.is_extended(), false, src.is_extended());
        self.buffer.emit_u8(0x0f);
        self.buffer.emit_u8(0x5a);
        self.modrm_reg(dst.low_encoding(), src);
    }

    /// `movd/movq xmm, gpr`
    pub fn movf_from_gpr(&mut self, wide: bool, dst: Register, src: Register) {
        self.buffer.emit_u8(0x66);
        self.emit_rex(wide, dst.is_extended(), false, src.is_extended());
        self.buffer.emit_u8(0x0f);
        self.buffer.emit_u8(0x6e);
        self.modrm_reg(dst.low_encoding(), src);
    }

    /// `movd/movq gpr, xmm`
    pub fn movf_to_gpr(&mut self, wide: bool, dst: Register, src: Register) {
        self.buffer.emit_u8(0x66);
        self.emit_rex(wide, src.is_extended(), false, dst.is_extended());
        self.buffer.emit_u8(0x0f);
        self.buffer.emit_u8(0x7e);
        self.modrm_reg(src.low_encoding(), dst);
    }

    /// `xorps dst, src`
    pub fn xorps(&mut self, dst: Register, src: Register) {
        self.emit_rex(false, dst.is_extended(), false, src.is_extended());
        self.buffer.emit_u8(0x0f);
        self.buffer.emit_u8(0x57);
        self.modrm_reg(dst.low_encoding(), src);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_mov_rr() {
        let mut asm = Amd64Assembler::new();
        asm.mov_rr(true, Register::RAX, Register::RBX);
        assert_eq!(&[0x48, 0x89, 0xd8], asm.buffer().bytes());
    }

    #[test]
    fn test_mov_rr_extended() {
        let mut asm = Amd64Assembler::new();
        asm.mov_rr(true, Register::R8, Register::RAX);
        assert_eq!(&[0x49, 0x89, 0xc0], asm.buffer().bytes());
    }

    #[test]
    fn test_frame_setup_sequence() {
        let mut asm = Amd64Assembler::new();
        asm.push(Register::RBP);
        asm.mov_rr(true, Register::RBP, Register::RSP);
        asm.alu_ri(AluOp::Sub, true, Register::RSP, 32);
        assert_eq!(
            &[0x55, 0x48, 0x89, 0xe5, 0x48, 0x81, 0xec, 0x20, 0x00, 0x00, 0x00],
            asm.buffer().bytes()
        );
    }

    #[test]
    fn test_load_store_frame_slot() {
        let mut asm = Amd64Assembler::new();
        asm.load32(Register::RAX, &Mem::base(Register::RBP, -8));
        asm.store64(&Mem::base(Register::RSP, 8), Register::RAX);
        assert_eq!(
            &[0x8b, 0x45, 0xf8, 0x48, 0x89, 0x44, 0x24, 0x08],
            asm.buffer().bytes()
        );
    }

    #[test]
    fn test_indexed_address() {
        let mut asm = Amd64Assembler::new();
        // mov eax, [rdi + rsi*4 + 16]
        asm.load32(
            Register::RAX,
            &Mem::indexed(Register::RDI, Register::RSI, Scale::Times4, 16),
        );
        assert_eq!(&[0x8b, 0x44, 0xb7, 0x10], asm.buffer().bytes());
    }

    #[test]
    fn test_add_and_ret() {
        let mut asm = Amd64Assembler::new();
        asm.alu_rr(AluOp::Add, false, Register::RAX, Register::RDX);
        asm.ret();
        assert_eq!(&[0x01, 0xd0, 0xc3], asm.buffer().bytes());
    }

    #[test]
    fn test_call_rel32_records_patch_position() {
        let mut asm = Amd64Assembler::new();
        asm.nop();
        let position = asm.call_rel32();
        assert_eq!(2, position);
        assert_eq!(&[0x90, 0xe8, 0x00, 0x00, 0x00, 0x00], asm.buffer().bytes());
    }

    #[test]
    fn test_jcc_forward_backward() {
        let mut asm = Amd64Assembler::new();
        let mut target = Label::new();
        asm.jcc(Condition::Equal, &mut target);
        asm.nop();
        asm.bind(&mut target);
        // 0f 84 rel32(=1), nop
        assert_eq!(&[0x0f, 0x84, 0x01, 0x00, 0x00, 0x00, 0x90], asm.buffer().bytes());

        let mut asm = Amd64Assembler::new();
        let mut back = Label::new();
        asm.bind(&mut back);
        asm.jmp(&mut back);
        assert_eq!(&[0xe9, 0xfb, 0xff, 0xff, 0xff], asm.buffer().bytes());
    }

    #[test]
    fn test_idiv_sequence() {
        let mut asm = Amd64Assembler::new();
        asm.sign_extend_rax(false);
        asm.idiv(false, Register::RCX);
        assert_eq!(&[0x99, 0xf7, 0xf9], asm.buffer().bytes());
    }

    #[test]
    fn test_sse_add() {
        let mut asm = Amd64Assembler::new();
        asm.sse_rr(SseOp::Add, true, Register::XMM0, Register::XMM1);
        assert_eq!(&[0xf2, 0x0f, 0x58, 0xc1], asm.buffer().bytes());
    }

    #[test]
    fn test_mfence() {
        let mut asm = Amd64Assembler::new();
        asm.mfence();
        assert_eq!(&[0x0f, 0xae, 0xf0], asm.buffer().bytes());
    }

    #[test]
    fn test_lock_cmpxchg() {
        let mut asm = Amd64Assembler::new();
        asm.lock_cmpxchg(false, &Mem::base(Register::RDI, 0), Register::RDX);
        assert_eq!(&[0xf0, 0x0f, 0xb1, 0x17], asm.buffer().bytes());
    }

    #[test]
    fn test_absolute_address() {
        let mut asm = Amd64Assembler::new();
        asm.load64(Register::RAX, &Mem::absolute(0x1000_0000));
        assert_eq!(
            &[0x48, 0x8b, 0x04, 0x25, 0x00, 0x00, 0x00, 0x10],
            asm.buffer().bytes()
        );
    }

    #[test]
    fn test_store8_extended_register() {
        let mut asm = Amd64Assembler::new();
        // sil needs an empty REX
        asm.store8(&Mem::base(Register::RAX, 0), Register::RSI);
        assert_eq!(&[0x40, 0x88, 0x30], asm.buffer().bytes());
    }
}
