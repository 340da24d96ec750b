//! LIR to machine code emission.
//!
//! Walks the LIR of each block in emission order, appending AMD64 bytes to the code buffer and
//! recording the side tables of the target method: safepoints, call sites, stub calls, data
//! patches and the exception handler table. Operands live in frame slots; operations run
//! through a fixed set of scratch registers (rax/rcx/rdx, r10/r11 for addresses, xmm0/xmm1).

use crate::Error::InvariantViolation;
use crate::backend::FrameMap;
use crate::error::Result;
use crate::hir::{BlockId, Ir};
use crate::lir::{BoundXirSnippet, LirDebugInfo, LirFunction, LirOp};
use lungo_code::asm::{AluOp, Amd64Assembler, Label, Mem, RelocationKind, ShiftKind, SseOp};
use lungo_code::{
    Address, ArithOp, Barriers, CPU_ARGUMENT_REGISTERS, CallSite, CallingConvention, Condition,
    ConstValue, DataPatch, FPU_ARGUMENT_REGISTERS, HandlerEntry, Kind, LogicOp, ObjectHandle,
    Operand, RefMap, Register, RuntimeCall, RuntimeCallSite, SafepointSite, Scale, ShiftOp,
    StubCallSite, StubId, Target, TargetMethod, Variable, XirOp, XirOperand,
};
use tracing::debug;

/// Byte length of the baseline entry pad the adapter generator fills at install time.
pub const BASELINE_ENTRY_PAD: usize = 8;

/// An out of line trap exit pending emission at the end of the method.
struct TrapOut {
    label: Label,
    stub: StubId,
    stack_map: RefMap,
    handlers: Vec<(BlockId, Option<ObjectHandle>)>,
}

struct Emitter<'a> {
    ir: &'a Ir,
    lir: &'a LirFunction,
    frame: &'a FrameMap,
    target: &'a Target,
    asm: Amd64Assembler,
    block_labels: Vec<Label>,
    local_labels: Vec<Label>,
    trap_outs: Vec<TrapOut>,
    /// (throwing position, handler block, catch type), resolved once all blocks are placed
    pending_handlers: Vec<(u32, BlockId, Option<ObjectHandle>)>,
    method: TargetMethod,
}

/// Emit machine code and side tables for the lowered method.
///
/// # Errors
///
/// if the code buffer overflows or the LIR is inconsistent
pub fn emit(
    ir: &Ir,
    lir: &LirFunction,
    frame: &FrameMap,
    target: &Target,
    name: String,
) -> Result<TargetMethod> {
    let mut emitter = Emitter {
        ir,
        lir,
        frame,
        target,
        asm: Amd64Assembler::new(),
        block_labels: (0..ir.block_count()).map(|_| Label::new()).collect(),
        local_labels: Vec::new(),
        trap_outs: Vec::new(),
        pending_handlers: Vec::new(),
        method: TargetMethod::new(name),
    };
    emitter.emit_method()?;
    Ok(emitter.method)
}

impl<'a> Emitter<'a> {
    fn emit_method(&mut self) -> Result<()> {
        // Baseline callers land on the pad the adapter generator fills at install time
        for _ in 0..BASELINE_ENTRY_PAD {
            self.asm.nop();
        }
        let opt_entry = u32::try_from(self.asm.position()).unwrap_or(u32::MAX);
        self.method.set_entries(opt_entry, 0);
        self.emit_prologue();

        let blocks = self.lir.blocks.clone();
        for (position, block) in blocks.iter().enumerate() {
            self.asm.buffer().check_capacity(64).map_err(crate::Error::from)?;
            let mut label = std::mem::take(&mut self.block_labels[block.index()]);
            self.asm.bind(&mut label);
            self.block_labels[block.index()] = label;
            self.local_labels = Vec::new();
            let ops = self
                .lir
                .lists
                .get(block)
                .ok_or_else(|| InvariantViolation(format!("no LIR for {block}")))?;
            let next = blocks.get(position + 1).copied();
            for op in ops {
                self.asm
                    .buffer()
                    .check_capacity(256)
                    .map_err(crate::Error::from)?;
                self.emit_op(op, next)?;
            }
        }
        self.flush_trap_outs();
        self.resolve_handlers();

        let buffer = std::mem::take(&mut self.asm).finish();
        let (code, relocations) = buffer.finish();
        for relocation in relocations {
            self.method.record_data_patch(DataPatch {
                position: u32::try_from(relocation.position).unwrap_or(u32::MAX),
                constant: relocation.constant,
            });
        }
        self.method.set_code(code);
        self.method.set_frame_size(self.frame.frame_size);
        self.method.set_register_ref_map(RefMap::new(16));
        self.method.set_inline_data(Vec::new());
        self.method.seal();
        debug!(method = %self.method, "emitted");
        Ok(())
    }

    fn emit_prologue(&mut self) {
        self.asm.push(Register::RBP);
        self.asm.mov_rr(true, Register::RBP, Register::RSP);
        if self.frame.frame_size > 0 {
            self.asm
                .alu_ri(AluOp::Sub, true, Register::RSP, self.frame.frame_size);
        }
        // Object slots are cleared so conservative stack maps never expose stale words
        let offsets = self.frame.object_spill_offsets();
        if !offsets.is_empty() {
            self.asm.alu_rr(AluOp::Xor, false, Register::RAX, Register::RAX);
            for offset in offsets {
                self.asm.store64(&Mem::base(Register::RBP, offset), Register::RAX);
            }
        }
    }

    fn emit_epilogue(&mut self) {
        self.asm.mov_rr(true, Register::RSP, Register::RBP);
        self.asm.pop(Register::RBP);
        self.asm.ret();
    }

    // Side table recording

    fn position(&self) -> u32 {
        u32::try_from(self.asm.position()).unwrap_or(u32::MAX)
    }

    fn record_handlers(&mut self, position: u32, info: &LirDebugInfo) {
        for (block, catch_type) in &info.handlers {
            self.pending_handlers.push((position, *block, *catch_type));
        }
    }

    fn resolve_handlers(&mut self) {
        let pending = std::mem::take(&mut self.pending_handlers);
        for (try_position, block, catch_type) in pending {
            let catch_position = self.block_labels[block.index()]
                .position()
                .and_then(|position| u32::try_from(position).ok());
            let Some(catch_position) = catch_position else {
                // The handler block was never emitted; the range is unreachable
                continue;
            };
            self.method.record_exception_handler(HandlerEntry {
                try_position,
                catch_position,
                catch_type,
            });
        }
    }

    fn flush_trap_outs(&mut self) {
        let trap_outs = std::mem::take(&mut self.trap_outs);
        for mut trap in trap_outs {
            self.asm.bind(&mut trap.label);
            let position = self.position();
            let _ = self.asm.call_rel32();
            self.method.record_stub_call(StubCallSite {
                position,
                stub: trap.stub,
                register_map: RefMap::new(16),
                stack_map: trap.stack_map,
            });
            for (block, catch_type) in trap.handlers {
                self.pending_handlers.push((position, block, catch_type));
            }
            self.asm.int3();
        }
    }

    // Operand plumbing

    fn spill_mem(&self, variable: Variable) -> Mem {
        Mem::base(Register::RBP, self.frame.spill_offset(variable))
    }

    fn slot_mem(index: i32, caller_frame: bool) -> Mem {
        if caller_frame {
            Mem::base(Register::RBP, FrameMap::incoming_offset(index))
        } else {
            Mem::base(Register::RSP, FrameMap::outgoing_offset(index))
        }
    }

    fn is_wide(kind: Kind) -> bool {
        matches!(kind, Kind::Long | Kind::Double | Kind::Object | Kind::Word)
    }

    /// Load the raw bits of `operand` into a general purpose register.
    fn load_gpr(&mut self, operand: &Operand, reg: Register, wide: bool) {
        match operand {
            Operand::Const(value) => self.load_const_gpr(*value, reg),
            Operand::Variable(variable) => {
                let mem = self.spill_mem(*variable);
                if wide {
                    self.asm.load64(reg, &mem);
                } else {
                    self.asm.load32(reg, &mem);
                }
            }
            Operand::Register { register, .. } => {
                if register.is_fpu() {
                    self.asm.movf_to_gpr(wide, reg, *register);
                } else if *register != reg {
                    self.asm.mov_rr(true, reg, *register);
                }
            }
            Operand::StackSlot {
                index,
                caller_frame,
                ..
            } => {
                let mem = Self::slot_mem(*index, *caller_frame);
                if wide {
                    self.asm.load64(reg, &mem);
                } else {
                    self.asm.load32(reg, &mem);
                }
            }
            Operand::Illegal | Operand::Address(..) => {
                debug_assert!(false, "cannot load {operand}");
            }
        }
    }

    fn load_const_gpr(&mut self, value: ConstValue, reg: Register) {
        match value {
            ConstValue::Int(v) => self.asm.mov32_ri(reg, v),
            ConstValue::Long(v) | ConstValue::Word(v) => self.asm.mov_ri(reg, v),
            ConstValue::Float(v) => self.asm.mov32_ri(reg, v.to_bits().cast_signed()),
            ConstValue::Double(v) => self.asm.mov_ri(reg, v.to_bits().cast_signed()),
            ConstValue::Null => self.asm.mov32_ri(reg, 0),
            ConstValue::Object(handle) => {
                // The installer patches the literal's address over the placeholder
                let index = self.method.add_reference_literal(handle);
                let position = self
                    .asm
                    .mov_ri64_patchable(reg, i64::try_from(index).unwrap_or(0));
                self.asm.buffer_mut().record_relocation(
                    position,
                    RelocationKind::Absolute64,
                    value,
                );
            }
        }
    }

    /// Load `operand` into a floating point register.
    fn load_fpu(&mut self, operand: &Operand, reg: Register, double: bool) {
        match operand {
            Operand::Const(value) => {
                self.load_const_gpr(*value, Register::RAX);
                self.asm.movf_from_gpr(double, reg, Register::RAX);
            }
            Operand::Variable(variable) => {
                let mem = self.spill_mem(*variable);
                self.asm.loadf(double, reg, &mem);
            }
            Operand::Register { register, .. } => {
                if register.is_fpu() {
                    if *register != reg {
                        self.asm.movf_rr(double, reg, *register);
                    }
                } else {
                    self.asm.movf_from_gpr(double, reg, *register);
                }
            }
            Operand::StackSlot {
                index,
                caller_frame,
                ..
            } => {
                let mem = Self::slot_mem(*index, *caller_frame);
                self.asm.loadf(double, reg, &mem);
            }
            Operand::Illegal | Operand::Address(..) => {
                debug_assert!(false, "cannot load {operand}");
            }
        }
    }

    /// Store a general purpose register into `dest`.
    fn store_gpr(&mut self, reg: Register, dest: &Operand, wide: bool) {
        match dest {
            Operand::Variable(variable) => {
                let mem = self.spill_mem(*variable);
                if wide {
                    self.asm.store64(&mem, reg);
                } else {
                    self.asm.store32(&mem, reg);
                }
            }
            Operand::Register { register, .. } => {
                if register.is_fpu() {
                    self.asm.movf_from_gpr(wide, *register, reg);
                } else if *register != reg {
                    self.asm.mov_rr(true, *register, reg);
                }
            }
            Operand::StackSlot {
                index,
                caller_frame,
                ..
            } => {
                let mem = Self::slot_mem(*index, *caller_frame);
                if wide {
                    self.asm.store64(&mem, reg);
                } else {
                    self.asm.store32(&mem, reg);
                }
            }
            Operand::Illegal | Operand::Const(..) | Operand::Address(..) => {
                debug_assert!(false, "cannot store into {dest}");
            }
        }
    }

    /// Store a floating point register into `dest`.
    fn store_fpu(&mut self, reg: Register, dest: &Operand, double: bool) {
        match dest {
            Operand::Variable(variable) => {
                let mem = self.spill_mem(*variable);
                self.asm.storef(double, &mem, reg);
            }
            Operand::Register { register, .. } => {
                if register.is_fpu() {
                    if *register != reg {
                        self.asm.movf_rr(double, *register, reg);
                    }
                } else {
                    self.asm.movf_to_gpr(double, *register, reg);
                }
            }
            Operand::StackSlot {
                index,
                caller_frame,
                ..
            } => {
                let mem = Self::slot_mem(*index, *caller_frame);
                self.asm.storef(double, &mem, reg);
            }
            Operand::Illegal | Operand::Const(..) | Operand::Address(..) => {
                debug_assert!(false, "cannot store into {dest}");
            }
        }
    }

    /// A raw bit copy between two locations.
    fn emit_move(&mut self, src: &Operand, dest: &Operand) {
        if src == dest {
            return;
        }
        let kind = match dest.kind() {
            Kind::Illegal => src.kind(),
            kind => kind,
        };
        match dest {
            Operand::Register { register, .. } if register.is_fpu() => {
                self.load_fpu(src, *register, kind == Kind::Double);
            }
            _ if kind.is_float() => {
                self.load_fpu(src, Register::XMM0, kind == Kind::Double);
                self.store_fpu(Register::XMM0, dest, kind == Kind::Double);
            }
            _ => {
                let wide = Self::is_wide(kind);
                self.load_gpr(src, Register::RAX, wide);
                self.store_gpr(Register::RAX, dest, wide);
            }
        }
    }

    /// Resolve an address expression to a memory operand through the address scratch
    /// registers.
    fn resolve_address(&mut self, address: &Address) -> Mem {
        // A constant base within the 32 bit range encodes as an absolute address
        if address.index.is_none()
            && let Operand::Const(value) = address.base.as_ref()
            && let Some(base) = value.as_long()
            && let Ok(displacement) = i32::try_from(base + i64::from(address.displacement))
        {
            return Mem::absolute(displacement);
        }
        self.load_gpr(&address.base.clone(), Register::R11, true);
        match &address.index {
            Some(index) => {
                let wide = Self::is_wide(index.kind());
                self.load_gpr(&index.clone(), Register::R10, wide);
                if !wide {
                    // Zero the upper half so the index arithmetic sees a clean 64 bit value
                    self.asm.movsxd_rr(Register::R10, Register::R10);
                }
                Mem::indexed(Register::R11, Register::R10, address.scale, address.displacement)
            }
            None => Mem::base(Register::R11, address.displacement),
        }
    }

    fn load_from_mem(&mut self, mem: &Mem, kind: Kind) -> Register {
        match kind {
            Kind::Boolean => {
                self.asm.load8_unsigned(Register::RAX, mem);
                Register::RAX
            }
            Kind::Byte => {
                self.asm.load8_signed(Register::RAX, mem);
                Register::RAX
            }
            Kind::Char => {
                self.asm.load16_unsigned(Register::RAX, mem);
                Register::RAX
            }
            Kind::Short => {
                self.asm.load16_signed(Register::RAX, mem);
                Register::RAX
            }
            Kind::Int => {
                self.asm.load32(Register::RAX, mem);
                Register::RAX
            }
            Kind::Float => {
                self.asm.loadf(false, Register::XMM0, mem);
                Register::XMM0
            }
            Kind::Double => {
                self.asm.loadf(true, Register::XMM0, mem);
                Register::XMM0
            }
            _ => {
                self.asm.load64(Register::RAX, mem);
                Register::RAX
            }
        }
    }

    fn store_to_mem(&mut self, mem: &Mem, kind: Kind, value: &Operand) {
        match kind {
            Kind::Boolean | Kind::Byte => {
                self.load_gpr(value, Register::RAX, false);
                self.asm.store8(mem, Register::RAX);
            }
            Kind::Char | Kind::Short => {
                self.load_gpr(value, Register::RAX, false);
                self.asm.store16(mem, Register::RAX);
            }
            Kind::Int => {
                self.load_gpr(value, Register::RAX, false);
                self.asm.store32(mem, Register::RAX);
            }
            Kind::Float => {
                self.load_fpu(value, Register::XMM0, false);
                self.asm.storef(false, mem, Register::XMM0);
            }
            Kind::Double => {
                self.load_fpu(value, Register::XMM0, true);
                self.asm.storef(true, mem, Register::XMM0);
            }
            _ => {
                self.load_gpr(value, Register::RAX, true);
                self.asm.store64(mem, Register::RAX);
            }
        }
    }

    fn block_label(&mut self, block: BlockId) -> &mut Label {
        &mut self.block_labels[block.index()]
    }

    fn local_label(&mut self, label: u32) -> &mut Label {
        let index = usize::try_from(label).unwrap_or(usize::MAX);
        while self.local_labels.len() <= index {
            self.local_labels.push(Label::new());
        }
        &mut self.local_labels[index]
    }

    // Operation emission

    #[expect(clippy::too_many_lines)]
    fn emit_op(&mut self, op: &LirOp, next_block: Option<BlockId>) -> Result<()> {
        match op {
            LirOp::Move { src, dest } => self.emit_move(src, dest),
            LirOp::Arith {
                op,
                kind,
                x,
                y,
                dest,
                ..
            } => self.emit_arith(*op, *kind, x, y, dest),
            LirOp::Shift {
                op,
                kind,
                value,
                amount,
                dest,
            } => {
                let wide = *kind == Kind::Long;
                self.load_gpr(value, Register::RAX, wide);
                self.load_gpr(amount, Register::RCX, false);
                let shift = match op {
                    ShiftOp::Shl => ShiftKind::Shl,
                    ShiftOp::Shr => ShiftKind::Sar,
                    ShiftOp::Ushr => ShiftKind::Shr,
                };
                self.asm.shift_cl(shift, wide, Register::RAX);
                self.store_gpr(Register::RAX, dest, wide);
            }
            LirOp::Logic { op, kind, x, y, dest } => {
                let wide = *kind == Kind::Long;
                self.load_gpr(x, Register::RAX, wide);
                self.load_gpr(y, Register::RCX, wide);
                let alu = match op {
                    LogicOp::And => AluOp::And,
                    LogicOp::Or => AluOp::Or,
                    LogicOp::Xor => AluOp::Xor,
                };
                self.asm.alu_rr(alu, wide, Register::RAX, Register::RCX);
                self.store_gpr(Register::RAX, dest, wide);
            }
            LirOp::Negate { kind, value, dest } => self.emit_negate(*kind, value, dest),
            LirOp::Convert {
                from,
                to,
                value,
                dest,
            } => self.emit_convert(*from, *to, value, dest),
            LirOp::CompareToInt {
                kind,
                x,
                y,
                nan_greater,
                dest,
            } => self.emit_compare_to_int(*kind, x, y, *nan_greater, dest),
            LirOp::Cmp { kind, x, y } => self.emit_cmp(*kind, x, y),
            LirOp::Branch { condition, target } => {
                let mut label = std::mem::take(self.block_label(*target));
                self.asm.jcc(*condition, &mut label);
                *self.block_label(*target) = label;
            }
            LirOp::BranchLocal { condition, label } => {
                let mut taken = std::mem::take(self.local_label(*label));
                self.asm.jcc(*condition, &mut taken);
                *self.local_label(*label) = taken;
            }
            LirOp::LabelLocal { label } => {
                let mut bound = std::mem::take(self.local_label(*label));
                self.asm.bind(&mut bound);
                *self.local_label(*label) = bound;
            }
            LirOp::Jump { target } => {
                if next_block != Some(*target) {
                    let mut label = std::mem::take(self.block_label(*target));
                    self.asm.jmp(&mut label);
                    *self.block_label(*target) = label;
                }
            }
            LirOp::CondMove {
                condition,
                kind,
                true_value,
                false_value,
                dest,
            } => {
                // Plain moves leave the flags intact
                let mut take_true = Label::new();
                let mut done = Label::new();
                self.asm.jcc(*condition, &mut take_true);
                self.emit_move(false_value, &scratch_for(*kind));
                self.asm.jmp(&mut done);
                self.asm.bind(&mut take_true);
                self.emit_move(true_value, &scratch_for(*kind));
                self.asm.bind(&mut done);
                let scratch = scratch_for(*kind);
                self.emit_move(&scratch, dest);
            }
            LirOp::Return { .. } => self.emit_epilogue(),
            LirOp::Load { address, dest, info } => {
                let mem = self.resolve_address(address);
                if let Some(info) = info.clone() {
                    self.record_handlers(self.position(), &info);
                }
                let reg = self.load_from_mem(&mem, address.kind);
                if reg.is_fpu() {
                    self.store_fpu(reg, dest, address.kind == Kind::Double);
                } else {
                    self.store_gpr(reg, dest, Self::is_wide(address.kind.stack_kind()));
                }
            }
            LirOp::Store {
                address,
                value,
                info,
            } => {
                let mem = self.resolve_address(address);
                if let Some(info) = info.clone() {
                    self.record_handlers(self.position(), &info);
                }
                self.store_to_mem(&mem, address.kind, value);
            }
            LirOp::Trap {
                condition,
                kind,
                x,
                y,
                stub,
                info,
            } => {
                self.emit_cmp(*kind, x, y);
                let mut trap = TrapOut {
                    label: Label::new(),
                    stub: *stub,
                    stack_map: self.frame.stack_map(&[]),
                    handlers: info.handlers.clone(),
                };
                self.asm.jcc(*condition, &mut trap.label);
                self.trap_outs.push(trap);
            }
            LirOp::Membar { barriers } => {
                if barriers.contains(Barriers::STORE_LOAD) {
                    self.asm.mfence();
                }
            }
            LirOp::Safepoint { info } => {
                let position = self.position();
                self.record_handlers(position, info);
                self.method.record_safepoint(SafepointSite {
                    position,
                    register_map: RefMap::new(16),
                    stack_map: self.frame.stack_map(&[]),
                });
                self.asm
                    .load64(Register::R11, &Mem::absolute(0x1000_0000));
            }
            LirOp::DirectCall {
                method,
                pointer_slots,
                info,
                ..
            } => {
                let position = self.position();
                let _ = self.asm.call_rel32();
                self.record_handlers(position, info);
                self.method.record_direct_call(CallSite {
                    position,
                    method: Some(*method),
                    stack_map: self.frame.stack_map(pointer_slots),
                });
            }
            LirOp::IndirectCall {
                address,
                method,
                pointer_slots,
                info,
                ..
            } => {
                self.load_gpr(address, Register::RAX, true);
                let position = self.position();
                self.asm.call_reg(Register::RAX);
                self.record_handlers(position, info);
                self.method.record_indirect_call(CallSite {
                    position,
                    method: Some(*method),
                    stack_map: self.frame.stack_map(pointer_slots),
                });
            }
            LirOp::CallRuntime {
                call,
                arguments,
                result,
                info,
            } => self.emit_runtime_call(*call, arguments, result, info.as_ref()),
            LirOp::Sqrt { double, value, dest } => {
                self.load_fpu(value, Register::XMM0, *double);
                self.asm
                    .sse_rr(SseOp::Sqrt, *double, Register::XMM0, Register::XMM0);
                self.store_fpu(Register::XMM0, dest, *double);
            }
            LirOp::FpAbs { double, value, dest } => {
                let wide = *double;
                self.load_gpr(value, Register::RAX, wide);
                let mask = if wide { 0x7fff_ffff_ffff_ffff } else { 0x7fff_ffff };
                self.asm.mov_ri(Register::RCX, mask);
                self.asm.alu_rr(AluOp::And, wide, Register::RAX, Register::RCX);
                self.store_gpr(Register::RAX, dest, wide);
            }
            LirOp::Cas {
                address,
                expect,
                update,
                result,
                kind,
            } => {
                let mem = self.resolve_address(address);
                let wide = Self::is_wide(*kind);
                self.load_gpr(expect, Register::RAX, wide);
                self.load_gpr(update, Register::RCX, wide);
                self.asm.lock_cmpxchg(wide, &mem, Register::RCX);
                self.asm.setcc(Condition::Equal, Register::RDX);
                self.asm.movzx8_rr(Register::RDX, Register::RDX);
                self.store_gpr(Register::RDX, result, false);
            }
            LirOp::Xir { snippet, info } => self.emit_xir(snippet, info.as_ref())?,
            LirOp::OsrEntry { dest } => {
                // The OSR buffer arrives in r10
                self.store_gpr(Register::R10, dest, true);
            }
            LirOp::StackAllocate { offset, dest } => {
                let rbp_offset = self.frame.stack_alloc_offset(*offset);
                self.asm.lea(Register::RAX, &Mem::base(Register::RBP, rbp_offset));
                self.store_gpr(Register::RAX, dest, true);
            }
            LirOp::MonitorAddress { lock, dest } => {
                let rbp_offset = self.frame.monitor_offset(*lock);
                self.asm.lea(Register::RAX, &Mem::base(Register::RBP, rbp_offset));
                self.store_gpr(Register::RAX, dest, true);
            }
        }
        Ok(())
    }

    fn emit_arith(
        &mut self,
        op: ArithOp,
        kind: Kind,
        x: &Operand,
        y: &Operand,
        dest: &Operand,
    ) {
        match kind {
            Kind::Float | Kind::Double => {
                let double = kind == Kind::Double;
                if matches!(op, ArithOp::Rem) {
                    // Floating point remainder goes through the runtime
                    let call = if double {
                        RuntimeCall::ArithmeticDrem
                    } else {
                        RuntimeCall::ArithmeticFrem
                    };
                    self.emit_runtime_call(call, &[x.clone(), y.clone()], dest, None);
                    return;
                }
                let sse = match op {
                    ArithOp::Add => SseOp::Add,
                    ArithOp::Sub => SseOp::Sub,
                    ArithOp::Mul => SseOp::Mul,
                    _ => SseOp::Div,
                };
                self.load_fpu(x, Register::XMM0, double);
                self.load_fpu(y, Register::XMM1, double);
                self.asm.sse_rr(sse, double, Register::XMM0, Register::XMM1);
                self.store_fpu(Register::XMM0, dest, double);
            }
            _ => {
                let wide = kind == Kind::Long;
                match op {
                    ArithOp::Div | ArithOp::Rem => {
                        self.load_gpr(x, Register::RAX, wide);
                        self.load_gpr(y, Register::RCX, wide);
                        self.asm.sign_extend_rax(wide);
                        self.asm.idiv(wide, Register::RCX);
                        let result = if op == ArithOp::Div {
                            Register::RAX
                        } else {
                            Register::RDX
                        };
                        self.store_gpr(result, dest, wide);
                    }
                    ArithOp::Mul => {
                        self.load_gpr(x, Register::RAX, wide);
                        self.load_gpr(y, Register::RCX, wide);
                        self.asm.imul_rr(wide, Register::RAX, Register::RCX);
                        self.store_gpr(Register::RAX, dest, wide);
                    }
                    ArithOp::Add | ArithOp::Sub => {
                        let alu = if op == ArithOp::Add {
                            AluOp::Add
                        } else {
                            AluOp::Sub
                        };
                        self.load_gpr(x, Register::RAX, wide);
                        self.load_gpr(y, Register::RCX, wide);
                        self.asm.alu_rr(alu, wide, Register::RAX, Register::RCX);
                        self.store_gpr(Register::RAX, dest, wide);
                    }
                }
            }
        }
    }

    fn emit_negate(&mut self, kind: Kind, value: &Operand, dest: &Operand) {
        match kind {
            Kind::Float | Kind::Double => {
                let double = kind == Kind::Double;
                let sign = if double {
                    i64::MIN
                } else {
                    i64::from(i32::MIN)
                };
                self.load_fpu(value, Register::XMM0, double);
                self.asm.mov_ri(Register::RAX, sign);
                self.asm.movf_from_gpr(double, Register::XMM1, Register::RAX);
                self.asm.xorps(Register::XMM0, Register::XMM1);
                self.store_fpu(Register::XMM0, dest, double);
            }
            _ => {
                let wide = kind == Kind::Long;
                self.load_gpr(value, Register::RAX, wide);
                self.asm.neg(wide, Register::RAX);
                self.store_gpr(Register::RAX, dest, wide);
            }
        }
    }

    #[expect(clippy::too_many_lines)]
    fn emit_convert(&mut self, from: Kind, to: Kind, value: &Operand, dest: &Operand) {
        match (from, to) {
            (Kind::Int, Kind::Long) => {
                self.load_gpr(value, Register::RAX, false);
                self.asm.movsxd_rr(Register::RAX, Register::RAX);
                self.store_gpr(Register::RAX, dest, true);
            }
            (Kind::Long, Kind::Int) => {
                self.load_gpr(value, Register::RAX, true);
                self.store_gpr(Register::RAX, dest, false);
            }
            (Kind::Int, Kind::Byte) => {
                self.load_gpr(value, Register::RAX, false);
                self.asm.movsx8_rr(Register::RAX, Register::RAX);
                self.store_gpr(Register::RAX, dest, false);
            }
            (Kind::Int, Kind::Char) => {
                self.load_gpr(value, Register::RAX, false);
                self.asm.movzx16_rr(Register::RAX, Register::RAX);
                self.store_gpr(Register::RAX, dest, false);
            }
            (Kind::Int, Kind::Short) => {
                self.load_gpr(value, Register::RAX, false);
                self.asm.movsx16_rr(Register::RAX, Register::RAX);
                self.store_gpr(Register::RAX, dest, false);
            }
            (Kind::Int | Kind::Long, Kind::Float | Kind::Double) => {
                let wide = from == Kind::Long;
                let double = to == Kind::Double;
                self.load_gpr(value, Register::RAX, wide);
                self.asm.cvtsi2f(double, wide, Register::XMM0, Register::RAX);
                self.store_fpu(Register::XMM0, dest, double);
            }
            (Kind::Float | Kind::Double, Kind::Int | Kind::Long) => {
                self.emit_float_to_int(from == Kind::Double, to == Kind::Long, value, dest);
            }
            (Kind::Float, Kind::Double) | (Kind::Double, Kind::Float) => {
                let to_double = to == Kind::Double;
                self.load_fpu(value, Register::XMM0, !to_double);
                self.asm.cvtf2f(to_double, Register::XMM0, Register::XMM0);
                self.store_fpu(Register::XMM0, dest, to_double);
            }
            _ => {
                // Same-kind conversions degenerate to a move
                self.emit_move(value, dest);
            }
        }
    }

    /// Truncating float to int conversion with the fixups Java semantics demand: NaN becomes
    /// zero and out of range values saturate.
    fn emit_float_to_int(&mut self, double: bool, wide: bool, value: &Operand, dest: &Operand) {
        self.load_fpu(value, Register::XMM0, double);
        self.asm.cvtf2si(double, wide, Register::RAX, Register::XMM0);
        let sentinel = if wide { i64::MIN } else { i64::from(i32::MIN) };
        if wide {
            self.asm.mov_ri(Register::RCX, sentinel);
        } else {
            self.asm.mov32_ri(Register::RCX, i32::MIN);
        }
        self.asm.alu_rr(AluOp::Cmp, wide, Register::RAX, Register::RCX);
        let mut done = Label::new();
        self.asm.jcc(Condition::NotEqual, &mut done);
        // Sentinel: the input was NaN, MIN, or out of range
        self.asm.alu_rr(AluOp::Xor, false, Register::RAX, Register::RAX);
        self.asm.ucomi(double, Register::XMM0, Register::XMM0);
        self.asm.jp(&mut done);
        self.asm.mov_ri(Register::RAX, sentinel);
        self.asm.alu_rr(AluOp::Xor, false, Register::RCX, Register::RCX);
        self.asm.movf_from_gpr(double, Register::XMM1, Register::RCX);
        self.asm.ucomi(double, Register::XMM0, Register::XMM1);
        self.asm.jcc(Condition::Below, &mut done);
        let max = if wide { i64::MAX } else { i64::from(i32::MAX) };
        self.asm.mov_ri(Register::RAX, max);
        self.asm.bind(&mut done);
        self.store_gpr(Register::RAX, dest, wide);
    }

    fn emit_cmp(&mut self, kind: Kind, x: &Operand, y: &Operand) {
        match kind {
            Kind::Float | Kind::Double => {
                let double = kind == Kind::Double;
                self.load_fpu(x, Register::XMM0, double);
                self.load_fpu(y, Register::XMM1, double);
                self.asm.ucomi(double, Register::XMM0, Register::XMM1);
            }
            _ => {
                let wide = Self::is_wide(kind);
                self.load_gpr(x, Register::RAX, wide);
                self.load_gpr(y, Register::RCX, wide);
                self.asm.alu_rr(AluOp::Cmp, wide, Register::RAX, Register::RCX);
            }
        }
    }

    /// The three-way comparison producing -1, 0 or 1 in a register.
    fn emit_compare_to_int(
        &mut self,
        kind: Kind,
        x: &Operand,
        y: &Operand,
        nan_greater: bool,
        dest: &Operand,
    ) {
        let mut done = Label::new();
        match kind {
            Kind::Float | Kind::Double => {
                let double = kind == Kind::Double;
                self.load_fpu(x, Register::XMM0, double);
                self.load_fpu(y, Register::XMM1, double);
                self.asm.ucomi(double, Register::XMM0, Register::XMM1);
                let nan_result = if nan_greater { 1 } else { -1 };
                self.asm.mov32_ri(Register::RAX, nan_result);
                self.asm.jp(&mut done);
                self.asm.mov32_ri(Register::RAX, 1);
                self.asm.jcc(Condition::Above, &mut done);
                self.asm.mov32_ri(Register::RAX, -1);
                self.asm.jcc(Condition::Below, &mut done);
                self.asm.mov32_ri(Register::RAX, 0);
            }
            _ => {
                self.load_gpr(x, Register::RAX, true);
                self.load_gpr(y, Register::RCX, true);
                self.asm.alu_rr(AluOp::Cmp, true, Register::RAX, Register::RCX);
                self.asm.mov32_ri(Register::RAX, 1);
                self.asm.jcc(Condition::Greater, &mut done);
                self.asm.mov32_ri(Register::RAX, -1);
                self.asm.jcc(Condition::Less, &mut done);
                self.asm.mov32_ri(Register::RAX, 0);
            }
        }
        self.asm.bind(&mut done);
        self.store_gpr(Register::RAX, dest, false);
    }

    /// Move arguments into the runtime call convention, call, and fetch the result.
    fn emit_runtime_call(
        &mut self,
        call: RuntimeCall,
        arguments: &[Operand],
        result: &Operand,
        info: Option<&LirDebugInfo>,
    ) {
        let kinds: Vec<Kind> = arguments.iter().map(Operand::kind).collect();
        let mut cpu_index = 0;
        let mut fpu_index = 0;
        for (argument, kind) in arguments.iter().zip(kinds.iter()) {
            if kind.is_float() {
                let register = FPU_ARGUMENT_REGISTERS[fpu_index];
                fpu_index += 1;
                self.load_fpu(argument, register, *kind == Kind::Double);
            } else {
                let register = CPU_ARGUMENT_REGISTERS[cpu_index];
                cpu_index += 1;
                self.load_gpr(argument, register, true);
            }
        }
        let position = self.position();
        let _ = self.asm.call_rel32();
        if let Some(info) = info {
            self.record_handlers(position, info);
        }
        self.method.record_runtime_call(RuntimeCallSite {
            position,
            call,
            stack_map: self.frame.stack_map(&[]),
        });
        if !result.is_illegal() {
            let result_kind = call.result_kind();
            match CallingConvention::result_location(result_kind) {
                Operand::Register { register, .. } if register.is_fpu() => {
                    self.store_fpu(register, result, result_kind == Kind::Double);
                }
                Operand::Register { register, .. } => {
                    self.store_gpr(register, result, Self::is_wide(result_kind));
                }
                _ => {}
            }
        }
    }

    // XIR expansion

    fn xir_operand(snippet: &BoundXirSnippet, operand: &XirOperand) -> Operand {
        match operand {
            XirOperand::Result => snippet.result.clone(),
            XirOperand::Input(index) => snippet.inputs[*index].clone(),
            XirOperand::Temp(index) => snippet.temps[*index].clone(),
            XirOperand::Const(value) => Operand::Const(*value),
            XirOperand::Fixed { register, kind } => Operand::Register {
                register: *register,
                kind: *kind,
            },
        }
    }

    fn emit_xir(&mut self, snippet: &BoundXirSnippet, info: Option<&LirDebugInfo>) -> Result<()> {
        let template = &snippet.template;
        let mut labels: Vec<Label> = (0..template.label_count).map(|_| Label::new()).collect();
        if let Some(info) = info {
            self.record_handlers(self.position(), info);
        }
        for op in template.fast_path.iter().chain(template.slow_path.iter()) {
            match op {
                XirOp::Mov { dest, src } => {
                    let src = Self::xir_operand(snippet, src);
                    let dest = Self::xir_operand(snippet, dest);
                    self.emit_move(&src, &dest);
                }
                XirOp::Add { dest, x, y } => {
                    let x = Self::xir_operand(snippet, x);
                    let y = Self::xir_operand(snippet, y);
                    let dest = Self::xir_operand(snippet, dest);
                    self.emit_arith(ArithOp::Add, dest.kind().stack_kind(), &x, &y, &dest);
                }
                XirOp::Shr { dest, x, amount } => {
                    let x = Self::xir_operand(snippet, x);
                    let amount = Self::xir_operand(snippet, amount);
                    let dest = Self::xir_operand(snippet, dest);
                    self.load_gpr(&x, Register::RAX, true);
                    self.load_gpr(&amount, Register::RCX, false);
                    self.asm.shift_cl(ShiftKind::Shr, true, Register::RAX);
                    self.store_gpr(Register::RAX, &dest, true);
                }
                XirOp::Load {
                    dest,
                    base,
                    index,
                    scale,
                    displacement,
                    kind,
                } => {
                    let address = Self::xir_address(snippet, base, index.as_ref(), *scale, *displacement, *kind);
                    let mem = self.resolve_address(&address);
                    let reg = self.load_from_mem(&mem, *kind);
                    let dest = Self::xir_operand(snippet, dest);
                    if reg.is_fpu() {
                        self.store_fpu(reg, &dest, *kind == Kind::Double);
                    } else {
                        self.store_gpr(reg, &dest, Self::is_wide(kind.stack_kind()));
                    }
                }
                XirOp::Store {
                    base,
                    index,
                    scale,
                    displacement,
                    value,
                    kind,
                } => {
                    let address = Self::xir_address(snippet, base, index.as_ref(), *scale, *displacement, *kind);
                    let mem = self.resolve_address(&address);
                    let value = Self::xir_operand(snippet, value);
                    self.store_to_mem(&mem, *kind, &value);
                }
                XirOp::Jump { label } => {
                    let mut target = std::mem::take(&mut labels[label.0]);
                    self.asm.jmp(&mut target);
                    labels[label.0] = target;
                }
                XirOp::Jcc {
                    condition,
                    x,
                    y,
                    label,
                } => {
                    let x = Self::xir_operand(snippet, x);
                    let y = Self::xir_operand(snippet, y);
                    self.emit_cmp(x.kind().stack_kind(), &x, &y);
                    let mut target = std::mem::take(&mut labels[label.0]);
                    self.asm.jcc(*condition, &mut target);
                    labels[label.0] = target;
                }
                XirOp::Bind { label } => {
                    let mut target = std::mem::take(&mut labels[label.0]);
                    self.asm.bind(&mut target);
                    labels[label.0] = target;
                }
                XirOp::CallRuntime {
                    call,
                    arguments,
                    result,
                } => {
                    let operands: Vec<Operand> = arguments
                        .iter()
                        .map(|argument| Self::xir_operand(snippet, argument))
                        .collect();
                    let result = result
                        .as_ref()
                        .map_or(Operand::Illegal, |result| Self::xir_operand(snippet, result));
                    self.emit_runtime_call(*call, &operands, &result, info);
                }
                XirOp::CallStub { stub } => {
                    let position = self.position();
                    let _ = self.asm.call_rel32();
                    self.method.record_stub_call(StubCallSite {
                        position,
                        stub: *stub,
                        register_map: RefMap::new(16),
                        stack_map: self.frame.stack_map(&[]),
                    });
                }
                XirOp::Mark { name } => {
                    if *name == "safepoint" {
                        let position = self.position();
                        self.method.record_safepoint(SafepointSite {
                            position,
                            register_map: RefMap::new(16),
                            stack_map: self.frame.stack_map(&[]),
                        });
                    }
                }
                XirOp::ShouldNotReachHere => self.asm.int3(),
            }
        }
        Ok(())
    }

    fn xir_address(
        snippet: &BoundXirSnippet,
        base: &XirOperand,
        index: Option<&XirOperand>,
        scale: Scale,
        displacement: i32,
        kind: Kind,
    ) -> Address {
        let base = Self::xir_operand(snippet, base);
        match index {
            Some(index) => Address::indexed(
                base,
                Self::xir_operand(snippet, index),
                scale,
                displacement,
                kind,
            ),
            None => Address::offset(base, displacement, kind),
        }
    }
}

/// A scratch variable-free staging location for conditional moves.
fn scratch_for(kind: Kind) -> Operand {
    if kind.is_float() {
        Operand::Register {
            register: Register::XMM1,
            kind,
        }
    } else {
        Operand::Register {
            register: Register::RDX,
            kind,
        }
    }
}
