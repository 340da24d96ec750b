//! Adapter generation.
//!
//! The VM runs two calling conventions: *optimized* (arguments in registers, overflow on the
//! stack) and *baseline* (all arguments on the stack in JVM frame layout). When a caller of one
//! convention invokes a callee of the other, a small thunk reshuffles the arguments. Adapter
//! bodies depend only on the callee's argument kinds, so one adapter per signature is shared
//! process-wide; the prologue emitted into each callee is a fixed size call to that adapter.

use crate::error::{Error, Result};
use crate::sig::Sig;
use ahash::AHashMap;
use lungo_code::asm::{AluOp, Amd64Assembler, Mem};
use lungo_code::{
    CPU_ARGUMENT_REGISTERS, FPU_ARGUMENT_REGISTERS, Kind, Method, Register, Target,
};
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Byte length of the prologue every adapted callee starts with: a call to the adapter padded
/// to a fixed size so stack walkers can recognize it.
pub const PROLOGUE_SIZE: usize = 8;

/// The class file format caps method arguments at 255 slots; a larger signature cannot belong
/// to a real callee and is rejected before any adapter frame is sized.
///
/// See: <https://docs.oracle.com/javase/specs/jvms/se24/html/jvms-4.html#jvms-4.3.3>
const MAX_ARGUMENT_SLOTS: u32 = 255;

/// The two adaptation directions.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Direction {
    /// An optimized caller invoking a baseline callee
    Opt2Baseline,
    /// A baseline caller invoking an optimized callee
    Baseline2Opt,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Opt2Baseline => write!(f, "OPT2BASELINE"),
            Direction::Baseline2Opt => write!(f, "BASELINE2OPT"),
        }
    }
}

/// A finished adapter: immutable once published.
#[derive(Debug)]
pub struct Adapter {
    pub direction: Direction,
    pub sig: Sig,
    pub code: Vec<u8>,
    /// Bytes of stack the adapter occupies beyond the caller frame
    pub frame_size: i32,
}

/// Where prologue bytes go: an in-memory assembler buffer when installing a method, or a plain
/// byte stream when producing code offline. Either way the same bytes arrive in the same order.
pub trait OutputSink {
    fn write_bytes(&mut self, bytes: &[u8]);
}

impl OutputSink for Vec<u8> {
    fn write_bytes(&mut self, bytes: &[u8]) {
        self.extend_from_slice(bytes);
    }
}

impl OutputSink for lungo_code::asm::CodeBuffer {
    fn write_bytes(&mut self, bytes: &[u8]) {
        self.emit_bytes(bytes);
    }
}

/// A walker's view of one stack frame, advanced by the adapter generator when the instruction
/// pointer sits inside an adapter prologue.
pub trait StackCursor {
    /// Current instruction pointer.
    fn ip(&self) -> u64;
    /// Entry address of the method the instruction pointer is in.
    fn method_start(&self) -> u64;
    /// Step to the calling frame.
    fn advance_to_caller(&mut self);
}

/// Generates and caches the adapters of one direction.
pub struct AdapterGenerator {
    direction: Direction,
    target: Target,
    adapters: Mutex<AHashMap<Sig, Arc<Adapter>>>,
}

impl fmt::Debug for AdapterGenerator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdapterGenerator")
            .field("direction", &self.direction)
            .field("cached", &self.adapters.lock().len())
            .finish()
    }
}

impl AdapterGenerator {
    #[must_use]
    pub fn new(direction: Direction, target: Target) -> AdapterGenerator {
        AdapterGenerator {
            direction,
            target,
            adapters: Mutex::new(AHashMap::default()),
        }
    }

    #[must_use]
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Return whether `callee` needs no adaptation in this direction.
    ///
    /// Adapters, templates and native entry stubs have a single calling convention and are
    /// never adapted. A parameterless static callee needs no argument shuffling towards the
    /// baseline convention; towards the optimized convention the adapter still performs the
    /// frame pointer save and is kept.
    #[must_use]
    pub fn adaptation_elided(&self, callee: &Method) -> bool {
        if callee.single_convention() {
            return true;
        }
        self.direction == Direction::Opt2Baseline
            && callee.is_static()
            && callee
                .signature()
                .map(|signature| signature.parameters().is_empty())
                .unwrap_or(false)
    }

    /// Emit `callee`'s entry prologue into `out` and return the shared adapter for its
    /// signature, or `None` when no adaptation is needed.
    ///
    /// # Errors
    ///
    /// if the callee signature cannot be parsed or is too large to adapt
    pub fn adapt(&self, callee: &Method, out: &mut dyn OutputSink) -> Result<Option<Arc<Adapter>>> {
        if self.adaptation_elided(callee) {
            return Ok(None);
        }
        let sig = Sig::for_method(callee)?;
        let adapter = self.adapter_for(&sig)?;
        // The prologue is a call to the adapter, padded to the fixed prologue size. The call
        // displacement is linked when the method is installed next to the adapter.
        let mut prologue = Amd64Assembler::new();
        let _ = prologue.call_rel32();
        while prologue.position() < PROLOGUE_SIZE {
            prologue.nop();
        }
        let (bytes, _) = prologue.finish().finish();
        debug_assert_eq!(PROLOGUE_SIZE, bytes.len());
        out.write_bytes(&bytes);
        Ok(Some(adapter))
    }

    /// The exact byte length of the prologue emitted for `callee`, so the stack walker can
    /// detect frames stopped inside it.
    #[must_use]
    pub fn prologue_size_for_callee(&self, callee: &Method) -> usize {
        if self.adaptation_elided(callee) {
            0
        } else {
            PROLOGUE_SIZE
        }
    }

    /// If the cursor's instruction pointer lies within an adapter prologue, advance the cursor
    /// to the caller frame and return true.
    pub fn advance_if_in_prologue(&self, cursor: &mut dyn StackCursor) -> bool {
        let offset = cursor.ip().wrapping_sub(cursor.method_start());
        if offset < u64::try_from(PROLOGUE_SIZE).unwrap_or(0) {
            cursor.advance_to_caller();
            return true;
        }
        false
    }

    /// Number of adapters built so far.
    #[must_use]
    pub fn cached(&self) -> usize {
        self.adapters.lock().len()
    }

    /// Return the adapter for `sig`, building it if absent. The lock spans the build so at
    /// most one adapter is ever materialized per signature, and every caller observes the same
    /// finished adapter.
    fn adapter_for(&self, sig: &Sig) -> Result<Arc<Adapter>> {
        let mut adapters = self.adapters.lock();
        if let Some(adapter) = adapters.get(sig) {
            return Ok(Arc::clone(adapter));
        }
        let adapter = Arc::new(self.emit_adapter(sig)?);
        adapters.insert(sig.clone(), Arc::clone(&adapter));
        debug!(direction = %self.direction, sig = %sig, "built adapter");
        Ok(adapter)
    }

    fn emit_adapter(&self, sig: &Sig) -> Result<Adapter> {
        let slots = sig.slot_count();
        if slots > MAX_ARGUMENT_SLOTS {
            return Err(Error::FrameOverflow { slots });
        }
        let code = match self.direction {
            Direction::Baseline2Opt => self.emit_baseline_to_opt(sig)?,
            Direction::Opt2Baseline => self.emit_opt_to_baseline(sig)?,
        };
        let slot_size = match self.direction {
            Direction::Baseline2Opt => self.target.baseline_slot_size,
            Direction::Opt2Baseline => self.target.opt_slot_size,
        };
        let frame_size = i32::try_from(sig.slot_count()).unwrap_or(i32::MAX) * slot_size;
        Ok(Adapter {
            direction: self.direction,
            sig: sig.clone(),
            code,
            frame_size,
        })
    }

    /// A baseline caller reached an optimized callee. On entry to the adapter the stack is
    /// `[adapter return][caller return][arg slots...]`; the adapter saves the frame pointer,
    /// moves the slot arguments into the optimized argument registers (overflow into the
    /// positions the optimized entry expects), restores and returns into the method body.
    fn emit_baseline_to_opt(&self, sig: &Sig) -> Result<Vec<u8>> {
        let mut asm = Amd64Assembler::new();
        asm.push(Register::RBP);
        // arg slot i now lives at [rsp + 24 + 8 * i]
        let slot_base = 24;
        let mut cpu_index = 0;
        let mut fpu_index = 0;
        let mut overflow = 0;
        let mut slot = 0i32;
        for kind in sig.kinds() {
            let from = Mem::base(Register::RSP, slot_base + 8 * slot);
            if kind.is_float() {
                match FPU_ARGUMENT_REGISTERS.get(fpu_index) {
                    Some(register) => {
                        asm.loadf(*kind == Kind::Double, *register, &from);
                        fpu_index += 1;
                    }
                    None => {
                        asm.load64(Register::R11, &from);
                        asm.store64(&Mem::base(Register::RSP, slot_base + 8 * overflow), Register::R11);
                        overflow += 1;
                    }
                }
            } else {
                match CPU_ARGUMENT_REGISTERS.get(cpu_index) {
                    Some(register) => {
                        asm.load64(*register, &from);
                        cpu_index += 1;
                    }
                    None => {
                        asm.load64(Register::R11, &from);
                        asm.store64(&Mem::base(Register::RSP, slot_base + 8 * overflow), Register::R11);
                        overflow += 1;
                    }
                }
            }
            slot += i32::try_from(kind.slots()).expect("slot count fits in i32");
        }
        asm.pop(Register::RBP);
        asm.ret();
        let (code, _) = asm.finish().finish();
        Ok(code)
    }

    /// An optimized caller reached a baseline callee. The adapter pushes the register (and
    /// overflow stack) arguments into JVM slot layout, calls the body, then unwinds its frame
    /// and returns to the real caller. Results travel in the shared result location and are
    /// never touched.
    fn emit_opt_to_baseline(&self, sig: &Sig) -> Result<Vec<u8>> {
        // Assign locations in forward argument order first
        enum ArgLocation {
            Cpu(Register),
            Fpu(Register),
            Overflow(i32),
        }
        let mut locations = Vec::with_capacity(sig.kinds().len());
        let mut cpu_index = 0;
        let mut fpu_index = 0;
        let mut overflow = 0i32;
        for kind in sig.kinds() {
            let location = if kind.is_float() {
                match FPU_ARGUMENT_REGISTERS.get(fpu_index) {
                    Some(register) => {
                        fpu_index += 1;
                        ArgLocation::Fpu(*register)
                    }
                    None => {
                        overflow += 1;
                        ArgLocation::Overflow(overflow - 1)
                    }
                }
            } else {
                match CPU_ARGUMENT_REGISTERS.get(cpu_index) {
                    Some(register) => {
                        cpu_index += 1;
                        ArgLocation::Cpu(*register)
                    }
                    None => {
                        overflow += 1;
                        ArgLocation::Overflow(overflow - 1)
                    }
                }
            };
            locations.push(location);
        }

        let mut asm = Amd64Assembler::new();
        asm.push(Register::RBP);
        asm.mov_rr(true, Register::RBP, Register::RSP);
        // The body continuation is the adapter call's return address
        asm.load64(Register::R11, &Mem::base(Register::RBP, 8));
        // Incoming overflow arguments of the optimized caller sit above its return address
        let incoming_base = 24;
        // Push slots in reverse so slot zero ends up on top of the baseline frame
        for (kind, location) in sig.kinds().iter().zip(locations.iter()).rev() {
            if kind.slots() == 2 {
                // The upper half of a category-2 slot is dead
                asm.alu_ri(AluOp::Sub, true, Register::RSP, 8);
            }
            match location {
                ArgLocation::Cpu(register) => asm.push(*register),
                ArgLocation::Fpu(register) => {
                    asm.alu_ri(AluOp::Sub, true, Register::RSP, 8);
                    asm.storef(*kind == Kind::Double, &Mem::base(Register::RSP, 0), *register);
                }
                ArgLocation::Overflow(slot) => {
                    asm.load64(
                        Register::RAX,
                        &Mem::base(Register::RBP, incoming_base + 8 * slot),
                    );
                    asm.push(Register::RAX);
                }
            }
        }
        asm.call_reg(Register::R11);
        // Unwind the pushed slots and the saved frame pointer, then return to the caller
        asm.mov_rr(true, Register::RSP, Register::RBP);
        asm.pop(Register::RBP);
        asm.ret();
        let (code, _) = asm.finish().finish();
        Ok(code)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use lungo_code::{ConstantPool, MethodFlags};

    fn method(descriptor: &str, flags: MethodFlags) -> Method {
        Method {
            holder: "Foo".to_string(),
            name: "bar".to_string(),
            descriptor: descriptor.to_string(),
            flags,
            code: Vec::new(),
            max_stack: 0,
            max_locals: 0,
            constant_pool: ConstantPool::new(),
            exception_handlers: Vec::new(),
            line_numbers: Vec::new(),
        }
    }

    #[test]
    fn test_parameterless_opt_to_baseline_is_elided() -> Result<()> {
        let generator = AdapterGenerator::new(Direction::Opt2Baseline, Target::amd64());
        let callee = method("()V", MethodFlags::STATIC);
        let mut out = Vec::new();
        assert!(generator.adapt(&callee, &mut out)?.is_none());
        assert!(out.is_empty());
        assert_eq!(0, generator.prologue_size_for_callee(&callee));
        Ok(())
    }

    #[test]
    fn test_parameterless_baseline_to_opt_is_not_elided() -> Result<()> {
        // The frame pointer save makes even the empty signature worth an adapter
        let generator = AdapterGenerator::new(Direction::Baseline2Opt, Target::amd64());
        let callee = method("()V", MethodFlags::STATIC);
        let mut out = Vec::new();
        let adapter = generator.adapt(&callee, &mut out)?.expect("adapter");
        assert_eq!(PROLOGUE_SIZE, out.len());
        assert_eq!(0, adapter.frame_size);
        assert!(!adapter.code.is_empty());
        Ok(())
    }

    #[test]
    fn test_single_convention_callees_never_adapt() -> Result<()> {
        let generator = AdapterGenerator::new(Direction::Baseline2Opt, Target::amd64());
        let callee = method("(I)V", MethodFlags::STATIC | MethodFlags::ADAPTER);
        let mut out = Vec::new();
        assert!(generator.adapt(&callee, &mut out)?.is_none());
        Ok(())
    }

    #[test]
    fn test_prologue_size_matches_emitted_bytes() -> Result<()> {
        let generator = AdapterGenerator::new(Direction::Baseline2Opt, Target::amd64());
        let callee = method("(IJLjava/lang/String;)V", MethodFlags::STATIC);
        let mut out = Vec::new();
        generator.adapt(&callee, &mut out)?;
        assert_eq!(generator.prologue_size_for_callee(&callee), out.len());
        // The prologue begins with a call
        assert_eq!(0xe8, out[0]);
        Ok(())
    }

    #[test]
    fn test_adapters_are_shared_per_signature() -> Result<()> {
        let generator = AdapterGenerator::new(Direction::Baseline2Opt, Target::amd64());
        let first = method("(Ljava/lang/String;I)V", MethodFlags::STATIC);
        let second = method("(Ljava/lang/Object;I)I", MethodFlags::STATIC);
        let mut out = Vec::new();
        let a = generator.adapt(&first, &mut out)?.expect("adapter");
        let b = generator.adapt(&second, &mut out)?.expect("adapter");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(1, generator.cached());
        let third = method("(JI)V", MethodFlags::STATIC);
        let c = generator.adapt(&third, &mut out)?.expect("adapter");
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(2, generator.cached());
        Ok(())
    }

    #[test]
    fn test_oversized_signature_is_rejected() {
        let generator = AdapterGenerator::new(Direction::Baseline2Opt, Target::amd64());
        // 128 longs are 256 slots, one past the class file limit
        let descriptor = format!("({})V", "J".repeat(128));
        let callee = method(&descriptor, MethodFlags::STATIC);
        let mut out = Vec::new();
        let result = generator.adapt(&callee, &mut out);
        assert!(matches!(result, Err(Error::FrameOverflow { slots: 256 })));
        // No prologue bytes reach the sink and nothing is cached
        assert!(out.is_empty());
        assert_eq!(0, generator.cached());
    }

    #[test]
    fn test_frame_size_follows_slot_count() -> Result<()> {
        let generator = AdapterGenerator::new(Direction::Baseline2Opt, Target::amd64());
        let callee = method("(Ljava/lang/Object;IJ)V", MethodFlags::STATIC);
        let mut out = Vec::new();
        let adapter = generator.adapt(&callee, &mut out)?.expect("adapter");
        // object + int + long = 4 slots
        assert_eq!(4 * 8, adapter.frame_size);
        Ok(())
    }

    struct TestCursor {
        ip: u64,
        method_start: u64,
        advanced: bool,
    }

    impl StackCursor for TestCursor {
        fn ip(&self) -> u64 {
            self.ip
        }

        fn method_start(&self) -> u64 {
            self.method_start
        }

        fn advance_to_caller(&mut self) {
            self.advanced = true;
        }
    }

    #[test]
    fn test_advance_if_in_prologue() {
        let generator = AdapterGenerator::new(Direction::Baseline2Opt, Target::amd64());
        let mut inside = TestCursor {
            ip: 0x1004,
            method_start: 0x1000,
            advanced: false,
        };
        assert!(generator.advance_if_in_prologue(&mut inside));
        assert!(inside.advanced);

        let mut outside = TestCursor {
            ip: 0x1040,
            method_start: 0x1000,
            advanced: false,
        };
        assert!(!generator.advance_if_in_prologue(&mut outside));
        assert!(!outside.advanced);
    }
}
