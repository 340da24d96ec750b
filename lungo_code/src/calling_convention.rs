//! The two calling conventions of the VM.
//!
//! The *optimized* convention passes arguments in registers first and spills the remainder to
//! outgoing stack slots; the *baseline* convention passes every argument on the stack in JVM
//! frame layout. Both conventions return results in the same location, which is what allows
//! adapters to ignore results entirely.

use crate::kind::Kind;
use crate::operand::Operand;
use crate::register::Register;
use crate::target::Target;
use std::fmt;

/// Integer argument registers of the optimized convention, in order.
pub const CPU_ARGUMENT_REGISTERS: [Register; 6] = [
    Register::RDI,
    Register::RSI,
    Register::RDX,
    Register::RCX,
    Register::R8,
    Register::R9,
];

/// Floating point argument registers of the optimized convention, in order.
pub const FPU_ARGUMENT_REGISTERS: [Register; 8] = [
    Register::XMM0,
    Register::XMM1,
    Register::XMM2,
    Register::XMM3,
    Register::XMM4,
    Register::XMM5,
    Register::XMM6,
    Register::XMM7,
];

/// The register the ABI delivers a thrown exception in.
pub const EXCEPTION_REGISTER: Register = Register::RAX;

/// Which calling convention a frame follows.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ConventionKind {
    /// All arguments on the stack in JVM slot layout
    Baseline,
    /// Arguments in registers, overflow on the stack
    Optimized,
}

impl fmt::Display for ConventionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConventionKind::Baseline => write!(f, "baseline"),
            ConventionKind::Optimized => write!(f, "optimized"),
        }
    }
}

/// The locations assigned to one argument list under one convention.
#[derive(Clone, Debug, PartialEq)]
pub struct CallingConvention {
    pub kind: ConventionKind,
    /// One location per argument, in argument order
    pub locations: Vec<Operand>,
    /// Bytes of stack occupied by stack-passed arguments
    pub stack_size: i32,
}

impl CallingConvention {
    /// Compute argument locations for `kinds` under the given convention.
    ///
    /// With `outgoing` set, stack locations are slots in the caller's outgoing argument area;
    /// otherwise they are incoming slots addressed in the caller frame.
    #[must_use]
    pub fn compute(
        kind: ConventionKind,
        kinds: &[Kind],
        target: &Target,
        outgoing: bool,
    ) -> CallingConvention {
        match kind {
            ConventionKind::Optimized => Self::compute_optimized(kinds, target, outgoing),
            ConventionKind::Baseline => Self::compute_baseline(kinds, target, outgoing),
        }
    }

    fn compute_optimized(kinds: &[Kind], target: &Target, outgoing: bool) -> CallingConvention {
        let mut locations = Vec::with_capacity(kinds.len());
        let mut cpu_index = 0;
        let mut fpu_index = 0;
        let mut stack_slots = 0;
        for kind in kinds {
            let stack_kind = kind.stack_kind();
            let register = if stack_kind.is_float() {
                let register = FPU_ARGUMENT_REGISTERS.get(fpu_index).copied();
                fpu_index += usize::from(register.is_some());
                register
            } else {
                let register = CPU_ARGUMENT_REGISTERS.get(cpu_index).copied();
                cpu_index += usize::from(register.is_some());
                register
            };
            let location = match register {
                Some(register) => Operand::Register {
                    register,
                    kind: stack_kind,
                },
                None => {
                    let index = stack_slots;
                    stack_slots += 1;
                    Operand::StackSlot {
                        index,
                        kind: stack_kind,
                        caller_frame: !outgoing,
                    }
                }
            };
            locations.push(location);
        }
        CallingConvention {
            kind: ConventionKind::Optimized,
            locations,
            stack_size: stack_slots * target.opt_slot_size,
        }
    }

    fn compute_baseline(kinds: &[Kind], target: &Target, outgoing: bool) -> CallingConvention {
        let mut locations = Vec::with_capacity(kinds.len());
        let mut slot = 0;
        for kind in kinds {
            let stack_kind = kind.stack_kind();
            locations.push(Operand::StackSlot {
                index: slot,
                kind: stack_kind,
                caller_frame: !outgoing,
            });
            slot += i32::try_from(kind.slots()).unwrap_or(1);
        }
        CallingConvention {
            kind: ConventionKind::Baseline,
            locations,
            stack_size: slot * target.baseline_slot_size,
        }
    }

    /// Return the shared result location for a result of `kind`.
    ///
    /// All conventions return results in the same place, so adapters never touch results.
    #[must_use]
    pub fn result_location(kind: Kind) -> Operand {
        let stack_kind = kind.stack_kind();
        match stack_kind {
            Kind::Void => Operand::Illegal,
            Kind::Float | Kind::Double => Operand::Register {
                register: Register::XMM0,
                kind: stack_kind,
            },
            _ => Operand::Register {
                register: Register::RAX,
                kind: stack_kind,
            },
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_optimized_registers_first() {
        let target = Target::amd64();
        let convention = CallingConvention::compute(
            ConventionKind::Optimized,
            &[Kind::Object, Kind::Int, Kind::Float, Kind::Long],
            &target,
            true,
        );
        assert_eq!(
            vec![
                Operand::Register {
                    register: Register::RDI,
                    kind: Kind::Object
                },
                Operand::Register {
                    register: Register::RSI,
                    kind: Kind::Int
                },
                Operand::Register {
                    register: Register::XMM0,
                    kind: Kind::Float
                },
                Operand::Register {
                    register: Register::RDX,
                    kind: Kind::Long
                },
            ],
            convention.locations
        );
        assert_eq!(0, convention.stack_size);
    }

    #[test]
    fn test_optimized_overflow_to_stack() {
        let target = Target::amd64();
        let kinds = [Kind::Int; 8];
        let convention =
            CallingConvention::compute(ConventionKind::Optimized, &kinds, &target, true);
        assert_eq!(
            Operand::StackSlot {
                index: 0,
                kind: Kind::Int,
                caller_frame: false
            },
            convention.locations[6]
        );
        assert_eq!(
            Operand::StackSlot {
                index: 1,
                kind: Kind::Int,
                caller_frame: false
            },
            convention.locations[7]
        );
        assert_eq!(2 * target.opt_slot_size, convention.stack_size);
    }

    #[test]
    fn test_baseline_all_on_stack() {
        let target = Target::amd64();
        let convention = CallingConvention::compute(
            ConventionKind::Baseline,
            &[Kind::Object, Kind::Long, Kind::Int],
            &target,
            false,
        );
        assert_eq!(
            vec![
                Operand::StackSlot {
                    index: 0,
                    kind: Kind::Object,
                    caller_frame: true
                },
                Operand::StackSlot {
                    index: 1,
                    kind: Kind::Long,
                    caller_frame: true
                },
                Operand::StackSlot {
                    index: 3,
                    kind: Kind::Int,
                    caller_frame: true
                },
            ],
            convention.locations
        );
        assert_eq!(4 * target.baseline_slot_size, convention.stack_size);
    }

    #[test]
    fn test_result_location_is_shared() {
        assert_eq!(
            CallingConvention::result_location(Kind::Int),
            Operand::Register {
                register: Register::RAX,
                kind: Kind::Int
            }
        );
        assert_eq!(
            CallingConvention::result_location(Kind::Double),
            Operand::Register {
                register: Register::XMM0,
                kind: Kind::Double
            }
        );
        assert_eq!(CallingConvention::result_location(Kind::Void), Operand::Illegal);
    }
}
