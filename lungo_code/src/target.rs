//! Target architecture description.

use crate::register::{Register, RegisterSet};
use bitflags::bitflags;
use std::fmt;

bitflags! {
    /// Memory barrier requirements between pairs of access classes.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct Barriers: u8 {
        const LOAD_LOAD = 1 << 0;
        const LOAD_STORE = 1 << 1;
        const STORE_LOAD = 1 << 2;
        const STORE_STORE = 1 << 3;
    }
}

impl Barriers {
    /// Barriers required before a volatile store.
    #[must_use]
    pub fn pre_volatile_write() -> Barriers {
        Barriers::LOAD_STORE | Barriers::STORE_STORE
    }

    /// Barriers required after a volatile store.
    #[must_use]
    pub fn post_volatile_write() -> Barriers {
        Barriers::STORE_LOAD | Barriers::STORE_STORE
    }

    /// Barriers required after a volatile load.
    #[must_use]
    pub fn post_volatile_read() -> Barriers {
        Barriers::LOAD_LOAD | Barriers::LOAD_STORE
    }
}

/// Supported instruction set architectures.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Architecture {
    Amd64,
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Architecture::Amd64 => write!(f, "amd64"),
        }
    }
}

/// Byte ordering of the target.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ByteOrder {
    LittleEndian,
    BigEndian,
}

/// Immutable description of the compilation target.
///
/// Constructed once at startup and shared by every compilation.
#[derive(Clone, Debug)]
pub struct Target {
    pub arch: Architecture,
    /// Machine word size in bytes
    pub word_size: i32,
    pub byte_order: ByteOrder,
    /// Required alignment of the stack pointer at call sites
    pub stack_alignment: i32,
    /// Cache line size the patching code must not straddle
    pub cache_alignment: i32,
    /// The barrier classes this architecture actually reorders across
    pub required_barriers: Barriers,
    /// Size in bytes of one frame slot in the baseline calling convention
    pub baseline_slot_size: i32,
    /// Size in bytes of one frame slot in the optimized calling convention
    pub opt_slot_size: i32,
    /// Registers available for allocation
    pub allocatable: RegisterSet,
    /// Scratch register reserved for the compiler
    pub scratch: Register,
}

impl Target {
    /// Create the AMD64 target description.
    ///
    /// AMD64 has a strong memory model; only store-load reordering is possible, so only
    /// `STORE_LOAD` barriers materialize as fence instructions.
    #[must_use]
    pub fn amd64() -> Target {
        // RSP/RBP frame the stack, R15 holds the thread locals pointer, R11 is the
        // compiler scratch register; none of them are allocatable.
        let allocatable = RegisterSet::of(&[
            Register::RAX,
            Register::RCX,
            Register::RDX,
            Register::RBX,
            Register::RSI,
            Register::RDI,
            Register::R8,
            Register::R9,
            Register::R10,
            Register::R12,
            Register::R13,
            Register::R14,
            Register::XMM0,
            Register::XMM1,
            Register::XMM2,
            Register::XMM3,
            Register::XMM4,
            Register::XMM5,
            Register::XMM6,
            Register::XMM7,
        ]);
        Target {
            arch: Architecture::Amd64,
            word_size: 8,
            byte_order: ByteOrder::LittleEndian,
            stack_alignment: 16,
            cache_alignment: 32,
            required_barriers: Barriers::STORE_LOAD,
            baseline_slot_size: 8,
            opt_slot_size: 8,
            allocatable,
            scratch: Register::R11,
        }
    }

    /// Filter a requested barrier set down to the barriers this architecture needs.
    #[must_use]
    pub fn required_barriers(&self, requested: Barriers) -> Barriers {
        requested & self.required_barriers
    }

    /// Return `size` rounded up to the stack alignment.
    #[must_use]
    pub fn align_frame_size(&self, size: i32) -> i32 {
        let alignment = self.stack_alignment;
        (size + alignment - 1) & -alignment
    }

    /// Return whether a word of `length` bytes at absolute `address` stays within one cache line.
    #[must_use]
    pub fn is_within_cache_line(&self, address: u64, length: u64) -> bool {
        let alignment = u64::try_from(self.cache_alignment).unwrap_or(u64::MAX);
        address / alignment == (address + length - 1) / alignment
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_amd64_descriptor() {
        let target = Target::amd64();
        assert_eq!(Architecture::Amd64, target.arch);
        assert_eq!(8, target.word_size);
        assert_eq!(ByteOrder::LittleEndian, target.byte_order);
        assert_eq!(16, target.stack_alignment);
        assert!(!target.allocatable.contains(Register::RSP));
        assert!(!target.allocatable.contains(Register::RBP));
        assert!(!target.allocatable.contains(Register::R11));
    }

    #[test]
    fn test_required_barriers_filtering() {
        let target = Target::amd64();
        // Volatile reads need nothing on a strongly ordered machine
        assert!(
            target
                .required_barriers(Barriers::post_volatile_read())
                .is_empty()
        );
        // Volatile writes keep the store-load fence
        assert_eq!(
            Barriers::STORE_LOAD,
            target.required_barriers(Barriers::post_volatile_write())
        );
        assert!(
            target
                .required_barriers(Barriers::pre_volatile_write())
                .is_empty()
        );
    }

    #[test]
    fn test_align_frame_size() {
        let target = Target::amd64();
        assert_eq!(0, target.align_frame_size(0));
        assert_eq!(16, target.align_frame_size(1));
        assert_eq!(16, target.align_frame_size(16));
        assert_eq!(32, target.align_frame_size(17));
    }

    #[test]
    fn test_is_within_cache_line() {
        let target = Target::amd64();
        assert!(target.is_within_cache_line(0, 4));
        assert!(target.is_within_cache_line(28, 4));
        assert!(!target.is_within_cache_line(29, 4));
        assert!(!target.is_within_cache_line(30, 4));
        assert!(target.is_within_cache_line(32, 4));
    }
}
