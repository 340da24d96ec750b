//! JVM bytecode model and decoder.
//!
//! The decoder normalizes the instruction set: the `_0` .. `_3` register forms, `wide` prefixed
//! forms and the short constant forms all decode to the same variants, and relative branch
//! offsets are rewritten to absolute bytecode indices. The graph builder only ever sees the
//! normalized stream.
//!
//! See: <https://docs.oracle.com/javase/specs/jvms/se24/html/jvms-6.html>

use crate::Error::{self, InvalidOpcode, TruncatedBytecode};
use crate::error::Result;
use crate::kind::Kind;
use byteorder::{BigEndian, ByteOrder};
use std::fmt;

/// Binary arithmetic operations.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
}

/// Shift operations.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ShiftOp {
    Shl,
    Shr,
    Ushr,
}

/// Bitwise logic operations.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LogicOp {
    And,
    Or,
    Xor,
}

/// Branch conditions.
///
/// The unsigned variants never appear in bytecode; they are used by the compiler for bounds
/// checks and switch lowering.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Condition {
    Equal,
    NotEqual,
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Below,
    BelowEqual,
    Above,
    AboveEqual,
}

impl Condition {
    /// Return the negated condition.
    #[must_use]
    pub fn negate(&self) -> Condition {
        match self {
            Condition::Equal => Condition::NotEqual,
            Condition::NotEqual => Condition::Equal,
            Condition::Less => Condition::GreaterEqual,
            Condition::LessEqual => Condition::Greater,
            Condition::Greater => Condition::LessEqual,
            Condition::GreaterEqual => Condition::Less,
            Condition::Below => Condition::AboveEqual,
            Condition::BelowEqual => Condition::Above,
            Condition::Above => Condition::BelowEqual,
            Condition::AboveEqual => Condition::Below,
        }
    }

    /// Return the condition with the operand order reversed.
    #[must_use]
    pub fn mirror(&self) -> Condition {
        match self {
            Condition::Equal => Condition::Equal,
            Condition::NotEqual => Condition::NotEqual,
            Condition::Less => Condition::Greater,
            Condition::LessEqual => Condition::GreaterEqual,
            Condition::Greater => Condition::Less,
            Condition::GreaterEqual => Condition::LessEqual,
            Condition::Below => Condition::Above,
            Condition::BelowEqual => Condition::AboveEqual,
            Condition::Above => Condition::Below,
            Condition::AboveEqual => Condition::BelowEqual,
        }
    }

    /// Evaluate the condition for two integer values.
    #[must_use]
    pub fn evaluate(&self, x: i64, y: i64) -> bool {
        match self {
            Condition::Equal => x == y,
            Condition::NotEqual => x != y,
            Condition::Less => x < y,
            Condition::LessEqual => x <= y,
            Condition::Greater => x > y,
            Condition::GreaterEqual => x >= y,
            Condition::Below => x.cast_unsigned() < y.cast_unsigned(),
            Condition::BelowEqual => x.cast_unsigned() <= y.cast_unsigned(),
            Condition::Above => x.cast_unsigned() > y.cast_unsigned(),
            Condition::AboveEqual => x.cast_unsigned() >= y.cast_unsigned(),
        }
    }
}

/// The kind of an invocation site.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum InvokeKind {
    Virtual,
    Special,
    Static,
    Interface,
    Dynamic,
}

/// A normalized JVM instruction.
#[derive(Clone, Debug, PartialEq)]
pub enum Bytecode {
    Nop,
    AconstNull,
    Iconst(i32),
    Lconst(i64),
    Fconst(f32),
    Dconst(f64),
    /// Load of a category-1 constant pool entry (int, float, string, class)
    Ldc(u16),
    /// Load of a category-2 constant pool entry (long, double)
    Ldc2(u16),
    /// Local variable load; the kind is the stack kind of the slot
    Load(Kind, u16),
    /// Local variable store
    Store(Kind, u16),
    /// Array element load; the kind is the element kind
    ArrayLoad(Kind),
    /// Array element store
    ArrayStore(Kind),
    Pop,
    Pop2,
    Dup,
    DupX1,
    DupX2,
    Dup2,
    Dup2X1,
    Dup2X2,
    Swap,
    Arith(ArithOp, Kind),
    Neg(Kind),
    Shift(ShiftOp, Kind),
    Logic(LogicOp, Kind),
    Iinc(u16, i32),
    /// Conversion between stack kinds; sub-int targets narrow then re-widen
    Convert(Kind, Kind),
    /// Three-way comparison; `nan_greater` selects the `g` variant for floats
    Compare { kind: Kind, nan_greater: bool },
    /// Compare the top of stack against zero and branch to an absolute bytecode index
    If(Condition, u32),
    /// Compare the two top ints and branch
    IfIcmp(Condition, u32),
    /// Compare the two top references and branch; only `Equal`/`NotEqual`
    IfAcmp(Condition, u32),
    /// Branch if the top reference is (not) null
    IfNull { is_null: bool, target: u32 },
    Goto(u32),
    Jsr(u32),
    Ret(u16),
    TableSwitch {
        default: u32,
        low: i32,
        targets: Vec<u32>,
    },
    LookupSwitch {
        default: u32,
        pairs: Vec<(i32, u32)>,
    },
    /// Return; the kind is the stack kind of the result, `Void` for `return`
    Return(Kind),
    GetStatic(u16),
    PutStatic(u16),
    GetField(u16),
    PutField(u16),
    Invoke(InvokeKind, u16),
    New(u16),
    /// Primitive array allocation; the kind is the element kind
    NewArray(Kind),
    ANewArray(u16),
    MultiANewArray(u16, u8),
    ArrayLength,
    Athrow,
    CheckCast(u16),
    InstanceOf(u16),
    MonitorEnter,
    MonitorExit,
    Breakpoint,
}

impl Bytecode {
    /// Return whether this instruction never falls through to the next bytecode index.
    #[must_use]
    pub fn ends_block(&self) -> bool {
        matches!(
            self,
            Bytecode::Goto(..)
                | Bytecode::Jsr(..)
                | Bytecode::Ret(..)
                | Bytecode::TableSwitch { .. }
                | Bytecode::LookupSwitch { .. }
                | Bytecode::Return(..)
                | Bytecode::Athrow
        )
    }

    /// Return whether this instruction is a conditional or unconditional branch.
    #[must_use]
    pub fn is_branch(&self) -> bool {
        self.ends_block()
            || matches!(
                self,
                Bytecode::If(..)
                    | Bytecode::IfIcmp(..)
                    | Bytecode::IfAcmp(..)
                    | Bytecode::IfNull { .. }
            )
    }

    /// Return the absolute branch targets of this instruction, not including fall through.
    #[must_use]
    pub fn branch_targets(&self) -> Vec<u32> {
        match self {
            Bytecode::If(_, target)
            | Bytecode::IfIcmp(_, target)
            | Bytecode::IfAcmp(_, target)
            | Bytecode::IfNull { target, .. }
            | Bytecode::Goto(target)
            | Bytecode::Jsr(target) => vec![*target],
            Bytecode::TableSwitch {
                default, targets, ..
            } => {
                let mut all = vec![*default];
                all.extend_from_slice(targets);
                all
            }
            Bytecode::LookupSwitch { default, pairs } => {
                let mut all = vec![*default];
                all.extend(pairs.iter().map(|(_, target)| *target));
                all
            }
            _ => Vec::new(),
        }
    }

    /// Return whether this instruction can raise an exception at runtime.
    #[must_use]
    pub fn can_trap(&self) -> bool {
        matches!(
            self,
            Bytecode::ArrayLoad(..)
                | Bytecode::ArrayStore(..)
                | Bytecode::Arith(ArithOp::Div | ArithOp::Rem, Kind::Int | Kind::Long)
                | Bytecode::GetStatic(..)
                | Bytecode::PutStatic(..)
                | Bytecode::GetField(..)
                | Bytecode::PutField(..)
                | Bytecode::Invoke(..)
                | Bytecode::New(..)
                | Bytecode::NewArray(..)
                | Bytecode::ANewArray(..)
                | Bytecode::MultiANewArray(..)
                | Bytecode::ArrayLength
                | Bytecode::Athrow
                | Bytecode::CheckCast(..)
                | Bytecode::MonitorEnter
                | Bytecode::MonitorExit
                | Bytecode::Ldc(..)
        )
    }
}

impl fmt::Display for Bytecode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?}")
    }
}

/// Cursor over a raw bytecode blob.
struct Reader<'a> {
    code: &'a [u8],
    position: usize,
}

impl<'a> Reader<'a> {
    fn new(code: &'a [u8]) -> Reader<'a> {
        Reader { code, position: 0 }
    }

    fn bci(&self) -> u32 {
        u32::try_from(self.position).unwrap_or(u32::MAX)
    }

    fn take(&mut self, length: usize) -> Result<&'a [u8]> {
        let end = self.position.checked_add(length);
        match end {
            Some(end) if end <= self.code.len() => {
                let bytes = &self.code[self.position..end];
                self.position = end;
                Ok(bytes)
            }
            _ => Err(TruncatedBytecode { bci: self.bci() }),
        }
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u16(&mut self) -> Result<u16> {
        Ok(BigEndian::read_u16(self.take(2)?))
    }

    fn read_i16(&mut self) -> Result<i16> {
        Ok(BigEndian::read_i16(self.take(2)?))
    }

    fn read_i32(&mut self) -> Result<i32> {
        Ok(BigEndian::read_i32(self.take(4)?))
    }

    fn align4(&mut self) -> Result<()> {
        while self.position % 4 != 0 {
            self.take(1)?;
        }
        Ok(())
    }
}

/// Convert a relative branch offset to an absolute bytecode index.
fn target(bci: u32, offset: i32) -> Result<u32> {
    let absolute = i64::from(bci) + i64::from(offset);
    u32::try_from(absolute).map_err(Error::from)
}

/// Decode a raw bytecode blob into normalized instructions addressed by bytecode index.
///
/// # Errors
///
/// - if an opcode byte is not a valid JVM instruction
/// - if the blob ends in the middle of an instruction
/// - if a branch target is out of range
#[expect(clippy::too_many_lines)]
pub fn decode(code: &[u8]) -> Result<Vec<(u32, Bytecode)>> {
    let mut reader = Reader::new(code);
    let mut instructions = Vec::new();

    while reader.position < code.len() {
        let bci = reader.bci();
        let opcode = reader.read_u8()?;
        let bytecode = match opcode {
            0x00 => Bytecode::Nop,
            0x01 => Bytecode::AconstNull,
            0x02..=0x08 => Bytecode::Iconst(i32::from(opcode) - 0x03),
            0x09 | 0x0a => Bytecode::Lconst(i64::from(opcode) - 0x09),
            0x0b..=0x0d => Bytecode::Fconst(f32::from(opcode - 0x0b)),
            0x0e | 0x0f => Bytecode::Dconst(f64::from(opcode - 0x0e)),
            0x10 => Bytecode::Iconst(i32::from(reader.read_u8()?.cast_signed())),
            0x11 => Bytecode::Iconst(i32::from(reader.read_i16()?)),
            0x12 => Bytecode::Ldc(u16::from(reader.read_u8()?)),
            0x13 => Bytecode::Ldc(reader.read_u16()?),
            0x14 => Bytecode::Ldc2(reader.read_u16()?),
            0x15 => Bytecode::Load(Kind::Int, u16::from(reader.read_u8()?)),
            0x16 => Bytecode::Load(Kind::Long, u16::from(reader.read_u8()?)),
            0x17 => Bytecode::Load(Kind::Float, u16::from(reader.read_u8()?)),
            0x18 => Bytecode::Load(Kind::Double, u16::from(reader.read_u8()?)),
            0x19 => Bytecode::Load(Kind::Object, u16::from(reader.read_u8()?)),
            0x1a..=0x1d => Bytecode::Load(Kind::Int, u16::from(opcode - 0x1a)),
            0x1e..=0x21 => Bytecode::Load(Kind::Long, u16::from(opcode - 0x1e)),
            0x22..=0x25 => Bytecode::Load(Kind::Float, u16::from(opcode - 0x22)),
            0x26..=0x29 => Bytecode::Load(Kind::Double, u16::from(opcode - 0x26)),
            0x2a..=0x2d => Bytecode::Load(Kind::Object, u16::from(opcode - 0x2a)),
            0x2e => Bytecode::ArrayLoad(Kind::Int),
            0x2f => Bytecode::ArrayLoad(Kind::Long),
            0x30 => Bytecode::ArrayLoad(Kind::Float),
            0x31 => Bytecode::ArrayLoad(Kind::Double),
            0x32 => Bytecode::ArrayLoad(Kind::Object),
            0x33 => Bytecode::ArrayLoad(Kind::Byte),
            0x34 => Bytecode::ArrayLoad(Kind::Char),
            0x35 => Bytecode::ArrayLoad(Kind::Short),
            0x36 => Bytecode::Store(Kind::Int, u16::from(reader.read_u8()?)),
            0x37 => Bytecode::Store(Kind::Long, u16::from(reader.read_u8()?)),
            0x38 => Bytecode::Store(Kind::Float, u16::from(reader.read_u8()?)),
            0x39 => Bytecode::Store(Kind::Double, u16::from(reader.read_u8()?)),
            0x3a => Bytecode::Store(Kind::Object, u16::from(reader.read_u8()?)),
            0x3b..=0x3e => Bytecode::Store(Kind::Int, u16::from(opcode - 0x3b)),
            0x3f..=0x42 => Bytecode::Store(Kind::Long, u16::from(opcode - 0x3f)),
            0x43..=0x46 => Bytecode::Store(Kind::Float, u16::from(opcode - 0x43)),
            0x47..=0x4a => Bytecode::Store(Kind::Double, u16::from(opcode - 0x47)),
            0x4b..=0x4e => Bytecode::Store(Kind::Object, u16::from(opcode - 0x4b)),
            0x4f => Bytecode::ArrayStore(Kind::Int),
            0x50 => Bytecode::ArrayStore(Kind::Long),
            0x51 => Bytecode::ArrayStore(Kind::Float),
            0x52 => Bytecode::ArrayStore(Kind::Double),
            0x53 => Bytecode::ArrayStore(Kind::Object),
            0x54 => Bytecode::ArrayStore(Kind::Byte),
            0x55 => Bytecode::ArrayStore(Kind::Char),
            0x56 => Bytecode::ArrayStore(Kind::Short),
            0x57 => Bytecode::Pop,
            0x58 => Bytecode::Pop2,
            0x59 => Bytecode::Dup,
            0x5a => Bytecode::DupX1,
            0x5b => Bytecode::DupX2,
            0x5c => Bytecode::Dup2,
            0x5d => Bytecode::Dup2X1,
            0x5e => Bytecode::Dup2X2,
            0x5f => Bytecode::Swap,
            0x60..=0x73 => {
                let op = match (opcode - 0x60) / 4 {
                    0 => ArithOp::Add,
                    1 => ArithOp::Sub,
                    2 => ArithOp::Mul,
                    3 => ArithOp::Div,
                    _ => ArithOp::Rem,
                };
                Bytecode::Arith(op, arith_kind(opcode - 0x60))
            }
            0x74..=0x77 => Bytecode::Neg(arith_kind(opcode - 0x74)),
            0x78 => Bytecode::Shift(ShiftOp::Shl, Kind::Int),
            0x79 => Bytecode::Shift(ShiftOp::Shl, Kind::Long),
            0x7a => Bytecode::Shift(ShiftOp::Shr, Kind::Int),
            0x7b => Bytecode::Shift(ShiftOp::Shr, Kind::Long),
            0x7c => Bytecode::Shift(ShiftOp::Ushr, Kind::Int),
            0x7d => Bytecode::Shift(ShiftOp::Ushr, Kind::Long),
            0x7e => Bytecode::Logic(LogicOp::And, Kind::Int),
            0x7f => Bytecode::Logic(LogicOp::And, Kind::Long),
            0x80 => Bytecode::Logic(LogicOp::Or, Kind::Int),
            0x81 => Bytecode::Logic(LogicOp::Or, Kind::Long),
            0x82 => Bytecode::Logic(LogicOp::Xor, Kind::Int),
            0x83 => Bytecode::Logic(LogicOp::Xor, Kind::Long),
            0x84 => {
                let index = u16::from(reader.read_u8()?);
                let constant = i32::from(reader.read_u8()?.cast_signed());
                Bytecode::Iinc(index, constant)
            }
            0x85 => Bytecode::Convert(Kind::Int, Kind::Long),
            0x86 => Bytecode::Convert(Kind::Int, Kind::Float),
            0x87 => Bytecode::Convert(Kind::Int, Kind::Double),
            0x88 => Bytecode::Convert(Kind::Long, Kind::Int),
            0x89 => Bytecode::Convert(Kind::Long, Kind::Float),
            0x8a => Bytecode::Convert(Kind::Long, Kind::Double),
            0x8b => Bytecode::Convert(Kind::Float, Kind::Int),
            0x8c => Bytecode::Convert(Kind::Float, Kind::Long),
            0x8d => Bytecode::Convert(Kind::Float, Kind::Double),
            0x8e => Bytecode::Convert(Kind::Double, Kind::Int),
            0x8f => Bytecode::Convert(Kind::Double, Kind::Long),
            0x90 => Bytecode::Convert(Kind::Double, Kind::Float),
            0x91 => Bytecode::Convert(Kind::Int, Kind::Byte),
            0x92 => Bytecode::Convert(Kind::Int, Kind::Char),
            0x93 => Bytecode::Convert(Kind::Int, Kind::Short),
            0x94 => Bytecode::Compare {
                kind: Kind::Long,
                nan_greater: false,
            },
            0x95 => Bytecode::Compare {
                kind: Kind::Float,
                nan_greater: false,
            },
            0x96 => Bytecode::Compare {
                kind: Kind::Float,
                nan_greater: true,
            },
            0x97 => Bytecode::Compare {
                kind: Kind::Double,
                nan_greater: false,
            },
            0x98 => Bytecode::Compare {
                kind: Kind::Double,
                nan_greater: true,
            },
            0x99..=0x9e => {
                let offset = i32::from(reader.read_i16()?);
                Bytecode::If(if_condition(opcode - 0x99), target(bci, offset)?)
            }
            0x9f..=0xa4 => {
                let offset = i32::from(reader.read_i16()?);
                Bytecode::IfIcmp(if_condition(opcode - 0x9f), target(bci, offset)?)
            }
            0xa5 => {
                let offset = i32::from(reader.read_i16()?);
                Bytecode::IfAcmp(Condition::Equal, target(bci, offset)?)
            }
            0xa6 => {
                let offset = i32::from(reader.read_i16()?);
                Bytecode::IfAcmp(Condition::NotEqual, target(bci, offset)?)
            }
            0xa7 => {
                let offset = i32::from(reader.read_i16()?);
                Bytecode::Goto(target(bci, offset)?)
            }
            0xa8 => {
                let offset = i32::from(reader.read_i16()?);
                Bytecode::Jsr(target(bci, offset)?)
            }
            0xa9 => Bytecode::Ret(u16::from(reader.read_u8()?)),
            0xaa => {
                reader.align4()?;
                let default = target(bci, reader.read_i32()?)?;
                let low = reader.read_i32()?;
                let high = reader.read_i32()?;
                let count = usize::try_from(i64::from(high) - i64::from(low) + 1)
                    .map_err(|_| TruncatedBytecode { bci })?;
                let mut targets = Vec::with_capacity(count);
                for _ in 0..count {
                    targets.push(target(bci, reader.read_i32()?)?);
                }
                Bytecode::TableSwitch {
                    default,
                    low,
                    targets,
                }
            }
            0xab => {
                reader.align4()?;
                let default = target(bci, reader.read_i32()?)?;
                let count = usize::try_from(reader.read_i32()?)
                    .map_err(|_| TruncatedBytecode { bci })?;
                let mut pairs = Vec::with_capacity(count);
                for _ in 0..count {
                    let key = reader.read_i32()?;
                    pairs.push((key, target(bci, reader.read_i32()?)?));
                }
                Bytecode::LookupSwitch { default, pairs }
            }
            0xac => Bytecode::Return(Kind::Int),
            0xad => Bytecode::Return(Kind::Long),
            0xae => Bytecode::Return(Kind::Float),
            0xaf => Bytecode::Return(Kind::Double),
            0xb0 => Bytecode::Return(Kind::Object),
            0xb1 => Bytecode::Return(Kind::Void),
            0xb2 => Bytecode::GetStatic(reader.read_u16()?),
            0xb3 => Bytecode::PutStatic(reader.read_u16()?),
            0xb4 => Bytecode::GetField(reader.read_u16()?),
            0xb5 => Bytecode::PutField(reader.read_u16()?),
            0xb6 => Bytecode::Invoke(InvokeKind::Virtual, reader.read_u16()?),
            0xb7 => Bytecode::Invoke(InvokeKind::Special, reader.read_u16()?),
            0xb8 => Bytecode::Invoke(InvokeKind::Static, reader.read_u16()?),
            0xb9 => {
                let index = reader.read_u16()?;
                let _count = reader.read_u8()?;
                let _zero = reader.read_u8()?;
                Bytecode::Invoke(InvokeKind::Interface, index)
            }
            0xba => {
                let index = reader.read_u16()?;
                let _zero = reader.read_u16()?;
                Bytecode::Invoke(InvokeKind::Dynamic, index)
            }
            0xbb => Bytecode::New(reader.read_u16()?),
            0xbc => {
                let element = match reader.read_u8()? {
                    4 => Kind::Boolean,
                    5 => Kind::Char,
                    6 => Kind::Float,
                    7 => Kind::Double,
                    8 => Kind::Byte,
                    9 => Kind::Short,
                    10 => Kind::Int,
                    11 => Kind::Long,
                    code => {
                        return Err(InvalidOpcode { bci, opcode: code });
                    }
                };
                Bytecode::NewArray(element)
            }
            0xbd => Bytecode::ANewArray(reader.read_u16()?),
            0xbe => Bytecode::ArrayLength,
            0xbf => Bytecode::Athrow,
            0xc0 => Bytecode::CheckCast(reader.read_u16()?),
            0xc1 => Bytecode::InstanceOf(reader.read_u16()?),
            0xc2 => Bytecode::MonitorEnter,
            0xc3 => Bytecode::MonitorExit,
            0xc4 => decode_wide(&mut reader, bci)?,
            0xc5 => {
                let index = reader.read_u16()?;
                let dimensions = reader.read_u8()?;
                Bytecode::MultiANewArray(index, dimensions)
            }
            0xc6 => {
                let offset = i32::from(reader.read_i16()?);
                Bytecode::IfNull {
                    is_null: true,
                    target: target(bci, offset)?,
                }
            }
            0xc7 => {
                let offset = i32::from(reader.read_i16()?);
                Bytecode::IfNull {
                    is_null: false,
                    target: target(bci, offset)?,
                }
            }
            0xc8 => {
                let offset = reader.read_i32()?;
                Bytecode::Goto(target(bci, offset)?)
            }
            0xc9 => {
                let offset = reader.read_i32()?;
                Bytecode::Jsr(target(bci, offset)?)
            }
            0xca => Bytecode::Breakpoint,
            _ => return Err(InvalidOpcode { bci, opcode }),
        };
        instructions.push((bci, bytecode));
    }

    Ok(instructions)
}

/// Decode the instruction following a `wide` prefix.
fn decode_wide(reader: &mut Reader<'_>, bci: u32) -> Result<Bytecode> {
    let opcode = reader.read_u8()?;
    let bytecode = match opcode {
        0x15 => Bytecode::Load(Kind::Int, reader.read_u16()?),
        0x16 => Bytecode::Load(Kind::Long, reader.read_u16()?),
        0x17 => Bytecode::Load(Kind::Float, reader.read_u16()?),
        0x18 => Bytecode::Load(Kind::Double, reader.read_u16()?),
        0x19 => Bytecode::Load(Kind::Object, reader.read_u16()?),
        0x36 => Bytecode::Store(Kind::Int, reader.read_u16()?),
        0x37 => Bytecode::Store(Kind::Long, reader.read_u16()?),
        0x38 => Bytecode::Store(Kind::Float, reader.read_u16()?),
        0x39 => Bytecode::Store(Kind::Double, reader.read_u16()?),
        0x3a => Bytecode::Store(Kind::Object, reader.read_u16()?),
        0x84 => {
            let index = reader.read_u16()?;
            let constant = i32::from(reader.read_i16()?);
            Bytecode::Iinc(index, constant)
        }
        0xa9 => Bytecode::Ret(reader.read_u16()?),
        _ => return Err(InvalidOpcode { bci, opcode }),
    };
    Ok(bytecode)
}

/// Map an opcode offset in an int/long/float/double group to its kind.
fn arith_kind(offset: u8) -> Kind {
    match offset % 4 {
        0 => Kind::Int,
        1 => Kind::Long,
        2 => Kind::Float,
        _ => Kind::Double,
    }
}

/// Map an opcode offset in an eq/ne/lt/ge/gt/le group to its condition.
fn if_condition(offset: u8) -> Condition {
    match offset {
        0 => Condition::Equal,
        1 => Condition::NotEqual,
        2 => Condition::Less,
        3 => Condition::GreaterEqual,
        4 => Condition::Greater,
        _ => Condition::LessEqual,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_decode_constants() -> Result<()> {
        // iconst_0, iconst_5, bipush 42, sipush 1000
        let code = [0x03, 0x08, 0x10, 42, 0x11, 0x03, 0xe8];
        let instructions = decode(&code)?;
        assert_eq!(
            vec![
                (0, Bytecode::Iconst(0)),
                (1, Bytecode::Iconst(5)),
                (2, Bytecode::Iconst(42)),
                (4, Bytecode::Iconst(1000)),
            ],
            instructions
        );
        Ok(())
    }

    #[test]
    fn test_decode_loads_and_stores() -> Result<()> {
        // iload_0, lload 4, wide fload 300, astore_2
        let code = [0x1a, 0x16, 0x04, 0xc4, 0x17, 0x01, 0x2c, 0x4d];
        let instructions = decode(&code)?;
        assert_eq!(
            vec![
                (0, Bytecode::Load(Kind::Int, 0)),
                (1, Bytecode::Load(Kind::Long, 4)),
                (3, Bytecode::Load(Kind::Float, 300)),
                (7, Bytecode::Store(Kind::Object, 2)),
            ],
            instructions
        );
        Ok(())
    }

    #[test]
    fn test_decode_branch_targets_are_absolute() -> Result<()> {
        // 0: iload_0, 1: ifeq +5 (-> 6), 4: goto -4 (-> 0)
        let code = [0x1a, 0x99, 0x00, 0x05, 0xa7, 0xff, 0xfc];
        let instructions = decode(&code)?;
        assert_eq!(
            vec![
                (0, Bytecode::Load(Kind::Int, 0)),
                (1, Bytecode::If(Condition::Equal, 6)),
                (4, Bytecode::Goto(0)),
            ],
            instructions
        );
        Ok(())
    }

    #[test]
    fn test_decode_tableswitch() -> Result<()> {
        // 0: iload_0, 1: tableswitch (pad to 4) default=+27 low=0 high=1 offsets +31,+35
        let mut code = vec![0x1a, 0xaa, 0, 0];
        code.extend_from_slice(&27i32.to_be_bytes());
        code.extend_from_slice(&0i32.to_be_bytes());
        code.extend_from_slice(&1i32.to_be_bytes());
        code.extend_from_slice(&31i32.to_be_bytes());
        code.extend_from_slice(&35i32.to_be_bytes());
        let instructions = decode(&code)?;
        assert_eq!(2, instructions.len());
        assert_eq!(
            (
                1,
                Bytecode::TableSwitch {
                    default: 28,
                    low: 0,
                    targets: vec![32, 36],
                }
            ),
            instructions[1]
        );
        Ok(())
    }

    #[test]
    fn test_decode_lookupswitch() -> Result<()> {
        // 0: lookupswitch default=+20, pairs {0: +24, 5: +28}
        let mut code = vec![0xab, 0, 0, 0];
        code.extend_from_slice(&20i32.to_be_bytes());
        code.extend_from_slice(&2i32.to_be_bytes());
        code.extend_from_slice(&0i32.to_be_bytes());
        code.extend_from_slice(&24i32.to_be_bytes());
        code.extend_from_slice(&5i32.to_be_bytes());
        code.extend_from_slice(&28i32.to_be_bytes());
        let instructions = decode(&code)?;
        assert_eq!(
            vec![(
                0,
                Bytecode::LookupSwitch {
                    default: 20,
                    pairs: vec![(0, 24), (5, 28)],
                }
            )],
            instructions
        );
        Ok(())
    }

    #[test]
    fn test_decode_invalid_opcode() {
        let code = [0xfe];
        assert_eq!(
            Err(InvalidOpcode {
                bci: 0,
                opcode: 0xfe
            }),
            decode(&code)
        );
    }

    #[test]
    fn test_decode_truncated() {
        let code = [0x10];
        assert_eq!(Err(TruncatedBytecode { bci: 1 }), decode(&code));
    }

    #[test]
    fn test_condition_negate_and_mirror() {
        assert_eq!(Condition::NotEqual, Condition::Equal.negate());
        assert_eq!(Condition::GreaterEqual, Condition::Less.negate());
        assert_eq!(Condition::Greater, Condition::Less.mirror());
        assert_eq!(Condition::Equal, Condition::Equal.mirror());
        assert_eq!(Condition::Above, Condition::Below.mirror());
    }

    #[test]
    fn test_condition_evaluate() {
        assert!(Condition::Less.evaluate(1, 2));
        assert!(!Condition::Less.evaluate(-1, -2));
        assert!(Condition::Below.evaluate(1, -1));
        assert!(Condition::AboveEqual.evaluate(-1, 1));
    }

    #[test]
    fn test_can_trap() {
        assert!(Bytecode::Arith(ArithOp::Div, Kind::Int).can_trap());
        assert!(!Bytecode::Arith(ArithOp::Div, Kind::Float).can_trap());
        assert!(Bytecode::ArrayLength.can_trap());
        assert!(!Bytecode::Iconst(0).can_trap());
    }

    #[test]
    fn test_ends_block() {
        assert!(Bytecode::Return(Kind::Void).ends_block());
        assert!(Bytecode::Goto(0).ends_block());
        assert!(Bytecode::Athrow.ends_block());
        assert!(!Bytecode::If(Condition::Equal, 0).ends_block());
        assert!(Bytecode::If(Condition::Equal, 0).is_branch());
    }
}
