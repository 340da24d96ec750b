//! HIR value nodes.
//!
//! The HIR is a value graph: each node is identified by a dense [`NodeId`] into the compilation
//! arena, carries an immutable kind, a mutable flag set, an optional result operand assigned
//! once during LIR generation, and a `next` link placing it in its owning block's instruction
//! chain. The node variants form a closed set dispatched with exhaustive matches.

use crate::hir::block::BlockId;
use crate::hir::frame_state::StateId;
use bitflags::bitflags;
use lungo_code::{
    ArithOp, Barriers, ClassInfo, Condition, ConstValue, FieldInfo, InvokeKind, Kind, LogicOp,
    MethodInfo, ObjectHandle, Operand, ShiftOp,
};
use std::fmt;

/// Dense index of a value node in the compilation arena.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct NodeId(pub u32);

impl NodeId {
    #[must_use]
    pub fn index(self) -> usize {
        usize::try_from(self.0).unwrap_or(usize::MAX)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

bitflags! {
    /// Per-value flags.
    #[derive(Clone, Copy, Debug, Eq, PartialEq)]
    pub struct ValueFlags: u16 {
        /// The value is reachable and must be lowered
        const LIVE = 1 << 0;
        /// The value is known not to be null
        const NON_NULL = 1 << 1;
        /// A bounds check for this access has been proven redundant
        const NO_BOUNDS_CHECK = 1 << 2;
        /// Skip the GC read barrier for this access
        const NO_READ_BARRIER = 1 << 3;
        /// Skip the GC write barrier for this access
        const NO_WRITE_BARRIER = 1 << 4;
        /// Skip the array store check for this store
        const NO_STORE_CHECK = 1 << 5;
        /// The value is used as an operand by another instruction
        const LIVE_VALUE = 1 << 6;
        /// The instruction must stay at its program point
        const PINNED = 1 << 7;
    }
}

/// Which frame slot a phi merges.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PhiSlot {
    Local(u32),
    Stack(u32),
}

/// Recognized intrinsic methods.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IntrinsicId {
    Sin,
    Cos,
    Tan,
    Log,
    Log10,
    Sqrt,
    AbsDouble,
    AbsFloat,
    FloatToRawIntBits,
    IntBitsToFloat,
    DoubleToRawLongBits,
    LongBitsToDouble,
    NanoTime,
    CurrentTimeMillis,
    CompareAndSwapInt,
    CompareAndSwapLong,
    CompareAndSwapObject,
}

impl IntrinsicId {
    /// Return whether this intrinsic lowers to a runtime call rather than machine code.
    #[must_use]
    pub fn is_runtime_call(&self) -> bool {
        matches!(
            self,
            IntrinsicId::Sin
                | IntrinsicId::Cos
                | IntrinsicId::Tan
                | IntrinsicId::Log
                | IntrinsicId::Log10
                | IntrinsicId::NanoTime
                | IntrinsicId::CurrentTimeMillis
        )
    }
}

/// The operation a value node performs.
#[derive(Clone, Debug)]
pub enum ValueTag {
    Constant(ConstValue),
    /// An incoming method parameter
    Local { index: u32 },
    /// A merge of values at a control flow join
    Phi { slot: PhiSlot, inputs: Vec<NodeId> },
    ArithmeticOp {
        op: ArithOp,
        x: NodeId,
        y: NodeId,
    },
    ShiftOp {
        op: ShiftOp,
        x: NodeId,
        y: NodeId,
    },
    LogicOp {
        op: LogicOp,
        x: NodeId,
        y: NodeId,
    },
    Negate { x: NodeId },
    /// Conversion of `x` to the node's kind
    Convert { x: NodeId },
    /// Three-way comparison producing -1/0/1
    Compare {
        x: NodeId,
        y: NodeId,
        nan_greater: bool,
    },
    /// Conditional move
    IfOp {
        x: NodeId,
        condition: Condition,
        y: NodeId,
        true_value: NodeId,
        false_value: NodeId,
    },
    NullCheck { object: NodeId },
    Invoke {
        invoke: InvokeKind,
        method: MethodInfo,
        arguments: Vec<NodeId>,
    },
    LoadField {
        /// `None` for static fields
        object: Option<NodeId>,
        field: FieldInfo,
    },
    StoreField {
        object: Option<NodeId>,
        value: NodeId,
        field: FieldInfo,
    },
    LoadIndexed {
        array: NodeId,
        index: NodeId,
        element: Kind,
    },
    StoreIndexed {
        array: NodeId,
        index: NodeId,
        value: NodeId,
        element: Kind,
    },
    ArrayLength { array: NodeId },
    CheckCast {
        object: NodeId,
        class: ClassInfo,
    },
    InstanceOf {
        object: NodeId,
        class: ClassInfo,
    },
    MonitorEnter { object: NodeId, lock: u32 },
    MonitorExit { object: NodeId, lock: u32 },
    /// Address of a monitor slot in the frame
    MonitorAddress { lock: u32 },
    NewInstance { class: ClassInfo },
    NewTypeArray {
        length: NodeId,
        element: Kind,
        class: ClassInfo,
    },
    NewObjectArray {
        length: NodeId,
        class: ClassInfo,
    },
    NewMultiArray {
        class: ClassInfo,
        dimensions: Vec<NodeId>,
    },
    /// The incoming exception at a handler entry
    ExceptionObject,
    Intrinsic {
        intrinsic: IntrinsicId,
        arguments: Vec<NodeId>,
    },
    /// Raw load through a word pointer
    LoadPointer {
        pointer: NodeId,
        offset: i32,
    },
    /// Raw store through a word pointer
    StorePointer {
        pointer: NodeId,
        offset: i32,
        value: NodeId,
    },
    /// Unsafe load from an object at a dynamic offset
    UnsafeGetObject {
        object: NodeId,
        offset: NodeId,
        volatile: bool,
    },
    /// Unsafe store to an object at a dynamic offset
    UnsafePutObject {
        object: NodeId,
        offset: NodeId,
        value: NodeId,
        volatile: bool,
    },
    MemoryBarrier { barriers: Barriers },
    Safepoint,
    /// Reinterpret `x` as the node's kind without conversion
    UnsafeCast { x: NodeId },
    /// Raw frame memory of `size` bytes
    StackAllocate { size: i32 },
    /// The OSR buffer pointer at an on stack replacement entry
    OsrEntry,

    // Block ends. Successors live on the owning block.
    /// The start node; successors are the standard entry and optionally the OSR entry
    Base,
    Goto,
    If {
        x: NodeId,
        condition: Condition,
        y: NodeId,
    },
    /// Dense switch; key `i` maps to successor `i`, the last successor is the default
    TableSwitch { value: NodeId, low: i32 },
    /// Sparse switch; `keys[i]` maps to successor `i`, the last successor is the default
    LookupSwitch { value: NodeId, keys: Vec<i32> },
    Return { value: Option<NodeId> },
    Throw { exception: NodeId },
}

impl ValueTag {
    /// Return whether this tag ends a block.
    #[must_use]
    pub fn is_block_end(&self) -> bool {
        matches!(
            self,
            ValueTag::Base
                | ValueTag::Goto
                | ValueTag::If { .. }
                | ValueTag::TableSwitch { .. }
                | ValueTag::LookupSwitch { .. }
                | ValueTag::Return { .. }
                | ValueTag::Throw { .. }
        )
    }

    /// Return whether this operation can trap and needs a frame state for deoptimization.
    #[must_use]
    pub fn can_trap(&self) -> bool {
        matches!(
            self,
            ValueTag::NullCheck { .. }
                | ValueTag::Invoke { .. }
                | ValueTag::LoadField { .. }
                | ValueTag::StoreField { .. }
                | ValueTag::LoadIndexed { .. }
                | ValueTag::StoreIndexed { .. }
                | ValueTag::ArrayLength { .. }
                | ValueTag::CheckCast { .. }
                | ValueTag::MonitorEnter { .. }
                | ValueTag::MonitorExit { .. }
                | ValueTag::NewInstance { .. }
                | ValueTag::NewTypeArray { .. }
                | ValueTag::NewObjectArray { .. }
                | ValueTag::NewMultiArray { .. }
                | ValueTag::Throw { .. }
                | ValueTag::ArithmeticOp {
                    op: ArithOp::Div | ArithOp::Rem,
                    ..
                }
        )
    }
}

/// One HIR node.
#[derive(Clone, Debug)]
pub struct Value {
    pub id: NodeId,
    /// Kind of the produced value; `Void` for pure effects
    pub kind: Kind,
    pub flags: ValueFlags,
    /// Result location, assigned once during LIR generation
    pub operand: Option<Operand>,
    /// Next instruction in the owning block's chain
    pub next: Option<NodeId>,
    /// The block the node belongs to
    pub block: BlockId,
    /// Bytecode index the node originated from
    pub bci: u32,
    /// Frame state snapshot for trapping instructions, calls and safepoints
    pub state: Option<StateId>,
    /// Handlers covering this instruction, innermost first; `None` type catches everything
    pub handlers: Vec<(BlockId, Option<ObjectHandle>)>,
    pub tag: ValueTag,
}

impl Value {
    /// Return whether the node is a constant.
    #[must_use]
    pub fn as_constant(&self) -> Option<ConstValue> {
        match &self.tag {
            ValueTag::Constant(value) => Some(*value),
            _ => None,
        }
    }

    /// Return whether the node is a phi owned by `block`.
    #[must_use]
    pub fn is_phi_of(&self, block: BlockId) -> bool {
        matches!(&self.tag, ValueTag::Phi { .. }) && self.block == block
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_block_end_tags() {
        assert!(ValueTag::Goto.is_block_end());
        assert!(ValueTag::Base.is_block_end());
        assert!(ValueTag::Return { value: None }.is_block_end());
        assert!(!ValueTag::Safepoint.is_block_end());
        assert!(!ValueTag::Constant(ConstValue::Int(1)).is_block_end());
    }

    #[test]
    fn test_trap_tags() {
        assert!(
            ValueTag::ArithmeticOp {
                op: ArithOp::Div,
                x: NodeId(0),
                y: NodeId(1),
            }
            .can_trap()
        );
        assert!(
            !ValueTag::ArithmeticOp {
                op: ArithOp::Add,
                x: NodeId(0),
                y: NodeId(1),
            }
            .can_trap()
        );
        assert!(ValueTag::ArrayLength { array: NodeId(0) }.can_trap());
        assert!(!ValueTag::Safepoint.can_trap());
    }

    #[test]
    fn test_intrinsic_lowering_class() {
        assert!(IntrinsicId::Sin.is_runtime_call());
        assert!(!IntrinsicId::Sqrt.is_runtime_call());
        assert!(!IntrinsicId::CompareAndSwapInt.is_runtime_call());
    }
}
