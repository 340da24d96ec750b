//! The low-level IR: a target-abstract linear operation list over operands.

mod generator;
mod phi_resolver;
mod switch_range;

pub use generator::{LirFunction, generate_lir};
pub use phi_resolver::PhiResolver;
pub use switch_range::{SwitchRange, create_ranges};

use crate::hir::{BlockId, StateId};
use lungo_code::{
    Address, ArithOp, Barriers, Condition, Kind, LogicOp, ObjectHandle, Operand, RuntimeCall,
    ShiftOp, StubId, XirTemplate,
};
use std::sync::Arc;

/// Debug information attached to a trapping or stopping operation.
#[derive(Clone, Debug)]
pub struct LirDebugInfo {
    /// Frame state snapshot for deoptimization
    pub state: StateId,
    pub bci: u32,
    /// Handlers covering the operation, innermost first
    pub handlers: Vec<(BlockId, Option<ObjectHandle>)>,
}

/// An XIR snippet with every template variable bound to an operand.
#[derive(Clone, Debug)]
pub struct BoundXirSnippet {
    pub template: Arc<XirTemplate>,
    /// One operand per template input; destroyed inputs are already copies
    pub inputs: Vec<Operand>,
    /// One operand per template temp
    pub temps: Vec<Operand>,
    /// The result operand, `Illegal` when the template has none
    pub result: Operand,
}

/// One LIR operation.
#[derive(Clone, Debug)]
pub enum LirOp {
    /// Copy between any two locations of the same width; a raw bit copy
    Move { src: Operand, dest: Operand },
    Arith {
        op: ArithOp,
        kind: Kind,
        x: Operand,
        y: Operand,
        dest: Operand,
        info: Option<LirDebugInfo>,
    },
    Shift {
        op: ShiftOp,
        kind: Kind,
        value: Operand,
        amount: Operand,
        dest: Operand,
    },
    Logic {
        op: LogicOp,
        kind: Kind,
        x: Operand,
        y: Operand,
        dest: Operand,
    },
    Negate {
        kind: Kind,
        value: Operand,
        dest: Operand,
    },
    Convert {
        from: Kind,
        to: Kind,
        value: Operand,
        dest: Operand,
    },
    /// Three-way comparison producing -1/0/1
    CompareToInt {
        kind: Kind,
        x: Operand,
        y: Operand,
        nan_greater: bool,
        dest: Operand,
    },
    /// Compare, setting the condition flags for a following branch or conditional move
    Cmp {
        kind: Kind,
        x: Operand,
        y: Operand,
    },
    /// Conditional branch to another block; flags must be set
    Branch {
        condition: Condition,
        target: BlockId,
    },
    /// Branch to a label local to the current block's expansion
    BranchLocal {
        condition: Condition,
        label: u32,
    },
    /// Bind a local label
    LabelLocal { label: u32 },
    Jump { target: BlockId },
    /// Conditional move; flags must be set
    CondMove {
        condition: Condition,
        kind: Kind,
        true_value: Operand,
        false_value: Operand,
        dest: Operand,
    },
    Return { value: Option<Operand> },
    Load {
        address: Address,
        dest: Operand,
        info: Option<LirDebugInfo>,
    },
    Store {
        address: Address,
        value: Operand,
        info: Option<LirDebugInfo>,
    },
    /// Compare and branch to an out of line trap stub
    Trap {
        condition: Condition,
        kind: Kind,
        x: Operand,
        y: Operand,
        stub: StubId,
        info: LirDebugInfo,
    },
    /// Memory barrier; already filtered down to what the target requires
    Membar { barriers: Barriers },
    Safepoint { info: LirDebugInfo },
    DirectCall {
        method: u32,
        result: Operand,
        /// Outgoing stack slot indices holding object arguments
        pointer_slots: Vec<i32>,
        info: LirDebugInfo,
    },
    IndirectCall {
        address: Operand,
        method: u32,
        result: Operand,
        pointer_slots: Vec<i32>,
        info: LirDebugInfo,
    },
    CallRuntime {
        call: RuntimeCall,
        arguments: Vec<Operand>,
        result: Operand,
        info: Option<LirDebugInfo>,
    },
    /// Square root as a direct machine op
    Sqrt {
        double: bool,
        value: Operand,
        dest: Operand,
    },
    /// Absolute value of a float by clearing the sign bit
    FpAbs {
        double: bool,
        value: Operand,
        dest: Operand,
    },
    /// Atomic compare and swap; `expect` is constrained to the accumulator
    Cas {
        address: Address,
        expect: Operand,
        update: Operand,
        result: Operand,
        kind: Kind,
    },
    /// Expand a bound XIR template
    Xir {
        snippet: BoundXirSnippet,
        info: Option<LirDebugInfo>,
    },
    /// Materialize the OSR buffer pointer
    OsrEntry { dest: Operand },
    /// Address of a raw frame area
    StackAllocate { offset: i32, dest: Operand },
    /// Address of a monitor slot
    MonitorAddress { lock: u32, dest: Operand },
}
