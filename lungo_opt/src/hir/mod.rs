//! The high-level IR: a control flow graph of basic blocks whose instructions form a
//! value-based graph with explicit phi nodes.

mod block;
mod frame_state;
mod ir;
mod value;

pub use block::{Block, BlockFlags, BlockId};
pub use frame_state::{FrameState, StateId};
pub use ir::{Ir, IrHandler};
pub use value::{IntrinsicId, NodeId, PhiSlot, Value, ValueFlags, ValueTag};
