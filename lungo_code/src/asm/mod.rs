//! Code buffer and instruction encoding.

mod amd64;
mod code_buffer;

pub use amd64::{AluOp, Amd64Assembler, Mem, SseOp, ShiftKind};
pub use code_buffer::{CodeBuffer, Label, MAX_METHOD_CODE_SIZE, Relocation, RelocationKind};
