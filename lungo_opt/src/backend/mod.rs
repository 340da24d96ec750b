//! The target-specific backend: frame layout, code emission and global stubs.

mod emitter;
mod frame_map;
mod stubs;

pub use emitter::{BASELINE_ENTRY_PAD, emit};
pub use frame_map::FrameMap;
pub use stubs::{CompiledStub, StubCache, StubKey};
