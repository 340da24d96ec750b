//! # Lungo Opt
//!
//! The optimizing method compiler of the Lungo VM. Given a single method's bytecode and
//! metadata, the pipeline builds a block-structured value graph with explicit phis, lowers it
//! into a linear operation list over virtual operands, and emits machine code plus the side
//! tables the runtime needs to execute, unwind, garbage collect and patch the result. A failed
//! compilation bails out cleanly; the caller falls back to baseline execution.

#![forbid(clippy::allow_attributes)]
#![allow(dead_code)]
#![deny(clippy::pedantic)]
#![deny(clippy::unwrap_in_result)]
#![deny(clippy::unwrap_used)]

pub mod backend;
mod compilation;
mod error;
pub mod graph;
pub mod hir;
pub mod lir;
mod options;

pub use compilation::{Compiler, CompilerContext};
pub use error::{Error, Result};
pub use options::Options;
