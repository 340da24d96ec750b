//! # Lungo Adapter
//!
//! Calling convention adapters for the Lungo VM. The VM runs two conventions, *optimized* and
//! *baseline*; a caller of one convention reaching a callee of the other goes through a small
//! thunk that reshuffles the arguments and frames. Adapter bodies depend only on the callee's
//! argument kind signature and are cached process-wide, one per signature per direction.

#![forbid(clippy::allow_attributes)]
#![allow(dead_code)]
#![deny(clippy::pedantic)]
#![deny(clippy::unwrap_in_result)]
#![deny(clippy::unwrap_used)]

mod error;
mod generator;
mod registry;
mod sig;

pub use error::{Error, Result};
pub use generator::{
    Adapter, AdapterGenerator, Direction, OutputSink, PROLOGUE_SIZE, StackCursor,
};
pub use registry::AdapterRegistry;
pub use sig::Sig;
