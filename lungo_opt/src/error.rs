//! Error handling for the Lungo optimizing compiler.
//!
//! Every variant is a *bailout*: the compilation is abandoned, the caller falls back to the
//! baseline compiler or interpreter, and nothing of the failed compilation survives. Process
//! level invariant violations (label rebinding, straddling patches) are assertions, not errors.

/// Lungo compiler result type
///
/// This is a type alias for the standard library's [`Result`](core::result::Result) type with the
/// error type defaulting to [`Error`].
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Reasons a compilation can be abandoned.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An error occurred in the code layer (decoding, descriptors, buffer overflow)
    #[error(transparent)]
    CodeError(#[from] lungo_code::Error),
    /// An internal invariant did not hold while building the graph
    #[error("Invariant violation: {0}")]
    InvariantViolation(String),
    /// A register constraint could not be satisfied during LIR generation
    #[error("Register constraint unsatisfiable: {0}")]
    RegisterConstraint(String),
    /// An error occurred while trying to convert a number
    #[error("Number conversion error: {0}")]
    TryFromIntError(#[from] std::num::TryFromIntError),
    /// The instruction is not supported by the optimizing compiler
    #[error("Unsupported bytecode at index {bci}: {bytecode}")]
    UnsupportedBytecode { bci: u32, bytecode: String },
    /// The optimizing compiler does not support the given method
    #[error("Unsupported method: {0}")]
    UnsupportedMethod(String),
    /// A constant pool entry could not be resolved and patching is disabled
    #[error("Unresolved constant pool reference: {index}")]
    UnresolvedReference { index: u16 },
}
