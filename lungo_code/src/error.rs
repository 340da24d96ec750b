//! Error handling for the Lungo compiler/runtime interface.

/// Lungo code result type
///
/// This is a type alias for the standard library's [`Result`](core::result::Result) type with the
/// error type defaulting to [`Error`].
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Errors that can occur while modelling methods, decoding bytecode or emitting machine code.
#[derive(Debug, PartialEq, thiserror::Error)]
pub enum Error {
    /// The code buffer would exceed its configured limit
    #[error("Code buffer overflow; requested {requested} bytes, limit {limit}")]
    CodeBufferOverflow { requested: usize, limit: usize },
    /// A constant pool index does not reference a valid entry
    #[error("Invalid constant index: {0}")]
    InvalidConstantIndex(u16),
    /// An invalid kind code was encountered in a descriptor
    #[error("Invalid kind code: {0}")]
    InvalidKindCode(char),
    /// A method descriptor could not be parsed
    #[error("Invalid method descriptor: {0}")]
    InvalidMethodDescriptor(String),
    /// An opcode byte is not a valid JVM instruction
    #[error("Invalid opcode {opcode} at bytecode index {bci}")]
    InvalidOpcode { bci: u32, opcode: u8 },
    /// The bytecode blob ended in the middle of an instruction
    #[error("Truncated bytecode at index {bci}")]
    TruncatedBytecode { bci: u32 },
    /// An error occurred while trying to convert a number
    #[error("Number conversion error: {0}")]
    TryFromIntError(#[from] std::num::TryFromIntError),
}
