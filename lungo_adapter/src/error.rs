//! Error handling for the adapter generator.

/// Lungo adapter result type
///
/// This is a type alias for the standard library's [`Result`](core::result::Result) type with the
/// error type defaulting to [`Error`].
pub type Result<T, E = Error> = core::result::Result<T, E>;

/// Errors that can occur while generating adapters.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An error occurred in the code layer
    #[error(transparent)]
    CodeError(#[from] lungo_code::Error),
    /// The callee has more arguments than the adapter frame can address
    #[error("Adapter frame overflow for signature with {slots} slots")]
    FrameOverflow { slots: u32 },
}
