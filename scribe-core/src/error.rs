//! Errors raised by the OT algebra and the session.

use thiserror::Error;

/// Failure of an operation, transform, selection or session call.
///
/// Every variant is recoverable at the granularity of a single client event:
/// the event is dropped and committed state is left untouched.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OtError {
    /// A document or counterpart operation has a different length than the
    /// operation's base length.
    #[error("base length mismatch: expected {expected} units, got {actual}")]
    BaseLengthMismatch { expected: usize, actual: usize },

    /// The transform scan ended with one side exhausted before the other.
    #[error("transform failed: operations do not span the same document")]
    TransformFailed,

    /// Wire data could not be decoded into an operation or selection.
    #[error("unmarshal failed: {0}")]
    UnmarshalFailed(String),

    /// The client claimed a revision outside `[0, history length]`.
    #[error("invalid revision {revision} (current revision is {current})")]
    InvalidRevision { revision: i64, current: usize },

    /// The two sides of a call measure text in different units.
    #[error("text encoding mismatch: {left:?} vs {right:?}")]
    EncodingMismatch {
        left: crate::TextEncoding,
        right: crate::TextEncoding,
    },
}

impl OtError {
    pub(crate) fn unmarshal(reason: impl Into<String>) -> Self {
        OtError::UnmarshalFailed(reason.into())
    }
}
