//! Error taxonomy for the annotation runtime.

use thiserror::Error;

/// Errors returned by annotation-engine operations.
///
/// All fallible operations on [`crate::engine::Engine`] return this type
/// instead of panicking; latency-sensitive callers are expected to check the
/// variant only when they care, and to otherwise treat any non-success as a
/// no-op.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AnnotationError {
    /// Invalid argument: unknown attribute, `end` of an attribute that was
    /// never begun, or a buffer whose size does not match an exact-capacity
    /// contract.
    #[error("invalid argument: {0}")]
    Invalid(String),

    /// A lock could not be acquired on a non-blocking path.
    ///
    /// Reserved for a future non-blocking lock acquisition path; the
    /// current lock implementations only expose blocking acquires, so this
    /// variant is never produced today.
    #[error("lock busy")]
    Busy,

    /// The attribute registry's id space is exhausted.
    #[error("attribute id space exhausted")]
    OutOfIds,
}

/// Result alias used throughout this crate.
pub type Result<T> = std::result::Result<T, AnnotationError>;
