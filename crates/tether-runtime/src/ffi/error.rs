//! FFI error taxonomy
//!
//! Every error is reported at the call site that triggered it. Nothing in the
//! interop layer guesses or coerces its way past a mismatch.

use crate::ffi::handle::TypeTag;
use crate::ffi::loader::LoadError;
use thiserror::Error;

/// Errors raised by handles, the marshaller, bound functions and callbacks
#[derive(Error, Debug)]
pub enum FfiError {
    /// Handle tag does not match the tag the operation expects
    #[error("Type mismatch: expected {expected}, got {found}")]
    TypeMismatch { expected: TypeTag, found: String },

    /// Absent handle where a non-nullable one is required
    #[error("Null handle passed for non-nullable {context}")]
    NullHandle { context: String },

    /// Wrong number of arguments for a bound function
    #[error("{function}: expected {required}..={max} arguments, got {got}")]
    ArityError {
        function: String,
        required: usize,
        max: usize,
        got: usize,
    },

    /// Host value cannot be represented in the declared native type
    #[error("Cannot convert {value} to {target}: {reason}")]
    ConversionError {
        value: String,
        target: String,
        reason: String,
    },

    /// Explicit release of an owned handle that was already released
    #[error("Handle {tag} at {address} was already released")]
    DoubleRelease { tag: TypeTag, address: String },

    /// Use of a handle after its native resource was released
    #[error("Use of released handle {tag}")]
    Released { tag: TypeTag },

    /// Use of a callback-scoped handle after its native call returned
    #[error("Handle {tag} was used after the native call that produced it returned")]
    ReentrancyViolation { tag: TypeTag },

    /// No descriptor for the named native type
    #[error("Unknown native type '{0}'")]
    UnknownType(String),

    /// No such field in the descriptor
    #[error("Type '{type_name}' has no field '{field}'")]
    UnknownField { type_name: String, field: String },

    /// Descriptor table entry is malformed
    #[error("Invalid descriptor for '{type_name}': {reason}")]
    InvalidDescriptor { type_name: String, reason: String },

    /// Owned handle of a type without a registered release function
    #[error("No release function registered for {0}")]
    NoReleaseFunction(TypeTag),

    /// Signature cannot be expressed through the binding layer
    #[error("Unsupported signature: {0}")]
    UnsupportedSignature(String),

    /// Host callback returned an error during a native call
    #[error("Callback failed: {0}")]
    Callback(Box<FfiError>),

    /// Host callback panicked during a native call
    #[error("Callback panicked: {0}")]
    CallbackPanic(String),

    /// Error raised by host code
    #[error("{0}")]
    Host(String),

    /// Library or symbol loading failed
    #[error(transparent)]
    Load(#[from] LoadError),
}

/// Result type for FFI operations
pub type FfiResult<T> = Result<T, FfiError>;

impl FfiError {
    pub(crate) fn conversion(
        value: impl std::fmt::Display,
        target: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        FfiError::ConversionError {
            value: value.to_string(),
            target: target.into(),
            reason: reason.into(),
        }
    }

    pub(crate) fn invalid_descriptor(type_name: impl Into<String>, reason: impl Into<String>) -> Self {
        FfiError::InvalidDescriptor {
            type_name: type_name.into(),
            reason: reason.into(),
        }
    }
}
