//! Error types for the binding layer.
//!
//! Every failure that can happen while marshalling a call is a
//! [`BindError`]. Errors are threaded through `Result`s up to the native
//! adapter, which calls [`BindError::into_runtime`] exactly once to turn
//! them into the runtime's own error value.

use std::any::Any;

use hostbind_core::{RuntimeError, Status};
use thiserror::Error;

// ============================================================================
// Conversion Errors
// ============================================================================

/// A value had the right runtime type but could not become the native one.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConversionError {
    /// A number is outside the target integer's range.
    #[error("number {value} has no representation in {target}")]
    IntegerOverflow { value: String, target: &'static str },

    /// An element of a sequence or map failed to convert.
    #[error("bad element [{key}]: {expected} expected, got {actual}")]
    ElementMismatch {
        key: String,
        expected: &'static str,
        actual: &'static str,
    },

    /// A map had a key that is not a string.
    #[error("map keys must be strings, got {actual}")]
    NonStringKey { actual: &'static str },
}

// ============================================================================
// Bind Errors
// ============================================================================

/// Errors raised while binding a call or an exposed object.
#[derive(Debug, Error)]
pub enum BindError {
    /// The call frame held too few or too many arguments.
    #[error("wrong number of arguments: expected {}, got {got}", arity(.min, .max))]
    ArgumentCountMismatch { min: usize, max: usize, got: usize },

    /// An argument failed its type check.
    #[error("bad argument #{position}: {expected} expected, got {actual}")]
    ArgumentTypeMismatch {
        expected: &'static str,
        actual: &'static str,
        position: i32,
    },

    /// The native callable returned an error.
    #[error("{0:#}")]
    NativeException(anyhow::Error),

    /// The native callable panicked.
    #[error("unknown error")]
    UnknownNativeError,

    /// A host type was used before its class was registered.
    #[error("class '{0}' is not registered")]
    UnregisteredClass(String),

    /// A value is not a handle to the expected class.
    #[error("wrong handle type: {expected} expected, got {actual}")]
    WrongHandleType { expected: String, actual: String },

    /// A handle refers to an object that was already destroyed.
    #[error("attempt to use a destroyed {class} object")]
    DestroyedHandleAccess { class: String },

    /// A write to a field the class does not expose.
    #[error("no writable member '{name}' on {class}")]
    MissingField { name: String, class: String },

    /// A protected call reported a failure status.
    #[error("runtime protocol error: {}", .0.name())]
    RuntimeProtocolError(Status),

    #[error(transparent)]
    Conversion(#[from] ConversionError),

    /// The object is borrowed by an outer call in a conflicting way.
    #[error("{class} object is already borrowed")]
    AlreadyBorrowed { class: String },

    /// An optional parameter has no fallback of its type.
    #[error("no fallback registered for optional argument {position}")]
    MissingFallback { position: usize },

    /// The number of initial upvalues does not match the signature.
    #[error("signature needs {expected} upvalues, {got} supplied")]
    UpvalueCountMismatch { expected: usize, got: usize },

    /// A closure slot holds a value of the wrong type.
    #[error("bad upvalue #{position}: {expected} expected, got {actual}")]
    UpvalueTypeMismatch {
        expected: &'static str,
        actual: &'static str,
        position: usize,
    },

    /// A Rust type was exposed twice in one session.
    #[error("class '{0}' is already registered")]
    DuplicateClass(String),

    /// An error that already belongs to the runtime.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

fn arity(min: &usize, max: &usize) -> String {
    if min == max {
        min.to_string()
    } else {
        format!("{min} to {max}")
    }
}

impl BindError {
    /// Create an argument type mismatch error.
    pub fn argument_type(expected: &'static str, actual: &'static str, position: i32) -> Self {
        BindError::ArgumentTypeMismatch {
            expected,
            actual,
            position,
        }
    }

    /// Classify an error coming out of a native callable.
    ///
    /// Runtime errors and bind errors keep their identity; anything else is
    /// a native exception.
    pub fn from_native(err: anyhow::Error) -> Self {
        match err.downcast::<RuntimeError>() {
            Ok(runtime) => BindError::Runtime(runtime),
            Err(err) => match err.downcast::<BindError>() {
                Ok(bind) => bind,
                Err(err) => BindError::NativeException(err),
            },
        }
    }

    /// Build the error for a caught panic.
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string());
        tracing::warn!(panic = %message, "native callable panicked");
        BindError::UnknownNativeError
    }

    /// Convert into the runtime's error value.
    ///
    /// A runtime error passes through unmodified so its status survives.
    pub fn into_runtime(self) -> RuntimeError {
        match self {
            BindError::Runtime(err) => err,
            BindError::RuntimeProtocolError(status) => {
                RuntimeError::with_status(status, format!("runtime protocol error: {}", status.name()))
            }
            other => RuntimeError::runtime(other.to_string()),
        }
    }
}
