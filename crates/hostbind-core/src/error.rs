//! Runtime status codes and the runtime's native error value.
//!
//! Every failure that crosses the runtime boundary is a [`RuntimeError`]:
//! a [`Status`] code plus a message. Native functions return it to raise a
//! script error, and protected calls turn it back into a status and an
//! error string on the stack.

use num_enum::{IntoPrimitive, TryFromPrimitive};
use thiserror::Error;

// ============================================================================
// Status
// ============================================================================

/// Outcome code of a protected call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(i32)]
pub enum Status {
    /// The call completed.
    Ok = 0,
    /// The callee yielded.
    Yield = 1,
    /// A runtime error was raised.
    Runtime = 2,
    /// Source text could not be compiled.
    Syntax = 3,
    /// An allocation or stack limit was hit.
    Memory = 4,
    /// An error occurred while running an error handler.
    Handler = 5,
}

impl Status {
    /// Lowercase name used in diagnostics.
    pub fn name(self) -> &'static str {
        match self {
            Status::Ok => "ok",
            Status::Yield => "yield",
            Status::Runtime => "runtime error",
            Status::Syntax => "syntax error",
            Status::Memory => "memory error",
            Status::Handler => "error handler error",
        }
    }

    /// Whether this status represents a failure.
    pub fn is_error(self) -> bool {
        !matches!(self, Status::Ok | Status::Yield)
    }
}

// ============================================================================
// RuntimeError
// ============================================================================

/// An error raised inside the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct RuntimeError {
    status: Status,
    message: String,
}

impl RuntimeError {
    /// A plain runtime error.
    pub fn runtime(message: impl Into<String>) -> Self {
        Self::with_status(Status::Runtime, message)
    }

    /// A resource exhaustion error.
    pub fn memory(message: impl Into<String>) -> Self {
        Self::with_status(Status::Memory, message)
    }

    /// An error with an explicit status code.
    pub fn with_status(status: Status, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    /// "attempt to {action} a {type} value"
    pub fn type_error(action: &str, type_name: &str) -> Self {
        Self::runtime(format!("attempt to {action} a {type_name} value"))
    }

    /// The status this error reports through a protected call.
    pub fn status(&self) -> Status {
        self.status
    }

    /// The error message.
    pub fn message(&self) -> &str {
        &self.message
    }
}
