//! Foreign-call error types

use crate::value::{CallbackId, ForeignRef, ValueKind};
use thiserror::Error;

/// An exception raised inside the host runtime
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{message}")]
pub struct HostError {
    pub message: String,
}

impl HostError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Errors from marshalling values or calling across the boundary
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ForeignCallError {
    /// The reference was already disposed
    #[error("Double release of {0}")]
    DoubleRelease(ForeignRef),

    /// The reference was never issued
    #[error("Unknown reference: {0}")]
    UnknownReference(ForeignRef),

    /// No callable registered under this id
    #[error("Unknown callback: {0}")]
    UnknownCallback(CallbackId),

    /// A value had the wrong kind
    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: ValueKind,
    },

    /// The host raised an error; its message is preserved
    #[error("Host error in {method}: {message}")]
    Host { method: String, message: String },

    /// An embedded callable failed while the host was calling it
    #[error("Callback {callback} failed: {message}")]
    Callback {
        callback: CallbackId,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_error_preserved_in_message() {
        let err = ForeignCallError::Host {
            method: "digitalWrite".to_string(),
            message: "pin D99 not found".to_string(),
        };
        assert_eq!(err.to_string(), "Host error in digitalWrite: pin D99 not found");
    }

    #[test]
    fn test_type_mismatch_message() {
        let err = ForeignCallError::TypeMismatch {
            expected: "bool",
            found: ValueKind::String,
        };
        assert_eq!(err.to_string(), "Type mismatch: expected bool, found string");
    }
}
