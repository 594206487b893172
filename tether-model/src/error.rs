//! Error types for asynchronous remote operations
//!
//! Remote and transport failures always surface as an `OperationError`:
//! a machine-readable kind plus a human-readable message. They are carried
//! inside failed operations rather than thrown across the async boundary.
//! Local usage errors (programmer misuse) live in the crates that detect
//! them and are surfaced synchronously.

use std::fmt;
use thiserror::Error;

/// Well-known error kinds used throughout the runtime.
///
/// Kinds are open-ended strings so that services can define their own;
/// these are the ones the core itself produces.
pub mod error_kind {
    /// An internal fault in the runtime. Also substituted for an empty kind.
    pub const INTERNAL: &str = "internal-error";
    /// The remote endpoint or connection is gone or was never reachable.
    pub const NOT_AVAILABLE: &str = "not-available";
    /// A request argument the remote service refused.
    pub const INVALID_ARGUMENT: &str = "invalid-argument";
    /// A handle id the remote service does not recognize.
    pub const INVALID_HANDLE: &str = "invalid-handle";
    /// The remote object was torn down by the service.
    pub const OBJECT_REMOVED: &str = "object-removed";
    /// The transport-level endpoint was lost.
    pub const ENDPOINT_LOST: &str = "endpoint-lost";
    /// The request lost a race with a cancellation request.
    pub const CANCELLED: &str = "cancelled";
}

/// The failure outcome of an asynchronous operation: `(kind, message)`.
///
/// A kind is never empty; constructing an error with an empty kind
/// substitutes [`error_kind::INTERNAL`] rather than leaving the failure
/// ambiguous.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct OperationError {
    kind: String,
    message: String,
}

impl OperationError {
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        let kind = kind.into();
        let kind = if kind.is_empty() {
            tracing::warn!("operation error constructed with an empty kind");
            error_kind::INTERNAL.to_string()
        } else {
            kind
        };
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(error_kind::INTERNAL, message)
    }

    pub fn not_available(message: impl Into<String>) -> Self {
        Self::new(error_kind::NOT_AVAILABLE, message)
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Joins the messages of several errors for aggregate failure reporting.
pub struct DisplayList<'a>(pub &'a [OperationError]);

impl fmt::Display for DisplayList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, err) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            f.write_str(err.message())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_kind_is_normalized() {
        let err = OperationError::new("", "boom");
        assert_eq!(err.kind(), error_kind::INTERNAL);
        assert_eq!(err.message(), "boom");
    }

    #[test]
    fn display_includes_kind_and_message() {
        let err = OperationError::new(error_kind::NOT_AVAILABLE, "gone");
        assert_eq!(err.to_string(), "not-available: gone");
    }

    #[test]
    fn display_list_joins_messages() {
        let errs = [
            OperationError::internal("one"),
            OperationError::internal("two"),
        ];
        assert_eq!(DisplayList(&errs).to_string(), "one; two");
    }
}
