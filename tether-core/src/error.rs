//! Local usage errors for tether-core
//!
//! Unlike remote failures (which travel as failed operations), these are
//! returned synchronously: the caller holds a bug it can fix immediately.

use tether_model::ResourceClass;
use thiserror::Error;

/// Misuse of handle-set value operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandleSetError {
    #[error("handle sets belong to different connections")]
    ConnectionMismatch,

    #[error("handle sets mix resource classes ({0} and {1})")]
    ClassMismatch(ResourceClass, ResourceClass),
}
