//! Tether Model
//!
//! Pure data types and traits for the Tether remote-object runtime,
//! decoupled from the operation machinery and any concrete transport:
//! - **ServiceName / ObjectPath / ProxyKey**: remote-object identity
//! - **HandleId / ResourceClass**: remote resource identifiers
//! - **Feature**: units of proxy readiness
//! - **OperationError**: the (kind, message) failure every async
//!   operation surfaces
//! - **RemoteEndpoint**: the transport seam, with its reply and event types

pub mod endpoint;
pub mod error;
pub mod types;

pub use endpoint::{AcquireReply, BoxFuture, RemoteEndpoint, RemoteEvent};
pub use error::{error_kind, DisplayList, OperationError};
pub use types::{Feature, HandleId, ObjectPath, ProxyKey, ResourceClass, ServiceName};
