//! RemoteEndpoint - transport seam for the remote service
//!
//! Decouples the runtime from any concrete transport or wire encoding.
//! Production code plugs in a real request/reply transport; tests use the
//! in-memory `tether-sim` implementation. Payloads are opaque bytes; how
//! they are marshalled is the transport's business.

use crate::error::OperationError;
use crate::types::{HandleId, ObjectPath, ResourceClass, ServiceName};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::broadcast;

/// Boxed future type used by the object-safe endpoint trait.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Reply to an acquire-handles request.
#[derive(Clone, Debug, Default)]
pub struct AcquireReply {
    /// One slot per requested name, in request order. `None` marks a name
    /// the service reported invalid.
    pub ids: Vec<Option<HandleId>>,
}

/// Events an endpoint pushes to the client runtime.
#[derive(Clone, Debug)]
pub enum RemoteEvent {
    /// A specific remote object became permanently unreachable.
    ObjectLost {
        service: ServiceName,
        path: ObjectPath,
        reason: OperationError,
    },
    /// The whole endpoint is gone; every object behind it is unreachable.
    EndpointClosed { reason: OperationError },
}

/// An asynchronous request/reply transport to one remote service process.
///
/// Requests against the same endpoint must be processed in submission
/// order; replies never reorder across requests.
pub trait RemoteEndpoint: Send + Sync + fmt::Debug + 'static {
    /// Generic method call against one object behind the endpoint.
    fn call<'a>(
        &'a self,
        path: &'a ObjectPath,
        member: &'a str,
        body: Vec<u8>,
    ) -> BoxFuture<'a, Result<Vec<u8>, OperationError>>;

    /// Request identifiers for the given names. The reply is parallel to
    /// `names`; requesting the same name twice yields the same id twice.
    fn acquire_handles<'a>(
        &'a self,
        class: ResourceClass,
        names: &'a [String],
    ) -> BoxFuture<'a, Result<AcquireReply, OperationError>>;

    /// Take a remote reference to already-known identifiers so they stay
    /// valid for this client.
    fn hold_handles<'a>(
        &'a self,
        class: ResourceClass,
        ids: &'a [HandleId],
    ) -> BoxFuture<'a, Result<(), OperationError>>;

    /// Drop this client's remote references to the given identifiers.
    fn release_handles<'a>(
        &'a self,
        class: ResourceClass,
        ids: &'a [HandleId],
    ) -> BoxFuture<'a, Result<(), OperationError>>;

    /// Subscribe to endpoint events.
    fn events(&self) -> broadcast::Receiver<RemoteEvent>;
}
