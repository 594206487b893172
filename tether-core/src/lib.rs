//! Tether Core
//!
//! Client-side runtime for long-lived remote objects over an
//! asynchronous request/reply transport:
//! - **Operation / CompositeOperation**: single-fire asynchronous results
//!   and aggregate completion over sets of them
//! - **ProxyCore / RemoteObject**: shared proxy state with irreversible
//!   invalidation and a feature-readiness engine
//! - **ProxyCache**: at most one valid proxy per remote-object identity
//! - **ProxyFactory / ProxyBuilder / PendingProxy**: normalize, reuse or
//!   construct, then run the readiness pipeline
//! - **Connection / PendingCall**: one remote endpoint plus the handle
//!   reference tables and their release sweeps
//! - **HandleSet / PendingHandles**: reference-counted remote resource
//!   identifiers, valid exactly as long as some local set holds them

pub mod cache;
pub mod composite;
pub mod connection;
pub mod error;
pub mod factory;
pub mod handles;
pub mod operation;
pub mod proxy;

pub use cache::ProxyCache;
pub use composite::{CompletionPolicy, CompositeOperation};
pub use connection::{Connection, PendingCall};
pub use error::HandleSetError;
pub use factory::{PendingProxy, ProxyBuilder, ProxyFactory};
pub use handles::{AcquiredHandles, HandleSet, PendingHandles};
pub use operation::Operation;
pub use proxy::{ProxyCore, RemoteObject};
