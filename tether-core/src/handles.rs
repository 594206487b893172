//! HandleSet - reference-counted container of remote resource identifiers
//!
//! Every id occurrence in a live `HandleSet` holds one local reference on
//! the owning connection, which in turn guarantees the id stays valid on
//! the remote side. Cloning or slicing a set re-references every id it
//! carries; dropping the last set holding an id queues it for release.
//! Sets can only be obtained by acquiring names or referencing known ids
//! through a `Connection`, never by wrapping arbitrary integers.

use crate::connection::Connection;
use crate::error::HandleSetError;
use crate::operation::Operation;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use tether_model::{HandleId, OperationError, ResourceClass};
use uuid::Uuid;

pub struct HandleSet {
    connection: Weak<Connection>,
    connection_id: Uuid,
    class: ResourceClass,
    ids: Vec<HandleId>,
}

impl HandleSet {
    /// Reference `ids` on `connection` and wrap them. Order and
    /// duplicates are preserved; each occurrence counts.
    pub(crate) fn new(
        connection: &Arc<Connection>,
        class: ResourceClass,
        ids: Vec<HandleId>,
    ) -> Self {
        for &id in &ids {
            connection.ref_handle(class, id);
        }
        Self {
            connection: Arc::downgrade(connection),
            connection_id: connection.id(),
            class,
            ids,
        }
    }

    pub fn connection(&self) -> Option<Arc<Connection>> {
        self.connection.upgrade()
    }

    pub fn resource_class(&self) -> ResourceClass {
        self.class
    }

    pub fn ids(&self) -> &[HandleId] {
        &self.ids
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<HandleId> {
        self.ids.get(index).copied()
    }

    pub fn contains(&self, id: HandleId) -> bool {
        self.ids.contains(&id)
    }

    pub fn count_of(&self, id: HandleId) -> usize {
        self.ids.iter().filter(|&&candidate| candidate == id).count()
    }

    pub fn index_of(&self, id: HandleId) -> Option<usize> {
        self.ids.iter().position(|&candidate| candidate == id)
    }

    pub fn to_vec(&self) -> Vec<HandleId> {
        self.ids.clone()
    }

    /// A new set over the ids in `[pos, pos + len)`, each freshly
    /// referenced. Out-of-range portions are simply absent, as with
    /// slicing.
    pub fn mid(&self, pos: usize, len: usize) -> HandleSet {
        let slice: Vec<HandleId> = self.ids.iter().skip(pos).take(len).copied().collect();
        self.sibling(slice)
    }

    /// Concatenation. Both sets must share the connection and resource
    /// class; mixing them is a usage error.
    pub fn concat(&self, other: &HandleSet) -> Result<HandleSet, HandleSetError> {
        if !Weak::ptr_eq(&self.connection, &other.connection) {
            tracing::warn!(
                left = %self.connection_id,
                right = %other.connection_id,
                "refusing to concatenate handle sets from different connections"
            );
            return Err(HandleSetError::ConnectionMismatch);
        }
        if self.class != other.class {
            tracing::warn!(
                left = %self.class,
                right = %other.class,
                "refusing to concatenate handle sets of different resource classes"
            );
            return Err(HandleSetError::ClassMismatch(self.class, other.class));
        }
        let mut ids = self.ids.clone();
        ids.extend_from_slice(&other.ids);
        Ok(self.sibling(ids))
    }

    /// Drop every reference this set holds and empty it.
    pub fn clear(&mut self) {
        if self.ids.is_empty() {
            return;
        }
        match self.connection.upgrade() {
            Some(connection) => {
                for &id in &self.ids {
                    connection.unref_handle(self.class, id);
                }
            }
            None => {
                tracing::debug!(
                    connection = %self.connection_id,
                    "clearing a handle set after its connection was dropped; nothing to release"
                );
            }
        }
        self.ids.clear();
    }

    /// A set over `ids` sharing this set's connection and class,
    /// referencing the ids if the connection is still around.
    fn sibling(&self, ids: Vec<HandleId>) -> HandleSet {
        match self.connection.upgrade() {
            Some(connection) => HandleSet::new(&connection, self.class, ids),
            None => {
                if !ids.is_empty() {
                    tracing::debug!(
                        connection = %self.connection_id,
                        "deriving a handle set after its connection was dropped"
                    );
                }
                HandleSet {
                    connection: self.connection.clone(),
                    connection_id: self.connection_id,
                    class: self.class,
                    ids,
                }
            }
        }
    }
}

impl Clone for HandleSet {
    fn clone(&self) -> Self {
        self.sibling(self.ids.clone())
    }
}

impl Drop for HandleSet {
    fn drop(&mut self) {
        if self.ids.is_empty() {
            return;
        }
        match self.connection.upgrade() {
            Some(connection) => {
                for &id in &self.ids {
                    connection.unref_handle(self.class, id);
                }
            }
            None => {
                // The connection released everything on its own teardown.
                tracing::debug!(
                    connection = %self.connection_id,
                    "handle set outlived its connection; nothing to release"
                );
            }
        }
    }
}

impl PartialEq for HandleSet {
    fn eq(&self, other: &Self) -> bool {
        if !Weak::ptr_eq(&self.connection, &other.connection) || self.class != other.class {
            tracing::warn!(
                "comparing handle sets across connections or resource classes is a usage error"
            );
            return false;
        }
        self.ids == other.ids
    }
}

impl fmt::Debug for HandleSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandleSet")
            .field("connection", &self.connection_id)
            .field("class", &self.class)
            .field("ids", &self.ids)
            .finish()
    }
}

/// Outcome of a handle acquisition.
#[derive(Clone, Debug)]
pub struct AcquiredHandles {
    /// The ids found valid, in caller-requested order.
    pub handles: HandleSet,
    /// Names resolved to an id, in caller-requested order. Empty for
    /// id-based referencing.
    pub valid_names: Vec<String>,
    /// Names the remote service reported invalid.
    pub invalid_names: Vec<String>,
}

/// An in-flight handle acquisition: the operation plus, on success, the
/// acquired set and the valid/invalid partition.
pub struct PendingHandles {
    op: Operation,
    result: Arc<Mutex<Option<AcquiredHandles>>>,
}

impl PendingHandles {
    fn finished(result: AcquiredHandles) -> Self {
        Self {
            op: Operation::succeeded(),
            result: Arc::new(Mutex::new(Some(result))),
        }
    }

    fn failed(error: OperationError) -> Self {
        Self {
            op: Operation::failed(error),
            result: Arc::new(Mutex::new(None)),
        }
    }

    pub fn operation(&self) -> &Operation {
        &self.op
    }

    /// Wait for the acquisition and return its outcome.
    pub async fn result(&self) -> Result<AcquiredHandles, OperationError> {
        self.op.wait().await?;
        let Ok(slot) = self.result.lock() else {
            return Err(OperationError::internal("handle result slot poisoned"));
        };
        slot.clone().ok_or_else(|| {
            OperationError::internal("handle acquisition finished without a result")
        })
    }
}

impl Connection {
    /// Request identifiers for `names`. The reply is partitioned into
    /// valid ids (caller order preserved, duplicate names yielding
    /// duplicate ids) and invalid names; partially invalid requests still
    /// complete successfully, with the invalid names listed.
    pub fn request_handles(
        self: &Arc<Self>,
        class: ResourceClass,
        names: &[&str],
    ) -> PendingHandles {
        tracing::debug!(connection = %self.id(), %class, count = names.len(), "requesting handles");
        if self.is_closed() {
            return PendingHandles::failed(OperationError::not_available(
                "the connection has been closed",
            ));
        }
        if names.is_empty() {
            // Nothing to acquire; an empty set is ready as it stands.
            return PendingHandles::finished(AcquiredHandles {
                handles: HandleSet::new(self, class, Vec::new()),
                valid_names: Vec::new(),
                invalid_names: Vec::new(),
            });
        }

        let names: Vec<String> = names.iter().map(|name| name.to_string()).collect();
        self.begin_handle_request(class);

        let op = Operation::new();
        let result = Arc::new(Mutex::new(None));
        let connection = Arc::clone(self);
        let driven = op.clone();
        let slot = Arc::clone(&result);
        tokio::spawn(async move {
            match connection.endpoint().acquire_handles(class, &names).await {
                Ok(reply) => {
                    if reply.ids.len() != names.len() {
                        connection.handle_request_landed(class);
                        driven.complete_failure(OperationError::internal(
                            "acquire reply is not parallel to the requested names",
                        ));
                        return;
                    }
                    let mut valid_ids = Vec::new();
                    let mut valid_names = Vec::new();
                    let mut invalid_names = Vec::new();
                    for (name, id) in names.iter().zip(&reply.ids) {
                        match id {
                            Some(id) => {
                                valid_ids.push(*id);
                                valid_names.push(name.clone());
                            }
                            None => invalid_names.push(name.clone()),
                        }
                    }
                    // Reference the fresh ids before marking the request
                    // landed, so a pending release sweep cannot take them.
                    let handles = HandleSet::new(&connection, class, valid_ids);
                    connection.handle_request_landed(class);
                    match slot.lock() {
                        Ok(mut slot) => {
                            *slot = Some(AcquiredHandles {
                                handles,
                                valid_names,
                                invalid_names,
                            });
                        }
                        Err(_) => {
                            driven.complete_failure(OperationError::internal(
                                "handle result slot poisoned",
                            ));
                            return;
                        }
                    }
                    driven.complete_success();
                }
                Err(err) => {
                    connection.handle_request_landed(class);
                    driven.complete_failure(err);
                }
            }
        });

        PendingHandles { op, result }
    }

    /// Reference already-known identifiers, e.g. ids observed in a
    /// remote notification, so they are guaranteed to stay valid. Ids
    /// this client already holds are referenced locally without remote
    /// traffic; the rest are held through the endpoint first.
    pub fn reference_handles(
        self: &Arc<Self>,
        class: ResourceClass,
        ids: &[HandleId],
    ) -> PendingHandles {
        tracing::debug!(connection = %self.id(), %class, count = ids.len(), "referencing handles");
        if self.is_closed() {
            return PendingHandles::failed(OperationError::not_available(
                "the connection has been closed",
            ));
        }
        if ids.is_empty() {
            return PendingHandles::finished(AcquiredHandles {
                handles: HandleSet::new(self, class, Vec::new()),
                valid_names: Vec::new(),
                invalid_names: Vec::new(),
            });
        }

        let mut already_held = Vec::new();
        let mut not_yet_held = Vec::new();
        for &id in ids {
            if self.holds_handle(class, id) {
                already_held.push(id);
            } else if !not_yet_held.contains(&id) {
                not_yet_held.push(id);
            }
        }

        if not_yet_held.is_empty() {
            // Every id is covered by local bookkeeping; no remote call.
            return PendingHandles::finished(AcquiredHandles {
                handles: HandleSet::new(self, class, ids.to_vec()),
                valid_names: Vec::new(),
                invalid_names: Vec::new(),
            });
        }

        // Pin the already-held ids for the duration of the request so
        // they cannot be swept while the hold is in flight.
        let pinned = HandleSet::new(self, class, already_held);
        let requested = ids.to_vec();
        self.begin_handle_request(class);

        let op = Operation::new();
        let result = Arc::new(Mutex::new(None));
        let connection = Arc::clone(self);
        let driven = op.clone();
        let slot = Arc::clone(&result);
        tokio::spawn(async move {
            let outcome = connection
                .endpoint()
                .hold_handles(class, &not_yet_held)
                .await;
            match outcome {
                Ok(()) => {
                    let handles = HandleSet::new(&connection, class, requested);
                    connection.handle_request_landed(class);
                    match slot.lock() {
                        Ok(mut slot) => {
                            *slot = Some(AcquiredHandles {
                                handles,
                                valid_names: Vec::new(),
                                invalid_names: Vec::new(),
                            });
                        }
                        Err(_) => {
                            driven.complete_failure(OperationError::internal(
                                "handle result slot poisoned",
                            ));
                            return;
                        }
                    }
                    driven.complete_success();
                }
                Err(err) => {
                    connection.handle_request_landed(class);
                    driven.complete_failure(err);
                }
            }
            // The pin is only needed while the hold was in flight.
            drop(pinned);
        });

        PendingHandles { op, result }
    }
}
