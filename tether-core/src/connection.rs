//! Connection - client end of one remote endpoint, owner of handle refcounts
//!
//! Wraps a `RemoteEndpoint` and keeps the per-class handle bookkeeping:
//! reference counts, identifiers awaiting release, and the in-flight
//! acquire counter that gates release sweeps. Sweeps run on a janitor
//! task, one queued message per scheduled sweep, so the last unref of a
//! handle never blocks and a re-reference before the sweep lands
//! resurrects the id instead of releasing it.

use crate::operation::Operation;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tether_model::{
    HandleId, ObjectPath, OperationError, RemoteEndpoint, RemoteEvent, ResourceClass,
};
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

#[derive(Default)]
struct ClassTable {
    refcounts: HashMap<HandleId, usize>,
    to_release: HashSet<HandleId>,
    requests_in_flight: usize,
    release_scheduled: bool,
}

#[derive(Default)]
struct HandleTables {
    classes: HashMap<ResourceClass, ClassTable>,
}

/// Client-side connection to one remote endpoint.
///
/// Shared (`Arc`) by proxies and handle sets; only this type mutates the
/// handle reference tables.
pub struct Connection {
    id: Uuid,
    endpoint: Arc<dyn RemoteEndpoint>,
    handles: Mutex<HandleTables>,
    sweep_tx: mpsc::UnboundedSender<ResourceClass>,
    closed: AtomicBool,
}

impl Connection {
    /// Wrap an endpoint. Spawns the release-sweep janitor, so this must
    /// run inside a tokio runtime.
    pub fn new(endpoint: Arc<dyn RemoteEndpoint>) -> Arc<Self> {
        let (sweep_tx, sweep_rx) = mpsc::unbounded_channel();
        let connection = Arc::new(Self {
            id: Uuid::new_v4(),
            endpoint,
            handles: Mutex::new(HandleTables::default()),
            sweep_tx,
            closed: AtomicBool::new(false),
        });
        tokio::spawn(release_janitor(Arc::downgrade(&connection), sweep_rx));
        connection
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn endpoint(&self) -> &Arc<dyn RemoteEndpoint> {
        &self.endpoint
    }

    /// Subscribe to the endpoint's event stream.
    pub fn events(&self) -> broadcast::Receiver<RemoteEvent> {
        self.endpoint.events()
    }

    /// Mark the connection closed. Subsequent calls and handle requests
    /// fail immediately; existing handle sets keep their bookkeeping.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Generic method call against one object behind this endpoint.
    pub fn call(self: &Arc<Self>, path: ObjectPath, member: &str, body: Vec<u8>) -> PendingCall {
        let op = Operation::new();
        let reply = Arc::new(Mutex::new(None));
        if self.is_closed() {
            op.complete_failure(OperationError::not_available("the connection has been closed"));
            return PendingCall { op, reply };
        }
        let connection = Arc::clone(self);
        let member = member.to_string();
        let driven = op.clone();
        let slot = Arc::clone(&reply);
        tokio::spawn(async move {
            match connection.endpoint.call(&path, &member, body).await {
                Ok(bytes) => {
                    match slot.lock() {
                        Ok(mut slot) => *slot = Some(bytes),
                        Err(_) => {
                            driven.complete_failure(OperationError::internal(
                                "call reply slot poisoned",
                            ));
                            return;
                        }
                    }
                    driven.complete_success();
                }
                Err(err) => driven.complete_failure(err),
            }
        });
        PendingCall { op, reply }
    }

    /// Take one local reference to `id`. Resurrects an id that was
    /// pending release.
    pub(crate) fn ref_handle(&self, class: ResourceClass, id: HandleId) {
        let Ok(mut tables) = self.handles.lock() else {
            tracing::error!(connection = %self.id, "handle tables poisoned");
            return;
        };
        let table = tables.classes.entry(class).or_default();
        table.to_release.remove(&id);
        *table.refcounts.entry(id).or_insert(0) += 1;
    }

    /// Drop one local reference to `id`. The last reference moves the id
    /// to the release queue and schedules a sweep, unless an acquire for
    /// this class is still in flight (its reply may reference the id).
    pub(crate) fn unref_handle(&self, class: ResourceClass, id: HandleId) {
        let Ok(mut tables) = self.handles.lock() else {
            tracing::error!(connection = %self.id, "handle tables poisoned");
            return;
        };
        let table = tables.classes.entry(class).or_default();
        let Some(count) = table.refcounts.get_mut(&id) else {
            tracing::warn!(
                connection = %self.id,
                %class,
                id,
                "unref of a handle with no local references"
            );
            return;
        };
        *count -= 1;
        if *count > 0 {
            return;
        }
        table.refcounts.remove(&id);
        table.to_release.insert(id);
        if !table.release_scheduled && table.requests_in_flight == 0 {
            tracing::debug!(
                connection = %self.id,
                %class,
                "lost last reference to a handle; scheduling a release sweep"
            );
            table.release_scheduled = true;
            let _ = self.sweep_tx.send(class);
        }
    }

    pub(crate) fn begin_handle_request(&self, class: ResourceClass) {
        let Ok(mut tables) = self.handles.lock() else {
            return;
        };
        tables.classes.entry(class).or_default().requests_in_flight += 1;
    }

    /// A handle request for `class` finished (either way). Once no
    /// requests remain in flight, any deferred release work is scheduled.
    pub(crate) fn handle_request_landed(&self, class: ResourceClass) {
        let Ok(mut tables) = self.handles.lock() else {
            return;
        };
        let table = tables.classes.entry(class).or_default();
        table.requests_in_flight = table.requests_in_flight.saturating_sub(1);
        if table.requests_in_flight == 0
            && !table.to_release.is_empty()
            && !table.release_scheduled
        {
            table.release_scheduled = true;
            let _ = self.sweep_tx.send(class);
        }
    }

    /// Whether `id` is covered by local bookkeeping: referenced, or
    /// pending release (and thus still valid remotely).
    pub(crate) fn holds_handle(&self, class: ResourceClass, id: HandleId) -> bool {
        let Ok(tables) = self.handles.lock() else {
            return false;
        };
        tables
            .classes
            .get(&class)
            .map(|table| table.refcounts.contains_key(&id) || table.to_release.contains(&id))
            .unwrap_or(false)
    }

    fn take_release_batch(&self, class: ResourceClass) -> Vec<HandleId> {
        let Ok(mut tables) = self.handles.lock() else {
            return Vec::new();
        };
        let table = tables.classes.entry(class).or_default();
        table.release_scheduled = false;
        table.to_release.drain().collect()
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        // Release everything still referenced in one final sweep. Outside
        // a runtime there is nobody to run it; the remote service reclaims
        // the handles when the transport goes down.
        let Ok(tables) = self.handles.get_mut() else {
            return;
        };
        let mut leftover: Vec<(ResourceClass, Vec<HandleId>)> = Vec::new();
        for (&class, table) in &tables.classes {
            let mut ids: Vec<HandleId> = table.refcounts.keys().copied().collect();
            ids.extend(table.to_release.iter().copied());
            if !ids.is_empty() {
                leftover.push((class, ids));
            }
        }
        if leftover.is_empty() || self.is_closed() {
            return;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let endpoint = Arc::clone(&self.endpoint);
                let connection = self.id;
                runtime.spawn(async move {
                    for (class, ids) in leftover {
                        if let Err(err) = endpoint.release_handles(class, &ids).await {
                            tracing::warn!(%connection, %class, %err, "final handle release failed");
                        }
                    }
                });
            }
            Err(_) => {
                tracing::debug!(
                    connection = %self.id,
                    "connection dropped outside a runtime; skipping final handle release"
                );
            }
        }
    }
}

/// Drains scheduled release sweeps. One message per scheduled sweep; the
/// batch is whatever is pending release at processing time, so ids
/// re-referenced in between are not released.
async fn release_janitor(
    connection: std::sync::Weak<Connection>,
    mut sweeps: mpsc::UnboundedReceiver<ResourceClass>,
) {
    while let Some(class) = sweeps.recv().await {
        let Some(connection) = connection.upgrade() else {
            break;
        };
        let batch = connection.take_release_batch(class);
        if batch.is_empty() {
            continue;
        }
        tracing::debug!(
            connection = %connection.id,
            %class,
            count = batch.len(),
            "releasing handles"
        );
        if let Err(err) = connection.endpoint.release_handles(class, &batch).await {
            tracing::warn!(connection = %connection.id, %class, %err, "handle release failed");
        }
    }
}

/// A generic in-flight method call: the operation plus, on success, the
/// raw reply bytes.
pub struct PendingCall {
    op: Operation,
    reply: Arc<Mutex<Option<Vec<u8>>>>,
}

impl PendingCall {
    pub fn operation(&self) -> &Operation {
        &self.op
    }

    pub fn into_operation(self) -> Operation {
        self.op
    }

    /// Wait for the call and return the reply body.
    pub async fn reply(&self) -> Result<Vec<u8>, OperationError> {
        self.op.wait().await?;
        let Ok(slot) = self.reply.lock() else {
            return Err(OperationError::internal("call reply slot poisoned"));
        };
        Ok(slot.clone().unwrap_or_default())
    }
}
