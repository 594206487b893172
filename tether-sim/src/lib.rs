//! SimEndpoint - in-memory RemoteEndpoint implementation
//!
//! Deterministic test double for the remote service: name-to-id
//! assignment is stable (the same name always maps to the same id),
//! rejections, call replies and failures can be scripted, and every
//! release/hold call is recorded for assertions. Events are injected
//! through explicit emit helpers.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether_model::{
    AcquireReply, BoxFuture, HandleId, ObjectPath, OperationError, RemoteEndpoint, RemoteEvent,
    ResourceClass, ServiceName,
};
use tokio::sync::broadcast;

const EVENT_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Default)]
struct SimState {
    next_id: HandleId,
    assigned: HashMap<(ResourceClass, String), HandleId>,
    rejected: HashSet<String>,
    acquire_failure: Option<OperationError>,
    call_replies: HashMap<(String, String), Result<Vec<u8>, OperationError>>,
    reply_delay: Option<Duration>,
    calls: Vec<(String, String)>,
    acquires: Vec<(ResourceClass, Vec<String>)>,
    holds: Vec<(ResourceClass, Vec<HandleId>)>,
    releases: Vec<(ResourceClass, Vec<HandleId>)>,
}

/// Scriptable in-memory endpoint.
#[derive(Debug)]
pub struct SimEndpoint {
    state: Mutex<SimState>,
    events_tx: broadcast::Sender<RemoteEvent>,
}

impl SimEndpoint {
    pub fn new() -> Arc<Self> {
        let (events_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            state: Mutex::new(SimState {
                next_id: 1,
                ..SimState::default()
            }),
            events_tx,
        })
    }

    fn locked(&self) -> Result<std::sync::MutexGuard<'_, SimState>, OperationError> {
        self.state
            .lock()
            .map_err(|_| OperationError::internal("sim endpoint state poisoned"))
    }

    /// Report `name` invalid on future acquire requests.
    pub fn reject_name(&self, name: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.rejected.insert(name.to_string());
        }
    }

    /// Fail every future acquire request with `error`.
    pub fn fail_acquires(&self, error: OperationError) {
        if let Ok(mut state) = self.state.lock() {
            state.acquire_failure = Some(error);
        }
    }

    /// Script the reply for calls to `(path, member)`. Unscripted calls
    /// echo their request body.
    pub fn script_call(&self, path: &str, member: &str, reply: Result<Vec<u8>, OperationError>) {
        if let Ok(mut state) = self.state.lock() {
            state
                .call_replies
                .insert((path.to_string(), member.to_string()), reply);
        }
    }

    /// Delay every reply by `delay`, to keep requests observably pending.
    pub fn set_reply_delay(&self, delay: Duration) {
        if let Ok(mut state) = self.state.lock() {
            state.reply_delay = Some(delay);
        }
    }

    /// The id `name` maps to, if it was ever assigned.
    pub fn id_for(&self, class: ResourceClass, name: &str) -> Option<HandleId> {
        self.state
            .lock()
            .ok()?
            .assigned
            .get(&(class, name.to_string()))
            .copied()
    }

    /// Every `(path, member)` pair called so far.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.state
            .lock()
            .map(|state| state.calls.clone())
            .unwrap_or_default()
    }

    pub fn acquire_calls(&self) -> usize {
        self.state.lock().map(|state| state.acquires.len()).unwrap_or(0)
    }

    pub fn hold_calls(&self) -> usize {
        self.state.lock().map(|state| state.holds.len()).unwrap_or(0)
    }

    /// Ids released so far for `class`, flattened across calls.
    pub fn released_ids(&self, class: ResourceClass) -> Vec<HandleId> {
        let Ok(state) = self.state.lock() else {
            return Vec::new();
        };
        state
            .releases
            .iter()
            .filter(|(released_class, _)| *released_class == class)
            .flat_map(|(_, ids)| ids.iter().copied())
            .collect()
    }

    /// Ids held remotely so far for `class`, flattened across calls.
    pub fn held_ids(&self, class: ResourceClass) -> Vec<HandleId> {
        let Ok(state) = self.state.lock() else {
            return Vec::new();
        };
        state
            .holds
            .iter()
            .filter(|(held_class, _)| *held_class == class)
            .flat_map(|(_, ids)| ids.iter().copied())
            .collect()
    }

    /// Announce that one remote object is gone.
    pub fn emit_object_lost(
        &self,
        service: impl Into<ServiceName>,
        path: impl Into<ObjectPath>,
        reason: OperationError,
    ) {
        let _ = self.events_tx.send(RemoteEvent::ObjectLost {
            service: service.into(),
            path: path.into(),
            reason,
        });
    }

    /// Announce that the whole endpoint is gone.
    pub fn emit_endpoint_closed(&self, reason: OperationError) {
        let _ = self.events_tx.send(RemoteEvent::EndpointClosed { reason });
    }

    async fn apply_delay(&self) {
        let delay = self
            .state
            .lock()
            .ok()
            .and_then(|state| state.reply_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

impl RemoteEndpoint for SimEndpoint {
    fn call<'a>(
        &'a self,
        path: &'a ObjectPath,
        member: &'a str,
        body: Vec<u8>,
    ) -> BoxFuture<'a, Result<Vec<u8>, OperationError>> {
        Box::pin(async move {
            self.apply_delay().await;
            let mut state = self.locked()?;
            state.calls.push((path.as_str().to_string(), member.to_string()));
            match state
                .call_replies
                .get(&(path.as_str().to_string(), member.to_string()))
            {
                Some(reply) => reply.clone(),
                None => Ok(body),
            }
        })
    }

    fn acquire_handles<'a>(
        &'a self,
        class: ResourceClass,
        names: &'a [String],
    ) -> BoxFuture<'a, Result<AcquireReply, OperationError>> {
        Box::pin(async move {
            self.apply_delay().await;
            let mut state = self.locked()?;
            state.acquires.push((class, names.to_vec()));
            if let Some(failure) = &state.acquire_failure {
                return Err(failure.clone());
            }
            let mut ids = Vec::with_capacity(names.len());
            for name in names {
                if state.rejected.contains(name) {
                    ids.push(None);
                    continue;
                }
                let key = (class, name.clone());
                let id = match state.assigned.get(&key) {
                    Some(&id) => id,
                    None => {
                        let id = state.next_id;
                        state.next_id += 1;
                        state.assigned.insert(key, id);
                        id
                    }
                };
                ids.push(Some(id));
            }
            tracing::debug!(%class, requested = names.len(), "sim assigned handles");
            Ok(AcquireReply { ids })
        })
    }

    fn hold_handles<'a>(
        &'a self,
        class: ResourceClass,
        ids: &'a [HandleId],
    ) -> BoxFuture<'a, Result<(), OperationError>> {
        Box::pin(async move {
            self.apply_delay().await;
            let mut state = self.locked()?;
            state.holds.push((class, ids.to_vec()));
            Ok(())
        })
    }

    fn release_handles<'a>(
        &'a self,
        class: ResourceClass,
        ids: &'a [HandleId],
    ) -> BoxFuture<'a, Result<(), OperationError>> {
        Box::pin(async move {
            self.apply_delay().await;
            let mut state = self.locked()?;
            state.releases.push((class, ids.to_vec()));
            tracing::debug!(%class, count = ids.len(), "sim released handles");
            Ok(())
        })
    }

    fn events(&self) -> broadcast::Receiver<RemoteEvent> {
        self.events_tx.subscribe()
    }
}
