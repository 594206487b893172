//! ProxyCore / RemoteObject - shared state of local remote-object proxies
//!
//! Every proxy kind embeds a `ProxyCore`: the identity key, validity with
//! an invalidation reason, the set of features already made ready, and the
//! per-feature operations still in flight. Invalidation is irreversible;
//! signalling it twice keeps the first reason and is otherwise a no-op.

use crate::composite::{CompletionPolicy, CompositeOperation};
use crate::operation::Operation;
use std::any::Any;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};
use tether_model::{error_kind, Feature, ObjectPath, OperationError, ProxyKey, ServiceName};
use tokio::sync::broadcast;

const INVALIDATION_CHANNEL_CAPACITY: usize = 16;

struct CoreState {
    invalidation: Option<OperationError>,
    ready: HashSet<Feature>,
    in_flight: HashMap<Feature, Operation>,
}

/// State common to all proxy kinds.
pub struct ProxyCore {
    key: ProxyKey,
    state: Mutex<CoreState>,
    invalidated_tx: broadcast::Sender<OperationError>,
}

impl ProxyCore {
    pub fn new(key: ProxyKey) -> Self {
        let (invalidated_tx, _) = broadcast::channel(INVALIDATION_CHANNEL_CAPACITY);
        Self {
            key,
            state: Mutex::new(CoreState {
                invalidation: None,
                ready: HashSet::new(),
                in_flight: HashMap::new(),
            }),
            invalidated_tx,
        }
    }

    pub fn key(&self) -> &ProxyKey {
        &self.key
    }

    pub fn service(&self) -> &ServiceName {
        self.key.service()
    }

    pub fn path(&self) -> &ObjectPath {
        self.key.path()
    }

    pub fn is_valid(&self) -> bool {
        let Ok(state) = self.state.lock() else {
            return false;
        };
        state.invalidation.is_none()
    }

    /// The reason this proxy became unusable, once it has.
    pub fn invalidation_reason(&self) -> Option<OperationError> {
        let Ok(state) = self.state.lock() else {
            return None;
        };
        state.invalidation.clone()
    }

    /// Mark the proxy permanently unusable. Idempotent: a second signal
    /// keeps the first reason and notifies nobody.
    pub fn invalidate(&self, reason: OperationError) {
        {
            let Ok(mut state) = self.state.lock() else {
                tracing::error!(key = %self.key, "proxy state poisoned; dropping invalidation");
                return;
            };
            if let Some(existing) = &state.invalidation {
                tracing::debug!(
                    key = %self.key,
                    first = %existing,
                    ignored = %reason,
                    "proxy already invalidated; keeping the first reason"
                );
                return;
            }
            tracing::debug!(key = %self.key, %reason, "proxy invalidated");
            state.invalidation = Some(reason.clone());
        }
        // Receivers run on the scheduler, never inside this call.
        let _ = self.invalidated_tx.send(reason);
    }

    /// Subscribe to the (single) invalidation notification.
    pub fn subscribe_invalidation(&self) -> broadcast::Receiver<OperationError> {
        self.invalidated_tx.subscribe()
    }

    pub fn is_ready(&self, features: &[Feature]) -> bool {
        let Ok(state) = self.state.lock() else {
            return false;
        };
        features.iter().all(|f| state.ready.contains(f))
    }

    pub fn ready_features(&self) -> Vec<Feature> {
        let Ok(state) = self.state.lock() else {
            return Vec::new();
        };
        state.ready.iter().copied().collect()
    }

    fn feature_done(&self, feature: Feature, success: bool) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        state.in_flight.remove(&feature);
        if success {
            state.ready.insert(feature);
        }
    }
}

/// A local stand-in for one remote object.
///
/// Implementors embed a [`ProxyCore`] and supply `prepare_feature`, the
/// asynchronous work that makes a single feature usable. The provided
/// `become_ready` drives the requested set, reusing features already
/// ready or in flight.
pub trait RemoteObject: Send + Sync + 'static {
    fn core(&self) -> &ProxyCore;

    /// Start making one feature ready. Called at most once per feature
    /// while no earlier attempt is in flight.
    fn prepare_feature(&self, feature: Feature) -> Operation {
        Operation::failed(OperationError::new(
            error_kind::INVALID_ARGUMENT,
            format!("unknown feature {feature}"),
        ))
    }

    /// Wait for the requested features to become ready on this proxy.
    ///
    /// An empty request completes successfully without waiting on
    /// anything. The returned operation fails if the proxy is (or
    /// becomes) invalid before the features are ready.
    fn become_ready(self: &Arc<Self>, features: &[Feature]) -> Operation
    where
        Self: Sized,
    {
        let core = self.core();
        // Subscribe before the validity check so an invalidation landing
        // between the two cannot be missed.
        let mut invalidated = core.subscribe_invalidation();
        if let Some(reason) = core.invalidation_reason() {
            return Operation::failed(reason);
        }

        let subject = Arc::downgrade(self) as Weak<dyn Any + Send + Sync>;
        let mut waits: Vec<Operation> = Vec::new();
        let mut to_start: Vec<(Feature, Operation)> = Vec::new();
        {
            let Ok(mut state) = core.state.lock() else {
                return Operation::failed(OperationError::internal("proxy state poisoned"));
            };
            for &feature in features {
                if state.ready.contains(&feature) {
                    continue;
                }
                if let Some(pending) = state.in_flight.get(&feature) {
                    waits.push(pending.clone());
                    continue;
                }
                let wrapper = Operation::new_for(subject.clone());
                state.in_flight.insert(feature, wrapper.clone());
                waits.push(wrapper.clone());
                to_start.push((feature, wrapper));
            }
        }

        for (feature, wrapper) in to_start {
            let inner = self.prepare_feature(feature);
            let proxy = Arc::clone(self);
            tokio::spawn(async move {
                match inner.wait().await {
                    Ok(()) => {
                        proxy.core().feature_done(feature, true);
                        wrapper.complete_success();
                    }
                    Err(err) => {
                        proxy.core().feature_done(feature, false);
                        wrapper.complete_failure(err);
                    }
                }
            });
        }

        if waits.is_empty() {
            return Operation::succeeded();
        }

        let composite = CompositeOperation::new(waits, CompletionPolicy::FailFast);
        let result = Operation::new_for(subject);
        let driven = result.clone();
        tokio::spawn(async move {
            tokio::select! {
                outcome = composite.wait() => match outcome {
                    Ok(()) => driven.complete_success(),
                    Err(err) => driven.complete_failure(err),
                },
                signal = invalidated.recv() => {
                    let reason = signal.unwrap_or_else(|_| {
                        OperationError::internal("proxy dropped while becoming ready")
                    });
                    driven.complete_failure(reason);
                }
            }
        });
        result
    }
}
