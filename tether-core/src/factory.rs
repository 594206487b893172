//! ProxyFactory - construct-or-reuse proxies and make them ready
//!
//! The factory is the only entry point for obtaining proxies. It
//! normalizes the requested identity, consults its cache, registers a
//! newly built proxy *before* any asynchronous work starts (so a second
//! acquire for the same key in the same tick observes the same
//! instance), and runs the readiness pipeline: pre-hook, feature wait,
//! post-hook. Callers get the proxy synchronously and an operation that
//! completes when the pipeline does.

use crate::cache::ProxyCache;
use crate::connection::Connection;
use crate::operation::Operation;
use crate::proxy::RemoteObject;
use std::any::Any;
use std::sync::{Arc, Weak};
use tether_model::{
    Feature, ObjectPath, OperationError, ProxyKey, RemoteEvent, ServiceName,
};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Per-proxy-kind construction knowledge.
pub trait ProxyBuilder: Send + Sync + 'static {
    type Proxy: RemoteObject;

    /// Normalize a caller-supplied service name to the canonical identity
    /// the constructed proxy itself reports. Getting this wrong silently
    /// defeats caching. Identity transform by default.
    fn normalize_service(&self, service: &ServiceName) -> ServiceName {
        service.clone()
    }

    fn build(&self, connection: &Arc<Connection>, key: &ProxyKey) -> Arc<Self::Proxy>;

    /// Arbitrary asynchronous prework to run before making the proxy
    /// ready.
    fn initial_prepare(&self, _proxy: &Arc<Self::Proxy>) -> Option<Operation> {
        None
    }

    /// Arbitrary asynchronous work to run after the proxy became ready.
    fn ready_prepare(&self, _proxy: &Arc<Self::Proxy>) -> Option<Operation> {
        None
    }
}

/// An acquire in flight: the proxy, available immediately for uses that
/// tolerate partial readiness, plus the readiness operation.
pub struct PendingProxy<P> {
    proxy: Arc<P>,
    requested: Vec<Feature>,
    op: Operation,
}

impl<P: RemoteObject> PendingProxy<P> {
    pub fn proxy(&self) -> &Arc<P> {
        &self.proxy
    }

    pub fn requested_features(&self) -> &[Feature] {
        &self.requested
    }

    pub fn operation(&self) -> &Operation {
        &self.op
    }

    /// Wait for the readiness pipeline and return the proxy.
    pub async fn ready(&self) -> Result<Arc<P>, OperationError> {
        self.op.wait().await?;
        Ok(Arc::clone(&self.proxy))
    }
}

/// Factory for one kind of proxy over one connection. Owns the identity
/// cache; dropping the factory drops the cache with it.
pub struct ProxyFactory<B: ProxyBuilder> {
    connection: Arc<Connection>,
    builder: Arc<B>,
    cache: ProxyCache<B::Proxy>,
    event_watcher: JoinHandle<()>,
}

impl<B: ProxyBuilder> ProxyFactory<B> {
    pub fn new(connection: Arc<Connection>, builder: B) -> Self {
        let cache = ProxyCache::new();
        let event_watcher = tokio::spawn(watch_endpoint_events(
            connection.events(),
            cache.clone(),
        ));
        Self {
            connection,
            builder: Arc::new(builder),
            cache,
            event_watcher,
        }
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// The cached proxy for the given identity, if a valid one exists.
    pub fn cached(&self, service: &ServiceName, path: &ObjectPath) -> Option<Arc<B::Proxy>> {
        let canonical = self.builder.normalize_service(service);
        self.cache.get(&ProxyKey::new(canonical, path.clone()))
    }

    /// Obtain the proxy for `(service, path)` and start making it ready.
    ///
    /// The proxy is usable (for readiness-tolerant purposes) as soon as
    /// this returns; the returned operation completes once the pre-hook,
    /// the requested features and the post-hook have all finished. An
    /// empty feature set waits for nothing beyond the hooks.
    pub fn acquire(
        &self,
        service: &ServiceName,
        path: &ObjectPath,
        features: &[Feature],
    ) -> PendingProxy<B::Proxy> {
        let canonical = self.builder.normalize_service(service);
        let key = ProxyKey::new(canonical, path.clone());

        let proxy = match self.cache.get(&key) {
            Some(existing) => {
                tracing::debug!(%key, "reusing cached proxy");
                existing
            }
            None => {
                let built = self.builder.build(&self.connection, &key);
                // Register before any async work: a concurrent acquire
                // for this key must observe this same instance.
                self.cache.put(&built);
                built
            }
        };

        let op = Operation::new_for(Arc::downgrade(&proxy) as Weak<dyn Any + Send + Sync>);
        let driven = op.clone();
        let builder = Arc::clone(&self.builder);
        let pipeline_proxy = Arc::clone(&proxy);
        let requested = features.to_vec();
        let wanted = requested.clone();
        tokio::spawn(async move {
            if let Some(prepare) = builder.initial_prepare(&pipeline_proxy) {
                if let Err(err) = prepare.wait().await {
                    driven.complete_failure(err);
                    return;
                }
            }
            if let Err(err) = pipeline_proxy.become_ready(&wanted).wait().await {
                driven.complete_failure(err);
                return;
            }
            if let Some(finish) = builder.ready_prepare(&pipeline_proxy) {
                if let Err(err) = finish.wait().await {
                    driven.complete_failure(err);
                    return;
                }
            }
            driven.complete_success();
        });

        PendingProxy {
            proxy,
            requested,
            op,
        }
    }
}

impl<B: ProxyBuilder> Drop for ProxyFactory<B> {
    fn drop(&mut self) {
        self.event_watcher.abort();
    }
}

/// Applies endpoint events to cached proxies: a lost object invalidates
/// its proxy, a closed endpoint invalidates every cached proxy.
async fn watch_endpoint_events<P: RemoteObject>(
    mut events: broadcast::Receiver<RemoteEvent>,
    cache: ProxyCache<P>,
) {
    loop {
        match events.recv().await {
            Ok(RemoteEvent::ObjectLost {
                service,
                path,
                reason,
            }) => {
                let key = ProxyKey::new(service, path);
                if let Some(proxy) = cache.get(&key) {
                    proxy.core().invalidate(reason);
                }
            }
            Ok(RemoteEvent::EndpointClosed { reason }) => {
                for proxy in cache.live() {
                    proxy.core().invalidate(reason.clone());
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::warn!(missed, "endpoint event stream lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
