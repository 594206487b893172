#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;
use tether_core::{Connection, Operation, PendingCall, ProxyBuilder, ProxyCore, RemoteObject};
use tether_model::{Feature, ProxyKey, RemoteEndpoint, ServiceName};
use tether_sim::SimEndpoint;
use tracing_subscriber::EnvFilter;

pub const FEATURE_CORE: Feature = Feature::new("core");
pub const FEATURE_EXTRAS: Feature = Feature::new("extras");

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Fresh sim endpoint plus a connection over it.
pub fn sim_connection() -> (Arc<SimEndpoint>, Arc<Connection>) {
    init_tracing();
    let endpoint = SimEndpoint::new();
    let connection = Connection::new(endpoint.clone() as Arc<dyn RemoteEndpoint>);
    (endpoint, connection)
}

/// Poll until `cond` holds; panics after a second of not holding.
pub async fn wait_until(mut cond: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(1);
    loop {
        if cond() {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not reached within a second");
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
}

/// Test proxy kind: readiness for a feature is one round-trip through
/// the endpoint, so it is genuinely asynchronous.
pub struct EchoProxy {
    core: ProxyCore,
    connection: Arc<Connection>,
}

impl std::fmt::Debug for EchoProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EchoProxy").finish_non_exhaustive()
    }
}

impl EchoProxy {
    pub fn ping(&self, body: Vec<u8>) -> PendingCall {
        self.connection.call(self.core.path().clone(), "ping", body)
    }
}

impl RemoteObject for EchoProxy {
    fn core(&self) -> &ProxyCore {
        &self.core
    }

    fn prepare_feature(&self, feature: Feature) -> Operation {
        self.connection
            .call(
                self.core.path().clone(),
                &format!("prepare/{feature}"),
                Vec::new(),
            )
            .into_operation()
    }
}

/// Builder for `EchoProxy`. Treats an `alias:` prefix on the service
/// name as an alias for the canonical name behind it.
pub struct EchoBuilder;

impl ProxyBuilder for EchoBuilder {
    type Proxy = EchoProxy;

    fn normalize_service(&self, service: &ServiceName) -> ServiceName {
        match service.as_str().strip_prefix("alias:") {
            Some(canonical) => ServiceName::from(canonical),
            None => service.clone(),
        }
    }

    fn build(&self, connection: &Arc<Connection>, key: &ProxyKey) -> Arc<EchoProxy> {
        Arc::new(EchoProxy {
            core: ProxyCore::new(key.clone()),
            connection: Arc::clone(connection),
        })
    }
}
