//! Tests for ProxyFactory, ProxyCache and the readiness pipeline

mod common;

use common::{sim_connection, wait_until, EchoBuilder, EchoProxy, FEATURE_CORE, FEATURE_EXTRAS};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tether_core::{
    Connection, Operation, ProxyBuilder, ProxyCache, ProxyCore, ProxyFactory, RemoteObject,
};
use tether_model::{error_kind, ObjectPath, OperationError, ProxyKey, ServiceName};

fn svc(name: &str) -> ServiceName {
    ServiceName::from(name)
}

fn path(p: &str) -> ObjectPath {
    ObjectPath::from(p)
}

#[tokio::test]
async fn acquire_constructs_and_readies_a_proxy() {
    let (endpoint, connection) = sim_connection();
    let factory = ProxyFactory::new(connection, EchoBuilder);

    let pending = factory.acquire(&svc("svc.a"), &path("/obj1"), &[FEATURE_CORE]);
    let proxy = pending.ready().await.expect("readiness failed");

    assert!(proxy.core().is_valid());
    assert!(proxy.core().is_ready(&[FEATURE_CORE]));
    assert!(!proxy.core().is_ready(&[FEATURE_EXTRAS]));
    assert!(endpoint
        .calls()
        .contains(&("/obj1".to_string(), "prepare/core".to_string())));
}

#[tokio::test]
async fn repeated_acquire_reuses_the_cached_proxy() {
    let (_endpoint, connection) = sim_connection();
    let factory = ProxyFactory::new(connection, EchoBuilder);

    let first = factory.acquire(&svc("svc.a"), &path("/obj1"), &[FEATURE_CORE]);
    let first_proxy = first.ready().await.expect("readiness failed");

    let second = factory.acquire(&svc("svc.a"), &path("/obj1"), &[FEATURE_CORE]);
    assert!(Arc::ptr_eq(first.proxy(), second.proxy()));
    // Reused proxy is already ready; the operation completes without
    // re-preparing anything.
    assert!(second.ready().await.is_ok());
    assert!(Arc::ptr_eq(&first_proxy, second.proxy()));

    let other = factory.acquire(&svc("svc.a"), &path("/obj2"), &[]);
    assert!(!Arc::ptr_eq(first.proxy(), other.proxy()));
}

#[tokio::test]
async fn concurrent_acquires_observe_the_same_instance() {
    let (endpoint, connection) = sim_connection();
    endpoint.set_reply_delay(Duration::from_millis(30));
    let factory = ProxyFactory::new(connection, EchoBuilder);

    // Second acquire lands while the first readiness wait is in flight.
    let first = factory.acquire(&svc("svc.a"), &path("/obj1"), &[FEATURE_CORE]);
    let second = factory.acquire(&svc("svc.a"), &path("/obj1"), &[FEATURE_CORE]);
    assert!(Arc::ptr_eq(first.proxy(), second.proxy()));
    assert!(!first.operation().is_finished());

    assert!(first.ready().await.is_ok());
    assert!(second.ready().await.is_ok());
    // The feature was prepared once, not once per acquire.
    let prepares = endpoint
        .calls()
        .iter()
        .filter(|(_, member)| member == "prepare/core")
        .count();
    assert_eq!(prepares, 1);
}

#[tokio::test]
async fn aliases_normalize_to_one_cache_entry() {
    let (_endpoint, connection) = sim_connection();
    let factory = ProxyFactory::new(connection, EchoBuilder);

    let canonical = factory.acquire(&svc("svc.a"), &path("/obj1"), &[]);
    let aliased = factory.acquire(&svc("alias:svc.a"), &path("/obj1"), &[]);

    assert!(Arc::ptr_eq(canonical.proxy(), aliased.proxy()));
    assert_eq!(aliased.proxy().core().service(), &svc("svc.a"));
}

#[tokio::test]
async fn empty_feature_set_waits_for_nothing() {
    let (endpoint, connection) = sim_connection();
    let factory = ProxyFactory::new(connection, EchoBuilder);

    let pending = factory.acquire(&svc("svc.a"), &path("/obj1"), &[]);
    pending.ready().await.expect("must succeed");

    let prepares = endpoint
        .calls()
        .iter()
        .filter(|(_, member)| member.starts_with("prepare/"))
        .count();
    assert_eq!(prepares, 0);
}

#[tokio::test]
async fn invalidation_during_readiness_fails_the_operation_and_evicts() {
    let (endpoint, connection) = sim_connection();
    endpoint.set_reply_delay(Duration::from_millis(50));
    let factory = ProxyFactory::new(connection, EchoBuilder);

    let pending = factory.acquire(&svc("svc.a"), &path("/obj1"), &[FEATURE_CORE]);
    let proxy = Arc::clone(pending.proxy());

    // Let the pipeline reach its feature wait; the prepare reply is
    // still half a tick of delay away.
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert!(!pending.operation().is_finished());

    proxy
        .core()
        .invalidate(OperationError::new(error_kind::OBJECT_REMOVED, "torn down"));

    let err = pending.ready().await.expect_err("readiness must fail");
    assert_eq!(err.kind(), error_kind::OBJECT_REMOVED);

    // The invalidated proxy is gone from the cache: a fresh acquire
    // builds a new instance.
    wait_until(|| factory.cached(&svc("svc.a"), &path("/obj1")).is_none()).await;
    let fresh = factory.acquire(&svc("svc.a"), &path("/obj1"), &[]);
    assert!(!Arc::ptr_eq(&proxy, fresh.proxy()));
}

#[tokio::test]
async fn invalidation_is_idempotent() {
    let (_endpoint, connection) = sim_connection();
    let factory = ProxyFactory::new(connection, EchoBuilder);

    let pending = factory.acquire(&svc("svc.a"), &path("/obj1"), &[]);
    let proxy = pending.ready().await.expect("readiness failed");

    proxy
        .core()
        .invalidate(OperationError::new(error_kind::OBJECT_REMOVED, "first"));
    proxy
        .core()
        .invalidate(OperationError::not_available("second, ignored"));

    let reason = proxy.core().invalidation_reason().expect("must be invalid");
    assert_eq!(reason.kind(), error_kind::OBJECT_REMOVED);
    assert_eq!(reason.message(), "first");
    wait_until(|| factory.cached(&svc("svc.a"), &path("/obj1")).is_none()).await;
}

#[tokio::test]
async fn object_lost_event_invalidates_the_matching_proxy() {
    let (endpoint, connection) = sim_connection();
    let factory = ProxyFactory::new(connection, EchoBuilder);

    let pending = factory.acquire(&svc("svc.a"), &path("/obj1"), &[]);
    let proxy = pending.ready().await.expect("readiness failed");
    let bystander = factory.acquire(&svc("svc.a"), &path("/obj2"), &[]);
    let bystander = bystander.ready().await.expect("readiness failed");

    endpoint.emit_object_lost(
        "svc.a",
        "/obj1",
        OperationError::new(error_kind::OBJECT_REMOVED, "remote teardown"),
    );

    wait_until(|| !proxy.core().is_valid()).await;
    assert!(bystander.core().is_valid());
}

#[tokio::test]
async fn endpoint_closed_event_invalidates_every_cached_proxy() {
    let (endpoint, connection) = sim_connection();
    let factory = ProxyFactory::new(connection, EchoBuilder);

    let one = factory.acquire(&svc("svc.a"), &path("/obj1"), &[]);
    let one = one.ready().await.expect("readiness failed");
    let two = factory.acquire(&svc("svc.b"), &path("/obj2"), &[]);
    let two = two.ready().await.expect("readiness failed");

    endpoint.emit_endpoint_closed(OperationError::new(error_kind::ENDPOINT_LOST, "gone"));

    wait_until(|| !one.core().is_valid() && !two.core().is_valid()).await;
    assert_eq!(
        one.core().invalidation_reason().map(|r| r.kind().to_string()),
        Some(error_kind::ENDPOINT_LOST.to_string())
    );
}

#[tokio::test]
async fn failed_feature_preparation_fails_readiness_but_returns_the_proxy() {
    let (endpoint, connection) = sim_connection();
    endpoint.script_call(
        "/obj1",
        "prepare/core",
        Err(OperationError::not_available("introspection refused")),
    );
    let factory = ProxyFactory::new(connection, EchoBuilder);

    let pending = factory.acquire(&svc("svc.a"), &path("/obj1"), &[FEATURE_CORE]);
    // The proxy itself is handed out regardless of how readiness ends.
    assert!(pending.proxy().core().is_valid());

    let err = pending.ready().await.expect_err("readiness must fail");
    assert_eq!(err.kind(), error_kind::NOT_AVAILABLE);
    assert!(!pending.proxy().core().is_ready(&[FEATURE_CORE]));
}

#[tokio::test]
async fn cache_refuses_invalid_and_identityless_proxies() {
    let (_endpoint, connection) = sim_connection();
    let cache: ProxyCache<EchoProxy> = ProxyCache::new();
    let builder = EchoBuilder;

    let nameless = builder.build(
        &connection,
        &ProxyKey::new(svc(""), path("/obj1")),
    );
    cache.put(&nameless);
    assert!(cache.is_empty());

    let invalid = builder.build(&connection, &ProxyKey::new(svc("svc.a"), path("/obj1")));
    invalid
        .core()
        .invalidate(OperationError::not_available("dead on arrival"));
    cache.put(&invalid);
    assert!(cache.is_empty());
}

#[tokio::test]
async fn replacing_an_invalidated_occupant_detaches_its_watcher() {
    let (_endpoint, connection) = sim_connection();
    let cache: ProxyCache<EchoProxy> = ProxyCache::new();
    let builder = EchoBuilder;
    let key = ProxyKey::new(svc("svc.a"), path("/obj1"));

    let old = builder.build(&connection, &key);
    cache.put(&old);
    assert!(Arc::ptr_eq(&cache.get(&key).expect("cached"), &old));

    // Invalidate and, within the same tick, replace with a fresh proxy.
    // The old proxy's invalidation signal has not been processed yet.
    old.core()
        .invalidate(OperationError::not_available("stale"));
    let new = builder.build(&connection, &key);
    cache.put(&new);

    // Give the detached watcher every chance to misbehave.
    tokio::time::sleep(Duration::from_millis(20)).await;
    let occupant = cache.get(&key).expect("new proxy must stay cached");
    assert!(Arc::ptr_eq(&occupant, &new));
}

#[tokio::test]
async fn dropped_proxies_are_pruned_on_lookup() {
    let (_endpoint, connection) = sim_connection();
    let cache: ProxyCache<EchoProxy> = ProxyCache::new();
    let key = ProxyKey::new(svc("svc.a"), path("/obj1"));

    let proxy = EchoBuilder.build(&connection, &key);
    cache.put(&proxy);
    drop(proxy);

    assert!(cache.get(&key).is_none());
    assert!(cache.is_empty());
}

/// Builder whose hooks record their execution order.
struct HookBuilder {
    log: Arc<Mutex<Vec<&'static str>>>,
}

struct HookProxy {
    core: ProxyCore,
    log: Arc<Mutex<Vec<&'static str>>>,
}

impl RemoteObject for HookProxy {
    fn core(&self) -> &ProxyCore {
        &self.core
    }

    fn prepare_feature(&self, _feature: tether_model::Feature) -> Operation {
        if let Ok(mut log) = self.log.lock() {
            log.push("feature");
        }
        Operation::succeeded()
    }
}

impl ProxyBuilder for HookBuilder {
    type Proxy = HookProxy;

    fn build(&self, _connection: &Arc<Connection>, key: &ProxyKey) -> Arc<HookProxy> {
        Arc::new(HookProxy {
            core: ProxyCore::new(key.clone()),
            log: Arc::clone(&self.log),
        })
    }

    fn initial_prepare(&self, proxy: &Arc<HookProxy>) -> Option<Operation> {
        if let Ok(mut log) = proxy.log.lock() {
            log.push("pre");
        }
        Some(Operation::succeeded())
    }

    fn ready_prepare(&self, proxy: &Arc<HookProxy>) -> Option<Operation> {
        if let Ok(mut log) = proxy.log.lock() {
            log.push("post");
        }
        Some(Operation::succeeded())
    }
}

#[tokio::test]
async fn readiness_pipeline_runs_hooks_in_order() {
    let (_endpoint, connection) = sim_connection();
    let log = Arc::new(Mutex::new(Vec::new()));
    let factory = ProxyFactory::new(connection, HookBuilder { log: Arc::clone(&log) });

    let pending = factory.acquire(&svc("svc.a"), &path("/obj1"), &[FEATURE_CORE]);
    pending.ready().await.expect("pipeline failed");

    let recorded = log.lock().expect("log poisoned").clone();
    assert_eq!(recorded, vec!["pre", "feature", "post"]);
}
