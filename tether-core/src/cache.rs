//! ProxyCache - at most one live proxy per remote-object identity
//!
//! Maps a normalized `ProxyKey` to a weak reference to the proxy
//! representing it. Stale entries (dead weak pointer, or a proxy
//! invalidated earlier in the same scheduler tick) are pruned lazily on
//! lookup; a per-entry watcher task subscribed to the proxy's
//! invalidation broadcast removes entries eagerly. The cache is owned by
//! its factory; there is no process-wide instance.

use crate::proxy::RemoteObject;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tether_model::{OperationError, ProxyKey};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

struct CacheEntry<P> {
    proxy: Weak<P>,
    watcher: JoinHandle<()>,
}

struct CacheInner<P> {
    entries: Mutex<HashMap<ProxyKey, CacheEntry<P>>>,
}

/// Registry guaranteeing at most one valid proxy per identity key.
pub struct ProxyCache<P: RemoteObject> {
    inner: Arc<CacheInner<P>>,
}

impl<P: RemoteObject> Clone for ProxyCache<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: RemoteObject> ProxyCache<P> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(CacheInner {
                entries: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The cached proxy for `key`, only if it is still alive and valid.
    /// An entry whose proxy died or invalidated is pruned and reported
    /// absent.
    pub fn get(&self, key: &ProxyKey) -> Option<Arc<P>> {
        let Ok(mut entries) = self.inner.entries.lock() else {
            return None;
        };
        if !entries.contains_key(key) {
            return None;
        }
        let cached = entries.get(key).and_then(|entry| entry.proxy.upgrade());
        match cached {
            Some(proxy) if proxy.core().is_valid() => Some(proxy),
            _ => {
                // Dead weak pointer, or invalidated during this tick with
                // the watcher not yet run.
                if let Some(stale) = entries.remove(key) {
                    stale.watcher.abort();
                    tracing::debug!(%key, "pruned stale cache entry on lookup");
                }
                None
            }
        }
    }

    /// Insert `proxy` under its own identity key.
    ///
    /// Refuses (with a log, not an error) a proxy with an empty service
    /// identity and a proxy that is already invalid. A different occupant
    /// under the same key is replaced, after detaching its invalidation
    /// watcher so a late signal cannot evict the proxy inserted here.
    pub fn put(&self, proxy: &Arc<P>) {
        let core = proxy.core();
        if core.service().is_empty() {
            tracing::debug!(path = %core.path(), "not caching proxy with no service identity");
            return;
        }
        if !core.is_valid() {
            tracing::debug!(key = %core.key(), "not caching already-invalid proxy");
            return;
        }
        let key = core.key().clone();

        let Ok(mut entries) = self.inner.entries.lock() else {
            tracing::error!(%key, "cache entries poisoned; proxy not cached");
            return;
        };
        if let Some(existing) = entries.get(&key) {
            if let Some(current) = existing.proxy.upgrade() {
                if Arc::ptr_eq(&current, proxy) {
                    return;
                }
            }
            if let Some(replaced) = entries.remove(&key) {
                replaced.watcher.abort();
                tracing::debug!(%key, "replacing dead or invalidated cache occupant");
            }
        }

        let weak = Arc::downgrade(proxy);
        let watcher = tokio::spawn(watch_invalidation(
            Arc::downgrade(&self.inner),
            key.clone(),
            weak.clone(),
            core.subscribe_invalidation(),
        ));
        tracing::debug!(%key, "caching proxy");
        entries.insert(
            key,
            CacheEntry {
                proxy: weak,
                watcher,
            },
        );
    }

    /// Every proxy currently reachable and valid through the cache.
    pub fn live(&self) -> Vec<Arc<P>> {
        let Ok(entries) = self.inner.entries.lock() else {
            return Vec::new();
        };
        entries
            .values()
            .filter_map(|entry| entry.proxy.upgrade())
            .filter(|proxy| proxy.core().is_valid())
            .collect()
    }

    /// Number of entries currently stored, including not-yet-pruned
    /// stale ones.
    pub fn len(&self) -> usize {
        self.inner
            .entries
            .lock()
            .map(|entries| entries.len())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<P: RemoteObject> Default for ProxyCache<P> {
    fn default() -> Self {
        Self::new()
    }
}

/// Waits for a proxy's invalidation (or its drop) and removes the cache
/// entry, provided the entry still points at that same proxy.
async fn watch_invalidation<P: RemoteObject>(
    cache: Weak<CacheInner<P>>,
    key: ProxyKey,
    proxy: Weak<P>,
    mut invalidated: broadcast::Receiver<OperationError>,
) {
    // A closed channel means the proxy was dropped without invalidating;
    // the entry is equally stale either way.
    let _ = invalidated.recv().await;
    let Some(cache) = cache.upgrade() else {
        return;
    };
    let Ok(mut entries) = cache.entries.lock() else {
        return;
    };
    let still_ours = entries
        .get(&key)
        .map(|entry| Weak::ptr_eq(&entry.proxy, &proxy))
        .unwrap_or(false);
    if still_ours {
        entries.remove(&key);
        tracing::debug!(%key, "evicted invalidated proxy from cache");
    }
}
