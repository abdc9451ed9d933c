//! C2 — wraps an arbitrary backend so that named reads are served
//! cache-aside and named writes invalidate exactly the cache entries they
//! could have changed.
//!
//! Per spec.md §9's design note, this is the direct-typed-methods
//! replacement for the original's reflection-based dynamic dispatch: each
//! repository in `crate::repo` calls [`CachedWrapper::build_cache_key`],
//! [`CachedWrapper::get_cached_with_ttl`], and
//! [`CachedWrapper::invalidate_method`]/[`CachedWrapper::invalidate_method_prefix`]
//! directly rather than going through any reflection layer. Only the
//! per-method config table and the key registry survive from the original
//! design, exactly as spec.md §9 directs.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::{DashMap, DashSet};
use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::cache::ttl::TtlCache;

/// Per-method override: TTL and whether the method is cached at all.
#[derive(Debug, Clone, Copy)]
pub struct MethodConfig {
    pub ttl: Duration,
    pub cacheable: bool,
}

/// Wraps a backend `B` with cache-aside reads and write-through
/// invalidation. `B` is the concrete repository backend type — no trait
/// object is needed because each repository wraps its own backend,
/// matching spec.md §9's direction away from reflection-based dispatch.
pub struct CachedWrapper<B> {
    backend: B,
    cache: Arc<TtlCache>,
    method_config: DashMap<&'static str, MethodConfig>,
    key_registry: DashMap<(&'static str, String), DashSet<String>>,
}

impl<B> CachedWrapper<B> {
    pub fn new(backend: B, cache: Arc<TtlCache>) -> Self {
        Self {
            backend,
            cache,
            method_config: DashMap::new(),
            key_registry: DashMap::new(),
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Per-method override. `cacheable = false` means execution bypasses
    /// the cache entirely for that method.
    pub fn set_method_config(&self, method: &'static str, ttl: Duration, cacheable: bool) {
        self.method_config.insert(method, MethodConfig { ttl, cacheable });
    }

    fn config_for(&self, method: &str) -> Option<MethodConfig> {
        self.method_config.get(method).map(|c| *c)
    }

    /// Deterministic cache key: canonical-JSON-encode `{method, args}`,
    /// SHA-256 it, render the first 8 bytes as hex, and prefix with the
    /// method name (`"{method}:{hex}"`). If `args` is non-empty, the
    /// produced key is also recorded under the registry entry
    /// `(method, args[0])` so [`CachedWrapper::invalidate_method_prefix`]
    /// can locate it without scanning the whole cache.
    pub fn build_cache_key<A: Serialize>(&self, method: &'static str, args: &[A]) -> String {
        let args_value: Vec<Value> = args
            .iter()
            .map(|a| serde_json::to_value(a).unwrap_or(Value::Null))
            .collect();
        let key = hash_method_args(method, &args_value);

        if let Some(first) = args_value.first() {
            let first_arg = canonical_string(first);
            self.key_registry
                .entry((method, first_arg))
                .or_default()
                .insert(key.clone());
        }

        key
    }

    /// Cache-aside with an explicit TTL: return the cached value on hit;
    /// on miss, call `fetch` and cache its `Ok(Some(_))` result. `fetch`
    /// errors are propagated and never cached, per spec.md §4.1/§4.2.
    pub async fn get_cached_with_ttl<V, F, Fut>(
        &self,
        key: &str,
        ttl: Duration,
        fetch: F,
    ) -> anyhow::Result<Option<Arc<V>>>
    where
        V: Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Option<V>>>,
    {
        self.cache.get_create_or_update(key, Some(ttl), fetch).await
    }

    /// Same as [`CachedWrapper::get_cached_with_ttl`] but uses the cache's
    /// configured default TTL.
    pub async fn get_cached<V, F, Fut>(&self, key: &str, fetch: F) -> anyhow::Result<Option<Arc<V>>>
    where
        V: Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Option<V>>>,
    {
        let ttl = self.cache.default_ttl();
        self.get_cached_with_ttl(key, ttl, fetch).await
    }

    /// Typed convenience layered over [`CachedWrapper::get_cached_with_ttl`]:
    /// builds the cache key from `(method, args)`, applies the method's
    /// configured TTL (or `default_ttl` if unconfigured), and bypasses the
    /// cache entirely when the method is configured `cacheable = false`.
    pub async fn call_cached<V, A, F, Fut>(
        &self,
        method: &'static str,
        args: &[A],
        fetch: F,
    ) -> anyhow::Result<Option<Arc<V>>>
    where
        V: Send + Sync + 'static,
        A: Serialize,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Option<V>>>,
    {
        let config = self.config_for(method);
        if let Some(MethodConfig { cacheable: false, .. }) = config {
            return fetch().await;
        }

        let key = self.build_cache_key(method, args);
        let ttl = config.map_or_else(|| self.cache.default_ttl(), |c| c.ttl);
        self.get_cached_with_ttl(&key, ttl, fetch).await
    }

    /// Computes the exact cache key for `(method, args)` and deletes it.
    pub fn invalidate_method<A: Serialize>(&self, method: &'static str, args: &[A]) {
        let args_value: Vec<Value> = args
            .iter()
            .map(|a| serde_json::to_value(a).unwrap_or(Value::Null))
            .collect();
        let key = hash_method_args(method, &args_value);
        self.cache.delete(&key);
    }

    /// With no `prefix_args`, deletes every key beginning with
    /// `"{method}:"`. With `prefix_args`, deletes every key registered
    /// under `(method, prefix_args[0])` and drops that registry entry.
    pub fn invalidate_method_prefix<A: Serialize>(&self, method: &'static str, prefix_args: &[A]) {
        if prefix_args.is_empty() {
            self.cache.delete_by_prefix(&format!("{method}:"));
            return;
        }

        let first_value = serde_json::to_value(&prefix_args[0]).unwrap_or(Value::Null);
        let first_arg = canonical_string(&first_value);
        if let Some((_, keys)) = self.key_registry.remove(&(method, first_arg)) {
            for key in keys {
                self.cache.delete(&key);
            }
        }
    }
}

fn hash_method_args(method: &str, args: &[Value]) -> String {
    let canonical = serde_json::json!({ "method": method, "args": args });
    let encoded = serde_json::to_vec(&canonical).expect("json values always serialize");
    let digest = Sha256::digest(&encoded);
    format!("{method}:{}", hex::encode(&digest[..8]))
}

fn canonical_string(value: &Value) -> String {
    value.as_str().map_or_else(|| value.to_string(), str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn cache() -> Arc<TtlCache> {
        Arc::new(TtlCache::new(Duration::from_secs(60), Duration::from_millis(20)))
    }

    #[tokio::test]
    async fn build_cache_key_is_deterministic() {
        let wrapper = CachedWrapper::new((), cache());
        let k1 = wrapper.build_cache_key("findUserByID", &["u1"]);
        let k2 = wrapper.build_cache_key("findUserByID", &["u1"]);
        assert_eq!(k1, k2);
        assert!(k1.starts_with("findUserByID:"));
    }

    #[tokio::test]
    async fn build_cache_key_differs_by_args() {
        let wrapper = CachedWrapper::new((), cache());
        let k1 = wrapper.build_cache_key("findUserByID", &["u1"]);
        let k2 = wrapper.build_cache_key("findUserByID", &["u2"]);
        assert_ne!(k1, k2);
    }

    #[tokio::test]
    async fn call_cached_hits_cache_on_second_call() {
        let wrapper = CachedWrapper::new((), cache());
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let calls = Arc::clone(&calls);
            wrapper
                .call_cached("findUserByID", &["u1"], || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Some("alice".to_string()))
                })
                .await
                .unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn non_cacheable_method_always_calls_fetch() {
        let wrapper = CachedWrapper::new((), cache());
        wrapper.set_method_config("similaritySearch", Duration::from_secs(60), false);
        let calls = Arc::new(AtomicUsize::new(0));

        for _ in 0..2 {
            let calls = Arc::clone(&calls);
            wrapper
                .call_cached("similaritySearch", &["q"], || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(Some(vec![1, 2, 3]))
                })
                .await
                .unwrap();
        }

        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalidate_method_forces_refetch() {
        let wrapper = CachedWrapper::new((), cache());
        let calls = Arc::new(AtomicUsize::new(0));

        let fetch_one = {
            let calls = Arc::clone(&calls);
            || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Some("v1".to_string()))
            }
        };
        wrapper.call_cached("findUserByID", &["u1"], fetch_one).await.unwrap();

        wrapper.invalidate_method("findUserByID", &["u1"]);

        let fetch_two = {
            let calls = Arc::clone(&calls);
            || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(Some("v2".to_string()))
            }
        };
        let v = wrapper
            .call_cached("findUserByID", &["u1"], fetch_two)
            .await
            .unwrap();

        assert_eq!(v.unwrap().as_str(), "v2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn invalidate_prefix_with_no_args_clears_whole_method() {
        let wrapper = CachedWrapper::new((), cache());
        wrapper
            .call_cached("findProviders", &["u1", "p1"], || async { Ok(Some(1i32)) })
            .await
            .unwrap();
        wrapper
            .call_cached("findProviders", &["u2", "p2"], || async { Ok(Some(2i32)) })
            .await
            .unwrap();

        wrapper.invalidate_method_prefix::<&str>("findProviders", &[]);

        let calls = Arc::new(AtomicUsize::new(0));
        let calls2 = Arc::clone(&calls);
        wrapper
            .call_cached("findProviders", &["u1", "p1"], || async move {
                calls2.fetch_add(1, Ordering::SeqCst);
                Ok(Some(9i32))
            })
            .await
            .unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalidate_prefix_by_first_arg_only_touches_matching_keys() {
        let wrapper = CachedWrapper::new((), cache());
        wrapper
            .call_cached("findStateFull", &["s1", "extra"], || async { Ok(Some(1i32)) })
            .await
            .unwrap();
        wrapper
            .call_cached("findStateFull", &["s2", "extra"], || async { Ok(Some(2i32)) })
            .await
            .unwrap();

        wrapper.invalidate_method_prefix("findStateFull", &["s1"]);

        let calls_s1 = Arc::new(AtomicUsize::new(0));
        let calls_s1_2 = Arc::clone(&calls_s1);
        wrapper
            .call_cached("findStateFull", &["s1", "extra"], || async move {
                calls_s1_2.fetch_add(1, Ordering::SeqCst);
                Ok(Some(9i32))
            })
            .await
            .unwrap();
        assert_eq!(calls_s1.load(Ordering::SeqCst), 1);

        let calls_s2 = Arc::new(AtomicUsize::new(0));
        let calls_s2_2 = Arc::clone(&calls_s2);
        wrapper
            .call_cached("findStateFull", &["s2", "extra"], || async move {
                calls_s2_2.fetch_add(1, Ordering::SeqCst);
                Ok(Some(9i32))
            })
            .await
            .unwrap();
        assert_eq!(calls_s2.load(Ordering::SeqCst), 0);
    }
}
