//! C1 — a process-local, thread-safe key/value store with per-entry TTL,
//! amortized `O(log n)` eviction, and a single-flight `get_create_or_update`
//! that collapses concurrent misses on the same key into one `fetch` call.
//!
//! Storage is a `HashMap<String, Entry>` plus an [`IndexedHeap`] ordered by
//! `evict_at`, both guarded by one `parking_lot::RwLock` (spec.md §4.1/§5:
//! reads take the read lock, mutations take the write lock). A background
//! task wakes on `cleanup_interval`, peeks the heap root under the read
//! lock, and upgrades to the write lock only when the root has actually
//! expired.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;

use crate::util::indexed_heap::IndexedHeap;

type ErasedValue = Arc<dyn Any + Send + Sync>;

struct Entry {
    value: ErasedValue,
    evict_at: Instant,
}

#[derive(Default)]
struct State {
    entries: HashMap<String, Entry>,
    heap: IndexedHeap<String, Instant>,
}

/// The TTL cache (C1). Cloning is cheap — `TtlCache` is a thin handle over
/// `Arc`-shared state, matching the teacher's convention of cheaply
/// cloneable service handles (e.g. `ServiceRegistry`'s `Arc<dyn ...>`
/// entries).
pub struct TtlCache {
    state: Arc<RwLock<State>>,
    in_flight: Arc<DashMap<String, Arc<Notify>>>,
    default_ttl: Duration,
    shutdown: watch::Sender<bool>,
    worker: Option<tokio::task::JoinHandle<()>>,
}

impl TtlCache {
    /// Creates a cache with the given default TTL and starts its
    /// background eviction worker, woken every `cleanup_interval`.
    #[must_use]
    pub fn new(default_ttl: Duration, cleanup_interval: Duration) -> Self {
        let state = Arc::new(RwLock::new(State::default()));
        let (tx, mut rx) = watch::channel(false);

        let worker_state = Arc::clone(&state);
        let worker = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cleanup_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        evict_expired(&worker_state);
                    }
                    _ = rx.changed() => {
                        if *rx.borrow() {
                            break;
                        }
                    }
                }
            }
        });

        Self {
            state,
            in_flight: Arc::new(DashMap::new()),
            default_ttl,
            shutdown: tx,
            worker: Some(worker),
        }
    }

    /// The default TTL new entries receive when `Set` is called with
    /// `ttl = None` (or zero, per spec.md §4.1).
    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// Returns the cached value for `key` if present and unexpired, typed
    /// as `V`. A downcast mismatch is treated identically to a miss
    /// (spec.md §7, Cache-miss-with-type-mismatch).
    pub fn get<V: Send + Sync + 'static>(&self, key: &str) -> Option<Arc<V>> {
        let state = self.state.read();
        let entry = state.entries.get(key)?;
        if entry.evict_at <= Instant::now() {
            return None;
        }
        entry.value.clone().downcast::<V>().ok()
    }

    /// True iff `key` has a live, unexpired entry, without needing to know
    /// its value type. Used by callers (e.g. the route layer's per-subject
    /// channel reaper) that only need to know liveness, not the value
    /// itself.
    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        let state = self.state.read();
        state.entries.get(key).is_some_and(|entry| entry.evict_at > Instant::now())
    }

    /// Upserts `key`, overwriting any prior value and resetting its
    /// eviction position. `ttl = None` uses [`TtlCache::default_ttl`].
    pub fn set<V: Send + Sync + 'static>(&self, key: &str, value: V, ttl: Option<Duration>) {
        self.set_arc(key, Arc::new(value), ttl);
    }

    fn set_arc(&self, key: &str, value: ErasedValue, ttl: Option<Duration>) {
        let evict_at = Instant::now() + ttl.unwrap_or(self.default_ttl);
        let mut state = self.state.write();
        state.entries.insert(key.to_string(), Entry { value, evict_at });
        state.heap.upsert(key.to_string(), evict_at);
    }

    /// Idempotent removal.
    pub fn delete(&self, key: &str) {
        let mut state = self.state.write();
        state.entries.remove(key);
        state.heap.remove(&key.to_string());
    }

    /// Removes every entry whose key begins with `prefix`.
    pub fn delete_by_prefix(&self, prefix: &str) {
        let mut state = self.state.write();
        let matching: Vec<String> = state
            .entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        for key in matching {
            state.entries.remove(&key);
            state.heap.remove(&key);
        }
    }

    /// Removes every entry.
    pub fn clear(&self) {
        let mut state = self.state.write();
        state.entries.clear();
        state.heap = IndexedHeap::new();
    }

    /// Single-flight cache-aside primitive. Returns the cached value if
    /// present and unexpired; otherwise calls `fetch` exactly once across
    /// any concurrently-waiting callers for the same `key`, caches a
    /// `Some` result (a `None` result is returned but never cached), and
    /// propagates a `fetch` error to every waiter without caching
    /// anything.
    pub async fn get_create_or_update<V, F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        fetch: F,
    ) -> anyhow::Result<Option<Arc<V>>>
    where
        V: Send + Sync + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<Option<V>>>,
    {
        if let Some(v) = self.get::<V>(key) {
            return Ok(Some(v));
        }

        loop {
            let notify = match self.in_flight.entry(key.to_string()) {
                dashmap::mapref::entry::Entry::Occupied(occupied) => Some(occupied.get().clone()),
                dashmap::mapref::entry::Entry::Vacant(vacant) => {
                    vacant.insert(Arc::new(Notify::new()));
                    None
                }
            };

            match notify {
                Some(existing) => {
                    // Someone else is already fetching this key. Build the
                    // `Notified` future *before* re-checking the cache: the
                    // leader may finish and call `notify_waiters()` between
                    // our clone of `existing` and this point, and
                    // `notify_waiters` buffers no permit for a future not
                    // yet created, so a waiter that calls `.notified()`
                    // only after that window would wait forever. Checking
                    // the cache only after the future already exists means
                    // a leader that finished in that window is caught
                    // here instead.
                    let notified = existing.notified();
                    if let Some(v) = self.get::<V>(key) {
                        return Ok(Some(v));
                    }
                    notified.await;
                    if let Some(v) = self.get::<V>(key) {
                        return Ok(Some(v));
                    }
                    continue;
                }
                None => {
                    // We are the leader for this key. The in-flight entry
                    // stays Occupied until the cache write below is
                    // visible -- removing it any earlier would let a
                    // third caller's `entry(key)` see Vacant and become a
                    // second leader before `fetch` has actually been
                    // cached (spec.md §8's single-flight invariant).
                    let result = fetch().await;

                    let outcome = match result {
                        Ok(Some(value)) => {
                            let arc = Arc::new(value);
                            self.set_arc(key, arc.clone(), ttl);
                            Ok(Some(arc))
                        }
                        Ok(None) => Ok(None),
                        Err(err) => Err(err),
                    };

                    if let Some((_, leader_notify)) = self.in_flight.remove(key) {
                        leader_notify.notify_waiters();
                    }

                    return outcome;
                }
            }
        }
    }

    /// Stops the background eviction worker. Idempotent.
    pub async fn close(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
    }
}

impl Drop for TtlCache {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

fn evict_expired(state: &Arc<RwLock<State>>) {
    loop {
        let expired_key = {
            let guard = state.read();
            match guard.heap.peek() {
                Some((key, evict_at)) if *evict_at <= Instant::now() => Some(key.clone()),
                _ => None,
            }
        };

        let Some(key) = expired_key else { break };

        let mut guard = state.write();
        // Re-check under the write lock: the root may have been refreshed
        // by a concurrent `Set` between the peek above and this lock.
        match guard.heap.peek() {
            Some((root_key, evict_at)) if *root_key == key && *evict_at <= Instant::now() => {
                guard.heap.pop();
                guard.entries.remove(&key);
            }
            _ => break,
        }
    }
}
