//! C4 — the sliding-window correlation engine. Given a key schema and a
//! combine strategy, correlates events arriving from two or more sources:
//! each inbound event is combined against every still-live part stored
//! from every *other* source, emitting one record per match, while TTL and
//! join-count limits bound both memory and output volume (spec.md §4.4).

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::Instant;

use confluo_core::{Combine, Record};

use crate::blockstore::block::{Block, BlockPart};
use crate::util::indexed_heap::IndexedHeap;

/// Failures from [`BlockStore::add_data`]. All are surfaced to the caller;
/// none poison the store's global state (spec.md §7).
#[derive(Debug, Error)]
pub enum BlockStoreError {
    #[error("event is missing required key-definition field {field:?}")]
    KeyMissing { field: String },
    #[error("combine strategy failed: {0}")]
    Combine(#[source] anyhow::Error),
    #[error("emit rejected combined record: {0}")]
    Emit(#[source] anyhow::Error),
}

struct StoreState {
    blocks: HashMap<String, Block>,
    heap: IndexedHeap<String, Instant>,
}

/// The sliding-window block store (C4). One instance per `(key schema,
/// combine)` pair, per spec.md §5's "shared resource policy" — unlike the
/// TTL cache it is not shared across keyed domains.
pub struct BlockStore<C> {
    key_definitions: Vec<String>,
    combine: C,
    block_count_soft_limit: usize,
    block_part_max_join_count: u32,
    block_window_ttl: Duration,
    block_part_max_age: Duration,
    state: Arc<Mutex<StoreState>>,
    start: Instant,
    last_accessed_millis: Arc<AtomicU64>,
    shutdown: watch::Sender<bool>,
    worker: Option<tokio::task::JoinHandle<()>>,
}

impl<C: Combine + Send + Sync + 'static> BlockStore<C> {
    /// Constructs the store and starts its background eviction worker,
    /// which wakes once per second (spec.md §4.4).
    #[must_use]
    pub fn new(
        key_definitions: Vec<String>,
        combine: C,
        block_count_soft_limit: usize,
        block_part_max_join_count: u32,
        block_window_ttl: Duration,
        block_part_max_age: Duration,
    ) -> Self {
        let state = Arc::new(Mutex::new(StoreState {
            blocks: HashMap::new(),
            heap: IndexedHeap::new(),
        }));
        let (tx, mut rx) = watch::channel(false);

        let worker_state = Arc::clone(&state);
        let worker = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        evict(&worker_state, block_count_soft_limit);
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
            key_definitions,
            combine,
            block_count_soft_limit,
            block_part_max_join_count,
            block_window_ttl,
            block_part_max_age,
            state,
            start: Instant::now(),
            last_accessed_millis: Arc::new(AtomicU64::new(0)),
            shutdown: tx,
            worker: Some(worker),
        }
    }

    /// Derives the key for `event` by concatenating `string(event[field])
    /// + "|"` for every configured field, in order. Any missing field is a
    /// hard error — partial keys are never permitted.
    fn derive_key(&self, event: &Record) -> Result<String, BlockStoreError> {
        let mut key = String::new();
        for field in &self.key_definitions {
            let value = event.get(field).ok_or_else(|| BlockStoreError::KeyMissing {
                field: field.clone(),
            })?;
            key.push_str(&value_to_key_fragment(value));
            key.push('|');
        }
        Ok(key)
    }

    /// Records an inbound event from `source_id`, combining it against
    /// every live part stored from every other source and invoking `emit`
    /// once per match, in source-order then stored-insertion-order. See
    /// spec.md §4.4 steps 1-7 for the full algorithm this implements.
    pub fn add_data<E>(
        &self,
        source_id: &str,
        event: Record,
        mut emit: E,
    ) -> Result<(), BlockStoreError>
    where
        E: FnMut(Record) -> anyhow::Result<()>,
    {
        self.touch();
        let key = self.derive_key(&event)?;
        let now = Instant::now();

        let mut guard = self.state.lock();
        // Reborrow as a plain `&mut StoreState` so `state.blocks` and
        // `state.heap` are disjoint-field projections of one reference,
        // rather than two overlapping reborrows through the `MutexGuard`'s
        // `DerefMut` (borrow-splitting does not see through a smart
        // pointer, only through a real struct).
        let state = &mut *guard;
        let block = state.blocks.entry(key.clone()).or_insert_with(Block::new);

        let inbound = BlockPart {
            data: event,
            expire_at: now + self.block_part_max_age,
            join_count: 0,
        };
        block.note_source(source_id);
        let source_parts = block.parts_by_source.entry(source_id.to_string()).or_default();
        source_parts.push(inbound);
        let inbound_index = source_parts.len() - 1;

        // Slide the window now, unconditionally: this arrival already
        // happened regardless of whether some unrelated stored part's
        // combine/emit fails below. Only the inbound part's presence is
        // ever left un-rolled-back on failure (spec.md §4.4) -- the
        // window slide is not allowed to be skipped outright.
        state.heap.upsert(key, now + self.block_window_ttl);

        // First-seen order, not `HashMap` iteration order: spec.md's
        // per-call emit ordering must be deterministic once a block has
        // three or more sources.
        let other_sources: Vec<String> = block
            .sources()
            .filter(|s| s.as_str() != source_id)
            .cloned()
            .collect();

        for stored_source in other_sources {
            let stored_parts = block.parts_by_source.remove(&stored_source).unwrap_or_default();
            let mut retained = Vec::with_capacity(stored_parts.len());
            let mut iter = stored_parts.into_iter();
            let mut failure: Option<BlockStoreError> = None;

            for mut stored_part in iter.by_ref() {
                if stored_part.is_expired(now) || stored_part.is_saturated(self.block_part_max_join_count) {
                    // Expired or saturated: drop in place, never combine.
                    continue;
                }

                let inbound_part = &mut block.parts_by_source.get_mut(source_id).expect("inbound source present")[inbound_index];

                match self.combine.combine(
                    &stored_source,
                    &stored_part.data,
                    source_id,
                    &inbound_part.data,
                    &self.key_definitions,
                ) {
                    Ok(result) => {
                        stored_part.join_count += 1;
                        inbound_part.join_count += 1;
                        retained.push(stored_part);
                        if let Err(err) = emit(result) {
                            failure = Some(BlockStoreError::Emit(err));
                            break;
                        }
                    }
                    Err(err) => {
                        retained.push(stored_part);
                        failure = Some(BlockStoreError::Combine(err));
                        break;
                    }
                }
            }

            // Whatever combined successfully plus whatever never got a
            // turn this call stays; only expired/saturated parts are
            // actually dropped.
            retained.extend(iter);
            block.parts_by_source.insert(stored_source, retained);

            if let Some(err) = failure {
                // The inbound part was already appended above and is not
                // rolled back, per spec.md §4.4's failure semantics.
                return Err(err);
            }
        }

        Ok(())
    }

    fn touch(&self) {
        let millis = self.start.elapsed().as_millis() as u64;
        self.last_accessed_millis.store(millis, Ordering::Relaxed);
    }

    /// True iff no [`BlockStore::add_data`] call has occurred for at least
    /// `duration`. Advisory only — read without the store mutex.
    #[must_use]
    pub fn is_idle(&self, duration: Duration) -> bool {
        let last = self.last_accessed_millis.load(Ordering::Relaxed);
        let elapsed_since_last = self.start.elapsed().as_millis() as u64 - last;
        elapsed_since_last >= duration.as_millis() as u64
    }

    /// Current number of live blocks. Exposed for tests and diagnostics.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.state.lock().blocks.len()
    }

    /// Stops the background eviction worker and releases its task handle.
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown.send(true);
        if let Some(worker) = self.worker.take() {
            let _ = worker.await;
        }
    }
}

impl<C> Drop for BlockStore<C> {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

fn value_to_key_fragment(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn evict(state: &Arc<Mutex<StoreState>>, soft_limit: usize) {
    let now = Instant::now();
    let mut guard = state.lock();
    while guard.blocks.len() > soft_limit {
        let should_pop = matches!(guard.heap.peek(), Some((_, evict_at)) if *evict_at < now);
        if !should_pop {
            break;
        }
        if let Some((key, _)) = guard.heap.pop() {
            guard.blocks.remove(&key);
        } else {
            break;
        }
    }
}
