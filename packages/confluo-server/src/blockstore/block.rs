//! `Block` and `BlockPart`, the per-key correlation state owned by a
//! [`crate::blockstore::store::BlockStore`] (spec.md §3/§4.4).

use std::collections::HashMap;
use tokio::time::Instant;

use confluo_core::Record;

/// A single inbound event wrapped for lifetime and combine-usage tracking.
/// `join_count` never exceeds the store's configured
/// `block_part_max_join_count` for any part still reachable from a block.
#[derive(Debug, Clone)]
pub struct BlockPart {
    pub data: Record,
    pub expire_at: Instant,
    pub join_count: u32,
}

impl BlockPart {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expire_at
    }

    pub fn is_saturated(&self, max_join_count: u32) -> bool {
        self.join_count >= max_join_count
    }
}

/// One key's correlation state: the parts seen from each source, ordered by
/// arrival, plus the sliding eviction deadline that resets on every new
/// arrival for this key.
///
/// `source_order` records each source id's first-seen position
/// independently of `parts_by_source` (a plain `HashMap`, whose key
/// iteration order is randomized and unstable across runs): spec.md §5
/// requires `emit` to be invoked in deterministic source-order within one
/// `AddData` call, which a `HashMap::keys()` walk cannot guarantee once a
/// block has three or more sources.
#[derive(Debug, Clone, Default)]
pub struct Block {
    pub parts_by_source: HashMap<String, Vec<BlockPart>>,
    source_order: Vec<String>,
}

impl Block {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `source_id` as seen, if it is the first time this block
    /// has observed it. Call this whenever a part is appended for a
    /// source, before relying on [`Block::sources`] for ordering.
    pub fn note_source(&mut self, source_id: &str) {
        if !self.source_order.iter().any(|s| s == source_id) {
            self.source_order.push(source_id.to_string());
        }
    }

    /// Sources in first-seen order, not `HashMap` iteration order.
    pub fn sources(&self) -> impl Iterator<Item = &String> {
        self.source_order.iter()
    }
}
