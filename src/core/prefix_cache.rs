//! Content-addressed index of cached prompt-prefix blocks.
//!
//! Maps a chained hash over a block-aligned prompt prefix to a block that
//! already holds the KV state for that prefix. The index keeps one reference
//! of its own on every cached block, so a block whose only remaining user is
//! the cache (reference count 1) can be reclaimed when the pool runs dry.

use std::collections::HashMap;

use tracing::debug;

use crate::core::block_pool::BlockPool;

#[derive(Debug)]
struct CacheEntry {
    block_index: usize,
    last_used: u64,
}

/// Prefix-cache index with least-recently-used reclamation.
///
/// Recency is tracked with a monotonic counter bumped on every hit, not with
/// wall-clock time, so scheduling stays deterministic under replay.
#[derive(Debug, Default)]
pub struct PrefixCacheIndex {
    entries: HashMap<u64, CacheEntry>,
    clock: u64,
}

impl PrefixCacheIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of cached prefixes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, hash: u64) -> bool {
        self.entries.contains_key(&hash)
    }

    /// Look up a cached block for `hash`.
    ///
    /// On a hit the block gains a reference for the caller and its recency is
    /// refreshed.
    pub fn lookup(&mut self, hash: u64, pool: &mut BlockPool) -> Option<usize> {
        self.clock += 1;
        let entry = self.entries.get_mut(&hash)?;
        entry.last_used = self.clock;
        pool.increment_ref(entry.block_index);
        Some(entry.block_index)
    }

    /// Record a block as holding the prefix identified by `hash`.
    ///
    /// The index takes a reference of its own; the block stays reclaimable
    /// (not freeable) after every sequence using it has released it.
    pub fn insert(&mut self, hash: u64, block_index: usize, pool: &mut BlockPool) {
        if self.entries.contains_key(&hash) {
            return;
        }
        self.clock += 1;
        pool.increment_ref(block_index);
        pool.block_mut(block_index).set_content_hash(hash);
        self.entries.insert(
            hash,
            CacheEntry {
                block_index,
                last_used: self.clock,
            },
        );
    }

    /// Number of cached blocks no sequence references anymore.
    pub fn num_evictable(&self, pool: &BlockPool) -> usize {
        self.entries
            .values()
            .filter(|entry| pool.ref_count(entry.block_index) == 1)
            .count()
    }

    /// Reclaim the least-recently-used cached-only block.
    ///
    /// Returns the freed block's index, or `None` when every cached block is
    /// still referenced by a sequence.
    pub fn evict_lru(&mut self, pool: &mut BlockPool) -> Option<usize> {
        let hash = self
            .entries
            .iter()
            .filter(|(_, entry)| pool.ref_count(entry.block_index) == 1)
            .min_by_key(|(_, entry)| entry.last_used)
            .map(|(&hash, _)| hash)?;
        let entry = self.entries.remove(&hash).expect("entry vanished");
        pool.free(entry.block_index);
        debug!(block = entry.block_index, "evicted cached prefix block");
        Some(entry.block_index)
    }
}
