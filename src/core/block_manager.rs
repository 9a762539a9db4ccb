//! Block manager for the paged KV cache.
//!
//! Owns the [`BlockPool`], the optional [`PrefixCacheIndex`], and one
//! [`BlockTable`] per sequence. Every allocation, sharing, copy-on-write and
//! release decision funnels through here; the scheduler only asks questions
//! and requests transitions.
//!
//! ## Copy-on-write
//!
//! Sibling sequences of a beam group share prefix blocks by reference count.
//! When a sequence must write a new slot into a shared tail block, the
//! manager allocates a fresh destination block, records the
//! `source -> destination` pair in the copy plan and swaps its table entry.
//! The executor materializes the recorded copies in cache memory before the
//! forward pass. When siblings grow past a shared tail instead, each gets one
//! fresh tail block seeded by a copy of the shared ancestor.

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::debug;

use crate::core::block::{blocks_needed_for, chained_prompt_hash, BlockTable};
use crate::core::block_pool::BlockPool;
use crate::core::prefix_cache::PrefixCacheIndex;
use crate::core::sequence::{Sequence, SequenceGroup, SequenceId};
use crate::error::{Error, Result};

/// Plan of physical block copies the executor must perform before a step:
/// source block index to destination block indices.
pub type BlockCopyPlan = BTreeMap<usize, Vec<usize>>;

/// Occupancy counters for metrics and invariant checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockManagerStats {
    /// Blocks on the pool free list.
    pub num_free_blocks: usize,
    /// Cached blocks no sequence references, reclaimable on demand.
    pub num_reclaimable_blocks: usize,
    /// Sum of reference counts over all live blocks.
    pub total_live_refs: usize,
    /// Sum of block-table lengths over all sequences.
    pub total_table_entries: usize,
    /// Prefix-cache entries.
    pub num_cached_blocks: usize,
}

/// Per-sequence block tables over a fixed pool, with prefix-cache reuse.
#[derive(Debug)]
pub struct BlockManager {
    pool: BlockPool,
    prefix_cache: Option<PrefixCacheIndex>,
    block_tables: HashMap<SequenceId, BlockTable>,
    block_size: usize,
}

impl BlockManager {
    pub fn new(num_blocks: usize, block_size: usize, enable_prefix_caching: bool) -> Self {
        Self {
            pool: BlockPool::new(num_blocks),
            prefix_cache: enable_prefix_caching.then(PrefixCacheIndex::new),
            block_tables: HashMap::new(),
            block_size,
        }
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn num_total_blocks(&self) -> usize {
        self.pool.num_blocks()
    }

    /// Blocks available for new allocations: the pool free list plus cached
    /// blocks that can be reclaimed.
    pub fn num_free_blocks(&self) -> usize {
        let reclaimable = self
            .prefix_cache
            .as_ref()
            .map_or(0, |cache| cache.num_evictable(&self.pool));
        self.pool.num_free() + reclaimable
    }

    pub fn can_allocate_blocks(&self, count: usize) -> bool {
        self.num_free_blocks() >= count
    }

    /// Pool occupancy in `[0, 1]`.
    pub fn used_fraction(&self) -> f32 {
        self.pool.used_fraction()
    }

    pub fn has_block_table(&self, seq_id: SequenceId) -> bool {
        self.block_tables.contains_key(&seq_id)
    }

    /// Block table of a sequence.
    ///
    /// # Errors
    ///
    /// [`Error::SequenceNotFound`] when the sequence has no table.
    pub fn get_block_table(&self, seq_id: SequenceId) -> Result<&BlockTable> {
        self.block_tables
            .get(&seq_id)
            .ok_or(Error::SequenceNotFound(seq_id))
    }

    /// Reference count of a block, for assertions and metrics.
    pub fn block_ref_count(&self, index: usize) -> usize {
        self.pool.ref_count(index)
    }

    pub fn stats(&self) -> BlockManagerStats {
        BlockManagerStats {
            num_free_blocks: self.pool.num_free(),
            num_reclaimable_blocks: self
                .prefix_cache
                .as_ref()
                .map_or(0, |cache| cache.num_evictable(&self.pool)),
            total_live_refs: self.pool.total_live_refs(),
            total_table_entries: self.block_tables.values().map(BlockTable::len).sum(),
            num_cached_blocks: self.prefix_cache.as_ref().map_or(0, PrefixCacheIndex::len),
        }
    }

    /// Take a block from the pool, reclaiming a cached-only block when the
    /// free list is dry.
    fn allocate_raw(pool: &mut BlockPool, cache: Option<&mut PrefixCacheIndex>) -> Result<usize> {
        match pool.allocate_one() {
            Err(Error::NoFreeBlocks) => {
                if let Some(cache) = cache {
                    if cache.evict_lru(pool).is_some() {
                        return pool.allocate_one();
                    }
                }
                Err(Error::NoFreeBlocks)
            }
            other => other,
        }
    }

    /// Allocate the block for logical `position` of a sequence whose prompt
    /// is `prompt_ids`, going through the prefix cache for block-aligned
    /// prompt ranges.
    fn allocate_position(&mut self, position: usize, prompt_ids: &[u32]) -> Result<usize> {
        let block_size = self.block_size;
        if let Some(cache) = self.prefix_cache.as_mut() {
            if let Some(hash) = chained_prompt_hash(prompt_ids, position + 1, block_size) {
                if let Some(index) = cache.lookup(hash, &mut self.pool) {
                    return Ok(index);
                }
                let index = Self::allocate_raw(&mut self.pool, Some(&mut *cache))?;
                self.pool
                    .block_mut(index)
                    .set_num_computed_tokens(block_size);
                cache.insert(hash, index, &mut self.pool);
                return Ok(index);
            }
        }
        Self::allocate_raw(&mut self.pool, self.prefix_cache.as_mut())
    }

    /// Append `num_blocks` blocks to a sequence's table.
    ///
    /// Blocks covering still-unhashed block-aligned prompt ranges are looked
    /// up in the prefix cache first; hits are shared instead of allocated.
    ///
    /// # Errors
    ///
    /// [`Error::NoFreeBlocks`] when the pool cannot satisfy the request even
    /// after reclaiming cached blocks.
    pub fn allocate(
        &mut self,
        seq_id: SequenceId,
        num_blocks: usize,
        prompt_ids: &[u32],
    ) -> Result<()> {
        if !self.can_allocate_blocks(num_blocks) {
            return Err(Error::NoFreeBlocks);
        }
        for _ in 0..num_blocks {
            let position = self.block_tables.entry(seq_id).or_default().len();
            let index = self.allocate_position(position, prompt_ids)?;
            self.block_tables
                .get_mut(&seq_id)
                .expect("table created above")
                .push(index);
        }
        Ok(())
    }

    /// Blocks that would have to be allocated to satisfy
    /// [`append_slots`](Self::append_slots) for this group right now.
    pub fn required_blocks_count(&self, group: &SequenceGroup) -> usize {
        let target_tokens = group.num_processed_tokens() + group.num_scheduled_tokens();
        let required = blocks_needed_for(target_tokens, self.block_size);
        // Copy-on-write walks the siblings in order and releases the shared
        // tail as it forks, so a later sibling may find the tail unshared
        // and write in place for free. Simulate those refcount drops here;
        // the static pool counts alone overcount shared tails.
        let mut simulated_refs: HashMap<usize, usize> = HashMap::new();
        let mut count = 0;
        for seq in group.running_sequences() {
            let table = self.block_tables.get(&seq.id());
            let len = table.map_or(0, BlockTable::len);
            if required > len {
                count += required - len;
            } else if let Some(tail) = table.and_then(BlockTable::last) {
                let refs = simulated_refs
                    .entry(tail)
                    .or_insert_with(|| self.pool.ref_count(tail));
                if *refs > 1 {
                    // This sibling forks a private copy and releases the
                    // tail.
                    count += 1;
                    *refs -= 1;
                }
            }
        }
        count
    }

    /// Whether [`append_slots`](Self::append_slots) would succeed for this
    /// group without preempting anyone.
    pub fn can_append_slots(&self, group: &SequenceGroup) -> bool {
        self.required_blocks_count(group) <= self.num_free_blocks()
    }

    /// Ensure every running sequence of the group has block capacity for its
    /// staged tokens, returning the copy plan for shared tails.
    ///
    /// # Errors
    ///
    /// [`Error::NoFreeBlocks`] when capacity runs out mid-way; callers gate
    /// with [`can_append_slots`](Self::can_append_slots) first.
    pub fn append_slots(&mut self, group: &SequenceGroup) -> Result<BlockCopyPlan> {
        let target_tokens = group.num_processed_tokens() + group.num_scheduled_tokens();
        let required = blocks_needed_for(target_tokens, self.block_size);
        let multi_seq = group.num_running_seqs() > 1;
        let mut copy_plan = BlockCopyPlan::new();

        let running_ids: Vec<SequenceId> = group.running_sequences().map(Sequence::id).collect();
        for seq_id in running_ids {
            let table_len = self.block_tables.get(&seq_id).map_or(0, BlockTable::len);
            let tail = self.block_tables.get(&seq_id).and_then(BlockTable::last);

            if required > table_len {
                // Grow the table. When siblings grow past a shared tail, each
                // fresh tail block is seeded by a copy of the ancestor block.
                let shared_tail = tail.filter(|&t| multi_seq && self.pool.ref_count(t) > 1);
                self.allocate(seq_id, required - table_len, group.prompt_ids())?;
                if let Some(src) = shared_tail {
                    let dst = self.block_tables[&seq_id]
                        .get(table_len)
                        .expect("block appended above");
                    // Prefix-cache hits are shared, never copy targets.
                    if self.pool.ref_count(dst) == 1 {
                        copy_plan.entry(src).or_default().push(dst);
                    }
                }
            } else if let Some(src) = tail {
                debug_assert_eq!(
                    required, table_len,
                    "block table longer than the staged context"
                );
                // The next slot lands in the tail block; a shared tail must
                // be copied before this sequence may write into it.
                if self.pool.ref_count(src) > 1 {
                    let dst = Self::allocate_raw(&mut self.pool, self.prefix_cache.as_mut())?;
                    self.block_tables
                        .get_mut(&seq_id)
                        .expect("tail implies table")
                        .replace_last(dst);
                    copy_plan.entry(src).or_default().push(dst);
                    self.pool.free(src);
                }
            }
        }
        Ok(copy_plan)
    }

    /// Release all blocks of a sequence and drop its table.
    ///
    /// Unknown sequences are ignored, so the runtime may free finished and
    /// preempted sequences without tracking which still hold tables.
    pub fn free_sequence(&mut self, seq_id: SequenceId) {
        if let Some(table) = self.block_tables.remove(&seq_id) {
            for &index in table.indices() {
                self.pool.free(index);
            }
        }
    }

    /// Child inherits the parent's table with all reference counts bumped.
    ///
    /// # Errors
    ///
    /// [`Error::SequenceNotFound`] for an unknown parent,
    /// [`Error::InvariantViolation`] if the child already has a table.
    pub fn fork_sequence(&mut self, parent_id: SequenceId, child_id: SequenceId) -> Result<()> {
        if self.block_tables.contains_key(&child_id) {
            return Err(Error::InvariantViolation(format!(
                "sequence {child_id} already has a block table"
            )));
        }
        let table = self
            .block_tables
            .get(&parent_id)
            .ok_or(Error::SequenceNotFound(parent_id))?
            .clone();
        for &index in table.indices() {
            self.pool.increment_ref(index);
        }
        self.block_tables.insert(child_id, table);
        Ok(())
    }

    /// Release the trailing `num_blocks` blocks of every running sequence in
    /// the group. Returns the number of distinct logical block positions
    /// released, which the preemptor converts back into rewound tokens.
    pub fn free_group_partially(&mut self, group: &SequenceGroup, num_blocks: usize) -> usize {
        let mut released = 0;
        let running_ids: Vec<SequenceId> = group.running_sequences().map(Sequence::id).collect();
        for seq_id in running_ids {
            let Some(table) = self.block_tables.get_mut(&seq_id) else {
                continue;
            };
            let dropped = table.pop_trailing(num_blocks);
            released = released.max(dropped.len());
            for index in dropped {
                self.pool.free(index);
            }
        }
        released
    }

    /// Distinct physical blocks the group holds across all of its running
    /// sequences; shared sibling blocks count once.
    pub fn blocks_occupied_by_group(&self, group: &SequenceGroup) -> usize {
        let mut distinct: HashSet<usize> = HashSet::new();
        for seq in group.running_sequences() {
            if let Some(table) = self.block_tables.get(&seq.id()) {
                distinct.extend(table.indices().iter().copied());
            }
        }
        distinct.len()
    }

    /// Seed a fresh group's first block table with prefix-cache hits over its
    /// prompt and advance the group's processed counter to match.
    ///
    /// At least one prompt token is always left uncached so the group still
    /// schedules work and produces logits for its final prompt position.
    pub fn restore_cached_blocks(&mut self, group: &mut SequenceGroup) {
        let block_size = self.block_size;
        let Some(cache) = self.prefix_cache.as_mut() else {
            return;
        };
        if group.num_processed_tokens() > 0 {
            return;
        }
        let Some(first) = group.sequences().first() else {
            return;
        };
        let seq_id = first.id();
        if self
            .block_tables
            .get(&seq_id)
            .is_some_and(|table| !table.is_empty())
        {
            return;
        }

        let prompt = group.prompt_ids();
        let max_blocks = prompt.len().saturating_sub(1) / block_size;
        let mut parent = None;
        let mut restored = 0;
        for position in 0..max_blocks {
            let chunk = &prompt[position * block_size..(position + 1) * block_size];
            let hash = crate::core::block::hash_token_block(chunk, parent);
            parent = Some(hash);
            let Some(index) = cache.lookup(hash, &mut self.pool) else {
                break;
            };
            self.block_tables.entry(seq_id).or_default().push(index);
            restored += 1;
        }
        if restored > 0 {
            group.advance_processed_tokens(restored * block_size);
            debug!(
                request = group.request_id(),
                blocks = restored,
                "restored prompt prefix from cache"
            );
        }
    }
}
