//! Block abstractions for the paged KV cache.
//!
//! The KV cache is divided into fixed-size blocks, similar to how operating
//! systems manage virtual memory with pages. A [`Block`] is a handle onto one
//! such slab; the device tensors behind it are owned by the executor-side
//! cache manager and are only ever referred to by block index here.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

/// Compute a cumulative hash for a block of tokens including its prefix chain.
///
/// Used for prefix caching to identify shared prefixes. The hash includes the
/// parent block's hash so that blocks at the same position with different
/// prefixes never collide into the same cache entry.
///
/// # Example
///
/// ```
/// use megabatch::core::block::hash_token_block;
///
/// let tokens = [1u32, 2, 3, 4];
/// let hash1 = hash_token_block(&tokens, None);
/// let hash2 = hash_token_block(&tokens, Some(hash1));
///
/// // Same tokens but different prefix chain -> different hash
/// assert_ne!(hash1, hash2);
/// ```
pub fn hash_token_block(token_ids: &[u32], parent_hash: Option<u64>) -> u64 {
    let mut hasher = DefaultHasher::new();
    if let Some(parent) = parent_hash {
        parent.hash(&mut hasher);
    }
    for &token in token_ids {
        token.hash(&mut hasher);
    }
    hasher.finish()
}

/// Chained hash over the first `num_blocks` block-aligned chunks of a prompt.
///
/// Returns the hash of block `num_blocks - 1`, which covers the whole prefix
/// `[0, num_blocks * block_size)`. `None` when `num_blocks` is zero or the
/// prompt does not span that many full blocks.
pub fn chained_prompt_hash(
    prompt_ids: &[u32],
    num_blocks: usize,
    block_size: usize,
) -> Option<u64> {
    if num_blocks == 0 || prompt_ids.len() < num_blocks * block_size {
        return None;
    }
    let mut parent = None;
    for chunk in prompt_ids.chunks_exact(block_size).take(num_blocks) {
        parent = Some(hash_token_block(chunk, parent));
    }
    parent
}

/// Number of blocks needed to hold `num_tokens` tokens.
///
/// ```
/// use megabatch::core::block::blocks_needed_for;
///
/// assert_eq!(blocks_needed_for(35, 16), 3);
/// assert_eq!(blocks_needed_for(32, 16), 2);
/// assert_eq!(blocks_needed_for(0, 16), 0);
/// ```
pub fn blocks_needed_for(num_tokens: usize, block_size: usize) -> usize {
    num_tokens.div_ceil(block_size)
}

/// Handle onto one fixed-size slab of KV cache memory.
///
/// Blocks live in the [`BlockPool`](super::block_pool::BlockPool) arena and
/// keep their index for the process lifetime. A block with reference count 0
/// is free, 1 is owned by a single user, 2 or more is shared (sibling beams
/// or the prefix cache).
#[derive(Debug, Clone)]
pub struct Block {
    index: usize,
    ref_count: usize,
    content_hash: Option<u64>,
    num_computed_tokens: usize,
}

impl Block {
    pub(crate) fn new(index: usize) -> Self {
        Self {
            index,
            ref_count: 0,
            content_hash: None,
            num_computed_tokens: 0,
        }
    }

    /// Stable index of this block in the pool.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Current reference count.
    pub fn ref_count(&self) -> usize {
        self.ref_count
    }

    /// Content hash, set when the block holds a hashed prompt prefix.
    pub fn content_hash(&self) -> Option<u64> {
        self.content_hash
    }

    /// How many of the block's token slots hold committed KV state.
    pub fn num_computed_tokens(&self) -> usize {
        self.num_computed_tokens
    }

    /// A shared block is referenced by more than one user and must be copied
    /// before any of them may write into it.
    pub fn is_shared(&self) -> bool {
        self.ref_count > 1
    }

    pub(crate) fn set_content_hash(&mut self, hash: u64) {
        self.content_hash = Some(hash);
    }

    pub(crate) fn set_num_computed_tokens(&mut self, num: usize) {
        self.num_computed_tokens = num;
    }

    pub(crate) fn increment_ref(&mut self) {
        self.ref_count += 1;
    }

    pub(crate) fn decrement_ref(&mut self) -> usize {
        assert!(self.ref_count > 0, "double free of block {}", self.index);
        self.ref_count -= 1;
        self.ref_count
    }

    pub(crate) fn reset(&mut self) {
        self.content_hash = None;
        self.num_computed_tokens = 0;
    }
}

/// Maps a sequence's logical block positions to physical block indices.
///
/// Position `i` holds the KV state for tokens
/// `[i * block_size, (i + 1) * block_size)`. Only the last entry may be
/// partially filled.
#[derive(Debug, Clone, Default)]
pub struct BlockTable {
    block_indices: Vec<usize>,
}

impl BlockTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of blocks in the table.
    pub fn len(&self) -> usize {
        self.block_indices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.block_indices.is_empty()
    }

    /// Physical index at a logical position.
    pub fn get(&self, position: usize) -> Option<usize> {
        self.block_indices.get(position).copied()
    }

    /// Physical index of the tail block.
    pub fn last(&self) -> Option<usize> {
        self.block_indices.last().copied()
    }

    /// All physical indices in logical order.
    pub fn indices(&self) -> &[usize] {
        &self.block_indices
    }

    pub fn to_vec(&self) -> Vec<usize> {
        self.block_indices.clone()
    }

    pub(crate) fn push(&mut self, block_index: usize) {
        self.block_indices.push(block_index);
    }

    /// Replace the tail entry, used when a shared tail is copied on write.
    pub(crate) fn replace_last(&mut self, block_index: usize) {
        let last = self
            .block_indices
            .last_mut()
            .expect("replace_last on empty block table");
        *last = block_index;
    }

    /// Drop the trailing `count` entries, returning them.
    pub(crate) fn pop_trailing(&mut self, count: usize) -> Vec<usize> {
        let keep = self.block_indices.len().saturating_sub(count);
        self.block_indices.split_off(keep)
    }
}
