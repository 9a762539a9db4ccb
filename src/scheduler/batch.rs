//! Continuous-batching scheduler.
//!
//! One [`Scheduler::schedule`] call per model step decides which sequence
//! groups advance, how many tokens each contributes, and how the paged KV
//! cache is allocated, shared, copied or reclaimed. The returned
//! [`SchedulerOutput`] is self-contained: the executor materializes the block
//! copy plan, runs the forward pass over the scheduled groups, samples, and
//! commits each group with `finish_iteration`.
//!
//! ## Policies
//!
//! ```text
//!  dynamic_split_fuse = true          dynamic_split_fuse = false (vLLM)
//!  ┌──────────────────────┐           ┌─────────────────────────────┐
//!  │ 1. generation tokens │           │ 1. pure prompt batch, padded│
//!  │ 2. prompt chunks into│           │    to the longest prompt    │
//!  │    remaining budget  │           │ 2. else: generation batch   │
//!  └──────────────────────┘           └─────────────────────────────┘
//! ```
//!
//! Both modes walk the group list in FIFO order. When the generation phase
//! cannot extend a group's block table, it preempts the lowest-priority
//! group (scanning from the tail) by recompute: the victim's blocks are
//! freed in whole or part and its processed-token counter rewound, so it
//! re-ingests those tokens on a later step.
//!
//! ## Example
//!
//! ```
//! use megabatch::core::sequence::SequenceGroup;
//! use megabatch::{Scheduler, SchedulerConfig};
//!
//! let config = SchedulerConfig::default();
//! let mut scheduler = Scheduler::new(config.clone()).unwrap();
//! let mut groups = vec![SequenceGroup::new(0, vec![1, 2, 3], config.block_size)];
//!
//! let output = scheduler.schedule(&mut groups).unwrap();
//! assert!(output.is_prompt);
//! assert_eq!(output.scheduled_group_ids, vec![0]);
//! assert_eq!(output.total_scheduled_tokens, 3);
//! ```

use std::collections::BTreeMap;

use tracing::{debug, trace};

use crate::config::SchedulerConfig;
use crate::core::block::{blocks_needed_for, BlockTable};
use crate::core::block_manager::{BlockCopyPlan, BlockManager};
use crate::core::sequence::{Sequence, SequenceGroup, SequenceId};
use crate::error::{Error, Result};

/// Everything the executor needs to run one step.
#[derive(Debug, Default)]
pub struct SchedulerOutput {
    /// Indices into the caller's group list, in scheduling order.
    pub scheduled_group_ids: Vec<usize>,
    /// Physical block copies to perform before the forward pass.
    pub block_copy_plan: BlockCopyPlan,
    /// Block-table snapshot for every scheduled sequence.
    pub block_tables: BTreeMap<SequenceId, Vec<usize>>,
    /// Scheduled tokens summed over all groups, weighted by beam width. In a
    /// prompt batch this is the padded total, longest prompt times batch
    /// size.
    pub total_scheduled_tokens: usize,
    /// Whether this step is a dedicated prompt batch.
    pub is_prompt: bool,
    /// Block pool occupancy after scheduling, in `[0, 1]`.
    pub cache_usage: f32,
}

impl SchedulerOutput {
    /// No group was scheduled this step.
    pub fn is_empty(&self) -> bool {
        self.scheduled_group_ids.is_empty()
    }
}

/// Per-step scheduling policy over a shared block manager.
///
/// The scheduler is stateless between [`schedule`](Self::schedule) calls
/// except through the block manager it owns. The caller owns the group list
/// and serializes scheduling against request ingress.
#[derive(Debug)]
pub struct Scheduler {
    config: SchedulerConfig,
    block_manager: BlockManager,
}

impl Scheduler {
    /// Build a scheduler, validating the configuration.
    ///
    /// # Errors
    ///
    /// [`Error::ConfigInvalid`] for configurations the policies cannot
    /// operate with, see [`SchedulerConfig::validate`].
    pub fn new(config: SchedulerConfig) -> Result<Self> {
        config.validate()?;
        let block_manager = BlockManager::new(
            config.num_kv_blocks,
            config.block_size,
            config.enable_prefix_caching,
        );
        Ok(Self {
            config,
            block_manager,
        })
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Read access to the block manager, for metrics and tests.
    pub fn block_manager(&self) -> &BlockManager {
        &self.block_manager
    }

    /// Decide the batch for one model step.
    ///
    /// `groups` is the runtime's FIFO list of active sequence groups; index
    /// order is priority order and indices are reported back in
    /// [`SchedulerOutput::scheduled_group_ids`]. Groups that cannot make
    /// progress this step are left unscheduled with their staged-token
    /// counter cleared and are retried on the next call.
    pub fn schedule(&mut self, groups: &mut [SequenceGroup]) -> Result<SchedulerOutput> {
        let mut output = SchedulerOutput::default();

        if self.config.dynamic_split_fuse {
            // Generation first, then prompt chunks fill the rest of the
            // budget.
            self.schedule_generate_phase(groups, &mut output)?;
            self.schedule_prompt_phase_split_fuse(groups, &mut output)?;
        } else {
            // A step is either a pure prompt batch or a pure generation
            // batch.
            self.schedule_prompt_phase_vllm(groups, &mut output)?;
            if !output.is_prompt {
                self.schedule_generate_phase(groups, &mut output)?;
            }
        }

        for group in groups.iter_mut() {
            group.clear_waiting();
        }
        output.cache_usage = self.block_manager.used_fraction();
        Ok(output)
    }

    /// Block table of a sequence.
    ///
    /// # Errors
    ///
    /// [`Error::SequenceNotFound`] when the sequence has no table.
    pub fn get_block_table(&self, seq_id: SequenceId) -> Result<&BlockTable> {
        self.block_manager.get_block_table(seq_id)
    }

    pub fn has_block_table(&self, seq_id: SequenceId) -> bool {
        self.block_manager.has_block_table(seq_id)
    }

    /// Release all blocks of a finished or dropped sequence.
    pub fn free_sequence(&mut self, seq_id: SequenceId) {
        self.block_manager.free_sequence(seq_id);
    }

    /// Share the parent's blocks with a forked beam child.
    ///
    /// # Errors
    ///
    /// Propagates [`Error::SequenceNotFound`] and
    /// [`Error::InvariantViolation`] from the block manager.
    pub fn fork_sequence(&mut self, parent_id: SequenceId, child_id: SequenceId) -> Result<()> {
        self.block_manager.fork_sequence(parent_id, child_id)
    }

    /// Seed a newly admitted group's block table from the prefix cache.
    pub fn restore_cached_blocks(&mut self, group: &mut SequenceGroup) {
        self.block_manager.restore_cached_blocks(group);
    }

    // ========== Generation phase ==========

    /// Schedule generation tokens in FIFO order, preempting lower-priority
    /// groups when the pool is exhausted. Also used as the vLLM-mode
    /// fallback on steps without a prompt batch, and it naturally picks up
    /// preempted groups re-ingesting their rewound tokens.
    fn schedule_generate_phase(
        &mut self,
        groups: &mut [SequenceGroup],
        output: &mut SchedulerOutput,
    ) -> Result<()> {
        for group_id in 0..groups.len() {
            if !groups[group_id].can_generate_tokens() || groups[group_id].is_waiting() {
                continue;
            }
            if groups[group_id].has_finished() {
                return Err(Error::InvariantViolation(format!(
                    "finished group {} still in the scheduling queue",
                    groups[group_id].request_id()
                )));
            }

            let num_running_seqs = groups[group_id].num_running_seqs();
            let tokens_in_megabatch =
                self.config.max_num_batched_tokens - output.total_scheduled_tokens;
            let available_per_seq_in_megabatch = tokens_in_megabatch / num_running_seqs;
            if available_per_seq_in_megabatch == 0 {
                // Not even one token per sequence fits this step.
                continue;
            }

            // More than one token per sequence when an earlier preemption
            // rewound this group's processed counter.
            let available_per_seq = groups[group_id].available_tokens_for_batching();
            let scheduled_per_seq = available_per_seq_in_megabatch.min(available_per_seq);
            if scheduled_per_seq == 0 {
                continue;
            }
            groups[group_id].schedule_tokens(scheduled_per_seq);

            self.apply_preemption(group_id, groups);

            if !self.block_manager.can_append_slots(&groups[group_id]) {
                trace!(
                    request = groups[group_id].request_id(),
                    "no block capacity, group skipped for this step"
                );
                groups[group_id].clear_scheduled_tokens();
                continue;
            }
            let copy_plan = match self.block_manager.append_slots(&groups[group_id]) {
                Ok(plan) => plan,
                Err(Error::NoFreeBlocks) => {
                    groups[group_id].clear_scheduled_tokens();
                    continue;
                }
                Err(err) => return Err(err),
            };

            output.scheduled_group_ids.push(group_id);
            output.total_scheduled_tokens += scheduled_per_seq * num_running_seqs;
            for seq in groups[group_id].running_sequences() {
                let table = self.block_manager.get_block_table(seq.id())?;
                output.block_tables.insert(seq.id(), table.to_vec());
            }
            for (src, dsts) in copy_plan {
                output.block_copy_plan.entry(src).or_default().extend(dsts);
            }

            if output.total_scheduled_tokens == self.config.max_num_batched_tokens {
                break;
            }
        }
        Ok(())
    }

    // ========== Prompt phases ==========

    /// Slice pending prompts into whatever budget the generation phase left.
    fn schedule_prompt_phase_split_fuse(
        &mut self,
        groups: &mut [SequenceGroup],
        output: &mut SchedulerOutput,
    ) -> Result<()> {
        for group_id in 0..groups.len() {
            let (seq_id, mut num_scheduled_tokens, available_slots) = {
                let group = &groups[group_id];
                if group.can_generate_tokens() || group.is_waiting() {
                    continue;
                }
                if group.num_running_seqs() != 1 {
                    return Err(Error::InvariantViolation(format!(
                        "prompt-phase group {} has {} running sequences",
                        group.request_id(),
                        group.num_running_seqs()
                    )));
                }
                let tokens_in_megabatch =
                    self.config.max_num_batched_tokens - output.total_scheduled_tokens;
                let available = group.available_tokens_for_batching();
                // Slack left in the group's last allocated block.
                let available_slots =
                    group.num_blocks() * self.config.block_size - group.num_processed_tokens();
                (
                    group.sequences()[0].id(),
                    tokens_in_megabatch.min(available),
                    available_slots,
                )
            };

            // Clamp the chunk to what the pool can take this step.
            let required_slots = num_scheduled_tokens.saturating_sub(available_slots);
            let num_required_blocks = blocks_needed_for(required_slots, self.config.block_size);
            let num_scheduled_blocks =
                num_required_blocks.min(self.block_manager.num_free_blocks());
            num_scheduled_tokens = num_scheduled_tokens
                .min(available_slots + num_scheduled_blocks * self.config.block_size);

            if num_scheduled_tokens > 0 {
                if num_scheduled_blocks > 0 {
                    self.block_manager.allocate(
                        seq_id,
                        num_scheduled_blocks,
                        groups[group_id].prompt_ids(),
                    )?;
                }
                groups[group_id].schedule_tokens(num_scheduled_tokens);

                output.scheduled_group_ids.push(group_id);
                let table = self.block_manager.get_block_table(seq_id)?;
                output.block_tables.insert(seq_id, table.to_vec());
                output.total_scheduled_tokens += num_scheduled_tokens;
            }

            if output.total_scheduled_tokens == self.config.max_num_batched_tokens {
                break;
            }
        }
        Ok(())
    }

    /// Schedule a pure prompt batch, padded to the longest admitted prompt.
    ///
    /// Walks the FIFO until the concurrency cap, the token budget or the
    /// block pool is exhausted. Each admitted group ingests its whole prompt
    /// in one shot.
    fn schedule_prompt_phase_vllm(
        &mut self,
        groups: &mut [SequenceGroup],
        output: &mut SchedulerOutput,
    ) -> Result<()> {
        debug_assert!(!self.config.dynamic_split_fuse);
        if !output.scheduled_group_ids.is_empty() {
            return Err(Error::InvariantViolation(
                "prompt phase must open the step with an empty output".into(),
            ));
        }

        let mut num_running_groups = groups
            .iter()
            .filter(|group| group.can_generate_tokens())
            .count();
        let mut max_sequence_len = 0usize;

        for group_id in 0..groups.len() {
            let (seq_id, sequence_len) = {
                let group = &groups[group_id];
                if group.can_generate_tokens() || group.is_waiting() {
                    continue;
                }
                if group.num_running_seqs() != 1 {
                    return Err(Error::InvariantViolation(format!(
                        "prompt-phase group {} has {} running sequences",
                        group.request_id(),
                        group.num_running_seqs()
                    )));
                }
                // Whole-prompt scheduling assumes a fresh context unless a
                // cached prefix was restored.
                if !self.config.enable_prefix_caching && group.context_len() != 0 {
                    return Err(Error::InvariantViolation(format!(
                        "prompt-phase group {} already has context",
                        group.request_id()
                    )));
                }
                (
                    group.sequences()[0].id(),
                    group.available_tokens_for_batching(),
                )
            };

            max_sequence_len = max_sequence_len.max(sequence_len);

            if sequence_len > self.config.max_num_batched_tokens {
                return Err(Error::InvariantViolation(format!(
                    "sequence of {sequence_len} tokens exceeds the {}-token batch budget",
                    self.config.max_num_batched_tokens
                )));
            }
            if num_running_groups >= self.config.max_num_seqs {
                break;
            }
            // Admitting this group pads every prompt in the batch to the
            // longest one; the padded total must stay within budget.
            let padded_total = max_sequence_len * (output.scheduled_group_ids.len() + 1);
            if padded_total > self.config.max_num_batched_tokens {
                break;
            }
            let num_required_blocks = blocks_needed_for(sequence_len, self.config.block_size);
            if !self.block_manager.can_allocate_blocks(num_required_blocks) {
                break;
            }

            groups[group_id].schedule_tokens(sequence_len);
            self.block_manager.append_slots(&groups[group_id])?;

            output.scheduled_group_ids.push(group_id);
            let table = self.block_manager.get_block_table(seq_id)?;
            output.block_tables.insert(seq_id, table.to_vec());
            // Shorter prompts are padded to the longest one in the batch.
            output.total_scheduled_tokens =
                max_sequence_len * output.scheduled_group_ids.len();
            output.is_prompt = true;

            num_running_groups += 1;
        }
        Ok(())
    }

    // ========== Preemption ==========

    /// Evict lower-priority groups until the requester's staged tokens fit,
    /// or no further eviction is possible.
    fn apply_preemption(&mut self, group_id: usize, groups: &mut [SequenceGroup]) {
        while !self.block_manager.can_append_slots(&groups[group_id]) {
            let Some(victim_id) = Self::lowest_priority_group(groups) else {
                break;
            };
            if victim_id <= group_id {
                // Only the requester itself (or higher priority) holds
                // blocks; evicting would be self-eviction.
                break;
            }
            let blocks_needed = self.block_manager.required_blocks_count(&groups[group_id]);
            if !self.preempt_by_recompute(&mut groups[victim_id], blocks_needed) {
                break;
            }
        }
    }

    /// The victim is the last group in FIFO order holding committed tokens.
    fn lowest_priority_group(groups: &[SequenceGroup]) -> Option<usize> {
        groups
            .iter()
            .rposition(|group| group.num_processed_tokens() > 0)
    }

    /// Free the victim's blocks and rewind its processed counter so it
    /// re-ingests the rewound tokens later.
    ///
    /// Returns whether the pool visibly grew; a partial release reports no
    /// progress, so the preemption loop takes at most one partial victim per
    /// requester per step.
    fn preempt_by_recompute(&mut self, group: &mut SequenceGroup, blocks_needed: usize) -> bool {
        let processed_tokens = group.num_processed_tokens();
        let block_size = self.config.block_size;
        let prev_free_blocks = self.block_manager.num_free_blocks();
        let occupied = self.block_manager.blocks_occupied_by_group(group);

        if occupied <= blocks_needed {
            // Everything the victim holds is needed: release it whole.
            let seq_ids: Vec<SequenceId> = group.running_sequences().map(Sequence::id).collect();
            for seq_id in seq_ids {
                self.block_manager.free_sequence(seq_id);
            }
            group.preempt_tokens(processed_tokens);
            group.set_waiting();
            debug!(
                request = group.request_id(),
                tokens = processed_tokens,
                "fully preempted sequence group"
            );
            return self.block_manager.num_free_blocks() > prev_free_blocks;
        }

        let logical_released = self.block_manager.free_group_partially(group, blocks_needed);

        let mut tokens_in_last_block = processed_tokens % block_size;
        if tokens_in_last_block == 0 {
            tokens_in_last_block = block_size;
        }
        let mut preempted_tokens =
            tokens_in_last_block + logical_released.saturating_sub(1) * block_size;

        // Whole-prompt scheduling cannot resume a partially ingested prompt:
        // a rewind into the prompt escalates to a full rewind.
        if !self.config.dynamic_split_fuse
            && processed_tokens - preempted_tokens < group.prompt_len()
        {
            preempted_tokens = processed_tokens;
            let first_seq_id = group.sequences()[0].id();
            self.block_manager.free_sequence(first_seq_id);
        }
        group.preempt_tokens(preempted_tokens);
        group.set_waiting();
        debug!(
            request = group.request_id(),
            tokens = preempted_tokens,
            blocks = logical_released,
            "partially preempted sequence group"
        );
        false
    }
}
