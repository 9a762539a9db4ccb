//! Integration tests for the scheduler policies.

use megabatch::core::sequence::SequenceGroup;
use megabatch::{Error, Scheduler, SchedulerConfig};

fn vllm_config() -> SchedulerConfig {
    SchedulerConfig {
        num_kv_blocks: 8,
        block_size: 4,
        max_num_batched_tokens: 16,
        max_num_seqs: 4,
        dynamic_split_fuse: false,
        enable_prefix_caching: false,
    }
}

fn split_fuse_config() -> SchedulerConfig {
    SchedulerConfig {
        num_kv_blocks: 4,
        block_size: 4,
        max_num_batched_tokens: 8,
        max_num_seqs: 4,
        dynamic_split_fuse: true,
        enable_prefix_caching: false,
    }
}

fn group(request_id: u64, prompt_len: usize, block_size: usize) -> SequenceGroup {
    let prompt: Vec<u32> = (0..prompt_len as u32).collect();
    SequenceGroup::new(request_id, prompt, block_size)
}

/// Commit a step and sample one token for every group that caught up with
/// its known content, the way the runtime does between scheduler calls.
fn commit_step(groups: &mut [SequenceGroup], scheduled: &[usize]) {
    for &group_id in scheduled {
        groups[group_id].finish_iteration();
    }
    for group in groups.iter_mut() {
        if group.num_processed_tokens() > 0 && group.num_processed_tokens() == group.content_len()
        {
            let seq_id = group.request_id();
            group.sequence_mut(seq_id).unwrap().append_token(99);
        }
    }
}

#[test]
fn test_single_prompt_vllm() {
    let mut scheduler = Scheduler::new(vllm_config()).unwrap();
    let mut groups = vec![group(0, 10, 4)];

    let output = scheduler.schedule(&mut groups).unwrap();

    assert!(output.is_prompt);
    assert_eq!(output.scheduled_group_ids, vec![0]);
    assert_eq!(output.total_scheduled_tokens, 10);
    assert_eq!(output.block_tables[&0].len(), 3);
    assert!(output.block_copy_plan.is_empty());
    assert_eq!(output.cache_usage, 3.0 / 8.0);
    assert_eq!(groups[0].num_scheduled_tokens(), 10);

    // The follow-up step is a pure generation batch.
    commit_step(&mut groups, &output.scheduled_group_ids);
    let output = scheduler.schedule(&mut groups).unwrap();
    assert!(!output.is_prompt);
    assert_eq!(output.total_scheduled_tokens, 1);
    assert_eq!(output.scheduled_group_ids, vec![0]);
}

#[test]
fn test_two_prompts_vllm_padding() {
    let mut scheduler = Scheduler::new(vllm_config()).unwrap();
    let mut groups = vec![group(0, 5, 4), group(1, 3, 4)];

    let output = scheduler.schedule(&mut groups).unwrap();

    assert!(output.is_prompt);
    assert_eq!(output.scheduled_group_ids, vec![0, 1]);
    // Shorter prompts are padded to the longest in the batch.
    assert_eq!(output.total_scheduled_tokens, 5 * 2);
    assert_eq!(output.block_tables[&0].len(), 2);
    assert_eq!(output.block_tables[&1].len(), 1);
    assert_eq!(groups[0].num_scheduled_tokens(), 5);
    assert_eq!(groups[1].num_scheduled_tokens(), 3);
}

#[test]
fn test_generate_phase_split_fuse() {
    let mut scheduler = Scheduler::new(split_fuse_config()).unwrap();
    let mut groups = vec![group(0, 4, 4)];

    // Prompt step: the whole prompt fits the budget.
    let output = scheduler.schedule(&mut groups).unwrap();
    assert!(!output.is_prompt);
    assert_eq!(output.total_scheduled_tokens, 4);
    assert_eq!(output.block_tables[&0].len(), 1);
    commit_step(&mut groups, &output.scheduled_group_ids);

    // Generation step: one token, and the full tail forces a second block.
    let output = scheduler.schedule(&mut groups).unwrap();
    assert_eq!(output.scheduled_group_ids, vec![0]);
    assert_eq!(output.total_scheduled_tokens, 1);
    assert_eq!(output.block_tables[&0].len(), 2);
    assert!(output.block_copy_plan.is_empty());
}

#[test]
fn test_copy_plan_on_beam_fork() {
    let config = SchedulerConfig {
        num_kv_blocks: 8,
        ..split_fuse_config()
    };
    let mut scheduler = Scheduler::new(config).unwrap();
    let mut groups = vec![group(0, 4, 4)];

    let output = scheduler.schedule(&mut groups).unwrap();
    commit_step(&mut groups, &output.scheduled_group_ids);

    // The runtime forks the beam after the first sampled token.
    groups[0].fork(0, 1).unwrap();
    scheduler.fork_sequence(0, 1).unwrap();
    let shared = scheduler.get_block_table(0).unwrap().get(0).unwrap();
    assert_eq!(scheduler.block_manager().block_ref_count(shared), 2);

    let output = scheduler.schedule(&mut groups).unwrap();

    // One token per sibling, weighted into the total.
    assert_eq!(output.scheduled_group_ids, vec![0]);
    assert_eq!(output.total_scheduled_tokens, 2);

    // Both siblings grew past the shared full tail; the copy plan seeds each
    // fresh tail block from the shared ancestor.
    let destinations = output.block_copy_plan.get(&shared).unwrap();
    assert_eq!(destinations.len(), 2);
    let table0 = &output.block_tables[&0];
    let table1 = &output.block_tables[&1];
    assert_eq!(table0[0], shared);
    assert_eq!(table1[0], shared);
    assert_ne!(table0[1], table1[1]);
    assert!(destinations.contains(&table0[1]));
    assert!(destinations.contains(&table1[1]));
}

#[test]
fn test_preemption_by_recompute() {
    let config = SchedulerConfig {
        num_kv_blocks: 3,
        block_size: 2,
        max_num_batched_tokens: 8,
        max_num_seqs: 4,
        dynamic_split_fuse: true,
        enable_prefix_caching: false,
    };
    let mut scheduler = Scheduler::new(config).unwrap();
    let mut groups = vec![group(0, 4, 2), group(1, 2, 2)];

    // Both prompts ingest fully: 2 + 1 blocks, pool exhausted.
    let output = scheduler.schedule(&mut groups).unwrap();
    assert_eq!(output.scheduled_group_ids, vec![0, 1]);
    commit_step(&mut groups, &output.scheduled_group_ids);
    assert_eq!(scheduler.block_manager().stats().num_free_blocks, 0);

    // Group 0 needs a new block; group 1 is preempted from the tail.
    let output = scheduler.schedule(&mut groups).unwrap();
    assert_eq!(output.scheduled_group_ids, vec![0]);
    assert_eq!(output.total_scheduled_tokens, 1);
    assert_eq!(output.block_tables[&0].len(), 3);

    // The victim was fully released and rewound.
    assert_eq!(groups[1].num_processed_tokens(), 0);
    assert_eq!(groups[1].num_scheduled_tokens(), 0);
    assert!(!scheduler.has_block_table(1));
    // The waiting marker is transient and already cleared for the next step.
    assert!(!groups[1].is_waiting());

    // While group 0 runs, group 1 cannot preempt it back: first come, first
    // served.
    commit_step(&mut groups, &output.scheduled_group_ids);
    let output = scheduler.schedule(&mut groups).unwrap();
    assert_eq!(output.scheduled_group_ids, vec![0]);
}

#[test]
fn test_prefix_cache_hit_shortens_prompt_phase() {
    let config = SchedulerConfig {
        enable_prefix_caching: true,
        ..vllm_config()
    };
    let mut scheduler = Scheduler::new(config).unwrap();

    // First request ingests the shared four-token prefix and completes.
    let mut groups = vec![SequenceGroup::new(0, vec![1, 2, 3, 4], 4)];
    let output = scheduler.schedule(&mut groups).unwrap();
    assert_eq!(output.total_scheduled_tokens, 4);
    scheduler.free_sequence(0);

    // Second request shares the prefix: one block restored from cache, one
    // newly allocated for the remainder.
    let mut group = SequenceGroup::new(1, vec![1, 2, 3, 4, 5, 6, 7, 8], 4);
    scheduler.restore_cached_blocks(&mut group);
    assert_eq!(group.num_processed_tokens(), 4);
    let restored = scheduler.get_block_table(1).unwrap().get(0).unwrap();
    assert_eq!(scheduler.block_manager().block_ref_count(restored), 2);

    let mut groups = vec![group];
    let output = scheduler.schedule(&mut groups).unwrap();

    assert!(output.is_prompt);
    assert_eq!(output.scheduled_group_ids, vec![0]);
    // Only the uncached remainder is scheduled.
    assert_eq!(output.total_scheduled_tokens, 4);
    assert_eq!(output.block_tables[&1].len(), 2);
    assert!(output.block_copy_plan.is_empty());
}

#[test]
fn test_vllm_budget_defers_second_prompt() {
    let config = SchedulerConfig {
        num_kv_blocks: 16,
        block_size: 4,
        max_num_batched_tokens: 8,
        max_num_seqs: 4,
        dynamic_split_fuse: false,
        enable_prefix_caching: false,
    };
    let mut scheduler = Scheduler::new(config).unwrap();
    let mut groups = vec![group(0, 6, 4), group(1, 6, 4)];

    // Padding two 6-token prompts would need 12 tokens against a budget of
    // 8, so FIFO order decides who goes first.
    let output = scheduler.schedule(&mut groups).unwrap();
    assert_eq!(output.scheduled_group_ids, vec![0]);
    assert_eq!(output.total_scheduled_tokens, 6);
    assert_eq!(groups[1].num_scheduled_tokens(), 0);

    commit_step(&mut groups, &output.scheduled_group_ids);
    let output = scheduler.schedule(&mut groups).unwrap();
    assert!(output.is_prompt);
    assert_eq!(output.scheduled_group_ids, vec![1]);
}

#[test]
fn test_vllm_concurrency_cap() {
    let config = SchedulerConfig {
        max_num_seqs: 2,
        ..vllm_config()
    };
    let mut scheduler = Scheduler::new(config).unwrap();
    let mut groups = vec![group(0, 2, 4), group(1, 2, 4), group(2, 2, 4)];

    let output = scheduler.schedule(&mut groups).unwrap();
    assert_eq!(output.scheduled_group_ids, vec![0, 1]);

    // Once two groups are generating, the third stays queued.
    commit_step(&mut groups, &output.scheduled_group_ids);
    let output = scheduler.schedule(&mut groups).unwrap();
    assert!(!output.is_prompt);
    assert_eq!(output.scheduled_group_ids, vec![0, 1]);
    assert_eq!(groups[2].num_scheduled_tokens(), 0);
}

#[test]
fn test_empty_step_is_idempotent() {
    for config in [vllm_config(), split_fuse_config()] {
        let total_blocks = config.num_kv_blocks;
        let mut scheduler = Scheduler::new(config).unwrap();

        let output = scheduler.schedule(&mut []).unwrap();
        assert!(output.is_empty());
        assert!(!output.is_prompt);
        assert_eq!(output.total_scheduled_tokens, 0);
        assert_eq!(output.cache_usage, 0.0);
        assert_eq!(
            scheduler.block_manager().stats().num_free_blocks,
            total_blocks
        );
    }
}

#[test]
fn test_split_fuse_slices_long_prompt() {
    let config = SchedulerConfig {
        num_kv_blocks: 8,
        block_size: 4,
        max_num_batched_tokens: 4,
        max_num_seqs: 4,
        dynamic_split_fuse: true,
        enable_prefix_caching: false,
    };
    let mut scheduler = Scheduler::new(config).unwrap();
    let mut groups = vec![group(0, 10, 4)];

    // 10 prompt tokens against a 4-token budget: 4 + 4 + 2.
    for (expected_tokens, expected_blocks) in [(4, 1), (4, 2), (2, 3)] {
        let output = scheduler.schedule(&mut groups).unwrap();
        assert_eq!(output.scheduled_group_ids, vec![0]);
        assert_eq!(output.total_scheduled_tokens, expected_tokens);
        assert_eq!(output.block_tables[&0].len(), expected_blocks);
        commit_step(&mut groups, &output.scheduled_group_ids);
    }
    assert_eq!(groups[0].num_processed_tokens(), 10);

    // Prompt done, generation begins.
    let output = scheduler.schedule(&mut groups).unwrap();
    assert_eq!(output.total_scheduled_tokens, 1);
}

#[test]
fn test_split_fuse_prompt_clamped_by_block_budget() {
    let config = SchedulerConfig {
        num_kv_blocks: 2,
        block_size: 4,
        max_num_batched_tokens: 16,
        max_num_seqs: 4,
        dynamic_split_fuse: true,
        enable_prefix_caching: false,
    };
    let mut scheduler = Scheduler::new(config).unwrap();
    let mut groups = vec![group(0, 12, 4)];

    // The token budget would admit the whole prompt, but only two blocks
    // exist: the chunk is clamped to their capacity.
    let output = scheduler.schedule(&mut groups).unwrap();
    assert_eq!(output.total_scheduled_tokens, 8);
    assert_eq!(output.block_tables[&0].len(), 2);
    commit_step(&mut groups, &output.scheduled_group_ids);

    // No blocks left and nothing to reclaim: the group sits out the step.
    let output = scheduler.schedule(&mut groups).unwrap();
    assert!(output.is_empty());
    assert_eq!(groups[0].num_scheduled_tokens(), 0);
}

#[test]
fn test_overlong_prompt_is_fatal_in_vllm_mode() {
    let mut scheduler = Scheduler::new(vllm_config()).unwrap();
    let mut groups = vec![group(0, 20, 4)];

    // 20 prompt tokens cannot fit a 16-token whole-prompt batch; admission
    // control should have rejected the request.
    assert!(matches!(
        scheduler.schedule(&mut groups),
        Err(Error::InvariantViolation(_))
    ));
}

#[test]
fn test_invalid_config_is_rejected() {
    let config = SchedulerConfig {
        max_num_seqs: 32,
        max_num_batched_tokens: 16,
        dynamic_split_fuse: false,
        ..vllm_config()
    };
    assert!(matches!(
        Scheduler::new(config),
        Err(Error::ConfigInvalid(_))
    ));
}
