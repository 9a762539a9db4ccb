//! Configuration types for megabatch.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Scheduler configuration.
///
/// `dynamic_split_fuse` selects between the two batching policies:
///
/// - `true`: generation tokens are scheduled first each step, then prompt
///   tokens from pending requests are sliced into the remaining budget, so a
///   single step mixes prompt chunks and generation tokens.
/// - `false`: a step is either a pure prompt batch (padded to the longest
///   prompt in the batch) or a pure generation batch, vLLM style.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Total number of KV cache blocks in the pool.
    pub num_kv_blocks: usize,
    /// Tokens per KV cache block.
    pub block_size: usize,
    /// Per-step token budget across all sequence groups.
    pub max_num_batched_tokens: usize,
    /// Cap on concurrently running sequence groups (vLLM mode only).
    pub max_num_seqs: usize,
    /// Policy selector, see the type-level docs.
    pub dynamic_split_fuse: bool,
    /// Reuse KV blocks across requests with identical block-aligned prompt
    /// prefixes.
    pub enable_prefix_caching: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            num_kv_blocks: 1024,
            block_size: 16,
            max_num_batched_tokens: 4096,
            max_num_seqs: 256,
            dynamic_split_fuse: false,
            enable_prefix_caching: false,
        }
    }
}

impl SchedulerConfig {
    /// Check the configuration for values the scheduler cannot operate with.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ConfigInvalid`] for zero-sized pools, blocks or
    /// budgets, and for `max_num_seqs > max_num_batched_tokens` in vLLM mode
    /// (a prompt batch of `max_num_seqs` single-token prompts must fit the
    /// token budget).
    pub fn validate(&self) -> Result<()> {
        if self.num_kv_blocks == 0 {
            return Err(Error::ConfigInvalid("num_kv_blocks must be >= 1".into()));
        }
        if self.block_size == 0 {
            return Err(Error::ConfigInvalid("block_size must be > 0".into()));
        }
        if self.max_num_batched_tokens == 0 {
            return Err(Error::ConfigInvalid(
                "max_num_batched_tokens must be > 0".into(),
            ));
        }
        if self.max_num_seqs == 0 {
            return Err(Error::ConfigInvalid("max_num_seqs must be > 0".into()));
        }
        if !self.dynamic_split_fuse && self.max_num_seqs > self.max_num_batched_tokens {
            return Err(Error::ConfigInvalid(format!(
                "max_num_batched_tokens ({}) must be greater or equal to max_num_seqs ({})",
                self.max_num_batched_tokens, self.max_num_seqs
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(SchedulerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_zero_fields_rejected() {
        for field in 0..4 {
            let mut config = SchedulerConfig::default();
            match field {
                0 => config.num_kv_blocks = 0,
                1 => config.block_size = 0,
                2 => config.max_num_batched_tokens = 0,
                _ => config.max_num_seqs = 0,
            }
            assert!(matches!(config.validate(), Err(Error::ConfigInvalid(_))));
        }
    }

    #[test]
    fn test_vllm_seq_cap_must_fit_token_budget() {
        let config = SchedulerConfig {
            max_num_batched_tokens: 128,
            max_num_seqs: 256,
            dynamic_split_fuse: false,
            ..SchedulerConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::ConfigInvalid(_))));

        // The same limits are fine when prompts are sliced dynamically.
        let config = SchedulerConfig {
            dynamic_split_fuse: true,
            ..config
        };
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_serde_round_trip() {
        let config = SchedulerConfig {
            num_kv_blocks: 64,
            block_size: 32,
            max_num_batched_tokens: 512,
            max_num_seqs: 16,
            dynamic_split_fuse: true,
            enable_prefix_caching: true,
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: SchedulerConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.num_kv_blocks, 64);
        assert_eq!(back.block_size, 32);
        assert!(back.dynamic_split_fuse);
        assert!(back.enable_prefix_caching);
    }
}
