//! Sequence and sequence-group state for inference requests.
//!
//! A [`SequenceGroup`] is one user-level request. It owns one child
//! [`Sequence`] per beam and the token counters the scheduler works against:
//!
//! - `num_processed_tokens`: tokens whose KV state is committed to the cache.
//! - `num_scheduled_tokens`: tokens staged for the current step, cleared by
//!   [`SequenceGroup::finish_iteration`] or
//!   [`SequenceGroup::clear_scheduled_tokens`].
//!
//! The runtime appends sampled tokens to the child sequences between steps;
//! the scheduler only moves the counters.

use crate::error::{Error, Result};

/// Unique identifier for a sequence.
pub type SequenceId = u64;

/// Status of a single sequence within its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SequenceStatus {
    /// Actively participating in scheduling.
    Running,
    /// Generation complete (EOS, length limit, or abort).
    Finished,
}

/// A single generation trace within a group.
///
/// Sibling sequences of one group (beam search) may share prefix blocks in
/// the block manager; the sequence itself only tracks its identity and its
/// generated tokens.
#[derive(Debug, Clone)]
pub struct Sequence {
    id: SequenceId,
    output_token_ids: Vec<u32>,
    status: SequenceStatus,
}

impl Sequence {
    pub fn new(id: SequenceId) -> Self {
        Self {
            id,
            output_token_ids: Vec::new(),
            status: SequenceStatus::Running,
        }
    }

    pub fn id(&self) -> SequenceId {
        self.id
    }

    pub fn output_token_ids(&self) -> &[u32] {
        &self.output_token_ids
    }

    pub fn output_len(&self) -> usize {
        self.output_token_ids.len()
    }

    pub fn status(&self) -> SequenceStatus {
        self.status
    }

    pub fn is_running(&self) -> bool {
        self.status == SequenceStatus::Running
    }

    /// Append a sampled token. Called by the runtime after each step.
    pub fn append_token(&mut self, token_id: u32) {
        self.output_token_ids.push(token_id);
    }

    pub fn finish(&mut self) {
        self.status = SequenceStatus::Finished;
    }
}

/// A user-level generation request.
///
/// Groups are created on admission with a single running sequence and no
/// blocks. The scheduler stages tokens on them, the block manager tracks
/// their tables, and the runtime commits each step with
/// [`finish_iteration`](Self::finish_iteration).
#[derive(Debug, Clone)]
pub struct SequenceGroup {
    request_id: u64,
    prompt_ids: Vec<u32>,
    sequences: Vec<Sequence>,
    num_processed_tokens: usize,
    num_scheduled_tokens: usize,
    waiting: bool,
    block_size: usize,
}

impl SequenceGroup {
    /// Create a group for a new request.
    ///
    /// The first child sequence takes the request id as its sequence id;
    /// beam children get caller-assigned ids via [`fork`](Self::fork).
    pub fn new(request_id: u64, prompt_ids: Vec<u32>, block_size: usize) -> Self {
        Self {
            request_id,
            prompt_ids,
            sequences: vec![Sequence::new(request_id)],
            num_processed_tokens: 0,
            num_scheduled_tokens: 0,
            waiting: false,
            block_size,
        }
    }

    pub fn request_id(&self) -> u64 {
        self.request_id
    }

    pub fn prompt_ids(&self) -> &[u32] {
        &self.prompt_ids
    }

    pub fn prompt_len(&self) -> usize {
        self.prompt_ids.len()
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn sequences(&self) -> &[Sequence] {
        &self.sequences
    }

    pub fn sequence(&self, seq_id: SequenceId) -> Option<&Sequence> {
        self.sequences.iter().find(|seq| seq.id() == seq_id)
    }

    pub fn sequence_mut(&mut self, seq_id: SequenceId) -> Option<&mut Sequence> {
        self.sequences.iter_mut().find(|seq| seq.id() == seq_id)
    }

    /// Fork `parent_id` into a new running child with id `child_id`.
    ///
    /// The child inherits the parent's generated tokens; block sharing is
    /// handled separately by the block manager.
    ///
    /// # Errors
    ///
    /// [`Error::SequenceNotFound`] if the parent is unknown,
    /// [`Error::InvariantViolation`] if `child_id` is already taken.
    pub fn fork(&mut self, parent_id: SequenceId, child_id: SequenceId) -> Result<()> {
        if self.sequence(child_id).is_some() {
            return Err(Error::InvariantViolation(format!(
                "sequence id {child_id} already exists in group {}",
                self.request_id
            )));
        }
        let parent = self
            .sequence(parent_id)
            .ok_or(Error::SequenceNotFound(parent_id))?;
        let mut child = Sequence::new(child_id);
        child.output_token_ids = parent.output_token_ids.clone();
        self.sequences.push(child);
        Ok(())
    }

    /// Current beam width.
    pub fn num_running_seqs(&self) -> usize {
        self.sequences.iter().filter(|seq| seq.is_running()).count()
    }

    pub fn running_sequences(&self) -> impl Iterator<Item = &Sequence> {
        self.sequences.iter().filter(|seq| seq.is_running())
    }

    /// All child sequences have finished.
    pub fn has_finished(&self) -> bool {
        self.sequences.iter().all(|seq| !seq.is_running())
    }

    // ========== Scheduling counters ==========

    /// Tokens whose KV state is committed for the group's canonical sequence.
    pub fn num_processed_tokens(&self) -> usize {
        self.num_processed_tokens
    }

    /// Tokens staged for the current step, per running sequence.
    pub fn num_scheduled_tokens(&self) -> usize {
        self.num_scheduled_tokens
    }

    /// Total tokens known for this group: prompt plus the longest running
    /// output.
    pub fn content_len(&self) -> usize {
        let output = self
            .sequences
            .iter()
            .filter(|seq| seq.is_running())
            .map(Sequence::output_len)
            .max()
            .unwrap_or(0);
        self.prompt_ids.len() + output
    }

    /// Context the current step would cover: committed plus staged tokens.
    pub fn context_len(&self) -> usize {
        self.num_processed_tokens + self.num_scheduled_tokens
    }

    /// Tokens whose KV state still needs to be computed.
    ///
    /// The prompt remainder while ingesting, a single token in steady-state
    /// generation, more after a preemption rewound the processed counter.
    pub fn available_tokens_for_batching(&self) -> usize {
        debug_assert_eq!(
            self.num_scheduled_tokens, 0,
            "querying batch capacity mid-scheduling"
        );
        self.content_len().saturating_sub(self.num_processed_tokens)
    }

    /// Whether some child sequence is past prompt ingestion.
    ///
    /// Groups rewound by preemption still report true here: their generated
    /// tokens are known and they re-ingest through the generation phase.
    pub fn can_generate_tokens(&self) -> bool {
        self.content_len() > self.prompt_ids.len()
    }

    /// Blocks the group's canonical sequence occupies for its committed
    /// tokens.
    pub fn num_blocks(&self) -> usize {
        self.num_processed_tokens.div_ceil(self.block_size)
    }

    /// Stage `count` tokens per running sequence for the current step.
    pub fn schedule_tokens(&mut self, count: usize) {
        self.num_scheduled_tokens = count;
    }

    /// Unstage the current step's tokens (the group is skipped this step).
    pub fn clear_scheduled_tokens(&mut self) {
        self.num_scheduled_tokens = 0;
    }

    /// Commit the step: staged tokens become processed.
    pub fn finish_iteration(&mut self) {
        self.num_processed_tokens += self.num_scheduled_tokens;
        self.num_scheduled_tokens = 0;
    }

    /// Roll the processed counter back by `count` tokens.
    pub fn preempt_tokens(&mut self, count: usize) {
        assert!(
            count <= self.num_processed_tokens,
            "preempting {count} tokens but only {} are processed",
            self.num_processed_tokens
        );
        self.num_processed_tokens -= count;
    }

    /// Advance the processed counter without scheduling, for prompt prefixes
    /// restored from the cache.
    pub fn advance_processed_tokens(&mut self, count: usize) {
        self.num_processed_tokens += count;
    }

    // ========== Waiting marker ==========

    /// Preemption marker: a group set waiting holds off from scheduling for
    /// the remainder of the current step.
    pub fn is_waiting(&self) -> bool {
        self.waiting
    }

    pub fn set_waiting(&mut self) {
        self.waiting = true;
    }

    /// Clear the transient waiting marker at end of step.
    pub fn clear_waiting(&mut self) {
        self.waiting = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fresh_group_counters() {
        let group = SequenceGroup::new(7, vec![1, 2, 3, 4, 5], 4);
        assert_eq!(group.request_id(), 7);
        assert_eq!(group.prompt_len(), 5);
        assert_eq!(group.num_processed_tokens(), 0);
        assert_eq!(group.num_scheduled_tokens(), 0);
        assert_eq!(group.num_running_seqs(), 1);
        assert_eq!(group.available_tokens_for_batching(), 5);
        assert!(!group.can_generate_tokens());
        assert!(!group.is_waiting());
        assert!(!group.has_finished());
    }

    #[test]
    fn test_schedule_and_finish_iteration() {
        let mut group = SequenceGroup::new(0, vec![0; 10], 4);
        group.schedule_tokens(6);
        assert_eq!(group.num_scheduled_tokens(), 6);
        assert_eq!(group.context_len(), 6);

        group.finish_iteration();
        assert_eq!(group.num_processed_tokens(), 6);
        assert_eq!(group.num_scheduled_tokens(), 0);
        assert_eq!(group.available_tokens_for_batching(), 4);
        assert_eq!(group.num_blocks(), 2);
    }

    #[test]
    fn test_clear_scheduled_tokens() {
        let mut group = SequenceGroup::new(0, vec![0; 8], 4);
        group.schedule_tokens(8);
        group.clear_scheduled_tokens();
        assert_eq!(group.num_scheduled_tokens(), 0);
        assert_eq!(group.num_processed_tokens(), 0);
    }

    #[test]
    fn test_generation_accounting() {
        let mut group = SequenceGroup::new(0, vec![0; 4], 4);
        group.schedule_tokens(4);
        group.finish_iteration();
        assert!(!group.can_generate_tokens());

        // The sampler appends the first generated token.
        group.sequence_mut(0).unwrap().append_token(42);
        assert!(group.can_generate_tokens());
        assert_eq!(group.content_len(), 5);
        assert_eq!(group.available_tokens_for_batching(), 1);
    }

    #[test]
    fn test_preempt_tokens_rewinds() {
        let mut group = SequenceGroup::new(0, vec![0; 4], 4);
        group.schedule_tokens(4);
        group.finish_iteration();
        group.sequence_mut(0).unwrap().append_token(1);

        group.preempt_tokens(4);
        assert_eq!(group.num_processed_tokens(), 0);
        // The rewound tokens are available for re-ingestion, and the group
        // still counts as generating because its output is known.
        assert_eq!(group.available_tokens_for_batching(), 5);
        assert!(group.can_generate_tokens());
    }

    #[test]
    fn test_waiting_marker_is_transient() {
        let mut group = SequenceGroup::new(0, vec![0; 4], 4);
        group.set_waiting();
        assert!(group.is_waiting());
        group.clear_waiting();
        assert!(!group.is_waiting());
    }

    #[test]
    fn test_fork_inherits_outputs() {
        let mut group = SequenceGroup::new(3, vec![0; 4], 4);
        group.sequence_mut(3).unwrap().append_token(9);
        group.fork(3, 4).unwrap();

        assert_eq!(group.num_running_seqs(), 2);
        assert_eq!(group.sequence(4).unwrap().output_token_ids(), &[9]);

        assert!(matches!(group.fork(3, 4), Err(Error::InvariantViolation(_))));
        assert!(matches!(group.fork(99, 5), Err(Error::SequenceNotFound(99))));
    }

    #[test]
    fn test_finished_sequences_leave_the_beam() {
        let mut group = SequenceGroup::new(0, vec![0; 4], 4);
        group.fork(0, 1).unwrap();
        group.sequence_mut(1).unwrap().finish();
        assert_eq!(group.num_running_seqs(), 1);
        assert!(!group.has_finished());

        group.sequence_mut(0).unwrap().finish();
        assert!(group.has_finished());
    }
}
