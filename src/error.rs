//! Error types for megabatch.

use thiserror::Error;

/// Result type alias for scheduler operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for megabatch.
#[derive(Error, Debug)]
pub enum Error {
    /// Block allocation failed - the KV cache pool is exhausted.
    ///
    /// This is a soft condition: the affected sequence group is skipped for
    /// the current step and retried on the next one.
    #[error("no free KV cache blocks")]
    NoFreeBlocks,

    /// Rejected configuration, reported at scheduler construction.
    #[error("invalid scheduler configuration: {0}")]
    ConfigInvalid(String),

    /// Internal consistency check failed.
    ///
    /// Indicates a bug in the caller or a request that admission control
    /// should have rejected (e.g. a prompt longer than the per-step token
    /// budget in whole-prompt scheduling).
    #[error("scheduler invariant violated: {0}")]
    InvariantViolation(String),

    /// No block table is registered for the given sequence id.
    #[error("sequence {0} not found")]
    SequenceNotFound(u64),
}
