//! Error types for wren-agent

use thiserror::Error;

use crate::compaction::CompactionError;
use crate::handle::QueueFull;

/// Result type alias using wren-agent Error
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the agentic loop.
///
/// Failures scoped to a single tool call never appear here; they are
/// recorded as failed tool results and fed back to the model. Nothing is
/// retried inside the core.
#[derive(Error, Debug)]
pub enum Error {
    /// The provider call could not be opened
    #[error(transparent)]
    Provider(#[from] wren_ai::Error),

    /// The provider stream broke mid-turn
    #[error("stream error: {0}")]
    Stream(String),

    /// The stream violated part boundaries
    #[error("malformed stream: {0}")]
    MalformedStream(String),

    /// Compaction failed, including unrecoverable overflow
    #[error(transparent)]
    Compaction(#[from] CompactionError),

    /// The conversation exceeds its budget and the overflow policy is `stop`
    #[error("context overflow: estimated {estimated} tokens against a budget of {budget}")]
    ContextOverflow { estimated: u32, budget: u32 },

    /// A prompt submission was rejected
    #[error(transparent)]
    QueueFull(#[from] QueueFull),

    /// A cycle exceeded its generation-round cap
    #[error("cycle exceeded {0} turns")]
    MaxTurns(u32),
}
