//! The normalized part vocabulary produced by wire adapters

use crate::types::{StopReason, Usage};
use serde::{Deserialize, Serialize};
use std::pin::Pin;
use tokio_stream::Stream;

/// One atomic unit of normalized provider output.
///
/// Adapters translate their wire format into this vocabulary; everything
/// downstream of the adapter only ever sees parts. Tool-call parts are keyed
/// by call id so multiple calls may interleave within one stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Part {
    /// Reasoning content delta
    ThinkingDelta { delta: String },
    /// Response text delta
    TextDelta { delta: String },
    /// A tool call began streaming
    ToolCallStart { id: String, name: String },
    /// Partial tool-call argument JSON
    ToolCallArgumentDelta { id: String, delta: String },
    /// The provider signaled the end of a tool call's arguments
    ToolCallEnd { id: String },
    /// Stream completed normally
    StreamDone {
        stop_reason: StopReason,
        usage: Usage,
    },
    /// Stream broke mid-flight; always the last part of its stream
    StreamError { message: String },
}

impl Part {
    /// Check if this part terminates its stream
    pub fn is_terminal(&self) -> bool {
        matches!(self, Part::StreamDone { .. } | Part::StreamError { .. })
    }
}

/// A finite, lazy sequence of parts. Not restartable; a fresh provider call
/// produces a fresh stream.
pub type PartStream = Pin<Box<dyn Stream<Item = Part> + Send>>;
