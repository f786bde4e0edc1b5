//! Agent event types

use serde::{Deserialize, Serialize};
use wren_ai::Usage;

use crate::compaction::CompactionReason;
use crate::turn::TurnReason;

/// Events emitted during agent execution
///
/// The union of turn-scoped stream events, tool execution events, and
/// lifecycle events. Consumers only ever see this stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// A cycle started processing
    AgentStart,

    /// A new generation round started
    TurnStart { turn: u32 },

    /// Thinking content started
    ThinkingStart,

    /// Thinking content delta
    ThinkingDelta { delta: String },

    /// Thinking content completed
    ThinkingEnd { thinking: String },

    /// Text content started
    TextStart,

    /// Text content delta
    TextDelta { delta: String },

    /// Text content completed
    TextEnd { text: String },

    /// A tool call began streaming
    ToolCallStart {
        tool_call_id: String,
        tool_name: String,
    },

    /// Partial tool-call argument JSON
    ToolCallDelta { tool_call_id: String, delta: String },

    /// A tool call's arguments are fully assembled
    ToolCallEnd {
        tool_call_id: String,
        tool_name: String,
        arguments: serde_json::Value,
    },

    /// Tool execution started
    ToolExecutionStart {
        tool_call_id: String,
        tool_name: String,
        arguments: serde_json::Value,
    },

    /// Tool execution progress update (emitted by tools during execution)
    ToolExecutionUpdate {
        tool_call_id: String,
        tool_name: String,
        content: String,
    },

    /// A tool produced its result
    ToolResult {
        tool_call_id: String,
        tool_name: String,
        result: String,
        is_error: bool,
    },

    /// A generation round sealed
    TurnEnd {
        turn: u32,
        reason: TurnReason,
        usage: Usage,
    },

    /// Context compaction started
    CompactionStart { reason: CompactionReason },

    /// Context compaction completed
    CompactionEnd { tokens_before: u32, tokens_after: u32 },

    /// Error occurred
    Error { message: String },

    /// The cycle finished processing
    AgentEnd { total_turns: u32, total_usage: Usage },
}

impl AgentEvent {
    /// Check if this is a terminal event
    pub fn is_terminal(&self) -> bool {
        matches!(self, AgentEvent::AgentEnd { .. } | AgentEvent::Error { .. })
    }
}
