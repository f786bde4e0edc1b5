//! wren-agent: the agentic runtime core
//!
//! Drives multi-turn conversations: the turn state machine over normalized
//! part streams, tool dispatch with bounded concurrency, history compaction
//! against a token budget, and the loop arbitrating queued prompts and
//! cancellation. Everything observable flows through the event bus.

pub mod agent;
pub mod bus;
pub mod compaction;
pub mod conversation;
pub mod dispatch;
pub mod error;
pub mod events;
pub mod handle;
pub mod tool;
pub mod turn;

pub use agent::{Agent, AgentConfig};
pub use bus::EventBus;
pub use compaction::{
    CompactionConfig, CompactionDecision, CompactionEngine, CompactionError, CompactionReason,
    HeuristicEstimator, OverflowPolicy, TokenEstimator,
};
pub use conversation::Conversation;
pub use dispatch::{DispatchConfig, DispatchOutcome, ToolDispatcher};
pub use error::{Error, Result};
pub use events::AgentEvent;
pub use handle::{AgentHandle, QueueFull, QueuedPrompt};
pub use tool::{BoxedTool, ProgressSender, Tool, ToolFailure, ToolOutput};
pub use turn::{ToolCall, ToolCallStatus, Turn, TurnEngine, TurnReason, TurnState};
