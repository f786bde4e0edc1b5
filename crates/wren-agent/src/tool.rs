//! Tool trait and execution output types

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use wren_ai::Content;

use crate::bus::EventBus;
use crate::events::AgentEvent;

/// Per-call failure kinds; scoped to one call, never fatal to the round
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolFailure {
    /// No registered tool with the requested name
    UnknownTool,
    /// Arguments rejected by the tool's parameter schema
    InvalidArguments,
    /// No progress within the idle-timeout window
    Timeout,
    /// The tool itself reported an error
    Execution,
    /// Execution was cancelled before completing
    Cancelled,
}

/// Result of a tool execution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolOutput {
    /// Content to feed back to the model
    pub content: Vec<Content>,
    /// Whether the execution resulted in an error
    pub is_error: bool,
    /// Failure kind when `is_error` is set by the dispatcher or the tool
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<ToolFailure>,
}

impl ToolOutput {
    /// Create a successful text result
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            content: vec![Content::text(text)],
            is_error: false,
            failure: None,
        }
    }

    /// Create a result with multiple content blocks
    pub fn with_content(content: Vec<Content>) -> Self {
        Self {
            content,
            is_error: false,
            failure: None,
        }
    }

    /// Create a tool-reported error result
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            content: vec![Content::text(message)],
            is_error: true,
            failure: Some(ToolFailure::Execution),
        }
    }

    /// Create a failure of a specific kind
    pub fn failure(kind: ToolFailure, message: impl Into<String>) -> Self {
        Self {
            content: vec![Content::text(message)],
            is_error: true,
            failure: Some(kind),
        }
    }

    /// Get the text content as a single string
    pub fn text_content(&self) -> String {
        self.content
            .iter()
            .filter_map(|c| c.as_text())
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// A sender for tool progress updates during execution.
///
/// Each update is forwarded to event subscribers and also counts as an
/// incremental progress signal: the dispatcher rearms its idle-timeout window
/// whenever one arrives.
#[derive(Clone)]
pub struct ProgressSender {
    bus: EventBus,
    keepalive: mpsc::UnboundedSender<()>,
    tool_call_id: String,
    tool_name: String,
}

impl ProgressSender {
    /// Create a new progress sender for a specific tool invocation.
    pub fn new(
        bus: EventBus,
        keepalive: mpsc::UnboundedSender<()>,
        tool_call_id: impl Into<String>,
        tool_name: impl Into<String>,
    ) -> Self {
        Self {
            bus,
            keepalive,
            tool_call_id: tool_call_id.into(),
            tool_name: tool_name.into(),
        }
    }

    /// Send a progress update.
    pub fn send(&self, content: impl Into<String>) {
        self.bus.emit(AgentEvent::ToolExecutionUpdate {
            tool_call_id: self.tool_call_id.clone(),
            tool_name: self.tool_name.clone(),
            content: content.into(),
        });
        let _ = self.keepalive.send(());
    }
}

/// Trait for executable tools
#[async_trait]
pub trait Tool: Send + Sync {
    /// Tool name (used in API calls)
    fn name(&self) -> &str;

    /// Tool description for the model
    fn description(&self) -> &str;

    /// JSON Schema for parameters
    fn parameters_schema(&self) -> serde_json::Value;

    /// Execute the tool with the given arguments.
    ///
    /// `cancel` is this call's own token; implementations should observe it
    /// at their suspension points and return promptly once it fires.
    async fn execute(
        &self,
        tool_call_id: &str,
        arguments: serde_json::Value,
        cancel: CancellationToken,
    ) -> ToolOutput;

    /// Execute the tool with progress reporting support.
    ///
    /// Default implementation ignores the progress sender and delegates to
    /// `execute()`. Long-running tools should override this and send
    /// periodic updates, which also keeps the idle timeout from firing.
    async fn execute_with_progress(
        &self,
        tool_call_id: &str,
        arguments: serde_json::Value,
        cancel: CancellationToken,
        _progress: ProgressSender,
    ) -> ToolOutput {
        self.execute(tool_call_id, arguments, cancel).await
    }
}

/// Type alias for a boxed tool
pub type BoxedTool = Arc<dyn Tool>;

/// Convert a Tool to a wire tool definition
pub fn to_api_tool(tool: &dyn Tool) -> wren_ai::ToolDefinition {
    wren_ai::ToolDefinition {
        name: tool.name().to_string(),
        description: tool.description().to_string(),
        parameters: tool.parameters_schema(),
    }
}
