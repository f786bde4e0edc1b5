//! Tool dispatch: resolution, bounded-concurrency execution, ordered results

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use wren_ai::Message;

use crate::bus::EventBus;
use crate::events::AgentEvent;
use crate::tool::{BoxedTool, ProgressSender, ToolFailure, ToolOutput, to_api_tool};
use crate::turn::{ToolCall, ToolCallStatus};

/// Dispatch configuration
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Maximum tool executions running at once
    pub max_concurrency: usize,
    /// A call with no completion and no progress signal for this long is
    /// cancelled and marked timed out
    pub idle_timeout: Duration,
    /// How long a cancelled call gets to unwind before being abandoned
    pub grace_period: Duration,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 4,
            idle_timeout: Duration::from_secs(60),
            grace_period: Duration::from_secs(5),
        }
    }
}

/// A call that ran to an outcome, with its final status
#[derive(Debug, Clone)]
pub struct CompletedToolCall {
    pub call: ToolCall,
    pub output: ToolOutput,
}

impl CompletedToolCall {
    /// Convert to the tool-result message fed back to the model
    pub fn result_message(&self) -> Message {
        Message::tool_result(
            &self.call.id,
            &self.call.name,
            self.output.content.clone(),
            self.output.is_error,
        )
    }
}

/// Result of one dispatch round
#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    /// Exactly one entry per dispatched call, in original call order
    pub completed: Vec<CompletedToolCall>,
    /// Whether the round's cancellation token fired
    pub cancelled: bool,
}

impl DispatchOutcome {
    /// Tool-result messages in original call order
    pub fn result_messages(&self) -> Vec<Message> {
        self.completed.iter().map(|c| c.result_message()).collect()
    }
}

/// Resolves tool calls against the registered capability set and executes
/// them with bounded concurrency.
pub struct ToolDispatcher {
    tools: Vec<BoxedTool>,
    /// Cached compiled JSON schema validators keyed by tool name
    schema_cache: HashMap<String, Arc<jsonschema::Validator>>,
    config: DispatchConfig,
}

impl ToolDispatcher {
    pub fn new(config: DispatchConfig) -> Self {
        Self {
            tools: Vec::new(),
            schema_cache: HashMap::new(),
            config,
        }
    }

    /// Register a tool, compiling and caching its parameter schema validator
    pub fn register(&mut self, tool: BoxedTool) {
        let schema = tool.parameters_schema();
        match jsonschema::validator_for(&schema) {
            Ok(validator) => {
                self.schema_cache
                    .insert(tool.name().to_string(), Arc::new(validator));
            }
            Err(e) => {
                tracing::warn!(
                    "Invalid tool parameter schema for '{}', skipping validation: {}",
                    tool.name(),
                    e
                );
            }
        }
        self.tools.push(tool);
    }

    /// Registered tool names
    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    /// Wire definitions for every registered tool, in registration order
    pub fn api_tools(&self) -> Vec<wren_ai::ToolDefinition> {
        self.tools.iter().map(|t| to_api_tool(t.as_ref())).collect()
    }

    /// Execute one round of tool calls.
    ///
    /// Calls run concurrently up to `max_concurrency`; results come back in
    /// original call order regardless of completion order. A failure is
    /// always scoped to its own call.
    pub async fn dispatch(
        &self,
        calls: Vec<ToolCall>,
        cancel: CancellationToken,
        bus: &EventBus,
    ) -> DispatchOutcome {
        let idents: Vec<(String, String)> = calls
            .iter()
            .map(|c| (c.id.clone(), c.name.clone()))
            .collect();
        let mut slots: Vec<Option<CompletedToolCall>> =
            (0..calls.len()).map(|_| None).collect();

        let semaphore = Arc::new(Semaphore::new(self.config.max_concurrency.max(1)));
        let mut join_set = JoinSet::new();

        for (index, call) in calls.into_iter().enumerate() {
            let tool = self
                .tools
                .iter()
                .find(|t| t.name() == call.name)
                .cloned();
            let validator = self.schema_cache.get(&call.name).cloned();
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            let bus = bus.clone();
            let config = self.config.clone();

            join_set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                let completed = run_one(call, tool, validator, config, cancel, bus).await;
                (index, completed)
            });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, completed)) => slots[index] = Some(completed),
                Err(e) => tracing::warn!("tool task failed to join: {}", e),
            }
        }

        // Deterministic reassembly by original index
        let completed: Vec<CompletedToolCall> = slots
            .into_iter()
            .enumerate()
            .map(|(index, slot)| {
                slot.unwrap_or_else(|| {
                    let (id, name) = idents[index].clone();
                    CompletedToolCall {
                        call: ToolCall {
                            id,
                            name,
                            arguments: serde_json::Value::Null,
                            status: ToolCallStatus::Failed,
                        },
                        output: ToolOutput::failure(
                            ToolFailure::Execution,
                            "Tool task terminated abnormally",
                        ),
                    }
                })
            })
            .collect();

        let cancelled = cancel.is_cancelled()
            || completed
                .iter()
                .any(|c| c.output.failure == Some(ToolFailure::Cancelled));

        DispatchOutcome { completed, cancelled }
    }
}

async fn run_one(
    mut call: ToolCall,
    tool: Option<BoxedTool>,
    validator: Option<Arc<jsonschema::Validator>>,
    config: DispatchConfig,
    cancel: CancellationToken,
    bus: EventBus,
) -> CompletedToolCall {
    bus.emit(AgentEvent::ToolExecutionStart {
        tool_call_id: call.id.clone(),
        tool_name: call.name.clone(),
        arguments: call.arguments.clone(),
    });

    let output = if cancel.is_cancelled() {
        ToolOutput::failure(ToolFailure::Cancelled, "Cancelled before execution")
    } else {
        match tool {
            None => ToolOutput::failure(
                ToolFailure::UnknownTool,
                format!("Tool not found: {}", call.name),
            ),
            Some(tool) => {
                let validation_error = validator
                    .as_deref()
                    .and_then(|v| validate_arguments(&call.arguments, v));
                if let Some(message) = validation_error {
                    ToolOutput::failure(ToolFailure::InvalidArguments, message)
                } else {
                    call.status = ToolCallStatus::Running;
                    execute_with_idle_timeout(&tool, &call, &config, &cancel, &bus).await
                }
            }
        }
    };

    call.status = if output.failure == Some(ToolFailure::Cancelled) {
        ToolCallStatus::Cancelled
    } else if output.is_error {
        ToolCallStatus::Failed
    } else {
        ToolCallStatus::Succeeded
    };

    bus.emit(AgentEvent::ToolResult {
        tool_call_id: call.id.clone(),
        tool_name: call.name.clone(),
        result: output.text_content(),
        is_error: output.is_error,
    });

    CompletedToolCall { call, output }
}

async fn execute_with_idle_timeout(
    tool: &BoxedTool,
    call: &ToolCall,
    config: &DispatchConfig,
    cancel: &CancellationToken,
    bus: &EventBus,
) -> ToolOutput {
    let child = cancel.child_token();
    let (keepalive_tx, mut keepalive_rx) = mpsc::unbounded_channel();
    let progress = ProgressSender::new(
        bus.clone(),
        keepalive_tx.clone(),
        call.id.clone(),
        call.name.clone(),
    );

    let mut execution = Box::pin(tool.execute_with_progress(
        &call.id,
        call.arguments.clone(),
        child.clone(),
        progress,
    ));

    loop {
        tokio::select! {
            output = &mut execution => break output,
            _ = keepalive_rx.recv() => {
                // progress signal; the idle window rearms on the next pass
            }
            _ = cancel.cancelled() => {
                child.cancel();
                let _ = tokio::time::timeout(config.grace_period, &mut execution).await;
                break ToolOutput::failure(ToolFailure::Cancelled, "Cancelled");
            }
            _ = tokio::time::sleep(config.idle_timeout) => {
                tracing::warn!(
                    "tool '{}' made no progress within {:?}; cancelling",
                    call.name,
                    config.idle_timeout
                );
                child.cancel();
                let _ = tokio::time::timeout(config.grace_period, &mut execution).await;
                break ToolOutput::failure(
                    ToolFailure::Timeout,
                    format!(
                        "No progress within {:?}; execution cancelled",
                        config.idle_timeout
                    ),
                );
            }
        }
    }
}

/// Validate tool arguments using a pre-compiled validator.
/// Returns `Some(error_message)` if validation fails, `None` if valid.
fn validate_arguments(
    args: &serde_json::Value,
    validator: &jsonschema::Validator,
) -> Option<String> {
    let errors: Vec<String> = validator
        .iter_errors(args)
        .map(|e| {
            let path = e.instance_path.to_string();
            if path.is_empty() {
                e.to_string()
            } else {
                format!("{}: {}", path, e)
            }
        })
        .collect();

    if errors.is_empty() {
        None
    } else {
        Some(format!(
            "Tool argument validation failed:\n{}",
            errors.join("\n")
        ))
    }
}
