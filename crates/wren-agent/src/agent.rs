//! The agentic loop: prompt queue, cycles, tool rounds, cancellation

use std::sync::Arc;

use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use wren_ai::{GenerationRequest, Message, PartStream, Provider, Usage};

use crate::bus::EventBus;
use crate::compaction::{
    CompactionConfig, CompactionDecision, CompactionEngine, CompactionError, CompactionOutcome,
    CompactionReason, OverflowPolicy, is_overflow_error,
};
use crate::conversation::Conversation;
use crate::dispatch::{DispatchConfig, ToolDispatcher};
use crate::error::{Error, Result};
use crate::events::AgentEvent;
use crate::handle::{AgentHandle, DEFAULT_QUEUE_CAPACITY, QueueFull, QueuedPrompt};
use crate::tool::BoxedTool;
use crate::turn::{Turn, TurnEngine, TurnErrorKind, TurnReason};

/// Agent configuration. Opaque constructed values; the core never parses
/// configuration files.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// System prompt
    pub system_prompt: Option<String>,
    /// Maximum tokens per response
    pub max_tokens: Option<u32>,
    /// Sampling temperature
    pub temperature: Option<f32>,
    /// Context compaction configuration
    pub compaction: CompactionConfig,
    /// Tool dispatch configuration
    pub dispatch: DispatchConfig,
    /// Bound on pending prompt submissions
    pub queue_capacity: usize,
    /// Cap on generation rounds within one cycle
    pub max_turns: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            system_prompt: None,
            max_tokens: None,
            temperature: None,
            compaction: CompactionConfig::default(),
            dispatch: DispatchConfig::default(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            max_turns: 50,
        }
    }
}

enum CycleEnd {
    Completed,
    Cancelled,
}

/// The agent: owns the conversation and sequences generation cycles.
///
/// One cycle runs at a time. Prompts submitted while a cycle is in flight
/// queue up FIFO and are drained afterwards; a cancellation request aborts
/// the in-flight provider call and tool executions and leaves the
/// conversation at its last consistent point.
pub struct Agent {
    config: AgentConfig,
    conversation: Conversation,
    dispatcher: ToolDispatcher,
    compaction: CompactionEngine,
    provider: Arc<dyn Provider>,
    bus: EventBus,
    handle: AgentHandle,
}

impl Agent {
    /// Create a new agent
    pub fn new(config: AgentConfig, provider: Arc<dyn Provider>) -> Self {
        let dispatcher = ToolDispatcher::new(config.dispatch.clone());
        let compaction = CompactionEngine::new(config.compaction.clone());
        let handle = AgentHandle::new(config.queue_capacity);
        Self {
            config,
            conversation: Conversation::default(),
            dispatcher,
            compaction,
            provider,
            bus: EventBus::default(),
            handle,
        }
    }

    /// Subscribe to agent events
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<AgentEvent> {
        self.bus.subscribe()
    }

    /// The event bus events are published on
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Get a cloneable handle for submitting prompts and cancelling
    pub fn handle(&self) -> AgentHandle {
        self.handle.clone()
    }

    /// Get the agent config
    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    /// Register a tool
    pub fn add_tool(&mut self, tool: BoxedTool) {
        self.dispatcher.register(tool);
    }

    /// Registered tool names
    pub fn tool_names(&self) -> Vec<&str> {
        self.dispatcher.tool_names()
    }

    /// Set the system prompt
    pub fn set_system_prompt(&mut self, prompt: impl Into<String>) {
        self.config.system_prompt = Some(prompt.into());
    }

    /// Current conversation state
    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    /// All conversation messages
    pub fn messages(&self) -> &[Message] {
        &self.conversation.messages
    }

    /// Set messages (for restoring a saved session)
    pub fn set_messages(&mut self, messages: Vec<Message>) {
        self.conversation.messages = messages;
    }

    /// Abort the current cycle
    pub fn abort(&self) {
        self.handle.abort();
    }

    /// Whether a cycle is currently running
    pub fn is_running(&self) -> bool {
        self.handle.is_running()
    }

    /// Submit a prompt without running the loop. Fails synchronously with
    /// [`QueueFull`] when the queue is at capacity.
    pub fn submit(&self, message: Message) -> std::result::Result<Uuid, QueueFull> {
        self.handle.submit(message)
    }

    /// Submit a text prompt and drive the loop until the queue drains
    pub async fn prompt(&mut self, input: &str) -> Result<()> {
        self.handle.submit(Message::user(input))?;
        self.run_until_idle().await
    }

    /// Drain queued prompts, running one cycle per prompt.
    ///
    /// Stops early on cancellation (remaining prompts stay queued, in order)
    /// or on a cycle error (prior commits intact).
    pub async fn run_until_idle(&mut self) -> Result<()> {
        self.handle.reset_cancel();
        self.handle.set_running(true);

        let mut result = Ok(());
        while let Some(prompt) = self.handle.dequeue() {
            match self.run_cycle(prompt).await {
                Ok(CycleEnd::Completed) => continue,
                Ok(CycleEnd::Cancelled) => break,
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }

        self.handle.set_running(false);
        result
    }

    /// Run one generation cycle for a dequeued prompt.
    ///
    /// Commit discipline: the user prompt commits up front; each turn's
    /// assistant message commits only when the turn (and its tool round, if
    /// any) finished un-cancelled. Cancellation and stream errors discard
    /// the staged turn, leaving the conversation consistent.
    async fn run_cycle(&mut self, prompt: QueuedPrompt) -> Result<CycleEnd> {
        self.conversation.push(prompt.message);
        self.conversation.last_error = None;
        self.bus.emit(AgentEvent::AgentStart);

        let cancel = self.handle.cancel_token();
        let mut turn_no = 0u32;
        let mut cycle_usage = Usage::default();

        let outcome = loop {
            if cancel.is_cancelled() {
                break Ok(CycleEnd::Cancelled);
            }

            turn_no += 1;
            if turn_no > self.config.max_turns {
                let err = Error::MaxTurns(self.config.max_turns);
                self.bus.emit(AgentEvent::Error {
                    message: err.to_string(),
                });
                break Err(err);
            }

            // Keep the context inside budget before every provider call
            match self.compaction.decide(&self.conversation.messages) {
                CompactionDecision::NoAction => {}
                CompactionDecision::Compact { target_tokens } => {
                    match self.compaction.config().policy {
                        OverflowPolicy::Stop => {
                            let estimated =
                                self.compaction.estimate(&self.conversation.messages);
                            let err = Error::ContextOverflow {
                                estimated,
                                budget: target_tokens,
                            };
                            self.bus.emit(AgentEvent::Error {
                                message: err.to_string(),
                            });
                            break Err(err);
                        }
                        OverflowPolicy::Continue => {
                            if let Err(e) = self.run_compaction(CompactionReason::Threshold) {
                                break Err(e.into());
                            }
                        }
                    }
                }
            }

            self.bus.emit(AgentEvent::TurnStart { turn: turn_no });

            let request = self.build_request();
            let parts = match self.provider.open(&request).await {
                Ok(parts) => parts,
                Err(e) => {
                    // The turn sealed before it produced anything
                    self.bus.emit(AgentEvent::TurnEnd {
                        turn: turn_no,
                        reason: TurnReason::Error,
                        usage: Usage::default(),
                    });
                    if e.is_context_overflow() {
                        match self.try_overflow_recovery() {
                            Ok(true) => continue,
                            Ok(false) => {}
                            Err(ce) => break Err(ce.into()),
                        }
                    }
                    self.bus.emit(AgentEvent::Error {
                        message: e.to_string(),
                    });
                    self.conversation.last_error = Some(e.to_string());
                    break Err(e.into());
                }
            };

            let turn = self.drive_turn(parts, turn_no, &cancel).await;
            cycle_usage.add(&turn.usage);
            self.conversation.total_usage.add(&turn.usage);

            match turn.reason {
                TurnReason::Cancelled => break Ok(CycleEnd::Cancelled),

                TurnReason::Error => {
                    let (kind, message) = match turn.error {
                        Some(e) => (e.kind, e.message),
                        None => (TurnErrorKind::Transport, "stream error".to_string()),
                    };
                    if kind == TurnErrorKind::Transport && is_overflow_error(&message) {
                        match self.try_overflow_recovery() {
                            Ok(true) => continue,
                            Ok(false) => {}
                            Err(ce) => break Err(ce.into()),
                        }
                    }
                    self.bus.emit(AgentEvent::Error {
                        message: message.clone(),
                    });
                    self.conversation.last_error = Some(message.clone());
                    break Err(match kind {
                        TurnErrorKind::Transport => Error::Stream(message),
                        TurnErrorKind::Malformed => Error::MalformedStream(message),
                    });
                }

                TurnReason::Stop => {
                    self.conversation.push(turn.message);
                    break Ok(CycleEnd::Completed);
                }

                TurnReason::ToolCallsPending => {
                    let round = self
                        .dispatcher
                        .dispatch(turn.tool_calls, cancel.clone(), &self.bus)
                        .await;
                    if round.cancelled {
                        // Discard the staged turn: no partial assistant
                        // message or unresolved tool call is committed
                        break Ok(CycleEnd::Cancelled);
                    }
                    self.conversation.push(turn.message);
                    for message in round.result_messages() {
                        self.conversation.push(message);
                    }
                    // Tool round done; loop again without a new prompt
                }
            }
        };

        self.bus.emit(AgentEvent::AgentEnd {
            total_turns: turn_no,
            total_usage: cycle_usage,
        });

        outcome
    }

    /// Consume the part stream through the turn engine, racing every read
    /// against the cancellation token and forwarding events in part order.
    async fn drive_turn(
        &self,
        mut parts: PartStream,
        turn_no: u32,
        cancel: &CancellationToken,
    ) -> Turn {
        let mut engine = TurnEngine::new(turn_no);
        let mut events = Vec::new();

        loop {
            let sealed = tokio::select! {
                _ = cancel.cancelled() => Some(engine.seal_cancelled(&mut events)),
                part = parts.next() => match part {
                    Some(part) => engine.feed(part, &mut events),
                    None => Some(engine.seal_transport_error(
                        "stream ended without a terminal part",
                        &mut events,
                    )),
                },
            };

            for event in events.drain(..) {
                self.bus.emit(event);
            }
            if let Some(turn) = sealed {
                return turn;
            }
        }
    }

    fn build_request(&self) -> GenerationRequest {
        GenerationRequest {
            system_prompt: self.config.system_prompt.clone(),
            messages: self.conversation.messages.clone(),
            tools: self.dispatcher.api_tools(),
            max_tokens: self.config.max_tokens,
            temperature: self.config.temperature,
        }
    }

    /// Run compaction, emitting its start/end events
    fn run_compaction(
        &mut self,
        reason: CompactionReason,
    ) -> std::result::Result<CompactionOutcome, CompactionError> {
        self.bus.emit(AgentEvent::CompactionStart { reason });
        match self.compaction.compact(&mut self.conversation) {
            Ok(outcome) => {
                self.bus.emit(AgentEvent::CompactionEnd {
                    tokens_before: outcome.tokens_before,
                    tokens_after: outcome.tokens_after,
                });
                Ok(outcome)
            }
            Err(e) => {
                self.bus.emit(AgentEvent::Error {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// After a provider-reported overflow: compact and retry the call, but
    /// only when the policy allows it and compaction actually shrank the
    /// context. Returns whether the caller should re-issue the provider call.
    fn try_overflow_recovery(&mut self) -> std::result::Result<bool, CompactionError> {
        if self.compaction.config().policy != OverflowPolicy::Continue {
            return Ok(false);
        }
        let outcome = self.run_compaction(CompactionReason::Overflow)?;
        Ok(outcome.passes > 0)
    }
}
