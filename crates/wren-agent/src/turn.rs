//! Turn state machine
//!
//! Aggregates the normalized part stream of one generation round into
//! turn-scoped events and a sealed [`Turn`]. Purely synchronous: the loop
//! feeds parts in arrival order and forwards the produced events, so event
//! order always matches part order. The only buffering is what boundary
//! detection requires (the open text/thinking segment and per-call argument
//! accumulators).

use serde::{Deserialize, Serialize};
use wren_ai::{AssistantMetadata, Content, Message, Part, StopReason, Usage};

use crate::events::AgentEvent;

/// Why a turn sealed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnReason {
    /// Model finished with no tool calls outstanding
    Stop,
    /// Model requested tool execution
    ToolCallsPending,
    /// Transport failure or stream boundary violation
    Error,
    /// Sealed by a cancellation request
    Cancelled,
}

/// Lifecycle of a requested tool invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolCallStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

/// A fully assembled tool invocation request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    pub arguments: serde_json::Value,
    pub status: ToolCallStatus,
}

impl ToolCall {
    /// Create a pending call (mainly for tests and manual dispatch)
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: serde_json::Value,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            arguments,
            status: ToolCallStatus::Pending,
        }
    }
}

/// What broke a turn that sealed with [`TurnReason::Error`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnErrorKind {
    /// The provider stream broke mid-flight
    Transport,
    /// The stream violated part boundaries
    Malformed,
}

/// Error detail carried by a failed turn
#[derive(Debug, Clone)]
pub struct TurnError {
    pub kind: TurnErrorKind,
    pub message: String,
}

/// One sealed generation round
#[derive(Debug, Clone)]
pub struct Turn {
    pub turn: u32,
    /// The assistant message assembled from the stream, content in arrival order
    pub message: Message,
    /// Exactly the tool calls whose end boundary was seen, in emission order
    pub tool_calls: Vec<ToolCall>,
    pub reason: TurnReason,
    pub usage: Usage,
    pub error: Option<TurnError>,
}

/// Engine states; transitions are driven by incoming parts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    Thinking,
    Generating,
    ToolCallAccumulating,
    Sealed,
}

enum Segment {
    Thinking(String),
    Text(String),
}

struct Accumulator {
    id: String,
    name: String,
    arguments_json: String,
}

/// The turn state machine
pub struct TurnEngine {
    turn: u32,
    state: TurnState,
    segment: Option<Segment>,
    content: Vec<Content>,
    /// Calls that started but have not seen their end boundary, start order
    open_calls: Vec<Accumulator>,
    /// Calls whose end boundary was seen, end-emission order
    completed: Vec<ToolCall>,
    malformed: Option<String>,
    wire_stop: Option<StopReason>,
    usage: Usage,
}

impl TurnEngine {
    pub fn new(turn: u32) -> Self {
        Self {
            turn,
            state: TurnState::Idle,
            segment: None,
            content: Vec::new(),
            open_calls: Vec::new(),
            completed: Vec::new(),
            malformed: None,
            wire_stop: None,
            usage: Usage::default(),
        }
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    /// Feed one part; events caused by it are appended to `events` in order.
    /// Returns the sealed turn when a terminal part arrives.
    pub fn feed(&mut self, part: Part, events: &mut Vec<AgentEvent>) -> Option<Turn> {
        if self.state == TurnState::Sealed {
            tracing::warn!("part received after turn sealed; dropping");
            return None;
        }

        match part {
            Part::ThinkingDelta { delta } => {
                if !matches!(self.segment, Some(Segment::Thinking(_))) {
                    self.close_segment(events);
                    events.push(AgentEvent::ThinkingStart);
                    self.segment = Some(Segment::Thinking(String::new()));
                }
                if let Some(Segment::Thinking(buf)) = self.segment.as_mut() {
                    buf.push_str(&delta);
                }
                self.state = TurnState::Thinking;
                events.push(AgentEvent::ThinkingDelta { delta });
                None
            }

            Part::TextDelta { delta } => {
                if !matches!(self.segment, Some(Segment::Text(_))) {
                    self.close_segment(events);
                    events.push(AgentEvent::TextStart);
                    self.segment = Some(Segment::Text(String::new()));
                }
                if let Some(Segment::Text(buf)) = self.segment.as_mut() {
                    buf.push_str(&delta);
                }
                self.state = TurnState::Generating;
                events.push(AgentEvent::TextDelta { delta });
                None
            }

            Part::ToolCallStart { id, name } => {
                self.close_segment(events);
                self.state = TurnState::ToolCallAccumulating;
                if self.open_calls.iter().any(|a| a.id == id)
                    || self.completed.iter().any(|c| c.id == id)
                {
                    self.mark_malformed(format!("duplicate tool call id '{}'", id));
                    return None;
                }
                events.push(AgentEvent::ToolCallStart {
                    tool_call_id: id.clone(),
                    tool_name: name.clone(),
                });
                self.open_calls.push(Accumulator {
                    id,
                    name,
                    arguments_json: String::new(),
                });
                None
            }

            Part::ToolCallArgumentDelta { id, delta } => {
                match self.open_calls.iter_mut().find(|a| a.id == id) {
                    Some(acc) => {
                        acc.arguments_json.push_str(&delta);
                        events.push(AgentEvent::ToolCallDelta {
                            tool_call_id: id,
                            delta,
                        });
                    }
                    None => {
                        self.mark_malformed(format!(
                            "argument delta for unknown tool call '{}'",
                            id
                        ));
                    }
                }
                None
            }

            Part::ToolCallEnd { id } => {
                let Some(pos) = self.open_calls.iter().position(|a| a.id == id) else {
                    self.mark_malformed(format!("end boundary for unknown tool call '{}'", id));
                    return None;
                };
                let acc = self.open_calls.remove(pos);
                // Arguments are only validated complete here, at the boundary.
                // A tool with no parameters streams no argument bytes at all.
                let parsed = if acc.arguments_json.trim().is_empty() {
                    Ok(serde_json::json!({}))
                } else {
                    serde_json::from_str(&acc.arguments_json)
                };
                match parsed {
                    Ok(arguments) => {
                        events.push(AgentEvent::ToolCallEnd {
                            tool_call_id: acc.id.clone(),
                            tool_name: acc.name.clone(),
                            arguments: arguments.clone(),
                        });
                        self.content
                            .push(Content::tool_call(&acc.id, &acc.name, arguments.clone()));
                        self.completed.push(ToolCall::new(acc.id, acc.name, arguments));
                    }
                    Err(e) => {
                        self.mark_malformed(format!(
                            "unparseable arguments for tool call '{}': {}",
                            id, e
                        ));
                    }
                }
                None
            }

            Part::StreamDone { stop_reason, usage } => {
                self.usage = usage;
                self.wire_stop = Some(stop_reason);
                if !self.open_calls.is_empty() {
                    let ids: Vec<&str> =
                        self.open_calls.iter().map(|a| a.id.as_str()).collect();
                    self.mark_malformed(format!(
                        "stream done with unterminated tool call accumulation: {}",
                        ids.join(", ")
                    ));
                }
                let sealed = if let Some(message) = self.malformed.take() {
                    self.seal_inner(
                        TurnReason::Error,
                        Some(TurnError {
                            kind: TurnErrorKind::Malformed,
                            message,
                        }),
                        events,
                    )
                } else if !self.completed.is_empty() {
                    self.seal_inner(TurnReason::ToolCallsPending, None, events)
                } else {
                    self.seal_inner(TurnReason::Stop, None, events)
                };
                Some(sealed)
            }

            Part::StreamError { message } => Some(self.seal_inner(
                TurnReason::Error,
                Some(TurnError {
                    kind: TurnErrorKind::Transport,
                    message,
                }),
                events,
            )),
        }
    }

    /// Seal from any state on a cancellation request
    pub fn seal_cancelled(&mut self, events: &mut Vec<AgentEvent>) -> Turn {
        self.seal_inner(TurnReason::Cancelled, None, events)
    }

    /// Seal with a transport error that did not arrive as a stream part
    /// (e.g. the underlying connection ended without a terminal part)
    pub fn seal_transport_error(
        &mut self,
        message: impl Into<String>,
        events: &mut Vec<AgentEvent>,
    ) -> Turn {
        self.seal_inner(
            TurnReason::Error,
            Some(TurnError {
                kind: TurnErrorKind::Transport,
                message: message.into(),
            }),
            events,
        )
    }

    fn seal_inner(
        &mut self,
        reason: TurnReason,
        error: Option<TurnError>,
        events: &mut Vec<AgentEvent>,
    ) -> Turn {
        self.close_segment(events);

        // Balance every start with an end. Discarded partials carry null
        // arguments and are never dispatched.
        for acc in self.open_calls.drain(..) {
            events.push(AgentEvent::ToolCallEnd {
                tool_call_id: acc.id,
                tool_name: acc.name,
                arguments: serde_json::Value::Null,
            });
        }

        self.state = TurnState::Sealed;

        let content = std::mem::take(&mut self.content);
        let tool_calls = std::mem::take(&mut self.completed);

        let message = Message::Assistant {
            content,
            metadata: AssistantMetadata {
                usage: self.usage.clone(),
                stop_reason: self.wire_stop,
                error_message: error.as_ref().map(|e| e.message.clone()),
                timestamp: chrono::Utc::now().timestamp_millis(),
                ..Default::default()
            },
        };

        events.push(AgentEvent::TurnEnd {
            turn: self.turn,
            reason,
            usage: self.usage.clone(),
        });

        Turn {
            turn: self.turn,
            message,
            tool_calls,
            reason,
            usage: self.usage.clone(),
            error,
        }
    }

    fn close_segment(&mut self, events: &mut Vec<AgentEvent>) {
        match self.segment.take() {
            Some(Segment::Thinking(thinking)) => {
                self.content.push(Content::thinking(thinking.clone()));
                events.push(AgentEvent::ThinkingEnd { thinking });
            }
            Some(Segment::Text(text)) => {
                self.content.push(Content::text(text.clone()));
                events.push(AgentEvent::TextEnd { text });
            }
            None => {}
        }
    }

    fn mark_malformed(&mut self, message: String) {
        if self.malformed.is_none() {
            tracing::warn!("malformed stream: {}", message);
            self.malformed = Some(message);
        }
    }
}
