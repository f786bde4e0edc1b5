//! Chat-completions style wire adapter
//!
//! Speaks the OpenAI-compatible `/chat/completions` SSE dialect. The wire has
//! no explicit end marker for a tool call's argument stream, so the adapter
//! synthesizes `ToolCallEnd` boundaries at the points the wire implies one: a
//! different tool index starting, or a terminal `finish_reason`. A stream that
//! closes with tool calls still open is passed through unterminated; declaring
//! the turn malformed is the consumer's job.

use async_stream::stream;
use futures::StreamExt;
use reqwest_eventsource::{Event, EventSource};
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    part::{Part, PartStream},
    providers::Provider,
    types::{Content, GenerationRequest, Message, StopReason, Usage},
};

/// Adapter for chat-completions style providers
pub struct ChatCompletionsProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl ChatCompletionsProvider {
    /// Create a new adapter for the given endpoint and model
    pub fn new(
        api_key: impl Into<String>,
        base_url: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_key: api_key.into(),
            base_url: base_url.into(),
            model: model.into(),
        }
    }

    /// Create from the `OPENAI_API_KEY` environment variable
    pub fn from_env(model: impl Into<String>) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| Error::InvalidApiKey)?;
        Ok(Self::new(api_key, "https://api.openai.com/v1", model))
    }

    fn build_request(&self, request: &GenerationRequest) -> ChatRequest {
        let mut messages = Vec::new();

        if let Some(ref system_prompt) = request.system_prompt {
            messages.push(ChatMessage {
                role: "system".to_string(),
                content: Some(system_prompt.clone()),
                tool_calls: None,
                tool_call_id: None,
            });
        }

        for msg in &request.messages {
            messages.push(convert_message(msg));
        }

        let tools = if request.tools.is_empty() {
            None
        } else {
            Some(
                request
                    .tools
                    .iter()
                    .map(|t| ChatTool {
                        tool_type: "function".to_string(),
                        function: ChatFunction {
                            name: t.name.clone(),
                            description: Some(t.description.clone()),
                            parameters: Some(t.parameters.clone()),
                        },
                    })
                    .collect(),
            )
        };

        let has_tools = tools.is_some();
        ChatRequest {
            model: self.model.clone(),
            messages,
            stream: true,
            stream_options: StreamOptions {
                include_usage: true,
            },
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            tools,
            tool_choice: if has_tools {
                Some(serde_json::json!("auto"))
            } else {
                None
            },
        }
    }
}

#[async_trait::async_trait]
impl Provider for ChatCompletionsProvider {
    fn name(&self) -> &str {
        "chat_completions"
    }

    async fn open(&self, request: &GenerationRequest) -> Result<PartStream> {
        let body = self.build_request(request);
        let url = format!("{}/chat/completions", self.base_url);

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            "Authorization",
            format!("Bearer {}", self.api_key)
                .parse()
                .map_err(|_| Error::Auth("API key is not a valid header value".to_string()))?,
        );
        headers.insert("content-type", "application/json".parse().unwrap());

        let request_builder = self.client.post(&url).headers(headers).json(&body);

        let event_source = EventSource::new(request_builder)
            .map_err(|e| Error::Sse(format!("Failed to create event source: {}", e)))?;

        Ok(Box::pin(create_stream(event_source)))
    }
}

fn convert_message(msg: &Message) -> ChatMessage {
    match msg {
        Message::User { content, .. } => ChatMessage {
            role: "user".to_string(),
            content: Some(
                content
                    .iter()
                    .filter_map(|c| c.as_text())
                    .collect::<Vec<_>>()
                    .join(""),
            ),
            tool_calls: None,
            tool_call_id: None,
        },
        Message::Assistant { content, .. } => {
            let mut text_parts = Vec::new();
            let mut tool_calls = Vec::new();

            for c in content {
                match c {
                    Content::Text { text } => text_parts.push(text.clone()),
                    Content::ToolCall {
                        id,
                        name,
                        arguments,
                    } => {
                        tool_calls.push(ChatToolCall {
                            id: id.clone(),
                            call_type: "function".to_string(),
                            function: ChatFunctionCall {
                                name: name.clone(),
                                arguments: serde_json::to_string(arguments).unwrap_or_default(),
                            },
                        });
                    }
                    _ => {}
                }
            }

            ChatMessage {
                role: "assistant".to_string(),
                content: if text_parts.is_empty() {
                    None
                } else {
                    Some(text_parts.join(""))
                },
                tool_calls: if tool_calls.is_empty() {
                    None
                } else {
                    Some(tool_calls)
                },
                tool_call_id: None,
            }
        }
        Message::ToolResult {
            tool_call_id,
            content,
            ..
        } => ChatMessage {
            role: "tool".to_string(),
            content: Some(
                content
                    .iter()
                    .filter_map(|c| c.as_text())
                    .collect::<Vec<_>>()
                    .join("\n"),
            ),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.clone()),
        },
    }
}

fn create_stream(mut event_source: EventSource) -> impl futures::Stream<Item = Part> {
    stream! {
        let mut mapper = ChunkMapper::default();

        while let Some(event) = event_source.next().await {
            match event {
                Ok(Event::Open) => {}
                Ok(Event::Message(msg)) => {
                    if msg.data == "[DONE]" {
                        break;
                    }
                    match serde_json::from_str::<StreamChunk>(&msg.data) {
                        Ok(chunk) => {
                            for part in mapper.map(&chunk) {
                                yield part;
                            }
                        }
                        Err(e) => {
                            yield Part::StreamError {
                                message: format!("Failed to parse chunk: {}", e),
                            };
                            return;
                        }
                    }
                }
                Err(e) => {
                    yield Part::StreamError {
                        message: format!("SSE error: {}", e),
                    };
                    return;
                }
            }
        }

        yield mapper.finish();
    }
}

/// Incremental chunk-to-part translation state.
///
/// Tracks which wire tool index is currently streaming arguments so the
/// implied end boundaries can be synthesized in the right places.
#[derive(Default)]
struct ChunkMapper {
    /// Assigned call id per wire tool index
    tool_ids: Vec<Option<String>>,
    /// Wire index currently accumulating arguments
    open_index: Option<usize>,
    usage: Usage,
    finish_reason: Option<String>,
}

impl ChunkMapper {
    fn map(&mut self, chunk: &StreamChunk) -> Vec<Part> {
        let mut parts = Vec::new();

        if let Some(ref chunk_usage) = chunk.usage {
            self.usage.input = chunk_usage.prompt_tokens;
            self.usage.output = chunk_usage.completion_tokens;
            self.usage.cache_read = chunk_usage
                .prompt_tokens_details
                .as_ref()
                .and_then(|d| d.cached_tokens)
                .unwrap_or(0);
        }

        for choice in &chunk.choices {
            // Providers surface reasoning under differing field names
            if let Some(reasoning) = choice.delta.reasoning() {
                parts.push(Part::ThinkingDelta {
                    delta: reasoning.to_string(),
                });
            }

            if let Some(ref content) = choice.delta.content {
                if !content.is_empty() {
                    parts.push(Part::TextDelta {
                        delta: content.clone(),
                    });
                }
            }

            if let Some(ref tool_calls) = choice.delta.tool_calls {
                for tc in tool_calls {
                    let idx = tc.index as usize;

                    if let Some(ref function) = tc.function {
                        let is_new =
                            function.name.is_some() && self.id_at(idx).is_none();
                        if is_new {
                            if let Some(open) = self.open_index {
                                if open != idx {
                                    if let Some(id) = self.id_at(open) {
                                        parts.push(Part::ToolCallEnd { id });
                                    }
                                }
                            }

                            let id = tc
                                .id
                                .clone()
                                .filter(|s| !s.is_empty())
                                .unwrap_or_else(|| format!("tool_call_{}", idx));
                            while self.tool_ids.len() <= idx {
                                self.tool_ids.push(None);
                            }
                            self.tool_ids[idx] = Some(id.clone());
                            self.open_index = Some(idx);

                            parts.push(Part::ToolCallStart {
                                id,
                                name: function.name.clone().unwrap_or_default(),
                            });
                        }

                        if let Some(ref args) = function.arguments {
                            if !args.is_empty() {
                                if let Some(id) = self.id_at(idx) {
                                    parts.push(Part::ToolCallArgumentDelta {
                                        id,
                                        delta: args.clone(),
                                    });
                                }
                            }
                        }
                    }
                }
            }

            if let Some(ref reason) = choice.finish_reason {
                self.finish_reason = Some(reason.clone());
                if let Some(open) = self.open_index.take() {
                    if let Some(id) = self.id_at(open) {
                        parts.push(Part::ToolCallEnd { id });
                    }
                }
            }
        }

        parts
    }

    /// Terminal part for the `[DONE]` sentinel. A stream that never carried a
    /// finish_reason leaves any open tool call unterminated on purpose.
    fn finish(self) -> Part {
        Part::StreamDone {
            stop_reason: map_finish_reason(self.finish_reason.as_deref()),
            usage: self.usage,
        }
    }

    fn id_at(&self, idx: usize) -> Option<String> {
        self.tool_ids.get(idx).and_then(|id| id.clone())
    }
}

fn map_finish_reason(reason: Option<&str>) -> StopReason {
    match reason {
        Some("stop") => StopReason::Stop,
        Some("length") => StopReason::Length,
        Some("tool_calls") => StopReason::ToolUse,
        _ => StopReason::Stop,
    }
}

// Request types

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    stream: bool,
    stream_options: StreamOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<ChatTool>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_choice: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct StreamOptions {
    include_usage: bool,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_calls: Option<Vec<ChatToolCall>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tool_call_id: Option<String>,
}

#[derive(Debug, Serialize)]
struct ChatTool {
    #[serde(rename = "type")]
    tool_type: String,
    function: ChatFunction,
}

#[derive(Debug, Serialize)]
struct ChatFunction {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parameters: Option<serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct ChatToolCall {
    id: String,
    #[serde(rename = "type")]
    call_type: String,
    function: ChatFunctionCall,
}

#[derive(Debug, Serialize)]
struct ChatFunctionCall {
    name: String,
    arguments: String,
}

// Streaming response types

#[derive(Debug, Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    #[serde(default)]
    usage: Option<StreamUsage>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StreamDelta {
    content: Option<String>,
    tool_calls: Option<Vec<StreamToolCall>>,
    reasoning_content: Option<String>,
    reasoning: Option<String>,
}

impl StreamDelta {
    fn reasoning(&self) -> Option<&str> {
        self.reasoning_content
            .as_deref()
            .or(self.reasoning.as_deref())
            .filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Deserialize)]
struct StreamToolCall {
    index: u32,
    id: Option<String>,
    function: Option<StreamFunction>,
}

#[derive(Debug, Deserialize)]
struct StreamFunction {
    name: Option<String>,
    arguments: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StreamUsage {
    prompt_tokens: u32,
    completion_tokens: u32,
    #[serde(default)]
    prompt_tokens_details: Option<PromptTokensDetails>,
}

#[derive(Debug, Deserialize)]
struct PromptTokensDetails {
    cached_tokens: Option<u32>,
}
