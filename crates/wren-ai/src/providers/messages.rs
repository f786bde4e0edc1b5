//! Messages-style wire adapter
//!
//! Speaks the SSE dialect that frames assistant output as explicitly
//! delimited content blocks (`content_block_start` / `delta` / `stop`). The
//! explicit framing maps 1:1 onto the part vocabulary; no boundary synthesis
//! is needed.

use async_stream::stream;
use futures::StreamExt;
use reqwest_eventsource::{Event, EventSource};
use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    part::{Part, PartStream},
    providers::Provider,
    types::{Content, GenerationRequest, Message, StopReason, ToolDefinition, Usage},
};

const WIRE_VERSION: &str = "2023-06-01";

/// Adapter for messages-style providers
pub struct MessagesProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    max_tokens_default: u32,
}

impl MessagesProvider {
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
            max_tokens_default: 8192,
        }
    }

    /// Create from the `ANTHROPIC_API_KEY` environment variable
    pub fn from_env(model: impl Into<String>) -> Result<Self> {
        let api_key = std::env::var("ANTHROPIC_API_KEY").map_err(|_| Error::InvalidApiKey)?;
        Ok(Self::new(api_key, "https://api.anthropic.com", model))
    }

    fn build_request(&self, request: &GenerationRequest) -> WireRequest {
        WireRequest {
            model: self.model.clone(),
            messages: convert_messages(&request.messages),
            max_tokens: request.max_tokens.unwrap_or(self.max_tokens_default),
            stream: true,
            system: request.system_prompt.clone(),
            temperature: request.temperature,
            tools: if request.tools.is_empty() {
                None
            } else {
                Some(convert_tools(&request.tools))
            },
        }
    }
}

#[async_trait::async_trait]
impl Provider for MessagesProvider {
    fn name(&self) -> &str {
        "messages"
    }

    async fn open(&self, request: &GenerationRequest) -> Result<PartStream> {
        let body = self.build_request(request);
        let url = format!("{}/v1/messages", self.base_url);

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            "x-api-key",
            self.api_key
                .parse()
                .map_err(|_| Error::Auth("API key is not a valid header value".to_string()))?,
        );
        headers.insert("accept", "application/json".parse().unwrap());
        headers.insert("content-type", "application/json".parse().unwrap());
        headers.insert("anthropic-version", WIRE_VERSION.parse().unwrap());

        let request_builder = self.client.post(&url).headers(headers).json(&body);

        let event_source = EventSource::new(request_builder)
            .map_err(|e| Error::Sse(format!("Failed to create event source: {}", e)))?;

        Ok(Box::pin(create_stream(event_source)))
    }
}

fn create_stream(mut event_source: EventSource) -> impl futures::Stream<Item = Part> {
    stream! {
        let mut mapper = BlockMapper::default();

        while let Some(event_result) = event_source.next().await {
            match event_result {
                Ok(Event::Open) => {}
                Ok(Event::Message(message)) => {
                    match mapper.map(&message.event, &message.data) {
                        Ok(parts) => {
                            for part in parts {
                                yield part;
                            }
                            if mapper.finished {
                                return;
                            }
                        }
                        Err(e) => {
                            yield Part::StreamError {
                                message: format!("Failed to parse event: {}", e),
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

        // Connection closed without message_stop
        yield Part::StreamError {
            message: "stream closed before message_stop".to_string(),
        };
    }
}

/// Kind of each wire content block, tracked by index so block stops can be
/// routed to the right part.
#[derive(Debug, Clone, Default)]
enum BlockKind {
    #[default]
    Empty,
    Text,
    Thinking,
    ToolCall {
        id: String,
    },
}

#[derive(Default)]
struct BlockMapper {
    blocks: Vec<BlockKind>,
    usage: Usage,
    stop_reason: Option<StopReason>,
    finished: bool,
}

impl BlockMapper {
    fn map(&mut self, event: &str, data: &str) -> serde_json::Result<Vec<Part>> {
        let mut parts = Vec::new();

        match event {
            "message_start" => {
                let parsed: MessageStartEvent = serde_json::from_str(data)?;
                self.record_usage(&parsed.message.usage);
            }
            "content_block_start" => {
                let parsed: ContentBlockStartEvent = serde_json::from_str(data)?;
                let index = parsed.index as usize;
                while self.blocks.len() <= index {
                    self.blocks.push(BlockKind::Empty);
                }
                match parsed.content_block.block_type.as_str() {
                    "text" => self.blocks[index] = BlockKind::Text,
                    "thinking" => self.blocks[index] = BlockKind::Thinking,
                    "tool_use" => {
                        let id = parsed.content_block.id.unwrap_or_default();
                        let name = parsed.content_block.name.unwrap_or_default();
                        self.blocks[index] = BlockKind::ToolCall { id: id.clone() };
                        parts.push(Part::ToolCallStart { id, name });
                    }
                    other => {
                        tracing::debug!("ignoring unknown content block type '{}'", other);
                    }
                }
            }
            "content_block_delta" => {
                let parsed: ContentBlockDeltaEvent = serde_json::from_str(data)?;
                let index = parsed.index as usize;
                let kind = self.blocks.get(index).cloned().unwrap_or_default();
                match (parsed.delta.delta_type.as_str(), kind) {
                    ("text_delta", BlockKind::Text) => {
                        parts.push(Part::TextDelta {
                            delta: parsed.delta.text.unwrap_or_default(),
                        });
                    }
                    ("thinking_delta", BlockKind::Thinking) => {
                        parts.push(Part::ThinkingDelta {
                            delta: parsed.delta.thinking.unwrap_or_default(),
                        });
                    }
                    ("input_json_delta", BlockKind::ToolCall { id }) => {
                        parts.push(Part::ToolCallArgumentDelta {
                            id,
                            delta: parsed.delta.partial_json.unwrap_or_default(),
                        });
                    }
                    _ => {}
                }
            }
            "content_block_stop" => {
                let parsed: ContentBlockStopEvent = serde_json::from_str(data)?;
                let index = parsed.index as usize;
                if let Some(BlockKind::ToolCall { id }) = self.blocks.get(index).cloned() {
                    parts.push(Part::ToolCallEnd { id });
                }
            }
            "message_delta" => {
                let parsed: MessageDeltaEvent = serde_json::from_str(data)?;
                if let Some(ref reason) = parsed.delta.stop_reason {
                    self.stop_reason = Some(map_stop_reason(reason));
                }
                self.record_usage(&parsed.usage);
            }
            "message_stop" => {
                self.finished = true;
                parts.push(Part::StreamDone {
                    stop_reason: self.stop_reason.unwrap_or(StopReason::Stop),
                    usage: self.usage.clone(),
                });
            }
            "error" => {
                let parsed: WireErrorEvent = serde_json::from_str(data)?;
                self.finished = true;
                parts.push(Part::StreamError {
                    message: parsed.error.message,
                });
            }
            "ping" => {}
            other => {
                tracing::debug!("ignoring unknown stream event '{}'", other);
            }
        }

        Ok(parts)
    }

    fn record_usage(&mut self, usage: &UsageInfo) {
        self.usage.input = usage.input_tokens;
        self.usage.output = usage.output_tokens;
        self.usage.cache_read = usage.cache_read_input_tokens.unwrap_or(0);
        self.usage.cache_write = usage.cache_creation_input_tokens.unwrap_or(0);
    }
}

fn map_stop_reason(reason: &str) -> StopReason {
    match reason {
        "end_turn" => StopReason::Stop,
        "max_tokens" => StopReason::Length,
        "tool_use" => StopReason::ToolUse,
        "stop_sequence" => StopReason::Stop,
        _ => StopReason::Stop,
    }
}

// Request types

#[derive(Debug, Serialize)]
struct WireRequest {
    model: String,
    messages: Vec<WireMessage>,
    max_tokens: u32,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<WireTool>>,
}

#[derive(Debug, Serialize)]
struct WireMessage {
    role: String,
    content: serde_json::Value,
}

#[derive(Debug, Serialize)]
struct WireTool {
    name: String,
    description: String,
    input_schema: serde_json::Value,
}

fn convert_messages(messages: &[Message]) -> Vec<WireMessage> {
    let mut result = vec![];

    for message in messages {
        match message {
            Message::User { content, .. } => {
                let blocks: Vec<serde_json::Value> = content
                    .iter()
                    .map(|c| match c {
                        Content::Text { text } => {
                            serde_json::json!({ "type": "text", "text": text })
                        }
                        Content::Image { data, mime_type } => {
                            serde_json::json!({
                                "type": "image",
                                "source": {
                                    "type": "base64",
                                    "media_type": mime_type,
                                    "data": data
                                }
                            })
                        }
                        _ => serde_json::json!({ "type": "text", "text": "" }),
                    })
                    .collect();

                result.push(WireMessage {
                    role: "user".to_string(),
                    content: serde_json::Value::Array(blocks),
                });
            }
            Message::Assistant { content, .. } => {
                let blocks: Vec<serde_json::Value> = content
                    .iter()
                    .filter_map(|c| match c {
                        Content::Text { text } => {
                            Some(serde_json::json!({ "type": "text", "text": text }))
                        }
                        Content::Thinking { thinking } => Some(serde_json::json!({
                            "type": "text",
                            "text": format!("<thinking>\n{}\n</thinking>", thinking)
                        })),
                        Content::ToolCall {
                            id,
                            name,
                            arguments,
                        } => Some(serde_json::json!({
                            "type": "tool_use",
                            "id": id,
                            "name": name,
                            "input": arguments
                        })),
                        Content::Image { .. } => None,
                    })
                    .collect();

                if !blocks.is_empty() {
                    result.push(WireMessage {
                        role: "assistant".to_string(),
                        content: serde_json::Value::Array(blocks),
                    });
                }
            }
            Message::ToolResult {
                tool_call_id,
                content,
                is_error,
                ..
            } => {
                let text_content: String = content
                    .iter()
                    .filter_map(|c| c.as_text())
                    .collect::<Vec<_>>()
                    .join("\n");

                let tool_result = serde_json::json!({
                    "type": "tool_result",
                    "tool_use_id": tool_call_id,
                    "content": text_content,
                    "is_error": is_error
                });

                result.push(WireMessage {
                    role: "user".to_string(),
                    content: serde_json::Value::Array(vec![tool_result]),
                });
            }
        }
    }

    result
}

fn convert_tools(tools: &[ToolDefinition]) -> Vec<WireTool> {
    tools
        .iter()
        .map(|tool| {
            let input_schema = if tool.parameters.is_object() {
                let mut schema = tool.parameters.clone();
                if let Some(obj) = schema.as_object_mut() {
                    obj.entry("type").or_insert(serde_json::json!("object"));
                }
                schema
            } else {
                serde_json::json!({
                    "type": "object",
                    "properties": {},
                    "required": []
                })
            };

            WireTool {
                name: tool.name.clone(),
                description: tool.description.clone(),
                input_schema,
            }
        })
        .collect()
}

// Response event types

#[derive(Debug, Deserialize)]
struct MessageStartEvent {
    message: MessageInfo,
}

#[derive(Debug, Deserialize)]
struct MessageInfo {
    usage: UsageInfo,
}

#[derive(Debug, Deserialize)]
struct UsageInfo {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
    cache_read_input_tokens: Option<u32>,
    cache_creation_input_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ContentBlockStartEvent {
    index: u32,
    content_block: ContentBlockInfo,
}

#[derive(Debug, Deserialize)]
struct ContentBlockInfo {
    #[serde(rename = "type")]
    block_type: String,
    id: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentBlockDeltaEvent {
    index: u32,
    delta: DeltaInfo,
}

#[derive(Debug, Deserialize)]
struct DeltaInfo {
    #[serde(rename = "type")]
    delta_type: String,
    text: Option<String>,
    thinking: Option<String>,
    partial_json: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentBlockStopEvent {
    index: u32,
}

#[derive(Debug, Deserialize)]
struct MessageDeltaEvent {
    delta: MessageDelta,
    usage: UsageInfo,
}

#[derive(Debug, Deserialize)]
struct MessageDelta {
    stop_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireErrorEvent {
    error: WireError,
}

#[derive(Debug, Deserialize)]
struct WireError {
    message: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(mapper: &mut BlockMapper, event: &str, data: &str) -> Vec<Part> {
        mapper.map(event, data).expect("valid event json")
    }

    #[test]
    fn test_tool_block_lifecycle() {
        let mut mapper = BlockMapper::default();
        let parts = map(
            &mut mapper,
            "content_block_start",
            r#"{"index":0,"content_block":{"type":"tool_use","id":"toolu_1","name":"read"}}"#,
        );
        assert!(
            matches!(&parts[0], Part::ToolCallStart { id, name } if id == "toolu_1" && name == "read")
        );

        let parts = map(
            &mut mapper,
            "content_block_delta",
            r#"{"index":0,"delta":{"type":"input_json_delta","partial_json":"{\"path\":\"/a\"}"}}"#,
        );
        assert!(
            matches!(&parts[0], Part::ToolCallArgumentDelta { id, delta } if id == "toolu_1" && delta.contains("path"))
        );

        let parts = map(&mut mapper, "content_block_stop", r#"{"index":0}"#);
        assert!(matches!(&parts[0], Part::ToolCallEnd { id } if id == "toolu_1"));
    }

    #[test]
    fn test_text_and_thinking_deltas() {
        let mut mapper = BlockMapper::default();
        map(
            &mut mapper,
            "content_block_start",
            r#"{"index":0,"content_block":{"type":"thinking"}}"#,
        );
        let parts = map(
            &mut mapper,
            "content_block_delta",
            r#"{"index":0,"delta":{"type":"thinking_delta","thinking":"hmm"}}"#,
        );
        assert!(matches!(&parts[0], Part::ThinkingDelta { delta } if delta == "hmm"));

        map(
            &mut mapper,
            "content_block_start",
            r#"{"index":1,"content_block":{"type":"text"}}"#,
        );
        let parts = map(
            &mut mapper,
            "content_block_delta",
            r#"{"index":1,"delta":{"type":"text_delta","text":"hi"}}"#,
        );
        assert!(matches!(&parts[0], Part::TextDelta { delta } if delta == "hi"));

        // Text block stops produce no part; starts are inferred downstream
        let parts = map(&mut mapper, "content_block_stop", r#"{"index":1}"#);
        assert!(parts.is_empty());
    }

    #[test]
    fn test_message_stop_carries_stop_reason_and_usage() {
        let mut mapper = BlockMapper::default();
        map(
            &mut mapper,
            "message_start",
            r#"{"message":{"usage":{"input_tokens":100,"output_tokens":0}}}"#,
        );
        map(
            &mut mapper,
            "message_delta",
            r#"{"delta":{"stop_reason":"tool_use"},"usage":{"input_tokens":100,"output_tokens":25,"cache_read_input_tokens":10}}"#,
        );
        let parts = map(&mut mapper, "message_stop", "{}");
        match &parts[0] {
            Part::StreamDone { stop_reason, usage } => {
                assert_eq!(*stop_reason, StopReason::ToolUse);
                assert_eq!(usage.input, 100);
                assert_eq!(usage.output, 25);
                assert_eq!(usage.cache_read, 10);
            }
            other => panic!("expected StreamDone, got {:?}", other),
        }
        assert!(mapper.finished);
    }

    #[test]
    fn test_wire_error_event() {
        let mut mapper = BlockMapper::default();
        let parts = map(
            &mut mapper,
            "error",
            r#"{"error":{"type":"overloaded_error","message":"Overloaded"}}"#,
        );
        assert!(matches!(&parts[0], Part::StreamError { message } if message == "Overloaded"));
        assert!(mapper.finished);
    }

    #[test]
    fn test_convert_tools_defaults_schema_type() {
        let tools = vec![ToolDefinition::new(
            "read",
            "Read a file",
            serde_json::json!({"properties": {"path": {"type": "string"}}}),
        )];
        let converted = convert_tools(&tools);
        assert_eq!(converted[0].input_schema["type"], "object");
    }
}
