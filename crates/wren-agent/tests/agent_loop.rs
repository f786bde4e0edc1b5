//! End-to-end agent loop tests against a scripted provider.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use wren_ai::{GenerationRequest, Part, PartStream, Provider, StopReason, Usage};

use wren_agent::{
    Agent, AgentConfig, AgentEvent, CompactionConfig, DispatchConfig, Error, OverflowPolicy,
    QueueFull, Tool, ToolOutput, TurnReason,
};

/// One scripted provider call.
enum Script {
    /// Yield these parts, then end the stream
    Parts(Vec<Part>),
    /// Fail the call before any part is produced
    OpenError(wren_ai::Error),
    /// Yield the prefix, then never produce another part
    Hang(Vec<Part>),
}

/// Provider that replays one script per call, in order. When the scripts run
/// out it answers with a plain "done" turn.
struct ScriptedProvider {
    scripts: Mutex<VecDeque<Script>>,
}

impl ScriptedProvider {
    fn new(scripts: Vec<Script>) -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(scripts.into()),
        })
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn open(&self, _request: &GenerationRequest) -> wren_ai::Result<PartStream> {
        let script = self
            .scripts
            .lock()
            .pop_front()
            .unwrap_or_else(|| Script::Parts(vec![text("done"), done(StopReason::Stop)]));

        match script {
            Script::Parts(parts) => Ok(Box::pin(tokio_stream::iter(parts))),
            Script::OpenError(e) => Err(e),
            Script::Hang(prefix) => Ok(Box::pin(async_stream::stream! {
                for part in prefix {
                    yield part;
                }
                std::future::pending::<()>().await;
            })),
        }
    }
}

/// Echoes its `text` argument back.
struct EchoTool;

#[async_trait]
impl Tool for EchoTool {
    fn name(&self) -> &str {
        "echo"
    }
    fn description(&self) -> &str {
        "Echoes input"
    }
    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": { "text": { "type": "string" } },
            "required": ["text"]
        })
    }
    async fn execute(
        &self,
        _tool_call_id: &str,
        arguments: serde_json::Value,
        _cancel: CancellationToken,
    ) -> ToolOutput {
        let text = arguments
            .get("text")
            .and_then(|v| v.as_str())
            .unwrap_or("(empty)");
        ToolOutput::text(text)
    }
}

/// Never completes; used to exercise the idle timeout.
struct HangTool;

#[async_trait]
impl Tool for HangTool {
    fn name(&self) -> &str {
        "hang"
    }
    fn description(&self) -> &str {
        "Hangs forever"
    }
    fn parameters_schema(&self) -> serde_json::Value {
        serde_json::json!({"type": "object", "properties": {}})
    }
    async fn execute(
        &self,
        _tool_call_id: &str,
        _arguments: serde_json::Value,
        _cancel: CancellationToken,
    ) -> ToolOutput {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        ToolOutput::text("never")
    }
}

fn text(s: &str) -> Part {
    Part::TextDelta { delta: s.into() }
}

fn thinking(s: &str) -> Part {
    Part::ThinkingDelta { delta: s.into() }
}

fn done(stop_reason: StopReason) -> Part {
    Part::StreamDone {
        stop_reason,
        usage: Usage::default(),
    }
}

fn done_with_usage(stop_reason: StopReason, input: u32, output: u32) -> Part {
    Part::StreamDone {
        stop_reason,
        usage: Usage {
            input,
            output,
            ..Default::default()
        },
    }
}

fn tool_start(id: &str, name: &str) -> Part {
    Part::ToolCallStart {
        id: id.into(),
        name: name.into(),
    }
}

fn tool_args(id: &str, delta: &str) -> Part {
    Part::ToolCallArgumentDelta {
        id: id.into(),
        delta: delta.into(),
    }
}

fn tool_end(id: &str) -> Part {
    Part::ToolCallEnd { id: id.into() }
}

fn fast_dispatch() -> DispatchConfig {
    DispatchConfig {
        max_concurrency: 4,
        idle_timeout: Duration::from_millis(100),
        grace_period: Duration::from_millis(50),
    }
}

fn make_agent(scripts: Vec<Script>) -> Agent {
    let config = AgentConfig {
        system_prompt: Some("test agent".into()),
        dispatch: fast_dispatch(),
        ..Default::default()
    };
    let mut agent = Agent::new(config, ScriptedProvider::new(scripts));
    agent.add_tool(Arc::new(EchoTool));
    agent.add_tool(Arc::new(HangTool));
    agent
}

fn drain(rx: &mut broadcast::Receiver<AgentEvent>) -> Vec<AgentEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

fn kinds(events: &[AgentEvent]) -> Vec<&'static str> {
    events
        .iter()
        .map(|e| match e {
            AgentEvent::AgentStart => "agent_start",
            AgentEvent::TurnStart { .. } => "turn_start",
            AgentEvent::ThinkingStart => "thinking_start",
            AgentEvent::ThinkingDelta { .. } => "thinking_delta",
            AgentEvent::ThinkingEnd { .. } => "thinking_end",
            AgentEvent::TextStart => "text_start",
            AgentEvent::TextDelta { .. } => "text_delta",
            AgentEvent::TextEnd { .. } => "text_end",
            AgentEvent::ToolCallStart { .. } => "tool_call_start",
            AgentEvent::ToolCallDelta { .. } => "tool_call_delta",
            AgentEvent::ToolCallEnd { .. } => "tool_call_end",
            AgentEvent::ToolExecutionStart { .. } => "tool_execution_start",
            AgentEvent::ToolExecutionUpdate { .. } => "tool_execution_update",
            AgentEvent::ToolResult { .. } => "tool_result",
            AgentEvent::TurnEnd { .. } => "turn_end",
            AgentEvent::CompactionStart { .. } => "compaction_start",
            AgentEvent::CompactionEnd { .. } => "compaction_end",
            AgentEvent::Error { .. } => "error",
            AgentEvent::AgentEnd { .. } => "agent_end",
        })
        .collect()
}

#[tokio::test]
async fn test_simple_text_cycle() {
    let mut agent = make_agent(vec![Script::Parts(vec![
        text("Hello, world!"),
        done_with_usage(StopReason::Stop, 10, 5),
    ])]);
    let mut rx = agent.subscribe();

    agent.prompt("Say hello").await.unwrap();

    let events = drain(&mut rx);
    assert_eq!(
        kinds(&events),
        vec![
            "agent_start",
            "turn_start",
            "text_start",
            "text_delta",
            "text_end",
            "turn_end",
            "agent_end",
        ]
    );

    match &events[5] {
        AgentEvent::TurnEnd { reason, .. } => assert_eq!(*reason, TurnReason::Stop),
        other => panic!("expected TurnEnd, got {:?}", other),
    }

    assert_eq!(agent.messages().len(), 2);
    assert_eq!(agent.messages()[1].text(), "Hello, world!");
    assert_eq!(agent.conversation().total_usage.input, 10);
    assert_eq!(agent.conversation().total_usage.output, 5);
}

#[tokio::test]
async fn test_thinking_then_text_event_sequence() {
    let mut agent = make_agent(vec![Script::Parts(vec![
        thinking("a"),
        thinking("b"),
        text("hi"),
        done(StopReason::Stop),
    ])]);
    let mut rx = agent.subscribe();

    agent.prompt("think first").await.unwrap();

    let events = drain(&mut rx);
    assert_eq!(
        kinds(&events),
        vec![
            "agent_start",
            "turn_start",
            "thinking_start",
            "thinking_delta",
            "thinking_delta",
            "thinking_end",
            "text_start",
            "text_delta",
            "text_end",
            "turn_end",
            "agent_end",
        ]
    );
}

#[tokio::test]
async fn test_tool_round_feeds_results_back() {
    let mut agent = make_agent(vec![
        Script::Parts(vec![
            text("Running both."),
            // Two interleaved tool calls within one turn
            tool_start("c1", "echo"),
            tool_start("c2", "echo"),
            tool_args("c1", r#"{"text": "one"}"#),
            tool_end("c1"),
            tool_args("c2", r#"{"text": "two"}"#),
            tool_end("c2"),
            done(StopReason::ToolUse),
        ]),
        Script::Parts(vec![text("Both finished."), done(StopReason::Stop)]),
    ]);
    let mut rx = agent.subscribe();

    agent.prompt("run both tools").await.unwrap();

    // user, assistant (2 calls), 2 tool results, final assistant
    let messages = agent.messages();
    assert_eq!(messages.len(), 5);
    assert_eq!(messages[1].tool_calls().len(), 2);

    match &messages[2] {
        wren_ai::Message::ToolResult {
            tool_call_id,
            is_error,
            ..
        } => {
            assert_eq!(tool_call_id, "c1");
            assert!(!*is_error);
            assert_eq!(messages[2].text(), "one");
        }
        other => panic!("expected tool result, got {:?}", other),
    }
    match &messages[3] {
        wren_ai::Message::ToolResult { tool_call_id, .. } => {
            assert_eq!(tool_call_id, "c2");
            assert_eq!(messages[3].text(), "two");
        }
        other => panic!("expected tool result, got {:?}", other),
    }
    assert_eq!(messages[4].text(), "Both finished.");

    let events = drain(&mut rx);
    let event_kinds = kinds(&events);
    assert_eq!(
        event_kinds.iter().filter(|k| **k == "turn_start").count(),
        2
    );
    assert_eq!(
        event_kinds
            .iter()
            .filter(|k| **k == "tool_execution_start")
            .count(),
        2
    );
    assert_eq!(
        event_kinds.iter().filter(|k| **k == "tool_result").count(),
        2
    );
}

#[tokio::test]
async fn test_unknown_tool_fails_that_call_only() {
    let mut agent = make_agent(vec![
        Script::Parts(vec![
            tool_start("c1", "no_such_tool"),
            tool_args("c1", r#"{"arg": "value"}"#),
            tool_end("c1"),
            done(StopReason::ToolUse),
        ]),
        Script::Parts(vec![text("recovered"), done(StopReason::Stop)]),
    ]);

    agent.prompt("try it").await.unwrap();

    let messages = agent.messages();
    assert_eq!(messages.len(), 4);
    match &messages[2] {
        wren_ai::Message::ToolResult { is_error, .. } => {
            assert!(*is_error);
            assert!(messages[2].text().contains("Tool not found"));
        }
        other => panic!("expected tool result, got {:?}", other),
    }
    // The model saw the failure and answered anyway
    assert_eq!(messages[3].text(), "recovered");
}

#[tokio::test]
async fn test_timeout_and_success_appended_in_call_order() {
    let mut agent = make_agent(vec![
        Script::Parts(vec![
            tool_start("c1", "hang"),
            tool_end("c1"),
            tool_start("c2", "echo"),
            tool_args("c2", r#"{"text": "quick"}"#),
            tool_end("c2"),
            done(StopReason::ToolUse),
        ]),
        Script::Parts(vec![text("noted"), done(StopReason::Stop)]),
    ]);

    agent.prompt("one hangs, one returns").await.unwrap();

    let messages = agent.messages();
    assert_eq!(messages.len(), 5);
    match &messages[2] {
        wren_ai::Message::ToolResult {
            tool_call_id,
            is_error,
            ..
        } => {
            assert_eq!(tool_call_id, "c1");
            assert!(*is_error);
            assert!(messages[2].text().contains("No progress"));
        }
        other => panic!("expected tool result, got {:?}", other),
    }
    match &messages[3] {
        wren_ai::Message::ToolResult {
            tool_call_id,
            is_error,
            ..
        } => {
            assert_eq!(tool_call_id, "c2");
            assert!(!*is_error);
            assert_eq!(messages[3].text(), "quick");
        }
        other => panic!("expected tool result, got {:?}", other),
    }
}

#[tokio::test]
async fn test_sixth_submission_fails_queue_full() {
    let agent = make_agent(vec![]);
    let handle = agent.handle();

    for i in 0..5 {
        handle
            .submit(wren_ai::Message::user(format!("prompt {}", i)))
            .unwrap();
    }
    let err = handle.submit(wren_ai::Message::user("prompt 5")).unwrap_err();
    assert_eq!(err, QueueFull { capacity: 5 });
    assert_eq!(handle.queued(), 5);
}

#[tokio::test]
async fn test_queued_prompts_drain_in_order() {
    let scripts = (0..3)
        .map(|i| Script::Parts(vec![text(&format!("answer {}", i)), done(StopReason::Stop)]))
        .collect();
    let mut agent = make_agent(scripts);
    let handle = agent.handle();

    for i in 0..3 {
        handle
            .submit(wren_ai::Message::user(format!("question {}", i)))
            .unwrap();
    }
    agent.run_until_idle().await.unwrap();

    let messages = agent.messages();
    assert_eq!(messages.len(), 6);
    for i in 0..3 {
        assert_eq!(messages[i * 2].text(), format!("question {}", i));
        assert_eq!(messages[i * 2 + 1].text(), format!("answer {}", i));
    }
}

#[tokio::test]
async fn test_cancellation_leaves_conversation_consistent() {
    let mut agent = make_agent(vec![Script::Hang(vec![text("partial output")])]);
    let mut rx = agent.subscribe();
    let handle = agent.handle();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.abort();
    });

    agent.prompt("will be cancelled").await.unwrap();

    // Only the triggering user prompt was committed
    assert_eq!(agent.messages().len(), 1);
    assert_eq!(agent.messages()[0].text(), "will be cancelled");

    let events = drain(&mut rx);
    let turn_end = events
        .iter()
        .find_map(|e| match e {
            AgentEvent::TurnEnd { reason, .. } => Some(*reason),
            _ => None,
        })
        .expect("turn should have sealed");
    assert_eq!(turn_end, TurnReason::Cancelled);

    // The open text segment was still balanced
    let event_kinds = kinds(&events);
    assert!(event_kinds.contains(&"text_start"));
    assert!(event_kinds.contains(&"text_end"));
}

#[tokio::test]
async fn test_cancellation_during_tool_round_discards_staged_turn() {
    let mut agent = make_agent(vec![Script::Parts(vec![
        tool_start("c1", "hang"),
        tool_end("c1"),
        done(StopReason::ToolUse),
    ])]);
    let handle = agent.handle();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(30)).await;
        handle.abort();
    });

    agent.prompt("tool gets cancelled").await.unwrap();

    // Neither the assistant message nor any tool result was committed
    assert_eq!(agent.messages().len(), 1);
}

#[tokio::test]
async fn test_cancellation_preserves_queued_prompts() {
    let mut agent = make_agent(vec![Script::Hang(vec![])]);
    let handle = agent.handle();

    handle.submit(wren_ai::Message::user("first")).unwrap();
    handle.submit(wren_ai::Message::user("second")).unwrap();

    let abort_handle = agent.handle();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        abort_handle.abort();
    });

    agent.run_until_idle().await.unwrap();

    // The cancelled cycle consumed "first"; "second" stays queued in order
    assert_eq!(agent.handle().queued(), 1);
    assert_eq!(agent.messages().len(), 1);
    assert_eq!(agent.messages()[0].text(), "first");
}

#[tokio::test]
async fn test_stream_error_aborts_cycle_preserving_commits() {
    let mut agent = make_agent(vec![
        Script::Parts(vec![text("fine"), done(StopReason::Stop)]),
        Script::Parts(vec![
            text("Before error"),
            Part::StreamError {
                message: "Something went wrong".into(),
            },
        ]),
    ]);

    agent.prompt("first").await.unwrap();
    let err = agent.prompt("second").await.unwrap_err();

    match err {
        Error::Stream(message) => assert_eq!(message, "Something went wrong"),
        other => panic!("expected stream error, got {:?}", other),
    }

    // First cycle's commits intact; the broken turn left nothing behind
    let messages = agent.messages();
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0].text(), "first");
    assert_eq!(messages[1].text(), "fine");
    assert_eq!(messages[2].text(), "second");
    assert_eq!(
        agent.conversation().last_error.as_deref(),
        Some("Something went wrong")
    );
}

#[tokio::test]
async fn test_malformed_stream_discards_partial_tool_call() {
    let mut agent = make_agent(vec![Script::Parts(vec![
        tool_start("c1", "echo"),
        tool_args("c1", r#"{"text": "trunc"#),
        // No ToolCallEnd before StreamDone
        done(StopReason::ToolUse),
    ])]);

    let err = agent.prompt("malformed").await.unwrap_err();
    assert!(matches!(err, Error::MalformedStream(_)));

    // The partial call was never dispatched or committed
    assert_eq!(agent.messages().len(), 1);
}

#[tokio::test]
async fn test_provider_open_error_surfaces() {
    let mut agent = make_agent(vec![Script::OpenError(wren_ai::Error::api(
        "authentication_error",
        "Invalid API key",
    ))]);

    let err = agent.prompt("hello").await.unwrap_err();
    assert!(matches!(err, Error::Provider(_)));
    assert_eq!(agent.messages().len(), 1);
}

#[tokio::test]
async fn test_usage_accumulates_across_turns() {
    let mut agent = make_agent(vec![
        Script::Parts(vec![
            tool_start("c1", "echo"),
            tool_args("c1", r#"{"text": "x"}"#),
            tool_end("c1"),
            done_with_usage(StopReason::ToolUse, 10, 5),
        ]),
        Script::Parts(vec![text("done"), done_with_usage(StopReason::Stop, 20, 7)]),
    ]);
    let mut rx = agent.subscribe();

    agent.prompt("track usage").await.unwrap();

    let events = drain(&mut rx);
    let total = events
        .iter()
        .find_map(|e| match e {
            AgentEvent::AgentEnd { total_usage, .. } => Some(total_usage.clone()),
            _ => None,
        })
        .expect("agent end event");
    assert_eq!(total.input, 30);
    assert_eq!(total.output, 12);
    assert_eq!(agent.conversation().total_usage.input, 30);
}

#[tokio::test]
async fn test_stop_policy_halts_before_provider_call() {
    let config = AgentConfig {
        compaction: CompactionConfig {
            context_window: 100,
            buffer_tokens: 50,
            policy: OverflowPolicy::Stop,
            ..Default::default()
        },
        ..Default::default()
    };
    let mut agent = Agent::new(config, ScriptedProvider::new(vec![]));

    // ~500 estimated tokens against a budget of 50
    let big_prompt = "x".repeat(2000);
    let err = agent.prompt(&big_prompt).await.unwrap_err();

    assert!(matches!(err, Error::ContextOverflow { .. }));
    // Halted before calling the provider: prompt committed, nothing else
    assert_eq!(agent.messages().len(), 1);
}

#[tokio::test]
async fn test_continue_policy_compacts_then_proceeds() {
    let config = AgentConfig {
        compaction: CompactionConfig {
            context_window: 500,
            buffer_tokens: 50,
            keep_recent_turns: 1,
            summary_budget_tokens: 32,
            policy: OverflowPolicy::Continue,
        },
        ..Default::default()
    };
    let mut agent = Agent::new(
        config,
        ScriptedProvider::new(vec![Script::Parts(vec![
            text("compacted and answered"),
            done(StopReason::Stop),
        ])]),
    );

    // Seed four old rounds, ~100 tokens per message
    let mut seeded = Vec::new();
    for i in 0..4 {
        seeded.push(wren_ai::Message::user(format!("q{} {}", i, "a".repeat(400))));
        seeded.push(wren_ai::Message::Assistant {
            content: vec![wren_ai::Content::text(format!("r{} {}", i, "b".repeat(400)))],
            metadata: wren_ai::AssistantMetadata::default(),
        });
    }
    agent.set_messages(seeded);

    let mut rx = agent.subscribe();
    agent.prompt("next question").await.unwrap();

    let events = drain(&mut rx);
    let event_kinds = kinds(&events);
    assert!(event_kinds.contains(&"compaction_start"));
    assert!(event_kinds.contains(&"compaction_end"));

    // The head of the conversation is now a synthesized summary
    let head = agent.messages()[0].text();
    assert!(head.starts_with("<context-summary>"));
    assert_eq!(
        agent.messages().last().unwrap().text(),
        "compacted and answered"
    );
}
