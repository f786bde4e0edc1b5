//! Context compaction for long conversations
//!
//! Before each provider call the loop asks this engine whether the
//! conversation still fits the token budget. When it does not, the oldest
//! contiguous run of messages is replaced with a single synthesized summary
//! message. The replacement is atomic: the new message list is built on the
//! side and swapped in whole, or the conversation is left untouched.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use wren_ai::{Content, Message};

use crate::conversation::Conversation;

/// Pluggable token estimator
pub trait TokenEstimator: Send + Sync {
    /// Estimate token count for a single message
    fn estimate_message(&self, message: &Message) -> u32;

    /// Estimate total tokens for a slice of messages
    fn estimate(&self, messages: &[Message]) -> u32 {
        messages.iter().map(|m| self.estimate_message(m)).sum()
    }
}

/// chars/4 heuristic; images count a flat 1200 tokens
pub struct HeuristicEstimator;

impl TokenEstimator for HeuristicEstimator {
    fn estimate_message(&self, message: &Message) -> u32 {
        let char_count: usize = message
            .content()
            .iter()
            .map(|c| match c {
                Content::Text { text } => text.len(),
                Content::Thinking { thinking } => thinking.len(),
                Content::ToolCall {
                    name, arguments, ..
                } => name.len() + serde_json::to_string(arguments).unwrap_or_default().len(),
                Content::Image { .. } => 4800, // ~1200 tokens * 4 chars/token
            })
            .sum();
        (char_count / 4) as u32
    }
}

/// What to do when the conversation exceeds its budget
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Compact history and keep going
    Continue,
    /// Halt before the provider call and surface the overflow
    Stop,
}

/// Reason for compaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactionReason {
    /// Pre-call estimate approaching the window limit
    Threshold,
    /// Provider reported a context overflow
    Overflow,
    /// Explicitly requested
    Manual,
}

/// Configuration for context compaction
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Model context window size in tokens
    pub context_window: u32,
    /// Headroom below the window that triggers compaction
    pub buffer_tokens: u32,
    /// Most recent assistant rounds never summarized away
    pub keep_recent_turns: usize,
    /// Token cap for a synthesized summary
    pub summary_budget_tokens: u32,
    /// Behavior when over budget
    pub policy: OverflowPolicy,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            context_window: 200_000,
            buffer_tokens: 20_000,
            keep_recent_turns: 2,
            summary_budget_tokens: 1024,
            policy: OverflowPolicy::Continue,
        }
    }
}

/// Computed before each provider call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionDecision {
    NoAction,
    Compact { target_tokens: u32 },
}

/// Result of a committed compaction
#[derive(Debug, Clone)]
pub struct CompactionOutcome {
    pub tokens_before: u32,
    pub tokens_after: u32,
    /// How many prefix replacements were needed to get under budget
    pub passes: u32,
}

/// Compaction failures
#[derive(Debug, Error)]
pub enum CompactionError {
    /// No compactable prefix remains but the estimate still exceeds budget
    #[error("context overflow unrecoverable: estimated {estimated} tokens against a budget of {budget}")]
    OverflowUnrecoverable { estimated: u32, budget: u32 },
}

/// Decides and performs history reduction
pub struct CompactionEngine {
    config: CompactionConfig,
    estimator: Box<dyn TokenEstimator>,
}

impl CompactionEngine {
    pub fn new(config: CompactionConfig) -> Self {
        Self::with_estimator(config, Box::new(HeuristicEstimator))
    }

    pub fn with_estimator(config: CompactionConfig, estimator: Box<dyn TokenEstimator>) -> Self {
        Self { config, estimator }
    }

    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    /// The usable budget: context window minus the reserved headroom
    pub fn budget(&self) -> u32 {
        self.config
            .context_window
            .saturating_sub(self.config.buffer_tokens)
    }

    /// Estimate the conversation as it would be sent to the provider
    pub fn estimate(&self, messages: &[Message]) -> u32 {
        self.estimator.estimate(messages)
    }

    /// Compute the pre-call decision. No side effects; a pass under budget
    /// leaves the conversation untouched.
    pub fn decide(&self, messages: &[Message]) -> CompactionDecision {
        let budget = self.budget();
        if self.estimator.estimate(messages) <= budget {
            CompactionDecision::NoAction
        } else {
            CompactionDecision::Compact {
                target_tokens: budget,
            }
        }
    }

    /// Replace history prefixes with synthesized summaries until the estimate
    /// fits the budget. Commits atomically; on failure the conversation is
    /// unchanged.
    pub fn compact(
        &self,
        conversation: &mut Conversation,
    ) -> Result<CompactionOutcome, CompactionError> {
        let budget = self.budget();
        let tokens_before = self.estimator.estimate(&conversation.messages);

        let mut messages = conversation.messages.clone();
        let mut summary = conversation.previous_summary.clone();
        let mut last_estimate = tokens_before;
        let mut passes = 0u32;

        loop {
            let estimate = self.estimator.estimate(&messages);
            if estimate <= budget {
                break;
            }
            // A pass that failed to shrink the estimate will never converge
            if passes > 0 && estimate >= last_estimate {
                return Err(CompactionError::OverflowUnrecoverable {
                    estimated: estimate,
                    budget,
                });
            }
            last_estimate = estimate;

            let Some(first_kept) = find_cut_point(&messages, self.config.keep_recent_turns)
            else {
                return Err(CompactionError::OverflowUnrecoverable {
                    estimated: estimate,
                    budget,
                });
            };

            let digest = build_digest(
                &messages[..first_kept],
                summary.as_deref(),
                self.config.summary_budget_tokens,
            );

            let mut next = Vec::with_capacity(messages.len() - first_kept + 1);
            next.push(Message::user(format!(
                "<context-summary>\n{}\n</context-summary>",
                digest
            )));
            next.extend_from_slice(&messages[first_kept..]);
            messages = next;
            summary = Some(digest);
            passes += 1;
        }

        let tokens_after = self.estimator.estimate(&messages);
        if passes > 0 {
            tracing::info!(
                "compacted conversation in {} pass(es): {} -> {} tokens",
                passes,
                tokens_before,
                tokens_after
            );
            conversation.messages = messages;
            conversation.previous_summary = summary;
        }

        Ok(CompactionOutcome {
            tokens_before,
            tokens_after,
            passes,
        })
    }
}

/// Find the first message to keep when compacting.
///
/// Walks backwards counting assistant rounds; everything older than the
/// most recent `keep_recent_turns` rounds is summarized. The cut then rolls
/// forward past tool results so a kept suffix never begins mid-round.
fn find_cut_point(messages: &[Message], keep_recent_turns: usize) -> Option<usize> {
    let mut rounds = 0usize;
    let mut boundary = None;
    for i in (0..messages.len()).rev() {
        if matches!(messages[i], Message::Assistant { .. }) {
            rounds += 1;
            if rounds > keep_recent_turns {
                boundary = Some(i);
                break;
            }
        }
    }

    let mut first_kept = boundary? + 1;
    while first_kept < messages.len()
        && matches!(messages[first_kept], Message::ToolResult { .. })
    {
        first_kept += 1;
    }

    // Nothing gained from replacing fewer than two messages
    if first_kept < 2 || first_kept >= messages.len() {
        return None;
    }
    Some(first_kept)
}

// --- Summary synthesis ---

/// Tool names that perform read-only file operations.
const READ_TOOLS: &[&str] = &["read", "glob", "grep", "list", "find"];
/// Tool names that perform file modifications.
const WRITE_TOOLS: &[&str] = &["write", "edit"];

const TOOL_RESULT_EXCERPT_CHARS: usize = 600;

/// Synthesize a summary of the given prefix: a role-labelled transcript
/// digest plus file-operation lists, folded together with any previous
/// summary and capped at `budget_tokens`.
fn build_digest(messages: &[Message], previous: Option<&str>, budget_tokens: u32) -> String {
    let mut out = String::new();

    if let Some(previous) = previous {
        out.push_str("## Earlier context\n");
        out.push_str(previous);
        out.push_str("\n\n");
    }

    out.push_str("## Conversation so far\n");
    out.push_str(&serialize_messages(messages));

    let (read_files, modified_files) = extract_file_operations(messages);
    if !read_files.is_empty() {
        out.push_str("\nFiles read: ");
        out.push_str(&read_files.join(", "));
    }
    if !modified_files.is_empty() {
        out.push_str("\nFiles modified: ");
        out.push_str(&modified_files.join(", "));
    }

    truncate_chars(&mut out, budget_tokens as usize * 4);
    out
}

/// Serialize messages to labelled plain text, one line per message role.
fn serialize_messages(messages: &[Message]) -> String {
    let mut out = String::new();

    for msg in messages {
        match msg {
            Message::User { content, .. } => {
                let text = content_to_text(content);
                if !text.is_empty() {
                    out.push_str("[User]: ");
                    out.push_str(&text);
                    out.push('\n');
                }
            }
            Message::Assistant { content, .. } => {
                let mut text_parts = Vec::new();
                let mut tool_calls = Vec::new();

                for c in content {
                    match c {
                        Content::Text { text } => text_parts.push(text.as_str()),
                        Content::ToolCall {
                            name, arguments, ..
                        } => {
                            tool_calls.push(format!("{}({})", name, format_tool_args(arguments)));
                        }
                        // Thinking is never fed back through summaries
                        _ => {}
                    }
                }

                if !text_parts.is_empty() {
                    out.push_str("[Assistant]: ");
                    out.push_str(&text_parts.join(""));
                    out.push('\n');
                }
                if !tool_calls.is_empty() {
                    out.push_str("[Assistant tool calls]: ");
                    out.push_str(&tool_calls.join("; "));
                    out.push('\n');
                }
            }
            Message::ToolResult {
                tool_name,
                content,
                is_error,
                ..
            } => {
                let text = content_to_text(content);
                if *is_error {
                    out.push_str(&format!("[Tool error ({})]: ", tool_name));
                } else {
                    out.push_str(&format!("[Tool result ({})]: ", tool_name));
                }
                let mut excerpt = text;
                truncate_chars(&mut excerpt, TOOL_RESULT_EXCERPT_CHARS);
                out.push_str(&excerpt);
                out.push('\n');
            }
        }
    }

    out
}

fn content_to_text(content: &[Content]) -> String {
    content
        .iter()
        .filter_map(|c| match c {
            Content::Text { text } => Some(text.as_str()),
            Content::Image { .. } => Some("[image]"),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("")
}

fn format_tool_args(args: &serde_json::Value) -> String {
    match args {
        serde_json::Value::Object(map) => map
            .iter()
            .map(|(k, v)| {
                let mut val = match v {
                    serde_json::Value::String(s) => format!("\"{}\"", s),
                    other => other.to_string(),
                };
                truncate_chars(&mut val, 100);
                format!("{}={}", k, val)
            })
            .collect::<Vec<_>>()
            .join(", "),
        _ => args.to_string(),
    }
}

/// Extract file paths touched by tool calls in the given messages.
fn extract_file_operations(messages: &[Message]) -> (Vec<String>, Vec<String>) {
    let mut read_files = Vec::new();
    let mut modified_files = Vec::new();

    for msg in messages {
        for (_, name, arguments) in msg.tool_calls() {
            let path = arguments
                .get("path")
                .or_else(|| arguments.get("file_path"))
                .and_then(|v| v.as_str());
            let Some(path) = path else { continue };

            if READ_TOOLS.contains(&name) {
                if !read_files.iter().any(|p| p == path) {
                    read_files.push(path.to_string());
                }
            } else if WRITE_TOOLS.contains(&name) {
                if !modified_files.iter().any(|p| p == path) {
                    modified_files.push(path.to_string());
                }
            }
        }
    }

    (read_files, modified_files)
}

/// Truncate on a char boundary, appending a marker when anything was cut.
fn truncate_chars(s: &mut String, max_chars: usize) {
    if s.chars().count() <= max_chars {
        return;
    }
    let keep: String = s.chars().take(max_chars).collect();
    *s = keep;
    s.push_str("...(truncated)");
}

// --- Overflow error classification ---

/// Compiled patterns for detecting context-overflow errors across providers.
static OVERFLOW_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"(?i)context.?length.?exceed",
        r"(?i)maximum.?context.?length",
        r"(?i)context.?window.?(exceed|full|limit)",
        r"(?i)too.?many.?tokens",
        r"(?i)prompt.?is.?too.?long",
        r"(?i)prompt.?too.?long",
        r"(?i)input.?too.?long",
        r"(?i)token.?limit.?(exceed|reach)",
        r"(?i)content.?too.?large",
        r"(?i)request.?too.?large",
        r"(?i)messages?.?too.?long",
        r"(?i)reduce.?the.?length",
        r"(?i)context_length_exceeded",
        r"(?i)exceeds?.+token.?limit",
        r"(?i)input.?token.?limit",
        r"(?i)context.?overflow",
        r"(?i)sequence.?too.?long",
        r"\b413\b",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// Check if a provider error message indicates a context overflow
pub fn is_overflow_error(message: &str) -> bool {
    OVERFLOW_PATTERNS.iter().any(|re| re.is_match(message))
}
