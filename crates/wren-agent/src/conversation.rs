//! Conversation state: the message log and its accumulated usage.
//!
//! Owned exclusively by the agentic loop. Messages are appended at commit
//! points between turns; the single non-append mutation is compaction's
//! atomic prefix replacement.

use wren_ai::{Message, Usage};

/// Conversation state
#[derive(Default)]
pub struct Conversation {
    /// Ordered message log sent to the provider
    pub messages: Vec<Message>,
    /// Total usage across all turns
    pub total_usage: Usage,
    /// Last compaction summary, folded into the next one
    pub previous_summary: Option<String>,
    /// Last error surfaced by a cycle
    pub last_error: Option<String>,
}

impl Conversation {
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn push(&mut self, message: Message) {
        self.messages.push(message);
    }
}
