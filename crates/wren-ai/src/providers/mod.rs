//! Wire adapters
//!
//! One adapter per wire family, each translating its provider-specific
//! streaming response into the shared [`Part`](crate::part::Part) vocabulary.
//! Adapters hold no shared mutable state; selecting one is a configuration
//! decision made by the embedding application.

pub mod chat_completions;
pub mod messages;

use async_trait::async_trait;

use crate::error::Result;
use crate::part::PartStream;
use crate::types::GenerationRequest;

/// Capability to open a streaming generation call.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Adapter name, for logging
    fn name(&self) -> &str;

    /// Open a streaming call and return the normalized part sequence.
    ///
    /// The returned stream is finite and not restartable. A transport error
    /// mid-stream surfaces as a single `Part::StreamError` terminating the
    /// sequence; partial output already yielded is never retracted.
    async fn open(&self, request: &GenerationRequest) -> Result<PartStream>;
}

pub use chat_completions::ChatCompletionsProvider;
pub use messages::MessagesProvider;
