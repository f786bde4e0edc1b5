//! Event fan-out to registered consumers

use tokio::sync::broadcast;

use crate::events::AgentEvent;

const DEFAULT_CAPACITY: usize = 256;

/// Publish/subscribe fan-out for agent events.
///
/// Producers call [`emit`](EventBus::emit); consumers (UI, session logging)
/// hold a receiver from [`subscribe`](EventBus::subscribe). Emission never
/// blocks; a consumer that falls more than the channel capacity behind loses
/// the oldest events, which `broadcast` reports on its receiver.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<AgentEvent>,
}

impl EventBus {
    /// Create a bus with the given per-subscriber buffer capacity
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event to all current subscribers
    pub fn emit(&self, event: AgentEvent) {
        // No subscribers is fine; the loop runs headless in tests
        let _ = self.tx.send(event);
    }

    /// Register a new consumer
    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}
