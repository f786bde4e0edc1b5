//! A cloneable handle for poking the agent from external code.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;
use wren_ai::Message;

/// Default bound on pending prompt submissions
pub const DEFAULT_QUEUE_CAPACITY: usize = 5;

/// A prompt submitted while a cycle was in flight
#[derive(Debug, Clone)]
pub struct QueuedPrompt {
    pub id: Uuid,
    pub message: Message,
    pub queued_at: i64,
}

/// Rejection reported synchronously to a submitter when the queue is at
/// capacity; the already-queued prompts are unaffected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("prompt queue full (capacity {capacity})")]
pub struct QueueFull {
    pub capacity: usize,
}

/// A cloneable handle for submitting prompts and cancelling work.
///
/// All fields are `Arc`-wrapped, so cloning is cheap.
#[derive(Clone)]
pub struct AgentHandle {
    pub(crate) cancel: Arc<Mutex<CancellationToken>>,
    prompts: Arc<Mutex<VecDeque<QueuedPrompt>>>,
    capacity: usize,
    idle_notify: Arc<tokio::sync::Notify>,
    is_running: Arc<AtomicBool>,
}

impl AgentHandle {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            cancel: Arc::new(Mutex::new(CancellationToken::new())),
            prompts: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
            idle_notify: Arc::new(tokio::sync::Notify::new()),
            is_running: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Submit a user prompt. Strict FIFO; rejects synchronously when the
    /// queue is at capacity.
    pub fn submit(&self, message: Message) -> Result<Uuid, QueueFull> {
        let mut queue = self.prompts.lock();
        if queue.len() >= self.capacity {
            return Err(QueueFull {
                capacity: self.capacity,
            });
        }
        let prompt = QueuedPrompt {
            id: Uuid::new_v4(),
            message,
            queued_at: chrono::Utc::now().timestamp_millis(),
        };
        let id = prompt.id;
        queue.push_back(prompt);
        Ok(id)
    }

    /// Number of prompts waiting
    pub fn queued(&self) -> usize {
        self.prompts.lock().len()
    }

    pub(crate) fn dequeue(&self) -> Option<QueuedPrompt> {
        self.prompts.lock().pop_front()
    }

    /// Abort the in-flight cycle: the provider stream is closed, running
    /// tools are signaled to stop, and the current turn seals as cancelled.
    pub fn abort(&self) {
        self.cancel.lock().cancel();
    }

    /// Token observed by every suspension point of the current cycle
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.lock().clone()
    }

    pub(crate) fn reset_cancel(&self) {
        *self.cancel.lock() = CancellationToken::new();
    }

    pub(crate) fn set_running(&self, running: bool) {
        self.is_running.store(running, Ordering::Release);
        if !running {
            self.idle_notify.notify_waiters();
        }
    }

    /// Whether the agent loop is currently running
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    /// Wait until the agent loop becomes idle
    pub async fn wait_for_idle(&self) {
        let notified = self.idle_notify.notified();
        if !self.is_running.load(Ordering::Acquire) {
            return;
        }
        notified.await;
    }

    /// Wait until idle with a timeout; returns `false` on timeout
    pub async fn wait_for_idle_timeout(&self, timeout: std::time::Duration) -> bool {
        if !self.is_running.load(Ordering::Acquire) {
            return true;
        }
        tokio::time::timeout(timeout, self.wait_for_idle())
            .await
            .is_ok()
    }
}
