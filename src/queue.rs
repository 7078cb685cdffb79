//! At-least-once event queue with visibility timeouts.
//!
//! Semantics follow the managed queues the pipeline is normally fed from:
//!
//! * [`EventQueue::receive`] hands out visible messages and hides them for
//!   the visibility timeout.
//! * [`EventQueue::ack`] deletes a message. Only the receipt of the *latest*
//!   delivery is valid; a consumer that took too long holds a stale receipt.
//! * A message that is not acked before its timeout becomes visible again and
//!   is redelivered with `receive_count` incremented.
//!
//! [`MemoryQueue`] uses `tokio::time::Instant`, so tests can drive
//! redelivery deterministically with a paused clock.

use crate::error::PipelineError;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// One delivery of a queued message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueMessage {
    pub message_id: u64,
    /// Token that acknowledges this particular delivery.
    pub receipt: String,
    pub body: String,
    /// 1 on first delivery.
    pub receive_count: u32,
}

/// Buffer between the upload sink and the dispatcher.
#[async_trait]
pub trait EventQueue: Send + Sync {
    /// Enqueue a message body; returns its id.
    async fn send(&self, body: String) -> Result<u64, PipelineError>;

    /// Receive up to `max` visible messages.
    async fn receive(&self, max: usize) -> Result<Vec<QueueMessage>, PipelineError>;

    /// Delete the message delivered with `receipt`. Returns `false` when the
    /// receipt is stale or unknown.
    async fn ack(&self, receipt: &str) -> Result<bool, PipelineError>;

    /// Messages not yet acknowledged (visible or in flight).
    async fn pending(&self) -> Result<usize, PipelineError>;
}

#[derive(Debug)]
struct Entry {
    id: u64,
    body: String,
    receive_count: u32,
    receipt: Option<String>,
    invisible_until: Option<Instant>,
}

/// In-process queue.
#[derive(Debug)]
pub struct MemoryQueue {
    visibility_timeout: Duration,
    max_receives: Option<u32>,
    next_id: AtomicU64,
    entries: Mutex<VecDeque<Entry>>,
    dead_letters: Mutex<Vec<String>>,
}

impl MemoryQueue {
    pub fn new(visibility_timeout: Duration) -> Self {
        Self {
            visibility_timeout,
            max_receives: None,
            next_id: AtomicU64::new(1),
            entries: Mutex::new(VecDeque::new()),
            dead_letters: Mutex::new(Vec::new()),
        }
    }

    /// Move messages to the dead-letter list after `n` unacknowledged
    /// deliveries instead of redelivering forever.
    pub fn with_max_receives(mut self, n: u32) -> Self {
        self.max_receives = Some(n.max(1));
        self
    }

    pub fn visibility_timeout(&self) -> Duration {
        self.visibility_timeout
    }

    /// Bodies of messages that exceeded the receive limit.
    pub fn dead_letters(&self) -> Vec<String> {
        self.dead_letters
            .lock()
            .map(|d| d.clone())
            .unwrap_or_default()
    }

    fn entries(&self) -> Result<std::sync::MutexGuard<'_, VecDeque<Entry>>, PipelineError> {
        self.entries
            .lock()
            .map_err(|_| PipelineError::Queue("queue state poisoned".into()))
    }
}

#[async_trait]
impl EventQueue for MemoryQueue {
    async fn send(&self, body: String) -> Result<u64, PipelineError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        self.entries()?.push_back(Entry {
            id,
            body,
            receive_count: 0,
            receipt: None,
            invisible_until: None,
        });
        debug!("Queued message {}", id);
        Ok(id)
    }

    async fn receive(&self, max: usize) -> Result<Vec<QueueMessage>, PipelineError> {
        let now = Instant::now();
        let mut out = Vec::new();
        let mut expired = Vec::new();
        {
            let mut entries = self.entries()?;

            for entry in entries.iter_mut() {
                if out.len() >= max {
                    break;
                }
                if entry.invisible_until.is_some_and(|t| t > now) {
                    continue;
                }
                if let Some(limit) = self.max_receives {
                    if entry.receive_count >= limit {
                        expired.push(entry.id);
                        continue;
                    }
                }
                entry.receive_count += 1;
                let receipt = format!("{}-{}", entry.id, entry.receive_count);
                entry.receipt = Some(receipt.clone());
                entry.invisible_until = Some(now + self.visibility_timeout);
                if entry.receive_count > 1 {
                    debug!(
                        "Redelivering message {} (delivery {})",
                        entry.id, entry.receive_count
                    );
                }
                out.push(QueueMessage {
                    message_id: entry.id,
                    receipt,
                    body: entry.body.clone(),
                    receive_count: entry.receive_count,
                });
            }

            if !expired.is_empty() {
                let mut dead = self
                    .dead_letters
                    .lock()
                    .map_err(|_| PipelineError::Queue("dead-letter list poisoned".into()))?;
                entries.retain(|e| {
                    if expired.contains(&e.id) {
                        warn!(
                            "Message {} exceeded {} deliveries; dead-lettered",
                            e.id, e.receive_count
                        );
                        dead.push(e.body.clone());
                        false
                    } else {
                        true
                    }
                });
            }
        }
        Ok(out)
    }

    async fn ack(&self, receipt: &str) -> Result<bool, PipelineError> {
        let mut entries = self.entries()?;
        let before = entries.len();
        entries.retain(|e| e.receipt.as_deref() != Some(receipt));
        let removed = entries.len() < before;
        if !removed {
            debug!("Ack with stale or unknown receipt {}", receipt);
        }
        Ok(removed)
    }

    async fn pending(&self) -> Result<usize, PipelineError> {
        Ok(self.entries()?.len())
    }
}
